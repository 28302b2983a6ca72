//! Bulk mail file-tree restoration, narrowly scoped by path prefix.
//!
//! The mail storage service is stopped only for the extraction window (the
//! database phases are unaffected) and restarted if it was running before.
//! Archive creation tools disagree about leading `/` and `./` on entry
//! names, so each entry is matched against every convention, leading-slash
//! first. A missing scope directory after extraction is a warning, never an
//! error: the database restore has already committed and must not be undone
//! because of it.

use crate::bundle::{Asset, BackupBundle};
use crate::config_loader::MxConfig;
use crate::errors::{RestoreError, RestoreResult};
use crate::scope::Scope;
use std::fs;
use std::path::Path;
use std::process::Command;

/// Top-level directory inside the mail file-tree archive.
pub const ARCHIVE_ROOT: &str = "vmail";

/// Capability to bracket the dependent mail storage service.
pub trait ServiceController {
    fn is_running(&self) -> bool;
    fn stop(&self) -> RestoreResult<()>;
    fn start(&self) -> RestoreResult<()>;
}

/// Configured-command-backed service control.
pub struct CommandService {
    status: Vec<String>,
    stop: Vec<String>,
    start: Vec<String>,
}

impl CommandService {
    pub fn from_config(cfg: &MxConfig) -> Self {
        Self {
            status: cfg.tools.service_status.clone(),
            stop: cfg.tools.service_stop.clone(),
            start: cfg.tools.service_start.clone(),
        }
    }

    fn run(cmd: &[String]) -> RestoreResult<std::process::Output> {
        let (bin, args) = cmd.split_first().ok_or_else(|| {
            RestoreError::config("service control command is empty")
        })?;
        Command::new(bin)
            .args(args)
            .output()
            .map_err(|e| RestoreError::io(format!("running {bin}"), e))
    }
}

impl ServiceController for CommandService {
    fn is_running(&self) -> bool {
        Self::run(&self.status)
            .map(|out| out.status.success())
            .unwrap_or(false)
    }

    fn stop(&self) -> RestoreResult<()> {
        let out = Self::run(&self.stop)?;
        if !out.status.success() {
            return Err(RestoreError::staging(format!(
                "could not stop mail storage service:\n{}",
                String::from_utf8_lossy(&out.stderr)
            )));
        }
        Ok(())
    }

    fn start(&self) -> RestoreResult<()> {
        let out = Self::run(&self.start)?;
        if !out.status.success() {
            return Err(RestoreError::staging(format!(
                "could not start mail storage service:\n{}",
                String::from_utf8_lossy(&out.stderr)
            )));
        }
        Ok(())
    }
}

#[derive(Debug, Default)]
pub struct FileRestoreReport {
    pub files_restored: usize,
    /// Which path convention the archive turned out to use.
    pub matched_convention: Option<String>,
    pub warnings: Vec<String>,
}

/// Entry-name conventions to try for a scope, leading-slash first.
pub fn candidate_prefixes(scope: &Scope) -> Vec<String> {
    let rel = format!("{ARCHIVE_ROOT}/{}", scope.maildir_prefix());
    vec![format!("/{rel}"), rel.clone(), format!("./{rel}")]
}

/// Match an archive entry name against the candidate conventions, returning
/// the convention index and the path relative to the scope directory.
pub fn match_scope_path(name: &str, prefixes: &[String]) -> Option<(usize, String)> {
    for (idx, prefix) in prefixes.iter().enumerate() {
        if let Some(rest) = name.strip_prefix(prefix.as_str()) {
            return Some((idx, rest.to_string()));
        }
    }
    None
}

/// Restore the scope's subtree from the bundle's mail file-tree archive.
/// `None` means the bundle carries no such archive (soft skip).
pub fn restore_file_tree(
    bundle: &BackupBundle,
    scope: &Scope,
    cfg: &MxConfig,
    service: &dyn ServiceController,
    mailboxes: &[String],
) -> RestoreResult<Option<FileRestoreReport>> {
    let Some(asset) = bundle.resolve(Asset::MailData) else {
        tracing::debug!("bundle carries no mail file tree, skipping");
        return Ok(None);
    };

    let mut report = FileRestoreReport::default();
    let mail_root = Path::new(&cfg.paths.mail_data_dir);

    let was_running = service.is_running();
    if was_running {
        service.stop()?;
    }
    let extracted = extract_scope_tree(bundle, &asset, scope, mail_root, &mut report);
    if was_running {
        if let Err(e) = service.start() {
            report
                .warnings
                .push(format!("failed to restart mail storage service: {e}"));
        }
    }
    extracted?;

    let scope_dir = mail_root.join(scope.maildir_prefix());
    if !scope_dir.is_dir() {
        report.warnings.push(format!(
            "expected mail directory {} is missing after extraction; \
             the database restore is already committed and stands",
            scope_dir.display()
        ));
        return Ok(Some(report));
    }

    fix_ownership(&scope_dir, &cfg.tools.mail_owner, &mut report);
    trigger_resync(&cfg.tools.doveadm_bin, mailboxes, &mut report);

    Ok(Some(report))
}

fn extract_scope_tree(
    bundle: &BackupBundle,
    asset: &crate::bundle::ResolvedAsset,
    scope: &Scope,
    mail_root: &Path,
    report: &mut FileRestoreReport,
) -> RestoreResult<()> {
    let prefixes = candidate_prefixes(scope);
    let scope_base = mail_root.join(scope.maildir_prefix());

    let reader = bundle.reader(asset)?;
    let mut archive = tar::Archive::new(reader);
    for entry in archive.entries()? {
        let mut entry = entry?;
        let name = entry.path()?.to_string_lossy().into_owned();
        let Some((idx, rest)) = match_scope_path(&name, &prefixes) else {
            continue;
        };
        if rest.split('/').any(|part| part == "..") {
            tracing::warn!(entry = %name, "skipping archive entry escaping the scope directory");
            continue;
        }
        if report.matched_convention.is_none() {
            report.matched_convention = Some(prefixes[idx].clone());
        }

        let dest = scope_base.join(&rest);
        if let Some(parent) = dest.parent() {
            fs::create_dir_all(parent)
                .map_err(|e| RestoreError::io("creating mail directory", e))?;
        }
        entry
            .unpack(&dest)
            .map_err(|e| RestoreError::io(format!("extracting {name}"), e))?;
        report.files_restored += 1;
    }
    Ok(())
}

/// Ownership fixup, scoped strictly to the restored subtree.
fn fix_ownership(scope_dir: &Path, owner: &str, report: &mut FileRestoreReport) {
    match Command::new("chown")
        .arg("-R")
        .arg(owner)
        .arg(scope_dir)
        .output()
    {
        Ok(out) if out.status.success() => {}
        Ok(out) => report.warnings.push(format!(
            "ownership fixup on {} failed: {}",
            scope_dir.display(),
            String::from_utf8_lossy(&out.stderr).trim()
        )),
        Err(e) => report
            .warnings
            .push(format!("ownership fixup on {} failed: {e}", scope_dir.display())),
    }
}

/// Index resync and quota recalculation, fire-and-forget: safe to re-run
/// manually, so failures are only logged.
fn trigger_resync(doveadm_bin: &str, mailboxes: &[String], report: &mut FileRestoreReport) {
    for user in mailboxes {
        for args in [
            vec!["force-resync", "-u", user.as_str(), "*"],
            vec!["quota", "recalc", "-u", user.as_str()],
        ] {
            match Command::new(doveadm_bin).args(&args).output() {
                Ok(out) if out.status.success() => {}
                Ok(out) => {
                    tracing::warn!(user = %user, "doveadm {} failed: {}", args[0],
                        String::from_utf8_lossy(&out.stderr).trim());
                    report
                        .warnings
                        .push(format!("doveadm {} for {user} failed", args.join(" ")));
                }
                Err(e) => {
                    tracing::warn!(user = %user, error = %e, "doveadm not runnable");
                    report
                        .warnings
                        .push(format!("doveadm {} for {user} failed: {e}", args.join(" ")));
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use flate2::write::GzEncoder;
    use flate2::Compression;
    use std::cell::RefCell;
    use std::fs::File;
    use tempfile::tempdir;

    struct FakeService {
        running: bool,
        calls: RefCell<Vec<&'static str>>,
    }

    impl ServiceController for FakeService {
        fn is_running(&self) -> bool {
            self.running
        }
        fn stop(&self) -> RestoreResult<()> {
            self.calls.borrow_mut().push("stop");
            Ok(())
        }
        fn start(&self) -> RestoreResult<()> {
            self.calls.borrow_mut().push("start");
            Ok(())
        }
    }

    fn make_bundle(dir: &Path, entry_prefix: &str) -> BackupBundle {
        fs::write(dir.join("manifest.json"), r#"{ "database": "mailserver" }"#).unwrap();
        let file = File::create(dir.join("vmail.tar.gz")).unwrap();
        let mut builder = tar::Builder::new(GzEncoder::new(file, Compression::default()));
        for (name, content) in [
            (format!("{entry_prefix}vmail/x.com/a/cur/msg1"), "mail one"),
            (format!("{entry_prefix}vmail/x.com/a/cur/msg2"), "mail two"),
            (format!("{entry_prefix}vmail/x.com/b/cur/msg3"), "other box"),
            (format!("{entry_prefix}vmail/y.org/c/cur/msg4"), "other domain"),
        ] {
            // Write the name into the raw header so `./`-style prefixes
            // survive exactly as archive tools emit them.
            let mut header = tar::Header::new_gnu();
            header.set_size(content.len() as u64);
            header.set_mode(0o600);
            header.set_entry_type(tar::EntryType::Regular);
            {
                let gnu = header.as_gnu_mut().unwrap();
                gnu.name[..name.len()].copy_from_slice(name.as_bytes());
            }
            header.set_cksum();
            builder.append(&header, content.as_bytes()).unwrap();
        }
        builder.into_inner().unwrap().finish().unwrap();
        BackupBundle::open(dir).unwrap()
    }

    fn config_for(dir: &Path) -> MxConfig {
        let mut cfg = MxConfig::default();
        cfg.paths.mail_data_dir = dir.join("mail").display().to_string();
        cfg
    }

    #[test]
    fn prefix_conventions_try_leading_slash_first() {
        let scope = Scope::parse("a@x.com").unwrap();
        let prefixes = candidate_prefixes(&scope);
        assert_eq!(
            prefixes,
            vec![
                "/vmail/x.com/a/".to_string(),
                "vmail/x.com/a/".to_string(),
                "./vmail/x.com/a/".to_string(),
            ]
        );
    }

    #[test]
    fn bare_entry_names_fall_back_past_the_leading_slash_pattern() {
        let scope = Scope::parse("a@x.com").unwrap();
        let prefixes = candidate_prefixes(&scope);

        // The leading-slash convention matches nothing for this entry; the
        // bare convention picks it up.
        let (idx, rest) = match_scope_path("vmail/x.com/a/cur/m1", &prefixes).unwrap();
        assert_eq!(idx, 1);
        assert_eq!(rest, "cur/m1");

        let (idx, _) = match_scope_path("/vmail/x.com/a/cur/m1", &prefixes).unwrap();
        assert_eq!(idx, 0);
        assert!(match_scope_path("vmail/y.org/c/cur/m", &prefixes).is_none());
    }

    #[test]
    fn restores_only_the_scope_subtree() {
        let dir = tempdir().unwrap();
        let bundle = make_bundle(dir.path(), "");
        let cfg = config_for(dir.path());
        let scope = Scope::parse("a@x.com").unwrap();
        let service = FakeService {
            running: false,
            calls: RefCell::new(Vec::new()),
        };

        let report = restore_file_tree(&bundle, &scope, &cfg, &service, &[])
            .unwrap()
            .unwrap();
        assert_eq!(report.files_restored, 2);
        assert_eq!(report.matched_convention.as_deref(), Some("vmail/x.com/a/"));

        let mail = Path::new(&cfg.paths.mail_data_dir);
        assert!(mail.join("x.com/a/cur/msg1").is_file());
        assert!(mail.join("x.com/a/cur/msg2").is_file());
        assert!(!mail.join("x.com/b").exists());
        assert!(!mail.join("y.org").exists());
        // Service was not running, so it is never touched.
        assert!(service.calls.borrow().is_empty());
    }

    #[test]
    fn dot_slash_archives_are_handled() {
        let dir = tempdir().unwrap();
        let bundle = make_bundle(dir.path(), "./");
        let cfg = config_for(dir.path());
        let scope = Scope::parse("a@x.com").unwrap();
        let service = FakeService {
            running: false,
            calls: RefCell::new(Vec::new()),
        };

        let report = restore_file_tree(&bundle, &scope, &cfg, &service, &[])
            .unwrap()
            .unwrap();
        assert_eq!(report.files_restored, 2);
        assert!(report
            .matched_convention
            .as_deref()
            .unwrap()
            .ends_with("vmail/x.com/a/"));
        let mail = Path::new(&cfg.paths.mail_data_dir);
        assert!(mail.join("x.com/a/cur/msg1").is_file());
    }

    #[test]
    fn running_service_is_stopped_and_restarted_around_extraction() {
        let dir = tempdir().unwrap();
        let bundle = make_bundle(dir.path(), "");
        let cfg = config_for(dir.path());
        let scope = Scope::parse("a@x.com").unwrap();
        let service = FakeService {
            running: true,
            calls: RefCell::new(Vec::new()),
        };

        restore_file_tree(&bundle, &scope, &cfg, &service, &[]).unwrap();
        assert_eq!(*service.calls.borrow(), vec!["stop", "start"]);
    }

    #[test]
    fn missing_scope_directory_is_a_warning_not_an_error() {
        let dir = tempdir().unwrap();
        let bundle = make_bundle(dir.path(), "");
        let cfg = config_for(dir.path());
        // No entries for this scope exist in the archive.
        let scope = Scope::parse("nobody@x.com").unwrap();
        let service = FakeService {
            running: false,
            calls: RefCell::new(Vec::new()),
        };

        let report = restore_file_tree(&bundle, &scope, &cfg, &service, &[])
            .unwrap()
            .unwrap();
        assert_eq!(report.files_restored, 0);
        assert!(report.warnings.iter().any(|w| w.contains("already committed")));
    }

    #[test]
    fn absent_archive_is_a_soft_skip() {
        let dir = tempdir().unwrap();
        fs::write(dir.path().join("manifest.json"), r#"{ "database": "m" }"#).unwrap();
        let bundle = BackupBundle::open(dir.path()).unwrap();
        let cfg = config_for(dir.path());
        let scope = Scope::parse("a@x.com").unwrap();
        let service = FakeService {
            running: false,
            calls: RefCell::new(Vec::new()),
        };

        assert!(restore_file_tree(&bundle, &scope, &cfg, &service, &[])
            .unwrap()
            .is_none());
    }
}
