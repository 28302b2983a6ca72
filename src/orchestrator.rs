//! Restore orchestration: sequencing, confirmation gates, and the summary.
//!
//! The interactive prompt itself lives in the CLI shell; the orchestrator
//! only defines the [`Confirmer`] capability and the rule that cancellation
//! is honored strictly before the apply phase. `--yes` silences the plan
//! and overwrite gates but can never cross the at-rest key mismatch gate;
//! only the explicit force flag does that.

use crate::apply::{self, ApplySettings};
use crate::bundle::{Asset, BackupBundle};
use crate::config_loader::MxConfig;
use crate::errors::{RestoreError, RestoreResult};
use crate::extract::{extract_scope, list_scopes};
use crate::files::{restore_file_tree, CommandService};
use crate::lock::{PidProbe, ScopeLock};
use crate::scope::Scope;
use crate::secrets::{
    compare_crypt_keys, load_signing_key, restore_crypt_keys, restore_signing_key,
    KeyComparison, KvRunner,
};
use crate::sql::{SqlEndpoint, SqlRunner};
use crate::stager::StagedInstance;
use std::path::{Path, PathBuf};

/// Capability to ask the operator for consent. The wording and medium of
/// the prompts belong to the shell, not to this crate's core.
pub trait Confirmer {
    /// Plain yes/no gate.
    fn confirm(&self, prompt: &str) -> bool;
    /// Stronger gate: the operator must type `expected` literally.
    fn confirm_typed(&self, prompt: &str, expected: &str) -> bool;
}

#[derive(Debug, Clone)]
pub struct RestoreRequest {
    pub scope: Scope,
    pub bundle_path: PathBuf,
    pub overwrite: bool,
    pub assume_yes: bool,
    pub force_key_restore: bool,
    pub dry_run: bool,
}

#[derive(Debug)]
pub struct RestoreSummary {
    pub scope: String,
    pub statements: usize,
    pub snapshot: Option<PathBuf>,
    pub files_restored: usize,
    pub warnings: Vec<String>,
    pub dry_run: bool,
}

impl RestoreSummary {
    pub fn render(&self) -> String {
        let mut out = String::new();
        if self.dry_run {
            out.push_str(&format!(
                "Dry run complete for '{}': {} statements would be applied.\n",
                self.scope, self.statements
            ));
        } else {
            out.push_str(&format!(
                "Restore of '{}' complete: {} statements applied, {} files restored.\n",
                self.scope, self.statements, self.files_restored
            ));
        }
        if let Some(snapshot) = &self.snapshot {
            out.push_str(&format!("Pre-restore snapshot: {}\n", snapshot.display()));
        }
        if !self.warnings.is_empty() {
            out.push_str("Warnings:\n");
            for warning in &self.warnings {
                out.push_str(&format!("  - {warning}\n"));
            }
        }
        out
    }
}

fn live_sql(cfg: &MxConfig, database: &str) -> SqlRunner {
    let endpoint = match &cfg.live.socket {
        Some(socket) => SqlEndpoint::Socket {
            path: PathBuf::from(socket),
        },
        None => SqlEndpoint::Net {
            host: cfg.live.host.clone(),
            port: cfg.live.port,
            user: cfg.live.user.clone(),
            password: cfg.live.password.clone(),
        },
    };
    SqlRunner::new(&cfg.tools.client_bin, endpoint, Some(database))
}

/// Run a full scoped restore. Holds the scope lock for the whole
/// invocation; every ephemeral resource is released on all exit paths
/// through guard Drops.
pub fn run_restore(
    cfg: &MxConfig,
    req: &RestoreRequest,
    confirmer: &dyn Confirmer,
) -> RestoreResult<RestoreSummary> {
    let _lock = ScopeLock::acquire(Path::new(&cfg.paths.lock_dir), &req.scope, &PidProbe)?;

    let bundle = BackupBundle::open(&req.bundle_path)?;
    println!(
        "Backup bundle: {} (database '{}')",
        bundle.root().display(),
        bundle.manifest.database
    );

    println!("Staging backup snapshot into an isolated read-only instance...");
    let staged = StagedInstance::stage(cfg, &bundle)?;
    let sql_staged = staged.sql();

    let plan = match extract_scope(&sql_staged, &req.scope)? {
        Some(plan) => plan,
        None => {
            let listing = list_scopes(&sql_staged)?;
            return Err(RestoreError::ScopeNotFound {
                scope: req.scope.to_string(),
                available: listing.format(),
            });
        }
    };
    print!("{}", plan.summary());

    let mut warnings: Vec<String> = Vec::new();

    // Read-only comparison of at-rest key material, before any gate, so the
    // operator sees the full picture up front.
    let crypt_cmp = compare_crypt_keys(&bundle, Path::new(&cfg.paths.crypt_key_dir))?;
    let signing_key = load_signing_key(&bundle, req.scope.domain())?;

    if req.dry_run {
        if let Some(KeyComparison::Mismatch { .. }) = &crypt_cmp {
            warnings.push("at-rest encryption keys differ (dry run: not restored)".to_string());
        }
        if signing_key.is_some() {
            println!(
                "Signing key for '{}' present in backup (dry run: not restored).",
                req.scope.domain()
            );
        }
        return Ok(RestoreSummary {
            scope: req.scope.to_string(),
            statements: plan.statements.len(),
            snapshot: None,
            files_restored: 0,
            warnings,
            dry_run: true,
        });
    }

    // Extraction is done; the staged instance has served its purpose.
    drop(sql_staged);
    drop(staged);

    // Gate 1: plan confirmation. Cancellation is still possible here.
    if !req.assume_yes
        && !confirmer.confirm(&format!(
            "Proceed with restoring '{}' into the live system?",
            req.scope
        ))
    {
        return Err(RestoreError::Cancelled);
    }

    // Secret reconciliation.
    match signing_key {
        None => tracing::debug!(domain = %req.scope.domain(), "no signing key in bundle"),
        Some(key) => {
            let kv = KvRunner::new(&cfg.tools.kv_client_bin);
            match restore_signing_key(&kv, req.scope.domain(), &key) {
                Ok(()) => println!(
                    "Signing key for '{}' restored (selector '{}').",
                    req.scope.domain(),
                    key.selector
                ),
                Err(e) => warnings.push(format!("signing key restore failed: {e}")),
            }
        }
    }

    match crypt_cmp {
        None => {}
        Some(KeyComparison::Match) => {
            println!("At-rest encryption keys match; live keys left untouched.");
        }
        Some(KeyComparison::BackupUnreadable(msg)) => {
            warnings.push(format!("cannot compare at-rest keys (backup side): {msg}"));
        }
        Some(KeyComparison::LiveUnreadable(msg)) => {
            warnings.push(format!("cannot compare at-rest keys (live side): {msg}"));
        }
        Some(KeyComparison::Mismatch {
            backup_fingerprint,
            live_fingerprint,
        }) => {
            println!("At-rest encryption keys DIFFER:");
            println!("  backup: {backup_fingerprint}");
            println!("  live:   {live_fingerprint}");
            let confirmed = req.force_key_restore
                || (!req.assume_yes
                    && confirmer.confirm(
                        "The backup's at-rest encryption key differs from the live key. \
                         Restore the backup's key?",
                    )
                    && confirmer.confirm_typed(
                        "Overwriting the live key makes mail encrypted with it unreadable \
                         unless you keep the backup that is about to be written. \
                         Type 'RESTORE KEYS' to continue",
                        "RESTORE KEYS",
                    ));
            if !confirmed {
                return Err(RestoreError::SecretMismatch);
            }
            let result = restore_crypt_keys(
                &bundle,
                Path::new(&cfg.paths.crypt_key_dir),
                Path::new(&cfg.paths.snapshot_dir),
            )?;
            if let Some(dir) = &result.backed_up_to {
                println!("Previous key pair backed up to {}", dir.display());
            }
            if !result.verified {
                warnings.push(
                    "at-rest key read-back verification failed; inspect the key \
                     directory manually"
                        .to_string(),
                );
            }
        }
    }

    // Gate 2: overwrite confirmation, typed. After this point the apply
    // runs to completion or hard failure; there is no operator abort.
    let sql_live = live_sql(cfg, &bundle.manifest.database);
    let exists = apply::primary_exists(&sql_live, &req.scope)?;
    if exists && !req.overwrite {
        return Err(RestoreError::AlreadyExists {
            scope: req.scope.to_string(),
        });
    }
    if exists && !req.assume_yes {
        let literal = req.scope.to_string();
        if !confirmer.confirm_typed(
            &format!("'{literal}' exists live and will be overwritten. Type the scope to continue"),
            &literal,
        ) {
            return Err(RestoreError::Cancelled);
        }
    }

    println!("Applying {} statements to the live store...", plan.statements.len());
    let outcome = apply::apply_plan(
        &sql_live,
        &plan,
        &ApplySettings {
            overwrite: req.overwrite,
            snapshot_dir: Path::new(&cfg.paths.snapshot_dir),
            client_bin: &cfg.tools.client_bin,
            database: &bundle.manifest.database,
        },
    )?;
    warnings.extend(outcome.warnings);

    println!("Restoring mail files...");
    let service = CommandService::from_config(cfg);
    let files_restored =
        match restore_file_tree(&bundle, &req.scope, cfg, &service, &plan.mailboxes)? {
            Some(report) => {
                warnings.extend(report.warnings);
                report.files_restored
            }
            None => {
                println!("Bundle carries no mail file tree; skipped.");
                0
            }
        };

    Ok(RestoreSummary {
        scope: req.scope.to_string(),
        statements: plan.statements.len(),
        snapshot: outcome.snapshot,
        files_restored,
        warnings,
        dry_run: false,
    })
}

/// Stage the bundle read-only and report what it contains.
pub fn run_inspect(cfg: &MxConfig, bundle_path: &Path) -> RestoreResult<()> {
    let bundle = BackupBundle::open(bundle_path)?;
    println!(
        "Backup bundle: {} (database '{}')",
        bundle.root().display(),
        bundle.manifest.database
    );
    if let Some(created) = &bundle.manifest.created_at {
        println!("Created: {created}");
    }
    for asset in [
        Asset::Database,
        Asset::KeyValue,
        Asset::Secrets,
        Asset::MailData,
    ] {
        match bundle.resolve(asset) {
            Some(resolved) => println!(
                "  {:<20} present ({})",
                asset.label(),
                resolved
                    .path
                    .file_name()
                    .map(|n| n.to_string_lossy().into_owned())
                    .unwrap_or_default()
            ),
            None => println!("  {:<20} absent", asset.label()),
        }
    }

    println!("Staging backup snapshot into an isolated read-only instance...");
    let staged = StagedInstance::stage(cfg, &bundle)?;
    let listing = list_scopes(&staged.sql())?;
    println!("Domains in this backup:");
    println!("{}", listing.format());
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn summary_renders_warnings_and_snapshot() {
        let summary = RestoreSummary {
            scope: "a@x.com".into(),
            statements: 12,
            snapshot: Some(PathBuf::from("/var/backups/snap.sql")),
            files_restored: 40,
            warnings: vec!["fixup 'x' failed".into()],
            dry_run: false,
        };
        let rendered = summary.render();
        assert!(rendered.contains("12 statements applied"));
        assert!(rendered.contains("/var/backups/snap.sql"));
        assert!(rendered.contains("fixup 'x' failed"));

        let dry = RestoreSummary {
            dry_run: true,
            ..summary
        };
        assert!(dry.render().contains("Dry run"));
    }
}
