//! End-to-end exercise of the restore pipeline against an on-disk bundle,
//! with the store behind a fake client so no live server is needed.

use flate2::write::GzEncoder;
use flate2::Compression;
use mxrestore::apply;
use mxrestore::bundle::{Asset, BackupBundle};
use mxrestore::config_loader::MxConfig;
use mxrestore::errors::RestoreResult;
use mxrestore::extract::{extract_scope, list_scopes};
use mxrestore::files::{restore_file_tree, ServiceController};
use mxrestore::lock::{ProcessProbe, ScopeLock};
use mxrestore::scope::Scope;
use mxrestore::secrets::load_signing_key;
use mxrestore::sql::{Row, SqlExec};
use std::fs;
use std::fs::File;
use std::path::Path;

fn row(fields: &[&str]) -> Row {
    fields.iter().map(|f| Some(f.to_string())).collect()
}

/// Substring-matched canned store: good enough to drive the extractor.
struct FakeStore {
    responses: Vec<(&'static str, Vec<Row>)>,
}

impl SqlExec for FakeStore {
    fn query(&self, sql: &str) -> RestoreResult<Vec<Row>> {
        for (needle, rows) in &self.responses {
            if sql.contains(needle) {
                return Ok(rows.clone());
            }
        }
        Ok(Vec::new())
    }

    fn exec_script(&self, _script: &str) -> RestoreResult<()> {
        Ok(())
    }
}

struct IdleService;

impl ServiceController for IdleService {
    fn is_running(&self) -> bool {
        false
    }
    fn stop(&self) -> RestoreResult<()> {
        Ok(())
    }
    fn start(&self) -> RestoreResult<()> {
        Ok(())
    }
}

struct DeadProbe;

impl ProcessProbe for DeadProbe {
    fn is_alive(&self, _pid: i32) -> bool {
        false
    }
}

fn build_bundle(root: &Path) -> BackupBundle {
    fs::write(
        root.join("manifest.json"),
        r#"{ "database": "mailserver", "created_at": "2026-08-01T02:00:00Z" }"#,
    )
    .unwrap();
    fs::create_dir(root.join("db")).unwrap();
    fs::write(
        root.join("keyvalue.json"),
        r#"{
            "DKIM_SELECTORS": { "x.com": "dkim" },
            "DKIM_PUB_KEYS": { "x.com": "public-pem" },
            "DKIM_PRIV_KEYS": { "x.com": "private-pem" }
        }"#,
    )
    .unwrap();

    let file = File::create(root.join("vmail.tar.gz")).unwrap();
    let mut builder = tar::Builder::new(GzEncoder::new(file, Compression::default()));
    for (name, content) in [
        ("vmail/x.com/a/cur/msg1", "first message"),
        ("vmail/x.com/a/new/msg2", "second message"),
        ("vmail/x.com/b/cur/msg3", "someone else's mail"),
    ] {
        let mut header = tar::Header::new_gnu();
        header.set_size(content.len() as u64);
        header.set_mode(0o600);
        header.set_cksum();
        builder
            .append_data(&mut header, name, content.as_bytes())
            .unwrap();
    }
    builder.into_inner().unwrap().finish().unwrap();

    BackupBundle::open(root).unwrap()
}

fn staged_store() -> FakeStore {
    FakeStore {
        responses: vec![
            (
                "FROM `mailbox` WHERE `username`",
                vec![row(&[
                    "a@x.com", "{SSHA}secret", "Alice", "a", "x.com", "2048", "1",
                ])],
            ),
            (
                "FROM `alias`",
                vec![
                    row(&["a@x.com", "a@x.com", "x.com", "1"]),
                    row(&["team@x.com", "a@x.com,b@x.com", "x.com", "1"]),
                ],
            ),
            (
                "LEFT JOIN `mailbox`",
                vec![row(&["x.com", "2"]), row(&["y.org", "1"])],
            ),
        ],
    }
}

#[test]
fn full_pipeline_from_bundle_to_plan_snapshot_and_files() {
    let dir = tempfile::tempdir().unwrap();
    let bundle = build_bundle(dir.path());
    let scope = Scope::parse("a@x.com").unwrap();

    // Lock the scope for the invocation.
    let lock_dir = dir.path().join("locks");
    let _lock = ScopeLock::acquire(&lock_dir, &scope, &DeadProbe).unwrap();

    // Asset resolution sees everything the bundle carries.
    assert!(bundle.resolve(Asset::Database).is_some());
    assert!(bundle.resolve(Asset::MailData).is_some());
    assert!(bundle.resolve(Asset::Secrets).is_none());

    // Extraction produces a deterministic plan covering the full closure,
    // including the alias whose destination list merely contains the
    // mailbox.
    let store = staged_store();
    let plan = extract_scope(&store, &scope).unwrap().unwrap();
    assert_eq!(plan.mailboxes, vec!["a@x.com"]);
    assert!(plan
        .statements
        .iter()
        .any(|s| s.contains("'a@x.com,b@x.com'")));
    let again = extract_scope(&staged_store(), &scope).unwrap().unwrap();
    assert_eq!(plan, again);

    // Signing key material travels with the bundle.
    let key = load_signing_key(&bundle, "x.com").unwrap().unwrap();
    assert_eq!(key.selector, "dkim");

    // A snapshot of the "live" rows replays through the same upsert shape.
    let snapshot_dir = dir.path().join("snapshots");
    let snapshot = apply::write_snapshot(&store, &scope, &snapshot_dir).unwrap();
    let content = fs::read_to_string(&snapshot).unwrap();
    assert!(content.contains("-- scope: a@x.com"));
    assert!(content.contains("ON DUPLICATE KEY UPDATE"));

    // File-tree restore pulls in only the scope's subtree.
    let mut cfg = MxConfig::default();
    cfg.paths.mail_data_dir = dir.path().join("mail").display().to_string();
    let report = restore_file_tree(&bundle, &scope, &cfg, &IdleService, &[])
        .unwrap()
        .unwrap();
    assert_eq!(report.files_restored, 2);
    assert!(dir.path().join("mail/x.com/a/cur/msg1").is_file());
    assert!(!dir.path().join("mail/x.com/b").exists());
}

#[test]
fn unknown_scope_falls_back_to_discovery() {
    let store = staged_store();

    let absent = Scope::parse("nowhere.test").unwrap();
    assert!(extract_scope(&store, &absent).unwrap().is_none());

    let listing = list_scopes(&store).unwrap();
    assert_eq!(
        listing.domains,
        vec![("x.com".to_string(), 2), ("y.org".to_string(), 1)]
    );
}
