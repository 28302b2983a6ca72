//! Live reconciliation: snapshot, transactional apply, fixups, validation.
//!
//! Phase order is a hard contract: the pre-restore snapshot is on disk
//! before the overwrite transaction starts, the transaction is
//! all-or-nothing, fixups run outside it and are individually non-fatal,
//! and validation failures surface the literal rollback command without
//! ever executing it.

use crate::errors::{RestoreError, RestoreResult};
use crate::extract::{alias_rows, alias_upserts, primary_rows, primary_upserts, RestorePlan};
use crate::scope::Scope;
use crate::sql::{quote_str, SqlExec};
use std::fs;
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApplyPhase {
    Checking,
    Snapshotting,
    Applying,
    FixingUp,
    Validating,
    Done,
    Failed,
}

#[derive(Debug)]
pub struct ApplyOutcome {
    pub phase: ApplyPhase,
    pub snapshot: Option<PathBuf>,
    pub warnings: Vec<String>,
}

/// Settings the applier needs beyond the plan itself. `client_bin` and
/// `database` only feed the rollback instructions in error messages.
pub struct ApplySettings<'a> {
    pub overwrite: bool,
    pub snapshot_dir: &'a Path,
    pub client_bin: &'a str,
    pub database: &'a str,
}

pub fn primary_exists(sql: &dyn SqlExec, scope: &Scope) -> RestoreResult<bool> {
    Ok(!primary_rows(sql, scope)?.is_empty())
}

/// Capture the live primary entity and its direct aliases into a
/// timestamped, replayable snapshot file.
pub fn write_snapshot(
    sql_live: &dyn SqlExec,
    scope: &Scope,
    dir: &Path,
) -> RestoreResult<PathBuf> {
    let primary = primary_rows(sql_live, scope)?;
    let aliases = alias_rows(sql_live, scope)?;

    let now = chrono::Utc::now();
    fs::create_dir_all(dir)
        .map_err(|e| RestoreError::io("creating snapshot directory", e))?;
    let path = dir.join(format!(
        "snapshot-{}-{}.sql",
        scope.slug(),
        now.format("%Y%m%d-%H%M%S")
    ));

    let mut content = String::new();
    content.push_str("-- pre-restore snapshot\n");
    content.push_str(&format!("-- scope: {scope}\n"));
    content.push_str(&format!("-- taken: {}\n", now.to_rfc3339()));
    content.push_str("-- replay against the live database to roll the restore back\n\n");
    for stmt in primary_upserts(scope, &primary) {
        content.push_str(&stmt);
        content.push('\n');
    }
    for stmt in alias_upserts(&aliases) {
        content.push_str(&stmt);
        content.push('\n');
    }

    fs::write(&path, content)
        .map_err(|e| RestoreError::io(format!("writing snapshot {}", path.display()), e))?;
    Ok(path)
}

/// Wrap the plan in one all-or-nothing transaction. Statement order across
/// entity types does not respect every foreign-key dependency (each type is
/// generated independently), so cross-entity FK enforcement stays off for
/// the transaction's duration.
pub fn transaction_script(plan: &RestorePlan) -> String {
    let mut script = String::from("SET SESSION FOREIGN_KEY_CHECKS = 0;\nSTART TRANSACTION;\n");
    for stmt in &plan.statements {
        script.push_str(stmt);
        script.push('\n');
    }
    script.push_str("COMMIT;\n");
    script
}

/// Idempotent fixups run outside the main transaction, each individually
/// non-fatal.
pub fn fixup_statements(plan: &RestorePlan) -> Vec<(String, String)> {
    if plan.mailboxes.is_empty() {
        return Vec::new();
    }

    let placeholders: Vec<String> = plan
        .mailboxes
        .iter()
        .map(|user| {
            format!(
                "INSERT IGNORE INTO `quota2` (`username`, `bytes`, `messages`) VALUES ({}, 0, 0);",
                quote_str(user)
            )
        })
        .collect();

    let users: Vec<String> = plan.mailboxes.iter().map(|u| quote_str(u)).collect();
    let view_refresh = format!(
        "REPLACE INTO `_sogo_static_view` (`c_uid`, `c_name`, `c_cn`, `mail`, `aliases`, `domain`)\n\
         SELECT `m`.`username`, `m`.`username`, `m`.`name`, `m`.`username`,\n\
                IFNULL(GROUP_CONCAT(`a`.`address` SEPARATOR ' '), ''), `m`.`domain`\n\
         FROM `mailbox` AS `m`\n\
         LEFT JOIN `alias` AS `a` ON `a`.`goto` = `m`.`username` AND `a`.`address` <> `m`.`username`\n\
         WHERE `m`.`username` IN ({})\n\
         GROUP BY `m`.`username`, `m`.`name`, `m`.`domain`;\n\
         DELETE FROM `_sogo_static_view` WHERE `c_uid` NOT IN (SELECT `username` FROM `mailbox`);",
        users.join(", ")
    );

    vec![
        (
            "usage accounting placeholders".to_string(),
            placeholders.join("\n"),
        ),
        ("auth lookup view refresh".to_string(), view_refresh),
    ]
}

/// Literal command an operator runs to replay a snapshot.
pub fn rollback_command(client_bin: &str, database: &str, snapshot: &Path) -> String {
    format!("{client_bin} {database} < {}", snapshot.display())
}

/// Run the full checking → snapshotting → applying → fixing-up →
/// validating sequence against the live store.
pub fn apply_plan(
    sql_live: &dyn SqlExec,
    plan: &RestorePlan,
    settings: &ApplySettings,
) -> RestoreResult<ApplyOutcome> {
    let mut outcome = ApplyOutcome {
        phase: ApplyPhase::Checking,
        snapshot: None,
        warnings: Vec::new(),
    };

    let exists = primary_exists(sql_live, &plan.scope)?;
    if exists && !settings.overwrite {
        return Err(RestoreError::AlreadyExists {
            scope: plan.scope.to_string(),
        });
    }

    if exists {
        outcome.phase = ApplyPhase::Snapshotting;
        let snapshot = write_snapshot(sql_live, &plan.scope, settings.snapshot_dir)?;
        tracing::info!(snapshot = %snapshot.display(), "pre-restore snapshot written");
        outcome.snapshot = Some(snapshot);
    }

    outcome.phase = ApplyPhase::Applying;
    if let Err(e) = sql_live.exec_script(&transaction_script(plan)) {
        outcome.phase = ApplyPhase::Failed;
        let output = match e {
            RestoreError::Sql { output, .. } => output,
            other => other.to_string(),
        };
        return Err(RestoreError::Apply { output });
    }

    outcome.phase = ApplyPhase::FixingUp;
    for (label, script) in fixup_statements(plan) {
        if let Err(e) = sql_live.exec_script(&script) {
            tracing::warn!(fixup = %label, error = %e, "fixup failed");
            outcome.warnings.push(format!("fixup '{label}' failed: {e}"));
        }
    }

    outcome.phase = ApplyPhase::Validating;
    let rollback_hint = match &outcome.snapshot {
        Some(snapshot) => format!(
            "to roll back the overwrite, run: {}",
            rollback_command(settings.client_bin, settings.database, snapshot)
        ),
        None => "no snapshot was taken (the entity did not exist live before); \
                 investigate and re-run the restore"
            .to_string(),
    };
    let present = primary_exists(sql_live, &plan.scope).map_err(|e| {
        RestoreError::validation(format!(
            "store unreachable after apply: {e}; {rollback_hint}"
        ))
    })?;
    if !present {
        return Err(RestoreError::validation(format!(
            "'{}' is not visible in the live store after commit; {rollback_hint}",
            plan.scope
        )));
    }

    outcome.phase = ApplyPhase::Done;
    Ok(outcome)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sql::Row;
    use std::cell::RefCell;
    use tempfile::tempdir;

    fn mailbox_row() -> Row {
        ["a@x.com", "hash", "Alice", "a", "x.com", "0", "1"]
            .iter()
            .map(|f| Some(f.to_string()))
            .collect()
    }

    fn plan() -> RestorePlan {
        RestorePlan {
            scope: Scope::parse("a@x.com").unwrap(),
            statements: vec![
                "INSERT INTO `mailbox` (`username`) VALUES ('a@x.com') \
                 ON DUPLICATE KEY UPDATE `username` = VALUES(`username`);"
                    .to_string(),
            ],
            table_counts: vec![("mailbox".to_string(), 1)],
            mailboxes: vec!["a@x.com".to_string()],
        }
    }

    struct FakeLive {
        exists_before: bool,
        present_after: bool,
        fail_on: Option<&'static str>,
        scripts: RefCell<Vec<String>>,
        applied: RefCell<bool>,
    }

    impl FakeLive {
        fn new(exists_before: bool, present_after: bool) -> Self {
            Self {
                exists_before,
                present_after,
                fail_on: None,
                scripts: RefCell::new(Vec::new()),
                applied: RefCell::new(false),
            }
        }
    }

    impl SqlExec for FakeLive {
        fn query(&self, sql: &str) -> RestoreResult<Vec<Row>> {
            if sql.contains("FROM `mailbox` WHERE `username`") {
                let present = if *self.applied.borrow() {
                    self.present_after
                } else {
                    self.exists_before
                };
                return Ok(if present { vec![mailbox_row()] } else { vec![] });
            }
            Ok(Vec::new())
        }

        fn exec_script(&self, script: &str) -> RestoreResult<()> {
            if let Some(needle) = self.fail_on {
                if script.contains(needle) {
                    return Err(RestoreError::sql("script execution", "engine says no"));
                }
            }
            if script.contains("START TRANSACTION") {
                *self.applied.borrow_mut() = true;
            }
            self.scripts.borrow_mut().push(script.to_string());
            Ok(())
        }
    }

    fn settings(snapshot_dir: &Path, overwrite: bool) -> ApplySettings<'_> {
        ApplySettings {
            overwrite,
            snapshot_dir,
            client_bin: "mariadb",
            database: "mailserver",
        }
    }

    #[test]
    fn existing_entity_without_overwrite_aborts_before_any_write() {
        let dir = tempdir().unwrap();
        let live = FakeLive::new(true, true);

        let err = apply_plan(&live, &plan(), &settings(dir.path(), false)).unwrap_err();
        assert!(matches!(err, RestoreError::AlreadyExists { .. }));
        assert!(live.scripts.borrow().is_empty());
        // No snapshot either: the abort happens in the checking phase.
        assert!(fs::read_dir(dir.path()).unwrap().next().is_none());
    }

    #[test]
    fn snapshot_exists_before_the_transaction_runs() {
        let dir = tempdir().unwrap();
        let mut live = FakeLive::new(true, true);
        live.fail_on = Some("START TRANSACTION");

        let err = apply_plan(&live, &plan(), &settings(dir.path(), true)).unwrap_err();
        assert!(matches!(err, RestoreError::Apply { .. }));

        // The transaction failed, but the snapshot had already been written.
        let snapshots: Vec<_> = fs::read_dir(dir.path())
            .unwrap()
            .filter_map(|e| e.ok())
            .collect();
        assert_eq!(snapshots.len(), 1);
        let content = fs::read_to_string(snapshots[0].path()).unwrap();
        assert!(content.contains("-- scope: a@x.com"));
        assert!(content.contains("INSERT INTO `mailbox`"));
    }

    #[test]
    fn apply_failure_surfaces_engine_output_verbatim() {
        let dir = tempdir().unwrap();
        let mut live = FakeLive::new(false, false);
        live.fail_on = Some("START TRANSACTION");

        let err = apply_plan(&live, &plan(), &settings(dir.path(), false)).unwrap_err();
        match err {
            RestoreError::Apply { output } => assert!(output.contains("engine says no")),
            other => panic!("expected Apply, got {other:?}"),
        }
    }

    #[test]
    fn fixup_failures_are_warnings_not_errors() {
        let dir = tempdir().unwrap();
        let mut live = FakeLive::new(false, true);
        live.fail_on = Some("_sogo_static_view");

        let outcome = apply_plan(&live, &plan(), &settings(dir.path(), false)).unwrap();
        assert_eq!(outcome.phase, ApplyPhase::Done);
        assert_eq!(outcome.warnings.len(), 1);
        assert!(outcome.warnings[0].contains("auth lookup view refresh"));
    }

    #[test]
    fn validation_failure_carries_rollback_command() {
        let dir = tempdir().unwrap();
        let live = FakeLive::new(true, false);

        let err = apply_plan(&live, &plan(), &settings(dir.path(), true)).unwrap_err();
        match err {
            RestoreError::Validation { message } => {
                assert!(message.contains("mariadb mailserver < "));
                assert!(message.contains("snapshot-a_at_x.com-"));
            }
            other => panic!("expected Validation, got {other:?}"),
        }
    }

    #[test]
    fn fresh_restore_takes_no_snapshot() {
        let dir = tempdir().unwrap();
        let live = FakeLive::new(false, true);

        let outcome = apply_plan(&live, &plan(), &settings(dir.path(), false)).unwrap();
        assert_eq!(outcome.phase, ApplyPhase::Done);
        assert!(outcome.snapshot.is_none());
    }

    #[test]
    fn transaction_disables_fk_checks_and_commits() {
        let script = transaction_script(&plan());
        assert!(script.starts_with("SET SESSION FOREIGN_KEY_CHECKS = 0;"));
        assert!(script.contains("START TRANSACTION;"));
        assert!(script.trim_end().ends_with("COMMIT;"));
    }

    #[test]
    fn fixups_cover_quota_placeholders_and_view_refresh() {
        let fixups = fixup_statements(&plan());
        assert_eq!(fixups.len(), 2);
        assert!(fixups[0].1.contains("INSERT IGNORE INTO `quota2`"));
        assert!(fixups[1].1.contains("REPLACE INTO `_sogo_static_view`"));
        // Stale rows for entities no longer present are dropped by the
        // negative membership test.
        assert!(fixups[1].1.contains("NOT IN (SELECT `username` FROM `mailbox`)"));
    }

    #[test]
    fn applying_twice_produces_identical_scripts() {
        let p = plan();
        assert_eq!(transaction_script(&p), transaction_script(&p));
    }
}
