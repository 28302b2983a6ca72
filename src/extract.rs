//! Scope extraction: turn the staged snapshot into an ordered list of
//! idempotent mutation statements covering the scope's full entity closure.
//!
//! Membership rules:
//! - Domain scope: dependents match by foreign-key equality on the domain
//!   column.
//! - Mailbox scope: aliases match by equality on the alias address AND by
//!   containment against the comma-joined `goto` destination list. The
//!   containment test is deliberately over-inclusive (an alias whose
//!   destinations merely include the mailbox is pulled in whole); this
//!   mirrors the schema's composite representation and must not be
//!   narrowed.
//!
//! Groupware rows (calendars, address books, folder ACLs, user profiles)
//! have no stable identity across backups, so each user's rows are removed
//! with bounded DELETEs before re-insertion. Everything else is an upsert
//! keyed on the table's unique constraint. Every SELECT carries an ORDER BY
//! so repeated extraction from the same backup yields an identical plan.

use crate::errors::{RestoreError, RestoreResult};
use crate::scope::Scope;
use crate::sql::{quote_opt, quote_str, Row, SqlExec};

const DOMAIN_COLS: &[&str] = &[
    "domain",
    "description",
    "aliases",
    "mailboxes",
    "quota",
    "maxquota",
    "active",
];
const MAILBOX_COLS: &[&str] = &[
    "username",
    "password",
    "name",
    "local_part",
    "domain",
    "quota",
    "active",
];
const ALIAS_COLS: &[&str] = &["address", "goto", "domain", "active"];
const ALIAS_DOMAIN_COLS: &[&str] = &["alias_domain", "target_domain", "active"];
const SENDER_ACL_COLS: &[&str] = &["logged_in_as", "send_as", "external"];
const FILTERCONF_COLS: &[&str] = &["object", "option", "value"];
const SOGO_PROFILE_COLS: &[&str] = &["c_uid", "c_defaults", "c_settings"];
const SOGO_FOLDER_COLS: &[&str] = &[
    "c_folder_id",
    "c_path",
    "c_path2",
    "c_foldername",
    "c_folder_type",
];
const SOGO_STORE_COLS: &[&str] = &[
    "c_folder_id",
    "c_name",
    "c_content",
    "c_creationdate",
    "c_lastmodified",
    "c_version",
];
const SOGO_ACL_COLS: &[&str] = &["c_folder_id", "c_object", "c_uid", "c_role"];

/// Ordered candidate statements for one scope, plus bookkeeping the applier
/// and file restorer need.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RestorePlan {
    pub scope: Scope,
    pub statements: Vec<String>,
    pub table_counts: Vec<(String, usize)>,
    /// Full addresses of every mailbox the plan restores.
    pub mailboxes: Vec<String>,
}

impl RestorePlan {
    pub fn summary(&self) -> String {
        let mut out = format!(
            "Restore plan for '{}': {} statements\n",
            self.scope,
            self.statements.len()
        );
        for (table, count) in &self.table_counts {
            out.push_str(&format!("  {table:<20} {count}\n"));
        }
        out
    }
}

/// Every domain present in the staged snapshot, with its mailbox count.
#[derive(Debug, Clone)]
pub struct DiscoveryListing {
    pub domains: Vec<(String, usize)>,
}

impl DiscoveryListing {
    pub fn format(&self) -> String {
        if self.domains.is_empty() {
            return "  (none)".to_string();
        }
        self.domains
            .iter()
            .map(|(domain, count)| format!("  {domain} ({count} mailboxes)"))
            .collect::<Vec<_>>()
            .join("\n")
    }
}

/// Extract the full entity closure for `scope` from the staged instance.
/// Returns `None` when the primary entity is absent from the backup.
pub fn extract_scope(sql: &dyn SqlExec, scope: &Scope) -> RestoreResult<Option<RestorePlan>> {
    let primary = primary_rows(sql, scope)?;
    if primary.is_empty() {
        return Ok(None);
    }

    let mut plan = RestorePlan {
        scope: scope.clone(),
        statements: Vec::new(),
        table_counts: Vec::new(),
        mailboxes: Vec::new(),
    };

    match scope {
        Scope::Domain(domain) => {
            push(&mut plan, "domain", primary_upserts(scope, &primary));

            let mailbox_rows = fetch(
                sql,
                &select(
                    "mailbox",
                    MAILBOX_COLS,
                    &format!("`domain` = {}", quote_str(domain)),
                    "`username`",
                ),
                MAILBOX_COLS.len(),
            )?;
            plan.mailboxes = first_column(&mailbox_rows);
            push(
                &mut plan,
                "mailbox",
                upserts("mailbox", MAILBOX_COLS, 1, &mailbox_rows),
            );

            let alias_rows = alias_rows(sql, scope)?;
            push(&mut plan, "alias", alias_upserts(&alias_rows));

            let alias_domain_rows = fetch(
                sql,
                &select(
                    "alias_domain",
                    ALIAS_DOMAIN_COLS,
                    &format!("`target_domain` = {}", quote_str(domain)),
                    "`alias_domain`",
                ),
                ALIAS_DOMAIN_COLS.len(),
            )?;
            push(
                &mut plan,
                "alias_domain",
                upserts("alias_domain", ALIAS_DOMAIN_COLS, 1, &alias_domain_rows),
            );

            let acl_rows = fetch(
                sql,
                &select(
                    "sender_acl",
                    SENDER_ACL_COLS,
                    &format!("`logged_in_as` LIKE {}", quote_str(&format!("%@{domain}"))),
                    "`logged_in_as`, `send_as`",
                ),
                SENDER_ACL_COLS.len(),
            )?;
            push(
                &mut plan,
                "sender_acl",
                upserts("sender_acl", SENDER_ACL_COLS, 2, &acl_rows),
            );

            let policy_rows = fetch(
                sql,
                &select(
                    "filterconf",
                    FILTERCONF_COLS,
                    &format!(
                        "`object` = {} OR `object` LIKE {}",
                        quote_str(domain),
                        quote_str(&format!("%@{domain}"))
                    ),
                    "`object`, `option`",
                ),
                FILTERCONF_COLS.len(),
            )?;
            push(
                &mut plan,
                "filterconf",
                upserts("filterconf", FILTERCONF_COLS, 2, &policy_rows),
            );
        }
        Scope::Mailbox { .. } => {
            let address = scope.address().unwrap_or_default();
            plan.mailboxes = vec![address.clone()];
            push(&mut plan, "mailbox", primary_upserts(scope, &primary));

            let alias_rows = alias_rows(sql, scope)?;
            push(&mut plan, "alias", alias_upserts(&alias_rows));

            let acl_rows = fetch(
                sql,
                &select(
                    "sender_acl",
                    SENDER_ACL_COLS,
                    &format!("`logged_in_as` = {}", quote_str(&address)),
                    "`logged_in_as`, `send_as`",
                ),
                SENDER_ACL_COLS.len(),
            )?;
            push(
                &mut plan,
                "sender_acl",
                upserts("sender_acl", SENDER_ACL_COLS, 2, &acl_rows),
            );

            let policy_rows = fetch(
                sql,
                &select(
                    "filterconf",
                    FILTERCONF_COLS,
                    &format!("`object` = {}", quote_str(&address)),
                    "`object`, `option`",
                ),
                FILTERCONF_COLS.len(),
            )?;
            push(
                &mut plan,
                "filterconf",
                upserts("filterconf", FILTERCONF_COLS, 2, &policy_rows),
            );
        }
    }

    let mut groupware = Vec::new();
    for user in plan.mailboxes.clone() {
        groupware.extend(groupware_statements(sql, &user)?);
    }
    push(&mut plan, "groupware", groupware);

    Ok(Some(plan))
}

/// Primary-entity rows for a scope, against whichever endpoint `sql` is
/// bound to (staged for extraction, live for snapshotting).
pub fn primary_rows(sql: &dyn SqlExec, scope: &Scope) -> RestoreResult<Vec<Row>> {
    match scope {
        Scope::Domain(domain) => fetch(
            sql,
            &select(
                "domain",
                DOMAIN_COLS,
                &format!("`domain` = {}", quote_str(domain)),
                "`domain`",
            ),
            DOMAIN_COLS.len(),
        ),
        Scope::Mailbox { .. } => {
            let address = scope.address().unwrap_or_default();
            fetch(
                sql,
                &select(
                    "mailbox",
                    MAILBOX_COLS,
                    &format!("`username` = {}", quote_str(&address)),
                    "`username`",
                ),
                MAILBOX_COLS.len(),
            )
        }
    }
}

/// Alias rows belonging to a scope. For a mailbox this is the deliberately
/// over-inclusive equality-or-containment match described at the top of
/// this module.
pub fn alias_rows(sql: &dyn SqlExec, scope: &Scope) -> RestoreResult<Vec<Row>> {
    let predicate = match scope {
        Scope::Domain(domain) => format!("`domain` = {}", quote_str(domain)),
        Scope::Mailbox { .. } => {
            let address = scope.address().unwrap_or_default();
            format!(
                "`address` = {} OR `goto` LIKE {}",
                quote_str(&address),
                quote_str(&format!("%{address}%"))
            )
        }
    };
    fetch(
        sql,
        &select("alias", ALIAS_COLS, &predicate, "`address`"),
        ALIAS_COLS.len(),
    )
}

/// Upserts for a scope's primary-entity rows. Shared with the applier's
/// pre-restore snapshot writer so snapshots replay through the same
/// statement shape the restore itself uses.
pub fn primary_upserts(scope: &Scope, rows: &[Row]) -> Vec<String> {
    match scope {
        Scope::Domain(_) => upserts("domain", DOMAIN_COLS, 1, rows),
        Scope::Mailbox { .. } => upserts("mailbox", MAILBOX_COLS, 1, rows),
    }
}

/// Upserts for alias rows.
pub fn alias_upserts(rows: &[Row]) -> Vec<String> {
    upserts("alias", ALIAS_COLS, 1, rows)
}

/// Build an upsert keyed on each row's unique-constraint prefix.
pub fn upsert_stmt(table: &str, cols: &[&str], key_len: usize, row: &Row) -> String {
    let col_list = backtick_list(cols);
    let values: Vec<String> = row.iter().map(quote_opt).collect();
    let updates: Vec<String> = cols[key_len..]
        .iter()
        .map(|c| format!("`{c}` = VALUES(`{c}`)"))
        .collect();
    if updates.is_empty() {
        format!(
            "INSERT IGNORE INTO `{table}` ({col_list}) VALUES ({});",
            values.join(", ")
        )
    } else {
        format!(
            "INSERT INTO `{table}` ({col_list}) VALUES ({}) ON DUPLICATE KEY UPDATE {};",
            values.join(", "),
            updates.join(", ")
        )
    }
}

/// Discovery fallback: list every domain present in the staged snapshot.
pub fn list_scopes(sql: &dyn SqlExec) -> RestoreResult<DiscoveryListing> {
    let rows = fetch(
        sql,
        "SELECT `d`.`domain`, COUNT(`m`.`username`) \
         FROM `domain` AS `d` \
         LEFT JOIN `mailbox` AS `m` ON `m`.`domain` = `d`.`domain` \
         GROUP BY `d`.`domain` ORDER BY `d`.`domain`",
        2,
    )?;
    let domains = rows
        .into_iter()
        .map(|row| {
            let name = row[0].clone().unwrap_or_default();
            let count = row[1]
                .as_deref()
                .and_then(|c| c.parse::<usize>().ok())
                .unwrap_or(0);
            (name, count)
        })
        .collect();
    Ok(DiscoveryListing { domains })
}

fn groupware_statements(sql: &dyn SqlExec, user: &str) -> RestoreResult<Vec<String>> {
    // Groupware folders embed the owner's address in their path.
    let path_pred = format!(
        "`c_path` = {} OR `c_path` LIKE {}",
        quote_str(&format!("/Users/{user}")),
        quote_str(&format!("/Users/{user}/%"))
    );
    let folder_ids = format!(
        "SELECT `c_folder_id` FROM `sogo_folder_info` WHERE {path_pred}"
    );

    let mut stmts = vec![
        format!("DELETE FROM `sogo_acl` WHERE `c_folder_id` IN ({folder_ids});"),
        format!("DELETE FROM `sogo_store` WHERE `c_folder_id` IN ({folder_ids});"),
        format!("DELETE FROM `sogo_folder_info` WHERE {path_pred};"),
        format!(
            "DELETE FROM `sogo_user_profile` WHERE `c_uid` = {};",
            quote_str(user)
        ),
    ];

    let folder_rows = fetch(
        sql,
        &select("sogo_folder_info", SOGO_FOLDER_COLS, &path_pred, "`c_folder_id`"),
        SOGO_FOLDER_COLS.len(),
    )?;
    for row in &folder_rows {
        stmts.push(insert_stmt("sogo_folder_info", SOGO_FOLDER_COLS, row));
    }

    let store_rows = fetch(
        sql,
        &format!(
            "SELECT {} FROM `sogo_store` AS `s` \
             JOIN `sogo_folder_info` AS `f` ON `f`.`c_folder_id` = `s`.`c_folder_id` \
             WHERE {} ORDER BY `s`.`c_folder_id`, `s`.`c_name`",
            prefixed_list("s", SOGO_STORE_COLS),
            path_pred.replace("`c_path`", "`f`.`c_path`"),
        ),
        SOGO_STORE_COLS.len(),
    )?;
    for row in &store_rows {
        stmts.push(insert_stmt("sogo_store", SOGO_STORE_COLS, row));
    }

    let acl_rows = fetch(
        sql,
        &format!(
            "SELECT {} FROM `sogo_acl` AS `a` \
             JOIN `sogo_folder_info` AS `f` ON `f`.`c_folder_id` = `a`.`c_folder_id` \
             WHERE {} ORDER BY `a`.`c_folder_id`, `a`.`c_uid`, `a`.`c_role`",
            prefixed_list("a", SOGO_ACL_COLS),
            path_pred.replace("`c_path`", "`f`.`c_path`"),
        ),
        SOGO_ACL_COLS.len(),
    )?;
    for row in &acl_rows {
        stmts.push(insert_stmt("sogo_acl", SOGO_ACL_COLS, row));
    }

    let profile_rows = fetch(
        sql,
        &select(
            "sogo_user_profile",
            SOGO_PROFILE_COLS,
            &format!("`c_uid` = {}", quote_str(user)),
            "`c_uid`",
        ),
        SOGO_PROFILE_COLS.len(),
    )?;
    for row in &profile_rows {
        stmts.push(insert_stmt("sogo_user_profile", SOGO_PROFILE_COLS, row));
    }

    Ok(stmts)
}

fn insert_stmt(table: &str, cols: &[&str], row: &Row) -> String {
    let values: Vec<String> = row.iter().map(quote_opt).collect();
    format!(
        "INSERT INTO `{table}` ({}) VALUES ({});",
        backtick_list(cols),
        values.join(", ")
    )
}

fn upserts(table: &str, cols: &[&str], key_len: usize, rows: &[Row]) -> Vec<String> {
    rows.iter()
        .map(|row| upsert_stmt(table, cols, key_len, row))
        .collect()
}

fn select(table: &str, cols: &[&str], where_clause: &str, order_by: &str) -> String {
    format!(
        "SELECT {} FROM `{table}` WHERE {where_clause} ORDER BY {order_by}",
        backtick_list(cols)
    )
}

fn fetch(sql: &dyn SqlExec, stmt: &str, width: usize) -> RestoreResult<Vec<Row>> {
    let rows = sql.query(stmt)?;
    for row in &rows {
        if row.len() != width {
            return Err(RestoreError::sql(
                stmt.to_string(),
                format!("expected {width} columns, got {}", row.len()),
            ));
        }
    }
    Ok(rows)
}

fn push(plan: &mut RestorePlan, table: &str, stmts: Vec<String>) {
    plan.table_counts.push((table.to_string(), stmts.len()));
    plan.statements.extend(stmts);
}

fn first_column(rows: &[Row]) -> Vec<String> {
    rows.iter()
        .filter_map(|row| row.first().cloned().flatten())
        .collect()
}

fn backtick_list(cols: &[&str]) -> String {
    cols.iter()
        .map(|c| format!("`{c}`"))
        .collect::<Vec<_>>()
        .join(", ")
}

fn prefixed_list(prefix: &str, cols: &[&str]) -> String {
    cols.iter()
        .map(|c| format!("`{prefix}`.`{c}`"))
        .collect::<Vec<_>>()
        .join(", ")
}
