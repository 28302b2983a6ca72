//! Store access through the store's own client binary.
//!
//! The host never opens the store's data files itself: every read and write
//! goes through the client in batch mode (tab-separated, no column names),
//! against either a unix socket (staged instance) or the configured live
//! endpoint. `SqlExec` is the seam the extractor and applier work against,
//! so tests can substitute a fake backend.

use crate::errors::{RestoreError, RestoreResult};
use std::io::Write;
use std::path::PathBuf;
use std::process::{Command, Stdio};

/// One result row; `None` is SQL NULL.
pub type Row = Vec<Option<String>>;

/// Capability to run SQL against a store endpoint.
pub trait SqlExec {
    /// Run a single statement and return its result rows.
    fn query(&self, sql: &str) -> RestoreResult<Vec<Row>>;

    /// Pipe a multi-statement script through the client in one session.
    fn exec_script(&self, script: &str) -> RestoreResult<()>;
}

#[derive(Debug, Clone)]
pub enum SqlEndpoint {
    Socket { path: PathBuf },
    Net {
        host: String,
        port: u16,
        user: String,
        password: Option<String>,
    },
}

/// Client-binary-backed implementation of [`SqlExec`].
#[derive(Debug, Clone)]
pub struct SqlRunner {
    client_bin: String,
    endpoint: SqlEndpoint,
    database: Option<String>,
}

impl SqlRunner {
    pub fn new(client_bin: &str, endpoint: SqlEndpoint, database: Option<&str>) -> Self {
        Self {
            client_bin: client_bin.to_string(),
            endpoint,
            database: database.map(str::to_string),
        }
    }

    fn base_command(&self) -> Command {
        let mut cmd = Command::new(&self.client_bin);
        cmd.arg("--batch").arg("--skip-column-names");
        match &self.endpoint {
            SqlEndpoint::Socket { path } => {
                cmd.arg(format!("--socket={}", path.display()));
                cmd.arg("--user=root");
            }
            SqlEndpoint::Net {
                host,
                port,
                user,
                password,
            } => {
                cmd.arg(format!("--host={host}"));
                cmd.arg(format!("--port={port}"));
                cmd.arg(format!("--user={user}"));
                if let Some(pw) = password {
                    cmd.arg(format!("--password={pw}"));
                }
            }
        }
        if let Some(db) = &self.database {
            cmd.arg(db);
        }
        cmd
    }
}

impl SqlExec for SqlRunner {
    fn query(&self, sql: &str) -> RestoreResult<Vec<Row>> {
        let output = self
            .base_command()
            .arg("-e")
            .arg(sql)
            .output()
            .map_err(|e| RestoreError::io(format!("running {}", self.client_bin), e))?;

        if !output.status.success() {
            return Err(RestoreError::sql(
                truncate(sql, 120),
                String::from_utf8_lossy(&output.stderr).into_owned(),
            ));
        }

        let stdout = String::from_utf8_lossy(&output.stdout);
        Ok(stdout
            .lines()
            .map(|line| line.split('\t').map(unescape_field).collect())
            .collect())
    }

    fn exec_script(&self, script: &str) -> RestoreResult<()> {
        let mut child = self
            .base_command()
            .stdin(Stdio::piped())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|e| RestoreError::io(format!("running {}", self.client_bin), e))?;

        if let Some(mut stdin) = child.stdin.take() {
            stdin
                .write_all(script.as_bytes())
                .map_err(|e| RestoreError::io("writing SQL script to client", e))?;
        }

        let output = child
            .wait_with_output()
            .map_err(|e| RestoreError::io(format!("waiting for {}", self.client_bin), e))?;
        if !output.status.success() {
            return Err(RestoreError::sql(
                "script execution",
                String::from_utf8_lossy(&output.stderr).into_owned(),
            ));
        }
        Ok(())
    }
}

/// Decode one batch-mode field. The client escapes tab, newline, NUL and
/// backslash, and prints bare `NULL` for SQL NULL.
pub fn unescape_field(raw: &str) -> Option<String> {
    if raw == "NULL" {
        return None;
    }
    let mut out = String::with_capacity(raw.len());
    let mut chars = raw.chars();
    while let Some(c) = chars.next() {
        if c != '\\' {
            out.push(c);
            continue;
        }
        match chars.next() {
            Some('t') => out.push('\t'),
            Some('n') => out.push('\n'),
            Some('0') => out.push('\0'),
            Some('\\') => out.push('\\'),
            Some(other) => {
                out.push('\\');
                out.push(other);
            }
            None => out.push('\\'),
        }
    }
    Some(out)
}

/// Quote a string as a SQL literal.
pub fn quote_str(value: &str) -> String {
    let mut out = String::with_capacity(value.len() + 2);
    out.push('\'');
    for c in value.chars() {
        match c {
            '\'' => out.push_str("''"),
            '\\' => out.push_str("\\\\"),
            '\n' => out.push_str("\\n"),
            '\r' => out.push_str("\\r"),
            '\0' => out.push_str("\\0"),
            other => out.push(other),
        }
    }
    out.push('\'');
    out
}

/// Render an optional field as a SQL literal or NULL.
pub fn quote_opt(value: &Option<String>) -> String {
    match value {
        None => "NULL".to_string(),
        Some(v) => quote_str(v),
    }
}

fn truncate(s: &str, max: usize) -> String {
    if s.len() <= max {
        return s.to_string();
    }
    let mut end = max;
    while !s.is_char_boundary(end) {
        end -= 1;
    }
    format!("{}...", &s[..end])
}
