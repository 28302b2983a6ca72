//! Restore scope: the domain or mailbox boundary bounding which entities an
//! invocation touches.

use crate::errors::{RestoreError, RestoreResult};
use std::fmt;

/// A restore scope, parsed from the CLI scope string. A string containing
/// `@` is a mailbox; anything else is a domain.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Scope {
    Domain(String),
    Mailbox { local_part: String, domain: String },
}

impl Scope {
    pub fn parse(input: &str) -> RestoreResult<Self> {
        let input = input.trim().to_ascii_lowercase();
        if input.is_empty() {
            return Err(RestoreError::config("scope must not be empty"));
        }
        if !input
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | '-' | '_' | '+' | '@'))
        {
            return Err(RestoreError::config(format!(
                "scope '{input}' contains characters outside [a-z0-9.-_+@]"
            )));
        }

        match input.split_once('@') {
            None => Ok(Scope::Domain(input)),
            Some((local, domain)) => {
                if local.is_empty() || domain.is_empty() || domain.contains('@') {
                    return Err(RestoreError::config(format!(
                        "'{input}' is not a valid mailbox address"
                    )));
                }
                Ok(Scope::Mailbox {
                    local_part: local.to_string(),
                    domain: domain.to_string(),
                })
            }
        }
    }

    /// The domain this scope belongs to.
    pub fn domain(&self) -> &str {
        match self {
            Scope::Domain(d) => d,
            Scope::Mailbox { domain, .. } => domain,
        }
    }

    /// Full mailbox address, for mailbox scopes only.
    pub fn address(&self) -> Option<String> {
        match self {
            Scope::Domain(_) => None,
            Scope::Mailbox { local_part, domain } => Some(format!("{local_part}@{domain}")),
        }
    }

    /// Relative mail-store path prefix for this scope, with a trailing slash.
    /// The mail store lays out message data as `<domain>/<local_part>/...`.
    pub fn maildir_prefix(&self) -> String {
        match self {
            Scope::Domain(d) => format!("{d}/"),
            Scope::Mailbox { local_part, domain } => format!("{domain}/{local_part}/"),
        }
    }

    /// Filesystem-safe identifier used for lock and snapshot file names.
    pub fn slug(&self) -> String {
        self.to_string().replace('@', "_at_")
    }
}

impl fmt::Display for Scope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Scope::Domain(d) => write!(f, "{d}"),
            Scope::Mailbox { local_part, domain } => write!(f, "{local_part}@{domain}"),
        }
    }
}
