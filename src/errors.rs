//! Error taxonomy for scoped restores.
//!
//! Every fatal variant carries enough context for the operator to act on it
//! without reading the source: what failed, and what to do next. Non-fatal
//! conditions (fixup failures, key read-back mismatches) are not errors at
//! all; they accumulate as warnings on the restore summary.

use thiserror::Error;

/// Main error type for the restore pipeline.
#[derive(Error, Debug)]
pub enum RestoreError {
    #[error("Configuration error: {message}")]
    Config { message: String },

    #[error(
        "Scope '{scope}' is already being restored by live process {holder}; \
         wait for it to finish, or remove {path} if you are certain it is orphaned"
    )]
    LockHeld {
        scope: String,
        holder: i32,
        path: String,
    },

    #[error("Staging failed: {message} (the live system was not touched)")]
    Staging { message: String },

    #[error(
        "Scope '{scope}' was not found in this backup.\n\
         Domains present in the backup:\n{available}"
    )]
    ScopeNotFound { scope: String, available: String },

    #[error("Store query failed ({context}):\n{output}")]
    Sql { context: String, output: String },

    #[error(
        "'{scope}' already exists in the live system; re-run with --overwrite \
         to replace it (a pre-restore snapshot is taken first)"
    )]
    AlreadyExists { scope: String },

    #[error(
        "Apply transaction failed; the transaction was rolled back and live \
         data is unchanged. Engine output:\n{output}"
    )]
    Apply { output: String },

    #[error(
        "At-rest encryption keys differ between backup and live and the \
         restore was not confirmed; re-run with --force-key-restore or \
         confirm both prompts interactively"
    )]
    SecretMismatch,

    #[error("Post-restore validation failed: {message}")]
    Validation { message: String },

    #[error("Cancelled by operator; nothing was changed")]
    Cancelled,

    #[error("I/O error during {operation}")]
    Io {
        operation: String,
        #[source]
        source: std::io::Error,
    },
}

/// Shorthand for results in the restore pipeline.
pub type RestoreResult<T> = Result<T, RestoreError>;

impl RestoreError {
    pub fn config(message: impl Into<String>) -> Self {
        Self::Config {
            message: message.into(),
        }
    }

    pub fn staging(message: impl Into<String>) -> Self {
        Self::Staging {
            message: message.into(),
        }
    }

    pub fn sql(context: impl Into<String>, output: impl Into<String>) -> Self {
        Self::Sql {
            context: context.into(),
            output: output.into(),
        }
    }

    pub fn validation(message: impl Into<String>) -> Self {
        Self::Validation {
            message: message.into(),
        }
    }

    pub fn io(operation: impl Into<String>, source: std::io::Error) -> Self {
        Self::Io {
            operation: operation.into(),
            source,
        }
    }
}

impl From<std::io::Error> for RestoreError {
    fn from(err: std::io::Error) -> Self {
        RestoreError::io("filesystem access", err)
    }
}

impl From<serde_json::Error> for RestoreError {
    fn from(err: serde_json::Error) -> Self {
        RestoreError::config(format!("invalid JSON: {err}"))
    }
}

impl From<figment::Error> for RestoreError {
    fn from(err: figment::Error) -> Self {
        RestoreError::config(err.to_string())
    }
}
