//! Library root for the `mxrestore` crate: scoped, safe restoration of a
//! domain or mailbox from a multi-store backup into a live mail system.

// Core error handling
pub mod errors;

// Scope and configuration
pub mod config_loader;
pub mod scope;

// Backup bundle access & staging
pub mod bundle;
pub mod stager;

// Store access & extraction
pub mod extract;
pub mod sql;

// Live-side reconciliation
pub mod apply;
pub mod files;
pub mod secrets;

// Cross-invocation exclusion
pub mod lock;

// Sequencing & CLI shell
pub mod cli;
pub mod orchestrator;

pub use errors::{RestoreError, RestoreResult};
pub use scope::Scope;
