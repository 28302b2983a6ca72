//! Configuration for the restore tool: live store connection parameters,
//! filesystem roots, external tool names, and staging timeouts.
//!
//! Loaded from built-in defaults, then `mxrestore.toml`, then `MXR_*`
//! environment variables (double underscore separates nesting, e.g.
//! `MXR_LIVE__SOCKET`).

use figment::{
    providers::{Env, Format, Serialized, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};

/// Connection parameters for the live relational store.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LiveStoreConfig {
    /// Unix socket of the live server; preferred when set.
    pub socket: Option<String>,
    pub host: String,
    pub port: u16,
    pub user: String,
    pub password: Option<String>,
}

impl Default for LiveStoreConfig {
    fn default() -> Self {
        Self {
            socket: Some("/run/mysqld/mysqld.sock".to_string()),
            host: "127.0.0.1".to_string(),
            port: 3306,
            user: "root".to_string(),
            password: None,
        }
    }
}

/// Filesystem roots the restore touches.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PathsConfig {
    /// Root of the live mail store (`<domain>/<local_part>/...` below it).
    pub mail_data_dir: String,
    /// Directory holding the live at-rest encryption key pair.
    pub crypt_key_dir: String,
    /// Where pre-restore snapshots and key backups are written.
    pub snapshot_dir: String,
    /// Where per-scope lock files live.
    pub lock_dir: String,
}

impl Default for PathsConfig {
    fn default() -> Self {
        Self {
            mail_data_dir: "/var/vmail".to_string(),
            crypt_key_dir: "/etc/mail/crypt".to_string(),
            snapshot_dir: "/var/backups/mxrestore".to_string(),
            lock_dir: "/run/lock".to_string(),
        }
    }
}

/// External tools the restore orchestrates. The store and the mail services
/// are collaborators reached through their own binaries; the tool never
/// parses their on-disk formats itself.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolsConfig {
    /// Store server binary used for the staged instance.
    pub server_bin: String,
    /// Store client binary, used against both staged and live instances.
    pub client_bin: String,
    /// Snapshot prepare/crash-recovery tool.
    pub prepare_bin: String,
    /// Key-value store client (signing-key restore).
    pub kv_client_bin: String,
    /// Mail admin tool for index resync / quota recalculation.
    pub doveadm_bin: String,
    /// `user:group` the restored mail subtree is chowned to.
    pub mail_owner: String,
    pub service_status: Vec<String>,
    pub service_stop: Vec<String>,
    pub service_start: Vec<String>,
}

impl Default for ToolsConfig {
    fn default() -> Self {
        Self {
            server_bin: "mariadbd".to_string(),
            client_bin: "mariadb".to_string(),
            prepare_bin: "mariadb-backup".to_string(),
            kv_client_bin: "redis-cli".to_string(),
            doveadm_bin: "doveadm".to_string(),
            mail_owner: "vmail:vmail".to_string(),
            service_status: vec!["systemctl".into(), "is-active".into(), "dovecot".into()],
            service_stop: vec!["systemctl".into(), "stop".into(), "dovecot".into()],
            service_start: vec!["systemctl".into(), "start".into(), "dovecot".into()],
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StagingConfig {
    /// How long to wait for the staged instance to answer queries.
    pub readiness_timeout_secs: u64,
    /// How long to wait for it to exit after SIGTERM before SIGKILL.
    pub shutdown_timeout_secs: u64,
}

impl Default for StagingConfig {
    fn default() -> Self {
        Self {
            readiness_timeout_secs: 120,
            shutdown_timeout_secs: 15,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MxConfig {
    #[serde(default)]
    pub live: LiveStoreConfig,
    #[serde(default)]
    pub paths: PathsConfig,
    #[serde(default)]
    pub tools: ToolsConfig,
    #[serde(default)]
    pub staging: StagingConfig,
}

pub fn load_config() -> Result<MxConfig, figment::Error> {
    let figment = Figment::from(Serialized::defaults(MxConfig::default()))
        .merge(Toml::file("mxrestore.toml"))
        .merge(Env::prefixed("MXR_").split("__"));

    let config: MxConfig = figment.extract()?;

    if config.paths.mail_data_dir.trim().is_empty() {
        return Err(figment::Error::from(
            "paths.mail_data_dir must be set".to_string(),
        ));
    }
    if config.tools.mail_owner.trim().is_empty() {
        return Err(figment::Error::from(
            "tools.mail_owner must be set".to_string(),
        ));
    }

    Ok(config)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_complete() {
        let cfg = MxConfig::default();
        assert_eq!(cfg.tools.client_bin, "mariadb");
        assert_eq!(cfg.live.port, 3306);
        assert!(cfg.staging.readiness_timeout_secs > 0);
        assert!(!cfg.tools.service_stop.is_empty());
    }
}
