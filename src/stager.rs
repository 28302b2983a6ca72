//! Ephemeral staged instance of the relational store.
//!
//! Materializes the bundle's database snapshot into an isolated temp
//! directory, runs the snapshot tool's idempotent prepare pass, then brings
//! up a throwaway server bound to a local socket with networking disabled.
//! The instance exists only to answer the extractor's read-side queries.
//!
//! `StagedInstance` is a guard: teardown (server shutdown plus staging-dir
//! removal) runs on every exit path, including mid-staging failures.

use crate::bundle::{ArchiveFormat, Asset, BackupBundle};
use crate::config_loader::MxConfig;
use crate::errors::{RestoreError, RestoreResult};
use crate::sql::{SqlEndpoint, SqlExec, SqlRunner};
use std::fs;
use std::path::{Path, PathBuf};
use std::process::{Child, Command, Stdio};
use std::time::{Duration, Instant};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StageState {
    Materializing,
    Preparing,
    Starting,
    Ready,
    Failed,
    TornDown,
}

pub struct StagedInstance {
    workdir: tempfile::TempDir,
    datadir: PathBuf,
    socket: PathBuf,
    error_log: PathBuf,
    child: Option<Child>,
    state: StageState,
    database: String,
    client_bin: String,
    shutdown_timeout: Duration,
}

impl StagedInstance {
    /// Materialize the database asset and bring the staged server up to
    /// readiness. Any failure tears down whatever was started.
    pub fn stage(cfg: &MxConfig, bundle: &BackupBundle) -> RestoreResult<Self> {
        let workdir = tempfile::Builder::new()
            .prefix("mxrestore-stage-")
            .tempdir()
            .map_err(|e| RestoreError::io("creating staging directory", e))?;
        let datadir = workdir.path().join("data");
        let socket = workdir.path().join("staged.sock");
        let error_log = workdir.path().join("staged.err");

        let mut inst = Self {
            workdir,
            datadir,
            socket,
            error_log,
            child: None,
            state: StageState::Materializing,
            database: bundle.manifest.database.clone(),
            client_bin: cfg.tools.client_bin.clone(),
            shutdown_timeout: Duration::from_secs(cfg.staging.shutdown_timeout_secs),
        };

        match inst.bring_up(cfg, bundle) {
            Ok(()) => {
                inst.state = StageState::Ready;
                Ok(inst)
            }
            Err(e) => {
                inst.state = StageState::Failed;
                inst.teardown();
                Err(e)
            }
        }
    }

    pub fn state(&self) -> StageState {
        self.state
    }

    /// Client bound to the staged socket and the bundle's logical database.
    pub fn sql(&self) -> SqlRunner {
        SqlRunner::new(
            &self.client_bin,
            SqlEndpoint::Socket {
                path: self.socket.clone(),
            },
            Some(&self.database),
        )
    }

    fn bring_up(&mut self, cfg: &MxConfig, bundle: &BackupBundle) -> RestoreResult<()> {
        let asset = bundle.resolve(Asset::Database).ok_or_else(|| {
            RestoreError::staging(format!(
                "backup bundle '{}' has no database snapshot",
                bundle.root().display()
            ))
        })?;

        fs::create_dir_all(&self.datadir)
            .map_err(|e| RestoreError::io("creating staged data directory", e))?;

        match asset.format {
            ArchiveFormat::Dir => copy_dir_recursive(&asset.path, &self.datadir)?,
            ArchiveFormat::Tar | ArchiveFormat::TarGz | ArchiveFormat::TarZst => {
                let reader = bundle.reader(&asset)?;
                tar::Archive::new(reader)
                    .unpack(&self.datadir)
                    .map_err(|e| {
                        RestoreError::staging(format!(
                            "extracting {}: {e}",
                            asset.path.display()
                        ))
                    })?;
            }
            ArchiveFormat::File => {
                return Err(RestoreError::staging(format!(
                    "{} is not a database snapshot",
                    asset.path.display()
                )));
            }
        }
        self.datadir = resolve_datadir(&self.datadir);

        // Prepare pass applies pending redo logs; re-running it on already
        // consistent data is a no-op.
        self.state = StageState::Preparing;
        let prepare = Command::new(&cfg.tools.prepare_bin)
            .arg("--prepare")
            .arg(format!("--target-dir={}", self.datadir.display()))
            .output()
            .map_err(|e| {
                RestoreError::io(format!("running {}", cfg.tools.prepare_bin), e)
            })?;
        if !prepare.status.success() {
            return Err(RestoreError::staging(format!(
                "snapshot prepare pass failed:\n{}",
                String::from_utf8_lossy(&prepare.stderr)
            )));
        }

        self.state = StageState::Starting;
        let child = Command::new(&cfg.tools.server_bin)
            .arg("--no-defaults")
            .arg(format!("--datadir={}", self.datadir.display()))
            .arg(format!("--socket={}", self.socket.display()))
            .arg(format!("--log-error={}", self.error_log.display()))
            .arg(format!(
                "--pid-file={}",
                self.workdir.path().join("staged.pid").display()
            ))
            .arg("--skip-networking")
            .arg("--skip-grant-tables")
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .spawn()
            .map_err(|e| RestoreError::io(format!("starting {}", cfg.tools.server_bin), e))?;
        self.child = Some(child);

        self.wait_ready(Duration::from_secs(cfg.staging.readiness_timeout_secs))?;
        self.verify_database()
    }

    fn wait_ready(&mut self, timeout: Duration) -> RestoreResult<()> {
        let probe = SqlRunner::new(
            &self.client_bin,
            SqlEndpoint::Socket {
                path: self.socket.clone(),
            },
            None,
        );
        let deadline = Instant::now() + timeout;

        loop {
            if let Some(child) = self.child.as_mut() {
                if let Ok(Some(status)) = child.try_wait() {
                    return Err(RestoreError::staging(format!(
                        "staged server exited early ({status}); log tail:\n{}",
                        log_tail(&self.error_log, 20)
                    )));
                }
            }
            if probe.query("SELECT 1").is_ok() {
                return Ok(());
            }
            if Instant::now() >= deadline {
                return Err(RestoreError::staging(format!(
                    "staged server did not become ready within {}s; log tail:\n{}",
                    timeout.as_secs(),
                    log_tail(&self.error_log, 20)
                )));
            }
            std::thread::sleep(Duration::from_secs(1));
        }
    }

    fn verify_database(&self) -> RestoreResult<()> {
        let probe = SqlRunner::new(
            &self.client_bin,
            SqlEndpoint::Socket {
                path: self.socket.clone(),
            },
            None,
        );
        let rows = probe.query("SHOW DATABASES")?;
        let found = rows
            .iter()
            .any(|row| row.first().and_then(|f| f.as_deref()) == Some(self.database.as_str()));
        if !found {
            return Err(RestoreError::staging(format!(
                "staged snapshot does not contain database '{}'",
                self.database
            )));
        }
        Ok(())
    }

    fn teardown(&mut self) {
        if self.state == StageState::TornDown {
            return;
        }
        if let Some(mut child) = self.child.take() {
            terminate(&mut child, self.shutdown_timeout);
        }
        self.state = StageState::TornDown;
        // The staging directory itself is removed by TempDir's Drop.
    }
}

impl Drop for StagedInstance {
    fn drop(&mut self) {
        self.teardown();
    }
}

#[cfg(unix)]
fn terminate(child: &mut Child, timeout: Duration) {
    use nix::sys::signal::{kill, Signal};
    use nix::unistd::Pid;

    let pid = Pid::from_raw(child.id() as i32);
    let _ = kill(pid, Signal::SIGTERM);
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if matches!(child.try_wait(), Ok(Some(_))) {
            return;
        }
        std::thread::sleep(Duration::from_millis(200));
    }
    let _ = child.kill();
    let _ = child.wait();
}

#[cfg(not(unix))]
fn terminate(child: &mut Child, _timeout: Duration) {
    let _ = child.kill();
    let _ = child.wait();
}

/// Snapshot tools sometimes wrap the data directory in a single top-level
/// folder; descend into it when that is the only entry.
fn resolve_datadir(dir: &Path) -> PathBuf {
    let entries: Vec<_> = match fs::read_dir(dir) {
        Ok(rd) => rd.filter_map(|e| e.ok()).collect(),
        Err(_) => return dir.to_path_buf(),
    };
    if entries.len() == 1 && entries[0].path().is_dir() {
        return entries[0].path();
    }
    dir.to_path_buf()
}

fn copy_dir_recursive(src: &Path, dest: &Path) -> RestoreResult<()> {
    fs::create_dir_all(dest).map_err(|e| RestoreError::io("creating staging subdir", e))?;
    for entry in
        fs::read_dir(src).map_err(|e| RestoreError::io(format!("reading {}", src.display()), e))?
    {
        let entry = entry.map_err(|e| RestoreError::io("reading snapshot entry", e))?;
        let target = dest.join(entry.file_name());
        if entry.path().is_dir() {
            copy_dir_recursive(&entry.path(), &target)?;
        } else {
            fs::copy(entry.path(), &target).map_err(|e| {
                RestoreError::io(format!("copying {}", entry.path().display()), e)
            })?;
        }
    }
    Ok(())
}

fn log_tail(path: &Path, lines: usize) -> String {
    match fs::read_to_string(path) {
        Ok(content) => {
            let all: Vec<&str> = content.lines().collect();
            let start = all.len().saturating_sub(lines);
            all[start..].join("\n")
        }
        Err(_) => "(no server log captured)".to_string(),
    }
}
