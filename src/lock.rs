//! Per-scope mutual exclusion across invocations.
//!
//! One lock file per scope slug, holding a `{holder, acquired_at}` record.
//! There is no lease or heartbeat: staleness is decided by a liveness check
//! on the recorded holder pid, and a dead holder's lock is reclaimed
//! automatically. The liveness check is injectable so reclamation is
//! testable without spawning processes.

use crate::errors::{RestoreError, RestoreResult};
use crate::scope::Scope;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

/// Capability to decide whether a recorded holder process is still alive.
pub trait ProcessProbe {
    fn is_alive(&self, pid: i32) -> bool;
}

/// Real probe: signal 0 to the recorded pid.
pub struct PidProbe;

#[cfg(unix)]
impl ProcessProbe for PidProbe {
    fn is_alive(&self, pid: i32) -> bool {
        use nix::sys::signal::kill;
        use nix::unistd::Pid;
        kill(Pid::from_raw(pid), None).is_ok()
    }
}

#[cfg(not(unix))]
impl ProcessProbe for PidProbe {
    fn is_alive(&self, _pid: i32) -> bool {
        // Without a cheap liveness check, assume the holder is alive and
        // refuse the lock rather than risk a concurrent restore.
        true
    }
}

#[derive(Debug, Serialize, Deserialize)]
pub struct LockRecord {
    pub holder: i32,
    pub acquired_at: DateTime<Utc>,
}

/// Guard holding the scope lock for the invocation's lifetime.
#[derive(Debug)]
pub struct ScopeLock {
    path: PathBuf,
    released: bool,
}

impl ScopeLock {
    pub fn acquire(
        lock_dir: &Path,
        scope: &Scope,
        probe: &dyn ProcessProbe,
    ) -> RestoreResult<Self> {
        fs::create_dir_all(lock_dir)
            .map_err(|e| RestoreError::io("creating lock directory", e))?;
        let path = lock_dir.join(format!("mxrestore-{}.lock", scope.slug()));

        // Two attempts: the second runs only after a stale lock was
        // reclaimed.
        for _ in 0..2 {
            match fs::OpenOptions::new()
                .write(true)
                .create_new(true)
                .open(&path)
            {
                Ok(mut file) => {
                    let record = LockRecord {
                        holder: std::process::id() as i32,
                        acquired_at: Utc::now(),
                    };
                    file.write_all(serde_json::to_string_pretty(&record)?.as_bytes())
                        .map_err(|e| RestoreError::io("writing lock record", e))?;
                    return Ok(Self {
                        path,
                        released: false,
                    });
                }
                Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => {
                    let holder = read_holder(&path);
                    match holder {
                        Some(record) if probe.is_alive(record.holder) => {
                            return Err(RestoreError::LockHeld {
                                scope: scope.to_string(),
                                holder: record.holder,
                                path: path.display().to_string(),
                            });
                        }
                        _ => {
                            // Dead holder or unreadable record: reclaim.
                            tracing::warn!(lock = %path.display(), "reclaiming stale scope lock");
                            fs::remove_file(&path)
                                .map_err(|e| RestoreError::io("reclaiming stale lock", e))?;
                        }
                    }
                }
                Err(e) => return Err(RestoreError::io("creating lock file", e)),
            }
        }

        Err(RestoreError::LockHeld {
            scope: scope.to_string(),
            holder: 0,
            path: path.display().to_string(),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for ScopeLock {
    fn drop(&mut self) {
        if !self.released {
            let _ = fs::remove_file(&self.path);
            self.released = true;
        }
    }
}

fn read_holder(path: &Path) -> Option<LockRecord> {
    let raw = fs::read_to_string(path).ok()?;
    serde_json::from_str(&raw).ok()
}
