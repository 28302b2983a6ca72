//! Backup bundle access: manifest parsing and logical-asset resolution.
//!
//! A bundle is a directory holding `manifest.json` plus named assets. Each
//! logical asset may be present in one of several on-disk representations
//! (a plain directory, or a tar archive under one of the supported
//! compressions); resolution picks the matching decompression method. An
//! absent asset is a soft skip, not an error — only the database snapshot
//! is mandatory, and the orchestrator enforces that. The bundle is never
//! written to.

use crate::errors::{RestoreError, RestoreResult};
use serde::Deserialize;
use std::fs::File;
use std::io::Read;
use std::path::{Path, PathBuf};

const MANIFEST_FILE: &str = "manifest.json";

/// Bundle manifest. `database` is the logical database name inside the
/// relational snapshot.
#[derive(Debug, Clone, Deserialize)]
pub struct Manifest {
    pub database: String,
    #[serde(default)]
    pub created_at: Option<String>,
}

/// Logical assets a bundle may carry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Asset {
    /// Relational-store snapshot (mandatory).
    Database,
    /// Flat key-value dump holding per-domain signing keys.
    KeyValue,
    /// At-rest encryption key pair archive.
    Secrets,
    /// Bulk mail file tree.
    MailData,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArchiveFormat {
    /// Plain directory, no decompression.
    Dir,
    /// Plain file, read as-is.
    File,
    Tar,
    TarGz,
    TarZst,
}

impl Asset {
    /// Candidate file names in resolution order, most compact first.
    fn candidates(self) -> &'static [(&'static str, ArchiveFormat)] {
        match self {
            Asset::Database => &[
                ("db", ArchiveFormat::Dir),
                ("db.tar.zst", ArchiveFormat::TarZst),
                ("db.tar.gz", ArchiveFormat::TarGz),
                ("db.tar", ArchiveFormat::Tar),
            ],
            Asset::KeyValue => &[("keyvalue.json", ArchiveFormat::File)],
            Asset::Secrets => &[
                ("crypt-keys.tar.zst", ArchiveFormat::TarZst),
                ("crypt-keys.tar.gz", ArchiveFormat::TarGz),
                ("crypt-keys.tar", ArchiveFormat::Tar),
            ],
            Asset::MailData => &[
                ("vmail.tar.zst", ArchiveFormat::TarZst),
                ("vmail.tar.gz", ArchiveFormat::TarGz),
                ("vmail.tar", ArchiveFormat::Tar),
            ],
        }
    }

    pub fn label(self) -> &'static str {
        match self {
            Asset::Database => "database snapshot",
            Asset::KeyValue => "key-value dump",
            Asset::Secrets => "encryption keys",
            Asset::MailData => "mail file tree",
        }
    }
}

/// A located asset together with the method needed to read it.
#[derive(Debug, Clone)]
pub struct ResolvedAsset {
    pub path: PathBuf,
    pub format: ArchiveFormat,
}

#[derive(Debug)]
pub struct BackupBundle {
    root: PathBuf,
    pub manifest: Manifest,
}

impl BackupBundle {
    pub fn open(root: &Path) -> RestoreResult<Self> {
        if !root.is_dir() {
            return Err(RestoreError::config(format!(
                "backup bundle '{}' is not a directory",
                root.display()
            )));
        }
        let manifest_path = root.join(MANIFEST_FILE);
        let raw = std::fs::read_to_string(&manifest_path).map_err(|e| {
            RestoreError::config(format!(
                "cannot read {}: {e}; is this a backup bundle?",
                manifest_path.display()
            ))
        })?;
        let manifest: Manifest = serde_json::from_str(&raw).map_err(|e| {
            RestoreError::config(format!("malformed {}: {e}", manifest_path.display()))
        })?;
        if manifest.database.trim().is_empty() {
            return Err(RestoreError::config(format!(
                "{} does not name a database",
                manifest_path.display()
            )));
        }
        Ok(Self {
            root: root.to_path_buf(),
            manifest,
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Locate a logical asset. `None` means the asset is absent from this
    /// bundle.
    pub fn resolve(&self, asset: Asset) -> Option<ResolvedAsset> {
        for (name, format) in asset.candidates() {
            let path = self.root.join(name);
            let matches = match format {
                ArchiveFormat::Dir => path.is_dir(),
                _ => path.is_file(),
            };
            if matches {
                return Some(ResolvedAsset {
                    path,
                    format: *format,
                });
            }
        }
        None
    }

    /// Streamed reader for a file-backed asset, with decompression chosen by
    /// the resolved format.
    pub fn reader(&self, asset: &ResolvedAsset) -> RestoreResult<Box<dyn Read>> {
        open_archive_reader(&asset.path, asset.format)
    }
}

pub fn open_archive_reader(path: &Path, format: ArchiveFormat) -> RestoreResult<Box<dyn Read>> {
    let file = File::open(path)
        .map_err(|e| RestoreError::io(format!("opening {}", path.display()), e))?;
    match format {
        ArchiveFormat::Dir => Err(RestoreError::config(format!(
            "{} is a directory, not an archive",
            path.display()
        ))),
        ArchiveFormat::File | ArchiveFormat::Tar => Ok(Box::new(file)),
        ArchiveFormat::TarGz => Ok(Box::new(flate2::read::GzDecoder::new(file))),
        ArchiveFormat::TarZst => {
            let decoder = zstd::Decoder::new(file)
                .map_err(|e| RestoreError::io(format!("opening {}", path.display()), e))?;
            Ok(Box::new(decoder))
        }
    }
}
