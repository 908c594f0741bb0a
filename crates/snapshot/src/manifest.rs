//! File manifests for snapshots whose state lives in loose files.

use common::{SmError, SmResult};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

/// A file that must travel with a snapshot stream.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SnapshotFile {
    pub file_id: u64,
    pub path: PathBuf,
    /// Opaque bytes owned by the state machine that produced the file.
    pub metadata: Vec<u8>,
}

impl SnapshotFile {
    /// File name component of the path, used when relocating.
    pub fn file_name(&self) -> SmResult<&std::ffi::OsStr> {
        self.path.file_name().ok_or_else(|| {
            SmError::Snapshot(format!("manifest path {} has no file name", self.path.display()))
        })
    }
}

/// Ordered list of files collected by a snapshot save.
///
/// File ids are unique within one manifest.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileManifest {
    files: Vec<SnapshotFile>,
}

impl FileManifest {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a file. Rejects a file id that is already present.
    pub fn add_file(
        &mut self,
        file_id: u64,
        path: impl Into<PathBuf>,
        metadata: impl Into<Vec<u8>>,
    ) -> SmResult<()> {
        if self.get(file_id).is_some() {
            return Err(SmError::Snapshot(format!(
                "file id {file_id} already in manifest"
            )));
        }
        self.files.push(SnapshotFile {
            file_id,
            path: path.into(),
            metadata: metadata.into(),
        });
        Ok(())
    }

    pub fn files(&self) -> &[SnapshotFile] {
        &self.files
    }

    pub fn get(&self, file_id: u64) -> Option<&SnapshotFile> {
        self.files.iter().find(|f| f.file_id == file_id)
    }

    pub fn len(&self) -> usize {
        self.files.len()
    }

    pub fn is_empty(&self) -> bool {
        self.files.is_empty()
    }

    /// Every referenced file must exist before recovery may start.
    pub fn validate_present(&self) -> SmResult<()> {
        for file in &self.files {
            if !file.path.is_file() {
                return Err(SmError::MissingFile(file.path.clone()));
            }
        }
        Ok(())
    }

    /// Copy every file into `dir`, returning a manifest that points at the copies.
    pub fn copy_into(&self, dir: impl AsRef<Path>) -> SmResult<FileManifest> {
        let dir = dir.as_ref();
        fs::create_dir_all(dir)?;
        let mut relocated = FileManifest::new();
        for file in &self.files {
            let target = dir.join(file.file_name()?);
            fs::copy(&file.path, &target).map_err(|e| {
                if e.kind() == std::io::ErrorKind::NotFound {
                    SmError::MissingFile(file.path.clone())
                } else {
                    SmError::Io(e)
                }
            })?;
            relocated.add_file(file.file_id, target, file.metadata.clone())?;
        }
        Ok(relocated)
    }

    /// Point every entry at a file of the same name under `dir`.
    ///
    /// Used after a transport has placed the files locally.
    pub fn relocate(&self, dir: impl AsRef<Path>) -> SmResult<FileManifest> {
        let dir = dir.as_ref();
        let mut relocated = FileManifest::new();
        for file in &self.files {
            relocated.add_file(file.file_id, dir.join(file.file_name()?), file.metadata.clone())?;
        }
        Ok(relocated)
    }
}
