//
// storage.rs
// Dicom-Intake-rs
//
// Artifact file store: one sealed file per upload lease, written atomically, with path sanitization and a traversal guard.
//
// Thales Matheus Mendonça Santos - November 2025

use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};

const LEASE_TAG_LEN: usize = 12;

#[derive(Debug, Clone)]
pub struct FileStore {
    root: PathBuf,
}

impl FileStore {
    pub fn new(root: impl AsRef<Path>) -> Result<Self> {
        let root = root.as_ref().to_path_buf();
        fs::create_dir_all(&root)
            .with_context(|| format!("Failed to create artifact directory {}", root.display()))?;
        Ok(Self { root })
    }

    /// Stored name of an upload's artifact, tagged with the lease that wrote it.
    /// Encrypted artifacts get a `.enc` suffix.
    pub fn artifact_name(upload_id: &str, lease_id: &str, encrypted: bool) -> String {
        let stem = sanitize_filename(upload_id);
        let stem = if stem.is_empty() { "artifact".to_string() } else { stem };
        let tag: String = sanitize_filename(lease_id).chars().take(LEASE_TAG_LEN).collect();
        let stem = if tag.is_empty() { stem } else { format!("{stem}-{tag}") };
        if encrypted {
            format!("{stem}.dcm.enc")
        } else {
            format!("{stem}.dcm")
        }
    }

    /// Write `bytes` under the artifact name and return that name.
    ///
    /// Bytes land in a temporary sibling first and are renamed into place, so a reader
    /// never sees a half-written artifact. Saving again under the same lease replaces the file.
    pub fn save(&self, upload_id: &str, lease_id: &str, encrypted: bool, bytes: &[u8]) -> Result<String> {
        let filename = Self::artifact_name(upload_id, lease_id, encrypted);
        let target = self.root.join(&filename);
        let tmp = self
            .root
            .join(format!(".{}.{}.tmp", filename, uuid::Uuid::new_v4().simple()));

        fs::write(&tmp, bytes)
            .with_context(|| format!("Failed to write artifact {}", tmp.display()))?;
        if let Err(err) = fs::rename(&tmp, &target) {
            let _ = fs::remove_file(&tmp);
            return Err(err)
                .with_context(|| format!("Failed to move artifact into {}", target.display()));
        }
        Ok(filename)
    }

    pub fn read(&self, name: &str) -> Result<Vec<u8>> {
        let path = self.resolve(name)?;
        fs::read(&path).with_context(|| format!("Failed to read artifact {}", path.display()))
    }

    /// Delete a stored artifact. Missing files are not an error.
    pub fn remove(&self, name: &str) -> Result<()> {
        match fs::remove_file(self.root.join(name)) {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == ErrorKind::NotFound => Ok(()),
            Err(err) => Err(err).with_context(|| format!("Failed to remove artifact {name}")),
        }
    }

    pub fn resolve(&self, name: &str) -> Result<PathBuf> {
        let candidate = self.root.join(name);
        let canonical_root = self
            .root
            .canonicalize()
            .unwrap_or_else(|_| self.root.clone());
        let canonical = candidate
            .canonicalize()
            .context("Requested artifact not found")?;
        if !canonical.starts_with(&canonical_root) {
            bail!("Attempt to access file outside storage root");
        }
        Ok(canonical)
    }
}

fn sanitize_filename(input: &str) -> String {
    input
        .chars()
        .filter(|c| c.is_ascii_alphanumeric() || *c == '-' || *c == '_')
        .collect()
}
