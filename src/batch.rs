//
// batch.rs
// Dicom-Intake-rs
//
// Collects every regular file under a directory as one batch submission, reading files in parallel.
//
// Thales Matheus Mendonça Santos - November 2025

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use rayon::prelude::*;
use walkdir::WalkDir;

use crate::service::BatchFile;

/// Regular, non-hidden files under `dir`, sorted by path.
pub fn list_files(dir: &Path) -> Result<Vec<PathBuf>> {
    if !dir.is_dir() {
        bail!("{} is not a directory", dir.display());
    }

    let mut files: Vec<PathBuf> = WalkDir::new(dir)
        .into_iter()
        .filter_entry(|e| e.depth() == 0 || !is_hidden(e.file_name()))
        .filter_map(|e| e.ok())
        .filter(|e| e.file_type().is_file())
        .map(|e| e.into_path())
        .collect();
    files.sort();
    Ok(files)
}

/// Read `paths` concurrently into batch members, keeping the input order.
pub fn read_files(paths: &[PathBuf]) -> Result<Vec<BatchFile>> {
    paths
        .par_iter()
        .map(|path| {
            let bytes =
                fs::read(path).with_context(|| format!("Failed to read {}", path.display()))?;
            let filename = path
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_else(|| "upload".to_string());
            let content_type = mime_guess::from_path(path)
                .first_raw()
                .map(str::to_string);
            Ok(BatchFile {
                filename,
                content_type,
                bytes,
            })
        })
        .collect()
}

pub fn collect_directory(dir: &Path) -> Result<Vec<BatchFile>> {
    let paths = list_files(dir)?;
    tracing::info!(dir = %dir.display(), files = paths.len(), "collected directory");
    read_files(&paths)
}

fn is_hidden(name: &std::ffi::OsStr) -> bool {
    name.to_str().is_some_and(|s| s.starts_with('.'))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn collects_nested_files_and_skips_hidden_ones() {
        let dir = tempdir().expect("tmpdir");
        fs::create_dir_all(dir.path().join("nested")).expect("mkdir");
        fs::create_dir_all(dir.path().join(".cache")).expect("mkdir");
        fs::write(dir.path().join("b.png"), b"png").expect("write");
        fs::write(dir.path().join("nested").join("a.dcm"), b"dcm").expect("write");
        fs::write(dir.path().join(".DS_Store"), b"junk").expect("write");
        fs::write(dir.path().join(".cache").join("c.png"), b"junk").expect("write");

        let files = collect_directory(dir.path()).expect("collect");
        let names: Vec<_> = files.iter().map(|f| f.filename.as_str()).collect();
        assert_eq!(names, vec!["b.png", "a.dcm"]);
        assert_eq!(files[0].content_type.as_deref(), Some("image/png"));
        assert_eq!(files[1].bytes, b"dcm");
    }

    #[test]
    fn rejects_non_directories() {
        let dir = tempdir().expect("tmpdir");
        let file = dir.path().join("x.png");
        fs::write(&file, b"x").expect("write");
        assert!(collect_directory(&file).is_err());
    }
}
