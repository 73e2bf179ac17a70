//
// validate.rs
// Dicom-Intake-rs
//
// Accepts or rejects raw upload bytes against the configured size limit and file-kind allow-list.
//
// Thales Matheus Mendonça Santos - November 2025

use std::fmt;
use std::path::Path;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::config::ValidationConfig;

/// File kinds the intake pipeline knows how to turn into a DICOM object.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FileKind {
    Dicom,
    Png,
    Jpeg,
    Gif,
    Bmp,
    Tiff,
}

impl FileKind {
    pub const ALL: [FileKind; 6] = [
        FileKind::Dicom,
        FileKind::Png,
        FileKind::Jpeg,
        FileKind::Gif,
        FileKind::Bmp,
        FileKind::Tiff,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            FileKind::Dicom => "dicom",
            FileKind::Png => "png",
            FileKind::Jpeg => "jpeg",
            FileKind::Gif => "gif",
            FileKind::Bmp => "bmp",
            FileKind::Tiff => "tiff",
        }
    }

    /// Recognize a kind from its leading bytes.
    pub fn sniff(bytes: &[u8]) -> Option<Self> {
        if bytes.len() >= 132 && &bytes[128..132] == b"DICM" {
            return Some(FileKind::Dicom);
        }
        if bytes.starts_with(&[0xFF, 0xD8, 0xFF]) {
            Some(FileKind::Jpeg)
        } else if bytes.starts_with(&[0x89, b'P', b'N', b'G']) {
            Some(FileKind::Png)
        } else if bytes.starts_with(b"GIF8") {
            Some(FileKind::Gif)
        } else if bytes.starts_with(b"BM") {
            Some(FileKind::Bmp)
        } else if bytes.starts_with(b"II*\0") || bytes.starts_with(b"MM\0*") {
            Some(FileKind::Tiff)
        } else {
            None
        }
    }

    /// Map a MIME type (parameters allowed) onto a kind.
    pub fn from_mime(mime: &str) -> Option<Self> {
        let essence = mime.split(';').next().unwrap_or_default().trim();
        match essence.to_ascii_lowercase().as_str() {
            "application/dicom" => Some(FileKind::Dicom),
            "image/png" => Some(FileKind::Png),
            "image/jpeg" | "image/jpg" | "image/pjpeg" => Some(FileKind::Jpeg),
            "image/gif" => Some(FileKind::Gif),
            "image/bmp" | "image/x-bmp" | "image/x-ms-bmp" => Some(FileKind::Bmp),
            "image/tiff" => Some(FileKind::Tiff),
            _ => None,
        }
    }

    fn from_filename(filename: &str) -> Option<Self> {
        let ext = Path::new(filename)
            .extension()
            .and_then(|e| e.to_str())
            .map(|e| e.to_ascii_lowercase())?;
        if ext == "dcm" || ext == "dicom" {
            return Some(FileKind::Dicom);
        }
        mime_guess::from_ext(&ext)
            .iter()
            .find_map(|m| FileKind::from_mime(m.essence_str()))
    }
}

impl fmt::Display for FileKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for FileKind {
    type Err = ValidationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        FileKind::ALL
            .into_iter()
            .find(|k| k.as_str() == s)
            .ok_or_else(|| ValidationError::UnsupportedType(s.to_string()))
    }
}

/// Why an upload was rejected before any processing happened.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ValidationError {
    #[error("payload is empty")]
    EmptyPayload,
    #[error("payload of {size} bytes exceeds the {limit} byte limit")]
    SizeExceeded { size: u64, limit: u64 },
    #[error("unsupported file type: {0}")]
    UnsupportedType(String),
}

impl ValidationError {
    /// Stable reason code reported to callers and written to the audit log.
    pub fn code(&self) -> &'static str {
        match self {
            ValidationError::EmptyPayload => "empty-payload",
            ValidationError::SizeExceeded { .. } => "size-exceeded",
            ValidationError::UnsupportedType(_) => "unsupported-type",
        }
    }
}

/// Best-effort kind detection: magic bytes, then declared type, then file extension.
pub fn detect_kind(bytes: &[u8], declared_type: Option<&str>, filename: &str) -> Option<FileKind> {
    FileKind::sniff(bytes)
        .or_else(|| declared_type.and_then(FileKind::from_mime))
        .or_else(|| FileKind::from_filename(filename))
}

#[derive(Debug, Clone)]
pub struct Validator {
    max_bytes: u64,
    allowed: Vec<FileKind>,
    max_batch_files: usize,
}

impl Validator {
    pub fn new(config: &ValidationConfig) -> Self {
        Self {
            max_bytes: config.max_bytes,
            allowed: config.allowed_kinds.clone(),
            max_batch_files: config.max_batch_files,
        }
    }

    pub fn max_batch_files(&self) -> usize {
        self.max_batch_files
    }

    /// Pure check of an upload; no I/O.
    pub fn check(
        &self,
        bytes: &[u8],
        declared_type: Option<&str>,
        filename: &str,
    ) -> Result<FileKind, ValidationError> {
        if bytes.is_empty() {
            return Err(ValidationError::EmptyPayload);
        }
        let size = bytes.len() as u64;
        if size > self.max_bytes {
            return Err(ValidationError::SizeExceeded {
                size,
                limit: self.max_bytes,
            });
        }

        let kind = detect_kind(bytes, declared_type, filename).ok_or_else(|| {
            ValidationError::UnsupportedType(
                declared_type.unwrap_or("unknown").to_string(),
            )
        })?;
        if !self.allowed.contains(&kind) {
            return Err(ValidationError::UnsupportedType(kind.to_string()));
        }
        Ok(kind)
    }
}
