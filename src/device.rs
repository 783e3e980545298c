//! Source device description.
//!
//! Enumeration and vendor lookups happen elsewhere; the pipeline only needs a
//! path, a size fixed at setup, and a few strings for the image metadata.

use std::fs::File;
use std::io::{Seek, SeekFrom};
use std::path::{Path, PathBuf};

use crate::reader::ReaderError;

pub trait Device: Send + Sync {
    fn path(&self) -> &Path;
    /// Size in bytes, established once.
    fn size(&self) -> u64;
    fn serial_number(&self) -> &str;
    fn model(&self) -> &str {
        ""
    }
    /// Free-text description for the acquisition log.
    fn details(&self) -> String;
}

/// A block device or raw image file opened by path.
#[derive(Debug, Clone)]
pub struct RawDevice {
    path:   PathBuf,
    size:   u64,
    serial: String,
    model:  String,
}

impl RawDevice {
    /// Open `path` once to measure it.
    pub fn open(path: impl AsRef<Path>, serial: Option<String>) -> Result<Self, ReaderError> {
        let path = path.as_ref().to_path_buf();
        let mut file = File::open(&path).map_err(|source| ReaderError::Open { path: path.clone(), source })?;
        let size = file
            .seek(SeekFrom::End(0))
            .map_err(|source| ReaderError::Open { path: path.clone(), source })?;
        Ok(Self { path, size, serial: serial.unwrap_or_default(), model: String::new() })
    }

    pub fn with_model(mut self, model: impl Into<String>) -> Self {
        self.model = model.into();
        self
    }
}

impl Device for RawDevice {
    fn path(&self) -> &Path {
        &self.path
    }

    fn size(&self) -> u64 {
        self.size
    }

    fn serial_number(&self) -> &str {
        &self.serial
    }

    fn model(&self) -> &str {
        &self.model
    }

    fn details(&self) -> String {
        let mut out = format!("{} ({} bytes, {} sectors)", self.path.display(), self.size, self.size.div_ceil(512));
        if !self.model.is_empty() {
            out.push_str(&format!(", model {}", self.model));
        }
        if !self.serial.is_empty() {
            out.push_str(&format!(", serial {}", self.serial));
        }
        out
    }
}
