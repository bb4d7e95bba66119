//! Trace artifact storage
//!
//! Partial saves go to sequentially numbered files next to the trace file
//! (`trace00001.json`, `trace00002.json`, ...); the final save on close goes
//! to the trace file itself. Artifacts are optionally zstd-compressed, which
//! appends `.zst` to every name.

use crate::recording::compressor::{CompressionLevel, Compressor};
use crate::utils::errors::{Result, TraceError};
use serde::Serialize;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use tracing::{debug, info};

/// Generates `<prefix>NNNNN<suffix>` names in one directory
#[derive(Debug)]
pub struct FileNameGenerator {
    dir: PathBuf,
    prefix: String,
    suffix: String,
    counter: AtomicU32,
}

impl FileNameGenerator {
    pub fn new(dir: impl Into<PathBuf>, prefix: impl Into<String>, suffix: impl Into<String>) -> Self {
        Self {
            dir: dir.into(),
            prefix: prefix.into(),
            suffix: suffix.into(),
            counter: AtomicU32::new(0),
        }
    }

    /// Next file name; the first call yields number 1
    pub fn next_file(&self) -> PathBuf {
        let n = self.counter.fetch_add(1, Ordering::Relaxed) + 1;
        self.dir
            .join(format!("{}{:05}{}", self.prefix, n, self.suffix))
    }
}

/// Storage configuration
#[derive(Debug, Clone)]
pub struct StorageConfig {
    /// Path of the final trace; partial saves are named after it
    pub trace_file: PathBuf,

    /// Compress artifacts with zstd
    pub compression: Option<CompressionLevel>,
}

/// Storage statistics
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct StorageStats {
    pub artifacts_written: u64,
    pub bytes_written: u64,
}

/// Writes rendered traces to disk
#[derive(Debug)]
pub struct TraceStorage {
    trace_file: PathBuf,
    names: FileNameGenerator,
    compressor: Option<Compressor>,
    artifacts_written: AtomicU64,
    bytes_written: AtomicU64,
}

impl TraceStorage {
    pub fn new(config: StorageConfig) -> Self {
        let dir = config
            .trace_file
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or_default();
        let prefix = config
            .trace_file
            .file_stem()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_else(|| "trace".to_string());
        let mut suffix = config
            .trace_file
            .extension()
            .map(|e| format!(".{}", e.to_string_lossy()))
            .unwrap_or_default();

        let mut trace_file = config.trace_file;
        if config.compression.is_some() {
            suffix.push_str(".zst");
            trace_file = append_extension(&trace_file, "zst");
        }

        info!("Trace storage initialized at {:?}", trace_file);

        Self {
            trace_file,
            names: FileNameGenerator::new(dir, prefix, suffix),
            compressor: config.compression.map(Compressor::new),
            artifacts_written: AtomicU64::new(0),
            bytes_written: AtomicU64::new(0),
        }
    }

    /// Path the next partial save is written to
    pub fn next_artifact(&self) -> PathBuf {
        self.names.next_file()
    }

    /// Path of the final trace
    pub fn final_artifact(&self) -> &Path {
        &self.trace_file
    }

    /// Write a rendered trace to `path`, compressing it if configured
    ///
    /// Returns the number of bytes written.
    pub fn write(&self, path: &Path, rendered: Vec<u8>) -> Result<u64> {
        if let Some(dir) = path.parent().filter(|d| !d.as_os_str().is_empty()) {
            fs::create_dir_all(dir).map_err(|e| {
                TraceError::StorageFailed(format!("Failed to create directory {:?}: {}", dir, e))
            })?;
        }

        let data = match &self.compressor {
            Some(compressor) => compressor.compress(&rendered)?,
            None => rendered,
        };

        fs::write(path, &data).map_err(|e| {
            TraceError::StorageFailed(format!("Failed to write trace {:?}: {}", path, e))
        })?;

        let size = data.len() as u64;
        self.artifacts_written.fetch_add(1, Ordering::Relaxed);
        self.bytes_written.fetch_add(size, Ordering::Relaxed);
        debug!("Wrote trace {:?} ({} bytes)", path, size);

        Ok(size)
    }

    /// Read an artifact back, decompressing it if needed
    pub fn read(&self, path: &Path) -> Result<Vec<u8>> {
        let data = fs::read(path).map_err(|e| {
            TraceError::StorageFailed(format!("Failed to read trace {:?}: {}", path, e))
        })?;

        match &self.compressor {
            Some(compressor) => compressor.decompress(&data),
            None => Ok(data),
        }
    }

    pub fn stats(&self) -> StorageStats {
        StorageStats {
            artifacts_written: self.artifacts_written.load(Ordering::Relaxed),
            bytes_written: self.bytes_written.load(Ordering::Relaxed),
        }
    }
}

fn append_extension(path: &Path, ext: &str) -> PathBuf {
    let mut name = path.as_os_str().to_owned();
    name.push(".");
    name.push(ext);
    PathBuf::from(name)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_sequential_file_names() {
        let seq = FileNameGenerator::new(".", "ABC", ".txt");
        assert_eq!(seq.next_file(), Path::new(".").join("ABC00001.txt"));
        assert_eq!(seq.next_file(), Path::new(".").join("ABC00002.txt"));
        assert_eq!(seq.next_file(), Path::new(".").join("ABC00003.txt"));

        let seq2 = FileNameGenerator::new(".", "ABC", ".txt.zst");
        assert_eq!(seq2.next_file(), Path::new(".").join("ABC00001.txt.zst"));
        assert_eq!(seq2.next_file(), Path::new(".").join("ABC00002.txt.zst"));
    }

    #[test]
    fn test_artifacts_named_after_trace_file() {
        let dir = tempdir().unwrap();
        let storage = TraceStorage::new(StorageConfig {
            trace_file: dir.path().join("trace.json"),
            compression: None,
        });

        assert_eq!(storage.next_artifact(), dir.path().join("trace00001.json"));
        assert_eq!(storage.next_artifact(), dir.path().join("trace00002.json"));
        assert_eq!(storage.final_artifact(), dir.path().join("trace.json"));
    }

    #[test]
    fn test_write_creates_directories() {
        let dir = tempdir().unwrap();
        let storage = TraceStorage::new(StorageConfig {
            trace_file: dir.path().join("out/nested/trace.txt"),
            compression: None,
        });

        let path = storage.next_artifact();
        let written = storage.write(&path, b"cname,mname\n".to_vec()).unwrap();

        assert_eq!(written, 12);
        assert_eq!(fs::read(&path).unwrap(), b"cname,mname\n");
        assert_eq!(
            storage.stats(),
            StorageStats {
                artifacts_written: 1,
                bytes_written: 12
            }
        );
    }

    #[test]
    fn test_compressed_artifacts() {
        let dir = tempdir().unwrap();
        let storage = TraceStorage::new(StorageConfig {
            trace_file: dir.path().join("trace.txt"),
            compression: Some(CompressionLevel::Fast),
        });

        assert_eq!(storage.final_artifact(), dir.path().join("trace.txt.zst"));
        let path = storage.next_artifact();
        assert_eq!(path, dir.path().join("trace00001.txt.zst"));

        let rendered = b"Foo,run,()V\n".repeat(200);
        let written = storage.write(&path, rendered.clone()).unwrap();
        assert!((written as usize) < rendered.len());
        assert_eq!(storage.read(&path).unwrap(), rendered);
    }

    #[test]
    fn test_write_failure_is_reported() {
        let dir = tempdir().unwrap();
        let blocker = dir.path().join("blocker");
        fs::write(&blocker, b"").unwrap();

        let storage = TraceStorage::new(StorageConfig {
            trace_file: blocker.join("trace.txt"),
            compression: None,
        });
        let err = storage
            .write(storage.final_artifact(), b"x".to_vec())
            .unwrap_err();
        assert!(matches!(err, TraceError::StorageFailed(_)));
        assert_eq!(storage.stats().artifacts_written, 0);
    }
}
