//! Durable key/value storage for anchors and world snapshots

use crate::validation::{StorageError, StorageResult};
use std::collections::HashMap;
use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;

/// Byte-oriented key/value store, local or cloud backed
pub trait PersistentKv: Send + Sync {
    fn save(&self, key: &str, bytes: &[u8]) -> StorageResult<()>;

    /// `Ok(None)` when nothing was ever saved under `key`
    fn load(&self, key: &str) -> StorageResult<Option<Vec<u8>>>;
}

/// In-process store; also counts writes so callers can observe persistence
#[derive(Default)]
pub struct MemoryKv {
    entries: Mutex<HashMap<String, Vec<u8>>>,
    save_count: AtomicUsize,
    fail_saves: Mutex<bool>,
}

impl MemoryKv {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of successful `save` calls
    pub fn save_count(&self) -> usize {
        self.save_count.load(Ordering::SeqCst)
    }

    pub fn contains(&self, key: &str) -> bool {
        self.entries
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .contains_key(key)
    }

    /// Make every subsequent save fail, to exercise storage error paths
    pub fn set_fail_saves(&self, fail: bool) {
        *self.fail_saves.lock().unwrap_or_else(|e| e.into_inner()) = fail;
    }
}

impl PersistentKv for MemoryKv {
    fn save(&self, key: &str, bytes: &[u8]) -> StorageResult<()> {
        if *self.fail_saves.lock().unwrap_or_else(|e| e.into_inner()) {
            return Err(StorageError::Unavailable {
                reason: "memory store configured to fail".to_string(),
            });
        }

        self.entries
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(key.to_string(), bytes.to_vec());
        self.save_count.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn load(&self, key: &str) -> StorageResult<Option<Vec<u8>>> {
        Ok(self
            .entries
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(key)
            .cloned())
    }
}

/// One file per key under a root directory
pub struct FileKv {
    root: PathBuf,
}

impl FileKv {
    pub fn new<P: AsRef<Path>>(root: P) -> Self {
        Self {
            root: root.as_ref().to_path_buf(),
        }
    }

    /// One file name per key: ASCII alphanumerics, `-` and `.` are kept,
    /// every other byte (`_` included) becomes `_` plus two hex digits
    fn path_for(&self, key: &str) -> PathBuf {
        let mut file_name = String::with_capacity(key.len());
        for byte in key.bytes() {
            if byte.is_ascii_alphanumeric() || byte == b'-' || byte == b'.' {
                file_name.push(byte as char);
            } else {
                file_name.push_str(&format!("_{:02x}", byte));
            }
        }
        self.root.join(format!("{}.bin", file_name))
    }
}

impl PersistentKv for FileKv {
    fn save(&self, key: &str, bytes: &[u8]) -> StorageResult<()> {
        let io_err = |e: std::io::Error| StorageError::Io {
            key: key.to_string(),
            message: e.to_string(),
        };

        fs::create_dir_all(&self.root).map_err(io_err)?;

        // Write then rename so a crash never leaves a truncated record
        let path = self.path_for(key);
        let tmp = path.with_extension("tmp");
        fs::write(&tmp, bytes).map_err(io_err)?;
        fs::rename(&tmp, &path).map_err(io_err)
    }

    fn load(&self, key: &str) -> StorageResult<Option<Vec<u8>>> {
        match fs::read(self.path_for(key)) {
            Ok(bytes) => Ok(Some(bytes)),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
            Err(e) => Err(StorageError::Io {
                key: key.to_string(),
                message: e.to_string(),
            }),
        }
    }
}
