//! Metadata service
//!
//! Key-value storage over an embedded store, used by layers that need
//! durable side metadata (digest indexes, mapping tables). The interface
//! mirrors the classic KV quartet: put, get, delete, close.

use thiserror::Error;

/// Metadata service errors
#[derive(Debug, Error)]
pub enum MetadataError {
    #[error("Failed to open metadata store: {0}")]
    Open(#[source] sled::Error),

    #[error("Metadata operation failed: {0}")]
    Store(#[from] sled::Error),
}

pub type MetadataResult<T> = Result<T, MetadataError>;

/// Embedded key-value store handle.
pub struct MetadataService {
    db: sled::Db,
    /// Background thread count from the config; recorded for operators,
    /// the embedded store manages its own flusher.
    background_threads: usize,
}

impl MetadataService {
    /// Open (or create) the store at `path`.
    ///
    /// `cache_size` bounds the store's in-memory cache in bytes.
    pub fn open(
        path: &str,
        cache_size: Option<u64>,
        threads: Option<usize>,
    ) -> MetadataResult<Self> {
        let mut config = sled::Config::new().path(path);
        if let Some(bytes) = cache_size {
            config = config.cache_capacity(bytes);
        }
        let db = config.open().map_err(MetadataError::Open)?;
        log::info!(
            "[METADATA] store open at {path} (cache_size={:?}, threads={:?})",
            cache_size,
            threads
        );
        Ok(MetadataService {
            db,
            background_threads: threads.unwrap_or(1),
        })
    }

    /// Insert or replace a key-value pair.
    pub fn put(&self, key: &[u8], value: &[u8]) -> MetadataResult<()> {
        self.db.insert(key, value)?;
        Ok(())
    }

    /// Value associated with `key`, if any.
    pub fn get(&self, key: &[u8]) -> MetadataResult<Option<Vec<u8>>> {
        Ok(self.db.get(key)?.map(|v| v.to_vec()))
    }

    /// Remove a key-value pair. Returns whether the key was present.
    pub fn delete(&self, key: &[u8]) -> MetadataResult<bool> {
        Ok(self.db.remove(key)?.is_some())
    }

    /// Configured background thread count.
    pub fn background_threads(&self) -> usize {
        self.background_threads
    }

    /// Flush outstanding writes. Safe to call more than once.
    pub fn close(&self) {
        if let Err(err) = self.db.flush() {
            log::error!("[METADATA] flush on close failed: {err}");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn put_get_delete_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let md = MetadataService::open(dir.path().to_str().unwrap(), None, None).unwrap();

        md.put(b"alpha", b"1").unwrap();
        assert_eq!(md.get(b"alpha").unwrap().as_deref(), Some(&b"1"[..]));

        md.put(b"alpha", b"2").unwrap();
        assert_eq!(md.get(b"alpha").unwrap().as_deref(), Some(&b"2"[..]));

        assert!(md.delete(b"alpha").unwrap());
        assert!(!md.delete(b"alpha").unwrap());
        assert_eq!(md.get(b"alpha").unwrap(), None);

        md.close();
    }
}
