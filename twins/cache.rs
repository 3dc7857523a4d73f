//! Content-addressed store for fitted stage results.
//!
//! Keys are blake3 digests of `;`-joined identity fields (dataset identity,
//! model identity, configuration). Values are TOML documents, one file per key.
//! A read that fails for any reason is a miss: a truncated file left by an
//! interrupted write simply triggers a recomputation.

use serde::Serialize;
use serde::de::DeserializeOwned;
use std::fs;
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum CacheError {
    #[error("Failed to write cache entry: {0}")]
    IoError(#[from] std::io::Error),
    #[error("Failed to serialize cache entry to TOML: {0}")]
    TomlSerializeError(#[from] toml::ser::Error),
}

/// Whether a stage result was computed in this run or read back from disk.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheStatus {
    Hit,
    Computed,
}

/// A stage result together with the key it is stored under.
#[derive(Debug, Clone)]
pub struct Cached<T> {
    pub value: T,
    pub hash: String,
    pub status: CacheStatus,
}

/// Digest of a single string.
pub fn hash_text(text: &str) -> String {
    blake3::hash(text.as_bytes()).to_hex().to_string()
}

/// Digest of an ordered list of fields, joined deterministically.
pub fn hash_fields<S: AsRef<str>>(fields: &[S]) -> String {
    let mut hasher = blake3::Hasher::new();
    for (idx, field) in fields.iter().enumerate() {
        if idx > 0 {
            hasher.update(b";");
        }
        hasher.update(field.as_ref().as_bytes());
    }
    hasher.finalize().to_hex().to_string()
}

/// Directory-backed result cache.
#[derive(Debug, Clone)]
pub struct ResultCache {
    directory: PathBuf,
}

impl ResultCache {
    pub fn new(directory: impl AsRef<Path>) -> Self {
        Self {
            directory: directory.as_ref().to_path_buf(),
        }
    }

    pub fn directory(&self) -> &Path {
        &self.directory
    }

    fn entry_path(&self, hash: &str) -> PathBuf {
        self.directory.join(format!("{hash}.toml"))
    }

    /// Returns the stored value, or `None` on a miss or unreadable entry.
    pub fn load<T: DeserializeOwned>(&self, hash: &str) -> Option<T> {
        let path = self.entry_path(hash);
        let text = match fs::read_to_string(&path) {
            Ok(text) => text,
            Err(err) => {
                log::debug!("Cache miss for {hash}: {err}");
                return None;
            }
        };
        match toml::from_str(&text) {
            Ok(value) => {
                log::info!("Loaded cached result {hash}");
                Some(value)
            }
            Err(err) => {
                log::debug!("Discarding unreadable cache entry {}: {err}", path.display());
                None
            }
        }
    }

    /// Persists a value under `hash`. Not transactional.
    pub fn save<T: Serialize>(&self, hash: &str, value: &T) -> Result<(), CacheError> {
        fs::create_dir_all(&self.directory)?;
        let toml_string = toml::to_string(value)?;
        let mut file = BufWriter::new(fs::File::create(self.entry_path(hash))?);
        file.write_all(toml_string.as_bytes())?;
        file.flush()?;
        log::debug!("Saved cache entry {hash}");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;

    #[derive(Debug, PartialEq, Serialize, Deserialize)]
    struct Entry {
        value: f64,
        values: Vec<f64>,
    }

    #[test]
    fn hash_fields_is_order_sensitive() {
        assert_eq!(hash_fields(&["a", "b"]), hash_fields(&["a", "b"]));
        assert_ne!(hash_fields(&["a", "b"]), hash_fields(&["b", "a"]));
        assert_ne!(hash_fields(&["ab"]), hash_fields(&["a", "b"]));
    }

    #[test]
    fn save_then_load_is_exact() {
        let dir = tempfile::tempdir().unwrap();
        let cache = ResultCache::new(dir.path());
        let entry = Entry {
            value: 0.1 + 0.2,
            values: vec![1.0 / 3.0, -2.5e-17, f64::MAX],
        };
        cache.save("k", &entry).unwrap();
        let loaded: Entry = cache.load("k").unwrap();
        assert_eq!(loaded, entry);
        for (a, b) in loaded.values.iter().zip(entry.values.iter()) {
            assert_eq!(a.to_bits(), b.to_bits());
        }
    }

    #[test]
    fn missing_and_corrupt_entries_are_misses() {
        let dir = tempfile::tempdir().unwrap();
        let cache = ResultCache::new(dir.path());
        assert!(cache.load::<Entry>("absent").is_none());

        fs::write(dir.path().join("broken.toml"), "value = [unterminated").unwrap();
        assert!(cache.load::<Entry>("broken").is_none());
    }
}
