#![forbid(unsafe_code)]

use std::collections::BTreeMap;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use sha2::{Digest, Sha256};

const CACHE_FILE_SCHEMA_VERSION: u8 = 1;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CacheError {
    #[error("local cache io failed: {0}")]
    Io(String),
    #[error("local cache file is corrupt: {0}")]
    Corrupt(String),
    #[error("local cache value could not be encoded: {0}")]
    Encode(String),
}

impl From<io::Error> for CacheError {
    fn from(e: io::Error) -> Self {
        CacheError::Io(e.to_string())
    }
}

/// Durable key-value cache on the device. Values are opaque JSON strings.
pub trait LocalCache: Send {
    fn get(&self, key: &str) -> Result<Option<String>, CacheError>;
    fn put(&mut self, key: &str, value: String) -> Result<(), CacheError>;
    fn remove(&mut self, key: &str) -> Result<bool, CacheError>;
    fn keys_with_prefix(&self, prefix: &str) -> Result<Vec<String>, CacheError>;

    /// Writes several entries. Durable implementations commit them together.
    fn put_many(&mut self, entries: Vec<(String, String)>) -> Result<(), CacheError> {
        for (key, value) in entries {
            self.put(&key, value)?;
        }
        Ok(())
    }
}

#[derive(Debug, Default, Clone)]
pub struct InMemoryLocalCache {
    entries: BTreeMap<String, String>,
}

impl InMemoryLocalCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl LocalCache for InMemoryLocalCache {
    fn get(&self, key: &str) -> Result<Option<String>, CacheError> {
        Ok(self.entries.get(key).cloned())
    }

    fn put(&mut self, key: &str, value: String) -> Result<(), CacheError> {
        self.entries.insert(key.to_string(), value);
        Ok(())
    }

    fn remove(&mut self, key: &str) -> Result<bool, CacheError> {
        Ok(self.entries.remove(key).is_some())
    }

    fn keys_with_prefix(&self, prefix: &str) -> Result<Vec<String>, CacheError> {
        Ok(self
            .entries
            .range(prefix.to_string()..)
            .take_while(|(k, _)| k.starts_with(prefix))
            .map(|(k, _)| k.clone())
            .collect())
    }
}

#[derive(Debug, serde::Serialize, serde::Deserialize)]
struct CacheFileEnvelope {
    schema_version: u8,
    entries_sha256: String,
    entries: BTreeMap<String, String>,
}

/// JSON-file cache that survives process restart. Every mutation rewrites the file through a
/// temp file and rename, so a crash leaves either the old or the new contents.
#[derive(Debug)]
pub struct FileLocalCache {
    path: PathBuf,
    entries: BTreeMap<String, String>,
}

impl FileLocalCache {
    pub fn open(path: impl Into<PathBuf>) -> Result<Self, CacheError> {
        let path = path.into();
        let entries = match fs::read_to_string(&path) {
            Ok(raw) => decode_envelope(&raw)?,
            Err(e) if e.kind() == io::ErrorKind::NotFound => BTreeMap::new(),
            Err(e) => return Err(e.into()),
        };
        Ok(Self { path, entries })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn flush(&self) -> Result<(), CacheError> {
        let envelope = CacheFileEnvelope {
            schema_version: CACHE_FILE_SCHEMA_VERSION,
            entries_sha256: entries_digest_hex(&self.entries)?,
            entries: self.entries.clone(),
        };
        let body =
            serde_json::to_string(&envelope).map_err(|e| CacheError::Encode(e.to_string()))?;
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)?;
            }
        }
        let tmp = self.path.with_extension("tmp");
        fs::write(&tmp, body)?;
        fs::rename(&tmp, &self.path)?;
        Ok(())
    }
}

impl LocalCache for FileLocalCache {
    fn get(&self, key: &str) -> Result<Option<String>, CacheError> {
        Ok(self.entries.get(key).cloned())
    }

    fn put(&mut self, key: &str, value: String) -> Result<(), CacheError> {
        let previous = self.entries.insert(key.to_string(), value);
        if let Err(e) = self.flush() {
            match previous {
                Some(v) => self.entries.insert(key.to_string(), v),
                None => self.entries.remove(key),
            };
            return Err(e);
        }
        Ok(())
    }

    fn remove(&mut self, key: &str) -> Result<bool, CacheError> {
        let Some(previous) = self.entries.remove(key) else {
            return Ok(false);
        };
        if let Err(e) = self.flush() {
            self.entries.insert(key.to_string(), previous);
            return Err(e);
        }
        Ok(true)
    }

    fn keys_with_prefix(&self, prefix: &str) -> Result<Vec<String>, CacheError> {
        Ok(self
            .entries
            .range(prefix.to_string()..)
            .take_while(|(k, _)| k.starts_with(prefix))
            .map(|(k, _)| k.clone())
            .collect())
    }

    fn put_many(&mut self, entries: Vec<(String, String)>) -> Result<(), CacheError> {
        if entries.is_empty() {
            return Ok(());
        }
        let before = self.entries.clone();
        self.entries.extend(entries);
        if let Err(e) = self.flush() {
            self.entries = before;
            return Err(e);
        }
        Ok(())
    }
}

fn entries_digest_hex(entries: &BTreeMap<String, String>) -> Result<String, CacheError> {
    let canonical =
        serde_json::to_vec(entries).map_err(|e| CacheError::Encode(e.to_string()))?;
    let digest = Sha256::digest(&canonical);
    Ok(digest.iter().map(|b| format!("{b:02x}")).collect())
}

fn decode_envelope(raw: &str) -> Result<BTreeMap<String, String>, CacheError> {
    let envelope: CacheFileEnvelope =
        serde_json::from_str(raw).map_err(|e| CacheError::Corrupt(e.to_string()))?;
    if envelope.schema_version != CACHE_FILE_SCHEMA_VERSION {
        return Err(CacheError::Corrupt(format!(
            "unsupported schema_version {}",
            envelope.schema_version
        )));
    }
    if entries_digest_hex(&envelope.entries)? != envelope.entries_sha256 {
        return Err(CacheError::Corrupt("entries digest mismatch".to_string()));
    }
    Ok(envelope.entries)
}
