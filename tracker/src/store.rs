use std::{
    collections::HashMap,
    fs, io,
    path::{Path, PathBuf},
    sync::{Mutex, PoisonError},
};
use thiserror::Error;

pub const TOKEN_SETS_KEY: &str = "tokenSets";
pub const BALANCE_CACHE_KEY: &str = "balanceCache";

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("Invalid store key `{0}`")]
    InvalidKey(String),
    #[error(transparent)]
    Io(#[from] io::Error),
    #[error(transparent)]
    Json(#[from] serde_json::Error),
}

/// Key-value persistence for the registry and the balance cache. Values are
/// JSON documents.
pub trait StateStore: Send + Sync {
    fn get(&self, key: &str) -> Result<Option<String>, StoreError>;

    fn set(&self, key: &str, value: &str) -> Result<(), StoreError>;
}

#[derive(Default)]
pub struct MemoryStore {
    values: Mutex<HashMap<String, String>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl StateStore for MemoryStore {
    fn get(&self, key: &str) -> Result<Option<String>, StoreError> {
        Ok(self
            .values
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(key)
            .cloned())
    }

    fn set(&self, key: &str, value: &str) -> Result<(), StoreError> {
        self.values
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(key.to_string(), value.to_string());

        Ok(())
    }
}

/// One `<key>.json` file per key inside a directory.
pub struct FileStore {
    dir: PathBuf,
    // serializes writers of the same directory
    write_lock: Mutex<()>,
}

impl FileStore {
    pub fn new(dir: impl AsRef<Path>) -> Result<Self, StoreError> {
        fs::create_dir_all(dir.as_ref())?;

        Ok(Self {
            dir: dir.as_ref().to_path_buf(),
            write_lock: Mutex::new(()),
        })
    }

    fn path(&self, key: &str) -> Result<PathBuf, StoreError> {
        if key.is_empty() || !key.chars().all(|c| c.is_ascii_alphanumeric() || c == '_') {
            return Err(StoreError::InvalidKey(key.to_string()));
        }

        Ok(self.dir.join(format!("{key}.json")))
    }
}

impl StateStore for FileStore {
    fn get(&self, key: &str) -> Result<Option<String>, StoreError> {
        match fs::read_to_string(self.path(key)?) {
            Ok(value) => Ok(Some(value)),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    fn set(&self, key: &str, value: &str) -> Result<(), StoreError> {
        let path = self.path(key)?;
        let tmp = path.with_extension("json.tmp");
        let _guard = self.write_lock.lock().unwrap_or_else(PoisonError::into_inner);

        fs::write(&tmp, value)?;
        fs::rename(&tmp, &path)?;

        Ok(())
    }
}
