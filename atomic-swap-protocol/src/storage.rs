// Durable persistence of swap state

use crate::cross_chain::types::Swap;
use crate::data_structures::SwapId;
use std::collections::HashMap;
use std::fs::{self, File};
use std::io::{BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::RwLock;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
    #[error("Storage error: {0}")]
    Storage(String),
}

// Trait defining the storage interface the swap initiator expects
pub trait SwapStore: Send + Sync {
    /// Idempotent upsert keyed by swap id.
    fn update(&self, swap: &Swap) -> Result<(), StoreError>;

    fn load(&self, id: &str) -> Result<Option<Swap>, StoreError>;

    fn load_all(&self) -> Result<Vec<Swap>, StoreError>;
}

// In-memory storage (for testing/simulation)
#[derive(Debug, Default)]
pub struct InMemorySwapStore {
    swaps: RwLock<HashMap<SwapId, Swap>>,
}

impl InMemorySwapStore {
    pub fn new() -> Self {
        Default::default()
    }
}

impl SwapStore for InMemorySwapStore {
    fn update(&self, swap: &Swap) -> Result<(), StoreError> {
        let mut swaps = self.swaps.write().map_err(|_| StoreError::Storage("lock poisoned".to_string()))?;
        swaps.insert(swap.id.clone(), swap.clone());
        Ok(())
    }

    fn load(&self, id: &str) -> Result<Option<Swap>, StoreError> {
        let swaps = self.swaps.read().map_err(|_| StoreError::Storage("lock poisoned".to_string()))?;
        Ok(swaps.get(id).cloned())
    }

    fn load_all(&self) -> Result<Vec<Swap>, StoreError> {
        let swaps = self.swaps.read().map_err(|_| StoreError::Storage("lock poisoned".to_string()))?;
        Ok(swaps.values().cloned().collect())
    }
}

/// One JSON file per swap under `dir`. Writes go to a temp file which is then
/// renamed over the previous version.
#[derive(Debug, Clone)]
pub struct FileSwapStore {
    dir: PathBuf,
}

impl FileSwapStore {
    /// Opens the store, creating the directory if needed.
    pub fn open(dir: impl Into<PathBuf>) -> Result<Self, StoreError> {
        let dir = dir.into();
        fs::create_dir_all(&dir)?;
        Ok(FileSwapStore { dir })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn path_for(&self, id: &str) -> Result<PathBuf, StoreError> {
        // Ids become file names
        if id.is_empty() || !id.chars().all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_') {
            return Err(StoreError::Storage(format!("invalid swap id {:?}", id)));
        }
        Ok(self.dir.join(format!("{}.json", id)))
    }

    fn read_file(path: &Path) -> Result<Swap, StoreError> {
        let reader = BufReader::new(File::open(path)?);
        Ok(serde_json::from_reader(reader)?)
    }
}

impl SwapStore for FileSwapStore {
    fn update(&self, swap: &Swap) -> Result<(), StoreError> {
        let path = self.path_for(&swap.id)?;
        let tmp = path.with_extension("json.tmp");
        {
            let mut writer = BufWriter::new(File::create(&tmp)?);
            serde_json::to_writer_pretty(&mut writer, swap)?;
            writer.flush()?;
            writer.get_ref().sync_all()?;
        }
        fs::rename(&tmp, &path)?;
        log::trace!("Persisted swap {} ({}) to {}", swap.id, swap.state, path.display());
        Ok(())
    }

    fn load(&self, id: &str) -> Result<Option<Swap>, StoreError> {
        let path = self.path_for(id)?;
        if !path.exists() {
            return Ok(None);
        }
        Self::read_file(&path).map(Some)
    }

    fn load_all(&self) -> Result<Vec<Swap>, StoreError> {
        let mut swaps = Vec::new();
        for entry in fs::read_dir(&self.dir)? {
            let path = entry?.path();
            if path.extension().and_then(|ext| ext.to_str()) != Some("json") {
                continue;
            }
            match Self::read_file(&path) {
                Ok(swap) => swaps.push(swap),
                Err(e) => log::warn!("Skipping unreadable swap file {}: {}", path.display(), e),
            }
        }
        Ok(swaps)
    }
}
