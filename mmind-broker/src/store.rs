use serde::{Deserialize, Serialize};
use std::{
    path::PathBuf,
    sync::{Arc, Mutex},
};
use thiserror::Error;

use crate::{Tid, UnicastAddr};

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("IO Error")]
    Io(#[from] std::io::Error),
    #[error("Serde Error")]
    Serde(#[from] serde_json::Error),
    #[error("Store lock poisoned")]
    Poisoned,
}

/// Provisioner state kept across restarts
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PersistedState {
    /// Last configured server
    pub server_addr: UnicastAddr,
    /// Last vendor probe transaction id
    pub vnd_tid: Tid,
}

pub trait StateStore: Send {
    /// `Ok(None)` when nothing has been stored yet
    fn load(&mut self) -> Result<Option<PersistedState>, StoreError>;
    fn save(&mut self, state: &PersistedState) -> Result<(), StoreError>;
}

/// State kept as a small JSON document on disk
pub struct JsonFileStore {
    path: PathBuf,
}

impl JsonFileStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

impl StateStore for JsonFileStore {
    fn load(&mut self) -> Result<Option<PersistedState>, StoreError> {
        let raw = match std::fs::read(&self.path) {
            Ok(raw) => raw,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                log::info!("No stored state at {:?}", self.path);
                return Ok(None);
            }
            Err(e) => {
                log::error!("Unable to read {:?} {e:}", self.path);
                return Err(e.into());
            }
        };
        let state = serde_json::from_slice(&raw).map_err(|e| {
            log::error!("Stored state at {:?} is corrupt {e:}", self.path);
            e
        })?;
        Ok(Some(state))
    }

    fn save(&mut self, state: &PersistedState) -> Result<(), StoreError> {
        let raw = serde_json::to_vec(state)?;
        std::fs::write(&self.path, raw)?;
        log::debug!("Stored {state:?}");
        Ok(())
    }
}

/// In-memory store. Clones share the same slot, so a test can keep one
/// handle and inspect what the node saved.
#[derive(Debug, Clone, Default)]
pub struct MemoryStore(Arc<Mutex<Option<PersistedState>>>);

impl MemoryStore {
    pub fn with_state(state: PersistedState) -> Self {
        Self(Arc::new(Mutex::new(Some(state))))
    }

    pub fn get(&self) -> Option<PersistedState> {
        self.0.lock().ok().and_then(|s| *s)
    }
}

impl StateStore for MemoryStore {
    fn load(&mut self) -> Result<Option<PersistedState>, StoreError> {
        Ok(*self.0.lock().map_err(|_| StoreError::Poisoned)?)
    }

    fn save(&mut self, state: &PersistedState) -> Result<(), StoreError> {
        *self.0.lock().map_err(|_| StoreError::Poisoned)? = Some(*state);
        Ok(())
    }
}
