//! Kill switch persistence.

use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, PoisonError};

use super::{CircuitState, KillSwitchError};

/// Durable keyed storage for the kill switch state.
pub trait KillSwitchStore: Send + Sync + fmt::Debug {
    /// Load the persisted state; `Ok(None)` when nothing was ever saved.
    ///
    /// # Errors
    ///
    /// Returns an error if stored state exists but cannot be read or decoded.
    fn load(&self) -> Result<Option<CircuitState>, KillSwitchError>;

    /// Persist the state.
    ///
    /// # Errors
    ///
    /// Returns an error if the state could not be made durable.
    fn save(&self, state: &CircuitState) -> Result<(), KillSwitchError>;
}

/// JSON document on disk, replaced atomically (temp file + rename).
#[derive(Debug, Clone)]
pub struct FileKillSwitchStore {
    path: PathBuf,
}

impl FileKillSwitchStore {
    /// Store at `path`.
    #[must_use]
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// State file path.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    fn io_error(&self, source: std::io::Error) -> KillSwitchError {
        KillSwitchError::Io {
            path: self.path.display().to_string(),
            source,
        }
    }
}

impl KillSwitchStore for FileKillSwitchStore {
    fn load(&self) -> Result<Option<CircuitState>, KillSwitchError> {
        let contents = match std::fs::read_to_string(&self.path) {
            Ok(contents) => contents,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(self.io_error(e)),
        };
        serde_json::from_str(&contents)
            .map(Some)
            .map_err(|source| KillSwitchError::Corrupt {
                path: self.path.display().to_string(),
                source,
            })
    }

    fn save(&self, state: &CircuitState) -> Result<(), KillSwitchError> {
        if let Some(parent) = self.path.parent()
            && !parent.as_os_str().is_empty()
        {
            std::fs::create_dir_all(parent).map_err(|e| self.io_error(e))?;
        }
        let json = serde_json::to_vec_pretty(state).map_err(KillSwitchError::Encode)?;

        let mut tmp = self.path.clone().into_os_string();
        tmp.push(".tmp");
        let tmp = PathBuf::from(tmp);
        {
            use std::io::Write;
            let mut file = std::fs::File::create(&tmp).map_err(|e| self.io_error(e))?;
            file.write_all(&json).map_err(|e| self.io_error(e))?;
            file.sync_all().map_err(|e| self.io_error(e))?;
        }
        std::fs::rename(&tmp, &self.path).map_err(|e| self.io_error(e))
    }
}

/// In-process store for backtests and tests.
#[derive(Debug, Default)]
pub struct MemoryKillSwitchStore {
    state: Mutex<Option<CircuitState>>,
}

impl MemoryKillSwitchStore {
    /// Empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

impl KillSwitchStore for MemoryKillSwitchStore {
    fn load(&self) -> Result<Option<CircuitState>, KillSwitchError> {
        Ok(self
            .state
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone())
    }

    fn save(&self, state: &CircuitState) -> Result<(), KillSwitchError> {
        *self.state.lock().unwrap_or_else(PoisonError::into_inner) = Some(state.clone());
        Ok(())
    }
}
