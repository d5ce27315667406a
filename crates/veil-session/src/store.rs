//! Session preference persistence.
//!
//! One small record survives restarts: the last-used connection parameters
//! (four strings), whether the user asked to stay connected, and the
//! kill-switch preference. The worker reads it for boot-time restore and
//! rewrites it on successful connects, disconnects and kill-switch changes.
//! Store failures are reported to the caller but never fail a connect.

use std::fs;
use std::path::PathBuf;
use std::sync::Mutex;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::params::{ConnectionParameters, Credential, ParamError};

/// Persisted session preferences.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Preferences {
    /// Last attempted-or-successful parameters, if any.
    pub params: Option<ConnectionParameters>,
    /// User intent: reconnect without being asked.
    pub should_be_connected: bool,
    /// Kill-switch preference.
    pub kill_switch: bool,
}

/// Errors loading or saving preferences.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("preference store i/o failed: {0}")]
    Io(#[from] std::io::Error),

    #[error("preference store record is malformed: {0}")]
    Malformed(#[from] serde_json::Error),

    #[error("stored parameters are unusable: {0}")]
    Params(#[from] ParamError),
}

/// Where preferences live between runs.
pub trait PreferenceStore: Send + Sync {
    fn load(&self) -> Result<Option<Preferences>, StoreError>;
    fn save(&self, prefs: &Preferences) -> Result<(), StoreError>;
}

/// On-disk record. Field names are the stable namespace; an absent field
/// reads as its default so old records keep loading.
#[derive(Debug, Serialize, Deserialize)]
struct StoredPreferences {
    #[serde(default)]
    endpoint: String,
    #[serde(default)]
    private_key: String,
    #[serde(default)]
    public_key: String,
    #[serde(default)]
    address: String,
    #[serde(default)]
    should_be_connected: bool,
    #[serde(default)]
    kill_switch_enabled: bool,
}

impl StoredPreferences {
    fn from_preferences(prefs: &Preferences) -> Self {
        let (endpoint, private_key, public_key, address) = match &prefs.params {
            Some(params) => (
                params.endpoint.to_string(),
                params.private_credential.as_str().to_string(),
                params.public_credential.as_str().to_string(),
                params.address.to_string(),
            ),
            None => Default::default(),
        };
        Self {
            endpoint,
            private_key,
            public_key,
            address,
            should_be_connected: prefs.should_be_connected,
            kill_switch_enabled: prefs.kill_switch,
        }
    }

    fn into_preferences(self) -> Result<Preferences, StoreError> {
        let params = if self.endpoint.is_empty() {
            None
        } else {
            let mut params = ConnectionParameters::new(
                self.endpoint.parse()?,
                self.address.parse()?,
                Credential::new(self.private_key),
                Credential::new(self.public_key),
            );
            // routed prefixes are not persisted; reconnects take the default
            params.routed_prefixes = Vec::new();
            Some(params)
        };
        Ok(Preferences {
            params,
            should_be_connected: self.should_be_connected,
            kill_switch: self.kill_switch_enabled,
        })
    }
}

/// JSON file store, one record per file.
pub struct JsonFileStore {
    path: PathBuf,
}

impl JsonFileStore {
    /// Conventional file name inside a host's state directory.
    pub const DEFAULT_FILE_NAME: &'static str = "veil.json";

    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

impl PreferenceStore for JsonFileStore {
    fn load(&self) -> Result<Option<Preferences>, StoreError> {
        let raw = match fs::read_to_string(&self.path) {
            Ok(raw) => raw,
            Err(error) if error.kind() == std::io::ErrorKind::NotFound => {
                debug!("no preference file at {}", self.path.display());
                return Ok(None);
            }
            Err(error) => return Err(error.into()),
        };
        let stored: StoredPreferences = serde_json::from_str(&raw)?;
        stored.into_preferences().map(Some)
    }

    fn save(&self, prefs: &Preferences) -> Result<(), StoreError> {
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)?;
            }
        }
        let stored = StoredPreferences::from_preferences(prefs);
        let raw = serde_json::to_string_pretty(&stored)?;
        fs::write(&self.path, raw)?;
        debug!("preferences saved to {}", self.path.display());
        Ok(())
    }
}

/// Volatile store for tests and hosts without persistence.
#[derive(Default)]
pub struct MemoryStore {
    inner: Mutex<Option<Preferences>>,
    saves: Mutex<u32>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed the store as if a previous run had saved `prefs`.
    pub fn preloaded(prefs: Preferences) -> Self {
        Self {
            inner: Mutex::new(Some(prefs)),
            saves: Mutex::new(0),
        }
    }

    /// How many times `save` ran.
    pub fn save_count(&self) -> u32 {
        *self.saves.lock().unwrap()
    }

    /// Current contents, if anything was ever saved or preloaded.
    pub fn contents(&self) -> Option<Preferences> {
        self.inner.lock().unwrap().clone()
    }
}

impl PreferenceStore for MemoryStore {
    fn load(&self) -> Result<Option<Preferences>, StoreError> {
        Ok(self.inner.lock().unwrap().clone())
    }

    fn save(&self, prefs: &Preferences) -> Result<(), StoreError> {
        *self.inner.lock().unwrap() = Some(prefs.clone());
        *self.saves.lock().unwrap() += 1;
        Ok(())
    }
}
