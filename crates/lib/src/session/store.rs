//! Persisted client-side state: bearer token, display name and theme preference.
//!
//! Stored as a small JSON object with the keys `token`, `name` and `theme`
//! (e.g. ~/.medra/credentials.json). Clearing the credential keeps the theme.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::Mutex;

/// Theme preference; persisted as "light" or "dark".
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Theme {
    #[default]
    Light,
    Dark,
}

/// Everything the client persists between runs.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoredState {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub token: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub theme: Option<Theme>,
}

/// Where the session holder keeps the credential between runs.
pub trait CredentialStore: Send + Sync {
    /// Current persisted state. Missing or unreadable storage reads as empty.
    fn load(&self) -> StoredState;
    /// Persist token and display name.
    fn save(&self, token: &str, name: &str) -> Result<()>;
    /// Remove token and name. No-op when nothing is stored.
    fn clear(&self) -> Result<()>;
    fn set_theme(&self, theme: Theme) -> Result<()>;

    fn theme(&self) -> Theme {
        self.load().theme.unwrap_or_default()
    }
}

/// JSON file on disk.
pub struct FileCredentialStore {
    path: PathBuf,
    lock: Mutex<()>,
}

impl FileCredentialStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            lock: Mutex::new(()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn read(&self) -> StoredState {
        let Ok(s) = std::fs::read_to_string(&self.path) else {
            return StoredState::default();
        };
        serde_json::from_str(&s).unwrap_or_else(|e| {
            log::warn!(
                "ignoring unreadable credential file {}: {}",
                self.path.display(),
                e
            );
            StoredState::default()
        })
    }

    fn write(&self, state: &StoredState) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("creating {}", parent.display()))?;
        }
        let s = serde_json::to_string_pretty(state)?;
        std::fs::write(&self.path, s)
            .with_context(|| format!("writing {}", self.path.display()))?;
        Ok(())
    }

    fn update(&self, f: impl FnOnce(&mut StoredState)) -> Result<()> {
        let _guard = self.lock.lock().unwrap_or_else(|e| e.into_inner());
        let mut state = self.read();
        let before = state.clone();
        f(&mut state);
        if state == before {
            return Ok(());
        }
        if state == StoredState::default() {
            return match std::fs::remove_file(&self.path) {
                Ok(()) => Ok(()),
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
                Err(e) => Err(e).with_context(|| format!("removing {}", self.path.display())),
            };
        }
        self.write(&state)
    }
}

impl CredentialStore for FileCredentialStore {
    fn load(&self) -> StoredState {
        let _guard = self.lock.lock().unwrap_or_else(|e| e.into_inner());
        self.read()
    }

    fn save(&self, token: &str, name: &str) -> Result<()> {
        self.update(|s| {
            s.token = Some(token.to_string());
            s.name = Some(name.to_string());
        })
    }

    fn clear(&self) -> Result<()> {
        self.update(|s| {
            s.token = None;
            s.name = None;
        })
    }

    fn set_theme(&self, theme: Theme) -> Result<()> {
        self.update(|s| s.theme = Some(theme))
    }
}

/// In-process store; nothing survives the process.
#[derive(Default)]
pub struct MemoryCredentialStore {
    state: Mutex<StoredState>,
}

impl MemoryCredentialStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Store pre-seeded with a token, as if a previous run had signed in.
    pub fn with_token(token: &str, name: &str) -> Self {
        Self {
            state: Mutex::new(StoredState {
                token: Some(token.to_string()),
                name: Some(name.to_string()),
                theme: None,
            }),
        }
    }
}

impl CredentialStore for MemoryCredentialStore {
    fn load(&self) -> StoredState {
        self.state.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    fn save(&self, token: &str, name: &str) -> Result<()> {
        let mut s = self.state.lock().unwrap_or_else(|e| e.into_inner());
        s.token = Some(token.to_string());
        s.name = Some(name.to_string());
        Ok(())
    }

    fn clear(&self) -> Result<()> {
        let mut s = self.state.lock().unwrap_or_else(|e| e.into_inner());
        s.token = None;
        s.name = None;
        Ok(())
    }

    fn set_theme(&self, theme: Theme) -> Result<()> {
        self.state.lock().unwrap_or_else(|e| e.into_inner()).theme = Some(theme);
        Ok(())
    }
}
