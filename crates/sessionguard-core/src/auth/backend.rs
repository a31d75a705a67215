//! Persistence media for the session credentials.

use std::path::PathBuf;

use anyhow::{Context, Result};
use chrono::Utc;
use keyring::Entry;
use tracing::debug;

use super::Session;

/// Session file name in cache directory
const SESSION_FILE: &str = "session.json";

/// Keychain service name
const SERVICE_NAME: &str = "sessionguard";

/// Keychain entry holding the access credential
const ACCESS_KEY: &str = "accessCredential";

/// Keychain entry holding the refresh credential
const REFRESH_KEY: &str = "refreshCredential";

/// Where a `SessionStore` keeps its credentials between runs.
pub trait SessionBackend: Send + Sync {
    fn load(&self) -> Result<Option<Session>>;
    fn save(&self, session: &Session) -> Result<()>;
    fn clear(&self) -> Result<()>;
}

/// Keeps nothing; the session lives only as long as the process.
#[derive(Debug, Default, Clone, Copy)]
pub struct EphemeralBackend;

impl SessionBackend for EphemeralBackend {
    fn load(&self) -> Result<Option<Session>> {
        Ok(None)
    }

    fn save(&self, _session: &Session) -> Result<()> {
        Ok(())
    }

    fn clear(&self) -> Result<()> {
        Ok(())
    }
}

/// JSON file in the cache directory.
pub struct FileBackend {
    cache_dir: PathBuf,
}

impl FileBackend {
    pub fn new(cache_dir: PathBuf) -> Self {
        Self { cache_dir }
    }

    fn session_path(&self) -> PathBuf {
        self.cache_dir.join(SESSION_FILE)
    }
}

impl SessionBackend for FileBackend {
    fn load(&self) -> Result<Option<Session>> {
        let path = self.session_path();
        if !path.exists() {
            return Ok(None);
        }
        let contents = std::fs::read_to_string(&path).context("Failed to read session file")?;
        let session: Session =
            serde_json::from_str(&contents).context("Failed to parse session file")?;
        debug!(path = %path.display(), "Loaded session file");
        Ok(Some(session))
    }

    fn save(&self, session: &Session) -> Result<()> {
        let path = self.session_path();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let contents = serde_json::to_string_pretty(session)?;
        std::fs::write(&path, contents).context("Failed to write session file")?;
        Ok(())
    }

    fn clear(&self) -> Result<()> {
        let path = self.session_path();
        if path.exists() {
            std::fs::remove_file(path).context("Failed to remove session file")?;
        }
        Ok(())
    }
}

/// OS keychain, one entry per credential.
///
/// Only the two credentials are kept; timestamps restart at load time.
pub struct KeyringBackend {
    service: String,
}

impl KeyringBackend {
    pub fn new() -> Self {
        Self::with_service(SERVICE_NAME)
    }

    pub fn with_service(service: impl Into<String>) -> Self {
        Self {
            service: service.into(),
        }
    }

    fn entry(&self, key: &str) -> Result<Entry> {
        Entry::new(&self.service, key).context("Failed to create keyring entry")
    }

    fn read(&self, key: &str) -> Result<Option<String>> {
        match self.entry(key)?.get_password() {
            Ok(value) => Ok(Some(value)),
            Err(keyring::Error::NoEntry) => Ok(None),
            Err(e) => Err(e).context("Failed to retrieve credential from keychain"),
        }
    }

    fn delete(&self, key: &str) -> Result<()> {
        match self.entry(key)?.delete_credential() {
            Ok(()) | Err(keyring::Error::NoEntry) => Ok(()),
            Err(e) => Err(e).context("Failed to delete credential from keychain"),
        }
    }
}

impl Default for KeyringBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl SessionBackend for KeyringBackend {
    fn load(&self) -> Result<Option<Session>> {
        let Some(access_token) = self.read(ACCESS_KEY)? else {
            return Ok(None);
        };
        let refresh_token = self.read(REFRESH_KEY)?;
        Ok(Some(Session {
            access_token,
            refresh_token,
            established_at: Utc::now(),
            renewed_at: None,
        }))
    }

    fn save(&self, session: &Session) -> Result<()> {
        self.entry(ACCESS_KEY)?
            .set_password(&session.access_token)
            .context("Failed to store access credential in keychain")?;
        match session.refresh_token {
            Some(ref refresh) => self
                .entry(REFRESH_KEY)?
                .set_password(refresh)
                .context("Failed to store refresh credential in keychain")?,
            None => self.delete(REFRESH_KEY)?,
        }
        Ok(())
    }

    fn clear(&self) -> Result<()> {
        self.delete(ACCESS_KEY)?;
        self.delete(REFRESH_KEY)?;
        Ok(())
    }
}
