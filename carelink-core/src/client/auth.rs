use std::fs;
use std::path::{Path, PathBuf};
use tracing::debug;

use crate::config::{default_token_path, AuthConfig};
use crate::error::{ChatError, ChatResult};

/// Bearer token persisted on disk between runs.
#[derive(Debug, Clone)]
pub struct TokenStore {
    path: PathBuf,
}

impl TokenStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// Store at the platform data directory.
    pub fn default_location() -> ChatResult<Self> {
        default_token_path()
            .map(Self::new)
            .ok_or_else(|| ChatError::Internal("no data directory on this platform".to_string()))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn load(&self) -> ChatResult<Option<String>> {
        if !self.path.exists() {
            return Ok(None);
        }
        let token = fs::read_to_string(&self.path)?;
        let token = token.trim();
        Ok((!token.is_empty()).then(|| token.to_string()))
    }

    pub fn save(&self, token: &str) -> ChatResult<()> {
        let token = token.trim();
        if token.is_empty() {
            return Err(ChatError::InvalidConfigValue {
                key: "auth.token".to_string(),
                message: "Token cannot be empty".to_string(),
            });
        }
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(&self.path, token)?;
        debug!(path = %self.path.display(), "Saved auth token");
        Ok(())
    }

    pub fn clear(&self) -> ChatResult<bool> {
        if !self.path.exists() {
            return Ok(false);
        }
        fs::remove_file(&self.path)?;
        Ok(true)
    }
}

/// Pick the bearer token: explicit value, then the configured file, then
/// the default token file.
pub fn resolve_token(auth: &AuthConfig) -> ChatResult<Option<String>> {
    if let Some(token) = auth.token.as_deref().map(str::trim) {
        if !token.is_empty() {
            return Ok(Some(token.to_string()));
        }
    }
    if let Some(path) = &auth.token_file {
        return TokenStore::new(path).load();
    }
    match TokenStore::default_location() {
        Ok(store) => store.load(),
        Err(_) => Ok(None),
    }
}
