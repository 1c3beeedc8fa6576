//! Token storage trait and implementations

use std::path::{Path, PathBuf};
use std::sync::Mutex;

use async_trait::async_trait;
use tokio::fs;
use tokio::io::AsyncWriteExt;

use crate::error::{Result, SessionError};

/// Well-known key the bearer token is stored under.
pub const TOKEN_KEY: &str = "session_token";

/// Durable store for the single persisted value: the bearer token.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait TokenStore: Send + Sync {
    /// Load the persisted token, `None` when nothing is stored
    async fn load_token(&self) -> Result<Option<String>>;

    /// Persist the token, replacing any previous value
    async fn save_token(&self, token: &str) -> Result<()>;

    /// Remove the persisted token; succeeds when nothing is stored
    async fn delete_token(&self) -> Result<()>;
}

/// File-based token storage
#[derive(Debug, Clone)]
pub struct FileTokenStore {
    base_path: PathBuf,
}

impl FileTokenStore {
    pub fn new<P: AsRef<Path>>(base_path: P) -> Self {
        Self {
            base_path: base_path.as_ref().to_path_buf(),
        }
    }

    fn token_path(&self) -> PathBuf {
        self.base_path.join(TOKEN_KEY)
    }
}

#[async_trait]
impl TokenStore for FileTokenStore {
    async fn load_token(&self) -> Result<Option<String>> {
        let path = self.token_path();
        if !path.exists() {
            return Ok(None);
        }

        let contents = fs::read_to_string(&path).await?;
        let trimmed = contents.trim();
        if trimmed.is_empty() {
            Ok(None)
        } else {
            Ok(Some(trimmed.to_string()))
        }
    }

    async fn save_token(&self, token: &str) -> Result<()> {
        fs::create_dir_all(&self.base_path).await?;

        // Write beside the target, then rename over it
        let tmp_path = self.base_path.join(format!("{TOKEN_KEY}.tmp"));
        let mut options = fs::OpenOptions::new();
        options.write(true).create(true).truncate(true);
        #[cfg(unix)]
        options.mode(0o600);

        let mut file = options.open(&tmp_path).await?;
        file.write_all(token.as_bytes()).await?;
        file.sync_all().await?;
        drop(file);

        fs::rename(&tmp_path, self.token_path()).await?;
        Ok(())
    }

    async fn delete_token(&self) -> Result<()> {
        let path = self.token_path();
        if path.exists() {
            fs::remove_file(&path).await?;
        }
        Ok(())
    }
}

/// In-memory token storage, for tests and sessions that should not outlive the process.
#[derive(Debug, Default)]
pub struct MemoryTokenStore {
    token: Mutex<Option<String>>,
}

impl MemoryTokenStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_token(token: impl Into<String>) -> Self {
        Self {
            token: Mutex::new(Some(token.into())),
        }
    }

    fn slot(&self) -> Result<std::sync::MutexGuard<'_, Option<String>>> {
        self.token
            .lock()
            .map_err(|_| SessionError::Persistence("token store lock poisoned".to_string()))
    }
}

#[async_trait]
impl TokenStore for MemoryTokenStore {
    async fn load_token(&self) -> Result<Option<String>> {
        Ok(self.slot()?.clone())
    }

    async fn save_token(&self, token: &str) -> Result<()> {
        *self.slot()? = Some(token.to_string());
        Ok(())
    }

    async fn delete_token(&self) -> Result<()> {
        *self.slot()? = None;
        Ok(())
    }
}
