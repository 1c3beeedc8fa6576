use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{Result, SessionError};

const DEFAULT_API_BASE: &str = "http://localhost:8000/api/v1/";
const DEFAULT_REQUEST_TIMEOUT_SECS: u64 = 30;
const DEFAULT_MAX_RETRIES: u32 = 2;
const APP_DIR_NAME: &str = "social_session";

/// How a successful registration turns into an authenticated session.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum RegistrationMode {
    /// The returned token is the session token straight away.
    #[default]
    Immediate,
    /// The token is held as pending until onboarding (profile photo) completes.
    DeferredUntilProfileImage,
}

/// Backend paths, relative to `api_base`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct Endpoints {
    pub login: String,
    pub register: String,
    pub logout: String,
    pub upload_image: String,
    pub profile: String,
}

impl Default for Endpoints {
    fn default() -> Self {
        Self {
            login: "auth/login/".to_string(),
            register: "auth/register/".to_string(),
            logout: "auth/logout/".to_string(),
            upload_image: "upload/".to_string(),
            profile: "users/me/".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    pub api_base: String,
    pub endpoints: Endpoints,
    pub request_timeout_secs: u64,
    pub max_retries: u32,
    pub http_proxy: String,
    pub https_proxy: String,
    pub data_dir: Option<PathBuf>,
    pub registration_mode: RegistrationMode,
}

fn parse_bool_env(value: &str) -> bool {
    matches!(
        value.trim().to_ascii_lowercase().as_str(),
        "1" | "true" | "yes" | "y" | "on"
    )
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            api_base: DEFAULT_API_BASE.to_string(),
            endpoints: Endpoints::default(),
            request_timeout_secs: DEFAULT_REQUEST_TIMEOUT_SECS,
            max_retries: DEFAULT_MAX_RETRIES,
            http_proxy: String::new(),
            https_proxy: String::new(),
            data_dir: None,
            registration_mode: RegistrationMode::default(),
        }
    }
}

impl SessionConfig {
    /// Reads a TOML config file. Missing keys keep their defaults.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)
            .map_err(|e| SessionError::Config(format!("failed to read {}: {e}", path.display())))?;
        toml::from_str(&content)
            .map_err(|e| SessionError::Config(format!("failed to parse {}: {e}", path.display())))
    }

    /// Loads `path` when it exists, otherwise starts from defaults, then applies
    /// environment overrides.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let config = if path.exists() {
            Self::from_file(path)?
        } else {
            log::debug!("No config file at {:?}, using defaults", path);
            Self::default()
        };
        Ok(config.with_env_overrides())
    }

    pub fn with_env_overrides(self) -> Self {
        self.with_overrides(|key| std::env::var(key).ok())
    }

    fn with_overrides(mut self, lookup: impl Fn(&str) -> Option<String>) -> Self {
        if let Some(api_base) = lookup("SOCIAL_API_BASE") {
            self.api_base = api_base;
        }
        if let Some(timeout) = lookup("SOCIAL_REQUEST_TIMEOUT_SECS") {
            match timeout.trim().parse() {
                Ok(secs) => self.request_timeout_secs = secs,
                Err(_) => log::warn!("Ignoring invalid SOCIAL_REQUEST_TIMEOUT_SECS={timeout:?}"),
            }
        }
        if let Some(retries) = lookup("SOCIAL_MAX_RETRIES") {
            match retries.trim().parse() {
                Ok(n) => self.max_retries = n,
                Err(_) => log::warn!("Ignoring invalid SOCIAL_MAX_RETRIES={retries:?}"),
            }
        }
        if let Some(http_proxy) = lookup("HTTP_PROXY") {
            self.http_proxy = http_proxy;
        }
        if let Some(https_proxy) = lookup("HTTPS_PROXY") {
            self.https_proxy = https_proxy;
        }
        if let Some(deferred) = lookup("SOCIAL_DEFERRED_ONBOARDING") {
            self.registration_mode = if parse_bool_env(&deferred) {
                RegistrationMode::DeferredUntilProfileImage
            } else {
                RegistrationMode::Immediate
            };
        }
        self
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    /// Directory holding the persisted token.
    pub fn data_dir(&self) -> PathBuf {
        self.data_dir.clone().unwrap_or_else(|| {
            dirs::data_dir()
                .unwrap_or_else(std::env::temp_dir)
                .join(APP_DIR_NAME)
        })
    }

    /// Joins an endpoint path onto `api_base`.
    pub fn endpoint_url(&self, endpoint: &str) -> Result<reqwest::Url> {
        let mut base = self.api_base.clone();
        if !base.ends_with('/') {
            base.push('/');
        }
        let base = reqwest::Url::parse(&base)
            .map_err(|e| SessionError::Config(format!("invalid api_base {:?}: {e}", self.api_base)))?;
        base.join(endpoint.trim_start_matches('/'))
            .map_err(|e| SessionError::Config(format!("invalid endpoint {endpoint:?}: {e}")))
    }
}
