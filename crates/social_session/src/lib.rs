//! # Social Session
//!
//! Authentication lifecycle for the social network client: login, registration,
//! profile image upload, profile refresh and logout against the REST backend,
//! with the bearer token persisted across restarts.

pub mod api;
pub mod backend;
pub mod config;
pub mod error;
pub mod events;
pub mod manager;
pub mod models;
pub mod storage;
pub mod utils;

// Re-exports
pub use api::HttpSessionBackend;
pub use backend::SessionBackend;
pub use config::{Endpoints, RegistrationMode, SessionConfig};
pub use error::{Result, SessionError};
pub use events::SessionEvent;
pub use manager::SessionManager;
pub use models::{LoginOutcome, RegisterOutcome, Session, UserProfile, UserSummary};
pub use storage::{FileTokenStore, MemoryTokenStore, TokenStore};
