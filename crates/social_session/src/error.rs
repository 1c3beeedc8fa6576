//! Session error types

use reqwest::StatusCode;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum SessionError {
    #[error("Network error: {0}")]
    Network(String),

    #[error("Unexpected response status {status}: {body}")]
    InvalidResponse { status: StatusCode, body: String },

    #[error("Invalid response payload: {0}")]
    InvalidPayload(String),

    #[error("No active session")]
    NoActiveSession,

    #[error("Token storage error: {0}")]
    Persistence(String),

    #[error("Configuration error: {0}")]
    Config(String),
}

impl SessionError {
    /// Transport failures and unexpected statuses are handled the same way by callers.
    pub fn is_transport(&self) -> bool {
        matches!(
            self,
            SessionError::Network(_) | SessionError::InvalidResponse { .. }
        )
    }

    /// Human-readable reason suitable for the login and registration screens.
    pub fn user_message(&self) -> String {
        match self {
            SessionError::Network(_) => {
                "Unable to reach the server. Check your connection and try again.".to_string()
            }
            SessionError::InvalidResponse { status, .. } => match *status {
                StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => {
                    "The email or password is incorrect.".to_string()
                }
                StatusCode::BAD_REQUEST => {
                    "Some of the details you entered were not accepted.".to_string()
                }
                StatusCode::CONFLICT => "An account with these details already exists.".to_string(),
                status if status.is_server_error() => {
                    "The server is having trouble right now. Please try again later.".to_string()
                }
                status => format!("The request was rejected ({}).", status.as_u16()),
            },
            SessionError::InvalidPayload(_) => {
                "The server sent an unexpected response.".to_string()
            }
            SessionError::NoActiveSession => "You need to sign in first.".to_string(),
            SessionError::Persistence(_) | SessionError::Config(_) => {
                "Something went wrong on this device.".to_string()
            }
        }
    }
}

impl From<reqwest::Error> for SessionError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_decode() {
            SessionError::InvalidPayload(err.to_string())
        } else {
            SessionError::Network(err.to_string())
        }
    }
}

impl From<reqwest_middleware::Error> for SessionError {
    fn from(err: reqwest_middleware::Error) -> Self {
        match err {
            reqwest_middleware::Error::Reqwest(e) => e.into(),
            reqwest_middleware::Error::Middleware(e) => SessionError::Network(e.to_string()),
        }
    }
}

impl From<serde_json::Error> for SessionError {
    fn from(err: serde_json::Error) -> Self {
        SessionError::InvalidPayload(err.to_string())
    }
}

impl From<std::io::Error> for SessionError {
    fn from(err: std::io::Error) -> Self {
        SessionError::Persistence(err.to_string())
    }
}

pub type Result<T> = std::result::Result<T, SessionError>;
