//! Session and user data structures

use serde::{Deserialize, Serialize};

pub const DEFAULT_AVATAR_URL: &str =
    "https://www.gravatar.com/avatar/205e460b479e2e5b48aec07710c08d50";

/// Profile of the authenticated user, as returned by the profile endpoint.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct UserProfile {
    #[serde(alias = "public_id")]
    pub id: String,
    pub username: String,
    pub email: String,
    #[serde(default, alias = "profileImageUrl", skip_serializing_if = "Option::is_none")]
    pub profile_image_url: Option<String>,
}

impl UserProfile {
    /// Avatar to display, falling back to the placeholder image.
    pub fn avatar_url(&self) -> &str {
        self.profile_image_url
            .as_deref()
            .unwrap_or(DEFAULT_AVATAR_URL)
    }
}

/// Minimal user payload carried by the login response.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct UserSummary {
    #[serde(alias = "public_id")]
    pub id: String,
    pub username: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub email: Option<String>,
}

/// Process-wide authentication state.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Session {
    /// Bearer credential, present iff authenticated
    pub token: Option<String>,
    /// Token held during deferred onboarding, never set together with `token`
    pub pending_token: Option<String>,
    /// Cached profile for the identity owning `token`
    pub current_user: Option<UserProfile>,
    /// Set by a successful registration until onboarding is finished or abandoned
    pub just_registered: bool,
}

impl Session {
    pub fn is_authenticated(&self) -> bool {
        self.token.is_some()
    }

    /// Token usable for authenticated calls, finalized or pending.
    pub fn active_token(&self) -> Option<&str> {
        self.token.as_deref().or(self.pending_token.as_deref())
    }

    pub(crate) fn clear(&mut self) {
        *self = Session::default();
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoginOutcome {
    pub token: String,
    pub user: UserSummary,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RegisterOutcome {
    pub token: String,
    /// False when the token is held as pending until onboarding completes.
    pub authenticated: bool,
}

// Wire payloads

#[derive(Debug, Serialize)]
pub(crate) struct LoginRequest<'a> {
    pub email: &'a str,
    pub password: &'a str,
}

#[derive(Debug, Serialize)]
pub(crate) struct RegisterRequest<'a> {
    pub email: &'a str,
    pub password: &'a str,
    pub fullname: &'a str,
    pub username: &'a str,
}

#[derive(Debug, Clone, Deserialize)]
pub struct LoginResponse {
    pub token: String,
    pub user: UserSummary,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RegisterResponse {
    pub token: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct UploadResponse {
    #[serde(alias = "profileImageUrl", alias = "imageUrl", alias = "profile_image_url")]
    pub image_url: String,
}
