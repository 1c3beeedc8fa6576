use async_trait::async_trait;

use crate::error::Result;
use crate::models::{LoginResponse, RegisterResponse, UploadResponse, UserProfile};

/// REST operations the session core depends on.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait SessionBackend: Send + Sync {
    async fn login(&self, email: &str, password: &str) -> Result<LoginResponse>;

    async fn register(
        &self,
        email: &str,
        password: &str,
        fullname: &str,
        username: &str,
    ) -> Result<RegisterResponse>;

    /// Best-effort server-side logout; the response body is ignored.
    async fn logout(&self, token: &str) -> Result<()>;

    /// Upload JPEG bytes as the profile image of the identity owning `token`.
    async fn upload_profile_image(&self, token: &str, image: Vec<u8>) -> Result<UploadResponse>;

    async fn fetch_profile(&self, token: &str) -> Result<UserProfile>;
}
