use async_trait::async_trait;
use log::{info, warn};
use reqwest::multipart::{Form, Part};
use reqwest::{Client, Method, Proxy, StatusCode};
use reqwest_middleware::{ClientBuilder, ClientWithMiddleware};
use reqwest_retry::{policies::ExponentialBackoff, RetryTransientMiddleware};

use crate::backend::SessionBackend;
use crate::config::{Endpoints, SessionConfig};
use crate::error::{Result, SessionError};
use crate::models::{
    LoginRequest, LoginResponse, RegisterRequest, RegisterResponse, UploadResponse, UserProfile,
};
use crate::utils::http_utils::{
    build_request, decode_json, execute_request, expect_status, send_request,
};

/// Multipart field the profile image is sent under.
pub const IMAGE_FIELD_NAME: &str = "file";
const IMAGE_MIME_TYPE: &str = "image/jpeg";

/// `SessionBackend` over the REST API.
#[derive(Debug, Clone)]
pub struct HttpSessionBackend {
    /// Retrying client, only for idempotent reads
    client: ClientWithMiddleware,
    /// Sends every POST exactly once
    post_client: ClientWithMiddleware,
    config: SessionConfig,
}

impl HttpSessionBackend {
    pub fn new(config: SessionConfig) -> Result<Self> {
        let client = Self::build_http_client(&config)?;
        // POSTs are not idempotent and multipart bodies cannot be replayed, so only GETs retry.
        let post_client = ClientBuilder::new(client.clone()).build();
        let retry_client = Self::build_retry_client(client, config.max_retries);

        // Fail early on a malformed base URL rather than on the first request.
        config.endpoint_url(&config.endpoints.login)?;

        Ok(Self {
            client: retry_client,
            post_client,
            config,
        })
    }

    fn build_http_client(config: &SessionConfig) -> Result<Client> {
        let mut builder = Client::builder().timeout(config.request_timeout());
        if !config.http_proxy.is_empty() {
            let proxy = Proxy::http(&config.http_proxy)
                .map_err(|e| SessionError::Config(format!("invalid http_proxy: {e}")))?;
            builder = builder.proxy(proxy);
        }
        if !config.https_proxy.is_empty() {
            let proxy = Proxy::https(&config.https_proxy)
                .map_err(|e| SessionError::Config(format!("invalid https_proxy: {e}")))?;
            builder = builder.proxy(proxy);
        }
        builder
            .build()
            .map_err(|e| SessionError::Config(format!("failed to build HTTP client: {e}")))
    }

    fn build_retry_client(client: Client, max_retries: u32) -> ClientWithMiddleware {
        if max_retries == 0 {
            return ClientBuilder::new(client).build();
        }
        // Retries only transient failures (5xx, 408, 429, connect errors)
        let retry_policy = ExponentialBackoff::builder().build_with_max_retries(max_retries);

        ClientBuilder::new(client)
            .with(RetryTransientMiddleware::new_with_policy(retry_policy))
            .build()
    }

    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    fn endpoints(&self) -> &Endpoints {
        &self.config.endpoints
    }
}

#[async_trait]
impl SessionBackend for HttpSessionBackend {
    async fn login(&self, email: &str, password: &str) -> Result<LoginResponse> {
        let url = self.config.endpoint_url(&self.endpoints().login)?;
        let body = LoginRequest { email, password };
        let response =
            execute_request(&self.post_client, Method::POST, url, None, Some(&body)).await?;
        let response = expect_status(response, StatusCode::OK).await?;
        let login: LoginResponse = decode_json(response).await?;
        info!("Login accepted for user {}", login.user.username);
        Ok(login)
    }

    async fn register(
        &self,
        email: &str,
        password: &str,
        fullname: &str,
        username: &str,
    ) -> Result<RegisterResponse> {
        let url = self.config.endpoint_url(&self.endpoints().register)?;
        let body = RegisterRequest {
            email,
            password,
            fullname,
            username,
        };
        let response =
            execute_request(&self.post_client, Method::POST, url, None, Some(&body)).await?;
        let response = expect_status(response, StatusCode::CREATED).await?;
        decode_json(response).await
    }

    async fn logout(&self, token: &str) -> Result<()> {
        let url = self.config.endpoint_url(&self.endpoints().logout)?;
        let response =
            execute_request::<()>(&self.post_client, Method::POST, url, Some(token), None).await?;
        if !response.status().is_success() {
            warn!("Server-side logout returned {}", response.status());
        }
        Ok(())
    }

    async fn upload_profile_image(&self, token: &str, image: Vec<u8>) -> Result<UploadResponse> {
        let url = self.config.endpoint_url(&self.endpoints().upload_image)?;
        let file_name = format!("{}.jpg", uuid::Uuid::new_v4());
        let size = image.len();
        let part = Part::bytes(image)
            .file_name(file_name.clone())
            .mime_str(IMAGE_MIME_TYPE)?;
        let form = Form::new().part(IMAGE_FIELD_NAME, part);

        info!("Uploading profile image {} ({} bytes)", file_name, size);
        let request_builder = build_request::<()>(
            &self.post_client,
            Method::POST,
            url.clone(),
            Some(token),
            None,
        )
        .multipart(form);
        let response = send_request(request_builder, &Method::POST, &url, Some(token)).await?;
        let response = expect_status(response, StatusCode::OK).await?;
        decode_json(response).await
    }

    async fn fetch_profile(&self, token: &str) -> Result<UserProfile> {
        let url = self.config.endpoint_url(&self.endpoints().profile)?;
        let response =
            execute_request::<()>(&self.client, Method::GET, url, Some(token), None).await?;
        let response = expect_status(response, StatusCode::OK).await?;
        decode_json(response).await
    }
}
