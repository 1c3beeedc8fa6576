use std::error::Error;

use log::{debug, error, info};
use reqwest::{Method, Response, StatusCode, Url};
use reqwest_middleware::{ClientWithMiddleware, RequestBuilder};
use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::error::{Result, SessionError};

/// Shortens a bearer token for log output.
pub fn mask_token(token: &str) -> String {
    let prefix: String = token.chars().take(4).collect();
    if token.chars().count() <= 4 {
        "****".to_string()
    } else {
        format!("{prefix}****")
    }
}

/// JSON keys whose string values are credentials.
const SECRET_KEYS: &[&str] = &["token", "access_token", "refresh_token", "password"];

/// Masks credential values in a response body before it is logged or kept in an error.
///
/// Bodies that are not JSON are passed through unchanged.
pub fn redact_body(body: &str) -> String {
    match serde_json::from_str::<serde_json::Value>(body) {
        Ok(mut value) => {
            redact_value(&mut value);
            value.to_string()
        }
        Err(_) => body.to_string(),
    }
}

fn redact_value(value: &mut serde_json::Value) {
    match value {
        serde_json::Value::Object(map) => {
            for (key, field) in map.iter_mut() {
                match field {
                    serde_json::Value::String(secret) if SECRET_KEYS.contains(&key.as_str()) => {
                        *secret = mask_token(secret);
                    }
                    _ => redact_value(field),
                }
            }
        }
        serde_json::Value::Array(items) => items.iter_mut().for_each(redact_value),
        _ => {}
    }
}

/// Builds a request with optional bearer auth and JSON body.
pub fn build_request<T: Serialize + ?Sized>(
    client: &ClientWithMiddleware,
    method: Method,
    url: Url,
    auth_token: Option<&str>,
    json_body: Option<&T>,
) -> RequestBuilder {
    let mut request_builder = client.request(method, url);

    if let Some(token) = auth_token {
        request_builder = request_builder.bearer_auth(token);
    }
    if let Some(body) = json_body {
        request_builder = request_builder.json(body);
    }
    request_builder
}

/// Sends a prepared request, logging timing and classifying transport failures.
pub async fn send_request(
    request_builder: RequestBuilder,
    method: &Method,
    url: &Url,
    auth_token: Option<&str>,
) -> Result<Response> {
    match auth_token {
        Some(token) => info!("Sending {} request to {} as {}", method, url, mask_token(token)),
        None => info!("Sending {} request to {}", method, url),
    }

    let start_time = std::time::Instant::now();

    match request_builder.send().await {
        Ok(resp) => {
            info!(
                "Got response from {} after {:?} with status {}",
                url,
                start_time.elapsed(),
                resp.status()
            );
            Ok(resp)
        }
        Err(e) => {
            error!("Failed HTTP request to {}: {}", url, e);
            if let Some(source) = e.source() {
                debug!("Error source: {:?}", source);
            }
            if let reqwest_middleware::Error::Reqwest(inner) = &e {
                if inner.is_timeout() {
                    error!("Request timed out");
                }
                if inner.is_connect() {
                    error!("Connection error");
                }
            }
            Err(e.into())
        }
    }
}

/// Executes a request with common configuration and error handling.
pub async fn execute_request<T: Serialize + ?Sized>(
    client: &ClientWithMiddleware,
    method: Method,
    url: Url,
    auth_token: Option<&str>,
    json_body: Option<&T>,
) -> Result<Response> {
    let request_builder = build_request(client, method.clone(), url.clone(), auth_token, json_body);
    send_request(request_builder, &method, &url, auth_token).await
}

/// Fails with `InvalidResponse` unless the response carries `expected`.
pub async fn expect_status(response: Response, expected: StatusCode) -> Result<Response> {
    let status = response.status();
    if status == expected {
        return Ok(response);
    }
    let url = response.url().clone();
    let body = redact_body(&response.text().await.unwrap_or_default());
    error!("Unexpected status {} from {} (expected {}): {}", status, url, expected, body);
    Err(SessionError::InvalidResponse { status, body })
}

/// Decodes a JSON body, logging the raw payload when it does not match.
pub async fn decode_json<T: DeserializeOwned>(response: Response) -> Result<T> {
    let url = response.url().clone();
    let body = response.bytes().await?;
    serde_json::from_slice::<T>(&body).map_err(|e| {
        let body_str = redact_body(&String::from_utf8_lossy(&body));
        error!("Unexpected payload from {}: {} (body: {})", url, e, body_str);
        SessionError::InvalidPayload(format!("{e} in response from {url}"))
    })
}
