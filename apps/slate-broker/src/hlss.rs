//! Broker-to-HLSS transport.
//!
//! Every HLSS backend is driven through the same four operations:
//! initialize, status, input delivery, and render request. A backend is a
//! value (base URL plus optional bearer credential), not a subclass; the
//! trait exists so the engine can be exercised against a fake backend in
//! tests.

use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;

use slate_wire::{HlssInitRequest, HlssInitResponse, HlssStatusResponse, InputEvent};

/// Where and how to reach one HLSS backend.
#[derive(Debug, Clone)]
pub struct HlssEndpoint {
    pub base_url: String,
    pub auth_token: Option<String>,
}

#[derive(Debug, Error)]
pub enum HlssError {
    #[error("backend timed out")]
    Timeout,
    #[error("backend unreachable: {0}")]
    Connect(String),
    #[error("backend returned status {0}")]
    Status(u16),
    #[error("backend response invalid: {0}")]
    Decode(String),
    #[error("backend protocol error: {0}")]
    Protocol(String),
}

#[async_trait]
pub trait HlssTransport: Send + Sync {
    async fn initialize(
        &self,
        endpoint: &HlssEndpoint,
        request: &HlssInitRequest,
    ) -> Result<HlssInitResponse, HlssError>;

    async fn status(
        &self,
        endpoint: &HlssEndpoint,
        instance_id: &str,
    ) -> Result<HlssStatusResponse, HlssError>;

    async fn forward_input(
        &self,
        endpoint: &HlssEndpoint,
        instance_id: &str,
        event: &InputEvent,
    ) -> Result<(), HlssError>;

    async fn request_render(
        &self,
        endpoint: &HlssEndpoint,
        instance_id: &str,
    ) -> Result<(), HlssError>;
}

/// The production transport: plain HTTP with a bounded timeout on every
/// call, so a stuck backend can never hang a poll or an admin request.
pub struct HttpHlssTransport {
    client: reqwest::Client,
}

impl HttpHlssTransport {
    pub fn new(timeout: Duration) -> Self {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .expect("build hlss http client");
        Self { client }
    }

    fn request(
        &self,
        method: reqwest::Method,
        endpoint: &HlssEndpoint,
        path: &str,
    ) -> reqwest::RequestBuilder {
        let url = format!("{}{}", endpoint.base_url.trim_end_matches('/'), path);
        let mut builder = self.client.request(method, url);
        if let Some(token) = &endpoint.auth_token {
            builder = builder.bearer_auth(token);
        }
        builder
    }
}

#[async_trait]
impl HlssTransport for HttpHlssTransport {
    async fn initialize(
        &self,
        endpoint: &HlssEndpoint,
        request: &HlssInitRequest,
    ) -> Result<HlssInitResponse, HlssError> {
        let response = self
            .request(reqwest::Method::POST, endpoint, "/instances/init")
            .json(request)
            .send()
            .await
            .map_err(map_send_error)?;
        let response = check_status(response)?;
        response
            .json::<HlssInitResponse>()
            .await
            .map_err(|err| HlssError::Decode(err.to_string()))
    }

    async fn status(
        &self,
        endpoint: &HlssEndpoint,
        instance_id: &str,
    ) -> Result<HlssStatusResponse, HlssError> {
        let path = format!("/instances/{instance_id}/status");
        let response = self
            .request(reqwest::Method::GET, endpoint, &path)
            .send()
            .await
            .map_err(map_send_error)?;
        let response = check_status(response)?;
        response
            .json::<HlssStatusResponse>()
            .await
            .map_err(|err| HlssError::Decode(err.to_string()))
    }

    async fn forward_input(
        &self,
        endpoint: &HlssEndpoint,
        instance_id: &str,
        event: &InputEvent,
    ) -> Result<(), HlssError> {
        let path = format!("/instances/{instance_id}/inputs");
        let response = self
            .request(reqwest::Method::POST, endpoint, &path)
            .json(event)
            .send()
            .await
            .map_err(map_send_error)?;
        check_status(response).map(|_| ())
    }

    async fn request_render(
        &self,
        endpoint: &HlssEndpoint,
        instance_id: &str,
    ) -> Result<(), HlssError> {
        let path = format!("/instances/{instance_id}/render");
        let response = self
            .request(reqwest::Method::POST, endpoint, &path)
            .send()
            .await
            .map_err(map_send_error)?;
        check_status(response).map(|_| ())
    }
}

fn map_send_error(err: reqwest::Error) -> HlssError {
    if err.is_timeout() {
        HlssError::Timeout
    } else {
        HlssError::Connect(err.to_string())
    }
}

fn check_status(response: reqwest::Response) -> Result<reqwest::Response, HlssError> {
    let status = response.status();
    if status.is_success() {
        Ok(response)
    } else {
        Err(HlssError::Status(status.as_u16()))
    }
}
