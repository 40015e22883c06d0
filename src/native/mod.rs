//! Client for the native frame service that sits behind a remote-invocation
//! boundary. It decodes live streams and resizes frames; this crate only
//! sees bytes in and bytes out.
use async_trait::async_trait;
use reqwest::Client;
use serde_json::json;
use std::time::Duration;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum NativeError {
    #[error("Native backend request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("Native backend returned {status}: {body}")]
    Backend { status: u16, body: String },
    #[error("Native backend returned an empty frame")]
    EmptyFrame,
}

#[async_trait]
pub trait NativeBackend: Send + Sync {
    /// Grabs the most recent frame of `stream_url` as encoded image bytes.
    async fn capture_frame(&self, stream_url: &str) -> Result<Vec<u8>, NativeError>;

    /// Re-encodes `bytes` no wider than `max_width`.
    async fn resize(&self, bytes: &[u8], max_width: u32) -> Result<Vec<u8>, NativeError>;
}

/// Talks to the native service over loopback HTTP.
pub struct HttpNativeBackend {
    client: Client,
    base_url: String,
}

impl HttpNativeBackend {
    pub fn new(base_url: impl Into<String>, timeout: Duration) -> Result<Self, NativeError> {
        let client = Client::builder().timeout(timeout).build()?;
        Ok(Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
        })
    }

    async fn read_frame(response: reqwest::Response) -> Result<Vec<u8>, NativeError> {
        let status = response.status();
        if !status.is_success() {
            let body = response
                .text()
                .await
                .unwrap_or_else(|_| "Failed to read error body".to_string());
            return Err(NativeError::Backend {
                status: status.as_u16(),
                body,
            });
        }
        let bytes = response.bytes().await?;
        if bytes.is_empty() {
            return Err(NativeError::EmptyFrame);
        }
        Ok(bytes.to_vec())
    }
}

#[async_trait]
impl NativeBackend for HttpNativeBackend {
    async fn capture_frame(&self, stream_url: &str) -> Result<Vec<u8>, NativeError> {
        let response = self
            .client
            .post(format!("{}/capture", self.base_url))
            .json(&json!({ "url": stream_url }))
            .send()
            .await?;
        Self::read_frame(response).await
    }

    async fn resize(&self, bytes: &[u8], max_width: u32) -> Result<Vec<u8>, NativeError> {
        let response = self
            .client
            .post(format!("{}/resize?max_width={max_width}", self.base_url))
            .header(reqwest::header::CONTENT_TYPE, "application/octet-stream")
            .body(bytes.to_vec())
            .send()
            .await?;
        Self::read_frame(response).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::{Router, body::Bytes, http::StatusCode, routing::post};

    async fn spawn_backend() -> String {
        let app = Router::new()
            .route("/capture", post(|| async { vec![0xFFu8, 0xD8, 0xFF] }))
            .route(
                "/resize",
                post(|body: Bytes| async move {
                    if body.is_empty() {
                        (StatusCode::BAD_REQUEST, b"no body".to_vec())
                    } else {
                        (StatusCode::OK, body[..1].to_vec())
                    }
                }),
            );
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        format!("http://{addr}")
    }

    #[tokio::test]
    async fn test_capture_and_resize() {
        let base = spawn_backend().await;
        let backend = HttpNativeBackend::new(base, Duration::from_secs(2)).unwrap();

        let frame = backend.capture_frame("rtsp://10.0.0.5/stream").await.unwrap();
        assert_eq!(frame, vec![0xFF, 0xD8, 0xFF]);

        let resized = backend.resize(&[9, 8, 7], 320).await.unwrap();
        assert_eq!(resized, vec![9]);

        let err = backend.resize(&[], 320).await.unwrap_err();
        assert!(matches!(err, NativeError::Backend { status: 400, .. }));
    }
}
