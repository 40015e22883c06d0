//! Text acquisition for endpoint, service and device targets.
use std::sync::Arc;
use std::time::{Duration, Instant};

use super::http::HttpFetcher;
use super::{AttemptTrace, CaptureError, CaptureFailure, CaptureRequest, classify_failure};
use crate::monitor::models::{CaptureMetadata, CaptureMethod, Sample, TargetKind};
use crate::utils::truncate_on_char_boundary;

pub struct TextFetcher {
    http: Arc<HttpFetcher>,
    timeout: Duration,
    max_bytes: usize,
}

impl TextFetcher {
    pub fn new(http: Arc<HttpFetcher>, timeout: Duration, max_bytes: usize) -> Self {
        Self {
            http,
            timeout,
            max_bytes,
        }
    }

    pub fn url_for(request: &CaptureRequest) -> String {
        let with_scheme = |raw: &str| {
            if raw.contains("://") {
                raw.to_string()
            } else {
                format!("http://{raw}")
            }
        };
        match request.kind {
            TargetKind::Device => request
                .http_url
                .as_deref()
                .map(with_scheme)
                .unwrap_or_else(|| format!("http://{}/", request.address.trim_end_matches('/'))),
            _ => with_scheme(&request.address),
        }
    }

    pub async fn fetch(&self, request: &CaptureRequest) -> Result<(Sample, CaptureMetadata), CaptureFailure> {
        let started = Instant::now();
        let url = Self::url_for(request);
        let mut trace = AttemptTrace::default();

        let result = self
            .http
            .get(&url, self.timeout, request.auth.credentials())
            .await
            .and_then(|payload| {
                if payload.is_success() {
                    Ok(payload.body)
                } else if matches!(payload.status, 401 | 403) {
                    Err(CaptureError::Unauthorized(format!("HTTP {}", payload.status)))
                } else {
                    Err(CaptureError::Status(payload.status))
                }
            });

        match result {
            Ok(body) => {
                let mut text = String::from_utf8_lossy(&body).into_owned();
                let truncated = truncate_on_char_boundary(&mut text, self.max_bytes);
                trace.record(
                    "http",
                    if truncated {
                        format!("ok ({} bytes, truncated to {})", body.len(), text.len())
                    } else {
                        format!("ok ({} bytes)", body.len())
                    },
                );
                let metadata = CaptureMetadata {
                    method: CaptureMethod::Http,
                    resolution: None,
                    byte_size: text.len(),
                    latency_ms: started.elapsed().as_millis() as u64,
                    failure_reason: None,
                    attempts: trace.into_lines(),
                };
                Ok((Sample::Text(text), metadata))
            }
            Err(e) => {
                trace.record("http", e.to_string());
                let reason = classify_failure(trace.lines());
                Err(CaptureFailure {
                    metadata: CaptureMetadata {
                        method: CaptureMethod::None,
                        resolution: None,
                        byte_size: 0,
                        latency_ms: started.elapsed().as_millis() as u64,
                        failure_reason: Some(reason.clone()),
                        attempts: trace.into_lines(),
                    },
                    reason,
                })
            }
        }
    }
}
