//! Outbound HTTP for capture attempts, with sandbox relay routing.
use reqwest::{Client, RequestBuilder, header};
use std::error::Error as StdError;
use std::net::IpAddr;
use std::time::Duration;
use tracing::debug;

use super::CaptureError;
use crate::utils::redact_credentials;

/// Decides whether a request goes out directly or through the local relay.
#[derive(Debug, Clone)]
pub struct NetworkRouting {
    pub sandbox: bool,
    pub relay_url: String,
}

impl NetworkRouting {
    pub fn direct() -> Self {
        Self {
            sandbox: false,
            relay_url: String::new(),
        }
    }

    /// In sandbox mode, local-network URLs are rewritten to go through the relay.
    pub fn route(&self, url: &str) -> (String, bool) {
        if self.sandbox && is_local_network_url(url) {
            let relayed = format!("{}?url={}", self.relay_url, urlencoding::encode(url));
            (relayed, true)
        } else {
            (url.to_string(), false)
        }
    }
}

/// True for private, loopback and link-local hosts plus `.local`/`.lan` names.
pub fn is_local_network_url(url: &str) -> bool {
    let Ok(parsed) = reqwest::Url::parse(url) else {
        return false;
    };
    let Some(host) = parsed.host_str() else {
        return false;
    };
    let host = host.trim_start_matches('[').trim_end_matches(']');
    match host.parse::<IpAddr>() {
        Ok(IpAddr::V4(ip)) => ip.is_private() || ip.is_loopback() || ip.is_link_local(),
        Ok(IpAddr::V6(ip)) => {
            let first = ip.segments()[0];
            ip.is_loopback() || (first & 0xfe00) == 0xfc00 || (first & 0xffc0) == 0xfe80
        }
        Err(_) => {
            let host = host.to_lowercase();
            host == "localhost" || host.ends_with(".local") || host.ends_with(".lan")
        }
    }
}

#[derive(Debug, Clone)]
pub struct HttpPayload {
    pub status: u16,
    pub content_type: Option<String>,
    pub body: Vec<u8>,
}

impl HttpPayload {
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }
}

pub struct HttpFetcher {
    client: Client,
    routing: NetworkRouting,
}

impl HttpFetcher {
    pub fn new(routing: NetworkRouting) -> Result<Self, reqwest::Error> {
        // Per-request timeouts are applied at call sites.
        let client = Client::builder().build()?;
        Ok(Self { client, routing })
    }

    pub async fn get(
        &self,
        url: &str,
        timeout: Duration,
        credentials: Option<(&str, &str)>,
    ) -> Result<HttpPayload, CaptureError> {
        let (routed, relayed) = self.routing.route(url);
        let mut request = self.client.get(&routed).timeout(timeout);
        if let Some((user, password)) = credentials {
            request = request.basic_auth(user, Some(password));
        }
        self.execute(request, url, relayed).await
    }

    pub async fn post_json(
        &self,
        url: &str,
        body: &serde_json::Value,
        timeout: Duration,
    ) -> Result<HttpPayload, CaptureError> {
        let (routed, relayed) = self.routing.route(url);
        let request = self.client.post(&routed).timeout(timeout).json(body);
        self.execute(request, url, relayed).await
    }

    async fn execute(
        &self,
        request: RequestBuilder,
        original_url: &str,
        relayed: bool,
    ) -> Result<HttpPayload, CaptureError> {
        debug!(url = %redact_credentials(original_url), relayed, "Sending capture request.");
        let response = request
            .send()
            .await
            .map_err(|e| classify_request_error(&e, relayed))?;
        let status = response.status().as_u16();
        let content_type = response
            .headers()
            .get(header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .map(|s| s.to_string());
        let body = response
            .bytes()
            .await
            .map_err(|e| classify_request_error(&e, relayed))?
            .to_vec();
        Ok(HttpPayload {
            status,
            content_type,
            body,
        })
    }
}

fn error_chain(e: &reqwest::Error) -> String {
    let mut message = e.to_string();
    let mut source = e.source();
    while let Some(inner) = source {
        message.push_str(": ");
        message.push_str(&inner.to_string());
        source = inner.source();
    }
    redact_credentials(&message)
}

fn classify_request_error(e: &reqwest::Error, relayed: bool) -> CaptureError {
    if e.is_timeout() {
        return CaptureError::Timeout;
    }
    let chain = error_chain(e);
    if e.is_connect() {
        if relayed {
            return CaptureError::Blocked(format!("local relay unreachable ({chain})"));
        }
        if chain.to_lowercase().contains("refused") {
            return CaptureError::ConnectionRefused(chain);
        }
    }
    CaptureError::Request(chain)
}
