use async_trait::async_trait;
use std::time::Duration;
use tracing::debug;

use super::http::{HttpError, HttpHeaders, HttpMethod, HttpRequest, HttpResponse, HttpResult, HttpTransport};

/// Native transport backed by a shared `reqwest` client.
#[derive(Debug, Clone, Default)]
pub struct ReqwestTransport {
    client: reqwest::Client,
}

impl ReqwestTransport {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_client(client: reqwest::Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl HttpTransport for ReqwestTransport {
    async fn execute(&self, request: HttpRequest) -> HttpResult {
        let host = request.url().host().to_string();
        let request_id = request.request_id().to_string();
        let timeout_ms = request.timeout_ms();

        let method = match request.method() {
            HttpMethod::Get => reqwest::Method::GET,
            HttpMethod::Post => reqwest::Method::POST,
            HttpMethod::Put => reqwest::Method::PUT,
            HttpMethod::Patch => reqwest::Method::PATCH,
            HttpMethod::Delete => reqwest::Method::DELETE,
        };

        let mut builder = self
            .client
            .request(method, request.url().as_str())
            .timeout(Duration::from_millis(timeout_ms))
            .header("X-Request-Id", &request_id);
        for (name, value) in request.headers().iter() {
            builder = builder.header(name, value);
        }
        if let Some(body) = request.body() {
            builder = builder.body(body.to_vec());
        }

        let response = builder
            .send()
            .await
            .map_err(|e| map_reqwest_error(e, &host, &request_id, timeout_ms))?;

        let status = response.status().as_u16();
        let mut headers = HttpHeaders::new();
        for (name, value) in response.headers() {
            let Ok(value) = value.to_str() else {
                debug!(request_id = %request_id, header = %name, "non-text header dropped");
                continue;
            };
            // Repeated headers are joined into one comma-separated value.
            // Framing headers such as content-length are refused by
            // HttpHeaders and are not needed above the transport.
            if let Err(e) = headers.append(name.as_str(), value) {
                debug!(request_id = %request_id, header = %name, error = %e, "response header dropped");
            }
        }

        let body = response
            .bytes()
            .await
            .map_err(|e| map_reqwest_error(e, &host, &request_id, timeout_ms))?
            .to_vec();

        debug!(request_id = %request_id, status, bytes = body.len(), "response received");
        Ok(HttpResponse::new(status, headers, body, request_id))
    }
}

fn map_reqwest_error(e: reqwest::Error, host: &str, request_id: &str, timeout_ms: u64) -> HttpError {
    if e.is_timeout() {
        HttpError::Timeout {
            timeout_ms,
            request_id: request_id.to_string(),
        }
    } else if e.is_connect() || e.is_request() {
        HttpError::ConnectionError {
            host: host.to_string(),
            message: e.to_string(),
        }
    } else if e.is_body() || e.is_decode() {
        HttpError::InvalidResponse {
            reason: e.to_string(),
            request_id: request_id.to_string(),
        }
    } else {
        HttpError::ConnectionError {
            host: host.to_string(),
            message: e.to_string(),
        }
    }
}
