use anyhow::{Context, Result};
use serde::de::DeserializeOwned;
use std::collections::BTreeMap;
use std::time::Duration;

/// Failure of a single remote call.
///
/// Everything here is recoverable at the unit level: the caller logs it and
/// skips the run or tag it was fetching.
#[derive(Debug, thiserror::Error)]
pub enum FetchError {
    /// 404/410, e.g. a log bundle past its retention window.
    #[error("not found: {url}")]
    NotFound { url: String },
    #[error("HTTP {status} from {url}")]
    Status { status: u16, url: String },
    #[error("request to {url} failed: {message}")]
    Transport { url: String, message: String },
    #[error("decoding response from {url}: {message}")]
    Decode { url: String, message: String },
}

impl FetchError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, FetchError::NotFound { .. })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Method {
    Get,
    Head,
}

#[derive(Debug, Clone)]
pub struct HttpRequest {
    pub method: Method,
    pub url: String,
    pub query: Vec<(String, String)>,
    pub headers: Vec<(String, String)>,
    /// Overrides the client-wide timeout (log bundles can be large).
    pub timeout: Option<Duration>,
}

impl HttpRequest {
    pub fn get(url: impl Into<String>) -> Self {
        Self::new(Method::Get, url.into())
    }

    pub fn head(url: impl Into<String>) -> Self {
        Self::new(Method::Head, url.into())
    }

    fn new(method: Method, url: String) -> Self {
        HttpRequest {
            method,
            url,
            query: Vec::new(),
            headers: Vec::new(),
            timeout: None,
        }
    }

    pub fn query(mut self, name: &str, value: impl ToString) -> Self {
        self.query.push((name.to_string(), value.to_string()));
        self
    }

    pub fn header(mut self, name: &str, value: impl Into<String>) -> Self {
        self.headers.push((name.to_string(), value.into()));
        self
    }

    pub fn headers(mut self, headers: &[(String, String)]) -> Self {
        self.headers.extend_from_slice(headers);
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    #[cfg(test)]
    pub fn query_value(&self, name: &str) -> Option<&str> {
        self.query
            .iter()
            .find(|(k, _)| k == name)
            .map(|(_, v)| v.as_str())
    }

    #[cfg(test)]
    pub fn header_value(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }
}

#[derive(Debug, Clone, Default)]
pub struct HttpResponse {
    pub status: u16,
    /// Lower-cased header names.
    pub headers: BTreeMap<String, String>,
    pub body: Vec<u8>,
}

impl HttpResponse {
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .get(&name.to_ascii_lowercase())
            .map(|v| v.as_str())
    }

    /// Map non-2xx statuses to a [`FetchError`].
    pub fn error_for_status(self, url: &str) -> Result<Self, FetchError> {
        match self.status {
            200..=299 => Ok(self),
            404 | 410 => Err(FetchError::NotFound {
                url: url.to_string(),
            }),
            status => Err(FetchError::Status {
                status,
                url: url.to_string(),
            }),
        }
    }

    pub fn json<T: DeserializeOwned>(&self, url: &str) -> Result<T, FetchError> {
        serde_json::from_slice(&self.body).map_err(|e| FetchError::Decode {
            url: url.to_string(),
            message: e.to_string(),
        })
    }
}

/// The one place remote calls leave the process.
///
/// Clients are generic over this so tests can drive them with canned
/// responses and count requests.
pub trait Transport {
    async fn send(&self, request: &HttpRequest) -> Result<HttpResponse, FetchError>;

    /// GET, check the status, decode JSON.
    async fn get_json<T: DeserializeOwned>(&self, request: &HttpRequest) -> Result<T, FetchError> {
        let response = self.send(request).await?.error_for_status(&request.url)?;
        response.json(&request.url)
    }
}

#[derive(Clone)]
pub struct ReqwestTransport {
    client: reqwest::Client,
}

impl ReqwestTransport {
    pub fn new(timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .user_agent(concat!("ci-telemetry/", env!("CARGO_PKG_VERSION")))
            .build()
            .context("building HTTP client")?;
        Ok(ReqwestTransport { client })
    }
}

impl Transport for ReqwestTransport {
    async fn send(&self, request: &HttpRequest) -> Result<HttpResponse, FetchError> {
        let mut builder = match request.method {
            Method::Get => self.client.get(&request.url),
            Method::Head => self.client.head(&request.url),
        };
        if !request.query.is_empty() {
            builder = builder.query(&request.query);
        }
        for (name, value) in &request.headers {
            builder = builder.header(name.as_str(), value.as_str());
        }
        if let Some(timeout) = request.timeout {
            builder = builder.timeout(timeout);
        }

        let transport_err = |e: reqwest::Error| FetchError::Transport {
            url: request.url.clone(),
            message: e.to_string(),
        };

        let response = builder.send().await.map_err(transport_err)?;
        let status = response.status().as_u16();
        let headers = response
            .headers()
            .iter()
            .filter_map(|(name, value)| {
                value
                    .to_str()
                    .ok()
                    .map(|v| (name.as_str().to_ascii_lowercase(), v.to_string()))
            })
            .collect();
        let body = response.bytes().await.map_err(transport_err)?.to_vec();

        tracing::debug!("{:?} {} -> {}", request.method, request.url, status);
        Ok(HttpResponse {
            status,
            headers,
            body,
        })
    }
}


#[cfg(test)]
mod tests {
    use super::testing::*;
    use super::*;

    #[test]
    fn test_error_for_status() {
        let ok = status_response(204).error_for_status("u");
        assert!(ok.is_ok());

        let gone = status_response(410).error_for_status("u").unwrap_err();
        assert!(gone.is_not_found());

        let missing = status_response(404).error_for_status("u").unwrap_err();
        assert!(missing.is_not_found());

        let forbidden = status_response(403).error_for_status("u").unwrap_err();
        assert!(matches!(forbidden, FetchError::Status { status: 403, .. }));
    }

    #[test]
    fn test_header_lookup_is_case_insensitive() {
        let mut response = status_response(200);
        response
            .headers
            .insert("docker-content-digest".to_string(), "sha256:abc".to_string());
        assert_eq!(response.header("Docker-Content-Digest"), Some("sha256:abc"));

        let request = HttpRequest::get("u").header("Accept", "application/json");
        assert_eq!(request.header_value("accept"), Some("application/json"));
    }

    #[tokio::test]
    async fn test_get_json_decodes_and_reports_bad_bodies() {
        let transport = FakeTransport::new(|req: &HttpRequest| {
            if req.url.ends_with("/good") {
                json_response(serde_json::json!({"token": "abc"}))
            } else {
                HttpResponse {
                    status: 200,
                    body: b"not json".to_vec(),
                    ..Default::default()
                }
            }
        });

        let good: serde_json::Value = transport
            .get_json(&HttpRequest::get("https://x/good"))
            .await
            .unwrap();
        assert_eq!(good["token"], "abc");

        let bad = transport
            .get_json::<serde_json::Value>(&HttpRequest::get("https://x/bad"))
            .await
            .unwrap_err();
        assert!(matches!(bad, FetchError::Decode { .. }));
        assert_eq!(transport.requests().len(), 2);
    }

    #[test]
    fn test_request_builder() {
        let request = HttpRequest::get("https://api.github.com/x")
            .query("per_page", 100)
            .query("page", 2)
            .timeout(Duration::from_secs(5));
        assert_eq!(request.query_value("page"), Some("2"));
        assert_eq!(request.query_value("status"), None);
        assert_eq!(request.timeout, Some(Duration::from_secs(5)));
    }
}
