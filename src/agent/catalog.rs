//! Catalog Client
//!
//! Fetches the manifest document and raw artifact bytes from the remote
//! object store over HTTP GET with a bearer token. The client is stateless
//! between calls and never retries; the orchestrator owns the retry policy.

use std::io::Read;
use std::time::Duration;

use thiserror::Error;

use super::config::AgentConfig;

/// Manifest document path under the catalog base URL.
pub const MANIFEST_PATH: &str = "manifest.json";

/// Generous cap on the manifest document itself.
const MANIFEST_SIZE_LIMIT: usize = 128 * 1024;

/// Slack on top of the artifact bound so a cap violation is reported as
/// `BodyTooLarge` by the transport rather than a short read.
const ARTIFACT_HEADER_ALLOWANCE: usize = 1024;

#[derive(Error, Debug)]
pub enum CatalogError {
    #[error("not connected: {0}")]
    NotConnected(String),
    #[error("request timed out")]
    Timeout,
    #[error("catalog returned HTTP {0}")]
    HttpStatus(u16),
    #[error("response body exceeds {limit} bytes")]
    BodyTooLarge { limit: usize },
    #[error("malformed response: {0}")]
    Malformed(String),
    #[error("http client setup failed: {0}")]
    Client(String),
}

impl CatalogError {
    /// Transport errors worth retrying with backoff; format and size errors
    /// are not going to improve on a second attempt.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            CatalogError::NotConnected(_) | CatalogError::Timeout | CatalogError::HttpStatus(_)
        )
    }
}

/// The catalog operations the orchestrator depends on.
///
/// [`CatalogClient`] is the production implementation; tests substitute an
/// in-memory one.
pub trait Catalog {
    fn fetch_manifest(&self) -> Result<Vec<u8>, CatalogError>;
    fn fetch_artifact(&self, path: &str) -> Result<Vec<u8>, CatalogError>;
}

/// HTTP catalog client.
pub struct CatalogClient {
    http: reqwest::blocking::Client,
    base_url: String,
    bearer_token: String,
    manifest_timeout: Duration,
    artifact_timeout: Duration,
    max_artifact_size: usize,
}

impl CatalogClient {
    pub fn new(config: &AgentConfig) -> Result<Self, CatalogError> {
        let http = reqwest::blocking::Client::builder()
            .user_agent(concat!("ota-agent/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| CatalogError::Client(e.to_string()))?;
        Ok(Self {
            http,
            base_url: config.catalog_base_url.trim_end_matches('/').to_string(),
            bearer_token: config.catalog_bearer_token.clone(),
            manifest_timeout: config.manifest_timeout(),
            artifact_timeout: config.artifact_timeout(),
            max_artifact_size: config.max_artifact_size,
        })
    }

    fn get(&self, path: &str, timeout: Duration, limit: usize) -> Result<Vec<u8>, CatalogError> {
        let url = format!("{}/{}", self.base_url, path);
        let response = self
            .http
            .get(&url)
            .bearer_auth(&self.bearer_token)
            .timeout(timeout)
            .send()
            .map_err(classify_transport)?;

        let status = response.status();
        if !status.is_success() {
            return Err(CatalogError::HttpStatus(status.as_u16()));
        }

        if let Some(len) = response.content_length() {
            if len > limit as u64 {
                return Err(CatalogError::BodyTooLarge { limit });
            }
        }

        // The declared length is advisory; cap the actual read as well.
        let mut body = Vec::new();
        response
            .take(limit as u64 + 1)
            .read_to_end(&mut body)
            .map_err(classify_read)?;
        if body.len() > limit {
            return Err(CatalogError::BodyTooLarge { limit });
        }
        Ok(body)
    }
}

impl Catalog for CatalogClient {
    fn fetch_manifest(&self) -> Result<Vec<u8>, CatalogError> {
        self.get(MANIFEST_PATH, self.manifest_timeout, MANIFEST_SIZE_LIMIT)
    }

    fn fetch_artifact(&self, path: &str) -> Result<Vec<u8>, CatalogError> {
        let limit = self.max_artifact_size + ARTIFACT_HEADER_ALLOWANCE;
        self.get(path, self.artifact_timeout, limit)
    }
}

fn classify_transport(e: reqwest::Error) -> CatalogError {
    if e.is_timeout() {
        CatalogError::Timeout
    } else if e.is_connect() || e.is_request() {
        CatalogError::NotConnected(e.to_string())
    } else {
        CatalogError::Malformed(e.to_string())
    }
}

fn classify_read(e: std::io::Error) -> CatalogError {
    if e.kind() == std::io::ErrorKind::TimedOut {
        CatalogError::Timeout
    } else {
        CatalogError::Malformed(e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use std::net::TcpListener;
    use std::thread;

    /// One-shot HTTP server that answers a single request with a canned
    /// response and returns the request head it saw.
    fn serve_once(status_line: &'static str, body: Vec<u8>) -> (String, thread::JoinHandle<String>) {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let handle = thread::spawn(move || {
            let (mut stream, _) = listener.accept().unwrap();
            let mut request = Vec::new();
            let mut buf = [0u8; 1024];
            loop {
                let n = stream.read(&mut buf).unwrap();
                request.extend_from_slice(&buf[..n]);
                if request.windows(4).any(|w| w == b"\r\n\r\n") || n == 0 {
                    break;
                }
            }
            let header = format!(
                "{status_line}\r\nContent-Length: {}\r\nConnection: close\r\n\r\n",
                body.len()
            );
            // the client may hang up early (e.g. after a too-large
            // Content-Length); that is not a server-side failure
            let _ = stream.write_all(header.as_bytes());
            let _ = stream.write_all(&body);
            String::from_utf8_lossy(&request).into_owned()
        });
        (format!("http://{addr}"), handle)
    }

    fn client_for(base_url: &str) -> CatalogClient {
        let config = AgentConfig::for_device(base_url, "secret-token", "dev-1");
        CatalogClient::new(&config).unwrap()
    }

    #[test]
    fn test_fetch_manifest_sends_bearer_token() {
        let (base, server) = serve_once("HTTP/1.1 200 OK", b"{\"modules\":{}}".to_vec());
        let client = client_for(&base);

        let body = client.fetch_manifest().unwrap();
        assert_eq!(body, b"{\"modules\":{}}");

        let request = server.join().unwrap();
        assert!(request.starts_with("GET /manifest.json HTTP/1.1"));
        assert!(request.contains("authorization: Bearer secret-token")
            || request.contains("Authorization: Bearer secret-token"));
    }

    #[test]
    fn test_http_error_is_classified() {
        let (base, server) = serve_once("HTTP/1.1 404 Not Found", Vec::new());
        let client = client_for(&base);
        assert!(matches!(
            client.fetch_artifact("sg/sg-v9.9.9.bin"),
            Err(CatalogError::HttpStatus(404))
        ));
        server.join().unwrap();
    }

    #[test]
    fn test_artifact_body_cap() {
        let mut config = AgentConfig::for_device("http://unused", "tok", "dev-1");
        config.max_artifact_size = 16;
        let oversized = vec![0u8; 16 + ARTIFACT_HEADER_ALLOWANCE + 1];

        let (base, server) = serve_once("HTTP/1.1 200 OK", oversized);
        config.catalog_base_url = base;
        let client = CatalogClient::new(&config).unwrap();
        assert!(matches!(
            client.fetch_artifact("sg/latest.bin"),
            Err(CatalogError::BodyTooLarge { .. })
        ));
        server.join().unwrap();
    }

    #[test]
    fn test_connection_refused_is_not_connected() {
        // Bind then drop to get a port nothing listens on.
        let addr = {
            let listener = TcpListener::bind("127.0.0.1:0").unwrap();
            listener.local_addr().unwrap()
        };
        let client = client_for(&format!("http://{addr}"));
        assert!(matches!(
            client.fetch_manifest(),
            Err(CatalogError::NotConnected(_)) | Err(CatalogError::Timeout)
        ));
    }

    #[test]
    fn test_retryable_classification() {
        assert!(CatalogError::Timeout.is_retryable());
        assert!(CatalogError::NotConnected("x".into()).is_retryable());
        assert!(CatalogError::HttpStatus(503).is_retryable());
        assert!(!CatalogError::BodyTooLarge { limit: 1 }.is_retryable());
        assert!(!CatalogError::Malformed("x".into()).is_retryable());
    }
}
