use std::time::Duration;

use bytes::Bytes;
use reqwest::redirect::Policy;
use thiserror::Error;
use url::Url;

use super::body::BodyReader;

/// Largest body accepted from any fetch (10MB).
pub const MAX_BODY_SIZE: usize = 10 * 1024 * 1024;

/// Errors from fetching a URL or reading its body.
#[derive(Debug, Error)]
pub enum TransportError {
    /// Network-level error (DNS, TLS, protocol)
    #[error("Request failed: {0}")]
    Request(#[source] reqwest::Error),
    /// Could not connect at all
    #[error("Unable to connect, you may be offline: {0}")]
    Offline(#[source] reqwest::Error),
    /// The client's request timeout elapsed
    #[error("Request timed out")]
    Timeout,
    /// HTTP response with non-2xx status code
    #[error("HTTP error: status {0}")]
    HttpStatus(u16),
    /// The body stopped arriving partway through
    #[error("Connection interrupted: {0}")]
    Interrupted(#[source] reqwest::Error),
    /// Response body exceeded [`MAX_BODY_SIZE`]
    #[error("Response too large")]
    TooLarge,
}

impl From<reqwest::Error> for TransportError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            TransportError::Timeout
        } else if err.is_connect() {
            TransportError::Offline(err)
        } else {
            TransportError::Request(err)
        }
    }
}

/// What the response headers say about a fetched resource.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResponseMeta {
    /// URL after redirects.
    pub final_url: Url,
    /// Host of `final_url`, empty if it has none.
    pub host: String,
    /// Lowercased media type without parameters; empty when not sent.
    pub mime_type: String,
}

impl ResponseMeta {
    /// True when the response is some flavor of XML (`text/xml`,
    /// `application/rss+xml`, ...).
    pub fn is_xml(&self) -> bool {
        self.mime_type.ends_with("xml")
    }
}

/// Create a custom redirect policy with loop detection and limited hops.
///
/// - Limits redirects to 3 hops maximum
/// - Detects redirect loops (same URL appearing twice in chain)
fn redirect_policy() -> Policy {
    Policy::custom(|attempt| {
        if attempt.previous().len() >= 3 {
            return attempt.error("Too many redirects (max 3)");
        }

        let url = attempt.url();
        if attempt.previous().iter().any(|prev| prev == url) {
            return attempt.error("Redirect loop detected");
        }

        tracing::debug!(
            from = %attempt.previous().last().map(|u| u.as_str()).unwrap_or("initial"),
            to = %url,
            hop = attempt.previous().len() + 1,
            "Following redirect"
        );

        attempt.follow()
    })
}

/// Shared HTTP client used by discovery and refresh.
///
/// Cheap to clone; clones share the connection pool.
#[derive(Debug, Clone)]
pub struct Transport {
    client: reqwest::Client,
}

impl Transport {
    pub fn new(user_agent: &str, timeout: Duration) -> Result<Self, TransportError> {
        let client = reqwest::Client::builder()
            .user_agent(user_agent)
            .redirect(redirect_policy())
            .pool_max_idle_per_host(4)
            .pool_idle_timeout(Duration::from_secs(30))
            .tcp_keepalive(Duration::from_secs(60))
            .timeout(timeout)
            .build()
            .map_err(TransportError::Request)?;
        Ok(Self { client })
    }

    /// Issues a GET and waits for the response headers.
    ///
    /// The body is not read; pull it with [`FetchedResponse::next_chunk`] or
    /// [`FetchedResponse::into_reader`]. Dropping the response closes the
    /// connection.
    ///
    /// # Errors
    ///
    /// Connection failures, timeouts, non-2xx statuses, and a declared
    /// `Content-Length` above [`MAX_BODY_SIZE`].
    pub async fn fetch(&self, url: &Url) -> Result<FetchedResponse, TransportError> {
        let response = self.client.get(url.clone()).send().await?;

        let status = response.status();
        if !status.is_success() {
            tracing::debug!(url = %url, status = %status, "Fetch returned error status");
            return Err(TransportError::HttpStatus(status.as_u16()));
        }

        if let Some(len) = response.content_length() {
            if len > MAX_BODY_SIZE as u64 {
                return Err(TransportError::TooLarge);
            }
        }

        let final_url = response.url().clone();
        let host = final_url.host_str().unwrap_or_default().to_owned();
        let mime_type = response
            .headers()
            .get(reqwest::header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .map(media_type)
            .unwrap_or_default();

        tracing::debug!(url = %final_url, mime = %mime_type, "Response headers received");

        Ok(FetchedResponse {
            meta: ResponseMeta {
                final_url,
                host,
                mime_type,
            },
            response,
            received: 0,
        })
    }
}

/// Strips parameters and lowercases a `Content-Type` value.
fn media_type(content_type: &str) -> String {
    content_type
        .split(';')
        .next()
        .unwrap_or_default()
        .trim()
        .to_ascii_lowercase()
}

/// A response whose headers have arrived and whose body has not been read.
#[derive(Debug)]
pub struct FetchedResponse {
    meta: ResponseMeta,
    response: reqwest::Response,
    received: usize,
}

impl FetchedResponse {
    pub fn meta(&self) -> &ResponseMeta {
        &self.meta
    }

    /// Next piece of the body, or `None` once it is complete.
    ///
    /// # Errors
    ///
    /// [`TransportError::Interrupted`] if the connection fails mid-body,
    /// [`TransportError::TooLarge`] once more than [`MAX_BODY_SIZE`] bytes
    /// have arrived.
    pub async fn next_chunk(&mut self) -> Result<Option<Bytes>, TransportError> {
        let chunk = self
            .response
            .chunk()
            .await
            .map_err(TransportError::Interrupted)?;

        if let Some(chunk) = &chunk {
            self.received = self.received.saturating_add(chunk.len());
            if self.received > MAX_BODY_SIZE {
                return Err(TransportError::TooLarge);
            }
        }
        Ok(chunk)
    }

    /// Hands the body to a blocking reader for parsing off the async runtime.
    ///
    /// Must be called within a Tokio runtime. Dropping the reader cancels the
    /// transfer.
    pub fn into_reader(self) -> BodyReader {
        BodyReader::spawn(self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn transport() -> Transport {
        Transport::new("feedline-test", Duration::from_secs(5)).unwrap()
    }

    #[test]
    fn test_media_type() {
        assert_eq!(media_type("text/HTML; charset=UTF-8"), "text/html");
        assert_eq!(media_type("application/rss+xml"), "application/rss+xml");
        assert_eq!(media_type(""), "");
    }

    #[test]
    fn test_is_xml() {
        let meta = |mime: &str| ResponseMeta {
            final_url: Url::parse("https://example.com").unwrap(),
            host: "example.com".into(),
            mime_type: mime.into(),
        };
        assert!(meta("application/atom+xml").is_xml());
        assert!(meta("text/xml").is_xml());
        assert!(!meta("text/html").is_xml());
        assert!(!meta("").is_xml());
    }

    #[tokio::test]
    async fn test_fetch_reports_meta_and_body() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/feed"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_raw("<rss/>", "Application/RSS+XML; charset=utf-8"),
            )
            .mount(&server)
            .await;

        let url = Url::parse(&format!("{}/feed", server.uri())).unwrap();
        let mut response = transport().fetch(&url).await.unwrap();

        assert_eq!(response.meta().mime_type, "application/rss+xml");
        assert_eq!(response.meta().host, "127.0.0.1");
        assert_eq!(response.meta().final_url, url);

        let mut body = Vec::new();
        while let Some(chunk) = response.next_chunk().await.unwrap() {
            body.extend_from_slice(&chunk);
        }
        assert_eq!(body, b"<rss/>");
    }

    #[tokio::test]
    async fn test_missing_content_type_is_empty() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(200).set_body_bytes(b"hello".to_vec()))
            .mount(&server)
            .await;

        let url = Url::parse(&server.uri()).unwrap();
        let response = transport().fetch(&url).await.unwrap();
        assert_eq!(response.meta().mime_type, "");
    }

    #[tokio::test]
    async fn test_error_status() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(404))
            .mount(&server)
            .await;

        let url = Url::parse(&server.uri()).unwrap();
        let result = transport().fetch(&url).await;
        assert!(matches!(result, Err(TransportError::HttpStatus(404))));
    }

    #[tokio::test]
    async fn test_connection_refused_is_offline() {
        // Bind then drop a listener to get a port nothing is serving
        let port = {
            let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
            listener.local_addr().unwrap().port()
        };
        let url = Url::parse(&format!("http://127.0.0.1:{port}/")).unwrap();

        let result = transport().fetch(&url).await;
        assert!(matches!(result, Err(TransportError::Offline(_))));
    }
}
