use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use reqwest::header::{
    HeaderMap, HeaderValue, ACCEPT, ACCEPT_CHARSET, ACCEPT_ENCODING, ACCEPT_LANGUAGE, CONNECTION,
    USER_AGENT,
};
use thiserror::Error;
use tracing::{debug, info_span, Instrument};

pub const SEC_COMPANY_TICKERS_URL: &str = "https://www.sec.gov/files/company_tickers.json";

/// Browser-like header set sent with every dataset request.
///
/// The SEC endpoint refuses clients without a recognizable identity, so the
/// defaults mimic a desktop Chrome build.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequestIdentity {
    pub user_agent: String,
    pub accept: String,
    pub accept_charset: String,
    pub accept_encoding: String,
    pub accept_language: String,
    pub connection: String,
}

impl Default for RequestIdentity {
    fn default() -> Self {
        Self {
            user_agent: "Mozilla/5.0 (X11; Linux x86_64) AppleWebKit/537.11 (KHTML, like Gecko) Chrome/23.0.1271.64 Safari/537.11".to_string(),
            accept: "text/html,application/xhtml+xml,application/xml;q=0.9,*/*;q=0.8".to_string(),
            accept_charset: "ISO-8859-1,utf-8;q=0.7,*;q=0.3".to_string(),
            accept_encoding: "none".to_string(),
            accept_language: "en-US,en;q=0.8".to_string(),
            connection: "keep-alive".to_string(),
        }
    }
}

impl RequestIdentity {
    pub fn header_map(&self) -> anyhow::Result<HeaderMap> {
        let mut headers = HeaderMap::new();
        for (name, value) in [
            (USER_AGENT, &self.user_agent),
            (ACCEPT, &self.accept),
            (ACCEPT_CHARSET, &self.accept_charset),
            (ACCEPT_ENCODING, &self.accept_encoding),
            (ACCEPT_LANGUAGE, &self.accept_language),
            (CONNECTION, &self.connection),
        ] {
            let header_value = HeaderValue::from_str(value)
                .with_context(|| format!("invalid value for header {name}: {value:?}"))?;
            headers.insert(name, header_value);
        }
        Ok(headers)
    }
}

#[derive(Debug, Clone)]
pub struct FetcherConfig {
    pub url: String,
    pub identity: RequestIdentity,
    pub timeout: Duration,
}

impl Default for FetcherConfig {
    fn default() -> Self {
        Self {
            url: SEC_COMPANY_TICKERS_URL.to_string(),
            identity: RequestIdentity::default(),
            timeout: Duration::from_secs(30),
        }
    }
}

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("request to {url} failed: {source}")]
    Request {
        url: String,
        #[source]
        source: reqwest::Error,
    },
    #[error("http status {status} for {url}")]
    HttpStatus { status: u16, url: String },
    #[error("request to {url} timed out after {timeout:?}")]
    Timeout { url: String, timeout: Duration },
}

/// Anything that can hand the ingestion cycle one raw payload.
#[async_trait]
pub trait DatasetSource: Send + Sync {
    fn url(&self) -> &str;

    /// One attempt, no retries. The body is returned byte-for-byte.
    async fn fetch(&self) -> Result<Vec<u8>, FetchError>;
}

#[derive(Debug)]
pub struct HttpDatasetFetcher {
    client: reqwest::Client,
    config: FetcherConfig,
}

impl HttpDatasetFetcher {
    pub fn new(config: FetcherConfig) -> anyhow::Result<Self> {
        // Transparent decompression would change the bytes we fingerprint.
        let client = reqwest::Client::builder()
            .gzip(false)
            .brotli(false)
            .timeout(config.timeout)
            .default_headers(config.identity.header_map()?)
            .build()
            .context("building reqwest client")?;

        Ok(Self { client, config })
    }

    fn classify(&self, err: reqwest::Error) -> FetchError {
        if err.is_timeout() {
            FetchError::Timeout {
                url: self.config.url.clone(),
                timeout: self.config.timeout,
            }
        } else {
            FetchError::Request {
                url: self.config.url.clone(),
                source: err,
            }
        }
    }
}

#[async_trait]
impl DatasetSource for HttpDatasetFetcher {
    fn url(&self) -> &str {
        &self.config.url
    }

    async fn fetch(&self) -> Result<Vec<u8>, FetchError> {
        let span = info_span!("http_fetch", url = %self.config.url);
        async {
            let resp = self
                .client
                .get(&self.config.url)
                .send()
                .await
                .map_err(|err| self.classify(err))?;

            let status = resp.status();
            if !status.is_success() {
                return Err(FetchError::HttpStatus {
                    status: status.as_u16(),
                    url: resp.url().to_string(),
                });
            }

            let body = resp.bytes().await.map_err(|err| self.classify(err))?.to_vec();
            debug!(bytes = body.len(), status = status.as_u16(), "dataset fetched");
            Ok(body)
        }
        .instrument(span)
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn config_for(server: &MockServer) -> FetcherConfig {
        FetcherConfig {
            url: format!("{}/files/company_tickers.json", server.uri()),
            timeout: Duration::from_secs(5),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn sends_browser_identity_and_returns_body() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/files/company_tickers.json"))
            .and(header("accept-encoding", "none"))
            .respond_with(ResponseTemplate::new(200).set_body_bytes(b"{}".to_vec()))
            .expect(1)
            .mount(&server)
            .await;

        let fetcher = HttpDatasetFetcher::new(config_for(&server)).unwrap();
        let body = fetcher.fetch().await.unwrap();
        assert_eq!(body, b"{}");

        let identity = RequestIdentity::default();
        let requests = server.received_requests().await.unwrap();
        let headers = &requests[0].headers;
        let sent = |name: &str| headers.get(name).unwrap().to_str().unwrap().to_string();
        assert_eq!(sent("user-agent"), identity.user_agent);
        assert_eq!(sent("accept"), identity.accept);
        assert_eq!(sent("accept-charset"), identity.accept_charset);
        assert_eq!(sent("accept-language"), identity.accept_language);
    }

    #[tokio::test]
    async fn body_is_not_decompressed() {
        let server = MockServer::start().await;
        let raw = vec![0x1f, 0x8b, 0x08, 0x00, 0xde, 0xad, 0xbe, 0xef];
        Mock::given(method("GET"))
            .respond_with(
                ResponseTemplate::new(200)
                    .insert_header("content-encoding", "gzip")
                    .set_body_bytes(raw.clone()),
            )
            .mount(&server)
            .await;

        let fetcher = HttpDatasetFetcher::new(config_for(&server)).unwrap();
        assert_eq!(fetcher.fetch().await.unwrap(), raw);
    }

    #[tokio::test]
    async fn non_success_status_is_an_error() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(403))
            .mount(&server)
            .await;

        let fetcher = HttpDatasetFetcher::new(config_for(&server)).unwrap();
        let err = fetcher.fetch().await.unwrap_err();
        assert!(matches!(err, FetchError::HttpStatus { status: 403, .. }));
    }

    #[tokio::test]
    async fn slow_endpoint_times_out() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(200).set_delay(Duration::from_secs(3)))
            .mount(&server)
            .await;

        let fetcher = HttpDatasetFetcher::new(FetcherConfig {
            timeout: Duration::from_millis(200),
            ..config_for(&server)
        })
        .unwrap();
        let err = fetcher.fetch().await.unwrap_err();
        assert!(matches!(err, FetchError::Timeout { .. }), "got {err:?}");
    }

    #[tokio::test]
    async fn unreachable_host_is_a_request_error() {
        let fetcher = HttpDatasetFetcher::new(FetcherConfig {
            url: "http://127.0.0.1:9/company_tickers.json".to_string(),
            timeout: Duration::from_secs(2),
            ..Default::default()
        })
        .unwrap();
        let err = fetcher.fetch().await.unwrap_err();
        assert!(matches!(err, FetchError::Request { .. } | FetchError::Timeout { .. }));
    }

    #[test]
    fn invalid_header_value_is_rejected() {
        let identity = RequestIdentity {
            user_agent: "bad\nagent".to_string(),
            ..Default::default()
        };
        assert!(identity.header_map().is_err());
    }
}
