use http::StatusCode;
use http::header::{CONTENT_TYPE, RETRY_AFTER};
use reqwest::Client;
use std::future::Future;
use url::Url;

use crate::upstream::headers::parse_retry_after;
use crate::upstream::{UpstreamConfig, UpstreamError, UpstreamKey};
use crate::{ErrorKind, Result};

/// A successful provider response
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProviderResponse {
    /// Status returned by the provider, always a success status
    pub status: StatusCode,
    /// Value of the `Content-Type` header
    pub content_type: Option<String>,
    /// Response body
    pub body: String,
}

/// HTTP client for one provider.
///
/// Requests are not sent directly; [`ProviderClient::fetch`] returns a task
/// to be submitted to the provider's [`Broker`](crate::upstream::Broker)
/// queue. A `429 Too Many Requests` answer becomes
/// [`UpstreamError::RateLimited`] with the delay from `Retry-After`, which
/// makes the queue pause.
#[derive(Debug, Clone)]
pub struct ProviderClient {
    key: UpstreamKey,
    base_url: Url,
    client: Client,
}

impl ProviderClient {
    /// Create a client for the provider at `base_url`
    ///
    /// # Errors
    ///
    /// Returns an error if the HTTP client cannot be built
    pub fn new(key: UpstreamKey, base_url: Url, config: &UpstreamConfig) -> Result<Self> {
        let client = Client::builder()
            .timeout(config.timeout)
            .user_agent(config.user_agent.clone())
            .default_headers(config.headers.clone())
            .gzip(true)
            .build()
            .map_err(|e| ErrorKind::BuildProviderClient(key.to_string(), e))?;
        Ok(Self {
            key,
            base_url,
            client,
        })
    }

    /// Create a client from an upstream configuration, if it names a provider
    ///
    /// # Errors
    ///
    /// Returns an error if the HTTP client cannot be built
    pub fn from_config(key: &UpstreamKey, config: &UpstreamConfig) -> Result<Option<Self>> {
        config
            .base_url
            .clone()
            .map(|base_url| Self::new(key.clone(), base_url, config))
            .transpose()
    }

    /// The upstream this client talks to
    #[must_use]
    pub const fn key(&self) -> &UpstreamKey {
        &self.key
    }

    /// Resolve a path (with optional query) against the base URL.
    ///
    /// The path is appended to the base URL's path, so a base of
    /// `https://lichess.org/api` and a path of `user/magnus` give
    /// `https://lichess.org/api/user/magnus`. The result always stays on the
    /// provider's origin and below its base path.
    ///
    /// # Errors
    ///
    /// Returns [`ErrorKind::PathOutsideBase`] for an absolute URL, a path with
    /// `.` or `..` segments (also percent-encoded) or an encoded separator,
    /// and [`ErrorKind::InvalidUrl`] if the result is not a valid URL
    pub fn url(&self, path_and_query: &str) -> Result<Url> {
        let relative = path_and_query.trim_start_matches('/');
        let outside = || ErrorKind::PathOutsideBase(path_and_query.to_string());
        if Url::parse(relative).is_ok() || !is_plain_path(relative) {
            return Err(outside());
        }

        let mut base = self.base_url.clone();
        if !base.path().ends_with('/') {
            base.set_path(&format!("{}/", base.path()));
        }
        let url = base.join(relative)?;

        let same_origin = url.scheme() == base.scheme()
            && url.host() == base.host()
            && url.port_or_known_default() == base.port_or_known_default();
        if !same_origin || !url.path().starts_with(base.path()) {
            return Err(outside());
        }
        Ok(url)
    }

    /// A task fetching `path_and_query` from the provider
    ///
    /// # Errors
    ///
    /// Returns an error if the URL cannot be built. Request failures are
    /// reported by the returned task.
    pub fn fetch(
        &self,
        path_and_query: &str,
    ) -> Result<impl Future<Output = std::result::Result<ProviderResponse, UpstreamError>> + Send + 'static>
    {
        let url = self.url(path_and_query)?;
        let client = self.client.clone();
        let key = self.key.clone();
        Ok(async move {
            log::debug!("Fetching {url} from {key}");
            let response = client
                .get(url)
                .send()
                .await
                .map_err(UpstreamError::Network)?;

            let status = response.status();
            if status == StatusCode::TOO_MANY_REQUESTS {
                let retry_after = response
                    .headers()
                    .get(RETRY_AFTER)
                    .and_then(|value| parse_retry_after(value).ok());
                return Err(UpstreamError::RateLimited { retry_after });
            }
            if !status.is_success() {
                return Err(UpstreamError::Status(status));
            }

            let content_type = response
                .headers()
                .get(CONTENT_TYPE)
                .and_then(|value| value.to_str().ok())
                .map(ToString::to_string);
            let body = response.text().await.map_err(UpstreamError::Body)?;
            Ok(ProviderResponse {
                status,
                content_type,
                body,
            })
        })
    }
}

/// Check that the path part of `path_and_query` has no dot segments and no
/// encoded separators
fn is_plain_path(path_and_query: &str) -> bool {
    let path = path_and_query
        .split(['?', '#'])
        .next()
        .unwrap_or_default();
    let lower = path.to_ascii_lowercase();
    if lower.contains("%2f") || lower.contains("%5c") {
        return false;
    }
    lower.split(['/', '\\']).all(|segment| {
        let segment = segment.replace("%2e", ".");
        segment != "." && segment != ".."
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;
    use std::time::Duration;
    use test_utils::{mock_provider, throttling_provider};
    use wiremock::matchers::{header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    async fn client(server: &MockServer) -> ProviderClient {
        let base_url = Url::parse(&format!("{}/api", server.uri())).unwrap();
        ProviderClient::new("lichess".into(), base_url, &UpstreamConfig::default()).unwrap()
    }

    #[test]
    fn test_url_joins_below_base_path() {
        let base_url = Url::parse("https://lichess.org/api").unwrap();
        let client =
            ProviderClient::new("lichess".into(), base_url, &UpstreamConfig::default()).unwrap();
        assert_eq!(
            client.url("/user/magnus?perf=blitz").unwrap().as_str(),
            "https://lichess.org/api/user/magnus?perf=blitz"
        );
        assert_eq!(
            client.url("user/magnus").unwrap().as_str(),
            "https://lichess.org/api/user/magnus"
        );
    }

    #[rstest]
    #[case("http://evil.example/steal")]
    #[case("mailto:someone@evil.example")]
    #[case("../../admin")]
    #[case("user/../../admin")]
    #[case("./user/magnus")]
    #[case("user/%2e%2E/%2e%2e/admin")]
    #[case("user%2F..%2Fadmin")]
    #[case("user\\..\\..\\admin")]
    fn test_url_rejects_paths_leaving_base(#[case] path: &str) {
        let base_url = Url::parse("https://lichess.org/api").unwrap();
        let client =
            ProviderClient::new("lichess".into(), base_url, &UpstreamConfig::default()).unwrap();
        let result = client.url(path);
        assert!(
            matches!(result, Err(ErrorKind::PathOutsideBase(_))),
            "{path}: {result:?}"
        );
    }

    #[test]
    fn test_url_allows_dots_inside_segments_and_query() {
        let base_url = Url::parse("https://api.chess.com/pub").unwrap();
        let client =
            ProviderClient::new("chess.com".into(), base_url, &UpstreamConfig::default()).unwrap();
        assert_eq!(
            client.url("player/hikaru.nakamura?next=../x").unwrap().as_str(),
            "https://api.chess.com/pub/player/hikaru.nakamura?next=../x"
        );
        // Leading slashes never make the path host-relative
        assert_eq!(
            client.url("//evil.example/steal").unwrap().as_str(),
            "https://api.chess.com/pub/evil.example/steal"
        );
    }

    #[tokio::test]
    async fn test_fetch_success() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/api/user/magnus"))
            .and(header("user-agent", crate::upstream::DEFAULT_USER_AGENT))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_raw(r#"{"id":"magnus"}"#, "application/json"),
            )
            .expect(1)
            .mount(&server)
            .await;

        let response = client(&server).await.fetch("user/magnus").unwrap().await.unwrap();
        assert_eq!(response.status, StatusCode::OK);
        assert_eq!(response.content_type.as_deref(), Some("application/json"));
        assert_eq!(response.body, r#"{"id":"magnus"}"#);
    }

    #[tokio::test]
    async fn test_fetch_maps_429_with_retry_after() {
        let server = throttling_provider!("2");

        let error = client(&server).await.fetch("user/magnus").unwrap().await.unwrap_err();
        assert!(matches!(
            error,
            UpstreamError::RateLimited { retry_after: Some(d) } if d == Duration::from_secs(2)
        ));
    }

    #[tokio::test]
    async fn test_fetch_maps_429_without_retry_after() {
        let server = throttling_provider!();

        let error = client(&server).await.fetch("games").unwrap().await.unwrap_err();
        assert!(matches!(error, UpstreamError::RateLimited { retry_after: None }));
    }

    #[tokio::test]
    async fn test_fetch_passes_other_statuses_through() {
        let server = mock_provider!(503);

        let error = client(&server).await.fetch("games").unwrap().await.unwrap_err();
        assert!(matches!(
            error,
            UpstreamError::Status(StatusCode::SERVICE_UNAVAILABLE)
        ));
    }

    #[test]
    fn test_from_config_without_base_url() {
        let client =
            ProviderClient::from_config(&"lichess".into(), &UpstreamConfig::default()).unwrap();
        assert!(client.is_none());
    }
}
