use hmac::{Hmac, Mac};
use reqwest::header::{HeaderMap, RETRY_AFTER};
use reqwest::{Client, StatusCode};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use sha2::Sha256;
use std::collections::BTreeMap;
use std::time::Duration;
use url::Url;

use super::{Account, Direction, FetchError, Page, PagedFetcher};
use crate::config::InstagramConfig;
use crate::error::{Result, SocialGraphError};

type HmacSha256 = Hmac<Sha256>;

const RATE_LIMIT_REMAINING: &str = "x-ratelimit-remaining";

/// Response envelope shared by every v1 endpoint
#[derive(Deserialize)]
struct Envelope<T> {
    #[serde(default)]
    meta: Meta,
    data: Option<T>,
    #[serde(default)]
    pagination: Pagination,
}

#[derive(Deserialize, Default)]
struct Meta {
    #[serde(default)]
    error_type: Option<String>,
    #[serde(default)]
    error_message: Option<String>,
}

#[derive(Deserialize, Default)]
struct Pagination {
    #[serde(default)]
    next_cursor: Option<String>,
}

/// Ids come back as strings, but older payloads use numbers.
#[derive(Deserialize)]
#[serde(untagged)]
enum UserId {
    Text(String),
    Number(u64),
}

#[derive(Deserialize)]
struct UserRecord {
    id: UserId,
    username: String,
}

impl UserRecord {
    fn into_account(self) -> std::result::Result<Account, FetchError> {
        let id = match self.id {
            UserId::Text(id) => id,
            UserId::Number(id) => id.to_string(),
        };
        Account::new(id, self.username)
    }
}

/// Instagram v1 API client
///
/// Every request is signed with the client secret (`sig` parameter), so the
/// client works with enforced signed requests turned on.
pub struct InstagramFetcher {
    client: Client,
    api_url: String,
    client_id: String,
    client_secret: String,
    page_size: Option<usize>,
    low_rate_limit_warning: u32,
}

impl InstagramFetcher {
    /// Create a new client
    ///
    /// # Arguments
    ///
    /// * `settings` - API base URL, timeout and warning threshold
    /// * `client_id` / `client_secret` - application credentials
    /// * `page_size` - `count` requested per page; `None` uses the API default
    pub fn new(
        settings: &InstagramConfig,
        client_id: String,
        client_secret: String,
        page_size: Option<usize>,
    ) -> Result<Self> {
        if client_id.trim().is_empty() {
            return Err(SocialGraphError::Config("Instagram client id is empty".to_string()));
        }

        let client = Client::builder()
            .timeout(Duration::from_secs(settings.timeout_secs))
            .build()
            .map_err(|e| SocialGraphError::Config(format!("Failed to build HTTP client: {}", e)))?;

        Ok(Self {
            client,
            api_url: settings.api_url.trim_end_matches('/').to_string(),
            client_id,
            client_secret,
            page_size,
            low_rate_limit_warning: settings.low_rate_limit_warning,
        })
    }

    /// Create a client with credentials read from the environment variables
    /// named in `settings`.
    pub fn from_env(settings: &InstagramConfig, page_size: Option<usize>) -> Result<Self> {
        let read = |name: &str| {
            std::env::var(name).map_err(|_| {
                SocialGraphError::Config(format!(
                    "Instagram credentials not found. Set the {} environment variable.",
                    name
                ))
            })
        };
        let client_id = read(&settings.client_id_env)?;
        let client_secret = read(&settings.client_secret_env)?;
        Self::new(settings, client_id, client_secret, page_size)
    }

    /// Search accounts by name.
    pub async fn search(&self, name: &str) -> std::result::Result<Vec<Account>, FetchError> {
        let mut params = BTreeMap::new();
        params.insert("q".to_string(), name.to_string());
        let envelope: Envelope<Vec<UserRecord>> = self.get("/users/search", params).await?;

        envelope
            .data
            .unwrap_or_default()
            .into_iter()
            .map(UserRecord::into_account)
            .collect()
    }

    async fn get<T: DeserializeOwned>(
        &self,
        endpoint: &str,
        mut params: BTreeMap<String, String>,
    ) -> std::result::Result<Envelope<T>, FetchError> {
        params.insert("client_id".to_string(), self.client_id.clone());
        let sig = sign(&self.client_secret, endpoint, &params);

        let mut url = Url::parse(&format!("{}{}", self.api_url, endpoint))
            .map_err(|e| FetchError::Fatal(format!("Invalid API URL for {}: {}", endpoint, e)))?;
        url.query_pairs_mut()
            .extend_pairs(params.iter())
            .append_pair("sig", &sig);

        log::debug!("Requesting: {}", endpoint);
        let response = self.client.get(url).send().await.map_err(classify_transport)?;

        let status = response.status();
        let headers = response.headers().clone();
        if let Some(remaining) = rate_limit_remaining(&headers) {
            if remaining <= self.low_rate_limit_warning {
                log::warn!("Rate limit is low ({} requests remaining)", remaining);
            }
        }

        let body = response.text().await.map_err(classify_transport)?;

        if !status.is_success() {
            let message = serde_json::from_str::<Envelope<serde_json::Value>>(&body)
                .ok()
                .and_then(|e| e.meta.error_message.or(e.meta.error_type))
                .unwrap_or(body);
            return Err(classify_status(status, parse_retry_after(&headers), &message));
        }

        serde_json::from_str(&body)
            .map_err(|e| FetchError::Fatal(format!("Failed to parse response from {}: {}", endpoint, e)))
    }
}

impl PagedFetcher for InstagramFetcher {
    async fn fetch_page(
        &self,
        external_id: &str,
        direction: Direction,
        cursor: Option<&str>,
    ) -> std::result::Result<Page, FetchError> {
        let endpoint = match direction {
            Direction::Following => format!("/users/{}/follows", external_id),
            Direction::Followers => format!("/users/{}/followed-by", external_id),
        };

        let mut params = BTreeMap::new();
        if let Some(count) = self.page_size {
            params.insert("count".to_string(), count.to_string());
        }
        if let Some(cursor) = cursor {
            params.insert("cursor".to_string(), cursor.to_string());
        }

        let envelope: Envelope<Vec<UserRecord>> = self.get(&endpoint, params).await?;
        let accounts = envelope
            .data
            .unwrap_or_default()
            .into_iter()
            .map(UserRecord::into_account)
            .collect::<std::result::Result<Vec<_>, _>>()?;

        Ok(Page {
            accounts,
            next_cursor: envelope.pagination.next_cursor.filter(|c| !c.is_empty()),
        })
    }

    async fn resolve_seed(&self, identifier: &str) -> std::result::Result<Account, FetchError> {
        let identifier = identifier.trim();
        if identifier.is_empty() {
            return Err(FetchError::Fatal("seed identifier is empty".to_string()));
        }

        if identifier.chars().all(|c| c.is_ascii_digit()) {
            let envelope: Envelope<UserRecord> =
                self.get(&format!("/users/{}", identifier), BTreeMap::new()).await?;
            return envelope
                .data
                .ok_or_else(|| FetchError::Fatal(format!("No user data returned for {}", identifier)))?
                .into_account();
        }

        self.search(identifier)
            .await?
            .into_iter()
            .find(|account| account.username.eq_ignore_ascii_case(identifier))
            .ok_or_else(|| FetchError::Fatal(format!("No Instagram account named '{}'", identifier)))
    }
}

/// Request signature: HMAC-SHA256 over the endpoint followed by `|key=value`
/// for every parameter in key order, hex encoded.
pub fn sign(secret: &str, endpoint: &str, params: &BTreeMap<String, String>) -> String {
    let mut mac = HmacSha256::new_from_slice(secret.as_bytes())
        .expect("HMAC accepts keys of any length");
    mac.update(endpoint.as_bytes());
    for (key, value) in params {
        mac.update(format!("|{}={}", key, value).as_bytes());
    }
    format!("{:x}", mac.finalize().into_bytes())
}

fn classify_status(status: StatusCode, retry_after: Option<Duration>, message: &str) -> FetchError {
    if status == StatusCode::TOO_MANY_REQUESTS {
        FetchError::RateLimited { retry_after }
    } else if status.is_server_error() || status == StatusCode::REQUEST_TIMEOUT {
        FetchError::Transient(format!("HTTP {}: {}", status.as_u16(), message))
    } else {
        FetchError::Fatal(format!("HTTP {}: {}", status.as_u16(), message))
    }
}

fn classify_transport(err: reqwest::Error) -> FetchError {
    if err.is_builder() || err.is_redirect() || err.is_decode() {
        FetchError::Fatal(format!("Request failed: {}", err))
    } else {
        FetchError::Transient(format!("Network error: {}", err))
    }
}

/// Seconds form of Retry-After only; HTTP dates fall back to the configured delay.
fn parse_retry_after(headers: &HeaderMap) -> Option<Duration> {
    headers
        .get(RETRY_AFTER)?
        .to_str()
        .ok()?
        .trim()
        .parse::<u64>()
        .ok()
        .map(Duration::from_secs)
}

fn rate_limit_remaining(headers: &HeaderMap) -> Option<u32> {
    headers.get(RATE_LIMIT_REMAINING)?.to_str().ok()?.trim().parse().ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::extract::{Path, Query, State};
    use axum::http::{HeaderMap as AxumHeaders, StatusCode as AxumStatus};
    use axum::response::IntoResponse;
    use axum::routing::get;
    use axum::{Json, Router};
    use serde_json::json;
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    fn params(pairs: &[(&str, &str)]) -> BTreeMap<String, String> {
        pairs.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect()
    }

    #[test]
    fn test_sign_known_vectors() {
        let sig = sign(
            "secret",
            "/users/123/follows",
            &params(&[("client_id", "cid"), ("count", "100")]),
        );
        assert_eq!(sig, "d9370322f8bb8f85ba3991afd1c7682e361c1d178214888e7d18120cd623a212");

        let sig = sign(
            "6dc1787668c64c939929c17683d7cb74",
            "/media/657988443280050001_25025320",
            &params(&[
                ("access_token", "fb2e77d.47a0479900504cb3ab4a1f626d174d2d"),
                ("count", "10"),
            ]),
        );
        assert_eq!(sig, "260634b241a6cfef5e4644c205fb30246ff637591142781b86e2075faf1b163a");
    }

    #[test]
    fn test_classify_status() {
        let err = classify_status(StatusCode::TOO_MANY_REQUESTS, Some(Duration::from_secs(7)), "slow");
        assert_eq!(err, FetchError::RateLimited { retry_after: Some(Duration::from_secs(7)) });

        let err = classify_status(StatusCode::BAD_GATEWAY, None, "upstream");
        assert!(matches!(err, FetchError::Transient(_)));

        let err = classify_status(StatusCode::BAD_REQUEST, None, "you cannot view this resource");
        assert_eq!(err, FetchError::Fatal("HTTP 400: you cannot view this resource".to_string()));
    }

    #[test]
    fn test_parse_retry_after() {
        let mut headers = HeaderMap::new();
        assert_eq!(parse_retry_after(&headers), None);

        headers.insert(RETRY_AFTER, "120".parse().unwrap());
        assert_eq!(parse_retry_after(&headers), Some(Duration::from_secs(120)));

        headers.insert(RETRY_AFTER, "Wed, 21 Oct 2015 07:28:00 GMT".parse().unwrap());
        assert_eq!(parse_retry_after(&headers), None);
    }

    #[test]
    fn test_from_env_requires_credentials() {
        let settings = InstagramConfig {
            client_id_env: "SOCIALGRAPH_TEST_MISSING_CLIENT_ID".to_string(),
            ..InstagramConfig::default()
        };
        let result = InstagramFetcher::from_env(&settings, None);
        assert!(matches!(result, Err(SocialGraphError::Config(_))));
    }

    #[derive(Clone)]
    struct MockState {
        hits: Arc<AtomicUsize>,
        rate_limit_first: bool,
    }

    async fn follows(
        State(state): State<MockState>,
        Path(id): Path<String>,
        Query(query): Query<HashMap<String, String>>,
    ) -> impl IntoResponse {
        let hit = state.hits.fetch_add(1, Ordering::SeqCst);
        let mut headers = AxumHeaders::new();
        headers.insert("x-ratelimit-remaining", "4999".parse().unwrap());

        if query.get("sig").map(|s| s.len()) != Some(64) || query.get("client_id").is_none() {
            return (
                AxumStatus::FORBIDDEN,
                headers,
                Json(json!({"meta": {"code": 403, "error_message": "Invalid signed-request"}})),
            );
        }
        if state.rate_limit_first && hit == 0 {
            headers.insert("retry-after", "0".parse().unwrap());
            return (
                AxumStatus::TOO_MANY_REQUESTS,
                headers,
                Json(json!({"meta": {"code": 429, "error_type": "OAuthRateLimitException"}})),
            );
        }
        if id == "404" {
            return (
                AxumStatus::BAD_REQUEST,
                headers,
                Json(json!({"meta": {"code": 400, "error_message": "this user does not exist"}})),
            );
        }

        let body = match query.get("cursor").map(String::as_str) {
            None => json!({
                "meta": {"code": 200},
                "data": [{"id": "2", "username": "bob"}, {"id": 3, "username": "carol"}],
                "pagination": {"next_cursor": "c2"},
            }),
            Some(_) => json!({
                "meta": {"code": 200},
                "data": [{"id": "4", "username": "dave"}],
                "pagination": {},
            }),
        };
        (AxumStatus::OK, headers, Json(body))
    }

    async fn user(Path(id): Path<String>) -> impl IntoResponse {
        Json(json!({"meta": {"code": 200}, "data": {"id": id, "username": "alice"}}))
    }

    async fn search(
        State(state): State<MockState>,
        Query(query): Query<HashMap<String, String>>,
    ) -> impl IntoResponse {
        state.hits.fetch_add(1, Ordering::SeqCst);
        let q = query.get("q").cloned().unwrap_or_default();
        Json(json!({
            "meta": {"code": 200},
            "data": [
                {"id": "11", "username": format!("{}_fan", q)},
                {"id": "10", "username": q},
            ],
        }))
    }

    async fn serve(rate_limit_first: bool) -> (String, Arc<AtomicUsize>) {
        let hits = Arc::new(AtomicUsize::new(0));
        let state = MockState { hits: Arc::clone(&hits), rate_limit_first };
        let app = Router::new()
            .route("/v1/users/search", get(search))
            .route("/v1/users/:id", get(user))
            .route("/v1/users/:id/follows", get(follows))
            .with_state(state);

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        (format!("http://{}/v1", addr), hits)
    }

    fn fetcher(api_url: String) -> InstagramFetcher {
        let settings = InstagramConfig {
            api_url,
            timeout_secs: 5,
            ..InstagramConfig::default()
        };
        InstagramFetcher::new(&settings, "cid".to_string(), "secret".to_string(), Some(2)).unwrap()
    }

    #[tokio::test]
    async fn test_fetch_page_follows_cursor() {
        let (api_url, hits) = serve(false).await;
        let fetcher = fetcher(api_url);

        let first = fetcher.fetch_page("1", Direction::Following, None).await.unwrap();
        assert_eq!(
            first.accounts,
            vec![Account::new("2", "bob").unwrap(), Account::new("3", "carol").unwrap()]
        );
        assert_eq!(first.next_cursor.as_deref(), Some("c2"));

        let second = fetcher.fetch_page("1", Direction::Following, Some("c2")).await.unwrap();
        assert_eq!(second.accounts, vec![Account::new("4", "dave").unwrap()]);
        assert_eq!(second.next_cursor, None);
        assert_eq!(hits.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_rate_limit_and_fatal_statuses() {
        let (api_url, _) = serve(true).await;
        let fetcher = fetcher(api_url);

        let err = fetcher.fetch_page("1", Direction::Following, None).await.unwrap_err();
        assert_eq!(err, FetchError::RateLimited { retry_after: Some(Duration::ZERO) });

        let err = fetcher.fetch_page("404", Direction::Following, None).await.unwrap_err();
        assert_eq!(err, FetchError::Fatal("HTTP 400: this user does not exist".to_string()));
    }

    #[tokio::test]
    async fn test_resolve_seed_by_id_and_name() {
        let (api_url, _) = serve(false).await;
        let fetcher = fetcher(api_url);

        let seed = fetcher.resolve_seed("10").await.unwrap();
        assert_eq!(seed, Account::new("10", "alice").unwrap());

        let seed = fetcher.resolve_seed("Alice").await.unwrap();
        assert_eq!(seed, Account::new("10", "Alice").unwrap());

        let found = fetcher.search("carol").await.unwrap();
        assert_eq!(found.len(), 2);
    }

    #[tokio::test]
    async fn test_blank_seed_fails_without_request() {
        let (api_url, hits) = serve(false).await;
        let fetcher = fetcher(api_url);

        let err = fetcher.resolve_seed("   ").await.unwrap_err();
        assert_eq!(err, FetchError::Fatal("seed identifier is empty".to_string()));
        assert_eq!(hits.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_unreachable_server_is_transient() {
        let fetcher = fetcher("http://127.0.0.1:1/v1".to_string());
        let err = fetcher.fetch_page("1", Direction::Followers, None).await.unwrap_err();
        assert!(matches!(err, FetchError::Transient(_)));
    }
}
