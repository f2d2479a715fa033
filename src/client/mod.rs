//! Resilient API gateway
//!
//! Every outbound call goes through the token-bucket limiter, then a bounded
//! retry loop: transport failures, 429s, and 5xx are retried with exponential
//! backoff and ±20% jitter; a server-supplied Retry-After overrides the
//! computed wait; any other 4xx is terminal. Waits are cancellable at every
//! suspension point.

pub mod oauth1;
pub mod ratelimit;

use crate::config::ApiConfig;
use crate::model::{Tweet, User};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rand::Rng;
use self::ratelimit::TokenBucket;
use serde::Deserialize;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;

const DEFAULT_BASE_URL: &str = "https://api.twitter.com/2";

#[derive(Debug)]
pub enum ApiError {
    /// Network-level failure. Retried.
    Transport(reqwest::Error),
    /// HTTP 429. Retried after the server-directed wait when present.
    Throttled { retry_after: Option<Duration> },
    /// HTTP 5xx. Retried.
    Server(u16),
    /// Any other 4xx. Terminal.
    Client(u16),
    /// Shutdown observed mid-wait or mid-retry. Terminal, nothing committed.
    Cancelled,
    /// Malformed response body. Terminal for this record.
    Decode(String),
    /// Retry budget spent; wraps the last error seen.
    RetriesExhausted { attempts: u32, last: Box<ApiError> },
}

impl std::fmt::Display for ApiError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ApiError::Transport(e) => write!(f, "transport error: {}", e),
            ApiError::Throttled { retry_after } => match retry_after {
                Some(d) => write!(f, "throttled, retry after {:?}", d),
                None => write!(f, "throttled"),
            },
            ApiError::Server(code) => write!(f, "server error: status {}", code),
            ApiError::Client(code) => write!(f, "client error: status {}", code),
            ApiError::Cancelled => write!(f, "cancelled"),
            ApiError::Decode(msg) => write!(f, "decode error: {}", msg),
            ApiError::RetriesExhausted { attempts, last } => {
                write!(f, "gave up after {} attempts: {}", attempts, last)
            }
        }
    }
}

impl std::error::Error for ApiError {}

impl ApiError {
    fn is_retryable(&self) -> bool {
        matches!(
            self,
            ApiError::Transport(_) | ApiError::Throttled { .. } | ApiError::Server(_)
        )
    }
}

/// Observability port: called once per retry with the endpoint label.
/// Injected so the gateway is testable without a metrics subsystem.
pub trait RetryObserver: Send + Sync {
    fn on_retry(&self, endpoint: &str);
}

/// Default observer; drops retry notifications.
pub struct NoopRetryObserver;

impl RetryObserver for NoopRetryObserver {
    fn on_retry(&self, _endpoint: &str) {}
}

/// The subset of API operations the pipeline consumes. Implemented by the
/// HTTP client and by fakes in tests.
#[async_trait]
pub trait ApiClient: Send + Sync {
    async fn get_user_by_username(&self, username: &str) -> Result<User, ApiError>;
    async fn get_users_by_ids(&self, ids: &[String]) -> Result<Vec<User>, ApiError>;
    async fn get_liked_tweets(&self, user_id: &str, limit: u32) -> Result<Vec<Tweet>, ApiError>;
    async fn get_user_tweets(&self, user_id: &str, limit: u32) -> Result<Vec<Tweet>, ApiError>;
    async fn search_recent_since(
        &self,
        query: &str,
        limit: u32,
        since: DateTime<Utc>,
    ) -> Result<Vec<Tweet>, ApiError>;
    async fn get_quote_tweets(&self, tweet_id: &str, limit: u32) -> Result<Vec<Tweet>, ApiError>;
}

/// Bearer-token client for v2-style endpoints.
pub struct HttpApiClient {
    base_url: String,
    bearer_token: String,
    http: reqwest::Client,
    limiter: TokenBucket,
    max_attempts: u32,
    base_backoff: Duration,
    observer: Arc<dyn RetryObserver>,
    shutdown: watch::Receiver<bool>,
}

impl HttpApiClient {
    pub fn new(
        bearer_token: &str,
        api: &ApiConfig,
        shutdown: watch::Receiver<bool>,
    ) -> Result<Self, ApiError> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(15))
            .build()
            .map_err(ApiError::Transport)?;
        Ok(Self {
            base_url: DEFAULT_BASE_URL.to_string(),
            bearer_token: bearer_token.to_string(),
            http,
            limiter: TokenBucket::new(api.rps, api.burst),
            max_attempts: api.max_attempts.max(1),
            base_backoff: Duration::from_millis(api.base_backoff_ms),
            observer: Arc::new(NoopRetryObserver),
            shutdown,
        })
    }

    /// Points the client at a different host (tests).
    pub fn with_base_url(mut self, base_url: &str) -> Self {
        self.base_url = base_url.trim_end_matches('/').to_string();
        self
    }

    pub fn with_observer(mut self, observer: Arc<dyn RetryObserver>) -> Self {
        self.observer = observer;
        self
    }

    pub fn http(&self) -> &reqwest::Client {
        &self.http
    }

    /// Rate-limits, then runs the bounded retry loop around `req`.
    pub async fn execute_with_retry(
        &self,
        endpoint: &str,
        req: reqwest::Request,
    ) -> Result<reqwest::Response, ApiError> {
        self.limiter.wait(&self.shutdown).await?;

        let mut last_err: Option<ApiError> = None;
        for attempt in 0..self.max_attempts {
            if attempt > 0 {
                let wait = match &last_err {
                    Some(ApiError::Throttled {
                        retry_after: Some(d),
                    }) => *d,
                    _ => self.base_backoff * 2u32.pow(attempt - 1),
                };
                let wait = apply_jitter(wait);
                log::warn!(
                    "⏳ Retrying {} (attempt {} of {}) in {:?}",
                    endpoint,
                    attempt + 1,
                    self.max_attempts,
                    wait
                );
                self.observer.on_retry(endpoint);
                self.cancellable_sleep(wait).await?;
            }

            let attempt_req = req
                .try_clone()
                .ok_or_else(|| ApiError::Decode("request is not retryable".to_string()))?;
            match self.try_once(attempt_req).await {
                Ok(resp) => return Ok(resp),
                Err(e) if e.is_retryable() => {
                    log::debug!("{} attempt {} failed: {}", endpoint, attempt + 1, e);
                    last_err = Some(e);
                }
                Err(e) => return Err(e),
            }
        }

        Err(ApiError::RetriesExhausted {
            attempts: self.max_attempts,
            last: Box::new(last_err.unwrap_or(ApiError::Cancelled)),
        })
    }

    async fn try_once(&self, req: reqwest::Request) -> Result<reqwest::Response, ApiError> {
        let resp = self.http.execute(req).await.map_err(ApiError::Transport)?;
        let status = resp.status();
        if status.as_u16() == 429 {
            return Err(ApiError::Throttled {
                retry_after: parse_retry_after(resp.headers()),
            });
        }
        if status.is_server_error() {
            return Err(ApiError::Server(status.as_u16()));
        }
        if status.is_client_error() {
            return Err(ApiError::Client(status.as_u16()));
        }
        Ok(resp)
    }

    async fn cancellable_sleep(&self, wait: Duration) -> Result<(), ApiError> {
        let mut sd = self.shutdown.clone();
        tokio::select! {
            _ = sd.wait_for(|stop| *stop) => Err(ApiError::Cancelled),
            _ = tokio::time::sleep(wait) => Ok(()),
        }
    }

    async fn get_json<T: for<'de> Deserialize<'de>>(
        &self,
        endpoint: &str,
        url: &str,
        query: &[(&str, String)],
    ) -> Result<T, ApiError> {
        let req = self
            .http
            .get(url)
            .query(query)
            .bearer_auth(&self.bearer_token)
            .header(reqwest::header::ACCEPT, "application/json")
            .build()
            .map_err(ApiError::Transport)?;
        let resp = self.execute_with_retry(endpoint, req).await?;
        resp.json::<T>()
            .await
            .map_err(|e| ApiError::Decode(e.to_string()))
    }
}

#[async_trait]
impl ApiClient for HttpApiClient {
    async fn get_user_by_username(&self, username: &str) -> Result<User, ApiError> {
        if username.is_empty() {
            return Err(ApiError::Decode("empty username".to_string()));
        }
        let url = format!("{}/users/by/username/{}", self.base_url, username);
        let resp: UserResponse = self
            .get_json(
                "users_by_username",
                &url,
                &[("user.fields", USER_FIELDS.to_string())],
            )
            .await?;
        resp.data
            .map(UserData::into_user)
            .ok_or_else(|| ApiError::Decode(format!("no user data for {}", username)))
    }

    async fn get_users_by_ids(&self, ids: &[String]) -> Result<Vec<User>, ApiError> {
        let mut out = Vec::with_capacity(ids.len());
        for chunk in ids.chunks(100) {
            let url = format!("{}/users", self.base_url);
            let resp: UserListResponse = self
                .get_json(
                    "users_by_ids",
                    &url,
                    &[
                        ("ids", chunk.join(",")),
                        ("user.fields", USER_FIELDS.to_string()),
                    ],
                )
                .await?;
            out.extend(resp.data.into_iter().map(UserData::into_user));
        }
        Ok(out)
    }

    async fn get_liked_tweets(&self, user_id: &str, limit: u32) -> Result<Vec<Tweet>, ApiError> {
        let url = format!("{}/users/{}/liked_tweets", self.base_url, user_id);
        let resp: TweetListResponse = self
            .get_json(
                "liked_tweets",
                &url,
                &[
                    ("max_results", limit.clamp(10, 100).to_string()),
                    ("tweet.fields", TWEET_FIELDS.to_string()),
                ],
            )
            .await?;
        Ok(resp.data.into_iter().map(TweetData::into_tweet).collect())
    }

    async fn get_user_tweets(&self, user_id: &str, limit: u32) -> Result<Vec<Tweet>, ApiError> {
        let url = format!("{}/users/{}/tweets", self.base_url, user_id);
        let resp: TweetListResponse = self
            .get_json(
                "user_tweets",
                &url,
                &[
                    ("max_results", limit.clamp(5, 100).to_string()),
                    ("tweet.fields", TWEET_FIELDS.to_string()),
                ],
            )
            .await?;
        Ok(resp.data.into_iter().map(TweetData::into_tweet).collect())
    }

    async fn search_recent_since(
        &self,
        query: &str,
        limit: u32,
        since: DateTime<Utc>,
    ) -> Result<Vec<Tweet>, ApiError> {
        let url = format!("{}/tweets/search/recent", self.base_url);
        let resp: TweetListResponse = self
            .get_json(
                "search_recent",
                &url,
                &[
                    ("query", query.to_string()),
                    ("start_time", since.to_rfc3339()),
                    ("max_results", limit.clamp(10, 100).to_string()),
                    ("tweet.fields", TWEET_FIELDS.to_string()),
                ],
            )
            .await?;
        Ok(resp.data.into_iter().map(TweetData::into_tweet).collect())
    }

    async fn get_quote_tweets(&self, tweet_id: &str, limit: u32) -> Result<Vec<Tweet>, ApiError> {
        let url = format!("{}/tweets/{}/quote_tweets", self.base_url, tweet_id);
        let resp: TweetListResponse = self
            .get_json(
                "quote_tweets",
                &url,
                &[
                    ("max_results", limit.clamp(10, 100).to_string()),
                    ("tweet.fields", TWEET_FIELDS.to_string()),
                ],
            )
            .await?;
        Ok(resp.data.into_iter().map(TweetData::into_tweet).collect())
    }
}

const TWEET_FIELDS: &str = "public_metrics,created_at,author_id,lang";
const USER_FIELDS: &str = "public_metrics,created_at,verified,description";

fn apply_jitter(wait: Duration) -> Duration {
    let factor = rand::thread_rng().gen_range(0.8..=1.2);
    wait.mul_f64(factor)
}

/// Parses Retry-After as delay-seconds or HTTP-date. A date already in the
/// past clamps to zero.
fn parse_retry_after(headers: &reqwest::header::HeaderMap) -> Option<Duration> {
    let raw = headers.get(reqwest::header::RETRY_AFTER)?.to_str().ok()?;
    let raw = raw.trim();
    if let Ok(secs) = raw.parse::<u64>() {
        return Some(Duration::from_secs(secs));
    }
    let when = DateTime::parse_from_rfc2822(raw).ok()?;
    let delta = when.with_timezone(&Utc) - Utc::now();
    Some(delta.to_std().unwrap_or(Duration::ZERO))
}

#[derive(Debug, Deserialize)]
struct TweetListResponse {
    #[serde(default)]
    data: Vec<TweetData>,
}

#[derive(Debug, Deserialize)]
struct UserResponse {
    data: Option<UserData>,
}

#[derive(Debug, Deserialize)]
struct UserListResponse {
    #[serde(default)]
    data: Vec<UserData>,
}

#[derive(Debug, Default, Deserialize)]
struct TweetMetrics {
    #[serde(default)]
    like_count: i64,
    #[serde(default)]
    reply_count: i64,
    #[serde(default)]
    retweet_count: i64,
    #[serde(default)]
    quote_count: i64,
}

#[derive(Debug, Deserialize)]
struct TweetData {
    id: String,
    #[serde(default)]
    author_id: String,
    #[serde(default)]
    text: String,
    created_at: Option<DateTime<Utc>>,
    #[serde(default)]
    lang: String,
    #[serde(default)]
    public_metrics: TweetMetrics,
}

impl TweetData {
    fn into_tweet(self) -> Tweet {
        Tweet {
            id: self.id,
            author_id: self.author_id,
            text: self.text,
            created_at: self.created_at,
            like_count: self.public_metrics.like_count,
            reply_count: self.public_metrics.reply_count,
            retweet_count: self.public_metrics.retweet_count,
            quote_count: self.public_metrics.quote_count,
            language: self.lang,
        }
    }
}

#[derive(Debug, Default, Deserialize)]
struct UserMetrics {
    #[serde(default)]
    followers_count: i64,
    #[serde(default)]
    following_count: i64,
    #[serde(default)]
    tweet_count: i64,
    #[serde(default)]
    listed_count: i64,
}

#[derive(Debug, Deserialize)]
struct UserData {
    id: String,
    #[serde(default)]
    username: String,
    #[serde(default)]
    name: String,
    #[serde(default)]
    description: String,
    created_at: Option<DateTime<Utc>>,
    #[serde(default)]
    verified: bool,
    #[serde(default)]
    public_metrics: UserMetrics,
}

impl UserData {
    fn into_user(self) -> User {
        User {
            id: self.id,
            username: self.username,
            name: self.name,
            description: self.description,
            created_at: self.created_at,
            followers_count: self.public_metrics.followers_count,
            following_count: self.public_metrics.following_count,
            tweet_count: self.public_metrics.tweet_count,
            listed_count: self.public_metrics.listed_count,
            verified: self.verified,
            default_profile: false,
            default_image: false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use reqwest::header::{HeaderMap, HeaderValue, RETRY_AFTER};

    #[test]
    fn test_retry_after_seconds() {
        let mut headers = HeaderMap::new();
        headers.insert(RETRY_AFTER, HeaderValue::from_static("7"));
        assert_eq!(parse_retry_after(&headers), Some(Duration::from_secs(7)));
    }

    #[test]
    fn test_retry_after_zero() {
        let mut headers = HeaderMap::new();
        headers.insert(RETRY_AFTER, HeaderValue::from_static("0"));
        assert_eq!(parse_retry_after(&headers), Some(Duration::ZERO));
    }

    #[test]
    fn test_retry_after_http_date_in_past_clamps_to_zero() {
        let mut headers = HeaderMap::new();
        headers.insert(
            RETRY_AFTER,
            HeaderValue::from_static("Wed, 21 Oct 2015 07:28:00 GMT"),
        );
        assert_eq!(parse_retry_after(&headers), Some(Duration::ZERO));
    }

    #[test]
    fn test_retry_after_missing_or_malformed() {
        let headers = HeaderMap::new();
        assert_eq!(parse_retry_after(&headers), None);
        let mut headers = HeaderMap::new();
        headers.insert(RETRY_AFTER, HeaderValue::from_static("not-a-date"));
        assert_eq!(parse_retry_after(&headers), None);
    }

    #[test]
    fn test_jitter_stays_within_20_percent() {
        let base = Duration::from_millis(1000);
        for _ in 0..100 {
            let w = apply_jitter(base);
            assert!(w >= Duration::from_millis(800));
            assert!(w <= Duration::from_millis(1200));
        }
    }

    #[test]
    fn test_error_classification() {
        assert!(ApiError::Server(503).is_retryable());
        assert!(ApiError::Throttled { retry_after: None }.is_retryable());
        assert!(!ApiError::Client(404).is_retryable());
        assert!(!ApiError::Cancelled.is_retryable());
        assert!(!ApiError::Decode("x".to_string()).is_retryable());
    }
}
