//! OAuth 1.0a request signing for the legacy v1.1 home-timeline endpoint
//!
//! Signature base string: uppercase method, normalized base URL, and the
//! percent-encoded, lexicographically sorted parameter string (oauth params
//! merged with query params). Signing key is
//! `urlencode(consumer_secret)&urlencode(token_secret)`. Nonce and timestamp
//! are freshly generated per request; both are injectable for tests.

use super::{ApiError, HttpApiClient};
use crate::config::Credentials;
use crate::model::Tweet;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use chrono::{DateTime, Utc};
use hmac::{Hmac, Mac};
use percent_encoding::{utf8_percent_encode, AsciiSet, NON_ALPHANUMERIC};
use rand::distributions::Alphanumeric;
use rand::Rng;
use serde::Deserialize;
use sha1::Sha1;
use std::sync::Arc;

/// RFC 3986 unreserved characters pass through; everything else is encoded.
const RFC3986: &AsciiSet = &NON_ALPHANUMERIC
    .remove(b'-')
    .remove(b'.')
    .remove(b'_')
    .remove(b'~');

fn rfc3986(s: &str) -> String {
    utf8_percent_encode(s, RFC3986).to_string()
}

fn default_nonce() -> String {
    rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(16)
        .map(char::from)
        .collect()
}

fn default_clock() -> i64 {
    Utc::now().timestamp()
}

/// Produces OAuth 1.0a Authorization headers for GET requests.
pub struct Oauth1Signer {
    consumer_key: String,
    consumer_secret: String,
    access_token: String,
    access_secret: String,
    clock: fn() -> i64,
    nonce: fn() -> String,
}

impl Oauth1Signer {
    pub fn new(consumer_key: &str, consumer_secret: &str, access_token: &str, access_secret: &str) -> Self {
        Self {
            consumer_key: consumer_key.to_string(),
            consumer_secret: consumer_secret.to_string(),
            access_token: access_token.to_string(),
            access_secret: access_secret.to_string(),
            clock: default_clock,
            nonce: default_nonce,
        }
    }

    /// Overrides timestamp generation (tests).
    pub fn with_clock(mut self, clock: fn() -> i64) -> Self {
        self.clock = clock;
        self
    }

    /// Overrides nonce generation (tests).
    pub fn with_nonce(mut self, nonce: fn() -> String) -> Self {
        self.nonce = nonce;
        self
    }

    /// Builds the Authorization header value for a GET of `base_url` with
    /// `query_params` (unencoded key/value pairs).
    pub fn authorization_header(&self, base_url: &str, query_params: &[(String, String)]) -> String {
        let mut oauth: Vec<(String, String)> = vec![
            ("oauth_consumer_key".to_string(), self.consumer_key.clone()),
            ("oauth_nonce".to_string(), (self.nonce)()),
            ("oauth_signature_method".to_string(), "HMAC-SHA1".to_string()),
            ("oauth_timestamp".to_string(), (self.clock)().to_string()),
            ("oauth_token".to_string(), self.access_token.clone()),
            ("oauth_version".to_string(), "1.0".to_string()),
        ];

        // Parameter string: oauth + query params, sorted by key.
        let mut all: Vec<(String, String)> = oauth.clone();
        all.extend(query_params.iter().cloned());
        all.sort();
        let param_str = all
            .iter()
            .map(|(k, v)| format!("{}={}", rfc3986(k), rfc3986(v)))
            .collect::<Vec<_>>()
            .join("&");

        let base = format!("GET&{}&{}", rfc3986(base_url), rfc3986(&param_str));
        let signing_key = format!(
            "{}&{}",
            rfc3986(&self.consumer_secret),
            rfc3986(&self.access_secret)
        );

        let mut mac = Hmac::<Sha1>::new_from_slice(signing_key.as_bytes())
            .expect("HMAC accepts any key length");
        mac.update(base.as_bytes());
        let signature = BASE64.encode(mac.finalize().into_bytes());

        oauth.push(("oauth_signature".to_string(), signature));
        oauth.sort();
        let header_params = oauth
            .iter()
            .map(|(k, v)| format!("{}=\"{}\"", rfc3986(k), rfc3986(v)))
            .collect::<Vec<_>>()
            .join(", ");
        format!("OAuth {}", header_params)
    }
}

const DEFAULT_V1_BASE_URL: &str = "https://api.twitter.com/1.1";

/// v1.1 home-timeline client. Shares the base client's limiter and retry
/// loop; only the auth scheme differs.
pub struct V1Client {
    base: Arc<HttpApiClient>,
    base_url: String,
    signer: Oauth1Signer,
}

impl V1Client {
    pub fn new(base: Arc<HttpApiClient>, creds: &Credentials) -> Self {
        Self {
            base,
            base_url: DEFAULT_V1_BASE_URL.to_string(),
            signer: Oauth1Signer::new(
                &creds.consumer_key,
                &creds.consumer_secret,
                &creds.access_token,
                &creds.access_secret,
            ),
        }
    }

    pub fn with_base_url(mut self, base_url: &str) -> Self {
        self.base_url = base_url.trim_end_matches('/').to_string();
        self
    }

    pub fn with_signer(mut self, signer: Oauth1Signer) -> Self {
        self.signer = signer;
        self
    }

    /// Fetches home-timeline tweets newer than `since_id` (empty = from the
    /// most recent page).
    pub async fn get_home_timeline_since(
        &self,
        since_id: &str,
        limit: u32,
    ) -> Result<Vec<Tweet>, ApiError> {
        let url = format!("{}/statuses/home_timeline.json", self.base_url);
        let mut params: Vec<(String, String)> = vec![
            ("count".to_string(), limit.clamp(5, 200).to_string()),
            ("tweet_mode".to_string(), "extended".to_string()),
        ];
        if !since_id.is_empty() {
            params.push(("since_id".to_string(), since_id.to_string()));
        }

        let auth = self.signer.authorization_header(&url, &params);
        let req = self
            .base
            .http()
            .get(&url)
            .query(&params)
            .header(reqwest::header::AUTHORIZATION, auth)
            .header(reqwest::header::ACCEPT, "application/json")
            .build()
            .map_err(ApiError::Transport)?;

        let resp = self.base.execute_with_retry("home_timeline", req).await?;
        let raw: Vec<V1Tweet> = resp
            .json()
            .await
            .map_err(|e| ApiError::Decode(e.to_string()))?;
        Ok(raw.into_iter().map(V1Tweet::into_tweet).collect())
    }
}

#[derive(Debug, Deserialize)]
struct V1Tweet {
    id_str: String,
    #[serde(default)]
    created_at: String,
    #[serde(default)]
    full_text: String,
    #[serde(default)]
    text: String,
    #[serde(default)]
    lang: String,
    #[serde(default)]
    favorite_count: i64,
    #[serde(default)]
    retweet_count: i64,
    #[serde(default)]
    user: V1User,
}

#[derive(Debug, Default, Deserialize)]
struct V1User {
    #[serde(default)]
    id_str: String,
}

impl V1Tweet {
    fn into_tweet(self) -> Tweet {
        // v1.1 created_at example: Mon Jan 02 15:04:05 +0000 2006
        let created_at = DateTime::parse_from_str(&self.created_at, "%a %b %d %H:%M:%S %z %Y")
            .ok()
            .map(|t| t.with_timezone(&Utc));
        let text = if self.full_text.is_empty() {
            self.text
        } else {
            self.full_text
        };
        Tweet {
            id: self.id_str,
            author_id: self.user.id_str,
            text,
            created_at,
            like_count: self.favorite_count,
            reply_count: 0,
            retweet_count: self.retweet_count,
            quote_count: 0,
            language: self.lang,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fixed_signer() -> Oauth1Signer {
        Oauth1Signer::new("ck", "cs", "at", "as")
            .with_clock(|| 1_700_000_000)
            .with_nonce(|| "fixednonce".to_string())
    }

    #[test]
    fn test_signature_is_deterministic_under_fixed_inputs() {
        let params = vec![
            ("count".to_string(), "5".to_string()),
            ("tweet_mode".to_string(), "extended".to_string()),
        ];
        let a = fixed_signer().authorization_header("https://example.com/1.1/home.json", &params);
        let b = fixed_signer().authorization_header("https://example.com/1.1/home.json", &params);
        assert_eq!(a, b);
        assert!(a.starts_with("OAuth "));
        assert!(a.contains("oauth_signature=\""));
        assert!(a.contains("oauth_consumer_key=\"ck\""));
        assert!(a.contains("oauth_timestamp=\"1700000000\""));
    }

    #[test]
    fn test_signature_changes_with_nonce() {
        let params = vec![("count".to_string(), "5".to_string())];
        let a = fixed_signer().authorization_header("https://example.com/x", &params);
        let b = fixed_signer()
            .with_nonce(|| "othernonce".to_string())
            .authorization_header("https://example.com/x", &params);
        assert_ne!(a, b);
    }

    #[test]
    fn test_signature_depends_on_query_params() {
        let a = fixed_signer().authorization_header(
            "https://example.com/x",
            &[("since_id".to_string(), "1".to_string())],
        );
        let b = fixed_signer().authorization_header(
            "https://example.com/x",
            &[("since_id".to_string(), "2".to_string())],
        );
        assert_ne!(a, b);
    }

    #[test]
    fn test_rfc3986_encoding() {
        assert_eq!(rfc3986("a b*c~d-e.f_g"), "a%20b%2Ac~d-e.f_g");
        assert_eq!(rfc3986("key=val&x"), "key%3Dval%26x");
    }

    #[test]
    fn test_v1_created_at_parse() {
        let t = V1Tweet {
            id_str: "1".to_string(),
            created_at: "Mon Jan 02 15:04:05 +0000 2006".to_string(),
            full_text: "hi".to_string(),
            text: String::new(),
            lang: "en".to_string(),
            favorite_count: 3,
            retweet_count: 1,
            user: V1User {
                id_str: "u1".to_string(),
            },
        };
        let tweet = t.into_tweet();
        let ts = tweet.created_at.unwrap();
        assert_eq!(ts.timestamp(), 1136214245);
        assert_eq!(tweet.text, "hi");
        assert_eq!(tweet.like_count, 3);
    }
}
