//! Engagement stream ingestion
//!
//! Four v2 streams (likes, replies via search, retweets via search, quotes of
//! own tweets) plus the v1.1 home-timeline sync. Every fetched item is
//! upserted by a kind-prefixed reference so replays after a failed cursor
//! write cannot duplicate rows. Label backfill runs over completed windows.

pub mod scheduler;

use crate::client::oauth1::V1Client;
use crate::client::{ApiClient, ApiError};
use crate::features;
use crate::model::{EventKind, Tweet};
use crate::store::{Store, StoreError};
use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use serde_json::json;

pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

pub const CURSOR_LIKES: &str = "ingest:likes_since";
pub const CURSOR_REPLIES: &str = "ingest:replies_since";
pub const CURSOR_RETWEETS: &str = "ingest:retweets_since";
pub const CURSOR_QUOTES: &str = "ingest:quotes_since";
pub const CURSOR_HOME: &str = "home_timeline:since_id";

fn event_payload(t: &Tweet) -> serde_json::Value {
    json!({"tweet_id": t.id, "author_id": t.author_id})
}

/// Upserts tweets as events of `kind`, ref-keyed as `{kind}:{tweet_id}`.
/// Returns the number of rows written.
fn upsert_tweets(
    store: &Store,
    kind: EventKind,
    tweets: &[Tweet],
    fallback_ts: DateTime<Utc>,
) -> Result<usize, StoreError> {
    for t in tweets {
        let ts = t.created_at.unwrap_or(fallback_ts);
        let event_ref = format!("{}:{}", kind, t.id);
        store.put_event_ref(ts, kind.as_str(), &event_ref, &event_payload(t))?;
    }
    Ok(tweets.len())
}

/// Likes received by the account.
pub async fn ingest_likes(
    store: &Store,
    client: &dyn ApiClient,
    user_id: &str,
    now: DateTime<Utc>,
) -> Result<usize, BoxError> {
    let tweets = client.get_liked_tweets(user_id, 100).await?;
    Ok(upsert_tweets(store, EventKind::Like, &tweets, now)?)
}

/// Replies to the account, via recent search.
pub async fn ingest_replies(
    store: &Store,
    client: &dyn ApiClient,
    username: &str,
    since: DateTime<Utc>,
    now: DateTime<Utc>,
) -> Result<usize, BoxError> {
    let query = format!("to:{}", username);
    let tweets = client.search_recent_since(&query, 100, since).await?;
    Ok(upsert_tweets(store, EventKind::Reply, &tweets, now)?)
}

/// Retweets of the account's posts, via recent search.
pub async fn ingest_retweets(
    store: &Store,
    client: &dyn ApiClient,
    username: &str,
    since: DateTime<Utc>,
    now: DateTime<Utc>,
) -> Result<usize, BoxError> {
    let query = format!("retweets_of:{}", username);
    let tweets = client.search_recent_since(&query, 100, since).await?;
    Ok(upsert_tweets(store, EventKind::Retweet, &tweets, now)?)
}

/// Quote tweets of the account's own recent posts. A failing quote lookup for
/// one tweet skips that tweet only.
pub async fn ingest_quotes(
    store: &Store,
    client: &dyn ApiClient,
    user_id: &str,
    now: DateTime<Utc>,
) -> Result<usize, BoxError> {
    let own = client.get_user_tweets(user_id, 10).await?;
    let mut stored = 0;
    for tweet in &own {
        match client.get_quote_tweets(&tweet.id, 50).await {
            Ok(quotes) => {
                stored += upsert_tweets(store, EventKind::Quote, &quotes, now)?;
            }
            Err(e) => {
                log::debug!("quote lookup failed for {}: {}", tweet.id, e);
            }
        }
    }
    Ok(stored)
}

/// Source of v1.1 home-timeline pages. Implemented by `V1Client` and by
/// fakes in tests.
#[async_trait]
pub trait HomeTimelineSource: Send + Sync {
    async fn home_timeline_since(&self, since_id: &str, limit: u32) -> Result<Vec<Tweet>, ApiError>;
}

#[async_trait]
impl HomeTimelineSource for V1Client {
    async fn home_timeline_since(&self, since_id: &str, limit: u32) -> Result<Vec<Tweet>, ApiError> {
        self.get_home_timeline_since(since_id, limit).await
    }
}

/// Pages the home timeline by since_id and stores items idempotently. The
/// saved cursor is the maximum id seen; a page error ends the sync early but
/// keeps whatever advanced so far.
pub async fn sync_home_timeline(
    store: &Store,
    source: &dyn HomeTimelineSource,
    per_page: u32,
    pages: u32,
) -> Result<usize, BoxError> {
    let mut since_id = store.load_cursor(CURSOR_HOME)?.unwrap_or_default();
    let mut max_id = String::new();
    let mut stored = 0usize;
    let now = Utc::now();

    for _ in 0..pages {
        let items = match source.home_timeline_since(&since_id, per_page).await {
            Ok(items) => items,
            Err(e) => {
                log::warn!("⚠️  Home timeline page failed: {}", e);
                break;
            }
        };
        if items.is_empty() {
            break;
        }
        for t in &items {
            let ts = t.created_at.unwrap_or(now);
            store.put_event_ref(
                ts,
                EventKind::Home.as_str(),
                &format!("home:{}", t.id),
                &event_payload(t),
            )?;
            if t.id > max_id {
                max_id = t.id.clone();
            }
        }
        stored += items.len();
        since_id = max_id.clone();
    }

    if !max_id.is_empty() {
        store.save_cursor(CURSOR_HOME, &max_id)?;
    }
    Ok(stored)
}

/// Labels every persisted window in `[start, end)` whose label is unset and
/// whose successor window has fully elapsed by `now`. Returns the number of
/// labels written.
pub fn backfill_labels(
    store: &Store,
    start: DateTime<Utc>,
    end: DateTime<Utc>,
    now: DateTime<Utc>,
) -> Result<usize, StoreError> {
    let (starts, _, labels) = store.load_features(start, end)?;
    let mut updated = 0;
    for (ws, label) in starts.iter().zip(labels.iter()) {
        if *label >= 0.0 {
            continue;
        }
        let next_start = *ws + Duration::minutes(features::WINDOW_MINUTES);
        let next_end = next_start + Duration::minutes(features::WINDOW_MINUTES);
        if next_end > now {
            continue;
        }
        let events = store.load_events_range(next_start, next_end, Some("reply"))?;
        let value = features::build_label(*ws, &events);
        store.update_label(*ws, value)?;
        updated += 1;
    }
    Ok(updated)
}
