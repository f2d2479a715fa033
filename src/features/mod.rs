//! Window feature builder
//!
//! Converts posts and events inside a 15-minute UTC-aligned window into a
//! fixed 23-slot f32 vector:
//!
//! - 0..8   base: log1p counts of posts/likes/replies/retweets/quotes and
//!   mean likes/replies/retweets per post (0 when the window has no posts)
//! - 8..16  rolling: 4 pairs of (mean post-count slot, mean avg-likes slot)
//!   over the prior hour's persisted windows
//! - 16..18 cyclical time-of-week encoding
//! - 18..23 meta: relevance and bot-likelihood stats, filled by `augment_meta`
//!
//! The slot layout is append-only; consumers rely on `VECTOR_LEN`.

pub mod meta;

use crate::model::Tweet;
use crate::store::{Store, StoreError, StoredEvent};
use chrono::{DateTime, Datelike, Duration, Timelike, Utc};

pub const WINDOW_MINUTES: i64 = 15;

pub const BASE_SLOTS: usize = 8;
pub const ROLLING_SLOTS: usize = 8;
pub const TIME_SLOTS: usize = 2;
pub const META_SLOTS: usize = 5;
pub const VECTOR_LEN: usize = BASE_SLOTS + ROLLING_SLOTS + TIME_SLOTS + META_SLOTS;

pub const ROLLING_OFFSET: usize = BASE_SLOTS;
pub const TIME_OFFSET: usize = BASE_SLOTS + ROLLING_SLOTS;
pub const META_OFFSET: usize = TIME_OFFSET + TIME_SLOTS;

/// Truncates a timestamp down to the 15-minute grid.
pub fn truncate_to_window(ts: DateTime<Utc>) -> DateTime<Utc> {
    let secs = ts.timestamp();
    let window = WINDOW_MINUTES * 60;
    DateTime::from_timestamp(secs - secs.rem_euclid(window), 0).unwrap_or(ts)
}

/// Builds the full feature vector for one window from the posts inside it.
///
/// Rolling slots warm-start from the window's own count/avg-likes values;
/// `build_features_with_history` replaces them with true rolling means once
/// history exists. Changing the warm start silently shifts early training
/// data, so it is pinned by a test. Meta slots stay zero here.
pub fn build_features(window_start: DateTime<Utc>, posts: &[Tweet]) -> Vec<f32> {
    let window_end = window_start + Duration::minutes(WINDOW_MINUTES);

    let mut count: i64 = 0;
    let (mut likes, mut replies, mut retweets, mut quotes) = (0i64, 0i64, 0i64, 0i64);
    for t in posts {
        let Some(created) = t.created_at else { continue };
        if created < window_start || created >= window_end {
            continue;
        }
        count += 1;
        likes += t.like_count;
        replies += t.reply_count;
        retweets += t.retweet_count;
        quotes += t.quote_count;
    }

    let (avg_likes, avg_replies, avg_retweets) = if count > 0 {
        let n = count as f64;
        (
            likes as f64 / n,
            replies as f64 / n,
            retweets as f64 / n,
        )
    } else {
        (0.0, 0.0, 0.0)
    };

    let mut x = Vec::with_capacity(VECTOR_LEN);
    x.push((count as f64).ln_1p() as f32);
    x.push((likes as f64).ln_1p() as f32);
    x.push((replies as f64).ln_1p() as f32);
    x.push((retweets as f64).ln_1p() as f32);
    x.push((quotes as f64).ln_1p() as f32);
    x.push(avg_likes as f32);
    x.push(avg_replies as f32);
    x.push(avg_retweets as f32);

    // Rolling warm start: mirror this window's own stats until history exists.
    let own_count = x[0];
    let own_avg_likes = x[5];
    for _ in 0..ROLLING_SLOTS / 2 {
        x.push(own_count);
        x.push(own_avg_likes);
    }

    let (sin_t, cos_t) = time_of_week_encoding(window_start);
    x.push(sin_t);
    x.push(cos_t);

    x.extend(std::iter::repeat(0.0).take(META_SLOTS));
    debug_assert_eq!(x.len(), VECTOR_LEN);
    x
}

/// Builds features and replaces the rolling slots with means over the prior
/// 60 minutes of persisted windows, when any exist.
pub fn build_features_with_history(
    store: &Store,
    window_start: DateTime<Utc>,
    posts: &[Tweet],
) -> Result<Vec<f32>, StoreError> {
    let mut x = build_features(window_start, posts);
    let past_start = window_start - Duration::minutes(60);
    let (_, history, _) = store.load_features(past_start, window_start)?;
    if history.is_empty() {
        return Ok(x);
    }

    let mut mean_count = 0.0f32;
    let mut mean_avg_likes = 0.0f32;
    let mut n = 0.0f32;
    for v in &history {
        if v.len() >= BASE_SLOTS {
            mean_count += v[0];
            mean_avg_likes += v[5];
            n += 1.0;
        }
    }
    if n > 0.0 {
        mean_count /= n;
        mean_avg_likes /= n;
        for i in 0..ROLLING_SLOTS / 2 {
            x[ROLLING_OFFSET + 2 * i] = mean_count;
            x[ROLLING_OFFSET + 2 * i + 1] = mean_avg_likes;
        }
    }
    Ok(x)
}

/// Continuous cyclical encoding of the hour-of-week: sin/cos of
/// `2π·hour_of_week/168` with Sunday as day zero. No discontinuity at week
/// boundaries.
pub fn time_of_week_encoding(ts: DateTime<Utc>) -> (f32, f32) {
    let hour_of_week =
        ts.weekday().num_days_from_sunday() as f64 * 24.0 + ts.hour() as f64;
    let angle = 2.0 * std::f64::consts::PI * hour_of_week / 168.0;
    (angle.sin() as f32, angle.cos() as f32)
}

/// Training label for a window: log1p of the reply events inside the
/// immediately following window `[start+15min, start+30min)`.
pub fn build_label(window_start: DateTime<Utc>, events: &[StoredEvent]) -> f32 {
    let next_start = window_start + Duration::minutes(WINDOW_MINUTES);
    let next_end = next_start + Duration::minutes(WINDOW_MINUTES);
    let replies = events
        .iter()
        .filter(|e| e.kind == "reply" && e.ts >= next_start && e.ts < next_end)
        .count();
    (replies as f64).ln_1p() as f32
}

/// Composes history-aware features with meta augmentation and persists the
/// window with an unset label (backfilled later).
pub fn build_and_persist_window(
    store: &Store,
    window_start: DateTime<Utc>,
    posts: &[Tweet],
    authors: &std::collections::HashMap<String, crate::model::User>,
    keywords: &[String],
    weights: &std::collections::HashMap<String, f64>,
) -> Result<Vec<f32>, StoreError> {
    let mut x = build_features_with_history(store, window_start, posts)?;
    meta::augment_meta(&mut x, posts, authors, keywords, weights);
    store.put_feature(
        window_start,
        &x,
        None,
        Some(&serde_json::json!({"source": "window"})),
    )?;
    Ok(x)
}
