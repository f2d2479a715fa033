//! Ingestion scheduler
//!
//! One tick resolves each stream's cursor, fetches, upserts, advances the
//! cursor for successful streams only, then backfills labels for completed
//! windows. Ticks run strictly sequentially; a tick failure is logged and the
//! next tick resumes from the last good cursors.

use super::{
    backfill_labels, ingest_likes, ingest_quotes, ingest_replies, ingest_retweets,
    sync_home_timeline, BoxError, HomeTimelineSource, CURSOR_LIKES, CURSOR_QUOTES,
    CURSOR_REPLIES, CURSOR_RETWEETS,
};
use crate::client::ApiClient;
use crate::config::Config;
use crate::store::Store;
use chrono::{DateTime, Duration, SecondsFormat, Utc};
use std::sync::Arc;
use tokio::sync::watch;
use tokio::time::interval;

/// Cursor value (parsed) or `now - horizon` on first run.
fn resolve_since(
    store: &Store,
    key: &str,
    now: DateTime<Utc>,
    horizon: Duration,
) -> DateTime<Utc> {
    if let Ok(Some(raw)) = store.load_cursor(key) {
        if let Ok(ts) = DateTime::parse_from_rfc3339(&raw) {
            return ts.with_timezone(&Utc);
        }
        log::warn!("⚠️  Cursor {} holds unparsable value {:?}, falling back", key, raw);
    }
    now - horizon
}

fn advance_cursor(store: &Store, key: &str, now: DateTime<Utc>) {
    let value = now.to_rfc3339_opts(SecondsFormat::Nanos, true);
    if let Err(e) = store.save_cursor(key, &value) {
        log::error!("❌ Failed to advance cursor {}: {}", key, e);
    }
}

/// Runs one ingestion tick. Stream failures are isolated: a failing stream
/// keeps its cursor and the remaining streams still run.
pub async fn run_ingestion_once(
    store: &Store,
    client: &dyn ApiClient,
    cfg: &Config,
) -> Result<(), BoxError> {
    let now = Utc::now();
    let horizon = Duration::seconds(cfg.ingest_horizon_secs as i64);

    let me = client.get_user_by_username(&cfg.username).await?;

    let mut earliest = now;
    let mut fetched = 0usize;
    let mut failed_streams = 0usize;

    // likes
    let since = resolve_since(store, CURSOR_LIKES, now, horizon);
    earliest = earliest.min(since);
    match ingest_likes(store, client, &me.id, now).await {
        Ok(n) => {
            fetched += n;
            advance_cursor(store, CURSOR_LIKES, now);
        }
        Err(e) => {
            failed_streams += 1;
            log::warn!("⚠️  Likes stream failed, cursor not advanced: {}", e);
        }
    }

    // replies via search
    let since = resolve_since(store, CURSOR_REPLIES, now, horizon);
    earliest = earliest.min(since);
    match ingest_replies(store, client, &cfg.username, since, now).await {
        Ok(n) => {
            fetched += n;
            advance_cursor(store, CURSOR_REPLIES, now);
        }
        Err(e) => {
            failed_streams += 1;
            log::warn!("⚠️  Replies stream failed, cursor not advanced: {}", e);
        }
    }

    // retweets via search
    let since = resolve_since(store, CURSOR_RETWEETS, now, horizon);
    earliest = earliest.min(since);
    match ingest_retweets(store, client, &cfg.username, since, now).await {
        Ok(n) => {
            fetched += n;
            advance_cursor(store, CURSOR_RETWEETS, now);
        }
        Err(e) => {
            failed_streams += 1;
            log::warn!("⚠️  Retweets stream failed, cursor not advanced: {}", e);
        }
    }

    // quotes of own tweets
    let since = resolve_since(store, CURSOR_QUOTES, now, horizon);
    earliest = earliest.min(since);
    match ingest_quotes(store, client, &me.id, now).await {
        Ok(n) => {
            fetched += n;
            advance_cursor(store, CURSOR_QUOTES, now);
        }
        Err(e) => {
            failed_streams += 1;
            log::warn!("⚠️  Quotes stream failed, cursor not advanced: {}", e);
        }
    }

    // Backfill labels for windows whose successor has fully elapsed.
    match backfill_labels(store, earliest, now, now) {
        Ok(n) if n > 0 => log::info!("🏷️  Backfilled {} window labels", n),
        Ok(_) => {}
        Err(e) => log::warn!("⚠️  Label backfill failed: {}", e),
    }

    log::info!(
        "📊 Ingestion tick complete: {} events upserted, {} stream(s) failed",
        fetched,
        failed_streams
    );
    Ok(())
}

/// Runs ticks until shutdown: one immediately, then one per interval. The
/// in-flight tick always completes; shutdown is only observed between ticks.
pub async fn run_ingestion_loop(
    store: &Store,
    client: &dyn ApiClient,
    cfg: &Config,
    shutdown: watch::Receiver<bool>,
) {
    log::info!(
        "🔄 Starting ingestion loop (interval: {}s, horizon: {}s)",
        cfg.ingest_interval_secs,
        cfg.ingest_horizon_secs
    );

    let mut timer = interval(std::time::Duration::from_secs(cfg.ingest_interval_secs.max(1)));
    let mut sd = shutdown.clone();
    loop {
        tokio::select! {
            _ = sd.wait_for(|stop| *stop) => {
                log::info!("🛑 Ingestion loop stopping");
                return;
            }
            // first tick fires immediately
            _ = timer.tick() => {
                if let Err(e) = run_ingestion_once(store, client, cfg).await {
                    log::error!("❌ Ingestion tick failed: {}", e);
                }
            }
        }
    }
}

/// Home-timeline sync loop, spawned alongside the ingestion loop when OAuth
/// credentials are configured. Page errors end the sync for that tick only.
pub async fn run_home_sync_loop(
    store: Store,
    source: Arc<dyn HomeTimelineSource>,
    per_page: u32,
    pages: u32,
    interval_secs: u64,
    shutdown: watch::Receiver<bool>,
) {
    log::info!("🏠 Starting home-timeline sync (interval: {}s)", interval_secs);
    let mut timer = interval(std::time::Duration::from_secs(interval_secs.max(1)));
    let mut sd = shutdown.clone();
    loop {
        tokio::select! {
            _ = async { let _ = sd.wait_for(|stop| *stop).await; } => {
                log::info!("🛑 Home-timeline sync stopping");
                return;
            }
            _ = timer.tick() => {
                match sync_home_timeline(&store, source.as_ref(), per_page, pages).await {
                    Ok(n) if n > 0 => log::info!("🏠 Home sync stored {} items", n),
                    Ok(_) => {}
                    Err(e) => log::warn!("⚠️  Home sync failed: {}", e),
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_resolve_since_prefers_cursor() {
        let store = Store::open_in_memory().unwrap();
        let now = Utc.with_ymd_and_hms(2024, 3, 4, 12, 0, 0).unwrap();
        let saved = Utc.with_ymd_and_hms(2024, 3, 4, 11, 30, 0).unwrap();
        store
            .save_cursor(CURSOR_LIKES, &saved.to_rfc3339_opts(SecondsFormat::Nanos, true))
            .unwrap();
        let since = resolve_since(&store, CURSOR_LIKES, now, Duration::hours(1));
        assert_eq!(since, saved);
    }

    #[test]
    fn test_resolve_since_falls_back_to_horizon() {
        let store = Store::open_in_memory().unwrap();
        let now = Utc.with_ymd_and_hms(2024, 3, 4, 12, 0, 0).unwrap();
        let since = resolve_since(&store, CURSOR_LIKES, now, Duration::hours(1));
        assert_eq!(since, now - Duration::hours(1));
    }

    #[test]
    fn test_resolve_since_ignores_garbage_cursor() {
        let store = Store::open_in_memory().unwrap();
        let now = Utc.with_ymd_and_hms(2024, 3, 4, 12, 0, 0).unwrap();
        store.save_cursor(CURSOR_LIKES, "not-a-timestamp").unwrap();
        let since = resolve_since(&store, CURSOR_LIKES, now, Duration::hours(2));
        assert_eq!(since, now - Duration::hours(2));
    }
}
