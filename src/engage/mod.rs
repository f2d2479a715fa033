//! Budget & calibration gate
//!
//! Budgets are counted over UTC calendar windows: `[top_of_hour, +1h)` and
//! `[midnight, +24h)`, not trailing windows. That is a deliberate policy with
//! a known limitation: a burst just before a boundary plus another just after
//! can together exceed the intended rate.
//!
//! The gate is advisory and stateless per call; callers re-invoke it at each
//! decision point.

use crate::config::Budget;
use crate::nn::artifact_threshold;
use crate::store::{Store, StoreError};
use chrono::{DateTime, Datelike, Duration, TimeZone, Timelike, Utc};
use std::collections::HashMap;

/// Start of the UTC calendar hour containing `now`.
fn hour_start(now: DateTime<Utc>) -> DateTime<Utc> {
    Utc.with_ymd_and_hms(
        now.date_naive().year(),
        now.date_naive().month(),
        now.date_naive().day(),
        now.hour(),
        0,
        0,
    )
    .single()
    .unwrap_or(now)
}

/// Start of the UTC calendar day containing `now`.
fn day_start(now: DateTime<Utc>) -> DateTime<Utc> {
    Utc.with_ymd_and_hms(
        now.date_naive().year(),
        now.date_naive().month(),
        now.date_naive().day(),
        0,
        0,
        0,
    )
    .single()
    .unwrap_or(now)
}

/// Checks the per-type budget for `kind` at `now`. No configured budget for
/// the type means unconditionally allowed; a zero cap disables that axis.
pub fn allowed(
    store: &Store,
    budgets: &HashMap<String, Budget>,
    kind: &str,
    now: DateTime<Utc>,
) -> Result<bool, StoreError> {
    let Some(budget) = budgets.get(kind) else {
        return Ok(true);
    };

    let hs = hour_start(now);
    let hour_count = store.count_actions_within(hs, hs + Duration::hours(1), kind)?;
    if budget.max_per_hour > 0 && hour_count >= budget.max_per_hour {
        return Ok(false);
    }

    let ds = day_start(now);
    let day_count = store.count_actions_within(ds, ds + Duration::hours(24), kind)?;
    if budget.max_per_day > 0 && day_count >= budget.max_per_day {
        return Ok(false);
    }

    Ok(true)
}

/// Records a performed action of `kind` for budget counting.
pub fn record(store: &Store, kind: &str, now: DateTime<Utc>) -> Result<(), StoreError> {
    store.put_action(now, kind)
}

/// Pure decision: engage when the prediction reaches the threshold.
pub fn should_engage(prediction: f32, threshold: f32) -> bool {
    prediction >= threshold
}

/// Threshold resolution order: stored calibration (if present and positive),
/// else the model artifact's `threshold` field, else 0 (never block).
pub fn effective_threshold(store: &Store, model_path: &str) -> f32 {
    match store.load_threshold() {
        Ok(Some(thr)) if thr > 0.0 => return thr as f32,
        Ok(_) => {}
        Err(e) => log::warn!("⚠️  Calibration read failed: {}", e),
    }
    artifact_threshold(model_path).unwrap_or(0.0) as f32
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn budgets(kind: &str, per_hour: i64, per_day: i64) -> HashMap<String, Budget> {
        let mut m = HashMap::new();
        m.insert(
            kind.to_string(),
            Budget {
                max_per_hour: per_hour,
                max_per_day: per_day,
            },
        );
        m
    }

    fn at(h: u32, m: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 3, 4, h, m, 0).unwrap()
    }

    #[test]
    fn test_hourly_budget_exhausted() {
        let store = Store::open_in_memory().unwrap();
        let b = budgets("reply", 2, 0);
        let now = at(10, 30);

        assert!(allowed(&store, &b, "reply", now).unwrap());
        record(&store, "reply", at(10, 5)).unwrap();
        record(&store, "reply", at(10, 20)).unwrap();
        assert!(!allowed(&store, &b, "reply", now).unwrap());
    }

    #[test]
    fn test_hour_boundary_resets_but_day_cap_holds() {
        let store = Store::open_in_memory().unwrap();
        let b = budgets("reply", 2, 3);

        record(&store, "reply", at(10, 5)).unwrap();
        record(&store, "reply", at(10, 20)).unwrap();
        // hourly cap reached inside hour 10
        assert!(!allowed(&store, &b, "reply", at(10, 50)).unwrap());
        // next hour: hourly count resets
        assert!(allowed(&store, &b, "reply", at(11, 0)).unwrap());
        record(&store, "reply", at(11, 1)).unwrap();
        // daily cap of 3 now reached
        assert!(!allowed(&store, &b, "reply", at(11, 30)).unwrap());
    }

    #[test]
    fn test_unconfigured_type_always_allowed() {
        let store = Store::open_in_memory().unwrap();
        let b = budgets("reply", 1, 1);
        for _ in 0..5 {
            record(&store, "like", at(10, 5)).unwrap();
        }
        assert!(allowed(&store, &b, "like", at(10, 30)).unwrap());
    }

    #[test]
    fn test_zero_caps_mean_unlimited() {
        let store = Store::open_in_memory().unwrap();
        let b = budgets("reply", 0, 0);
        for i in 0..10 {
            record(&store, "reply", at(10, i)).unwrap();
        }
        assert!(allowed(&store, &b, "reply", at(10, 30)).unwrap());
    }

    #[test]
    fn test_calendar_window_not_trailing() {
        let store = Store::open_in_memory().unwrap();
        let b = budgets("reply", 2, 0);
        // two actions late in hour 10; a check early in hour 11 sees a fresh
        // hourly window even though less than an hour has passed
        record(&store, "reply", at(10, 58)).unwrap();
        record(&store, "reply", at(10, 59)).unwrap();
        assert!(allowed(&store, &b, "reply", at(11, 1)).unwrap());
    }

    #[test]
    fn test_should_engage_comparison() {
        assert!(should_engage(0.5, 0.5));
        assert!(should_engage(0.9, 0.5));
        assert!(!should_engage(0.49, 0.5));
        // zero threshold never blocks
        assert!(should_engage(0.0, 0.0));
    }

    #[test]
    fn test_threshold_resolution_order() {
        let store = Store::open_in_memory().unwrap();

        // nothing stored, no artifact: 0
        assert_eq!(effective_threshold(&store, "/nonexistent/model.json"), 0.0);

        // artifact only
        let mut artifact = tempfile::NamedTempFile::new().unwrap();
        write!(artifact, r#"{{"threshold": 0.25, "hidden": 64}}"#).unwrap();
        let path = artifact.path().to_str().unwrap().to_string();
        assert!((effective_threshold(&store, &path) - 0.25).abs() < 1e-6);

        // stored calibration wins once positive
        store.save_threshold(0.6).unwrap();
        assert!((effective_threshold(&store, &path) - 0.6).abs() < 1e-6);

        // non-positive stored value falls back to the artifact
        store.save_threshold(0.0).unwrap();
        assert!((effective_threshold(&store, &path) - 0.25).abs() < 1e-6);
    }
}
