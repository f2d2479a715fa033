//! Domain types for tweets, users, and engagement events
//!
//! Also holds the scoring heuristics (interest relevance, bot likelihood)
//! that feed the meta feature slots.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Subset of tweet fields used by the pipeline.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Tweet {
    pub id: String,
    pub author_id: String,
    pub text: String,
    pub created_at: Option<DateTime<Utc>>,
    pub like_count: i64,
    pub reply_count: i64,
    pub retweet_count: i64,
    pub quote_count: i64,
    pub language: String,
}

/// Subset of user fields used by the pipeline.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct User {
    pub id: String,
    pub username: String,
    pub name: String,
    pub description: String,
    pub created_at: Option<DateTime<Utc>>,
    pub followers_count: i64,
    pub following_count: i64,
    pub tweet_count: i64,
    pub listed_count: i64,
    pub verified: bool,
    pub default_profile: bool,
    pub default_image: bool,
}

/// Event taxonomy. Stored as lowercase strings in the events table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EventKind {
    Like,
    Reply,
    Retweet,
    Quote,
    Home,
    Mention,
}

impl EventKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventKind::Like => "like",
            EventKind::Reply => "reply",
            EventKind::Retweet => "retweet",
            EventKind::Quote => "quote",
            EventKind::Home => "home",
            EventKind::Mention => "mention",
        }
    }

    pub fn parse(s: &str) -> Option<EventKind> {
        match s {
            "like" => Some(EventKind::Like),
            "reply" => Some(EventKind::Reply),
            "retweet" => Some(EventKind::Retweet),
            "quote" => Some(EventKind::Quote),
            "home" => Some(EventKind::Home),
            "mention" => Some(EventKind::Mention),
            _ => None,
        }
    }
}

impl std::fmt::Display for EventKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Lowercases and splits text on whitespace and common punctuation.
pub fn tokenize(text: &str) -> Vec<String> {
    text.to_lowercase()
        .split(|c: char| c.is_whitespace() || ",.!?:;()[]".contains(c))
        .filter(|t| !t.is_empty())
        .map(|t| t.to_string())
        .collect()
}

/// Scores how relevant text is to the configured interests, in [0,1].
///
/// Keyword hits are weight-summed and normalized roughly by token count.
pub fn interest_relevance(text: &str, keywords: &[String], weights: &HashMap<String, f64>) -> f64 {
    let tokens = tokenize(text);
    if tokens.is_empty() || keywords.is_empty() {
        return 0.0;
    }
    let mut kw: HashMap<String, f64> = HashMap::with_capacity(keywords.len());
    for k in keywords {
        let lk = k.to_lowercase();
        let w = weights.get(&lk).copied().unwrap_or(1.0);
        kw.insert(lk, w);
    }
    let mut sum = 0.0;
    for t in &tokens {
        if let Some(w) = kw.get(t) {
            sum += w;
        }
    }
    let norm = (sum / (tokens.len() as f64 + 1.0)).min(1.0);
    (norm * 100.0).round() / 100.0
}

/// Estimates how likely a user is a bot, in [0,1]. Lower is better.
pub fn bot_likelihood(u: &User) -> f64 {
    let mut score: f64 = 0.2;
    if u.default_image || u.default_profile {
        score += 0.2;
    }
    if !u.verified && u.followers_count < 50 && u.following_count > 500 {
        score += 0.3;
    }
    if u.description.trim().is_empty() {
        score += 0.1;
    }
    score = score.min(1.0);
    (score * 100.0).round() / 100.0
}
