//! Meta feature augmentation
//!
//! Fills the last five vector slots with text-relevance statistics and a
//! bot-likelihood histogram over the window's authors. Runs as a separate
//! step after the base builder so callers without author data can skip it.

use super::{META_OFFSET, META_SLOTS};
use crate::model::{bot_likelihood, interest_relevance, Tweet, User};
use std::collections::HashMap;

/// Computes [relevance mean, relevance variance, bot low, bot mid, bot high].
/// All zeros when the window has no posts. Bucket thresholds are 0.33/0.66;
/// fractions are over the post count.
pub fn meta_features(
    posts: &[Tweet],
    authors: &HashMap<String, User>,
    keywords: &[String],
    weights: &HashMap<String, f64>,
) -> [f32; META_SLOTS] {
    if posts.is_empty() {
        return [0.0; META_SLOTS];
    }

    let mut rels = Vec::with_capacity(posts.len());
    let (mut low, mut mid, mut high) = (0usize, 0usize, 0usize);
    for t in posts {
        rels.push(interest_relevance(&t.text, keywords, weights));
        if let Some(u) = authors.get(&t.author_id) {
            let b = bot_likelihood(u);
            if b < 0.33 {
                low += 1;
            } else if b < 0.66 {
                mid += 1;
            } else {
                high += 1;
            }
        }
    }

    let n = rels.len() as f64;
    let mean = rels.iter().sum::<f64>() / n;
    let variance = rels.iter().map(|r| (r - mean) * (r - mean)).sum::<f64>() / n;

    let total = posts.len() as f64;
    [
        mean as f32,
        variance as f32,
        (low as f64 / total) as f32,
        (mid as f64 / total) as f32,
        (high as f64 / total) as f32,
    ]
}

/// Writes the meta features into an already built vector. A short vector is
/// left untouched.
pub fn augment_meta(
    x: &mut [f32],
    posts: &[Tweet],
    authors: &HashMap<String, User>,
    keywords: &[String],
    weights: &HashMap<String, f64>,
) {
    if x.len() < META_OFFSET + META_SLOTS {
        return;
    }
    let m = meta_features(posts, authors, keywords, weights);
    x[META_OFFSET..META_OFFSET + META_SLOTS].copy_from_slice(&m);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::features::VECTOR_LEN;

    fn tweet(id: &str, author: &str, text: &str) -> Tweet {
        Tweet {
            id: id.to_string(),
            author_id: author.to_string(),
            text: text.to_string(),
            ..Default::default()
        }
    }

    fn organic_user(id: &str) -> User {
        User {
            id: id.to_string(),
            verified: true,
            followers_count: 1000,
            following_count: 100,
            description: "human".to_string(),
            ..Default::default()
        }
    }

    fn bot_user(id: &str) -> User {
        User {
            id: id.to_string(),
            default_image: true,
            followers_count: 5,
            following_count: 900,
            description: String::new(),
            ..Default::default()
        }
    }

    #[test]
    fn test_empty_posts_all_zero() {
        let m = meta_features(&[], &HashMap::new(), &[], &HashMap::new());
        assert_eq!(m, [0.0; META_SLOTS]);
    }

    #[test]
    fn test_bot_buckets() {
        let posts = vec![
            tweet("1", "good", "hello"),
            tweet("2", "bad", "hello"),
        ];
        let mut authors = HashMap::new();
        authors.insert("good".to_string(), organic_user("good"));
        authors.insert("bad".to_string(), bot_user("bad"));

        let m = meta_features(&posts, &authors, &[], &HashMap::new());
        assert!((m[2] - 0.5).abs() < 1e-6); // low
        assert!((m[4] - 0.5).abs() < 1e-6); // high
        assert_eq!(m[3], 0.0);
    }

    #[test]
    fn test_relevance_stats() {
        let posts = vec![
            tweet("1", "a", "rust rust rust"),
            tweet("2", "a", "unrelated words entirely"),
        ];
        let keywords = vec!["rust".to_string()];
        let m = meta_features(&posts, &HashMap::new(), &keywords, &HashMap::new());
        assert!(m[0] > 0.0); // mean relevance positive
        assert!(m[1] > 0.0); // spread between the two posts
    }

    #[test]
    fn test_augment_writes_tail_slots() {
        let mut x = vec![1.0f32; VECTOR_LEN];
        let posts = vec![tweet("1", "a", "rust")];
        augment_meta(
            &mut x,
            &posts,
            &HashMap::new(),
            &["rust".to_string()],
            &HashMap::new(),
        );
        assert!(x[META_OFFSET] > 0.0);
        assert_eq!(x[META_OFFSET + 2], 0.0); // no author data: buckets zero
        // base slots untouched
        assert_eq!(x[0], 1.0);
    }

    #[test]
    fn test_augment_ignores_short_vector() {
        let mut x = vec![1.0f32; 4];
        augment_meta(&mut x, &[], &HashMap::new(), &[], &HashMap::new());
        assert_eq!(x, vec![1.0f32; 4]);
    }
}
