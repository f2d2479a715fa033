//! Token-bucket rate limiter gating every outbound API call
//!
//! Refills continuously at `rps` tokens per second up to `burst`. Waits are
//! cancellable: a shutdown signal observed mid-wait aborts with `Cancelled`
//! before any I/O happens.

use super::ApiError;
use std::sync::Mutex;
use std::time::{Duration, Instant};
use tokio::sync::watch;

pub struct TokenBucket {
    rate: f64,
    burst: f64,
    state: Mutex<BucketState>,
}

struct BucketState {
    tokens: f64,
    last_refill: Instant,
}

impl TokenBucket {
    pub fn new(rps: f64, burst: u32) -> Self {
        let burst = burst.max(1) as f64;
        Self {
            rate: rps.max(f64::MIN_POSITIVE),
            burst,
            state: Mutex::new(BucketState {
                tokens: burst,
                last_refill: Instant::now(),
            }),
        }
    }

    /// Takes one token, sleeping until one is available. Returns
    /// `ApiError::Cancelled` immediately if shutdown flips during the wait.
    pub async fn wait(&self, shutdown: &watch::Receiver<bool>) -> Result<(), ApiError> {
        loop {
            let deficit = {
                let mut st = self.state.lock().unwrap();
                let now = Instant::now();
                let elapsed = now.duration_since(st.last_refill).as_secs_f64();
                st.tokens = (st.tokens + elapsed * self.rate).min(self.burst);
                st.last_refill = now;
                if st.tokens >= 1.0 {
                    st.tokens -= 1.0;
                    None
                } else {
                    Some(Duration::from_secs_f64((1.0 - st.tokens) / self.rate))
                }
            };

            match deficit {
                None => return Ok(()),
                Some(wait) => {
                    let mut sd = shutdown.clone();
                    tokio::select! {
                        _ = sd.wait_for(|stop| *stop) => return Err(ApiError::Cancelled),
                        _ = tokio::time::sleep(wait) => {}
                    }
                }
            }
        }
    }
}
