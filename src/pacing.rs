use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::Mutex as AsyncMutex;
use tokio::time::{sleep, Instant};
use tracing::debug;

use crate::config::PacingConfig;

/// Named waits the pipeline must honour against the Places API.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Pause {
    /// Before a follow-up call that carries a `next_page_token`.
    PageToken,
    /// Between two distinct query templates for the same location.
    BetweenQueries,
    /// Between two batches of work items.
    BetweenBatches,
    /// After every N detail fetches during enrichment.
    DetailCooldown,
}

impl Pause {
    pub fn as_str(&self) -> &'static str {
        match self {
            Pause::PageToken => "page_token",
            Pause::BetweenQueries => "between_queries",
            Pause::BetweenBatches => "between_batches",
            Pause::DetailCooldown => "detail_cooldown",
        }
    }
}

#[async_trait]
pub trait Pacer: Send + Sync {
    async fn pause(&self, pause: Pause);
}

/// Blocks the current worker for the configured duration of each pause.
pub struct SleepPacer {
    config: PacingConfig,
}

impl SleepPacer {
    pub fn new(config: PacingConfig) -> Self {
        Self { config }
    }

    fn duration(&self, pause: Pause) -> Duration {
        match pause {
            Pause::PageToken => self.config.page_token_delay,
            Pause::BetweenQueries => self.config.query_delay,
            Pause::BetweenBatches => self.config.batch_cooldown,
            Pause::DetailCooldown => self.config.detail_cooldown,
        }
    }
}

#[async_trait]
impl Pacer for SleepPacer {
    async fn pause(&self, pause: Pause) {
        let duration = self.duration(pause);
        if duration.is_zero() {
            return;
        }
        debug!(pause = pause.as_str(), ?duration, "pacing external calls");
        sleep(duration).await;
    }
}

/// Zero-delay pacer for tests and dry runs.
#[derive(Default)]
pub struct NoDelay;

#[async_trait]
impl Pacer for NoDelay {
    async fn pause(&self, _pause: Pause) {}
}

/// Token bucket shared by every outbound Places call.
///
/// Holds at most `capacity` tokens and refills one token every
/// `1 / qps` seconds, so no rolling one-second window sees more than
/// `capacity` calls after the initial burst.
pub struct RateLimiter {
    capacity: f64,
    refill_per_sec: f64,
    state: AsyncMutex<Bucket>,
}

struct Bucket {
    tokens: f64,
    last_refill: Instant,
}

impl RateLimiter {
    pub fn new(qps: u32) -> Self {
        let qps = qps.max(1) as f64;
        Self {
            capacity: qps,
            refill_per_sec: qps,
            state: AsyncMutex::new(Bucket {
                tokens: qps,
                last_refill: Instant::now(),
            }),
        }
    }

    pub fn qps(&self) -> u32 {
        self.refill_per_sec.round() as u32
    }

    pub async fn acquire(&self) {
        let mut bucket = self.state.lock().await;
        loop {
            let now = Instant::now();
            let elapsed = now.duration_since(bucket.last_refill).as_secs_f64();
            bucket.tokens = (bucket.tokens + elapsed * self.refill_per_sec).min(self.capacity);
            bucket.last_refill = now;

            if bucket.tokens >= 1.0 {
                bucket.tokens -= 1.0;
                return;
            }

            let missing = 1.0 - bucket.tokens;
            sleep(Duration::from_secs_f64(missing / self.refill_per_sec)).await;
        }
    }
}
