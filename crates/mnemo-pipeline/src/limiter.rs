use std::sync::{Arc, Mutex};
use std::time::Duration;

use dashmap::DashMap;
use tokio::time::Instant;
use tracing::debug;

/// Upper bound on tracked per-channel buckets before idle eviction.
const MAX_CHANNEL_BUCKETS: usize = 1024;

struct Bucket {
    tokens: f64,
    last_refill: Instant,
}

impl Bucket {
    fn full(capacity: f64) -> Self {
        Self {
            tokens: capacity,
            last_refill: Instant::now(),
        }
    }

    /// Refill from the monotonic clock delta since the last refill.
    fn refill(&mut self, rate: f64, capacity: f64) {
        let now = Instant::now();
        let elapsed = now.duration_since(self.last_refill).as_secs_f64();
        self.tokens = (self.tokens + elapsed * rate).min(capacity);
        self.last_refill = now;
    }

    /// Seconds until one token is available.
    fn time_to_one(&self, rate: f64) -> f64 {
        if self.tokens >= 1.0 {
            0.0
        } else {
            (1.0 - self.tokens) / rate
        }
    }
}

struct ChannelEntry {
    bucket: Bucket,
    last_used: Instant,
}

/// Global + per-channel token buckets.
///
/// Refills use monotonic clock deltas, never wall time. `acquire` consumes
/// one token from each bucket; when either is short it sleeps for the
/// shorter of the two refill waits and retries. The bucket mutexes are never
/// held across the sleep.
pub struct RateLimiter {
    global_rate: f64,
    channel_rate: f64,
    global: Mutex<Bucket>,
    channels: DashMap<String, Arc<Mutex<ChannelEntry>>>,
}

impl RateLimiter {
    /// Capacities equal the rates, per the bucket contract.
    pub fn new(global_rate: u32, channel_rate: u32) -> Self {
        let global_rate = global_rate as f64;
        Self {
            global_rate,
            channel_rate: channel_rate as f64,
            global: Mutex::new(Bucket::full(global_rate)),
            channels: DashMap::new(),
        }
    }

    fn channel(&self, channel_id: &str) -> Arc<Mutex<ChannelEntry>> {
        if self.channels.len() >= MAX_CHANNEL_BUCKETS && !self.channels.contains_key(channel_id) {
            self.evict_oldest_channel();
        }
        self.channels
            .entry(channel_id.to_string())
            .or_insert_with(|| {
                Arc::new(Mutex::new(ChannelEntry {
                    bucket: Bucket::full(self.channel_rate),
                    last_used: Instant::now(),
                }))
            })
            .clone()
    }

    fn evict_oldest_channel(&self) {
        let oldest = self
            .channels
            .iter()
            .filter_map(|entry| {
                entry
                    .value()
                    .try_lock()
                    .ok()
                    .map(|e| (entry.key().clone(), e.last_used))
            })
            .min_by_key(|(_, used)| *used)
            .map(|(key, _)| key);
        if let Some(key) = oldest {
            self.channels.remove(&key);
        }
    }

    /// Take one token from the global and the channel bucket, waiting as
    /// long as necessary. Waiting is not an error to the caller.
    pub async fn acquire(&self, channel_id: &str) {
        let channel = self.channel(channel_id);
        loop {
            // Consume under the locks, or compute the shorter refill wait.
            let wait = {
                let mut global = self.global.lock().unwrap();
                let mut entry = channel.lock().unwrap();
                global.refill(self.global_rate, self.global_rate);
                entry.bucket.refill(self.channel_rate, self.channel_rate);
                entry.last_used = Instant::now();

                if global.tokens >= 1.0 && entry.bucket.tokens >= 1.0 {
                    global.tokens -= 1.0;
                    entry.bucket.tokens -= 1.0;
                    return;
                }

                let global_wait = global.time_to_one(self.global_rate);
                let channel_wait = entry.bucket.time_to_one(self.channel_rate);
                // Sleep for the shorter of the two refills; the loop
                // re-checks both buckets on wake.
                let shortfalls = [global_wait, channel_wait];
                shortfalls
                    .into_iter()
                    .filter(|w| *w > 0.0)
                    .fold(f64::MAX, f64::min)
            };

            // Both mutexes are released before sleeping.
            debug!(channel = channel_id, wait_s = wait, "rate limited, waiting");
            tokio::time::sleep(Duration::from_secs_f64(wait)).await;
        }
    }

    /// Approximate token counts (read without consuming). Only accurate at
    /// the instant of the read.
    pub fn approx_available(&self, channel_id: &str) -> (f64, f64) {
        let global = {
            let mut g = self.global.lock().unwrap();
            g.refill(self.global_rate, self.global_rate);
            g.tokens
        };
        let channel = self
            .channels
            .get(channel_id)
            .map(|entry| {
                let mut e = entry.lock().unwrap();
                e.bucket.refill(self.channel_rate, self.channel_rate);
                e.bucket.tokens
            })
            .unwrap_or(self.channel_rate);
        (global, channel)
    }

    /// Number of tracked channel buckets.
    pub fn channel_count(&self) -> usize {
        self.channels.len()
    }

    /// Drop channel buckets idle longer than `ttl` (registered sweep task).
    pub fn sweep_idle(&self, ttl: Duration) -> usize {
        let stale: Vec<String> = self
            .channels
            .iter()
            .filter_map(|entry| {
                entry
                    .value()
                    .try_lock()
                    .ok()
                    .filter(|e| e.last_used.elapsed() >= ttl)
                    .map(|_| entry.key().clone())
            })
            .collect();
        for key in &stale {
            self.channels.remove(key);
        }
        stale.len()
    }
}
