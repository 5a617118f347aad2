//! API key pool with per-key concurrency and daily-quota accounting.
//!
//! Every key lives in exactly one of three states:
//! - active: eligible for allocation, carrying `in_use` / `daily_total` counters
//! - frozen: temporarily out of rotation after a rate-limit signal, thawed by time
//! - evicted: daily ceiling reached, returned to rotation on the next UTC day
//!
//! Transitions are owned by this module; nothing else mutates the sets.

use log::{debug, info};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, Notify};
use tokio::time::Instant;

/// Default freeze window applied when a rate-limit signal carries no
/// specific duration.
pub const DEFAULT_FREEZE: Duration = Duration::from_secs(10);

/// Re-sweep interval while waiting for capacity. Frozen keys thaw and the
/// day rolls over on this cadence even when no release wakes the waiter.
const ACQUIRE_SWEEP_INTERVAL: Duration = Duration::from_millis(10);

/// How a borrowed key is handed back.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Release {
    /// Normal completion: one concurrent allocation returned.
    Normal,
    /// Rate-limit signal: pull the key out of rotation until the window
    /// elapses. The daily total carries over.
    Freeze(Duration),
}

#[derive(Debug, Clone)]
struct ActiveKey {
    id: String,
    in_use: u32,
    daily_total: u64,
}

#[derive(Debug, Clone)]
struct FrozenKey {
    unfreeze_at: Instant,
    daily_total: u64,
}

/// Mutable pool state. Held behind one mutex so every transition is
/// serialized, which is what the counter invariants assume.
#[derive(Debug, Default)]
struct PoolState {
    /// Iteration order is arrival order.
    active: Vec<ActiveKey>,
    frozen: HashMap<String, FrozenKey>,
    evicted: Vec<String>,
    reset_day: i64,
}

impl PoolState {
    fn contains(&self, key: &str) -> bool {
        self.active.iter().any(|k| k.id == key)
            || self.frozen.contains_key(key)
            || self.evicted.iter().any(|k| k == key)
    }

    /// Return every evicted key to the active pool with zeroed counters.
    /// Active keys keep their running totals until they cross the ceiling.
    fn reset_daily(&mut self, day: i64) {
        if day == self.reset_day {
            return;
        }
        self.reset_day = day;
        if self.evicted.is_empty() {
            return;
        }
        info!(
            "Daily rollover: restoring {} evicted key(s) to the pool",
            self.evicted.len()
        );
        for id in self.evicted.drain(..) {
            self.active.push(ActiveKey {
                id,
                in_use: 0,
                daily_total: 0,
            });
        }
    }

    /// Move expired frozen keys back to the active pool, daily total
    /// preserved and concurrency counter cleared.
    fn thaw_expired(&mut self, now: Instant) {
        let expired: Vec<String> = self
            .frozen
            .iter()
            .filter(|(_, f)| f.unfreeze_at <= now)
            .map(|(id, _)| id.clone())
            .collect();
        for id in expired {
            if let Some(frozen) = self.frozen.remove(&id) {
                debug!("Unfreezing key {}", redact(&id));
                self.active.push(ActiveKey {
                    id,
                    in_use: 0,
                    daily_total: frozen.daily_total,
                });
            }
        }
    }

    /// One allocation sweep over the active keys. Keys at the daily
    /// ceiling are evicted as they are encountered; takes are clamped to
    /// both the concurrency headroom and the remaining daily headroom so
    /// `daily_total` never overshoots the limit.
    fn take_available(
        &mut self,
        mut needed: usize,
        key_rps: u32,
        key_limit: u64,
        out: &mut Vec<String>,
    ) {
        let mut idx = 0;
        while idx < self.active.len() && needed > 0 {
            let key = &mut self.active[idx];
            if key.daily_total >= key_limit {
                let evicted = self.active.remove(idx);
                info!(
                    "Key {} reached daily limit ({}), evicting until rollover",
                    redact(&evicted.id),
                    key_limit
                );
                self.evicted.push(evicted.id);
                continue;
            }
            let rps_headroom = key_rps.saturating_sub(key.in_use) as u64;
            let daily_headroom = key_limit - key.daily_total;
            let take = rps_headroom.min(daily_headroom).min(needed as u64);
            if take > 0 {
                key.in_use += take as u32;
                key.daily_total += take;
                needed -= take as usize;
                for _ in 0..take {
                    out.push(key.id.clone());
                }
            }
            idx += 1;
        }
    }
}

/// Thread-safe key pool shared across in-flight requests.
#[derive(Debug)]
pub struct KeyPool {
    state: Mutex<PoolState>,
    released: Notify,
    key_rps: u32,
    key_limit: u64,
}

impl KeyPool {
    pub fn new(keys: Vec<String>, key_rps: u32, key_limit: u64) -> Arc<Self> {
        let pool = Arc::new(KeyPool {
            state: Mutex::new(PoolState {
                reset_day: utc_day(),
                ..PoolState::default()
            }),
            released: Notify::new(),
            key_rps,
            key_limit,
        });
        // Seed synchronously; the mutex is uncontended here.
        {
            let mut state = pool
                .state
                .try_lock()
                .expect("fresh pool mutex is uncontended");
            for key in keys {
                if !state.contains(&key) {
                    state.active.push(ActiveKey {
                        id: key,
                        in_use: 0,
                        daily_total: 0,
                    });
                }
            }
        }
        pool
    }

    /// Register additional keys. Duplicates and keys already tracked in
    /// any state are skipped.
    pub async fn add_keys(&self, keys: Vec<String>) {
        let mut state = self.state.lock().await;
        for key in keys {
            if state.contains(&key) {
                continue;
            }
            debug!("Adding key {}", redact(&key));
            state.active.push(ActiveKey {
                id: key,
                in_use: 0,
                daily_total: 0,
            });
        }
    }

    /// Acquire up to `count` allocation units, waiting at most `max_wait`.
    ///
    /// The result may be shorter than `count` (including empty) when the
    /// deadline passes first; callers treat a short result as "proceed
    /// without a key", not as an error. A `max_wait` of zero performs a
    /// single sweep.
    pub async fn acquire(&self, count: usize, max_wait: Duration) -> Vec<String> {
        let count = count.max(1);
        let deadline = Instant::now() + max_wait;
        let mut taken = Vec::with_capacity(count);
        loop {
            {
                let mut state = self.state.lock().await;
                state.reset_daily(utc_day());
                state.thaw_expired(Instant::now());
                state.take_available(count - taken.len(), self.key_rps, self.key_limit, &mut taken);
            }
            if taken.len() >= count || Instant::now() >= deadline {
                return taken;
            }
            // Block on a release signal, but wake on the sweep cadence so
            // frozen-key expiry and the day rollover are still observed.
            tokio::select! {
                _ = self.released.notified() => {}
                _ = tokio::time::sleep(ACQUIRE_SWEEP_INTERVAL) => {}
            }
        }
    }

    /// Hand back one allocation of `key`.
    ///
    /// Unknown keys (already frozen or evicted by a concurrent path) are
    /// ignored.
    pub async fn release(&self, key: &str, mode: Release) {
        let mut state = self.state.lock().await;
        let Some(pos) = state.active.iter().position(|k| k.id == key) else {
            return;
        };
        match mode {
            Release::Normal => {
                let entry = &mut state.active[pos];
                entry.in_use = entry.in_use.saturating_sub(1);
                drop(state);
                self.released.notify_waiters();
            }
            Release::Freeze(duration) => {
                let entry = state.active.remove(pos);
                info!(
                    "Freezing key {} for {:?} (daily total {})",
                    redact(&entry.id),
                    duration,
                    entry.daily_total
                );
                state.frozen.insert(
                    entry.id,
                    FrozenKey {
                        unfreeze_at: Instant::now() + duration,
                        daily_total: entry.daily_total,
                    },
                );
            }
        }
    }

    /// Point-in-time view of the pool, for logs and monitoring.
    pub async fn stats(&self) -> KeyPoolStats {
        let state = self.state.lock().await;
        KeyPoolStats {
            active: state.active.len(),
            frozen: state.frozen.len(),
            evicted: state.evicted.len(),
            in_use: state.active.iter().map(|k| k.in_use as usize).sum(),
        }
    }
}

/// Snapshot of pool occupancy.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyPoolStats {
    pub active: usize,
    pub frozen: usize,
    pub evicted: usize,
    pub in_use: usize,
}

impl std::fmt::Display for KeyPoolStats {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "keys: {} active ({} in use), {} frozen, {} evicted",
            self.active, self.in_use, self.frozen, self.evicted
        )
    }
}

/// Day number since the Unix epoch, UTC.
fn utc_day() -> i64 {
    chrono::Utc::now().timestamp().div_euclid(86_400)
}

/// Keys are secrets; only the first few characters reach the logs.
fn redact(key: &str) -> String {
    if key.len() > 6 {
        format!("{}...", &key[..6])
    } else {
        key.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn pool(keys: &[&str], key_rps: u32, key_limit: u64) -> Arc<KeyPool> {
        KeyPool::new(keys.iter().map(|s| s.to_string()).collect(), key_rps, key_limit)
    }

    #[tokio::test]
    async fn test_acquire_respects_key_rps() {
        let pool = pool(&["a"], 2, 100);
        let keys = pool.acquire(5, Duration::ZERO).await;
        // Only 2 units available on a single key with key_rps = 2.
        assert_eq!(keys, vec!["a".to_string(), "a".to_string()]);

        // Nothing left until a release.
        assert!(pool.acquire(1, Duration::ZERO).await.is_empty());
        pool.release("a", Release::Normal).await;
        assert_eq!(pool.acquire(1, Duration::ZERO).await, vec!["a".to_string()]);
    }

    #[tokio::test]
    async fn test_round_robin_across_keys() {
        let pool = pool(&["a", "b"], 1, 100);
        let keys = pool.acquire(2, Duration::ZERO).await;
        assert_eq!(keys, vec!["a".to_string(), "b".to_string()]);
    }

    // End-to-end scenario A: 2 keys, key_rps = 1, three concurrent
    // acquires. Two are served immediately, the third waits for a release.
    #[tokio::test]
    async fn test_third_acquire_waits_for_release() {
        let pool = pool(&["a", "b"], 1, 5);
        let first = pool.acquire(1, Duration::ZERO).await;
        let second = pool.acquire(1, Duration::ZERO).await;
        assert_eq!(first.len(), 1);
        assert_eq!(second.len(), 1);
        assert_ne!(first[0], second[0]);

        let waiter = {
            let pool = pool.clone();
            tokio::spawn(async move { pool.acquire(1, Duration::from_secs(2)).await })
        };
        // Give the waiter time to park.
        tokio::time::sleep(Duration::from_millis(30)).await;
        assert_eq!(pool.stats().await.in_use, 2);

        pool.release(&first[0], Release::Normal).await;
        let third = waiter.await.unwrap();
        assert_eq!(third, vec![first[0].clone()]);
    }

    // End-to-end scenario B: a key at its daily ceiling is evicted and
    // never handed out again before the day boundary.
    #[tokio::test]
    async fn test_daily_ceiling_evicts() {
        let pool = pool(&["a"], 10, 3);
        let keys = pool.acquire(3, Duration::ZERO).await;
        assert_eq!(keys.len(), 3);
        // Ceiling reached: the next sweep evicts the key.
        assert!(pool.acquire(1, Duration::ZERO).await.is_empty());
        let stats = pool.stats().await;
        assert_eq!(stats.active, 0);
        assert_eq!(stats.evicted, 1);
    }

    #[tokio::test]
    async fn test_take_clamped_to_daily_headroom() {
        // key_rps would allow 10 units at once, but only 4 remain today.
        let pool = pool(&["a"], 10, 4);
        let keys = pool.acquire(10, Duration::ZERO).await;
        assert_eq!(keys.len(), 4);
        assert_eq!(pool.stats().await.in_use, 4);
    }

    #[tokio::test]
    async fn test_freeze_and_thaw() {
        let pool = pool(&["a"], 5, 100);
        let keys = pool.acquire(2, Duration::ZERO).await;
        assert_eq!(keys.len(), 2);

        pool.release("a", Release::Freeze(Duration::from_millis(50))).await;
        let stats = pool.stats().await;
        assert_eq!(stats.active, 0);
        assert_eq!(stats.frozen, 1);
        // Frozen keys are unavailable until the window elapses.
        assert!(pool.acquire(1, Duration::ZERO).await.is_empty());

        // After the window the key rejoins with in_use reset and the
        // daily total carried over.
        let keys = pool.acquire(1, Duration::from_millis(200)).await;
        assert_eq!(keys, vec!["a".to_string()]);
        let stats = pool.stats().await;
        assert_eq!(stats.frozen, 0);
        assert_eq!(stats.in_use, 1);
    }

    #[tokio::test]
    async fn test_daily_total_survives_freeze() {
        let pool = pool(&["a"], 10, 3);
        // Burn 2 of 3 daily units, then freeze.
        assert_eq!(pool.acquire(2, Duration::ZERO).await.len(), 2);
        pool.release("a", Release::Freeze(Duration::from_millis(20))).await;
        // After thawing only one unit remains before eviction.
        let keys = pool.acquire(5, Duration::from_millis(200)).await;
        assert_eq!(keys.len(), 1);
        assert!(pool.acquire(1, Duration::ZERO).await.is_empty());
        assert_eq!(pool.stats().await.evicted, 1);
    }

    #[tokio::test]
    async fn test_release_unknown_key_is_ignored() {
        let pool = pool(&["a"], 2, 100);
        pool.release("nope", Release::Normal).await;
        pool.release("nope", Release::Freeze(DEFAULT_FREEZE)).await;
        assert_eq!(pool.stats().await.active, 1);
    }

    #[tokio::test]
    async fn test_add_keys_skips_known() {
        let pool = pool(&["a"], 1, 100);
        pool.release("a", Release::Freeze(Duration::from_secs(60))).await;
        pool.add_keys(vec!["a".to_string(), "b".to_string(), "b".to_string()]).await;
        let stats = pool.stats().await;
        // "a" stays frozen, "b" added once.
        assert_eq!(stats.active, 1);
        assert_eq!(stats.frozen, 1);
    }

    #[tokio::test]
    async fn test_short_result_on_timeout() {
        let pool = pool(&["a"], 1, 100);
        assert_eq!(pool.acquire(1, Duration::ZERO).await.len(), 1);
        let start = std::time::Instant::now();
        let keys = pool.acquire(1, Duration::from_millis(50)).await;
        assert!(keys.is_empty());
        assert!(start.elapsed() >= Duration::from_millis(50));
    }

    #[tokio::test]
    async fn test_day_rollover_restores_evicted() {
        let pool = pool(&["a"], 10, 2);
        assert_eq!(pool.acquire(2, Duration::ZERO).await.len(), 2);
        assert!(pool.acquire(1, Duration::ZERO).await.is_empty());
        assert_eq!(pool.stats().await.evicted, 1);

        // Force a rollover without waiting for midnight.
        {
            let mut state = pool.state.lock().await;
            let day = state.reset_day;
            state.reset_day = day - 1;
        }
        let keys = pool.acquire(1, Duration::ZERO).await;
        assert_eq!(keys, vec!["a".to_string()]);
        let stats = pool.stats().await;
        assert_eq!(stats.evicted, 0);
        assert_eq!(stats.in_use, 1);
    }
}
