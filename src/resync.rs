//! Resync Engine (§4.9 addition): a token-bucket-paced scan of the
//! out-of-sync bitmap, driven by `WorkItem::ResyncTick`.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

use crate::collaborators::BitmapStore;
use crate::config::SyncConfig;
use crate::state::{Conn, StateMachine};

/// Bytes released per tick, refilled up to `rate_bytes_per_sec` once per
/// second of wall-clock elapsed.
struct TokenBucket {
    rate_bytes_per_sec: u64,
    available: AtomicU64,
    last_refill: std::sync::Mutex<Instant>,
}

impl TokenBucket {
    fn new(rate_bytes_per_sec: u64) -> Self {
        Self {
            rate_bytes_per_sec,
            available: AtomicU64::new(rate_bytes_per_sec),
            last_refill: std::sync::Mutex::new(Instant::now()),
        }
    }

    fn refill(&self, now: Instant) {
        let mut last = self.last_refill.lock().unwrap();
        let elapsed = now.saturating_duration_since(*last);
        if elapsed.as_secs_f64() <= 0.0 {
            return;
        }
        let grant = (self.rate_bytes_per_sec as f64 * elapsed.as_secs_f64()) as u64;
        if grant > 0 {
            let cap = self.rate_bytes_per_sec;
            self.available
                .fetch_update(Ordering::AcqRel, Ordering::Acquire, |v| Some((v + grant).min(cap)))
                .ok();
            *last = now;
        }
    }

    /// Takes up to `want` bytes worth of budget, returning how many bytes
    /// are actually allowed this tick.
    fn take(&self, want: u64) -> u64 {
        let mut allowed = 0;
        let _ = self
            .available
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |v| {
                allowed = v.min(want);
                Some(v - allowed)
            });
        allowed
    }
}

/// Drives background reconciliation of out-of-sync regions while `conn` is
/// `SyncSource`/`SyncTarget`, pausing under `PausedSyncS`/`PausedSyncT` or
/// `sync.skip`, and resuming on each `WorkItem::ResyncTick`.
pub struct ResyncEngine {
    bitmap: Arc<dyn BitmapStore>,
    bucket: TokenBucket,
    al_extents: u32,
    skip: AtomicBool,
    cursor_words: AtomicU64,
}

impl ResyncEngine {
    pub fn new(bitmap: Arc<dyn BitmapStore>, sync: &SyncConfig) -> Self {
        Self {
            bitmap,
            bucket: TokenBucket::new(sync.rate_bytes_per_sec as u64),
            al_extents: sync.al_extents,
            skip: AtomicBool::new(sync.skip),
            cursor_words: AtomicU64::new(0),
        }
    }

    pub fn set_skip(&self, skip: bool) {
        self.skip.store(skip, Ordering::Release);
    }

    /// One `ResyncTick`: scans at most one `al_extents`-sized chunk of the
    /// bitmap starting at the cursor, paced by the token bucket. Returns the
    /// out-of-sync extents it is now allowed to resync this tick.
    pub fn tick(&self, now: Instant) -> Vec<(u64, u32)> {
        if self.skip.load(Ordering::Acquire) {
            return Vec::new();
        }
        self.bucket.refill(now);
        let lel = self.bitmap.get_lel() as u64;
        if lel == 0 {
            return Vec::new();
        }
        let start = self.cursor_words.load(Ordering::Acquire) % lel;
        let chunk = self.bitmap.words(start as u32, self.al_extents as usize);
        let mut extents = Vec::new();
        let mut budget = self.bucket.take((self.al_extents as u64) * 32 * 512);
        for (i, word) in chunk.iter().enumerate() {
            if *word == 0 || budget == 0 {
                continue;
            }
            let sector = (start + i as u64) * 32 * 512;
            let len = 4096u32.min(budget as u32);
            extents.push((sector, len));
            budget = budget.saturating_sub(len as u64);
        }
        self.cursor_words
            .store((start + chunk.len() as u64) % lel.max(1), Ordering::Release);
        let total: u64 = extents.iter().map(|&(_, len)| len as u64).sum();
        if total > 0 {
            crate::metrics::record_resync_bytes(total);
        }
        extents
    }

    /// Called once the bitmap reports fully in-sync: transitions `conn`
    /// away from `SyncSource`/`SyncTarget` via the state machine's `force`.
    pub fn finish_if_in_sync(&self, state: &StateMachine) {
        if self.bitmap.get_lel() == 0 {
            let current = state.read();
            if current.conn.is_resync() {
                state.force(crate::state::DeviceState {
                    conn: Conn::Connected,
                    ..current
                });
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex as StdMutex;

    struct FakeBitmap {
        lel: u32,
        words: StdMutex<Vec<u32>>,
    }

    impl BitmapStore for FakeBitmap {
        fn set_out_of_sync(&self, _sector: u64, _len: u32) {}
        fn test(&self, _sector: u64) -> bool {
            false
        }
        fn words(&self, offset_words: u32, count: usize) -> Vec<u32> {
            let words = self.words.lock().unwrap();
            words
                .iter()
                .cycle()
                .skip(offset_words as usize)
                .take(count)
                .copied()
                .collect()
        }
        fn write(&self, _offset_words: u32, _words: &[u32]) {}
        fn get_lel(&self) -> u32 {
            self.lel
        }
    }

    #[test]
    fn tick_respects_the_token_bucket() {
        let bitmap = Arc::new(FakeBitmap {
            lel: 4,
            words: StdMutex::new(vec![1, 1, 1, 1]),
        });
        let sync = SyncConfig {
            rate_bytes_per_sec: 1,
            al_extents: 4,
            ..Default::default()
        };
        let engine = ResyncEngine::new(bitmap, &sync);
        let extents = engine.tick(Instant::now());
        // a near-zero byte budget should yield no resync work this tick
        assert!(extents.is_empty() || extents.iter().all(|&(_, len)| len <= 1));
    }

    #[test]
    fn skip_suppresses_ticks() {
        let bitmap = Arc::new(FakeBitmap {
            lel: 4,
            words: StdMutex::new(vec![1, 1, 1, 1]),
        });
        let sync = SyncConfig::default();
        let engine = ResyncEngine::new(bitmap, &sync);
        engine.set_skip(true);
        assert!(engine.tick(Instant::now()).is_empty());
    }
}
