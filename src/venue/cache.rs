// =============================================================================
// Short-TTL read cache for Venue balance/position reads
// =============================================================================
//
// Grounded on the rate-limit/backoff bookkeeping style used elsewhere in this
// codebase's lineage for "don't hammer the exchange" concerns, but trimmed to
// a single cached value with a TTL, read and written under a plain mutex
// since no caller ever holds it across an `.await`.

use std::time::{Duration, Instant};

use parking_lot::Mutex;

pub struct TtlCache<T: Clone> {
    ttl: Duration,
    inner: Mutex<Option<(Instant, T)>>,
}

impl<T: Clone> TtlCache<T> {
    pub fn new(ttl: Duration) -> Self {
        Self {
            ttl,
            inner: Mutex::new(None),
        }
    }

    /// Returns a cached value if it is still within its TTL.
    pub fn get(&self) -> Option<T> {
        let guard = self.inner.lock();
        match guard.as_ref() {
            Some((at, value)) if at.elapsed() < self.ttl => Some(value.clone()),
            _ => None,
        }
    }

    pub fn set(&self, value: T) {
        *self.inner.lock() = Some((Instant::now(), value));
    }

    pub fn invalidate(&self) {
        *self.inner.lock() = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_cache_returns_none() {
        let cache: TtlCache<u32> = TtlCache::new(Duration::from_secs(15));
        assert!(cache.get().is_none());
    }

    #[test]
    fn fresh_value_is_returned() {
        let cache = TtlCache::new(Duration::from_secs(15));
        cache.set(42u32);
        assert_eq!(cache.get(), Some(42));
    }

    #[test]
    fn expired_value_is_not_returned() {
        let cache = TtlCache::new(Duration::from_millis(1));
        cache.set(42u32);
        std::thread::sleep(Duration::from_millis(5));
        assert!(cache.get().is_none());
    }

    #[test]
    fn invalidate_clears_cache() {
        let cache = TtlCache::new(Duration::from_secs(15));
        cache.set(1u32);
        cache.invalidate();
        assert!(cache.get().is_none());
    }
}
