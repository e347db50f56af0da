use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// Keyed lock registry serializing all update processing per
/// (bot, end-user) pair. Different pairs proceed fully concurrently;
/// overlapping deliveries for one pair queue on its mutex, preserving
/// the at-most-one-in-flight-step invariant.
pub struct UserLocks {
    inner: Mutex<HashMap<(String, i64), Arc<tokio::sync::Mutex<()>>>>,
}

impl UserLocks {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(HashMap::new()),
        }
    }

    /// Get (or create) the lock for a (bot, user) key.
    pub fn acquire(&self, bot_id: &str, user_id: i64) -> Arc<tokio::sync::Mutex<()>> {
        self.inner
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .entry((bot_id.to_string(), user_id))
            .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(())))
            .clone()
    }

    #[cfg(test)]
    fn len(&self) -> usize {
        self.inner.lock().unwrap().len()
    }
}

impl Default for UserLocks {
    fn default() -> Self {
        Self::new()
    }
}

/// Human-typing pacing between chained steps. Delays are awaited with
/// `tokio::time::sleep`, so a paused conversation never holds a worker.
#[derive(Debug, Clone, Copy)]
pub struct Pacing {
    /// Before sending content, after the typing indicator.
    pub typing: Duration,
    /// Between a content step and its auto-advanced successor.
    pub step: Duration,
    /// Before condition/tag/AB-test/quiz transitions.
    pub branch: Duration,
}

impl Default for Pacing {
    fn default() -> Self {
        Self {
            typing: Duration::from_millis(800),
            step: Duration::from_millis(500),
            branch: Duration::from_millis(200),
        }
    }
}

impl Pacing {
    /// Zero delays, for tests.
    pub const fn off() -> Self {
        Self {
            typing: Duration::ZERO,
            step: Duration::ZERO,
            branch: Duration::ZERO,
        }
    }

    pub async fn pause(duration: Duration) {
        if !duration.is_zero() {
            tokio::time::sleep(duration).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn same_key_returns_same_lock() {
        let locks = UserLocks::new();
        let a = locks.acquire("bot1", 42);
        let b = locks.acquire("bot1", 42);
        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(locks.len(), 1);
    }

    #[test]
    fn distinct_keys_get_distinct_locks() {
        let locks = UserLocks::new();
        let a = locks.acquire("bot1", 42);
        let b = locks.acquire("bot1", 43);
        let c = locks.acquire("bot2", 42);
        assert!(!Arc::ptr_eq(&a, &b));
        assert!(!Arc::ptr_eq(&a, &c));
        assert_eq!(locks.len(), 3);
    }

    #[tokio::test]
    async fn lock_serializes_same_key() {
        let locks = Arc::new(UserLocks::new());
        let counter = Arc::new(Mutex::new(0u32));

        let mut handles = Vec::new();
        for _ in 0..8 {
            let locks = locks.clone();
            let counter = counter.clone();
            handles.push(tokio::spawn(async move {
                let lock = locks.acquire("bot1", 42);
                let _guard = lock.lock().await;
                let mut n = counter.lock().unwrap();
                *n += 1;
            }));
        }
        for h in handles {
            h.await.unwrap();
        }
        assert_eq!(*counter.lock().unwrap(), 8);
    }

    #[tokio::test]
    async fn zero_pause_completes() {
        Pacing::pause(Duration::ZERO).await;
    }

    #[test]
    fn off_pacing_is_all_zero() {
        let p = Pacing::off();
        assert!(p.typing.is_zero());
        assert!(p.step.is_zero());
        assert!(p.branch.is_zero());
    }
}
