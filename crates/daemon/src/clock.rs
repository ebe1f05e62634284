use chrono::{DateTime, Utc};
use std::future::Future;
use std::sync::Mutex;

/// Wall-clock time source used by the scheduler and the mail notary.
///
/// Production code uses [`SystemClock`]; tests substitute [`ManualClock`] so
/// schedules and reply windows can be exercised without waiting.
pub trait Clock: Send + Sync + 'static {
    fn now(&self) -> DateTime<Utc>;

    /// Suspend until `at`. Returns immediately if `at` is not in the future.
    fn sleep_until(&self, at: DateTime<Utc>) -> impl Future<Output = ()> + Send;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }

    async fn sleep_until(&self, at: DateTime<Utc>) {
        // Recomputed from the wall clock on every call, so a suspended
        // process wakes up late but never drifts off the grid.
        if let Ok(remaining) = (at - Utc::now()).to_std() {
            tokio::time::sleep(remaining).await;
        }
    }
}

/// A clock that only moves when told to. Sleeping jumps straight to the
/// requested instant.
#[derive(Debug)]
pub struct ManualClock {
    now: Mutex<DateTime<Utc>>,
}

impl ManualClock {
    pub fn new(start: DateTime<Utc>) -> Self {
        Self {
            now: Mutex::new(start),
        }
    }

    pub fn set(&self, at: DateTime<Utc>) {
        *self.lock() = at;
    }

    pub fn advance(&self, by: chrono::Duration) {
        let mut now = self.lock();
        *now += by;
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, DateTime<Utc>> {
        // A poisoned clock still holds a valid instant.
        self.now.lock().unwrap_or_else(|e| e.into_inner())
    }
}

impl Clock for ManualClock {
    fn now(&self) -> DateTime<Utc> {
        *self.lock()
    }

    async fn sleep_until(&self, at: DateTime<Utc>) {
        {
            let mut now = self.lock();
            if at > *now {
                *now = at;
            }
        }
        tokio::task::yield_now().await;
    }
}
