//! # FedLink Runtime
//!
//! Async runtime abstractions for FedLink.
//!
//! This crate provides a unified interface for the clock, sleeping and task
//! spawning used by pipes and the control loop:
//! - **Tokio**: for real deployments (std)
//! - **Mock**: a deterministic clock for tests, advanced by `sleep`
//!
//! ## Feature Flags
//!
//! - `tokio` (default): Use Tokio runtime

#![cfg_attr(not(feature = "std"), no_std)]

use core::future::Future;
use core::time::Duration;

/// Runtime trait for async operations
pub trait FedRuntime: Send + Sync + 'static {
    /// Milliseconds on a monotonic-enough clock
    fn now_ms(&self) -> u64;

    /// Sleep for the specified duration
    fn sleep(&self, duration: Duration) -> impl Future<Output = ()> + Send;

    /// Spawn a task (if supported by the runtime)
    fn spawn<F>(&self, future: F)
    where
        F: Future<Output = ()> + Send + 'static;
}

/// A point in time after which a wait gives up.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Deadline {
    at_ms: u64,
}

impl Deadline {
    /// Deadline `timeout` after `now_ms`
    pub fn after(now_ms: u64, timeout: Duration) -> Self {
        Self {
            at_ms: now_ms.saturating_add(timeout.as_millis() as u64),
        }
    }

    /// Deadline `timeout` from the runtime's current time
    pub fn from_now<R: FedRuntime + ?Sized>(runtime: &R, timeout: Duration) -> Self {
        Self::after(runtime.now_ms(), timeout)
    }

    pub fn expired(&self, now_ms: u64) -> bool {
        now_ms > self.at_ms
    }

    pub fn remaining(&self, now_ms: u64) -> Duration {
        Duration::from_millis(self.at_ms.saturating_sub(now_ms))
    }
}

#[cfg(feature = "tokio")]
pub mod tokio_runtime {
    //! Tokio-based runtime implementation

    use super::*;

    /// Tokio runtime wrapper
    #[derive(Debug, Clone, Default)]
    pub struct TokioRuntime;

    impl TokioRuntime {
        /// Create a new Tokio runtime wrapper
        pub fn new() -> Self {
            Self
        }
    }

    impl FedRuntime for TokioRuntime {
        fn now_ms(&self) -> u64 {
            use std::time::{SystemTime, UNIX_EPOCH};
            SystemTime::now()
                .duration_since(UNIX_EPOCH)
                .unwrap_or_default()
                .as_millis() as u64
        }

        async fn sleep(&self, duration: Duration) {
            tokio::time::sleep(duration).await;
        }

        fn spawn<F>(&self, future: F)
        where
            F: Future<Output = ()> + Send + 'static,
        {
            tokio::spawn(future);
        }
    }
}

/// Mock runtime for testing
pub mod mock_runtime {
    use super::*;
    use core::sync::atomic::{AtomicU64, Ordering};

    /// Deterministic runtime: `sleep` advances the clock instead of waiting.
    ///
    /// `spawn` is only available with the `tokio` feature; without it the
    /// future is dropped.
    #[derive(Debug, Default)]
    pub struct MockRuntime {
        current_time_ms: AtomicU64,
        slept_ms: AtomicU64,
    }

    impl MockRuntime {
        /// Create a new mock runtime
        pub fn new() -> Self {
            Self::default()
        }

        /// Advance the mock clock
        pub fn advance(&self, duration: Duration) {
            self.current_time_ms
                .fetch_add(duration.as_millis() as u64, Ordering::SeqCst);
        }

        /// Total time spent in `sleep`
        pub fn slept(&self) -> Duration {
            Duration::from_millis(self.slept_ms.load(Ordering::SeqCst))
        }
    }

    impl FedRuntime for MockRuntime {
        fn now_ms(&self) -> u64 {
            self.current_time_ms.load(Ordering::SeqCst)
        }

        async fn sleep(&self, duration: Duration) {
            self.slept_ms
                .fetch_add(duration.as_millis() as u64, Ordering::SeqCst);
            self.advance(duration);
            #[cfg(feature = "tokio")]
            tokio::task::yield_now().await;
        }

        fn spawn<F>(&self, future: F)
        where
            F: Future<Output = ()> + Send + 'static,
        {
            #[cfg(feature = "tokio")]
            tokio::spawn(future);
            #[cfg(not(feature = "tokio"))]
            drop(future);
        }
    }
}

/// Get the default runtime based on features
#[cfg(feature = "tokio")]
pub fn default_runtime() -> tokio_runtime::TokioRuntime {
    tokio_runtime::TokioRuntime::new()
}

#[cfg(test)]
mod tests {
    use super::mock_runtime::MockRuntime;
    use super::*;

    #[test]
    fn deadline_expires_strictly_after() {
        let d = Deadline::after(1_000, Duration::from_millis(500));
        assert!(!d.expired(1_500));
        assert!(d.expired(1_501));
        assert_eq!(d.remaining(1_200), Duration::from_millis(300));
        assert_eq!(d.remaining(9_999), Duration::ZERO);
    }

    #[tokio::test]
    async fn mock_sleep_advances_clock() {
        let rt = MockRuntime::new();
        rt.sleep(Duration::from_secs(5)).await;
        rt.advance(Duration::from_millis(250));
        assert_eq!(rt.now_ms(), 5_250);
        assert_eq!(rt.slept(), Duration::from_secs(5));
        assert!(Deadline::from_now(&rt, Duration::from_secs(1)).expired(6_251));
    }

    #[tokio::test]
    async fn tokio_runtime_spawns() {
        let rt = default_runtime();
        let (tx, rx) = tokio::sync::oneshot::channel();
        rt.spawn(async move {
            let _ = tx.send(7u8);
        });
        assert_eq!(rx.await.unwrap(), 7);
        assert!(rt.now_ms() > 0);
    }
}
