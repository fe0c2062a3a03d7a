//! Health-checked, debounced connection handle management.
//!
//! Every store call goes through [`ConnectionManager::acquire`]. A healthy
//! cached handle is returned without locking. When the handle is broken the
//! first caller reconnects inside a mutual-exclusion section; callers that
//! arrive during the cool-down after a reset receive the stale handle
//! instead of stampeding the store with new connections. Replaced handles
//! are closed after a grace period so in-flight commands can drain.

use std::{
    future::Future,
    pin::Pin,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc, RwLock,
    },
    time::{Duration, Instant},
};

use backbone_core::Clock;
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::error::{ChannelError, Result};

/// Factory and health probe for store connection handles.
pub trait Connector: Send + Sync + 'static {
    /// Cheaply cloneable handle shared by all shards.
    type Handle: Clone + Send + Sync + 'static;

    /// Opens a new connection.
    fn connect(&self) -> Pin<Box<dyn Future<Output = Result<Self::Handle>> + Send + '_>>;

    /// Reports whether a handle is still usable without a round-trip.
    fn is_healthy(&self, handle: &Self::Handle) -> bool;

    /// Releases a replaced handle.
    fn close(&self, handle: Self::Handle) -> Pin<Box<dyn Future<Output = ()> + Send + '_>>;
}

/// Timing parameters for reconnects.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnectionSettings {
    /// Upper bound on waiting for another caller's reconnect.
    pub lock_timeout: Duration,
    /// Minimum time between two connection resets.
    pub cool_down: Duration,
    /// Delay before a replaced handle is closed.
    pub close_grace: Duration,
}

impl Default for ConnectionSettings {
    fn default() -> Self {
        Self {
            lock_timeout: Duration::from_secs(10),
            cool_down: Duration::from_secs(5),
            close_grace: Duration::from_secs(5),
        }
    }
}

/// Owns the shared store handle and replaces it when it breaks.
pub struct ConnectionManager<C: Connector> {
    connector: Arc<C>,
    settings: ConnectionSettings,
    current: RwLock<Option<C::Handle>>,
    reconnect_lock: Mutex<Option<Instant>>,
    reconnects: AtomicU64,
    clock: Arc<dyn Clock>,
}

impl<C: Connector> std::fmt::Debug for ConnectionManager<C> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionManager")
            .field("settings", &self.settings)
            .field("reconnects", &self.reconnect_count())
            .finish_non_exhaustive()
    }
}

impl<C: Connector> ConnectionManager<C> {
    /// Creates a manager; the first `acquire` opens the connection.
    pub fn new(connector: C, settings: ConnectionSettings, clock: Arc<dyn Clock>) -> Self {
        Self {
            connector: Arc::new(connector),
            settings,
            current: RwLock::new(None),
            reconnect_lock: Mutex::new(None),
            reconnects: AtomicU64::new(0),
            clock,
        }
    }

    /// Returns a usable handle, reconnecting when the cached one is broken.
    ///
    /// Inside the cool-down window after a reset the stale handle is
    /// returned as is.
    ///
    /// # Errors
    ///
    /// Returns `Timeout` when another caller's reconnect holds the section
    /// longer than `lock_timeout`, or the connector's error when opening a
    /// new connection fails.
    pub async fn acquire(&self) -> Result<C::Handle> {
        if let Some(handle) = self.healthy_handle() {
            return Ok(handle);
        }

        let mut last_reset =
            tokio::time::timeout(self.settings.lock_timeout, self.reconnect_lock.lock())
                .await
                .map_err(|_| ChannelError::timeout("connection reset", self.settings.lock_timeout))?;

        // Another caller may have reconnected while we waited
        if let Some(handle) = self.healthy_handle() {
            return Ok(handle);
        }

        let stale = self.cached();
        let now = self.clock.now();
        if let (Some(handle), Some(reset_at)) = (&stale, *last_reset) {
            if now.saturating_duration_since(reset_at) < self.settings.cool_down {
                debug!("connection unhealthy within cool-down, reusing stale handle");
                return Ok(handle.clone());
            }
        }

        if stale.is_some() {
            let attempt = self.reconnects.fetch_add(1, Ordering::AcqRel) + 1;
            info!(attempt, "reconnecting to stream store");
        }

        let fresh = self.connector.connect().await.inspect_err(|error| {
            warn!(error = %error, "stream store connection failed");
        })?;
        *last_reset = Some(now);
        *self.current.write().unwrap_or_else(|poisoned| poisoned.into_inner()) = Some(fresh.clone());
        drop(last_reset);

        if let Some(old) = stale {
            self.close_later(old);
        }

        Ok(fresh)
    }

    /// Number of times a broken handle was replaced.
    pub fn reconnect_count(&self) -> u64 {
        self.reconnects.load(Ordering::Acquire)
    }

    fn cached(&self) -> Option<C::Handle> {
        self.current.read().unwrap_or_else(|poisoned| poisoned.into_inner()).clone()
    }

    fn healthy_handle(&self) -> Option<C::Handle> {
        self.cached().filter(|handle| self.connector.is_healthy(handle))
    }

    fn close_later(&self, handle: C::Handle) {
        let connector = Arc::clone(&self.connector);
        let clock = Arc::clone(&self.clock);
        let grace = self.settings.close_grace;
        tokio::spawn(async move {
            clock.sleep(grace).await;
            connector.close(handle).await;
            debug!("closed replaced stream store connection");
        });
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicBool, AtomicUsize};

    use backbone_core::TestClock;

    use super::*;

    #[derive(Clone, Debug)]
    struct FakeHandle {
        serial: usize,
        healthy: Arc<AtomicBool>,
    }

    #[derive(Default)]
    struct FakeConnector {
        connects: AtomicUsize,
        closes: Arc<AtomicUsize>,
        fail: AtomicBool,
    }

    impl Connector for FakeConnector {
        type Handle = FakeHandle;

        fn connect(&self) -> Pin<Box<dyn Future<Output = Result<FakeHandle>> + Send + '_>> {
            Box::pin(async move {
                tokio::task::yield_now().await;
                if self.fail.load(Ordering::Acquire) {
                    return Err(ChannelError::connection("connection refused"));
                }
                let serial = self.connects.fetch_add(1, Ordering::AcqRel) + 1;
                Ok(FakeHandle { serial, healthy: Arc::new(AtomicBool::new(true)) })
            })
        }

        fn is_healthy(&self, handle: &FakeHandle) -> bool {
            handle.healthy.load(Ordering::Acquire)
        }

        fn close(&self, _handle: FakeHandle) -> Pin<Box<dyn Future<Output = ()> + Send + '_>> {
            self.closes.fetch_add(1, Ordering::AcqRel);
            Box::pin(async {})
        }
    }

    fn manager(clock: &TestClock) -> ConnectionManager<FakeConnector> {
        ConnectionManager::new(
            FakeConnector::default(),
            ConnectionSettings::default(),
            Arc::new(clock.clone()),
        )
    }

    #[tokio::test]
    async fn healthy_handle_is_reused() {
        let clock = TestClock::new();
        let manager = manager(&clock);

        let first = manager.acquire().await.unwrap();
        let second = manager.acquire().await.unwrap();

        assert_eq!(first.serial, second.serial);
        assert_eq!(manager.connector.connects.load(Ordering::Acquire), 1);
        assert_eq!(manager.reconnect_count(), 0);
    }

    #[tokio::test]
    async fn concurrent_unhealthy_acquires_reconnect_once() {
        let clock = TestClock::new();
        let manager = manager(&clock);
        let initial = manager.acquire().await.unwrap();

        clock.advance(Duration::from_secs(6));
        initial.healthy.store(false, Ordering::Release);

        let (left, right) = tokio::join!(manager.acquire(), manager.acquire());

        assert_eq!(left.unwrap().serial, 2);
        assert_eq!(right.unwrap().serial, 2);
        assert_eq!(manager.reconnect_count(), 1);
        assert_eq!(manager.connector.connects.load(Ordering::Acquire), 2);
    }

    #[tokio::test]
    async fn stale_handle_returned_inside_cool_down() {
        let clock = TestClock::new();
        let manager = manager(&clock);
        let initial = manager.acquire().await.unwrap();

        clock.advance(Duration::from_secs(1));
        initial.healthy.store(false, Ordering::Release);

        let handle = manager.acquire().await.unwrap();

        assert_eq!(handle.serial, initial.serial);
        assert_eq!(manager.reconnect_count(), 0);
    }

    #[tokio::test]
    async fn connect_failure_propagates() {
        let clock = TestClock::new();
        let manager = manager(&clock);
        manager.connector.fail.store(true, Ordering::Release);

        let error = manager.acquire().await.unwrap_err();

        assert!(matches!(error, ChannelError::Connection { .. }));
    }

    #[tokio::test]
    async fn replaced_handle_is_closed_after_grace() {
        let clock = TestClock::new();
        let manager = manager(&clock);
        let initial = manager.acquire().await.unwrap();
        clock.advance(Duration::from_secs(6));
        initial.healthy.store(false, Ordering::Release);

        manager.acquire().await.unwrap();
        let closes = Arc::clone(&manager.connector.closes);
        for _ in 0..10 {
            if closes.load(Ordering::Acquire) == 1 {
                break;
            }
            tokio::task::yield_now().await;
        }

        assert_eq!(closes.load(Ordering::Acquire), 1);
        assert!(clock.recorded_sleeps().contains(&Duration::from_secs(5)));
    }
}
