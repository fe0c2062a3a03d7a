//! Process-wide registry of detached subscriptions.
//!
//! A [`crate::SubscriptionHandle`] cancels its subscription when dropped.
//! Detaching it registers the subscription here instead, where it stays
//! until it completes or is released.

use std::{
    collections::HashMap,
    sync::{LazyLock, Mutex, MutexGuard},
};

use tokio_util::sync::CancellationToken;
use tracing::debug;

static REGISTRY: LazyLock<Mutex<HashMap<u64, CancellationToken>>> =
    LazyLock::new(|| Mutex::new(HashMap::new()));

fn registry() -> MutexGuard<'static, HashMap<u64, CancellationToken>> {
    REGISTRY.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Keeps subscription `id` alive until it completes or is released.
pub fn register(id: u64, cancellation: CancellationToken) {
    registry().insert(id, cancellation);
    debug!(subscription_id = id, "subscription detached");
}

/// Cancels and forgets a detached subscription; false when unknown.
pub fn release(id: u64) -> bool {
    match registry().remove(&id) {
        Some(cancellation) => {
            cancellation.cancel();
            debug!(subscription_id = id, "detached subscription released");
            true
        },
        None => false,
    }
}

/// Returns true while subscription `id` is registered.
pub fn contains(id: u64) -> bool {
    registry().contains_key(&id)
}

/// Number of registered subscriptions.
pub fn len() -> usize {
    registry().len()
}

/// Returns true when nothing is registered.
pub fn is_empty() -> bool {
    registry().is_empty()
}

/// Cancels every registered subscription and clears the registry.
pub fn release_all() -> usize {
    let drained: Vec<CancellationToken> = registry().drain().map(|(_, token)| token).collect();
    for cancellation in &drained {
        cancellation.cancel();
    }
    drained.len()
}

/// Forgets a completed subscription without cancelling anything.
pub(crate) fn forget(id: u64) {
    registry().remove(&id);
}

#[cfg(test)]
mod tests {
    use super::*;

    // Ids far from the subscription counter so parallel tests never collide
    const BASE: u64 = u64::MAX - 1_000;

    #[test]
    fn register_and_release() {
        let token = CancellationToken::new();
        register(BASE + 1, token.clone());

        assert!(contains(BASE + 1));
        assert!(release(BASE + 1));
        assert!(token.is_cancelled());
        assert!(!contains(BASE + 1));
        assert!(!release(BASE + 1));
    }

    #[test]
    fn forget_does_not_cancel() {
        let token = CancellationToken::new();
        register(BASE + 2, token.clone());

        forget(BASE + 2);

        assert!(!contains(BASE + 2));
        assert!(!token.is_cancelled());
    }

    #[test]
    fn concurrent_registration() {
        let threads: Vec<_> = (0..8)
            .map(|offset| {
                std::thread::spawn(move || {
                    let id = BASE + 100 + offset;
                    register(id, CancellationToken::new());
                    assert!(contains(id));
                    forget(id);
                })
            })
            .collect();

        for thread in threads {
            thread.join().unwrap();
        }

        for offset in 0..8 {
            assert!(!contains(BASE + 100 + offset));
        }
    }
}
