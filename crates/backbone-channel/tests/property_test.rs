//! Property-based tests for acknowledgment and backoff invariants.

use std::{collections::HashMap, sync::Arc, time::Duration};

use backbone_channel::{
    store::memory::MemoryStreamStore, Ack, AckState, BackoffSettings,
    EmptyBatchBackoff, StreamStore,
};
use backbone_core::{AckBehavior, StreamKey};
use proptest::{prelude::*, test_runner::Config as ProptestConfig};
use tokio_util::sync::CancellationToken;

/// Deterministic property test configuration for CI stability.
fn proptest_config() -> ProptestConfig {
    ProptestConfig {
        cases: 64,
        failure_persistence: None,
        source_file: None,
        ..ProptestConfig::default()
    }
}

#[derive(Debug, Clone, Copy)]
enum Transition {
    Commit,
    Cancel,
}

fn transition_strategy() -> impl Strategy<Value = Transition> {
    prop_oneof![Just(Transition::Commit), Just(Transition::Cancel)]
}

fn behavior_strategy() -> impl Strategy<Value = AckBehavior> {
    prop_oneof![Just(AckBehavior::OnSucceed), Just(AckBehavior::OnFinally)]
}

/// Applies `transitions` to a fresh ack and returns the number of store
/// acknowledgments and the final state.
async fn run_transitions(behavior: AckBehavior, transitions: &[Transition]) -> (usize, AckState, bool) {
    let store = MemoryStreamStore::new();
    let key = StreamKey::new("orders", "1");
    store.append(&key, HashMap::from([("MessageId".to_string(), "m-1".to_string())])).await;
    store.create_group_if_absent(&key, "billing").await.unwrap();
    let entry = store.read_new(&key, "billing", "c-1", 1).await.unwrap().remove(0);

    let batch = CancellationToken::new();
    let ack = Ack::new(Arc::new(store.clone()), key, "billing", entry.id, behavior, batch.clone());

    for transition in transitions {
        match transition {
            Transition::Commit => {
                ack.ack().await.unwrap();
            },
            Transition::Cancel => {
                ack.cancel().unwrap();
            },
        }
    }

    (store.acknowledged().await.len(), ack.state(), batch.is_cancelled())
}

fn runtime() -> tokio::runtime::Runtime {
    tokio::runtime::Builder::new_current_thread().enable_all().build().unwrap()
}

proptest! {
    #![proptest_config(proptest_config())]

    #[test]
    fn first_transition_wins(
        behavior in behavior_strategy(),
        transitions in prop::collection::vec(transition_strategy(), 1..8),
    ) {
        let (acknowledged, state, batch_cancelled) =
            runtime().block_on(run_transitions(behavior, &transitions));

        let committed_first = matches!(transitions[0], Transition::Commit);
        prop_assert!(acknowledged <= 1);
        prop_assert_eq!(acknowledged == 1, committed_first);
        prop_assert_eq!(state, if committed_first { AckState::Acked } else { AckState::Cancelled });
        prop_assert_eq!(batch_cancelled, !committed_first);
    }

    #[test]
    fn backoff_stays_within_bounds_and_resets(
        min_ms in 1u64..50,
        spread in 1u64..200,
        polls in 1usize..40,
    ) {
        let settings = BackoffSettings {
            min_delay: Duration::from_millis(min_ms),
            max_delay: Duration::from_millis(min_ms * spread),
        };
        let mut backoff = EmptyBatchBackoff::new(settings);

        let mut previous = Duration::ZERO;
        for _ in 0..polls {
            let delay = backoff.next_delay();
            prop_assert!(delay >= settings.min_delay);
            prop_assert!(delay <= settings.max_delay);
            prop_assert!(delay >= previous);
            previous = delay;
        }

        backoff.reset();
        prop_assert_eq!(backoff.next_delay(), settings.min_delay);
    }
}
