//! Property-Based Tests for the Counter Buffer
//!
//! # Test Properties
//!
//! 1. **Conservation**: after a final successful flush, every entity's
//!    durable total equals the sum of its increments, whatever the
//!    interleaving of flushes and durable-store failures.
//! 2. **No double count**: a flush never applies more than was buffered.

#![cfg(test)]

use std::collections::HashMap;
use std::sync::Arc;

use proptest::prelude::*;

use super::buffer::CounterBuffer;
use crate::adapters::{InMemoryDurableStore, InMemoryKeyValueStore};
use crate::clock::ManualClock;

const ENTITIES: [&str; 3] = ["listing-a", "listing-b", "listing-c"];

#[derive(Debug, Clone)]
enum Op {
    Increment { entity: usize, amount: i64 },
    Flush,
    Fail { entity: usize },
    Recover { entity: usize },
}

// =============================================================================
// Property Strategies
// =============================================================================

fn op_strategy() -> impl Strategy<Value = Op> {
    prop_oneof![
        6 => (0..ENTITIES.len(), 1i64..=5).prop_map(|(entity, amount)| Op::Increment { entity, amount }),
        2 => Just(Op::Flush),
        1 => (0..ENTITIES.len()).prop_map(|entity| Op::Fail { entity }),
        1 => (0..ENTITIES.len()).prop_map(|entity| Op::Recover { entity }),
    ]
}

// =============================================================================
// Conservation Properties
// =============================================================================

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    /// Property: total durable delta equals total increments once every
    /// entity has recovered and a final flush ran.
    #[test]
    fn prop_increments_are_conserved(ops in prop::collection::vec(op_strategy(), 1..80)) {
        let (expected, durable) = tokio_test::block_on(async {
            let clock = ManualClock::starting_now();
            let store = Arc::new(InMemoryKeyValueStore::new(clock.clone()));
            let durable = Arc::new(InMemoryDurableStore::new());
            let buffer = CounterBuffer::new("views", "prop", store, durable.clone(), clock);

            let mut expected: HashMap<&str, i64> = HashMap::new();
            for op in &ops {
                match op {
                    Op::Increment { entity, amount } => {
                        buffer.increment(ENTITIES[*entity], *amount).await;
                        *expected.entry(ENTITIES[*entity]).or_default() += amount;
                    }
                    Op::Flush => {
                        buffer.flush().await.unwrap();
                    }
                    Op::Fail { entity } => durable.fail_for(ENTITIES[*entity]),
                    Op::Recover { entity } => durable.recover(ENTITIES[*entity]),
                }
            }

            for entity in ENTITIES {
                durable.recover(entity);
            }
            buffer.flush().await.unwrap();
            for entity in ENTITIES {
                assert_eq!(buffer.pending(entity).await.unwrap(), 0);
            }
            (expected, durable)
        });

        for entity in ENTITIES {
            prop_assert_eq!(durable.counter(entity), expected.get(entity).copied().unwrap_or(0));
        }
    }

    /// Property: at every point, durable + pending equals increments so far.
    #[test]
    fn prop_durable_plus_pending_is_true_count(
        amounts in prop::collection::vec(1i64..=10, 1..40),
        flush_every in 1usize..6,
    ) {
        tokio_test::block_on(async {
            let clock = ManualClock::starting_now();
            let store = Arc::new(InMemoryKeyValueStore::new(clock.clone()));
            let durable = Arc::new(InMemoryDurableStore::new());
            let buffer = CounterBuffer::new("views", "prop", store, durable.clone(), clock);

            let mut total = 0;
            for (i, amount) in amounts.iter().enumerate() {
                buffer.increment("listing", *amount).await;
                total += amount;
                if i % flush_every == 0 {
                    buffer.flush().await.unwrap();
                }
                let observed = buffer.current_count("listing", durable.counter("listing")).await;
                assert_eq!(observed, total);
            }
        });
    }
}
