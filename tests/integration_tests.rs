//! MarketCache Integration Tests
//!
//! End-to-end flows through the [`Coordinator`] facade:
//! - Read path: get-or-compute, batching, compression, degraded store
//! - Write-behind view counters driven by the scheduler
//! - Offer expiration with concurrent reapers and completions
//! - Ephemeral state and live event fan-out

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use marketcache::adapters::{
    BroadcastEventPublisher, InMemoryDurableStore, InMemoryEventCollector, InMemoryKeyValueStore,
    TimeoutStore,
};
use marketcache::domain::{ItemStatus, PresenceState, StatusTransition};
use marketcache::{Clock, CoordinationConfig, CoordinationEvent, Coordinator, ManualClock};

struct Harness {
    coordinator: Arc<Coordinator>,
    store: Arc<InMemoryKeyValueStore>,
    durable: Arc<InMemoryDurableStore>,
    events: Arc<InMemoryEventCollector>,
    clock: Arc<ManualClock>,
}

fn harness_with(config: CoordinationConfig) -> Harness {
    let clock = ManualClock::starting_now();
    let store = Arc::new(InMemoryKeyValueStore::new(clock.clone()));
    let durable = Arc::new(InMemoryDurableStore::new());
    let events = Arc::new(InMemoryEventCollector::new());
    let coordinator = Coordinator::new(
        config,
        Arc::new(TimeoutStore::new(store.clone(), Duration::from_millis(100))),
        durable.clone(),
        events.clone(),
        clock.clone(),
    )
    .unwrap();
    Harness {
        coordinator: Arc::new(coordinator),
        store,
        durable,
        events,
        clock,
    }
}

fn harness() -> Harness {
    harness_with(CoordinationConfig::default())
}

fn ids(raw: &[&str]) -> Vec<String> {
    raw.iter().map(|s| s.to_string()).collect()
}

// =============================================================================
// Read Path
// =============================================================================

mod read_path_tests {
    use super::*;

    #[tokio::test]
    async fn test_get_or_compute_caches_until_invalidated() {
        let h = harness();
        let calls = AtomicUsize::new(0);
        let calls_ref = &calls;
        let compute = move || async move {
            calls_ref.fetch_add(1, Ordering::SeqCst);
            Ok::<_, String>(vec![1u32, 2, 3])
        };

        let first = h
            .coordinator
            .get_or_compute("listing:1", None, compute)
            .await
            .unwrap();
        let second = h
            .coordinator
            .get_or_compute("listing:1", None, compute)
            .await
            .unwrap();
        assert_eq!(first, second);
        assert_eq!(calls.load(Ordering::SeqCst), 1);

        h.coordinator.cache().invalidate("listing:1").await.unwrap();
        h.coordinator
            .get_or_compute("listing:1", None, compute)
            .await
            .unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_batch_calls_source_once_for_misses() {
        let h = harness();
        h.coordinator
            .cache()
            .set("listing:2", &"cached-2".to_string(), None)
            .await
            .unwrap();

        let requested = parking_lot::Mutex::new(Vec::new());
        let result = h
            .coordinator
            .get_many("listing", &ids(&["1", "2", "3"]), |missing| {
                requested.lock().push(missing.clone());
                async move {
                    Ok::<_, String>(
                        missing
                            .into_iter()
                            .map(|id| {
                                let value = format!("source-{}", id);
                                (id, value)
                            })
                            .collect::<HashMap<_, _>>(),
                    )
                }
            })
            .await
            .unwrap();

        assert_eq!(*requested.lock(), vec![ids(&["1", "3"])]);
        assert_eq!(
            result,
            vec![
                ("1".to_string(), "source-1".to_string()),
                ("2".to_string(), "cached-2".to_string()),
                ("3".to_string(), "source-3".to_string()),
            ]
        );

        // backfilled: a second call needs no source
        let again = h
            .coordinator
            .get_many("listing", &ids(&["1", "3"]), |_| async {
                Err::<HashMap<String, String>, _>("source must not be called".to_string())
            })
            .await
            .unwrap();
        assert_eq!(again.len(), 2);
    }

    #[tokio::test]
    async fn test_compression_roundtrip_around_threshold() {
        let h = harness();
        let threshold = h.coordinator.config().cache.compression_threshold;

        for len in [threshold - 3, threshold - 2, threshold - 1, threshold * 20] {
            let payload: String = "ab".repeat(len / 2 + 1).chars().take(len).collect();
            let key = format!("blob:{}", len);
            let computed = payload.clone();
            let stored = h
                .coordinator
                .get_or_compute(&key, None, move || async move { Ok::<_, String>(computed) })
                .await
                .unwrap();
            assert_eq!(stored, payload);

            let read: String = h.coordinator.cache().get(&key).await.unwrap();
            assert_eq!(read, payload);
        }

        assert!(h.coordinator.cache_metrics().compressed_writes >= 1);
    }

    #[tokio::test]
    async fn test_store_outage_bypasses_cache() {
        let h = harness();
        h.store.set_available(false);

        let value = h
            .coordinator
            .get_or_compute("k", None, || async { Ok::<_, String>(42u64) })
            .await
            .unwrap();
        assert_eq!(value, 42);
        assert!(h.coordinator.cache_metrics().bypasses >= 1);
    }

    #[tokio::test]
    async fn test_slow_store_is_bounded_by_timeout() {
        let h = harness();
        h.store.set_latency(Some(Duration::from_secs(5)));

        let started = std::time::Instant::now();
        let value = h
            .coordinator
            .get_or_compute("k", None, || async { Ok::<_, String>("fallback".to_string()) })
            .await
            .unwrap();
        assert_eq!(value, "fallback");
        assert!(started.elapsed() < Duration::from_secs(2));
    }
}

// =============================================================================
// Write-Behind Counters
// =============================================================================

mod counter_tests {
    use super::*;
    use marketcache::coordinator::VIEW_FLUSH_JOB;

    #[tokio::test]
    async fn test_interleaved_flushes_apply_every_increment_once() {
        let h = harness();
        let scheduler = h.coordinator.scheduler();

        for _ in 0..7 {
            h.coordinator.increment_view("listing-1").await;
        }
        scheduler.run_now(VIEW_FLUSH_JOB).await.unwrap();
        for _ in 0..3 {
            h.coordinator.increment_view("listing-1").await;
        }
        scheduler.run_now(VIEW_FLUSH_JOB).await.unwrap();
        scheduler.run_now(VIEW_FLUSH_JOB).await.unwrap();

        assert_eq!(h.durable.counter("listing-1"), 10);
        assert_eq!(h.durable.counter_writes(), 2);
    }

    #[tokio::test]
    async fn test_failing_entity_does_not_block_others() {
        let h = harness();
        h.durable.fail_for("bad");
        for id in ["good", "bad", "good"] {
            h.coordinator.increment_view(id).await;
        }

        let scheduler = h.coordinator.scheduler();
        scheduler.run_now(VIEW_FLUSH_JOB).await.unwrap();
        assert_eq!(h.durable.counter("good"), 2);
        assert_eq!(h.durable.counter("bad"), 0);
        assert_eq!(h.coordinator.view_count("bad", 0).await, 1);

        h.durable.recover("bad");
        scheduler.run_now(VIEW_FLUSH_JOB).await.unwrap();
        assert_eq!(h.durable.counter("bad"), 1);

        let flushed = h.events.events_of_type("CountersFlushed");
        assert_eq!(flushed.len(), 2);
    }

    #[tokio::test]
    async fn test_concurrent_increments_during_scheduled_flushes() {
        let mut config = CoordinationConfig::default();
        config.counters.flush_interval = Duration::from_millis(5);
        let h = harness_with(config);
        h.coordinator.start();

        let tasks: Vec<_> = (0..4)
            .map(|_| {
                let coordinator = h.coordinator.clone();
                tokio::spawn(async move {
                    for _ in 0..50 {
                        coordinator.increment_view("hot").await;
                        tokio::task::yield_now().await;
                    }
                })
            })
            .collect();
        for task in tasks {
            task.await.unwrap();
        }

        h.coordinator.shutdown().await;
        assert_eq!(h.durable.counter("hot"), 200);
    }
}

// =============================================================================
// Expiration
// =============================================================================

mod expiration_tests {
    use super::*;
    use marketcache::coordinator::OFFER_REAP_JOB;
    use marketcache::expiration::ExpirationTracker;

    #[tokio::test]
    async fn test_offer_expires_exactly_once() {
        let h = harness();
        let now = h.clock.now();
        h.durable.insert_item("offer-1", ItemStatus::Active);
        h.coordinator
            .track_expiration("offer-1", now + chrono::Duration::seconds(2))
            .await
            .unwrap();

        let scheduler = h.coordinator.scheduler();
        scheduler.run_now(OFFER_REAP_JOB).await.unwrap();
        assert_eq!(h.durable.status("offer-1"), Some(ItemStatus::Active));

        h.clock.advance(Duration::from_secs(3));
        scheduler.run_now(OFFER_REAP_JOB).await.unwrap();
        scheduler.run_now(OFFER_REAP_JOB).await.unwrap();

        assert_eq!(h.durable.status("offer-1"), Some(ItemStatus::Expired));
        assert_eq!(h.durable.status_writes(), 1);
        assert_eq!(h.events.events_of_type("ItemExpired").len(), 1);
    }

    #[tokio::test]
    async fn test_extension_postpones_expiry() {
        let h = harness();
        let now = h.clock.now();
        h.durable.insert_item("offer-2", ItemStatus::Active);
        h.coordinator
            .track_expiration("offer-2", now + chrono::Duration::seconds(2))
            .await
            .unwrap();
        assert!(h
            .coordinator
            .extend_expiration("offer-2", now + chrono::Duration::seconds(60))
            .await
            .unwrap());

        h.clock.advance(Duration::from_secs(10));
        h.coordinator.scheduler().run_now(OFFER_REAP_JOB).await.unwrap();
        assert_eq!(h.durable.status("offer-2"), Some(ItemStatus::Active));

        h.clock.advance(Duration::from_secs(60));
        h.coordinator.scheduler().run_now(OFFER_REAP_JOB).await.unwrap();
        assert_eq!(h.durable.status("offer-2"), Some(ItemStatus::Expired));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_completion_and_reaping_agree_on_every_offer() {
        let h = harness();
        let now = h.clock.now();
        let offers: Vec<String> = (0..100).map(|i| format!("offer-{}", i)).collect();
        for offer in &offers {
            h.durable.insert_item(offer.as_str(), ItemStatus::Active);
            h.coordinator
                .track_expiration(offer, now - chrono::Duration::seconds(1))
                .await
                .unwrap();
        }

        let reaper = tokio::spawn({
            let coordinator = h.coordinator.clone();
            async move {
                for _ in 0..5 {
                    coordinator.scheduler().run_now(OFFER_REAP_JOB).await.unwrap();
                    tokio::task::yield_now().await;
                }
            }
        });
        let completions: Vec<_> = offers
            .iter()
            .step_by(2)
            .cloned()
            .map(|offer| {
                let coordinator = h.coordinator.clone();
                tokio::spawn(async move {
                    let transition = coordinator
                        .complete_item(&offer, ItemStatus::Accepted)
                        .await
                        .unwrap();
                    (offer, transition)
                })
            })
            .collect();

        let mut accepted = Vec::new();
        for completion in completions {
            let (offer, transition) = completion.await.unwrap();
            if transition == StatusTransition::Applied {
                accepted.push(offer);
            }
        }
        reaper.await.unwrap();
        h.coordinator.scheduler().run_now(OFFER_REAP_JOB).await.unwrap();

        let expired: Vec<String> = h
            .events
            .events_of_type("ItemExpired")
            .into_iter()
            .filter_map(|event| match event {
                CoordinationEvent::ItemExpired { item_id, .. } => Some(item_id),
                _ => None,
            })
            .collect();

        assert_eq!(accepted.len() + expired.len(), offers.len());
        for offer in &offers {
            let was_accepted = accepted.contains(offer);
            assert_ne!(was_accepted, expired.contains(offer), "{} ended twice or never", offer);
            let expected = if was_accepted {
                ItemStatus::Accepted
            } else {
                ItemStatus::Expired
            };
            assert_eq!(h.durable.status(offer), Some(expected));
        }
    }

    #[tokio::test]
    async fn test_concurrent_reaps_return_each_item_once() {
        let clock = ManualClock::starting_now();
        let store = Arc::new(InMemoryKeyValueStore::new(clock.clone()));
        let tracker = Arc::new(ExpirationTracker::new("offers", "it", store, clock.clone()));
        let now = clock.now();
        for i in 0..200 {
            tracker
                .track(&format!("offer-{}", i), now - chrono::Duration::seconds(1))
                .await
                .unwrap();
        }

        let reapers: Vec<_> = (0..8)
            .map(|_| {
                let tracker = tracker.clone();
                tokio::spawn(async move { tracker.reap(now).await.unwrap() })
            })
            .collect();

        let mut seen = Vec::new();
        for reaper in reapers {
            seen.extend(reaper.await.unwrap().into_iter().map(|item| item.item_id));
        }
        let total = seen.len();
        seen.sort();
        seen.dedup();
        assert_eq!(total, 200);
        assert_eq!(seen.len(), 200);
    }
}

// =============================================================================
// Ephemeral State
// =============================================================================

mod ephemeral_tests {
    use super::*;
    use marketcache::coordinator::VIEWER_REAP_JOB;

    #[tokio::test]
    async fn test_typing_lapses_without_clear() {
        let h = harness();
        let state = h.coordinator.ephemeral();

        state.set_typing("c1", "u1").await;
        assert!(state.is_typing("c1", "u1").await);

        h.clock.advance(Duration::from_secs(4));
        assert!(!state.is_typing("c1", "u1").await);
    }

    #[tokio::test]
    async fn test_presence_lapses_to_offline() {
        let h = harness();
        let state = h.coordinator.ephemeral();

        state.set_presence("u1", PresenceState::Online).await;
        assert_eq!(state.get_presence("u1").await, PresenceState::Online);

        h.clock.advance(Duration::from_secs(301));
        assert_eq!(state.get_presence("u1").await, PresenceState::Offline);
    }

    #[tokio::test]
    async fn test_viewer_reap_job_publishes_counts() {
        let h = harness();
        let state = h.coordinator.ephemeral();
        state.join("listing-7", "u1").await;
        state.join("listing-7", "u2").await;

        h.clock.advance(Duration::from_secs(60));
        state.touch("listing-7", "u2").await;
        h.clock.advance(Duration::from_secs(60));

        h.coordinator.scheduler().run_now(VIEWER_REAP_JOB).await.unwrap();
        assert_eq!(state.members("listing-7").await, vec!["u2"]);

        let last = h
            .events
            .events_of_type("ViewerCountChanged")
            .pop()
            .unwrap();
        assert!(matches!(
            last,
            CoordinationEvent::ViewerCountChanged { count: 1, .. }
        ));
    }

    #[tokio::test]
    async fn test_unread_flow() {
        let h = harness();
        let state = h.coordinator.ephemeral();
        state.increment_unread("u1", Some("thread-1")).await;
        state.increment_unread("u1", Some("thread-1")).await;
        state.increment_unread("u1", Some("thread-2")).await;

        state.reset_unread("u1", Some("thread-1")).await;
        let all = state.get_all("u1").await;
        assert_eq!(all.total, 1);
        assert_eq!(all.by_scope.get("thread-2"), Some(&1));
    }

    #[tokio::test]
    async fn test_broadcast_fan_out() {
        let clock = ManualClock::starting_now();
        let broadcaster = Arc::new(BroadcastEventPublisher::new(16));
        let mut rx = broadcaster.subscribe();
        let coordinator = Coordinator::new(
            CoordinationConfig::default(),
            Arc::new(InMemoryKeyValueStore::new(clock.clone())),
            Arc::new(InMemoryDurableStore::new()),
            broadcaster,
            clock,
        )
        .unwrap();

        coordinator.ephemeral().set_typing("c9", "u1").await;
        let event = rx.recv().await.unwrap();
        assert_eq!(event.event_type(), "TypingChanged");
        assert_eq!(event.channel(), "c9");
    }
}
