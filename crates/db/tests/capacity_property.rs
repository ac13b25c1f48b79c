use std::sync::Arc;

use chrono::NaiveDate;
use proptest::prelude::*;
use proptest::test_runner::Config as ProptestConfig;

use mesa_core::clock::SystemClock;
use mesa_core::domain::reservation::{NewReservation, ReservationStatus, Slot};
use mesa_core::errors::ReservationError;
use mesa_db::repositories::DateRange;
use mesa_db::{InMemoryKeyValueStore, ReservationStore, ReservationStoreSettings};

const CAPACITY: u32 = 20;
const TIMES: &[&str] = &["20:00", "20:30", "21:00"];

#[derive(Clone, Debug)]
struct Request {
    time: usize,
    party_size: u32,
    cancel_after: bool,
}

fn arb_request() -> impl Strategy<Value = Request> {
    (0..TIMES.len(), 1u32..=12, prop::bool::weighted(0.2))
        .prop_map(|(time, party_size, cancel_after)| Request { time, party_size, cancel_after })
}

fn store() -> ReservationStore {
    ReservationStore::new(
        Arc::new(InMemoryKeyValueStore::default()),
        Arc::new(SystemClock),
        ReservationStoreSettings {
            bucket_capacity: CAPACITY,
            max_party_size: 12,
            write_attempts: 3,
            ..Default::default()
        },
    )
}

/// Fires every request at once from separate tasks and returns the committed store.
async fn run_concurrently(requests: Vec<Request>) -> (ReservationStore, Vec<Result<(), ReservationError>>) {
    let store = store();
    let handles: Vec<_> = requests
        .into_iter()
        .enumerate()
        .map(|(index, request)| {
            let store = store.clone();
            tokio::spawn(async move {
                let created = store
                    .create(NewReservation {
                        customer_phone: format!("+346{index:08}"),
                        customer_name: String::new(),
                        date: "2025-06-06".to_string(),
                        time: TIMES[request.time].to_string(),
                        party_size: request.party_size,
                        ..NewReservation::default()
                    })
                    .await?;
                if request.cancel_after {
                    store.cancel(&created.id).await?;
                }
                Ok::<(), ReservationError>(())
            })
        })
        .collect();

    let mut outcomes = Vec::with_capacity(handles.len());
    for handle in handles {
        outcomes.push(handle.await.unwrap_or_else(|error| {
            Err(ReservationError::StoreUnavailable(format!("task panicked: {error}")))
        }));
    }
    (store, outcomes)
}

proptest! {
    #![proptest_config(ProptestConfig {
        cases: 48,
        failure_persistence: None,
        .. ProptestConfig::default()
    })]

    #[test]
    fn concurrent_creates_never_overbook_a_bucket(requests in prop::collection::vec(arb_request(), 1..24)) {
        let runtime = tokio::runtime::Builder::new_multi_thread()
            .worker_threads(4)
            .enable_all()
            .build()
            .expect("runtime");

        let (loads, outcomes, pending) = runtime.block_on(async move {
            let (store, outcomes) = run_concurrently(requests).await;
            let mut loads = Vec::new();
            for time in TIMES {
                let slot = Slot::parse("2025-06-06", time).expect("slot");
                loads.push(store.bucket_load(&slot, None).await.expect("load"));
            }
            let date = NaiveDate::from_ymd_opt(2025, 6, 6).expect("date");
            let pending = store
                .list_by_status(ReservationStatus::Pending, DateRange::single(date))
                .collect_all()
                .await
                .expect("pending");
            (loads, outcomes, pending)
        });

        for load in &loads {
            prop_assert!(*load <= CAPACITY, "bucket load {} exceeds capacity", load);
        }
        let pending_total: u32 = pending.iter().map(|reservation| reservation.party_size).sum();
        prop_assert_eq!(pending_total, loads.iter().sum::<u32>());
        for outcome in outcomes {
            prop_assert!(
                matches!(outcome, Ok(()) | Err(ReservationError::CapacityExceeded { .. })),
                "unexpected outcome {:?}",
                outcome
            );
        }
    }
}
