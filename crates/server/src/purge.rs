use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

use mesa_db::ReservationStore;

/// Periodically reclaims cancelled and completed reservations whose retention ran out.
/// Returns `None` when `every` is zero.
pub fn spawn(
    reservations: ReservationStore,
    every: Duration,
    mut shutdown: watch::Receiver<bool>,
) -> Option<JoinHandle<()>> {
    if every.is_zero() {
        info!(event_name = "system.purge.disabled", correlation_id = "bootstrap", "ttl purge disabled");
        return None;
    }

    Some(tokio::spawn(async move {
        let mut ticker = tokio::time::interval(every);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // The first tick completes immediately; skip it so startup is not slowed by a sweep.
        ticker.tick().await;

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    run_once(&reservations).await;
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        debug!(event_name = "system.purge.stopped", correlation_id = "shutdown");
                        break;
                    }
                }
            }
        }
    }))
}

pub async fn run_once(reservations: &ReservationStore) -> Option<u64> {
    match reservations.purge_expired().await {
        Ok(removed) => {
            info!(event_name = "system.purge.completed", correlation_id = "purge", removed);
            Some(removed)
        }
        Err(error) => {
            warn!(
                event_name = "system.purge.failed",
                correlation_id = "purge",
                error = %error,
                "ttl purge failed; will retry on the next tick"
            );
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::time::Duration;

    use chrono::{TimeZone, Utc};
    use tokio::sync::watch;

    use mesa_core::clock::{Clock, ManualClock};
    use mesa_core::config::AppConfig;
    use mesa_core::domain::reservation::NewReservation;
    use mesa_db::{InMemoryKeyValueStore, KeyValueStore, ReservationStore, ReservationStoreSettings};

    use super::{run_once, spawn};

    fn store(clock: Arc<ManualClock>) -> ReservationStore {
        let kv: Arc<dyn KeyValueStore> = Arc::new(InMemoryKeyValueStore::default());
        let clock: Arc<dyn Clock> = clock;
        let settings = ReservationStoreSettings::from(&AppConfig::default().reservations);
        ReservationStore::new(kv, clock, settings)
    }

    #[tokio::test]
    async fn run_once_reclaims_expired_cancellations() {
        let clock = Arc::new(ManualClock::new(Utc.with_ymd_and_hms(2025, 6, 1, 9, 0, 0).unwrap()));
        let reservations = store(clock.clone());

        let created = reservations
            .create(NewReservation {
                customer_phone: "+34600111222".to_string(),
                customer_name: "Lucía".to_string(),
                date: "2025-06-06".to_string(),
                time: "20:30".to_string(),
                party_size: 4,
                ..NewReservation::default()
            })
            .await
            .expect("created");
        reservations.cancel(&created.id).await.expect("cancelled");

        assert_eq!(run_once(&reservations).await, Some(0));

        clock.advance(chrono::Duration::days(60));
        assert!(run_once(&reservations).await.is_some_and(|removed| removed >= 1));
        assert!(reservations.get(&created.id).await.is_err());
    }

    #[tokio::test]
    async fn zero_interval_disables_purge() {
        let clock = Arc::new(ManualClock::new(Utc::now()));
        let (_tx, rx) = watch::channel(false);
        assert!(spawn(store(clock), Duration::ZERO, rx).is_none());
    }

    #[tokio::test]
    async fn purge_task_stops_on_shutdown() {
        let clock = Arc::new(ManualClock::new(Utc::now()));
        let (tx, rx) = watch::channel(false);
        let handle = spawn(store(clock), Duration::from_secs(3600), rx).expect("task spawned");

        tx.send(true).expect("receiver alive");
        tokio::time::timeout(Duration::from_secs(5), handle)
            .await
            .expect("task stopped in time")
            .expect("task did not panic");
    }
}
