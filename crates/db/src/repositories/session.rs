//! Per-user conversation state with an idempotency ledger.
//!
//! Every mutation is read-modify-write against the session item, conditioned on the
//! version that was read. Two deliveries of the same message racing each other both
//! read the same version; one write lands, the other re-reads, finds the message in
//! the ledger and reports a duplicate.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use tracing::{debug, info, warn};

use mesa_core::clock::Clock;
use mesa_core::config::SessionConfig;
use mesa_core::domain::reservation::ReservationId;
use mesa_core::domain::session::{Role, Session, SessionPolicy, Turn};
use mesa_core::errors::{KeyError, SessionError};
use mesa_core::keys::{self, EntityKey};

use super::session_error;
use crate::store::{KeyValueStore, PutItem, StorageError, StoredItem, WriteCondition};

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SessionStoreSettings {
    pub policy: SessionPolicy,
    pub write_attempts: u32,
}

impl Default for SessionStoreSettings {
    fn default() -> Self {
        Self { policy: SessionPolicy::default(), write_attempts: 5 }
    }
}

impl From<&SessionConfig> for SessionStoreSettings {
    fn from(config: &SessionConfig) -> Self {
        Self { policy: config.policy(), write_attempts: config.write_attempts.max(1) }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum AppendOutcome {
    Appended(Session),
    /// The message id is already in the ledger. `reply` is what was sent for it, if
    /// processing got that far.
    Duplicate { reply: Option<String> },
}

enum Change<T> {
    Write(T),
    Keep(T),
}

#[derive(Clone)]
pub struct SessionStore {
    store: Arc<dyn KeyValueStore>,
    clock: Arc<dyn Clock>,
    settings: SessionStoreSettings,
}

impl SessionStore {
    pub fn new(
        store: Arc<dyn KeyValueStore>,
        clock: Arc<dyn Clock>,
        settings: SessionStoreSettings,
    ) -> Self {
        Self { store, clock, settings }
    }

    pub fn policy(&self) -> &SessionPolicy {
        &self.settings.policy
    }

    pub async fn get(&self, user_id: &str) -> Result<Option<Session>, SessionError> {
        let item = self.store.get(&keys::session_key(user_id)).await.map_err(session_error)?;
        item.map(decode_session).transpose()
    }

    pub async fn get_or_create(&self, user_id: &str) -> Result<Session, SessionError> {
        let (session, ()) = self
            .mutate(user_id, |session, _| {
                if session.version == 0 {
                    Change::Write(())
                } else {
                    Change::Keep(())
                }
            })
            .await?;
        Ok(session)
    }

    pub async fn append_turn(
        &self,
        user_id: &str,
        role: Role,
        content: &str,
        message_id: Option<&str>,
    ) -> Result<AppendOutcome, SessionError> {
        let policy = self.settings.policy.clone();
        let (session, duplicate) = self
            .mutate(user_id, |session, now| {
                if let Some(entry) = message_id.and_then(|id| session.processed(id)) {
                    return Change::Keep(Some(entry.reply.clone()));
                }
                session.record_turn(
                    Turn {
                        role,
                        content: content.to_string(),
                        at: now,
                        message_id: message_id.map(str::to_string),
                    },
                    &policy,
                );
                Change::Write(None)
            })
            .await?;

        match duplicate {
            Some(reply) => {
                info!(
                    event_name = "session.message.duplicate",
                    user_id,
                    message_id = message_id.unwrap_or_default(),
                    has_reply = reply.is_some(),
                    "redelivered message absorbed by the ledger"
                );
                Ok(AppendOutcome::Duplicate { reply })
            }
            None => Ok(AppendOutcome::Appended(session)),
        }
    }

    /// Appends the assistant turn and remembers `reply` against `message_id` in one write.
    pub async fn record_reply(
        &self,
        user_id: &str,
        message_id: Option<&str>,
        reply: &str,
    ) -> Result<Session, SessionError> {
        let policy = self.settings.policy.clone();
        let (session, ()) = self
            .mutate(user_id, |session, now| {
                session.record_turn(
                    Turn { role: Role::Assistant, content: reply.to_string(), at: now, message_id: None },
                    &policy,
                );
                if let Some(message_id) = message_id {
                    session.remember_reply(message_id, reply);
                }
                Change::Write(())
            })
            .await?;
        Ok(session)
    }

    /// Undoes the ledger entry and user turn for a message whose processing failed
    /// before any side effect, so the transport's redelivery is handled afresh.
    pub async fn forget_message(&self, user_id: &str, message_id: &str) -> Result<bool, SessionError> {
        let (_, forgotten) = self
            .mutate(user_id, |session, _| {
                if session.version > 0 && session.forget_message(message_id) {
                    Change::Write(true)
                } else {
                    Change::Keep(false)
                }
            })
            .await?;
        if forgotten {
            debug!(event_name = "session.message.forgotten", user_id, message_id);
        }
        Ok(forgotten)
    }

    pub async fn link_reservation(
        &self,
        user_id: &str,
        reservation_id: &ReservationId,
    ) -> Result<Session, SessionError> {
        let (session, ()) = self
            .mutate(user_id, |session, _| {
                if session.reservation_ids.contains(reservation_id) {
                    Change::Keep(())
                } else {
                    session.link_reservation(reservation_id.clone());
                    Change::Write(())
                }
            })
            .await?;
        Ok(session)
    }

    /// Clears turns, ledger and reservation links. The user id is kept.
    pub async fn reset(&self, user_id: &str) -> Result<Session, SessionError> {
        let (session, ()) = self
            .mutate(user_id, |session, now| {
                session.reset(now);
                Change::Write(())
            })
            .await?;
        info!(event_name = "session.reset", user_id, "session reset");
        Ok(session)
    }

    async fn mutate<T, F>(&self, user_id: &str, mut apply: F) -> Result<(Session, T), SessionError>
    where
        F: FnMut(&mut Session, DateTime<Utc>) -> Change<T>,
    {
        let user_id = user_id.trim();
        let key = keys::session_key(user_id);

        for attempt in 1..=self.settings.write_attempts {
            let now = self.clock.now();
            let mut session = match self.get(user_id).await? {
                Some(session) => session,
                None => Session::new(user_id, now),
            };
            let read_version = session.version;

            let output = match apply(&mut session, now) {
                Change::Keep(output) => return Ok((session, output)),
                Change::Write(output) => output,
            };

            let body = serde_json::to_value(&session).map_err(|error| {
                SessionError::StoreUnavailable(format!("unencodable session: {error}"))
            })?;
            let put = PutItem::new(key.clone(), body, WriteCondition::expecting(read_version));

            match self.store.put(put).await {
                Ok(version) => {
                    session.version = version;
                    return Ok((session, output));
                }
                Err(StorageError::ConditionFailed { .. }) => {
                    debug!(
                        event_name = "session.write.conflict",
                        user_id,
                        attempt,
                        "session changed concurrently, re-reading"
                    );
                }
                Err(error) => return Err(session_error(error)),
            }
        }

        warn!(
            event_name = "session.write.exhausted",
            user_id,
            attempts = self.settings.write_attempts,
            "session contention outlasted write attempts"
        );
        Err(SessionError::Conflict {
            user_id: user_id.to_string(),
            attempts: self.settings.write_attempts,
        })
    }
}

fn decode_session(item: StoredItem) -> Result<Session, SessionError> {
    let EntityKey::Session { user_id } = keys::decode(&item.key)? else {
        return Err(KeyError::Malformed {
            key: item.key.to_string(),
            reason: "expected a session item",
        }
        .into());
    };

    let mut session: Session = serde_json::from_value(item.body).map_err(|error| {
        SessionError::StoreUnavailable(format!("session for {user_id} is unreadable: {error}"))
    })?;
    if session.user_id != user_id {
        return Err(KeyError::Malformed {
            key: item.key.to_string(),
            reason: "item key does not match the user id in its body",
        }
        .into());
    }
    session.version = item.version;
    Ok(session)
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use async_trait::async_trait;
    use chrono::{Duration, TimeZone, Utc};
    use futures::future::join_all;
    use serde_json::json;

    use mesa_core::clock::ManualClock;
    use mesa_core::domain::reservation::ReservationId;
    use mesa_core::domain::session::Role;
    use mesa_core::errors::{KeyError, SessionError};
    use mesa_core::keys::{self, ItemKey};

    use super::{AppendOutcome, SessionStore, SessionStoreSettings};
    use crate::store::{
        InMemoryKeyValueStore, KeyValueStore, PutItem, Query, StorageError, StoredItem,
        WriteCondition, WriteOp,
    };

    fn fixture() -> (SessionStore, ManualClock, Arc<InMemoryKeyValueStore>) {
        let engine = Arc::new(InMemoryKeyValueStore::default());
        let clock = ManualClock::new(Utc.with_ymd_and_hms(2025, 6, 1, 12, 0, 0).unwrap());
        let store =
            SessionStore::new(engine.clone(), Arc::new(clock.clone()), SessionStoreSettings::default());
        (store, clock, engine)
    }

    #[tokio::test]
    async fn get_or_create_persists_an_empty_session_once() {
        let (store, _, engine) = fixture();

        let created = store.get_or_create("+34600111222").await.expect("create");
        assert_eq!(created.user_id, "+34600111222");
        assert!(created.turns.is_empty());
        assert_eq!(created.version, 1);

        let again = store.get_or_create("+34600111222").await.expect("existing");
        assert_eq!(again, created);
        assert_eq!(engine.len().await, 1);
    }

    #[tokio::test]
    async fn window_is_bounded_to_most_recent_turns() {
        let (store, _, _) = fixture();
        for index in 1..=25 {
            store
                .append_turn("u", Role::User, &format!("turn {index}"), Some(&format!("m-{index}")))
                .await
                .expect("append");
        }

        let session = store.get("u").await.expect("get").expect("exists");
        let contents: Vec<_> = session.turns.iter().map(|turn| turn.content.clone()).collect();
        let expected: Vec<_> = (6..=25).map(|index| format!("turn {index}")).collect();
        assert_eq!(contents, expected);
    }

    #[tokio::test]
    async fn duplicate_message_ids_do_not_mutate_state() {
        let (store, _, _) = fixture();

        let first = store.append_turn("u", Role::User, "hola", Some("SM1")).await.expect("append");
        let AppendOutcome::Appended(session) = first else {
            panic!("first delivery must append");
        };

        let replay = store.append_turn("u", Role::User, "hola", Some("SM1")).await.expect("replay");
        assert_eq!(replay, AppendOutcome::Duplicate { reply: None });

        store.record_reply("u", Some("SM1"), "¡Hola! ¿En qué puedo ayudarle?").await.expect("reply");
        let replay = store.append_turn("u", Role::User, "hola", Some("SM1")).await.expect("replay");
        assert_eq!(
            replay,
            AppendOutcome::Duplicate { reply: Some("¡Hola! ¿En qué puedo ayudarle?".to_string()) }
        );

        let stored = store.get("u").await.expect("get").expect("exists");
        assert_eq!(stored.turns.len(), session.turns.len() + 1, "only the assistant turn was added");
    }

    #[tokio::test]
    async fn concurrent_deliveries_resolve_to_one_append() {
        let (store, _, _) = fixture();

        let outcomes = join_all((0..8).map(|_| {
            let store = store.clone();
            async move { store.append_turn("u", Role::User, "mesa para dos", Some("SM-race")).await }
        }))
        .await;

        let appended = outcomes
            .iter()
            .filter(|outcome| matches!(outcome, Ok(AppendOutcome::Appended(_))))
            .count();
        assert_eq!(appended, 1);
        assert!(outcomes.iter().all(Result::is_ok));
        let session = store.get("u").await.expect("get").expect("exists");
        assert_eq!(session.turns.len(), 1);
    }

    #[tokio::test]
    async fn forget_message_lets_redelivery_append_again() {
        let (store, _, _) = fixture();
        store.append_turn("u", Role::User, "hola", Some("SM1")).await.expect("append");

        assert!(store.forget_message("u", "SM1").await.expect("forget"));
        assert!(!store.forget_message("u", "SM1").await.expect("nothing left"));
        assert!(!store.forget_message("nobody", "SM1").await.expect("absent session"));

        let retry = store.append_turn("u", Role::User, "hola", Some("SM1")).await.expect("retry");
        assert!(matches!(retry, AppendOutcome::Appended(ref session) if session.turns.len() == 1));
    }

    #[tokio::test]
    async fn idle_gap_rotates_turns_but_keeps_ledger() {
        let (store, clock, _) = fixture();
        store.append_turn("u", Role::User, "hola", Some("SM1")).await.expect("append");
        store.record_reply("u", Some("SM1"), "buenas").await.expect("reply");

        clock.advance(Duration::hours(2));
        let outcome = store.append_turn("u", Role::User, "sigo aquí", Some("SM2")).await.expect("append");
        let AppendOutcome::Appended(session) = outcome else {
            panic!("new message must append");
        };
        assert_eq!(session.turns.len(), 1);
        assert!(session.processed("SM1").is_some());
    }

    #[tokio::test]
    async fn link_and_reset() {
        let (store, _, _) = fixture();
        let id = ReservationId("RES-20250606-ABCDEF12".to_string());
        store.append_turn("u", Role::User, "hola", Some("SM1")).await.expect("append");
        store.link_reservation("u", &id).await.expect("link");
        let linked = store.link_reservation("u", &id).await.expect("link twice");
        assert_eq!(linked.reservation_ids, vec![id]);

        let reset = store.reset("u").await.expect("reset");
        assert_eq!(reset.user_id, "u");
        assert!(reset.turns.is_empty());
        assert!(reset.processed_messages.is_empty());
        assert!(reset.reservation_ids.is_empty());

        let after = store.append_turn("u", Role::User, "hola", Some("SM1")).await.expect("append");
        assert!(matches!(after, AppendOutcome::Appended(_)), "ledger was cleared");
    }

    #[tokio::test]
    async fn mismatched_session_body_is_a_malformed_key() {
        let (store, _, engine) = fixture();
        let body = json!({
            "user_id": "someone-else",
            "created_at": "2025-06-01T12:00:00Z",
            "last_activity_at": "2025-06-01T12:00:00Z"
        });
        engine
            .put(PutItem::new(keys::session_key("u"), body, WriteCondition::Absent))
            .await
            .expect("seed");

        let error = store.get("u").await.expect_err("mismatch");
        assert!(matches!(error, SessionError::MalformedKey(KeyError::Malformed { .. })));
    }

    /// Every conditional put loses to an imaginary concurrent writer.
    struct ContendedStore(InMemoryKeyValueStore);

    #[async_trait]
    impl KeyValueStore for ContendedStore {
        async fn get(&self, key: &ItemKey) -> Result<Option<StoredItem>, StorageError> {
            self.0.get(key).await
        }

        async fn put(&self, item: PutItem) -> Result<u64, StorageError> {
            Err(StorageError::ConditionFailed { key: item.key })
        }

        async fn delete(&self, key: &ItemKey, condition: WriteCondition) -> Result<(), StorageError> {
            self.0.delete(key, condition).await
        }

        async fn transact_write(&self, ops: Vec<WriteOp>) -> Result<(), StorageError> {
            self.0.transact_write(ops).await
        }

        async fn query(&self, query: &Query) -> Result<Vec<StoredItem>, StorageError> {
            self.0.query(query).await
        }

        async fn purge_expired(&self, now_epoch: i64) -> Result<u64, StorageError> {
            self.0.purge_expired(now_epoch).await
        }
    }

    #[tokio::test]
    async fn exhausted_retries_surface_conflict() {
        let store = SessionStore::new(
            Arc::new(ContendedStore(InMemoryKeyValueStore::default())),
            Arc::new(ManualClock::new(Utc::now())),
            SessionStoreSettings { write_attempts: 3, ..SessionStoreSettings::default() },
        );

        let error = store.append_turn("u", Role::User, "hola", Some("SM1")).await.expect_err("conflict");
        assert_eq!(error, SessionError::Conflict { user_id: "u".to_string(), attempts: 3 });
    }
}
