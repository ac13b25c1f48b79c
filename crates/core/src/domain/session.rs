use std::collections::VecDeque;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

use crate::domain::reservation::ReservationId;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    User,
    Assistant,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::User => "user",
            Self::Assistant => "assistant",
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Turn {
    pub role: Role,
    pub content: String,
    pub at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message_id: Option<String>,
}

/// One dedup ledger entry. `reply` is filled once the outbound answer exists.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProcessedMessage {
    pub message_id: String,
    pub seen_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reply: Option<String>,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SessionPolicy {
    pub window_turns: usize,
    pub dedup_retention: Duration,
    pub dedup_max_entries: usize,
    pub idle_reset: Option<Duration>,
}

impl Default for SessionPolicy {
    fn default() -> Self {
        Self {
            window_turns: 20,
            dedup_retention: Duration::hours(24),
            dedup_max_entries: 200,
            idle_reset: Some(Duration::minutes(30)),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Session {
    pub user_id: String,
    #[serde(default)]
    pub turns: VecDeque<Turn>,
    #[serde(default)]
    pub processed_messages: VecDeque<ProcessedMessage>,
    #[serde(default)]
    pub reservation_ids: Vec<ReservationId>,
    pub created_at: DateTime<Utc>,
    pub last_activity_at: DateTime<Utc>,
    /// Storage version the session was read at; owned by the store, never serialized.
    #[serde(skip)]
    pub version: u64,
}

impl Session {
    pub fn new(user_id: impl Into<String>, now: DateTime<Utc>) -> Self {
        Self {
            user_id: user_id.into(),
            turns: VecDeque::new(),
            processed_messages: VecDeque::new(),
            reservation_ids: Vec::new(),
            created_at: now,
            last_activity_at: now,
            version: 0,
        }
    }

    pub fn processed(&self, message_id: &str) -> Option<&ProcessedMessage> {
        self.processed_messages.iter().find(|entry| entry.message_id == message_id)
    }

    pub fn recent_turns(&self, limit: usize) -> Vec<Turn> {
        let skip = self.turns.len().saturating_sub(limit);
        self.turns.iter().skip(skip).cloned().collect()
    }

    /// Appends a turn and applies every bound in `policy`. Callers check the
    /// ledger first; this does not reject duplicates.
    pub fn record_turn(&mut self, turn: Turn, policy: &SessionPolicy) {
        let now = turn.at;

        if turn.role == Role::User && self.is_idle(policy, now) {
            self.turns.clear();
        }

        if let Some(message_id) = &turn.message_id {
            if turn.role == Role::User {
                self.processed_messages.push_back(ProcessedMessage {
                    message_id: message_id.clone(),
                    seen_at: now,
                    reply: None,
                });
            }
        }

        self.turns.push_back(turn);
        self.last_activity_at = now.max(self.last_activity_at);
        self.evict(policy, now);
    }

    pub fn remember_reply(&mut self, message_id: &str, reply: &str) {
        if let Some(entry) =
            self.processed_messages.iter_mut().find(|entry| entry.message_id == message_id)
        {
            entry.reply = Some(reply.to_string());
        }
    }

    /// Drops the ledger entry and the user turn for `message_id`. Returns whether
    /// anything was removed.
    pub fn forget_message(&mut self, message_id: &str) -> bool {
        let before = self.processed_messages.len() + self.turns.len();
        self.processed_messages.retain(|entry| entry.message_id != message_id);
        self.turns.retain(|turn| {
            !(turn.role == Role::User && turn.message_id.as_deref() == Some(message_id))
        });
        before != self.processed_messages.len() + self.turns.len()
    }

    pub fn link_reservation(&mut self, reservation_id: ReservationId) {
        if !self.reservation_ids.contains(&reservation_id) {
            self.reservation_ids.push(reservation_id);
        }
    }

    pub fn reset(&mut self, now: DateTime<Utc>) {
        self.turns.clear();
        self.processed_messages.clear();
        self.reservation_ids.clear();
        self.last_activity_at = now.max(self.last_activity_at);
    }

    fn is_idle(&self, policy: &SessionPolicy, now: DateTime<Utc>) -> bool {
        match policy.idle_reset {
            Some(idle) => !self.turns.is_empty() && now - self.last_activity_at > idle,
            None => false,
        }
    }

    fn evict(&mut self, policy: &SessionPolicy, now: DateTime<Utc>) {
        while self.turns.len() > policy.window_turns {
            self.turns.pop_front();
        }

        let horizon = now - policy.dedup_retention;
        while self.processed_messages.front().is_some_and(|entry| entry.seen_at < horizon) {
            self.processed_messages.pop_front();
        }
        while self.processed_messages.len() > policy.dedup_max_entries {
            self.processed_messages.pop_front();
        }
    }
}

#[cfg(test)]
mod tests {
    use chrono::{Duration, TimeZone, Utc};

    use super::{Role, Session, SessionPolicy, Turn};

    fn turn(role: Role, content: &str, minute: i64, message_id: Option<&str>) -> Turn {
        Turn {
            role,
            content: content.to_string(),
            at: Utc.with_ymd_and_hms(2025, 6, 1, 12, 0, 0).unwrap() + Duration::minutes(minute),
            message_id: message_id.map(str::to_string),
        }
    }

    #[test]
    fn window_keeps_most_recent_turns_in_order() {
        let policy = SessionPolicy { idle_reset: None, ..SessionPolicy::default() };
        let mut session = Session::new("+34600111222", Utc::now());

        for index in 1..=25 {
            session.record_turn(turn(Role::User, &format!("turn {index}"), index, None), &policy);
        }

        assert_eq!(session.turns.len(), 20);
        let contents: Vec<_> = session.turns.iter().map(|turn| turn.content.clone()).collect();
        let expected: Vec<_> = (6..=25).map(|index| format!("turn {index}")).collect();
        assert_eq!(contents, expected);
    }

    #[test]
    fn ledger_evicts_expired_and_overflowing_entries() {
        let policy = SessionPolicy {
            window_turns: 50,
            dedup_retention: Duration::minutes(30),
            dedup_max_entries: 3,
            idle_reset: None,
        };
        let mut session = Session::new("u", Utc::now());

        session.record_turn(turn(Role::User, "a", 0, Some("m-0")), &policy);
        session.record_turn(turn(Role::User, "b", 40, Some("m-1")), &policy);
        assert!(session.processed("m-0").is_none(), "m-0 is older than the retention window");
        assert!(session.processed("m-1").is_some());

        for (index, minute) in (2..6).zip(41..45) {
            let id = format!("m-{index}");
            session.record_turn(turn(Role::User, "c", minute, Some(&id)), &policy);
        }
        let ids: Vec<_> =
            session.processed_messages.iter().map(|entry| entry.message_id.clone()).collect();
        assert_eq!(ids, vec!["m-3", "m-4", "m-5"]);
    }

    #[test]
    fn idle_gap_clears_turns_but_keeps_ledger() {
        let policy = SessionPolicy {
            idle_reset: Some(Duration::minutes(30)),
            ..SessionPolicy::default()
        };
        let mut session = Session::new("u", Utc.with_ymd_and_hms(2025, 6, 1, 12, 0, 0).unwrap());

        session.record_turn(turn(Role::User, "hola", 0, Some("m-1")), &policy);
        session.record_turn(turn(Role::Assistant, "buenas", 1, None), &policy);
        session.record_turn(turn(Role::User, "otra vez", 90, Some("m-2")), &policy);

        assert_eq!(session.turns.len(), 1);
        assert_eq!(session.turns[0].content, "otra vez");
        assert!(session.processed("m-1").is_some());
    }

    #[test]
    fn forget_message_removes_turn_and_ledger_entry() {
        let policy = SessionPolicy::default();
        let mut session = Session::new("u", Utc::now());
        session.record_turn(turn(Role::User, "hola", 0, Some("m-1")), &policy);

        assert!(session.forget_message("m-1"));
        assert!(session.turns.is_empty());
        assert!(session.processed("m-1").is_none());
        assert!(!session.forget_message("m-1"));
    }

    #[test]
    fn remember_reply_attaches_to_ledger_entry() {
        let policy = SessionPolicy::default();
        let mut session = Session::new("u", Utc::now());
        session.record_turn(turn(Role::User, "hola", 0, Some("m-1")), &policy);
        session.remember_reply("m-1", "¡Hola!");

        assert_eq!(session.processed("m-1").and_then(|entry| entry.reply.as_deref()), Some("¡Hola!"));
    }
}
