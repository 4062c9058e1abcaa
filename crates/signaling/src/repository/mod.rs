pub mod memory_repository;
pub mod redis_repository;
pub mod session_store;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use shared::models::{CallId, CallSession, CallStatus, CallType, EndReason, UserId};

/// Durable call log. Writes are monotonic: a record is never moved back to an
/// earlier lifecycle status than the one already stored.
#[async_trait]
pub trait CallLogStore: Send + Sync {
    /// Returns false when the write was refused because the stored record is further along.
    async fn save(&self, session: &CallSession) -> anyhow::Result<bool>;
    async fn get(&self, call_id: CallId) -> anyhow::Result<Option<CallSession>>;
    async fn history(&self, user_id: &str, page: usize, limit: usize) -> anyhow::Result<(Vec<CallSession>, usize)>;
}

#[async_trait]
pub trait DirectoryStore: Send + Sync {
    async fn are_friends(&self, a: &str, b: &str) -> anyhow::Result<bool>;
}

#[async_trait]
pub trait ConversationStore: Send + Sync {
    async fn append_call_summary(&self, summary: &CallSummary) -> anyhow::Result<()>;
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CallSummary {
    pub call_id: CallId,
    pub sender_id: UserId,
    pub receiver_id: UserId,
    pub call_type: CallType,
    pub status: CallStatus,
    pub end_reason: Option<EndReason>,
    pub duration_seconds: u64,
    pub text: String,
    pub created_at: DateTime<Utc>,
}

impl CallSummary {
    pub fn from_session(session: &CallSession) -> Self {
        Self {
            call_id: session.call_id,
            sender_id: session.caller_id.clone(),
            receiver_id: session.callee_id.clone(),
            call_type: session.call_type,
            status: session.status,
            end_reason: session.end_reason,
            duration_seconds: session.duration_seconds,
            text: summary_text(session),
            created_at: session.end_time.unwrap_or_else(Utc::now),
        }
    }

    pub fn conversation_key(&self) -> String {
        conversation_key(&self.sender_id, &self.receiver_id)
    }
}

pub fn conversation_key(a: &str, b: &str) -> String {
    if a <= b {
        format!("{a}:{b}")
    } else {
        format!("{b}:{a}")
    }
}

fn summary_text(session: &CallSession) -> String {
    let kind = match session.call_type {
        CallType::Audio => "Audio call",
        CallType::Video => "Video call",
    };
    match session.status {
        CallStatus::Missed => format!("Missed {}", kind.to_lowercase()),
        CallStatus::Rejected => format!("{kind} declined"),
        _ if session.accepted_at.is_none() => format!("{kind} cancelled"),
        _ => format!("{kind} · {}", format_duration(session.duration_seconds)),
    }
}

fn format_duration(seconds: u64) -> String {
    let (h, m, s) = (seconds / 3600, (seconds % 3600) / 60, seconds % 60);
    if h > 0 {
        format!("{h}:{m:02}:{s:02}")
    } else {
        format!("{m}:{s:02}")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;
    use shared::models::RoomInfo;
    use uuid::Uuid;

    fn session() -> CallSession {
        CallSession::ringing(
            Uuid::new_v4(),
            "bob".to_string(),
            "alice".to_string(),
            CallType::Audio,
            RoomInfo { name: "r".to_string(), url: "https://r".to_string() },
            Utc::now(),
        )
    }

    #[test]
    fn conversation_key_is_symmetric() {
        assert_eq!(conversation_key("bob", "alice"), conversation_key("alice", "bob"));
        assert_eq!(conversation_key("bob", "alice"), "alice:bob");
    }

    #[test]
    fn summary_texts() {
        let mut missed = session();
        missed.finish(EndReason::Missed, Utc::now()).unwrap();
        assert_eq!(CallSummary::from_session(&missed).text, "Missed audio call");

        let mut talked = session();
        let accepted = talked.start_time;
        talked.accept(accepted).unwrap();
        talked.finish(EndReason::Normal, accepted + Duration::seconds(125)).unwrap();
        let summary = CallSummary::from_session(&talked);
        assert_eq!(summary.text, "Audio call · 2:05");
        assert_eq!(summary.duration_seconds, 125);

        let mut cancelled = session();
        cancelled.finish(EndReason::Normal, Utc::now()).unwrap();
        assert_eq!(CallSummary::from_session(&cancelled).text, "Audio call cancelled");
    }

    #[test]
    fn long_durations_show_hours() {
        assert_eq!(format_duration(3725), "1:02:05");
    }
}
