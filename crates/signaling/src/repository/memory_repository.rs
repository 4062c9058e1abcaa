use super::{conversation_key, CallLogStore, CallSummary, ConversationStore, DirectoryStore};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use shared::models::{CallId, CallSession, UserId};
use std::collections::{HashMap, HashSet};
use tokio::sync::RwLock;

#[derive(Debug, Default)]
pub struct InMemoryCallLog {
    calls: RwLock<HashMap<CallId, CallSession>>,
}

impl InMemoryCallLog {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl CallLogStore for InMemoryCallLog {
    async fn save(&self, session: &CallSession) -> anyhow::Result<bool> {
        let mut calls = self.calls.write().await;
        if let Some(stored) = calls.get(&session.call_id) {
            if stored.status.rank() > session.status.rank() || stored.status.is_terminal() {
                return Ok(false);
            }
        }
        calls.insert(session.call_id, session.clone());
        Ok(true)
    }

    async fn get(&self, call_id: CallId) -> anyhow::Result<Option<CallSession>> {
        Ok(self.calls.read().await.get(&call_id).cloned())
    }

    async fn history(&self, user_id: &str, page: usize, limit: usize) -> anyhow::Result<(Vec<CallSession>, usize)> {
        let calls = self.calls.read().await;
        let mut mine: Vec<&CallSession> = calls.values().filter(|c| c.involves(user_id)).collect();
        mine.sort_by(|a, b| b.start_time.cmp(&a.start_time));
        let total = mine.len();
        let page_items = mine
            .into_iter()
            .skip(page.saturating_sub(1) * limit)
            .take(limit)
            .cloned()
            .collect();
        Ok((page_items, total))
    }
}

#[derive(Debug, Default)]
pub struct InMemoryDirectory {
    friends: RwLock<HashMap<UserId, HashSet<UserId>>>,
}

impl InMemoryDirectory {
    pub fn with_pairs(pairs: impl IntoIterator<Item = (UserId, UserId)>) -> Self {
        let mut friends: HashMap<UserId, HashSet<UserId>> = HashMap::new();
        for (a, b) in pairs {
            friends.entry(a.clone()).or_default().insert(b.clone());
            friends.entry(b).or_default().insert(a);
        }
        Self {
            friends: RwLock::new(friends),
        }
    }

    pub async fn befriend(&self, a: &str, b: &str) {
        let mut friends = self.friends.write().await;
        friends.entry(a.to_string()).or_default().insert(b.to_string());
        friends.entry(b.to_string()).or_default().insert(a.to_string());
    }
}

#[async_trait]
impl DirectoryStore for InMemoryDirectory {
    async fn are_friends(&self, a: &str, b: &str) -> anyhow::Result<bool> {
        Ok(self
            .friends
            .read()
            .await
            .get(a)
            .is_some_and(|set| set.contains(b)))
    }
}

#[derive(Debug, Default)]
struct Conversations {
    messages: HashMap<String, Vec<CallSummary>>,
    last_change: HashMap<String, DateTime<Utc>>,
}

#[derive(Debug, Default)]
pub struct InMemoryConversations {
    inner: RwLock<Conversations>,
}

impl InMemoryConversations {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn messages(&self, a: &str, b: &str) -> Vec<CallSummary> {
        self.inner
            .read()
            .await
            .messages
            .get(&conversation_key(a, b))
            .cloned()
            .unwrap_or_default()
    }

    pub async fn last_change(&self, a: &str, b: &str) -> Option<DateTime<Utc>> {
        self.inner.read().await.last_change.get(&conversation_key(a, b)).copied()
    }
}

#[async_trait]
impl ConversationStore for InMemoryConversations {
    async fn append_call_summary(&self, summary: &CallSummary) -> anyhow::Result<()> {
        let key = summary.conversation_key();
        let mut inner = self.inner.write().await;
        inner.messages.entry(key.clone()).or_default().push(summary.clone());
        inner.last_change.insert(key, summary.created_at);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;
    use shared::models::{CallType, EndReason, RoomInfo};
    use uuid::Uuid;

    fn call(caller: &str, callee: &str, started: DateTime<Utc>) -> CallSession {
        CallSession::ringing(
            Uuid::new_v4(),
            caller.to_string(),
            callee.to_string(),
            CallType::Audio,
            RoomInfo { name: "r".to_string(), url: "https://r".to_string() },
            started,
        )
    }

    #[tokio::test]
    async fn save_refuses_to_go_backwards() {
        let log = InMemoryCallLog::new();
        let mut session = call("alice", "bob", Utc::now());
        assert!(log.save(&session).await.unwrap());

        let ringing_copy = session.clone();
        session.finish(EndReason::Normal, Utc::now()).unwrap();
        assert!(log.save(&session).await.unwrap());
        assert!(!log.save(&ringing_copy).await.unwrap());

        let stored = log.get(session.call_id).await.unwrap().unwrap();
        assert_eq!(stored.end_reason, Some(EndReason::Normal));
    }

    #[tokio::test]
    async fn terminal_record_is_final() {
        let log = InMemoryCallLog::new();
        let mut session = call("alice", "bob", Utc::now());
        session.finish(EndReason::Rejected, Utc::now()).unwrap();
        assert!(log.save(&session).await.unwrap());

        let mut other = session.clone();
        other.end_reason = Some(EndReason::ForceCleanup);
        assert!(!log.save(&other).await.unwrap());
    }

    #[tokio::test]
    async fn history_is_newest_first_and_paged() {
        let log = InMemoryCallLog::new();
        let base = Utc::now();
        for n in 0..5 {
            log.save(&call("alice", "bob", base + Duration::minutes(n))).await.unwrap();
        }
        log.save(&call("carol", "dave", base)).await.unwrap();

        let (first, total) = log.history("alice", 1, 2).await.unwrap();
        assert_eq!(total, 5);
        assert_eq!(first.len(), 2);
        assert!(first[0].start_time > first[1].start_time);

        let (last, _) = log.history("bob", 3, 2).await.unwrap();
        assert_eq!(last.len(), 1);
        assert_eq!(last[0].start_time, base);
    }

    #[tokio::test]
    async fn friendship_is_symmetric() {
        let directory = InMemoryDirectory::with_pairs([("alice".to_string(), "bob".to_string())]);
        assert!(directory.are_friends("bob", "alice").await.unwrap());
        assert!(!directory.are_friends("alice", "carol").await.unwrap());
        directory.befriend("carol", "alice").await;
        assert!(directory.are_friends("alice", "carol").await.unwrap());
    }

    #[tokio::test]
    async fn summaries_advance_last_change() {
        let conversations = InMemoryConversations::new();
        let mut session = call("alice", "bob", Utc::now());
        session.finish(EndReason::Missed, Utc::now()).unwrap();
        let summary = CallSummary::from_session(&session);
        conversations.append_call_summary(&summary).await.unwrap();

        assert_eq!(conversations.messages("bob", "alice").await, vec![summary.clone()]);
        assert_eq!(conversations.last_change("alice", "bob").await, Some(summary.created_at));
    }
}
