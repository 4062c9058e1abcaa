use shared::models::{CallId, CallSession, CallStatus, UserId};
use std::collections::HashMap;
use tokio::sync::RwLock;

#[derive(Debug, Clone)]
pub struct Claimed {
    pub session: CallSession,
    /// Whether the party other than the acting one was still registered in
    /// this call at the moment of the claim.
    pub other_in_call: bool,
}

#[derive(Debug, Default)]
struct Indexes {
    sessions: HashMap<CallId, CallSession>,
    // also holds reservations for calls whose room is still being allocated
    user_calls: HashMap<UserId, CallId>,
}

impl Indexes {
    fn release_user(&mut self, user_id: &str, call_id: CallId) -> bool {
        if self.user_calls.get(user_id) == Some(&call_id) {
            self.user_calls.remove(user_id);
            true
        } else {
            false
        }
    }
}

/// In-memory cache of ringing/active sessions. Authoritative for "is this user
/// in a call". The lock is never held across an await.
#[derive(Debug, Default)]
pub struct SessionStore {
    indexes: RwLock<Indexes>,
}

impl SessionStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Marks both users busy with `call_id` before the session exists.
    /// Fails if either is already in a call (or is the same user).
    pub async fn reserve(&self, call_id: CallId, caller: &str, callee: &str) -> bool {
        let mut indexes = self.indexes.write().await;
        if caller == callee
            || indexes.user_calls.contains_key(caller)
            || indexes.user_calls.contains_key(callee)
        {
            return false;
        }
        indexes.user_calls.insert(caller.to_string(), call_id);
        indexes.user_calls.insert(callee.to_string(), call_id);
        true
    }

    pub async fn release(&self, call_id: CallId) {
        let mut indexes = self.indexes.write().await;
        if !indexes.sessions.contains_key(&call_id) {
            indexes.user_calls.retain(|_, reserved| *reserved != call_id);
        }
    }

    pub async fn insert(&self, session: CallSession) -> bool {
        let mut indexes = self.indexes.write().await;
        let reserved = |user: &str| indexes.user_calls.get(user) == Some(&session.call_id);
        if !reserved(&session.caller_id) || !reserved(&session.callee_id) {
            return false;
        }
        indexes.sessions.insert(session.call_id, session);
        true
    }

    pub async fn get(&self, call_id: CallId) -> Option<CallSession> {
        self.indexes.read().await.sessions.get(&call_id).cloned()
    }

    pub async fn is_in_call(&self, user_id: &str) -> bool {
        self.indexes.read().await.user_calls.contains_key(user_id)
    }

    pub async fn session_for_user(&self, user_id: &str) -> Option<CallSession> {
        let indexes = self.indexes.read().await;
        let call_id = indexes.user_calls.get(user_id)?;
        indexes.sessions.get(call_id).cloned()
    }

    pub async fn status(&self, call_id: CallId) -> Option<CallStatus> {
        self.indexes.read().await.sessions.get(&call_id).map(|s| s.status)
    }

    /// Caller first, then callee: whichever is still registered in `call_id`.
    pub async fn party_in_call(&self, call_id: CallId) -> Option<UserId> {
        let indexes = self.indexes.read().await;
        let session = indexes.sessions.get(&call_id)?;
        // bound first so the iterator is dropped before `indexes`
        let party = [&session.caller_id, &session.callee_id]
            .into_iter()
            .find(|user| indexes.user_calls.get(user.as_str()) == Some(&call_id))
            .cloned();
        party
    }

    pub async fn update<T, E>(
        &self,
        call_id: CallId,
        apply: impl FnOnce(&mut CallSession) -> Result<T, E>,
    ) -> Option<Result<T, E>> {
        let mut indexes = self.indexes.write().await;
        indexes.sessions.get_mut(&call_id).map(apply)
    }

    /// Atomically removes the session and both user entries if `check` passes.
    /// Exactly one of several competing claims on the same call succeeds.
    pub async fn claim<E>(
        &self,
        call_id: CallId,
        acting_user: &str,
        check: impl FnOnce(&CallSession) -> Result<(), E>,
    ) -> Result<Option<Claimed>, E> {
        let mut indexes = self.indexes.write().await;
        let Some(session) = indexes.sessions.get(&call_id) else {
            return Ok(None);
        };
        check(session)?;
        let other = session.other_party(acting_user).cloned();

        indexes.release_user(acting_user, call_id);
        let other_in_call = other
            .map(|other| indexes.release_user(&other, call_id))
            .unwrap_or(false);
        let Some(session) = indexes.sessions.remove(&call_id) else {
            return Ok(None);
        };
        // in case the acting user was not a party
        indexes.user_calls.retain(|_, reserved| *reserved != call_id);
        Ok(Some(Claimed { session, other_in_call }))
    }

    pub async fn remove(&self, call_id: CallId) -> Option<CallSession> {
        let mut indexes = self.indexes.write().await;
        indexes.user_calls.retain(|_, reserved| *reserved != call_id);
        indexes.sessions.remove(&call_id)
    }

    pub async fn live_count(&self) -> usize {
        self.indexes.read().await.sessions.len()
    }
}
