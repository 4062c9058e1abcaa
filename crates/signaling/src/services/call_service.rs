use super::room_monitor::{MonitorTarget, RoomMonitor};
use super::room_provider::{room_name_for, RoomProvider, RoomProviderError};
use crate::config::CallSettings;
use crate::presence::PresenceRegistry;
use crate::relay::SignalingRelay;
use crate::repository::session_store::{Claimed, SessionStore};
use crate::repository::{CallLogStore, CallSummary, ConversationStore, DirectoryStore};
use crate::scheduler::TaskTable;
use async_trait::async_trait;
use chrono::Utc;
use shared::events::{
    CallAccepted, CallAcceptedConfirmed, CallAutoEnded, CallEnded, CallEndedConfirmed, CallInitiated,
    CallMissed, CallRejected, IncomingCall, ServerEvent,
};
use shared::models::{
    CallHistoryResponse, CallId, CallSession, CallStatus, CallType, EndReason, RoomInfo, TransitionError,
};
use std::sync::{Arc, Weak};
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

const DEFAULT_HISTORY_LIMIT: usize = 20;
const MAX_HISTORY_LIMIT: usize = 100;

#[derive(Debug, thiserror::Error)]
pub enum CallError {
    #[error("{0}")]
    Validation(String),
    #[error("User is already in a call")]
    AlreadyInCall,
    #[error("You can only call your friends")]
    NotFriends,
    #[error("User is not available")]
    UserUnavailable,
    #[error("Failed to create call room: {0}")]
    RoomAllocationFailed(#[source] RoomProviderError),
    #[error("Call not found")]
    SessionNotFound,
    #[error("Not a participant of this call")]
    Unauthorized,
    #[error("Invalid call state: {0}")]
    InvalidState(#[from] TransitionError),
    #[error("Storage error: {0}")]
    Storage(#[from] anyhow::Error),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StepOutcome {
    Done,
    Skipped(&'static str),
    Failed(String),
}

impl StepOutcome {
    fn from_result<E: std::fmt::Display>(result: Result<(), E>) -> Self {
        match result {
            Ok(()) => Self::Done,
            Err(err) => Self::Failed(err.to_string()),
        }
    }

    pub fn is_failed(&self) -> bool {
        matches!(self, Self::Failed(_))
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CleanupReport {
    pub call_id: CallId,
    pub lookup: StepOutcome,
    pub cache: StepOutcome,
    pub persist: StepOutcome,
    pub room: StepOutcome,
    pub summary: StepOutcome,
}

impl CleanupReport {
    fn new(call_id: CallId) -> Self {
        let pending = StepOutcome::Skipped("not attempted");
        Self {
            call_id,
            lookup: pending.clone(),
            cache: pending.clone(),
            persist: pending.clone(),
            room: pending.clone(),
            summary: pending,
        }
    }

    pub fn has_failures(&self) -> bool {
        [&self.lookup, &self.cache, &self.persist, &self.room, &self.summary]
            .into_iter()
            .any(StepOutcome::is_failed)
    }

    fn log(&self) {
        if self.has_failures() {
            warn!(
                call_id = %self.call_id,
                lookup = ?self.lookup,
                cache = ?self.cache,
                persist = ?self.persist,
                room = ?self.room,
                summary = ?self.summary,
                "force cleanup finished with failures"
            );
        } else {
            info!(
                call_id = %self.call_id,
                lookup = ?self.lookup,
                cache = ?self.cache,
                persist = ?self.persist,
                room = ?self.room,
                summary = ?self.summary,
                "force cleanup finished"
            );
        }
    }
}

pub struct CallServiceDeps {
    pub presence: Arc<PresenceRegistry>,
    pub rooms: Arc<dyn RoomProvider>,
    pub call_log: Arc<dyn CallLogStore>,
    pub directory: Arc<dyn DirectoryStore>,
    pub conversations: Arc<dyn ConversationStore>,
}

/// Owns the lifecycle of every call: ringing, active, then one terminal state.
pub struct CallService {
    me: Weak<CallService>,
    sessions: SessionStore,
    presence: Arc<PresenceRegistry>,
    relay: SignalingRelay,
    rooms: Arc<dyn RoomProvider>,
    call_log: Arc<dyn CallLogStore>,
    directory: Arc<dyn DirectoryStore>,
    conversations: Arc<dyn ConversationStore>,
    monitor: RoomMonitor,
    ring_deadlines: TaskTable<CallId>,
    settings: CallSettings,
}

impl CallService {
    pub fn new(deps: CallServiceDeps, settings: CallSettings) -> Arc<Self> {
        let monitor = RoomMonitor::new(
            deps.rooms.clone(),
            settings.monitor_interval,
            settings.empty_room_threshold,
        );
        Arc::new_cyclic(|me| Self {
            me: me.clone(),
            sessions: SessionStore::new(),
            relay: SignalingRelay::new(deps.presence.clone()),
            presence: deps.presence,
            rooms: deps.rooms,
            call_log: deps.call_log,
            directory: deps.directory,
            conversations: deps.conversations,
            monitor,
            ring_deadlines: TaskTable::new("ring_deadlines"),
            settings,
        })
    }

    #[instrument(skip(self))]
    pub async fn initiate(
        &self,
        caller_id: &str,
        callee_id: &str,
        call_type: CallType,
    ) -> Result<CallSession, CallError> {
        if caller_id.trim().is_empty() || callee_id.trim().is_empty() {
            return Err(CallError::Validation("callerId and receiverId are required".to_string()));
        }
        if caller_id == callee_id {
            return Err(CallError::Validation("You cannot call yourself".to_string()));
        }
        if self.sessions.is_in_call(caller_id).await || self.sessions.is_in_call(callee_id).await {
            return Err(CallError::AlreadyInCall);
        }
        if !self.directory.are_friends(caller_id, callee_id).await? {
            return Err(CallError::NotFriends);
        }
        if !self.presence.is_online(callee_id).await {
            return Err(CallError::UserUnavailable);
        }

        let call_id = Uuid::new_v4();
        // both users stay busy while the room is being allocated
        if !self.sessions.reserve(call_id, caller_id, callee_id).await {
            return Err(CallError::AlreadyInCall);
        }

        let room = match self.rooms.create_room(&room_name_for(call_id)).await {
            Ok(room) => room,
            Err(err) => {
                self.sessions.release(call_id).await;
                warn!(call_id = %call_id, error = %err, "room allocation failed");
                return Err(CallError::RoomAllocationFailed(err));
            }
        };

        let session = CallSession::ringing(
            call_id,
            caller_id.to_string(),
            callee_id.to_string(),
            call_type,
            room,
            Utc::now(),
        );
        if let Err(err) = self.call_log.save(&session).await {
            self.sessions.release(call_id).await;
            self.delete_room(&session.room_name).await;
            return Err(CallError::Storage(err));
        }
        if !self.sessions.insert(session.clone()).await {
            self.sessions.release(call_id).await;
            self.delete_room(&session.room_name).await;
            return Err(CallError::SessionNotFound);
        }

        self.schedule_ring_deadline(call_id);
        self.relay
            .send_to_user(
                caller_id,
                ServerEvent::CallInitiated(CallInitiated {
                    success: true,
                    call: session.clone(),
                    room_url: session.room_url.clone(),
                    caller: session.caller_id.clone(),
                    receiver: session.callee_id.clone(),
                }),
            )
            .await;
        self.relay
            .send_to_user(
                callee_id,
                ServerEvent::IncomingCall(IncomingCall {
                    call_id,
                    caller: session.caller_id.clone(),
                    receiver: session.callee_id.clone(),
                    call_type,
                    room_url: session.room_url.clone(),
                }),
            )
            .await;

        info!(call_id = %call_id, caller_id, callee_id, call_type = call_type.as_str(), "call initiated");
        Ok(session)
    }

    #[instrument(skip(self))]
    pub async fn accept(&self, call_id: CallId, user_id: &str) -> Result<CallSession, CallError> {
        let now = Utc::now();
        let session = self
            .sessions
            .update(call_id, |session| {
                if session.callee_id != user_id {
                    return Err(CallError::Unauthorized);
                }
                session.accept(now)?;
                Ok(session.clone())
            })
            .await
            .ok_or(CallError::SessionNotFound)??;

        self.ring_deadlines.cancel(&call_id);
        self.persist(&session).await;

        // the call may have been torn down while persisting
        if self.sessions.status(call_id).await != Some(CallStatus::Active) {
            debug!(call_id = %call_id, "call left active state before monitoring started");
            return Ok(session);
        }
        let target: Weak<dyn MonitorTarget> = self.me.clone();
        self.monitor.start(call_id, target);

        self.relay
            .send_to_user(
                &session.callee_id,
                ServerEvent::CallAcceptedConfirmed(CallAcceptedConfirmed {
                    call: session.clone(),
                    room_url: session.room_url.clone(),
                    caller: session.caller_id.clone(),
                }),
            )
            .await;
        self.relay
            .send_to_user(
                &session.caller_id,
                ServerEvent::CallAccepted(CallAccepted {
                    call_id,
                    room_url: session.room_url.clone(),
                    receiver: session.callee_id.clone(),
                }),
            )
            .await;

        info!(call_id = %call_id, "call accepted");
        Ok(session)
    }

    #[instrument(skip(self))]
    pub async fn reject(&self, call_id: CallId, user_id: &str) -> Result<CallSession, CallError> {
        self.terminate(call_id, user_id, EndReason::Rejected, |session| {
            if session.callee_id != user_id {
                return Err(CallError::Unauthorized);
            }
            ensure_ringing(session, CallStatus::Rejected)
        })
        .await
    }

    #[instrument(skip(self))]
    pub async fn end(&self, call_id: CallId, user_id: &str, reason: EndReason) -> Result<CallSession, CallError> {
        self.terminate(call_id, user_id, reason, |session| {
            if !session.involves(user_id) {
                return Err(CallError::Unauthorized);
            }
            Ok(())
        })
        .await
    }

    #[instrument(skip(self))]
    pub async fn timeout(&self, call_id: CallId, user_id: &str) -> Result<CallSession, CallError> {
        self.terminate(call_id, user_id, EndReason::Missed, |session| {
            if !session.involves(user_id) {
                return Err(CallError::Unauthorized);
            }
            ensure_ringing(session, CallStatus::Missed)
        })
        .await
    }

    /// Last-resort teardown driven by the call log rather than the cache.
    /// Never fails; every sub-step is reported instead.
    #[instrument(skip(self))]
    pub async fn force_cleanup(&self, call_id: CallId) -> CleanupReport {
        let mut report = CleanupReport::new(call_id);
        self.monitor.stop(call_id);
        self.ring_deadlines.cancel(&call_id);

        let persisted = match self.call_log.get(call_id).await {
            Ok(found) => {
                report.lookup = if found.is_some() {
                    StepOutcome::Done
                } else {
                    StepOutcome::Skipped("not in call log")
                };
                found
            }
            Err(err) => {
                report.lookup = StepOutcome::Failed(err.to_string());
                None
            }
        };
        let cached = self.sessions.remove(call_id).await;
        report.cache = if cached.is_some() {
            StepOutcome::Done
        } else {
            StepOutcome::Skipped("not cached")
        };

        let Some(mut session) = cached.or(persisted) else {
            report.log();
            return report;
        };
        if session.status.is_terminal() {
            report.persist = StepOutcome::Skipped("already terminal");
            report.log();
            return report;
        }
        if let Err(err) = session.finish(EndReason::ForceCleanup, Utc::now()) {
            report.persist = StepOutcome::Failed(err.to_string());
            report.log();
            return report;
        }

        match self.call_log.save(&session).await {
            Ok(true) => report.persist = StepOutcome::Done,
            Ok(false) => {
                // someone else already finished this call
                report.persist = StepOutcome::Skipped("call log already terminal");
                report.log();
                return report;
            }
            Err(err) => report.persist = StepOutcome::Failed(err.to_string()),
        }
        report.room = StepOutcome::from_result(self.rooms.delete_room(&session.room_name).await);
        report.summary = StepOutcome::from_result(
            self.conversations
                .append_call_summary(&CallSummary::from_session(&session))
                .await,
        );
        self.announce_auto_end(&session).await;
        report.log();
        report
    }

    #[instrument(skip(self))]
    pub async fn handle_disconnect(&self, user_id: &str) {
        let Some(session) = self.sessions.session_for_user(user_id).await else {
            return;
        };
        match self.end(session.call_id, user_id, EndReason::Disconnected).await {
            Ok(_) => info!(call_id = %session.call_id, user_id, "call ended by disconnect"),
            Err(CallError::SessionNotFound) => {}
            Err(err) => warn!(call_id = %session.call_id, user_id, error = %err, "disconnect teardown failed"),
        }
    }

    pub async fn active_call(&self, user_id: &str) -> Option<CallSession> {
        self.sessions.session_for_user(user_id).await
    }

    pub async fn call_status(&self, call_id: CallId, user_id: &str) -> Result<CallSession, CallError> {
        let session = match self.sessions.get(call_id).await {
            Some(session) => session,
            None => self.call_log.get(call_id).await?.ok_or(CallError::SessionNotFound)?,
        };
        if !session.involves(user_id) {
            return Err(CallError::Unauthorized);
        }
        Ok(session)
    }

    pub async fn history(
        &self,
        user_id: &str,
        page: Option<usize>,
        limit: Option<usize>,
    ) -> Result<CallHistoryResponse, CallError> {
        let page = page.unwrap_or(1).max(1);
        let limit = limit.unwrap_or(DEFAULT_HISTORY_LIMIT).clamp(1, MAX_HISTORY_LIMIT);
        let (calls, total) = self.call_log.history(user_id, page, limit).await?;
        Ok(CallHistoryResponse {
            calls,
            page,
            limit,
            total,
        })
    }

    pub async fn create_room(&self, name: Option<String>) -> Result<RoomInfo, CallError> {
        let name = match name.map(|n| n.trim().to_string()).filter(|n| !n.is_empty()) {
            Some(name) if !is_valid_room_name(&name) => {
                return Err(CallError::Validation(
                    "Room names may only contain letters, digits, '-' and '_'".to_string(),
                ))
            }
            Some(name) => name,
            None => format!("room-{}", Uuid::new_v4().simple()),
        };
        self.rooms
            .create_room(&name)
            .await
            .map_err(CallError::RoomAllocationFailed)
    }

    pub async fn live_calls(&self) -> usize {
        self.sessions.live_count().await
    }

    pub async fn shutdown(&self) {
        let grace = self.settings.shutdown_grace;
        self.monitor.shutdown(grace).await;
        self.ring_deadlines.drain(grace).await;
        info!("call service stopped");
    }

    async fn terminate(
        &self,
        call_id: CallId,
        acting_user: &str,
        reason: EndReason,
        check: impl FnOnce(&CallSession) -> Result<(), CallError>,
    ) -> Result<CallSession, CallError> {
        let claimed = self
            .sessions
            .claim(call_id, acting_user, check)
            .await?
            .ok_or(CallError::SessionNotFound)?;
        Ok(self.tear_down(claimed, acting_user, reason).await)
    }

    // Runs after the claim, so exactly once per call.
    async fn tear_down(&self, claimed: Claimed, acting_user: &str, reason: EndReason) -> CallSession {
        let Claimed {
            mut session,
            other_in_call,
        } = claimed;
        let call_id = session.call_id;
        self.monitor.stop(call_id);
        self.ring_deadlines.cancel(&call_id);

        let was_active = session.status == CallStatus::Active;
        if let Err(err) = session.finish(reason, Utc::now()) {
            warn!(call_id = %call_id, error = %err, "cached session was already terminal");
        }
        if !self.persist(&session).await {
            // force cleanup recorded this call first and owns the rest of the teardown
            info!(call_id = %call_id, reason = %reason, "call already finished elsewhere");
            return session;
        }

        if self.room_still_in_use(&session, acting_user, reason, other_in_call, was_active).await {
            debug!(call_id = %call_id, room = %session.room_name, "other party still in call, keeping room");
        } else {
            self.delete_room(&session.room_name).await;
        }

        if let Err(err) = self
            .conversations
            .append_call_summary(&CallSummary::from_session(&session))
            .await
        {
            warn!(call_id = %call_id, error = %err, "failed to append call summary");
        }

        self.announce_end(&session, acting_user, reason).await;
        info!(
            call_id = %call_id,
            reason = %reason,
            status = %session.status,
            duration_seconds = session.duration_seconds,
            "call ended"
        );
        session
    }

    // The room is kept only for an answered call whose other party is still
    // registered in it and still connected.
    async fn room_still_in_use(
        &self,
        session: &CallSession,
        acting_user: &str,
        reason: EndReason,
        other_in_call: bool,
        was_active: bool,
    ) -> bool {
        if reason.forces_room_deletion() || !other_in_call || !was_active {
            return false;
        }
        match session.other_party(acting_user) {
            Some(other) => self.presence.is_online(other).await,
            None => false,
        }
    }

    async fn announce_end(&self, session: &CallSession, ender: &str, reason: EndReason) {
        let other = session
            .other_party(ender)
            .cloned()
            .unwrap_or_else(|| session.callee_id.clone());
        match reason {
            EndReason::Rejected => {
                self.relay
                    .send_to_user(&session.callee_id, ServerEvent::CallRejectedConfirmed)
                    .await;
                self.relay
                    .send_to_user(
                        &session.caller_id,
                        ServerEvent::CallRejected(CallRejected {
                            call_id: session.call_id,
                            rejected_by: session.callee_id.clone(),
                            timestamp: session.end_time.unwrap_or_else(Utc::now),
                        }),
                    )
                    .await;
            }
            EndReason::Missed => {
                self.confirm_end(session, ender).await;
                self.relay
                    .send_to_user(
                        &other,
                        ServerEvent::CallMissed(CallMissed {
                            call_id: session.call_id,
                            missed_by: session.callee_id.clone(),
                        }),
                    )
                    .await;
            }
            EndReason::AutoDisconnect | EndReason::ForceCleanup => self.announce_auto_end(session).await,
            EndReason::Normal | EndReason::Disconnected | EndReason::Error => {
                self.confirm_end(session, ender).await;
                self.relay
                    .send_to_user(
                        &other,
                        ServerEvent::CallEnded(CallEnded {
                            call_id: session.call_id,
                            reason,
                            duration: session.duration_seconds,
                        }),
                    )
                    .await;
            }
        }
    }

    async fn confirm_end(&self, session: &CallSession, ender: &str) {
        self.relay
            .send_to_user(
                ender,
                ServerEvent::CallEndedConfirmed(CallEndedConfirmed {
                    call: session.clone(),
                }),
            )
            .await;
    }

    async fn announce_auto_end(&self, session: &CallSession) {
        let reason = session.end_reason.unwrap_or(EndReason::ForceCleanup);
        let message = match reason {
            EndReason::AutoDisconnect => "Call ended because the other participant left",
            _ => "Call ended due to a connection problem",
        };
        for user in [&session.caller_id, &session.callee_id] {
            self.relay
                .send_to_user(
                    user,
                    ServerEvent::CallAutoEnded(CallAutoEnded {
                        call_id: session.call_id,
                        reason,
                        message: message.to_string(),
                        duration: session.duration_seconds,
                    }),
                )
                .await;
        }
    }

    fn schedule_ring_deadline(&self, call_id: CallId) {
        let me = self.me.clone();
        let ring_timeout = self.settings.ring_timeout;
        self.ring_deadlines.schedule(call_id, async move {
            tokio::time::sleep(ring_timeout).await;
            if let Some(service) = me.upgrade() {
                tokio::spawn(async move { service.expire_ringing(call_id).await });
            }
        });
    }

    async fn expire_ringing(&self, call_id: CallId) {
        let Some(session) = self.sessions.get(call_id).await else {
            return;
        };
        match self.timeout(call_id, &session.caller_id).await {
            Ok(_) => info!(call_id = %call_id, "unanswered call expired"),
            Err(CallError::SessionNotFound | CallError::InvalidState(_)) => {}
            Err(err) => warn!(call_id = %call_id, error = %err, "ring deadline teardown failed"),
        }
    }

    // False only when the stored record is already further along. A failed
    // write is logged and the in-memory transition stands.
    async fn persist(&self, session: &CallSession) -> bool {
        match self.call_log.save(session).await {
            Ok(applied) => {
                if !applied {
                    debug!(call_id = %session.call_id, status = %session.status, "call log already further along");
                }
                applied
            }
            Err(err) => {
                warn!(call_id = %session.call_id, error = %err, "failed to persist call");
                true
            }
        }
    }

    async fn delete_room(&self, name: &str) {
        if let Err(err) = self.rooms.delete_room(name).await {
            warn!(room = %name, error = %err, "failed to delete room");
        }
    }
}

#[async_trait]
impl MonitorTarget for CallService {
    async fn active_room(&self, call_id: CallId) -> Option<String> {
        self.sessions
            .get(call_id)
            .await
            .filter(|session| session.status == CallStatus::Active)
            .map(|session| session.room_name)
    }

    async fn auto_end(&self, call_id: CallId) {
        let Some(party) = self.sessions.party_in_call(call_id).await else {
            self.force_cleanup(call_id).await;
            return;
        };
        match self.end(call_id, &party, EndReason::AutoDisconnect).await {
            Ok(_) | Err(CallError::SessionNotFound) => {}
            Err(err) => {
                warn!(call_id = %call_id, error = %err, "auto end failed, forcing cleanup");
                self.force_cleanup(call_id).await;
            }
        }
    }
}

fn ensure_ringing(session: &CallSession, to: CallStatus) -> Result<(), CallError> {
    if session.status != CallStatus::Ringing {
        return Err(TransitionError {
            from: session.status,
            to,
        }
        .into());
    }
    Ok(())
}

fn is_valid_room_name(name: &str) -> bool {
    name.len() <= 128 && name.chars().all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
}
