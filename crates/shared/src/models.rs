use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;
use uuid::Uuid;

pub type UserId = String;
pub type CallId = Uuid;
pub type ConnectionId = Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CallType {
    Audio,
    Video,
}

impl CallType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Audio => "audio",
            Self::Video => "video",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CallStatus {
    Ringing,
    Active,
    Ended,
    Rejected,
    Missed,
}

impl CallStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Ringing => "ringing",
            Self::Active => "active",
            Self::Ended => "ended",
            Self::Rejected => "rejected",
            Self::Missed => "missed",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Ended | Self::Rejected | Self::Missed)
    }

    /// Position in the one-way lifecycle. Persisted records never move backwards.
    pub fn rank(&self) -> u8 {
        match self {
            Self::Ringing => 0,
            Self::Active => 1,
            Self::Ended | Self::Rejected | Self::Missed => 2,
        }
    }
}

impl fmt::Display for CallStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EndReason {
    Normal,
    Rejected,
    Missed,
    Disconnected,
    AutoDisconnect,
    ForceCleanup,
    Error,
}

impl EndReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Normal => "normal",
            Self::Rejected => "rejected",
            Self::Missed => "missed",
            Self::Disconnected => "disconnected",
            Self::AutoDisconnect => "auto_disconnect",
            Self::ForceCleanup => "force_cleanup",
            Self::Error => "error",
        }
    }

    pub fn terminal_status(&self) -> CallStatus {
        match self {
            Self::Rejected => CallStatus::Rejected,
            Self::Missed => CallStatus::Missed,
            _ => CallStatus::Ended,
        }
    }

    /// Reasons after which the hosted room is deleted even if the other party
    /// is still registered in a call.
    pub fn forces_room_deletion(&self) -> bool {
        matches!(
            self,
            Self::Rejected | Self::Missed | Self::Disconnected | Self::AutoDisconnect
        )
    }

    pub fn is_client_selectable(&self) -> bool {
        matches!(self, Self::Normal | Self::Error)
    }
}

impl fmt::Display for EndReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
#[error("cannot move call from {from} to {to}")]
pub struct TransitionError {
    pub from: CallStatus,
    pub to: CallStatus,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CallSession {
    pub call_id: CallId,
    pub caller_id: UserId,
    pub callee_id: UserId,
    pub call_type: CallType,
    pub status: CallStatus,
    pub room_name: String,
    pub room_url: String,
    pub start_time: DateTime<Utc>,
    pub accepted_at: Option<DateTime<Utc>>,
    pub end_time: Option<DateTime<Utc>>,
    #[serde(default)]
    pub duration_seconds: u64,
    pub end_reason: Option<EndReason>,
}

impl CallSession {
    pub fn ringing(
        call_id: CallId,
        caller_id: UserId,
        callee_id: UserId,
        call_type: CallType,
        room: RoomInfo,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            call_id,
            caller_id,
            callee_id,
            call_type,
            status: CallStatus::Ringing,
            room_name: room.name,
            room_url: room.url,
            start_time: now,
            accepted_at: None,
            end_time: None,
            duration_seconds: 0,
            end_reason: None,
        }
    }

    pub fn involves(&self, user_id: &str) -> bool {
        self.caller_id == user_id || self.callee_id == user_id
    }

    pub fn other_party(&self, user_id: &str) -> Option<&UserId> {
        if self.caller_id == user_id {
            Some(&self.callee_id)
        } else if self.callee_id == user_id {
            Some(&self.caller_id)
        } else {
            None
        }
    }

    pub fn accept(&mut self, now: DateTime<Utc>) -> Result<(), TransitionError> {
        if self.status != CallStatus::Ringing {
            return Err(TransitionError {
                from: self.status,
                to: CallStatus::Active,
            });
        }
        self.status = CallStatus::Active;
        self.accepted_at = Some(now);
        Ok(())
    }

    /// Moves a live session into the terminal state implied by `reason` and
    /// fixes its duration. Terminal sessions are absorbing.
    pub fn finish(&mut self, reason: EndReason, now: DateTime<Utc>) -> Result<(), TransitionError> {
        let to = reason.terminal_status();
        if self.status.is_terminal() {
            return Err(TransitionError { from: self.status, to });
        }
        self.status = to;
        self.end_reason = Some(reason);
        self.end_time = Some(now);
        self.duration_seconds = self
            .accepted_at
            .map(|accepted| (now - accepted).num_seconds().max(0) as u64)
            .unwrap_or(0);
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RoomInfo {
    pub name: String,
    pub url: String,
}

// ---------- Call History Models ----------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CallHistoryQuery {
    pub page: Option<usize>,
    pub limit: Option<usize>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CallHistoryResponse {
    pub calls: Vec<CallSession>,
    pub page: usize,
    pub limit: usize,
    pub total: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ActiveCallResponse {
    pub call: Option<CallSession>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RoomCreateRequest {
    #[serde(default)]
    pub name: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StartCallRequest {
    pub receiver_id: UserId,
    pub call_type: CallType,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InitiateCallResponse {
    pub success: bool,
    pub call: CallSession,
    pub room_url: String,
}
