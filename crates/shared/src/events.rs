//! Real-time event surface. Every frame is a JSON object of the form
//! `{ "event": <name>, "data": { ... } }`.

use crate::models::{CallId, CallSession, CallType, ConnectionId, EndReason, UserId};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Opaque negotiation fields carried through the relay untouched.
pub type SignalPayload = Map<String, Value>;

// ---------- Client -> Server ----------

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "event", content = "data")]
pub enum ClientEvent {
    #[serde(rename = "new_user_connect")]
    NewUserConnect(NewUserConnect),
    #[serde(rename = "initiate_call")]
    InitiateCall(InitiateCallRequest),
    #[serde(rename = "accept_call")]
    AcceptCall(CallActionRequest),
    #[serde(rename = "reject_call")]
    RejectCall(CallActionRequest),
    #[serde(rename = "end_call")]
    EndCall(EndCallRequest),
    #[serde(rename = "call_timeout")]
    CallTimeout(CallActionRequest),
    #[serde(rename = "pre-offer-single")]
    PreOffer(PreOffer),
    #[serde(rename = "pre-offer-single-answer")]
    PreOfferAnswer(PreOfferAnswer),
    #[serde(rename = "webRTC-signaling")]
    WebRtcSignaling(WebRtcSignal),
    #[serde(rename = "end-call")]
    HangUp(HangUp),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NewUserConnect {
    pub user_id: UserId,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InitiateCallRequest {
    pub caller_id: UserId,
    pub receiver_id: UserId,
    pub call_type: CallType,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CallActionRequest {
    pub call_id: CallId,
    pub user_id: UserId,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EndCallRequest {
    pub call_id: CallId,
    pub user_id: UserId,
    #[serde(default)]
    pub reason: Option<EndReason>,
}

impl EndCallRequest {
    /// Clients may only end a call as `normal` or `error`.
    pub fn effective_reason(&self) -> EndReason {
        self.reason
            .filter(EndReason::is_client_selectable)
            .unwrap_or(EndReason::Normal)
    }
}

// ---------- Peer negotiation (relayed, never interpreted) ----------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PreOfferAnswerKind {
    CallAccepted,
    CallRejected,
    CallUnavailable,
    CalleeNotFound,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum WebRtcSignalKind {
    Offer,
    Answer,
    IceCandidate,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PreOffer {
    #[serde(rename = "calleePersonalCode")]
    pub callee: ConnectionId,
    #[serde(flatten)]
    pub payload: SignalPayload,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PreOfferAnswer {
    #[serde(rename = "callerSocketId")]
    pub caller: ConnectionId,
    #[serde(rename = "preOfferAnswer")]
    pub answer: PreOfferAnswerKind,
    #[serde(flatten)]
    pub payload: SignalPayload,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WebRtcSignal {
    #[serde(rename = "connectedUserSocketId")]
    pub peer: ConnectionId,
    #[serde(rename = "type")]
    pub kind: WebRtcSignalKind,
    #[serde(flatten)]
    pub payload: SignalPayload,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HangUp {
    #[serde(rename = "connectedUserSocketId")]
    pub peer: ConnectionId,
    #[serde(flatten)]
    pub payload: SignalPayload,
}

// ---------- Server -> Client ----------

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "event", content = "data")]
pub enum ServerEvent {
    #[serde(rename = "connection_ready")]
    ConnectionReady(ConnectionReady),
    #[serde(rename = "call_initiated")]
    CallInitiated(CallInitiated),
    #[serde(rename = "incoming_call")]
    IncomingCall(IncomingCall),
    #[serde(rename = "call_accepted_confirmed")]
    CallAcceptedConfirmed(CallAcceptedConfirmed),
    #[serde(rename = "call_accepted")]
    CallAccepted(CallAccepted),
    #[serde(rename = "call_rejected_confirmed")]
    CallRejectedConfirmed,
    #[serde(rename = "call_rejected")]
    CallRejected(CallRejected),
    #[serde(rename = "call_ended_confirmed")]
    CallEndedConfirmed(CallEndedConfirmed),
    #[serde(rename = "call_ended")]
    CallEnded(CallEnded),
    #[serde(rename = "call_auto_ended")]
    CallAutoEnded(CallAutoEnded),
    #[serde(rename = "call_missed")]
    CallMissed(CallMissed),
    #[serde(rename = "call_error")]
    CallError(CallErrorEvent),
    #[serde(rename = "pre-offer-single")]
    PreOffer(RelayedPreOffer),
    #[serde(rename = "pre-offer-single-answer")]
    PreOfferAnswer(RelayedPreOfferAnswer),
    #[serde(rename = "webRTC-signaling")]
    WebRtcSignaling(WebRtcSignal),
    #[serde(rename = "user-hanged-up")]
    UserHangedUp(HangUp),
}

impl ServerEvent {
    pub fn error(message: impl Into<String>) -> Self {
        Self::CallError(CallErrorEvent {
            success: false,
            message: message.into(),
        })
    }

    pub fn name(&self) -> &'static str {
        match self {
            Self::ConnectionReady(_) => "connection_ready",
            Self::CallInitiated(_) => "call_initiated",
            Self::IncomingCall(_) => "incoming_call",
            Self::CallAcceptedConfirmed(_) => "call_accepted_confirmed",
            Self::CallAccepted(_) => "call_accepted",
            Self::CallRejectedConfirmed => "call_rejected_confirmed",
            Self::CallRejected(_) => "call_rejected",
            Self::CallEndedConfirmed(_) => "call_ended_confirmed",
            Self::CallEnded(_) => "call_ended",
            Self::CallAutoEnded(_) => "call_auto_ended",
            Self::CallMissed(_) => "call_missed",
            Self::CallError(_) => "call_error",
            Self::PreOffer(_) => "pre-offer-single",
            Self::PreOfferAnswer(_) => "pre-offer-single-answer",
            Self::WebRtcSignaling(_) => "webRTC-signaling",
            Self::UserHangedUp(_) => "user-hanged-up",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectionReady {
    pub connection_id: ConnectionId,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CallInitiated {
    pub success: bool,
    pub call: CallSession,
    pub room_url: String,
    pub caller: UserId,
    pub receiver: UserId,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IncomingCall {
    pub call_id: CallId,
    pub caller: UserId,
    pub receiver: UserId,
    pub call_type: CallType,
    pub room_url: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CallAcceptedConfirmed {
    pub call: CallSession,
    pub room_url: String,
    pub caller: UserId,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CallAccepted {
    pub call_id: CallId,
    pub room_url: String,
    pub receiver: UserId,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CallRejected {
    pub call_id: CallId,
    pub rejected_by: UserId,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CallEndedConfirmed {
    pub call: CallSession,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CallEnded {
    pub call_id: CallId,
    pub reason: EndReason,
    pub duration: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CallAutoEnded {
    pub call_id: CallId,
    pub reason: EndReason,
    pub message: String,
    pub duration: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CallMissed {
    pub call_id: CallId,
    pub missed_by: UserId,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CallErrorEvent {
    pub success: bool,
    pub message: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RelayedPreOffer {
    #[serde(rename = "callerSocketId")]
    pub caller: ConnectionId,
    #[serde(flatten)]
    pub payload: SignalPayload,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RelayedPreOfferAnswer {
    #[serde(rename = "calleeSocketId", skip_serializing_if = "Option::is_none")]
    pub callee: Option<ConnectionId>,
    #[serde(rename = "preOfferAnswer")]
    pub answer: PreOfferAnswerKind,
    #[serde(flatten)]
    pub payload: SignalPayload,
}
