use crate::presence::PresenceRegistry;
use shared::events::{
    HangUp, PreOfferAnswerKind, RelayedPreOffer, RelayedPreOfferAnswer, ServerEvent, SignalPayload,
    WebRtcSignal, WebRtcSignalKind,
};
use shared::models::ConnectionId;
use std::sync::Arc;
use tracing::debug;

#[derive(Debug, Clone)]
pub enum SignalingMessage {
    PreOffer {
        from: ConnectionId,
        payload: SignalPayload,
    },
    PreOfferAnswer {
        from: ConnectionId,
        answer: PreOfferAnswerKind,
        payload: SignalPayload,
    },
    Offer {
        from: ConnectionId,
        payload: SignalPayload,
    },
    Answer {
        from: ConnectionId,
        payload: SignalPayload,
    },
    IceCandidate {
        from: ConnectionId,
        payload: SignalPayload,
    },
    End {
        from: ConnectionId,
        payload: SignalPayload,
    },
}

impl SignalingMessage {
    pub fn webrtc(from: ConnectionId, kind: WebRtcSignalKind, payload: SignalPayload) -> Self {
        match kind {
            WebRtcSignalKind::Offer => Self::Offer { from, payload },
            WebRtcSignalKind::Answer => Self::Answer { from, payload },
            WebRtcSignalKind::IceCandidate => Self::IceCandidate { from, payload },
        }
    }

    /// The frame the target receives. Sender addressing is rewritten so the
    /// recipient can reply to the originating connection.
    pub fn into_event(self) -> ServerEvent {
        match self {
            Self::PreOffer { from, payload } => ServerEvent::PreOffer(RelayedPreOffer {
                caller: from,
                payload,
            }),
            Self::PreOfferAnswer {
                from,
                answer,
                payload,
            } => ServerEvent::PreOfferAnswer(RelayedPreOfferAnswer {
                callee: Some(from),
                answer,
                payload,
            }),
            Self::Offer { from, payload } => webrtc_event(from, WebRtcSignalKind::Offer, payload),
            Self::Answer { from, payload } => webrtc_event(from, WebRtcSignalKind::Answer, payload),
            Self::IceCandidate { from, payload } => {
                webrtc_event(from, WebRtcSignalKind::IceCandidate, payload)
            }
            Self::End { from, payload } => ServerEvent::UserHangedUp(HangUp { peer: from, payload }),
        }
    }
}

fn webrtc_event(from: ConnectionId, kind: WebRtcSignalKind, payload: SignalPayload) -> ServerEvent {
    ServerEvent::WebRtcSignaling(WebRtcSignal {
        peer: from,
        kind,
        payload,
    })
}

/// Forwards events to whoever is currently reachable. Absent targets are
/// dropped silently; callers that care check the returned flag.
#[derive(Debug, Clone)]
pub struct SignalingRelay {
    presence: Arc<PresenceRegistry>,
}

impl SignalingRelay {
    pub fn new(presence: Arc<PresenceRegistry>) -> Self {
        Self { presence }
    }

    pub async fn send_to_user(&self, user_id: &str, event: ServerEvent) -> bool {
        match self.presence.lookup(user_id).await {
            Some(handle) => handle.send(event),
            None => {
                debug!(user_id, event = event.name(), "dropping event for absent user");
                false
            }
        }
    }

    pub async fn send_to_connection(&self, connection_id: ConnectionId, event: ServerEvent) -> bool {
        match self.presence.connection(connection_id).await {
            Some(handle) => handle.send(event),
            None => {
                debug!(connection_id = %connection_id, event = event.name(), "dropping event for absent connection");
                false
            }
        }
    }

    pub async fn relay(&self, target: ConnectionId, message: SignalingMessage) -> bool {
        self.send_to_connection(target, message.into_event()).await
    }
}
