use crate::presence::{ConnectionHandle, PresenceRegistry};
use crate::relay::{SignalingMessage, SignalingRelay};
use crate::services::call_service::{CallError, CallService};
use shared::events::{
    ClientEvent, PreOffer, PreOfferAnswerKind, RelayedPreOfferAnswer, ServerEvent, SignalPayload,
};
use shared::models::{ConnectionId, UserId};
use std::sync::Arc;
use tracing::{debug, info};

#[derive(Clone)]
pub struct EventRouter {
    service: Arc<CallService>,
    presence: Arc<PresenceRegistry>,
    relay: SignalingRelay,
}

impl EventRouter {
    pub fn new(service: Arc<CallService>, presence: Arc<PresenceRegistry>) -> Self {
        Self {
            service,
            relay: SignalingRelay::new(presence.clone()),
            presence,
        }
    }

    pub async fn dispatch(&self, conn: &ConnectionHandle, event: ClientEvent) {
        if let Err(err) = self.handle(conn, event).await {
            debug!(connection_id = %conn.id(), error = %err, "request failed");
            conn.send(ServerEvent::error(err.to_string()));
        }
    }

    async fn handle(&self, conn: &ConnectionHandle, event: ClientEvent) -> Result<(), CallError> {
        match event {
            ClientEvent::NewUserConnect(req) => {
                self.presence.register(req.user_id.clone(), conn.clone()).await;
                info!(user_id = %req.user_id, connection_id = %conn.id(), "user connected");
            }
            ClientEvent::InitiateCall(req) => {
                self.acting_user(conn, &req.caller_id).await?;
                self.service
                    .initiate(&req.caller_id, &req.receiver_id, req.call_type)
                    .await?;
            }
            ClientEvent::AcceptCall(req) => {
                self.acting_user(conn, &req.user_id).await?;
                self.service.accept(req.call_id, &req.user_id).await?;
            }
            ClientEvent::RejectCall(req) => {
                self.acting_user(conn, &req.user_id).await?;
                self.service.reject(req.call_id, &req.user_id).await?;
            }
            ClientEvent::EndCall(req) => {
                self.acting_user(conn, &req.user_id).await?;
                self.service
                    .end(req.call_id, &req.user_id, req.effective_reason())
                    .await?;
            }
            ClientEvent::CallTimeout(req) => {
                self.acting_user(conn, &req.user_id).await?;
                self.service.timeout(req.call_id, &req.user_id).await?;
            }
            ClientEvent::PreOffer(offer) => self.pre_offer(conn, offer).await,
            ClientEvent::PreOfferAnswer(answer) => {
                let message = SignalingMessage::PreOfferAnswer {
                    from: conn.id(),
                    answer: answer.answer,
                    payload: answer.payload,
                };
                self.relay.relay(answer.caller, message).await;
            }
            ClientEvent::WebRtcSignaling(signal) => {
                let message = SignalingMessage::webrtc(conn.id(), signal.kind, signal.payload);
                self.relay.relay(signal.peer, message).await;
            }
            ClientEvent::HangUp(hang_up) => {
                let message = SignalingMessage::End {
                    from: conn.id(),
                    payload: hang_up.payload,
                };
                self.relay.relay(hang_up.peer, message).await;
            }
        }
        Ok(())
    }

    /// Presence removal plus teardown of the user's live call, if this was
    /// still their current connection.
    pub async fn disconnect(&self, connection_id: ConnectionId) -> Option<UserId> {
        let user_id = self.presence.unregister(connection_id).await?;
        info!(user_id = %user_id, connection_id = %connection_id, "user disconnected");
        self.service.handle_disconnect(&user_id).await;
        Some(user_id)
    }

    // A connection may only act as the user it registered as.
    async fn acting_user(&self, conn: &ConnectionHandle, claimed: &str) -> Result<(), CallError> {
        match self.presence.lookup_by_handle(conn.id()).await {
            Some(user_id) if user_id == claimed => Ok(()),
            _ => Err(CallError::Unauthorized),
        }
    }

    async fn pre_offer(&self, conn: &ConnectionHandle, offer: PreOffer) {
        let message = SignalingMessage::PreOffer {
            from: conn.id(),
            payload: offer.payload,
        };
        if !self.relay.relay(offer.callee, message).await {
            conn.send(ServerEvent::PreOfferAnswer(RelayedPreOfferAnswer {
                callee: None,
                answer: PreOfferAnswerKind::CalleeNotFound,
                payload: SignalPayload::new(),
            }));
        }
    }
}
