use shared::events::ServerEvent;
use shared::models::{ConnectionId, UserId};
use std::collections::HashMap;
use tokio::sync::{mpsc, RwLock};
use tracing::debug;
use uuid::Uuid;

#[derive(Debug, Clone)]
pub struct ConnectionHandle {
    id: ConnectionId,
    outbound: mpsc::UnboundedSender<ServerEvent>,
}

impl ConnectionHandle {
    pub fn new(outbound: mpsc::UnboundedSender<ServerEvent>) -> Self {
        Self {
            id: Uuid::new_v4(),
            outbound,
        }
    }

    pub fn id(&self) -> ConnectionId {
        self.id
    }

    pub fn send(&self, event: ServerEvent) -> bool {
        self.outbound.send(event).is_ok()
    }
}

#[derive(Debug, Default)]
struct PresenceMaps {
    by_user: HashMap<UserId, ConnectionHandle>,
    by_connection: HashMap<ConnectionId, UserId>,
}

/// One handle per user; the most recent registration wins.
#[derive(Debug, Default)]
pub struct PresenceRegistry {
    maps: RwLock<PresenceMaps>,
}

impl PresenceRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn register(&self, user_id: UserId, handle: ConnectionHandle) {
        let mut maps = self.maps.write().await;
        // a connection re-announcing as another user drops its old identity
        if let Some(previous_user) = maps.by_connection.remove(&handle.id()) {
            if previous_user != user_id {
                maps.by_user.remove(&previous_user);
            }
        }
        if let Some(replaced) = maps.by_user.insert(user_id.clone(), handle.clone()) {
            if replaced.id() != handle.id() {
                maps.by_connection.remove(&replaced.id());
                debug!(user_id = %user_id, replaced = %replaced.id(), "presence handle replaced");
            }
        }
        maps.by_connection.insert(handle.id(), user_id);
    }

    /// Drops whatever user currently maps to `connection_id`. Returns that user
    /// only if this connection was still their current handle.
    pub async fn unregister(&self, connection_id: ConnectionId) -> Option<UserId> {
        let mut maps = self.maps.write().await;
        let user_id = maps.by_connection.remove(&connection_id)?;
        match maps.by_user.get(&user_id) {
            Some(current) if current.id() == connection_id => {
                maps.by_user.remove(&user_id);
                Some(user_id)
            }
            _ => None,
        }
    }

    pub async fn lookup(&self, user_id: &str) -> Option<ConnectionHandle> {
        self.maps.read().await.by_user.get(user_id).cloned()
    }

    pub async fn lookup_by_handle(&self, connection_id: ConnectionId) -> Option<UserId> {
        self.maps.read().await.by_connection.get(&connection_id).cloned()
    }

    pub async fn connection(&self, connection_id: ConnectionId) -> Option<ConnectionHandle> {
        let maps = self.maps.read().await;
        let user_id = maps.by_connection.get(&connection_id)?;
        maps.by_user.get(user_id).cloned()
    }

    pub async fn is_online(&self, user_id: &str) -> bool {
        self.maps.read().await.by_user.contains_key(user_id)
    }

    pub async fn online_count(&self) -> usize {
        self.maps.read().await.by_user.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn handle() -> (ConnectionHandle, mpsc::UnboundedReceiver<ServerEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (ConnectionHandle::new(tx), rx)
    }

    #[tokio::test]
    async fn register_and_lookup() {
        let registry = PresenceRegistry::new();
        let (conn, _rx) = handle();
        registry.register("alice".to_string(), conn.clone()).await;

        assert_eq!(registry.lookup("alice").await.map(|h| h.id()), Some(conn.id()));
        assert_eq!(registry.lookup_by_handle(conn.id()).await.as_deref(), Some("alice"));
        assert!(registry.lookup("bob").await.is_none());
    }

    #[tokio::test]
    async fn last_registration_wins() {
        let registry = PresenceRegistry::new();
        let (first, _rx1) = handle();
        let (second, _rx2) = handle();
        registry.register("alice".to_string(), first.clone()).await;
        registry.register("alice".to_string(), second.clone()).await;

        assert_eq!(registry.lookup("alice").await.map(|h| h.id()), Some(second.id()));
        assert!(registry.lookup_by_handle(first.id()).await.is_none());
        assert_eq!(registry.online_count().await, 1);
    }

    #[tokio::test]
    async fn stale_handle_unregister_is_noop() {
        let registry = PresenceRegistry::new();
        let (old, _rx1) = handle();
        let (new, _rx2) = handle();
        registry.register("alice".to_string(), old.clone()).await;
        registry.register("alice".to_string(), new.clone()).await;

        assert_eq!(registry.unregister(old.id()).await, None);
        assert!(registry.is_online("alice").await);

        assert_eq!(registry.unregister(new.id()).await.as_deref(), Some("alice"));
        assert!(!registry.is_online("alice").await);
    }

    #[tokio::test]
    async fn register_is_idempotent() {
        let registry = PresenceRegistry::new();
        let (conn, _rx) = handle();
        registry.register("alice".to_string(), conn.clone()).await;
        registry.register("alice".to_string(), conn.clone()).await;

        assert_eq!(registry.online_count().await, 1);
        assert_eq!(registry.unregister(conn.id()).await.as_deref(), Some("alice"));
    }

    #[tokio::test]
    async fn handle_reports_closed_socket() {
        let (conn, rx) = handle();
        drop(rx);
        assert!(!conn.send(ServerEvent::error("gone")));
    }
}
