//! Fakes shared by the service, router and server tests.

use crate::config::CallSettings;
use crate::presence::{ConnectionHandle, PresenceRegistry};
use crate::repository::memory_repository::{InMemoryCallLog, InMemoryConversations, InMemoryDirectory};
use crate::repository::CallLogStore;
use crate::services::call_service::{CallService, CallServiceDeps};
use crate::services::room_provider::{RoomProvider, RoomProviderError};
use async_trait::async_trait;
use shared::events::ServerEvent;
use shared::models::{CallId, CallSession, RoomInfo};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;

#[derive(Default)]
struct FakeRoomState {
    rooms: HashMap<String, u32>,
    created: usize,
    deleted: Vec<String>,
    polls: usize,
    fail_create: bool,
    fail_delete: bool,
}

/// Room provider with failure injection. New rooms report two participants.
#[derive(Default)]
pub struct FakeRooms {
    state: Mutex<FakeRoomState>,
}

impl FakeRooms {
    fn state(&self) -> std::sync::MutexGuard<'_, FakeRoomState> {
        self.state.lock().unwrap()
    }

    pub fn fail_create(&self, fail: bool) {
        self.state().fail_create = fail;
    }

    pub fn fail_delete(&self, fail: bool) {
        self.state().fail_delete = fail;
    }

    pub fn set_count(&self, name: &str, count: u32) {
        self.state().rooms.insert(name.to_string(), count);
    }

    pub fn remove(&self, name: &str) {
        self.state().rooms.remove(name);
    }

    pub fn created(&self) -> usize {
        self.state().created
    }

    pub fn deleted(&self) -> Vec<String> {
        self.state().deleted.clone()
    }

    pub fn polls(&self) -> usize {
        self.state().polls
    }
}

fn unavailable() -> RoomProviderError {
    RoomProviderError::Status {
        status: 503,
        body: "unavailable".to_string(),
    }
}

#[async_trait]
impl RoomProvider for FakeRooms {
    async fn create_room(&self, name: &str) -> Result<RoomInfo, RoomProviderError> {
        let mut state = self.state();
        if state.fail_create {
            return Err(unavailable());
        }
        state.created += 1;
        state.rooms.insert(name.to_string(), 2);
        Ok(RoomInfo {
            name: name.to_string(),
            url: format!("https://rooms.test/{name}"),
        })
    }

    async fn delete_room(&self, name: &str) -> Result<(), RoomProviderError> {
        let mut state = self.state();
        if state.fail_delete {
            return Err(unavailable());
        }
        state.rooms.remove(name);
        state.deleted.push(name.to_string());
        Ok(())
    }

    async fn participant_count(&self, name: &str) -> Result<u32, RoomProviderError> {
        let mut state = self.state();
        state.polls += 1;
        state
            .rooms
            .get(name)
            .copied()
            .ok_or_else(|| RoomProviderError::NotFound(name.to_string()))
    }
}

/// A connected client whose outbound frames are recorded.
pub struct TestClient {
    pub handle: ConnectionHandle,
    rx: mpsc::UnboundedReceiver<ServerEvent>,
}

impl TestClient {
    pub fn new() -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        Self {
            handle: ConnectionHandle::new(tx),
            rx,
        }
    }

    /// Everything delivered since the last call.
    pub fn events(&mut self) -> Vec<ServerEvent> {
        let mut events = Vec::new();
        while let Ok(event) = self.rx.try_recv() {
            events.push(event);
        }
        events
    }
}

pub fn names(events: &[ServerEvent]) -> Vec<&'static str> {
    events.iter().map(ServerEvent::name).collect()
}

pub struct Harness {
    pub service: Arc<CallService>,
    pub presence: Arc<PresenceRegistry>,
    pub rooms: Arc<FakeRooms>,
    pub call_log: Arc<InMemoryCallLog>,
    pub conversations: Arc<InMemoryConversations>,
}

impl Harness {
    /// alice, bob and carol all know each other; carol also knows dave.
    pub fn new() -> Self {
        Self::with_settings(CallSettings::default())
    }

    pub fn with_settings(settings: CallSettings) -> Self {
        let call_log = Arc::new(InMemoryCallLog::new());
        Self::build(settings, call_log.clone(), call_log)
    }

    /// The service writes through `store`; `call_log` is what the test inspects.
    pub fn with_call_log(call_log: Arc<InMemoryCallLog>, store: Arc<dyn CallLogStore>) -> Self {
        Self::build(CallSettings::default(), call_log, store)
    }

    fn build(settings: CallSettings, call_log: Arc<InMemoryCallLog>, store: Arc<dyn CallLogStore>) -> Self {
        let presence = Arc::new(PresenceRegistry::new());
        let rooms = Arc::new(FakeRooms::default());
        let conversations = Arc::new(InMemoryConversations::new());
        let directory = Arc::new(InMemoryDirectory::with_pairs(
            [("alice", "bob"), ("alice", "carol"), ("bob", "carol"), ("carol", "dave")]
                .map(|(a, b)| (a.to_string(), b.to_string())),
        ));
        let service = CallService::new(
            CallServiceDeps {
                presence: presence.clone(),
                rooms: rooms.clone(),
                call_log: store,
                directory,
                conversations: conversations.clone(),
            },
            settings,
        );
        Self {
            service,
            presence,
            rooms,
            call_log,
            conversations,
        }
    }

    pub async fn connect(&self, user_id: &str) -> TestClient {
        let client = TestClient::new();
        self.presence.register(user_id.to_string(), client.handle.clone()).await;
        client
    }

    pub async fn call_log_entry(&self, call_id: CallId) -> CallSession {
        self.call_log.get(call_id).await.unwrap().unwrap()
    }
}
