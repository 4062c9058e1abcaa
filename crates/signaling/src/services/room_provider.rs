use crate::config::RoomProviderConfig;
use async_trait::async_trait;
use chrono::Utc;
use reqwest::StatusCode;
use serde::{Deserialize, Serialize};
use shared::models::{CallId, RoomInfo};
use std::collections::HashMap;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::RwLock;
use tracing::debug;

#[derive(Debug, Error)]
pub enum RoomProviderError {
    #[error("room provider request failed: {0}")]
    Http(#[from] reqwest::Error),
    #[error("room provider returned {status}: {body}")]
    Status { status: u16, body: String },
    #[error("room {0} not found")]
    NotFound(String),
}

#[async_trait]
pub trait RoomProvider: Send + Sync {
    async fn create_room(&self, name: &str) -> Result<RoomInfo, RoomProviderError>;
    /// Deleting a room that no longer exists succeeds.
    async fn delete_room(&self, name: &str) -> Result<(), RoomProviderError>;
    async fn participant_count(&self, name: &str) -> Result<u32, RoomProviderError>;
}

pub fn room_name_for(call_id: CallId) -> String {
    format!("call-{}", call_id.simple())
}

#[derive(Debug, Serialize)]
struct CreateRoomRequest<'a> {
    name: &'a str,
    privacy: &'static str,
    properties: RoomProperties,
}

#[derive(Debug, Serialize)]
struct RoomProperties {
    exp: i64,
}

#[derive(Debug, Deserialize)]
struct CreateRoomResponse {
    name: String,
    url: String,
}

#[derive(Debug, Deserialize)]
struct PresenceResponse {
    total_count: u32,
}

#[derive(Debug, Clone)]
pub struct HttpRoomProvider {
    client: reqwest::Client,
    base_url: String,
    api_key: Option<String>,
    room_ttl: Duration,
}

impl HttpRoomProvider {
    pub fn new(base_url: impl Into<String>, config: &RoomProviderConfig) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(config.request_timeout)
            .build()?;
        Ok(Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            api_key: config.api_key.clone(),
            room_ttl: config.room_ttl,
        })
    }

    fn authorized(&self, request: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        match &self.api_key {
            Some(key) => request.bearer_auth(key),
            None => request,
        }
    }

    fn room_url(&self, name: &str) -> String {
        format!("{}/rooms/{}", self.base_url, name)
    }
}

async fn status_error(response: reqwest::Response) -> RoomProviderError {
    let status = response.status().as_u16();
    let body = response.text().await.unwrap_or_default();
    RoomProviderError::Status { status, body }
}

#[async_trait]
impl RoomProvider for HttpRoomProvider {
    async fn create_room(&self, name: &str) -> Result<RoomInfo, RoomProviderError> {
        let ttl_secs = i64::try_from(self.room_ttl.as_secs()).unwrap_or(i64::MAX / 2);
        let body = CreateRoomRequest {
            name,
            privacy: "public",
            properties: RoomProperties {
                exp: Utc::now().timestamp() + ttl_secs,
            },
        };
        let response = self
            .authorized(self.client.post(format!("{}/rooms", self.base_url)))
            .json(&body)
            .send()
            .await?;
        if !response.status().is_success() {
            return Err(status_error(response).await);
        }
        let created: CreateRoomResponse = response.json().await?;
        debug!(room = %created.name, "hosted room created");
        Ok(RoomInfo {
            name: created.name,
            url: created.url,
        })
    }

    async fn delete_room(&self, name: &str) -> Result<(), RoomProviderError> {
        let response = self
            .authorized(self.client.delete(self.room_url(name)))
            .send()
            .await?;
        match response.status() {
            status if status.is_success() => Ok(()),
            StatusCode::NOT_FOUND => Ok(()),
            _ => Err(status_error(response).await),
        }
    }

    async fn participant_count(&self, name: &str) -> Result<u32, RoomProviderError> {
        let response = self
            .authorized(self.client.get(format!("{}/presence", self.room_url(name))))
            .send()
            .await?;
        match response.status() {
            status if status.is_success() => Ok(response.json::<PresenceResponse>().await?.total_count),
            StatusCode::NOT_FOUND => Err(RoomProviderError::NotFound(name.to_string())),
            _ => Err(status_error(response).await),
        }
    }
}

/// In-process stand-in used when no hosted provider is configured. Rooms
/// report `default_participants` until told otherwise.
#[derive(Debug)]
pub struct LocalRoomProvider {
    base_url: String,
    default_participants: u32,
    rooms: RwLock<HashMap<String, u32>>,
}

impl LocalRoomProvider {
    pub fn new(base_url: impl Into<String>, default_participants: u32) -> Self {
        Self {
            base_url: base_url.into().trim_end_matches('/').to_string(),
            default_participants,
            rooms: RwLock::new(HashMap::new()),
        }
    }

    pub async fn set_participant_count(&self, name: &str, count: u32) -> bool {
        match self.rooms.write().await.get_mut(name) {
            Some(current) => {
                *current = count;
                true
            }
            None => false,
        }
    }

    pub async fn exists(&self, name: &str) -> bool {
        self.rooms.read().await.contains_key(name)
    }
}

#[async_trait]
impl RoomProvider for LocalRoomProvider {
    async fn create_room(&self, name: &str) -> Result<RoomInfo, RoomProviderError> {
        self.rooms
            .write()
            .await
            .insert(name.to_string(), self.default_participants);
        Ok(RoomInfo {
            name: name.to_string(),
            url: format!("{}/rooms/{}", self.base_url, name),
        })
    }

    async fn delete_room(&self, name: &str) -> Result<(), RoomProviderError> {
        self.rooms.write().await.remove(name);
        Ok(())
    }

    async fn participant_count(&self, name: &str) -> Result<u32, RoomProviderError> {
        self.rooms
            .read()
            .await
            .get(name)
            .copied()
            .ok_or_else(|| RoomProviderError::NotFound(name.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::{
        extract::Path,
        http::{HeaderMap, StatusCode as AxumStatus},
        routing::{get, post},
        Json, Router,
    };
    use serde_json::{json, Value};
    use tokio::net::TcpListener;
    use uuid::Uuid;

    fn config() -> RoomProviderConfig {
        RoomProviderConfig {
            base_url: None,
            api_key: Some("secret".to_string()),
            room_ttl: Duration::from_secs(60),
            request_timeout: Duration::from_secs(2),
        }
    }

    async fn create(headers: HeaderMap, Json(body): Json<Value>) -> Result<Json<Value>, AxumStatus> {
        if headers.get("authorization").and_then(|v| v.to_str().ok()) != Some("Bearer secret") {
            return Err(AxumStatus::UNAUTHORIZED);
        }
        assert!(body["properties"]["exp"].as_i64().unwrap_or_default() > 0);
        let name = body["name"].as_str().unwrap_or_default().to_string();
        Ok(Json(json!({ "name": name, "url": format!("https://meet.example/{name}") })))
    }

    async fn presence(Path(name): Path<String>) -> Result<Json<Value>, AxumStatus> {
        match name.as_str() {
            "busy" => Ok(Json(json!({ "total_count": 2, "data": [] }))),
            "broken" => Err(AxumStatus::INTERNAL_SERVER_ERROR),
            _ => Err(AxumStatus::NOT_FOUND),
        }
    }

    async fn delete(Path(name): Path<String>) -> AxumStatus {
        if name == "gone" {
            AxumStatus::NOT_FOUND
        } else {
            AxumStatus::OK
        }
    }

    async fn spawn_provider() -> String {
        let app = Router::new()
            .route("/rooms", post(create))
            .route("/rooms/:name", axum::routing::delete(delete))
            .route("/rooms/:name/presence", get(presence));
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        format!("http://{addr}")
    }

    #[tokio::test]
    async fn http_provider_round_trip() {
        let base = spawn_provider().await;
        let provider = HttpRoomProvider::new(&base, &config()).unwrap();

        let room = provider.create_room("call-abc").await.unwrap();
        assert_eq!(room.url, "https://meet.example/call-abc");
        assert_eq!(provider.participant_count("busy").await.unwrap(), 2);
        provider.delete_room("call-abc").await.unwrap();
        provider.delete_room("gone").await.unwrap();
    }

    #[tokio::test]
    async fn http_provider_surfaces_failures() {
        let base = spawn_provider().await;
        let mut unauthenticated = config();
        unauthenticated.api_key = None;
        let provider = HttpRoomProvider::new(&base, &unauthenticated).unwrap();

        match provider.create_room("call-abc").await {
            Err(RoomProviderError::Status { status, .. }) => assert_eq!(status, 401),
            other => panic!("unexpected result {other:?}"),
        }
        assert!(matches!(
            provider.participant_count("missing").await,
            Err(RoomProviderError::NotFound(_))
        ));
        assert!(matches!(
            provider.participant_count("broken").await,
            Err(RoomProviderError::Status { status: 500, .. })
        ));
    }

    #[tokio::test]
    async fn unreachable_provider_is_an_error() {
        let provider = HttpRoomProvider::new("http://127.0.0.1:9", &config()).unwrap();
        assert!(matches!(
            provider.create_room("call-abc").await,
            Err(RoomProviderError::Http(_))
        ));
    }

    #[tokio::test]
    async fn local_provider_tracks_rooms() {
        let provider = LocalRoomProvider::new("http://localhost:8080/", 2);
        let name = room_name_for(Uuid::new_v4());
        let room = provider.create_room(&name).await.unwrap();
        assert_eq!(room.url, format!("http://localhost:8080/rooms/{name}"));
        assert_eq!(provider.participant_count(&name).await.unwrap(), 2);

        assert!(provider.set_participant_count(&name, 1).await);
        assert_eq!(provider.participant_count(&name).await.unwrap(), 1);

        provider.delete_room(&name).await.unwrap();
        assert!(!provider.exists(&name).await);
        assert!(provider.participant_count(&name).await.is_err());
    }

    #[test]
    fn room_names_are_url_safe() {
        let name = room_name_for(Uuid::new_v4());
        assert!(name.starts_with("call-"));
        assert!(name.chars().all(|c| c.is_ascii_alphanumeric() || c == '-'));
    }
}
