use shared::models::UserId;
use std::{
    env, fmt,
    net::{IpAddr, Ipv4Addr, SocketAddr},
    time::Duration,
};

const DEFAULT_LISTEN_PORT: u16 = 8080;
const DEFAULT_PUBLIC_URL: &str = "http://127.0.0.1:8080";
const DEFAULT_MONITOR_INTERVAL_SECS: u64 = 10;
const DEFAULT_EMPTY_ROOM_THRESHOLD: u32 = 1;
const DEFAULT_RING_TIMEOUT_SECS: u64 = 30;
const DEFAULT_ROOM_TTL_SECS: u64 = 7200;
const DEFAULT_ROOM_REQUEST_TIMEOUT_SECS: u64 = 10;
const DEFAULT_REDIS_URL: &str = "redis://127.0.0.1/";
const DEFAULT_REDIS_REQUIRE_TLS: bool = true;
const DEFAULT_REDIS_KEY_PREFIX: &str = "calls";
const DEFAULT_SHUTDOWN_GRACE_SECS: u64 = 5;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoreBackend {
    Memory,
    Redis,
}

#[derive(Debug, Clone)]
pub struct CallSettings {
    pub monitor_interval: Duration,
    pub empty_room_threshold: u32,
    pub ring_timeout: Duration,
    pub shutdown_grace: Duration,
}

impl Default for CallSettings {
    fn default() -> Self {
        Self {
            monitor_interval: Duration::from_secs(DEFAULT_MONITOR_INTERVAL_SECS),
            empty_room_threshold: DEFAULT_EMPTY_ROOM_THRESHOLD,
            ring_timeout: Duration::from_secs(DEFAULT_RING_TIMEOUT_SECS),
            shutdown_grace: Duration::from_secs(DEFAULT_SHUTDOWN_GRACE_SECS),
        }
    }
}

#[derive(Clone)]
pub struct RoomProviderConfig {
    /// `None` selects the in-process provider.
    pub base_url: Option<String>,
    pub api_key: Option<String>,
    pub room_ttl: Duration,
    pub request_timeout: Duration,
}

// Keeps the API key out of the startup log.
impl fmt::Debug for RoomProviderConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RoomProviderConfig")
            .field("base_url", &self.base_url)
            .field("api_key", &self.api_key.as_ref().map(|_| "<redacted>"))
            .field("room_ttl", &self.room_ttl)
            .field("request_timeout", &self.request_timeout)
            .finish()
    }
}

#[derive(Debug, Clone)]
pub struct SignalingServerConfig {
    pub listen_addr: SocketAddr,
    pub public_base_url: String,
    pub calls: CallSettings,
    pub room_provider: RoomProviderConfig,
    pub store: StoreBackend,
    pub redis_url: String,
    pub redis_require_tls: bool,
    pub redis_key_prefix: String,
    pub friend_pairs: Vec<(UserId, UserId)>,
}

impl SignalingServerConfig {
    pub fn from_env() -> anyhow::Result<Self> {
        let listen_port = env::var("SIGNALING_PORT")
            .ok()
            .and_then(|raw| raw.parse::<u16>().ok())
            .unwrap_or(DEFAULT_LISTEN_PORT);

        let listen_addr = env::var("SIGNALING_ADDR")
            .ok()
            .and_then(|raw| raw.parse::<IpAddr>().ok())
            .map(|ip| SocketAddr::new(ip, listen_port))
            .unwrap_or(SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), listen_port));

        let public_base_url =
            env::var("SIGNALING_PUBLIC_URL").unwrap_or_else(|_| DEFAULT_PUBLIC_URL.to_string());

        let calls = CallSettings {
            monitor_interval: secs_var("SIGNALING_MONITOR_INTERVAL_SECS", DEFAULT_MONITOR_INTERVAL_SECS),
            empty_room_threshold: env::var("SIGNALING_EMPTY_ROOM_THRESHOLD")
                .ok()
                .and_then(|raw| raw.parse::<u32>().ok())
                .unwrap_or(DEFAULT_EMPTY_ROOM_THRESHOLD),
            ring_timeout: secs_var("SIGNALING_RING_TIMEOUT_SECS", DEFAULT_RING_TIMEOUT_SECS),
            shutdown_grace: secs_var("SIGNALING_SHUTDOWN_GRACE_SECS", DEFAULT_SHUTDOWN_GRACE_SECS),
        };
        if calls.monitor_interval.is_zero() {
            anyhow::bail!("SIGNALING_MONITOR_INTERVAL_SECS must be greater than zero");
        }

        let room_provider = RoomProviderConfig {
            base_url: env::var("SIGNALING_ROOM_PROVIDER_URL")
                .ok()
                .map(|raw| raw.trim_end_matches('/').to_string())
                .filter(|raw| !raw.is_empty()),
            api_key: env::var("SIGNALING_ROOM_PROVIDER_API_KEY").ok().filter(|raw| !raw.is_empty()),
            room_ttl: secs_var("SIGNALING_ROOM_TTL_SECS", DEFAULT_ROOM_TTL_SECS),
            request_timeout: secs_var(
                "SIGNALING_ROOM_REQUEST_TIMEOUT_SECS",
                DEFAULT_ROOM_REQUEST_TIMEOUT_SECS,
            ),
        };

        let store = match env::var("SIGNALING_STORE")
            .unwrap_or_else(|_| "memory".to_string())
            .to_lowercase()
            .as_str()
        {
            "memory" => StoreBackend::Memory,
            "redis" => StoreBackend::Redis,
            other => anyhow::bail!("unknown SIGNALING_STORE backend: {other}"),
        };

        let redis_url = env::var("SIGNALING_REDIS_URL").unwrap_or_else(|_| DEFAULT_REDIS_URL.to_string());

        // SECURITY: Require TLS for Redis by default. Can be disabled for local dev only.
        let redis_require_tls = env::var("SIGNALING_REDIS_REQUIRE_TLS")
            .ok()
            .and_then(|raw| parse_bool(&raw))
            .unwrap_or(DEFAULT_REDIS_REQUIRE_TLS);

        let redis_key_prefix = env::var("SIGNALING_REDIS_KEY_PREFIX")
            .unwrap_or_else(|_| DEFAULT_REDIS_KEY_PREFIX.to_string());

        let friend_pairs = env::var("SIGNALING_FRIEND_PAIRS")
            .map(|raw| parse_friend_pairs(&raw))
            .unwrap_or_default();

        Ok(Self {
            listen_addr,
            public_base_url,
            calls,
            room_provider,
            store,
            redis_url,
            redis_require_tls,
            redis_key_prefix,
            friend_pairs,
        })
    }
}

impl Default for SignalingServerConfig {
    fn default() -> Self {
        Self {
            listen_addr: SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), DEFAULT_LISTEN_PORT),
            public_base_url: DEFAULT_PUBLIC_URL.to_string(),
            calls: CallSettings::default(),
            room_provider: RoomProviderConfig {
                base_url: None,
                api_key: None,
                room_ttl: Duration::from_secs(DEFAULT_ROOM_TTL_SECS),
                request_timeout: Duration::from_secs(DEFAULT_ROOM_REQUEST_TIMEOUT_SECS),
            },
            store: StoreBackend::Memory,
            redis_url: DEFAULT_REDIS_URL.to_string(),
            redis_require_tls: DEFAULT_REDIS_REQUIRE_TLS,
            redis_key_prefix: DEFAULT_REDIS_KEY_PREFIX.to_string(),
            friend_pairs: Vec::new(),
        }
    }
}

fn secs_var(name: &str, default: u64) -> Duration {
    env::var(name)
        .ok()
        .and_then(|raw| raw.parse::<u64>().ok())
        .map(Duration::from_secs)
        .unwrap_or_else(|| Duration::from_secs(default))
}

fn parse_bool(raw: &str) -> Option<bool> {
    match raw.to_lowercase().as_str() {
        "1" | "true" | "yes" => Some(true),
        "0" | "false" | "no" => Some(false),
        _ => None,
    }
}

fn parse_friend_pairs(raw: &str) -> Vec<(UserId, UserId)> {
    raw.split(',')
        .filter_map(|pair| {
            let (a, b) = pair.split_once(':')?;
            let (a, b) = (a.trim(), b.trim());
            (!a.is_empty() && !b.is_empty() && a != b).then(|| (a.to_string(), b.to_string()))
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn friend_pairs_skip_garbage() {
        let pairs = parse_friend_pairs("alice:bob, carol : dave,broken,eve:eve,:x");
        assert_eq!(
            pairs,
            vec![
                ("alice".to_string(), "bob".to_string()),
                ("carol".to_string(), "dave".to_string()),
            ]
        );
    }

    #[test]
    fn bool_flags() {
        assert_eq!(parse_bool("YES"), Some(true));
        assert_eq!(parse_bool("0"), Some(false));
        assert_eq!(parse_bool("maybe"), None);
    }

    #[test]
    fn default_timings() {
        let config = SignalingServerConfig::default();
        assert_eq!(config.calls.monitor_interval, Duration::from_secs(10));
        assert_eq!(config.calls.ring_timeout, Duration::from_secs(30));
        assert_eq!(config.calls.empty_room_threshold, 1);
        assert_eq!(config.store, StoreBackend::Memory);
    }

    #[test]
    fn api_key_is_not_logged() {
        let mut config = SignalingServerConfig::default();
        config.room_provider.api_key = Some("sk_live_123".to_string());
        let rendered = format!("{config:?}");
        assert!(!rendered.contains("sk_live_123"));
        assert!(rendered.contains("<redacted>"));
    }
}
