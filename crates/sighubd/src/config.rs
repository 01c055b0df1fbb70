use clap::Parser;
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use thiserror::Error;

/// CLI arguments for the signaling server.
#[derive(Parser, Debug, Clone)]
#[command(name = "sighubd")]
#[command(about = "WebRTC signaling hub")]
#[command(version)]
pub struct Args {
    /// Path to the JSON configuration document.
    #[arg(long, default_value = "config.json", env = "SIGHUB_CONFIG")]
    pub config: PathBuf,
    /// Override the configured listen port.
    #[arg(long, env = "PORT")]
    pub port: Option<u16>,
    /// Run signaling-only, without the admin UI collaborator.
    #[arg(long, env = "DISABLE_UI", default_value_t = false)]
    pub disable_ui: bool,
    /// Socket address for the metrics endpoint.
    #[arg(long, default_value = "127.0.0.1:9090", env = "SIGHUB_METRICS")]
    pub metrics_addr: SocketAddr,
}

/// Immutable configuration snapshot consumed by every component.
///
/// Deserialized once at startup from the JSON configuration document; the
/// document's camelCase key shape is the contract with the admin UI.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Config {
    /// Listener settings.
    pub server: ServerSection,
    /// Ordered room list; the first entry is the default room.
    pub rooms: Vec<RoomConfig>,
    /// Ordered whitelist/blacklist patterns.
    pub ip_filters: Vec<IpFilterRule>,
    /// Connection caps.
    pub connection_limits: ConnectionLimits,
    /// Per-connection rate-limit rules.
    pub rate_limit_rules: Vec<RateLimitRule>,
    /// Authentication settings.
    pub auth: AuthConfig,
    /// Log level and flags.
    pub logging: LoggingConfig,
}

/// Listener settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ServerSection {
    /// TCP port to listen on.
    pub port: u16,
    /// Bind address.
    pub host: String,
    /// WebSocket upgrade path.
    pub ws_path: String,
    /// Interval between keepalive pings, seconds.
    pub ping_interval_secs: u64,
    /// Idle timeout after which a silent connection is closed, seconds.
    pub idle_timeout_secs: u64,
}

impl Default for ServerSection {
    fn default() -> Self {
        Self {
            port: 6742,
            host: "0.0.0.0".to_string(),
            ws_path: "/ws".to_string(),
            ping_interval_secs: 30,
            idle_timeout_secs: 300,
        }
    }
}

/// Per-room configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RoomConfig {
    /// Stable room identifier.
    pub id: String,
    /// Fan-out policy for application frames.
    #[serde(default)]
    pub routing_mode: RoutingMode,
    /// When set, only these message types may be sent in the room.
    #[serde(default)]
    pub allowed_message_types: Option<Vec<String>>,
    /// Declared member cap. Parsed for document compatibility; not
    /// enforced (room capacity is gated at upgrade time by
    /// `connectionLimits.maxConnectionsPerRoom`).
    #[serde(default)]
    pub max_members: Option<usize>,
}

/// Fan-out policy for application frames.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum RoutingMode {
    /// Forward to every other room member.
    #[default]
    Broadcast,
    /// Forward to the single connection named by `targetId`.
    Unicast,
    /// Declared but routed as broadcast.
    Multicast,
    /// Any unrecognized mode; routed as broadcast.
    #[serde(other)]
    Unknown,
}

/// One whitelist/blacklist pattern.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IpFilterRule {
    /// Literal address or IPv4 `network/bits` CIDR.
    pub pattern: String,
    /// Whether the pattern admits or denies.
    #[serde(rename = "type")]
    pub kind: FilterKind,
}

/// Filter rule polarity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FilterKind {
    /// When any whitelist entry exists, addresses must match one.
    Whitelist,
    /// A matching address is denied.
    Blacklist,
}

/// Connection caps.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ConnectionLimits {
    /// Maximum live connections sharing one remote address.
    #[serde(rename = "maxConnectionsPerIP")]
    pub max_connections_per_ip: usize,
    /// Room capacity, checked at upgrade time against the default room.
    pub max_connections_per_room: usize,
    /// Maximum live connections overall.
    pub max_total_connections: usize,
    /// Declared per-user cap. Parsed; currently unenforced.
    pub max_connections_per_user: usize,
}

impl Default for ConnectionLimits {
    fn default() -> Self {
        Self {
            max_connections_per_ip: 10,
            max_connections_per_room: 100,
            max_total_connections: 1000,
            max_connections_per_user: 10,
        }
    }
}

/// One sliding-window rate-limit rule.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RateLimitRule {
    /// Disabled rules are kept in the document but never evaluated.
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// Maximum frames admitted within the window.
    pub max_messages: u32,
    /// Window length in milliseconds (at most 60 000).
    pub window_ms: u64,
    /// When set, the rule only applies to these message types.
    #[serde(default)]
    pub message_types: Option<Vec<String>>,
    /// Declared scope. Only per-client behavior is implemented; other
    /// scopes are accepted and evaluated per-client.
    #[serde(default)]
    pub scope: RateLimitScope,
}

/// Declared scope of a rate-limit rule.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum RateLimitScope {
    /// One shared budget for the whole server.
    Global,
    /// One budget per connection (the implemented behavior).
    #[default]
    PerClient,
    /// One budget per room.
    PerRoom,
    /// One budget per remote address.
    PerIp,
}

fn default_true() -> bool {
    true
}

/// Authentication settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct AuthConfig {
    /// Master switch; disabled means every connection is anonymous.
    pub enabled: bool,
    /// Admission method for authenticated mode.
    pub method: AuthMethod,
    /// Admit unauthenticated clients with an anonymous identity.
    pub allow_anonymous: bool,
    /// Prefix of generated anonymous user ids.
    pub anonymous_prefix: String,
    /// Human-readable text the wallet handshake asks clients to sign.
    pub handshake_message: String,
    /// Challenge validity in seconds.
    pub handshake_expiry: u64,
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            method: AuthMethod::EthereumHandshake,
            allow_anonymous: false,
            anonymous_prefix: "anon_".to_string(),
            handshake_message: "Sign this to authenticate with the signaling server".to_string(),
            handshake_expiry: 300,
        }
    }
}

/// Admission method.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum AuthMethod {
    /// No authentication; clients get anonymous identities.
    None,
    /// `token` query parameter at upgrade time (unvalidated).
    Token,
    /// EIP-191 challenge/response wallet handshake.
    #[default]
    EthereumHandshake,
}

/// Log level and flags.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct LoggingConfig {
    /// Default tracing filter when `RUST_LOG` is unset.
    pub level: String,
    /// Log connect/disconnect events at info level.
    pub log_connections: bool,
    /// Log per-frame routing at debug level.
    pub log_messages: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            log_connections: true,
            log_messages: false,
        }
    }
}

/// Configuration loading errors.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// The document could not be read.
    #[error("failed to read {path}: {source}")]
    Io {
        /// Offending path.
        path: String,
        /// Underlying I/O error.
        #[source]
        source: std::io::Error,
    },
    /// The document is not valid JSON of the expected shape.
    #[error("failed to parse {path}: {source}")]
    Parse {
        /// Offending path.
        path: String,
        /// Underlying serde error.
        #[source]
        source: serde_json::Error,
    },
}

impl Config {
    /// Load and deserialize the configuration document.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError`] when the file cannot be read or parsed.
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.display().to_string(),
            source,
        })?;
        serde_json::from_str(&text).map_err(|source| ConfigError::Parse {
            path: path.display().to_string(),
            source,
        })
    }

    /// Apply process-level overrides (currently `PORT`).
    pub fn apply_overrides(&mut self, args: &Args) {
        if let Some(port) = args.port {
            self.server.port = port;
        }
    }

    /// `host:port` string for the listener.
    #[must_use]
    pub fn listen_addr(&self) -> String {
        format!("{}:{}", self.server.host, self.server.port)
    }

    /// The default room: the first configured entry, if any.
    #[must_use]
    pub fn default_room(&self) -> Option<&RoomConfig> {
        self.rooms.first()
    }

    /// Room configuration by exact id.
    #[must_use]
    pub fn room(&self, id: &str) -> Option<&RoomConfig> {
        self.rooms.iter().find(|r| r.id == id)
    }

    /// Validates the configuration values are within acceptable bounds.
    /// Returns Ok(()) if valid, Err with description otherwise.
    pub fn validate(&self) -> Result<(), String> {
        if self.server.host.is_empty() {
            return Err("server.host must not be empty".to_string());
        }
        if !self.server.ws_path.starts_with('/') {
            return Err("server.wsPath must start with '/'".to_string());
        }
        if self.server.ping_interval_secs == 0 {
            return Err("server.pingIntervalSecs must be greater than 0".to_string());
        }
        if self.server.idle_timeout_secs < self.server.ping_interval_secs {
            return Err("server.idleTimeoutSecs cannot be below pingIntervalSecs".to_string());
        }

        let limits = &self.connection_limits;
        if limits.max_total_connections == 0 {
            return Err("maxTotalConnections must be greater than 0".to_string());
        }
        if limits.max_total_connections > 1_000_000 {
            return Err("maxTotalConnections exceeds reasonable limit (1,000,000)".to_string());
        }
        if limits.max_connections_per_ip == 0 {
            return Err("maxConnectionsPerIP must be greater than 0".to_string());
        }
        if limits.max_connections_per_ip > limits.max_total_connections {
            return Err("maxConnectionsPerIP cannot exceed maxTotalConnections".to_string());
        }
        if limits.max_connections_per_room == 0 {
            return Err("maxConnectionsPerRoom must be greater than 0".to_string());
        }

        let mut seen = std::collections::HashSet::new();
        for room in &self.rooms {
            if room.id.is_empty() {
                return Err("room id must not be empty".to_string());
            }
            if !seen.insert(room.id.as_str()) {
                return Err(format!("duplicate room id '{}'", room.id));
            }
        }

        for rule in self.rate_limit_rules.iter().filter(|r| r.enabled) {
            if rule.max_messages == 0 {
                return Err("rate limit maxMessages must be greater than 0".to_string());
            }
            if rule.window_ms == 0 {
                return Err("rate limit windowMs must be greater than 0".to_string());
            }
            if rule.window_ms > 60_000 {
                return Err("rate limit windowMs exceeds tracker retention (60000 ms)".to_string());
            }
        }

        if self.auth.handshake_expiry == 0 {
            return Err("auth.handshakeExpiry must be greater than 0".to_string());
        }
        if self.auth.handshake_expiry > 3600 {
            return Err("auth.handshakeExpiry exceeds reasonable limit (3600 seconds)".to_string());
        }
        if self.auth.anonymous_prefix.is_empty() {
            return Err("auth.anonymousPrefix must not be empty".to_string());
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn defaults_are_valid() {
        let config = Config::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.server.port, 6742);
        assert_eq!(config.server.ws_path, "/ws");
        assert_eq!(config.auth.method, AuthMethod::EthereumHandshake);
        assert_eq!(config.auth.handshake_expiry, 300);
        assert!(config.rooms.is_empty());
    }

    #[test]
    fn parses_full_document() {
        let doc = json!({
            "server": {"port": 7000, "host": "127.0.0.1", "wsPath": "/signal"},
            "rooms": [
                {
                    "id": "default",
                    "routingMode": "broadcast",
                    "allowedMessageTypes": ["offer", "answer", "ice-candidate", "custom"],
                    "maxMembers": 16
                },
                {"id": "ops", "routingMode": "unicast"}
            ],
            "ipFilters": [
                {"pattern": "10.0.0.0/8", "type": "blacklist"},
                {"pattern": "192.168.1.5", "type": "whitelist"}
            ],
            "connectionLimits": {
                "maxConnectionsPerIP": 4,
                "maxConnectionsPerRoom": 32,
                "maxTotalConnections": 256,
                "maxConnectionsPerUser": 2
            },
            "rateLimitRules": [
                {"enabled": true, "maxMessages": 30, "windowMs": 10000,
                 "messageTypes": ["offer"], "scope": "per-client"}
            ],
            "auth": {
                "enabled": true,
                "method": "ethereum-handshake",
                "allowAnonymous": false,
                "anonymousPrefix": "anon_",
                "handshakeMessage": "Sign this",
                "handshakeExpiry": 120
            },
            "logging": {"level": "debug", "logConnections": true, "logMessages": true}
        })
        .to_string();

        let config: Config = serde_json::from_str(&doc).unwrap();
        assert!(config.validate().is_ok());
        assert_eq!(config.server.port, 7000);
        assert_eq!(config.rooms.len(), 2);
        assert_eq!(config.rooms[0].max_members, Some(16));
        assert_eq!(config.rooms[1].routing_mode, RoutingMode::Unicast);
        assert_eq!(config.ip_filters[0].kind, FilterKind::Blacklist);
        assert_eq!(config.connection_limits.max_connections_per_ip, 4);
        assert_eq!(
            config.rate_limit_rules[0].scope,
            RateLimitScope::PerClient
        );
        assert_eq!(config.auth.handshake_expiry, 120);
        assert!(config.logging.log_messages);
    }

    #[test]
    fn partial_document_gets_defaults() {
        let config: Config = serde_json::from_str(r#"{"server": {"port": 9100}}"#).unwrap();
        assert_eq!(config.server.port, 9100);
        assert_eq!(config.server.ws_path, "/ws");
        assert_eq!(config.connection_limits.max_total_connections, 1000);
        assert!(config.auth.enabled);
    }

    #[test]
    fn unknown_routing_mode_is_tolerated() {
        let room: RoomConfig =
            serde_json::from_str(r#"{"id": "x", "routingMode": "anycast"}"#).unwrap();
        assert_eq!(room.routing_mode, RoutingMode::Unknown);
    }

    #[test]
    fn default_room_is_first_entry() {
        let mut config = Config::default();
        assert!(config.default_room().is_none());
        config.rooms = vec![
            RoomConfig {
                id: "lobby".to_string(),
                routing_mode: RoutingMode::Broadcast,
                allowed_message_types: None,
                max_members: None,
            },
            RoomConfig {
                id: "ops".to_string(),
                routing_mode: RoutingMode::Broadcast,
                allowed_message_types: None,
                max_members: None,
            },
        ];
        assert_eq!(config.default_room().unwrap().id, "lobby");
        assert_eq!(config.room("ops").unwrap().id, "ops");
        assert!(config.room("nope").is_none());
    }

    #[test]
    fn validate_rejects_zero_total() {
        let mut config = Config::default();
        config.connection_limits.max_total_connections = 0;
        assert!(config.validate().unwrap_err().contains("maxTotalConnections"));
    }

    #[test]
    fn validate_rejects_per_ip_above_total() {
        let mut config = Config::default();
        config.connection_limits.max_connections_per_ip =
            config.connection_limits.max_total_connections + 1;
        assert!(config.validate().unwrap_err().contains("maxConnectionsPerIP"));
    }

    #[test]
    fn validate_rejects_duplicate_room_ids() {
        let mut config = Config::default();
        let room = RoomConfig {
            id: "dup".to_string(),
            routing_mode: RoutingMode::Broadcast,
            allowed_message_types: None,
            max_members: None,
        };
        config.rooms = vec![room.clone(), room];
        assert!(config.validate().unwrap_err().contains("duplicate room id"));
    }

    #[test]
    fn validate_rejects_oversized_rate_window() {
        let mut config = Config::default();
        config.rate_limit_rules = vec![RateLimitRule {
            enabled: true,
            max_messages: 10,
            window_ms: 61_000,
            message_types: None,
            scope: RateLimitScope::PerClient,
        }];
        assert!(config.validate().unwrap_err().contains("windowMs"));
    }

    #[test]
    fn validate_ignores_disabled_rules() {
        let mut config = Config::default();
        config.rate_limit_rules = vec![RateLimitRule {
            enabled: false,
            max_messages: 0,
            window_ms: 0,
            message_types: None,
            scope: RateLimitScope::PerClient,
        }];
        assert!(config.validate().is_ok());
    }

    #[test]
    fn validate_bounds_handshake_expiry() {
        let mut config = Config::default();
        config.auth.handshake_expiry = 0;
        assert!(config.validate().unwrap_err().contains("handshakeExpiry"));
        config.auth.handshake_expiry = 3601;
        assert!(config.validate().unwrap_err().contains("handshakeExpiry"));
        config.auth.handshake_expiry = 3600;
        assert!(config.validate().is_ok());
    }

    #[test]
    fn validate_rejects_bad_ws_path() {
        let mut config = Config::default();
        config.server.ws_path = "ws".to_string();
        assert!(config.validate().unwrap_err().contains("wsPath"));
    }

    #[test]
    fn port_override_applies() {
        let mut config = Config::default();
        let args = Args {
            config: PathBuf::from("config.json"),
            port: Some(9999),
            disable_ui: false,
            metrics_addr: "127.0.0.1:9090".parse().unwrap(),
        };
        config.apply_overrides(&args);
        assert_eq!(config.server.port, 9999);
        assert_eq!(config.listen_addr(), "0.0.0.0:9999");
    }

    #[test]
    fn auth_method_tags_are_kebab_case() {
        assert_eq!(
            serde_json::from_str::<AuthMethod>(r#""ethereum-handshake""#).unwrap(),
            AuthMethod::EthereumHandshake
        );
        assert_eq!(
            serde_json::from_str::<AuthMethod>(r#""token""#).unwrap(),
            AuthMethod::Token
        );
        assert_eq!(
            serde_json::from_str::<RateLimitScope>(r#""per-ip""#).unwrap(),
            RateLimitScope::PerIp
        );
    }
}
