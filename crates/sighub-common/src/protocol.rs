//! JSON wire frames spoken between the hub and its clients.
//!
//! All application frames are UTF-8 JSON text frames. Server-originated
//! frames are tagged by a kebab-case `type` field with camelCase payload
//! keys. Inbound frames are parsed leniently: anything that is not valid
//! JSON (or carries no string `type`) is treated as an opaque `custom`
//! message and forwarded verbatim.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// WebSocket close code for a normal closure.
pub const CLOSE_NORMAL: u16 = 1000;

/// WebSocket close code for an authentication failure; the close reason
/// carries the human-readable cause.
pub const CLOSE_AUTH_FAILED: u16 = 4001;

/// Auth method tag carried in `auth-challenge` frames.
pub const ETHEREUM_HANDSHAKE: &str = "ethereum-handshake";

/// Message type assigned to frames that are not valid JSON objects.
pub const CUSTOM_TYPE: &str = "custom";

/// Error text sent to a pending connection that speaks before it has
/// completed the handshake.
pub const AUTH_REQUIRED: &str =
    "Authentication required. Send auth-response with signature and address.";

/// Frames originated by the server.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case", rename_all_fields = "camelCase")]
pub enum ServerFrame {
    /// Handshake challenge sent immediately after upgrade.
    AuthChallenge {
        /// Auth method identifier ([`ETHEREUM_HANDSHAKE`]).
        method: String,
        /// Nonce token: `<epochMillis>:<hex 16 bytes>`.
        token: String,
        /// Exact text the client must sign.
        message: String,
        /// Challenge expiry, epoch milliseconds.
        expiry: u64,
    },
    /// Handshake accepted; the connection is authenticated.
    AuthSuccess {
        /// Verified wallet address, lowercase hex.
        address: String,
        /// Newly assigned client identifier (`<userId>_<epochMillis>`).
        client_id: String,
    },
    /// Handshake rejected; the connection closes with code 4001.
    AuthFailed {
        /// Human-readable failure cause.
        reason: String,
    },
    /// Non-terminal policy or protocol error.
    Error {
        /// Human-readable error text.
        error: String,
    },
}

impl ServerFrame {
    /// Convenience constructor for [`ServerFrame::Error`].
    pub fn error(text: impl Into<String>) -> Self {
        Self::Error { error: text.into() }
    }
}

/// Payload of an inbound `auth-response` frame. Fields are optional so
/// the handshake engine can report a missing-field failure instead of a
/// parse error.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AuthResponse {
    /// 65-byte signature, `0x`-prefixed hex.
    #[serde(default)]
    pub signature: Option<String>,
    /// Claimed wallet address, `0x`-prefixed hex.
    #[serde(default)]
    pub address: Option<String>,
}

impl AuthResponse {
    /// Extract an auth response from a parsed frame; absent or mistyped
    /// fields become `None`.
    #[must_use]
    pub fn from_value(value: &Value) -> Self {
        serde_json::from_value(value.clone()).unwrap_or_default()
    }
}

/// Payload of an inbound `join` frame.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JoinRequest {
    /// Target room identifier; unknown ids fall back to the default room.
    #[serde(default)]
    pub room_id: Option<String>,
}

impl JoinRequest {
    /// Extract a join request from a parsed frame.
    #[must_use]
    pub fn from_value(value: &Value) -> Self {
        serde_json::from_value(value.clone()).unwrap_or_default()
    }
}

/// Message type of a (possibly unparseable) inbound frame: the `type`
/// field when present, [`CUSTOM_TYPE`] otherwise.
#[must_use]
pub fn message_type(parsed: Option<&Value>) -> &str {
    parsed
        .and_then(|v| v.get("type"))
        .and_then(Value::as_str)
        .unwrap_or(CUSTOM_TYPE)
}
