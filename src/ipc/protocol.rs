//! IPC protocol definitions
//!
//! Messages are a tagged union keyed by a `$type` discriminator, wrapped in
//! an envelope carrying a `messageId` and a timestamp. Every request type
//! has a matching response type; the response echoes the request's
//! `messageId`. Notifications share the framing but never answer a
//! request.
//!
//! Framing: a 4-byte little-endian length prefix followed by exactly that
//! many bytes of UTF-8 JSON. A frame of length zero or above 1 MiB is a
//! protocol violation that terminates the connection.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::adapter::NetworkAdapter;
use crate::control::StatusSnapshot;
use crate::error::IpcError;
use crate::settings::types::unix_millis;
use crate::settings::{AppSettings, ConnectionStatus, Profile};

/// Maximum JSON payload per frame
pub const MAX_MESSAGE_SIZE: usize = 1024 * 1024;

/// Size of the length prefix
pub const LENGTH_PREFIX_SIZE: usize = 4;

/// Message envelope: tag, timestamp, and the `$type`-tagged body
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Envelope<T> {
    /// Correlation tag; responses echo the request's value
    pub message_id: Uuid,

    /// Sender clock, milliseconds since the Unix epoch
    pub timestamp: u64,

    /// The tagged message body
    #[serde(flatten)]
    pub body: T,
}

impl<T> Envelope<T> {
    /// Wrap a body with a fresh message tag
    #[must_use]
    pub fn new(body: T) -> Self {
        Self {
            message_id: Uuid::new_v4(),
            timestamp: unix_millis(),
            body,
        }
    }

    /// Wrap a body answering the given message tag
    #[must_use]
    pub fn replying_to(message_id: Uuid, body: T) -> Self {
        Self {
            message_id,
            timestamp: unix_millis(),
            body,
        }
    }
}

/// Requests the control surface can issue
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "$type", rename_all_fields = "camelCase")]
pub enum RequestBody {
    /// Liveness check
    Ping,

    /// Current status, active provider and statistics
    GetStatus,

    /// The full settings document
    GetConfig,

    /// Replace the full settings document
    SaveConfig {
        /// The document to persist
        settings: Box<AppSettings>,
    },

    /// Snapshot of host adapters with their current DNS
    GetAdapters {
        /// Restrict to adapters that currently have link
        #[serde(default)]
        connected_only: bool,
    },

    /// Persist a profile as default and optionally bring it up
    ApplyProfile {
        /// Provider plus targeted adapters
        profile: Profile,
        /// Take over adapters and start/switch forwarding
        #[serde(default)]
        enable: bool,
    },

    /// Switch to a provider without touching the default
    ConnectTemporary {
        /// Provider to activate
        provider_id: Uuid,
    },

    /// Switch back to the default provider
    RevertToDefault,

    /// Stop forwarding and record the disabled intent
    Disable {
        /// Restore adapter DNS from the persisted backups
        #[serde(default = "default_true")]
        restore_original_dns: bool,
    },

    /// One-shot latency probe; does not change state
    TestProvider {
        /// Provider to probe
        provider_id: Uuid,
        /// Domain to resolve; the service default when absent
        #[serde(default, skip_serializing_if = "Option::is_none")]
        test_domain: Option<String>,
    },

    /// Flush the OS resolver cache
    FlushDnsCache,
}

fn default_true() -> bool {
    true
}

/// Responses, one variant per request type plus the error shape
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "$type", rename_all_fields = "camelCase")]
pub enum ResponseBody {
    /// Answer to `Ping`
    Pong,

    /// Answer to `GetStatus`
    Status(StatusPayload),

    /// Answer to `GetConfig`
    Config {
        /// The current settings document
        settings: Box<AppSettings>,
    },

    /// Answer to `SaveConfig`
    ConfigSaved,

    /// Answer to `GetAdapters`
    Adapters {
        /// Enumerated adapters
        adapters: Vec<NetworkAdapter>,
    },

    /// Answer to `ApplyProfile`
    ProfileApplied {
        /// Status after the transition
        status: ConnectionStatus,
    },

    /// Answer to `ConnectTemporary`
    TemporaryConnected {
        /// Status after the synthetic test
        status: ConnectionStatus,
    },

    /// Answer to `RevertToDefault`
    RevertedToDefault {
        /// Status after the synthetic test
        status: ConnectionStatus,
    },

    /// Answer to `Disable`
    Disabled {
        /// Adapters restored from backup
        restored_adapters: usize,
        /// Adapters whose restore failed and stays pending
        failed_adapters: usize,
    },

    /// Answer to `TestProvider`
    TestResult {
        /// Probed provider
        provider_id: Uuid,
        /// Round-trip latency
        latency_ms: u64,
    },

    /// Answer to `FlushDnsCache`
    CacheFlushed,

    /// Failure answer to any request
    Error(ErrorPayload),
}

impl ResponseBody {
    /// Build an error response
    #[must_use]
    pub fn error(code: ErrorCode, message: impl Into<String>) -> Self {
        Self::Error(ErrorPayload {
            code,
            message: message.into(),
        })
    }

    /// Whether this is the error shape
    #[must_use]
    pub const fn is_error(&self) -> bool {
        matches!(self, Self::Error(_))
    }
}

/// Status payload for `GetStatus`
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StatusPayload {
    /// Lifecycle status
    pub status: ConnectionStatus,
    /// Active provider, if any
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub active_provider_id: Option<Uuid>,
    /// Active provider display name
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub active_provider_name: Option<String>,
    /// Whether the connection is temporary
    pub is_temporary: bool,
    /// Last recorded error
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
    /// Last health probe, unix milliseconds
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_health_check: Option<u64>,
    /// Successfully forwarded queries since process start
    pub queries_handled: u64,
}

impl From<StatusSnapshot> for StatusPayload {
    fn from(snapshot: StatusSnapshot) -> Self {
        Self {
            status: snapshot.status,
            active_provider_id: snapshot.active_provider_id,
            active_provider_name: snapshot.active_provider_name,
            is_temporary: snapshot.is_temporary,
            last_error: snapshot.last_error,
            last_health_check: snapshot.last_health_check,
            queries_handled: snapshot.queries_handled,
        }
    }
}

/// Error payload
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ErrorPayload {
    /// Machine-readable error class
    pub code: ErrorCode,
    /// Human-readable message
    pub message: String,
}

/// Error classes for IPC responses
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
    /// Unclassified failure
    Unknown,
    /// The request payload was invalid
    InvalidRequest,
    /// A referenced entity does not exist
    NotFound,
    /// The operation needs a running forwarder
    NotRunning,
    /// The operation was attempted and failed
    OperationFailed,
}

/// Unsolicited messages broadcast to every connected client
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "$type", rename_all_fields = "camelCase")]
pub enum NotificationBody {
    /// The connection status changed
    StatusChanged {
        /// Status before the transition
        previous: ConnectionStatus,
        /// Status after the transition
        current: ConnectionStatus,
        /// Context for failures
        #[serde(default, skip_serializing_if = "Option::is_none")]
        message: Option<String>,
    },

    /// The settings document was mutated
    SettingsChanged {
        /// The new document
        settings: Box<AppSettings>,
    },
}

/// Encode a message into a length-prefixed frame
pub fn encode_frame<T: Serialize>(message: &T) -> Result<Vec<u8>, IpcError> {
    let json = serde_json::to_vec(message).map_err(|e| IpcError::serialization(e.to_string()))?;

    if json.is_empty() || json.len() > MAX_MESSAGE_SIZE {
        return Err(IpcError::framing(format!(
            "payload of {} bytes outside (0, {MAX_MESSAGE_SIZE}]",
            json.len()
        )));
    }

    #[allow(clippy::cast_possible_truncation)]
    let len = (json.len() as u32).to_le_bytes();
    let mut frame = Vec::with_capacity(LENGTH_PREFIX_SIZE + json.len());
    frame.extend_from_slice(&len);
    frame.extend_from_slice(&json);
    Ok(frame)
}

/// Decode a frame payload
pub fn decode_payload<T: for<'de> Deserialize<'de>>(payload: &[u8]) -> Result<T, IpcError> {
    serde_json::from_slice(payload).map_err(|e| IpcError::serialization(e.to_string()))
}
