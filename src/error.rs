//! Error types for the sdfw service
//!
//! This module defines the service-level error hierarchy. Errors are
//! categorized by subsystem and include recovery hints. DNS engine errors
//! live in [`crate::dns::error`].

use std::io;

use thiserror::Error;

use crate::dns::error::DnsError;

/// Top-level error type for the service
#[derive(Debug, Error)]
pub enum SdfwError {
    /// Settings document errors (load, parse, persist)
    #[error("Settings error: {0}")]
    Settings(#[from] SettingsError),

    /// Adapter reconfiguration errors
    #[error("Adapter error: {0}")]
    Adapter(#[from] AdapterError),

    /// DNS engine errors (wire, upstream, forwarder)
    #[error("DNS error: {0}")]
    Dns(#[from] DnsError),

    /// Control state machine errors
    #[error("Control error: {0}")]
    Control(#[from] ControlError),

    /// IPC communication errors
    #[error("IPC error: {0}")]
    Ipc(#[from] IpcError),

    /// I/O errors not covered by other categories
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

impl SdfwError {
    /// Check if this error is recoverable (the operation can be retried)
    #[must_use]
    pub fn is_recoverable(&self) -> bool {
        match self {
            Self::Settings(e) => e.is_recoverable(),
            Self::Adapter(e) => e.is_recoverable(),
            Self::Dns(e) => e.is_recoverable(),
            Self::Control(e) => e.is_recoverable(),
            Self::Ipc(e) => e.is_recoverable(),
            Self::Io(e) => matches!(
                e.kind(),
                io::ErrorKind::TimedOut
                    | io::ErrorKind::Interrupted
                    | io::ErrorKind::WouldBlock
                    | io::ErrorKind::ConnectionReset
            ),
        }
    }
}

/// Settings-store errors
#[derive(Debug, Error)]
pub enum SettingsError {
    /// The document could not be read from disk
    #[error("Failed to read settings file {path}: {source}")]
    ReadError {
        path: String,
        #[source]
        source: io::Error,
    },

    /// The document could not be parsed
    #[error("Failed to parse settings: {0}")]
    ParseError(String),

    /// The document could not be serialized
    #[error("Failed to serialize settings: {0}")]
    SerializeError(String),

    /// The atomic write (temp file + rename) failed
    #[error("Failed to persist settings to {path}: {reason}")]
    PersistError { path: String, reason: String },

    /// A referenced entity does not exist in the document
    #[error("Provider not found: {id}")]
    ProviderNotFound { id: String },

    /// Validation of an entity failed
    #[error("Invalid provider '{name}': {reason}")]
    InvalidProvider { name: String, reason: String },
}

impl SettingsError {
    /// Persist failures may succeed on the next write; everything else
    /// needs user intervention.
    #[must_use]
    pub const fn is_recoverable(&self) -> bool {
        matches!(self, Self::PersistError { .. })
    }
}

/// Adapter-controller errors
#[derive(Debug, Error)]
pub enum AdapterError {
    /// Adapter enumeration failed
    #[error("Failed to enumerate network adapters: {reason}")]
    EnumerationFailed { reason: String },

    /// A single adapter refused reconfiguration
    #[error("Failed to configure adapter '{adapter}': {reason}")]
    ApplyFailed { adapter: String, reason: String },

    /// No targeted adapter could be updated
    #[error("No adapter could be updated ({attempted} attempted)")]
    NoAdapterUpdated { attempted: usize },

    /// Resolver cache flush failed
    #[error("Failed to flush the OS resolver cache: {reason}")]
    FlushFailed { reason: String },

    /// The platform tool exited with a failure status
    #[error("'{command}' exited with {status}: {stderr}")]
    CommandFailed {
        command: String,
        status: String,
        stderr: String,
    },

    /// Spawning the platform tool failed
    #[error("Failed to run '{command}': {source}")]
    CommandIo {
        command: String,
        #[source]
        source: io::Error,
    },

    /// Adapter control is not implemented for this platform
    #[error("Adapter DNS control is not supported on this platform")]
    Unsupported,
}

impl AdapterError {
    /// Per-adapter failures are retried on the next takeover/restore pass.
    #[must_use]
    pub const fn is_recoverable(&self) -> bool {
        matches!(
            self,
            Self::ApplyFailed { .. } | Self::FlushFailed { .. } | Self::CommandFailed { .. }
        )
    }
}

/// Control state machine errors
#[derive(Debug, Error)]
pub enum ControlError {
    /// A provider ID was not found in the settings catalogue
    #[error("Provider not found: {id}")]
    ProviderNotFound { id: String },

    /// A transition was requested that the current state forbids
    #[error("Operation requires a running forwarder (status: {status})")]
    NotRunning { status: String },

    /// The loopback sockets could not be bound
    #[error("Failed to bind loopback port 53 ({addr}): {reason}")]
    BindFailed { addr: String, reason: String },

    /// No targeted adapter accepted the loopback takeover
    #[error("Adapter takeover failed: {reason}")]
    TakeoverFailed { reason: String },

    /// The synthetic test query failed
    #[error("Connectivity test against '{provider}' failed: {reason}")]
    TestFailed { provider: String, reason: String },
}

impl ControlError {
    #[must_use]
    pub const fn is_recoverable(&self) -> bool {
        matches!(self, Self::TestFailed { .. })
    }
}

/// IPC errors
#[derive(Debug, Error)]
pub enum IpcError {
    /// The listening endpoint could not be created
    #[error("Failed to bind IPC endpoint {endpoint}: {reason}")]
    BindError { endpoint: String, reason: String },

    /// A client violated the length-prefix framing contract
    #[error("IPC framing violation: {reason}")]
    FramingViolation { reason: String },

    /// JSON encode/decode failure
    #[error("IPC serialization error: {0}")]
    Serialization(String),

    /// Client-side connection failure
    #[error("IPC connection error: {0}")]
    ConnectionError(String),

    /// Underlying socket I/O failure
    #[error("IPC I/O error: {0}")]
    Io(#[from] io::Error),
}

impl IpcError {
    /// Create a serialization error
    pub fn serialization(reason: impl Into<String>) -> Self {
        Self::Serialization(reason.into())
    }

    /// Create a framing violation error
    pub fn framing(reason: impl Into<String>) -> Self {
        Self::FramingViolation { reason: reason.into() }
    }

    #[must_use]
    pub fn is_recoverable(&self) -> bool {
        match self {
            Self::ConnectionError(_) => true,
            Self::Io(e) => matches!(
                e.kind(),
                io::ErrorKind::TimedOut
                    | io::ErrorKind::Interrupted
                    | io::ErrorKind::ConnectionReset
            ),
            _ => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_settings_error_recoverability() {
        let persist = SettingsError::PersistError {
            path: "/tmp/config.json".into(),
            reason: "disk full".into(),
        };
        assert!(persist.is_recoverable());

        let parse = SettingsError::ParseError("bad json".into());
        assert!(!parse.is_recoverable());
    }

    #[test]
    fn test_adapter_error_display() {
        let err = AdapterError::ApplyFailed {
            adapter: "Ethernet".into(),
            reason: "access denied".into(),
        };
        assert!(err.to_string().contains("Ethernet"));
        assert!(err.is_recoverable());
        assert!(!AdapterError::Unsupported.is_recoverable());
    }

    #[test]
    fn test_control_error_display() {
        let err = ControlError::BindFailed {
            addr: "127.0.0.1:53".into(),
            reason: "address in use".into(),
        };
        assert!(err.to_string().contains("127.0.0.1:53"));
        assert!(!err.is_recoverable());
    }

    #[test]
    fn test_ipc_error_framing() {
        let err = IpcError::framing("length 0");
        assert!(matches!(err, IpcError::FramingViolation { .. }));
        assert!(!err.is_recoverable());
    }

    #[test]
    fn test_top_level_conversion() {
        let err: SdfwError = SettingsError::ParseError("x".into()).into();
        assert!(matches!(err, SdfwError::Settings(_)));

        let io_err = io::Error::new(io::ErrorKind::TimedOut, "timeout");
        let err: SdfwError = io_err.into();
        assert!(err.is_recoverable());
    }
}
