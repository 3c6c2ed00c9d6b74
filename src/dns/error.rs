//! Error types for the DNS engine
//!
//! This module defines the error hierarchy for wire handling, upstream
//! communication and the loopback forwarder.
//!
//! # Error Categories
//!
//! - **Parse/Serialize errors**: DNS message encoding/decoding failures
//! - **Network errors**: socket I/O and connection issues
//! - **Timeout errors**: an upstream did not answer in time
//! - **Upstream errors**: upstream server communication failures
//! - **Bootstrap errors**: all avenues for resolving a `DoH` host failed
//! - **Config errors**: invalid provider parameters
//!
//! # Example
//!
//! ```
//! use sdfw::dns::DnsError;
//!
//! let err = DnsError::timeout("query to 1.1.1.1:53", std::time::Duration::from_secs(5));
//! assert!(err.is_recoverable());
//! assert!(err.to_string().contains("timed out"));
//! ```

use std::io;
use std::time::Duration;

use thiserror::Error;

/// Error type for DNS operations
///
/// Errors are classified as either recoverable (transient, may succeed on
/// retry or against the next candidate address) or non-recoverable
/// (configuration or programming problems).
#[derive(Debug, Error)]
pub enum DnsError {
    /// DNS message parsing failed
    #[error("Failed to parse DNS message: {reason}")]
    ParseError {
        /// Description of what went wrong during parsing
        reason: String,
    },

    /// DNS message serialization failed
    #[error("Failed to serialize DNS message: {reason}")]
    SerializeError {
        /// Description of what went wrong during serialization
        reason: String,
    },

    /// Network I/O error
    #[error("Network error: {reason}")]
    NetworkError {
        /// Description of the network failure
        reason: String,
        /// The underlying I/O error, if available
        #[source]
        source: Option<io::Error>,
    },

    /// Query timeout
    #[error("DNS query timed out after {timeout:?}: {context}")]
    TimeoutError {
        /// Description of what timed out
        context: String,
        /// The timeout duration that was exceeded
        timeout: Duration,
    },

    /// Upstream server error
    #[error("Upstream error ({upstream}): {reason}")]
    UpstreamError {
        /// The upstream address or URL
        upstream: String,
        /// Description of the upstream failure
        reason: String,
    },

    /// Bootstrap resolution failed
    ///
    /// Raised when a `DoH` hostname could not be resolved through any of
    /// the bootstrap avenues (provider literals, public resolvers, host
    /// resolver).
    #[error("Bootstrap resolution failed for '{host}': {reason}")]
    BootstrapError {
        /// The `DoH` hostname being resolved
        host: String,
        /// Description of the failure
        reason: String,
    },

    /// Invalid provider configuration
    #[error("Invalid provider configuration: {reason}")]
    ConfigError {
        /// Description of the configuration error
        reason: String,
    },

    /// No upstream provider is active
    #[error("No active upstream provider: {reason}")]
    NoUpstream {
        /// Reason why no upstream is available
        reason: String,
    },

    /// Internal processing error
    #[error("Internal DNS error: {reason}")]
    InternalError {
        /// Description of the internal error
        reason: String,
    },
}

impl DnsError {
    // ========================================================================
    // Constructor methods
    // ========================================================================

    /// Create a parse error
    pub fn parse(reason: impl Into<String>) -> Self {
        Self::ParseError { reason: reason.into() }
    }

    /// Create a serialization error
    pub fn serialize(reason: impl Into<String>) -> Self {
        Self::SerializeError { reason: reason.into() }
    }

    /// Create a network error
    pub fn network(reason: impl Into<String>) -> Self {
        Self::NetworkError {
            reason: reason.into(),
            source: None,
        }
    }

    /// Create a network error from an I/O error
    pub fn network_io(reason: impl Into<String>, source: io::Error) -> Self {
        Self::NetworkError {
            reason: reason.into(),
            source: Some(source),
        }
    }

    /// Create a timeout error
    pub fn timeout(context: impl Into<String>, timeout: Duration) -> Self {
        Self::TimeoutError {
            context: context.into(),
            timeout,
        }
    }

    /// Create an upstream error
    pub fn upstream(upstream: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::UpstreamError {
            upstream: upstream.into(),
            reason: reason.into(),
        }
    }

    /// Create a bootstrap error
    pub fn bootstrap(host: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::BootstrapError {
            host: host.into(),
            reason: reason.into(),
        }
    }

    /// Create a configuration error
    pub fn config(reason: impl Into<String>) -> Self {
        Self::ConfigError { reason: reason.into() }
    }

    /// Create a no-upstream error
    pub fn no_upstream(reason: impl Into<String>) -> Self {
        Self::NoUpstream { reason: reason.into() }
    }

    /// Create an internal error
    pub fn internal(reason: impl Into<String>) -> Self {
        Self::InternalError { reason: reason.into() }
    }

    // ========================================================================
    // Classification methods
    // ========================================================================

    /// Check if this error is recoverable
    ///
    /// Recoverable errors are transient and may succeed against the next
    /// candidate address or on a later retry.
    #[must_use]
    pub fn is_recoverable(&self) -> bool {
        match self {
            Self::NetworkError { source, .. } => source.as_ref().is_none_or(|e| {
                matches!(
                    e.kind(),
                    io::ErrorKind::TimedOut
                        | io::ErrorKind::Interrupted
                        | io::ErrorKind::WouldBlock
                        | io::ErrorKind::ConnectionReset
                        | io::ErrorKind::ConnectionRefused
                )
            }),
            Self::TimeoutError { .. } | Self::UpstreamError { .. } => true,
            Self::ParseError { .. }
            | Self::SerializeError { .. }
            | Self::BootstrapError { .. }
            | Self::ConfigError { .. }
            | Self::NoUpstream { .. }
            | Self::InternalError { .. } => false,
        }
    }

    /// Check if this error indicates a timeout
    #[must_use]
    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::TimeoutError { .. })
    }

    /// Check if this error indicates an upstream failure
    #[must_use]
    pub fn is_upstream_error(&self) -> bool {
        matches!(self, Self::UpstreamError { .. })
    }

    /// Check if this error indicates a bootstrap failure
    #[must_use]
    pub fn is_bootstrap_error(&self) -> bool {
        matches!(self, Self::BootstrapError { .. })
    }
}

impl From<io::Error> for DnsError {
    fn from(err: io::Error) -> Self {
        Self::NetworkError {
            reason: err.to_string(),
            source: Some(err),
        }
    }
}

/// Type alias for Result with [`DnsError`]
pub type DnsResult<T> = std::result::Result<T, DnsError>;
