//! DNS engine for the loopback forwarder
//!
//! This module carries the wire-level pieces of the service: minimal message
//! construction and inspection, the upstream transports (classical UDP and
//! `DoH` with bootstrap resolution), and the four-listener loopback
//! forwarder.
//!
//! # Architecture
//!
//! ```text
//! Client query (verbatim bytes)
//!     │
//!     ▼
//! ┌──────────────┐     ┌───────────────────┐
//! │  Forwarder   │ ──▶ │ UpstreamTransport │ ──▶ active provider
//! │ (UDP/TCP ×2) │     │  (UDP / DoH)      │
//! └──────────────┘     └────────┬──────────┘
//!                               │ hostname?
//!                               ▼
//!                      ┌───────────────────┐
//!                      │ BootstrapResolver │
//!                      └───────────────────┘
//! ```
//!
//! Forwarded client messages are never parsed beyond what framing requires;
//! [`wire`] exists for the synthetic test queries and bootstrap lookups only.

pub mod error;
pub mod forwarder;
pub mod upstream;
pub mod wire;

pub use error::{DnsError, DnsResult};
