//! sdfw: host-local DNS forwarder service
//!
//! This crate implements a resident loopback DNS forwarder that routes the
//! host's name-resolution traffic through a user-selected upstream, either a
//! classical UDP DNS server or a DNS-over-HTTPS endpoint.
//!
//! # Features
//!
//! - **Loopback forwarding**: UDP and TCP listeners on `127.0.0.1:53` and
//!   `[::1]:53`, relaying wire-format queries verbatim
//! - **Upstream transports**: classical UDP with ordered-address failover,
//!   and `DoH` POST (RFC 8484) with bootstrap resolution
//! - **Adapter takeover**: backup, loopback takeover and restoration of
//!   per-adapter DNS settings via the host's native tooling
//! - **Persistent settings**: a single JSON document with atomic writes and
//!   change broadcasting
//! - **IPC control**: length-prefixed JSON request/response server for the
//!   companion control surface
//!
//! # Architecture
//!
//! ```text
//! Applications → loopback:53 → Forwarder → UpstreamTransport → upstream
//!                                  │              │
//!                                  │              └─ BootstrapResolver (DoH)
//!                                  ▼
//!                           ControlService ◀── IpcServer ◀── control surface
//!                                  │
//!                    SettingsStore + AdapterController
//! ```
//!
//! # Quick Start
//!
//! ```no_run
//! use std::sync::Arc;
//! use sdfw::dns::forwarder::Forwarder;
//! use sdfw::dns::upstream::UpstreamTransport;
//! use sdfw::settings::builtin;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let transport = Arc::new(UpstreamTransport::new());
//! let forwarder = Arc::new(Forwarder::new(transport));
//!
//! let provider = builtin::catalogue()
//!     .into_iter()
//!     .find(|p| p.name == "Cloudflare")
//!     .expect("built-in catalogue");
//!
//! forwarder.start(Arc::new(provider)).await?;
//! # Ok(())
//! # }
//! ```
//!
//! # Modules
//!
//! - [`adapter`]: host network adapter enumeration and DNS takeover
//! - [`control`]: service state machine (start/switch/revert/disable)
//! - [`dns`]: wire helpers, upstream transports and the loopback forwarder
//! - [`error`]: error types
//! - [`health`]: periodic upstream health probing
//! - [`ipc`]: IPC server, client and protocol
//! - [`settings`]: persisted configuration document and store

#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::must_use_candidate)]
#![allow(clippy::missing_errors_doc)]

pub mod adapter;
pub mod control;
pub mod dns;
pub mod error;
pub mod health;
pub mod ipc;
pub mod settings;

/// Crate version string
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
