//! Persisted configuration for the forwarder service
//!
//! A single JSON document holds the provider catalogue, the default profile,
//! per-adapter DNS backups and the user's last intent. The [`store`] keeps
//! that document on disk under an atomic-write discipline and broadcasts a
//! change event after every successful mutation.

pub mod builtin;
pub mod store;
pub mod types;

pub use store::SettingsStore;
pub use types::{
    AdapterBackup, AppSettings, ConnectionStatus, Profile, Provider, ProviderKind,
};
