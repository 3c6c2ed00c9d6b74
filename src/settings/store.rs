//! Settings persistence
//!
//! One JSON document on disk, one coarse lock in memory. Every mutation
//! rewrites the whole document through a temp-file-and-rename cycle so an
//! outside observer only ever sees the pre-write or the post-write bytes.
//!
//! A persistence failure leaves the in-memory document ahead of the disk
//! copy; the next successful mutation writes the reconciled state.
//!
//! # Example
//!
//! ```no_run
//! use sdfw::settings::SettingsStore;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let store = SettingsStore::load_or_default("/var/lib/sdfw/config.json");
//! let settings = store.snapshot().await;
//! println!("{} providers", settings.providers.len());
//! # Ok(())
//! # }
//! ```

use std::io::Write;
use std::path::{Path, PathBuf};

use tokio::sync::{broadcast, Mutex};
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::builtin;
use super::types::{AdapterBackup, AppSettings, Profile, Provider, SETTINGS_VERSION};
use crate::error::SettingsError;

/// Capacity of the settings-changed broadcast channel
const EVENT_CHANNEL_CAPACITY: usize = 16;

/// Store for the persisted settings document
///
/// All mutations are serialized behind a single lock and broadcast a
/// [`AppSettings`] snapshot to subscribers after being applied.
pub struct SettingsStore {
    /// Path of the JSON document
    path: PathBuf,

    /// The in-memory document, source of truth between writes
    inner: Mutex<AppSettings>,

    /// Change event fan-out
    events: broadcast::Sender<AppSettings>,
}

impl SettingsStore {
    /// Load the document from `path`, seeding defaults when absent or broken
    ///
    /// A missing file is created immediately with the built-in catalogue.
    /// An unreadable or unparseable file falls back to seeded defaults in
    /// memory without touching the broken file; the next mutation rewrites
    /// it.
    #[must_use]
    pub fn load_or_default(path: impl AsRef<Path>) -> Self {
        let path = path.as_ref().to_path_buf();
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);

        let settings = match Self::load_from(&path) {
            Ok(Some(settings)) => {
                info!(
                    path = %path.display(),
                    providers = settings.providers.len(),
                    "settings loaded"
                );
                settings
            }
            Ok(None) => {
                let seeded = Self::seeded_defaults();
                info!(path = %path.display(), "no settings file, seeding defaults");
                if let Err(e) = Self::write_atomic(&path, &seeded) {
                    warn!(error = %e, "failed to write seeded settings");
                }
                seeded
            }
            Err(e) => {
                warn!(path = %path.display(), error = %e, "settings unreadable, using defaults");
                Self::seeded_defaults()
            }
        };

        Self {
            path,
            inner: Mutex::new(settings),
            events,
        }
    }

    /// The document a fresh installation starts with
    #[must_use]
    pub fn seeded_defaults() -> AppSettings {
        AppSettings {
            version: SETTINGS_VERSION,
            providers: builtin::catalogue(),
            default_profile: None,
            enabled: false,
            apply_on_boot: true,
            adapter_backups: Vec::new(),
            ui_settings: serde_json::Value::Object(serde_json::Map::new()),
            extra: serde_json::Map::new(),
        }
    }

    fn load_from(path: &Path) -> Result<Option<AppSettings>, SettingsError> {
        if !path.exists() {
            return Ok(None);
        }

        let contents = std::fs::read_to_string(path).map_err(|e| SettingsError::ReadError {
            path: path.display().to_string(),
            source: e,
        })?;

        let settings: AppSettings = serde_json::from_str(&contents)
            .map_err(|e| SettingsError::ParseError(e.to_string()))?;

        Ok(Some(settings))
    }

    /// Write the document atomically: temp file in the same directory,
    /// fsync, rename over the target.
    fn write_atomic(path: &Path, settings: &AppSettings) -> Result<(), SettingsError> {
        let json = serde_json::to_vec_pretty(settings)
            .map_err(|e| SettingsError::SerializeError(e.to_string()))?;

        let dir = path.parent().unwrap_or_else(|| Path::new("."));
        if !dir.exists() {
            std::fs::create_dir_all(dir).map_err(|e| SettingsError::PersistError {
                path: path.display().to_string(),
                reason: format!("failed to create parent directory: {e}"),
            })?;
        }

        let mut tmp = tempfile::NamedTempFile::new_in(dir).map_err(|e| {
            SettingsError::PersistError {
                path: path.display().to_string(),
                reason: format!("failed to create temp file: {e}"),
            }
        })?;

        tmp.write_all(&json)
            .and_then(|()| tmp.flush())
            .and_then(|()| tmp.as_file().sync_all())
            .map_err(|e| SettingsError::PersistError {
                path: path.display().to_string(),
                reason: format!("failed to write temp file: {e}"),
            })?;

        tmp.persist(path).map_err(|e| SettingsError::PersistError {
            path: path.display().to_string(),
            reason: e.to_string(),
        })?;

        debug!(path = %path.display(), bytes = json.len(), "settings persisted");
        Ok(())
    }

    /// Subscribe to settings-changed events
    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<AppSettings> {
        self.events.subscribe()
    }

    /// Clone the current document
    pub async fn snapshot(&self) -> AppSettings {
        self.inner.lock().await.clone()
    }

    /// Apply a mutation under the lock, persist the result, broadcast it
    ///
    /// The in-memory document keeps the mutation even when the disk write
    /// fails; the error is surfaced to the caller and the next write
    /// retries the full document.
    async fn mutate<F>(&self, mutation: F) -> Result<AppSettings, SettingsError>
    where
        F: FnOnce(&mut AppSettings) -> Result<(), SettingsError>,
    {
        let mut guard = self.inner.lock().await;
        mutation(&mut guard)?;

        let snapshot = guard.clone();
        let persisted = Self::write_atomic(&self.path, &snapshot);
        drop(guard);

        // Subscribers track the in-memory state, which is authoritative
        // even when the disk write is pending retry.
        let _ = self.events.send(snapshot.clone());

        persisted.map(|()| snapshot)
    }

    /// Replace the whole document
    pub async fn update(&self, settings: AppSettings) -> Result<AppSettings, SettingsError> {
        for provider in &settings.providers {
            provider.validate()?;
        }
        self.mutate(move |doc| {
            *doc = settings;
            Ok(())
        })
        .await
    }

    /// Insert or replace a provider by ID
    pub async fn upsert_provider(&self, provider: Provider) -> Result<AppSettings, SettingsError> {
        provider.validate()?;
        self.mutate(move |doc| {
            match doc.providers.iter_mut().find(|p| p.id == provider.id) {
                Some(existing) => *existing = provider,
                None => doc.providers.push(provider),
            }
            Ok(())
        })
        .await
    }

    /// Remove a provider by ID
    pub async fn remove_provider(&self, id: Uuid) -> Result<AppSettings, SettingsError> {
        self.mutate(move |doc| {
            let before = doc.providers.len();
            doc.providers.retain(|p| p.id != id);
            if doc.providers.len() == before {
                return Err(SettingsError::ProviderNotFound { id: id.to_string() });
            }
            Ok(())
        })
        .await
    }

    /// Look up a provider by ID
    pub async fn provider_by_id(&self, id: Uuid) -> Option<Provider> {
        self.inner.lock().await.provider_by_id(id).cloned()
    }

    /// Set or clear the default profile
    pub async fn set_default_profile(
        &self,
        profile: Option<Profile>,
    ) -> Result<AppSettings, SettingsError> {
        self.mutate(move |doc| {
            doc.default_profile = profile;
            Ok(())
        })
        .await
    }

    /// Record the user's last enablement intent
    pub async fn set_enabled(&self, enabled: bool) -> Result<AppSettings, SettingsError> {
        self.mutate(move |doc| {
            doc.enabled = enabled;
            Ok(())
        })
        .await
    }

    /// Fetch the backup for an adapter, if one exists
    pub async fn backup_for(&self, adapter_id: &str) -> Option<AdapterBackup> {
        self.inner.lock().await.backup_for(adapter_id).cloned()
    }

    /// All outstanding adapter backups
    pub async fn backups(&self) -> Vec<AdapterBackup> {
        self.inner.lock().await.adapter_backups.clone()
    }

    /// Store a backup, replacing any previous one for the same adapter
    pub async fn put_backup(&self, backup: AdapterBackup) -> Result<AppSettings, SettingsError> {
        self.mutate(move |doc| {
            doc.adapter_backups.retain(|b| b.adapter_id != backup.adapter_id);
            doc.adapter_backups.push(backup);
            Ok(())
        })
        .await
    }

    /// Drop the backup for an adapter after a successful restore
    pub async fn remove_backup(&self, adapter_id: &str) -> Result<AppSettings, SettingsError> {
        let adapter_id = adapter_id.to_string();
        self.mutate(move |doc| {
            doc.adapter_backups.retain(|b| b.adapter_id != adapter_id);
            Ok(())
        })
        .await
    }

    /// Path of the backing document
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::settings::types::unix_millis;
    use std::net::Ipv4Addr;
    use tempfile::tempdir;

    fn store_in(dir: &tempfile::TempDir) -> SettingsStore {
        SettingsStore::load_or_default(dir.path().join("config.json"))
    }

    fn sample_provider() -> Provider {
        Provider::standard("Sample", Some(Ipv4Addr::new(10, 0, 0, 1)), None, None, None)
    }

    fn sample_backup(adapter_id: &str) -> AdapterBackup {
        AdapterBackup {
            adapter_id: adapter_id.into(),
            interface_index: 7,
            name: "Ethernet".into(),
            ipv4_dns: vec![Ipv4Addr::new(8, 8, 8, 8)],
            ipv6_dns: vec![],
            dhcp: false,
            captured_at: unix_millis(),
        }
    }

    // ========================================================================
    // Seeding Tests
    // ========================================================================

    #[tokio::test]
    async fn test_seeds_on_missing_file() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("config.json");
        let store = SettingsStore::load_or_default(&path);

        assert!(path.exists(), "seeding should create the file");

        let settings = store.snapshot().await;
        assert_eq!(settings.version, SETTINGS_VERSION);
        assert_eq!(settings.providers.len(), builtin::catalogue().len());
        assert!(!settings.enabled);
        assert!(settings.apply_on_boot);
        assert!(settings.adapter_backups.is_empty());
    }

    #[tokio::test]
    async fn test_falls_back_on_corrupt_file() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("config.json");
        std::fs::write(&path, "{not json").unwrap();

        let store = SettingsStore::load_or_default(&path);
        let settings = store.snapshot().await;
        assert_eq!(settings.providers.len(), builtin::catalogue().len());
    }

    #[tokio::test]
    async fn test_reload_round_trip() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("config.json");

        let provider = sample_provider();
        let id = provider.id;
        {
            let store = SettingsStore::load_or_default(&path);
            store.upsert_provider(provider).await.unwrap();
        }

        let reloaded = SettingsStore::load_or_default(&path);
        assert!(reloaded.provider_by_id(id).await.is_some());
    }

    // ========================================================================
    // Mutation Tests
    // ========================================================================

    #[tokio::test]
    async fn test_upsert_provider_insert_and_replace() {
        let dir = tempdir().unwrap();
        let store = store_in(&dir);
        let baseline = store.snapshot().await.providers.len();

        let mut provider = sample_provider();
        store.upsert_provider(provider.clone()).await.unwrap();
        assert_eq!(store.snapshot().await.providers.len(), baseline + 1);

        provider.name = "Renamed".into();
        store.upsert_provider(provider.clone()).await.unwrap();

        let settings = store.snapshot().await;
        assert_eq!(settings.providers.len(), baseline + 1);
        assert_eq!(settings.provider_by_id(provider.id).unwrap().name, "Renamed");
    }

    #[tokio::test]
    async fn test_upsert_rejects_invalid_provider() {
        let dir = tempdir().unwrap();
        let store = store_in(&dir);

        let empty = Provider::standard("empty", None, None, None, None);
        assert!(store.upsert_provider(empty).await.is_err());
    }

    #[tokio::test]
    async fn test_remove_provider() {
        let dir = tempdir().unwrap();
        let store = store_in(&dir);

        let provider = sample_provider();
        let id = provider.id;
        store.upsert_provider(provider).await.unwrap();

        store.remove_provider(id).await.unwrap();
        assert!(store.provider_by_id(id).await.is_none());

        let err = store.remove_provider(id).await.unwrap_err();
        assert!(matches!(err, SettingsError::ProviderNotFound { .. }));
    }

    #[tokio::test]
    async fn test_backup_lifecycle() {
        let dir = tempdir().unwrap();
        let store = store_in(&dir);

        store.put_backup(sample_backup("eth0")).await.unwrap();
        assert!(store.backup_for("eth0").await.is_some());

        // A second capture replaces, never duplicates
        store.put_backup(sample_backup("eth0")).await.unwrap();
        assert_eq!(store.backups().await.len(), 1);

        store.remove_backup("eth0").await.unwrap();
        assert!(store.backup_for("eth0").await.is_none());
        assert!(store.backups().await.is_empty());
    }

    #[tokio::test]
    async fn test_change_events_broadcast() {
        let dir = tempdir().unwrap();
        let store = store_in(&dir);
        let mut events = store.subscribe();

        store.set_enabled(true).await.unwrap();

        let changed = events.recv().await.unwrap();
        assert!(changed.enabled);
    }

    // ========================================================================
    // Atomicity Tests
    // ========================================================================

    #[tokio::test]
    async fn test_disk_document_always_parseable() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("config.json");
        let store = SettingsStore::load_or_default(&path);

        for i in 0..20 {
            store.set_enabled(i % 2 == 0).await.unwrap();
            let on_disk = std::fs::read_to_string(&path).unwrap();
            let parsed: AppSettings = serde_json::from_str(&on_disk).unwrap();
            assert_eq!(parsed.enabled, i % 2 == 0);
        }
    }

    #[tokio::test]
    async fn test_save_is_idempotent_on_disk() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("config.json");
        let store = SettingsStore::load_or_default(&path);

        let snapshot = store.snapshot().await;
        store.update(snapshot.clone()).await.unwrap();
        let first = std::fs::read_to_string(&path).unwrap();

        store.update(snapshot).await.unwrap();
        let second = std::fs::read_to_string(&path).unwrap();

        assert_eq!(first, second);
    }
}
