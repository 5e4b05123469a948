//! Installed-plugin ledger.
//!
//! `installed.lock` in the install root records every artifact on disk,
//! whether or not it is currently loaded, so the installed list survives
//! restarts.
//!
//! # Format
//!
//! TOML with `schema_version = 1` and a flat `[[plugin]]` array of
//! [`InstalledPluginRecord`] entries.

use std::fmt;
use std::io::Write;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use fs2::FileExt;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::error::{PluginError, PluginResult};

/// Current ledger schema version.
const SCHEMA_VERSION: u32 = 1;

/// Ledger file name inside the install root.
pub const LEDGER_FILE_NAME: &str = "installed.lock";

/// Status of an installed artifact.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InstalledStatus {
    /// On disk, never loaded.
    Installed,
    /// Module loaded and registered with the manager.
    Loaded,
    /// Components active on the host.
    Active,
    /// Unloaded after being active.
    Inactive,
    /// The last load failed.
    Error,
    /// Required configuration is missing.
    NeedsConfiguration,
}

impl fmt::Display for InstalledStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Installed => "installed",
            Self::Loaded => "loaded",
            Self::Active => "active",
            Self::Inactive => "inactive",
            Self::Error => "error",
            Self::NeedsConfiguration => "needs_configuration",
        };
        f.write_str(s)
    }
}

/// One installed artifact.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InstalledPluginRecord {
    /// Declared plugin name.
    pub name: String,
    /// Declared version.
    pub version: String,
    /// Current status.
    pub status: InstalledStatus,
    /// Artifact root (holds `package.json`).
    pub install_path: PathBuf,
    /// Declared required configuration variables.
    #[serde(default)]
    pub required_config_vars: Vec<String>,
    /// Last failure message.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_details: Option<String>,
    /// When it was installed.
    pub installed_at: DateTime<Utc>,
    /// When it last became active.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_activated_at: Option<DateTime<Utc>>,
}

/// The on-disk list of installed artifacts.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InstallLedger {
    schema_version: u32,
    #[serde(default, rename = "plugin")]
    entries: Vec<InstalledPluginRecord>,
}

impl InstallLedger {
    /// An empty ledger.
    #[must_use]
    pub fn new() -> Self {
        Self {
            schema_version: SCHEMA_VERSION,
            entries: Vec::new(),
        }
    }

    /// Load the ledger, or an empty one if the file does not exist.
    ///
    /// # Errors
    ///
    /// Returns [`PluginError::LedgerError`] if the file exists but cannot be
    /// read or parsed.
    pub fn load_or_default(path: &Path) -> PluginResult<Self> {
        let _lock_guard = acquire_lock_file(path, LockMode::Shared)?;

        match std::fs::read_to_string(path) {
            Ok(content) => Self::parse_content(path, &content),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(Self::new()),
            Err(e) => Err(ledger_error(path, format!("failed to read ledger: {e}"))),
        }
    }

    fn parse_content(path: &Path, content: &str) -> PluginResult<Self> {
        let ledger: Self = toml::from_str(content)
            .map_err(|e| ledger_error(path, format!("failed to parse ledger: {e}")))?;

        if ledger.schema_version != SCHEMA_VERSION {
            warn!(
                path = %path.display(),
                found = ledger.schema_version,
                expected = SCHEMA_VERSION,
                "Ledger schema version mismatch, attempting best-effort load"
            );
        }

        debug!(path = %path.display(), entries = ledger.entries.len(), "Loaded install ledger");
        Ok(ledger)
    }

    /// Load, mutate and save under a single exclusive lock.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read, parsed or written, or
    /// if the closure fails.
    pub fn update<F>(path: &Path, f: F) -> PluginResult<()>
    where
        F: FnOnce(&mut Self) -> PluginResult<()>,
    {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| {
                ledger_error(path, format!("failed to create parent directory: {e}"))
            })?;
        }

        let _lock_guard = acquire_lock_file(path, LockMode::Exclusive)?;

        let mut ledger = match std::fs::read_to_string(path) {
            Ok(content) => Self::parse_content(path, &content)?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Self::new(),
            Err(e) => return Err(ledger_error(path, format!("failed to read ledger: {e}"))),
        };

        f(&mut ledger)?;
        ledger.save_inner(path)
    }

    /// Caller must hold the exclusive lock.
    fn save_inner(&self, path: &Path) -> PluginResult<()> {
        let header = "# Auto-generated by hotplug. Do not edit manually.\n\n";
        let body = toml::to_string_pretty(self)
            .map_err(|e| ledger_error(path, format!("failed to serialize ledger: {e}")))?;
        let content = format!("{header}{body}");

        let parent = path.parent().unwrap_or(Path::new("."));
        let mut tmp = tempfile::NamedTempFile::new_in(parent)
            .map_err(|e| ledger_error(path, format!("failed to create temp file: {e}")))?;
        tmp.write_all(content.as_bytes())
            .map_err(|e| ledger_error(path, format!("failed to write temp ledger: {e}")))?;
        tmp.as_file()
            .sync_all()
            .map_err(|e| ledger_error(path, format!("failed to sync temp ledger: {e}")))?;
        tmp.persist(path)
            .map_err(|e| ledger_error(path, format!("failed to replace ledger: {e}")))?;

        debug!(path = %path.display(), entries = self.entries.len(), "Saved install ledger");
        Ok(())
    }

    /// Add or replace the entry with the same name.
    pub fn upsert(&mut self, record: InstalledPluginRecord) {
        self.remove(&record.name);
        self.entries.push(record);
    }

    /// Remove an entry by name. Returns whether one was removed.
    pub fn remove(&mut self, name: &str) -> bool {
        let before = self.entries.len();
        self.entries.retain(|e| e.name != name);
        self.entries.len() < before
    }

    /// Look up an entry by name.
    #[must_use]
    pub fn get(&self, name: &str) -> Option<&InstalledPluginRecord> {
        self.entries.iter().find(|e| e.name == name)
    }

    /// All entries.
    #[must_use]
    pub fn entries(&self) -> &[InstalledPluginRecord] {
        &self.entries
    }

    /// Consume the ledger into its entries.
    #[must_use]
    pub fn into_entries(self) -> Vec<InstalledPluginRecord> {
        self.entries
    }
}

impl Default for InstallLedger {
    fn default() -> Self {
        Self::new()
    }
}

fn ledger_error(path: &Path, message: String) -> PluginError {
    PluginError::LedgerError {
        path: path.to_path_buf(),
        message,
    }
}

#[derive(Clone, Copy)]
enum LockMode {
    Shared,
    Exclusive,
}

/// Advisory lock on a `.lk` sibling of `path`; released on drop.
///
/// Shared mode does not create the lock file: with no lock file there is no
/// writer to coordinate with.
fn acquire_lock_file(path: &Path, mode: LockMode) -> PluginResult<Option<std::fs::File>> {
    let lock_path = path.with_extension("lk");

    match mode {
        LockMode::Shared => match std::fs::OpenOptions::new().read(true).open(&lock_path) {
            Ok(lock_file) => {
                lock_file.lock_shared().map_err(|e| {
                    ledger_error(path, format!("failed to acquire shared file lock: {e}"))
                })?;
                Ok(Some(lock_file))
            },
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(ledger_error(path, format!("failed to open lock file: {e}"))),
        },
        LockMode::Exclusive => {
            let lock_file = std::fs::OpenOptions::new()
                .create(true)
                .truncate(false)
                .write(true)
                .read(true)
                .open(&lock_path)
                .map_err(|e| ledger_error(path, format!("failed to open lock file: {e}")))?;
            lock_file.lock_exclusive().map_err(|e| {
                ledger_error(path, format!("failed to acquire exclusive file lock: {e}"))
            })?;
            Ok(Some(lock_file))
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(name: &str, status: InstalledStatus) -> InstalledPluginRecord {
        InstalledPluginRecord {
            name: name.into(),
            version: "1.0.0".into(),
            status,
            install_path: PathBuf::from(format!("/srv/plugins/{name}")),
            required_config_vars: vec!["API_KEY".into()],
            error_details: None,
            installed_at: Utc::now(),
            last_activated_at: None,
        }
    }

    #[test]
    fn missing_file_is_empty() {
        let dir = tempfile::tempdir().unwrap();
        let ledger = InstallLedger::load_or_default(&dir.path().join(LEDGER_FILE_NAME)).unwrap();
        assert!(ledger.entries().is_empty());
    }

    #[test]
    fn update_persists_entries() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(LEDGER_FILE_NAME);

        InstallLedger::update(&path, |l| {
            l.upsert(record("pkg-a", InstalledStatus::Installed));
            l.upsert(record("pkg-b", InstalledStatus::NeedsConfiguration));
            Ok(())
        })
        .unwrap();
        InstallLedger::update(&path, |l| {
            let mut a = record("pkg-a", InstalledStatus::Active);
            a.last_activated_at = Some(Utc::now());
            l.upsert(a);
            Ok(())
        })
        .unwrap();

        let ledger = InstallLedger::load_or_default(&path).unwrap();
        assert_eq!(ledger.entries().len(), 2);
        let a = ledger.get("pkg-a").unwrap();
        assert_eq!(a.status, InstalledStatus::Active);
        assert!(a.last_activated_at.is_some());
        assert_eq!(
            ledger.get("pkg-b").unwrap().status,
            InstalledStatus::NeedsConfiguration
        );

        let text = std::fs::read_to_string(&path).unwrap();
        assert!(text.starts_with("# Auto-generated"));
        assert!(text.contains("status = \"needs_configuration\""));
    }

    #[test]
    fn failed_update_leaves_file_untouched() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(LEDGER_FILE_NAME);
        InstallLedger::update(&path, |l| {
            l.upsert(record("pkg-a", InstalledStatus::Installed));
            Ok(())
        })
        .unwrap();

        let result = InstallLedger::update(&path, |l| {
            l.remove("pkg-a");
            Err(PluginError::NotInstalled("pkg-a".into()))
        });
        assert!(result.is_err());
        assert!(InstallLedger::load_or_default(&path).unwrap().get("pkg-a").is_some());
    }

    #[test]
    fn corrupt_file_is_ledger_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(LEDGER_FILE_NAME);
        std::fs::write(&path, "schema_version = \"one\"").unwrap();
        assert!(matches!(
            InstallLedger::load_or_default(&path),
            Err(PluginError::LedgerError { .. })
        ));
    }
}
