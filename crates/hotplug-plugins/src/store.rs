//! In-memory plugin records, registration audit trail and per-plugin locks.

use std::sync::Arc;

use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use tokio::sync::{Mutex, OwnedMutexGuard};

use crate::component::ComponentRegistration;
use crate::error::{PluginError, PluginResult};
use crate::plugin::{PluginId, PluginRecord, PluginStatus};

/// Plugin records keyed by id.
///
/// Map access never spans an await; lifecycle transitions serialize on the
/// guard returned by [`PluginStore::lock`] instead.
#[derive(Default)]
pub struct PluginStore {
    records: DashMap<PluginId, PluginRecord>,
    registrations: DashMap<PluginId, Vec<ComponentRegistration>>,
    locks: DashMap<PluginId, Arc<Mutex<()>>>,
}

impl PluginStore {
    /// An empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Wait for exclusive access to one plugin's lifecycle.
    ///
    /// Different ids never contend.
    pub async fn lock(&self, id: PluginId) -> OwnedMutexGuard<()> {
        let mutex = self.locks.entry(id).or_default().value().clone();
        mutex.lock_owned().await
    }

    /// Insert a new record.
    ///
    /// # Errors
    ///
    /// Returns [`PluginError::AlreadyRegistered`] if the id is taken.
    pub fn insert(&self, record: PluginRecord) -> PluginResult<()> {
        match self.records.entry(record.id) {
            Entry::Occupied(_) => Err(PluginError::AlreadyRegistered(record.id)),
            Entry::Vacant(slot) => {
                slot.insert(record);
                Ok(())
            },
        }
    }

    /// Snapshot of one record.
    #[must_use]
    pub fn get(&self, id: &PluginId) -> Option<PluginRecord> {
        self.records.get(id).map(|r| r.value().clone())
    }

    /// Mutate a record in place.
    ///
    /// # Errors
    ///
    /// Returns [`PluginError::NotFound`] if there is no such record.
    pub fn update<R>(
        &self,
        id: &PluginId,
        f: impl FnOnce(&mut PluginRecord) -> R,
    ) -> PluginResult<R> {
        let mut record = self.records.get_mut(id).ok_or(PluginError::NotFound(*id))?;
        Ok(f(record.value_mut()))
    }

    /// Snapshots of every record, oldest first.
    #[must_use]
    pub fn all(&self) -> Vec<PluginRecord> {
        let mut records: Vec<_> = self.records.iter().map(|r| r.value().clone()).collect();
        records.sort_by(|a, b| {
            a.created_at
                .cmp(&b.created_at)
                .then_with(|| a.name.cmp(&b.name))
        });
        records
    }

    /// Snapshots of records with the given status.
    #[must_use]
    pub fn with_status(&self, status: PluginStatus) -> Vec<PluginRecord> {
        let mut records = self.all();
        records.retain(|r| r.status == status);
        records
    }

    /// Id of the record loaded from installed package `package`.
    #[must_use]
    pub fn find_installed(&self, package: &str) -> Option<PluginId> {
        self.records
            .iter()
            .find(|r| r.installed_name.as_deref() == Some(package))
            .map(|r| *r.key())
    }

    /// Number of records.
    #[must_use]
    pub fn len(&self) -> usize {
        self.records.len()
    }

    /// Whether the store is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Append audit entries for a plugin.
    pub fn record_registrations(&self, id: PluginId, entries: Vec<ComponentRegistration>) {
        if entries.is_empty() {
            return;
        }
        self.registrations.entry(id).or_default().extend(entries);
    }

    /// Audit entries for a plugin, in registration order.
    #[must_use]
    pub fn registrations(&self, id: &PluginId) -> Vec<ComponentRegistration> {
        self.registrations
            .get(id)
            .map(|r| r.value().clone())
            .unwrap_or_default()
    }

    /// Drop a plugin's entire audit trail.
    pub fn clear_registrations(&self, id: &PluginId) {
        self.registrations.remove(id);
    }
}
