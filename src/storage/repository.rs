use super::file_store::AtomicFileStore;
use crate::config::AppConfig;
use crate::core::Result;
use crate::model::{InventoryRecord, NaturalKey};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Mutex;
use tracing::debug;

#[derive(Default)]
struct CacheState {
    records: Option<Arc<Vec<InventoryRecord>>>,
    captured_at: Option<Instant>,
}

impl CacheState {
    fn fresh(&self, ttl: Duration) -> Option<Arc<Vec<InventoryRecord>>> {
        match (&self.records, self.captured_at) {
            (Some(records), Some(at)) if at.elapsed() < ttl => Some(Arc::clone(records)),
            _ => None,
        }
    }

    fn capture(&mut self, records: Arc<Vec<InventoryRecord>>) {
        self.records = Some(records);
        self.captured_at = Some(Instant::now());
    }

    fn clear(&mut self) {
        self.records = None;
        self.captured_at = None;
    }
}

/// Working copy handed to [`RecordRepository::modify`].
///
/// All methods operate on the content read at the start of the critical
/// section; nothing is written unless one of them changed it.
#[derive(Debug)]
pub struct RecordSet {
    records: Vec<InventoryRecord>,
    dirty: bool,
}

impl RecordSet {
    fn new(records: Vec<InventoryRecord>) -> Self {
        Self {
            records,
            dirty: false,
        }
    }

    pub fn records(&self) -> &[InventoryRecord] {
        &self.records
    }

    pub fn get_by_id(&self, id: u64) -> Option<&InventoryRecord> {
        self.records.iter().find(|record| record.id == id)
    }

    pub fn find_by_natural_key(&self, key: NaturalKey<'_>) -> Option<&InventoryRecord> {
        self.records
            .iter()
            .find(|record| record.natural_key() == key)
    }

    /// Next id: one past the highest id present, or 1 for an empty set.
    pub fn next_id(&self) -> u64 {
        self.records.iter().map(|record| record.id).max().unwrap_or(0) + 1
    }

    /// Appends `record`, numbering it first if it is unassigned.
    pub fn add(&mut self, mut record: InventoryRecord) -> InventoryRecord {
        if record.is_unassigned() {
            record.id = self.next_id();
        }
        self.records.push(record.clone());
        self.dirty = true;
        record
    }

    /// Replaces the record with the same id. Returns `false` if there is none.
    pub fn update(&mut self, record: InventoryRecord) -> bool {
        match self.records.iter_mut().find(|existing| existing.id == record.id) {
            Some(existing) => {
                *existing = record;
                self.dirty = true;
                true
            }
            None => false,
        }
    }

    /// Removes the record with `id`. Returns `false` if there is none.
    pub fn delete(&mut self, id: u64) -> bool {
        match self.records.iter().position(|record| record.id == id) {
            Some(index) => {
                self.records.remove(index);
                self.dirty = true;
                true
            }
            None => false,
        }
    }
}

/// Inventory records served from an [`AtomicFileStore`] through a short-TTL
/// read cache.
///
/// One exclusive section per repository serialises every mutation and every
/// cache refresh. Mutations start from the file, not the cache, and install
/// what they wrote as the new cache content, so they are visible to the next
/// read regardless of the TTL.
pub struct RecordRepository {
    store: AtomicFileStore,
    ttl: Duration,
    state: Mutex<CacheState>,
}

impl RecordRepository {
    pub fn new(store: AtomicFileStore, ttl: Duration) -> Self {
        Self {
            store,
            ttl,
            state: Mutex::new(CacheState::default()),
        }
    }

    /// Repository over the configured data file with the configured TTL.
    pub fn from_config(config: &AppConfig) -> Self {
        Self::new(AtomicFileStore::new(config.data_file()), config.cache_ttl)
    }

    pub fn store(&self) -> &AtomicFileStore {
        &self.store
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    async fn snapshot(&self) -> Arc<Vec<InventoryRecord>> {
        let mut state = self.state.lock().await;
        if let Some(records) = state.fresh(self.ttl) {
            return records;
        }
        let records = Arc::new(self.store.read().await);
        debug!(count = records.len(), "record cache refreshed");
        state.capture(Arc::clone(&records));
        records
    }

    pub async fn get_all(&self) -> Vec<InventoryRecord> {
        self.snapshot().await.as_ref().clone()
    }

    pub async fn get_by_id(&self, id: u64) -> Option<InventoryRecord> {
        self.snapshot()
            .await
            .iter()
            .find(|record| record.id == id)
            .cloned()
    }

    pub async fn find_by_natural_key(
        &self,
        product_family: &str,
        spare_part: &str,
    ) -> Option<InventoryRecord> {
        let key = NaturalKey::new(product_family, spare_part);
        self.snapshot()
            .await
            .iter()
            .find(|record| record.natural_key() == key)
            .cloned()
    }

    /// Runs `operation` against the current file content inside the
    /// exclusive section and persists the result if it changed anything.
    ///
    /// Composite operations (read, decide, write) go through here so that no
    /// other writer can interleave. If `operation` fails nothing is written.
    pub async fn modify<T, F>(&self, operation: F) -> Result<T>
    where
        F: FnOnce(&mut RecordSet) -> Result<T>,
    {
        let mut state = self.state.lock().await;
        let mut set = RecordSet::new(self.store.read_for_update().await?);
        let value = operation(&mut set)?;

        if set.dirty {
            self.store.write(&set.records).await?;
            state.capture(Arc::new(set.records));
        }
        Ok(value)
    }

    /// Stores `record`, assigning `max(id) + 1` when its id is unassigned.
    pub async fn add(&self, record: InventoryRecord) -> Result<InventoryRecord> {
        self.modify(|set| Ok(set.add(record))).await
    }

    /// Replaces the record with the same id; `Ok(false)` when it is absent.
    pub async fn update(&self, record: InventoryRecord) -> Result<bool> {
        self.modify(|set| Ok(set.update(record))).await
    }

    /// Deletes by id; `Ok(false)` when it is absent.
    pub async fn delete(&self, id: u64) -> Result<bool> {
        self.modify(|set| Ok(set.delete(id))).await
    }

    /// Drops the cached content so the next read goes to the file.
    pub async fn invalidate_cache(&self) {
        self.state.lock().await.clear();
    }
}
