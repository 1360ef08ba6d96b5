use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard};

use async_trait::async_trait;

use super::{EntityStore, RecordTxn, StoreError};
use crate::model::{Entity, EntityKey};

/// In-process store for tests and throwaway runs. Upserts are applied under
/// one short-lived lock, so they are atomic across every key they touch.
#[derive(Debug, Default)]
pub struct MemoryEntityStore {
    records: Mutex<HashMap<String, Vec<u8>>>,
}

impl MemoryEntityStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.lock().map(|records| records.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn lock(&self) -> Result<MutexGuard<'_, HashMap<String, Vec<u8>>>, StoreError> {
        self.records
            .lock()
            .map_err(|_| StoreError::Background("memory store lock poisoned".to_owned()))
    }
}

/// Buffers writes until the whole upsert succeeds.
struct MemoryTxn<'a> {
    base: &'a HashMap<String, Vec<u8>>,
    staged: HashMap<String, Vec<u8>>,
}

impl RecordTxn for MemoryTxn<'_> {
    type Error = StoreError;

    fn load(&mut self, key: &str) -> Result<Option<Vec<u8>>, StoreError> {
        Ok(self
            .staged
            .get(key)
            .or_else(|| self.base.get(key))
            .cloned())
    }

    fn save(&mut self, key: &str, value: Vec<u8>) -> Result<(), StoreError> {
        self.staged.insert(key.to_owned(), value);
        Ok(())
    }

    fn abort(err: StoreError) -> StoreError {
        err
    }
}

#[async_trait]
impl EntityStore for MemoryEntityStore {
    async fn upsert(&self, entity: Entity) -> Result<(), StoreError> {
        let mut records = self.lock()?;
        let mut txn = MemoryTxn {
            base: &*records,
            staged: HashMap::new(),
        };
        super::apply_upsert(&mut txn, &entity)?;
        let staged = txn.staged;
        records.extend(staged);
        Ok(())
    }

    async fn exists(&self, key: &EntityKey) -> Result<bool, StoreError> {
        let records = self.lock()?;
        match records.get(&key.to_string()) {
            Some(bytes) => super::record_exists(key, bytes),
            None => Ok(false),
        }
    }

    async fn exists_with_title(&self, key: &EntityKey) -> Result<bool, StoreError> {
        let records = self.lock()?;
        match records.get(&key.to_string()) {
            Some(bytes) => super::record_has_title(key, bytes),
            None => Ok(false),
        }
    }

    async fn get(&self, key: &EntityKey) -> Result<Entity, StoreError> {
        let records = self.lock()?;
        let bytes = records
            .get(&key.to_string())
            .ok_or_else(|| StoreError::NotFound(key.to_string()))?;
        super::decode_entity(key, bytes)
    }

    async fn get_many(&self, keys: &[EntityKey]) -> Result<Vec<Entity>, StoreError> {
        let records = self.lock()?;
        keys.iter()
            .map(|key| {
                let bytes = records
                    .get(&key.to_string())
                    .ok_or_else(|| StoreError::NotFound(key.to_string()))?;
                super::decode_entity(key, bytes)
            })
            .collect()
    }
}
