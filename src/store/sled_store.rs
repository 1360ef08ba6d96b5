use std::path::Path;

use async_trait::async_trait;
use sled::transaction::{ConflictableTransactionError, TransactionError, TransactionalTree};

use super::{EntityStore, RecordTxn, StoreError};
use crate::model::{Entity, EntityKey};

/// Embedded key-value store backed by sled.
///
/// Each upsert runs as a sled transaction over every key it touches. sled
/// retries the closure on conflict, so concurrent merges into the same story
/// or user serialize instead of losing edges, while writes to unrelated keys
/// proceed in parallel.
#[derive(Debug, Clone)]
pub struct SledEntityStore {
    db: sled::Db,
}

impl SledEntityStore {
    pub fn open(path: impl AsRef<Path>) -> Result<Self, StoreError> {
        let db = sled::open(path)?;
        Ok(Self { db })
    }

    pub fn temporary() -> Result<Self, StoreError> {
        let db = sled::Config::new().temporary(true).open()?;
        Ok(Self { db })
    }

    pub fn record_count(&self) -> usize {
        self.db.len()
    }

    pub async fn flush(&self) -> Result<(), StoreError> {
        self.db.flush_async().await?;
        Ok(())
    }

    async fn blocking<T, F>(&self, f: F) -> Result<T, StoreError>
    where
        T: Send + 'static,
        F: FnOnce(&sled::Db) -> Result<T, StoreError> + Send + 'static,
    {
        let db = self.db.clone();
        tokio::task::spawn_blocking(move || f(&db))
            .await
            .map_err(|err| StoreError::Background(format!("join sled task: {err}")))?
    }
}

struct SledTxn<'a> {
    tree: &'a TransactionalTree,
}

impl RecordTxn for SledTxn<'_> {
    type Error = ConflictableTransactionError<StoreError>;

    fn load(&mut self, key: &str) -> Result<Option<Vec<u8>>, Self::Error> {
        Ok(self.tree.get(key.as_bytes())?.map(|value| value.to_vec()))
    }

    fn save(&mut self, key: &str, value: Vec<u8>) -> Result<(), Self::Error> {
        self.tree.insert(key.as_bytes(), value)?;
        Ok(())
    }

    fn abort(err: StoreError) -> Self::Error {
        ConflictableTransactionError::Abort(err)
    }
}

#[async_trait]
impl EntityStore for SledEntityStore {
    async fn upsert(&self, entity: Entity) -> Result<(), StoreError> {
        self.blocking(move |db| {
            db.transaction(|tree| {
                let mut txn = SledTxn { tree };
                super::apply_upsert(&mut txn, &entity)
            })
            .map_err(|err| match err {
                TransactionError::Abort(err) => err,
                TransactionError::Storage(err) => StoreError::Engine(err),
            })
        })
        .await
    }

    async fn exists(&self, key: &EntityKey) -> Result<bool, StoreError> {
        let key = key.clone();
        self.blocking(move |db| match db.get(key.to_string().as_bytes())? {
            Some(bytes) => super::record_exists(&key, &bytes),
            None => Ok(false),
        })
        .await
    }

    async fn exists_with_title(&self, key: &EntityKey) -> Result<bool, StoreError> {
        let key = key.clone();
        self.blocking(move |db| match db.get(key.to_string().as_bytes())? {
            Some(bytes) => super::record_has_title(&key, &bytes),
            None => Ok(false),
        })
        .await
    }

    async fn get(&self, key: &EntityKey) -> Result<Entity, StoreError> {
        let key = key.clone();
        self.blocking(move |db| read_entity(db, &key)).await
    }

    async fn get_many(&self, keys: &[EntityKey]) -> Result<Vec<Entity>, StoreError> {
        let keys = keys.to_vec();
        self.blocking(move |db| keys.iter().map(|key| read_entity(db, key)).collect())
            .await
    }
}

fn read_entity(db: &sled::Db, key: &EntityKey) -> Result<Entity, StoreError> {
    let bytes = db
        .get(key.to_string().as_bytes())?
        .ok_or_else(|| StoreError::NotFound(key.to_string()))?;
    super::decode_entity(key, &bytes)
}
