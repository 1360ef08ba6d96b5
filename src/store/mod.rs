//! Keyed persistence for stories and users.
//!
//! Records are JSON blobs keyed by the entity key string (`story:ao3:100`,
//! `user:ffnet:42`). Merging happens in application code inside one atomic
//! read-modify-write per upsert, covering the entity itself and every
//! relationship backlink it implies, so both sides of an edge always land
//! together.

mod memory;
mod sled_store;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::model::{Entity, EntityKey, Story, StoryKey, User, UserKey};

pub use memory::MemoryEntityStore;
pub use sled_store::SledEntityStore;

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("entity not found: {0}")]
    NotFound(String),

    #[error("encode record {key}: {source}")]
    Encode {
        key: String,
        #[source]
        source: serde_json::Error,
    },

    #[error("decode record {key}: {source}")]
    Decode {
        key: String,
        #[source]
        source: serde_json::Error,
    },

    #[error("corrupt record {key}: {reason}")]
    Corrupt { key: String, reason: String },

    #[error("storage engine: {0}")]
    Engine(#[from] sled::Error),

    #[error("storage task: {0}")]
    Background(String),
}

impl StoreError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, StoreError::NotFound(_))
    }
}

#[async_trait]
pub trait EntityStore: Send + Sync {
    /// Writes a story or user. Scalars are last-write-wins, relationship sets
    /// are merged, and the reverse side of every relationship is updated in
    /// the same atomic unit.
    async fn upsert(&self, entity: Entity) -> Result<(), StoreError>;

    /// True once a record has been written for `key`, including existence-only
    /// records. Backlink stubs do not count.
    async fn exists(&self, key: &EntityKey) -> Result<bool, StoreError>;

    /// True when the record carries content: a story title or a user name.
    async fn exists_with_title(&self, key: &EntityKey) -> Result<bool, StoreError>;

    async fn get(&self, key: &EntityKey) -> Result<Entity, StoreError>;

    /// One entity per key in input order. Any missing key fails the batch.
    async fn get_many(&self, keys: &[EntityKey]) -> Result<Vec<Entity>, StoreError>;

    async fn get_story(&self, key: &StoryKey) -> Result<Story, StoreError> {
        into_story(self.get(&EntityKey::Story(*key)).await?)
    }

    async fn get_stories(&self, keys: &[StoryKey]) -> Result<Vec<Story>, StoreError> {
        let keys = keys.iter().copied().map(EntityKey::Story).collect::<Vec<_>>();
        self.get_many(&keys)
            .await?
            .into_iter()
            .map(into_story)
            .collect()
    }

    async fn get_user(&self, key: &UserKey) -> Result<User, StoreError> {
        into_user(self.get(&EntityKey::User(key.clone())).await?)
    }

    async fn get_users(&self, keys: &[UserKey]) -> Result<Vec<User>, StoreError> {
        let keys = keys.iter().cloned().map(EntityKey::User).collect::<Vec<_>>();
        self.get_many(&keys)
            .await?
            .into_iter()
            .map(into_user)
            .collect()
    }
}

fn into_story(entity: Entity) -> Result<Story, StoreError> {
    match entity {
        Entity::Story(story) => Ok(story),
        Entity::User(user) => Err(StoreError::Corrupt {
            key: user.key().to_string(),
            reason: "expected a story record".to_owned(),
        }),
    }
}

fn into_user(entity: Entity) -> Result<User, StoreError> {
    match entity {
        Entity::User(user) => Ok(user),
        Entity::Story(story) => Err(StoreError::Corrupt {
            key: story.key().to_string(),
            reason: "expected a user record".to_owned(),
        }),
    }
}

/// Persisted envelope. `stub` marks records that were only created to hold a
/// backlink and have never been written for their own key.
#[derive(Debug, Serialize, Deserialize)]
struct Stored<T> {
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    stub: bool,
    #[serde(flatten)]
    entity: T,
}

#[derive(Debug, Deserialize)]
struct Probe {
    #[serde(default)]
    stub: bool,
    #[serde(default, rename = "Title")]
    title: String,
    #[serde(default, rename = "Name")]
    name: String,
}

fn probe(key: &EntityKey, bytes: &[u8]) -> Result<Probe, StoreError> {
    serde_json::from_slice(bytes).map_err(|source| StoreError::Decode {
        key: key.to_string(),
        source,
    })
}

pub(crate) fn record_exists(key: &EntityKey, bytes: &[u8]) -> Result<bool, StoreError> {
    Ok(!probe(key, bytes)?.stub)
}

pub(crate) fn record_has_title(key: &EntityKey, bytes: &[u8]) -> Result<bool, StoreError> {
    let probe = probe(key, bytes)?;
    let text = match key {
        EntityKey::Story(_) => probe.title,
        EntityKey::User(_) => probe.name,
    };
    Ok(!text.is_empty())
}

pub(crate) fn decode_entity(key: &EntityKey, bytes: &[u8]) -> Result<Entity, StoreError> {
    let decode_err = |source| StoreError::Decode {
        key: key.to_string(),
        source,
    };
    let entity = match key {
        EntityKey::Story(_) => {
            let stored: Stored<Story> = serde_json::from_slice(bytes).map_err(decode_err)?;
            Entity::Story(stored.entity)
        }
        EntityKey::User(_) => {
            let stored: Stored<User> = serde_json::from_slice(bytes).map_err(decode_err)?;
            Entity::User(stored.entity)
        }
    };
    if entity.key() != *key {
        return Err(StoreError::Corrupt {
            key: key.to_string(),
            reason: format!("record identity is {}", entity.key()),
        });
    }
    Ok(entity)
}

/// Read-modify-write view over a backend for the duration of one upsert.
pub(crate) trait RecordTxn {
    type Error;

    fn load(&mut self, key: &str) -> Result<Option<Vec<u8>>, Self::Error>;
    fn save(&mut self, key: &str, value: Vec<u8>) -> Result<(), Self::Error>;
    fn abort(err: StoreError) -> Self::Error;
}

fn load_record<T, R>(txn: &mut T, key: &str) -> Result<Option<Stored<R>>, T::Error>
where
    T: RecordTxn,
    R: serde::de::DeserializeOwned,
{
    let Some(bytes) = txn.load(key)? else {
        return Ok(None);
    };
    serde_json::from_slice(&bytes)
        .map(Some)
        .map_err(|source| {
            T::abort(StoreError::Decode {
                key: key.to_owned(),
                source,
            })
        })
}

fn save_record<T, R>(txn: &mut T, key: &str, record: &Stored<R>) -> Result<(), T::Error>
where
    T: RecordTxn,
    R: Serialize,
{
    let bytes = serde_json::to_vec(record).map_err(|source| {
        T::abort(StoreError::Encode {
            key: key.to_owned(),
            source,
        })
    })?;
    txn.save(key, bytes)
}

pub(crate) fn apply_upsert<T: RecordTxn>(txn: &mut T, entity: &Entity) -> Result<(), T::Error> {
    match entity {
        Entity::Story(story) => upsert_story(txn, story),
        Entity::User(user) => upsert_user(txn, user),
    }
}

fn upsert_story<T: RecordTxn>(txn: &mut T, incoming: &Story) -> Result<(), T::Error> {
    let key = incoming.key();
    let record_key = key.to_string();
    let existing = load_record::<T, Story>(txn, &record_key)?.map(|stored| stored.entity);

    let mut merged = if incoming.exists {
        incoming.clone()
    } else {
        Story::absent(key)
    };
    merged.url.clear();
    merged.dl.clear();
    merged.score = None;
    merged.favorited_by.extend(incoming.favorited_by.iter().cloned());
    merged.author = incoming.author.clone();

    let previous_author = existing.as_ref().and_then(|story| story.author.clone());
    if let Some(existing) = existing {
        merged.favorited_by.extend(existing.favorited_by);
        if merged.author.is_none() {
            merged.author = existing.author;
        }
    }

    save_record(
        txn,
        &record_key,
        &Stored {
            stub: false,
            entity: &merged,
        },
    )?;

    for user in &incoming.favorited_by {
        update_user(txn, user, true, |u| {
            u.favorite_stories.insert(key);
        })?;
    }
    if let Some(author) = &incoming.author {
        if let Some(previous) = previous_author.filter(|previous| previous != author) {
            update_user(txn, &previous, false, |u| {
                u.stories.remove(&key);
            })?;
        }
        update_user(txn, author, true, |u| {
            u.stories.insert(key);
        })?;
    }

    Ok(())
}

fn upsert_user<T: RecordTxn>(txn: &mut T, incoming: &User) -> Result<(), T::Error> {
    let key = incoming.key();
    let record_key = key.to_string();
    let existing = load_record::<T, User>(txn, &record_key)?.map(|stored| stored.entity);

    let mut merged = User::new(key.clone());
    if incoming.exists {
        merged.exists = true;
        merged.name = incoming.name.clone();
    }
    if let Some(existing) = existing {
        merged.stories = existing.stories;
        merged.favorite_stories = existing.favorite_stories;
        merged.favorite_authors = existing.favorite_authors;
        merged.favorited_by = existing.favorited_by;
    }
    merged.stories.extend(incoming.stories.iter().copied());
    merged
        .favorite_stories
        .extend(incoming.favorite_stories.iter().copied());
    merged
        .favorite_authors
        .extend(incoming.favorite_authors.iter().cloned());
    merged.favorited_by.extend(incoming.favorited_by.iter().cloned());

    save_record(
        txn,
        &record_key,
        &Stored {
            stub: false,
            entity: &merged,
        },
    )?;

    for story in &incoming.favorite_stories {
        update_story(txn, story, |s| {
            s.favorited_by.insert(key.clone());
        })?;
    }
    for story in &incoming.stories {
        let mut previous_author = None;
        update_story(txn, story, |s| {
            previous_author = s.author.replace(key.clone());
        })?;
        if let Some(previous) = previous_author.filter(|previous| *previous != key) {
            update_user(txn, &previous, false, |u| {
                u.stories.remove(story);
            })?;
        }
    }
    for author in &incoming.favorite_authors {
        update_user(txn, author, true, |u| {
            u.favorited_by.insert(key.clone());
        })?;
    }
    for fan in &incoming.favorited_by {
        update_user(txn, fan, true, |u| {
            u.favorite_authors.insert(key.clone());
        })?;
    }

    Ok(())
}

/// Applies `f` to a story record, creating a stub when it does not exist yet.
fn update_story<T, F>(txn: &mut T, key: &StoryKey, f: F) -> Result<(), T::Error>
where
    T: RecordTxn,
    F: FnOnce(&mut Story),
{
    let record_key = key.to_string();
    let mut record = load_record::<T, Story>(txn, &record_key)?.unwrap_or_else(|| Stored {
        stub: true,
        entity: Story::new(*key),
    });
    f(&mut record.entity);
    save_record(txn, &record_key, &record)
}

/// Applies `f` to a user record. Missing users become stubs when `create` is
/// set and are skipped otherwise.
fn update_user<T, F>(txn: &mut T, key: &UserKey, create: bool, f: F) -> Result<(), T::Error>
where
    T: RecordTxn,
    F: FnOnce(&mut User),
{
    let record_key = key.to_string();
    let mut record = match load_record::<T, User>(txn, &record_key)? {
        Some(record) => record,
        None if create => Stored {
            stub: true,
            entity: User::new(key.clone()),
        },
        None => return Ok(()),
    };
    f(&mut record.entity);
    save_record(txn, &record_key, &record)
}
