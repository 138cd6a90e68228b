//! Key-value store for the scraper hand-off and run bookkeeping.
//!
//! Values are strings or string sets, each with an optional expiry. Expired
//! entries read as absent.

use std::collections::{BTreeSet, HashMap};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use uuid::Uuid;

use crate::StoreError;

#[async_trait]
pub trait SnapshotStore: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<String>, StoreError>;

    async fn set(&self, key: &str, value: &str) -> Result<(), StoreError>;

    async fn set_ex(&self, key: &str, value: &str, ttl: Duration) -> Result<(), StoreError>;

    /// Write several string entries with one shared expiry.
    async fn set_many_ex(
        &self,
        entries: &[(String, String)],
        ttl: Duration,
    ) -> Result<(), StoreError> {
        for (key, value) in entries {
            self.set_ex(key, value, ttl).await?;
        }
        Ok(())
    }

    /// Add members to a set, returning how many were new.
    async fn sadd(&self, key: &str, members: &[String]) -> Result<usize, StoreError>;

    async fn smembers(&self, key: &str) -> Result<BTreeSet<String>, StoreError>;

    async fn scard(&self, key: &str) -> Result<usize, StoreError> {
        Ok(self.smembers(key).await?.len())
    }

    /// Set an expiry on an existing key; false when the key is absent.
    async fn expire(&self, key: &str, ttl: Duration) -> Result<bool, StoreError>;

    async fn delete(&self, key: &str) -> Result<bool, StoreError>;
}

pub async fn get_json<T, S>(store: &S, key: &str) -> Result<Option<T>, StoreError>
where
    T: DeserializeOwned,
    S: SnapshotStore + ?Sized,
{
    match store.get(key).await? {
        Some(raw) => Ok(Some(serde_json::from_str(&raw)?)),
        None => Ok(None),
    }
}

pub async fn set_json<T, S>(
    store: &S,
    key: &str,
    value: &T,
    ttl: Option<Duration>,
) -> Result<(), StoreError>
where
    T: Serialize + ?Sized,
    S: SnapshotStore + ?Sized,
{
    let raw = serde_json::to_string(value)?;
    match ttl {
        Some(ttl) => store.set_ex(key, &raw, ttl).await,
        None => store.set(key, &raw).await,
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
enum SnapshotValue {
    Text { value: String },
    Set { members: BTreeSet<String> },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
struct SnapshotEntry {
    key: String,
    value: SnapshotValue,
    expires_at: Option<DateTime<Utc>>,
}

impl SnapshotEntry {
    fn text(key: &str, value: &str, expires_at: Option<DateTime<Utc>>) -> Self {
        Self {
            key: key.to_string(),
            value: SnapshotValue::Text {
                value: value.to_string(),
            },
            expires_at,
        }
    }

    fn is_live(&self, now: DateTime<Utc>) -> bool {
        self.expires_at.map_or(true, |at| at > now)
    }

    fn as_text(&self) -> Result<&str, StoreError> {
        match &self.value {
            SnapshotValue::Text { value } => Ok(value),
            SnapshotValue::Set { .. } => Err(StoreError::WrongKind {
                key: self.key.clone(),
                expected: "string",
            }),
        }
    }

    fn members(&self) -> Result<&BTreeSet<String>, StoreError> {
        match &self.value {
            SnapshotValue::Set { members } => Ok(members),
            SnapshotValue::Text { .. } => Err(StoreError::WrongKind {
                key: self.key.clone(),
                expected: "set",
            }),
        }
    }

    /// Merge `new` into the set; a missing entry starts empty without expiry.
    fn add_members(
        entry: Option<Self>,
        key: &str,
        new: &[String],
    ) -> Result<(Self, usize), StoreError> {
        let mut entry = entry.unwrap_or_else(|| Self {
            key: key.to_string(),
            value: SnapshotValue::Set {
                members: BTreeSet::new(),
            },
            expires_at: None,
        });
        let SnapshotValue::Set { members } = &mut entry.value else {
            return Err(StoreError::WrongKind {
                key: key.to_string(),
                expected: "set",
            });
        };
        let added = new.iter().filter(|m| members.insert((*m).clone())).count();
        Ok((entry, added))
    }
}

fn expiry(now: DateTime<Utc>, ttl: Duration) -> Option<DateTime<Utc>> {
    chrono::Duration::from_std(ttl)
        .ok()
        .and_then(|d| now.checked_add_signed(d))
}

/// Shared in-memory snapshot store. Clones share state.
#[derive(Debug, Clone, Default)]
pub struct MemorySnapshotStore {
    entries: Arc<Mutex<HashMap<String, SnapshotEntry>>>,
    fail_writes: Arc<AtomicBool>,
}

impl MemorySnapshotStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every write fail until switched off.
    pub fn fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::SeqCst);
    }

    /// Remaining lifetime of a live key; `None` when absent or without expiry.
    pub async fn ttl(&self, key: &str) -> Option<Duration> {
        let now = Utc::now();
        let entries = self.entries.lock().await;
        let entry = entries.get(key).filter(|e| e.is_live(now))?;
        entry.expires_at.and_then(|at| (at - now).to_std().ok())
    }

    fn check_writable(&self) -> Result<(), StoreError> {
        if self.fail_writes.load(Ordering::SeqCst) {
            return Err(StoreError::Unavailable(
                "snapshot store rejected write".to_string(),
            ));
        }
        Ok(())
    }

    async fn live_entry(&self, key: &str) -> Option<SnapshotEntry> {
        let now = Utc::now();
        let mut entries = self.entries.lock().await;
        match entries.get(key).map(|e| e.is_live(now)) {
            Some(true) => entries.get(key).cloned(),
            Some(false) => {
                entries.remove(key);
                None
            }
            None => None,
        }
    }
}

#[async_trait]
impl SnapshotStore for MemorySnapshotStore {
    async fn get(&self, key: &str) -> Result<Option<String>, StoreError> {
        match self.live_entry(key).await {
            Some(entry) => Ok(Some(entry.as_text()?.to_string())),
            None => Ok(None),
        }
    }

    async fn set(&self, key: &str, value: &str) -> Result<(), StoreError> {
        self.check_writable()?;
        self.entries
            .lock()
            .await
            .insert(key.to_string(), SnapshotEntry::text(key, value, None));
        Ok(())
    }

    async fn set_ex(&self, key: &str, value: &str, ttl: Duration) -> Result<(), StoreError> {
        self.check_writable()?;
        let entry = SnapshotEntry::text(key, value, expiry(Utc::now(), ttl));
        self.entries.lock().await.insert(key.to_string(), entry);
        Ok(())
    }

    async fn sadd(&self, key: &str, members: &[String]) -> Result<usize, StoreError> {
        self.check_writable()?;
        let now = Utc::now();
        let mut entries = self.entries.lock().await;
        let current = entries.get(key).filter(|e| e.is_live(now)).cloned();
        let (entry, added) = SnapshotEntry::add_members(current, key, members)?;
        entries.insert(key.to_string(), entry);
        Ok(added)
    }

    async fn smembers(&self, key: &str) -> Result<BTreeSet<String>, StoreError> {
        match self.live_entry(key).await {
            Some(entry) => Ok(entry.members()?.clone()),
            None => Ok(BTreeSet::new()),
        }
    }

    async fn expire(&self, key: &str, ttl: Duration) -> Result<bool, StoreError> {
        self.check_writable()?;
        let now = Utc::now();
        let mut entries = self.entries.lock().await;
        match entries.get_mut(key) {
            Some(entry) if entry.is_live(now) => {
                entry.expires_at = expiry(now, ttl);
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn delete(&self, key: &str) -> Result<bool, StoreError> {
        self.check_writable()?;
        Ok(self.entries.lock().await.remove(key).is_some())
    }
}

/// Snapshot store persisted as one JSON file per key under `root`.
#[derive(Debug, Clone)]
pub struct FileSnapshotStore {
    root: PathBuf,
    write_lock: Arc<Mutex<()>>,
}

impl FileSnapshotStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            write_lock: Arc::new(Mutex::new(())),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn entry_path(&self, key: &str) -> PathBuf {
        let mut hasher = Sha256::new();
        hasher.update(key.as_bytes());
        self.root
            .join(format!("{}.json", hex::encode(hasher.finalize())))
    }

    async fn read_entry(&self, key: &str) -> Result<Option<SnapshotEntry>, StoreError> {
        let path = self.entry_path(key);
        let bytes = match fs::read(&path).await {
            Ok(bytes) => bytes,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(err) => return Err(err.into()),
        };
        let entry: SnapshotEntry = serde_json::from_slice(&bytes)?;
        if entry.is_live(Utc::now()) {
            Ok(Some(entry))
        } else {
            let _ = fs::remove_file(&path).await;
            Ok(None)
        }
    }

    /// Atomic temp-file write + rename so readers never see a partial entry.
    async fn write_entry(&self, entry: &SnapshotEntry) -> Result<(), StoreError> {
        fs::create_dir_all(&self.root).await?;
        let path = self.entry_path(&entry.key);
        let temp_path = self.root.join(format!(".{}.tmp", Uuid::new_v4()));

        let bytes = serde_json::to_vec(entry)?;
        let mut file = fs::OpenOptions::new()
            .create_new(true)
            .write(true)
            .open(&temp_path)
            .await?;
        file.write_all(&bytes).await?;
        file.flush().await?;
        drop(file);

        if let Err(err) = fs::rename(&temp_path, &path).await {
            let _ = fs::remove_file(&temp_path).await;
            return Err(err.into());
        }
        Ok(())
    }
}

#[async_trait]
impl SnapshotStore for FileSnapshotStore {
    async fn get(&self, key: &str) -> Result<Option<String>, StoreError> {
        match self.read_entry(key).await? {
            Some(entry) => Ok(Some(entry.as_text()?.to_string())),
            None => Ok(None),
        }
    }

    async fn set(&self, key: &str, value: &str) -> Result<(), StoreError> {
        let _guard = self.write_lock.lock().await;
        self.write_entry(&SnapshotEntry::text(key, value, None)).await
    }

    async fn set_ex(&self, key: &str, value: &str, ttl: Duration) -> Result<(), StoreError> {
        let _guard = self.write_lock.lock().await;
        self.write_entry(&SnapshotEntry::text(key, value, expiry(Utc::now(), ttl)))
            .await
    }

    async fn sadd(&self, key: &str, members: &[String]) -> Result<usize, StoreError> {
        let _guard = self.write_lock.lock().await;
        let current = self.read_entry(key).await?;
        let (entry, added) = SnapshotEntry::add_members(current, key, members)?;
        self.write_entry(&entry).await?;
        Ok(added)
    }

    async fn smembers(&self, key: &str) -> Result<BTreeSet<String>, StoreError> {
        match self.read_entry(key).await? {
            Some(entry) => Ok(entry.members()?.clone()),
            None => Ok(BTreeSet::new()),
        }
    }

    async fn expire(&self, key: &str, ttl: Duration) -> Result<bool, StoreError> {
        let _guard = self.write_lock.lock().await;
        let Some(mut entry) = self.read_entry(key).await? else {
            return Ok(false);
        };
        entry.expires_at = expiry(Utc::now(), ttl);
        self.write_entry(&entry).await?;
        Ok(true)
    }

    async fn delete(&self, key: &str) -> Result<bool, StoreError> {
        let _guard = self.write_lock.lock().await;
        match fs::remove_file(self.entry_path(key)).await {
            Ok(()) => Ok(true),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(err) => Err(err.into()),
        }
    }
}
