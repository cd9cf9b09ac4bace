//! Checkpoint storage.
//!
//! A checkpoint records that everything up to and including `offset` has been processed for
//! one partition of one consumer group. Receivers resume strictly after it.
//!
//! Writes go through a compare-and-set loop against a [`CheckpointBackend`]:
//!
//! - no stored checkpoint, or the caller already owns it: the write goes through;
//! - another owner holds it: the higher offset wins and the loser is logged, so two receivers
//!   briefly sharing a partition during a rebalance never move progress backwards.
//!
//! Losing the last few writes on a crash only causes already consumed records to be
//! processed again, which is why callers are free to checkpoint every N records.
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use time::OffsetDateTime;
use tracing::{debug, warn};

use crate::error::{Error, Result};
use crate::metrics_consts::{CHECKPOINT_CAS_RETRIES, CHECKPOINT_CONFLICTS, CHECKPOINT_UPDATES};
use crate::record::PartitionId;

const MAX_CAS_ATTEMPTS: u32 = 8;

#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CheckpointKey {
    pub stream: String,
    pub consumer_group: String,
    pub partition: PartitionId,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Checkpoint {
    pub partition: PartitionId,
    pub offset: u64,
    pub owner: String,
    #[serde(with = "time::serde::rfc3339")]
    pub updated_at: OffsetDateTime,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Versioned<T> {
    pub value: T,
    pub version: u64,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CasOutcome {
    Written { version: u64 },
    /// The stored version was not the expected one.
    VersionMismatch,
}

/// Durable key-value storage for checkpoints with conditional writes.
#[async_trait]
pub trait CheckpointBackend: Send + Sync {
    async fn load(&self, key: &CheckpointKey) -> Result<Option<Versioned<Checkpoint>>>;

    /// Write `checkpoint` only if the stored version is `expected` (`None`: nothing stored).
    async fn compare_and_set(
        &self,
        key: &CheckpointKey,
        expected: Option<u64>,
        checkpoint: &Checkpoint,
    ) -> Result<CasOutcome>;

    async fn delete(&self, key: &CheckpointKey) -> Result<()>;

    async fn list(&self, stream: &str, consumer_group: &str) -> Result<Vec<Checkpoint>>;
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum CheckpointOutcome {
    Accepted(Checkpoint),
    /// A different owner already recorded an offset at least as high.
    Ignored { stored: Checkpoint },
}

impl CheckpointOutcome {
    pub fn is_accepted(&self) -> bool {
        matches!(self, CheckpointOutcome::Accepted(_))
    }

    pub fn stored_offset(&self) -> u64 {
        match self {
            CheckpointOutcome::Accepted(c) => c.offset,
            CheckpointOutcome::Ignored { stored } => stored.offset,
        }
    }
}

/// Checkpoints of one consumer group on one stream.
#[derive(Clone)]
pub struct CheckpointStore {
    backend: Arc<dyn CheckpointBackend>,
    stream: String,
    consumer_group: String,
}

impl CheckpointStore {
    pub fn new(backend: Arc<dyn CheckpointBackend>, stream: &str, consumer_group: &str) -> Self {
        Self {
            backend,
            stream: stream.to_owned(),
            consumer_group: consumer_group.to_owned(),
        }
    }

    pub fn stream(&self) -> &str {
        &self.stream
    }

    pub fn consumer_group(&self) -> &str {
        &self.consumer_group
    }

    fn key(&self, partition: PartitionId) -> CheckpointKey {
        CheckpointKey {
            stream: self.stream.clone(),
            consumer_group: self.consumer_group.clone(),
            partition,
        }
    }

    pub async fn read(&self, partition: PartitionId) -> Result<Option<Checkpoint>> {
        Ok(self
            .backend
            .load(&self.key(partition))
            .await?
            .map(|versioned| versioned.value))
    }

    pub async fn list(&self) -> Result<Vec<Checkpoint>> {
        self.backend.list(&self.stream, &self.consumer_group).await
    }

    /// Explicitly forget the checkpoint of a partition.
    pub async fn reset(&self, partition: PartitionId) -> Result<()> {
        self.backend.delete(&self.key(partition)).await
    }

    /// Record `offset` as processed by `owner`.
    pub async fn update(
        &self,
        partition: PartitionId,
        offset: u64,
        owner: &str,
    ) -> Result<CheckpointOutcome> {
        let key = self.key(partition);
        let checkpoint = Checkpoint {
            partition,
            offset,
            owner: owner.to_owned(),
            updated_at: OffsetDateTime::now_utc(),
        };
        let mut last_seen = 0;

        for attempt in 1..=MAX_CAS_ATTEMPTS {
            let current = self.backend.load(&key).await?;
            let expected = current.as_ref().map(|v| v.version);

            if let Some(Versioned { value: stored, .. }) = current {
                last_seen = stored.offset;
                if stored.owner != owner {
                    if offset <= stored.offset {
                        warn!(
                            partition,
                            offset,
                            stored_offset = stored.offset,
                            loser = owner,
                            owner = %stored.owner,
                            "checkpoint ownership contested, keeping the higher stored offset"
                        );
                        let labels = [("outcome", "ignored")];
                        metrics::counter!(CHECKPOINT_CONFLICTS, &labels).increment(1);
                        return Ok(CheckpointOutcome::Ignored { stored });
                    }
                    warn!(
                        partition,
                        offset,
                        stored_offset = stored.offset,
                        loser = %stored.owner,
                        owner,
                        "checkpoint ownership contested, higher offset takes over"
                    );
                    let labels = [("outcome", "taken_over")];
                    metrics::counter!(CHECKPOINT_CONFLICTS, &labels).increment(1);
                }
            }

            match self.backend.compare_and_set(&key, expected, &checkpoint).await? {
                CasOutcome::Written { version } => {
                    debug!(partition, offset, owner, version, "checkpoint updated");
                    metrics::counter!(CHECKPOINT_UPDATES).increment(1);
                    return Ok(CheckpointOutcome::Accepted(checkpoint));
                }
                CasOutcome::VersionMismatch => {
                    debug!(partition, offset, attempt, "checkpoint changed underneath us, retrying");
                    metrics::counter!(CHECKPOINT_CAS_RETRIES).increment(1);
                }
            }
        }

        Err(Error::CheckpointConflict {
            partition,
            offset,
            stored: last_seen,
        })
    }
}

/// Backend holding checkpoints in process memory.
#[derive(Default)]
pub struct MemoryCheckpointBackend {
    entries: Mutex<HashMap<CheckpointKey, Versioned<Checkpoint>>>,
}

impl MemoryCheckpointBackend {
    pub fn new() -> Self {
        Self::default()
    }

    fn entries(&self) -> std::sync::MutexGuard<'_, HashMap<CheckpointKey, Versioned<Checkpoint>>> {
        self.entries
            .lock()
            .unwrap_or_else(|poison| poison.into_inner())
    }
}

#[async_trait]
impl CheckpointBackend for MemoryCheckpointBackend {
    async fn load(&self, key: &CheckpointKey) -> Result<Option<Versioned<Checkpoint>>> {
        Ok(self.entries().get(key).cloned())
    }

    async fn compare_and_set(
        &self,
        key: &CheckpointKey,
        expected: Option<u64>,
        checkpoint: &Checkpoint,
    ) -> Result<CasOutcome> {
        let mut entries = self.entries();
        let current = entries.get(key).map(|v| v.version);
        if current != expected {
            return Ok(CasOutcome::VersionMismatch);
        }
        let version = current.map_or(1, |v| v + 1);
        entries.insert(
            key.clone(),
            Versioned {
                value: checkpoint.clone(),
                version,
            },
        );
        Ok(CasOutcome::Written { version })
    }

    async fn delete(&self, key: &CheckpointKey) -> Result<()> {
        self.entries().remove(key);
        Ok(())
    }

    async fn list(&self, stream: &str, consumer_group: &str) -> Result<Vec<Checkpoint>> {
        let mut checkpoints: Vec<Checkpoint> = self
            .entries()
            .iter()
            .filter(|(k, _)| k.stream == stream && k.consumer_group == consumer_group)
            .map(|(_, v)| v.value.clone())
            .collect();
        checkpoints.sort_by_key(|c| c.partition);
        Ok(checkpoints)
    }
}

/// Backend storing one JSON document per checkpoint under a directory:
/// `<root>/<stream>/<consumer group>/<partition>.json`.
///
/// Documents are replaced through a temporary file and a rename. Compare-and-set is atomic
/// for every store sharing this backend instance.
pub struct FileCheckpointBackend {
    root: PathBuf,
    write_lock: tokio::sync::Mutex<()>,
}

impl FileCheckpointBackend {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            write_lock: tokio::sync::Mutex::new(()),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn group_dir(&self, stream: &str, consumer_group: &str) -> PathBuf {
        self.root.join(sanitize(stream)).join(sanitize(consumer_group))
    }

    fn path(&self, key: &CheckpointKey) -> PathBuf {
        self.group_dir(&key.stream, &key.consumer_group)
            .join(format!("{}.json", key.partition))
    }

    async fn read_document(path: &Path) -> Result<Option<Versioned<Checkpoint>>> {
        match tokio::fs::read(path).await {
            Ok(bytes) => serde_json::from_slice(&bytes)
                .map(Some)
                .map_err(|e| backend_error(path, e)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(backend_error(path, e)),
        }
    }
}

fn sanitize(component: &str) -> String {
    component
        .chars()
        .map(|c| match c {
            '/' | '\\' | ':' | '\0' => '_',
            c => c,
        })
        .collect()
}

fn backend_error(path: &Path, error: impl std::fmt::Display) -> Error {
    Error::CheckpointBackend(format!("{}: {}", path.display(), error))
}

#[async_trait]
impl CheckpointBackend for FileCheckpointBackend {
    async fn load(&self, key: &CheckpointKey) -> Result<Option<Versioned<Checkpoint>>> {
        Self::read_document(&self.path(key)).await
    }

    async fn compare_and_set(
        &self,
        key: &CheckpointKey,
        expected: Option<u64>,
        checkpoint: &Checkpoint,
    ) -> Result<CasOutcome> {
        let _guard = self.write_lock.lock().await;
        let path = self.path(key);

        let current = Self::read_document(&path).await?.map(|v| v.version);
        if current != expected {
            return Ok(CasOutcome::VersionMismatch);
        }
        let version = current.map_or(1, |v| v + 1);
        let document = Versioned {
            value: checkpoint.clone(),
            version,
        };
        let bytes = serde_json::to_vec_pretty(&document).map_err(|e| backend_error(&path, e))?;

        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| backend_error(parent, e))?;
        }
        let tmp = path.with_extension("json.tmp");
        tokio::fs::write(&tmp, bytes)
            .await
            .map_err(|e| backend_error(&tmp, e))?;
        tokio::fs::rename(&tmp, &path)
            .await
            .map_err(|e| backend_error(&path, e))?;

        Ok(CasOutcome::Written { version })
    }

    async fn delete(&self, key: &CheckpointKey) -> Result<()> {
        let _guard = self.write_lock.lock().await;
        let path = self.path(key);
        match tokio::fs::remove_file(&path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(backend_error(&path, e)),
        }
    }

    async fn list(&self, stream: &str, consumer_group: &str) -> Result<Vec<Checkpoint>> {
        let dir = self.group_dir(stream, consumer_group);
        let mut entries = match tokio::fs::read_dir(&dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(backend_error(&dir, e)),
        };

        let mut checkpoints = Vec::new();
        while let Some(entry) = entries
            .next_entry()
            .await
            .map_err(|e| backend_error(&dir, e))?
        {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            if let Some(document) = Self::read_document(&path).await? {
                checkpoints.push(document.value);
            }
        }
        checkpoints.sort_by_key(|c| c.partition);
        Ok(checkpoints)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn memory_store() -> CheckpointStore {
        CheckpointStore::new(Arc::new(MemoryCheckpointBackend::new()), "stream", "$Default")
    }

    #[tokio::test]
    async fn first_update_is_accepted() {
        let store = memory_store();
        assert_eq!(store.read(0).await.unwrap(), None);

        let outcome = store.update(0, 42, "owner-a").await.unwrap();
        assert!(outcome.is_accepted());

        let stored = store.read(0).await.unwrap().unwrap();
        assert_eq!(stored.offset, 42);
        assert_eq!(stored.owner, "owner-a");
    }

    #[tokio::test]
    async fn lower_offset_from_other_owner_is_ignored() {
        let store = memory_store();
        store.update(0, 42, "owner-a").await.unwrap();

        let outcome = store.update(0, 10, "owner-b").await.unwrap();
        assert!(!outcome.is_accepted());
        assert_eq!(outcome.stored_offset(), 42);

        let stored = store.read(0).await.unwrap().unwrap();
        assert_eq!((stored.offset, stored.owner.as_str()), (42, "owner-a"));
    }

    #[tokio::test]
    async fn higher_offset_from_other_owner_takes_over() {
        let store = memory_store();
        store.update(0, 42, "owner-a").await.unwrap();
        store.update(0, 50, "owner-b").await.unwrap();

        // The previous owner is now the contender.
        let outcome = store.update(0, 45, "owner-a").await.unwrap();
        assert!(!outcome.is_accepted());

        let stored = store.read(0).await.unwrap().unwrap();
        assert_eq!((stored.offset, stored.owner.as_str()), (50, "owner-b"));
    }

    #[tokio::test]
    async fn owner_updates_go_through() {
        let store = memory_store();
        store.update(3, 5, "owner-a").await.unwrap();
        store.update(3, 9, "owner-a").await.unwrap();

        assert_eq!(store.read(3).await.unwrap().unwrap().offset, 9);
    }

    #[tokio::test]
    async fn partitions_and_groups_are_independent() {
        let backend: Arc<dyn CheckpointBackend> = Arc::new(MemoryCheckpointBackend::new());
        let group_a = CheckpointStore::new(backend.clone(), "stream", "group-a");
        let group_b = CheckpointStore::new(backend, "stream", "group-b");

        group_a.update(0, 1, "owner").await.unwrap();
        group_a.update(1, 2, "owner").await.unwrap();
        group_b.update(0, 7, "owner").await.unwrap();

        let offsets: Vec<u64> = group_a.list().await.unwrap().iter().map(|c| c.offset).collect();
        assert_eq!(offsets, vec![1, 2]);
        assert_eq!(group_b.read(0).await.unwrap().unwrap().offset, 7);
    }

    #[tokio::test]
    async fn reset_forgets_checkpoint() {
        let store = memory_store();
        store.update(0, 42, "owner-a").await.unwrap();
        store.reset(0).await.unwrap();

        assert_eq!(store.read(0).await.unwrap(), None);
        assert!(store.update(0, 1, "owner-b").await.unwrap().is_accepted());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_contested_updates_keep_highest() {
        for round in 0..50 {
            let store = memory_store();
            let (low, high) = if round % 2 == 0 {
                ((10, "owner-a"), (20, "owner-b"))
            } else {
                ((20, "owner-b"), (10, "owner-a"))
            };

            let first = {
                let store = store.clone();
                tokio::spawn(async move { store.update(0, low.0, low.1).await })
            };
            let second = {
                let store = store.clone();
                tokio::spawn(async move { store.update(0, high.0, high.1).await })
            };
            first.await.unwrap().unwrap();
            second.await.unwrap().unwrap();

            assert_eq!(store.read(0).await.unwrap().unwrap().offset, 20);
        }
    }

    #[tokio::test]
    async fn file_backend_persists_across_instances() {
        let dir = tempfile::tempdir().unwrap();

        {
            let store = CheckpointStore::new(
                Arc::new(FileCheckpointBackend::new(dir.path())),
                "stream",
                "$Default",
            );
            store.update(2, 17, "owner-a").await.unwrap();
            store.update(0, 4, "owner-a").await.unwrap();
        }

        let store = CheckpointStore::new(
            Arc::new(FileCheckpointBackend::new(dir.path())),
            "stream",
            "$Default",
        );
        let stored = store.read(2).await.unwrap().unwrap();
        assert_eq!((stored.offset, stored.owner.as_str()), (17, "owner-a"));

        let partitions: Vec<PartitionId> =
            store.list().await.unwrap().iter().map(|c| c.partition).collect();
        assert_eq!(partitions, vec![0, 2]);

        assert!(!store.update(2, 3, "owner-b").await.unwrap().is_accepted());
        store.reset(2).await.unwrap();
        assert_eq!(store.read(2).await.unwrap(), None);
    }

    #[tokio::test]
    async fn file_backend_rejects_stale_versions() {
        let dir = tempfile::tempdir().unwrap();
        let backend = FileCheckpointBackend::new(dir.path());
        let key = CheckpointKey {
            stream: "stream".to_owned(),
            consumer_group: "group".to_owned(),
            partition: 0,
        };
        let checkpoint = Checkpoint {
            partition: 0,
            offset: 1,
            owner: "owner".to_owned(),
            updated_at: OffsetDateTime::UNIX_EPOCH,
        };

        assert_eq!(
            backend.compare_and_set(&key, None, &checkpoint).await.unwrap(),
            CasOutcome::Written { version: 1 }
        );
        assert_eq!(
            backend.compare_and_set(&key, None, &checkpoint).await.unwrap(),
            CasOutcome::VersionMismatch
        );
        assert_eq!(
            backend.compare_and_set(&key, Some(1), &checkpoint).await.unwrap(),
            CasOutcome::Written { version: 2 }
        );
    }
}
