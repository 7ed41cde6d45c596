//! Job result memoization keyed by fingerprint. A cache only ever stores what a job produced,
//! never how to reproduce it; looking one up is always conditioned on the calling job's flags
//! and, for a successful result, on whether the files that result references still exist.

use async_trait::async_trait;
use hither_base::{Fingerprint, JobFlags, RuntimeInfo, Value};
use hither_store::ContentStore;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Mutex;

/// What a cache has recorded for one fingerprint: either the job finished with a result, or it
/// ran and errored. There is no "still running" record -- a job only gets cached once it reaches
/// a terminal, non-cancelled status (a cancelled job was never allowed to finish on its own
/// terms, so it has nothing meaningful to memoize).
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum CacheRecord {
    Finished {
        result: Value,
        runtime_info: RuntimeInfo,
    },
    Errored {
        error_message: String,
        runtime_info: RuntimeInfo,
    },
}

#[derive(Debug)]
pub enum CacheLookup {
    Hit(CacheRecord),
    Miss,
}

/// Storage and retrieval of [`CacheRecord`]s by [`Fingerprint`]. `lookup` takes the requesting
/// job's flags and a content store because whether a stored record counts as a hit depends on
/// both: `force_run`/`cache_failing`/`rerun_failing` gate whether a record is eligible at all,
/// and a `Finished` record is only a hit if every file it references still exists.
#[async_trait]
pub trait JobCache: Send + Sync {
    async fn lookup(
        &self,
        fingerprint: &Fingerprint,
        flags: &JobFlags,
        store: &dyn ContentStore,
    ) -> anyhow::Result<CacheLookup>;

    async fn record(&self, fingerprint: &Fingerprint, record: CacheRecord) -> anyhow::Result<()>;
}

/// Whether a stored record is usable given the requesting job's flags, independent of file
/// existence (which the caller checks separately, since it needs an async content-store call
/// the sync policy function below can't make).
fn record_eligible(record: &CacheRecord, flags: &JobFlags) -> bool {
    if flags.force_run {
        return false;
    }
    match record {
        CacheRecord::Finished { .. } => true,
        CacheRecord::Errored { .. } => flags.cache_failing && !flags.rerun_failing,
    }
}

async fn finished_result_still_valid(result: &Value, store: &dyn ContentStore) -> bool {
    for file_ref in result.file_refs() {
        if !store.exists_local(&file_ref.sha1_path).await {
            return false;
        }
    }
    true
}

async fn evaluate_lookup(
    stored: Option<CacheRecord>,
    flags: &JobFlags,
    store: &dyn ContentStore,
) -> CacheLookup {
    let Some(record) = stored else {
        return CacheLookup::Miss;
    };
    if !record_eligible(&record, flags) {
        return CacheLookup::Miss;
    }
    if let CacheRecord::Finished { result, .. } = &record {
        if !finished_result_still_valid(result, store).await {
            return CacheLookup::Miss;
        }
    }
    CacheLookup::Hit(record)
}

/// Enforces the monotonic write rule shared by every [`JobCache`] implementation: a `Finished`
/// record, once stored, is never overwritten by a later `Errored` record for the same
/// fingerprint. This matters because a job can be cached as finished, then a *different*
/// concurrent run of the same fingerprint can fail for an unrelated reason (e.g. a worker was
/// killed); that failure must not poison a memoized success.
fn should_overwrite(existing: Option<&CacheRecord>, new: &CacheRecord) -> bool {
    !matches!(
        (existing, new),
        (Some(CacheRecord::Finished { .. }), CacheRecord::Errored { .. })
    )
}

/// An in-memory cache, scoped to one process. Useful for tests and for a compute resource that
/// doesn't need memoization to survive a restart.
#[derive(Default)]
pub struct MemoryJobCache {
    records: Mutex<HashMap<Fingerprint, CacheRecord>>,
}

impl MemoryJobCache {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl JobCache for MemoryJobCache {
    async fn lookup(
        &self,
        fingerprint: &Fingerprint,
        flags: &JobFlags,
        store: &dyn ContentStore,
    ) -> anyhow::Result<CacheLookup> {
        let stored = self
            .records
            .lock()
            .expect("cache mutex poisoned")
            .get(fingerprint)
            .cloned();
        Ok(evaluate_lookup(stored, flags, store).await)
    }

    async fn record(&self, fingerprint: &Fingerprint, record: CacheRecord) -> anyhow::Result<()> {
        let mut records = self.records.lock().expect("cache mutex poisoned");
        let existing = records.get(fingerprint);
        if should_overwrite(existing, &record) {
            records.insert(fingerprint.clone(), record);
        }
        Ok(())
    }
}

/// A cache backed by one JSON file per fingerprint under `root`. Survives process restarts;
/// intended for a long-lived compute resource.
pub struct DirJobCache {
    root: PathBuf,
}

impl DirJobCache {
    pub async fn new(root: impl Into<PathBuf>) -> anyhow::Result<Self> {
        let root = root.into();
        tokio::fs::create_dir_all(&root).await?;
        Ok(Self { root })
    }

    fn path_for(&self, fingerprint: &Fingerprint) -> PathBuf {
        self.root.join(format!("{}.json", fingerprint.to_hex()))
    }

    async fn read(&self, fingerprint: &Fingerprint) -> anyhow::Result<Option<CacheRecord>> {
        let path = self.path_for(fingerprint);
        match tokio::fs::read(&path).await {
            Ok(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }
}

#[async_trait]
impl JobCache for DirJobCache {
    async fn lookup(
        &self,
        fingerprint: &Fingerprint,
        flags: &JobFlags,
        store: &dyn ContentStore,
    ) -> anyhow::Result<CacheLookup> {
        let stored = self.read(fingerprint).await?;
        Ok(evaluate_lookup(stored, flags, store).await)
    }

    async fn record(&self, fingerprint: &Fingerprint, record: CacheRecord) -> anyhow::Result<()> {
        let existing = self.read(fingerprint).await?;
        if should_overwrite(existing.as_ref(), &record) {
            let path = self.path_for(fingerprint);
            let bytes = serde_json::to_vec_pretty(&record)?;
            tokio::fs::write(&path, bytes).await?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use hither_base::{FileKind, FileRef, Sha256Hex};
    use hither_store::LocalContentStore;

    fn flags() -> JobFlags {
        JobFlags::default()
    }

    #[tokio::test]
    async fn finished_result_is_a_hit_when_its_files_exist() {
        let store_dir = tempfile::tempdir().unwrap();
        let store = LocalContentStore::new(store_dir.path()).await.unwrap();
        let hash = store.put_bytes(b"data").await.unwrap();

        let cache = MemoryJobCache::new();
        let fp = Fingerprint::from_hasher(<sha2::Sha256 as sha2::Digest>::new());
        let result = Value::file(FileRef {
            sha1_path: hash,
            item_type: FileKind::Raw,
        });
        cache
            .record(
                &fp,
                CacheRecord::Finished {
                    result,
                    runtime_info: RuntimeInfo::default(),
                },
            )
            .await
            .unwrap();

        let lookup = cache.lookup(&fp, &flags(), &store).await.unwrap();
        assert!(matches!(lookup, CacheLookup::Hit(CacheRecord::Finished { .. })));
    }

    #[tokio::test]
    async fn finished_result_misses_when_its_file_is_gone() {
        let store_dir = tempfile::tempdir().unwrap();
        let store = LocalContentStore::new(store_dir.path()).await.unwrap();
        let missing_hash = Sha256Hex::of_bytes(b"never stored");

        let cache = MemoryJobCache::new();
        let fp = Fingerprint::from_hasher(<sha2::Sha256 as sha2::Digest>::new());
        let result = Value::file(FileRef {
            sha1_path: missing_hash,
            item_type: FileKind::Raw,
        });
        cache
            .record(
                &fp,
                CacheRecord::Finished {
                    result,
                    runtime_info: RuntimeInfo::default(),
                },
            )
            .await
            .unwrap();

        let lookup = cache.lookup(&fp, &flags(), &store).await.unwrap();
        assert!(matches!(lookup, CacheLookup::Miss));
    }

    #[tokio::test]
    async fn errored_record_is_a_miss_unless_cache_failing_and_not_rerun_failing() {
        let store_dir = tempfile::tempdir().unwrap();
        let store = LocalContentStore::new(store_dir.path()).await.unwrap();
        let cache = MemoryJobCache::new();
        let fp = Fingerprint::from_hasher(<sha2::Sha256 as sha2::Digest>::new());
        cache
            .record(
                &fp,
                CacheRecord::Errored {
                    error_message: "boom".into(),
                    runtime_info: RuntimeInfo::default(),
                },
            )
            .await
            .unwrap();

        assert!(matches!(
            cache.lookup(&fp, &flags(), &store).await.unwrap(),
            CacheLookup::Miss
        ));

        let cache_failing = JobFlags {
            cache_failing: true,
            ..JobFlags::default()
        };
        match cache.lookup(&fp, &cache_failing, &store).await.unwrap() {
            CacheLookup::Hit(CacheRecord::Errored { runtime_info, .. }) => {
                assert_eq!(runtime_info, RuntimeInfo::default());
            }
            other => panic!("expected an errored hit, got {other:?}"),
        }

        let rerun_failing = JobFlags {
            cache_failing: true,
            rerun_failing: true,
            ..JobFlags::default()
        };
        assert!(matches!(
            cache.lookup(&fp, &rerun_failing, &store).await.unwrap(),
            CacheLookup::Miss
        ));
    }

    #[tokio::test]
    async fn force_run_always_misses() {
        let store_dir = tempfile::tempdir().unwrap();
        let store = LocalContentStore::new(store_dir.path()).await.unwrap();
        let cache = MemoryJobCache::new();
        let fp = Fingerprint::from_hasher(<sha2::Sha256 as sha2::Digest>::new());
        cache
            .record(
                &fp,
                CacheRecord::Finished {
                    result: Value::Int(1),
                    runtime_info: RuntimeInfo::default(),
                },
            )
            .await
            .unwrap();

        let force_run = JobFlags {
            force_run: true,
            ..JobFlags::default()
        };
        assert!(matches!(
            cache.lookup(&fp, &force_run, &store).await.unwrap(),
            CacheLookup::Miss
        ));
    }

    #[tokio::test]
    async fn a_finished_record_is_never_overwritten_by_a_later_error() {
        let cache = MemoryJobCache::new();
        let fp = Fingerprint::from_hasher(<sha2::Sha256 as sha2::Digest>::new());
        cache
            .record(
                &fp,
                CacheRecord::Finished {
                    result: Value::Int(7),
                    runtime_info: RuntimeInfo::default(),
                },
            )
            .await
            .unwrap();
        cache
            .record(
                &fp,
                CacheRecord::Errored {
                    error_message: "later failure".into(),
                    runtime_info: RuntimeInfo::default(),
                },
            )
            .await
            .unwrap();

        let store_dir = tempfile::tempdir().unwrap();
        let store = LocalContentStore::new(store_dir.path()).await.unwrap();
        match cache.lookup(&fp, &flags(), &store).await.unwrap() {
            CacheLookup::Hit(CacheRecord::Finished { result, .. }) => {
                assert_eq!(result, Value::Int(7));
            }
            other => panic!("expected the original finished record to survive, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn dir_cache_round_trips_through_disk() {
        let cache_dir = tempfile::tempdir().unwrap();
        let cache = DirJobCache::new(cache_dir.path()).await.unwrap();
        let store_dir = tempfile::tempdir().unwrap();
        let store = LocalContentStore::new(store_dir.path()).await.unwrap();

        let fp = Fingerprint::from_hasher(<sha2::Sha256 as sha2::Digest>::new());
        cache
            .record(
                &fp,
                CacheRecord::Finished {
                    result: Value::Str("ok".into()),
                    runtime_info: RuntimeInfo::default(),
                },
            )
            .await
            .unwrap();

        match cache.lookup(&fp, &flags(), &store).await.unwrap() {
            CacheLookup::Hit(CacheRecord::Finished { result, .. }) => {
                assert_eq!(result, Value::Str("ok".into()));
            }
            other => panic!("expected a finished hit, got {other:?}"),
        }
    }
}
