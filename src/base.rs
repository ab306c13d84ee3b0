//! Copy-on-write base bookkeeping.
//!
//! A base is a registered, snapshot-backed template from which instances are
//! cloned without copying bulk bytes. The registry tracks base metadata and
//! provides the ordering the clone protocol requires: registration and
//! deletion of a base hold its writer gate, concurrent clones of the same
//! base share the reader gate, and unrelated bases are fully independent.

use crate::error::{Error, Result};
use getset::{CopyGetters, Getters};
use log::{debug, info};
use serde::Serialize;
use std::{
    collections::HashMap,
    future::Future,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, Mutex,
    },
    time::{SystemTime, UNIX_EPOCH},
};
use strum::{AsRefStr, Display, EnumString};
use tokio::sync::RwLock;

#[derive(
    AsRefStr, Clone, Copy, Debug, Display, EnumString, Eq, PartialEq, Serialize,
)]
#[strum(serialize_all = "lowercase", ascii_case_insensitive)]
#[serde(rename_all = "lowercase")]
/// Native snapshot mechanism backing a base.
pub enum StorageKind {
    /// `zfs snapshot` + `zfs clone`.
    Zfs,
    /// Read-only base image + qcow2 overlay with `backing_file`.
    Qcow2,
    /// Immutable master disk + linked VM clone.
    Linked,
    /// Instance marked as a template, copied with snapshot semantics.
    Template,
}

#[derive(Clone, CopyGetters, Debug, Getters, Serialize)]
/// Published metadata of one registered base.
pub struct BaseImage {
    #[get = "pub"]
    name: String,

    #[get = "pub"]
    /// The instance or image the snapshot was taken from.
    source: String,

    #[get_copy = "pub"]
    storage_kind: StorageKind,

    #[get = "pub"]
    /// Backend-specific handle of the snapshot.
    snapshot_ref: String,

    #[get_copy = "pub"]
    /// Milliseconds since the Unix epoch.
    created_at: u64,

    #[get_copy = "pub"]
    clone_count: u64,
}

struct BaseEntry {
    gate: RwLock<()>,
    meta: Mutex<BaseImage>,
    defunct: AtomicBool,
}

/// In-process table of registered bases.
#[derive(Default)]
pub struct BaseRegistry {
    entries: Mutex<HashMap<String, Arc<BaseEntry>>>,
}

impl BaseRegistry {
    fn entry(&self, name: &str) -> Option<Arc<BaseEntry>> {
        self.entries
            .lock()
            .expect("base registry lock")
            .get(name)
            .cloned()
    }

    fn live_entry(&self, name: &str) -> Result<Arc<BaseEntry>> {
        match self.entry(name) {
            Some(entry) if !entry.defunct.load(Ordering::SeqCst) => Ok(entry),
            _ => Err(Error::not_found(format!("no base named {:?}", name))),
        }
    }

    /// Register a base, running `snapshot` (the backend work producing the
    /// storage kind and snapshot handle) under the base's writer gate.
    /// Idempotent by `(name, source)`: re-registering the same pair returns
    /// the existing record without touching the backend; the same name with
    /// a different source is a conflict.
    pub async fn register<Fut>(
        &self,
        name: &str,
        source: &str,
        snapshot: Fut,
    ) -> Result<BaseImage>
    where
        Fut: Future<Output = Result<(StorageKind, String)>>,
    {
        let entry = {
            let mut entries = self.entries.lock().expect("base registry lock");
            Arc::clone(entries.entry(name.to_string()).or_insert_with(|| {
                Arc::new(BaseEntry {
                    gate: RwLock::new(()),
                    meta: Mutex::new(BaseImage {
                        name: name.to_string(),
                        source: String::new(),
                        storage_kind: StorageKind::Template,
                        snapshot_ref: String::new(),
                        created_at: 0,
                        clone_count: 0,
                    }),
                    defunct: AtomicBool::new(false),
                })
            }))
        };

        let _write = entry.gate.write().await;

        {
            let meta = entry.meta.lock().expect("base meta lock");
            if !meta.snapshot_ref.is_empty() && !entry.defunct.load(Ordering::SeqCst) {
                if meta.source == source {
                    debug!("Base {:?} already registered from {:?}", name, source);
                    return Ok(meta.clone());
                }
                return Err(Error::conflict(format!(
                    "base {:?} is already registered from {:?}",
                    name, meta.source
                )));
            }
        }

        let (storage_kind, snapshot_ref) = snapshot.await?;

        let mut meta = entry.meta.lock().expect("base meta lock");
        meta.source = source.to_string();
        meta.storage_kind = storage_kind;
        meta.snapshot_ref = snapshot_ref;
        meta.created_at = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis() as u64)
            .unwrap_or(0);
        meta.clone_count = 0;
        entry.defunct.store(false, Ordering::SeqCst);
        info!("Registered base {:?} ({})", name, meta.storage_kind);
        Ok(meta.clone())
    }

    /// Run `work` (the backend clone) under the base's reader gate and bump
    /// the clone count on success. Concurrent clones of one base proceed in
    /// parallel; registration and deletion of it wait for them.
    pub async fn clone_from<T, Fut>(&self, name: &str, work: Fut) -> Result<(T, BaseImage)>
    where
        Fut: Future<Output = Result<T>>,
    {
        let entry = self.live_entry(name)?;
        let _read = entry.gate.read().await;
        if entry.defunct.load(Ordering::SeqCst) {
            return Err(Error::not_found(format!("no base named {:?}", name)));
        }

        let outcome = work.await?;

        let mut meta = entry.meta.lock().expect("base meta lock");
        meta.clone_count += 1;
        Ok((outcome, meta.clone()))
    }

    /// Drop one clone reference, e.g. when a cloned instance is removed.
    pub fn release(&self, name: &str) {
        if let Some(entry) = self.entry(name) {
            let mut meta = entry.meta.lock().expect("base meta lock");
            meta.clone_count = meta.clone_count.saturating_sub(1);
        }
    }

    /// Delete a base, running `work` (the backend snapshot removal) under
    /// the writer gate. Refused while clones exist unless forced.
    pub async fn delete<Fut>(&self, name: &str, force: bool, work: Fut) -> Result<BaseImage>
    where
        Fut: Future<Output = Result<()>>,
    {
        let entry = self.live_entry(name)?;
        let _write = entry.gate.write().await;
        if entry.defunct.load(Ordering::SeqCst) {
            return Err(Error::not_found(format!("no base named {:?}", name)));
        }

        let meta = entry.meta.lock().expect("base meta lock").clone();
        if meta.clone_count > 0 && !force {
            return Err(Error::conflict(format!(
                "base {:?} has {} clone(s); pass force=true to delete anyway",
                name, meta.clone_count
            )));
        }

        work.await?;

        entry.defunct.store(true, Ordering::SeqCst);
        self.entries
            .lock()
            .expect("base registry lock")
            .remove(name);
        info!("Deleted base {:?}", name);
        Ok(meta)
    }

    pub fn get(&self, name: &str) -> Result<BaseImage> {
        let entry = self.live_entry(name)?;
        let meta = entry.meta.lock().expect("base meta lock").clone();
        if meta.snapshot_ref.is_empty() {
            return Err(Error::not_found(format!("no base named {:?}", name)));
        }
        Ok(meta)
    }

    /// Snapshot of all registered bases, ordered by name.
    pub fn list(&self) -> Vec<BaseImage> {
        let mut all: Vec<_> = self
            .entries
            .lock()
            .expect("base registry lock")
            .values()
            .filter(|entry| !entry.defunct.load(Ordering::SeqCst))
            .map(|entry| entry.meta.lock().expect("base meta lock").clone())
            .filter(|meta| !meta.snapshot_ref.is_empty())
            .collect();
        all.sort_by(|a, b| a.name.cmp(&b.name));
        all
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;

    async fn snapshot_ok() -> Result<(StorageKind, String)> {
        Ok((StorageKind::Template, "snap-1".to_string()))
    }

    #[tokio::test]
    async fn register_and_list() {
        let registry = BaseRegistry::default();
        let base = registry.register("b1", "web-1", snapshot_ok()).await.unwrap();
        assert_eq!(base.name(), "b1");
        assert_eq!(base.snapshot_ref(), "snap-1");
        assert_eq!(registry.list().len(), 1);
    }

    #[tokio::test]
    async fn register_is_idempotent_by_name_and_source() {
        let registry = BaseRegistry::default();
        registry.register("b1", "web-1", snapshot_ok()).await.unwrap();

        // same pair: no second snapshot is taken
        let again = registry
            .register("b1", "web-1", async {
                panic!("snapshot must not run for an idempotent registration")
            })
            .await
            .unwrap();
        assert_eq!(again.snapshot_ref(), "snap-1");

        // same name, different source: conflict
        let err = registry
            .register("b1", "web-2", snapshot_ok())
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Conflict);
    }

    #[tokio::test]
    async fn clone_counts_and_deletion_guard() {
        let registry = BaseRegistry::default();
        registry.register("b1", "web-1", snapshot_ok()).await.unwrap();

        for expected in 1..=3u64 {
            let (_, base) = registry
                .clone_from("b1", async { Ok(()) })
                .await
                .unwrap();
            assert_eq!(base.clone_count(), expected);
        }

        let err = registry
            .delete("b1", false, async { Ok(()) })
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Conflict);

        registry.delete("b1", true, async { Ok(()) }).await.unwrap();
        assert!(registry.get("b1").is_err());
        assert!(registry.list().is_empty());
    }

    #[tokio::test]
    async fn release_allows_deletion() {
        let registry = BaseRegistry::default();
        registry.register("b1", "web-1", snapshot_ok()).await.unwrap();
        registry.clone_from("b1", async { Ok(()) }).await.unwrap();
        registry.release("b1");
        registry.delete("b1", false, async { Ok(()) }).await.unwrap();
    }

    #[tokio::test]
    async fn failed_clone_leaves_count_unchanged() {
        let registry = BaseRegistry::default();
        registry.register("b1", "web-1", snapshot_ok()).await.unwrap();
        let result = registry
            .clone_from::<(), _>("b1", async {
                Err(Error::backend_unavailable("clone failed"))
            })
            .await;
        assert!(result.is_err());
        assert_eq!(registry.get("b1").unwrap().clone_count(), 0);
    }

    #[tokio::test]
    async fn clone_of_unknown_base() {
        let registry = BaseRegistry::default();
        let err = registry
            .clone_from("ghost", async { Ok(()) })
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::NotFound);
    }

    #[tokio::test]
    async fn concurrent_clones_share_the_reader_gate() {
        let registry = Arc::new(BaseRegistry::default());
        registry.register("b1", "web-1", snapshot_ok()).await.unwrap();

        let mut handles = Vec::new();
        for _ in 0..3 {
            let registry = Arc::clone(&registry);
            handles.push(tokio::spawn(async move {
                BaseRegistry::clone_from(&registry, "b1", async {
                    tokio::time::sleep(std::time::Duration::from_millis(10)).await;
                    Ok(())
                })
                .await
                .map(|(_, base)| base.clone_count())
            }));
        }
        for handle in handles {
            assert!(handle.await.unwrap().is_ok());
        }
        assert_eq!(registry.get("b1").unwrap().clone_count(), 3);
    }
}
