use std::collections::{BTreeMap, BTreeSet};

use tokio::sync::Mutex;
use tracing::debug;

use crate::backend::SharedBackend;
use crate::error::Result;

/// Serialized, idempotent changes to the backend mount table.
///
/// Every call holds one process-wide lock for the whole read-then-write, so two
/// tenants provisioning at once cannot race each other into a duplicate mount.
/// Concurrent changes made outside the broker are not guarded against.
pub struct MountTable {
    backend: SharedBackend,
    lock: Mutex<()>,
}

impl MountTable {
    pub fn new(backend: SharedBackend) -> Self {
        Self {
            backend,
            lock: Mutex::new(()),
        }
    }

    /// Mount every `path -> type` entry that is not mounted yet. The first
    /// failure aborts the call; mounts created before it stay in place.
    pub async fn ensure_mounts(&self, wanted: &BTreeMap<String, String>) -> Result<()> {
        let _guard = self.lock.lock().await;
        let existing = self.current().await?;

        for (path, kind) in wanted {
            let path = normalize(path);
            if existing.contains(path) {
                continue;
            }
            debug!(%path, %kind, "mounting backend");
            self.backend
                .mount(path, kind)
                .await
                .map_err(|err| err.context(format!("failed to mount {path} ({kind})")))?;
        }
        Ok(())
    }

    /// Unmount every path that is currently mounted; absent paths are skipped.
    pub async fn remove_mounts(&self, paths: &[String]) -> Result<()> {
        let _guard = self.lock.lock().await;
        let existing = self.current().await?;

        for path in paths {
            let path = normalize(path);
            if !existing.contains(path) {
                continue;
            }
            debug!(%path, "unmounting backend");
            self.backend
                .unmount(path)
                .await
                .map_err(|err| err.context(format!("failed to unmount {path}")))?;
        }
        Ok(())
    }

    async fn current(&self) -> Result<BTreeSet<String>> {
        let table = self
            .backend
            .list_mounts()
            .await
            .map_err(|err| err.context("failed to list mounts"))?;
        Ok(table
            .keys()
            .map(|path| normalize(path).to_string())
            .collect())
    }
}

/// Strip leading and trailing separators.
pub fn normalize(path: &str) -> &str {
    path.trim_matches('/')
}

/// `path=type` pairs in path order, for log lines.
pub fn describe(mounts: &BTreeMap<String, String>) -> String {
    mounts
        .iter()
        .map(|(path, kind)| format!("{path}={kind}"))
        .collect::<Vec<_>>()
        .join(", ")
}
