use std::collections::BTreeSet;

use tracing::debug;

use crate::backend::{Data, SharedBackend};
use crate::error::Result;
use crate::records::{self, BindingRecord, TenantRecord};

/// Durable record layout under the broker state root:
/// `<root>/<instance>` for tenants and `<root>/<instance>/<binding>` for bindings.
#[derive(Clone)]
pub struct StateStore {
    backend: SharedBackend,
    root: String,
}

impl StateStore {
    pub fn new(backend: SharedBackend, root: impl Into<String>) -> Self {
        let root = root.into().trim_matches('/').to_string();
        Self { backend, root }
    }

    pub fn root(&self) -> &str {
        &self.root
    }

    pub fn tenant_path(&self, instance_id: &str) -> String {
        format!("{}/{instance_id}", self.root)
    }

    pub fn binding_path(&self, instance_id: &str, binding_id: &str) -> String {
        format!("{}/{instance_id}/{binding_id}", self.root)
    }

    pub async fn read_tenant(&self, instance_id: &str) -> Result<Option<TenantRecord>> {
        let path = self.tenant_path(instance_id);
        let Some(data) = self.read_data(&path).await? else {
            return Ok(None);
        };
        let mut record: TenantRecord = records::decode(&path, &data)?;
        if record.instance_id.is_empty() {
            record.instance_id = instance_id.to_string();
        }
        Ok(Some(record))
    }

    pub async fn write_tenant(&self, record: &TenantRecord) -> Result<()> {
        let path = self.tenant_path(&record.instance_id);
        debug!(%path, "storing instance metadata");
        let data = records::encode(&path, record)?;
        self.backend
            .write(&path, data)
            .await
            .map_err(|err| err.context(format!("failed to commit instance {path}")))
    }

    pub async fn delete_tenant(&self, instance_id: &str) -> Result<()> {
        let path = self.tenant_path(instance_id);
        debug!(%path, "deleting instance metadata");
        self.backend
            .delete(&path)
            .await
            .map_err(|err| err.context(format!("failed to delete instance info at {path}")))
    }

    pub async fn read_binding(
        &self,
        instance_id: &str,
        binding_id: &str,
    ) -> Result<Option<BindingRecord>> {
        let path = self.binding_path(instance_id, binding_id);
        let Some(data) = self.read_data(&path).await? else {
            return Ok(None);
        };
        let mut record: BindingRecord = records::decode(&path, &data)?;
        if record.instance_id.is_empty() {
            record.instance_id = instance_id.to_string();
        }
        if record.binding_id.is_empty() {
            record.binding_id = binding_id.to_string();
        }
        Ok(Some(record))
    }

    pub async fn write_binding(&self, record: &BindingRecord) -> Result<()> {
        let path = self.binding_path(&record.instance_id, &record.binding_id);
        debug!(%path, "storing binding metadata");
        let data = records::encode(&path, record)?;
        self.backend
            .write(&path, data)
            .await
            .map_err(|err| err.context(format!("failed to commit binding {path}")))
    }

    pub async fn delete_binding(&self, instance_id: &str, binding_id: &str) -> Result<()> {
        let path = self.binding_path(instance_id, binding_id);
        debug!(%path, "deleting binding metadata");
        self.backend
            .delete(&path)
            .await
            .map_err(|err| err.context(format!("failed to delete binding info at {path}")))
    }

    /// Instance ids with a tenant record or at least one binding.
    pub async fn list_tenants(&self) -> Result<Vec<String>> {
        self.list_children(&format!("{}/", self.root)).await
    }

    pub async fn list_bindings(&self, instance_id: &str) -> Result<Vec<String>> {
        self.list_children(&format!("{}/{instance_id}/", self.root))
            .await
    }

    async fn read_data(&self, path: &str) -> Result<Option<Data>> {
        let data = self
            .backend
            .read(path)
            .await
            .map_err(|err| err.context(format!("failed to read {path}")))?;
        Ok(data.filter(|data| !data.is_empty()))
    }

    // A tenant with bindings shows up twice in a listing ("id" and "id/").
    async fn list_children(&self, dir: &str) -> Result<Vec<String>> {
        debug!(%dir, "listing directory");
        let keys = self
            .backend
            .list(dir)
            .await
            .map_err(|err| err.context(format!("failed to list {dir}")))?;
        let unique: BTreeSet<String> = keys
            .into_iter()
            .map(|key| key.trim_matches('/').to_string())
            .filter(|key| !key.is_empty())
            .collect();
        Ok(unique.into_iter().collect())
    }
}

impl std::fmt::Debug for StateStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StateStore").field("root", &self.root).finish()
    }
}
