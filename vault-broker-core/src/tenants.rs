use std::collections::HashMap;

use parking_lot::Mutex;

use crate::records::TenantRecord;

/// In-memory mirror of the provisioned tenants. The durable copy lives in the
/// [`StateStore`](crate::store::StateStore); callers keep the two in step.
#[derive(Default)]
pub struct TenantRegistry {
    tenants: Mutex<HashMap<String, TenantRecord>>,
}

impl TenantRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, record: TenantRecord) {
        self.tenants
            .lock()
            .insert(record.instance_id.clone(), record);
    }

    pub fn get(&self, instance_id: &str) -> Option<TenantRecord> {
        self.tenants.lock().get(instance_id).cloned()
    }

    pub fn remove(&self, instance_id: &str) -> Option<TenantRecord> {
        self.tenants.lock().remove(instance_id)
    }

    pub fn contains(&self, instance_id: &str) -> bool {
        self.tenants.lock().contains_key(instance_id)
    }

    pub fn len(&self) -> usize {
        self.tenants.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn instance_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.tenants.lock().keys().cloned().collect();
        ids.sort();
        ids
    }
}
