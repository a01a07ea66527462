//! Tenant and binding lifecycle.
//!
//! [`LifecycleManager`] owns the tenant registry, the renewal scheduler, the
//! mount table and the durable store, and drives them for the four broker
//! operations: provision, bind, unbind and deprovision.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use chrono::Utc;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};
use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::backend::{CredentialRequest, SharedBackend, TokenRole};
use crate::error::{Error, Result, ensure_identifier};
use crate::mounts::{self, MountTable};
use crate::policy::{self, PolicyInput};
use crate::recovery::{self, RecoveryReport};
use crate::records::{BindingRecord, TenantRecord};
use crate::renewal::{RenewalScheduler, RenewalSettings};
use crate::saga::{self, DEPROVISION_PLAN, DeprovisionStep, PROVISION_PLAN, ProvisionStep};
use crate::store::StateStore;
use crate::tenants::TenantRegistry;

const DEFAULT_MOUNT_PREFIX: &str = "cf";
const DEFAULT_ROLE_PERIOD: Duration = Duration::from_secs(5 * 24 * 60 * 60);
const STATE_MOUNT: &str = "broker";
const GENERIC: &str = "generic";
const TRANSIT: &str = "transit";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BrokerSettings {
    /// First path segment of every mount the broker manages.
    pub mount_prefix: String,
    /// Period of the per-tenant token role.
    pub role_period: Duration,
    pub renewal: RenewalSettings,
    /// Vault address handed out in binding credentials.
    pub advertise_addr: String,
    /// Keep the broker's own token alive.
    pub renew_broker_token: bool,
}

impl Default for BrokerSettings {
    fn default() -> Self {
        Self {
            mount_prefix: DEFAULT_MOUNT_PREFIX.to_string(),
            role_period: DEFAULT_ROLE_PERIOD,
            renewal: RenewalSettings::default(),
            advertise_addr: String::new(),
            renew_broker_token: true,
        }
    }
}

/// Credentials returned to a bound application.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Credentials {
    pub address: String,
    pub auth: CredentialAuth,
    pub backends: InstanceBackends,
    pub backends_shared: SharedBackends,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CredentialAuth {
    pub accessor: String,
    pub token: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InstanceBackends {
    pub generic: String,
    pub transit: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SharedBackends {
    pub organization: String,
    pub space: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OperationState {
    InProgress,
    Succeeded,
    Failed,
}

pub struct LifecycleManager {
    backend: SharedBackend,
    settings: BrokerSettings,
    store: StateStore,
    mounts: MountTable,
    tenants: TenantRegistry,
    renewals: RenewalScheduler,
    running: AtomicBool,
    broker_renewal: Mutex<Option<JoinHandle<()>>>,
    binding_locks: BindingLocks,
}

impl LifecycleManager {
    pub fn new(backend: SharedBackend, settings: BrokerSettings) -> Self {
        let prefix = settings.mount_prefix.trim_matches('/').to_string();
        let store = StateStore::new(backend.clone(), format!("{prefix}/{STATE_MOUNT}"));
        let renewals = RenewalScheduler::new(backend.clone(), store.clone(), settings.renewal);
        Self {
            mounts: MountTable::new(backend.clone()),
            backend,
            settings: BrokerSettings {
                mount_prefix: prefix,
                ..settings
            },
            store,
            tenants: TenantRegistry::new(),
            renewals,
            running: AtomicBool::new(false),
            broker_renewal: Mutex::new(None),
            binding_locks: BindingLocks::default(),
        }
    }

    pub fn settings(&self) -> &BrokerSettings {
        &self.settings
    }

    pub fn tenants(&self) -> &TenantRegistry {
        &self.tenants
    }

    pub fn renewals(&self) -> &RenewalScheduler {
        &self.renewals
    }

    pub fn store(&self) -> &StateStore {
        &self.store
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Ensure the state mount, replay durable state and start accepting calls.
    /// Calling it again on a running manager does nothing.
    pub async fn start(&self) -> Result<RecoveryReport> {
        if self.is_running() {
            return Ok(RecoveryReport::default());
        }
        info!(prefix = %self.settings.mount_prefix, "starting broker");

        let mut state = BTreeMap::new();
        state.insert(self.store.root().to_string(), GENERIC.to_string());
        self.mounts
            .ensure_mounts(&state)
            .await
            .map_err(|err| err.context("failed to create state mount"))?;

        let report = recovery::recover(&self.store, &self.tenants, &self.renewals)
            .await
            .map_err(|err| err.context("failed to restore state"))?;

        if self.settings.renew_broker_token {
            let task = tokio::spawn(renew_broker_token(
                self.backend.clone(),
                self.settings.renewal.backoff,
            ));
            if let Some(previous) = self.broker_renewal.lock().replace(task) {
                previous.abort();
            }
        }

        self.running.store(true, Ordering::SeqCst);
        Ok(report)
    }

    /// Stop accepting calls and abort every background task.
    pub fn stop(&self) {
        self.running.store(false, Ordering::SeqCst);
        if let Some(task) = self.broker_renewal.lock().take() {
            task.abort();
        }
        let bindings = self.renewals.shutdown();
        info!(bindings, "broker stopped");
    }

    pub async fn provision(
        &self,
        instance_id: &str,
        organization_id: &str,
        space_id: &str,
    ) -> Result<()> {
        self.ensure_running()?;
        ensure_identifier(instance_id, "instance id")?;
        ensure_identifier(organization_id, "organization id")?;
        ensure_identifier(space_id, "space id")?;

        let tenant = TenantRecord::new(instance_id, organization_id, space_id);
        saga::run("provision", &PROVISION_PLAN, |step| {
            self.apply_provision(step, &tenant)
        })
        .await?;

        info!(
            target: "audit",
            action = "instance.provision",
            instance_id = %instance_id,
            organization_id = %organization_id,
            space_id = %space_id,
            "instance provisioned"
        );
        Ok(())
    }

    async fn apply_provision(&self, step: ProvisionStep, tenant: &TenantRecord) -> Result<()> {
        let instance_id = tenant.instance_id.as_str();
        let name = policy::policy_name(instance_id);
        match step {
            ProvisionStep::WritePolicy => {
                let input = PolicyInput::new(
                    &self.settings.mount_prefix,
                    instance_id,
                    &tenant.space_id,
                    &tenant.organization_id,
                );
                let document = policy::generate_policy(&input)?;
                self.backend
                    .write_policy(&name, &document)
                    .await
                    .map_err(|err| err.context(format!("failed to create policy {name}")))
            }
            ProvisionStep::WriteRole => {
                let role = TokenRole {
                    allowed_policies: vec![name.clone()],
                    period: self.settings.role_period,
                    renewable: true,
                };
                self.backend
                    .write_role(&name, &role)
                    .await
                    .map_err(|err| err.context(format!("failed to create role {name}")))
            }
            ProvisionStep::EnsureMounts => {
                let wanted = self.tenant_mounts(tenant);
                info!(%instance_id, mounts = %mounts::describe(&wanted), "ensuring mounts");
                self.mounts.ensure_mounts(&wanted).await
            }
            ProvisionStep::PersistTenant => {
                self.store.write_tenant(tenant).await?;
                self.tenants.insert(tenant.clone());
                Ok(())
            }
        }
    }

    /// Tear down an instance. Unknown instances succeed; every step tolerates
    /// state that is already gone.
    pub async fn deprovision(&self, instance_id: &str) -> Result<()> {
        self.ensure_running()?;
        ensure_identifier(instance_id, "instance id")?;

        saga::run("deprovision", &DEPROVISION_PLAN, |step| {
            self.apply_deprovision(step, instance_id)
        })
        .await?;

        info!(
            target: "audit",
            action = "instance.deprovision",
            instance_id = %instance_id,
            "instance deprovisioned"
        );
        Ok(())
    }

    async fn apply_deprovision(&self, step: DeprovisionStep, instance_id: &str) -> Result<()> {
        let name = policy::policy_name(instance_id);
        match step {
            DeprovisionStep::RemoveMounts => {
                let paths = vec![self.secret_path(instance_id), self.transit_path(instance_id)];
                self.mounts.remove_mounts(&paths).await
            }
            DeprovisionStep::DeleteRole => self
                .backend
                .delete_role(&name)
                .await
                .map_err(|err| err.context(format!("failed to delete role {name}"))),
            DeprovisionStep::DeletePolicy => self
                .backend
                .delete_policy(&name)
                .await
                .map_err(|err| err.context(format!("failed to delete policy {name}"))),
            DeprovisionStep::DeleteTenant => {
                self.store.delete_tenant(instance_id).await?;
                self.tenants.remove(instance_id);
                Ok(())
            }
        }
    }

    /// Issue a renewable credential for `binding_id` and start renewing it.
    /// Bind and unbind of one binding id never overlap.
    pub async fn bind(&self, instance_id: &str, binding_id: &str) -> Result<Credentials> {
        self.ensure_running()?;
        ensure_identifier(instance_id, "instance id")?;
        ensure_identifier(binding_id, "binding id")?;
        let _guard = self.binding_locks.acquire(binding_id).await;

        let tenant = self
            .tenants
            .get(instance_id)
            .ok_or_else(|| Error::not_found(format!("instance {instance_id}")))?;

        if self.store.read_binding(instance_id, binding_id).await?.is_some() {
            return Err(Error::AlreadyExists {
                entity: format!("binding {binding_id}"),
            });
        }

        let role = policy::policy_name(instance_id);
        let request = CredentialRequest {
            policies: vec![role.clone()],
            metadata: HashMap::from([
                ("cf-instance-id".to_string(), instance_id.to_string()),
                ("cf-binding-id".to_string(), binding_id.to_string()),
            ]),
            display_name: format!("cf-bind-{binding_id}"),
            renewable: true,
        };
        let issued = self
            .backend
            .create_credential(&role, &request)
            .await
            .map_err(|err| err.context(format!("failed to create token for binding {binding_id}")))?;

        let issued_at = Utc::now();
        let record = BindingRecord {
            binding_id: binding_id.to_string(),
            instance_id: instance_id.to_string(),
            organization_id: tenant.organization_id.clone(),
            space_id: tenant.space_id.clone(),
            client_token: issued.token,
            accessor: issued.accessor,
            lease_duration_secs: issued.lease_duration_secs,
            issued_at,
            expires_at: BindingRecord::lease_window(issued_at, issued.lease_duration_secs),
        };

        if let Err(err) = self.store.write_binding(&record).await {
            if let Err(revoke_err) = self.backend.revoke_accessor(&record.accessor).await {
                warn!(
                    %binding_id,
                    accessor = %record.accessor,
                    error = %revoke_err,
                    "failed to revoke credential after a failed bind"
                );
            }
            return Err(err);
        }

        let credentials = self.credentials(&tenant, &record);
        self.renewals.start(record).await;

        info!(
            target: "audit",
            action = "binding.create",
            instance_id = %instance_id,
            binding_id = %binding_id,
            accessor = %credentials.auth.accessor,
            "binding created"
        );
        Ok(credentials)
    }

    /// Stop renewal, revoke and forget a binding. Revocation is attempted even
    /// when no renewal is registered.
    pub async fn unbind(&self, instance_id: &str, binding_id: &str) -> Result<()> {
        self.ensure_running()?;
        ensure_identifier(instance_id, "instance id")?;
        ensure_identifier(binding_id, "binding id")?;
        let _guard = self.binding_locks.acquire(binding_id).await;

        let record = self
            .store
            .read_binding(instance_id, binding_id)
            .await?
            .ok_or_else(|| Error::not_found(format!("binding {binding_id}")))?;

        self.renewals.stop(binding_id).await;

        self.backend
            .revoke_accessor(&record.accessor)
            .await
            .map_err(|err| err.context(format!("failed to revoke accessor for binding {binding_id}")))?;

        self.store.delete_binding(instance_id, binding_id).await?;

        info!(
            target: "audit",
            action = "binding.delete",
            instance_id = %instance_id,
            binding_id = %binding_id,
            accessor = %record.accessor,
            "binding deleted"
        );
        Ok(())
    }

    /// Plans and parameters are fixed, so updates have nothing to change.
    pub async fn update(&self, instance_id: &str) -> Result<()> {
        self.ensure_running()?;
        ensure_identifier(instance_id, "instance id")?;
        info!(%instance_id, "update requested; nothing to change");
        Ok(())
    }

    /// Every operation completes synchronously.
    pub async fn last_operation(&self, instance_id: &str) -> Result<OperationState> {
        self.ensure_running()?;
        ensure_identifier(instance_id, "instance id")?;
        Ok(OperationState::Succeeded)
    }

    fn ensure_running(&self) -> Result<()> {
        if self.is_running() {
            Ok(())
        } else {
            Err(Error::NotRunning)
        }
    }

    fn tenant_mounts(&self, tenant: &TenantRecord) -> BTreeMap<String, String> {
        BTreeMap::from([
            (self.secret_path(&tenant.organization_id), GENERIC.to_string()),
            (self.secret_path(&tenant.space_id), GENERIC.to_string()),
            (self.secret_path(&tenant.instance_id), GENERIC.to_string()),
            (self.transit_path(&tenant.instance_id), TRANSIT.to_string()),
        ])
    }

    fn secret_path(&self, id: &str) -> String {
        format!("{}/{id}/secret", self.settings.mount_prefix)
    }

    fn transit_path(&self, id: &str) -> String {
        format!("{}/{id}/transit", self.settings.mount_prefix)
    }

    fn credentials(&self, tenant: &TenantRecord, record: &BindingRecord) -> Credentials {
        Credentials {
            address: self.settings.advertise_addr.clone(),
            auth: CredentialAuth {
                accessor: record.accessor.clone(),
                token: record.client_token.clone(),
            },
            backends: InstanceBackends {
                generic: self.secret_path(&tenant.instance_id),
                transit: self.transit_path(&tenant.instance_id),
            },
            backends_shared: SharedBackends {
                organization: self.secret_path(&tenant.organization_id),
                space: self.secret_path(&tenant.space_id),
            },
        }
    }
}

impl Drop for LifecycleManager {
    fn drop(&mut self) {
        if let Some(task) = self.broker_renewal.get_mut().take() {
            task.abort();
        }
        self.renewals.shutdown();
    }
}

impl std::fmt::Debug for LifecycleManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LifecycleManager")
            .field("settings", &self.settings)
            .field("running", &self.is_running())
            .field("tenants", &self.tenants.len())
            .field("renewals", &self.renewals)
            .finish()
    }
}

/// Serializes bind and unbind per binding id. Entries are dropped once no
/// caller holds or waits on them.
#[derive(Default)]
struct BindingLocks {
    locks: Mutex<HashMap<String, Arc<AsyncMutex<()>>>>,
}

impl BindingLocks {
    async fn acquire(&self, binding_id: &str) -> BindingGuard<'_> {
        let lock = self
            .locks
            .lock()
            .entry(binding_id.to_string())
            .or_default()
            .clone();
        BindingGuard {
            locks: self,
            binding_id: binding_id.to_string(),
            guard: Some(lock.lock_owned().await),
        }
    }
}

struct BindingGuard<'a> {
    locks: &'a BindingLocks,
    binding_id: String,
    guard: Option<OwnedMutexGuard<()>>,
}

impl Drop for BindingGuard<'_> {
    fn drop(&mut self) {
        drop(self.guard.take());
        let mut locks = self.locks.locks.lock();
        // Only the map holds the lock once every guard and waiter is gone.
        if locks
            .get(&self.binding_id)
            .is_some_and(|lock| Arc::strong_count(lock) == 1)
        {
            locks.remove(&self.binding_id);
        }
    }
}

/// Keep the broker's own token alive. Tokens without an expiry are left alone.
async fn renew_broker_token(backend: SharedBackend, backoff: Duration) {
    let lookup = match backend.lookup_broker_token().await {
        Ok(lookup) => lookup,
        Err(err) => {
            warn!(error = %err, "failed to look up broker token; renewal disabled");
            return;
        }
    };
    if !lookup.expires {
        info!("broker token never expires; renewal not needed");
        return;
    }
    if !lookup.renewable {
        warn!(accessor = %lookup.accessor, "broker token is not renewable");
        return;
    }

    loop {
        let delay = match backend.renew_broker_token().await {
            Ok(lease) => {
                info!(
                    accessor = %lookup.accessor,
                    lease_duration_secs = lease.lease_duration_secs,
                    "renewed broker token"
                );
                Duration::from_secs((lease.lease_duration_secs / 2).max(1))
            }
            Err(err) => {
                warn!(accessor = %lookup.accessor, error = %err, "failed to renew broker token");
                backoff
            }
        };
        tokio::time::sleep(delay).await;
    }
}
