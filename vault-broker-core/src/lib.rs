//! Tenant and binding lifecycle for the Vault service broker.
//!
//! The crate is backend-agnostic: everything talks to the secrets service
//! through [`SecretsBackend`]. Provisioning creates an isolation policy, a
//! periodic token role and a set of mounts per tenant; binding issues a
//! renewable token that a per-binding task keeps alive until it is unbound.

pub mod backend;
pub mod error;
pub mod lifecycle;
pub mod mounts;
pub mod policy;
pub mod records;
pub mod recovery;
pub mod renewal;
pub mod saga;
pub mod store;
pub mod tenants;

pub use backend::{
    CredentialRequest, Data, IssuedCredential, RenewedLease, SecretsBackend, SharedBackend,
    TokenLookup, TokenRole,
};
pub use error::{Error, Result};
pub use lifecycle::{
    BrokerSettings, CredentialAuth, Credentials, InstanceBackends, LifecycleManager,
    OperationState, SharedBackends,
};
pub use mounts::MountTable;
pub use policy::{PolicyInput, generate_policy, policy_name};
pub use records::{BindingRecord, TenantRecord};
pub use recovery::{RecoveryReport, recover};
pub use renewal::{RenewalPhase, RenewalScheduler, RenewalSettings, ScheduledRenewal};
pub use store::StateStore;
pub use tenants::TenantRegistry;
