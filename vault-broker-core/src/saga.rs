//! Ordered step plans for provisioning and deprovisioning.
//!
//! Each step is idempotent on its own. A run stops at the first failing step
//! and leaves earlier steps applied; running the plan again converges.

use std::fmt;
use std::future::Future;

use tracing::debug;

use crate::error::Result;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ProvisionStep {
    WritePolicy,
    WriteRole,
    EnsureMounts,
    PersistTenant,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DeprovisionStep {
    RemoveMounts,
    DeleteRole,
    DeletePolicy,
    DeleteTenant,
}

pub const PROVISION_PLAN: [ProvisionStep; 4] = [
    ProvisionStep::WritePolicy,
    ProvisionStep::WriteRole,
    ProvisionStep::EnsureMounts,
    ProvisionStep::PersistTenant,
];

pub const DEPROVISION_PLAN: [DeprovisionStep; 4] = [
    DeprovisionStep::RemoveMounts,
    DeprovisionStep::DeleteRole,
    DeprovisionStep::DeletePolicy,
    DeprovisionStep::DeleteTenant,
];

impl fmt::Display for ProvisionStep {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            ProvisionStep::WritePolicy => "write-policy",
            ProvisionStep::WriteRole => "write-role",
            ProvisionStep::EnsureMounts => "ensure-mounts",
            ProvisionStep::PersistTenant => "persist-tenant",
        })
    }
}

impl fmt::Display for DeprovisionStep {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            DeprovisionStep::RemoveMounts => "remove-mounts",
            DeprovisionStep::DeleteRole => "delete-role",
            DeprovisionStep::DeletePolicy => "delete-policy",
            DeprovisionStep::DeleteTenant => "delete-tenant",
        })
    }
}

/// Apply `plan` in order with `apply`, stopping at the first error.
pub async fn run<S, F, Fut>(saga: &str, plan: &[S], mut apply: F) -> Result<()>
where
    S: Copy + fmt::Display,
    F: FnMut(S) -> Fut,
    Fut: Future<Output = Result<()>>,
{
    for &step in plan {
        debug!(%saga, %step, "applying step");
        apply(step).await?;
    }
    Ok(())
}
