use tracing::{info, warn};

use crate::error::{Error, Result};
use crate::renewal::RenewalScheduler;
use crate::store::StateStore;
use crate::tenants::TenantRegistry;

/// Outcome of a startup recovery pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RecoveryReport {
    pub tenants: usize,
    pub bindings: usize,
    /// Records that could not be decoded and were left untouched.
    pub skipped: usize,
}

/// Rebuild the tenant registry and restart renewal for every persisted
/// binding. Listing and reading failures abort recovery; records that fail to
/// decode are logged and skipped.
pub async fn recover(
    store: &StateStore,
    tenants: &TenantRegistry,
    renewals: &RenewalScheduler,
) -> Result<RecoveryReport> {
    let mut report = RecoveryReport::default();

    for instance_id in store.list_tenants().await? {
        match store.read_tenant(&instance_id).await {
            Ok(Some(tenant)) => {
                info!(%instance_id, "restoring tenant");
                tenants.insert(tenant);
                report.tenants += 1;
            }
            // Binding folder without a tenant record; its bindings are still
            // live credentials and keep renewing.
            Ok(None) => {}
            Err(err @ Error::Decode { .. }) => {
                warn!(%instance_id, error = %err, "skipping unreadable tenant record");
                report.skipped += 1;
            }
            Err(err) => return Err(err),
        }

        for binding_id in store.list_bindings(&instance_id).await? {
            match store.read_binding(&instance_id, &binding_id).await {
                Ok(Some(binding)) => {
                    let scheduled = renewals.start(binding).await;
                    info!(
                        %instance_id,
                        %binding_id,
                        accessor = %scheduled.accessor,
                        next_renewal_at = %scheduled.next_renewal_at,
                        "restoring binding"
                    );
                    report.bindings += 1;
                }
                Ok(None) => {}
                Err(err @ Error::Decode { .. }) => {
                    warn!(%instance_id, %binding_id, error = %err, "skipping unreadable binding record");
                    report.skipped += 1;
                }
                Err(err) => return Err(err),
            }
        }
    }

    info!(
        tenants = report.tenants,
        bindings = report.bindings,
        skipped = report.skipped,
        "recovery complete"
    );
    Ok(report)
}
