use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use vault_broker_core::{
    BindingRecord, CredentialRequest, RenewalPhase, RenewalScheduler, RenewalSettings,
    SecretsBackend, StateStore, TokenRole,
};
use vault_broker_provider_dev::{DevBackend, Operation};

const ROLE: &str = "cf-inst";

struct Harness {
    backend: DevBackend,
    store: StateStore,
    scheduler: RenewalScheduler,
}

fn harness() -> Harness {
    let backend = DevBackend::new();
    let store = StateStore::new(Arc::new(backend.clone()), "secret/broker");
    let scheduler = RenewalScheduler::new(
        Arc::new(backend.clone()),
        store.clone(),
        RenewalSettings::default(),
    );
    Harness {
        backend,
        store,
        scheduler,
    }
}

/// Issue a real dev token and describe it as issued `age_secs` ago.
async fn binding(
    backend: &DevBackend,
    binding_id: &str,
    age_secs: i64,
    lease_secs: u64,
) -> BindingRecord {
    backend
        .write_role(
            ROLE,
            &TokenRole {
                allowed_policies: vec![ROLE.to_string()],
                period: Duration::from_secs(3600),
                renewable: true,
            },
        )
        .await
        .unwrap();
    let issued = backend
        .create_credential(
            ROLE,
            &CredentialRequest {
                policies: vec![ROLE.to_string()],
                metadata: Default::default(),
                display_name: binding_id.to_string(),
                renewable: true,
            },
        )
        .await
        .unwrap();

    let issued_at = Utc::now() - chrono::Duration::seconds(age_secs);
    BindingRecord {
        binding_id: binding_id.to_string(),
        instance_id: "inst".to_string(),
        organization_id: "org".to_string(),
        space_id: "space".to_string(),
        client_token: issued.token,
        accessor: issued.accessor,
        lease_duration_secs: lease_secs,
        issued_at,
        expires_at: BindingRecord::lease_window(issued_at, lease_secs),
    }
}

#[tokio::test(start_paused = true)]
async fn renews_half_way_through_the_lease() {
    let h = harness();
    let record = binding(&h.backend, "b-1", 0, 3600).await;

    let scheduled = h.scheduler.start(record.clone()).await;
    assert_eq!(scheduled.phase, RenewalPhase::Scheduled);
    assert_eq!(
        scheduled.next_renewal_at,
        record.issued_at + chrono::Duration::seconds(1800)
    );

    tokio::time::sleep(Duration::from_secs(1799)).await;
    assert_eq!(h.backend.renewals(), 0);

    tokio::time::sleep(Duration::from_secs(2)).await;
    assert_eq!(h.backend.renewals(), 1);

    let stored = h.store.read_binding("inst", "b-1").await.unwrap().unwrap();
    assert_eq!(stored.lease_duration_secs, 3600);
    assert!(stored.issued_at >= record.issued_at);
    let next = h.scheduler.scheduled("b-1").unwrap();
    assert_eq!(next.phase, RenewalPhase::Scheduled);
    assert_eq!(next.next_renewal_at, stored.issued_at + chrono::Duration::seconds(1800));

    tokio::time::sleep(Duration::from_secs(1800)).await;
    assert_eq!(h.backend.renewals(), 2);
    h.scheduler.shutdown();
}

#[tokio::test(start_paused = true)]
async fn starting_twice_keeps_a_single_task() {
    let h = harness();
    let record = binding(&h.backend, "b-1", 0, 3600).await;

    h.scheduler.start(record.clone()).await;
    h.scheduler.start(record).await;
    assert_eq!(h.scheduler.len(), 1);
    assert_eq!(h.scheduler.live_tasks(), 1);

    tokio::time::sleep(Duration::from_secs(1801)).await;
    assert_eq!(h.backend.renewals(), 1);
    h.scheduler.shutdown();
}

#[tokio::test(start_paused = true)]
async fn stop_before_the_timer_fires_prevents_renewal() {
    let h = harness();
    let record = binding(&h.backend, "b-1", 1900, 3600).await;

    h.scheduler.start(record).await;
    assert!(h.scheduler.stop("b-1").await);
    assert!(!h.scheduler.stop("b-1").await);
    assert_eq!(h.scheduler.live_tasks(), 0);

    tokio::time::sleep(Duration::from_secs(3600)).await;
    assert_eq!(h.backend.calls(Operation::RenewSelf), 0);
}

#[tokio::test(start_paused = true)]
async fn stop_waits_for_a_renewal_in_flight() {
    let h = harness();
    let record = binding(&h.backend, "b-1", 1900, 3600).await;
    h.store.write_binding(&record).await.unwrap();
    h.backend.set_renew_latency(Some(Duration::from_secs(10)));

    h.scheduler.start(record.clone()).await;
    tokio::time::sleep(Duration::from_secs(6)).await;
    assert_eq!(h.backend.calls(Operation::RenewSelf), 1);
    assert_eq!(
        h.scheduler.scheduled("b-1").unwrap().phase,
        RenewalPhase::Renewing
    );

    h.scheduler.stop("b-1").await;
    assert_eq!(h.backend.renewals(), 1);
    assert_eq!(h.scheduler.live_tasks(), 0);

    // The late renewal must not overwrite the stored record.
    let stored = h.store.read_binding("inst", "b-1").await.unwrap().unwrap();
    assert_eq!(stored.issued_at, record.issued_at);

    tokio::time::sleep(Duration::from_secs(7200)).await;
    assert_eq!(h.backend.calls(Operation::RenewSelf), 1);
}

#[tokio::test(start_paused = true)]
async fn failed_renewals_back_off() {
    let h = harness();
    let record = binding(&h.backend, "b-1", 1900, 3600).await;
    h.backend.fail(Operation::RenewSelf, "connection refused");

    h.scheduler.start(record).await;
    tokio::time::sleep(Duration::from_secs(6)).await;
    assert_eq!(h.backend.calls(Operation::RenewSelf), 1);

    let retry = h.scheduler.scheduled("b-1").unwrap();
    assert_eq!(retry.phase, RenewalPhase::Scheduled);
    let wait = retry.next_renewal_at - Utc::now();
    assert!(wait <= chrono::Duration::seconds(30), "{wait}");
    assert!(wait > chrono::Duration::seconds(25), "{wait}");

    tokio::time::sleep(Duration::from_secs(30)).await;
    assert_eq!(h.backend.calls(Operation::RenewSelf), 2);

    h.backend.clear_failure(Operation::RenewSelf);
    tokio::time::sleep(Duration::from_secs(31)).await;
    assert_eq!(h.backend.renewals(), 1);
    h.scheduler.shutdown();
}

#[tokio::test(start_paused = true)]
async fn backoff_never_passes_expiry() {
    let h = harness();
    let record = binding(&h.backend, "b-1", 3590, 3600).await;
    h.backend.fail(Operation::RenewSelf, "connection refused");

    h.scheduler.start(record.clone()).await;
    tokio::time::sleep(Duration::from_secs(6)).await;

    let retry = h.scheduler.scheduled("b-1").unwrap();
    assert!(retry.next_renewal_at <= record.expires_at);
    h.scheduler.shutdown();
}

#[tokio::test(start_paused = true)]
async fn expired_binding_is_dropped_without_revoking() {
    let h = harness();
    let record = binding(&h.backend, "b-1", 7200, 3600).await;
    h.backend.fail(Operation::RenewSelf, "permission denied");

    h.scheduler.start(record).await;
    tokio::time::sleep(Duration::from_secs(6)).await;

    assert!(!h.scheduler.contains("b-1"));
    assert_eq!(h.scheduler.live_tasks(), 0);
    assert_eq!(h.backend.calls(Operation::RevokeAccessor), 0);
}

#[tokio::test(start_paused = true)]
async fn empty_lease_ends_renewal() {
    let h = harness();
    let record = binding(&h.backend, "b-1", 1900, 3600).await;
    h.backend.set_lease(0);

    h.scheduler.start(record).await;
    tokio::time::sleep(Duration::from_secs(6)).await;

    assert_eq!(h.backend.renewals(), 1);
    assert!(h.scheduler.is_empty());
    assert_eq!(h.scheduler.live_tasks(), 0);
}

#[tokio::test(start_paused = true)]
async fn overdue_binding_is_renewed_within_the_jitter_window() {
    let h = harness();
    let record = binding(&h.backend, "b-1", 1900, 3600).await;

    let scheduled = h.scheduler.start(record).await;
    assert!(scheduled.next_renewal_at - Utc::now() <= chrono::Duration::seconds(5));

    tokio::time::sleep(Duration::from_secs(5)).await;
    assert_eq!(h.backend.renewals(), 1);
    h.scheduler.shutdown();
}

#[tokio::test(start_paused = true)]
async fn shutdown_aborts_every_task() {
    let h = harness();
    for id in ["b-1", "b-2", "b-3"] {
        let record = binding(&h.backend, id, 0, 3600).await;
        h.scheduler.start(record).await;
    }
    assert_eq!(h.scheduler.binding_ids(), vec!["b-1", "b-2", "b-3"]);

    assert_eq!(h.scheduler.shutdown(), 3);
    tokio::time::sleep(Duration::from_millis(1)).await;
    assert_eq!(h.scheduler.live_tasks(), 0);

    tokio::time::sleep(Duration::from_secs(3600)).await;
    assert_eq!(h.backend.calls(Operation::RenewSelf), 0);
}
