//! Binding registry and lease renewal scheduler.
//!
//! Each registered binding owns exactly one tokio task. The task sleeps until
//! the renewal is due, renews the credential with its own token, and goes back
//! to sleep for half of the new lease. Failed renewals are retried after a fixed
//! backoff until the lease runs out, at which point the binding is dropped.
//!
//! The registry map is the only shared state. Its lock is taken for map
//! operations only and is never held across a backend call.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use rand::{Rng, rng};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::backend::SharedBackend;
use crate::records::BindingRecord;
use crate::store::StateStore;

const DEFAULT_BACKOFF: Duration = Duration::from_secs(30);
const DEFAULT_MAX_JITTER: Duration = Duration::from_secs(5);
const MIN_RENEWAL_DELAY: Duration = Duration::from_secs(1);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RenewalSettings {
    /// Delay before retrying a failed renewal.
    pub backoff: Duration,
    /// Upper bound of the random delay applied to overdue renewals.
    pub max_jitter: Duration,
}

impl Default for RenewalSettings {
    fn default() -> Self {
        Self {
            backoff: DEFAULT_BACKOFF,
            max_jitter: DEFAULT_MAX_JITTER,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RenewalPhase {
    Scheduled,
    Renewing,
}

/// Snapshot of a registered binding's renewal state.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScheduledRenewal {
    pub binding_id: String,
    pub instance_id: String,
    pub accessor: String,
    pub phase: RenewalPhase,
    pub next_renewal_at: DateTime<Utc>,
    pub lease_duration_secs: u64,
    pub expires_at: DateTime<Utc>,
}

struct Entry {
    generation: u64,
    record: BindingRecord,
    phase: RenewalPhase,
    next_renewal_at: DateTime<Utc>,
    cancel: watch::Sender<bool>,
    task: Option<JoinHandle<()>>,
}

impl Entry {
    fn snapshot(&self) -> ScheduledRenewal {
        ScheduledRenewal {
            binding_id: self.record.binding_id.clone(),
            instance_id: self.record.instance_id.clone(),
            accessor: self.record.accessor.clone(),
            phase: self.phase,
            next_renewal_at: self.next_renewal_at,
            lease_duration_secs: self.record.lease_duration_secs,
            expires_at: self.record.expires_at,
        }
    }

    fn stop(self) -> Option<JoinHandle<()>> {
        let _ = self.cancel.send(true);
        self.task
    }
}

struct Inner {
    backend: SharedBackend,
    store: StateStore,
    settings: RenewalSettings,
    entries: Mutex<HashMap<String, Entry>>,
    generation: AtomicU64,
    live_tasks: AtomicUsize,
}

impl Inner {
    fn is_current(&self, binding_id: &str, generation: u64) -> bool {
        self.entries
            .lock()
            .get(binding_id)
            .is_some_and(|entry| entry.generation == generation)
    }

    fn set_phase(&self, binding_id: &str, generation: u64, phase: RenewalPhase) -> bool {
        match self.entries.lock().get_mut(binding_id) {
            Some(entry) if entry.generation == generation => {
                entry.phase = phase;
                true
            }
            _ => false,
        }
    }

    fn reschedule(
        &self,
        binding_id: &str,
        generation: u64,
        record: &BindingRecord,
        next_renewal_at: DateTime<Utc>,
    ) -> bool {
        match self.entries.lock().get_mut(binding_id) {
            Some(entry) if entry.generation == generation => {
                entry.record = record.clone();
                entry.phase = RenewalPhase::Scheduled;
                entry.next_renewal_at = next_renewal_at;
                true
            }
            _ => false,
        }
    }

    fn remove_if_current(&self, binding_id: &str, generation: u64) {
        let mut entries = self.entries.lock();
        if entries
            .get(binding_id)
            .is_some_and(|entry| entry.generation == generation)
        {
            entries.remove(binding_id);
        }
    }
}

/// Registry of live bindings, each with its own renewal task.
#[derive(Clone)]
pub struct RenewalScheduler {
    inner: Arc<Inner>,
}

impl RenewalScheduler {
    pub fn new(backend: SharedBackend, store: StateStore, settings: RenewalSettings) -> Self {
        Self {
            inner: Arc::new(Inner {
                backend,
                store,
                settings,
                entries: Mutex::new(HashMap::new()),
                generation: AtomicU64::new(0),
                live_tasks: AtomicUsize::new(0),
            }),
        }
    }

    pub fn settings(&self) -> RenewalSettings {
        self.inner.settings
    }

    /// Register a binding and schedule its first renewal half way through the
    /// lease. Overdue bindings are renewed after a short random delay instead
    /// of immediately, so a restart with many bindings does not stampede the
    /// backend. A binding that is already registered has its old task stopped
    /// first.
    pub async fn start(&self, record: BindingRecord) -> ScheduledRenewal {
        self.stop(&record.binding_id).await;

        let now = Utc::now();
        let due = record.renewal_due();
        let (delay, next_renewal_at) = if due > now {
            ((due - now).to_std().unwrap_or_default(), due)
        } else {
            let jitter = self.jitter();
            (jitter, now + chrono_duration(jitter))
        };

        let generation = self.inner.generation.fetch_add(1, Ordering::SeqCst) + 1;
        let (cancel, cancel_rx) = watch::channel(false);
        let binding_id = record.binding_id.clone();
        let entry = Entry {
            generation,
            record: record.clone(),
            phase: RenewalPhase::Scheduled,
            next_renewal_at,
            cancel,
            task: None,
        };
        let snapshot = entry.snapshot();
        self.inner.entries.lock().insert(binding_id.clone(), entry);

        let live = LiveTask::enter(self.inner.clone());
        let task = tokio::spawn(drive(live, generation, record, cancel_rx, delay));
        // The task may already have finished or been replaced; a stale handle
        // is simply dropped, which detaches it.
        if let Some(entry) = self.inner.entries.lock().get_mut(&binding_id)
            && entry.generation == generation
        {
            entry.task = Some(task);
        }

        debug!(
            binding_id = %snapshot.binding_id,
            accessor = %snapshot.accessor,
            next_renewal_at = %snapshot.next_renewal_at,
            "renewal scheduled"
        );
        snapshot
    }

    /// Remove a binding and wait for its task to end. A renewal already in
    /// flight is allowed to finish; no renewal starts after this returns.
    pub async fn stop(&self, binding_id: &str) -> bool {
        let entry = self.inner.entries.lock().remove(binding_id);
        let Some(entry) = entry else {
            return false;
        };
        if let Some(task) = entry.stop() {
            if let Err(err) = task.await
                && err.is_panic()
            {
                warn!(%binding_id, "renewal task panicked");
            }
        }
        debug!(%binding_id, "renewal stopped");
        true
    }

    /// Abort every task without waiting for renewals in flight. Returns the
    /// number of bindings that were registered.
    pub fn shutdown(&self) -> usize {
        let entries: Vec<Entry> = self
            .inner
            .entries
            .lock()
            .drain()
            .map(|(_, entry)| entry)
            .collect();
        let count = entries.len();
        for entry in entries {
            if let Some(task) = entry.stop() {
                task.abort();
            }
        }
        count
    }

    pub fn scheduled(&self, binding_id: &str) -> Option<ScheduledRenewal> {
        self.inner
            .entries
            .lock()
            .get(binding_id)
            .map(Entry::snapshot)
    }

    pub fn contains(&self, binding_id: &str) -> bool {
        self.inner.entries.lock().contains_key(binding_id)
    }

    pub fn len(&self) -> usize {
        self.inner.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn binding_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.inner.entries.lock().keys().cloned().collect();
        ids.sort();
        ids
    }

    /// Renewal tasks that have not terminated yet, registered or not.
    pub fn live_tasks(&self) -> usize {
        self.inner.live_tasks.load(Ordering::SeqCst)
    }

    fn jitter(&self) -> Duration {
        let bound = self.inner.settings.max_jitter.as_millis() as u64;
        if bound == 0 {
            return Duration::ZERO;
        }
        Duration::from_millis(rng().random_range(0..bound))
    }
}

impl std::fmt::Debug for RenewalScheduler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RenewalScheduler")
            .field("bindings", &self.len())
            .field("settings", &self.inner.settings)
            .finish()
    }
}

// Counted from spawn until the task's future is dropped, so a task aborted
// before its first poll is accounted for as well.
struct LiveTask(Arc<Inner>);

impl LiveTask {
    fn enter(inner: Arc<Inner>) -> Self {
        inner.live_tasks.fetch_add(1, Ordering::SeqCst);
        Self(inner)
    }
}

impl Drop for LiveTask {
    fn drop(&mut self) {
        self.0.live_tasks.fetch_sub(1, Ordering::SeqCst);
    }
}

async fn drive(
    live: LiveTask,
    generation: u64,
    mut record: BindingRecord,
    mut cancel: watch::Receiver<bool>,
    mut delay: Duration,
) {
    let inner = &live.0;
    let binding_id = record.binding_id.clone();

    loop {
        if *cancel.borrow() {
            return;
        }
        tokio::select! {
            biased;
            _ = cancel.changed() => return,
            _ = tokio::time::sleep(delay) => {}
        }
        if !inner.set_phase(&binding_id, generation, RenewalPhase::Renewing) {
            return;
        }

        let outcome = inner.backend.renew_self(&record.client_token).await;
        let now = Utc::now();
        match outcome {
            Ok(lease) if lease.lease_duration_secs > 0 => {
                record = record.renewed(now, lease.lease_duration_secs);
                delay = half(lease.lease_duration_secs);
                info!(
                    action = "binding.renew",
                    binding_id = %binding_id,
                    accessor = %record.accessor,
                    lease_duration_secs = lease.lease_duration_secs,
                    "successfully renewed token"
                );
                if inner.is_current(&binding_id, generation)
                    && let Err(err) = inner.store.write_binding(&record).await
                {
                    warn!(%binding_id, error = %err, "failed to persist renewed lease");
                }
            }
            Ok(_) => {
                warn!(
                    action = "binding.expire",
                    binding_id = %binding_id,
                    accessor = %record.accessor,
                    "renewal returned an empty lease; token can no longer be extended"
                );
                inner.remove_if_current(&binding_id, generation);
                return;
            }
            Err(err) if record.is_expired(now) => {
                warn!(
                    action = "binding.expire",
                    binding_id = %binding_id,
                    accessor = %record.accessor,
                    error = %err,
                    "renewer stopped: token probably expired"
                );
                inner.remove_if_current(&binding_id, generation);
                return;
            }
            Err(err) => {
                let remaining = (record.expires_at - now).to_std().unwrap_or_default();
                delay = inner.settings.backoff.min(remaining);
                warn!(
                    action = "binding.renew_failed",
                    binding_id = %binding_id,
                    accessor = %record.accessor,
                    error = %err,
                    retry_in_ms = delay.as_millis() as u64,
                    "failed to renew token"
                );
            }
        }

        if !inner.reschedule(&binding_id, generation, &record, now + chrono_duration(delay)) {
            return;
        }
    }
}

fn half(lease_duration_secs: u64) -> Duration {
    Duration::from_secs(lease_duration_secs / 2).max(MIN_RENEWAL_DELAY)
}

fn chrono_duration(duration: Duration) -> chrono::Duration {
    chrono::Duration::from_std(duration).unwrap_or(chrono::Duration::MAX)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn half_lease_has_a_floor() {
        assert_eq!(half(3600), Duration::from_secs(1800));
        assert_eq!(half(1), MIN_RENEWAL_DELAY);
    }

    #[test]
    fn default_settings() {
        let settings = RenewalSettings::default();
        assert_eq!(settings.backoff, Duration::from_secs(30));
        assert!(settings.max_jitter < Duration::from_secs(6));
    }
}
