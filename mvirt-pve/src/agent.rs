//! Provider agent: periodically lists VirtualMachine declarations and
//! reconciles each one against Proxmox.
//!
//! Every tick reconciles all due declarations concurrently and waits for
//! all of them before the next tick, so a declaration is never reconciled
//! twice at the same time. Failures are requeued with exponential backoff.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use tokio::task::JoinSet;
use tokio::time::{interval, Instant, MissedTickBehavior};
use tracing::{debug, error, info, info_span, warn, Instrument};

use crate::reconciler::finalizer::{self, FINALIZER};
use crate::reconciler::{Connector, ExternalClient, ReconcileError};
use crate::resources::{Condition, DeletionPolicy, ManagementAction, VirtualMachine};
use crate::store::ResourceStore;

/// Scheduling parameters for the agent.
#[derive(Debug, Clone)]
pub struct AgentConfig {
    /// How often all declarations are listed and reconciled.
    pub resync_interval: Duration,
    /// Upper bound for one reconciliation, including all remote calls.
    pub reconcile_timeout: Duration,
    /// First requeue delay after a failure.
    pub backoff_base: Duration,
    /// Requeue delay cap.
    pub backoff_max: Duration,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            resync_interval: Duration::from_secs(30),
            reconcile_timeout: Duration::from_secs(120),
            backoff_base: Duration::from_secs(1),
            backoff_max: Duration::from_secs(300),
        }
    }
}

impl AgentConfig {
    /// Delay before the next attempt after `failures` consecutive failures.
    pub fn backoff(&self, failures: u32) -> Duration {
        let exponent = failures.saturating_sub(1).min(31);
        self.backoff_base
            .checked_mul(1u32 << exponent)
            .unwrap_or(self.backoff_max)
            .min(self.backoff_max)
    }
}

/// What one reconciliation ended with.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    /// Converged, or the remote operation was issued.
    Synced,
    /// Failed; try again after backoff.
    Requeue,
    /// Failed in a way retrying cannot fix until the declaration changes.
    Parked,
}

/// Per-declaration scheduling state.
#[derive(Debug, Default)]
struct KeyState {
    failures: u32,
    not_before: Option<Instant>,
    /// Resource version at which the declaration was parked.
    parked_at: Option<u64>,
}

impl KeyState {
    fn is_due(&self, vm: &VirtualMachine, now: Instant) -> bool {
        if let Some(version) = self.parked_at {
            if version == vm.metadata.resource_version {
                return false;
            }
        }
        self.not_before.map_or(true, |t| now >= t)
    }
}

/// Agent that drives reconciliation of all declarations in a store.
pub struct Agent<C: Connector> {
    store: Arc<dyn ResourceStore>,
    connector: Arc<C>,
    config: AgentConfig,
    keys: HashMap<String, KeyState>,
}

impl<C> Agent<C>
where
    C: Connector + 'static,
    C::External: 'static,
{
    pub fn new(store: Arc<dyn ResourceStore>, connector: Arc<C>, config: AgentConfig) -> Self {
        Self {
            store,
            connector,
            config,
            keys: HashMap::new(),
        }
    }

    /// Run until the task is cancelled.
    pub async fn run(&mut self) -> Result<()> {
        let mut ticker = interval(self.config.resync_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        info!(
            interval_secs = self.config.resync_interval.as_secs(),
            "Starting reconciliation loop"
        );
        loop {
            ticker.tick().await;
            if let Err(e) = self.run_once().await {
                error!("Reconciliation pass failed: {:#}", e);
            }
        }
    }

    /// Reconcile every due declaration once.
    pub async fn run_once(&mut self) -> Result<HashMap<String, Outcome>> {
        let vms = self
            .store
            .list_virtual_machines()
            .await
            .context("Failed to list VirtualMachines")?;

        // Forget keys whose declaration is gone.
        self.keys
            .retain(|name, _| vms.iter().any(|vm| &vm.metadata.name == name));

        let now = Instant::now();
        let mut tasks = JoinSet::new();
        for vm in vms {
            let name = vm.metadata.name.clone();
            let due = self
                .keys
                .get(&name)
                .map_or(true, |state| state.is_due(&vm, now));
            if !due {
                debug!(key = %name, "Skipping declaration until backoff expires");
                continue;
            }

            let store = Arc::clone(&self.store);
            let connector = Arc::clone(&self.connector);
            let timeout = self.config.reconcile_timeout;
            let version = vm.metadata.resource_version;
            let span = info_span!(
                "reconcile",
                key = %name,
                request_id = %uuid::Uuid::new_v4()
            );
            tasks.spawn(
                async move {
                    let (outcome, version) =
                        match tokio::time::timeout(timeout, reconcile(store, connector, vm)).await
                        {
                            Ok(done) => done,
                            Err(_) => {
                                warn!(timeout_secs = timeout.as_secs(), "Reconciliation timed out");
                                (Outcome::Requeue, version)
                            }
                        };
                    (name, version, outcome)
                }
                .instrument(span),
            );
        }

        let mut outcomes = HashMap::new();
        while let Some(joined) = tasks.join_next().await {
            let (name, version, outcome) = match joined {
                Ok(result) => result,
                Err(e) => {
                    error!("Reconcile task panicked: {}", e);
                    continue;
                }
            };
            self.record(&name, version, outcome);
            outcomes.insert(name, outcome);
        }
        Ok(outcomes)
    }

    fn record(&mut self, name: &str, version: u64, outcome: Outcome) {
        match outcome {
            Outcome::Synced => {
                self.keys.remove(name);
            }
            Outcome::Requeue => {
                let state = self.keys.entry(name.to_string()).or_default();
                state.failures = state.failures.saturating_add(1);
                let delay = self.config.backoff(state.failures);
                state.not_before = Some(Instant::now() + delay);
                state.parked_at = None;
                debug!(key = %name, delay_ms = delay.as_millis() as u64, "Requeued with backoff");
            }
            Outcome::Parked => {
                let state = self.keys.entry(name.to_string()).or_default();
                state.parked_at = Some(version);
                state.not_before = None;
            }
        }
    }
}

/// One reconciliation: connect, act, then record the Synced condition.
///
/// Returns the outcome and the resource version the declaration was left at.
async fn reconcile<C: Connector>(
    store: Arc<dyn ResourceStore>,
    connector: Arc<C>,
    mut vm: VirtualMachine,
) -> (Outcome, u64) {
    let result = match connector.connect(&vm).await {
        Ok(external) => {
            let result = drive(&external, &mut vm).await;
            if let Err(e) = external.disconnect().await {
                warn!("Disconnect failed: {}", e);
            }
            result
        }
        Err(e) => Err(e),
    };

    let outcome = match &result {
        Ok(()) => {
            vm.status.set_condition(Condition::reconcile_success());
            Outcome::Synced
        }
        Err(e) if e.is_retryable() => {
            warn!("Reconciliation failed: {}", e);
            vm.status.set_condition(Condition::reconcile_error(e.to_string()));
            Outcome::Requeue
        }
        Err(e) => {
            error!("Reconciliation failed permanently: {}", e);
            vm.status.set_condition(Condition::reconcile_error(e.to_string()));
            Outcome::Parked
        }
    };

    // A released declaration has been removed by the store.
    let version = vm.metadata.resource_version;
    if vm.metadata.deletion_requested() && vm.metadata.finalizers.is_empty() {
        return (outcome, version);
    }
    match store.update_virtual_machine_status(&vm).await {
        Ok(stored) => (outcome, stored.metadata.resource_version),
        Err(e) => {
            warn!("Failed to write status: {}", e);
            if outcome == Outcome::Parked {
                (outcome, version)
            } else {
                (Outcome::Requeue, version)
            }
        }
    }
}

/// Choose and run at most one of create, update or delete.
async fn drive<E: ExternalClient>(
    external: &E,
    vm: &mut VirtualMachine,
) -> std::result::Result<(), ReconcileError> {
    let policies = vm.spec.management_policies.clone();

    if vm.metadata.deletion_requested() {
        if !finalizer::has(&vm.metadata.finalizers, FINALIZER) {
            debug!("VM was never claimed, releasing declaration without remote delete");
            return external.release(vm).await;
        }
        if vm.spec.deletion_policy == DeletionPolicy::Orphan
            || !policies.allows(ManagementAction::Delete)
        {
            info!("Orphaning VM, leaving it on Proxmox");
            return external.release(vm).await;
        }
        return external.delete(vm).await;
    }

    let observation = external.observe(vm).await?;
    if !observation.resource_exists {
        if policies.allows(ManagementAction::Create) {
            return external.create(vm).await;
        }
        debug!("VM absent but creation is not allowed by management policies");
        return Ok(());
    }
    if !observation.resource_up_to_date {
        if policies.allows(ManagementAction::Update) {
            return external.update(vm).await;
        }
        debug!("VM drifted but updates are not allowed by management policies");
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_doubles_up_to_cap() {
        let config = AgentConfig {
            backoff_base: Duration::from_secs(1),
            backoff_max: Duration::from_secs(10),
            ..Default::default()
        };
        assert_eq!(config.backoff(1), Duration::from_secs(1));
        assert_eq!(config.backoff(2), Duration::from_secs(2));
        assert_eq!(config.backoff(4), Duration::from_secs(8));
        assert_eq!(config.backoff(5), Duration::from_secs(10));
        assert_eq!(config.backoff(u32::MAX), Duration::from_secs(10));
    }

    #[test]
    fn parked_key_waits_for_new_version() {
        let mut vm = VirtualMachine::default();
        vm.metadata.resource_version = 7;
        let state = KeyState {
            parked_at: Some(7),
            ..Default::default()
        };
        let now = Instant::now();
        assert!(!state.is_due(&vm, now));

        vm.metadata.resource_version = 8;
        assert!(state.is_due(&vm, now));
    }

    #[test]
    fn backed_off_key_is_not_due() {
        let vm = VirtualMachine::default();
        let now = Instant::now();
        let state = KeyState {
            failures: 1,
            not_before: Some(now + Duration::from_secs(5)),
            parked_at: None,
        };
        assert!(!state.is_due(&vm, now));
        assert!(state.is_due(&vm, now + Duration::from_secs(5)));
    }
}
