//! Reconciler for converging remote state to desired state.
//!
//! The reconciler reads remote state into the store ([`Reconciler::refresh`]),
//! executes plans against a [`RemoteOps`] handle ([`Reconciler::apply`]) and
//! chains both with planning ([`Reconciler::converge`]).

mod cancel;
mod executor;
mod report;
mod retry;
mod scheduler;

pub use cancel::{cancel_pair, CancelHandle, CancelSignal};
pub use report::{
    ApplyReport, DriftReport, FailedOperation, ReadFailure, ResourceDrift, SkippedOperation,
};
pub use retry::{RetryFailure, RetryPolicy, DEFAULT_MAX_ATTEMPTS};

use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};

use crate::error::{RemoteError, Result};
use crate::planner::{Plan, Planner};
use crate::remote::{RemoteOps, RemoteRequest, RequestToken};
use crate::schema::SchemaRegistry;
use crate::state::{LockPurpose, StateStore};
use crate::value::Block;

use executor::Executor;
use scheduler::Scheduler;

/// Default number of operations run at once.
pub const DEFAULT_PARALLELISM: usize = 4;

/// Tuning for a reconciler.
#[derive(Debug, Clone, PartialEq)]
pub struct ReconcilerSettings {
    /// Maximum number of concurrent remote operations.
    pub parallelism: usize,
    /// Retry policy for transient remote failures.
    pub retry: RetryPolicy,
}

/// Executes plans against a remote system.
pub struct Reconciler {
    /// Remote operations handle shared by every operation in a run.
    remote: Arc<dyn RemoteOps>,
    /// Settings.
    settings: ReconcilerSettings,
}

impl Default for ReconcilerSettings {
    fn default() -> Self {
        Self {
            parallelism: DEFAULT_PARALLELISM,
            retry: RetryPolicy::default(),
        }
    }
}

impl Reconciler {
    /// Creates a new reconciler.
    #[must_use]
    pub fn new(remote: Arc<dyn RemoteOps>, settings: ReconcilerSettings) -> Self {
        Self { remote, settings }
    }

    /// Settings in use.
    #[must_use]
    pub const fn settings(&self) -> &ReconcilerSettings {
        &self.settings
    }

    /// Reads every resource that exists remotely and records what was seen.
    ///
    /// Resources the remote system no longer has lose their identifier and
    /// prior state, so the next plan creates them again.
    ///
    /// # Errors
    ///
    /// Returns an error if the state cannot be locked or persisted. Failed
    /// reads are reported in the [`DriftReport`] instead.
    pub async fn refresh(&self, store: &mut StateStore) -> Result<DriftReport> {
        let acquired = !store.is_locked();
        if acquired {
            store.lock(LockPurpose::Refresh).await?;
        }
        let result = self.refresh_locked(store).await;
        let unlocked = if acquired { store.unlock().await } else { Ok(()) };
        let report = result?;
        unlocked?;
        Ok(report)
    }

    async fn refresh_locked(&self, store: &mut StateStore) -> Result<DriftReport> {
        let targets: Vec<(String, String, String)> = store
            .resources()
            .filter_map(|state| {
                state.current_identifier().map(|id| {
                    (state.name.clone(), state.resource_type.clone(), id.to_string())
                })
            })
            .collect();
        info!("Refreshing {} resources", targets.len());

        let semaphore = Arc::new(Semaphore::new(self.settings.parallelism.max(1)));
        let mut reads = JoinSet::new();
        let mut names = HashMap::new();
        for (name, resource_type, identifier) in targets {
            let remote = Arc::clone(&self.remote);
            let retry = self.settings.retry.clone();
            let semaphore = Arc::clone(&semaphore);
            let task_name = name.clone();
            let task = reads.spawn(async move {
                let _permit = semaphore.acquire_owned().await;
                let request = RemoteRequest::new(resource_type, name.clone(), RequestToken::generate());
                let cancel = CancelSignal::never();
                let label = format!("read {name}");
                let result = retry
                    .run(&label, &cancel, |attempt| {
                        let request = request.for_attempt(attempt);
                        let remote = &remote;
                        let identifier = identifier.as_str();
                        async move { remote.read(&request, identifier).await }
                    })
                    .await
                    .map_err(|failure| failure.error);
                (name, result)
            });
            names.insert(task.id(), task_name);
        }

        let mut report = DriftReport::default();
        while let Some(joined) = reads.join_next().await {
            let (name, result) = match joined {
                Ok(read) => read,
                Err(e) => {
                    let name = names.remove(&e.id()).unwrap_or_default();
                    error!("Read task for {name} ended abnormally: {e}");
                    report.errors.push(ReadFailure {
                        resource: name,
                        error: format!("read task ended abnormally: {e}"),
                    });
                    continue;
                }
            };
            self.record_read(store, &name, result, &mut report)?;
        }

        report.resources.sort_by(|a, b| a.resource.cmp(&b.resource));
        report.errors.sort_by(|a, b| a.resource.cmp(&b.resource));
        store.persist().await?;

        if report.is_converged() {
            info!("No drift detected");
        } else {
            warn!("Drift detected in {} resources", report.resources.len());
        }
        Ok(report)
    }

    fn record_read(
        &self,
        store: &mut StateStore,
        name: &str,
        result: std::result::Result<Block, RemoteError>,
        report: &mut DriftReport,
    ) -> Result<()> {
        let state = store.get_mut(name)?;
        match result {
            Ok(observed) => {
                let drifted = drifted_fields(state.prior.as_ref(), &observed);
                if !drifted.is_empty() {
                    debug!("{name} drifted: {}", drifted.join(", "));
                    report.resources.push(ResourceDrift {
                        resource: name.to_string(),
                        drifted,
                        vanished: false,
                    });
                }
                state.observe(observed);
            }
            Err(e) if e.is_not_found() => {
                warn!("{name} no longer exists remotely");
                state.clear_remote();
                let forgotten = state.is_forgotten();
                report.resources.push(ResourceDrift {
                    resource: name.to_string(),
                    drifted: Vec::new(),
                    vanished: true,
                });
                if forgotten {
                    store.remove(name)?;
                }
            }
            Err(e) => {
                warn!(
                    "Could not read {name} after {} attempts: {e}",
                    self.settings.retry.max_attempts
                );
                report.errors.push(ReadFailure {
                    resource: name.to_string(),
                    error: e.to_string(),
                });
            }
        }
        Ok(())
    }

    /// Executes a plan.
    ///
    /// Independent operations run concurrently. An operation whose
    /// dependency failed is skipped; independent branches continue. The
    /// returned report lists what applied, failed, was skipped and, after a
    /// cancellation, what never started. Use
    /// [`ApplyReport::ensure_complete`] to turn an incomplete run into an
    /// error.
    ///
    /// # Errors
    ///
    /// Returns an error if the state cannot be locked or the final state
    /// cannot be persisted.
    pub async fn apply(
        &self,
        plan: &Plan,
        store: &mut StateStore,
        cancel: CancelSignal,
    ) -> Result<ApplyReport> {
        let acquired = !store.is_locked();
        if acquired {
            store.lock(LockPurpose::Apply).await?;
        }

        let executor = Executor::new(
            Arc::clone(&self.remote),
            self.settings.retry.clone(),
            cancel.clone(),
        );
        let result = Scheduler::new(plan, store, executor, self.settings.parallelism, cancel)
            .run()
            .await;

        let unlocked = if acquired { store.unlock().await } else { Ok(()) };
        let report = result?;
        unlocked?;
        Ok(report)
    }

    /// Refreshes, plans and applies in one run.
    ///
    /// Resources that drifted are planned against what the remote system
    /// reports, so out-of-band changes are reverted.
    ///
    /// # Errors
    ///
    /// Returns planning errors before any remote mutation, and the errors of
    /// [`Reconciler::refresh`] and [`Reconciler::apply`].
    pub async fn converge(
        &self,
        store: &mut StateStore,
        registry: &SchemaRegistry,
        cancel: CancelSignal,
    ) -> Result<ApplyReport> {
        store.lock(LockPurpose::Converge).await?;
        let result = self.converge_locked(store, registry, cancel).await;
        let unlocked = store.unlock().await;
        let report = result?;
        unlocked?;
        Ok(report)
    }

    async fn converge_locked(
        &self,
        store: &mut StateStore,
        registry: &SchemaRegistry,
        cancel: CancelSignal,
    ) -> Result<ApplyReport> {
        let drift = self.refresh(store).await?;
        for drifted in drift.resources.iter().filter(|d| !d.vanished) {
            let state = store.get_mut(&drifted.resource)?;
            if let Some(observed) = state.observed.clone() {
                debug!("Planning {} against its observed state", drifted.resource);
                state.commit(observed);
            }
        }

        let plan = Planner::new(registry).plan(store)?;
        if plan.is_empty() {
            info!("No changes required - state is converged");
        }
        self.apply(&plan, store, cancel).await
    }
}

impl std::fmt::Debug for Reconciler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Reconciler")
            .field("settings", &self.settings)
            .finish_non_exhaustive()
    }
}

/// Top-level fields whose observed value differs from prior state.
fn drifted_fields(prior: Option<&Block>, observed: &Block) -> Vec<String> {
    let Some(prior) = prior else {
        return Vec::new();
    };
    let keys: BTreeSet<&String> = prior.keys().chain(observed.keys()).collect();
    keys.into_iter()
        .filter(|key| prior.get(*key) != observed.get(*key))
        .cloned()
        .collect()
}
