//! Concurrent plan execution.
//!
//! Operations whose dependencies have all applied run concurrently, up to
//! the parallelism limit. Each running operation owns the checked-out state
//! of its resource; the store is only touched from the scheduling loop, and
//! is persisted before every mutation starts and after every operation
//! finishes.

use std::collections::{BTreeSet, HashMap};
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};

use crate::error::{ReconcileError, Result};
use crate::planner::{OperationKind, Plan};
use crate::remote::RequestToken;
use crate::state::{HistoryEntry, ResourceState, StateStore};

use super::cancel::CancelSignal;
use super::executor::{Executor, Job};
use super::report::{ApplyReport, FailedOperation, SkippedOperation};

type Finished = (usize, ResourceState, std::result::Result<(), ReconcileError>);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Progress {
    Waiting,
    Running,
    Applied,
    Failed,
}

pub(crate) struct Scheduler<'a> {
    plan: &'a Plan,
    store: &'a mut StateStore,
    executor: Executor,
    parallelism: usize,
    cancel: CancelSignal,
    progress: Vec<Progress>,
    known: HashMap<String, String>,
    in_flight: BTreeSet<usize>,
    tasks: JoinSet<Finished>,
    report: ApplyReport,
}

impl<'a> Scheduler<'a> {
    pub(crate) fn new(
        plan: &'a Plan,
        store: &'a mut StateStore,
        executor: Executor,
        parallelism: usize,
        cancel: CancelSignal,
    ) -> Self {
        let mut known: HashMap<String, String> = store
            .resources()
            .filter_map(|s| s.current_identifier().map(|id| (s.name.clone(), id.to_string())))
            .collect();
        // Identifiers about to be replaced must not leak into dependents.
        for operation in plan.operations() {
            if operation.kind.creates() {
                known.remove(&operation.resource);
            }
        }

        Self {
            plan,
            store,
            executor,
            parallelism: parallelism.max(1),
            cancel,
            progress: vec![Progress::Waiting; plan.len()],
            known,
            in_flight: BTreeSet::new(),
            tasks: JoinSet::new(),
            report: ApplyReport::default(),
        }
    }

    pub(crate) async fn run(mut self) -> Result<ApplyReport> {
        info!(
            "Executing plan with {} operations (parallelism {})",
            self.plan.changes().count(),
            self.parallelism
        );

        let mut waiter = self.cancel.clone();
        loop {
            if !self.report.cancelled && self.cancel.is_cancelled() {
                self.on_cancel();
            }
            if !self.report.cancelled {
                self.schedule().await;
            }

            if self.tasks.is_empty() {
                if self.in_flight.is_empty() {
                    break;
                }
                self.release_lost();
                continue;
            }

            let joined = if self.report.cancelled {
                self.tasks.join_next().await
            } else {
                tokio::select! {
                    joined = self.tasks.join_next() => joined,
                    () = waiter.cancelled() => continue,
                }
            };

            match joined {
                Some(Ok(finished)) => self.finish(finished).await,
                Some(Err(e)) => error!("Operation task ended abnormally: {e}"),
                None => {}
            }
        }

        self.wrap_up().await
    }

    /// Starts every operation that is ready, and skips those whose
    /// dependencies did not apply.
    async fn schedule(&mut self) {
        let plan = self.plan;
        for (index, operation) in plan.operations().iter().enumerate() {
            if self.tasks.len() >= self.parallelism {
                break;
            }
            if self.progress[index] != Progress::Waiting {
                continue;
            }

            let blocker = operation
                .depends_on
                .iter()
                .copied()
                .find(|dep| self.progress[*dep] == Progress::Failed);
            if let Some(blocker) = blocker {
                let blocked_by = plan
                    .get(blocker)
                    .map(|op| op.resource.clone())
                    .unwrap_or_default();
                warn!("Skipping {} '{}': {blocked_by} did not apply", operation.kind, operation.resource);
                self.progress[index] = Progress::Failed;
                self.report.skipped.push(SkippedOperation {
                    resource: operation.resource.clone(),
                    kind: operation.kind,
                    blocked_by,
                });
                continue;
            }

            let ready = operation
                .depends_on
                .iter()
                .all(|dep| self.progress[*dep] == Progress::Applied);
            if ready {
                self.start(index).await;
            }
        }
    }

    async fn start(&mut self, index: usize) {
        let plan = self.plan;
        let Some(operation) = plan.get(index) else {
            return;
        };

        let recovering = self
            .store
            .get(&operation.resource)
            .is_some_and(ResourceState::needs_recovery);
        if operation.kind == OperationKind::NoOp && !recovering {
            self.progress[index] = Progress::Applied;
            self.report.unchanged.push(operation.resource.clone());
            return;
        }

        let job = match self.prepare(index, recovering).await {
            Ok(job) => job,
            Err(e) => {
                error!("Could not start {}: {e}", operation.description());
                if let Ok(state) = self.store.get_mut(&operation.resource) {
                    state.record_failed();
                }
                self.fail(index, e.to_string());
                return;
            }
        };

        if recovering {
            warn!("{} was interrupted by an earlier run; checking remote state first", operation.resource);
        }
        debug!("Starting {}", operation.description());

        let executor = self.executor.clone();
        self.tasks.spawn(async move {
            let (state, outcome) = executor.execute(job).await;
            (index, state, outcome)
        });
        self.in_flight.insert(index);
        self.progress[index] = Progress::Running;
    }

    /// Marks the mutation as started, persists that, and checks the
    /// resource out for the task.
    async fn prepare(&mut self, index: usize, recovering: bool) -> Result<Job> {
        let plan = self.plan;
        let Some(operation) = plan.get(index) else {
            return Err(crate::error::ConvergeError::internal(format!(
                "no operation at index {index}"
            )));
        };

        let state = self.store.get_mut(&operation.resource)?;
        let token = reusable_token(state, operation.kind).unwrap_or_else(RequestToken::generate);
        if operation.kind.is_change() {
            state.begin(operation.kind, token.clone());
            self.store.persist().await?;
        }

        let state = self.store.checkout(&operation.resource)?;
        Ok(Job {
            operation: operation.clone(),
            state,
            token,
            known: self.known.clone(),
            recovering,
        })
    }

    async fn finish(&mut self, (index, mut state, outcome): Finished) {
        self.in_flight.remove(&index);
        let plan = self.plan;
        let kind = plan.get(index).map_or(OperationKind::NoOp, |op| op.kind);
        let name = state.name.clone();

        match outcome {
            Ok(()) => {
                match state.current_identifier() {
                    Some(id) => {
                        self.known.insert(name.clone(), id.to_string());
                    }
                    None => {
                        self.known.remove(&name);
                    }
                }
                self.progress[index] = Progress::Applied;
                if kind == OperationKind::NoOp {
                    self.report.unchanged.push(name.clone());
                } else {
                    self.report.applied.push(name.clone());
                }
            }
            Err(e) => {
                error!("{kind} '{name}' failed: {e}");
                state.record_failed();
                self.fail(index, e.to_string());
            }
        }

        let forgotten = state.is_forgotten();
        self.store.checkin(state);
        if forgotten {
            if let Err(e) = self.store.remove(&name) {
                warn!("Could not drop {name} from state: {e}");
            }
        }
        self.persist(&name).await;
    }

    /// Returns the state of operations whose task ended without a result.
    fn release_lost(&mut self) {
        let plan = self.plan;
        for index in std::mem::take(&mut self.in_flight) {
            let Some(operation) = plan.get(index) else {
                continue;
            };
            if let Some(state) = self.store.release(&operation.resource) {
                state.record_failed();
            }
            self.fail(index, String::from("operation task ended abnormally"));
        }
    }

    fn fail(&mut self, index: usize, error: String) {
        let plan = self.plan;
        let Some(operation) = plan.get(index) else {
            return;
        };
        self.progress[index] = Progress::Failed;
        self.report.failed.push(FailedOperation {
            resource: operation.resource.clone(),
            kind: operation.kind,
            error,
        });
    }

    fn on_cancel(&mut self) {
        let plan = self.plan;
        self.report.cancelled = true;
        self.report.in_flight_at_cancel = self
            .in_flight
            .iter()
            .filter_map(|index| plan.get(*index))
            .map(|op| op.resource.clone())
            .collect();
        warn!(
            "Cancellation requested; waiting for {} in-flight operations",
            self.in_flight.len()
        );
    }

    async fn persist(&mut self, after: &str) {
        if let Err(e) = self.store.persist().await {
            error!("Failed to persist state after {after}: {e}");
        }
    }

    async fn wrap_up(mut self) -> Result<ApplyReport> {
        let plan = self.plan;
        for (index, progress) in self.progress.iter().enumerate() {
            if *progress == Progress::Waiting {
                if let Some(operation) = plan.get(index) {
                    self.report.not_started.push(operation.resource.clone());
                }
            }
        }

        let failed = self
            .report
            .failed
            .iter()
            .map(|f| f.resource.clone())
            .collect();
        self.store.record_history(HistoryEntry::new(
            self.report.applied.clone(),
            failed,
            self.report.cancelled,
        ));
        self.store.persist().await?;

        info!("Apply finished: {}", self.report.summary());
        Ok(self.report)
    }
}

/// Token of an earlier unconfirmed attempt at the same mutation.
///
/// Reusing it lets a deduplicating backend recognise the retry. A destroy
/// inherits the token of an unconfirmed create so it can find that object.
fn reusable_token(state: &ResourceState, kind: OperationKind) -> Option<RequestToken> {
    state
        .pending
        .as_ref()
        .filter(|pending| {
            pending.kind == kind
                || (pending.kind.creates() && (kind.creates() || kind == OperationKind::Destroy))
        })
        .map(|pending| pending.token.clone())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_token_is_reused_for_same_mutation() {
        let mut state = ResourceState::new("vm1", "virtual_machine");
        assert!(reusable_token(&state, OperationKind::Create).is_none());

        state.begin(OperationKind::Create, RequestToken::from_string("t-1"));
        assert_eq!(
            reusable_token(&state, OperationKind::Create).map(|t| t.as_str().to_string()),
            Some(String::from("t-1"))
        );
        assert!(reusable_token(&state, OperationKind::Replace).is_some());
        assert!(reusable_token(&state, OperationKind::Update).is_none());
        assert!(reusable_token(&state, OperationKind::Destroy).is_some());

        state.begin(OperationKind::Update, RequestToken::from_string("t-2"));
        assert!(reusable_token(&state, OperationKind::Destroy).is_none());
    }
}
