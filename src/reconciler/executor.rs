//! Execution of a single planned operation.
//!
//! The executor owns the checked-out state of exactly one resource while it
//! runs. Every remote call goes through the retry policy; whatever the remote
//! system confirmed is folded back into that state, success or not.

use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::error::{ReconcileError, RemoteError, TerminalKind};
use crate::planner::{Delta, Differ, Operation, OperationKind};
use crate::remote::{Created, RemoteOps, RemoteRequest, RequestToken};
use crate::state::ResourceState;
use crate::value::{block_references, resolve_block, Block};

use super::cancel::CancelSignal;
use super::retry::RetryPolicy;

type OpResult = std::result::Result<(), ReconcileError>;

/// Runs operations against the remote system.
#[derive(Clone)]
pub(crate) struct Executor {
    remote: Arc<dyn RemoteOps>,
    retry: RetryPolicy,
    cancel: CancelSignal,
}

/// Everything one operation needs, owned by the task that runs it.
pub(crate) struct Job {
    pub operation: Operation,
    pub state: ResourceState,
    pub token: RequestToken,
    /// Identifiers of resources applied so far.
    pub known: HashMap<String, String>,
    /// A previous run left a mutation unconfirmed.
    pub recovering: bool,
}

impl Executor {
    pub(crate) fn new(remote: Arc<dyn RemoteOps>, retry: RetryPolicy, cancel: CancelSignal) -> Self {
        Self {
            remote,
            retry,
            cancel,
        }
    }

    /// Runs the job and hands back the resource state with the outcome.
    pub(crate) async fn execute(&self, job: Job) -> (ResourceState, OpResult) {
        let Job {
            operation,
            mut state,
            token,
            known,
            recovering,
        } = job;
        let request = RemoteRequest::new(&operation.resource_type, &operation.resource, token);

        let outcome = self
            .dispatch(&operation, &mut state, &request, &known, recovering)
            .await;
        match &outcome {
            Ok(()) => info!("{} complete", operation.description()),
            Err(e) => warn!("{} failed: {e}", operation.description()),
        }
        (state, outcome)
    }

    async fn dispatch(
        &self,
        operation: &Operation,
        state: &mut ResourceState,
        request: &RemoteRequest,
        known: &HashMap<String, String>,
        recovering: bool,
    ) -> OpResult {
        if operation.kind == OperationKind::Destroy {
            return self.destroy(state, request, recovering).await;
        }

        let desired = state
            .desired
            .as_ref()
            .map(|d| resolve_block(d, known))
            .unwrap_or_default();
        if let Some(target) = block_references(&desired).into_iter().next() {
            return Err(ReconcileError::UnresolvedReference {
                resource: state.name.clone(),
                target,
            });
        }

        match operation.kind {
            OperationKind::Create => self.create(state, request, &desired, recovering).await,
            OperationKind::Update => {
                let delta = operation.delta.resolved(known);
                self.update(operation, state, request, &desired, delta, recovering)
                    .await
            }
            OperationKind::Replace => self.replace(state, request, &desired, recovering).await,
            OperationKind::NoOp => self.confirm(state, request).await,
            OperationKind::Destroy => Ok(()),
        }
    }

    async fn create(
        &self,
        state: &mut ResourceState,
        request: &RemoteRequest,
        desired: &Block,
        recovering: bool,
    ) -> OpResult {
        if recovering {
            if let Some(found) = self.find_existing(state, request, desired).await? {
                info!(
                    "Adopting {} created by an interrupted run: {}",
                    state.name, found.identifier
                );
                state.record_created(found.identifier, found.observed);
                return Ok(());
            }
        }

        let remote = &self.remote;
        let deduplicates = remote.supports_request_tokens();
        let label = format!("create {}", state.name);
        let created = self
            .retry
            .run(&label, &self.cancel, |attempt| {
                let request = request.for_attempt(attempt);
                async move {
                    // The previous attempt may have landed before failing.
                    if attempt > 1 && !deduplicates {
                        if let Some(found) = remote.find_existing(&request, desired).await? {
                            return Ok(found);
                        }
                    }
                    remote.create(&request, desired).await
                }
            })
            .await
            .map_err(|failure| failure.into_error(&state.name, "create"))?;

        state.record_created(created.identifier, created.observed);
        Ok(())
    }

    async fn update(
        &self,
        operation: &Operation,
        state: &mut ResourceState,
        request: &RemoteRequest,
        desired: &Block,
        mut delta: Delta,
        recovering: bool,
    ) -> OpResult {
        let identifier = require_identifier(state)?;

        if recovering {
            let current = match self.read(state, request, &identifier).await {
                Ok(current) => current,
                Err(error) => return Err(Self::vanished_on_update(state, error)),
            };
            state.observe(current.clone());
            if let Ok(fresh) = Differ::new(&operation.schema).diff(&state.name, desired, &current) {
                delta = fresh;
            }
            if delta.is_empty() {
                debug!("{} already matches desired state", state.name);
                state.record_applied(current);
                return Ok(());
            }
        }

        let remote = &self.remote;
        let label = format!("update {}", state.name);
        let result = self
            .retry
            .run(&label, &self.cancel, |attempt| {
                let request = request.for_attempt(attempt);
                let identifier = identifier.as_str();
                let delta = &delta;
                async move { remote.update(&request, identifier, delta, desired).await }
            })
            .await;

        match result {
            Ok(observed) => {
                state.record_applied(observed);
                Ok(())
            }
            Err(failure) if failure.error.is_not_found() => {
                Err(Self::vanished_on_update(state, failure.error))
            }
            Err(failure) => {
                self.read_back(state, request, &identifier).await;
                Err(failure.into_error(&state.name, "update"))
            }
        }
    }

    async fn replace(
        &self,
        state: &mut ResourceState,
        request: &RemoteRequest,
        desired: &Block,
        recovering: bool,
    ) -> OpResult {
        if let Some(identifier) = state.identifier.clone() {
            let result = self.delete(state, request, &identifier).await;
            match result {
                Ok(()) => state.clear_remote(),
                Err(failure) if failure.error.is_not_found() => state.clear_remote(),
                Err(failure) => {
                    self.read_back(state, request, &identifier).await;
                    return Err(failure.into_error(&state.name, "delete"));
                }
            }
        }
        self.create(state, request, desired, recovering).await
    }

    /// Deletes the resource, and when an earlier run left a mutation
    /// unconfirmed, whatever object that run may have created.
    async fn destroy(
        &self,
        state: &mut ResourceState,
        request: &RemoteRequest,
        recovering: bool,
    ) -> OpResult {
        let mut targets: Vec<String> = state.identifier.iter().cloned().collect();
        if recovering {
            let key = state
                .prior
                .clone()
                .or_else(|| state.observed.clone())
                .unwrap_or_default();
            if let Some(found) = self.find_existing(state, request, &key).await? {
                if !targets.contains(&found.identifier) {
                    info!(
                        "Found {} left by an interrupted run: {}",
                        state.name, found.identifier
                    );
                    targets.push(found.identifier);
                }
            }
        }
        if targets.is_empty() && !recovering {
            require_identifier(state)?;
        }

        for identifier in &targets {
            match self.delete(state, request, identifier).await {
                Ok(()) => {}
                Err(failure) if failure.error.is_not_found() => {
                    debug!("{} ({identifier}) was already gone", state.name);
                }
                Err(failure) => return Err(failure.into_error(&state.name, "delete")),
            }
        }
        state.record_destroyed();
        Ok(())
    }

    /// Settles a resource left in progress by an earlier run when the plan
    /// has nothing else to do for it.
    async fn confirm(&self, state: &mut ResourceState, request: &RemoteRequest) -> OpResult {
        let identifier = require_identifier(state)?;
        match self.read(state, request, &identifier).await {
            Ok(current) => {
                state.record_applied(current);
                Ok(())
            }
            Err(error) => {
                if error.is_not_found() {
                    state.clear_remote();
                }
                Err(ReconcileError::OperationFailed {
                    resource: state.name.clone(),
                    operation: String::from("read"),
                    source: error,
                })
            }
        }
    }

    async fn delete(
        &self,
        state: &ResourceState,
        request: &RemoteRequest,
        identifier: &str,
    ) -> std::result::Result<(), super::retry::RetryFailure> {
        let remote = &self.remote;
        let label = format!("delete {}", state.name);
        self.retry
            .run(&label, &self.cancel, |attempt| {
                let request = request.for_attempt(attempt);
                async move { remote.delete(&request, identifier).await }
            })
            .await
    }

    async fn read(
        &self,
        state: &ResourceState,
        request: &RemoteRequest,
        identifier: &str,
    ) -> std::result::Result<Block, RemoteError> {
        let remote = &self.remote;
        let label = format!("read {}", state.name);
        self.retry
            .run(&label, &self.cancel, |attempt| {
                let request = request.for_attempt(attempt);
                async move { remote.read(&request, identifier).await }
            })
            .await
            .map_err(|failure| failure.error)
    }

    async fn find_existing(
        &self,
        state: &ResourceState,
        request: &RemoteRequest,
        desired: &Block,
    ) -> std::result::Result<Option<Created>, ReconcileError> {
        let remote = &self.remote;
        let label = format!("look up {}", state.name);
        self.retry
            .run(&label, &self.cancel, |attempt| {
                let request = request.for_attempt(attempt);
                async move { remote.find_existing(&request, desired).await }
            })
            .await
            .map_err(|failure| failure.into_error(&state.name, "look up"))
    }

    /// Commits what the remote system holds after a failed mutation.
    ///
    /// If the read fails too, the previous prior stays.
    async fn read_back(&self, state: &mut ResourceState, request: &RemoteRequest, identifier: &str) {
        let attempt = request.for_attempt(1);
        match self.remote.read(&attempt, identifier).await {
            Ok(current) => {
                state.observe(current.clone());
                state.commit(current);
                debug!("Committed observed state of {} after failure", state.name);
            }
            Err(error) if error.is_not_found() => state.clear_remote(),
            Err(error) => warn!("Could not read back {}: {error}", state.name),
        }
    }

    fn vanished_on_update(state: &mut ResourceState, error: RemoteError) -> ReconcileError {
        if error.is_not_found() {
            state.clear_remote();
            return ReconcileError::OperationFailed {
                resource: state.name.clone(),
                operation: String::from("update"),
                source: RemoteError::terminal(
                    TerminalKind::NotFoundOnUpdate,
                    format!("{} no longer exists", state.name),
                ),
            };
        }
        ReconcileError::OperationFailed {
            resource: state.name.clone(),
            operation: String::from("read"),
            source: error,
        }
    }
}

impl std::fmt::Debug for Executor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Executor")
            .field("retry", &self.retry)
            .finish_non_exhaustive()
    }
}

fn require_identifier(state: &ResourceState) -> std::result::Result<String, ReconcileError> {
    state
        .identifier
        .clone()
        .ok_or_else(|| ReconcileError::OperationFailed {
            resource: state.name.clone(),
            operation: String::from("locate"),
            source: RemoteError::not_found(format!("{} has no identifier", state.name)),
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::remote::MockRemoteOps;
    use crate::schema::{FieldSpec, ResourceSchema};
    use crate::value::Value;
    use std::time::Duration;

    fn block(size: &str) -> Block {
        [(String::from("size"), Value::string(size))].into()
    }

    fn executor(remote: MockRemoteOps) -> Executor {
        let retry = RetryPolicy::new(3)
            .with_initial_delay(Duration::from_millis(1))
            .with_max_delay(Duration::from_millis(1));
        Executor::new(Arc::new(remote), retry, CancelSignal::never())
    }

    fn operation(kind: OperationKind, delta: Delta) -> Operation {
        Operation {
            kind,
            resource: String::from("vm1"),
            resource_type: String::from("machine"),
            identifier: None,
            delta,
            depends_on: Vec::new(),
            reason: String::new(),
            schema: Arc::new(ResourceSchema::new().with_field("size", FieldSpec::string())),
        }
    }

    fn job(kind: OperationKind, state: ResourceState, recovering: bool) -> Job {
        let schema = ResourceSchema::new().with_field("size", FieldSpec::string());
        let delta = match (&state.desired, &state.prior) {
            (Some(desired), Some(prior)) => Differ::new(&schema).diff("vm1", desired, prior).unwrap(),
            _ => Delta::new(),
        };
        Job {
            operation: operation(kind, delta),
            state,
            token: RequestToken::from_string("t-1"),
            known: HashMap::new(),
            recovering,
        }
    }

    fn existing(desired: &str, prior: &str) -> ResourceState {
        let mut state = ResourceState::new("vm1", "machine");
        state.desired = Some(block(desired));
        state.record_created(String::from("/vms/1"), block(prior));
        state
    }

    #[tokio::test]
    async fn test_create_records_identifier() {
        let mut remote = MockRemoteOps::new();
        remote.expect_supports_request_tokens().return_const(true);
        remote.expect_create().times(1).returning(|request, desired| {
            assert_eq!(request.token.as_str(), "t-1");
            Ok(Created {
                identifier: String::from("/vms/1"),
                observed: desired.clone(),
            })
        });

        let mut state = ResourceState::new("vm1", "machine");
        state.desired = Some(block("A1"));
        let (state, outcome) = executor(remote)
            .execute(job(OperationKind::Create, state, false))
            .await;
        outcome.unwrap();
        assert_eq!(state.current_identifier(), Some("/vms/1"));
        assert_eq!(state.prior, Some(block("A1")));
    }

    #[tokio::test]
    async fn test_retried_create_looks_up_first() {
        let mut remote = MockRemoteOps::new();
        remote.expect_supports_request_tokens().return_const(false);
        remote
            .expect_create()
            .times(1)
            .returning(|_, _| Err(RemoteError::transient("connection reset")));
        remote.expect_find_existing().times(1).returning(|_, desired| {
            Ok(Some(Created {
                identifier: String::from("/vms/1"),
                observed: desired.clone(),
            }))
        });

        let mut state = ResourceState::new("vm1", "machine");
        state.desired = Some(block("A1"));
        let (state, outcome) = executor(remote)
            .execute(job(OperationKind::Create, state, false))
            .await;
        outcome.unwrap();
        assert_eq!(state.current_identifier(), Some("/vms/1"));
    }

    #[tokio::test]
    async fn test_recovering_create_adopts_existing_object() {
        let mut remote = MockRemoteOps::new();
        remote.expect_create().never();
        remote.expect_find_existing().times(1).returning(|_, desired| {
            Ok(Some(Created {
                identifier: String::from("/vms/1"),
                observed: desired.clone(),
            }))
        });

        let mut state = ResourceState::new("vm1", "machine");
        state.desired = Some(block("A1"));
        let (state, outcome) = executor(remote)
            .execute(job(OperationKind::Create, state, true))
            .await;
        outcome.unwrap();
        assert_eq!(state.current_identifier(), Some("/vms/1"));
    }

    #[tokio::test]
    async fn test_update_not_found_clears_identifier() {
        let mut remote = MockRemoteOps::new();
        remote
            .expect_update()
            .times(1)
            .returning(|_, id, _, _| Err(RemoteError::not_found(id)));

        let (state, outcome) = executor(remote)
            .execute(job(OperationKind::Update, existing("A2", "A1"), false))
            .await;
        let err = outcome.unwrap_err();
        assert!(matches!(
            err,
            ReconcileError::OperationFailed {
                source: RemoteError::Terminal { kind: TerminalKind::NotFoundOnUpdate, .. },
                ..
            }
        ));
        assert!(state.current_identifier().is_none());
        assert!(state.prior.is_none());
    }

    #[tokio::test]
    async fn test_failed_update_commits_what_remote_confirmed() {
        let mut remote = MockRemoteOps::new();
        remote.expect_update().times(1).returning(|_, _, _, _| {
            Err(RemoteError::terminal(TerminalKind::Quota, "core quota exceeded"))
        });
        remote.expect_read().times(1).returning(|_, _| Ok(block("A1-partial")));

        let (state, outcome) = executor(remote)
            .execute(job(OperationKind::Update, existing("A2", "A1"), false))
            .await;
        assert!(outcome.is_err());
        assert_eq!(state.prior, Some(block("A1-partial")));
        assert_eq!(state.current_identifier(), Some("/vms/1"));
    }

    #[tokio::test]
    async fn test_recovering_update_skips_call_when_already_applied() {
        let mut remote = MockRemoteOps::new();
        remote.expect_read().times(1).returning(|_, _| Ok(block("A2")));
        remote.expect_update().never();

        let (state, outcome) = executor(remote)
            .execute(job(OperationKind::Update, existing("A2", "A1"), true))
            .await;
        outcome.unwrap();
        assert_eq!(state.prior, Some(block("A2")));
    }

    #[tokio::test]
    async fn test_destroy_treats_missing_object_as_done() {
        let mut remote = MockRemoteOps::new();
        remote
            .expect_delete()
            .times(1)
            .returning(|_, id| Err(RemoteError::not_found(id)));

        let mut state = existing("A1", "A1");
        state.desired = None;
        let (state, outcome) = executor(remote)
            .execute(job(OperationKind::Destroy, state, false))
            .await;
        outcome.unwrap();
        assert!(state.is_forgotten());
    }

    #[tokio::test]
    async fn test_recovering_destroy_removes_object_of_interrupted_replace() {
        let mut remote = MockRemoteOps::new();
        remote.expect_find_existing().times(1).returning(|request, _| {
            assert_eq!(request.token.as_str(), "t-1");
            Ok(Some(Created {
                identifier: String::from("/vms/2"),
                observed: block("A2"),
            }))
        });
        let deleted = Arc::new(std::sync::Mutex::new(Vec::new()));
        let seen = Arc::clone(&deleted);
        remote.expect_delete().times(2).returning(move |_, id| {
            seen.lock().unwrap().push(id.to_string());
            Ok(())
        });

        let mut state = existing("A1", "A1");
        state.desired = None;
        let (state, outcome) = executor(remote)
            .execute(job(OperationKind::Destroy, state, true))
            .await;
        outcome.unwrap();
        assert!(state.is_forgotten());
        assert_eq!(*deleted.lock().unwrap(), vec!["/vms/1", "/vms/2"]);
    }

    #[tokio::test]
    async fn test_recovering_destroy_without_identifier_finds_nothing() {
        let mut remote = MockRemoteOps::new();
        remote.expect_find_existing().times(1).returning(|_, _| Ok(None));
        remote.expect_delete().never();

        let mut state = ResourceState::new("vm1", "machine");
        state.begin(OperationKind::Create, RequestToken::from_string("t-1"));
        let (state, outcome) = executor(remote)
            .execute(job(OperationKind::Destroy, state, true))
            .await;
        outcome.unwrap();
        assert!(state.pending.is_none());
        assert!(state.is_forgotten());
    }

    #[tokio::test]
    async fn test_unresolved_reference_is_reported() {
        let remote = MockRemoteOps::new();
        let mut state = ResourceState::new("vm1", "machine");
        state.desired = Some(
            [(String::from("nic"), Value::string(crate::value::reference_to("nic1")))].into(),
        );
        let (_, outcome) = executor(remote)
            .execute(job(OperationKind::Create, state, false))
            .await;
        assert!(matches!(
            outcome,
            Err(ReconcileError::UnresolvedReference { ref target, .. }) if target == "nic1"
        ));
    }
}
