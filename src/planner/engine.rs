//! Plan construction.
//!
//! The planner reads every resource in the state store, orders resources by
//! their references, diffs each one against its prior-applied state and
//! turns the result into a [`Plan`].

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use tracing::{debug, info};

use crate::error::{PlanError, Result};
use crate::schema::{ResourceSchema, SchemaRegistry};
use crate::state::{ResourceState, StateStore};
use crate::value::{block_references, resolve_block, Block};

use super::diff::{Delta, Differ};
use super::graph::DependencyGraph;
use super::plan::{Operation, OperationKind, Plan};

/// Builds plans from state.
#[derive(Debug, Clone, Copy)]
pub struct Planner<'a> {
    registry: &'a SchemaRegistry,
}

struct Planned {
    kind: OperationKind,
    resource_type: String,
    identifier: Option<String>,
    delta: Delta,
    reason: String,
    schema: Arc<ResourceSchema>,
}

impl<'a> Planner<'a> {
    /// Creates a planner using the given schemas.
    #[must_use]
    pub const fn new(registry: &'a SchemaRegistry) -> Self {
        Self { registry }
    }

    /// Decides what to do with an existing resource given its delta.
    ///
    /// Any change that forces replacement makes the whole operation a
    /// replacement; in-place changes to other fields are applied by the
    /// re-create.
    #[must_use]
    pub fn decide(delta: &Delta) -> OperationKind {
        if delta.is_empty() {
            OperationKind::NoOp
        } else if delta.requires_replacement() {
            OperationKind::Replace
        } else {
            OperationKind::Update
        }
    }

    /// Builds the reference graph between declared resources.
    ///
    /// # Errors
    ///
    /// Returns [`PlanError::DanglingReference`] if a resource references one
    /// that is not declared.
    pub fn dependency_graph(&self, store: &StateStore) -> Result<DependencyGraph> {
        let mut graph = DependencyGraph::new();
        for state in store.resources() {
            let Some(desired) = &state.desired else {
                continue;
            };
            graph.add_node(state.name.as_str());
            for target in block_references(desired) {
                let declared = store.get(&target).is_some_and(|t| t.desired.is_some());
                if !declared {
                    return Err(PlanError::DanglingReference {
                        resource: state.name.clone(),
                        target,
                    }
                    .into());
                }
                graph.add_edge(&state.name, &target);
            }
        }
        Ok(graph)
    }

    /// Plans every resource in the store.
    ///
    /// # Errors
    ///
    /// Returns a planning error for reference cycles, dangling references,
    /// unknown resource types and required fields missing from desired state.
    /// No plan is produced if any resource fails.
    pub fn plan(&self, store: &StateStore) -> Result<Plan> {
        let graph = self.dependency_graph(store)?;
        let order = graph.topological_order()?;

        let mut known: HashMap<String, String> = HashMap::new();
        let mut planned: BTreeMap<String, Planned> = BTreeMap::new();

        for name in &order {
            let Some(state) = store.get(name) else {
                continue;
            };
            let item = self.plan_declared(state, &known)?;
            if let (Some(id), false) = (&item.identifier, item.kind.creates()) {
                known.insert(name.clone(), id.clone());
            }
            planned.insert(name.clone(), item);
        }

        for state in store.resources() {
            if state.desired.is_some() {
                continue;
            }
            // An interrupted create may have left an object behind.
            if state.current_identifier().is_some() || state.needs_recovery() {
                let schema = self
                    .registry
                    .get(&state.resource_type)
                    .cloned()
                    .unwrap_or_default();
                planned.insert(
                    state.name.clone(),
                    Planned {
                        kind: OperationKind::Destroy,
                        resource_type: state.resource_type.clone(),
                        identifier: state.identifier.clone(),
                        delta: Delta::new(),
                        reason: String::from("removed from configuration"),
                        schema: Arc::new(schema),
                    },
                );
            }
        }

        let operation_graph = Self::operation_graph(store, &planned);
        let order = operation_graph.topological_order_by(|name| {
            planned
                .get(name)
                .map_or(1, |p| u8::from(p.kind != OperationKind::Destroy))
        })?;
        let index: HashMap<&str, usize> = order
            .iter()
            .enumerate()
            .map(|(i, name)| (name.as_str(), i))
            .collect();

        let mut operations = Vec::with_capacity(order.len());
        for name in &order {
            let Some(item) = planned.remove(name) else {
                continue;
            };
            let depends_on = operation_graph
                .dependencies(name)
                .filter_map(|dep| index.get(dep).copied())
                .collect();
            operations.push(Operation {
                kind: item.kind,
                resource: name.clone(),
                resource_type: item.resource_type,
                identifier: item.identifier,
                delta: item.delta,
                depends_on,
                reason: item.reason,
                schema: item.schema,
            });
        }

        let plan = Plan::new(operations)?;
        info!(
            "Planned {} changes across {} resources ({} create, {} update, {} replace, {} destroy)",
            plan.changes().count(),
            plan.len(),
            plan.count(OperationKind::Create),
            plan.count(OperationKind::Update),
            plan.count(OperationKind::Replace),
            plan.count(OperationKind::Destroy),
        );
        Ok(plan)
    }

    fn plan_declared(&self, state: &ResourceState, known: &HashMap<String, String>) -> Result<Planned> {
        let schema = self.registry.get(&state.resource_type).ok_or_else(|| {
            PlanError::UnknownResourceType {
                resource: state.name.clone(),
                resource_type: state.resource_type.clone(),
            }
        })?;
        let desired = state
            .desired
            .as_ref()
            .map(|d| resolve_block(d, known))
            .unwrap_or_default();
        let differ = Differ::new(schema);

        let (kind, delta, reason) = match state.current_identifier() {
            None => {
                let delta = differ.diff(&state.name, &desired, &Block::new())?;
                let reason = if state.needs_recovery() {
                    String::from("previous create was interrupted")
                } else {
                    String::from("not yet created")
                };
                (OperationKind::Create, delta, reason)
            }
            Some(_) => {
                let prior = state.prior.clone().unwrap_or_default();
                let delta = differ.diff(&state.name, &desired, &prior)?;
                let kind = Self::decide(&delta);
                let reason = match kind {
                    OperationKind::Replace => {
                        let paths: Vec<String> =
                            delta.replacement_paths().map(ToString::to_string).collect();
                        format!("{} forces replacement", paths.join(", "))
                    }
                    OperationKind::Update => format!("{} field(s) changed", delta.len()),
                    _ => String::from("up to date"),
                };
                (kind, delta, reason)
            }
        };

        debug!("Planned {kind} for {}: {reason}", state.name);
        Ok(Planned {
            kind,
            resource_type: state.resource_type.clone(),
            identifier: state.identifier.clone(),
            delta,
            reason,
            schema: Arc::new(schema.clone()),
        })
    }

    /// Edges between operations.
    ///
    /// A change waits for the create or replace of every resource it
    /// references. A destroy waits for the change of every resource that
    /// referenced the destroyed one when last applied.
    fn operation_graph(store: &StateStore, planned: &BTreeMap<String, Planned>) -> DependencyGraph {
        let mut graph = DependencyGraph::new();
        for name in planned.keys() {
            graph.add_node(name.as_str());
        }

        for (name, item) in planned {
            if !item.kind.is_change() {
                continue;
            }
            let Some(state) = store.get(name) else {
                continue;
            };

            if item.kind == OperationKind::Destroy {
                for other in store.resources() {
                    let changes = planned.get(&other.name).is_some_and(|p| p.kind.is_change());
                    if other.name != *name && changes && other.depends_on.contains(name) {
                        graph.add_edge(name, &other.name);
                    }
                }
                continue;
            }

            for target in state.desired.as_ref().map(block_references).unwrap_or_default() {
                if planned.get(&target).is_some_and(|t| t.kind.creates()) {
                    graph.add_edge(name, &target);
                }
            }
        }
        graph
    }
}
