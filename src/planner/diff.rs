//! Field-level diff between desired and prior-applied state.
//!
//! The differ walks both blocks against the resource schema and records
//! every caller-controlled field whose value changed, annotated with the
//! field's mutability class.
//!
//! Set-typed fields are compared by member identity. A member's identity is
//! its content hash, restricted to the member's non-computed fields when the
//! member is a block. Changing an identifying field of a member therefore
//! shows up as one member removed and another added, never as an edit in
//! place.

use serde::ser::{Serialize, Serializer};
use std::collections::{BTreeMap, HashMap};
use tracing::debug;

use crate::error::PlanError;
use crate::schema::{FieldSpec, Mutability, ResourceSchema, ValueKind};
use crate::value::{references_in, resolve, Block, ContentHash, FieldPath, Value, ValueSet};

/// Result type for diffing.
pub type DiffResult<T> = std::result::Result<T, PlanError>;

/// A single changed field.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize)]
pub struct FieldChange {
    /// Value in prior state, absent if the field is being added.
    pub old: Option<Value>,
    /// Value in desired state, absent if the field is being removed.
    pub new: Option<Value>,
    /// How the change can be applied.
    pub mutability: Mutability,
    /// The new value references a resource whose identifier is not known
    /// until that resource has been applied.
    pub deferred: bool,
}

/// Field-level changes for one resource, keyed by path.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Delta {
    changes: BTreeMap<FieldPath, FieldChange>,
}

/// Computes deltas for one resource type.
#[derive(Debug, Clone, Copy)]
pub struct Differ<'a> {
    schema: &'a ResourceSchema,
}

impl FieldChange {
    fn new(old: Option<Value>, new: Option<Value>, mutability: Mutability) -> Self {
        let deferred = new.as_ref().is_some_and(|v| !references_in(v).is_empty());
        Self {
            old,
            new,
            mutability,
            deferred,
        }
    }

    /// Returns true if applying this change requires recreating the resource.
    #[must_use]
    pub fn forces_replacement(&self) -> bool {
        self.mutability == Mutability::ForcesReplacement
    }
}

impl Delta {
    /// Creates an empty delta.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            changes: BTreeMap::new(),
        }
    }

    /// Adds a change.
    pub fn insert(&mut self, path: FieldPath, change: FieldChange) {
        self.changes.insert(path, change);
    }

    /// Looks up the change at a path.
    #[must_use]
    pub fn get(&self, path: &FieldPath) -> Option<&FieldChange> {
        self.changes.get(path)
    }

    /// All changes, ordered by path.
    pub fn iter(&self) -> impl Iterator<Item = (&FieldPath, &FieldChange)> {
        self.changes.iter()
    }

    /// Changed paths, ordered.
    pub fn paths(&self) -> impl Iterator<Item = &FieldPath> {
        self.changes.keys()
    }

    /// Number of changed paths.
    #[must_use]
    pub fn len(&self) -> usize {
        self.changes.len()
    }

    /// Returns true if nothing changed.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.changes.is_empty()
    }

    /// Returns true if any change forces replacement.
    #[must_use]
    pub fn requires_replacement(&self) -> bool {
        self.changes.values().any(FieldChange::forces_replacement)
    }

    /// Paths whose change forces replacement.
    pub fn replacement_paths(&self) -> impl Iterator<Item = &FieldPath> {
        self.changes
            .iter()
            .filter(|(_, change)| change.forces_replacement())
            .map(|(path, _)| path)
    }

    /// Returns true if any new value waits on another resource's identifier.
    #[must_use]
    pub fn has_deferred(&self) -> bool {
        self.changes.values().any(|change| change.deferred)
    }

    /// Returns a copy with references in new values substituted.
    #[must_use]
    pub fn resolved(&self, identifiers: &HashMap<String, String>) -> Self {
        let changes = self
            .changes
            .iter()
            .map(|(path, change)| {
                let new = change.new.as_ref().map(|v| resolve(v, identifiers));
                (
                    path.clone(),
                    FieldChange::new(change.old.clone(), new, change.mutability),
                )
            })
            .collect();
        Self { changes }
    }
}

impl Serialize for Delta {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_map(self.changes.iter().map(|(path, change)| (path.to_string(), change)))
    }
}

impl std::fmt::Display for Delta {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        for (path, change) in &self.changes {
            let marker = match (&change.old, &change.new) {
                (None, Some(_)) => "+",
                (Some(_), None) => "-",
                _ => "~",
            };
            write!(f, "{marker} {path}")?;
            match (&change.old, &change.new) {
                (Some(old), Some(new)) => write!(f, ": {old} => {new}")?,
                (None, Some(v)) | (Some(v), None) => write!(f, ": {v}")?,
                (None, None) => {}
            }
            if change.forces_replacement() {
                write!(f, " (forces replacement)")?;
            }
            if change.deferred {
                write!(f, " (known after apply)")?;
            }
            writeln!(f)?;
        }
        Ok(())
    }
}

impl<'a> Differ<'a> {
    /// Creates a differ for a schema.
    #[must_use]
    pub const fn new(schema: &'a ResourceSchema) -> Self {
        Self { schema }
    }

    /// Computes the delta from `prior` to `desired`.
    ///
    /// Unknown and computed-only fields are skipped. A field absent from
    /// desired state that the remote system may fill in is left alone.
    ///
    /// # Errors
    ///
    /// Returns [`PlanError::MissingRequiredField`] if a required field present
    /// in prior state is absent from desired state.
    pub fn diff(&self, resource: &str, desired: &Block, prior: &Block) -> DiffResult<Delta> {
        let mut delta = Delta::new();
        let mut walk = Walk {
            resource,
            delta: &mut delta,
        };
        walk.fields(
            &self.schema.fields,
            desired,
            prior,
            &FieldPath::root(),
            Mutability::Mutable,
        )?;
        debug!("Diffed {resource}: {} changed paths", delta.len());
        Ok(delta)
    }
}

struct Walk<'d> {
    resource: &'d str,
    delta: &'d mut Delta,
}

impl Walk<'_> {
    fn fields(
        &mut self,
        specs: &BTreeMap<String, FieldSpec>,
        desired: &Block,
        prior: &Block,
        base: &FieldPath,
        inherited: Mutability,
    ) -> DiffResult<()> {
        let names: std::collections::BTreeSet<&String> = desired.keys().chain(prior.keys()).collect();

        for name in names {
            let path = base.child(name.as_str());
            let Some(spec) = specs.get(name) else {
                debug!("Skipping unknown field {path} of {}", self.resource);
                continue;
            };
            if spec.is_computed_only() {
                continue;
            }
            let mutability = inherited.combine(spec.mutability);

            match (desired.get(name), prior.get(name)) {
                (Some(new), Some(old)) => {
                    if new != old {
                        self.value(&spec.kind, new, old, path, mutability)?;
                    }
                }
                (Some(new), None) => {
                    self.delta
                        .insert(path, FieldChange::new(None, Some(new.clone()), mutability));
                }
                (None, Some(old)) => {
                    if spec.required {
                        return Err(PlanError::MissingRequiredField {
                            resource: self.resource.to_string(),
                            field: path.to_string(),
                        });
                    }
                    if spec.defers_to_remote() {
                        debug!("Keeping remote value of {path} for {}", self.resource);
                        continue;
                    }
                    self.delta
                        .insert(path, FieldChange::new(Some(old.clone()), None, mutability));
                }
                (None, None) => {}
            }
        }
        Ok(())
    }

    fn value(
        &mut self,
        kind: &ValueKind,
        new: &Value,
        old: &Value,
        path: FieldPath,
        mutability: Mutability,
    ) -> DiffResult<()> {
        match (kind, new, old) {
            (ValueKind::Block { fields }, Value::Block(new), Value::Block(old)) => {
                self.fields(fields, new, old, &path, mutability)
            }
            (ValueKind::Set { element }, Value::Set(new), Value::Set(old)) => {
                self.set(element, new, old, &path, mutability)
            }
            _ => {
                self.delta.insert(
                    path,
                    FieldChange::new(Some(old.clone()), Some(new.clone()), mutability),
                );
                Ok(())
            }
        }
    }

    fn set(
        &mut self,
        element: &ValueKind,
        new: &ValueSet,
        old: &ValueSet,
        path: &FieldPath,
        mutability: Mutability,
    ) -> DiffResult<()> {
        let new_members = identify(element, new);
        let old_members = identify(element, old);

        for (identity, member) in &new_members {
            match old_members.get(identity) {
                None => self.delta.insert(
                    path.member(*identity),
                    FieldChange::new(None, Some((*member).clone()), mutability),
                ),
                Some(previous) if previous != member => {
                    self.value(element, member, previous, path.member(*identity), mutability)?;
                }
                Some(_) => {}
            }
        }
        for (identity, member) in &old_members {
            if !new_members.contains_key(identity) {
                self.delta.insert(
                    path.member(*identity),
                    FieldChange::new(Some((*member).clone()), None, mutability),
                );
            }
        }
        Ok(())
    }
}

/// Maps each member of a set to its identity under the element schema.
fn identify<'v>(element: &ValueKind, set: &'v ValueSet) -> BTreeMap<ContentHash, &'v Value> {
    set.iter()
        .map(|member| (member_identity(element, member), member))
        .collect()
}

/// Identity of a set member: the hash of its identifying fields if it is a
/// block, of its whole content otherwise.
#[must_use]
pub fn member_identity(element: &ValueKind, member: &Value) -> ContentHash {
    match (element, member) {
        (ValueKind::Block { fields }, Value::Block(block)) => {
            let identifying: Block = block
                .iter()
                .filter(|(name, _)| fields.get(*name).is_none_or(FieldSpec::is_identifying))
                .map(|(name, value)| (name.clone(), value.clone()))
                .collect();
            ContentHash::of(&Value::Block(identifying))
        }
        _ => member.content_hash(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::virtual_machine;
    use proptest::prelude::*;

    fn schema() -> ResourceSchema {
        ResourceSchema::new()
            .with_field("id", FieldSpec::string().computed_only())
            .with_field("name", FieldSpec::string().required().forces_replacement())
            .with_field("size", FieldSpec::string().required().forces_replacement())
            .with_field("zone", FieldSpec::string().optional_computed())
            .with_field("tags", FieldSpec::map(ValueKind::String))
            .with_field("nics", FieldSpec::set(ValueKind::String))
            .with_field(
                "disk",
                FieldSpec::block([
                    ("name", FieldSpec::string().required().forces_replacement()),
                    ("caching", FieldSpec::string().optional_computed()),
                ]),
            )
    }

    fn tags(env: &str) -> Value {
        Value::block([("env", Value::string(env))])
    }

    fn block(fields: Vec<(&str, Value)>) -> Block {
        fields.into_iter().map(|(k, v)| (k.to_string(), v)).collect()
    }

    #[test]
    fn test_equal_blocks_produce_empty_delta() {
        let schema = schema();
        let state = block(vec![("name", Value::string("vm1")), ("tags", tags("dev"))]);
        let delta = Differ::new(&schema).diff("vm1", &state, &state).unwrap();
        assert!(delta.is_empty());
    }

    #[test]
    fn test_changed_field_carries_mutability() {
        let schema = schema();
        let desired = block(vec![("size", Value::string("Standard_A2")), ("tags", tags("prod"))]);
        let prior = block(vec![("size", Value::string("Standard_A1")), ("tags", tags("dev"))]);
        let delta = Differ::new(&schema).diff("vm1", &desired, &prior).unwrap();

        assert_eq!(delta.len(), 2);
        let size = delta.get(&FieldPath::field("size")).unwrap();
        assert_eq!(size.mutability, Mutability::ForcesReplacement);
        let tags_change = delta.get(&FieldPath::field("tags")).unwrap();
        assert_eq!(tags_change.mutability, Mutability::Mutable);
        assert_eq!(tags_change.new, Some(tags("prod")));
        assert!(delta.requires_replacement());
    }

    #[test]
    fn test_missing_required_field_is_an_error() {
        let schema = schema();
        let desired = block(vec![("name", Value::string("vm1"))]);
        let prior = block(vec![
            ("name", Value::string("vm1")),
            ("size", Value::string("Standard_A1")),
        ]);
        let err = Differ::new(&schema).diff("vm1", &desired, &prior).unwrap_err();
        assert!(matches!(
            err,
            PlanError::MissingRequiredField { ref resource, ref field } if resource == "vm1" && field == "size"
        ));
    }

    #[test]
    fn test_computed_and_unknown_fields_are_ignored() {
        let schema = schema();
        let desired = block(vec![("name", Value::string("vm1"))]);
        let prior = block(vec![
            ("name", Value::string("vm1")),
            ("id", Value::string("/vms/vm1")),
            ("zone", Value::string("1")),
            ("legacy", Value::bool(true)),
        ]);
        let delta = Differ::new(&schema).diff("vm1", &desired, &prior).unwrap();
        assert!(delta.is_empty(), "{delta}");
    }

    #[test]
    fn test_removed_optional_field() {
        let schema = schema();
        let desired = block(vec![("name", Value::string("vm1"))]);
        let prior = block(vec![("name", Value::string("vm1")), ("tags", tags("dev"))]);
        let delta = Differ::new(&schema).diff("vm1", &desired, &prior).unwrap();
        let change = delta.get(&FieldPath::field("tags")).unwrap();
        assert_eq!(change.old, Some(tags("dev")));
        assert_eq!(change.new, None);
    }

    #[test]
    fn test_empty_set_is_not_absent() {
        let schema = schema();
        let desired = block(vec![("nics", Value::set([]))]);
        let prior = Block::new();
        let delta = Differ::new(&schema).diff("vm1", &desired, &prior).unwrap();
        assert_eq!(
            delta.get(&FieldPath::field("nics")).unwrap().new,
            Some(Value::set([]))
        );
    }

    #[test]
    fn test_set_member_change_is_add_and_remove() {
        let schema = schema();
        let desired = block(vec![(
            "nics",
            Value::set([Value::string("a"), Value::string("c")]),
        )]);
        let prior = block(vec![(
            "nics",
            Value::set([Value::string("a"), Value::string("b")]),
        )]);
        let delta = Differ::new(&schema).diff("vm1", &desired, &prior).unwrap();

        assert_eq!(delta.len(), 2);
        let added = FieldPath::field("nics").member(Value::string("c").content_hash());
        let removed = FieldPath::field("nics").member(Value::string("b").content_hash());
        assert_eq!(delta.get(&added).unwrap().new, Some(Value::string("c")));
        assert_eq!(delta.get(&removed).unwrap().old, Some(Value::string("b")));
    }

    #[test]
    fn test_nested_block_inherits_replacement() {
        let schema = schema();
        let disk = |name: &str| Value::block([("name", Value::string(name))]);
        let desired = block(vec![("disk", disk("os2"))]);
        let prior = block(vec![("disk", disk("os1"))]);
        let delta = Differ::new(&schema).diff("vm1", &desired, &prior).unwrap();

        let change = delta.get(&FieldPath::field("disk").child("name")).unwrap();
        assert!(change.forces_replacement());
    }

    #[test]
    fn test_nested_remote_default_is_kept() {
        let schema = schema();
        let desired = block(vec![("disk", Value::block([("name", Value::string("os"))]))]);
        let prior = block(vec![(
            "disk",
            Value::block([
                ("name", Value::string("os")),
                ("caching", Value::string("ReadWrite")),
            ]),
        )]);
        let delta = Differ::new(&schema).diff("vm1", &desired, &prior).unwrap();
        assert!(delta.is_empty(), "{delta}");
    }

    #[test]
    fn test_data_disk_identity_ignores_computed_fields() {
        let schema = virtual_machine();
        let disk = |extra: Option<(&str, Value)>| {
            let mut fields = vec![
                ("name", Value::string("data0")),
                ("vhd_uri", Value::string("https://store/d0.vhd")),
                ("create_option", Value::string("Empty")),
                ("disk_size_gb", Value::int(100)),
                ("lun", Value::int(0)),
            ];
            fields.extend(extra);
            Value::block(fields)
        };
        let ValueKind::Set { element } = &schema.field("storage_data_disk").unwrap().kind else {
            panic!("storage_data_disk should be a set");
        };
        assert_eq!(
            member_identity(element, &disk(None)),
            member_identity(element, &disk(Some(("caching", Value::string("None")))))
        );
        assert_ne!(
            member_identity(element, &disk(None)),
            member_identity(element, &disk(Some(("lun", Value::int(1)))))
        );
    }

    #[test]
    fn test_reference_marks_change_deferred() {
        let schema = schema();
        let desired = block(vec![("nics", Value::set([Value::string("${nic1.id}")]))]);
        let delta = Differ::new(&schema).diff("vm1", &desired, &Block::new()).unwrap();
        assert!(delta.has_deferred());

        let ids = HashMap::from([(String::from("nic1"), String::from("/nics/1"))]);
        let resolved = delta.resolved(&ids);
        assert!(!resolved.has_deferred());
        assert_eq!(
            resolved.get(&FieldPath::field("nics")).unwrap().new,
            Some(Value::set([Value::string("/nics/1")]))
        );
    }

    #[test]
    fn test_delta_serializes_with_string_paths() {
        let schema = schema();
        let desired = block(vec![("tags", tags("prod"))]);
        let delta = Differ::new(&schema).diff("vm1", &desired, &Block::new()).unwrap();
        let json = serde_json::to_value(&delta).unwrap();
        assert_eq!(json["tags"]["mutability"], "mutable");
        assert!(json["tags"]["old"].is_null());
    }

    fn arb_name() -> impl Strategy<Value = String> {
        "[a-z]{1,6}"
    }

    proptest! {
        #[test]
        fn prop_reordered_set_has_empty_delta(members in prop::collection::vec(arb_name(), 0..8)) {
            let schema = schema();
            let forward = block(vec![("nics", Value::set(members.iter().map(Value::string)))]);
            let backward = block(vec![("nics", Value::set(members.iter().rev().map(Value::string)))]);
            let delta = Differ::new(&schema).diff("vm1", &forward, &backward).unwrap();
            prop_assert!(delta.is_empty());
        }

        #[test]
        fn prop_self_diff_is_empty(
            name in arb_name(),
            size in arb_name(),
            env in proptest::option::of(arb_name()),
            nics in prop::collection::vec(arb_name(), 0..4),
        ) {
            let schema = schema();
            let mut state = block(vec![
                ("name", Value::string(name)),
                ("size", Value::string(size)),
                ("nics", Value::set(nics.into_iter().map(Value::string))),
            ]);
            if let Some(env) = env {
                state.insert(String::from("tags"), tags(&env));
            }
            let delta = Differ::new(&schema).diff("vm1", &state, &state).unwrap();
            prop_assert!(delta.is_empty());
        }
    }
}
