//! References between resources.
//!
//! A string scalar of the exact form `${<resource>.id}` stands for the
//! external identifier of another resource. References create dependency
//! edges and are substituted once the target's identifier is known.

use std::collections::{BTreeSet, HashMap};

use super::model::{Block, Scalar, Value};

const PREFIX: &str = "${";
const SUFFIX: &str = ".id}";

/// Parses a reference expression, returning the target resource name.
#[must_use]
pub fn parse_reference(s: &str) -> Option<&str> {
    let target = s.strip_prefix(PREFIX)?.strip_suffix(SUFFIX)?;
    let valid = !target.is_empty()
        && target
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_');
    valid.then_some(target)
}

/// Builds the reference expression for a resource.
#[must_use]
pub fn reference_to(resource: &str) -> String {
    format!("{PREFIX}{resource}{SUFFIX}")
}

/// Collects every resource referenced anywhere inside a value.
#[must_use]
pub fn references_in(value: &Value) -> BTreeSet<String> {
    let mut found = BTreeSet::new();
    collect(value, &mut found);
    found
}

/// Collects every resource referenced anywhere inside a block.
#[must_use]
pub fn block_references(block: &Block) -> BTreeSet<String> {
    let mut found = BTreeSet::new();
    for value in block.values() {
        collect(value, &mut found);
    }
    found
}

fn collect(value: &Value, found: &mut BTreeSet<String>) {
    match value {
        Value::Scalar(Scalar::String(s)) => {
            if let Some(target) = parse_reference(s) {
                found.insert(target.to_string());
            }
        }
        Value::Scalar(_) => {}
        Value::List(items) => items.iter().for_each(|v| collect(v, found)),
        Value::Set(set) => set.iter().for_each(|v| collect(v, found)),
        Value::Block(block) => block.values().for_each(|v| collect(v, found)),
    }
}

/// Substitutes references whose target identifier is known.
///
/// References to resources missing from `identifiers` are left in place.
/// Sets are rebuilt, so member identities reflect the substituted content.
#[must_use]
pub fn resolve(value: &Value, identifiers: &HashMap<String, String>) -> Value {
    match value {
        Value::Scalar(Scalar::String(s)) => parse_reference(s)
            .and_then(|target| identifiers.get(target))
            .map_or_else(|| value.clone(), |id| Value::string(id.clone())),
        Value::Scalar(_) => value.clone(),
        Value::List(items) => Value::List(items.iter().map(|v| resolve(v, identifiers)).collect()),
        Value::Set(set) => Value::Set(set.iter().map(|v| resolve(v, identifiers)).collect()),
        Value::Block(block) => Value::Block(resolve_block(block, identifiers)),
    }
}

/// Substitutes references in every field of a block.
#[must_use]
pub fn resolve_block(block: &Block, identifiers: &HashMap<String, String>) -> Block {
    block
        .iter()
        .map(|(k, v)| (k.clone(), resolve(v, identifiers)))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_reference() {
        assert_eq!(parse_reference("${nic1.id}"), Some("nic1"));
        assert_eq!(parse_reference("${web-nic_2.id}"), Some("web-nic_2"));
        assert_eq!(parse_reference("nic1"), None);
        assert_eq!(parse_reference("${.id}"), None);
        assert_eq!(parse_reference("${a b.id}"), None);
        assert_eq!(parse_reference("prefix ${nic1.id}"), None);
        assert_eq!(reference_to("nic1"), "${nic1.id}");
    }

    #[test]
    fn test_references_in_nested_values() {
        let block = Block::from([
            (
                String::from("network_interface_ids"),
                Value::set([Value::string("${nic1.id}"), Value::string("${nic2.id}")]),
            ),
            (
                String::from("availability_set_id"),
                Value::string("${avset.id}"),
            ),
            (String::from("vm_size"), Value::string("Standard_A1")),
        ]);
        let refs: Vec<_> = block_references(&block).into_iter().collect();
        assert_eq!(refs, vec!["avset", "nic1", "nic2"]);
    }

    #[test]
    fn test_resolve_known_only() {
        let ids = HashMap::from([(String::from("nic1"), String::from("/nics/1"))]);
        let value = Value::set([Value::string("${nic1.id}"), Value::string("${nic2.id}")]);
        let resolved = resolve(&value, &ids);
        let set = resolved.as_set().unwrap();
        assert!(set.contains(&Value::string("/nics/1")));
        assert!(set.contains(&Value::string("${nic2.id}")));
        assert_eq!(references_in(&resolved).len(), 1);
    }
}
