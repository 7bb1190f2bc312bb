//! Resource schemas.
//!
//! This module describes what a resource's configuration may contain:
//! - Field shapes, presence flags and mutability classes
//! - The registry mapping resource types to schemas
//! - Validation of untyped configuration into typed values

mod builtin;
mod field;
mod resource;
mod validator;

pub use builtin::{virtual_machine, VIRTUAL_MACHINE};
pub use field::{FieldSpec, Mutability, Normalizer, ValueKind};
pub use resource::{ResourceSchema, SchemaRegistry};
pub use validator::SchemaValidator;
