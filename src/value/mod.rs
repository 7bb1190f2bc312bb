//! Value model.
//!
//! This module provides the typed representation every other component works
//! with:
//! - [`Value`] and its scalar, list, set and block forms
//! - [`ContentHash`], the stable content-derived identity of a value
//! - [`FieldPath`] for addressing nested fields and set members
//! - resource references (`${name.id}`) and their substitution

mod hash;
mod model;
mod path;
mod reference;

pub use hash::ContentHash;
pub use model::{Block, Number, Scalar, Value, ValueSet};
pub use path::{FieldPath, PathSegment};
pub use reference::{
    block_references, parse_reference, reference_to, references_in, resolve, resolve_block,
};
