// ============================================================================
// Strict linting - Dangerous or non-idiomatic practices are forbidden
// ============================================================================

#![deny(warnings)]                    // All warnings are treated as errors
#![deny(unsafe_code)]                 // Unsafe code is forbidden
#![deny(missing_docs)]                // All public items must be documented
#![deny(dead_code)]                   // Unused code is forbidden
#![deny(non_camel_case_types)]        // Types must follow CamelCase convention

// Additional strictness - Leave nothing unchecked
#![deny(unused_imports)]              // Unused imports are forbidden
#![deny(unused_variables)]            // Unused variables are forbidden
#![deny(unused_must_use)]             // Must handle Result and Option explicitly
#![deny(non_snake_case)]              // Variables and functions must be snake_case
#![deny(non_upper_case_globals)]      // Constants must be UPPER_CASE
#![deny(nonstandard_style)]           // Non-standard code style is forbidden
#![forbid(unsafe_op_in_unsafe_fn)]    // Unsafe ops in unsafe fns are forbidden

// Clippy lints (warnings only)
#![warn(clippy::all)]                 // All standard Clippy lints
#![warn(clippy::pedantic)]            // Very strict Clippy lints
#![warn(clippy::nursery)]             // Experimental lints
#![warn(clippy::unwrap_used)]         // unwrap() warning
#![warn(clippy::expect_used)]         // expect() warning
#![warn(clippy::panic)]               // panic!() warning
#![warn(clippy::print_stdout)]        // println!() warning
#![warn(clippy::todo)]                // TODO warning
#![warn(clippy::unimplemented)]       // unimplemented!() warning
#![warn(clippy::missing_const_for_fn)] // Force const when possible
#![warn(clippy::unwrap_in_result)]    // unwrap() in Result warning
#![warn(clippy::module_inception)]    // Module with same name as crate warning
#![warn(clippy::redundant_clone)]     // Useless clones warning
#![warn(clippy::shadow_unrelated)]    // Shadowing unrelated variables warning
#![warn(clippy::too_many_arguments)]  // Limit function arguments
#![warn(clippy::cognitive_complexity)] // Limit cognitive complexity

// Safety and robustness lints
#![deny(overflowing_literals)]        // Overflowing literals are forbidden
#![deny(arithmetic_overflow)]         // Arithmetic overflow is forbidden

// ============================================================================
// Crate Documentation
// ============================================================================

//! # Converge
//!
//! A desired-state reconciliation engine: typed resource values, field-level
//! diffs, dependency-ordered plans and a retrying, concurrent executor.
//!
//! ## Overview
//!
//! Converge compares what a configuration declares with what was last applied
//! and what the remote system reports, and drives the remote system to match:
//!
//! - Declare resources in a YAML file, checked against resource schemas
//! - Compute field-level deltas that know which changes force replacement
//! - Order operations by the references between resources
//! - Execute independent operations concurrently with bounded retries
//! - Persist confirmed state so interrupted runs recover safely
//!
//! ## Architecture
//!
//! The system is built around the concept of **desired state reconciliation**:
//!
//! 1. **Desired State**: Declared in `converge.yaml`
//! 2. **Prior State**: What the last successful run confirmed, kept in the state store
//! 3. **Observed State**: Read from the remote system through [`remote::RemoteOps`]
//! 4. **Reconciler**: Plans the difference and executes it
//!
//! ## Modules
//!
//! - [`value`]: Typed values, sets with content identity, resource references
//! - [`schema`]: Field specifications and resource schemas
//! - [`config`]: Configuration parsing and validation
//! - [`state`]: State store and persistence backends (local file, memory)
//! - [`planner`]: Diff computation and execution planning
//! - [`remote`]: The interface to the remote system
//! - [`reconciler`]: Refresh, apply and converge
//! - [`cli`]: Command-line interface
//!
//! ## Example
//!
//! ```yaml
//! settings:
//!   parallelism: 4
//!
//! resources:
//!   - name: web
//!     type: virtual_machine
//!     attributes:
//!       name: web-01
//!       location: West Europe
//!       resource_group_name: prod
//!       vm_size: Standard_D2s_v3
//!       network_interface_ids: ["/nics/web-01"]
//!       storage_os_disk:
//!         name: web-01-os
//!         vhd_uri: https://disks.example/web-01-os.vhd
//!         create_option: FromImage
//!       os_profile:
//!         admin_username: ops
//!         admin_password: change-me
//! ```

// ============================================================================
// Modules
// ============================================================================

pub mod cli;
pub mod config;
pub mod error;
pub mod planner;
pub mod reconciler;
pub mod remote;
pub mod schema;
pub mod state;
pub mod value;

// ============================================================================
// Re-exports
// ============================================================================

pub use cli::{Cli, Commands, OutputFormatter};
pub use config::{ConfigParser, ConfigValidator, LoadedConfig};
pub use error::{ConvergeError, Result};
pub use planner::{Delta, Differ, Operation, OperationKind, Plan, Planner};
pub use reconciler::{ApplyReport, CancelSignal, DriftReport, Reconciler, ReconcilerSettings};
pub use remote::{Created, RemoteOps, RemoteRequest, RequestToken};
pub use schema::{FieldSpec, Mutability, ResourceSchema, SchemaRegistry};
pub use state::{LocalBackend, MemoryBackend, PersistenceBackend, StateStore};
pub use value::{Block, Value};
