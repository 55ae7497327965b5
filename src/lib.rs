// ============================================================================
// Strict linting - Dangerous or non-idiomatic practices are flagged
// ============================================================================

#![deny(unsafe_code)]                 // Unsafe code is forbidden
#![warn(missing_docs)]                // All public items should be documented
#![warn(dead_code)]                   // Unused code is flagged
#![deny(non_camel_case_types)]        // Types must follow CamelCase convention

// Additional strictness
#![warn(unused_imports)]              // Unused imports are flagged
#![warn(unused_variables)]            // Unused variables are flagged
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

//! # Cirrus
//!
//! A declarative, dependency-ordered resource reconciliation engine with
//! pluggable providers.
//!
//! ## Overview
//!
//! Cirrus reads a desired set of resources, works out the order they
//! depend on each other in, compares them with what was last applied and
//! converges the two:
//!
//! - Declare resources in `cirrus.stack.yaml`, wiring them together with
//!   `${resource.output}` references
//! - Preview every create, update and delete before it happens
//! - Apply independent changes in parallel, dependencies first
//! - Record what was applied, locally or in S3, behind a lock
//! - Detect drift between the recorded state and the providers
//!
//! ## Architecture
//!
//! 1. **Declaration**: resources with properties and dependencies ([`model`])
//! 2. **Graph**: the dependency DAG, cycle checked ([`graph`])
//! 3. **Plan**: per-resource create/update/delete/no-op ([`planner`])
//! 4. **Execution**: concurrent, dependency-ordered provider calls with a
//!    write-ahead journal in [`state`]
//!
//! ## Modules
//!
//! - [`config`]: Stack file parsing, settings and validation
//! - [`model`]: Resources, values and output references
//! - [`graph`]: Dependency graph construction
//! - [`planner`]: Diffing, planning and plan execution
//! - [`provider`]: Provider plugin trait and built-in plugins
//! - [`state`]: State storage backends (local, S3)
//! - [`reconciler`]: Plan, apply, destroy and drift entry points
//! - [`cli`]: Command-line interface
//!
//! ## Example
//!
//! ```yaml
//! project:
//!   name: my-platform
//!   environment: prod
//!
//! resources:
//!   - type: azure:core/ResourceGroup
//!     name: rg
//!     properties:
//!       location: eastus
//!   - type: azure:containerservice/Registry
//!     name: acr
//!     properties:
//!       resource_group_name: ${rg.name}
//!
//! outputs:
//!   registry_id: acr.id
//! ```

// ============================================================================
// Modules
// ============================================================================

pub mod cli;
pub mod config;
pub mod error;
pub mod graph;
pub mod model;
pub mod planner;
pub mod provider;
pub mod reconciler;
pub mod state;

// ============================================================================
// Re-exports
// ============================================================================

pub use cli::{Cli, Commands, OutputFormatter};
pub use config::{ConfigHasher, ConfigParser, ConfigValidator, Settings, StackConfig};
pub use error::{CirrusError, Result};
pub use graph::{DependencyGraph, GraphBuilder};
pub use model::{Declaration, OutputReference, ResourceNode, ResourceRef, Value};
pub use planner::{Plan, PlanExecutor, Planner, RunReport};
pub use provider::{Provider, ProviderRegistry, SimulatedProvider};
pub use reconciler::{DriftReport, ExportReport, Reconciler};
pub use state::{LocalStateStore, S3StateStore, StateSnapshot, StateStore};
