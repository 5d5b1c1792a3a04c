// ============================================================================
// Strict linting - Dangerous or non-idiomatic practices are forbidden
// ============================================================================

#![deny(unsafe_code)]                 // Unsafe code is forbidden
#![deny(missing_docs)]                // All public items must be documented
#![deny(non_camel_case_types)]        // Types must follow CamelCase convention
#![warn(dead_code)]                   // Unused code is flagged
#![warn(unused_imports)]              // Unused imports are flagged
#![warn(unused_variables)]            // Unused variables are flagged
#![deny(unused_must_use)]             // Must handle Result and Option explicitly
#![deny(non_snake_case)]              // Variables and functions must be snake_case
#![deny(non_upper_case_globals)]      // Constants must be UPPER_CASE
#![deny(nonstandard_style)]           // Non-standard code style is forbidden

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
#![warn(clippy::unwrap_in_result)]    // unwrap() in Result warning
#![warn(clippy::redundant_clone)]     // Useless clones warning
#![warn(clippy::cognitive_complexity)] // Limit cognitive complexity
#![cfg_attr(test, allow(clippy::unwrap_used, clippy::expect_used, clippy::panic))]

// Safety and robustness lints
#![deny(overflowing_literals)]        // Overflowing literals are forbidden
#![deny(arithmetic_overflow)]         // Arithmetic overflow is forbidden

// ============================================================================
// Crate Documentation
// ============================================================================

//! # Stratum
//!
//! A declarative provisioning engine: describe resources and their
//! relationships, and Stratum computes the ordered set of create, update,
//! replace and delete actions that brings a remote control plane in line
//! with the description, executes them concurrently where dependencies
//! allow, and records what was applied.
//!
//! ## Architecture
//!
//! 1. **Desired graph**: resources declared in `stratum.stack.yaml`, with
//!    dependencies inferred from `${resource.attribute}` references
//! 2. **Applied state**: what the last apply cycle produced, persisted
//!    locally or in S3 behind a lease-based lock
//! 3. **Planner**: diffs the two and orders the actions
//! 4. **Executor**: runs the plan against a [`provider::Provider`]
//!
//! ## Modules
//!
//! - [`config`]: Stack parsing, validation and hashing
//! - [`graph`]: Resource graph and reference resolution
//! - [`planner`]: Diff, plan and execution
//! - [`provider`]: Control-plane abstraction (HTTP, in-memory)
//! - [`state`]: Applied state, locking and lifecycles
//! - [`engine`]: Plan/apply/destroy cycles
//! - [`cli`]: Command-line interface
//!
//! ## Example
//!
//! ```yaml
//! stack:
//!   name: image-analysis
//!   environment: dev
//!
//! resources:
//!   - name: role
//!     type: iam.role
//!     properties:
//!       assumed_by: lambda.amazonaws.com
//!   - name: analyzer
//!     type: compute.function
//!     properties:
//!       runtime: nodejs18.x
//!       role: ${role.arn}
//! ```

// ============================================================================
// Modules
// ============================================================================

pub mod cli;
pub mod config;
pub mod engine;
pub mod error;
pub mod graph;
pub mod planner;
pub mod provider;
pub mod state;

// ============================================================================
// Re-exports
// ============================================================================

pub use cli::{Cli, Commands, OutputFormatter};
pub use config::{ConfigHasher, ConfigParser, ConfigValidator, StackConfig};
pub use engine::{ApplyOutcome, ApplyStatus, DriftReport, Engine, PlanOutcome};
pub use error::{Result, StratumError};
pub use graph::{Resource, ResourceGraph};
pub use planner::{DiffEngine, ExecutionReport, Plan, PlanExecutor};
pub use provider::{HttpProvider, MemoryProvider, Provider};
pub use state::{AppliedState, LocalStateStore, S3StateStore, StateStore};
