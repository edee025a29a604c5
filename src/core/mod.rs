//! Engine internals
//!
//! - [`archive`] - central-directory indexing and entry extraction
//! - [`cache`] - content cache for split code units
//! - [`units`] - code units and container splitting
//! - [`tasks`] - dependency-ordered task execution
//! - [`device`] - device boundary and install outcomes
//! - [`plan`] - unit diff and strategy selection
//! - [`orchestrator`] - deployment state machine
//! - [`redefine`] - live code redefinition
//! - [`config`] - configuration
//! - [`error`] - error types

pub mod archive;
pub mod cache;
pub mod config;
pub mod device;
pub mod error;
pub mod orchestrator;
pub mod plan;
pub mod redefine;
pub mod tasks;
pub mod units;
