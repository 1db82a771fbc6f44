//! Foundational types, traits, and the pipeline lifecycle state machine
//! shared by every glassflow crate: config, error taxonomy, data model,
//! schema mapping, and the `Runner` capability.
//!
//! ```
//! use glassflow_core::state_machine::validate_transition;
//! use glassflow_core::model::PipelineStatus;
//!
//! assert!(validate_transition(PipelineStatus::Created, PipelineStatus::Running).is_ok());
//! ```

pub mod config;
pub mod error;
pub mod model;
pub mod orchestrator;
pub mod runner;
pub mod schema;
pub mod state_machine;

pub use error::CoreError;
pub use model::{ComponentKind, ComponentState, ComponentStatus, Health, Pipeline, PipelineStatus, Record};
pub use orchestrator::{Orchestrator, PipelineFailure};
pub use runner::Runner;
pub use schema::SchemaMapper;

pub type Result<T> = std::result::Result<T, CoreError>;
