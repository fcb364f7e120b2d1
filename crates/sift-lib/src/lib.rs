//! Active-learning screening library
//!
//! This crate provides the core functionality for:
//! - Pluggable active-learning cycles (feature extraction, classifiers,
//!   queriers, balancers) resolved by name from a registry
//! - Durable per-project labeling state and ranking snapshots
//! - Stopping policies and the simulation driver
//! - The task manager that schedules training jobs onto worker processes
//! - Health checks and observability

pub mod cycle;
pub mod error;
pub mod health;
pub mod models;
pub mod observability;
pub mod project;
pub mod simulation;
pub mod state;
pub mod stopping;
pub mod taskmanager;
pub mod worker;

pub use cycle::{ActiveLearningCycle, ComponentRegistry, CycleDescriptor, NQuery};
pub use error::{Result, SiftError};
pub use health::{
    ComponentHealth, ComponentStatus, HealthRegistry, HealthResponse, ReadinessResponse,
};
pub use models::*;
pub use observability::{SiftMetrics, StructuredLogger};
pub use project::{Project, ProjectConfig};
pub use simulation::{PriorSettings, Simulation, SimulationReport};
pub use state::State;
pub use stopping::{StoppingPolicy, StoppingSpec};
pub use worker::{run_job, JobOutcome};
