//! Troupe Kernel — data model and service contracts for the agent execution
//! core.
//!
//! An *agent* is a supervised, long-lived worker that plans and executes a
//! directed acyclic graph of *steps* toward a mission goal. This crate defines
//! the step and plan data model, the agent lifecycle state machine, the error
//! taxonomy with its failure classifier, and the trait contracts of the
//! external collaborators (capability execution, reasoning, persistence,
//! message bus, user gateway, registry, file store).
//!
//! Per the microkernel rule, trait definitions live here; concrete
//! implementations live in `troupe-runtime`. The kernel never depends on the
//! runtime.

pub mod agent;
pub mod config;
pub mod error;
pub mod event;
pub mod message;
pub mod plan;
pub mod services;
pub mod step;

pub use agent::{AgentState, AgentStatistics, ConversationTurn, COORDINATOR_ROLE};
pub use config::AgentConfig;
pub use error::{ErrorClass, ErrorSignal, KernelError, KernelResult};
pub use plan::{PlanDescription, PlanTask, TaskInput, TaskRef};
pub use step::{
    Dependency, InputSource, OutputRecord, ResultType, Step, StepRef, StepStatus,
};
