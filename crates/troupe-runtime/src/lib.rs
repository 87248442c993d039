//! Troupe Runtime — the agent execution core.
//!
//! Implements the contracts defined in `troupe-kernel`: the step scheduler
//! and run loop, input resolution, control-flow verb expansion, plan
//! assembly, reflective replanning, lifecycle management (pause / abort /
//! resume / checkpoint), role-based delegation, status publishing, and
//! cross-agent step resolution.

pub mod agent;
pub mod assembler;
pub mod bus;
pub mod control_flow;
pub mod delegation;
pub mod lifecycle;
pub mod persistence;
pub mod publisher;
pub mod reflection;
pub mod remote;
pub mod resolver;
pub mod scheduler;

pub use agent::{Agent, AgentServices};
pub use assembler::AssemblyContext;
pub use bus::LocalMessageBus;
pub use persistence::InMemoryPersistence;
pub use publisher::StatusPublisher;
pub use reflection::{ReflectionState, ReflectionVerdict};
pub use remote::CrossAgentResolver;
