//! Agent runtime — base agent lifecycle, dispatch, and circuit breaking.

pub mod agent;
pub mod circuit;

pub use agent::{
    Agent, AgentConfig, BaseAgent, EventContext, TaskContext, TaskOutcome,
};
pub use circuit::{CircuitBreaker, CircuitBreakerConfig, CircuitState};
