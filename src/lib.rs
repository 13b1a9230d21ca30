pub mod actions;
pub mod core;
pub mod dom;
pub mod engine;
pub mod errors;
pub mod guard;
pub mod hub;
pub mod logging;
pub mod resolver;
pub mod services;
pub mod state;
pub mod testing;
pub mod triggers;
pub mod types;
pub mod wait;

pub use actions::{ActionExecutor, ActionOutcome, Rejection};
pub use crate::core::{DomEvent, DomPort, EngineConfig, NodeId, Storage};
pub use dom::VirtualDom;
pub use engine::{EngineServices, WorkflowEngine};
pub use errors::{EngineError, Result};
pub use resolver::ElementResolver;
pub use triggers::{PageEvent, TriggerEvaluator};
pub use types::*;
