pub mod config;
pub mod dom;
pub mod storage;

pub use config::EngineConfig;
pub use dom::{ActivityKind, DomEvent, DomPort, NavigationTarget, NodeId, PageInfo, PageWeight};
pub use storage::{MemoryStorage, Storage};
