pub mod base;
pub mod executor;

pub use base::{ActionOutcome, Rejection};
pub use executor::{execution_key, overlay_element_id, ActionExecutor, OVERLAY_CLASS, OVERLAY_CLOSE_CLASS};
