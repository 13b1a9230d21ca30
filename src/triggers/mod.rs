pub mod evaluator;
pub mod event;

pub use evaluator::TriggerEvaluator;
pub use event::PageEvent;
