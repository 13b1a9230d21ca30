pub mod element;
pub mod selector;
pub mod virtual_dom;

pub use element::ElementSnapshot;
pub use selector::{css_escape, generate_selector};
pub use virtual_dom::VirtualDom;
