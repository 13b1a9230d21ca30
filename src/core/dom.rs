use crate::core::storage::Storage;
use crate::dom::ElementSnapshot;
use crate::errors::Result;
use tokio::sync::broadcast;

/// Opaque handle to an element owned by a [`DomPort`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NodeId(pub usize);

/// Input events that count as user activity for the inactivity timer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ActivityKind {
    MouseDown,
    MouseMove,
    KeyPress,
}

/// Normalized browser events delivered by a [`DomPort`].
#[derive(Debug, Clone, PartialEq)]
pub enum DomEvent {
    /// Document scroll position as a percentage of the scrollable height.
    Scroll { percentage: f64 },
    Click { target: NodeId },
    MouseEnter { target: NodeId },
    MouseOut { target: NodeId },
    TouchStart { target: NodeId },
    /// The pointer left the document.
    MouseLeaveDocument { client_y: f64 },
    Activity(ActivityKind),
    /// Reported by an intersection observer registered through
    /// [`DomPort::observe_intersections`].
    Intersection {
        selector: String,
        target: NodeId,
        ratio: f64,
        is_intersecting: bool,
    },
    /// The document tree or an attribute changed.
    Mutation,
    Unload,
}

impl DomEvent {
    /// Whether the event resets the inactivity window.
    pub fn is_user_activity(&self) -> bool {
        matches!(
            self,
            DomEvent::Scroll { .. }
                | DomEvent::Click { .. }
                | DomEvent::TouchStart { .. }
                | DomEvent::Activity(_)
        )
    }
}

#[derive(Debug, Clone, Default)]
pub struct PageInfo {
    pub url: String,
    pub user_agent: String,
    pub viewport_width: u32,
    pub viewport_height: u32,
    pub referrer: Option<String>,
}

/// Rough measure of how expensive the page is to wait on.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PageWeight {
    pub scripts: usize,
    pub images: usize,
    pub elements: usize,
    pub pending_images: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NavigationTarget {
    SameTab,
    NewTab,
}

/// The page surface the engine reads and mutates.
///
/// Calls are synchronous, as DOM calls are inside a page. Asynchrony enters
/// only through the event stream returned by [`DomPort::subscribe`].
pub trait DomPort: Send + Sync + 'static {
    /// All elements matching a CSS selector, in document order.
    fn query_all(&self, selector: &str) -> Result<Vec<NodeId>>;

    fn matches(&self, node: NodeId, selector: &str) -> bool;

    /// The node itself or its nearest ancestor matching `selector`.
    fn closest(&self, node: NodeId, selector: &str) -> Option<NodeId>;

    fn parent(&self, node: NodeId) -> Option<NodeId>;

    fn contains(&self, ancestor: NodeId, node: NodeId) -> bool;

    fn snapshot(&self, node: NodeId) -> Option<ElementSnapshot>;

    fn inner_html(&self, node: NodeId) -> Option<String>;

    fn style(&self, node: NodeId, property: &str) -> Option<String>;

    fn set_text_content(&self, node: NodeId, text: &str);

    fn set_inner_html(&self, node: NodeId, html: &str);

    /// Sets the live `value` of a form control.
    fn set_value(&self, node: NodeId, value: &str);

    fn set_attribute(&self, node: NodeId, name: &str, value: &str);

    fn remove_attribute(&self, node: NodeId, name: &str);

    fn set_style(&self, node: NodeId, property: &str, value: &str);

    fn add_class(&self, node: NodeId, class: &str);

    fn remove_class(&self, node: NodeId, class: &str);

    fn create_element(&self, tag: &str) -> NodeId;

    fn append_to_body(&self, node: NodeId);

    fn remove(&self, node: NodeId);

    fn page_info(&self) -> PageInfo;

    fn page_weight(&self) -> PageWeight;

    fn navigate(&self, url: &str, target: NavigationTarget);

    /// Hide or reveal the whole page while the first pass runs.
    fn set_content_hidden(&self, hidden: bool);

    fn subscribe(&self) -> broadcast::Receiver<DomEvent>;

    /// Start reporting [`DomEvent::Intersection`] for elements matching `selector`.
    fn observe_intersections(&self, selector: &str);

    fn local_storage(&self) -> &dyn Storage;

    fn session_storage(&self) -> &dyn Storage;
}
