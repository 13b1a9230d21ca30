/// A normalized page event, the single input shape of trigger evaluation.
#[derive(Debug, Clone, PartialEq)]
pub enum PageEvent {
    /// Synthetic event dispatched once after workflows load.
    PageLoad,
    Scroll {
        percentage: f64,
    },
    TimeOnPage {
        seconds: f64,
    },
    Click {
        /// Selector generated for the clicked element.
        selector: String,
        /// Configured click selector the element (or an ancestor) matched.
        matched_selector: Option<String>,
    },
    ElementVisible {
        selector: String,
        visibility_percentage: f64,
    },
    Hover {
        selector: String,
    },
    Inactivity {
        idle_seconds: f64,
    },
    ExitIntent {
        mouse_y: f64,
    },
}

impl PageEvent {
    pub fn event_type(&self) -> &'static str {
        match self {
            PageEvent::PageLoad => "page_load",
            PageEvent::Scroll { .. } => "scroll",
            PageEvent::TimeOnPage { .. } => "time_on_page",
            PageEvent::Click { .. } => "click",
            PageEvent::ElementVisible { .. } => "element_visible",
            PageEvent::Hover { .. } => "hover",
            PageEvent::Inactivity { .. } => "inactivity",
            PageEvent::ExitIntent { .. } => "exit_intent",
        }
    }
}
