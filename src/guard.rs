//! Modal-loop guard: recognises clicks on close/dismiss controls.
//!
//! Such clicks never reach click triggers, so a "show on click" workflow can
//! not be re-fired by the very button that dismisses what it showed.

use crate::core::{DomPort, NodeId};
use regex::Regex;
use std::sync::OnceLock;

/// Selectors that mark an element (or one of its close ancestors) as a dismiss control.
pub const CLOSE_SELECTORS: &[&str] = &[
    "[data-dismiss]",
    "[data-bs-dismiss]",
    ".close",
    ".close-button",
    ".close-btn",
    ".btn-close",
    ".modal-close",
    ".popup-close",
    ".overlay-close",
    ".pageflow-overlay-close",
];

/// Containers a close control dismisses.
pub const DISMISSABLE_CONTAINERS: &str =
    "[role='dialog'], [aria-modal='true'], .modal, .popup, .overlay, .pageflow-overlay";

const MAX_ANCESTOR_DEPTH: usize = 3;

fn close_word_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        Regex::new(r"(?i)^\s*(close|dismiss|no,? thanks|not now|maybe later|[×✕✖x])\s*$")
            .expect("close word pattern is valid")
    })
}

fn onclick_hide_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        Regex::new(
            r#"(?i)(display\s*=\s*['"]none['"]|\.hide\(|\.remove\(\)|classList\.(add|toggle)\(\s*['"](hidden|d-none)['"]|visibility\s*=\s*['"]hidden['"])"#,
        )
        .expect("onclick hide pattern is valid")
    })
}

/// Whether a clicked node is a close/dismiss control.
pub fn is_close_control<D: DomPort + ?Sized>(dom: &D, node: NodeId) -> bool {
    let selector_list = CLOSE_SELECTORS.join(", ");

    if let Some(element) = dom.snapshot(node) {
        if close_word_pattern().is_match(element.trimmed_text()) {
            return true;
        }
    }

    let mut current = Some(node);
    for _ in 0..=MAX_ANCESTOR_DEPTH {
        let Some(level) = current else {
            break;
        };

        if dom.matches(level, &selector_list) {
            return true;
        }

        if let Some(element) = dom.snapshot(level) {
            if element
                .attribute("aria-label")
                .is_some_and(|label| close_word_pattern().is_match(label))
            {
                return true;
            }
            if element
                .attribute("onclick")
                .is_some_and(|handler| onclick_hide_pattern().is_match(handler))
            {
                return true;
            }
        }

        current = dom.parent(level);
    }

    false
}

/// The modal/popup/overlay a close control belongs to, if any.
pub fn dismissed_container<D: DomPort + ?Sized>(dom: &D, node: NodeId) -> Option<NodeId> {
    dom.closest(node, DISMISSABLE_CONTAINERS)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dom::VirtualDom;

    const PAGE: &str = r#"
        <div class="modal" id="promo">
          <div class="header"><span><i class="icon">icon</i></span></div>
          <button class="modal-close">Dismiss offer</button>
          <button id="plain-x">×</button>
          <a id="later" aria-label="Close">later</a>
          <button id="js-close" onclick="document.getElementById('promo').style.display='none'">OK</button>
          <button id="buy">Buy now</button>
        </div>
        <div data-dismiss="modal"><span><b><i id="deep">deep</i></b></span></div>
        <div data-dismiss="modal"><span><b><i><u id="too-deep">too deep</u></i></b></span></div>
    "#;

    #[test]
    fn recognises_close_selectors() {
        let dom = VirtualDom::from_html(PAGE);
        let close = dom.first(".modal-close").unwrap();
        assert!(is_close_control(&dom, close));
    }

    #[test]
    fn recognises_close_words_and_labels() {
        let dom = VirtualDom::from_html(PAGE);
        assert!(is_close_control(&dom, dom.first("#plain-x").unwrap()));
        assert!(is_close_control(&dom, dom.first("#later").unwrap()));
    }

    #[test]
    fn recognises_hiding_onclick() {
        let dom = VirtualDom::from_html(PAGE);
        assert!(is_close_control(&dom, dom.first("#js-close").unwrap()));
    }

    #[test]
    fn ordinary_buttons_are_not_close_controls() {
        let dom = VirtualDom::from_html(PAGE);
        assert!(!is_close_control(&dom, dom.first("#buy").unwrap()));
    }

    #[test]
    fn ancestor_search_stops_after_three_levels() {
        let dom = VirtualDom::from_html(PAGE);
        assert!(is_close_control(&dom, dom.first("#deep").unwrap()));
        assert!(!is_close_control(&dom, dom.first("#too-deep").unwrap()));
    }

    #[test]
    fn finds_the_dismissed_container() {
        let dom = VirtualDom::from_html(PAGE);
        let close = dom.first(".modal-close").unwrap();
        assert_eq!(dismissed_container(&dom, close), dom.first("#promo"));
    }
}
