use crate::core::{DomPort, NodeId};
use crate::dom::ElementSnapshot;
use crate::types::{DisambiguationContext, ElementTarget, SelectorStrategy};
use tracing::{debug, warn};

/// Turns a ranked selector list into one live element.
pub struct ElementResolver<'a, D: DomPort + ?Sized> {
    dom: &'a D,
}

impl<'a, D: DomPort + ?Sized> ElementResolver<'a, D> {
    pub fn new(dom: &'a D) -> Self {
        Self { dom }
    }

    pub fn resolve_target(&self, target: &ElementTarget, text_action: bool) -> Option<NodeId> {
        self.resolve(&target.strategies(), &target.disambiguation, text_action)
    }

    /// Try each strategy in order; a unique match wins outright, several
    /// matches go through disambiguation.
    pub fn resolve(
        &self,
        strategies: &[SelectorStrategy],
        context: &DisambiguationContext,
        text_action: bool,
    ) -> Option<NodeId> {
        for strategy in strategies {
            let matches = match self.dom.query_all(&strategy.selector) {
                Ok(matches) => matches,
                Err(e) => {
                    warn!(selector = %strategy.selector, "Skipping strategy: {}", e);
                    continue;
                }
            };

            match matches.len() {
                0 => continue,
                1 => return Some(matches[0]),
                n => {
                    debug!(selector = %strategy.selector, matches = n, "Disambiguating");
                    if let Some(node) = self.disambiguate(&matches, context, text_action) {
                        return Some(node);
                    }
                }
            }
        }
        None
    }

    fn disambiguate(
        &self,
        matches: &[NodeId],
        context: &DisambiguationContext,
        text_action: bool,
    ) -> Option<NodeId> {
        let elements: Vec<ElementSnapshot> = matches
            .iter()
            .filter_map(|node| self.dom.snapshot(*node))
            .collect();

        if text_action {
            if let Some(original) = non_empty(&context.original_text) {
                if let Some(el) = elements.iter().find(|el| el.text_content.contains(original)) {
                    return Some(el.id);
                }
            }
        }

        if let Some(expected) = non_empty(&context.text_content) {
            let expected = expected.trim();
            if let Some(el) = elements.iter().find(|el| el.trimmed_text() == expected) {
                return Some(el.id);
            }
        }

        if let Some(index) = context.position_index {
            if let Some(node) = matches.get(index) {
                return Some(*node);
            }
        }

        if let Some(attributes) = context.attributes.as_ref().filter(|a| !a.is_empty()) {
            let found = elements.iter().find(|el| {
                attributes
                    .iter()
                    .all(|(name, value)| el.attribute(name) == Some(value.as_str()))
            });
            if let Some(el) = found {
                return Some(el.id);
            }
        }

        if let Some(parent_selector) = non_empty(&context.parent_selector) {
            if let Ok(parents) = self.dom.query_all(parent_selector) {
                let found = matches
                    .iter()
                    .find(|node| parents.iter().any(|p| *p != **node && self.dom.contains(*p, **node)));
                if let Some(node) = found {
                    return Some(*node);
                }
            }
        }

        if !text_action {
            return matches.first().copied();
        }

        let visible: Vec<&ElementSnapshot> = elements.iter().filter(|el| el.is_visible).collect();
        match visible.as_slice() {
            [only] => Some(only.id),
            [] => matches.first().copied(),
            many => many
                .iter()
                .enumerate()
                .max_by_key(|(i, el)| (el.trimmed_text().chars().count(), std::cmp::Reverse(*i)))
                .map(|(_, el)| el.id),
        }
    }
}

fn non_empty(value: &Option<String>) -> Option<&str> {
    value.as_deref().filter(|v| !v.is_empty())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dom::VirtualDom;
    use std::collections::HashMap;

    const CARDS: &str = r#"
        <section id="featured">
          <div class="card"><h2 class="title">Basic plan</h2><a class="cta" data-plan="basic">Buy</a></div>
        </section>
        <section id="others">
          <div class="card"><h2 class="title">Pro plan for teams</h2><a class="cta" data-plan="pro">Buy</a></div>
          <div class="card" style="display: none"><h2 class="title">Legacy plan, a much longer title</h2><a class="cta" data-plan="legacy">Buy</a></div>
        </section>
        <h1 id="headline">Welcome</h1>
    "#;

    fn strategies(selectors: &[&str]) -> Vec<SelectorStrategy> {
        selectors.iter().map(|s| SelectorStrategy::from_selector(*s)).collect()
    }

    #[test]
    fn unique_first_strategy_wins() {
        let dom = VirtualDom::from_html(CARDS);
        let resolver = ElementResolver::new(&dom);
        let found = resolver.resolve(
            &strategies(&["#headline", ".title"]),
            &DisambiguationContext {
                original_text: Some("Pro".to_string()),
                ..Default::default()
            },
            true,
        );
        assert_eq!(found, dom.first("#headline"));
    }

    #[test]
    fn falls_through_empty_and_invalid_strategies() {
        let dom = VirtualDom::from_html(CARDS);
        let resolver = ElementResolver::new(&dom);
        let found = resolver.resolve(
            &strategies(&["div[[[", "#missing", "#headline"]),
            &DisambiguationContext::default(),
            false,
        );
        assert_eq!(found, dom.first("#headline"));
    }

    #[test]
    fn original_text_beats_document_order_for_text_actions() {
        let dom = VirtualDom::from_html(CARDS);
        let resolver = ElementResolver::new(&dom);
        let context = DisambiguationContext {
            original_text: Some("Pro plan".to_string()),
            position_index: Some(0),
            ..Default::default()
        };
        let titles = dom.query_all(".title").unwrap();

        assert_eq!(resolver.resolve(&strategies(&[".title"]), &context, true), Some(titles[1]));
        // Only text actions use the original text hint.
        assert_eq!(resolver.resolve(&strategies(&[".title"]), &context, false), Some(titles[0]));
    }

    #[test]
    fn exact_text_then_position() {
        let dom = VirtualDom::from_html(CARDS);
        let resolver = ElementResolver::new(&dom);
        let titles = dom.query_all(".title").unwrap();

        let by_text = DisambiguationContext {
            text_content: Some("  Basic plan ".to_string()),
            position_index: Some(2),
            ..Default::default()
        };
        assert_eq!(resolver.resolve(&strategies(&[".title"]), &by_text, false), Some(titles[0]));

        let by_position = DisambiguationContext {
            position_index: Some(2),
            ..Default::default()
        };
        assert_eq!(resolver.resolve(&strategies(&[".title"]), &by_position, false), Some(titles[2]));
    }

    #[test]
    fn attributes_then_parent() {
        let dom = VirtualDom::from_html(CARDS);
        let resolver = ElementResolver::new(&dom);
        let ctas = dom.query_all(".cta").unwrap();

        let by_attributes = DisambiguationContext {
            attributes: Some(HashMap::from([("data-plan".to_string(), "pro".to_string())])),
            ..Default::default()
        };
        assert_eq!(resolver.resolve(&strategies(&[".cta"]), &by_attributes, false), Some(ctas[1]));

        let by_parent = DisambiguationContext {
            parent_selector: Some("#others".to_string()),
            ..Default::default()
        };
        assert_eq!(resolver.resolve(&strategies(&[".cta"]), &by_parent, false), Some(ctas[1]));
    }

    #[test]
    fn text_actions_without_hints_prefer_visible_longest_text() {
        let dom = VirtualDom::from_html(CARDS);
        let resolver = ElementResolver::new(&dom);
        let titles = dom.query_all(".title").unwrap();

        // The legacy title is longest but hidden.
        let found = resolver.resolve(&strategies(&[".title"]), &DisambiguationContext::default(), true);
        assert_eq!(found, Some(titles[1]));
    }

    #[test]
    fn single_visible_match_is_chosen() {
        let dom = VirtualDom::from_html(
            r#"<p class="msg" hidden>Old</p><p class="msg">Current</p><p class="msg d-none">Other</p>"#,
        );
        let resolver = ElementResolver::new(&dom);
        let found = resolver.resolve(&strategies(&[".msg"]), &DisambiguationContext::default(), true);
        assert_eq!(found, dom.query_all(".msg").unwrap().get(1).copied());
    }
}
