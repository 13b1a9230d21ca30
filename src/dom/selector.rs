use crate::dom::ElementSnapshot;

/// Classes the engine itself adds; they never identify an element.
const ENGINE_CLASS_PREFIX: &str = "pageflow-";

/// Build a CSS selector for an element, preferring the most stable
/// identifying attribute.
pub fn generate_selector(element: &ElementSnapshot) -> String {
    let tag_name = element.tag_name.as_str();

    if let Some(id) = element.element_id.as_deref().filter(|id| !id.is_empty()) {
        return format!("#{}", css_escape(id));
    }

    for attr in ["data-testid", "data-test", "data-cy"] {
        if let Some(value) = element.attribute(attr) {
            return format!("{}[{}='{}']", tag_name, attr, quote_escape(value));
        }
    }

    let classes: Vec<String> = element
        .classes()
        .filter(|c| !c.starts_with(ENGINE_CLASS_PREFIX))
        .map(css_escape)
        .collect();
    if !classes.is_empty() {
        return format!("{}.{}", tag_name, classes.join("."));
    }

    if let Some(name) = element.attribute("name") {
        format!("{}[name='{}']", tag_name, quote_escape(name))
    } else if let Some(role) = element.attribute("role") {
        format!("{}[role='{}']", tag_name, quote_escape(role))
    } else if let Some(aria_label) = element.attribute("aria-label") {
        format!("{}[aria-label='{}']", tag_name, quote_escape(aria_label))
    } else {
        tag_name.to_string()
    }
}

/// Escape an identifier for use after `#` or `.` in a selector.
pub fn css_escape(s: &str) -> String {
    s.chars()
        .map(|c| match c {
            ' ' | '.' | '#' | ':' | '[' | ']' | '(' | ')' | '\'' | '"' | '/' | ',' | '>' | '+'
            | '~' | '*' => format!("\\{}", c),
            _ => c.to_string(),
        })
        .collect()
}

fn quote_escape(s: &str) -> String {
    s.replace('\\', "\\\\").replace('\'', "\\'")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::NodeId;

    fn element(tag: &str, attrs: &[(&str, &str)]) -> ElementSnapshot {
        attrs.iter().fold(ElementSnapshot::new(NodeId(1), tag), |el, (k, v)| {
            el.with_attribute(k.to_string(), v.to_string())
        })
    }

    #[test]
    fn prefers_id() {
        let el = element("button", &[("id", "buy.now"), ("class", "btn")]);
        assert_eq!(generate_selector(&el), "#buy\\.now");
    }

    #[test]
    fn uses_test_ids_before_classes() {
        let el = element("a", &[("data-testid", "cta"), ("class", "btn primary")]);
        assert_eq!(generate_selector(&el), "a[data-testid='cta']");
    }

    #[test]
    fn skips_engine_classes() {
        let el = element("div", &[("class", "banner pageflow-hidden")]);
        assert_eq!(generate_selector(&el), "div.banner");
    }

    #[test]
    fn falls_back_to_tag() {
        assert_eq!(generate_selector(&element("section", &[])), "section");
    }
}
