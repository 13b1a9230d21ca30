use crate::core::NodeId;
use std::collections::HashMap;

/// A point-in-time view of one element, as read through a `DomPort`.
#[derive(Debug, Clone)]
pub struct ElementSnapshot {
    pub id: NodeId,
    pub tag_name: String,
    pub element_id: Option<String>,
    pub class_name: Option<String>,
    pub text_content: String,
    pub attributes: HashMap<String, String>,
    pub is_visible: bool,
}

impl ElementSnapshot {
    pub fn new(id: NodeId, tag_name: impl Into<String>) -> Self {
        Self {
            id,
            tag_name: tag_name.into().to_lowercase(),
            element_id: None,
            class_name: None,
            text_content: String::new(),
            attributes: HashMap::new(),
            is_visible: true,
        }
    }

    pub fn with_text_content(mut self, text: String) -> Self {
        self.text_content = text;
        self
    }

    pub fn with_attribute(mut self, key: String, value: String) -> Self {
        match key.as_str() {
            "id" => self.element_id = Some(value.clone()),
            "class" => self.class_name = Some(value.clone()),
            _ => {}
        }
        self.attributes.insert(key, value);
        self
    }

    pub fn set_visible(mut self, visible: bool) -> Self {
        self.is_visible = visible;
        self
    }

    pub fn attribute(&self, name: &str) -> Option<&str> {
        self.attributes.get(name).map(String::as_str)
    }

    pub fn classes(&self) -> impl Iterator<Item = &str> {
        self.class_name.iter().flat_map(|c| c.split_whitespace())
    }

    pub fn trimmed_text(&self) -> &str {
        self.text_content.trim()
    }

    /// Buttons and submit-like inputs whose label is their text.
    pub fn is_button_like(&self) -> bool {
        match self.tag_name.as_str() {
            "button" => true,
            "input" => matches!(
                self.attribute("type").unwrap_or("text"),
                "submit" | "button" | "reset"
            ),
            _ => false,
        }
    }

    /// Inputs that carry free text in `value` and `placeholder`.
    pub fn is_text_input(&self) -> bool {
        match self.tag_name.as_str() {
            "textarea" => true,
            "input" => matches!(
                self.attribute("type").unwrap_or("text"),
                "text" | "email" | "search" | "tel" | "url" | "password" | "number"
            ),
            _ => false,
        }
    }
}
