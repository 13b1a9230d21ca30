//! An in-memory [`DomPort`] backed by `scraper`.
//!
//! The document lives in an arena so it can be mutated; selector queries
//! render the arena back to HTML (tagging each element with its arena index)
//! and run the selector through `scraper`.

use crate::core::{
    DomEvent, DomPort, MemoryStorage, NavigationTarget, NodeId, PageInfo, PageWeight, Storage,
};
use crate::dom::ElementSnapshot;
use crate::errors::{EngineError, Result};
use scraper::{ElementRef, Html, Selector};
use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Mutex, MutexGuard};
use tokio::sync::broadcast;

const NODE_ATTR: &str = "data-vdom-node";

const VOID_ELEMENTS: &[&str] = &[
    "area", "base", "br", "col", "embed", "hr", "img", "input", "link", "meta", "source", "track",
    "wbr",
];

#[derive(Debug, Clone)]
enum Child {
    Element(usize),
    Text(String),
}

#[derive(Debug, Clone)]
struct VNode {
    tag: String,
    attrs: Vec<(String, String)>,
    children: Vec<Child>,
    parent: Option<usize>,
}

impl VNode {
    fn new(tag: &str) -> Self {
        Self {
            tag: tag.to_lowercase(),
            attrs: Vec::new(),
            children: Vec::new(),
            parent: None,
        }
    }

    fn attr(&self, name: &str) -> Option<&str> {
        self.attrs
            .iter()
            .find(|(k, _)| k == name)
            .map(|(_, v)| v.as_str())
    }

    fn set_attr(&mut self, name: &str, value: &str) {
        match self.attrs.iter_mut().find(|(k, _)| k == name) {
            Some(entry) => entry.1 = value.to_string(),
            None => self.attrs.push((name.to_string(), value.to_string())),
        }
    }

    fn remove_attr(&mut self, name: &str) {
        self.attrs.retain(|(k, _)| k != name);
    }

    fn is_hidden(&self) -> bool {
        if self.tag == "input" && self.attr("type") == Some("hidden") {
            return true;
        }

        if self.attr("hidden").is_some() {
            return true;
        }

        if let Some(style) = self.attr("style") {
            for (property, value) in parse_style(style) {
                let value = value.to_lowercase();
                if (property == "display" && value == "none")
                    || (property == "visibility" && value == "hidden")
                {
                    return true;
                }
            }
        }

        if let Some(class) = self.attr("class") {
            if class
                .split_whitespace()
                .any(|c| matches!(c, "hidden" | "invisible" | "d-none"))
            {
                return true;
            }
        }

        false
    }
}

#[derive(Debug)]
struct Tree {
    nodes: Vec<VNode>,
    body: usize,
}

impl Tree {
    fn empty() -> Self {
        Self {
            nodes: vec![VNode::new("body")],
            body: 0,
        }
    }

    fn push(&mut self, node: VNode) -> usize {
        self.nodes.push(node);
        self.nodes.len() - 1
    }

    fn get(&self, id: NodeId) -> Option<&VNode> {
        self.nodes.get(id.0)
    }

    fn get_mut(&mut self, id: NodeId) -> Option<&mut VNode> {
        self.nodes.get_mut(id.0)
    }

    fn import(&mut self, element: ElementRef<'_>, parent: Option<usize>) -> usize {
        let mut node = VNode::new(element.value().name());
        node.attrs = element
            .value()
            .attrs()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        node.parent = parent;
        let idx = self.push(node);
        self.import_children(element, idx);
        idx
    }

    fn import_children(&mut self, element: ElementRef<'_>, idx: usize) {
        for child in element.children() {
            match child.value() {
                scraper::Node::Element(_) => {
                    if let Some(child_ref) = ElementRef::wrap(child) {
                        let child_idx = self.import(child_ref, Some(idx));
                        self.nodes[idx].children.push(Child::Element(child_idx));
                    }
                }
                scraper::Node::Text(text) => {
                    let content: &str = text;
                    self.nodes[idx].children.push(Child::Text(content.to_string()));
                }
                _ => {}
            }
        }
    }

    fn is_attached(&self, idx: usize) -> bool {
        let mut current = idx;
        loop {
            if current == self.body {
                return true;
            }
            match self.nodes[current].parent {
                Some(parent) => current = parent,
                None => return false,
            }
        }
    }

    fn detach_children(&mut self, idx: usize) {
        let children = std::mem::take(&mut self.nodes[idx].children);
        for child in children {
            if let Child::Element(child_idx) = child {
                self.nodes[child_idx].parent = None;
            }
        }
    }

    fn text_content(&self, idx: usize) -> String {
        let mut out = String::new();
        self.collect_text(idx, &mut out);
        out
    }

    fn collect_text(&self, idx: usize, out: &mut String) {
        for child in &self.nodes[idx].children {
            match child {
                Child::Text(text) => out.push_str(text),
                Child::Element(child_idx) => self.collect_text(*child_idx, out),
            }
        }
    }

    fn is_visible(&self, idx: usize) -> bool {
        let mut current = Some(idx);
        while let Some(i) = current {
            if self.nodes[i].is_hidden() {
                return false;
            }
            current = self.nodes[i].parent;
        }
        true
    }

    fn render_document(&self) -> String {
        let mut out = String::from("<!DOCTYPE html><html><head></head>");
        self.render(self.body, true, &mut out);
        out.push_str("</html>");
        out
    }

    fn render(&self, idx: usize, tagged: bool, out: &mut String) {
        let node = &self.nodes[idx];
        out.push('<');
        out.push_str(&node.tag);
        for (k, v) in &node.attrs {
            out.push_str(&format!(" {}=\"{}\"", k, escape_attr(v)));
        }
        if tagged {
            out.push_str(&format!(" {}=\"{}\"", NODE_ATTR, idx));
        }
        out.push('>');
        if VOID_ELEMENTS.contains(&node.tag.as_str()) {
            return;
        }
        self.render_children(idx, tagged, out);
        out.push_str(&format!("</{}>", node.tag));
    }

    fn render_children(&self, idx: usize, tagged: bool, out: &mut String) {
        let raw_text = matches!(self.nodes[idx].tag.as_str(), "script" | "style");
        for child in &self.nodes[idx].children {
            match child {
                Child::Text(text) if raw_text => out.push_str(text),
                Child::Text(text) => out.push_str(&escape_text(text)),
                Child::Element(child_idx) => self.render(*child_idx, tagged, out),
            }
        }
    }

    fn query(&self, selector: &str) -> Result<Vec<usize>> {
        let parsed = Selector::parse(selector)
            .map_err(|e| EngineError::InvalidSelector(format!("{}: {:?}", selector, e)))?;
        let document = Html::parse_document(&self.render_document());
        Ok(document
            .select(&parsed)
            .filter_map(|el| el.value().attr(NODE_ATTR)?.parse().ok())
            .collect())
    }

    fn count(&self, tag: Option<&str>) -> usize {
        (0..self.nodes.len())
            .filter(|&i| self.is_attached(i))
            .filter(|&i| tag.map_or(true, |t| self.nodes[i].tag == t))
            .count()
    }
}

fn escape_text(s: &str) -> String {
    s.replace('&', "&amp;").replace('<', "&lt;").replace('>', "&gt;")
}

fn escape_attr(s: &str) -> String {
    s.replace('&', "&amp;").replace('"', "&quot;")
}

fn parse_style(style: &str) -> Vec<(String, String)> {
    style
        .split(';')
        .filter_map(|decl| {
            let (property, value) = decl.split_once(':')?;
            let property = property.trim().to_lowercase();
            if property.is_empty() {
                return None;
            }
            Some((property, value.trim().to_string()))
        })
        .collect()
}

fn serialize_style(declarations: &[(String, String)]) -> String {
    declarations
        .iter()
        .map(|(p, v)| format!("{}: {};", p, v))
        .collect::<Vec<_>>()
        .join(" ")
}

/// In-memory page used for headless evaluation and tests.
pub struct VirtualDom {
    tree: Mutex<Tree>,
    events: broadcast::Sender<DomEvent>,
    page: Mutex<PageInfo>,
    local: MemoryStorage,
    session: MemoryStorage,
    navigations: Mutex<Vec<(String, NavigationTarget)>>,
    observed: Mutex<Vec<String>>,
    content_hidden: AtomicBool,
    pending_images: AtomicUsize,
}

impl VirtualDom {
    pub fn new() -> Self {
        let (events, _) = broadcast::channel(256);
        Self {
            tree: Mutex::new(Tree::empty()),
            events,
            page: Mutex::new(PageInfo {
                url: "https://example.com/".to_string(),
                user_agent: "Mozilla/5.0 (Windows NT 10.0; Win64; x64)".to_string(),
                viewport_width: 1280,
                viewport_height: 720,
                referrer: None,
            }),
            local: MemoryStorage::new(),
            session: MemoryStorage::new(),
            navigations: Mutex::new(Vec::new()),
            observed: Mutex::new(Vec::new()),
            content_hidden: AtomicBool::new(false),
            pending_images: AtomicUsize::new(0),
        }
    }

    /// Parse a page; the `<body>` content becomes the live document.
    pub fn from_html(html: &str) -> Self {
        let dom = Self::new();
        dom.load_html(html);
        dom
    }

    pub fn with_url(self, url: &str) -> Self {
        lock(&self.page).url = url.to_string();
        self
    }

    pub fn with_user_agent(self, user_agent: &str, viewport_width: u32) -> Self {
        {
            let mut page = lock(&self.page);
            page.user_agent = user_agent.to_string();
            page.viewport_width = viewport_width;
        }
        self
    }

    pub fn load_html(&self, html: &str) {
        let document = Html::parse_document(html);
        let mut tree = Tree::empty();
        if let Ok(body_selector) = Selector::parse("body") {
            if let Some(body) = document.select(&body_selector).next() {
                tree.nodes[0].attrs = body
                    .value()
                    .attrs()
                    .map(|(k, v)| (k.to_string(), v.to_string()))
                    .collect();
                tree.import_children(body, 0);
            }
        }
        *lock(&self.tree) = tree;
        self.notify_mutation();
    }

    /// Inject a browser event as if the page had produced it.
    pub fn dispatch(&self, event: DomEvent) {
        let _ = self.events.send(event);
    }

    pub fn first(&self, selector: &str) -> Option<NodeId> {
        self.query_all(selector).ok()?.into_iter().next()
    }

    pub fn text(&self, node: NodeId) -> String {
        let tree = lock(&self.tree);
        match tree.get(node) {
            Some(_) => tree.text_content(node.0),
            None => String::new(),
        }
    }

    pub fn attribute(&self, node: NodeId, name: &str) -> Option<String> {
        lock(&self.tree)
            .get(node)
            .and_then(|n| n.attr(name).map(str::to_string))
    }

    pub fn has_class(&self, node: NodeId, class: &str) -> bool {
        self.attribute(node, "class")
            .map(|c| c.split_whitespace().any(|existing| existing == class))
            .unwrap_or(false)
    }

    pub fn is_visible(&self, node: NodeId) -> bool {
        let tree = lock(&self.tree);
        tree.get(node).is_some() && tree.is_attached(node.0) && tree.is_visible(node.0)
    }

    pub fn to_html(&self) -> String {
        let tree = lock(&self.tree);
        let mut out = String::new();
        tree.render_children(tree.body, false, &mut out);
        out
    }

    pub fn navigations(&self) -> Vec<(String, NavigationTarget)> {
        lock(&self.navigations).clone()
    }

    pub fn observed_selectors(&self) -> Vec<String> {
        lock(&self.observed).clone()
    }

    pub fn is_content_hidden(&self) -> bool {
        self.content_hidden.load(Ordering::SeqCst)
    }

    pub fn set_pending_images(&self, count: usize) {
        self.pending_images.store(count, Ordering::SeqCst);
    }

    fn notify_mutation(&self) {
        let _ = self.events.send(DomEvent::Mutation);
    }

    fn mutate<F: FnOnce(&mut Tree)>(&self, f: F) {
        {
            let mut tree = lock(&self.tree);
            f(&mut tree);
        }
        self.notify_mutation();
    }

    fn mutate_node<F: FnOnce(&mut VNode)>(&self, node: NodeId, f: F) {
        self.mutate(|tree| {
            if let Some(n) = tree.get_mut(node) {
                f(n);
            }
        });
    }
}

impl Default for VirtualDom {
    fn default() -> Self {
        Self::new()
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

impl DomPort for VirtualDom {
    fn query_all(&self, selector: &str) -> Result<Vec<NodeId>> {
        let tree = lock(&self.tree);
        Ok(tree.query(selector)?.into_iter().map(NodeId).collect())
    }

    fn matches(&self, node: NodeId, selector: &str) -> bool {
        let tree = lock(&self.tree);
        tree.query(selector)
            .map(|found| found.contains(&node.0))
            .unwrap_or(false)
    }

    fn closest(&self, node: NodeId, selector: &str) -> Option<NodeId> {
        let tree = lock(&self.tree);
        let found: HashSet<usize> = tree.query(selector).ok()?.into_iter().collect();
        let mut current = Some(node.0);
        while let Some(idx) = current {
            if found.contains(&idx) {
                return Some(NodeId(idx));
            }
            current = tree.nodes.get(idx).and_then(|n| n.parent);
        }
        None
    }

    fn parent(&self, node: NodeId) -> Option<NodeId> {
        let tree = lock(&self.tree);
        let parent = tree.get(node)?.parent?;
        Some(NodeId(parent))
    }

    fn contains(&self, ancestor: NodeId, node: NodeId) -> bool {
        let tree = lock(&self.tree);
        let mut current = Some(node.0);
        while let Some(idx) = current {
            if idx == ancestor.0 {
                return true;
            }
            current = tree.nodes.get(idx).and_then(|n| n.parent);
        }
        false
    }

    fn snapshot(&self, node: NodeId) -> Option<ElementSnapshot> {
        let tree = lock(&self.tree);
        let vnode = tree.get(node)?;
        let snapshot = vnode
            .attrs
            .iter()
            .fold(ElementSnapshot::new(node, vnode.tag.clone()), |el, (k, v)| {
                el.with_attribute(k.clone(), v.clone())
            })
            .with_text_content(tree.text_content(node.0))
            .set_visible(tree.is_attached(node.0) && tree.is_visible(node.0));
        Some(snapshot)
    }

    fn inner_html(&self, node: NodeId) -> Option<String> {
        let tree = lock(&self.tree);
        tree.get(node)?;
        let mut out = String::new();
        tree.render_children(node.0, false, &mut out);
        Some(out)
    }

    fn style(&self, node: NodeId, property: &str) -> Option<String> {
        let tree = lock(&self.tree);
        let style = tree.get(node)?.attr("style")?;
        parse_style(style)
            .into_iter()
            .find(|(p, _)| p == &property.to_lowercase())
            .map(|(_, v)| v)
    }

    fn set_text_content(&self, node: NodeId, text: &str) {
        self.mutate(|tree| {
            if tree.get(node).is_some() {
                tree.detach_children(node.0);
                tree.nodes[node.0].children.push(Child::Text(text.to_string()));
            }
        });
    }

    fn set_inner_html(&self, node: NodeId, html: &str) {
        self.mutate(|tree| {
            if tree.get(node).is_none() {
                return;
            }
            tree.detach_children(node.0);
            let fragment = Html::parse_fragment(html);
            tree.import_children(fragment.root_element(), node.0);
        });
    }

    fn set_value(&self, node: NodeId, value: &str) {
        self.mutate_node(node, |n| n.set_attr("value", value));
    }

    fn set_attribute(&self, node: NodeId, name: &str, value: &str) {
        self.mutate_node(node, |n| n.set_attr(name, value));
    }

    fn remove_attribute(&self, node: NodeId, name: &str) {
        self.mutate_node(node, |n| n.remove_attr(name));
    }

    fn set_style(&self, node: NodeId, property: &str, value: &str) {
        self.mutate_node(node, |n| {
            let property = property.trim().to_lowercase();
            let mut declarations = n.attr("style").map(parse_style).unwrap_or_default();
            // An empty value clears the declaration, as `element.style.x = ""` does.
            if value.trim().is_empty() {
                declarations.retain(|(p, _)| *p != property);
            } else {
                match declarations.iter_mut().find(|(p, _)| *p == property) {
                    Some(entry) => entry.1 = value.to_string(),
                    None => declarations.push((property, value.to_string())),
                }
            }
            n.set_attr("style", &serialize_style(&declarations));
        });
    }

    fn add_class(&self, node: NodeId, class: &str) {
        self.mutate_node(node, |n| {
            let mut classes: Vec<String> = n
                .attr("class")
                .unwrap_or("")
                .split_whitespace()
                .map(str::to_string)
                .collect();
            if !classes.iter().any(|c| c == class) {
                classes.push(class.to_string());
            }
            n.set_attr("class", &classes.join(" "));
        });
    }

    fn remove_class(&self, node: NodeId, class: &str) {
        self.mutate_node(node, |n| {
            let classes: Vec<&str> = n
                .attr("class")
                .unwrap_or("")
                .split_whitespace()
                .filter(|c| *c != class)
                .collect();
            let joined = classes.join(" ");
            n.set_attr("class", &joined);
        });
    }

    fn create_element(&self, tag: &str) -> NodeId {
        let mut tree = lock(&self.tree);
        NodeId(tree.push(VNode::new(tag)))
    }

    fn append_to_body(&self, node: NodeId) {
        self.mutate(|tree| {
            if tree.get(node).is_none() || tree.is_attached(node.0) {
                return;
            }
            let body = tree.body;
            tree.nodes[node.0].parent = Some(body);
            tree.nodes[body].children.push(Child::Element(node.0));
        });
    }

    fn remove(&self, node: NodeId) {
        self.mutate(|tree| {
            let Some(parent) = tree.get(node).and_then(|n| n.parent) else {
                return;
            };
            tree.nodes[parent]
                .children
                .retain(|c| !matches!(c, Child::Element(idx) if *idx == node.0));
            tree.nodes[node.0].parent = None;
        });
    }

    fn page_info(&self) -> PageInfo {
        lock(&self.page).clone()
    }

    fn page_weight(&self) -> PageWeight {
        let tree = lock(&self.tree);
        PageWeight {
            scripts: tree.count(Some("script")),
            images: tree.count(Some("img")),
            elements: tree.count(None),
            pending_images: self.pending_images.load(Ordering::SeqCst),
        }
    }

    fn navigate(&self, url: &str, target: NavigationTarget) {
        lock(&self.navigations).push((url.to_string(), target));
        if target == NavigationTarget::SameTab {
            lock(&self.page).url = url.to_string();
        }
    }

    fn set_content_hidden(&self, hidden: bool) {
        self.content_hidden.store(hidden, Ordering::SeqCst);
    }

    fn subscribe(&self) -> broadcast::Receiver<DomEvent> {
        self.events.subscribe()
    }

    fn observe_intersections(&self, selector: &str) {
        let mut observed = lock(&self.observed);
        if !observed.iter().any(|s| s == selector) {
            observed.push(selector.to_string());
        }
    }

    fn local_storage(&self) -> &dyn Storage {
        &self.local
    }

    fn session_storage(&self) -> &dyn Storage {
        &self.session
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const PAGE: &str = r#"
        <html><body>
          <div class="hero"><h1 id="title">Welcome <b>friend</b></h1></div>
          <p class="note" style="display: none">hidden <span class="inner">text</span></p>
          <img class="product" src="/a.png"><img class="product" src="/b.png">
        </body></html>
    "#;

    #[test]
    fn queries_in_document_order() {
        let dom = VirtualDom::from_html(PAGE);
        let images = dom.query_all("img.product").unwrap();
        assert_eq!(images.len(), 2);
        assert_eq!(dom.attribute(images[1], "src").as_deref(), Some("/b.png"));
        assert_eq!(dom.text(dom.first("#title").unwrap()), "Welcome friend");
    }

    #[test]
    fn invalid_selector_is_an_error() {
        let dom = VirtualDom::from_html(PAGE);
        assert!(matches!(
            dom.query_all("div[[["),
            Err(EngineError::InvalidSelector(_))
        ));
    }

    #[test]
    fn visibility_follows_ancestors() {
        let dom = VirtualDom::from_html(PAGE);
        let inner = dom.first(".inner").unwrap();
        assert!(!dom.is_visible(inner));
        assert!(dom.is_visible(dom.first("#title").unwrap()));
    }

    #[test]
    fn mutations_are_queryable_and_broadcast() {
        let dom = VirtualDom::from_html(PAGE);
        let mut events = dom.subscribe();
        let title = dom.first("#title").unwrap();

        dom.set_inner_html(title, "<em class=\"new\">Hi</em>");
        dom.add_class(title, "changed");
        dom.set_style(title, "color", "red");

        assert_eq!(dom.text(title), "Hi");
        assert!(dom.first("h1.changed em.new").is_some());
        assert_eq!(dom.style(title, "color").as_deref(), Some("red"));
        assert_eq!(events.try_recv().unwrap(), DomEvent::Mutation);
    }

    #[test]
    fn created_elements_join_the_document_when_appended() {
        let dom = VirtualDom::from_html(PAGE);
        let overlay = dom.create_element("div");
        dom.set_attribute(overlay, "id", "overlay");
        assert!(dom.first("#overlay").is_none());

        dom.append_to_body(overlay);
        assert_eq!(dom.first("#overlay"), Some(overlay));

        dom.remove(overlay);
        assert!(dom.first("#overlay").is_none());
    }

    #[test]
    fn closest_walks_ancestors() {
        let dom = VirtualDom::from_html(PAGE);
        let bold = dom.first("b").unwrap();
        let hero = dom.first(".hero").unwrap();
        assert_eq!(dom.closest(bold, ".hero"), Some(hero));
        assert!(dom.contains(hero, bold));
        assert_eq!(dom.closest(bold, ".missing"), None);
    }

    #[test]
    fn counts_page_weight() {
        let dom = VirtualDom::from_html(PAGE);
        let weight = dom.page_weight();
        assert_eq!(weight.images, 2);
        assert_eq!(weight.scripts, 0);
        assert!(weight.elements >= 7);
    }
}
