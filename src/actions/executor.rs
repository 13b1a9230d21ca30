use crate::actions::{ActionOutcome, Rejection};
use crate::core::{DomPort, EngineConfig, NavigationTarget, NodeId};
use crate::dom::{css_escape, generate_selector};
use crate::errors::EngineError;
use crate::resolver::ElementResolver;
use crate::state::EngineState;
use crate::types::{
    ActionKind, ActionNode, Animation, ClassConfig, ElementTarget, ModifyCssConfig, OverlayConfig,
    OverlayPosition, RedirectConfig, ReplaceImageConfig, ReplaceTextConfig, ToggleConfig,
};
use crate::wait::wait_for_element;
use futures::future::join_all;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::sync::{Arc, Mutex, MutexGuard, OnceLock};
use std::time::Duration;
use tokio::time::{sleep, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use url::Url;

pub const OVERLAY_CLASS: &str = "pageflow-overlay";
pub const OVERLAY_CLOSE_CLASS: &str = "pageflow-overlay-close";
const LAST_REDIRECT_KEY: &str = "pageflow_last_redirect";
const FADE_DURATION: Duration = Duration::from_millis(300);

fn url_like_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        Regex::new(r"^(https?://|mailto:|tel:|/|\./|#|www\.)\S*$").expect("url pattern is valid")
    })
}

/// What a successfully applied action did.
enum Applied {
    Done(usize),
    Scheduled,
}

type Applying = std::result::Result<Applied, Rejection>;

#[derive(Debug, Serialize, Deserialize)]
struct RedirectMarker {
    url: String,
    at: i64,
}

/// The id the engine gives the overlay of an action node.
pub fn overlay_element_id(action_id: &str) -> String {
    format!("{}-{}", OVERLAY_CLASS, action_id)
}

/// Applies action nodes to the page, each at most once per page load.
pub struct ActionExecutor<D: DomPort> {
    dom: Arc<D>,
    state: Arc<Mutex<EngineState>>,
    config: Arc<EngineConfig>,
    cancel: CancellationToken,
}

impl<D: DomPort> Clone for ActionExecutor<D> {
    fn clone(&self) -> Self {
        Self {
            dom: self.dom.clone(),
            state: self.state.clone(),
            config: self.config.clone(),
            cancel: self.cancel.clone(),
        }
    }
}

impl<D: DomPort> ActionExecutor<D> {
    pub fn new(
        dom: Arc<D>,
        state: Arc<Mutex<EngineState>>,
        config: Arc<EngineConfig>,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            dom,
            state,
            config,
            cancel,
        }
    }

    /// Run the actions of one trigger firing. Text replacements run
    /// concurrently; the rest run in order with a short pause between them.
    /// Outcomes come back in the order the actions were given.
    pub async fn execute_all(&self, actions: &[&ActionNode]) -> Vec<ActionOutcome> {
        let (text, other): (Vec<_>, Vec<_>) = actions
            .iter()
            .copied()
            .enumerate()
            .partition(|(_, action)| action.kind.is_text_related());

        let mut outcomes: Vec<(usize, ActionOutcome)> = join_all(
            text.into_iter()
                .map(|(i, action)| async move { (i, self.execute(action).await) }),
        )
        .await;

        for (n, (i, action)) in other.into_iter().enumerate() {
            if n > 0 {
                sleep(self.config.timeouts.action_delay()).await;
            }
            outcomes.push((i, self.execute(action).await));
        }

        outcomes.sort_by_key(|(i, _)| *i);
        outcomes.into_iter().map(|(_, outcome)| outcome).collect()
    }

    pub async fn execute(&self, action: &ActionNode) -> ActionOutcome {
        let started = Instant::now();
        let key = execution_key(action);
        let name = action.kind.name();

        let applied = if self.state().is_executed(&key) {
            Err(Rejection::ActionAlreadyExecuted)
        } else {
            self.apply(action, &key).await
        };

        let outcome = match applied {
            Ok(Applied::Done(affected)) => {
                info!(action = %action.id, kind = name, affected, "Action executed");
                ActionOutcome::success(&action.id, name, affected)
            }
            Ok(Applied::Scheduled) => {
                info!(action = %action.id, kind = name, "Action scheduled");
                ActionOutcome::scheduled(&action.id, name)
            }
            Err(reason) => {
                debug!(action = %action.id, kind = name, %reason, "Action not applied");
                ActionOutcome::rejected(&action.id, name, reason)
            }
        };

        outcome.with_execution_time(started.elapsed().as_millis() as u64)
    }

    async fn apply(&self, action: &ActionNode, key: &str) -> Applying {
        match &action.kind {
            ActionKind::ReplaceText(config) => {
                let node = self.locate(&config.target, key, true).await?;
                self.claim(key)?;
                self.replace_text(node, config);
                Ok(Applied::Done(1))
            }
            ActionKind::ReplaceImage(config) => {
                let node = self.locate_image(config, key).await?;
                self.claim(key)?;
                self.replace_image(node, config);
                Ok(Applied::Done(1))
            }
            ActionKind::HideElement(config) => {
                let node = self.locate(&config.target, key, false).await?;
                self.claim(key)?;
                self.toggle(node, config, false).await
            }
            ActionKind::ShowElement(config) => {
                self.ensure_not_closed(&config.target.selector)?;
                let node = self.locate(&config.target, key, false).await?;
                if let Some(element) = self.dom.snapshot(node) {
                    self.ensure_not_closed(&generate_selector(&element))?;
                }
                self.claim(key)?;
                self.toggle(node, config, true).await
            }
            ActionKind::ModifyCss(config) => {
                let node = self.locate(&config.target, key, false).await?;
                self.claim(key)?;
                self.modify_css(node, config);
                Ok(Applied::Done(1))
            }
            ActionKind::AddClass(config) => {
                let node = self.locate(&config.target, key, false).await?;
                self.claim(key)?;
                self.change_classes(node, config, true);
                Ok(Applied::Done(1))
            }
            ActionKind::RemoveClass(config) => {
                let node = self.locate(&config.target, key, false).await?;
                self.claim(key)?;
                self.change_classes(node, config, false);
                Ok(Applied::Done(1))
            }
            ActionKind::DisplayOverlay(config) => {
                let element_id = overlay_element_id(&action.id);
                self.ensure_not_closed(&format!("#{}", css_escape(&element_id)))?;
                self.claim(key)?;
                self.display_overlay(&element_id, config);
                Ok(Applied::Done(1))
            }
            ActionKind::Redirect(config) => self.redirect(key, config),
        }
    }

    fn state(&self) -> MutexGuard<'_, EngineState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Marks the key executed; fails if a concurrent call got there first.
    fn claim(&self, key: &str) -> std::result::Result<(), Rejection> {
        if self.state().mark_executed(key) {
            Ok(())
        } else {
            Err(Rejection::ActionAlreadyExecuted)
        }
    }

    fn ensure_not_closed(&self, selector: &str) -> std::result::Result<(), Rejection> {
        if self.state().is_closed_by_user(selector) {
            Err(Rejection::ElementClosedByUser)
        } else {
            Ok(())
        }
    }

    async fn locate(
        &self,
        target: &ElementTarget,
        key: &str,
        text_action: bool,
    ) -> std::result::Result<NodeId, Rejection> {
        let resolver = ElementResolver::new(self.dom.as_ref());
        if let Some(node) = resolver.resolve_target(target, text_action) {
            return Ok(node);
        }
        if !self.any_selector_valid(target) {
            return Err(Rejection::ElementNotFound);
        }
        self.await_element(&target.selector, key, || resolver.resolve_target(target, text_action))
            .await
    }

    async fn locate_image(
        &self,
        config: &ReplaceImageConfig,
        key: &str,
    ) -> std::result::Result<NodeId, Rejection> {
        let find = || self.find_image(config);
        if let Some(node) = find() {
            return Ok(node);
        }
        if !self.any_selector_valid(&config.target) {
            return Err(Rejection::ElementNotFound);
        }
        self.await_element(&config.target.selector, key, find).await
    }

    /// With several candidates, the original image URL hint picks the one
    /// live image showing it. Without a usable hint the usual resolution applies.
    fn find_image(&self, config: &ReplaceImageConfig) -> Option<NodeId> {
        let hint = config.original_image_url.as_deref().filter(|h| !h.is_empty());
        let resolver = ElementResolver::new(self.dom.as_ref());

        for strategy in config.target.strategies().iter() {
            let Ok(matches) = self.dom.query_all(&strategy.selector) else {
                continue;
            };
            if matches.is_empty() {
                continue;
            }
            if let (Some(hint), true) = (hint, matches.len() > 1) {
                let hinted = matches.iter().copied().find(|node| {
                    self.dom
                        .snapshot(*node)
                        .is_some_and(|el| el.tag_name == "img" && el.attribute("src").is_some_and(|src| src.contains(hint)))
                });
                if hinted.is_some() {
                    return hinted;
                }
            }
            return resolver.resolve(
                std::slice::from_ref(strategy),
                &config.target.disambiguation,
                false,
            );
        }
        None
    }

    fn any_selector_valid(&self, target: &ElementTarget) -> bool {
        target
            .strategies()
            .iter()
            .any(|s| self.dom.query_all(&s.selector).is_ok())
    }

    async fn await_element<T, F>(
        &self,
        selector: &str,
        key: &str,
        find: F,
    ) -> std::result::Result<T, Rejection>
    where
        F: FnMut() -> Option<T>,
    {
        if !self.state().begin_await(selector, key) {
            return Err(Rejection::ElementWaitInProgress);
        }
        debug!(selector, "Waiting for element");
        let result = wait_for_element(self.dom.as_ref(), &self.config, &self.cancel, find).await;
        self.state().end_await(selector, key);

        result.map_err(|e| match e {
            EngineError::ShutDown => Rejection::Cancelled,
            e => {
                warn!(selector, "Element never appeared: {}", e);
                Rejection::ElementTimeout
            }
        })
    }

    fn replace_text(&self, node: NodeId, config: &ReplaceTextConfig) {
        let Some(element) = self.dom.snapshot(node) else {
            return;
        };
        let dom = self.dom.as_ref();

        match element.tag_name.as_str() {
            "button" => dom.set_text_content(node, &config.new_text),
            "input" if element.is_button_like() => {
                dom.set_value(node, &config.new_text);
            }
            _ if element.is_text_input() => {
                dom.set_value(node, &config.new_text);
                dom.set_attribute(node, "placeholder", &config.new_text);
            }
            "a" if url_like_pattern().is_match(config.new_text.trim()) => {
                dom.set_attribute(node, "href", config.new_text.trim());
            }
            _ => {
                let current = dom.inner_html(node).unwrap_or_default();
                let original = config
                    .original_text
                    .as_deref()
                    .filter(|o| !o.is_empty() && current.contains(*o));
                let html = match original {
                    Some(original) => current.replace(original, &config.new_text),
                    None => config.new_text.clone(),
                };
                dom.set_inner_html(node, &html);
            }
        }
    }

    fn replace_image(&self, node: NodeId, config: &ReplaceImageConfig) {
        let dom = self.dom.as_ref();
        let is_img = dom.snapshot(node).is_some_and(|el| el.tag_name == "img");

        if is_img {
            dom.set_attribute(node, "src", &config.new_image_url);
            dom.remove_attribute(node, "srcset");
            if let Some(alt) = &config.alt_text {
                dom.set_attribute(node, "alt", alt);
            }
        } else {
            dom.set_style(
                node,
                "background-image",
                &format!("url('{}')", config.new_image_url),
            );
            if dom.style(node, "background-size").is_none() {
                dom.set_style(node, "background-size", "cover");
            }
            if dom.style(node, "background-position").is_none() {
                dom.set_style(node, "background-position", "center");
            }
        }
    }

    async fn toggle(&self, node: NodeId, config: &ToggleConfig, show: bool) -> Applying {
        let fade = config.animation == Animation::Fade;

        if config.delay > 0.0 {
            let dom = self.dom.clone();
            let cancel = self.cancel.clone();
            let delay = Duration::from_millis(config.delay as u64);
            tokio::spawn(async move {
                tokio::select! {
                    _ = cancel.cancelled() => {}
                    _ = sleep(delay) => set_visibility(dom.as_ref(), node, show, fade).await,
                }
            });
            return Ok(Applied::Scheduled);
        }

        set_visibility(self.dom.as_ref(), node, show, fade).await;
        Ok(Applied::Done(1))
    }

    fn modify_css(&self, node: NodeId, config: &ModifyCssConfig) {
        self.dom
            .set_style(node, config.effective_property(), &config.value);
    }

    fn change_classes(&self, node: NodeId, config: &ClassConfig, add: bool) {
        for class in config.class_name.split_whitespace() {
            if add {
                self.dom.add_class(node, class);
            } else {
                self.dom.remove_class(node, class);
            }
        }
    }

    fn display_overlay(&self, element_id: &str, config: &OverlayConfig) {
        let dom = self.dom.as_ref();
        let overlay = dom.create_element("div");

        let placement = match config.position {
            OverlayPosition::Center => "top: 50%; transform: translateY(-50%);",
            OverlayPosition::Top => "top: 0;",
            OverlayPosition::Bottom => "bottom: 0;",
        };
        let style = format!(
            "position: fixed; left: 0; right: 0; {} z-index: 2147483647; padding: 16px 24px; \
             text-align: center; background: {}; color: {};",
            placement, config.background_color, config.text_color
        );

        dom.set_attribute(overlay, "id", element_id);
        dom.set_attribute(overlay, "class", OVERLAY_CLASS);
        dom.set_attribute(overlay, "role", "dialog");
        dom.set_attribute(overlay, "style", &style);

        let mut html = format!("<div class=\"{}-content\">{}</div>", OVERLAY_CLASS, config.content);
        if config.dismissible {
            html.push_str(&format!(
                "<button type=\"button\" class=\"{}\" aria-label=\"Close\">×</button>",
                OVERLAY_CLOSE_CLASS
            ));
        }
        dom.set_inner_html(overlay, &html);
        dom.append_to_body(overlay);

        if config.duration > 0.0 {
            let dom = self.dom.clone();
            let cancel = self.cancel.clone();
            let duration = Duration::from_millis(config.duration as u64);
            tokio::spawn(async move {
                tokio::select! {
                    _ = cancel.cancelled() => {}
                    _ = sleep(duration) => dom.remove(overlay),
                }
            });
        }
    }

    fn redirect(&self, key: &str, config: &RedirectConfig) -> Applying {
        let dom = self.dom.as_ref();
        let current = dom.page_info().url;

        let target = match Url::parse(&current) {
            Ok(base) => base.join(config.url.trim()),
            Err(_) => Url::parse(config.url.trim()),
        };
        let Ok(target) = target else {
            return Err(Rejection::InvalidUrl);
        };

        let current = Url::parse(&current)
            .map(|u| u.to_string())
            .unwrap_or(current);
        if target.as_str() == current {
            return Err(Rejection::SamePageRedirect);
        }

        let now = chrono::Utc::now().timestamp_millis();
        let window_ms = (self.config.dedup.redirect_window_secs * 1000) as i64;
        let recent = dom
            .session_storage()
            .get(LAST_REDIRECT_KEY)
            .and_then(|raw| serde_json::from_str::<RedirectMarker>(&raw).ok())
            .is_some_and(|marker| marker.url == target.as_str() && now - marker.at < window_ms);
        if recent {
            return Err(Rejection::RapidRedirect);
        }

        self.claim(key)?;

        let marker = RedirectMarker {
            url: target.to_string(),
            at: now,
        };
        if let Ok(raw) = serde_json::to_string(&marker) {
            dom.session_storage().set(LAST_REDIRECT_KEY, &raw);
        }

        let navigation = if config.new_tab {
            NavigationTarget::NewTab
        } else {
            NavigationTarget::SameTab
        };

        if config.delay > 0.0 {
            let dom = self.dom.clone();
            let cancel = self.cancel.clone();
            let delay = Duration::from_millis(config.delay as u64);
            let url = target.to_string();
            tokio::spawn(async move {
                tokio::select! {
                    _ = cancel.cancelled() => {}
                    _ = sleep(delay) => dom.navigate(&url, navigation),
                }
            });
            return Ok(Applied::Scheduled);
        }

        info!(url = %target, "Redirecting");
        dom.navigate(target.as_str(), navigation);
        Ok(Applied::Done(1))
    }
}

/// Idempotency key of an action node: its id, or kind and selector when it has none.
pub fn execution_key(action: &ActionNode) -> String {
    if !action.id.is_empty() {
        return action.id.clone();
    }
    let selector = match &action.kind {
        ActionKind::Redirect(config) => config.url.as_str(),
        kind => kind.target().map_or("", |t| t.selector.as_str()),
    };
    format!("{}:{}", action.kind.name(), selector)
}

async fn set_visibility<D: DomPort + ?Sized>(dom: &D, node: NodeId, show: bool, fade: bool) {
    if show {
        dom.remove_attribute(node, "hidden");
        dom.remove_class(node, "hidden");
        dom.remove_class(node, "d-none");
        if dom.style(node, "display").as_deref() == Some("none") {
            dom.set_style(node, "display", "");
        }
        if dom.style(node, "visibility").as_deref() == Some("hidden") {
            dom.set_style(node, "visibility", "");
        }
        if fade {
            dom.set_style(node, "opacity", "0");
            dom.set_style(node, "transition", "opacity 300ms ease");
            dom.set_style(node, "opacity", "1");
        }
    } else {
        if fade {
            dom.set_style(node, "transition", "opacity 300ms ease");
            dom.set_style(node, "opacity", "0");
            sleep(FADE_DURATION).await;
        }
        dom.set_style(node, "display", "none");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::config::RetryPolicy;
    use crate::dom::VirtualDom;
    use crate::types::{ClassConfig, ToggleConfig};
    use serde_json::json;

    fn executor(dom: Arc<VirtualDom>) -> ActionExecutor<VirtualDom> {
        let config = EngineConfig {
            retry: RetryPolicy {
                max_attempts: 1,
                base_timeout_ms: 500,
                backoff_multiplier: 1.5,
            },
            ..Default::default()
        };
        ActionExecutor::new(
            dom,
            Arc::new(Mutex::new(EngineState::new())),
            Arc::new(config),
            CancellationToken::new(),
        )
    }

    fn action(id: &str, kind: &str, config: serde_json::Value) -> ActionNode {
        ActionNode {
            id: id.to_string(),
            kind: ActionKind::from_parts(kind, config).unwrap(),
        }
    }

    #[tokio::test]
    async fn replace_text_is_tag_aware() {
        let dom = Arc::new(VirtualDom::from_html(
            r#"<button id="b">Buy</button><input id="q" type="search" placeholder="Search">
               <a id="l" href="/old">Old link</a><p id="p">Save <b>10%</b> today</p>"#,
        ));
        let exec = executor(dom.clone());

        exec.execute(&action("a1", "Replace Text", json!({ "selector": "#b", "newText": "Buy now" }))).await;
        exec.execute(&action("a2", "Replace Text", json!({ "selector": "#q", "newText": "Find deals" }))).await;
        exec.execute(&action("a3", "Replace Text", json!({ "selector": "#l", "newText": "https://shop.example.com/sale" }))).await;
        exec.execute(&action("a4", "Replace Text", json!({ "selector": "#p", "newText": "20%", "originalText": "10%" }))).await;

        assert_eq!(dom.text(dom.first("#b").unwrap()), "Buy now");
        let input = dom.first("#q").unwrap();
        assert_eq!(dom.attribute(input, "value").as_deref(), Some("Find deals"));
        assert_eq!(dom.attribute(input, "placeholder").as_deref(), Some("Find deals"));
        let link = dom.first("#l").unwrap();
        assert_eq!(dom.attribute(link, "href").as_deref(), Some("https://shop.example.com/sale"));
        assert_eq!(dom.text(link), "Old link");
        assert_eq!(dom.text(dom.first("#p").unwrap()), "Save 20% today");
    }

    #[tokio::test]
    async fn second_execution_is_rejected() {
        let dom = Arc::new(VirtualDom::from_html(r#"<h1 id="t">Hello</h1>"#));
        let exec = executor(dom.clone());
        let node = action("a1", "Add Class", json!({ "selector": "#t", "className": "promo" }));

        let first = exec.execute(&node).await;
        let second = exec.execute(&node).await;

        assert!(first.success);
        assert!(!second.success);
        assert_eq!(second.reason, Some(Rejection::ActionAlreadyExecuted));
        assert_eq!(second.error.as_deref(), Some("Action already executed"));
    }

    #[tokio::test]
    async fn same_selector_in_two_nodes_is_not_cross_blocked() {
        let dom = Arc::new(VirtualDom::from_html(r#"<h1 id="t">Hello</h1>"#));
        let exec = executor(dom.clone());
        let add = action("a1", "Add Class", json!({ "selector": "#t", "className": "one" }));
        let also = action("a2", "Add Class", json!({ "selector": "#t", "className": "two three" }));

        assert!(exec.execute(&add).await.success);
        assert!(exec.execute(&also).await.success);
        let heading = dom.first("#t").unwrap();
        assert!(dom.has_class(heading, "one"));
        assert!(dom.has_class(heading, "three"));
    }

    #[tokio::test(start_paused = true)]
    async fn two_nodes_wait_for_the_same_late_element() {
        let dom = Arc::new(VirtualDom::from_html("<main></main>"));
        let exec = executor(dom.clone());
        let price = action(
            "a1",
            "Replace Text",
            json!({ "selector": ".promo", "newText": "20%", "originalText": "10%" }),
        );
        let label = action(
            "a2",
            "Replace Text",
            json!({ "selector": ".promo", "newText": "Deal", "originalText": "Sale" }),
        );

        let page = dom.clone();
        tokio::spawn(async move {
            sleep(Duration::from_millis(200)).await;
            let promo = page.create_element("p");
            page.add_class(promo, "promo");
            page.set_inner_html(promo, "Sale 10% off");
            page.append_to_body(promo);
        });

        let outcomes = exec.execute_all(&[&price, &label]).await;
        assert!(outcomes.iter().all(|o| o.success), "{:?}", outcomes);
        assert_eq!(dom.text(dom.first(".promo").unwrap()), "Deal 20% off");
    }

    #[tokio::test]
    async fn background_images_get_defaults() {
        let dom = Arc::new(VirtualDom::from_html(r#"<div class="hero" style="background-size: contain"></div>"#));
        let exec = executor(dom.clone());
        exec.execute(&action(
            "a1",
            "Replace Image",
            json!({ "selector": ".hero", "newImageUrl": "/new.jpg" }),
        ))
        .await;

        let hero = dom.first(".hero").unwrap();
        assert_eq!(dom.style(hero, "background-image").as_deref(), Some("url('/new.jpg')"));
        assert_eq!(dom.style(hero, "background-size").as_deref(), Some("contain"));
        assert_eq!(dom.style(hero, "background-position").as_deref(), Some("center"));
    }

    #[tokio::test(start_paused = true)]
    async fn missing_elements_time_out() {
        let dom = Arc::new(VirtualDom::from_html("<main></main>"));
        let exec = executor(dom);
        let outcome = exec
            .execute(&action("a1", "Hide Element", json!({ "selector": ".never" })))
            .await;
        assert_eq!(outcome.reason, Some(Rejection::ElementTimeout));
        assert!(outcome.timed_out());
    }

    #[tokio::test]
    async fn invalid_selectors_are_not_awaited() {
        let dom = Arc::new(VirtualDom::from_html("<main></main>"));
        let exec = executor(dom);
        let outcome = exec
            .execute(&action("a1", "Hide Element", json!({ "selector": "div[[[" })))
            .await;
        assert_eq!(outcome.reason, Some(Rejection::ElementNotFound));
    }

    #[tokio::test(start_paused = true)]
    async fn fade_hide_ends_hidden() {
        let dom = Arc::new(VirtualDom::from_html(r#"<div class="promo">Sale</div>"#));
        let exec = executor(dom.clone());
        let node = ActionNode {
            id: "a1".to_string(),
            kind: ActionKind::HideElement(ToggleConfig {
                target: ElementTarget::new(".promo"),
                animation: Animation::Fade,
                delay: 0.0,
            }),
        };

        let outcome = exec.execute(&node).await;
        assert!(outcome.success);
        let promo = dom.first(".promo").unwrap();
        assert!(!dom.is_visible(promo));
        assert_eq!(dom.style(promo, "opacity").as_deref(), Some("0"));
    }

    #[tokio::test(start_paused = true)]
    async fn delayed_show_is_scheduled() {
        let dom = Arc::new(VirtualDom::from_html(r#"<div class="promo" style="display: none">Sale</div>"#));
        let exec = executor(dom.clone());
        let node = action("a1", "Show Element", json!({ "selector": ".promo", "delay": 1000 }));

        let outcome = exec.execute(&node).await;
        assert!(outcome.success && outcome.scheduled);
        let promo = dom.first(".promo").unwrap();
        assert!(!dom.is_visible(promo));

        sleep(Duration::from_millis(1100)).await;
        assert!(dom.is_visible(promo));
    }

    #[tokio::test]
    async fn closed_elements_are_not_shown_again() {
        let dom = Arc::new(VirtualDom::from_html(r#"<div class="promo" hidden>Sale</div>"#));
        let exec = executor(dom.clone());
        exec.state().mark_closed_by_user(".promo");

        let outcome = exec
            .execute(&action("a1", "Show Element", json!({ "selector": ".promo" })))
            .await;
        assert_eq!(outcome.reason, Some(Rejection::ElementClosedByUser));
    }

    #[tokio::test(start_paused = true)]
    async fn overlay_is_built_and_auto_dismissed() {
        let dom = Arc::new(VirtualDom::from_html("<main></main>"));
        let exec = executor(dom.clone());
        let node = action(
            "a9",
            "Display Overlay",
            json!({ "content": "<strong>Welcome back</strong>", "position": "bottom", "duration": 2000 }),
        );

        assert!(exec.execute(&node).await.success);
        let overlay = dom.first("#pageflow-overlay-a9").unwrap();
        assert_eq!(dom.text(overlay).trim_end_matches('×'), "Welcome back");
        assert!(dom.first("#pageflow-overlay-a9 .pageflow-overlay-close").is_some());
        assert_eq!(dom.style(overlay, "bottom").as_deref(), Some("0"));

        sleep(Duration::from_millis(2100)).await;
        assert!(dom.first("#pageflow-overlay-a9").is_none());
    }

    #[tokio::test]
    async fn redirect_guards() {
        let dom = Arc::new(VirtualDom::from_html("<main></main>").with_url("https://shop.example.com/cart"));
        let exec = executor(dom.clone());

        let same = exec
            .execute(&action("r1", "Redirect", json!({ "url": "/cart" })))
            .await;
        assert_eq!(same.error.as_deref(), Some("Same page redirect prevented"));

        let first = exec
            .execute(&action("r2", "Redirect", json!({ "url": "/checkout", "newTab": true })))
            .await;
        assert!(first.success);

        let again = exec
            .execute(&action("r3", "Redirect", json!({ "url": "https://shop.example.com/checkout", "newTab": true })))
            .await;
        assert_eq!(again.reason, Some(Rejection::RapidRedirect));

        assert_eq!(
            dom.navigations(),
            vec![("https://shop.example.com/checkout".to_string(), NavigationTarget::NewTab)]
        );
    }

    #[tokio::test]
    async fn text_actions_run_alongside_others_in_order() {
        let dom = Arc::new(VirtualDom::from_html(r#"<h1 id="t">Old</h1><p id="p">Body</p>"#));
        let exec = executor(dom.clone());
        let class = ActionNode {
            id: "c1".to_string(),
            kind: ActionKind::AddClass(ClassConfig {
                target: ElementTarget::new("#p"),
                class_name: "lead".to_string(),
            }),
        };
        let text = action("t1", "Replace Text", json!({ "selector": "#t", "newText": "New" }));
        let missing = action("m1", "Add Class", json!({ "selector": "div[[[", "className": "x" }));

        let outcomes = exec.execute_all(&[&class, &text, &missing]).await;

        let ids: Vec<&str> = outcomes.iter().map(|o| o.action_id.as_str()).collect();
        assert_eq!(ids, vec!["c1", "t1", "m1"]);
        assert!(outcomes[0].success && outcomes[1].success && !outcomes[2].success);
        assert_eq!(dom.text(dom.first("#t").unwrap()), "New");
    }

    #[test]
    fn keys_fall_back_to_kind_and_selector() {
        let node = action("", "Hide Element", json!({ "selector": ".promo" }));
        assert_eq!(execution_key(&node), "Hide Element:.promo");
    }
}
