//! Event & observer hub.
//!
//! Turns raw [`DomEvent`]s into normalized [`PageEvent`]s. Each condition
//! kind keeps its own small state machine (throttles, milestones, timers) and
//! everything funnels into one channel consumed by the engine.

use crate::core::{DomEvent, DomPort, EngineConfig, NodeId};
use crate::actions::OVERLAY_CLASS;
use crate::dom::{css_escape, generate_selector};
use crate::guard::{dismissed_container, is_close_control};
use crate::state::EngineState;
use crate::triggers::PageEvent;
use crate::types::{TriggerKind, Workflow};
use std::collections::{BTreeSet, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::broadcast::{self, error::RecvError};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{interval, interval_at, sleep, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

const SCROLL_THROTTLE: Duration = Duration::from_millis(500);
const SCROLL_FIRE_GAP: Duration = Duration::from_secs(5);
const SCROLL_MILESTONE: f64 = 25.0;
const TIME_TICK: Duration = Duration::from_secs(10);
const TIME_MILESTONES: [u64; 4] = [30, 60, 120, 300];
const TIME_FIRE_GAP: Duration = Duration::from_secs(30);
const INACTIVITY_TICK: Duration = Duration::from_secs(1);

/// The conditions the loaded workflows actually listen for, with selectors
/// deduplicated across all workflows.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct WatchList {
    pub scroll: bool,
    pub time_on_page: bool,
    pub exit_intent: bool,
    pub click_selectors: Vec<String>,
    /// Selector and the shortest configured dwell for it.
    pub hover_selectors: Vec<(String, Duration)>,
    pub visibility_selectors: Vec<String>,
    /// Distinct inactivity thresholds in seconds, ascending.
    pub inactivity_thresholds: Vec<u64>,
}

impl WatchList {
    pub fn from_workflows(workflows: &[Workflow]) -> Self {
        let mut watch = WatchList::default();
        let mut clicks = BTreeSet::new();
        let mut visibility = BTreeSet::new();
        let mut hovers: HashMap<String, Duration> = HashMap::new();
        let mut thresholds = BTreeSet::new();

        for trigger in workflows
            .iter()
            .filter(|w| w.is_active)
            .flat_map(|w| w.trigger_nodes())
        {
            match &trigger.kind {
                TriggerKind::ScrollDepth(_) => watch.scroll = true,
                TriggerKind::TimeOnPage(_) => watch.time_on_page = true,
                TriggerKind::ExitIntent => watch.exit_intent = true,
                TriggerKind::ElementClick(c) => {
                    clicks.insert(c.selector.clone());
                }
                TriggerKind::ElementVisibility(c) => {
                    visibility.insert(c.selector.clone());
                }
                TriggerKind::ElementHover(c) => {
                    let dwell = Duration::from_millis(c.hover_duration.max(0.0) as u64);
                    hovers
                        .entry(c.selector.clone())
                        .and_modify(|d| *d = (*d).min(dwell))
                        .or_insert(dwell);
                }
                TriggerKind::UserInactivity(c) => {
                    let secs = c.unit.to_seconds(c.duration).ceil().max(1.0) as u64;
                    thresholds.insert(secs);
                }
                TriggerKind::DeviceType(_)
                | TriggerKind::UtmParameters(_)
                | TriggerKind::PageVisits(_)
                | TriggerKind::RepeatVisitor(_)
                | TriggerKind::Geolocation(_) => {}
            }
        }

        watch.click_selectors = clicks.into_iter().collect();
        watch.visibility_selectors = visibility.into_iter().collect();
        let mut hovers: Vec<_> = hovers.into_iter().collect();
        hovers.sort();
        watch.hover_selectors = hovers;
        watch.inactivity_thresholds = thresholds.into_iter().collect();
        watch
    }
}

#[derive(Debug, Default)]
struct ScrollTracker {
    last_check: Option<Instant>,
    last_fired: Option<Instant>,
    highest_milestone: f64,
}

impl ScrollTracker {
    /// Emit only when a new 25% milestone is crossed, at most one check per
    /// throttle period and one emission per fire gap.
    fn observe(&mut self, percentage: f64, now: Instant) -> Option<f64> {
        if self
            .last_check
            .is_some_and(|last| now.saturating_duration_since(last) < SCROLL_THROTTLE)
        {
            return None;
        }
        self.last_check = Some(now);

        let milestone = (percentage / SCROLL_MILESTONE).floor() * SCROLL_MILESTONE;
        if milestone <= 0.0 || milestone <= self.highest_milestone {
            return None;
        }
        if self
            .last_fired
            .is_some_and(|last| now.saturating_duration_since(last) < SCROLL_FIRE_GAP)
        {
            return None;
        }

        self.highest_milestone = milestone;
        self.last_fired = Some(now);
        Some(percentage)
    }
}

#[derive(Debug)]
struct TimeTracker {
    started: Instant,
    emitted: usize,
    last_fired: Option<Instant>,
}

impl TimeTracker {
    fn new(started: Instant) -> Self {
        Self {
            started,
            emitted: 0,
            last_fired: None,
        }
    }

    fn tick(&mut self, now: Instant) -> Option<f64> {
        let elapsed = now.saturating_duration_since(self.started);
        let reached = TIME_MILESTONES
            .iter()
            .take_while(|m| elapsed.as_secs() >= **m)
            .count();
        if reached <= self.emitted {
            return None;
        }
        if self
            .last_fired
            .is_some_and(|last| now.saturating_duration_since(last) < TIME_FIRE_GAP)
        {
            return None;
        }
        self.emitted = reached;
        self.last_fired = Some(now);
        Some(elapsed.as_secs_f64())
    }
}

#[derive(Debug)]
struct InactivityTracker {
    thresholds: Vec<u64>,
    last_activity: Instant,
    fired: usize,
}

impl InactivityTracker {
    fn new(thresholds: Vec<u64>, now: Instant) -> Self {
        Self {
            thresholds,
            last_activity: now,
            fired: 0,
        }
    }

    fn activity(&mut self, now: Instant) {
        self.last_activity = now;
        self.fired = 0;
    }

    /// One emission per threshold crossed; once the longest threshold has
    /// fired the window starts over.
    fn tick(&mut self, now: Instant) -> Option<f64> {
        let idle = now.saturating_duration_since(self.last_activity);
        let threshold = *self.thresholds.get(self.fired)?;
        if idle.as_secs() < threshold {
            return None;
        }
        self.fired += 1;
        if self.fired == self.thresholds.len() {
            self.activity(now);
        }
        Some(idle.as_secs_f64())
    }
}

pub struct EventHub<D: DomPort> {
    dom: Arc<D>,
    state: Arc<Mutex<EngineState>>,
    config: Arc<EngineConfig>,
    cancel: CancellationToken,
    sink: mpsc::UnboundedSender<PageEvent>,
    watch: WatchList,
    hover_generations: HashMap<String, Arc<AtomicU64>>,
}

impl<D: DomPort> EventHub<D> {
    pub fn new(
        dom: Arc<D>,
        state: Arc<Mutex<EngineState>>,
        config: Arc<EngineConfig>,
        cancel: CancellationToken,
        sink: mpsc::UnboundedSender<PageEvent>,
        watch: WatchList,
    ) -> Self {
        let hover_generations = watch
            .hover_selectors
            .iter()
            .map(|(selector, _)| (selector.clone(), Arc::new(AtomicU64::new(0))))
            .collect();
        Self {
            dom,
            state,
            config,
            cancel,
            sink,
            watch,
            hover_generations,
        }
    }

    /// Subscribe to the page and run the hub until shutdown.
    ///
    /// The subscription is taken before this returns, so no event dispatched
    /// afterwards is missed.
    pub fn spawn(self) -> JoinHandle<()> {
        for selector in &self.watch.visibility_selectors {
            self.dom.observe_intersections(selector);
        }
        let events = self.dom.subscribe();
        debug!(watch = ?self.watch, "Event hub started");
        tokio::spawn(self.run(events))
    }

    async fn run(mut self, mut events: broadcast::Receiver<DomEvent>) {
        let now = Instant::now();
        let mut scroll = ScrollTracker::default();
        let mut time = TimeTracker::new(now);
        let mut inactivity = InactivityTracker::new(self.watch.inactivity_thresholds.clone(), now);

        let mut time_ticker = interval_at(now + TIME_TICK, TIME_TICK);
        time_ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        let mut idle_ticker = interval(INACTIVITY_TICK);
        idle_ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        let watch_time = self.watch.time_on_page;
        let watch_idle = !self.watch.inactivity_thresholds.is_empty();
        let cancel = self.cancel.clone();

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                received = events.recv() => {
                    let event = match received {
                        Ok(event) => event,
                        Err(RecvError::Lagged(skipped)) => {
                            debug!(skipped, "Event hub lagged behind the page");
                            continue;
                        }
                        Err(RecvError::Closed) => break,
                    };
                    let now = Instant::now();
                    if event.is_user_activity() {
                        inactivity.activity(now);
                    }
                    if !self.on_dom_event(event, &mut scroll, now) {
                        break;
                    }
                }
                _ = time_ticker.tick(), if watch_time => {
                    if let Some(seconds) = time.tick(Instant::now()) {
                        self.emit(PageEvent::TimeOnPage { seconds });
                    }
                }
                _ = idle_ticker.tick(), if watch_idle => {
                    if let Some(idle_seconds) = inactivity.tick(Instant::now()) {
                        self.emit(PageEvent::Inactivity { idle_seconds });
                    }
                }
            }
        }
        debug!("Event hub stopped");
    }

    /// Returns false once the page is going away.
    fn on_dom_event(&mut self, event: DomEvent, scroll: &mut ScrollTracker, now: Instant) -> bool {
        match event {
            DomEvent::Scroll { percentage } if self.watch.scroll => {
                if let Some(percentage) = scroll.observe(percentage, now) {
                    self.emit(PageEvent::Scroll { percentage });
                }
            }
            DomEvent::Click { target } => self.on_click(target),
            DomEvent::MouseEnter { target } | DomEvent::TouchStart { target } => {
                self.on_hover(target)
            }
            DomEvent::MouseOut { target } => self.on_hover_end(target),
            DomEvent::Intersection {
                selector,
                ratio,
                is_intersecting,
                ..
            } => {
                if is_intersecting && self.watch.visibility_selectors.contains(&selector) {
                    self.emit(PageEvent::ElementVisible {
                        selector,
                        visibility_percentage: ratio * 100.0,
                    });
                }
            }
            DomEvent::MouseLeaveDocument { client_y } if self.watch.exit_intent => {
                if client_y <= 0.0 {
                    self.emit(PageEvent::ExitIntent { mouse_y: client_y });
                }
            }
            DomEvent::Unload => {
                info!("Page unloading, shutting down");
                self.cancel.cancel();
                return false;
            }
            _ => {}
        }
        true
    }

    fn on_click(&self, target: NodeId) {
        if is_close_control(self.dom.as_ref(), target) {
            self.register_user_close(target);
            return;
        }

        let Some(element) = self.dom.snapshot(target) else {
            return;
        };
        let selector = generate_selector(&element);

        let mut matched_any = false;
        for configured in &self.watch.click_selectors {
            if self.dom.closest(target, configured).is_some() {
                matched_any = true;
                self.emit(PageEvent::Click {
                    selector: selector.clone(),
                    matched_selector: Some(configured.clone()),
                });
            }
        }
        if !matched_any {
            self.emit(PageEvent::Click {
                selector,
                matched_selector: None,
            });
        }
    }

    /// A close control was used: remember the dismissed container so nothing
    /// shows it again, and take down engine overlays.
    fn register_user_close(&self, control: NodeId) {
        let Some(container) = dismissed_container(self.dom.as_ref(), control) else {
            debug!("Close control clicked outside any dismissable container");
            return;
        };
        let Some(element) = self.dom.snapshot(container) else {
            return;
        };

        let selector = generate_selector(&element);
        info!(selector = %selector, "Element closed by user");
        {
            let mut state = self.lock_state();
            state.mark_closed_by_user(&selector);
            if let Some(id) = element.element_id.as_deref().filter(|id| !id.is_empty()) {
                state.mark_closed_by_user(&format!("#{}", css_escape(id)));
            }
        }

        if element.classes().any(|c| c == OVERLAY_CLASS) {
            self.dom.remove(container);
        }
    }

    fn on_hover(&self, target: NodeId) {
        for (selector, dwell) in &self.watch.hover_selectors {
            if self.dom.closest(target, selector).is_none() {
                continue;
            }

            if !self.config.hover.enforce_dwell || dwell.is_zero() {
                self.emit(PageEvent::Hover {
                    selector: selector.clone(),
                });
                continue;
            }

            let Some(generation) = self.hover_generations.get(selector).cloned() else {
                continue;
            };
            let expected = generation.fetch_add(1, Ordering::SeqCst) + 1;
            let sink = self.sink.clone();
            let cancel = self.cancel.clone();
            let selector = selector.clone();
            let dwell = *dwell;
            tokio::spawn(async move {
                tokio::select! {
                    _ = cancel.cancelled() => {}
                    _ = sleep(dwell) => {
                        if generation.load(Ordering::SeqCst) == expected {
                            let _ = sink.send(PageEvent::Hover { selector });
                        }
                    }
                }
            });
        }
    }

    fn on_hover_end(&self, target: NodeId) {
        for (selector, _) in &self.watch.hover_selectors {
            if self.dom.closest(target, selector).is_some() {
                if let Some(generation) = self.hover_generations.get(selector) {
                    generation.fetch_add(1, Ordering::SeqCst);
                }
            }
        }
    }

    fn emit(&self, event: PageEvent) {
        debug!(event = event.event_type(), "Page event");
        let _ = self.sink.send(event);
    }

    fn lock_state(&self) -> std::sync::MutexGuard<'_, EngineState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}
