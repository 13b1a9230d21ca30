//! Workflow orchestrator.
//!
//! Owns the per-page state, loads the workflows for the current page, builds
//! the page context, starts the event hub and runs one workflow pass per page
//! event. Every trigger firing with actions produces one execution record,
//! reported in the background.

use crate::actions::{ActionExecutor, Rejection};
use crate::core::{DomPort, EngineConfig};
use crate::errors::Result;
use crate::hub::{EventHub, WatchList};
use crate::logging;
use crate::services::{
    record_visit, resolve_geolocation, ExecutionReporter, GeolocationProvider,
    HttpGeolocationProvider, WorkflowApiClient, WorkflowSource,
};
use crate::state::EngineState;
use crate::triggers::{PageEvent, TriggerEvaluator};
use crate::types::{ExecutionRecord, PageContext, TriggerKind, TriggerNode, Workflow};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, RwLock};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::{sleep, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// The remote collaborators of an engine.
#[derive(Clone)]
pub struct EngineServices {
    pub workflows: Arc<dyn WorkflowSource>,
    pub reporter: Arc<dyn ExecutionReporter>,
    pub geolocation: Arc<dyn GeolocationProvider>,
}

impl EngineServices {
    /// The HTTP workflow service plus the IP geolocation chain.
    pub fn http(config: &EngineConfig) -> Result<Self> {
        let api = Arc::new(WorkflowApiClient::new(config)?);
        Ok(Self {
            workflows: api.clone(),
            reporter: api,
            geolocation: Arc::new(HttpGeolocationProvider::new(&config.geolocation)?),
        })
    }
}

/// Clears the single-pass flag when a pass ends, however it ends.
struct PassGuard<'a>(&'a AtomicBool);

impl<'a> PassGuard<'a> {
    fn acquire(flag: &'a AtomicBool) -> Option<Self> {
        flag.compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .ok()
            .map(|_| Self(flag))
    }
}

impl Drop for PassGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

struct EngineInner<D: DomPort> {
    dom: Arc<D>,
    config: Arc<EngineConfig>,
    state: Arc<Mutex<EngineState>>,
    services: EngineServices,
    evaluator: TriggerEvaluator,
    executor: ActionExecutor<D>,
    workflows: RwLock<Arc<Vec<Workflow>>>,
    page: RwLock<Option<PageContext>>,
    processing: AtomicBool,
    started: AtomicBool,
    cancel: CancellationToken,
}

/// One engine per page load. Cheap to clone; clones share everything.
pub struct WorkflowEngine<D: DomPort> {
    inner: Arc<EngineInner<D>>,
}

impl<D: DomPort> Clone for WorkflowEngine<D> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<D: DomPort> WorkflowEngine<D> {
    /// Engine backed by the HTTP services, configured from the JSON the host
    /// page embeds.
    pub fn from_json(dom: Arc<D>, config_json: &str) -> Result<Self> {
        Self::new(dom, EngineConfig::from_json(config_json)?)
    }

    pub fn new(dom: Arc<D>, config: EngineConfig) -> Result<Self> {
        config.validate()?;
        logging::init(config.debug);
        let services = EngineServices::http(&config)?;
        Ok(Self::with_services(dom, config, services))
    }

    pub fn with_services(dom: Arc<D>, config: EngineConfig, services: EngineServices) -> Self {
        let config = Arc::new(config);
        let state = Arc::new(Mutex::new(EngineState::new()));
        let cancel = CancellationToken::new();
        let executor = ActionExecutor::new(dom.clone(), state.clone(), config.clone(), cancel.clone());

        Self {
            inner: Arc::new(EngineInner {
                evaluator: TriggerEvaluator::new(&config.dedup),
                dom,
                config,
                state,
                services,
                executor,
                workflows: RwLock::new(Arc::new(Vec::new())),
                page: RwLock::new(None),
                processing: AtomicBool::new(false),
                started: AtomicBool::new(false),
                cancel,
            }),
        }
    }

    /// Load workflows and start listening. Content hidden for anti-flash is
    /// revealed when this returns, whether initialization worked or not.
    pub async fn start(&self) -> Result<()> {
        if self.inner.started.swap(true, Ordering::SeqCst) {
            debug!("Engine already started");
            return Ok(());
        }

        let anti_flash = self.inner.config.anti_flash.enabled;
        if anti_flash {
            self.inner.dom.set_content_hidden(true);
            self.spawn_reveal_deadline();
        }

        let result = self.initialize().await;

        if anti_flash {
            self.inner.dom.set_content_hidden(false);
        }
        if let Err(e) = &result {
            error!("Engine initialization failed: {}", e);
        }
        result
    }

    async fn initialize(&self) -> Result<()> {
        let inner = &self.inner;
        let visitor = record_visit(inner.dom.as_ref());
        let page_info = inner.dom.page_info();

        let workflows: Vec<Workflow> = inner
            .services
            .workflows
            .fetch_active(&page_info.url)
            .await?
            .into_iter()
            .filter(|w| w.is_active)
            .collect();
        info!(count = workflows.len(), url = %page_info.url, "Workflows loaded");

        let geolocation = if workflows.iter().any(uses_geolocation) {
            Some(
                resolve_geolocation(
                    inner.dom.session_storage(),
                    inner.services.geolocation.as_ref(),
                    inner.config.geolocation.cache_ttl_secs,
                )
                .await,
            )
        } else {
            None
        };

        *write(&inner.page) = Some(PageContext {
            url: page_info.url,
            user_agent: page_info.user_agent,
            device_type: visitor.device_type,
            session_id: visitor.session_id,
            page_visits: visitor.page_visits,
            stored_visit_count: visitor.stored_visit_count,
            geolocation,
        });

        let watch = WatchList::from_workflows(&workflows);
        *write(&inner.workflows) = Arc::new(workflows);

        let (sink, events) = mpsc::unbounded_channel();
        EventHub::new(
            inner.dom.clone(),
            inner.state.clone(),
            inner.config.clone(),
            inner.cancel.clone(),
            sink,
            watch,
        )
        .spawn();
        self.spawn_dispatcher(events);

        self.handle_event(PageEvent::PageLoad).await;
        Ok(())
    }

    fn spawn_reveal_deadline(&self) {
        let dom = self.inner.dom.clone();
        let cancel = self.inner.cancel.clone();
        let max_hidden = Duration::from_millis(self.inner.config.anti_flash.max_hidden_ms);
        tokio::spawn(async move {
            tokio::select! {
                _ = cancel.cancelled() => {}
                _ = sleep(max_hidden) => {}
            }
            dom.set_content_hidden(false);
        });
    }

    fn spawn_dispatcher(&self, mut events: mpsc::UnboundedReceiver<PageEvent>) {
        let engine = self.clone();
        let cancel = self.inner.cancel.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    event = events.recv() => match event {
                        Some(event) => {
                            let engine = engine.clone();
                            tokio::spawn(async move { engine.handle_event(event).await });
                        }
                        None => break,
                    },
                }
            }
        });
    }

    /// Run one workflow pass for a page event. A pass already in progress
    /// causes the event to be dropped, not queued.
    pub async fn handle_event(&self, event: PageEvent) {
        if self.inner.cancel.is_cancelled() {
            return;
        }
        let Some(_pass) = PassGuard::acquire(&self.inner.processing) else {
            debug!(event = event.event_type(), "Workflow pass in progress, event dropped");
            return;
        };

        let Some(page) = read(&self.inner.page).clone() else {
            debug!(event = event.event_type(), "Engine not initialized, event dropped");
            return;
        };
        // Exit intent is claimed by the pass that handles it; a dropped event leaves it unclaimed.
        if matches!(event, PageEvent::ExitIntent { .. }) && !self.lock_state().claim_exit_intent() {
            debug!("Exit intent already handled on this page");
            return;
        }
        let workflows = read(&self.inner.workflows).clone();

        self.lock_state()
            .prune(Instant::now(), self.inner.config.dedup.trigger_window());

        for workflow in workflows.iter().filter(|w| w.is_active) {
            for trigger in workflow.trigger_nodes() {
                if self.inner.cancel.is_cancelled() {
                    return;
                }
                let fired = {
                    let mut state = self.lock_state();
                    self.inner
                        .evaluator
                        .evaluate(trigger, &event, &page, &mut state, Instant::now())
                };
                if fired {
                    self.run_trigger(workflow, trigger, &page).await;
                }
            }
        }
    }

    async fn run_trigger(&self, workflow: &Workflow, trigger: &TriggerNode, page: &PageContext) {
        let actions = workflow.actions_for(&trigger.id);
        info!(
            workflow = %workflow.id,
            trigger = %trigger.id,
            kind = trigger.kind.name(),
            actions = actions.len(),
            "Trigger fired"
        );
        if actions.is_empty() {
            return;
        }

        let started = Instant::now();
        let outcomes = self.inner.executor.execute_all(&actions).await;

        if outcomes
            .iter()
            .all(|o| o.reason == Some(Rejection::ActionAlreadyExecuted))
        {
            debug!(trigger = %trigger.id, "Every action already applied, nothing to report");
            return;
        }

        let record = ExecutionRecord {
            workflow_id: workflow.id.clone(),
            trigger_id: trigger.id.clone(),
            status: ExecutionRecord::status_for(&outcomes),
            execution_time_ms: started.elapsed().as_millis() as u64,
            page_url: page.url.clone(),
            session_id: page.session_id.clone(),
            user_agent: page.user_agent.clone(),
            device_type: page.device_type,
            actions_executed: outcomes,
            execution_key: Uuid::new_v4().to_string(),
            timestamp: chrono::Utc::now(),
        };
        self.report(record);
    }

    /// Fire-and-forget: reporting never blocks or fails a pass.
    fn report(&self, record: ExecutionRecord) {
        let reporter = self.inner.services.reporter.clone();
        tokio::spawn(async move {
            if let Err(e) = reporter.report(&record).await {
                warn!(
                    workflow = %record.workflow_id,
                    execution = %record.execution_key,
                    "Failed to report execution: {}",
                    e
                );
            }
        });
    }

    /// Stop listening and cancel every pending wait and deferred action.
    pub fn shutdown(&self) {
        info!("Engine shutting down");
        self.inner.cancel.cancel();
        self.inner.dom.set_content_hidden(false);
    }

    pub fn is_shut_down(&self) -> bool {
        self.inner.cancel.is_cancelled()
    }

    pub fn config(&self) -> &EngineConfig {
        &self.inner.config
    }

    pub fn workflows(&self) -> Arc<Vec<Workflow>> {
        read(&self.inner.workflows).clone()
    }

    pub fn page_context(&self) -> Option<PageContext> {
        read(&self.inner.page).clone()
    }

    pub fn executed_count(&self) -> usize {
        self.lock_state().executed_count()
    }

    pub fn is_closed_by_user(&self, selector: &str) -> bool {
        self.lock_state().is_closed_by_user(selector)
    }

    fn lock_state(&self) -> MutexGuard<'_, EngineState> {
        self.inner
            .state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

fn uses_geolocation(workflow: &Workflow) -> bool {
    workflow
        .trigger_nodes()
        .any(|t| matches!(t.kind, TriggerKind::Geolocation(_)))
}

fn read<T>(lock: &RwLock<T>) -> std::sync::RwLockReadGuard<'_, T> {
    lock.read().unwrap_or_else(|poisoned| poisoned.into_inner())
}

fn write<T>(lock: &RwLock<T>) -> std::sync::RwLockWriteGuard<'_, T> {
    lock.write().unwrap_or_else(|poisoned| poisoned.into_inner())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dom::VirtualDom;
    use crate::testing::{
        RecordingReporter, StaticGeolocation, StaticWorkflowSource, TestHelper, WorkflowBuilder,
    };
    use crate::types::{ExecutionStatus, Geolocation};
    use serde_json::json;

    fn engine_for(
        dom: &Arc<VirtualDom>,
        workflows: Vec<Workflow>,
    ) -> (WorkflowEngine<VirtualDom>, Arc<RecordingReporter>) {
        let geolocation = StaticGeolocation::new(Geolocation {
            country_code: "US".to_string(),
            ..Default::default()
        });
        let test = TestHelper::engine_with_geolocation(
            dom.clone(),
            workflows,
            EngineConfig::default(),
            geolocation,
        );
        (test.engine, test.reporter)
    }

    #[tokio::test(start_paused = true)]
    async fn page_load_pass_applies_actions_and_reports() {
        let dom = Arc::new(VirtualDom::from_html(r#"<h1 class="title">Hello</h1>"#));
        let workflow = WorkflowBuilder::new("wf-1")
            .trigger("t1", "Page Visits", json!({ "visitCount": 1 }))
            .action("a1", "Replace Text", json!({ "selector": "h1.title", "newText": "Welcome back" }))
            .connect("t1", "a1")
            .build();
        let (engine, reporter) = engine_for(&dom, vec![workflow]);

        engine.start().await.unwrap();
        sleep(Duration::from_millis(10)).await;

        let title = dom.first("h1.title").unwrap();
        assert_eq!(dom.text(title), "Welcome back");
        let records = reporter.records();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].status, ExecutionStatus::Success);
        assert_eq!(records[0].trigger_id, "t1");
        assert!(!dom.is_content_hidden());
    }

    #[test]
    fn http_engine_needs_an_endpoint() {
        let dom = Arc::new(VirtualDom::new());
        assert!(WorkflowEngine::from_json(dom.clone(), r#"{ "debug": true }"#).is_err());
        assert!(WorkflowEngine::from_json(dom, r#"{ "endpoint": "https://api.example.com" }"#).is_ok());
    }

    #[tokio::test(start_paused = true)]
    async fn failed_initialization_still_reveals_content() {
        let dom = Arc::new(VirtualDom::from_html("<main></main>"));
        let services = EngineServices {
            workflows: Arc::new(StaticWorkflowSource::failing("service down")),
            reporter: Arc::new(RecordingReporter::new()),
            geolocation: Arc::new(StaticGeolocation::default()),
        };
        let engine = WorkflowEngine::with_services(dom.clone(), EngineConfig::default(), services);

        assert!(engine.start().await.is_err());
        assert!(!dom.is_content_hidden());
    }

    #[tokio::test(start_paused = true)]
    async fn geolocation_is_only_resolved_when_needed() {
        let dom = Arc::new(VirtualDom::from_html("<main></main>"));
        let plain = WorkflowBuilder::new("wf-1")
            .trigger("t1", "Exit Intent", json!({}))
            .build();
        let (engine, _) = engine_for(&dom, vec![plain]);
        engine.start().await.unwrap();
        assert!(engine.page_context().unwrap().geolocation.is_none());

        let dom = Arc::new(VirtualDom::from_html("<main></main>"));
        let geo = WorkflowBuilder::new("wf-2")
            .trigger("t1", "Geolocation", json!({ "field": "countryCode", "values": "US" }))
            .build();
        let (engine, _) = engine_for(&dom, vec![geo]);
        engine.start().await.unwrap();
        assert_eq!(
            engine.page_context().unwrap().geolocation.unwrap().country_code,
            "US"
        );
    }

    #[tokio::test(start_paused = true)]
    async fn repeat_firings_of_applied_actions_are_not_reported() {
        let dom = Arc::new(VirtualDom::from_html(r#"<div class="banner">Sale</div>"#));
        let workflow = WorkflowBuilder::new("wf-1")
            .trigger("t1", "Scroll Depth", json!({ "percentage": 50 }))
            .action("a1", "Add Class", json!({ "selector": ".banner", "className": "highlight" }))
            .connect("t1", "a1")
            .build();
        let (engine, reporter) = engine_for(&dom, vec![workflow]);
        engine.start().await.unwrap();

        engine.handle_event(PageEvent::Scroll { percentage: 60.0 }).await;
        sleep(Duration::from_secs(31)).await;
        engine.handle_event(PageEvent::Scroll { percentage: 90.0 }).await;
        sleep(Duration::from_millis(10)).await;

        assert_eq!(reporter.records().len(), 1);
        assert_eq!(engine.executed_count(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn overlapping_passes_are_dropped() {
        let dom = Arc::new(VirtualDom::from_html("<main></main>"));
        let workflow = WorkflowBuilder::new("wf-1")
            .trigger("t1", "Scroll Depth", json!({ "percentage": 10 }))
            .action("a1", "Show Element", json!({ "selector": ".late" }))
            .connect("t1", "a1")
            .trigger("t2", "Exit Intent", json!({}))
            .action("a2", "Display Overlay", json!({ "content": "Wait!" }))
            .connect("t2", "a2")
            .build();
        let (engine, _) = engine_for(&dom, vec![workflow]);
        engine.start().await.unwrap();

        // The first pass waits on an element that never appears.
        let waiting = tokio::spawn({
            let engine = engine.clone();
            async move { engine.handle_event(PageEvent::Scroll { percentage: 20.0 }).await }
        });
        sleep(Duration::from_millis(50)).await;
        engine.handle_event(PageEvent::ExitIntent { mouse_y: -1.0 }).await;
        assert!(dom.first(".pageflow-overlay").is_none());

        engine.shutdown();
        waiting.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn exit_intent_dropped_during_a_pass_fires_later_once() {
        let dom = Arc::new(VirtualDom::from_html("<main></main>"));
        let workflow = WorkflowBuilder::new("wf-1")
            .trigger("t1", "Scroll Depth", json!({ "percentage": 10 }))
            .action("a1", "Show Element", json!({ "selector": ".late" }))
            .connect("t1", "a1")
            .trigger("t2", "Exit Intent", json!({}))
            .action("a2", "Display Overlay", json!({ "content": "Wait!" }))
            .connect("t2", "a2")
            .build();
        let (engine, reporter) = engine_for(&dom, vec![workflow]);
        engine.start().await.unwrap();

        let scrolling = tokio::spawn({
            let engine = engine.clone();
            async move { engine.handle_event(PageEvent::Scroll { percentage: 20.0 }).await }
        });
        sleep(Duration::from_millis(50)).await;
        engine.handle_event(PageEvent::ExitIntent { mouse_y: -1.0 }).await;
        assert!(dom.first(".pageflow-overlay").is_none());

        let late = dom.create_element("div");
        dom.add_class(late, "late");
        dom.append_to_body(late);
        scrolling.await.unwrap();

        engine.handle_event(PageEvent::ExitIntent { mouse_y: -1.0 }).await;
        assert!(dom.first(".pageflow-overlay").is_some());

        let overlay = dom.first(".pageflow-overlay").unwrap();
        dom.remove(overlay);
        sleep(Duration::from_secs(60)).await;
        engine.handle_event(PageEvent::ExitIntent { mouse_y: -1.0 }).await;
        assert!(dom.first(".pageflow-overlay").is_none());
        assert!(!engine.lock_state().claim_exit_intent());
        sleep(Duration::from_millis(10)).await;
        assert_eq!(reporter.records().len(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn shutdown_stops_event_processing() {
        let dom = Arc::new(VirtualDom::from_html(r#"<div class="banner">Sale</div>"#));
        let workflow = WorkflowBuilder::new("wf-1")
            .trigger("t1", "Exit Intent", json!({}))
            .action("a1", "Hide Element", json!({ "selector": ".banner" }))
            .connect("t1", "a1")
            .build();
        let (engine, _) = engine_for(&dom, vec![workflow]);
        engine.start().await.unwrap();

        engine.shutdown();
        engine.handle_event(PageEvent::ExitIntent { mouse_y: -1.0 }).await;

        assert!(engine.is_shut_down());
        assert!(dom.is_visible(dom.first(".banner").unwrap()));
    }
}
