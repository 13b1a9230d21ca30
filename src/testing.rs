use crate::core::{DomPort, EngineConfig};
use crate::dom::VirtualDom;
use crate::engine::{EngineServices, WorkflowEngine};
use crate::errors::{EngineError, Result};
use crate::services::{ExecutionReporter, GeolocationProvider, WorkflowSource};
use crate::types::{
    ActionKind, ActionNode, Connection, ExecutionRecord, Geolocation, Node, TriggerKind,
    TriggerNode, Workflow,
};
use async_trait::async_trait;
use serde_json::Value;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use tracing::warn;

pub const IPHONE_USER_AGENT: &str =
    "Mozilla/5.0 (iPhone; CPU iPhone OS 17_0 like Mac OS X) AppleWebKit/605.1.15 Mobile/15E148";

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Fluent construction of workflows from the same kind names and JSON
/// configs the workflow service sends.
#[derive(Debug, Clone)]
pub struct WorkflowBuilder {
    workflow: Workflow,
}

impl WorkflowBuilder {
    pub fn new(id: &str) -> Self {
        Self {
            workflow: Workflow::new(id, id),
        }
    }

    pub fn name(mut self, name: &str) -> Self {
        self.workflow.name = name.to_string();
        self
    }

    pub fn inactive(mut self) -> Self {
        self.workflow.is_active = false;
        self
    }

    /// Nodes with an unknown kind or a bad config are skipped, as they are
    /// when a workflow is decoded.
    pub fn trigger(mut self, id: &str, kind: &str, config: Value) -> Self {
        match TriggerKind::from_parts(kind, config) {
            Ok(kind) => self.workflow.nodes.push(Node::Trigger(TriggerNode {
                id: id.to_string(),
                kind,
            })),
            Err(e) => warn!(node = id, "Skipping trigger: {}", e),
        }
        self
    }

    pub fn action(mut self, id: &str, kind: &str, config: Value) -> Self {
        match ActionKind::from_parts(kind, config) {
            Ok(kind) => self.workflow.nodes.push(Node::Action(ActionNode {
                id: id.to_string(),
                kind,
            })),
            Err(e) => warn!(node = id, "Skipping action: {}", e),
        }
        self
    }

    pub fn connect(mut self, source: &str, target: &str) -> Self {
        self.workflow.connections.push(Connection::new(source, target));
        self
    }

    pub fn build(self) -> Workflow {
        self.workflow
    }
}

/// Serves a fixed set of workflows, or a fixed failure.
#[derive(Debug)]
pub struct StaticWorkflowSource {
    workflows: std::result::Result<Vec<Workflow>, String>,
    requested: Mutex<Vec<String>>,
}

impl StaticWorkflowSource {
    pub fn new(workflows: Vec<Workflow>) -> Self {
        Self {
            workflows: Ok(workflows),
            requested: Mutex::new(Vec::new()),
        }
    }

    pub fn failing(message: &str) -> Self {
        Self {
            workflows: Err(message.to_string()),
            requested: Mutex::new(Vec::new()),
        }
    }

    /// Page URLs workflows were requested for.
    pub fn requested_urls(&self) -> Vec<String> {
        lock(&self.requested).clone()
    }
}

#[async_trait]
impl WorkflowSource for StaticWorkflowSource {
    async fn fetch_active(&self, page_url: &str) -> Result<Vec<Workflow>> {
        lock(&self.requested).push(page_url.to_string());
        self.workflows
            .clone()
            .map_err(EngineError::WorkflowFetchFailed)
    }
}

/// Keeps every execution record it receives.
#[derive(Debug, Default)]
pub struct RecordingReporter {
    records: Mutex<Vec<ExecutionRecord>>,
}

impl RecordingReporter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn records(&self) -> Vec<ExecutionRecord> {
        lock(&self.records).clone()
    }
}

#[async_trait]
impl ExecutionReporter for RecordingReporter {
    async fn report(&self, record: &ExecutionRecord) -> Result<()> {
        lock(&self.records).push(record.clone());
        Ok(())
    }
}

/// A geolocation provider that answers from memory. The default one has no
/// location and fails every lookup.
#[derive(Debug, Default)]
pub struct StaticGeolocation {
    geolocation: Option<Geolocation>,
    lookups: AtomicUsize,
}

impl StaticGeolocation {
    pub fn new(geolocation: Geolocation) -> Self {
        Self {
            geolocation: Some(geolocation),
            lookups: AtomicUsize::new(0),
        }
    }

    pub fn lookups(&self) -> usize {
        self.lookups.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl GeolocationProvider for StaticGeolocation {
    async fn locate(&self) -> Result<Geolocation> {
        self.lookups.fetch_add(1, Ordering::SeqCst);
        self.geolocation
            .clone()
            .ok_or_else(|| EngineError::GeolocationFailed("no location configured".to_string()))
    }
}

/// An engine wired to in-memory services, plus the reporter it records into.
pub struct TestEngine {
    pub engine: WorkflowEngine<VirtualDom>,
    pub dom: Arc<VirtualDom>,
    pub reporter: Arc<RecordingReporter>,
}

pub struct TestHelper;

impl TestHelper {
    pub fn page(html: &str) -> Arc<VirtualDom> {
        Arc::new(VirtualDom::from_html(html))
    }

    pub fn page_at(html: &str, url: &str) -> Arc<VirtualDom> {
        Arc::new(VirtualDom::from_html(html).with_url(url))
    }

    pub fn mobile_page(html: &str) -> Arc<VirtualDom> {
        Arc::new(VirtualDom::from_html(html).with_user_agent(IPHONE_USER_AGENT, 390))
    }

    pub fn engine(dom: Arc<VirtualDom>, workflows: Vec<Workflow>) -> TestEngine {
        Self::engine_with_config(dom, workflows, EngineConfig::default())
    }

    pub fn engine_with_config(
        dom: Arc<VirtualDom>,
        workflows: Vec<Workflow>,
        config: EngineConfig,
    ) -> TestEngine {
        Self::engine_with_geolocation(dom, workflows, config, StaticGeolocation::default())
    }

    pub fn engine_with_geolocation(
        dom: Arc<VirtualDom>,
        workflows: Vec<Workflow>,
        config: EngineConfig,
        geolocation: StaticGeolocation,
    ) -> TestEngine {
        let reporter = Arc::new(RecordingReporter::new());
        let services = EngineServices {
            workflows: Arc::new(StaticWorkflowSource::new(workflows)),
            reporter: reporter.clone(),
            geolocation: Arc::new(geolocation),
        };
        TestEngine {
            engine: WorkflowEngine::with_services(dom.clone(), config, services),
            dom,
            reporter,
        }
    }

    pub fn count_matches(dom: &VirtualDom, selector: &str) -> usize {
        dom.query_all(selector).map(|nodes| nodes.len()).unwrap_or(0)
    }

    /// Trimmed text of every element matching `selector`, in document order.
    pub fn texts(dom: &VirtualDom, selector: &str) -> Vec<String> {
        dom.query_all(selector)
            .unwrap_or_default()
            .into_iter()
            .map(|node| dom.text(node).trim().to_string())
            .collect()
    }

    pub fn visible_count(dom: &VirtualDom, selector: &str) -> usize {
        dom.query_all(selector)
            .unwrap_or_default()
            .into_iter()
            .filter(|node| dom.is_visible(*node))
            .count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tokio_test::{assert_err, assert_ok};

    #[test]
    fn builder_skips_unknown_kinds() {
        let workflow = WorkflowBuilder::new("wf-1")
            .trigger("t1", "Scroll Depth", json!({ "percentage": 50 }))
            .trigger("t2", "Moon Phase", json!({}))
            .action("a1", "Hide Element", json!({ "selector": ".promo" }))
            .connect("t1", "a1")
            .build();

        assert_eq!(workflow.trigger_nodes().count(), 1);
        assert_eq!(workflow.actions_for("t1").len(), 1);
        assert!(workflow.is_active);
    }

    #[tokio::test]
    async fn static_source_records_requests() {
        let source = StaticWorkflowSource::new(vec![WorkflowBuilder::new("wf-1").build()]);
        let workflows = assert_ok!(source.fetch_active("https://example.com/").await);
        assert_eq!(workflows.len(), 1);
        assert_eq!(source.requested_urls(), vec!["https://example.com/".to_string()]);

        let failing = StaticWorkflowSource::failing("offline");
        assert_err!(failing.fetch_active("https://example.com/").await);
    }

    #[tokio::test]
    async fn default_geolocation_fails() {
        let provider = StaticGeolocation::default();
        assert_err!(provider.locate().await);
        assert_eq!(provider.lookups(), 1);
    }

    #[test]
    fn page_fixtures() {
        let dom = TestHelper::page(r#"<p class="a"> one </p><p class="a" hidden>two</p>"#);
        assert_eq!(TestHelper::count_matches(&dom, "p.a"), 2);
        assert_eq!(TestHelper::texts(&dom, "p.a"), vec!["one", "two"]);
        assert_eq!(TestHelper::visible_count(&dom, "p.a"), 1);
        assert_eq!(TestHelper::count_matches(&dom, "p[["), 0);

        let mobile = TestHelper::mobile_page("<main></main>");
        assert_eq!(mobile.page_info().viewport_width, 390);
    }
}
