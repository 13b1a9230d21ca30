use crate::actions::ActionOutcome;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::borrow::Cow;
use std::collections::HashMap;
use std::fmt;
use tracing::warn;

/// A user-authored rule set loaded for the current page.
///
/// Decoding is lenient: a node whose kind this engine does not know is dropped
/// with a warning instead of failing the whole workflow, and connections that
/// do not run from a trigger to an action are discarded.
#[derive(Debug, Clone, Deserialize)]
#[serde(from = "RawWorkflow")]
pub struct Workflow {
    pub id: String,
    pub name: String,
    pub is_active: bool,
    pub nodes: Vec<Node>,
    pub connections: Vec<Connection>,
}

impl Workflow {
    pub fn new(id: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            is_active: true,
            nodes: Vec::new(),
            connections: Vec::new(),
        }
    }

    pub fn trigger_nodes(&self) -> impl Iterator<Item = &TriggerNode> {
        self.nodes.iter().filter_map(|node| match node {
            Node::Trigger(trigger) => Some(trigger),
            Node::Action(_) => None,
        })
    }

    pub fn action_nodes(&self) -> impl Iterator<Item = &ActionNode> {
        self.nodes.iter().filter_map(|node| match node {
            Node::Action(action) => Some(action),
            Node::Trigger(_) => None,
        })
    }

    /// Action nodes fed by the given trigger, in connection order.
    pub fn actions_for(&self, trigger_id: &str) -> Vec<&ActionNode> {
        self.connections
            .iter()
            .filter(|c| c.source_node_id == trigger_id)
            .filter_map(|c| self.action_nodes().find(|a| a.id == c.target_node_id))
            .collect()
    }

    fn node(&self, id: &str) -> Option<&Node> {
        self.nodes.iter().find(|n| n.id() == id)
    }
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawWorkflow {
    id: String,
    #[serde(default)]
    name: String,
    #[serde(default = "default_true")]
    is_active: bool,
    #[serde(default)]
    nodes: Vec<Value>,
    #[serde(default)]
    connections: Vec<Connection>,
}

fn default_true() -> bool {
    true
}

impl From<RawWorkflow> for Workflow {
    fn from(raw: RawWorkflow) -> Self {
        let mut workflow = Workflow::new(raw.id, raw.name);
        workflow.is_active = raw.is_active;

        for value in raw.nodes {
            match serde_json::from_value::<RawNode>(value).map_err(NodeDecodeError::from) {
                Ok(raw_node) => match Node::try_from(raw_node) {
                    Ok(node) => workflow.nodes.push(node),
                    Err(e) => warn!(workflow = %workflow.id, "Skipping node: {}", e),
                },
                Err(e) => warn!(workflow = %workflow.id, "Skipping node: {}", e),
            }
        }

        let connections = raw.connections;
        workflow.connections = connections
            .into_iter()
            .filter(|c| {
                let valid = matches!(workflow.node(&c.source_node_id), Some(Node::Trigger(_)))
                    && matches!(workflow.node(&c.target_node_id), Some(Node::Action(_)));
                if !valid {
                    warn!(
                        workflow = %workflow.id,
                        "Ignoring connection {} -> {}: only trigger -> action edges are supported",
                        c.source_node_id, c.target_node_id
                    );
                }
                valid
            })
            .collect();

        workflow
    }
}

#[derive(Debug, Clone)]
pub enum Node {
    Trigger(TriggerNode),
    Action(ActionNode),
}

impl Node {
    pub fn id(&self) -> &str {
        match self {
            Node::Trigger(t) => &t.id,
            Node::Action(a) => &a.id,
        }
    }
}

#[derive(Debug, Clone)]
pub struct TriggerNode {
    pub id: String,
    pub kind: TriggerKind,
}

#[derive(Debug, Clone)]
pub struct ActionNode {
    pub id: String,
    pub kind: ActionKind,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
enum NodeType {
    Trigger,
    Action,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawNode {
    id: String,
    #[serde(rename = "type")]
    node_type: NodeType,
    #[serde(default)]
    trigger_type: Option<String>,
    #[serde(default)]
    action_type: Option<String>,
    #[serde(default)]
    config: Value,
}

#[derive(Debug, thiserror::Error)]
pub enum NodeDecodeError {
    #[error("unknown {0} kind '{1}'")]
    UnknownKind(&'static str, String),

    #[error("node '{0}' has no {1} kind")]
    MissingKind(String, &'static str),

    #[error("invalid config: {0}")]
    InvalidConfig(#[from] serde_json::Error),
}

impl TryFrom<RawNode> for Node {
    type Error = NodeDecodeError;

    fn try_from(raw: RawNode) -> Result<Self, Self::Error> {
        let config = if raw.config.is_null() {
            Value::Object(Default::default())
        } else {
            raw.config
        };

        match raw.node_type {
            NodeType::Trigger => {
                let name = raw
                    .trigger_type
                    .ok_or_else(|| NodeDecodeError::MissingKind(raw.id.clone(), "trigger"))?;
                Ok(Node::Trigger(TriggerNode {
                    id: raw.id,
                    kind: TriggerKind::from_parts(&name, config)?,
                }))
            }
            NodeType::Action => {
                let name = raw
                    .action_type
                    .ok_or_else(|| NodeDecodeError::MissingKind(raw.id.clone(), "action"))?;
                Ok(Node::Action(ActionNode {
                    id: raw.id,
                    kind: ActionKind::from_parts(&name, config)?,
                }))
            }
        }
    }
}

/// Lowercase and strip separators so "Scroll Depth", "scroll_depth" and
/// "scroll-depth" name the same kind.
fn normalize_kind(name: &str) -> String {
    name.chars()
        .filter(|c| !matches!(c, ' ' | '_' | '-'))
        .flat_map(char::to_lowercase)
        .collect()
}

#[derive(Debug, Clone)]
pub enum TriggerKind {
    DeviceType(DeviceTypeConfig),
    UtmParameters(UtmConfig),
    PageVisits(VisitCountConfig),
    TimeOnPage(TimeOnPageConfig),
    ScrollDepth(ScrollDepthConfig),
    ElementClick(ElementSelectorConfig),
    ElementVisibility(VisibilityTriggerConfig),
    ElementHover(HoverConfig),
    UserInactivity(InactivityConfig),
    RepeatVisitor(VisitCountConfig),
    ExitIntent,
    Geolocation(GeolocationConfig),
}

impl TriggerKind {
    pub fn from_parts(name: &str, config: Value) -> Result<Self, NodeDecodeError> {
        let kind = match normalize_kind(name).as_str() {
            "devicetype" => TriggerKind::DeviceType(serde_json::from_value(config)?),
            "utmparameters" | "utmparameter" => {
                TriggerKind::UtmParameters(serde_json::from_value(config)?)
            }
            "pagevisits" => TriggerKind::PageVisits(serde_json::from_value(config)?),
            "timeonpage" => TriggerKind::TimeOnPage(serde_json::from_value(config)?),
            "scrolldepth" => TriggerKind::ScrollDepth(serde_json::from_value(config)?),
            "elementclick" => TriggerKind::ElementClick(serde_json::from_value(config)?),
            "elementvisibility" => TriggerKind::ElementVisibility(serde_json::from_value(config)?),
            "elementhover" => TriggerKind::ElementHover(serde_json::from_value(config)?),
            "userinactivity" => TriggerKind::UserInactivity(serde_json::from_value(config)?),
            "repeatvisitor" => TriggerKind::RepeatVisitor(serde_json::from_value(config)?),
            "exitintent" => TriggerKind::ExitIntent,
            "geolocation" => TriggerKind::Geolocation(serde_json::from_value(config)?),
            _ => return Err(NodeDecodeError::UnknownKind("trigger", name.to_string())),
        };
        Ok(kind)
    }

    pub fn name(&self) -> &'static str {
        match self {
            TriggerKind::DeviceType(_) => "Device Type",
            TriggerKind::UtmParameters(_) => "UTM Parameters",
            TriggerKind::PageVisits(_) => "Page Visits",
            TriggerKind::TimeOnPage(_) => "Time on Page",
            TriggerKind::ScrollDepth(_) => "Scroll Depth",
            TriggerKind::ElementClick(_) => "Element Click",
            TriggerKind::ElementVisibility(_) => "Element Visibility",
            TriggerKind::ElementHover(_) => "Element Hover",
            TriggerKind::UserInactivity(_) => "User Inactivity",
            TriggerKind::RepeatVisitor(_) => "Repeat Visitor",
            TriggerKind::ExitIntent => "Exit Intent",
            TriggerKind::Geolocation(_) => "Geolocation",
        }
    }

    /// Immediate kinds are decided once from page context and bypass the
    /// trigger cache.
    pub fn is_immediate(&self) -> bool {
        matches!(
            self,
            TriggerKind::DeviceType(_) | TriggerKind::UtmParameters(_) | TriggerKind::Geolocation(_)
        )
    }
}

#[derive(Debug, Clone)]
pub enum ActionKind {
    ReplaceText(ReplaceTextConfig),
    ReplaceImage(ReplaceImageConfig),
    HideElement(ToggleConfig),
    ShowElement(ToggleConfig),
    ModifyCss(ModifyCssConfig),
    AddClass(ClassConfig),
    RemoveClass(ClassConfig),
    DisplayOverlay(OverlayConfig),
    Redirect(RedirectConfig),
}

impl ActionKind {
    pub fn from_parts(name: &str, config: Value) -> Result<Self, NodeDecodeError> {
        let kind = match normalize_kind(name).as_str() {
            "replacetext" => ActionKind::ReplaceText(serde_json::from_value(config)?),
            "replaceimage" => ActionKind::ReplaceImage(serde_json::from_value(config)?),
            "hideelement" => ActionKind::HideElement(serde_json::from_value(config)?),
            "showelement" => ActionKind::ShowElement(serde_json::from_value(config)?),
            "modifycss" => ActionKind::ModifyCss(serde_json::from_value(config)?),
            "addclass" => ActionKind::AddClass(serde_json::from_value(config)?),
            "removeclass" => ActionKind::RemoveClass(serde_json::from_value(config)?),
            "displayoverlay" => ActionKind::DisplayOverlay(serde_json::from_value(config)?),
            "redirect" | "redirectpage" => ActionKind::Redirect(serde_json::from_value(config)?),
            _ => return Err(NodeDecodeError::UnknownKind("action", name.to_string())),
        };
        Ok(kind)
    }

    pub fn name(&self) -> &'static str {
        match self {
            ActionKind::ReplaceText(_) => "Replace Text",
            ActionKind::ReplaceImage(_) => "Replace Image",
            ActionKind::HideElement(_) => "Hide Element",
            ActionKind::ShowElement(_) => "Show Element",
            ActionKind::ModifyCss(_) => "Modify CSS",
            ActionKind::AddClass(_) => "Add Class",
            ActionKind::RemoveClass(_) => "Remove Class",
            ActionKind::DisplayOverlay(_) => "Display Overlay",
            ActionKind::Redirect(_) => "Redirect",
        }
    }

    pub fn is_text_related(&self) -> bool {
        matches!(self, ActionKind::ReplaceText(_))
    }

    pub fn target(&self) -> Option<&ElementTarget> {
        match self {
            ActionKind::ReplaceText(c) => Some(&c.target),
            ActionKind::ReplaceImage(c) => Some(&c.target),
            ActionKind::HideElement(c) | ActionKind::ShowElement(c) => Some(&c.target),
            ActionKind::ModifyCss(c) => Some(&c.target),
            ActionKind::AddClass(c) | ActionKind::RemoveClass(c) => Some(&c.target),
            ActionKind::DisplayOverlay(_) | ActionKind::Redirect(_) => None,
        }
    }
}

mod lenient {
    use serde::de::Error;
    use serde::{Deserialize, Deserializer};

    #[derive(Deserialize)]
    #[serde(untagged)]
    enum NumberOrString {
        Number(f64),
        Text(String),
    }

    pub fn number<'de, D: Deserializer<'de>>(deserializer: D) -> Result<f64, D::Error> {
        match NumberOrString::deserialize(deserializer)? {
            NumberOrString::Number(n) => Ok(n),
            NumberOrString::Text(s) => s.trim().parse().map_err(D::Error::custom),
        }
    }

    pub fn count<'de, D: Deserializer<'de>>(deserializer: D) -> Result<u32, D::Error> {
        let n = number(deserializer)?;
        if n < 0.0 || n.fract() != 0.0 {
            return Err(D::Error::custom(format!("expected a whole count, got {}", n)));
        }
        Ok(n as u32)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeviceType {
    Mobile,
    Tablet,
    Desktop,
}

impl fmt::Display for DeviceType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            DeviceType::Mobile => "mobile",
            DeviceType::Tablet => "tablet",
            DeviceType::Desktop => "desktop",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeviceTypeConfig {
    pub device_type: DeviceType,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum UtmOperator {
    Equals,
    Contains,
    Exists,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UtmConfig {
    #[serde(alias = "parameterName")]
    pub parameter: String,
    #[serde(default = "UtmConfig::default_operator")]
    pub operator: UtmOperator,
    #[serde(default)]
    pub value: Option<String>,
}

impl UtmConfig {
    fn default_operator() -> UtmOperator {
        UtmOperator::Equals
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VisitCountConfig {
    #[serde(deserialize_with = "lenient::count")]
    pub visit_count: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TimeUnit {
    #[default]
    Seconds,
    Minutes,
}

impl TimeUnit {
    pub fn to_seconds(self, value: f64) -> f64 {
        match self {
            TimeUnit::Seconds => value,
            TimeUnit::Minutes => value * 60.0,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TimeOnPageConfig {
    #[serde(deserialize_with = "lenient::number")]
    pub duration: f64,
    #[serde(default)]
    pub unit: TimeUnit,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ScrollDepthConfig {
    #[serde(deserialize_with = "lenient::number")]
    pub percentage: f64,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ElementSelectorConfig {
    pub selector: String,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VisibilityTriggerConfig {
    pub selector: String,
    /// Percentage of the element that must be in view (0-100).
    #[serde(
        default = "VisibilityTriggerConfig::default_threshold",
        deserialize_with = "lenient::number"
    )]
    pub threshold: f64,
}

impl VisibilityTriggerConfig {
    fn default_threshold() -> f64 {
        50.0
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HoverConfig {
    pub selector: String,
    /// Dwell time in milliseconds. Only enforced when the engine is configured
    /// with `hover.enforce_dwell`.
    #[serde(default, deserialize_with = "lenient::number")]
    pub hover_duration: f64,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InactivityConfig {
    #[serde(alias = "inactivityTime", deserialize_with = "lenient::number")]
    pub duration: f64,
    #[serde(default)]
    pub unit: TimeUnit,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum GeoField {
    Country,
    CountryCode,
    Region,
    City,
    Timezone,
    Isp,
    IpType,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum GeoOperator {
    Equals,
    Contains,
    Excludes,
    Exists,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GeolocationConfig {
    pub field: GeoField,
    #[serde(default = "GeolocationConfig::default_operator")]
    pub operator: GeoOperator,
    /// Comma separated list of target values.
    #[serde(default)]
    pub values: String,
}

impl GeolocationConfig {
    fn default_operator() -> GeoOperator {
        GeoOperator::Equals
    }

    pub fn target_values(&self) -> Vec<String> {
        self.values
            .split(',')
            .map(|v| v.trim().to_lowercase())
            .filter(|v| !v.is_empty())
            .collect()
    }
}

/// One candidate CSS selector for a logical element, produced at authoring time.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SelectorStrategy {
    pub selector: String,
    #[serde(default, rename = "type", alias = "kind")]
    pub kind: SelectorKind,
    #[serde(default = "SelectorStrategy::default_reliability")]
    pub reliability: f64,
    #[serde(default)]
    pub is_unique: bool,
    #[serde(default)]
    pub description: String,
}

impl SelectorStrategy {
    fn default_reliability() -> f64 {
        0.5
    }

    pub fn from_selector(selector: impl Into<String>) -> Self {
        Self {
            selector: selector.into(),
            kind: SelectorKind::Other,
            reliability: Self::default_reliability(),
            is_unique: false,
            description: String::new(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(from = "String")]
pub enum SelectorKind {
    Id,
    DataAttribute,
    Class,
    Attribute,
    NthOfType,
    Path,
    #[default]
    Other,
}

impl From<String> for SelectorKind {
    fn from(value: String) -> Self {
        match normalize_kind(&value).as_str() {
            "id" => SelectorKind::Id,
            "dataattribute" | "data" | "testid" => SelectorKind::DataAttribute,
            "class" => SelectorKind::Class,
            "attribute" => SelectorKind::Attribute,
            "nthoftype" | "nthchild" => SelectorKind::NthOfType,
            "path" | "dompath" => SelectorKind::Path,
            _ => SelectorKind::Other,
        }
    }
}

/// Hints used to pick one element when a selector matches several.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DisambiguationContext {
    #[serde(default)]
    pub original_text: Option<String>,
    #[serde(default)]
    pub text_content: Option<String>,
    #[serde(default)]
    pub position_index: Option<usize>,
    #[serde(default)]
    pub attributes: Option<HashMap<String, String>>,
    #[serde(default)]
    pub parent_selector: Option<String>,
}

/// Where an action applies: a primary selector plus the ranked strategies and
/// disambiguation hints captured at authoring time.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ElementTarget {
    pub selector: String,
    #[serde(default, alias = "selectors")]
    pub selector_strategies: Vec<SelectorStrategy>,
    #[serde(default, alias = "context")]
    pub disambiguation: DisambiguationContext,
}

impl ElementTarget {
    pub fn new(selector: impl Into<String>) -> Self {
        Self {
            selector: selector.into(),
            selector_strategies: Vec::new(),
            disambiguation: DisambiguationContext::default(),
        }
    }

    /// Strategies ordered most reliable first; never empty, falling back to
    /// the primary selector.
    pub fn strategies(&self) -> Cow<'_, [SelectorStrategy]> {
        if self.selector_strategies.is_empty() {
            return Cow::Owned(vec![SelectorStrategy::from_selector(self.selector.clone())]);
        }
        let mut ranked = self.selector_strategies.clone();
        ranked.sort_by(|a, b| {
            b.reliability
                .partial_cmp(&a.reliability)
                .unwrap_or(std::cmp::Ordering::Equal)
        });
        Cow::Owned(ranked)
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReplaceTextConfig {
    #[serde(flatten)]
    pub target: ElementTarget,
    pub new_text: String,
    #[serde(default)]
    pub original_text: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReplaceImageConfig {
    #[serde(flatten)]
    pub target: ElementTarget,
    #[serde(alias = "imageUrl")]
    pub new_image_url: String,
    #[serde(default)]
    pub alt_text: Option<String>,
    #[serde(default)]
    pub original_image_url: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Animation {
    #[default]
    None,
    Fade,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ToggleConfig {
    #[serde(flatten)]
    pub target: ElementTarget,
    #[serde(default)]
    pub animation: Animation,
    #[serde(default, deserialize_with = "lenient::number")]
    pub delay: f64,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ModifyCssConfig {
    #[serde(flatten)]
    pub target: ElementTarget,
    pub property: String,
    #[serde(default)]
    pub custom_property: Option<String>,
    pub value: String,
}

impl ModifyCssConfig {
    /// The property to set, resolving the "custom" placeholder.
    pub fn effective_property(&self) -> &str {
        match (&*self.property, &self.custom_property) {
            ("custom", Some(custom)) => custom,
            (property, _) => property,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClassConfig {
    #[serde(flatten)]
    pub target: ElementTarget,
    pub class_name: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OverlayPosition {
    #[default]
    Center,
    Top,
    Bottom,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OverlayConfig {
    #[serde(alias = "message")]
    pub content: String,
    #[serde(default)]
    pub position: OverlayPosition,
    #[serde(default = "OverlayConfig::default_background")]
    pub background_color: String,
    #[serde(default = "OverlayConfig::default_text_color")]
    pub text_color: String,
    #[serde(default = "default_true")]
    pub dismissible: bool,
    /// Auto-dismiss after this many milliseconds; zero keeps it open.
    #[serde(default, deserialize_with = "lenient::number")]
    pub duration: f64,
}

impl OverlayConfig {
    fn default_background() -> String {
        "rgba(0, 0, 0, 0.8)".to_string()
    }

    fn default_text_color() -> String {
        "#ffffff".to_string()
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RedirectConfig {
    pub url: String,
    #[serde(default)]
    pub new_tab: bool,
    #[serde(default, deserialize_with = "lenient::number")]
    pub delay: f64,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Connection {
    #[serde(alias = "source")]
    pub source_node_id: String,
    #[serde(alias = "target")]
    pub target_node_id: String,
}

impl Connection {
    pub fn new(source: impl Into<String>, target: impl Into<String>) -> Self {
        Self {
            source_node_id: source.into(),
            target_node_id: target.into(),
        }
    }
}

/// Normalized IP geolocation of the visitor.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Geolocation {
    pub country: String,
    pub country_code: String,
    pub region: String,
    pub city: String,
    pub timezone: String,
    pub latitude: Option<f64>,
    pub longitude: Option<f64>,
    pub isp: String,
    pub ip_type: String,
}

impl Geolocation {
    pub fn field(&self, field: GeoField) -> &str {
        match field {
            GeoField::Country => &self.country,
            GeoField::CountryCode => &self.country_code,
            GeoField::Region => &self.region,
            GeoField::City => &self.city,
            GeoField::Timezone => &self.timezone,
            GeoField::Isp => &self.isp,
            GeoField::IpType => &self.ip_type,
        }
    }
}

/// Page-level facts fixed for the lifetime of a page load.
#[derive(Debug, Clone)]
pub struct PageContext {
    pub url: String,
    pub user_agent: String,
    pub device_type: DeviceType,
    pub session_id: String,
    /// Visits to this page, including the current one.
    pub page_visits: u32,
    /// Sessions this visitor has started, including the current one.
    pub stored_visit_count: u32,
    pub geolocation: Option<Geolocation>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ExecutionStatus {
    Success,
    Error,
    Timeout,
}

/// Telemetry for one trigger firing. Built once and never mutated.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecutionRecord {
    pub workflow_id: String,
    pub trigger_id: String,
    pub status: ExecutionStatus,
    pub execution_time_ms: u64,
    pub page_url: String,
    pub session_id: String,
    pub user_agent: String,
    pub device_type: DeviceType,
    pub actions_executed: Vec<ActionOutcome>,
    pub execution_key: String,
    pub timestamp: chrono::DateTime<chrono::Utc>,
}

impl ExecutionRecord {
    pub fn status_for(outcomes: &[ActionOutcome]) -> ExecutionStatus {
        if outcomes.iter().any(|o| o.success) {
            ExecutionStatus::Success
        } else if outcomes.iter().any(|o| o.timed_out()) {
            ExecutionStatus::Timeout
        } else {
            ExecutionStatus::Error
        }
    }
}
