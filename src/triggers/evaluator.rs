use crate::core::config::DedupConfig;
use crate::state::{EngineState, TriggerCacheKey};
use crate::triggers::PageEvent;
use crate::types::{
    DeviceTypeConfig, GeoOperator, GeolocationConfig, PageContext, TriggerKind, TriggerNode,
    UtmConfig, UtmOperator,
};
use std::time::Duration;
use tokio::time::Instant;
use tracing::debug;
use url::Url;

/// Decides whether a trigger fires for an event.
///
/// Each trigger kind has a pure predicate over the event and page context.
/// Non-immediate kinds are then passed through the trigger cache, and clicks
/// through the shorter click cache as well.
#[derive(Debug, Clone)]
pub struct TriggerEvaluator {
    trigger_window: Duration,
    click_window: Duration,
}

impl TriggerEvaluator {
    pub fn new(dedup: &DedupConfig) -> Self {
        Self {
            trigger_window: dedup.trigger_window(),
            click_window: dedup.click_window(),
        }
    }

    pub fn evaluate(
        &self,
        trigger: &TriggerNode,
        event: &PageEvent,
        page: &PageContext,
        state: &mut EngineState,
        now: Instant,
    ) -> bool {
        if !matches_condition(&trigger.kind, event, page) {
            return false;
        }

        if trigger.kind.is_immediate() {
            return true;
        }

        if let (TriggerKind::ElementClick(config), PageEvent::Click { selector, .. }) =
            (&trigger.kind, event)
        {
            if !state.try_register_click(selector, &config.selector, now, self.click_window) {
                debug!(trigger = %trigger.id, selector = %selector, "Click repeat suppressed");
                return false;
            }
        }

        let key = TriggerCacheKey {
            trigger_id: trigger.id.clone(),
            trigger_type: trigger.kind.name(),
            event_type: event.event_type(),
        };
        if !state.try_fire_trigger(key, now, self.trigger_window) {
            debug!(
                trigger = %trigger.id,
                kind = trigger.kind.name(),
                "Trigger already fired within dedup window"
            );
            return false;
        }

        true
    }
}

/// The event kind a trigger listens to.
pub fn listens_to(kind: &TriggerKind) -> &'static str {
    match kind {
        TriggerKind::DeviceType(_)
        | TriggerKind::UtmParameters(_)
        | TriggerKind::PageVisits(_)
        | TriggerKind::RepeatVisitor(_)
        | TriggerKind::Geolocation(_) => "page_load",
        TriggerKind::TimeOnPage(_) => "time_on_page",
        TriggerKind::ScrollDepth(_) => "scroll",
        TriggerKind::ElementClick(_) => "click",
        TriggerKind::ElementVisibility(_) => "element_visible",
        TriggerKind::ElementHover(_) => "hover",
        TriggerKind::UserInactivity(_) => "inactivity",
        TriggerKind::ExitIntent => "exit_intent",
    }
}

/// Pure condition check, ignoring any dedup state.
pub fn matches_condition(kind: &TriggerKind, event: &PageEvent, page: &PageContext) -> bool {
    if listens_to(kind) != event.event_type() {
        return false;
    }

    match (kind, event) {
        (TriggerKind::DeviceType(config), _) => device_matches(config, page),
        (TriggerKind::UtmParameters(config), _) => utm_matches(config, &page.url),
        (TriggerKind::PageVisits(config), _) => page.page_visits >= config.visit_count,
        (TriggerKind::RepeatVisitor(config), _) => page.stored_visit_count >= config.visit_count,
        (TriggerKind::Geolocation(config), _) => geolocation_matches(config, page),
        (TriggerKind::TimeOnPage(config), PageEvent::TimeOnPage { seconds }) => {
            *seconds >= config.unit.to_seconds(config.duration)
        }
        (TriggerKind::ScrollDepth(config), PageEvent::Scroll { percentage }) => {
            *percentage >= config.percentage
        }
        (
            TriggerKind::ElementClick(config),
            PageEvent::Click {
                selector,
                matched_selector,
            },
        ) => *selector == config.selector || matched_selector.as_deref() == Some(config.selector.as_str()),
        (
            TriggerKind::ElementVisibility(config),
            PageEvent::ElementVisible {
                selector,
                visibility_percentage,
            },
        ) => *selector == config.selector && *visibility_percentage >= config.threshold,
        (TriggerKind::ElementHover(config), PageEvent::Hover { selector }) => {
            *selector == config.selector
        }
        (TriggerKind::UserInactivity(config), PageEvent::Inactivity { idle_seconds }) => {
            *idle_seconds >= config.unit.to_seconds(config.duration)
        }
        (TriggerKind::ExitIntent, PageEvent::ExitIntent { mouse_y }) => *mouse_y <= 0.0,
        _ => false,
    }
}

fn device_matches(config: &DeviceTypeConfig, page: &PageContext) -> bool {
    page.device_type == config.device_type
}

fn utm_matches(config: &UtmConfig, page_url: &str) -> bool {
    let Ok(url) = Url::parse(page_url) else {
        return false;
    };
    let value = url
        .query_pairs()
        .find(|(k, _)| *k == config.parameter)
        .map(|(_, v)| v.into_owned());

    match (config.operator, value) {
        (UtmOperator::Exists, Some(_)) => true,
        (UtmOperator::Equals, Some(actual)) => config.value.as_deref() == Some(actual.as_str()),
        (UtmOperator::Contains, Some(actual)) => config
            .value
            .as_deref()
            .is_some_and(|expected| actual.contains(expected)),
        (_, None) => false,
    }
}

fn geolocation_matches(config: &GeolocationConfig, page: &PageContext) -> bool {
    let Some(geo) = &page.geolocation else {
        return false;
    };
    let actual = geo.field(config.field).trim().to_lowercase();
    let targets = config.target_values();

    match config.operator {
        GeoOperator::Exists => !actual.is_empty(),
        GeoOperator::Equals => targets.iter().any(|t| *t == actual),
        GeoOperator::Contains => {
            !actual.is_empty() && targets.iter().any(|t| actual.contains(t.as_str()))
        }
        GeoOperator::Excludes => {
            !actual.is_empty() && !targets.iter().any(|t| actual.contains(t.as_str()))
        }
    }
}
