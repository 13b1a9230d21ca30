//! Visitor bookkeeping kept in page storage: the session id, per-page visit
//! counts and the number of sessions this visitor has started.

use crate::core::DomPort;
use crate::types::DeviceType;
use regex::Regex;
use std::sync::OnceLock;
use tracing::debug;
use url::Url;
use uuid::Uuid;

pub const SESSION_ID_KEY: &str = "pageflow_session_id";
pub const SESSION_COUNT_KEY: &str = "pageflow_visit_count";
const PAGE_VISITS_PREFIX: &str = "pageflow_page_visits:";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VisitorInfo {
    pub session_id: String,
    pub page_visits: u32,
    pub stored_visit_count: u32,
    pub device_type: DeviceType,
}

fn tablet_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        Regex::new(r"(?i)ipad|tablet|playbook|silk|kindle").expect("tablet pattern is valid")
    })
}

fn mobile_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        Regex::new(r"(?i)mobi|iphone|ipod|blackberry|iemobile|opera mini|windows phone")
            .expect("mobile pattern is valid")
    })
}

fn desktop_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        Regex::new(r"(?i)windows nt|macintosh|x11|cros").expect("desktop pattern is valid")
    })
}

/// Classify the device from its user agent, using the viewport width only
/// when the user agent says nothing either way.
pub fn detect_device(user_agent: &str, viewport_width: u32) -> DeviceType {
    let is_android = user_agent.to_lowercase().contains("android");

    if tablet_pattern().is_match(user_agent) {
        return DeviceType::Tablet;
    }
    if mobile_pattern().is_match(user_agent) {
        return DeviceType::Mobile;
    }
    if is_android {
        return DeviceType::Tablet;
    }
    if desktop_pattern().is_match(user_agent) || viewport_width == 0 {
        return DeviceType::Desktop;
    }

    match viewport_width {
        w if w < 768 => DeviceType::Mobile,
        w if w < 1024 => DeviceType::Tablet,
        _ => DeviceType::Desktop,
    }
}

/// Counter key for a page: origin and path, ignoring query and fragment.
fn page_key(url: &str) -> String {
    let page = match Url::parse(url) {
        Ok(parsed) => format!("{}{}", parsed.origin().ascii_serialization(), parsed.path()),
        Err(_) => url.to_string(),
    };
    format!("{}{}", PAGE_VISITS_PREFIX, page)
}

fn read_count<D: DomPort + ?Sized>(dom: &D, key: &str) -> u32 {
    dom.local_storage()
        .get(key)
        .and_then(|raw| raw.trim().parse().ok())
        .unwrap_or(0)
}

/// Record this page load. Must run once per page load.
pub fn record_visit<D: DomPort + ?Sized>(dom: &D) -> VisitorInfo {
    let page = dom.page_info();
    let session = dom.session_storage();
    let local = dom.local_storage();

    let (session_id, new_session) = match session.get(SESSION_ID_KEY) {
        Some(id) if !id.is_empty() => (id, false),
        _ => {
            let id = Uuid::new_v4().to_string();
            session.set(SESSION_ID_KEY, &id);
            (id, true)
        }
    };

    let mut stored_visit_count = read_count(dom, SESSION_COUNT_KEY);
    if new_session || stored_visit_count == 0 {
        stored_visit_count += 1;
        local.set(SESSION_COUNT_KEY, &stored_visit_count.to_string());
    }

    let key = page_key(&page.url);
    let page_visits = read_count(dom, &key) + 1;
    local.set(&key, &page_visits.to_string());

    let device_type = detect_device(&page.user_agent, page.viewport_width);
    debug!(
        session = %session_id,
        page_visits,
        sessions = stored_visit_count,
        device = %device_type,
        "Visit recorded"
    );

    VisitorInfo {
        session_id,
        page_visits,
        stored_visit_count,
        device_type,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dom::VirtualDom;

    const IPHONE: &str = "Mozilla/5.0 (iPhone; CPU iPhone OS 17_0 like Mac OS X) AppleWebKit/605.1.15 Mobile/15E148";
    const ANDROID_TABLET: &str = "Mozilla/5.0 (Linux; Android 13; SM-X700) AppleWebKit/537.36 Safari/537.36";
    const ANDROID_PHONE: &str = "Mozilla/5.0 (Linux; Android 14; Pixel 8) AppleWebKit/537.36 Mobile Safari/537.36";

    #[test]
    fn detects_devices_from_user_agent() {
        assert_eq!(detect_device(IPHONE, 1280), DeviceType::Mobile);
        assert_eq!(detect_device(ANDROID_PHONE, 1280), DeviceType::Mobile);
        assert_eq!(detect_device(ANDROID_TABLET, 1280), DeviceType::Tablet);
        assert_eq!(detect_device("Mozilla/5.0 (iPad; CPU OS 17_0)", 1280), DeviceType::Tablet);
        assert_eq!(detect_device("Mozilla/5.0 (Windows NT 10.0; Win64; x64)", 500), DeviceType::Desktop);
    }

    #[test]
    fn ambiguous_agents_fall_back_to_viewport_width() {
        assert_eq!(detect_device("CustomBrowser/1.0", 500), DeviceType::Mobile);
        assert_eq!(detect_device("CustomBrowser/1.0", 900), DeviceType::Tablet);
        assert_eq!(detect_device("CustomBrowser/1.0", 1400), DeviceType::Desktop);
    }

    #[test]
    fn counts_page_visits_and_sessions() {
        let dom = VirtualDom::new().with_url("https://shop.example.com/cart?step=1");

        let first = record_visit(&dom);
        assert_eq!(first.page_visits, 1);
        assert_eq!(first.stored_visit_count, 1);

        dom.navigate("https://shop.example.com/cart?step=2", crate::core::NavigationTarget::SameTab);
        let second = record_visit(&dom);
        assert_eq!(second.session_id, first.session_id);
        assert_eq!(second.page_visits, 2);
        assert_eq!(second.stored_visit_count, 1);

        // A new session keeps local storage but starts a fresh session id.
        dom.session_storage().remove(SESSION_ID_KEY);
        let third = record_visit(&dom);
        assert_ne!(third.session_id, first.session_id);
        assert_eq!(third.stored_visit_count, 2);
        assert_eq!(third.page_visits, 3);
    }
}
