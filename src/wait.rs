//! Waiting on the page.
//!
//! [`wait_until`] is the one primitive: it re-runs a check immediately, on
//! every DOM mutation and on a poll tick, until the check yields a value, the
//! timeout elapses or the engine shuts down. Element waits and page-stability
//! waits are both built on it.

use crate::core::config::{EngineConfig, HeavyPageConfig, TimeoutConfig};
use crate::core::{DomEvent, DomPort};
use crate::errors::{EngineError, Result};
use std::time::Duration;
use tokio::sync::broadcast::{self, error::RecvError};
use tokio::time::{interval_at, sleep, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// What woke the check up.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitSignal {
    Initial,
    Poll,
    Mutation,
}

pub async fn wait_until<T, F>(
    events: &mut broadcast::Receiver<DomEvent>,
    timeout: Duration,
    poll_interval: Duration,
    cancel: &CancellationToken,
    mut check: F,
) -> Result<T>
where
    F: FnMut(WaitSignal) -> Option<T>,
{
    if cancel.is_cancelled() {
        return Err(EngineError::ShutDown);
    }
    if let Some(found) = check(WaitSignal::Initial) {
        return Ok(found);
    }

    let deadline = sleep(timeout);
    tokio::pin!(deadline);
    let mut ticker = interval_at(Instant::now() + poll_interval, poll_interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let mut events_open = true;

    loop {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(EngineError::ShutDown),
            _ = &mut deadline => {
                return Err(EngineError::TimeoutError(format!(
                    "condition not met within {}ms",
                    timeout.as_millis()
                )));
            }
            received = events.recv(), if events_open => match received {
                Ok(DomEvent::Mutation) | Err(RecvError::Lagged(_)) => {
                    if let Some(found) = check(WaitSignal::Mutation) {
                        return Ok(found);
                    }
                }
                Ok(_) => {}
                Err(RecvError::Closed) => events_open = false,
            },
            _ = ticker.tick() => {
                if let Some(found) = check(WaitSignal::Poll) {
                    return Ok(found);
                }
            }
        }
    }
}

/// Timeout multiplier for the current page: `timeout_factor` on heavy pages, 1 otherwise.
pub fn timeout_factor<D: DomPort + ?Sized>(dom: &D, heavy: &HeavyPageConfig) -> f64 {
    let weight = dom.page_weight();
    let is_heavy = weight.scripts > heavy.script_threshold
        || weight.images > heavy.image_threshold
        || weight.elements > heavy.element_threshold;
    if is_heavy {
        debug!(
            scripts = weight.scripts,
            images = weight.images,
            elements = weight.elements,
            "Heavy page detected, extending waits"
        );
        heavy.timeout_factor
    } else {
        1.0
    }
}

/// Wait until the DOM has been quiet for `stability_quiet_ms` and no images
/// are loading. Returns false if the page never settled within `stability_max_ms`.
pub async fn wait_for_page_stability<D: DomPort + ?Sized>(
    dom: &D,
    timeouts: &TimeoutConfig,
    cancel: &CancellationToken,
) -> bool {
    let mut events = dom.subscribe();
    let quiet = Duration::from_millis(timeouts.stability_quiet_ms);
    let poll = timeouts.poll_interval().min(quiet.max(Duration::from_millis(1)));
    let mut last_change = Instant::now();

    let settled = wait_until(
        &mut events,
        Duration::from_millis(timeouts.stability_max_ms),
        poll,
        cancel,
        |signal| {
            if signal == WaitSignal::Mutation {
                last_change = Instant::now();
                return None;
            }
            (last_change.elapsed() >= quiet && dom.page_weight().pending_images == 0).then_some(())
        },
    )
    .await;

    settled.is_ok()
}

/// Wait for `find` to locate something, retrying with the configured policy.
///
/// Each attempt gets a longer timeout; between attempts the waiter backs off
/// and lets the page settle. Only transient failures are retried.
pub async fn wait_for_element<D, T, F>(
    dom: &D,
    config: &EngineConfig,
    cancel: &CancellationToken,
    mut find: F,
) -> Result<T>
where
    D: DomPort + ?Sized,
    F: FnMut() -> Option<T>,
{
    let policy = config.retry;
    let factor = timeout_factor(dom, &config.heavy_page);
    let mut last_error = None;

    for attempt in 0..policy.max_attempts {
        let mut events = dom.subscribe();
        let timeout = policy.timeout_for(attempt, factor);

        match wait_until(
            &mut events,
            timeout,
            config.timeouts.poll_interval(),
            cancel,
            |_| find(),
        )
        .await
        {
            Ok(found) => return Ok(found),
            Err(e) if e.is_transient() => {
                debug!(attempt = attempt + 1, max = policy.max_attempts, "Element wait failed: {}", e);
                last_error = Some(e);
            }
            Err(e) => return Err(e),
        }

        if attempt + 1 < policy.max_attempts {
            tokio::select! {
                _ = cancel.cancelled() => return Err(EngineError::ShutDown),
                _ = sleep(policy.backoff_for(attempt, factor)) => {}
            }
            wait_for_page_stability(dom, &config.timeouts, cancel).await;
        }
    }

    Err(last_error.unwrap_or_else(|| EngineError::TimeoutError("no attempts configured".to_string())))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::config::RetryPolicy;
    use crate::dom::VirtualDom;
    use std::sync::Arc;

    fn quick_config() -> EngineConfig {
        EngineConfig {
            retry: RetryPolicy {
                max_attempts: 2,
                base_timeout_ms: 1000,
                backoff_multiplier: 1.5,
            },
            ..Default::default()
        }
    }

    #[tokio::test(start_paused = true)]
    async fn resolves_immediately_when_present() {
        let dom = VirtualDom::from_html("<div class='banner'>hi</div>");
        let cancel = CancellationToken::new();
        let found = wait_for_element(&dom, &quick_config(), &cancel, || dom.first(".banner")).await;
        assert!(found.is_ok());
    }

    #[tokio::test(start_paused = true)]
    async fn wakes_on_mutation() {
        let dom = Arc::new(VirtualDom::from_html("<main></main>"));
        let cancel = CancellationToken::new();

        let writer = dom.clone();
        tokio::spawn(async move {
            sleep(Duration::from_millis(400)).await;
            let main = writer.first("main").unwrap();
            writer.set_inner_html(main, "<div class='late'>late</div>");
        });

        let started = Instant::now();
        let found = wait_for_element(dom.as_ref(), &quick_config(), &cancel, || dom.first(".late"))
            .await
            .unwrap();
        assert_eq!(dom.text(found), "late");
        assert!(started.elapsed() < Duration::from_millis(1000));
    }

    #[tokio::test(start_paused = true)]
    async fn gives_up_after_policy_is_exhausted() {
        let dom = VirtualDom::from_html("<main></main>");
        let cancel = CancellationToken::new();
        let err = wait_for_element(&dom, &quick_config(), &cancel, || dom.first(".never"))
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::TimeoutError(_)));
    }

    #[tokio::test(start_paused = true)]
    async fn cancellation_stops_the_wait() {
        let dom = VirtualDom::from_html("<main></main>");
        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            sleep(Duration::from_millis(100)).await;
            trigger.cancel();
        });
        let err = wait_for_element(&dom, &quick_config(), &cancel, || dom.first(".never"))
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::ShutDown));
    }

    #[tokio::test(start_paused = true)]
    async fn stability_waits_for_pending_images() {
        let dom = Arc::new(VirtualDom::from_html("<img src='/a.png'>"));
        dom.set_pending_images(1);
        let loader = dom.clone();
        tokio::spawn(async move {
            sleep(Duration::from_millis(800)).await;
            loader.set_pending_images(0);
        });

        let started = Instant::now();
        let settled =
            wait_for_page_stability(dom.as_ref(), &TimeoutConfig::default(), &CancellationToken::new())
                .await;
        assert!(settled);
        assert!(started.elapsed() >= Duration::from_millis(800));
    }

    #[test]
    fn heavy_pages_scale_timeouts() {
        let html: String = (0..5).map(|i| format!("<img src='/{}.png'>", i)).collect();
        let dom = VirtualDom::from_html(&html);
        let heavy = HeavyPageConfig {
            image_threshold: 3,
            ..Default::default()
        };
        assert_eq!(timeout_factor(&dom, &heavy), heavy.timeout_factor);
        assert_eq!(timeout_factor(&dom, &HeavyPageConfig::default()), 1.0);
    }
}
