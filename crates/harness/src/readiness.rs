//! Readiness synchronization
//!
//! Map tiles load asynchronously after navigation and after every pan, so a
//! capture is only taken once the page reports it has settled. The page can
//! expose a predicate (polled as a script) or, failing that, the harness waits
//! a fixed settle delay.

use std::fmt;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::time::{sleep, timeout_at, Instant};
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::driver::BrowserSession;
use crate::error::{HarnessError, HarnessResult};

/// Number of polls that fit in one timeout
const POLLS_PER_TIMEOUT: u32 = 50;

const MIN_POLL_INTERVAL: Duration = Duration::from_millis(10);

/// What "ready" means for a page
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReadinessCondition {
    /// Script body returning `true` once rendering has settled
    Script(String),
    /// Fixed delay for pages without a readiness signal
    Settle(#[serde(with = "millis")] Duration),
}

impl ReadinessCondition {
    /// Pick the authoritative condition: a declared predicate always wins,
    /// the settle delay is the fallback.
    pub fn resolve(script: Option<&str>, settle: Duration) -> Self {
        match script {
            Some(expr) if !expr.trim().is_empty() => Self::Script(expr.to_string()),
            _ => Self::Settle(settle),
        }
    }
}

impl fmt::Display for ReadinessCondition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Script(expr) => write!(f, "predicate `{}`", expr),
            Self::Settle(delay) => write!(f, "settle delay of {}ms", delay.as_millis()),
        }
    }
}

/// Poll interval for a given timeout
pub fn poll_interval(timeout: Duration) -> Duration {
    (timeout / POLLS_PER_TIMEOUT).max(MIN_POLL_INTERVAL)
}

/// Block until `condition` holds, the timeout elapses, or `cancel` fires.
///
/// Returns the time spent waiting.
pub async fn wait_until_ready<S>(
    session: &mut S,
    condition: &ReadinessCondition,
    timeout: Duration,
    cancel: &CancellationToken,
) -> HarnessResult<Duration>
where
    S: BrowserSession + ?Sized,
{
    let start = Instant::now();

    match condition {
        ReadinessCondition::Settle(delay) => {
            if *delay > timeout {
                return Err(HarnessError::ReadinessTimeout {
                    condition: condition.to_string(),
                    waited: timeout,
                });
            }
            tokio::select! {
                _ = sleep(*delay) => Ok(start.elapsed()),
                _ = cancel.cancelled() => Err(HarnessError::Cancelled),
            }
        }
        ReadinessCondition::Script(script) => {
            let deadline = start + timeout;
            let interval = poll_interval(timeout);
            let mut polls = 0u32;

            loop {
                if cancel.is_cancelled() {
                    return Err(HarnessError::Cancelled);
                }

                polls += 1;
                // A hung script call is cut off at the deadline.
                let value = tokio::select! {
                    value = timeout_at(deadline, session.execute_script(script)) => match value {
                        Ok(value) => value?,
                        Err(_) => break,
                    },
                    _ = cancel.cancelled() => return Err(HarnessError::Cancelled),
                };

                // A poll that finished after the deadline does not count.
                if Instant::now() > deadline {
                    break;
                }
                if value.as_bool() == Some(true) {
                    debug!("Page ready after {} poll(s)", polls);
                    return Ok(start.elapsed());
                }

                let now = Instant::now();
                if now + interval > deadline {
                    // No room for another poll.
                    sleep(deadline.saturating_duration_since(now)).await;
                    break;
                }

                tokio::select! {
                    _ = sleep(interval) => {}
                    _ = cancel.cancelled() => return Err(HarnessError::Cancelled),
                }
            }

            Err(HarnessError::ReadinessTimeout {
                condition: condition.to_string(),
                waited: start.elapsed(),
            })
        }
    }
}

mod millis {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(d.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        u64::deserialize(d).map(Duration::from_millis)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::case::Viewport;
    use crate::driver::simulated::{PageModel, SimulatedFactory};
    use crate::driver::{Engine, SessionFactory};

    #[test]
    fn test_poll_interval_scales_with_timeout() {
        assert_eq!(poll_interval(Duration::from_secs(5)), Duration::from_millis(100));
        assert_eq!(poll_interval(Duration::from_millis(100)), MIN_POLL_INTERVAL);
    }

    #[test]
    fn test_resolve_prefers_predicate() {
        let settle = Duration::from_secs(1);
        assert_eq!(
            ReadinessCondition::resolve(Some("return true;"), settle),
            ReadinessCondition::Script("return true;".to_string())
        );
        assert_eq!(
            ReadinessCondition::resolve(None, settle),
            ReadinessCondition::Settle(settle)
        );
        assert_eq!(
            ReadinessCondition::resolve(Some("  "), settle),
            ReadinessCondition::Settle(settle)
        );
    }

    async fn open(model: PageModel) -> Box<dyn BrowserSession> {
        let factory = SimulatedFactory::new(model);
        let mut session = factory
            .open(Engine::Firefox, Viewport::new(64, 48))
            .await
            .unwrap();
        session.navigate("http://sim/osmLayer/index.html").await.unwrap();
        session
    }

    #[tokio::test(start_paused = true)]
    async fn test_predicate_satisfied_after_tiles_load() {
        let model = PageModel::default().with_load_delay(Duration::from_millis(300));
        let script = model.ready_script().to_string();
        let mut session = open(model).await;

        let waited = wait_until_ready(
            session.as_mut(),
            &ReadinessCondition::Script(script),
            Duration::from_secs(5),
            &CancellationToken::new(),
        )
        .await
        .unwrap();
        assert!(waited < Duration::from_secs(5));
    }

    #[tokio::test(start_paused = true)]
    async fn test_never_ready_times_out() {
        let model = PageModel::default().never_ready();
        let script = model.ready_script().to_string();
        let mut session = open(model).await;

        let err = wait_until_ready(
            session.as_mut(),
            &ReadinessCondition::Script(script),
            Duration::from_millis(500),
            &CancellationToken::new(),
        )
        .await
        .unwrap_err();
        assert!(matches!(err, HarnessError::ReadinessTimeout { .. }));
    }

    #[tokio::test(start_paused = true)]
    async fn test_settle_longer_than_timeout_fails() {
        let mut session = open(PageModel::default()).await;
        let err = wait_until_ready(
            session.as_mut(),
            &ReadinessCondition::Settle(Duration::from_secs(2)),
            Duration::from_secs(1),
            &CancellationToken::new(),
        )
        .await
        .unwrap_err();
        assert!(matches!(err, HarnessError::ReadinessTimeout { .. }));
    }

    /// Session whose script calls never complete
    struct HungSession;

    #[async_trait::async_trait]
    impl BrowserSession for HungSession {
        fn engine(&self) -> Engine {
            Engine::Firefox
        }

        fn viewport(&self) -> Viewport {
            Viewport::new(64, 48)
        }

        async fn navigate(&mut self, _url: &str) -> HarnessResult<()> {
            Ok(())
        }

        async fn resize(&mut self, _viewport: Viewport) -> HarnessResult<()> {
            Ok(())
        }

        async fn execute_script(&mut self, _script: &str) -> HarnessResult<serde_json::Value> {
            std::future::pending().await
        }

        async fn element_rect(
            &mut self,
            _selector: &str,
        ) -> HarnessResult<Option<crate::driver::Rect>> {
            Ok(None)
        }

        async fn dispatch_pointer(
            &mut self,
            _actions: &[crate::driver::PointerAction],
        ) -> HarnessResult<()> {
            Ok(())
        }

        async fn screenshot_png(&mut self) -> HarnessResult<Vec<u8>> {
            std::future::pending().await
        }

        async fn close(&mut self) -> HarnessResult<()> {
            Ok(())
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_hung_script_call_still_times_out() {
        let mut session = HungSession;
        let result = tokio::time::timeout(
            Duration::from_secs(60),
            wait_until_ready(
                &mut session,
                &ReadinessCondition::Script("return window.testComplete === true;".to_string()),
                Duration::from_secs(1),
                &CancellationToken::new(),
            ),
        )
        .await
        .expect("wait must end at its own deadline");

        match result {
            Err(HarnessError::ReadinessTimeout { waited, .. }) => {
                assert_eq!(waited, Duration::from_secs(1))
            }
            other => panic!("expected readiness timeout, got {:?}", other),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancellation_aborts_wait() {
        let model = PageModel::default().never_ready();
        let script = model.ready_script().to_string();
        let mut session = open(model).await;
        let cancel = CancellationToken::new();
        cancel.cancel();

        let err = wait_until_ready(
            session.as_mut(),
            &ReadinessCondition::Script(script),
            Duration::from_secs(5),
            &cancel,
        )
        .await
        .unwrap_err();
        assert!(matches!(err, HarnessError::Cancelled));
    }
}
