//! Bounded polling and HTTP probe evaluation.

use crate::client::{ExecOptions, Sandbox};
use crate::config::ProbeSpec;
use crate::shell::{self, ProbeResponse};
use std::future::Future;
use std::time::Duration;
use tokio::time::Instant;
use tracing::debug;

/// Upper bound for a single curl call inside the sandbox.
const PROBE_MAX_TIME_SECS: u64 = 5;

/// Result of [`poll_until`].
#[derive(Debug)]
pub enum PollOutcome<T> {
    Ready {
        value: T,
        attempts: u32,
        elapsed: Duration,
    },
    GaveUp {
        last_error: String,
        attempts: u32,
        elapsed: Duration,
    },
}

impl<T> PollOutcome<T> {
    pub fn is_ready(&self) -> bool {
        matches!(self, PollOutcome::Ready { .. })
    }

    pub fn attempts(&self) -> u32 {
        match self {
            PollOutcome::Ready { attempts, .. } | PollOutcome::GaveUp { attempts, .. } => {
                *attempts
            }
        }
    }
}

/// Run `attempt` until it returns `Ok` or `timeout` has elapsed.
///
/// At least one attempt is always made. Sleeps never overshoot the deadline.
pub async fn poll_until<T, F, Fut>(
    timeout: Duration,
    interval: Duration,
    mut attempt: F,
) -> PollOutcome<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, String>>,
{
    let started = Instant::now();
    let deadline = started + timeout;
    let mut attempts = 0;
    loop {
        attempts += 1;
        match attempt().await {
            Ok(value) => {
                return PollOutcome::Ready {
                    value,
                    attempts,
                    elapsed: started.elapsed(),
                }
            }
            Err(reason) => {
                let now = Instant::now();
                if now >= deadline {
                    return PollOutcome::GaveUp {
                        last_error: reason,
                        attempts,
                        elapsed: started.elapsed(),
                    };
                }
                debug!(attempts, %reason, "condition not met yet");
                tokio::time::sleep(interval.min(deadline - now)).await;
            }
        }
    }
}

/// Check a response against the probe's expectations. Without an explicit
/// status expectation the probe wants HTTP 200.
pub fn evaluate(spec: &ProbeSpec, response: &ProbeResponse) -> Result<(), String> {
    if response.status == 0 {
        return Err(format!("no response from {}", spec.url));
    }
    let expected_status = spec.expect_status.unwrap_or(200);
    if response.status != expected_status {
        return Err(format!(
            "{} returned {} (expected {expected_status})",
            spec.url, response.status
        ));
    }
    if let Some(needle) = &spec.expect_body {
        if !response.body.contains(needle.as_str()) {
            return Err(format!("{} body does not contain {needle:?}", spec.url));
        }
    }
    Ok(())
}

/// Issue one probe from inside the sandbox.
pub async fn probe_once(sandbox: &dyn Sandbox, spec: &ProbeSpec) -> Result<ProbeResponse, String> {
    let command = shell::http_probe(&spec.url, PROBE_MAX_TIME_SECS);
    let options = ExecOptions {
        timeout: Some(Duration::from_secs(PROBE_MAX_TIME_SECS + 5)),
        ..ExecOptions::default()
    };
    let result = sandbox
        .exec(&command, &options)
        .await
        .map_err(|err| format!("probe command failed: {err}"))?;
    let response = shell::parse_probe_output(&result.output);
    evaluate(spec, &response)?;
    Ok(response)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn probe(expect_status: Option<u16>, expect_body: Option<&str>) -> ProbeSpec {
        ProbeSpec {
            name: "health".to_string(),
            url: "http://localhost:3001/health".to_string(),
            expect_status,
            expect_body: expect_body.map(str::to_string),
            log: None,
        }
    }

    fn response(status: u16, body: &str) -> ProbeResponse {
        ProbeResponse {
            status,
            body: body.to_string(),
        }
    }

    #[test]
    fn default_expectation_is_200() {
        let spec = probe(None, None);
        assert!(evaluate(&spec, &response(200, "")).is_ok());
        assert!(evaluate(&spec, &response(404, "")).is_err());
        assert!(evaluate(&spec, &response(0, "")).unwrap_err().contains("no response"));
    }

    #[test]
    fn body_substring_must_match() {
        let spec = probe(None, Some("\"status\":\"healthy\""));
        assert!(evaluate(&spec, &response(200, "{\"status\":\"healthy\",\"port\":3001}")).is_ok());
        let err = evaluate(&spec, &response(200, "{\"status\":\"starting\"}")).unwrap_err();
        assert!(err.contains("does not contain"));
    }

    #[test]
    fn explicit_status_overrides_default() {
        let spec = probe(Some(404), None);
        assert!(evaluate(&spec, &response(404, "not found")).is_ok());
        assert!(evaluate(&spec, &response(200, "ok")).is_err());
    }

    #[tokio::test]
    async fn poll_returns_once_condition_holds() {
        let calls = AtomicU32::new(0);
        let outcome = poll_until(Duration::from_secs(5), Duration::from_millis(5), || {
            let n = calls.fetch_add(1, Ordering::SeqCst) + 1;
            async move {
                if n >= 3 {
                    Ok(n)
                } else {
                    Err("port closed".to_string())
                }
            }
        })
        .await;
        match outcome {
            PollOutcome::Ready { value, attempts, .. } => {
                assert_eq!(value, 3);
                assert_eq!(attempts, 3);
            }
            PollOutcome::GaveUp { .. } => panic!("expected ready"),
        }
    }

    #[tokio::test]
    async fn poll_gives_up_at_deadline() {
        let outcome: PollOutcome<()> =
            poll_until(Duration::from_millis(60), Duration::from_millis(10), || async {
                Err("connection refused".to_string())
            })
            .await;
        assert!(!outcome.is_ready());
        assert!(outcome.attempts() >= 2);
        match outcome {
            PollOutcome::GaveUp {
                last_error,
                elapsed,
                ..
            } => {
                assert_eq!(last_error, "connection refused");
                assert!(elapsed >= Duration::from_millis(60));
                assert!(elapsed < Duration::from_secs(2));
            }
            PollOutcome::Ready { .. } => panic!("expected give up"),
        }
    }

    #[tokio::test]
    async fn zero_timeout_still_attempts_once() {
        let outcome = poll_until(Duration::ZERO, Duration::from_millis(10), || async {
            Ok::<_, String>("up")
        })
        .await;
        assert!(outcome.is_ready());
        assert_eq!(outcome.attempts(), 1);
    }
}
