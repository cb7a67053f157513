//! Readiness polling for the notebook server.

use std::time::Duration;

use tokio::time::Instant;
use tracing::debug;

use crate::errors::{ReesError, Result};

/// Status endpoint polled until the server answers.
pub const STATUS_PATH: &str = "/api/status";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReadinessPolicy {
    pub interval: Duration,
    pub timeout: Duration,
}

impl Default for ReadinessPolicy {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(1),
            timeout: Duration::from_secs(30),
        }
    }
}

impl ReadinessPolicy {
    pub fn with_timeout(timeout: Duration) -> Self {
        Self {
            timeout,
            ..Self::default()
        }
    }
}

/// Poll `<base_url>/api/status` with the token until it returns 2xx or the
/// policy's timeout passes.
pub async fn wait_until_ready(base_url: &str, token: &str, policy: ReadinessPolicy) -> Result<()> {
    let url = format!("{}{}", base_url.trim_end_matches('/'), STATUS_PATH);
    let http = reqwest::Client::builder()
        .timeout(policy.interval.max(Duration::from_millis(100)))
        .build()
        .map_err(|e| ReesError::container_with("failed to build readiness client", e))?;
    let deadline = Instant::now() + policy.timeout;
    let mut attempt = 0u32;

    loop {
        attempt += 1;
        match http
            .get(&url)
            .header("Authorization", format!("token {}", token))
            .send()
            .await
        {
            Ok(resp) if resp.status().is_success() => {
                debug!(%url, attempt, "notebook server is ready");
                return Ok(());
            }
            Ok(resp) => debug!(%url, attempt, status = resp.status().as_u16(), "not ready yet"),
            Err(e) => debug!(%url, attempt, "not ready yet: {}", e),
        }

        if Instant::now() + policy.interval > deadline {
            return Err(ReesError::container(format!(
                "notebook server at {} did not become ready within {}s",
                base_url,
                policy.timeout.as_secs_f64()
            )));
        }
        tokio::time::sleep(policy.interval).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::FakeHttp;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn fast(timeout_ms: u64) -> ReadinessPolicy {
        ReadinessPolicy {
            interval: Duration::from_millis(10),
            timeout: Duration::from_millis(timeout_ms),
        }
    }

    #[test]
    fn test_default_policy() {
        let policy = ReadinessPolicy::default();
        assert_eq!(policy.interval, Duration::from_secs(1));
        assert_eq!(policy.timeout, Duration::from_secs(30));
    }

    #[tokio::test]
    async fn test_ready_after_a_few_attempts_with_token() {
        let calls = Arc::new(AtomicU32::new(0));
        let counter = calls.clone();
        let server = FakeHttp::start(move |path, headers| {
            let authorized = headers
                .get("authorization")
                .and_then(|v| v.to_str().ok())
                == Some("token secret");
            if path != STATUS_PATH || !authorized {
                return (403, String::new());
            }
            if counter.fetch_add(1, Ordering::SeqCst) < 2 {
                (503, String::new())
            } else {
                (200, r#"{"started":"now"}"#.into())
            }
        })
        .await;

        wait_until_ready(&server.url(), "secret", fast(2000)).await.unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_times_out_as_container_error() {
        let server = FakeHttp::start(|_, _| (503, String::new())).await;
        let err = wait_until_ready(&server.url(), "t", fast(50)).await.unwrap_err();
        assert!(matches!(err, ReesError::Container { .. }));
    }
}
