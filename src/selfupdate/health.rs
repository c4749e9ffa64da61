//! Post-restart health verification: polls a health endpoint until it
//! reports the target version, or gives up after a fixed retry budget.

use std::time::Duration;

use serde::Deserialize;

use super::cancel::Cancellation;
use super::error::{UpdateError, UpdateResult};
use crate::common::user_agent;

const DEFAULT_INITIAL_WAIT: Duration = Duration::from_secs(5);
const DEFAULT_MAX_RETRIES: u32 = 5;
const DEFAULT_RETRY_INTERVAL: Duration = Duration::from_secs(5);
const HEALTH_REQUEST_TIMEOUT_SECS: u64 = 10;

#[derive(Debug, Deserialize)]
struct HealthResponse {
    ok: bool,
    version: String,
}

pub struct HealthChecker {
    health_url: String,
    initial_wait: Duration,
    max_retries: u32,
    retry_interval: Duration,
}

impl HealthChecker {
    #[must_use]
    pub fn new(health_url: impl Into<String>) -> Self {
        Self {
            health_url: health_url.into(),
            initial_wait: DEFAULT_INITIAL_WAIT,
            max_retries: DEFAULT_MAX_RETRIES,
            retry_interval: DEFAULT_RETRY_INTERVAL,
        }
    }

    #[must_use]
    pub fn with_initial_wait(mut self, initial_wait: Duration) -> Self {
        self.initial_wait = initial_wait;
        self
    }

    #[must_use]
    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    #[must_use]
    pub fn with_retry_interval(mut self, retry_interval: Duration) -> Self {
        self.retry_interval = retry_interval;
        self
    }

    /// Sleeps `initial_wait`, then polls up to `max_retries + 1` total
    /// attempts. Non-matching version and transient 5xx/JSON errors are
    /// both retryable; only cancellation short-circuits.
    pub fn wait_for_health(&self, cancel: &Cancellation, target_version: &str) -> UpdateResult<()> {
        cancel.sleep(self.initial_wait)?;

        let mut last_err = UpdateError::HealthCheckFailed("no attempts made".to_string());

        for attempt in 0..=self.max_retries {
            cancel.check()?;

            match self.poll_once(target_version) {
                Ok(()) => return Ok(()),
                Err(e) => {
                    last_err = e;
                    if attempt < self.max_retries {
                        cancel.sleep(self.retry_interval)?;
                    }
                }
            }
        }

        Err(UpdateError::HealthCheckFailed(last_err.to_string()))
    }

    fn poll_once(&self, target_version: &str) -> UpdateResult<()> {
        let response = minreq::get(&self.health_url)
            .with_header("User-Agent", user_agent())
            .with_timeout(HEALTH_REQUEST_TIMEOUT_SECS)
            .send()
            .map_err(|e| UpdateError::Other(anyhow::anyhow!("health request failed: {e}")))?;

        if response.status_code != 200 {
            return Err(UpdateError::Other(anyhow::anyhow!(
                "health endpoint returned HTTP {}",
                response.status_code
            )));
        }

        let body: HealthResponse = response
            .json()
            .map_err(|e| UpdateError::Other(anyhow::anyhow!("unable to decode health response: {e}")))?;

        if !body.ok {
            return Err(UpdateError::Other(anyhow::anyhow!("health endpoint reported ok=false")));
        }

        if body.version != target_version {
            return Err(UpdateError::VersionMismatch {
                expected: target_version.to_string(),
                actual: body.version,
            });
        }

        Ok(())
    }
}
