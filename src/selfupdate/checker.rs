//! Update-check client: GETs the control plane's update endpoint with
//! signed headers and parses the response into [`UpdateInfo`].
//!
//! Grounded in the teacher's `minreq`-based HTTP usage
//! (`upgrade/poll.rs::download_file`), generalized from a raw body fetch to
//! a signed, header-rich JSON GET.

use std::sync::Arc;

use log::warn;

use super::error::{UpdateError, UpdateResult};
use super::model::UpdateInfo;
use super::signing::RequestSigner;
use crate::common::{PROJECT_VERSION, user_agent};

const CHECK_TIMEOUT_SECS: u64 = 15;

pub struct UpdateChecker {
    base_url: String,
    agent_id: String,
    signer: Arc<dyn RequestSigner>,
}

impl UpdateChecker {
    /// `agent_id` is required and validated non-empty at construction.
    pub fn new(base_url: impl Into<String>, agent_id: impl Into<String>, signer: Arc<dyn RequestSigner>) -> UpdateResult<Self> {
        let agent_id = agent_id.into();
        if agent_id.trim().is_empty() {
            return Err(UpdateError::Other(anyhow::anyhow!("agent_id must not be empty")));
        }
        Ok(Self {
            base_url: base_url.into(),
            agent_id,
            signer,
        })
    }

    /// Performs the GET. HTTP 400 is treated as [`UpdateError::UnsupportedPlatform`]
    /// (a soft no-op upstream); any other non-200 status or body-decode
    /// failure is fatal.
    pub fn check(&self) -> UpdateResult<UpdateInfo> {
        let url = format!("{}/api/v1/agents/{}/update", self.base_url.trim_end_matches('/'), self.agent_id);
        let signed = self.signer.sign(&self.agent_id);

        let mut request = minreq::get(&url)
            .with_header("User-Agent", user_agent())
            .with_header("X-Agent-Version", PROJECT_VERSION)
            .with_header("X-Agent-OS", std::env::consts::OS)
            .with_header("X-Agent-Arch", std::env::consts::ARCH)
            .with_timeout(CHECK_TIMEOUT_SECS);

        for (name, value) in &signed.headers {
            request = request.with_header(name, value);
        }

        let response = request
            .send()
            .map_err(|e| UpdateError::Other(anyhow::anyhow!("update-check request to {url} failed: {e}")))?;

        match response.status_code {
            200 => response
                .json::<UpdateInfo>()
                .map_err(|e| UpdateError::Other(anyhow::anyhow!("unable to decode update-check response: {e}"))),
            400 => {
                warn!("control plane reports unsupported platform for {url}");
                Err(UpdateError::UnsupportedPlatform)
            }
            status => Err(UpdateError::Other(anyhow::anyhow!(
                "update-check returned unexpected status {status} from {url}"
            ))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::selfupdate::signing::NullSigner;

    #[test]
    fn new_rejects_empty_agent_id() {
        let result = UpdateChecker::new("https://cp.example", "", Arc::new(NullSigner));
        assert!(result.is_err());
    }

    #[test]
    fn new_accepts_valid_agent_id() {
        let result = UpdateChecker::new("https://cp.example", "agent-1", Arc::new(NullSigner));
        assert!(result.is_ok());
    }
}
