//! Request signing is an external collaborator per scope: the real signer
//! lives in the embedding agent (hardware fingerprinting, key material,
//! nonce bookkeeping — all out of scope here). This crate only defines the
//! seam it calls through.

use std::collections::BTreeMap;

/// Headers a [`RequestSigner`] attaches to an outbound control-plane
/// request: `X-Agent-ID`, `X-Timestamp`, `X-Nonce`, `X-Signature`.
#[derive(Debug, Clone, Default)]
pub struct SignedHeaders {
    pub headers: BTreeMap<String, String>,
}

impl SignedHeaders {
    #[must_use]
    pub fn new(agent_id: &str, timestamp: &str, nonce: &str, signature: &str) -> Self {
        let mut headers = BTreeMap::new();
        headers.insert("X-Agent-ID".to_string(), agent_id.to_string());
        headers.insert("X-Timestamp".to_string(), timestamp.to_string());
        headers.insert("X-Nonce".to_string(), nonce.to_string());
        headers.insert("X-Signature".to_string(), signature.to_string());
        Self { headers }
    }
}

/// Object-safe signer seam. Production wiring belongs to the embedding
/// agent; this crate ships two trivial implementations for tests and for
/// hosts that sign out-of-process.
pub trait RequestSigner: Send + Sync {
    fn sign(&self, agent_id: &str) -> SignedHeaders;
}

/// Test double that emits empty signature material. Useful against a fake
/// control plane that does not validate signatures.
pub struct NullSigner;

impl RequestSigner for NullSigner {
    fn sign(&self, agent_id: &str) -> SignedHeaders {
        SignedHeaders::new(agent_id, "0", "", "")
    }
}

/// Reads pre-computed header values from environment variables. Useful for
/// integration tests and for hosts whose signer runs out-of-process and
/// drops the result into the environment before invoking this binary.
pub struct EnvSigner;

impl RequestSigner for EnvSigner {
    fn sign(&self, agent_id: &str) -> SignedHeaders {
        let timestamp = std::env::var("HOSTLINK_SIGN_TIMESTAMP").unwrap_or_else(|_| "0".to_string());
        let nonce = std::env::var("HOSTLINK_SIGN_NONCE").unwrap_or_default();
        let signature = std::env::var("HOSTLINK_SIGN_SIGNATURE").unwrap_or_default();
        SignedHeaders::new(agent_id, &timestamp, &nonce, &signature)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn null_signer_produces_agent_id_header() {
        let signer = NullSigner;
        let headers = signer.sign("agent-123");
        assert_eq!(headers.headers.get("X-Agent-ID").map(String::as_str), Some("agent-123"));
    }
}
