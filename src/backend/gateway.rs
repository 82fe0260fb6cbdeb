//! HTTP Gateway Backend
//!
//! Retrieval-only adapter over a public or private content gateway. Bodies
//! are fetched with `GET /<fingerprint>`, existence with `HEAD`. Writes are
//! refused; the tier exists purely as a fallback read path.

use crate::backend::{BackendAdapter, BackendStats, HealthStatus, TierClass, TierDescriptor};
use crate::error::{Error, Result};
use crate::fingerprint::Fingerprint;
use async_trait::async_trait;
use bytes::Bytes;
use reqwest::StatusCode;
use std::time::Duration;

// =============================================================================
// Gateway Configuration
// =============================================================================

/// Configuration for a gateway backend
#[derive(Debug, Clone)]
pub struct GatewayConfig {
    /// Base URL, e.g. `https://gateway.example.net/content`
    pub base_url: String,
    /// Per-request timeout
    pub request_timeout: Duration,
    /// Tier name for descriptors and location sets
    pub tier_name: String,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            base_url: "http://127.0.0.1:8080/content".to_string(),
            request_timeout: Duration::from_secs(30),
            tier_name: "gateway".to_string(),
        }
    }
}

// =============================================================================
// Gateway Backend
// =============================================================================

/// Retrieval-only HTTP gateway tier
pub struct GatewayBackend {
    descriptor: TierDescriptor,
    client: reqwest::Client,
    base_url: String,
}

impl GatewayBackend {
    pub fn new(config: GatewayConfig) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(config.request_timeout)
            .build()?;
        Ok(Self {
            descriptor: TierDescriptor::new(config.tier_name, TierClass::RetrievalOnly),
            client,
            base_url: config.base_url.trim_end_matches('/').to_string(),
        })
    }

    fn url_for(&self, fp: &Fingerprint) -> String {
        format!("{}/{}", self.base_url, fp.to_canonical_string())
    }

    fn classify_status(&self, status: StatusCode) -> Error {
        match status {
            StatusCode::NOT_FOUND | StatusCode::GONE => Error::NotFound,
            StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => {
                Error::Auth(format!("gateway returned {}", status))
            }
            s if s.is_server_error() => Error::Transient(format!("gateway returned {}", s)),
            s => Error::Internal(format!("gateway returned {}", s)),
        }
    }
}

#[async_trait]
impl BackendAdapter for GatewayBackend {
    fn descriptor(&self) -> &TierDescriptor {
        &self.descriptor
    }

    async fn put(&self, _fp: &Fingerprint, _body: Bytes) -> Result<()> {
        Err(Error::Unsupported("gateway tier is retrieval-only".into()))
    }

    async fn get(&self, fp: &Fingerprint) -> Result<Bytes> {
        let resp = self.client.get(self.url_for(fp)).send().await?;
        if !resp.status().is_success() {
            return Err(self.classify_status(resp.status()));
        }
        Ok(resp.bytes().await?)
    }

    async fn has(&self, fp: &Fingerprint) -> Result<bool> {
        let resp = self.client.head(self.url_for(fp)).send().await?;
        match resp.status() {
            s if s.is_success() => Ok(true),
            StatusCode::NOT_FOUND | StatusCode::GONE => Ok(false),
            s => Err(self.classify_status(s)),
        }
    }

    async fn remove(&self, _fp: &Fingerprint) -> Result<()> {
        Err(Error::Unsupported("gateway tier is retrieval-only".into()))
    }

    async fn stat(&self) -> Result<BackendStats> {
        Ok(BackendStats {
            used_bytes: 0,
            quota_bytes: None,
            health: self.health().await,
        })
    }

    async fn health(&self) -> HealthStatus {
        match self.client.head(&self.base_url).send().await {
            Ok(resp) if resp.status().is_success() || resp.status() == StatusCode::NOT_FOUND => {
                HealthStatus::Ok
            }
            Ok(resp) if resp.status().is_server_error() => HealthStatus::Degraded,
            Ok(_) => HealthStatus::Degraded,
            Err(_) => HealthStatus::Down,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_url_construction() {
        let gw = GatewayBackend::new(GatewayConfig {
            base_url: "https://gw.example.net/content/".into(),
            ..Default::default()
        })
        .unwrap();
        let fp = Fingerprint::of(b"x");
        let url = gw.url_for(&fp);
        assert_eq!(
            url,
            format!("https://gw.example.net/content/{}", fp.to_canonical_string())
        );
    }

    #[test]
    fn test_descriptor_is_retrieval_only() {
        let gw = GatewayBackend::new(GatewayConfig::default()).unwrap();
        assert_eq!(gw.descriptor().class, TierClass::RetrievalOnly);
        assert!(!gw.descriptor().writable);
    }

    #[tokio::test]
    async fn test_writes_refused() {
        let gw = GatewayBackend::new(GatewayConfig::default()).unwrap();
        let body = Bytes::from_static(b"x");
        let fp = Fingerprint::of(&body);
        assert!(matches!(gw.put(&fp, body).await, Err(Error::Unsupported(_))));
        assert!(matches!(gw.remove(&fp).await, Err(Error::Unsupported(_))));
    }

    #[test]
    fn test_status_classification() {
        let gw = GatewayBackend::new(GatewayConfig::default()).unwrap();
        assert!(matches!(
            gw.classify_status(StatusCode::NOT_FOUND),
            Error::NotFound
        ));
        assert!(matches!(
            gw.classify_status(StatusCode::FORBIDDEN),
            Error::Auth(_)
        ));
        assert!(matches!(
            gw.classify_status(StatusCode::BAD_GATEWAY),
            Error::Transient(_)
        ));
    }
}
