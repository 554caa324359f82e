// =============================================================================
// Compute Provider — upstream verdict computation
// =============================================================================
//
// The heavy computation (features, ML inference, rule sub-scores) runs in a
// separate service. The core only sees `ComputeProvider::compute`, which may
// be slow and may fail. It is never called twice concurrently for one key;
// the single-flight recomputer guarantees that.
//
// `HttpComputeProvider` talks to that service over REST. When a shared
// secret is configured each request body is signed with HMAC-SHA256 over
// `{timestamp}.{body}` and the hex digest is sent in `X-Aurora-Signature`.
// =============================================================================

use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use hmac::{Hmac, Mac};
use serde::Serialize;
use sha2::Sha256;
use tracing::{debug, instrument, warn};

use crate::error::ComputeError;
use crate::types::{Horizon, RawVerdict};

type HmacSha256 = Hmac<Sha256>;

#[async_trait]
pub trait ComputeProvider: Send + Sync {
    async fn compute(&self, symbol: &str, horizon: Horizon) -> Result<RawVerdict, ComputeError>;
}

#[derive(Serialize)]
struct ComputeRequest<'a> {
    symbol: &'a str,
    horizon: Horizon,
}

/// REST client for the upstream compute service.
#[derive(Clone)]
pub struct HttpComputeProvider {
    base_url: String,
    secret: Option<String>,
    client: reqwest::Client,
}

impl HttpComputeProvider {
    /// Build a client. `timeout` bounds each HTTP exchange; the recomputer
    /// applies its own timeout on top.
    pub fn new(
        base_url: impl Into<String>,
        secret: Option<String>,
        timeout: Duration,
    ) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .context("failed to build upstream HTTP client")?;

        let base_url = base_url.into().trim_end_matches('/').to_string();
        debug!(base_url = %base_url, signed = secret.is_some(), "HttpComputeProvider initialised");

        Ok(Self {
            base_url,
            secret: secret.filter(|s| !s.is_empty()),
            client,
        })
    }

    /// Hex HMAC-SHA256 of `{timestamp}.{body}`.
    pub fn sign(secret: &str, timestamp_ms: i64, body: &str) -> String {
        // HMAC accepts keys of any length, so this cannot fail.
        let mut mac = match HmacSha256::new_from_slice(secret.as_bytes()) {
            Ok(mac) => mac,
            Err(_) => return String::new(),
        };
        mac.update(timestamp_ms.to_string().as_bytes());
        mac.update(b".");
        mac.update(body.as_bytes());
        hex::encode(mac.finalize().into_bytes())
    }
}

#[async_trait]
impl ComputeProvider for HttpComputeProvider {
    #[instrument(skip(self), name = "upstream::compute")]
    async fn compute(&self, symbol: &str, horizon: Horizon) -> Result<RawVerdict, ComputeError> {
        let url = format!("{}/v1/verdict", self.base_url);
        let body = serde_json::to_string(&ComputeRequest { symbol, horizon })
            .map_err(|e| ComputeError::Upstream(format!("request encode: {e}")))?;

        let mut req = self
            .client
            .post(&url)
            .header(reqwest::header::CONTENT_TYPE, "application/json");

        if let Some(secret) = &self.secret {
            let ts = chrono::Utc::now().timestamp_millis();
            req = req
                .header("X-Aurora-Timestamp", ts.to_string())
                .header("X-Aurora-Signature", Self::sign(secret, ts, &body));
        }

        let resp = req
            .body(body)
            .send()
            .await
            .map_err(|e| ComputeError::Upstream(format!("POST {url}: {e}")))?;

        let status = resp.status();
        if !status.is_success() {
            let text = resp.text().await.unwrap_or_default();
            warn!(symbol, horizon = %horizon, status = %status, "upstream compute rejected");
            return Err(ComputeError::Upstream(format!("status {status}: {text}")));
        }

        let verdict: RawVerdict = resp
            .json()
            .await
            .map_err(|e| ComputeError::Decode(e.to_string()))?;

        if !verdict.symbol.eq_ignore_ascii_case(symbol) || verdict.horizon != horizon {
            return Err(ComputeError::Decode(format!(
                "payload for {}:{} returned for request {}:{}",
                verdict.symbol, verdict.horizon, symbol, horizon
            )));
        }

        Ok(verdict)
    }
}
