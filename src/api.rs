//! HTTP client for the node's wallet endpoints
//!
//! Every call is a POST carrying the three wallet-identification headers.
//! The `NodeApi` trait is the seam the handler and watcher are written
//! against; production uses `NodeApiClient`, tests substitute a scripted
//! implementation.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::json;
use thiserror::Error;
use tracing::debug;

use crate::config::ApiConfig;
use crate::db::WalletKeys;

#[derive(Debug, Error)]
pub enum ApiError {
    #[error("request timed out: {0}")]
    Timeout(String),

    #[error("connection failed: {0}")]
    Connection(String),

    #[error("HTTP {status}: {body}")]
    Status { status: u16, body: String },

    #[error("invalid response: {0}")]
    Parse(String),
}

impl ApiError {
    /// Whether a retry could plausibly succeed
    pub fn is_transient(&self) -> bool {
        match self {
            ApiError::Timeout(_) | ApiError::Connection(_) => true,
            ApiError::Status { status, .. } => *status == 429 || *status >= 500,
            ApiError::Parse(_) => false,
        }
    }
}

pub type ApiResult<T> = Result<T, ApiError>;

/// Transfer status as reported by the node
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TransferStatus {
    WaitingCounterparty,
    WaitingConfirmations,
    Settled,
    Failed,
    #[serde(other)]
    Unknown,
}

/// Transfer kind as reported by the node
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TransferKind {
    Issuance,
    ReceiveBlind,
    ReceiveWitness,
    Send,
    #[serde(other)]
    Unknown,
}

/// One transfer from a `listtransfers` response
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Transfer {
    #[serde(default)]
    pub recipient_id: Option<String>,
    #[serde(default)]
    pub batch_transfer_idx: Option<i32>,
    pub status: TransferStatus,
    pub kind: TransferKind,
    /// Unix seconds; receives carry one, sends usually do not
    #[serde(default)]
    pub expiration: Option<i64>,
}

impl Transfer {
    /// Settled or failed; no further state change expected
    pub fn is_terminal(&self) -> bool {
        matches!(self.status, TransferStatus::Settled | TransferStatus::Failed)
    }

    /// Expiration strictly in the past
    pub fn is_expired(&self, now: i64) -> bool {
        self.expiration.is_some_and(|e| e < now)
    }

    /// Whether an explicit `failtransfers` is licensed
    ///
    /// Requires WAITING_COUNTERPARTY with a past expiration, and either a
    /// blind receive or an expiration older than the receive grace period.
    pub fn can_cancel(&self, now: i64, rcv_grace_secs: i64) -> bool {
        if self.status != TransferStatus::WaitingCounterparty {
            return false;
        }
        let Some(expiration) = self.expiration else {
            return false;
        };
        if expiration >= now {
            return false;
        }
        self.kind == TransferKind::ReceiveBlind || expiration + rcv_grace_secs < now
    }
}

/// One asset from a `listassets` response
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Asset {
    pub asset_id: String,
    #[serde(default)]
    pub ticker: Option<String>,
    #[serde(default)]
    pub name: Option<String>,
}

/// Assets come back grouped by class; flatten and drop nulls
#[derive(Debug, Deserialize)]
struct ListAssetsResponse {
    #[serde(default)]
    nia: Option<Vec<Option<Asset>>>,
    #[serde(default)]
    uda: Option<Vec<Option<Asset>>>,
    #[serde(default)]
    cfa: Option<Vec<Option<Asset>>>,
}

impl ListAssetsResponse {
    fn into_assets(self) -> Vec<Asset> {
        [self.nia, self.uda, self.cfa]
            .into_iter()
            .flatten()
            .flatten()
            .flatten()
            .collect()
    }
}

#[derive(Debug, Deserialize)]
struct ListTransfersResponse {
    #[serde(default)]
    transfers: Vec<Option<Transfer>>,
}

#[derive(Debug, Deserialize)]
struct FailTransfersResponse {
    #[serde(default)]
    transfers_changed: bool,
}

/// Outbound node API surface
#[async_trait]
pub trait NodeApi: Send + Sync {
    /// Resync wallet state with external networks
    async fn refresh_wallet(&self, wallet: &WalletKeys) -> ApiResult<()>;

    /// Enumerate known assets
    async fn list_assets(&self, wallet: &WalletKeys) -> ApiResult<Vec<Asset>>;

    /// Enumerate transfers; `None` returns the detached transfers only
    async fn list_transfers(
        &self,
        wallet: &WalletKeys,
        asset_id: Option<&str>,
    ) -> ApiResult<Vec<Transfer>>;

    /// Cancel an expired pending transfer; returns whether anything changed
    async fn fail_transfers(&self, wallet: &WalletKeys, batch_transfer_idx: i32)
        -> ApiResult<bool>;

    /// Whether the API answers at all
    async fn health_check(&self) -> bool;
}

/// reqwest-backed production client
pub struct NodeApiClient {
    base_url: String,
    client: reqwest::Client,
}

impl NodeApiClient {
    pub fn new(config: &ApiConfig) -> Self {
        Self {
            base_url: config.url.trim_end_matches('/').to_string(),
            client: reqwest::Client::builder()
                .timeout(config.http_timeout())
                .build()
                .expect("Failed to create HTTP client"),
        }
    }

    async fn post<T: for<'de> Deserialize<'de>>(
        &self,
        path: &str,
        wallet: &WalletKeys,
        body: Option<serde_json::Value>,
    ) -> ApiResult<T> {
        let url = format!("{}{}", self.base_url, path);
        let mut request = self
            .client
            .post(&url)
            .header("xpub-van", &wallet.xpub_van)
            .header("xpub-col", &wallet.xpub_col)
            .header("master-fingerprint", &wallet.master_fingerprint);
        if let Some(body) = body {
            request = request.json(&body);
        }

        let response = request.send().await.map_err(|e| {
            if e.is_timeout() {
                ApiError::Timeout(e.to_string())
            } else {
                ApiError::Connection(e.to_string())
            }
        })?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(ApiError::Status {
                status: status.as_u16(),
                body,
            });
        }

        response
            .json()
            .await
            .map_err(|e| ApiError::Parse(e.to_string()))
    }
}

#[async_trait]
impl NodeApi for NodeApiClient {
    async fn refresh_wallet(&self, wallet: &WalletKeys) -> ApiResult<()> {
        let _: serde_json::Value = self.post("/wallet/refresh", wallet, None).await?;
        Ok(())
    }

    async fn list_assets(&self, wallet: &WalletKeys) -> ApiResult<Vec<Asset>> {
        let response: ListAssetsResponse = self.post("/wallet/listassets", wallet, None).await?;
        Ok(response.into_assets())
    }

    async fn list_transfers(
        &self,
        wallet: &WalletKeys,
        asset_id: Option<&str>,
    ) -> ApiResult<Vec<Transfer>> {
        let body = match asset_id {
            Some(asset_id) => json!({ "asset_id": asset_id }),
            None => json!({}),
        };
        let response: ListTransfersResponse = self
            .post("/wallet/listtransfers", wallet, Some(body))
            .await?;
        Ok(response.transfers.into_iter().flatten().collect())
    }

    async fn fail_transfers(
        &self,
        wallet: &WalletKeys,
        batch_transfer_idx: i32,
    ) -> ApiResult<bool> {
        let body = json!({
            "batch_transfer_idx": batch_transfer_idx,
            "no_asset_only": false,
            "skip_sync": false,
        });
        let response: FailTransfersResponse = self
            .post("/wallet/failtransfers", wallet, Some(body))
            .await?;
        debug!(batch_transfer_idx, changed = response.transfers_changed, "failtransfers");
        Ok(response.transfers_changed)
    }

    async fn health_check(&self) -> bool {
        let url = format!("{}/docs", self.base_url);
        match self
            .client
            .get(&url)
            .timeout(std::time::Duration::from_secs(5))
            .send()
            .await
        {
            Ok(response) => response.status().is_success(),
            Err(_) => false,
        }
    }
}
