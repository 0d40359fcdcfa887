//! Unified job handler
//!
//! One invocation consumes one job: refresh the wallet under its lock,
//! enumerate assets and transfers, register watchers for incomplete
//! transfers, and cancel expired ones. Never long-runs a loop.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tracing::{debug, error, info, warn};

use crate::api::{NodeApi, Transfer};
use crate::config::Config;
use crate::db::{Job, JobOutcome, RefreshTrigger, Store, WalletKeys};

/// Exponential-backoff delay before the given retry attempt (1-based)
pub fn backoff_delay(base: Duration, attempt: u32) -> Duration {
    base * 2u32.saturating_pow(attempt.saturating_sub(1))
}

pub struct JobHandler<A: NodeApi> {
    store: Store,
    api: Arc<A>,
    config: Arc<Config>,
}

impl<A: NodeApi> JobHandler<A> {
    pub fn new(store: Store, api: Arc<A>, config: Arc<Config>) -> Self {
        Self { store, api, config }
    }

    /// Perform the side-effects required by a job's trigger
    ///
    /// Errors are translated into the returned outcome; the caller records
    /// it via `Store::complete_job`.
    pub async fn handle(&self, job: &Job) -> JobOutcome {
        let wallet_id = job.wallet.short_id();
        info!(wallet = %wallet_id, job_id = %job.job_id, trigger = job.trigger.kind(), "Processing job");

        match &job.trigger {
            RefreshTrigger::InvoiceCreated {
                recipient_id,
                asset_id: None,
            } => {
                // The transfer may not yet exist on any listed asset, so a
                // refresh pass cannot find it. Register a short-lived watcher
                // and let its ticks discover the asset.
                match self
                    .store
                    .create_watcher(
                        &job.wallet,
                        recipient_id,
                        None,
                        self.config.watcher.invoice_created_ttl(),
                    )
                    .await
                {
                    Ok(()) => {
                        info!(
                            wallet = %wallet_id,
                            recipient_id = %recipient_id,
                            "Created short-lived watcher for unbound invoice"
                        );
                        JobOutcome::Completed
                    }
                    Err(e) => JobOutcome::Failed(e.to_string()),
                }
            }
            RefreshTrigger::Unknown(kind) => {
                error!(wallet = %wallet_id, job_id = %job.job_id, kind = %kind, "Unknown trigger kind");
                JobOutcome::Failed(format!("unknown trigger kind: {kind}"))
            }
            _ => self.refresh_pass(job).await,
        }
    }

    /// The unified refresh procedure, gated on the wallet lock
    async fn refresh_pass(&self, job: &Job) -> JobOutcome {
        let wallet = &job.wallet;
        let lock_ttl = self.config.watcher.lock_ttl();

        match self.store.acquire_lock(&wallet.xpub_van, lock_ttl).await {
            Ok(true) => {}
            Ok(false) => {
                warn!(wallet = %wallet.short_id(), "Wallet is already being refreshed, skipping");
                return JobOutcome::SkippedLocked;
            }
            Err(e) => return JobOutcome::Failed(format!("lock acquisition failed: {e}")),
        }

        let result = self.scan_wallet(wallet, job.max_retries.max(1) as u32).await;

        if let Err(e) = self.store.release_lock(&wallet.xpub_van).await {
            error!(wallet = %wallet.short_id(), error = %e, "Failed to release wallet lock");
        }

        match result {
            Ok(()) => JobOutcome::Completed,
            Err(e) => JobOutcome::Failed(e.to_string()),
        }
    }

    /// Refresh, then walk detached transfers and every asset's transfers
    async fn scan_wallet(&self, wallet: &WalletKeys, max_retries: u32) -> anyhow::Result<()> {
        let wallet_id = wallet.short_id();

        self.refresh_with_retry(wallet, max_retries).await?;

        let detached = self.api.list_transfers(wallet, None).await?;
        debug!(wallet = %wallet_id, count = detached.len(), "Detached transfers");
        self.process_transfers(wallet, None, &detached).await;

        let assets = self.api.list_assets(wallet).await?;
        debug!(wallet = %wallet_id, count = assets.len(), "Assets");

        for asset in &assets {
            let transfers = match self.api.list_transfers(wallet, Some(&asset.asset_id)).await {
                Ok(transfers) => transfers,
                Err(e) => {
                    warn!(
                        wallet = %wallet_id,
                        asset_id = %asset.asset_id,
                        error = %e,
                        "Failed to list transfers for asset"
                    );
                    continue;
                }
            };
            self.process_transfers(wallet, Some(&asset.asset_id), &transfers)
                .await;
        }

        Ok(())
    }

    /// Call refresh, retrying transient failures with exponential backoff
    async fn refresh_with_retry(&self, wallet: &WalletKeys, max_retries: u32) -> anyhow::Result<()> {
        let wallet_id = wallet.short_id();
        let base = self.config.refresh.retry_delay_base();
        let mut attempt = 1;

        loop {
            match self.api.refresh_wallet(wallet).await {
                Ok(()) => {
                    debug!(wallet = %wallet_id, attempt, "Refresh successful");
                    return Ok(());
                }
                Err(e) if e.is_transient() && attempt < max_retries => {
                    let delay = backoff_delay(base, attempt);
                    warn!(
                        wallet = %wallet_id,
                        attempt,
                        max_retries,
                        delay_secs = delay.as_secs(),
                        error = %e,
                        "Refresh failed, retrying"
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                Err(e) => {
                    error!(wallet = %wallet_id, attempt, error = %e, "Refresh failed");
                    return Err(e.into());
                }
            }
        }
    }

    /// Register watchers for incomplete transfers; cancel expired ones
    async fn process_transfers(
        &self,
        wallet: &WalletKeys,
        asset_id: Option<&str>,
        transfers: &[Transfer],
    ) {
        let wallet_id = wallet.short_id();
        let now = Utc::now().timestamp();
        let grace = self.config.watcher.rcv_transfer_grace_secs as i64;

        for transfer in transfers {
            let Some(recipient_id) = transfer.recipient_id.as_deref() else {
                debug!(wallet = %wallet_id, "Transfer has no recipient_id, cannot watch");
                continue;
            };

            if transfer.is_terminal() {
                debug!(wallet = %wallet_id, recipient_id, "Transfer already terminal");
                continue;
            }

            // Every non-terminal transfer gets a watcher, expired or not;
            // the watcher tick owns the expiry transition.
            if let Err(e) = self
                .store
                .create_watcher(wallet, recipient_id, asset_id, self.config.watcher.ttl())
                .await
            {
                error!(
                    wallet = %wallet_id,
                    recipient_id,
                    error = %e,
                    "Failed to register watcher"
                );
            }

            if transfer.is_expired(now) {
                if transfer.can_cancel(now, grace) {
                    self.cancel_transfer(wallet, recipient_id, transfer).await;
                } else {
                    debug!(
                        wallet = %wallet_id,
                        recipient_id,
                        "Transfer expired but not eligible for cancellation"
                    );
                }
            }
        }
    }

    /// Fire-and-forget cancellation; a later pass re-attempts on failure
    async fn cancel_transfer(&self, wallet: &WalletKeys, recipient_id: &str, transfer: &Transfer) {
        let wallet_id = wallet.short_id();
        let Some(batch_transfer_idx) = transfer.batch_transfer_idx else {
            warn!(
                wallet = %wallet_id,
                recipient_id,
                "Expired transfer is missing batch_transfer_idx"
            );
            return;
        };

        match self.api.fail_transfers(wallet, batch_transfer_idx).await {
            Ok(changed) => {
                info!(
                    wallet = %wallet_id,
                    recipient_id,
                    batch_transfer_idx,
                    changed,
                    "Failed expired transfer"
                );
            }
            Err(e) => {
                error!(
                    wallet = %wallet_id,
                    recipient_id,
                    batch_transfer_idx,
                    error = %e,
                    "failtransfers call failed"
                );
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_doubles_from_base() {
        let base = Duration::from_secs(5);
        assert_eq!(backoff_delay(base, 1), Duration::from_secs(5));
        assert_eq!(backoff_delay(base, 2), Duration::from_secs(10));
        assert_eq!(backoff_delay(base, 3), Duration::from_secs(20));
        assert_eq!(backoff_delay(base, 5), Duration::from_secs(80));
    }

    #[test]
    fn backoff_attempt_zero_is_clamped() {
        let base = Duration::from_secs(5);
        assert_eq!(backoff_delay(base, 0), Duration::from_secs(5));
    }
}
