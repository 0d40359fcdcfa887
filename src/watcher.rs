//! Per-transfer watcher state machine
//!
//! One call to `tick` advances a watcher by at most one step: expire it,
//! skip on lock contention, or refresh the wallet and re-check the transfer.
//! The watcher never sleeps internally; cadence is enforced by the wallet
//! worker through `is_due`.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tracing::{debug, error, info, warn};

use crate::api::{NodeApi, Transfer, TransferStatus};
use crate::config::Config;
use crate::db::{Store, Watcher, WatcherStatus, WalletKeys};

/// What a single tick did
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TickOutcome {
    /// Wallet refreshed; the transfer is still pending
    Refreshed,
    /// Nothing happened (lock contention or refresh failure)
    Skipped,
    Settled,
    Failed,
    Expired,
}

impl TickOutcome {
    pub fn performed_work(&self) -> bool {
        !matches!(self, TickOutcome::Skipped)
    }
}

/// Whether a watcher should be ticked now
///
/// Past-expiry watchers are always due (the expiry transition must not
/// wait); otherwise the refresh cadence applies.
pub fn is_due(watcher: &Watcher, now: DateTime<Utc>, refresh_interval: Duration) -> bool {
    if watcher.expires_at <= now {
        return true;
    }
    match watcher.last_refresh {
        None => true,
        Some(last) => {
            now.signed_duration_since(last)
                >= chrono::Duration::seconds(refresh_interval.as_secs() as i64)
        }
    }
}

pub struct TransferWatcher<A: NodeApi> {
    store: Store,
    api: Arc<A>,
    config: Arc<Config>,
}

impl<A: NodeApi> TransferWatcher<A> {
    pub fn new(store: Store, api: Arc<A>, config: Arc<Config>) -> Self {
        Self { store, api, config }
    }

    /// Advance the watcher by one tick
    pub async fn tick(&self, watcher: &Watcher) -> anyhow::Result<TickOutcome> {
        let now = Utc::now();
        if watcher.expires_at <= now {
            return self.expire(watcher).await;
        }

        let xpub_van = &watcher.wallet.xpub_van;
        let lock_ttl = self.config.watcher.lock_ttl();
        if !self.store.acquire_lock(xpub_van, lock_ttl).await? {
            warn!(
                wallet = %watcher.wallet.short_id(),
                recipient_id = %watcher.recipient_id,
                "Wallet is being refreshed elsewhere, skipping tick"
            );
            return Ok(TickOutcome::Skipped);
        }

        let result = self.tick_locked(watcher).await;

        if let Err(e) = self.store.release_lock(xpub_van).await {
            error!(wallet = %watcher.wallet.short_id(), error = %e, "Failed to release wallet lock");
        }

        result
    }

    /// Expire the watcher and, if the transfer is still pending and
    /// cancellable, fail it
    async fn expire(&self, watcher: &Watcher) -> anyhow::Result<TickOutcome> {
        let wallet_id = watcher.wallet.short_id();
        info!(
            wallet = %wallet_id,
            recipient_id = %watcher.recipient_id,
            "Watcher expired"
        );
        self.store
            .set_watcher_status(&watcher.wallet.xpub_van, &watcher.recipient_id, WatcherStatus::Expired)
            .await?;

        match self
            .locate_transfer(&watcher.wallet, &watcher.recipient_id, watcher.asset_id.as_deref())
            .await
        {
            Ok(Some((transfer, _))) => {
                let now = Utc::now().timestamp();
                let grace = self.config.watcher.rcv_transfer_grace_secs as i64;
                if transfer.can_cancel(now, grace) {
                    self.cancel(&watcher.wallet, &transfer).await;
                }
            }
            Ok(None) => {}
            Err(e) => {
                warn!(
                    wallet = %wallet_id,
                    recipient_id = %watcher.recipient_id,
                    error = %e,
                    "Could not look up transfer for expired watcher"
                );
            }
        }

        Ok(TickOutcome::Expired)
    }

    async fn tick_locked(&self, watcher: &Watcher) -> anyhow::Result<TickOutcome> {
        let wallet = &watcher.wallet;
        let wallet_id = wallet.short_id();
        let recipient_id = &watcher.recipient_id;

        if let Err(e) = self.api.refresh_wallet(wallet).await {
            warn!(
                wallet = %wallet_id,
                recipient_id = %recipient_id,
                error = %e,
                "Refresh failed, will retry next tick"
            );
            return Ok(TickOutcome::Skipped);
        }
        self.store
            .record_watcher_refresh(&wallet.xpub_van, recipient_id)
            .await?;
        debug!(
            wallet = %wallet_id,
            recipient_id = %recipient_id,
            refresh_count = watcher.refresh_count + 1,
            "Refreshed wallet for watched transfer"
        );

        let located = match self
            .locate_transfer(wallet, recipient_id, watcher.asset_id.as_deref())
            .await
        {
            Ok(located) => located,
            Err(e) => {
                warn!(
                    wallet = %wallet_id,
                    recipient_id = %recipient_id,
                    error = %e,
                    "Failed to list transfers"
                );
                return Ok(TickOutcome::Refreshed);
            }
        };

        let Some((transfer, found_under)) = located else {
            info!(
                wallet = %wallet_id,
                recipient_id = %recipient_id,
                "Transfer not yet visible, continuing to watch"
            );
            return Ok(TickOutcome::Refreshed);
        };

        // An invoice-created watcher discovers its asset on first sighting;
        // record it and extend the watch window to the full TTL.
        if watcher.asset_id.is_none() {
            if let Some(asset_id) = &found_under {
                self.store
                    .bind_watcher_asset(
                        &wallet.xpub_van,
                        recipient_id,
                        asset_id,
                        self.config.watcher.ttl(),
                    )
                    .await?;
            }
        }

        match transfer.status {
            TransferStatus::Settled => {
                self.store
                    .set_watcher_status(&wallet.xpub_van, recipient_id, WatcherStatus::Settled)
                    .await?;
                info!(wallet = %wallet_id, recipient_id = %recipient_id, "Transfer settled");
                Ok(TickOutcome::Settled)
            }
            TransferStatus::Failed => {
                self.store
                    .set_watcher_status(&wallet.xpub_van, recipient_id, WatcherStatus::Failed)
                    .await?;
                info!(wallet = %wallet_id, recipient_id = %recipient_id, "Transfer failed");
                Ok(TickOutcome::Failed)
            }
            _ => {
                let now = Utc::now().timestamp();
                let grace = self.config.watcher.rcv_transfer_grace_secs as i64;
                if transfer.can_cancel(now, grace) {
                    self.cancel(wallet, &transfer).await;
                    self.store
                        .set_watcher_status(&wallet.xpub_van, recipient_id, WatcherStatus::Expired)
                        .await?;
                    info!(
                        wallet = %wallet_id,
                        recipient_id = %recipient_id,
                        "Transfer expired and was cancelled"
                    );
                    Ok(TickOutcome::Expired)
                } else {
                    Ok(TickOutcome::Refreshed)
                }
            }
        }
    }

    /// Find the watched transfer by recipient id
    ///
    /// With a known asset the search is a single listing. Without one, the
    /// detached list is checked first, then every asset's transfers; the
    /// second element reports which asset the transfer was found under.
    async fn locate_transfer(
        &self,
        wallet: &WalletKeys,
        recipient_id: &str,
        asset_id: Option<&str>,
    ) -> crate::api::ApiResult<Option<(Transfer, Option<String>)>> {
        let find = |transfers: Vec<Transfer>| {
            transfers
                .into_iter()
                .find(|t| t.recipient_id.as_deref() == Some(recipient_id))
        };

        if let Some(asset_id) = asset_id {
            let transfers = self.api.list_transfers(wallet, Some(asset_id)).await?;
            return Ok(find(transfers).map(|t| (t, Some(asset_id.to_string()))));
        }

        let detached = self.api.list_transfers(wallet, None).await?;
        if let Some(transfer) = find(detached) {
            return Ok(Some((transfer, None)));
        }

        for asset in self.api.list_assets(wallet).await? {
            let transfers = self.api.list_transfers(wallet, Some(&asset.asset_id)).await?;
            if let Some(transfer) = find(transfers) {
                return Ok(Some((transfer, Some(asset.asset_id))));
            }
        }

        Ok(None)
    }

    /// Fire-and-forget cancellation; a later tick re-attempts on failure
    async fn cancel(&self, wallet: &WalletKeys, transfer: &Transfer) {
        let Some(batch_transfer_idx) = transfer.batch_transfer_idx else {
            warn!(
                wallet = %wallet.short_id(),
                recipient_id = ?transfer.recipient_id,
                "Cancellable transfer is missing batch_transfer_idx"
            );
            return;
        };

        match self.api.fail_transfers(wallet, batch_transfer_idx).await {
            Ok(changed) => {
                info!(
                    wallet = %wallet.short_id(),
                    batch_transfer_idx,
                    changed,
                    "Failed expired transfer"
                );
            }
            Err(e) => {
                error!(
                    wallet = %wallet.short_id(),
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

    fn watcher(
        last_refresh: Option<DateTime<Utc>>,
        expires_at: DateTime<Utc>,
    ) -> Watcher {
        Watcher {
            wallet: WalletKeys {
                xpub_van: "xpub-test".to_string(),
                xpub_col: "xpub-col".to_string(),
                master_fingerprint: "deadbeef".to_string(),
            },
            recipient_id: "R1".to_string(),
            asset_id: None,
            status: WatcherStatus::Watching,
            refresh_count: 0,
            last_refresh,
            created_at: Utc::now(),
            expires_at,
        }
    }

    #[test]
    fn never_refreshed_watcher_is_due() {
        let now = Utc::now();
        let w = watcher(None, now + chrono::Duration::hours(1));
        assert!(is_due(&w, now, Duration::from_secs(30)));
    }

    #[test]
    fn recently_refreshed_watcher_is_not_due() {
        let now = Utc::now();
        let w = watcher(
            Some(now - chrono::Duration::seconds(10)),
            now + chrono::Duration::hours(1),
        );
        assert!(!is_due(&w, now, Duration::from_secs(30)));
    }

    #[test]
    fn stale_watcher_is_due_again() {
        let now = Utc::now();
        let w = watcher(
            Some(now - chrono::Duration::seconds(31)),
            now + chrono::Duration::hours(1),
        );
        assert!(is_due(&w, now, Duration::from_secs(30)));
    }

    #[test]
    fn expired_watcher_is_always_due() {
        let now = Utc::now();
        let w = watcher(Some(now), now - chrono::Duration::seconds(1));
        assert!(is_due(&w, now, Duration::from_secs(30)));
    }

    #[test]
    fn skipped_tick_performed_no_work() {
        assert!(!TickOutcome::Skipped.performed_work());
        assert!(TickOutcome::Refreshed.performed_work());
        assert!(TickOutcome::Settled.performed_work());
        assert!(TickOutcome::Expired.performed_work());
    }
}
