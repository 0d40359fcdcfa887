//! Per-wallet worker task
//!
//! Processes the wallet's pending jobs, ticks its due watchers, and
//! terminates itself after the idle timeout. The worker serializes all work
//! for its wallet; the lock table adds cross-process safety on top.

use std::sync::Arc;

use chrono::Utc;
use tokio::sync::broadcast;
use tokio::time::{interval, Instant};
use tracing::{error, info};

use crate::api::NodeApi;
use crate::config::Config;
use crate::db::{Store, WalletKeys};
use crate::handler::JobHandler;
use crate::watcher::{is_due, TransferWatcher};

pub struct WalletWorker<A: NodeApi> {
    wallet: WalletKeys,
    store: Store,
    handler: JobHandler<A>,
    watcher: TransferWatcher<A>,
    config: Arc<Config>,
}

impl<A: NodeApi> WalletWorker<A> {
    pub fn new(wallet: WalletKeys, store: Store, api: Arc<A>, config: Arc<Config>) -> Self {
        let handler = JobHandler::new(store.clone(), api.clone(), config.clone());
        let watcher = TransferWatcher::new(store.clone(), api, config.clone());
        Self {
            wallet,
            store,
            handler,
            watcher,
            config,
        }
    }

    /// Main worker loop; returns when idle for too long or on shutdown
    pub async fn run(self, mut shutdown: broadcast::Receiver<()>) {
        let wallet_id = self.wallet.short_id();
        let idle_timeout = self.config.worker.idle_timeout();
        let mut ticker = interval(self.config.worker.poll_interval());
        let mut last_work = Instant::now();

        info!(wallet = %wallet_id, "Wallet worker started");

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    if self.work_pass().await {
                        last_work = Instant::now();
                    } else if last_work.elapsed() >= idle_timeout {
                        info!(
                            wallet = %wallet_id,
                            idle_secs = last_work.elapsed().as_secs(),
                            "No work, terminating"
                        );
                        break;
                    }
                }
                _ = shutdown.recv() => {
                    info!(wallet = %wallet_id, "Wallet worker shutting down");
                    break;
                }
            }
        }

        info!(wallet = %wallet_id, "Wallet worker stopped");
    }

    /// One pass: process at most one job, then tick due watchers
    ///
    /// Further pending jobs are picked up on the next pass, so watcher
    /// ticks are never starved by a burst of jobs.
    async fn work_pass(&self) -> bool {
        let mut worked = self.process_next_job().await;
        worked |= self.tick_watchers().await;
        worked
    }

    async fn process_next_job(&self) -> bool {
        let wallet_id = self.wallet.short_id();

        let job = match self.store.dequeue_for_wallet(&self.wallet.xpub_van).await {
            Ok(Some(job)) => job,
            Ok(None) => return false,
            Err(e) => {
                error!(wallet = %wallet_id, error = %e, "Failed to dequeue job");
                return false;
            }
        };

        let outcome = self.handler.handle(&job).await;
        info!(
            wallet = %wallet_id,
            job_id = %job.job_id,
            outcome = ?outcome,
            "Job finished"
        );
        if let Err(e) = self.store.complete_job(job.job_id, &outcome).await {
            error!(
                wallet = %wallet_id,
                job_id = %job.job_id,
                error = %e,
                "Failed to record job outcome"
            );
        }

        true
    }

    async fn tick_watchers(&self) -> bool {
        let wallet_id = self.wallet.short_id();
        let mut worked = false;

        let watchers = match self.store.list_active_watchers(&self.wallet.xpub_van).await {
            Ok(watchers) => watchers,
            Err(e) => {
                error!(wallet = %wallet_id, error = %e, "Failed to list watchers");
                return false;
            }
        };

        let refresh_interval = self.config.refresh.interval();
        for watcher in &watchers {
            if !is_due(watcher, Utc::now(), refresh_interval) {
                continue;
            }
            match self.watcher.tick(watcher).await {
                Ok(outcome) => {
                    worked |= outcome.performed_work();
                }
                Err(e) => {
                    error!(
                        wallet = %wallet_id,
                        recipient_id = %watcher.recipient_id,
                        error = %e,
                        "Watcher tick failed"
                    );
                }
            }
        }

        worked
    }
}
