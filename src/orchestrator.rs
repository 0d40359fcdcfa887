//! Orchestrator: scans the store for wallets needing work and supervises
//! one wallet worker task per wallet, bounded by a hard cap
//!
//! The orchestrator never takes a wallet lock and never calls the refresh
//! endpoints itself; workers do all wallet-facing work.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio::time::{interval, timeout, Instant};
use tracing::{debug, error, info, warn};

use crate::api::NodeApi;
use crate::config::Config;
use crate::db::Store;
use crate::worker::WalletWorker;

/// How long shutdown waits for workers before aborting them
const SHUTDOWN_DRAIN_TIMEOUT: Duration = Duration::from_secs(10);

const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(30);

pub struct Orchestrator<A: NodeApi + 'static> {
    store: Store,
    api: Arc<A>,
    config: Arc<Config>,
    shutdown_tx: broadcast::Sender<()>,
    /// Supervision registry: xpub_van -> live worker task
    workers: HashMap<String, JoinHandle<()>>,
}

impl<A: NodeApi + 'static> Orchestrator<A> {
    pub fn new(
        store: Store,
        api: Arc<A>,
        config: Arc<Config>,
        shutdown_tx: broadcast::Sender<()>,
    ) -> Self {
        Self {
            store,
            api,
            config,
            shutdown_tx,
            workers: HashMap::new(),
        }
    }

    /// Main orchestrator loop; returns after draining workers on shutdown
    pub async fn run(mut self) {
        let mut shutdown = self.shutdown_tx.subscribe();
        let mut ticker = interval(self.config.orchestrator.poll_interval());
        let mut last_heartbeat = Instant::now();

        if self.api.health_check().await {
            info!("Node API connection successful");
        } else {
            warn!("Node API health check failed (may be normal during startup)");
        }

        info!(
            poll_interval_secs = self.config.orchestrator.poll_interval_secs,
            max_wallet_workers = self.config.orchestrator.max_wallet_workers,
            "Orchestrator started"
        );

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    self.reap_finished();
                    self.spawn_needed().await;

                    if last_heartbeat.elapsed() >= HEARTBEAT_INTERVAL {
                        debug!(live_workers = self.workers.len(), "Waiting for work");
                        last_heartbeat = Instant::now();
                    }
                }
                _ = shutdown.recv() => {
                    info!("Orchestrator shutting down");
                    break;
                }
            }
        }

        self.drain().await;
    }

    /// Drop registry entries whose worker task has exited
    fn reap_finished(&mut self) {
        self.workers.retain(|xpub_van, handle| {
            if handle.is_finished() {
                debug!(wallet = %xpub_van, "Wallet worker exited");
                false
            } else {
                true
            }
        });
    }

    /// Spawn a worker for every wallet needing work, up to the cap
    async fn spawn_needed(&mut self) {
        let wallets = match self.store.list_wallets_needing_work().await {
            Ok(wallets) => wallets,
            Err(e) => {
                error!(error = %e, "Failed to list wallets needing work");
                return;
            }
        };

        let max = self.config.orchestrator.max_wallet_workers;
        for wallet in wallets {
            if self.workers.contains_key(&wallet.xpub_van) {
                continue;
            }
            if self.workers.len() >= max {
                warn!(
                    wallet = %wallet.short_id(),
                    max,
                    "Worker cap reached, deferring wallet"
                );
                continue;
            }

            let wallet_id = wallet.short_id();
            let worker = WalletWorker::new(
                wallet.clone(),
                self.store.clone(),
                self.api.clone(),
                self.config.clone(),
            );
            let handle = tokio::spawn(worker.run(self.shutdown_tx.subscribe()));
            self.workers.insert(wallet.xpub_van, handle);
            info!(
                wallet = %wallet_id,
                live = self.workers.len(),
                max,
                "Spawned wallet worker"
            );
        }
    }

    /// Await worker termination within the drain window, then abort stragglers
    async fn drain(&mut self) {
        if self.workers.is_empty() {
            return;
        }
        info!(count = self.workers.len(), "Waiting for wallet workers to stop");

        let deadline = Instant::now() + SHUTDOWN_DRAIN_TIMEOUT;
        for (xpub_van, mut handle) in self.workers.drain() {
            let remaining = deadline.saturating_duration_since(Instant::now());
            match timeout(remaining, &mut handle).await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => {
                    error!(wallet = %xpub_van, error = %e, "Wallet worker task panicked");
                }
                Err(_) => {
                    warn!(wallet = %xpub_van, "Wallet worker did not stop in time, aborting");
                    handle.abort();
                }
            }
        }

        info!("All wallet workers stopped");
    }
}
