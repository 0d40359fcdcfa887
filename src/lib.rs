//! Wallet-state refresh orchestration for an RGB node
//!
//! Maintains a durable PostgreSQL job queue, a registry of transfer
//! watchers, and per-wallet advisory locks, and fans refresh work out to
//! one worker task per wallet with bounded parallelism.

pub mod api;
pub mod config;
pub mod db;
pub mod handler;
pub mod orchestrator;
pub mod watcher;
pub mod worker;
