//! tubesentry - Quota-aware YouTube playlist synchronization
//!
//! tubesentry keeps playlists in sync with new uploads from a set of channels,
//! filtering by title pattern, duration and recency while spending as little of
//! the daily YouTube Data API quota as possible.
//!
//! ## Core Features
//!
//! - **Feed-first discovery**: public channel feeds cost no quota and are cached per channel
//! - **Quota governance**: every costed call is authorized against the daily budget
//! - **At-most-once adds**: a SQLite ledger with claims survives overlapping and crashed runs
//! - **Retention cleanup**: playlist entries past their age limit are removed
//! - **Configuration Management**: YAML-based configuration with XDG compliance
//!
//! ## Modules
//!
//! - [`config`]: Configuration management and parsing
//! - [`rules`]: Per-channel rule validation
//! - [`feed`]: Channel feed polling and parsing
//! - [`criteria`]: Candidate filtering
//! - [`ledger`]: Durable processing ledger
//! - [`quota`] and [`gateway`]: Budgeted access to the YouTube Data API
//! - [`sync`]: The per-run orchestrator

pub mod auth;
pub mod cache;
pub mod clock;
pub mod config;
pub mod criteria;
pub mod error;
pub mod feed;
pub mod gateway;
pub mod health;
pub mod ledger;
pub mod notify;
pub mod quota;
pub mod retry;
pub mod rules;
pub mod sync;
pub mod youtube;

pub use config::Config;
pub use error::SyncError;
pub use health::HealthCheck;
pub use ledger::Ledger;
pub use rules::{ChannelRule, RuleSet};
pub use sync::{RunAborted, RunContext, RunSummary, SyncOrchestrator};
