//! Daily quota governor
//!
//! Every costed remote call asks for authorization first. The governor refuses
//! any call that would take the day's total past the budget, so the budget can
//! never be overrun by declared costs.

use std::sync::Arc;
use tracing::{debug, warn};

use crate::config::QuotaConfig;
use crate::error::{FailureClass, SyncError};
use crate::notify::{FatalNotifier, Severity};

/// Costed remote operations
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Operation {
    /// search.list over a channel's uploads
    ListChannelVideos,
    /// videos.list, one batch of up to 50 ids
    VideoDetails,
    /// playlistItems.list, one page of up to 50 items
    ListPlaylistItems,
    /// playlistItems.insert
    InsertPlaylistItem,
    /// playlistItems.delete
    DeletePlaylistItem,
}

impl Operation {
    pub fn cost(&self) -> u64 {
        match self {
            Operation::ListChannelVideos => 100,
            Operation::VideoDetails => 1,
            Operation::ListPlaylistItems => 1,
            Operation::InsertPlaylistItem => 50,
            Operation::DeletePlaylistItem => 50,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Operation::ListChannelVideos => "search.list",
            Operation::VideoDetails => "videos.list",
            Operation::ListPlaylistItems => "playlistItems.list",
            Operation::InsertPlaylistItem => "playlistItems.insert",
            Operation::DeletePlaylistItem => "playlistItems.delete",
        }
    }
}

/// Point-in-time view of today's usage
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QuotaUsage {
    pub budget: u64,
    pub consumed: u64,
    pub saved: u64,
    pub avoided: u64,
}

impl QuotaUsage {
    pub fn remaining(&self) -> u64 {
        self.budget.saturating_sub(self.consumed)
    }

    pub fn percent_used(&self) -> f64 {
        if self.budget == 0 {
            return 100.0;
        }
        self.consumed as f64 * 100.0 / self.budget as f64
    }
}

/// Counters not yet written to the ledger
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct QuotaDelta {
    pub consumed: u64,
    pub saved: u64,
    pub avoided: u64,
}

impl QuotaDelta {
    pub fn is_empty(&self) -> bool {
        self.consumed == 0 && self.saved == 0 && self.avoided == 0
    }
}

pub struct QuotaGovernor {
    budget: u64,
    warning_threshold: u64,
    consumed: u64,
    run_consumed: u64,
    saved: u64,
    avoided: u64,
    unflushed: QuotaDelta,
    warned: bool,
    alerts: Arc<FatalNotifier>,
}

impl QuotaGovernor {
    /// `already_consumed` is today's total from the ledger
    pub fn new(config: &QuotaConfig, already_consumed: u64, alerts: Arc<FatalNotifier>) -> Self {
        let warning_threshold = (config.daily_budget as f64 * config.warning_ratio).ceil() as u64;
        Self {
            budget: config.daily_budget,
            warning_threshold,
            consumed: already_consumed,
            run_consumed: 0,
            saved: 0,
            avoided: 0,
            unflushed: QuotaDelta::default(),
            warned: false,
            alerts,
        }
    }

    /// Charge for one operation, or refuse without charging.
    pub async fn authorize(&mut self, operation: Operation) -> Result<(), SyncError> {
        let cost = operation.cost();
        let projected = self.consumed + cost;

        if projected > self.budget {
            warn!(
                "Refusing {}: {} + {} units would exceed the daily budget of {}",
                operation.as_str(),
                self.consumed,
                cost,
                self.budget
            );
            return Err(SyncError::QuotaExceeded(format!(
                "{} needs {} units but only {} of {} remain",
                operation.as_str(),
                cost,
                self.budget.saturating_sub(self.consumed),
                self.budget
            )));
        }

        self.consumed = projected;
        self.run_consumed += cost;
        self.unflushed.consumed += cost;
        debug!(
            "Authorized {} ({} units, {}/{} used)",
            operation.as_str(),
            cost,
            self.consumed,
            self.budget
        );

        if !self.warned && self.consumed >= self.warning_threshold {
            self.warned = true;
            let message = format!(
                "Quota usage at {:.0}% ({}/{} units)",
                self.usage().percent_used(),
                self.consumed,
                self.budget
            );
            warn!("{}", message);
            self.alerts
                .notify_once("quota_warning", Severity::Warning, &message)
                .await;
        }

        Ok(())
    }

    /// Count an operation that was answered without the remote layer
    pub fn record_saved(&mut self, operation: Operation) {
        let units = operation.cost();
        self.saved += units;
        self.avoided += 1;
        self.unflushed.saved += units;
        self.unflushed.avoided += 1;
    }

    /// The remote says the budget is gone; refuse everything from here on
    pub fn mark_exhausted(&mut self) {
        if self.consumed < self.budget {
            let gap = self.budget - self.consumed;
            self.consumed = self.budget;
            debug!("Marked quota exhausted ({} units unaccounted locally)", gap);
        }
    }

    pub fn usage(&self) -> QuotaUsage {
        QuotaUsage {
            budget: self.budget,
            consumed: self.consumed,
            saved: self.saved,
            avoided: self.avoided,
        }
    }

    /// Units charged by this run alone
    pub fn run_consumed(&self) -> u64 {
        self.run_consumed
    }

    pub fn remaining(&self) -> u64 {
        self.budget.saturating_sub(self.consumed)
    }

    /// Hand over counters accumulated since the last flush
    pub fn take_unflushed(&mut self) -> QuotaDelta {
        std::mem::take(&mut self.unflushed)
    }

    /// Put counters back after a failed flush so they are not lost
    pub fn restore_unflushed(&mut self, delta: QuotaDelta) {
        self.unflushed.consumed += delta.consumed;
        self.unflushed.saved += delta.saved;
        self.unflushed.avoided += delta.avoided;
    }

    /// Decide how to treat a failed remote call
    pub fn classify(status: Option<u16>, reason: Option<&str>, message: &str) -> FailureClass {
        let reason = reason.unwrap_or("");
        let message = message.to_lowercase();
        let mentions = |needle: &str| reason.eq_ignore_ascii_case(needle) || message.contains(&needle.to_lowercase());

        if mentions("quotaExceeded") || mentions("dailyLimitExceeded") {
            return FailureClass::QuotaExceeded;
        }

        if status == Some(401)
            || message.contains("invalid_grant")
            || (message.contains("token") && (message.contains("expired") || message.contains("revoked")))
        {
            return FailureClass::TokenExpired;
        }

        if mentions("rateLimitExceeded") || mentions("userRateLimitExceeded") {
            return FailureClass::Transient;
        }

        match status {
            None => FailureClass::Transient,
            Some(408) | Some(429) => FailureClass::Transient,
            Some(code) if (500..600).contains(&code) => FailureClass::Transient,
            _ => FailureClass::Fatal,
        }
    }
}
