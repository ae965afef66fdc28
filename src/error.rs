//! Failure taxonomy for a sync run
//!
//! Every failure that changes control flow is a [`SyncError`]. Its scope
//! decides how far it travels: per-rule errors stay with the rule, per-channel
//! errors skip the channel, and budget/credential/store errors end the run.

use thiserror::Error;

/// How a remote failure should be treated, as decided by the quota governor
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureClass {
    /// Worth retrying with backoff (timeouts, 5xx, rate limiting)
    Transient,
    /// The daily budget is gone
    QuotaExceeded,
    /// No usable credential
    TokenExpired,
    /// Retrying will not help
    Fatal,
}

impl FailureClass {
    pub fn as_str(&self) -> &'static str {
        match self {
            FailureClass::Transient => "transient",
            FailureClass::QuotaExceeded => "quota_exceeded",
            FailureClass::TokenExpired => "token_expired",
            FailureClass::Fatal => "fatal",
        }
    }
}

#[derive(Debug, Clone, Error)]
pub enum SyncError {
    #[error("network error during {operation}: {message}")]
    NetworkTransient { operation: String, message: String },

    #[error("quota exceeded: {0}")]
    QuotaExceeded(String),

    #[error("credential expired or revoked: {0}")]
    TokenExpired(String),

    #[error("invalid rule for channel '{channel}': {reason}")]
    ConfigInvalid { channel: String, reason: String },

    #[error("ledger unavailable: {0}")]
    StoreUnavailable(String),

    #[error("{operation} failed: {message}")]
    OperationFailed { operation: String, message: String },
}

impl SyncError {
    /// Wrap a ledger failure. The run cannot guarantee dedupe without the ledger.
    pub fn store(err: anyhow::Error) -> Self {
        SyncError::StoreUnavailable(format!("{:#}", err))
    }

    pub fn class(&self) -> FailureClass {
        match self {
            SyncError::NetworkTransient { .. } => FailureClass::Transient,
            SyncError::QuotaExceeded(_) => FailureClass::QuotaExceeded,
            SyncError::TokenExpired(_) => FailureClass::TokenExpired,
            SyncError::ConfigInvalid { .. }
            | SyncError::StoreUnavailable(_)
            | SyncError::OperationFailed { .. } => FailureClass::Fatal,
        }
    }

    /// Whether this failure must stop the whole run rather than one channel
    pub fn aborts_run(&self) -> bool {
        matches!(
            self,
            SyncError::QuotaExceeded(_) | SyncError::TokenExpired(_) | SyncError::StoreUnavailable(_)
        )
    }

    /// Stable key for the condition, used to notify at most once per run
    pub fn condition(&self) -> &'static str {
        match self {
            SyncError::NetworkTransient { .. } => "network_transient",
            SyncError::QuotaExceeded(_) => "quota_exceeded",
            SyncError::TokenExpired(_) => "token_expired",
            SyncError::ConfigInvalid { .. } => "config_invalid",
            SyncError::StoreUnavailable(_) => "store_unavailable",
            SyncError::OperationFailed { .. } => "operation_failed",
        }
    }

    /// Process exit code for a run that ended with this error
    pub fn exit_code(&self) -> u8 {
        match self {
            SyncError::QuotaExceeded(_) => 2,
            SyncError::TokenExpired(_) => 3,
            SyncError::StoreUnavailable(_) => 4,
            _ => 1,
        }
    }
}
