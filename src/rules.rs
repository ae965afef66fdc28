//! Validated channel rules
//!
//! Rules are loaded once per run. A rule that fails validation is dropped on
//! its own and reported as [`SyncError::ConfigInvalid`]; the others still run.

use chrono::{DateTime, Duration, Utc};
use regex::{Regex, RegexBuilder};
use std::collections::HashMap;
use tracing::{debug, error};

use crate::config::ChannelConfig;
use crate::error::SyncError;

/// Longest accepted recency window, a century of hours
pub const MAX_HOURS_LIMIT: u32 = 24 * 365 * 100;

/// Filter parameters for one channel → playlist pairing
#[derive(Debug, Clone)]
pub struct ChannelRule {
    pub channel_id: String,
    pub channel_name: String,
    pub playlist_id: String,
    pub playlist_name: String,
    pub title_pattern: Option<Regex>,
    pub min_duration: u64,
    pub max_duration: u64,
    pub hours_limit: u32,
}

impl ChannelRule {
    /// Pattern text as configured, for display
    pub fn pattern_str(&self) -> &str {
        self.title_pattern.as_ref().map(|r| r.as_str()).unwrap_or("*")
    }

    pub fn title_matches(&self, title: &str) -> bool {
        match &self.title_pattern {
            Some(pattern) => pattern.is_match(title),
            None => true,
        }
    }

    /// Oldest publish time still inside the recency window.
    /// Saturates at the earliest representable instant.
    pub fn recency_cutoff(&self, now: DateTime<Utc>) -> DateTime<Utc> {
        now.checked_sub_signed(Duration::hours(i64::from(self.hours_limit)))
            .unwrap_or(DateTime::<Utc>::MIN_UTC)
    }
}

/// Compiles each distinct pattern text once
#[derive(Debug, Default)]
pub struct PatternCache {
    compiled: HashMap<String, Result<Regex, String>>,
}

impl PatternCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Case-insensitive compile; errors are cached too so a bad pattern shared
    /// by several rules is reported identically for each
    pub fn compile(&mut self, pattern: &str) -> Result<Regex, String> {
        if let Some(cached) = self.compiled.get(pattern) {
            return cached.clone();
        }

        let result = RegexBuilder::new(pattern)
            .case_insensitive(true)
            .build()
            .map_err(|e| e.to_string());
        debug!("Compiled title pattern {:?} (ok: {})", pattern, result.is_ok());
        self.compiled.insert(pattern.to_string(), result.clone());
        result
    }

    pub fn len(&self) -> usize {
        self.compiled.len()
    }

    pub fn is_empty(&self) -> bool {
        self.compiled.is_empty()
    }
}

/// Outcome of validating every configured channel
#[derive(Debug, Default)]
pub struct RuleSet {
    pub rules: Vec<ChannelRule>,
    pub rejected: Vec<SyncError>,
}

impl RuleSet {
    /// Validate each configured rule independently, keeping config order
    pub fn from_config(channels: &[ChannelConfig]) -> Self {
        let mut patterns = PatternCache::new();
        let mut set = RuleSet::default();

        for channel in channels {
            match validate_rule(channel, &mut patterns) {
                Ok(rule) => set.rules.push(rule),
                Err(err) => {
                    error!("Skipping channel rule: {}", err);
                    set.rejected.push(err);
                }
            }
        }

        set
    }
}

/// Turn one config entry into a [`ChannelRule`]
pub fn validate_rule(
    channel: &ChannelConfig,
    patterns: &mut PatternCache,
) -> Result<ChannelRule, SyncError> {
    let label = if channel.channel_name.trim().is_empty() {
        channel.channel_id.clone()
    } else {
        channel.channel_name.clone()
    };
    let invalid = |reason: String| SyncError::ConfigInvalid {
        channel: label.clone(),
        reason,
    };

    if channel.channel_id.trim().is_empty() {
        return Err(invalid("channel_id must not be empty".to_string()));
    }
    if channel.playlist_id.trim().is_empty() {
        return Err(invalid("playlist_id must not be empty".to_string()));
    }
    if channel.hours_limit == 0 {
        return Err(invalid("hours_limit must be greater than zero".to_string()));
    }
    if channel.hours_limit > MAX_HOURS_LIMIT {
        return Err(invalid(format!(
            "hours_limit ({}) exceeds the maximum of {}",
            channel.hours_limit, MAX_HOURS_LIMIT
        )));
    }

    let max_duration = channel.max_duration.unwrap_or(u64::MAX);
    if channel.min_duration > max_duration {
        return Err(invalid(format!(
            "min_duration ({}) exceeds max_duration ({})",
            channel.min_duration, max_duration
        )));
    }

    let title_pattern = match channel.title_pattern.as_deref() {
        Some(pattern) if !pattern.is_empty() => Some(
            patterns
                .compile(pattern)
                .map_err(|e| invalid(format!("invalid title_pattern {:?}: {}", pattern, e)))?,
        ),
        _ => None,
    };

    Ok(ChannelRule {
        channel_id: channel.channel_id.trim().to_string(),
        channel_name: label.clone(),
        playlist_id: channel.playlist_id.trim().to_string(),
        playlist_name: channel
            .playlist_name
            .clone()
            .unwrap_or_else(|| channel.playlist_id.clone()),
        title_pattern,
        min_duration: channel.min_duration,
        max_duration,
        hours_limit: channel.hours_limit,
    })
}
