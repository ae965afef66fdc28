//! Preflight checks for `tubesentry doctor`
//!
//! Nothing here calls the network or spends quota.

use chrono::{DateTime, Utc};
use std::path::Path;

use crate::auth::TokenFile;
use crate::ledger::Ledger;
use crate::rules::RuleSet;
use crate::Config;

/// Result of system health checks
#[derive(Debug, Clone)]
pub struct HealthCheck {
    /// Channel rules and retention policies
    pub rules: CheckResult,
    /// Credential source
    pub credential: CheckResult,
    /// Ledger database
    pub ledger: CheckResult,
    /// Today's remaining quota (needs a readable ledger)
    pub quota: CheckResult,
}

/// Result of an individual health check
#[derive(Debug, Clone)]
pub struct CheckResult {
    pub passed: bool,
    pub message: String,
    pub details: Option<String>,
    pub is_warning: bool,
}

impl CheckResult {
    fn ok(message: impl Into<String>) -> Self {
        Self {
            passed: true,
            message: message.into(),
            details: None,
            is_warning: false,
        }
    }

    fn ok_with_details(message: impl Into<String>, details: impl Into<String>) -> Self {
        Self {
            passed: true,
            message: message.into(),
            details: Some(details.into()),
            is_warning: false,
        }
    }

    fn error_with_details(message: impl Into<String>, details: impl Into<String>) -> Self {
        Self {
            passed: false,
            message: message.into(),
            details: Some(details.into()),
            is_warning: false,
        }
    }

    fn warning_with_details(message: impl Into<String>, details: impl Into<String>) -> Self {
        Self {
            passed: true,
            message: message.into(),
            details: Some(details.into()),
            is_warning: true,
        }
    }
}

impl HealthCheck {
    /// Run all health checks
    pub fn run(config: &Config, now: DateTime<Utc>) -> Self {
        let (ledger, quota) = Self::check_ledger_and_quota(config, now);
        Self {
            rules: Self::check_rules(config),
            credential: Self::check_credential(config, now),
            ledger,
            quota,
        }
    }

    /// Check if all required checks passed (excludes warnings)
    pub fn all_passed(&self) -> bool {
        self.all_checks().iter().all(|(_, r)| r.passed)
    }

    /// Get list of failed checks (errors only, not warnings)
    pub fn errors(&self) -> Vec<&CheckResult> {
        self.all_checks()
            .into_iter()
            .map(|(_, r)| r)
            .filter(|r| !r.passed && !r.is_warning)
            .collect()
    }

    /// Get list of warnings
    pub fn warnings(&self) -> Vec<&CheckResult> {
        self.all_checks()
            .into_iter()
            .map(|(_, r)| r)
            .filter(|r| r.is_warning)
            .collect()
    }

    fn check_rules(config: &Config) -> CheckResult {
        let set = RuleSet::from_config(&config.channels);

        if config.channels.is_empty() {
            return CheckResult::warning_with_details(
                "No channel rules configured",
                "Add entries under `channels:` in the config file",
            );
        }
        if set.rules.is_empty() {
            let reasons: Vec<String> = set.rejected.iter().map(|e| e.to_string()).collect();
            return CheckResult::error_with_details("Every channel rule is invalid", reasons.join("\n"));
        }
        if !set.rejected.is_empty() {
            let reasons: Vec<String> = set.rejected.iter().map(|e| e.to_string()).collect();
            return CheckResult::warning_with_details(
                format!("{} of {} channel rules are invalid and will be skipped", set.rejected.len(), config.channels.len()),
                reasons.join("\n"),
            );
        }

        CheckResult::ok_with_details(
            format!("{} channel rule(s) valid", set.rules.len()),
            format!("{} retention policy(ies)", config.cleanup.len()),
        )
    }

    fn check_credential(config: &Config, now: DateTime<Utc>) -> CheckResult {
        match config.auth.method.as_str() {
            "env" => match std::env::var(&config.auth.token_env) {
                Ok(value) if !value.trim().is_empty() => {
                    CheckResult::ok(format!("Access token found in ${}", config.auth.token_env))
                }
                _ => CheckResult::error_with_details(
                    format!("${} is not set", config.auth.token_env),
                    "Export an OAuth access token with the youtube scope",
                ),
            },
            _ => Self::check_token_file(Path::new(&config.auth.token_file), now),
        }
    }

    fn check_token_file(path: &Path, now: DateTime<Utc>) -> CheckResult {
        if !path.exists() {
            return CheckResult::error_with_details(
                "Token file not found",
                format!("{}\nRun the OAuth consent flow and save the token JSON there", path.display()),
            );
        }

        match TokenFile::load(path) {
            Ok(token) if token.is_fresh_at(now) => {
                CheckResult::ok_with_details("Access token valid", path.display().to_string())
            }
            Ok(token) if token.refresh_token.is_some() => CheckResult::ok_with_details(
                "Access token expired, will be refreshed on the next run",
                path.display().to_string(),
            ),
            Ok(_) => CheckResult::error_with_details(
                "Access token expired and no refresh token is available",
                "Re-run the OAuth consent flow",
            ),
            Err(e) => CheckResult::error_with_details("Token file unreadable", format!("{:#}", e)),
        }
    }

    fn check_ledger_and_quota(config: &Config, now: DateTime<Utc>) -> (CheckResult, CheckResult) {
        let path = config.database_path();
        let ledger = match Ledger::open_at(path.clone()) {
            Ok(ledger) => ledger,
            Err(e) => {
                return (
                    CheckResult::error_with_details("Ledger unavailable", format!("{:#}", e)),
                    CheckResult::warning_with_details("Quota unknown", "The ledger could not be opened"),
                )
            }
        };

        let ledger_check = match ledger.history_len() {
            Ok(rows) => CheckResult::ok_with_details(
                "Ledger readable",
                format!("{} ({} history rows)", path.display(), rows),
            ),
            Err(e) => CheckResult::error_with_details("Ledger unreadable", format!("{:#}", e)),
        };

        let quota_check = match ledger.quota_for(now.date_naive()) {
            Ok(today) => {
                let budget = config.quota.daily_budget;
                let remaining = budget.saturating_sub(today.units_consumed);
                let details = format!(
                    "{} of {} units used today, {} saved",
                    today.units_consumed, budget, today.units_saved
                );
                if remaining == 0 {
                    CheckResult::error_with_details("Daily quota exhausted", details)
                } else if (today.units_consumed as f64) >= budget as f64 * config.quota.warning_ratio {
                    CheckResult::warning_with_details(format!("Only {} quota units left today", remaining), details)
                } else {
                    CheckResult::ok_with_details(format!("{} quota units left today", remaining), details)
                }
            }
            Err(e) => CheckResult::warning_with_details("Quota unknown", format!("{:#}", e)),
        };

        (ledger_check, quota_check)
    }

    /// Get all checks as an array for iteration
    pub fn all_checks(&self) -> [(&'static str, &CheckResult); 4] {
        [
            ("Rules", &self.rules),
            ("Credential", &self.credential),
            ("Ledger", &self.ledger),
            ("Quota", &self.quota),
        ]
    }
}
