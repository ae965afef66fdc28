//! Sync Engine - one scheduled run over every channel rule
//!
//! Channels are processed strictly in order. For each one the engine pulls
//! cheap candidates from the feed, drops anything the ledger already knows,
//! filters on title and recency, confirms durations remotely in batches, and
//! only then claims, inserts and records. A retention pass runs last.

use chrono::{DateTime, Duration, Utc};
use std::collections::BTreeMap;
use std::fmt::Write as _;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{debug, error, info, warn};

use crate::cache::MemoryCache;
use crate::clock::Clock;
use crate::config::{Config, RetentionPolicy};
use crate::criteria::{evaluate, final_verdict, VideoCandidate, Verdict};
use crate::error::SyncError;
use crate::feed::{FeedFetcher, FeedSource, FeedStatus};
use crate::gateway::{RemoteGateway, Removal};
use crate::ledger::{ClaimOutcome, ExecutionRecord, Ledger};
use crate::notify::{FatalNotifier, Notifier, Severity};
use crate::quota::{Operation, QuotaGovernor};
use crate::retry::RetryConfig;
use crate::rules::{ChannelRule, RuleSet};
use crate::youtube::{PlaylistItem, VideoDetails, YouTubeApi};

static RUN_SEQUENCE: AtomicU64 = AtomicU64::new(0);

/// Collaborators a run is wired to
#[derive(Clone)]
pub struct RunContext {
    pub ledger: Arc<Ledger>,
    pub feed_fetcher: Arc<dyn FeedFetcher>,
    pub api: Arc<dyn YouTubeApi>,
    pub notifier: Arc<dyn Notifier>,
    pub clock: Arc<dyn Clock>,
}

/// Per-playlist results of a run
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PlaylistStats {
    pub playlist_name: String,
    pub added: u64,
    pub removed: u64,
    pub duration_added: u64,
    pub duration_removed: u64,
    pub added_titles: Vec<String>,
}

/// A channel that produced nothing this run, and why
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SkippedChannel {
    pub channel_name: String,
    pub reason: String,
}

/// Results of a sync run
#[derive(Debug, Clone, Default)]
pub struct RunSummary {
    pub run_id: String,
    pub dry_run: bool,
    /// Keyed by playlist id
    pub playlists: BTreeMap<String, PlaylistStats>,
    pub skipped_channels: Vec<SkippedChannel>,
    pub invalid_rules: Vec<String>,
    pub channels_processed: usize,
    pub degraded_feeds: usize,
    pub candidates_seen: u64,
    pub already_processed: u64,
    pub rejected: u64,
    pub claimed_elsewhere: u64,
    pub repaired: u64,
    pub quota_used: u64,
    pub quota_saved: u64,
    pub operations_avoided: u64,
}

impl RunSummary {
    fn playlist(&mut self, playlist_id: &str, playlist_name: &str) -> &mut PlaylistStats {
        self.playlists
            .entry(playlist_id.to_string())
            .or_insert_with(|| PlaylistStats {
                playlist_name: playlist_name.to_string(),
                ..Default::default()
            })
    }

    fn skip(&mut self, channel_name: &str, reason: String) {
        self.skipped_channels.push(SkippedChannel {
            channel_name: channel_name.to_string(),
            reason,
        });
    }

    pub fn total_added(&self) -> u64 {
        self.playlists.values().map(|p| p.added).sum()
    }

    pub fn total_removed(&self) -> u64 {
        self.playlists.values().map(|p| p.removed).sum()
    }

    pub fn total_duration_added(&self) -> u64 {
        self.playlists.values().map(|p| p.duration_added).sum()
    }

    pub fn total_duration_removed(&self) -> u64 {
        self.playlists.values().map(|p| p.duration_removed).sum()
    }

    /// Human readable report, also used as the summary notification
    pub fn render(&self) -> String {
        let mut out = String::new();
        let heading = if self.dry_run { "Sync run (dry run)" } else { "Sync run" };
        let _ = writeln!(out, "{} {}", heading, self.run_id);

        if self.playlists.is_empty() {
            let _ = writeln!(out, "No playlist changes");
        }
        for (playlist_id, stats) in &self.playlists {
            let _ = writeln!(
                out,
                "  {} ({}): +{} ({}) / -{} ({})",
                stats.playlist_name,
                playlist_id,
                stats.added,
                format_duration(stats.duration_added),
                stats.removed,
                format_duration(stats.duration_removed)
            );
            for title in &stats.added_titles {
                let _ = writeln!(out, "    + {}", title);
            }
        }

        for skipped in &self.skipped_channels {
            let _ = writeln!(out, "  skipped {}: {}", skipped.channel_name, skipped.reason);
        }
        if !self.invalid_rules.is_empty() {
            let _ = writeln!(out, "  {} invalid rule(s) ignored", self.invalid_rules.len());
        }

        let _ = write!(
            out,
            "Quota: {} units used, {} saved ({} calls avoided)",
            self.quota_used, self.quota_saved, self.operations_avoided
        );
        out
    }
}

/// A run that stopped early. The summary covers the work done before the stop.
#[derive(Debug, thiserror::Error)]
#[error("run aborted: {error}")]
pub struct RunAborted {
    pub error: SyncError,
    pub summary: RunSummary,
}

impl RunAborted {
    pub fn exit_code(&self) -> u8 {
        self.error.exit_code()
    }
}

/// `3725` -> `1h 02m 05s`
pub fn format_duration(seconds: u64) -> String {
    let hours = seconds / 3600;
    let minutes = (seconds % 3600) / 60;
    let secs = seconds % 60;
    if hours > 0 {
        format!("{}h {:02}m {:02}s", hours, minutes, secs)
    } else if minutes > 0 {
        format!("{}m {:02}s", minutes, secs)
    } else {
        format!("{}s", secs)
    }
}

/// Open the ledger for a run. A failure aborts the run with a critical
/// notification, like any other fatal condition.
pub async fn open_ledger(path: PathBuf, notifier: &dyn Notifier) -> Result<Arc<Ledger>, SyncError> {
    match Ledger::open_at(path) {
        Ok(ledger) => Ok(Arc::new(ledger)),
        Err(e) => {
            let err = SyncError::store(e);
            error!("{}", err);
            notifier
                .notify(Severity::Critical, &format!("Sync run aborted: {}", err))
                .await;
            Err(err)
        }
    }
}

pub struct SyncOrchestrator {
    rules: Vec<ChannelRule>,
    retention: Vec<RetentionPolicy>,
    ledger: Arc<Ledger>,
    feed: FeedSource,
    gateway: RemoteGateway,
    alerts: Arc<FatalNotifier>,
    clock: Arc<dyn Clock>,
    details_cache: MemoryCache<Option<VideoDetails>>,
    playlist_cache: MemoryCache<Vec<PlaylistItem>>,
    memory_ttl: Duration,
    claim_stale_after: Duration,
    remote_fallback: bool,
    remote_max_results: u32,
    send_summary: bool,
    dry_run: bool,
    summary: RunSummary,
}

impl SyncOrchestrator {
    /// Wire up a run. The governor starts from today's usage in the ledger.
    pub fn new(config: &Config, rules: RuleSet, ctx: RunContext, dry_run: bool) -> Result<Self, SyncError> {
        let invalid = |e: anyhow::Error| SyncError::ConfigInvalid {
            channel: "sync".to_string(),
            reason: format!("{:#}", e),
        };
        let feed_ttl = config.feed_cache_ttl().map_err(invalid)?;
        let memory_ttl = config.memory_cache_ttl().map_err(invalid)?;
        let claim_stale_after = config.claim_stale_after().map_err(invalid)?;

        let now = ctx.clock.now();
        let today = ctx.ledger.quota_for(now.date_naive()).map_err(SyncError::store)?;
        let alerts = Arc::new(FatalNotifier::new(Arc::clone(&ctx.notifier)));
        let governor = QuotaGovernor::new(&config.quota, today.units_consumed, Arc::clone(&alerts));
        debug!(
            "Quota seeded at {}/{} units for {}",
            today.units_consumed, config.quota.daily_budget, today.date
        );

        let summary = RunSummary {
            run_id: format!(
                "{}-{}-{}",
                now.format("%Y%m%dT%H%M%S"),
                std::process::id(),
                RUN_SEQUENCE.fetch_add(1, Ordering::Relaxed)
            ),
            dry_run,
            invalid_rules: rules.rejected.iter().map(|e| e.to_string()).collect(),
            ..Default::default()
        };

        Ok(Self {
            rules: rules.rules,
            retention: config.cleanup.clone(),
            feed: FeedSource::new(ctx.feed_fetcher, feed_ttl, Arc::clone(&ctx.clock)),
            gateway: RemoteGateway::new(ctx.api, governor, RetryConfig::from_api_config(&config.api)),
            details_cache: MemoryCache::new(Arc::clone(&ctx.clock)),
            playlist_cache: MemoryCache::new(Arc::clone(&ctx.clock)),
            ledger: ctx.ledger,
            alerts,
            clock: ctx.clock,
            memory_ttl,
            claim_stale_after,
            remote_fallback: config.feed.remote_fallback,
            remote_max_results: config.feed.remote_max_results,
            send_summary: config.notifications.send_summary,
            dry_run,
            summary,
        })
    }

    pub fn run_id(&self) -> &str {
        &self.summary.run_id
    }

    /// Process every channel, then the retention pass.
    pub async fn run(mut self) -> Result<RunSummary, RunAborted> {
        info!(
            "Starting sync run {} over {} channel(s){}",
            self.summary.run_id,
            self.rules.len(),
            if self.dry_run { " (dry run)" } else { "" }
        );

        let rules = std::mem::take(&mut self.rules);
        for rule in &rules {
            match self.process_channel(rule).await {
                Ok(()) => self.summary.channels_processed += 1,
                Err(err) if err.aborts_run() => return Err(self.abort(err).await),
                Err(err) => {
                    warn!("Skipping channel {}: {}", rule.channel_name, err);
                    self.summary.skip(&rule.channel_name, err.to_string());
                }
            }

            if let Err(err) = self.flush_quota() {
                return Err(self.abort(err).await);
            }
        }

        let policies = std::mem::take(&mut self.retention);
        for policy in &policies {
            match self.cleanup_playlist(policy).await {
                Ok(()) => {}
                Err(err) if err.aborts_run() => return Err(self.abort(err).await),
                Err(err) => warn!("Cleanup of playlist {} failed: {}", policy.playlist_id, err),
            }
        }

        if let Err(err) = self.finish("completed") {
            return Err(self.abort(err).await);
        }

        info!(
            "Sync run {} completed: {} added, {} removed, {} skipped channel(s), {} quota units used",
            self.summary.run_id,
            self.summary.total_added(),
            self.summary.total_removed(),
            self.summary.skipped_channels.len(),
            self.summary.quota_used
        );

        if self.send_summary {
            self.alerts.notify(Severity::Info, &self.summary.render()).await;
        }

        Ok(self.summary)
    }

    async fn process_channel(&mut self, rule: &ChannelRule) -> Result<(), SyncError> {
        let now = self.clock.now();
        let candidates = self.discover(rule, now).await?;
        if candidates.is_empty() {
            debug!("No recent uploads for {}", rule.channel_name);
            return Ok(());
        }

        let mut ready = Vec::new();
        let mut pending = Vec::new();

        for candidate in candidates {
            self.summary.candidates_seen += 1;

            if self.ledger.has_been_processed(&candidate.video_id).map_err(SyncError::store)? {
                debug!("{} already processed", candidate.video_id);
                self.summary.already_processed += 1;
                self.gateway.governor_mut().record_saved(Operation::VideoDetails);
                continue;
            }

            match evaluate(&candidate, rule, now) {
                Verdict::Accept => ready.push(candidate),
                Verdict::NeedsConfirmation => pending.push(candidate),
                Verdict::Reject(reason) => {
                    debug!("Rejected {} ({}): {}", candidate.video_id, candidate.title, reason);
                    self.summary.rejected += 1;
                    self.gateway.governor_mut().record_saved(Operation::VideoDetails);
                }
            }
        }

        for candidate in self.confirm(pending).await? {
            match final_verdict(&candidate, rule, now) {
                Verdict::Accept => ready.push(candidate),
                verdict => {
                    debug!("Rejected {} after confirmation: {:?}", candidate.video_id, verdict);
                    self.summary.rejected += 1;
                }
            }
        }

        for candidate in ready {
            self.commit(rule, candidate).await?;
        }

        Ok(())
    }

    /// Candidates from the feed, or the costed search when the feed is gone
    async fn discover(&mut self, rule: &ChannelRule, now: DateTime<Utc>) -> Result<Vec<VideoCandidate>, SyncError> {
        let batch = self.feed.get_recent_videos(rule).await;

        match batch.status {
            FeedStatus::Unavailable if self.remote_fallback => {
                info!("Feed unavailable for {}, listing uploads remotely", rule.channel_name);
                let published_after = rule.recency_cutoff(now);
                self.gateway
                    .list_channel_videos(&rule.channel_id, published_after, self.remote_max_results)
                    .await
            }
            FeedStatus::Unavailable => Err(SyncError::OperationFailed {
                operation: format!("feed {}", rule.channel_id),
                message: "feed unavailable and not cached".to_string(),
            }),
            status => {
                if status == FeedStatus::Degraded {
                    self.summary.degraded_feeds += 1;
                }
                self.gateway.governor_mut().record_saved(Operation::ListChannelVideos);
                debug!(
                    "{}: {} of {} feed entries are recent ({})",
                    rule.channel_name,
                    batch.total_entries() - batch.stale_count(),
                    batch.total_entries(),
                    status.as_str()
                );
                Ok(batch.candidates().collect())
            }
        }
    }

    /// Merge remote details into candidates, one batched lookup for the misses.
    /// Videos the API does not return are dropped.
    async fn confirm(&mut self, mut pending: Vec<VideoCandidate>) -> Result<Vec<VideoCandidate>, SyncError> {
        if pending.is_empty() {
            return Ok(pending);
        }

        let mut misses = Vec::new();
        for candidate in &pending {
            if self.details_cache.get(&candidate.video_id).is_some() {
                self.gateway.governor_mut().record_saved(Operation::VideoDetails);
            } else if !misses.contains(&candidate.video_id) {
                misses.push(candidate.video_id.clone());
            }
        }

        if !misses.is_empty() {
            let found = self.gateway.video_details(&misses).await?;
            for id in misses {
                let details = found.get(&id).cloned();
                self.details_cache.insert(id, details, self.memory_ttl);
            }
        }

        pending.retain_mut(|candidate| match self.details_cache.get(&candidate.video_id).flatten() {
            Some(details) => {
                candidate.confirm(&details);
                true
            }
            None => {
                info!("Video {} is not available remotely, dropping it", candidate.video_id);
                self.summary.rejected += 1;
                false
            }
        });

        Ok(pending)
    }

    async fn playlist_items(&mut self, playlist_id: &str) -> Result<Vec<PlaylistItem>, SyncError> {
        let gateway = &mut self.gateway;
        self.playlist_cache
            .get_or_compute(playlist_id, self.memory_ttl, move || async move {
                gateway.list_playlist_items(playlist_id).await
            })
            .await
    }

    /// Claim, re-check membership, insert if needed, record
    async fn commit(&mut self, rule: &ChannelRule, candidate: VideoCandidate) -> Result<(), SyncError> {
        let duration = candidate.duration_seconds.unwrap_or_default();

        if self.dry_run {
            info!(
                "[dry run] would add {} ({}) to {}",
                candidate.video_id, candidate.title, rule.playlist_name
            );
            let stats = self.summary.playlist(&rule.playlist_id, &rule.playlist_name);
            stats.added += 1;
            stats.duration_added += duration;
            stats.added_titles.push(candidate.title);
            return Ok(());
        }

        let run_id = self.summary.run_id.clone();
        let claim = self
            .ledger
            .try_claim(
                &candidate.video_id,
                &rule.playlist_id,
                &run_id,
                self.clock.now(),
                self.claim_stale_after,
            )
            .map_err(SyncError::store)?;

        match claim {
            ClaimOutcome::Held { run_id: holder } => {
                info!("{} is being added by run {}, skipping", candidate.video_id, holder);
                self.summary.claimed_elsewhere += 1;
                return Ok(());
            }
            ClaimOutcome::AlreadyProcessed => {
                self.summary.already_processed += 1;
                return Ok(());
            }
            ClaimOutcome::TakenOver { .. } | ClaimOutcome::Acquired => {}
        }

        match self.add_claimed(rule, &candidate).await {
            Ok(()) => {
                let stats = self.summary.playlist(&rule.playlist_id, &rule.playlist_name);
                stats.added += 1;
                stats.duration_added += duration;
                stats.added_titles.push(candidate.title);
                Ok(())
            }
            Err(err) => {
                if let Err(e) = self.ledger.release_claim(&candidate.video_id, &run_id) {
                    warn!("Failed to release claim on {}: {:#}", candidate.video_id, e);
                }
                Err(err)
            }
        }
    }

    async fn add_claimed(&mut self, rule: &ChannelRule, candidate: &VideoCandidate) -> Result<(), SyncError> {
        let members = self.playlist_items(&rule.playlist_id).await?;

        if members.iter().any(|item| item.video_id == candidate.video_id) {
            info!(
                "{} is already in {}, recording it without a new insert",
                candidate.video_id, rule.playlist_name
            );
            self.summary.repaired += 1;
            self.gateway.governor_mut().record_saved(Operation::InsertPlaylistItem);
        } else {
            let item = self.gateway.add_to_playlist(&rule.playlist_id, &candidate.video_id).await?;
            self.playlist_cache.update(&rule.playlist_id, |items| items.push(item));
            info!(
                "Added {} ({}) to {}",
                candidate.video_id, candidate.title, rule.playlist_name
            );
        }

        self.ledger
            .record_added(
                &candidate.video_id,
                &rule.playlist_id,
                &rule.channel_name,
                candidate.duration_seconds,
                self.clock.now(),
            )
            .map_err(SyncError::store)?;
        Ok(())
    }

    /// Remove items older than the policy's retention age
    async fn cleanup_playlist(&mut self, policy: &RetentionPolicy) -> Result<(), SyncError> {
        let now = self.clock.now();
        let cutoff = policy.cutoff(now);
        let playlist_name = policy.playlist_name.clone().unwrap_or_else(|| policy.playlist_id.clone());

        let items = self.playlist_items(&policy.playlist_id).await?;
        let expired: Vec<PlaylistItem> = items
            .into_iter()
            .filter(|item| item.age_reference().is_some_and(|at| at < cutoff))
            .collect();

        if expired.is_empty() {
            debug!("Nothing older than {} days in {}", policy.max_age_days, playlist_name);
            return Ok(());
        }
        info!(
            "{} item(s) in {} are older than {} days",
            expired.len(),
            playlist_name,
            policy.max_age_days
        );

        for item in expired {
            let record = self.ledger.get_record(&item.video_id).map_err(SyncError::store)?;
            let duration = record.as_ref().and_then(|r| r.duration_seconds).unwrap_or_default();

            if self.dry_run {
                info!("[dry run] would remove {} ({}) from {}", item.video_id, item.title, playlist_name);
            } else {
                match self.gateway.remove_from_playlist(&item.item_id).await? {
                    Removal::Removed => info!("Removed {} ({}) from {}", item.video_id, item.title, playlist_name),
                    Removal::NotFound => debug!("{} was already removed from {}", item.video_id, playlist_name),
                }

                let channel_name = record
                    .map(|r| r.channel_name)
                    .unwrap_or_else(|| "unknown".to_string());
                self.ledger
                    .record_removed(&item.video_id, &policy.playlist_id, &channel_name, now)
                    .map_err(SyncError::store)?;
                self.playlist_cache
                    .update(&policy.playlist_id, |items| items.retain(|i| i.item_id != item.item_id));
            }

            let stats = self.summary.playlist(&policy.playlist_id, &playlist_name);
            stats.removed += 1;
            stats.duration_removed += duration;
        }

        Ok(())
    }

    /// Persist quota counters accumulated since the last flush
    fn flush_quota(&mut self) -> Result<(), SyncError> {
        let governor = self.gateway.governor_mut();
        let delta = governor.take_unflushed();
        if delta.is_empty() {
            return Ok(());
        }

        let today = self.clock.now().date_naive();
        if let Err(e) = self
            .ledger
            .accumulate_quota(today, delta.consumed, delta.saved, delta.avoided)
        {
            self.gateway.governor_mut().restore_unflushed(delta);
            return Err(SyncError::store(e));
        }
        debug!("Flushed quota: {} used, {} saved", delta.consumed, delta.saved);
        Ok(())
    }

    /// Final flush, summary totals and the execution row
    fn finish(&mut self, outcome: &str) -> Result<(), SyncError> {
        self.flush_quota()?;

        let usage = self.gateway.governor().usage();
        self.summary.quota_used = self.gateway.governor().run_consumed();
        self.summary.quota_saved = usage.saved;
        self.summary.operations_avoided = usage.avoided;

        if self.dry_run {
            return Ok(());
        }

        let record = ExecutionRecord {
            timestamp: self.clock.now(),
            quota_used: self.summary.quota_used,
            videos_added: self.summary.total_added(),
            videos_removed: self.summary.total_removed(),
            duration_added: self.summary.total_duration_added(),
            duration_removed: self.summary.total_duration_removed(),
            outcome: outcome.to_string(),
        };
        self.ledger.record_execution(&record).map_err(SyncError::store)?;
        Ok(())
    }

    /// Notify once, persist what can be persisted, and stop
    async fn abort(mut self, error: SyncError) -> RunAborted {
        error!("Aborting sync run {}: {}", self.summary.run_id, error);

        let message = format!("Sync run aborted: {}", error);
        self.alerts
            .notify_once(error.condition(), Severity::Critical, &message)
            .await;

        let outcome = format!("aborted: {}", error.condition());
        if let Err(e) = self.finish(&outcome) {
            warn!("Could not persist the aborted run: {}", e);
        }

        RunAborted {
            error,
            summary: self.summary,
        }
    }
}
