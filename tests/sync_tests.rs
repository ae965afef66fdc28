mod common;

use assert_matches::assert_matches;
use chrono::Duration;
use common::{channel, hours_ago, now, Harness};
use tubesentry::config::RetentionPolicy;
use tubesentry::ledger::{ClaimOutcome, VideoStatus};
use tubesentry::notify::Severity;
use tubesentry::youtube::ApiFailure;
use tubesentry::SyncError;

#[tokio::test]
async fn test_filters_and_adds_matching_upload() {
    let mut h = Harness::new(vec![channel("UC1", "PL1", Some(r"(?i)\bAI\b"))]);
    h.config.channels[0].max_duration = Some(900);
    h.publish(
        "UC1",
        &[
            ("short", "AI in 45 seconds", hours_ago(1), 45),
            ("weekly", "Weekly AI Update", hours_ago(2), 300),
            ("stale", "AI deep dive", hours_ago(10), 300),
            ("cooking", "Cooking with friends", hours_ago(3), 600),
        ],
    );

    let summary = h.run().await.unwrap();

    assert_eq!(h.api.playlist("PL1"), vec!["weekly".to_string()]);
    assert_eq!(summary.total_added(), 1);
    assert_eq!(summary.total_duration_added(), 300);
    // "stale" never leaves the feed window, the other two are rejected
    assert_eq!(summary.candidates_seen, 3);
    assert_eq!(summary.rejected, 2);
    assert_eq!(h.api.calls("videos"), 1);
    assert_eq!(h.api.calls("insert"), 1);

    let record = h.ledger.get_record("weekly").unwrap().unwrap();
    assert_eq!(record.status, VideoStatus::Added);
    assert_eq!(record.playlist_id, "PL1");
    assert_eq!(record.channel_name, "UC1 name");
    assert_eq!(record.duration_seconds, Some(300));
    assert!(!h.ledger.has_been_processed("short").unwrap());
}

#[tokio::test]
async fn test_second_run_is_idempotent() {
    let h = Harness::new(vec![channel("UC1", "PL1", None)]);
    h.publish("UC1", &[("v1", "First upload", hours_ago(1), 600)]);

    let first = h.run().await.unwrap();
    assert_eq!(first.total_added(), 1);
    let history_after_first = h.ledger.history_len().unwrap();

    let second = h.run().await.unwrap();
    assert_eq!(second.total_added(), 0);
    assert_eq!(second.already_processed, 1);
    assert_eq!(second.quota_used, 0);
    assert!(second.quota_saved > 0);

    assert_eq!(h.ledger.history_len().unwrap(), history_after_first);
    assert_eq!(h.api.calls("insert"), 1);
    assert_eq!(h.ledger.history_for("v1").unwrap(), vec![VideoStatus::Added]);
}

#[tokio::test]
async fn test_overlapping_runs_add_once() {
    let h = Harness::new(vec![channel("UC1", "PL1", None)]);
    h.publish("UC1", &[("v1", "Overlap", hours_ago(1), 600)]);

    let (a, b) = tokio::join!(h.orchestrator(false).run(), h.orchestrator(false).run());
    let added = a.unwrap().total_added() + b.unwrap().total_added();

    assert_eq!(added, 1);
    assert_eq!(h.api.calls("insert"), 1);
    assert_eq!(h.api.playlist("PL1"), vec!["v1".to_string()]);
    assert_eq!(h.ledger.history_for("v1").unwrap(), vec![VideoStatus::Added]);
}

#[tokio::test]
async fn test_live_claim_from_other_run_is_respected() {
    let h = Harness::new(vec![channel("UC1", "PL1", None)]);
    h.publish("UC1", &[("v1", "Contended", hours_ago(1), 600)]);
    let claim = h
        .ledger
        .try_claim("v1", "PL1", "other-run", now() - Duration::minutes(5), Duration::minutes(30))
        .unwrap();
    assert_eq!(claim, ClaimOutcome::Acquired);

    let summary = h.run().await.unwrap();
    assert_eq!(summary.claimed_elsewhere, 1);
    assert_eq!(summary.total_added(), 0);
    assert_eq!(h.api.calls("insert"), 0);
    assert!(!h.ledger.has_been_processed("v1").unwrap());

    // Once the other run's claim goes stale this run takes over
    h.clock.advance(Duration::minutes(40));
    let summary = h.run().await.unwrap();
    assert_eq!(summary.total_added(), 1);
    assert_eq!(h.api.calls("insert"), 1);
}

#[tokio::test]
async fn test_crashed_add_is_repaired_without_second_insert() {
    let h = Harness::new(vec![channel("UC1", "PL1", None)]);
    h.publish("UC1", &[("v1", "Half done", hours_ago(1), 600)]);
    // A previous run inserted remotely and died before the ledger write
    h.ledger
        .try_claim("v1", "PL1", "crashed-run", now() - Duration::hours(2), Duration::minutes(30))
        .unwrap();
    h.api.seed_playlist_item("PL1", "v1", Some(hours_ago(1)));

    let summary = h.run().await.unwrap();

    assert_eq!(summary.repaired, 1);
    assert_eq!(summary.total_added(), 1);
    assert_eq!(h.api.calls("insert"), 0);
    assert_eq!(h.api.playlist("PL1").len(), 1);
    assert_eq!(h.ledger.history_for("v1").unwrap(), vec![VideoStatus::Added]);
}

#[tokio::test]
async fn test_quota_warning_then_abort() {
    let h = Harness::new(vec![channel("UC1", "PL1", None), channel("UC2", "PL2", None)]);
    h.ledger.accumulate_quota(now().date_naive(), 9_900, 0, 0).unwrap();
    h.publish(
        "UC1",
        &[
            ("v1", "One", hours_ago(1), 600),
            ("v2", "Two", hours_ago(2), 600),
            ("v3", "Three", hours_ago(3), 600),
        ],
    );
    h.publish("UC2", &[("w1", "Other", hours_ago(1), 600)]);

    let aborted = h.run().await.unwrap_err();

    assert_matches!(aborted.error, SyncError::QuotaExceeded(_));
    assert_eq!(aborted.exit_code(), 2);
    assert_eq!(h.notifier.count(Severity::Warning), 1);
    assert_eq!(h.notifier.count(Severity::Critical), 1);

    // 9900 + details (1) + playlist page (1) + one insert (50); the second insert is refused
    assert_eq!(h.api.calls("insert"), 1);
    assert_eq!(aborted.summary.total_added(), 1);
    assert!(h.ledger.has_been_processed("v1").unwrap());
    assert!(!h.ledger.has_been_processed("v2").unwrap());
    assert_eq!(h.ledger.quota_for(now().date_naive()).unwrap().units_consumed, 9_952);

    // No further channel is touched after the abort
    assert_eq!(h.feed.fetches("UC2"), 0);

    let stats = h.ledger.stats_summary(now()).unwrap();
    assert_eq!(stats[0].runs, 1);
    assert_eq!(stats[0].videos_added, 1);
}

#[tokio::test]
async fn test_revoked_token_aborts_run() {
    let h = Harness::new(vec![channel("UC1", "PL1", None), channel("UC2", "PL2", None)]);
    h.publish("UC1", &[("v1", "One", hours_ago(1), 600)]);
    h.publish("UC2", &[("w1", "Other", hours_ago(1), 600)]);
    h.api
        .fail_next("videos", ApiFailure::new(401, Some("authError"), "Invalid Credentials"));

    let aborted = h.run().await.unwrap_err();

    assert_matches!(aborted.error, SyncError::TokenExpired(_));
    assert_eq!(aborted.exit_code(), 3);
    assert_eq!(h.notifier.count(Severity::Critical), 1);
    assert_eq!(h.feed.fetches("UC2"), 0);
    assert_eq!(h.api.calls("insert"), 0);
}

#[tokio::test]
async fn test_transient_insert_failure_is_retried() {
    let h = Harness::new(vec![channel("UC1", "PL1", None)]);
    h.publish("UC1", &[("v1", "Flaky", hours_ago(1), 600)]);
    h.api
        .fail_next("insert", ApiFailure::new(503, Some("backendError"), "Backend Error"));

    let summary = h.run().await.unwrap();

    assert_eq!(summary.total_added(), 1);
    assert_eq!(h.api.calls("insert"), 2);
    assert_eq!(h.api.calls("playlistItems"), 2);
    // Every attempt is charged: details 1, playlist page 1, two inserts,
    // and the membership check between them
    assert_eq!(summary.quota_used, 103);
}

#[tokio::test]
async fn test_insert_applied_despite_timeout_is_not_duplicated() {
    let h = Harness::new(vec![channel("UC1", "PL1", None)]);
    h.publish("UC1", &[("v1", "Slow response", hours_ago(1), 600)]);
    h.api.lose_next_insert_response(ApiFailure::transport("operation timed out"));

    let summary = h.run().await.unwrap();

    assert_eq!(summary.total_added(), 1);
    assert_eq!(h.api.playlist("PL1"), vec!["v1".to_string()]);
    assert_eq!(h.api.calls("insert"), 1);
    assert_eq!(summary.quota_used, 1 + 1 + 50 + 1);

    let record = h.ledger.get_record("v1").unwrap().unwrap();
    assert_eq!(record.status, VideoStatus::Added);
    assert_eq!(record.timestamp, now());
}

#[tokio::test]
async fn test_channel_failure_skips_only_that_channel() {
    let h = Harness::new(vec![channel("UC1", "PL1", None), channel("UC2", "PL2", None)]);
    h.publish("UC1", &[("v1", "Broken", hours_ago(1), 600)]);
    h.publish("UC2", &[("w1", "Fine", hours_ago(1), 600)]);
    for _ in 0..3 {
        h.api.fail_next("videos", ApiFailure::transport("connection reset"));
    }

    let summary = h.run().await.unwrap();

    assert_eq!(summary.skipped_channels.len(), 1);
    assert_eq!(summary.skipped_channels[0].channel_name, "UC1 name");
    assert!(summary.skipped_channels[0].reason.contains("gave up after 3 attempts"));
    assert_eq!(h.api.playlist("PL2"), vec!["w1".to_string()]);
    assert!(!h.ledger.has_been_processed("v1").unwrap());
    assert_eq!(h.notifier.count(Severity::Critical), 0);
}

#[tokio::test]
async fn test_not_found_is_fatal_for_the_channel() {
    let h = Harness::new(vec![channel("UC1", "PL1", None), channel("UC2", "PL2", None)]);
    h.publish("UC1", &[("v1", "Gone playlist", hours_ago(1), 600)]);
    h.publish("UC2", &[("w1", "Fine", hours_ago(1), 600)]);
    h.api
        .fail_next("playlistItems", ApiFailure::new(404, Some("playlistNotFound"), "Playlist not found"));

    let summary = h.run().await.unwrap();

    assert_eq!(summary.skipped_channels.len(), 1);
    assert_eq!(summary.total_added(), 1);
    assert_eq!(h.api.calls("playlistItems"), 2);
    // The claim on v1 was released, so a later run can retry it
    let claim = h
        .ledger
        .try_claim("v1", "PL1", "later-run", now(), Duration::minutes(30))
        .unwrap();
    assert_eq!(claim, ClaimOutcome::Acquired);
}

#[tokio::test]
async fn test_invalid_rule_does_not_block_others() {
    let h = Harness::new(vec![
        channel("UCbad", "PL0", Some("[unclosed")),
        channel("UC1", "PL1", None),
    ]);
    h.publish("UC1", &[("v1", "Works", hours_ago(1), 600)]);

    let summary = h.run().await.unwrap();

    assert_eq!(summary.invalid_rules.len(), 1);
    assert!(summary.invalid_rules[0].contains("UCbad"));
    assert_eq!(summary.total_added(), 1);
    assert_eq!(h.feed.fetches("UCbad"), 0);
}

#[tokio::test]
async fn test_out_of_range_hours_limit_only_drops_its_rule() {
    let mut h = Harness::new(vec![channel("UCbig", "PL0", None), channel("UC1", "PL1", None)]);
    h.config.channels[0].hours_limit = 3_000_000_000;
    h.publish("UCbig", &[("b1", "Too far back", hours_ago(1), 600)]);
    h.publish("UC1", &[("v1", "Works", hours_ago(1), 600)]);

    let summary = h.run().await.unwrap();

    assert_eq!(summary.invalid_rules.len(), 1);
    assert!(summary.invalid_rules[0].contains("hours_limit"));
    assert_eq!(h.api.playlist("PL1"), vec!["v1".to_string()]);
    assert_eq!(h.feed.fetches("UCbig"), 0);
}

#[tokio::test]
async fn test_unavailable_feed_skips_channel() {
    let h = Harness::new(vec![channel("UC9", "PL9", None), channel("UC1", "PL1", None)]);
    h.publish("UC1", &[("v1", "Works", hours_ago(1), 600)]);

    let summary = h.run().await.unwrap();

    assert_eq!(summary.skipped_channels.len(), 1);
    assert!(summary.skipped_channels[0].reason.contains("feed unavailable"));
    assert_eq!(summary.total_added(), 1);
    assert_eq!(h.api.calls("search"), 0);
}

#[tokio::test]
async fn test_remote_fallback_lists_uploads() {
    let mut h = Harness::new(vec![channel("UC9", "PL9", None)]);
    h.config.feed.remote_fallback = true;
    h.api.add_upload("UC9", "r1", "Found by search", hours_ago(1));
    h.api.add_video("r1", "Found by search", hours_ago(1), 600);

    let summary = h.run().await.unwrap();

    assert_eq!(h.api.calls("search"), 1);
    assert_eq!(summary.total_added(), 1);
    assert!(summary.skipped_channels.is_empty());
    assert_eq!(summary.quota_used, 100 + 1 + 1 + 50);
}

#[tokio::test]
async fn test_cleanup_removes_expired_items() {
    let mut h = Harness::new(vec![]);
    h.config.cleanup = vec![RetentionPolicy {
        playlist_id: "PLR".to_string(),
        playlist_name: Some("Recent".to_string()),
        max_age_days: 2,
    }];
    h.api.seed_playlist_item("PLR", "gone", Some(now() - Duration::days(5)));
    h.api.seed_playlist_item("PLR", "old", Some(now() - Duration::days(3)));
    h.api.seed_playlist_item("PLR", "fresh", Some(hours_ago(1)));
    h.ledger.record_added("old", "PLR", "Tech", Some(600), hours_ago(72)).unwrap();
    // Someone else deleted "gone" between our listing and our delete
    h.api
        .fail_next("delete", ApiFailure::new(404, Some("playlistItemNotFound"), "Not found"));

    let summary = h.run().await.unwrap();

    let stats = &summary.playlists["PLR"];
    assert_eq!(stats.playlist_name, "Recent");
    assert_eq!(stats.removed, 2);
    assert_eq!(stats.duration_removed, 600);
    assert!(!h.api.playlist("PLR").contains(&"old".to_string()));
    assert!(h.api.playlist("PLR").contains(&"fresh".to_string()));

    assert_eq!(
        h.ledger.history_for("old").unwrap(),
        vec![VideoStatus::Added, VideoStatus::Removed]
    );
    let gone = h.ledger.get_record("gone").unwrap().unwrap();
    assert_eq!(gone.status, VideoStatus::Removed);
    assert_eq!(gone.channel_name, "unknown");
    assert_eq!(gone.timestamp, now());
    assert!(!h.ledger.has_been_processed("fresh").unwrap());
}

#[tokio::test]
async fn test_cleanup_with_unbounded_retention_keeps_everything() {
    let mut h = Harness::new(vec![]);
    h.config.cleanup = vec![RetentionPolicy {
        playlist_id: "PLR".to_string(),
        playlist_name: None,
        max_age_days: u32::MAX,
    }];
    h.api.seed_playlist_item("PLR", "ancient", Some(now() - Duration::days(20_000)));

    let summary = h.run().await.unwrap();

    assert_eq!(summary.total_removed(), 0);
    assert_eq!(h.api.playlist("PLR"), vec!["ancient".to_string()]);
    assert_eq!(h.api.calls("delete"), 0);
}

#[tokio::test]
async fn test_dry_run_changes_nothing() {
    let mut h = Harness::new(vec![channel("UC1", "PL1", None)]);
    h.config.cleanup = vec![RetentionPolicy {
        playlist_id: "PLR".to_string(),
        playlist_name: None,
        max_age_days: 1,
    }];
    h.publish("UC1", &[("v1", "Maybe", hours_ago(1), 600)]);
    h.api.seed_playlist_item("PLR", "old", Some(now() - Duration::days(3)));

    let summary = h.orchestrator(true).run().await.unwrap();

    assert!(summary.dry_run);
    assert_eq!(summary.total_added(), 1);
    assert_eq!(summary.total_removed(), 1);
    assert_eq!(h.api.calls("insert"), 0);
    assert_eq!(h.api.calls("delete"), 0);
    assert_eq!(h.api.playlist("PLR"), vec!["old".to_string()]);
    assert!(!h.ledger.has_been_processed("v1").unwrap());
    assert!(!h.ledger.has_been_processed("old").unwrap());
    assert_eq!(h.ledger.history_len().unwrap(), 0);
    assert_eq!(h.ledger.stats_summary(now()).unwrap()[0].runs, 0);
    // Reads were still charged upstream: details 1, cleanup listing 1
    assert_eq!(h.ledger.quota_for(now().date_naive()).unwrap().units_consumed, 2);
}

#[tokio::test]
async fn test_summary_notification_when_enabled() {
    let mut h = Harness::new(vec![channel("UC1", "PL1", None)]);
    h.config.notifications.send_summary = true;
    h.publish("UC1", &[("v1", "Announce me", hours_ago(1), 600)]);

    h.run().await.unwrap();

    assert_eq!(h.notifier.count(Severity::Info), 1);
    assert!(h.notifier.messages()[0].contains("Announce me"));
}
