//! Candidate filtering
//!
//! Pure functions over a candidate and its rule. No I/O, no quota.

use chrono::{DateTime, Utc};
use std::fmt;

use crate::rules::ChannelRule;
use crate::youtube::VideoDetails;

/// Videos at or below this length are Shorts and never added
pub const SHORT_THRESHOLD_SECS: u64 = 60;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CandidateSource {
    Feed,
    Remote,
}

impl CandidateSource {
    pub fn as_str(&self) -> &'static str {
        match self {
            CandidateSource::Feed => "feed",
            CandidateSource::Remote => "remote",
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct VideoCandidate {
    pub video_id: String,
    pub title: String,
    pub published_at: DateTime<Utc>,
    pub duration_seconds: Option<u64>,
    pub source: CandidateSource,
    pub channel_id: String,
}

impl VideoCandidate {
    /// Merge authoritative remote details over whatever the feed said
    pub fn confirm(&mut self, details: &VideoDetails) {
        self.duration_seconds = Some(details.duration_seconds);
        if !details.title.is_empty() {
            self.title = details.title.clone();
        }
        self.published_at = details.published_at;
        self.source = CandidateSource::Remote;
    }

    pub fn is_confirmed(&self) -> bool {
        self.source == CandidateSource::Remote && self.duration_seconds.is_some()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RejectReason {
    MissingDuration,
    TooShort,
    TooLong,
    Short,
    TitleMismatch,
    Stale,
}

impl RejectReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            RejectReason::MissingDuration => "missing_duration",
            RejectReason::TooShort => "too_short",
            RejectReason::TooLong => "too_long",
            RejectReason::Short => "short",
            RejectReason::TitleMismatch => "title_mismatch",
            RejectReason::Stale => "stale",
        }
    }
}

impl fmt::Display for RejectReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verdict {
    Accept,
    Reject(RejectReason),
    /// Title and recency pass but the duration is still unknown
    NeedsConfirmation,
}

/// Run the four checks in order, stopping at the first failure.
///
/// With no duration the two duration checks are deferred instead of failed,
/// so title and recency can reject before a detail lookup is paid for.
pub fn evaluate(candidate: &VideoCandidate, rule: &ChannelRule, now: DateTime<Utc>) -> Verdict {
    if let Some(duration) = candidate.duration_seconds {
        if duration < rule.min_duration {
            return Verdict::Reject(RejectReason::TooShort);
        }
        if duration > rule.max_duration {
            return Verdict::Reject(RejectReason::TooLong);
        }
        if duration <= SHORT_THRESHOLD_SECS {
            return Verdict::Reject(RejectReason::Short);
        }
    }

    if !rule.title_matches(&candidate.title) {
        return Verdict::Reject(RejectReason::TitleMismatch);
    }

    if !is_recent(candidate.published_at, rule, now) {
        return Verdict::Reject(RejectReason::Stale);
    }

    if candidate.duration_seconds.is_none() {
        return Verdict::NeedsConfirmation;
    }

    Verdict::Accept
}

/// Final decision. An unknown duration never matches.
pub fn matches(candidate: &VideoCandidate, rule: &ChannelRule, now: DateTime<Utc>) -> bool {
    evaluate(candidate, rule, now) == Verdict::Accept
}

/// Explicit rejection for a candidate with no duration at decision time
pub fn final_verdict(candidate: &VideoCandidate, rule: &ChannelRule, now: DateTime<Utc>) -> Verdict {
    match evaluate(candidate, rule, now) {
        Verdict::NeedsConfirmation => Verdict::Reject(RejectReason::MissingDuration),
        verdict => verdict,
    }
}

/// `published_at` within `[now - hours_limit, now]`
pub fn is_recent(published_at: DateTime<Utc>, rule: &ChannelRule, now: DateTime<Utc>) -> bool {
    published_at >= rule.recency_cutoff(now) && published_at <= now
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ChannelConfig;
    use crate::rules::{validate_rule, PatternCache};
    use chrono::{Duration, TimeZone};

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 5, 10, 12, 0, 0).unwrap()
    }

    fn rule(pattern: Option<&str>) -> ChannelRule {
        let config = ChannelConfig {
            channel_id: "UC1".to_string(),
            channel_name: "Tech".to_string(),
            playlist_id: "PL1".to_string(),
            title_pattern: pattern.map(str::to_string),
            min_duration: 120,
            max_duration: Some(900),
            hours_limit: 8,
            ..Default::default()
        };
        validate_rule(&config, &mut PatternCache::new()).unwrap()
    }

    fn candidate(title: &str, duration: Option<u64>, age: Duration) -> VideoCandidate {
        VideoCandidate {
            video_id: "vid1".to_string(),
            title: title.to_string(),
            published_at: now() - age,
            duration_seconds: duration,
            source: CandidateSource::Feed,
            channel_id: "UC1".to_string(),
        }
    }

    #[test]
    fn test_short_below_minimum_is_rejected() {
        let c = candidate("Anything", Some(45), Duration::hours(1));
        assert_eq!(evaluate(&c, &rule(None), now()), Verdict::Reject(RejectReason::TooShort));
        assert!(!matches(&c, &rule(None), now()));
    }

    #[test]
    fn test_word_boundary_pattern_accepts() {
        let c = candidate("Weekly AI Update", Some(300), Duration::hours(1));
        assert_eq!(evaluate(&c, &rule(Some(r"(?i)\bAI\b")), now()), Verdict::Accept);
        assert!(matches(&c, &rule(Some(r"(?i)\bAI\b")), now()));
    }

    #[test]
    fn test_outside_recency_window_is_stale() {
        let c = candidate("Weekly AI Update", Some(300), Duration::hours(10));
        assert_eq!(evaluate(&c, &rule(None), now()), Verdict::Reject(RejectReason::Stale));
    }

    #[test]
    fn test_short_rejected_even_when_bounds_allow() {
        let mut r = rule(None);
        r.min_duration = 0;
        let c = candidate("Clip", Some(60), Duration::hours(1));
        assert_eq!(evaluate(&c, &r, now()), Verdict::Reject(RejectReason::Short));

        let c = candidate("Clip", Some(61), Duration::hours(1));
        assert_eq!(evaluate(&c, &r, now()), Verdict::Accept);
    }

    #[test]
    fn test_bounds_are_inclusive() {
        let r = rule(None);
        assert!(matches(&candidate("a", Some(120), Duration::hours(1)), &r, now()));
        assert!(matches(&candidate("a", Some(900), Duration::hours(1)), &r, now()));
        assert_eq!(
            evaluate(&candidate("a", Some(901), Duration::hours(1)), &r, now()),
            Verdict::Reject(RejectReason::TooLong)
        );
    }

    #[test]
    fn test_unknown_duration_defers_but_never_matches() {
        let r = rule(Some("update"));
        let c = candidate("Daily update", None, Duration::hours(1));
        assert_eq!(evaluate(&c, &r, now()), Verdict::NeedsConfirmation);
        assert!(!matches(&c, &r, now()));
        assert_eq!(final_verdict(&c, &r, now()), Verdict::Reject(RejectReason::MissingDuration));
    }

    #[test]
    fn test_unknown_duration_still_rejects_on_title_first() {
        let c = candidate("Cooking show", None, Duration::hours(1));
        assert_eq!(
            evaluate(&c, &rule(Some("update")), now()),
            Verdict::Reject(RejectReason::TitleMismatch)
        );
    }

    #[test]
    fn test_recency_edges() {
        let r = rule(None);
        assert!(is_recent(now() - Duration::hours(8), &r, now()));
        assert!(!is_recent(now() - Duration::hours(8) - Duration::seconds(1), &r, now()));
        assert!(is_recent(now(), &r, now()));
        assert!(!is_recent(now() + Duration::minutes(1), &r, now()));
    }

    #[test]
    fn test_remote_details_are_authoritative() {
        let mut c = candidate("Feed title", Some(30), Duration::hours(1));
        let details = VideoDetails {
            video_id: "vid1".to_string(),
            title: "Remote title".to_string(),
            channel_id: "UC1".to_string(),
            published_at: now() - Duration::hours(2),
            duration_seconds: 400,
        };

        c.confirm(&details);

        assert_eq!(c.duration_seconds, Some(400));
        assert_eq!(c.title, "Remote title");
        assert_eq!(c.source, CandidateSource::Remote);
        assert!(c.is_confirmed());
        assert!(matches(&c, &rule(None), now()));
    }
}
