//! Common test utilities and helpers for tubesentry tests
#![allow(dead_code)]

use anyhow::{bail, Result};
use async_trait::async_trait;
use chrono::{DateTime, Duration, TimeZone, Utc};
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};

use tubesentry::clock::ManualClock;
use tubesentry::config::{ChannelConfig, Config};
use tubesentry::feed::FeedFetcher;
use tubesentry::notify::{Notifier, Severity};
use tubesentry::youtube::{ApiFailure, ChannelUpload, PlaylistItem, PlaylistPage, VideoDetails, YouTubeApi};
use tubesentry::{Ledger, RuleSet, RunAborted, RunContext, RunSummary, SyncOrchestrator};

/// Fixed "now" for every scenario
pub fn now() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 6, 1, 12, 0, 0).unwrap()
}

pub fn hours_ago(hours: i64) -> DateTime<Utc> {
    now() - Duration::hours(hours)
}

/// Build an Atom feed like the one YouTube serves
pub fn feed_xml(channel_id: &str, entries: &[(&str, &str, DateTime<Utc>)]) -> String {
    let mut xml = format!(
        r#"<?xml version="1.0" encoding="UTF-8"?>
<feed xmlns:yt="http://www.youtube.com/xml/schemas/2015" xmlns:media="http://search.yahoo.com/mrss/" xmlns="http://www.w3.org/2005/Atom">
 <id>yt:channel:{channel_id}</id>
 <title>{channel_id}</title>
"#
    );
    for (video_id, title, published) in entries {
        xml.push_str(&format!(
            r#" <entry>
  <id>yt:video:{video_id}</id>
  <yt:videoId>{video_id}</yt:videoId>
  <yt:channelId>{channel_id}</yt:channelId>
  <title>{title}</title>
  <author><name>{channel_id}</name></author>
  <published>{published}</published>
  <media:group><media:title>{title}</media:title></media:group>
 </entry>
"#,
            published = published.to_rfc3339()
        ));
    }
    xml.push_str("</feed>\n");
    xml
}

/// Channel rule config with the fields most scenarios vary
pub fn channel(channel_id: &str, playlist_id: &str, pattern: Option<&str>) -> ChannelConfig {
    ChannelConfig {
        channel_id: channel_id.to_string(),
        channel_name: format!("{} name", channel_id),
        playlist_id: playlist_id.to_string(),
        playlist_name: Some(format!("{} list", playlist_id)),
        title_pattern: pattern.map(String::from),
        min_duration: 120,
        max_duration: Some(3600),
        hours_limit: 8,
    }
}

/// Feeds served from memory; channels without a feed fail to fetch
#[derive(Default)]
pub struct StaticFeed {
    feeds: Mutex<HashMap<String, String>>,
    fetches: Mutex<HashMap<String, usize>>,
}

impl StaticFeed {
    pub fn set(&self, channel_id: &str, xml: String) {
        self.feeds.lock().unwrap().insert(channel_id.to_string(), xml);
    }

    pub fn fetches(&self, channel_id: &str) -> usize {
        self.fetches.lock().unwrap().get(channel_id).copied().unwrap_or(0)
    }
}

#[async_trait]
impl FeedFetcher for StaticFeed {
    async fn fetch(&self, channel_id: &str) -> Result<String> {
        *self.fetches.lock().unwrap().entry(channel_id.to_string()).or_default() += 1;
        match self.feeds.lock().unwrap().get(channel_id) {
            Some(xml) => Ok(xml.clone()),
            None => bail!("HTTP 404 for channel {}", channel_id),
        }
    }
}

#[derive(Default)]
struct FakeState {
    videos: HashMap<String, VideoDetails>,
    uploads: HashMap<String, Vec<ChannelUpload>>,
    playlists: HashMap<String, Vec<PlaylistItem>>,
    failures: HashMap<&'static str, VecDeque<ApiFailure>>,
    lost_insert_responses: VecDeque<ApiFailure>,
    calls: HashMap<&'static str, usize>,
    next_item: usize,
}

impl FakeState {
    fn enter(&mut self, op: &'static str) -> Result<(), ApiFailure> {
        *self.calls.entry(op).or_default() += 1;
        match self.failures.get_mut(op).and_then(|queue| queue.pop_front()) {
            Some(failure) => Err(failure),
            None => Ok(()),
        }
    }
}

/// In-memory YouTube with call counters and scripted failures.
///
/// Operation names: `search`, `videos`, `playlistItems`, `insert`, `delete`.
#[derive(Default)]
pub struct FakeYouTube {
    state: Mutex<FakeState>,
}

impl FakeYouTube {
    pub fn add_video(&self, video_id: &str, title: &str, published_at: DateTime<Utc>, duration_seconds: u64) {
        self.state.lock().unwrap().videos.insert(
            video_id.to_string(),
            VideoDetails {
                video_id: video_id.to_string(),
                title: title.to_string(),
                channel_id: String::new(),
                published_at,
                duration_seconds,
            },
        );
    }

    pub fn add_upload(&self, channel_id: &str, video_id: &str, title: &str, published_at: DateTime<Utc>) {
        self.state
            .lock()
            .unwrap()
            .uploads
            .entry(channel_id.to_string())
            .or_default()
            .push(ChannelUpload {
                video_id: video_id.to_string(),
                title: title.to_string(),
                published_at,
            });
    }

    /// Put a video in a playlist behind the engine's back
    pub fn seed_playlist_item(&self, playlist_id: &str, video_id: &str, published_at: Option<DateTime<Utc>>) -> String {
        let mut state = self.state.lock().unwrap();
        state.next_item += 1;
        let item_id = format!("item-{}", state.next_item);
        state
            .playlists
            .entry(playlist_id.to_string())
            .or_default()
            .push(PlaylistItem {
                item_id: item_id.clone(),
                video_id: video_id.to_string(),
                title: video_id.to_string(),
                video_published_at: published_at,
                added_at: published_at,
            });
        item_id
    }

    pub fn fail_next(&self, op: &'static str, failure: ApiFailure) {
        self.state
            .lock()
            .unwrap()
            .failures
            .entry(op)
            .or_default()
            .push_back(failure);
    }

    /// Apply the next insert, then answer with `failure` as if the response was lost
    pub fn lose_next_insert_response(&self, failure: ApiFailure) {
        self.state.lock().unwrap().lost_insert_responses.push_back(failure);
    }

    pub fn calls(&self, op: &'static str) -> usize {
        self.state.lock().unwrap().calls.get(op).copied().unwrap_or(0)
    }

    pub fn playlist(&self, playlist_id: &str) -> Vec<String> {
        self.state
            .lock()
            .unwrap()
            .playlists
            .get(playlist_id)
            .map(|items| items.iter().map(|i| i.video_id.clone()).collect())
            .unwrap_or_default()
    }
}

#[async_trait]
impl YouTubeApi for FakeYouTube {
    async fn search_channel_videos(
        &self,
        channel_id: &str,
        published_after: DateTime<Utc>,
        max_results: u32,
    ) -> Result<Vec<ChannelUpload>, ApiFailure> {
        let mut state = self.state.lock().unwrap();
        state.enter("search")?;
        Ok(state
            .uploads
            .get(channel_id)
            .map(|uploads| {
                uploads
                    .iter()
                    .filter(|u| u.published_at >= published_after)
                    .take(max_results as usize)
                    .cloned()
                    .collect()
            })
            .unwrap_or_default())
    }

    async fn videos(&self, ids: &[String]) -> Result<Vec<VideoDetails>, ApiFailure> {
        let mut state = self.state.lock().unwrap();
        state.enter("videos")?;
        Ok(ids.iter().filter_map(|id| state.videos.get(id).cloned()).collect())
    }

    async fn playlist_items_page(
        &self,
        playlist_id: &str,
        page_token: Option<&str>,
    ) -> Result<PlaylistPage, ApiFailure> {
        let mut state = self.state.lock().unwrap();
        state.enter("playlistItems")?;
        let items = state.playlists.get(playlist_id).cloned().unwrap_or_default();
        let start: usize = page_token.and_then(|t| t.parse().ok()).unwrap_or(0);
        let end = (start + 50).min(items.len());
        Ok(PlaylistPage {
            items: items.get(start..end).map(<[PlaylistItem]>::to_vec).unwrap_or_default(),
            next_page_token: (end < items.len()).then(|| end.to_string()),
        })
    }

    async fn insert_playlist_item(&self, playlist_id: &str, video_id: &str) -> Result<PlaylistItem, ApiFailure> {
        let mut state = self.state.lock().unwrap();
        state.enter("insert")?;
        state.next_item += 1;
        let item = PlaylistItem {
            item_id: format!("item-{}", state.next_item),
            video_id: video_id.to_string(),
            title: state.videos.get(video_id).map(|v| v.title.clone()).unwrap_or_default(),
            video_published_at: state.videos.get(video_id).map(|v| v.published_at),
            added_at: Some(now()),
        };
        state
            .playlists
            .entry(playlist_id.to_string())
            .or_default()
            .push(item.clone());
        match state.lost_insert_responses.pop_front() {
            Some(failure) => Err(failure),
            None => Ok(item),
        }
    }

    async fn delete_playlist_item(&self, item_id: &str) -> Result<(), ApiFailure> {
        let mut state = self.state.lock().unwrap();
        state.enter("delete")?;
        let mut found = false;
        for items in state.playlists.values_mut() {
            let before = items.len();
            items.retain(|i| i.item_id != item_id);
            found |= items.len() != before;
        }
        if found {
            Ok(())
        } else {
            Err(ApiFailure::new(404, Some("playlistItemNotFound"), "Playlist item not found"))
        }
    }
}

/// Remembers every notification it is asked to send
#[derive(Default)]
pub struct RecordingNotifier {
    sent: Mutex<Vec<(Severity, String)>>,
}

impl RecordingNotifier {
    pub fn count(&self, severity: Severity) -> usize {
        self.sent.lock().unwrap().iter().filter(|(s, _)| *s == severity).count()
    }

    pub fn messages(&self) -> Vec<String> {
        self.sent.lock().unwrap().iter().map(|(_, m)| m.clone()).collect()
    }
}

#[async_trait]
impl Notifier for RecordingNotifier {
    async fn notify(&self, severity: Severity, message: &str) {
        self.sent.lock().unwrap().push((severity, message.to_string()));
    }
}

/// A ledger, fakes and config wired together for orchestrator runs
pub struct Harness {
    pub config: Config,
    pub ledger: Arc<Ledger>,
    pub feed: Arc<StaticFeed>,
    pub api: Arc<FakeYouTube>,
    pub notifier: Arc<RecordingNotifier>,
    pub clock: Arc<ManualClock>,
}

impl Harness {
    pub fn new(channels: Vec<ChannelConfig>) -> Self {
        let mut config = Config::default();
        config.channels = channels;
        config.api.initial_backoff_ms = 1;
        config.api.max_backoff_ms = 1;

        Self {
            config,
            ledger: Arc::new(Ledger::open_in_memory().unwrap()),
            feed: Arc::new(StaticFeed::default()),
            api: Arc::new(FakeYouTube::default()),
            notifier: Arc::new(RecordingNotifier::default()),
            clock: Arc::new(ManualClock::new(now())),
        }
    }

    pub fn context(&self) -> RunContext {
        RunContext {
            ledger: Arc::clone(&self.ledger),
            feed_fetcher: self.feed.clone(),
            api: self.api.clone(),
            notifier: self.notifier.clone(),
            clock: self.clock.clone(),
        }
    }

    pub fn orchestrator(&self, dry_run: bool) -> SyncOrchestrator {
        let rules = RuleSet::from_config(&self.config.channels);
        SyncOrchestrator::new(&self.config, rules, self.context(), dry_run).unwrap()
    }

    pub async fn run(&self) -> Result<RunSummary, RunAborted> {
        self.orchestrator(false).run().await
    }

    /// Publish a video in both the channel feed and the API
    pub fn publish(&self, channel_id: &str, videos: &[(&str, &str, DateTime<Utc>, u64)]) {
        let entries: Vec<(&str, &str, DateTime<Utc>)> =
            videos.iter().map(|(id, title, at, _)| (*id, *title, *at)).collect();
        self.feed.set(channel_id, feed_xml(channel_id, &entries));
        for (id, title, at, duration) in videos {
            self.api.add_video(id, title, *at, *duration);
        }
    }
}
