//! Channel feed polling
//!
//! The public Atom feed of a channel costs no quota. Parsed feeds are cached
//! per channel for the configured TTL; a failed refetch falls back to the last
//! cached parse, even an expired one, before giving up on the channel.

use anyhow::{anyhow, bail, Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use quick_xml::events::Event;
use quick_xml::Reader;
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::cache::MemoryCache;
use crate::clock::Clock;
use crate::config::FeedConfig;
use crate::criteria::{CandidateSource, VideoCandidate};
use crate::rules::ChannelRule;

/// One `<entry>` of a channel feed
#[derive(Debug, Clone, PartialEq)]
pub struct FeedEntry {
    pub video_id: String,
    pub title: String,
    pub published_at: DateTime<Utc>,
    pub author: Option<String>,
}

/// Raw feed retrieval
#[async_trait]
pub trait FeedFetcher: Send + Sync {
    async fn fetch(&self, channel_id: &str) -> Result<String>;
}

pub struct HttpFeedFetcher {
    client: reqwest::Client,
    base_url: String,
}

impl HttpFeedFetcher {
    pub fn new(config: &FeedConfig) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(std::time::Duration::from_secs(config.timeout))
            .build()
            .context("Failed to build feed HTTP client")?;

        Ok(Self {
            client,
            base_url: config.base_url.clone(),
        })
    }

    pub fn feed_url(&self, channel_id: &str) -> String {
        format!("{}?channel_id={}", self.base_url, channel_id)
    }
}

#[async_trait]
impl FeedFetcher for HttpFeedFetcher {
    async fn fetch(&self, channel_id: &str) -> Result<String> {
        let url = self.feed_url(channel_id);
        let response = self
            .client
            .get(&url)
            .send()
            .await
            .with_context(|| format!("Failed to fetch feed {}", url))?;

        let status = response.status();
        if !status.is_success() {
            bail!("Feed {} returned HTTP {}", url, status);
        }

        response.text().await.context("Failed to read feed body")
    }
}

/// Pull a video id out of an entry `<id>` such as `yt:video:abc123`
fn video_id_from_entry_id(id: &str) -> Option<String> {
    if let Some(rest) = id.strip_prefix("yt:video:") {
        return Some(rest.to_string()).filter(|s| !s.is_empty());
    }
    id.split_once("video_id=")
        .map(|(_, rest)| rest.split('&').next().unwrap_or_default().to_string())
        .filter(|s| !s.is_empty())
}

#[derive(Default)]
struct PartialEntry {
    id: Option<String>,
    video_id: Option<String>,
    title: Option<String>,
    published: Option<String>,
    author: Option<String>,
}

impl PartialEntry {
    fn finish(self) -> Result<FeedEntry> {
        let video_id = self
            .video_id
            .filter(|v| !v.is_empty())
            .or_else(|| self.id.as_deref().and_then(video_id_from_entry_id))
            .ok_or_else(|| anyhow!("Feed entry without a video id"))?;
        let published = self
            .published
            .ok_or_else(|| anyhow!("Feed entry {} has no published date", video_id))?;
        let published_at = DateTime::parse_from_rfc3339(published.trim())
            .with_context(|| format!("Invalid published date {:?} for {}", published, video_id))?
            .with_timezone(&Utc);

        Ok(FeedEntry {
            video_id,
            title: self.title.unwrap_or_default(),
            published_at,
            author: self.author,
        })
    }
}

/// Parse an Atom channel feed.
///
/// Only direct children of `<entry>` are read, so `<media:group><media:title>`
/// never overrides the entry title.
pub fn parse_feed(xml: &str) -> Result<Vec<FeedEntry>> {
    let mut reader = Reader::from_str(xml);
    reader.trim_text(true);

    let mut path: Vec<String> = Vec::new();
    let mut current: Option<PartialEntry> = None;
    let mut entries = Vec::new();
    let mut saw_feed = false;

    loop {
        match reader.read_event() {
            Ok(Event::Start(e)) => {
                let name = String::from_utf8_lossy(e.local_name().as_ref()).into_owned();
                if name == "feed" {
                    saw_feed = true;
                }
                if name == "entry" && path.last().map(String::as_str) == Some("feed") {
                    current = Some(PartialEntry::default());
                }
                path.push(name);
            }
            Ok(Event::End(_)) => {
                if let Some(name) = path.pop() {
                    if name == "entry" && path.last().map(String::as_str) == Some("feed") {
                        if let Some(partial) = current.take() {
                            match partial.finish() {
                                Ok(entry) => entries.push(entry),
                                Err(e) => warn!("Skipping malformed feed entry: {:#}", e),
                            }
                        }
                    }
                }
            }
            Ok(Event::Text(t)) => {
                let text = t.unescape().context("Invalid text in feed")?.into_owned();
                if let Some(entry) = current.as_mut() {
                    let depth = path.len();
                    let tail: Vec<&str> = path.iter().skip(depth.saturating_sub(3)).map(String::as_str).collect();
                    match tail.as_slice() {
                        [.., "entry", "id"] => entry.id = Some(text),
                        [.., "entry", "videoId"] => entry.video_id = Some(text),
                        [.., "entry", "title"] => entry.title = Some(text),
                        [.., "entry", "published"] => entry.published = Some(text),
                        ["entry", "author", "name"] => entry.author = Some(text),
                        _ => {}
                    }
                }
            }
            Ok(Event::CData(c)) => {
                if let Some(entry) = current.as_mut() {
                    if path.last().map(String::as_str) == Some("title") && path.iter().rev().nth(1).map(String::as_str) == Some("entry") {
                        entry.title = Some(String::from_utf8_lossy(&c.into_inner()).into_owned());
                    }
                }
            }
            Ok(Event::Eof) => break,
            Err(e) => return Err(anyhow!("Malformed feed XML at position {}: {}", reader.buffer_position(), e)),
            _ => {}
        }
    }

    if !saw_feed {
        bail!("Document is not an Atom feed");
    }

    Ok(entries)
}

/// How a feed request was served
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FeedStatus {
    /// Fetched from the network just now
    Fresh,
    /// Served from a cache entry still within its TTL
    Cached,
    /// Refetch failed; serving an expired cache entry
    Degraded,
    /// Refetch failed and nothing is cached
    Unavailable,
}

impl FeedStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            FeedStatus::Fresh => "fresh",
            FeedStatus::Cached => "cached",
            FeedStatus::Degraded => "degraded",
            FeedStatus::Unavailable => "unavailable",
        }
    }

    pub fn has_entries(&self) -> bool {
        !matches!(self, FeedStatus::Unavailable)
    }
}

/// Entries of one channel feed plus the window they are filtered against.
///
/// [`FeedBatch::candidates`] can be iterated any number of times.
#[derive(Debug, Clone)]
pub struct FeedBatch {
    pub status: FeedStatus,
    pub channel_id: String,
    entries: Arc<Vec<FeedEntry>>,
    cutoff: DateTime<Utc>,
}

impl FeedBatch {
    /// Candidates published inside the rule's recency window
    pub fn candidates(&self) -> impl Iterator<Item = VideoCandidate> + '_ {
        self.entries
            .iter()
            .filter(move |entry| entry.published_at >= self.cutoff)
            .map(move |entry| VideoCandidate {
                video_id: entry.video_id.clone(),
                title: entry.title.clone(),
                published_at: entry.published_at,
                duration_seconds: None,
                source: CandidateSource::Feed,
                channel_id: self.channel_id.clone(),
            })
    }

    /// Entries dropped by the recency window without any cost
    pub fn stale_count(&self) -> usize {
        self.entries.iter().filter(|e| e.published_at < self.cutoff).count()
    }

    pub fn total_entries(&self) -> usize {
        self.entries.len()
    }
}

pub struct FeedSource {
    fetcher: Arc<dyn FeedFetcher>,
    cache: MemoryCache<Arc<Vec<FeedEntry>>>,
    ttl: Duration,
    clock: Arc<dyn Clock>,
}

impl FeedSource {
    pub fn new(fetcher: Arc<dyn FeedFetcher>, ttl: Duration, clock: Arc<dyn Clock>) -> Self {
        Self {
            fetcher,
            cache: MemoryCache::new(Arc::clone(&clock)),
            ttl,
            clock,
        }
    }

    async fn fetch_and_parse(&self, channel_id: &str) -> Result<Vec<FeedEntry>> {
        let body = self.fetcher.fetch(channel_id).await?;
        parse_feed(&body).with_context(|| format!("Failed to parse feed for {}", channel_id))
    }

    /// Recent uploads for a rule's channel
    pub async fn get_recent_videos(&mut self, rule: &ChannelRule) -> FeedBatch {
        let now = self.clock.now();
        let cutoff = rule.recency_cutoff(now);
        let key = rule.channel_id.as_str();

        let batch = |status, entries| FeedBatch {
            status,
            channel_id: rule.channel_id.clone(),
            entries,
            cutoff,
        };

        if let Some(entries) = self.cache.get(key) {
            debug!("Feed for {} served from cache", rule.channel_name);
            return batch(FeedStatus::Cached, entries);
        }

        match self.fetch_and_parse(key).await {
            Ok(entries) => {
                let entries = Arc::new(entries);
                debug!("Fetched feed for {} ({} entries)", rule.channel_name, entries.len());
                self.cache.insert(key, Arc::clone(&entries), self.ttl);
                batch(FeedStatus::Fresh, entries)
            }
            Err(e) => match self.cache.get_stale(key) {
                Some(stale) => {
                    warn!(
                        "Feed for {} unavailable ({:#}); degraded mode, using copy fetched at {}",
                        rule.channel_name, e, stale.fetched_at
                    );
                    batch(FeedStatus::Degraded, Arc::clone(&stale.payload))
                }
                None => {
                    info!("Feed for {} unavailable and not cached, skipping: {:#}", rule.channel_name, e);
                    batch(FeedStatus::Unavailable, Arc::new(Vec::new()))
                }
            },
        }
    }
}
