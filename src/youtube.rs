//! YouTube Data API v3 client
//!
//! Only the handful of endpoints the sync needs. Every method returns the raw
//! [`ApiFailure`] on error; deciding what a failure means is left to the
//! quota governor.

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use reqwest::{RequestBuilder, Response};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

use crate::auth::Authenticator;
use crate::config::ApiConfig;
use crate::error::SyncError;

/// Largest id batch or page the API accepts
pub const MAX_PAGE_SIZE: usize = 50;

/// A failed API call as reported by the remote (or the transport)
#[derive(Debug, Clone, PartialEq)]
pub struct ApiFailure {
    pub status: Option<u16>,
    pub reason: Option<String>,
    pub message: String,
}

impl ApiFailure {
    pub fn new(status: u16, reason: Option<&str>, message: impl Into<String>) -> Self {
        Self {
            status: Some(status),
            reason: reason.map(str::to_string),
            message: message.into(),
        }
    }

    pub fn transport(message: impl Into<String>) -> Self {
        Self {
            status: None,
            reason: None,
            message: message.into(),
        }
    }

    /// Credential problems surface as the same 401 the API itself would send
    pub fn from_auth(err: SyncError) -> Self {
        match err {
            SyncError::NetworkTransient { message, .. } => Self::transport(message),
            other => Self::new(401, Some("authError"), other.to_string()),
        }
    }

    pub fn is_not_found(&self) -> bool {
        self.status == Some(404)
    }
}

impl fmt::Display for ApiFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match (self.status, &self.reason) {
            (Some(status), Some(reason)) => write!(f, "HTTP {} ({}): {}", status, reason, self.message),
            (Some(status), None) => write!(f, "HTTP {}: {}", status, self.message),
            (None, _) => write!(f, "transport error: {}", self.message),
        }
    }
}

/// Authoritative facts about one video
#[derive(Debug, Clone, PartialEq)]
pub struct VideoDetails {
    pub video_id: String,
    pub title: String,
    pub channel_id: String,
    pub published_at: DateTime<Utc>,
    pub duration_seconds: u64,
}

/// One entry of a playlist
#[derive(Debug, Clone, PartialEq)]
pub struct PlaylistItem {
    /// Playlist item id, needed for deletion
    pub item_id: String,
    pub video_id: String,
    pub title: String,
    pub video_published_at: Option<DateTime<Utc>>,
    pub added_at: Option<DateTime<Utc>>,
}

impl PlaylistItem {
    /// Publish date of the video, falling back to when it was added
    pub fn age_reference(&self) -> Option<DateTime<Utc>> {
        self.video_published_at.or(self.added_at)
    }
}

/// A recent upload found through search
#[derive(Debug, Clone, PartialEq)]
pub struct ChannelUpload {
    pub video_id: String,
    pub title: String,
    pub published_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct PlaylistPage {
    pub items: Vec<PlaylistItem>,
    pub next_page_token: Option<String>,
}

/// Remote operations, one call each. Batching and paging live in the gateway.
#[async_trait]
pub trait YouTubeApi: Send + Sync {
    async fn search_channel_videos(
        &self,
        channel_id: &str,
        published_after: DateTime<Utc>,
        max_results: u32,
    ) -> Result<Vec<ChannelUpload>, ApiFailure>;

    async fn videos(&self, ids: &[String]) -> Result<Vec<VideoDetails>, ApiFailure>;

    async fn playlist_items_page(
        &self,
        playlist_id: &str,
        page_token: Option<&str>,
    ) -> Result<PlaylistPage, ApiFailure>;

    async fn insert_playlist_item(&self, playlist_id: &str, video_id: &str) -> Result<PlaylistItem, ApiFailure>;

    async fn delete_playlist_item(&self, item_id: &str) -> Result<(), ApiFailure>;
}

/// Parse an ISO-8601 duration such as `PT1H2M3S` or `P1DT2H` into seconds
pub fn parse_iso8601_duration(value: &str) -> Option<u64> {
    let rest = value.strip_prefix('P')?;
    let (date_part, time_part) = match rest.split_once('T') {
        Some((date, time)) => (date, Some(time)),
        None => (rest, None),
    };

    let mut total = 0u64;
    let mut number = String::new();

    for c in date_part.chars() {
        match c {
            '0'..='9' => number.push(c),
            'D' => {
                total += number.parse::<u64>().ok()? * 86_400;
                number.clear();
            }
            'W' => {
                total += number.parse::<u64>().ok()? * 7 * 86_400;
                number.clear();
            }
            _ => return None,
        }
    }
    if !number.is_empty() {
        return None;
    }

    if let Some(time) = time_part {
        if time.is_empty() {
            return None;
        }
        for c in time.chars() {
            match c {
                '0'..='9' => number.push(c),
                'H' | 'M' | 'S' => {
                    let n = number.parse::<u64>().ok()?;
                    total += match c {
                        'H' => n * 3_600,
                        'M' => n * 60,
                        _ => n,
                    };
                    number.clear();
                }
                _ => return None,
            }
        }
        if !number.is_empty() {
            return None;
        }
    }

    Some(total)
}

// =========================================================================
// Wire types
// =========================================================================

#[derive(Debug, Deserialize)]
struct ErrorEnvelope {
    error: ErrorBody,
}

#[derive(Debug, Deserialize)]
struct ErrorBody {
    #[serde(default)]
    message: String,
    #[serde(default)]
    errors: Vec<ErrorDetail>,
}

#[derive(Debug, Deserialize)]
struct ErrorDetail {
    #[serde(default)]
    reason: Option<String>,
}

#[derive(Debug, Deserialize)]
struct VideoListResponse {
    #[serde(default)]
    items: Vec<Video>,
}

#[derive(Debug, Deserialize)]
struct Video {
    id: String,
    snippet: VideoSnippet,
    #[serde(rename = "contentDetails")]
    content_details: VideoContentDetails,
}

#[derive(Debug, Deserialize)]
struct VideoSnippet {
    #[serde(default)]
    title: String,
    #[serde(rename = "channelId", default)]
    channel_id: String,
    #[serde(rename = "publishedAt")]
    published_at: DateTime<Utc>,
}

#[derive(Debug, Deserialize)]
struct VideoContentDetails {
    #[serde(default)]
    duration: String,
}

#[derive(Debug, Deserialize)]
struct SearchListResponse {
    #[serde(default)]
    items: Vec<SearchResult>,
}

#[derive(Debug, Deserialize)]
struct SearchResult {
    id: SearchResultId,
    snippet: SearchSnippet,
}

#[derive(Debug, Deserialize)]
struct SearchResultId {
    #[serde(rename = "videoId", default)]
    video_id: Option<String>,
}

#[derive(Debug, Deserialize)]
struct SearchSnippet {
    #[serde(default)]
    title: String,
    #[serde(rename = "publishedAt")]
    published_at: DateTime<Utc>,
}

#[derive(Debug, Deserialize)]
struct PlaylistItemListResponse {
    #[serde(default)]
    items: Vec<PlaylistItemResource>,
    #[serde(rename = "nextPageToken", default)]
    next_page_token: Option<String>,
}

#[derive(Debug, Deserialize)]
struct PlaylistItemResource {
    id: String,
    snippet: PlaylistItemSnippet,
    #[serde(rename = "contentDetails", default)]
    content_details: Option<PlaylistItemContentDetails>,
}

#[derive(Debug, Deserialize)]
struct PlaylistItemSnippet {
    #[serde(default)]
    title: String,
    #[serde(rename = "publishedAt", default)]
    published_at: Option<DateTime<Utc>>,
    #[serde(rename = "resourceId")]
    resource_id: ResourceId,
}

#[derive(Debug, Deserialize, Serialize)]
struct ResourceId {
    #[serde(default)]
    kind: String,
    #[serde(rename = "videoId", default)]
    video_id: String,
}

#[derive(Debug, Deserialize)]
struct PlaylistItemContentDetails {
    #[serde(rename = "videoPublishedAt", default)]
    video_published_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Serialize)]
struct InsertRequest<'a> {
    snippet: InsertSnippet<'a>,
}

#[derive(Debug, Serialize)]
struct InsertSnippet<'a> {
    #[serde(rename = "playlistId")]
    playlist_id: &'a str,
    #[serde(rename = "resourceId")]
    resource_id: ResourceId,
}

impl From<PlaylistItemResource> for PlaylistItem {
    fn from(resource: PlaylistItemResource) -> Self {
        PlaylistItem {
            item_id: resource.id,
            video_id: resource.snippet.resource_id.video_id,
            title: resource.snippet.title,
            video_published_at: resource.content_details.and_then(|c| c.video_published_at),
            added_at: resource.snippet.published_at,
        }
    }
}

// =========================================================================
// HTTP client
// =========================================================================

/// reqwest-backed [`YouTubeApi`]
pub struct YouTubeClient {
    client: reqwest::Client,
    base_url: String,
    auth: Arc<dyn Authenticator>,
}

impl YouTubeClient {
    pub fn new(config: &ApiConfig, auth: Arc<dyn Authenticator>) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout))
            .build()
            .context("Failed to build YouTube HTTP client")?;

        Ok(Self {
            client,
            base_url: config.base_url.trim_end_matches('/').to_string(),
            auth,
        })
    }

    fn url(&self, resource: &str) -> String {
        format!("{}/{}", self.base_url, resource)
    }

    async fn send(&self, request: RequestBuilder) -> Result<Response, ApiFailure> {
        let token = self
            .auth
            .get_valid_token()
            .await
            .map_err(ApiFailure::from_auth)?;

        let response = request
            .bearer_auth(token.secret)
            .send()
            .await
            .map_err(|e| ApiFailure::transport(e.to_string()))?;

        if response.status().is_success() {
            return Ok(response);
        }

        let status = response.status().as_u16();
        let body = response.text().await.unwrap_or_default();
        Err(match serde_json::from_str::<ErrorEnvelope>(&body) {
            Ok(envelope) => ApiFailure {
                status: Some(status),
                reason: envelope.error.errors.into_iter().find_map(|e| e.reason),
                message: envelope.error.message,
            },
            Err(_) => ApiFailure::new(status, None, body),
        })
    }

    async fn send_json<T: DeserializeOwned>(&self, request: RequestBuilder) -> Result<T, ApiFailure> {
        let response = self.send(request).await?;
        response
            .json::<T>()
            .await
            .map_err(|e| ApiFailure::transport(format!("invalid response body: {}", e)))
    }
}

#[async_trait]
impl YouTubeApi for YouTubeClient {
    async fn search_channel_videos(
        &self,
        channel_id: &str,
        published_after: DateTime<Utc>,
        max_results: u32,
    ) -> Result<Vec<ChannelUpload>, ApiFailure> {
        let published_after = published_after.to_rfc3339_opts(SecondsFormat::Secs, true);
        let max_results = max_results.to_string();
        let request = self.client.get(self.url("search")).query(&[
            ("part", "snippet"),
            ("channelId", channel_id),
            ("type", "video"),
            ("order", "date"),
            ("publishedAfter", published_after.as_str()),
            ("maxResults", max_results.as_str()),
        ]);

        let response: SearchListResponse = self.send_json(request).await?;
        debug!("search.list returned {} results for {}", response.items.len(), channel_id);

        Ok(response
            .items
            .into_iter()
            .filter_map(|item| {
                item.id.video_id.map(|video_id| ChannelUpload {
                    video_id,
                    title: item.snippet.title,
                    published_at: item.snippet.published_at,
                })
            })
            .collect())
    }

    async fn videos(&self, ids: &[String]) -> Result<Vec<VideoDetails>, ApiFailure> {
        let joined = ids.join(",");
        let request = self.client.get(self.url("videos")).query(&[
            ("part", "snippet,contentDetails"),
            ("id", joined.as_str()),
            ("maxResults", "50"),
        ]);

        let response: VideoListResponse = self.send_json(request).await?;

        let mut details = Vec::with_capacity(response.items.len());
        for video in response.items {
            match parse_iso8601_duration(&video.content_details.duration) {
                Some(duration_seconds) => details.push(VideoDetails {
                    video_id: video.id,
                    title: video.snippet.title,
                    channel_id: video.snippet.channel_id,
                    published_at: video.snippet.published_at,
                    duration_seconds,
                }),
                None => debug!(
                    "Ignoring video {} with unparsable duration {:?}",
                    video.id, video.content_details.duration
                ),
            }
        }
        Ok(details)
    }

    async fn playlist_items_page(
        &self,
        playlist_id: &str,
        page_token: Option<&str>,
    ) -> Result<PlaylistPage, ApiFailure> {
        let mut request = self.client.get(self.url("playlistItems")).query(&[
            ("part", "snippet,contentDetails"),
            ("playlistId", playlist_id),
            ("maxResults", "50"),
        ]);
        if let Some(token) = page_token {
            request = request.query(&[("pageToken", token)]);
        }

        let response: PlaylistItemListResponse = self.send_json(request).await?;
        Ok(PlaylistPage {
            items: response.items.into_iter().map(PlaylistItem::from).collect(),
            next_page_token: response.next_page_token,
        })
    }

    async fn insert_playlist_item(&self, playlist_id: &str, video_id: &str) -> Result<PlaylistItem, ApiFailure> {
        let body = InsertRequest {
            snippet: InsertSnippet {
                playlist_id,
                resource_id: ResourceId {
                    kind: "youtube#video".to_string(),
                    video_id: video_id.to_string(),
                },
            },
        };
        let request = self
            .client
            .post(self.url("playlistItems"))
            .query(&[("part", "snippet,contentDetails")])
            .json(&body);

        let resource: PlaylistItemResource = self.send_json(request).await?;
        Ok(PlaylistItem::from(resource))
    }

    async fn delete_playlist_item(&self, item_id: &str) -> Result<(), ApiFailure> {
        let request = self
            .client
            .delete(self.url("playlistItems"))
            .query(&[("id", item_id)]);
        self.send(request).await?;
        Ok(())
    }
}
