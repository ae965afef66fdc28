//! Costed remote operations
//!
//! Every call, page, batch and retry attempt is authorized by the quota
//! governor before it reaches the network.

use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::criteria::{CandidateSource, VideoCandidate};
use crate::error::{FailureClass, SyncError};
use crate::quota::{Operation, QuotaGovernor};
use crate::retry::RetryConfig;
use crate::youtube::{ApiFailure, PlaylistItem, VideoDetails, YouTubeApi, MAX_PAGE_SIZE};

/// Result of a playlist item deletion
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Removal {
    Removed,
    /// The item was already gone (404)
    NotFound,
}

pub struct RemoteGateway {
    api: Arc<dyn YouTubeApi>,
    governor: QuotaGovernor,
    retry: RetryConfig,
}

impl RemoteGateway {
    pub fn new(api: Arc<dyn YouTubeApi>, governor: QuotaGovernor, retry: RetryConfig) -> Self {
        Self { api, governor, retry }
    }

    pub fn governor(&self) -> &QuotaGovernor {
        &self.governor
    }

    pub fn governor_mut(&mut self) -> &mut QuotaGovernor {
        &mut self.governor
    }

    /// Authorize, call, classify, and retry transient failures with backoff
    async fn call<T, F, Fut>(&mut self, operation: Operation, target: &str, mut attempt_fn: F) -> Result<T, SyncError>
    where
        F: FnMut(Arc<dyn YouTubeApi>) -> Fut,
        Fut: Future<Output = Result<T, ApiFailure>>,
    {
        let mut attempt = 0u32;
        loop {
            attempt += 1;
            self.governor.authorize(operation).await?;

            match attempt_fn(Arc::clone(&self.api)).await {
                Ok(value) => return Ok(value),
                Err(failure) => {
                    let delay = self.settle(operation, target, attempt, failure)?;
                    tokio::time::sleep(delay).await;
                }
            }
        }
    }

    /// Classify a failed attempt: the backoff before the next attempt, or
    /// the error that ends the call
    fn settle(
        &mut self,
        operation: Operation,
        target: &str,
        attempt: u32,
        failure: ApiFailure,
    ) -> Result<std::time::Duration, SyncError> {
        let class = QuotaGovernor::classify(failure.status, failure.reason.as_deref(), &failure.message);
        debug!(
            "{} on {} failed (attempt {}, {}): {}",
            operation.as_str(),
            target,
            attempt,
            class.as_str(),
            failure
        );

        match class {
            FailureClass::QuotaExceeded => {
                self.governor.mark_exhausted();
                Err(SyncError::QuotaExceeded(format!(
                    "{} rejected by the API: {}",
                    operation.as_str(),
                    failure
                )))
            }
            FailureClass::TokenExpired => Err(SyncError::TokenExpired(failure.to_string())),
            FailureClass::Fatal => Err(SyncError::OperationFailed {
                operation: format!("{} {}", operation.as_str(), target),
                message: failure.to_string(),
            }),
            FailureClass::Transient if self.retry.should_retry(attempt) => {
                let delay = self.retry.delay_after(attempt);
                warn!(
                    "{} on {} failed (attempt {}/{}), retrying in {:?}: {}",
                    operation.as_str(),
                    target,
                    attempt,
                    self.retry.max_attempts,
                    delay,
                    failure
                );
                Ok(delay)
            }
            FailureClass::Transient => Err(SyncError::OperationFailed {
                operation: format!("{} {}", operation.as_str(), target),
                message: format!("gave up after {} attempts: {}", attempt, failure),
            }),
        }
    }

    /// Recent uploads through search (about 100 units)
    pub async fn list_channel_videos(
        &mut self,
        channel_id: &str,
        published_after: DateTime<Utc>,
        max_results: u32,
    ) -> Result<Vec<VideoCandidate>, SyncError> {
        let channel = channel_id.to_string();
        let uploads = self
            .call(Operation::ListChannelVideos, channel_id, |api| {
                let channel = channel.clone();
                async move { api.search_channel_videos(&channel, published_after, max_results).await }
            })
            .await?;

        info!("Listed {} recent uploads for {} remotely", uploads.len(), channel_id);
        Ok(uploads
            .into_iter()
            .map(|upload| VideoCandidate {
                video_id: upload.video_id,
                title: upload.title,
                published_at: upload.published_at,
                duration_seconds: None,
                source: CandidateSource::Remote,
                channel_id: channel_id.to_string(),
            })
            .collect())
    }

    /// Details for the given ids in batches of 50, one unit per batch.
    /// Ids missing from the result do not exist or are not visible.
    pub async fn video_details(&mut self, ids: &[String]) -> Result<HashMap<String, VideoDetails>, SyncError> {
        let mut found = HashMap::with_capacity(ids.len());

        for batch in ids.chunks(MAX_PAGE_SIZE) {
            let batch = batch.to_vec();
            let label = format!("{} ids", batch.len());
            let details = self
                .call(Operation::VideoDetails, &label, |api| {
                    let batch = batch.clone();
                    async move { api.videos(&batch).await }
                })
                .await?;

            for detail in details {
                found.insert(detail.video_id.clone(), detail);
            }
        }

        debug!("Fetched details for {}/{} videos", found.len(), ids.len());
        Ok(found)
    }

    /// Full playlist membership, one unit per page of 50
    pub async fn list_playlist_items(&mut self, playlist_id: &str) -> Result<Vec<PlaylistItem>, SyncError> {
        let mut items = Vec::new();
        let mut page_token: Option<String> = None;
        let playlist = playlist_id.to_string();

        loop {
            let token = page_token.clone();
            let page = self
                .call(Operation::ListPlaylistItems, playlist_id, |api| {
                    let playlist = playlist.clone();
                    let token = token.clone();
                    async move { api.playlist_items_page(&playlist, token.as_deref()).await }
                })
                .await?;

            items.extend(page.items);
            match page.next_page_token {
                Some(next) if !next.is_empty() => page_token = Some(next),
                _ => break,
            }
        }

        debug!("Playlist {} has {} items", playlist_id, items.len());
        Ok(items)
    }

    /// Insert a video into a playlist.
    ///
    /// A transient failure may hide an insert the server already applied, so
    /// membership is listed again before each retry and an existing item is
    /// returned instead of inserting a second copy.
    pub async fn add_to_playlist(&mut self, playlist_id: &str, video_id: &str) -> Result<PlaylistItem, SyncError> {
        let operation = Operation::InsertPlaylistItem;
        let target = format!("{} -> {}", video_id, playlist_id);
        let mut attempt = 0u32;

        loop {
            attempt += 1;
            self.governor.authorize(operation).await?;

            let failure = match self.api.insert_playlist_item(playlist_id, video_id).await {
                Ok(item) => return Ok(item),
                Err(failure) => failure,
            };
            let delay = self.settle(operation, &target, attempt, failure)?;
            tokio::time::sleep(delay).await;

            let members = self.list_playlist_items(playlist_id).await?;
            if let Some(item) = members.into_iter().find(|item| item.video_id == video_id) {
                info!("{} reached {} despite the failed insert, not retrying", video_id, playlist_id);
                return Ok(item);
            }
        }
    }

    /// Delete a playlist item. A 404 means someone else already removed it.
    pub async fn remove_from_playlist(&mut self, item_id: &str) -> Result<Removal, SyncError> {
        let item = item_id.to_string();

        let result = self
            .call(Operation::DeletePlaylistItem, item_id, |api| {
                let item = item.clone();
                async move {
                    match api.delete_playlist_item(&item).await {
                        Ok(()) => Ok(Removal::Removed),
                        Err(failure) if failure.is_not_found() => Ok(Removal::NotFound),
                        Err(failure) => Err(failure),
                    }
                }
            })
            .await?;

        if result == Removal::NotFound {
            debug!("Playlist item {} was already gone", item_id);
        }
        Ok(result)
    }
}
