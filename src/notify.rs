//! Alert delivery
//!
//! Notification is fire-and-forget: a failed delivery is logged and never
//! changes the outcome of a run.

use anyhow::{Context, Result};
use async_trait::async_trait;
use serde::Serialize;
use std::collections::HashSet;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tracing::{debug, error, info, warn};

use crate::config::NotificationConfig;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Severity {
    Info,
    Warning,
    Critical,
}

impl Severity {
    pub fn as_str(&self) -> &'static str {
        match self {
            Severity::Info => "INFO",
            Severity::Warning => "WARNING",
            Severity::Critical => "CRITICAL",
        }
    }
}

#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait Notifier: Send + Sync {
    async fn notify(&self, severity: Severity, message: &str);
}

/// Writes notifications to the log
#[derive(Debug, Default, Clone, Copy)]
pub struct LogNotifier;

#[async_trait]
impl Notifier for LogNotifier {
    async fn notify(&self, severity: Severity, message: &str) {
        match severity {
            Severity::Info => info!("[{}] {}", severity.as_str(), message),
            Severity::Warning => warn!("[{}] {}", severity.as_str(), message),
            Severity::Critical => error!("[{}] {}", severity.as_str(), message),
        }
    }
}

#[derive(Serialize)]
struct SendMessage<'a> {
    chat_id: &'a str,
    text: String,
}

/// Sends notifications through the Telegram Bot API
pub struct TelegramNotifier {
    client: reqwest::Client,
    api_url: String,
    token: String,
    chat_id: String,
}

impl TelegramNotifier {
    pub fn new(api_url: &str, token: &str, chat_id: &str) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(10))
            .build()
            .context("Failed to build Telegram HTTP client")?;

        Ok(Self {
            client,
            api_url: api_url.trim_end_matches('/').to_string(),
            token: token.to_string(),
            chat_id: chat_id.to_string(),
        })
    }

    async fn send(&self, severity: Severity, message: &str) -> Result<()> {
        let url = format!("{}/bot{}/sendMessage", self.api_url, self.token);
        let body = SendMessage {
            chat_id: &self.chat_id,
            text: format!("[{}] tubesentry: {}", severity.as_str(), message),
        };

        let response = self
            .client
            .post(&url)
            .json(&body)
            .send()
            .await
            .context("Failed to reach Telegram")?;

        let status = response.status();
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            anyhow::bail!("Telegram returned {}: {}", status, text);
        }

        debug!("Telegram notification delivered");
        Ok(())
    }
}

#[async_trait]
impl Notifier for TelegramNotifier {
    async fn notify(&self, severity: Severity, message: &str) {
        if let Err(e) = self.send(severity, message).await {
            warn!("Failed to deliver Telegram notification: {:#}", e);
        }
    }
}

/// Fans a notification out to every inner notifier
pub struct CompositeNotifier {
    notifiers: Vec<Arc<dyn Notifier>>,
}

impl CompositeNotifier {
    pub fn new(notifiers: Vec<Arc<dyn Notifier>>) -> Self {
        Self { notifiers }
    }
}

#[async_trait]
impl Notifier for CompositeNotifier {
    async fn notify(&self, severity: Severity, message: &str) {
        for notifier in &self.notifiers {
            notifier.notify(severity, message).await;
        }
    }
}

/// Sends each named condition at most once per run
pub struct FatalNotifier {
    inner: Arc<dyn Notifier>,
    sent: Mutex<HashSet<String>>,
}

impl FatalNotifier {
    pub fn new(inner: Arc<dyn Notifier>) -> Self {
        Self {
            inner,
            sent: Mutex::new(HashSet::new()),
        }
    }

    /// Returns false when the condition was already reported
    pub async fn notify_once(&self, condition: &str, severity: Severity, message: &str) -> bool {
        let first = {
            let mut sent = self.sent.lock().unwrap_or_else(|e| e.into_inner());
            sent.insert(condition.to_string())
        };

        if first {
            self.inner.notify(severity, message).await;
        } else {
            debug!("Suppressing repeated notification for {}", condition);
        }
        first
    }

    /// Pass-through for notifications that are not deduplicated
    pub async fn notify(&self, severity: Severity, message: &str) {
        self.inner.notify(severity, message).await;
    }
}

/// Log notifier, plus Telegram when both token and chat id are configured
pub fn build_notifier(config: &NotificationConfig) -> Result<Arc<dyn Notifier>> {
    let mut notifiers: Vec<Arc<dyn Notifier>> = vec![Arc::new(LogNotifier)];

    if let (Some(token), Some(chat_id)) = (&config.telegram_token, &config.telegram_chat_id) {
        notifiers.push(Arc::new(TelegramNotifier::new(
            &config.telegram_api_url,
            token,
            chat_id,
        )?));
        debug!("Telegram notifications enabled");
    }

    Ok(Arc::new(CompositeNotifier::new(notifiers)))
}
