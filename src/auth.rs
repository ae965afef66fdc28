//! Credential acquisition and refresh
//!
//! The token file is the JSON written by the OAuth consent flow. Access tokens
//! are refreshed through its `token_uri` when they are within five minutes of
//! expiry, and the refreshed token is written back.

use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::clock::Clock;
use crate::config::AuthConfig;
use crate::error::SyncError;

/// Refresh this long before the recorded expiry
const EXPIRY_BUFFER_MINUTES: i64 = 5;

#[derive(Debug, Clone, PartialEq)]
pub struct AccessToken {
    pub secret: String,
    pub expires_at: Option<DateTime<Utc>>,
}

#[async_trait]
pub trait Authenticator: Send + Sync {
    /// A token usable right now, refreshed if needed
    async fn get_valid_token(&self) -> Result<AccessToken, SyncError>;
}

/// On-disk OAuth credential
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TokenFile {
    pub token: String,
    #[serde(default)]
    pub refresh_token: Option<String>,
    #[serde(default = "default_token_uri")]
    pub token_uri: String,
    #[serde(default)]
    pub client_id: Option<String>,
    #[serde(default)]
    pub client_secret: Option<String>,
    #[serde(default)]
    pub scopes: Vec<String>,
    #[serde(default)]
    pub expiry: Option<DateTime<Utc>>,
}

fn default_token_uri() -> String {
    "https://oauth2.googleapis.com/token".to_string()
}

impl TokenFile {
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read token file: {:?}", path))?;
        check_permissions(path);
        serde_json::from_str(&content).with_context(|| format!("Failed to parse token file: {:?}", path))
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        let content = serde_json::to_string_pretty(self).context("Failed to serialize token")?;
        std::fs::write(path, content).with_context(|| format!("Failed to write token file: {:?}", path))?;
        Ok(())
    }

    /// Usable at `now` with the safety buffer. A token without a recorded
    /// expiry is assumed valid until the API says otherwise.
    pub fn is_fresh_at(&self, now: DateTime<Utc>) -> bool {
        match self.expiry {
            Some(expiry) => now + Duration::minutes(EXPIRY_BUFFER_MINUTES) < expiry,
            None => true,
        }
    }

    fn access_token(&self) -> AccessToken {
        AccessToken {
            secret: self.token.clone(),
            expires_at: self.expiry,
        }
    }
}

#[cfg(unix)]
fn check_permissions(path: &Path) {
    use std::os::unix::fs::PermissionsExt;

    if let Ok(metadata) = std::fs::metadata(path) {
        let mode = metadata.permissions().mode() & 0o777;
        if mode != 0o600 {
            warn!(
                "Token file {:?} has permissions {:o}; it should be 600",
                path, mode
            );
        }
    }
}

#[cfg(not(unix))]
fn check_permissions(_path: &Path) {}

#[derive(Debug, Deserialize)]
struct RefreshResponse {
    access_token: String,
    #[serde(default)]
    expires_in: Option<i64>,
    #[serde(default)]
    refresh_token: Option<String>,
}

#[derive(Debug, Deserialize)]
struct RefreshError {
    #[serde(default)]
    error: String,
    #[serde(default)]
    error_description: Option<String>,
}

/// OAuth token file with automatic refresh
pub struct TokenFileAuthenticator {
    path: PathBuf,
    client: reqwest::Client,
    clock: Arc<dyn Clock>,
    state: Mutex<Option<TokenFile>>,
}

impl TokenFileAuthenticator {
    pub fn new(path: PathBuf, clock: Arc<dyn Clock>) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(std::time::Duration::from_secs(30))
            .build()
            .context("Failed to build OAuth HTTP client")?;

        Ok(Self {
            path,
            client,
            clock,
            state: Mutex::new(None),
        })
    }

    async fn refresh(&self, token: &TokenFile) -> Result<TokenFile, SyncError> {
        let refresh_token = token.refresh_token.as_deref().ok_or_else(|| {
            SyncError::TokenExpired("access token expired and no refresh_token is stored".to_string())
        })?;
        let client_id = token.client_id.as_deref().unwrap_or_default();
        let client_secret = token.client_secret.as_deref().unwrap_or_default();

        debug!("Refreshing access token via {}", token.token_uri);
        let response = self
            .client
            .post(&token.token_uri)
            .form(&[
                ("grant_type", "refresh_token"),
                ("refresh_token", refresh_token),
                ("client_id", client_id),
                ("client_secret", client_secret),
            ])
            .send()
            .await
            .map_err(|e| SyncError::NetworkTransient {
                operation: "token refresh".to_string(),
                message: e.to_string(),
            })?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            let parsed: Option<RefreshError> = serde_json::from_str(&body).ok();
            let message = match &parsed {
                Some(err) => format!(
                    "{}: {}",
                    err.error,
                    err.error_description.as_deref().unwrap_or("no description")
                ),
                None => body,
            };

            if status.is_server_error() {
                return Err(SyncError::NetworkTransient {
                    operation: "token refresh".to_string(),
                    message: format!("{}: {}", status, message),
                });
            }
            return Err(SyncError::TokenExpired(format!(
                "token refresh rejected ({}): {}",
                status, message
            )));
        }

        let refreshed: RefreshResponse = response.json().await.map_err(|e| SyncError::TokenExpired(
            format!("unreadable token refresh response: {}", e),
        ))?;

        let mut updated = token.clone();
        updated.token = refreshed.access_token;
        updated.expiry = refreshed
            .expires_in
            .map(|secs| self.clock.now() + Duration::seconds(secs));
        if let Some(rotated) = refreshed.refresh_token {
            updated.refresh_token = Some(rotated);
        }

        if let Err(e) = updated.save(&self.path) {
            warn!("Refreshed token could not be written back: {:#}", e);
        } else {
            info!("Access token refreshed");
        }

        Ok(updated)
    }
}

#[async_trait]
impl Authenticator for TokenFileAuthenticator {
    async fn get_valid_token(&self) -> Result<AccessToken, SyncError> {
        let mut state = self.state.lock().await;

        if state.is_none() {
            let loaded = TokenFile::load(&self.path)
                .map_err(|e| SyncError::TokenExpired(format!("{:#}", e)))?;
            *state = Some(loaded);
        }

        let current = state
            .as_ref()
            .ok_or_else(|| SyncError::TokenExpired("no token loaded".to_string()))?;
        if current.is_fresh_at(self.clock.now()) {
            return Ok(current.access_token());
        }

        let refreshed = self.refresh(current).await?;
        let token = refreshed.access_token();
        *state = Some(refreshed);
        Ok(token)
    }
}

/// Raw access token from an environment variable, never refreshed
pub struct EnvTokenAuthenticator {
    var: String,
}

impl EnvTokenAuthenticator {
    pub fn new(var: impl Into<String>) -> Self {
        Self { var: var.into() }
    }
}

#[async_trait]
impl Authenticator for EnvTokenAuthenticator {
    async fn get_valid_token(&self) -> Result<AccessToken, SyncError> {
        match std::env::var(&self.var) {
            Ok(secret) if !secret.trim().is_empty() => Ok(AccessToken {
                secret: secret.trim().to_string(),
                expires_at: None,
            }),
            _ => Err(SyncError::TokenExpired(format!(
                "environment variable {} is not set",
                self.var
            ))),
        }
    }
}

/// Pick the authenticator named by `auth.method`
pub fn build_authenticator(config: &AuthConfig, clock: Arc<dyn Clock>) -> Result<Arc<dyn Authenticator>> {
    match config.method.as_str() {
        "token_file" => Ok(Arc::new(TokenFileAuthenticator::new(
            PathBuf::from(&config.token_file),
            clock,
        )?)),
        "env" => Ok(Arc::new(EnvTokenAuthenticator::new(config.token_env.clone()))),
        other => Err(anyhow!("Unknown auth method: {}", other)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use assert_matches::assert_matches;
    use chrono::TimeZone;
    use serial_test::serial;
    use tempfile::TempDir;
    use wiremock::matchers::{body_string_contains, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 6, 1, 12, 0, 0).unwrap()
    }

    fn write_token(dir: &TempDir, token_uri: &str, expiry: Option<DateTime<Utc>>) -> PathBuf {
        let file = TokenFile {
            token: "old-access".to_string(),
            refresh_token: Some("refresh-1".to_string()),
            token_uri: token_uri.to_string(),
            client_id: Some("client".to_string()),
            client_secret: Some("secret".to_string()),
            scopes: vec!["https://www.googleapis.com/auth/youtube".to_string()],
            expiry,
        };
        let path = dir.path().join("token.json");
        file.save(&path).unwrap();
        path
    }

    fn authenticator(path: PathBuf) -> TokenFileAuthenticator {
        TokenFileAuthenticator::new(path, Arc::new(ManualClock::new(now()))).unwrap()
    }

    #[tokio::test]
    async fn test_fresh_token_used_without_refresh() {
        let dir = TempDir::new().unwrap();
        let path = write_token(&dir, "http://127.0.0.1:9/unused", Some(now() + Duration::hours(1)));

        let token = authenticator(path).get_valid_token().await.unwrap();
        assert_eq!(token.secret, "old-access");
    }

    #[tokio::test]
    async fn test_expiring_token_is_refreshed_and_saved() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/token"))
            .and(body_string_contains("grant_type=refresh_token"))
            .and(body_string_contains("refresh_token=refresh-1"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "access_token": "new-access",
                "expires_in": 3599,
                "token_type": "Bearer"
            })))
            .expect(1)
            .mount(&server)
            .await;

        let dir = TempDir::new().unwrap();
        // Inside the five minute buffer
        let path = write_token(
            &dir,
            &format!("{}/token", server.uri()),
            Some(now() + Duration::minutes(3)),
        );

        let auth = authenticator(path.clone());
        let token = auth.get_valid_token().await.unwrap();
        assert_eq!(token.secret, "new-access");
        assert_eq!(token.expires_at, Some(now() + Duration::seconds(3599)));

        // Cached after the first refresh
        assert_eq!(auth.get_valid_token().await.unwrap().secret, "new-access");

        let saved = TokenFile::load(&path).unwrap();
        assert_eq!(saved.token, "new-access");
        assert_eq!(saved.refresh_token.as_deref(), Some("refresh-1"));
    }

    #[tokio::test]
    async fn test_invalid_grant_is_token_expired() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(400).set_body_json(serde_json::json!({
                "error": "invalid_grant",
                "error_description": "Token has been expired or revoked."
            })))
            .mount(&server)
            .await;

        let dir = TempDir::new().unwrap();
        let path = write_token(&dir, &format!("{}/token", server.uri()), Some(now() - Duration::hours(1)));

        let result = authenticator(path).get_valid_token().await;
        assert_matches!(result, Err(SyncError::TokenExpired(msg)) if msg.contains("invalid_grant"));
    }

    #[tokio::test]
    async fn test_refresh_server_error_is_transient() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(503))
            .mount(&server)
            .await;

        let dir = TempDir::new().unwrap();
        let path = write_token(&dir, &format!("{}/token", server.uri()), Some(now() - Duration::hours(1)));

        let result = authenticator(path).get_valid_token().await;
        assert_matches!(result, Err(SyncError::NetworkTransient { .. }));
    }

    #[tokio::test]
    async fn test_missing_file_is_token_expired() {
        let dir = TempDir::new().unwrap();
        let result = authenticator(dir.path().join("absent.json")).get_valid_token().await;
        assert_matches!(result, Err(SyncError::TokenExpired(_)));
    }

    #[tokio::test]
    #[serial]
    async fn test_env_authenticator() {
        std::env::set_var("TUBESENTRY_TEST_TOKEN", "abc123");
        let auth = EnvTokenAuthenticator::new("TUBESENTRY_TEST_TOKEN");
        assert_eq!(auth.get_valid_token().await.unwrap().secret, "abc123");

        std::env::remove_var("TUBESENTRY_TEST_TOKEN");
        assert_matches!(auth.get_valid_token().await, Err(SyncError::TokenExpired(_)));
    }

    #[test]
    fn test_freshness_buffer() {
        let mut file = TokenFile {
            token: "t".to_string(),
            refresh_token: None,
            token_uri: default_token_uri(),
            client_id: None,
            client_secret: None,
            scopes: vec![],
            expiry: None,
        };
        assert!(file.is_fresh_at(now()));

        file.expiry = Some(now() + Duration::minutes(6));
        assert!(file.is_fresh_at(now()));

        file.expiry = Some(now() + Duration::minutes(5));
        assert!(!file.is_fresh_at(now()));
    }
}
