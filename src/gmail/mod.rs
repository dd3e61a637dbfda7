pub mod rest;

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use diesel::prelude::*;
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::{info, warn};
use uuid::Uuid;

use crate::config::AppConfig;
use crate::db::PgPool;
use crate::models::GoogleAccount;
use crate::schema::google_accounts;

pub use rest::GmailMailbox;

const TOKEN_URI: &str = "https://oauth2.googleapis.com/token";
const EXPIRY_SLACK_SECONDS: i64 = 60;
const REFRESH_ATTEMPTS: u32 = 3;
const REFRESH_BACKOFF_CAP: Duration = Duration::from_secs(10);

#[derive(Debug, Error)]
pub enum GmailError {
    #[error("TOKEN_EXPIRED")]
    TokenExpired,
    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),
    #[error("gmail api error {status}: {message}")]
    Api { status: u16, message: String },
    #[error("database error: {0}")]
    Database(#[from] diesel::result::Error),
    #[error("database pool error: {0}")]
    Pool(String),
    #[error("no google account for user {0}")]
    AccountMissing(Uuid),
    #[error("token refresh failed: {0}")]
    RefreshFailed(String),
}

pub type GmailResult<T> = Result<T, GmailError>;

#[derive(Debug, Clone)]
pub struct SendOutcome {
    pub id: String,
    pub thread_id: String,
}

#[derive(Debug, Clone, Default)]
pub struct MessageSummary {
    pub id: String,
    pub thread_id: String,
    pub label_ids: Vec<String>,
    pub headers: Vec<(String, String)>,
}

impl MessageSummary {
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(header, _)| header.eq_ignore_ascii_case(name))
            .map(|(_, value)| value.as_str())
    }
}

#[derive(Debug, Clone, Default)]
pub struct ThreadSummary {
    pub messages: Vec<MessageSummary>,
}

#[derive(Debug, Clone, Default)]
pub struct HistoryPage {
    pub message_ids: Vec<String>,
    pub history_id: Option<u64>,
}

/// One user's mailbox. Every method may suspend on the network and maps
/// HTTP 401 to `GmailError::TokenExpired`.
#[async_trait]
pub trait Mailbox: Send + Sync {
    async fn send_message(&self, raw: &str, thread_id: Option<&str>) -> GmailResult<SendOutcome>;

    async fn get_message(&self, id: &str) -> GmailResult<MessageSummary>;

    async fn get_message_raw(&self, id: &str) -> GmailResult<String>;

    async fn insert_message(
        &self,
        raw: &str,
        thread_id: Option<&str>,
        label_ids: &[&str],
    ) -> GmailResult<String>;

    async fn delete_message(&self, id: &str) -> GmailResult<()>;

    async fn get_thread(&self, thread_id: &str) -> GmailResult<ThreadSummary>;

    async fn list_history(&self, start_history_id: u64) -> GmailResult<HistoryPage>;
}

/// Hands out authenticated mailboxes per user, refreshing stored tokens
/// as needed.
#[async_trait]
pub trait MailboxProvider: Send + Sync + 'static {
    async fn mailbox_for(&self, user_id: Uuid) -> GmailResult<Arc<dyn Mailbox>>;

    /// Unconditionally refresh the user's access token and return a
    /// mailbox bound to the new credentials. Used after a mid-call 401.
    async fn force_refresh(&self, user_id: Uuid) -> GmailResult<Arc<dyn Mailbox>>;
}

pub struct GmailProvider {
    pool: PgPool,
    config: Arc<AppConfig>,
    http: reqwest::Client,
    refresh_locks: Mutex<HashMap<Uuid, Arc<Mutex<()>>>>,
}

impl GmailProvider {
    pub fn new(pool: PgPool, config: Arc<AppConfig>) -> Self {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(30))
            .build()
            .unwrap_or_default();
        Self {
            pool,
            config,
            http,
            refresh_locks: Mutex::new(HashMap::new()),
        }
    }

    fn load_account(&self, user_id: Uuid) -> GmailResult<GoogleAccount> {
        let mut conn = self
            .pool
            .get()
            .map_err(|err| GmailError::Pool(err.to_string()))?;
        google_accounts::table
            .filter(google_accounts::user_id.eq(user_id))
            .first::<GoogleAccount>(&mut conn)
            .optional()?
            .ok_or(GmailError::AccountMissing(user_id))
    }

    fn persist_token(&self, account_id: Uuid, access_token: &str, expires_in: i64) -> GmailResult<()> {
        let expiry = Utc::now() + chrono::Duration::seconds(expires_in);
        let mut conn = self
            .pool
            .get()
            .map_err(|err| GmailError::Pool(err.to_string()))?;
        diesel::update(google_accounts::table.find(account_id))
            .set((
                google_accounts::access_token.eq(access_token),
                google_accounts::token_expiry.eq(expiry.naive_utc()),
                google_accounts::updated_at.eq(Utc::now().naive_utc()),
            ))
            .execute(&mut conn)?;
        Ok(())
    }

    fn is_expiring(account: &GoogleAccount) -> bool {
        match account.token_expiry {
            None => true,
            Some(expiry) => {
                expiry <= (Utc::now() + chrono::Duration::seconds(EXPIRY_SLACK_SECONDS)).naive_utc()
            }
        }
    }

    async fn user_lock(&self, user_id: Uuid) -> Arc<Mutex<()>> {
        let mut guard = self.refresh_locks.lock().await;
        guard
            .entry(user_id)
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    /// Refresh under the per-user mutex so two workers never race the
    /// token endpoint for the same account.
    async fn refresh(&self, user_id: Uuid, force: bool) -> GmailResult<GoogleAccount> {
        let lock = self.user_lock(user_id).await;
        let _guard = lock.lock().await;

        let account = self.load_account(user_id)?;
        if !force && !Self::is_expiring(&account) {
            // Another task already refreshed while we waited on the lock.
            return Ok(account);
        }

        let mut delay = Duration::from_secs(1);
        let mut last_error = String::new();
        for attempt in 1..=REFRESH_ATTEMPTS {
            match self.request_refresh(&account).await {
                Ok((access_token, expires_in)) => {
                    self.persist_token(account.id, &access_token, expires_in)?;
                    info!(user_id = %user_id, "refreshed gmail access token");
                    return self.load_account(user_id);
                }
                Err(GmailError::TokenExpired) => return Err(GmailError::TokenExpired),
                Err(err) => {
                    last_error = err.to_string();
                    warn!(user_id = %user_id, attempt, error = %last_error, "token refresh attempt failed");
                    if attempt < REFRESH_ATTEMPTS {
                        tokio::time::sleep(delay).await;
                        delay = (delay * 2).min(REFRESH_BACKOFF_CAP);
                    }
                }
            }
        }
        Err(GmailError::RefreshFailed(last_error))
    }

    async fn request_refresh(&self, account: &GoogleAccount) -> GmailResult<(String, i64)> {
        let response = self
            .http
            .post(TOKEN_URI)
            .form(&[
                ("client_id", self.config.google_client_id.as_str()),
                ("client_secret", self.config.google_client_secret.as_str()),
                ("refresh_token", account.refresh_token.as_str()),
                ("grant_type", "refresh_token"),
            ])
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            if status.as_u16() == 400 || status.as_u16() == 401 {
                return Err(GmailError::TokenExpired);
            }
            return Err(GmailError::RefreshFailed(format!("HTTP {status}: {body}")));
        }

        let body: serde_json::Value = response.json().await?;
        let access_token = body["access_token"]
            .as_str()
            .ok_or_else(|| GmailError::RefreshFailed("no access_token in response".into()))?
            .to_string();
        let expires_in = body["expires_in"].as_i64().unwrap_or(3600);
        Ok((access_token, expires_in))
    }
}

#[async_trait]
impl MailboxProvider for GmailProvider {
    async fn mailbox_for(&self, user_id: Uuid) -> GmailResult<Arc<dyn Mailbox>> {
        let account = self.load_account(user_id)?;
        let account = if Self::is_expiring(&account) {
            self.refresh(user_id, false).await?
        } else {
            account
        };
        Ok(Arc::new(GmailMailbox::new(
            self.http.clone(),
            account.access_token,
        )))
    }

    async fn force_refresh(&self, user_id: Uuid) -> GmailResult<Arc<dyn Mailbox>> {
        let account = self.refresh(user_id, true).await?;
        Ok(Arc::new(GmailMailbox::new(
            self.http.clone(),
            account.access_token,
        )))
    }
}
