use std::collections::HashMap;
use std::env;
use std::sync::Arc;

use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use axum::body::Body;
use axum::http::{Method, Request};
use axum::Router;
use cadence::config::AppConfig;
use cadence::db::{self, PgPool};
use cadence::gmail::{
    GmailResult, HistoryPage, Mailbox, MailboxProvider, MessageSummary, SendOutcome,
    ThreadSummary,
};
use cadence::models::*;
use cadence::ratelimit::InMemoryCounterStore;
use cadence::schedule::ScheduleGenerator;
use cadence::state::AppState;
use cadence::{core_handlers, routes, Dispatcher, Sweeper};
use chrono::Utc;
use diesel::connection::SimpleConnection;
use diesel::prelude::*;
use diesel::PgConnection;
use diesel_migrations::{embed_migrations, EmbeddedMigrations, MigrationHarness};
use http_body_util::BodyExt;
use jsonwebtoken::{encode, EncodingKey, Header};
use once_cell::sync::Lazy;
use serde::Serialize;
use tokio::sync::Mutex;
use tower::util::ServiceExt;
use uuid::Uuid;

const MIGRATIONS: EmbeddedMigrations = embed_migrations!("migrations");

pub const PUSH_SECRET: &str = "test-push-secret";
pub const PUSH_AUDIENCE: &str = "cadence-push-test";
pub const TRACK_BASE: &str = "https://track.test";

static DB_LOCK: Lazy<Mutex<()>> = Lazy::new(|| Mutex::new(()));

#[allow(dead_code)]
#[derive(Clone, Debug)]
pub struct SentEmail {
    pub id: String,
    pub thread_id: String,
    pub raw: String,
    pub decoded: String,
}

#[derive(Default)]
struct MailboxInner {
    counter: usize,
    sent: Vec<SentEmail>,
    inserted: Vec<(String, Option<String>)>,
    deleted: Vec<String>,
    messages: HashMap<String, MessageSummary>,
    threads: HashMap<String, Vec<String>>,
    history: Vec<String>,
    history_id: Option<u64>,
}

/// Scripted Gmail double: captures sends and serves canned messages,
/// threads, and history pages.
#[derive(Default)]
pub struct FakeMailbox {
    inner: Mutex<MailboxInner>,
}

#[allow(dead_code)]
impl FakeMailbox {
    pub async fn sent(&self) -> Vec<SentEmail> {
        self.inner.lock().await.sent.clone()
    }

    pub async fn inserted(&self) -> Vec<(String, Option<String>)> {
        self.inner.lock().await.inserted.clone()
    }

    pub async fn deleted(&self) -> Vec<String> {
        self.inner.lock().await.deleted.clone()
    }

    /// Script a message the pipeline can fetch by id.
    pub async fn put_message(&self, summary: MessageSummary) {
        let mut inner = self.inner.lock().await;
        inner
            .threads
            .entry(summary.thread_id.clone())
            .or_default()
            .push(summary.id.clone());
        inner.messages.insert(summary.id.clone(), summary);
    }

    /// Script the next history page.
    pub async fn set_history(&self, message_ids: Vec<String>, history_id: Option<u64>) {
        let mut inner = self.inner.lock().await;
        inner.history = message_ids;
        inner.history_id = history_id;
    }
}

#[async_trait]
impl Mailbox for FakeMailbox {
    async fn send_message(&self, raw: &str, thread_id: Option<&str>) -> GmailResult<SendOutcome> {
        let mut inner = self.inner.lock().await;
        inner.counter += 1;
        let id = format!("sent-{}", inner.counter);
        let thread_id = thread_id
            .map(|t| t.to_string())
            .unwrap_or_else(|| format!("thread-{}", inner.counter));
        let decoded = cadence::mime::decode_raw(raw).unwrap_or_default();

        let summary = MessageSummary {
            id: id.clone(),
            thread_id: thread_id.clone(),
            label_ids: vec!["SENT".to_string()],
            headers: decoded
                .lines()
                .take_while(|line| !line.is_empty())
                .filter_map(|line| {
                    line.split_once(": ")
                        .map(|(name, value)| (name.to_string(), value.to_string()))
                })
                .collect(),
        };
        inner.messages.insert(id.clone(), summary);
        inner
            .threads
            .entry(thread_id.clone())
            .or_default()
            .push(id.clone());
        inner.sent.push(SentEmail {
            id: id.clone(),
            thread_id: thread_id.clone(),
            raw: raw.to_string(),
            decoded,
        });
        Ok(SendOutcome { id, thread_id })
    }

    async fn get_message(&self, id: &str) -> GmailResult<MessageSummary> {
        let inner = self.inner.lock().await;
        inner
            .messages
            .get(id)
            .cloned()
            .ok_or(cadence::gmail::GmailError::Api {
                status: 404,
                message: format!("no message {id}"),
            })
    }

    async fn get_message_raw(&self, id: &str) -> GmailResult<String> {
        let inner = self.inner.lock().await;
        inner
            .sent
            .iter()
            .find(|email| email.id == id)
            .map(|email| email.raw.clone())
            .ok_or(cadence::gmail::GmailError::Api {
                status: 404,
                message: format!("no raw message {id}"),
            })
    }

    async fn insert_message(
        &self,
        raw: &str,
        thread_id: Option<&str>,
        _label_ids: &[&str],
    ) -> GmailResult<String> {
        let mut inner = self.inner.lock().await;
        inner.counter += 1;
        let id = format!("inserted-{}", inner.counter);
        inner
            .inserted
            .push((raw.to_string(), thread_id.map(|t| t.to_string())));
        Ok(id)
    }

    async fn delete_message(&self, id: &str) -> GmailResult<()> {
        let mut inner = self.inner.lock().await;
        inner.deleted.push(id.to_string());
        Ok(())
    }

    async fn get_thread(&self, thread_id: &str) -> GmailResult<ThreadSummary> {
        let inner = self.inner.lock().await;
        let ids = inner.threads.get(thread_id).cloned().unwrap_or_default();
        if ids.is_empty() {
            return Err(cadence::gmail::GmailError::Api {
                status: 404,
                message: format!("no thread {thread_id}"),
            });
        }
        Ok(ThreadSummary {
            messages: ids
                .iter()
                .filter_map(|id| inner.messages.get(id).cloned())
                .collect(),
        })
    }

    async fn list_history(&self, _start_history_id: u64) -> GmailResult<HistoryPage> {
        let inner = self.inner.lock().await;
        Ok(HistoryPage {
            message_ids: inner.history.clone(),
            history_id: inner.history_id,
        })
    }
}

pub struct FakeMailboxProvider(pub Arc<FakeMailbox>);

#[async_trait]
impl MailboxProvider for FakeMailboxProvider {
    async fn mailbox_for(&self, _user_id: Uuid) -> GmailResult<Arc<dyn Mailbox>> {
        Ok(self.0.clone())
    }

    async fn force_refresh(&self, _user_id: Uuid) -> GmailResult<Arc<dyn Mailbox>> {
        Ok(self.0.clone())
    }
}

pub struct TestApp {
    pub state: AppState,
    router: Router,
    mailbox: Arc<FakeMailbox>,
}

#[allow(dead_code)]
impl TestApp {
    /// Build the harness, or skip (None) when no test database is
    /// configured.
    pub async fn try_new() -> Result<Option<Self>> {
        let Ok(database_url) = env::var("TEST_DATABASE_URL") else {
            eprintln!("TEST_DATABASE_URL not set; skipping integration test");
            return Ok(None);
        };

        let config = AppConfig {
            database_url: database_url.clone(),
            database_max_pool_size: db::DEFAULT_MAX_POOL_SIZE,
            server_host: "127.0.0.1".to_string(),
            server_port: 0,
            app_env: "test".to_string(),
            demo_mode: false,
            bypass_business_hours: false,
            redis_host: None,
            redis_port: 6379,
            redis_password: None,
            queue_prefix: "cadence-test".to_string(),
            google_client_id: "test-client".to_string(),
            google_client_secret: "test-secret".to_string(),
            google_redirect_uri: None,
            pubsub_audience: PUSH_AUDIENCE.to_string(),
            pubsub_verification_secret: PUSH_SECRET.to_string(),
            web_app_url: TRACK_BASE.to_string(),
            track_api_url: TRACK_BASE.to_string(),
            test_email: None,
        };

        let pool = db::build_pool(&config.database_url, config.database_max_pool_size)?;
        prepare_database(&pool).await?;

        let mailbox = Arc::new(FakeMailbox::default());
        let provider = Arc::new(FakeMailboxProvider(mailbox.clone()));
        let counters = Arc::new(InMemoryCounterStore::new());

        let mut state = AppState::new(pool, config, counters, provider);
        state.scheduler = Arc::new(ScheduleGenerator::seeded(42, false, false));
        let router = routes::create_router(state.clone());

        Ok(Some(Self {
            state,
            router,
            mailbox,
        }))
    }

    pub fn mailbox(&self) -> Arc<FakeMailbox> {
        self.mailbox.clone()
    }

    pub fn dispatcher(&self) -> Dispatcher {
        Dispatcher::new(
            Arc::new(self.state.clone()),
            core_handlers(),
            std::time::Duration::from_millis(50),
        )
    }

    pub fn sweeper(&self) -> Sweeper {
        Sweeper::new(
            Arc::new(self.state.clone()),
            std::time::Duration::from_millis(50),
        )
    }

    /// Drain the queue: poll until no runnable job remains.
    pub async fn drain_jobs(&self) -> Result<()> {
        let dispatcher = self.dispatcher();
        loop {
            match dispatcher.poll_once().await {
                Ok(Some(_)) => {}
                Ok(None) => return Ok(()),
                Err(err) => return Err(anyhow!("queue poll failed: {err}")),
            }
        }
    }

    pub fn push_token(&self) -> Result<String> {
        let claims = serde_json::json!({
            "aud": PUSH_AUDIENCE,
            "iss": "https://accounts.google.com",
            "exp": Utc::now().timestamp() + 600,
            "email": "push@system.gserviceaccount.com",
        });
        Ok(encode(
            &Header::default(),
            &claims,
            &EncodingKey::from_secret(PUSH_SECRET.as_bytes()),
        )?)
    }

    pub async fn insert_user(&self, email: &str) -> Result<Uuid> {
        let email = email.to_string();
        self.with_conn(move |conn| {
            let user = NewUser {
                id: Uuid::new_v4(),
                email,
            };
            diesel::insert_into(cadence::schema::users::table)
                .values(&user)
                .execute(conn)
                .context("failed to insert user")?;
            Ok(user.id)
        })
        .await
    }

    pub async fn insert_google_account(&self, user_id: Uuid) -> Result<Uuid> {
        self.with_conn(move |conn| {
            let account = NewGoogleAccount {
                id: Uuid::new_v4(),
                user_id,
                access_token: "ya29.test".to_string(),
                refresh_token: "1//test".to_string(),
                token_expiry: Some((Utc::now() + chrono::Duration::hours(1)).naive_utc()),
            };
            diesel::insert_into(cadence::schema::google_accounts::table)
                .values(&account)
                .execute(conn)
                .context("failed to insert google account")?;
            Ok(account.id)
        })
        .await
    }

    pub async fn insert_sequence(&self, user_id: Uuid, name: &str) -> Result<Uuid> {
        let name = name.to_string();
        self.with_conn(move |conn| {
            let sequence = NewSequence {
                id: Uuid::new_v4(),
                user_id,
                name,
                status: sequence_status::DRAFT.to_string(),
                test_mode: false,
            };
            diesel::insert_into(cadence::schema::sequences::table)
                .values(&sequence)
                .execute(conn)
                .context("failed to insert sequence")?;
            Ok(sequence.id)
        })
        .await
    }

    pub async fn insert_step(
        &self,
        sequence_id: Uuid,
        order: i32,
        timing: &str,
        delay: Option<(i32, &str)>,
        subject: &str,
        content: &str,
        reply_to_thread: bool,
    ) -> Result<Uuid> {
        let timing = timing.to_string();
        let subject = subject.to_string();
        let content = content.to_string();
        let delay = delay.map(|(amount, unit)| (amount, unit.to_string()));
        self.with_conn(move |conn| {
            let step = NewSequenceStep {
                id: Uuid::new_v4(),
                sequence_id,
                step_order: order,
                step_type: step_type::AUTOMATED_EMAIL.to_string(),
                timing,
                delay_amount: delay.as_ref().map(|(amount, _)| *amount),
                delay_unit: delay.map(|(_, unit)| unit),
                subject: Some(subject),
                content: Some(content),
                reply_to_thread,
                previous_step_id: None,
            };
            diesel::insert_into(cadence::schema::sequence_steps::table)
                .values(&step)
                .execute(conn)
                .context("failed to insert step")?;
            Ok(step.id)
        })
        .await
    }

    pub async fn insert_contact(&self, user_id: Uuid, email: &str) -> Result<Uuid> {
        let email = email.to_string();
        self.with_conn(move |conn| {
            let contact = NewContact {
                id: Uuid::new_v4(),
                user_id,
                email,
                first_name: Some("Test".to_string()),
                company: None,
            };
            diesel::insert_into(cadence::schema::contacts::table)
                .values(&contact)
                .execute(conn)
                .context("failed to insert contact")?;
            Ok(contact.id)
        })
        .await
    }

    pub async fn assign_contact(&self, sequence_id: Uuid, contact_id: Uuid) -> Result<Uuid> {
        self.with_conn(move |conn| {
            let row = NewSequenceContact {
                id: Uuid::new_v4(),
                sequence_id,
                contact_id,
                status: contact_status::NOT_SENT.to_string(),
            };
            diesel::insert_into(cadence::schema::sequence_contacts::table)
                .values(&row)
                .execute(conn)
                .context("failed to assign contact")?;
            Ok(row.id)
        })
        .await
    }

    pub async fn progress_row(
        &self,
        sequence_id: Uuid,
        contact_id: Uuid,
    ) -> Result<SequenceContact> {
        self.with_conn(move |conn| {
            use cadence::schema::sequence_contacts::dsl::*;
            sequence_contacts
                .filter(cadence::schema::sequence_contacts::sequence_id.eq(sequence_id))
                .filter(cadence::schema::sequence_contacts::contact_id.eq(contact_id))
                .first::<SequenceContact>(conn)
                .context("progress row missing")
        })
        .await
    }

    pub async fn clear_schedule(&self, row_id: Uuid) -> Result<()> {
        self.with_conn(move |conn| {
            use cadence::schema::sequence_contacts::dsl::*;
            diesel::update(sequence_contacts.find(row_id))
                .set(next_scheduled_at.eq::<Option<chrono::NaiveDateTime>>(None))
                .execute(conn)
                .context("failed to clear schedule")?;
            Ok(())
        })
        .await
    }

    pub async fn make_due(&self, row_id: Uuid) -> Result<()> {
        self.with_conn(move |conn| {
            use cadence::schema::sequence_contacts::dsl::*;
            diesel::update(sequence_contacts.find(row_id))
                .set(next_scheduled_at.eq((Utc::now() - chrono::Duration::minutes(1)).naive_utc()))
                .execute(conn)
                .context("failed to make row due")?;
            Ok(())
        })
        .await
    }

    pub async fn post_json<T: Serialize + ?Sized>(
        &self,
        path: &str,
        payload: &T,
        token: Option<&str>,
    ) -> Result<hyper::Response<Body>> {
        let body = serde_json::to_vec(payload)?;
        let mut builder = Request::builder()
            .method(Method::POST)
            .uri(path)
            .header("content-type", "application/json");
        if let Some(token) = token {
            builder = builder.header("authorization", format!("Bearer {token}"));
        }
        let request = builder.body(Body::from(body))?;
        Ok(self
            .router
            .clone()
            .oneshot(request)
            .await
            .expect("infallible response"))
    }

    pub async fn get(&self, path: &str) -> Result<hyper::Response<Body>> {
        self.get_with_headers(path, &[]).await
    }

    pub async fn get_with_headers(
        &self,
        path: &str,
        headers: &[(&str, &str)],
    ) -> Result<hyper::Response<Body>> {
        let mut builder = Request::builder().method(Method::GET).uri(path);
        for (name, value) in headers {
            builder = builder.header(*name, *value);
        }
        let request = builder.body(Body::empty())?;
        Ok(self
            .router
            .clone()
            .oneshot(request)
            .await
            .expect("infallible response"))
    }

    pub async fn with_conn<F, T>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&mut PgConnection) -> Result<T> + Send + 'static,
        T: Send + 'static,
    {
        let pool = self.state.pool.clone();
        tokio::task::spawn_blocking(move || {
            let mut conn = pool
                .get()
                .map_err(|err| anyhow!("failed to get database connection: {err}"))?;
            f(&mut conn)
        })
        .await
        .context("connection task panicked")?
    }
}

pub async fn acquire_db_lock() -> tokio::sync::MutexGuard<'static, ()> {
    DB_LOCK.lock().await
}

pub async fn body_to_vec(body: Body) -> Result<Vec<u8>> {
    let collected = body
        .collect()
        .await
        .map_err(|err| anyhow!("failed to read response body: {err}"))?;
    Ok(collected.to_bytes().to_vec())
}

async fn prepare_database(pool: &PgPool) -> Result<()> {
    let pool = pool.clone();
    tokio::task::spawn_blocking(move || -> Result<()> {
        let mut conn = pool
            .get()
            .map_err(|err| anyhow!("failed to acquire connection: {err}"))?;
        conn.run_pending_migrations(MIGRATIONS)
            .map_err(|err| anyhow!("failed to run migrations: {err}"))?;
        truncate_all(&mut conn)?;
        Ok(())
    })
    .await
    .context("migration task panicked")?
}

fn truncate_all(conn: &mut PgConnection) -> Result<()> {
    conn.batch_execute(
        "TRUNCATE TABLE jobs, sequence_health, sequence_stats, email_threads, email_events, \
         link_clicks, tracked_links, email_tracking, business_hours, sequence_contacts, \
         contacts, sequence_steps, sequences, google_accounts, users RESTART IDENTITY CASCADE;",
    )
    .context("failed to truncate tables")?;
    Ok(())
}
