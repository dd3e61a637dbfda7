use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use diesel::prelude::*;
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::{
    gmail::GmailError,
    inbound::{apply_message, AppliedEvent, MessageFacts},
    jobs::{self, JobKind},
    models::User,
    schema::users,
    state::AppState,
};

use super::{JobHandler, JobOutcome};

const WATCH_INTERVAL_MINUTES: i64 = 30;

#[derive(Debug, Serialize, Deserialize)]
struct WatchThreadPayload {
    user_id: Uuid,
    thread_id: String,
    #[serde(default)]
    checks_left: u32,
}

/// Polling fallback for reply/bounce detection when push notifications
/// lag: re-reads one thread on a schedule until something lands or the
/// remaining checks run out.
pub struct WatchThreadJob;

impl WatchThreadJob {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl JobHandler for WatchThreadJob {
    fn kind(&self) -> JobKind {
        JobKind::WatchThread
    }

    async fn run(&self, state: Arc<AppState>, job: crate::models::Job) -> JobOutcome {
        let payload: WatchThreadPayload = match serde_json::from_value(job.payload.clone()) {
            Ok(payload) => payload,
            Err(err) => {
                return JobOutcome::Abandon {
                    error: format!("invalid thread watch payload: {err}"),
                }
            }
        };

        let user = {
            let mut conn = match state.db() {
                Ok(conn) => conn,
                Err(err) => {
                    return JobOutcome::Defer {
                        error: format!("{err:?}"),
                        delay: None,
                    }
                }
            };
            match users::table
                .find(payload.user_id)
                .first::<User>(&mut conn)
                .optional()
            {
                Ok(Some(user)) => user,
                Ok(None) => {
                    return JobOutcome::Abandon {
                        error: format!("user {} not found", payload.user_id),
                    }
                }
                Err(err) => {
                    return JobOutcome::Defer {
                        error: err.to_string(),
                        delay: None,
                    }
                }
            }
        };

        let mailbox = match state.mailboxes.mailbox_for(user.id).await {
            Ok(mailbox) => mailbox,
            Err(GmailError::TokenExpired) => match state.mailboxes.force_refresh(user.id).await {
                Ok(mailbox) => mailbox,
                Err(err) => {
                    return JobOutcome::Defer {
                        error: err.to_string(),
                        delay: None,
                    }
                }
            },
            Err(err) => {
                return JobOutcome::Defer {
                    error: err.to_string(),
                    delay: None,
                }
            }
        };

        let thread = match mailbox.get_thread(&payload.thread_id).await {
            Ok(thread) => thread,
            Err(GmailError::Api { status: 404, .. }) => {
                debug!(thread_id = %payload.thread_id, "watched thread vanished");
                return JobOutcome::Done;
            }
            Err(err) => {
                return JobOutcome::Defer {
                    error: err.to_string(),
                    delay: None,
                }
            }
        };

        let mut settled = false;
        for summary in &thread.messages {
            let facts = MessageFacts::from(summary);
            let mut conn = match state.db() {
                Ok(conn) => conn,
                Err(err) => {
                    return JobOutcome::Defer {
                        error: format!("{err:?}"),
                        delay: None,
                    }
                }
            };
            match apply_message(&mut conn, &facts, &user) {
                Ok(AppliedEvent::Reply { .. }) => settled = true,
                Ok(AppliedEvent::Bounce { contact_id }) => {
                    settled = true;
                    drop(conn);
                    if let Err(err) = state.limiter.start_bounce_cooldown(contact_id).await {
                        warn!(error = %err, "failed to arm bounce cooldown");
                    }
                }
                Ok(_) => {}
                Err(err) => {
                    warn!(message_id = %facts.id, error = %err, "failed to classify thread message")
                }
            }
        }

        if !settled && payload.checks_left > 1 {
            if let Ok(mut conn) = state.db() {
                let enqueue = jobs::push(
                    &mut conn,
                    JobKind::WatchThread,
                    json!({
                        "user_id": payload.user_id,
                        "thread_id": payload.thread_id,
                        "checks_left": payload.checks_left - 1,
                    }),
                    Some((Utc::now() + chrono::Duration::minutes(WATCH_INTERVAL_MINUTES)).naive_utc()),
                );
                if let Err(err) = enqueue {
                    warn!(error = %err, "failed to reschedule thread watch");
                }
            }
        }

        JobOutcome::Done
    }
}
