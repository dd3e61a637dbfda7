use std::{sync::Arc, time::Duration};

use async_trait::async_trait;
use chrono::Utc;
use diesel::prelude::*;
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::{info, warn};
use uuid::Uuid;

use crate::{
    events::{self, TrackingMetadata},
    gmail::{GmailError, Mailbox},
    jobs::{self, JobKind},
    mime::{self, OutgoingMessage},
    models::{
        contact_status, event_type, tracking_status, Contact, EmailTracking, NewEmailThread,
        NewEmailTracking, NewTrackedLink, Sequence, SequenceContact, SequenceStep, User,
    },
    schema::{
        email_threads, email_tracking, sequence_contacts, sequence_steps, sequences,
        tracked_links, users,
    },
    state::AppState,
    template,
    tracking::{instrument_html, RewrittenLink},
};

use super::{JobHandler, JobOutcome};

const SENT_REWRITE_ATTEMPTS: usize = 3;
const SENT_REWRITE_DELAY: Duration = Duration::from_secs(1);
const WATCH_THREAD_DELAY_MINUTES: i64 = 10;
const WATCH_THREAD_CHECKS: u32 = 12;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SendEmailPayload {
    pub sequence_id: Uuid,
    pub contact_id: Uuid,
    pub step_id: Uuid,
    pub user_id: Uuid,
    pub to: String,
    pub subject: String,
    #[serde(default)]
    pub thread_id: Option<String>,
    pub scheduled_time: chrono::NaiveDateTime,
    #[serde(default)]
    pub test_mode: bool,
}

enum SendError {
    /// The send no longer applies (reply arrived, row deleted); not an error.
    Skip(String),
    /// Bad input that a retry cannot fix.
    Invalid(String),
    /// Worth retrying through the queue.
    Transient(String),
}

impl SendError {
    fn transient(err: impl std::fmt::Display) -> Self {
        SendError::Transient(err.to_string())
    }
}

/// Sends one step's email through Gmail with tracking instrumentation,
/// threading headers, and the untracked sent-folder mirror.
///
/// The tracking hash is derived from the job id, so queue redelivery
/// reuses the same `email_tracking` row instead of double-counting.
pub struct SendEmailJob;

impl SendEmailJob {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl JobHandler for SendEmailJob {
    fn kind(&self) -> JobKind {
        JobKind::SendEmail
    }

    async fn run(&self, state: Arc<AppState>, job: crate::models::Job) -> JobOutcome {
        let payload: SendEmailPayload = match serde_json::from_value(job.payload.clone()) {
            Ok(payload) => payload,
            Err(err) => {
                return JobOutcome::Abandon {
                    error: format!("invalid email payload: {err}"),
                }
            }
        };

        let hash = job.id.simple().to_string();
        match self.send(&state, &payload, &hash).await {
            Ok(()) => JobOutcome::Done,
            Err(SendError::Skip(reason)) => {
                info!(
                    sequence_id = %payload.sequence_id,
                    contact_id = %payload.contact_id,
                    reason = %reason,
                    "send skipped"
                );
                JobOutcome::Done
            }
            Err(SendError::Invalid(error)) => {
                self.record_final_failure(&state, &payload, &hash, &error)
                    .await;
                JobOutcome::Abandon { error }
            }
            Err(SendError::Transient(error)) => {
                // The terminal bookkeeping must land before the dispatcher
                // parks the job, so the attempt check lives here too.
                if job.attempts >= JobKind::SendEmail.max_attempts() {
                    self.record_final_failure(&state, &payload, &hash, &error)
                        .await;
                    JobOutcome::Abandon { error }
                } else {
                    JobOutcome::Defer { error, delay: None }
                }
            }
        }
    }
}

impl SendEmailJob {
    async fn send(
        &self,
        state: &AppState,
        payload: &SendEmailPayload,
        hash: &str,
    ) -> Result<(), SendError> {
        let (sequence, step, contact, user, row) = self.load_context(state, payload)?;

        let mut mailbox = match state.mailboxes.mailbox_for(user.id).await {
            Ok(mailbox) => mailbox,
            Err(GmailError::TokenExpired) => state
                .mailboxes
                .force_refresh(user.id)
                .await
                .map_err(SendError::transient)?,
            Err(err) => return Err(SendError::transient(err)),
        };

        // Threading headers come from the live thread so References stays
        // complete even when earlier sends happened elsewhere.
        let thread_ref = row.thread_id.clone().or_else(|| payload.thread_id.clone());
        let mut in_reply_to = None;
        let mut references = None;
        let mut subject = payload.subject.clone();
        if let Some(thread_id) = &thread_ref {
            match mailbox.get_thread(thread_id).await {
                Ok(thread) => {
                    let ids: Vec<String> = thread
                        .messages
                        .iter()
                        .filter_map(|message| message.header("Message-ID"))
                        .map(|value| value.to_string())
                        .collect();
                    in_reply_to = ids.last().cloned();
                    if !ids.is_empty() {
                        references = Some(ids.join(" "));
                    }
                    if step.reply_to_thread {
                        if let Some(first_subject) = thread
                            .messages
                            .first()
                            .and_then(|message| message.header("Subject"))
                        {
                            subject = mime::reply_subject(first_subject);
                        }
                    }
                }
                Err(GmailError::Api { status: 404, .. }) => {
                    warn!(thread_id = %thread_id, "thread vanished, sending without threading headers");
                }
                Err(err) => return Err(SendError::transient(err)),
            }
        }

        let values = template::contact_values(&contact);
        let original_html = template::render(step.content.as_deref().unwrap_or(""), &values);
        let subject = template::render(&subject, &values);
        let (tracked_html, links) =
            instrument_html(&original_html, &state.config.track_api_url, hash);

        let domain = user.email.split('@').nth(1).unwrap_or("mail.cadence.local");
        let message_id = mime::generate_message_id(domain);

        let to = if (payload.test_mode || sequence.test_mode) && state.config.test_email.is_some()
        {
            state.config.test_email.clone().unwrap_or_default()
        } else {
            payload.to.clone()
        };

        let outgoing = OutgoingMessage {
            to,
            subject,
            html: tracked_html.clone(),
            message_id: message_id.clone(),
            in_reply_to,
            references,
        };
        let raw = mime::encode_raw(&outgoing);

        let tracking =
            self.prepare_tracking(state, payload, &user, hash, &links)
                .map_err(SendError::transient)?;

        let outcome = match mailbox.send_message(&raw, thread_ref.as_deref()).await {
            Ok(outcome) => outcome,
            Err(GmailError::TokenExpired) => {
                mailbox = state
                    .mailboxes
                    .force_refresh(user.id)
                    .await
                    .map_err(|_| SendError::Transient("TOKEN_EXPIRED".to_string()))?;
                mailbox
                    .send_message(&raw, thread_ref.as_deref())
                    .await
                    .map_err(SendError::transient)?
            }
            Err(err) => return Err(SendError::transient(err)),
        };

        let canonical_id = self
            .canonical_message_id(mailbox.as_ref(), &outcome.id)
            .await
            .unwrap_or(message_id);

        let thread_created = self
            .record_send(
                state,
                payload,
                &user,
                &tracking,
                &canonical_id,
                &outcome.thread_id,
            )
            .map_err(SendError::transient)?;

        self.rewrite_sent_copy(
            mailbox.as_ref(),
            &outcome.id,
            &outcome.thread_id,
            &tracked_html,
            &original_html,
        )
        .await;

        if thread_created {
            if let Ok(mut conn) = state.db() {
                let enqueue = jobs::push(
                    &mut conn,
                    JobKind::WatchThread,
                    json!({
                        "user_id": payload.user_id,
                        "thread_id": outcome.thread_id,
                        "checks_left": WATCH_THREAD_CHECKS,
                    }),
                    Some(
                        (Utc::now() + chrono::Duration::minutes(WATCH_THREAD_DELAY_MINUTES))
                            .naive_utc(),
                    ),
                );
                if let Err(err) = enqueue {
                    warn!(error = %err, "failed to enqueue thread watch");
                }
            }
        }

        info!(
            sequence_id = %payload.sequence_id,
            contact_id = %payload.contact_id,
            message_id = %canonical_id,
            thread_id = %outcome.thread_id,
            "email sent"
        );
        Ok(())
    }

    fn load_context(
        &self,
        state: &AppState,
        payload: &SendEmailPayload,
    ) -> Result<(Sequence, SequenceStep, Contact, User, SequenceContact), SendError> {
        let mut conn = state.db().map_err(|err| SendError::transient(format!("{err:?}")))?;

        let sequence = sequences::table
            .find(payload.sequence_id)
            .first::<Sequence>(&mut conn)
            .optional()
            .map_err(SendError::transient)?
            .ok_or_else(|| SendError::Skip("sequence deleted".to_string()))?;

        let step = sequence_steps::table
            .find(payload.step_id)
            .first::<SequenceStep>(&mut conn)
            .optional()
            .map_err(SendError::transient)?
            .ok_or_else(|| SendError::Invalid("step deleted".to_string()))?;

        let contact = crate::schema::contacts::table
            .find(payload.contact_id)
            .first::<Contact>(&mut conn)
            .optional()
            .map_err(SendError::transient)?
            .ok_or_else(|| SendError::Skip("contact deleted".to_string()))?;

        let user = users::table
            .find(payload.user_id)
            .first::<User>(&mut conn)
            .optional()
            .map_err(SendError::transient)?
            .ok_or_else(|| SendError::Invalid("user missing".to_string()))?;

        let row = sequence_contacts::table
            .filter(sequence_contacts::sequence_id.eq(payload.sequence_id))
            .filter(sequence_contacts::contact_id.eq(payload.contact_id))
            .first::<SequenceContact>(&mut conn)
            .optional()
            .map_err(SendError::transient)?
            .ok_or_else(|| SendError::Skip("progress row deleted".to_string()))?;

        // A reply, bounce, or opt-out that raced this job wins. Completed
        // rows are NOT skipped: the final step's send is still in flight
        // when the sweeper marks the row complete.
        if [
            contact_status::REPLIED,
            contact_status::BOUNCED,
            contact_status::OPTED_OUT,
        ]
        .contains(&row.status.as_str())
        {
            return Err(SendError::Skip(format!("contact status is {}", row.status)));
        }

        Ok((sequence, step, contact, user, row))
    }

    /// Upsert the tracking row for this job's hash and (re)attach its
    /// link rows, so a redelivered job doesn't duplicate bookkeeping.
    fn prepare_tracking(
        &self,
        state: &AppState,
        payload: &SendEmailPayload,
        user: &User,
        hash: &str,
        links: &[RewrittenLink],
    ) -> anyhow::Result<EmailTracking> {
        let mut conn = state.db().map_err(|err| anyhow::anyhow!("{err:?}"))?;

        let metadata = serde_json::to_value(TrackingMetadata {
            email: payload.to.clone(),
            user_id: payload.user_id,
            sequence_id: payload.sequence_id,
            step_id: payload.step_id,
            contact_id: payload.contact_id,
        })?;

        diesel::insert_into(email_tracking::table)
            .values(&NewEmailTracking {
                id: Uuid::new_v4(),
                user_id: user.id,
                hash: hash.to_string(),
                message_id: None,
                thread_id: None,
                status: tracking_status::PENDING.to_string(),
                sent_at: None,
                metadata,
            })
            .on_conflict(email_tracking::hash)
            .do_nothing()
            .execute(&mut conn)?;

        let tracking = email_tracking::table
            .filter(email_tracking::hash.eq(hash))
            .first::<EmailTracking>(&mut conn)?;

        diesel::delete(
            tracked_links::table.filter(tracked_links::email_tracking_id.eq(tracking.id)),
        )
        .execute(&mut conn)?;
        for link in links {
            diesel::insert_into(tracked_links::table)
                .values(&NewTrackedLink {
                    id: link.id,
                    email_tracking_id: tracking.id,
                    original_url: link.original_url.clone(),
                })
                .execute(&mut conn)?;
        }

        Ok(tracking)
    }

    /// Gmail's send response carries its internal id; the RFC 5322
    /// Message-ID appears once the message is indexed.
    async fn canonical_message_id(&self, mailbox: &dyn Mailbox, sent_id: &str) -> Option<String> {
        for attempt in 0..SENT_REWRITE_ATTEMPTS {
            match mailbox.get_message(sent_id).await {
                Ok(summary) => {
                    if let Some(message_id) = summary.header("Message-ID") {
                        return Some(message_id.to_string());
                    }
                }
                Err(err) => {
                    warn!(sent_id, attempt, error = %err, "could not fetch sent message");
                }
            }
            tokio::time::sleep(SENT_REWRITE_DELAY).await;
        }
        None
    }

    fn record_send(
        &self,
        state: &AppState,
        payload: &SendEmailPayload,
        user: &User,
        tracking: &EmailTracking,
        canonical_id: &str,
        thread_id: &str,
    ) -> anyhow::Result<bool> {
        let mut conn = state.db().map_err(|err| anyhow::anyhow!("{err:?}"))?;
        let now = Utc::now().naive_utc();

        diesel::update(email_tracking::table.find(tracking.id))
            .set((
                email_tracking::message_id.eq(Some(canonical_id.to_string())),
                email_tracking::thread_id.eq(Some(thread_id.to_string())),
                email_tracking::status.eq(tracking_status::SENT),
                email_tracking::sent_at.eq(Some(now)),
            ))
            .execute(&mut conn)?;

        let thread_created = diesel::insert_into(email_threads::table)
            .values(&NewEmailThread {
                id: Uuid::new_v4(),
                user_id: user.id,
                sequence_id: payload.sequence_id,
                contact_id: payload.contact_id,
                thread_id: thread_id.to_string(),
                first_message_id: Some(canonical_id.to_string()),
            })
            .on_conflict((email_threads::user_id, email_threads::thread_id))
            .do_nothing()
            .execute(&mut conn)?
            == 1;

        let pair = sequence_contacts::table
            .filter(sequence_contacts::sequence_id.eq(payload.sequence_id))
            .filter(sequence_contacts::contact_id.eq(payload.contact_id));

        diesel::update(pair.clone().filter(sequence_contacts::thread_id.is_null()))
            .set(sequence_contacts::thread_id.eq(thread_id))
            .execute(&mut conn)?;
        diesel::update(pair.clone().filter(sequence_contacts::started_at.is_null()))
            .set(sequence_contacts::started_at.eq(now))
            .execute(&mut conn)?;
        diesel::update(pair.filter(sequence_contacts::status.ne_all(vec![
            contact_status::COMPLETED,
            contact_status::REPLIED,
            contact_status::BOUNCED,
            contact_status::OPTED_OUT,
        ])))
        .set((
            sequence_contacts::status.eq(contact_status::SENT),
            sequence_contacts::last_processed_at.eq(now),
            sequence_contacts::updated_at.eq(now),
        ))
        .execute(&mut conn)?;

        events::record_event(&mut conn, tracking.id, event_type::SENT, None)?;
        events::stats_on_sent(&mut conn, payload.sequence_id)?;
        events::mark_sequence_healthy(&mut conn, payload.sequence_id)?;

        Ok(thread_created)
    }

    /// Replace the sender's copy with untracked content: fetch the
    /// just-sent message, swap the tracked body back, re-insert into the
    /// SENT folder, delete the original. Gmail indexing lags, so the
    /// fetch retries briefly; giving up entirely is non-fatal.
    async fn rewrite_sent_copy(
        &self,
        mailbox: &dyn Mailbox,
        sent_id: &str,
        thread_id: &str,
        tracked_html: &str,
        original_html: &str,
    ) {
        tokio::time::sleep(SENT_REWRITE_DELAY).await;

        let mut fetched = None;
        for _ in 0..SENT_REWRITE_ATTEMPTS {
            match mailbox.get_message_raw(sent_id).await {
                Ok(raw) => {
                    fetched = Some(raw);
                    break;
                }
                Err(_) => tokio::time::sleep(SENT_REWRITE_DELAY).await,
            }
        }
        let Some(raw) = fetched else {
            warn!(sent_id, "sent-folder rewrite skipped: message not yet indexed");
            return;
        };

        let Some(decoded) = mime::decode_raw(&raw) else {
            warn!(sent_id, "sent-folder rewrite skipped: raw message undecodable");
            return;
        };
        let replaced = decoded.replace(tracked_html, original_html);
        if replaced == decoded {
            warn!(sent_id, "sent-folder rewrite skipped: tracked body not found");
            return;
        }

        let untracked = mime::encode_raw_str(&replaced);
        match mailbox
            .insert_message(&untracked, Some(thread_id), &["SENT"])
            .await
        {
            Ok(_) => {
                if let Err(err) = mailbox.delete_message(sent_id).await {
                    warn!(sent_id, error = %err, "failed to delete tracked sent copy");
                }
            }
            Err(err) => warn!(sent_id, error = %err, "failed to insert untracked sent copy"),
        }
    }

    async fn record_final_failure(
        &self,
        state: &AppState,
        payload: &SendEmailPayload,
        hash: &str,
        error: &str,
    ) {
        let Ok(mut conn) = state.db() else {
            return;
        };

        let tracking = email_tracking::table
            .filter(email_tracking::hash.eq(hash))
            .first::<EmailTracking>(&mut conn)
            .optional()
            .ok()
            .flatten();
        if let Some(tracking) = tracking {
            let _ = events::record_event(
                &mut conn,
                tracking.id,
                event_type::FAILED,
                Some(json!({ "error": error })),
            );
        }

        let _ = diesel::update(
            sequence_contacts::table
                .filter(sequence_contacts::sequence_id.eq(payload.sequence_id))
                .filter(sequence_contacts::contact_id.eq(payload.contact_id))
                .filter(sequence_contacts::status.ne_all(vec![
                    contact_status::COMPLETED,
                    contact_status::REPLIED,
                    contact_status::OPTED_OUT,
                ])),
        )
        .set((
            sequence_contacts::status.eq(contact_status::FAILED),
            sequence_contacts::updated_at.eq(Utc::now().naive_utc()),
        ))
        .execute(&mut conn);

        let _ = events::record_sequence_error(&mut conn, payload.sequence_id, error);
        drop(conn);

        if let Err(err) = state.limiter.start_error_cooldown(payload.user_id).await {
            warn!(error = %err, "failed to arm error cooldown");
        }
    }
}
