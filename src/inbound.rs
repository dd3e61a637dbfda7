use anyhow::{anyhow, Context, Result};
use base64::engine::general_purpose::{STANDARD, URL_SAFE_NO_PAD};
use base64::Engine;
use chrono::Utc;
use diesel::pg::PgConnection;
use diesel::prelude::*;
use jsonwebtoken::{decode, DecodingKey, Validation};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::events::{self, TrackingMetadata};
use crate::gmail::{GmailError, MessageSummary};
use crate::models::{contact_status, event_type, tracking_status, EmailThread, EmailTracking, User};
use crate::schema::{email_threads, email_tracking, google_accounts, sequence_contacts, users};
use crate::state::AppState;

/// Validates the bearer JWT on push requests: signature plus audience.
#[derive(Clone)]
pub struct PushVerifier {
    decoding: DecodingKey,
    audience: String,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct PushClaims {
    pub aud: String,
    pub iss: String,
    pub exp: usize,
    #[serde(default)]
    pub email: Option<String>,
}

impl PushVerifier {
    pub fn new(secret: &str, audience: impl Into<String>) -> Self {
        Self {
            decoding: DecodingKey::from_secret(secret.as_bytes()),
            audience: audience.into(),
        }
    }

    pub fn verify(&self, token: &str) -> Result<PushClaims, jsonwebtoken::errors::Error> {
        let mut validation = Validation::default();
        validation.set_audience(&[self.audience.clone()]);
        let data = decode::<PushClaims>(token, &self.decoding, &validation)?;
        Ok(data.claims)
    }
}

#[derive(Debug, Deserialize)]
pub struct PushEnvelope {
    pub message: PushMessage,
}

#[derive(Debug, Deserialize)]
pub struct PushMessage {
    pub data: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct PushPayload {
    email_address: String,
    history_id: serde_json::Value,
}

/// Decode the base64 Pub/Sub payload into (email address, history id).
pub fn decode_push(envelope: &PushEnvelope) -> Result<(String, u64)> {
    let bytes = STANDARD
        .decode(&envelope.message.data)
        .or_else(|_| URL_SAFE_NO_PAD.decode(&envelope.message.data))
        .context("push data is not valid base64")?;
    let payload: PushPayload =
        serde_json::from_slice(&bytes).context("push data is not valid JSON")?;

    let history_id = match &payload.history_id {
        serde_json::Value::Number(number) => number.as_u64(),
        serde_json::Value::String(raw) => raw.parse().ok(),
        _ => None,
    }
    .ok_or_else(|| anyhow!("historyId is not a number"))?;

    Ok((payload.email_address, history_id))
}

/// Classification inputs extracted from one Gmail message.
#[derive(Debug, Clone, Default)]
pub struct MessageFacts {
    pub id: String,
    pub thread_id: String,
    pub message_id_header: Option<String>,
    pub from: Option<String>,
    pub label_ids: Vec<String>,
    pub references: Vec<String>,
    pub in_reply_to: Option<String>,
    pub content_type: Option<String>,
    pub failed_recipients: Option<String>,
}

impl From<&MessageSummary> for MessageFacts {
    fn from(summary: &MessageSummary) -> Self {
        MessageFacts {
            id: summary.id.clone(),
            thread_id: summary.thread_id.clone(),
            message_id_header: summary.header("Message-ID").map(|s| s.to_string()),
            from: summary.header("From").map(|s| s.to_string()),
            label_ids: summary.label_ids.clone(),
            references: summary
                .header("References")
                .map(parse_message_ids)
                .unwrap_or_default(),
            in_reply_to: summary.header("In-Reply-To").map(|s| s.to_string()),
            content_type: summary.header("Content-Type").map(|s| s.to_string()),
            failed_recipients: summary.header("X-Failed-Recipients").map(|s| s.to_string()),
        }
    }
}

/// Split a References header into its `<...>` message ids.
pub fn parse_message_ids(header: &str) -> Vec<String> {
    header
        .split_whitespace()
        .filter(|token| token.starts_with('<') && token.ends_with('>'))
        .map(|token| token.to_string())
        .collect()
}

/// The bare address inside `Name <addr>` or the trimmed input.
pub fn address_of(from: &str) -> String {
    match (from.find('<'), from.find('>')) {
        (Some(start), Some(end)) if end > start => from[start + 1..end].trim().to_lowercase(),
        _ => from.trim().to_lowercase(),
    }
}

/// Delivery-failure heuristics: bounce headers, delivery-status reports,
/// or a Mailer-Daemon sender.
pub fn is_bounce(facts: &MessageFacts) -> bool {
    if facts.failed_recipients.is_some() {
        return true;
    }
    if let Some(content_type) = &facts.content_type {
        if content_type
            .to_ascii_lowercase()
            .starts_with("multipart/report")
        {
            return true;
        }
    }
    if let Some(from) = &facts.from {
        let from = from.to_ascii_lowercase();
        if from.contains("mailer-daemon") || from.contains("postmaster") {
            return true;
        }
    }
    false
}

/// Early-return rules for reply classification: the owner's own mail
/// never counts as a reply.
pub fn is_own_message(facts: &MessageFacts, owner_email: &str) -> bool {
    if facts
        .label_ids
        .iter()
        .any(|label| label == "DRAFT" || label == "SENT")
    {
        return true;
    }
    match &facts.from {
        Some(from) => address_of(from) == owner_email.to_lowercase(),
        None => false,
    }
}

/// All message ids a reply could reference.
pub fn referenced_ids(facts: &MessageFacts) -> Vec<String> {
    let mut ids = facts.references.clone();
    if let Some(in_reply_to) = &facts.in_reply_to {
        for id in parse_message_ids(in_reply_to) {
            if !ids.contains(&id) {
                ids.push(id);
            }
        }
    }
    ids
}

#[derive(Debug, Default, PartialEq, Eq)]
pub struct PushOutcome {
    pub opens: usize,
    pub replies: usize,
    pub bounces: usize,
}

/// Walk Gmail history from the last stored cursor and classify each new
/// message. Duplicate pushes are harmless: every transition below is
/// guarded or keyed by the source message id.
pub async fn process_notification(
    state: &AppState,
    email_address: &str,
    incoming_history_id: u64,
) -> Result<Option<PushOutcome>> {
    let user = {
        let mut conn = state.db().map_err(|err| anyhow!("{err:?}"))?;
        users::table
            .filter(users::email.eq(email_address))
            .first::<User>(&mut conn)
            .optional()?
    };
    let Some(user) = user else {
        return Ok(None);
    };

    let start_history_id = {
        let mut conn = state.db().map_err(|err| anyhow!("{err:?}"))?;
        google_accounts::table
            .filter(google_accounts::user_id.eq(user.id))
            .select(google_accounts::history_id)
            .first::<Option<i64>>(&mut conn)
            .optional()?
            .flatten()
            .map(|stored| stored as u64)
            .unwrap_or(incoming_history_id)
    };

    let mailbox = match state.mailboxes.mailbox_for(user.id).await {
        Ok(mailbox) => mailbox,
        Err(GmailError::TokenExpired) => state.mailboxes.force_refresh(user.id).await?,
        Err(err) => return Err(err.into()),
    };

    let page = mailbox.list_history(start_history_id).await?;
    let mut outcome = PushOutcome::default();

    for message_id in &page.message_ids {
        let summary = match mailbox.get_message(message_id).await {
            Ok(summary) => summary,
            Err(err) => {
                debug!(message_id = %message_id, error = %err, "skipping unreadable history message");
                continue;
            }
        };
        let facts = MessageFacts::from(&summary);

        let mut conn = state.db().map_err(|err| anyhow!("{err:?}"))?;
        match apply_message(&mut conn, &facts, &user) {
            Ok(AppliedEvent::Open) => outcome.opens += 1,
            Ok(AppliedEvent::Reply { .. }) => outcome.replies += 1,
            Ok(AppliedEvent::Bounce { contact_id }) => {
                outcome.bounces += 1;
                drop(conn);
                if let Err(err) = state.limiter.start_bounce_cooldown(contact_id).await {
                    warn!(error = %err, "failed to arm bounce cooldown");
                }
            }
            Ok(AppliedEvent::None) => {}
            Err(err) => warn!(message_id = %message_id, error = %err, "failed to classify message"),
        }
    }

    let latest = page.history_id.unwrap_or(incoming_history_id);
    {
        let mut conn = state.db().map_err(|err| anyhow!("{err:?}"))?;
        diesel::update(google_accounts::table.filter(google_accounts::user_id.eq(user.id)))
            .set((
                google_accounts::history_id.eq(latest as i64),
                google_accounts::updated_at.eq(Utc::now().naive_utc()),
            ))
            .execute(&mut conn)?;
    }

    info!(
        user_id = %user.id,
        opens = outcome.opens,
        replies = outcome.replies,
        bounces = outcome.bounces,
        "processed gmail push notification"
    );
    Ok(Some(outcome))
}

#[derive(Debug)]
pub enum AppliedEvent {
    None,
    Open,
    Reply { contact_id: Uuid },
    Bounce { contact_id: Uuid },
}

/// Classify one message and persist whatever event it represents.
/// Shared by the push pipeline and the thread-watch fallback poller.
pub fn apply_message(
    conn: &mut PgConnection,
    facts: &MessageFacts,
    user: &User,
) -> Result<AppliedEvent> {
    if is_bounce(facts) {
        if let Some(contact_id) = record_bounce(conn, facts, user)? {
            return Ok(AppliedEvent::Bounce { contact_id });
        }
        return Ok(AppliedEvent::None);
    }

    // Secondary open signal: the last referenced id is the message the
    // recipient's client loaded when composing.
    let mut opened = false;
    if let Some(last_reference) = facts.references.last() {
        opened = record_reference_open(conn, facts, user, last_reference)?;
    }

    if !is_own_message(facts, &user.email) {
        if let Some(contact_id) = record_reply(conn, facts, user)? {
            return Ok(AppliedEvent::Reply { contact_id });
        }
    }

    if opened {
        return Ok(AppliedEvent::Open);
    }
    Ok(AppliedEvent::None)
}

fn record_reference_open(
    conn: &mut PgConnection,
    facts: &MessageFacts,
    user: &User,
    referenced: &str,
) -> Result<bool> {
    let tracking = email_tracking::table
        .filter(email_tracking::user_id.eq(user.id))
        .filter(email_tracking::message_id.eq(referenced))
        .first::<EmailTracking>(conn)
        .optional()?;
    let Some(tracking) = tracking else {
        return Ok(false);
    };
    let written = events::record_event_once(
        conn,
        tracking.id,
        event_type::OPENED,
        facts.message_id_header.as_deref().or(Some(facts.id.as_str())),
    )?;
    Ok(written)
}

fn record_reply(
    conn: &mut PgConnection,
    facts: &MessageFacts,
    user: &User,
) -> Result<Option<Uuid>> {
    // Thread-based matching wins; fall back to References / In-Reply-To.
    let tracking = match thread_tracking(conn, facts, user)? {
        Some(tracking) => Some(tracking),
        None => reference_tracking(conn, facts, user)?,
    };
    let Some(tracking) = tracking else {
        return Ok(None);
    };

    let source = facts
        .message_id_header
        .as_deref()
        .or(Some(facts.id.as_str()));
    if events::has_event(conn, tracking.id, event_type::REPLIED)? {
        return Ok(None);
    }
    if !events::record_event_once(conn, tracking.id, event_type::REPLIED, source)? {
        return Ok(None);
    }

    let Some(metadata) = TrackingMetadata::from_value(&tracking.metadata) else {
        return Ok(None);
    };
    events::stats_on_reply(conn, metadata.sequence_id)?;
    transition_contact(
        conn,
        metadata.sequence_id,
        metadata.contact_id,
        contact_status::REPLIED,
    )?;
    Ok(Some(metadata.contact_id))
}

fn record_bounce(
    conn: &mut PgConnection,
    facts: &MessageFacts,
    user: &User,
) -> Result<Option<Uuid>> {
    let tracking = match thread_tracking(conn, facts, user)? {
        Some(tracking) => Some(tracking),
        None => reference_tracking(conn, facts, user)?,
    };
    let Some(tracking) = tracking else {
        return Ok(None);
    };

    if events::has_event(conn, tracking.id, event_type::BOUNCED)? {
        return Ok(None);
    }
    events::record_event_once(conn, tracking.id, event_type::BOUNCED, Some(facts.id.as_str()))?;
    diesel::update(email_tracking::table.find(tracking.id))
        .set(email_tracking::status.eq(tracking_status::BOUNCED))
        .execute(conn)?;

    let Some(metadata) = TrackingMetadata::from_value(&tracking.metadata) else {
        return Ok(None);
    };
    events::stats_on_bounce(conn, metadata.sequence_id)?;
    transition_contact(
        conn,
        metadata.sequence_id,
        metadata.contact_id,
        contact_status::BOUNCED,
    )?;
    Ok(Some(metadata.contact_id))
}

/// Tracking row for the thread this message belongs to, via the
/// `email_threads` correlation table.
fn thread_tracking(
    conn: &mut PgConnection,
    facts: &MessageFacts,
    user: &User,
) -> Result<Option<EmailTracking>> {
    if facts.thread_id.is_empty() {
        return Ok(None);
    }
    let thread = email_threads::table
        .filter(email_threads::user_id.eq(user.id))
        .filter(email_threads::thread_id.eq(&facts.thread_id))
        .first::<EmailThread>(conn)
        .optional()?;
    if thread.is_none() {
        return Ok(None);
    }
    let tracking = email_tracking::table
        .filter(email_tracking::user_id.eq(user.id))
        .filter(email_tracking::thread_id.eq(&facts.thread_id))
        .order(email_tracking::created_at.desc())
        .first::<EmailTracking>(conn)
        .optional()?;
    Ok(tracking)
}

fn reference_tracking(
    conn: &mut PgConnection,
    facts: &MessageFacts,
    user: &User,
) -> Result<Option<EmailTracking>> {
    let ids = referenced_ids(facts);
    if ids.is_empty() {
        return Ok(None);
    }
    let tracking = email_tracking::table
        .filter(email_tracking::user_id.eq(user.id))
        .filter(email_tracking::message_id.eq_any(&ids))
        .first::<EmailTracking>(conn)
        .optional()?;
    Ok(tracking)
}

/// Guarded status transition: completed, replied, and opted-out rows are
/// never overwritten, and the schedule is cleared so the sweeper stops.
fn transition_contact(
    conn: &mut PgConnection,
    sequence_id: Uuid,
    contact_id: Uuid,
    status: &str,
) -> Result<()> {
    diesel::update(
        sequence_contacts::table
            .filter(sequence_contacts::sequence_id.eq(sequence_id))
            .filter(sequence_contacts::contact_id.eq(contact_id))
            .filter(sequence_contacts::status.ne_all(vec![
                contact_status::COMPLETED,
                contact_status::REPLIED,
                contact_status::OPTED_OUT,
            ])),
    )
    .set((
        sequence_contacts::status.eq(status),
        sequence_contacts::next_scheduled_at.eq::<Option<chrono::NaiveDateTime>>(None),
        sequence_contacts::updated_at.eq(Utc::now().naive_utc()),
    ))
    .execute(conn)?;
    Ok(())
}
