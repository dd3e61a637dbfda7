use chrono::Utc;
use diesel::pg::PgConnection;
use diesel::prelude::*;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::models::{
    event_type, health_status, EmailTracking, NewEmailEvent, NewSequenceHealth, NewSequenceStats,
    SequenceStats, TrackedLink,
};
use crate::schema::{
    email_events, email_tracking, link_clicks, sequence_health, sequence_stats, tracked_links,
};

/// Weak back-references carried on every tracking row.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TrackingMetadata {
    pub email: String,
    pub user_id: Uuid,
    pub sequence_id: Uuid,
    pub step_id: Uuid,
    pub contact_id: Uuid,
}

impl TrackingMetadata {
    pub fn from_value(value: &serde_json::Value) -> Option<Self> {
        serde_json::from_value(value.clone()).ok()
    }
}

pub fn record_event(
    conn: &mut PgConnection,
    tracking_id: Uuid,
    kind: &str,
    metadata: Option<serde_json::Value>,
) -> QueryResult<()> {
    diesel::insert_into(email_events::table)
        .values(&NewEmailEvent {
            id: Uuid::new_v4(),
            email_tracking_id: tracking_id,
            event_type: kind.to_string(),
            reply_message_id: None,
            metadata,
        })
        .execute(conn)?;
    Ok(())
}

/// Append an event unless one with the same (tracking, type, source
/// message) already exists. Returns whether a row was written.
pub fn record_event_once(
    conn: &mut PgConnection,
    tracking_id: Uuid,
    kind: &str,
    reply_message_id: Option<&str>,
) -> QueryResult<bool> {
    let existing: i64 = match reply_message_id {
        Some(source) => email_events::table
            .filter(email_events::email_tracking_id.eq(tracking_id))
            .filter(email_events::event_type.eq(kind))
            .filter(email_events::reply_message_id.eq(source))
            .count()
            .get_result(conn)?,
        None => email_events::table
            .filter(email_events::email_tracking_id.eq(tracking_id))
            .filter(email_events::event_type.eq(kind))
            .count()
            .get_result(conn)?,
    };
    if existing > 0 {
        return Ok(false);
    }

    diesel::insert_into(email_events::table)
        .values(&NewEmailEvent {
            id: Uuid::new_v4(),
            email_tracking_id: tracking_id,
            event_type: kind.to_string(),
            reply_message_id: reply_message_id.map(|s| s.to_string()),
            metadata: None,
        })
        .execute(conn)?;
    Ok(true)
}

pub fn has_event(conn: &mut PgConnection, tracking_id: Uuid, kind: &str) -> QueryResult<bool> {
    let count: i64 = email_events::table
        .filter(email_events::email_tracking_id.eq(tracking_id))
        .filter(email_events::event_type.eq(kind))
        .count()
        .get_result(conn)?;
    Ok(count > 0)
}

fn sequence_stats_row(conn: &mut PgConnection, sequence_id: Uuid) -> QueryResult<SequenceStats> {
    let existing = sequence_stats::table
        .filter(sequence_stats::sequence_id.eq(sequence_id))
        .filter(sequence_stats::contact_id.is_null())
        .first::<SequenceStats>(conn)
        .optional()?;
    if let Some(row) = existing {
        return Ok(row);
    }

    let row = NewSequenceStats {
        id: Uuid::new_v4(),
        sequence_id,
        contact_id: None,
    };
    diesel::insert_into(sequence_stats::table)
        .values(&row)
        .on_conflict_do_nothing()
        .execute(conn)?;
    sequence_stats::table
        .filter(sequence_stats::sequence_id.eq(sequence_id))
        .filter(sequence_stats::contact_id.is_null())
        .first(conn)
}

fn recompute_rates(conn: &mut PgConnection, stats_id: Uuid) -> QueryResult<()> {
    let row: SequenceStats = sequence_stats::table.find(stats_id).first(conn)?;
    let sent = row.sent_emails.max(0) as f64;
    let (open_rate, click_rate, reply_rate) = if sent > 0.0 {
        (
            f64::from(row.unique_opens) / sent,
            f64::from(row.clicked_emails) / sent,
            f64::from(row.replied_emails) / sent,
        )
    } else {
        (0.0, 0.0, 0.0)
    };
    diesel::update(sequence_stats::table.find(stats_id))
        .set((
            sequence_stats::open_rate.eq(open_rate),
            sequence_stats::click_rate.eq(click_rate),
            sequence_stats::reply_rate.eq(reply_rate),
            sequence_stats::updated_at.eq(Utc::now().naive_utc()),
        ))
        .execute(conn)?;
    Ok(())
}

pub fn stats_on_sent(conn: &mut PgConnection, sequence_id: Uuid) -> QueryResult<()> {
    let row = sequence_stats_row(conn, sequence_id)?;
    diesel::update(sequence_stats::table.find(row.id))
        .set((
            sequence_stats::sent_emails.eq(sequence_stats::sent_emails + 1),
            sequence_stats::people_contacted.eq(sequence_stats::people_contacted + 1),
        ))
        .execute(conn)?;
    recompute_rates(conn, row.id)
}

pub fn stats_on_open(conn: &mut PgConnection, sequence_id: Uuid, first_open: bool) -> QueryResult<()> {
    let row = sequence_stats_row(conn, sequence_id)?;
    diesel::update(sequence_stats::table.find(row.id))
        .set(sequence_stats::opened_emails.eq(sequence_stats::opened_emails + 1))
        .execute(conn)?;
    if first_open {
        diesel::update(sequence_stats::table.find(row.id))
            .set(sequence_stats::unique_opens.eq(sequence_stats::unique_opens + 1))
            .execute(conn)?;
    }
    recompute_rates(conn, row.id)
}

pub fn stats_on_click(conn: &mut PgConnection, sequence_id: Uuid) -> QueryResult<()> {
    let row = sequence_stats_row(conn, sequence_id)?;
    diesel::update(sequence_stats::table.find(row.id))
        .set(sequence_stats::clicked_emails.eq(sequence_stats::clicked_emails + 1))
        .execute(conn)?;
    recompute_rates(conn, row.id)
}

pub fn stats_on_reply(conn: &mut PgConnection, sequence_id: Uuid) -> QueryResult<()> {
    let row = sequence_stats_row(conn, sequence_id)?;
    diesel::update(sequence_stats::table.find(row.id))
        .set(sequence_stats::replied_emails.eq(sequence_stats::replied_emails + 1))
        .execute(conn)?;
    recompute_rates(conn, row.id)
}

pub fn stats_on_bounce(conn: &mut PgConnection, sequence_id: Uuid) -> QueryResult<()> {
    let row = sequence_stats_row(conn, sequence_id)?;
    diesel::update(sequence_stats::table.find(row.id))
        .set(sequence_stats::bounced_emails.eq(sequence_stats::bounced_emails + 1))
        .execute(conn)?;
    recompute_rates(conn, row.id)
}

pub fn record_sequence_error(
    conn: &mut PgConnection,
    sequence_id: Uuid,
    error: &str,
) -> QueryResult<()> {
    let existing = sequence_health::table
        .filter(sequence_health::sequence_id.eq(sequence_id))
        .first::<crate::models::SequenceHealth>(conn)
        .optional()?;

    let row = match existing {
        Some(row) => row,
        None => {
            diesel::insert_into(sequence_health::table)
                .values(&NewSequenceHealth {
                    id: Uuid::new_v4(),
                    sequence_id,
                    status: health_status::HEALTHY.to_string(),
                })
                .on_conflict_do_nothing()
                .execute(conn)?;
            sequence_health::table
                .filter(sequence_health::sequence_id.eq(sequence_id))
                .first(conn)?
        }
    };

    let error_count = row.error_count + 1;
    let status = if error_count >= 3 {
        health_status::ERROR
    } else {
        health_status::WARNING
    };
    diesel::update(sequence_health::table.find(row.id))
        .set((
            sequence_health::error_count.eq(error_count),
            sequence_health::status.eq(status),
            sequence_health::last_error.eq(Some(error.to_string())),
            sequence_health::updated_at.eq(Utc::now().naive_utc()),
        ))
        .execute(conn)?;
    Ok(())
}

pub fn mark_sequence_healthy(conn: &mut PgConnection, sequence_id: Uuid) -> QueryResult<()> {
    diesel::update(
        sequence_health::table.filter(sequence_health::sequence_id.eq(sequence_id)),
    )
    .set((
        sequence_health::status.eq(health_status::HEALTHY),
        sequence_health::updated_at.eq(Utc::now().naive_utc()),
    ))
    .execute(conn)?;
    Ok(())
}

/// Count an open for the pixel endpoint. Returns the refreshed tracking
/// row and whether this was the first open; `opened_at` is only written
/// by the conditional update, so concurrent opens stay unique.
pub fn register_open(
    conn: &mut PgConnection,
    hash: &str,
) -> QueryResult<Option<(EmailTracking, bool)>> {
    let tracking = email_tracking::table
        .filter(email_tracking::hash.eq(hash))
        .first::<EmailTracking>(conn)
        .optional()?;
    let Some(tracking) = tracking else {
        return Ok(None);
    };

    diesel::update(email_tracking::table.find(tracking.id))
        .set(email_tracking::open_count.eq(email_tracking::open_count + 1))
        .execute(conn)?;

    let first_open = diesel::update(
        email_tracking::table
            .find(tracking.id)
            .filter(email_tracking::opened_at.is_null()),
    )
    .set(email_tracking::opened_at.eq(Utc::now().naive_utc()))
    .execute(conn)?
        == 1;

    record_event(conn, tracking.id, event_type::OPENED, None)?;
    if let Some(metadata) = TrackingMetadata::from_value(&tracking.metadata) {
        stats_on_open(conn, metadata.sequence_id, first_open)?;
    }

    let refreshed = email_tracking::table.find(tracking.id).first(conn)?;
    Ok(Some((refreshed, first_open)))
}

/// Count a click-through. Returns the link (with its original URL) when
/// `link_id` belongs to the tracking row named by `hash`.
pub fn register_click(
    conn: &mut PgConnection,
    hash: &str,
    link_id: Uuid,
) -> QueryResult<Option<TrackedLink>> {
    let tracking = email_tracking::table
        .filter(email_tracking::hash.eq(hash))
        .first::<EmailTracking>(conn)
        .optional()?;
    let Some(tracking) = tracking else {
        return Ok(None);
    };

    let link = tracked_links::table
        .find(link_id)
        .filter(tracked_links::email_tracking_id.eq(tracking.id))
        .first::<TrackedLink>(conn)
        .optional()?;
    let Some(link) = link else {
        return Ok(None);
    };

    diesel::insert_into(link_clicks::table)
        .values(&crate::models::NewLinkClick {
            id: Uuid::new_v4(),
            tracked_link_id: link.id,
        })
        .execute(conn)?;
    diesel::update(tracked_links::table.find(link.id))
        .set(tracked_links::click_count.eq(tracked_links::click_count + 1))
        .execute(conn)?;
    diesel::update(
        email_tracking::table
            .find(tracking.id)
            .filter(email_tracking::clicked_at.is_null()),
    )
    .set(email_tracking::clicked_at.eq(Utc::now().naive_utc()))
    .execute(conn)?;

    record_event(conn, tracking.id, event_type::CLICKED, None)?;
    if let Some(metadata) = TrackingMetadata::from_value(&tracking.metadata) {
        stats_on_click(conn, metadata.sequence_id)?;
    }

    Ok(Some(link))
}
