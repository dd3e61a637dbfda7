use axum::{
    extract::{Path, State},
    Json,
};
use chrono::Utc;
use diesel::dsl::sql;
use diesel::pg::PgConnection;
use diesel::prelude::*;
use diesel::sql_types::{Bool, Text};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::info;
use uuid::Uuid;

use crate::error::{AppError, AppResult};
use crate::jobs::{self, JobKind};
use crate::models::{contact_status, sequence_status, Sequence, SequenceContact};
use crate::schema::{
    email_threads, email_tracking, sequence_contacts, sequence_health, sequence_stats,
    sequence_steps, sequences,
};
use crate::state::AppState;

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SequenceActionRequest {
    pub user_id: Uuid,
    #[serde(default)]
    pub test_mode: Option<bool>,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
pub struct LaunchResponse {
    pub success: bool,
    pub job_id: Uuid,
    pub contact_count: i64,
    pub step_count: i64,
}

#[derive(Serialize)]
pub struct ActionResponse {
    pub success: bool,
}

fn owned_sequence(
    conn: &mut PgConnection,
    sequence_id: Uuid,
    user_id: Uuid,
) -> AppResult<Sequence> {
    sequences::table
        .find(sequence_id)
        .filter(sequences::user_id.eq(user_id))
        .first::<Sequence>(conn)
        .optional()?
        .ok_or_else(AppError::not_found)
}

fn active_contact_filter() -> Vec<&'static str> {
    vec![
        contact_status::COMPLETED,
        contact_status::OPTED_OUT,
        contact_status::REPLIED,
        contact_status::BOUNCED,
        contact_status::FAILED,
    ]
}

/// `POST /sequences/:id/launch`: validate, mark active, and hand the
/// fan-out to the queue. Returns immediately.
pub async fn launch(
    State(state): State<AppState>,
    Path(sequence_id): Path<Uuid>,
    Json(payload): Json<SequenceActionRequest>,
) -> AppResult<Json<LaunchResponse>> {
    let mut conn = state.db()?;
    let sequence = owned_sequence(&mut conn, sequence_id, payload.user_id)?;

    let step_count: i64 = sequence_steps::table
        .filter(sequence_steps::sequence_id.eq(sequence.id))
        .count()
        .get_result(&mut conn)?;
    if step_count == 0 {
        return Err(AppError::bad_request("sequence has no steps"));
    }

    let contact_count: i64 = sequence_contacts::table
        .filter(sequence_contacts::sequence_id.eq(sequence.id))
        .filter(sequence_contacts::status.ne_all(active_contact_filter()))
        .count()
        .get_result(&mut conn)?;
    if contact_count == 0 {
        return Err(AppError::bad_request("sequence has no active contacts"));
    }

    diesel::update(sequences::table.find(sequence.id))
        .set((
            sequences::status.eq(sequence_status::ACTIVE),
            sequences::test_mode.eq(payload.test_mode.unwrap_or(false)),
            sequences::updated_at.eq(Utc::now().naive_utc()),
        ))
        .execute(&mut conn)?;

    let job = jobs::push(
        &mut conn,
        JobKind::ProcessSequence,
        json!({ "sequence_id": sequence.id, "user_id": payload.user_id }),
        None,
    )?;

    info!(sequence_id = %sequence.id, job_id = %job.id, "sequence launched");
    Ok(Json(LaunchResponse {
        success: true,
        job_id: job.id,
        contact_count,
        step_count,
    }))
}

/// `POST /sequences/:id/pause`: the sweeper skips paused sequences, so
/// scheduling stops within one tick; in-flight sends complete.
pub async fn pause(
    State(state): State<AppState>,
    Path(sequence_id): Path<Uuid>,
    Json(payload): Json<SequenceActionRequest>,
) -> AppResult<Json<ActionResponse>> {
    let mut conn = state.db()?;
    let sequence = owned_sequence(&mut conn, sequence_id, payload.user_id)?;

    diesel::update(sequences::table.find(sequence.id))
        .set((
            sequences::status.eq(sequence_status::PAUSED),
            sequences::updated_at.eq(Utc::now().naive_utc()),
        ))
        .execute(&mut conn)?;

    info!(sequence_id = %sequence.id, "sequence paused");
    Ok(Json(ActionResponse { success: true }))
}

/// `POST /sequences/:id/resume`: reactivate and enqueue a per-contact
/// repair job for every row that lost its schedule while paused.
pub async fn resume(
    State(state): State<AppState>,
    Path(sequence_id): Path<Uuid>,
    Json(payload): Json<SequenceActionRequest>,
) -> AppResult<Json<ActionResponse>> {
    let mut conn = state.db()?;
    let sequence = owned_sequence(&mut conn, sequence_id, payload.user_id)?;

    diesel::update(sequences::table.find(sequence.id))
        .set((
            sequences::status.eq(sequence_status::ACTIVE),
            sequences::updated_at.eq(Utc::now().naive_utc()),
        ))
        .execute(&mut conn)?;

    let stalled: Vec<SequenceContact> = sequence_contacts::table
        .filter(sequence_contacts::sequence_id.eq(sequence.id))
        .filter(sequence_contacts::status.ne_all(active_contact_filter()))
        .filter(sequence_contacts::next_scheduled_at.is_null())
        .load(&mut conn)?;

    for row in &stalled {
        jobs::push(
            &mut conn,
            JobKind::SyncContact,
            json!({
                "sequence_id": sequence.id,
                "contact_id": row.contact_id,
                "user_id": payload.user_id,
            }),
            None,
        )?;
    }

    info!(
        sequence_id = %sequence.id,
        resumed_contacts = stalled.len(),
        "sequence resumed"
    );
    Ok(Json(ActionResponse { success: true }))
}

/// `POST /sequences/:id/reset`: synchronous and destructive: tracking,
/// events, stats, health, and pending jobs are gone; every progress row
/// returns to its initial state.
pub async fn reset(
    State(state): State<AppState>,
    Path(sequence_id): Path<Uuid>,
    Json(payload): Json<SequenceActionRequest>,
) -> AppResult<Json<ActionResponse>> {
    let mut conn = state.db()?;
    let sequence = owned_sequence(&mut conn, sequence_id, payload.user_id)?;

    conn.transaction::<_, diesel::result::Error, _>(|conn| {
        // email_events, tracked_links, and link_clicks cascade from here.
        diesel::delete(
            email_tracking::table
                .filter(email_tracking::user_id.eq(payload.user_id))
                .filter(
                    sql::<Bool>("metadata->>'sequenceId' = ")
                        .bind::<Text, _>(sequence.id.to_string()),
                ),
        )
        .execute(conn)?;

        diesel::delete(
            email_threads::table.filter(email_threads::sequence_id.eq(sequence.id)),
        )
        .execute(conn)?;
        diesel::delete(
            sequence_stats::table.filter(sequence_stats::sequence_id.eq(sequence.id)),
        )
        .execute(conn)?;
        diesel::delete(
            sequence_health::table.filter(sequence_health::sequence_id.eq(sequence.id)),
        )
        .execute(conn)?;

        diesel::delete(
            crate::schema::jobs::table
                .filter(crate::schema::jobs::status.eq(jobs::STATUS_QUEUED))
                .filter(
                    sql::<Bool>("payload->>'sequence_id' = ")
                        .bind::<Text, _>(sequence.id.to_string()),
                ),
        )
        .execute(conn)?;

        diesel::update(
            sequence_contacts::table.filter(sequence_contacts::sequence_id.eq(sequence.id)),
        )
        .set((
            sequence_contacts::status.eq(contact_status::NOT_SENT),
            sequence_contacts::current_step.eq(0),
            sequence_contacts::next_scheduled_at.eq::<Option<chrono::NaiveDateTime>>(None),
            sequence_contacts::thread_id.eq::<Option<String>>(None),
            sequence_contacts::started_at.eq::<Option<chrono::NaiveDateTime>>(None),
            sequence_contacts::last_processed_at.eq::<Option<chrono::NaiveDateTime>>(None),
            sequence_contacts::completed_at.eq::<Option<chrono::NaiveDateTime>>(None),
            sequence_contacts::updated_at.eq(Utc::now().naive_utc()),
        ))
        .execute(conn)?;

        diesel::update(sequences::table.find(sequence.id))
            .set((
                sequences::status.eq(sequence_status::DRAFT),
                sequences::test_mode.eq(false),
                sequences::updated_at.eq(Utc::now().naive_utc()),
            ))
            .execute(conn)?;

        Ok(())
    })?;
    drop(conn);

    state
        .limiter
        .reset(payload.user_id, sequence.id)
        .await
        .map_err(AppError::internal)?;

    info!(sequence_id = %sequence.id, "sequence reset");
    Ok(Json(ActionResponse { success: true }))
}
