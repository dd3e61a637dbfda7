use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use diesel::prelude::*;
use serde::Deserialize;
use uuid::Uuid;

use crate::{
    hours,
    jobs::JobKind,
    models::{contact_status, sequence_status, Sequence, SequenceContact, SequenceStep},
    schedule::StoredRateWindow,
    schema::{sequence_contacts, sequence_steps, sequences},
    state::AppState,
};

use super::{JobHandler, JobOutcome};

#[derive(Debug, Deserialize)]
struct SyncContactPayload {
    sequence_id: Uuid,
    contact_id: Uuid,
    user_id: Uuid,
}

/// Re-evaluates a single (sequence, contact) pair: finalizes finished
/// rows and re-seeds `next_scheduled_at` for rows that lost their
/// schedule (resume after pause, edited steps).
pub struct SyncContactJob;

impl SyncContactJob {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl JobHandler for SyncContactJob {
    fn kind(&self) -> JobKind {
        JobKind::SyncContact
    }

    async fn run(&self, state: Arc<AppState>, job: crate::models::Job) -> JobOutcome {
        let payload: SyncContactPayload = match serde_json::from_value(job.payload.clone()) {
            Ok(payload) => payload,
            Err(err) => {
                return JobOutcome::Abandon {
                    error: format!("invalid contact payload: {err}"),
                }
            }
        };

        match state
            .limiter
            .check(
                payload.user_id,
                Some(payload.sequence_id),
                Some(payload.contact_id),
            )
            .await
        {
            Ok(check) if !check.allowed => {
                return JobOutcome::Defer {
                    error: check.reason.unwrap_or_else(|| "rate limited".to_string()),
                    delay: None,
                }
            }
            Ok(_) => {}
            Err(err) => {
                return JobOutcome::Defer {
                    error: format!("rate check failed: {err}"),
                    delay: None,
                }
            }
        }

        let mut conn = match state.db() {
            Ok(conn) => conn,
            Err(err) => {
                return JobOutcome::Defer {
                    error: format!("{err:?}"),
                    delay: None,
                }
            }
        };

        let sequence = match sequences::table
            .find(payload.sequence_id)
            .first::<Sequence>(&mut conn)
            .optional()
        {
            Ok(Some(sequence)) => sequence,
            Ok(None) => {
                return JobOutcome::Abandon {
                    error: format!("sequence {} not found", payload.sequence_id),
                }
            }
            Err(err) => {
                return JobOutcome::Defer {
                    error: err.to_string(),
                    delay: None,
                }
            }
        };
        if sequence.status != sequence_status::ACTIVE {
            return JobOutcome::Done;
        }

        match sync_pair(&state, &mut conn, &sequence, payload.contact_id) {
            Ok(()) => JobOutcome::Done,
            Err(err) => JobOutcome::Defer {
                error: err.to_string(),
                delay: None,
            },
        }
    }
}

fn sync_pair(
    state: &AppState,
    conn: &mut diesel::pg::PgConnection,
    sequence: &Sequence,
    contact_id: Uuid,
) -> anyhow::Result<()> {
    let row = sequence_contacts::table
        .filter(sequence_contacts::sequence_id.eq(sequence.id))
        .filter(sequence_contacts::contact_id.eq(contact_id))
        .first::<SequenceContact>(conn)
        .optional()?;
    let Some(row) = row else {
        return Ok(());
    };

    if [
        contact_status::COMPLETED,
        contact_status::REPLIED,
        contact_status::BOUNCED,
        contact_status::OPTED_OUT,
        contact_status::FAILED,
    ]
    .contains(&row.status.as_str())
    {
        return Ok(());
    }

    let steps = sequence_steps::table
        .filter(sequence_steps::sequence_id.eq(sequence.id))
        .order(sequence_steps::step_order.asc())
        .load::<SequenceStep>(conn)?;

    let now = Utc::now();
    if row.current_step >= steps.len() as i32 {
        diesel::update(sequence_contacts::table.find(row.id))
            .set((
                sequence_contacts::status.eq(contact_status::COMPLETED),
                sequence_contacts::completed_at.eq(now.naive_utc()),
                sequence_contacts::next_scheduled_at.eq::<Option<chrono::NaiveDateTime>>(None),
                sequence_contacts::updated_at.eq(now.naive_utc()),
            ))
            .execute(conn)?;
        return Ok(());
    }

    if row.next_scheduled_at.is_some() {
        // Still scheduled; nothing to repair.
        return Ok(());
    }

    let step = &steps[row.current_step as usize];
    let business_hours = hours::load_for_sequence(conn, sequence)?;
    let send_time = {
        let mut window = StoredRateWindow::new(conn);
        state
            .scheduler
            .next_send_time(now, step, business_hours.as_ref(), Some(&mut window))
    };

    diesel::update(sequence_contacts::table.find(row.id))
        .set((
            sequence_contacts::status.eq(contact_status::SCHEDULED),
            sequence_contacts::next_scheduled_at.eq(send_time.naive_utc()),
            sequence_contacts::last_processed_at.eq(now.naive_utc()),
            sequence_contacts::updated_at.eq(now.naive_utc()),
        ))
        .execute(conn)?;
    Ok(())
}
