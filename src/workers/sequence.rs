use std::{sync::Arc, time::Duration};

use async_trait::async_trait;
use chrono::Utc;
use diesel::prelude::*;
use serde::Deserialize;
use tracing::{info, warn};
use uuid::Uuid;

use crate::{
    hours,
    jobs::JobKind,
    models::{contact_status, Contact, Sequence, SequenceContact, SequenceStep},
    schedule::StoredRateWindow,
    schema::{contacts, sequence_contacts, sequence_steps, sequences},
    state::AppState,
};

use super::{JobHandler, JobOutcome};

const CONTACT_SPACING: Duration = Duration::from_secs(1);

#[derive(Debug, Deserialize)]
struct ProcessSequencePayload {
    sequence_id: Uuid,
    user_id: Uuid,
}

/// Launch/resume fan-out: seeds `next_scheduled_at` for every active
/// contact of a sequence. The sweeper owns everything after that.
pub struct ProcessSequenceJob;

impl ProcessSequenceJob {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl JobHandler for ProcessSequenceJob {
    fn kind(&self) -> JobKind {
        JobKind::ProcessSequence
    }

    async fn run(&self, state: Arc<AppState>, job: crate::models::Job) -> JobOutcome {
        let payload: ProcessSequencePayload = match serde_json::from_value(job.payload.clone()) {
            Ok(payload) => payload,
            Err(err) => {
                return JobOutcome::Abandon {
                    error: format!("invalid sequence payload: {err}"),
                }
            }
        };

        match state
            .limiter
            .check(payload.user_id, Some(payload.sequence_id), None)
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

        let loaded = {
            let mut conn = match state.db() {
                Ok(conn) => conn,
                Err(err) => {
                    return JobOutcome::Defer {
                        error: format!("{err:?}"),
                        delay: None,
                    }
                }
            };
            load_sequence(&mut conn, payload.sequence_id, payload.user_id)
        };

        let (sequence, steps, pairs) = match loaded {
            Ok(Some(loaded)) => loaded,
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

        if steps.is_empty() {
            return JobOutcome::Abandon {
                error: "sequence has no steps".to_string(),
            };
        }

        let total = pairs.len();
        let mut seeded = 0usize;
        for (index, (row, contact)) in pairs.into_iter().enumerate() {
            match self
                .seed_contact(&state, &sequence, &steps, &row, &contact)
                .await
            {
                Ok(true) => seeded += 1,
                Ok(false) => {}
                Err(err) => {
                    warn!(
                        sequence_id = %sequence.id,
                        contact_id = %contact.id,
                        error = %err,
                        "failed to schedule contact"
                    );
                }
            }
            if index + 1 < total {
                tokio::time::sleep(CONTACT_SPACING).await;
            }
        }

        info!(
            sequence_id = %sequence.id,
            contacts = total,
            seeded,
            "sequence fan-out complete"
        );
        JobOutcome::Done
    }
}

impl ProcessSequenceJob {
    async fn seed_contact(
        &self,
        state: &AppState,
        sequence: &Sequence,
        steps: &[SequenceStep],
        row: &SequenceContact,
        contact: &Contact,
    ) -> anyhow::Result<bool> {
        let check = state
            .limiter
            .check(sequence.user_id, Some(sequence.id), Some(contact.id))
            .await?;
        if !check.allowed {
            return Ok(false);
        }

        let mut conn = state.db().map_err(|err| anyhow::anyhow!("{err:?}"))?;
        let now = Utc::now();

        if row.current_step >= steps.len() as i32 {
            diesel::update(sequence_contacts::table.find(row.id))
                .set((
                    sequence_contacts::status.eq(contact_status::COMPLETED),
                    sequence_contacts::completed_at.eq(now.naive_utc()),
                    sequence_contacts::next_scheduled_at
                        .eq::<Option<chrono::NaiveDateTime>>(None),
                    sequence_contacts::updated_at.eq(now.naive_utc()),
                ))
                .execute(&mut conn)?;
            return Ok(false);
        }

        let step = &steps[row.current_step as usize];
        let business_hours = hours::load_for_sequence(&mut conn, sequence)?;

        let send_time = {
            let mut window = StoredRateWindow::new(&mut conn);
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
            .execute(&mut conn)?;

        state
            .limiter
            .increment(sequence.user_id, sequence.id, contact.id)
            .await?;
        Ok(true)
    }
}

type LoadedSequence = (Sequence, Vec<SequenceStep>, Vec<(SequenceContact, Contact)>);

fn load_sequence(
    conn: &mut diesel::pg::PgConnection,
    sequence_id: Uuid,
    user_id: Uuid,
) -> anyhow::Result<Option<LoadedSequence>> {
    let sequence = sequences::table
        .find(sequence_id)
        .filter(sequences::user_id.eq(user_id))
        .first::<Sequence>(conn)
        .optional()?;
    let Some(sequence) = sequence else {
        return Ok(None);
    };

    let steps = sequence_steps::table
        .filter(sequence_steps::sequence_id.eq(sequence.id))
        .order(sequence_steps::step_order.asc())
        .load::<SequenceStep>(conn)?;

    let pairs = sequence_contacts::table
        .inner_join(contacts::table)
        .filter(sequence_contacts::sequence_id.eq(sequence.id))
        .filter(sequence_contacts::status.ne_all(vec![
            contact_status::COMPLETED,
            contact_status::OPTED_OUT,
            contact_status::REPLIED,
            contact_status::BOUNCED,
            contact_status::FAILED,
        ]))
        .order(sequence_contacts::created_at.asc())
        .load::<(SequenceContact, Contact)>(conn)?;

    Ok(Some((sequence, steps, pairs)))
}
