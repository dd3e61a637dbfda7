use std::{collections::HashMap, sync::Arc, time::Duration};

use anyhow::Result;
use chrono::Utc;
use diesel::pg::PgConnection;
use diesel::prelude::*;
use serde_json::json;
use tokio::time::sleep;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::{
    hours,
    jobs::{self, JobKind},
    mime,
    models::{
        contact_status, sequence_status, step_type, Contact, Sequence, SequenceContact,
        SequenceStep,
    },
    schedule::StoredRateWindow,
    schema::{contacts, sequence_contacts, sequence_steps, sequences},
    state::AppState,
};

pub const CHECK_INTERVAL: Duration = Duration::from_secs(30);
const ERROR_RETRY_MINUTES: i64 = 5;

#[derive(Debug, Default, PartialEq, Eq)]
pub struct SweepOutcome {
    pub dispatched: usize,
    pub completed: usize,
    pub deferred: usize,
    pub errors: usize,
}

enum RowAction {
    Dispatched,
    Completed,
    Deferred,
    /// Another sweeper advanced the row first.
    Lost,
}

/// Periodic scan over due progress rows: enqueue the current step's email
/// job, advance `current_step`, and write the following step's schedule.
///
/// Runs as a single logical instance; the compare-and-set advance keeps a
/// second racing sweeper from double-sending regardless.
pub struct Sweeper {
    state: Arc<AppState>,
    interval: Duration,
}

impl Sweeper {
    pub fn new(state: Arc<AppState>, interval: Duration) -> Self {
        Self { state, interval }
    }

    pub async fn run(&self) {
        info!("sweeper started");
        loop {
            match self.tick().await {
                Ok(outcome) => {
                    if outcome.dispatched > 0 || outcome.completed > 0 || outcome.errors > 0 {
                        info!(
                            dispatched = outcome.dispatched,
                            completed = outcome.completed,
                            deferred = outcome.deferred,
                            errors = outcome.errors,
                            "sweep finished"
                        );
                    }
                }
                Err(err) => error!(error = %err, "sweep tick failed"),
            }
            sleep(self.interval).await;
        }
    }

    pub async fn tick(&self) -> Result<SweepOutcome> {
        let now = Utc::now().naive_utc();
        let due = {
            let mut conn = self.state.db().map_err(|err| anyhow::anyhow!("{err:?}"))?;
            sequence_contacts::table
                .inner_join(sequences::table)
                .inner_join(contacts::table)
                .select((
                    sequence_contacts::all_columns,
                    sequences::all_columns,
                    contacts::all_columns,
                ))
                .filter(sequence_contacts::completed_at.is_null())
                .filter(sequence_contacts::next_scheduled_at.le(now))
                .filter(sequence_contacts::status.ne_all(vec![
                    contact_status::COMPLETED,
                    contact_status::REPLIED,
                    contact_status::BOUNCED,
                    contact_status::OPTED_OUT,
                    contact_status::FAILED,
                ]))
                .order(sequence_contacts::next_scheduled_at.asc())
                .load::<(SequenceContact, Sequence, Contact)>(&mut conn)?
        };

        let mut outcome = SweepOutcome::default();
        let mut steps_cache: HashMap<Uuid, Vec<SequenceStep>> = HashMap::new();

        for (row, sequence, contact) in due {
            // Paused sequences stop scheduling within one tick.
            if sequence.status != sequence_status::ACTIVE {
                outcome.deferred += 1;
                continue;
            }

            let action = self
                .process_row(&sequence, &row, &contact, &mut steps_cache)
                .await;
            match action {
                Ok(RowAction::Dispatched) => outcome.dispatched += 1,
                Ok(RowAction::Completed) => outcome.completed += 1,
                Ok(RowAction::Deferred) => outcome.deferred += 1,
                Ok(RowAction::Lost) => {}
                Err(err) => {
                    outcome.errors += 1;
                    warn!(
                        sequence_id = %sequence.id,
                        contact_id = %contact.id,
                        error = %err,
                        "sweep row failed, scheduling retry"
                    );
                    if let Err(retry_err) = self.schedule_retry(&row) {
                        error!(error = %retry_err, "failed to schedule row retry");
                    }
                }
            }
        }

        Ok(outcome)
    }

    async fn process_row(
        &self,
        sequence: &Sequence,
        row: &SequenceContact,
        contact: &Contact,
        steps_cache: &mut HashMap<Uuid, Vec<SequenceStep>>,
    ) -> Result<RowAction> {
        let mut conn = self.state.db().map_err(|err| anyhow::anyhow!("{err:?}"))?;

        let steps = match steps_cache.get(&sequence.id) {
            Some(steps) => steps.clone(),
            None => {
                let steps = sequence_steps::table
                    .filter(sequence_steps::sequence_id.eq(sequence.id))
                    .order(sequence_steps::step_order.asc())
                    .load::<SequenceStep>(&mut conn)?;
                steps_cache.insert(sequence.id, steps.clone());
                steps
            }
        };

        if row.current_step >= steps.len() as i32 {
            return self.finalize_row(&mut conn, row);
        }
        let step = &steps[row.current_step as usize];

        let check = self
            .state
            .limiter
            .check(sequence.user_id, Some(sequence.id), Some(contact.id))
            .await?;
        if !check.allowed {
            // Left untouched: the row stays due and the next tick retries.
            return Ok(RowAction::Deferred);
        }

        let business_hours = hours::load_for_sequence(&mut conn, sequence)?;
        let now = Utc::now();
        // The delay was consumed when next_scheduled_at was written, so
        // this only revalidates business hours and spreads the load.
        let send_time = {
            let mut window = StoredRateWindow::new(&mut conn);
            self.state
                .scheduler
                .dispatch_time(now, business_hours.as_ref(), Some(&mut window))
        };

        let next_index = row.current_step + 1;
        let is_last = next_index >= steps.len() as i32;
        let next_scheduled_at = if is_last {
            None
        } else {
            let following = &steps[next_index as usize];
            Some(
                self.state
                    .scheduler
                    .next_send_time(send_time, following, business_hours.as_ref(), None)
                    .naive_utc(),
            )
        };

        let subject = resolve_subject(&steps, row.current_step);
        let send_email = step.step_type != step_type::WAIT;
        let payload = json!({
            "sequence_id": sequence.id,
            "contact_id": contact.id,
            "step_id": step.id,
            "user_id": sequence.user_id,
            "to": contact.email,
            "subject": subject,
            "thread_id": row.thread_id,
            "scheduled_time": send_time.naive_utc(),
            "test_mode": sequence.test_mode,
        });

        // The CAS advance and the job enqueue commit together, so a racing
        // sweeper can never produce a second job for the same step.
        let advanced = conn.transaction::<bool, anyhow::Error, _>(|conn| {
            let advance = diesel::update(
                sequence_contacts::table
                    .find(row.id)
                    .filter(sequence_contacts::current_step.eq(row.current_step))
                    .filter(sequence_contacts::next_scheduled_at.eq(row.next_scheduled_at)),
            );

            let rows = if is_last {
                advance
                    .set((
                        sequence_contacts::current_step.eq(next_index),
                        sequence_contacts::status.eq(contact_status::COMPLETED),
                        sequence_contacts::completed_at.eq(Some(now.naive_utc())),
                        sequence_contacts::next_scheduled_at
                            .eq::<Option<chrono::NaiveDateTime>>(None),
                        sequence_contacts::last_processed_at.eq(now.naive_utc()),
                        sequence_contacts::updated_at.eq(now.naive_utc()),
                    ))
                    .execute(conn)?
            } else {
                advance
                    .set((
                        sequence_contacts::current_step.eq(next_index),
                        sequence_contacts::next_scheduled_at.eq(next_scheduled_at),
                        sequence_contacts::last_processed_at.eq(now.naive_utc()),
                        sequence_contacts::updated_at.eq(now.naive_utc()),
                    ))
                    .execute(conn)?
            };

            if rows == 0 {
                return Ok(false);
            }
            if send_email {
                jobs::push(conn, JobKind::SendEmail, payload.clone(), Some(send_time.naive_utc()))
                    .map_err(anyhow::Error::from)?;
            }
            Ok(true)
        })?;

        if !advanced {
            return Ok(RowAction::Lost);
        }
        if is_last {
            return Ok(RowAction::Completed);
        }
        Ok(RowAction::Dispatched)
    }

    fn finalize_row(&self, conn: &mut PgConnection, row: &SequenceContact) -> Result<RowAction> {
        let now = Utc::now().naive_utc();
        let rows = diesel::update(
            sequence_contacts::table
                .find(row.id)
                .filter(sequence_contacts::current_step.eq(row.current_step))
                .filter(sequence_contacts::completed_at.is_null()),
        )
        .set((
            sequence_contacts::status.eq(contact_status::COMPLETED),
            sequence_contacts::completed_at.eq(Some(now)),
            sequence_contacts::next_scheduled_at.eq::<Option<chrono::NaiveDateTime>>(None),
            sequence_contacts::updated_at.eq(now),
        ))
        .execute(conn)?;
        if rows == 0 {
            return Ok(RowAction::Lost);
        }
        Ok(RowAction::Completed)
    }

    /// On a row-level failure, keep `current_step` and push the schedule
    /// out so the next tick retries.
    fn schedule_retry(&self, row: &SequenceContact) -> Result<()> {
        let mut conn = self.state.db().map_err(|err| anyhow::anyhow!("{err:?}"))?;
        let retry_at = (Utc::now() + chrono::Duration::minutes(ERROR_RETRY_MINUTES)).naive_utc();
        diesel::update(
            sequence_contacts::table
                .find(row.id)
                .filter(sequence_contacts::current_step.eq(row.current_step)),
        )
        .set((
            sequence_contacts::next_scheduled_at.eq(Some(retry_at)),
            sequence_contacts::updated_at.eq(Utc::now().naive_utc()),
        ))
        .execute(&mut conn)?;
        Ok(())
    }
}

/// Reply steps reuse the previous email step's subject; the send worker
/// substitutes the live thread subject when one exists.
fn resolve_subject(steps: &[SequenceStep], current: i32) -> String {
    let step = &steps[current as usize];
    if step.reply_to_thread {
        if let Some(previous) = steps[..current as usize]
            .iter()
            .rev()
            .find(|candidate| candidate.subject.is_some())
        {
            if let Some(subject) = &previous.subject {
                return mime::reply_subject(subject);
            }
        }
    }
    step.subject.clone().unwrap_or_default()
}
