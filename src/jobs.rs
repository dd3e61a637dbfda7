use std::time::Duration;

use chrono::{Duration as ChronoDuration, NaiveDateTime, Utc};
use diesel::pg::PgConnection;
use diesel::prelude::*;
use serde_json::Value;
use thiserror::Error;
use uuid::Uuid;

use crate::models::{Job, NewJob};
use crate::schema::jobs;

pub const STATUS_QUEUED: &str = "queued";
pub const STATUS_PROCESSING: &str = "processing";
pub const STATUS_SUCCEEDED: &str = "succeeded";
pub const STATUS_FAILED: &str = "failed";

/// The four job families the engine runs.
///
/// Each family carries its own queue policy: how urgent it is relative
/// to the others, how often the queue will re-run it after a failed
/// attempt, and on what curve. A due send must never sit behind a pile
/// of fan-outs or thread polls, which is what the priority encodes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum JobKind {
    /// Launch fan-out over a sequence's contacts.
    ProcessSequence,
    /// One tracked Gmail send for one step of one contact.
    SendEmail,
    /// Re-evaluate a single (sequence, contact) pair.
    SyncContact,
    /// Poll one thread for replies/bounces when push lags.
    WatchThread,
}

impl JobKind {
    pub const ALL: [JobKind; 4] = [
        JobKind::ProcessSequence,
        JobKind::SendEmail,
        JobKind::SyncContact,
        JobKind::WatchThread,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            JobKind::ProcessSequence => "process-sequence",
            JobKind::SendEmail => "send-email",
            JobKind::SyncContact => "sync-contact",
            JobKind::WatchThread => "watch-thread",
        }
    }

    pub fn parse(raw: &str) -> Option<JobKind> {
        JobKind::ALL.into_iter().find(|kind| kind.as_str() == raw)
    }

    /// Queue priority; higher claims first.
    pub fn priority(self) -> i32 {
        match self {
            JobKind::SendEmail => 1,
            JobKind::ProcessSequence | JobKind::SyncContact | JobKind::WatchThread => 0,
        }
    }

    /// Runs the queue allows before a repeatedly deferred job is parked.
    pub fn max_attempts(self) -> i32 {
        match self {
            // One initial attempt plus two queue retries.
            JobKind::SendEmail => 3,
            JobKind::ProcessSequence => 3,
            // Cheap single-row repair; rate deferrals burn attempts, so
            // it gets more of them.
            JobKind::SyncContact => 5,
            JobKind::WatchThread => 2,
        }
    }

    /// Requeue delay after `attempts` completed runs. Sends back off
    /// exponentially so a flaky mailbox is not hammered; the bookkeeping
    /// families retry on a flat interval.
    pub fn backoff(self, attempts: i32) -> Duration {
        match self {
            JobKind::SendEmail => {
                let exponent = (attempts - 1).clamp(0, 4) as u32;
                Duration::from_secs(60) * 2u32.pow(exponent)
            }
            JobKind::WatchThread => Duration::from_secs(120),
            JobKind::ProcessSequence | JobKind::SyncContact => Duration::from_secs(60),
        }
    }
}

#[derive(Debug, Error)]
pub enum QueueError {
    #[error("queue store unavailable: {0}")]
    Store(#[from] diesel::result::Error),
}

pub type QueueResult<T> = Result<T, QueueError>;

/// Put a job of `kind` on the queue, optionally deferred to `run_after`.
/// Priority comes from the kind, not the caller.
pub fn push(
    conn: &mut PgConnection,
    kind: JobKind,
    payload: Value,
    run_after: Option<NaiveDateTime>,
) -> QueueResult<Job> {
    let job = NewJob {
        id: Uuid::new_v4(),
        job_type: kind.as_str().to_string(),
        payload,
        status: STATUS_QUEUED.to_string(),
        priority: kind.priority(),
        run_after: run_after.unwrap_or_else(|| Utc::now().naive_utc()),
    };

    diesel::insert_into(jobs::table).values(&job).execute(conn)?;
    Ok(jobs::table.find(job.id).first(conn)?)
}

/// Claim the next runnable job among `kinds`: highest priority first,
/// oldest deadline within a priority. The row lock plus SKIP LOCKED is
/// what lets several dispatcher processes share one queue; the attempt
/// counter ticks inside the same transaction as the claim.
pub fn claim(conn: &mut PgConnection, kinds: &[JobKind]) -> QueueResult<Option<Job>> {
    let kind_names: Vec<&str> = kinds.iter().map(|kind| kind.as_str()).collect();
    let now = Utc::now().naive_utc();

    conn.transaction(|conn| {
        let candidate: Option<Uuid> = jobs::table
            .select(jobs::id)
            .filter(jobs::status.eq(STATUS_QUEUED))
            .filter(jobs::job_type.eq_any(kind_names))
            .filter(jobs::run_after.le(now))
            .order((jobs::priority.desc(), jobs::run_after.asc()))
            .for_update()
            .skip_locked()
            .first(conn)
            .optional()?;

        let Some(job_id) = candidate else {
            return Ok(None);
        };

        diesel::update(jobs::table.find(job_id))
            .set((
                jobs::status.eq(STATUS_PROCESSING),
                jobs::attempts.eq(jobs::attempts + 1),
                jobs::updated_at.eq(now),
            ))
            .execute(conn)?;

        jobs::table.find(job_id).first(conn).map(Some)
    })
    .map_err(QueueError::from)
}

pub fn complete(conn: &mut PgConnection, job_id: Uuid) -> QueueResult<()> {
    diesel::update(jobs::table.find(job_id))
        .set((
            jobs::status.eq(STATUS_SUCCEEDED),
            jobs::last_error.eq::<Option<String>>(None),
            jobs::updated_at.eq(Utc::now().naive_utc()),
        ))
        .execute(conn)?;
    Ok(())
}

/// Requeue after a failed run. Without an explicit `delay` the kind's
/// backoff curve decides, fed by the attempt count the claim recorded.
pub fn defer(
    conn: &mut PgConnection,
    job: &Job,
    delay: Option<Duration>,
    error: &str,
) -> QueueResult<()> {
    let delay = delay.unwrap_or_else(|| {
        JobKind::parse(&job.job_type)
            .map(|kind| kind.backoff(job.attempts))
            .unwrap_or(Duration::from_secs(60))
    });
    let resume_at = Utc::now()
        + ChronoDuration::from_std(delay).unwrap_or_else(|_| ChronoDuration::seconds(60));

    diesel::update(jobs::table.find(job.id))
        .set((
            jobs::status.eq(STATUS_QUEUED),
            jobs::run_after.eq(resume_at.naive_utc()),
            jobs::last_error.eq(Some(error.to_string())),
            jobs::updated_at.eq(Utc::now().naive_utc()),
        ))
        .execute(conn)?;
    Ok(())
}

/// Park a job permanently. Nothing reads failed jobs back; they stay as
/// an audit trail next to their `last_error`.
pub fn abandon(conn: &mut PgConnection, job_id: Uuid, error: &str) -> QueueResult<()> {
    diesel::update(jobs::table.find(job_id))
        .set((
            jobs::status.eq(STATUS_FAILED),
            jobs::last_error.eq(Some(error.to_string())),
            jobs::updated_at.eq(Utc::now().naive_utc()),
        ))
        .execute(conn)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kind_names_round_trip() {
        for kind in JobKind::ALL {
            assert_eq!(JobKind::parse(kind.as_str()), Some(kind));
        }
        assert_eq!(JobKind::parse("sweep-everything"), None);
    }

    #[test]
    fn sends_outrank_bookkeeping() {
        assert!(JobKind::SendEmail.priority() > JobKind::ProcessSequence.priority());
        assert!(JobKind::SendEmail.priority() > JobKind::WatchThread.priority());
    }

    #[test]
    fn send_backoff_doubles_and_caps() {
        assert_eq!(JobKind::SendEmail.backoff(1), Duration::from_secs(60));
        assert_eq!(JobKind::SendEmail.backoff(2), Duration::from_secs(120));
        assert_eq!(JobKind::SendEmail.backoff(3), Duration::from_secs(240));
        // Past the clamp the delay stops growing.
        assert_eq!(JobKind::SendEmail.backoff(50), JobKind::SendEmail.backoff(5));
    }

    #[test]
    fn bookkeeping_backoff_is_flat() {
        assert_eq!(
            JobKind::SyncContact.backoff(1),
            JobKind::SyncContact.backoff(4)
        );
    }
}
