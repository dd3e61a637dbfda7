use chrono::NaiveDateTime;
use diesel::prelude::*;
use uuid::Uuid;

use crate::schema::*;

pub mod sequence_status {
    pub const DRAFT: &str = "draft";
    pub const ACTIVE: &str = "active";
    pub const PAUSED: &str = "paused";
}

pub mod contact_status {
    pub const NOT_SENT: &str = "not_sent";
    pub const PENDING: &str = "pending";
    pub const SCHEDULED: &str = "scheduled";
    pub const SENT: &str = "sent";
    pub const REPLIED: &str = "replied";
    pub const BOUNCED: &str = "bounced";
    pub const COMPLETED: &str = "completed";
    pub const OPTED_OUT: &str = "opted_out";
    pub const FAILED: &str = "failed";
}

pub mod tracking_status {
    pub const PENDING: &str = "pending";
    pub const SENT: &str = "sent";
    pub const BOUNCED: &str = "bounced";
}

pub mod event_type {
    pub const SENT: &str = "sent";
    pub const OPENED: &str = "opened";
    pub const CLICKED: &str = "clicked";
    pub const REPLIED: &str = "replied";
    pub const BOUNCED: &str = "bounced";
    pub const FAILED: &str = "failed";
}

pub mod health_status {
    pub const HEALTHY: &str = "healthy";
    pub const WARNING: &str = "warning";
    pub const ERROR: &str = "error";
}

pub mod step_type {
    pub const MANUAL_EMAIL: &str = "manual_email";
    pub const AUTOMATED_EMAIL: &str = "automated_email";
    pub const WAIT: &str = "wait";
}

pub mod step_timing {
    pub const IMMEDIATE: &str = "immediate";
    pub const DELAY: &str = "delay";
}

#[derive(Debug, Clone, Queryable, Identifiable)]
#[diesel(table_name = users)]
pub struct User {
    pub id: Uuid,
    pub email: String,
    pub created_at: NaiveDateTime,
    pub updated_at: NaiveDateTime,
}

#[derive(Debug, Insertable)]
#[diesel(table_name = users)]
pub struct NewUser {
    pub id: Uuid,
    pub email: String,
}

#[derive(Debug, Clone, Queryable, Identifiable, Associations)]
#[diesel(table_name = google_accounts)]
#[diesel(belongs_to(User))]
pub struct GoogleAccount {
    pub id: Uuid,
    pub user_id: Uuid,
    pub access_token: String,
    pub refresh_token: String,
    pub token_expiry: Option<NaiveDateTime>,
    pub history_id: Option<i64>,
    pub created_at: NaiveDateTime,
    pub updated_at: NaiveDateTime,
}

#[derive(Debug, Insertable)]
#[diesel(table_name = google_accounts)]
pub struct NewGoogleAccount {
    pub id: Uuid,
    pub user_id: Uuid,
    pub access_token: String,
    pub refresh_token: String,
    pub token_expiry: Option<NaiveDateTime>,
}

#[derive(Debug, Clone, Queryable, Identifiable, Associations)]
#[diesel(table_name = sequences)]
#[diesel(belongs_to(User))]
pub struct Sequence {
    pub id: Uuid,
    pub user_id: Uuid,
    pub name: String,
    pub status: String,
    pub test_mode: bool,
    pub created_at: NaiveDateTime,
    pub updated_at: NaiveDateTime,
}

#[derive(Debug, Insertable)]
#[diesel(table_name = sequences)]
pub struct NewSequence {
    pub id: Uuid,
    pub user_id: Uuid,
    pub name: String,
    pub status: String,
    pub test_mode: bool,
}

#[derive(Debug, Clone, Queryable, Identifiable, Associations)]
#[diesel(table_name = sequence_steps)]
#[diesel(belongs_to(Sequence))]
pub struct SequenceStep {
    pub id: Uuid,
    pub sequence_id: Uuid,
    pub step_order: i32,
    pub step_type: String,
    pub timing: String,
    pub delay_amount: Option<i32>,
    pub delay_unit: Option<String>,
    pub subject: Option<String>,
    pub content: Option<String>,
    pub reply_to_thread: bool,
    pub previous_step_id: Option<Uuid>,
    pub created_at: NaiveDateTime,
}

#[derive(Debug, Insertable)]
#[diesel(table_name = sequence_steps)]
pub struct NewSequenceStep {
    pub id: Uuid,
    pub sequence_id: Uuid,
    pub step_order: i32,
    pub step_type: String,
    pub timing: String,
    pub delay_amount: Option<i32>,
    pub delay_unit: Option<String>,
    pub subject: Option<String>,
    pub content: Option<String>,
    pub reply_to_thread: bool,
    pub previous_step_id: Option<Uuid>,
}

#[derive(Debug, Clone, Queryable, Identifiable, Associations)]
#[diesel(table_name = contacts)]
#[diesel(belongs_to(User))]
pub struct Contact {
    pub id: Uuid,
    pub user_id: Uuid,
    pub email: String,
    pub first_name: Option<String>,
    pub company: Option<String>,
    pub created_at: NaiveDateTime,
}

#[derive(Debug, Insertable)]
#[diesel(table_name = contacts)]
pub struct NewContact {
    pub id: Uuid,
    pub user_id: Uuid,
    pub email: String,
    pub first_name: Option<String>,
    pub company: Option<String>,
}

/// Per-(sequence, contact) progress row. `current_step` is 0-based and
/// names the next step to send; it only ever advances.
#[derive(Debug, Clone, Queryable, Identifiable, Associations)]
#[diesel(table_name = sequence_contacts)]
#[diesel(belongs_to(Sequence))]
#[diesel(belongs_to(Contact))]
pub struct SequenceContact {
    pub id: Uuid,
    pub sequence_id: Uuid,
    pub contact_id: Uuid,
    pub status: String,
    pub current_step: i32,
    pub next_scheduled_at: Option<NaiveDateTime>,
    pub thread_id: Option<String>,
    pub started_at: Option<NaiveDateTime>,
    pub last_processed_at: Option<NaiveDateTime>,
    pub completed_at: Option<NaiveDateTime>,
    pub created_at: NaiveDateTime,
    pub updated_at: NaiveDateTime,
}

#[derive(Debug, Insertable)]
#[diesel(table_name = sequence_contacts)]
pub struct NewSequenceContact {
    pub id: Uuid,
    pub sequence_id: Uuid,
    pub contact_id: Uuid,
    pub status: String,
}

#[derive(Debug, Clone, Queryable, Identifiable)]
#[diesel(table_name = business_hours)]
pub struct BusinessHoursRow {
    pub id: Uuid,
    pub user_id: Option<Uuid>,
    pub sequence_id: Option<Uuid>,
    pub timezone: String,
    pub work_days: serde_json::Value,
    pub work_hours_start: String,
    pub work_hours_end: String,
    pub holidays: serde_json::Value,
    pub created_at: NaiveDateTime,
    pub updated_at: NaiveDateTime,
}

#[derive(Debug, Insertable)]
#[diesel(table_name = business_hours)]
pub struct NewBusinessHours {
    pub id: Uuid,
    pub user_id: Option<Uuid>,
    pub sequence_id: Option<Uuid>,
    pub timezone: String,
    pub work_days: serde_json::Value,
    pub work_hours_start: String,
    pub work_hours_end: String,
    pub holidays: serde_json::Value,
}

#[derive(Debug, Clone, Queryable, Identifiable, Associations)]
#[diesel(table_name = email_tracking)]
#[diesel(belongs_to(User))]
pub struct EmailTracking {
    pub id: Uuid,
    pub user_id: Uuid,
    pub hash: String,
    pub message_id: Option<String>,
    pub thread_id: Option<String>,
    pub status: String,
    pub open_count: i32,
    pub sent_at: Option<NaiveDateTime>,
    pub opened_at: Option<NaiveDateTime>,
    pub clicked_at: Option<NaiveDateTime>,
    pub metadata: serde_json::Value,
    pub created_at: NaiveDateTime,
}

#[derive(Debug, Insertable)]
#[diesel(table_name = email_tracking)]
pub struct NewEmailTracking {
    pub id: Uuid,
    pub user_id: Uuid,
    pub hash: String,
    pub message_id: Option<String>,
    pub thread_id: Option<String>,
    pub status: String,
    pub sent_at: Option<NaiveDateTime>,
    pub metadata: serde_json::Value,
}

#[derive(Debug, Clone, Queryable, Identifiable, Associations)]
#[diesel(table_name = tracked_links)]
#[diesel(belongs_to(EmailTracking))]
pub struct TrackedLink {
    pub id: Uuid,
    pub email_tracking_id: Uuid,
    pub original_url: String,
    pub click_count: i32,
    pub created_at: NaiveDateTime,
}

#[derive(Debug, Insertable)]
#[diesel(table_name = tracked_links)]
pub struct NewTrackedLink {
    pub id: Uuid,
    pub email_tracking_id: Uuid,
    pub original_url: String,
}

#[derive(Debug, Clone, Queryable, Identifiable, Associations)]
#[diesel(table_name = link_clicks)]
#[diesel(belongs_to(TrackedLink))]
pub struct LinkClick {
    pub id: Uuid,
    pub tracked_link_id: Uuid,
    pub clicked_at: NaiveDateTime,
}

#[derive(Debug, Insertable)]
#[diesel(table_name = link_clicks)]
pub struct NewLinkClick {
    pub id: Uuid,
    pub tracked_link_id: Uuid,
}

#[derive(Debug, Clone, Queryable, Identifiable, Associations)]
#[diesel(table_name = email_events)]
#[diesel(belongs_to(EmailTracking))]
pub struct EmailEvent {
    pub id: Uuid,
    pub email_tracking_id: Uuid,
    pub event_type: String,
    pub reply_message_id: Option<String>,
    pub metadata: Option<serde_json::Value>,
    pub created_at: NaiveDateTime,
}

#[derive(Debug, Insertable)]
#[diesel(table_name = email_events)]
pub struct NewEmailEvent {
    pub id: Uuid,
    pub email_tracking_id: Uuid,
    pub event_type: String,
    pub reply_message_id: Option<String>,
    pub metadata: Option<serde_json::Value>,
}

#[derive(Debug, Clone, Queryable, Identifiable, Associations)]
#[diesel(table_name = email_threads)]
#[diesel(belongs_to(Sequence))]
#[diesel(belongs_to(Contact))]
pub struct EmailThread {
    pub id: Uuid,
    pub user_id: Uuid,
    pub sequence_id: Uuid,
    pub contact_id: Uuid,
    pub thread_id: String,
    pub first_message_id: Option<String>,
    pub created_at: NaiveDateTime,
}

#[derive(Debug, Insertable)]
#[diesel(table_name = email_threads)]
pub struct NewEmailThread {
    pub id: Uuid,
    pub user_id: Uuid,
    pub sequence_id: Uuid,
    pub contact_id: Uuid,
    pub thread_id: String,
    pub first_message_id: Option<String>,
}

#[derive(Debug, Clone, Queryable, Identifiable, Associations)]
#[diesel(table_name = sequence_stats)]
#[diesel(belongs_to(Sequence))]
pub struct SequenceStats {
    pub id: Uuid,
    pub sequence_id: Uuid,
    pub contact_id: Option<Uuid>,
    pub total_contacts: i32,
    pub sent_emails: i32,
    pub opened_emails: i32,
    pub unique_opens: i32,
    pub clicked_emails: i32,
    pub replied_emails: i32,
    pub bounced_emails: i32,
    pub people_contacted: i32,
    pub open_rate: f64,
    pub click_rate: f64,
    pub reply_rate: f64,
    pub created_at: NaiveDateTime,
    pub updated_at: NaiveDateTime,
}

#[derive(Debug, Insertable)]
#[diesel(table_name = sequence_stats)]
pub struct NewSequenceStats {
    pub id: Uuid,
    pub sequence_id: Uuid,
    pub contact_id: Option<Uuid>,
}

#[derive(Debug, Clone, Queryable, Identifiable, Associations)]
#[diesel(table_name = sequence_health)]
#[diesel(belongs_to(Sequence))]
pub struct SequenceHealth {
    pub id: Uuid,
    pub sequence_id: Uuid,
    pub status: String,
    pub error_count: i32,
    pub last_error: Option<String>,
    pub metrics: serde_json::Value,
    pub updated_at: NaiveDateTime,
}

#[derive(Debug, Insertable)]
#[diesel(table_name = sequence_health)]
pub struct NewSequenceHealth {
    pub id: Uuid,
    pub sequence_id: Uuid,
    pub status: String,
}

#[derive(Debug, Clone, Queryable, Identifiable)]
#[diesel(table_name = jobs)]
pub struct Job {
    pub id: Uuid,
    pub job_type: String,
    pub payload: serde_json::Value,
    pub status: String,
    pub priority: i32,
    pub attempts: i32,
    pub run_after: NaiveDateTime,
    pub last_error: Option<String>,
    pub created_at: NaiveDateTime,
    pub updated_at: NaiveDateTime,
}

#[derive(Debug, Insertable)]
#[diesel(table_name = jobs)]
pub struct NewJob {
    pub id: Uuid,
    pub job_type: String,
    pub payload: serde_json::Value,
    pub status: String,
    pub priority: i32,
    pub run_after: NaiveDateTime,
}
