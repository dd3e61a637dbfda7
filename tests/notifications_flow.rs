mod common;

use anyhow::Result;
use axum::http::StatusCode;
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use cadence::gmail::MessageSummary;
use cadence::models::*;
use cadence::schema;
use chrono::Utc;
use common::{acquire_db_lock, body_to_vec, TestApp};
use diesel::prelude::*;
use serde_json::json;
use uuid::Uuid;

fn push_body(email: &str, history_id: u64) -> serde_json::Value {
    let data = STANDARD.encode(
        json!({ "emailAddress": email, "historyId": history_id }).to_string(),
    );
    json!({ "message": { "data": data } })
}

struct SeededThread {
    user: Uuid,
    sequence: Uuid,
    contact: Uuid,
    tracking_id: Uuid,
}

/// A sequence whose step 0 already went out on thread "t-1" with
/// Message-ID `<m1@mail.gmail.com>`.
async fn seed_sent_thread(app: &TestApp, owner: &str) -> Result<SeededThread> {
    let user = app.insert_user(owner).await?;
    app.insert_google_account(user).await?;
    let sequence = app.insert_sequence(user, "Outreach").await?;
    let step0 = app
        .insert_step(
            sequence,
            0,
            step_timing::IMMEDIATE,
            None,
            "Hello",
            "<p>Hi</p>",
            false,
        )
        .await?;
    app.insert_step(
        sequence,
        1,
        step_timing::DELAY,
        Some((1, "days")),
        "Follow up",
        "<p>Ping</p>",
        true,
    )
    .await?;
    let contact = app.insert_contact(user, "replyer@ex.com").await?;
    let row_id = app.assign_contact(sequence, contact).await?;

    let tracking_id = app
        .with_conn(move |conn| {
            diesel::update(schema::sequence_contacts::table.find(row_id))
                .set((
                    schema::sequence_contacts::status.eq(contact_status::SENT),
                    schema::sequence_contacts::current_step.eq(1),
                    schema::sequence_contacts::thread_id.eq("t-1"),
                    schema::sequence_contacts::next_scheduled_at
                        .eq((Utc::now() + chrono::Duration::days(1)).naive_utc()),
                ))
                .execute(conn)?;

            let tracking = NewEmailTracking {
                id: Uuid::new_v4(),
                user_id: user,
                hash: Uuid::new_v4().simple().to_string(),
                message_id: Some("<m1@mail.gmail.com>".to_string()),
                thread_id: Some("t-1".to_string()),
                status: tracking_status::SENT.to_string(),
                sent_at: Some(Utc::now().naive_utc()),
                metadata: json!({
                    "email": "replyer@ex.com",
                    "userId": user,
                    "sequenceId": sequence,
                    "stepId": step0,
                    "contactId": contact,
                }),
            };
            diesel::insert_into(schema::email_tracking::table)
                .values(&tracking)
                .execute(conn)?;

            let thread = NewEmailThread {
                id: Uuid::new_v4(),
                user_id: user,
                sequence_id: sequence,
                contact_id: contact,
                thread_id: "t-1".to_string(),
                first_message_id: Some("<m1@mail.gmail.com>".to_string()),
            };
            diesel::insert_into(schema::email_threads::table)
                .values(&thread)
                .execute(conn)?;
            Ok(tracking.id)
        })
        .await?;

    Ok(SeededThread {
        user,
        sequence,
        contact,
        tracking_id,
    })
}

#[tokio::test]
async fn push_requires_valid_jwt_and_known_user() -> Result<()> {
    let _lock = acquire_db_lock().await;
    let Some(app) = TestApp::try_new().await? else {
        return Ok(());
    };

    let body = push_body("nobody@example.com", 10);
    let response = app
        .post_json("/api/gmail/notifications", &body, Some("not-a-jwt"))
        .await?;
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);

    let token = app.push_token()?;
    let response = app
        .post_json("/api/gmail/notifications", &body, Some(&token))
        .await?;
    assert_eq!(response.status(), StatusCode::NOT_FOUND);

    Ok(())
}

#[tokio::test]
async fn reply_short_circuits_the_sequence() -> Result<()> {
    let _lock = acquire_db_lock().await;
    let Some(app) = TestApp::try_new().await? else {
        return Ok(());
    };

    let seeded = seed_sent_thread(&app, "owner-reply@example.com").await?;

    app.mailbox()
        .put_message(MessageSummary {
            id: "reply-1".to_string(),
            thread_id: "t-1".to_string(),
            label_ids: vec!["INBOX".to_string()],
            headers: vec![
                ("From".to_string(), "Replyer <replyer@ex.com>".to_string()),
                ("Message-ID".to_string(), "<r1@ex.com>".to_string()),
                ("References".to_string(), "<m1@mail.gmail.com>".to_string()),
                (
                    "In-Reply-To".to_string(),
                    "<m1@mail.gmail.com>".to_string(),
                ),
                (
                    "Content-Type".to_string(),
                    "text/html; charset=utf-8".to_string(),
                ),
            ],
        })
        .await;
    app.mailbox()
        .set_history(vec!["reply-1".to_string()], Some(42))
        .await;

    let token = app.push_token()?;
    let body = push_body("owner-reply@example.com", 42);
    let response = app
        .post_json("/api/gmail/notifications", &body, Some(&token))
        .await?;
    assert_eq!(response.status(), StatusCode::OK);
    let parsed: serde_json::Value =
        serde_json::from_slice(&body_to_vec(response.into_body()).await?)?;
    assert_eq!(parsed["replies"], 1);

    let row = app.progress_row(seeded.sequence, seeded.contact).await?;
    assert_eq!(row.status, contact_status::REPLIED);
    assert!(row.next_scheduled_at.is_none());

    // The sweeper must not enqueue the follow-up step now.
    let outcome = app.sweeper().tick().await?;
    assert_eq!(outcome.dispatched, 0);

    let (reply_events, stats, history_id) = {
        let tracking_id = seeded.tracking_id;
        let sequence = seeded.sequence;
        let user = seeded.user;
        app.with_conn(move |conn| {
            let events: i64 = schema::email_events::table
                .filter(schema::email_events::email_tracking_id.eq(tracking_id))
                .filter(schema::email_events::event_type.eq(event_type::REPLIED))
                .count()
                .get_result(conn)?;
            let stats: SequenceStats = schema::sequence_stats::table
                .filter(schema::sequence_stats::sequence_id.eq(sequence))
                .first(conn)?;
            let history_id: Option<i64> = schema::google_accounts::table
                .filter(schema::google_accounts::user_id.eq(user))
                .select(schema::google_accounts::history_id)
                .first(conn)?;
            Ok((events, stats, history_id))
        })
        .await?
    };
    assert_eq!(reply_events, 1);
    assert_eq!(stats.replied_emails, 1);
    assert_eq!(history_id, Some(42));

    // Property: a duplicate push never double-counts.
    let body = push_body("owner-reply@example.com", 42);
    let response = app
        .post_json("/api/gmail/notifications", &body, Some(&token))
        .await?;
    assert_eq!(response.status(), StatusCode::OK);

    let tracking_id = seeded.tracking_id;
    let reply_events: i64 = app
        .with_conn(move |conn| {
            Ok(schema::email_events::table
                .filter(schema::email_events::email_tracking_id.eq(tracking_id))
                .filter(schema::email_events::event_type.eq(event_type::REPLIED))
                .count()
                .get_result(conn)?)
        })
        .await?;
    assert_eq!(reply_events, 1);

    Ok(())
}

#[tokio::test]
async fn bounce_marks_contact_and_stops_sending() -> Result<()> {
    let _lock = acquire_db_lock().await;
    let Some(app) = TestApp::try_new().await? else {
        return Ok(());
    };

    let seeded = seed_sent_thread(&app, "owner-bounce@example.com").await?;

    app.mailbox()
        .put_message(MessageSummary {
            id: "bounce-1".to_string(),
            thread_id: "t-1".to_string(),
            label_ids: vec!["INBOX".to_string()],
            headers: vec![
                (
                    "From".to_string(),
                    "Mail Delivery Subsystem <mailer-daemon@googlemail.com>".to_string(),
                ),
                ("Message-ID".to_string(), "<b1@googlemail.com>".to_string()),
                (
                    "X-Failed-Recipients".to_string(),
                    "replyer@ex.com".to_string(),
                ),
                (
                    "Content-Type".to_string(),
                    "multipart/report; report-type=delivery-status".to_string(),
                ),
            ],
        })
        .await;
    app.mailbox()
        .set_history(vec!["bounce-1".to_string()], Some(77))
        .await;

    let token = app.push_token()?;
    let body = push_body("owner-bounce@example.com", 77);
    let response = app
        .post_json("/api/gmail/notifications", &body, Some(&token))
        .await?;
    assert_eq!(response.status(), StatusCode::OK);
    let parsed: serde_json::Value =
        serde_json::from_slice(&body_to_vec(response.into_body()).await?)?;
    assert_eq!(parsed["bounces"], 1);

    let row = app.progress_row(seeded.sequence, seeded.contact).await?;
    assert_eq!(row.status, contact_status::BOUNCED);
    assert!(row.next_scheduled_at.is_none());

    let outcome = app.sweeper().tick().await?;
    assert_eq!(outcome.dispatched, 0);

    let (tracking, bounce_events, stats) = {
        let tracking_id = seeded.tracking_id;
        let sequence = seeded.sequence;
        app.with_conn(move |conn| {
            let tracking: EmailTracking =
                schema::email_tracking::table.find(tracking_id).first(conn)?;
            let events: i64 = schema::email_events::table
                .filter(schema::email_events::email_tracking_id.eq(tracking_id))
                .filter(schema::email_events::event_type.eq(event_type::BOUNCED))
                .count()
                .get_result(conn)?;
            let stats: SequenceStats = schema::sequence_stats::table
                .filter(schema::sequence_stats::sequence_id.eq(sequence))
                .first(conn)?;
            Ok((tracking, events, stats))
        })
        .await?
    };
    assert_eq!(tracking.status, tracking_status::BOUNCED);
    assert_eq!(bounce_events, 1);
    assert_eq!(stats.bounced_emails, 1);

    // Cooldown: the limiter refuses this contact for further sends.
    let check = app
        .state
        .limiter
        .check(seeded.user, Some(seeded.sequence), Some(seeded.contact))
        .await?;
    assert!(!check.allowed);

    Ok(())
}

#[tokio::test]
async fn own_sent_mail_is_not_a_reply() -> Result<()> {
    let _lock = acquire_db_lock().await;
    let Some(app) = TestApp::try_new().await? else {
        return Ok(());
    };

    let seeded = seed_sent_thread(&app, "owner-self@example.com").await?;

    app.mailbox()
        .put_message(MessageSummary {
            id: "own-1".to_string(),
            thread_id: "t-1".to_string(),
            label_ids: vec!["SENT".to_string()],
            headers: vec![
                (
                    "From".to_string(),
                    "Me <owner-self@example.com>".to_string(),
                ),
                ("Message-ID".to_string(), "<own1@example.com>".to_string()),
                (
                    "Content-Type".to_string(),
                    "text/html; charset=utf-8".to_string(),
                ),
            ],
        })
        .await;
    app.mailbox()
        .set_history(vec!["own-1".to_string()], Some(90))
        .await;

    let token = app.push_token()?;
    let body = push_body("owner-self@example.com", 90);
    let response = app
        .post_json("/api/gmail/notifications", &body, Some(&token))
        .await?;
    assert_eq!(response.status(), StatusCode::OK);

    let row = app.progress_row(seeded.sequence, seeded.contact).await?;
    assert_eq!(row.status, contact_status::SENT);

    let tracking_id = seeded.tracking_id;
    let reply_events: i64 = app
        .with_conn(move |conn| {
            Ok(schema::email_events::table
                .filter(schema::email_events::email_tracking_id.eq(tracking_id))
                .filter(schema::email_events::event_type.eq(event_type::REPLIED))
                .count()
                .get_result(conn)?)
        })
        .await?;
    assert_eq!(reply_events, 0);

    Ok(())
}
