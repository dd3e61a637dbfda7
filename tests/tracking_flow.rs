mod common;

use anyhow::Result;
use axum::http::StatusCode;
use cadence::models::*;
use cadence::schema;
use chrono::Utc;
use common::{acquire_db_lock, body_to_vec, TestApp};
use diesel::prelude::*;
use serde_json::json;
use uuid::Uuid;

struct Seeded {
    sequence: Uuid,
    hash: String,
    tracking_id: Uuid,
    link_id: Uuid,
}

async fn seed_tracking(app: &TestApp) -> Result<Seeded> {
    let user = app.insert_user("tracker@example.com").await?;
    let sequence = app.insert_sequence(user, "Tracked").await?;
    let step = app
        .insert_step(
            sequence,
            0,
            step_timing::IMMEDIATE,
            None,
            "Hi",
            "<p>Hi</p>",
            false,
        )
        .await?;
    let contact = app.insert_contact(user, "t@ex.com").await?;

    let hash = Uuid::new_v4().simple().to_string();
    let hash_for_insert = hash.clone();
    let (tracking_id, link_id) = app
        .with_conn(move |conn| {
            let tracking = NewEmailTracking {
                id: Uuid::new_v4(),
                user_id: user,
                hash: hash_for_insert,
                message_id: Some("<m1@mail.gmail.com>".to_string()),
                thread_id: Some("t-1".to_string()),
                status: tracking_status::SENT.to_string(),
                sent_at: Some(Utc::now().naive_utc()),
                metadata: json!({
                    "email": "t@ex.com",
                    "userId": user,
                    "sequenceId": sequence,
                    "stepId": step,
                    "contactId": contact,
                }),
            };
            diesel::insert_into(schema::email_tracking::table)
                .values(&tracking)
                .execute(conn)?;

            let link = NewTrackedLink {
                id: Uuid::new_v4(),
                email_tracking_id: tracking.id,
                original_url: "https://example.com/pricing".to_string(),
            };
            diesel::insert_into(schema::tracked_links::table)
                .values(&link)
                .execute(conn)?;
            Ok((tracking.id, link.id))
        })
        .await?;

    Ok(Seeded {
        sequence,
        hash,
        tracking_id,
        link_id,
    })
}

#[tokio::test]
async fn open_pixel_counts_every_hit_but_unique_once() -> Result<()> {
    let _lock = acquire_db_lock().await;
    let Some(app) = TestApp::try_new().await? else {
        return Ok(());
    };
    let seeded = seed_tracking(&app).await?;

    let response = app.get(&format!("/api/track/{}.png", seeded.hash)).await?;
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(
        response.headers().get("content-type").unwrap(),
        "image/gif"
    );
    assert_eq!(
        response.headers().get("cache-control").unwrap(),
        "max-age=60, private"
    );
    let body = body_to_vec(response.into_body()).await?;
    assert_eq!(body.len(), 43);

    let first_opened_at = {
        let tracking_id = seeded.tracking_id;
        let tracking: EmailTracking = app
            .with_conn(move |conn| {
                Ok(schema::email_tracking::table
                    .find(tracking_id)
                    .first(conn)?)
            })
            .await?;
        assert_eq!(tracking.open_count, 1);
        assert!(tracking.opened_at.is_some());
        tracking.opened_at
    };

    // Second open: count rises, uniqueness does not.
    let response = app.get(&format!("/api/track/{}.png", seeded.hash)).await?;
    assert_eq!(response.status(), StatusCode::OK);

    let (tracking, stats) = {
        let tracking_id = seeded.tracking_id;
        let sequence = seeded.sequence;
        app.with_conn(move |conn| {
            let tracking: EmailTracking =
                schema::email_tracking::table.find(tracking_id).first(conn)?;
            let stats: SequenceStats = schema::sequence_stats::table
                .filter(schema::sequence_stats::sequence_id.eq(sequence))
                .first(conn)?;
            Ok((tracking, stats))
        })
        .await?
    };
    assert_eq!(tracking.open_count, 2);
    assert_eq!(tracking.opened_at, first_opened_at);
    assert_eq!(stats.opened_emails, 2);
    assert_eq!(stats.unique_opens, 1);

    Ok(())
}

#[tokio::test]
async fn gmail_compose_referer_is_not_counted() -> Result<()> {
    let _lock = acquire_db_lock().await;
    let Some(app) = TestApp::try_new().await? else {
        return Ok(());
    };
    let seeded = seed_tracking(&app).await?;

    let response = app
        .get_with_headers(
            &format!("/api/track/{}.png", seeded.hash),
            &[("referer", "https://mail.google.com/mail/u/0/?compose=new")],
        )
        .await?;
    assert_eq!(response.status(), StatusCode::TEMPORARY_REDIRECT);

    let tracking_id = seeded.tracking_id;
    let tracking: EmailTracking = app
        .with_conn(move |conn| {
            Ok(schema::email_tracking::table
                .find(tracking_id)
                .first(conn)?)
        })
        .await?;
    assert_eq!(tracking.open_count, 0);
    assert!(tracking.opened_at.is_none());

    Ok(())
}

#[tokio::test]
async fn click_redirects_to_original_url() -> Result<()> {
    let _lock = acquire_db_lock().await;
    let Some(app) = TestApp::try_new().await? else {
        return Ok(());
    };
    let seeded = seed_tracking(&app).await?;

    let response = app
        .get(&format!(
            "/api/track/{}/click?lid={}",
            seeded.hash, seeded.link_id
        ))
        .await?;
    assert_eq!(response.status(), StatusCode::FOUND);
    assert_eq!(
        response.headers().get("location").unwrap(),
        "https://example.com/pricing"
    );

    let (link, clicks, stats) = {
        let link_id = seeded.link_id;
        let sequence = seeded.sequence;
        app.with_conn(move |conn| {
            let link: TrackedLink = schema::tracked_links::table.find(link_id).first(conn)?;
            let clicks: i64 = schema::link_clicks::table
                .filter(schema::link_clicks::tracked_link_id.eq(link_id))
                .count()
                .get_result(conn)?;
            let stats: SequenceStats = schema::sequence_stats::table
                .filter(schema::sequence_stats::sequence_id.eq(sequence))
                .first(conn)?;
            Ok((link, clicks, stats))
        })
        .await?
    };
    assert_eq!(link.click_count, 1);
    assert_eq!(clicks, 1);
    assert_eq!(stats.clicked_emails, 1);

    Ok(())
}

#[tokio::test]
async fn click_without_or_with_unknown_lid_is_rejected() -> Result<()> {
    let _lock = acquire_db_lock().await;
    let Some(app) = TestApp::try_new().await? else {
        return Ok(());
    };
    let seeded = seed_tracking(&app).await?;

    let response = app
        .get(&format!("/api/track/{}/click", seeded.hash))
        .await?;
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);

    let response = app
        .get(&format!(
            "/api/track/{}/click?lid={}",
            seeded.hash,
            Uuid::new_v4()
        ))
        .await?;
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);

    // Nothing counted on the rejected attempts.
    let link_id = seeded.link_id;
    let link: TrackedLink = app
        .with_conn(move |conn| Ok(schema::tracked_links::table.find(link_id).first(conn)?))
        .await?;
    assert_eq!(link.click_count, 0);

    Ok(())
}
