use axum::{
    extract::{Path, Query, State},
    http::{header, HeaderMap, StatusCode},
    response::{IntoResponse, Redirect, Response},
};
use serde::Deserialize;
use tracing::debug;
use uuid::Uuid;

use crate::error::{AppError, AppResult};
use crate::events;
use crate::state::AppState;
use crate::tracking::PIXEL_GIF;

/// `GET /api/track/{hash}.png`: the open pixel.
///
/// Sender-side loads (Gmail compose preview, Google backend fetchers)
/// get a 307 back to themselves and are not counted.
pub async fn open_pixel(
    State(state): State<AppState>,
    Path(hash_png): Path<String>,
    headers: HeaderMap,
) -> AppResult<Response> {
    let hash = hash_png.strip_suffix(".png").unwrap_or(hash_png.as_str());

    if is_sender_side_fetch(&headers) {
        return Ok(
            Redirect::temporary(&format!("/api/track/{hash}.png")).into_response(),
        );
    }

    let mut conn = state.db()?;
    match events::register_open(&mut conn, hash)? {
        Some((tracking, first_open)) => {
            debug!(hash, open_count = tracking.open_count, first_open, "open recorded");
        }
        None => {
            debug!(hash, "open pixel requested for unknown hash");
        }
    }

    Ok((
        StatusCode::OK,
        [
            (header::CONTENT_TYPE, "image/gif"),
            (header::CACHE_CONTROL, "max-age=60, private"),
        ],
        PIXEL_GIF.to_vec(),
    )
        .into_response())
}

#[derive(Deserialize)]
pub struct ClickQuery {
    pub lid: Option<Uuid>,
}

/// `GET /api/track/{hash}/click?lid={linkId}`: click-through redirect.
/// A missing or unknown link id is a 400, never a silent count.
pub async fn click(
    State(state): State<AppState>,
    Path(hash): Path<String>,
    Query(query): Query<ClickQuery>,
) -> AppResult<Response> {
    let link_id = query
        .lid
        .ok_or_else(|| AppError::bad_request("missing lid parameter"))?;

    let mut conn = state.db()?;
    let link = events::register_click(&mut conn, &hash, link_id)?
        .ok_or_else(|| AppError::bad_request("unknown link"))?;

    // Redirect::to would answer 303; the click contract is a plain 302.
    Ok((
        StatusCode::FOUND,
        [(header::LOCATION, link.original_url.clone())],
    )
        .into_response())
}

fn is_sender_side_fetch(headers: &HeaderMap) -> bool {
    let referer = headers
        .get(header::REFERER)
        .and_then(|value| value.to_str().ok())
        .unwrap_or_default();
    if referer.contains("mail.google.com") {
        return true;
    }

    let user_agent = headers
        .get(header::USER_AGENT)
        .and_then(|value| value.to_str().ok())
        .unwrap_or_default()
        .to_ascii_lowercase();
    user_agent.contains("googlebot") || user_agent.contains("google-read-aloud")
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;

    #[test]
    fn gmail_referer_is_sender_side() {
        let mut headers = HeaderMap::new();
        headers.insert(
            header::REFERER,
            HeaderValue::from_static("https://mail.google.com/mail/u/0/#inbox?compose=new"),
        );
        assert!(is_sender_side_fetch(&headers));
    }

    #[test]
    fn image_proxy_fetch_is_counted() {
        let mut headers = HeaderMap::new();
        headers.insert(
            header::USER_AGENT,
            HeaderValue::from_static(
                "Mozilla/5.0 (Windows NT 5.1; rv:11.0) Gecko Firefox/11.0 (via ggpht.com GoogleImageProxy)",
            ),
        );
        assert!(!is_sender_side_fetch(&headers));
    }

    #[test]
    fn googlebot_is_sender_side() {
        let mut headers = HeaderMap::new();
        headers.insert(
            header::USER_AGENT,
            HeaderValue::from_static("Mozilla/5.0 (compatible; Googlebot/2.1)"),
        );
        assert!(is_sender_side_fetch(&headers));
    }

    #[test]
    fn plain_browser_is_counted() {
        let mut headers = HeaderMap::new();
        headers.insert(
            header::USER_AGENT,
            HeaderValue::from_static("Mozilla/5.0 (Macintosh; Intel Mac OS X)"),
        );
        assert!(!is_sender_side_fetch(&headers));
    }
}
