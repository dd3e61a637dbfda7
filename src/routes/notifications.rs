use axum::{extract::State, Json};
use axum_extra::headers::{authorization::Bearer, Authorization};
use axum_extra::TypedHeader;
use serde_json::json;
use tracing::warn;

use crate::error::{AppError, AppResult};
use crate::inbound::{self, PushEnvelope};
use crate::state::AppState;

/// `POST /api/gmail/notifications`: Pub/Sub push endpoint.
/// 401 on a bad JWT, 404 when the address maps to no user.
pub async fn receive(
    State(state): State<AppState>,
    TypedHeader(Authorization(bearer)): TypedHeader<Authorization<Bearer>>,
    Json(envelope): Json<PushEnvelope>,
) -> AppResult<Json<serde_json::Value>> {
    state.push_verifier.verify(bearer.token())?;

    let (email_address, history_id) =
        inbound::decode_push(&envelope).map_err(|err| AppError::bad_request(err.to_string()))?;

    let outcome = inbound::process_notification(&state, &email_address, history_id)
        .await
        .map_err(|err| {
            warn!(error = %err, "push processing failed");
            AppError::internal(err)
        })?
        .ok_or_else(AppError::not_found)?;

    Ok(Json(json!({
        "success": true,
        "opens": outcome.opens,
        "replies": outcome.replies,
        "bounces": outcome.bounces,
    })))
}
