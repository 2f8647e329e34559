use crate::db::NewInboundMessage;
use crate::server::RelayState;
use axum::body::Bytes;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::post;
use axum::{Extension, Json};
use std::sync::Arc;
use wa_gateway::EvolutionWebhook;

pub fn router() -> axum::Router {
    axum::Router::new().route("/webhooks/evolution", post(evolution_webhook))
}

/// Store one Evolution event and schedule a pass for its chat.
///
/// Only a bad `apikey` or a storage failure yields a non-2xx status;
/// everything else is acknowledged so the gateway does not keep retrying.
#[tracing::instrument(level = "info", skip_all)]
async fn evolution_webhook(
    Extension(state): Extension<Arc<RelayState>>,
    body: Bytes,
) -> Response {
    let value: serde_json::Value = match serde_json::from_slice(&body) {
        Ok(value) => value,
        Err(e) => {
            tracing::warn!(error = %e, body_bytes = body.len(), "webhook body is not json");
            return Json(serde_json::json!({ "ok": false, "error": "invalid json" }))
                .into_response();
        }
    };
    let payload: EvolutionWebhook = match serde_json::from_value(value) {
        Ok(payload) => payload,
        Err(e) => {
            tracing::debug!(error = %e, "webhook payload has unexpected shape");
            return ignored();
        }
    };

    if let Some(expected) = state.webhook_api_key.as_deref() {
        let provided = payload.apikey.as_deref().map(str::trim).unwrap_or_default();
        if !constant_time_eq(provided, expected) {
            tracing::warn!(event = %payload.event, "webhook apikey mismatch");
            return (
                StatusCode::UNAUTHORIZED,
                Json(serde_json::json!({ "ok": false, "error": "unauthorized" })),
            )
                .into_response();
        }
    }

    let Some(message) = payload.message() else {
        tracing::debug!(event = %payload.event, "webhook event ignored");
        return ignored();
    };

    let record = NewInboundMessage {
        chat_id: message.chat_id.clone(),
        message_id: message.message_id.clone(),
        text: message.text,
        origin: message.origin,
        gateway_timestamp: message.timestamp,
        received_at: state.clock.now(),
    };
    let inserted = match state.store.insert_inbound(&record).await {
        Ok(inserted) => inserted,
        Err(e) => {
            tracing::error!(
                chat_id = %record.chat_id,
                message_id = %record.message_id,
                error = %format!("{e:#}"),
                "failed to store inbound message"
            );
            return (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(serde_json::json!({ "ok": false, "error": "storage unavailable" })),
            )
                .into_response();
        }
    };
    if !inserted {
        tracing::info!(
            chat_id = %record.chat_id,
            message_id = %record.message_id,
            "duplicate message ignored"
        );
        return Json(serde_json::json!({ "ok": true, "action": "duplicate" })).into_response();
    }

    tracing::info!(
        chat_id = %record.chat_id,
        message_id = %record.message_id,
        sender = %message.sender,
        from_me = record.origin.is_from_me(),
        is_group = message.is_group,
        text_chars = record.text.chars().count(),
        "inbound message stored"
    );
    if !state.processor.spawn_pass(&state.tasks, record.chat_id) {
        tracing::debug!(message_id = %record.message_id, "joined the chat's waiting pass");
    }
    Json(serde_json::json!({ "ok": true, "action": "queued" })).into_response()
}

fn ignored() -> Response {
    Json(serde_json::json!({ "ok": true, "action": "ignored" })).into_response()
}

fn constant_time_eq(left: &str, right: &str) -> bool {
    let left_bytes = left.as_bytes();
    let right_bytes = right.as_bytes();
    let mut diff = left_bytes.len() ^ right_bytes.len();
    let max_len = left_bytes.len().max(right_bytes.len());
    for index in 0..max_len {
        let l = left_bytes.get(index).copied().unwrap_or(0);
        let r = right_bytes.get(index).copied().unwrap_or(0);
        diff |= (l ^ r) as usize;
    }
    diff == 0
}
