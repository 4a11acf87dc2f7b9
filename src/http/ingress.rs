//! Webhook ingress
//!
//! The messaging platform posts callbacks here. The body is stored as-is
//! together with its signature header; verifying the signature needs the
//! channel secret and is the worker's job.

use super::{ApiError, AppState, Empty};
use crate::queue::WebhookStreamObject;
use crate::store::LogStore;
use axum::body::Bytes;
use axum::extract::{Path, State};
use axum::http::HeaderMap;
use axum::Json;
use serde::Deserialize;
use tracing::{debug, info, info_span, Instrument};
use uuid::Uuid;

pub const HEADER_SIGNATURE: &str = "x-line-signature";

/// Platform callback body
#[derive(Debug, Deserialize)]
pub struct CallbackRequest {
    pub destination: String,
    #[serde(default)]
    pub events: Vec<serde_json::Value>,
}

/// `POST /api/line/webhook/{channel_id}/events`
///
/// - 200 `{}`: appended to the channel's stream
/// - 400: missing signature, malformed body or channel id
/// - 500: store unavailable
pub async fn post_events<S: LogStore>(
    State(state): State<AppState<S>>,
    Path(channel_id): Path<String>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Json<Empty>, ApiError> {
    let request_id = Uuid::new_v4().to_string();
    let span = info_span!("request", request_id = %request_id, channel_id = %channel_id);

    async move {
        let signature = headers
            .get(HEADER_SIGNATURE)
            .and_then(|v| v.to_str().ok())
            .filter(|s| !s.is_empty())
            .ok_or(ApiError::MissingHeader(HEADER_SIGNATURE))?
            .to_string();

        let callback: CallbackRequest = serde_json::from_slice(&body)?;
        info!(events = callback.events.len(), "received webhook");

        let object = WebhookStreamObject {
            request_id,
            signature,
            destination: callback.destination,
            events: callback.events,
        };
        let id = state.queue().enqueue(&channel_id, &object).await?;
        debug!(entry_id = %id, "webhook queued");
        Ok(Json(Empty {}))
    }
    .instrument(span)
    .await
}
