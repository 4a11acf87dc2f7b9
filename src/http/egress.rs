//! Worker-facing endpoints: poll ready messages, acknowledge finished ones

use super::{ApiError, AppState, Empty};
use crate::queue::{PollOptions, QueueError, WebhookMessage};
use crate::store::{EntryId, LogStore};
use axum::extract::{Path, Query, State};
use axum::Json;
use serde::{Deserialize, Serialize};
use std::str::FromStr;
use tracing::{debug, info, info_span, Instrument};
use uuid::Uuid;

/// Raw query string; numbers are parsed by hand so errors get the JSON body
#[derive(Debug, Default, Deserialize)]
pub struct NewMessagesQuery {
    pub consumer: Option<String>,
    pub max_count: Option<String>,
    pub max_idle_time_ms: Option<String>,
    pub max_delivery_count: Option<String>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct NewMessagesResponse {
    pub messages: Vec<WebhookMessage>,
}

fn parse_number<T: FromStr>(
    raw: &Option<String>,
    name: &'static str,
) -> Result<Option<T>, ApiError> {
    match raw.as_deref().map(str::trim) {
        None | Some("") => Ok(None),
        Some(s) => s.parse().map(Some).map_err(|_| ApiError::InvalidNumber(name)),
    }
}

impl NewMessagesQuery {
    /// Consumer plus poll options; zero idle time or delivery count means "default"
    fn into_options(self) -> Result<(String, PollOptions), ApiError> {
        let defaults = PollOptions::default();
        let max_count = parse_number::<usize>(&self.max_count, "max_count")?;
        let max_idle_time_ms = parse_number::<u64>(&self.max_idle_time_ms, "max_idle_time_ms")?
            .filter(|&ms| ms > 0)
            .unwrap_or(defaults.max_idle_time_ms);
        let max_delivery_count =
            parse_number::<u64>(&self.max_delivery_count, "max_delivery_count")?
                .filter(|&n| n > 0)
                .unwrap_or(defaults.max_delivery_count);
        let consumer = self
            .consumer
            .filter(|c| !c.is_empty())
            .ok_or(ApiError::MissingParam("consumer"))?;

        Ok((
            consumer,
            PollOptions {
                max_count,
                max_idle_time_ms,
                max_delivery_count,
            },
        ))
    }
}

/// `GET /api/line/webhook/{channel_id}/messages/new`
///
/// Query: `consumer` (required), `max_count`, `max_idle_time_ms` (default
/// 60000), `max_delivery_count` (default 3).
pub async fn get_new_messages<S: LogStore>(
    State(state): State<AppState<S>>,
    Path(channel_id): Path<String>,
    Query(query): Query<NewMessagesQuery>,
) -> Result<Json<NewMessagesResponse>, ApiError> {
    let request_id = Uuid::new_v4();
    let span = info_span!("request", request_id = %request_id, channel_id = %channel_id);

    async move {
        let (consumer, options) = query.into_options()?;
        info!(
            consumer = %consumer,
            max_count = ?options.max_count,
            max_idle_time_ms = options.max_idle_time_ms,
            max_delivery_count = options.max_delivery_count,
            "received poll"
        );

        let messages = state
            .queue()
            .poll_ready(&channel_id, &consumer, options)
            .await?;
        debug!(count = messages.len(), "returning messages");
        Ok(Json(NewMessagesResponse { messages }))
    }
    .instrument(span)
    .await
}

/// `DELETE /api/line/webhook/{channel_id}/messages/{message_id}`
///
/// - 200 `{}`: acknowledged and removed
/// - 404: not pending or already gone
pub async fn delete_message<S: LogStore>(
    State(state): State<AppState<S>>,
    Path((channel_id, message_id)): Path<(String, String)>,
) -> Result<Json<Empty>, ApiError> {
    let request_id = Uuid::new_v4();
    let span = info_span!("request", request_id = %request_id, channel_id = %channel_id);

    async move {
        info!(message_id = %message_id, "received delete");
        let entry_id: EntryId = message_id
            .parse()
            .map_err(QueueError::from)?;
        state
            .queue()
            .acknowledge_and_remove(&channel_id, entry_id)
            .await?;
        debug!(entry_id = %entry_id, "deleted message");
        Ok(Json(Empty {}))
    }
    .instrument(span)
    .await
}

#[cfg(test)]
mod tests {
    use super::*;

    fn query(pairs: &[(&str, &str)]) -> NewMessagesQuery {
        let mut q = NewMessagesQuery::default();
        for (k, v) in pairs {
            let v = Some(v.to_string());
            match *k {
                "consumer" => q.consumer = v,
                "max_count" => q.max_count = v,
                "max_idle_time_ms" => q.max_idle_time_ms = v,
                "max_delivery_count" => q.max_delivery_count = v,
                _ => unreachable!(),
            }
        }
        q
    }

    #[test]
    fn test_defaults() {
        let (consumer, options) = query(&[("consumer", "w1")]).into_options().unwrap();
        assert_eq!(consumer, "w1");
        assert_eq!(options, PollOptions::default());
    }

    #[test]
    fn test_zero_falls_back_to_defaults() {
        let (_, options) = query(&[
            ("consumer", "w1"),
            ("max_idle_time_ms", "0"),
            ("max_delivery_count", "0"),
            ("max_count", "0"),
        ])
        .into_options()
        .unwrap();
        assert_eq!(options.max_idle_time_ms, 60_000);
        assert_eq!(options.max_delivery_count, 3);
        assert_eq!(options.max_count, Some(0));
    }

    #[test]
    fn test_consumer_required() {
        let err = query(&[("max_count", "1")]).into_options().unwrap_err();
        assert!(matches!(err, ApiError::MissingParam("consumer")));
        let err = query(&[("consumer", "")]).into_options().unwrap_err();
        assert!(matches!(err, ApiError::MissingParam("consumer")));
    }

    #[test]
    fn test_bad_number() {
        let err = query(&[("consumer", "w1"), ("max_count", "ten")])
            .into_options()
            .unwrap_err();
        assert!(matches!(err, ApiError::InvalidNumber("max_count")));
    }
}
