//! HTTP surface of the gateway
//!
//! # Endpoints
//!
//! - `GET /` - liveness, returns `running {app_name}`
//! - `POST /api/line/webhook/{channel_id}/events` - platform callback ingress
//! - `GET /api/line/webhook/{channel_id}/messages/new` - poll ready messages
//! - `DELETE /api/line/webhook/{channel_id}/messages/{message_id}` - acknowledge
//!
//! Each request runs in a `request` span carrying a fresh request id.

use crate::queue::WebhookQueue;
use crate::store::LogStore;
use axum::extract::State;
use serde::Serialize;
use std::sync::Arc;

pub mod egress;
mod error;
pub mod ingress;

pub use egress::{delete_message, get_new_messages, NewMessagesResponse};
pub use error::{ApiError, ErrorBody};
pub use ingress::{post_events, HEADER_SIGNATURE};

/// Empty JSON object response body
#[derive(Debug, Serialize)]
pub struct Empty {}

/// Shared application state, passed to handlers via axum's `State` extractor
pub struct AppState<S> {
    inner: Arc<AppStateInner<S>>,
}

struct AppStateInner<S> {
    app_name: String,
    queue: WebhookQueue<S>,
}

impl<S> Clone for AppState<S> {
    fn clone(&self) -> Self {
        AppState {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<S: LogStore> AppState<S> {
    pub fn new(app_name: impl Into<String>, queue: WebhookQueue<S>) -> Self {
        AppState {
            inner: Arc::new(AppStateInner {
                app_name: app_name.into(),
                queue,
            }),
        }
    }

    pub fn app_name(&self) -> &str {
        &self.inner.app_name
    }

    pub fn queue(&self) -> &WebhookQueue<S> {
        &self.inner.queue
    }
}

async fn root<S: LogStore>(State(state): State<AppState<S>>) -> String {
    format!("running {}", state.app_name())
}

/// Builds the axum Router with all endpoints
pub fn build_router<S: LogStore>(state: AppState<S>) -> axum::Router {
    use axum::routing::{delete, get, post};

    axum::Router::new()
        .route("/", get(root::<S>))
        .route(
            "/api/line/webhook/{channel_id}/events",
            post(post_events::<S>),
        )
        .route(
            "/api/line/webhook/{channel_id}/messages/new",
            get(get_new_messages::<S>),
        )
        .route(
            "/api/line/webhook/{channel_id}/messages/{message_id}",
            delete(delete_message::<S>),
        )
        .with_state(state)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::SimulatedClock;
    use crate::store::InMemoryLogStore;
    use axum::body::Body;
    use axum::http::{Request, StatusCode};
    use http_body_util::BodyExt;
    use tower::ServiceExt;

    fn app() -> axum::Router {
        let store = Arc::new(InMemoryLogStore::new(SimulatedClock::new(1_000)));
        let queue = WebhookQueue::new(store, "line", "workers");
        build_router(AppState::new("gateway-test", queue))
    }

    #[tokio::test]
    async fn test_root_reports_app_name() {
        let response = app()
            .oneshot(Request::get("/").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let body = response.into_body().collect().await.unwrap().to_bytes();
        assert_eq!(&body[..], b"running gateway-test");
    }

    #[tokio::test]
    async fn test_unknown_route_is_404() {
        let response = app()
            .oneshot(Request::get("/nope").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }
}
