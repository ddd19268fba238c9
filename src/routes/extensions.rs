use std::convert::Infallible;

use axum::{
    extract::{Query, State},
    response::sse::{Event, KeepAlive, Sse},
    routing::get,
    Json, Router,
};
use futures_core::Stream;
use serde_json::{json, Value};
use tokio_stream::{wrappers::WatchStream, StreamExt};

use crate::{
    error::AppResult,
    schemas::{validate_input, ExtensionStatusQuery},
    state::AppState,
};

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/extensions/status", get(extension_status))
        .route("/extensions/stream", get(extension_stream))
}

async fn extension_status(
    State(state): State<AppState>,
    Query(query): Query<ExtensionStatusQuery>,
) -> AppResult<Json<Value>> {
    validate_input(&query)?;
    let owner_id = query.owner_id.trim();
    let open_count = state.extension_alerts.snapshot().open_count(owner_id);
    Ok(Json(status_payload(owner_id, open_count)))
}

/// Emits the owner's status immediately, then again whenever their open
/// count changes.
async fn extension_stream(
    State(state): State<AppState>,
    Query(query): Query<ExtensionStatusQuery>,
) -> AppResult<Sse<impl Stream<Item = Result<Event, Infallible>>>> {
    validate_input(&query)?;
    let owner_id = query.owner_id.trim().to_string();
    tracing::info!(owner_id = %owner_id, "Extension status stream opened");

    let mut last_count: Option<usize> = None;
    let stream = WatchStream::new(state.extension_alerts.subscribe()).filter_map(move |snapshot| {
        let count = snapshot.open_count(&owner_id);
        if last_count == Some(count) {
            return None;
        }
        last_count = Some(count);
        let payload = status_payload(&owner_id, count);
        Some(Ok(Event::default()
            .event("extension_status")
            .data(payload.to_string())))
    });

    Ok(Sse::new(stream).keep_alive(KeepAlive::default()))
}

fn status_payload(owner_id: &str, open_count: usize) -> Value {
    json!({
        "owner_id": owner_id,
        "has_open_extensions": open_count > 0,
        "open_count": open_count,
    })
}

#[cfg(test)]
mod tests {
    use axum::{
        body::{to_bytes, Body},
        http::{Request, StatusCode},
    };
    use serde_json::{json, Value};
    use tower::ServiceExt;

    use super::router;
    use crate::{config::AppConfig, state::AppState};

    #[tokio::test]
    async fn reports_open_requests_for_owner() {
        let state = AppState::with_pool(AppConfig::default(), None);
        state.extension_alerts.seed(&[
            json!({ "id": "r1", "landlord_id": "owner-a", "status": "pending" }),
            json!({ "id": "r2", "landlord_id": "owner-a", "status": "pending" }),
        ]);
        let app = router().with_state(state);

        let response = app
            .clone()
            .oneshot(
                Request::builder()
                    .uri("/extensions/status?owner_id=owner-a")
                    .body(Body::empty())
                    .expect("valid request"),
            )
            .await
            .expect("infallible service");
        assert_eq!(response.status(), StatusCode::OK);
        let bytes = to_bytes(response.into_body(), usize::MAX)
            .await
            .expect("readable body");
        let body: Value = serde_json::from_slice(&bytes).expect("json body");
        assert_eq!(body["has_open_extensions"], true);
        assert_eq!(body["open_count"], 2);

        let response = app
            .oneshot(
                Request::builder()
                    .uri("/extensions/status?owner_id=owner-b")
                    .body(Body::empty())
                    .expect("valid request"),
            )
            .await
            .expect("infallible service");
        let bytes = to_bytes(response.into_body(), usize::MAX)
            .await
            .expect("readable body");
        let body: Value = serde_json::from_slice(&bytes).expect("json body");
        assert_eq!(body["has_open_extensions"], false);
    }

    #[tokio::test]
    async fn stream_responds_with_event_stream() {
        let app = router().with_state(AppState::with_pool(AppConfig::default(), None));
        let response = app
            .oneshot(
                Request::builder()
                    .uri("/extensions/stream?owner_id=owner-a")
                    .body(Body::empty())
                    .expect("valid request"),
            )
            .await
            .expect("infallible service");
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(
            response
                .headers()
                .get("content-type")
                .and_then(|value| value.to_str().ok()),
            Some("text/event-stream")
        );
    }
}
