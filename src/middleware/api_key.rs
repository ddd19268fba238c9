use axum::{
    extract::{Request, State},
    http::Method,
    middleware::Next,
    response::{IntoResponse, Response},
};
use subtle::ConstantTimeEq;

use crate::{error::AppError, state::AppState};

pub const API_KEY_HEADER: &str = "x-api-key";

/// Rejects requests without the configured `x-api-key`. Health checks and
/// CORS preflights pass through; with no key configured every request does.
pub async fn enforce_api_key(
    State(state): State<AppState>,
    request: Request,
    next: Next,
) -> Response {
    let Some(expected) = state.config.internal_api_key.as_deref() else {
        return next.run(request).await;
    };
    if request.method() == Method::OPTIONS || request.uri().path().ends_with("/health") {
        return next.run(request).await;
    }

    let provided = request
        .headers()
        .get(API_KEY_HEADER)
        .and_then(|value| value.to_str().ok())
        .map(str::trim);

    if provided.is_some_and(|key| keys_match(key, expected)) {
        return next.run(request).await;
    }

    tracing::warn!(
        path = %request.uri().path(),
        has_key = provided.is_some(),
        "Rejected request with missing or invalid API key"
    );
    AppError::Unauthorized("Missing or invalid API key.".to_string()).into_response()
}

/// Constant-time for keys of equal length.
fn keys_match(provided: &str, expected: &str) -> bool {
    provided.as_bytes().ct_eq(expected.as_bytes()).into()
}
