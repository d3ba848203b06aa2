//! Open API. `GET /api/open?code=…` mints a temporary key and activates it.

use std::sync::Arc;

use axum::extract::{Query, State};
use axum::http::{HeaderName, Method, StatusCode, header};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::{Json, Router};
use secrecy::{ExposeSecret, SecretString};
use serde::Deserialize;
use subtle::ConstantTimeEq;
use tower_http::cors::{AllowOrigin, CorsLayer};
use tracing::{error, info, warn};

use crate::domofon::KeyIssuer;

/// Shared state for the open route.
#[derive(Clone)]
pub struct OpenRouteState {
    pub issuer: Arc<dyn KeyIssuer>,
    pub secret_key: SecretString,
    pub key_id: i64,
}

#[derive(Debug, Deserialize)]
pub struct OpenQuery {
    code: Option<String>,
}

/// Constant-time comparison of the submitted code with the shared secret.
fn code_matches(code: &str, secret: &str) -> bool {
    code.as_bytes().ct_eq(secret.as_bytes()).into()
}

fn error_response(status: StatusCode, message: &str) -> Response {
    (status, Json(serde_json::json!({ "error": message }))).into_response()
}

/// GET /api/open
///
/// Requires `code` to equal the shared secret. On success the intercom key
/// is created and activated, and `{"success": true}` is returned.
async fn open_door(
    State(state): State<OpenRouteState>,
    Query(query): Query<OpenQuery>,
) -> Response {
    let Some(code) = query.code.filter(|c| !c.is_empty()) else {
        return error_response(StatusCode::BAD_REQUEST, "invalid request");
    };

    if !code_matches(&code, state.secret_key.expose_secret()) {
        warn!("Open request with wrong code");
        return error_response(StatusCode::BAD_REQUEST, "wrong code");
    }

    let link = match state.issuer.create_temporary_key(state.key_id).await {
        Ok(link) => link,
        Err(e) => {
            error!(key_id = state.key_id, "Failed to create temporary key: {e}");
            return error_response(
                StatusCode::INTERNAL_SERVER_ERROR,
                "internal server error on create key",
            );
        }
    };

    if let Err(e) = state.issuer.activate_key(&link).await {
        error!(key_id = state.key_id, "Failed to activate temporary key: {e}");
        return error_response(StatusCode::INTERNAL_SERVER_ERROR, "failed to activate key");
    }

    info!(key_id = state.key_id, "Door opened via API");
    Json(serde_json::json!({ "success": true })).into_response()
}

/// Permissive CORS: any origin is mirrored back and credentials are allowed.
fn cors() -> CorsLayer {
    CorsLayer::new()
        .allow_origin(AllowOrigin::mirror_request())
        .allow_credentials(true)
        .allow_methods([
            Method::GET,
            Method::POST,
            Method::PUT,
            Method::PATCH,
            Method::DELETE,
            Method::OPTIONS,
        ])
        .allow_headers([
            header::CONTENT_TYPE,
            header::CONTENT_LENGTH,
            header::ACCEPT_ENCODING,
            header::AUTHORIZATION,
            header::ACCEPT,
            header::ORIGIN,
            header::CACHE_CONTROL,
            HeaderName::from_static("x-csrf-token"),
            HeaderName::from_static("x-requested-with"),
        ])
}

/// Build the open route with CORS applied.
pub fn open_routes(state: OpenRouteState) -> Router {
    Router::new()
        .route("/api/open", get(open_door))
        .with_state(state)
        .layer(cors())
}
