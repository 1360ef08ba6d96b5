//! HTTP surface of the recommendation engine.

use std::path::Path;
use std::sync::Arc;

use axum::Router;
use axum::extract::{Query, State};
use axum::http::{Method, StatusCode, header};
use axum::response::{IntoResponse, Json, Response};
use axum::routing::get;
use serde::Deserialize;
use tower::ServiceBuilder;
use tower_http::cors::{Any, CorsLayer};
use tower_http::services::{ServeDir, ServeFile};
use tower_http::trace::TraceLayer;

use crate::recommend::{DEFAULT_LIMIT, MAX_LIMIT, RecommendError, RecommendationEngine};

#[derive(Clone)]
struct ApiState {
    engine: Arc<RecommendationEngine>,
}

/// Builds the API router. Static assets are served from `static_dir` when it
/// contains an `index.html`.
pub fn router(engine: RecommendationEngine, static_dir: Option<&Path>) -> Router {
    let state = ApiState {
        engine: Arc::new(engine),
    };

    let mut app = Router::new()
        .route("/healthz", get(|| async { "ok\n" }))
        .route("/api/v1/recommendation", get(recommendation))
        .with_state(state);

    if let Some(dir) = static_dir {
        let index = dir.join("index.html");
        if index.exists() {
            app = app
                .route_service("/", ServeFile::new(index))
                .nest_service("/static", ServeDir::new(dir));
        } else {
            tracing::debug!(dir = %dir.display(), "no index.html; static assets disabled");
        }
    }

    app.layer(
        ServiceBuilder::new().layer(TraceLayer::new_for_http()).layer(
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods([Method::GET])
                .allow_headers(Any),
        ),
    )
}

/// Numbers arrive as strings so unparseable values fall back to defaults
/// instead of rejecting the request.
#[derive(Debug, Default, Deserialize)]
struct RecommendationQuery {
    id: Option<String>,
    limit: Option<String>,
    offset: Option<String>,
    callback: Option<String>,
}

async fn recommendation(
    State(state): State<ApiState>,
    Query(query): Query<RecommendationQuery>,
) -> Response {
    let limit = number_or(query.limit.as_deref(), DEFAULT_LIMIT as i64);
    if !(0..=MAX_LIMIT as i64).contains(&limit) {
        return bad_request(format!("limit must be <= {MAX_LIMIT} && >= 0"));
    }
    let offset = number_or(query.offset.as_deref(), 0);
    if offset < 0 {
        return bad_request("offset must be >= 0".to_owned());
    }

    let callback = query
        .callback
        .as_deref()
        .map(str::trim)
        .filter(|name| !name.is_empty());
    if let Some(name) = callback {
        if !is_callback_name(name) {
            return bad_request("callback must be a javascript identifier".to_owned());
        }
    }

    let Some(id) = query.id.as_deref().map(str::trim).filter(|id| !id.is_empty()) else {
        return bad_request("id is required".to_owned());
    };

    let result = state
        .engine
        .recommend_ids(id, limit as usize, offset as usize)
        .await;
    let rec = match result {
        Ok(rec) => rec,
        Err(RecommendError::NotFound(what)) => {
            tracing::debug!(id, %what, "recommendation seed not found");
            return (StatusCode::NOT_FOUND, format!("story not found: {what}")).into_response();
        }
        Err(err) => {
            tracing::error!(id, error = %err, "recommendation failed");
            return (StatusCode::INTERNAL_SERVER_ERROR, err.to_string()).into_response();
        }
    };

    let Some(name) = callback else {
        return Json(rec).into_response();
    };
    match serde_json::to_string(&rec) {
        Ok(json) => (
            [(header::CONTENT_TYPE, "text/plain; charset=utf-8")],
            format!("{name}({json})"),
        )
            .into_response(),
        Err(err) => (StatusCode::INTERNAL_SERVER_ERROR, err.to_string()).into_response(),
    }
}

fn number_or(raw: Option<&str>, default: i64) -> i64 {
    raw.and_then(|value| value.trim().parse::<i64>().ok())
        .unwrap_or(default)
}

fn bad_request(message: String) -> Response {
    (StatusCode::BAD_REQUEST, message).into_response()
}

/// `cb`, `jQuery123_456`, `app.handlers.recs`: dotted javascript identifiers.
fn is_callback_name(name: &str) -> bool {
    name.split('.').all(|part| {
        let mut chars = part.chars();
        chars
            .next()
            .is_some_and(|c| c.is_ascii_alphabetic() || c == '_' || c == '$')
            && chars.all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '$')
    })
}
