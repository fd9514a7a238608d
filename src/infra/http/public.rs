use std::sync::Arc;

use axum::{
    Json, Router,
    body::Body,
    extract::{Query, RawQuery, State},
    http::{HeaderMap, HeaderValue, Request, StatusCode, Uri},
    middleware,
    response::{IntoResponse, Response},
    routing::get,
};
use serde::Deserialize;
use serde_json::json;
use tower_http::cors::{Any, CorsLayer};
use tracing::warn;

use crate::{
    application::{
        backend::SessionRegistry,
        error::HttpError,
        readiness::{Readiness, readiness},
        resolve::show_code_requested,
    },
    cache::{
        Served, ServingState, artifact::read_cached_html, autoswitch_layer, cached_snapshot_layer,
        html_response,
    },
    config::ServingMode,
    infra::proxy::LiveBackend,
};

use super::{
    connections::ConnectionCounter,
    middleware::{log_responses, set_request_context},
};

const SOURCE: &str = "infra::http::public";

#[derive(Clone)]
pub struct HttpState {
    pub serving: ServingState,
    pub live: Arc<dyn LiveBackend>,
    pub sessions: Arc<dyn SessionRegistry>,
    pub connections: ConnectionCounter,
    pub mode: ServingMode,
    /// Normalized: `/` or `/prefix` without a trailing slash.
    pub base_url: String,
    pub debug_cached: bool,
    pub allow_origins: Vec<String>,
}

impl HttpState {
    fn root(&self) -> &str {
        self.base_url.trim_end_matches('/')
    }

    /// Path of the readiness endpoint as seen by browsers.
    pub fn ready_path(base_url: &str) -> String {
        format!("{}/_api/ready", base_url.trim_end_matches('/'))
    }
}

pub fn build_router(state: HttpState) -> Router {
    let root = state.root().to_string();

    let mut gateway_routes = Router::new()
        .route(&format!("{root}/_health"), get(health))
        .route(&format!("{root}/_api/status/connections"), get(connections))
        .route(&format!("{root}/_api/ready"), get(ready));
    if state.debug_cached {
        gateway_routes = gateway_routes.route(&format!("{root}/_cached/{{*path}}"), get(cached_export));
    }

    // Everything else belongs to the live backend, seen through the serving layer.
    let live_routes = Router::new().fallback(forward_to_live);
    let live_routes = match state.mode {
        ServingMode::Hybrid => live_routes.layer(middleware::from_fn_with_state(
            state.serving.clone(),
            cached_snapshot_layer,
        )),
        ServingMode::Autoswitch => live_routes.layer(middleware::from_fn_with_state(
            state.serving.clone(),
            autoswitch_layer,
        )),
    };

    let cors = cors_layer(&state.allow_origins);
    let resolver = state.serving.resolver.clone();
    gateway_routes
        .fallback_service(live_routes.with_state(state.clone()))
        .with_state(state)
        .layer(cors)
        .layer(middleware::from_fn(log_responses))
        .layer(middleware::from_fn_with_state(resolver, set_request_context))
}

fn cors_layer(allow_origins: &[String]) -> CorsLayer {
    let layer = CorsLayer::new().allow_methods(Any).allow_headers(Any);
    if allow_origins.is_empty() {
        return layer.allow_origin(Any);
    }

    let origins: Vec<HeaderValue> = allow_origins
        .iter()
        .filter_map(|origin| match HeaderValue::from_str(origin) {
            Ok(value) => Some(value),
            Err(err) => {
                warn!(
                    target = "marimo_gateway::http",
                    origin = %origin,
                    error = %err,
                    "Ignoring invalid CORS origin"
                );
                None
            }
        })
        .collect();
    layer.allow_origin(origins)
}

async fn forward_to_live(State(state): State<HttpState>, request: Request<Body>) -> Response {
    let mut response = state.live.forward(request).await;
    response.extensions_mut().insert(Served::Live);
    response
}

async fn health() -> Json<serde_json::Value> {
    Json(json!({ "status": "healthy" }))
}

async fn connections(State(state): State<HttpState>) -> Json<serde_json::Value> {
    Json(json!({ "active": state.connections.active() }))
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct ReadyQuery {
    path: Option<String>,
    session_id: Option<String>,
}

async fn ready(State(state): State<HttpState>, Query(query): Query<ReadyQuery>) -> Response {
    let document = query
        .path
        .as_deref()
        .and_then(|path| state.serving.resolver.resolve(path));
    let status: Readiness = readiness(
        state.sessions.as_ref(),
        query.session_id.as_deref(),
        document.as_ref().map(|doc| doc.as_path()),
    );

    let mut response = Json(status).into_response();
    response
        .headers_mut()
        .insert(axum::http::header::CACHE_CONTROL, HeaderValue::from_static("no-store"));
    response
}

async fn cached_export(
    State(state): State<HttpState>,
    uri: Uri,
    headers: HeaderMap,
    RawQuery(query): RawQuery,
) -> Response {
    let (authorized, session) = state.serving.authorize(&headers, query.as_deref());
    if !authorized {
        return HttpError::new(
            SOURCE,
            StatusCode::UNAUTHORIZED,
            "Unauthorized",
            "cached export requested without a valid access token",
        )
        .into_response();
    }

    let prefix = format!("{}/_cached/", state.root());
    let relative = uri.path().strip_prefix(prefix.as_str()).unwrap_or_default();
    let document = state.serving.resolver.resolve_relative(relative);
    let html = match &document {
        Some(document) => read_cached_html(document.as_path()).await,
        None => None,
    };
    let (Some(document), Some(html)) = (document, html) else {
        return HttpError::new(
            SOURCE,
            StatusCode::NOT_FOUND,
            "Cached export not found.",
            format!("no cached export for `{relative}`"),
        )
        .into_response();
    };

    let html = state
        .serving
        .render_cached_export(&document, &html, show_code_requested(query.as_deref()))
        .await;
    let mut response = html_response(html);
    state
        .serving
        .cookies
        .persist(&session, response.headers_mut());
    response
}
