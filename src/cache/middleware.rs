//! Response interception: serve cached state in place of, or on top of, the live page.
//!
//! The hybrid layer patches live HTML with the cached session; the autoswitch
//! layer answers with the cached export and lets the browser swap to the live
//! page once it is ready. Both fall back to the untouched live response.

use std::sync::Arc;

use axum::{
    body::{Body, Bytes},
    extract::State,
    http::{
        HeaderMap, HeaderValue, Method, Request, StatusCode,
        header::{CACHE_CONTROL, CONTENT_ENCODING, CONTENT_LENGTH, CONTENT_TYPE},
    },
    middleware::Next,
    response::{IntoResponse, Response},
};
use futures::{StreamExt, stream};
use metrics::counter;
use tracing::{debug, instrument, warn};

use super::artifact::{has_cached_html, load_cached_config, read_cached_html};
use super::autoswitch::{AutoswitchScript, is_live_request};
use crate::application::{
    auth::{AuthSession, CacheAuthorizer, TOKEN_QUERY_PARAM},
    backend::NotebookSource,
    error::HttpError,
    mount::{PatchOptions, PatchSources, apply_cached_html, fresh_notebook_snapshot, strip_code},
    resolve::{DocumentResolver, query_param, show_code_requested},
};
use crate::domain::document::DocumentPath;
use crate::infra::http::session::CookieSessions;

pub(crate) const METRIC_CACHED_PATCH: &str = "gateway_cached_patch_total";
pub(crate) const METRIC_CACHED_PASSTHROUGH: &str = "gateway_cached_passthrough_total";
pub(crate) const METRIC_CACHED_UNAUTHORIZED: &str = "gateway_cached_unauthorized_total";

const SOURCE: &str = "cache::middleware";
const NO_STORE: HeaderValue = HeaderValue::from_static("no-store");
const HTML_UTF8: HeaderValue = HeaderValue::from_static("text/html; charset=utf-8");

/// How a response was produced, carried as a response extension.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Served {
    /// Straight from the live backend.
    Live,
    /// Live page with the cached session grafted in.
    Patched,
    /// The cached export, without asking the live backend.
    CachedExport,
}

impl Served {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Live => "live",
            Self::Patched => "patched",
            Self::CachedExport => "cached-export",
        }
    }
}

/// Everything the interception layers need per request.
#[derive(Clone)]
pub struct ServingState {
    pub resolver: Arc<DocumentResolver>,
    pub authorizer: Arc<CacheAuthorizer>,
    pub cookies: CookieSessions,
    pub notebooks: Arc<dyn NotebookSource>,
    pub autoswitch: Arc<AutoswitchScript>,
    pub include_code: bool,
    pub max_buffer_bytes: usize,
}

impl ServingState {
    /// Authorize against the cookie session and the `access_token` parameter.
    pub fn authorize(&self, headers: &HeaderMap, query: Option<&str>) -> (bool, AuthSession) {
        let mut session = self.cookies.load(headers);
        let token = query_param(query, TOKEN_QUERY_PARAM);
        let authorized = self.authorizer.authorize(&mut session, token.as_deref());
        if !authorized {
            counter!(METRIC_CACHED_UNAUTHORIZED).increment(1);
        }
        (authorized, session)
    }

    /// The cached export prepared for direct serving: code stripped when
    /// inclusion is off, otherwise refreshed with the current notebook code.
    pub async fn render_cached_export(
        &self,
        document: &DocumentPath,
        html: &str,
        show_code: bool,
    ) -> String {
        if !self.include_code {
            return strip_code(html).into_owned();
        }
        let fresh =
            fresh_notebook_snapshot(&*self.notebooks, Some(document.as_path()), true).await;
        apply_cached_html(
            html,
            PatchSources {
                cached_config: None,
                fresh_notebook: fresh.as_ref(),
            },
            PatchOptions {
                include_code: true,
                show_code,
                include_session: false,
            },
        )
        .into_owned()
    }
}

/// Patch live HTML for documents with a cached export.
#[instrument(skip_all, fields(path = %request.uri().path()))]
pub async fn cached_snapshot_layer(
    State(state): State<ServingState>,
    request: Request<Body>,
    next: Next,
) -> Response {
    if request.method() != Method::GET {
        return passthrough(next.run(request).await);
    }

    let Some(document) = state.resolver.resolve(request.uri().path()) else {
        return passthrough(next.run(request).await);
    };
    if !has_cached_html(document.as_path()).await {
        return passthrough(next.run(request).await);
    }

    let query = request.uri().query().map(str::to_string);
    let (authorized, session) = state.authorize(request.headers(), query.as_deref());
    if !authorized {
        debug!(cache = "snapshot", outcome = "unauthorized", "serving live page");
        return passthrough(next.run(request).await);
    }

    let show_code = show_code_requested(query.as_deref());
    let response = next.run(request).await;
    let mut response = patch_live_response(&state, &document, response, show_code).await;
    state.cookies.persist(&session, response.headers_mut());
    response
}

/// Answer application pages with the cached export plus the switch script.
#[instrument(skip_all, fields(path = %request.uri().path()))]
pub async fn autoswitch_layer(
    State(state): State<ServingState>,
    request: Request<Body>,
    next: Next,
) -> Response {
    if request.method() != Method::GET || is_live_request(request.uri().query()) {
        return passthrough(next.run(request).await);
    }

    let Some(document) = state.resolver.resolve(request.uri().path()) else {
        return passthrough(next.run(request).await);
    };
    if !has_cached_html(document.as_path()).await {
        return passthrough(next.run(request).await);
    }

    let query = request.uri().query().map(str::to_string);
    let (authorized, session) = state.authorize(request.headers(), query.as_deref());
    if !authorized {
        debug!(cache = "autoswitch", outcome = "unauthorized", "serving live page");
        return passthrough(next.run(request).await);
    }

    let Some(html) = read_cached_html(document.as_path()).await else {
        return passthrough(next.run(request).await);
    };

    let show_code = show_code_requested(query.as_deref());
    let html = state
        .render_cached_export(&document, &html, show_code)
        .await;
    let html = state.autoswitch.inject(&html);

    counter!(METRIC_CACHED_PATCH).increment(1);
    debug!(cache = "autoswitch", outcome = "cached", "serving cached export");
    let mut response = html_response(html);
    state.cookies.persist(&session, response.headers_mut());
    response
}

/// A cached export as a `text/html` response that intermediaries must not store.
pub fn html_response(html: String) -> Response {
    let mut response = html.into_response();
    let headers = response.headers_mut();
    headers.insert(CONTENT_TYPE, HTML_UTF8);
    headers.insert(CACHE_CONTROL, NO_STORE);
    response.extensions_mut().insert(Served::CachedExport);
    response
}

fn passthrough(response: Response) -> Response {
    counter!(METRIC_CACHED_PASSTHROUGH).increment(1);
    response
}

fn is_patchable(headers: &HeaderMap) -> bool {
    let html = headers
        .get(CONTENT_TYPE)
        .and_then(|value| value.to_str().ok())
        .is_some_and(|value| value.to_ascii_lowercase().starts_with("text/html"));
    let encoded = headers
        .get(CONTENT_ENCODING)
        .and_then(|value| value.to_str().ok())
        .is_some_and(|value| !value.eq_ignore_ascii_case("identity"));
    html && !encoded
}

fn declared_length(headers: &HeaderMap) -> Option<usize> {
    headers
        .get(CONTENT_LENGTH)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.parse().ok())
}

enum Buffered {
    Complete(Bytes),
    /// Longer than the limit: what was read, followed by the unread rest.
    Overflow(Body),
}

/// Read `body` into memory unless it turns out longer than `limit` bytes.
async fn buffer_body(body: Body, limit: usize) -> Result<Buffered, axum::Error> {
    let mut frames = body.into_data_stream();
    let mut chunks: Vec<Bytes> = Vec::new();
    let mut total = 0usize;
    while let Some(chunk) = frames.next().await {
        let chunk = chunk?;
        total += chunk.len();
        chunks.push(chunk);
        if total > limit {
            let read = stream::iter(chunks.into_iter().map(Ok::<_, axum::Error>));
            return Ok(Buffered::Overflow(Body::from_stream(read.chain(frames))));
        }
    }

    let mut buffer = Vec::with_capacity(total);
    for chunk in &chunks {
        buffer.extend_from_slice(chunk);
    }
    Ok(Buffered::Complete(Bytes::from(buffer)))
}

async fn patch_live_response(
    state: &ServingState,
    document: &DocumentPath,
    response: Response,
    show_code: bool,
) -> Response {
    if !is_patchable(response.headers()) {
        return passthrough(response);
    }
    if declared_length(response.headers()).is_some_and(|len| len > state.max_buffer_bytes) {
        return passthrough(response);
    }
    let Some(cached_config) = load_cached_config(document.as_path()).await else {
        return passthrough(response);
    };

    let (mut parts, body) = response.into_parts();
    let bytes = match buffer_body(body, state.max_buffer_bytes).await {
        Ok(Buffered::Complete(bytes)) => bytes,
        Ok(Buffered::Overflow(body)) => {
            warn!(
                target = "marimo_gateway::cache::middleware",
                path = %document.as_path().display(),
                limit = state.max_buffer_bytes,
                "Live response exceeds the buffer limit; leaving it unmodified"
            );
            return passthrough(Response::from_parts(parts, body));
        }
        Err(err) => {
            return HttpError::new(
                SOURCE,
                StatusCode::BAD_GATEWAY,
                "Live response could not be read",
                err.to_string(),
            )
            .into_response();
        }
    };

    let html = match std::str::from_utf8(&bytes) {
        Ok(html) => html,
        Err(err) => {
            warn!(
                target = "marimo_gateway::cache::middleware",
                path = %document.as_path().display(),
                error = %err,
                "Live response is not UTF-8; leaving it unmodified"
            );
            return passthrough(Response::from_parts(parts, Body::from(bytes)));
        }
    };

    let fresh = fresh_notebook_snapshot(
        &*state.notebooks,
        Some(document.as_path()),
        state.include_code,
    )
    .await;
    let patched = apply_cached_html(
        html,
        PatchSources {
            cached_config: Some(&cached_config),
            fresh_notebook: fresh.as_ref(),
        },
        PatchOptions {
            include_code: state.include_code,
            show_code,
            include_session: true,
        },
    )
    .into_owned();

    parts.headers.insert(CONTENT_LENGTH, HeaderValue::from(patched.len()));
    parts.headers.insert(CACHE_CONTROL, NO_STORE);
    parts.extensions.insert(Served::Patched);
    counter!(METRIC_CACHED_PATCH).increment(1);
    debug!(
        cache = "snapshot",
        outcome = "patched",
        body_bytes = patched.len(),
        "patched live page with cached state"
    );
    Response::from_parts(parts, Body::from(patched))
}
