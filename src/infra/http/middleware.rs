//! Per-request span and response logging for the public router.

use std::sync::Arc;
use std::time::Instant;

use axum::{
    body::Body,
    extract::State,
    http::Request,
    middleware::Next,
    response::Response,
};
use tracing::{Instrument, debug, error, field, info_span, warn};
use uuid::Uuid;

use crate::application::error::ErrorReport;
use crate::application::resolve::DocumentResolver;
use crate::cache::Served;
use crate::domain::document::DocumentPath;

/// Available to handlers and on the response.
#[derive(Debug, Clone)]
pub struct RequestContext {
    pub request_id: String,
    /// The notebook the request path names, if any.
    pub document: Option<DocumentPath>,
}

/// Tag the request with an id and its document, and run it inside a span carrying both.
pub async fn set_request_context(
    State(resolver): State<Arc<DocumentResolver>>,
    mut request: Request<Body>,
    next: Next,
) -> Response {
    let request_id = Uuid::new_v4().to_string();
    let document = resolver.resolve(request.uri().path());

    let span = info_span!(
        target: "marimo_gateway::http",
        "request",
        request_id = %request_id,
        method = %request.method(),
        path = %request.uri().path(),
        document = field::Empty,
    );
    if let Some(document) = &document {
        span.record("document", field::display(document.as_path().display()));
    }

    let ctx = RequestContext {
        request_id,
        document,
    };
    request.extensions_mut().insert(ctx.clone());

    let mut response = next.run(request).instrument(span).await;
    response.extensions_mut().insert(ctx);
    response
}

/// How the response was produced; gateway endpoints carry no marker.
fn served(response: &Response) -> &'static str {
    response
        .extensions()
        .get::<Served>()
        .map_or("gateway", |served| served.as_str())
}

pub async fn log_responses(request: Request<Body>, next: Next) -> Response {
    let start = Instant::now();

    let mut response = next.run(request).await;
    let status = response.status();
    let served = served(&response);
    let elapsed_ms = start.elapsed().as_millis();

    if !status.is_client_error() && !status.is_server_error() {
        debug!(
            target = "marimo_gateway::http::response",
            status = status.as_u16(),
            served,
            elapsed_ms,
            "request completed",
        );
        return response;
    }

    let report = response.extensions_mut().remove::<ErrorReport>();
    let (source, messages) = match report {
        Some(report) => (report.source, report.messages),
        None => ("upstream", Vec::new()),
    };
    let detail = messages
        .first()
        .cloned()
        .unwrap_or_else(|| "no diagnostic available".to_string());

    if status.is_server_error() {
        error!(
            target = "marimo_gateway::http::response",
            status = status.as_u16(),
            served,
            elapsed_ms,
            source,
            detail = %detail,
            chain = ?messages,
            "request failed",
        );
    } else {
        warn!(
            target = "marimo_gateway::http::response",
            status = status.as_u16(),
            served,
            elapsed_ms,
            source,
            detail = %detail,
            chain = ?messages,
            "client request error",
        );
    }

    response
}

#[cfg(test)]
mod tests {
    use super::*;

    use axum::{Extension, Router, middleware, routing::get};
    use tower::ServiceExt;

    fn router(resolver: Arc<DocumentResolver>) -> Router {
        Router::new()
            .route(
                "/{*path}",
                get(|Extension(ctx): Extension<RequestContext>| async move {
                    ctx.document
                        .map(|document| document.as_path().display().to_string())
                        .unwrap_or_default()
                }),
            )
            .layer(middleware::from_fn(log_responses))
            .layer(middleware::from_fn_with_state(resolver, set_request_context))
    }

    #[tokio::test]
    async fn requests_carry_their_document() {
        let dir = tempfile::TempDir::new().unwrap();
        std::fs::write(dir.path().join("app.py"), "").unwrap();
        let resolver = Arc::new(DocumentResolver::new(dir.path(), "/"));

        let response = router(resolver.clone())
            .oneshot(Request::get("/app").body(Body::empty()).unwrap())
            .await
            .unwrap();
        let ctx = response.extensions().get::<RequestContext>().cloned().unwrap();
        assert!(!ctx.request_id.is_empty());
        let body = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        assert!(String::from_utf8_lossy(&body).ends_with("app.py"));
        assert!(ctx.document.unwrap().as_path().ends_with("app.py"));

        let response = router(resolver)
            .oneshot(Request::get("/assets/app.js").body(Body::empty()).unwrap())
            .await
            .unwrap();
        let ctx = response.extensions().get::<RequestContext>().cloned().unwrap();
        assert!(ctx.document.is_none());
    }

    #[test]
    fn responses_report_how_they_were_served() {
        let mut response = Response::new(Body::empty());
        assert_eq!(served(&response), "gateway");
        response.extensions_mut().insert(Served::Patched);
        assert_eq!(served(&response), "patched");
    }
}
