//! Forwarding to the live marimo server.
//!
//! Plain requests go through `reqwest` with streamed bodies. WebSocket
//! upgrades get their own HTTP/1.1 connection to the upstream; once both sides
//! have switched protocols the bytes are relayed untouched, while the frames
//! the live server sends are read to keep the session registry current.

use std::io;
use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use axum::body::{Body, HttpBody};
use axum::http::header::{
    ACCEPT_ENCODING, CONNECTION, HOST, PROXY_AUTHENTICATE, PROXY_AUTHORIZATION,
    SEC_WEBSOCKET_EXTENSIONS, TE, TRAILER, TRANSFER_ENCODING, UPGRADE,
};
use axum::http::{HeaderMap, HeaderName, HeaderValue, Request, StatusCode, Uri};
use axum::response::{IntoResponse, Response};
use hyper::client::conn::http1;
use hyper::upgrade::OnUpgrade;
use hyper_util::rt::TokioIo;
use reqwest::{Client, Url};
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tracing::{debug, warn};

use crate::application::error::HttpError;
use crate::application::resolve::{DocumentResolver, query_param};
use crate::domain::document::DocumentPath;
use crate::infra::error::InfraError;
use crate::infra::frames::FrameReader;
use crate::infra::sessions::InMemorySessions;

const SOURCE: &str = "infra::proxy";
const KEEP_ALIVE: HeaderName = HeaderName::from_static("keep-alive");
const SESSION_ID_PARAM: &str = "session_id";
const FILE_PARAM: &str = "file";
const SOCKET_SUFFIX: &str = "/ws";
const RELAY_BUFFER_BYTES: usize = 16 * 1024;
const MAX_OBSERVED_MESSAGE_BYTES: usize = 4 * 1024 * 1024;

/// Anything able to answer a request the gateway does not handle itself.
#[async_trait]
pub trait LiveBackend: Send + Sync {
    async fn forward(&self, request: Request<Body>) -> Response;
}

#[derive(Debug, Error)]
pub enum ProxyError {
    #[error("upstream request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("upstream connection failed: {0}")]
    Io(#[from] io::Error),
    #[error("upstream handshake failed: {0}")]
    Handshake(#[from] hyper::Error),
    #[error("upgrade request could not be built: {0}")]
    Build(#[from] axum::http::Error),
    #[error("upstream address is unusable: {0}")]
    Address(String),
    #[error("WebSocket tunnelling needs an http upstream, not `{0}`")]
    UnsupportedScheme(String),
    #[error("connection cannot be upgraded")]
    UpgradeUnavailable,
}

/// Where sessions seen on tunnelled sockets are recorded.
#[derive(Clone)]
pub struct SessionTracking {
    pub sessions: Arc<InMemorySessions>,
    pub resolver: Arc<DocumentResolver>,
}

impl SessionTracking {
    /// The session a socket request belongs to, when both its id and document are known.
    fn feed_for(&self, uri: &Uri) -> Option<SessionFeed> {
        let session_id = query_param(uri.query(), SESSION_ID_PARAM).filter(|id| !id.is_empty())?;
        let document = socket_document(&self.resolver, uri)?;
        Some(SessionFeed {
            sessions: self.sessions.clone(),
            session_id,
            file: document.into_path_buf(),
            reader: FrameReader::new(MAX_OBSERVED_MESSAGE_BYTES),
        })
    }
}

/// The document a socket serves: its page path without the socket suffix,
/// or the `file` parameter used by multi-document servers.
fn socket_document(resolver: &DocumentResolver, uri: &Uri) -> Option<DocumentPath> {
    let path = uri.path();
    let page = path.strip_suffix(SOCKET_SUFFIX).unwrap_or(path);
    resolver.resolve(page).or_else(|| {
        query_param(uri.query(), FILE_PARAM).and_then(|file| resolver.resolve_relative(&file))
    })
}

/// Reads one session's server-to-client stream into the registry.
struct SessionFeed {
    sessions: Arc<InMemorySessions>,
    session_id: String,
    file: PathBuf,
    reader: FrameReader,
}

impl SessionFeed {
    fn feed(&mut self, bytes: &[u8]) {
        for message in self.reader.feed(bytes) {
            self.sessions.observe(&self.session_id, &self.file, &message);
        }
    }

    fn close(self) {
        self.sessions.close_session(&self.session_id);
    }
}

/// Reverse proxy to a marimo server listening at `base`.
#[derive(Clone)]
pub struct UpstreamProxy {
    client: Client,
    base: Url,
    tracking: Option<SessionTracking>,
}

impl UpstreamProxy {
    pub fn new(upstream: &str) -> Result<Self, InfraError> {
        let base = Url::parse(upstream).map_err(|err| {
            InfraError::configuration(format!("invalid upstream url `{upstream}`: {err}"))
        })?;
        if base.host_str().is_none() {
            return Err(InfraError::configuration(format!(
                "upstream url `{upstream}` has no host"
            )));
        }
        let client = Client::builder()
            .user_agent(concat!("marimo-gateway/", env!("CARGO_PKG_VERSION")))
            .redirect(reqwest::redirect::Policy::none())
            .build()
            .map_err(|err| InfraError::upstream(err.to_string()))?;
        Ok(Self {
            client,
            base,
            tracking: None,
        })
    }

    /// Record sessions whose sockets pass through this proxy.
    pub fn with_session_tracking(mut self, tracking: SessionTracking) -> Self {
        self.tracking = Some(tracking);
        self
    }

    pub fn base(&self) -> &Url {
        &self.base
    }

    fn target(&self, uri: &Uri) -> Url {
        let mut url = self.base.clone();
        url.set_path(uri.path());
        url.set_query(uri.query());
        url
    }

    fn authority(&self) -> Result<(String, u16), ProxyError> {
        let host = self
            .base
            .host_str()
            .ok_or_else(|| ProxyError::Address("no host".to_string()))?;
        let port = self
            .base
            .port_or_known_default()
            .ok_or_else(|| ProxyError::Address("no port".to_string()))?;
        Ok((host.to_string(), port))
    }

    async fn forward_http(&self, request: Request<Body>) -> Result<Response, ProxyError> {
        let (parts, body) = request.into_parts();
        let url = self.target(&parts.uri);

        let mut headers = parts.headers;
        strip_hop_by_hop(&mut headers);
        headers.remove(HOST);
        // Bodies are rewritten in place, so ask for identity encoding.
        headers.remove(ACCEPT_ENCODING);

        let mut outbound = self.client.request(parts.method, url).headers(headers);
        if body.size_hint().exact() != Some(0) {
            outbound = outbound.body(reqwest::Body::wrap_stream(body.into_data_stream()));
        }
        let upstream = outbound.send().await?;

        let status = upstream.status();
        let mut headers = upstream.headers().clone();
        strip_hop_by_hop(&mut headers);

        let mut response = Response::new(Body::from_stream(upstream.bytes_stream()));
        *response.status_mut() = status;
        *response.headers_mut() = headers;
        Ok(response)
    }

    async fn tunnel(&self, mut request: Request<Body>) -> Result<Response, ProxyError> {
        if self.base.scheme() != "http" {
            return Err(ProxyError::UnsupportedScheme(self.base.scheme().to_string()));
        }
        let client_upgrade = request
            .extensions_mut()
            .remove::<OnUpgrade>()
            .ok_or(ProxyError::UpgradeUnavailable)?;
        let (host, port) = self.authority()?;

        let stream = TcpStream::connect((host.trim_matches(['[', ']']), port)).await?;
        let (mut sender, connection) = http1::handshake::<_, Body>(TokioIo::new(stream)).await?;
        tokio::spawn(async move {
            if let Err(err) = connection.with_upgrades().await {
                debug!(
                    target = "marimo_gateway::proxy",
                    error = %err,
                    "Upstream socket connection ended with an error"
                );
            }
        });

        let path = request.uri().path().to_string();
        let feed = self
            .tracking
            .as_ref()
            .and_then(|tracking| tracking.feed_for(request.uri()));

        let (parts, _) = request.into_parts();
        let target = parts
            .uri
            .path_and_query()
            .map_or("/", |path_and_query| path_and_query.as_str());
        let mut outbound = Request::builder()
            .method(parts.method)
            .uri(target)
            .body(Body::empty())?;
        let mut headers = parts.headers;
        // Frames must stay uncompressed to be readable.
        headers.remove(SEC_WEBSOCKET_EXTENSIONS);
        let authority = HeaderValue::from_str(&format!("{host}:{port}"))
            .map_err(|err| ProxyError::Address(err.to_string()))?;
        headers.insert(HOST, authority);
        *outbound.headers_mut() = headers;

        let mut upstream = sender.send_request(outbound).await?;
        if upstream.status() != StatusCode::SWITCHING_PROTOCOLS {
            return Ok(upstream.map(Body::new));
        }

        let upstream_upgrade = hyper::upgrade::on(&mut upstream);
        let (parts, _) = upstream.into_parts();
        tokio::spawn(async move {
            let (client, upstream) = match tokio::try_join!(client_upgrade, upstream_upgrade) {
                Ok(upgraded) => upgraded,
                Err(err) => {
                    warn!(
                        target = "marimo_gateway::proxy",
                        path = %path,
                        error = %err,
                        "Socket upgrade failed"
                    );
                    return;
                }
            };
            match relay(TokioIo::new(client), TokioIo::new(upstream), feed).await {
                Ok((sent, received)) => debug!(
                    target = "marimo_gateway::proxy",
                    path = %path,
                    sent,
                    received,
                    "Socket closed"
                ),
                Err(err) => debug!(
                    target = "marimo_gateway::proxy",
                    path = %path,
                    error = %err,
                    "Socket aborted"
                ),
            }
        });

        Ok(Response::from_parts(parts, Body::empty()))
    }
}

/// Copy bytes both ways until each side finishes, reading the server's frames
/// into `feed` on the way.
async fn relay<C, U>(
    client: C,
    upstream: U,
    mut feed: Option<SessionFeed>,
) -> io::Result<(u64, u64)>
where
    C: AsyncRead + AsyncWrite,
    U: AsyncRead + AsyncWrite,
{
    let (mut client_read, mut client_write) = tokio::io::split(client);
    let (mut upstream_read, mut upstream_write) = tokio::io::split(upstream);

    let outbound = async {
        let sent = tokio::io::copy(&mut client_read, &mut upstream_write).await?;
        upstream_write.shutdown().await?;
        Ok::<u64, io::Error>(sent)
    };
    let inbound = async {
        let mut buffer = vec![0u8; RELAY_BUFFER_BYTES];
        let mut received = 0u64;
        loop {
            let read = upstream_read.read(&mut buffer).await?;
            if read == 0 {
                break;
            }
            if let Some(feed) = feed.as_mut() {
                feed.feed(&buffer[..read]);
            }
            client_write.write_all(&buffer[..read]).await?;
            received += read as u64;
        }
        client_write.shutdown().await?;
        Ok::<u64, io::Error>(received)
    };
    let result = tokio::try_join!(outbound, inbound);

    if let Some(feed) = feed {
        feed.close();
    }
    result
}

#[async_trait]
impl LiveBackend for UpstreamProxy {
    async fn forward(&self, request: Request<Body>) -> Response {
        let path = request.uri().path().to_string();
        let result = if is_upgrade_request(request.headers()) {
            self.tunnel(request).await
        } else {
            self.forward_http(request).await
        };

        result.unwrap_or_else(|err| {
            warn!(
                target = "marimo_gateway::proxy",
                path = %path,
                error = %err,
                "Live backend request failed"
            );
            HttpError::from_error(
                SOURCE,
                StatusCode::BAD_GATEWAY,
                "Live backend unavailable",
                &err,
            )
            .into_response()
        })
    }
}

fn is_upgrade_request(headers: &HeaderMap) -> bool {
    headers.contains_key(UPGRADE)
        && headers
            .get_all(CONNECTION)
            .iter()
            .filter_map(|value| value.to_str().ok())
            .flat_map(|value| value.split(','))
            .any(|token| token.trim().eq_ignore_ascii_case("upgrade"))
}

/// Remove connection-scoped headers, including any the `Connection` header names.
fn strip_hop_by_hop(headers: &mut HeaderMap) {
    let named: Vec<HeaderName> = headers
        .get_all(CONNECTION)
        .iter()
        .filter_map(|value| value.to_str().ok())
        .flat_map(|value| value.split(','))
        .filter_map(|token| HeaderName::from_bytes(token.trim().as_bytes()).ok())
        .collect();
    for name in named {
        headers.remove(name);
    }
    for name in [
        CONNECTION,
        KEEP_ALIVE,
        PROXY_AUTHENTICATE,
        PROXY_AUTHORIZATION,
        TE,
        TRAILER,
        TRANSFER_ENCODING,
        UPGRADE,
    ] {
        headers.remove(name);
    }
}
