//! Accept loop for the public listener.
//!
//! Connections are served by hyper's auto builder with upgrades enabled so the
//! live server's WebSockets can be tunnelled, and each one holds a slot in the
//! [`ConnectionCounter`] for as long as it is open.

use std::future::Future;
use std::time::Duration;

use axum::Router;
use hyper_util::rt::{TokioExecutor, TokioIo};
use hyper_util::server::conn::auto::Builder;
use hyper_util::server::graceful::GracefulShutdown;
use hyper_util::service::TowerToHyperService;
use tokio::net::TcpListener;
use tracing::{debug, info, warn};

use super::connections::ConnectionCounter;

const ACCEPT_BACKOFF: Duration = Duration::from_millis(100);

/// Serve `router` until `shutdown` resolves, then give open connections
/// `grace` to finish before dropping them.
pub async fn serve<F>(
    listener: TcpListener,
    router: Router,
    counter: ConnectionCounter,
    shutdown: F,
    grace: Duration,
) where
    F: Future<Output = ()>,
{
    let builder = Builder::new(TokioExecutor::new());
    let graceful = GracefulShutdown::new();
    tokio::pin!(shutdown);

    loop {
        let (stream, remote) = tokio::select! {
            _ = &mut shutdown => break,
            accepted = listener.accept() => match accepted {
                Ok(accepted) => accepted,
                Err(err) => {
                    warn!(
                        target = "marimo_gateway::http",
                        error = %err,
                        "Failed to accept connection"
                    );
                    tokio::time::sleep(ACCEPT_BACKOFF).await;
                    continue;
                }
            },
        };

        let guard = counter.open();
        let service = TowerToHyperService::new(router.clone());
        let builder = builder.clone();
        let watcher = graceful.watcher();
        tokio::spawn(async move {
            let connection = builder.serve_connection_with_upgrades(TokioIo::new(stream), service);
            if let Err(err) = watcher.watch(connection).await {
                debug!(
                    target = "marimo_gateway::http",
                    remote = %remote,
                    error = %err,
                    "Connection closed with an error"
                );
            }
            drop(guard);
        });
    }

    drop(listener);
    tokio::select! {
        _ = graceful.shutdown() => {
            info!(target = "marimo_gateway::http", "All connections closed");
        }
        _ = tokio::time::sleep(grace) => {
            warn!(
                target = "marimo_gateway::http",
                timeout_s = grace.as_secs(),
                open = counter.active(),
                "Graceful shutdown timed out; dropping open connections"
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use axum::routing::get;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpStream;
    use tokio::sync::oneshot;

    async fn wait_for(counter: &ConnectionCounter, expected: usize) {
        tokio::time::timeout(Duration::from_secs(5), async {
            while counter.active() != expected {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .unwrap();
    }

    #[tokio::test]
    async fn open_connections_are_counted_until_closed() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let counter = ConnectionCounter::new();
        let router = Router::new().route("/", get(|| async { "ok" }));
        let (stop, stopped) = oneshot::channel::<()>();
        let server = tokio::spawn(serve(
            listener,
            router,
            counter.clone(),
            async {
                let _ = stopped.await;
            },
            Duration::from_secs(5),
        ));

        let mut client = TcpStream::connect(addr).await.unwrap();
        client
            .write_all(b"GET / HTTP/1.1\r\nHost: gateway\r\n\r\n")
            .await
            .unwrap();
        let mut buf = [0u8; 12];
        client.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"HTTP/1.1 200");
        assert_eq!(counter.active(), 1);

        drop(client);
        wait_for(&counter, 0).await;

        stop.send(()).unwrap();
        tokio::time::timeout(Duration::from_secs(5), server)
            .await
            .unwrap()
            .unwrap();
    }

    #[tokio::test]
    async fn shutdown_stops_waiting_after_the_grace_period() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let counter = ConnectionCounter::new();
        let router = Router::new().route(
            "/slow",
            get(|| async {
                tokio::time::sleep(Duration::from_secs(60)).await;
                "late"
            }),
        );
        let (stop, stopped) = oneshot::channel::<()>();
        let server = tokio::spawn(serve(
            listener,
            router,
            counter.clone(),
            async {
                let _ = stopped.await;
            },
            Duration::from_millis(100),
        ));

        let mut client = TcpStream::connect(addr).await.unwrap();
        client
            .write_all(b"GET /slow HTTP/1.1\r\nHost: gateway\r\n\r\n")
            .await
            .unwrap();
        wait_for(&counter, 1).await;

        stop.send(()).unwrap();
        tokio::time::timeout(Duration::from_secs(5), server)
            .await
            .unwrap()
            .unwrap();
    }
}
