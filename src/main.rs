use std::{
    path::{Path, PathBuf},
    process,
    sync::Arc,
};

use marimo_gateway::{
    application::{
        auth::CacheAuthorizer,
        backend::{ApplicationProbe, Exporter, NotebookSource, SessionHook, SessionRegistry},
        discovery::{DiscoveryOptions, IgnoreStrategy, discover},
        error::AppError,
        precompute::{PrecomputeBackend, PrecomputeOptions, precompute},
        resolve::DocumentResolver,
        seeding::CachedSessionSeeder,
    },
    cache::{AutoswitchScript, MemoizedNotebookSource, ServingState},
    config::{self, IgnoreStrategySetting, Settings},
    infra::{
        error::InfraError,
        git::GitCheckIgnore,
        http::{self, ConnectionCounter, CookieSessions, HttpState},
        marimo::MarimoProcess,
        proxy::{LiveBackend, SessionTracking, UpstreamProxy},
        sessions::InMemorySessions,
        telemetry,
        upstream::{ManagedUpstream, UpstreamLaunch},
    },
};
use tracing::{Dispatch, Level, dispatcher, error, info, warn};
use tracing_subscriber::fmt as tracing_fmt;

const GIT_PROGRAM: &str = "git";

#[tokio::main]
async fn main() {
    if let Err(error) = run().await {
        report_application_error(&error);
        process::exit(1);
    }
}

fn report_application_error(error: &AppError) {
    if dispatcher::has_been_set() {
        error!(error = %error, "application error");
        return;
    }

    let subscriber = tracing_fmt().with_max_level(Level::ERROR).finish();
    let dispatch = Dispatch::new(subscriber);
    dispatcher::with_default(&dispatch, || {
        error!(error = %error, "application error");
    });
}

async fn run() -> Result<(), AppError> {
    let (cli_args, settings) = config::load_with_cli()
        .map_err(|err| AppError::unexpected(format!("failed to load configuration: {err}")))?;

    let command = cli_args
        .command
        .unwrap_or(config::Command::Serve(Box::<config::ServeArgs>::default()));

    telemetry::init(&settings.logging).map_err(AppError::from)?;

    match command {
        config::Command::Serve(_) => run_serve(settings).await,
        config::Command::Cache(_) => run_cache(settings).await,
        config::Command::List(_) => run_list(settings).await,
    }
}

async fn run_serve(settings: Settings) -> Result<(), AppError> {
    let root = served_root(&settings)?;

    if settings.auth.token.is_none() && !settings.auth.explicitly_disabled {
        warn!(
            target = "marimo_gateway::auth",
            "No access token configured; cached content is served to everyone"
        );
    }

    let mut upstream = if settings.live.spawn {
        Some(spawn_upstream(&settings, &root).await?)
    } else {
        None
    };

    let marimo = marimo_process(&settings);
    let precompute_handle = if settings.precompute.on_start {
        let root = root.clone();
        let options = precompute_options(&settings, &root).await;
        let backend = precompute_backend(&marimo);
        Some(tokio::spawn(async move {
            if let Err(err) = precompute(&root, &options, &backend).await {
                error!(
                    target = "marimo_gateway::precompute",
                    error = %err,
                    "Background precompute failed"
                );
            }
        }))
    } else {
        None
    };

    let state = build_http_state(&settings, &root, marimo)?;
    let result = serve_http(&settings, state).await;

    if let Some(handle) = precompute_handle {
        handle.abort();
        let _ = handle.await;
    }
    if let Some(upstream) = upstream.take() {
        upstream.shutdown().await;
    }

    result
}

async fn run_cache(settings: Settings) -> Result<(), AppError> {
    let root = served_root(&settings)?;
    let marimo = marimo_process(&settings);
    let options = precompute_options(&settings, &root).await;

    info!(
        target = "marimo_gateway::precompute",
        root = %root.display(),
        strategy = ?options.strategy,
        include_code = options.include_code,
        concurrency = options.concurrency,
        "Starting precompute"
    );

    let summary = precompute(&root, &options, &precompute_backend(&marimo)).await?;
    println!(
        "Caching complete: {} apps cached successfully, {} failed or skipped",
        summary.cached,
        summary.failed_or_skipped()
    );
    Ok(())
}

async fn run_list(settings: Settings) -> Result<(), AppError> {
    let root = served_root(&settings)?;
    let marimo = marimo_process(&settings);
    let options = DiscoveryOptions {
        strategy: ignore_strategy(&settings, &root).await,
        concurrency: settings.precompute.concurrency.get(),
    };

    let documents = discover(&root, &options, marimo.as_ref()).await?;
    for document in documents {
        println!("{}", document.as_path().display());
    }
    Ok(())
}

fn served_root(settings: &Settings) -> Result<PathBuf, AppError> {
    let directory = &settings.serving.directory;
    std::fs::canonicalize(directory).map_err(|err| {
        AppError::from(InfraError::configuration(format!(
            "directory `{}` is not accessible: {err}",
            directory.display()
        )))
    })
}

fn marimo_process(settings: &Settings) -> Arc<MarimoProcess> {
    Arc::new(MarimoProcess::new(
        settings.precompute.python.clone(),
        settings.precompute.marimo.clone(),
        settings.precompute.probe_timeout,
    ))
}

async fn ignore_strategy(settings: &Settings, root: &Path) -> IgnoreStrategy {
    match settings.precompute.ignore_strategy {
        IgnoreStrategySetting::None => IgnoreStrategy::None,
        IgnoreStrategySetting::Rules => IgnoreStrategy::LocalRules,
        IgnoreStrategySetting::Git => match GitCheckIgnore::locate(GIT_PROGRAM, root).await {
            Some(oracle) => {
                info!(
                    target = "marimo_gateway::discovery",
                    repository = %oracle.repository().display(),
                    "Filtering documents with git check-ignore"
                );
                IgnoreStrategy::External(Arc::new(oracle))
            }
            None => {
                warn!(
                    target = "marimo_gateway::discovery",
                    root = %root.display(),
                    "Not inside a git repository; ignore rules are not applied"
                );
                IgnoreStrategy::None
            }
        },
    }
}

async fn precompute_options(settings: &Settings, root: &Path) -> PrecomputeOptions {
    PrecomputeOptions {
        strategy: ignore_strategy(settings, root).await,
        include_code: settings.precompute.include_code,
        concurrency: settings.precompute.concurrency.get(),
    }
}

fn precompute_backend(marimo: &Arc<MarimoProcess>) -> PrecomputeBackend {
    let probe: Arc<dyn ApplicationProbe> = marimo.clone();
    let exporter: Arc<dyn Exporter> = marimo.clone();
    PrecomputeBackend { probe, exporter }
}

async fn spawn_upstream(
    settings: &Settings,
    root: &Path,
) -> Result<ManagedUpstream, AppError> {
    let upstream_url = &settings.live.upstream_url;
    let host = upstream_url
        .host_str()
        .ok_or_else(|| InfraError::configuration("live.upstream_url has no host"))?
        .trim_matches(['[', ']'])
        .to_string();
    let port = upstream_url
        .port_or_known_default()
        .ok_or_else(|| InfraError::configuration("live.upstream_url has no port"))?;

    let launch = UpstreamLaunch {
        program: settings.live.command.clone(),
        directory: root.to_path_buf(),
        host,
        port,
        base_url: settings.server.base_url.clone(),
        include_code: settings.serving.include_code,
        token: settings.auth.token.clone(),
    };
    let mut upstream = ManagedUpstream::spawn(&launch)?;

    let health_path = format!("{}/health", settings.server.base_url.trim_end_matches('/'));
    let health_url = upstream_url
        .join(&health_path)
        .map_err(|err| InfraError::configuration(format!("invalid health url: {err}")))?;
    if !upstream
        .wait_until_healthy(&health_url, settings.live.startup_timeout)
        .await
    {
        upstream.shutdown().await;
        return Err(AppError::from(InfraError::upstream(
            "live server did not become healthy",
        )));
    }
    Ok(upstream)
}

fn build_http_state(
    settings: &Settings,
    root: &Path,
    marimo: Arc<MarimoProcess>,
) -> Result<HttpState, AppError> {
    let base_url = settings.server.base_url.clone();

    let notebooks: Arc<dyn NotebookSource> = Arc::new(MemoizedNotebookSource::new(
        marimo,
        settings.serving.snapshot_memo_limit,
    ));
    let serving = ServingState {
        resolver: Arc::new(DocumentResolver::new(root, base_url.clone())),
        authorizer: Arc::new(CacheAuthorizer::new(settings.auth.token.clone())),
        cookies: CookieSessions::generate(),
        notebooks,
        autoswitch: Arc::new(AutoswitchScript::new(
            &HttpState::ready_path(&base_url),
            settings.serving.include_code,
        )),
        include_code: settings.serving.include_code,
        max_buffer_bytes: settings.serving.max_buffer_bytes.get(),
    };

    let hooks: Vec<Arc<dyn SessionHook>> = vec![Arc::new(CachedSessionSeeder)];
    let tracked = Arc::new(InMemorySessions::new(hooks));
    let tracking = SessionTracking {
        sessions: tracked.clone(),
        resolver: serving.resolver.clone(),
    };
    let live: Arc<dyn LiveBackend> = Arc::new(
        UpstreamProxy::new(settings.live.upstream_url.as_str())?.with_session_tracking(tracking),
    );
    let sessions: Arc<dyn SessionRegistry> = tracked;

    Ok(HttpState {
        serving,
        live,
        sessions,
        connections: ConnectionCounter::new(),
        mode: settings.serving.mode,
        base_url,
        debug_cached: settings.serving.debug_cached,
        allow_origins: settings.server.allow_origins.clone(),
    })
}

async fn serve_http(settings: &Settings, state: HttpState) -> Result<(), AppError> {
    let counter = state.connections.clone();
    let router = http::build_router(state);

    let listener = tokio::net::TcpListener::bind(settings.server.addr)
        .await
        .map_err(|err| AppError::from(InfraError::from(err)))?;
    info!(
        target = "marimo_gateway::http",
        addr = %settings.server.addr,
        base_url = %settings.server.base_url,
        upstream = %settings.live.upstream_url,
        mode = ?settings.serving.mode,
        "Listening"
    );

    http::serve(
        listener,
        router,
        counter,
        shutdown_signal(),
        settings.server.graceful_shutdown,
    )
    .await;

    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(err) = tokio::signal::ctrl_c().await {
            error!(error = %err, "failed to listen for ctrl-c");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(err) => {
                error!(error = %err, "failed to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
    info!(target = "marimo_gateway::http", "Shutdown signal received");
}
