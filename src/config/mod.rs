use std::{
    net::SocketAddr,
    num::NonZeroUsize,
    path::PathBuf,
    str::FromStr,
    time::Duration,
};

use clap::Parser;
use config::{Config, Environment, File};
use serde::Deserialize;
use thiserror::Error;
use tracing::level_filters::LevelFilter;
use url::Url;

mod cli;

pub use cli::{
    CliArgs, Command, LoggingOverrides, PrecomputeArgs, PrecomputeOverrides, ServeArgs,
    ServeOverrides,
};

const DEFAULT_CONFIG_BASENAME: &str = "config/default";
const LOCAL_CONFIG_BASENAME: &str = "marimo-gateway";
const ENV_PREFIX: &str = "MARIMO_GATEWAY";
const DEFAULT_HOST: &str = "127.0.0.1";
const DEFAULT_PORT: u16 = 8000;
const DEFAULT_GRACEFUL_SHUTDOWN_SECS: u64 = 30;
const DEFAULT_DIRECTORY: &str = ".";
const DEFAULT_MAX_BUFFER_BYTES: u64 = 32 * 1024 * 1024;
const DEFAULT_SNAPSHOT_MEMO_LIMIT: u64 = 64;
const DEFAULT_UPSTREAM_URL: &str = "http://127.0.0.1:2718";
const DEFAULT_MARIMO_COMMAND: &str = "marimo";
const DEFAULT_PYTHON: &str = "python";
const DEFAULT_UPSTREAM_STARTUP_SECS: u64 = 60;
const DEFAULT_PRECOMPUTE_CONCURRENCY: u64 = 4;
const DEFAULT_PROBE_TIMEOUT_SECS: u64 = 120;

#[derive(Debug, Clone)]
pub struct Settings {
    pub server: ServerSettings,
    pub logging: LoggingSettings,
    pub serving: ServingSettings,
    pub auth: AuthSettings,
    pub live: LiveSettings,
    pub precompute: PrecomputeSettings,
}

#[derive(Debug, Clone)]
pub struct ServerSettings {
    pub addr: SocketAddr,
    /// `/` or `/prefix` without a trailing slash.
    pub base_url: String,
    /// Empty means any origin.
    pub allow_origins: Vec<String>,
    pub graceful_shutdown: Duration,
}

#[derive(Debug, Clone)]
pub struct LoggingSettings {
    pub level: LevelFilter,
    pub format: LogFormat,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogFormat {
    Json,
    Compact,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ServingMode {
    /// Patch live pages with the cached session.
    #[default]
    Hybrid,
    /// Serve the cached export and switch to the live page client-side.
    Autoswitch,
}

impl FromStr for ServingMode {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "hybrid" => Ok(Self::Hybrid),
            "autoswitch" => Ok(Self::Autoswitch),
            other => Err(format!("unknown mode `{other}` (expected hybrid or autoswitch)")),
        }
    }
}

#[derive(Debug, Clone)]
pub struct ServingSettings {
    pub directory: PathBuf,
    pub include_code: bool,
    pub mode: ServingMode,
    pub debug_cached: bool,
    pub max_buffer_bytes: NonZeroUsize,
    pub snapshot_memo_limit: NonZeroUsize,
}

#[derive(Clone)]
pub struct AuthSettings {
    pub token: Option<String>,
    /// Authentication was switched off on purpose rather than left unset.
    pub explicitly_disabled: bool,
}

impl std::fmt::Debug for AuthSettings {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AuthSettings")
            .field("token", &self.token.as_ref().map(|_| "<redacted>"))
            .field("explicitly_disabled", &self.explicitly_disabled)
            .finish()
    }
}

#[derive(Debug, Clone)]
pub struct LiveSettings {
    pub upstream_url: Url,
    pub spawn: bool,
    pub command: String,
    pub startup_timeout: Duration,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IgnoreStrategySetting {
    /// Ask `git check-ignore`.
    Git,
    /// Evaluate `.gitignore` files in-process.
    Rules,
    None,
}

impl FromStr for IgnoreStrategySetting {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "git" => Ok(Self::Git),
            "rules" => Ok(Self::Rules),
            "none" => Ok(Self::None),
            other => Err(format!(
                "unknown strategy `{other}` (expected git, rules or none)"
            )),
        }
    }
}

#[derive(Debug, Clone)]
pub struct PrecomputeSettings {
    /// Already folded in: `include_gitignored` forces [`IgnoreStrategySetting::None`].
    pub ignore_strategy: IgnoreStrategySetting,
    pub include_code: bool,
    pub concurrency: NonZeroUsize,
    pub probe_timeout: Duration,
    pub python: String,
    pub marimo: String,
    pub on_start: bool,
}

#[derive(Debug, Error)]
pub enum LoadError {
    #[error("failed to build configuration: {0}")]
    Build(#[from] config::ConfigError),
    #[error("invalid configuration for `{key}`: {reason}")]
    Invalid { key: &'static str, reason: String },
}

impl LoadError {
    fn invalid(key: &'static str, reason: impl Into<String>) -> Self {
        Self::Invalid {
            key,
            reason: reason.into(),
        }
    }
}

/// Load settings using the configured precedence (file → environment → CLI).
pub fn load(cli: &CliArgs) -> Result<Settings, LoadError> {
    let mut builder = Config::builder()
        .add_source(File::with_name(DEFAULT_CONFIG_BASENAME).required(false))
        .add_source(File::with_name(LOCAL_CONFIG_BASENAME).required(false));

    if let Some(path) = cli.config_file.as_ref() {
        builder = builder.add_source(File::from(path.as_path()).required(true));
    }

    builder = builder.add_source(Environment::with_prefix(ENV_PREFIX).separator("__"));

    let mut raw: RawSettings = builder.build()?.try_deserialize()?;

    match cli.command.as_ref() {
        Some(Command::Serve(args)) => raw.apply_serve_args(args),
        Some(Command::Cache(args)) | Some(Command::List(args)) => raw.apply_precompute_args(args),
        None => raw.apply_serve_args(&ServeArgs::default()),
    }

    Settings::from_raw(raw)
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawSettings {
    server: RawServerSettings,
    logging: RawLoggingSettings,
    serving: RawServingSettings,
    auth: RawAuthSettings,
    live: RawLiveSettings,
    precompute: RawPrecomputeSettings,
}

impl RawSettings {
    fn apply_serve_args(&mut self, args: &ServeArgs) {
        if let Some(directory) = args.directory.as_ref() {
            self.serving.directory = Some(directory.clone());
        }

        let overrides = &args.overrides;
        self.apply_logging_overrides(&overrides.logging);
        if let Some(host) = overrides.host.as_ref() {
            self.server.host = Some(host.clone());
        }
        if let Some(port) = overrides.port {
            self.server.port = Some(port);
        }
        if let Some(base_url) = overrides.base_url.as_ref() {
            self.server.base_url = Some(base_url.clone());
        }
        if !overrides.allow_origins.is_empty() {
            self.server.allow_origins = Some(overrides.allow_origins.clone());
        }
        if let Some(seconds) = overrides.graceful_shutdown_seconds {
            self.server.graceful_shutdown_seconds = Some(seconds);
        }
        if let Some(include_code) = overrides.include_code {
            self.serving.include_code = Some(include_code);
        }
        if let Some(mode) = overrides.mode.as_ref() {
            self.serving.mode = Some(mode.clone());
        }
        if let Some(debug_cached) = overrides.debug_cached {
            self.serving.debug_cached = Some(debug_cached);
        }
        if let Some(limit) = overrides.max_buffer_bytes {
            self.serving.max_buffer_bytes = Some(limit);
        }
        if let Some(token) = overrides.token.as_ref() {
            self.auth.token = Some(token.clone());
        }
        if overrides.no_token {
            self.auth.no_token = Some(true);
        }
        if let Some(url) = overrides.upstream_url.as_ref() {
            self.live.upstream_url = Some(url.clone());
        }
        if let Some(spawn) = overrides.spawn_upstream {
            self.live.spawn = Some(spawn);
        }
        if let Some(on_start) = overrides.precompute_on_start {
            self.precompute.on_start = Some(on_start);
        }
    }

    fn apply_precompute_args(&mut self, args: &PrecomputeArgs) {
        if let Some(directory) = args.directory.as_ref() {
            self.serving.directory = Some(directory.clone());
        }

        let overrides = &args.overrides;
        self.apply_logging_overrides(&overrides.logging);
        if overrides.include_gitignored {
            self.precompute.include_gitignored = Some(true);
        }
        if let Some(strategy) = overrides.ignore_strategy.as_ref() {
            self.precompute.ignore_strategy = Some(strategy.clone());
        }
        if let Some(include_code) = overrides.include_code {
            self.precompute.include_code = Some(include_code);
        }
        if let Some(concurrency) = overrides.concurrency {
            self.precompute.concurrency = Some(concurrency);
        }
        if let Some(seconds) = overrides.probe_timeout_seconds {
            self.precompute.probe_timeout_seconds = Some(seconds);
        }
        if let Some(python) = overrides.python.as_ref() {
            self.precompute.python = Some(python.clone());
        }
        if let Some(marimo) = overrides.marimo.as_ref() {
            self.precompute.marimo = Some(marimo.clone());
        }
    }

    fn apply_logging_overrides(&mut self, overrides: &LoggingOverrides) {
        if let Some(level) = overrides.log_level.as_ref() {
            self.logging.level = Some(level.clone());
        }
        if let Some(json) = overrides.log_json {
            self.logging.json = Some(json);
        }
    }
}

impl Settings {
    fn from_raw(raw: RawSettings) -> Result<Self, LoadError> {
        let RawSettings {
            server,
            logging,
            serving,
            auth,
            live,
            precompute,
        } = raw;

        let server = build_server_settings(server)?;
        let logging = build_logging_settings(logging)?;
        let serving = build_serving_settings(serving)?;
        let auth = build_auth_settings(auth)?;
        let live = build_live_settings(live)?;
        let precompute = build_precompute_settings(precompute)?;

        Ok(Self {
            server,
            logging,
            serving,
            auth,
            live,
            precompute,
        })
    }
}

fn build_server_settings(server: RawServerSettings) -> Result<ServerSettings, LoadError> {
    let host = server.host.unwrap_or_else(|| DEFAULT_HOST.to_string());
    let port = server.port.unwrap_or(DEFAULT_PORT);
    if port == 0 {
        return Err(LoadError::invalid(
            "server.port",
            "port must be greater than zero",
        ));
    }
    let addr = parse_socket_addr(&host, port)
        .map_err(|reason| LoadError::invalid("server.addr", reason))?;

    let base_url = normalize_base_url(server.base_url.as_deref().unwrap_or("/"));

    let allow_origins = server
        .allow_origins
        .unwrap_or_default()
        .into_iter()
        .map(|origin| origin.trim().to_string())
        .filter(|origin| !origin.is_empty())
        .collect();

    let graceful_secs = server
        .graceful_shutdown_seconds
        .unwrap_or(DEFAULT_GRACEFUL_SHUTDOWN_SECS);
    if graceful_secs == 0 {
        return Err(LoadError::invalid(
            "server.graceful_shutdown_seconds",
            "must be greater than zero",
        ));
    }

    Ok(ServerSettings {
        addr,
        base_url,
        allow_origins,
        graceful_shutdown: Duration::from_secs(graceful_secs),
    })
}

fn build_logging_settings(logging: RawLoggingSettings) -> Result<LoggingSettings, LoadError> {
    let level = match logging.level {
        Some(level) => LevelFilter::from_str(level.as_str()).map_err(|err| {
            LoadError::invalid("logging.level", format!("failed to parse: {err}"))
        })?,
        None => LevelFilter::INFO,
    };

    let format = if logging.json.unwrap_or(false) {
        LogFormat::Json
    } else {
        LogFormat::Compact
    };

    Ok(LoggingSettings { level, format })
}

fn build_serving_settings(serving: RawServingSettings) -> Result<ServingSettings, LoadError> {
    let directory = serving
        .directory
        .unwrap_or_else(|| PathBuf::from(DEFAULT_DIRECTORY));

    let mode = match serving.mode {
        Some(mode) => {
            ServingMode::from_str(&mode).map_err(|reason| LoadError::invalid("serving.mode", reason))?
        }
        None => ServingMode::default(),
    };

    let max_buffer_bytes = non_zero_usize(
        serving.max_buffer_bytes.unwrap_or(DEFAULT_MAX_BUFFER_BYTES),
        "serving.max_buffer_bytes",
    )?;
    let snapshot_memo_limit = non_zero_usize(
        serving
            .snapshot_memo_limit
            .unwrap_or(DEFAULT_SNAPSHOT_MEMO_LIMIT),
        "serving.snapshot_memo_limit",
    )?;

    Ok(ServingSettings {
        directory,
        include_code: serving.include_code.unwrap_or(false),
        mode,
        debug_cached: serving.debug_cached.unwrap_or(false),
        max_buffer_bytes,
        snapshot_memo_limit,
    })
}

fn build_auth_settings(auth: RawAuthSettings) -> Result<AuthSettings, LoadError> {
    let raw_token = auth.token;
    let explicitly_empty = raw_token.as_deref().is_some_and(str::is_empty);
    let token = raw_token.filter(|token| !token.is_empty());
    let no_token = auth.no_token.unwrap_or(false);

    if no_token && token.is_some() {
        return Err(LoadError::invalid(
            "auth.no_token",
            "cannot be combined with auth.token",
        ));
    }

    Ok(AuthSettings {
        token,
        explicitly_disabled: no_token || explicitly_empty,
    })
}

fn build_live_settings(live: RawLiveSettings) -> Result<LiveSettings, LoadError> {
    let raw_url = live
        .upstream_url
        .unwrap_or_else(|| DEFAULT_UPSTREAM_URL.to_string());
    let upstream_url = Url::parse(raw_url.trim())
        .map_err(|err| LoadError::invalid("live.upstream_url", format!("failed to parse: {err}")))?;
    if !matches!(upstream_url.scheme(), "http" | "https") || upstream_url.host_str().is_none() {
        return Err(LoadError::invalid(
            "live.upstream_url",
            "must be an http(s) URL with a host",
        ));
    }

    let command = live
        .command
        .map(|command| command.trim().to_string())
        .filter(|command| !command.is_empty())
        .unwrap_or_else(|| DEFAULT_MARIMO_COMMAND.to_string());

    let startup_secs = live
        .startup_timeout_seconds
        .unwrap_or(DEFAULT_UPSTREAM_STARTUP_SECS);
    if startup_secs == 0 {
        return Err(LoadError::invalid(
            "live.startup_timeout_seconds",
            "must be greater than zero",
        ));
    }

    Ok(LiveSettings {
        upstream_url,
        spawn: live.spawn.unwrap_or(false),
        command,
        startup_timeout: Duration::from_secs(startup_secs),
    })
}

fn build_precompute_settings(
    precompute: RawPrecomputeSettings,
) -> Result<PrecomputeSettings, LoadError> {
    let strategy = match precompute.ignore_strategy {
        Some(value) => IgnoreStrategySetting::from_str(&value)
            .map_err(|reason| LoadError::invalid("precompute.ignore_strategy", reason))?,
        None => IgnoreStrategySetting::Git,
    };
    let ignore_strategy = if precompute.include_gitignored.unwrap_or(false) {
        IgnoreStrategySetting::None
    } else {
        strategy
    };

    let concurrency = non_zero_usize(
        precompute
            .concurrency
            .unwrap_or(DEFAULT_PRECOMPUTE_CONCURRENCY),
        "precompute.concurrency",
    )?;

    let timeout_secs = precompute
        .probe_timeout_seconds
        .unwrap_or(DEFAULT_PROBE_TIMEOUT_SECS);
    if timeout_secs == 0 {
        return Err(LoadError::invalid(
            "precompute.probe_timeout_seconds",
            "must be greater than zero",
        ));
    }

    Ok(PrecomputeSettings {
        ignore_strategy,
        include_code: precompute.include_code.unwrap_or(false),
        concurrency,
        probe_timeout: Duration::from_secs(timeout_secs),
        python: program_or(precompute.python, DEFAULT_PYTHON),
        marimo: program_or(precompute.marimo, DEFAULT_MARIMO_COMMAND),
        on_start: precompute.on_start.unwrap_or(false),
    })
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawServerSettings {
    host: Option<String>,
    port: Option<u16>,
    base_url: Option<String>,
    allow_origins: Option<Vec<String>>,
    graceful_shutdown_seconds: Option<u64>,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawLoggingSettings {
    level: Option<String>,
    json: Option<bool>,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawServingSettings {
    directory: Option<PathBuf>,
    include_code: Option<bool>,
    mode: Option<String>,
    debug_cached: Option<bool>,
    max_buffer_bytes: Option<u64>,
    snapshot_memo_limit: Option<u64>,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawAuthSettings {
    token: Option<String>,
    no_token: Option<bool>,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawLiveSettings {
    upstream_url: Option<String>,
    spawn: Option<bool>,
    command: Option<String>,
    startup_timeout_seconds: Option<u64>,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawPrecomputeSettings {
    include_gitignored: Option<bool>,
    ignore_strategy: Option<String>,
    include_code: Option<bool>,
    concurrency: Option<u64>,
    probe_timeout_seconds: Option<u64>,
    python: Option<String>,
    marimo: Option<String>,
    on_start: Option<bool>,
}

/// `/`, or a leading-slash prefix without a trailing slash.
pub fn normalize_base_url(raw: &str) -> String {
    let trimmed = raw.trim().trim_matches('/');
    if trimmed.is_empty() {
        "/".to_string()
    } else {
        format!("/{trimmed}")
    }
}

fn parse_socket_addr(host: &str, port: u16) -> Result<SocketAddr, String> {
    let candidate = if host.contains(':') && !host.starts_with('[') {
        format!("[{host}]:{port}")
    } else {
        format!("{host}:{port}")
    };
    candidate
        .parse()
        .map_err(|err| format!("invalid address `{candidate}`: {err}"))
}

fn non_zero_usize(value: u64, key: &'static str) -> Result<NonZeroUsize, LoadError> {
    let value: usize = value
        .try_into()
        .map_err(|_| LoadError::invalid(key, "value exceeds supported range"))?;
    NonZeroUsize::new(value).ok_or_else(|| LoadError::invalid(key, "must be greater than zero"))
}

fn program_or(value: Option<String>, default: &str) -> String {
    value
        .map(|program| program.trim().to_string())
        .filter(|program| !program.is_empty())
        .unwrap_or_else(|| default.to_string())
}

/// Resolve configuration using the supplied CLI arguments, returning both for downstream use.
pub fn load_with_cli() -> Result<(CliArgs, Settings), LoadError> {
    let args = CliArgs::parse();
    let settings = load(&args)?;
    Ok((args, settings))
}
