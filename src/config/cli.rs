use std::path::PathBuf;

use clap::{Args, Parser, Subcommand, ValueHint, builder::BoolishValueParser};

/// Command-line arguments for the marimo-gateway binary.
#[derive(Debug, Parser)]
#[command(
    name = "marimo-gateway",
    version,
    about = "Serve cached marimo exports in front of a live marimo server"
)]
pub struct CliArgs {
    /// Optional path to a configuration file.
    #[arg(
        long = "config-file",
        env = "MARIMO_GATEWAY_CONFIG_FILE",
        value_name = "PATH"
    )]
    pub config_file: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Option<Command>,
}

#[derive(Debug, Subcommand, Clone)]
pub enum Command {
    /// Run the HTTP gateway.
    Serve(Box<ServeArgs>),
    /// Export every application document into the cache.
    Cache(PrecomputeArgs),
    /// Print every application document that would be cached.
    List(PrecomputeArgs),
}

#[derive(Debug, Args, Default, Clone)]
pub struct ServeArgs {
    /// Directory of notebooks to serve.
    #[arg(value_name = "DIRECTORY", value_hint = ValueHint::DirPath)]
    pub directory: Option<PathBuf>,

    #[command(flatten)]
    pub overrides: ServeOverrides,
}

#[derive(Debug, Args, Default, Clone)]
pub struct PrecomputeArgs {
    /// Directory to scan for notebooks.
    #[arg(value_name = "DIRECTORY", value_hint = ValueHint::DirPath)]
    pub directory: Option<PathBuf>,

    #[command(flatten)]
    pub overrides: PrecomputeOverrides,
}

#[derive(Debug, Args, Default, Clone)]
pub struct LoggingOverrides {
    /// Override the base log level (trace|debug|info|warn|error).
    #[arg(long = "log-level", value_name = "LEVEL")]
    pub log_level: Option<String>,

    /// Toggle JSON logging.
    #[arg(
        long = "log-json",
        value_name = "BOOL",
        value_parser = BoolishValueParser::new()
    )]
    pub log_json: Option<bool>,
}

#[derive(Debug, Args, Default, Clone)]
pub struct ServeOverrides {
    #[command(flatten)]
    pub logging: LoggingOverrides,

    /// Override the listener host.
    #[arg(long = "host", value_name = "HOST")]
    pub host: Option<String>,

    /// Override the listener port.
    #[arg(long = "port", value_name = "PORT")]
    pub port: Option<u16>,

    /// Serve everything under this URL prefix.
    #[arg(long = "base-url", value_name = "PATH")]
    pub base_url: Option<String>,

    /// Allowed CORS origin; repeat for several.
    #[arg(long = "allow-origins", value_name = "ORIGIN")]
    pub allow_origins: Vec<String>,

    /// Override the graceful shutdown timeout.
    #[arg(long = "graceful-shutdown-seconds", value_name = "SECONDS")]
    pub graceful_shutdown_seconds: Option<u64>,

    /// Include notebook code in served pages.
    #[arg(
        long = "include-code",
        value_name = "BOOL",
        num_args = 0..=1,
        default_missing_value = "true",
        value_parser = BoolishValueParser::new()
    )]
    pub include_code: Option<bool>,

    /// Serving mode (hybrid|autoswitch).
    #[arg(long = "mode", value_name = "MODE")]
    pub mode: Option<String>,

    /// Expose the cached HTML route for debugging.
    #[arg(
        long = "debug-cached",
        value_name = "BOOL",
        num_args = 0..=1,
        default_missing_value = "true",
        value_parser = BoolishValueParser::new()
    )]
    pub debug_cached: Option<bool>,

    /// Upper bound for buffered HTML bodies.
    #[arg(long = "max-buffer-bytes", value_name = "BYTES")]
    pub max_buffer_bytes: Option<u64>,

    /// Access token required for cached content.
    #[arg(long = "token-password", value_name = "TOKEN")]
    pub token: Option<String>,

    /// Serve cached content without a token.
    #[arg(long = "no-token", action = clap::ArgAction::SetTrue)]
    pub no_token: bool,

    /// URL of the live marimo server.
    #[arg(long = "upstream-url", value_name = "URL")]
    pub upstream_url: Option<String>,

    /// Launch `marimo run` as a managed child process.
    #[arg(
        long = "spawn-upstream",
        value_name = "BOOL",
        num_args = 0..=1,
        default_missing_value = "true",
        value_parser = BoolishValueParser::new()
    )]
    pub spawn_upstream: Option<bool>,

    /// Run the precompute pass in the background on startup.
    #[arg(
        long = "precompute-on-start",
        value_name = "BOOL",
        num_args = 0..=1,
        default_missing_value = "true",
        value_parser = BoolishValueParser::new()
    )]
    pub precompute_on_start: Option<bool>,
}

#[derive(Debug, Args, Default, Clone)]
pub struct PrecomputeOverrides {
    #[command(flatten)]
    pub logging: LoggingOverrides,

    /// Include files ignored by version control.
    #[arg(long = "include-gitignored", action = clap::ArgAction::SetTrue)]
    pub include_gitignored: bool,

    /// Ignore strategy (git|rules|none).
    #[arg(long = "ignore-strategy", value_name = "STRATEGY")]
    pub ignore_strategy: Option<String>,

    /// Include notebook code in cached exports.
    #[arg(
        long = "include-code",
        value_name = "BOOL",
        num_args = 0..=1,
        default_missing_value = "true",
        value_parser = BoolishValueParser::new()
    )]
    pub include_code: Option<bool>,

    /// Maximum number of documents processed at once.
    #[arg(long = "concurrency", value_name = "COUNT")]
    pub concurrency: Option<u64>,

    /// Per-child-process timeout.
    #[arg(long = "probe-timeout-seconds", value_name = "SECONDS")]
    pub probe_timeout_seconds: Option<u64>,

    /// Python interpreter used to probe documents.
    #[arg(long = "python", value_name = "PROGRAM")]
    pub python: Option<String>,

    /// marimo executable used to export documents.
    #[arg(long = "marimo", value_name = "PROGRAM")]
    pub marimo: Option<String>,
}
