use std::sync::Once;

use metrics::{Unit, describe_counter, describe_gauge};
use tracing_error::ErrorLayer;
use tracing_subscriber::{
    EnvFilter, fmt,
    layer::{Layer, SubscriberExt},
    util::SubscriberInitExt,
};

use crate::application::precompute::METRIC_PRECOMPUTE_DOCUMENTS;
use crate::cache::middleware::{
    METRIC_CACHED_PASSTHROUGH, METRIC_CACHED_PATCH, METRIC_CACHED_UNAUTHORIZED,
};
use crate::cache::store::{METRIC_MEMO_HIT, METRIC_MEMO_MISS};
use crate::config::{LogFormat, LoggingSettings};
use crate::infra::http::connections::METRIC_ACTIVE_CONNECTIONS;

use super::error::InfraError;

static METRIC_DESCRIPTIONS: Once = Once::new();

/// Install a global tracing subscriber using the provided logging settings.
pub fn init(logging: &LoggingSettings) -> Result<(), InfraError> {
    describe_metrics();

    let env_filter = EnvFilter::builder()
        .with_default_directive(logging.level.into())
        .from_env_lossy();

    let fmt_layer = match logging.format {
        LogFormat::Json => fmt::layer()
            .json()
            .with_current_span(true)
            .with_span_list(true)
            .with_target(true)
            .boxed(),
        LogFormat::Compact => fmt::layer().compact().with_target(true).boxed(),
    };

    tracing_subscriber::registry()
        .with(env_filter)
        .with(ErrorLayer::default())
        .with(fmt_layer)
        .try_init()
        .map_err(|err| {
            InfraError::telemetry(format!("failed to install tracing subscriber: {err}"))
        })
}

fn describe_metrics() {
    METRIC_DESCRIPTIONS.call_once(|| {
        describe_counter!(
            METRIC_CACHED_PATCH,
            Unit::Count,
            "HTML responses patched with cached notebook state."
        );
        describe_counter!(
            METRIC_CACHED_PASSTHROUGH,
            Unit::Count,
            "Responses forwarded without touching the body."
        );
        describe_counter!(
            METRIC_CACHED_UNAUTHORIZED,
            Unit::Count,
            "Requests denied access to cached content."
        );
        describe_gauge!(
            METRIC_ACTIVE_CONNECTIONS,
            Unit::Count,
            "Currently open client connections."
        );
        describe_counter!(
            METRIC_PRECOMPUTE_DOCUMENTS,
            Unit::Count,
            "Documents processed by the precompute pass, labelled by outcome."
        );
        describe_counter!(
            METRIC_MEMO_HIT,
            Unit::Count,
            "Notebook snapshot memo hits."
        );
        describe_counter!(
            METRIC_MEMO_MISS,
            Unit::Count,
            "Notebook snapshot memo misses."
        );
    });
}
