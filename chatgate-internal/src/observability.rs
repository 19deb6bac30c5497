//! Logs and metrics setup for the gateway binary.

use clap::ValueEnum;
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, Layer};

use crate::error::{Error, ErrorDetails};

const DEFAULT_LOG_FILTER: &str = "gateway=debug,chatgate_internal=debug,warn";

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, ValueEnum)]
#[clap(rename_all = "snake_case")]
pub enum LogFormat {
    #[default]
    Pretty,
    Json,
}

/// Installs the global `tracing` subscriber.
///
/// `RUST_LOG` overrides the default filter.
pub fn setup_observability(log_format: LogFormat) -> Result<(), Error> {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(DEFAULT_LOG_FILTER))
        .map_err(|e| {
            Error::new_without_logging(ErrorDetails::Config {
                message: format!("Invalid log filter: {e}"),
            })
        })?;

    let fmt_layer = match log_format {
        LogFormat::Pretty => tracing_subscriber::fmt::layer().boxed(),
        LogFormat::Json => tracing_subscriber::fmt::layer()
            .json()
            .with_current_span(false)
            .boxed(),
    };

    tracing_subscriber::registry()
        .with(fmt_layer.with_filter(filter))
        .try_init()
        .map_err(|e| {
            Error::new_without_logging(ErrorDetails::Observability {
                message: format!("Failed to install tracing subscriber: {e}"),
            })
        })
}

/// Installs the process-wide Prometheus recorder and returns the render handle
pub fn setup_metrics() -> Result<PrometheusHandle, Error> {
    let handle = PrometheusBuilder::new().install_recorder().map_err(|e| {
        Error::new(ErrorDetails::Observability {
            message: format!("Failed to install Prometheus exporter: {e}"),
        })
    })?;
    describe_metrics();
    Ok(handle)
}

fn describe_metrics() {
    metrics::describe_counter!(
        "chatgate_chat_turns_total",
        "AI chat turns by outcome (success, soft_fail)"
    );
    metrics::describe_counter!(
        "chatgate_rate_limit_rejections_total",
        "Requests rejected by a rate limit rule"
    );
    metrics::describe_counter!(
        "chatgate_quota_rejections_total",
        "Requests rejected by a per-user quota"
    );
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_log_format_parses_from_cli_value() {
        assert_eq!(LogFormat::from_str("json", true).unwrap(), LogFormat::Json);
        assert_eq!(LogFormat::from_str("pretty", true).unwrap(), LogFormat::Pretty);
        assert!(LogFormat::from_str("xml", true).is_err());
    }

    #[test]
    fn test_default_filter_is_valid() {
        assert!(EnvFilter::try_new(DEFAULT_LOG_FILTER).is_ok());
    }
}
