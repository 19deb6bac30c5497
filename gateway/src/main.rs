use clap::Parser;
use mimalloc::MiMalloc;
use std::fmt::Display;
use std::io::ErrorKind;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::signal;

use chatgate_internal::config::{Config, StoreConfig};
use chatgate_internal::endpoints::status::CHATGATE_VERSION;
use chatgate_internal::error;
use chatgate_internal::gateway_util::{self, AppStateData};
use chatgate_internal::observability::{self, LogFormat};

#[global_allocator]
static GLOBAL: MiMalloc = MiMalloc;

#[derive(Parser, Debug)]
#[command(version, about)]
struct Args {
    /// Use the `chatgate.toml` config file at the specified path
    #[arg(long)]
    config_file: Option<PathBuf>,

    /// Sets the log format used for all gateway logs.
    #[arg(long)]
    #[arg(value_enum)]
    #[clap(default_value_t = LogFormat::default())]
    log_format: LogFormat,
}

#[tokio::main]
async fn main() {
    let args = Args::parse();
    // Set up logs and metrics immediately, so that we can use `tracing`.
    observability::setup_observability(args.log_format).expect_pretty("Failed to set up logs");

    let git_sha = chatgate_internal::built_info::GIT_COMMIT_HASH_SHORT.unwrap_or("unknown");

    tracing::info!("Starting chatgate {CHATGATE_VERSION} (commit: {git_sha})");

    let metrics_handle = observability::setup_metrics().expect_pretty("Failed to set up metrics");

    let config = if let Some(path) = &args.config_file {
        Arc::new(
            Config::load_and_verify_from_path(path)
                .await
                .ok() // Don't print the error here, since it was already printed when it was constructed
                .expect_pretty("Failed to load config"),
        )
    } else {
        tracing::warn!("No config file provided, so default settings will be used. Use `--config-file path/to/chatgate.toml` to specify a config file.");
        Arc::new(Config::default())
    };

    // Set debug mode
    error::set_debug(config.gateway.debug).expect_pretty("Failed to set debug mode");

    let app_state = AppStateData::new(config.clone())
        .await
        .expect_pretty("Failed to initialize AppState")
        .with_metrics_handle(metrics_handle);
    app_state.start_background_tasks().await;

    let rate_limiting_pretty = match &app_state.rate_limit {
        Some(rate_limit) => format!(
            "enabled ({} rules, {:?} backend)",
            rate_limit.resolver.rule_count(),
            config.rate_limits.backend
        ),
        None => "disabled".to_string(),
    };
    let quota_pretty = match &app_state.quota {
        Some(quota) => format!("enabled ({} per day)", quota.settings.daily_limit),
        None => "disabled".to_string(),
    };
    let store_pretty = match &config.store {
        StoreConfig::Memory => "in-memory".to_string(),
        StoreConfig::Rest { url, .. } => format!("rest ({url})"),
    };

    let router = gateway_util::build_router(app_state.clone());

    // Bind to the socket address specified in the config, or default to 0.0.0.0:3000
    let bind_address = config
        .gateway
        .bind_address
        .unwrap_or_else(|| SocketAddr::from(([0, 0, 0, 0], 3000)));

    let listener = match tokio::net::TcpListener::bind(bind_address).await {
        Ok(listener) => listener,
        Err(e) if e.kind() == ErrorKind::AddrInUse => {
            tracing::error!(
                "Failed to bind to socket address {bind_address}: {e}. Tip: Ensure no other process is using port {} or try a different port.",
                bind_address.port()
            );
            std::process::exit(1);
        }
        Err(e) => {
            tracing::error!("Failed to bind to socket address {bind_address}: {e}");
            std::process::exit(1);
        }
    };
    // This will give us the chosen port if the user specified a port of 0
    let actual_bind_address = listener
        .local_addr()
        .expect_pretty("Failed to get bind address from listener");

    let config_path_pretty = if let Some(path) = &args.config_file {
        format!("config file `{}`", path.to_string_lossy())
    } else {
        "no config file".to_string()
    };

    tracing::info!(
        "chatgate is listening on {actual_bind_address} with {config_path_pretty}, store {store_pretty}, rate limiting {rate_limiting_pretty}, and quotas {quota_pretty}.",
    );

    // Client addresses feed the IP-keyed rate limit rules
    axum::serve(
        listener,
        router.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown_signal())
    .await
    .expect_pretty("Failed to start server");

    app_state.stop_background_tasks().await;
}

pub async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect_pretty("Failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect_pretty("Failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    #[cfg(unix)]
    let hangup = async {
        signal::unix::signal(signal::unix::SignalKind::hangup())
            .expect_pretty("Failed to install SIGHUP handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let hangup = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            tracing::info!("Received Ctrl+C signal");
        }
        _ = terminate => {
            tracing::info!("Received SIGTERM signal");
        }
        _ = hangup => {
            tokio::time::sleep(std::time::Duration::from_secs(1)).await;
            tracing::info!("Received SIGHUP signal");
        }
    };
}

/// We don't allow panic, escape, unwrap, or similar methods in the codebase,
/// except for the private `expect_pretty` method, which is to be used only in
/// main.rs during initialization. After initialization, we expect all code to
/// handle errors gracefully.
///
/// `expect_pretty` logs the error message and exits with a status code of 1.
trait ExpectPretty<T> {
    fn expect_pretty(self, msg: &str) -> T;
}

impl<T, E: Display> ExpectPretty<T> for Result<T, E> {
    fn expect_pretty(self, msg: &str) -> T {
        match self {
            Ok(value) => value,
            Err(err) => {
                tracing::error!("{msg}: {err}");
                std::process::exit(1);
            }
        }
    }
}

impl<T> ExpectPretty<T> for Option<T> {
    fn expect_pretty(self, msg: &str) -> T {
        match self {
            Some(value) => value,
            None => {
                tracing::error!("{msg}");
                std::process::exit(1);
            }
        }
    }
}
