//! Bootstrap utilities for fileflow binaries.
//!
//! Shared initialization code for pipeline stage binaries.

use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use crate::config::{LOG_ENV_VAR, LOG_FORMAT_ENV_VAR};

/// Initialize tracing with FILEFLOW_LOG environment variable.
///
/// Defaults to "info" level if FILEFLOW_LOG is not set. Emits JSON lines
/// when FILEFLOW_LOG_FORMAT is `json`.
pub fn init_tracing() {
    let filter = tracing_subscriber::EnvFilter::try_from_env(LOG_ENV_VAR)
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    let registry = tracing_subscriber::registry().with(filter);

    if json_logs(std::env::var(LOG_FORMAT_ENV_VAR).ok().as_deref()) {
        registry.with(tracing_subscriber::fmt::layer().json()).init();
    } else {
        registry.with(tracing_subscriber::fmt::layer()).init();
    }
}

fn json_logs(format: Option<&str>) -> bool {
    format.is_some_and(|f| f.eq_ignore_ascii_case("json"))
}

/// Resolve once the process receives Ctrl-C or, on unix, SIGTERM.
pub async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %e, "Failed to listen for Ctrl-C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                tracing::error!(error = %e, "Failed to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("Received Ctrl-C"),
        _ = terminate => info!("Received SIGTERM"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_json_logs_selection() {
        assert!(json_logs(Some("json")));
        assert!(json_logs(Some("JSON")));
        assert!(!json_logs(Some("text")));
        assert!(!json_logs(None));
    }
}
