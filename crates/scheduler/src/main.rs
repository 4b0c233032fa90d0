use clap::Parser;

use relayq_scheduler::SchedulerSettings;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load .env file if present (before parsing, so it can supply flags)
    let _ = dotenvy::dotenv();

    let settings = SchedulerSettings::parse();
    relayq_observability::tracing::init(&settings.log_config());

    relayq_scheduler::run(settings, shutdown_signal()).await
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %e, "failed to listen for ctrl-c");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                tracing::error!(error = %e, "failed to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
