use std::sync::Arc;

use anyhow::Context;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};
use tracing_subscriber::{EnvFilter, fmt, prelude::*};

use jobwarden::api;
use jobwarden::config::JobsConfig;
use jobwarden::deps::Dependencies;
use jobwarden::handler::HandlerRegistry;
use jobwarden::handler::builtin::CanaryHandler;
use jobwarden::service::JobService;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Stdout always; a daily-rolling file as well when a log dir is set.
    let (file_layer, _log_guard) = match std::env::var("JOBWARDEN_LOG_DIR") {
        Ok(dir) => {
            let appender = tracing_appender::rolling::daily(dir, "jobwarden.log");
            let (writer, guard) = tracing_appender::non_blocking(appender);
            (
                Some(fmt::layer().with_ansi(false).with_writer(writer)),
                Some(guard),
            )
        }
        Err(_) => (None, None),
    };
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with(fmt::layer().with_target(false))
        .with(file_layer)
        .init();

    let config = JobsConfig::from_env().context("invalid configuration")?;
    let http_port = config.http_port;

    eprintln!("jobwarden v{}", env!("CARGO_PKG_VERSION"));
    eprintln!("   Database: {}", config.db_path.display());
    eprintln!("   Worker slots: {}", config.worker_slots);
    eprintln!("   API: http://0.0.0.0:{}/api/jobs", http_port);
    eprintln!("   Metrics: http://0.0.0.0:{}/metrics\n", http_port);

    let mut handlers = HandlerRegistry::new();
    handlers.register(Arc::new(CanaryHandler))?;

    let deps = Dependencies::open(config, handlers)
        .await
        .context("failed to open job store")?;
    let service = JobService::new(deps);

    let listener = TcpListener::bind(("0.0.0.0", http_port))
        .await
        .with_context(|| format!("failed to bind port {http_port}"))?;

    // Probes answer while startup recovery runs. Job routes return 503
    // and readiness stays false until it ends.
    let shutdown = CancellationToken::new();
    let server = tokio::spawn(api::serve(
        listener,
        api::routes(Arc::clone(&service)),
        shutdown.clone().cancelled_owned(),
    ));

    let report = service.start().await.context("startup recovery failed")?;
    info!(
        scanned = report.scanned,
        resumed = report.resumed,
        retried = report.retried,
        dead_lettered = report.dead_lettered,
        "Startup recovery complete"
    );

    tokio::signal::ctrl_c()
        .await
        .context("failed to listen for ctrl-c")?;
    info!("Shutdown requested");

    shutdown.cancel();
    service.shutdown().await;
    match server.await {
        Ok(Ok(())) => {}
        Ok(Err(e)) => error!(error = %e, "HTTP server failed"),
        Err(e) => error!(error = %e, "HTTP server task failed"),
    }
    Ok(())
}
