//! `taskpilot` service binary.
//!
//! ```text
//! taskpilot                      run background jobs until Ctrl+C / SIGTERM
//! taskpilot analyze <text...>    analyze one message and print the result
//! ```

use anyhow::Context;
use std::net::SocketAddr;
use std::sync::Arc;
use taskpilot_resilience::clock::{Clock, SystemClock};
use taskpilot_resilience::metrics::MetricsServer;
use taskpilot_resilience::scheduler::{Schedule, ScheduledJob, run_scheduled};
use taskpilot_service::shutdown::{ShutdownCoordinator, wait_for_signal};
use taskpilot_service::{ResilienceStatusJob, ServiceConfig, Services, telemetry};
use tracing::{info, warn};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load environment variables from .env file (if present)
    let _ = dotenvy::dotenv();

    let config = ServiceConfig::from_env().context("loading configuration")?;
    telemetry::init_tracing(&config.observability)?;
    info!(environment = %config.environment, "Starting taskpilot");

    let mut metrics = None;
    if config.observability.metrics_enabled {
        let mut server = MetricsServer::new(SocketAddr::from((
            [0, 0, 0, 0],
            config.observability.metrics_port,
        )));
        server.start().context("starting metrics exporter")?;
        info!(port = config.observability.metrics_port, "Metrics exporter listening");
        metrics = Some(server);
    }

    let services = Services::from_config(&config);

    let args: Vec<String> = std::env::args().skip(1).collect();
    if args.first().map(String::as_str) == Some("analyze") {
        let text = args[1..].join(" ");
        let result = services.analyzer.analyze_or_fallback(&text, "cli").await;
        println!("{}", serde_json::to_string_pretty(&result)?);
        return Ok(());
    }

    let mut coordinator = ShutdownCoordinator::new(config.scheduler.shutdown_timeout());
    let clock: Arc<dyn Clock> = Arc::new(SystemClock);

    let status_job = Arc::new(ResilienceStatusJob::new(
        Arc::clone(&services.registry),
        vec![Arc::clone(&services.llm_limiter)],
    ));
    let name = status_job.name().to_string();
    coordinator.track(
        name,
        tokio::spawn(run_scheduled(
            status_job,
            Schedule::Every(config.scheduler.status_report_interval()),
            config.scheduler.fallback_delay(),
            Arc::clone(&clock),
            coordinator.subscribe(),
        )),
    );

    info!(tasks = coordinator.task_count(), "taskpilot running");
    wait_for_signal().await.context("waiting for shutdown signal")?;

    if let Err(errors) = coordinator.shutdown().await {
        for error in errors {
            warn!(%error, "Background task did not stop cleanly");
        }
    }

    drop(metrics);
    info!("taskpilot stopped");
    Ok(())
}
