mod config;
mod sim;

use tracing_subscriber::EnvFilter;

use config::SimConfig;

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let mut config = SimConfig::load();
    config.apply_args(std::env::args().skip(1));
    if let Err(e) = config.validate() {
        tracing::error!("Invalid configuration: {e}");
        std::process::exit(2);
    }

    tracing::info!(
        clients = config.clients,
        run_secs = config.run_secs,
        latency_ms = config.store_latency_ms,
        "Blindpair simulator starting"
    );

    let report = match sim::run(config).await {
        Ok(report) => report,
        Err(e) => {
            tracing::error!("Simulation could not start: {e}");
            std::process::exit(2);
        },
    };

    tracing::info!(
        matches = report.matches,
        ghosts = report.ghosts,
        timeouts = report.timeouts,
        partner_skipped = report.partner_skipped,
        partner_left = report.partner_left,
        time_ups = report.time_ups,
        messages = report.messages_sent,
        "Simulation finished"
    );
}
