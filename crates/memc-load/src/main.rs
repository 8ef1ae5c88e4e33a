//! memc-load - load installed-apps logs into memcached

use anyhow::Result;
use clap::Parser;
use memc_common::logging::init_logging;
use memc_load::{selftest, Cli, Destinations, LoadCoordinator};
use tracing::{debug, error, info, warn};

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();

    // Environment variables take precedence over flags, except that a dry
    // run always logs its records
    let log_config = cli.enforce_dry_run_logging(cli.log_config().merge_env()?);
    let _guard = init_logging(&log_config)?;
    debug!("Logging configured: {}", serde_json::to_string(&log_config)?);

    if cli.self_test {
        selftest::run()?;
        info!("Self-test passed");
        return Ok(());
    }

    let config = cli.loader_config();
    config.validate()?;
    info!("Memc loader started with options: {:?}", cli);

    let destinations = Destinations::connect(&config);
    let coordinator = LoadCoordinator::new(config, destinations);

    let cancel = coordinator.cancellation_token();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Interrupted, stopping load");
            cancel.cancel();
        }
    });

    if let Err(e) = coordinator.run().await {
        error!("Unexpected error: {}", e);
        return Err(e.into());
    }

    Ok(())
}
