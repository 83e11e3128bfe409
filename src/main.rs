use std::time::Duration;

use anyhow::Result;
use clap::Parser;
use log::{error, info};
use sniroute::{config::Config, manager};

#[derive(Parser, Debug, Clone)]
pub struct CliArg {
    #[arg(short, long, default_value_t = String::from("config.yaml"), help = "config file (yaml)")]
    pub config: String,
    #[arg(long, default_value_t = String::from("INFO"), help = "log level when no log4rs file is configured (ERROR INFO WARN DEBUG)")]
    pub log_level: String,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = CliArg::parse();
    let config = Config::load_file(&args.config).await?;
    config.init_logging(&args.log_level);
    info!("loaded config from `{}` with {} listener(s)", args.config, config.listeners.len());

    let stats_interval = Duration::from_millis(config.options.stats_interval_ms.max(1000));
    let results = manager::start(config).await?;
    let mut failed = 0;
    for (name, result) in &results {
        if let Err(cause) = result {
            error!("listener {name} not started: {cause}");
            failed += 1;
        }
    }
    if failed == results.len() {
        error!("no listener started. exiting");
        manager::stop().await;
        return Ok(());
    }

    let reporter = tokio::spawn(async move {
        loop {
            tokio::time::sleep(stats_interval).await;
            for stats in manager::all_stats().await {
                info!("**  Stats: {} **", stats.summary());
            }
        }
    });

    tokio::signal::ctrl_c().await?;
    info!("interrupted. shutting down");
    reporter.abort();
    manager::stop().await;
    Ok(())
}
