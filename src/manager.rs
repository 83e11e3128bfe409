use std::collections::HashMap;
use std::net::IpAddr;
use std::time::Duration;

use crate::controller::Controller;
use crate::runner::Runner;
use crate::{config::Config, listener_stats::ListenerStats, protocol, resolver};
use anyhow::{anyhow, Result};
use lazy_static::lazy_static;
use log::{error, info, warn};
use std::sync::Arc;
use tokio::sync::{mpsc, RwLock};

#[derive(Debug, PartialEq, Clone)]
pub enum Status {
    STARTING,
    STARTED,
    STOPPING,
    STOPPED,
}

lazy_static! {
    static ref STATUS: Arc<RwLock<Status>> = Arc::new(RwLock::new(Status::STOPPED));
    static ref LISTENERS: Arc<RwLock<Vec<Arc<ListenerStats>>>> =
        Arc::new(RwLock::new(Vec::new()));
    static ref CONTROLLER: Arc<RwLock<Controller>> = Arc::new(RwLock::new(Controller::new()));
}

pub async fn get_run_status() -> Status {
    STATUS.read().await.clone()
}

pub async fn get_stats(name: &str) -> Option<Arc<ListenerStats>> {
    let r = LISTENERS.read().await;
    r.iter().find(|i| i.name == name).map(Arc::clone)
}

pub async fn all_stats() -> Vec<Arc<ListenerStats>> {
    LISTENERS.read().await.iter().map(Arc::clone).collect()
}

fn parse_self_ips(config: &Config) -> Vec<IpAddr> {
    let mut result = Vec::new();
    for ip in &config.options.self_ips {
        match ip.parse() {
            Ok(addr) => result.push(addr),
            Err(cause) => warn!("ignoring self ip `{ip}`: {cause}"),
        }
    }
    result
}

/// Start every configured listener. The returned map holds the start result
/// per listener name; the manager is `STARTED` even if some of them failed.
pub async fn start(config: Config) -> Result<HashMap<String, Result<()>>> {
    info!("starting manager");
    let mut status = STATUS.write().await;
    if *status != Status::STOPPED {
        warn!("starting manager: failed (still running)");
        return Err(anyhow!("failed to start, still running"));
    }
    *status = Status::STARTING;
    LISTENERS.write().await.clear();

    protocol::init().await;
    resolver::init(&config).await;

    let self_ips = parse_self_ips(&config);
    let header_timeout = Duration::from_millis(config.options.header_timeout_ms);
    let (tx, mut rx) = mpsc::channel(config.listeners.len().max(1));
    for (name, listener) in &config.listeners {
        let runner = Runner::new(
            name.clone(),
            listener.clone(),
            Arc::clone(&CONTROLLER),
            header_timeout,
            self_ips.clone(),
        );
        let name = name.clone();
        let tx = tx.clone();
        CONTROLLER.write().await.spawn(async move {
            let result = match runner.start().await {
                Ok(stats) => {
                    LISTENERS.write().await.push(stats);
                    info!("starting manager: {name} started OK");
                    Ok(())
                }
                Err(cause) => {
                    error!("starting manager: {name} start failed ({cause})");
                    Err(cause)
                }
            };
            let _ = tx.send((name, result)).await;
        }).await;
    }
    drop(tx);
    let mut results = HashMap::new();
    while let Some((name, result)) = rx.recv().await {
        results.insert(name, result);
    }
    info!("starting manager: succeeded");
    *status = Status::STARTED;
    Ok(results)
}

pub async fn stop() {
    info!("stopping manager");
    let mut status = STATUS.write().await;
    if *status == Status::STOPPED {
        info!("stopping manager: succeeded (already stopped)");
        return;
    }
    info!("transitioning from `{status:?}` to `{:?}`", Status::STOPPING);
    *status = Status::STOPPING;
    LISTENERS.write().await.clear();
    CONTROLLER.write().await.cancel().await;
    info!("all tasks cancelled by controller");
    *status = Status::STOPPED;
    info!("stopping manager: succeeded");
}
