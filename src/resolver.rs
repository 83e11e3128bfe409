use std::collections::HashMap;

use lazy_static::lazy_static;
use std::sync::Arc;
use tokio::sync::RwLock;
use crate::config::Config;
use log::info;

lazy_static! {
    static ref OVERRIDES: Arc<RwLock<HashMap<String, String>>> = Arc::new(RwLock::new(HashMap::new()));
}

pub async fn init(config:&Config) {
    info!("initializing DNS override");
    init_inner(&config.dns).await;
    info!("initialized DNS override. {} entries loaded", config.dns.len());
}

async fn init_inner(new:&HashMap<String, String>) {
    let mut w = OVERRIDES.write().await;
    *w = normalize(new);
}

fn normalize(dns:&HashMap<String, String>) -> HashMap<String, String> {
    dns.iter()
        .map(|(host, target)| (host.to_ascii_lowercase(), target.clone()))
        .collect()
}

fn lookup(overrides:&HashMap<String, String>, host:&str) -> String {
    match overrides.get(&host.to_ascii_lowercase()) {
        Some(target) => target.clone(),
        None => host.into(),
    }
}

/// Map a server name to the host we should connect to. Names without an
/// override resolve to themselves.
pub async fn resolve(host:&str) -> String {
    let r = OVERRIDES.read().await;
    lookup(&r, host)
}
