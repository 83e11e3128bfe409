use std::collections::HashMap;

use lazy_static::lazy_static;
use log::info;
use std::sync::Arc;
use tokio::sync::RwLock;

use crate::errors::ParseError;
use crate::tlsheader::{self, ClientHello};

/// Everything the router needs to know about a hostname-bearing protocol.
pub struct Protocol {
    pub name: &'static str,
    pub default_port: u16,
    pub parse_packet: fn(&[u8]) -> Result<ClientHello, ParseError>,
    pub modify_packet: fn(&mut Vec<u8>, &ClientHello) -> Result<(), ParseError>,
    pub abort_message: &'static [u8],
}

impl Protocol {
    pub fn abort_message_len(&self) -> usize {
        self.abort_message.len()
    }
}

pub static TLS_PROTOCOL: Protocol = Protocol {
    name: "tls",
    default_port: 443,
    parse_packet: tlsheader::parse_tls_header,
    modify_packet: tlsheader::modify_tls_header,
    abort_message: &tlsheader::TLS_ALERT,
};

lazy_static! {
    static ref REGISTRY: Arc<RwLock<HashMap<String, &'static Protocol>>> =
        Arc::new(RwLock::new(HashMap::new()));
}

/// Register the built in protocols
pub async fn init() {
    register(&TLS_PROTOCOL).await;
}

pub async fn register(protocol: &'static Protocol) {
    let mut w = REGISTRY.write().await;
    if w.insert(protocol.name.to_ascii_lowercase(), protocol).is_none() {
        info!("registered protocol `{}` (default port {})", protocol.name, protocol.default_port);
    }
}

pub async fn lookup(name: &str) -> Option<&'static Protocol> {
    let r = REGISTRY.read().await;
    r.get(&name.to_ascii_lowercase()).copied()
}

pub async fn names() -> Vec<String> {
    let r = REGISTRY.read().await;
    let mut result: Vec<String> = r.keys().cloned().collect();
    result.sort();
    result
}
