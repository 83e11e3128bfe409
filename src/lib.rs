pub mod config;
pub mod controller;
pub mod errors;
pub mod idletracker;
pub mod listener_stats;
pub mod manager;
pub mod protocol;
pub mod resolver;
pub mod runner;
pub mod tlsheader;

pub use errors::ParseError;
pub use protocol::{Protocol, TLS_PROTOCOL};
pub use tlsheader::{modify_tls_header, parse_tls_header, split_record, ClientHello, TLS_ALERT};
