use std::collections::HashMap;
use anyhow::Result;
use log::LevelFilter;
use log4rs::append::console::ConsoleAppender;
use log4rs::config::{Appender, Root};
use log4rs::encode::pattern::PatternEncoder;
use regex::Regex;
use tokio::fs;
use serde::{Serialize, Deserialize};

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Config {
    pub listeners: HashMap<String, Listener>,
    #[serde(default)]
    pub options: Options,
    #[serde(default)]
    pub dns: HashMap<String, String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Listener {
    pub bind: String,
    pub protocol: Option<String>,
    pub target_port: Option<u16>,
    pub policy: Policy,
    #[serde(default)]
    pub rules: Rules,
    /// Backend for handshakes that carry no server name
    pub fallback: Option<String>,
    /// Forward the client hello split into two records at the server name
    #[serde(default)]
    pub fragment: bool,
    pub max_idle_time_ms: Option<u64>,
}

impl Listener {
    pub fn max_idle_time_ms(&self) -> u64 {
        match self.max_idle_time_ms {
            Some(0) => u64::MAX,
            Some(inner) => inner,
            None => 3600000,
        }
    }

    pub fn protocol_name(&self) -> &str {
        self.protocol.as_deref().unwrap_or("tls")
    }

    fn match_host(&self, host:&str) -> bool {
        for static_host in &self.rules.static_hosts {
            if host.eq_ignore_ascii_case(static_host) {
                return true;
            }
        }

        for next_regex in &self.rules.patterns {
            if next_regex.is_match(host) {
                return true;
            }
        }
        false
    }

    pub fn is_allowed(&self, host:&str) -> bool {
        let matched = self.match_host(host);
        match self.policy {
            Policy::ALLOW => matched,
            Policy::DENY => !matched,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Rules {
    #[serde(default)]
    pub static_hosts: Vec<String>,
    #[serde(with = "serde_regex", default)]
    pub patterns: Vec<Regex>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub enum Policy {
    ALLOW,
    DENY
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Options {
    pub log_config_file: String,
    pub self_ips: Vec<String>,
    pub header_timeout_ms: u64,
    pub stats_interval_ms: u64,
}

impl Default for Options {
    fn default() -> Self {
        Self {
            log_config_file: "".into(),
            self_ips: Vec::new(),
            header_timeout_ms: 3000,
            stats_interval_ms: 30000,
        }
    }
}

impl Config {
    pub async fn load_file(filename:&str) -> Result<Config> {
        let content = fs::read_to_string(filename).await?;
        Self::load_string(&content)
    }

    pub fn load_string(content:&str) -> Result<Config> {
        let config:Config = serde_yaml::from_str(content)?;
        Ok(config)
    }

    /// Initialize log4rs from `log_config_file`, or a console logger at
    /// `fallback_level` when no file is configured or it can not be loaded.
    pub fn init_logging(&self, fallback_level: &str) {
        let log_conf_file = &self.options.log_config_file;
        if !log_conf_file.is_empty() {
            match log4rs::init_file(log_conf_file, Default::default()) {
                Err(cause) => {
                    println!("failed to initialize logging from `{log_conf_file}`: {cause}");
                },
                Ok(_) => {
                    println!("initialized logging from `{log_conf_file}`");
                    return;
                }
            }
        }
        let level = fallback_level.parse().unwrap_or(LevelFilter::Info);
        let stdout = ConsoleAppender::builder()
            .encoder(Box::new(PatternEncoder::new("{d(%Y-%m-%dT%H:%M:%S%.3f%:z)} {l:>5} - {m}{n}")))
            .build();
        let config = log4rs::config::Config::builder()
            .appender(Appender::builder().build("stdout", Box::new(stdout)))
            .build(Root::builder().appender("stdout").build(level));
        match config {
            Ok(config) => {
                if let Err(cause) = log4rs::init_config(config) {
                    println!("failed to initialize console logging: {cause}");
                }
            },
            Err(cause) => {
                println!("invalid console logging config: {cause}");
            }
        }
    }
}
