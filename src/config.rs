use anyhow::Error;
use clap::Parser;
use serde::{Deserialize, Serialize};

#[derive(Parser, Debug)]
#[command(version)]
pub struct Cli {
    #[clap(long, default_value = "sipswitch.toml")]
    pub conf: Option<String>,
}

#[derive(Debug, Deserialize, Default)]
#[serde(default)]
pub struct Config {
    pub log_level: Option<String>,
    pub log_file: Option<String>,
    pub proxy: ProxyConfig,
    pub callrecord: Option<CallRecordConfig>,
}

#[derive(Debug, Deserialize, Clone, Serialize)]
#[serde(tag = "type")]
#[serde(rename_all = "snake_case")]
pub enum UserBackendConfig {
    Memory {
        #[serde(default)]
        users: Vec<String>,
    },
    Plain {
        path: String,
    },
}

#[derive(Debug, Deserialize, Clone, Serialize)]
#[serde(tag = "type")]
#[serde(rename_all = "snake_case")]
pub enum CallRecordConfig {
    Log,
    Local { root: String },
}

#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct ProxyConfig {
    pub modules: Option<Vec<String>>,
    pub addr: String,
    pub udp_port: u16,
    pub external_ip: Option<String>,
    pub external_port: Option<u16>,
    pub useragent: Option<String>,
    pub max_concurrency: Option<usize>,
    /// Default registration lifetime, seconds.
    pub registrar_expires: u32,
    /// How long an INVITE may wait for a final response, seconds.
    pub invite_timeout: u64,
    /// Timeout for forwarded BYE and CANCEL, seconds.
    pub in_dialog_timeout: u64,
    pub transaction_sweep_interval: u64,
    pub user_backend: UserBackendConfig,
}

impl Default for ProxyConfig {
    fn default() -> Self {
        Self {
            modules: Some(vec!["registrar".to_string(), "call".to_string()]),
            addr: "0.0.0.0".to_string(),
            udp_port: 5060,
            external_ip: None,
            external_port: None,
            useragent: None,
            max_concurrency: None,
            registrar_expires: 60,
            invite_timeout: 35,
            in_dialog_timeout: 5,
            transaction_sweep_interval: 10,
            user_backend: UserBackendConfig::default(),
        }
    }
}

impl Default for UserBackendConfig {
    fn default() -> Self {
        Self::Memory { users: vec![] }
    }
}

impl Default for CallRecordConfig {
    fn default() -> Self {
        Self::Log
    }
}

impl Config {
    pub fn load(path: &str) -> Result<Self, Error> {
        let config = toml::from_str(
            &std::fs::read_to_string(path).map_err(|e| anyhow::anyhow!("{}: {}", e, path))?,
        )?;
        Ok(config)
    }
}
