use anyhow::Error;
use clap::Parser;
use serde::Deserialize;

#[derive(Parser, Debug)]
#[command(version)]
pub struct Cli {
    #[clap(long, default_value = "callflow.toml")]
    pub conf: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct Config {
    pub http_addr: String,
    pub log_level: Option<String>,
    pub log_file: Option<String>,
    /// Directory of call-flow JSON documents, one per named flow.
    pub flows_path: String,
    /// Flow used by `/call/originate` when the request names none.
    pub default_flow: String,
    /// Gateway used for dial options built from originate requests.
    pub default_gate: String,
    /// Capacity of the correlator -> dispatcher event queue.
    pub event_queue_size: usize,
    /// Seconds a stopped room lingers before the reaper removes it.
    pub grace_period_secs: u64,
    /// Bounded wait for live calls to drain on shutdown.
    pub shutdown_wait_secs: u64,
    pub ari: AriConfig,
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct AriConfig {
    pub host: String,
    pub port: u16,
    pub username: String,
    pub password: String,
    /// Stasis application name channels are placed into.
    pub app: String,
    /// Per-request timeout for REST calls.
    pub timeout_secs: u64,
    /// Attempts per REST call: first try, immediate retry, then backoff.
    pub attempts: u32,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            http_addr: "0.0.0.0:8080".to_string(),
            log_level: Some("info".to_string()),
            log_file: None,
            flows_path: "flows".to_string(),
            default_flow: "oper_client".to_string(),
            default_gate: "asterisk_extapi-1".to_string(),
            event_queue_size: 1024,
            grace_period_secs: 60,
            shutdown_wait_secs: 10,
            ari: AriConfig::default(),
        }
    }
}

impl Default for AriConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 8088,
            username: "asterisk".to_string(),
            password: "asterisk".to_string(),
            app: "callflow".to_string(),
            timeout_secs: 5,
            attempts: 3,
        }
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
