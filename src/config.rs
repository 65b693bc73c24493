use crate::error::{Error, Result};
use serde::Deserialize;
use std::fs;

#[derive(Debug, Clone, Deserialize)]
pub struct SubscriptionConfig {
    pub name: String,
    #[serde(default)]
    pub params: Vec<serde_json::Value>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Config {
    pub server_addr: String,
    pub postgres_url: Option<String>,
    pub reconnect_delay_ms: u64,
    pub fetch_concurrency: usize,
    pub subscriptions: Vec<SubscriptionConfig>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            // Default DDP dev server port
            server_addr: "127.0.0.1:3000".to_string(),
            postgres_url: None,
            reconnect_delay_ms: 1000,
            fetch_concurrency: 16,
            subscriptions: Vec::new(),
        }
    }
}

impl Config {
    pub fn load() -> Result<Self> {
        // Priority: explicit file (LIVEDATA_CONFIG) or ./config.toml → env → defaults
        let _ = dotenvy::dotenv();
        let path = std::env::var("LIVEDATA_CONFIG").unwrap_or_else(|_| "config.toml".to_string());
        let mut cfg = match fs::read_to_string(&path) {
            Ok(contents) => toml::from_str::<Config>(&contents)
                .map_err(|e| Error::Msg(format!("Failed to parse {}: {}", path, e)))?,
            Err(_) => Config::default(),
        };
        cfg.apply_env();
        Ok(cfg)
    }

    fn apply_env(&mut self) {
        if let Ok(addr) = std::env::var("LIVEDATA_SERVER_ADDR") {
            self.server_addr = addr;
        }
        if let Ok(pg) = std::env::var("LIVEDATA_POSTGRES_URL") {
            self.postgres_url = Some(pg);
        }
        if let Some(ms) = std::env::var("LIVEDATA_RECONNECT_DELAY_MS").ok().and_then(|v| v.parse().ok()) {
            self.reconnect_delay_ms = ms;
        }
    }

    pub fn fetch_concurrency(&self) -> usize {
        self.fetch_concurrency.max(1)
    }
}
