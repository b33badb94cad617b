use anyhow::Context;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub socket_path: String,
    #[serde(default)]
    pub store: StoreConfig,
    /// Organizational domains never authenticated nor counted.
    /// Typically large freemail providers where any user can claim the domain.
    #[serde(default)]
    pub ignored_ods: Vec<String>,
    #[serde(default)]
    pub relay: RelayConfig,
    #[serde(default)]
    pub milter: MilterConfig,
    #[serde(default)]
    pub pid_file: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreConfig {
    #[serde(default)]
    pub backend: StoreBackend,
    #[serde(default = "default_store_url")]
    pub url: String,
    /// Upper bound on a single round trip, in milliseconds.
    #[serde(default = "default_store_timeout_ms")]
    pub timeout_ms: u64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StoreBackend {
    #[default]
    Redis,
    Memory,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RelayConfig {
    /// Client networks (CIDR) whose mail is outbound.
    #[serde(default)]
    pub networks: Vec<String>,
    /// Treat SASL-authenticated sessions as relaying.
    #[serde(default = "default_true")]
    pub sasl_authenticated: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MilterConfig {
    /// Only Authentication-Results headers stamped with this authserv-id are read.
    /// Without it DKIM verdicts are not taken from headers.
    #[serde(default)]
    pub authserv_id: Option<String>,
    #[serde(default = "default_true")]
    pub add_header: bool,
    #[serde(default = "default_header_name")]
    pub header_name: String,
}

fn default_store_url() -> String {
    "redis://127.0.0.1:6379/".to_string()
}

fn default_store_timeout_ms() -> u64 {
    2000
}

fn default_header_name() -> String {
    "X-Known-Senders".to_string()
}

fn default_true() -> bool {
    true
}

impl Default for StoreConfig {
    fn default() -> Self {
        StoreConfig {
            backend: StoreBackend::Redis,
            url: default_store_url(),
            timeout_ms: default_store_timeout_ms(),
        }
    }
}

impl Default for RelayConfig {
    fn default() -> Self {
        RelayConfig {
            networks: vec!["127.0.0.0/8".to_string(), "::1/128".to_string()],
            sasl_authenticated: true,
        }
    }
}

impl Default for MilterConfig {
    fn default() -> Self {
        MilterConfig {
            authserv_id: None,
            add_header: true,
            header_name: default_header_name(),
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Config {
            socket_path: "/var/run/known-senders.sock".to_string(),
            store: StoreConfig::default(),
            ignored_ods: vec![
                "gmail.com".to_string(),
                "yahoo.com".to_string(),
                "outlook.com".to_string(),
                "hotmail.com".to_string(),
                "aol.com".to_string(),
                "icloud.com".to_string(),
            ],
            relay: RelayConfig::default(),
            milter: MilterConfig::default(),
            pid_file: Some("/var/run/known-senders.pid".to_string()),
        }
    }
}

impl Config {
    pub fn from_file(path: &str) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read configuration: {path}"))?;
        Self::from_yaml(&content).with_context(|| format!("Failed to parse configuration: {path}"))
    }

    pub fn from_yaml(content: &str) -> anyhow::Result<Self> {
        let config: Config = serde_yaml::from_str(content)?;
        Ok(config)
    }

    pub fn to_file(&self, path: &str) -> anyhow::Result<()> {
        let content = serde_yaml::to_string(self)?;
        std::fs::write(path, content)?;
        Ok(())
    }
}
