use serde::{Deserialize, Serialize};

/// Registry server configuration file (YAML).
///
/// Every field is optional; missing values fall back to CLI flags or built-in
/// defaults.
///
/// Example `config.yaml`:
/// ```yaml
/// port: 8761
/// peers:
///   - registry-2:8761
///   - registry-3:8761
/// lease:
///   duration-secs: 90
///   renewal-interval-secs: 30
/// eviction:
///   interval-secs: 60
///   renewal-percent-threshold: 0.85
///   cap-percent: 0.15
///   self-preservation: true
/// cache:
///   refresh-interval-secs: 30
///   refresh-mode: on-dirty
/// replication:
///   max-batch-size: 250
///   max-retries: 3
/// ```
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ServerConfigFile {
    #[serde(default)]
    pub port: Option<u16>,
    #[serde(default)]
    pub peers: Vec<String>,
    #[serde(default, alias = "log-json")]
    pub log_json: Option<bool>,
    #[serde(default)]
    pub lease: LeaseSection,
    #[serde(default)]
    pub eviction: EvictionSection,
    #[serde(default)]
    pub cache: CacheSection,
    #[serde(default)]
    pub replication: ReplicationSection,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LeaseSection {
    #[serde(default, alias = "duration-secs")]
    pub duration_secs: Option<u64>,
    #[serde(default, alias = "renewal-interval-secs")]
    pub renewal_interval_secs: Option<u64>,
    #[serde(default, alias = "delta-retention-secs")]
    pub delta_retention_secs: Option<u64>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EvictionSection {
    #[serde(default, alias = "interval-secs")]
    pub interval_secs: Option<u64>,
    #[serde(default, alias = "renewal-percent-threshold")]
    pub renewal_percent_threshold: Option<f64>,
    #[serde(default, alias = "cap-percent")]
    pub cap_percent: Option<f64>,
    #[serde(default, alias = "self-preservation")]
    pub self_preservation: Option<bool>,
    #[serde(default, alias = "warmup-secs")]
    pub warmup_secs: Option<u64>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CacheSection {
    #[serde(default, alias = "refresh-interval-secs")]
    pub refresh_interval_secs: Option<u64>,
    /// `interval` or `on-dirty`.
    #[serde(default, alias = "refresh-mode")]
    pub refresh_mode: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ReplicationSection {
    #[serde(default, alias = "queue-capacity")]
    pub queue_capacity: Option<usize>,
    #[serde(default, alias = "max-batch-size")]
    pub max_batch_size: Option<usize>,
    #[serde(default, alias = "batching-delay-ms")]
    pub batching_delay_ms: Option<u64>,
    #[serde(default, alias = "max-retries")]
    pub max_retries: Option<u32>,
    #[serde(default, alias = "retry-backoff-ms")]
    pub retry_backoff_ms: Option<u64>,
    #[serde(default, alias = "request-timeout-ms")]
    pub request_timeout_ms: Option<u64>,
}

/// Load a YAML config file, returning the default if the file doesn't exist.
pub fn load_config_file<T: serde::de::DeserializeOwned + Default>(path: &str) -> anyhow::Result<T> {
    let content = match std::fs::read_to_string(path) {
        Ok(c) => c,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            return Ok(T::default());
        }
        Err(e) => return Err(e.into()),
    };
    let config: T = serde_yaml::from_str(&content)?;
    Ok(config)
}
