use clap::Parser;
use pkg_api::server::{ServerConfig, start_server};
use pkg_cache::response::RefreshMode;
use pkg_types::config::{ServerConfigFile, load_config_file};
use pkg_types::replication::PeerEndpoint;
use std::net::SocketAddr;
use std::time::Duration;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "regis-server", about = "Replicated service registry server")]
struct Cli {
    /// Path to YAML config file
    #[arg(long, short, default_value = "/etc/regis/config.yaml")]
    config: String,

    /// Port to listen on
    #[arg(long)]
    port: Option<u16>,

    /// Peer registry node as host:port (repeatable)
    #[arg(long = "peer")]
    peers: Vec<String>,

    /// This node's host:port as peers address it
    #[arg(long)]
    advertise: Option<String>,

    /// Emit logs as JSON lines
    #[arg(long)]
    log_json: bool,
}

fn init_tracing(json: bool) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let builder = tracing_subscriber::fmt().with_env_filter(filter);
    if json {
        builder.json().init();
    } else {
        builder.init();
    }
}

/// Merge: CLI args > config file > defaults.
fn build_config(cli: &Cli, file_cfg: ServerConfigFile) -> anyhow::Result<ServerConfig> {
    let mut config = ServerConfig::default();

    let port = cli.port.or(file_cfg.port).unwrap_or(config.addr.port());
    config.addr = SocketAddr::from(([0, 0, 0, 0], port));
    config.peers = if cli.peers.is_empty() {
        file_cfg.peers
    } else {
        cli.peers.clone()
    };
    config.advertise = cli.advertise.as_deref().map(PeerEndpoint::parse).transpose()?;

    let lease = file_cfg.lease;
    if let Some(secs) = lease.duration_secs {
        config.registry.default_lease_duration_secs = secs;
    }
    if let Some(secs) = lease.delta_retention_secs {
        config.registry.delta_retention_secs = secs;
    }
    if let Some(secs) = lease.renewal_interval_secs {
        config.eviction.expected_renewal_interval_secs = secs.max(1);
    }

    let eviction = file_cfg.eviction;
    if let Some(secs) = eviction.interval_secs {
        config.eviction.interval = Duration::from_secs(secs.max(1));
    }
    if let Some(pct) = eviction.renewal_percent_threshold {
        anyhow::ensure!(
            (0.0..=1.0).contains(&pct),
            "eviction.renewal-percent-threshold must be within 0..=1, got {}",
            pct
        );
        config.eviction.renewal_percent_threshold = pct;
    }
    if let Some(pct) = eviction.cap_percent {
        anyhow::ensure!(
            pct > 0.0 && pct <= 1.0,
            "eviction.cap-percent must be within (0, 1], got {}",
            pct
        );
        config.eviction.cap_percent = pct;
    }
    if let Some(enabled) = eviction.self_preservation {
        config.eviction.self_preservation = enabled;
    }
    config.eviction.warmup = Duration::from_secs(
        eviction
            .warmup_secs
            .unwrap_or(config.registry.default_lease_duration_secs),
    );

    let cache = file_cfg.cache;
    if let Some(secs) = cache.refresh_interval_secs {
        config.cache.refresh_interval = Duration::from_secs(secs.max(1));
    }
    if let Some(mode) = cache.refresh_mode.as_deref() {
        config.cache.mode = RefreshMode::parse(mode)?;
    }

    let replication = file_cfg.replication;
    if let Some(capacity) = replication.queue_capacity {
        config.replication.queue_capacity = capacity.max(1);
    }
    if let Some(size) = replication.max_batch_size {
        config.replication.max_batch_size = size.max(1);
    }
    if let Some(ms) = replication.batching_delay_ms {
        config.replication.batching_delay = Duration::from_millis(ms);
    }
    if let Some(retries) = replication.max_retries {
        config.replication.max_retries = retries;
    }
    if let Some(ms) = replication.retry_backoff_ms {
        config.replication.retry_backoff = Duration::from_millis(ms);
    }
    if let Some(ms) = replication.request_timeout_ms {
        config.peer_request_timeout = Duration::from_millis(ms);
    }

    Ok(config)
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // Load config file (returns defaults if file not found)
    let file_cfg: ServerConfigFile = load_config_file(&cli.config)?;
    init_tracing(cli.log_json || file_cfg.log_json.unwrap_or(false));
    info!("Config file: {}", cli.config);

    let config = build_config(&cli, file_cfg)?;

    info!("Starting regis-server");
    info!("  Listen:       {}", config.addr);
    info!("  Peers:        {:?}", config.peers);
    info!(
        "  Lease:        {}s",
        config.registry.default_lease_duration_secs
    );
    info!(
        "  Eviction:     every {}s, self-preservation={}",
        config.eviction.interval.as_secs(),
        config.eviction.self_preservation
    );
    info!("  Cache mode:   {:?}", config.cache.mode);

    start_server(config).await?;

    Ok(())
}
