//! Control-plane configuration.

use clap::Parser;
use std::path::PathBuf;
use std::time::Duration;

/// Command-line configuration; defaults match the documented policy.
#[derive(Debug, Parser)]
#[command(name = "kestrel-cp")]
#[command(about = "Kestrel control plane - VM placement and reconciliation")]
pub struct Config {
    /// Listen address for the REST API
    #[arg(short, long, default_value = "[::]:8080")]
    pub listen: String,

    /// Identity of this control-plane instance in elections
    #[arg(long)]
    pub instance_id: Option<String>,

    /// Data directory for persistent storage
    #[arg(short, long, default_value = "/var/lib/kestrel")]
    pub data_dir: PathBuf,

    /// Run in development mode (in-memory database, local downloads)
    #[arg(long)]
    pub dev: bool,

    // HA reconciler
    /// Enable the HA reconciler
    #[arg(long, default_value_t = true, action = clap::ArgAction::Set)]
    pub ha_enabled: bool,

    /// Seconds between HA heartbeat evaluations
    #[arg(long, default_value_t = 10)]
    pub ha_check_interval_secs: u64,

    /// Heartbeat age after which a node is suspect, in seconds
    #[arg(long, default_value_t = 30)]
    pub ha_heartbeat_timeout_secs: u64,

    /// Consecutive missed checks before a node is declared failed
    #[arg(long, default_value_t = 3)]
    pub ha_failure_threshold: u32,

    // Scheduler
    /// Soft-scoring weight for CPU headroom
    #[arg(long, default_value_t = 0.5)]
    pub scheduler_cpu_weight: f64,

    /// Soft-scoring weight for memory headroom
    #[arg(long, default_value_t = 0.5)]
    pub scheduler_memory_weight: f64,

    // Cache
    /// VM cache TTL in seconds
    #[arg(long, default_value_t = 300)]
    pub cache_vm_ttl_secs: u64,

    /// Node cache TTL in seconds
    #[arg(long, default_value_t = 60)]
    pub cache_node_ttl_secs: u64,

    /// Session TTL in seconds
    #[arg(long, default_value_t = 86_400)]
    pub cache_session_ttl_secs: u64,

    // Reconciler cadences
    /// Seconds between VM status reconciliation passes
    #[arg(long, default_value_t = 15)]
    pub status_sync_interval_secs: u64,

    /// Seconds between download progress polls
    #[arg(long, default_value_t = 2)]
    pub download_poll_interval_secs: u64,

    // Database pool
    /// Maximum open database connections
    #[arg(long, default_value_t = 5)]
    pub db_max_connections: u32,

    /// Idle connections kept warm
    #[arg(long, default_value_t = 1)]
    pub db_min_connections: u32,

    /// Connection lifetime before recycling, in seconds
    #[arg(long, default_value_t = 1800)]
    pub db_conn_max_lifetime_secs: u64,

    /// Days of audit history to retain
    #[arg(long, default_value_t = 90)]
    pub audit_retention_days: u32,

    /// Leader lease TTL in seconds
    #[arg(long, default_value_t = 30)]
    pub leader_lease_ttl_secs: u64,
}

impl Config {
    pub fn ha_check_interval(&self) -> Duration {
        Duration::from_secs(self.ha_check_interval_secs)
    }

    pub fn ha_heartbeat_timeout(&self) -> chrono::Duration {
        chrono::Duration::seconds(self.ha_heartbeat_timeout_secs as i64)
    }

    pub fn status_sync_interval(&self) -> Duration {
        Duration::from_secs(self.status_sync_interval_secs)
    }

    pub fn download_poll_interval(&self) -> Duration {
        Duration::from_secs(self.download_poll_interval_secs)
    }

    pub fn leader_lease_ttl(&self) -> Duration {
        Duration::from_secs(self.leader_lease_ttl_secs)
    }

    pub fn db_pool_settings(&self) -> kestrel_store::PoolSettings {
        kestrel_store::PoolSettings {
            max_connections: self.db_max_connections,
            min_connections: self.db_min_connections,
            conn_max_lifetime: Duration::from_secs(self.db_conn_max_lifetime_secs),
        }
    }

    pub fn cache_ttls(&self) -> (Duration, Duration, Duration) {
        (
            Duration::from_secs(self.cache_vm_ttl_secs),
            Duration::from_secs(self.cache_node_ttl_secs),
            Duration::from_secs(self.cache_session_ttl_secs),
        )
    }
}
