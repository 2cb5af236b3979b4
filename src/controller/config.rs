//! Operator configuration.
//!
//! Parsed once from flags and environment in `main` and passed down at
//! construction; nothing reads flags or environment after startup.

use std::time::Duration;

use clap::Parser;

/// Command line configuration of the operator.
#[derive(Parser, Clone, Debug)]
#[command(name = "tikv-operator", version, about = "Kubernetes operator for TiKV clusters")]
pub struct ControllerConfig {
    /// Number of concurrent reconcile workers
    #[arg(long, env = "WORKERS", default_value_t = 5)]
    pub workers: usize,

    /// Replace failed PD members and TiKV stores automatically
    #[arg(long, env = "AUTO_FAILOVER", default_value_t = true, action = clap::ArgAction::Set)]
    pub auto_failover: bool,

    /// How long a PD member may be unhealthy before it is replaced
    #[arg(long, env = "PD_FAILOVER_PERIOD", default_value = "5m", value_parser = humantime::parse_duration)]
    pub pd_failover_period: Duration,

    /// How long a TiKV store may be Down before it is replaced
    #[arg(long, env = "TIKV_FAILOVER_PERIOD", default_value = "5m", value_parser = humantime::parse_duration)]
    pub tikv_failover_period: Duration,

    /// Interval after which a reconciled cluster is reconciled again
    #[arg(long, env = "RESYNC_DURATION", default_value = "30s", value_parser = humantime::parse_duration)]
    pub resync_duration: Duration,

    /// Image of the PD discovery service
    #[arg(long, env = "PD_DISCOVERY_IMAGE", default_value = "tikv/tikv-operator:latest")]
    pub pd_discovery_image: String,

    /// Timeout of a single PD API request
    #[arg(long, env = "PD_REQUEST_TIMEOUT", default_value = "5s", value_parser = humantime::parse_duration)]
    pub pd_request_timeout: Duration,

    /// Longest wait for a TiKV store to shed its region leaders before restart
    #[arg(long, env = "EVICT_LEADER_TIMEOUT", default_value = "3m", value_parser = humantime::parse_duration)]
    pub evict_leader_timeout: Duration,

    /// Only watch clusters in this namespace
    #[arg(long, env = "WATCH_NAMESPACE")]
    pub namespace: Option<String>,

    /// Print the TikvCluster CRD as YAML and exit
    #[arg(long)]
    pub crd: bool,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            workers: 5,
            auto_failover: true,
            pd_failover_period: Duration::from_secs(5 * 60),
            tikv_failover_period: Duration::from_secs(5 * 60),
            resync_duration: Duration::from_secs(30),
            pd_discovery_image: "tikv/tikv-operator:latest".to_string(),
            pd_request_timeout: Duration::from_secs(5),
            evict_leader_timeout: Duration::from_secs(3 * 60),
            namespace: None,
            crd: false,
        }
    }
}
