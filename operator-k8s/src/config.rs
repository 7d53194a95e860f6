use std::time::Duration;

use clap::Parser;

use crate::consts::DEFAULT_TOPOLOGY_PERIOD;

/// Mysql operator config
#[derive(Debug, Parser)]
#[non_exhaustive]
#[command(author, version, about, long_about = None)]
pub struct Config {
    /// The namespace to work, default to cluster wide
    #[arg(long, value_parser=namespace_mode_parser, default_value = "")]
    pub namespace: Namespace,
    /// Whether to create CRD regardless of current version on k8s
    #[arg(long, default_value = "false")]
    pub manage_crd: bool,
    /// The address the metrics and health server listens on
    #[arg(long, default_value = "0.0.0.0:8080")]
    pub listen_addr: String,
    /// The orchestrator api endpoint, e.g. `http://orchestrator/api`
    #[arg(long, env = "ORC_URI")]
    pub orchestrator_uri: String,
    /// The user orchestrator connects to the mysql nodes with
    #[arg(long, env = "ORC_TOPOLOGY_USER", default_value = "")]
    pub orchestrator_topology_user: String,
    /// The password orchestrator connects to the mysql nodes with
    #[arg(long, env = "ORC_TOPOLOGY_PASSWORD", default_value = "")]
    pub orchestrator_topology_password: String,
    /// The image of mysql 5.7, the default version
    #[arg(long, default_value = "percona:5.7")]
    pub mysql_image: String,
    /// The image that instruments mysql and runs the backups
    #[arg(long, default_value = "quay.io/presslabs/mysql-operator-sidecar:latest")]
    pub sidecar_image: String,
    /// The image of the mysql metrics exporter
    #[arg(long, default_value = "prom/mysqld-exporter:v0.11.0")]
    pub metrics_exporter_image: String,
    /// Pull policy of the operator images
    #[arg(long, default_value = "IfNotPresent")]
    pub image_pull_policy: String,
    /// The secret used to pull the operator images
    #[arg(long, default_value = "")]
    pub image_pull_secret: String,
    /// Period of the orchestrator reconcile [unit: seconds]
    #[arg(long, default_value_t = DEFAULT_TOPOLOGY_PERIOD)]
    pub orchestrator_reconcile_period: u64,
    /// Period of polling a scheduled backup for completion [unit: seconds]
    #[arg(long, default_value = "1")]
    pub backup_poll_interval: u64,
    /// How long a scheduled backup is watched before giving up [unit: seconds]
    #[arg(long, default_value = "3600")]
    pub backup_watch_timeout: u64,
    /// Timeout of configuring a freshly started node [unit: seconds]
    #[arg(long, default_value = "10")]
    pub node_reconcile_timeout: u64,
}

/// The namespace to work, `ClusterWide` means work with all namespaces
#[allow(clippy::exhaustive_enums)] // it is clear that this enum is exhaustive
#[derive(Clone, Debug)]
pub enum Namespace {
    /// A single namespace
    Single(String),
    /// All namespaces
    ClusterWide,
}

/// parse namespace mode
#[allow(clippy::unnecessary_wraps)] // required by clap
fn namespace_mode_parser(value: &str) -> Result<Namespace, String> {
    if value.is_empty() {
        return Ok(Namespace::ClusterWide);
    }
    Ok(Namespace::Single(value.to_owned()))
}

/// Read only options shared by the controllers
#[derive(Clone, Debug)]
pub(crate) struct OperatorOptions {
    /// Image of mysql 5.7
    pub(crate) mysql_image: String,
    /// Sidecar image
    pub(crate) sidecar_image: String,
    /// Metrics exporter image
    pub(crate) metrics_exporter_image: String,
    /// Image pull policy
    pub(crate) image_pull_policy: String,
    /// Image pull secret, empty for none
    pub(crate) image_pull_secret: String,
    /// Orchestrator api endpoint
    pub(crate) orchestrator_uri: String,
    /// Orchestrator topology user
    pub(crate) orchestrator_topology_user: String,
    /// Orchestrator topology password
    pub(crate) orchestrator_topology_password: String,
    /// Topology reconcile period
    pub(crate) topology_period: Duration,
    /// Scheduled backup poll interval
    pub(crate) backup_poll_interval: Duration,
    /// Scheduled backup watch timeout
    pub(crate) backup_watch_timeout: Duration,
    /// Node configuration timeout
    pub(crate) node_reconcile_timeout: Duration,
}

impl From<&Config> for OperatorOptions {
    fn from(config: &Config) -> Self {
        Self {
            mysql_image: config.mysql_image.clone(),
            sidecar_image: config.sidecar_image.clone(),
            metrics_exporter_image: config.metrics_exporter_image.clone(),
            image_pull_policy: config.image_pull_policy.clone(),
            image_pull_secret: config.image_pull_secret.clone(),
            orchestrator_uri: config.orchestrator_uri.clone(),
            orchestrator_topology_user: config.orchestrator_topology_user.clone(),
            orchestrator_topology_password: config.orchestrator_topology_password.clone(),
            topology_period: Duration::from_secs(config.orchestrator_reconcile_period),
            backup_poll_interval: Duration::from_secs(config.backup_poll_interval),
            backup_watch_timeout: Duration::from_secs(config.backup_watch_timeout),
            node_reconcile_timeout: Duration::from_secs(config.node_reconcile_timeout),
        }
    }
}

#[cfg(test)]
impl Default for OperatorOptions {
    fn default() -> Self {
        Self {
            mysql_image: "percona:5.7".to_owned(),
            sidecar_image: "sidecar:test".to_owned(),
            metrics_exporter_image: "exporter:test".to_owned(),
            image_pull_policy: "IfNotPresent".to_owned(),
            image_pull_secret: String::new(),
            orchestrator_uri: "http://orchestrator/api".to_owned(),
            orchestrator_topology_user: "orc".to_owned(),
            orchestrator_topology_password: "orc-pass".to_owned(),
            topology_period: Duration::from_secs(DEFAULT_TOPOLOGY_PERIOD),
            backup_poll_interval: Duration::from_secs(1),
            backup_watch_timeout: Duration::from_secs(3600),
            node_reconcile_timeout: Duration::from_secs(10),
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn parse_flags() {
        let config = Config::try_parse_from([
            "mysql-operator",
            "--namespace",
            "db",
            "--orchestrator-uri",
            "http://orc/api",
            "--backup-watch-timeout",
            "60",
        ])
        .unwrap();
        assert!(matches!(config.namespace, Namespace::Single(ref ns) if ns == "db"));
        let options = OperatorOptions::from(&config);
        assert_eq!(options.orchestrator_uri, "http://orc/api");
        assert_eq!(options.backup_watch_timeout, Duration::from_secs(60));
        assert_eq!(options.topology_period, Duration::from_secs(5));
        assert_eq!(options.node_reconcile_timeout, Duration::from_secs(10));
    }

    #[test]
    fn empty_namespace_is_cluster_wide() {
        let config =
            Config::try_parse_from(["mysql-operator", "--orchestrator-uri", "http://orc"]).unwrap();
        assert!(matches!(config.namespace, Namespace::ClusterWide));
    }
}
