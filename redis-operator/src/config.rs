//! Runtime configuration.

use anyhow::{ensure, Context, Result};
use serde::Deserialize;

/// Runtime configuration data.
#[derive(Clone, Debug, Deserialize)]
pub struct Config {
    /// The server's logging config, which uses Rust's `env_logger` directives.
    pub rust_log: String,
    /// The port used for HTTP actions, healthchecks & metrics.
    pub http_port: u16,

    /// The Kubernetes namespace in which the workload group runs.
    pub namespace: String,
    /// The name of the pod on which this instance is running.
    pub pod_name: String,

    /// The name of the managed Redis application.
    ///
    /// Used as the name of the workload StatefulSet and its governing Service,
    /// and as the prefix of the peer data Secret and the coordination Lease.
    pub app_name: String,
    /// The container image used for the redis-server workload.
    pub redis_image: String,
    /// The number of workload replicas.
    #[serde(default = "Config::default_replicas")]
    pub replicas: i32,
    /// The port redis-server listens on.
    #[serde(default = "Config::default_redis_port")]
    pub redis_port: u16,
    /// The container image used for the redis-exporter metrics sidecar.
    #[serde(default = "Config::default_exporter_image")]
    pub exporter_image: String,

    /// Whether TLS is layered onto the workload.
    ///
    /// The certificate material itself is provided externally through the
    /// secret named by `tls_secret_name`.
    #[serde(default)]
    pub enable_tls: bool,
    /// The name of the secret holding the workload TLS material.
    #[serde(default)]
    pub tls_secret_name: Option<String>,

    /// Size of the workload data volume.
    #[serde(default = "Config::default_storage_volume_size")]
    pub storage_volume_size: String,
    /// Storage class for the workload data volume. Cluster default when unset.
    #[serde(default)]
    pub storage_class_name: Option<String>,

    /// The duration in seconds for which a lease is considered held.
    pub lease_duration_seconds: u32,
    /// The duration in seconds between lease refreshes by the holder.
    pub lease_renew_seconds: u32,
    /// Seconds between workload health checks.
    #[serde(default = "Config::default_status_check_interval_seconds")]
    pub status_check_interval_seconds: u64,
}

impl Config {
    /// Create a new config instance from the runtime environment.
    #[allow(clippy::new_without_default)]
    pub fn new() -> Result<Self> {
        let config: Config = envy::from_env().context("error building config from env")?;
        ensure!(config.replicas >= 1, "REPLICAS must be at least 1");
        Ok(config)
    }

    /// The name of the Secret holding the group's peer data.
    pub fn peers_secret_name(&self) -> String {
        format!("{}-peers", self.app_name)
    }

    /// The pod name of the group master, pod 0 of the workload StatefulSet.
    pub fn master_pod_name(&self) -> String {
        format!("{}-0", self.app_name)
    }

    /// The stable DNS hostname of the group master.
    pub fn master_host(&self) -> String {
        format!("{}-0.{}.{}.svc.cluster.local", self.app_name, self.app_name, self.namespace)
    }

    fn default_replicas() -> i32 {
        1
    }

    fn default_redis_port() -> u16 {
        redis_core::REDIS_PORT
    }

    fn default_exporter_image() -> String {
        "oliver006/redis_exporter:v1.44.0".into()
    }

    fn default_storage_volume_size() -> String {
        "1Gi".into()
    }

    fn default_status_check_interval_seconds() -> u64 {
        60
    }
}
