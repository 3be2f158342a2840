//! Workload health probing.
//!
//! The operator periodically connects to each redis-server instance of the
//! group and verifies that it responds to commands, using the same credential
//! and transport the workload's clients use.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, ensure, Context, Result};
use fred::clients::Client as RedisClient;
use fred::interfaces::ClientLike;
use fred::prelude::Builder;
use fred::types::config::Config as RedisConfig;
use k8s_openapi::api::core::v1::Secret;
use kube::api::Api;
use kube::client::Client;
use tokio::time::timeout;

use redis_core::credential::PeerStore;
use redis_core::PEER_PASSWORD_KEY;

use crate::config::Config;

/// The overall timeout applied to a single instance probe.
const PROBE_TIMEOUT: Duration = Duration::from_secs(10);
/// The data key of the CA certificate within the workload TLS secret.
const TLS_CA_KEY: &str = "ca.crt";

/// A redis-server instance to be probed.
#[derive(Clone, Debug)]
pub struct ProbeTarget {
    pub host: String,
    pub port: u16,
    pub password: String,
    /// Connect over TLS. Matches the workload's own transport config.
    pub tls: bool,
    /// PEM-encoded CA bundle used to verify the instance's certificate.
    ///
    /// Required when the workload certificate is issued by a private CA, as
    /// it will be in any TLS deployment fed from the operator-mounted secret.
    pub ca_pem: Option<String>,
}

impl ProbeTarget {
    fn url(&self) -> String {
        let scheme = if self.tls { "rediss" } else { "redis" };
        format!("{}://:{}@{}:{}", scheme, self.password, self.host, self.port)
    }
}

/// Server details reported by a live instance.
#[derive(Clone, Debug)]
pub struct ServerInfo {
    /// The redis-server version string, `unknown` when not reported.
    pub version: String,
}

/// Probe the target instance, returning its reported server info.
pub async fn check(target: &ProbeTarget) -> Result<ServerInfo> {
    timeout(PROBE_TIMEOUT, probe(target))
        .await
        .context("timeout while probing redis-server")?
}

async fn probe(target: &ProbeTarget) -> Result<ServerInfo> {
    let mut config = RedisConfig::from_url(&target.url()).context("error building redis client config")?;
    if target.tls {
        if let Some(ca_pem) = target.ca_pem.as_deref() {
            config.tls = Some(tls_connector(ca_pem).context("error building TLS connector for probe")?.into());
        }
    }
    let client = Builder::from_config(config).build().context("error building redis client")?;
    let _conn = client.init().await.context("error connecting to redis-server")?;
    let res = probe_client(&client).await;
    let _ = client.quit().await;
    res
}

async fn probe_client(client: &RedisClient) -> Result<ServerInfo> {
    // A full INFO round-trip doubles as the liveness check.
    let info: String = client.info(None).await.context("error fetching redis-server info")?;
    let version = parse_version(&info).unwrap_or_else(|| "unknown".into());
    Ok(ServerInfo { version })
}

/// Build a TLS connector trusting only the given PEM-encoded CA bundle.
fn tls_connector(ca_pem: &str) -> Result<fred::types::config::TlsConnector> {
    let mut roots = rustls::RootCertStore::empty();
    for cert in rustls_pemfile::certs(&mut ca_pem.as_bytes()) {
        let cert = cert.context("error parsing CA certificate PEM")?;
        roots.add(cert).context("error adding CA certificate to trust store")?;
    }
    ensure!(!roots.is_empty(), "no certificates found in CA PEM data");
    let config = rustls::ClientConfig::builder()
        .with_root_certificates(roots)
        .with_no_client_auth();
    Ok(tokio_rustls::TlsConnector::from(Arc::new(config)).into())
}

/// Fetch the workload CA certificate from the configured TLS secret.
///
/// `Ok(None)` when the workload does not have TLS layered. A TLS-enabled
/// workload without a usable CA record is an error, as probes against it
/// could never verify the presented certificate.
async fn fetch_tls_ca(client: &Client, config: &Config) -> Result<Option<String>> {
    let secret_name = match (config.enable_tls, config.tls_secret_name.as_ref()) {
        (true, Some(name)) => name,
        _ => return Ok(None),
    };
    let api: Api<Secret> = Api::namespaced(client.clone(), &config.namespace);
    let secret = api
        .get(secret_name)
        .await
        .with_context(|| format!("error fetching workload TLS secret {}", secret_name))?;
    let ca = match secret.data.as_ref().and_then(|data| data.get(TLS_CA_KEY)) {
        Some(ca) => ca,
        None => bail!("workload TLS secret {} has no {} record", secret_name, TLS_CA_KEY),
    };
    let pem = String::from_utf8(ca.0.clone()).context("workload CA certificate is not valid UTF-8")?;
    Ok(Some(pem))
}

/// Probe every instance of the managed group.
///
/// The group credential is read from the peer store. Until it has been
/// provisioned there is nothing to probe, which is reported as an error so
/// callers keep the workload in a waiting state.
#[tracing::instrument(level = "debug", skip(client, config, store))]
pub async fn check_managed<S: PeerStore>(client: &Client, config: &Config, store: &S) -> Result<ServerInfo> {
    let password = match store.get(PEER_PASSWORD_KEY).await? {
        Some(password) if !password.is_empty() => password,
        _ => bail!("group credential has not been provisioned yet"),
    };
    let ca_pem = fetch_tls_ca(client, config).await?;

    let mut master_info = None;
    for replica in 0..config.replicas {
        let target = ProbeTarget {
            host: pod_host(config, replica),
            port: config.redis_port,
            password: password.clone(),
            tls: config.enable_tls,
            ca_pem: ca_pem.clone(),
        };
        let info = check(&target)
            .await
            .with_context(|| format!("instance {} failed its health check", target.host))?;
        if replica == 0 {
            master_info = Some(info);
        }
    }
    match master_info {
        Some(info) => Ok(info),
        None => bail!("no instances probed"),
    }
}

/// The stable DNS hostname of the given workload pod.
fn pod_host(config: &Config, replica: i32) -> String {
    format!("{}-{}.{}.{}.svc.cluster.local", config.app_name, replica, config.app_name, config.namespace)
}

/// Extract the `redis_version` field from an INFO server section.
fn parse_version(info: &str) -> Option<String> {
    info.lines()
        .find_map(|line| line.strip_prefix("redis_version:"))
        .map(|version| version.trim().to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    const TEST_CA_PEM: &str = "-----BEGIN CERTIFICATE-----
MIIBhTCCASugAwIBAgIUJWVHBR8U7WaBzcDcXZurILyciNIwCgYIKoZIzj0EAwIw
GDEWMBQGA1UEAwwNcmVkaXMtdGVzdC1jYTAeFw0yNjA4MjgxNjU2NTBaFw0zNjA4
MjUxNjU2NTBaMBgxFjAUBgNVBAMMDXJlZGlzLXRlc3QtY2EwWTATBgcqhkjOPQIB
BggqhkjOPQMBBwNCAATtZVUwOV+qDWAsQRCoe+RQCnBgyuZZN9uiBE5NS4668m+P
3obuP2c+TRicar8F5BP16qFnN6lWb5LwckAUTtYro1MwUTAdBgNVHQ4EFgQUBIP7
LtS/DCP31a1GjlEKGdI1ZfMwHwYDVR0jBBgwFoAUBIP7LtS/DCP31a1GjlEKGdI1
ZfMwDwYDVR0TAQH/BAUwAwEB/zAKBggqhkjOPQQDAgNIADBFAiEAgrqT433hyJ3X
mPjuSqUVIcQrYp/Zmwzyh4XreDVP4EECIGzWkaTbyCAOwaYgNIRYaica0naAP3Ah
WBaedv0Z+oQB
-----END CERTIFICATE-----
";

    #[test]
    fn version_is_parsed_from_info_output() {
        let info = "# Server\r\nredis_version:6.0.11\r\nredis_mode:standalone\r\n";
        assert_eq!(parse_version(info).as_deref(), Some("6.0.11"));
    }

    #[test]
    fn missing_version_yields_none() {
        assert!(parse_version("# Server\r\nredis_mode:standalone\r\n").is_none());
    }

    #[test]
    fn probe_urls_carry_the_transport_scheme() {
        let mut target = ProbeTarget {
            host: "redis-0.redis.default.svc.cluster.local".into(),
            port: 6379,
            password: "s3cr3t".into(),
            tls: false,
            ca_pem: None,
        };
        assert_eq!(target.url(), "redis://:s3cr3t@redis-0.redis.default.svc.cluster.local:6379");
        target.tls = true;
        assert_eq!(target.url(), "rediss://:s3cr3t@redis-0.redis.default.svc.cluster.local:6379");
    }

    #[test]
    fn tls_connector_trusts_a_private_ca() {
        tls_connector(TEST_CA_PEM).expect("a valid CA PEM must yield a connector");
    }

    #[test]
    fn tls_connector_rejects_garbage_pem() {
        assert!(tls_connector("not a certificate").is_err());
        assert!(tls_connector("").is_err());
    }

    #[test]
    fn tls_client_config_carries_the_private_ca() {
        let target = ProbeTarget {
            host: "redis-0.redis.default.svc.cluster.local".into(),
            port: 6379,
            password: "s3cr3t".into(),
            tls: true,
            ca_pem: Some(TEST_CA_PEM.into()),
        };
        let mut config = RedisConfig::from_url(&target.url()).expect("url must parse");
        config.tls = Some(
            tls_connector(target.ca_pem.as_deref().expect("ca must be set"))
                .expect("a valid CA PEM must yield a connector")
                .into(),
        );
        assert!(config.tls.is_some(), "probe config must carry the CA-backed connector");
    }
}
