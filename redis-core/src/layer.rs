//! Rendering of the redis-server launch layer.
//!
//! The layer captures everything the process supervisor needs to start the
//! workload: the launch command and its environment, including the extra
//! flag sets for TLS and for replicas following the group master. Layers are
//! value types and compare with `==`, so callers re-apply the supervisor
//! configuration only when the rendered layer actually changed.

use std::collections::BTreeMap;

use serde::Serialize;

/// The launch command of the redis-server service.
const SERVER_COMMAND: &str = "/usr/local/bin/start-redis.sh redis-server";

/// Paths of the TLS material mounted into the workload container.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct TlsPaths {
    pub cert_file: String,
    pub key_file: String,
    pub ca_cert_file: String,
}

impl TlsPaths {
    /// The canonical file layout under the given mount directory.
    pub fn under(dir: &str) -> Self {
        Self {
            cert_file: format!("{}/redis.crt", dir),
            key_file: format!("{}/redis.key", dir),
            ca_cert_file: format!("{}/ca.crt", dir),
        }
    }
}

/// Inputs for rendering the workload launch layer.
///
/// Rendering requires fully populated peer data. Callers hold off until both
/// the credential and the master host records exist.
pub struct LayerContext<'a> {
    /// The group's admin credential.
    pub password: &'a str,
    /// Hostname of the current group master.
    pub master_host: &'a str,
    /// The port redis-server listens on.
    pub port: u16,
    /// TLS material, when TLS is layered onto the workload.
    pub tls: Option<&'a TlsPaths>,
}

/// The rendered launch configuration of the redis-server service.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct ServerLayer {
    /// The service launch command.
    pub command: String,
    /// Environment passed to the service.
    ///
    /// `REDIS_EXTRA_FLAGS` applies to every instance. `REDIS_REPLICA_FLAGS`
    /// additionally applies to instances which are not the group master.
    pub environment: BTreeMap<String, String>,
}

/// Render the launch layer for the given context.
pub fn render(ctx: &LayerContext) -> ServerLayer {
    let mut environment = BTreeMap::new();
    environment.insert("REDIS_PASSWORD".into(), ctx.password.into());
    environment.insert("REDIS_EXTRA_FLAGS".into(), server_flags(ctx));
    environment.insert("REDIS_REPLICA_FLAGS".into(), replica_flags(ctx));
    ServerLayer { command: SERVER_COMMAND.into(), environment }
}

/// Flags applied to every redis-server instance of the group.
fn server_flags(ctx: &LayerContext) -> String {
    let mut flags = Vec::new();
    if let Some(tls) = ctx.tls {
        // The plain port is disabled outright when serving TLS.
        flags.push(format!("--tls-port {}", ctx.port));
        flags.push("--port 0".to_string());
        flags.push("--tls-auth-clients optional".to_string());
        flags.push(format!("--tls-cert-file {}", tls.cert_file));
        flags.push(format!("--tls-key-file {}", tls.key_file));
        flags.push(format!("--tls-ca-cert-file {}", tls.ca_cert_file));
    }
    flags.join(" ")
}

/// Additional flags for instances replicating from the group master.
fn replica_flags(ctx: &LayerContext) -> String {
    let mut flags = vec![format!("--replicaof {} {}", ctx.master_host, ctx.port)];
    if ctx.tls.is_some() {
        flags.push("--tls-replication yes".to_string());
    }
    flags.push(format!("--masterauth {}", ctx.password));
    flags.join(" ")
}
