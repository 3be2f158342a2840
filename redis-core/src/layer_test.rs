use crate::layer::*;
use crate::REDIS_PORT;

fn ctx<'a>(tls: Option<&'a TlsPaths>) -> LayerContext<'a> {
    LayerContext {
        password: "s3cr3tpassword00",
        master_host: "redis-0.redis.default.svc.cluster.local",
        port: REDIS_PORT,
        tls,
    }
}

#[test]
fn plain_layer_has_no_server_flags() {
    let layer = render(&ctx(None));

    assert_eq!(layer.command, "/usr/local/bin/start-redis.sh redis-server");
    assert_eq!(layer.environment.get("REDIS_PASSWORD").map(String::as_str), Some("s3cr3tpassword00"));
    assert_eq!(layer.environment.get("REDIS_EXTRA_FLAGS").map(String::as_str), Some(""));
}

#[test]
fn replica_flags_follow_the_master_with_auth() {
    let layer = render(&ctx(None));

    let flags = layer.environment.get("REDIS_REPLICA_FLAGS").expect("replica flags should be rendered");
    assert_eq!(
        flags,
        "--replicaof redis-0.redis.default.svc.cluster.local 6379 --masterauth s3cr3tpassword00"
    );
}

#[test]
fn tls_layer_disables_the_plain_port() {
    let tls = TlsPaths::under("/etc/redis/tls");
    let layer = render(&ctx(Some(&tls)));

    let flags = layer.environment.get("REDIS_EXTRA_FLAGS").expect("server flags should be rendered");
    assert_eq!(
        flags,
        "--tls-port 6379 --port 0 --tls-auth-clients optional \
         --tls-cert-file /etc/redis/tls/redis.crt \
         --tls-key-file /etc/redis/tls/redis.key \
         --tls-ca-cert-file /etc/redis/tls/ca.crt"
    );

    let replica = layer.environment.get("REDIS_REPLICA_FLAGS").expect("replica flags should be rendered");
    assert!(replica.contains("--tls-replication yes"), "replication must use TLS when layered: {}", replica);
}

#[test]
fn layer_diff_tracks_only_material_changes() {
    let base = render(&ctx(None));

    // Same context renders an identical layer: nothing to re-apply.
    assert_eq!(base, render(&ctx(None)));

    // A credential change produces a different layer.
    let changed = render(&LayerContext { password: "otherpassword000", ..ctx(None) });
    assert_ne!(base, changed);

    // Layering TLS produces a different layer.
    let tls = TlsPaths::under("/etc/redis/tls");
    assert_ne!(base, render(&ctx(Some(&tls))));
}
