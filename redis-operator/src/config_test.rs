use anyhow::Result;

use super::config::Config;

#[test]
fn config_deserializes_from_full_env() -> Result<()> {
    let config: Config = envy::from_iter(vec![
        ("RUST_LOG".into(), "error".into()),
        ("HTTP_PORT".into(), "7000".into()),
        ("NAMESPACE".into(), "default".into()),
        ("POD_NAME".into(), "redis-operator-0".into()),
        ("APP_NAME".into(), "redis".into()),
        ("REDIS_IMAGE".into(), "example.com/redis:7".into()),
        ("REPLICAS".into(), "3".into()),
        ("REDIS_PORT".into(), "6380".into()),
        ("EXPORTER_IMAGE".into(), "example.com/redis-exporter:v1".into()),
        ("ENABLE_TLS".into(), "true".into()),
        ("TLS_SECRET_NAME".into(), "redis-tls".into()),
        ("STORAGE_VOLUME_SIZE".into(), "5Gi".into()),
        ("STORAGE_CLASS_NAME".into(), "fast".into()),
        ("LEASE_DURATION_SECONDS".into(), "60".into()),
        ("LEASE_RENEW_SECONDS".into(), "10".into()),
        ("STATUS_CHECK_INTERVAL_SECONDS".into(), "30".into()),
    ])?;

    assert!(config.rust_log == "error", "unexpected value parsed for RUST_LOG, got {}", config.rust_log);
    assert!(config.http_port == 7000, "unexpected value parsed for HTTP_PORT, got {}", config.http_port);
    assert!(config.namespace == "default", "unexpected value parsed for NAMESPACE, got {}", config.namespace);
    assert!(config.pod_name == "redis-operator-0", "unexpected value parsed for POD_NAME, got {}", config.pod_name);
    assert!(config.app_name == "redis", "unexpected value parsed for APP_NAME, got {}", config.app_name);
    assert!(
        config.redis_image == "example.com/redis:7",
        "unexpected value parsed for REDIS_IMAGE, got {}",
        config.redis_image
    );
    assert!(config.replicas == 3, "unexpected value parsed for REPLICAS, got {}", config.replicas);
    assert!(config.redis_port == 6380, "unexpected value parsed for REDIS_PORT, got {}", config.redis_port);
    assert!(
        config.exporter_image == "example.com/redis-exporter:v1",
        "unexpected value parsed for EXPORTER_IMAGE, got {}",
        config.exporter_image
    );
    assert!(config.enable_tls, "unexpected value parsed for ENABLE_TLS, got {}", config.enable_tls);
    assert!(
        config.tls_secret_name.as_deref() == Some("redis-tls"),
        "unexpected value parsed for TLS_SECRET_NAME, got {:?}",
        config.tls_secret_name
    );
    assert!(
        config.storage_volume_size == "5Gi",
        "unexpected value parsed for STORAGE_VOLUME_SIZE, got {}",
        config.storage_volume_size
    );
    assert!(
        config.storage_class_name.as_deref() == Some("fast"),
        "unexpected value parsed for STORAGE_CLASS_NAME, got {:?}",
        config.storage_class_name
    );
    assert!(
        config.lease_duration_seconds == 60,
        "unexpected value parsed for LEASE_DURATION_SECONDS, got {}",
        config.lease_duration_seconds
    );
    assert!(
        config.lease_renew_seconds == 10,
        "unexpected value parsed for LEASE_RENEW_SECONDS, got {}",
        config.lease_renew_seconds
    );
    assert!(
        config.status_check_interval_seconds == 30,
        "unexpected value parsed for STATUS_CHECK_INTERVAL_SECONDS, got {}",
        config.status_check_interval_seconds
    );

    Ok(())
}

#[test]
fn config_deserializes_from_sparse_env_with_defaults() -> Result<()> {
    let config: Config = envy::from_iter(vec![
        ("RUST_LOG".into(), "error".into()),
        ("HTTP_PORT".into(), "7000".into()),
        ("NAMESPACE".into(), "default".into()),
        ("POD_NAME".into(), "redis-operator-0".into()),
        ("APP_NAME".into(), "redis".into()),
        ("REDIS_IMAGE".into(), "example.com/redis:7".into()),
        ("LEASE_DURATION_SECONDS".into(), "60".into()),
        ("LEASE_RENEW_SECONDS".into(), "10".into()),
    ])?;

    assert!(config.replicas == 1, "unexpected default for REPLICAS, got {}", config.replicas);
    assert!(config.redis_port == 6379, "unexpected default for REDIS_PORT, got {}", config.redis_port);
    assert!(
        config.exporter_image == "oliver006/redis_exporter:v1.44.0",
        "unexpected default for EXPORTER_IMAGE, got {}",
        config.exporter_image
    );
    assert!(!config.enable_tls, "unexpected default for ENABLE_TLS, got {}", config.enable_tls);
    assert!(config.tls_secret_name.is_none(), "unexpected default for TLS_SECRET_NAME, got {:?}", config.tls_secret_name);
    assert!(
        config.storage_volume_size == "1Gi",
        "unexpected default for STORAGE_VOLUME_SIZE, got {}",
        config.storage_volume_size
    );
    assert!(
        config.status_check_interval_seconds == 60,
        "unexpected default for STATUS_CHECK_INTERVAL_SECONDS, got {}",
        config.status_check_interval_seconds
    );

    Ok(())
}

#[test]
fn derived_names_follow_the_app_name() -> Result<()> {
    let config: Config = envy::from_iter(vec![
        ("RUST_LOG".into(), "error".into()),
        ("HTTP_PORT".into(), "7000".into()),
        ("NAMESPACE".into(), "prod".into()),
        ("POD_NAME".into(), "redis-operator-0".into()),
        ("APP_NAME".into(), "cache".into()),
        ("REDIS_IMAGE".into(), "example.com/redis:7".into()),
        ("LEASE_DURATION_SECONDS".into(), "60".into()),
        ("LEASE_RENEW_SECONDS".into(), "10".into()),
    ])?;

    assert_eq!(config.peers_secret_name(), "cache-peers");
    assert_eq!(config.master_pod_name(), "cache-0");
    assert_eq!(config.master_host(), "cache-0.cache.prod.svc.cluster.local");
    Ok(())
}
