//! Reconciliation of the managed workload objects.
//!
//! ## Overview
//! The desired state is computed from config and peer data alone: a governing
//! headless Service plus a StatefulSet running redis-server on every pod.
//! Pod 0 is the group master. Replica pods start with additional flags which
//! point them at the master's stable DNS name.
//!
//! Updates use K8s [Server-Side Apply](https://kubernetes.io/docs/reference/using-api/server-side-apply/),
//! so a write presented against stale object state is rejected by the API
//! server rather than applied. Rejected or failed work is redelivered to the
//! task queue after a delay.

use std::time::Duration;

use anyhow::{Context, Result};
use k8s_openapi::api::apps::v1::{StatefulSet, StatefulSetUpdateStrategy};
use k8s_openapi::api::core::v1::{
    Container, ContainerPort, EnvVar, EnvVarSource, ObjectFieldSelector, PersistentVolumeClaim, PersistentVolumeClaimSpec, PodSpec,
    PodTemplateSpec, Probe, ResourceRequirements, SecretVolumeSource, Service, ServicePort, TCPSocketAction, Volume, VolumeMount,
};
use k8s_openapi::apimachinery::pkg::api::resource::Quantity;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::LabelSelector;
use k8s_openapi::apimachinery::pkg::util::intstr::IntOrString;
use kube::api::{Api, ObjectMeta, Patch, PatchParams};
use kube::Resource;
use tokio::time::timeout;

use crate::config::Config;
use crate::k8s::{set_workload_labels, store, Controller, ReconcileTask, APP_NAME};
use crate::status::Status;
use redis_core::credential::{CredentialCoordinator, PeerStore, ProvisionOutcome};
use redis_core::layer::{self, LayerContext, ServerLayer, TlsPaths};
use redis_core::{StoreError, LEADER_HOST_KEY, PEER_PASSWORD_KEY};

/// The default timeout to use for API calls.
const API_TIMEOUT: Duration = Duration::from_secs(5);
/// The pod container name of the redis-server workload.
///
/// NOTE WELL: do not change the name of this container. It will cause breaking changes.
const CONTAINER_NAME_REDIS: &str = "redis";
/// The pod container name of the metrics exporter sidecar.
const CONTAINER_NAME_EXPORTER: &str = "exporter";
/// The port on which the exporter sidecar serves metrics.
const EXPORTER_PORT: i32 = 9121;
/// The location where redis-server stores its data.
const REDIS_DATA_PATH: &str = "/var/lib/redis";
/// The location where the TLS material is mounted, when TLS is layered.
const TLS_MOUNT_PATH: &str = "/etc/redis/tls";

//////////////////////////////////////////////////////////////////////////////
// Peer Data Reconciliation //////////////////////////////////////////////////
impl Controller {
    /// Ensure the group's peer data records are provisioned.
    ///
    /// The credential record is written at most once per group. The master
    /// host record likewise, as pod 0 of the StatefulSet is the master for
    /// the lifetime of the group.
    #[tracing::instrument(level = "debug", skip(self))]
    pub(super) async fn ensure_peer_data(&mut self) {
        let coordinator = CredentialCoordinator::new(self.store.clone(), PEER_PASSWORD_KEY);
        match coordinator.ensure_provisioned().await {
            Ok(ProvisionOutcome::Provisioned) => tracing::info!("admin credential provisioned for group"),
            Ok(ProvisionOutcome::AlreadyProvisioned) => (),
            Err(StoreError::NotLeader) => {
                // The new leader will pick this up from its own queue.
                tracing::debug!("skipping credential provisioning, leader role not held");
                return;
            }
            Err(err) => {
                tracing::error!(error = ?err, "error provisioning admin credential");
                self.spawn_task(ReconcileTask::EnsurePeerData, true);
                return;
            }
        }

        match self.store.set_if_absent(LEADER_HOST_KEY, &self.config.master_host()).await {
            Ok(_) => (),
            Err(StoreError::NotLeader) => tracing::debug!("skipping master host record, leader role not held"),
            Err(err) => {
                tracing::error!(error = ?err, "error recording master host");
                self.spawn_task(ReconcileTask::EnsurePeerData, true);
            }
        }
    }

    /// Read the fully populated peer data from the watched Secret, if present.
    ///
    /// Reads go through the watcher cache rather than the API. A write which
    /// has not round-tripped through the watcher yet simply triggers another
    /// reconciliation pass once it arrives.
    fn peer_data(&self) -> Option<(String, String)> {
        let secret = self.secret.as_ref()?;
        let password = store::decode(secret, PEER_PASSWORD_KEY).filter(|value| !value.is_empty());
        let master_host = store::decode(secret, LEADER_HOST_KEY).filter(|value| !value.is_empty());
        password.zip(master_host)
    }
}

//////////////////////////////////////////////////////////////////////////////
// Workload Reconciliation ///////////////////////////////////////////////////
impl Controller {
    /// Drive the workload objects toward their desired state.
    #[tracing::instrument(level = "debug", skip(self))]
    pub(super) async fn reconcile_workload(&mut self) {
        tracing::debug!("reconciling workload objects");

        // TLS can not be layered without certificate material to mount.
        if self.config.enable_tls && self.config.tls_secret_name.is_none() {
            self.status
                .set(Status::Blocked("TLS is enabled but no certificate secret is configured".into()));
            return;
        }

        // The launch layer can not be rendered until the peer data is fully
        // populated. The secret watcher triggers another pass once it is.
        let (password, master_host) = match self.peer_data() {
            Some(data) => data,
            None => {
                self.status.set(Status::Waiting("Waiting for peer data to be updated".into()));
                return;
            }
        };
        let tls_paths = if self.config.enable_tls { Some(TlsPaths::under(TLS_MOUNT_PATH)) } else { None };
        let layer = layer::render(&LayerContext {
            password: &password,
            master_host: &master_host,
            port: self.config.redis_port,
            tls: tls_paths.as_ref(),
        });

        // Ensure the governing Service exists.
        if self.service.is_none() {
            let service = build_service(&self.config);
            match self.create_service(&service).await {
                Ok(service) => self.service = Some(service),
                Err(err) => {
                    tracing::error!(error = ?err, "error creating governing Service for workload");
                    self.spawn_task(ReconcileTask::ReconcileWorkload, true);
                    return;
                }
            }
        }

        // Create the StatefulSet, or patch it when the desired spec differs
        // from the observed one.
        let sts_res = if let Some(sts) = self.statefulset.as_ref() {
            let mut updated = build_workload_statefulset(&self.config, &layer);
            updated.metadata = sts.metadata.clone();
            if updated.spec != sts.spec {
                self.patch_statefulset(updated).await
            } else {
                Ok(updated)
            }
        } else {
            let sts = build_workload_statefulset(&self.config, &layer);
            self.create_statefulset(sts).await
        };
        match sts_res {
            Ok(sts) => self.statefulset = Some(sts),
            Err(err) => {
                tracing::error!(error = ?err, "error reconciling workload StatefulSet");
                self.spawn_task(ReconcileTask::ReconcileWorkload, true);
            }
        }
    }
}

/// Build the governing headless Service of the workload StatefulSet.
fn build_service(config: &Config) -> Service {
    let mut service = Service::default();
    let labels = service.meta_mut().labels.get_or_insert_with(Default::default);
    set_workload_labels(labels, config);
    service.meta_mut().namespace = Some(config.namespace.clone());
    service.meta_mut().name = Some(config.app_name.clone());

    let spec = service.spec.get_or_insert_with(Default::default);
    let selector = spec.selector.get_or_insert_with(Default::default);
    set_workload_labels(selector, config);
    spec.cluster_ip = Some("None".into());
    spec.type_ = Some("ClusterIP".into());
    spec.ports = Some(vec![ServicePort {
        name: Some("redis".into()),
        port: config.redis_port as i32,
        protocol: Some("TCP".into()),
        target_port: Some(IntOrString::Int(config.redis_port as i32)),
        ..Default::default()
    }]);

    service
}

/// Build the workload StatefulSet for the given launch layer.
fn build_workload_statefulset(config: &Config, layer: &ServerLayer) -> StatefulSet {
    // Build metadata.
    let mut sts = StatefulSet::default();
    let labels = sts.meta_mut().labels.get_or_insert_with(Default::default);
    set_workload_labels(labels, config);
    let labels = labels.clone(); // Used below.
    sts.meta_mut().namespace = Some(config.namespace.clone());
    sts.meta_mut().name = Some(config.app_name.clone());

    // Build spec.
    let spec = sts.spec.get_or_insert_with(Default::default);
    spec.update_strategy = Some(StatefulSetUpdateStrategy {
        type_: Some("RollingUpdate".into()),
        rolling_update: None,
    });
    spec.service_name = config.app_name.clone();
    spec.replicas = Some(config.replicas);
    spec.selector = LabelSelector {
        match_labels: Some(labels.clone()),
        ..Default::default()
    };

    // Env from the rendered layer, plus the pod's own name so the launch
    // script can tell master from replica.
    let mut env: Vec<EnvVar> = layer
        .environment
        .iter()
        .map(|(name, value)| EnvVar {
            name: name.clone(),
            value: Some(value.clone()),
            ..Default::default()
        })
        .collect();
    env.push(EnvVar {
        name: "POD_NAME".into(),
        value_from: Some(EnvVarSource {
            field_ref: Some(ObjectFieldSelector {
                field_path: "metadata.name".into(),
                ..Default::default()
            }),
            ..Default::default()
        }),
        ..Default::default()
    });

    let mut volume_mounts = vec![VolumeMount {
        name: "data".into(),
        mount_path: REDIS_DATA_PATH.into(),
        ..Default::default()
    }];
    let mut volumes = None;
    if let Some(tls_secret) = config.enable_tls.then(|| config.tls_secret_name.clone()).flatten() {
        volume_mounts.push(VolumeMount {
            name: "tls".into(),
            mount_path: TLS_MOUNT_PATH.into(),
            read_only: Some(true),
            ..Default::default()
        });
        volumes = Some(vec![Volume {
            name: "tls".into(),
            secret: Some(SecretVolumeSource {
                secret_name: Some(tls_secret),
                ..Default::default()
            }),
            ..Default::default()
        }]);
    }

    let port = config.redis_port as i32;
    spec.template = PodTemplateSpec {
        metadata: Some(ObjectMeta { labels: Some(labels), ..Default::default() }),
        spec: Some(PodSpec {
            termination_grace_period_seconds: Some(30),
            containers: vec![
                Container {
                    // NOTE WELL: do not change the name of this container. It will cause breaking changes.
                    name: CONTAINER_NAME_REDIS.into(),
                    image: Some(config.redis_image.clone()),
                    image_pull_policy: Some("IfNotPresent".into()),
                    command: Some(vec![
                        "/bin/sh".into(),
                        "-c".into(),
                        launch_script(&config.master_pod_name(), &layer.command),
                    ]),
                    ports: Some(vec![ContainerPort {
                        name: Some("redis".into()),
                        container_port: port,
                        protocol: Some("TCP".into()),
                        ..Default::default()
                    }]),
                    env: Some(env),
                    volume_mounts: Some(volume_mounts),
                    readiness_probe: Some(Probe {
                        initial_delay_seconds: Some(5),
                        period_seconds: Some(10),
                        tcp_socket: Some(TCPSocketAction {
                            port: IntOrString::Int(port),
                            host: None,
                        }),
                        ..Default::default()
                    }),
                    liveness_probe: Some(Probe {
                        initial_delay_seconds: Some(15),
                        period_seconds: Some(20),
                        tcp_socket: Some(TCPSocketAction {
                            port: IntOrString::Int(port),
                            host: None,
                        }),
                        ..Default::default()
                    }),
                    ..Default::default()
                },
                build_exporter_container(config, layer),
            ],
            volumes,
            ..Default::default()
        }),
    };

    // Build volume claim templates.
    spec.volume_claim_templates = Some(vec![PersistentVolumeClaim {
        metadata: ObjectMeta { name: Some("data".into()), ..Default::default() },
        spec: Some(PersistentVolumeClaimSpec {
            access_modes: Some(vec!["ReadWriteOnce".into()]),
            storage_class_name: config.storage_class_name.clone(),
            resources: Some(ResourceRequirements {
                requests: Some(maplit::btreemap! {
                    "storage".into() => Quantity(config.storage_volume_size.clone()),
                }),
                ..Default::default()
            }),
            ..Default::default()
        }),
        ..Default::default()
    }]);

    sts
}

/// Build the redis-exporter metrics sidecar of the workload pod.
///
/// The exporter scrapes the redis-server instance it is co-located with and
/// exposes Prometheus metrics on its standard port.
fn build_exporter_container(config: &Config, layer: &ServerLayer) -> Container {
    let scheme = if config.enable_tls { "rediss" } else { "redis" };
    let mut env = vec![
        EnvVar {
            name: "REDIS_ADDR".into(),
            value: Some(format!("{}://localhost:{}", scheme, config.redis_port)),
            ..Default::default()
        },
        EnvVar {
            name: "REDIS_PASSWORD".into(),
            value: layer.environment.get("REDIS_PASSWORD").cloned(),
            ..Default::default()
        },
    ];
    if config.enable_tls {
        // The workload certificate is issued for the pod's DNS names, which
        // do not cover the loopback address the exporter scrapes over.
        env.push(EnvVar {
            name: "REDIS_EXPORTER_SKIP_TLS_VERIFICATION".into(),
            value: Some("true".into()),
            ..Default::default()
        });
    }
    Container {
        name: CONTAINER_NAME_EXPORTER.into(),
        image: Some(config.exporter_image.clone()),
        image_pull_policy: Some("IfNotPresent".into()),
        command: Some(vec!["/redis_exporter".into()]),
        ports: Some(vec![ContainerPort {
            name: Some("metrics".into()),
            container_port: EXPORTER_PORT,
            protocol: Some("TCP".into()),
            ..Default::default()
        }]),
        env: Some(env),
        ..Default::default()
    }
}

//////////////////////////////////////////////////////////////////////////////
// K8s API Methods ///////////////////////////////////////////////////////////
impl Controller {
    /// Create the given Service in K8s.
    #[tracing::instrument(level = "debug", skip(self, service))]
    async fn create_service(&self, service: &Service) -> Result<Service> {
        self.fence().await?;
        if let Some(name) = service.metadata.name.as_ref() {
            tracing::info!(service = %name, "creating Service");
        }
        let api: Api<Service> = Api::namespaced(self.client.clone(), &self.config.namespace);
        timeout(API_TIMEOUT, api.create(&Default::default(), service))
            .await
            .context("timeout while creating Service")?
            .context("error creating Service")
    }

    /// Create the given StatefulSet in K8s.
    #[tracing::instrument(level = "debug", skip(self, sts))]
    async fn create_statefulset(&self, sts: StatefulSet) -> Result<StatefulSet> {
        self.fence().await?;
        if let Some(name) = sts.metadata.name.as_ref() {
            tracing::info!(%name, "creating StatefulSet");
        }
        let api: Api<StatefulSet> = Api::namespaced(self.client.clone(), &self.config.namespace);
        let params = kube::api::PostParams::default();
        timeout(API_TIMEOUT, api.create(&params, &sts))
            .await
            .context("timeout while creating workload StatefulSet")?
            .context("error creating workload StatefulSet")
    }

    /// Patch the given StatefulSet in K8s using Server-Side Apply.
    #[tracing::instrument(level = "debug", skip(self, sts))]
    async fn patch_statefulset(&self, mut sts: StatefulSet) -> Result<StatefulSet> {
        self.fence().await?;
        if let Some(name) = sts.metadata.name.as_ref() {
            tracing::info!(%name, "patching StatefulSet");
        }
        let api: Api<StatefulSet> = Api::namespaced(self.client.clone(), &self.config.namespace);
        let mut params = PatchParams::apply(APP_NAME);
        params.force = true; // This will still be blocked by the server if we do not have the most up-to-date object info.
        sts.metadata.managed_fields = None;
        let name = sts.metadata.name.clone().unwrap_or_default();
        timeout(API_TIMEOUT, api.patch(&name, &params, &Patch::Apply(&sts)))
            .await
            .context("timeout while updating workload StatefulSet")?
            .context("error updating workload StatefulSet")
    }

    /// Ensure we have ownership of the lease, else return an error.
    async fn fence(&self) -> Result<()> {
        self.store.fence().await.context("fencing check failed before write")
    }
}

/// The shell script launching redis-server on each pod.
///
/// Replica flags are appended on every pod which is not the group master.
fn launch_script(master_pod: &str, command: &str) -> String {
    format!(
        concat!(
            "flags=\"$REDIS_EXTRA_FLAGS\"\n",
            "if [ \"$POD_NAME\" != \"{master}\" ]; then\n",
            "  flags=\"$flags $REDIS_REPLICA_FLAGS\"\n",
            "fi\n",
            "exec {command} $flags\n",
        ),
        master = master_pod,
        command = command,
    )
}
