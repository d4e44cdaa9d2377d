//! Kubernetes Resource Builders
//!
//! This module generates the desired objects for an EMQX cluster: the core
//! StatefulSet, replicant ReplicaSets and the bootstrap objects their pods
//! mount (headless Service, ConfigMap, node-cookie and bootstrap-user Secrets).

use crate::crd::{Emqx, EmqxNodeTemplate, POD_ON_SERVING, POD_TEMPLATE_HASH_LABEL};
use crate::error::{OperatorError, Result};
use crate::hash::compute_hash;
use crate::patch::set_last_applied;
use k8s_openapi::api::apps::v1::{ReplicaSet, ReplicaSetSpec, StatefulSet, StatefulSetSpec};
use k8s_openapi::api::core::v1::{
    Capabilities, ConfigMap, ConfigMapVolumeSource, Container, ContainerPort,
    EmptyDirVolumeSource, EnvVar, EnvVarSource, ObjectFieldSelector,
    PersistentVolumeClaim, PodReadinessGate, PodSecurityContext, PodSpec, PodTemplateSpec,
    SeccompProfile, Secret, SecretKeySelector, SecretVolumeSource, SecurityContext, Service,
    ServicePort, ServiceSpec, Volume, VolumeMount,
};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{LabelSelector, ObjectMeta, OwnerReference};
use k8s_openapi::apimachinery::pkg::util::intstr::IntOrString;
use kube::Resource;
use std::collections::BTreeMap;

/// Name of the broker container in every pod
pub const CONTAINER_NAME: &str = "emqx";
/// Port of the broker dashboard and admin API
pub const DASHBOARD_PORT: i32 = 18083;
/// Secret key holding the Erlang distribution cookie
pub const NODE_COOKIE_KEY: &str = "node_cookie";
/// Secret key holding the bootstrap API key file
pub const BOOTSTRAP_USER_KEY: &str = "bootstrap_user";
/// Secret keys holding the operator's own API credentials
pub const BOOTSTRAP_USERNAME_KEY: &str = "username";
pub const BOOTSTRAP_PASSWORD_KEY: &str = "password";
/// ConfigMap key holding the broker configuration
pub const EMQX_CONF_KEY: &str = "emqx.conf";

const BOOTSTRAP_USER_PATH: &str = "/opt/emqx/data/bootstrap_user";

/// Builder for generating Kubernetes resources from an EMQX object
pub struct ResourceBuilder<'a> {
    cluster: &'a Emqx,
    name: String,
    namespace: String,
}

impl<'a> ResourceBuilder<'a> {
    /// Create a new resource builder
    pub fn new(cluster: &'a Emqx) -> Result<Self> {
        let name =
            cluster.metadata.name.clone().ok_or_else(|| {
                OperatorError::InvalidConfig("cluster name is required".to_string())
            })?;

        Ok(Self {
            cluster,
            name,
            namespace: cluster.namespace_or_default(),
        })
    }

    /// Get owner reference for managed resources
    fn owner_reference(&self) -> OwnerReference {
        OwnerReference {
            api_version: Emqx::api_version(&()).to_string(),
            kind: Emqx::kind(&()).to_string(),
            name: self.name.clone(),
            uid: self.cluster.metadata.uid.clone().unwrap_or_default(),
            controller: Some(true),
            block_owner_deletion: Some(true),
        }
    }

    fn metadata(&self, name: String, labels: BTreeMap<String, String>) -> ObjectMeta {
        ObjectMeta {
            name: Some(name),
            namespace: Some(self.namespace.clone()),
            labels: Some(labels),
            owner_references: Some(vec![self.owner_reference()]),
            ..Default::default()
        }
    }

    /// Build the core StatefulSet.
    ///
    /// The revision hash of the pod template is recorded as a label on the
    /// StatefulSet itself so status can tell which template it carries.
    pub fn build_core_statefulset(&self) -> Result<StatefulSet> {
        let template = &self.cluster.spec.core_template;
        let name = self.cluster.core_name();
        let selector_labels = self.cluster.core_selector_labels();

        let mut labels = selector_labels.clone();
        labels.extend(template.metadata.labels.clone());

        let data_volume = format!("{}-data", name);
        let pod_template = self.build_pod_template(
            template,
            &name,
            &selector_labels,
            self.core_env(),
            template.spec.volume_claim_templates.is_none(),
        );

        let hash = compute_hash(&pod_template, None)?;
        let mut sts_labels = labels;
        sts_labels.insert(POD_TEMPLATE_HASH_LABEL.to_string(), hash);

        let mut metadata = self.metadata(name, sts_labels);
        if !template.metadata.annotations.is_empty() {
            metadata.annotations = Some(template.metadata.annotations.clone());
        }

        let volume_claim_templates = template.spec.volume_claim_templates.as_ref().map(|spec| {
            vec![PersistentVolumeClaim {
                metadata: ObjectMeta {
                    name: Some(data_volume.clone()),
                    ..Default::default()
                },
                spec: Some(spec.clone()),
                ..Default::default()
            }]
        });

        let mut sts = StatefulSet {
            metadata,
            spec: Some(StatefulSetSpec {
                service_name: self.cluster.headless_service_name(),
                replicas: Some(template.spec.replicas),
                selector: LabelSelector {
                    match_labels: Some(selector_labels),
                    ..Default::default()
                },
                template: pod_template,
                volume_claim_templates,
                pod_management_policy: Some("Parallel".to_string()),
                ..Default::default()
            }),
            ..Default::default()
        };
        set_last_applied(&mut sts)?;
        Ok(sts)
    }

    /// Build the replicant pod template, without its revision label
    pub fn build_replicant_pod_template(&self) -> Result<PodTemplateSpec> {
        let template = self.replicant_template()?;
        let mut pod_template = self.build_pod_template(
            template,
            &self.cluster.replicant_name(),
            &self.cluster.replicant_selector_labels(),
            self.replicant_env(),
            true,
        );
        if let Some(spec) = pod_template.spec.as_mut() {
            spec.readiness_gates = Some(vec![PodReadinessGate {
                condition_type: POD_ON_SERVING.to_string(),
            }]);
        }
        Ok(pod_template)
    }

    /// Build the replicant ReplicaSet for a pod template and its revision hash.
    ///
    /// The hash lands in the name, the labels, the selector and the pod labels.
    pub fn build_replicaset(&self, mut pod_template: PodTemplateSpec, hash: &str) -> Result<ReplicaSet> {
        let template = self.replicant_template()?;
        let name = format!("{}-{}", self.cluster.replicant_name(), hash);

        let mut selector_labels = self.cluster.replicant_selector_labels();
        selector_labels.insert(POD_TEMPLATE_HASH_LABEL.to_string(), hash.to_string());

        let mut labels = selector_labels.clone();
        labels.extend(template.metadata.labels.clone());

        if let Some(meta) = pod_template.metadata.as_mut() {
            meta.labels
                .get_or_insert_with(BTreeMap::new)
                .insert(POD_TEMPLATE_HASH_LABEL.to_string(), hash.to_string());
        }

        let mut metadata = self.metadata(name, labels);
        if !template.metadata.annotations.is_empty() {
            metadata.annotations = Some(template.metadata.annotations.clone());
        }

        let mut rs = ReplicaSet {
            metadata,
            spec: Some(ReplicaSetSpec {
                replicas: Some(template.spec.replicas),
                selector: LabelSelector {
                    match_labels: Some(selector_labels),
                    ..Default::default()
                },
                template: Some(pod_template),
                ..Default::default()
            }),
            ..Default::default()
        };
        set_last_applied(&mut rs)?;
        Ok(rs)
    }

    fn replicant_template(&self) -> Result<&'a EmqxNodeTemplate> {
        self.cluster.spec.replicant_template.as_ref().ok_or_else(|| {
            OperatorError::InvalidConfig("no replicant template configured".to_string())
        })
    }

    fn build_pod_template(
        &self,
        template: &EmqxNodeTemplate,
        base_name: &str,
        selector_labels: &BTreeMap<String, String>,
        mut env: Vec<EnvVar>,
        ephemeral_data: bool,
    ) -> PodTemplateSpec {
        let spec = &self.cluster.spec;
        let node = &template.spec;

        let mut pod_labels = selector_labels.clone();
        pod_labels.extend(template.metadata.labels.clone());

        env.extend(node.env.clone());

        let log_volume = format!("{}-log", base_name);
        let data_volume = format!("{}-data", base_name);

        let mut volume_mounts = vec![
            VolumeMount {
                name: "bootstrap-user".to_string(),
                mount_path: BOOTSTRAP_USER_PATH.to_string(),
                sub_path: Some(BOOTSTRAP_USER_KEY.to_string()),
                read_only: Some(true),
                ..Default::default()
            },
            VolumeMount {
                name: "bootstrap-config".to_string(),
                mount_path: "/opt/emqx/etc/emqx.conf".to_string(),
                sub_path: Some(EMQX_CONF_KEY.to_string()),
                read_only: Some(true),
                ..Default::default()
            },
            VolumeMount {
                name: log_volume.clone(),
                mount_path: "/opt/emqx/log".to_string(),
                ..Default::default()
            },
            VolumeMount {
                name: data_volume.clone(),
                mount_path: "/opt/emqx/data".to_string(),
                ..Default::default()
            },
        ];
        volume_mounts.extend(node.extra_volume_mounts.clone());

        let mut volumes = vec![
            Volume {
                name: "bootstrap-user".to_string(),
                secret: Some(SecretVolumeSource {
                    secret_name: Some(self.cluster.bootstrap_user_name()),
                    ..Default::default()
                }),
                ..Default::default()
            },
            Volume {
                name: "bootstrap-config".to_string(),
                config_map: Some(ConfigMapVolumeSource {
                    name: self.cluster.configs_name(),
                    ..Default::default()
                }),
                ..Default::default()
            },
            Volume {
                name: log_volume,
                empty_dir: Some(EmptyDirVolumeSource::default()),
                ..Default::default()
            },
        ];
        if ephemeral_data {
            volumes.push(Volume {
                name: data_volume,
                empty_dir: Some(EmptyDirVolumeSource::default()),
                ..Default::default()
            });
        }
        volumes.extend(node.extra_volumes.clone());

        let ports = if node.ports.is_empty() {
            vec![
                ContainerPort {
                    name: Some("mqtt".to_string()),
                    container_port: 1883,
                    protocol: Some("TCP".to_string()),
                    ..Default::default()
                },
                ContainerPort {
                    name: Some("dashboard".to_string()),
                    container_port: DASHBOARD_PORT,
                    protocol: Some("TCP".to_string()),
                    ..Default::default()
                },
            ]
        } else {
            node.ports.clone()
        };

        // Apply secure defaults for container security context if not specified
        let container_security_context = node.container_security_context.clone().or_else(|| {
            Some(SecurityContext {
                allow_privilege_escalation: Some(false),
                run_as_non_root: Some(true),
                run_as_user: Some(1000),
                run_as_group: Some(1000),
                capabilities: Some(Capabilities {
                    drop: Some(vec!["ALL".to_string()]),
                    ..Default::default()
                }),
                ..Default::default()
            })
        });

        let pod_security_context = node.pod_security_context.clone().or_else(|| {
            Some(PodSecurityContext {
                run_as_non_root: Some(true),
                run_as_user: Some(1000),
                run_as_group: Some(1000),
                fs_group: Some(1000),
                seccomp_profile: Some(SeccompProfile {
                    type_: "RuntimeDefault".to_string(),
                    ..Default::default()
                }),
                ..Default::default()
            })
        });

        let mut containers = vec![Container {
            name: CONTAINER_NAME.to_string(),
            image: Some(spec.image.clone()),
            image_pull_policy: Some(spec.image_pull_policy.clone()),
            command: node.command.clone(),
            args: node.args.clone(),
            ports: Some(ports),
            env: Some(env),
            env_from: non_empty(node.env_from.clone()),
            resources: node.resources.clone(),
            security_context: container_security_context,
            liveness_probe: node.liveness_probe.clone(),
            readiness_probe: node.readiness_probe.clone(),
            startup_probe: node.startup_probe.clone(),
            lifecycle: node.lifecycle.clone(),
            volume_mounts: Some(volume_mounts),
            ..Default::default()
        }];
        containers.extend(node.extra_containers.clone());

        let annotations = if template.metadata.annotations.is_empty() {
            None
        } else {
            Some(template.metadata.annotations.clone())
        };

        PodTemplateSpec {
            metadata: Some(ObjectMeta {
                labels: Some(pod_labels),
                annotations,
                ..Default::default()
            }),
            spec: Some(PodSpec {
                containers,
                init_containers: non_empty(node.init_containers.clone()),
                volumes: Some(volumes),
                image_pull_secrets: non_empty(spec.image_pull_secrets.clone()),
                security_context: pod_security_context,
                affinity: node.affinity.clone(),
                tolerations: non_empty(node.tolerations.clone()),
                node_name: node.node_name.clone(),
                node_selector: if node.node_selector.is_empty() {
                    None
                } else {
                    Some(node.node_selector.clone())
                },
                ..Default::default()
            }),
        }
    }

    fn core_env(&self) -> Vec<EnvVar> {
        let dns_name = format!(
            "{}.{}.svc.{}",
            self.cluster.headless_service_name(),
            self.namespace,
            self.cluster.spec.cluster_domain
        );
        let mut env = vec![
            field_env("POD_NAME", "metadata.name"),
            value_env("EMQX_CLUSTER__DISCOVERY_STRATEGY", "dns"),
            value_env("EMQX_CLUSTER__DNS__RECORD_TYPE", "srv"),
            value_env("EMQX_CLUSTER__DNS__NAME", &dns_name),
            value_env("EMQX_HOST", &format!("$(POD_NAME).{}", dns_name)),
            value_env("EMQX_NODE__DB_ROLE", "core"),
        ];
        env.extend(self.common_env());
        env
    }

    fn replicant_env(&self) -> Vec<EnvVar> {
        let mut env = vec![
            value_env("EMQX_NODE__DB_ROLE", "replicant"),
            field_env("EMQX_HOST", "status.podIP"),
        ];
        env.extend(self.common_env());
        env
    }

    fn common_env(&self) -> Vec<EnvVar> {
        vec![
            EnvVar {
                name: "EMQX_NODE__COOKIE".to_string(),
                value_from: Some(EnvVarSource {
                    secret_key_ref: Some(SecretKeySelector {
                        name: self.cluster.node_cookie_name(),
                        key: NODE_COOKIE_KEY.to_string(),
                        ..Default::default()
                    }),
                    ..Default::default()
                }),
                ..Default::default()
            },
            value_env(
                "EMQX_API_KEY__BOOTSTRAP_FILE",
                &format!("\"{}\"", BOOTSTRAP_USER_PATH),
            ),
        ]
    }

    /// Build the headless service used for core node discovery
    pub fn build_headless_service(&self) -> Service {
        let selector_labels = self.cluster.core_selector_labels();

        Service {
            metadata: self.metadata(
                self.cluster.headless_service_name(),
                self.cluster.base_labels(),
            ),
            spec: Some(ServiceSpec {
                cluster_ip: Some("None".to_string()),
                selector: Some(selector_labels),
                ports: Some(vec![
                    ServicePort {
                        name: Some("erlang-dist".to_string()),
                        port: 4370,
                        target_port: Some(IntOrString::Int(4370)),
                        protocol: Some("TCP".to_string()),
                        ..Default::default()
                    },
                    ServicePort {
                        name: Some("gen-rpc".to_string()),
                        port: 5369,
                        target_port: Some(IntOrString::Int(5369)),
                        protocol: Some("TCP".to_string()),
                        ..Default::default()
                    },
                ]),
                publish_not_ready_addresses: Some(true),
                ..Default::default()
            }),
            ..Default::default()
        }
    }

    /// Build ConfigMap for broker configuration
    pub fn build_configmap(&self) -> ConfigMap {
        let mut data = BTreeMap::new();
        data.insert(
            EMQX_CONF_KEY.to_string(),
            self.cluster.spec.config.data.clone(),
        );

        ConfigMap {
            metadata: self.metadata(self.cluster.configs_name(), self.cluster.base_labels()),
            data: Some(data),
            ..Default::default()
        }
    }

    /// Build the Secret holding the Erlang distribution cookie
    pub fn build_node_cookie_secret(&self, cookie: &str) -> Secret {
        let mut data = BTreeMap::new();
        data.insert(NODE_COOKIE_KEY.to_string(), cookie.to_string());

        Secret {
            metadata: self.metadata(self.cluster.node_cookie_name(), self.cluster.base_labels()),
            string_data: Some(data),
            type_: Some("Opaque".to_string()),
            ..Default::default()
        }
    }

    /// Build the Secret holding the bootstrap API keys.
    ///
    /// The operator's own key comes first, followed by the user supplied keys.
    pub fn build_bootstrap_user_secret(&self, username: &str, password: &str) -> Secret {
        let mut lines = vec![format!("{}:{}", username, password)];
        lines.extend(
            self.cluster
                .spec
                .bootstrap_api_keys
                .iter()
                .map(|k| format!("{}:{}", k.key, k.secret)),
        );

        let mut data = BTreeMap::new();
        data.insert(BOOTSTRAP_USER_KEY.to_string(), lines.join("\n"));
        data.insert(BOOTSTRAP_USERNAME_KEY.to_string(), username.to_string());
        data.insert(BOOTSTRAP_PASSWORD_KEY.to_string(), password.to_string());

        Secret {
            metadata: self.metadata(
                self.cluster.bootstrap_user_name(),
                self.cluster.base_labels(),
            ),
            string_data: Some(data),
            type_: Some("Opaque".to_string()),
            ..Default::default()
        }
    }
}

fn value_env(name: &str, value: &str) -> EnvVar {
    EnvVar {
        name: name.to_string(),
        value: Some(value.to_string()),
        ..Default::default()
    }
}

fn field_env(name: &str, field_path: &str) -> EnvVar {
    EnvVar {
        name: name.to_string(),
        value_from: Some(EnvVarSource {
            field_ref: Some(ObjectFieldSelector {
                field_path: field_path.to_string(),
                ..Default::default()
            }),
            ..Default::default()
        }),
        ..Default::default()
    }
}

fn non_empty<T>(items: Vec<T>) -> Option<Vec<T>> {
    if items.is_empty() {
        None
    } else {
        Some(items)
    }
}
