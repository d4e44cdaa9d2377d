//! Custom Resource Definitions for the EMQX Kubernetes Operator
//!
//! This module defines the `EMQX` CRD describing a clustered broker with a
//! stable group of core nodes (one StatefulSet) and an optional elastic group
//! of replicant nodes (one ReplicaSet per pod-template revision).

use chrono::{DateTime, Utc};
use k8s_openapi::api::core::v1::{
    Affinity, Container, ContainerPort, EnvFromSource, EnvVar, Lifecycle, LocalObjectReference,
    PersistentVolumeClaimSpec, PodSecurityContext, Probe, ResourceRequirements, SecurityContext,
    Toleration, Volume, VolumeMount,
};
use kube::{CustomResource, ResourceExt};
use regex::Regex;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::LazyLock;
use validator::{Validate, ValidationError};

/// Label carrying the owning EMQX instance name
pub const LABEL_INSTANCE: &str = "apps.emqx.io/instance";
/// Label identifying the controller managing an object
pub const LABEL_MANAGED_BY: &str = "apps.emqx.io/managed-by";
/// Label carrying the database role of a node group (core or replicant)
pub const LABEL_DB_ROLE: &str = "apps.emqx.io/db-role";
/// Label carrying the revision hash of a workload's pod template
pub const POD_TEMPLATE_HASH_LABEL: &str = "apps.emqx.io/pod-template-hash";
/// Value of [`LABEL_MANAGED_BY`] on every generated object
pub const MANAGER_NAME: &str = "emqx-operator";
/// Readiness gate set on replicant pods once they accept client traffic
pub const POD_ON_SERVING: &str = "apps.emqx.io/on-serving";

/// Status condition types, in the order the status machine evaluates them
pub mod condition_types {
    pub const READY: &str = "Ready";
    pub const CORE_NODES_READY: &str = "CoreNodesReady";
    pub const CORE_NODES_PROGRESSING: &str = "CoreNodesProgressing";
    pub const REPLICANT_NODES_READY: &str = "ReplicantNodesReady";
    pub const REPLICANT_NODES_PROGRESSING: &str = "ReplicantNodesProgressing";
}

/// Regex for validating Kubernetes names (RFC 1123 label)
static NAME_REGEX: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[a-z0-9]([-a-z0-9]*[a-z0-9])?$").unwrap());

/// Validate a container image reference
fn validate_image(value: &str) -> Result<(), ValidationError> {
    if value.is_empty() {
        return Err(ValidationError::new("image_required").with_message("image is required".into()));
    }
    if value.len() > 255 {
        return Err(ValidationError::new("image_too_long")
            .with_message("image reference exceeds 255 characters".into()));
    }
    if value.contains("..") || value.starts_with('/') || value.starts_with('-') {
        return Err(ValidationError::new("invalid_image")
            .with_message(format!("'{}' is not a valid container image", value).into()));
    }
    Ok(())
}

/// Validate image pull policy
fn validate_pull_policy(policy: &str) -> Result<(), ValidationError> {
    match policy {
        "Always" | "IfNotPresent" | "Never" => Ok(()),
        _ => Err(ValidationError::new("invalid_pull_policy")
            .with_message(format!("'{}' is not a valid image pull policy", policy).into())),
    }
}

/// Validate a template name override. Revision hashes are appended to the
/// replicant name, so the base has to leave room for them.
fn validate_template_name(name: &str) -> Result<(), ValidationError> {
    if name.len() > 52 {
        return Err(ValidationError::new("name_too_long")
            .with_message("template name exceeds 52 characters".into()));
    }
    if !NAME_REGEX.is_match(name) {
        return Err(ValidationError::new("invalid_name").with_message(
            format!("'{}' is not a valid Kubernetes name (RFC 1123)", name).into(),
        ));
    }
    Ok(())
}

/// EMQX custom resource definition
///
/// One object describes one broker cluster. The operator creates the core
/// StatefulSet, replicant ReplicaSets and the supporting Service, ConfigMap
/// and Secrets, all owned by this object.
#[derive(CustomResource, Debug, Clone, Deserialize, Serialize, JsonSchema, Validate)]
#[kube(
    group = "apps.emqx.io",
    version = "v2beta1",
    kind = "EMQX",
    root = "Emqx",
    plural = "emqxes",
    shortname = "emqx",
    namespaced,
    status = "EmqxStatus",
    printcolumn = r#"{"name":"Image", "type":"string", "jsonPath":".spec.image"}"#,
    printcolumn = r#"{"name":"Ready", "type":"string", "jsonPath":".status.conditions[?(@.type==\"Ready\")].status"}"#,
    printcolumn = r#"{"name":"Age", "type":"date", "jsonPath":".metadata.creationTimestamp"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct EmqxSpec {
    /// Broker container image
    #[validate(custom(function = "validate_image"))]
    pub image: String,

    /// Image pull policy (Always, IfNotPresent, Never)
    #[serde(default = "default_image_pull_policy")]
    #[validate(custom(function = "validate_pull_policy"))]
    pub image_pull_policy: String,

    /// Image pull secrets (max 10 secrets)
    #[serde(default)]
    #[validate(length(max = 10, message = "maximum 10 image pull secrets allowed"))]
    pub image_pull_secrets: Vec<LocalObjectReference>,

    /// Cluster DNS domain used to build core node host names
    #[serde(default = "default_cluster_domain")]
    #[validate(length(min = 1, max = 253, message = "clusterDomain must be 1-253 characters"))]
    pub cluster_domain: String,

    /// Extra API keys written to the bootstrap file next to the operator's own key
    #[serde(default)]
    #[validate(nested)]
    pub bootstrap_api_keys: Vec<BootstrapApiKey>,

    /// Broker configuration (HOCON) mounted as emqx.conf
    #[serde(default)]
    pub config: EmqxConfig,

    /// How superseded replicant revisions are drained
    #[serde(default)]
    #[validate(nested)]
    pub update_strategy: UpdateStrategy,

    /// Core node group, always present
    #[validate(nested)]
    pub core_template: EmqxNodeTemplate,

    /// Replicant node group; absent means a core-only cluster
    #[serde(default, skip_serializing_if = "Option::is_none")]
    #[validate(nested)]
    pub replicant_template: Option<EmqxNodeTemplate>,
}

/// API key pre-provisioned into the broker through the bootstrap file
#[derive(Debug, Clone, Deserialize, Serialize, JsonSchema, Validate, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct BootstrapApiKey {
    #[validate(length(min = 3, max = 32, message = "key must be 3-32 characters"))]
    pub key: String,
    #[validate(length(min = 3, max = 128, message = "secret must be 3-128 characters"))]
    pub secret: String,
}

/// Broker configuration
#[derive(Debug, Clone, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct EmqxConfig {
    /// Raw emqx.conf content
    #[serde(default)]
    pub data: String,
}

/// Update strategy for replicant revisions
#[derive(Debug, Clone, Deserialize, Serialize, JsonSchema, Validate, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct UpdateStrategy {
    /// Seconds the cluster must have been Ready before old replicants are drained
    #[serde(default = "default_initial_delay_seconds")]
    #[validate(range(min = 0, max = 86400, message = "initialDelaySeconds must be 0-86400"))]
    pub initial_delay_seconds: i32,

    #[serde(default)]
    #[validate(nested)]
    pub evacuation_strategy: EvacuationStrategy,
}

impl Default for UpdateStrategy {
    fn default() -> Self {
        Self {
            initial_delay_seconds: default_initial_delay_seconds(),
            evacuation_strategy: EvacuationStrategy::default(),
        }
    }
}

/// Pacing of replicant scale-down
#[derive(Debug, Clone, Deserialize, Serialize, JsonSchema, Validate, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct EvacuationStrategy {
    /// Seconds to wait after a pod deletion before removing the next pod
    #[serde(default = "default_wait_takeover")]
    #[validate(range(min = 0, max = 3600, message = "waitTakeover must be 0-3600"))]
    pub wait_takeover: i32,

    /// Client connections evicted per second, passed to the broker
    #[serde(default = "default_evict_rate")]
    #[validate(range(min = 1, message = "connEvictRate must be at least 1"))]
    pub conn_evict_rate: i32,

    /// Sessions evicted per second, passed to the broker
    #[serde(default = "default_evict_rate")]
    #[validate(range(min = 1, message = "sessEvictRate must be at least 1"))]
    pub sess_evict_rate: i32,
}

impl Default for EvacuationStrategy {
    fn default() -> Self {
        Self {
            wait_takeover: default_wait_takeover(),
            conn_evict_rate: default_evict_rate(),
            sess_evict_rate: default_evict_rate(),
        }
    }
}

/// Template for one node group
#[derive(Debug, Clone, Default, Deserialize, Serialize, JsonSchema, Validate, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct EmqxNodeTemplate {
    #[serde(default)]
    #[validate(nested)]
    pub metadata: TemplateMeta,

    #[serde(default)]
    #[validate(nested)]
    pub spec: NodeTemplateSpec,
}

/// Metadata copied onto the generated workload and its pods
#[derive(Debug, Clone, Default, Deserialize, Serialize, JsonSchema, Validate, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct TemplateMeta {
    /// Overrides the generated workload base name
    #[serde(default, skip_serializing_if = "Option::is_none")]
    #[validate(custom(function = "validate_template_name"))]
    pub name: Option<String>,

    #[serde(default)]
    pub labels: BTreeMap<String, String>,

    #[serde(default)]
    pub annotations: BTreeMap<String, String>,
}

/// Pod-level settings of a node group
#[derive(Debug, Clone, Deserialize, Serialize, JsonSchema, Validate, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct NodeTemplateSpec {
    /// Desired number of nodes in the group
    #[serde(default = "default_replicas")]
    #[validate(range(min = 0, max = 100, message = "replicas must be between 0 and 100"))]
    pub replicas: i32,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub command: Option<Vec<String>>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub args: Option<Vec<String>>,

    #[serde(default)]
    pub ports: Vec<ContainerPort>,

    #[serde(default)]
    pub env: Vec<EnvVar>,

    #[serde(default)]
    pub env_from: Vec<EnvFromSource>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resources: Option<ResourceRequirements>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pod_security_context: Option<PodSecurityContext>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub container_security_context: Option<SecurityContext>,

    #[serde(default)]
    pub init_containers: Vec<Container>,

    #[serde(default)]
    pub extra_containers: Vec<Container>,

    #[serde(default)]
    pub extra_volumes: Vec<Volume>,

    #[serde(default)]
    pub extra_volume_mounts: Vec<VolumeMount>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub affinity: Option<Affinity>,

    #[serde(default)]
    pub tolerations: Vec<Toleration>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub node_name: Option<String>,

    #[serde(default)]
    pub node_selector: BTreeMap<String, String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub liveness_probe: Option<Probe>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub readiness_probe: Option<Probe>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub startup_probe: Option<Probe>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub lifecycle: Option<Lifecycle>,

    /// Persistent data volume for core nodes; ignored for replicants
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub volume_claim_templates: Option<PersistentVolumeClaimSpec>,
}

impl Default for NodeTemplateSpec {
    fn default() -> Self {
        Self {
            replicas: default_replicas(),
            command: None,
            args: None,
            ports: vec![],
            env: vec![],
            env_from: vec![],
            resources: None,
            pod_security_context: None,
            container_security_context: None,
            init_containers: vec![],
            extra_containers: vec![],
            extra_volumes: vec![],
            extra_volume_mounts: vec![],
            affinity: None,
            tolerations: vec![],
            node_name: None,
            node_selector: BTreeMap::new(),
            liveness_probe: None,
            readiness_probe: None,
            startup_probe: None,
            lifecycle: None,
            volume_claim_templates: None,
        }
    }
}

/// Status of an EMQX resource
#[derive(Debug, Clone, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct EmqxStatus {
    #[serde(default)]
    pub core_nodes_status: EmqxNodesStatus,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub replicant_nodes_status: Option<EmqxNodesStatus>,

    /// Conditions, most recently changed first
    #[serde(default)]
    pub conditions: Vec<Condition>,
}

/// Observed state of one node group
#[derive(Debug, Clone, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct EmqxNodesStatus {
    /// Desired replicas copied from the spec
    #[serde(default)]
    pub replicas: i32,

    /// Nodes the broker reports as running
    #[serde(default)]
    pub ready_replicas: i32,

    /// Revision hash of the workload currently targeted
    #[serde(default)]
    pub current_revision: String,

    /// Bumped when a revision name collides with a different template
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub collision_count: Option<i32>,

    /// Live node snapshots from the broker API
    #[serde(default)]
    pub nodes: Vec<EmqxNode>,
}

/// One broker node as reported by `GET /api/v5/nodes`
#[derive(Debug, Clone, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
pub struct EmqxNode {
    /// Node name, e.g. `emqx@10.0.0.7`
    pub node: String,
    #[serde(default)]
    pub node_status: String,
    #[serde(default)]
    pub otp_release: String,
    #[serde(default)]
    pub version: String,
    /// `core` or `replicant`
    #[serde(default)]
    pub role: String,
    /// `Opensource` or `Enterprise`
    #[serde(default)]
    pub edition: String,
    #[serde(default)]
    pub uptime: i64,
    #[serde(default)]
    pub connections: i64,
    #[serde(default)]
    pub live_connections: i64,
    /// Number of sessions held by the node
    #[serde(default)]
    pub session: i64,
}

impl EmqxNode {
    pub fn is_running(&self) -> bool {
        self.node_status == "running"
    }

    pub fn is_enterprise(&self) -> bool {
        self.edition == "Enterprise"
    }
}

/// Status of a condition
#[derive(Debug, Clone, Copy, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
pub enum ConditionStatus {
    True,
    #[default]
    False,
}

impl From<bool> for ConditionStatus {
    fn from(value: bool) -> Self {
        if value {
            ConditionStatus::True
        } else {
            ConditionStatus::False
        }
    }
}

/// Condition describing an aspect of cluster state
#[derive(Debug, Clone, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Condition {
    /// Type of condition
    #[serde(rename = "type")]
    pub condition_type: String,

    pub status: ConditionStatus,

    /// Machine-readable reason
    #[serde(default)]
    pub reason: String,

    /// Human-readable message
    #[serde(default)]
    pub message: String,

    /// When the status last flipped
    pub last_transition_time: DateTime<Utc>,

    /// When the condition was last written
    pub last_update_time: DateTime<Utc>,
}

impl Condition {
    pub fn new(
        condition_type: &str,
        status: bool,
        reason: &str,
        message: impl Into<String>,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            condition_type: condition_type.to_string(),
            status: status.into(),
            reason: reason.to_string(),
            message: message.into(),
            last_transition_time: now,
            last_update_time: now,
        }
    }

    pub fn is_true(&self) -> bool {
        self.status == ConditionStatus::True
    }
}

impl EmqxStatus {
    /// Record a condition.
    ///
    /// A condition whose status is unchanged keeps its position and
    /// transition time. A new or flipped condition is moved to the front.
    pub fn set_condition(&mut self, condition: Condition) {
        if let Some(existing) = self
            .conditions
            .iter_mut()
            .find(|c| c.condition_type == condition.condition_type)
        {
            if existing.status == condition.status {
                existing.reason = condition.reason;
                existing.message = condition.message;
                existing.last_update_time = condition.last_update_time;
                return;
            }
        }
        self.remove_condition(&condition.condition_type);
        self.conditions.insert(0, condition);
    }

    pub fn remove_condition(&mut self, condition_type: &str) {
        self.conditions
            .retain(|c| c.condition_type != condition_type);
    }

    pub fn get_condition(&self, condition_type: &str) -> Option<&Condition> {
        self.conditions
            .iter()
            .find(|c| c.condition_type == condition_type)
    }

    pub fn is_condition_true(&self, condition_type: &str) -> bool {
        self.get_condition(condition_type)
            .is_some_and(Condition::is_true)
    }

    /// The true condition with the latest transition time. Ties go to the
    /// one nearest the front of the list.
    pub fn last_true_condition(&self) -> Option<&Condition> {
        let mut latest: Option<&Condition> = None;
        for condition in self.conditions.iter().filter(|c| c.is_true()) {
            match latest {
                Some(l) if l.last_transition_time >= condition.last_transition_time => {}
                _ => latest = Some(condition),
            }
        }
        latest
    }

    /// Current phase: the type of the most recently transitioned true condition
    pub fn phase(&self) -> Option<&str> {
        self.last_true_condition()
            .map(|c| c.condition_type.as_str())
    }

    /// Split live nodes by role into the per-group node lists
    pub fn set_nodes(&mut self, nodes: Vec<EmqxNode>) {
        let (replicants, cores): (Vec<_>, Vec<_>) =
            nodes.into_iter().partition(|n| n.role == "replicant");

        self.core_nodes_status.ready_replicas = running_count(&cores);
        self.core_nodes_status.nodes = cores;

        if replicants.is_empty() {
            if let Some(ref mut repl) = self.replicant_nodes_status {
                repl.ready_replicas = 0;
                repl.nodes.clear();
            }
            return;
        }
        let repl = self.replicant_nodes_status.get_or_insert_with(Default::default);
        repl.ready_replicas = running_count(&replicants);
        repl.nodes = replicants;
    }
}

fn running_count(nodes: &[EmqxNode]) -> i32 {
    nodes.iter().filter(|n| n.is_running()).count() as i32
}

// Default value functions
fn default_image_pull_policy() -> String {
    "IfNotPresent".to_string()
}

fn default_cluster_domain() -> String {
    "cluster.local".to_string()
}

fn default_replicas() -> i32 {
    2
}

fn default_initial_delay_seconds() -> i32 {
    10
}

fn default_wait_takeover() -> i32 {
    10
}

fn default_evict_rate() -> i32 {
    1000
}

impl Emqx {
    /// Namespace of the object, `default` if unset
    pub fn namespace_or_default(&self) -> String {
        self.namespace().unwrap_or_else(|| "default".to_string())
    }

    /// Name of the core StatefulSet
    pub fn core_name(&self) -> String {
        self.spec
            .core_template
            .metadata
            .name
            .clone()
            .unwrap_or_else(|| format!("{}-core", self.name_any()))
    }

    /// Base name of replicant ReplicaSets, before the revision suffix
    pub fn replicant_name(&self) -> String {
        self.spec
            .replicant_template
            .as_ref()
            .and_then(|t| t.metadata.name.clone())
            .unwrap_or_else(|| format!("{}-replicant", self.name_any()))
    }

    pub fn headless_service_name(&self) -> String {
        format!("{}-headless", self.name_any())
    }

    pub fn node_cookie_name(&self) -> String {
        format!("{}-node-cookie", self.name_any())
    }

    pub fn bootstrap_user_name(&self) -> String {
        format!("{}-bootstrap-user", self.name_any())
    }

    pub fn configs_name(&self) -> String {
        format!("{}-configs", self.name_any())
    }

    /// Labels shared by every object generated for this cluster
    pub fn base_labels(&self) -> BTreeMap<String, String> {
        let mut labels = BTreeMap::new();
        labels.insert(LABEL_INSTANCE.to_string(), self.name_any());
        labels.insert(LABEL_MANAGED_BY.to_string(), MANAGER_NAME.to_string());
        labels
    }

    /// Selector labels of the core StatefulSet and its pods
    pub fn core_selector_labels(&self) -> BTreeMap<String, String> {
        let mut labels = self.base_labels();
        labels.insert(LABEL_DB_ROLE.to_string(), "core".to_string());
        labels
    }

    /// Selector labels shared by every replicant ReplicaSet
    pub fn replicant_selector_labels(&self) -> BTreeMap<String, String> {
        let mut labels = self.base_labels();
        labels.insert(LABEL_DB_ROLE.to_string(), "replicant".to_string());
        labels
    }

    /// Desired number of replicant nodes, zero when no replicant group is configured
    pub fn desired_replicants(&self) -> i32 {
        self.spec
            .replicant_template
            .as_ref()
            .map(|t| t.spec.replicas)
            .unwrap_or(0)
    }

    pub fn status_or_default(&self) -> EmqxStatus {
        self.status.clone().unwrap_or_default()
    }
}
