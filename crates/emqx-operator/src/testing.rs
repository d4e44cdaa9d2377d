//! In-memory fakes and fixtures shared by the unit tests

use crate::crd::{Emqx, EmqxNodeTemplate, EmqxSpec, NodeTemplateSpec};
use crate::error::{OperatorError, Result};
use crate::events::EventPublisher;
use crate::store::ResourceStore;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use k8s_openapi::api::apps::v1::{ReplicaSet, ReplicaSetStatus, StatefulSet, StatefulSetStatus};
use k8s_openapi::api::core::v1::{
    ConfigMap, Event, ObjectReference, Pod, PodCondition, PodStatus, Secret, Service,
};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{ObjectMeta, Time};
use kube::runtime::events::EventType;
use kube::{Resource, ResourceExt};
use std::collections::BTreeMap;
use std::sync::Mutex;

/// Fixed instant offset by `secs`
pub fn at(secs: i64) -> DateTime<Utc> {
    DateTime::<Utc>::from_timestamp(1_700_000_000 + secs, 0).unwrap()
}

/// Cluster with two core and two replicant nodes in the `default` namespace
pub fn sample_cluster(name: &str) -> Emqx {
    let mut cluster = Emqx::new(
        name,
        EmqxSpec {
            image: "emqx:5.1".to_string(),
            image_pull_policy: "IfNotPresent".to_string(),
            image_pull_secrets: vec![],
            cluster_domain: "cluster.local".to_string(),
            bootstrap_api_keys: vec![],
            config: Default::default(),
            update_strategy: Default::default(),
            core_template: EmqxNodeTemplate {
                metadata: Default::default(),
                spec: NodeTemplateSpec {
                    replicas: 2,
                    ..Default::default()
                },
            },
            replicant_template: Some(EmqxNodeTemplate {
                metadata: Default::default(),
                spec: NodeTemplateSpec {
                    replicas: 2,
                    ..Default::default()
                },
            }),
        },
    );
    cluster.metadata.namespace = Some("default".to_string());
    cluster.metadata.uid = Some(format!("{}-uid", name));
    cluster.metadata.generation = Some(1);
    cluster
}

/// Pod reporting `Ready` with the given IP
pub fn ready_pod(name: &str, labels: BTreeMap<String, String>, ip: &str) -> Pod {
    Pod {
        metadata: ObjectMeta {
            name: Some(name.to_string()),
            namespace: Some("default".to_string()),
            labels: Some(labels),
            ..Default::default()
        },
        status: Some(PodStatus {
            pod_ip: Some(ip.to_string()),
            conditions: Some(vec![PodCondition {
                type_: "Ready".to_string(),
                status: "True".to_string(),
                ..Default::default()
            }]),
            ..Default::default()
        }),
        ..Default::default()
    }
}

/// `SuccessfulDelete` event recorded against a ReplicaSet
pub fn delete_event(rs_name: &str, time: DateTime<Utc>) -> Event {
    Event {
        metadata: ObjectMeta {
            name: Some(format!("{}.{}", rs_name, time.timestamp())),
            namespace: Some("default".to_string()),
            ..Default::default()
        },
        reason: Some("SuccessfulDelete".to_string()),
        involved_object: ObjectReference {
            kind: Some("ReplicaSet".to_string()),
            name: Some(rs_name.to_string()),
            namespace: Some("default".to_string()),
            ..Default::default()
        },
        last_timestamp: Some(Time(time)),
        ..Default::default()
    }
}

/// StatefulSet status with every replica ready on `revision`
pub fn rolled_out_statefulset_status(sts: &StatefulSet, revision: &str) -> StatefulSetStatus {
    let replicas = sts.spec.as_ref().and_then(|s| s.replicas).unwrap_or(0);
    StatefulSetStatus {
        observed_generation: sts.metadata.generation,
        replicas,
        ready_replicas: Some(replicas),
        current_replicas: Some(replicas),
        updated_replicas: Some(replicas),
        current_revision: Some(revision.to_string()),
        update_revision: Some(revision.to_string()),
        ..Default::default()
    }
}

/// ReplicaSet status with every replica ready
pub fn rolled_out_replicaset_status(rs: &ReplicaSet) -> ReplicaSetStatus {
    let replicas = rs.spec.as_ref().and_then(|s| s.replicas).unwrap_or(0);
    ReplicaSetStatus {
        observed_generation: rs.metadata.generation,
        replicas,
        ready_replicas: Some(replicas),
        available_replicas: Some(replicas),
        ..Default::default()
    }
}

fn matches_labels<K: Resource>(obj: &K, selector: &BTreeMap<String, String>) -> bool {
    let labels = obj.labels();
    selector.iter().all(|(k, v)| labels.get(k) == Some(v))
}

#[derive(Default)]
struct State {
    next_version: u64,
    statefulsets: BTreeMap<String, StatefulSet>,
    replicasets: BTreeMap<String, ReplicaSet>,
    pods: BTreeMap<String, Pod>,
    events: Vec<Event>,
    secrets: BTreeMap<String, Secret>,
    services: BTreeMap<String, Service>,
    configmaps: BTreeMap<String, ConfigMap>,
    clusters: BTreeMap<String, Emqx>,
    fail_next_create: bool,
    fail_next_replace: bool,
    status_writes: Vec<Emqx>,
    replicaset_creates: usize,
    replicaset_replaces: usize,
    statefulset_replaces: usize,
    annotated_pods: Vec<(String, String, String)>,
}

impl State {
    fn bump(&mut self) -> String {
        self.next_version += 1;
        self.next_version.to_string()
    }

    /// Fill in the server-managed metadata of a new object
    fn admit(&mut self, meta: &mut ObjectMeta) {
        meta.resource_version = Some(self.bump());
        meta.generation = Some(1);
        meta.uid = Some(format!("uid-{}", self.next_version));
        meta.creation_timestamp = Some(Time(at(self.next_version as i64)));
    }
}

/// Single-namespace [`ResourceStore`] kept in memory.
///
/// Creates reject existing names with `AlreadyExists`; replaces reject a
/// stale `resourceVersion` with `Conflict` and keep the stored status.
#[derive(Default)]
pub struct InMemoryStore {
    state: Mutex<State>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> std::sync::MutexGuard<'_, State> {
        self.state.lock().unwrap()
    }

    pub fn insert_pod(&self, pod: Pod) {
        self.state().pods.insert(pod.name_any(), pod);
    }

    pub fn insert_secret(&self, secret: Secret) {
        self.state().secrets.insert(secret.name_any(), secret);
    }

    pub fn insert_event(&self, event: Event) {
        self.state().events.push(event);
    }

    /// Store a ReplicaSet as if created earlier, keeping its timestamps if set
    pub fn insert_replicaset(&self, mut rs: ReplicaSet) -> ReplicaSet {
        let mut state = self.state();
        let version = state.bump();
        rs.metadata.resource_version = Some(version);
        rs.metadata.generation.get_or_insert(1);
        state.replicasets.insert(rs.name_any(), rs.clone());
        rs
    }

    pub fn insert_cluster(&self, mut cluster: Emqx) -> Emqx {
        let mut state = self.state();
        cluster.metadata.resource_version = Some(state.bump());
        state.clusters.insert(cluster.name_any(), cluster.clone());
        cluster
    }

    pub fn set_statefulset_status(&self, name: &str, status: StatefulSetStatus) {
        if let Some(sts) = self.state().statefulsets.get_mut(name) {
            sts.status = Some(status);
        }
    }

    pub fn set_replicaset_status(&self, name: &str, status: ReplicaSetStatus) {
        if let Some(rs) = self.state().replicasets.get_mut(name) {
            rs.status = Some(status);
        }
    }

    /// The next create of any kind fails with `AlreadyExists`
    pub fn fail_next_create(&self) {
        self.state().fail_next_create = true;
    }

    /// The next replace of any kind fails with `Conflict`
    pub fn fail_next_replace(&self) {
        self.state().fail_next_replace = true;
    }

    pub fn statefulset(&self, name: &str) -> Option<StatefulSet> {
        self.state().statefulsets.get(name).cloned()
    }

    pub fn replicaset(&self, name: &str) -> Option<ReplicaSet> {
        self.state().replicasets.get(name).cloned()
    }

    pub fn replicasets(&self) -> Vec<ReplicaSet> {
        self.state().replicasets.values().cloned().collect()
    }

    pub fn secret(&self, name: &str) -> Option<Secret> {
        self.state().secrets.get(name).cloned()
    }

    pub fn service(&self, name: &str) -> Option<Service> {
        self.state().services.get(name).cloned()
    }

    pub fn configmap(&self, name: &str) -> Option<ConfigMap> {
        self.state().configmaps.get(name).cloned()
    }

    pub fn pod(&self, name: &str) -> Option<Pod> {
        self.state().pods.get(name).cloned()
    }

    pub fn cluster(&self, name: &str) -> Option<Emqx> {
        self.state().clusters.get(name).cloned()
    }

    pub fn status_writes(&self) -> Vec<Emqx> {
        self.state().status_writes.clone()
    }

    pub fn replicaset_creates(&self) -> usize {
        self.state().replicaset_creates
    }

    pub fn replicaset_replaces(&self) -> usize {
        self.state().replicaset_replaces
    }

    pub fn statefulset_replaces(&self) -> usize {
        self.state().statefulset_replaces
    }

    pub fn annotated_pods(&self) -> Vec<(String, String, String)> {
        self.state().annotated_pods.clone()
    }
}

fn check_version(stored: Option<&str>, given: Option<&str>, what: &str) -> Result<()> {
    match (stored, given) {
        (Some(s), Some(g)) if s != g => Err(OperatorError::Conflict(what.to_string())),
        _ => Ok(()),
    }
}

#[async_trait]
impl ResourceStore for InMemoryStore {
    async fn get_statefulset(&self, _namespace: &str, name: &str) -> Result<Option<StatefulSet>> {
        Ok(self.state().statefulsets.get(name).cloned())
    }

    async fn create_statefulset(&self, _namespace: &str, sts: &StatefulSet) -> Result<StatefulSet> {
        let mut state = self.state();
        let name = sts.name_any();
        if std::mem::take(&mut state.fail_next_create) || state.statefulsets.contains_key(&name) {
            return Err(OperatorError::AlreadyExists(format!("statefulset/{}", name)));
        }
        let mut created = sts.clone();
        state.admit(&mut created.metadata);
        state.statefulsets.insert(name, created.clone());
        Ok(created)
    }

    async fn replace_statefulset(&self, _namespace: &str, sts: &StatefulSet) -> Result<StatefulSet> {
        let mut state = self.state();
        let name = sts.name_any();
        let what = format!("statefulset/{}", name);
        if std::mem::take(&mut state.fail_next_replace) {
            return Err(OperatorError::Conflict(what));
        }
        let Some(stored) = state.statefulsets.get(&name).cloned() else {
            return Err(OperatorError::ReconcileFailed(format!("{} not found", what)));
        };
        check_version(
            stored.metadata.resource_version.as_deref(),
            sts.metadata.resource_version.as_deref(),
            &what,
        )?;
        let mut replaced = sts.clone();
        replaced.status = stored.status.clone();
        replaced.metadata.uid = stored.metadata.uid.clone();
        replaced.metadata.creation_timestamp = stored.metadata.creation_timestamp.clone();
        replaced.metadata.generation = Some(stored.metadata.generation.unwrap_or(1) + 1);
        replaced.metadata.resource_version = Some(state.bump());
        state.statefulset_replaces += 1;
        state.statefulsets.insert(name, replaced.clone());
        Ok(replaced)
    }

    async fn list_replicasets(
        &self,
        _namespace: &str,
        labels: &BTreeMap<String, String>,
    ) -> Result<Vec<ReplicaSet>> {
        Ok(self
            .state()
            .replicasets
            .values()
            .filter(|rs| matches_labels(*rs, labels))
            .cloned()
            .collect())
    }

    async fn create_replicaset(&self, _namespace: &str, rs: &ReplicaSet) -> Result<ReplicaSet> {
        let mut state = self.state();
        let name = rs.name_any();
        if std::mem::take(&mut state.fail_next_create) || state.replicasets.contains_key(&name) {
            return Err(OperatorError::AlreadyExists(format!("replicaset/{}", name)));
        }
        let mut created = rs.clone();
        state.admit(&mut created.metadata);
        state.replicaset_creates += 1;
        state.replicasets.insert(name, created.clone());
        Ok(created)
    }

    async fn replace_replicaset(&self, _namespace: &str, rs: &ReplicaSet) -> Result<ReplicaSet> {
        let mut state = self.state();
        let name = rs.name_any();
        let what = format!("replicaset/{}", name);
        if std::mem::take(&mut state.fail_next_replace) {
            return Err(OperatorError::Conflict(what));
        }
        let Some(stored) = state.replicasets.get(&name).cloned() else {
            return Err(OperatorError::ReconcileFailed(format!("{} not found", what)));
        };
        check_version(
            stored.metadata.resource_version.as_deref(),
            rs.metadata.resource_version.as_deref(),
            &what,
        )?;
        let mut replaced = rs.clone();
        replaced.status = stored.status.clone();
        replaced.metadata.uid = stored.metadata.uid.clone();
        replaced.metadata.creation_timestamp = stored.metadata.creation_timestamp.clone();
        replaced.metadata.resource_version = Some(state.bump());
        state.replicaset_replaces += 1;
        state.replicasets.insert(name, replaced.clone());
        Ok(replaced)
    }

    async fn list_pods(
        &self,
        _namespace: &str,
        labels: &BTreeMap<String, String>,
    ) -> Result<Vec<Pod>> {
        Ok(self
            .state()
            .pods
            .values()
            .filter(|p| matches_labels(*p, labels))
            .cloned()
            .collect())
    }

    async fn annotate_pod(
        &self,
        _namespace: &str,
        name: &str,
        key: &str,
        value: &str,
    ) -> Result<()> {
        let mut state = self.state();
        let Some(pod) = state.pods.get_mut(name) else {
            return Err(OperatorError::ReconcileFailed(format!("pod/{} not found", name)));
        };
        pod.metadata
            .annotations
            .get_or_insert_with(BTreeMap::new)
            .insert(key.to_string(), value.to_string());
        state
            .annotated_pods
            .push((name.to_string(), key.to_string(), value.to_string()));
        Ok(())
    }

    async fn list_events(&self, _namespace: &str, kind: &str, name: &str) -> Result<Vec<Event>> {
        Ok(self
            .state()
            .events
            .iter()
            .filter(|e| {
                e.involved_object.kind.as_deref() == Some(kind)
                    && e.involved_object.name.as_deref() == Some(name)
            })
            .cloned()
            .collect())
    }

    async fn replace_cluster_status(&self, cluster: &Emqx) -> Result<Emqx> {
        let mut state = self.state();
        let name = cluster.name_any();
        let what = format!("emqx/{} status", name);
        if std::mem::take(&mut state.fail_next_replace) {
            return Err(OperatorError::Conflict(what));
        }
        if let Some(stored) = state.clusters.get(&name) {
            check_version(
                stored.metadata.resource_version.as_deref(),
                cluster.metadata.resource_version.as_deref(),
                &what,
            )?;
        }
        let mut written = cluster.clone();
        written.metadata.resource_version = Some(state.bump());
        state.clusters.insert(name, written.clone());
        state.status_writes.push(written.clone());
        Ok(written)
    }

    async fn apply_service(&self, _namespace: &str, svc: &Service) -> Result<()> {
        self.state().services.insert(svc.name_any(), svc.clone());
        Ok(())
    }

    async fn apply_configmap(&self, _namespace: &str, cm: &ConfigMap) -> Result<()> {
        self.state().configmaps.insert(cm.name_any(), cm.clone());
        Ok(())
    }

    async fn get_secret(&self, _namespace: &str, name: &str) -> Result<Option<Secret>> {
        Ok(self.state().secrets.get(name).cloned())
    }

    async fn create_secret(&self, _namespace: &str, secret: &Secret) -> Result<()> {
        let mut state = self.state();
        let name = secret.name_any();
        if !state.secrets.contains_key(&name) {
            let mut created = secret.clone();
            state.admit(&mut created.metadata);
            state.secrets.insert(name, created);
        }
        Ok(())
    }
}

/// A published event as seen by [`RecordingEventPublisher`]
#[derive(Debug, Clone, PartialEq)]
pub struct RecordedEvent {
    pub object: Option<String>,
    pub warning: bool,
    pub reason: String,
    pub action: String,
    pub note: Option<String>,
}

/// [`EventPublisher`] that keeps every event in memory
#[derive(Default)]
pub struct RecordingEventPublisher {
    events: Mutex<Vec<RecordedEvent>>,
}

impl RecordingEventPublisher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<RecordedEvent> {
        self.events.lock().unwrap().clone()
    }

    pub fn reasons(&self) -> Vec<String> {
        self.events().into_iter().map(|e| e.reason).collect()
    }
}

#[async_trait]
impl EventPublisher for RecordingEventPublisher {
    async fn publish(
        &self,
        resource_ref: &ObjectReference,
        type_: EventType,
        reason: &str,
        action: &str,
        note: Option<String>,
    ) {
        self.events.lock().unwrap().push(RecordedEvent {
            object: resource_ref.name.clone(),
            warning: matches!(type_, EventType::Warning),
            reason: reason.to_string(),
            action: action.to_string(),
            note,
        });
    }
}
