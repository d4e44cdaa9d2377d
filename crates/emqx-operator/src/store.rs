//! Resource store
//!
//! Trait seam over the Kubernetes API calls the reconcilers make, with a
//! kube-rs implementation. Workload and status writes are plain replaces
//! carrying the `resourceVersion` that was read, so a concurrent writer
//! turns into [`OperatorError::Conflict`] instead of a lost update.

use crate::crd::{Emqx, LABEL_MANAGED_BY, MANAGER_NAME};
use crate::error::{from_kube, OperatorError, Result};
use async_trait::async_trait;
use k8s_openapi::api::apps::v1::{ReplicaSet, StatefulSet};
use k8s_openapi::api::core::v1::{ConfigMap, Event, Pod, Secret, Service};
use kube::api::{Api, ListParams, Patch, PatchParams, PostParams};
use kube::{Client, Resource, ResourceExt};
use std::collections::BTreeMap;
use tracing::debug;

/// Kubernetes API operations used by the reconcilers
#[async_trait]
pub trait ResourceStore: Send + Sync {
    async fn get_statefulset(&self, namespace: &str, name: &str) -> Result<Option<StatefulSet>>;

    async fn create_statefulset(&self, namespace: &str, sts: &StatefulSet) -> Result<StatefulSet>;

    /// Conditional replace; fails with `Conflict` on a stale resourceVersion
    async fn replace_statefulset(&self, namespace: &str, sts: &StatefulSet) -> Result<StatefulSet>;

    /// List ReplicaSets carrying all of `labels`
    async fn list_replicasets(
        &self,
        namespace: &str,
        labels: &BTreeMap<String, String>,
    ) -> Result<Vec<ReplicaSet>>;

    async fn create_replicaset(&self, namespace: &str, rs: &ReplicaSet) -> Result<ReplicaSet>;

    /// Conditional replace; fails with `Conflict` on a stale resourceVersion
    async fn replace_replicaset(&self, namespace: &str, rs: &ReplicaSet) -> Result<ReplicaSet>;

    /// List Pods carrying all of `labels`
    async fn list_pods(&self, namespace: &str, labels: &BTreeMap<String, String>)
        -> Result<Vec<Pod>>;

    /// Merge-patch a single annotation onto a Pod
    async fn annotate_pod(&self, namespace: &str, name: &str, key: &str, value: &str)
        -> Result<()>;

    /// List events recorded against an object
    async fn list_events(&self, namespace: &str, kind: &str, name: &str) -> Result<Vec<Event>>;

    /// Conditional replace of the status subresource
    async fn replace_cluster_status(&self, cluster: &Emqx) -> Result<Emqx>;

    /// Server-side apply
    async fn apply_service(&self, namespace: &str, svc: &Service) -> Result<()>;

    /// Server-side apply
    async fn apply_configmap(&self, namespace: &str, cm: &ConfigMap) -> Result<()>;

    async fn get_secret(&self, namespace: &str, name: &str) -> Result<Option<Secret>>;

    /// Create a Secret; an already existing one is left untouched
    async fn create_secret(&self, namespace: &str, secret: &Secret) -> Result<()>;
}

/// Render labels as a selector string
pub fn label_selector(labels: &BTreeMap<String, String>) -> String {
    labels
        .iter()
        .map(|(k, v)| format!("{}={}", k, v))
        .collect::<Vec<_>>()
        .join(",")
}

/// Verify the operator still owns a resource before force-applying.
///
/// A resource labelled as managed by another controller is rejected so it
/// is never silently taken over. A resource without the label is accepted.
pub fn verify_ownership<K: Resource>(existing: &K) -> Result<()> {
    let labels = existing.meta().labels.as_ref();
    let managed_by = labels.and_then(|l| l.get(LABEL_MANAGED_BY));
    match managed_by {
        Some(manager) if manager != MANAGER_NAME => {
            let name = existing.meta().name.as_deref().unwrap_or("<unknown>");
            Err(OperatorError::InvalidConfig(format!(
                "resource '{}' is managed by '{}', not {}; \
                 refusing to force-apply to avoid ownership conflict",
                name, manager, MANAGER_NAME
            )))
        }
        _ => Ok(()),
    }
}

fn object_name<K: Resource>(obj: &K, what: &str) -> Result<String> {
    obj.meta()
        .name
        .clone()
        .ok_or_else(|| OperatorError::InvalidConfig(format!("{} missing metadata.name", what)))
}

/// [`ResourceStore`] backed by the Kubernetes API
#[derive(Clone)]
pub struct KubeResourceStore {
    client: Client,
}

impl KubeResourceStore {
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    fn api<K>(&self, namespace: &str) -> Api<K>
    where
        K: Resource<Scope = k8s_openapi::NamespaceResourceScope>,
        <K as Resource>::DynamicType: Default,
    {
        Api::namespaced(self.client.clone(), namespace)
    }
}

#[async_trait]
impl ResourceStore for KubeResourceStore {
    async fn get_statefulset(&self, namespace: &str, name: &str) -> Result<Option<StatefulSet>> {
        self.api::<StatefulSet>(namespace)
            .get_opt(name)
            .await
            .map_err(|e| from_kube(e, &format!("statefulset/{}", name)))
    }

    async fn create_statefulset(&self, namespace: &str, sts: &StatefulSet) -> Result<StatefulSet> {
        let name = object_name(sts, "StatefulSet")?;
        debug!(name = %name, "Creating StatefulSet");
        self.api::<StatefulSet>(namespace)
            .create(&PostParams::default(), sts)
            .await
            .map_err(|e| from_kube(e, &format!("statefulset/{}", name)))
    }

    async fn replace_statefulset(&self, namespace: &str, sts: &StatefulSet) -> Result<StatefulSet> {
        let name = object_name(sts, "StatefulSet")?;
        debug!(name = %name, "Replacing StatefulSet");
        self.api::<StatefulSet>(namespace)
            .replace(&name, &PostParams::default(), sts)
            .await
            .map_err(|e| from_kube(e, &format!("statefulset/{}", name)))
    }

    async fn list_replicasets(
        &self,
        namespace: &str,
        labels: &BTreeMap<String, String>,
    ) -> Result<Vec<ReplicaSet>> {
        let lp = ListParams::default().labels(&label_selector(labels));
        let list = self.api::<ReplicaSet>(namespace).list(&lp).await?;
        Ok(list.items)
    }

    async fn create_replicaset(&self, namespace: &str, rs: &ReplicaSet) -> Result<ReplicaSet> {
        let name = object_name(rs, "ReplicaSet")?;
        debug!(name = %name, "Creating ReplicaSet");
        self.api::<ReplicaSet>(namespace)
            .create(&PostParams::default(), rs)
            .await
            .map_err(|e| from_kube(e, &format!("replicaset/{}", name)))
    }

    async fn replace_replicaset(&self, namespace: &str, rs: &ReplicaSet) -> Result<ReplicaSet> {
        let name = object_name(rs, "ReplicaSet")?;
        debug!(name = %name, "Replacing ReplicaSet");
        self.api::<ReplicaSet>(namespace)
            .replace(&name, &PostParams::default(), rs)
            .await
            .map_err(|e| from_kube(e, &format!("replicaset/{}", name)))
    }

    async fn list_pods(
        &self,
        namespace: &str,
        labels: &BTreeMap<String, String>,
    ) -> Result<Vec<Pod>> {
        let lp = ListParams::default().labels(&label_selector(labels));
        let list = self.api::<Pod>(namespace).list(&lp).await?;
        Ok(list.items)
    }

    async fn annotate_pod(
        &self,
        namespace: &str,
        name: &str,
        key: &str,
        value: &str,
    ) -> Result<()> {
        let mut annotations = serde_json::Map::new();
        annotations.insert(key.to_string(), serde_json::Value::from(value));
        let patch = serde_json::json!({
            "metadata": { "annotations": annotations }
        });
        self.api::<Pod>(namespace)
            .patch(name, &PatchParams::default(), &Patch::Merge(&patch))
            .await
            .map_err(|e| from_kube(e, &format!("pod/{}", name)))?;
        Ok(())
    }

    async fn list_events(&self, namespace: &str, kind: &str, name: &str) -> Result<Vec<Event>> {
        let lp = ListParams::default().fields(&format!(
            "involvedObject.kind={},involvedObject.name={}",
            kind, name
        ));
        let list = self.api::<Event>(namespace).list(&lp).await?;
        Ok(list.items)
    }

    async fn replace_cluster_status(&self, cluster: &Emqx) -> Result<Emqx> {
        let name = cluster.name_any();
        let api: Api<Emqx> = self.api(&cluster.namespace_or_default());
        let data = serde_json::to_vec(cluster)?;
        api.replace_status(&name, &PostParams::default(), data)
            .await
            .map_err(|e| from_kube(e, &format!("emqx/{} status", name)))
    }

    async fn apply_service(&self, namespace: &str, svc: &Service) -> Result<()> {
        let api: Api<Service> = self.api(namespace);
        let name = object_name(svc, "Service")?;

        debug!(name = %name, "Applying Service");

        if let Some(existing) = api.get_opt(&name).await? {
            verify_ownership(&existing)?;
        }

        let patch_params = PatchParams::apply(MANAGER_NAME).force();
        api.patch(&name, &patch_params, &Patch::Apply(svc))
            .await
            .map_err(OperatorError::from)?;

        Ok(())
    }

    async fn apply_configmap(&self, namespace: &str, cm: &ConfigMap) -> Result<()> {
        let api: Api<ConfigMap> = self.api(namespace);
        let name = object_name(cm, "ConfigMap")?;

        debug!(name = %name, "Applying ConfigMap");

        if let Some(existing) = api.get_opt(&name).await? {
            verify_ownership(&existing)?;
        }

        let patch_params = PatchParams::apply(MANAGER_NAME).force();
        api.patch(&name, &patch_params, &Patch::Apply(cm))
            .await
            .map_err(OperatorError::from)?;

        Ok(())
    }

    async fn get_secret(&self, namespace: &str, name: &str) -> Result<Option<Secret>> {
        Ok(self.api::<Secret>(namespace).get_opt(name).await?)
    }

    async fn create_secret(&self, namespace: &str, secret: &Secret) -> Result<()> {
        let name = object_name(secret, "Secret")?;
        match self
            .api::<Secret>(namespace)
            .create(&PostParams::default(), secret)
            .await
        {
            Ok(_) => Ok(()),
            Err(kube::Error::Api(ae)) if ae.code == 409 => {
                debug!(name = %name, "Secret already exists");
                Ok(())
            }
            Err(e) => Err(OperatorError::from(e)),
        }
    }
}
