//! Core node group
//!
//! Core nodes run as a single StatefulSet updated in place. The revision hash
//! of its pod template is carried as a label on the StatefulSet and mirrored
//! into `status.coreNodesStatus.currentRevision`.

use crate::controller::{ReconcilePass, SubReconciler, SubResult};
use crate::crd::{condition_types, Condition, Emqx, POD_TEMPLATE_HASH_LABEL};
use crate::error::Result;
use crate::patch::{calculate, CalculateOption};
use crate::resources::ResourceBuilder;
use crate::store::ResourceStore;
use async_trait::async_trait;
use k8s_openapi::api::apps::v1::StatefulSet;
use kube::ResourceExt;
use std::sync::Arc;
use tracing::{debug, info, instrument};

/// Revision hash label of a workload
pub fn revision_of<K: kube::Resource>(obj: &K) -> Option<&str> {
    obj.meta()
        .labels
        .as_ref()
        .and_then(|l| l.get(POD_TEMPLATE_HASH_LABEL))
        .map(String::as_str)
}

/// Creates or updates the core StatefulSet
pub struct CoreReconciler {
    store: Arc<dyn ResourceStore>,
}

impl CoreReconciler {
    pub fn new(store: Arc<dyn ResourceStore>) -> Self {
        Self { store }
    }

    async fn apply(&self, cluster: &mut Emqx, pass: &mut ReconcilePass<'_>) -> Result<()> {
        let namespace = cluster.namespace_or_default();
        let name = cluster.core_name();
        let mut desired = ResourceBuilder::new(cluster)?.build_core_statefulset()?;
        let revision = revision_of(&desired).unwrap_or_default().to_string();

        let progressing = match self.store.get_statefulset(&namespace, &name).await? {
            None => {
                info!(statefulset = %name, revision = %revision, "Creating core StatefulSet");
                let created = self.store.create_statefulset(&namespace, &desired).await?;
                pass.observed_core = Some(created);
                Some(("CreateCoreStatefulSet", "Creating core statefulSet"))
            }
            Some(stored) => {
                let patch = calculate(
                    &stored,
                    &desired,
                    &[
                        CalculateOption::IgnoreStatusFields,
                        CalculateOption::IgnoreVolumeClaimTemplateTypeMetaAndStatus,
                    ],
                )?;
                if patch.is_empty() {
                    pass.observed_core = Some(stored);
                    None
                } else {
                    debug!(patch = %patch.patch, "Core StatefulSet changed");
                    info!(statefulset = %name, revision = %revision, "Updating core StatefulSet");
                    // selector and volumeClaimTemplates are immutable once created
                    if let (Some(spec), Some(stored_spec)) = (desired.spec.as_mut(), stored.spec.as_ref()) {
                        spec.selector = stored_spec.selector.clone();
                        spec.volume_claim_templates = stored_spec.volume_claim_templates.clone();
                    }
                    desired.metadata.resource_version = stored.metadata.resource_version.clone();
                    let replaced = self.store.replace_statefulset(&namespace, &desired).await?;
                    pass.observed_core = Some(replaced);
                    Some(("UpdateCoreStatefulSet", "Updating core statefulSet"))
                }
            }
        };

        let status = cluster.status.get_or_insert_with(Default::default);
        if let Some((reason, message)) = progressing {
            status.set_condition(Condition::new(
                condition_types::CORE_NODES_PROGRESSING,
                true,
                reason,
                message,
                pass.now,
            ));
        }
        status.core_nodes_status.current_revision = revision;
        Ok(())
    }
}

#[async_trait]
impl SubReconciler for CoreReconciler {
    fn name(&self) -> &'static str {
        "core"
    }

    #[instrument(skip_all, fields(name = %cluster.name_any()))]
    async fn reconcile(&self, cluster: &mut Emqx, pass: &mut ReconcilePass<'_>) -> SubResult {
        SubResult::from_result(
            self.apply(cluster, pass)
                .await
                .map_err(|e| e.context("failed to reconcile core StatefulSet")),
        )
    }
}

/// Replica count requested by a StatefulSet's spec
pub fn statefulset_replicas(sts: &StatefulSet) -> i32 {
    sts.spec.as_ref().and_then(|s| s.replicas).unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::TRANSIENT_REQUEUE_DELAY;
    use crate::testing::{at, sample_cluster, InMemoryStore};
    use k8s_openapi::api::core::v1::PersistentVolumeClaimSpec;
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::LabelSelector;
    use std::collections::BTreeMap;

    fn reconciler() -> (Arc<InMemoryStore>, CoreReconciler) {
        let store = Arc::new(InMemoryStore::new());
        (store.clone(), CoreReconciler::new(store))
    }

    #[tokio::test]
    async fn test_creates_statefulset() {
        let (store, reconciler) = reconciler();
        let mut cluster = sample_cluster("emqx");
        let mut pass = ReconcilePass::new(None, at(0));

        let result = reconciler.reconcile(&mut cluster, &mut pass).await;
        assert!(matches!(result, SubResult::Continue));

        let sts = store.statefulset("emqx-core").unwrap();
        let revision = revision_of(&sts).unwrap().to_string();
        let status = cluster.status.as_ref().unwrap();
        assert_eq!(status.core_nodes_status.current_revision, revision);

        let progressing = status
            .get_condition(condition_types::CORE_NODES_PROGRESSING)
            .unwrap();
        assert!(progressing.is_true());
        assert_eq!(progressing.reason, "CreateCoreStatefulSet");
        assert_eq!(pass.observed_core.as_ref().map(|s| s.name_any()), Some(sts.name_any()));
    }

    #[tokio::test]
    async fn test_unchanged_statefulset_is_not_rewritten() {
        let (store, reconciler) = reconciler();
        let mut cluster = sample_cluster("emqx");

        reconciler
            .reconcile(&mut cluster, &mut ReconcilePass::new(None, at(0)))
            .await;
        let mut fresh = sample_cluster("emqx");
        let mut pass = ReconcilePass::new(None, at(10));
        reconciler.reconcile(&mut fresh, &mut pass).await;

        assert_eq!(store.statefulset_replaces(), 0);
        assert!(pass.observed_core.is_some());
        assert!(fresh
            .status
            .as_ref()
            .unwrap()
            .get_condition(condition_types::CORE_NODES_PROGRESSING)
            .is_none());
    }

    #[tokio::test]
    async fn test_template_change_updates_in_place() {
        let (store, reconciler) = reconciler();
        let mut cluster = sample_cluster("emqx");
        reconciler
            .reconcile(&mut cluster, &mut ReconcilePass::new(None, at(0)))
            .await;
        let before = store.statefulset("emqx-core").unwrap();

        cluster.spec.image = "emqx:5.2".to_string();
        let mut pass = ReconcilePass::new(None, at(10));
        let result = reconciler.reconcile(&mut cluster, &mut pass).await;
        assert!(matches!(result, SubResult::Continue));

        assert_eq!(store.statefulset_replaces(), 1);
        let after = store.statefulset("emqx-core").unwrap();
        assert_ne!(revision_of(&before), revision_of(&after));
        assert_eq!(
            cluster.status.as_ref().unwrap().core_nodes_status.current_revision,
            revision_of(&after).unwrap()
        );
        let progressing = cluster
            .status
            .as_ref()
            .unwrap()
            .get_condition(condition_types::CORE_NODES_PROGRESSING)
            .unwrap();
        assert_eq!(progressing.reason, "UpdateCoreStatefulSet");
    }

    #[tokio::test]
    async fn test_scaling_keeps_revision() {
        let (store, reconciler) = reconciler();
        let mut cluster = sample_cluster("emqx");
        reconciler
            .reconcile(&mut cluster, &mut ReconcilePass::new(None, at(0)))
            .await;
        let before = store.statefulset("emqx-core").unwrap();

        cluster.spec.core_template.spec.replicas = 3;
        reconciler
            .reconcile(&mut cluster, &mut ReconcilePass::new(None, at(10)))
            .await;
        let after = store.statefulset("emqx-core").unwrap();

        assert_eq!(statefulset_replicas(&after), 3);
        assert_eq!(revision_of(&before), revision_of(&after));
    }

    #[tokio::test]
    async fn test_immutable_selector_is_preserved() {
        let (store, reconciler) = reconciler();
        let mut cluster = sample_cluster("emqx");
        reconciler
            .reconcile(&mut cluster, &mut ReconcilePass::new(None, at(0)))
            .await;

        let mut stored = store.statefulset("emqx-core").unwrap();
        let mut legacy = BTreeMap::new();
        legacy.insert("legacy".to_string(), "selector".to_string());
        stored.spec.as_mut().unwrap().selector = LabelSelector {
            match_labels: Some(legacy.clone()),
            ..Default::default()
        };
        store.replace_statefulset("default", &stored).await.unwrap();

        cluster.spec.image = "emqx:5.2".to_string();
        reconciler
            .reconcile(&mut cluster, &mut ReconcilePass::new(None, at(10)))
            .await;
        let after = store.statefulset("emqx-core").unwrap();
        assert_eq!(after.spec.unwrap().selector.match_labels, Some(legacy));
    }

    #[tokio::test]
    async fn test_defaulted_claim_template_is_not_rewritten() {
        let (store, reconciler) = reconciler();
        let claim_cluster = || {
            let mut cluster = sample_cluster("emqx");
            cluster.spec.core_template.spec.volume_claim_templates =
                Some(PersistentVolumeClaimSpec::default());
            cluster
        };
        let mut cluster = claim_cluster();
        reconciler
            .reconcile(&mut cluster, &mut ReconcilePass::new(None, at(0)))
            .await;

        // the apiserver fills in defaults on stored claim templates
        let mut stored = store.statefulset("emqx-core").unwrap();
        let claims = stored.spec.as_mut().unwrap().volume_claim_templates.as_mut().unwrap();
        claims[0].spec.as_mut().unwrap().volume_mode = Some("Filesystem".to_string());
        store.replace_statefulset("default", &stored).await.unwrap();
        let replaces = store.statefulset_replaces();

        let mut fresh = claim_cluster();
        reconciler
            .reconcile(&mut fresh, &mut ReconcilePass::new(None, at(10)))
            .await;
        assert_eq!(store.statefulset_replaces(), replaces);
        assert!(fresh
            .status
            .as_ref()
            .unwrap()
            .get_condition(condition_types::CORE_NODES_PROGRESSING)
            .is_none());

        // a template change keeps the stored claim templates and settles
        fresh.spec.image = "emqx:5.2".to_string();
        reconciler
            .reconcile(&mut fresh, &mut ReconcilePass::new(None, at(20)))
            .await;
        assert_eq!(store.statefulset_replaces(), replaces + 1);
        let after = store.statefulset("emqx-core").unwrap();
        let claims = after.spec.unwrap().volume_claim_templates.unwrap();
        assert_eq!(claims[0].spec.as_ref().unwrap().volume_mode.as_deref(), Some("Filesystem"));

        reconciler
            .reconcile(&mut fresh, &mut ReconcilePass::new(None, at(30)))
            .await;
        assert_eq!(store.statefulset_replaces(), replaces + 1);
    }

    #[tokio::test]
    async fn test_conflict_requeues() {
        let (store, reconciler) = reconciler();
        let mut cluster = sample_cluster("emqx");
        reconciler
            .reconcile(&mut cluster, &mut ReconcilePass::new(None, at(0)))
            .await;

        cluster.spec.image = "emqx:5.2".to_string();
        store.fail_next_replace();
        let result = reconciler
            .reconcile(&mut cluster, &mut ReconcilePass::new(None, at(10)))
            .await;
        assert!(matches!(result, SubResult::Requeue(d) if d == TRANSIENT_REQUEUE_DELAY));
    }
}
