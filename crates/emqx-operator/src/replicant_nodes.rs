//! Replicant node group
//!
//! Replicants run as one ReplicaSet per pod-template revision. A template
//! change creates a new ReplicaSet next to the old ones; the old ones are
//! then drained one pod per pass, oldest first, following the evacuation
//! policy.

use crate::controller::{ReconcilePass, SubReconciler, SubResult};
use crate::core_nodes::revision_of;
use crate::crd::{condition_types, Condition, Emqx};
use crate::error::{OperatorError, Result, TRANSIENT_REQUEUE_DELAY};
use crate::evacuation::select_removable_pod;
use crate::events::{actions, reasons, EventPublisher};
use crate::hash::compute_hash;
use crate::patch::{calculate, set_last_applied, update_last_applied, CalculateOption};
use crate::resources::ResourceBuilder;
use crate::store::ResourceStore;
use async_trait::async_trait;
use k8s_openapi::api::apps::v1::ReplicaSet;
use k8s_openapi::api::core::v1::PodTemplateSpec;
use kube::runtime::events::EventType;
use kube::{Resource, ResourceExt};
use std::sync::Arc;
use tracing::{debug, info, instrument, warn};

/// Upper bound on revision name collisions resolved in one pass
pub const MAX_COLLISION_RETRIES: u32 = 8;

/// Annotation the ReplicaSet controller uses to rank pods for deletion
pub const POD_DELETION_COST_ANNOTATION: &str = "controller.kubernetes.io/pod-deletion-cost";

/// Deletion cost marking the pod chosen for removal
pub const POD_DELETION_COST: &str = "-99999";

/// What to do with the desired replicant revision
#[derive(Debug)]
enum Candidate {
    /// A ReplicaSet with the same pod template already exists
    Adopt { desired: ReplicaSet, stored: ReplicaSet },
    /// A new ReplicaSet has to be created
    Create(ReplicaSet),
}

fn replicas_of(rs: &ReplicaSet) -> i32 {
    rs.spec.as_ref().and_then(|s| s.replicas).unwrap_or(0)
}

fn same_pod_template(stored: &ReplicaSet, desired: &ReplicaSet) -> Result<bool> {
    Ok(calculate(stored, desired, &[CalculateOption::PodTemplateOnly])?.is_empty())
}

/// Pick the ReplicaSet to target for `template`.
///
/// An existing ReplicaSet with an identical pod spec is adopted, preferring
/// the current revision. Otherwise the revision hash is recomputed with an
/// increasing collision count until its name is free.
fn resolve_candidate(
    builder: &ResourceBuilder<'_>,
    base_name: &str,
    template: &PodTemplateSpec,
    existing: &[ReplicaSet],
    current_revision: &str,
    collision_count: &mut Option<i32>,
) -> Result<Candidate> {
    let mut probe = builder.build_replicaset(template.clone(), "")?;

    let mut matching = Vec::new();
    for rs in existing {
        if same_pod_template(rs, &probe)? {
            matching.push(rs);
        }
    }
    matching.sort_by_key(|rs| {
        (
            revision_of(*rs) != Some(current_revision),
            std::cmp::Reverse(rs.creation_timestamp()),
        )
    });
    if let Some(stored) = matching.first() {
        let stored = (*stored).clone();
        probe.metadata = stored.metadata.clone();
        if let (Some(spec), Some(stored_spec)) = (probe.spec.as_mut(), stored.spec.as_ref()) {
            spec.selector = stored_spec.selector.clone();
            if let (Some(t), Some(stored_t)) = (spec.template.as_mut(), stored_spec.template.as_ref()) {
                t.metadata = stored_t.metadata.clone();
            }
        }
        set_last_applied(&mut probe)?;
        return Ok(Candidate::Adopt {
            desired: probe,
            stored,
        });
    }

    let mut attempts = 0;
    loop {
        let hash = compute_hash(template, *collision_count)?;
        let name = format!("{}-{}", base_name, hash);
        if !existing.iter().any(|rs| rs.name_any() == name) {
            return Ok(Candidate::Create(
                builder.build_replicaset(template.clone(), &hash)?,
            ));
        }

        attempts += 1;
        warn!(replicaset = %name, collision_count = ?collision_count, "Revision name collision");
        if attempts >= MAX_COLLISION_RETRIES {
            return Err(OperatorError::CollisionRetriesExhausted {
                name: base_name.to_string(),
                attempts,
            });
        }
        *collision_count = Some(collision_count.unwrap_or(0) + 1);
    }
}

/// Oldest ReplicaSet of a superseded revision that still has replicas
fn oldest_draining(replicasets: Vec<ReplicaSet>, current_revision: &str) -> Option<ReplicaSet> {
    replicasets
        .into_iter()
        .filter(|rs| revision_of(rs).is_some_and(|r| r != current_revision))
        .filter(|rs| replicas_of(rs) > 0)
        .min_by(|a, b| {
            a.creation_timestamp()
                .cmp(&b.creation_timestamp())
                .then_with(|| a.name_any().cmp(&b.name_any()))
        })
}

/// Creates the current replicant ReplicaSet and drains superseded ones
pub struct ReplicantReconciler {
    store: Arc<dyn ResourceStore>,
    events: Arc<dyn EventPublisher>,
    scale_downs: Option<metrics::Counter>,
}

impl ReplicantReconciler {
    pub fn new(
        store: Arc<dyn ResourceStore>,
        events: Arc<dyn EventPublisher>,
        scale_downs: Option<metrics::Counter>,
    ) -> Self {
        Self {
            store,
            events,
            scale_downs,
        }
    }

    async fn apply(&self, cluster: &mut Emqx, pass: &mut ReconcilePass<'_>) -> Result<SubResult> {
        if cluster.spec.replicant_template.is_none() {
            return Ok(SubResult::Continue);
        }
        if !cluster
            .status
            .as_ref()
            .is_some_and(|s| s.is_condition_true(condition_types::CORE_NODES_READY))
        {
            debug!("Core nodes not ready, deferring replicants");
            return Ok(SubResult::Continue);
        }

        let namespace = cluster.namespace_or_default();
        let existing = self
            .store
            .list_replicasets(&namespace, &cluster.replicant_selector_labels())
            .await?;

        let status = cluster.status_or_default();
        let repl_status = status.replicant_nodes_status.unwrap_or_default();
        let mut collision_count = repl_status.collision_count;

        let candidate = {
            let builder = ResourceBuilder::new(cluster)?;
            let template = builder.build_replicant_pod_template()?;
            resolve_candidate(
                &builder,
                &cluster.replicant_name(),
                &template,
                &existing,
                &repl_status.current_revision,
                &mut collision_count,
            )?
        };

        let (observed, progressing) = match candidate {
            Candidate::Adopt { mut desired, stored } => {
                let patch = calculate(&stored, &desired, &[CalculateOption::IgnoreStatusFields])?;
                if patch.is_empty() {
                    (stored, None)
                } else {
                    debug!(patch = %patch.patch, "Replicant ReplicaSet changed");
                    info!(replicaset = %stored.name_any(), "Updating replicant ReplicaSet");
                    desired.metadata.resource_version = stored.metadata.resource_version.clone();
                    let replaced = self.store.replace_replicaset(&namespace, &desired).await?;
                    (replaced, Some(("UpdateReplicaSet", "Updating replicant replicaSet")))
                }
            }
            Candidate::Create(desired) => {
                info!(replicaset = %desired.name_any(), "Creating replicant ReplicaSet");
                match self.store.create_replicaset(&namespace, &desired).await {
                    Ok(created) => (created, Some(("CreateNewReplicaSet", "Creating new replicaSet"))),
                    Err(OperatorError::AlreadyExists(what)) => {
                        warn!(%what, "Replicant ReplicaSet created concurrently, bumping collision count");
                        let repl = cluster
                            .status
                            .get_or_insert_with(Default::default)
                            .replicant_nodes_status
                            .get_or_insert_with(Default::default);
                        repl.collision_count = Some(collision_count.unwrap_or(0) + 1);
                        let written = self.store.replace_cluster_status(cluster).await?;
                        cluster.metadata.resource_version = written.metadata.resource_version;
                        return Ok(SubResult::Requeue(TRANSIENT_REQUEUE_DELAY));
                    }
                    Err(e) => return Err(e),
                }
            }
        };

        let revision = revision_of(&observed).unwrap_or_default().to_string();
        let repl = cluster
            .status
            .get_or_insert_with(Default::default)
            .replicant_nodes_status
            .get_or_insert_with(Default::default);
        repl.collision_count = collision_count;
        repl.current_revision = revision.clone();
        if let Some((reason, message)) = progressing {
            cluster.status.get_or_insert_with(Default::default).set_condition(Condition::new(
                condition_types::REPLICANT_NODES_PROGRESSING,
                true,
                reason,
                message,
                pass.now,
            ));
        }
        pass.observed_replicant = Some(observed);

        self.drain_one(cluster, &revision, pass).await?;
        Ok(SubResult::Continue)
    }

    /// Remove at most one pod from the oldest superseded ReplicaSet
    async fn drain_one(&self, cluster: &Emqx, current_revision: &str, pass: &ReconcilePass<'_>) -> Result<()> {
        let namespace = cluster.namespace_or_default();
        let replicasets = self
            .store
            .list_replicasets(&namespace, &cluster.replicant_selector_labels())
            .await?;
        let Some(mut oldest) = oldest_draining(replicasets, current_revision) else {
            return Ok(());
        };
        let name = oldest.name_any();

        let selector = oldest
            .spec
            .as_ref()
            .and_then(|s| s.selector.match_labels.clone())
            .unwrap_or_default();
        let pods = self.store.list_pods(&namespace, &selector).await?;
        let events = self.store.list_events(&namespace, "ReplicaSet", &name).await?;

        let Some(pod) = select_removable_pod(cluster, &pods, &events, pass.now) else {
            debug!(replicaset = %name, "No replicant pod can be removed yet");
            return Ok(());
        };

        self.store
            .annotate_pod(&namespace, &pod.name_any(), POD_DELETION_COST_ANNOTATION, POD_DELETION_COST)
            .await?;

        let spec_replicas = replicas_of(&oldest);
        let live_replicas = oldest
            .status
            .as_ref()
            .map(|s| s.replicas)
            .unwrap_or(spec_replicas);
        let target = (spec_replicas.min(live_replicas) - 1).max(0);
        if let Some(spec) = oldest.spec.as_mut() {
            spec.replicas = Some(target);
        }
        update_last_applied(&mut oldest, "/spec/replicas", serde_json::json!(target))?;
        self.store.replace_replicaset(&namespace, &oldest).await?;

        if let Some(counter) = &self.scale_downs {
            counter.increment(1);
        }
        self.events
            .publish(
                &cluster.object_ref(&()),
                EventType::Normal,
                reasons::SCALE_DOWN_REPLICANT,
                actions::SCALE,
                Some(format!("Scaling {} down to {}, removing pod {}", name, target, pod.name_any())),
            )
            .await;
        info!(
            replicaset = %name,
            pod = %pod.name_any(),
            replicas = target,
            "Scaled down superseded replicant ReplicaSet"
        );
        Ok(())
    }
}

#[async_trait]
impl SubReconciler for ReplicantReconciler {
    fn name(&self) -> &'static str {
        "replicant"
    }

    #[instrument(skip_all, fields(name = %cluster.name_any()))]
    async fn reconcile(&self, cluster: &mut Emqx, pass: &mut ReconcilePass<'_>) -> SubResult {
        match self.apply(cluster, pass).await {
            Ok(result) => result,
            Err(e) => SubResult::from_result(Err(e.context("failed to reconcile replicants"))),
        }
    }
}
