//! Cluster status
//!
//! Folds the observed workloads and the broker's node listing into the
//! condition list of the EMQX object, then writes the status subresource.
//! Conditions are evaluated in a fixed order: core readiness, core
//! progress, replicant readiness, replicant progress, overall readiness.

use crate::controller::{ReconcilePass, SubReconciler, SubResult};
use crate::core_nodes::{revision_of, statefulset_replicas};
use crate::crd::{condition_types, Condition, Emqx, EmqxStatus, POD_TEMPLATE_HASH_LABEL};
use crate::error::{OperatorError, Result, TRANSIENT_REQUEUE_DELAY};
use crate::events::{actions, reasons, EventPublisher};
use crate::requester::get_node_statuses;
use crate::store::ResourceStore;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use k8s_openapi::api::apps::v1::{ReplicaSet, StatefulSet};
use kube::runtime::events::EventType;
use kube::{Resource, ResourceExt};
use std::sync::Arc;
use tracing::{debug, instrument, warn};

/// Whether the core StatefulSet has fully rolled out the current revision
pub fn core_nodes_ready(cluster: &Emqx, sts: Option<&StatefulSet>) -> bool {
    let Some(sts) = sts else {
        return false;
    };
    let current = cluster
        .status
        .as_ref()
        .map(|s| s.core_nodes_status.current_revision.as_str())
        .unwrap_or_default();
    if current.is_empty() || revision_of(sts) != Some(current) {
        return false;
    }

    let desired = cluster.spec.core_template.spec.replicas;
    let Some(observed) = sts.status.as_ref() else {
        return false;
    };
    observed.observed_generation.unwrap_or(0) >= sts.metadata.generation.unwrap_or(0)
        && statefulset_replicas(sts) == desired
        && observed.replicas == desired
        && observed.ready_replicas.unwrap_or(0) == desired
        && observed.current_revision == observed.update_revision
}

/// Whether the current replicant ReplicaSet has every replica ready
pub fn replicant_nodes_ready(cluster: &Emqx, rs: Option<&ReplicaSet>) -> bool {
    let Some(rs) = rs else {
        return false;
    };
    let current = cluster
        .status
        .as_ref()
        .and_then(|s| s.replicant_nodes_status.as_ref())
        .map(|s| s.current_revision.as_str())
        .unwrap_or_default();
    if current.is_empty() || revision_of(rs) != Some(current) {
        return false;
    }

    let desired = cluster.desired_replicants();
    let Some(observed) = rs.status.as_ref() else {
        return false;
    };
    observed.observed_generation.unwrap_or(0) >= rs.metadata.generation.unwrap_or(0)
        && rs.spec.as_ref().and_then(|s| s.replicas).unwrap_or(0) == desired
        && observed.replicas == desired
        && observed.ready_replicas.unwrap_or(0) == desired
}

fn set_ready(status: &mut EmqxStatus, condition_type: &str, ready: bool, reason: &str, now: DateTime<Utc>) {
    let message = if ready {
        format!("{} is true", condition_type)
    } else {
        format!("{} is false", condition_type)
    };
    status.set_condition(Condition::new(condition_type, ready, reason, message, now));
}

/// Record progress; a progressing condition set earlier in the pass keeps its reason
fn set_progressing(status: &mut EmqxStatus, condition_type: &str, progressing: bool, now: DateTime<Utc>) {
    if progressing && status.is_condition_true(condition_type) {
        return;
    }
    let (reason, message) = if progressing {
        ("RollingOut", "Waiting for pods of the current revision")
    } else {
        ("RolloutComplete", "All pods run the current revision")
    };
    status.set_condition(Condition::new(condition_type, progressing, reason, message, now));
}

/// Advance the condition state machine.
///
/// Conditions of the replicant group are dropped when no replicant template
/// is configured. `Ready` requires every configured group to be ready and
/// the broker API to have answered in this pass.
pub fn advance(
    cluster: &mut Emqx,
    observed_core: Option<&StatefulSet>,
    observed_replicant: Option<&ReplicaSet>,
    api_ok: bool,
    now: DateTime<Utc>,
) {
    let core_ready = core_nodes_ready(cluster, observed_core);
    let has_replicants = cluster.spec.replicant_template.is_some();
    let replicants_ready = has_replicants && replicant_nodes_ready(cluster, observed_replicant);

    let status = cluster.status.get_or_insert_with(Default::default);

    set_ready(
        status,
        condition_types::CORE_NODES_READY,
        core_ready,
        if core_ready { "CoreNodesReady" } else { "CoreNodesNotReady" },
        now,
    );
    set_progressing(status, condition_types::CORE_NODES_PROGRESSING, !core_ready, now);

    if has_replicants {
        set_ready(
            status,
            condition_types::REPLICANT_NODES_READY,
            replicants_ready,
            if replicants_ready {
                "ReplicantNodesReady"
            } else {
                "ReplicantNodesNotReady"
            },
            now,
        );
        set_progressing(
            status,
            condition_types::REPLICANT_NODES_PROGRESSING,
            !replicants_ready,
            now,
        );
    } else {
        status.remove_condition(condition_types::REPLICANT_NODES_READY);
        status.remove_condition(condition_types::REPLICANT_NODES_PROGRESSING);
    }

    let groups_ready = core_ready && (!has_replicants || replicants_ready);
    let (ready, reason) = match (groups_ready, api_ok) {
        (true, true) => (true, "ClusterReady"),
        (true, false) => (false, "BrokerApiUnavailable"),
        (false, _) => (false, "NodesNotReady"),
    };
    set_ready(status, condition_types::READY, ready, reason, now);
}

/// Computes and persists the status subresource
pub struct StatusReconciler {
    store: Arc<dyn ResourceStore>,
    events: Arc<dyn EventPublisher>,
}

impl StatusReconciler {
    pub fn new(store: Arc<dyn ResourceStore>, events: Arc<dyn EventPublisher>) -> Self {
        Self { store, events }
    }

    async fn warn_event(&self, cluster: &Emqx, reason: &str, note: String) {
        self.events
            .publish(
                &cluster.object_ref(&()),
                EventType::Warning,
                reason,
                actions::RECONCILE,
                Some(note),
            )
            .await;
    }

    /// Workloads to judge readiness on when the earlier steps did not observe them
    async fn observe(&self, cluster: &Emqx, pass: &ReconcilePass<'_>) -> Result<(Option<StatefulSet>, Option<ReplicaSet>)> {
        let namespace = cluster.namespace_or_default();

        let core = match &pass.observed_core {
            Some(sts) => Some(sts.clone()),
            None => self.store.get_statefulset(&namespace, &cluster.core_name()).await?,
        };

        let current = cluster
            .status
            .as_ref()
            .and_then(|s| s.replicant_nodes_status.as_ref())
            .map(|s| s.current_revision.clone())
            .unwrap_or_default();
        let replicant = match &pass.observed_replicant {
            Some(rs) => Some(rs.clone()),
            None if cluster.spec.replicant_template.is_some() && !current.is_empty() => {
                let mut labels = cluster.replicant_selector_labels();
                labels.insert(POD_TEMPLATE_HASH_LABEL.to_string(), current);
                self.store
                    .list_replicasets(&namespace, &labels)
                    .await?
                    .into_iter()
                    .next()
            }
            None => None,
        };

        Ok((core, replicant))
    }

    async fn apply(&self, cluster: &mut Emqx, pass: &mut ReconcilePass<'_>) -> Result<SubResult> {
        let core_replicas = cluster.spec.core_template.spec.replicas;
        let replicant_replicas = cluster
            .spec
            .replicant_template
            .as_ref()
            .map(|t| t.spec.replicas);
        {
            let status = cluster.status.get_or_insert_with(Default::default);
            status.core_nodes_status.replicas = core_replicas;
            match replicant_replicas {
                Some(replicas) => {
                    status
                        .replicant_nodes_status
                        .get_or_insert_with(Default::default)
                        .replicas = replicas;
                }
                None => status.replicant_nodes_status = None,
            }
        }

        let api_ok = match pass.requester {
            Some(requester) => match get_node_statuses(requester).await {
                Ok(nodes) => {
                    debug!(nodes = nodes.len(), "Fetched node statuses");
                    cluster
                        .status
                        .get_or_insert_with(Default::default)
                        .set_nodes(nodes);
                    true
                }
                Err(e) => {
                    warn!(error = %e, "Failed to get node statuses");
                    self.warn_event(cluster, reasons::FAILED_TO_GET_NODE_STATUSES, e.to_string())
                        .await;
                    false
                }
            },
            None => {
                self.warn_event(
                    cluster,
                    reasons::FAILED_TO_GET_NODE_STATUSES,
                    "no ready core pod serves the broker API".to_string(),
                )
                .await;
                false
            }
        };

        let (core, replicant) = self.observe(cluster, pass).await?;
        advance(cluster, core.as_ref(), replicant.as_ref(), api_ok, pass.now);

        match self.store.replace_cluster_status(cluster).await {
            Ok(written) => {
                debug!(
                    phase = cluster.status.as_ref().and_then(|s| s.phase()).unwrap_or("Unknown"),
                    "Status written"
                );
                cluster.metadata.resource_version = written.metadata.resource_version;
                Ok(SubResult::Continue)
            }
            Err(OperatorError::Conflict(what)) => {
                warn!(%what, "Status changed concurrently, requeueing");
                self.warn_event(cluster, reasons::STATUS_UPDATE_CONFLICT, format!("conflict writing {}", what))
                    .await;
                Ok(SubResult::Requeue(TRANSIENT_REQUEUE_DELAY))
            }
            Err(e) => Err(e),
        }
    }
}

#[async_trait]
impl SubReconciler for StatusReconciler {
    fn name(&self) -> &'static str {
        "status"
    }

    #[instrument(skip_all, fields(name = %cluster.name_any()))]
    async fn reconcile(&self, cluster: &mut Emqx, pass: &mut ReconcilePass<'_>) -> SubResult {
        match self.apply(cluster, pass).await {
            Ok(result) => result,
            Err(e) => SubResult::from_result(Err(e.context("failed to update status"))),
        }
    }
}
