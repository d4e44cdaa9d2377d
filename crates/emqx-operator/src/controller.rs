//! EMQX Controller
//!
//! This module implements the Kubernetes controller pattern for EMQX custom
//! resources. Every pass runs an ordered pipeline of sub-reconcilers against
//! a working copy of the object: bootstrap objects, core StatefulSet,
//! replicant ReplicaSets, then status. The first step asking for a requeue
//! ends the pass.

use crate::bootstrap::BootstrapReconciler;
use crate::core_nodes::CoreReconciler;
use crate::crd::Emqx;
use crate::error::{OperatorError, Result};
use crate::events::{EventPublisher, KubeEventPublisher};
use crate::replicant_nodes::ReplicantReconciler;
use crate::requester::{build_requester, Requester, RequesterConfig};
use crate::status::StatusReconciler;
use crate::store::{KubeResourceStore, ResourceStore};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::StreamExt;
use k8s_openapi::api::apps::v1::{ReplicaSet, StatefulSet};
use k8s_openapi::api::core::v1::Service;
use kube::api::Api;
use kube::runtime::controller::{Action, Controller};
use kube::runtime::watcher::Config;
use kube::{Client, ResourceExt};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, instrument, warn};
use validator::Validate;

/// Name reported as the source of Kubernetes events
pub const CONTROLLER_NAME: &str = "emqx-operator";

/// Default requeue interval for successful reconciliations
pub const DEFAULT_REQUEUE_SECONDS: u64 = 30;

/// Requeue interval for error cases (base for exponential backoff)
const ERROR_REQUEUE_SECONDS: u64 = 30;

/// Maximum requeue delay for error backoff
const MAX_ERROR_REQUEUE_SECONDS: u64 = 600;

/// Outcome of one pipeline step
#[derive(Debug)]
pub enum SubResult {
    /// Proceed with the next step
    Continue,
    /// Stop the pass and come back after the delay
    Requeue(Duration),
    /// Stop the pass with an error
    Failed(OperatorError),
}

impl SubResult {
    /// Map a step result, turning transient errors into a short requeue
    pub fn from_result(result: Result<()>) -> Self {
        match result {
            Ok(()) => SubResult::Continue,
            Err(e) => match e.requeue_delay() {
                Some(delay) => {
                    debug!(error = %e, "Transient error, requeueing");
                    SubResult::Requeue(delay)
                }
                None => SubResult::Failed(e),
            },
        }
    }
}

/// State shared by the steps of a single pass
pub struct ReconcilePass<'a> {
    /// Admin API client, absent while no core pod is ready
    pub requester: Option<&'a dyn Requester>,
    /// Core StatefulSet as created, replaced or read in this pass
    pub observed_core: Option<StatefulSet>,
    /// Current replicant ReplicaSet as created, replaced or read in this pass
    pub observed_replicant: Option<ReplicaSet>,
    /// Clock reading used for every condition written in this pass
    pub now: DateTime<Utc>,
}

impl<'a> ReconcilePass<'a> {
    pub fn new(requester: Option<&'a dyn Requester>, now: DateTime<Utc>) -> Self {
        Self {
            requester,
            observed_core: None,
            observed_replicant: None,
            now,
        }
    }
}

/// One step of the reconcile pipeline
#[async_trait]
pub trait SubReconciler: Send + Sync {
    fn name(&self) -> &'static str;

    async fn reconcile(&self, cluster: &mut Emqx, pass: &mut ReconcilePass<'_>) -> SubResult;
}

/// Run `steps` in order.
///
/// Returns the requested requeue delay, if any step asked for one.
pub async fn run_pipeline(
    steps: &[Box<dyn SubReconciler>],
    cluster: &mut Emqx,
    pass: &mut ReconcilePass<'_>,
) -> Result<Option<Duration>> {
    for step in steps {
        match step.reconcile(cluster, pass).await {
            SubResult::Continue => {}
            SubResult::Requeue(delay) => {
                debug!(step = step.name(), delay_secs = delay.as_secs(), "Step requested requeue");
                return Ok(Some(delay));
            }
            SubResult::Failed(e) => {
                warn!(step = step.name(), error = %e, "Step failed");
                return Err(e);
            }
        }
    }
    Ok(None)
}

/// Operator settings
#[derive(Debug, Clone)]
pub struct OperatorConfig {
    /// Requeue interval after a successful pass
    pub requeue_interval: Duration,
    /// How to reach the broker admin API
    pub requester: RequesterConfig,
}

impl Default for OperatorConfig {
    fn default() -> Self {
        Self {
            requeue_interval: Duration::from_secs(DEFAULT_REQUEUE_SECONDS),
            requester: RequesterConfig::default(),
        }
    }
}

/// Context passed to the controller
pub struct ControllerContext {
    /// Kubernetes API access
    pub store: Arc<dyn ResourceStore>,
    /// Operator settings
    pub config: OperatorConfig,
    /// Metrics recorder (optional)
    pub metrics: Option<ControllerMetrics>,
    /// Per-cluster error retry counts for exponential backoff
    pub error_counts: dashmap::DashMap<String, u32>,
    /// Steps run on every pass, in order
    pub pipeline: Vec<Box<dyn SubReconciler>>,
}

impl ControllerContext {
    pub fn new(
        store: Arc<dyn ResourceStore>,
        events: Arc<dyn EventPublisher>,
        config: OperatorConfig,
        metrics: Option<ControllerMetrics>,
    ) -> Self {
        let scale_downs = metrics.as_ref().map(|m| m.scale_downs.clone());
        let pipeline: Vec<Box<dyn SubReconciler>> = vec![
            Box::new(BootstrapReconciler::new(store.clone())),
            Box::new(CoreReconciler::new(store.clone())),
            Box::new(ReplicantReconciler::new(store.clone(), events.clone(), scale_downs)),
            Box::new(StatusReconciler::new(store.clone(), events)),
        ];
        Self {
            store,
            config,
            metrics,
            error_counts: dashmap::DashMap::new(),
            pipeline,
        }
    }
}

/// Metrics for the controller
#[derive(Clone)]
pub struct ControllerMetrics {
    /// Counter for reconciliation attempts
    pub reconciliations: metrics::Counter,
    /// Counter for reconciliation errors
    pub errors: metrics::Counter,
    /// Histogram for reconciliation duration
    pub duration: metrics::Histogram,
    /// Counter for replicant pods removed from superseded revisions
    pub scale_downs: metrics::Counter,
}

impl ControllerMetrics {
    /// Create new controller metrics
    pub fn new() -> Self {
        Self {
            reconciliations: metrics::counter!("emqx_operator_reconciliations_total"),
            errors: metrics::counter!("emqx_operator_reconciliation_errors_total"),
            duration: metrics::histogram!("emqx_operator_reconciliation_duration_seconds"),
            scale_downs: metrics::counter!("emqx_operator_replicant_scale_down_total"),
        }
    }
}

impl Default for ControllerMetrics {
    fn default() -> Self {
        Self::new()
    }
}

/// Start the EMQX controller
pub async fn run_controller(
    client: Client,
    namespace: Option<String>,
    config: OperatorConfig,
) -> Result<()> {
    let clusters: Api<Emqx> = match &namespace {
        Some(ns) => Api::namespaced(client.clone(), ns),
        None => Api::all(client.clone()),
    };

    let store: Arc<dyn ResourceStore> = Arc::new(KubeResourceStore::new(client.clone()));
    let events: Arc<dyn EventPublisher> =
        Arc::new(KubeEventPublisher::new(client.clone(), CONTROLLER_NAME));
    let ctx = Arc::new(ControllerContext::new(
        store,
        events,
        config,
        Some(ControllerMetrics::new()),
    ));

    info!(
        namespace = namespace.as_deref().unwrap_or("all"),
        "Starting EMQX controller"
    );

    // Watch owned workloads so their status changes trigger a pass
    let statefulsets = match &namespace {
        Some(ns) => Api::<StatefulSet>::namespaced(client.clone(), ns),
        None => Api::<StatefulSet>::all(client.clone()),
    };

    let replicasets = match &namespace {
        Some(ns) => Api::<ReplicaSet>::namespaced(client.clone(), ns),
        None => Api::<ReplicaSet>::all(client.clone()),
    };

    let services = match &namespace {
        Some(ns) => Api::<Service>::namespaced(client.clone(), ns),
        None => Api::<Service>::all(client.clone()),
    };

    Controller::new(clusters, Config::default())
        .owns(statefulsets, Config::default())
        .owns(replicasets, Config::default())
        .owns(services, Config::default())
        .run(reconcile, error_policy, ctx)
        .for_each(|result| async move {
            match result {
                Ok((obj, action)) => {
                    debug!(
                        name = obj.name,
                        namespace = obj.namespace,
                        ?action,
                        "Reconciliation completed"
                    );
                }
                Err(e) => {
                    error!(error = %e, "Reconciliation failed");
                }
            }
        })
        .await;

    Ok(())
}

fn cluster_key(cluster: &Emqx) -> String {
    format!("{}/{}", cluster.namespace_or_default(), cluster.name_any())
}

/// Main reconciliation function
#[instrument(skip(cluster, ctx), fields(name = %cluster.name_any(), namespace = cluster.namespace()))]
async fn reconcile(cluster: Arc<Emqx>, ctx: Arc<ControllerContext>) -> Result<Action> {
    let start = std::time::Instant::now();

    if let Some(ref metrics) = ctx.metrics {
        metrics.reconciliations.increment(1);
    }

    let result = reconcile_once(&cluster, &ctx, Utc::now()).await;

    if let Some(ref metrics) = ctx.metrics {
        metrics.duration.record(start.elapsed().as_secs_f64());
    }

    match result {
        Ok(requeue) => {
            // Reset error backoff counter on success
            ctx.error_counts.remove(&cluster_key(&cluster));
            Ok(Action::requeue(requeue.unwrap_or(ctx.config.requeue_interval)))
        }
        Err(e) => {
            if let Some(ref metrics) = ctx.metrics {
                metrics.errors.increment(1);
            }
            Err(e)
        }
    }
}

/// Run one pass of the pipeline against a working copy of `cluster`
pub async fn reconcile_once(
    cluster: &Emqx,
    ctx: &ControllerContext,
    now: DateTime<Utc>,
) -> Result<Option<Duration>> {
    if cluster.metadata.deletion_timestamp.is_some() {
        debug!("Cluster is being deleted, owned objects are garbage collected");
        return Ok(None);
    }

    info!("Reconciling EMQX cluster");
    validate_cluster(cluster)?;

    let requester = match build_requester(ctx.store.as_ref(), cluster, &ctx.config.requester).await {
        Ok(requester) => requester,
        Err(e) => {
            warn!(error = %e, "Broker API client unavailable");
            None
        }
    };

    let mut working = cluster.clone();
    let mut pass = ReconcilePass::new(requester.as_deref(), now);
    run_pipeline(&ctx.pipeline, &mut working, &mut pass).await
}

/// Validate the spec before touching any object
fn validate_cluster(cluster: &Emqx) -> Result<()> {
    if let Err(errors) = cluster.spec.validate() {
        let error_messages: Vec<String> = errors
            .field_errors()
            .iter()
            .flat_map(|(field, errs)| {
                errs.iter()
                    .map(move |e| format!("{}: {:?}", field, e.message))
            })
            .collect();
        let error_msg = if error_messages.is_empty() {
            errors.to_string()
        } else {
            error_messages.join("; ")
        };
        warn!(errors = %error_msg, "Cluster spec validation failed");
        return Err(OperatorError::InvalidConfig(error_msg));
    }

    if cluster.spec.core_template.spec.replicas < 1 {
        return Err(OperatorError::InvalidConfig(
            "coreTemplate.spec.replicas must be at least 1".to_string(),
        ));
    }

    Ok(())
}

/// Error policy for the controller — exponential backoff.
fn error_policy(cluster: Arc<Emqx>, error: &OperatorError, ctx: Arc<ControllerContext>) -> Action {
    Action::requeue(backoff_delay(&cluster, error, &ctx))
}

fn backoff_delay(cluster: &Emqx, error: &OperatorError, ctx: &ControllerContext) -> Duration {
    let key = cluster_key(cluster);
    let retries = {
        let mut entry = ctx.error_counts.entry(key.clone()).or_insert(0);
        *entry += 1;
        *entry
    };

    // Use the error's suggested delay OR exponential backoff:
    // 30s → 60s → 120s → 240s → 480s → 600s (capped)
    let delay = error.requeue_delay().unwrap_or_else(|| {
        let base = Duration::from_secs(ERROR_REQUEUE_SECONDS);
        let backoff = base * 2u32.saturating_pow((retries - 1).min(5));
        backoff.min(Duration::from_secs(MAX_ERROR_REQUEUE_SECONDS))
    });

    warn!(
        error = %error,
        retry = retries,
        delay_secs = delay.as_secs(),
        "Reconciliation error for '{}', will retry",
        key
    );

    delay
}
