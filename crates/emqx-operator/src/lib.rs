//! # EMQX Kubernetes Operator
//!
//! Kubernetes operator for clustered EMQX brokers made of two node groups:
//! a stable group of **core** nodes holding the cluster database and an
//! elastic group of stateless **replicant** nodes serving client traffic.
//!
//! ## Features
//!
//! - **Custom Resource Definition**: the `EMQX` CRD (`apps.emqx.io/v2beta1`)
//! - **Core nodes**: one StatefulSet, updated in place
//! - **Replicant nodes**: one ReplicaSet per pod-template revision, with the
//!   revision hash in its name and labels
//! - **Evacuation**: superseded replicants are drained one pod at a time,
//!   choosing the node holding the fewest sessions
//! - **Status**: ordered conditions (`CoreNodesReady`, `CoreNodesProgressing`,
//!   `ReplicantNodesReady`, `ReplicantNodesProgressing`, `Ready`) with
//!   transition times
//! - **Observability**: Prometheus-compatible operator metrics and
//!   Kubernetes events
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use emqx_operator::prelude::*;
//! use kube::Client;
//!
//! #[tokio::main]
//! async fn main() -> Result<()> {
//!     let client = Client::try_default().await?;
//!     run_controller(client, None, OperatorConfig::default()).await
//! }
//! ```
//!
//! ## Architecture
//!
//! Each pass runs an ordered pipeline against a working copy of the object:
//!
//! 1. **Bootstrap**: headless Service, ConfigMap, node-cookie and
//!    bootstrap-user Secrets
//! 2. **Core**: create or update the core StatefulSet
//! 3. **Replicant**: once core nodes are ready, create the ReplicaSet of the
//!    current revision and drain at most one pod of the oldest superseded one
//! 4. **Status**: query the broker admin API, advance the conditions and
//!    write the status subresource
//!
//! A step asking for a requeue (write conflict, creation race) ends the pass.
//!
//! ## Custom Resource Definition
//!
//! ```yaml
//! apiVersion: apps.emqx.io/v2beta1
//! kind: EMQX
//! metadata:
//!   name: emqx
//! spec:
//!   image: emqx:5.1
//!   coreTemplate:
//!     spec:
//!       replicas: 2
//!   replicantTemplate:
//!     spec:
//!       replicas: 3
//!   updateStrategy:
//!     initialDelaySeconds: 10
//!     evacuationStrategy:
//!       waitTakeover: 10
//! ```
//!
//! ## Metrics
//!
//! - `emqx_operator_reconciliations_total` - Total reconciliation attempts
//! - `emqx_operator_reconciliation_errors_total` - Reconciliation errors
//! - `emqx_operator_reconciliation_duration_seconds` - Reconciliation latency
//! - `emqx_operator_replicant_scale_down_total` - Replicant pods drained

pub mod bootstrap;
pub mod controller;
pub mod core_nodes;
pub mod crd;
pub mod error;
pub mod evacuation;
pub mod events;
pub mod hash;
pub mod patch;
pub mod replicant_nodes;
pub mod requester;
pub mod resources;
pub mod status;
pub mod store;

#[cfg(test)]
pub mod testing;

pub mod prelude {
    //! Re-exports for convenient usage
    pub use crate::controller::{
        run_controller, ControllerContext, ControllerMetrics, OperatorConfig,
    };
    pub use crate::crd::{
        Condition, ConditionStatus, Emqx, EmqxNode, EmqxNodeTemplate, EmqxNodesStatus, EmqxSpec,
        EmqxStatus, EvacuationStrategy, UpdateStrategy,
    };
    pub use crate::error::{OperatorError, Result};
    pub use crate::requester::RequesterConfig;
}
