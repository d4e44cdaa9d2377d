//! Supporting objects every EMQX pod depends on
//!
//! The headless Service and the configuration ConfigMap are server-side
//! applied on every pass. The node-cookie and bootstrap-user Secrets are
//! generated once and never rotated.

use crate::controller::{ReconcilePass, SubReconciler, SubResult};
use crate::crd::Emqx;
use crate::error::Result;
use crate::resources::ResourceBuilder;
use crate::store::ResourceStore;
use async_trait::async_trait;
use kube::ResourceExt;
use rand::distributions::Alphanumeric;
use rand::Rng;
use std::sync::Arc;
use tracing::{info, instrument};

/// User name of the operator's own admin API key
pub const BOOTSTRAP_USERNAME: &str = "emqx-operator-controller";

const COOKIE_LENGTH: usize = 64;
const PASSWORD_LENGTH: usize = 32;

fn random_string(len: usize) -> String {
    rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(len)
        .map(char::from)
        .collect()
}

/// Applies the Service, ConfigMap and Secrets
pub struct BootstrapReconciler {
    store: Arc<dyn ResourceStore>,
}

impl BootstrapReconciler {
    pub fn new(store: Arc<dyn ResourceStore>) -> Self {
        Self { store }
    }

    async fn apply(&self, cluster: &Emqx) -> Result<()> {
        let namespace = cluster.namespace_or_default();
        let builder = ResourceBuilder::new(cluster)?;

        self.store
            .apply_service(&namespace, &builder.build_headless_service())
            .await?;
        self.store
            .apply_configmap(&namespace, &builder.build_configmap())
            .await?;

        if self
            .store
            .get_secret(&namespace, &cluster.node_cookie_name())
            .await?
            .is_none()
        {
            info!(secret = %cluster.node_cookie_name(), "Generating node cookie");
            let secret = builder.build_node_cookie_secret(&random_string(COOKIE_LENGTH));
            self.store.create_secret(&namespace, &secret).await?;
        }

        if self
            .store
            .get_secret(&namespace, &cluster.bootstrap_user_name())
            .await?
            .is_none()
        {
            info!(secret = %cluster.bootstrap_user_name(), "Generating bootstrap API key");
            let secret = builder
                .build_bootstrap_user_secret(BOOTSTRAP_USERNAME, &random_string(PASSWORD_LENGTH));
            self.store.create_secret(&namespace, &secret).await?;
        }

        Ok(())
    }
}

#[async_trait]
impl SubReconciler for BootstrapReconciler {
    fn name(&self) -> &'static str {
        "bootstrap"
    }

    #[instrument(skip_all, fields(name = %cluster.name_any()))]
    async fn reconcile(&self, cluster: &mut Emqx, _pass: &mut ReconcilePass<'_>) -> SubResult {
        SubResult::from_result(
            self.apply(cluster)
                .await
                .map_err(|e| e.context("failed to apply bootstrap resources")),
        )
    }
}
