//! Broker admin API client
//!
//! Thin HTTP client for the EMQX management API, reached through the first
//! ready core pod and authenticated with the bootstrap API key the operator
//! provisions.

use crate::crd::{Emqx, EmqxNode};
use crate::error::{OperatorError, Result};
use crate::resources::{BOOTSTRAP_PASSWORD_KEY, BOOTSTRAP_USERNAME_KEY, DASHBOARD_PORT};
use crate::store::ResourceStore;
use async_trait::async_trait;
use k8s_openapi::api::core::v1::{Pod, Secret};
use reqwest::Method;
use serde_json::Value;
use std::time::Duration;
use tracing::debug;

#[cfg(test)]
use mockall::automock;

/// Path of the node listing endpoint
pub const NODES_PATH: &str = "api/v5/nodes";

/// Default timeout for admin API calls
const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

/// Raw response of an admin API call
#[derive(Debug, Clone, PartialEq)]
pub struct BrokerResponse {
    pub status: u16,
    pub body: Vec<u8>,
}

/// Issues requests against the broker admin API
#[cfg_attr(test, automock)]
#[async_trait]
pub trait Requester: Send + Sync {
    async fn request(&self, method: Method, path: &str, body: Option<Value>)
        -> Result<BrokerResponse>;
}

/// Settings for reaching the admin API
#[derive(Debug, Clone)]
pub struct RequesterConfig {
    pub port: u16,
    pub timeout: Duration,
}

impl Default for RequesterConfig {
    fn default() -> Self {
        Self {
            port: DASHBOARD_PORT as u16,
            timeout: DEFAULT_REQUEST_TIMEOUT,
        }
    }
}

/// [`Requester`] over reqwest with HTTP basic auth
pub struct HttpRequester {
    client: reqwest::Client,
    base_url: String,
    username: String,
    password: String,
}

impl HttpRequester {
    pub fn new(host: &str, config: &RequesterConfig, username: &str, password: &str) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(config.timeout)
            .build()
            .map_err(|e| OperatorError::BrokerApi(format!("failed to build HTTP client: {}", e)))?;
        Ok(Self {
            client,
            base_url: format!("http://{}:{}", format_host(host), config.port),
            username: username.to_string(),
            password: password.to_string(),
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn url(&self, path: &str) -> String {
        format!("{}/{}", self.base_url, path.trim_start_matches('/'))
    }
}

#[async_trait]
impl Requester for HttpRequester {
    async fn request(
        &self,
        method: Method,
        path: &str,
        body: Option<Value>,
    ) -> Result<BrokerResponse> {
        let url = self.url(path);
        debug!(%method, url = %url, "Calling broker API");

        let mut request = self
            .client
            .request(method, &url)
            .basic_auth(&self.username, Some(&self.password));
        if let Some(body) = body {
            request = request.json(&body);
        }

        let response = request.send().await.map_err(|e| {
            if e.is_timeout() {
                OperatorError::Timeout(format!("request to {} timed out", url))
            } else {
                OperatorError::BrokerApi(format!("request to {} failed: {}", url, e))
            }
        })?;

        let status = response.status().as_u16();
        let body = response
            .bytes()
            .await
            .map_err(|e| OperatorError::BrokerApi(format!("failed reading body from {}: {}", url, e)))?;

        Ok(BrokerResponse {
            status,
            body: body.to_vec(),
        })
    }
}

/// Wrap IPv6 literals in brackets so they can be used in a URL
fn format_host(host: &str) -> String {
    if host.contains(':') && !host.starts_with('[') {
        format!("[{}]", host)
    } else {
        host.to_string()
    }
}

/// Fetch live node state from `GET /api/v5/nodes`
pub async fn get_node_statuses(requester: &dyn Requester) -> Result<Vec<EmqxNode>> {
    let response = requester.request(Method::GET, NODES_PATH, None).await?;
    if response.status != 200 {
        return Err(OperatorError::BrokerApi(format!(
            "failed to get API {}, status: {}, body: {}",
            NODES_PATH,
            response.status,
            String::from_utf8_lossy(&response.body)
        )));
    }
    serde_json::from_slice(&response.body).map_err(|e| {
        OperatorError::BrokerApi(format!("failed to unmarshal node statuses: {}", e))
    })
}

/// Whether the pod reports the `Ready` condition
pub fn is_pod_ready(pod: &Pod) -> bool {
    pod.status
        .as_ref()
        .and_then(|s| s.conditions.as_ref())
        .is_some_and(|conds| {
            conds
                .iter()
                .any(|c| c.type_ == "Ready" && c.status == "True")
        })
}

fn secret_value(secret: &Secret, key: &str) -> Option<String> {
    if let Some(v) = secret.data.as_ref().and_then(|d| d.get(key)) {
        return String::from_utf8(v.0.clone()).ok();
    }
    secret
        .string_data
        .as_ref()
        .and_then(|d| d.get(key))
        .cloned()
}

/// Build a requester pointing at the first ready core pod.
///
/// Returns `None` while no core pod is ready or the bootstrap credentials do
/// not exist yet.
pub async fn build_requester(
    store: &dyn ResourceStore,
    cluster: &Emqx,
    config: &RequesterConfig,
) -> Result<Option<Box<dyn Requester>>> {
    let namespace = cluster.namespace_or_default();

    let pods = store
        .list_pods(&namespace, &cluster.core_selector_labels())
        .await?;
    let Some(host) = pods
        .iter()
        .filter(|p| is_pod_ready(p))
        .find_map(|p| p.status.as_ref().and_then(|s| s.pod_ip.clone()))
    else {
        debug!("No ready core pod, broker API unavailable");
        return Ok(None);
    };

    let Some(secret) = store
        .get_secret(&namespace, &cluster.bootstrap_user_name())
        .await?
    else {
        debug!("Bootstrap user secret missing, broker API unavailable");
        return Ok(None);
    };

    let (Some(username), Some(password)) = (
        secret_value(&secret, BOOTSTRAP_USERNAME_KEY),
        secret_value(&secret, BOOTSTRAP_PASSWORD_KEY),
    ) else {
        return Err(OperatorError::InvalidConfig(format!(
            "secret {} has no API credentials",
            cluster.bootstrap_user_name()
        )));
    };

    let requester = HttpRequester::new(&host, config, &username, &password)?;
    Ok(Some(Box::new(requester)))
}
