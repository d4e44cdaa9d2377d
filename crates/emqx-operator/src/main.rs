//! EMQX Kubernetes Operator
//!
//! This operator manages EMQX custom resources in Kubernetes, running each
//! broker cluster as a core StatefulSet plus revisioned replicant ReplicaSets.

use anyhow::{Context, Result};
use clap::Parser;
use emqx_operator::controller::{self, OperatorConfig, DEFAULT_REQUEUE_SECONDS};
use emqx_operator::crd;
use emqx_operator::requester::RequesterConfig;
use kube::Client;
use std::net::SocketAddr;
use std::time::Duration;
use tracing::{info, Level};
use tracing_subscriber::fmt::format::FmtSpan;
use tracing_subscriber::EnvFilter;

/// EMQX Kubernetes Operator
#[derive(Parser, Debug)]
#[command(name = "emqx-operator")]
#[command(about = "Kubernetes operator for EMQX broker clusters")]
#[command(version)]
struct Args {
    /// Metrics server address
    #[arg(long, env = "METRICS_ADDR", default_value = "0.0.0.0:8080")]
    metrics_addr: SocketAddr,

    /// Health probe address
    #[arg(long, env = "HEALTH_ADDR", default_value = "0.0.0.0:8081")]
    health_addr: SocketAddr,

    /// Namespace to watch (empty for cluster-wide)
    #[arg(long, env = "WATCH_NAMESPACE", default_value = "")]
    namespace: String,

    /// Seconds between passes over a healthy cluster
    #[arg(long, env = "REQUEUE_INTERVAL_SECS", default_value_t = DEFAULT_REQUEUE_SECONDS)]
    requeue_interval_secs: u64,

    /// Port of the broker admin API on core pods
    #[arg(long, env = "BROKER_API_PORT", default_value = "18083")]
    broker_api_port: u16,

    /// Timeout for broker admin API calls, in seconds
    #[arg(long, env = "BROKER_API_TIMEOUT_SECS", default_value = "10")]
    broker_api_timeout_secs: u64,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, env = "LOG_LEVEL", default_value = "info")]
    log_level: Level,

    /// Enable JSON log format
    #[arg(long, env = "LOG_JSON", default_value = "false")]
    log_json: bool,

    /// Print CRD YAML and exit
    #[arg(long)]
    print_crd: bool,
}

impl Args {
    fn operator_config(&self) -> OperatorConfig {
        OperatorConfig {
            requeue_interval: Duration::from_secs(self.requeue_interval_secs),
            requester: RequesterConfig {
                port: self.broker_api_port,
                timeout: Duration::from_secs(self.broker_api_timeout_secs),
            },
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // Handle CRD printing
    if args.print_crd {
        print_crd()?;
        return Ok(());
    }

    // Initialize logging
    init_logging(&args)?;

    info!(
        version = env!("CARGO_PKG_VERSION"),
        namespace = if args.namespace.is_empty() {
            "all"
        } else {
            &args.namespace
        },
        "Starting EMQX Kubernetes Operator"
    );

    // Initialize metrics
    let metrics_addr = args.metrics_addr;
    tokio::spawn(async move {
        if let Err(e) = start_metrics_server(metrics_addr).await {
            tracing::error!(error = %e, "Metrics server failed");
        }
    });

    // Start health server
    let health_addr = args.health_addr;
    tokio::spawn(async move {
        if let Err(e) = start_health_server(health_addr).await {
            tracing::error!(error = %e, "Health server failed");
        }
    });

    // Create Kubernetes client
    let client = Client::try_default()
        .await
        .context("Failed to create Kubernetes client")?;

    let config = args.operator_config();

    // Parse namespace (empty string means cluster-wide)
    let namespace = if args.namespace.is_empty() {
        None
    } else {
        Some(args.namespace)
    };

    // Run the controller
    controller::run_controller(client, namespace, config)
        .await
        .context("Controller failed")?;

    Ok(())
}

/// Initialize logging subsystem. `RUST_LOG` takes precedence over `--log-level`.
fn init_logging(args: &Args) -> Result<()> {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(args.log_level.to_string()));
    let subscriber = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_span_events(FmtSpan::CLOSE)
        .with_target(true)
        .with_thread_ids(false)
        .with_line_number(false);

    if args.log_json {
        subscriber.json().init();
    } else {
        subscriber.init();
    }

    Ok(())
}

/// Start the Prometheus metrics server
async fn start_metrics_server(addr: SocketAddr) -> Result<()> {
    use metrics_exporter_prometheus::PrometheusBuilder;

    info!(address = %addr, "Starting metrics server");

    PrometheusBuilder::new()
        .with_http_listener(addr)
        .install()
        .context("Failed to install Prometheus exporter")?;

    // Keep the server running
    std::future::pending::<()>().await;

    Ok(())
}

/// Start the health probe server
async fn start_health_server(addr: SocketAddr) -> Result<()> {
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    info!(address = %addr, "Starting health server");

    let listener = TcpListener::bind(addr)
        .await
        .context("Failed to bind health server")?;

    loop {
        let (mut socket, _) = listener.accept().await?;

        tokio::spawn(async move {
            let mut buf = [0; 1024];
            if socket.read(&mut buf).await.is_ok() {
                let response = "HTTP/1.1 200 OK\r\nContent-Length: 2\r\n\r\nOK";
                let _ = socket.write_all(response.as_bytes()).await;
            }
        });
    }
}

/// Print the CRD YAML for installation
fn print_crd() -> Result<()> {
    use kube::CustomResourceExt;

    let crd = crd::Emqx::crd();
    let yaml = serde_yaml::to_string(&crd)?;
    println!("{}", yaml);

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_args_defaults() {
        let args = Args::parse_from(["emqx-operator"]);
        let config = args.operator_config();
        assert_eq!(config.requeue_interval, Duration::from_secs(DEFAULT_REQUEUE_SECONDS));
        assert_eq!(config.requester.port, 18083);
        assert_eq!(config.requester.timeout, Duration::from_secs(10));
        assert!(args.namespace.is_empty());
    }

    #[test]
    fn test_args_overrides() {
        let args = Args::parse_from([
            "emqx-operator",
            "--namespace",
            "brokers",
            "--requeue-interval-secs",
            "5",
            "--broker-api-port",
            "8081",
        ]);
        let config = args.operator_config();
        assert_eq!(config.requeue_interval, Duration::from_secs(5));
        assert_eq!(config.requester.port, 8081);
        assert_eq!(args.namespace, "brokers");
    }
}
