//! TrueNAS CSI Driver
//!
//! Serves the CSI Identity service, plus the Controller service when a
//! controller configuration is given and the Node service unless disabled.

use std::net::SocketAddr;
use std::path::PathBuf;

use clap::Parser;
use tokio::net::UnixListener;
use tokio::signal;
use tokio_stream::wrappers::UnixListenerStream;
use tonic::transport::{Certificate, Identity, Server, ServerTlsConfig};
use tracing::{Level, info};
use tracing_subscriber::{EnvFilter, FmtSubscriber};

use truenas_csi::config::ControllerConfig;
use truenas_csi::csi::controller_server::ControllerServer;
use truenas_csi::csi::identity_server::IdentityServer;
use truenas_csi::csi::node_server::NodeServer;
use truenas_csi::metrics;
use truenas_csi::{ControllerService, DRIVER_NAME, DRIVER_VERSION, IdentityService, NodeService};

/// CLI arguments for the CSI driver
#[derive(Parser, Debug)]
#[command(name = "truenas-csi")]
#[command(about = "TrueNAS CSI Driver for Kubernetes")]
struct Args {
    /// CSI endpoint (unix:///path or tcp://host:port)
    #[arg(long, env = "CSI_ENDPOINT", default_value = "unix:///csi/csi.sock")]
    endpoint: String,

    /// Node ID for this CSI node (defaults to the hostname)
    #[arg(long, env = "CSI_NODE_ID")]
    node_id: Option<String>,

    /// Controller configuration file; enables the controller service
    #[arg(long, env = "CONTROLLER_CONFIG")]
    controller_config: Option<PathBuf>,

    /// Run in node mode (enables node service)
    #[arg(long, default_value = "true", action = clap::ArgAction::Set)]
    node: bool,

    /// TLS certificate file (PEM format)
    #[arg(long, env = "TLS_CERT_PATH")]
    tls_cert: Option<PathBuf>,

    /// TLS private key file (PEM format)
    #[arg(long, env = "TLS_KEY_PATH")]
    tls_key: Option<PathBuf>,

    /// CA certificate for client verification (enables mTLS)
    #[arg(long, env = "TLS_CLIENT_CA_PATH")]
    tls_client_ca: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error); RUST_LOG overrides it
    #[arg(long, env = "LOG_LEVEL", default_value = "info")]
    log_level: String,

    /// Prometheus metrics HTTP address (e.g., 0.0.0.0:9091)
    /// If not set, metrics endpoint is disabled
    #[arg(long, env = "METRICS_ADDR")]
    metrics_addr: Option<String>,
}

/// Where the gRPC server listens.
#[derive(Debug, Clone, PartialEq, Eq)]
enum Endpoint {
    Unix(PathBuf),
    Tcp(SocketAddr),
}

fn parse_endpoint(endpoint: &str) -> Result<Endpoint, String> {
    if let Some(path) = endpoint.strip_prefix("unix://") {
        if path.is_empty() {
            return Err(format!("Endpoint '{}' has no socket path", endpoint));
        }
        return Ok(Endpoint::Unix(PathBuf::from(path)));
    }
    if let Some(addr) = endpoint.strip_prefix("tcp://") {
        return addr
            .parse()
            .map(Endpoint::Tcp)
            .map_err(|e| format!("Invalid tcp endpoint '{}': {}", endpoint, e));
    }
    Err(format!(
        "Unsupported endpoint '{}', expected unix:// or tcp://",
        endpoint
    ))
}

fn parse_level(level: &str) -> Level {
    match level.to_lowercase().as_str() {
        "trace" => Level::TRACE,
        "debug" => Level::DEBUG,
        "info" => Level::INFO,
        "warn" => Level::WARN,
        "error" => Level::ERROR,
        _ => Level::INFO,
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    // RUST_LOG wins over --log-level when set
    match EnvFilter::try_from_default_env() {
        Ok(filter) => {
            let subscriber = FmtSubscriber::builder().with_env_filter(filter).finish();
            tracing::subscriber::set_global_default(subscriber)?;
        }
        Err(_) => {
            let subscriber = FmtSubscriber::builder()
                .with_max_level(parse_level(&args.log_level))
                .finish();
            tracing::subscriber::set_global_default(subscriber)?;
        }
    }

    // Initialize Prometheus metrics endpoint if configured
    if let Some(ref addr_str) = args.metrics_addr {
        let addr = addr_str
            .parse()
            .map_err(|e| format!("Invalid metrics address '{}': {}", addr_str, e))?;
        if let Err(e) = metrics::init_metrics(addr) {
            return Err(format!("Failed to initialize metrics: {}", e).into());
        }
    }

    let endpoint = parse_endpoint(&args.endpoint)?;

    let node_id = match args.node_id {
        Some(id) => id,
        None => hostname::get()?.to_string_lossy().to_string(),
    };

    info!(
        driver_name = DRIVER_NAME,
        version = DRIVER_VERSION,
        endpoint = %args.endpoint,
        node_id = %node_id,
        controller_mode = args.controller_config.is_some(),
        node_mode = args.node,
        "Starting TrueNAS CSI Driver"
    );

    let controller = match &args.controller_config {
        Some(path) => {
            let resolver = ControllerConfig::load(path)?.into_resolver()?;
            info!(config = %path.display(), "Controller configuration loaded");
            Some(ControllerServer::new(ControllerService::new(resolver)))
        }
        None => None,
    };
    let node = args
        .node
        .then(|| NodeServer::new(NodeService::new(node_id.clone())));

    // Build the gRPC server with optional TLS
    let mut builder = Server::builder();

    if let (Some(cert_path), Some(key_path)) = (&args.tls_cert, &args.tls_key) {
        let cert = tokio::fs::read(cert_path).await?;
        let key = tokio::fs::read(key_path).await?;
        let identity = Identity::from_pem(cert, key);

        let mut tls = ServerTlsConfig::new().identity(identity);

        // If client CA provided, require client certificates (mTLS)
        if let Some(ca_path) = &args.tls_client_ca {
            let ca = tokio::fs::read(ca_path).await?;
            tls = tls.client_ca_root(Certificate::from_pem(ca));
            info!("mTLS enabled - client certificates required");
        } else {
            info!("TLS enabled (server-only, no client verification)");
        }

        builder = builder.tls_config(tls)?;
    }

    let router = builder
        .add_service(IdentityServer::new(IdentityService::new(controller.is_some())))
        .add_optional_service(controller)
        .add_optional_service(node);

    let shutdown = async {
        shutdown_signal().await;
        info!("Shutdown signal received, draining connections...");
    };

    match endpoint {
        Endpoint::Unix(path) => {
            // A socket left over from a previous run blocks bind
            match std::fs::remove_file(&path) {
                Ok(()) => info!(path = %path.display(), "Removed stale socket"),
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => return Err(e.into()),
            }
            if let Some(parent) = path.parent() {
                std::fs::create_dir_all(parent)?;
            }

            let listener = UnixListener::bind(&path)?;
            info!(path = %path.display(), "gRPC server listening");
            router
                .serve_with_incoming_shutdown(UnixListenerStream::new(listener), shutdown)
                .await?;
        }
        Endpoint::Tcp(addr) => {
            info!(%addr, "gRPC server listening");
            router.serve_with_shutdown(addr, shutdown).await?;
        }
    }

    info!("TrueNAS CSI Driver shutdown complete");
    Ok(())
}

async fn recv_or_pending(signal: Option<&mut signal::unix::Signal>) {
    match signal {
        Some(signal) => {
            signal.recv().await;
        }
        None => std::future::pending().await,
    }
}

/// Wait for shutdown signal (SIGTERM, SIGINT, or SIGHUP)
async fn shutdown_signal() {
    use signal::unix::{SignalKind, signal};

    // Install signal handlers, logging errors but continuing with available handlers
    let install = |kind: SignalKind, name: &str| match signal(kind) {
        Ok(s) => Some(s),
        Err(e) => {
            tracing::error!("Failed to install {} handler: {}", name, e);
            None
        }
    };
    let mut sigterm = install(SignalKind::terminate(), "SIGTERM");
    let mut sigint = install(SignalKind::interrupt(), "SIGINT");
    let mut sighup = install(SignalKind::hangup(), "SIGHUP");

    tokio::select! {
        _ = recv_or_pending(sigterm.as_mut()) => info!("Received SIGTERM"),
        _ = recv_or_pending(sigint.as_mut()) => info!("Received SIGINT"),
        _ = recv_or_pending(sighup.as_mut()) => info!("Received SIGHUP, shutting down"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_endpoint() {
        assert_eq!(
            parse_endpoint("unix:///csi/csi.sock").unwrap(),
            Endpoint::Unix(PathBuf::from("/csi/csi.sock"))
        );
        assert_eq!(
            parse_endpoint("tcp://127.0.0.1:10000").unwrap(),
            Endpoint::Tcp("127.0.0.1:10000".parse().unwrap())
        );
        assert!(parse_endpoint("unix://").is_err());
        assert!(parse_endpoint("tcp://nohost").is_err());
        assert!(parse_endpoint("/csi/csi.sock").is_err());
    }

    #[test]
    fn test_parse_level() {
        assert_eq!(parse_level("DEBUG"), Level::DEBUG);
        assert_eq!(parse_level("bogus"), Level::INFO);
    }

    #[test]
    fn test_args_defaults() {
        let args = Args::try_parse_from(["truenas-csi", "--node-id", "n1"]).unwrap();
        assert!(args.node);
        assert!(args.controller_config.is_none());

        let args = Args::try_parse_from(["truenas-csi", "--node", "false"]).unwrap();
        assert!(!args.node);
    }
}
