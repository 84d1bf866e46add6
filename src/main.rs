use std::net::SocketAddr;
use std::process::ExitCode;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use clap::{ArgAction, Parser, Subcommand};
use health_sync_k8s::config::{
    ConsulConfig, NamespaceFilterConfig, NamingConfig, QueueConfig, DEFAULT_POD_LABEL_SELECTOR,
    NAMESPACE_WILDCARD,
};
use health_sync_k8s::consul::{ConsulClient, MeshRegistry};
use health_sync_k8s::{controller, rest_api, Error, SyncConfig};
use tokio::net::TcpListener;
use tokio::sync::{oneshot, watch};
use tracing::{error, info, warn, Level};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run the operator
    Run(RunArgs),
    /// Show version and build information
    Version,
}

#[derive(Parser, Debug)]
struct RunArgs {
    /// Address for the readiness and metrics endpoints
    #[arg(long, env = "LISTEN", default_value = "0.0.0.0:8080")]
    listen: SocketAddr,

    /// Log level: trace, debug, info, warn or error
    #[arg(long, env = "LOG_LEVEL", default_value = "info")]
    log_level: String,

    /// Emit logs as JSON
    #[arg(long, env = "LOG_JSON")]
    log_json: bool,

    /// Consul agent HTTP address
    #[arg(long, env = "CONSUL_HTTP_ADDR", default_value = "http://127.0.0.1:8500")]
    http_addr: String,

    /// Port of the Consul client agent on each node
    #[arg(long, env = "CONSUL_AGENT_PORT", default_value_t = 8500)]
    agent_port: u16,

    /// Send each pod's checks to the agent on the pod's host IP
    #[arg(long, env = "USE_HOST_AGENT", default_value_t = true, action = ArgAction::Set)]
    use_host_agent: bool,

    /// ACL token for the Consul API
    #[arg(long, env = "CONSUL_HTTP_TOKEN", hide_env_values = true)]
    consul_token: Option<String>,

    /// Only sync this namespace; overrides the allow and deny lists
    #[arg(long, env = "K8S_SOURCE_NAMESPACE", default_value = "")]
    k8s_source_namespace: String,

    /// Namespaces to sync ("*" for all); repeatable
    #[arg(
        long = "allow-k8s-namespace",
        env = "ALLOW_K8S_NAMESPACES",
        value_delimiter = ',',
        default_values_t = vec![NAMESPACE_WILDCARD.to_string()]
    )]
    allow_k8s_namespaces: Vec<String>,

    /// Namespaces never synced, even when allowed; repeatable
    #[arg(long = "deny-k8s-namespace", env = "DENY_K8S_NAMESPACES", value_delimiter = ',')]
    deny_k8s_namespaces: Vec<String>,

    /// Prefix added to synced service names
    #[arg(long, env = "K8S_SERVICE_PREFIX", default_value = "")]
    k8s_service_prefix: String,

    /// Append "-<namespace>" to synced service names
    #[arg(long, env = "ADD_K8S_NAMESPACE_SUFFIX")]
    add_k8s_namespace_suffix: bool,

    /// Consul namespace services are written to
    #[arg(long, env = "K8S_WRITE_NAMESPACE", default_value = "default")]
    k8s_write_namespace: String,

    /// Pass Consul namespaces on every request
    #[arg(long, env = "ENABLE_NAMESPACES")]
    enable_namespaces: bool,

    /// Mirror Kubernetes namespaces into Consul namespaces
    #[arg(long, env = "ENABLE_K8S_NAMESPACE_MIRRORING")]
    enable_k8s_namespace_mirroring: bool,

    /// Prefix for mirrored Consul namespaces
    #[arg(long, env = "K8S_NAMESPACE_MIRRORING_PREFIX", default_value = "")]
    k8s_namespace_mirroring_prefix: String,

    /// Label selector for the pods to watch
    #[arg(long, env = "POD_LABEL_SELECTOR", default_value = DEFAULT_POD_LABEL_SELECTOR)]
    pod_label_selector: String,

    /// Retries per key before it is dropped
    #[arg(long, env = "MAX_RETRIES", default_value_t = 10)]
    max_retries: u32,

    /// Concurrent workers draining the queue
    #[arg(long, env = "WORKERS", default_value_t = 2)]
    workers: usize,

    /// First retry delay in milliseconds
    #[arg(long, env = "BACKOFF_BASE_MS", default_value_t = 5)]
    backoff_base_ms: u64,

    /// Retry delay cap in seconds
    #[arg(long, env = "BACKOFF_MAX_SECS", default_value_t = 1000)]
    backoff_max_secs: u64,

    /// TTL of registered health checks
    #[arg(long, env = "CHECK_TTL", default_value = "100000h")]
    check_ttl: String,
}

impl RunArgs {
    fn sync_config(&self) -> SyncConfig {
        SyncConfig {
            namespaces: NamespaceFilterConfig::new(
                self.k8s_source_namespace.clone(),
                self.allow_k8s_namespaces.iter().cloned(),
                self.deny_k8s_namespaces.iter().cloned(),
            ),
            naming: NamingConfig {
                service_prefix: self.k8s_service_prefix.clone(),
                add_namespace_suffix: self.add_k8s_namespace_suffix,
                write_namespace: self.k8s_write_namespace.clone(),
                enable_namespace_mirroring: self.enable_k8s_namespace_mirroring,
                mirroring_prefix: self.k8s_namespace_mirroring_prefix.clone(),
            },
            queue: QueueConfig {
                max_retries: self.max_retries,
                workers: self.workers,
                backoff_base: Duration::from_millis(self.backoff_base_ms),
                backoff_max: Duration::from_secs(self.backoff_max_secs),
            },
            consul: ConsulConfig {
                http_addr: self.http_addr.clone(),
                agent_port: self.agent_port,
                use_host_agent: self.use_host_agent,
                token: self.consul_token.clone().filter(|t| !t.is_empty()),
                enable_namespaces: self.enable_namespaces,
                check_ttl: self.check_ttl.clone(),
            },
            pod_label_selector: Some(self.pod_label_selector.clone())
                .filter(|selector| !selector.is_empty()),
        }
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    let args = Args::parse();

    match args.command {
        Commands::Version => {
            println!("health-sync-operator v{}", env!("CARGO_PKG_VERSION"));
            println!("Build Date: {}", env!("BUILD_DATE"));
            println!("Git SHA: {}", env!("GIT_SHA"));
            println!("Rust Version: {}", env!("RUST_VERSION"));
            ExitCode::SUCCESS
        }
        Commands::Run(run_args) => match run_operator(run_args).await {
            Ok(()) => ExitCode::SUCCESS,
            Err(e) => {
                error!(error = %e, "Operator exited with error");
                eprintln!("health-sync-operator: {e}");
                ExitCode::FAILURE
            }
        },
    }
}

fn init_logging(level: &str, json: bool) -> Result<(), Error> {
    let level = Level::from_str(level)
        .map_err(|_| Error::ConfigError(format!("invalid log level {level:?}")))?;
    let env_filter = EnvFilter::builder()
        .with_default_directive(level.into())
        .from_env_lossy();

    let registry = tracing_subscriber::registry()
        .with(env_filter)
        .with(json.then(|| fmt::layer().json().with_target(true)))
        .with((!json).then(|| fmt::layer().with_target(true)));

    match health_sync_k8s::telemetry::init_telemetry(&registry) {
        Some(otel_layer) => {
            registry.with(otel_layer).init();
            info!("OpenTelemetry tracing initialized");
        }
        None => {
            registry.init();
            info!("OpenTelemetry tracing disabled (OTEL_EXPORTER_OTLP_ENDPOINT not set)");
        }
    }
    Ok(())
}

/// Resolves on SIGINT, or SIGTERM on unix
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!("Failed to listen for interrupt: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                warn!("Failed to listen for SIGTERM: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("Received interrupt"),
        _ = terminate => info!("Received SIGTERM"),
    }
}

async fn run_operator(args: RunArgs) -> Result<(), Error> {
    init_logging(&args.log_level, args.log_json)?;

    let config = args.sync_config();
    config.validate()?;

    info!(
        "Starting health-sync-operator v{}",
        env!("CARGO_PKG_VERSION")
    );

    let registry: Arc<dyn MeshRegistry> = Arc::new(ConsulClient::new(&config.consul)?);

    let client = kube::Client::try_default()
        .await
        .map_err(Error::KubeError)?;
    info!("Connected to Kubernetes cluster");

    let controller = controller::build_controller(client, registry.clone(), &config);

    let listener = TcpListener::bind(args.listen)
        .await
        .map_err(|e| Error::ConfigError(format!("Failed to bind to {}: {}", args.listen, e)))?;
    let api_state = Arc::new(rest_api::ApiState::new(controller.phase(), registry));
    let (server_stop, server_stop_rx) = oneshot::channel::<()>();
    let server = tokio::spawn(rest_api::serve(listener, api_state, async {
        let _ = server_stop_rx.await;
    }));

    let (signalled_tx, mut signalled) = watch::channel(false);
    tokio::spawn(async move {
        shutdown_signal().await;
        signalled_tx.send_replace(true);
    });

    let result = controller
        .run(async move {
            let _ = signalled.wait_for(|s| *s).await;
        })
        .await;

    let _ = server_stop.send(());
    match server.await {
        Ok(Err(e)) => warn!("Readiness server error: {}", e),
        Err(e) => warn!("Readiness server task failed: {}", e),
        Ok(Ok(())) => {}
    }

    // Flush any remaining traces
    health_sync_k8s::telemetry::shutdown_telemetry();

    result
}
