use clap::{Parser, Subcommand};
use podconfig_runtime::types::primary_container_id;
use podconfig_runtime::{
    AddressAllocator, AttachmentEngine, ControllerConfig, CriClient, HostNetns, IpLinks,
    KubeClient, PodConfigController, PodInventory, ProcessResolver, DEFAULT_RUNTIME_ENDPOINT,
    DEFAULT_SAMPLE_IMAGE,
};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

#[derive(Parser)]
#[command(name = "podconfig", about = "Attach extra L2 interfaces to running pods")]
struct Cli {
    /// Emit logs as JSON
    #[arg(long, global = true, env = "PODCONFIG_LOG_JSON")]
    log_json: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the PodConfig controller
    Run {
        /// Only watch this namespace (default: all namespaces)
        #[arg(long, env = "WATCH_NAMESPACE")]
        namespace: Option<String>,
        /// Where the host's /proc is mounted
        #[arg(long, env = "PODCONFIG_PROC_ROOT", default_value = "/proc")]
        proc_root: String,
        /// Container runtime socket
        #[arg(long, env = "PODCONFIG_RUNTIME_ENDPOINT", default_value = DEFAULT_RUNTIME_ENDPOINT)]
        runtime_endpoint: String,
        /// Seconds between full resyncs
        #[arg(long, env = "PODCONFIG_RESYNC_SECS", default_value_t = 10)]
        resync_secs: u64,
        /// Seconds before retrying a PodConfig whose pods are not ready
        #[arg(long, env = "PODCONFIG_REQUEUE_SECS", default_value_t = 5)]
        requeue_secs: u64,
        /// Image of the sample Deployment
        #[arg(long, env = "PODCONFIG_SAMPLE_IMAGE", default_value = DEFAULT_SAMPLE_IMAGE)]
        sample_image: String,
        /// iproute2 binary
        #[arg(long, env = "PODCONFIG_IP_BINARY", default_value = "ip")]
        ip_binary: String,
    },
    /// Resolve container ids (or a pod's first container) to pids
    Inspect {
        /// Container ids, with or without the `cri-o://` prefix
        container_ids: Vec<String>,
        /// Look up the container id of this pod instead
        #[arg(long, conflicts_with = "container_ids")]
        pod: Option<String>,
        /// Namespace of --pod
        #[arg(long, default_value = "default")]
        namespace: String,
        /// Container runtime socket
        #[arg(long, env = "PODCONFIG_RUNTIME_ENDPOINT", default_value = DEFAULT_RUNTIME_ENDPOINT)]
        runtime_endpoint: String,
    },
    /// Parse and validate a PodConfig manifest offline
    Validate {
        /// Path to the YAML manifest
        manifest: PathBuf,
    },
}

#[tokio::main]
async fn main() -> miette::Result<()> {
    let cli = Cli::parse();

    // Initialize tracing
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    if cli.log_json {
        tracing_subscriber::fmt().json().with_env_filter(filter).init();
    } else {
        tracing_subscriber::fmt().with_env_filter(filter).init();
    }

    match cli.command {
        Commands::Run {
            namespace,
            proc_root,
            runtime_endpoint,
            resync_secs,
            requeue_secs,
            sample_image,
            ip_binary,
        } => {
            let config = ControllerConfig {
                namespace,
                proc_root: proc_root.into(),
                runtime_endpoint,
                resync_interval: Duration::from_secs(resync_secs),
                requeue_after: Duration::from_secs(requeue_secs),
                sample_image,
                ip_binary,
            };
            run_controller(config).await
        }
        Commands::Inspect {
            container_ids,
            pod,
            namespace,
            runtime_endpoint,
        } => run_inspect(container_ids, pod, &namespace, &runtime_endpoint).await,
        Commands::Validate { manifest } => run_validate(&manifest),
    }
}

/// Wire the controller to the cluster, the container runtime and the kernel
async fn run_controller(config: ControllerConfig) -> miette::Result<()> {
    info!(
        "Starting podconfig controller (proc root: {}, runtime: {})",
        config.proc_root.display(),
        config.runtime_endpoint
    );

    let kube = Arc::new(KubeClient::try_default(config.sample_image.clone()).await?);
    let resolver = Arc::new(CriClient::new(&config.runtime_endpoint));
    let allocator = Arc::new(AddressAllocator::new());
    let netns = Arc::new(HostNetns::new(
        config.proc_root.clone(),
        IpLinks::new(config.ip_binary.clone()),
    ));
    let engine = Arc::new(AttachmentEngine::new(netns, allocator.clone()));

    let controller = PodConfigController::new(
        kube.clone(),
        kube.clone(),
        kube,
        resolver,
        engine,
        allocator,
        config,
    );

    let token = CancellationToken::new();
    let controller_token = token.clone();
    let controller_handle = tokio::spawn(async move {
        if let Err(e) = controller.run(controller_token).await {
            error!("PodConfig controller error: {}", e);
        }
    });

    tokio::signal::ctrl_c()
        .await
        .map_err(|e| miette::miette!("Failed to listen for ctrl-c: {}", e))?;

    info!("Shutting down podconfig controller...");
    token.cancel();

    if let Err(e) = controller_handle.await {
        error!("Controller task panicked: {}", e);
    }

    info!("Shutdown complete");
    Ok(())
}

/// Print the pid behind each container id
async fn run_inspect(
    container_ids: Vec<String>,
    pod: Option<String>,
    namespace: &str,
    runtime_endpoint: &str,
) -> miette::Result<()> {
    let container_ids = match pod {
        Some(pod) => {
            let kube = KubeClient::try_default(DEFAULT_SAMPLE_IMAGE).await?;
            let found = kube
                .get_pod(namespace, &pod)
                .await?
                .ok_or_else(|| miette::miette!("Pod {}/{} not found", namespace, pod))?;
            let id = primary_container_id(&found)
                .ok_or_else(|| miette::miette!("Pod {}/{} has no running container", namespace, pod))?;
            vec![id.to_string()]
        }
        None if container_ids.is_empty() => {
            return Err(miette::miette!("Pass container ids or --pod"));
        }
        None => container_ids,
    };

    let client = CriClient::new(runtime_endpoint);
    let results = client.resolve_pids(&container_ids).await?;
    for (id, result) in container_ids.iter().zip(results) {
        match result {
            Ok(pid) => println!("{}\t{}", id, pid),
            Err(e) => println!("{}\terror: {}", id, e),
        }
    }
    Ok(())
}

fn run_validate(manifest: &Path) -> miette::Result<()> {
    let podconfig = podconfig_core::load_manifest(manifest)?;
    println!(
        "{} is valid: {} attachment(s), {} VLAN(s), selector {}",
        podconfig.key(),
        podconfig.spec.network_attachments.len(),
        podconfig.spec.vlans.len(),
        podconfig.selector()?
    );
    Ok(())
}
