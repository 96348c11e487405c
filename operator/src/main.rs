use std::time::Duration;

use clap::Parser;
use kube::client::Client;
use vllm_dualpod_types::Config;

mod gpumap;
mod http;
mod model;
mod queue;
mod reconcile;
mod store;
mod util;

#[cfg(feature = "metrics")]
mod metrics;

/// Top-level CLI configuration for the binary. Any command line flags
/// should go in here.
#[derive(Parser)]
#[command(author, version, about, long_about = None)]
#[command(propagate_version = true)]
struct Cli {
    /// Namespace this controller instance serves. It does not watch
    /// across namespaces since requester/provider pairing is always
    /// within one namespace (§2).
    #[arg(long, env = "NAMESPACE", default_value = "default")]
    namespace: String,

    /// Per-GPU-slot maximum number of sleeping providers tolerated
    /// whenever an awake peer shares that slot.
    #[arg(long, env = "SLEEPER_LIMIT", default_value_t = 2)]
    sleeper_limit: usize,

    /// Number of worker tasks draining the per-node work queue.
    #[arg(long, env = "NUM_WORKERS", default_value_t = 4)]
    num_workers: usize,

    /// Refuse to wake a sleeping provider unless every assigned GPU's
    /// memory usage is at or below this many MiB. Unset disables the
    /// check.
    #[arg(long, env = "ACCELERATOR_SLEEPING_MEMORY_LIMIT_MIB")]
    accelerator_sleeping_memory_limit_mib: Option<u64>,

    /// Name of the ConfigMap holding the GPU UUID -> index map.
    #[arg(long, env = "GPU_MAP_CONFIGMAP_NAME", default_value = "gpu-map")]
    gpu_map_configmap_name: String,

    /// Timeout applied to every HTTP call made to a requester stub or
    /// to vLLM.
    #[arg(long, env = "HTTP_TIMEOUT", default_value = "5s", value_parser = parse_duration::parse)]
    http_timeout: Duration,

    /// Interval at which an inference server is re-probed even though
    /// nothing appears to have changed.
    #[arg(long, env = "PROBE_INTERVAL", default_value = "12s", value_parser = parse_duration::parse)]
    probe_interval: Duration,

    /// Default admin port used when a requester omits the annotation.
    #[arg(long, env = "DEFAULT_ADMIN_PORT", default_value = "8080")]
    default_admin_port: String,

    /// Prometheus metrics server scrape port. Disabled by default.
    #[cfg(feature = "metrics")]
    #[arg(long, env = "METRICS_PORT")]
    metrics_port: Option<u16>,
}

impl From<Cli> for Config {
    fn from(cli: Cli) -> Self {
        Config {
            namespace: cli.namespace,
            sleeper_limit: cli.sleeper_limit,
            num_workers: cli.num_workers,
            accelerator_sleeping_memory_limit_mib: cli.accelerator_sleeping_memory_limit_mib,
            gpu_map_configmap_name: cli.gpu_map_configmap_name,
            http_timeout: cli.http_timeout,
            probe_interval: cli.probe_interval,
            default_admin_port: cli.default_admin_port,
        }
    }
}

/// Secondary entrypoint that runs the reconciler to completion (which
/// should never happen outside of an unrecoverable watch error).
async fn run(client: Client) {
    let cli = Cli::parse();

    #[cfg(feature = "metrics")]
    if let Some(metrics_port) = cli.metrics_port {
        tokio::spawn(metrics::run_server(metrics_port));
    }

    let config: Config = cli.into();
    reconcile::run(client, config).await.unwrap();

    panic!("exited unexpectedly");
}

/// Main entrypoint that sets up the environment before running the
/// secondary entrypoint `run`.
#[tokio::main]
async fn main() {
    // Set the panic hook to exit the process with a non-zero exit code
    // when a panic occurs on any thread. This is desired behavior when
    // running in a container, as the reconciler or metrics server may
    // panic and we always want to restart the container in that case.
    let default_panic = std::panic::take_hook();
    std::panic::set_hook(Box::new(move |info| {
        default_panic(info);
        std::process::exit(1);
    }));

    // Create a kubernetes client using the default configuration.
    // In-cluster, the kubeconfig will be set by the service account.
    let client: Client = Client::try_default()
        .await
        .expect("Expected a valid KUBECONFIG environment variable.");

    run(client).await;

    // This is an unreachable branch. The reconciler should never exit
    // without a panic.
    panic!("exited prematurely");
}
