use std::time::Duration;

use crate::consts::{DEFAULT_ADMIN_PORT, DEFAULT_GPU_MAP_CONFIGMAP_NAME};

/// Runtime configuration for the controller. Assembled from CLI flags
/// (with environment variable fallbacks) by the `operator` binary, but
/// kept free of any `clap` dependency so it can be built directly by
/// tests and by other embedders.
#[derive(Debug, Clone)]
pub struct Config {
    /// The single namespace this controller instance serves.
    pub namespace: String,

    /// Per-GPU-slot maximum number of sleeping providers tolerated
    /// whenever an awake peer shares that slot. Enforced only at
    /// new-provider creation time.
    pub sleeper_limit: usize,

    /// Number of worker tasks draining the per-node work queue.
    pub num_workers: usize,

    /// If set, `/wake_up` is refused unless every assigned GPU's
    /// current memory usage (per `/accelerator-memory`) is at or
    /// below this many MiB.
    pub accelerator_sleeping_memory_limit_mib: Option<u64>,

    /// Name of the ConfigMap holding the GPU UUID -> index map.
    pub gpu_map_configmap_name: String,

    /// Timeout applied to every HTTP call this controller makes to
    /// the requester stub or to vLLM.
    pub http_timeout: Duration,

    /// Interval at which an inference server is re-probed even though
    /// nothing appears to have changed.
    pub probe_interval: Duration,

    /// Default admin port used when a requester omits the annotation.
    pub default_admin_port: String,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            namespace: "default".to_owned(),
            sleeper_limit: 2,
            num_workers: 4,
            accelerator_sleeping_memory_limit_mib: None,
            gpu_map_configmap_name: DEFAULT_GPU_MAP_CONFIGMAP_NAME.to_owned(),
            http_timeout: Duration::from_secs(5),
            probe_interval: Duration::from_secs(12),
            default_admin_port: DEFAULT_ADMIN_PORT.to_owned(),
        }
    }
}
