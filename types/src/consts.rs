//! Well-known annotation, label and finalizer names, plus the other
//! string/const constants the reconciler and its tests agree on.

/// Domain prefix shared by every annotation, label and finalizer this
/// controller reads or writes.
pub const DOMAIN: &str = "actuator.vllm.dev";

/// Finalizer placed on provider Pods. Present exactly while a provider
/// is bound or while the controller has not yet observed its deletion.
pub const FINALIZER_PROVIDER: &str = "actuator.vllm.dev/provider";

/// Finalizer placed on requester Pods. Present iff the inference-server
/// container of the bound provider is currently Running.
pub const FINALIZER_REQUESTER: &str = "actuator.vllm.dev/requester";

/// Annotation on a requester Pod carrying the strategic-merge-patch
/// template (YAML) used to synthesize its provider.
pub const ANNOTATION_SERVER_PATCH: &str = "actuator.vllm.dev/server-patch";

/// Annotation on a requester Pod naming the TCP port of its admin stub.
/// Defaults to [`DEFAULT_ADMIN_PORT`] when absent.
pub const ANNOTATION_ADMIN_PORT: &str = "actuator.vllm.dev/admin-port";

/// Annotation on a provider Pod recording its binding: `"<uid> <name>"`
/// of the requester it is bound to. Presence implies bound.
pub const ANNOTATION_REQUESTER: &str = "actuator.vllm.dev/requester";

/// Annotation on a provider Pod recording the base64 fingerprint hash
/// of its nominal configuration. Only meaningful on unbound providers.
pub const ANNOTATION_NOMINAL: &str = "actuator.vllm.dev/nominal";

/// Annotation listing the comma-joined GPU UUIDs assigned to a pod,
/// written on both requesters and providers.
pub const ANNOTATION_ACCELERATORS: &str = "actuator.vllm.dev/accelerators";

/// Annotation on a requester Pod surfacing `{"errors":[...]}`, the only
/// user-visible error channel this controller has.
pub const ANNOTATION_STATUS: &str = "actuator.vllm.dev/status";

/// Label on a provider Pod mirroring whether its vLLM instance is
/// currently asleep. One of `"true"` / `"false"`.
pub const LABEL_SLEEPING: &str = "actuator.vllm.dev/sleeping";

/// Label naming the counterpart Pod of a bound pair. FYI only; never
/// read back by the reconciler.
pub const LABEL_DUAL: &str = "actuator.vllm.dev/dual";

/// Default value of [`ANNOTATION_ADMIN_PORT`] when the requester
/// doesn't specify one. This default is load-bearing: changing it is
/// a breaking change for any requester that relies on it implicitly.
pub const DEFAULT_ADMIN_PORT: &str = "8080";

/// Well-known name of the container running the inference server
/// within both the requester and provider podspecs.
pub const INFERENCE_SERVER_CONTAINER_NAME: &str = "inference-server";

/// Name of the environment variable listing the GPU indices assigned
/// to a provider's inference-server container.
pub const CUDA_VISIBLE_DEVICES_ENV: &str = "CUDA_VISIBLE_DEVICES";

/// Device-plugin resource name defeated (set to zero) on every
/// synthesized provider Pod.
pub const GPU_RESOURCE_NAME: &str = "nvidia.com/gpu";

/// Node-selector key used to pin a provider to the requester's node.
pub const HOSTNAME_NODE_SELECTOR: &str = "kubernetes.io/hostname";

/// Prefix of the projected service-account token volumes that are
/// stripped when de-individualizing a requester's podSpec.
pub const KUBE_API_ACCESS_VOLUME_PREFIX: &str = "kube-api-access-";

/// Default name of the ConfigMap holding the GPU UUID -> index map.
pub const DEFAULT_GPU_MAP_CONFIGMAP_NAME: &str = "gpu-map";

/// `fieldManager` stamped on every write this controller makes, so
/// oldest-sleeper selection can distinguish its own edits.
pub const MANAGER_NAME: &str = "vllm-dualpod-operator";
