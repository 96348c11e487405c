use std::collections::HashSet;

/// Identifies one inference server: the requester Pod's UID and name.
/// This is the key the reconciler, the work queue, and the in-memory
/// `InferenceServer` map all agree on — never a provider's own
/// identity, since a provider only exists in relation to the
/// requester it is (or was) bound to.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct InferenceServerRef {
    pub uid: String,
    pub name: String,
}

impl InferenceServerRef {
    pub fn new(uid: impl Into<String>, name: impl Into<String>) -> Self {
        InferenceServerRef {
            uid: uid.into(),
            name: name.into(),
        }
    }

    /// Renders the annotation value written on a bound provider:
    /// `"<uid> <name>"`.
    pub fn to_annotation(&self) -> String {
        format!("{} {}", self.uid, self.name)
    }

    /// Parses the `requester` annotation value back into a ref. The
    /// format is whitespace-separated `<uid> <name>`; anything else is
    /// considered malformed (don't-care categorization).
    pub fn parse_annotation(value: &str) -> Option<Self> {
        let mut parts = value.splitn(2, ' ');
        let uid = parts.next()?;
        let name = parts.next()?;
        if uid.is_empty() || name.is_empty() {
            return None;
        }
        Some(InferenceServerRef::new(uid, name))
    }
}

/// In-memory state the reconciler accumulates across passes for one
/// inference server. None of this is authoritative — if it disagrees
/// with what's in the cache, the cache wins and this gets overwritten.
/// Used only to avoid redundant HTTP calls and writes (§5: "in-memory
/// flags ... used only to avoid redundant writes, never as
/// authoritative state").
#[derive(Debug, Clone, Default)]
pub struct InferenceServer {
    /// GPU UUIDs discovered via the requester stub's `/accelerators`.
    pub gpu_uuids: Option<Vec<String>>,

    /// The GPU UUIDs translated through the gpu-map into indices, in
    /// the same order as `gpu_uuids`.
    pub gpu_indices: Option<Vec<u32>>,

    /// Last observed `is_sleeping` value of the bound provider's vLLM,
    /// to avoid polling `/is_sleeping` every pass.
    pub sleeping: Option<bool>,

    /// The inference-server container's own HTTP port, discovered once
    /// from its `readinessProbe.httpGet.port` at synthesis/bind time.
    /// Distinct from the requester's `admin-port` annotation, which
    /// addresses the sidecar stub, not vLLM itself.
    pub vllm_port: Option<u16>,

    /// Last readiness value successfully relayed to the requester
    /// stub, so the relay only fires on transitions (§4.6).
    pub readiness_relayed: Option<bool>,

    /// Set once the controller has asked the API to delete the
    /// requester, to avoid issuing the delete call again every pass.
    pub requester_delete_requested: bool,
}

/// Per-node in-memory structure: the map of inference servers this
/// controller is tracking on the node, and the pending work set the
/// scheduler (`queue` module) drains. Construction is lazy; an entry
/// is never removed once created (§3: "never deleted").
#[derive(Debug, Default)]
pub struct NodeServers {
    pub servers: std::collections::HashMap<InferenceServerRef, InferenceServer>,
}

/// A unit of work handed to a worker by the FIFO queue.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WorkItem {
    /// Reconcile the pending inference-server references on this node.
    Node(String),

    /// The gpu-map ConfigMap changed; refresh the projection.
    ConfigMap,

    /// All objects from the initial list/watch sync have been
    /// delivered. Lets the worker pool stage one-time startup work.
    Sentinel,
}

/// Computes the set of `InferenceServerRef`s this controller currently
/// knows about on `node`, for the "gpu-map grew" fan-out (§4.2).
pub fn refs_on_node(servers: &NodeServers) -> HashSet<InferenceServerRef> {
    servers.servers.keys().cloned().collect()
}
