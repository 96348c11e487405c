/// Status message recorded whenever a requester's Pod has not yet
/// been assigned an IP address by the kubelet.
pub const NO_IP_ASSIGNED: &str = "Requester Pod has not been assigned an IP address yet.";

/// Status message recorded when the requester stub could not be
/// reached to discover accelerators.
pub const ACCELERATORS_UNREACHABLE: &str = "Failed to reach requester stub for /accelerators.";

/// Status message recorded when the requester stub returned an empty
/// accelerator list.
pub const NO_ACCELERATORS: &str = "Requester stub reported zero accelerators.";

/// Status message recorded when a discovered GPU UUID has no entry
/// in the current gpu-map, or resolves to a different node.
pub const ACCELERATOR_NOT_IN_MAP: &str =
    "One or more accelerators are not present in the gpu-map for this node.";
