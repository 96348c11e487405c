use k8s_openapi::api::core::v1::ConfigMap;
use std::collections::HashMap;

/// Where a GPU UUID lives: which node it's attached to, and its index
/// on that node (the value that ends up in `CUDA_VISIBLE_DEVICES`).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GpuLocation {
    pub node: String,
    pub index: u32,
}

/// Immutable snapshot of the cluster's GPU UUID -> location map,
/// parsed from the `gpu-map` ConfigMap. Replaced atomically on every
/// change; never mutated in place, so a single read always sees one
/// consistent generation (P5).
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct GpuMap {
    locations: HashMap<String, GpuLocation>,
}

impl GpuMap {
    pub fn locate(&self, uuid: &str) -> Option<&GpuLocation> {
        self.locations.get(uuid)
    }

    pub fn is_empty(&self) -> bool {
        self.locations.is_empty()
    }

    pub fn len(&self) -> usize {
        self.locations.len()
    }

    /// Every UUID currently known to live on `node`, for the
    /// configmap-refresh "re-evaluate everything on this node" fan-out.
    pub fn uuids_on_node<'a>(&'a self, node: &'a str) -> impl Iterator<Item = &'a str> + 'a {
        self.locations
            .iter()
            .filter(move |(_, loc)| loc.node == node)
            .map(|(uuid, _)| uuid.as_str())
    }

    /// True if `self` (the new snapshot) has any UUID that `previous`
    /// didn't have, or that moved to a different node/index (§4.2:
    /// "additions... or UUIDs moved" re-trigger every known node, not
    /// just a pure size increase).
    pub fn added_or_moved_since(&self, previous: &GpuMap) -> bool {
        self.locations
            .iter()
            .any(|(uuid, loc)| previous.locations.get(uuid) != Some(loc))
    }

    /// All node names with at least one known GPU. Used to decide
    /// which per-node work sets get the "re-evaluate everything" fan-out
    /// when the map grows new entries.
    pub fn known_nodes(&self) -> impl Iterator<Item = &str> {
        let mut seen = std::collections::HashSet::new();
        self.locations.values().filter_map(move |loc| {
            if seen.insert(loc.node.clone()) {
                Some(loc.node.as_str())
            } else {
                None
            }
        })
    }
}

/// Parses the `gpu-map` ConfigMap into a [`GpuMap`] snapshot. Each data
/// entry's key is a node name; its value is JSON for `UUID -> index`.
/// Unparseable entries are skipped, their warning message returned
/// alongside the otherwise-valid snapshot; a missing ConfigMap (`None`)
/// produces an empty snapshot.
pub fn parse_gpu_map(cm: Option<&ConfigMap>) -> (GpuMap, Vec<String>) {
    let mut locations = HashMap::new();
    let mut warnings = Vec::new();

    let data = match cm.and_then(|cm| cm.data.as_ref()) {
        Some(data) => data,
        None => return (GpuMap { locations }, warnings),
    };

    for (node, raw) in data {
        let entry: HashMap<String, u32> = match serde_json::from_str(raw) {
            Ok(entry) => entry,
            Err(e) => {
                warnings.push(format!(
                    "gpu-map entry for node {} is not valid JSON: {}",
                    node, e
                ));
                continue;
            }
        };
        for (uuid, index) in entry {
            locations.insert(
                uuid,
                GpuLocation {
                    node: node.clone(),
                    index,
                },
            );
        }
    }

    (GpuMap { locations }, warnings)
}
