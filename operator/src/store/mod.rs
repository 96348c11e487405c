//! Read-through cache over the namespace's Pods, Nodes and gpu-map
//! ConfigMap, plus the three secondary indices over Pods described in
//! the reconciler design: bound-by-requester, by-fingerprint, by-slot.
//!
//! The cache itself is dumb: `kube::runtime::watcher`/`reflector`
//! streams are read by a single ingest task (see `main.rs`) that calls
//! `Store::ingest_pod`/`remove_pod`/etc. sequentially, so all mutation
//! is single-writer. Readers (the reconciler, running on N worker
//! tasks) only ever call the `&self` getters, which take a read lock.

pub mod categorize;

use std::collections::HashMap;
use std::sync::RwLock;

use k8s_openapi::api::core::v1::{ConfigMap, Node, Pod};

use crate::model::InferenceServerRef;
use categorize::{categorize, node_of_interest, Category};

/// One event's worth of enqueue instructions: which node (if any) got
/// a new inference-server reference to look at.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EnqueueHint {
    pub node: String,
    pub server_ref: InferenceServerRef,
}

#[derive(Default)]
struct Indices {
    /// requester uid -> bound provider pod names.
    bound_by_requester: HashMap<String, Vec<String>>,
    /// fingerprint hash -> unbound provider pod names, insertion order.
    by_fingerprint: HashMap<String, Vec<String>>,
    /// "<node> <gpu index>" -> unbound provider pod names.
    by_slot: HashMap<(String, u32), Vec<String>>,
}

impl Indices {
    fn remove_pod_everywhere(&mut self, name: &str) {
        for v in self.bound_by_requester.values_mut() {
            v.retain(|n| n != name);
        }
        self.bound_by_requester.retain(|_, v| !v.is_empty());
        for v in self.by_fingerprint.values_mut() {
            v.retain(|n| n != name);
        }
        self.by_fingerprint.retain(|_, v| !v.is_empty());
        for v in self.by_slot.values_mut() {
            v.retain(|n| n != name);
        }
        self.by_slot.retain(|_, v| !v.is_empty());
    }
}

pub struct Store {
    pods: RwLock<HashMap<String, Pod>>,
    nodes: RwLock<HashMap<String, Node>>,
    configmap: RwLock<Option<ConfigMap>>,
    indices: RwLock<Indices>,
}

impl Default for Store {
    fn default() -> Self {
        Store {
            pods: RwLock::new(HashMap::new()),
            nodes: RwLock::new(HashMap::new()),
            configmap: RwLock::new(None),
            indices: RwLock::new(Indices::default()),
        }
    }
}

impl Store {
    pub fn new() -> Self {
        Self::default()
    }

    /// Inserts or replaces a Pod in the cache, updates the secondary
    /// indices, and returns the enqueue hint (if any) this event
    /// implies. A provider's `by-fingerprint`/`by-slot` membership
    /// requires knowing its GPU indices and fingerprint annotation,
    /// which `categorize` alone cannot give us for `by_slot` (that
    /// needs `CUDA_VISIBLE_DEVICES` parsing done by the caller via
    /// `index_unbound_provider`); this method handles categorization,
    /// `bound_by_requester`, and node-of-interest enqueueing only.
    pub fn ingest_pod(&self, pod: Pod) -> Option<EnqueueHint> {
        let name = pod.metadata.name.clone().unwrap_or_default();
        let category = categorize(&pod);
        let node = node_of_interest(&pod, &category);

        let hint = match (&category, &node) {
            (Category::Requester(r), Some(n)) => Some(EnqueueHint {
                node: n.clone(),
                server_ref: r.clone(),
            }),
            (Category::BoundProvider(r), Some(n)) => Some(EnqueueHint {
                node: n.clone(),
                server_ref: r.clone(),
            }),
            _ => None,
        };

        {
            let mut indices = self.indices.write().unwrap();
            indices.remove_pod_everywhere(&name);
            if let Category::BoundProvider(r) = &category {
                indices
                    .bound_by_requester
                    .entry(r.uid.clone())
                    .or_default()
                    .push(name.clone());
            }
        }

        self.pods.write().unwrap().insert(name, pod);
        hint
    }

    /// Records the fingerprint/slot membership of an unbound provider.
    /// Called by the reconciler/ingest path after parsing
    /// `CUDA_VISIBLE_DEVICES` and the node selector, since `Store`
    /// itself does not know how to parse a CSV env var.
    pub fn index_unbound_provider(&self, name: &str, fingerprint: &str, node: &str, gpu_indices: &[u32]) {
        let mut indices = self.indices.write().unwrap();
        indices
            .by_fingerprint
            .entry(fingerprint.to_string())
            .or_default()
            .push(name.to_string());
        for idx in gpu_indices {
            indices
                .by_slot
                .entry((node.to_string(), *idx))
                .or_default()
                .push(name.to_string());
        }
    }

    /// Removes a Pod from the cache (watcher delivered a Deleted
    /// event). Returns the enqueue hint implied by its last known
    /// categorization, so the reconciler notices and cleans up.
    pub fn remove_pod(&self, pod: &Pod) -> Option<EnqueueHint> {
        let name = pod.metadata.name.clone().unwrap_or_default();
        let category = categorize(pod);
        let node = node_of_interest(pod, &category);

        self.indices.write().unwrap().remove_pod_everywhere(&name);
        self.pods.write().unwrap().remove(&name);

        match (&category, &node) {
            (Category::Requester(r), Some(n)) => Some(EnqueueHint {
                node: n.clone(),
                server_ref: r.clone(),
            }),
            (Category::BoundProvider(r), Some(n)) => Some(EnqueueHint {
                node: n.clone(),
                server_ref: r.clone(),
            }),
            _ => None,
        }
    }

    pub fn get_pod(&self, name: &str) -> Option<Pod> {
        self.pods.read().unwrap().get(name).cloned()
    }

    pub fn get_node(&self, name: &str) -> Option<Node> {
        self.nodes.read().unwrap().get(name).cloned()
    }

    pub fn insert_node(&self, node: Node) {
        if let Some(name) = node.metadata.name.clone() {
            self.nodes.write().unwrap().insert(name, node);
        }
    }

    pub fn remove_node(&self, name: &str) {
        self.nodes.write().unwrap().remove(name);
    }

    pub fn set_configmap(&self, cm: Option<ConfigMap>) {
        *self.configmap.write().unwrap() = cm;
    }

    pub fn get_configmap(&self) -> Option<ConfigMap> {
        self.configmap.read().unwrap().clone()
    }

    /// Providers currently bound to `requester_uid`. Per invariant I1
    /// this should have length ≤ 1; the reconciler treats >1 as a
    /// hard, non-retried error.
    pub fn bound_providers(&self, requester_uid: &str) -> Vec<Pod> {
        let names = self
            .indices
            .read()
            .unwrap()
            .bound_by_requester
            .get(requester_uid)
            .cloned()
            .unwrap_or_default();
        let pods = self.pods.read().unwrap();
        names.iter().filter_map(|n| pods.get(n).cloned()).collect()
    }

    /// Unbound providers sharing `fingerprint`, in stable insertion
    /// order (oldest indexed entry first), per the fingerprint
    /// tie-break decision in SPEC_FULL.md §9.
    pub fn sleepers_by_fingerprint(&self, fingerprint: &str) -> Vec<Pod> {
        let names = self
            .indices
            .read()
            .unwrap()
            .by_fingerprint
            .get(fingerprint)
            .cloned()
            .unwrap_or_default();
        let pods = self.pods.read().unwrap();
        names.iter().filter_map(|n| pods.get(n).cloned()).collect()
    }

    /// Unbound providers occupying `(node, gpu_index)`.
    pub fn sleepers_by_slot(&self, node: &str, gpu_index: u32) -> Vec<Pod> {
        let names = self
            .indices
            .read()
            .unwrap()
            .by_slot
            .get(&(node.to_string(), gpu_index))
            .cloned()
            .unwrap_or_default();
        let pods = self.pods.read().unwrap();
        names.iter().filter_map(|n| pods.get(n).cloned()).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use kube::core::ObjectMeta;
    use std::collections::BTreeMap;
    use vllm_dualpod_types::{ANNOTATION_REQUESTER, ANNOTATION_SERVER_PATCH, HOSTNAME_NODE_SELECTOR};

    fn requester_pod(uid: &str, name: &str, node: &str) -> Pod {
        let mut ann = BTreeMap::new();
        ann.insert(ANNOTATION_SERVER_PATCH.to_string(), "patch: {}".to_string());
        Pod {
            metadata: ObjectMeta {
                uid: Some(uid.into()),
                name: Some(name.into()),
                annotations: Some(ann),
                ..Default::default()
            },
            spec: Some(k8s_openapi::api::core::v1::PodSpec {
                node_name: Some(node.into()),
                ..Default::default()
            }),
            ..Default::default()
        }
    }

    fn bound_provider_pod(name: &str, requester_uid: &str, requester_name: &str, node: &str) -> Pod {
        let mut ann = BTreeMap::new();
        ann.insert(
            ANNOTATION_REQUESTER.to_string(),
            format!("{} {}", requester_uid, requester_name),
        );
        let mut sel = BTreeMap::new();
        sel.insert(HOSTNAME_NODE_SELECTOR.to_string(), node.to_string());
        Pod {
            metadata: ObjectMeta {
                uid: Some(format!("{}-uid", name)),
                name: Some(name.into()),
                annotations: Some(ann),
                ..Default::default()
            },
            spec: Some(k8s_openapi::api::core::v1::PodSpec {
                node_selector: Some(sel),
                ..Default::default()
            }),
            ..Default::default()
        }
    }

    #[test]
    fn ingest_requester_produces_enqueue_hint() {
        let store = Store::new();
        let hint = store.ingest_pod(requester_pod("uid-1", "req-1", "node-a"));
        let hint = hint.expect("requester should enqueue");
        assert_eq!(hint.node, "node-a");
        assert_eq!(hint.server_ref.uid, "uid-1");
        assert_eq!(hint.server_ref.name, "req-1");
    }

    #[test]
    fn ingest_bound_provider_indexes_by_requester() {
        let store = Store::new();
        store.ingest_pod(bound_provider_pod("prov-1", "uid-1", "req-1", "node-a"));
        let bound = store.bound_providers("uid-1");
        assert_eq!(bound.len(), 1);
        assert_eq!(bound[0].metadata.name.as_deref(), Some("prov-1"));
    }

    #[test]
    fn multiple_bound_providers_both_returned_for_hard_error_detection() {
        let store = Store::new();
        store.ingest_pod(bound_provider_pod("prov-1", "uid-1", "req-1", "node-a"));
        store.ingest_pod(bound_provider_pod("prov-2", "uid-1", "req-1", "node-a"));
        assert_eq!(store.bound_providers("uid-1").len(), 2);
    }

    #[test]
    fn remove_pod_clears_index() {
        let store = Store::new();
        let pod = bound_provider_pod("prov-1", "uid-1", "req-1", "node-a");
        store.ingest_pod(pod.clone());
        assert_eq!(store.bound_providers("uid-1").len(), 1);
        store.remove_pod(&pod);
        assert_eq!(store.bound_providers("uid-1").len(), 0);
        assert!(store.get_pod("prov-1").is_none());
    }

    #[test]
    fn unbound_provider_slot_and_fingerprint_index() {
        let store = Store::new();
        let mut pod = bound_provider_pod("sleeper-1", "unused", "unused", "node-a");
        pod.metadata.annotations.as_mut().unwrap().clear();
        store.ingest_pod(pod);
        store.index_unbound_provider("sleeper-1", "fp-abc", "node-a", &[0, 1]);

        let by_fp = store.sleepers_by_fingerprint("fp-abc");
        assert_eq!(by_fp.len(), 1);
        assert_eq!(by_fp[0].metadata.name.as_deref(), Some("sleeper-1"));

        assert_eq!(store.sleepers_by_slot("node-a", 0).len(), 1);
        assert_eq!(store.sleepers_by_slot("node-a", 1).len(), 1);
        assert_eq!(store.sleepers_by_slot("node-a", 2).len(), 0);
    }
}
