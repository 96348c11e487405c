//! Keeps the parsed `GpuMap` behind an atomic pointer so reconciler
//! passes always see one consistent snapshot, even if a refresh lands
//! mid-pass (§4.2). Refreshing is cheap enough to redo wholesale on
//! every ConfigMap event rather than diffing.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, RwLock};

use k8s_openapi::api::core::v1::ConfigMap;
use vllm_dualpod_types::{parse_gpu_map, GpuMap};

/// Published GPU-map snapshot plus a generation counter so callers can
/// detect growth without diffing the map contents themselves.
pub struct GpuMapProjection {
    current: RwLock<Arc<GpuMap>>,
    generation: AtomicUsize,
}

impl Default for GpuMapProjection {
    fn default() -> Self {
        GpuMapProjection {
            current: RwLock::new(Arc::new(GpuMap::default())),
            generation: AtomicUsize::new(0),
        }
    }
}

impl GpuMapProjection {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn snapshot(&self) -> Arc<GpuMap> {
        self.current.read().unwrap().clone()
    }

    pub fn generation(&self) -> usize {
        self.generation.load(Ordering::SeqCst)
    }

    /// Reparses `cm` and publishes the new snapshot. Returns `true` if
    /// any UUID is new or moved to a different node/index, the signal
    /// that triggers re-enqueuing every known node (§4.2).
    pub fn refresh(&self, cm: Option<&ConfigMap>) -> (bool, Vec<String>) {
        let (new_map, warnings) = parse_gpu_map(cm);
        let grew = {
            let current = self.current.read().unwrap();
            new_map.added_or_moved_since(&current)
        };
        *self.current.write().unwrap() = Arc::new(new_map);
        self.generation.fetch_add(1, Ordering::SeqCst);
        (grew, warnings)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;

    fn cm_with(node: &str, entries: &str) -> ConfigMap {
        let mut data = BTreeMap::new();
        data.insert(node.to_string(), entries.to_string());
        ConfigMap {
            data: Some(data),
            ..Default::default()
        }
    }

    #[test]
    fn empty_to_populated_is_growth() {
        let proj = GpuMapProjection::new();
        let cm = cm_with("node-a", r#"{"uuid-1":0,"uuid-2":1}"#);
        let (grew, warnings) = proj.refresh(Some(&cm));
        assert!(grew);
        assert!(warnings.is_empty());
        assert_eq!(proj.snapshot().len(), 2);
    }

    #[test]
    fn shrinking_is_not_growth() {
        let proj = GpuMapProjection::new();
        let cm_big = cm_with("node-a", r#"{"uuid-1":0,"uuid-2":1}"#);
        proj.refresh(Some(&cm_big));

        let cm_small = cm_with("node-a", r#"{"uuid-1":0}"#);
        let (grew, _) = proj.refresh(Some(&cm_small));
        assert!(!grew);
        assert_eq!(proj.snapshot().len(), 1);
    }

    #[test]
    fn moved_uuid_counts_as_growth_even_at_same_size() {
        let proj = GpuMapProjection::new();
        let cm_before = cm_with("node-a", r#"{"uuid-1":0}"#);
        proj.refresh(Some(&cm_before));

        let cm_moved = cm_with("node-b", r#"{"uuid-1":0}"#);
        let (grew, _) = proj.refresh(Some(&cm_moved));
        assert!(grew, "a UUID moving to a different node must still trigger re-evaluation");
    }

    #[test]
    fn generation_advances_on_every_refresh() {
        let proj = GpuMapProjection::new();
        assert_eq!(proj.generation(), 0);
        proj.refresh(None);
        assert_eq!(proj.generation(), 1);
        proj.refresh(None);
        assert_eq!(proj.generation(), 2);
    }
}
