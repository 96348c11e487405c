//! Sleeper-budget enforcement (§4.4 rule 10, §7, P4): caps the number
//! of sleeping providers occupying one `{node, gpu index}` slot,
//! deleting the oldest excess sleepers first.

use chrono::{DateTime, TimeZone, Utc};
use k8s_openapi::api::core::v1::Pod;

use vllm_dualpod_types::MANAGER_NAME;

/// The timestamp used to order sleepers for eviction: the time of this
/// controller's own managed-fields entry if present (so eviction order
/// reflects when *this controller* touched the object, not an
/// exogenous edit), falling back to the object's creation timestamp.
fn ordering_timestamp(pod: &Pod) -> Option<DateTime<Utc>> {
    let from_managed_fields = pod.metadata.managed_fields.as_ref().and_then(|entries| {
        entries
            .iter()
            .find(|e| e.manager.as_deref() == Some(MANAGER_NAME))
            .and_then(|e| e.time.as_ref())
            .map(|t| t.0)
    });
    from_managed_fields.or_else(|| pod.metadata.creation_timestamp.as_ref().map(|t| t.0))
}

/// Returns the pods (in ascending, i.e. oldest-first, order) that
/// should be deleted so that at most `limit` sleepers remain in
/// `sleepers`. Ties break lexicographically by name.
pub fn select_eviction_candidates(sleepers: &[Pod], limit: usize) -> Vec<Pod> {
    if sleepers.len() <= limit {
        return Vec::new();
    }

    let mut sorted: Vec<&Pod> = sleepers.iter().collect();
    sorted.sort_by(|a, b| {
        let ta = ordering_timestamp(a);
        let tb = ordering_timestamp(b);
        ta.cmp(&tb).then_with(|| {
            let na = a.metadata.name.as_deref().unwrap_or("");
            let nb = b.metadata.name.as_deref().unwrap_or("");
            na.cmp(nb)
        })
    });

    let excess = sorted.len() - limit;
    sorted.into_iter().take(excess).cloned().collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::{ManagedFieldsEntry, Time};
    use kube::core::ObjectMeta;

    fn pod_with_time(name: &str, manager: &str, seconds: i64) -> Pod {
        let time = Time(Utc.timestamp_opt(seconds, 0).unwrap());
        Pod {
            metadata: ObjectMeta {
                name: Some(name.to_string()),
                managed_fields: Some(vec![ManagedFieldsEntry {
                    manager: Some(manager.to_string()),
                    time: Some(time),
                    ..Default::default()
                }]),
                ..Default::default()
            },
            ..Default::default()
        }
    }

    #[test]
    fn no_eviction_needed_under_limit() {
        let pods = vec![pod_with_time("a", MANAGER_NAME, 1), pod_with_time("b", MANAGER_NAME, 2)];
        assert!(select_eviction_candidates(&pods, 2).is_empty());
    }

    #[test]
    fn evicts_oldest_first() {
        let pods = vec![
            pod_with_time("newest", MANAGER_NAME, 300),
            pod_with_time("oldest", MANAGER_NAME, 100),
            pod_with_time("middle", MANAGER_NAME, 200),
        ];
        let evicted = select_eviction_candidates(&pods, 1);
        assert_eq!(evicted.len(), 2);
        assert_eq!(evicted[0].metadata.name.as_deref(), Some("oldest"));
        assert_eq!(evicted[1].metadata.name.as_deref(), Some("middle"));
    }

    #[test]
    fn ties_break_by_name() {
        let pods = vec![pod_with_time("zebra", MANAGER_NAME, 100), pod_with_time("alpha", MANAGER_NAME, 100)];
        let evicted = select_eviction_candidates(&pods, 0);
        assert_eq!(evicted[0].metadata.name.as_deref(), Some("alpha"));
        assert_eq!(evicted[1].metadata.name.as_deref(), Some("zebra"));
    }

    #[test]
    fn falls_back_to_creation_timestamp_without_managed_fields() {
        let older = Pod {
            metadata: ObjectMeta {
                name: Some("no-managed-fields".to_string()),
                creation_timestamp: Some(Time(Utc.timestamp_opt(50, 0).unwrap())),
                ..Default::default()
            },
            ..Default::default()
        };
        let newer = pod_with_time("has-managed-fields", MANAGER_NAME, 9_999);
        let evicted = select_eviction_candidates(&[older, newer], 1);
        assert_eq!(evicted.len(), 1);
        assert_eq!(evicted[0].metadata.name.as_deref(), Some("no-managed-fields"));
    }
}
