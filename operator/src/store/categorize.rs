use k8s_openapi::api::core::v1::Pod;
use vllm_dualpod_types::{ANNOTATION_NOMINAL, ANNOTATION_REQUESTER, ANNOTATION_SERVER_PATCH, HOSTNAME_NODE_SELECTOR};

use crate::model::InferenceServerRef;

/// Result of categorizing one Pod against the annotations it carries.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Category {
    /// Carries `server-patch`: a requester. `ref` is keyed by its own
    /// uid/name.
    Requester(InferenceServerRef),

    /// Carries a well-formed `requester` annotation: a bound provider.
    /// `ref` identifies the requester it's bound to, not itself.
    BoundProvider(InferenceServerRef),

    /// Carries only `nominal`: a sleeper candidate, picked up through
    /// the by-fingerprint index rather than a direct ref.
    UnboundProvider,

    /// Neither annotation, or a malformed `requester` value.
    DontCare,
}

pub fn categorize(pod: &Pod) -> Category {
    let annotations = pod.metadata.annotations.as_ref();

    let has = |key: &str| annotations.and_then(|a| a.get(key)).is_some();

    if has(ANNOTATION_SERVER_PATCH) {
        let uid = pod.metadata.uid.clone().unwrap_or_default();
        let name = pod.metadata.name.clone().unwrap_or_default();
        return Category::Requester(InferenceServerRef::new(uid, name));
    }

    if let Some(value) = annotations.and_then(|a| a.get(ANNOTATION_REQUESTER)) {
        return match InferenceServerRef::parse_annotation(value) {
            Some(r) => Category::BoundProvider(r),
            None => Category::DontCare,
        };
    }

    if has(ANNOTATION_NOMINAL) {
        return Category::UnboundProvider;
    }

    Category::DontCare
}

/// The node a Pod's categorization cares about: `spec.nodeName` for a
/// requester, the `kubernetes.io/hostname` nodeSelector entry for a
/// provider. `None` if neither is set yet (not yet scheduled).
pub fn node_of_interest(pod: &Pod, category: &Category) -> Option<String> {
    match category {
        Category::Requester(_) => pod.spec.as_ref().and_then(|s| s.node_name.clone()),
        Category::BoundProvider(_) | Category::UnboundProvider => pod
            .spec
            .as_ref()
            .and_then(|s| s.node_selector.as_ref())
            .and_then(|ns| ns.get(HOSTNAME_NODE_SELECTOR))
            .cloned(),
        Category::DontCare => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;

    fn pod_with_annotations(annotations: Vec<(&str, &str)>) -> Pod {
        let mut map = BTreeMap::new();
        for (k, v) in annotations {
            map.insert(k.to_string(), v.to_string());
        }
        Pod {
            metadata: kube::core::ObjectMeta {
                uid: Some("u1".into()),
                name: Some("n1".into()),
                annotations: Some(map),
                ..Default::default()
            },
            ..Default::default()
        }
    }

    #[test]
    fn requester_wins_over_other_annotations() {
        let pod = pod_with_annotations(vec![(ANNOTATION_SERVER_PATCH, "x")]);
        assert!(matches!(categorize(&pod), Category::Requester(_)));
    }

    #[test]
    fn bound_provider_parses_ref() {
        let pod = pod_with_annotations(vec![(ANNOTATION_REQUESTER, "abc-uid my-req")]);
        match categorize(&pod) {
            Category::BoundProvider(r) => {
                assert_eq!(r.uid, "abc-uid");
                assert_eq!(r.name, "my-req");
            }
            other => panic!("expected BoundProvider, got {:?}", other),
        }
    }

    #[test]
    fn malformed_requester_annotation_is_dont_care() {
        let pod = pod_with_annotations(vec![(ANNOTATION_REQUESTER, "no-space-here")]);
        assert_eq!(categorize(&pod), Category::DontCare);
    }

    #[test]
    fn nominal_only_is_unbound_provider() {
        let pod = pod_with_annotations(vec![(ANNOTATION_NOMINAL, "aGFzaA==")]);
        assert_eq!(categorize(&pod), Category::UnboundProvider);
    }

    #[test]
    fn no_annotations_is_dont_care() {
        let pod = pod_with_annotations(vec![]);
        assert_eq!(categorize(&pod), Category::DontCare);
    }
}
