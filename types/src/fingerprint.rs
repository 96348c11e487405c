use base64::{engine::general_purpose::STANDARD, Engine as _};
use serde_json::Value;
use sha2::{Digest, Sha256};

/// Computes the nominal-provider fingerprint: the base64 of SHA-256
/// over the canonicalized JSON of the rendered/de-individualized
/// requester state, followed by the literal
/// `;gpus=<i1,i2,...>;node=<nodeName>`.
///
/// `canonical` must already have its object keys in a stable order —
/// `serde_json::Value`'s `Map` is a `BTreeMap` by default in this
/// workspace, so `to_string()` on a `Value` built from `serde_json`
/// parsing is already canonical; this function does not re-sort.
pub fn fingerprint(canonical: &Value, gpu_indices: &[u32], node: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(canonical.to_string().as_bytes());
    hasher.update(b";gpus=");
    let indices = gpu_indices
        .iter()
        .map(|i| i.to_string())
        .collect::<Vec<_>>()
        .join(",");
    hasher.update(indices.as_bytes());
    hasher.update(b";node=");
    hasher.update(node.as_bytes());
    STANDARD.encode(hasher.finalize())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn deterministic_for_same_input() {
        let v = json!({"a": 1, "b": "x"});
        let f1 = fingerprint(&v, &[0, 1], "n1");
        let f2 = fingerprint(&v, &[0, 1], "n1");
        assert_eq!(f1, f2);
    }

    #[test]
    fn differs_on_gpu_indices() {
        let v = json!({"a": 1});
        let f1 = fingerprint(&v, &[0], "n1");
        let f2 = fingerprint(&v, &[1], "n1");
        assert_ne!(f1, f2);
    }

    #[test]
    fn differs_on_node() {
        let v = json!({"a": 1});
        let f1 = fingerprint(&v, &[0], "n1");
        let f2 = fingerprint(&v, &[0], "n2");
        assert_ne!(f1, f2);
    }

    #[test]
    fn differs_on_spec_value() {
        let f1 = fingerprint(&json!({"a": 1}), &[0], "n1");
        let f2 = fingerprint(&json!({"a": 2}), &[0], "n1");
        assert_ne!(f1, f2);
    }

    #[test]
    fn gpu_index_boundary_does_not_collide_with_separator() {
        // [1, 23] must not fingerprint the same as [12, 3]: the comma
        // join prevents digit-concatenation collisions.
        let f1 = fingerprint(&json!({}), &[1, 23], "n1");
        let f2 = fingerprint(&json!({}), &[12, 3], "n1");
        assert_ne!(f1, f2);
    }
}
