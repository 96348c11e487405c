//! Nominal-provider synthesis (§4.5): renders a requester's
//! `server-patch` template, strategic-merges it over a
//! de-individualized copy of the requester's podSpec, and stamps the
//! result with the bookkeeping this controller needs to recognize it
//! later (finalizer, `nominal`/`requester`/`accelerators` annotations,
//! `dual`/`sleeping` labels).

use std::collections::{BTreeMap, HashMap};

use k8s_openapi::api::core::v1::Pod;
use lazy_static::lazy_static;
use regex::Regex;
use serde_json::{json, Value};

use vllm_dualpod_types::{
    fingerprint, Error, ANNOTATION_ACCELERATORS, ANNOTATION_NOMINAL, ANNOTATION_REQUESTER,
    ANNOTATION_SERVER_PATCH, CUDA_VISIBLE_DEVICES_ENV, FINALIZER_PROVIDER, GPU_RESOURCE_NAME,
    HOSTNAME_NODE_SELECTOR, INFERENCE_SERVER_CONTAINER_NAME, KUBE_API_ACCESS_VOLUME_PREFIX,
    LABEL_DUAL, LABEL_SLEEPING,
};

use crate::model::InferenceServerRef;

lazy_static! {
    static ref TEMPLATE_VAR: Regex = Regex::new(r"\{\{\s*\.(\w+)\s*\}\}").unwrap();
}

/// Substitutes `{{ .Key }}` placeholders in `template` using `bindings`.
/// A placeholder naming a key absent from `bindings` is a hard error
/// (§4.5 step 1: "missing-key is a hard error").
fn render_template(template: &str, bindings: &HashMap<&str, String>) -> Result<String, Error> {
    let mut err = None;
    let rendered = TEMPLATE_VAR.replace_all(template, |caps: &regex::Captures| {
        let key = &caps[1];
        match bindings.get(key) {
            Some(value) => value.clone(),
            None => {
                err.get_or_insert_with(|| key.to_string());
                String::new()
            }
        }
    });
    if let Some(key) = err {
        return Err(Error::TemplateMissingKey(key));
    }
    Ok(rendered.into_owned())
}

/// Returns the strategic-merge-patch list key for a field name, or
/// `None` if the field isn't one of the well-known merge-by-key lists
/// (everything else replaces wholesale).
fn list_merge_key(field_name: &str) -> Option<&'static str> {
    match field_name {
        "containers" | "initContainers" | "volumes" | "env" => Some("name"),
        "ports" => Some("containerPort"),
        "volumeMounts" => Some("mountPath"),
        _ => None,
    }
}

/// Minimal strategic-merge-patch semantics: objects recurse key by
/// key; the well-known lists merge element-wise by their merge key;
/// everything else (scalars, unrecognized arrays) replaces wholesale.
fn strategic_merge(base: &mut Value, patch: Value) {
    match (base, patch) {
        (Value::Object(base_map), Value::Object(patch_map)) => {
            for (key, patch_value) in patch_map {
                match base_map.get_mut(&key) {
                    Some(existing) => {
                        if let Some(merge_key) = list_merge_key(&key) {
                            merge_keyed_list(existing, patch_value, merge_key);
                        } else {
                            strategic_merge(existing, patch_value);
                        }
                    }
                    None => {
                        base_map.insert(key, patch_value);
                    }
                }
            }
        }
        (base_slot, patch_value) => {
            *base_slot = patch_value;
        }
    }
}

fn merge_keyed_list(base: &mut Value, patch: Value, key_field: &str) {
    let patch_items = match patch {
        Value::Array(items) => items,
        other => {
            *base = other;
            return;
        }
    };
    let base_items = match base.as_array_mut() {
        Some(items) => items,
        None => {
            *base = Value::Array(patch_items);
            return;
        }
    };
    for patch_item in patch_items {
        let key_value = patch_item.get(key_field).cloned();
        let existing = key_value
            .as_ref()
            .and_then(|kv| base_items.iter_mut().find(|item| item.get(key_field) == Some(kv)));
        match existing {
            Some(existing_item) => strategic_merge(existing_item, patch_item),
            None => base_items.push(patch_item),
        }
    }
}

/// Strips the parts of a requester's podSpec that are specific to that
/// one Pod instance: ephemeral containers, and any
/// `kube-api-access-*` projected service-account volume plus its mount
/// references in every container (§4.5 step 2).
fn de_individualize(requester: &Pod) -> Value {
    let mut spec = requester
        .spec
        .as_ref()
        .map(|s| serde_json::to_value(s).unwrap_or(Value::Null))
        .unwrap_or(Value::Null);

    if let Value::Object(spec_map) = &mut spec {
        spec_map.remove("ephemeralContainers");

        let removed_volumes: Vec<String> = spec_map
            .get("volumes")
            .and_then(|v| v.as_array())
            .map(|vols| {
                vols.iter()
                    .filter_map(|v| v.get("name").and_then(|n| n.as_str()))
                    .filter(|name| name.starts_with(KUBE_API_ACCESS_VOLUME_PREFIX))
                    .map(|s| s.to_string())
                    .collect()
            })
            .unwrap_or_default();

        if let Some(Value::Array(vols)) = spec_map.get_mut("volumes") {
            vols.retain(|v| {
                v.get("name")
                    .and_then(|n| n.as_str())
                    .map(|name| !removed_volumes.iter().any(|r| r == name))
                    .unwrap_or(true)
            });
        }

        for field in ["containers", "initContainers"] {
            if let Some(Value::Array(containers)) = spec_map.get_mut(field) {
                for container in containers {
                    if let Some(Value::Array(mounts)) = container.get_mut("volumeMounts") {
                        mounts.retain(|m| {
                            m.get("name")
                                .and_then(|n| n.as_str())
                                .map(|name| !removed_volumes.iter().any(|r| r == name))
                                .unwrap_or(true)
                        });
                    }
                }
            }
        }
    }

    spec
}

fn find_container<'a>(spec: &'a mut Value, name: &str) -> Option<&'a mut Value> {
    spec.get_mut("containers")?
        .as_array_mut()?
        .iter_mut()
        .find(|c| c.get("name").and_then(|n| n.as_str()) == Some(name))
}

/// Reads the inference-server container's `readinessProbe.httpGet.port`
/// and resolves it to a numeric port (`"http"`/`"HTTP"` means 80).
fn discover_port(container: &Value) -> Result<u16, Error> {
    let port_value = container
        .pointer("/readinessProbe/httpGet/port")
        .ok_or_else(|| Error::InvalidNominalPod("inference-server container has no readinessProbe.httpGet.port".into()))?;

    if let Some(n) = port_value.as_u64() {
        return Ok(n as u16);
    }
    if let Some(s) = port_value.as_str() {
        if s.eq_ignore_ascii_case("http") {
            return Ok(80);
        }
        if let Ok(n) = s.parse::<u16>() {
            return Ok(n);
        }
    }
    Err(Error::InvalidNominalPod(format!(
        "unrecognized readinessProbe port value: {}",
        port_value
    )))
}

pub struct SynthesizedProvider {
    pub pod: Pod,
    pub fingerprint: String,
    pub admin_port: u16,
}

/// Builds the nominal provider Pod for `requester` on `node`, bound to
/// the given GPU UUIDs/indices (§4.5). Returns the Pod and its
/// fingerprint.
pub fn synthesize_nominal_provider(
    requester: &Pod,
    requester_ref: &InferenceServerRef,
    node: &str,
    gpu_uuids: &[String],
    gpu_indices: &[u32],
) -> Result<SynthesizedProvider, Error> {
    let raw_template = requester
        .metadata
        .annotations
        .as_ref()
        .and_then(|a| a.get(ANNOTATION_SERVER_PATCH))
        .ok_or_else(|| Error::InvalidNominalPod("requester is missing the server-patch annotation".into()))?;

    let mut bindings = HashMap::new();
    bindings.insert("NodeName", node.to_string());
    let rendered = render_template(raw_template, &bindings)?;

    let patch_yaml: serde_yaml::Value = serde_yaml::from_str(&rendered)?;
    let patch_json: Value = serde_json::to_value(&patch_yaml)?;

    let labels_json = requester
        .metadata
        .labels
        .as_ref()
        .map(|l| serde_json::to_value(l).unwrap_or_else(|_| json!({})))
        .unwrap_or_else(|| json!({}));
    let namespace_json = requester
        .metadata
        .namespace
        .clone()
        .map(Value::String)
        .unwrap_or(Value::Null);

    let mut spec_json = de_individualize(requester);
    strategic_merge(&mut spec_json, patch_json);

    // Canonicalize before any controller-owned stamping (node
    // selector, CUDA_VISIBLE_DEVICES, resource zeroing) so the
    // fingerprint is purely a function of the requester's authored
    // intent plus where/what it's been assigned.
    let canonical = json!({
        "labels": labels_json,
        "namespace": namespace_json,
        "spec": spec_json,
    });
    let hash = fingerprint(&canonical, gpu_indices, node);

    // Force the node selector.
    if !spec_json.is_object() {
        spec_json = json!({});
    }
    {
        let spec_map = spec_json.as_object_mut().unwrap();
        let selector = spec_map
            .entry("nodeSelector")
            .or_insert_with(|| json!({}));
        if !selector.is_object() {
            *selector = json!({});
        }
        selector
            .as_object_mut()
            .unwrap()
            .insert(HOSTNAME_NODE_SELECTOR.to_string(), Value::String(node.to_string()));
    }

    let container = find_container(&mut spec_json, INFERENCE_SERVER_CONTAINER_NAME)
        .ok_or_else(|| Error::InvalidNominalPod("no inference-server container in rendered podSpec".into()))?;

    let admin_port = discover_port(container)?;

    let cuda_value = gpu_indices
        .iter()
        .map(|i| i.to_string())
        .collect::<Vec<_>>()
        .join(",");
    set_env_var(container, CUDA_VISIBLE_DEVICES_ENV, &cuda_value);
    zero_gpu_resources(container);

    let mut metadata = json!({
        "generateName": format!("{}-dual-", requester_ref.name),
        "namespace": namespace_json,
        "labels": labels_json,
        "finalizers": [FINALIZER_PROVIDER],
        "annotations": {
            ANNOTATION_NOMINAL: hash,
            ANNOTATION_REQUESTER: requester_ref.to_annotation(),
            ANNOTATION_ACCELERATORS: gpu_uuids.join(","),
        },
    });
    if let Some(labels) = metadata.get_mut("labels").and_then(|l| l.as_object_mut()) {
        labels.insert(LABEL_DUAL.to_string(), Value::String(requester_ref.name.clone()));
        labels.insert(LABEL_SLEEPING.to_string(), Value::String("false".to_string()));
    }

    let pod_json = json!({
        "metadata": metadata,
        "spec": spec_json,
    });

    let pod: Pod = serde_json::from_value(pod_json.clone())?;
    reject_spurious_fields(&pod_json, &pod)?;

    Ok(SynthesizedProvider {
        pod,
        fingerprint: hash,
        admin_port,
    })
}

/// `k8s_openapi`'s generated types silently drop unrecognized JSON
/// keys instead of erroring (§4.5 step 9 calls for a strict decode).
/// Re-encodes the decoded Pod and walks it against the JSON that was
/// actually submitted: any key present in the input but absent from
/// the round-trip is a field that got silently swallowed, almost
/// always a typo in a user-authored `server-patch` template. `null`
/// values are skipped since they mean "unset" and routinely vanish on
/// round-trip (e.g. an absent `metadata.namespace`).
fn reject_spurious_fields(submitted: &Value, decoded: &Pod) -> Result<(), Error> {
    let reencoded = serde_json::to_value(decoded)?;
    let mut unknown = Vec::new();
    find_unknown_keys(submitted, &reencoded, "", &mut unknown);
    if !unknown.is_empty() {
        return Err(Error::InvalidNominalPod(format!(
            "server-patch template produced fields the Pod schema does not recognize: {}",
            unknown.join(", ")
        )));
    }
    Ok(())
}

fn find_unknown_keys(submitted: &Value, decoded: &Value, path: &str, out: &mut Vec<String>) {
    match submitted {
        Value::Object(smap) => {
            let dmap = decoded.as_object();
            for (key, value) in smap {
                if value.is_null() {
                    continue;
                }
                let child_path = if path.is_empty() { key.clone() } else { format!("{}.{}", path, key) };
                match dmap.and_then(|d| d.get(key)) {
                    Some(dvalue) => find_unknown_keys(value, dvalue, &child_path, out),
                    None => out.push(child_path),
                }
            }
        }
        Value::Array(sarr) => match decoded.as_array() {
            Some(darr) => {
                for (i, svalue) in sarr.iter().enumerate() {
                    let child_path = format!("{}[{}]", path, i);
                    match darr.get(i) {
                        Some(dvalue) => find_unknown_keys(svalue, dvalue, &child_path, out),
                        None => out.push(child_path),
                    }
                }
            }
            None => out.push(path.to_string()),
        },
        _ => {}
    }
}

fn set_env_var(container: &mut Value, name: &str, value: &str) {
    let container_map = match container.as_object_mut() {
        Some(m) => m,
        None => return,
    };
    let env = container_map.entry("env").or_insert_with(|| json!([]));
    if !env.is_array() {
        *env = json!([]);
    }
    let env_arr = env.as_array_mut().unwrap();
    if let Some(existing) = env_arr
        .iter_mut()
        .find(|e| e.get("name").and_then(|n| n.as_str()) == Some(name))
    {
        existing["value"] = Value::String(value.to_string());
    } else {
        env_arr.push(json!({"name": name, "value": value}));
    }
}

fn zero_gpu_resources(container: &mut Value) {
    let container_map = match container.as_object_mut() {
        Some(m) => m,
        None => return,
    };
    let resources = container_map.entry("resources").or_insert_with(|| json!({}));
    if !resources.is_object() {
        *resources = json!({});
    }
    let resources_map = resources.as_object_mut().unwrap();
    for field in ["limits", "requests"] {
        let entry = resources_map.entry(field).or_insert_with(|| json!({}));
        if !entry.is_object() {
            *entry = json!({});
        }
        entry
            .as_object_mut()
            .unwrap()
            .insert(GPU_RESOURCE_NAME.to_string(), Value::String("0".to_string()));
    }
}
