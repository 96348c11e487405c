use k8s_openapi::api::core::v1::Pod;
use kube::{
    api::{Patch, PatchParams},
    Api, Client,
};
use serde_json::{json, Value};
use vllm_dualpod_types::{Error, MANAGER_NAME};

/// Adds `name` to the Pod's finalizer list via a merge patch. A no-op
/// if the finalizer is already present. Does not check for the Pod's
/// existence first; a 404 surfaces as a normal `Error::KubeError`.
pub async fn add(client: Client, namespace: &str, pod: &str, name: &str) -> Result<Pod, Error> {
    let api: Api<Pod> = Api::namespaced(client, namespace);
    let current = api.get(pod).await?;
    let mut finalizers = current.metadata.finalizers.clone().unwrap_or_default();
    if finalizers.iter().any(|f| f == name) {
        return Ok(current);
    }
    finalizers.push(name.to_owned());
    let patch: Value = json!({ "metadata": { "finalizers": finalizers } });
    Ok(api
        .patch(
            pod,
            &PatchParams::apply(MANAGER_NAME),
            &Patch::Merge(&patch),
        )
        .await?)
}

/// Removes `name` from the Pod's finalizer list. A no-op if it's
/// already absent.
pub async fn remove(client: Client, namespace: &str, pod: &str, name: &str) -> Result<Pod, Error> {
    let api: Api<Pod> = Api::namespaced(client, namespace);
    let current = api.get(pod).await?;
    let finalizers: Vec<String> = current
        .metadata
        .finalizers
        .clone()
        .unwrap_or_default()
        .into_iter()
        .filter(|f| f != name)
        .collect();
    let patch: Value = json!({ "metadata": { "finalizers": finalizers } });
    Ok(api
        .patch(
            pod,
            &PatchParams::apply(MANAGER_NAME),
            &Patch::Merge(&patch),
        )
        .await?)
}

/// Returns true if `pod` carries the named finalizer.
pub fn has(pod: &Pod, name: &str) -> bool {
    pod.metadata
        .finalizers
        .as_ref()
        .map_or(false, |fs| fs.iter().any(|f| f == name))
}
