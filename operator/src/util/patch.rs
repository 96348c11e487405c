use k8s_openapi::api::core::v1::Pod;
use kube::{
    api::{Patch, PatchParams},
    Api, Client,
};
use serde_json::{json, Value};
use std::collections::BTreeMap;
use vllm_dualpod_types::{Error, ANNOTATION_STATUS, MANAGER_NAME};

/// Merge-patches a Pod's annotations. A `None` value deletes the key.
pub async fn patch_annotations(
    client: Client,
    namespace: &str,
    pod: &str,
    annotations: BTreeMap<String, Option<String>>,
) -> Result<Pod, Error> {
    let api: Api<Pod> = Api::namespaced(client, namespace);
    let patch: Value = json!({ "metadata": { "annotations": annotations } });
    Ok(api
        .patch(
            pod,
            &PatchParams::apply(MANAGER_NAME),
            &Patch::Merge(&patch),
        )
        .await?)
}

/// Merge-patches a Pod's labels. A `None` value deletes the key.
pub async fn patch_labels(
    client: Client,
    namespace: &str,
    pod: &str,
    labels: BTreeMap<String, Option<String>>,
) -> Result<Pod, Error> {
    let api: Api<Pod> = Api::namespaced(client, namespace);
    let patch: Value = json!({ "metadata": { "labels": labels } });
    Ok(api
        .patch(
            pod,
            &PatchParams::apply(MANAGER_NAME),
            &Patch::Merge(&patch),
        )
        .await?)
}

/// Overwrites the requester's `status` annotation with the given
/// error list. This is the only user-visible error surface the
/// controller has (see error handling design, §7).
pub async fn set_status_errors(
    client: Client,
    namespace: &str,
    pod: &str,
    errors: &[String],
) -> Result<Pod, Error> {
    let body = serde_json::to_string(&json!({ "errors": errors }))?;
    let mut annotations = BTreeMap::new();
    annotations.insert(ANNOTATION_STATUS.to_owned(), Some(body));
    patch_annotations(client, namespace, pod, annotations).await
}
