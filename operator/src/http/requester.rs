//! Client for the requester sidecar's admin stub.

use std::collections::HashMap;

use vllm_dualpod_types::Error;

/// `GET http://<ip>:<port>/accelerators` — the GPU UUIDs assigned to
/// the requester, in the order the device plugin handed them out.
pub async fn get_accelerators(client: &reqwest::Client, ip: &str, port: &str) -> Result<Vec<String>, Error> {
    let url = format!("http://{}:{}/accelerators", ip, port);
    let uuids: Vec<String> = client.get(url).send().await?.error_for_status()?.json().await?;
    Ok(uuids)
}

/// `GET http://<ip>:<port>/accelerator-memory` — per-GPU-UUID memory
/// usage in MiB, used to verify a sleeper's vLLM actually released
/// memory before resuming it under the configured limit.
pub async fn get_accelerator_memory(
    client: &reqwest::Client,
    ip: &str,
    port: &str,
) -> Result<HashMap<String, u64>, Error> {
    let url = format!("http://{}:{}/accelerator-memory", ip, port);
    let usage: HashMap<String, u64> = client.get(url).send().await?.error_for_status()?.json().await?;
    Ok(usage)
}

/// `POST http://<ip>:<port>/become_ready`.
pub async fn become_ready(client: &reqwest::Client, ip: &str, port: &str) -> Result<(), Error> {
    let url = format!("http://{}:{}/become_ready", ip, port);
    client.post(url).send().await?.error_for_status()?;
    Ok(())
}

/// `POST http://<ip>:<port>/become_unready`.
pub async fn become_unready(client: &reqwest::Client, ip: &str, port: &str) -> Result<(), Error> {
    let url = format!("http://{}:{}/become_unready", ip, port);
    client.post(url).send().await?.error_for_status()?;
    Ok(())
}
