//! Client for a bound provider's vLLM server.

use serde::Deserialize;
use vllm_dualpod_types::Error;

#[derive(Deserialize)]
struct IsSleepingResponse {
    is_sleeping: bool,
}

/// `GET http://<ip>:<port>/is_sleeping`.
pub async fn is_sleeping(client: &reqwest::Client, ip: &str, port: u16) -> Result<bool, Error> {
    let url = format!("http://{}:{}/is_sleeping", ip, port);
    let resp: IsSleepingResponse = client.get(url).send().await?.error_for_status()?.json().await?;
    Ok(resp.is_sleeping)
}

/// `POST http://<ip>:<port>/sleep`.
pub async fn sleep(client: &reqwest::Client, ip: &str, port: u16) -> Result<(), Error> {
    let url = format!("http://{}:{}/sleep", ip, port);
    client.post(url).send().await?.error_for_status()?;
    Ok(())
}

/// `POST http://<ip>:<port>/wake_up`.
pub async fn wake_up(client: &reqwest::Client, ip: &str, port: u16) -> Result<(), Error> {
    let url = format!("http://{}:{}/wake_up", ip, port);
    client.post(url).send().await?.error_for_status()?;
    Ok(())
}
