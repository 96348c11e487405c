//! HTTP clients for the two external collaborators this controller
//! talks to: the requester's admin stub, and the bound provider's
//! vLLM instance. Both get a single shared `reqwest::Client` built
//! with the configured timeout (§5, default 5s).

pub mod requester;
pub mod vllm;

use std::time::Duration;

use vllm_dualpod_types::Error;

pub fn build_client(timeout: Duration) -> Result<reqwest::Client, Error> {
    Ok(reqwest::Client::builder().timeout(timeout).build()?)
}
