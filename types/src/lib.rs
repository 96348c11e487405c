//! Shared domain types for the vLLM dual-pod actuation controller:
//! well-known annotation/label/finalizer names, the runtime [`Config`],
//! the [`Error`] taxonomy, the [`GpuMap`] projection, and the nominal
//! provider [`fingerprint`] function. Kept as its own crate so both the
//! `operator` binary and its tests can depend on it without pulling in
//! `kube`'s `derive` machinery, which this system has no use for since
//! it has no CRDs of its own.

pub mod config;
pub mod consts;
pub mod error;
pub mod fingerprint;
pub mod gpu_map;

pub use config::Config;
pub use consts::*;
pub use error::{is_retryable_kube_error, Error, ReconcileOutcome};
pub use fingerprint::fingerprint;
pub use gpu_map::{parse_gpu_map, GpuLocation, GpuMap};
