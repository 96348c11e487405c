#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Kubernetes reported error: {source}")]
    KubeError {
        #[from]
        source: kube::Error,
    },

    #[error("Json error: {source}")]
    JsonError {
        #[from]
        source: serde_json::Error,
    },

    #[error("Yaml error: {source}")]
    YamlError {
        #[from]
        source: serde_yaml::Error,
    },

    #[error("Failed to parse DateTime: {source}")]
    ChronoError {
        #[from]
        source: chrono::ParseError,
    },

    #[error("Out of range: {source}")]
    OutOfRangeError {
        #[from]
        source: chrono::OutOfRangeError,
    },

    #[error("HTTP client error: {source}")]
    HttpError {
        #[from]
        source: reqwest::Error,
    },

    #[error("Invalid user input: {0}")]
    UserInputError(String),

    /// I1 violation: more than one provider Pod carries the same
    /// `requester` annotation. Not retried; requires operator attention.
    #[error("{count} providers are bound to requester {uid} {name}, expected at most one")]
    MultipleProvidersBound {
        uid: String,
        name: String,
        count: usize,
    },

    /// A GPU UUID reported by the requester stub has no entry in the
    /// current GPU-map snapshot, or resolves to a different node.
    #[error("accelerator {uuid} is not present on node {node} per the current gpu-map")]
    UuidNotOnNode { uuid: String, node: String },

    /// The `server-patch` template referenced a binding that wasn't
    /// supplied. Currently the only binding is `NodeName`.
    #[error("server-patch template references undefined key {0}")]
    TemplateMissingKey(String),

    /// The apiserver rejected a nominal Pod at `Create` time, or the
    /// strict re-decode of the synthesized JSON found spurious fields.
    #[error("invalid nominal provider pod: {0}")]
    InvalidNominalPod(String),

    /// A write lost an optimistic-concurrency race. The caller should
    /// retry the whole reconciliation pass against fresh cached state.
    #[error("conflicting write, retry: {0}")]
    RetryableConflict(String),
}

impl Error {
    /// Returns true if this error represents a condition the work
    /// queue should retry rather than treat as fatal to the
    /// inference-server reference.
    pub fn is_retryable(&self) -> bool {
        match self {
            Error::RetryableConflict(_) => true,
            Error::KubeError { source } => is_retryable_kube_error(source),
            Error::HttpError { .. } => true,
            Error::MultipleProvidersBound { .. } => false,
            Error::InvalidNominalPod(_) => false,
            _ => false,
        }
    }
}

/// Result of one reconciliation pass over an inference-server
/// reference. Modeled as its own enum rather than `Result<Action,
/// Error>` because the work queue needs to distinguish three distinct
/// outcomes: stop reconciling this reference for now, re-enqueue it
/// immediately because the world changed mid-pass, or stop and
/// surface a bug that retrying won't fix.
#[derive(Debug)]
pub enum ReconcileOutcome {
    /// The pass completed; no further action needed until the next
    /// triggering event.
    Done,

    /// Re-run this reference's pass again without waiting for a new
    /// external event (e.g. a sleeper was evicted and a fresh slot
    /// should now be available, or a write lost an optimistic-locking
    /// race).
    Retry,

    /// A non-retryable condition was hit; the error has already been
    /// recorded where the design calls for it (e.g. the requester's
    /// status annotation) and nothing more should be attempted this
    /// pass.
    Fatal(Error),
}

/// Classifies a `kube::Error` the way this controller's write paths do:
/// conflicts and general transport/network failures are retryable,
/// "not found" on a delete is benign (handled by the caller directly,
/// never reaches here as an `Err`), and everything else is surfaced.
pub fn is_retryable_kube_error(source: &kube::Error) -> bool {
    match source {
        kube::Error::Api(ae) => ae.code == 409 || ae.code >= 500,
        // Any other kube-rs error (transport, TLS, auth discovery, ...)
        // is treated as a transient condition worth retrying.
        _ => true,
    }
}
