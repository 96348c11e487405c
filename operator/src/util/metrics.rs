use prometheus::{register_counter_vec, register_histogram_vec, CounterVec, HistogramVec};

/// Prometheus instrumentation for the reconciler. A single instance is
/// shared across all node workers.
pub struct ControllerMetrics {
    /// Number of reconciliation passes, labeled by node.
    pub reconcile_counter: CounterVec,

    /// Number of times each rule in `determine_action` fired, labeled
    /// by node and rule name.
    pub action_counter: CounterVec,

    /// Latency of one reconciliation pass, labeled by node and rule.
    pub pass_histogram: HistogramVec,
}

impl ControllerMetrics {
    pub fn new() -> Self {
        let reconcile_counter = register_counter_vec!(
            "vllmo_reconcile_counter",
            "Number of reconciliation passes performed by the controller.",
            &["node"]
        )
        .unwrap();
        let action_counter = register_counter_vec!(
            "vllmo_action_counter",
            "Number of times each reconciler rule fired.",
            &["node", "action"]
        )
        .unwrap();
        let pass_histogram = register_histogram_vec!(
            "vllmo_pass_duration_seconds",
            "Latency of a single reconciliation pass.",
            &["node", "action"]
        )
        .unwrap();
        ControllerMetrics {
            reconcile_counter,
            action_counter,
            pass_histogram,
        }
    }
}

impl Default for ControllerMetrics {
    fn default() -> Self {
        Self::new()
    }
}
