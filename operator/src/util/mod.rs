pub mod finalizer;
pub mod messages;
pub mod patch;

#[cfg(feature = "metrics")]
pub mod metrics;
