//! Pure decision logic for one reconciliation pass (§4.4): given
//! cached state for an inference-server reference, picks the single
//! rule that fires and returns it as an [`Action`] for `mod.rs` to
//! execute. Kept free of I/O so the ten rules can be unit tested
//! directly against hand-built fixtures (S1-S6).

use k8s_openapi::api::core::v1::{Node, Pod};
use vllm_dualpod_types::{Config, GpuMap, ANNOTATION_ADMIN_PORT, INFERENCE_SERVER_CONTAINER_NAME};

use crate::model::InferenceServer;
use crate::util::messages::{ACCELERATOR_NOT_IN_MAP, NO_ACCELERATORS, NO_IP_ASSIGNED};

/// The single action one reconciliation pass should take. Each variant
/// corresponds to exactly one numbered rule in the reconciler design.
#[derive(Debug, Clone, PartialEq)]
pub enum Action {
    /// Rule 1: both pods gone.
    DiscardState,

    /// Rule 2, add branch.
    AddRequesterFinalizer,

    /// Rule 2, remove branch.
    RemoveRequesterFinalizer,

    /// Rule 3: provider is being deleted.
    RelayProviderDeletion {
        provider_name: String,
        add_requester_finalizer: bool,
        delete_requester: bool,
    },

    /// Rule 4, broken-provider branch.
    DeleteBrokenProvider { provider_name: String },

    /// Rule 4, sleep-and-unbind branch.
    SleepAndUnbindProvider {
        provider_name: String,
        provider_ip: Option<String>,
        already_asleep: bool,
    },

    /// Rule 5: node absent or deleting; nothing to do.
    NodeUnusable,

    /// Rule 6, no-IP branch.
    RecordStatus { message: &'static str },

    /// Rule 6, unschedulable branch.
    DeleteUnschedulableRequester,

    /// Rule 7: discover GPUs via the requester stub.
    DiscoverGpus { requester_ip: String, admin_port: String },

    /// Rule 7 failure paths that still record status without retrying
    /// the HTTP call this pass.
    RecordStatusAndStop { message: &'static str },

    /// Rule 7 success path on a pass where the indices weren't cached
    /// yet: the UUIDs already known all resolved on this node, so
    /// `mod.rs` stores the indices into the in-memory state and
    /// re-runs `decide` immediately (no I/O occurred, so redoing the
    /// decision is free).
    CacheGpuIndices { indices: Vec<u32> },

    /// Rule 8: bound provider exists; sync sleep/wake/readiness.
    SyncBoundProvider {
        provider_name: String,
        provider_ip: Option<String>,
        vllm_port: Option<u16>,
        requester_ip: String,
        admin_port: String,
        needs_is_sleeping_check: bool,
        /// Rule 2's `!have && want` branch, carried forward: the
        /// requester finalizer must be added in this same pass since
        /// the bound provider's inference-server container is Running.
        add_requester_finalizer: bool,
        /// The provider's current `Ready` condition (§4.6): relayed to
        /// the requester stub only on transitions from the cached
        /// last-relayed value.
        ready: bool,
    },

    /// Rule 9: bind an existing compatible sleeper.
    BindSleeper { sleeper_name: String, fingerprint: String },

    /// Rule 10: evict excess sleepers (if any) and/or create a fresh
    /// provider. `evict` is always processed before `create`; if
    /// `evict` is non-empty the pass returns retry afterward instead
    /// of creating immediately (§4.4 rule 10).
    EnforceBudgetAndCreate { evict: Vec<String>, create: bool },

    /// Rule 10, create branch, once `mod.rs` has synthesized the pod to
    /// submit. Not returned by `decide_bind_or_create` itself (which
    /// only decides whether to evict/create); `mod.rs` substitutes this
    /// for `EnforceBudgetAndCreate { create: true, .. }` once it has
    /// the synthesized Pod in hand.
    CreateProvider { pod: Box<Pod> },

    /// I1 violation: more than one provider bound to this reference.
    MultipleProvidersBound { count: usize },

    /// Requester is live and usable and no provider is bound yet:
    /// `mod.rs` must synthesize the nominal pod and consult the
    /// fingerprint/slot indices before rules 9 and 10 can fire (see
    /// [`decide_bind_or_create`]).
    NeedsBindOrCreate,
}

pub struct ReconcileInputs<'a> {
    pub requester: Option<&'a Pod>,
    pub bound_providers: &'a [Pod],
    pub node: Option<&'a Node>,
    pub state: &'a InferenceServer,
    pub gpu_map: &'a GpuMap,
    pub config: &'a Config,
}

fn is_deleting(pod: &Pod) -> bool {
    pod.metadata.deletion_timestamp.is_some()
}

fn has_finalizer(pod: &Pod, name: &str) -> bool {
    pod.metadata
        .finalizers
        .as_ref()
        .map_or(false, |fs| fs.iter().any(|f| f == name))
}

fn pod_ip(pod: &Pod) -> Option<String> {
    pod.status.as_ref().and_then(|s| s.pod_ip.clone()).filter(|ip| !ip.is_empty())
}

fn admin_port(requester: &Pod, config: &Config) -> String {
    requester
        .metadata
        .annotations
        .as_ref()
        .and_then(|a| a.get(ANNOTATION_ADMIN_PORT))
        .cloned()
        .unwrap_or_else(|| config.default_admin_port.clone())
}

fn inference_server_running(provider: &Pod) -> bool {
    provider
        .status
        .as_ref()
        .and_then(|s| s.container_statuses.as_ref())
        .map(|statuses| {
            statuses.iter().any(|cs| {
                cs.name == INFERENCE_SERVER_CONTAINER_NAME
                    && cs.state.as_ref().and_then(|st| st.running.as_ref()).is_some()
            })
        })
        .unwrap_or(false)
}

fn pod_ready(pod: &Pod) -> bool {
    pod.status
        .as_ref()
        .and_then(|s| s.conditions.as_ref())
        .map(|conds| conds.iter().any(|c| c.type_ == "Ready" && c.status == "True"))
        .unwrap_or(false)
}

fn provider_looks_broken(provider: &Pod) -> bool {
    let has_restart = provider
        .status
        .as_ref()
        .and_then(|s| s.container_statuses.as_ref())
        .map(|statuses| {
            statuses
                .iter()
                .any(|cs| cs.name == INFERENCE_SERVER_CONTAINER_NAME && cs.restart_count >= 1)
        })
        .unwrap_or(false);
    has_restart && !pod_ready(provider)
}

/// Runs the decision table described in §4.4, returning the one rule
/// that fires. `requester_finalizer_present` and friends are read
/// straight off the cached Pods; `state` supplies the in-memory
/// discovered-GPU / sleeping / readiness-relayed fields that persist
/// across passes to avoid redundant HTTP calls.
pub fn decide(inputs: &ReconcileInputs) -> Action {
    let requester = inputs.requester;
    let providers = inputs.bound_providers;

    // Rule 1: end of life.
    if requester.is_none() && providers.is_empty() {
        return Action::DiscardState;
    }

    if providers.len() > 1 {
        return Action::MultipleProvidersBound { count: providers.len() };
    }
    let provider = providers.first();

    // Rule 2: requester-finalizer arbitration. `want` can only be true
    // when a provider is bound and Running, which is exactly the
    // condition rule 8 fires under; `!have && want` is folded into
    // that rule's `SyncBoundProvider` action below rather than
    // returned here, since a live non-deleting requester always falls
    // through to rule 8 once nothing else applies (no provider bound
    // yet implies `want` is false, so there is nothing to fold in for
    // rules 9/10).
    let mut finalizer_needs_add = false;
    if let Some(requester) = requester {
        if !is_deleting(requester) {
            let want = provider.map(inference_server_running).unwrap_or(false);
            let have = has_finalizer(requester, vllm_dualpod_types::FINALIZER_REQUESTER);
            if have && !want {
                return Action::RemoveRequesterFinalizer;
            }
            finalizer_needs_add = !have && want;
        }
    }

    // Rule 3: provider being deleted.
    if let Some(provider) = provider {
        if is_deleting(provider) {
            let provider_name = provider.metadata.name.clone().unwrap_or_default();
            let requester_live = requester.map(|r| !is_deleting(r)).unwrap_or(false);
            return Action::RelayProviderDeletion {
                provider_name,
                add_requester_finalizer: requester_live,
                // Avoid re-issuing the delete call every pass while we
                // wait for the cache to observe it went through (§5:
                // in-memory flags only suppress redundant writes).
                delete_requester: requester_live && !inputs.state.requester_delete_requested,
            };
        }
    }

    // Rule 4: unbind when requester is gone or deleting.
    let requester_gone_or_deleting = requester.map(is_deleting).unwrap_or(true);
    if requester_gone_or_deleting {
        if let Some(provider) = provider {
            let provider_name = provider.metadata.name.clone().unwrap_or_default();
            if provider_looks_broken(provider) {
                return Action::DeleteBrokenProvider { provider_name };
            }
            return Action::SleepAndUnbindProvider {
                provider_name,
                provider_ip: pod_ip(provider),
                already_asleep: inputs.state.sleeping == Some(true),
            };
        }
        // No provider and requester gone: nothing left to reconcile
        // this pass (state will be discarded once both are absent).
        return Action::NodeUnusable;
    }

    let requester = requester.expect("requester is Some: requester_gone_or_deleting was false");

    // Rule 5: node absent or being deleted.
    let node_usable = inputs
        .node
        .map(|n| n.metadata.deletion_timestamp.is_none())
        .unwrap_or(false);
    if !node_usable && provider.is_none() {
        return Action::NodeUnusable;
    }

    // Rule 6: not yet usable.
    let ip = pod_ip(requester);
    if ip.is_none() {
        return Action::RecordStatus { message: NO_IP_ASSIGNED };
    }
    let unschedulable = inputs
        .node
        .and_then(|n| n.spec.as_ref())
        .and_then(|s| s.unschedulable)
        .unwrap_or(false);
    if unschedulable && provider.is_none() {
        if inputs.state.requester_delete_requested {
            return Action::NodeUnusable;
        }
        return Action::DeleteUnschedulableRequester;
    }

    // Rule 7: discover GPUs.
    if inputs.state.gpu_indices.is_none() {
        match &inputs.state.gpu_uuids {
            None => {
                return Action::DiscoverGpus {
                    requester_ip: ip.clone().unwrap(),
                    admin_port: admin_port(requester, inputs.config),
                };
            }
            Some(uuids) if uuids.is_empty() => {
                return Action::RecordStatusAndStop { message: NO_ACCELERATORS };
            }
            Some(uuids) => {
                let node_name = requester.spec.as_ref().and_then(|s| s.node_name.clone());
                let all_resolved = node_name
                    .as_ref()
                    .map(|node| {
                        uuids.iter().all(|u| {
                            inputs
                                .gpu_map
                                .locate(u)
                                .map(|loc| &loc.node == node)
                                .unwrap_or(false)
                        })
                    })
                    .unwrap_or(false);
                if !all_resolved {
                    return Action::RecordStatusAndStop { message: ACCELERATOR_NOT_IN_MAP };
                }
                let node = node_name.expect("all_resolved implies node_name is Some");
                let indices: Vec<u32> = uuids
                    .iter()
                    .filter_map(|u| inputs.gpu_map.locate(u))
                    .filter(|loc| loc.node == node)
                    .map(|loc| loc.index)
                    .collect();
                return Action::CacheGpuIndices { indices };
            }
        }
    }

    // Rule 8: provider already bound.
    if let Some(provider) = provider {
        let provider_name = provider.metadata.name.clone().unwrap_or_default();
        return Action::SyncBoundProvider {
            provider_name,
            provider_ip: pod_ip(provider),
            vllm_port: inputs.state.vllm_port,
            requester_ip: ip.unwrap(),
            admin_port: admin_port(requester, inputs.config),
            needs_is_sleeping_check: inputs.state.sleeping.is_none(),
            add_requester_finalizer: finalizer_needs_add,
            ready: pod_ready(provider),
        };
    }

    // Rules 9 & 10 need the nominal pod / fingerprint / by-slot
    // lookups, which require synthesis and store access beyond what
    // `ReconcileInputs` carries; `mod.rs` performs synthesis first and
    // calls `decide_bind_or_create` with the result.
    Action::NeedsBindOrCreate
}

/// Continuation of rules 9 and 10, called by `mod.rs` once it has
/// synthesized the nominal provider and queried the fingerprint/slot
/// indices (kept separate from `decide` because those lookups require
/// the `Store`, not just the per-reference cached inputs).
pub fn decide_bind_or_create(
    sleeper_names: &[String],
    fingerprint: &str,
    slot_sleepers: &[(String, u32, Vec<String>)],
    sleeper_limit: usize,
) -> Action {
    if let Some(name) = sleeper_names.first() {
        return Action::BindSleeper {
            sleeper_name: name.clone(),
            fingerprint: fingerprint.to_string(),
        };
    }

    let mut evict = Vec::new();
    for (_, _, names) in slot_sleepers {
        if names.len() > sleeper_limit {
            let excess = names.len() - sleeper_limit;
            evict.extend(names.iter().take(excess).cloned());
        }
    }
    Action::EnforceBudgetAndCreate {
        create: evict.is_empty(),
        evict,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use k8s_openapi::api::core::v1::{ContainerState, ContainerStateRunning, ContainerStatus, NodeSpec, PodSpec, PodStatus};
    use kube::core::ObjectMeta;
    use vllm_dualpod_types::FINALIZER_REQUESTER;

    fn requester(name: &str, ip: Option<&str>, deleting: bool) -> Pod {
        Pod {
            metadata: ObjectMeta {
                uid: Some(format!("{}-uid", name)),
                name: Some(name.to_string()),
                deletion_timestamp: if deleting {
                    Some(k8s_openapi::apimachinery::pkg::apis::meta::v1::Time(chrono::Utc::now()))
                } else {
                    None
                },
                finalizers: Some(vec![]),
                ..Default::default()
            },
            spec: Some(PodSpec {
                node_name: Some("node-a".to_string()),
                ..Default::default()
            }),
            status: ip.map(|ip| PodStatus {
                pod_ip: Some(ip.to_string()),
                ..Default::default()
            }),
        }
    }

    fn bound_provider(name: &str, running: bool, deleting: bool) -> Pod {
        Pod {
            metadata: ObjectMeta {
                uid: Some(format!("{}-uid", name)),
                name: Some(name.to_string()),
                deletion_timestamp: if deleting {
                    Some(k8s_openapi::apimachinery::pkg::apis::meta::v1::Time(chrono::Utc::now()))
                } else {
                    None
                },
                finalizers: Some(vec![]),
                ..Default::default()
            },
            status: Some(PodStatus {
                pod_ip: Some("10.0.0.1".to_string()),
                container_statuses: Some(vec![ContainerStatus {
                    name: INFERENCE_SERVER_CONTAINER_NAME.to_string(),
                    restart_count: 0,
                    state: Some(ContainerState {
                        running: if running { Some(ContainerStateRunning { started_at: None }) } else { None },
                        ..Default::default()
                    }),
                    ..Default::default()
                }]),
                ..Default::default()
            }),
            ..Default::default()
        }
    }

    fn config() -> Config {
        Config::default()
    }

    #[test]
    fn both_absent_discards_state() {
        let state = InferenceServer::default();
        let gpu_map = GpuMap::default();
        let cfg = config();
        let inputs = ReconcileInputs {
            requester: None,
            bound_providers: &[],
            node: None,
            state: &state,
            gpu_map: &gpu_map,
            config: &cfg,
        };
        assert_eq!(decide(&inputs), Action::DiscardState);
    }

    #[test]
    fn stale_requester_finalizer_is_removed_when_provider_not_running() {
        let mut req = requester("r1", Some("10.0.0.5"), false);
        req.metadata.finalizers = Some(vec![FINALIZER_REQUESTER.to_string()]);
        let state = InferenceServer::default();
        let gpu_map = GpuMap::default();
        let cfg = config();
        let inputs = ReconcileInputs {
            requester: Some(&req),
            bound_providers: &[],
            node: None,
            state: &state,
            gpu_map: &gpu_map,
            config: &cfg,
        };
        assert_eq!(decide(&inputs), Action::RemoveRequesterFinalizer);
    }

    #[test]
    fn deleting_provider_relays_to_requester() {
        let req = requester("r1", Some("10.0.0.5"), false);
        let provider = bound_provider("p1", true, true);
        let state = InferenceServer::default();
        let gpu_map = GpuMap::default();
        let cfg = config();
        let inputs = ReconcileInputs {
            requester: Some(&req),
            bound_providers: std::slice::from_ref(&provider),
            node: None,
            state: &state,
            gpu_map: &gpu_map,
            config: &cfg,
        };
        match decide(&inputs) {
            Action::RelayProviderDeletion {
                add_requester_finalizer,
                delete_requester,
                ..
            } => {
                assert!(add_requester_finalizer);
                assert!(delete_requester);
            }
            other => panic!("expected RelayProviderDeletion, got {:?}", other),
        }
    }

    #[test]
    fn missing_requester_sleeps_and_unbinds_healthy_provider() {
        let provider = bound_provider("p1", true, false);
        let state = InferenceServer::default();
        let gpu_map = GpuMap::default();
        let cfg = config();
        let inputs = ReconcileInputs {
            requester: None,
            bound_providers: std::slice::from_ref(&provider),
            node: None,
            state: &state,
            gpu_map: &gpu_map,
            config: &cfg,
        };
        match decide(&inputs) {
            Action::SleepAndUnbindProvider { provider_name, .. } => assert_eq!(provider_name, "p1"),
            other => panic!("expected SleepAndUnbindProvider, got {:?}", other),
        }
    }

    #[test]
    fn broken_unbound_provider_is_deleted_outright() {
        let mut provider = bound_provider("p1", false, false);
        if let Some(status) = provider.status.as_mut() {
            status.container_statuses.as_mut().unwrap()[0].restart_count = 3;
        }
        let state = InferenceServer::default();
        let gpu_map = GpuMap::default();
        let cfg = config();
        let inputs = ReconcileInputs {
            requester: None,
            bound_providers: std::slice::from_ref(&provider),
            node: None,
            state: &state,
            gpu_map: &gpu_map,
            config: &cfg,
        };
        assert_eq!(
            decide(&inputs),
            Action::DeleteBrokenProvider { provider_name: "p1".to_string() }
        );
    }

    #[test]
    fn no_pod_ip_records_status() {
        let req = requester("r1", None, false);
        let state = InferenceServer::default();
        let gpu_map = GpuMap::default();
        let cfg = config();
        let inputs = ReconcileInputs {
            requester: Some(&req),
            bound_providers: &[],
            node: Some(&Node {
                metadata: ObjectMeta::default(),
                spec: Some(NodeSpec::default()),
                ..Default::default()
            }),
            state: &state,
            gpu_map: &gpu_map,
            config: &cfg,
        };
        assert_eq!(decide(&inputs), Action::RecordStatus { message: NO_IP_ASSIGNED });
    }

    #[test]
    fn unschedulable_requester_delete_not_repeated_once_requested() {
        let req = requester("r1", Some("10.0.0.5"), false);
        let mut state = InferenceServer::default();
        state.requester_delete_requested = true;
        let gpu_map = GpuMap::default();
        let cfg = config();
        let node = Node {
            metadata: ObjectMeta::default(),
            spec: Some(NodeSpec {
                unschedulable: Some(true),
                ..Default::default()
            }),
            ..Default::default()
        };
        let inputs = ReconcileInputs {
            requester: Some(&req),
            bound_providers: &[],
            node: Some(&node),
            state: &state,
            gpu_map: &gpu_map,
            config: &cfg,
        };
        assert_eq!(decide(&inputs), Action::NodeUnusable);
    }

    #[test]
    fn unschedulable_node_without_provider_deletes_requester() {
        let req = requester("r1", Some("10.0.0.5"), false);
        let state = InferenceServer::default();
        let gpu_map = GpuMap::default();
        let cfg = config();
        let node = Node {
            metadata: ObjectMeta::default(),
            spec: Some(NodeSpec {
                unschedulable: Some(true),
                ..Default::default()
            }),
            ..Default::default()
        };
        let inputs = ReconcileInputs {
            requester: Some(&req),
            bound_providers: &[],
            node: Some(&node),
            state: &state,
            gpu_map: &gpu_map,
            config: &cfg,
        };
        assert_eq!(decide(&inputs), Action::DeleteUnschedulableRequester);
    }

    #[test]
    fn bound_provider_with_cached_gpus_syncs() {
        let req = requester("r1", Some("10.0.0.5"), false);
        let provider = bound_provider("p1", true, false);
        let mut state = InferenceServer::default();
        state.gpu_uuids = Some(vec!["uuid-1".to_string()]);
        state.gpu_indices = Some(vec![0]);
        let gpu_map = GpuMap::default();
        let cfg = config();
        let node = Node {
            metadata: ObjectMeta::default(),
            spec: Some(NodeSpec::default()),
            ..Default::default()
        };
        let inputs = ReconcileInputs {
            requester: Some(&req),
            bound_providers: std::slice::from_ref(&provider),
            node: Some(&node),
            state: &state,
            gpu_map: &gpu_map,
            config: &cfg,
        };
        match decide(&inputs) {
            Action::SyncBoundProvider {
                provider_name,
                add_requester_finalizer,
                ..
            } => {
                assert_eq!(provider_name, "p1");
                // requester has no finalizer yet but the bound provider
                // is Running: rule 2's `!have && want` must be folded
                // into this pass's action rather than silently dropped.
                assert!(add_requester_finalizer);
            }
            other => panic!("expected SyncBoundProvider, got {:?}", other),
        }
    }

    #[test]
    fn sync_bound_provider_does_not_readd_existing_finalizer() {
        let mut req = requester("r1", Some("10.0.0.5"), false);
        req.metadata.finalizers = Some(vec![FINALIZER_REQUESTER.to_string()]);
        let provider = bound_provider("p1", true, false);
        let mut state = InferenceServer::default();
        state.gpu_uuids = Some(vec!["uuid-1".to_string()]);
        state.gpu_indices = Some(vec![0]);
        let gpu_map = GpuMap::default();
        let cfg = config();
        let node = Node {
            metadata: ObjectMeta::default(),
            spec: Some(NodeSpec::default()),
            ..Default::default()
        };
        let inputs = ReconcileInputs {
            requester: Some(&req),
            bound_providers: std::slice::from_ref(&provider),
            node: Some(&node),
            state: &state,
            gpu_map: &gpu_map,
            config: &cfg,
        };
        match decide(&inputs) {
            Action::SyncBoundProvider { add_requester_finalizer, .. } => assert!(!add_requester_finalizer),
            other => panic!("expected SyncBoundProvider, got {:?}", other),
        }
    }

    #[test]
    fn multiple_bound_providers_is_hard_error() {
        let req = requester("r1", Some("10.0.0.5"), false);
        let p1 = bound_provider("p1", true, false);
        let p2 = bound_provider("p2", true, false);
        let state = InferenceServer::default();
        let gpu_map = GpuMap::default();
        let cfg = config();
        let inputs = ReconcileInputs {
            requester: Some(&req),
            bound_providers: &[p1, p2],
            node: None,
            state: &state,
            gpu_map: &gpu_map,
            config: &cfg,
        };
        assert_eq!(decide(&inputs), Action::MultipleProvidersBound { count: 2 });
    }

    #[test]
    fn bind_sleeper_picks_first_hit() {
        let action = decide_bind_or_create(
            &["sleeper-a".to_string(), "sleeper-b".to_string()],
            "fp-1",
            &[],
            2,
        );
        assert_eq!(
            action,
            Action::BindSleeper {
                sleeper_name: "sleeper-a".to_string(),
                fingerprint: "fp-1".to_string(),
            }
        );
    }

    #[test]
    fn budget_exceeded_evicts_before_creating() {
        let slots = vec![("node-a".to_string(), 0u32, vec!["s1".to_string(), "s2".to_string(), "s3".to_string()])];
        let action = decide_bind_or_create(&[], "fp-1", &slots, 2);
        match action {
            Action::EnforceBudgetAndCreate { evict, create } => {
                assert_eq!(evict, vec!["s1".to_string()]);
                assert!(!create);
            }
            other => panic!("expected EnforceBudgetAndCreate, got {:?}", other),
        }
    }

    #[test]
    fn under_budget_creates_immediately() {
        let slots = vec![("node-a".to_string(), 0u32, vec!["s1".to_string()])];
        let action = decide_bind_or_create(&[], "fp-1", &slots, 2);
        assert_eq!(action, Action::EnforceBudgetAndCreate { evict: vec![], create: true });
    }
}
