//! Entrypoint and worker loop: wires the object store, GPU-map
//! projection, and work queue together, and executes the [`Action`]
//! that `decide` returns for one inference-server reference per pass.

pub mod budget;
pub mod decide;
pub mod synth;

use std::collections::BTreeMap;
use std::sync::Arc;

use futures::StreamExt;
use k8s_openapi::api::core::v1::{ConfigMap, Node, Pod};
use kube::api::{DeleteParams, ListParams, Preconditions};
use kube::runtime::watcher;
use kube::{Api, Client};

use vllm_dualpod_types::{
    Config, Error, ReconcileOutcome, ANNOTATION_NOMINAL, ANNOTATION_REQUESTER, FINALIZER_PROVIDER,
    FINALIZER_REQUESTER, LABEL_DUAL, LABEL_SLEEPING,
};

use crate::gpumap::GpuMapProjection;
use crate::http;
use crate::model::{InferenceServer, InferenceServerRef};
use crate::queue::{NodeRegistry, WorkQueue};
use crate::store::Store;
use crate::util;
use decide::{decide, decide_bind_or_create, Action, ReconcileInputs};

#[cfg(feature = "metrics")]
use crate::util::metrics::ControllerMetrics;

pub struct ReconcilerContext {
    pub client: Client,
    pub config: Config,
    pub store: Store,
    pub queue: WorkQueue,
    pub nodes: NodeRegistry,
    pub gpu_map: GpuMapProjection,
    pub http: reqwest::Client,
    #[cfg(feature = "metrics")]
    pub metrics: ControllerMetrics,
}

impl ReconcilerContext {
    pub fn new(client: Client, config: Config) -> Result<Self, Error> {
        let http = http::build_client(config.http_timeout)?;
        Ok(ReconcilerContext {
            client,
            config,
            store: Store::new(),
            queue: WorkQueue::new(),
            nodes: NodeRegistry::new(),
            gpu_map: GpuMapProjection::new(),
            http,
            #[cfg(feature = "metrics")]
            metrics: ControllerMetrics::new(),
        })
    }
}

/// Starts the watchers, the ingest tasks that feed the cache, and
/// `num_workers` reconciler workers, then blocks until one of them
/// exits (which should only happen on an unrecoverable watch error).
pub async fn run(client: Client, config: Config) -> Result<(), Error> {
    let num_workers = config.num_workers;
    let ctx = Arc::new(ReconcilerContext::new(client, config)?);

    let pod_ingest = tokio::spawn(run_pod_ingest(ctx.clone()));
    let node_ingest = tokio::spawn(run_node_ingest(ctx.clone()));
    let configmap_ingest = tokio::spawn(run_configmap_ingest(ctx.clone()));
    let prober = tokio::spawn(run_prober(ctx.clone()));

    let mut workers = Vec::with_capacity(num_workers);
    for id in 0..num_workers {
        let ctx = ctx.clone();
        workers.push(tokio::spawn(worker_loop(ctx, id)));
    }

    tokio::select! {
        res = pod_ingest => { println!("pod ingest task exited: {:?}", res); }
        res = node_ingest => { println!("node ingest task exited: {:?}", res); }
        res = configmap_ingest => { println!("configmap ingest task exited: {:?}", res); }
        res = prober => { println!("prober task exited: {:?}", res); }
        _ = futures::future::select_all(workers) => { println!("a worker task exited"); }
    }

    Ok(())
}

/// Periodically re-enqueues every tracked inference-server reference
/// on every known node, independent of any watch event. Generalizes
/// the teacher's `Action::requeue(PROBE_INTERVAL)` (emitted from every
/// terminal arm of its own reconcilers) to this controller's node-keyed
/// work queue, which has no per-object requeue primitive of its own:
/// a bound provider's sleep state or a requester's readiness can drift
/// without producing a watch event (e.g. vLLM sleeps on its own
/// schedule), so passes must be re-run on a timer too.
async fn run_prober(ctx: Arc<ReconcilerContext>) {
    let mut interval = tokio::time::interval(ctx.config.probe_interval);
    interval.tick().await; // first tick fires immediately; skip it.
    loop {
        interval.tick().await;
        for node in ctx.nodes.known_nodes() {
            reenqueue_tracked_refs(&ctx, &node);
        }
    }
}

async fn run_pod_ingest(ctx: Arc<ReconcilerContext>) {
    let api: Api<Pod> = Api::namespaced(ctx.client.clone(), &ctx.config.namespace);
    let mut stream = Box::pin(watcher(api, ListParams::default()));
    while let Some(event) = stream.next().await {
        match event {
            Ok(watcher::Event::Applied(pod)) => ingest_one_pod(&ctx, pod),
            Ok(watcher::Event::Restarted(pods)) => {
                for pod in pods {
                    ingest_one_pod(&ctx, pod);
                }
            }
            Ok(watcher::Event::Deleted(pod)) => {
                if let Some(hint) = ctx.store.remove_pod(&pod) {
                    ctx.queue.enqueue_server_ref(&hint.node, hint.server_ref);
                }
            }
            Err(e) => eprintln!("pod watch error: {}", e),
        }
    }
    ctx.queue.enqueue_sentinel();
}

fn ingest_one_pod(ctx: &Arc<ReconcilerContext>, pod: Pod) {
    use crate::store::categorize::{categorize, node_of_interest, Category};

    let category = categorize(&pod);
    let sleeper_index_args = if category == Category::UnboundProvider {
        let name = pod.metadata.name.clone().unwrap_or_default();
        let fingerprint = pod
            .metadata
            .annotations
            .as_ref()
            .and_then(|a| a.get(vllm_dualpod_types::ANNOTATION_NOMINAL))
            .cloned();
        let node = node_of_interest(&pod, &category);
        let gpu_indices = inference_server_env_value(&pod, vllm_dualpod_types::CUDA_VISIBLE_DEVICES_ENV)
            .map(|v| parse_cuda_visible_devices(&v))
            .unwrap_or_default();
        match (fingerprint, node) {
            (Some(fp), Some(node)) => Some((name, fp, node, gpu_indices)),
            _ => None,
        }
    } else {
        None
    };

    if let Some(hint) = ctx.store.ingest_pod(pod) {
        ctx.queue.enqueue_server_ref(&hint.node, hint.server_ref);
    }

    if let Some((name, fingerprint, node, gpu_indices)) = sleeper_index_args {
        ctx.store.index_unbound_provider(&name, &fingerprint, &node, &gpu_indices);
    }
}

fn inference_server_env_value(pod: &Pod, var_name: &str) -> Option<String> {
    let container = pod
        .spec
        .as_ref()?
        .containers
        .iter()
        .find(|c| c.name == vllm_dualpod_types::INFERENCE_SERVER_CONTAINER_NAME)?;
    container
        .env
        .as_ref()?
        .iter()
        .find(|e| e.name == var_name)?
        .value
        .clone()
}

fn parse_cuda_visible_devices(value: &str) -> Vec<u32> {
    value.split(',').filter_map(|s| s.trim().parse::<u32>().ok()).collect()
}

async fn run_node_ingest(ctx: Arc<ReconcilerContext>) {
    let api: Api<Node> = Api::all(ctx.client.clone());
    let mut stream = Box::pin(watcher(api, ListParams::default()));
    while let Some(event) = stream.next().await {
        match event {
            Ok(watcher::Event::Applied(node)) => {
                let name = node.metadata.name.clone().unwrap_or_default();
                ctx.store.insert_node(node);
                reenqueue_tracked_refs(&ctx, &name);
            }
            Ok(watcher::Event::Restarted(nodes)) => {
                for node in nodes {
                    let name = node.metadata.name.clone().unwrap_or_default();
                    ctx.store.insert_node(node);
                    reenqueue_tracked_refs(&ctx, &name);
                }
            }
            Ok(watcher::Event::Deleted(node)) => {
                let name = node.metadata.name.clone().unwrap_or_default();
                ctx.store.remove_node(&name);
                reenqueue_tracked_refs(&ctx, &name);
            }
            Err(e) => eprintln!("node watch error: {}", e),
        }
    }
}

fn reenqueue_tracked_refs(ctx: &Arc<ReconcilerContext>, node: &str) {
    let refs = ctx.nodes.with_node(node, |ns| ns.servers.keys().cloned().collect::<Vec<_>>());
    for r in refs {
        ctx.queue.enqueue_server_ref(node, r);
    }
}

async fn run_configmap_ingest(ctx: Arc<ReconcilerContext>) {
    let api: Api<ConfigMap> = Api::namespaced(ctx.client.clone(), &ctx.config.namespace);
    let wc = ListParams::default().fields(&format!("metadata.name={}", ctx.config.gpu_map_configmap_name));
    let mut stream = Box::pin(watcher(api, wc));
    while let Some(event) = stream.next().await {
        match event {
            Ok(watcher::Event::Applied(cm)) => {
                ctx.store.set_configmap(Some(cm));
                ctx.queue.enqueue_configmap();
            }
            Ok(watcher::Event::Restarted(cms)) => {
                if let Some(cm) = cms.into_iter().next() {
                    ctx.store.set_configmap(Some(cm));
                    ctx.queue.enqueue_configmap();
                }
            }
            Ok(watcher::Event::Deleted(_)) => {
                ctx.store.set_configmap(None);
                ctx.queue.enqueue_configmap();
            }
            Err(e) => eprintln!("configmap watch error: {}", e),
        }
    }
}

async fn worker_loop(ctx: Arc<ReconcilerContext>, worker_id: usize) {
    loop {
        match ctx.queue.recv().await {
            Some(crate::model::WorkItem::Node(node)) => process_node(&ctx, &node).await,
            Some(crate::model::WorkItem::ConfigMap) => handle_configmap_refresh(&ctx).await,
            Some(crate::model::WorkItem::Sentinel) => {
                println!("worker {} observed initial-sync sentinel", worker_id);
            }
            None => {
                println!("worker {} exiting: queue closed", worker_id);
                break;
            }
        }
    }
}

async fn handle_configmap_refresh(ctx: &Arc<ReconcilerContext>) {
    let cm = ctx.store.get_configmap();
    let (grew, warnings) = ctx.gpu_map.refresh(cm.as_ref());
    for w in warnings {
        eprintln!("gpu-map warning: {}", w);
    }
    if grew {
        for node in ctx.nodes.known_nodes() {
            reenqueue_tracked_refs(ctx, &node);
        }
    }
}

async fn process_node(ctx: &Arc<ReconcilerContext>, node: &str) {
    let pending = ctx.queue.take_pending(node);
    for server_ref in pending {
        #[cfg(feature = "metrics")]
        ctx.metrics.reconcile_counter.with_label_values(&[node]).inc();

        match reconcile_one(ctx, node, &server_ref).await {
            ReconcileOutcome::Done => {}
            ReconcileOutcome::Retry => {
                ctx.queue
                    .pending
                    .lock()
                    .unwrap()
                    .entry(node.to_string())
                    .or_default()
                    .insert(server_ref.clone());
            }
            ReconcileOutcome::Fatal(e) => {
                eprintln!("{}/{}/{} FATAL: {}", ctx.config.namespace, node, server_ref.uid, e);
            }
        }
    }
    ctx.queue.finish_node(node);
}

/// Runs one reconciliation pass for `server_ref` on `node`: gathers
/// cached inputs, asks `decide` for the rule that fires, and performs
/// whatever I/O that rule requires.
async fn reconcile_one(ctx: &Arc<ReconcilerContext>, node: &str, server_ref: &InferenceServerRef) -> ReconcileOutcome {
    let requester = ctx
        .store
        .get_pod(&server_ref.name)
        .filter(|p| p.metadata.uid.as_deref() == Some(server_ref.uid.as_str()));
    let bound_providers = ctx.store.bound_providers(&server_ref.uid);
    let node_obj = ctx.store.get_node(node);
    let state = ctx
        .nodes
        .with_node(node, |ns| ns.servers.entry(server_ref.clone()).or_default().clone());
    let gpu_map = ctx.gpu_map.snapshot();

    let inputs = ReconcileInputs {
        requester: requester.as_ref(),
        bound_providers: &bound_providers,
        node: node_obj.as_ref(),
        state: &state,
        gpu_map: &gpu_map,
        config: &ctx.config,
    };

    let action = decide(&inputs);

    // Rule 7's "indices just resolved" path writes no API object; fold
    // it into this pass instead of round-tripping through the queue.
    let action = if let Action::CacheGpuIndices { indices } = action {
        ctx.nodes.with_node(node, |ns| {
            ns.servers.entry(server_ref.clone()).or_default().gpu_indices = Some(indices.clone());
        });
        let mut refreshed_state = state.clone();
        refreshed_state.gpu_indices = Some(indices);
        let inputs = ReconcileInputs {
            requester: requester.as_ref(),
            bound_providers: &bound_providers,
            node: node_obj.as_ref(),
            state: &refreshed_state,
            gpu_map: &gpu_map,
            config: &ctx.config,
        };
        decide(&inputs)
    } else {
        action
    };

    let action = if matches!(action, Action::NeedsBindOrCreate) {
        match resolve_bind_or_create(ctx, node, server_ref, requester.as_ref().unwrap(), &state) {
            Ok(a) => a,
            Err(e) => return outcome_for_error(ctx, &requester, e).await,
        }
    } else {
        action
    };

    #[cfg(feature = "metrics")]
    let (action_label, timer) = (action_name(&action), std::time::Instant::now());

    let outcome = apply_action(ctx, node, server_ref, action, requester.as_ref()).await;

    #[cfg(feature = "metrics")]
    {
        ctx.metrics.action_counter.with_label_values(&[node, action_label]).inc();
        ctx.metrics
            .pass_histogram
            .with_label_values(&[node, action_label])
            .observe(timer.elapsed().as_secs_f64());
    }

    outcome
}

/// Stable label used in the `action`/`pass_histogram` metrics for one
/// rule's `Action` variant, independent of the data it carries.
#[cfg(feature = "metrics")]
fn action_name(action: &Action) -> &'static str {
    match action {
        Action::DiscardState => "discard_state",
        Action::AddRequesterFinalizer => "add_requester_finalizer",
        Action::RemoveRequesterFinalizer => "remove_requester_finalizer",
        Action::RelayProviderDeletion { .. } => "relay_provider_deletion",
        Action::DeleteBrokenProvider { .. } => "delete_broken_provider",
        Action::SleepAndUnbindProvider { .. } => "sleep_and_unbind_provider",
        Action::NodeUnusable => "node_unusable",
        Action::RecordStatus { .. } => "record_status",
        Action::DeleteUnschedulableRequester => "delete_unschedulable_requester",
        Action::DiscoverGpus { .. } => "discover_gpus",
        Action::RecordStatusAndStop { .. } => "record_status_and_stop",
        Action::CacheGpuIndices { .. } => "cache_gpu_indices",
        Action::SyncBoundProvider { .. } => "sync_bound_provider",
        Action::BindSleeper { .. } => "bind_sleeper",
        Action::EnforceBudgetAndCreate { .. } => "enforce_budget_and_create",
        Action::CreateProvider { .. } => "create_provider",
        Action::MultipleProvidersBound { .. } => "multiple_providers_bound",
        Action::NeedsBindOrCreate => "needs_bind_or_create",
    }
}

fn resolve_bind_or_create(
    ctx: &Arc<ReconcilerContext>,
    node: &str,
    server_ref: &InferenceServerRef,
    requester: &Pod,
    state: &InferenceServer,
) -> Result<Action, Error> {
    let gpu_uuids = state.gpu_uuids.clone().unwrap_or_default();
    let gpu_indices = state.gpu_indices.clone().unwrap_or_default();

    let synthesized = synth::synthesize_nominal_provider(requester, server_ref, node, &gpu_uuids, &gpu_indices)?;

    let sleepers = ctx.store.sleepers_by_fingerprint(&synthesized.fingerprint);
    let sleeper_names: Vec<String> = sleepers.into_iter().filter_map(|p| p.metadata.name).collect();

    // `select_eviction_candidates(_, 0)` returns the whole slot sorted
    // oldest-first (excess = len - 0 = len), reusing the budget
    // module's ordering instead of relying on indexing insertion order.
    let slot_sleepers: Vec<(String, u32, Vec<String>)> = gpu_indices
        .iter()
        .map(|idx| {
            let sorted = budget::select_eviction_candidates(&ctx.store.sleepers_by_slot(node, *idx), 0);
            let names: Vec<String> = sorted.into_iter().filter_map(|p| p.metadata.name).collect();
            (node.to_string(), *idx, names)
        })
        .collect();

    Ok(match decide_bind_or_create(&sleeper_names, &synthesized.fingerprint, &slot_sleepers, ctx.config.sleeper_limit) {
        Action::EnforceBudgetAndCreate { evict, create } if create => {
            ctx.nodes.with_node(node, |ns| {
                ns.servers.entry(server_ref.clone()).or_default().vllm_port = Some(synthesized.admin_port);
            });
            Action::CreateProvider {
                pod: Box::new(synthesized.pod),
            }
        }
        other => other,
    })
}

async fn outcome_for_error(ctx: &Arc<ReconcilerContext>, requester: &Option<Pod>, err: Error) -> ReconcileOutcome {
    if err.is_retryable() {
        return ReconcileOutcome::Retry;
    }
    if let Some(requester) = requester {
        if let Some(name) = &requester.metadata.name {
            let _ = util::patch::set_status_errors(ctx.client.clone(), &ctx.config.namespace, name, &[err.to_string()]).await;
        }
    }
    ReconcileOutcome::Fatal(err)
}

async fn apply_action(
    ctx: &Arc<ReconcilerContext>,
    node: &str,
    server_ref: &InferenceServerRef,
    action: Action,
    requester: Option<&Pod>,
) -> ReconcileOutcome {
    let ns = ctx.config.namespace.clone();
    match action {
        Action::DiscardState => {
            // No object carries per-reference state beyond the cache
            // itself; nothing further to clean up in-memory, since the
            // NodeServers entry is harmless to keep around empty.
            ReconcileOutcome::Done
        }

        Action::RemoveRequesterFinalizer => {
            match util::finalizer::remove(ctx.client.clone(), &ns, &server_ref.name, FINALIZER_REQUESTER).await {
                Ok(_) => ReconcileOutcome::Done,
                Err(e) => outcome_for_error(ctx, &requester.cloned(), e).await,
            }
        }

        Action::AddRequesterFinalizer => {
            match util::finalizer::add(ctx.client.clone(), &ns, &server_ref.name, FINALIZER_REQUESTER).await {
                Ok(_) => ReconcileOutcome::Done,
                Err(e) => outcome_for_error(ctx, &requester.cloned(), e).await,
            }
        }

        Action::RelayProviderDeletion {
            provider_name,
            add_requester_finalizer,
            delete_requester,
        } => {
            if add_requester_finalizer {
                if let Err(e) = util::finalizer::add(ctx.client.clone(), &ns, &server_ref.name, FINALIZER_REQUESTER).await {
                    return outcome_for_error(ctx, &requester.cloned(), e).await;
                }
            }
            if delete_requester {
                if let Err(e) = delete_with_preconditions(ctx, &server_ref.name, requester).await {
                    return outcome_for_error(ctx, &requester.cloned(), e).await;
                }
                ctx.nodes.with_node(node, |ns| {
                    ns.servers.entry(server_ref.clone()).or_default().requester_delete_requested = true;
                });
            }
            match util::finalizer::remove(ctx.client.clone(), &ns, &provider_name, FINALIZER_PROVIDER).await {
                Ok(_) => ReconcileOutcome::Done,
                Err(e) => outcome_for_error(ctx, &requester.cloned(), e).await,
            }
        }

        Action::DeleteBrokenProvider { provider_name } => {
            let api: Api<Pod> = Api::namespaced(ctx.client.clone(), &ns);
            match api.delete(&provider_name, &DeleteParams::default()).await {
                Ok(_) => {}
                Err(kube::Error::Api(ae)) if ae.code == 404 => {}
                Err(e) => return outcome_for_error(ctx, &requester.cloned(), e.into()).await,
            }
            match util::finalizer::remove(ctx.client.clone(), &ns, &provider_name, FINALIZER_PROVIDER).await {
                Ok(_) => ReconcileOutcome::Done,
                Err(e) => outcome_for_error(ctx, &requester.cloned(), e).await,
            }
        }

        Action::SleepAndUnbindProvider {
            provider_name,
            provider_ip,
            already_asleep,
        } => {
            if !already_asleep {
                if let Some(ip) = &provider_ip {
                    let port = ctx
                        .nodes
                        .with_node(node, |ns| ns.servers.get(server_ref).and_then(|s| s.vllm_port))
                        .unwrap_or(80);
                    let _ = http::vllm::sleep(&ctx.http, ip, port).await;
                }
            }
            // `nominal` is left in place: a sleeping provider with no
            // `requester` annotation must still carry `nominal` equal to
            // its fingerprint (I3) so it stays indexed in `by-fingerprint`/
            // `by-slot` and a future requester can find and wake it (S3).
            let mut annotations = BTreeMap::new();
            annotations.insert(ANNOTATION_REQUESTER.to_string(), None);
            if let Err(e) = util::patch::patch_annotations(ctx.client.clone(), &ns, &provider_name, annotations).await {
                return outcome_for_error(ctx, &requester.cloned(), e).await;
            }
            let mut labels = BTreeMap::new();
            labels.insert(LABEL_DUAL.to_string(), None);
            labels.insert(LABEL_SLEEPING.to_string(), Some("true".to_string()));
            if let Err(e) = util::patch::patch_labels(ctx.client.clone(), &ns, &provider_name, labels).await {
                return outcome_for_error(ctx, &requester.cloned(), e).await;
            }
            match util::finalizer::remove(ctx.client.clone(), &ns, &provider_name, FINALIZER_PROVIDER).await {
                Ok(_) => ReconcileOutcome::Done,
                Err(e) => outcome_for_error(ctx, &requester.cloned(), e).await,
            }
        }

        Action::NodeUnusable => ReconcileOutcome::Done,

        Action::RecordStatus { message } | Action::RecordStatusAndStop { message } => {
            if let Err(e) = util::patch::set_status_errors(ctx.client.clone(), &ns, &server_ref.name, &[message.to_string()]).await {
                return outcome_for_error(ctx, &requester.cloned(), e).await;
            }
            ReconcileOutcome::Done
        }

        Action::DeleteUnschedulableRequester => {
            if let Err(e) = delete_with_preconditions(ctx, &server_ref.name, requester).await {
                return outcome_for_error(ctx, &requester.cloned(), e).await;
            }
            ctx.nodes.with_node(node, |ns| {
                ns.servers.entry(server_ref.clone()).or_default().requester_delete_requested = true;
            });
            ReconcileOutcome::Done
        }

        Action::DiscoverGpus { requester_ip, admin_port } => {
            match http::requester::get_accelerators(&ctx.http, &requester_ip, &admin_port).await {
                Ok(uuids) => {
                    ctx.nodes.with_node(node, |ns| {
                        ns.servers.entry(server_ref.clone()).or_default().gpu_uuids = Some(uuids);
                    });
                    ReconcileOutcome::Retry
                }
                Err(e) => {
                    let _ = util::patch::set_status_errors(
                        ctx.client.clone(),
                        &ns,
                        &server_ref.name,
                        &[util::messages::ACCELERATORS_UNREACHABLE.to_string()],
                    )
                    .await;
                    outcome_for_error(ctx, &requester.cloned(), e).await
                }
            }
        }

        Action::CacheGpuIndices { .. } => {
            // Already folded into the pass by `reconcile_one`; should
            // not reach here, but treat it as a harmless retry if it
            // ever does (e.g. a future code path returns it directly).
            ReconcileOutcome::Retry
        }

        Action::SyncBoundProvider {
            provider_name,
            provider_ip,
            vllm_port,
            requester_ip,
            admin_port,
            needs_is_sleeping_check,
            add_requester_finalizer,
            ready,
        } => {
            if add_requester_finalizer {
                if let Err(e) = util::finalizer::add(ctx.client.clone(), &ns, &server_ref.name, FINALIZER_REQUESTER).await {
                    return outcome_for_error(ctx, &requester.cloned(), e).await;
                }
            }

            let port = vllm_port.unwrap_or(80);
            let ip = match provider_ip {
                Some(ip) => ip,
                None => return ReconcileOutcome::Retry,
            };

            let sleeping = if needs_is_sleeping_check {
                match http::vllm::is_sleeping(&ctx.http, &ip, port).await {
                    Ok(s) => s,
                    Err(e) => return outcome_for_error(ctx, &requester.cloned(), e).await,
                }
            } else {
                false
            };

            if sleeping {
                if let Some(limit_mib) = ctx.config.accelerator_sleeping_memory_limit_mib {
                    match http::requester::get_accelerator_memory(&ctx.http, &requester_ip, &admin_port).await {
                        Ok(usage) => {
                            let over_limit = usage.values().any(|mib| *mib > limit_mib);
                            if over_limit {
                                return ReconcileOutcome::Retry;
                            }
                        }
                        Err(e) => return outcome_for_error(ctx, &requester.cloned(), e).await,
                    }
                }
                if let Err(e) = http::vllm::wake_up(&ctx.http, &ip, port).await {
                    return outcome_for_error(ctx, &requester.cloned(), e).await;
                }
            }

            ctx.nodes.with_node(node, |ns| {
                let s = ns.servers.entry(server_ref.clone()).or_default();
                s.sleeping = Some(false);
                s.vllm_port = Some(port);
            });

            let mut labels = BTreeMap::new();
            labels.insert(LABEL_SLEEPING.to_string(), Some("false".to_string()));
            if let Err(e) = util::patch::patch_labels(ctx.client.clone(), &ns, &provider_name, labels).await {
                return outcome_for_error(ctx, &requester.cloned(), e).await;
            }

            match relay_readiness(ctx, node, server_ref, &requester_ip, &admin_port, ready).await {
                Ok(()) => ReconcileOutcome::Done,
                Err(e) => outcome_for_error(ctx, &requester.cloned(), e).await,
            }
        }

        Action::BindSleeper { sleeper_name, fingerprint } => {
            // `nominal` is left in place, matching the sleep/unbind side:
            // once bound, the provider is removed from `by-fingerprint`/
            // `by-slot` on re-ingest by virtue of carrying `requester`
            // again (categorize/`remove_pod_everywhere` de-index it),
            // so there's nothing left for clearing `nominal` to protect.
            let mut annotations = BTreeMap::new();
            annotations.insert(ANNOTATION_REQUESTER.to_string(), Some(server_ref.to_annotation()));
            let _ = fingerprint; // unchanged: it already equals the sleeper's nominal annotation.
            if let Err(e) = util::patch::patch_annotations(ctx.client.clone(), &ns, &sleeper_name, annotations).await {
                return outcome_for_error(ctx, &requester.cloned(), e).await;
            }
            let mut labels = BTreeMap::new();
            labels.insert(LABEL_DUAL.to_string(), Some(server_ref.name.clone()));
            if let Err(e) = util::patch::patch_labels(ctx.client.clone(), &ns, &sleeper_name, labels).await {
                return outcome_for_error(ctx, &requester.cloned(), e).await;
            }
            if let Err(e) = util::finalizer::add(ctx.client.clone(), &ns, &sleeper_name, FINALIZER_PROVIDER).await {
                return outcome_for_error(ctx, &requester.cloned(), e).await;
            }
            ReconcileOutcome::Retry
        }

        Action::EnforceBudgetAndCreate { evict, create } => {
            if !evict.is_empty() {
                let api: Api<Pod> = Api::namespaced(ctx.client.clone(), &ns);
                for name in evict {
                    match api.delete(&name, &DeleteParams::default()).await {
                        Ok(_) => {}
                        Err(kube::Error::Api(ae)) if ae.code == 404 => {}
                        Err(e) => {
                            if !vllm_dualpod_types::is_retryable_kube_error(&e) {
                                return outcome_for_error(ctx, &requester.cloned(), e.into()).await;
                            }
                        }
                    }
                }
                return ReconcileOutcome::Retry;
            }
            debug_assert!(create);
            ReconcileOutcome::Retry
        }

        Action::CreateProvider { pod } => {
            let api: Api<Pod> = Api::namespaced(ctx.client.clone(), &ns);
            match api.create(&kube::api::PostParams::default(), &pod).await {
                Ok(_) => ReconcileOutcome::Retry,
                Err(e) => outcome_for_error(ctx, &requester.cloned(), e.into()).await,
            }
        }

        Action::MultipleProvidersBound { count } => ReconcileOutcome::Fatal(Error::MultipleProvidersBound {
            uid: server_ref.uid.clone(),
            name: server_ref.name.clone(),
            count,
        }),

        Action::NeedsBindOrCreate => {
            // Only reached if `resolve_bind_or_create` was skipped;
            // shouldn't happen given the check in `reconcile_one`.
            ReconcileOutcome::Retry
        }
    }
}

async fn relay_readiness(
    ctx: &Arc<ReconcilerContext>,
    node: &str,
    server_ref: &InferenceServerRef,
    requester_ip: &str,
    admin_port: &str,
    ready: bool,
) -> Result<(), Error> {
    let already_relayed = ctx
        .nodes
        .with_node(node, |ns| ns.servers.get(server_ref).and_then(|s| s.readiness_relayed));
    if already_relayed == Some(ready) {
        return Ok(());
    }
    if ready {
        http::requester::become_ready(&ctx.http, requester_ip, admin_port).await?;
    } else {
        http::requester::become_unready(&ctx.http, requester_ip, admin_port).await?;
    }
    ctx.nodes.with_node(node, |ns| {
        ns.servers.entry(server_ref.clone()).or_default().readiness_relayed = Some(ready);
    });
    Ok(())
}

async fn delete_with_preconditions(ctx: &Arc<ReconcilerContext>, name: &str, pod: Option<&Pod>) -> Result<(), Error> {
    let api: Api<Pod> = Api::namespaced(ctx.client.clone(), &ctx.config.namespace);
    let mut dp = DeleteParams::default();
    if let Some(pod) = pod {
        if let Some(uid) = &pod.metadata.uid {
            dp.preconditions = Some(Preconditions {
                uid: Some(uid.clone()),
                resource_version: pod.metadata.resource_version.clone(),
            });
        }
    }
    match api.delete(name, &dp).await {
        Ok(_) => Ok(()),
        Err(kube::Error::Api(ae)) if ae.code == 404 => Ok(()),
        Err(e) => Err(e.into()),
    }
}
