//! Per-node work scheduler: an unbounded FIFO of `WorkItem` tokens
//! drained by `N` workers, with an inflight dedupe set so a node is
//! never owned by two workers at once (§4.3). The node's pending
//! inference-server references live in `NodeRegistry`; the queue only
//! ever carries tokens, never payloads, so a burst of events on one
//! node collapses into at most one pending token for it.

use std::collections::{HashMap, HashSet};
use std::sync::Mutex;

use tokio::sync::{mpsc, Mutex as AsyncMutex};

use crate::model::{InferenceServerRef, NodeServers, WorkItem};

/// Registry of per-node in-memory reconciler state, keyed by node
/// name. Lazily created, never removed (§3: NodeState "never
/// deleted"). Lock order: callers take this lock, do their mutation,
/// and drop it before touching any per-node `NodeServers`'s internal
/// mutex (there isn't one — `NodeServers` itself lives behind this
/// single registry mutex, since per-node contention is already
/// serialized by the single-worker-per-node discipline).
#[derive(Default)]
pub struct NodeRegistry {
    nodes: Mutex<HashMap<String, NodeServers>>,
}

impl NodeRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_node<R>(&self, node: &str, f: impl FnOnce(&mut NodeServers) -> R) -> R {
        let mut nodes = self.nodes.lock().unwrap();
        let entry = nodes.entry(node.to_string()).or_default();
        f(entry)
    }

    pub fn known_nodes(&self) -> Vec<String> {
        self.nodes.lock().unwrap().keys().cloned().collect()
    }
}

/// Race-free FIFO scheduler. `work_set` (the per-node pending
/// references-to-reconcile) is always mutated *before* the `inflight`
/// dedupe set is consulted, both in `enqueue` and in `finish_node`.
/// This ordering is what guarantees no lost wakeups: if a worker is
/// about to finish a node and release its inflight slot, and a
/// concurrent enqueue races it, the enqueue's work_set write is
/// visible to `finish_node`'s re-check under the same lock, so either
/// the worker resends the token itself or `finish_node` does — never
/// neither.
pub struct WorkQueue {
    sender: mpsc::UnboundedSender<WorkItem>,
    receiver: AsyncMutex<mpsc::UnboundedReceiver<WorkItem>>,
    /// Nodes with a token currently in flight or in the channel,
    /// mapped to whether a pending work item has also been added.
    /// Used only to avoid queuing duplicate `WorkItem::Node` tokens.
    inflight: Mutex<HashSet<String>>,
    /// Pending inference-server references per node, populated by
    /// `Store::ingest_pod`/`remove_pod` callers before `enqueue_node`.
    pub pending: Mutex<HashMap<String, HashSet<InferenceServerRef>>>,
}

impl WorkQueue {
    pub fn new() -> Self {
        let (sender, receiver) = mpsc::unbounded_channel();
        WorkQueue {
            sender,
            receiver: AsyncMutex::new(receiver),
            inflight: Mutex::new(HashSet::new()),
            pending: Mutex::new(HashMap::new()),
        }
    }

    /// Adds `server_ref` to `node`'s pending set and enqueues a token
    /// for `node` iff one isn't already inflight.
    pub fn enqueue_server_ref(&self, node: &str, server_ref: InferenceServerRef) {
        self.pending
            .lock()
            .unwrap()
            .entry(node.to_string())
            .or_default()
            .insert(server_ref);
        self.enqueue_node(node);
    }

    /// Enqueues a bare node token (e.g. from the gpu-map fan-out,
    /// which already populated `pending` for every known node).
    pub fn enqueue_node(&self, node: &str) {
        let mut inflight = self.inflight.lock().unwrap();
        if inflight.insert(node.to_string()) {
            let _ = self.sender.send(WorkItem::Node(node.to_string()));
        }
    }

    pub fn enqueue_configmap(&self) {
        let _ = self.sender.send(WorkItem::ConfigMap);
    }

    pub fn enqueue_sentinel(&self) {
        let _ = self.sender.send(WorkItem::Sentinel);
    }

    /// Blocks until a token is available. Workers race for the
    /// receiver's async lock; whichever gets it next owns the next
    /// token. Safe for N concurrent callers.
    pub async fn recv(&self) -> Option<WorkItem> {
        let mut receiver = self.receiver.lock().await;
        receiver.recv().await
    }

    /// Drains `node`'s pending set, removing it from `pending`.
    pub fn take_pending(&self, node: &str) -> HashSet<InferenceServerRef> {
        self.pending.lock().unwrap().remove(node).unwrap_or_default()
    }

    /// Called by a worker once it has finished processing a node's
    /// work set. If more references were added to `pending` while the
    /// worker was processing (a concurrent enqueue raced it), re-sends
    /// a token immediately; otherwise clears the inflight marker so a
    /// future enqueue will send a fresh token.
    pub fn finish_node(&self, node: &str) {
        let still_pending = self.pending.lock().unwrap().contains_key(node);
        if still_pending {
            let _ = self.sender.send(WorkItem::Node(node.to_string()));
        } else {
            self.inflight.lock().unwrap().remove(node);
        }
    }
}

impl Default for WorkQueue {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn duplicate_enqueues_collapse_to_one_token() {
        let q = WorkQueue::new();
        q.enqueue_server_ref("node-a", InferenceServerRef::new("u1", "r1"));
        q.enqueue_server_ref("node-a", InferenceServerRef::new("u2", "r2"));
        q.enqueue_server_ref("node-a", InferenceServerRef::new("u1", "r1"));

        let item = q.recv().await.unwrap();
        assert_eq!(item, WorkItem::Node("node-a".to_string()));

        let pending = q.take_pending("node-a");
        assert_eq!(pending.len(), 2);

        q.finish_node("node-a");
        // no further enqueue happened meanwhile, so no second token.
        assert!(q.pending.lock().unwrap().get("node-a").is_none());
    }

    #[tokio::test]
    async fn enqueue_racing_finish_node_resends_token() {
        let q = WorkQueue::new();
        q.enqueue_server_ref("node-a", InferenceServerRef::new("u1", "r1"));
        let _ = q.recv().await.unwrap();
        let _ = q.take_pending("node-a");

        // a concurrent enqueue arrives while the worker is still
        // processing the drained batch, before finish_node runs.
        q.enqueue_server_ref("node-a", InferenceServerRef::new("u2", "r2"));

        q.finish_node("node-a");

        // inflight was still set from the first token, so the second
        // enqueue_server_ref did not itself send one; finish_node must
        // see the pending entry and resend, or the item would be stuck
        // forever.
        let item = q.recv().await.unwrap();
        assert_eq!(item, WorkItem::Node("node-a".to_string()));
    }

    #[tokio::test]
    async fn distinct_nodes_each_get_a_token() {
        let q = WorkQueue::new();
        q.enqueue_server_ref("node-a", InferenceServerRef::new("u1", "r1"));
        q.enqueue_server_ref("node-b", InferenceServerRef::new("u2", "r2"));

        let mut seen = HashSet::new();
        for _ in 0..2 {
            if let Some(WorkItem::Node(n)) = q.recv().await {
                seen.insert(n);
            }
        }
        assert!(seen.contains("node-a"));
        assert!(seen.contains("node-b"));
    }
}
