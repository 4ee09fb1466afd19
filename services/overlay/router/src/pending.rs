//! Pending request cache.
//!
//! Every request sent with [`crate::MessageRouter::send_request_message`]
//! gets an entry keyed by its transaction id. The entry is removed by
//! exactly one of: the matching answer, its expiry timer, or an explicit
//! failure (link down, shutdown). Request expiry is independent of link
//! timeouts.

use crate::error::{RequestError, RouterError};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use reload_wire::{Message, NodeId};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::task::{Context, Poll};
use std::time::Duration;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

/// Default lifetime of a pending request
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_millis(3000);

type Completion = oneshot::Sender<Result<Message, RequestError>>;

struct PendingRequest {
    completion: Completion,
    first_hops: HashSet<NodeId>,
    timer: Option<JoinHandle<()>>,
}

impl PendingRequest {
    fn complete(self, result: Result<Message, RequestError>) {
        if let Some(timer) = self.timer {
            timer.abort();
        }
        // The caller may have dropped its future.
        let _ = self.completion.send(result);
    }
}

/// Future of the answer to one request
#[derive(Debug)]
pub struct ResponseFuture {
    transaction_id: u64,
    rx: oneshot::Receiver<Result<Message, RequestError>>,
}

impl ResponseFuture {
    /// Transaction id of the request
    pub fn transaction_id(&self) -> u64 {
        self.transaction_id
    }
}

impl Future for ResponseFuture {
    type Output = Result<Message, RequestError>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        Pin::new(&mut self.rx)
            .poll(cx)
            .map(|result| result.unwrap_or(Err(RequestError::Shutdown)))
    }
}

/// Pending cache counters
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PendingStats {
    /// Requests currently pending
    pub pending: usize,
    /// Requests answered
    pub resolved: u64,
    /// Requests that expired
    pub timeouts: u64,
    /// Requests failed by link loss or shutdown
    pub failed: u64,
    /// Answers without a pending request
    pub unmatched: u64,
}

/// Time-bounded map of transaction id to waiting caller
pub struct PendingRequests {
    entries: DashMap<u64, PendingRequest>,
    timeout: Duration,
    me: Weak<PendingRequests>,
    resolved: AtomicU64,
    timeouts: AtomicU64,
    failed: AtomicU64,
    unmatched: AtomicU64,
}

impl PendingRequests {
    /// Cache whose entries expire after `timeout`; zero never expires
    pub fn new(timeout: Duration) -> Arc<Self> {
        Arc::new_cyclic(|me| Self {
            entries: DashMap::new(),
            timeout,
            me: me.clone(),
            resolved: AtomicU64::new(0),
            timeouts: AtomicU64::new(0),
            failed: AtomicU64::new(0),
            unmatched: AtomicU64::new(0),
        })
    }

    /// Entry lifetime
    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Register a request sent through `first_hops`
    pub fn register(
        &self,
        transaction_id: u64,
        first_hops: HashSet<NodeId>,
    ) -> Result<ResponseFuture, RouterError> {
        let slot = match self.entries.entry(transaction_id) {
            Entry::Occupied(_) => return Err(RouterError::DuplicateTransaction(transaction_id)),
            Entry::Vacant(slot) => slot,
        };

        let (completion, rx) = oneshot::channel();
        let timer = (!self.timeout.is_zero()).then(|| {
            let me = self.me.clone();
            let timeout = self.timeout;
            tokio::spawn(async move {
                tokio::time::sleep(timeout).await;
                if let Some(pending) = me.upgrade() {
                    pending.expire(transaction_id);
                }
            })
        });
        slot.insert(PendingRequest {
            completion,
            first_hops,
            timer,
        });

        Ok(ResponseFuture { transaction_id, rx })
    }

    fn expire(&self, transaction_id: u64) {
        if let Some((_, entry)) = self.entries.remove(&transaction_id) {
            self.timeouts.fetch_add(1, Ordering::Relaxed);
            debug!(transaction_id, "request timed out");
            // Running on the timer task; nothing to abort.
            let _ = entry.completion.send(Err(RequestError::Timeout));
        }
    }

    /// Complete the request answered by `answer`. Returns false when no
    /// request is pending under its transaction id.
    pub fn resolve(&self, answer: Message) -> bool {
        let transaction_id = answer.transaction_id();
        match self.entries.remove(&transaction_id) {
            Some((_, entry)) => {
                self.resolved.fetch_add(1, Ordering::Relaxed);
                entry.complete(Ok(answer));
                true
            }
            None => {
                self.unmatched.fetch_add(1, Ordering::Relaxed);
                warn!(transaction_id, "answer matches no pending request");
                false
            }
        }
    }

    /// Fail one request
    pub fn fail(&self, transaction_id: u64, error: RequestError) -> bool {
        match self.entries.remove(&transaction_id) {
            Some((_, entry)) => {
                self.failed.fetch_add(1, Ordering::Relaxed);
                entry.complete(Err(error));
                true
            }
            None => false,
        }
    }

    /// Forget `neighbor` as a first hop; requests left with no first hop
    /// fail with [`RequestError::LinkFailed`]. Returns how many failed.
    pub fn fail_routed_through(&self, neighbor: &NodeId) -> usize {
        let mut orphaned = Vec::new();
        for mut entry in self.entries.iter_mut() {
            if entry.first_hops.remove(neighbor) && entry.first_hops.is_empty() {
                orphaned.push(*entry.key());
            }
        }

        let failed = orphaned
            .into_iter()
            .filter(|id| self.fail(*id, RequestError::LinkFailed(neighbor.clone())))
            .count();
        if failed > 0 {
            debug!(neighbor = %neighbor, failed, "failed requests routed through lost link");
        }
        failed
    }

    /// Fail every pending request with [`RequestError::Shutdown`]
    pub fn shutdown(&self) {
        let ids: Vec<u64> = self.entries.iter().map(|e| *e.key()).collect();
        for id in ids {
            self.fail(id, RequestError::Shutdown);
        }
    }

    /// Number of pending requests
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether nothing is pending
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Whether `transaction_id` is pending
    pub fn contains(&self, transaction_id: u64) -> bool {
        self.entries.contains_key(&transaction_id)
    }

    /// Snapshot of the counters
    pub fn stats(&self) -> PendingStats {
        PendingStats {
            pending: self.entries.len(),
            resolved: self.resolved.load(Ordering::Relaxed),
            timeouts: self.timeouts.load(Ordering::Relaxed),
            failed: self.failed.load(Ordering::Relaxed),
            unmatched: self.unmatched.load(Ordering::Relaxed),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use reload_wire::{Content, Header};

    fn node(b: u8) -> NodeId {
        NodeId::new(vec![b; 16])
    }

    fn answer(transaction_id: u64) -> Message {
        let header = Header::builder(1).transaction_id(transaction_id).build();
        Message::new(
            header,
            Content::PingAnswer {
                response_id: 1,
                time: 2,
            },
        )
    }

    #[tokio::test(start_paused = true)]
    async fn test_answer_resolves_once() {
        let pending = PendingRequests::new(DEFAULT_REQUEST_TIMEOUT);
        let response = pending.register(7, HashSet::from([node(1)])).unwrap();

        assert!(pending.resolve(answer(7)));
        assert!(!pending.resolve(answer(7)));
        assert_eq!(response.await.unwrap().transaction_id(), 7);

        // The aborted timer never fires
        tokio::time::sleep(DEFAULT_REQUEST_TIMEOUT * 2).await;
        let stats = pending.stats();
        assert_eq!(stats.resolved, 1);
        assert_eq!(stats.unmatched, 1);
        assert_eq!(stats.timeouts, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_exactly_once() {
        let pending = PendingRequests::new(Duration::from_millis(3000));
        let response = pending.register(9, HashSet::new()).unwrap();

        tokio::time::advance(Duration::from_millis(2999)).await;
        assert!(pending.contains(9));

        assert_eq!(response.await, Err(RequestError::Timeout));
        assert!(!pending.contains(9));
        assert!(!pending.resolve(answer(9)));
        assert_eq!(pending.stats().timeouts, 1);
    }

    #[tokio::test]
    async fn test_unmatched_answer_is_ignored() {
        let pending = PendingRequests::new(DEFAULT_REQUEST_TIMEOUT);
        assert!(!pending.resolve(answer(1)));
        assert!(pending.is_empty());
    }

    #[tokio::test]
    async fn test_duplicate_transaction() {
        let pending = PendingRequests::new(DEFAULT_REQUEST_TIMEOUT);
        let _first = pending.register(5, HashSet::new()).unwrap();
        assert!(matches!(
            pending.register(5, HashSet::new()),
            Err(RouterError::DuplicateTransaction(5))
        ));
    }

    #[tokio::test]
    async fn test_link_failure_fails_only_orphaned() {
        let pending = PendingRequests::new(DEFAULT_REQUEST_TIMEOUT);
        let only_b = pending.register(1, HashSet::from([node(0xB)])).unwrap();
        let _b_and_c = pending
            .register(2, HashSet::from([node(0xB), node(0xC)]))
            .unwrap();
        let _only_c = pending.register(3, HashSet::from([node(0xC)])).unwrap();

        assert_eq!(pending.fail_routed_through(&node(0xB)), 1);
        assert_eq!(only_b.await, Err(RequestError::LinkFailed(node(0xB))));
        assert!(pending.contains(2));
        assert!(pending.contains(3));

        assert_eq!(pending.fail_routed_through(&node(0xC)), 2);
        assert!(pending.is_empty());
    }

    #[tokio::test]
    async fn test_shutdown_fails_all() {
        let pending = PendingRequests::new(DEFAULT_REQUEST_TIMEOUT);
        let a = pending.register(1, HashSet::new()).unwrap();
        let b = pending.register(2, HashSet::new()).unwrap();
        pending.shutdown();
        assert_eq!(a.await, Err(RequestError::Shutdown));
        assert_eq!(b.await, Err(RequestError::Shutdown));
        assert_eq!(pending.stats().failed, 2);
    }
}
