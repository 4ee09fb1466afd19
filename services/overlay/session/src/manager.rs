//! Connection manager: the set of live links of a node.
//!
//! Maps each neighbor to the handle of its session, accepts and dials TCP
//! connections, and tells registered observers when links come up, go down
//! or fail a transmission. Upper layers send through the [`NeighborLinks`]
//! interface and never see sockets.

use crate::error::{LinkError, SessionError};
use crate::handshake::perform_handshake;
use crate::reliability::LinkStats;
use crate::session::{InboundHandler, Session, SessionConfig, SessionHandle};
use crate::transport::{connect_tcp, listen_tcp};
use async_trait::async_trait;
use bytes::Bytes;
use dashmap::DashMap;
use once_cell::sync::OnceCell;
use reload_wire::NodeId;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// Sending side of the link layer as seen by routing
#[async_trait]
pub trait NeighborLinks: Send + Sync {
    /// Send `payload` to a directly connected neighbor; resolves when the
    /// frame is acknowledged or the transmission fails
    async fn send(&self, neighbor: &NodeId, payload: Bytes) -> Result<(), LinkError>;

    /// Currently connected neighbors
    fn neighbors(&self) -> Vec<NodeId>;

    /// Whether a link to `neighbor` is up
    fn is_connected(&self, neighbor: &NodeId) -> bool;
}

/// Observer of link lifecycle events
pub trait LinkEventHandler: Send + Sync {
    /// A link to `neighbor` completed its handshake
    fn on_link_up(&self, neighbor: &NodeId);

    /// The last link to `neighbor` closed
    fn on_link_down(&self, neighbor: &NodeId);

    /// A transmission to `neighbor` failed
    fn on_transmission_failed(&self, neighbor: &NodeId, error: &LinkError);
}

/// Inbound handler used until one is installed
struct Unrouted;

#[async_trait]
impl InboundHandler for Unrouted {
    async fn on_message(&self, neighbor: &NodeId, payload: Bytes) {
        warn!(neighbor = %neighbor, bytes = payload.len(), "no inbound handler, dropping message");
    }
}

/// Owns every session of the local node
pub struct ConnectionManager {
    config: SessionConfig,
    sessions: DashMap<NodeId, SessionHandle>,
    next_session_id: AtomicU64,
    inbound: OnceCell<Arc<dyn InboundHandler>>,
    observers: RwLock<Vec<Arc<dyn LinkEventHandler>>>,
    shutdown: watch::Sender<bool>,
}

impl ConnectionManager {
    /// Create a manager with no links
    pub fn new(config: SessionConfig) -> Arc<Self> {
        let (shutdown, _) = watch::channel(false);
        Arc::new(Self {
            config,
            sessions: DashMap::new(),
            next_session_id: AtomicU64::new(1),
            inbound: OnceCell::new(),
            observers: RwLock::new(Vec::new()),
            shutdown,
        })
    }

    /// Local node id
    pub fn local_node_id(&self) -> &NodeId {
        &self.config.local_node_id
    }

    /// Session configuration
    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    /// Install the receiver of inbound messages. Only the first call takes
    /// effect.
    pub fn set_inbound_handler(&self, handler: Arc<dyn InboundHandler>) {
        if self.inbound.set(handler).is_err() {
            warn!("inbound handler already set, ignoring");
        }
    }

    /// Register an observer of link events
    pub fn add_event_handler(&self, handler: Arc<dyn LinkEventHandler>) {
        self.observers
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .push(handler);
    }

    fn notify(&self, event: impl Fn(&dyn LinkEventHandler)) {
        let observers = self
            .observers
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone();
        for observer in observers {
            event(observer.as_ref());
        }
    }

    fn inbound_handler(&self) -> Arc<dyn InboundHandler> {
        match self.inbound.get() {
            Some(handler) => handler.clone(),
            None => Arc::new(Unrouted),
        }
    }

    fn is_shutting_down(&self) -> bool {
        *self.shutdown.borrow()
    }

    /// Run the link handshake on `stream`, register the session and spawn
    /// its task. Returns the neighbor and the session task, which finishes
    /// once the link is closed and unregistered.
    pub async fn attach<S>(
        self: &Arc<Self>,
        mut stream: S,
    ) -> Result<(NodeId, JoinHandle<()>), SessionError>
    where
        S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        if self.is_shutting_down() {
            return Err(SessionError::Shutdown);
        }

        let neighbor = perform_handshake(
            &mut stream,
            &self.config.local_node_id,
            self.config.handshake_timeout,
        )
        .await?;

        let id = self.next_session_id.fetch_add(1, Ordering::Relaxed);
        let (session, handle) = Session::new(neighbor.clone(), id, &self.config);

        match self.sessions.insert(neighbor.clone(), handle) {
            Some(previous) => {
                info!(neighbor = %neighbor, session = id, "replacing existing link");
                previous.close();
            }
            None => {
                info!(neighbor = %neighbor, session = id, "link up");
                self.notify(|observer| observer.on_link_up(&neighbor));
            }
        }

        let inbound = self.inbound_handler();
        let manager = Arc::clone(self);
        let task_neighbor = neighbor.clone();
        let task = tokio::spawn(async move {
            if let Err(e) = session.run(stream, inbound).await {
                debug!(neighbor = %task_neighbor, error = %e, "session failed");
            }
            manager.unregister(&task_neighbor, id);
        });

        Ok((neighbor, task))
    }

    fn unregister(&self, neighbor: &NodeId, id: u64) {
        // A replaced session must not evict its successor.
        if self
            .sessions
            .remove_if(neighbor, |_, handle| handle.id() == id)
            .is_some()
        {
            info!(neighbor = %neighbor, session = id, "link down");
            self.notify(|observer| observer.on_link_down(neighbor));
        }
    }

    /// Accept links on `addr`; returns the bound address
    pub async fn listen(self: &Arc<Self>, addr: SocketAddr) -> std::io::Result<SocketAddr> {
        let listener = listen_tcp(addr).await?;
        let local = listener.local_addr()?;
        info!(addr = %local, "accepting links");

        let manager = Arc::clone(self);
        let mut shutdown = self.shutdown.subscribe();
        tokio::spawn(async move {
            loop {
                let accepted = tokio::select! {
                    _ = shutdown.changed() => break,
                    accepted = listener.accept() => accepted,
                };
                match accepted {
                    Ok((stream, peer)) => {
                        if let Err(e) = stream.set_nodelay(true) {
                            debug!(peer = %peer, error = %e, "set_nodelay failed");
                        }
                        let manager = manager.clone();
                        tokio::spawn(async move {
                            if let Err(e) = manager.attach(stream).await {
                                warn!(peer = %peer, error = %e, "inbound link rejected");
                            }
                        });
                    }
                    Err(e) => error!(error = %e, "accept failed"),
                }
            }
            info!(addr = %local, "listener stopped");
        });

        Ok(local)
    }

    async fn connect(self: &Arc<Self>, addr: SocketAddr) -> Result<(NodeId, JoinHandle<()>), SessionError> {
        let stream = connect_tcp(addr).await?;
        self.attach(stream).await
    }

    /// Keep a link to `addr` up, reconnecting with exponential backoff
    pub fn dial(self: &Arc<Self>, addr: SocketAddr) -> JoinHandle<()> {
        let manager = Arc::clone(self);
        tokio::spawn(async move { manager.dial_loop(addr).await })
    }

    async fn dial_loop(self: Arc<Self>, addr: SocketAddr) {
        let mut shutdown = self.shutdown.subscribe();
        let mut backoff = self.config.reconnect_min;

        loop {
            if *shutdown.borrow() {
                break;
            }
            debug!(addr = %addr, "dialing");

            let outcome = tokio::select! {
                _ = shutdown.changed() => break,
                outcome = self.connect(addr) => outcome,
            };

            let wait = match outcome {
                Ok((neighbor, session)) => {
                    backoff = self.config.reconnect_min;
                    let _ = session.await;
                    debug!(addr = %addr, neighbor = %neighbor, "outbound link closed");
                    self.config.reconnect_min
                }
                Err(SessionError::Shutdown) => break,
                Err(e) => {
                    warn!(addr = %addr, error = %e, retry_in = ?backoff, "dial failed");
                    let wait = backoff;
                    backoff = (backoff * 2).min(self.config.reconnect_max);
                    wait
                }
            };

            tokio::select! {
                _ = shutdown.changed() => break,
                _ = tokio::time::sleep(wait) => {}
            }
        }
        debug!(addr = %addr, "dialer stopped");
    }

    /// Handle of the session with `neighbor`
    pub fn session(&self, neighbor: &NodeId) -> Option<SessionHandle> {
        self.sessions.get(neighbor).map(|entry| entry.value().clone())
    }

    /// Counters of the link to `neighbor`
    pub fn link_stats(&self, neighbor: &NodeId) -> Option<LinkStats> {
        self.sessions.get(neighbor).map(|entry| entry.stats())
    }

    /// Close the link to `neighbor`
    pub fn disconnect(&self, neighbor: &NodeId) {
        if let Some(handle) = self.session(neighbor) {
            handle.close();
        }
    }

    /// Stop listeners and dialers and close every link
    pub fn shutdown(&self) {
        info!(links = self.sessions.len(), "closing all links");
        self.shutdown.send_replace(true);
        for entry in self.sessions.iter() {
            entry.value().close();
        }
    }
}

#[async_trait]
impl NeighborLinks for ConnectionManager {
    async fn send(&self, neighbor: &NodeId, payload: Bytes) -> Result<(), LinkError> {
        let result = match self.session(neighbor) {
            Some(handle) => handle.send(payload).await,
            None => Err(LinkError::NotConnected(neighbor.clone())),
        };
        if let Err(e) = &result {
            warn!(neighbor = %neighbor, error = %e, "transmission failed");
            self.notify(|observer| observer.on_transmission_failed(neighbor, e));
        }
        result
    }

    fn neighbors(&self) -> Vec<NodeId> {
        self.sessions.iter().map(|entry| entry.key().clone()).collect()
    }

    fn is_connected(&self, neighbor: &NodeId) -> bool {
        self.sessions.contains_key(neighbor)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;
    use std::time::Duration;
    use tokio::sync::mpsc;

    fn node(b: u8) -> NodeId {
        NodeId::new(vec![b; 16])
    }

    fn manager(b: u8) -> Arc<ConnectionManager> {
        ConnectionManager::new(SessionConfig {
            local_node_id: node(b),
            ..SessionConfig::default()
        })
    }

    struct Collect(mpsc::UnboundedSender<(NodeId, Bytes)>);

    #[async_trait]
    impl InboundHandler for Collect {
        async fn on_message(&self, neighbor: &NodeId, payload: Bytes) {
            let _ = self.0.send((neighbor.clone(), payload));
        }
    }

    #[derive(Default)]
    struct Events(Mutex<Vec<String>>);

    impl LinkEventHandler for Events {
        fn on_link_up(&self, neighbor: &NodeId) {
            self.0.lock().unwrap().push(format!("up {}", neighbor));
        }
        fn on_link_down(&self, neighbor: &NodeId) {
            self.0.lock().unwrap().push(format!("down {}", neighbor));
        }
        fn on_transmission_failed(&self, neighbor: &NodeId, _error: &LinkError) {
            self.0.lock().unwrap().push(format!("failed {}", neighbor));
        }
    }

    async fn link(
        a: &Arc<ConnectionManager>,
        b: &Arc<ConnectionManager>,
    ) -> (JoinHandle<()>, JoinHandle<()>) {
        let (io_a, io_b) = tokio::io::duplex(64 * 1024);
        let (ra, rb) = tokio::join!(a.attach(io_a), b.attach(io_b));
        (ra.unwrap().1, rb.unwrap().1)
    }

    #[tokio::test]
    async fn test_attach_and_send() {
        let a = manager(0xA);
        let b = manager(0xB);
        let (tx, mut rx) = mpsc::unbounded_channel();
        b.set_inbound_handler(Arc::new(Collect(tx)));

        link(&a, &b).await;
        assert_eq!(a.neighbors(), vec![node(0xB)]);
        assert!(b.is_connected(&node(0xA)));

        a.send(&node(0xB), Bytes::from_static(b"hello")).await.unwrap();
        let (from, payload) = rx.recv().await.unwrap();
        assert_eq!(from, node(0xA));
        assert_eq!(&payload[..], b"hello");
        assert_eq!(a.link_stats(&node(0xB)).unwrap().acks_received, 1);
    }

    #[tokio::test]
    async fn test_send_to_unknown_neighbor() {
        let a = manager(0xA);
        let events = Arc::new(Events::default());
        a.add_event_handler(events.clone());

        let err = a.send(&node(9), Bytes::new()).await.unwrap_err();
        assert_eq!(err, LinkError::NotConnected(node(9)));
        assert_eq!(events.0.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_link_events() {
        let a = manager(0xA);
        let b = manager(0xB);
        let events = Arc::new(Events::default());
        a.add_event_handler(events.clone());

        let (task_a, task_b) = link(&a, &b).await;
        b.disconnect(&node(0xA));
        task_b.await.unwrap();
        task_a.await.unwrap();

        assert!(!a.is_connected(&node(0xB)));
        let seen = events.0.lock().unwrap().clone();
        assert_eq!(seen, vec![format!("up {}", node(0xB)), format!("down {}", node(0xB))]);
    }

    #[tokio::test]
    async fn test_replaced_link_keeps_neighbor() {
        let a = manager(0xA);
        let b = manager(0xB);
        let events = Arc::new(Events::default());
        a.add_event_handler(events.clone());

        let (first, _) = link(&a, &b).await;
        let first_id = a.session(&node(0xB)).unwrap().id();
        link(&a, &b).await;
        first.await.unwrap();

        let current = a.session(&node(0xB)).unwrap();
        assert_ne!(current.id(), first_id);
        assert_eq!(events.0.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_shutdown_rejects_attach() {
        let a = manager(0xA);
        a.shutdown();
        let (io, _peer) = tokio::io::duplex(64);
        assert!(matches!(a.attach(io).await, Err(SessionError::Shutdown)));
    }

    #[tokio::test]
    async fn test_dial_over_tcp() {
        let a = manager(0xA);
        let b = manager(0xB);
        let addr = b.listen("127.0.0.1:0".parse().unwrap()).await.unwrap();
        let dialer = a.dial(addr);

        let connected = async {
            while !a.is_connected(&node(0xB)) || !b.is_connected(&node(0xA)) {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        };
        tokio::time::timeout(Duration::from_secs(5), connected).await.unwrap();

        a.shutdown();
        b.shutdown();
        tokio::time::timeout(Duration::from_secs(5), dialer)
            .await
            .unwrap()
            .unwrap();
    }
}
