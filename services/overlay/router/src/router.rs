//! Message router.
//!
//! Sits on top of the forwarding core. Inbound, it runs the pipeline
//!
//! ```text
//! decode header -> overlay check -> forward decision -> decode payload
//!               -> verify signature -> answers: pending cache
//!                                   -> requests: handler (spawned)
//! ```
//!
//! where each stage's failure ends processing of the message. Outbound, it
//! signs and encodes messages, registers requests in the pending cache and
//! hands the bytes to the forwarding core's fan-out.

use crate::builder::MessageBuilder;
use crate::error::{HandlerError, RouterError};
use crate::handler::{AnswerHandler, HandlerRegistry, MessageHandler};
use crate::pending::{PendingRequests, PendingStats, ResponseFuture, DEFAULT_REQUEST_TIMEOUT};
use async_trait::async_trait;
use bytes::Bytes;
use reload_routing::{ForwardingCore, ForwardingStats, RoutingDecision, RoutingError};
use reload_session::{InboundHandler, LinkError, LinkEventHandler};
use reload_wire::{
    Content, ContentBlock, ContentType, ErrorCode, ForwardMessage, Header, Message, NodeId,
    Signer, DEFAULT_INITIAL_TTL,
};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::Semaphore;
use tracing::{debug, info, warn};

/// Default bound on concurrently running handlers
pub const DEFAULT_MAX_CONCURRENT_HANDLERS: usize = 256;

/// Router configuration
#[derive(Debug, Clone)]
pub struct RouterConfig {
    /// Lifetime of a pending request; zero never expires
    pub request_timeout: Duration,
    /// Handlers allowed to run at once
    pub max_concurrent_handlers: usize,
    /// TTL of messages originated here
    pub initial_ttl: u8,
    /// Answer undecodable requests with `INVALID_MESSAGE`
    pub answer_invalid_messages: bool,
}

impl Default for RouterConfig {
    fn default() -> Self {
        Self {
            request_timeout: DEFAULT_REQUEST_TIMEOUT,
            max_concurrent_handlers: DEFAULT_MAX_CONCURRENT_HANDLERS,
            initial_ttl: DEFAULT_INITIAL_TTL,
            answer_invalid_messages: true,
        }
    }
}

/// Router counters
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RouterStats {
    /// Messages received from neighbors
    pub received: u64,
    /// Messages sent from this peer
    pub sent: u64,
    /// Messages delivered to this peer
    pub delivered: u64,
    /// Requests handed to handlers
    pub dispatched: u64,
    /// Handlers that answered with an error
    pub handler_errors: u64,
    /// Messages dropped for an undecodable header or payload
    pub decode_failures: u64,
    /// Messages dropped for a bad signature
    pub verification_failures: u64,
    /// Error answers sent
    pub error_answers: u64,
    /// Pending request cache
    pub pending: PendingStats,
    /// Forwarding core
    pub forwarding: ForwardingStats,
}

#[derive(Default)]
struct Counters {
    received: AtomicU64,
    sent: AtomicU64,
    delivered: AtomicU64,
    dispatched: AtomicU64,
    handler_errors: AtomicU64,
    decode_failures: AtomicU64,
    verification_failures: AtomicU64,
    error_answers: AtomicU64,
}

/// Routes messages between the links, the pending request cache and the
/// registered handlers
pub struct MessageRouter {
    config: RouterConfig,
    forwarding: Arc<ForwardingCore>,
    signer: Arc<dyn Signer>,
    builder: MessageBuilder,
    handlers: HandlerRegistry,
    pending: Arc<PendingRequests>,
    handler_permits: Arc<Semaphore>,
    shutting_down: AtomicBool,
    counters: Counters,
    me: Weak<MessageRouter>,
}

impl MessageRouter {
    /// Create a router on top of `forwarding`, signing with `signer`
    pub fn new(
        config: RouterConfig,
        forwarding: Arc<ForwardingCore>,
        signer: Arc<dyn Signer>,
    ) -> Arc<Self> {
        let builder = MessageBuilder::new(
            forwarding.local_node_id().clone(),
            forwarding.overlay_hash(),
            config.initial_ttl,
        );
        let pending = PendingRequests::new(config.request_timeout);
        let handler_permits = Arc::new(Semaphore::new(config.max_concurrent_handlers.max(1)));
        Arc::new_cyclic(|me| Self {
            config,
            forwarding,
            signer,
            builder,
            handlers: HandlerRegistry::new(),
            pending,
            handler_permits,
            shutting_down: AtomicBool::new(false),
            counters: Counters::default(),
            me: me.clone(),
        })
    }

    /// Local node id
    pub fn local_node_id(&self) -> &NodeId {
        self.forwarding.local_node_id()
    }

    /// Configuration in use
    pub fn config(&self) -> &RouterConfig {
        &self.config
    }

    /// Builder for messages originated here
    pub fn builder(&self) -> &MessageBuilder {
        &self.builder
    }

    /// Forwarding core
    pub fn forwarding(&self) -> &Arc<ForwardingCore> {
        &self.forwarding
    }

    /// Pending request cache
    pub fn pending(&self) -> &Arc<PendingRequests> {
        &self.pending
    }

    /// Handle requests of `content_type` with `handler`
    pub fn register_handler(&self, content_type: ContentType, handler: Arc<dyn MessageHandler>) {
        debug!(content_type = %content_type, "registered handler");
        self.handlers.register(content_type, handler);
    }

    /// Receive answers that match no pending request
    pub fn register_answer_handler(&self, handler: Arc<dyn AnswerHandler>) {
        self.handlers.set_answer_handler(handler);
    }

    /// Send a message without waiting for an answer
    pub fn send_message(&self, mut message: Message) -> Result<(), RouterError> {
        let (decision, bytes) = self.prepare(&mut message)?;
        self.dispatch(decision, bytes);
        Ok(())
    }

    /// Send a request; the returned future resolves with its answer or
    /// fails after the request timeout
    pub fn send_request_message(&self, mut message: Message) -> Result<ResponseFuture, RouterError> {
        let (decision, bytes) = self.prepare(&mut message)?;
        let first_hops = match &decision {
            RoutingDecision::Forward(hops) => hops.clone(),
            RoutingDecision::Local => HashSet::new(),
        };
        let response = self.pending.register(message.transaction_id(), first_hops)?;
        self.dispatch(decision, bytes);
        Ok(response)
    }

    fn prepare(&self, message: &mut Message) -> Result<(RoutingDecision, Bytes), RouterError> {
        if self.is_shutting_down() {
            return Err(RouterError::Shutdown);
        }
        let decision = self.forwarding.route_outbound(&mut message.header)?;
        let bytes = self.encode(message)?;
        Ok((decision, bytes))
    }

    /// Sign `message` in place and encode it
    fn encode(&self, message: &mut Message) -> Result<Bytes, RouterError> {
        let codec = self.forwarding.codec();
        let raw_content = codec.encode_content(&ContentBlock {
            content: message.content.clone(),
            extensions: message.extensions.clone(),
        })?;
        message.security_block = self.signer.security_block(
            message.header.overlay_hash,
            message.header.transaction_id,
            &raw_content,
        )?;
        Ok(codec.assemble(&message.header, &raw_content, &message.security_block)?)
    }

    fn dispatch(&self, decision: RoutingDecision, bytes: Bytes) {
        self.counters.sent.fetch_add(1, Ordering::Relaxed);
        match decision {
            RoutingDecision::Forward(hops) => self.forwarding.fan_out(bytes, hops),
            RoutingDecision::Local => match self.forwarding.codec().decode_header(bytes) {
                Ok(forward) => self.deliver(forward),
                Err(e) => warn!(error = %e, "cannot re-read local message"),
            },
        }
    }

    /// Process a message addressed to this peer
    fn deliver(&self, forward: ForwardMessage) {
        self.counters.delivered.fetch_add(1, Ordering::Relaxed);
        let is_request = forward.is_request();
        let header = forward.header.clone();

        let decoded = match self.forwarding.codec().decode_payload(forward) {
            Ok(decoded) => decoded,
            Err(e) => {
                self.counters.decode_failures.fetch_add(1, Ordering::Relaxed);
                warn!(transaction_id = header.transaction_id, error = %e, "undecodable payload");
                if is_request && self.config.answer_invalid_messages {
                    self.answer_error(&header, ErrorCode::InvalidMessage, e.to_string());
                }
                return;
            }
        };

        let message = decoded.message;
        if let Err(e) = self.signer.verify_block(
            message.header.overlay_hash,
            message.header.transaction_id,
            &decoded.raw_content,
            &message.security_block,
        ) {
            self.counters
                .verification_failures
                .fetch_add(1, Ordering::Relaxed);
            debug!(transaction_id = message.transaction_id(), error = %e, "dropping unverified message");
            return;
        }

        if message.is_answer() {
            self.deliver_answer(message);
        } else {
            self.deliver_request(message);
        }
    }

    fn deliver_answer(&self, answer: Message) {
        if !self.pending.contains(answer.transaction_id()) {
            if let Some(handler) = self.handlers.answer_handler() {
                tokio::spawn(async move { handler.handle_answer(answer).await });
                return;
            }
        }
        self.pending.resolve(answer);
    }

    fn deliver_request(&self, request: Message) {
        if let Some(extension) = request.extensions.iter().find(|e| e.critical) {
            let info = format!("unknown extension {}", extension.extension_type);
            self.answer_error(&request.header, ErrorCode::UnknownExtension, info);
            return;
        }

        let content_type = request.content.content_type();
        let handler = match self.handlers.get(content_type) {
            Some(handler) => handler,
            None => {
                let e = if content_type.is_known() {
                    HandlerError::Unsupported
                } else {
                    HandlerError::UnknownType(content_type.code())
                };
                debug!(content_type = %content_type, "no handler");
                self.answer_error(&request.header, e.error_code(), e.info());
                return;
            }
        };

        let Some(router) = self.me.upgrade() else {
            return;
        };
        let permits = self.handler_permits.clone();
        self.counters.dispatched.fetch_add(1, Ordering::Relaxed);
        tokio::spawn(async move {
            let Ok(_permit) = permits.acquire_owned().await else {
                return;
            };
            router.run_handler(handler, request).await;
        });
    }

    async fn run_handler(&self, handler: Arc<dyn MessageHandler>, request: Message) {
        let content = match handler.handle(&request).await {
            Ok(content) => content,
            Err(e) => {
                self.counters.handler_errors.fetch_add(1, Ordering::Relaxed);
                debug!(transaction_id = request.transaction_id(), error = %e, "handler failed");
                Content::error(e.error_code(), e.info())
            }
        };
        let answer = self.builder.answer(&request.header, content);
        if let Err(e) = self.send_message(answer) {
            warn!(transaction_id = request.transaction_id(), error = %e, "cannot send answer");
        }
    }

    /// Answer a request processed here with an error
    fn answer_error(&self, request: &Header, code: ErrorCode, info: String) {
        self.counters.error_answers.fetch_add(1, Ordering::Relaxed);
        let answer = self.builder.error_answer(request, code, info);
        if let Err(e) = self.send_message(answer) {
            warn!(transaction_id = request.transaction_id, error = %e, "cannot send error answer");
        }
    }

    /// Answer a request that failed routing straight back to the neighbor it
    /// came from, in the request's own overlay
    fn reject(&self, forward: &ForwardMessage, neighbor: &NodeId, error: &RoutingError) {
        if !error.answers_sender() || !forward.is_request() {
            return;
        }
        let mut answer =
            self.builder
                .error_answer(&forward.header, error.error_code(), error.to_string());
        answer.header.overlay_hash = forward.header.overlay_hash;
        match self.encode(&mut answer) {
            Ok(bytes) => {
                self.counters.error_answers.fetch_add(1, Ordering::Relaxed);
                self.forwarding
                    .fan_out(bytes, HashSet::from([neighbor.clone()]));
            }
            Err(e) => warn!(neighbor = %neighbor, error = %e, "cannot encode error answer"),
        }
    }

    /// Whether [`MessageRouter::shutdown`] was called
    pub fn is_shutting_down(&self) -> bool {
        self.shutting_down.load(Ordering::Acquire)
    }

    /// Stop accepting messages and fail all pending requests
    pub fn shutdown(&self) {
        if self.shutting_down.swap(true, Ordering::AcqRel) {
            return;
        }
        self.handler_permits.close();
        self.pending.shutdown();
        info!(local = %self.local_node_id(), "message router shut down");
    }

    /// Snapshot of the counters
    pub fn stats(&self) -> RouterStats {
        let c = &self.counters;
        RouterStats {
            received: c.received.load(Ordering::Relaxed),
            sent: c.sent.load(Ordering::Relaxed),
            delivered: c.delivered.load(Ordering::Relaxed),
            dispatched: c.dispatched.load(Ordering::Relaxed),
            handler_errors: c.handler_errors.load(Ordering::Relaxed),
            decode_failures: c.decode_failures.load(Ordering::Relaxed),
            verification_failures: c.verification_failures.load(Ordering::Relaxed),
            error_answers: c.error_answers.load(Ordering::Relaxed),
            pending: self.pending.stats(),
            forwarding: self.forwarding.stats(),
        }
    }
}

#[async_trait]
impl InboundHandler for MessageRouter {
    async fn on_message(&self, neighbor: &NodeId, payload: Bytes) {
        if self.is_shutting_down() {
            return;
        }
        self.counters.received.fetch_add(1, Ordering::Relaxed);

        let mut forward = match self.forwarding.codec().decode_header(payload) {
            Ok(forward) => forward,
            Err(e) => {
                self.counters.decode_failures.fetch_add(1, Ordering::Relaxed);
                warn!(neighbor = %neighbor, error = %e, "dropping malformed message");
                return;
            }
        };

        match self.forwarding.route_inbound(&mut forward.header, neighbor) {
            Ok(RoutingDecision::Local) => self.deliver(forward),
            Ok(RoutingDecision::Forward(hops)) => {
                if let Err(e) = self.forwarding.forward(&forward, hops) {
                    warn!(transaction_id = forward.header.transaction_id, error = %e, "cannot forward");
                    self.reject(&forward, neighbor, &e);
                }
            }
            Err(e) => self.reject(&forward, neighbor, &e),
        }
    }
}

impl LinkEventHandler for MessageRouter {
    fn on_link_up(&self, neighbor: &NodeId) {
        debug!(neighbor = %neighbor, "link up");
    }

    fn on_link_down(&self, neighbor: &NodeId) {
        self.pending.fail_routed_through(neighbor);
    }

    fn on_transmission_failed(&self, neighbor: &NodeId, error: &LinkError) {
        debug!(neighbor = %neighbor, error = %error, "transmission failed");
    }
}
