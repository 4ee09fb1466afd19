//! Per-connection session loop.
//!
//! One task drives each link. It selects between bytes arriving from the
//! peer (frame decode, ACK queued, upward delivery) and payloads queued by
//! senders (sequence assignment, DATA frame queued). A separate writer task
//! owns the write half, so a peer that is slow to read never stops this
//! side from reading. Inbound frames are handed upward in the order they
//! were received.

use crate::error::{LinkError, SessionError};
use crate::handshake::DEFAULT_HANDSHAKE_TIMEOUT;
use crate::reliability::{LinkConfig, LinkReliability, LinkStats};
use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use reload_wire::{
    Codec, FrameDecoder, FramedMessage, FramedMessageCodec, NodeId, WireError,
    DEFAULT_NODE_ID_LENGTH, MAX_FRAME_PAYLOAD,
};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::{mpsc, oneshot, Notify};
use tracing::{debug, info, trace, warn};

/// Default read buffer size
pub const DEFAULT_READ_BUFFER: usize = 64 * 1024;

/// Time a closing session waits for queued frames to be written
const WRITER_FLUSH_TIMEOUT: Duration = Duration::from_secs(1);

/// Configuration shared by all sessions of a node
#[derive(Clone, Debug)]
pub struct SessionConfig {
    /// This node's id, sent in the link handshake
    pub local_node_id: NodeId,
    /// Link reliability parameters
    pub link: LinkConfig,
    /// Time allowed for the link handshake
    pub handshake_timeout: Duration,
    /// First reconnect delay of an outbound link
    pub reconnect_min: Duration,
    /// Largest reconnect delay of an outbound link
    pub reconnect_max: Duration,
    /// Initial capacity of the read buffer
    pub read_buffer_size: usize,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            local_node_id: NodeId::random(DEFAULT_NODE_ID_LENGTH),
            link: LinkConfig::default(),
            handshake_timeout: DEFAULT_HANDSHAKE_TIMEOUT,
            reconnect_min: Duration::from_secs(1),
            reconnect_max: Duration::from_secs(30),
            read_buffer_size: DEFAULT_READ_BUFFER,
        }
    }
}

/// Receives messages arriving on a link
#[async_trait]
pub trait InboundHandler: Send + Sync {
    /// Called for each DATA frame, in receive order, on the link's task
    async fn on_message(&self, neighbor: &NodeId, payload: Bytes);
}

/// Payload queued for a link
#[derive(Debug)]
pub struct OutboundFrame {
    /// Encoded message
    pub payload: Bytes,
    /// Resolved when the frame is acknowledged or fails
    pub completion: oneshot::Sender<Result<(), LinkError>>,
}

/// Sending side of a session
#[derive(Debug, Clone)]
pub struct SessionHandle {
    neighbor: NodeId,
    id: u64,
    outbound: mpsc::UnboundedSender<OutboundFrame>,
    reliability: Arc<LinkReliability>,
    shutdown: Arc<Notify>,
}

impl SessionHandle {
    /// Neighbor at the other end
    pub fn neighbor(&self) -> &NodeId {
        &self.neighbor
    }

    /// Locally unique session id
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Queue `payload`; the receiver resolves when it is acknowledged
    pub fn enqueue(
        &self,
        payload: Bytes,
    ) -> Result<oneshot::Receiver<Result<(), LinkError>>, LinkError> {
        if payload.len() > MAX_FRAME_PAYLOAD {
            return Err(LinkError::Framing(WireError::FieldOverflow {
                width_bits: 24,
                len: payload.len(),
            }));
        }
        let (completion, rx) = oneshot::channel();
        self.outbound
            .send(OutboundFrame {
                payload,
                completion,
            })
            .map_err(|_| LinkError::Closed)?;
        Ok(rx)
    }

    /// Send `payload` and wait for its ACK
    pub async fn send(&self, payload: Bytes) -> Result<(), LinkError> {
        let rx = self.enqueue(payload)?;
        rx.await.unwrap_or(Err(LinkError::Closed))
    }

    /// Ask the session task to stop
    pub fn close(&self) {
        self.shutdown.notify_one();
    }

    /// Whether the session task has stopped
    pub fn is_closed(&self) -> bool {
        self.outbound.is_closed()
    }

    /// Link counters
    pub fn stats(&self) -> LinkStats {
        self.reliability.stats()
    }
}

/// A link session, consumed by [`Session::run`]
pub struct Session {
    neighbor: NodeId,
    reliability: Arc<LinkReliability>,
    outbound: mpsc::UnboundedReceiver<OutboundFrame>,
    shutdown: Arc<Notify>,
    read_buffer_size: usize,
}

impl Session {
    /// Create a session for `neighbor` and its sending handle
    pub fn new(neighbor: NodeId, id: u64, config: &SessionConfig) -> (Self, SessionHandle) {
        let reliability = LinkReliability::new(&config.link);
        let (tx, rx) = mpsc::unbounded_channel();
        let shutdown = Arc::new(Notify::new());

        let handle = SessionHandle {
            neighbor: neighbor.clone(),
            id,
            outbound: tx,
            reliability: reliability.clone(),
            shutdown: shutdown.clone(),
        };
        let session = Self {
            neighbor,
            reliability,
            outbound: rx,
            shutdown,
            read_buffer_size: config.read_buffer_size,
        };
        (session, handle)
    }

    /// Drive the link until EOF, an I/O or framing error, or close.
    ///
    /// Every in-flight transmission fails with [`LinkError::Closed`] when
    /// the loop ends.
    pub async fn run<S>(self, stream: S, inbound: Arc<dyn InboundHandler>) -> Result<(), SessionError>
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        let Session {
            neighbor,
            reliability,
            mut outbound,
            shutdown,
            read_buffer_size,
        } = self;

        info!(neighbor = %neighbor, "session started");
        let (mut reader, writer) = tokio::io::split(stream);
        let (frames, frames_rx) = mpsc::unbounded_channel();
        let mut writer_task = tokio::spawn(write_frames(neighbor.clone(), writer, frames_rx));
        let mut writer_done = false;

        let mut decoder = FrameDecoder::new();
        let mut read_buf = BytesMut::with_capacity(read_buffer_size);

        let result = loop {
            tokio::select! {
                biased;

                _ = shutdown.notified() => {
                    debug!(neighbor = %neighbor, "session close requested");
                    break Ok(());
                }

                written = &mut writer_task => {
                    writer_done = true;
                    break match written {
                        Ok(result) => result,
                        Err(e) => Err(std::io::Error::new(std::io::ErrorKind::Other, e).into()),
                    };
                }

                read = reader.read_buf(&mut read_buf) => {
                    match read {
                        Ok(0) => {
                            debug!(neighbor = %neighbor, "peer closed link");
                            break Ok(());
                        }
                        Ok(n) => trace!(neighbor = %neighbor, bytes = n, "read"),
                        Err(e) => break Err(e.into()),
                    }
                    if let Err(e) = drain_frames(
                        &neighbor,
                        &reliability,
                        &mut decoder,
                        &mut read_buf,
                        &frames,
                        inbound.as_ref(),
                    )
                    .await
                    {
                        break Err(e);
                    }
                }

                Some(frame) = outbound.recv() => {
                    let data = reliability.register(frame.payload, frame.completion);
                    trace!(neighbor = %neighbor, sequence = data.sequence(), "queued data frame");
                    // A closed writer surfaces through the writer branch
                    let _ = frames.send(data);
                }
            }
        };

        reliability.close();
        outbound.close();
        while let Ok(frame) = outbound.try_recv() {
            let _ = frame.completion.send(Err(LinkError::Closed));
        }

        // Let the writer flush queued frames, unless the peer stopped reading
        drop(frames);
        if !writer_done
            && tokio::time::timeout(WRITER_FLUSH_TIMEOUT, &mut writer_task)
                .await
                .is_err()
        {
            writer_task.abort();
        }

        match &result {
            Ok(()) => info!(neighbor = %neighbor, stats = ?reliability.stats(), "session ended"),
            Err(e) => warn!(neighbor = %neighbor, error = %e, "session ended with error"),
        }
        result
    }
}

/// Encode and write queued frames in order until the queue closes
async fn write_frames<W>(
    neighbor: NodeId,
    mut writer: W,
    mut frames: mpsc::UnboundedReceiver<FramedMessage>,
) -> Result<(), SessionError>
where
    W: AsyncWrite + Unpin,
{
    let mut buf = BytesMut::new();
    while let Some(frame) = frames.recv().await {
        buf.clear();
        if let Err(e) = FramedMessageCodec.encode(&frame, &mut buf) {
            // Checked in `enqueue`; unreachable for well-formed payloads.
            warn!(neighbor = %neighbor, error = %e, "dropping unframeable frame");
            continue;
        }
        writer.write_all(&buf).await?;
        trace!(neighbor = %neighbor, sequence = frame.sequence(), "wrote frame");
    }
    let _ = writer.shutdown().await;
    Ok(())
}

async fn drain_frames(
    neighbor: &NodeId,
    reliability: &LinkReliability,
    decoder: &mut FrameDecoder,
    read_buf: &mut BytesMut,
    frames: &mpsc::UnboundedSender<FramedMessage>,
    inbound: &dyn InboundHandler,
) -> Result<(), SessionError> {
    while let Some(frame) = decoder.decode(read_buf)? {
        match frame {
            FramedMessage::Data { sequence, payload } => {
                let _ = frames.send(reliability.on_data(sequence));
                inbound.on_message(neighbor, payload).await;
            }
            FramedMessage::Ack { sequence, received } => {
                reliability.on_ack(sequence, received);
            }
        }
    }
    Ok(())
}
