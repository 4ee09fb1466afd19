//! Per-link reliability: sequence numbers, ACK bitmasks and adaptive
//! retransmission timeout.
//!
//! Every DATA frame gets the next sequence number of its link and a
//! [`Transmission`] record. The receiver acknowledges each DATA frame
//! immediately with an ACK carrying a bitmask of the 32 sequence numbers
//! before it that it has seen. A matching ACK completes the transmission and
//! feeds its round-trip time into the [`RttEstimator`]; if no ACK arrives
//! before the link timeout the send fails. Frames are never retransmitted.

use crate::error::LinkError;
use bytes::Bytes;
use dashmap::DashMap;
use reload_wire::FramedMessage;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::time::Duration;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, warn};

/// Link timeout used before the first RTT sample
pub const DEFAULT_INITIAL_LINK_TIMEOUT: Duration = Duration::from_millis(3000);
/// Lower bound of the adaptive link timeout
pub const MIN_LINK_TIMEOUT: Duration = Duration::from_millis(1000);
/// Upper bound of the adaptive link timeout
pub const MAX_LINK_TIMEOUT: Duration = Duration::from_millis(10000);
/// Number of sequence numbers covered by an ACK bitmask
pub const RECEIVE_WINDOW: usize = 32;

/// Link reliability parameters
#[derive(Debug, Clone)]
pub struct LinkConfig {
    /// Timeout before any RTT sample; zero disables ACK timers
    pub initial_timeout: Duration,
    /// Received sequence numbers remembered for ACK bitmasks
    pub receive_window: usize,
}

impl Default for LinkConfig {
    fn default() -> Self {
        Self {
            initial_timeout: DEFAULT_INITIAL_LINK_TIMEOUT,
            receive_window: RECEIVE_WINDOW,
        }
    }
}

/// Smoothed RTT estimator (RFC 6298 gains, clamped timeout)
#[derive(Debug, Clone)]
pub struct RttEstimator {
    srtt: Option<Duration>,
    rttvar: Duration,
    initial: Duration,
}

impl RttEstimator {
    /// Estimator that reports `initial` until the first sample
    pub fn new(initial: Duration) -> Self {
        Self {
            srtt: None,
            rttvar: Duration::ZERO,
            initial,
        }
    }

    /// Feed one round-trip sample
    pub fn update(&mut self, sample: Duration) {
        match self.srtt {
            None => {
                self.srtt = Some(sample);
                self.rttvar = sample / 2;
            }
            Some(srtt) => {
                let delta = if srtt > sample {
                    srtt - sample
                } else {
                    sample - srtt
                };
                self.rttvar = (self.rttvar * 3 + delta) / 4;
                self.srtt = Some((srtt * 7 + sample) / 8);
            }
        }
    }

    /// Smoothed round-trip time, if sampled
    pub fn srtt(&self) -> Option<Duration> {
        self.srtt
    }

    /// Round-trip variance
    pub fn rttvar(&self) -> Duration {
        self.rttvar
    }

    /// Current link timeout
    pub fn timeout(&self) -> Duration {
        match self.srtt {
            None => self.initial,
            Some(srtt) => (srtt + self.rttvar * 4).clamp(MIN_LINK_TIMEOUT, MAX_LINK_TIMEOUT),
        }
    }
}

/// Ring of recently received sequence numbers
#[derive(Debug, Clone)]
pub struct ReceivedWindow {
    recent: VecDeque<u32>,
    capacity: usize,
}

impl ReceivedWindow {
    /// Window remembering `capacity` sequence numbers
    pub fn new(capacity: usize) -> Self {
        Self {
            recent: VecDeque::with_capacity(capacity),
            capacity,
        }
    }

    /// Bitmask for `sequence`: bit `i` is set when `sequence - 1 - i` was
    /// received. Computed before `sequence` itself is recorded.
    pub fn mask_for(&self, sequence: u32) -> u32 {
        let mut mask = 0u32;
        for seen in &self.recent {
            let distance = sequence.wrapping_sub(*seen);
            if (1..=32).contains(&distance) {
                mask |= 1 << (distance - 1);
            }
        }
        mask
    }

    /// Record `sequence`, evicting the oldest entry when full
    pub fn record(&mut self, sequence: u32) {
        if self.capacity == 0 {
            return;
        }
        if self.recent.len() == self.capacity {
            self.recent.pop_front();
        }
        self.recent.push_back(sequence);
    }
}

/// Counters for one link
#[derive(Debug, Clone, Default)]
pub struct LinkStats {
    /// DATA frames sent
    pub frames_sent: u64,
    /// DATA frames received
    pub frames_received: u64,
    /// ACKs matching a transmission
    pub acks_received: u64,
    /// ACKs with no matching transmission
    pub unmatched_acks: u64,
    /// Transmissions that timed out
    pub timeouts: u64,
    /// Link timeout in effect after the last timeout
    pub last_timeout: Option<Duration>,
    /// Smoothed RTT
    pub srtt: Option<Duration>,
}

/// An in-flight DATA frame awaiting its ACK
#[derive(Debug)]
pub struct Transmission {
    started: Instant,
    completion: oneshot::Sender<Result<(), LinkError>>,
    timer: Option<JoinHandle<()>>,
}

impl Transmission {
    fn complete(self, result: Result<(), LinkError>) {
        if let Some(timer) = self.timer {
            timer.abort();
        }
        // The sender may have stopped waiting.
        let _ = self.completion.send(result);
    }
}

struct LinkState {
    rtt: RttEstimator,
    received: ReceivedWindow,
    stats: LinkStats,
}

/// Reliability state of one link, shared by its session task and senders
pub struct LinkReliability {
    next_sequence: AtomicU32,
    in_flight: DashMap<u32, Transmission>,
    state: Mutex<LinkState>,
    timers_enabled: bool,
    me: Weak<LinkReliability>,
}

impl std::fmt::Debug for LinkReliability {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LinkReliability")
            .field("next_sequence", &self.next_sequence.load(Ordering::Relaxed))
            .field("in_flight", &self.in_flight.len())
            .finish()
    }
}

impl LinkReliability {
    /// Create the reliability state for a new link
    pub fn new(config: &LinkConfig) -> Arc<Self> {
        Self::with_first_sequence(config, rand::random())
    }

    /// Create the reliability state starting at `first` (wrapping)
    pub fn with_first_sequence(config: &LinkConfig, first: u32) -> Arc<Self> {
        Arc::new_cyclic(|me| Self {
            next_sequence: AtomicU32::new(first),
            in_flight: DashMap::new(),
            state: Mutex::new(LinkState {
                rtt: RttEstimator::new(config.initial_timeout),
                received: ReceivedWindow::new(config.receive_window),
                stats: LinkStats::default(),
            }),
            timers_enabled: !config.initial_timeout.is_zero(),
            me: me.clone(),
        })
    }

    fn state(&self) -> MutexGuard<'_, LinkState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Assign a sequence number to `payload`, record the transmission and
    /// return the DATA frame to write. `completion` resolves on ACK,
    /// timeout or close.
    pub fn register(
        &self,
        payload: Bytes,
        completion: oneshot::Sender<Result<(), LinkError>>,
    ) -> FramedMessage {
        let sequence = self.next_sequence.fetch_add(1, Ordering::Relaxed);
        let timeout = {
            let mut state = self.state();
            state.stats.frames_sent += 1;
            state.rtt.timeout()
        };

        let started = Instant::now();
        self.in_flight.insert(
            sequence,
            Transmission {
                started,
                completion,
                timer: None,
            },
        );

        if self.timers_enabled {
            let me = self.me.clone();
            let deadline = started + timeout;
            let timer = tokio::spawn(async move {
                tokio::time::sleep_until(deadline).await;
                if let Some(link) = me.upgrade() {
                    link.expire(sequence, timeout);
                }
            });
            match self.in_flight.get_mut(&sequence) {
                Some(mut transmission) => transmission.timer = Some(timer),
                None => timer.abort(),
            }
        }

        FramedMessage::Data { sequence, payload }
    }

    fn expire(&self, sequence: u32, timeout: Duration) {
        if let Some((_, tx)) = self.in_flight.remove(&sequence) {
            {
                let mut state = self.state();
                state.stats.timeouts += 1;
                state.stats.last_timeout = Some(timeout);
            }
            warn!(sequence, timeout_ms = timeout.as_millis() as u64, "link transmission timed out");
            // The timer is the task running this; don't abort it.
            let _ = tx.completion.send(Err(LinkError::AckTimeout { sequence }));
        }
    }

    /// Handle a received DATA frame; returns the ACK to send back
    pub fn on_data(&self, sequence: u32) -> FramedMessage {
        let mut state = self.state();
        state.stats.frames_received += 1;
        let received = state.received.mask_for(sequence);
        state.received.record(sequence);
        FramedMessage::Ack { sequence, received }
    }

    /// Handle a received ACK
    pub fn on_ack(&self, sequence: u32, received: u32) {
        let Some((_, transmission)) = self.in_flight.remove(&sequence) else {
            self.state().stats.unmatched_acks += 1;
            debug!(sequence, received, "ack for unknown transmission");
            return;
        };

        let rtt = transmission.started.elapsed();
        {
            let mut state = self.state();
            state.rtt.update(rtt);
            state.stats.acks_received += 1;
            state.stats.srtt = state.rtt.srtt();
        }
        transmission.complete(Ok(()));
    }

    /// Fail every in-flight transmission with [`LinkError::Closed`]
    pub fn close(&self) {
        let pending: Vec<u32> = self.in_flight.iter().map(|e| *e.key()).collect();
        for sequence in pending {
            if let Some((_, transmission)) = self.in_flight.remove(&sequence) {
                transmission.complete(Err(LinkError::Closed));
            }
        }
    }

    /// Current link timeout
    pub fn timeout(&self) -> Duration {
        self.state().rtt.timeout()
    }

    /// Number of unacknowledged transmissions
    pub fn in_flight(&self) -> usize {
        self.in_flight.len()
    }

    /// Snapshot of the link counters
    pub fn stats(&self) -> LinkStats {
        self.state().stats.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ms(v: u64) -> Duration {
        Duration::from_millis(v)
    }

    #[test]
    fn test_rtt_first_sample_exact() {
        let mut rtt = RttEstimator::new(ms(3000));
        assert_eq!(rtt.timeout(), ms(3000));
        rtt.update(ms(400));
        assert_eq!(rtt.srtt(), Some(ms(400)));
        assert_eq!(rtt.rttvar(), ms(200));
        // 400 + 4 * 200
        assert_eq!(rtt.timeout(), ms(1200));
    }

    #[test]
    fn test_rtt_second_sample() {
        let mut rtt = RttEstimator::new(ms(3000));
        rtt.update(ms(400));
        rtt.update(ms(800));
        // rttvar = 3/4 * 200 + 1/4 * 400 = 250, srtt = 7/8 * 400 + 1/8 * 800 = 450
        assert_eq!(rtt.rttvar(), ms(250));
        assert_eq!(rtt.srtt(), Some(ms(450)));
        assert_eq!(rtt.timeout(), ms(1450));
    }

    #[test]
    fn test_rtt_converges() {
        let mut rtt = RttEstimator::new(ms(3000));
        for _ in 0..200 {
            rtt.update(ms(100));
        }
        let srtt = rtt.srtt().unwrap();
        assert!(srtt >= ms(99) && srtt <= ms(101));
        assert!(rtt.rttvar() < ms(2));
        assert_eq!(rtt.timeout(), MIN_LINK_TIMEOUT);
    }

    #[test]
    fn test_rtt_timeout_clamped_high() {
        let mut rtt = RttEstimator::new(ms(3000));
        rtt.update(Duration::from_secs(8));
        assert_eq!(rtt.timeout(), MAX_LINK_TIMEOUT);
    }

    #[test]
    fn test_ack_mask() {
        let mut window = ReceivedWindow::new(RECEIVE_WINDOW);
        for seq in [1u32, 2, 4] {
            window.record(seq);
        }
        assert_eq!(window.mask_for(5), 0b1101);
        assert_eq!(window.mask_for(1), 0);
    }

    #[test]
    fn test_ack_mask_wraps() {
        let mut window = ReceivedWindow::new(RECEIVE_WINDOW);
        window.record(u32::MAX);
        window.record(u32::MAX - 1);
        assert_eq!(window.mask_for(0), 0b11);
    }

    #[test]
    fn test_window_evicts_oldest() {
        let mut window = ReceivedWindow::new(2);
        window.record(10);
        window.record(11);
        window.record(12);
        // 10 was evicted
        assert_eq!(window.mask_for(13), 0b011);
    }

    #[test]
    fn test_mask_ignores_out_of_range() {
        let mut window = ReceivedWindow::new(RECEIVE_WINDOW);
        window.record(100);
        assert_eq!(window.mask_for(132), 1 << 31);
        assert_eq!(window.mask_for(133), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_ack_completes_transmission() {
        let link = LinkReliability::with_first_sequence(&LinkConfig::default(), u32::MAX);
        let (tx, rx) = oneshot::channel();
        let frame = link.register(Bytes::from_static(b"x"), tx);
        assert_eq!(frame.sequence(), u32::MAX);

        let (tx2, _rx2) = oneshot::channel();
        assert_eq!(link.register(Bytes::new(), tx2).sequence(), 0);

        tokio::time::advance(ms(250)).await;
        link.on_ack(u32::MAX, 0);
        assert_eq!(rx.await.unwrap(), Ok(()));
        assert_eq!(link.in_flight(), 1);

        let stats = link.stats();
        assert_eq!(stats.acks_received, 1);
        assert_eq!(stats.srtt, Some(ms(250)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_unmatched_ack_ignored() {
        let link = LinkReliability::new(&LinkConfig::default());
        link.on_ack(42, 0);
        assert_eq!(link.stats().unmatched_acks, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_transmission_times_out() {
        let link = LinkReliability::with_first_sequence(&LinkConfig::default(), 7);
        let (tx, rx) = oneshot::channel();
        link.register(Bytes::new(), tx);

        tokio::time::advance(ms(3001)).await;
        assert_eq!(rx.await.unwrap(), Err(LinkError::AckTimeout { sequence: 7 }));
        assert_eq!(link.in_flight(), 0);
        assert_eq!(link.stats().timeouts, 1);

        // A late ACK is unmatched
        link.on_ack(7, 0);
        assert_eq!(link.stats().unmatched_acks, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_zero_timeout_disables_timers() {
        let config = LinkConfig {
            initial_timeout: Duration::ZERO,
            ..LinkConfig::default()
        };
        let link = LinkReliability::new(&config);
        let (tx, mut rx) = oneshot::channel();
        link.register(Bytes::new(), tx);
        tokio::time::advance(Duration::from_secs(60)).await;
        assert!(rx.try_recv().is_err());
        assert_eq!(link.in_flight(), 1);
    }

    #[tokio::test]
    async fn test_close_fails_in_flight() {
        let link = LinkReliability::new(&LinkConfig::default());
        let (tx, rx) = oneshot::channel();
        link.register(Bytes::new(), tx);
        link.close();
        assert_eq!(rx.await.unwrap(), Err(LinkError::Closed));
    }

    #[test]
    fn test_on_data_builds_ack() {
        let link = LinkReliability::new(&LinkConfig::default());
        assert_eq!(link.on_data(1), FramedMessage::Ack { sequence: 1, received: 0 });
        assert_eq!(link.on_data(2), FramedMessage::Ack { sequence: 2, received: 1 });
        assert_eq!(link.stats().frames_received, 2);
    }
}
