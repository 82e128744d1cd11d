//! Channels
//!
//! One logical stream multiplexed within an exchange, in either
//! unreliable (datagram) or reliable (windowed ARQ) mode. The state
//! machine here is pure: it decides what to send and what to deliver,
//! while the owning exchange performs the IO under its own lock.

use std::collections::{BTreeMap, VecDeque};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use bytes::Bytes;
use tokio::sync::Notify;
use tokio::time::Instant;

use telemesh_net::lob::{ChannelHeader, LocalAddr};

use crate::config::Config;
use crate::error::{CoreError, CoreResult};
use crate::exchange::Exchange;
use crate::hashname::Hashname;
use crate::timers::Deadline;

/// Maximum channel type length in bytes
pub const MAX_TYPE_LEN: usize = 32;

/// First sequence number assigned on a reliable channel
const FIRST_SEQ: u32 = 1;

/// Why a channel handle can no longer reach its state
#[derive(Debug, Clone)]
pub(crate) enum Terminal {
    /// Clean close; reads return EOF
    Eof,
    /// The exchange broke
    Broken(Hashname),
    /// The exchange expired
    Expired(Hashname),
    /// The peer sent an `err` header
    PeerErr(String),
}

impl Terminal {
    fn to_error(&self) -> CoreError {
        match self {
            Terminal::Eof => CoreError::ChannelClosed,
            Terminal::Broken(hn) => CoreError::BrokenExchange(*hn),
            Terminal::Expired(hn) => CoreError::ExchangeExpired(*hn),
            Terminal::PeerErr(msg) => CoreError::ChannelErr(msg.clone()),
        }
    }
}

/// Wakeups and terminal state shared between handle and exchange
pub(crate) struct ChannelShared {
    pub readable: Notify,
    pub writable: Notify,
    pub closed: Notify,
    pub terminal: StdMutex<Option<Terminal>>,
}

impl ChannelShared {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            readable: Notify::new(),
            writable: Notify::new(),
            closed: Notify::new(),
            terminal: StdMutex::new(None),
        })
    }

    pub fn terminal(&self) -> Option<Terminal> {
        self.terminal.lock().unwrap().clone()
    }

    pub fn set_terminal(&self, terminal: Terminal) {
        let mut slot = self.terminal.lock().unwrap();
        if slot.is_none() {
            *slot = Some(terminal);
        }
        drop(slot);

        // notify_waiters for registered waiters, notify_one to park a
        // permit for a task between its state check and its await
        self.readable.notify_waiters();
        self.readable.notify_one();
        self.writable.notify_waiters();
        self.writable.notify_one();
        self.closed.notify_waiters();
        self.closed.notify_one();
    }
}

/// Optional header fields attached to an outbound packet
#[derive(Debug, Clone, Default)]
pub(crate) struct HeaderExt {
    pub end: bool,
    pub peer: Option<String>,
    pub local: Option<LocalAddr>,
    pub ip: Option<String>,
    pub port: Option<u16>,
}

impl HeaderExt {
    pub fn end() -> Self {
        Self {
            end: true,
            ..Self::default()
        }
    }
}

/// One unacknowledged reliable packet
struct Outstanding {
    header: ChannelHeader,
    body: Bytes,
    first_sent: Instant,
    resend_at: Instant,
    retransmitted: bool,
}

/// What the exchange should do after feeding the state machine
#[derive(Debug, Default)]
pub(crate) struct Outcome {
    /// Emit an ack-only packet
    pub send_ack: bool,
    /// Retransmit these sequences now
    pub resend: Vec<u32>,
    /// The channel became fully closed; unregister it
    pub closed: bool,
}

/// Per-channel protocol state, owned by the exchange
pub(crate) struct ChannelState {
    pub id: u32,
    pub typ: String,
    pub reliable: bool,
    pub initiator: bool,
    pub shared: Arc<ChannelShared>,

    sent_type: bool,

    // receive side
    read_buf: VecDeque<(ChannelHeader, Bytes)>,
    recv_buf: BTreeMap<u32, (ChannelHeader, Bytes)>,
    ack_high: u32,
    max_seen: u32,
    ack_dirty: bool,

    // send side
    next_seq: u32,
    outstanding: BTreeMap<u32, Outstanding>,
    rtt: Duration,

    // lifecycle
    ended_local: bool,
    ended_remote: bool,
    pub close_deadline: Deadline,

    send_window: usize,
    miss_cap: usize,
}

impl ChannelState {
    pub fn new(
        id: u32,
        typ: String,
        reliable: bool,
        initiator: bool,
        config: &Config,
    ) -> Self {
        Self {
            id,
            typ,
            reliable,
            initiator,
            shared: ChannelShared::new(),
            sent_type: false,
            read_buf: VecDeque::new(),
            recv_buf: BTreeMap::new(),
            ack_high: 0,
            max_seen: 0,
            ack_dirty: false,
            next_seq: FIRST_SEQ,
            outstanding: BTreeMap::new(),
            rtt: config.resend_seed,
            ended_local: false,
            ended_remote: false,
            close_deadline: Deadline::new(),
            send_window: config.send_window,
            miss_cap: config.miss_cap,
        }
    }

    pub fn ended_local(&self) -> bool {
        self.ended_local
    }

    pub fn ended_remote(&self) -> bool {
        self.ended_remote
    }

    /// Room in the send window?
    pub fn can_send(&self) -> bool {
        !self.reliable || self.outstanding.len() < self.send_window
    }

    /// Build the next outbound packet
    ///
    /// The caller must have checked `can_send` for data packets; the
    /// final `end` packet is allowed to overrun the window.
    pub fn next_send(&mut self, body: Bytes, ext: HeaderExt, now: Instant) -> CoreResult<(ChannelHeader, Bytes)> {
        if self.ended_local {
            return Err(CoreError::ChannelClosed);
        }

        let mut header = ChannelHeader::new(self.id);
        if !self.sent_type {
            header.typ = Some(self.typ.clone());
            self.sent_type = true;
        }

        header.end = ext.end;
        header.peer = ext.peer;
        header.local = ext.local;
        header.ip = ext.ip;
        header.port = ext.port;

        if self.reliable {
            let seq = self.next_seq;
            self.next_seq += 1;
            header.seq = Some(seq);
            self.attach_ack(&mut header);

            self.outstanding.insert(
                seq,
                Outstanding {
                    header: header.clone(),
                    body: body.clone(),
                    first_sent: now,
                    resend_at: now + self.resend_timeout(),
                    retransmitted: false,
                },
            );
        }

        if ext.end {
            self.ended_local = true;
        }

        Ok((header, body))
    }

    /// Build an ack-only packet (no sequence number)
    pub fn ack_packet(&mut self) -> ChannelHeader {
        let mut header = ChannelHeader::new(self.id);
        self.attach_ack(&mut header);
        header
    }

    /// Refresh and re-emit an outstanding packet
    pub fn retransmit(&mut self, seq: u32, now: Instant) -> Option<(ChannelHeader, Bytes)> {
        let timeout = self.resend_timeout();
        let entry = self.outstanding.get_mut(&seq)?;
        entry.resend_at = now + timeout;
        entry.retransmitted = true;

        let mut header = entry.header.clone();
        let body = entry.body.clone();

        // carry current receive state, not the state at first send
        header.ack = None;
        header.miss = None;
        self.attach_ack(&mut header);
        Some((header, body))
    }

    /// Feed one inbound packet
    pub fn receive_packet(&mut self, header: ChannelHeader, body: Bytes) -> Outcome {
        let mut outcome = Outcome::default();

        if let Some(err) = header.err {
            self.shared.set_terminal(Terminal::PeerErr(err));
            outcome.closed = true;
            return outcome;
        }

        if self.reliable {
            if let Some(ack) = header.ack {
                self.process_ack(ack);
            }
            if let Some(miss) = &header.miss {
                for seq in miss {
                    if self.outstanding.contains_key(seq) {
                        outcome.resend.push(*seq);
                    }
                }
            }

            if let Some(seq) = header.seq {
                self.max_seen = self.max_seen.max(seq);

                if seq <= self.ack_high || self.recv_buf.contains_key(&seq) {
                    // duplicate; the peer may have lost our ack
                    self.ack_dirty = true;
                } else {
                    self.recv_buf.insert(seq, (header, body));
                    self.drain_in_order();
                    self.ack_dirty = true;
                }
            }
        } else {
            if header.end {
                self.ended_remote = true;
            }
            if is_readable(&header, &body) {
                self.read_buf.push_back((header, body));
            }
            self.shared.readable.notify_one();
        }

        outcome.send_ack = self.ack_dirty;
        outcome.closed = self.fully_closed();
        outcome
    }

    /// Periodic work: retransmissions and the close deadline
    pub fn tick(&mut self, now: Instant) -> Outcome {
        let mut outcome = Outcome::default();

        if self.close_deadline.fire_if_due(now) {
            outcome.closed = true;
            return outcome;
        }

        for (seq, entry) in &self.outstanding {
            if entry.resend_at <= now {
                outcome.resend.push(*seq);
            }
        }

        outcome.send_ack = self.ack_dirty;
        outcome
    }

    /// Earliest instant `tick` has work to do
    pub fn next_deadline(&self) -> Option<Instant> {
        let resend = self.outstanding.values().map(|e| e.resend_at).min();
        crate::timers::earliest(&[resend, self.close_deadline.at()])
    }

    /// Pop the next in-order packet
    pub fn pop_read(&mut self) -> Option<(ChannelHeader, Bytes)> {
        self.read_buf.pop_front()
    }

    /// Both sides done and nothing left in flight or unread?
    pub fn fully_closed(&self) -> bool {
        let drained = self.read_buf.is_empty();
        if self.reliable {
            self.ended_local && self.ended_remote && self.outstanding.is_empty() && drained
        } else {
            self.ended_local && self.ended_remote && drained
        }
    }

    pub fn clear_ack_dirty(&mut self) {
        self.ack_dirty = false;
    }

    fn attach_ack(&mut self, header: &mut ChannelHeader) {
        if !self.reliable {
            return;
        }

        header.ack = Some(self.ack_high);
        let miss = self.missing();
        if !miss.is_empty() {
            header.miss = Some(miss);
        }
        self.ack_dirty = false;
    }

    fn missing(&self) -> Vec<u32> {
        let mut miss = Vec::new();
        for seq in self.ack_high + 1..=self.max_seen {
            if !self.recv_buf.contains_key(&seq) {
                miss.push(seq);
                if miss.len() == self.miss_cap {
                    break;
                }
            }
        }
        miss
    }

    fn drain_in_order(&mut self) {
        while let Some((header, body)) = self.recv_buf.remove(&(self.ack_high + 1)) {
            self.ack_high += 1;
            if header.end {
                self.ended_remote = true;
            }
            if is_readable(&header, &body) {
                self.read_buf.push_back((header, body));
            }
        }
        self.shared.readable.notify_one();
    }

    fn process_ack(&mut self, ack: u32) {
        let now = Instant::now();

        let acked: Vec<u32> = self
            .outstanding
            .range(..=ack)
            .map(|(seq, _)| *seq)
            .collect();
        for seq in acked {
            if let Some(entry) = self.outstanding.remove(&seq) {
                if !entry.retransmitted {
                    let sample = now.saturating_duration_since(entry.first_sent);
                    self.rtt = (self.rtt * 7 + sample) / 8;
                }
            }
        }

        self.shared.writable.notify_one();
        if self.ended_local && self.outstanding.is_empty() {
            self.shared.closed.notify_waiters();
        }
    }

    fn resend_timeout(&self) -> Duration {
        std::cmp::max(self.rtt * 2, Duration::from_millis(50))
    }
}

/// A packet the application should see
///
/// Every data packet is readable, including ones with an empty body.
/// The only pure control case is a bare `end` carrying nothing else;
/// an `end` with a body (or introduction headers) still delivers.
fn is_readable(header: &ChannelHeader, body: &Bytes) -> bool {
    if !header.end {
        return true;
    }
    !body.is_empty() || header.peer.is_some() || header.ip.is_some() || header.local.is_some()
}

/// Application handle to one channel
///
/// Reads and writes translate into operations on the owning exchange.
pub struct Channel {
    exchange: Arc<Exchange>,
    shared: Arc<ChannelShared>,
    id: u32,
    typ: String,
    reliable: bool,
}

impl Channel {
    pub(crate) fn new(
        exchange: Arc<Exchange>,
        shared: Arc<ChannelShared>,
        id: u32,
        typ: String,
        reliable: bool,
    ) -> Self {
        Self {
            exchange,
            shared,
            id,
            typ,
            reliable,
        }
    }

    /// Channel id within its exchange
    pub fn id(&self) -> u32 {
        self.id
    }

    /// Application channel type
    pub fn typ(&self) -> &str {
        &self.typ
    }

    /// Is this a reliable channel?
    pub fn is_reliable(&self) -> bool {
        self.reliable
    }

    /// Hashname of the remote endpoint
    pub fn remote_hashname(&self) -> Hashname {
        self.exchange.remote_hashname()
    }

    /// Read the next packet body; `None` at clean end-of-stream
    pub async fn read_packet(&self) -> CoreResult<Option<Bytes>> {
        Ok(self.read_packet_full().await?.map(|(_, body)| body))
    }

    /// Read the next packet with its header
    pub(crate) async fn read_packet_full(&self) -> CoreResult<Option<(ChannelHeader, Bytes)>> {
        loop {
            let notified = {
                match self.exchange.channel_read(self.id).await? {
                    ChannelRead::Packet(header, body) => return Ok(Some((header, body))),
                    ChannelRead::Eof => return Ok(None),
                    ChannelRead::Gone => {
                        return match self.shared.terminal() {
                            Some(Terminal::Eof) | None => Ok(None),
                            Some(terminal) => Err(terminal.to_error()),
                        };
                    }
                    ChannelRead::WouldBlock => self.shared.readable.notified(),
                }
            };
            notified.await;
        }
    }

    /// Write a packet body
    ///
    /// On a reliable channel this suspends while the send window is full.
    pub async fn write_packet(&self, body: &[u8]) -> CoreResult<()> {
        self.write_packet_ext(HeaderExt::default(), body).await
    }

    pub(crate) async fn write_packet_ext(&self, ext: HeaderExt, body: &[u8]) -> CoreResult<()> {
        let body = Bytes::copy_from_slice(body);
        loop {
            let notified = {
                match self
                    .exchange
                    .channel_write(self.id, ext.clone(), body.clone())
                    .await
                {
                    Ok(true) => return Ok(()),
                    Ok(false) => self.shared.writable.notified(),
                    Err(CoreError::ChannelClosed) => {
                        return match self.shared.terminal() {
                            Some(terminal) => Err(terminal.to_error()),
                            None => Err(CoreError::ChannelClosed),
                        };
                    }
                    Err(e) => return Err(e),
                }
            };
            notified.await;
        }
    }

    /// Send `end` and wait until the channel fully closes or the grace
    /// deadline lapses
    pub async fn close(&self) -> CoreResult<()> {
        loop {
            let notified = self.shared.closed.notified();
            if self.exchange.channel_close(self.id).await? {
                return Ok(());
            }
            notified.await;
        }
    }
}

impl std::fmt::Debug for Channel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "Channel({:?} {} reliable={})",
            self.typ, self.id, self.reliable
        )
    }
}

/// Result of a non-blocking read attempt against channel state
pub(crate) enum ChannelRead {
    Packet(ChannelHeader, Bytes),
    Eof,
    WouldBlock,
    Gone,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn reliable_state() -> ChannelState {
        ChannelState::new(1, "test".into(), true, true, &Config::default())
    }

    fn data_header(c: u32, seq: u32) -> ChannelHeader {
        let mut header = ChannelHeader::new(c);
        header.seq = Some(seq);
        header
    }

    #[test]
    fn test_first_packet_carries_type() {
        let mut state = reliable_state();
        let now = Instant::now();

        let (first, _) = state
            .next_send(Bytes::from_static(b"a"), HeaderExt::default(), now)
            .unwrap();
        assert_eq!(first.typ.as_deref(), Some("test"));
        assert_eq!(first.seq, Some(1));

        let (second, _) = state
            .next_send(Bytes::from_static(b"b"), HeaderExt::default(), now)
            .unwrap();
        assert!(second.typ.is_none());
        assert_eq!(second.seq, Some(2));
    }

    #[test]
    fn test_in_order_delivery() {
        let mut state = reliable_state();

        // Receive 2 before 1; nothing is readable until 1 arrives
        state.receive_packet(data_header(1, 2), Bytes::from_static(b"two"));
        assert!(state.pop_read().is_none());

        state.receive_packet(data_header(1, 1), Bytes::from_static(b"one"));
        assert_eq!(state.pop_read().unwrap().1, Bytes::from_static(b"one"));
        assert_eq!(state.pop_read().unwrap().1, Bytes::from_static(b"two"));
    }

    #[test]
    fn test_duplicates_dropped() {
        let mut state = reliable_state();

        state.receive_packet(data_header(1, 1), Bytes::from_static(b"one"));
        state.receive_packet(data_header(1, 1), Bytes::from_static(b"one"));

        assert_eq!(state.pop_read().unwrap().1, Bytes::from_static(b"one"));
        assert!(state.pop_read().is_none());
    }

    #[test]
    fn test_miss_list_names_gaps() {
        let mut state = reliable_state();

        state.receive_packet(data_header(1, 1), Bytes::from_static(b"x"));
        state.receive_packet(data_header(1, 4), Bytes::from_static(b"x"));

        let header = state.ack_packet();
        assert_eq!(header.ack, Some(1));
        assert_eq!(header.miss, Some(vec![2, 3]));
    }

    #[test]
    fn test_ack_clears_outstanding() {
        let mut state = reliable_state();
        let now = Instant::now();

        for body in [b"a", b"b", b"c"] {
            state
                .next_send(Bytes::copy_from_slice(body), HeaderExt::default(), now)
                .unwrap();
        }
        assert_eq!(state.outstanding.len(), 3);

        let mut header = ChannelHeader::new(1);
        header.ack = Some(2);
        state.receive_packet(header, Bytes::new());
        assert_eq!(state.outstanding.len(), 1);
    }

    #[test]
    fn test_miss_triggers_resend() {
        let mut state = reliable_state();
        let now = Instant::now();

        for body in [b"a", b"b", b"c"] {
            state
                .next_send(Bytes::copy_from_slice(body), HeaderExt::default(), now)
                .unwrap();
        }

        let mut header = ChannelHeader::new(1);
        header.ack = Some(0);
        header.miss = Some(vec![2]);
        let outcome = state.receive_packet(header, Bytes::new());
        assert_eq!(outcome.resend, vec![2]);

        let (resent, body) = state.retransmit(2, now).unwrap();
        assert_eq!(resent.seq, Some(2));
        assert_eq!(body, Bytes::from_static(b"b"));
    }

    #[test]
    fn test_window_blocks() {
        let mut config = Config::default();
        config.send_window = 2;
        let mut state = ChannelState::new(1, "test".into(), true, true, &config);
        let now = Instant::now();

        for body in [b"a", b"b"] {
            state
                .next_send(Bytes::copy_from_slice(body), HeaderExt::default(), now)
                .unwrap();
        }
        assert!(!state.can_send());

        let mut header = ChannelHeader::new(1);
        header.ack = Some(1);
        state.receive_packet(header, Bytes::new());
        assert!(state.can_send());
    }

    #[test]
    fn test_tick_schedules_retransmit() {
        let mut state = reliable_state();
        let now = Instant::now();

        state
            .next_send(Bytes::from_static(b"a"), HeaderExt::default(), now)
            .unwrap();

        let soon = now + Duration::from_millis(10);
        assert!(state.tick(soon).resend.is_empty());

        let later = now + Duration::from_secs(30);
        assert_eq!(state.tick(later).resend, vec![1]);
    }

    #[test]
    fn test_close_sequence() {
        let mut state = reliable_state();
        let now = Instant::now();

        let (header, _) = state
            .next_send(Bytes::new(), HeaderExt::end(), now)
            .unwrap();
        assert!(header.end);
        assert!(state.ended_local());
        assert!(state.next_send(Bytes::new(), HeaderExt::default(), now).is_err());

        // Peer's end plus the ack of ours closes the channel
        let mut end = data_header(1, 1);
        end.end = true;
        end.ack = Some(1);
        let outcome = state.receive_packet(end, Bytes::new());
        assert!(outcome.closed);
        assert!(state.fully_closed());
    }

    #[test]
    fn test_err_header_terminates() {
        let mut state = reliable_state();

        let mut header = ChannelHeader::new(1);
        header.err = Some("bad state".into());
        let outcome = state.receive_packet(header, Bytes::new());

        assert!(outcome.closed);
        assert!(matches!(
            state.shared.terminal(),
            Some(Terminal::PeerErr(_))
        ));
    }

    #[test]
    fn test_empty_unreliable_packet_is_readable() {
        // an empty packet is legitimate application data, not control
        let mut state = ChannelState::new(2, "test".into(), false, false, &Config::default());

        state.receive_packet(ChannelHeader::new(2), Bytes::new());

        let (header, body) = state.pop_read().expect("empty packet must be delivered");
        assert_eq!(header.c, 2);
        assert!(body.is_empty());
    }

    #[test]
    fn test_empty_reliable_packet_is_readable() {
        let mut state = reliable_state();

        // sequenced data with an empty body is acked and delivered
        let outcome = state.receive_packet(data_header(1, 1), Bytes::new());
        assert!(outcome.send_ack);

        let (header, body) = state.pop_read().expect("empty packet must be delivered");
        assert_eq!(header.seq, Some(1));
        assert!(body.is_empty());

        // only a bare end stays control-only
        let mut end = data_header(1, 2);
        end.end = true;
        state.receive_packet(end, Bytes::new());
        assert!(state.ended_remote());
        assert!(state.pop_read().is_none());
    }

    #[test]
    fn test_end_with_body_still_delivers() {
        let mut state = reliable_state();

        let mut end = data_header(1, 1);
        end.end = true;
        state.receive_packet(end, Bytes::from_static(b"last"));

        assert!(state.ended_remote());
        assert_eq!(state.pop_read().unwrap().1, Bytes::from_static(b"last"));
    }

    #[test]
    fn test_unreliable_passthrough() {
        let mut state = ChannelState::new(2, "drop".into(), false, true, &Config::default());

        let header = ChannelHeader::new(2);
        state.receive_packet(header, Bytes::from_static(b"payload"));
        assert_eq!(state.pop_read().unwrap().1, Bytes::from_static(b"payload"));

        let mut end = ChannelHeader::new(2);
        end.end = true;
        let outcome = state.receive_packet(end, Bytes::new());
        assert!(state.ended_remote());
        assert!(!outcome.closed); // local side has not ended yet
    }
}
