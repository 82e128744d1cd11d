//! Exchanges
//!
//! A per-peer authenticated session: the handshake driver and state
//! machine, sequence-number discipline, path selection and the channel
//! registry. One driver task per exchange fires its timers; every
//! mutation of exchange state happens under the single inner lock.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::{Arc, Weak};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use bytes::Bytes;
use tokio::sync::{broadcast, watch, Mutex, Notify};
use tokio::time::Instant;
use tracing::{debug, info, trace, warn};

use telemesh_crypto::{CipherSet, Handshake, LocalKeys, Parts, Registry, Token};
use telemesh_net::lob::Packet;
use telemesh_net::Transport;

use crate::address_book::AddressBook;
use crate::channel::{
    Channel, ChannelRead, ChannelState, HeaderExt, Outcome, Terminal, MAX_TYPE_LEN,
};
use crate::config::Config;
use crate::endpoint::EndpointShared;
use crate::error::{CoreError, CoreResult};
use crate::events::Event;
use crate::hashname::Hashname;
use crate::identity::Identity;
use crate::timers::{earliest, Deadline};

/// Lifecycle state of an exchange
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExchangeState {
    /// Created, no handshake seen or sent
    Initializing,
    /// Sending handshakes, waiting for an accepted response
    Dialing,
    /// Open with no live channels
    Idle,
    /// Open with live channels
    Active,
    /// Terminal: expired after sitting idle
    Expired,
    /// Terminal: broke without an accepted response handshake
    Broken,
}

impl ExchangeState {
    /// Open for channels?
    pub fn is_open(&self) -> bool {
        matches!(self, ExchangeState::Idle | ExchangeState::Active)
    }

    /// Terminal?
    pub fn is_closed(&self) -> bool {
        matches!(self, ExchangeState::Expired | ExchangeState::Broken)
    }
}

impl std::fmt::Display for ExchangeState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            ExchangeState::Initializing => "initializing",
            ExchangeState::Dialing => "dialing",
            ExchangeState::Idle => "idle",
            ExchangeState::Active => "active",
            ExchangeState::Expired => "expired",
            ExchangeState::Broken => "broken",
        };
        write!(f, "{}", s)
    }
}

/// Everything an exchange borrows from its endpoint
pub(crate) struct ExchangeContext {
    pub config: Config,
    pub local_parts: Parts,
    pub transport: Arc<dyn Transport>,
    pub endpoint: Weak<EndpointShared>,
    pub events: broadcast::Sender<Event>,
}

struct Inner {
    state: ExchangeState,
    csid: u8,
    cipher: Box<dyn CipherSet>,
    local_parts: Parts,
    remote_ident: Option<Identity>,

    last_local_seq: u32,
    last_remote_seq: u32,
    next_seq: u32,
    next_channel_id: u32,

    channels: HashMap<u32, ChannelState>,
    address_book: AddressBook,

    next_handshake_delay: u64,
    t_break: Deadline,
    t_expire: Deadline,
    t_handshake: Deadline,

    opened_emitted: bool,
}

/// An authenticated session with one remote endpoint
pub struct Exchange {
    remote_hashname: Hashname,
    config: Config,
    transport: Arc<dyn Transport>,
    endpoint: Weak<EndpointShared>,
    events: broadcast::Sender<Event>,
    state_tx: watch::Sender<ExchangeState>,
    timer_wake: Notify,
    inner: Mutex<Inner>,
}

impl Exchange {
    /// Create an exchange toward a known remote identity (dial path)
    pub(crate) fn with_identity(
        ctx: ExchangeContext,
        registry: &Registry,
        local_keys: &LocalKeys,
        remote: Identity,
    ) -> CoreResult<Arc<Self>> {
        let csid = registry
            .select_csid(local_keys, remote.keys())
            .ok_or(CoreError::NoCommonCipherSet)?;
        let factory = registry.get(csid).ok_or(CoreError::NoCommonCipherSet)?;

        let mut cipher = factory.new_state(&local_keys[&csid])?;
        let remote_key = remote
            .keys()
            .get(&csid)
            .ok_or(CoreError::NoCommonCipherSet)?;
        cipher.set_remote_key(remote_key)?;

        let mut address_book = AddressBook::new();
        for addr in remote.paths() {
            address_book.add_address(*addr);
        }

        let remote_hashname = remote.hashname();
        Ok(Self::build(ctx, csid, cipher, Some(remote), address_book, remote_hashname))
    }

    /// Create an exchange from an unsolicited inbound handshake
    ///
    /// The handshake itself is applied by the first `received_handshake`
    /// call; creation only prepares the cipher state.
    pub(crate) fn from_handshake(
        ctx: ExchangeContext,
        registry: &Registry,
        local_keys: &LocalKeys,
        csid: u8,
        remote_hashname: Hashname,
    ) -> CoreResult<Arc<Self>> {
        let factory = registry
            .get(csid)
            .ok_or(CoreError::Crypto(telemesh_crypto::CryptoError::UnknownCipherSet(csid)))?;
        let local = local_keys
            .get(&csid)
            .ok_or(CoreError::Crypto(telemesh_crypto::CryptoError::UnknownCipherSet(csid)))?;

        let cipher = factory.new_state(local)?;
        Ok(Self::build(ctx, csid, cipher, None, AddressBook::new(), remote_hashname))
    }

    fn build(
        ctx: ExchangeContext,
        csid: u8,
        cipher: Box<dyn CipherSet>,
        remote_ident: Option<Identity>,
        address_book: AddressBook,
        remote_hashname: Hashname,
    ) -> Arc<Self> {
        let (state_tx, _) = watch::channel(ExchangeState::Initializing);

        let mut t_break = Deadline::new();
        t_break.arm(Instant::now() + ctx.config.break_timeout);

        // every exchange rekeys from creation, whichever side it is;
        // the responses are what keep resetting the break timer
        let mut t_handshake = Deadline::new();
        t_handshake.arm(Instant::now() + Duration::from_secs(ctx.config.handshake_backoff_floor));

        let next_handshake_delay = ctx.config.handshake_backoff_floor;

        Arc::new(Self {
            remote_hashname,
            config: ctx.config,
            transport: ctx.transport,
            endpoint: ctx.endpoint,
            events: ctx.events,
            state_tx,
            timer_wake: Notify::new(),
            inner: Mutex::new(Inner {
                state: ExchangeState::Initializing,
                csid,
                cipher,
                local_parts: ctx.local_parts,
                remote_ident,
                last_local_seq: 0,
                last_remote_seq: 0,
                next_seq: 0,
                next_channel_id: 0,
                channels: HashMap::new(),
                address_book,
                next_handshake_delay,
                t_break,
                t_expire: Deadline::new(),
                t_handshake,
                opened_emitted: false,
            }),
        })
    }

    /// The remote peer's hashname
    pub fn remote_hashname(&self) -> Hashname {
        self.remote_hashname
    }

    /// Current lifecycle state
    pub fn state(&self) -> ExchangeState {
        *self.state_tx.borrow()
    }

    /// The remote identity with currently known paths merged in
    pub async fn remote_identity(&self) -> Option<Identity> {
        let inner = self.inner.lock().await;
        inner
            .remote_ident
            .as_ref()
            .map(|i| i.with_paths(inner.address_book.known_addresses()))
    }

    /// The path currently used for channel packets
    pub async fn active_path(&self) -> Option<SocketAddr> {
        self.inner.lock().await.address_book.active_address()
    }

    /// All known paths to the remote endpoint, best first
    pub async fn known_paths(&self) -> Vec<SocketAddr> {
        self.inner.lock().await.address_book.known_addresses()
    }

    /// Reachability of one known path
    pub async fn path_reachable(&self, addr: SocketAddr) -> Option<bool> {
        let inner = self.inner.lock().await;
        inner.address_book.entry(addr).map(|e| e.reachable)
    }

    /// Token identifying the local side of the exchange
    pub async fn local_token(&self) -> Option<Token> {
        self.inner.lock().await.cipher.local_token()
    }

    /// Token identifying the remote side of the exchange
    pub async fn remote_token(&self) -> Option<Token> {
        self.inner.lock().await.cipher.remote_token()
    }

    /// Propose an additional candidate path
    ///
    /// The path is only used when it performs better than the others.
    pub async fn add_path_candidate(&self, addr: SocketAddr) {
        let mut inner = self.inner.lock().await;
        inner.address_book.add_address(addr);
    }

    /// Exchange the initial handshakes
    ///
    /// Suspends until the exchange opens; fails with `BrokenExchange`
    /// if it lands in a terminal state instead. The break timer (2
    /// minutes) bounds the wait.
    pub async fn dial(&self) -> CoreResult<()> {
        let mut rx = self.state_tx.subscribe();

        {
            let mut inner = self.inner.lock().await;
            if inner.state == ExchangeState::Initializing {
                self.set_state(&mut inner, ExchangeState::Dialing);
                if let Err(e) = self.deliver_handshake(&mut inner, 0, None).await {
                    debug!("Initial handshake delivery failed: {}", e);
                }
                self.reschedule_handshake(&mut inner);
            }
        }

        loop {
            let state = *rx.borrow_and_update();
            if state != ExchangeState::Dialing && state != ExchangeState::Initializing {
                break;
            }
            if rx.changed().await.is_err() {
                break;
            }
        }

        if self.state().is_open() {
            Ok(())
        } else {
            Err(CoreError::BrokenExchange(self.remote_hashname))
        }
    }

    /// Open a channel
    pub async fn open(self: &Arc<Self>, typ: &str, reliable: bool) -> CoreResult<Channel> {
        if typ.is_empty() || typ.len() > MAX_TYPE_LEN {
            return Err(CoreError::InvalidChannelType(typ.to_string()));
        }

        // let a dial in flight settle first
        let mut rx = self.state_tx.subscribe();
        while *rx.borrow_and_update() == ExchangeState::Dialing {
            if rx.changed().await.is_err() {
                break;
            }
        }

        let mut inner = self.inner.lock().await;
        if !inner.state.is_open() {
            return Err(CoreError::BrokenExchange(self.remote_hashname));
        }

        let id = self.next_channel_id(&mut inner);
        let state = ChannelState::new(id, typ.to_string(), reliable, true, &self.config);
        let shared = state.shared.clone();
        inner.channels.insert(id, state);
        self.reset_expire(&mut inner);

        debug!("Opened channel {:?} {} to {}", typ, id, self.remote_hashname.short());
        let _ = self.events.send(Event::ChannelOpened {
            hashname: self.remote_hashname,
            id,
            typ: typ.to_string(),
        });

        Ok(Channel::new(
            Arc::clone(self),
            shared,
            id,
            typ.to_string(),
            reliable,
        ))
    }

    /// Explicitly close the exchange
    pub async fn close(&self) {
        let mut inner = self.inner.lock().await;
        self.expire(&mut inner, false);
    }

    /// Abort the exchange as broken (transport failure)
    pub(crate) async fn abort(&self) {
        let mut inner = self.inner.lock().await;
        self.expire(&mut inner, true);
    }

    /// Produce a handshake at the current sequence
    ///
    /// Useful when the caller chooses the destination, e.g. before any
    /// path is known.
    pub async fn generate_handshake(&self) -> CoreResult<Vec<u8>> {
        let mut inner = self.inner.lock().await;
        self.generate_handshake_locked(&mut inner, 0)
    }

    /// Apply an out-of-band handshake
    ///
    /// Returns the response packet when the handshake was a request,
    /// and whether it was accepted.
    pub async fn apply_handshake(
        &self,
        handshake: &Handshake,
        src: SocketAddr,
    ) -> (Option<Vec<u8>>, bool) {
        let mut inner = self.inner.lock().await;
        self.apply_handshake_locked(&mut inner, handshake, src)
    }

    /// Process a decrypted inbound handshake, replying when appropriate
    pub(crate) async fn received_handshake(&self, handshake: &Handshake, src: SocketAddr) -> bool {
        let response = {
            let mut inner = self.inner.lock().await;
            let (response, ok) = self.apply_handshake_locked(&mut inner, handshake, src);
            if !ok {
                trace!("Dropped handshake from {} (not accepted)", src);
                return false;
            }
            response
        };

        if let Some(msg) = response {
            if let Err(e) = self.transport.write_message(&msg, src).await {
                debug!("Failed to answer handshake from {}: {}", src, e);
            }
        }

        self.timer_wake.notify_one();
        true
    }

    /// Process an inbound line packet
    pub(crate) async fn received_packet(self: &Arc<Self>, msg: &[u8]) {
        let mut inner = self.inner.lock().await;

        if !inner.state.is_open() {
            trace!("Dropped packet: exchange is not open");
            return;
        }

        let Ok(outer) = Packet::decode(msg) else {
            trace!("Dropped packet: invalid lob");
            return;
        };
        let Ok(plain) = inner.cipher.decrypt_packet(&outer.body) else {
            trace!("Dropped packet: decryption failed");
            return;
        };
        let Ok(pkt) = Packet::decode(&plain) else {
            trace!("Dropped packet: invalid inner lob");
            return;
        };
        let Ok(header) = pkt.channel_header() else {
            trace!("Dropped packet: invalid channel header");
            return;
        };

        let cid = header.c;
        if !inner.channels.contains_key(&cid) {
            let Some(typ) = header.typ.clone() else {
                trace!("Dropped packet: missing channel type");
                return;
            };
            let Some(endpoint) = self.endpoint.upgrade() else {
                return;
            };
            let Some(listener) = endpoint.listener(&typ) else {
                trace!("Dropped packet: no listener for {:?}", typ);
                return;
            };

            let reliable = header.seq.is_some();
            let state = ChannelState::new(cid, typ.clone(), reliable, false, &self.config);
            let shared = state.shared.clone();
            inner.channels.insert(cid, state);
            self.reset_expire(&mut inner);

            debug!(
                "Opened channel {:?} {} from {}",
                typ,
                cid,
                self.remote_hashname.short()
            );
            let _ = self.events.send(Event::ChannelOpened {
                hashname: self.remote_hashname,
                id: cid,
                typ: typ.clone(),
            });

            let channel = Channel::new(Arc::clone(self), shared, cid, typ.clone(), reliable);
            if listener.try_send(channel).is_err() {
                warn!("Listener backlog full, dropping channel {:?} {}", typ, cid);
                self.unregister_channel(&mut inner, cid, Terminal::Eof);
                return;
            }
        }

        let outcome = match inner.channels.get_mut(&cid) {
            Some(ch) => ch.receive_packet(header, pkt.body),
            None => return,
        };
        self.handle_outcome(&mut inner, cid, outcome).await;
        self.timer_wake.notify_one();
    }

    // ---- channel operations invoked by handles ----

    pub(crate) async fn channel_read(&self, id: u32) -> CoreResult<ChannelRead> {
        let mut inner = self.inner.lock().await;

        let (popped, closed_now, at_eof) = match inner.channels.get_mut(&id) {
            None => return Ok(ChannelRead::Gone),
            Some(ch) => match ch.pop_read() {
                Some(pkt) => {
                    let closed = ch.fully_closed();
                    (Some(pkt), closed, false)
                }
                None => (None, false, ch.ended_remote()),
            },
        };

        if closed_now {
            self.unregister_channel(&mut inner, id, Terminal::Eof);
        }

        match popped {
            Some((header, body)) => Ok(ChannelRead::Packet(header, body)),
            None if at_eof => Ok(ChannelRead::Eof),
            None => Ok(ChannelRead::WouldBlock),
        }
    }

    /// Returns Ok(true) when sent, Ok(false) when the window is full
    pub(crate) async fn channel_write(
        &self,
        id: u32,
        ext: HeaderExt,
        body: Bytes,
    ) -> CoreResult<bool> {
        let mut inner = self.inner.lock().await;

        if !inner.state.is_open() {
            return Err(CoreError::BrokenExchange(self.remote_hashname));
        }

        let now = Instant::now();
        let (header, body) = {
            let ch = inner
                .channels
                .get_mut(&id)
                .ok_or(CoreError::ChannelClosed)?;
            if ch.ended_local() {
                return Err(CoreError::ChannelClosed);
            }
            if !ch.can_send() && !ext.end {
                return Ok(false);
            }
            ch.next_send(body, ext, now)?
        };

        self.send_channel(&mut inner, header, body).await?;
        self.timer_wake.notify_one();
        Ok(true)
    }

    /// Returns Ok(true) once the channel is fully closed and gone
    pub(crate) async fn channel_close(&self, id: u32) -> CoreResult<bool> {
        let mut inner = self.inner.lock().await;

        let now = Instant::now();
        let send = {
            let Some(ch) = inner.channels.get_mut(&id) else {
                return Ok(true);
            };

            if !ch.ended_local() {
                let pkt = ch.next_send(Bytes::new(), HeaderExt::end(), now)?;
                ch.close_deadline.arm(now + self.config.close_grace);
                Some(pkt)
            } else {
                if !ch.close_deadline.is_armed() {
                    ch.close_deadline.arm(now + self.config.close_grace);
                }
                None
            }
        };

        if let Some((header, body)) = send {
            if let Err(e) = self.send_channel(&mut inner, header, body).await {
                debug!("Failed to send end packet on channel {}: {}", id, e);
            }
        }

        let closed = inner
            .channels
            .get(&id)
            .map(|ch| ch.fully_closed())
            .unwrap_or(true);
        if closed {
            self.unregister_channel(&mut inner, id, Terminal::Eof);
        }

        self.timer_wake.notify_one();
        Ok(closed)
    }

    // ---- driver ----

    /// Spawn the timer-driving task for this exchange
    pub(crate) fn spawn_driver(self: &Arc<Self>) {
        let exchange = Arc::clone(self);

        tokio::spawn(async move {
            let mut state_rx = exchange.state_tx.subscribe();

            loop {
                if state_rx.borrow_and_update().is_closed() {
                    break;
                }

                let next = {
                    let inner = exchange.inner.lock().await;
                    let mut deadlines = vec![
                        inner.t_break.at(),
                        inner.t_expire.at(),
                        inner.t_handshake.at(),
                    ];
                    for ch in inner.channels.values() {
                        deadlines.push(ch.next_deadline());
                    }
                    earliest(&deadlines)
                };

                tokio::select! {
                    _ = exchange.timer_wake.notified() => {}
                    changed = state_rx.changed() => {
                        if changed.is_err() {
                            break;
                        }
                    }
                    _ = sleep_or_pend(next) => {
                        exchange.on_tick().await;
                    }
                }
            }

            trace!("Driver for {} stopped", exchange.remote_hashname.short());
        });
    }

    async fn on_tick(&self) {
        let mut inner = self.inner.lock().await;
        let now = Instant::now();

        if inner.t_break.fire_if_due(now) {
            self.expire(&mut inner, true);
            return;
        }

        if inner.t_expire.fire_if_due(now) && inner.channels.is_empty() {
            self.expire(&mut inner, false);
            return;
        }

        if inner.t_handshake.fire_if_due(now) {
            self.reschedule_handshake(&mut inner);
            if let Err(e) = self.deliver_handshake(&mut inner, 0, None).await {
                debug!("Handshake delivery failed: {}", e);
            }
        }

        let ids: Vec<u32> = inner.channels.keys().copied().collect();
        for id in ids {
            let outcome = match inner.channels.get_mut(&id) {
                Some(ch) => ch.tick(now),
                None => continue,
            };
            if outcome.closed {
                self.unregister_channel(&mut inner, id, Terminal::Eof);
                continue;
            }
            self.handle_outcome(&mut inner, id, outcome).await;
        }
    }

    // ---- internals, all under the inner lock ----

    async fn handle_outcome(&self, inner: &mut Inner, cid: u32, outcome: Outcome) {
        for seq in outcome.resend {
            let now = Instant::now();
            let resend = inner
                .channels
                .get_mut(&cid)
                .and_then(|ch| ch.retransmit(seq, now));
            if let Some((header, body)) = resend {
                trace!("Retransmitting seq {} on channel {}", seq, cid);
                if let Err(e) = self.send_channel(inner, header, body).await {
                    debug!("Retransmit failed on channel {}: {}", cid, e);
                    break;
                }
            }
        }

        if outcome.send_ack {
            let header = match inner.channels.get_mut(&cid) {
                Some(ch) => {
                    let header = ch.ack_packet();
                    ch.clear_ack_dirty();
                    header
                }
                None => return,
            };
            if let Err(e) = self.send_channel(inner, header, Bytes::new()).await {
                debug!("Ack send failed on channel {}: {}", cid, e);
            }
        }

        if outcome.closed {
            self.unregister_channel(inner, cid, Terminal::Eof);
        }
    }

    async fn send_channel(
        &self,
        inner: &mut Inner,
        header: telemesh_net::ChannelHeader,
        body: Bytes,
    ) -> CoreResult<()> {
        let addr = inner
            .address_book
            .active_address()
            .ok_or(CoreError::UnreachableEndpoint(self.remote_hashname))?;

        let pkt = Packet::channel(&header, body)?;
        let wire = inner.cipher.encrypt_packet(&pkt.encode())?;
        let msg = Packet::plain(wire).encode();

        self.transport.write_message(&msg, addr).await?;
        Ok(())
    }

    fn apply_handshake_locked(
        &self,
        inner: &mut Inner,
        handshake: &Handshake,
        src: SocketAddr,
    ) -> (Option<Vec<u8>>, bool) {
        let seq = handshake.at();

        // zero is reserved; producers round up
        if seq == 0 {
            return (None, false);
        }
        // a newer handshake has already been processed
        if seq < inner.last_remote_seq {
            return (None, false);
        }
        if handshake.csid() != inner.csid {
            return (None, false);
        }
        if !inner.cipher.apply_handshake(handshake) {
            return (None, false);
        }

        if inner.remote_ident.is_none() {
            match Identity::from_key_and_parts(
                inner.csid,
                *handshake.public_key(),
                handshake.parts().clone(),
                Vec::new(),
            ) {
                Ok(ident) => inner.remote_ident = Some(ident),
                Err(_) => return (None, false),
            }
        }

        let mut response = None;
        if self.is_local_seq(inner, seq) {
            // a response to one of our handshakes: the path answered
            self.reset_break(inner);
            inner.address_book.received_handshake(src);
        } else {
            // a request: acknowledge with a handshake at the same seq
            inner.address_book.add_address(src);
            match self.generate_handshake_locked(inner, seq) {
                Ok(msg) => response = Some(msg),
                Err(_) => return (None, false),
            }
        }

        inner.last_remote_seq = seq;

        if matches!(
            inner.state,
            ExchangeState::Initializing | ExchangeState::Dialing
        ) {
            self.set_state(inner, ExchangeState::Idle);
            self.reset_expire(inner);

            if !inner.opened_emitted {
                inner.opened_emitted = true;
                info!("Exchange with {} opened", self.remote_hashname.short());
                let _ = self.events.send(Event::ExchangeOpened {
                    hashname: self.remote_hashname,
                });
            }
        }

        (response, true)
    }

    fn generate_handshake_locked(&self, inner: &mut Inner, seq: u32) -> CoreResult<Vec<u8>> {
        let seq = if seq == 0 { self.next_seq(inner) } else { seq };

        let body = inner.cipher.encrypt_handshake(seq, &inner.local_parts)?;
        let msg = Packet::handshake(inner.csid, body).encode();

        if inner.last_local_seq < seq {
            inner.last_local_seq = seq;
        }
        Ok(msg.to_vec())
    }

    async fn deliver_handshake(
        &self,
        inner: &mut Inner,
        seq: u32,
        addr: Option<SocketAddr>,
    ) -> CoreResult<()> {
        let addrs = match addr {
            Some(addr) => vec![addr],
            None => {
                inner.address_book.next_handshake_epoch();
                inner.address_book.handshake_addresses()
            }
        };

        let msg = self.generate_handshake_locked(inner, seq)?;
        for addr in addrs {
            if self.transport.write_message(&msg, addr).await.is_ok() {
                inner.address_book.sent_handshake(addr);
            }
        }
        Ok(())
    }

    fn reschedule_handshake(&self, inner: &mut Inner) {
        let doubled = inner.next_handshake_delay.saturating_mul(2);
        let mut delay = doubled
            .max(self.config.handshake_backoff_floor)
            .min(self.config.handshake_backoff_cap);

        let jitter = delay / 3;
        if jitter > 0 {
            delay -= rand::random::<u64>() % jitter;
        }

        inner.next_handshake_delay = delay;
        inner.t_handshake.arm(Instant::now() + Duration::from_secs(delay));
        self.timer_wake.notify_one();
    }

    fn next_seq(&self, inner: &mut Inner) -> u32 {
        let mut seq = inner.next_seq;

        let now = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs() as u32)
            .unwrap_or(0);
        if seq < now {
            seq = now;
        }
        if seq < inner.last_local_seq {
            seq = inner.last_local_seq + 1;
        }
        if seq < inner.last_remote_seq {
            seq = inner.last_remote_seq + 1;
        }
        if seq == 0 {
            seq += 1;
        }

        if inner.cipher.is_high() {
            if seq % 2 == 0 {
                seq += 1;
            }
        } else if seq % 2 == 1 {
            seq += 1;
        }

        inner.next_seq = seq + 2;
        seq
    }

    fn is_local_seq(&self, inner: &Inner, seq: u32) -> bool {
        if inner.cipher.is_high() {
            seq % 2 == 1
        } else {
            seq % 2 == 0
        }
    }

    fn next_channel_id(&self, inner: &mut Inner) -> u32 {
        let mut id = inner.next_channel_id;

        // zero is not valid
        if id == 0 {
            id += 1;
        }

        if inner.cipher.is_high() {
            if id % 2 == 0 {
                id += 1;
            }
        } else if id % 2 == 1 {
            id += 1;
        }

        inner.next_channel_id = id + 2;
        id
    }

    fn set_state(&self, inner: &mut Inner, state: ExchangeState) {
        if inner.state != state {
            debug!(
                "Exchange with {}: {} -> {}",
                self.remote_hashname.short(),
                inner.state,
                state
            );
            inner.state = state;
            self.state_tx.send_replace(state);
        }
    }

    fn reset_expire(&self, inner: &mut Inner) {
        let active = !inner.channels.is_empty();

        if active {
            inner.t_expire.cancel();
        } else if inner.state.is_open() {
            inner.t_expire.arm(Instant::now() + self.config.expire_timeout);
        }

        if inner.state.is_open() {
            let next = if active {
                ExchangeState::Active
            } else {
                ExchangeState::Idle
            };
            self.set_state(inner, next);
        }

        self.timer_wake.notify_one();
    }

    fn reset_break(&self, inner: &mut Inner) {
        inner.t_break.arm(Instant::now() + self.config.break_timeout);
        self.timer_wake.notify_one();
    }

    fn unregister_channel(&self, inner: &mut Inner, id: u32, terminal: Terminal) {
        if let Some(state) = inner.channels.remove(&id) {
            state.shared.set_terminal(terminal);
            self.reset_expire(inner);

            debug!(
                "Closed channel {:?} {} (initiator={})",
                state.typ, id, state.initiator
            );
            let _ = self.events.send(Event::ChannelClosed {
                hashname: self.remote_hashname,
                id,
                typ: state.typ.clone(),
            });
        }
    }

    fn expire(&self, inner: &mut Inner, broken: bool) {
        if inner.state.is_closed() {
            return;
        }

        let state = if broken {
            ExchangeState::Broken
        } else {
            ExchangeState::Expired
        };
        self.set_state(inner, state);

        inner.t_break.cancel();
        inner.t_expire.cancel();
        inner.t_handshake.cancel();

        let terminal = if broken {
            Terminal::Broken(self.remote_hashname)
        } else {
            Terminal::Expired(self.remote_hashname)
        };
        let ids: Vec<u32> = inner.channels.keys().copied().collect();
        for id in ids {
            if let Some(ch) = inner.channels.remove(&id) {
                ch.shared.set_terminal(terminal.clone());
                let _ = self.events.send(Event::ChannelClosed {
                    hashname: self.remote_hashname,
                    id,
                    typ: ch.typ.clone(),
                });
            }
        }

        if let Some(endpoint) = self.endpoint.upgrade() {
            endpoint.unregister_exchange(&self.remote_hashname, inner.cipher.local_token());
        }

        info!(
            "Exchange with {} {}",
            self.remote_hashname.short(),
            if broken { "broke" } else { "expired" }
        );
        let _ = self.events.send(Event::ExchangeClosed {
            hashname: self.remote_hashname,
            broken,
        });
        self.timer_wake.notify_one();
    }
}

impl std::fmt::Debug for Exchange {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "Exchange({} state={})",
            self.remote_hashname.short(),
            self.state()
        )
    }
}

async fn sleep_or_pend(deadline: Option<Instant>) {
    match deadline {
        Some(at) => tokio::time::sleep_until(at).await,
        None => std::future::pending::<()>().await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use telemesh_crypto::Registry;
    use telemesh_net::UdpTransport;

    struct Peer {
        exchange: Arc<Exchange>,
        registry: Registry,
        local_keys: LocalKeys,
        transport: Arc<UdpTransport>,
    }

    async fn peer_pair(config: Config) -> (Peer, Peer) {
        let registry_a = Registry::with_defaults();
        let registry_b = Registry::with_defaults();
        let keys_a = registry_a.generate_keys();
        let keys_b = registry_b.generate_keys();

        let ident_a = Identity::from_keys(
            keys_a.iter().map(|(c, k)| (*c, k.public)).collect(),
            Vec::new(),
        )
        .unwrap();
        let ident_b = Identity::from_keys(
            keys_b.iter().map(|(c, k)| (*c, k.public)).collect(),
            Vec::new(),
        )
        .unwrap();

        let transport_a = Arc::new(
            UdpTransport::bind("127.0.0.1:0".parse().unwrap())
                .await
                .unwrap(),
        );
        let transport_b = Arc::new(
            UdpTransport::bind("127.0.0.1:0".parse().unwrap())
                .await
                .unwrap(),
        );

        let ident_b_with_path = ident_b.with_paths(vec![transport_b.local_addr()]);
        let ident_a_with_path = ident_a.with_paths(vec![transport_a.local_addr()]);

        let (events_a, _) = broadcast::channel(16);
        let (events_b, _) = broadcast::channel(16);

        let xa = Exchange::with_identity(
            ExchangeContext {
                config: config.clone(),
                local_parts: registry_a.parts_for(&keys_a),
                transport: transport_a.clone(),
                endpoint: Weak::new(),
                events: events_a,
            },
            &registry_a,
            &keys_a,
            ident_b_with_path,
        )
        .unwrap();

        let xb = Exchange::with_identity(
            ExchangeContext {
                config: config.clone(),
                local_parts: registry_b.parts_for(&keys_b),
                transport: transport_b.clone(),
                endpoint: Weak::new(),
                events: events_b,
            },
            &registry_b,
            &keys_b,
            ident_a_with_path,
        )
        .unwrap();

        (
            Peer {
                exchange: xa,
                registry: registry_a,
                local_keys: keys_a,
                transport: transport_a,
            },
            Peer {
                exchange: xb,
                registry: registry_b,
                local_keys: keys_b,
                transport: transport_b,
            },
        )
    }

    fn decrypt(peer: &Peer, msg: &[u8]) -> Handshake {
        let pkt = Packet::decode(msg).unwrap();
        let csid = pkt.csid().unwrap();
        peer.registry
            .decrypt_handshake(csid, &peer.local_keys[&csid], &pkt.body)
            .unwrap()
    }

    /// Shuttle a's request handshake to b and b's response back
    async fn open_by_hand(a: &Peer, b: &Peer) {
        let msg = a.exchange.generate_handshake().await.unwrap();
        let hs = decrypt(b, &msg);

        let a_addr = a.transport.local_addr();
        let (response, ok) = b.exchange.apply_handshake(&hs, a_addr).await;
        assert!(ok);

        let response = response.expect("request handshake yields a response");
        let hs = decrypt(a, &response);
        let (none, ok) = a
            .exchange
            .apply_handshake(&hs, b.transport.local_addr())
            .await;
        assert!(ok);
        assert!(none.is_none());
    }

    #[tokio::test]
    async fn test_manual_handshake_opens_both() {
        let (a, b) = peer_pair(Config::default()).await;
        open_by_hand(&a, &b).await;

        assert!(a.exchange.state().is_open());
        assert!(b.exchange.state().is_open());

        // tokens cross-match
        assert_eq!(
            a.exchange.local_token().await,
            b.exchange.remote_token().await
        );
        assert_eq!(
            a.exchange.remote_token().await,
            b.exchange.local_token().await
        );
    }

    #[tokio::test]
    async fn test_seq_parity_is_opposite() {
        let (a, b) = peer_pair(Config::default()).await;
        open_by_hand(&a, &b).await;

        let mut inner_a = a.exchange.inner.lock().await;
        let mut inner_b = b.exchange.inner.lock().await;

        let seq_a = a.exchange.next_seq(&mut inner_a);
        let seq_b = b.exchange.next_seq(&mut inner_b);
        assert_ne!(seq_a % 2, seq_b % 2);

        // strictly monotone, parity preserved
        let next_a = a.exchange.next_seq(&mut inner_a);
        assert!(next_a > seq_a);
        assert_eq!(next_a % 2, seq_a % 2);
    }

    #[tokio::test]
    async fn test_channel_id_parity_is_opposite() {
        let (a, b) = peer_pair(Config::default()).await;
        open_by_hand(&a, &b).await;

        let ch_a = a.exchange.open("test", false).await.unwrap();
        let ch_b = b.exchange.open("test", false).await.unwrap();
        assert_ne!(ch_a.id() % 2, ch_b.id() % 2);
        assert!(ch_a.id() > 0 && ch_b.id() > 0);
    }

    #[tokio::test]
    async fn test_stale_handshake_dropped() {
        let (a, b) = peer_pair(Config::default()).await;

        let first = a.exchange.generate_handshake().await.unwrap();
        let second = a.exchange.generate_handshake().await.unwrap();
        let a_addr = a.transport.local_addr();

        let hs_new = decrypt(&b, &second);
        let (_, ok) = b.exchange.apply_handshake(&hs_new, a_addr).await;
        assert!(ok);

        let hs_old = decrypt(&b, &first);
        let (_, ok) = b.exchange.apply_handshake(&hs_old, a_addr).await;
        assert!(!ok, "older handshake must be dropped");
    }

    #[tokio::test]
    async fn test_repeat_handshake_is_idempotent() {
        let (a, b) = peer_pair(Config::default()).await;
        let mut events = b.exchange.events.subscribe();

        let msg = a.exchange.generate_handshake().await.unwrap();
        let a_addr = a.transport.local_addr();

        let hs = decrypt(&b, &msg);
        let (_, ok) = b.exchange.apply_handshake(&hs, a_addr).await;
        assert!(ok);

        let hs = decrypt(&b, &msg);
        let (_, ok) = b.exchange.apply_handshake(&hs, a_addr).await;
        assert!(ok, "repeats must be accepted");

        // exactly one opened event
        assert!(matches!(
            events.try_recv(),
            Ok(Event::ExchangeOpened { .. })
        ));
        assert!(events.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_open_requires_open_state() {
        let (a, _b) = peer_pair(Config::default()).await;

        a.exchange.close().await;
        assert!(matches!(
            a.exchange.open("test", true).await,
            Err(CoreError::BrokenExchange(_))
        ));
    }

    #[tokio::test]
    async fn test_open_on_initializing_fails() {
        let (a, _b) = peer_pair(Config::default()).await;
        assert!(a.exchange.open("test", true).await.is_err());
    }

    #[tokio::test]
    async fn test_channel_type_validation() {
        let (a, b) = peer_pair(Config::default()).await;
        open_by_hand(&a, &b).await;

        let long = "x".repeat(MAX_TYPE_LEN + 1);
        assert!(matches!(
            a.exchange.open(&long, true).await,
            Err(CoreError::InvalidChannelType(_))
        ));
        assert!(a.exchange.open("", true).await.is_err());
    }

    #[tokio::test]
    async fn test_idle_active_transitions() {
        let (a, b) = peer_pair(Config::default()).await;
        open_by_hand(&a, &b).await;
        assert_eq!(a.exchange.state(), ExchangeState::Idle);

        let ch = a.exchange.open("test", false).await.unwrap();
        assert_eq!(a.exchange.state(), ExchangeState::Active);

        // tear the channel down locally; exchange returns to idle
        let mut inner = a.exchange.inner.lock().await;
        a.exchange
            .unregister_channel(&mut inner, ch.id(), Terminal::Eof);
        assert_eq!(inner.state, ExchangeState::Idle);
    }

    #[tokio::test]
    async fn test_dial_timeout_breaks() {
        // nobody answers: break fires and dial fails
        let (a, _b) = peer_pair(Config::fast()).await;
        a.exchange.spawn_driver();

        let result = a.exchange.dial().await;
        assert!(matches!(result, Err(CoreError::BrokenExchange(_))));
        assert_eq!(a.exchange.state(), ExchangeState::Broken);
    }

    #[tokio::test]
    async fn test_expire_after_idle() {
        let (a, b) = peer_pair(Config::fast()).await;
        open_by_hand(&a, &b).await;
        a.exchange.spawn_driver();

        let mut events = a.exchange.events.subscribe();
        tokio::time::timeout(Duration::from_secs(5), async {
            loop {
                if let Ok(Event::ExchangeClosed { broken, .. }) = events.recv().await {
                    assert!(!broken);
                    break;
                }
            }
        })
        .await
        .expect("exchange should expire");

        assert_eq!(a.exchange.state(), ExchangeState::Expired);
    }
}
