//! Endpoints
//!
//! Process-level registry of exchanges by hashname and by token, the
//! listener table by channel type, and the inbound dispatch loop. A
//! one-byte head marks a handshake and routes by the hashname derived
//! from its parts; anything else routes by the leading 16-byte token
//! with a source-address fallback.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex as StdMutex};

use bytes::Bytes;
use tokio::sync::{broadcast, mpsc};
use tracing::{debug, info, trace, warn};

use telemesh_crypto::{LocalKeys, Parts, Registry, Token};
use telemesh_net::lob::{self, Packet};
use telemesh_net::{NetError, Transport, UdpTransport};

use crate::broker;
use crate::channel::Channel;
use crate::config::Config;
use crate::error::{CoreError, CoreResult};
use crate::events::Event;
use crate::exchange::{Exchange, ExchangeContext};
use crate::hashname::Hashname;
use crate::identity::Identity;

/// Accept queue for one channel type
pub struct Listener {
    typ: String,
    rx: mpsc::Receiver<Channel>,
}

impl Listener {
    /// Wait for the next inbound channel of this type
    pub async fn accept(&mut self) -> CoreResult<Channel> {
        self.rx.recv().await.ok_or(CoreError::TransportClosed)
    }

    /// The channel type this listener accepts
    pub fn typ(&self) -> &str {
        &self.typ
    }
}

/// Dropped-packet accounting
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct EndpointStats {
    /// Datagrams that failed LOB or header decoding
    pub malformed_packets: u64,
    /// Line packets with no matching exchange
    pub unroutable_packets: u64,
    /// Handshakes that failed decryption or authentication
    pub invalid_handshakes: u64,
}

#[derive(Default)]
struct StatCounters {
    malformed: AtomicU64,
    unroutable: AtomicU64,
    invalid_handshakes: AtomicU64,
}

struct Maps {
    hashnames: HashMap<Hashname, Arc<Exchange>>,
    tokens: HashMap<Token, Arc<Exchange>>,
    addrs: HashMap<SocketAddr, Hashname>,
}

pub(crate) struct EndpointShared {
    config: Config,
    registry: Registry,
    local_keys: LocalKeys,
    local_parts: Parts,
    hashname: Hashname,
    transport: Arc<dyn Transport>,
    maps: StdMutex<Maps>,
    listeners: StdMutex<HashMap<String, mpsc::Sender<Channel>>>,
    events: broadcast::Sender<Event>,
    stats: StatCounters,
    closed: AtomicBool,
}

/// A telemesh endpoint: one set of keys, one transport, many exchanges
pub struct Endpoint {
    shared: Arc<EndpointShared>,
}

impl Endpoint {
    /// Open an endpoint on a UDP socket bound to `addr`
    pub async fn open(addr: SocketAddr, config: Config) -> CoreResult<Self> {
        let transport = Arc::new(UdpTransport::bind(addr).await?);
        Self::with_transport(transport, config)
    }

    /// Open an endpoint over an existing transport
    pub fn with_transport(transport: Arc<dyn Transport>, config: Config) -> CoreResult<Self> {
        config.validate().map_err(CoreError::InvalidConfig)?;

        let registry = Registry::with_defaults();
        let local_keys = registry.generate_keys();
        let local_parts = registry.parts_for(&local_keys);
        let public_keys = local_keys.iter().map(|(c, k)| (*c, k.public)).collect();
        let hashname = Hashname::derive(&local_parts, &public_keys)?;

        let (events, _) = broadcast::channel(config.event_capacity);

        let shared = Arc::new(EndpointShared {
            config,
            registry,
            local_keys,
            local_parts,
            hashname,
            transport,
            maps: StdMutex::new(Maps {
                hashnames: HashMap::new(),
                tokens: HashMap::new(),
                addrs: HashMap::new(),
            }),
            listeners: StdMutex::new(HashMap::new()),
            events,
            stats: StatCounters::default(),
            closed: AtomicBool::new(false),
        });

        let endpoint = Self {
            shared: Arc::clone(&shared),
        };

        broker::spawn(&endpoint.shared);

        tokio::spawn(run_receiver(shared));

        info!("Endpoint {} open", endpoint.shared.hashname.short());
        Ok(endpoint)
    }

    /// This endpoint's hashname
    pub fn hashname(&self) -> Hashname {
        self.shared.hashname
    }

    /// This endpoint's shareable identity document data
    pub fn local_identity(&self) -> CoreResult<Identity> {
        let keys = self
            .shared
            .local_keys
            .iter()
            .map(|(c, k)| (*c, k.public))
            .collect();
        Identity::from_keys(keys, self.shared.transport.local_addresses())
    }

    /// Subscribe to lifecycle events
    pub fn subscribe(&self) -> broadcast::Receiver<Event> {
        self.shared.events.subscribe()
    }

    /// Register a listener for a channel type
    ///
    /// Replaces any previous listener for the same type.
    pub fn listen(&self, typ: &str) -> Listener {
        let (tx, rx) = mpsc::channel(self.shared.config.listener_backlog);
        self.shared
            .listeners
            .lock()
            .unwrap()
            .insert(typ.to_string(), tx);
        Listener {
            typ: typ.to_string(),
            rx,
        }
    }

    /// Dial a remote identity, creating or reusing the exchange
    pub async fn dial(&self, ident: &Identity) -> CoreResult<Arc<Exchange>> {
        self.shared.dial_identity(ident).await
    }

    /// The exchange for a hashname, if one exists
    pub fn exchange_to(&self, hashname: &Hashname) -> Option<Arc<Exchange>> {
        self.shared.exchange_to(hashname)
    }

    /// Ask `via` to introduce this endpoint to `peer`
    pub async fn introduce(&self, via: &Hashname, peer: &Hashname) -> CoreResult<()> {
        broker::introduce(&self.shared, via, peer).await
    }

    /// Dropped-packet counters
    pub fn stats(&self) -> EndpointStats {
        EndpointStats {
            malformed_packets: self.shared.stats.malformed.load(Ordering::Relaxed),
            unroutable_packets: self.shared.stats.unroutable.load(Ordering::Relaxed),
            invalid_handshakes: self.shared.stats.invalid_handshakes.load(Ordering::Relaxed),
        }
    }

    /// Close the endpoint: expire every exchange and shut the transport
    pub async fn close(&self) {
        self.shared.closed.store(true, Ordering::Release);

        let exchanges: Vec<Arc<Exchange>> = {
            let maps = self.shared.maps.lock().unwrap();
            maps.hashnames.values().cloned().collect()
        };
        for exchange in exchanges {
            exchange.close().await;
        }

        if let Err(e) = self.shared.transport.close().await {
            warn!("Transport close failed: {}", e);
        }
        info!("Endpoint {} closed", self.shared.hashname.short());
    }
}

impl EndpointShared {
    pub(crate) fn hashname(&self) -> Hashname {
        self.hashname
    }

    pub(crate) fn transport(&self) -> &Arc<dyn Transport> {
        &self.transport
    }

    pub(crate) fn listener(&self, typ: &str) -> Option<mpsc::Sender<Channel>> {
        self.listeners.lock().unwrap().get(typ).cloned()
    }

    pub(crate) fn register_listener(&self, typ: &str, backlog: usize) -> mpsc::Receiver<Channel> {
        let (tx, rx) = mpsc::channel(backlog);
        self.listeners.lock().unwrap().insert(typ.to_string(), tx);
        rx
    }

    pub(crate) fn exchange_to(&self, hashname: &Hashname) -> Option<Arc<Exchange>> {
        self.maps.lock().unwrap().hashnames.get(hashname).cloned()
    }

    pub(crate) fn unregister_exchange(&self, hashname: &Hashname, token: Option<Token>) {
        let mut maps = self.maps.lock().unwrap();
        maps.hashnames.remove(hashname);
        if let Some(token) = token {
            maps.tokens.remove(&token);
        }
        maps.addrs.retain(|_, hn| hn != hashname);
    }

    pub(crate) async fn dial_identity(self: &Arc<Self>, ident: &Identity) -> CoreResult<Arc<Exchange>> {
        let hashname = ident.hashname();
        if hashname == self.hashname {
            return Err(CoreError::UnreachableEndpoint(hashname));
        }

        let (exchange, created) = {
            let mut maps = self.maps.lock().unwrap();
            match maps.hashnames.get(&hashname) {
                Some(exchange) => (Arc::clone(exchange), false),
                None => {
                    let exchange = Exchange::with_identity(
                        self.exchange_context(),
                        &self.registry,
                        &self.local_keys,
                        ident.clone(),
                    )?;
                    maps.hashnames.insert(hashname, Arc::clone(&exchange));
                    (exchange, true)
                }
            }
        };

        if created {
            exchange.spawn_driver();
            if let Some(token) = exchange.local_token().await {
                self.maps.lock().unwrap().tokens.insert(token, Arc::clone(&exchange));
            }
        }

        exchange.dial().await?;
        Ok(exchange)
    }

    fn exchange_context(self: &Arc<Self>) -> ExchangeContext {
        ExchangeContext {
            config: self.config.clone(),
            local_parts: self.local_parts.clone(),
            transport: Arc::clone(&self.transport),
            endpoint: Arc::downgrade(self),
            events: self.events.clone(),
        }
    }

    async fn receive(self: &Arc<Self>, msg: Bytes, src: SocketAddr) {
        if msg.len() < lob::MIN_MESSAGE_SIZE {
            // NAT breakers and noise land here
            self.stats.malformed.fetch_add(1, Ordering::Relaxed);
            return;
        }

        if lob::is_handshake_message(&msg) {
            self.receive_handshake(&msg, src).await;
        } else if let Some(token) = lob::message_token(&msg) {
            let exchange = {
                let maps = self.maps.lock().unwrap();
                maps.tokens.get(&token).cloned().or_else(|| {
                    maps.addrs
                        .get(&src)
                        .and_then(|hn| maps.hashnames.get(hn))
                        .cloned()
                })
            };

            match exchange {
                Some(exchange) => exchange.received_packet(&msg).await,
                None => {
                    trace!("Unroutable packet from {}", src);
                    self.stats.unroutable.fetch_add(1, Ordering::Relaxed);
                }
            }
        } else {
            self.stats.malformed.fetch_add(1, Ordering::Relaxed);
        }
    }

    async fn receive_handshake(self: &Arc<Self>, msg: &[u8], src: SocketAddr) {
        let Ok(pkt) = Packet::decode(msg) else {
            self.stats.malformed.fetch_add(1, Ordering::Relaxed);
            return;
        };
        let Some(csid) = pkt.csid() else {
            self.stats.malformed.fetch_add(1, Ordering::Relaxed);
            return;
        };
        let Some(local) = self.local_keys.get(&csid) else {
            trace!("Handshake for unsupported csid 0x{:02x} from {}", csid, src);
            self.stats.invalid_handshakes.fetch_add(1, Ordering::Relaxed);
            return;
        };

        let handshake = match self.registry.decrypt_handshake(csid, local, &pkt.body) {
            Ok(handshake) => handshake,
            Err(e) => {
                debug!("Invalid handshake from {}: {}", src, e);
                self.stats.invalid_handshakes.fetch_add(1, Ordering::Relaxed);
                return;
            }
        };

        let hashname = match Hashname::from_key_and_parts(
            csid,
            handshake.public_key(),
            handshake.parts(),
        ) {
            Ok(hashname) => hashname,
            Err(_) => {
                debug!("Handshake from {} with mismatched parts", src);
                self.stats.invalid_handshakes.fetch_add(1, Ordering::Relaxed);
                return;
            }
        };
        if hashname == self.hashname {
            trace!("Dropped handshake from ourselves");
            return;
        }

        let (exchange, created) = {
            let mut maps = self.maps.lock().unwrap();
            match maps.hashnames.get(&hashname) {
                Some(exchange) => (Arc::clone(exchange), false),
                None => {
                    // unsolicited exchanges are always allowed; the
                    // cipher layer authenticates
                    match Exchange::from_handshake(
                        self.exchange_context(),
                        &self.registry,
                        &self.local_keys,
                        csid,
                        hashname,
                    ) {
                        Ok(exchange) => {
                            maps.hashnames.insert(hashname, Arc::clone(&exchange));
                            (exchange, true)
                        }
                        Err(e) => {
                            debug!("Failed to create exchange for {}: {}", src, e);
                            self.stats.invalid_handshakes.fetch_add(1, Ordering::Relaxed);
                            return;
                        }
                    }
                }
            }
        };
        if created {
            exchange.spawn_driver();
        }

        if exchange.received_handshake(&handshake, src).await {
            let token = exchange.local_token().await;
            let mut maps = self.maps.lock().unwrap();
            if let Some(token) = token {
                maps.tokens.insert(token, Arc::clone(&exchange));
            }
            maps.addrs.insert(src, hashname);
        } else {
            self.stats.invalid_handshakes.fetch_add(1, Ordering::Relaxed);
            if created {
                exchange.close().await;
            }
        }
    }

    async fn abort_all(&self) {
        let exchanges: Vec<Arc<Exchange>> = {
            let maps = self.maps.lock().unwrap();
            maps.hashnames.values().cloned().collect()
        };
        for exchange in exchanges {
            exchange.abort().await;
        }
    }
}

async fn run_receiver(shared: Arc<EndpointShared>) {
    loop {
        match shared.transport.read_message().await {
            Ok((msg, src)) => shared.receive(msg, src).await,
            Err(NetError::TransportClosed) => {
                if !shared.closed.load(Ordering::Acquire) {
                    warn!("Transport closed unexpectedly, breaking all exchanges");
                    shared.abort_all().await;
                }
                break;
            }
            Err(e) => {
                warn!("Transport receive error: {}", e);
            }
        }
    }
    debug!("Receiver for {} stopped", shared.hashname.short());
}
