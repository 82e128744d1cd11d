//! Datagram Transports
//!
//! The `Transport` trait is the collaborator interface consumed by the
//! endpoint: read and write self-delimited messages, enumerate local
//! addresses, and codec `path` objects. `UdpTransport` is the standard
//! implementation over a tokio UDP socket.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use tokio::net::UdpSocket;
use tokio::sync::Notify;
use tracing::{debug, trace};

use crate::error::{NetError, NetResult};
use crate::lob::MAX_MESSAGE_SIZE;

/// A datagram transport carrying telemesh messages
#[async_trait]
pub trait Transport: Send + Sync {
    /// Read the next message and its source address
    async fn read_message(&self) -> NetResult<(Bytes, SocketAddr)>;

    /// Write a message to the given address
    async fn write_message(&self, msg: &[u8], addr: SocketAddr) -> NetResult<()>;

    /// Local addresses this transport is reachable on
    fn local_addresses(&self) -> Vec<SocketAddr>;

    /// Parse a JSON-encoded `path` object
    fn decode_addr(&self, data: &[u8]) -> NetResult<SocketAddr>;

    /// Format an address as a JSON-encoded `path` object
    fn encode_addr(&self, addr: SocketAddr) -> NetResult<Vec<u8>>;

    /// Shut the transport down; blocked readers return `TransportClosed`
    async fn close(&self) -> NetResult<()>;
}

/// JSON `path` object describing a transport address
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PathObject {
    #[serde(rename = "type")]
    pub typ: String,
    pub ip: String,
    pub port: u16,
}

impl PathObject {
    /// Build a path object for a socket address
    pub fn from_addr(addr: SocketAddr) -> Self {
        Self {
            typ: if addr.is_ipv4() { "udp4" } else { "udp6" }.to_string(),
            ip: addr.ip().to_string(),
            port: addr.port(),
        }
    }

    /// Resolve back into a socket address
    pub fn to_addr(&self) -> NetResult<SocketAddr> {
        if self.typ != "udp4" && self.typ != "udp6" {
            return Err(NetError::InvalidAddress(format!(
                "unsupported path type {:?}",
                self.typ
            )));
        }

        let ip = self
            .ip
            .parse()
            .map_err(|_| NetError::InvalidAddress(format!("bad ip {:?}", self.ip)))?;
        Ok(SocketAddr::new(ip, self.port))
    }
}

/// UDP transport for telemesh messages
pub struct UdpTransport {
    socket: Arc<UdpSocket>,
    local_addr: SocketAddr,
    closed: AtomicBool,
    close_notify: Notify,
}

impl UdpTransport {
    /// Create a new UDP transport bound to the specified address
    pub async fn bind(addr: SocketAddr) -> NetResult<Self> {
        let socket = UdpSocket::bind(addr).await.map_err(|e| {
            if e.kind() == std::io::ErrorKind::AddrInUse {
                NetError::AddressInUse(addr)
            } else {
                NetError::Io(e)
            }
        })?;

        let local_addr = socket.local_addr()?;
        debug!("UDP transport bound to {}", local_addr);

        Ok(Self {
            socket: Arc::new(socket),
            local_addr,
            closed: AtomicBool::new(false),
            close_notify: Notify::new(),
        })
    }

    /// Get the bound address
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }
}

#[async_trait]
impl Transport for UdpTransport {
    async fn read_message(&self) -> NetResult<(Bytes, SocketAddr)> {
        if self.closed.load(Ordering::Acquire) {
            return Err(NetError::TransportClosed);
        }

        let mut buf = vec![0u8; MAX_MESSAGE_SIZE];

        tokio::select! {
            _ = self.close_notify.notified() => Err(NetError::TransportClosed),
            result = self.socket.recv_from(&mut buf) => {
                let (len, from) = result?;
                buf.truncate(len);
                trace!("Received {} bytes from {}", len, from);
                Ok((Bytes::from(buf), from))
            }
        }
    }

    async fn write_message(&self, msg: &[u8], addr: SocketAddr) -> NetResult<()> {
        if self.closed.load(Ordering::Acquire) {
            return Err(NetError::TransportClosed);
        }
        if msg.len() > MAX_MESSAGE_SIZE {
            return Err(NetError::InvalidPacket(format!(
                "message too large: {} bytes",
                msg.len()
            )));
        }

        trace!("Sending {} bytes to {}", msg.len(), addr);
        self.socket.send_to(msg, addr).await?;
        Ok(())
    }

    fn local_addresses(&self) -> Vec<SocketAddr> {
        vec![self.local_addr]
    }

    fn decode_addr(&self, data: &[u8]) -> NetResult<SocketAddr> {
        let path: PathObject =
            serde_json::from_slice(data).map_err(|e| NetError::InvalidAddress(e.to_string()))?;
        path.to_addr()
    }

    fn encode_addr(&self, addr: SocketAddr) -> NetResult<Vec<u8>> {
        serde_json::to_vec(&PathObject::from_addr(addr))
            .map_err(|e| NetError::InvalidAddress(e.to_string()))
    }

    async fn close(&self) -> NetResult<()> {
        self.closed.store(true, Ordering::Release);
        self.close_notify.notify_waiters();
        debug!("UDP transport on {} closed", self.local_addr);
        Ok(())
    }
}

/// Builder for UDP transport with custom socket options
pub struct UdpTransportBuilder {
    bind_addr: SocketAddr,
    recv_buffer_size: Option<usize>,
    send_buffer_size: Option<usize>,
}

impl UdpTransportBuilder {
    /// Create a new builder
    pub fn new(bind_addr: SocketAddr) -> Self {
        Self {
            bind_addr,
            recv_buffer_size: None,
            send_buffer_size: None,
        }
    }

    /// Set receive buffer size
    pub fn recv_buffer_size(mut self, size: usize) -> Self {
        self.recv_buffer_size = Some(size);
        self
    }

    /// Set send buffer size
    pub fn send_buffer_size(mut self, size: usize) -> Self {
        self.send_buffer_size = Some(size);
        self
    }

    /// Build the transport
    pub async fn build(self) -> NetResult<UdpTransport> {
        use socket2::{Domain, Protocol, Socket, Type};

        let domain = if self.bind_addr.is_ipv6() {
            Domain::IPV6
        } else {
            Domain::IPV4
        };

        let socket = Socket::new(domain, Type::DGRAM, Some(Protocol::UDP))?;

        if let Some(size) = self.recv_buffer_size {
            socket.set_recv_buffer_size(size)?;
        }
        if let Some(size) = self.send_buffer_size {
            socket.set_send_buffer_size(size)?;
        }

        socket.set_reuse_address(true)?;
        socket.set_nonblocking(true)?;
        socket.bind(&self.bind_addr.into())?;

        let std_socket: std::net::UdpSocket = socket.into();
        let tokio_socket = UdpSocket::from_std(std_socket)?;

        let local_addr = tokio_socket.local_addr()?;
        debug!("UDP transport bound to {} with custom options", local_addr);

        Ok(UdpTransport {
            socket: Arc::new(tokio_socket),
            local_addr,
            closed: AtomicBool::new(false),
            close_notify: Notify::new(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_transport_bind() {
        let transport = UdpTransport::bind("127.0.0.1:0".parse().unwrap())
            .await
            .unwrap();

        assert!(transport.local_addr().port() > 0);
    }

    #[tokio::test]
    async fn test_transport_send_recv() {
        let t1 = UdpTransport::bind("127.0.0.1:0".parse().unwrap())
            .await
            .unwrap();
        let t2 = UdpTransport::bind("127.0.0.1:0".parse().unwrap())
            .await
            .unwrap();

        t1.write_message(b"ping", t2.local_addr()).await.unwrap();

        let (msg, from) = t2.read_message().await.unwrap();
        assert_eq!(&msg[..], b"ping");
        assert_eq!(from, t1.local_addr());
    }

    #[tokio::test]
    async fn test_closed_transport_errors() {
        let transport = UdpTransport::bind("127.0.0.1:0".parse().unwrap())
            .await
            .unwrap();
        transport.close().await.unwrap();

        assert!(matches!(
            transport.read_message().await,
            Err(NetError::TransportClosed)
        ));
        assert!(matches!(
            transport
                .write_message(b"x", "127.0.0.1:1".parse().unwrap())
                .await,
            Err(NetError::TransportClosed)
        ));
    }

    #[tokio::test]
    async fn test_close_unblocks_reader() {
        let transport = Arc::new(
            UdpTransport::bind("127.0.0.1:0".parse().unwrap())
                .await
                .unwrap(),
        );

        let reader = transport.clone();
        let handle = tokio::spawn(async move { reader.read_message().await });

        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        transport.close().await.unwrap();

        assert!(matches!(
            handle.await.unwrap(),
            Err(NetError::TransportClosed)
        ));
    }

    #[test]
    fn test_path_object_roundtrip() {
        let addr: SocketAddr = "192.0.2.7:4242".parse().unwrap();
        let path = PathObject::from_addr(addr);

        assert_eq!(path.typ, "udp4");
        assert_eq!(path.to_addr().unwrap(), addr);
    }

    #[tokio::test]
    async fn test_addr_codec() {
        let transport = UdpTransport::bind("127.0.0.1:0".parse().unwrap())
            .await
            .unwrap();

        let addr: SocketAddr = "10.0.0.9:9000".parse().unwrap();
        let encoded = transport.encode_addr(addr).unwrap();
        assert_eq!(transport.decode_addr(&encoded).unwrap(), addr);

        assert!(transport.decode_addr(b"{\"type\":\"tcp4\"}").is_err());
    }
}
