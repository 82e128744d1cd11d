//! NAT Port Mapping
//!
//! Wraps an inner transport and keeps port forwards alive on an
//! internal gateway (UPnP/NAT-PMP, behind the `Gateway` trait). The
//! resulting external addresses are advertised as additional local
//! addresses.

use std::net::{IpAddr, SocketAddr};
use std::sync::{Arc, RwLock};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::Notify;
use tracing::{debug, warn};

use crate::error::NetResult;
use crate::transport::Transport;

/// Lease requested for each port mapping
pub const MAPPING_LEASE: Duration = Duration::from_secs(60);

/// Default interval between mapping refreshes
pub const REFRESH_INTERVAL: Duration = Duration::from_secs(30);

const MAPPING_DESCRIPTION: &str = "telemesh";

/// An internal gateway capable of port mapping
#[async_trait]
pub trait Gateway: Send + Sync {
    /// The gateway's external IP address
    async fn external_ip(&self) -> NetResult<IpAddr>;

    /// Map an internal port; returns the external port
    async fn add_port_mapping(
        &self,
        proto: &str,
        internal_port: u16,
        description: &str,
        lease: Duration,
    ) -> NetResult<u16>;

    /// Remove a mapping
    async fn delete_port_mapping(&self, proto: &str, internal_port: u16) -> NetResult<()>;
}

/// One live port forward
#[derive(Debug, Clone, Copy)]
struct Mapping {
    internal_port: u16,
    external: SocketAddr,
}

/// Transport wrapper advertising gateway-mapped addresses
pub struct NatMapper {
    inner: Arc<dyn Transport>,
    gateway: Arc<dyn Gateway>,
    mapped: RwLock<Vec<Mapping>>,
    shutdown: Notify,
}

impl NatMapper {
    /// Wrap a transport and start the refresh task
    pub fn new(inner: Arc<dyn Transport>, gateway: Arc<dyn Gateway>) -> Arc<Self> {
        Self::with_interval(inner, gateway, REFRESH_INTERVAL)
    }

    /// Wrap a transport with a custom refresh interval
    pub fn with_interval(
        inner: Arc<dyn Transport>,
        gateway: Arc<dyn Gateway>,
        interval: Duration,
    ) -> Arc<Self> {
        let mapper = Arc::new(Self {
            inner,
            gateway,
            mapped: RwLock::new(Vec::new()),
            shutdown: Notify::new(),
        });

        let task = Arc::clone(&mapper);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                tokio::select! {
                    _ = ticker.tick() => task.refresh().await,
                    _ = task.shutdown.notified() => break,
                }
            }
        });

        mapper
    }

    /// The currently mapped external addresses
    pub fn mapped_addresses(&self) -> Vec<SocketAddr> {
        self.mapped.read().unwrap().iter().map(|m| m.external).collect()
    }

    /// Query the gateway and renew all mappings
    pub async fn refresh(&self) {
        let external_ip = match self.gateway.external_ip().await {
            Ok(ip) => ip,
            Err(e) => {
                warn!("NAT gateway is unreachable: {}", e);
                self.mapped.write().unwrap().clear();
                return;
            }
        };

        let mut mapped = Vec::new();
        for addr in self.inner.local_addresses() {
            if addr.port() == 0 {
                continue;
            }

            match self
                .gateway
                .add_port_mapping("udp", addr.port(), MAPPING_DESCRIPTION, MAPPING_LEASE)
                .await
            {
                Ok(external_port) => {
                    let global = SocketAddr::new(external_ip, external_port);
                    debug!("NAT mapped {} to {}", addr, global);
                    mapped.push(Mapping {
                        internal_port: addr.port(),
                        external: global,
                    });
                }
                Err(e) => {
                    warn!("NAT failed to map {}: {}", addr, e);
                }
            }
        }

        if mapped.is_empty() {
            debug!("NAT has no mappable addresses");
        }

        *self.mapped.write().unwrap() = mapped;
    }
}

#[async_trait]
impl Transport for NatMapper {
    async fn read_message(&self) -> NetResult<(Bytes, SocketAddr)> {
        self.inner.read_message().await
    }

    async fn write_message(&self, msg: &[u8], addr: SocketAddr) -> NetResult<()> {
        self.inner.write_message(msg, addr).await
    }

    fn local_addresses(&self) -> Vec<SocketAddr> {
        let mut addrs = self.mapped_addresses();
        addrs.extend(self.inner.local_addresses());
        addrs
    }

    fn decode_addr(&self, data: &[u8]) -> NetResult<SocketAddr> {
        self.inner.decode_addr(data)
    }

    fn encode_addr(&self, addr: SocketAddr) -> NetResult<Vec<u8>> {
        self.inner.encode_addr(addr)
    }

    async fn close(&self) -> NetResult<()> {
        // notify_one parks a permit in case the refresh task is not
        // currently waiting
        self.shutdown.notify_one();

        let mappings: Vec<Mapping> = self.mapped.write().unwrap().drain(..).collect();
        for mapping in mappings {
            let _ = self
                .gateway
                .delete_port_mapping("udp", mapping.internal_port)
                .await;
        }

        self.inner.close().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::NetError;
    use crate::transport::UdpTransport;
    use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};

    struct MockGateway {
        external: IpAddr,
        mappings: AtomicU32,
        broken: AtomicBool,
    }

    impl MockGateway {
        fn new() -> Self {
            Self {
                external: "203.0.113.5".parse().unwrap(),
                mappings: AtomicU32::new(0),
                broken: AtomicBool::new(false),
            }
        }
    }

    #[async_trait]
    impl Gateway for MockGateway {
        async fn external_ip(&self) -> NetResult<IpAddr> {
            if self.broken.load(Ordering::Relaxed) {
                return Err(NetError::Gateway("gateway offline".into()));
            }
            Ok(self.external)
        }

        async fn add_port_mapping(
            &self,
            _proto: &str,
            internal_port: u16,
            _description: &str,
            _lease: Duration,
        ) -> NetResult<u16> {
            self.mappings.fetch_add(1, Ordering::Relaxed);
            Ok(internal_port.wrapping_add(1000))
        }

        async fn delete_port_mapping(&self, _proto: &str, _internal_port: u16) -> NetResult<()> {
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_mapper_advertises_external_addresses() {
        let inner = Arc::new(
            UdpTransport::bind("127.0.0.1:0".parse().unwrap())
                .await
                .unwrap(),
        );
        let port = inner.local_addr().port();
        let gateway = Arc::new(MockGateway::new());

        let mapper = NatMapper::with_interval(inner, gateway.clone(), Duration::from_secs(3600));
        mapper.refresh().await;

        let addrs = mapper.local_addresses();
        let expected: SocketAddr =
            format!("203.0.113.5:{}", port.wrapping_add(1000)).parse().unwrap();
        assert!(addrs.contains(&expected));
        assert_eq!(gateway.mappings.load(Ordering::Relaxed), 1);

        mapper.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_broken_gateway_clears_mappings() {
        let inner = Arc::new(
            UdpTransport::bind("127.0.0.1:0".parse().unwrap())
                .await
                .unwrap(),
        );
        let gateway = Arc::new(MockGateway::new());

        let mapper = NatMapper::with_interval(inner, gateway.clone(), Duration::from_secs(3600));
        mapper.refresh().await;
        assert!(!mapper.mapped_addresses().is_empty());

        gateway.broken.store(true, Ordering::Relaxed);
        mapper.refresh().await;
        assert!(mapper.mapped_addresses().is_empty());

        mapper.close().await.unwrap();
    }
}
