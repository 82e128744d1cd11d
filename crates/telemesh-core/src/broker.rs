//! Peer Introduction
//!
//! Relay-assisted introductions over two protocol channels: an
//! endpoint sends `peer` to a relay it shares with the target, the
//! relay forwards a `connect` to the target carrying the sender's key
//! and observed address, and the target dials back. A single empty
//! "NAT breaker" datagram opens the sender's return path first.

use std::net::SocketAddr;
use std::sync::{Arc, Weak};

use serde::{Deserialize, Serialize};
use tracing::{debug, trace, warn};

use telemesh_crypto::Parts;
use telemesh_net::{LocalAddr, Transport};

use crate::channel::{Channel, HeaderExt};
use crate::endpoint::EndpointShared;
use crate::error::{CoreError, CoreResult};
use crate::hashname::Hashname;
use crate::identity::Identity;

/// Channel type for introduction requests
pub const PEER_TYPE: &str = "peer";

/// Channel type for forwarded introductions
pub const CONNECT_TYPE: &str = "connect";

/// Body of a `connect` packet: one key plus the full fingerprint map
#[derive(Serialize, Deserialize)]
struct PeerKey {
    csid: u8,
    key: Vec<u8>,
    parts: Parts,
}

/// Register the broker listeners and serve loops on an endpoint
pub(crate) fn spawn(shared: &Arc<EndpointShared>) {
    let mut peer_rx = shared.register_listener(PEER_TYPE, 8);
    let mut connect_rx = shared.register_listener(CONNECT_TYPE, 8);

    let weak = Arc::downgrade(shared);
    tokio::spawn(async move {
        while let Some(channel) = peer_rx.recv().await {
            let Some(shared) = weak.upgrade() else { break };
            if let Err(e) = serve_peer(&shared, channel).await {
                debug!("peer request failed: {}", e);
            }
        }
    });

    let weak = Arc::downgrade(shared);
    tokio::spawn(async move {
        while let Some(channel) = connect_rx.recv().await {
            let Some(shared) = weak.upgrade() else { break };
            if let Err(e) = serve_connect(&shared, channel).await {
                debug!("connect request failed: {}", e);
            }
        }
    });
}

/// Ask `via` to introduce us to `peer`
pub(crate) async fn introduce(
    shared: &Arc<EndpointShared>,
    via: &Hashname,
    peer: &Hashname,
) -> CoreResult<()> {
    let relay = shared
        .exchange_to(via)
        .ok_or(CoreError::UnreachableEndpoint(*via))?;

    // open a return path in our NAT toward the peer's last known
    // external address before the relay forwards our own
    if let Some(target) = shared.exchange_to(peer) {
        if let Some(addr) = target.active_path().await {
            trace!("Sending NAT breaker to {}", addr);
            let _ = shared.transport().write_message(&[], addr).await;
        }
    }

    let local = shared
        .transport()
        .local_addresses()
        .first()
        .map(|addr| LocalAddr {
            ip: addr.ip().to_string(),
            port: addr.port(),
        });

    let channel = relay.open(PEER_TYPE, false).await?;
    let ext = HeaderExt {
        end: true,
        peer: Some(peer.to_hex()),
        local,
        ..HeaderExt::default()
    };
    channel.write_packet_ext(ext, &[]).await?;
    channel.close().await
}

/// Relay side: forward a `peer` request as a `connect`
async fn serve_peer(shared: &Arc<EndpointShared>, channel: Channel) -> CoreResult<()> {
    let Some((header, _body)) = channel.read_packet_full().await? else {
        return Ok(());
    };

    let sender = channel.remote_hashname();
    let Some(peer_hex) = header.peer else {
        debug!("peer request from {} without target", sender.short());
        return channel.close().await;
    };
    let target = Hashname::from_hex(&peer_hex)?;

    if target == shared.hashname() || target == sender {
        return channel.close().await;
    }

    // the sender's key travels in the connect body
    let sender_exchange = shared
        .exchange_to(&sender)
        .ok_or(CoreError::UnreachableEndpoint(sender))?;
    let Some(sender_ident) = sender_exchange.remote_identity().await else {
        return channel.close().await;
    };
    let Some((csid, key)) = sender_ident.keys().iter().next_back() else {
        return channel.close().await;
    };

    let Some(target_exchange) = shared.exchange_to(&target) else {
        debug!("peer request for unknown target {}", target.short());
        return channel.close().await;
    };

    let Some(observed) = sender_exchange.active_path().await else {
        return channel.close().await;
    };
    let mut ip = observed.ip().to_string();
    let mut port = observed.port();

    // same-LAN heuristic: when the sender's observed external IP
    // matches the one we already have for the target, both sit behind
    // the same NAT and the advertised LAN address is the better path
    if let (Some(local), Some(target_addr)) = (header.local, target_exchange.active_path().await) {
        if target_addr.ip() == observed.ip() {
            ip = local.ip;
            port = local.port;
        }
    }

    debug!(
        "Introducing {} to {} at {}:{}",
        sender.short(),
        target.short(),
        ip,
        port
    );

    let body = bincode::serialize(&PeerKey {
        csid: *csid,
        key: key.as_bytes().to_vec(),
        parts: sender_ident.parts().clone(),
    })
    .map_err(|_| CoreError::MalformedPacket)?;

    let connect = target_exchange.open(CONNECT_TYPE, false).await?;
    let ext = HeaderExt {
        end: true,
        ip: Some(ip),
        port: Some(port),
        ..HeaderExt::default()
    };
    connect.write_packet_ext(ext, &body).await?;
    let _ = connect.close().await;

    channel.close().await
}

/// Target side: build the introduced identity and dial back
async fn serve_connect(shared: &Arc<EndpointShared>, channel: Channel) -> CoreResult<()> {
    let Some((header, body)) = channel.read_packet_full().await? else {
        return Ok(());
    };

    let peer_key: PeerKey =
        bincode::deserialize(&body).map_err(|_| CoreError::MalformedPacket)?;
    let (Some(ip), Some(port)) = (header.ip, header.port) else {
        return channel.close().await;
    };
    let addr: SocketAddr = format!("{}:{}", ip, port)
        .parse()
        .map_err(|_| CoreError::MalformedPacket)?;

    let key = telemesh_crypto::PublicKey::try_from_slice(&peer_key.key)?;
    let ident = Identity::from_key_and_parts(peer_key.csid, key, peer_key.parts, vec![addr])?;

    if ident.hashname() == shared.hashname() {
        return channel.close().await;
    }

    debug!(
        "Connect request: dialing {} at {}",
        ident.hashname().short(),
        addr
    );

    // dial in the background; the introduction channel is done
    let weak: Weak<EndpointShared> = Arc::downgrade(shared);
    tokio::spawn(async move {
        let Some(shared) = weak.upgrade() else { return };
        if let Err(e) = shared.dial_identity(&ident).await {
            warn!("Dial after connect to {} failed: {}", ident.hashname().short(), e);
        }
    });

    channel.close().await
}
