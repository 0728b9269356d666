//! LAN discovery over UDP broadcast.
//!
//! Joiners beacon `{room_id, port}` to every interface's broadcast address
//! on port 19847; the listener replies with its listen port and the joiner
//! derives `host` from the reply's source.

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::time::Duration;

use tokio::net::UdpSocket;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::domain::error::Result;
use crate::domain::wire::{BroadcastBeacon, BroadcastReply};

/// Well-known discovery port.
pub const BROADCAST_PORT: u16 = 19847;

/// Beacon cadence while probing.
const BEACON_INTERVAL: Duration = Duration::from_secs(2);

/// Read deadline, doubling as the cancellation check interval.
const READ_DEADLINE: Duration = Duration::from_secs(1);

/// Fallback targets when no interface could be enumerated.
const FALLBACK_BROADCASTS: [Ipv4Addr; 4] = [
    Ipv4Addr::new(192, 168, 255, 255),
    Ipv4Addr::new(10, 255, 255, 255),
    Ipv4Addr::new(172, 31, 255, 255),
    Ipv4Addr::new(255, 255, 255, 255),
];

/// Compute `ip | !mask` for every up, non-loopback IPv4 interface; fall
/// back to the standard private-range broadcasts when none enumerate.
pub fn broadcast_addresses() -> Vec<SocketAddr> {
    let mut addrs: Vec<SocketAddr> = Vec::new();

    if let Ok(interfaces) = if_addrs::get_if_addrs() {
        for interface in interfaces {
            if interface.is_loopback() {
                continue;
            }
            if let if_addrs::IfAddr::V4(v4) = interface.addr {
                let ip = u32::from(v4.ip);
                let mask = u32::from(v4.netmask);
                let broadcast = Ipv4Addr::from(ip | !mask);
                let addr = SocketAddr::new(IpAddr::V4(broadcast), BROADCAST_PORT);
                if !addrs.contains(&addr) {
                    addrs.push(addr);
                }
            }
        }
    }

    if addrs.is_empty() {
        addrs.extend(
            FALLBACK_BROADCASTS
                .iter()
                .map(|ip| SocketAddr::new(IpAddr::V4(*ip), BROADCAST_PORT)),
        );
    }
    addrs
}

/// Joiner side: beacon until a listener for `room_id` replies or the
/// timeout elapses. Returns the listener's `host:port`.
pub async fn probe(room_id: &str, local_port: u16, timeout: Duration) -> Option<String> {
    let socket = match UdpSocket::bind(("0.0.0.0", 0)).await {
        Ok(s) => s,
        Err(e) => {
            warn!("broadcast probe bind failed: {e}");
            return None;
        }
    };
    if let Err(e) = socket.set_broadcast(true) {
        warn!("SO_BROADCAST failed: {e}");
        return None;
    }

    let beacon = BroadcastBeacon {
        room_id: room_id.to_string(),
        port: local_port,
    };
    let beacon_bytes = serde_json::to_vec(&beacon).ok()?;
    let targets = broadcast_addresses();
    debug!(targets = targets.len(), "broadcast probe started");

    let deadline = tokio::time::Instant::now() + timeout;
    let mut next_beacon = tokio::time::Instant::now();
    let mut buf = [0u8; 1024];

    while tokio::time::Instant::now() < deadline {
        if tokio::time::Instant::now() >= next_beacon {
            for target in &targets {
                if let Err(e) = socket.send_to(&beacon_bytes, target).await {
                    debug!(%target, "beacon send failed: {e}");
                }
            }
            next_beacon = tokio::time::Instant::now() + BEACON_INTERVAL;
        }

        let received = tokio::time::timeout(READ_DEADLINE, socket.recv_from(&mut buf)).await;
        let (len, src) = match received {
            Ok(Ok(r)) => r,
            _ => continue,
        };
        let reply: BroadcastReply = match serde_json::from_slice(&buf[..len]) {
            Ok(r) => r,
            Err(_) => continue,
        };
        if reply.room_id != room_id {
            continue;
        }
        let host = if reply.host.is_empty() {
            src.ip().to_string()
        } else {
            reply.host.clone()
        };
        let addr = format!("{host}:{}", reply.port);
        info!(%addr, "room found via UDP broadcast");
        return Some(addr);
    }
    None
}

/// Listener side: answer matching beacons with our listen port until
/// cancelled.
pub async fn responder(room_id: String, listen_port: u16, cancel: CancellationToken) -> Result<()> {
    let socket = UdpSocket::bind(("0.0.0.0", BROADCAST_PORT)).await?;
    socket.set_broadcast(true)?;
    info!(port = BROADCAST_PORT, "broadcast responder running");

    let mut buf = [0u8; 1024];
    loop {
        if cancel.is_cancelled() {
            return Ok(());
        }
        let received = tokio::time::timeout(READ_DEADLINE, socket.recv_from(&mut buf)).await;
        let (len, src) = match received {
            Ok(Ok(r)) => r,
            _ => continue,
        };
        let beacon: BroadcastBeacon = match serde_json::from_slice(&buf[..len]) {
            Ok(b) => b,
            Err(_) => continue,
        };
        if beacon.room_id != room_id {
            continue;
        }
        debug!(%src, "discovery beacon received");
        let reply = BroadcastReply {
            room_id: room_id.clone(),
            host: String::new(),
            port: listen_port,
        };
        if let Ok(bytes) = serde_json::to_vec(&reply) {
            let _ = socket.send_to(&bytes, src).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn broadcast_addresses_never_empty() {
        let addrs = broadcast_addresses();
        assert!(!addrs.is_empty());
        assert!(addrs.iter().all(|a| a.port() == BROADCAST_PORT));
    }

    #[tokio::test]
    async fn responder_answers_matching_beacon() {
        let cancel = CancellationToken::new();
        let room_id = "ExecP2P_broadcast_test_room_0001".to_string();
        let handle = tokio::spawn(responder(room_id.clone(), 9123, cancel.clone()));

        // Poke the responder directly over loopback instead of broadcasting.
        tokio::time::sleep(Duration::from_millis(100)).await;
        let socket = UdpSocket::bind(("127.0.0.1", 0)).await.unwrap();
        let beacon = BroadcastBeacon {
            room_id: room_id.clone(),
            port: 9000,
        };
        socket
            .send_to(
                &serde_json::to_vec(&beacon).unwrap(),
                ("127.0.0.1", BROADCAST_PORT),
            )
            .await
            .unwrap();

        let mut buf = [0u8; 1024];
        let (len, _) = tokio::time::timeout(Duration::from_secs(3), socket.recv_from(&mut buf))
            .await
            .expect("no reply from responder")
            .unwrap();
        let reply: BroadcastReply = serde_json::from_slice(&buf[..len]).unwrap();
        assert_eq!(reply.room_id, room_id);
        assert_eq!(reply.port, 9123);

        cancel.cancel();
        let _ = handle.await;
    }
}
