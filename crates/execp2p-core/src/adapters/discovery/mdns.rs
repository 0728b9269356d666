//! mDNS service advertisement and lookup.
//!
//! The service type embeds the room's discovery hash:
//! `_execp2p_{hash}._tcp.local.` — listeners register it with their listen
//! port, joiners browse and resolve it.

use std::collections::HashMap;
use std::time::Duration;

use mdns_sd::{ServiceDaemon, ServiceEvent, ServiceInfo};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::domain::room::discovery_hash;

fn service_type(room_id: &str) -> String {
    format!("_execp2p_{}._tcp.local.", discovery_hash(room_id))
}

/// Listener side: advertise the room service until cancelled.
pub async fn advertise(room_id: String, listen_port: u16, cancel: CancellationToken) {
    let daemon = match ServiceDaemon::new() {
        Ok(d) => d,
        Err(e) => {
            warn!("mDNS daemon failed to start: {e}");
            return;
        }
    };

    let ty = service_type(&room_id);
    let instance = format!("execp2p-{listen_port}");
    let hostname = format!("{instance}.local.");
    let mut properties = HashMap::new();
    properties.insert("room".to_string(), discovery_hash(&room_id));

    let service = match ServiceInfo::new(&ty, &instance, &hostname, "", listen_port, properties) {
        Ok(info) => info.enable_addr_auto(),
        Err(e) => {
            warn!("mDNS service info invalid: {e}");
            return;
        }
    };

    if let Err(e) = daemon.register(service) {
        warn!("mDNS register failed: {e}");
        return;
    }
    info!(service = %ty, port = listen_port, "advertising room over mDNS");

    cancel.cancelled().await;
    let _ = daemon.shutdown();
}

/// Joiner side: browse for the room service; first resolved IPv4 address
/// wins.
pub async fn lookup(room_id: &str, timeout: Duration) -> Option<String> {
    let daemon = match ServiceDaemon::new() {
        Ok(d) => d,
        Err(e) => {
            warn!("mDNS daemon failed to start: {e}");
            return None;
        }
    };
    let ty = service_type(room_id);
    let receiver = match daemon.browse(&ty) {
        Ok(r) => r,
        Err(e) => {
            warn!("mDNS browse failed: {e}");
            return None;
        }
    };
    debug!(service = %ty, "browsing for room over mDNS");

    let deadline = tokio::time::Instant::now() + timeout;
    let result = loop {
        let remaining = deadline.saturating_duration_since(tokio::time::Instant::now());
        if remaining.is_zero() {
            break None;
        }
        let event = match tokio::time::timeout(remaining, receiver.recv_async()).await {
            Ok(Ok(event)) => event,
            _ => break None,
        };
        if let ServiceEvent::ServiceResolved(service) = event {
            let port = service.get_port();
            if let Some(ip) = service
                .get_addresses()
                .iter()
                .find(|addr| addr.is_ipv4())
            {
                let addr = format!("{ip}:{port}");
                info!(%addr, "room found via mDNS");
                break Some(addr);
            }
        }
    };
    let _ = daemon.shutdown();
    result
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn service_type_embeds_discovery_hash() {
        let ty = service_type("ExecP2P_some_room_identifier_xx");
        assert!(ty.starts_with("_execp2p_"));
        assert!(ty.ends_with("._tcp.local."));
        // 8 bytes of hash, hex encoded
        let hash = &ty["_execp2p_".len()..ty.len() - "._tcp.local.".len()];
        assert_eq!(hash.len(), 16);
    }
}
