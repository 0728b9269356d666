//! Multi-strategy peer discovery.
//!
//! Joiners run strategies in order — LAN auto-discovery (mDNS ∥ UDP
//! broadcast ∥ DHT), localhost sweep, then signalling + hole punching —
//! and stop at the first address that works. Listeners fan the same
//! primitives out in reverse as advertisers.

use std::time::Duration;

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::domain::error::{Error, Result};
use crate::domain::room::Room;

pub mod broadcast;
pub mod dht;
pub mod holepunch;
pub mod mdns;
pub mod signaling;
pub mod stun;

pub use signaling::SignalingConfig;

/// Deadline for the concurrent LAN probes (S1).
pub const LOCAL_DISCOVERY_TIMEOUT: Duration = Duration::from_secs(15);

/// Localhost ports swept for co-resident instances (S2).
pub const LOCALHOST_SWEEP_PORTS: std::ops::RangeInclusive<u16> = 9000..=9009;

/// Tunables threaded in from the application config.
#[derive(Debug, Clone)]
pub struct DiscoveryOptions {
    pub bt_dht_port: u16,
    pub signaling: SignalingConfig,
}

/// S1 — race mDNS, UDP broadcast, and DHT lookups; first answer wins.
pub async fn local_network_discovery(
    options: &DiscoveryOptions,
    room_id: &str,
    local_port: u16,
) -> Result<String> {
    let (tx, mut rx) = mpsc::channel::<String>(3);

    let mdns_tx = tx.clone();
    let mdns_room = room_id.to_string();
    tokio::spawn(async move {
        if let Some(addr) = mdns::lookup(&mdns_room, LOCAL_DISCOVERY_TIMEOUT).await {
            let _ = mdns_tx.try_send(addr);
        }
    });

    let broadcast_tx = tx.clone();
    let broadcast_room = room_id.to_string();
    tokio::spawn(async move {
        if let Some(addr) =
            broadcast::probe(&broadcast_room, local_port, LOCAL_DISCOVERY_TIMEOUT).await
        {
            let _ = broadcast_tx.try_send(addr);
        }
    });

    if let Some(node) = dht::start_node(options.bt_dht_port) {
        let dht_tx = tx.clone();
        let dht_room = room_id.to_string();
        tokio::spawn(async move {
            if let Some(addr) = dht::lookup(node, &dht_room, LOCAL_DISCOVERY_TIMEOUT).await {
                let _ = dht_tx.try_send(addr);
            }
        });
    }
    drop(tx);

    match tokio::time::timeout(LOCAL_DISCOVERY_TIMEOUT, rx.recv()).await {
        Ok(Some(addr)) => {
            info!(%addr, "local network discovery succeeded");
            Ok(addr)
        }
        _ => Err(Error::DiscoveryExhausted),
    }
}

/// S3 — query the signalling server and hole-punch each returned address
/// in order. Returns the punched peer address.
pub async fn signaling_and_holepunch(
    options: &DiscoveryOptions,
    room_id: &str,
    local_port: u16,
) -> Result<String> {
    let room_info = signaling::fetch_room_info(&options.signaling, room_id).await?;
    if room_info.public_addrs.is_empty() {
        return Err(Error::RoomNotFound(room_id.to_string()));
    }
    debug!(addrs = room_info.public_addrs.len(), "signalling returned candidates");

    let mut last_err = Error::DiscoveryExhausted;
    for addr in &room_info.public_addrs {
        match holepunch::initiate(addr, room_id, local_port).await {
            Ok(punched) => return Ok(punched),
            Err(e) => {
                debug!(%addr, "hole punching failed: {e}");
                last_err = e;
            }
        }
    }
    Err(last_err)
}

/// Listener side: fan out every advertiser for the room. Tasks stop when
/// `cancel` fires.
pub fn advertise_room(
    options: &DiscoveryOptions,
    room: &Room,
    listen_port: u16,
    cancel: &CancellationToken,
) {
    let room_id = room.id.clone();

    tokio::spawn(mdns::advertise(
        room_id.clone(),
        listen_port,
        cancel.child_token(),
    ));
    let responder_room = room_id.clone();
    let responder_cancel = cancel.child_token();
    tokio::spawn(async move {
        if let Err(e) = broadcast::responder(responder_room, listen_port, responder_cancel).await
        {
            tracing::warn!("broadcast responder stopped: {e}");
        }
    });
    if let Some(node) = dht::start_node(options.bt_dht_port) {
        tokio::spawn(dht::announce(
            node,
            room_id.clone(),
            listen_port,
            cancel.child_token(),
        ));
    }
    if options.signaling.enabled() {
        let signaling_config = options.signaling.clone();
        let punch_room = room_id.clone();
        tokio::spawn(async move {
            signaling::announce_external_address(&signaling_config, &punch_room, listen_port)
                .await;
        });
        tokio::spawn(holepunch::responder(
            room_id,
            listen_port,
            cancel.child_token(),
        ));
    }
}
