//! BitTorrent mainline-DHT announce and lookup.
//!
//! The room's info hash (first 20 bytes of SHA-256(room_id)) doubles as the
//! DHT key; listeners announce their listen port under it, joiners query
//! `get_peers`. The DHT client is synchronous, so calls run on the blocking
//! pool.

use std::time::Duration;

use mainline::{Dht, Id};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::domain::room::info_hash;

/// Re-announce cadence; mainline entries age out after ~15 minutes.
const ANNOUNCE_INTERVAL: Duration = Duration::from_secs(5 * 60);

/// Start a DHT node on `base_port + rand(0..10)` so several instances can
/// coexist on one host.
pub fn start_node(base_port: u16) -> Option<Dht> {
    let port = base_port + (rand::random::<u16>() % 10);
    match Dht::builder().port(port).build() {
        Ok(dht) => {
            debug!(port, "DHT node started");
            Some(dht)
        }
        Err(e) => {
            warn!(port, "DHT node startup failed: {e}");
            None
        }
    }
}

fn room_info_hash(room_id: &str) -> Option<Id> {
    let hex_hash = info_hash(room_id);
    let bytes = hex::decode(&hex_hash).ok()?;
    let array: [u8; 20] = bytes.try_into().ok()?;
    Some(Id::from(array))
}

/// Listener side: periodically announce our listen port under the room's
/// info hash until cancelled.
pub async fn announce(dht: Dht, room_id: String, listen_port: u16, cancel: CancellationToken) {
    let Some(target) = room_info_hash(&room_id) else {
        return;
    };
    loop {
        let dht_clone = dht.clone();
        let announced = tokio::task::spawn_blocking(move || {
            dht_clone.announce_peer(target, Some(listen_port))
        })
        .await;
        match announced {
            Ok(Ok(_)) => info!(port = listen_port, "room announced on DHT"),
            Ok(Err(e)) => warn!("DHT announce failed: {e}"),
            Err(e) => warn!("DHT announce task failed: {e}"),
        }

        tokio::select! {
            _ = cancel.cancelled() => return,
            _ = tokio::time::sleep(ANNOUNCE_INTERVAL) => {}
        }
    }
}

/// Joiner side: query the DHT for peers under the room's info hash.
pub async fn lookup(dht: Dht, room_id: &str, timeout: Duration) -> Option<String> {
    let target = room_info_hash(room_id)?;
    let query = tokio::task::spawn_blocking(move || {
        dht.get_peers(target)
            .flatten()
            .next()
            .map(|peer| peer.to_string())
    });
    match tokio::time::timeout(timeout, query).await {
        Ok(Ok(Some(addr))) => {
            info!(%addr, "room found via DHT");
            Some(addr)
        }
        Ok(Ok(None)) => None,
        Ok(Err(e)) => {
            warn!("DHT lookup task failed: {e}");
            None
        }
        Err(_) => {
            debug!("DHT lookup timed out");
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn info_hash_maps_to_dht_id() {
        let id = room_info_hash("ExecP2P_room_for_dht_id_mapping1").unwrap();
        // Id round-trips the first 20 bytes of the SHA-256.
        assert_eq!(
            hex::encode(id.as_bytes()),
            info_hash("ExecP2P_room_for_dht_id_mapping1")
        );
    }
}
