//! Session orchestrator: room lifecycle, discovery ladder, component
//! wiring, status surface.
//!
//! Owns the identity, the current room, and the transport handle. Front
//! ends drive it through a narrow command surface and observe it through
//! the event bus — never by reaching into transport internals.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::{Mutex, RwLock};
use rand::seq::SliceRandom;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::adapters::crypto::SessionCrypto;
use crate::adapters::discovery::{
    self, DiscoveryOptions, SignalingConfig, LOCALHOST_SWEEP_PORTS,
};
use crate::adapters::quic::{ConnectionState, QuicTransport};
use crate::config::Config;
use crate::domain::error::{Error, Result};
use crate::domain::room::{validate_room_id, Room};

use super::events::{AppEvent, EventBus};
use super::status::{EncryptionAlgorithms, NetworkStatus, RoomSummary, SecuritySummary};

/// Handshake deadline when dialing a known address.
const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(4);

/// Handshake deadline per localhost-sweep candidate.
const SWEEP_HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(2);

/// Cadence of the pending-outbound retry loop.
const PENDING_RETRY_INTERVAL: Duration = Duration::from_secs(2);

/// Cadence of status snapshots on the bus.
const STATUS_INTERVAL: Duration = Duration::from_secs(2);

/// Cadence of key-rotation and fingerprint checks.
const SECURITY_TICK: Duration = Duration::from_secs(60);

/// Result of `create_room`, shown to the user for sharing.
#[derive(Debug, Clone)]
pub struct CreateRoomResult {
    pub room_id: String,
    pub access_key: String,
    pub listen_port: u16,
}

// ---------------------------------------------------------------------------
// Session
// ---------------------------------------------------------------------------

pub struct Session {
    config: Config,
    crypto: Arc<SessionCrypto>,
    listen_port: u16,
    room: RwLock<Option<Room>>,
    transport: RwLock<Option<Arc<QuicTransport>>>,
    events: EventBus,
    cancel: CancellationToken,
    is_running: AtomicBool,
    pending: Mutex<VecDeque<String>>,
}

impl Session {
    /// Allocate a listen port and set up the identity. No sockets are held
    /// open until a room is created or joined.
    pub fn new(config: Config) -> Result<Arc<Self>> {
        let listen_port = allocate_port(config.network.min_port, config.network.max_port)?;
        info!(listen_port, "session initialized");
        Ok(Arc::new(Self {
            config,
            crypto: Arc::new(SessionCrypto::new()),
            listen_port,
            room: RwLock::new(None),
            transport: RwLock::new(None),
            events: EventBus::new(),
            cancel: CancellationToken::new(),
            is_running: AtomicBool::new(false),
            pending: Mutex::new(VecDeque::new()),
        }))
    }

    pub fn events(&self) -> EventBus {
        self.events.clone()
    }

    pub fn listen_port(&self) -> u16 {
        self.listen_port
    }

    pub fn peer_id(&self) -> String {
        self.crypto.local_peer_id()
    }

    fn discovery_options(&self) -> DiscoveryOptions {
        DiscoveryOptions {
            bt_dht_port: self.config.discovery.bt_dht_port,
            signaling: SignalingConfig::new(self.config.discovery.signaling_server.clone()),
        }
    }

    // -- Room lifecycle --

    /// Create a private room, start listening, and fan out advertisers.
    pub async fn create_room(self: &Arc<Self>) -> Result<CreateRoomResult> {
        let mut room = Room::new(
            "ExecP2P Chat",
            "Post-quantum encrypted chat room",
            self.config.network.max_peers,
            true,
        );
        room.listen_port = Some(self.listen_port);
        let access_key = room.access_key.clone().unwrap_or_default();
        info!(room = %room.short_id(), port = self.listen_port, "creating room");

        let transport = QuicTransport::new(
            Arc::clone(&self.crypto),
            &room.id,
            self.listen_port,
            true,
            None,
            &self.cancel,
        )?;
        transport.set_room_access_key(&access_key);
        transport.start().await?;

        discovery::advertise_room(
            &self.discovery_options(),
            &room,
            self.listen_port,
            &self.cancel,
        );

        let result = CreateRoomResult {
            room_id: room.id.clone(),
            access_key,
            listen_port: self.listen_port,
        };
        *self.room.write() = Some(room);
        self.install_transport(transport);
        Ok(result)
    }

    /// Join a room: direct dial when an address is given, otherwise the
    /// discovery ladder (LAN → localhost sweep → signalling + punching).
    pub async fn join_room(
        self: &Arc<Self>,
        room_id: &str,
        remote_addr: Option<&str>,
        access_key: &str,
    ) -> Result<()> {
        if !validate_room_id(room_id) {
            return Err(Error::InvalidRoomId);
        }
        if access_key.is_empty() {
            return Err(Error::AccessKeyMismatch);
        }
        *self.room.write() = Some(Room::for_join(
            room_id,
            self.config.network.max_peers,
            access_key,
        ));

        if let Some(addr) = remote_addr {
            info!(%addr, room = %room_id, "joining via direct address");
            let result = self.connect_to(addr, access_key, HANDSHAKE_TIMEOUT).await;
            if result.is_err() {
                *self.room.write() = None;
            }
            return result;
        }

        let options = self.discovery_options();

        // S1 — LAN auto-discovery.
        if let Ok(addr) =
            discovery::local_network_discovery(&options, room_id, self.listen_port).await
        {
            match self.connect_to(&addr, access_key, HANDSHAKE_TIMEOUT).await {
                Ok(()) => return Ok(()),
                Err(e) => warn!(%addr, "LAN candidate failed: {e}"),
            }
        }

        // S2 — co-resident instances on localhost.
        for port in LOCALHOST_SWEEP_PORTS {
            let addr = format!("127.0.0.1:{port}");
            debug!(%addr, "trying localhost candidate");
            if self
                .connect_to(&addr, access_key, SWEEP_HANDSHAKE_TIMEOUT)
                .await
                .is_ok()
            {
                info!(%addr, "connected to co-resident instance");
                return Ok(());
            }
        }

        // S3 — signalling rendezvous + hole punching.
        if options.signaling.enabled() {
            match discovery::signaling_and_holepunch(&options, room_id, self.listen_port).await {
                Ok(addr) => {
                    info!(%addr, "connected via hole punching");
                    return self.connect_to(&addr, access_key, HANDSHAKE_TIMEOUT).await;
                }
                Err(e) => warn!("signalling strategy failed: {e}"),
            }
        }

        *self.room.write() = None;
        Err(Error::DiscoveryExhausted)
    }

    async fn connect_to(
        self: &Arc<Self>,
        addr: &str,
        access_key: &str,
        handshake_timeout: Duration,
    ) -> Result<()> {
        let room_id = self
            .room
            .read()
            .as_ref()
            .map(|r| r.id.clone())
            .ok_or(Error::NotConnected)?;

        let transport = QuicTransport::new(
            Arc::clone(&self.crypto),
            &room_id,
            self.listen_port,
            false,
            Some(addr.to_string()),
            &self.cancel,
        )?;
        transport.set_room_access_key(access_key);
        transport.start().await?;

        // The responder stays silent on a rejected announcement, so a
        // dial that succeeds at the QUIC layer but never completes the key
        // exchange means our credentials were refused.
        if !transport
            .wait_for_state(ConnectionState::Verified, handshake_timeout)
            .await
        {
            transport.stop().await;
            return Err(Error::AccessKeyMismatch);
        }

        // A joiner with a placeholder room ID adopts the responder's.
        let adopted = transport.room_id();
        if let Some(room) = self.room.write().as_mut() {
            room.id = adopted;
        }

        self.install_transport(transport);
        Ok(())
    }

    fn install_transport(self: &Arc<Self>, transport: Arc<QuicTransport>) {
        self.is_running.store(true, Ordering::SeqCst);
        *self.transport.write() = Some(Arc::clone(&transport));
        self.spawn_pumps(transport);
    }

    /// Replace the room access key. Only the room's creator may do this;
    /// already-verified peers stay connected, future joins need the new key.
    pub fn regenerate_access_key(&self) -> Result<String> {
        let transport = self.transport.read().clone();
        match transport {
            Some(t) if t.is_listener() => {}
            _ => {
                return Err(Error::KeyRotationFailed(
                    "only the room creator can regenerate the access key".into(),
                ))
            }
        }
        let mut room_guard = self.room.write();
        let room = room_guard.as_mut().ok_or(Error::NotConnected)?;
        let new_key = room.regenerate_access_key()?.to_string();
        if let Some(t) = self.transport.read().as_ref() {
            t.set_room_access_key(&new_key);
        }
        Ok(new_key)
    }

    /// Shut the session down: tell the peer, stop the transport, cancel
    /// every background task.
    pub async fn close(&self) {
        if !self.is_running.swap(false, Ordering::SeqCst) {
            return;
        }
        let transport = self.transport.write().take();
        if let Some(transport) = transport {
            // Best effort; the peer may already be gone.
            let _ = transport
                .send_message(r#"{"type":"user_left"}"#)
                .await;
            transport.stop().await;
        }
        self.cancel.cancel();
        self.events.publish(AppEvent::RoomLeft);
        info!("session closed");
    }

    // -- Messaging --

    /// Send a chat message. While the transport is still coming up the text
    /// is buffered and retried every two seconds.
    pub async fn send_message(&self, message: &str) -> Result<()> {
        let transport = self.transport.read().clone();
        let Some(transport) = transport else {
            return Err(Error::NotConnected);
        };
        match transport.send_message(message).await {
            Ok(()) => Ok(()),
            Err(Error::NotConnected) => {
                debug!("transport not ready; buffering outbound message");
                self.pending.lock().push_back(message.to_string());
                Err(Error::NotConnected)
            }
            Err(e) => Err(e),
        }
    }

    // -- Status surface --

    pub fn network_status(&self) -> NetworkStatus {
        let transport = self.transport.read().clone();
        let is_listener = transport.as_ref().map(|t| t.is_listener()).unwrap_or(false);
        let connected_peers = transport
            .as_ref()
            .map(|t| t.connected_peers().len())
            .unwrap_or(0);
        let verified_peers = self.crypto.verified_peers().len();
        NetworkStatus {
            peer_id: self.crypto.local_peer_id(),
            listen_port: self.listen_port,
            room_id: self
                .room
                .read()
                .as_ref()
                .map(|r| r.id.clone())
                .unwrap_or_default(),
            connected_peers,
            verified_peers,
            // The creator's room is end-to-end ready even while empty.
            e2e_encryption: verified_peers > 0 || is_listener,
            is_running: self.is_running.load(Ordering::SeqCst),
            is_listener,
        }
    }

    pub fn security_summary(&self) -> SecuritySummary {
        let transport = self.transport.read().clone();
        let is_listener = transport.map(|t| t.is_listener()).unwrap_or(false);
        let room_info = if is_listener {
            self.room.read().as_ref().map(|room| RoomSummary {
                room_id: room.id.clone(),
                access_key: room.access_key.clone(),
                is_private: room.is_private,
            })
        } else {
            None
        };
        SecuritySummary {
            encryption_algorithms: EncryptionAlgorithms::default(),
            identity_fingerprint: self.crypto.identity_fingerprint(),
            peer_fingerprints: self.peer_fingerprints(),
            room_info,
        }
    }

    fn peer_fingerprints(&self) -> HashMap<String, String> {
        self.crypto
            .verified_peers()
            .into_iter()
            .filter_map(|peer_id| {
                self.crypto
                    .peer_fingerprint(&peer_id)
                    .ok()
                    .map(|fp| (peer_id, fp))
            })
            .collect()
    }

    // -- Background pumps --

    fn spawn_pumps(self: &Arc<Self>, transport: Arc<QuicTransport>) {
        // Incoming chat -> event bus.
        if let Some(mut incoming) = transport.take_incoming() {
            let events = self.events.clone();
            let cancel = self.cancel.clone();
            tokio::spawn(async move {
                loop {
                    tokio::select! {
                        _ = cancel.cancelled() => return,
                        payload = incoming.recv() => match payload {
                            Some(p) => events.publish(AppEvent::MessageReceived(p)),
                            None => return,
                        },
                    }
                }
            });
        }

        // Async transport errors -> event bus.
        if let Some(mut errors) = transport.take_errors() {
            let events = self.events.clone();
            let cancel = self.cancel.clone();
            tokio::spawn(async move {
                loop {
                    tokio::select! {
                        _ = cancel.cancelled() => return,
                        error = errors.recv() => match error {
                            Some(e) => {
                                warn!("network error: {e}");
                                if e.is_frame_level() {
                                    events.publish(AppEvent::SecurityMessage(e.to_string()));
                                } else {
                                    events.publish(AppEvent::NetworkError(e.to_string()));
                                }
                            }
                            None => return,
                        },
                    }
                }
            });
        }

        // Status snapshots.
        {
            let session = Arc::clone(self);
            tokio::spawn(async move {
                let mut tick = tokio::time::interval(STATUS_INTERVAL);
                loop {
                    tokio::select! {
                        _ = session.cancel.cancelled() => return,
                        _ = tick.tick() => {
                            session
                                .events
                                .publish(AppEvent::StatusUpdate(session.network_status()));
                        }
                    }
                }
            });
        }

        // Key rotation + fingerprint change detection.
        {
            let session = Arc::clone(self);
            let transport = Arc::clone(&transport);
            tokio::spawn(async move {
                let mut tick = tokio::time::interval(SECURITY_TICK);
                tick.tick().await; // skip the immediate first tick
                let mut last_fingerprints = HashMap::new();
                loop {
                    tokio::select! {
                        _ = session.cancel.cancelled() => return,
                        _ = tick.tick() => {
                            match transport.force_key_rotation().await {
                                Ok(true) => session.events.publish(AppEvent::SecurityMessage(
                                    "Forward secrecy: session keys rotated".into(),
                                )),
                                Ok(false) => {}
                                Err(e) => warn!("key rotation error: {e}"),
                            }

                            let fingerprints = session.peer_fingerprints();
                            if !fingerprints.is_empty() && fingerprints != last_fingerprints {
                                last_fingerprints = fingerprints.clone();
                                session
                                    .events
                                    .publish(AppEvent::PeerFingerprints(fingerprints));
                            }
                        }
                    }
                }
            });
        }

        // Pending outbound retry.
        {
            let session = Arc::clone(self);
            let transport = Arc::clone(&transport);
            tokio::spawn(async move {
                let mut tick = tokio::time::interval(PENDING_RETRY_INTERVAL);
                loop {
                    tokio::select! {
                        _ = session.cancel.cancelled() => return,
                        _ = tick.tick() => {
                            loop {
                                let Some(message) = session.pending.lock().pop_front() else {
                                    break;
                                };
                                if let Err(e) = transport.send_message(&message).await {
                                    debug!("pending retry failed: {e}");
                                    session.pending.lock().push_front(message);
                                    break;
                                }
                            }
                        }
                    }
                }
            });
        }
    }
}

// ---------------------------------------------------------------------------
// Port allocation
// ---------------------------------------------------------------------------

/// Pick a random free port from the range: shuffle, then take the first
/// port where both UDP and TCP bind succeed.
fn allocate_port(min_port: u16, max_port: u16) -> Result<u16> {
    let mut ports: Vec<u16> = (min_port..=max_port).collect();
    ports.shuffle(&mut rand::thread_rng());
    for port in ports {
        if port_available(port) {
            return Ok(port);
        }
    }
    Err(Error::NoPortAvailable {
        min: min_port,
        max: max_port,
    })
}

fn port_available(port: u16) -> bool {
    let udp = std::net::UdpSocket::bind(("0.0.0.0", port));
    let tcp = std::net::TcpListener::bind(("0.0.0.0", port));
    udp.is_ok() && tcp.is_ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn allocated_port_is_in_range() {
        let port = allocate_port(9000, 9009).unwrap();
        assert!((9000..=9009).contains(&port));
    }

    #[test]
    fn exhausted_range_reports_no_port() {
        // Occupy a single-port range, then ask for it.
        let udp = std::net::UdpSocket::bind(("0.0.0.0", 0)).unwrap();
        let port = udp.local_addr().unwrap().port();
        assert!(matches!(
            allocate_port(port, port),
            Err(Error::NoPortAvailable { .. })
        ));
    }

    #[tokio::test]
    async fn join_rejects_malformed_room_id() {
        let session = Session::new(Config::default()).unwrap();
        assert!(matches!(
            session.join_room("not-a-room", None, "key").await,
            Err(Error::InvalidRoomId)
        ));
    }

    #[tokio::test]
    async fn join_requires_access_key() {
        let session = Session::new(Config::default()).unwrap();
        let room_id = crate::domain::room::generate_room_id();
        assert!(matches!(
            session.join_room(&room_id, None, "").await,
            Err(Error::AccessKeyMismatch)
        ));
    }

    #[tokio::test]
    async fn send_without_room_is_not_connected() {
        let session = Session::new(Config::default()).unwrap();
        assert!(matches!(
            session.send_message("hi").await,
            Err(Error::NotConnected)
        ));
    }

    #[tokio::test]
    async fn status_reflects_idle_session() {
        let session = Session::new(Config::default()).unwrap();
        let status = session.network_status();
        assert!(!status.is_running);
        assert!(!status.e2e_encryption);
        assert_eq!(status.connected_peers, 0);
        assert!(status.room_id.is_empty());
    }

    #[test]
    fn security_summary_names_the_suite() {
        let session = Session::new(Config::default()).unwrap();
        let summary = session.security_summary();
        assert_eq!(summary.encryption_algorithms.key_exchange, "CRYSTALS-Kyber-1024");
        assert!(summary.identity_fingerprint.contains(':'));
        assert!(summary.room_info.is_none());
    }
}
