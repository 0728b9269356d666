//! Quinn-based transport: one QUIC connection, one JSON frame per
//! unidirectional stream.
//!
//! A listener accepts exactly one connection for the lifetime of the
//! transport; a dialer makes exactly one. Both sides send a signed
//! announcement immediately after the session opens, then drive the key
//! exchange. Stream handlers run concurrently and a failure in one never
//! takes down the accept loop.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::{Mutex, RwLock};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::adapters::crypto::SessionCrypto;
use crate::domain::error::{Error, Result};
use crate::domain::room::unix_now;
use crate::domain::wire::{
    from_cbor, to_cbor, EncryptedMessage, Envelope, FrameType, KeyExchange, MessagePayload,
    PeerAnnouncement, MAX_FRAME_BYTES,
};

use super::tls::{remote_cert_fingerprint, TlsIdentity};

/// Capacity of the incoming-message channel; overflow drops the newest.
const INCOMING_CHANNEL_CAPACITY: usize = 100;

/// Capacity of the async error channel.
const ERROR_CHANNEL_CAPACITY: usize = 10;

/// Grace period before the QUIC close fires, letting in-flight streams
/// finish.
const STOP_DRAIN: Duration = Duration::from_millis(100);

/// Mismatch errors on a listener are delayed so the remote can still read
/// any in-flight acknowledgement before teardown.
const MISMATCH_ERROR_DELAY: Duration = Duration::from_millis(500);

// ---------------------------------------------------------------------------
// Connection state machine
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum ConnectionState {
    Idle,
    Connecting,
    /// First announcement sent and received.
    Announced,
    /// Key exchange processed in the required directions.
    Verified,
    Closed,
}

// ---------------------------------------------------------------------------
// QuicTransport
// ---------------------------------------------------------------------------

pub struct QuicTransport {
    local_peer_id: String,
    is_listener: bool,
    listen_port: u16,
    remote_addr: Option<String>,
    crypto: Arc<SessionCrypto>,
    tls: TlsIdentity,
    cancel: CancellationToken,

    state: Mutex<ConnectionState>,
    conn: RwLock<Option<quinn::Connection>>,
    endpoint: Mutex<Option<quinn::Endpoint>>,

    room_id: RwLock<String>,
    room_access_key: RwLock<String>,

    connected_ids: RwLock<Vec<String>>,
    announcement_sent: AtomicBool,
    announcement_received: AtomicBool,
    key_exchange_received: AtomicBool,
    key_exchange_sent: Mutex<HashMap<String, bool>>,

    incoming_tx: mpsc::Sender<MessagePayload>,
    incoming_rx: Mutex<Option<mpsc::Receiver<MessagePayload>>>,
    error_tx: mpsc::Sender<Error>,
    error_rx: Mutex<Option<mpsc::Receiver<Error>>>,
}

impl QuicTransport {
    /// Build the transport without touching the network; `start` does that.
    pub fn new(
        crypto: Arc<SessionCrypto>,
        room_id: &str,
        listen_port: u16,
        is_listener: bool,
        remote_addr: Option<String>,
        parent_cancel: &CancellationToken,
    ) -> Result<Arc<Self>> {
        let (incoming_tx, incoming_rx) = mpsc::channel(INCOMING_CHANNEL_CAPACITY);
        let (error_tx, error_rx) = mpsc::channel(ERROR_CHANNEL_CAPACITY);
        Ok(Arc::new(Self {
            local_peer_id: crypto.local_peer_id(),
            is_listener,
            listen_port,
            remote_addr,
            crypto,
            tls: TlsIdentity::generate()?,
            cancel: parent_cancel.child_token(),
            state: Mutex::new(ConnectionState::Idle),
            conn: RwLock::new(None),
            endpoint: Mutex::new(None),
            room_id: RwLock::new(room_id.to_string()),
            room_access_key: RwLock::new(String::new()),
            connected_ids: RwLock::new(Vec::new()),
            announcement_sent: AtomicBool::new(false),
            announcement_received: AtomicBool::new(false),
            key_exchange_received: AtomicBool::new(false),
            key_exchange_sent: Mutex::new(HashMap::new()),
            incoming_tx,
            incoming_rx: Mutex::new(Some(incoming_rx)),
            error_tx,
            error_rx: Mutex::new(Some(error_rx)),
        }))
    }

    // -- Accessors --

    pub fn is_listener(&self) -> bool {
        self.is_listener
    }

    pub fn state(&self) -> ConnectionState {
        *self.state.lock()
    }

    pub fn room_id(&self) -> String {
        self.room_id.read().clone()
    }

    pub fn local_cert_fingerprint(&self) -> String {
        self.tls.fingerprint().to_string()
    }

    pub fn connected_peers(&self) -> Vec<String> {
        self.connected_ids.read().clone()
    }

    /// Access key included in our announcements and checked against
    /// inbound ones.
    pub fn set_room_access_key(&self, access_key: &str) {
        *self.room_access_key.write() = access_key.to_string();
    }

    /// Hand out the incoming-message receiver. Single consumer.
    pub fn take_incoming(&self) -> Option<mpsc::Receiver<MessagePayload>> {
        self.incoming_rx.lock().take()
    }

    /// Hand out the async error receiver. Single consumer.
    pub fn take_errors(&self) -> Option<mpsc::Receiver<Error>> {
        self.error_rx.lock().take()
    }

    // -- Lifecycle --

    /// Bind (listener) or dial (joiner). Listener returns once the endpoint
    /// is bound; the dialer returns after the connection is established and
    /// the first announcement is on the wire.
    pub async fn start(self: &Arc<Self>) -> Result<()> {
        *self.state.lock() = ConnectionState::Connecting;
        if self.is_listener {
            self.listen().await
        } else {
            self.dial().await
        }
    }

    async fn listen(self: &Arc<Self>) -> Result<()> {
        let server_config = self.tls.server_config()?;
        let bind_addr: SocketAddr = format!("0.0.0.0:{}", self.listen_port)
            .parse()
            .expect("static address format");
        let endpoint = quinn::Endpoint::server(server_config, bind_addr)?;
        info!(port = self.listen_port, "listening on QUIC");
        *self.endpoint.lock() = Some(endpoint.clone());

        let transport = Arc::clone(self);
        tokio::spawn(async move {
            transport.accept_loop(endpoint).await;
        });
        Ok(())
    }

    /// Accept exactly one connection; the 1-to-1 invariant is hard.
    async fn accept_loop(self: Arc<Self>, endpoint: quinn::Endpoint) {
        let incoming = tokio::select! {
            _ = self.cancel.cancelled() => return,
            accepted = endpoint.accept() => match accepted {
                Some(incoming) => incoming,
                None => return,
            },
        };

        let connection = match incoming.await {
            Ok(conn) => conn,
            Err(e) => {
                warn!("accept error: {e}");
                self.push_error(Error::TransportClosed);
                return;
            }
        };
        info!(remote = %connection.remote_address(), "peer connected");

        *self.conn.write() = Some(connection.clone());
        if let Err(e) = self.send_announcement().await {
            warn!("announcement send failed: {e}");
        }
        self.read_loop(connection).await;
    }

    async fn dial(self: &Arc<Self>) -> Result<()> {
        let remote = self.remote_addr.clone().ok_or(Error::NotConnected)?;
        let remote_addr = resolve(&remote).await?;

        let mut endpoint = quinn::Endpoint::client("0.0.0.0:0".parse().expect("static address"))?;
        endpoint.set_default_client_config(self.tls.client_config()?);
        *self.endpoint.lock() = Some(endpoint.clone());

        debug!(%remote_addr, "dialing QUIC peer");
        let connection = endpoint
            .connect(remote_addr, "execp2p")
            .map_err(|e| {
                warn!("connect setup failed: {e}");
                Error::NotConnected
            })?
            .await
            .map_err(|_| Error::NotConnected)?;
        info!(remote = %connection.remote_address(), "dialed peer");

        *self.conn.write() = Some(connection.clone());
        self.send_announcement().await?;

        let transport = Arc::clone(self);
        tokio::spawn(async move {
            transport.read_loop(connection).await;
        });
        Ok(())
    }

    /// Cancel, drop the handle under exclusive lock, give in-flight streams
    /// a moment, then close cleanly.
    pub async fn stop(&self) {
        self.cancel.cancel();
        let connection = self.conn.write().take();
        if let Some(connection) = connection {
            tokio::time::sleep(STOP_DRAIN).await;
            connection.close(0u32.into(), b"closing");
        }
        if let Some(endpoint) = self.endpoint.lock().take() {
            endpoint.close(0u32.into(), b"closing");
        }
        *self.state.lock() = ConnectionState::Closed;
    }

    /// Poll until the handshake reaches `target` or the timeout elapses.
    pub async fn wait_for_state(&self, target: ConnectionState, timeout: Duration) -> bool {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            let state = self.state();
            if state >= target && state != ConnectionState::Closed {
                return true;
            }
            if state == ConnectionState::Closed || tokio::time::Instant::now() >= deadline {
                return false;
            }
            tokio::time::sleep(Duration::from_millis(100)).await;
        }
    }

    // -- Sending --

    /// Behaviour matrix:
    /// no connection + dialer        -> NotConnected
    /// listener with zero peers      -> local echo only
    /// connection + >= 1 peer        -> encrypt to the first peer and send
    pub async fn send_message(&self, message: &str) -> Result<()> {
        let connection = self.conn.read().clone();
        let peer_id = self.connected_ids.read().first().cloned();

        if connection.is_none() || (self.is_listener && peer_id.is_none()) {
            // Surface locally so the UI shows the message without an echo.
            let local = MessagePayload {
                sender_id: self.local_peer_id.clone(),
                message: message.to_string(),
                timestamp: unix_now(),
                message_id: format!("{}-{}", self.local_peer_id, nanos_now()),
            };
            let _ = self.incoming_tx.try_send(local);

            if !self.is_listener && connection.is_none() {
                return Err(Error::NotConnected);
            }
            return Ok(());
        }

        let peer_id = peer_id.ok_or(Error::NotConnected)?;
        let frame = self.crypto.encrypt_for_peer(&peer_id, message)?;
        let payload = to_cbor(&frame)?;
        debug!(peer = %short(&peer_id), size = payload.len(), "sending message");
        self.write_wrapper(Envelope::new(
            FrameType::Message,
            &payload,
            &self.local_peer_id,
        ))
        .await
    }

    /// Rotate session keys and re-run the key exchange with every peer.
    pub async fn force_key_rotation(&self) -> Result<bool> {
        if !self.crypto.rotate_keys()? {
            return Ok(false);
        }

        let peer_ids = self.connected_ids.read().clone();
        {
            let mut sent = self.key_exchange_sent.lock();
            for id in &peer_ids {
                sent.insert(id.clone(), false);
            }
        }

        let mut first_error: Option<Error> = None;
        for peer_id in &peer_ids {
            if let Err(e) = self.send_key_exchange(peer_id).await {
                warn!(peer = %short(peer_id), "key exchange failed during rotation: {e}");
                first_error.get_or_insert(e);
            } else {
                self.key_exchange_sent.lock().insert(peer_id.clone(), true);
            }
        }
        if !peer_ids.is_empty() {
            info!(peers = peer_ids.len(), "session keys rotated");
        }
        match first_error {
            Some(e) => Err(Error::KeyRotationFailed(e.to_string())),
            None => Ok(true),
        }
    }

    async fn send_announcement(&self) -> Result<()> {
        let announcement = self.crypto.create_announcement(self.tls.fingerprint());
        let payload = to_cbor(&announcement)?;
        let envelope = Envelope::new(FrameType::Announcement, &payload, &self.local_peer_id)
            .with_room(&self.room_id(), &self.room_access_key.read().clone());
        debug!(room = %self.room_id(), "sending peer announcement");
        self.write_wrapper(envelope).await?;
        self.announcement_sent.store(true, Ordering::SeqCst);
        self.recompute_state();
        Ok(())
    }

    async fn send_key_exchange(&self, peer_id: &str) -> Result<()> {
        let exchange = self.crypto.initiate_key_exchange(peer_id)?;
        let payload = to_cbor(&exchange)?;
        self.write_wrapper(Envelope::new(
            FrameType::Keyexchange,
            &payload,
            &self.local_peer_id,
        ))
        .await
    }

    /// One frame per unidirectional stream.
    async fn write_wrapper(&self, envelope: Envelope) -> Result<()> {
        let connection = self.conn.read().clone().ok_or(Error::NotConnected)?;
        let bytes = serde_json::to_vec(&envelope)?;
        let mut stream = connection
            .open_uni()
            .await
            .map_err(|_| Error::TransportClosed)?;
        stream
            .write_all(&bytes)
            .await
            .map_err(|_| Error::TransportClosed)?;
        stream.finish().map_err(|_| Error::TransportClosed)?;
        Ok(())
    }

    // -- Receiving --

    async fn read_loop(self: &Arc<Self>, connection: quinn::Connection) {
        loop {
            let stream = tokio::select! {
                _ = self.cancel.cancelled() => return,
                accepted = connection.accept_uni() => accepted,
            };
            let stream = match stream {
                Ok(s) => s,
                Err(e) => {
                    debug!("connection stream error: {e}");
                    if !self.cancel.is_cancelled() {
                        self.push_error(Error::TransportClosed);
                    }
                    let transport = Arc::clone(self);
                    tokio::spawn(async move { transport.stop().await });
                    return;
                }
            };

            // Streams are independent; a failed or panicking handler only
            // kills its own task.
            let transport = Arc::clone(self);
            tokio::spawn(async move {
                transport.handle_stream(stream).await;
            });
        }
    }

    async fn handle_stream(self: &Arc<Self>, mut stream: quinn::RecvStream) {
        let bytes = match stream.read_to_end(MAX_FRAME_BYTES).await {
            Ok(b) => b,
            Err(e) => {
                warn!("stream read failed: {e}");
                return;
            }
        };
        let envelope: Envelope = match serde_json::from_slice(&bytes) {
            Ok(env) => env,
            Err(e) => {
                warn!("invalid wrapper: {e}");
                return;
            }
        };
        debug!(
            frame = ?envelope.frame_type,
            from = %short(&envelope.sender_id),
            size = envelope.payload.len(),
            "received wrapper"
        );
        match envelope.frame_type {
            FrameType::Announcement => self.handle_announcement(envelope).await,
            FrameType::Keyexchange => self.handle_key_exchange(envelope),
            FrameType::Message => self.handle_encrypted_chat(envelope),
        }
    }

    async fn handle_announcement(self: &Arc<Self>, envelope: Envelope) {
        let announcement: PeerAnnouncement = match envelope
            .payload_bytes()
            .and_then(|b| from_cbor(&b))
        {
            Ok(a) => a,
            Err(e) => {
                warn!("announcement decode failed: {e}");
                return;
            }
        };

        // Room binding. A joiner that discovered the room adopts the
        // responder's ID; a listener rejects foreign rooms.
        let local_room = self.room_id();
        if !envelope.room_id.is_empty() && envelope.room_id != local_room {
            if self.is_listener {
                warn!(expected = %local_room, got = %envelope.room_id, "room ID mismatch");
                self.push_error_delayed(Error::RoomIdMismatch {
                    expected: local_room,
                    got: envelope.room_id,
                });
                return;
            }
            info!(old = %local_room, new = %envelope.room_id, "adopting responder room ID");
            *self.room_id.write() = envelope.room_id.clone();
        }

        // Access key check, before any key exchange.
        let expected_key = self.room_access_key.read().clone();
        if !expected_key.is_empty() && envelope.access_key != expected_key {
            warn!(peer = %short(&announcement.peer_id), "announcement with invalid access key");
            self.push_error_delayed(Error::AccessKeyMismatch);
            return;
        }

        if let Err(e) = self.crypto.process_announcement(&announcement) {
            warn!("invalid peer announcement: {e}");
            return;
        }

        // Bind the announced fingerprint to the live TLS session.
        if let Some(connection) = self.conn.read().clone() {
            if let Some(remote_fp) = remote_cert_fingerprint(&connection) {
                if let Err(e) = self
                    .crypto
                    .verify_tls_binding(&announcement.peer_id, &remote_fp)
                {
                    warn!("TLS certificate fingerprint mismatch; possible MITM");
                    self.push_error(e);
                    let transport = Arc::clone(self);
                    tokio::spawn(async move { transport.stop().await });
                    return;
                }
            }
        }

        info!(
            room = %self.room_id(),
            peer = %short(&announcement.peer_id),
            "peer announcement accepted"
        );
        *self.connected_ids.write() = vec![announcement.peer_id.clone()];
        self.announcement_received.store(true, Ordering::SeqCst);
        self.recompute_state();

        // Reply at most once per connection.
        if !self.announcement_sent.load(Ordering::SeqCst) {
            if let Err(e) = self.send_announcement().await {
                warn!("reply announcement failed: {e}");
            }
        }

        // Initiate the key exchange at most once per peer.
        let already_sent = {
            let mut sent = self.key_exchange_sent.lock();
            let entry = sent.entry(announcement.peer_id.clone()).or_insert(false);
            std::mem::replace(entry, true)
        };
        if !already_sent {
            if let Err(e) = self.send_key_exchange(&announcement.peer_id).await {
                warn!("key exchange failed: {e}");
                self.key_exchange_sent
                    .lock()
                    .insert(announcement.peer_id.clone(), false);
            } else {
                self.recompute_state();
            }
        }
    }

    fn handle_key_exchange(&self, envelope: Envelope) {
        let exchange: KeyExchange = match envelope.payload_bytes().and_then(|b| from_cbor(&b)) {
            Ok(kx) => kx,
            Err(e) => {
                warn!("key exchange decode failed: {e}");
                return;
            }
        };
        if let Err(e) = self.crypto.process_key_exchange(&exchange) {
            warn!("invalid key exchange: {e}");
            return;
        }
        info!(peer = %short(&exchange.sender_id), "secure channel established");
        self.key_exchange_received.store(true, Ordering::SeqCst);
        self.recompute_state();
    }

    fn handle_encrypted_chat(&self, envelope: Envelope) {
        let frame: EncryptedMessage = match envelope.payload_bytes().and_then(|b| from_cbor(&b)) {
            Ok(f) => f,
            Err(e) => {
                warn!("message decode failed: {e}");
                return;
            }
        };
        let payload = match self.crypto.decrypt_from_peer(&frame) {
            Ok(p) => p,
            Err(e) => {
                warn!("message rejected: {e}");
                return;
            }
        };

        // Our own messages were already surfaced locally when sent.
        if self.is_listener && payload.sender_id == self.local_peer_id {
            return;
        }

        if self.incoming_tx.try_send(payload).is_err() {
            warn!("incoming message channel full; dropping");
        }
    }

    // -- Error channel --

    fn push_error(&self, error: Error) {
        if self.error_tx.try_send(error).is_err() {
            debug!("error channel full; dropping");
        }
    }

    /// Delayed send so the remote can drain in-flight frames first.
    fn push_error_delayed(&self, error: Error) {
        let tx = self.error_tx.clone();
        tokio::spawn(async move {
            tokio::time::sleep(MISMATCH_ERROR_DELAY).await;
            let _ = tx.try_send(error);
        });
    }

    fn recompute_state(&self) {
        let mut state = self.state.lock();
        if matches!(*state, ConnectionState::Closed) {
            return;
        }
        let announced = self.announcement_sent.load(Ordering::SeqCst)
            && self.announcement_received.load(Ordering::SeqCst);
        let exchanged_out = self
            .key_exchange_sent
            .lock()
            .values()
            .any(|sent| *sent);
        let verified = announced
            && self.key_exchange_received.load(Ordering::SeqCst)
            && (self.is_listener || exchanged_out);
        *state = if verified {
            ConnectionState::Verified
        } else if announced {
            ConnectionState::Announced
        } else {
            ConnectionState::Connecting
        };
    }
}

fn short(id: &str) -> &str {
    id.get(..8).unwrap_or(id)
}

async fn resolve(addr: &str) -> Result<SocketAddr> {
    tokio::net::lookup_host(addr)
        .await?
        .next()
        .ok_or_else(|| Error::InvalidFrame(format!("unresolvable address {addr}")))
}

fn nanos_now() -> u128 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_nanos())
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn state_ordering_supports_threshold_waits() {
        assert!(ConnectionState::Verified > ConnectionState::Announced);
        assert!(ConnectionState::Announced > ConnectionState::Connecting);
        assert!(ConnectionState::Connecting > ConnectionState::Idle);
    }

    #[tokio::test]
    async fn dialer_without_connection_reports_not_connected() {
        let cancel = CancellationToken::new();
        let crypto = Arc::new(SessionCrypto::new());
        let transport = QuicTransport::new(
            crypto,
            "ExecP2P_room",
            9000,
            false,
            Some("127.0.0.1:1".into()),
            &cancel,
        )
        .unwrap();
        assert!(matches!(
            transport.send_message("hello").await,
            Err(Error::NotConnected)
        ));
    }

    #[tokio::test]
    async fn listener_with_no_peers_echoes_locally() {
        let cancel = CancellationToken::new();
        let crypto = Arc::new(SessionCrypto::new());
        let transport =
            QuicTransport::new(crypto, "ExecP2P_room", 9000, true, None, &cancel).unwrap();
        let mut incoming = transport.take_incoming().unwrap();

        transport.send_message("just me").await.unwrap();
        let payload = incoming.recv().await.unwrap();
        assert_eq!(payload.message, "just me");
    }
}
