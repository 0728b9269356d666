//! UDP hole punching.
//!
//! Both sides fire datagrams at each other's NAT mapping: the initiator
//! sends `punch` every 500 ms, the responder answers `pong` and then
//! `connected`; whoever sees `connected` first has a working path. Reads
//! use a 1-second deadline so cancellation is observed promptly.

use std::time::Duration;

use tokio::net::UdpSocket;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::domain::error::{Error, Result};
use crate::domain::wire::{PunchKind, PunchMessage};

use super::stun;

/// Overall deadline for one punching attempt.
const PUNCH_DEADLINE: Duration = Duration::from_secs(20);

/// Cadence of outgoing `punch` datagrams.
const PUNCH_INTERVAL: Duration = Duration::from_millis(500);

/// Read deadline; doubles as the cancellation check interval.
const READ_DEADLINE: Duration = Duration::from_secs(1);

/// Delay between the responder's `pong` and its `connected` confirmation.
const CONFIRM_DELAY: Duration = Duration::from_millis(500);

/// Initiate hole punching toward `remote_addr`. Returns the peer address
/// that confirmed the path.
pub async fn initiate(remote_addr: &str, room_id: &str, local_port: u16) -> Result<String> {
    info!(remote = remote_addr, local_port, "initiating UDP hole punching");

    // Our external mapping, advertised inside the punch frames. Best
    // effort and time-bounded: punching can still succeed without it.
    let external_addr = match tokio::time::timeout(
        Duration::from_secs(5),
        stun::external_udp_addr(local_port),
    )
    .await
    {
        Ok(Ok(addr)) => addr.to_string(),
        Ok(Err(e)) => {
            warn!("external address lookup failed: {e}");
            String::new()
        }
        Err(_) => {
            warn!("external address lookup timed out");
            String::new()
        }
    };

    let remote = tokio::net::lookup_host(remote_addr)
        .await?
        .next()
        .ok_or_else(|| Error::InvalidFrame(format!("unresolvable address {remote_addr}")))?;

    let socket = UdpSocket::bind(("0.0.0.0", local_port)).await?;

    let punch = PunchMessage {
        kind: PunchKind::Punch,
        sender_addr: external_addr,
        room_id: room_id.to_string(),
        port: local_port,
    };
    let punch_bytes = serde_json::to_vec(&punch)?;

    let deadline = tokio::time::Instant::now() + PUNCH_DEADLINE;
    let mut next_punch = tokio::time::Instant::now();
    let mut buf = [0u8; 1024];

    while tokio::time::Instant::now() < deadline {
        if tokio::time::Instant::now() >= next_punch {
            if let Err(e) = socket.send_to(&punch_bytes, remote).await {
                warn!("punch send failed: {e}");
            }
            next_punch = tokio::time::Instant::now() + PUNCH_INTERVAL;
        }

        let received = tokio::time::timeout(READ_DEADLINE, socket.recv_from(&mut buf)).await;
        let (len, src) = match received {
            Ok(Ok(r)) => r,
            _ => continue,
        };
        let message: PunchMessage = match serde_json::from_slice(&buf[..len]) {
            Ok(m) => m,
            Err(_) => continue,
        };
        if message.room_id != room_id {
            continue;
        }

        match message.kind {
            PunchKind::Pong => {
                debug!(%src, "pong received; confirming");
                let confirm = PunchMessage {
                    kind: PunchKind::Connected,
                    sender_addr: message.sender_addr.clone(),
                    room_id: room_id.to_string(),
                    port: message.port,
                };
                if let Ok(bytes) = serde_json::to_vec(&confirm) {
                    let _ = socket.send_to(&bytes, src).await;
                }
            }
            PunchKind::Connected => {
                info!(peer = %src, "hole punching succeeded");
                return Ok(src.to_string());
            }
            PunchKind::Punch => {}
        }
    }

    Err(Error::HolePunchTimeout)
}

/// Responder: answer `punch` frames for our room with `pong` followed by
/// `connected`. Runs until cancelled. Degrades to a no-op with a warning
/// when the port is already owned by the QUIC endpoint.
pub async fn responder(room_id: String, local_port: u16, cancel: CancellationToken) {
    let socket = match UdpSocket::bind(("0.0.0.0", local_port)).await {
        Ok(s) => s,
        Err(e) => {
            warn!(port = local_port, "hole-punch responder disabled: {e}");
            return;
        }
    };
    info!(port = local_port, "hole-punch responder running");

    let mut buf = [0u8; 1024];
    loop {
        if cancel.is_cancelled() {
            return;
        }
        let received = tokio::time::timeout(READ_DEADLINE, socket.recv_from(&mut buf)).await;
        let (len, src) = match received {
            Ok(Ok(r)) => r,
            _ => continue,
        };
        let message: PunchMessage = match serde_json::from_slice(&buf[..len]) {
            Ok(m) => m,
            Err(_) => continue,
        };
        if message.kind != PunchKind::Punch || message.room_id != room_id {
            continue;
        }
        debug!(%src, "punch request received");

        let pong = PunchMessage {
            kind: PunchKind::Pong,
            sender_addr: src.to_string(),
            room_id: room_id.clone(),
            port: local_port,
        };
        if let Ok(bytes) = serde_json::to_vec(&pong) {
            let _ = socket.send_to(&bytes, src).await;
        }

        tokio::time::sleep(CONFIRM_DELAY).await;
        let confirm = PunchMessage {
            kind: PunchKind::Connected,
            sender_addr: src.to_string(),
            room_id: room_id.clone(),
            port: local_port,
        };
        if let Ok(bytes) = serde_json::to_vec(&confirm) {
            let _ = socket.send_to(&bytes, src).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Drive an initiator against a local responder over loopback.
    #[tokio::test]
    async fn punch_exchange_over_loopback() {
        let room_id = "ExecP2P_holepunch_loopback_test1".to_string();
        let cancel = CancellationToken::new();

        let responder_socket = UdpSocket::bind(("127.0.0.1", 0)).await.unwrap();
        let responder_port = responder_socket.local_addr().unwrap().port();
        drop(responder_socket);

        let handle = tokio::spawn(responder(
            room_id.clone(),
            responder_port,
            cancel.clone(),
        ));
        tokio::time::sleep(Duration::from_millis(100)).await;

        let initiator_socket = UdpSocket::bind(("127.0.0.1", 0)).await.unwrap();
        let initiator_port = initiator_socket.local_addr().unwrap().port();
        drop(initiator_socket);

        // The responder's visible address should come back as the punched
        // peer.
        let addr = tokio::time::timeout(
            Duration::from_secs(10),
            initiate(
                &format!("127.0.0.1:{responder_port}"),
                &room_id,
                initiator_port,
            ),
        )
        .await
        .expect("punch did not finish")
        .expect("punch failed");
        assert!(addr.ends_with(&format!(":{responder_port}")));

        cancel.cancel();
        let _ = handle.await;
    }

    #[tokio::test]
    async fn initiator_times_out_without_responder() {
        // Short-circuit the 20s deadline by checking the error type against
        // a dead port with a tiny wrapper timeout: the initiator itself
        // only returns HolePunchTimeout at its deadline, so just assert it
        // is still running shortly after start.
        let room_id = "ExecP2P_holepunch_timeout_test12".to_string();
        let task = tokio::spawn(async move {
            initiate("127.0.0.1:1", &room_id, 0).await
        });
        tokio::time::sleep(Duration::from_millis(300)).await;
        assert!(!task.is_finished());
        task.abort();
    }
}
