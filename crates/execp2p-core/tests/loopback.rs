//! End-to-end loopback session: create a room, join it over 127.0.0.1,
//! complete the PQ handshake, and exchange chat both ways.

use std::time::Duration;

use execp2p_core::application::AppEvent;
use execp2p_core::config::{Config, DiscoveryConfig, NetworkConfig};
use execp2p_core::{Error, Session};

fn config(min_port: u16, max_port: u16) -> Config {
    Config {
        network: NetworkConfig {
            min_port,
            max_port,
            max_peers: 2,
        },
        discovery: DiscoveryConfig {
            bt_dht_port: 6881,
            signaling_server: None,
        },
    }
}

/// Poll until both sides report a verified peer.
async fn wait_verified(a: &Session, b: &Session, timeout: Duration) -> bool {
    let deadline = tokio::time::Instant::now() + timeout;
    while tokio::time::Instant::now() < deadline {
        if a.network_status().verified_peers >= 1 && b.network_status().verified_peers >= 1 {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(100)).await;
    }
    false
}

async fn next_message(
    rx: &mut tokio::sync::broadcast::Receiver<AppEvent>,
    timeout: Duration,
) -> Option<String> {
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        let remaining = deadline.saturating_duration_since(tokio::time::Instant::now());
        if remaining.is_zero() {
            return None;
        }
        match tokio::time::timeout(remaining, rx.recv()).await {
            Ok(Ok(AppEvent::MessageReceived(payload))) => return Some(payload.message),
            Ok(Ok(_)) => continue,
            Ok(Err(tokio::sync::broadcast::error::RecvError::Lagged(_))) => continue,
            _ => return None,
        }
    }
}

#[tokio::test(flavor = "multi_thread")]
async fn create_join_and_chat_over_loopback() {
    let creator = Session::new(config(42100, 42110)).unwrap();
    let joiner = Session::new(config(42120, 42130)).unwrap();

    let created = creator.create_room().await.unwrap();
    assert!(execp2p_core::domain::room::validate_room_id(&created.room_id));
    assert!(created.access_key.len() <= 24);
    assert!((42100..=42110).contains(&created.listen_port));

    let mut creator_events = creator.events().subscribe();
    let mut joiner_events = joiner.events().subscribe();

    joiner
        .join_room(
            &created.room_id,
            Some(&format!("127.0.0.1:{}", created.listen_port)),
            &created.access_key,
        )
        .await
        .expect("join over loopback should succeed");

    assert!(
        wait_verified(&creator, &joiner, Duration::from_secs(10)).await,
        "handshake did not verify in time"
    );

    // Joiner -> creator.
    joiner.send_message("hello").await.unwrap();
    let received = next_message(&mut creator_events, Duration::from_secs(5)).await;
    assert_eq!(received.as_deref(), Some("hello"));

    // Creator -> joiner.
    creator.send_message("welcome").await.unwrap();
    let received = next_message(&mut joiner_events, Duration::from_secs(5)).await;
    assert_eq!(received.as_deref(), Some("welcome"));

    let status = creator.network_status();
    assert!(status.is_listener);
    assert!(status.e2e_encryption);
    assert_eq!(status.connected_peers, 1);

    joiner.close().await;
    creator.close().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn wrong_access_key_is_rejected_before_key_exchange() {
    let creator = Session::new(config(42140, 42150)).unwrap();
    let joiner = Session::new(config(42160, 42170)).unwrap();

    let created = creator.create_room().await.unwrap();

    let started = tokio::time::Instant::now();
    let result = joiner
        .join_room(
            &created.room_id,
            Some(&format!("127.0.0.1:{}", created.listen_port)),
            "zzz",
        )
        .await;
    assert!(matches!(result, Err(Error::AccessKeyMismatch)));
    assert!(started.elapsed() < Duration::from_secs(5));

    // The listener never verified the intruder and keeps listening.
    let status = creator.network_status();
    assert_eq!(status.verified_peers, 0);
    assert!(status.is_running);

    creator.close().await;
}
