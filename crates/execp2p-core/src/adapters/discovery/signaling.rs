//! HTTP client for the optional signalling rendezvous server.

use std::time::Duration;

use tracing::{info, warn};

use crate::domain::error::{Error, Result};
use crate::domain::room::unix_now;
use crate::domain::wire::{RoomInfo, RoomRegistration};

use super::stun;

/// How long a registration stays valid.
const REGISTRATION_TTL: Duration = Duration::from_secs(8 * 60 * 60);

/// Per-request timeout.
const REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

/// Rendezvous server location; `None` disables signalling entirely.
#[derive(Debug, Clone, Default)]
pub struct SignalingConfig {
    pub server_url: Option<String>,
}

impl SignalingConfig {
    pub fn new(server_url: Option<String>) -> Self {
        Self {
            server_url: server_url.filter(|url| !url.is_empty()),
        }
    }

    pub fn enabled(&self) -> bool {
        self.server_url.is_some()
    }
}

fn client() -> Result<reqwest::Client> {
    reqwest::Client::builder()
        .timeout(REQUEST_TIMEOUT)
        .build()
        .map_err(|e| Error::SignallingUnavailable(e.to_string()))
}

/// Register our room. Failures are logged, not fatal — signalling is an
/// optional path.
pub async fn register_room(config: &SignalingConfig, room_id: &str, public_addr: &str) {
    let Some(server) = &config.server_url else {
        return;
    };

    // STUN may see a different mapping than the caller-provided address;
    // the server stores both.
    let stun_addr = match stun::external_udp_addr(9000).await {
        Ok(addr) => addr.to_string(),
        Err(e) => {
            warn!("STUN address for registration unavailable: {e}");
            public_addr.to_string()
        }
    };

    let now = unix_now();
    let registration = RoomRegistration {
        room_id: room_id.to_string(),
        public_addr: public_addr.to_string(),
        is_nated: true,
        stun_addr,
        behind_sym_nat: false,
        creation_time: now,
        expiration_time: now + REGISTRATION_TTL.as_secs() as i64,
    };

    let Ok(http) = client() else { return };
    match http
        .post(format!("{server}/api/register"))
        .json(&registration)
        .send()
        .await
    {
        Ok(response) if response.status().is_success() => {
            info!(room = %room_id, "room registered on signalling server");
        }
        Ok(response) => {
            warn!(status = %response.status(), "signalling server rejected registration");
        }
        Err(e) => {
            warn!("could not reach signalling server: {e}");
        }
    }
}

/// Fetch the registered addresses for a room.
pub async fn fetch_room_info(config: &SignalingConfig, room_id: &str) -> Result<RoomInfo> {
    let server = config
        .server_url
        .as_ref()
        .ok_or_else(|| Error::SignallingUnavailable("no server configured".into()))?;

    let response = client()?
        .get(format!("{server}/api/room/{room_id}"))
        .send()
        .await
        .map_err(|e| Error::SignallingUnavailable(e.to_string()))?;

    if response.status() == reqwest::StatusCode::NOT_FOUND {
        return Err(Error::RoomNotFound(room_id.to_string()));
    }
    if !response.status().is_success() {
        return Err(Error::SignallingUnavailable(format!(
            "server returned {}",
            response.status()
        )));
    }

    response
        .json::<RoomInfo>()
        .await
        .map_err(|e| Error::SignallingUnavailable(e.to_string()))
}

/// Resolve our external address and register it. Listener-side companion
/// of [`fetch_room_info`].
pub async fn announce_external_address(config: &SignalingConfig, room_id: &str, port: u16) {
    if !config.enabled() {
        return;
    }
    let public_addr = match stun::external_udp_addr(port).await {
        Ok(addr) => addr.to_string(),
        Err(e) => {
            warn!("cannot announce external address: {e}");
            return;
        }
    };
    register_room(config, room_id, &public_addr).await;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_url_disables_signalling() {
        assert!(!SignalingConfig::new(None).enabled());
        assert!(!SignalingConfig::new(Some(String::new())).enabled());
        assert!(SignalingConfig::new(Some("http://localhost:8085".into())).enabled());
    }

    #[tokio::test]
    async fn fetch_without_server_is_unavailable() {
        let config = SignalingConfig::default();
        assert!(matches!(
            fetch_room_info(&config, "ExecP2P_x").await,
            Err(Error::SignallingUnavailable(_))
        ));
    }
}
