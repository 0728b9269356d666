//! External-address resolution via STUN binding requests.
//!
//! Minimal RFC 5389 client: send a binding request, parse the
//! XOR-MAPPED-ADDRESS (or plain MAPPED-ADDRESS) attribute from the first
//! server that answers.

use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};
use std::time::Duration;

use rand::RngCore;
use tokio::net::UdpSocket;
use tracing::{debug, warn};

use crate::domain::error::{Error, Result};

/// Public STUN servers tried in order.
pub const STUN_SERVERS: [&str; 4] = [
    "stun.l.google.com:19302",
    "stun1.l.google.com:19302",
    "stun.twilio.com:3478",
    "stun.stunprotocol.org:3478",
];

/// Retransmission timeout per server.
const STUN_RTO: Duration = Duration::from_secs(5);

const MAGIC_COOKIE: [u8; 4] = [0x21, 0x12, 0xA4, 0x42];
const ATTR_MAPPED_ADDRESS: u16 = 0x0001;
const ATTR_XOR_MAPPED_ADDRESS: u16 = 0x0020;

/// Resolve our external `ip:port` as seen by a STUN server.
///
/// Binds the preferred local port when free; otherwise scans forward up to
/// +100 for an open one before querying.
pub async fn external_udp_addr(preferred_port: u16) -> Result<SocketAddr> {
    let socket = bind_near(preferred_port).await?;

    let mut last_err: Option<Error> = None;
    for server in STUN_SERVERS {
        match query_server(&socket, server).await {
            Ok(addr) => return Ok(addr),
            Err(e) => {
                debug!(server, "STUN query failed: {e}");
                last_err = Some(e);
            }
        }
    }
    warn!("could not discover external address via STUN");
    Err(last_err.unwrap_or(Error::DiscoveryExhausted))
}

async fn bind_near(preferred_port: u16) -> Result<UdpSocket> {
    for offset in 0..100u16 {
        let port = preferred_port.saturating_add(offset);
        if let Ok(socket) = UdpSocket::bind(("0.0.0.0", port)).await {
            return Ok(socket);
        }
    }
    // Last resort: let the OS choose.
    Ok(UdpSocket::bind(("0.0.0.0", 0)).await?)
}

async fn query_server(socket: &UdpSocket, server: &str) -> Result<SocketAddr> {
    let dest = tokio::net::lookup_host(server)
        .await?
        .find(|a| a.is_ipv4())
        .ok_or_else(|| Error::SignallingUnavailable(format!("{server} did not resolve")))?;

    // Binding request: type 0x0001, zero-length body, magic cookie, random
    // transaction ID.
    let mut request = [0u8; 20];
    request[1] = 0x01;
    request[4..8].copy_from_slice(&MAGIC_COOKIE);
    rand::thread_rng().fill_bytes(&mut request[8..20]);

    socket.send_to(&request, dest).await?;

    let mut buf = [0u8; 256];
    let (len, _) = tokio::time::timeout(STUN_RTO, socket.recv_from(&mut buf))
        .await
        .map_err(|_| Error::SignallingUnavailable(format!("{server} timed out")))??;

    parse_binding_response(&buf[..len], &request[8..20])
        .ok_or_else(|| Error::InvalidFrame("no mapped address in STUN response".into()))
}

fn parse_binding_response(response: &[u8], transaction_id: &[u8]) -> Option<SocketAddr> {
    if response.len() < 20 || &response[8..20] != transaction_id {
        return None;
    }

    let mut i = 20;
    while i + 4 <= response.len() {
        let attr_type = u16::from_be_bytes([response[i], response[i + 1]]);
        let attr_len = u16::from_be_bytes([response[i + 2], response[i + 3]]) as usize;
        if i + 4 + attr_len > response.len() {
            break;
        }
        let value = &response[i + 4..i + 4 + attr_len];

        if attr_type == ATTR_XOR_MAPPED_ADDRESS && attr_len >= 8 && value[1] == 0x01 {
            let port = u16::from_be_bytes([value[2], value[3]])
                ^ u16::from_be_bytes([MAGIC_COOKIE[0], MAGIC_COOKIE[1]]);
            let ip = Ipv4Addr::new(
                value[4] ^ MAGIC_COOKIE[0],
                value[5] ^ MAGIC_COOKIE[1],
                value[6] ^ MAGIC_COOKIE[2],
                value[7] ^ MAGIC_COOKIE[3],
            );
            return Some(SocketAddr::V4(SocketAddrV4::new(ip, port)));
        }
        if attr_type == ATTR_MAPPED_ADDRESS && attr_len >= 8 && value[1] == 0x01 {
            let port = u16::from_be_bytes([value[2], value[3]]);
            let ip = Ipv4Addr::new(value[4], value[5], value[6], value[7]);
            return Some(SocketAddr::V4(SocketAddrV4::new(ip, port)));
        }

        // Attributes pad to 4-byte boundaries.
        i += 4 + ((attr_len + 3) & !3);
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    fn binding_response(txn: &[u8; 12], attrs: &[u8]) -> Vec<u8> {
        let mut resp = Vec::new();
        resp.extend_from_slice(&[0x01, 0x01]); // binding success
        resp.extend_from_slice(&(attrs.len() as u16).to_be_bytes());
        resp.extend_from_slice(&MAGIC_COOKIE);
        resp.extend_from_slice(txn);
        resp.extend_from_slice(attrs);
        resp
    }

    #[test]
    fn parses_xor_mapped_address() {
        let txn = [7u8; 12];
        // 203.0.113.7:3478, XOR-ed with the magic cookie
        let port: u16 = 3478 ^ 0x2112;
        let attrs = [
            &ATTR_XOR_MAPPED_ADDRESS.to_be_bytes()[..],
            &8u16.to_be_bytes(),
            &[0x00, 0x01],
            &port.to_be_bytes(),
            &[
                203 ^ MAGIC_COOKIE[0],
                0 ^ MAGIC_COOKIE[1],
                113 ^ MAGIC_COOKIE[2],
                7 ^ MAGIC_COOKIE[3],
            ],
        ]
        .concat();
        let resp = binding_response(&txn, &attrs);
        let addr = parse_binding_response(&resp, &txn).unwrap();
        assert_eq!(addr, "203.0.113.7:3478".parse::<SocketAddr>().unwrap());
    }

    #[test]
    fn parses_plain_mapped_address() {
        let txn = [9u8; 12];
        let attrs = [
            &ATTR_MAPPED_ADDRESS.to_be_bytes()[..],
            &8u16.to_be_bytes(),
            &[0x00, 0x01],
            &9000u16.to_be_bytes(),
            &[192, 0, 2, 1],
        ]
        .concat();
        let resp = binding_response(&txn, &attrs);
        let addr = parse_binding_response(&resp, &txn).unwrap();
        assert_eq!(addr, "192.0.2.1:9000".parse::<SocketAddr>().unwrap());
    }

    #[test]
    fn rejects_wrong_transaction_id() {
        let txn = [1u8; 12];
        let resp = binding_response(&txn, &[]);
        assert!(parse_binding_response(&resp, &[2u8; 12]).is_none());
    }

    #[test]
    fn skips_unknown_attributes_with_padding() {
        let txn = [3u8; 12];
        // unknown attr (5 bytes, padded to 8), then a mapped address
        let attrs = [
            &0x8022u16.to_be_bytes()[..], // SOFTWARE
            &5u16.to_be_bytes(),
            b"hello",
            &[0, 0, 0], // padding
            &ATTR_MAPPED_ADDRESS.to_be_bytes(),
            &8u16.to_be_bytes(),
            &[0x00, 0x01],
            &1234u16.to_be_bytes(),
            &[10, 0, 0, 1],
        ]
        .concat();
        let resp = binding_response(&txn, &attrs);
        let addr = parse_binding_response(&resp, &txn).unwrap();
        assert_eq!(addr, "10.0.0.1:1234".parse::<SocketAddr>().unwrap());
    }
}
