//! expandscreen-discovery — answers LAN broadcasts so handhelds can find
//! the host without manual IP entry.
//!
//! One JSON object per datagram, both directions:
//!
//! ```text
//! handheld ──broadcast──► {"message_type":"DiscoveryRequest","request_id":…}
//! handheld ◄──unicast──── {"message_type":"DiscoveryResponse","request_id":…,
//!                          "tcp_port":…,"server_name":…}
//! ```
//!
//! Datagrams without the literal `DiscoveryRequest` type are dropped
//! silently; socket errors are logged and the loop keeps serving.

use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};

use anyhow::{Context, Result};
use expandscreen_core::Shutdown;
use expandscreen_protocol::{DiscoveryRequest, DiscoveryResponse, DISCOVERY_REQUEST_TYPE};
use socket2::{Domain, Protocol, Socket, Type};
use tokio::net::UdpSocket;
use tracing::{debug, info, warn};

pub const DEFAULT_DISCOVERY_PORT: u16 = 15556;

const DATAGRAM_BUF_SIZE: usize = 2048;

// ── Configuration ─────────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct DiscoveryConfig {
    /// UDP port to answer on. 0 binds an ephemeral port (tests).
    pub port: u16,
    pub server_id: String,
    pub server_name: String,
    /// The host's TCP accept port, advertised to clients.
    pub tcp_port: u16,
    pub server_version: String,
}

impl DiscoveryConfig {
    pub fn new(server_id: String, server_name: String, tcp_port: u16) -> Self {
        Self {
            port: DEFAULT_DISCOVERY_PORT,
            server_id,
            server_name,
            tcp_port,
            server_version: env!("CARGO_PKG_VERSION").to_owned(),
        }
    }
}

// ── Responder ─────────────────────────────────────────────────────────────────

/// Bound UDP responder. Call [`DiscoveryResponder::run`] to serve.
pub struct DiscoveryResponder {
    socket: UdpSocket,
    config: DiscoveryConfig,
}

impl DiscoveryResponder {
    /// Bind with `SO_REUSEADDR` and `SO_BROADCAST` so the responder can
    /// share the well-known port across restarts and hear broadcasts.
    pub fn bind(config: DiscoveryConfig) -> Result<Self> {
        let socket = Socket::new(Domain::IPV4, Type::DGRAM, Some(Protocol::UDP))
            .context("creating discovery socket")?;
        socket.set_reuse_address(true).context("SO_REUSEADDR")?;
        socket.set_broadcast(true).context("SO_BROADCAST")?;
        let addr = SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, config.port);
        socket.bind(&SocketAddr::V4(addr).into()).with_context(|| format!("binding UDP {addr}"))?;
        socket.set_nonblocking(true).context("nonblocking")?;

        let socket = UdpSocket::from_std(socket.into()).context("registering discovery socket")?;
        info!("discovery responder bound on udp/{}", socket.local_addr()?.port());
        Ok(Self { socket, config })
    }

    pub fn local_port(&self) -> Result<u16> {
        Ok(self.socket.local_addr()?.port())
    }

    /// Serve until cancelled. Per-datagram errors never stop the loop.
    pub async fn run(self, mut cancel: Shutdown) {
        let mut buf = vec![0u8; DATAGRAM_BUF_SIZE];
        loop {
            let (len, from) = tokio::select! {
                _ = cancel.recv() => {
                    info!("discovery responder stopping");
                    return;
                }
                received = self.socket.recv_from(&mut buf) => match received {
                    Ok(v) => v,
                    Err(e) => {
                        warn!("discovery recv error: {e}");
                        continue;
                    }
                },
            };

            let Some(response) = self.answer(&buf[..len], from) else { continue };
            let bytes = match serde_json::to_vec(&response) {
                Ok(b) => b,
                Err(e) => {
                    warn!("discovery response encode failed: {e}");
                    continue;
                }
            };
            if let Err(e) = self.socket.send_to(&bytes, from).await {
                warn!("discovery reply to {from} failed: {e}");
            }
        }
    }

    fn answer(&self, datagram: &[u8], from: SocketAddr) -> Option<DiscoveryResponse> {
        let request: DiscoveryRequest = match serde_json::from_slice(datagram) {
            Ok(r) => r,
            Err(_) => {
                debug!("non-discovery datagram from {from} dropped");
                return None;
            }
        };
        if request.message_type != DISCOVERY_REQUEST_TYPE {
            debug!("datagram from {from} has message_type '{}', dropped", request.message_type);
            return None;
        }
        debug!(
            "discovery request {} from {from} (device {:?})",
            request.request_id, request.client_device_id
        );
        Some(DiscoveryResponse::answering(
            &request,
            &self.config.server_id,
            &self.config.server_name,
            self.config.tcp_port,
            &self.config.server_version,
        ))
    }
}

/// Primary LAN IPv4 address, from the OS routing table. No packets are sent.
pub fn detect_local_ip() -> std::net::IpAddr {
    std::net::UdpSocket::bind("0.0.0.0:0")
        .and_then(|s| {
            s.connect("8.8.8.8:80")?;
            s.local_addr()
        })
        .map(|a| a.ip())
        .unwrap_or_else(|_| std::net::IpAddr::V4(Ipv4Addr::LOCALHOST))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn test_config() -> DiscoveryConfig {
        DiscoveryConfig {
            port: 0,
            server_id: "srv-1".into(),
            server_name: "PC".into(),
            tcp_port: 15555,
            server_version: "1.0.0".into(),
        }
    }

    #[tokio::test]
    async fn responds_to_well_formed_request() {
        let responder = DiscoveryResponder::bind(test_config()).unwrap();
        let port = responder.local_port().unwrap();
        let (_guard, cancel) = Shutdown::channel();
        tokio::spawn(responder.run(cancel));

        let client = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let request = json!({
            "message_type": "DiscoveryRequest",
            "request_id": "abc",
            "client_device_id": "a",
            "client_device_name": "A",
        });
        client
            .send_to(request.to_string().as_bytes(), ("127.0.0.1", port))
            .await
            .unwrap();

        let mut buf = [0u8; 2048];
        let (len, _) = tokio::time::timeout(std::time::Duration::from_secs(2), client.recv_from(&mut buf))
            .await
            .expect("response expected")
            .unwrap();
        let response: DiscoveryResponse = serde_json::from_slice(&buf[..len]).unwrap();
        assert_eq!(response.message_type, "DiscoveryResponse");
        assert_eq!(response.request_id, "abc");
        assert_eq!(response.tcp_port, 15555);
        assert_eq!(response.server_name, "PC");
        assert_eq!(response.server_version, "1.0.0");
        assert!(!response.websocket_supported);
    }

    #[tokio::test]
    async fn drops_datagrams_without_the_type_marker() {
        let responder = DiscoveryResponder::bind(test_config()).unwrap();
        let port = responder.local_port().unwrap();
        let (_guard, cancel) = Shutdown::channel();
        tokio::spawn(responder.run(cancel));

        let client = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        for bogus in [&b"not json at all"[..], br#"{"request_id":"x"}"#] {
            client.send_to(bogus, ("127.0.0.1", port)).await.unwrap();
        }
        // And one valid one after the garbage: the loop must still serve.
        let request = json!({"message_type": "DiscoveryRequest", "request_id": "later"});
        client
            .send_to(request.to_string().as_bytes(), ("127.0.0.1", port))
            .await
            .unwrap();

        let mut buf = [0u8; 2048];
        let (len, _) = tokio::time::timeout(std::time::Duration::from_secs(2), client.recv_from(&mut buf))
            .await
            .expect("the valid request deserves a reply")
            .unwrap();
        let response: DiscoveryResponse = serde_json::from_slice(&buf[..len]).unwrap();
        assert_eq!(response.request_id, "later");
    }

    #[tokio::test]
    async fn cancellation_stops_the_loop() {
        let responder = DiscoveryResponder::bind(test_config()).unwrap();
        let (guard, cancel) = Shutdown::channel();
        let task = tokio::spawn(responder.run(cancel));
        guard.trigger();
        tokio::time::timeout(std::time::Duration::from_secs(1), task)
            .await
            .expect("loop should exit on cancel")
            .unwrap();
    }
}
