//! KNXnet/IP routing client.
//!
//! Connectionless multicast transport: every router on the installation
//! multicasts ROUTING_INDICATION frames to the well known group (usually
//! 224.0.23.12:3671). There is no handshake, no heartbeat and no ACK; flow
//! control on the wire is a mandatory pause after every send.

use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use socket2::{Domain, Protocol, Socket, Type};
use tokio::net::UdpSocket;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

use crate::config::RouterConfig;
use crate::error::{ConnectError, SendError};
use crate::protocol::constants::{CemiMessageCode, ServiceType, MAX_CEMI_DATA, MAX_FRAME_SIZE};
use crate::protocol::frame::{build_frame, KnxnetIpFrame};

use super::{GroupClient, GroupEvent};

/// Routing realization of the [`GroupClient`] port.
pub struct RouterClient {
    socket: Arc<UdpSocket>,
    group: SocketAddrV4,
    config: RouterConfig,
    /// Serializes sends and carries the post-send pause between them.
    send_lock: tokio::sync::Mutex<()>,
    inbound: Mutex<Option<mpsc::Receiver<GroupEvent>>>,
    shutdown: CancellationToken,
}

impl std::fmt::Debug for RouterClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RouterClient")
            .field("group", &self.group)
            .finish_non_exhaustive()
    }
}

impl RouterClient {
    /// Join the multicast group and start listening for indications.
    ///
    /// # Errors
    ///
    /// Fails when the endpoint is not a multicast `group:port` or the group
    /// can not be joined on the selected interface.
    pub async fn connect(endpoint: &str, config: RouterConfig) -> Result<Self, ConnectError> {
        let group: SocketAddrV4 = endpoint
            .parse()
            .map_err(|_| ConnectError::InvalidEndpoint(endpoint.to_owned()))?;
        if !group.ip().is_multicast() {
            return Err(ConnectError::InvalidEndpoint(endpoint.to_owned()));
        }
        let interface = config.interface.unwrap_or(Ipv4Addr::UNSPECIFIED);

        let io_err = |source: std::io::Error| ConnectError::Io {
            endpoint: endpoint.to_owned(),
            source,
        };

        // Several exporters may share one host, so the port is bound with
        // address reuse before joining the group.
        let socket = Socket::new(Domain::IPV4, Type::DGRAM, Some(Protocol::UDP)).map_err(io_err)?;
        socket.set_reuse_address(true).map_err(io_err)?;
        socket
            .bind(&SocketAddr::from(SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, group.port())).into())
            .map_err(io_err)?;
        socket
            .join_multicast_v4(group.ip(), &interface)
            .map_err(io_err)?;
        socket
            .set_multicast_loop_v4(config.multicast_loopback_enabled)
            .map_err(io_err)?;
        socket.set_nonblocking(true).map_err(io_err)?;

        let socket = UdpSocket::from_std(socket.into()).map_err(io_err)?;
        debug!(endpoint, %interface, "joined routing multicast group");

        let socket = Arc::new(socket);
        let shutdown = CancellationToken::new();
        let (event_tx, event_rx) = mpsc::channel(config.retain_count.max(1));

        tokio::spawn(receive_loop(
            Arc::clone(&socket),
            event_tx,
            shutdown.clone(),
        ));

        Ok(Self {
            socket,
            group,
            config,
            send_lock: tokio::sync::Mutex::new(()),
            inbound: Mutex::new(Some(event_rx)),
            shutdown,
        })
    }
}

#[async_trait]
impl GroupClient for RouterClient {
    async fn send(&self, event: GroupEvent) -> Result<(), SendError> {
        if self.shutdown.is_cancelled() {
            return Err(SendError::Closed);
        }
        if event.data.len() > MAX_CEMI_DATA {
            return Err(SendError::PayloadTooLarge);
        }

        let _guard = self.send_lock.lock().await;
        let cemi = event.to_cemi(CemiMessageCode::LDataInd);
        let frame = build_frame(ServiceType::RoutingIndication, &cemi);
        self.socket.send_to(&frame, SocketAddr::V4(self.group)).await?;

        // Routers are store-and-forward devices with tiny queues; the pause
        // after each send is required by the routing profile.
        tokio::time::sleep(self.config.post_send_pause_duration).await;
        Ok(())
    }

    fn inbound(&self) -> Option<mpsc::Receiver<GroupEvent>> {
        self.inbound.lock().take()
    }

    async fn close(&self) {
        self.shutdown.cancel();
    }
}

/// Turn incoming ROUTING_INDICATION frames into group events.
async fn receive_loop(
    socket: Arc<UdpSocket>,
    event_tx: mpsc::Sender<GroupEvent>,
    shutdown: CancellationToken,
) {
    let mut buf = [0u8; MAX_FRAME_SIZE];

    loop {
        let n = tokio::select! {
            () = shutdown.cancelled() => break,
            result = socket.recv(&mut buf) => match result {
                Ok(n) => n,
                Err(e) => {
                    warn!(error = %e, "routing receive failed");
                    break;
                }
            },
        };

        let frame = match KnxnetIpFrame::parse(&buf[..n]) {
            Ok(frame) => frame,
            Err(e) => {
                trace!(error = %e, "ignoring malformed frame");
                continue;
            }
        };

        match frame.service_type() {
            ServiceType::RoutingIndication => {
                if let Some(event) = GroupEvent::from_cemi(frame.body()) {
                    if event_tx.send(event).await.is_err() {
                        break;
                    }
                }
            }
            ServiceType::RoutingLostMessage => {
                // A router dropped frames; the values will come around again.
                warn!("router reports lost messages");
            }
            ServiceType::RoutingBusy => trace!("router busy indication"),
            service => trace!(?service, "ignoring unexpected service"),
        }
    }

    shutdown.cancel();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_connect_rejects_unicast_endpoint() {
        let result = RouterClient::connect("127.0.0.1:3671", RouterConfig::default()).await;
        assert!(matches!(result, Err(ConnectError::InvalidEndpoint(_))));
    }

    #[tokio::test]
    async fn test_connect_rejects_garbage_endpoint() {
        let result = RouterClient::connect("not-an-endpoint", RouterConfig::default()).await;
        assert!(matches!(result, Err(ConnectError::InvalidEndpoint(_))));
    }
}
