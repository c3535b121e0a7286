//! KNXnet/IP tunneling client.
//!
//! Point-to-point connection to a KNX gateway over unicast UDP. The client
//! owns the full connection lifecycle: CONNECT/DISCONNECT, the
//! CONNECTIONSTATE heartbeat, and reliable delivery of TUNNELING_REQUEST
//! frames with ACK, retransmission and wrapping sequence counters.
//!
//! A receive task demultiplexes everything arriving from the gateway:
//! tunneling indications become [`GroupEvent`]s on the inbound channel,
//! acknowledgements and heartbeat responses are routed to the sender and the
//! heartbeat task. When the gateway disconnects, the heartbeat fails, or the
//! client is closed, the shared cancellation token tears everything down and
//! the inbound channel ends.

use std::net::SocketAddr;
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::net::UdpSocket;
use tokio::sync::mpsc;
use tokio::time::{sleep_until, timeout, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

use crate::config::TunnelConfig;
use crate::error::{ConnectError, SendError};
use crate::protocol::constants::{
    CemiMessageCode, ServiceType, E_NO_ERROR, MAX_CEMI_DATA, MAX_FRAME_SIZE,
};
use crate::protocol::frame::{build_frame, Hpai, KnxnetIpFrame};
use crate::protocol::services::{
    ConnectRequest, ConnectResponse, ConnectionHeader, ConnectionStateRequest,
    ConnectionStateResponse, DisconnectRequest, TunnelingAck, TunnelingRequest,
};

use super::{GroupClient, GroupEvent};

/// Depth of the inbound event channel.
const INBOUND_BUFFER: usize = 32;

/// Sequence counter and ACK backchannel, serialized across senders.
struct SendState {
    sequence: u8,
    ack_rx: mpsc::Receiver<u8>,
}

/// Tunneling realization of the [`GroupClient`] port.
pub struct TunnelClient {
    socket: Arc<UdpSocket>,
    endpoint: String,
    channel_id: u8,
    control_endpoint: Hpai,
    config: TunnelConfig,
    sender: tokio::sync::Mutex<SendState>,
    inbound: Mutex<Option<mpsc::Receiver<GroupEvent>>>,
    shutdown: CancellationToken,
}

impl std::fmt::Debug for TunnelClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TunnelClient")
            .field("endpoint", &self.endpoint)
            .field("channel_id", &self.channel_id)
            .finish_non_exhaustive()
    }
}

impl TunnelClient {
    /// Connect to a gateway and establish a link layer tunnel.
    ///
    /// # Errors
    ///
    /// Fails when the endpoint does not resolve, the gateway does not answer
    /// within `response_timeout`, or it refuses the connection.
    pub async fn connect(endpoint: &str, config: TunnelConfig) -> Result<Self, ConnectError> {
        if config.use_tcp {
            return Err(ConnectError::TcpUnsupported);
        }

        let gateway = tokio::net::lookup_host(endpoint)
            .await
            .map_err(|source| ConnectError::Io {
                endpoint: endpoint.to_owned(),
                source,
            })?
            .find(SocketAddr::is_ipv4)
            .ok_or_else(|| ConnectError::InvalidEndpoint(endpoint.to_owned()))?;

        let socket = UdpSocket::bind("0.0.0.0:0")
            .await
            .map_err(|source| ConnectError::Io {
                endpoint: endpoint.to_owned(),
                source,
            })?;
        socket
            .connect(gateway)
            .await
            .map_err(|source| ConnectError::Io {
                endpoint: endpoint.to_owned(),
                source,
            })?;

        // A socket bound to the wildcard address reports 0.0.0.0, which is
        // also the NAT mode marker, so that case degrades gracefully.
        let control_endpoint = if config.send_local_address {
            match socket.local_addr() {
                Ok(SocketAddr::V4(addr)) => Hpai::from(addr),
                _ => Hpai::UNSPECIFIED,
            }
        } else {
            Hpai::UNSPECIFIED
        };

        let request = ConnectRequest::new(control_endpoint, control_endpoint).to_frame();
        socket.send(&request).await.map_err(|source| ConnectError::Io {
            endpoint: endpoint.to_owned(),
            source,
        })?;

        let response = await_connect_response(&socket, endpoint, &config).await?;
        if !response.is_ok() {
            return Err(ConnectError::Refused {
                endpoint: endpoint.to_owned(),
                status: response.status,
            });
        }
        debug!(
            endpoint,
            channel_id = response.channel_id,
            "tunnel connection established"
        );

        let socket = Arc::new(socket);
        let shutdown = CancellationToken::new();
        let (event_tx, event_rx) = mpsc::channel(INBOUND_BUFFER);
        let (ack_tx, ack_rx) = mpsc::channel(16);
        let (pong_tx, pong_rx) = mpsc::channel(4);

        tokio::spawn(receive_loop(
            Arc::clone(&socket),
            response.channel_id,
            event_tx,
            ack_tx,
            pong_tx,
            shutdown.clone(),
        ));
        tokio::spawn(heartbeat_loop(
            Arc::clone(&socket),
            response.channel_id,
            control_endpoint,
            config.clone(),
            pong_rx,
            shutdown.clone(),
        ));

        Ok(Self {
            socket,
            endpoint: endpoint.to_owned(),
            channel_id: response.channel_id,
            control_endpoint,
            config,
            sender: tokio::sync::Mutex::new(SendState {
                sequence: 0,
                ack_rx,
            }),
            inbound: Mutex::new(Some(event_rx)),
            shutdown,
        })
    }
}

#[async_trait]
impl GroupClient for TunnelClient {
    async fn send(&self, event: GroupEvent) -> Result<(), SendError> {
        if self.shutdown.is_cancelled() {
            return Err(SendError::Closed);
        }
        if event.data.len() > MAX_CEMI_DATA {
            return Err(SendError::PayloadTooLarge);
        }

        let mut sender = self.sender.lock().await;
        let state = &mut *sender;
        // Drop acknowledges of earlier, already completed sends.
        while state.ack_rx.try_recv().is_ok() {}

        let sequence = state.sequence;
        let cemi = event.to_cemi(CemiMessageCode::LDataReq);
        let frame =
            TunnelingRequest::new(ConnectionHeader::new(self.channel_id, sequence), &cemi)
                .to_frame();

        let deadline = Instant::now() + self.config.response_timeout;
        loop {
            self.socket.send(&frame).await?;
            let resend_at = Instant::now() + self.config.resend_interval;

            let acked = loop {
                let result = tokio::select! {
                    ack = state.ack_rx.recv() => Some(ack),
                    () = sleep_until(resend_at.min(deadline)) => None,
                };
                match result {
                    Some(None) => return Err(SendError::Closed),
                    Some(Some(seq)) if seq == sequence => break true,
                    Some(Some(seq)) => {
                        trace!(seq, expected = sequence, "stale tunneling ack");
                    }
                    None => break false,
                }
            };

            if acked {
                state.sequence = sequence.wrapping_add(1);
                return Ok(());
            }
            if Instant::now() >= deadline {
                return Err(SendError::AckTimeout(self.config.response_timeout));
            }
        }
    }

    fn inbound(&self) -> Option<mpsc::Receiver<GroupEvent>> {
        self.inbound.lock().take()
    }

    async fn close(&self) {
        if self.shutdown.is_cancelled() {
            return;
        }
        let request = DisconnectRequest::new(self.channel_id, self.control_endpoint).to_frame();
        if let Err(e) = self.socket.send(&request).await {
            debug!(error = %e, "disconnect request failed");
        }
        self.shutdown.cancel();
    }
}

/// Wait for the CONNECT_RESPONSE, ignoring unrelated frames.
async fn await_connect_response(
    socket: &UdpSocket,
    endpoint: &str,
    config: &TunnelConfig,
) -> Result<ConnectResponse, ConnectError> {
    let deadline = Instant::now() + config.response_timeout;
    let mut buf = [0u8; MAX_FRAME_SIZE];

    loop {
        let remaining = deadline
            .checked_duration_since(Instant::now())
            .ok_or_else(|| ConnectError::Timeout {
                endpoint: endpoint.to_owned(),
                timeout: config.response_timeout,
            })?;

        let n = match timeout(remaining, socket.recv(&mut buf)).await {
            Err(_) => {
                return Err(ConnectError::Timeout {
                    endpoint: endpoint.to_owned(),
                    timeout: config.response_timeout,
                })
            }
            Ok(Err(source)) => {
                return Err(ConnectError::Io {
                    endpoint: endpoint.to_owned(),
                    source,
                })
            }
            Ok(Ok(n)) => n,
        };

        if let Ok(frame) = KnxnetIpFrame::parse(&buf[..n]) {
            if frame.service_type() == ServiceType::ConnectResponse {
                return Ok(ConnectResponse::parse(frame.body())?);
            }
            trace!(service = ?frame.service_type(), "ignoring frame during connect");
        }
    }
}

/// Demultiplex everything arriving from the gateway.
async fn receive_loop(
    socket: Arc<UdpSocket>,
    channel_id: u8,
    event_tx: mpsc::Sender<GroupEvent>,
    ack_tx: mpsc::Sender<u8>,
    pong_tx: mpsc::Sender<u8>,
    shutdown: CancellationToken,
) {
    let mut recv_sequence: u8 = 0;
    let mut buf = [0u8; MAX_FRAME_SIZE];

    loop {
        let n = tokio::select! {
            () = shutdown.cancelled() => break,
            result = socket.recv(&mut buf) => match result {
                Ok(n) => n,
                Err(e) => {
                    warn!(error = %e, "tunnel receive failed");
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
            ServiceType::TunnellingRequest => {
                let Ok(request) = TunnelingRequest::parse(frame.body()) else {
                    continue;
                };
                if request.connection_header.channel_id != channel_id {
                    continue;
                }
                let sequence = request.connection_header.sequence_counter;

                // Re-delivery of the previous frame is acknowledged again but
                // not processed; anything else out of order is dropped
                // without an ACK so the gateway repeats it.
                if sequence == recv_sequence.wrapping_sub(1) {
                    send_ack(&socket, channel_id, sequence).await;
                    continue;
                }
                if sequence != recv_sequence {
                    trace!(
                        sequence,
                        expected = recv_sequence,
                        "out of order tunneling request"
                    );
                    continue;
                }

                recv_sequence = recv_sequence.wrapping_add(1);
                send_ack(&socket, channel_id, sequence).await;

                if let Some(event) = GroupEvent::from_cemi(request.cemi_data) {
                    if event_tx.send(event).await.is_err() {
                        break;
                    }
                }
            }
            ServiceType::TunnellingAck => {
                if let Ok(ack) = TunnelingAck::parse(frame.body()) {
                    if ack.connection_header.channel_id == channel_id && ack.is_ok() {
                        let _ = ack_tx.try_send(ack.connection_header.sequence_counter);
                    }
                }
            }
            ServiceType::ConnectionstateResponse => {
                if let Ok(response) = ConnectionStateResponse::parse(frame.body()) {
                    let _ = pong_tx.try_send(response.status);
                }
            }
            ServiceType::DisconnectRequest => {
                debug!("gateway requested disconnect");
                let response =
                    build_frame(ServiceType::DisconnectResponse, &[channel_id, E_NO_ERROR]);
                let _ = socket.send(&response).await;
                break;
            }
            ServiceType::DisconnectResponse => break,
            service => trace!(?service, "ignoring unexpected service"),
        }
    }

    // Ending this task closes the inbound stream and stops the heartbeat.
    shutdown.cancel();
}

async fn send_ack(socket: &UdpSocket, channel_id: u8, sequence: u8) {
    let ack = TunnelingAck::new(ConnectionHeader::new(channel_id, sequence), E_NO_ERROR);
    if let Err(e) = socket.send(&ack.to_frame()).await {
        warn!(error = %e, "can not acknowledge tunneling request");
    }
}

/// Periodic CONNECTIONSTATE probe. A missing or negative answer tears the
/// connection down.
async fn heartbeat_loop(
    socket: Arc<UdpSocket>,
    channel_id: u8,
    control_endpoint: Hpai,
    config: TunnelConfig,
    mut pong_rx: mpsc::Receiver<u8>,
    shutdown: CancellationToken,
) {
    let request = ConnectionStateRequest::new(channel_id, control_endpoint).to_frame();
    let mut next = Instant::now() + config.heartbeat_interval;

    loop {
        tokio::select! {
            () = shutdown.cancelled() => return,
            () = sleep_until(next) => {}
        }
        next = Instant::now() + config.heartbeat_interval;

        while pong_rx.try_recv().is_ok() {}
        if socket.send(&request).await.is_err() {
            break;
        }

        match timeout(config.response_timeout, pong_rx.recv()).await {
            Ok(Some(0)) => {}
            Ok(Some(status)) => {
                warn!(status, "gateway reports unhealthy connection state");
                break;
            }
            Ok(None) => return,
            Err(_) => {
                warn!(
                    timeout = ?config.response_timeout,
                    "gateway heartbeat timed out"
                );
                break;
            }
        }
    }

    shutdown.cancel();
}
