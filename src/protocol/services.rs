//! KNXnet/IP service bodies for connection management and tunneling.
//!
//! Builders produce complete frames (header included) ready for the socket;
//! parsers take the frame body as sliced out by
//! [`KnxnetIpFrame::body`](crate::protocol::frame::KnxnetIpFrame::body).
//!
//! ## Protocol flow
//!
//! ```text
//! Client                          Gateway
//!   |                                |
//!   |------- CONNECT_REQUEST ------->|
//!   |<------ CONNECT_RESPONSE -------|
//!   |                                |
//!   |------ TUNNELING_REQUEST ------>|
//!   |<------ TUNNELING_ACK ----------|
//!   |                                |
//!   |--- CONNECTIONSTATE_REQUEST --->|  (heartbeat)
//!   |<-- CONNECTIONSTATE_RESPONSE ---|
//!   |                                |
//!   |------ DISCONNECT_REQUEST ----->|
//!   |<----- DISCONNECT_RESPONSE -----|
//! ```

use crate::error::ProtocolError;
use crate::protocol::constants::{ServiceType, TUNNEL_CONNECTION, TUNNEL_LINKLAYER};
use crate::protocol::frame::{build_frame, Hpai};

/// `CONNECT_REQUEST` (0x0205).
#[derive(Debug, Clone, Copy)]
pub struct ConnectRequest {
    /// Control endpoint for connection management
    pub control_endpoint: Hpai,
    /// Data endpoint for tunneling data
    pub data_endpoint: Hpai,
}

impl ConnectRequest {
    /// Create a new `CONNECT_REQUEST` for a link layer tunnel.
    pub const fn new(control_endpoint: Hpai, data_endpoint: Hpai) -> Self {
        Self {
            control_endpoint,
            data_endpoint,
        }
    }

    /// Build the complete frame.
    pub fn to_frame(&self) -> Vec<u8> {
        let mut body = Vec::with_capacity(2 * Hpai::SIZE + 4);
        self.control_endpoint.encode_into(&mut body);
        self.data_endpoint.encode_into(&mut body);
        // Connection request information block
        body.push(4);
        body.push(TUNNEL_CONNECTION);
        body.push(TUNNEL_LINKLAYER);
        body.push(0x00); // reserved
        build_frame(ServiceType::ConnectRequest, &body)
    }
}

/// `CONNECT_RESPONSE` (0x0206).
#[derive(Debug, Clone, Copy)]
pub struct ConnectResponse {
    /// Communication channel ID assigned by the gateway
    pub channel_id: u8,
    /// Status code (0 = OK)
    pub status: u8,
}

impl ConnectResponse {
    /// Parse from a frame body.
    pub fn parse(body: &[u8]) -> Result<Self, ProtocolError> {
        if body.len() < 2 {
            return Err(ProtocolError::ShortFrame);
        }
        Ok(Self {
            channel_id: body[0],
            status: body[1],
        })
    }

    /// Check if the connection was accepted.
    pub const fn is_ok(&self) -> bool {
        self.status == 0
    }
}

/// `CONNECTIONSTATE_REQUEST` (0x0207), the tunnel heartbeat.
#[derive(Debug, Clone, Copy)]
pub struct ConnectionStateRequest {
    /// Communication channel ID
    pub channel_id: u8,
    /// Control endpoint
    pub control_endpoint: Hpai,
}

impl ConnectionStateRequest {
    /// Create a new `CONNECTIONSTATE_REQUEST`.
    pub const fn new(channel_id: u8, control_endpoint: Hpai) -> Self {
        Self {
            channel_id,
            control_endpoint,
        }
    }

    /// Build the complete frame.
    pub fn to_frame(&self) -> Vec<u8> {
        let mut body = Vec::with_capacity(2 + Hpai::SIZE);
        body.push(self.channel_id);
        body.push(0x00); // reserved
        self.control_endpoint.encode_into(&mut body);
        build_frame(ServiceType::ConnectionstateRequest, &body)
    }
}

/// `CONNECTIONSTATE_RESPONSE` (0x0208).
#[derive(Debug, Clone, Copy)]
pub struct ConnectionStateResponse {
    /// Communication channel ID
    pub channel_id: u8,
    /// Status code (0 = OK)
    pub status: u8,
}

impl ConnectionStateResponse {
    /// Parse from a frame body.
    pub fn parse(body: &[u8]) -> Result<Self, ProtocolError> {
        if body.len() < 2 {
            return Err(ProtocolError::ShortFrame);
        }
        Ok(Self {
            channel_id: body[0],
            status: body[1],
        })
    }

    /// Check if the connection is still alive.
    pub const fn is_ok(&self) -> bool {
        self.status == 0
    }
}

/// `DISCONNECT_REQUEST` (0x0209).
#[derive(Debug, Clone, Copy)]
pub struct DisconnectRequest {
    /// Communication channel ID
    pub channel_id: u8,
    /// Control endpoint
    pub control_endpoint: Hpai,
}

impl DisconnectRequest {
    /// Create a new `DISCONNECT_REQUEST`.
    pub const fn new(channel_id: u8, control_endpoint: Hpai) -> Self {
        Self {
            channel_id,
            control_endpoint,
        }
    }

    /// Build the complete frame.
    pub fn to_frame(&self) -> Vec<u8> {
        let mut body = Vec::with_capacity(2 + Hpai::SIZE);
        body.push(self.channel_id);
        body.push(0x00); // reserved
        self.control_endpoint.encode_into(&mut body);
        build_frame(ServiceType::DisconnectRequest, &body)
    }
}

/// Connection header preceding tunneling bodies.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConnectionHeader {
    /// Communication channel ID
    pub channel_id: u8,
    /// Sequence counter, wrapping at 256
    pub sequence_counter: u8,
}

impl ConnectionHeader {
    /// Size of the connection header in bytes.
    pub const SIZE: usize = 4;

    /// Create a new connection header.
    pub const fn new(channel_id: u8, sequence_counter: u8) -> Self {
        Self {
            channel_id,
            sequence_counter,
        }
    }

    /// Append the encoded header to a buffer.
    pub fn encode_into(&self, buf: &mut Vec<u8>) {
        buf.push(Self::SIZE as u8);
        buf.push(self.channel_id);
        buf.push(self.sequence_counter);
        buf.push(0x00); // reserved
    }

    /// Decode from bytes.
    pub fn decode(data: &[u8]) -> Result<Self, ProtocolError> {
        if data.len() < Self::SIZE {
            return Err(ProtocolError::ShortFrame);
        }
        Ok(Self {
            channel_id: data[1],
            sequence_counter: data[2],
        })
    }
}

/// `TUNNELING_REQUEST` (0x0420).
#[derive(Debug)]
pub struct TunnelingRequest<'a> {
    /// Connection header
    pub connection_header: ConnectionHeader,
    /// cEMI frame data
    pub cemi_data: &'a [u8],
}

impl<'a> TunnelingRequest<'a> {
    /// Create a new `TUNNELING_REQUEST`.
    pub const fn new(connection_header: ConnectionHeader, cemi_data: &'a [u8]) -> Self {
        Self {
            connection_header,
            cemi_data,
        }
    }

    /// Build the complete frame.
    pub fn to_frame(&self) -> Vec<u8> {
        let mut body = Vec::with_capacity(ConnectionHeader::SIZE + self.cemi_data.len());
        self.connection_header.encode_into(&mut body);
        body.extend_from_slice(self.cemi_data);
        build_frame(ServiceType::TunnellingRequest, &body)
    }

    /// Parse from a frame body.
    pub fn parse(body: &'a [u8]) -> Result<Self, ProtocolError> {
        let connection_header = ConnectionHeader::decode(body)?;
        Ok(Self {
            connection_header,
            cemi_data: &body[ConnectionHeader::SIZE..],
        })
    }
}

/// `TUNNELING_ACK` (0x0421).
#[derive(Debug, Clone, Copy)]
pub struct TunnelingAck {
    /// Connection header
    pub connection_header: ConnectionHeader,
    /// Status code (0 = OK)
    pub status: u8,
}

impl TunnelingAck {
    /// Create a new `TUNNELING_ACK`.
    pub const fn new(connection_header: ConnectionHeader, status: u8) -> Self {
        Self {
            connection_header,
            status,
        }
    }

    /// Build the complete frame.
    pub fn to_frame(&self) -> Vec<u8> {
        let mut body = Vec::with_capacity(ConnectionHeader::SIZE + 1);
        self.connection_header.encode_into(&mut body);
        body.push(self.status);
        build_frame(ServiceType::TunnellingAck, &body)
    }

    /// Parse from a frame body.
    pub fn parse(body: &[u8]) -> Result<Self, ProtocolError> {
        let connection_header = ConnectionHeader::decode(body)?;
        if body.len() < ConnectionHeader::SIZE + 1 {
            return Err(ProtocolError::ShortFrame);
        }
        Ok(Self {
            connection_header,
            status: body[ConnectionHeader::SIZE],
        })
    }

    /// Check if the request was acknowledged successfully.
    pub const fn is_ok(&self) -> bool {
        self.status == 0
    }
}
