//! KNXnet/IP frame parsing and encoding.
//!
//! Every KNXnet/IP datagram starts with a fixed 6 byte header followed by a
//! service specific body. Parsing borrows from the receive buffer; building
//! produces an owned `Vec<u8>` ready to hand to the socket.

use std::net::SocketAddrV4;

use crate::error::ProtocolError;
use crate::protocol::constants::{
    ServiceType, HEADER_SIZE_10, IPV4_UDP, KNXNETIP_VERSION_10, MAX_FRAME_SIZE,
};

/// KNXnet/IP frame header (6 bytes).
///
/// ```text
/// ┌──────────────┬──────────────┬─────────────────────┐
/// │ Header Len   │ Protocol Ver │  Service Type ID    │
/// │   (1 byte)   │   (1 byte)   │     (2 bytes)       │
/// ├──────────────┴──────────────┴─────────────────────┤
/// │           Total Length (2 bytes)                  │
/// └───────────────────────────────────────────────────┘
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct KnxnetIpHeader {
    /// Service type identifier
    pub service_type: ServiceType,
    /// Total length of frame (header + body)
    pub total_length: u16,
}

impl KnxnetIpHeader {
    /// Size of the header in bytes.
    pub const SIZE: usize = 6;

    /// Parse a header from a byte slice.
    pub fn parse(data: &[u8]) -> Result<Self, ProtocolError> {
        if data.len() < Self::SIZE {
            return Err(ProtocolError::ShortFrame);
        }
        if data[0] != HEADER_SIZE_10 {
            return Err(ProtocolError::InvalidFrame);
        }
        if data[1] != KNXNETIP_VERSION_10 {
            return Err(ProtocolError::UnsupportedVersion);
        }

        let service_type_raw = u16::from_be_bytes([data[2], data[3]]);
        let service_type = ServiceType::from_u16(service_type_raw)
            .ok_or(ProtocolError::UnsupportedServiceType(service_type_raw))?;
        let total_length = u16::from_be_bytes([data[4], data[5]]);

        Ok(Self {
            service_type,
            total_length,
        })
    }
}

/// Borrowed view of a complete KNXnet/IP frame.
#[derive(Debug)]
pub struct KnxnetIpFrame<'a> {
    data: &'a [u8],
    header: KnxnetIpHeader,
}

impl<'a> KnxnetIpFrame<'a> {
    /// Parse a KNXnet/IP frame from a byte slice.
    pub fn parse(data: &'a [u8]) -> Result<Self, ProtocolError> {
        let header = KnxnetIpHeader::parse(data)?;
        if data.len() < header.total_length as usize {
            return Err(ProtocolError::ShortFrame);
        }
        Ok(Self { data, header })
    }

    /// The service type, used to route the frame.
    #[inline]
    pub const fn service_type(&self) -> ServiceType {
        self.header.service_type
    }

    /// The body after the 6 byte header.
    #[inline]
    pub fn body(&self) -> &'a [u8] {
        &self.data[KnxnetIpHeader::SIZE..self.header.total_length as usize]
    }
}

/// Build a complete frame from a service type and its body.
pub fn build_frame(service_type: ServiceType, body: &[u8]) -> Vec<u8> {
    let total = KnxnetIpHeader::SIZE + body.len();
    debug_assert!(total <= MAX_FRAME_SIZE);

    let mut frame = Vec::with_capacity(total);
    frame.push(HEADER_SIZE_10);
    frame.push(KNXNETIP_VERSION_10);
    frame.extend_from_slice(&service_type.to_u16().to_be_bytes());
    frame.extend_from_slice(&(total as u16).to_be_bytes());
    frame.extend_from_slice(body);
    frame
}

/// Host Protocol Address Information (HPAI).
///
/// Endpoint descriptor (IPv4 address and UDP port) used in connection
/// management. The all zero form announces NAT traversal mode: the gateway
/// replies to the source address of the datagram.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Hpai {
    /// IPv4 address (4 bytes)
    pub ip_address: [u8; 4],
    /// UDP port
    pub port: u16,
}

impl Hpai {
    /// Size of the HPAI structure for IPv4 UDP.
    pub const SIZE: usize = 8;

    /// NAT mode endpoint (0.0.0.0:0).
    pub const UNSPECIFIED: Self = Self {
        ip_address: [0, 0, 0, 0],
        port: 0,
    };

    /// Create a new HPAI for IPv4 UDP.
    pub const fn new(ip_address: [u8; 4], port: u16) -> Self {
        Self { ip_address, port }
    }

    /// Parse an HPAI from bytes.
    pub fn parse(data: &[u8]) -> Result<Self, ProtocolError> {
        if data.len() < Self::SIZE {
            return Err(ProtocolError::ShortFrame);
        }
        if data[0] != Self::SIZE as u8 {
            return Err(ProtocolError::InvalidFrame);
        }
        Ok(Self {
            ip_address: [data[2], data[3], data[4], data[5]],
            port: u16::from_be_bytes([data[6], data[7]]),
        })
    }

    /// Append the encoded HPAI to a buffer.
    pub fn encode_into(&self, buf: &mut Vec<u8>) {
        buf.push(Self::SIZE as u8);
        buf.push(IPV4_UDP);
        buf.extend_from_slice(&self.ip_address);
        buf.extend_from_slice(&self.port.to_be_bytes());
    }
}

impl From<SocketAddrV4> for Hpai {
    fn from(addr: SocketAddrV4) -> Self {
        Self::new(addr.ip().octets(), addr.port())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_header_parse() {
        let data = [0x06, 0x10, 0x04, 0x20, 0x00, 0x0E];
        let header = KnxnetIpHeader::parse(&data).unwrap();
        assert_eq!(header.service_type, ServiceType::TunnellingRequest);
        assert_eq!(header.total_length, 14);
    }

    #[test]
    fn test_header_rejects_bad_version() {
        let data = [0x06, 0x20, 0x04, 0x20, 0x00, 0x0E];
        assert_eq!(
            KnxnetIpHeader::parse(&data),
            Err(ProtocolError::UnsupportedVersion)
        );
    }

    #[test]
    fn test_header_rejects_unknown_service() {
        let data = [0x06, 0x10, 0xBE, 0xEF, 0x00, 0x0E];
        assert_eq!(
            KnxnetIpHeader::parse(&data),
            Err(ProtocolError::UnsupportedServiceType(0xBEEF))
        );
    }

    #[test]
    fn test_frame_parse_body() {
        let frame = build_frame(ServiceType::RoutingIndication, &[0x01, 0x02, 0x03]);
        let parsed = KnxnetIpFrame::parse(&frame).unwrap();
        assert_eq!(parsed.service_type(), ServiceType::RoutingIndication);
        assert_eq!(parsed.body(), &[0x01, 0x02, 0x03]);
    }

    #[test]
    fn test_frame_truncated() {
        let mut frame = build_frame(ServiceType::RoutingIndication, &[0x01, 0x02, 0x03]);
        frame.truncate(7);
        assert_eq!(
            KnxnetIpFrame::parse(&frame).unwrap_err(),
            ProtocolError::ShortFrame
        );
    }

    #[test]
    fn test_build_frame_header() {
        let frame = build_frame(ServiceType::ConnectRequest, &[0u8; 20]);
        assert_eq!(frame[0], 0x06);
        assert_eq!(frame[1], 0x10);
        assert_eq!(u16::from_be_bytes([frame[2], frame[3]]), 0x0205);
        assert_eq!(u16::from_be_bytes([frame[4], frame[5]]), 26);
        assert_eq!(frame.len(), 26);
    }

    #[test]
    fn test_hpai_round_trip() {
        let hpai = Hpai::new([192, 168, 1, 10], 3671);
        let mut buf = Vec::new();
        hpai.encode_into(&mut buf);
        assert_eq!(buf.len(), Hpai::SIZE);
        assert_eq!(Hpai::parse(&buf).unwrap(), hpai);
    }

    #[test]
    fn test_hpai_from_socket_addr() {
        let addr: SocketAddrV4 = "192.168.1.5:3671".parse().unwrap();
        let hpai = Hpai::from(addr);
        assert_eq!(hpai.ip_address, [192, 168, 1, 5]);
        assert_eq!(hpai.port, 3671);
    }
}
