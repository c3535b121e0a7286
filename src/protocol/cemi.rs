//! Common External Message Interface (cEMI).
//!
//! cEMI encapsulates KNX telegrams within KNXnet/IP frames. Both the tunnel
//! and the router client exchange `L_Data` frames: indications carry values
//! observed on the bus, requests carry the exporter's own read telegrams.
//!
//! ## Frame structure
//!
//! ```text
//! ┌──────────────────────────────────────────┐
//! │ Message Code (1 byte)                    │
//! ├──────────────────────────────────────────┤
//! │ Additional Info Length (1 byte)          │
//! ├──────────────────────────────────────────┤
//! │ Additional Info (variable)               │
//! ├──────────────────────────────────────────┤
//! │ Service Information (L_Data)             │
//! │  ├─ Control Field 1 (1 byte)             │
//! │  ├─ Control Field 2 (1 byte)             │
//! │  ├─ Source Address (2 bytes)             │
//! │  ├─ Destination Address (2 bytes)        │
//! │  ├─ NPDU Length (1 byte)                 │
//! │  ├─ TPCI (1 byte)                        │
//! │  └─ APCI + data (NPDU Length bytes)      │
//! └──────────────────────────────────────────┘
//! ```
//!
//! The NPDU length counts the octets following the TPCI octet. Values of up
//! to 6 bits are embedded in the APCI octet itself; wider values follow it.

use crate::addressing::{GroupAddress, IndividualAddress};
use crate::error::ProtocolError;
use crate::protocol::constants::{CemiMessageCode, Priority};

/// Control Field 1 of an `L_Data` frame.
///
/// ```text
/// Bit 7: Frame Type (0=extended, 1=standard)
/// Bit 5: Repeat (0=repeat, 1=do not repeat)
/// Bit 4: System Broadcast (0=system, 1=broadcast)
/// Bit 3-2: Priority
/// Bit 1: Acknowledge Request
/// Bit 0: Confirm (0=no error, 1=error)
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ControlField1 {
    raw: u8,
}

impl ControlField1 {
    /// Get the raw byte value.
    #[inline]
    pub const fn raw(self) -> u8 {
        self.raw
    }

    /// Check if the frame is a standard (not extended) frame.
    #[inline]
    pub const fn is_standard_frame(self) -> bool {
        (self.raw & 0x80) != 0
    }

    /// Get the priority bits.
    #[inline]
    pub const fn priority(self) -> Priority {
        Priority::from_u8((self.raw >> 2) & 0x03)
    }
}

impl From<u8> for ControlField1 {
    #[inline]
    fn from(raw: u8) -> Self {
        Self { raw }
    }
}

impl Default for ControlField1 {
    /// Standard frame, repeat allowed, broadcast, normal priority.
    #[inline]
    fn default() -> Self {
        Self { raw: 0xBC }
    }
}

/// Control Field 2 of an `L_Data` frame.
///
/// ```text
/// Bit 7: Destination Address Type (0=individual, 1=group)
/// Bit 6-4: Hop Count (0-7)
/// Bit 3-0: Extended Frame Format (0000=standard)
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ControlField2 {
    raw: u8,
}

impl ControlField2 {
    /// Get the raw byte value.
    #[inline]
    pub const fn raw(self) -> u8 {
        self.raw
    }

    /// Check if the destination is a group address.
    #[inline]
    pub const fn is_group_address(self) -> bool {
        (self.raw & 0x80) != 0
    }

    /// Get the hop count (0-7).
    #[inline]
    pub const fn hop_count(self) -> u8 {
        (self.raw >> 4) & 0x07
    }
}

impl From<u8> for ControlField2 {
    #[inline]
    fn from(raw: u8) -> Self {
        Self { raw }
    }
}

impl Default for ControlField2 {
    /// Group address destination, hop count 6, standard format.
    #[inline]
    fn default() -> Self {
        Self { raw: 0xE0 }
    }
}

/// Transport layer control information (first NPDU octet).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Tpci {
    /// Unnumbered data packet
    UnnumberedData,
    /// Numbered data packet with sequence number
    NumberedData { sequence: u8 },
    /// Unnumbered control packet
    UnnumberedControl,
    /// Numbered control packet with sequence number
    NumberedControl { sequence: u8 },
}

impl Tpci {
    /// Parse the TPCI from the first NPDU octet.
    pub const fn from_byte(byte: u8) -> Self {
        let sequence = (byte >> 2) & 0x0F;
        match (byte >> 6) & 0x03 {
            0b00 => Self::UnnumberedData,
            0b01 => Self::NumberedData { sequence },
            0b10 => Self::UnnumberedControl,
            _ => Self::NumberedControl { sequence },
        }
    }

    /// Check if this is a data packet.
    pub const fn is_data(self) -> bool {
        matches!(self, Self::UnnumberedData | Self::NumberedData { .. })
    }
}

/// Application layer control information (group services only).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Apci {
    /// `A_GroupValue_Read`
    GroupValueRead,
    /// `A_GroupValue_Response`
    GroupValueResponse,
    /// `A_GroupValue_Write`
    GroupValueWrite,
    /// Anything else; the exporter does not act on it
    Unknown(u16),
}

impl Apci {
    /// Parse the APCI from the TPCI octet and the following octet.
    ///
    /// The APCI occupies 10 bits: the low 2 bits of the TPCI octet and the
    /// high 2 bits of the next octet; the remaining 6 bits of that octet may
    /// carry a small data value.
    pub const fn from_bytes(tpci_byte: u8, apci_byte: u8) -> Self {
        let apci = ((tpci_byte as u16 & 0x03) << 8) | (apci_byte as u16 & 0xC0);
        match apci {
            0x000 => Self::GroupValueRead,
            0x040 => Self::GroupValueResponse,
            0x080 => Self::GroupValueWrite,
            _ => Self::Unknown(apci),
        }
    }

    /// The 10-bit APCI command value.
    pub const fn to_u16(self) -> u16 {
        match self {
            Self::GroupValueRead => 0x000,
            Self::GroupValueResponse => 0x040,
            Self::GroupValueWrite => 0x080,
            Self::Unknown(val) => val,
        }
    }
}

/// Extract the 6-bit small value embedded in the APCI octet.
pub const fn extract_6bit_value(apci_byte: u8) -> u8 {
    apci_byte & 0x3F
}

/// Parsed cEMI `L_Data` frame.
#[derive(Debug, Clone)]
pub struct LDataFrame<'a> {
    /// Control field 1
    pub ctrl1: ControlField1,
    /// Control field 2
    pub ctrl2: ControlField2,
    /// Source address (always individual)
    pub source: IndividualAddress,
    /// Destination address, group or individual depending on ctrl2
    pub destination_raw: u16,
    /// TPCI of the first NPDU octet
    pub tpci: Tpci,
    /// APCI for data packets
    pub apci: Apci,
    /// The APCI octet, carrying up to 6 bits of value data
    pub apci_byte: u8,
    /// Value bytes following the APCI octet
    pub data: &'a [u8],
}

impl<'a> LDataFrame<'a> {
    /// Minimum service information size:
    /// ctrl1 + ctrl2 + source(2) + dest(2) + length + TPCI + APCI.
    pub const MIN_SIZE: usize = 9;

    /// Parse the service information part of an `L_Data` frame.
    pub fn parse(data: &'a [u8]) -> Result<Self, ProtocolError> {
        if data.len() < Self::MIN_SIZE {
            return Err(ProtocolError::ShortFrame);
        }

        let ctrl1 = ControlField1::from(data[0]);
        let ctrl2 = ControlField2::from(data[1]);
        let source = IndividualAddress::from(u16::from_be_bytes([data[2], data[3]]));
        let destination_raw = u16::from_be_bytes([data[4], data[5]]);
        let npdu_length = data[6] as usize;
        let tpci = Tpci::from_byte(data[7]);

        // The NPDU length counts the octets after the TPCI octet.
        let npdu_end = 8 + npdu_length;
        if npdu_length == 0 || data.len() < npdu_end {
            return Err(ProtocolError::InvalidFrame);
        }

        let (apci, apci_byte) = if tpci.is_data() {
            (Apci::from_bytes(data[7], data[8]), data[8])
        } else {
            (Apci::Unknown(0), 0)
        };

        Ok(Self {
            ctrl1,
            ctrl2,
            source,
            destination_raw,
            tpci,
            apci,
            apci_byte,
            data: &data[9..npdu_end],
        })
    }

    /// Get the destination as a group address, if it is one.
    #[inline]
    pub fn destination_group(&self) -> Option<GroupAddress> {
        self.ctrl2
            .is_group_address()
            .then(|| GroupAddress::from(self.destination_raw))
    }
}

/// Parsed cEMI frame: message code plus `L_Data` payload.
#[derive(Debug)]
pub struct CemiFrame<'a> {
    message_code: CemiMessageCode,
    data: &'a [u8],
}

impl<'a> CemiFrame<'a> {
    /// Minimum cEMI frame size (message code + additional info length).
    pub const MIN_SIZE: usize = 2;

    /// Parse a cEMI frame from bytes.
    pub fn parse(data: &'a [u8]) -> Result<Self, ProtocolError> {
        if data.len() < Self::MIN_SIZE {
            return Err(ProtocolError::ShortFrame);
        }
        let message_code = CemiMessageCode::from_u8(data[0])
            .ok_or(ProtocolError::InvalidMessageCode(data[0]))?;
        Ok(Self { message_code, data })
    }

    /// The message code.
    #[inline]
    pub const fn message_code(&self) -> CemiMessageCode {
        self.message_code
    }

    /// Parse the service information as an `L_Data` frame, skipping any
    /// additional information block.
    pub fn as_ldata(&self) -> Result<LDataFrame<'a>, ProtocolError> {
        let add_info_len = self.data[1] as usize;
        let service_start = 2 + add_info_len;
        if self.data.len() < service_start {
            return Err(ProtocolError::InvalidFrame);
        }
        LDataFrame::parse(&self.data[service_start..])
    }
}

/// Build a complete cEMI `L_Data` frame for a group telegram.
///
/// `data` is the APDU value: its first byte (if any) is merged into the low
/// 6 bits of the APCI octet, the rest follows verbatim. An empty `data`
/// produces a bare command, as used for `A_GroupValue_Read`.
pub fn build_ldata(
    code: CemiMessageCode,
    source: IndividualAddress,
    destination: GroupAddress,
    apci: Apci,
    data: &[u8],
) -> Vec<u8> {
    let npdu_length = data.len().max(1);
    let mut frame = Vec::with_capacity(10 + data.len());

    frame.push(code.to_u8());
    frame.push(0x00); // no additional info
    frame.push(ControlField1::default().raw());
    frame.push(ControlField2::default().raw());
    frame.extend_from_slice(&source.raw().to_be_bytes());
    frame.extend_from_slice(&destination.raw().to_be_bytes());
    frame.push(npdu_length as u8);
    frame.push(((apci.to_u16() >> 8) & 0x03) as u8); // TPCI: unnumbered data
    frame.push((apci.to_u16() & 0xC0) as u8 | data.first().map_or(0, |b| b & 0x3F));
    if data.len() > 1 {
        frame.extend_from_slice(&data[1..]);
    }
    frame
}
