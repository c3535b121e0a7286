//! The group client port.
//!
//! Everything above the wire protocol talks to the bus through
//! [`GroupClient`]: send one group event, consume the unbounded inbound
//! event stream, close. Two adapters exist, [`tunnel::TunnelClient`] for
//! point-to-point KNXnet/IP tunneling and [`router::RouterClient`] for IP
//! multicast routing; tests use [`fake::FakeGroupClient`].

pub mod fake;
pub mod router;
pub mod tunnel;

use std::fmt;

use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::addressing::{GroupAddress, IndividualAddress};
use crate::error::SendError;
use crate::protocol::cemi::{build_ldata, extract_6bit_value, Apci, CemiFrame};
use crate::protocol::constants::CemiMessageCode;

/// The application layer service of a group event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GroupEventCommand {
    /// `A_GroupValue_Read`: a query for the current value
    GroupRead,
    /// `A_GroupValue_Response`: an answer to a read
    GroupResponse,
    /// `A_GroupValue_Write`: an unsolicited value update
    GroupWrite,
}

impl fmt::Display for GroupEventCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::GroupRead => write!(f, "GroupRead"),
            Self::GroupResponse => write!(f, "GroupResponse"),
            Self::GroupWrite => write!(f, "GroupWrite"),
        }
    }
}

/// One group telegram as seen by the exporter.
///
/// `data` is the APDU value: the first byte carries the 6-bit remainder of
/// the APCI octet, wider values follow in the remaining bytes. Reads carry
/// no data.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GroupEvent {
    /// The application layer service
    pub command: GroupEventCommand,
    /// The sending device
    pub source: IndividualAddress,
    /// The logical destination
    pub destination: GroupAddress,
    /// APDU value bytes
    pub data: Vec<u8>,
}

impl GroupEvent {
    /// A read request for the given destination.
    pub fn read(source: IndividualAddress, destination: GroupAddress) -> Self {
        Self {
            command: GroupEventCommand::GroupRead,
            source,
            destination,
            data: Vec::new(),
        }
    }

    /// Convert a received cEMI `L_Data.ind` into a group event.
    ///
    /// Returns `None` for anything that is not a group addressed
    /// read/write/response indication; the exporter has no use for
    /// confirmations, individually addressed telegrams or management
    /// services.
    pub(crate) fn from_cemi(cemi_data: &[u8]) -> Option<Self> {
        let cemi = CemiFrame::parse(cemi_data).ok()?;
        if cemi.message_code() != CemiMessageCode::LDataInd {
            return None;
        }
        let ldata = cemi.as_ldata().ok()?;
        let destination = ldata.destination_group()?;

        let command = match ldata.apci {
            Apci::GroupValueRead => GroupEventCommand::GroupRead,
            Apci::GroupValueResponse => GroupEventCommand::GroupResponse,
            Apci::GroupValueWrite => GroupEventCommand::GroupWrite,
            Apci::Unknown(_) => return None,
        };

        let data = match command {
            GroupEventCommand::GroupRead => Vec::new(),
            _ => {
                let mut data = Vec::with_capacity(1 + ldata.data.len());
                data.push(extract_6bit_value(ldata.apci_byte));
                data.extend_from_slice(ldata.data);
                data
            }
        };

        Some(Self {
            command,
            source: ldata.source,
            destination,
            data,
        })
    }

    /// Encode the event as a cEMI `L_Data` frame with the given message code.
    pub(crate) fn to_cemi(&self, code: CemiMessageCode) -> Vec<u8> {
        let apci = match self.command {
            GroupEventCommand::GroupRead => Apci::GroupValueRead,
            GroupEventCommand::GroupResponse => Apci::GroupValueResponse,
            GroupEventCommand::GroupWrite => Apci::GroupValueWrite,
        };
        build_ldata(code, self.source, self.destination, apci, &self.data)
    }
}

/// Bidirectional endpoint to the KNX bus.
///
/// `send` may be called from multiple tasks; the adapters serialize it
/// internally. `inbound` hands out the single consumer handle to the
/// unbounded inbound event sequence; the channel closes when the connection
/// is torn down.
#[async_trait]
pub trait GroupClient: Send + Sync {
    /// Send one outbound event. Returns once the underlying transport has
    /// accepted the frame or reported an error.
    async fn send(&self, event: GroupEvent) -> Result<(), SendError>;

    /// Take the inbound event stream. Returns `None` on every call after the
    /// first.
    fn inbound(&self) -> Option<mpsc::Receiver<GroupEvent>>;

    /// Release all resources. Ends the inbound stream.
    async fn close(&self);
}
