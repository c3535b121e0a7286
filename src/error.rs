//! Error types for the KNX exporter.
//!
//! The taxonomy mirrors the failure classes of the pipeline: configuration
//! and connection errors are fatal at startup, while decode, send and store
//! lookup errors are recovered per event and never terminate a loop.

use std::io;
use std::path::PathBuf;

use thiserror::Error;

use crate::addressing::{AddressError, GroupAddress};
use crate::dpt::DptId;

/// Top level error for exporter construction and startup.
#[derive(Debug, Error)]
pub enum ExporterError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error(transparent)]
    Connect(#[from] ConnectError),
    #[error("metric registration failed: {0}")]
    Prometheus(#[from] prometheus::Error),
    #[error("the client's inbound event stream was already consumed")]
    InboundTaken,
}

/// Load time configuration errors. All of them are fatal.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("can not read configuration file {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("can not parse configuration: {0}")]
    Parse(#[from] serde_yaml::Error),
    #[error(transparent)]
    Address(#[from] AddressError),
    #[error("invalid metric name \"{0}\": does not match [A-Za-z_:][A-Za-z0-9_:]* after normalization")]
    InvalidMetricName(String),
    #[error("group address {0}: readType is WriteOther but no readAddress is configured")]
    MissingReadAddress(GroupAddress),
}

/// Start time connection errors. Fatal: the exporter can not run without a
/// working bus connection.
#[derive(Debug, Error)]
pub enum ConnectError {
    #[error("invalid gateway endpoint \"{0}\"")]
    InvalidEndpoint(String),
    #[error("socket error while connecting to {endpoint}: {source}")]
    Io {
        endpoint: String,
        #[source]
        source: io::Error,
    },
    #[error("gateway {endpoint} refused the connection (status 0x{status:02X})")]
    Refused { endpoint: String, status: u8 },
    #[error("no response from gateway {endpoint} within {timeout:?}")]
    Timeout {
        endpoint: String,
        timeout: std::time::Duration,
    },
    #[error("unexpected frame during connection setup: {0}")]
    Protocol(#[from] ProtocolError),
    #[error("tunneling over TCP is not supported")]
    TcpUnsupported,
}

/// Per event decode errors. Recovered: the event is logged and dropped.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum DecodeError {
    #[error("no decoding rule registered for DPT {0}")]
    UnknownDpt(DptId),
    #[error("payload too short: DPT {dpt} needs {needed} bytes, got {actual}")]
    ShortPayload {
        dpt: DptId,
        needed: usize,
        actual: usize,
    },
    #[error("decoded value is not finite")]
    NonFinite,
}

/// Per send errors. Recovered: logged, counted, and the loop continues.
#[derive(Debug, Error)]
pub enum SendError {
    #[error("client is closed")]
    Closed,
    #[error("no tunneling acknowledge within {0:?}")]
    AckTimeout(std::time::Duration),
    #[error("socket error: {0}")]
    Io(#[from] io::Error),
    #[error("payload too large for a cEMI frame")]
    PayloadTooLarge,
}

/// KNXnet/IP and cEMI wire format errors.
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum ProtocolError {
    #[error("frame shorter than its header or declared length")]
    ShortFrame,
    #[error("invalid KNXnet/IP frame")]
    InvalidFrame,
    #[error("unsupported KNXnet/IP protocol version")]
    UnsupportedVersion,
    #[error("unsupported service type 0x{0:04X}")]
    UnsupportedServiceType(u16),
    #[error("invalid cEMI message code 0x{0:02X}")]
    InvalidMessageCode(u8),
    #[error("tunneling sequence mismatch: expected {expected}, got {actual}")]
    SequenceMismatch { expected: u8, actual: u8 },
}

/// Snapshot store lookup failures. Recovered at the call site.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum StoreError {
    #[error("no snapshot for {name} from {device} found")]
    NotFound { name: String, device: String },
}
