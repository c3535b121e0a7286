//! KNX addressing types.
//!
//! Two address spaces exist on the bus: group addresses identify logical
//! destinations (`main/middle/sub`), individual addresses identify physical
//! devices (`area.line.device`). Both are 16 bit values with a canonical
//! string form that is used in configuration files and metric labels.

mod group;
mod individual;

pub use group::GroupAddress;
pub use individual::IndividualAddress;

use thiserror::Error;

/// Errors while parsing or constructing KNX addresses.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum AddressError {
    #[error("invalid group address \"{0}\": expected main/middle/sub")]
    InvalidGroupAddress(String),
    #[error("invalid individual address \"{0}\": expected area.line.device")]
    InvalidIndividualAddress(String),
    #[error("address component out of range")]
    OutOfRange,
    #[error("the zero address is reserved")]
    Reserved,
}
