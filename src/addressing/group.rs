//! KNX group address implementation.
//!
//! Group addresses represent logical groupings of devices for functional
//! control. The exporter uses the 3-level format exclusively:
//!
//! - Main: 5 bits (0-31)
//! - Middle: 3 bits (0-7)
//! - Sub: 8 bits (0-255)
//!
//! `0/0/0` is reserved on the bus and rejected at parse time.

use std::fmt;
use std::str::FromStr;

use serde::de::Error as _;
use serde::{Deserialize, Deserializer, Serialize, Serializer};

use super::AddressError;

/// KNX group address in 3-level notation (`main/middle/sub`).
///
/// # Examples
///
/// ```
/// use knx_exporter::addressing::GroupAddress;
///
/// let addr = GroupAddress::new(1, 2, 3).unwrap();
/// assert_eq!(addr.to_string(), "1/2/3");
///
/// let addr: GroupAddress = "1/2/3".parse().unwrap();
/// assert_eq!(u16::from(addr), 0x0A03);
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct GroupAddress {
    raw: u16,
}

impl GroupAddress {
    /// Maximum main group value (5 bits).
    pub const MAX_MAIN: u8 = 31;
    /// Maximum middle group value (3 bits).
    pub const MAX_MIDDLE: u8 = 7;

    /// Create a new group address from its components.
    ///
    /// # Errors
    ///
    /// Returns [`AddressError::OutOfRange`] if a component exceeds its field
    /// width and [`AddressError::Reserved`] for `0/0/0`.
    pub fn new(main: u8, middle: u8, sub: u8) -> Result<Self, AddressError> {
        if main > Self::MAX_MAIN || middle > Self::MAX_MIDDLE {
            return Err(AddressError::OutOfRange);
        }
        let raw = (u16::from(main) << 11) | (u16::from(middle) << 8) | u16::from(sub);
        if raw == 0 {
            return Err(AddressError::Reserved);
        }
        Ok(Self { raw })
    }

    /// Get the main group component (0-31).
    #[inline]
    pub const fn main(self) -> u8 {
        ((self.raw >> 11) & 0x1F) as u8
    }

    /// Get the middle group component (0-7).
    #[inline]
    pub const fn middle(self) -> u8 {
        ((self.raw >> 8) & 0x07) as u8
    }

    /// Get the sub group component (0-255).
    #[inline]
    pub const fn sub(self) -> u8 {
        (self.raw & 0xFF) as u8
    }

    /// Get the raw u16 representation.
    #[inline]
    pub const fn raw(self) -> u16 {
        self.raw
    }
}

impl From<u16> for GroupAddress {
    #[inline]
    fn from(raw: u16) -> Self {
        Self { raw }
    }
}

impl From<GroupAddress> for u16 {
    #[inline]
    fn from(addr: GroupAddress) -> u16 {
        addr.raw
    }
}

impl fmt::Display for GroupAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}/{}", self.main(), self.middle(), self.sub())
    }
}

impl FromStr for GroupAddress {
    type Err = AddressError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = || AddressError::InvalidGroupAddress(s.to_owned());
        let mut parts = s.split('/');

        let main = parts
            .next()
            .and_then(|p| p.parse::<u8>().ok())
            .ok_or_else(invalid)?;
        let middle = parts
            .next()
            .and_then(|p| p.parse::<u8>().ok())
            .ok_or_else(invalid)?;
        let sub = parts
            .next()
            .and_then(|p| p.parse::<u8>().ok())
            .ok_or_else(invalid)?;
        if parts.next().is_some() {
            return Err(invalid());
        }

        Self::new(main, middle, sub)
    }
}

impl Serialize for GroupAddress {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for GroupAddress {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(D::Error::custom)
    }
}
