//! KNX individual address implementation.
//!
//! Individual addresses identify physical devices on the KNX bus.
//! Format: `area.line.device` with 4+4+8 bits. `0.0.0` is reserved.

use std::fmt;
use std::str::FromStr;

use serde::de::Error as _;
use serde::{Deserialize, Deserializer, Serialize, Serializer};

use super::AddressError;

/// KNX individual (physical) address (`area.line.device`).
///
/// # Examples
///
/// ```
/// use knx_exporter::addressing::IndividualAddress;
///
/// let addr = IndividualAddress::new(1, 1, 5).unwrap();
/// assert_eq!(addr.to_string(), "1.1.5");
///
/// let addr: IndividualAddress = "1.1.5".parse().unwrap();
/// assert_eq!(u16::from(addr), 0x1105);
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct IndividualAddress {
    raw: u16,
}

impl IndividualAddress {
    /// Maximum area value (4 bits).
    pub const MAX_AREA: u8 = 15;
    /// Maximum line value (4 bits).
    pub const MAX_LINE: u8 = 15;

    /// Create a new individual address from its components.
    ///
    /// # Errors
    ///
    /// Returns [`AddressError::OutOfRange`] if a component exceeds its field
    /// width and [`AddressError::Reserved`] for `0.0.0`.
    pub fn new(area: u8, line: u8, device: u8) -> Result<Self, AddressError> {
        if area > Self::MAX_AREA || line > Self::MAX_LINE {
            return Err(AddressError::OutOfRange);
        }
        let raw = (u16::from(area) << 12) | (u16::from(line) << 8) | u16::from(device);
        if raw == 0 {
            return Err(AddressError::Reserved);
        }
        Ok(Self { raw })
    }

    /// Get the area component (0-15).
    #[inline]
    pub const fn area(self) -> u8 {
        ((self.raw >> 12) & 0x0F) as u8
    }

    /// Get the line component (0-15).
    #[inline]
    pub const fn line(self) -> u8 {
        ((self.raw >> 8) & 0x0F) as u8
    }

    /// Get the device component (0-255).
    #[inline]
    pub const fn device(self) -> u8 {
        (self.raw & 0xFF) as u8
    }

    /// Get the raw u16 representation.
    #[inline]
    pub const fn raw(self) -> u16 {
        self.raw
    }
}

impl From<u16> for IndividualAddress {
    #[inline]
    fn from(raw: u16) -> Self {
        Self { raw }
    }
}

impl From<IndividualAddress> for u16 {
    #[inline]
    fn from(addr: IndividualAddress) -> u16 {
        addr.raw
    }
}

impl fmt::Display for IndividualAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}.{}", self.area(), self.line(), self.device())
    }
}

impl FromStr for IndividualAddress {
    type Err = AddressError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = || AddressError::InvalidIndividualAddress(s.to_owned());
        let mut parts = s.split('.');

        let area = parts
            .next()
            .and_then(|p| p.parse::<u8>().ok())
            .ok_or_else(invalid)?;
        let line = parts
            .next()
            .and_then(|p| p.parse::<u8>().ok())
            .ok_or_else(invalid)?;
        let device = parts
            .next()
            .and_then(|p| p.parse::<u8>().ok())
            .ok_or_else(invalid)?;
        if parts.next().is_some() {
            return Err(invalid());
        }

        Self::new(area, line, device)
    }
}

impl Serialize for IndividualAddress {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for IndividualAddress {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(D::Error::custom)
    }
}
