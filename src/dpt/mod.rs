//! KNX Datapoint Types (DPT).
//!
//! DPTs define how the data payload of a group telegram is interpreted. The
//! exporter only ever decodes: every supported family produces a numeric
//! [`Value`] that is promoted to `f64` before it is stored as a snapshot.
//!
//! ## Supported DPT families
//!
//! - **1.xxx** - Boolean (1 bit): switches, buttons, binary sensors
//! - **5.xxx** - 8-bit unsigned: percentages, angles, counters
//! - **6.xxx** - 8-bit signed
//! - **7.xxx** - 16-bit unsigned: pulses, brightness
//! - **8.xxx** - 16-bit signed
//! - **9.xxx** - 2-byte float: temperature, illuminance, pressure
//! - **12.xxx** - 32-bit unsigned
//! - **13.xxx** - 32-bit signed: energy, flow rate
//! - **14.xxx** - IEEE-754 32-bit float
//! - **20.xxx** - enumerations, decoded as unsigned

mod decode;

pub use decode::decode;

use std::fmt;
use std::str::FromStr;

use once_cell::sync::Lazy;
use regex::Regex;
use serde::de::Error as _;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use thiserror::Error;

/// The identifier could not be parsed as a datapoint type.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[error("invalid DPT identifier \"{0}\"")]
pub struct InvalidDptId(pub String);

/// Matches the ETS export notation `DPT-M` / `DPST-M-N`.
static ETS_DPT_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^(?:DPT|DPST)-(\d{1,3})(?:-(\d{1,3}))?$").expect("static regex"));

/// Datapoint type identifier.
///
/// The textual form is `M.NNN` with the sub number zero padded to three
/// digits, or `M.*` when the exact subtype does not matter for decoding.
/// The ETS export notation (`DPT-9`, `DPST-9-1`) is normalized on parse.
///
/// # Examples
///
/// ```
/// use knx_exporter::dpt::DptId;
///
/// let id: DptId = "9.001".parse().unwrap();
/// assert_eq!(id.main(), 9);
/// assert_eq!(id.sub(), Some(1));
///
/// let id: DptId = "DPST-9-1".parse().unwrap();
/// assert_eq!(id.to_string(), "9.001");
///
/// let id: DptId = "1.*".parse().unwrap();
/// assert_eq!(id.to_string(), "1.*");
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct DptId {
    main: u16,
    sub: Option<u16>,
}

impl DptId {
    /// Create a datapoint type identifier from its main and sub number.
    pub const fn new(main: u16, sub: Option<u16>) -> Self {
        Self { main, sub }
    }

    /// The main number, selecting the decoding family.
    #[inline]
    pub const fn main(self) -> u16 {
        self.main
    }

    /// The sub number; `None` stands for "any subtype" (`M.*`).
    #[inline]
    pub const fn sub(self) -> Option<u16> {
        self.sub
    }
}

impl fmt::Display for DptId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.sub {
            Some(sub) => write!(f, "{}.{:03}", self.main, sub),
            None => write!(f, "{}.*", self.main),
        }
    }
}

impl FromStr for DptId {
    type Err = InvalidDptId;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if let Some(caps) = ETS_DPT_RE.captures(s) {
            let main = caps[1].parse().map_err(|_| InvalidDptId(s.to_owned()))?;
            let sub = caps
                .get(2)
                .map(|m| m.as_str().parse())
                .transpose()
                .map_err(|_| InvalidDptId(s.to_owned()))?;
            return Ok(Self { main, sub });
        }

        let (main, sub) = s.split_once('.').ok_or_else(|| InvalidDptId(s.to_owned()))?;
        let main = main.parse().map_err(|_| InvalidDptId(s.to_owned()))?;
        let sub = match sub {
            "*" => None,
            _ => Some(sub.parse().map_err(|_| InvalidDptId(s.to_owned()))?),
        };
        Ok(Self { main, sub })
    }
}

impl Serialize for DptId {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for DptId {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(D::Error::custom)
    }
}

/// A decoded datapoint value.
///
/// The decoder tags each value with its natural Rust type; the promotion to
/// `f64` for metric export is a single place ([`Value::as_f64`]).
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Value {
    Bool(bool),
    Int(i64),
    UInt(u64),
    Float(f64),
    Enum(u32),
}

impl Value {
    /// Promote the value to `f64`.
    ///
    /// Booleans map to exactly 0.0 or 1.0. Integers convert by value; for
    /// magnitudes below 2^53 the conversion is exact.
    pub fn as_f64(self) -> f64 {
        match self {
            Value::Bool(true) => 1.0,
            Value::Bool(false) => 0.0,
            Value::Int(v) => v as f64,
            Value::UInt(v) => v as f64,
            Value::Float(v) => v,
            Value::Enum(v) => f64::from(v),
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Bool(v) => write!(f, "{v}"),
            Value::Int(v) => write!(f, "{v}"),
            Value::UInt(v) => write!(f, "{v}"),
            Value::Float(v) => write!(f, "{v}"),
            Value::Enum(v) => write!(f, "{v}"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_canonical() {
        let id: DptId = "1.001".parse().unwrap();
        assert_eq!(id, DptId::new(1, Some(1)));

        let id: DptId = "14.056".parse().unwrap();
        assert_eq!(id, DptId::new(14, Some(56)));

        let id: DptId = "5.*".parse().unwrap();
        assert_eq!(id, DptId::new(5, None));
    }

    #[test]
    fn test_parse_ets_notation() {
        assert_eq!("DPT-1".parse::<DptId>().unwrap(), DptId::new(1, None));
        assert_eq!("DPST-1-2".parse::<DptId>().unwrap(), DptId::new(1, Some(2)));
        assert_eq!(
            "DPST-13-10".parse::<DptId>().unwrap(),
            DptId::new(13, Some(10))
        );
    }

    #[test]
    fn test_parse_invalid() {
        for s in ["", "9", "9.", "x.001", "9.x", "DPT-", "DPST-1-2-3", "dpt-1"] {
            assert!(s.parse::<DptId>().is_err(), "{s:?} should not parse");
        }
    }

    #[test]
    fn test_display_zero_pads_sub() {
        assert_eq!(DptId::new(9, Some(1)).to_string(), "9.001");
        assert_eq!(DptId::new(20, Some(102)).to_string(), "20.102");
        assert_eq!(DptId::new(1, None).to_string(), "1.*");
    }

    #[test]
    fn test_ets_normalization_round_trip() {
        let id: DptId = "DPST-9-1".parse().unwrap();
        assert_eq!(id.to_string(), "9.001");
        let id: DptId = "DPT-14".parse().unwrap();
        assert_eq!(id.to_string(), "14.*");
    }

    #[test]
    fn test_value_promotion() {
        assert_eq!(Value::Bool(true).as_f64(), 1.0);
        assert_eq!(Value::Bool(false).as_f64(), 0.0);
        assert_eq!(Value::Int(-40).as_f64(), -40.0);
        assert_eq!(Value::UInt(5000).as_f64(), 5000.0);
        assert_eq!(Value::Float(21.5).as_f64(), 21.5);
        assert_eq!(Value::Enum(3).as_f64(), 3.0);
    }
}
