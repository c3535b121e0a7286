//! KNXnet/IP wire protocol.
//!
//! Framing and service codecs shared by the tunnel and router clients:
//! the common frame header, the cEMI link layer messages carried inside
//! data frames, and the core/tunneling service bodies.

pub mod cemi;
pub mod constants;
pub mod frame;
pub mod services;
