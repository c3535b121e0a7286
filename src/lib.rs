//! # knx-exporter
//!
//! Bridges a KNX building automation bus to a prometheus scrape endpoint.
//!
//! Values observed on the bus are decoded according to their configured
//! datapoint type, cached as per device snapshots and exposed as named
//! numeric series over HTTP. For addresses that only publish on change, the
//! exporter can issue read requests at startup and whenever a value goes
//! stale.
//!
//! ## Pipeline
//!
//! ```text
//! bus → group client (inbound) → listener → snapshot store ← scrape handler
//!         ↑ send
//!       poller / startup reader
//! ```
//!
//! The [`client::GroupClient`] port abstracts the bus connection; tunneling
//! and routing adapters live in [`client`], the wire codecs in [`protocol`].
//! [`exporter::MetricsExporter`] wires the pipeline together and
//! [`server::MetricsServer`] serves `/metrics`, `/live` and `/ready`.

pub mod addressing;
pub mod cli;
pub mod client;
pub mod config;
pub mod dpt;
pub mod error;
pub mod exporter;
pub mod listener;
pub mod poller;
pub mod protocol;
pub mod server;
pub mod snapshot;
pub mod startup;
pub mod systemd;

pub use addressing::{GroupAddress, IndividualAddress};
pub use config::Config;
pub use dpt::{DptId, Value};
pub use exporter::MetricsExporter;
pub use server::MetricsServer;
