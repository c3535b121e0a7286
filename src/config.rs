//! Exporter configuration.
//!
//! The configuration file is YAML. Connection parameters select and tune the
//! bus transport; `addressConfigs` maps each group address to the metric it
//! feeds. Durations are humantime strings ("200ms", "10s"), addresses and
//! DPTs use their canonical text forms, `readBody` is hex.
//!
//! ```yaml
//! connection:
//!   type: Tunnel
//!   endpoint: "192.168.1.15:3671"
//!   physicalAddress: 2.0.1
//! metricsPrefix: knx_
//! addressConfigs:
//!   0/0/1:
//!     name: dummy_metric
//!     dpt: "1.001"
//!     metricType: gauge
//!     export: true
//!     readActive: true
//!     maxAge: 10m
//! ```

use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::fs;
use std::net::Ipv4Addr;
use std::path::Path;
use std::time::Duration;

use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::addressing::{GroupAddress, IndividualAddress};
use crate::client::{GroupEvent, GroupEventCommand};
use crate::dpt::DptId;
use crate::error::ConfigError;

/// Pacing between two startup reads when `readStartupInterval` is unset.
pub const DEFAULT_READ_STARTUP_INTERVAL: Duration = Duration::from_millis(200);

/// A metric name acceptable to prometheus.
static METRIC_NAME_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new("^[A-Za-z_:][A-Za-z0-9_:]*$").expect("static regex"));

/// Everything a metric name must not contain.
static INVALID_METRIC_CHARS: Lazy<Regex> =
    Lazy::new(|| Regex::new("[^A-Za-z0-9_:]").expect("static regex"));

/// Top level configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Config {
    /// Bus connection parameters.
    pub connection: ConnectionConfig,
    /// Short prefix added in front of every metric name.
    pub metrics_prefix: String,
    /// Pacing of the startup read sweep.
    #[serde(with = "opt_duration_str", skip_serializing_if = "Option::is_none")]
    pub read_startup_interval: Option<Duration>,
    /// Mapping of group addresses to metrics.
    pub address_configs: HashMap<GroupAddress, GroupAddressConfig>,
}

impl Config {
    /// Load and validate a configuration file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let raw = fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_owned(),
            source,
        })?;
        let mut config: Self = serde_yaml::from_str(&raw)?;
        config.validate()?;
        Ok(config)
    }

    /// Normalize metric names and check cross field requirements.
    pub fn validate(&mut self) -> Result<(), ConfigError> {
        let prefix = self.metrics_prefix.clone();
        for (address, address_config) in &mut self.address_configs {
            address_config.name = normalize_metric_name(&address_config.name)?;
            let full_name = format!("{prefix}{}", address_config.name);
            if !METRIC_NAME_RE.is_match(&full_name) {
                return Err(ConfigError::InvalidMetricName(full_name));
            }
            if address_config.read_type == ReadType::WriteOther
                && address_config.read_address.is_none()
            {
                return Err(ConfigError::MissingReadAddress(*address));
            }
        }
        Ok(())
    }

    /// The exported metric name for an address config, prefix included.
    pub fn name_for(&self, address_config: &GroupAddressConfig) -> String {
        format!("{}{}", self.metrics_prefix, address_config.name)
    }

    /// The exported metric name for a group address, if one is configured.
    pub fn name_for_ga(&self, address: GroupAddress) -> Option<String> {
        self.address_configs.get(&address).map(|c| self.name_for(c))
    }

    /// The startup read pacing, falling back to the default for unset or
    /// zero values.
    pub fn read_startup_interval(&self) -> Duration {
        self.read_startup_interval
            .filter(|interval| !interval.is_zero())
            .unwrap_or(DEFAULT_READ_STARTUP_INTERVAL)
    }
}

/// How the exporter reaches the bus.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ConnectionConfig {
    /// Transport selection.
    #[serde(rename = "type")]
    pub connection_type: ConnectionType,
    /// Gateway `host:port` for tunneling, `group:port` for routing.
    pub endpoint: String,
    /// The exporter's own identity on the bus.
    pub physical_address: IndividualAddress,
    /// Routing specific transport options.
    pub router_config: RouterConfig,
    /// Tunneling specific transport options.
    pub tunnel_config: TunnelConfig,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            connection_type: ConnectionType::default(),
            endpoint: String::new(),
            physical_address: IndividualAddress::from(0x0001),
            router_config: RouterConfig::default(),
            tunnel_config: TunnelConfig::default(),
        }
    }
}

/// The transport used to reach the bus.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum ConnectionType {
    /// Point-to-point KNXnet/IP tunneling to a gateway
    #[default]
    Tunnel,
    /// KNXnet/IP multicast routing
    Router,
}

/// Transport options for multicast routing.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct RouterConfig {
    /// Inbound buffer depth for lost-packet tolerance.
    pub retain_count: usize,
    /// IPv4 address of the local interface to join the group on.
    pub interface: Option<Ipv4Addr>,
    /// Receive our own multicast sends.
    pub multicast_loopback_enabled: bool,
    /// Mandatory pause after each send.
    #[serde(with = "duration_str")]
    pub post_send_pause_duration: Duration,
}

impl Default for RouterConfig {
    fn default() -> Self {
        Self {
            retain_count: 32,
            interface: None,
            multicast_loopback_enabled: false,
            post_send_pause_duration: Duration::from_millis(20),
        }
    }
}

/// Transport options for tunneling.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct TunnelConfig {
    /// Retransmit cadence for unacknowledged requests.
    #[serde(with = "duration_str")]
    pub resend_interval: Duration,
    /// Gateway heartbeat cadence.
    #[serde(with = "duration_str")]
    pub heartbeat_interval: Duration,
    /// How long to wait for gateway responses.
    #[serde(with = "duration_str")]
    pub response_timeout: Duration,
    /// Announce the local socket address instead of NAT mode.
    pub send_local_address: bool,
    /// Tunnel over TCP instead of UDP. Parsed but not supported.
    #[serde(rename = "useTCP")]
    pub use_tcp: bool,
}

impl Default for TunnelConfig {
    fn default() -> Self {
        Self {
            resend_interval: Duration::from_millis(500),
            heartbeat_interval: Duration::from_secs(10),
            response_timeout: Duration::from_secs(10),
            send_local_address: false,
            use_tcp: false,
        }
    }
}

/// The prometheus sample type a metric is exported as.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MetricType {
    Counter,
    Gauge,
    #[default]
    Untyped,
}

impl fmt::Display for MetricType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Counter => write!(f, "counter"),
            Self::Gauge => write!(f, "gauge"),
            Self::Untyped => write!(f, "untyped"),
        }
    }
}

/// How a refresh of a stale value is triggered.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum ReadType {
    /// Send `A_GroupValue_Read` to the address itself
    #[default]
    GroupRead,
    /// Write a fixed payload to another address that causes the device to
    /// publish the value
    WriteOther,
}

/// Mapping of one group address to one metric.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct GroupAddressConfig {
    /// Metric name without the prefix.
    pub name: String,
    /// Help text for the metric.
    #[serde(skip_serializing_if = "String::is_empty")]
    pub comment: String,
    /// Datapoint type on the bus; required to decode values.
    pub dpt: DptId,
    /// Exported sample type.
    pub metric_type: MetricType,
    /// Export this address at all; events for unexported addresses are
    /// dropped.
    pub export: bool,
    /// Include in the startup read sweep.
    pub read_startup: bool,
    /// Include in periodic polling.
    pub read_active: bool,
    /// How to trigger a refresh.
    pub read_type: ReadType,
    /// Destination for `WriteOther` refreshes.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub read_address: Option<GroupAddress>,
    /// Payload for `WriteOther` refreshes, hex encoded in YAML.
    #[serde(with = "hex_bytes", skip_serializing_if = "Vec::is_empty")]
    pub read_body: Vec<u8>,
    /// Poll when the youngest snapshot is older than this.
    #[serde(with = "opt_duration_str", skip_serializing_if = "Option::is_none")]
    pub max_age: Option<Duration>,
    /// Emit the snapshot timestamp with the sample.
    pub with_timestamp: bool,
    /// Static labels, emitted in key order.
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    pub labels: BTreeMap<String, String>,
}

impl GroupAddressConfig {
    /// The outbound event that refreshes this address.
    ///
    /// `GroupRead` queries the address itself; `WriteOther` writes the
    /// configured body to the configured other address. The refreshed value
    /// is expected to arrive as a regular event on the original address.
    pub fn read_request(
        &self,
        source: IndividualAddress,
        destination: GroupAddress,
    ) -> GroupEvent {
        match self.read_type {
            ReadType::GroupRead => GroupEvent::read(source, destination),
            ReadType::WriteOther => GroupEvent {
                command: GroupEventCommand::GroupWrite,
                source,
                // Validation guarantees the address for WriteOther configs.
                destination: self.read_address.unwrap_or(destination),
                data: self.read_body.clone(),
            },
        }
    }
}

/// Normalize a metric name.
///
/// Accepts the name as-is when it is already valid, then tries the fixed
/// umlaut transliteration, then replaces every remaining invalid character
/// with `_`. Names that are still invalid (e.g. starting with a digit) are
/// rejected.
pub fn normalize_metric_name(name: &str) -> Result<String, ConfigError> {
    if METRIC_NAME_RE.is_match(name) {
        return Ok(name.to_owned());
    }

    let mut transliterated = String::with_capacity(name.len());
    for c in name.chars() {
        match c {
            'Ä' => transliterated.push_str("Ae"),
            'Ö' => transliterated.push_str("Oe"),
            'Ü' => transliterated.push_str("Ue"),
            'ä' => transliterated.push_str("ae"),
            'ö' => transliterated.push_str("oe"),
            'ü' => transliterated.push_str("ue"),
            'ß' => transliterated.push_str("ss"),
            _ => transliterated.push(c),
        }
    }
    if METRIC_NAME_RE.is_match(&transliterated) {
        return Ok(transliterated);
    }

    let replaced = INVALID_METRIC_CHARS
        .replace_all(&transliterated, "_")
        .into_owned();
    if METRIC_NAME_RE.is_match(&replaced) {
        return Ok(replaced);
    }

    Err(ConfigError::InvalidMetricName(name.to_owned()))
}

/// Serde adapter for humantime duration strings.
mod duration_str {
    use std::time::Duration;

    use serde::de::Error as _;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(d: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(&humantime::format_duration(*d))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        let s = String::deserialize(deserializer)?;
        humantime::parse_duration(&s).map_err(D::Error::custom)
    }
}

/// Serde adapter for optional humantime duration strings.
mod opt_duration_str {
    use std::time::Duration;

    use serde::de::Error as _;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(
        d: &Option<Duration>,
        serializer: S,
    ) -> Result<S::Ok, S::Error> {
        match d {
            Some(d) => serializer.collect_str(&humantime::format_duration(*d)),
            None => serializer.serialize_none(),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(
        deserializer: D,
    ) -> Result<Option<Duration>, D::Error> {
        let s = Option::<String>::deserialize(deserializer)?;
        s.map(|s| humantime::parse_duration(&s).map_err(D::Error::custom))
            .transpose()
    }
}

/// Serde adapter for hex encoded byte strings.
mod hex_bytes {
    use serde::de::Error as _;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(&hex::encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let s = Option::<String>::deserialize(deserializer)?;
        match s {
            Some(s) => hex::decode(s).map_err(D::Error::custom),
            None => Ok(Vec::new()),
        }
    }
}
