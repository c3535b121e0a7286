//! The poller: periodic refresh of stale snapshots.
//!
//! Addresses marked `readActive` are polled when their youngest snapshot is
//! older than the configured `maxAge`. A single timer drives all of them:
//! its period is the greatest common divisor (in whole seconds) of the
//! effective max ages, so every address is checked on the tick its own
//! interval elapses without keeping one timer per address.

use std::sync::Arc;
use std::time::Duration;

use prometheus::IntCounterVec;
use tokio::time::{interval_at, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::addressing::{GroupAddress, IndividualAddress};
use crate::client::GroupClient;
use crate::config::{Config, GroupAddressConfig, ReadType};
use crate::snapshot::MetricSnapshots;

/// Max ages below this are raised to it, keeping poll chatter off the bus.
const MIN_POLL_INTERVAL: Duration = Duration::from_secs(5);

/// One pollable address.
struct PollTarget {
    address: GroupAddress,
    /// Full metric name whose youngest snapshot decides staleness.
    name: String,
    config: GroupAddressConfig,
    /// Clamped max age.
    max_age: Duration,
}

/// Periodically refreshes addresses whose snapshots went stale.
pub struct Poller {
    client: Arc<dyn GroupClient>,
    store: Arc<MetricSnapshots>,
    physical_address: IndividualAddress,
    targets: Vec<PollTarget>,
    polling_interval: Option<Duration>,
    message_counter: IntCounterVec,
    shutdown: CancellationToken,
}

impl std::fmt::Debug for Poller {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Poller")
            .field("targets", &self.targets.len())
            .field("polling_interval", &self.polling_interval)
            .finish_non_exhaustive()
    }
}

impl Poller {
    /// Create a poller over the polling set of the config.
    pub fn new(
        config: &Config,
        client: Arc<dyn GroupClient>,
        store: Arc<MetricSnapshots>,
        message_counter: IntCounterVec,
        shutdown: CancellationToken,
    ) -> Self {
        let targets = polling_set(config);
        let polling_interval = polling_interval(&targets);
        Self {
            client,
            store,
            physical_address: config.connection.physical_address,
            targets,
            polling_interval,
            message_counter,
            shutdown,
        }
    }

    /// The computed tick interval; `None` disables polling.
    pub fn polling_interval(&self) -> Option<Duration> {
        self.polling_interval
    }

    /// Run the poll loop until cancellation. A poller without targets
    /// returns immediately.
    pub async fn run(self) {
        let Some(period) = self.polling_interval else {
            debug!("no addresses configured for active polling");
            return;
        };
        info!(
            count = self.targets.len(),
            interval = ?period,
            "start polling for stale metrics"
        );

        let mut ticker = interval_at(Instant::now() + period, period);
        loop {
            tokio::select! {
                () = self.shutdown.cancelled() => return,
                _ = ticker.tick() => {}
            }
            self.poll_addresses().await;
        }
    }

    /// One tick: read every address whose youngest snapshot is missing or
    /// too old.
    async fn poll_addresses(&self) {
        let now = std::time::Instant::now();
        for target in &self.targets {
            let refresh = match self.store.find_youngest(&target.name) {
                None => true,
                Some(snapshot) => snapshot.age(now) >= target.max_age,
            };
            if refresh {
                self.send_read(target).await;
            }
        }
    }

    async fn send_read(&self, target: &PollTarget) {
        let event = target.config.read_request(self.physical_address, target.address);
        if let Err(e) = self.client.send(event).await {
            info!(
                destination = %target.address,
                error = %e,
                "can not send read request"
            );
        } else if target.config.read_type == ReadType::WriteOther {
            debug!(
                destination = %target.address,
                metric = %target.name,
                "triggered refresh via write, waiting for the device to publish"
            );
        }
        self.message_counter
            .with_label_values(&["sent", "true"])
            .inc();
    }
}

/// The pollable addresses: exported, marked `readActive`, with a max age of
/// at least one second. Each entry's max age is clamped to the minimum poll
/// interval. Sorted by address for deterministic polling order.
fn polling_set(config: &Config) -> Vec<PollTarget> {
    let mut targets: Vec<_> = config
        .address_configs
        .iter()
        .filter_map(|(address, address_config)| {
            let max_age = address_config.max_age?;
            let whole_seconds = Duration::from_secs(max_age.as_secs());
            if !address_config.export
                || !address_config.read_active
                || whole_seconds < Duration::from_secs(1)
            {
                return None;
            }
            Some(PollTarget {
                address: *address,
                name: config.name_for(address_config),
                config: address_config.clone(),
                max_age: whole_seconds.max(MIN_POLL_INTERVAL),
            })
        })
        .collect();
    targets.sort_by_key(|target| target.address);
    targets
}

/// The gcd (in whole seconds) of all effective max ages; `None` for an
/// empty set.
fn polling_interval(targets: &[PollTarget]) -> Option<Duration> {
    let mut seconds = targets.iter().map(|target| target.max_age.as_secs());
    let first = seconds.next()?;
    Some(Duration::from_secs(seconds.fold(first, gcd)))
}

/// Greatest common divisor via the Euclidean algorithm.
fn gcd(a: u64, b: u64) -> u64 {
    let (mut a, mut b) = (a, b);
    while b != 0 {
        (a, b) = (b, a % b);
    }
    a
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::fake::FakeGroupClient;
    use crate::client::GroupEventCommand;
    use crate::config::MetricType;
    use crate::snapshot::Snapshot;
    use prometheus::Opts;
    use std::time::Instant as StdInstant;

    fn counter() -> IntCounterVec {
        IntCounterVec::new(
            Opts::new("messages", "exchanged messages").namespace("knx"),
            &["direction", "processed"],
        )
        .unwrap()
    }

    fn entry(name: &str, read_active: bool, max_age: Option<Duration>) -> GroupAddressConfig {
        GroupAddressConfig {
            name: name.to_owned(),
            dpt: "1.001".parse().unwrap(),
            metric_type: MetricType::Gauge,
            export: true,
            read_active,
            max_age,
            ..GroupAddressConfig::default()
        }
    }

    fn config_with(entries: Vec<(&str, GroupAddressConfig)>) -> Config {
        let mut config = Config {
            metrics_prefix: "knx_".to_owned(),
            ..Config::default()
        };
        config.connection.physical_address = "2.0.1".parse().unwrap();
        for (address, entry) in entries {
            config
                .address_configs
                .insert(address.parse().unwrap(), entry);
        }
        config
    }

    fn poller_for(config: &Config, client: Arc<FakeGroupClient>) -> (Poller, Arc<MetricSnapshots>) {
        let store = Arc::new(MetricSnapshots::new());
        let poller = Poller::new(
            config,
            client as Arc<dyn GroupClient>,
            Arc::clone(&store),
            counter(),
            CancellationToken::new(),
        );
        (poller, store)
    }

    #[test]
    fn test_polling_set_filters_and_clamps() {
        let config = config_with(vec![
            // No active read.
            ("0/0/1", entry("a", false, Some(Duration::from_secs(10)))),
            // Interval below one second.
            ("0/0/2", entry("b", true, Some(Duration::from_millis(10)))),
            // Not exported.
            ("0/0/3", {
                let mut e = entry("c", true, Some(Duration::from_secs(10)));
                e.export = false;
                e
            }),
            // Small interval, clamped to five seconds.
            ("0/0/4", entry("d", true, Some(Duration::from_secs(1)))),
            // Regular entry.
            ("0/0/5", entry("e", true, Some(Duration::from_secs(10)))),
            // No max age at all.
            ("0/0/6", entry("f", true, None)),
        ]);

        let targets = polling_set(&config);
        let summary: Vec<(String, String, u64)> = targets
            .iter()
            .map(|t| (t.address.to_string(), t.name.clone(), t.max_age.as_secs()))
            .collect();
        assert_eq!(
            summary,
            vec![
                ("0/0/4".to_owned(), "knx_d".to_owned(), 5),
                ("0/0/5".to_owned(), "knx_e".to_owned(), 10),
            ]
        );
    }

    #[test]
    fn test_polling_interval_gcd() {
        let config = config_with(vec![
            ("0/0/1", entry("a", true, Some(Duration::from_secs(10)))),
            ("0/0/2", entry("b", true, Some(Duration::from_secs(15)))),
            ("0/0/3", entry("c", true, Some(Duration::from_secs(30)))),
            ("0/0/4", entry("d", true, Some(Duration::from_secs(45)))),
            ("0/0/5", entry("e", true, Some(Duration::from_secs(60)))),
            ("0/0/6", entry("f", true, Some(Duration::from_secs(90)))),
        ]);
        let targets = polling_set(&config);
        assert_eq!(polling_interval(&targets), Some(Duration::from_secs(5)));
    }

    #[test]
    fn test_polling_interval_single_entry() {
        let config = config_with(vec![(
            "0/0/1",
            entry("a", true, Some(Duration::from_secs(10))),
        )]);
        let targets = polling_set(&config);
        assert_eq!(polling_interval(&targets), Some(Duration::from_secs(10)));
    }

    #[test]
    fn test_polling_interval_empty() {
        assert_eq!(polling_interval(&[]), None);
        let (poller, _) = poller_for(
            &config_with(vec![]),
            Arc::new(FakeGroupClient::new()),
        );
        assert_eq!(poller.polling_interval(), None);
    }

    #[tokio::test]
    async fn test_stale_snapshot_triggers_read() {
        let config = config_with(vec![(
            "0/0/1",
            entry("m", true, Some(Duration::from_secs(10))),
        )]);
        let client = Arc::new(FakeGroupClient::new());
        let (poller, store) = poller_for(&config, Arc::clone(&client));

        // Snapshot aged 14 seconds with max age 10: one read expected.
        let mut snapshot = Snapshot::now(
            "knx_m",
            "1.1.8".parse().unwrap(),
            "0/0/1".parse().unwrap(),
            1.0,
            Arc::new(entry("m", true, Some(Duration::from_secs(10)))),
        );
        snapshot.timestamp = StdInstant::now() - Duration::from_secs(14);
        store.add(snapshot);

        poller.poll_addresses().await;
        let sent = client.sent();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].command, GroupEventCommand::GroupRead);
        assert_eq!(sent[0].destination, "0/0/1".parse().unwrap());
        assert_eq!(sent[0].source, "2.0.1".parse().unwrap());
    }

    #[tokio::test]
    async fn test_fresh_snapshot_skipped() {
        let config = config_with(vec![(
            "0/0/1",
            entry("m", true, Some(Duration::from_secs(20))),
        )]);
        let client = Arc::new(FakeGroupClient::new());
        let (poller, store) = poller_for(&config, Arc::clone(&client));

        let mut snapshot = Snapshot::now(
            "knx_m",
            "1.1.8".parse().unwrap(),
            "0/0/1".parse().unwrap(),
            1.0,
            Arc::new(entry("m", true, Some(Duration::from_secs(20)))),
        );
        snapshot.timestamp = StdInstant::now() - Duration::from_secs(14);
        store.add(snapshot);

        poller.poll_addresses().await;
        assert!(client.sent().is_empty());
    }

    #[tokio::test]
    async fn test_missing_snapshot_triggers_initial_read() {
        let config = config_with(vec![(
            "0/0/1",
            entry("m", true, Some(Duration::from_secs(10))),
        )]);
        let client = Arc::new(FakeGroupClient::new());
        let (poller, _store) = poller_for(&config, Arc::clone(&client));

        poller.poll_addresses().await;
        assert_eq!(client.sent().len(), 1);
    }

    #[tokio::test]
    async fn test_send_errors_do_not_halt_polling() {
        let config = config_with(vec![
            ("0/0/1", entry("a", true, Some(Duration::from_secs(10)))),
            ("0/0/2", entry("b", true, Some(Duration::from_secs(10)))),
        ]);
        let client = Arc::new(FakeGroupClient::new());
        client.fail_sends(true);
        let store = Arc::new(MetricSnapshots::new());
        let message_counter = counter();
        let poller = Poller::new(
            &config,
            Arc::clone(&client) as Arc<dyn GroupClient>,
            store,
            message_counter.clone(),
            CancellationToken::new(),
        );

        poller.poll_addresses().await;
        assert_eq!(message_counter.with_label_values(&["sent", "true"]).get(), 2);
    }

    #[tokio::test]
    async fn test_run_returns_immediately_without_targets() {
        let (poller, _) = poller_for(&config_with(vec![]), Arc::new(FakeGroupClient::new()));
        // Must not hang.
        poller.run().await;
    }
}
