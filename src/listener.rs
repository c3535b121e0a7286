//! The listener: turns inbound group events into snapshots.
//!
//! One long-lived task consumes the client's inbound stream until it ends.
//! Every event is counted; events that produce a snapshot are counted a
//! second time as processed. Unknown destinations, unexported addresses,
//! read queries and undecodable payloads are dropped without stopping the
//! loop.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use prometheus::IntCounterVec;
use tokio::sync::mpsc;
use tracing::{info, trace, warn};

use crate::addressing::GroupAddress;
use crate::client::{GroupEvent, GroupEventCommand};
use crate::config::{Config, GroupAddressConfig};
use crate::dpt;
use crate::snapshot::{MetricSnapshots, Snapshot};

/// Per address lookup data, resolved once at construction.
struct Target {
    name: String,
    config: Arc<GroupAddressConfig>,
}

/// Decodes inbound events into snapshots.
pub struct Listener {
    targets: HashMap<GroupAddress, Target>,
    store: Arc<MetricSnapshots>,
    message_counter: IntCounterVec,
    active: Arc<AtomicBool>,
}

impl std::fmt::Debug for Listener {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Listener")
            .field("targets", &self.targets.len())
            .finish_non_exhaustive()
    }
}

impl Listener {
    /// Create a listener for the configured addresses.
    pub fn new(
        config: &Config,
        store: Arc<MetricSnapshots>,
        message_counter: IntCounterVec,
        active: Arc<AtomicBool>,
    ) -> Self {
        let targets = config
            .address_configs
            .iter()
            .map(|(address, address_config)| {
                (
                    *address,
                    Target {
                        name: config.name_for(address_config),
                        config: Arc::new(address_config.clone()),
                    },
                )
            })
            .collect();

        Self {
            targets,
            store,
            message_counter,
            active,
        }
    }

    /// Consume the inbound stream until it closes.
    ///
    /// The active flag is true exactly while the loop runs; liveness checks
    /// observe it.
    pub async fn run(self, mut inbound: mpsc::Receiver<GroupEvent>) {
        self.active.store(true, Ordering::SeqCst);
        info!("waiting for incoming knx telegrams");
        while let Some(event) = inbound.recv().await {
            self.handle_event(event);
        }
        info!("inbound event stream closed");
        self.active.store(false, Ordering::SeqCst);
    }

    fn handle_event(&self, event: GroupEvent) {
        self.message_counter
            .with_label_values(&["received", "false"])
            .inc();

        let Some(target) = self.targets.get(&event.destination) else {
            trace!(
                command = %event.command,
                source = %event.source,
                destination = %event.destination,
                "got ignored telegram for unconfigured address"
            );
            return;
        };
        if !target.config.export {
            trace!(
                source = %event.source,
                destination = %event.destination,
                "got telegram for unexported address"
            );
            return;
        }
        // Reads are queries authored elsewhere, not values.
        if event.command == GroupEventCommand::GroupRead {
            trace!(
                source = %event.source,
                destination = %event.destination,
                "ignoring group read query"
            );
            return;
        }

        let value = match dpt::decode(target.config.dpt, &event.data) {
            Ok(value) => value,
            Err(e) => {
                warn!(
                    command = %event.command,
                    source = %event.source,
                    destination = %event.destination,
                    dpt = %target.config.dpt,
                    error = %e,
                    "can not unpack telegram payload"
                );
                return;
            }
        };

        trace!(
            value = %value,
            metric = %target.name,
            destination = %event.destination,
            "processed value"
        );
        self.store.add(Snapshot::now(
            target.name.clone(),
            event.source,
            event.destination,
            value.as_f64(),
            Arc::clone(&target.config),
        ));
        self.message_counter
            .with_label_values(&["received", "true"])
            .inc();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::addressing::IndividualAddress;
    use crate::config::MetricType;
    use crate::snapshot::SnapshotKey;
    use prometheus::Opts;

    fn counter() -> IntCounterVec {
        IntCounterVec::new(
            Opts::new("messages", "exchanged messages").namespace("knx"),
            &["direction", "processed"],
        )
        .unwrap()
    }

    fn test_config() -> Config {
        let mut config = Config {
            metrics_prefix: "knx_".to_owned(),
            ..Config::default()
        };
        let entries = [
            ("0/0/1", "a", "1.001"),
            ("0/0/2", "b", "5.001"),
            ("0/0/3", "c", "9.001"),
            ("0/0/4", "d", "12.001"),
            ("0/0/5", "e", "13.001"),
            ("0/0/6", "f", "14.001"),
        ];
        for (address, name, dpt) in entries {
            config.address_configs.insert(
                address.parse().unwrap(),
                GroupAddressConfig {
                    name: name.to_owned(),
                    dpt: dpt.parse().unwrap(),
                    metric_type: MetricType::Gauge,
                    export: true,
                    ..GroupAddressConfig::default()
                },
            );
        }
        // 0/0/7 exists but is not exported.
        config.address_configs.insert(
            "0/0/7".parse().unwrap(),
            GroupAddressConfig {
                name: "g".to_owned(),
                dpt: "1.001".parse().unwrap(),
                export: false,
                ..GroupAddressConfig::default()
            },
        );
        config
    }

    struct Fixture {
        listener: Listener,
        store: Arc<MetricSnapshots>,
        counter: IntCounterVec,
    }

    fn fixture() -> Fixture {
        let store = Arc::new(MetricSnapshots::new());
        let counter = counter();
        let listener = Listener::new(
            &test_config(),
            Arc::clone(&store),
            counter.clone(),
            Arc::new(AtomicBool::new(false)),
        );
        Fixture {
            listener,
            store,
            counter,
        }
    }

    fn write_event(destination: &str, data: &[u8]) -> GroupEvent {
        GroupEvent {
            command: GroupEventCommand::GroupWrite,
            source: IndividualAddress::new(1, 1, 8).unwrap(),
            destination: destination.parse().unwrap(),
            data: data.to_vec(),
        }
    }

    fn stored_value(store: &MetricSnapshots, destination: &str) -> f64 {
        store
            .find(SnapshotKey {
                source: IndividualAddress::new(1, 1, 8).unwrap(),
                target: destination.parse().unwrap(),
            })
            .unwrap()
            .value
    }

    #[test]
    fn test_decodes_all_supported_families() {
        let f = fixture();
        let cases: &[(&str, &[u8], f64)] = &[
            ("0/0/1", &[0x00], 0.0),
            ("0/0/1", &[0x01], 1.0),
            ("0/0/2", &[0x00, 0xFF], 100.0),
            ("0/0/3", &[0x00, 0x02, 0x26], 5.5),
            ("0/0/4", &[0x00, 0x00, 0x00, 0x00, 0x05], 5.0),
            ("0/0/5", &[0x00, 0x00, 0x00, 0x00, 0x05], 5.0),
            ("0/0/6", &[0x00, 0x3F, 0xC0, 0x00, 0x00], 1.5),
        ];
        for (destination, data, expected) in cases {
            f.listener.handle_event(write_event(destination, data));
            assert_eq!(
                stored_value(&f.store, destination),
                *expected,
                "wrong value for {destination}"
            );
        }

        let processed = f
            .counter
            .with_label_values(&["received", "true"])
            .get();
        assert_eq!(processed, cases.len() as u64);
    }

    #[test]
    fn test_snapshot_metadata() {
        let f = fixture();
        f.listener.handle_event(write_event("0/0/3", &[0x00, 0x02, 0x26]));

        let snapshot = f.store.find_youngest("knx_c").unwrap();
        assert_eq!(snapshot.name, "knx_c");
        assert_eq!(snapshot.destination, "0/0/3".parse().unwrap());
        assert_eq!(snapshot.source, IndividualAddress::new(1, 1, 8).unwrap());
    }

    #[test]
    fn test_unknown_destination_dropped() {
        let f = fixture();
        f.listener.handle_event(write_event("0/0/255", &[0x01]));

        assert!(f.store.is_empty());
        assert_eq!(f.counter.with_label_values(&["received", "false"]).get(), 1);
        assert_eq!(f.counter.with_label_values(&["received", "true"]).get(), 0);
    }

    #[test]
    fn test_unexported_address_dropped() {
        let f = fixture();
        f.listener.handle_event(write_event("0/0/7", &[0x01]));
        assert!(f.store.is_empty());
        assert_eq!(f.counter.with_label_values(&["received", "true"]).get(), 0);
    }

    #[test]
    fn test_group_reads_never_produce_snapshots() {
        let f = fixture();
        for destination in ["0/0/1", "0/0/2", "0/0/3"] {
            f.listener.handle_event(GroupEvent::read(
                IndividualAddress::new(1, 1, 8).unwrap(),
                destination.parse().unwrap(),
            ));
        }
        assert!(f.store.is_empty());
        assert_eq!(f.counter.with_label_values(&["received", "false"]).get(), 3);
        assert_eq!(f.counter.with_label_values(&["received", "true"]).get(), 0);
    }

    #[test]
    fn test_short_payload_dropped() {
        let f = fixture();
        f.listener.handle_event(write_event("0/0/2", &[0x00]));
        assert!(f.store.is_empty());
        assert_eq!(f.counter.with_label_values(&["received", "true"]).get(), 0);
    }

    #[test]
    fn test_group_response_produces_snapshot() {
        let f = fixture();
        let mut event = write_event("0/0/1", &[0x01]);
        event.command = GroupEventCommand::GroupResponse;
        f.listener.handle_event(event);
        assert_eq!(stored_value(&f.store, "0/0/1"), 1.0);
    }

    #[tokio::test]
    async fn test_active_flag_follows_stream() {
        let store = Arc::new(MetricSnapshots::new());
        let active = Arc::new(AtomicBool::new(false));
        let listener = Listener::new(
            &test_config(),
            store,
            counter(),
            Arc::clone(&active),
        );

        let (tx, rx) = mpsc::channel(4);
        let handle = tokio::spawn(listener.run(rx));

        tx.send(write_event("0/0/1", &[0x01])).await.unwrap();
        tokio::time::timeout(std::time::Duration::from_secs(1), async {
            while !active.load(Ordering::SeqCst) {
                tokio::task::yield_now().await;
            }
        })
        .await
        .expect("listener never became active");

        drop(tx);
        handle.await.unwrap();
        assert!(!active.load(Ordering::SeqCst));
    }
}
