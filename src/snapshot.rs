//! The snapshot store.
//!
//! Holds the latest decoded observation per `(source, destination)` pair and
//! backs the scrape endpoint: `describe` yields one cached descriptor per
//! known pair, `collect` one sample. The store is the only shared mutable
//! state in the exporter; a reader-writer lock protects the map so scrapes
//! and lookups never block each other.

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use parking_lot::RwLock;
use prometheus::core::{Collector, Desc};
use prometheus::proto;
use tracing::warn;

use crate::addressing::{GroupAddress, IndividualAddress};
use crate::config::{GroupAddressConfig, MetricType};
use crate::error::StoreError;

/// Identity of a snapshot: which device reported which group address.
///
/// The same metric name may be fed by several devices; the physical address
/// label disambiguates them on the scrape side.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SnapshotKey {
    /// Reporting device
    pub source: IndividualAddress,
    /// Observed group address
    pub target: GroupAddress,
}

/// One decoded observation of a bus value.
#[derive(Debug, Clone, PartialEq)]
pub struct Snapshot {
    /// Full metric name, prefix included
    pub name: String,
    /// Reporting device
    pub source: IndividualAddress,
    /// Observed group address
    pub destination: GroupAddress,
    /// The decoded value, always finite
    pub value: f64,
    /// Monotonic time of the observation, drives staleness decisions
    pub timestamp: Instant,
    /// Wall clock time of the observation, used for timestamped exposition
    pub wall_time: SystemTime,
    /// The address configuration that produced this snapshot
    pub config: Arc<GroupAddressConfig>,
}

impl Snapshot {
    /// Create a snapshot observed now.
    pub fn now(
        name: impl Into<String>,
        source: IndividualAddress,
        destination: GroupAddress,
        value: f64,
        config: Arc<GroupAddressConfig>,
    ) -> Self {
        Self {
            name: name.into(),
            source,
            destination,
            value,
            timestamp: Instant::now(),
            wall_time: SystemTime::now(),
            config,
        }
    }

    /// The store identity of this snapshot.
    pub fn key(&self) -> SnapshotKey {
        SnapshotKey {
            source: self.source,
            target: self.destination,
        }
    }

    /// Age relative to `now`, truncated to whole seconds.
    pub fn age(&self, now: Instant) -> Duration {
        Duration::from_secs(now.saturating_duration_since(self.timestamp).as_secs())
    }
}

struct Entry {
    snapshot: Snapshot,
    /// Cached descriptor, materialized on first appearance of the key.
    /// `None` when the name or labels were rejected by prometheus; such
    /// entries are kept for lookups but never exported.
    desc: Option<Desc>,
}

#[derive(Default)]
struct Inner {
    snapshots: HashMap<SnapshotKey, Entry>,
    /// First observed metric type per name; later conflicts are rejected.
    types: HashMap<String, MetricType>,
}

/// Concurrent store of the latest snapshot per key.
pub struct MetricSnapshots {
    inner: RwLock<Inner>,
    closed: AtomicBool,
}

impl std::fmt::Debug for MetricSnapshots {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MetricSnapshots")
            .field("len", &self.len())
            .field("closed", &self.closed.load(Ordering::SeqCst))
            .finish()
    }
}

impl Default for MetricSnapshots {
    fn default() -> Self {
        Self::new()
    }
}

impl MetricSnapshots {
    /// Create an empty store.
    pub fn new() -> Self {
        Self {
            inner: RwLock::new(Inner::default()),
            closed: AtomicBool::new(false),
        }
    }

    /// Insert or replace the snapshot for its key.
    ///
    /// The first snapshot of a key materializes the metric descriptor;
    /// repeated inserts only replace the value. Stored timestamps never move
    /// backwards, and a snapshot whose config declares a different metric
    /// type than the first one seen for the same name is rejected.
    pub fn add(&self, snapshot: Snapshot) {
        if !snapshot.value.is_finite() {
            warn!(
                name = %snapshot.name,
                source = %snapshot.source,
                "dropping snapshot with non-finite value"
            );
            return;
        }

        let key = snapshot.key();
        let mut inner = self.inner.write();

        if let Some(entry) = inner.snapshots.get_mut(&key) {
            if snapshot.timestamp >= entry.snapshot.timestamp {
                entry.snapshot = snapshot;
            }
            return;
        }

        let metric_type = snapshot.config.metric_type;
        match inner.types.get(&snapshot.name) {
            Some(first) if *first != metric_type => {
                warn!(
                    name = %snapshot.name,
                    source = %snapshot.source,
                    first = %first,
                    conflicting = %metric_type,
                    "conflicting metric type for already registered metric"
                );
                return;
            }
            Some(_) => {}
            None => {
                inner.types.insert(snapshot.name.clone(), metric_type);
            }
        }

        let desc = match build_desc(&snapshot) {
            Ok(desc) => Some(desc),
            Err(e) => {
                warn!(
                    name = %snapshot.name,
                    source = %snapshot.source,
                    error = %e,
                    "can not register new metric"
                );
                None
            }
        };
        inner.snapshots.insert(key, Entry { snapshot, desc });
    }

    /// Find the snapshot stored for a key.
    pub fn find(&self, key: SnapshotKey) -> Result<Snapshot, StoreError> {
        self.inner
            .read()
            .snapshots
            .get(&key)
            .map(|entry| entry.snapshot.clone())
            .ok_or_else(|| StoreError::NotFound {
                name: key.target.to_string(),
                device: key.source.to_string(),
            })
    }

    /// The most recently timestamped snapshot with the given metric name,
    /// regardless of the reporting device. Ties resolve to the smallest key.
    pub fn find_youngest(&self, name: &str) -> Option<Snapshot> {
        let inner = self.inner.read();
        let mut youngest: Option<(&SnapshotKey, &Entry)> = None;
        for (key, entry) in &inner.snapshots {
            if entry.snapshot.name != name {
                continue;
            }
            let newer = match youngest {
                None => true,
                Some((best_key, best)) => {
                    entry.snapshot.timestamp > best.snapshot.timestamp
                        || (entry.snapshot.timestamp == best.snapshot.timestamp && key < best_key)
                }
            };
            if newer {
                youngest = Some((key, entry));
            }
        }
        youngest.map(|(_, entry)| entry.snapshot.clone())
    }

    /// One descriptor per exportable key.
    pub fn describe(&self) -> Vec<Desc> {
        let inner = self.inner.read();
        let mut keys: Vec<_> = inner
            .snapshots
            .iter()
            .filter(|(_, entry)| entry.desc.is_some())
            .map(|(key, _)| *key)
            .collect();
        keys.sort();
        keys.iter()
            .filter_map(|key| inner.snapshots[key].desc.clone())
            .collect()
    }

    /// One sample per exportable key, grouped into families by metric name.
    pub fn collect_families(&self) -> Vec<proto::MetricFamily> {
        let inner = self.inner.read();
        let mut keys: Vec<_> = inner
            .snapshots
            .iter()
            .filter(|(_, entry)| entry.desc.is_some())
            .map(|(key, _)| *key)
            .collect();
        keys.sort();

        let mut families: BTreeMap<String, proto::MetricFamily> = BTreeMap::new();
        for key in keys {
            let snapshot = &inner.snapshots[&key].snapshot;
            let metric_type = inner
                .types
                .get(&snapshot.name)
                .copied()
                .unwrap_or(snapshot.config.metric_type);

            let family = families.entry(snapshot.name.clone()).or_insert_with(|| {
                let mut family = proto::MetricFamily::default();
                family.set_name(snapshot.name.clone());
                family.set_help(help_text(snapshot));
                family.set_field_type(proto_type(metric_type));
                family
            });
            family.mut_metric().push(build_sample(snapshot, metric_type));
        }
        families.into_values().collect()
    }

    /// Number of stored snapshots.
    pub fn len(&self) -> usize {
        self.inner.read().snapshots.len()
    }

    /// True when no snapshot has been stored yet.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Mark the store as shut down. Liveness checks observe this.
    pub fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
    }

    /// False once the store was closed.
    pub fn is_active(&self) -> bool {
        !self.closed.load(Ordering::SeqCst)
    }
}

impl Collector for MetricSnapshots {
    fn desc(&self) -> Vec<&Desc> {
        // Descriptors are dynamic, one per observed key; the scrape handler
        // merges collected families instead of relying on registration time
        // descriptors.
        Vec::new()
    }

    fn collect(&self) -> Vec<proto::MetricFamily> {
        self.collect_families()
    }
}

fn help_text(snapshot: &Snapshot) -> String {
    format!("Value of {}\n{}", snapshot.destination, snapshot.config.comment)
}

fn build_desc(snapshot: &Snapshot) -> prometheus::Result<Desc> {
    Desc::new(
        snapshot.name.clone(),
        help_text(snapshot),
        Vec::new(),
        label_map(snapshot),
    )
}

fn label_map(snapshot: &Snapshot) -> HashMap<String, String> {
    let mut labels: HashMap<String, String> = snapshot
        .config
        .labels
        .iter()
        .map(|(k, v)| (k.clone(), v.clone()))
        .collect();
    labels.insert("physicalAddress".to_owned(), snapshot.source.to_string());
    labels
}

fn proto_type(metric_type: MetricType) -> proto::MetricType {
    match metric_type {
        MetricType::Counter => proto::MetricType::COUNTER,
        MetricType::Gauge => proto::MetricType::GAUGE,
        MetricType::Untyped => proto::MetricType::UNTYPED,
    }
}

fn build_sample(snapshot: &Snapshot, metric_type: MetricType) -> proto::Metric {
    let mut metric = proto::Metric::default();

    // Stable label order: sorted by label name.
    let labels: BTreeMap<String, String> = label_map(snapshot).into_iter().collect();
    let mut label_pairs = Vec::with_capacity(labels.len());
    for (name, value) in labels {
        let mut pair = proto::LabelPair::default();
        pair.set_name(name);
        pair.set_value(value);
        label_pairs.push(pair);
    }
    metric.set_label(label_pairs);

    match metric_type {
        MetricType::Counter => {
            let mut counter = proto::Counter::default();
            counter.set_value(snapshot.value);
            metric.set_counter(counter);
        }
        MetricType::Gauge => {
            let mut gauge = proto::Gauge::default();
            gauge.set_value(snapshot.value);
            metric.set_gauge(gauge);
        }
        MetricType::Untyped => {
            let mut untyped = proto::Untyped::default();
            untyped.set_value(snapshot.value);
            metric.set_untyped(untyped);
        }
    }

    if snapshot.config.with_timestamp {
        let millis = snapshot
            .wall_time
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis() as i64)
            .unwrap_or_default();
        metric.set_timestamp_ms(millis);
    }

    metric
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ga(s: &str) -> GroupAddress {
        s.parse().unwrap()
    }

    fn pa(s: &str) -> IndividualAddress {
        s.parse().unwrap()
    }

    fn config(metric_type: MetricType) -> Arc<GroupAddressConfig> {
        Arc::new(GroupAddressConfig {
            metric_type,
            comment: "a test metric".to_owned(),
            ..GroupAddressConfig::default()
        })
    }

    fn snapshot(name: &str, source: &str, target: &str, value: f64) -> Snapshot {
        Snapshot::now(name, pa(source), ga(target), value, config(MetricType::Gauge))
    }

    #[test]
    fn test_add_and_find() {
        let store = MetricSnapshots::new();
        let s = snapshot("knx_a", "1.1.1", "0/0/1", 21.5);
        let key = s.key();
        store.add(s);

        let found = store.find(key).unwrap();
        assert_eq!(found.name, "knx_a");
        assert_eq!(found.value, 21.5);
    }

    #[test]
    fn test_find_missing() {
        let store = MetricSnapshots::new();
        let key = SnapshotKey {
            source: pa("1.1.1"),
            target: ga("0/0/1"),
        };
        assert_eq!(
            store.find(key),
            Err(StoreError::NotFound {
                name: "0/0/1".to_owned(),
                device: "1.1.1".to_owned(),
            })
        );
    }

    #[test]
    fn test_add_is_idempotent() {
        let store = MetricSnapshots::new();
        let s = snapshot("knx_a", "1.1.1", "0/0/1", 1.0);
        store.add(s.clone());
        store.add(s.clone());

        assert_eq!(store.len(), 1);
        assert_eq!(store.describe().len(), 1);
        assert_eq!(store.find(s.key()).unwrap().value, 1.0);
    }

    #[test]
    fn test_latest_wins() {
        let store = MetricSnapshots::new();
        let older = snapshot("knx_a", "1.1.1", "0/0/1", 1.0);
        let mut newer = older.clone();
        newer.timestamp = older.timestamp + Duration::from_secs(1);
        newer.value = 2.0;

        store.add(older.clone());
        store.add(newer.clone());
        assert_eq!(store.find(older.key()).unwrap().value, 2.0);

        // An out of order older snapshot never rewinds the store.
        store.add(older);
        assert_eq!(store.find(newer.key()).unwrap().value, 2.0);
    }

    #[test]
    fn test_separate_keys_per_device() {
        let store = MetricSnapshots::new();
        store.add(snapshot("knx_a", "1.1.1", "0/0/1", 1.0));
        store.add(snapshot("knx_a", "1.1.2", "0/0/1", 2.0));

        assert_eq!(store.len(), 2);
        let key = SnapshotKey {
            source: pa("1.1.2"),
            target: ga("0/0/1"),
        };
        assert_eq!(store.find(key).unwrap().value, 2.0);
    }

    #[test]
    fn test_find_youngest() {
        let store = MetricSnapshots::new();
        let now = Instant::now();

        let mut oldest = snapshot("knx_a", "1.1.3", "0/0/1", 1.0);
        oldest.timestamp = now - Duration::from_secs(20);
        let mut middle = snapshot("knx_a", "1.1.2", "0/0/1", 2.0);
        middle.timestamp = now - Duration::from_secs(10);
        let mut youngest = snapshot("knx_a", "1.1.1", "0/0/1", 3.0);
        youngest.timestamp = now;

        store.add(oldest);
        store.add(middle);
        store.add(youngest);
        store.add(snapshot("knx_b", "1.1.1", "0/0/2", 9.0));

        let found = store.find_youngest("knx_a").unwrap();
        assert_eq!(found.value, 3.0);
        assert_eq!(found.source, pa("1.1.1"));
    }

    #[test]
    fn test_find_youngest_no_match() {
        let store = MetricSnapshots::new();
        assert!(store.find_youngest("knx_a").is_none());
        store.add(snapshot("knx_b", "1.1.1", "0/0/2", 9.0));
        assert!(store.find_youngest("knx_a").is_none());
    }

    #[test]
    fn test_describe_one_desc_per_key() {
        let store = MetricSnapshots::new();
        store.add(snapshot("knx_a", "1.1.1", "0/0/1", 1.0));
        store.add(snapshot("knx_a", "1.1.2", "0/0/1", 2.0));
        store.add(snapshot("knx_b", "1.1.1", "0/0/2", 3.0));

        assert_eq!(store.describe().len(), 3);
    }

    #[test]
    fn test_collect_families_grouped_by_name() {
        let store = MetricSnapshots::new();
        store.add(snapshot("knx_a", "1.1.1", "0/0/1", 1.0));
        store.add(snapshot("knx_a", "1.1.2", "0/0/1", 2.0));
        store.add(snapshot("knx_b", "1.1.1", "0/0/2", 3.0));

        let families = store.collect_families();
        assert_eq!(families.len(), 2);

        let a = &families[0];
        assert_eq!(a.get_name(), "knx_a");
        assert_eq!(a.get_field_type(), proto::MetricType::GAUGE);
        assert_eq!(a.get_metric().len(), 2);
        assert!(a.get_help().starts_with("Value of 0/0/1"));

        // Samples carry the physicalAddress label, sorted with the others.
        let label = &a.get_metric()[0].get_label()[0];
        assert_eq!(label.get_name(), "physicalAddress");
        assert_eq!(label.get_value(), "1.1.1");
        assert_eq!(a.get_metric()[0].get_gauge().get_value(), 1.0);
        assert_eq!(a.get_metric()[1].get_gauge().get_value(), 2.0);
    }

    #[test]
    fn test_collect_counter_and_untyped() {
        let store = MetricSnapshots::new();
        store.add(Snapshot::now(
            "knx_pulses",
            pa("1.1.1"),
            ga("0/0/1"),
            42.0,
            config(MetricType::Counter),
        ));
        store.add(Snapshot::now(
            "knx_raw",
            pa("1.1.1"),
            ga("0/0/2"),
            7.0,
            config(MetricType::Untyped),
        ));

        let families = store.collect_families();
        assert_eq!(families[0].get_field_type(), proto::MetricType::COUNTER);
        assert_eq!(families[0].get_metric()[0].get_counter().get_value(), 42.0);
        assert_eq!(families[1].get_field_type(), proto::MetricType::UNTYPED);
        assert_eq!(families[1].get_metric()[0].get_untyped().get_value(), 7.0);
    }

    #[test]
    fn test_collect_with_timestamp() {
        let store = MetricSnapshots::new();
        let mut cfg = GroupAddressConfig::default();
        cfg.metric_type = MetricType::Gauge;
        cfg.with_timestamp = true;
        store.add(Snapshot::now(
            "knx_ts",
            pa("1.1.1"),
            ga("0/0/1"),
            1.0,
            Arc::new(cfg),
        ));

        let families = store.collect_families();
        assert!(families[0].get_metric()[0].get_timestamp_ms() > 0);
    }

    #[test]
    fn test_collect_without_timestamp() {
        let store = MetricSnapshots::new();
        store.add(snapshot("knx_a", "1.1.1", "0/0/1", 1.0));
        let families = store.collect_families();
        assert_eq!(families[0].get_metric()[0].get_timestamp_ms(), 0);
    }

    #[test]
    fn test_config_labels_emitted_sorted() {
        let store = MetricSnapshots::new();
        let mut cfg = GroupAddressConfig {
            metric_type: MetricType::Gauge,
            ..GroupAddressConfig::default()
        };
        cfg.labels.insert("room".to_owned(), "office".to_owned());
        cfg.labels.insert("floor".to_owned(), "1".to_owned());
        store.add(Snapshot::now(
            "knx_t",
            pa("1.1.1"),
            ga("0/0/1"),
            1.0,
            Arc::new(cfg),
        ));

        let families = store.collect_families();
        let labels = families[0].get_metric()[0].get_label();
        let names: Vec<_> = labels.iter().map(|l| l.get_name()).collect();
        assert_eq!(names, vec!["floor", "physicalAddress", "room"]);
    }

    #[test]
    fn test_conflicting_metric_type_rejected() {
        let store = MetricSnapshots::new();
        store.add(Snapshot::now(
            "knx_a",
            pa("1.1.1"),
            ga("0/0/1"),
            1.0,
            config(MetricType::Gauge),
        ));
        // Same name, different device, conflicting type: dropped.
        store.add(Snapshot::now(
            "knx_a",
            pa("1.1.2"),
            ga("0/0/1"),
            2.0,
            config(MetricType::Counter),
        ));

        assert_eq!(store.len(), 1);
        let families = store.collect_families();
        assert_eq!(families[0].get_field_type(), proto::MetricType::GAUGE);
    }

    #[test]
    fn test_non_finite_values_never_stored() {
        let store = MetricSnapshots::new();
        store.add(snapshot("knx_a", "1.1.1", "0/0/1", f64::NAN));
        store.add(snapshot("knx_a", "1.1.1", "0/0/1", f64::INFINITY));
        assert!(store.is_empty());
    }

    #[test]
    fn test_close_deactivates() {
        let store = MetricSnapshots::new();
        assert!(store.is_active());
        store.close();
        assert!(!store.is_active());
    }
}
