//! The exporter coordinator.
//!
//! Builds the group client selected by the configuration, wires listener,
//! startup reader and poller around the snapshot store, and exposes the
//! liveness of the whole pipeline. A single cancellation token tears
//! everything down: closing the client ends the inbound stream, which ends
//! the listener; poller and startup reader observe the token between sends.

use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::RwLock;
use prometheus::{IntCounterVec, Opts, Registry};
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::client::router::RouterClient;
use crate::client::tunnel::TunnelClient;
use crate::client::GroupClient;
use crate::config::{Config, ConnectionType};
use crate::error::{ConnectError, ExporterError};
use crate::listener::Listener;
use crate::poller::Poller;
use crate::snapshot::MetricSnapshots;
use crate::startup::StartupReader;

/// Coordinates the bus-to-metrics pipeline.
pub struct MetricsExporter {
    config: Arc<Config>,
    store: Arc<MetricSnapshots>,
    message_counter: IntCounterVec,
    listener_active: Arc<AtomicBool>,
    /// Latched construction error; once set the exporter reports unhealthy.
    health: RwLock<Option<String>>,
    shutdown: CancellationToken,
}

impl std::fmt::Debug for MetricsExporter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MetricsExporter")
            .field("addresses", &self.config.address_configs.len())
            .finish_non_exhaustive()
    }
}

impl MetricsExporter {
    /// Create an exporter for a validated configuration and register its
    /// message counter with the given registry.
    pub fn new(config: Config, registry: &Registry) -> Result<Self, ExporterError> {
        let message_counter = IntCounterVec::new(
            Opts::new("messages", "The number of messages exchanged with the knx system")
                .namespace("knx"),
            &["direction", "processed"],
        )?;
        registry.register(Box::new(message_counter.clone()))?;

        Ok(Self {
            config: Arc::new(config),
            store: Arc::new(MetricSnapshots::new()),
            message_counter,
            listener_active: Arc::new(AtomicBool::new(true)),
            health: RwLock::new(None),
            shutdown: CancellationToken::new(),
        })
    }

    /// Load the configuration file and create an exporter for it.
    pub fn from_file(
        config_file: impl AsRef<Path>,
        registry: &Registry,
    ) -> Result<Self, ExporterError> {
        let config = Config::load(config_file)?;
        Self::new(config, registry)
    }

    /// Connect to the bus and start the pipeline tasks.
    ///
    /// Returns once everything is running; the tasks keep going until
    /// `shutdown` is cancelled. Connection failures are latched into the
    /// health state before they are returned.
    pub async fn run(&self, shutdown: CancellationToken) -> Result<(), ExporterError> {
        let client = match self.create_client().await {
            Ok(client) => client,
            Err(e) => {
                *self.health.write() = Some(e.to_string());
                return Err(e.into());
            }
        };
        self.start(client, shutdown)
    }

    /// Start the pipeline on an already connected client.
    ///
    /// This is the seam for tests and custom transports; [`run`] uses it
    /// with the client selected by the configuration.
    ///
    /// [`run`]: MetricsExporter::run
    pub fn start(
        &self,
        client: Arc<dyn GroupClient>,
        shutdown: CancellationToken,
    ) -> Result<(), ExporterError> {
        let Some(inbound) = client.inbound() else {
            *self.health.write() = Some("inbound event stream already consumed".to_owned());
            return Err(ExporterError::InboundTaken);
        };

        // Forward external cancellation into the exporter's own token so
        // `close` and the caller's token both stop the same tasks.
        let own = self.shutdown.clone();
        tokio::spawn(async move {
            shutdown.cancelled().await;
            own.cancel();
        });

        let listener = Listener::new(
            &self.config,
            Arc::clone(&self.store),
            self.message_counter.clone(),
            Arc::clone(&self.listener_active),
        );
        tokio::spawn(listener.run(inbound));

        let startup_reader = StartupReader::new(
            &self.config,
            Arc::clone(&client),
            self.message_counter.clone(),
            self.shutdown.clone(),
        );
        tokio::spawn(startup_reader.run());

        let poller = Poller::new(
            &self.config,
            Arc::clone(&client),
            Arc::clone(&self.store),
            self.message_counter.clone(),
            self.shutdown.clone(),
        );
        tokio::spawn(poller.run());

        // Closing the client ends the inbound stream and with it the
        // listener.
        let token = self.shutdown.clone();
        let store = Arc::clone(&self.store);
        tokio::spawn(async move {
            token.cancelled().await;
            client.close().await;
            store.close();
        });

        Ok(())
    }

    async fn create_client(&self) -> Result<Arc<dyn GroupClient>, ConnectError> {
        let connection = &self.config.connection;
        match connection.connection_type {
            ConnectionType::Tunnel => {
                info!(endpoint = %connection.endpoint, "connect using tunneling");
                let client =
                    TunnelClient::connect(&connection.endpoint, connection.tunnel_config.clone())
                        .await?;
                Ok(Arc::new(client))
            }
            ConnectionType::Router => {
                info!(endpoint = %connection.endpoint, "connect using multicast routing");
                let client =
                    RouterClient::connect(&connection.endpoint, connection.router_config.clone())
                        .await?;
                Ok(Arc::new(client))
            }
        }
    }

    /// Liveness of the pipeline: healthy while no construction error was
    /// latched, the listener consumes events and the store accepts them.
    pub fn is_alive(&self) -> Result<(), String> {
        if let Some(error) = self.health.read().as_ref() {
            return Err(error.clone());
        }
        if !self.listener_active.load(Ordering::SeqCst) {
            return Err("the knx event listener is not running".to_owned());
        }
        if !self.store.is_active() {
            return Err("the snapshot store is closed".to_owned());
        }
        Ok(())
    }

    /// The snapshot store backing the scrape endpoint.
    pub fn store(&self) -> Arc<MetricSnapshots> {
        Arc::clone(&self.store)
    }

    /// Stop all pipeline tasks and close the client.
    pub fn close(&self) {
        self.shutdown.cancel();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::fake::FakeGroupClient;
    use crate::client::{GroupEvent, GroupEventCommand};
    use crate::config::{GroupAddressConfig, MetricType};
    use std::time::Duration;

    fn test_config() -> Config {
        let mut config = Config {
            metrics_prefix: "knx_".to_owned(),
            ..Config::default()
        };
        config.address_configs.insert(
            "0/0/1".parse().unwrap(),
            GroupAddressConfig {
                name: "a".to_owned(),
                dpt: "1.001".parse().unwrap(),
                metric_type: MetricType::Gauge,
                export: true,
                ..GroupAddressConfig::default()
            },
        );
        config
    }

    async fn wait_for<F: Fn() -> bool>(what: &str, predicate: F) {
        tokio::time::timeout(Duration::from_secs(1), async {
            while !predicate() {
                tokio::task::yield_now().await;
            }
        })
        .await
        .unwrap_or_else(|_| panic!("timed out waiting for {what}"));
    }

    #[tokio::test]
    async fn test_pipeline_stores_snapshots() {
        let registry = Registry::new();
        let exporter = MetricsExporter::new(test_config(), &registry).unwrap();
        let client = Arc::new(FakeGroupClient::new());

        exporter
            .start(
                Arc::clone(&client) as Arc<dyn GroupClient>,
                CancellationToken::new(),
            )
            .unwrap();

        client
            .push(GroupEvent {
                command: GroupEventCommand::GroupWrite,
                source: "1.1.8".parse().unwrap(),
                destination: "0/0/1".parse().unwrap(),
                data: vec![0x01],
            })
            .await;

        let store = exporter.store();
        wait_for("the snapshot", || !store.is_empty()).await;
        assert_eq!(store.find_youngest("knx_a").unwrap().value, 1.0);
        assert!(exporter.is_alive().is_ok());
    }

    #[tokio::test]
    async fn test_close_degrades_liveness() {
        let registry = Registry::new();
        let exporter = MetricsExporter::new(test_config(), &registry).unwrap();
        let client = Arc::new(FakeGroupClient::new());

        exporter
            .start(
                Arc::clone(&client) as Arc<dyn GroupClient>,
                CancellationToken::new(),
            )
            .unwrap();
        assert!(exporter.is_alive().is_ok());

        exporter.close();
        wait_for("liveness to degrade", || exporter.is_alive().is_err()).await;
    }

    #[tokio::test]
    async fn test_external_cancellation_stops_pipeline() {
        let registry = Registry::new();
        let exporter = MetricsExporter::new(test_config(), &registry).unwrap();
        let client = Arc::new(FakeGroupClient::new());
        let shutdown = CancellationToken::new();

        exporter
            .start(Arc::clone(&client) as Arc<dyn GroupClient>, shutdown.clone())
            .unwrap();

        shutdown.cancel();
        wait_for("liveness to degrade", || exporter.is_alive().is_err()).await;
    }

    #[tokio::test]
    async fn test_connect_failure_latches_health() {
        let mut config = test_config();
        config.connection.endpoint = "not-an-endpoint".to_owned();
        config.connection.connection_type = ConnectionType::Router;

        let registry = Registry::new();
        let exporter = MetricsExporter::new(config, &registry).unwrap();
        assert!(exporter.run(CancellationToken::new()).await.is_err());
        assert!(exporter.is_alive().is_err());
    }

    #[tokio::test]
    async fn test_start_rejects_consumed_inbound() {
        let registry = Registry::new();
        let exporter = MetricsExporter::new(test_config(), &registry).unwrap();
        let client = Arc::new(FakeGroupClient::new());
        let _inbound = client.inbound().unwrap();

        let result = exporter.start(
            Arc::clone(&client) as Arc<dyn GroupClient>,
            CancellationToken::new(),
        );
        assert!(result.is_err());
        assert!(exporter.is_alive().is_err());
    }

    #[tokio::test]
    async fn test_message_counter_registered() {
        let registry = Registry::new();
        let _exporter = MetricsExporter::new(test_config(), &registry).unwrap();
        // The counter only shows up in the gather output once it has values,
        // but double registration must fail.
        assert!(MetricsExporter::new(test_config(), &registry).is_err());
    }
}
