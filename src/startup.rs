//! The startup reader: one paced read sweep after the connection is up.
//!
//! Many KNX devices only publish on change, so their values would stay
//! unknown until the next change after a restart. Addresses marked with
//! `readStartup` are queried once at boot, one request per tick of the
//! configured interval so the bus is not flooded.

use std::sync::Arc;
use std::time::Duration;

use prometheus::IntCounterVec;
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use crate::addressing::{GroupAddress, IndividualAddress};
use crate::client::GroupClient;
use crate::config::{Config, GroupAddressConfig};

/// Sends one read request per configured address after startup.
pub struct StartupReader {
    client: Arc<dyn GroupClient>,
    physical_address: IndividualAddress,
    interval: Duration,
    addresses: Vec<(GroupAddress, GroupAddressConfig)>,
    message_counter: IntCounterVec,
    shutdown: CancellationToken,
}

impl std::fmt::Debug for StartupReader {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StartupReader")
            .field("addresses", &self.addresses.len())
            .field("interval", &self.interval)
            .finish_non_exhaustive()
    }
}

impl StartupReader {
    /// Create a startup reader over the startup read set of the config.
    pub fn new(
        config: &Config,
        client: Arc<dyn GroupClient>,
        message_counter: IntCounterVec,
        shutdown: CancellationToken,
    ) -> Self {
        Self {
            client,
            physical_address: config.connection.physical_address,
            interval: config.read_startup_interval(),
            addresses: startup_read_set(config),
            message_counter,
            shutdown,
        }
    }

    /// Send the sweep. Terminates when the set is exhausted or on
    /// cancellation.
    pub async fn run(self) {
        if self.addresses.is_empty() {
            return;
        }
        info!(
            count = self.addresses.len(),
            interval = ?self.interval,
            "start reading addresses after startup"
        );

        for (address, address_config) in &self.addresses {
            tokio::select! {
                () = self.shutdown.cancelled() => return,
                () = sleep(self.interval) => {}
            }

            let event = address_config.read_request(self.physical_address, *address);
            if let Err(e) = self.client.send(event).await {
                error!(
                    destination = %address,
                    error = %e,
                    "can not send read request"
                );
            }
            self.message_counter
                .with_label_values(&["sent", "true"])
                .inc();
        }
        info!("startup read sweep finished");
    }
}

/// The addresses read at startup: exported and marked `readStartup`,
/// in address order.
fn startup_read_set(config: &Config) -> Vec<(GroupAddress, GroupAddressConfig)> {
    let mut addresses: Vec<_> = config
        .address_configs
        .iter()
        .filter(|(_, c)| c.export && c.read_startup)
        .map(|(address, c)| (*address, c.clone()))
        .collect();
    addresses.sort_by_key(|(address, _)| *address);
    addresses
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::fake::FakeGroupClient;
    use crate::client::GroupEventCommand;
    use crate::config::ReadType;
    use prometheus::Opts;

    fn counter() -> IntCounterVec {
        IntCounterVec::new(
            Opts::new("messages", "exchanged messages").namespace("knx"),
            &["direction", "processed"],
        )
        .unwrap()
    }

    fn entry(export: bool, read_startup: bool) -> GroupAddressConfig {
        GroupAddressConfig {
            name: "a".to_owned(),
            dpt: "1.001".parse().unwrap(),
            export,
            read_startup,
            ..GroupAddressConfig::default()
        }
    }

    fn config_with(entries: &[(&str, GroupAddressConfig)]) -> Config {
        let mut config = Config::default();
        config.connection.physical_address = "2.0.1".parse().unwrap();
        config.read_startup_interval = Some(Duration::from_millis(1));
        for (address, entry) in entries {
            config
                .address_configs
                .insert(address.parse().unwrap(), entry.clone());
        }
        config
    }

    #[test]
    fn test_startup_read_set_filters() {
        let config = config_with(&[
            ("0/0/1", entry(false, false)),
            ("0/0/2", entry(true, false)),
            ("0/0/3", entry(false, true)),
            ("0/0/4", entry(true, true)),
            ("0/0/5", entry(true, true)),
        ]);

        let set = startup_read_set(&config);
        let addresses: Vec<String> = set.iter().map(|(a, _)| a.to_string()).collect();
        assert_eq!(addresses, vec!["0/0/4", "0/0/5"]);
    }

    #[tokio::test]
    async fn test_sends_one_read_per_address() {
        let config = config_with(&[
            ("0/0/1", entry(true, true)),
            ("0/0/2", entry(true, true)),
            ("0/0/3", entry(true, false)),
        ]);
        let client = Arc::new(FakeGroupClient::new());
        let counter = counter();

        let reader = StartupReader::new(
            &config,
            Arc::clone(&client) as Arc<dyn GroupClient>,
            counter.clone(),
            CancellationToken::new(),
        );
        reader.run().await;

        let sent = client.sent();
        assert_eq!(sent.len(), 2);
        assert!(sent.iter().all(|e| e.command == GroupEventCommand::GroupRead));
        assert!(sent.iter().all(|e| e.source == "2.0.1".parse().unwrap()));
        let destinations: Vec<String> =
            sent.iter().map(|e| e.destination.to_string()).collect();
        assert_eq!(destinations, vec!["0/0/1", "0/0/2"]);
        assert_eq!(counter.with_label_values(&["sent", "true"]).get(), 2);
    }

    #[tokio::test]
    async fn test_write_other_sends_write() {
        let mut trigger = entry(true, true);
        trigger.read_type = ReadType::WriteOther;
        trigger.read_address = Some("0/0/9".parse().unwrap());
        trigger.read_body = vec![0x01];
        let config = config_with(&[("0/0/1", trigger)]);

        let client = Arc::new(FakeGroupClient::new());
        let reader = StartupReader::new(
            &config,
            Arc::clone(&client) as Arc<dyn GroupClient>,
            counter(),
            CancellationToken::new(),
        );
        reader.run().await;

        let sent = client.sent();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].command, GroupEventCommand::GroupWrite);
        assert_eq!(sent[0].destination, "0/0/9".parse().unwrap());
        assert_eq!(sent[0].data, vec![0x01]);
    }

    #[tokio::test]
    async fn test_cancellation_stops_sweep() {
        let config = config_with(&[
            ("0/0/1", entry(true, true)),
            ("0/0/2", entry(true, true)),
        ]);
        let client = Arc::new(FakeGroupClient::new());
        let token = CancellationToken::new();
        token.cancel();

        let reader = StartupReader::new(
            &config,
            Arc::clone(&client) as Arc<dyn GroupClient>,
            counter(),
            token,
        );
        reader.run().await;
        assert!(client.sent().is_empty());
    }

    #[tokio::test]
    async fn test_send_errors_do_not_stop_sweep() {
        let config = config_with(&[
            ("0/0/1", entry(true, true)),
            ("0/0/2", entry(true, true)),
        ]);
        let client = Arc::new(FakeGroupClient::new());
        client.fail_sends(true);
        let counter = counter();

        let reader = StartupReader::new(
            &config,
            Arc::clone(&client) as Arc<dyn GroupClient>,
            counter.clone(),
            CancellationToken::new(),
        );
        reader.run().await;

        // Both sends were attempted and counted despite the failures.
        assert_eq!(counter.with_label_values(&["sent", "true"]).get(), 2);
    }
}
