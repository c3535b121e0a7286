//! Scripted group client for tests.
//!
//! The fake plays back a scripted sequence of inbound events and records
//! every send, so listener, poller and exporter behavior can be verified
//! without a bus connection.

use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::mpsc;

use crate::error::SendError;

use super::{GroupClient, GroupEvent};

/// A [`GroupClient`] test double.
#[derive(Debug)]
pub struct FakeGroupClient {
    script_tx: Mutex<Option<mpsc::Sender<GroupEvent>>>,
    inbound_rx: Mutex<Option<mpsc::Receiver<GroupEvent>>>,
    sent: Mutex<Vec<GroupEvent>>,
    fail_sends: AtomicBool,
}

impl FakeGroupClient {
    /// Create a fake client with an open inbound stream.
    pub fn new() -> Self {
        let (script_tx, inbound_rx) = mpsc::channel(64);
        Self {
            script_tx: Mutex::new(Some(script_tx)),
            inbound_rx: Mutex::new(Some(inbound_rx)),
            sent: Mutex::new(Vec::new()),
            fail_sends: AtomicBool::new(false),
        }
    }

    /// Feed one inbound event to the consumer.
    ///
    /// # Panics
    ///
    /// Panics if the client was closed or the consumer dropped the stream.
    pub async fn push(&self, event: GroupEvent) {
        let tx = self
            .script_tx
            .lock()
            .clone()
            .expect("fake client is closed");
        tx.send(event).await.expect("inbound consumer is gone");
    }

    /// All events passed to [`GroupClient::send`] so far.
    pub fn sent(&self) -> Vec<GroupEvent> {
        self.sent.lock().clone()
    }

    /// Make subsequent sends fail, to exercise error recovery paths.
    pub fn fail_sends(&self, fail: bool) {
        self.fail_sends.store(fail, Ordering::SeqCst);
    }
}

impl Default for FakeGroupClient {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl GroupClient for FakeGroupClient {
    async fn send(&self, event: GroupEvent) -> Result<(), SendError> {
        if self.fail_sends.load(Ordering::SeqCst) {
            return Err(SendError::Closed);
        }
        self.sent.lock().push(event);
        Ok(())
    }

    fn inbound(&self) -> Option<mpsc::Receiver<GroupEvent>> {
        self.inbound_rx.lock().take()
    }

    async fn close(&self) {
        self.script_tx.lock().take();
    }
}
