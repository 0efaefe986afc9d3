//! Outbound lifecycle signals for the host UI.

use tokio::sync::broadcast;
use tracing::debug;

use crate::queue::RecordId;

const DEFAULT_CAPACITY: usize = 64;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CoreSignal {
    /// The action was stored on the device, not delivered.
    OfflineCaptured {
        id: RecordId,
        vibrate_pattern: Vec<u32>,
    },
    Synced {
        id: RecordId,
    },
    CacheVersionPromoted {
        name: String,
    },
}

/// Fan-out of [`CoreSignal`]s. Cloning shares the same channel.
#[derive(Debug, Clone)]
pub struct SignalBus {
    tx: broadcast::Sender<CoreSignal>,
}

impl Default for SignalBus {
    fn default() -> Self {
        Self::new(DEFAULT_CAPACITY)
    }
}

impl SignalBus {
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<CoreSignal> {
        self.tx.subscribe()
    }

    /// Best effort: nobody listening is not an error.
    pub fn emit(&self, signal: CoreSignal) {
        if let Err(broadcast::error::SendError(signal)) = self.tx.send(signal) {
            debug!(?signal, "no signal subscribers");
        }
    }
}
