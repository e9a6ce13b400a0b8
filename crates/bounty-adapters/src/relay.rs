use async_trait::async_trait;
use bounty_core::{BountyError, EventFilter, RelayClient, RelayEvent};
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;
use tracing::{debug, warn};

const SUBSCRIPTION_BUFFER: usize = 1024;

#[derive(Debug, Default)]
struct RelayHub {
    events: Vec<RelayEvent>,
    subscribers: Vec<(EventFilter, mpsc::Sender<RelayEvent>)>,
    offline: bool,
}

impl RelayHub {
    fn fan_out(&mut self, event: &RelayEvent) {
        self.subscribers.retain(|(filter, sender)| {
            if !filter.matches(event) {
                return !sender.is_closed();
            }
            match sender.try_send(event.clone()) {
                Ok(()) => true,
                Err(mpsc::error::TrySendError::Full(_)) => {
                    warn!(event_id = %event.id, "subscriber buffer full, event left for backfill");
                    true
                }
                Err(mpsc::error::TrySendError::Closed(_)) => false,
            }
        });
    }
}

/// In-process relay hub shared by every handle cloned from it.
///
/// Stores all events so subscriptions and queries can replay from a
/// timestamp, and can be switched offline to simulate an unreachable
/// network.
#[derive(Debug, Clone)]
pub struct LocalRelay {
    name: String,
    hub: Arc<Mutex<RelayHub>>,
}

impl Default for LocalRelay {
    fn default() -> Self {
        Self::new("local://relay")
    }
}

impl LocalRelay {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            hub: Arc::new(Mutex::new(RelayHub::default())),
        }
    }

    pub fn set_offline(&self, offline: bool) {
        if let Ok(mut hub) = self.hub.lock() {
            hub.offline = offline;
        }
    }

    /// Everything published so far, in publish order.
    pub fn events(&self) -> Vec<RelayEvent> {
        self.hub
            .lock()
            .map(|hub| hub.events.clone())
            .unwrap_or_default()
    }

    /// Push a stored event to live subscribers again, as a relay does after
    /// a reconnect.
    pub fn redeliver(&self, event_id: &str) -> bool {
        let Ok(mut hub) = self.hub.lock() else {
            return false;
        };
        let Some(event) = hub.events.iter().find(|event| event.id == event_id).cloned() else {
            return false;
        };
        hub.fan_out(&event);
        true
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, RelayHub>, BountyError> {
        let hub = self
            .hub
            .lock()
            .map_err(|_| BountyError::Transport("relay hub lock poisoned".to_string()))?;
        if hub.offline {
            return Err(BountyError::Transport(format!("{} unreachable", self.name)));
        }
        Ok(hub)
    }
}

#[async_trait]
impl RelayClient for LocalRelay {
    async fn publish(&self, event: RelayEvent) -> Result<String, BountyError> {
        let mut hub = self.lock()?;
        let id = event.id.clone();
        if hub.events.iter().any(|stored| stored.id == id) {
            debug!(event_id = %id, "relay already holds event");
            return Ok(id);
        }
        hub.fan_out(&event);
        hub.events.push(event);
        Ok(id)
    }

    async fn subscribe(&self, filter: EventFilter) -> Result<mpsc::Receiver<RelayEvent>, BountyError> {
        let mut hub = self.lock()?;
        let (sender, receiver) = mpsc::channel(SUBSCRIPTION_BUFFER);
        for event in hub.events.iter().filter(|event| filter.matches(event)) {
            if sender.try_send(event.clone()).is_err() {
                break;
            }
        }
        hub.subscribers.push((filter, sender));
        Ok(receiver)
    }

    async fn query_once(&self, filter: &EventFilter) -> Result<Vec<RelayEvent>, BountyError> {
        let hub = self.lock()?;
        Ok(hub
            .events
            .iter()
            .filter(|event| filter.matches(event))
            .cloned()
            .collect())
    }

    fn connected_relays(&self) -> Vec<String> {
        match self.hub.lock() {
            Ok(hub) if !hub.offline => vec![self.name.clone()],
            _ => Vec::new(),
        }
    }
}
