use std::collections::{HashMap, VecDeque};
use std::os::fd::OwnedFd;
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use log::info;
use parking_lot::RwLock;
use rustc_hash::FxHashMap;
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

use crate::config::{AppConfig, ChannelConfig, EdgeDetect};
use crate::error::{AppError, EventError};
use crate::events::{Callback, EventRegistry, EventStatus, WaitOutcome, configure_edge};

/// A resolved GPIO channel: the user-facing id, the kernel line number and
/// the name of its sysfs directory.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Channel {
    pub id: String,
    pub line: u32,
    pub gpio_name: String,
}

/// File-level access to GPIO lines used by the event engine.
pub trait GpioBackend: Send + Sync {
    fn export_input(&self, channel: &Channel) -> Result<(), AppError>;
    fn unexport(&self, channel: &Channel) -> Result<(), AppError>;
    fn read_value(&self, channel: &Channel) -> Result<u8, AppError>;
    /// Opens the line's value resource for readiness polling, non-blocking.
    fn open_value(&self, channel: &Channel) -> Result<OwnedFd, EventError>;
    fn write_edge(&self, channel: &Channel, edge: EdgeDetect) -> Result<(), EventError>;
}

const BROADCAST_CALLBACK_KEY: &str = "edgemgr-broadcast";

pub struct EventCallbackHandler {
    event_tx: broadcast::Sender<EdgeEvent>,
    event_history: FxHashMap<String, RwLock<VecDeque<EdgeEvent>>>,
    event_history_capacity: usize,
}

impl EventCallbackHandler {
    pub fn new(
        event_tx: broadcast::Sender<EdgeEvent>,
        event_history: FxHashMap<String, RwLock<VecDeque<EdgeEvent>>>,
        event_history_capacity: usize,
    ) -> Self {
        Self {
            event_tx,
            event_history,
            event_history_capacity,
        }
    }

    pub fn dispatch(&self, event: EdgeEvent) {
        if let Some(history_lock) = self.event_history.get(&event.channel) {
            let mut history = history_lock.write();
            while history.len() >= self.event_history_capacity.max(1) {
                history.pop_front();
            }
            history.push_back(event.clone());
        }
        let _ = self.event_tx.send(event);
    }
}

pub type EventHandler = Arc<EventCallbackHandler>;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EdgeEvent {
    pub channel: String,
    pub edge: EdgeDetect,
    pub timestamp_ms: u64,
}

#[derive(Debug, Clone, Serialize)]
pub struct ChannelDescriptor {
    pub info: ChannelConfig,
    pub events: Option<EventStatus>,
}

pub struct GpioManager<B: GpioBackend + 'static> {
    config: Arc<AppConfig>,
    registry: EventRegistry<B>,
    event_handler: EventHandler,
}

impl<B: GpioBackend + 'static> GpioManager<B> {
    pub fn new(config: Arc<AppConfig>, backend: Arc<B>) -> Self {
        let (event_tx, _) = broadcast::channel(config.broadcast_capacity.max(1));

        let mut history = FxHashMap::default();
        for id in config.channels.keys() {
            history.insert(id.clone(), RwLock::new(VecDeque::new()));
        }

        let event_handler = Arc::new(EventCallbackHandler::new(
            event_tx,
            history,
            config.event_history_capacity,
        ));

        Self {
            config,
            registry: EventRegistry::new(backend),
            event_handler,
        }
    }

    pub fn registry(&self) -> &EventRegistry<B> {
        &self.registry
    }

    fn backend(&self) -> &B {
        self.registry.backend()
    }

    fn channel_config(&self, id: &str) -> Result<&ChannelConfig, AppError> {
        self.config
            .channels
            .get(id)
            .ok_or_else(|| AppError::NotFoundChannel(id.to_string()))
    }

    pub fn list_channels(&self) -> HashMap<String, ChannelDescriptor> {
        self.config
            .channels
            .iter()
            .filter_map(|(id, cfg)| {
                let channel = self.config.resolve(id).ok()?;
                Some((
                    id.clone(),
                    ChannelDescriptor {
                        info: cfg.clone(),
                        events: self.registry.status(&channel),
                    },
                ))
            })
            .collect()
    }

    pub fn get_channel(&self, id: &str) -> Result<ChannelDescriptor, AppError> {
        let info = self.channel_config(id)?.clone();
        let channel = self.config.resolve(id)?;

        Ok(ChannelDescriptor {
            info,
            events: self.registry.status(&channel),
        })
    }

    pub fn setup_input(&self, id: &str) -> Result<(), AppError> {
        let channel = self.config.resolve(id)?;
        self.backend().export_input(&channel)?;
        info!("channel {id} set up as input on line {}", channel.line);
        Ok(())
    }

    /// Drops any event detection on the channel and releases the line. Refused
    /// while a blocking wait holds the channel.
    pub fn cleanup(&self, id: &str) -> Result<(), AppError> {
        let channel = self.config.resolve(id)?;
        if let Some(status) = self.registry.status(&channel) {
            if status.blocking {
                return Err(EventError::ChannelAlreadyBlocked(channel.id).into());
            }
            self.registry.remove_event_detect(&channel);
            configure_edge(self.backend(), &channel, EdgeDetect::None, true)?;
        }
        self.backend().unexport(&channel)
    }

    pub fn read_value(&self, id: &str) -> Result<u8, AppError> {
        let channel = self.config.resolve(id)?;
        self.backend().read_value(&channel)
    }

    /// Starts edge detection whose events land in the channel history and the broadcast stream.
    pub fn add_detect(&self, id: &str, edge: EdgeDetect, debounce_ms: u64) -> Result<(), AppError> {
        let channel = self.config.resolve(id)?;
        let callback = self.broadcast_callback(&channel, edge);

        self.registry
            .add_event_detect(&channel, edge, None, debounce_ms)?;
        // keep a single broadcast callback per channel across repeated requests
        self.registry.remove_event_callback(&channel, &callback);
        self.registry.add_event_callback(&channel, callback)?;
        Ok(())
    }

    pub fn remove_detect(&self, id: &str) -> Result<(), AppError> {
        let channel = self.config.resolve(id)?;
        self.registry.remove_event_detect(&channel);
        Ok(())
    }

    pub fn event_detected(&self, id: &str) -> Result<bool, AppError> {
        let channel = self.config.resolve(id)?;
        Ok(self.registry.event_detected(&channel))
    }

    pub fn wait_for_edge(
        &self,
        id: &str,
        edge: EdgeDetect,
        debounce_ms: u64,
        timeout_ms: u64,
    ) -> Result<WaitOutcome, AppError> {
        let channel = self.config.resolve(id)?;
        Ok(self
            .registry
            .wait_for_edge(&channel, edge, debounce_ms, timeout_ms)?)
    }

    pub fn subscribe_events(&self) -> broadcast::Receiver<EdgeEvent> {
        self.event_handler.event_tx.subscribe()
    }

    pub fn get_events(&self, id: &str, limit: Option<usize>) -> Result<Vec<EdgeEvent>, AppError> {
        self.channel_config(id)?;
        let map = &self.event_handler.event_history;

        Ok(map
            .get(id)
            .map(|d| {
                let events: Vec<EdgeEvent> = if let Some(lim) = limit {
                    d.read().iter().rev().take(lim).cloned().collect()
                } else {
                    d.read().iter().cloned().collect()
                };
                if limit.is_some() {
                    events.into_iter().rev().collect()
                } else {
                    events
                }
            })
            .unwrap_or_default())
    }

    pub fn get_last_event(&self, id: &str) -> Result<Option<EdgeEvent>, AppError> {
        self.channel_config(id)?;
        let map = &self.event_handler.event_history;

        Ok(map.get(id).and_then(|d| d.read().back().cloned()))
    }

    fn broadcast_callback(&self, channel: &Channel, edge: EdgeDetect) -> Callback {
        let handler = self.event_handler.clone();
        Callback::keyed(
            format!("{BROADCAST_CALLBACK_KEY}:{}", channel.id),
            move |channel_id| {
                handler.dispatch(EdgeEvent {
                    channel: channel_id.to_string(),
                    edge,
                    timestamp_ms: epoch_millis(),
                })
            },
        )
    }
}

fn epoch_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}
