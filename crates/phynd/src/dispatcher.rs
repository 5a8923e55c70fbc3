use std::collections::BTreeMap;
use std::sync::atomic::AtomicU64;
use std::sync::atomic::Ordering;
use std::sync::Arc;

use chrono::DateTime;
use chrono::Utc;
use phyn_client::ApiError;
use phyn_client::Capabilities;
use phyn_client::Device;
use phyn_client::RemoteClient;
use serde::Serialize;
use strum::AsRefStr;
use strum::Display;
use strum::EnumString;
use tracing::info;
use tracing::warn;

use crate::cache::EntityStateCache;
use crate::registry::DeviceRegistry;
use crate::snapshot::Metric;
use crate::snapshot::MetricValue;
use crate::snapshot::ValveState;

/// A writable device attribute.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Display, EnumString, AsRefStr)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum Control {
    ValveState,
    AwayMode,
    ScheduledLeakTest,
}

impl Control {
    /// The metric this control writes.
    pub fn metric(self) -> Metric {
        match self {
            Control::ValveState => Metric::ValveState,
            Control::AwayMode => Metric::AwayMode,
            Control::ScheduledLeakTest => Metric::ScheduledLeakTest,
        }
    }

    pub fn supported_by(self, caps: Capabilities) -> bool {
        match self {
            Control::ValveState => caps.valve,
            Control::AwayMode => caps.away_mode,
            Control::ScheduledLeakTest => caps.leak_test,
        }
    }

    /// Parse a requested value. The valve takes `open` or `closed`; the
    /// switches take `on`/`off` or `true`/`false`.
    pub fn parse_value(self, value: &str) -> Option<bool> {
        let value = value.trim().to_ascii_lowercase();
        match self {
            Control::ValveState => match value.as_str() {
                "open" => Some(true),
                "closed" | "close" => Some(false),
                _ => None,
            },
            Control::AwayMode | Control::ScheduledLeakTest => match value.as_str() {
                "on" | "true" => Some(true),
                "off" | "false" => Some(false),
                _ => None,
            },
        }
    }

    /// The cached value after a successful command.
    pub fn value(self, on: bool) -> MetricValue {
        match self {
            Control::ValveState if on => ValveState::Open.into(),
            Control::ValveState => ValveState::Closed.into(),
            Control::AwayMode | Control::ScheduledLeakTest => on.into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CommandError {
    #[error("Device {device_id} does not support '{attribute}'")]
    Unsupported { device_id: String, attribute: String },

    #[error("Unknown device {0}")]
    UnknownDevice(String),

    #[error("Invalid value '{value}' for '{attribute}'")]
    InvalidValue { attribute: String, value: String },

    #[error("Command failed, try again: {0}")]
    Transient(String),

    #[error("Authentication failed: {0}")]
    Auth(String),

    #[error("Command rejected: {0}")]
    Rejected(String),
}

impl From<ApiError> for CommandError {
    fn from(e: ApiError) -> Self {
        match e {
            ApiError::Transient(msg) => CommandError::Transient(msg),
            ApiError::Auth(msg) => CommandError::Auth(msg),
            ApiError::Rejected(msg) => CommandError::Rejected(msg),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CommandStatus {
    Pending,
    Confirmed,
    Failed,
}

/// A sent command and, once answered, its outcome.
#[derive(Debug, Clone, Serialize)]
pub struct CommandRecord {
    pub id: u64,
    pub device_id: String,
    pub attribute: Control,
    pub desired: MetricValue,
    pub status: CommandStatus,
    pub requested_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub resolved_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Sends control commands and reflects their result in the cache.
///
/// Answered commands stay listed with their outcome until a newer snapshot
/// of the device supersedes them.
pub struct CommandDispatcher {
    client: Arc<dyn RemoteClient>,
    cache: Arc<EntityStateCache>,
    registry: Arc<DeviceRegistry>,
    commands: std::sync::Mutex<BTreeMap<u64, CommandRecord>>,
    next_id: AtomicU64,
}

impl CommandDispatcher {
    pub fn new(
        client: Arc<dyn RemoteClient>,
        cache: Arc<EntityStateCache>,
        registry: Arc<DeviceRegistry>,
    ) -> Self {
        Self {
            client,
            cache,
            registry,
            commands: std::sync::Mutex::new(BTreeMap::new()),
            next_id: AtomicU64::new(1),
        }
    }

    /// Set `attribute` of `device_id` to `desired`.
    ///
    /// Exactly one remote call is made, and only after the request is
    /// validated. On success the cached snapshot shows the new value right
    /// away; on failure the cache is left as it was.
    pub async fn execute(
        &self,
        device_id: &str,
        attribute: &str,
        desired: &str,
    ) -> Result<(), CommandError> {
        let device = self
            .registry
            .get(device_id)
            .ok_or_else(|| CommandError::UnknownDevice(device_id.to_string()))?;

        let control = attribute
            .parse::<Control>()
            .ok()
            .filter(|c| c.supported_by(device.capabilities))
            .ok_or_else(|| CommandError::Unsupported {
                device_id: device_id.to_string(),
                attribute: attribute.to_string(),
            })?;

        let on = control
            .parse_value(desired)
            .ok_or_else(|| CommandError::InvalidValue {
                attribute: attribute.to_string(),
                value: desired.to_string(),
            })?;

        self.send(&device, control, on).await
    }

    /// Commands in flight, plus answered ones not yet superseded by a
    /// newer snapshot of their device.
    pub fn commands(&self) -> Vec<CommandRecord> {
        match self.commands.lock() {
            Ok(mut commands) => {
                self.prune(&mut commands);
                commands.values().cloned().collect()
            }
            Err(_) => Vec::new(),
        }
    }

    /// Number of commands still waiting for an answer.
    pub fn pending_count(&self) -> usize {
        self.commands()
            .iter()
            .filter(|c| c.status == CommandStatus::Pending)
            .count()
    }

    /// Drop answered commands whose device was captured again since, or
    /// is no longer registered.
    fn prune(&self, commands: &mut BTreeMap<u64, CommandRecord>) {
        commands.retain(|_, command| {
            let Some(resolved_at) = command.resolved_at else {
                return true;
            };
            if self.registry.get(&command.device_id).is_none() {
                return false;
            }
            match self.cache.get(&command.device_id) {
                Some(snapshot) => snapshot.captured_at <= resolved_at,
                None => true,
            }
        });
    }

    fn resolve(&self, id: u64, status: CommandStatus, error: Option<String>) {
        if let Ok(mut commands) = self.commands.lock() {
            if let Some(command) = commands.get_mut(&id) {
                command.status = status;
                command.resolved_at = Some(Utc::now());
                command.error = error;
            }
        }
    }

    async fn send(&self, device: &Device, control: Control, on: bool) -> Result<(), CommandError> {
        let value = control.value(on);
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let command = CommandRecord {
            id,
            device_id: device.id.clone(),
            attribute: control,
            desired: value.clone(),
            status: CommandStatus::Pending,
            requested_at: Utc::now(),
            resolved_at: None,
            error: None,
        };
        if let Ok(mut commands) = self.commands.lock() {
            self.prune(&mut commands);
            commands.insert(id, command);
        }

        let result = match control {
            Control::ValveState => self.client.set_valve(device, on).await,
            Control::AwayMode => self.client.set_away_mode(device, on).await,
            Control::ScheduledLeakTest => self.client.set_scheduled_leak_test(device, on).await,
        };

        match result {
            Ok(()) => {
                info!("Command {} on {}: {} -> {:?}", id, device.id, control, value);
                let metric = control.metric();
                if !self
                    .cache
                    .update(&device.id, |s| s.with_optimistic(metric, value.clone()))
                {
                    // The next poll fills it in.
                    info!("No snapshot of {} yet, skipping optimistic update", device.id);
                }
                // Resolved after the cache write so the optimistic snapshot
                // does not count as superseding it.
                self.resolve(id, CommandStatus::Confirmed, None);
                Ok(())
            }
            Err(e) => {
                warn!("Command {} on {}: {} failed: {}", id, device.id, control, e);
                self.resolve(id, CommandStatus::Failed, Some(e.to_string()));
                Err(e.into())
            }
        }
    }
}
