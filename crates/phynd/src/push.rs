use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use phyn_client::PushSource;
use phyn_client::PushUpdate;
use phyn_client::Reading;
use tokio::sync::watch;
use tracing::debug;
use tracing::info;
use tracing::warn;

use crate::cache::EntityStateCache;
use crate::coordinator::next_capture_time;
use crate::registry::DeviceRegistry;
use crate::snapshot::round_to;
use crate::snapshot::Metric;
use crate::snapshot::MetricValue;
use crate::snapshot::ValveState;

#[derive(Debug, Clone)]
pub struct PushSettings {
    /// Wait before reconnecting after the channel is lost.
    pub reconnect_delay: Duration,
    /// How often the device set is compared against the subscription.
    pub resubscribe_check: Duration,
}

impl Default for PushSettings {
    fn default() -> Self {
        Self {
            reconnect_delay: Duration::from_secs(30),
            resubscribe_check: Duration::from_secs(60),
        }
    }
}

/// Applies realtime device updates to the cache between polls.
///
/// Updates only overlay an existing snapshot; a device is not cached until
/// its first successful poll.
pub struct PushListener {
    source: Arc<dyn PushSource>,
    cache: Arc<EntityStateCache>,
    registry: Arc<DeviceRegistry>,
    settings: PushSettings,
}

impl PushListener {
    pub fn new(
        source: Arc<dyn PushSource>,
        cache: Arc<EntityStateCache>,
        registry: Arc<DeviceRegistry>,
        settings: PushSettings,
    ) -> Self {
        Self {
            source,
            cache,
            registry,
            settings,
        }
    }

    /// Devices that report over the realtime channel.
    fn subscribed_ids(&self) -> Vec<String> {
        self.registry
            .list()
            .iter()
            .filter(|d| d.capabilities.flow_sensor)
            .map(|d| d.id.clone())
            .collect()
    }

    /// Overlay `update` on the cached snapshot of its device. Returns false
    /// when the update was dropped.
    pub fn apply(&self, update: &PushUpdate) -> bool {
        if self.registry.get(&update.device_id).is_none() {
            debug!("Ignoring update for unknown device {}", update.device_id);
            return false;
        }

        let values = observed_values(update);
        if values.is_empty() {
            return false;
        }

        let applied = self.cache.update(&update.device_id, |current| {
            current.with_observed(next_capture_time(Some(current)), &values)
        });
        if applied {
            debug!("Pushed {}: {:?}", update.device_id, values);
        } else {
            debug!("No snapshot of {} yet, dropping update", update.device_id);
        }
        applied
    }

    /// Listen until `shutdown` flips to true, reconnecting when the channel
    /// drops and resubscribing when the device set changes.
    pub async fn run(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        loop {
            if *shutdown.borrow() {
                break;
            }

            let ids = self.subscribed_ids();
            if ids.is_empty() {
                if !pause(self.settings.resubscribe_check, &mut shutdown).await {
                    break;
                }
                continue;
            }

            let mut updates = match self.source.subscribe(&ids).await {
                Ok(updates) => updates,
                Err(e) => {
                    warn!("Realtime subscription failed: {}", e);
                    if !pause(self.settings.reconnect_delay, &mut shutdown).await {
                        break;
                    }
                    continue;
                }
            };

            let mut check = tokio::time::interval_at(
                tokio::time::Instant::now() + self.settings.resubscribe_check,
                self.settings.resubscribe_check,
            );
            let lost = loop {
                tokio::select! {
                    update = updates.recv() => match update {
                        Some(update) => {
                            self.apply(&update);
                        }
                        None => break true,
                    },
                    _ = check.tick() => {
                        if self.subscribed_ids() != ids {
                            info!("Device set changed, resubscribing to realtime updates");
                            break false;
                        }
                    }
                    changed = shutdown.changed() => {
                        if changed.is_err() || *shutdown.borrow() {
                            info!("Realtime listener stopping");
                            return;
                        }
                    }
                }
            };

            if lost {
                warn!(
                    "Realtime channel lost, reconnecting in {:?}",
                    self.settings.reconnect_delay
                );
                if !pause(self.settings.reconnect_delay, &mut shutdown).await {
                    break;
                }
            }
        }
        info!("Realtime listener stopping");
    }
}

/// Sleep for `delay`. Returns false if shutdown was requested meanwhile.
async fn pause(delay: Duration, shutdown: &mut watch::Receiver<bool>) -> bool {
    let sleep = tokio::time::sleep(delay);
    tokio::pin!(sleep);
    loop {
        tokio::select! {
            _ = &mut sleep => return true,
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    return false;
                }
            }
        }
    }
}

fn reading(r: &Option<Reading>, places: i32) -> Option<f64> {
    r.as_ref().and_then(Reading::value).map(|v| round_to(v, places))
}

fn observed_values(update: &PushUpdate) -> BTreeMap<Metric, MetricValue> {
    let mut values = BTreeMap::new();
    let mut set = |metric: Metric, value: Option<MetricValue>| {
        if let Some(v) = value {
            values.insert(metric, v);
        }
    };

    set(Metric::Flow, reading(&update.flow, 3).map(Into::into));
    set(
        Metric::FlowState,
        update.flow_state.as_ref().map(|f| f.v.clone().into()),
    );
    if let Some(sensors) = &update.sensor_data {
        set(Metric::Pressure, reading(&sensors.pressure, 2).map(Into::into));
        set(Metric::Temperature, reading(&sensors.temperature, 2).map(Into::into));
    }
    set(
        Metric::Consumption,
        update.consumption.as_ref().and_then(Reading::value).map(Into::into),
    );
    if let Some(sov) = &update.sov_state {
        match ValveState::from_sov_status(sov) {
            Some(state) => set(Metric::ValveState, Some(state.into())),
            None => warn!("Unknown valve status '{}' from {}", sov, update.device_id),
        }
        set(Metric::LeakTestRunning, Some((sov == "LeakExp").into()));
    }

    values
}
