use std::collections::BTreeMap;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use arc_swap::ArcSwap;
use chrono::DateTime;
use chrono::Utc;
use futures::future::join_all;
use phyn_client::ApiError;
use phyn_client::AveragesRecord;
use phyn_client::Device;
use phyn_client::FirmwareRecord;
use phyn_client::PreferencesRecord;
use phyn_client::ProductCode;
use phyn_client::Reading;
use phyn_client::RemoteClient;
use phyn_client::UsageRecord;
use phyn_client::WaterStatistics;
use phyn_client::AWAY_MODE_PREFERENCE;
use phyn_client::SCHEDULED_LEAK_TEST_PREFERENCE;
use serde::Serialize;
use tokio::sync::mpsc;
use tokio::sync::watch;
use tokio::time::MissedTickBehavior;
use tracing::debug;
use tracing::error;
use tracing::info;
use tracing::warn;

use crate::cache::EntityStateCache;
use crate::registry::DeviceRegistry;
use crate::registry::RegistryChange;
use crate::snapshot::round_to;
use crate::snapshot::Metric;
use crate::snapshot::Snapshot;
use crate::snapshot::ValveState;

/// Capacity for the coordinator→host event channel.
const EVENT_CHANNEL_SIZE: usize = 16;

/// Water sensor reports are looked up over this many trailing hours.
const WATER_STATISTICS_WINDOW_HOURS: i64 = 24;

/// Scheduling knobs for the poll loop.
#[derive(Debug, Clone)]
pub struct PollSettings {
    pub interval: Duration,
    /// Upper bound on one device's poll, all of its calls included.
    pub timeout: Duration,
    /// A device is marked stale after this many consecutive failed polls.
    pub stale_after_missed_polls: u32,
    /// Firmware is looked up on every Nth successful poll of a device.
    pub firmware_every_polls: u64,
    /// The device set is rediscovered every Nth poll cycle.
    pub discovery_every_polls: u64,
}

impl Default for PollSettings {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(60),
            timeout: Duration::from_secs(20),
            stale_after_missed_polls: 1,
            firmware_every_polls: 60,
            discovery_every_polls: 60,
        }
    }
}

/// Why one device's poll failed.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum PollError {
    #[error("Transient poll failure: {0}")]
    Transient(String),

    #[error("Authentication failed: {0}")]
    Auth(String),
}

impl From<ApiError> for PollError {
    fn from(e: ApiError) -> Self {
        match e {
            ApiError::Auth(msg) => PollError::Auth(msg),
            // A refused read is retried next interval like any other failure.
            ApiError::Transient(msg) | ApiError::Rejected(msg) => PollError::Transient(msg),
        }
    }
}

/// A refresh that was refused before any remote call.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RefreshError {
    #[error("No devices to refresh")]
    NoDevices,

    #[error("Invalid device id '{0}'")]
    InvalidDevice(String),
}

/// Outcome of one refresh, per device.
#[derive(Debug, Clone)]
pub struct RefreshReport {
    pub results: BTreeMap<String, Result<Arc<Snapshot>, PollError>>,
    pub reauth_required: bool,
}

impl RefreshReport {
    pub fn succeeded(&self) -> usize {
        self.results.values().filter(|r| r.is_ok()).count()
    }

    pub fn failed(&self) -> usize {
        self.results.len() - self.succeeded()
    }
}

/// Notifications for the host.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CoordinatorEvent {
    /// The session was refused; the host must log in again.
    ReauthRequired { reason: String },
    DevicesChanged(RegistryChange),
}

/// Poll loop health, as shown by the status endpoint.
#[derive(Debug, Clone, Default, Serialize)]
pub struct PollStatus {
    pub cycles: u64,
    pub last_poll: Option<DateTime<Utc>>,
    pub devices_ok: usize,
    pub devices_failed: usize,
    pub reauth_required: bool,
    pub last_error: Option<String>,
}

/// Everything fetched for one device in one poll.
#[derive(Debug, Default)]
struct Readings {
    averages: AveragesRecord,
    usage: Option<UsageRecord>,
    preferences: Option<PreferencesRecord>,
    water: Option<WaterStatistics>,
    firmware: Option<FirmwareRecord>,
}

/// Polls every device on a fixed interval and publishes snapshots to the
/// cache.
pub struct Coordinator {
    client: Arc<dyn RemoteClient>,
    cache: Arc<EntityStateCache>,
    registry: Arc<DeviceRegistry>,
    settings: PollSettings,
    /// Successful polls per device, for the firmware schedule.
    poll_counts: std::sync::Mutex<HashMap<String, u64>>,
    status: ArcSwap<PollStatus>,
    events: mpsc::Sender<CoordinatorEvent>,
}

impl Coordinator {
    pub fn new(
        client: Arc<dyn RemoteClient>,
        cache: Arc<EntityStateCache>,
        registry: Arc<DeviceRegistry>,
        settings: PollSettings,
    ) -> (Self, mpsc::Receiver<CoordinatorEvent>) {
        let (events, events_rx) = mpsc::channel(EVENT_CHANNEL_SIZE);
        let coordinator = Self {
            client,
            cache,
            registry,
            settings,
            poll_counts: std::sync::Mutex::new(HashMap::new()),
            status: ArcSwap::new(Arc::default()),
            events,
        };
        (coordinator, events_rx)
    }

    pub fn settings(&self) -> &PollSettings {
        &self.settings
    }

    pub fn status(&self) -> Arc<PollStatus> {
        self.status.load_full()
    }

    /// Called by the host once it has logged in again.
    pub fn clear_reauth(&self) {
        self.status.rcu(|current| PollStatus {
            reauth_required: false,
            ..PollStatus::clone(current)
        });
    }

    /// Poll `devices` concurrently and publish what was learned.
    ///
    /// If any device reports an authentication failure the whole batch is
    /// treated as failed and nothing is written to the cache. A transient
    /// failure leaves that device's snapshot in place.
    pub async fn refresh(&self, devices: &[Arc<Device>]) -> Result<RefreshReport, RefreshError> {
        if devices.is_empty() {
            return Err(RefreshError::NoDevices);
        }
        if let Some(bad) = devices.iter().find(|d| !d.has_valid_id()) {
            return Err(RefreshError::InvalidDevice(bad.id.clone()));
        }

        let outcomes = join_all(devices.iter().map(|device| async move {
            let outcome = self.poll_device(device).await;
            (device, outcome)
        }))
        .await;

        let auth_failure = outcomes.iter().find_map(|(_, outcome)| match outcome {
            Err(PollError::Auth(reason)) => Some(reason.clone()),
            _ => None,
        });
        if let Some(reason) = auth_failure {
            error!("Phyn rejected the session, reauthentication required: {}", reason);
            let results = outcomes
                .into_iter()
                .map(|(device, _)| (device.id.clone(), Err(PollError::Auth(reason.clone()))))
                .collect();
            return Ok(RefreshReport {
                results,
                reauth_required: true,
            });
        }

        let mut results = BTreeMap::new();
        for (device, outcome) in outcomes {
            let result = match outcome {
                Ok(snapshot) => {
                    let snapshot = Arc::new(snapshot);
                    self.cache.put(&device.id, snapshot.clone());
                    if let Ok(mut counts) = self.poll_counts.lock() {
                        *counts.entry(device.id.clone()).or_default() += 1;
                    }
                    Ok(snapshot)
                }
                Err(e) => {
                    warn!("Polling {} failed: {}", device.id, e);
                    let missed = self.cache.record_miss(&device.id);
                    if missed.is_some_and(|n| n >= self.settings.stale_after_missed_polls) {
                        self.cache.mark_stale(&device.id);
                    }
                    Err(e)
                }
            };
            results.insert(device.id.clone(), result);
        }

        Ok(RefreshReport {
            results,
            reauth_required: false,
        })
    }

    async fn poll_device(&self, device: &Device) -> Result<Snapshot, PollError> {
        let previous = self.cache.get(&device.id);
        let with_firmware = self.firmware_due(&device.id);

        let readings = tokio::time::timeout(self.settings.timeout, self.fetch(device, with_firmware))
            .await
            .map_err(|_| {
                PollError::Transient(format!(
                    "{} did not answer within {:?}",
                    device.id, self.settings.timeout
                ))
            })??;

        let captured_at = next_capture_time(previous.as_deref());
        let snapshot = normalize(device, &readings, previous.as_deref(), captured_at);
        debug!("Polled {}: {:?}", device.id, snapshot.values);
        Ok(snapshot)
    }

    fn firmware_due(&self, device_id: &str) -> bool {
        let polls = self
            .poll_counts
            .lock()
            .map(|counts| counts.get(device_id).copied().unwrap_or(0))
            .unwrap_or(0);
        self.settings.firmware_every_polls > 0 && polls % self.settings.firmware_every_polls == 0
    }

    /// Issue every read the device's family needs, concurrently.
    async fn fetch(&self, device: &Device, with_firmware: bool) -> Result<Readings, ApiError> {
        let caps = device.capabilities;
        let client = &self.client;

        let averages = client.get_realtime_averages(device);
        let usage = async {
            if !caps.flow_sensor {
                return Ok(None);
            }
            let today = chrono::Local::now().date_naive();
            client.get_usage(device, today).await.map(Some)
        };
        let preferences = async {
            if !(caps.away_mode || caps.leak_test) {
                return Ok(None);
            }
            client.get_preferences(device).await.map(Some)
        };
        let water = async {
            if !caps.water_sensor {
                return Ok(None);
            }
            let to = Utc::now();
            let reports = client
                .get_water_statistics(
                    device,
                    to - chrono::Duration::hours(WATER_STATISTICS_WINDOW_HOURS),
                    to,
                )
                .await?;
            Ok::<_, ApiError>(reports.into_iter().max_by_key(|r| r.ts))
        };
        let firmware = async {
            if !with_firmware {
                return Ok(None);
            }
            match client.get_firmware(device).await {
                Ok(record) => Ok(Some(record)),
                Err(ApiError::Auth(msg)) => Err(ApiError::Auth(msg)),
                Err(e) => {
                    // Not worth failing the whole poll over; retried next time.
                    warn!("Firmware lookup for {} failed: {}", device.id, e);
                    Ok(None)
                }
            }
        };

        let (averages, usage, preferences, water, firmware) =
            tokio::join!(averages, usage, preferences, water, firmware);

        let errors = [
            averages.as_ref().err(),
            usage.as_ref().err(),
            preferences.as_ref().err(),
            water.as_ref().err(),
            firmware.as_ref().err(),
        ];
        let preferred = errors
            .iter()
            .flatten()
            .find(|e| e.is_auth())
            .or_else(|| errors.iter().flatten().next());
        if let Some(err) = preferred {
            return Err((*err).clone());
        }

        Ok(Readings {
            averages: averages?,
            usage: usage?,
            preferences: preferences?,
            water: water?,
            firmware: firmware?,
        })
    }

    /// Rediscover the account's devices and drop the ones that vanished.
    pub async fn discover(&self) -> Result<RegistryChange, PollError> {
        let devices = match self.client.list_devices().await {
            Ok(devices) => devices,
            Err(e) => {
                let e = PollError::from(e);
                if let PollError::Auth(reason) = &e {
                    self.require_reauth(reason.clone());
                }
                return Err(e);
            }
        };

        let change = self.registry.replace(devices);
        if !change.removed.is_empty() {
            let dropped = self.cache.retain(&self.registry.ids());
            if let Ok(mut counts) = self.poll_counts.lock() {
                counts.retain(|id, _| !dropped.contains(id));
            }
        }
        if !change.is_empty() {
            info!(
                "Device set changed: added {:?}, removed {:?}",
                change.added, change.removed
            );
            self.emit(CoordinatorEvent::DevicesChanged(change.clone()));
        }
        Ok(change)
    }

    /// Poll every registered device once and update the status record.
    pub async fn poll_once(&self) -> Option<RefreshReport> {
        let devices = self.registry.list();
        let report = match self.refresh(&devices).await {
            Ok(report) => report,
            Err(RefreshError::NoDevices) => {
                debug!("No devices registered, skipping poll");
                return None;
            }
            Err(e) => {
                warn!("Poll refused: {}", e);
                return None;
            }
        };

        let last_error = report
            .results
            .values()
            .find_map(|r| r.as_ref().err().map(|e| e.to_string()));
        let (ok, failed) = (report.succeeded(), report.failed());
        self.status.rcu(|current| PollStatus {
            cycles: current.cycles + 1,
            last_poll: Some(Utc::now()),
            devices_ok: ok,
            devices_failed: failed,
            reauth_required: report.reauth_required,
            last_error: last_error.clone(),
        });

        if report.reauth_required {
            if let Some(reason) = last_error {
                self.emit(CoordinatorEvent::ReauthRequired { reason });
            }
        } else {
            debug!("Poll finished: {} ok, {} failed", ok, failed);
        }
        Some(report)
    }

    fn require_reauth(&self, reason: String) {
        self.status.rcu(|current| PollStatus {
            reauth_required: true,
            last_error: Some(reason.clone()),
            ..PollStatus::clone(current)
        });
        self.emit(CoordinatorEvent::ReauthRequired { reason });
    }

    fn emit(&self, event: CoordinatorEvent) {
        if let Err(e) = self.events.try_send(event) {
            warn!("Dropping coordinator event: {}", e);
        }
    }

    /// Run the poll loop until `shutdown` flips to true.
    pub async fn run(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        let mut ticker = tokio::time::interval(self.settings.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        info!(
            "Polling {} devices every {:?}",
            self.registry.len(),
            self.settings.interval
        );

        let mut cycle: u64 = 0;
        loop {
            tokio::select! {
                _ = ticker.tick() => {}
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        info!("Poll loop stopping");
                        return;
                    }
                    continue;
                }
            }

            let every = self.settings.discovery_every_polls;
            if cycle > 0 && every > 0 && cycle % every == 0 {
                if let Err(e) = self.discover().await {
                    warn!("Device discovery failed: {}", e);
                }
            }
            self.poll_once().await;
            cycle += 1;
        }
    }
}

/// Timestamp for a new snapshot, strictly after the previous one.
pub(crate) fn next_capture_time(previous: Option<&Snapshot>) -> DateTime<Utc> {
    let now = Utc::now();
    match previous {
        Some(prev) if now <= prev.captured_at => prev.captured_at + chrono::Duration::milliseconds(1),
        _ => now,
    }
}

fn reading(r: &Option<Reading>, places: i32) -> Option<f64> {
    r.as_ref().and_then(Reading::value).map(|v| round_to(v, places))
}

/// Turn raw records into a snapshot of normalized metrics.
fn normalize(
    device: &Device,
    readings: &Readings,
    previous: Option<&Snapshot>,
    captured_at: DateTime<Utc>,
) -> Snapshot {
    let a = &readings.averages;
    let mut s = Snapshot::new(captured_at);

    s.set_opt(
        Metric::Online,
        a.online_status.as_ref().map(|o| o.v.eq_ignore_ascii_case("online")),
    );
    s.set_opt(Metric::FirmwareVersion, a.fw_version.clone());
    s.set_opt(Metric::SignalStrength, a.signal_strength);

    match device.product_code {
        ProductCode::PhynPlus1 | ProductCode::PhynPlus2 => {
            s.set_opt(Metric::Flow, reading(&a.flow, 3));
            s.set_opt(Metric::Pressure, reading(&a.pressure, 2));
            s.set_opt(Metric::Temperature, reading(&a.temperature, 2));
            s.set_opt(Metric::FlowState, a.flow_state.as_ref().map(|f| f.v.clone()));
            // Only the realtime channel reports lifetime usage.
            s.set_opt(Metric::Consumption, previous.and_then(|p| p.number(Metric::Consumption)));
            if let Some(sov) = &a.sov_status {
                match ValveState::from_sov_status(&sov.v) {
                    Some(state) => s.set_opt(Metric::ValveState, Some(state)),
                    None => warn!("Unknown valve status '{}' from {}", sov.v, device.id),
                }
                s.set_opt(Metric::LeakTestRunning, Some(sov.v == "LeakExp"));
            }
        }
        ProductCode::Classic => {
            let (hot_t, cold_t, hot_p, cold_p) = if a.hot_line_num == Some(2) {
                (&a.temperature2, &a.temperature1, &a.pressure2, &a.pressure1)
            } else {
                (&a.temperature1, &a.temperature2, &a.pressure1, &a.pressure2)
            };
            s.set_opt(Metric::TemperatureHot, reading(hot_t, 2));
            s.set_opt(Metric::TemperatureCold, reading(cold_t, 2));
            s.set_opt(Metric::PressureHot, reading(hot_p, 2));
            s.set_opt(Metric::PressureCold, reading(cold_p, 2));
            s.set_opt(Metric::Flow, reading(&a.flow, 3));
        }
        ProductCode::WaterSensor => {
            if let Some(report) = &readings.water {
                s.set_opt(Metric::Temperature, report.temperature().map(|v| round_to(v, 1)));
                s.set_opt(Metric::Humidity, report.humidity().map(|v| round_to(v, 1)));
                s.set_opt(Metric::Battery, report.battery_level);
                if let Some(alerts) = &report.alerts {
                    s.set_opt(Metric::WaterDetected, alerts.water);
                    s.set_opt(Metric::HighHumidity, alerts.high_humidity);
                    s.set_opt(Metric::LowHumidity, alerts.low_humidity);
                    s.set_opt(Metric::LowTemperature, alerts.low_temperature);
                }
            }
        }
    }

    if let Some(usage) = &readings.usage {
        s.set_opt(Metric::DailyUsage, Some(usage.water_consumption));
    }
    if let Some(prefs) = &readings.preferences {
        if device.capabilities.away_mode {
            s.set_opt(Metric::AwayMode, prefs.flag(AWAY_MODE_PREFERENCE));
        }
        if device.capabilities.leak_test {
            s.set_opt(Metric::ScheduledLeakTest, prefs.flag(SCHEDULED_LEAK_TEST_PREFERENCE));
        }
    }

    let latest = readings
        .firmware
        .as_ref()
        .and_then(|f| f.fw_version.clone())
        .or_else(|| {
            previous
                .and_then(|p| p.text(Metric::LatestFirmware))
                .map(String::from)
        });
    s.set_opt(Metric::LatestFirmware, latest);

    let release_url = readings
        .firmware
        .as_ref()
        .and_then(|f| f.release_notes.clone())
        .or_else(|| {
            previous
                .and_then(|p| p.text(Metric::ReleaseUrl))
                .map(String::from)
        });
    s.set_opt(Metric::ReleaseUrl, release_url);

    s
}
