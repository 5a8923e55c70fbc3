//! In-memory Phyn cloud for tests.

use std::collections::HashMap;
use std::sync::atomic::AtomicUsize;
use std::sync::atomic::Ordering;
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use chrono::DateTime;
use chrono::NaiveDate;
use chrono::Utc;
use phyn_client::ApiError;
use phyn_client::AuthError;
use phyn_client::AveragesRecord;
use phyn_client::Device;
use phyn_client::FirmwareRecord;
use phyn_client::Preference;
use phyn_client::PreferencesRecord;
use phyn_client::ProductCode;
use phyn_client::PushSource;
use phyn_client::PushUpdate;
use phyn_client::Reading;
use phyn_client::RemoteClient;
use phyn_client::StatusValue;
use phyn_client::UsageRecord;
use phyn_client::WaterStatistics;
use tokio::sync::mpsc;

/// Records every call and serves canned records per device.
#[derive(Default)]
pub struct MockRemoteClient {
    pub devices: Mutex<Vec<Device>>,
    pub averages: Mutex<HashMap<String, AveragesRecord>>,
    pub usage: Mutex<HashMap<String, f64>>,
    pub preferences: Mutex<HashMap<String, PreferencesRecord>>,
    pub firmware: Mutex<HashMap<String, FirmwareRecord>>,
    pub water: Mutex<HashMap<String, Vec<WaterStatistics>>>,
    /// Reads of these devices fail with the given error.
    pub read_failures: Mutex<HashMap<String, ApiError>>,
    /// Firmware lookups fail with the given error.
    pub firmware_failure: Mutex<Option<ApiError>>,
    /// Commands fail with the given error.
    pub command_failure: Mutex<Option<ApiError>>,
    /// Reads of these devices stall before answering.
    pub delays: Mutex<HashMap<String, Duration>>,
    pub calls: Mutex<Vec<String>>,
    pub reauths: AtomicUsize,
}

impl MockRemoteClient {
    pub fn new() -> Self {
        Self::default()
    }

    /// A Phyn Plus reporting an open valve, with away mode off.
    pub fn with_plus(self, id: &str) -> Self {
        let device = Device::new(id, "home-1", ProductCode::PhynPlus2);
        self.averages.lock().unwrap().insert(
            id.to_string(),
            AveragesRecord {
                fw_version: Some("5190401".into()),
                online_status: Some(StatusValue { v: "online".into() }),
                flow: Some(Reading {
                    v: Some(0.5),
                    mean: None,
                }),
                pressure: Some(Reading {
                    v: Some(61.234),
                    mean: None,
                }),
                temperature: Some(Reading {
                    v: Some(68.0),
                    mean: None,
                }),
                sov_status: Some(StatusValue { v: "Open".into() }),
                ..AveragesRecord::default()
            },
        );
        self.usage.lock().unwrap().insert(id.to_string(), 12.5);
        self.preferences.lock().unwrap().insert(
            id.to_string(),
            PreferencesRecord(vec![
                Preference {
                    device_id: id.to_string(),
                    name: phyn_client::AWAY_MODE_PREFERENCE.into(),
                    value: "false".into(),
                },
                Preference {
                    device_id: id.to_string(),
                    name: phyn_client::SCHEDULED_LEAK_TEST_PREFERENCE.into(),
                    value: "true".into(),
                },
            ]),
        );
        self.devices.lock().unwrap().push(device);
        self
    }

    /// A water sensor with one report.
    pub fn with_water_sensor(self, id: &str) -> Self {
        let device = Device::new(id, "home-1", ProductCode::WaterSensor);
        self.averages.lock().unwrap().insert(
            id.to_string(),
            AveragesRecord {
                online_status: Some(StatusValue { v: "online".into() }),
                ..AveragesRecord::default()
            },
        );
        let stats: WaterStatistics = serde_json::from_value(serde_json::json!({
            "ts": 1_700_000_000_000i64,
            "battery_level": 87.0,
            "humidity": [{"value": 44.5}],
            "temperature": [{"value": 61.2}],
            "alerts": {"water": false, "high_humidity": false, "low_humidity": false, "low_temperature": false}
        }))
        .unwrap();
        self.water.lock().unwrap().insert(id.to_string(), vec![stats]);
        self.devices.lock().unwrap().push(device);
        self
    }

    pub fn device(&self, id: &str) -> Device {
        self.devices
            .lock()
            .unwrap()
            .iter()
            .find(|d| d.id == id)
            .cloned()
            .unwrap()
    }

    pub fn fail_reads(&self, id: &str, err: ApiError) {
        self.read_failures.lock().unwrap().insert(id.to_string(), err);
    }

    pub fn heal(&self, id: &str) {
        self.read_failures.lock().unwrap().remove(id);
    }

    pub fn set_sov(&self, id: &str, status: &str) {
        if let Some(record) = self.averages.lock().unwrap().get_mut(id) {
            record.sov_status = Some(StatusValue { v: status.into() });
        }
    }

    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }

    pub fn clear_calls(&self) {
        self.calls.lock().unwrap().clear();
    }

    /// Calls that change device state.
    pub fn commands(&self) -> Vec<String> {
        self.calls()
            .into_iter()
            .filter(|c| c.starts_with("set_"))
            .collect()
    }

    fn record(&self, call: String) {
        self.calls.lock().unwrap().push(call);
    }

    async fn read(&self, call: &str, device: &Device) -> Result<(), ApiError> {
        self.record(format!("{} {}", call, device.id));
        let delay = self.delays.lock().unwrap().get(&device.id).copied();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        match self.read_failures.lock().unwrap().get(&device.id) {
            Some(err) => Err(err.clone()),
            None => Ok(()),
        }
    }

    fn command(&self, call: String) -> Result<(), ApiError> {
        self.record(call);
        match self.command_failure.lock().unwrap().clone() {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }
}

#[async_trait]
impl RemoteClient for MockRemoteClient {
    async fn list_devices(&self) -> Result<Vec<Device>, ApiError> {
        self.record("list_devices".into());
        Ok(self.devices.lock().unwrap().clone())
    }

    async fn get_usage(&self, device: &Device, _day: NaiveDate) -> Result<UsageRecord, ApiError> {
        self.read("get_usage", device).await?;
        let water_consumption = self
            .usage
            .lock()
            .unwrap()
            .get(&device.id)
            .copied()
            .unwrap_or_default();
        Ok(UsageRecord { water_consumption })
    }

    async fn get_realtime_averages(&self, device: &Device) -> Result<AveragesRecord, ApiError> {
        self.read("get_realtime_averages", device).await?;
        Ok(self
            .averages
            .lock()
            .unwrap()
            .get(&device.id)
            .cloned()
            .unwrap_or_default())
    }

    async fn get_preferences(&self, device: &Device) -> Result<PreferencesRecord, ApiError> {
        self.read("get_preferences", device).await?;
        Ok(self
            .preferences
            .lock()
            .unwrap()
            .get(&device.id)
            .cloned()
            .unwrap_or_default())
    }

    async fn get_firmware(&self, device: &Device) -> Result<FirmwareRecord, ApiError> {
        self.read("get_firmware", device).await?;
        if let Some(err) = self.firmware_failure.lock().unwrap().clone() {
            return Err(err);
        }
        Ok(self
            .firmware
            .lock()
            .unwrap()
            .get(&device.id)
            .cloned()
            .unwrap_or_default())
    }

    async fn get_water_statistics(
        &self,
        device: &Device,
        _from: DateTime<Utc>,
        _to: DateTime<Utc>,
    ) -> Result<Vec<WaterStatistics>, ApiError> {
        self.read("get_water_statistics", device).await?;
        Ok(self
            .water
            .lock()
            .unwrap()
            .get(&device.id)
            .cloned()
            .unwrap_or_default())
    }

    async fn set_valve(&self, device: &Device, open: bool) -> Result<(), ApiError> {
        self.command(format!("set_valve {} {}", device.id, open))
    }

    async fn set_away_mode(&self, device: &Device, enabled: bool) -> Result<(), ApiError> {
        self.command(format!("set_away_mode {} {}", device.id, enabled))
    }

    async fn set_scheduled_leak_test(&self, device: &Device, enabled: bool) -> Result<(), ApiError> {
        self.command(format!("set_scheduled_leak_test {} {}", device.id, enabled))
    }

    async fn reauthenticate(&self) -> Result<(), AuthError> {
        self.reauths.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

/// Realtime channel fed by the test.
#[derive(Default)]
pub struct MockPushSource {
    /// Device ids of every subscription, in order.
    pub subscriptions: Mutex<Vec<Vec<String>>>,
    /// Subscribing fails with the given error.
    pub failure: Mutex<Option<ApiError>>,
    sender: Mutex<Option<mpsc::Sender<PushUpdate>>>,
}

impl MockPushSource {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscriptions(&self) -> Vec<Vec<String>> {
        self.subscriptions.lock().unwrap().clone()
    }

    /// Deliver `update` on the current subscription.
    pub fn publish(&self, update: PushUpdate) {
        let sender = self.sender.lock().unwrap();
        sender.as_ref().unwrap().try_send(update).unwrap();
    }

    /// Drop the connection; the listener sees its channel close.
    pub fn disconnect(&self) {
        self.sender.lock().unwrap().take();
    }
}

#[async_trait]
impl PushSource for MockPushSource {
    async fn subscribe(&self, device_ids: &[String]) -> Result<mpsc::Receiver<PushUpdate>, ApiError> {
        self.subscriptions.lock().unwrap().push(device_ids.to_vec());
        if let Some(err) = self.failure.lock().unwrap().clone() {
            return Err(err);
        }
        let (tx, rx) = mpsc::channel(16);
        *self.sender.lock().unwrap() = Some(tx);
        Ok(rx)
    }
}
