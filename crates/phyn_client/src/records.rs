//! Response bodies of the Phyn REST API.
//!
//! Every field is optional: the API omits whatever a given product family
//! does not measure.

use serde::Deserialize;
use serde::Serialize;

/// A home and the devices installed in it, from `GET /homes`.
#[derive(Debug, Clone, Deserialize)]
pub struct Home {
    pub id: String,
    #[serde(default, alias = "alias_name")]
    pub name: Option<String>,
    #[serde(default)]
    pub devices: Vec<HomeDevice>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct HomeDevice {
    pub device_id: String,
    pub product_code: String,
    #[serde(default)]
    pub name: Option<String>,
}

/// A measured value: `v` is the instantaneous reading, `mean` the average
/// over the reporting window.
#[derive(Debug, Clone, Copy, Default, PartialEq, Deserialize)]
pub struct Reading {
    #[serde(default)]
    pub v: Option<f64>,
    #[serde(default)]
    pub mean: Option<f64>,
}

impl Reading {
    pub fn value(&self) -> Option<f64> {
        self.v.or(self.mean)
    }
}

/// A reported state. Some firmware sends `v` as a number, so it is kept as
/// its text form either way.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct StatusValue {
    #[serde(deserialize_with = "text_or_number")]
    pub v: String,
}

fn text_or_number<'de, D>(deserializer: D) -> Result<String, D::Error>
where
    D: serde::Deserializer<'de>,
{
    match serde_json::Value::deserialize(deserializer)? {
        serde_json::Value::String(s) => Ok(s),
        serde_json::Value::Number(n) => Ok(n.to_string()),
        serde_json::Value::Bool(b) => Ok(b.to_string()),
        other => Err(serde::de::Error::custom(format!(
            "expected a string or number, got {}",
            other
        ))),
    }
}

/// Device state with realtime averages, from `GET /devices/{id}/state`.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct AveragesRecord {
    #[serde(default)]
    pub product_code: Option<String>,
    #[serde(default)]
    pub fw_version: Option<String>,
    #[serde(default)]
    pub serial_number: Option<String>,
    #[serde(default)]
    pub signal_strength: Option<f64>,
    #[serde(default)]
    pub online_status: Option<StatusValue>,
    #[serde(default)]
    pub flow: Option<Reading>,
    #[serde(default)]
    pub flow_state: Option<StatusValue>,
    #[serde(default)]
    pub pressure: Option<Reading>,
    #[serde(default)]
    pub temperature: Option<Reading>,
    #[serde(default)]
    pub sov_status: Option<StatusValue>,

    // Classic devices monitor two lines.
    #[serde(default)]
    pub pressure1: Option<Reading>,
    #[serde(default)]
    pub pressure2: Option<Reading>,
    #[serde(default)]
    pub temperature1: Option<Reading>,
    #[serde(default)]
    pub temperature2: Option<Reading>,
    #[serde(default)]
    pub hot_line_num: Option<u8>,
}

/// Water consumption for one day, from `GET /devices/{id}/consumption/details`.
#[derive(Debug, Clone, Copy, Default, Deserialize)]
pub struct UsageRecord {
    /// Gallons used so far on the requested day.
    pub water_consumption: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Preference {
    pub device_id: String,
    pub name: String,
    pub value: String,
}

/// Device preferences, from `GET /preferences/device/{id}`.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(transparent)]
pub struct PreferencesRecord(pub Vec<Preference>);

impl PreferencesRecord {
    /// Boolean preferences are encoded as the strings `"true"` and `"false"`.
    pub fn flag(&self, name: &str) -> Option<bool> {
        self.0
            .iter()
            .find(|p| p.name == name)
            .map(|p| p.value == "true")
    }
}

/// Latest available firmware, from `GET /firmware/latestVersion/v2`.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct FirmwareRecord {
    #[serde(default)]
    pub fw_version: Option<String>,
    #[serde(default)]
    pub release_notes: Option<String>,
}

/// Realtime endpoint for the account, from `POST /users/{user}/iot_policy`.
#[derive(Debug, Clone, Deserialize)]
pub struct IotPolicy {
    /// Presigned websocket URL of the MQTT broker.
    pub wss_url: String,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Deserialize)]
pub struct WaterAlerts {
    #[serde(default)]
    pub high_humidity: Option<bool>,
    #[serde(default)]
    pub low_humidity: Option<bool>,
    #[serde(default)]
    pub low_temperature: Option<bool>,
    #[serde(default)]
    pub water: Option<bool>,
}

#[derive(Debug, Clone, Copy, Deserialize)]
pub struct SampledValue {
    pub value: f64,
}

/// One water sensor report, from `GET /devices/{id}/water_statistics/history/`.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct WaterStatistics {
    pub ts: i64,
    #[serde(default)]
    pub battery_level: Option<f64>,
    #[serde(default)]
    pub humidity: Vec<SampledValue>,
    #[serde(default)]
    pub temperature: Vec<SampledValue>,
    #[serde(default)]
    pub alerts: Option<WaterAlerts>,
}

impl WaterStatistics {
    pub fn humidity(&self) -> Option<f64> {
        self.humidity.first().map(|s| s.value)
    }

    pub fn temperature(&self) -> Option<f64> {
        self.temperature.first().map(|s| s.value)
    }
}
