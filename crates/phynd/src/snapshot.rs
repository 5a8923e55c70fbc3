use std::collections::BTreeMap;
use std::collections::BTreeSet;

use chrono::DateTime;
use chrono::Utc;
use serde::Serialize;
use strum::AsRefStr;
use strum::Display;
use strum::EnumString;

/// A named value a device reports.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Display, EnumString, AsRefStr,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum Metric {
    DailyUsage,
    /// Lifetime usage, only ever reported over the realtime channel.
    Consumption,
    Temperature,
    Pressure,
    Flow,
    ValveState,
    AwayMode,
    FlowState,
    Online,
    LeakTestRunning,
    ScheduledLeakTest,
    TemperatureHot,
    TemperatureCold,
    PressureHot,
    PressureCold,
    Humidity,
    Battery,
    WaterDetected,
    HighHumidity,
    LowHumidity,
    LowTemperature,
    FirmwareVersion,
    LatestFirmware,
    ReleaseUrl,
    SignalStrength,
}

/// Position of the shutoff valve.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Display, EnumString)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum ValveState {
    Open,
    Closed,
    /// The valve is moving between positions.
    Changing,
}

impl ValveState {
    /// Parse the `sov_status` value reported by the device.
    ///
    /// A running leak test (`LeakExp`) holds the valve closed.
    pub fn from_sov_status(status: &str) -> Option<Self> {
        match status {
            "Open" => Some(ValveState::Open),
            "Close" | "Closed" | "LeakExp" => Some(ValveState::Closed),
            "Partial" => Some(ValveState::Changing),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum MetricValue {
    Number(f64),
    Flag(bool),
    Valve(ValveState),
    Text(String),
}

impl From<f64> for MetricValue {
    fn from(v: f64) -> Self {
        MetricValue::Number(v)
    }
}

impl From<bool> for MetricValue {
    fn from(v: bool) -> Self {
        MetricValue::Flag(v)
    }
}

impl From<ValveState> for MetricValue {
    fn from(v: ValveState) -> Self {
        MetricValue::Valve(v)
    }
}

impl From<String> for MetricValue {
    fn from(v: String) -> Self {
        MetricValue::Text(v)
    }
}

impl From<&str> for MetricValue {
    fn from(v: &str) -> Self {
        MetricValue::Text(v.to_string())
    }
}

/// The latest known values for one device, captured at one instant.
///
/// Snapshots are values: a cache holds them behind an `Arc` and replaces
/// them whole, so a reader never observes a mix of two polls.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Snapshot {
    pub captured_at: DateTime<Utc>,
    pub values: BTreeMap<Metric, MetricValue>,
    /// Metrics written by a command and not yet confirmed by a poll.
    #[serde(skip_serializing_if = "BTreeSet::is_empty")]
    pub unconfirmed: BTreeSet<Metric>,
}

impl Snapshot {
    pub fn new(captured_at: DateTime<Utc>) -> Self {
        Self {
            captured_at,
            values: BTreeMap::new(),
            unconfirmed: BTreeSet::new(),
        }
    }

    pub fn with(mut self, metric: Metric, value: impl Into<MetricValue>) -> Self {
        self.values.insert(metric, value.into());
        self
    }

    /// Set `metric` if a value is present.
    pub fn set_opt<V: Into<MetricValue>>(&mut self, metric: Metric, value: Option<V>) {
        if let Some(v) = value {
            self.values.insert(metric, v.into());
        }
    }

    pub fn get(&self, metric: Metric) -> Option<&MetricValue> {
        self.values.get(&metric)
    }

    pub fn number(&self, metric: Metric) -> Option<f64> {
        match self.values.get(&metric) {
            Some(MetricValue::Number(n)) => Some(*n),
            _ => None,
        }
    }

    pub fn flag(&self, metric: Metric) -> Option<bool> {
        match self.values.get(&metric) {
            Some(MetricValue::Flag(b)) => Some(*b),
            _ => None,
        }
    }

    pub fn text(&self, metric: Metric) -> Option<&str> {
        match self.values.get(&metric) {
            Some(MetricValue::Text(s)) => Some(s),
            _ => None,
        }
    }

    pub fn valve_state(&self) -> Option<ValveState> {
        match self.values.get(&Metric::ValveState) {
            Some(MetricValue::Valve(v)) => Some(*v),
            _ => None,
        }
    }

    /// A copy of this snapshot with one attribute replaced by a value the
    /// server has not confirmed yet. Everything else, including the capture
    /// time, is kept.
    pub fn with_optimistic(&self, metric: Metric, value: MetricValue) -> Self {
        let mut next = self.clone();
        next.values.insert(metric, value);
        next.unconfirmed.insert(metric);
        next
    }

    /// A copy of this snapshot with `values` overlaid as reported by the
    /// device at `captured_at`. Reported metrics count as confirmed.
    pub fn with_observed(
        &self,
        captured_at: DateTime<Utc>,
        values: &BTreeMap<Metric, MetricValue>,
    ) -> Self {
        let mut next = self.clone();
        next.captured_at = captured_at;
        for (metric, value) in values {
            next.values.insert(*metric, value.clone());
            next.unconfirmed.remove(metric);
        }
        next
    }
}

/// Round to `places` decimal places.
pub fn round_to(value: f64, places: i32) -> f64 {
    let factor = 10f64.powi(places);
    (value * factor).round() / factor
}
