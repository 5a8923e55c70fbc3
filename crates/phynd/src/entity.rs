//! Maps device metrics onto host entities.
//!
//! Each product family exposes a fixed set of entities. An entity reads one
//! metric from the cached snapshot; writable ones name the control that
//! changes it.

use std::sync::Arc;

use phyn_client::Device;
use phyn_client::ProductCode;
use serde::Deserialize;
use serde::Serialize;
use serde_json::json;
use serde_json::Value;
use strum::Display;

use crate::cache::CacheEntry;
use crate::cache::EntityStateCache;
use crate::dispatcher::Control;
use crate::registry::DeviceRegistry;
use crate::snapshot::round_to;
use crate::snapshot::Metric;
use crate::snapshot::MetricValue;
use crate::snapshot::Snapshot;

const LITERS_PER_GALLON: f64 = 3.78541;

/// Unit system volumes and flow rates are shown in.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UnitSystem {
    #[default]
    UsCustomary,
    Metric,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Display)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum Platform {
    Sensor,
    BinarySensor,
    Switch,
    Valve,
    Update,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Quantity {
    Plain(Option<&'static str>),
    Volume,
    FlowRate,
}

impl Quantity {
    fn unit(self, units: UnitSystem) -> Option<&'static str> {
        match (self, units) {
            (Quantity::Plain(unit), _) => unit,
            (Quantity::Volume, UnitSystem::UsCustomary) => Some("gal"),
            (Quantity::Volume, UnitSystem::Metric) => Some("L"),
            (Quantity::FlowRate, UnitSystem::UsCustomary) => Some("gpm"),
            (Quantity::FlowRate, UnitSystem::Metric) => Some("L/min"),
        }
    }

    fn convert(self, value: f64, units: UnitSystem) -> f64 {
        match (self, units) {
            (Quantity::Plain(_), _) => value,
            (_, UnitSystem::UsCustomary) => round_to(value, 1),
            (_, UnitSystem::Metric) => round_to(value * LITERS_PER_GALLON, 1),
        }
    }
}

struct Template {
    key: &'static str,
    name: &'static str,
    platform: Platform,
    metric: Metric,
    quantity: Quantity,
}

const fn t(
    key: &'static str,
    name: &'static str,
    platform: Platform,
    metric: Metric,
    quantity: Quantity,
) -> Template {
    Template {
        key,
        name,
        platform,
        metric,
        quantity,
    }
}

const NONE: Quantity = Quantity::Plain(None);
const FAHRENHEIT: Quantity = Quantity::Plain(Some("°F"));
const PSI: Quantity = Quantity::Plain(Some("psi"));
const PERCENT: Quantity = Quantity::Plain(Some("%"));
const DBM: Quantity = Quantity::Plain(Some("dBm"));

const PHYN_PLUS: &[Template] = &[
    t("daily_usage", "Daily water usage", Platform::Sensor, Metric::DailyUsage, Quantity::Volume),
    t("flow", "Current flow rate", Platform::Sensor, Metric::Flow, Quantity::FlowRate),
    t("flow_state", "Water flowing", Platform::Sensor, Metric::FlowState, NONE),
    t("consumption", "Total water usage", Platform::Sensor, Metric::Consumption, Quantity::Volume),
    t("pressure", "Average water pressure", Platform::Sensor, Metric::Pressure, PSI),
    t("temperature", "Average water temperature", Platform::Sensor, Metric::Temperature, FAHRENHEIT),
    t("valve_state", "Shutoff valve", Platform::Valve, Metric::ValveState, NONE),
    t("away_mode", "Away mode", Platform::Switch, Metric::AwayMode, NONE),
    t("scheduled_leak_test", "Scheduled leak test", Platform::Switch, Metric::ScheduledLeakTest, NONE),
    t("leak_test_running", "Leak test running", Platform::BinarySensor, Metric::LeakTestRunning, NONE),
    t("signal_strength", "Wi-Fi signal", Platform::Sensor, Metric::SignalStrength, DBM),
    t("firmware", "Firmware", Platform::Update, Metric::FirmwareVersion, NONE),
];

const CLASSIC: &[Template] = &[
    t("daily_usage", "Daily water usage", Platform::Sensor, Metric::DailyUsage, Quantity::Volume),
    t("flow", "Current flow rate", Platform::Sensor, Metric::Flow, Quantity::FlowRate),
    t("temperature_hot", "Hot water temperature", Platform::Sensor, Metric::TemperatureHot, FAHRENHEIT),
    t("temperature_cold", "Cold water temperature", Platform::Sensor, Metric::TemperatureCold, FAHRENHEIT),
    t("pressure_hot", "Hot water pressure", Platform::Sensor, Metric::PressureHot, PSI),
    t("pressure_cold", "Cold water pressure", Platform::Sensor, Metric::PressureCold, PSI),
    t("firmware", "Firmware", Platform::Update, Metric::FirmwareVersion, NONE),
];

const WATER_SENSOR: &[Template] = &[
    t("temperature", "Temperature", Platform::Sensor, Metric::Temperature, FAHRENHEIT),
    t("humidity", "Humidity", Platform::Sensor, Metric::Humidity, PERCENT),
    t("battery", "Battery", Platform::Sensor, Metric::Battery, PERCENT),
    t("water_detected", "Water detected", Platform::BinarySensor, Metric::WaterDetected, NONE),
    t("high_humidity", "High humidity", Platform::BinarySensor, Metric::HighHumidity, NONE),
    t("low_humidity", "Low humidity", Platform::BinarySensor, Metric::LowHumidity, NONE),
    t("low_temperature", "Low temperature", Platform::BinarySensor, Metric::LowTemperature, NONE),
    t("firmware", "Firmware", Platform::Update, Metric::FirmwareVersion, NONE),
];

/// One entity of a device.
#[derive(Debug, Clone, Serialize)]
pub struct EntityDescriptor {
    pub unique_id: String,
    pub device_id: String,
    pub name: String,
    pub platform: Platform,
    pub metric: Metric,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub unit: Option<&'static str>,
    /// Set for writable entities.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub control: Option<Control>,
    #[serde(skip)]
    quantity: Quantity,
}

/// An entity with its current state.
#[derive(Debug, Clone, Serialize)]
pub struct EntityState {
    #[serde(flatten)]
    pub descriptor: EntityDescriptor,
    pub state: Value,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub attributes: Option<Value>,
    pub available: bool,
    pub stale: bool,
    /// The value was set by a command and no poll has confirmed it yet.
    pub assumed: bool,
}

fn templates(product_code: ProductCode) -> &'static [Template] {
    match product_code {
        ProductCode::PhynPlus1 | ProductCode::PhynPlus2 => PHYN_PLUS,
        ProductCode::Classic => CLASSIC,
        ProductCode::WaterSensor => WATER_SENSOR,
    }
}

/// The entities `device` exposes.
pub fn descriptors(device: &Device, units: UnitSystem) -> Vec<EntityDescriptor> {
    templates(device.product_code)
        .iter()
        .map(|t| {
            let control = t
                .key
                .parse::<Control>()
                .ok()
                .filter(|c| c.supported_by(device.capabilities));
            EntityDescriptor {
                unique_id: format!("{}_{}", device.id, t.key),
                device_id: device.id.clone(),
                name: format!("{} {}", device.name, t.name),
                platform: t.platform,
                metric: t.metric,
                unit: t.quantity.unit(units),
                control,
                quantity: t.quantity,
            }
        })
        .collect()
}

fn on_off(on: bool) -> Value {
    Value::from(if on { "on" } else { "off" })
}

/// `latest` is newer than `installed`. Versions are compared numerically
/// when both are numbers.
fn update_available(installed: &str, latest: &str) -> bool {
    match (installed.parse::<u64>(), latest.parse::<u64>()) {
        (Ok(i), Ok(l)) => l > i,
        _ => installed != latest,
    }
}

fn value_of(descriptor: &EntityDescriptor, snapshot: &Snapshot, units: UnitSystem) -> (Value, Option<Value>) {
    if descriptor.platform == Platform::Update {
        let installed = snapshot.text(Metric::FirmwareVersion);
        let latest = snapshot.text(Metric::LatestFirmware);
        let state = match (installed, latest) {
            (Some(i), Some(l)) => on_off(update_available(i, l)),
            _ => Value::Null,
        };
        let attributes = json!({
            "installed_version": installed,
            "latest_version": latest,
            "release_url": snapshot.text(Metric::ReleaseUrl),
        });
        return (state, Some(attributes));
    }

    let state = match snapshot.get(descriptor.metric) {
        None => Value::Null,
        Some(MetricValue::Number(n)) => Value::from(descriptor.quantity.convert(*n, units)),
        Some(MetricValue::Flag(b)) => on_off(*b),
        Some(MetricValue::Valve(v)) => Value::from(v.to_string()),
        Some(MetricValue::Text(s)) => Value::from(s.clone()),
    };
    (state, None)
}

/// Current state of one entity. With no cache entry the entity is
/// unavailable and has no state.
pub fn render(descriptor: &EntityDescriptor, entry: Option<&CacheEntry>, units: UnitSystem) -> EntityState {
    let Some(entry) = entry else {
        return EntityState {
            descriptor: descriptor.clone(),
            state: Value::Null,
            attributes: None,
            available: false,
            stale: false,
            assumed: false,
        };
    };

    let snapshot = &entry.snapshot;
    let (state, attributes) = value_of(descriptor, snapshot, units);
    EntityState {
        descriptor: descriptor.clone(),
        state,
        attributes,
        available: snapshot.flag(Metric::Online) != Some(false),
        stale: entry.stale,
        assumed: snapshot.unconfirmed.contains(&descriptor.metric),
    }
}

/// Every entity of every registered device.
pub fn entity_states(
    registry: &DeviceRegistry,
    cache: &EntityStateCache,
    units: UnitSystem,
) -> Vec<EntityState> {
    let entries = cache.entries();
    registry
        .list()
        .iter()
        .flat_map(|device: &Arc<Device>| {
            let entry = entries.get(&device.id);
            descriptors(device, units)
                .into_iter()
                .map(move |d| render(&d, entry, units))
        })
        .collect()
}
