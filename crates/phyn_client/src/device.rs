use serde::Serialize;
use strum::Display;
use strum::EnumString;

/// Phyn hardware family, as reported by the `product_code` field.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Display, EnumString)]
pub enum ProductCode {
    /// Phyn Plus, first generation.
    #[strum(serialize = "PP1")]
    #[serde(rename = "PP1")]
    PhynPlus1,
    /// Phyn Plus, second generation.
    #[strum(serialize = "PP2")]
    #[serde(rename = "PP2")]
    PhynPlus2,
    /// Phyn Classic (hot and cold line monitor, no valve).
    #[strum(serialize = "PC1")]
    #[serde(rename = "PC1")]
    Classic,
    /// Phyn water sensor (battery powered leak/humidity sensor).
    #[strum(serialize = "PW1")]
    #[serde(rename = "PW1")]
    WaterSensor,
}

impl ProductCode {
    pub fn model_name(self) -> &'static str {
        match self {
            ProductCode::PhynPlus1 | ProductCode::PhynPlus2 => "Phyn Plus",
            ProductCode::Classic => "Phyn Classic",
            ProductCode::WaterSensor => "Phyn Water Sensor",
        }
    }

    pub fn capabilities(self) -> Capabilities {
        match self {
            ProductCode::PhynPlus1 | ProductCode::PhynPlus2 => Capabilities {
                valve: true,
                away_mode: true,
                flow_sensor: true,
                leak_test: true,
                water_sensor: false,
            },
            ProductCode::Classic => Capabilities {
                flow_sensor: true,
                ..Capabilities::default()
            },
            ProductCode::WaterSensor => Capabilities {
                water_sensor: true,
                ..Capabilities::default()
            },
        }
    }
}

/// What a device can report and be told to do.
///
/// Valve control and away mode are independent: a device may in principle
/// advertise either without the other.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct Capabilities {
    pub valve: bool,
    pub away_mode: bool,
    pub flow_sensor: bool,
    pub leak_test: bool,
    pub water_sensor: bool,
}

/// A device discovered on the account.
///
/// Immutable for the lifetime of a session; rediscovery produces new values.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Device {
    pub id: String,
    pub home_id: String,
    pub name: String,
    pub product_code: ProductCode,
    pub capabilities: Capabilities,
}

impl Device {
    pub fn new(id: impl Into<String>, home_id: impl Into<String>, product_code: ProductCode) -> Self {
        Self {
            id: id.into(),
            home_id: home_id.into(),
            name: product_code.model_name().to_string(),
            product_code,
            capabilities: product_code.capabilities(),
        }
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    /// A device id is valid when it is non-empty and free of path separators,
    /// since it is interpolated into request paths.
    pub fn has_valid_id(&self) -> bool {
        !self.id.trim().is_empty() && !self.id.contains('/')
    }
}
