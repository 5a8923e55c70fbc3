//! Client for the Phyn cloud API.
//!
//! The [`RemoteClient`] trait is the narrow contract the daemon polls and
//! commands through; [`PhynClient`] is the HTTP implementation of it.
//! Realtime updates arrive separately through [`PushSource`].

mod client;
mod device;
mod error;
mod push;
mod records;
mod retry;
mod session;

pub use client::ClientOptions;
pub use client::PhynClient;
pub use client::RemoteClient;
pub use device::Capabilities;
pub use device::Device;
pub use device::ProductCode;
pub use error::ApiError;
pub use error::AuthError;
pub use records::AveragesRecord;
pub use records::FirmwareRecord;
pub use records::Home;
pub use records::HomeDevice;
pub use records::IotPolicy;
pub use records::Preference;
pub use records::PreferencesRecord;
pub use records::Reading;
pub use records::SampledValue;
pub use records::StatusValue;
pub use records::UsageRecord;
pub use records::WaterAlerts;
pub use records::WaterStatistics;
pub use push::device_topic;
pub use push::PushSource;
pub use push::PushUpdate;
pub use push::SensorData;
pub use retry::RetryPolicy;
pub use session::Credentials;

/// Preference key for away mode (leak sensitivity while the home is empty).
pub const AWAY_MODE_PREFERENCE: &str = "leak_sensitivity_away_mode";

/// Preference key for the scheduled leak test.
pub const SCHEDULED_LEAK_TEST_PREFERENCE: &str = "scheduler_enable";
