use std::time::Duration;

use async_trait::async_trait;
use chrono::DateTime;
use chrono::NaiveDate;
use chrono::Utc;
use reqwest::header::AUTHORIZATION;
use reqwest::header::RETRY_AFTER;
use reqwest::Method;
use reqwest::StatusCode;
use serde::de::DeserializeOwned;
use tracing::debug;
use tracing::info;
use tracing::warn;

use crate::device::Device;
use crate::device::ProductCode;
use crate::error::ApiError;
use crate::error::AuthError;
use crate::records::AveragesRecord;
use crate::records::FirmwareRecord;
use crate::records::Home;
use crate::records::Preference;
use crate::records::PreferencesRecord;
use crate::records::UsageRecord;
use crate::records::WaterStatistics;
use crate::retry::RetryPolicy;
use crate::session::Credentials;
use crate::session::SessionManager;
use crate::AWAY_MODE_PREFERENCE;
use crate::SCHEDULED_LEAK_TEST_PREFERENCE;

/// Home names the cloud API cannot resolve devices for.
const RESERVED_HOME_NAMES: &[&str] = &["home"];

/// The operations the daemon needs from the Phyn cloud.
///
/// This trait allows for mocking the cloud in tests.
#[async_trait]
pub trait RemoteClient: Send + Sync {
    /// Discover every supported device across all homes on the account.
    async fn list_devices(&self) -> Result<Vec<Device>, ApiError>;

    /// Water used on `day` (device local date).
    async fn get_usage(&self, device: &Device, day: NaiveDate) -> Result<UsageRecord, ApiError>;

    /// Current state with realtime averages: flow, pressure, temperature, valve.
    async fn get_realtime_averages(&self, device: &Device) -> Result<AveragesRecord, ApiError>;

    async fn get_preferences(&self, device: &Device) -> Result<PreferencesRecord, ApiError>;

    async fn get_firmware(&self, device: &Device) -> Result<FirmwareRecord, ApiError>;

    async fn get_water_statistics(
        &self,
        device: &Device,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> Result<Vec<WaterStatistics>, ApiError>;

    async fn set_valve(&self, device: &Device, open: bool) -> Result<(), ApiError>;

    async fn set_away_mode(&self, device: &Device, enabled: bool) -> Result<(), ApiError>;

    async fn set_scheduled_leak_test(&self, device: &Device, enabled: bool)
        -> Result<(), ApiError>;

    /// Throw away the current session and log in again.
    async fn reauthenticate(&self) -> Result<(), AuthError>;
}

/// Connection settings for [`PhynClient`].
#[derive(Debug, Clone)]
pub struct ClientOptions {
    pub base_url: String,
    pub auth_url: String,
    pub client_id: String,
    pub api_key: String,
    pub request_timeout: Duration,
    pub retry: RetryPolicy,
}

impl ClientOptions {
    pub const DEFAULT_BASE_URL: &'static str = "https://api.phyn.com";
    pub const DEFAULT_REGION: &'static str = "us-east-1";

    pub fn cognito_url(region: &str) -> String {
        format!("https://cognito-idp.{}.amazonaws.com/", region)
    }
}

/// HTTP client for the Phyn cloud API.
pub struct PhynClient {
    http: reqwest::Client,
    options: ClientOptions,
    session: SessionManager,
}

impl PhynClient {
    /// Log in and return a ready client.
    pub async fn authenticate(
        credentials: Credentials,
        options: ClientOptions,
    ) -> Result<Self, AuthError> {
        let http = reqwest::Client::builder()
            .timeout(options.request_timeout)
            .build()
            .map_err(|e| AuthError::Unavailable(e.to_string()))?;

        let session = SessionManager::new(
            http.clone(),
            options.auth_url.clone(),
            options.client_id.clone(),
            credentials,
        );
        session.token().await?;
        info!("Authenticated with Phyn cloud at {}", options.base_url);

        Ok(Self {
            http,
            options,
            session,
        })
    }

    fn url(&self, path: &str) -> String {
        format!(
            "{}/{}",
            self.options.base_url.trim_end_matches('/'),
            path.trim_start_matches('/')
        )
    }

    pub(crate) fn username(&self) -> &str {
        self.session.username()
    }

    /// Send a request, retrying rate-limited responses per the retry policy.
    pub(crate) async fn send(
        &self,
        method: Method,
        path: &str,
        query: &[(&str, String)],
        body: Option<&serde_json::Value>,
    ) -> Result<reqwest::Response, ApiError> {
        let context = format!("{} {}", method, path);
        let mut attempt = 0;

        loop {
            let token = self.session.token().await?;
            let mut request = self
                .http
                .request(method.clone(), self.url(path))
                .header(AUTHORIZATION, token)
                .header("x-api-key", &self.options.api_key)
                .query(query);
            if let Some(body) = body {
                request = request.json(body);
            }

            let response = request.send().await?;
            let status = response.status();

            if status.is_success() {
                return Ok(response);
            }

            if status == StatusCode::TOO_MANY_REQUESTS && attempt < self.options.retry.max_retries
            {
                let retry_after = response
                    .headers()
                    .get(RETRY_AFTER)
                    .and_then(|v| v.to_str().ok())
                    .and_then(|v| v.trim().parse::<u64>().ok())
                    .map(Duration::from_secs);
                let delay = self.options.retry.delay(attempt, retry_after);
                warn!("{} rate limited, retrying in {:?}", context, delay);
                tokio::time::sleep(delay).await;
                attempt += 1;
                continue;
            }

            let body = response.text().await.unwrap_or_default();
            debug!("{} failed with {}: {}", context, status, body);
            return Err(ApiError::from_status(status, &context));
        }
    }

    async fn get_json<T: DeserializeOwned>(
        &self,
        path: &str,
        query: &[(&str, String)],
    ) -> Result<T, ApiError> {
        let response = self.send(Method::GET, path, query, None).await?;
        let value = response.json::<T>().await?;
        Ok(value)
    }

    async fn set_preference(
        &self,
        device: &Device,
        name: &str,
        enabled: bool,
    ) -> Result<(), ApiError> {
        let body = serde_json::to_value([Preference {
            device_id: device.id.clone(),
            name: name.to_string(),
            value: enabled.to_string(),
        }])
        .map_err(|e| ApiError::Rejected(e.to_string()))?;

        debug!("Setting preference {}={} on {}", name, enabled, device.id);
        self.send(
            Method::POST,
            &format!("preferences/device/{}", device.id),
            &[],
            Some(&body),
        )
        .await?;
        Ok(())
    }
}

/// Flatten homes into devices, skipping product families we do not know.
fn devices_from_homes(homes: Vec<Home>) -> Result<Vec<Device>, AuthError> {
    let mut devices = Vec::new();
    for home in homes {
        if let Some(name) = &home.name {
            if RESERVED_HOME_NAMES
                .iter()
                .any(|reserved| name.trim().eq_ignore_ascii_case(reserved))
            {
                return Err(AuthError::ReservedHomeName(name.clone()));
            }
        }

        for entry in home.devices {
            let product_code = match entry.product_code.parse::<ProductCode>() {
                Ok(code) => code,
                Err(_) => {
                    warn!(
                        "Skipping device {} with unsupported product code {}",
                        entry.device_id, entry.product_code
                    );
                    continue;
                }
            };
            let mut device = Device::new(entry.device_id, home.id.clone(), product_code);
            if let Some(name) = entry.name.filter(|n| !n.trim().is_empty()) {
                device = device.with_name(format!("{} - {}", product_code.model_name(), name));
            }
            devices.push(device);
        }
    }
    Ok(devices)
}

#[async_trait]
impl RemoteClient for PhynClient {
    async fn list_devices(&self) -> Result<Vec<Device>, ApiError> {
        let homes: Vec<Home> = self
            .get_json("homes", &[("user_id", self.username().to_string())])
            .await?;
        debug!("Phyn homes: {:?}", homes);
        Ok(devices_from_homes(homes)?)
    }

    async fn get_usage(&self, device: &Device, day: NaiveDate) -> Result<UsageRecord, ApiError> {
        self.get_json(
            &format!("devices/{}/consumption/details", device.id),
            &[
                ("device_id", device.id.clone()),
                ("duration", day.format("%Y/%m/%d").to_string()),
                ("precision", "6".to_string()),
            ],
        )
        .await
    }

    async fn get_realtime_averages(&self, device: &Device) -> Result<AveragesRecord, ApiError> {
        self.get_json(&format!("devices/{}/state", device.id), &[])
            .await
    }

    async fn get_preferences(&self, device: &Device) -> Result<PreferencesRecord, ApiError> {
        self.get_json(&format!("preferences/device/{}", device.id), &[])
            .await
    }

    async fn get_firmware(&self, device: &Device) -> Result<FirmwareRecord, ApiError> {
        let releases: Vec<FirmwareRecord> = self
            .get_json(
                "firmware/latestVersion/v2",
                &[("device_id", device.id.clone())],
            )
            .await?;
        Ok(releases.into_iter().next().unwrap_or_default())
    }

    async fn get_water_statistics(
        &self,
        device: &Device,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> Result<Vec<WaterStatistics>, ApiError> {
        self.get_json(
            &format!("devices/{}/water_statistics/history/", device.id),
            &[
                ("from_ts", from.timestamp_millis().to_string()),
                ("to_ts", to.timestamp_millis().to_string()),
            ],
        )
        .await
    }

    async fn set_valve(&self, device: &Device, open: bool) -> Result<(), ApiError> {
        let action = if open { "Open" } else { "Close" };
        info!("Sending valve {} to {}", action, device.id);
        self.send(
            Method::POST,
            &format!("devices/{}/sov/{}", device.id, action),
            &[],
            None,
        )
        .await?;
        Ok(())
    }

    async fn set_away_mode(&self, device: &Device, enabled: bool) -> Result<(), ApiError> {
        self.set_preference(device, AWAY_MODE_PREFERENCE, enabled)
            .await
    }

    async fn set_scheduled_leak_test(
        &self,
        device: &Device,
        enabled: bool,
    ) -> Result<(), ApiError> {
        self.set_preference(device, SCHEDULED_LEAK_TEST_PREFERENCE, enabled)
            .await
    }

    async fn reauthenticate(&self) -> Result<(), AuthError> {
        self.session.reauthenticate().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::records::HomeDevice;

    fn home(name: &str, devices: &[(&str, &str)]) -> Home {
        Home {
            id: format!("home-{}", name),
            name: Some(name.to_string()),
            devices: devices
                .iter()
                .map(|(id, code)| HomeDevice {
                    device_id: id.to_string(),
                    product_code: code.to_string(),
                    name: None,
                })
                .collect(),
        }
    }

    #[test]
    fn test_devices_from_homes_skips_unknown_products() {
        let devices = devices_from_homes(vec![
            home("Cabin", &[("d1", "PP2"), ("d2", "ZZ1")]),
            home("Lake House", &[("d3", "PW1")]),
        ])
        .unwrap();

        let ids: Vec<_> = devices.iter().map(|d| d.id.as_str()).collect();
        assert_eq!(ids, vec!["d1", "d3"]);
        assert_eq!(devices[0].home_id, "home-Cabin");
        assert_eq!(devices[1].product_code, ProductCode::WaterSensor);
    }

    #[test]
    fn test_reserved_home_name_is_an_auth_error() {
        let err = devices_from_homes(vec![home("Home", &[("d1", "PP2")])]).unwrap_err();
        assert!(matches!(err, AuthError::ReservedHomeName(name) if name == "Home"));
    }

    #[test]
    fn test_named_device() {
        let mut h = home("Cabin", &[]);
        h.devices.push(HomeDevice {
            device_id: "w1".into(),
            product_code: "PW1".into(),
            name: Some("Basement".into()),
        });
        let devices = devices_from_homes(vec![h]).unwrap();
        assert_eq!(devices[0].name, "Phyn Water Sensor - Basement");
    }
}
