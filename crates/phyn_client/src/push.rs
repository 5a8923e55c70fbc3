//! Realtime device updates pushed over the account's MQTT websocket.
//!
//! The REST API only answers when asked; the realtime channel publishes a
//! partial state whenever a device reports. [`PushSource`] is the seam the
//! daemon listens through so tests can feed updates without a broker.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::Method;
use rumqttc::AsyncClient;
use rumqttc::Event;
use rumqttc::MqttOptions;
use rumqttc::Packet;
use rumqttc::QoS;
use rumqttc::Transport;
use serde::Deserialize;
use tokio::sync::mpsc;
use tracing::debug;
use tracing::info;
use tracing::warn;

use crate::client::PhynClient;
use crate::error::ApiError;
use crate::records::IotPolicy;
use crate::records::Reading;
use crate::records::StatusValue;

/// Topic prefix the cloud publishes device updates under.
const TOPIC_PREFIX: &str = "prd/app_subscriptions/";

/// Connection errors tolerated in a row before the channel is given up.
const MAX_CONNECTION_ERRORS: u32 = 5;

pub fn device_topic(device_id: &str) -> String {
    format!("{}{}", TOPIC_PREFIX, device_id)
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct SensorData {
    #[serde(default)]
    pub pressure: Option<Reading>,
    #[serde(default)]
    pub temperature: Option<Reading>,
}

/// A partial device state. Only the fields present were reported.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct PushUpdate {
    /// Taken from the topic, not the payload.
    #[serde(skip)]
    pub device_id: String,
    #[serde(default)]
    pub flow: Option<Reading>,
    #[serde(default)]
    pub flow_state: Option<StatusValue>,
    /// Valve state, reported with the same words as `sov_status`.
    #[serde(default)]
    pub sov_state: Option<String>,
    #[serde(default)]
    pub sensor_data: Option<SensorData>,
    /// Lifetime water usage in gallons.
    #[serde(default)]
    pub consumption: Option<Reading>,
}

impl PushUpdate {
    /// Decode a message published on a device topic.
    ///
    /// Returns `None` for topics outside the device namespace and for
    /// payloads that are not a JSON object.
    pub fn parse(topic: &str, payload: &[u8]) -> Option<Self> {
        let device_id = topic.strip_prefix(TOPIC_PREFIX)?;
        if device_id.is_empty() || device_id.contains('/') {
            return None;
        }

        match serde_json::from_slice::<PushUpdate>(payload) {
            Ok(mut update) => {
                update.device_id = device_id.to_string();
                Some(update)
            }
            Err(e) => {
                debug!("Ignoring undecodable update on {}: {}", topic, e);
                None
            }
        }
    }
}

/// A stream of realtime updates for a set of devices.
#[async_trait]
pub trait PushSource: Send + Sync {
    /// Connect and subscribe to `device_ids`.
    ///
    /// The receiver closes when the connection is lost for good; dropping it
    /// disconnects.
    async fn subscribe(&self, device_ids: &[String]) -> Result<mpsc::Receiver<PushUpdate>, ApiError>;
}

impl PhynClient {
    /// Fetch the presigned broker URL for the logged in user.
    pub async fn iot_policy(&self) -> Result<IotPolicy, ApiError> {
        let path = format!("users/{}/iot_policy", self.username());
        let response = self.send(Method::POST, &path, &[], None).await?;
        Ok(response.json::<IotPolicy>().await?)
    }
}

#[async_trait]
impl PushSource for PhynClient {
    async fn subscribe(&self, device_ids: &[String]) -> Result<mpsc::Receiver<PushUpdate>, ApiError> {
        let policy = self.iot_policy().await?;

        let client_id = format!(
            "phynd-{}-{}",
            std::process::id(),
            chrono::Utc::now().timestamp_millis()
        );
        let mut options = MqttOptions::new(client_id, policy.wss_url, 443);
        options.set_transport(Transport::wss_with_default_config());
        options.set_keep_alive(Duration::from_secs(30));

        let (client, mut event_loop) = AsyncClient::new(options, 10);
        let (tx, rx) = mpsc::channel(64);

        // The event loop stops once every client handle is gone.
        let session = client.clone();
        tokio::spawn(async move {
            let mut errors = 0;
            loop {
                let event = tokio::select! {
                    _ = tx.closed() => {
                        session.try_disconnect().ok();
                        break;
                    }
                    event = event_loop.poll() => event,
                };

                match event {
                    Ok(Event::Incoming(Packet::Publish(publish))) => {
                        let Some(update) = PushUpdate::parse(&publish.topic, &publish.payload)
                        else {
                            continue;
                        };
                        if tx.send(update).await.is_err() {
                            break;
                        }
                    }
                    Ok(Event::Incoming(Packet::ConnAck(_))) => {
                        debug!("Realtime channel connected");
                        errors = 0;
                    }
                    Ok(_) => {}
                    Err(e) => {
                        errors += 1;
                        warn!("Realtime channel error ({}/{}): {}", errors, MAX_CONNECTION_ERRORS, e);
                        if errors >= MAX_CONNECTION_ERRORS {
                            break;
                        }
                        tokio::time::sleep(Duration::from_secs(1)).await;
                    }
                }
            }
            info!("Realtime channel closed");
        });

        for id in device_ids {
            client
                .subscribe(device_topic(id), QoS::AtMostOnce)
                .await
                .map_err(|e| ApiError::Transient(format!("subscribe to {}: {}", id, e)))?;
        }
        info!("Subscribed to realtime updates for {} device(s)", device_ids.len());

        Ok(rx)
    }
}
