//! Tracking-server REST API: device listing and device creation.

use crate::error::HarnessError;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::{debug, info};

/// A device as listed by `GET /api/devices`.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct RemoteDevice {
    pub id: i64,
    #[serde(default)]
    pub name: String,
    #[serde(rename = "uniqueId", default)]
    pub unique_id: String,
}

#[derive(Debug, Serialize)]
struct NewDevice<'a> {
    name: &'a str,
    #[serde(rename = "uniqueId")]
    unique_id: &'a str,
    status: &'static str,
    #[serde(rename = "lastUpdate")]
    last_update: String,
}

/// Result of one create call that reached the server.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CreateOutcome {
    Created(u16),
    Refused { status: u16, body: String },
}

#[derive(Debug, Clone)]
pub struct TrackerClient {
    http: reqwest::Client,
    devices_url: String,
    api_key: String,
}

impl TrackerClient {
    pub fn new(api_base: &str, api_key: &str, timeout: Duration) -> Result<Self, HarnessError> {
        if api_key.is_empty() {
            return Err(HarnessError::MissingSetting("TRACCAR_API_KEY"));
        }
        let devices_url = format!("{}/api/devices", api_base.trim_end_matches('/'));
        url::Url::parse(&devices_url)?;
        let http = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self {
            http,
            devices_url,
            api_key: api_key.to_string(),
        })
    }

    pub async fn list_devices(&self) -> Result<Vec<RemoteDevice>, HarnessError> {
        let response = self
            .http
            .get(&self.devices_url)
            .bearer_auth(&self.api_key)
            .header(reqwest::header::ACCEPT, "application/json")
            .send()
            .await?;
        if !response.status().is_success() {
            return Err(HarnessError::HttpStatus {
                status: response.status().as_u16(),
                url: self.devices_url.clone(),
            });
        }
        let body = response.text().await?;
        let devices: Vec<RemoteDevice> = sonic_rs::from_str(&body)?;
        info!("Fetched {} devices from tracker", devices.len());
        Ok(devices)
    }

    /// Creates a device whose name doubles as its unique id.
    pub async fn create_device(&self, name: &str) -> Result<CreateOutcome, HarnessError> {
        let payload = NewDevice {
            name,
            unique_id: name,
            status: "online",
            last_update: chrono::Utc::now().to_rfc3339_opts(chrono::SecondsFormat::Micros, true),
        };
        let body = sonic_rs::to_string(&payload)?;

        let response = self
            .http
            .post(&self.devices_url)
            .bearer_auth(&self.api_key)
            .header(reqwest::header::ACCEPT, "application/json")
            .header(reqwest::header::CONTENT_TYPE, "application/json")
            .body(body)
            .send()
            .await?;
        let status = response.status().as_u16();
        if status == 200 || status == 201 {
            debug!("[{}] {} created", status, name);
            return Ok(CreateOutcome::Created(status));
        }
        let text = response.text().await.unwrap_or_default();
        Ok(CreateOutcome::Refused {
            status,
            body: text.chars().take(100).collect(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decodes_device_listing() {
        let body = r#"[
            {"id": 1, "name": "SIMU10000", "uniqueId": "SIMU10000", "status": "online"},
            {"id": 2, "name": "truck"}
        ]"#;
        let devices: Vec<RemoteDevice> = sonic_rs::from_str(body).unwrap();
        assert_eq!(devices.len(), 2);
        assert_eq!(devices[0].unique_id, "SIMU10000");
        assert_eq!(devices[1].unique_id, "");
    }

    #[test]
    fn requires_api_key() {
        let err = TrackerClient::new("http://localhost:8082", "", Duration::from_secs(1)).unwrap_err();
        assert!(matches!(err, HarnessError::MissingSetting("TRACCAR_API_KEY")));
    }

    #[test]
    fn rejects_malformed_base() {
        assert!(TrackerClient::new("not a url", "key", Duration::from_secs(1)).is_err());
    }
}
