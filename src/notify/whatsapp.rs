use async_trait::async_trait;
use reqwest::Url;
use serde_json::Value;

use super::telegram::config_str;
use super::{NotifyError, NotifySender};

const CALLMEBOT_API: &str = "https://api.callmebot.com/whatsapp.php";

/// Sends WhatsApp messages through the CallMeBot gateway.
pub struct WhatsAppSender {
    client: reqwest::Client,
    endpoint: String,
    phone: String,
    api_key: String,
}

impl WhatsAppSender {
    pub fn new(client: reqwest::Client, phone: impl Into<String>, api_key: impl Into<String>) -> Self {
        Self {
            client,
            endpoint: CALLMEBOT_API.to_string(),
            phone: phone.into(),
            api_key: api_key.into(),
        }
    }

    /// Build from a destination config: `{"phone": "...", "api_key": "..."}`.
    pub fn from_config(client: reqwest::Client, config: &Value) -> Result<Self, NotifyError> {
        let phone = config_str(config, &["phone"])
            .ok_or_else(|| NotifyError::NotConfigured("whatsapp: missing phone".to_string()))?;
        let api_key = config_str(config, &["api_key", "apiKey", "apikey"])
            .ok_or_else(|| NotifyError::NotConfigured("whatsapp: missing api_key".to_string()))?;
        Ok(Self::new(client, phone, api_key))
    }

    fn request_url(&self, text: &str) -> Result<Url, NotifyError> {
        Url::parse_with_params(
            &self.endpoint,
            &[("phone", self.phone.as_str()), ("text", text), ("apikey", self.api_key.as_str())],
        )
        .map_err(|e| NotifyError::NotConfigured(format!("whatsapp: {}", e)))
    }
}

#[async_trait]
impl NotifySender for WhatsAppSender {
    fn name(&self) -> String {
        // Phone numbers are only partially logged.
        let visible: String = self.phone.chars().take(6).collect();
        format!("whatsapp:{}...", visible)
    }

    async fn send(&self, text: &str) -> Result<(), NotifyError> {
        let response = self.client.get(self.request_url(text)?).send().await?;

        let status = response.status();
        if status.is_success() {
            return Ok(());
        }

        let description = response.text().await.unwrap_or_default();
        Err(NotifyError::Rejected {
            status: status.as_u16(),
            description: description.chars().take(200).collect(),
        })
    }
}
