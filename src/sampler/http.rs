//! HTTP sampler for JSON channel listings.

use async_trait::async_trait;
use serde_json::Value;
use std::time::Duration;

use super::{normalize_channel_id, ChannelSampler, SamplerError};
use crate::db::{ChannelObservation, ChannelState, Source};

/// Fetches `<base_url>/api/channels` with basic auth.
///
/// Accepts a bare JSON array or an object wrapping it under `channels` or
/// `data`. Each item needs an `id` (string or number) and either a `status`
/// string or a boolean `live` flag.
pub struct HttpSampler {
    client: reqwest::Client,
    timeout: Duration,
}

impl HttpSampler {
    pub fn new(timeout: Duration) -> Result<Self, SamplerError> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| SamplerError::Config(e.to_string()))?;
        Ok(Self { client, timeout })
    }
}

#[async_trait]
impl ChannelSampler for HttpSampler {
    async fn fetch_observations(&self, source: &Source) -> Result<Vec<ChannelObservation>, SamplerError> {
        let base = source.base_url.trim_end_matches('/');
        if !(base.starts_with("http://") || base.starts_with("https://")) {
            return Err(SamplerError::Config(format!("unsupported base url: {}", source.base_url)));
        }
        let url = format!("{}/api/channels", base);

        let mut request = self.client.get(&url);
        if !source.username.is_empty() {
            request = request.basic_auth(&source.username, Some(&source.password));
        }

        let response = request.send().await.map_err(|e| {
            if e.is_timeout() {
                SamplerError::Timeout(self.timeout)
            } else {
                SamplerError::Network(e.to_string())
            }
        })?;

        let status = response.status();
        if !status.is_success() {
            return Err(SamplerError::Status(status.as_u16()));
        }

        let body: Value = response
            .json()
            .await
            .map_err(|e| SamplerError::Parse(e.to_string()))?;

        parse_channels(&source.id, &body)
    }
}

/// Turn a channel listing into observations for `source_id`.
pub fn parse_channels(source_id: &str, body: &Value) -> Result<Vec<ChannelObservation>, SamplerError> {
    let items = match body {
        Value::Array(items) => items,
        Value::Object(map) => match map.get("channels").or_else(|| map.get("data")) {
            Some(Value::Array(items)) => items,
            _ => return Err(SamplerError::Parse("expected a `channels` or `data` array".to_string())),
        },
        _ => return Err(SamplerError::Parse("expected a JSON array or object".to_string())),
    };

    let mut observations = Vec::with_capacity(items.len());
    for item in items {
        let Some(raw_id) = item.get("id").or_else(|| item.get("channel_id")).and_then(id_string) else {
            tracing::debug!("Sampler: skipping channel without id in source {}", source_id);
            continue;
        };
        let channel_id = normalize_channel_id(&raw_id);

        let status = match (item.get("status").and_then(Value::as_str), item.get("live").and_then(Value::as_bool)) {
            (Some(s), _) => match s.parse::<ChannelState>() {
                Ok(state) => state,
                Err(e) => {
                    tracing::warn!("Sampler: channel {} in source {}: {}", channel_id, source_id, e);
                    continue;
                }
            },
            (None, Some(true)) => ChannelState::Online,
            (None, Some(false)) => ChannelState::Offline,
            (None, None) => {
                tracing::warn!("Sampler: channel {} in source {} has no status", channel_id, source_id);
                continue;
            }
        };

        let channel_name = item
            .get("name")
            .or_else(|| item.get("channel_name"))
            .and_then(Value::as_str)
            .map(str::to_string)
            .unwrap_or_else(|| channel_id.clone());

        observations.push(ChannelObservation {
            source_id: source_id.to_string(),
            channel_id,
            channel_name,
            status,
        });
    }

    Ok(observations)
}

fn id_string(value: &Value) -> Option<String> {
    match value {
        Value::String(s) if !s.trim().is_empty() => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}
