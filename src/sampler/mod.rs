//! Sampler module: fetches channel snapshots from monitored sources.
//!
//! The scheduler only depends on the [`ChannelSampler`] trait; [`HttpSampler`]
//! is the stock implementation for JSON channel listings.

mod http;

pub use http::*;

use async_trait::async_trait;
use std::time::Duration;
use thiserror::Error;

use crate::db::{ChannelObservation, Source};

/// Sampler error types.
#[derive(Error, Debug)]
pub enum SamplerError {
    #[error("sampler timed out after {0:?}")]
    Timeout(Duration),
    #[error("network error: {0}")]
    Network(String),
    #[error("upstream returned HTTP {0}")]
    Status(u16),
    #[error("malformed response: {0}")]
    Parse(String),
    #[error("invalid configuration: {0}")]
    Config(String),
}

/// Produces the current channel observations of one source.
#[async_trait]
pub trait ChannelSampler: Send + Sync {
    async fn fetch_observations(&self, source: &Source) -> Result<Vec<ChannelObservation>, SamplerError>;
}

/// Normalize an upstream channel id so numeric ids key consistently
/// (`"12.0"` and `"12"` are the same channel).
pub fn normalize_channel_id(raw: &str) -> String {
    let trimmed = raw.trim();
    match trimmed.strip_suffix(".0") {
        Some(int) if !int.is_empty() && int.chars().all(|c| c.is_ascii_digit()) => int.to_string(),
        _ => trimmed.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_normalize_channel_id() {
        assert_eq!(normalize_channel_id("12.0"), "12");
        assert_eq!(normalize_channel_id(" 7 "), "7");
        assert_eq!(normalize_channel_id("news.0"), "news.0");
        assert_eq!(normalize_channel_id("1.05"), "1.05");
        assert_eq!(normalize_channel_id(".0"), ".0");
    }
}
