//! Network sensors feeding the connectivity monitor

use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::time::Instant;

use crate::error::{Error, Result};

/// Kind of link the device reports
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LinkType {
    Ethernet,
    Wifi,
    Cellular,
    Unknown,
}

impl LinkType {
    /// Contribution to the quality score, 0.0 to 1.0.
    pub const fn score(self) -> f64 {
        match self {
            Self::Ethernet => 1.0,
            Self::Wifi => 0.8,
            Self::Cellular => 0.5,
            Self::Unknown => 0.3,
        }
    }
}

/// Independent network signals; any of them may fail on its own.
#[async_trait]
pub trait NetworkSensor: Send + Sync {
    async fn check_reachable(&self) -> Result<bool>;

    /// Round-trip time of a small request
    async fn measure_latency(&self) -> Result<Duration>;

    async fn link_type(&self) -> Result<LinkType>;

    /// Download rate in kilobits per second
    async fn measure_throughput(&self) -> Result<f64>;
}

/// Sensor that talks to an HTTP health endpoint
#[derive(Debug, Clone)]
pub struct HttpSensor {
    url: String,
    client: reqwest::Client,
}

impl HttpSensor {
    pub fn new(url: impl Into<String>, timeout: Duration) -> Result<Self> {
        let url = url.into();
        if !crate::util::is_http_url(&url) {
            return Err(Error::ValidationFailed(format!(
                "reachability URL must include http:// or https://, got {url}"
            )));
        }
        Ok(Self {
            url,
            client: reqwest::Client::builder().timeout(timeout).build()?,
        })
    }

    pub fn url(&self) -> &str {
        &self.url
    }
}

#[async_trait]
impl NetworkSensor for HttpSensor {
    async fn check_reachable(&self) -> Result<bool> {
        match self.client.head(&self.url).send().await {
            // Any HTTP answer means the host is reachable.
            Ok(_) => Ok(true),
            Err(error) if error.is_connect() || error.is_timeout() => Ok(false),
            Err(error) => Err(error.into()),
        }
    }

    async fn measure_latency(&self) -> Result<Duration> {
        let started = Instant::now();
        self.client.head(&self.url).send().await?;
        Ok(started.elapsed())
    }

    async fn link_type(&self) -> Result<LinkType> {
        // Not observable from a plain HTTP client.
        Ok(LinkType::Unknown)
    }

    async fn measure_throughput(&self) -> Result<f64> {
        let started = Instant::now();
        let body = self.client.get(&self.url).send().await?.bytes().await?;
        let seconds = started.elapsed().as_secs_f64().max(0.001);
        #[allow(clippy::cast_precision_loss)]
        let kilobits = (body.len() * 8) as f64 / 1000.0;
        Ok(kilobits / seconds)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_non_http_url() {
        assert!(HttpSensor::new("example.com", Duration::from_secs(1)).is_err());
        let sensor = HttpSensor::new("http://localhost:9/health", Duration::from_secs(1)).unwrap();
        assert_eq!(sensor.url(), "http://localhost:9/health");
    }

    #[test]
    fn wired_links_score_highest() {
        assert!(LinkType::Ethernet.score() > LinkType::Wifi.score());
        assert!(LinkType::Wifi.score() > LinkType::Cellular.score());
    }
}
