//! HTTP liveness probes of web services

use std::time::{Duration, Instant};

use async_trait::async_trait;
use reqwest::StatusCode;
use tracing::debug;

use crate::errors::DeployerError;
use crate::models::service::ProbeResult;

#[async_trait]
pub trait HealthProber: Send + Sync {
    /// Probe a service listening on the loopback interface. Never fails:
    /// an unreachable service is an unhealthy result.
    async fn probe(&self, port: u16, endpoint: &str) -> ProbeResult;
}

pub fn probe_url(port: u16, endpoint: &str) -> String {
    if endpoint.starts_with('/') {
        format!("http://127.0.0.1:{}{}", port, endpoint)
    } else {
        format!("http://127.0.0.1:{}/{}", port, endpoint)
    }
}

/// [`HealthProber`] issuing one GET per probe
#[derive(Debug, Clone)]
pub struct HttpProber {
    client: reqwest::Client,
}

impl HttpProber {
    pub fn new(timeout: Duration) -> Result<Self, DeployerError> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .redirect(reqwest::redirect::Policy::none())
            .build()?;
        Ok(Self { client })
    }
}

#[async_trait]
impl HealthProber for HttpProber {
    async fn probe(&self, port: u16, endpoint: &str) -> ProbeResult {
        let url = probe_url(port, endpoint);
        let started = Instant::now();
        let response = self.client.get(&url).send().await;
        let elapsed = started.elapsed().as_secs_f64();

        match response {
            Ok(response) if response.status() == StatusCode::OK => ProbeResult {
                is_healthy: true,
                response_time: Some(elapsed),
                error_message: None,
            },
            Ok(response) => ProbeResult {
                is_healthy: false,
                response_time: Some(elapsed),
                error_message: Some(format!("Status code: {}", response.status().as_u16())),
            },
            Err(e) => {
                debug!("Probe of {} failed: {}", url, e);
                ProbeResult {
                    is_healthy: false,
                    response_time: None,
                    error_message: Some(e.to_string()),
                }
            }
        }
    }
}
