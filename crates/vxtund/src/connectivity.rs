//! Connectivity test through a tunnel's SOCKS5 listener

use std::net::{Ipv4Addr, SocketAddrV4};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::debug;
use vxtun_common::{TunnelError, TunnelResult};

/// Outcome of one request through a proxy
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProbeResult {
    /// Address the echo endpoint saw the request coming from
    pub egress: String,
    pub round_trip: Duration,
}

/// Sends a request through a SOCKS5 proxy and reports the observed egress address
#[async_trait]
pub trait ConnectivityProbe: Send + Sync {
    async fn fetch_egress(&self, proxy: SocketAddrV4) -> TunnelResult<ProbeResult>;
}

/// Result of a connectivity test as reported to the operator
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnectivityReport {
    pub tunnel_id: String,
    pub success: bool,
    pub proxy: SocketAddrV4,
    pub expected_egress: Ipv4Addr,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub observed_egress: Option<String>,
    /// True when the observed egress is the relay address
    pub matches_relay: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub round_trip_ms: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl ConnectivityReport {
    pub fn from_probe(
        tunnel_id: &str,
        proxy: SocketAddrV4,
        expected_egress: Ipv4Addr,
        outcome: TunnelResult<ProbeResult>,
    ) -> Self {
        match outcome {
            Ok(probe) => {
                let matches_relay = probe.egress.parse::<Ipv4Addr>().ok() == Some(expected_egress);
                Self {
                    tunnel_id: tunnel_id.to_string(),
                    success: true,
                    proxy,
                    expected_egress,
                    observed_egress: Some(probe.egress),
                    matches_relay,
                    round_trip_ms: Some(probe.round_trip.as_millis() as u64),
                    error: None,
                }
            }
            Err(e) => Self {
                tunnel_id: tunnel_id.to_string(),
                success: false,
                proxy,
                expected_egress,
                observed_egress: None,
                matches_relay: false,
                round_trip_ms: None,
                error: Some(e.to_string()),
            },
        }
    }
}

/// Pull the caller address out of an echo endpoint response
///
/// Accepts `{"origin": "..."}` (httpbin), `{"ip": "..."}`, or a bare address.
/// A comma separated forwarding chain yields its first entry.
pub fn parse_egress(body: &str) -> Option<String> {
    #[derive(Deserialize)]
    struct Echo {
        origin: Option<String>,
        ip: Option<String>,
    }

    let raw = match serde_json::from_str::<Echo>(body) {
        Ok(echo) => echo.origin.or(echo.ip)?,
        Err(_) => body.trim().to_string(),
    };
    let first = raw.split(',').next()?.trim();
    if first.is_empty() {
        None
    } else {
        Some(first.to_string())
    }
}

/// [`ConnectivityProbe`] issuing an HTTP GET through `socks5h://`
pub struct HttpConnectivityProbe {
    endpoint: String,
    timeout: Duration,
}

impl HttpConnectivityProbe {
    pub fn new(endpoint: impl Into<String>, timeout: Duration) -> Self {
        Self {
            endpoint: endpoint.into(),
            timeout,
        }
    }
}

#[async_trait]
impl ConnectivityProbe for HttpConnectivityProbe {
    async fn fetch_egress(&self, proxy: SocketAddrV4) -> TunnelResult<ProbeResult> {
        let target = proxy.to_string();
        let failure = |e: reqwest::Error| TunnelError::connectivity(&target, e.to_string());

        let client = reqwest::Client::builder()
            .proxy(reqwest::Proxy::all(format!("socks5h://{}", proxy)).map_err(failure)?)
            .timeout(self.timeout)
            .build()
            .map_err(failure)?;

        let started = Instant::now();
        let response = client.get(&self.endpoint).send().await.map_err(failure)?;
        if !response.status().is_success() {
            return Err(TunnelError::connectivity(
                &target,
                format!("{} returned status {}", self.endpoint, response.status()),
            ));
        }
        let body = response.text().await.map_err(failure)?;
        let round_trip = started.elapsed();
        debug!(proxy = %target, elapsed_ms = round_trip.as_millis() as u64, "Connectivity probe answered");

        let egress = parse_egress(&body).ok_or_else(|| {
            TunnelError::connectivity(&target, format!("no address in response '{}'", body.trim()))
        })?;
        Ok(ProbeResult { egress, round_trip })
    }
}
