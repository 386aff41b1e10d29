//! Minimum relay fee-rate estimation
//!
//! Payjoin construction needs the relay floor for the heavier transaction. The
//! rate is queried from an external API (mempool.space by default) and falls
//! back to a configured static floor when the API is unreachable, so a fee
//! lookup failure can never block a payment.

use bitcoin::FeeRate;
use tracing::{debug, info, warn};

/// Fee oracle combining a remote estimator with a static floor
#[derive(Debug, Clone)]
pub struct FeeOracle {
    /// Base URL for the fee API; `None` disables remote lookup
    api_url: Option<String>,
    /// Static floor in sat/vbyte, also the fallback rate
    floor_sat_per_vb: u64,
}

impl FeeOracle {
    /// Oracle with the default mempool.space API and the given floor
    pub fn new(floor_sat_per_vb: u64) -> Self {
        Self {
            api_url: Some("https://mempool.space/api/v1/fees/recommended".to_string()),
            floor_sat_per_vb: floor_sat_per_vb.max(1),
        }
    }

    /// Oracle with a custom API URL
    pub fn with_url(api_url: Option<String>, floor_sat_per_vb: u64) -> Self {
        Self {
            api_url,
            floor_sat_per_vb: floor_sat_per_vb.max(1),
        }
    }

    /// Oracle that never leaves the static floor
    pub fn static_floor(floor_sat_per_vb: u64) -> Self {
        Self::with_url(None, floor_sat_per_vb)
    }

    /// Current minimum relay fee rate. Never fails: API errors fall back to
    /// the static floor.
    pub async fn min_relay_rate(&self) -> FeeRate {
        let rate = match &self.api_url {
            Some(url) => match self.fetch_minimum(url).await {
                Ok(remote) => remote.max(self.floor_sat_per_vb),
                Err(e) => {
                    warn!("fee API unavailable, using static floor: {}", e);
                    self.floor_sat_per_vb
                }
            },
            None => self.floor_sat_per_vb,
        };
        debug!("minimum relay fee rate: {} sat/vbyte", rate);
        FeeRate::from_sat_per_vb(rate).unwrap_or(FeeRate::BROADCAST_MIN)
    }

    async fn fetch_minimum(&self, url: &str) -> anyhow::Result<u64> {
        info!("fetching relay fee floor from {}...", url);

        let client = reqwest::Client::new();
        let response = client
            .get(url)
            .timeout(std::time::Duration::from_secs(10))
            .send()
            .await
            .map_err(|e| anyhow::anyhow!("failed to fetch fee rate: {}", e))?;

        if !response.status().is_success() {
            let status = response.status();
            let text = response.text().await.unwrap_or_default();
            return Err(anyhow::anyhow!("fee API returned error: {} - {}", status, text));
        }

        let fees: FeeResponse = response
            .json()
            .await
            .map_err(|e| anyhow::anyhow!("failed to parse fee response: {}", e))?;

        Ok(fees.minimum_fee.max(1))
    }
}

/// Response from the mempool.space recommended-fees API
#[derive(Debug, Clone, serde::Deserialize)]
struct FeeResponse {
    /// Minimum relay fee (~24 hours)
    #[serde(rename = "minimumFee")]
    minimum_fee: u64,
}
