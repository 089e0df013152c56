//! Best-effort lookup of the client's public IP, ISP and location.

use anyhow::{anyhow, Result};
use reqwest::Client;
use serde::Deserialize;
use std::time::Duration;
use tracing::{debug, warn};

pub const UNABLE_TO_DETECT: &str = "Unable to detect";
const UNKNOWN_ISP: &str = "Unknown ISP";
const LOOKUP_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientInfo {
    pub ip: String,
    pub isp: String,
    pub location: String,
}

impl ClientInfo {
    pub fn undetected() -> Self {
        Self {
            ip: UNABLE_TO_DETECT.to_string(),
            isp: "Unknown".to_string(),
            location: UNABLE_TO_DETECT.to_string(),
        }
    }
}

/// Lookup services, tried in order.
#[derive(Debug, Clone)]
pub struct LookupEndpoints {
    pub primary: String,
    pub secondary: String,
    pub trace: String,
}

impl Default for LookupEndpoints {
    fn default() -> Self {
        Self {
            primary: "https://wtfismyip.com/json".to_string(),
            secondary: "https://ipapi.co/json/".to_string(),
            trace: "https://cloudflare.com/cdn-cgi/trace".to_string(),
        }
    }
}

#[derive(Debug, Deserialize)]
struct PrimaryResponse {
    #[serde(rename = "YourFuckingIPAddress")]
    address: Option<String>,
    ip: Option<String>,
    #[serde(rename = "YourFuckingISP")]
    isp: Option<String>,
    #[serde(rename = "YourFuckingLocation")]
    location: Option<String>,
}

#[derive(Debug, Deserialize)]
struct GeoResponse {
    ip: Option<String>,
    org: Option<String>,
    asn: Option<String>,
    city: Option<String>,
    country_code: Option<String>,
}

/// Walks the lookup cascade. Never fails; the last resort is
/// [`ClientInfo::undetected`].
pub async fn lookup(endpoints: &LookupEndpoints) -> ClientInfo {
    let client = match Client::builder().timeout(LOOKUP_TIMEOUT).build() {
        Ok(client) => client,
        Err(e) => {
            warn!(error = %e, "failed to create lookup client");
            return ClientInfo::undetected();
        }
    };

    match primary(&client, &endpoints.primary).await {
        Ok(info) => return info,
        Err(e) => warn!(error = %e, "primary client lookup failed, trying fallback"),
    }
    match secondary(&client, &endpoints.secondary).await {
        Ok(info) => return info,
        Err(e) => warn!(error = %e, "geolocation lookup failed, trying trace"),
    }
    match trace(&client, &endpoints.trace).await {
        Ok(info) => info,
        Err(e) => {
            warn!(error = %e, "all client lookups failed");
            ClientInfo::undetected()
        }
    }
}

async fn primary(client: &Client, url: &str) -> Result<ClientInfo> {
    let body: PrimaryResponse = client.get(url).send().await?.error_for_status()?.json().await?;
    let ip = body
        .address
        .or(body.ip)
        .ok_or_else(|| anyhow!("response carries no address"))?;
    debug!(%ip, "client info from primary lookup");
    Ok(ClientInfo {
        ip,
        isp: body.isp.unwrap_or_else(|| UNKNOWN_ISP.to_string()),
        location: body.location.unwrap_or_else(|| "Unknown".to_string()),
    })
}

async fn secondary(client: &Client, url: &str) -> Result<ClientInfo> {
    let body: GeoResponse = client.get(url).send().await?.error_for_status()?.json().await?;
    let ip = body.ip.ok_or_else(|| anyhow!("response carries no address"))?;
    let location = match (body.city, body.country_code) {
        (Some(city), Some(country)) => format!("{city}, {country}"),
        (Some(place), None) | (None, Some(place)) => place,
        (None, None) => "Unknown".to_string(),
    };
    Ok(ClientInfo {
        ip,
        isp: body.org.or(body.asn).unwrap_or_else(|| UNKNOWN_ISP.to_string()),
        location,
    })
}

async fn trace(client: &Client, url: &str) -> Result<ClientInfo> {
    let text = client.get(url).send().await?.error_for_status()?.text().await?;
    Ok(parse_trace(&text))
}

/// Reads the `ip=` and `loc=` lines of a `key=value` trace document.
fn parse_trace(text: &str) -> ClientInfo {
    let field = |key: &str| {
        text.lines()
            .find_map(|line| line.strip_prefix(key))
            .map(|value| value.trim().to_string())
            .unwrap_or_else(|| "Unknown".to_string())
    };
    ClientInfo {
        ip: field("ip="),
        isp: UNKNOWN_ISP.to_string(),
        location: field("loc="),
    }
}
