use crate::speedtest::ProbeError;
use clap::Parser;
use reqwest::Url;
use std::path::PathBuf;

pub const DEFAULT_PING_URL: &str = "https://cloudflare.com/cdn-cgi/trace";
pub const DEFAULT_DOWNLOAD_URL: &str = "https://speed.cloudflare.com/__down";
pub const DEFAULT_UPLOAD_URL: &str = "https://httpbin.org/post";
pub const DEFAULT_INSIGHT_URL: &str = "https://generativelanguage.googleapis.com";
pub const DEFAULT_INSIGHT_MODEL: &str = "gemini-3-flash-preview";

#[derive(Parser, Debug, Clone)]
#[command(name = "speedx", version, about = "Terminal internet speed test")]
pub struct Cli {
    /// Lightweight endpoint used for latency round-trips
    #[arg(long, env = "SPEEDX_PING_URL", default_value = DEFAULT_PING_URL)]
    pub ping_url: String,

    /// Bulk download endpoint, receives a `bytes=N` query parameter
    #[arg(long, env = "SPEEDX_DOWNLOAD_URL", default_value = DEFAULT_DOWNLOAD_URL)]
    pub download_url: String,

    /// Endpoint accepting the upload POST
    #[arg(long, env = "SPEEDX_UPLOAD_URL", default_value = DEFAULT_UPLOAD_URL)]
    pub upload_url: String,

    /// API key for connection insights
    #[arg(long, env = "API_KEY", hide_env_values = true)]
    pub api_key: Option<String>,

    #[arg(long, env = "SPEEDX_INSIGHT_MODEL", default_value = DEFAULT_INSIGHT_MODEL)]
    pub insight_model: String,

    #[arg(long, env = "SPEEDX_INSIGHT_URL", default_value = DEFAULT_INSIGHT_URL)]
    pub insight_url: String,

    /// Skip the IP / ISP / location lookup
    #[arg(long)]
    pub no_client_info: bool,

    /// Write debug logs to this file
    #[arg(long, value_name = "FILE")]
    pub debug: Option<PathBuf>,
}

#[derive(Debug, Clone)]
pub struct Settings {
    pub endpoints: Endpoints,
    pub insight: InsightSettings,
    pub client_info: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Endpoints {
    pub ping_url: String,
    pub download_url: String,
    pub upload_url: String,
}

#[derive(Debug, Clone)]
pub struct InsightSettings {
    pub api_key: Option<String>,
    pub model: String,
    pub base_url: String,
}

/// Endpoints after validation, ready to be requested.
#[derive(Debug, Clone)]
pub struct ResolvedEndpoints {
    pub ping: Url,
    pub download: Url,
    pub upload: Url,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            endpoints: Endpoints::default(),
            insight: InsightSettings {
                api_key: None,
                model: DEFAULT_INSIGHT_MODEL.to_string(),
                base_url: DEFAULT_INSIGHT_URL.to_string(),
            },
            client_info: true,
        }
    }
}

impl Default for Endpoints {
    fn default() -> Self {
        Self {
            ping_url: DEFAULT_PING_URL.to_string(),
            download_url: DEFAULT_DOWNLOAD_URL.to_string(),
            upload_url: DEFAULT_UPLOAD_URL.to_string(),
        }
    }
}

impl From<Cli> for Settings {
    fn from(cli: Cli) -> Self {
        Self {
            endpoints: Endpoints {
                ping_url: cli.ping_url,
                download_url: cli.download_url,
                upload_url: cli.upload_url,
            },
            insight: InsightSettings {
                api_key: cli.api_key.filter(|key| !key.trim().is_empty()),
                model: cli.insight_model,
                base_url: cli.insight_url,
            },
            client_info: !cli.no_client_info,
        }
    }
}

impl Endpoints {
    /// Uniform endpoints rooted at one base URL, as served by a local test server.
    #[cfg(test)]
    pub fn with_base(base: &str) -> Self {
        let base = base.trim_end_matches('/');
        Self {
            ping_url: format!("{base}/cdn-cgi/trace"),
            download_url: format!("{base}/__down"),
            upload_url: format!("{base}/__up"),
        }
    }

    pub fn resolve(&self) -> Result<ResolvedEndpoints, ProbeError> {
        Ok(ResolvedEndpoints {
            ping: parse_endpoint(&self.ping_url)?,
            download: parse_endpoint(&self.download_url)?,
            upload: parse_endpoint(&self.upload_url)?,
        })
    }
}

fn parse_endpoint(url: &str) -> Result<Url, ProbeError> {
    let parsed = Url::parse(url).map_err(|e| ProbeError::InvalidEndpoint {
        url: url.to_string(),
        reason: e.to_string(),
    })?;
    match parsed.scheme() {
        "http" | "https" => Ok(parsed),
        scheme => Err(ProbeError::InvalidEndpoint {
            url: url.to_string(),
            reason: format!("unsupported scheme `{scheme}`"),
        }),
    }
}
