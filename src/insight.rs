//! Plain-language assessment of a finished run, produced by a hosted
//! language model.

use crate::settings::InsightSettings;
use crate::speedtest::{MetricsSnapshot, TestState};
use anyhow::{Context, Result};
use reqwest::Client;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::{debug, error, warn};

pub const MISSING_KEY: &str = "API Key configuration error. Unable to fetch insights.";
pub const NO_INSIGHTS: &str = "No insights available.";
pub const UNAVAILABLE: &str = "Unable to analyze network at this time. Please try again later.";

const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Serialize)]
struct GenerateRequest<'a> {
    contents: [Content<'a>; 1],
}

#[derive(Serialize)]
struct Content<'a> {
    parts: [Part<'a>; 1],
}

#[derive(Serialize)]
struct Part<'a> {
    text: &'a str,
}

#[derive(Deserialize, Default)]
#[serde(default)]
struct GenerateResponse {
    candidates: Vec<Candidate>,
}

#[derive(Deserialize, Default)]
#[serde(default)]
struct Candidate {
    content: CandidateContent,
}

#[derive(Deserialize, Default)]
#[serde(default)]
struct CandidateContent {
    parts: Vec<CandidatePart>,
}

#[derive(Deserialize, Default)]
#[serde(default)]
struct CandidatePart {
    text: String,
}

/// Returns `None` unless the run completed. Every failure is folded into a
/// human-readable sentinel.
pub async fn generate(
    settings: &InsightSettings,
    state: TestState,
    metrics: &MetricsSnapshot,
) -> Option<String> {
    if state != TestState::Complete {
        return None;
    }
    let Some(api_key) = settings.api_key.as_deref() else {
        error!("no API key configured, insights unavailable");
        return Some(MISSING_KEY.to_string());
    };

    match request(settings, api_key, metrics).await {
        Ok(text) if text.trim().is_empty() => Some(NO_INSIGHTS.to_string()),
        Ok(text) => Some(text.trim().to_string()),
        Err(e) => {
            warn!("insight request failed: {e:#}");
            Some(UNAVAILABLE.to_string())
        }
    }
}

async fn request(settings: &InsightSettings, api_key: &str, metrics: &MetricsSnapshot) -> Result<String> {
    let url = format!(
        "{}/v1beta/models/{}:generateContent",
        settings.base_url.trim_end_matches('/'),
        settings.model
    );
    let prompt = prompt(metrics);
    let body = GenerateRequest {
        contents: [Content {
            parts: [Part { text: &prompt }],
        }],
    };

    let client = Client::builder()
        .timeout(REQUEST_TIMEOUT)
        .build()
        .context("failed to create insight client")?;
    debug!(
        model = %settings.model,
        metrics = %serde_json::to_string(metrics).unwrap_or_default(),
        "requesting insight"
    );
    let response: GenerateResponse = client
        .post(&url)
        .header("x-goog-api-key", api_key)
        .json(&body)
        .send()
        .await
        .context("insight request failed")?
        .error_for_status()?
        .json()
        .await
        .context("malformed insight response")?;

    Ok(response
        .candidates
        .into_iter()
        .next()
        .and_then(|candidate| candidate.content.parts.into_iter().next())
        .map(|part| part.text)
        .unwrap_or_default())
}

fn prompt(metrics: &MetricsSnapshot) -> String {
    format!(
        "Analyze these internet connection metrics:\n\
         - Download Speed: {} Mbps\n\
         - Upload Speed: {} Mbps\n\
         - Ping/Latency: {} ms\n\
         - Jitter: {} ms\n\n\
         Provide a concise, helpful summary (max 3 sentences) covering:\n\
         1. What this connection is good for (e.g., 4K streaming, gaming, large file transfers).\n\
         2. Any potential bottlenecks.\n\
         3. A rating (e.g., Excellent, Good, Fair, Poor).\n\n\
         Keep the tone professional yet friendly. Do not use markdown headers, just plain text or bullet points.",
        metrics.download_speed_mbps, metrics.upload_speed_mbps, metrics.ping_ms, metrics.jitter_ms
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{body_string_contains, header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn metrics() -> MetricsSnapshot {
        MetricsSnapshot {
            download_speed_mbps: 87.5,
            upload_speed_mbps: 23.0,
            ping_ms: 18,
            jitter_ms: 3,
            progress_percent: 100.0,
        }
    }

    fn settings(base_url: String, api_key: Option<&str>) -> InsightSettings {
        InsightSettings {
            api_key: api_key.map(str::to_string),
            model: "test-model".to_string(),
            base_url,
        }
    }

    #[test]
    fn prompt_carries_all_four_metrics() {
        let text = prompt(&metrics());
        assert!(text.contains("Download Speed: 87.5 Mbps"));
        assert!(text.contains("Upload Speed: 23 Mbps"));
        assert!(text.contains("Ping/Latency: 18 ms"));
        assert!(text.contains("Jitter: 3 ms"));
    }

    #[tokio::test]
    async fn incomplete_runs_have_no_insight() {
        let settings = settings("http://127.0.0.1:1".into(), Some("key"));
        for state in [TestState::Idle, TestState::Download, TestState::Error] {
            assert_eq!(generate(&settings, state, &metrics()).await, None);
        }
    }

    #[tokio::test]
    async fn missing_key_is_reported() {
        let settings = settings("http://127.0.0.1:1".into(), None);
        let text = generate(&settings, TestState::Complete, &metrics()).await;
        assert_eq!(text.as_deref(), Some(MISSING_KEY));
    }

    #[tokio::test]
    async fn returns_first_candidate_text() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v1beta/models/test-model:generateContent"))
            .and(header("x-goog-api-key", "secret"))
            .and(body_string_contains("Download Speed: 87.5 Mbps"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "candidates": [
                    { "content": { "parts": [{ "text": "Good for 4K streaming. Rating: Good." }] } },
                    { "content": { "parts": [{ "text": "ignored" }] } }
                ]
            })))
            .expect(1)
            .mount(&server)
            .await;

        let text = generate(&settings(server.uri(), Some("secret")), TestState::Complete, &metrics()).await;
        assert_eq!(text.as_deref(), Some("Good for 4K streaming. Rating: Good."));
    }

    #[tokio::test]
    async fn empty_answer_has_its_own_message() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({ "candidates": [] })))
            .mount(&server)
            .await;

        let text = generate(&settings(server.uri(), Some("k")), TestState::Complete, &metrics()).await;
        assert_eq!(text.as_deref(), Some(NO_INSIGHTS));
    }

    #[tokio::test]
    async fn service_failure_is_folded_into_a_message() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(500))
            .mount(&server)
            .await;

        let text = generate(&settings(server.uri(), Some("k")), TestState::Complete, &metrics()).await;
        assert_eq!(text.as_deref(), Some(UNAVAILABLE));
    }
}
