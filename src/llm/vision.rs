use crate::http::build_client;
use crate::models::{EncodedImage, ExtractionResult};
use chrono::NaiveDate;
use eyre::Result;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use thiserror::Error;

const SYSTEM_PROMPT: &str = r#"
You are an expert at reading Japanese vehicle inspection documents. Extract the
"有効期間の満了する日" (inspection expiration date) from the provided image. The image is
either a 車検証 (inspection certificate) or a 車検ステッカー (windshield sticker). On a
certificate, read the field labeled 有効期間の満了する日; on a sticker, read the large
year/month digits. Convert Japanese imperial-calendar dates (e.g. Reiwa 6) to the
Gregorian calendar. Respond with JSON only: {"inspectionDate": "YYYY-MM-DD" or "" when
no date is legible, "isCertificate": bool, "extractedText": string, "confidence": 0..1}.
"#;

#[derive(Debug, Clone)]
pub struct VisionConfig {
    pub gateway_url: String,
    pub api_key: Option<String>,
    pub function_name: Option<String>,
    pub model: Option<String>,
}

impl VisionConfig {
    pub fn from_env() -> Self {
        Self {
            gateway_url: std::env::var("VISION_GATEWAY_URL")
                .unwrap_or_else(|_| "http://localhost:3000".into()),
            api_key: std::env::var("VISION_API_KEY").ok(),
            function_name: std::env::var("VISION_FUNCTION").ok(),
            model: std::env::var("VISION_MODEL").ok(),
        }
    }
}

#[derive(Debug, Error)]
pub enum ExtractionError {
    #[error("missing gateway url")]
    MissingGateway,
    #[error("http error: {0}")]
    Http(String),
    #[error("invalid response: {0}")]
    InvalidResponse(String),
}

pub struct VisionClient {
    http: Client,
    config: VisionConfig,
}

impl VisionClient {
    pub fn new(config: VisionConfig) -> Self {
        Self {
            http: build_client(),
            config,
        }
    }

    /// Sends the encoded image to the vision gateway and validates the shape
    /// of the result before handing it to the pipeline.
    pub async fn extract(
        &self,
        image: &EncodedImage,
    ) -> Result<ExtractionResult, ExtractionError> {
        let gateway = self.config.gateway_url.trim();
        if gateway.is_empty() {
            return Err(ExtractionError::MissingGateway);
        }

        let function_name = self
            .config
            .function_name
            .as_deref()
            .unwrap_or("inspection_date_extraction");
        let model_name = self.config.model.as_deref();

        let body = InferenceRequest {
            function_name: function_name.to_string(),
            model_name: model_name.map(|value| value.to_string()),
            input: InferenceInput {
                messages: vec![
                    InferenceMessage {
                        role: "system".into(),
                        content: SYSTEM_PROMPT.trim().into(),
                    },
                    InferenceMessage {
                        role: "user".into(),
                        content: image.as_data_uri(),
                    },
                ],
            },
        };

        let mut request = self.http.post(format!("{gateway}/inference")).json(&body);

        if let Some(key) = &self.config.api_key {
            request = request.header("X-API-Key", key);
        }

        let response = request
            .send()
            .await
            .map_err(|err| ExtractionError::Http(err.to_string()))?;

        if !response.status().is_success() {
            return Err(ExtractionError::Http(format!("HTTP {}", response.status())));
        }

        let payload: InferenceResponse = response
            .json()
            .await
            .map_err(|err| ExtractionError::InvalidResponse(err.to_string()))?;

        let text = payload
            .content
            .into_iter()
            .find(|item| item.r#type == "text")
            .map(|item| item.text)
            .ok_or_else(|| ExtractionError::InvalidResponse("missing text".into()))?;

        let cleaned = strip_markdown_fence(&text);
        let result: ExtractionResult = serde_json::from_str(&cleaned)
            .map_err(|err| ExtractionError::InvalidResponse(err.to_string()))?;
        validate(&result).map_err(ExtractionError::InvalidResponse)?;
        Ok(result)
    }
}

/// Rejects structurally invalid gateway output instead of coercing it: a
/// non-empty date must parse as `%Y-%m-%d`, confidence must lie in [0, 1].
fn validate(result: &ExtractionResult) -> Result<(), String> {
    if !result.inspection_date.is_empty()
        && NaiveDate::parse_from_str(&result.inspection_date, "%Y-%m-%d").is_err()
    {
        return Err(format!(
            "inspectionDate is not YYYY-MM-DD: {}",
            result.inspection_date
        ));
    }
    if let Some(confidence) = result.confidence
        && !(0.0..=1.0).contains(&confidence)
    {
        return Err(format!("confidence out of range: {confidence}"));
    }
    Ok(())
}

fn strip_markdown_fence(input: &str) -> String {
    let trimmed = input.trim();
    if !trimmed.starts_with("```") {
        return trimmed.to_string();
    }
    let mut body = Vec::new();
    for line in trimmed.lines().skip(1) {
        if line.trim_start().starts_with("```") {
            break;
        }
        body.push(line);
    }
    body.join("\n")
}

#[derive(Debug, Serialize)]
struct InferenceRequest {
    function_name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    model_name: Option<String>,
    input: InferenceInput,
}

#[derive(Debug, Serialize)]
struct InferenceInput {
    messages: Vec<InferenceMessage>,
}

#[derive(Debug, Clone, Serialize)]
struct InferenceMessage {
    role: String,
    content: String,
}

#[derive(Debug, Deserialize)]
struct InferenceResponse {
    content: Vec<ResponseContent>,
}

#[derive(Debug, Deserialize)]
struct ResponseContent {
    r#type: String,
    text: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn result(date: &str, confidence: Option<f64>) -> ExtractionResult {
        ExtractionResult {
            inspection_date: date.to_string(),
            is_certificate: true,
            extracted_text: None,
            confidence,
        }
    }

    #[test]
    fn empty_date_is_valid() {
        assert!(validate(&result("", None)).is_ok());
    }

    #[test]
    fn iso_date_is_valid() {
        assert!(validate(&result("2026-05-12", Some(0.93))).is_ok());
    }

    #[test]
    fn malformed_date_is_rejected() {
        assert!(validate(&result("2026/05/12", None)).is_err());
        assert!(validate(&result("May 12, 2026", None)).is_err());
        assert!(validate(&result("2026-13-40", None)).is_err());
    }

    #[test]
    fn confidence_bounds_are_enforced() {
        assert!(validate(&result("2026-05-12", Some(0.0))).is_ok());
        assert!(validate(&result("2026-05-12", Some(1.0))).is_ok());
        assert!(validate(&result("2026-05-12", Some(1.2))).is_err());
        assert!(validate(&result("2026-05-12", Some(-0.1))).is_err());
    }

    #[test]
    fn fenced_json_is_unwrapped() {
        let fenced = "```json\n{\"inspectionDate\":\"\"}\n```";
        assert_eq!(strip_markdown_fence(fenced), "{\"inspectionDate\":\"\"}");
        assert_eq!(strip_markdown_fence("{\"a\":1}"), "{\"a\":1}");
    }
}
