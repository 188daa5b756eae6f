use crate::config::{API_DATA_ROOT, CHANNEL_ACCESS_TOKEN};
use crate::http::build_client;
use crate::models::EncodedImage;
use base64::{Engine, engine::general_purpose::STANDARD as BASE64};
use reqwest::Client;
use thiserror::Error;
use urlencoding::encode;

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("missing line channel access token in env")]
    MissingCredentials,
    #[error("content request failed: {0}")]
    Request(String),
    #[error("content request returned HTTP {0}")]
    Status(reqwest::StatusCode),
}

/// Client for the LINE content API. One attempt per message; retry policy,
/// if any, belongs to the dispatcher.
#[derive(Clone)]
pub struct LineClient {
    http: Client,
}

impl LineClient {
    pub fn new() -> Self {
        Self {
            http: build_client(),
        }
    }

    pub async fn fetch_message_content(
        &self,
        message_id: &str,
    ) -> Result<EncodedImage, FetchError> {
        if CHANNEL_ACCESS_TOKEN.is_empty() {
            return Err(FetchError::MissingCredentials);
        }

        let url = format!(
            "{}/v2/bot/message/{}/content",
            API_DATA_ROOT.as_str(),
            encode(message_id)
        );
        let response = self
            .http
            .get(url)
            .bearer_auth(CHANNEL_ACCESS_TOKEN.as_str())
            .send()
            .await
            .map_err(|err| FetchError::Request(err.to_string()))?;

        if !response.status().is_success() {
            return Err(FetchError::Status(response.status()));
        }

        let mime_type = response
            .headers()
            .get(reqwest::header::CONTENT_TYPE)
            .and_then(|value| value.to_str().ok())
            .unwrap_or("image/jpeg")
            .to_string();
        let bytes = response
            .bytes()
            .await
            .map_err(|err| FetchError::Request(err.to_string()))?;

        Ok(EncodedImage {
            mime_type,
            base64: BASE64.encode(&bytes),
        })
    }
}
