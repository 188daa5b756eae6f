use crate::http::build_client;
use crate::models::{Merchant, NewVehicleRecord};
use reqwest::Client;
use serde_json::{Value, json};
use thiserror::Error;
use urlencoding::encode;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("request failed: {0}")]
    Request(String),
    #[error("invalid response: {0}")]
    Deserialize(String),
    #[error("no merchant mapped to channel")]
    NoTenant,
    #[error("vehicle record already exists")]
    Duplicate,
}

/// REST client for the document store. Constructed once at startup;
/// `from_env` returning `None` means the store is unconfigured and every
/// dependent operation must fail with a typed error rather than degrade.
#[derive(Debug, Clone)]
pub struct FirestoreClient {
    base_url: String,
    project_id: String,
    bearer_token: String,
    http: Client,
}

impl FirestoreClient {
    pub fn from_env() -> Option<Self> {
        let project_id = std::env::var("FIRESTORE_PROJECT_ID").ok()?;
        let bearer_token = std::env::var("FIRESTORE_BEARER_TOKEN")
            .or_else(|_| std::env::var("FIRESTORE_ACCESS_TOKEN"))
            .ok()?;
        let base_url = std::env::var("FIRESTORE_BASE_URL")
            .unwrap_or_else(|_| "https://firestore.googleapis.com/v1".to_string());
        Some(Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            project_id,
            bearer_token,
            http: build_client(),
        })
    }

    fn database_root(&self) -> String {
        format!("projects/{}/databases/(default)", self.project_id)
    }

    async fn get_document(&self, path: &str) -> Result<Option<Value>, StoreError> {
        let url = format!("{}/{}/documents/{}", self.base_url, self.database_root(), path);
        let response = self
            .http
            .get(url)
            .bearer_auth(&self.bearer_token)
            .send()
            .await
            .map_err(|err| StoreError::Request(err.to_string()))?;

        if response.status() == reqwest::StatusCode::NOT_FOUND {
            return Ok(None);
        }
        if !response.status().is_success() {
            return Err(StoreError::Request(format!("HTTP {}", response.status())));
        }

        response
            .json()
            .await
            .map(Some)
            .map_err(|err| StoreError::Deserialize(err.to_string()))
    }

    /// Keyed channel→merchant lookup: `channelMappings/{channel_id}` names
    /// the merchant, which must itself exist. Any gap in the chain fails
    /// closed with `NoTenant`; never guess across tenants.
    pub async fn resolve_merchant(&self, channel_id: &str) -> Result<Merchant, StoreError> {
        if channel_id.is_empty() {
            return Err(StoreError::NoTenant);
        }

        let mapping = self
            .get_document(&format!("channelMappings/{}", encode(channel_id)))
            .await?
            .ok_or(StoreError::NoTenant)?;
        let merchant_id =
            string_field(&mapping, "merchantId").ok_or(StoreError::NoTenant)?;

        let merchant = self
            .get_document(&format!("merchants/{}", encode(&merchant_id)))
            .await?
            .ok_or(StoreError::NoTenant)?;
        let owner_id = string_field(&merchant, "ownerId").unwrap_or_default();

        Ok(Merchant {
            id: merchant_id,
            owner_id,
        })
    }

    /// Single conditional create: `currentDocument.exists = false` plus a
    /// `REQUEST_TIME` transform for `createdAt`. A replayed delivery of the
    /// same message hits the precondition and surfaces as `Duplicate`.
    pub async fn create_vehicle(
        &self,
        merchant: &Merchant,
        record: &NewVehicleRecord,
        record_id: &str,
    ) -> Result<String, StoreError> {
        let name = format!(
            "{}/documents/merchants/{}/vehicles/{}",
            self.database_root(),
            merchant.id,
            record_id
        );
        let body = json!({
            "writes": [{
                "update": {
                    "name": name,
                    "fields": record_fields(record),
                },
                "updateTransforms": [{
                    "fieldPath": "createdAt",
                    "setToServerValue": "REQUEST_TIME",
                }],
                "currentDocument": { "exists": false },
            }]
        });

        let url = format!(
            "{}/{}/documents:commit",
            self.base_url,
            self.database_root()
        );
        let response = self
            .http
            .post(url)
            .bearer_auth(&self.bearer_token)
            .json(&body)
            .send()
            .await
            .map_err(|err| StoreError::Request(err.to_string()))?;

        match response.status() {
            status if status.is_success() => Ok(record_id.to_string()),
            reqwest::StatusCode::CONFLICT => Err(StoreError::Duplicate),
            status => Err(StoreError::Request(format!("HTTP {status}"))),
        }
    }
}

/// Deterministic vehicle document id for one LINE message. Combined with the
/// create precondition this makes ingestion at-most-once per (tenant,
/// message).
pub fn vehicle_record_id(message_id: &str) -> String {
    format!("line-{message_id}")
}

fn string_field(document: &Value, field: &str) -> Option<String> {
    document
        .get("fields")?
        .get(field)?
        .get("stringValue")?
        .as_str()
        .map(|value| value.to_string())
}

fn record_fields(record: &NewVehicleRecord) -> Value {
    let mut fields = json!({
        "merchantId": { "stringValue": record.merchant_id },
        "merchantOwnerId": { "stringValue": record.merchant_owner_id },
        "lineUserId": { "stringValue": record.line_user_id },
        "inspectionDate": { "stringValue": record.inspection_date },
        "status": { "stringValue": record.status.as_str() },
        "plateNumber": { "stringValue": record.plate_number },
        "modelName": { "stringValue": record.model_name },
        "source": { "stringValue": record.source },
    });
    if let Some(confidence) = record.confidence {
        fields["confidence"] = json!({ "doubleValue": confidence });
    }
    fields
}
