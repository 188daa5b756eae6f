use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_with::skip_serializing_none;

/// One LINE webhook delivery. `destination` is the bot channel user id and
/// is the tenant-routing key; an empty `events` array is a valid
/// verification ping.
#[derive(Debug, Clone, Deserialize)]
pub struct WebhookPayload {
    #[serde(default)]
    pub destination: String,
    #[serde(default)]
    pub events: Vec<InboundEvent>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct InboundEvent {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default)]
    pub message: Option<MessagePayload>,
    #[serde(default)]
    pub source: Option<EventSource>,
}

impl InboundEvent {
    pub fn is_image_message(&self) -> bool {
        self.kind == "message" && self.message.as_ref().is_some_and(|m| m.kind == "image")
    }

    pub fn message_id(&self) -> Option<&str> {
        self.message.as_ref().map(|m| m.id.as_str())
    }

    pub fn line_user_id(&self) -> String {
        self.source
            .as_ref()
            .and_then(|s| s.user_id.clone())
            .unwrap_or_default()
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct MessagePayload {
    pub id: String,
    #[serde(rename = "type")]
    pub kind: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct EventSource {
    #[serde(rename = "userId", default)]
    pub user_id: Option<String>,
}

/// Image bytes pulled from the LINE content API, held in memory between
/// fetch and extraction.
#[derive(Debug, Clone)]
pub struct EncodedImage {
    pub mime_type: String,
    pub base64: String,
}

impl EncodedImage {
    pub fn as_data_uri(&self) -> String {
        format!("data:{};base64,{}", self.mime_type, self.base64)
    }
}

/// Structured output of the vision gateway. An empty `inspection_date` is a
/// successful "no date identifiable" outcome, not an error.
#[skip_serializing_none]
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ExtractionResult {
    pub inspection_date: String,
    pub is_certificate: bool,
    #[serde(default)]
    pub extracted_text: Option<String>,
    #[serde(default)]
    pub confidence: Option<f64>,
}

impl ExtractionResult {
    pub fn has_date(&self) -> bool {
        !self.inspection_date.is_empty()
    }

    pub fn document_label(&self) -> &'static str {
        if self.is_certificate {
            "Inspection Certificate"
        } else {
            "Inspection Sticker"
        }
    }
}

#[derive(Debug, Clone)]
pub struct Merchant {
    pub id: String,
    pub owner_id: String,
}

#[derive(Debug, Clone, Copy, Serialize, PartialEq, Eq)]
pub enum VehicleStatus {
    Upcoming,
    #[allow(dead_code)]
    Healthy,
    #[allow(dead_code)]
    Critical,
}

impl VehicleStatus {
    /// Every ingested record starts here; later transitions belong to the
    /// dashboard, not this service.
    pub fn initial() -> Self {
        VehicleStatus::Upcoming
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            VehicleStatus::Upcoming => "Upcoming",
            VehicleStatus::Healthy => "Healthy",
            VehicleStatus::Critical => "Critical",
        }
    }
}

/// Fields of a vehicle document to be created under
/// `merchants/{merchantId}/vehicles`. `createdAt` is server-assigned at
/// write time and therefore absent here.
#[derive(Debug, Clone)]
pub struct NewVehicleRecord {
    pub merchant_id: String,
    pub merchant_owner_id: String,
    pub line_user_id: String,
    pub inspection_date: String,
    pub status: VehicleStatus,
    pub plate_number: String,
    pub model_name: String,
    pub source: &'static str,
    pub confidence: Option<f64>,
}

#[derive(Debug, Serialize)]
pub struct ApiError {
    pub error: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
}

/// Body returned to LINE for any accepted delivery, including no-op and
/// partially failed ones.
#[derive(Debug, Clone, Serialize)]
pub struct DeliveryAck {
    pub status: &'static str,
    pub received: usize,
    pub processed: usize,
}

#[derive(Debug, Clone)]
pub struct DeliveryReport {
    pub received: usize,
    pub processed: usize,
    pub reports: Vec<EventReport>,
}

#[derive(Debug, Clone, Serialize)]
pub struct EventReport {
    pub message_id: String,
    pub elapsed_ms: u128,
    pub timestamp: DateTime<Utc>,
    pub outcome: EventOutcome,
}

impl EventReport {
    pub fn new(message_id: impl Into<String>, elapsed_ms: u128, outcome: EventOutcome) -> Self {
        Self {
            message_id: message_id.into(),
            elapsed_ms,
            timestamp: Utc::now(),
            outcome,
        }
    }
}

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum EventOutcome {
    Persisted { record_id: String },
    NoDate,
    Duplicate,
    Failed { error: String },
}

impl EventOutcome {
    pub fn is_processed(&self) -> bool {
        !matches!(self, EventOutcome::Failed { .. })
    }

    pub fn label(&self) -> &'static str {
        match self {
            EventOutcome::Persisted { .. } => "persisted",
            EventOutcome::NoDate => "no_date",
            EventOutcome::Duplicate => "duplicate",
            EventOutcome::Failed { .. } => "failed",
        }
    }
}
