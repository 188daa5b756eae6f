use crate::firestore::{FirestoreClient, StoreError, vehicle_record_id};
use crate::idempotency;
use crate::line::{FetchError, LineClient};
use crate::llm::{ExtractionError, VisionClient, VisionConfig};
use crate::models::{
    DeliveryReport, EventOutcome, EventReport, InboundEvent, NewVehicleRecord, VehicleStatus,
    WebhookPayload,
};
use std::{sync::Arc, time::Instant};
use thiserror::Error;
use tracing::{debug, error, info, warn};

pub const RECORD_SOURCE: &str = "LINE_IMAGE_EXTRACTION";

/// Per-delivery orchestration: filter to image-message events, then run
/// fetch, extract, resolve, write for each one independently. One event's
/// failure never aborts its siblings, and never turns the response non-200,
/// because LINE retries whole batches on non-200.
#[derive(Clone)]
pub struct Pipeline {
    line: Arc<LineClient>,
    vision: Arc<VisionClient>,
    store: Option<FirestoreClient>,
    redis: Option<redis::Client>,
}

#[derive(Debug, Error)]
pub enum EventError {
    #[error(transparent)]
    Fetch(#[from] FetchError),
    #[error(transparent)]
    Extraction(#[from] ExtractionError),
    #[error("no merchant mapped to channel")]
    NoTenant,
    #[error("merchant lookup failed: {0}")]
    TenantLookup(String),
    #[error("document store is not configured")]
    StoreUnavailable,
    #[error("store write failed: {0}")]
    Persistence(String),
}

impl Pipeline {
    pub fn from_env() -> Self {
        let vision = VisionClient::new(VisionConfig::from_env());
        let redis = std::env::var("REDIS_URL")
            .ok()
            .and_then(|u| redis::Client::open(u).ok());
        Self {
            line: Arc::new(LineClient::new()),
            vision: Arc::new(vision),
            store: FirestoreClient::from_env(),
            redis,
        }
    }

    pub async fn handle_delivery(&self, payload: WebhookPayload) -> DeliveryReport {
        let received = payload.events.len();
        let mut reports = Vec::new();

        for event in payload.events.iter().filter(|e| e.is_image_message()) {
            let message_id = event.message_id().unwrap_or_default().to_string();
            let started = Instant::now();
            let outcome = match self.process_event(&payload.destination, event).await {
                Ok(outcome) => outcome,
                Err(err) => {
                    // Persistence failures silently drop otherwise-valid
                    // data, so they log a level above the rest.
                    match &err {
                        EventError::Persistence(_) => error!(
                            target = "shaken.pipeline",
                            message_id = %message_id,
                            error = %err,
                            "vehicle record write failed; event dropped",
                        ),
                        _ => warn!(
                            target = "shaken.pipeline",
                            message_id = %message_id,
                            error = %err,
                            "event skipped",
                        ),
                    }
                    EventOutcome::Failed {
                        error: err.to_string(),
                    }
                }
            };
            let elapsed_ms = started.elapsed().as_millis();
            crate::metrics::event_elapsed(outcome.label(), elapsed_ms);
            reports.push(EventReport::new(message_id, elapsed_ms, outcome));
        }

        let processed = reports.iter().filter(|r| r.outcome.is_processed()).count();
        DeliveryReport {
            received,
            processed,
            reports,
        }
    }

    async fn process_event(
        &self,
        channel_id: &str,
        event: &InboundEvent,
    ) -> Result<EventOutcome, EventError> {
        // is_image_message guarantees the message payload is present
        let message_id = event.message_id().unwrap_or_default();
        let line_user_id = event.line_user_id();

        if let Some(client) = &self.redis
            && idempotency::seen(client, message_id).await
        {
            debug!(
                target = "shaken.pipeline",
                message_id, "message already ingested; skipping"
            );
            return Ok(EventOutcome::Duplicate);
        }

        let image = self.line.fetch_message_content(message_id).await?;
        let extraction = self.vision.extract(&image).await?;
        debug!(
            target = "shaken.pipeline",
            message_id,
            result = %serde_json::to_string(&extraction).unwrap_or_default(),
            "extraction completed",
        );

        if !extraction.has_date() {
            info!(
                target = "shaken.pipeline",
                message_id, "no inspection date identified; nothing to persist"
            );
            return Ok(EventOutcome::NoDate);
        }

        let store = self.store.as_ref().ok_or(EventError::StoreUnavailable)?;
        let merchant = store
            .resolve_merchant(channel_id)
            .await
            .map_err(|err| match err {
                StoreError::NoTenant => EventError::NoTenant,
                other => EventError::TenantLookup(other.to_string()),
            })?;

        let record = NewVehicleRecord {
            merchant_id: merchant.id.clone(),
            merchant_owner_id: merchant.owner_id.clone(),
            line_user_id,
            inspection_date: extraction.inspection_date.clone(),
            status: VehicleStatus::initial(),
            plate_number: String::new(),
            model_name: extraction.document_label().to_string(),
            source: RECORD_SOURCE,
            confidence: extraction.confidence,
        };
        let record_id = vehicle_record_id(message_id);

        match store.create_vehicle(&merchant, &record, &record_id).await {
            Ok(id) => {
                if let Some(client) = &self.redis {
                    idempotency::mark(client, message_id).await;
                }
                info!(
                    target = "shaken.pipeline",
                    message_id,
                    record_id = %id,
                    merchant_id = %merchant.id,
                    inspection_date = %record.inspection_date,
                    "vehicle record created",
                );
                Ok(EventOutcome::Persisted { record_id: id })
            }
            Err(StoreError::Duplicate) => {
                info!(
                    target = "shaken.pipeline",
                    message_id, "record already exists; replayed delivery ignored"
                );
                Ok(EventOutcome::Duplicate)
            }
            Err(err) => Err(EventError::Persistence(err.to_string())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn payload(json: &str) -> WebhookPayload {
        serde_json::from_str(json).expect("payload")
    }

    // Offline pipeline: no LINE token, no store, no redis. Image events fail
    // fast at the fetch step with MissingCredentials, which is exactly the
    // suppression path the dispatcher must survive.
    fn offline_pipeline() -> Pipeline {
        Pipeline {
            line: Arc::new(LineClient::new()),
            vision: Arc::new(VisionClient::new(VisionConfig {
                gateway_url: String::new(),
                api_key: None,
                function_name: None,
                model: None,
            })),
            store: None,
            redis: None,
        }
    }

    #[tokio::test]
    async fn empty_delivery_is_a_successful_noop() {
        let report = offline_pipeline()
            .handle_delivery(payload(r#"{"destination":"Ubot","events":[]}"#))
            .await;
        assert_eq!(report.received, 0);
        assert_eq!(report.processed, 0);
        assert!(report.reports.is_empty());
    }

    #[tokio::test]
    async fn non_image_events_are_ignored_without_side_effects() {
        let report = offline_pipeline()
            .handle_delivery(payload(
                r#"{"destination":"Ubot","events":[
                    {"type":"message","message":{"id":"1","type":"text"},"source":{"userId":"U1"}},
                    {"type":"follow","source":{"userId":"U1"}},
                    {"type":"unfollow","source":{"userId":"U1"}}
                ]}"#,
            ))
            .await;
        assert_eq!(report.received, 3);
        assert_eq!(report.processed, 0);
        // ignored events produce no per-event reports at all
        assert!(report.reports.is_empty());
    }

    #[tokio::test]
    async fn only_image_events_invoke_the_per_event_pipeline() {
        let report = offline_pipeline()
            .handle_delivery(payload(
                r#"{"destination":"Ubot","events":[
                    {"type":"message","message":{"id":"img-1","type":"image"},"source":{"userId":"U1"}},
                    {"type":"message","message":{"id":"txt-1","type":"text"},"source":{"userId":"U1"}},
                    {"type":"message","message":{"id":"img-2","type":"image"},"source":{"userId":"U2"}}
                ]}"#,
            ))
            .await;
        assert_eq!(report.received, 3);
        assert_eq!(report.reports.len(), 2);
        let ids: Vec<&str> = report
            .reports
            .iter()
            .map(|r| r.message_id.as_str())
            .collect();
        assert_eq!(ids, vec!["img-1", "img-2"]);
    }

    #[tokio::test]
    async fn per_event_failures_are_suppressed_and_reported() {
        // No channel access token configured, so both events fail at fetch;
        // the delivery itself still completes with every sibling attempted.
        let report = offline_pipeline()
            .handle_delivery(payload(
                r#"{"destination":"Ubot","events":[
                    {"type":"message","message":{"id":"img-1","type":"image"},"source":{"userId":"U1"}},
                    {"type":"message","message":{"id":"img-2","type":"image"},"source":{"userId":"U2"}}
                ]}"#,
            ))
            .await;
        assert_eq!(report.received, 2);
        assert_eq!(report.processed, 0);
        assert_eq!(report.reports.len(), 2);
        for event_report in &report.reports {
            assert!(matches!(
                event_report.outcome,
                EventOutcome::Failed { .. }
            ));
        }
    }

    #[test]
    fn outcome_processed_classification() {
        assert!(
            EventOutcome::Persisted {
                record_id: "line-1".into()
            }
            .is_processed()
        );
        assert!(EventOutcome::NoDate.is_processed());
        assert!(EventOutcome::Duplicate.is_processed());
        assert!(
            !EventOutcome::Failed {
                error: "boom".into()
            }
            .is_processed()
        );
    }
}
