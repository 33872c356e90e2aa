//! The bespoke `IncomingHl7v2Message` / `OutgoingBarMessage` resources
//! (spec §5) and the status-update type converters hand back after a
//! conversion attempt.
//!
//! Both resources live in the same opaque FHIR store as the clinical
//! resources (spec §6) but have no counterpart in `fhir-model`'s typed
//! resource enum, so this module works with plain serde structs and the
//! `FhirStore::{get_raw,put_raw,search_raw}` JSON surface directly.

use crate::fhir_store::{FhirStore, FhirStoreError};
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum QueueError {
    #[error(transparent)]
    Store(#[from] FhirStoreError),
    #[error(transparent)]
    Serde(#[from] serde_json::Error),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageStatus {
    Received,
    #[serde(rename = "processed")]
    Converted,
    Warning,
    MappingError,
    #[serde(rename = "error")]
    ConversionError,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UnmappedCode {
    #[serde(rename = "localCode")]
    pub local_code: String,
    #[serde(rename = "localDisplay", skip_serializing_if = "Option::is_none")]
    pub local_display: Option<String>,
    #[serde(rename = "localSystem")]
    pub local_system: String,
    #[serde(rename = "mappingTask")]
    pub mapping_task: String,
}

/// One received HL7v2 message, stored verbatim alongside its processing
/// state (spec §5 `IncomingHl7v2Message`).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IncomingHl7v2Message {
    pub id: String,
    #[serde(rename = "resourceType", default = "incoming_resource_type")]
    pub resource_type: String,
    #[serde(rename = "versionId", skip_serializing_if = "Option::is_none")]
    pub version_id: Option<String>,
    pub status: MessageStatus,
    #[serde(rename = "rawMessage")]
    pub raw_message: String,
    #[serde(rename = "sendingApplication")]
    pub sending_application: String,
    #[serde(rename = "sendingFacility")]
    pub sending_facility: String,
    #[serde(rename = "messageType")]
    pub message_type: String,
    #[serde(rename = "controlId")]
    pub control_id: String,
    #[serde(rename = "receivedAt")]
    pub received_at: String,
    #[serde(rename = "errorDetail", skip_serializing_if = "Option::is_none")]
    pub error_detail: Option<String>,
    #[serde(rename = "unmappedCodes", default)]
    pub unmapped_codes: Vec<UnmappedCode>,
    #[serde(rename = "patientRef", skip_serializing_if = "Option::is_none", default)]
    pub patient_ref: Option<String>,
}

fn incoming_resource_type() -> String {
    "IncomingHl7v2Message".to_string()
}

/// A BAR (billing account record) message awaiting transmission to the
/// downstream sink (spec §5 `OutgoingBarMessage`).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OutgoingBarMessage {
    pub id: String,
    #[serde(rename = "resourceType", default = "outgoing_resource_type")]
    pub resource_type: String,
    #[serde(rename = "versionId", skip_serializing_if = "Option::is_none")]
    pub version_id: Option<String>,
    pub status: BarStatus,
    #[serde(rename = "hl7Message")]
    pub hl7_message: String,
    #[serde(rename = "sourceInvoice")]
    pub source_invoice: String,
    #[serde(rename = "retryCount", default)]
    pub retry_count: u32,
    #[serde(rename = "lastError", skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
}

fn outgoing_resource_type() -> String {
    "OutgoingBarMessage".to_string()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BarStatus {
    Pending,
    Sent,
    Failed,
}

/// What a converter invocation reports back about the `IncomingHl7v2Message`
/// it processed (spec §4.3). The queue/poller layer applies this as a
/// conditional `put_raw` using the message's existing ETag.
#[derive(Debug, Clone)]
pub struct MessageUpdate {
    pub status: MessageStatus,
    pub error_detail: Option<String>,
    pub unmapped_codes: Vec<UnmappedCode>,
    pub patient_ref: Option<String>,
}

impl MessageUpdate {
    pub fn converted() -> Self {
        MessageUpdate {
            status: MessageStatus::Converted,
            error_detail: None,
            unmapped_codes: Vec::new(),
            patient_ref: None,
        }
    }

    /// Terminal-and-positive: an optional expected segment was absent but
    /// config permitted skipping it (spec §4.3 "partial success").
    pub fn warning() -> Self {
        MessageUpdate {
            status: MessageStatus::Warning,
            error_detail: None,
            unmapped_codes: Vec::new(),
            patient_ref: None,
        }
    }

    pub fn mapping_error(unmapped_codes: Vec<UnmappedCode>) -> Self {
        MessageUpdate {
            status: MessageStatus::MappingError,
            error_detail: None,
            unmapped_codes,
            patient_ref: None,
        }
    }

    pub fn conversion_error(detail: impl Into<String>) -> Self {
        MessageUpdate {
            status: MessageStatus::ConversionError,
            error_detail: Some(detail.into()),
            unmapped_codes: Vec::new(),
            patient_ref: None,
        }
    }

    /// Surfaces the PID-derived Patient reference on the message so
    /// operators can see affected patient context even when the message
    /// ends up `mapping_error` (spec §4.4).
    pub fn with_patient_ref(mut self, patient_ref: Option<String>) -> Self {
        self.patient_ref = patient_ref;
        self
    }
}

/// Thin wrapper over `FhirStore` for queue-shaped reads/writes, used by the
/// inbound processor poller and the BAR builder/sender pollers (spec §7).
pub struct QueueStore<'a> {
    store: &'a dyn FhirStore,
}

impl<'a> QueueStore<'a> {
    pub fn new(store: &'a dyn FhirStore) -> Self {
        QueueStore { store }
    }

    pub async fn insert_incoming(&self, message: &IncomingHl7v2Message) -> Result<IncomingHl7v2Message, QueueError> {
        let value = serde_json::to_value(message)?;
        let fetched = self.store.put_raw("IncomingHl7v2Message", &message.id, value, None, true).await?;
        Ok(serde_json::from_value(fetched.resource)?)
    }

    /// Fetches the oldest `received` message, if any (spec §7 "Inbound
    /// processor": one-at-a-time, oldest first).
    pub async fn next_received(&self) -> Result<Option<IncomingHl7v2Message>, QueueError> {
        let matches = self
            .store
            .search_raw("IncomingHl7v2Message", "status=received")
            .await?;

        let mut messages: Vec<IncomingHl7v2Message> = matches
            .into_iter()
            .map(serde_json::from_value)
            .collect::<Result<_, _>>()?;

        messages.sort_by(|a, b| a.received_at.cmp(&b.received_at));
        Ok(messages.into_iter().next())
    }

    pub async fn apply_update(&self, message: &IncomingHl7v2Message, update: MessageUpdate) -> Result<(), QueueError> {
        let mut updated = message.clone();
        updated.status = update.status;
        updated.error_detail = update.error_detail;
        updated.unmapped_codes = update.unmapped_codes;
        if update.patient_ref.is_some() {
            updated.patient_ref = update.patient_ref;
        }

        let value = serde_json::to_value(&updated)?;
        self.store
            .put_raw("IncomingHl7v2Message", &updated.id, value, message.version_id.as_deref(), false)
            .await?;
        Ok(())
    }

    pub async fn insert_outgoing(&self, message: &OutgoingBarMessage) -> Result<(), QueueError> {
        let value = serde_json::to_value(message)?;
        self.store.put_raw("OutgoingBarMessage", &message.id, value, None, true).await?;
        Ok(())
    }

    /// Fetches the oldest `pending` BAR message (spec §7 "BAR sender").
    pub async fn next_pending_bar(&self) -> Result<Option<OutgoingBarMessage>, QueueError> {
        let matches = self.store.search_raw("OutgoingBarMessage", "status=pending").await?;
        let mut messages: Vec<OutgoingBarMessage> = matches
            .into_iter()
            .map(serde_json::from_value)
            .collect::<Result<_, _>>()?;
        messages.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(messages.into_iter().next())
    }

    pub async fn mark_bar_sent(&self, message: &OutgoingBarMessage) -> Result<(), QueueError> {
        let mut updated = message.clone();
        updated.status = BarStatus::Sent;
        updated.last_error = None;
        let value = serde_json::to_value(&updated)?;
        self.store
            .put_raw("OutgoingBarMessage", &updated.id, value, message.version_id.as_deref(), false)
            .await?;
        Ok(())
    }

    pub async fn mark_bar_failed(&self, message: &OutgoingBarMessage, detail: impl Into<String>) -> Result<(), QueueError> {
        let mut updated = message.clone();
        updated.retry_count += 1;
        updated.last_error = Some(detail.into());
        let value = serde_json::to_value(&updated)?;
        self.store
            .put_raw("OutgoingBarMessage", &updated.id, value, message.version_id.as_deref(), false)
            .await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fhir_store::fake::InMemoryFhirStore;

    fn sample(id: &str, received_at: &str) -> IncomingHl7v2Message {
        IncomingHl7v2Message {
            id: id.to_string(),
            resource_type: incoming_resource_type(),
            version_id: None,
            status: MessageStatus::Received,
            raw_message: "MSH|...".to_string(),
            sending_application: "LAB".to_string(),
            sending_facility: "HOSP".to_string(),
            message_type: "ORU_R01".to_string(),
            control_id: "MSG1".to_string(),
            received_at: received_at.to_string(),
            error_detail: None,
            unmapped_codes: Vec::new(),
            patient_ref: None,
        }
    }

    #[tokio::test]
    async fn next_received_picks_oldest() {
        let store = InMemoryFhirStore::new();
        let q = QueueStore::new(&store);
        q.insert_incoming(&sample("msg-2", "2024-01-02T00:00:00Z")).await.unwrap();
        q.insert_incoming(&sample("msg-1", "2024-01-01T00:00:00Z")).await.unwrap();

        let next = q.next_received().await.unwrap().unwrap();
        assert_eq!(next.id, "msg-1");
    }

    #[tokio::test]
    async fn apply_update_moves_message_out_of_received() {
        let store = InMemoryFhirStore::new();
        let q = QueueStore::new(&store);
        let inserted = q.insert_incoming(&sample("msg-1", "2024-01-01T00:00:00Z")).await.unwrap();

        q.apply_update(&inserted, MessageUpdate::converted()).await.unwrap();

        assert!(q.next_received().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn mapping_error_update_records_unmapped_codes() {
        let store = InMemoryFhirStore::new();
        let q = QueueStore::new(&store);
        let inserted = q.insert_incoming(&sample("msg-1", "2024-01-01T00:00:00Z")).await.unwrap();

        let codes = vec![UnmappedCode {
            local_code: "12345".to_string(),
            local_display: None,
            local_system: "LOCAL".to_string(),
            mapping_task: "Task/map-x".to_string(),
        }];
        q.apply_update(&inserted, MessageUpdate::mapping_error(codes.clone())).await.unwrap();

        let stored = store.get("IncomingHl7v2Message", "msg-1").await.unwrap();
        let parsed: IncomingHl7v2Message = serde_json::from_value(stored).unwrap();
        assert_eq!(parsed.status, MessageStatus::MappingError);
        assert_eq!(parsed.unmapped_codes, codes);
    }
}
