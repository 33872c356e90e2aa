//! Inbound message dispatcher (spec §4.3, §4.4): pops the oldest `received`
//! message, routes it to the converter matching its message type, and
//! applies the resulting status back onto the `IncomingHl7v2Message`.

use crate::config::{AppConfig, PreprocessorRegistry};
use crate::converter::{adt, orm, oru, ConversionContext, ConversionError, MessageAccessError, MessageTypeError, SenderContext};
use crate::fhir_store::{FhirStore, FhirStoreError};
use crate::mapping::concept_map_id;
use crate::processor::Tick;
use crate::queue::{MessageUpdate, QueueError, QueueStore, UnmappedCode};
use crate::task::{self, build_task_entries};
use fhir_model::r4b::codes::BundleType;
use fhir_model::r4b::resources::Bundle;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum DispatchError {
    #[error(transparent)]
    Store(#[from] FhirStoreError),
    #[error(transparent)]
    Queue(#[from] QueueError),
    #[error(transparent)]
    Builder(#[from] fhir_model::BuilderError),
}

/// One dispatch attempt. `Tick::Idle` when the queue is empty, otherwise
/// `Tick::Processed` regardless of whether the message ultimately succeeded,
/// warned, or errored — each of those is a terminal outcome for this cycle.
pub async fn process_one(
    store: &dyn FhirStore,
    cfg: &AppConfig,
    registry: &PreprocessorRegistry,
) -> Result<Tick, DispatchError> {
    let queue = QueueStore::new(store);
    let Some(message) = queue.next_received().await? else {
        return Ok(Tick::Idle);
    };

    let msg = match hl7_parser::Message::parse_with_lenient_newlines(&message.raw_message, true) {
        Ok(m) => m,
        Err(e) => {
            queue.apply_update(&message, MessageUpdate::conversion_error(e.to_string())).await?;
            return Ok(Tick::Processed);
        }
    };

    let sender = SenderContext {
        sending_application: message.sending_application.clone(),
        sending_facility: message.sending_facility.clone(),
    };
    let mut ctx = ConversionContext::new(sender.clone(), message.message_type.clone(), message.control_id.clone());

    let result: Result<(), ConversionError> = match message.message_type.as_str() {
        "ADT_A01" | "ADT_A08" => adt::convert(&message.raw_message, &msg, cfg, registry, store, &mut ctx).await,
        "ORU_R01" => oru::convert(&message.raw_message, &msg, cfg, registry, store, &mut ctx).await,
        "ORM_O01" => orm::convert(&message.raw_message, &msg, cfg, registry, store, &mut ctx).await,
        other => Err(ConversionError::MessageAccess(MessageAccessError::MessageType(
            MessageTypeError::Unsupported(other.to_string()),
        ))),
    };

    if let Err(e) = result {
        queue.apply_update(&message, MessageUpdate::conversion_error(e.to_string())).await?;
        return Ok(Tick::Processed);
    }

    if !ctx.unresolved.is_empty() {
        let unmapped_codes = apply_mapping_tasks(store, &sender, &ctx).await?;
        let update = MessageUpdate::mapping_error(unmapped_codes).with_patient_ref(ctx.patient_ref.clone());
        queue.apply_update(&message, update).await?;
        return Ok(Tick::Processed);
    }

    let bundle = Bundle::builder()
        .r#type(BundleType::Transaction)
        .entry(ctx.entries.into_iter().map(Some).collect())
        .build()?;
    store.transaction(&bundle).await?;

    let update = if ctx.warning {
        MessageUpdate::warning()
    } else {
        MessageUpdate::converted()
    }
    .with_patient_ref(ctx.patient_ref);
    queue.apply_update(&message, update).await?;

    Ok(Tick::Processed)
}

/// Puts each deduplicated mapping Task directly (spec §4.6) — unlike the
/// Task+ConceptMap pair `task::resolve` commits atomically, a freshly
/// discovered miss only ever touches the one Task, so a transaction Bundle
/// buys nothing here and `build_task_entries`' plain JSON has no typed
/// `Resource` counterpart to wrap one in anyway.
async fn apply_mapping_tasks(
    store: &dyn FhirStore,
    sender: &SenderContext,
    ctx: &ConversionContext,
) -> Result<Vec<UnmappedCode>, DispatchError> {
    for entry in build_task_entries(sender, &ctx.unresolved) {
        let Some(resource) = entry.get("resource") else { continue };
        let Some(id) = resource.get("id").and_then(|v| v.as_str()) else { continue };
        store.put_raw("Task", id, resource.clone(), None, false).await?;
    }

    Ok(ctx
        .unresolved
        .iter()
        .map(|miss| {
            let cm_id = concept_map_id(&sender.sending_application, &sender.sending_facility, &miss.mapping_type);
            let task_id = task::mapping_task_id(&cm_id, &miss.local_system, &miss.local_code);
            UnmappedCode {
                local_code: miss.local_code.clone(),
                local_display: miss.local_display.clone(),
                local_system: miss.local_system.clone(),
                mapping_task: format!("Task/{task_id}"),
            }
        })
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::AppConfig;
    use crate::fhir_store::fake::InMemoryFhirStore;
    use crate::queue::{IncomingHl7v2Message, MessageStatus};

    fn seed_message(store: &InMemoryFhirStore, id: &str, raw: &str, message_type: &str) {
        let value = serde_json::to_value(IncomingHl7v2Message {
            id: id.to_string(),
            resource_type: "IncomingHl7v2Message".to_string(),
            version_id: None,
            status: MessageStatus::Received,
            raw_message: raw.to_string(),
            sending_application: "LAB".to_string(),
            sending_facility: "HOSP".to_string(),
            message_type: message_type.to_string(),
            control_id: "MSG1".to_string(),
            received_at: "2024-01-01T00:00:00Z".to_string(),
            error_detail: None,
            unmapped_codes: Vec::new(),
            patient_ref: None,
        })
        .unwrap();
        tokio::runtime::Handle::current().block_on(store.seed("IncomingHl7v2Message", id, value));
    }

    #[tokio::test]
    async fn records_mapping_error_when_order_code_unmapped() {
        let store = InMemoryFhirStore::new();
        let cfg = AppConfig::default();
        let registry = PreprocessorRegistry::default();

        let raw = "MSH|^~\\&|LAB|HOSP|REC|RECFAC|20240102030405||ORM^O01|MSG1|P|2.5\r\
PID|1||MRN123^^^HOSP^MR\r\
ORC|NW|ORD1\r\
OBR|1|ORD1|FIL1|K^Potassium";
        seed_message(&store, "msg-1", raw, "ORM_O01");

        let tick = process_one(&store, &cfg, &registry).await.unwrap();
        assert!(matches!(tick, Tick::Processed));

        let stored: IncomingHl7v2Message = serde_json::from_value(store.get("IncomingHl7v2Message", "msg-1").await.unwrap()).unwrap();
        assert_eq!(stored.status, MessageStatus::MappingError);
        assert_eq!(stored.unmapped_codes.len(), 1);
        assert!(stored.patient_ref.is_some());

        let task_id = task::mapping_task_id(&concept_map_id("LAB", "HOSP", "order-code-loinc"), "OBR-4", "K");
        assert!(store.get("Task", &task_id).await.is_some());
    }

    #[tokio::test]
    async fn idle_when_no_messages_pending() {
        let store = InMemoryFhirStore::new();
        let cfg = AppConfig::default();
        let registry = PreprocessorRegistry::default();
        assert!(matches!(process_one(&store, &cfg, &registry).await.unwrap(), Tick::Idle));
    }
}
