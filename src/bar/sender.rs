//! BAR sender poller (spec §4.8): re-submits one pending `OutgoingBarMessage`
//! as an `IncomingHl7v2Message` at the sink, reusing the same backend as the
//! delivery transport (spec explicitly allows this).

use crate::fhir_store::FhirStore;
use crate::processor::Tick;
use crate::queue::{IncomingHl7v2Message, MessageStatus, QueueError, QueueStore};

pub async fn send_one(store: &dyn FhirStore) -> Result<Tick, QueueError> {
    let queue = QueueStore::new(store);
    let Some(outgoing) = queue.next_pending_bar().await? else {
        return Ok(Tick::Idle);
    };

    let sink_message = IncomingHl7v2Message {
        id: format!("{}-sink", outgoing.id),
        resource_type: "IncomingHl7v2Message".to_string(),
        version_id: None,
        status: MessageStatus::Received,
        raw_message: outgoing.hl7_message.clone(),
        sending_application: "BAR_BUILDER".to_string(),
        sending_facility: "BAR_BUILDER".to_string(),
        message_type: "BAR".to_string(),
        control_id: outgoing.id.clone(),
        received_at: chrono::Utc::now().to_rfc3339(),
        error_detail: None,
        unmapped_codes: Vec::new(),
        patient_ref: None,
    };

    queue.insert_incoming(&sink_message).await?;
    queue.mark_bar_sent(&outgoing).await?;
    Ok(Tick::Processed)
}
