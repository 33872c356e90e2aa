//! Mapping Task builder (spec §4.6) and Task-resolution coordinator
//! (spec §4.7).

use crate::converter::SenderContext;
use crate::fhir_store::{FhirStore, FhirStoreError};
use crate::mapping::{self, concept_map_id, mapping_type_config, CodeMappingMiss};
use crate::queue::{IncomingHl7v2Message, MessageStatus};
use crate::validation::ValidationRegistry;
use sha2::{Digest, Sha256};
use serde_json::{json, Value};
use thiserror::Error;
use hex;

#[derive(Debug, Error)]
pub enum TaskError {
    #[error(transparent)]
    Store(#[from] FhirStoreError),
    #[error(transparent)]
    Mapping(#[from] mapping::MappingLookupError),
    #[error("task is already completed")]
    AlreadyCompleted,
    #[error("resolved code '{0}' is invalid for mapping type '{1}': {2}")]
    InvalidCode(String, String, String),
    #[error("malformed task: {0}")]
    Malformed(String),
    #[error(transparent)]
    Serde(#[from] serde_json::Error),
}

/// Short, stable hex tag for a string component of a Task id. Must be
/// deterministic across process restarts (spec §8 "Task id uniqueness"),
/// which rules out `DefaultHasher` (randomly keyed per process).
fn stable_hash(input: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(input.as_bytes());
    let digest = hasher.finalize();
    hex::encode(&digest[..6])
}

/// `map-{conceptMapId}-{hash(localSystem)}-{hash(localCode)}` (spec §3).
pub fn mapping_task_id(concept_map_id: &str, local_system: &str, local_code: &str) -> String {
    format!(
        "map-{concept_map_id}-{}-{}",
        stable_hash(local_system),
        stable_hash(local_code)
    )
}

/// Builds one deduplicated Task per unique `(sender, type, system, code)`
/// among the misses accumulated while converting one message, as a PUT
/// bundle entry (spec §4.6). Task is treated as raw JSON throughout this
/// module (see `mapping::resolve_code`) rather than via `fhir_model`'s
/// typed `Resource`, since its bespoke `input`/`output` shape here has no
/// stable typed counterpart worth guessing at.
pub fn build_task_entries(sender: &SenderContext, misses: &[CodeMappingMiss]) -> Vec<Value> {
    let mut seen = std::collections::HashSet::new();
    let mut entries = Vec::new();

    for miss in misses {
        let cm_id = concept_map_id(&sender.sending_application, &sender.sending_facility, &miss.mapping_type);
        let task_id = mapping_task_id(&cm_id, &miss.local_system, &miss.local_code);
        if !seen.insert(task_id.clone()) {
            continue;
        }

        let cfg = mapping_type_config(&miss.mapping_type);
        let (source_label, target_label) = cfg
            .map(|c| (c.source_field_label, c.target_field_label))
            .unwrap_or(("", ""));

        let resource = json!({
            "resourceType": "Task",
            "id": task_id,
            "status": "requested",
            "intent": "order",
            "code": {"coding": [{"code": miss.mapping_type}]},
            "input": [
                {"type": {"text": "sendingApplication"}, "valueString": sender.sending_application},
                {"type": {"text": "sendingFacility"}, "valueString": sender.sending_facility},
                {"type": {"text": "localCode"}, "valueString": miss.local_code},
                {"type": {"text": "localDisplay"}, "valueString": miss.local_display.clone().unwrap_or_default()},
                {"type": {"text": "localSystem"}, "valueString": miss.local_system},
                {"type": {"text": "sourceField"}, "valueString": source_label},
                {"type": {"text": "targetField"}, "valueString": target_label},
            ]
        });

        entries.push(json!({
            "resource": resource,
            "request": {"method": "PUT", "url": format!("Task/{task_id}")}
        }));
    }

    entries
}

fn task_input(task: &Value, field: &str) -> Option<String> {
    task.get("input")?
        .as_array()?
        .iter()
        .find(|i| i.get("type").and_then(|t| t.get("text")).and_then(|t| t.as_str()) == Some(field))
        .and_then(|i| i.get("valueString"))
        .and_then(|v| v.as_str())
        .map(str::to_string)
}

struct TaskContext {
    sending_application: String,
    sending_facility: String,
    local_system: String,
    local_code: String,
    mapping_type: String,
}

fn parse_task_context(task: &Value) -> Result<TaskContext, TaskError> {
    Ok(TaskContext {
        sending_application: task_input(task, "sendingApplication")
            .ok_or_else(|| TaskError::Malformed("missing sendingApplication input".to_string()))?,
        sending_facility: task_input(task, "sendingFacility")
            .ok_or_else(|| TaskError::Malformed("missing sendingFacility input".to_string()))?,
        local_system: task_input(task, "localSystem")
            .ok_or_else(|| TaskError::Malformed("missing localSystem input".to_string()))?,
        local_code: task_input(task, "localCode")
            .ok_or_else(|| TaskError::Malformed("missing localCode input".to_string()))?,
        mapping_type: task
            .get("code")
            .and_then(|c| c.get("coding"))
            .and_then(|c| c.as_array())
            .and_then(|a| a.first())
            .and_then(|c| c.get("code"))
            .and_then(|c| c.as_str())
            .ok_or_else(|| TaskError::Malformed("missing code.coding[0].code".to_string()))?
            .to_string(),
    })
}

/// Result of a successful `resolve` call (spec §4.7), used by callers to
/// drive message re-enqueue.
pub struct ResolutionOutcome {
    pub task_id: String,
    pub reprocessed_messages: Vec<String>,
}

/// Single entry point for resolving a mapping Task (spec §4.7). Performs the
/// atomic Task+ConceptMap transaction, then best-effort re-enqueues every
/// `mapping_error` message referencing the Task.
pub async fn resolve(
    store: &dyn FhirStore,
    aliases: &std::collections::HashMap<String, String>,
    task_id: &str,
    resolved_code: &str,
    resolved_display: Option<&str>,
) -> Result<ResolutionOutcome, TaskError> {
    let fetched_task = store
        .get_raw("Task", task_id)
        .await?
        .ok_or_else(|| TaskError::Malformed(format!("task {task_id} not found")))?;

    if fetched_task.resource.get("status").and_then(|s| s.as_str()) == Some("completed") {
        return Err(TaskError::AlreadyCompleted);
    }

    let ctx = parse_task_context(&fetched_task.resource)?;
    let mapping_type = mapping::canonical_mapping_type(&ctx.mapping_type, aliases).to_string();

    let valid = ValidationRegistry::default().validate(&mapping_type, resolved_code);
    if !valid.valid {
        return Err(TaskError::InvalidCode(
            resolved_code.to_string(),
            mapping_type,
            valid.error.unwrap_or_default(),
        ));
    }

    let cm_id = concept_map_id(&ctx.sending_application, &ctx.sending_facility, &mapping_type);
    let existing_cm = store.get_raw("ConceptMap", &cm_id).await?;

    let updated_cm = match &existing_cm {
        Some(fetched) => upsert_concept_map_element(
            fetched.resource.clone(),
            &ctx.local_system,
            &ctx.local_code,
            resolved_code,
            resolved_display,
        ),
        None => json!({
            "resourceType": "ConceptMap",
            "id": cm_id,
            "group": [{
                "source": ctx.local_system,
                "element": [{
                    "code": ctx.local_code,
                    "target": [{
                        "code": resolved_code,
                        "display": resolved_display,
                        "equivalence": "equivalent"
                    }]
                }]
            }]
        }),
    };

    let target_cfg = mapping_type_config(&mapping_type);
    let mut updated_task = fetched_task.resource.clone();
    updated_task["status"] = json!("completed");
    updated_task["output"] = json!([{
        "type": "Resolved mapping",
        "valueCodeableConcept": {
            "coding": [{
                "system": target_cfg.map(|c| c.target_system).unwrap_or_default(),
                "code": resolved_code,
                "display": resolved_display,
            }]
        }
    }]);

    // Task and ConceptMap are submitted as one transaction bundle (spec
    // §4.7 step 7) so a completed Task is never observed without its
    // ConceptMap element. Each entry still carries its own conditional
    // header, so a precondition failure on either rolls back the whole
    // commit rather than leaving the store half-updated.
    store
        .transaction_raw(vec![
            conditional_entry(updated_task, "Task", task_id, fetched_task.etag.as_deref(), false),
            conditional_entry(
                updated_cm,
                "ConceptMap",
                &cm_id,
                existing_cm.as_ref().and_then(|f| f.etag.as_deref()),
                existing_cm.is_none(),
            ),
        ])
        .await?;

    let reprocessed = reenqueue_blocked_messages(store, task_id).await?;

    Ok(ResolutionOutcome {
        task_id: task_id.to_string(),
        reprocessed_messages: reprocessed,
    })
}

/// Builds one `transaction_raw` entry, carrying the same `ifMatch`/
/// `ifNoneMatch` conditional semantics `put_raw` takes as arguments.
fn conditional_entry(resource: Value, resource_type: &str, id: &str, if_match: Option<&str>, if_none_match_create: bool) -> Value {
    let mut request = json!({"method": "PUT", "url": format!("{resource_type}/{id}")});
    if let Some(etag) = if_match {
        request["ifMatch"] = json!(etag);
    } else if if_none_match_create {
        request["ifNoneMatch"] = json!("*");
    }
    json!({"resource": resource, "request": request})
}

fn upsert_concept_map_element(
    mut concept_map: Value,
    local_system: &str,
    local_code: &str,
    resolved_code: &str,
    resolved_display: Option<&str>,
) -> Value {
    let groups = concept_map
        .get_mut("group")
        .and_then(|g| g.as_array_mut())
        .map(std::mem::take)
        .unwrap_or_default();
    let mut groups = groups;

    let target = json!({
        "code": resolved_code,
        "display": resolved_display,
        "equivalence": "equivalent"
    });

    if let Some(group) = groups
        .iter_mut()
        .find(|g| g.get("source").and_then(|s| s.as_str()) == Some(local_system))
    {
        let elements = group
            .get_mut("element")
            .and_then(|e| e.as_array_mut())
            .map(std::mem::take)
            .unwrap_or_default();
        let mut elements = elements;

        if let Some(element) = elements
            .iter_mut()
            .find(|e| e.get("code").and_then(|c| c.as_str()) == Some(local_code))
        {
            element["target"] = json!([target]);
        } else {
            elements.push(json!({"code": local_code, "target": [target]}));
        }
        group["element"] = Value::Array(elements);
    } else {
        groups.push(json!({
            "source": local_system,
            "element": [{"code": local_code, "target": [target]}]
        }));
    }

    concept_map["group"] = Value::Array(groups);
    concept_map
}

/// After a Task resolves, finds every `mapping_error` message referencing
/// it and removes the resolved `UnmappedCode`, flipping the message back to
/// `received` once its list is empty (spec §4.7 step 8, §8 "Message
/// re-enqueue completeness").
async fn reenqueue_blocked_messages(store: &dyn FhirStore, task_id: &str) -> Result<Vec<String>, TaskError> {
    let matches = store
        .search_raw("IncomingHl7v2Message", &format!("unmapped-task=Task/{task_id}"))
        .await?;

    let mut reprocessed = Vec::new();

    for raw in matches {
        let mut message: IncomingHl7v2Message = serde_json::from_value(raw)?;
        if message.status != MessageStatus::MappingError {
            continue;
        }

        message.unmapped_codes.retain(|u| u.mapping_task != format!("Task/{task_id}"));

        message.status = if message.unmapped_codes.is_empty() {
            MessageStatus::Received
        } else {
            MessageStatus::MappingError
        };

        let value = serde_json::to_value(&message)?;
        store
            .put_raw("IncomingHl7v2Message", &message.id, value, message.version_id.as_deref(), false)
            .await?;

        reprocessed.push(message.id);
    }

    Ok(reprocessed)
}
