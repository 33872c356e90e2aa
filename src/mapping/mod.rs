//! Code-mapping resolver (spec §4.4) and the static `MappingTypeConfig`
//! registry (spec §3).

use crate::converter::kebab;
use crate::fhir_store::{FhirStore, FhirStoreError};
use once_cell::sync::Lazy;
use std::collections::HashMap;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum MappingLookupError {
    #[error(transparent)]
    Store(#[from] FhirStoreError),
    #[error(transparent)]
    Serde(#[from] serde_json::Error),
    #[error("unknown mapping type: {0}")]
    UnknownMappingType(String),
}

/// A single unresolved code encountered while converting one message (spec
/// §4.4's "MappingError" record — renamed here to avoid colliding with
/// Rust's own `Error` convention; it is data, not an exception).
#[derive(Debug, Clone, PartialEq)]
pub struct CodeMappingMiss {
    pub local_code: String,
    pub local_display: Option<String>,
    pub local_system: String,
    pub mapping_type: String,
}

/// Static per-mapping-type registry entry (spec §3 `MappingTypeConfig`).
#[derive(Debug, Clone)]
pub struct MappingTypeConfig {
    pub source_field_label: &'static str,
    pub target_field_label: &'static str,
    pub target_system: &'static str,
}

pub static MAPPING_TYPES: Lazy<HashMap<&'static str, MappingTypeConfig>> = Lazy::new(|| {
    HashMap::from([
        (
            "observation-code-loinc",
            MappingTypeConfig {
                source_field_label: "OBX-3",
                target_field_label: "Observation.code",
                target_system: "http://loinc.org",
            },
        ),
        (
            "order-code-loinc",
            MappingTypeConfig {
                source_field_label: "OBR-4",
                target_field_label: "ServiceRequest.code",
                target_system: "http://loinc.org",
            },
        ),
        (
            "patient-class",
            MappingTypeConfig {
                source_field_label: "PV1-2",
                target_field_label: "Encounter.class",
                target_system: "http://terminology.hl7.org/CodeSystem/v3-ActCode",
            },
        ),
        (
            "obr-status",
            MappingTypeConfig {
                source_field_label: "OBR-25",
                target_field_label: "DiagnosticReport.status",
                target_system: "http://hl7.org/fhir/diagnostic-report-status",
            },
        ),
        (
            "obx-status",
            MappingTypeConfig {
                source_field_label: "OBX-11",
                target_field_label: "Observation.status",
                target_system: "http://hl7.org/fhir/observation-status",
            },
        ),
    ])
});

/// Resolves a legacy task-code alias (spec §9c) to the canonical mapping
/// type, if the closed config-driven alias table defines one.
pub fn canonical_mapping_type<'a>(raw: &'a str, aliases: &'a HashMap<String, String>) -> &'a str {
    aliases.get(raw).map(|s| s.as_str()).unwrap_or(raw)
}

pub fn mapping_type_config(mapping_type: &str) -> Option<&'static MappingTypeConfig> {
    MAPPING_TYPES.get(mapping_type)
}

/// Deterministic ConceptMap id: `hl7v2-{kebab(sender-app)}-{kebab(sender-facility)}-{mapping-type}`
/// (spec §3 "ConceptMap", §8 "ConceptMap id purity").
pub fn concept_map_id(sending_application: &str, sending_facility: &str, mapping_type: &str) -> String {
    format!(
        "hl7v2-{}-{}-{}",
        kebab(sending_application),
        kebab(sending_facility),
        mapping_type
    )
}

#[derive(Debug, Clone)]
pub struct ResolvedCode {
    pub code: String,
    pub display: Option<String>,
}

/// Looks up a local code against the sender's ConceptMap for the given
/// mapping type. Returns `Ok(None)` on any miss — no ConceptMap, no matching
/// group, no matching element (spec §4.4).
pub async fn resolve_code(
    store: &dyn FhirStore,
    sending_application: &str,
    sending_facility: &str,
    mapping_type: &str,
    local_system: &str,
    local_code: &str,
) -> Result<Option<ResolvedCode>, MappingLookupError> {
    let id = concept_map_id(sending_application, sending_facility, mapping_type);
    let Some(fetched) = store.get_raw("ConceptMap", &id).await? else {
        return Ok(None);
    };

    let groups = fetched
        .resource
        .get("group")
        .and_then(|g| g.as_array())
        .cloned()
        .unwrap_or_default();

    for group in groups {
        if group.get("source").and_then(|s| s.as_str()) != Some(local_system) {
            continue;
        }
        let elements = group.get("element").and_then(|e| e.as_array()).cloned().unwrap_or_default();
        for element in elements {
            if element.get("code").and_then(|c| c.as_str()) != Some(local_code) {
                continue;
            }
            let target = element
                .get("target")
                .and_then(|t| t.as_array())
                .and_then(|arr| arr.first())
                .cloned();
            if let Some(target) = target {
                let code = target.get("code").and_then(|c| c.as_str()).map(str::to_string);
                let display = target.get("display").and_then(|d| d.as_str()).map(str::to_string);
                if let Some(code) = code {
                    return Ok(Some(ResolvedCode { code, display }));
                }
            }
        }
    }

    Ok(None)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fhir_store::fake::InMemoryFhirStore;
    use serde_json::json;

    #[tokio::test]
    async fn misses_when_no_concept_map_exists() {
        let store = InMemoryFhirStore::new();
        let res = resolve_code(&store, "LAB", "HOSP", "observation-code-loinc", "LOCAL", "12345")
            .await
            .unwrap();
        assert!(res.is_none());
    }

    #[tokio::test]
    async fn hits_when_element_present() {
        let store = InMemoryFhirStore::new();
        let id = concept_map_id("LAB", "HOSP", "observation-code-loinc");
        store
            .seed(
                "ConceptMap",
                &id,
                json!({
                    "resourceType": "ConceptMap",
                    "id": id,
                    "group": [{
                        "source": "LOCAL",
                        "element": [{
                            "code": "12345",
                            "target": [{"code": "2823-3", "display": "Potassium", "equivalence": "equivalent"}]
                        }]
                    }]
                }),
            )
            .await;

        let res = resolve_code(&store, "LAB", "HOSP", "observation-code-loinc", "LOCAL", "12345")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(res.code, "2823-3");
        assert_eq!(res.display.as_deref(), Some("Potassium"));
    }

    #[test]
    fn concept_map_id_is_a_pure_function_of_sender_and_type() {
        assert_eq!(
            concept_map_id("LAB SYSTEM", "General Hospital", "observation-code-loinc"),
            "hl7v2-lab-system-general-hospital-observation-code-loinc"
        );
    }

    #[test]
    fn legacy_alias_resolves_to_canonical_type() {
        let mut aliases = HashMap::new();
        aliases.insert("local-to-loinc-mapping".to_string(), "observation-code-loinc".to_string());
        assert_eq!(
            canonical_mapping_type("local-to-loinc-mapping", &aliases),
            "observation-code-loinc"
        );
        assert_eq!(canonical_mapping_type("obr-status", &aliases), "obr-status");
    }
}
