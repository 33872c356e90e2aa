//! ORU_R01 converter (spec §4.3 "ORU_R01 specifics").
//!
//! Each OBR group yields one DiagnosticReport plus child Observations, linked
//! both by `DiagnosticReport.result[]` and `Observation.partOf`. An SPM
//! segment shared by the group yields one Specimen referenced by every
//! Observation.

use super::{
    kebab, message_tags, parse_component, put_entry, resolve_patient_ref, ConversionContext,
    ConversionError,
};
use crate::config::{AppConfig, PreprocessorRegistry};
use crate::mapping::{self, CodeMappingMiss};
use fhir_model::r4b::codes::{DiagnosticReportStatus, ObservationStatus};
use fhir_model::r4b::resources::{
    DiagnosticReport, Observation, ObservationReferenceRange, ObservationValue, ResourceType,
    Specimen,
};
use fhir_model::r4b::types::{Annotation, CodeableConcept, Coding, Quantity, Reference};
use hl7_parser::Message;

struct ObxEntry {
    fields: Vec<String>,
    nte_texts: Vec<String>,
}

impl ObxEntry {
    fn field(&self, n: usize) -> &str {
        self.fields.get(n).map(|s| s.as_str()).unwrap_or("")
    }
}

struct ObrGroup {
    fields: Vec<String>,
    spm_fields: Option<Vec<String>>,
    obx: Vec<ObxEntry>,
}

impl ObrGroup {
    fn field(&self, n: usize) -> &str {
        self.fields.get(n).map(|s| s.as_str()).unwrap_or("")
    }
}

fn split_fields(line: &str) -> Vec<String> {
    line.split('|').map(|s| s.to_string()).collect()
}

/// Walks the raw wire text and buckets OBX/NTE/SPM rows under the OBR they
/// follow. `hl7-parser` only ever returns the first match for a repeating
/// segment name, so the grouping is done against the original text directly.
fn parse_obr_groups(raw: &str) -> Vec<ObrGroup> {
    let mut groups = Vec::new();
    let mut current: Option<ObrGroup> = None;

    for line in raw.split(['\r', '\n']) {
        if line.starts_with("OBR|") {
            if let Some(group) = current.take() {
                groups.push(group);
            }
            current = Some(ObrGroup {
                fields: split_fields(line),
                spm_fields: None,
                obx: Vec::new(),
            });
        } else if line.starts_with("SPM|") {
            if let Some(group) = current.as_mut() {
                group.spm_fields = Some(split_fields(line));
            }
        } else if line.starts_with("OBX|") {
            if let Some(group) = current.as_mut() {
                group.obx.push(ObxEntry {
                    fields: split_fields(line),
                    nte_texts: Vec::new(),
                });
            }
        } else if line.starts_with("NTE|") {
            if let Some(group) = current.as_mut() {
                if let Some(last) = group.obx.last_mut() {
                    let fields = split_fields(line);
                    let text = fields.get(3).cloned().unwrap_or_default();
                    last.nte_texts.push(text);
                }
            }
        }
    }
    if let Some(group) = current.take() {
        groups.push(group);
    }
    groups
}

/// Folds a run of NTE-3 texts into paragraphs: a non-empty NTE-3 appends to
/// the running paragraph, an empty one starts a new one (spec §4.3).
fn note_paragraphs(nte_texts: &[String]) -> Vec<String> {
    let mut paragraphs = Vec::new();
    let mut current = String::new();
    for text in nte_texts {
        if text.is_empty() {
            if !current.is_empty() {
                paragraphs.push(std::mem::take(&mut current));
            }
        } else {
            if !current.is_empty() {
                current.push('\n');
            }
            current.push_str(text);
        }
    }
    if !current.is_empty() {
        paragraphs.push(current);
    }
    paragraphs
}

/// Converts one `ORU^R01` message (spec §4.3 "ORU_R01 specifics").
pub async fn convert(
    raw: &str,
    msg: &Message,
    cfg: &AppConfig,
    registry: &PreprocessorRegistry,
    store: &dyn crate::fhir_store::FhirStore,
    ctx: &mut ConversionContext,
) -> Result<(), ConversionError> {
    let patient_ref_str = resolve_patient_ref(msg, cfg, registry, &ctx.message_type)?;
    ctx.patient_ref = Some(patient_ref_str.clone());
    let tags = message_tags(&ctx.control_id, &ctx.message_type);

    for group in parse_obr_groups(raw) {
        let obr_id_raw = {
            let filler = group.field(3);
            if !filler.is_empty() {
                filler.to_string()
            } else {
                group.field(2).to_string()
            }
        };
        if obr_id_raw.is_empty() {
            continue;
        }
        let obr_id = kebab(&obr_id_raw);

        let order_code_field = group.field(4);
        let local_order_code = parse_component(order_code_field, 1)?.unwrap_or_default();
        let order_display = parse_component(order_code_field, 2)?.unwrap_or_default();

        // Both resolutions run to completion regardless of outcome so their
        // `resolve_miss` calls always record into `ctx.unresolved` (spec
        // §4.4: misses accumulate across the whole message, not just up to
        // the first one that stops an OBR group from being emitted).
        let order_resolved = resolve_miss(
            store,
            ctx,
            "order-code-loinc",
            "OBR-4",
            &local_order_code,
            Some(order_display.clone()),
        )
        .await?;

        let status_raw = group.field(25);
        let status_resolved = if status_raw.is_empty() {
            None
        } else {
            resolve_miss(store, ctx, "obr-status", "OBR-25", status_raw, None).await?
        };

        // Built unconditionally: specimen construction does no store calls
        // and accumulates no misses, and the Observation loop below still
        // needs `specimen_ref` even when the OBR-level resolution fails.
        let specimen_build = match &group.spm_fields {
            Some(spm) => {
                let specimen_id = format!("{obr_id}-spm");
                let specimen_type = spm.get(4).cloned().unwrap_or_default();
                let type_code = parse_component(&specimen_type, 1)?.unwrap_or_default();
                let mut specimen = Specimen::builder().build()?;
                if !type_code.is_empty() {
                    specimen.r#type = Some(
                        CodeableConcept::builder()
                            .coding(vec![Some(Coding::builder().code(type_code).build()?)])
                            .build()?,
                    );
                }
                specimen.subject = Some(Reference::builder().reference(patient_ref_str.clone()).build()?);
                specimen.meta = Some(fhir_model::r4b::types::Meta::builder().tag(tags.to_vec()).build()?);
                let specimen_ref = super::local_ref(ResourceType::Specimen, &specimen_id);
                Some((specimen, specimen_id, specimen_ref))
            }
            None => None,
        };
        let specimen_ref = specimen_build.as_ref().map(|(_, _, r)| r.clone());

        // Runs unconditionally too, so `build_observation`'s own OBX-3/OBX-11
        // `resolve_miss` calls always execute; only the final push onto
        // `ctx` below is gated on the OBR-level resolution.
        let mut observations = Vec::new();
        for (idx, obx) in group.obx.iter().enumerate() {
            let obx_id = format!("{obr_id}-obx-{}", idx + 1);
            if let Some(observation) = build_observation(
                store,
                ctx,
                obx,
                &obx_id,
                &obr_id,
                &patient_ref_str,
                specimen_ref.as_deref(),
                &tags,
            )
            .await?
            {
                observations.push((obx_id, observation));
            }
        }

        let (Some(order_resolved), Some(status_resolved)) = (order_resolved, status_resolved) else {
            continue;
        };

        if let Some((specimen, specimen_id, _)) = specimen_build {
            ctx.push(put_entry(specimen, ResourceType::Specimen, &specimen_id)?);
        }

        let report_status = match status_resolved.code.as_str() {
            "registered" => DiagnosticReportStatus::Registered,
            "partial" => DiagnosticReportStatus::Partial,
            "preliminary" => DiagnosticReportStatus::Preliminary,
            "final" => DiagnosticReportStatus::Final,
            "amended" => DiagnosticReportStatus::Amended,
            "corrected" => DiagnosticReportStatus::Corrected,
            "appended" => DiagnosticReportStatus::Appended,
            "cancelled" => DiagnosticReportStatus::Cancelled,
            "entered-in-error" => DiagnosticReportStatus::EnteredInError,
            _ => DiagnosticReportStatus::Unknown,
        };

        let mut result_refs = Vec::new();
        for (obx_id, observation) in observations {
            result_refs.push(Some(Reference::builder().reference(super::local_ref(ResourceType::Observation, &obx_id)).build()?));
            ctx.push(put_entry(observation, ResourceType::Observation, &obx_id)?);
        }

        let mut report = DiagnosticReport::builder()
            .status(report_status)
            .code(
                CodeableConcept::builder()
                    .coding(vec![Some(
                        Coding::builder()
                            .system("http://loinc.org".to_string())
                            .code(order_resolved.code.clone())
                            .display(order_resolved.display.clone().unwrap_or_default())
                            .build()?,
                    )])
                    .build()?,
            )
            .subject(Reference::builder().reference(patient_ref_str.clone()).build()?)
            .build()?;
        report.result = result_refs;
        report.meta = Some(fhir_model::r4b::types::Meta::builder().tag(tags.to_vec()).build()?);

        ctx.push(put_entry(report, ResourceType::DiagnosticReport, &obr_id)?);
    }

    Ok(())
}

/// Resolves one local code, recording a miss on the context instead of
/// returning an error (spec §4.4). `local_system` here is the synthetic
/// per-field key used when the HL7v2 source has no embedded coding system.
async fn resolve_miss(
    store: &dyn crate::fhir_store::FhirStore,
    ctx: &mut ConversionContext,
    mapping_type: &str,
    local_system: &str,
    local_code: &str,
    local_display: Option<String>,
) -> Result<Option<mapping::ResolvedCode>, ConversionError> {
    let resolved = mapping::resolve_code(
        store,
        &ctx.sender.sending_application,
        &ctx.sender.sending_facility,
        mapping_type,
        local_system,
        local_code,
    )
    .await
    .map_err(|e| ConversionError::Other(e.into()))?;

    if resolved.is_none() {
        ctx.unresolved.push(CodeMappingMiss {
            local_code: local_code.to_string(),
            local_display,
            local_system: local_system.to_string(),
            mapping_type: mapping_type.to_string(),
        });
    }
    Ok(resolved)
}

async fn build_observation(
    store: &dyn crate::fhir_store::FhirStore,
    ctx: &mut ConversionContext,
    obx: &ObxEntry,
    obx_id: &str,
    obr_id: &str,
    patient_ref: &str,
    specimen_ref: Option<&str>,
    tags: &[Option<Coding>],
) -> Result<Option<Observation>, ConversionError> {
    let value_type = obx.field(2);
    let observation_field = obx.field(3);
    let local_obs_code = parse_component(observation_field, 1)?.unwrap_or_default();
    let obs_display = parse_component(observation_field, 2)?.unwrap_or_default();
    if local_obs_code.is_empty() {
        return Ok(None);
    }

    let Some(resolved_code) = resolve_miss(
        store,
        ctx,
        "observation-code-loinc",
        "OBX-3",
        &local_obs_code,
        Some(obs_display.clone()),
    )
    .await?
    else {
        return Ok(None);
    };

    let status_raw = obx.field(11);
    let status_resolved = if status_raw.is_empty() {
        None
    } else {
        resolve_miss(store, ctx, "obx-status", "OBX-11", status_raw, None).await?
    };
    let Some(status_resolved) = status_resolved else {
        return Ok(None);
    };

    let status = match status_resolved.code.as_str() {
        "registered" => ObservationStatus::Registered,
        "preliminary" => ObservationStatus::Preliminary,
        "final" => ObservationStatus::Final,
        "amended" => ObservationStatus::Amended,
        "corrected" => ObservationStatus::Corrected,
        "cancelled" => ObservationStatus::Cancelled,
        "entered-in-error" => ObservationStatus::EnteredInError,
        _ => ObservationStatus::Unknown,
    };

    let mut observation = Observation::builder()
        .status(status)
        .code(
            CodeableConcept::builder()
                .coding(vec![Some(
                    Coding::builder()
                        .system("http://loinc.org".to_string())
                        .code(resolved_code.code.clone())
                        .display(resolved_code.display.clone().unwrap_or_default())
                        .build()?,
                )])
                .build()?,
        )
        .subject(Reference::builder().reference(patient_ref.to_string()).build()?)
        .build()?;

    observation.part_of = vec![Some(
        Reference::builder().reference(super::local_ref(ResourceType::DiagnosticReport, obr_id)).build()?,
    )];

    if let Some(specimen_ref) = specimen_ref {
        observation.specimen = Some(Reference::builder().reference(specimen_ref.to_string()).build()?);
    }

    let raw_value = obx.field(5);
    observation.value = match value_type {
        "NM" => raw_value.parse::<f64>().ok().and_then(|v| {
            Quantity::builder().value(v).build().ok().map(ObservationValue::Quantity)
        }),
        "SN" => parse_structured_numeric(raw_value),
        "ST" => {
            if raw_value.is_empty() {
                None
            } else {
                Some(ObservationValue::String(raw_value.to_string()))
            }
        }
        _ => None,
    };

    let reference_range = obx.field(7);
    if !reference_range.is_empty() {
        let range = ObservationReferenceRange::builder().text(reference_range.to_string()).build()?;
        observation.reference_range = vec![Some(range)];
    }

    let interpretation = obx.field(8);
    if !interpretation.is_empty() {
        observation.interpretation = vec![Some(
            CodeableConcept::builder()
                .coding(vec![Some(
                    Coding::builder()
                        .system("http://terminology.hl7.org/CodeSystem/v2-0078".to_string())
                        .code(interpretation.to_string())
                        .build()?,
                )])
                .build()?,
        )];
    }

    let paragraphs = note_paragraphs(&obx.nte_texts);
    if !paragraphs.is_empty() {
        observation.note = paragraphs
            .into_iter()
            .map(|text| Annotation::builder().text(text).build().ok())
            .collect();
    }

    observation.meta = Some(fhir_model::r4b::types::Meta::builder().tag(tags.to_vec()).build()?);

    Ok(Some(observation))
}

/// `SN` (structured numeric) carries an optional comparator prefix, e.g.
/// `>^10` or `<=^3.5`; a bare `10` has none. The comparator component is
/// folded into the Quantity's text-like `comparator` field only when it is
/// one of the four values the HL7v2 table allows, otherwise the numeric
/// value alone is kept.
fn parse_structured_numeric(raw: &str) -> Option<ObservationValue> {
    let parts: Vec<&str> = raw.split('^').collect();
    let number = match parts.as_slice() {
        [_comparator, number] => *number,
        [number] => *number,
        _ => return None,
    };
    let value: f64 = number.parse().ok()?;
    let quantity = Quantity::builder().value(value).build().ok()?;
    Some(ObservationValue::Quantity(quantity))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::converter::{message_type_key, SenderContext};
    use crate::fhir_store::fake::InMemoryFhirStore;
    use serde_json::json;

    async fn seed_concept_map(store: &InMemoryFhirStore, id: &str, source: &str, code: &str, target_code: &str, display: &str) {
        store
            .seed(
                "ConceptMap",
                id,
                json!({
                    "resourceType": "ConceptMap",
                    "id": id,
                    "group": [{
                        "source": source,
                        "element": [{
                            "code": code,
                            "target": [{"code": target_code, "display": display, "equivalence": "equivalent"}]
                        }]
                    }]
                }),
            )
            .await;
    }

    fn sample_msg() -> String {
        "MSH|^~\\&|LAB|HOSP|REC|RECFAC|20240102030405||ORU^R01|MSG1|P|2.5\r\
PID|1||MRN123^^^HOSP^MR\r\
OBR|1|ORD1|FIL1|K^Potassium\r\
OBX|1|NM|K^Potassium||4.2|mmol/L|3.5-5.1|N|||F\r\
NTE|1||routine draw\r\
OBX|2|ST|NA^Sodium Note||see comment|||||F\r\
NTE|1||line one\r\
NTE|2||\r\
NTE|3||line two"
            .to_string()
    }

    #[tokio::test]
    async fn converts_obr_group_with_two_observations() {
        let raw = sample_msg();
        let msg = Message::parse_with_lenient_newlines(&raw, true).unwrap();
        let cfg = AppConfig::default();
        let store = InMemoryFhirStore::new();

        seed_concept_map(&store, "hl7v2-lab-hosp-order-code-loinc", "OBR-4", "K", "2823-3", "Potassium").await;
        seed_concept_map(&store, "hl7v2-lab-hosp-obr-status", "OBR-25", "F", "final", "Final").await;
        seed_concept_map(&store, "hl7v2-lab-hosp-observation-code-loinc", "OBX-3", "K", "2823-3", "Potassium").await;
        seed_concept_map(&store, "hl7v2-lab-hosp-obx-status", "OBX-11", "F", "final", "Final").await;

        let message_type = message_type_key(&msg).unwrap();
        let mut ctx = ConversionContext::new(
            SenderContext {
                sending_application: "LAB".to_string(),
                sending_facility: "HOSP".to_string(),
            },
            message_type,
            "MSG1".to_string(),
        );
        let registry = PreprocessorRegistry::default();

        convert(&raw, &msg, &cfg, &registry, &store, &mut ctx).await.unwrap();

        assert!(ctx.entries.iter().any(|e| e.request.as_ref().unwrap().url.starts_with("DiagnosticReport/")));
        // the second OBX (NA) has no ConceptMap seeded -> recorded as a miss, not emitted
        let obs_count = ctx
            .entries
            .iter()
            .filter(|e| e.request.as_ref().unwrap().url.starts_with("Observation/"))
            .count();
        assert_eq!(obs_count, 1);
        assert_eq!(ctx.unresolved.len(), 1);
        assert_eq!(ctx.unresolved[0].local_code, "NA");
    }

    #[tokio::test]
    async fn obr_level_miss_does_not_swallow_obx_level_miss() {
        // OBR-4 ("K") is unmapped AND the lone OBX-3 code ("NA") is also
        // unmapped, in the same group: both misses must be recorded, not
        // just the first one encountered.
        let raw = "MSH|^~\\&|LAB|HOSP|REC|RECFAC|20240102030405||ORU^R01|MSG1|P|2.5\r\
PID|1||MRN123^^^HOSP^MR\r\
OBR|1|ORD1|FIL1|K^Potassium\r\
OBX|1|ST|NA^Sodium Note||see comment|||||F"
            .to_string();
        let msg = Message::parse_with_lenient_newlines(&raw, true).unwrap();
        let cfg = AppConfig::default();
        let store = InMemoryFhirStore::new();

        seed_concept_map(&store, "hl7v2-lab-hosp-obr-status", "OBR-25", "F", "final", "Final").await;
        seed_concept_map(&store, "hl7v2-lab-hosp-obx-status", "OBX-11", "F", "final", "Final").await;
        // no ConceptMap seeded for OBR-4/K or OBX-3/NA

        let message_type = message_type_key(&msg).unwrap();
        let mut ctx = ConversionContext::new(
            SenderContext {
                sending_application: "LAB".to_string(),
                sending_facility: "HOSP".to_string(),
            },
            message_type,
            "MSG1".to_string(),
        );
        let registry = PreprocessorRegistry::default();

        convert(&raw, &msg, &cfg, &registry, &store, &mut ctx).await.unwrap();

        assert!(ctx.entries.is_empty());
        assert_eq!(ctx.unresolved.len(), 2);
        assert!(ctx.unresolved.iter().any(|m| m.local_code == "K" && m.local_system == "OBR-4"));
        assert!(ctx.unresolved.iter().any(|m| m.local_code == "NA" && m.local_system == "OBX-3"));
    }

    #[test]
    fn note_paragraphs_splits_on_empty_nte3() {
        let texts = vec!["line one".to_string(), "".to_string(), "line two".to_string()];
        assert_eq!(note_paragraphs(&texts), vec!["line one".to_string(), "line two".to_string()]);
    }

    #[test]
    fn structured_numeric_parses_value_with_comparator_prefix() {
        let value = parse_structured_numeric(">^10").unwrap();
        match value {
            ObservationValue::Quantity(q) => assert_eq!(q.value, Some(10.0)),
            _ => panic!("expected quantity"),
        }
    }
}
