//! ORM_O01 converter (`SPEC_FULL.md` §4.3 expansion — not elaborated in the
//! distilled spec, grounded the same way the ORU_R01/ADT converters are).
//!
//! Each ORC/OBR pair yields one `ServiceRequest`. Id is OBR-2 (placer order
//! number), falling back to OBR-3. `.code` is resolved the same way as
//! OBR-4 elsewhere (`order-code-loinc`); `.status` is translated from ORC-5
//! via a fixed HL7 table 0038 mapping and checked against the validation
//! registry; `.intent` is always `order`.

use super::{
    kebab, message_tags, parse_component, put_entry, resolve_patient_ref, ConversionContext,
    ConversionError,
};
use crate::config::{AppConfig, PreprocessorRegistry};
use crate::mapping::{self, CodeMappingMiss};
use crate::validation::ValidationRegistry;
use fhir_model::r4b::codes::{RequestIntent, RequestStatus};
use fhir_model::r4b::resources::{ResourceType, ServiceRequest};
use fhir_model::r4b::types::{CodeableConcept, Coding, Reference};
use hl7_parser::Message;

struct OrderGroup {
    orc_fields: Vec<String>,
    obr_fields: Vec<String>,
}

impl OrderGroup {
    fn orc_field(&self, n: usize) -> &str {
        self.orc_fields.get(n).map(|s| s.as_str()).unwrap_or("")
    }

    fn obr_field(&self, n: usize) -> &str {
        self.obr_fields.get(n).map(|s| s.as_str()).unwrap_or("")
    }
}

fn split_fields(line: &str) -> Vec<String> {
    line.split('|').map(|s| s.to_string()).collect()
}

/// Pairs each ORC with the OBR immediately following it. `hl7-parser` only
/// returns the first match for a repeating segment, so ORM order groups are
/// located by scanning the original wire text directly (same approach as
/// the ADT repeating segments and the ORU OBR groups).
fn parse_order_groups(raw: &str) -> Vec<OrderGroup> {
    let mut groups = Vec::new();
    let mut pending_orc: Option<Vec<String>> = None;

    for line in raw.split(['\r', '\n']) {
        if line.starts_with("ORC|") {
            pending_orc = Some(split_fields(line));
        } else if line.starts_with("OBR|") {
            let orc_fields = pending_orc.take().unwrap_or_default();
            groups.push(OrderGroup {
                orc_fields,
                obr_fields: split_fields(line),
            });
        }
    }
    groups
}

/// HL7 table 0038 order-control-derived status, translated to FHIR's
/// `request-status` value set. Codes not in the fixed table translate to
/// `unknown` rather than failing the whole order.
fn translate_order_status(orc_status: &str) -> &'static str {
    match orc_status {
        "" => "unknown",
        "NW" | "SC" => "active",
        "HD" => "on-hold",
        "CA" | "DC" | "OD" => "revoked",
        "CM" => "completed",
        _ => "unknown",
    }
}

fn request_status_from_code(code: &str) -> RequestStatus {
    match code {
        "draft" => RequestStatus::Draft,
        "active" => RequestStatus::Active,
        "on-hold" => RequestStatus::OnHold,
        "revoked" => RequestStatus::Revoked,
        "completed" => RequestStatus::Completed,
        "entered-in-error" => RequestStatus::EnteredInError,
        _ => RequestStatus::Unknown,
    }
}

/// Converts one `ORM^O01` message (`SPEC_FULL.md` §4.3 expansion).
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
    let validation = ValidationRegistry::default();

    for group in parse_order_groups(raw) {
        let order_id_raw = {
            let placer = group.obr_field(2);
            if !placer.is_empty() {
                placer.to_string()
            } else {
                group.obr_field(3).to_string()
            }
        };
        if order_id_raw.is_empty() {
            continue;
        }
        let order_id = kebab(&order_id_raw);

        let order_code_field = group.obr_field(4);
        let local_order_code = parse_component(order_code_field, 1)?.unwrap_or_default();
        let order_display = parse_component(order_code_field, 2)?.unwrap_or_default();

        let resolved = mapping::resolve_code(
            store,
            &ctx.sender.sending_application,
            &ctx.sender.sending_facility,
            "order-code-loinc",
            "OBR-4",
            &local_order_code,
        )
        .await
        .map_err(|e| ConversionError::Other(e.into()))?;

        let Some(resolved) = resolved else {
            ctx.unresolved.push(CodeMappingMiss {
                local_code: local_order_code,
                local_display: Some(order_display),
                local_system: "OBR-4".to_string(),
                mapping_type: "order-code-loinc".to_string(),
            });
            continue;
        };

        let status_code = translate_order_status(group.orc_field(5));
        let outcome = validation.validate("servicerequest-status", status_code);
        let status = if outcome.valid {
            request_status_from_code(status_code)
        } else {
            RequestStatus::Unknown
        };

        let mut request = ServiceRequest::builder()
            .status(status)
            .intent(RequestIntent::Order)
            .code(
                CodeableConcept::builder()
                    .coding(vec![Some(
                        Coding::builder()
                            .system("http://loinc.org".to_string())
                            .code(resolved.code.clone())
                            .display(resolved.display.clone().unwrap_or_default())
                            .build()?,
                    )])
                    .build()?,
            )
            .subject(Reference::builder().reference(patient_ref_str.clone()).build()?)
            .build()?;

        request.meta = Some(fhir_model::r4b::types::Meta::builder().tag(tags.to_vec()).build()?);

        ctx.push(put_entry(request, ResourceType::ServiceRequest, &order_id)?);
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::converter::{message_type_key, SenderContext};
    use crate::fhir_store::fake::InMemoryFhirStore;
    use serde_json::json;

    fn sample_msg() -> String {
        "MSH|^~\\&|LAB|HOSP|REC|RECFAC|20240102030405||ORM^O01|MSG1|P|2.5\r\
PID|1||MRN123^^^HOSP^MR\r\
ORC|NW|ORD1\r\
OBR|1|ORD1|FIL1|K^Potassium"
            .to_string()
    }

    #[tokio::test]
    async fn converts_order_into_service_request() {
        let raw = sample_msg();
        let msg = Message::parse_with_lenient_newlines(&raw, true).unwrap();
        let cfg = AppConfig::default();
        let store = InMemoryFhirStore::new();
        store
            .seed(
                "ConceptMap",
                "hl7v2-lab-hosp-order-code-loinc",
                json!({
                    "resourceType": "ConceptMap",
                    "id": "hl7v2-lab-hosp-order-code-loinc",
                    "group": [{
                        "source": "OBR-4",
                        "element": [{
                            "code": "K",
                            "target": [{"code": "2823-3", "display": "Potassium", "equivalence": "equivalent"}]
                        }]
                    }]
                }),
            )
            .await;

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

        assert_eq!(ctx.entries.len(), 1);
        assert!(ctx.entries[0].request.as_ref().unwrap().url.starts_with("ServiceRequest/ord1"));
        assert!(ctx.unresolved.is_empty());
    }

    #[tokio::test]
    async fn records_miss_when_order_code_unmapped() {
        let raw = sample_msg();
        let msg = Message::parse_with_lenient_newlines(&raw, true).unwrap();
        let cfg = AppConfig::default();
        let store = InMemoryFhirStore::new();

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
        assert_eq!(ctx.unresolved.len(), 1);
        assert_eq!(ctx.unresolved[0].local_code, "K");
    }

    #[test]
    fn translates_known_order_control_codes() {
        assert_eq!(translate_order_status("NW"), "active");
        assert_eq!(translate_order_status("CA"), "revoked");
        assert_eq!(translate_order_status("CM"), "completed");
        assert_eq!(translate_order_status("XX"), "unknown");
    }
}
