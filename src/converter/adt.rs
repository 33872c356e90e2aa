//! ADT_A01 / ADT_A08 converter (spec §4.3 "ADT_A01/A08").
//!
//! PID → Patient, PV1 → Encounter, DG1 → Condition, AL1 → AllergyIntolerance,
//! IN1 → Coverage, NK1 → RelatedPerson. Every emitted resource carries the
//! message-id/message-type tags. Missing PV1 is a `warning` when
//! `converter.PV1.required = false`, fatal otherwise.

use super::{
    kebab, message_tags, parse_component, parse_date, parse_field, put_entry, required_field,
    resolve_patient_ref, segment_present, ConversionContext, ConversionError, MessageAccessError,
};
use crate::config::{AppConfig, PreprocessorRegistry};
use crate::identity;
use crate::mapping;
use fhir_model::r4b::codes::{AdministrativeGender, EncounterStatus, IdentifierUse, RelatedPersonGender};
use fhir_model::r4b::resources::{
    AllergyIntolerance, Condition, Coverage, Encounter, Patient, RelatedPerson, ResourceType,
};
use fhir_model::r4b::types::{CodeableConcept, Coding, HumanName, Identifier, Period, Reference};
use hl7_parser::Message;

/// Collects every repeat of `segment` as its raw field-1..N strings, in
/// message order. `hl7-parser`'s `Message::segment` returns only the first
/// match, so repeating segments (DG1, AL1, IN1, NK1) are located by scanning
/// the original wire text directly.
fn repeating_fields(raw: &str, segment: &str, field: usize) -> Vec<String> {
    raw.split(['\r', '\n'])
        .filter(|line| line.starts_with(&format!("{segment}|")))
        .map(|line| line.split('|').nth(field).unwrap_or("").to_string())
        .collect()
}

/// Converts one `ADT^A01`/`ADT^A08` message (spec §4.3). `store` resolves
/// `patient-class` against the sender's ConceptMap when PV1 is present.
pub async fn convert(
    raw: &str,
    msg: &Message,
    cfg: &AppConfig,
    registry: &PreprocessorRegistry,
    store: &dyn crate::fhir_store::FhirStore,
    ctx: &mut ConversionContext,
) -> Result<(), ConversionError> {
    let patient_ref_str = resolve_patient_ref(msg, cfg, registry, &ctx.message_type)?;
    let patient_id = patient_ref_str
        .strip_prefix("Patient/")
        .unwrap_or(&patient_ref_str)
        .to_string();
    ctx.patient_ref = Some(patient_ref_str.clone());

    let tags = message_tags(&ctx.control_id, &ctx.message_type);
    let patient = map_patient(msg, &patient_id, &tags)?;
    ctx.push(put_entry(patient, ResourceType::Patient, &patient_id)?);

    if segment_present(msg, "PV1") {
        let encounter_id = encounter_id(msg)?;
        let patient_class = required_field(msg, "PV1", 2)?;
        let resolved = mapping::resolve_code(
            store,
            &ctx.sender.sending_application,
            &ctx.sender.sending_facility,
            "patient-class",
            "PV1-2",
            &patient_class,
        )
        .await
        .map_err(|e| ConversionError::Other(e.into()))?;

        match resolved {
            Some(resolved) => {
                let encounter = build_encounter(msg, &resolved, &patient_ref_str, &tags)?;
                ctx.push(put_entry(encounter, ResourceType::Encounter, &encounter_id)?);
            }
            None => ctx.unresolved.push(mapping::CodeMappingMiss {
                local_code: patient_class,
                local_display: None,
                local_system: "PV1-2".to_string(),
                mapping_type: "patient-class".to_string(),
            }),
        }
    } else if cfg.pv1_required(&ctx.message_type) {
        return Err(ConversionError::MessageAccess(MessageAccessError::MissingSegment(
            "PV1".to_string(),
        )));
    } else {
        ctx.warning = true;
    }

    for (idx, code) in repeating_fields(raw, "DG1", 3).into_iter().enumerate() {
        if code.is_empty() {
            continue;
        }
        let condition = map_condition(&code, &patient_ref_str, &tags)?;
        let id = format!("{patient_id}-dg1-{}", idx + 1);
        ctx.push(put_entry(condition, ResourceType::Condition, &id)?);
    }

    for (idx, code) in repeating_fields(raw, "AL1", 3).into_iter().enumerate() {
        if code.is_empty() {
            continue;
        }
        let allergy = map_allergy(&code, &patient_ref_str, &tags)?;
        let id = format!("{patient_id}-al1-{}", idx + 1);
        ctx.push(put_entry(allergy, ResourceType::AllergyIntolerance, &id)?);
    }

    let in1_plans = repeating_fields(raw, "IN1", 2);
    let in1_payors = repeating_fields(raw, "IN1", 4);
    for (idx, plan_id) in in1_plans.into_iter().enumerate() {
        if plan_id.is_empty() {
            continue;
        }
        let payor_name = in1_payors.get(idx).cloned().unwrap_or_default();
        let coverage = map_coverage(&plan_id, &payor_name, idx + 1, &patient_ref_str, &tags)?;
        let id = format!("{patient_id}-in1-{}", idx + 1);
        ctx.push(put_entry(coverage, ResourceType::Coverage, &id)?);
    }

    let nk1_names = repeating_fields(raw, "NK1", 2);
    let nk1_relationships = repeating_fields(raw, "NK1", 3);
    for (idx, name_field) in nk1_names.into_iter().enumerate() {
        if name_field.is_empty() {
            continue;
        }
        let relationship = nk1_relationships.get(idx).cloned().unwrap_or_default();
        let related = map_related_person(&name_field, &relationship, &tags)?;
        let id = format!("{patient_id}-nk1-{}", idx + 1);
        ctx.push(put_entry(related, ResourceType::RelatedPerson, &id)?);
    }

    Ok(())
}

fn map_patient(msg: &Message, patient_id: &str, tags: &[Option<Coding>]) -> Result<Patient, ConversionError> {
    let mut builder = Patient::builder().identifier(vec![Some(
        Identifier::builder()
            .r#use(IdentifierUse::Usual)
            .value(patient_id.to_string())
            .build()?,
    )]);

    if let Some(name_field) = parse_field(msg, "PID", 5)? {
        let family = parse_component(&name_field, 1)?;
        let given = parse_component(&name_field, 2)?;
        let mut name = HumanName::builder().build()?;
        name.family = family;
        name.given = given.map(|g| vec![Some(g)]).unwrap_or_default();
        builder = builder.name(vec![Some(name)]);
    }

    let mut patient = builder.build()?;
    patient.meta = Some(fhir_model::r4b::types::Meta::builder().tag(tags.to_vec()).build()?);

    if let Some(dob) = parse_field(msg, "PID", 7)? {
        patient.birth_date = Some(parse_date(&dob)?);
    }
    if let Some(gender) = parse_field(msg, "PID", 8)? {
        patient.gender = Some(match gender.as_str() {
            "F" => AdministrativeGender::Female,
            "M" => AdministrativeGender::Male,
            "O" => AdministrativeGender::Other,
            _ => AdministrativeGender::Unknown,
        });
    }

    Ok(patient)
}

fn encounter_id(msg: &Message) -> Result<String, ConversionError> {
    let visit_number = required_field(msg, "PV1", 19)?;
    Ok(kebab(&visit_number))
}

fn build_encounter(
    msg: &Message,
    resolved: &mapping::ResolvedCode,
    patient_ref: &str,
    tags: &[Option<Coding>],
) -> Result<Encounter, ConversionError> {
    let authority = identity::pv1_19_authority(msg)?;
    let visit_number = required_field(msg, "PV1", 19)?;

    let mut identifiers = vec![Some(
        Identifier::builder().r#use(IdentifierUse::Official).value(visit_number).build()?,
    )];
    if let Some(authority) = authority {
        identifiers.push(Some(Identifier::builder().assigner_string(authority).build()?));
    }

    let mut encounter = Encounter::builder()
        .status(EncounterStatus::InProgress)
        .class(
            Coding::builder()
                .system("http://terminology.hl7.org/CodeSystem/v3-ActCode".to_string())
                .code(resolved.code.clone())
                .display(resolved.display.clone().unwrap_or_default())
                .build()?,
        )
        .subject(Reference::builder().reference(patient_ref.to_string()).build()?)
        .identifier(identifiers)
        .build()?;

    encounter.meta = Some(fhir_model::r4b::types::Meta::builder().tag(tags.to_vec()).build()?);

    if let Some(admit_time) = parse_field(msg, "PV1", 44)? {
        let start = super::parse_datetime(&admit_time)?;
        encounter.period = Some(Period::builder().start(start).build()?);
    }

    Ok(encounter)
}

fn map_condition(code: &str, patient_ref: &str, tags: &[Option<Coding>]) -> Result<Condition, ConversionError> {
    let icd_code = parse_component(code, 1)?.unwrap_or_default();
    let display = parse_component(code, 2)?.unwrap_or_default();

    let mut condition = Condition::builder()
        .subject(Reference::builder().reference(patient_ref.to_string()).build()?)
        .code(
            CodeableConcept::builder()
                .coding(vec![Some(Coding::builder().code(icd_code).display(display).build()?)])
                .build()?,
        )
        .build()?;

    condition.clinical_status = Some(
        CodeableConcept::builder()
            .coding(vec![Some(
                Coding::builder()
                    .system("http://terminology.hl7.org/CodeSystem/condition-clinical".to_string())
                    .code("active".to_string())
                    .build()?,
            )])
            .build()?,
    );
    condition.meta = Some(fhir_model::r4b::types::Meta::builder().tag(tags.to_vec()).build()?);

    Ok(condition)
}

fn map_allergy(code: &str, patient_ref: &str, tags: &[Option<Coding>]) -> Result<AllergyIntolerance, ConversionError> {
    let allergen_code = parse_component(code, 1)?.unwrap_or_default();

    let mut allergy = AllergyIntolerance::builder()
        .patient(Reference::builder().reference(patient_ref.to_string()).build()?)
        .code(
            CodeableConcept::builder()
                .coding(vec![Some(Coding::builder().code(allergen_code).build()?)])
                .build()?,
        )
        .build()?;

    allergy.clinical_status = Some(
        CodeableConcept::builder()
            .coding(vec![Some(
                Coding::builder()
                    .system("http://terminology.hl7.org/CodeSystem/allergyintolerance-clinical".to_string())
                    .code("active".to_string())
                    .build()?,
            )])
            .build()?,
    );
    allergy.meta = Some(fhir_model::r4b::types::Meta::builder().tag(tags.to_vec()).build()?);

    Ok(allergy)
}

fn map_coverage(
    plan_id: &str,
    payor_name: &str,
    set_id: usize,
    patient_ref: &str,
    tags: &[Option<Coding>],
) -> Result<Coverage, ConversionError> {
    let mut coverage = Coverage::builder()
        .status("active".to_string())
        .beneficiary(Reference::builder().reference(patient_ref.to_string()).build()?)
        .payor(vec![Some(Reference::builder().display(payor_name.to_string()).build()?)])
        .build()?;

    coverage.order = Some(set_id as i32);
    coverage.identifier = vec![Some(Identifier::builder().value(plan_id.to_string()).build()?)];
    coverage.meta = Some(fhir_model::r4b::types::Meta::builder().tag(tags.to_vec()).build()?);

    Ok(coverage)
}

fn map_related_person(name_field: &str, relationship: &str, tags: &[Option<Coding>]) -> Result<RelatedPerson, ConversionError> {
    let mut name = HumanName::builder().build()?;
    name.family = parse_component(name_field, 1)?;
    name.given = parse_component(name_field, 2)?.map(|g| vec![Some(g)]).unwrap_or_default();

    let mut related = RelatedPerson::builder().name(vec![Some(name)]).build()?;
    if !relationship.is_empty() {
        related.relationship = vec![Some(
            CodeableConcept::builder()
                .coding(vec![Some(Coding::builder().code(relationship.to_string()).build()?)])
                .build()?,
        )];
    }
    related.gender = Some(RelatedPersonGender::Unknown);
    related.meta = Some(fhir_model::r4b::types::Meta::builder().tag(tags.to_vec()).build()?);

    Ok(related)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{AppConfig, PreprocessorRegistry};
    use crate::converter::{message_type_key, SenderContext};
    use crate::fhir_store::fake::InMemoryFhirStore;

    fn sample_msg() -> String {
        "MSH|^~\\&|LAB|HOSP|REC|RECFAC|20240102030405||ADT^A01|MSG1|P|2.5\r\
PID|1||MRN123^^^HOSP^MR||Doe^Jane||19800101|F\r\
PV1|1|I|||||||||||||||||VN001\r\
DG1|1||J45.9^Asthma\r\
AL1|1||PENICILLIN"
            .to_string()
    }

    #[tokio::test]
    async fn converts_patient_and_dg1_without_encounter_mapping() {
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

        // patient-class unmapped -> no Encounter entry, recorded as a miss instead;
        // Patient + DG1 + AL1 still staged normally.
        assert!(ctx.entries.iter().any(|e| e.request.as_ref().unwrap().url.starts_with("Patient/")));
        assert!(!ctx.entries.iter().any(|e| e.request.as_ref().unwrap().url.starts_with("Encounter/")));
        assert_eq!(ctx.unresolved.len(), 1);
        assert_eq!(ctx.unresolved[0].mapping_type, "patient-class");
        assert_eq!(ctx.unresolved[0].local_code, "I");
    }

    #[tokio::test]
    async fn fatal_when_pv1_required_but_missing() {
        let raw = "MSH|^~\\&|LAB|HOSP|REC|RECFAC|20240102030405||ADT^A01|MSG1|P|2.5\rPID|1||MRN123^^^HOSP^MR";
        let msg = Message::parse_with_lenient_newlines(raw, true).unwrap();
        let mut cfg = AppConfig::default();
        cfg.raw.messages.entry("ADT_A01".to_string()).or_default().converter.pv1.required = true;
        let store = InMemoryFhirStore::new();

        let mut ctx = ConversionContext::new(
            SenderContext {
                sending_application: "LAB".to_string(),
                sending_facility: "HOSP".to_string(),
            },
            "ADT_A01".to_string(),
            "MSG1".to_string(),
        );

        let registry = PreprocessorRegistry::default();
        let err = convert(raw, &msg, &cfg, &registry, &store, &mut ctx).await.unwrap_err();
        assert!(matches!(
            err,
            ConversionError::MessageAccess(MessageAccessError::MissingSegment(_))
        ));
    }
}
