//! Identity-system resolver (spec §4.5): computes `Patient.id` by walking an
//! ordered list of match rules against PID-3 repeats, after running a
//! preprocessor chain that may synthesize missing authority/segment data.

use crate::config::{AppConfig, MatchRule, PreprocessorRegistry};
use crate::converter::{kebab, parse_component, parse_field, MessageAccessError};
use hl7_parser::Message;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum IdentityError {
    #[error(transparent)]
    MessageAccess(#[from] MessageAccessError),
    #[error(transparent)]
    Parse(#[from] hl7_parser::parser::ParseError),
    #[error("no PID-3 repeat matched a configured rule, and no fallback identifier was present")]
    Unresolvable,
}

/// One repeat of PID-3, decomposed into the CX components the match rules
/// inspect (spec §4.5: CX.4 assigning authority, CX.5 identifier type).
#[derive(Debug, Clone)]
struct CxIdentifier {
    value: String,
    assigner: Option<String>,
    id_type: Option<String>,
}

fn parse_cx_repeats(field_value: &str) -> Result<Vec<CxIdentifier>, hl7_parser::parser::ParseError> {
    field_value
        .split('~')
        .filter(|r| !r.is_empty())
        .map(|repeat| {
            Ok(CxIdentifier {
                value: parse_component(repeat, 1)?.unwrap_or_default(),
                assigner: parse_component(repeat, 4)?,
                id_type: parse_component(repeat, 5)?,
            })
        })
        .collect()
}

/// Pure functions run over a segment before identity resolution (spec
/// §4.5 "Preprocessor chain"). New ids must be added to
/// `PreprocessorRegistry::default` or config validation rejects them.
fn apply_preprocessor(id: &str, msg: &Message, pid3_raw: &mut String) -> Result<(), IdentityError> {
    match id {
        "pid2-to-pid3" => {
            if pid3_raw.is_empty() {
                if let Some(pid2) = parse_field(msg, "PID", 2)? {
                    *pid3_raw = pid2;
                }
            }
        }
        "msh-authority-for-pv1-19" => {
            // Handled at PV1-19 resolution time for Encounter identity; a
            // no-op here since this resolver only computes Patient.id.
        }
        _ => {}
    }
    Ok(())
}

/// Injects `MSH-3-MSH-4` (sanitized) as the authority for PV1-19 when
/// CX.4 is empty, so Encounter ids carry provenance even from senders that
/// never populate authority fields (spec §4.5).
pub fn pv1_19_authority(msg: &Message) -> Result<Option<String>, IdentityError> {
    let pv1_19 = parse_field(msg, "PV1", 19)?;
    let Some(pv1_19) = pv1_19 else { return Ok(None) };

    let existing_authority = parse_component(&pv1_19, 4)?;
    if existing_authority.is_some() {
        return Ok(existing_authority);
    }

    let app = parse_field(msg, "MSH", 3)?.unwrap_or_default();
    let fac = parse_field(msg, "MSH", 4)?.unwrap_or_default();
    Ok(Some(format!("{}-{}", kebab(&app), kebab(&fac))))
}

fn rule_matches(rule: &MatchRule, repeat: &CxIdentifier, is_first: bool) -> bool {
    if rule.any {
        return is_first;
    }
    if let Some(assigner) = &rule.assigner {
        if repeat.assigner.as_deref() != Some(assigner.as_str()) {
            return false;
        }
    }
    if let Some(id_type) = &rule.r#type {
        if repeat.id_type.as_deref() != Some(id_type.as_str()) {
            return false;
        }
    }
    rule.assigner.is_some() || rule.r#type.is_some() || rule.any
}

fn rule_tag(rule: &MatchRule) -> String {
    match (&rule.assigner, &rule.r#type) {
        (Some(a), Some(t)) => kebab(&format!("{a}-{t}")),
        (Some(a), None) => kebab(a),
        (None, Some(t)) => kebab(t),
        (None, None) => "any".to_string(),
    }
}

/// Resolves `Patient.id` for a message (spec §4.5). Fatal when neither a
/// configured rule nor the PID-3.1/PID-2 fallback yields a value.
pub fn resolve_patient_id(
    msg: &Message,
    cfg: &AppConfig,
    _registry: &PreprocessorRegistry,
    message_type: &str,
) -> Result<String, IdentityError> {
    let mut pid3_raw = parse_field(msg, "PID", 3)?.unwrap_or_default();

    for id in cfg.preprocessors_for(message_type, "PID", "3") {
        apply_preprocessor(&id, msg, &mut pid3_raw)?;
    }

    let repeats = parse_cx_repeats(&pid3_raw)?;

    for rule in &cfg.raw.identity_system.patient.rules {
        for (idx, repeat) in repeats.iter().enumerate() {
            if rule_matches(rule, repeat, idx == 0) && !repeat.value.is_empty() {
                return Ok(format!("{}-{}", rule_tag(rule), kebab(&repeat.value)));
            }
        }
    }

    // fall through to PID-3.1 or PID-2 verbatim
    if let Some(first) = repeats.first() {
        if !first.value.is_empty() {
            return Ok(kebab(&first.value));
        }
    }
    if let Some(pid2) = parse_field(msg, "PID", 2)? {
        return Ok(kebab(&pid2));
    }

    Err(IdentityError::Unresolvable)
}
