//! Converter kernel (spec §4.3): per-message-type functions that walk a
//! parsed HL7v2 message and emit a FHIR transaction `Bundle` plus a status
//! update for the originating `IncomingHl7v2Message`.

pub mod adt;
pub mod orm;
pub mod oru;

use crate::identity::{self, IdentityError};
use crate::mapping::CodeMappingMiss;
use crate::queue::MessageUpdate;
use chrono::{Datelike, NaiveDate, NaiveDateTime, TimeZone};
use chrono_tz::Europe::Berlin;
use fhir_model::r4b::codes::HTTPVerb;
use fhir_model::r4b::resources::{Bundle, BundleEntry, BundleEntryRequest, Resource, ResourceType};
use fhir_model::time::{Month, OffsetDateTime};
use fhir_model::DateFormatError::InvalidDate;
use fhir_model::{time, Date, DateTime, Instant};
use hl7_parser::Message;
use std::fmt;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConversionError {
    #[error(transparent)]
    MessageAccess(#[from] MessageAccessError),
    #[error(transparent)]
    Builder(#[from] fhir_model::BuilderError),
    #[error(transparent)]
    Formatting(#[from] FormattingError),
    #[error(transparent)]
    Identity(#[from] IdentityError),
    #[error("{field} has unexpected content, expected {expected_value}")]
    MessageContentUnexpected {
        field: String,
        expected_value: String,
    },
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

#[derive(Debug, Error)]
pub enum FormattingError {
    #[error("failed to parse date/time field: {0}")]
    Parse(String),
    #[error(transparent)]
    ComponentRange(#[from] time::error::ComponentRange),
}

#[derive(Debug, Error)]
pub enum MessageAccessError {
    #[error("missing message segment {0}")]
    MissingSegment(String),
    #[error("missing message field {1}-{0}")]
    MissingField(String, String),
    #[error(transparent)]
    MessageType(#[from] MessageTypeError),
    #[error(transparent)]
    Parse(#[from] hl7_parser::parser::ParseError),
}

#[derive(Debug, Error)]
pub enum MessageTypeError {
    #[error("unsupported message type: {0}")]
    Unsupported(String),
    #[error("missing MSH-9 (message type)")]
    Missing,
}

/// `(sendingApplication, sendingFacility)` — keys every ConceptMap and Task
/// (spec §3 "Sender context").
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SenderContext {
    pub sending_application: String,
    pub sending_facility: String,
}

impl fmt::Display for SenderContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.sending_application, self.sending_facility)
    }
}

/// Output of a single converter invocation (spec §4.3).
pub struct ConversionResult {
    pub bundle: Bundle,
    pub update: MessageUpdate,
}

/// Accumulates fatal-vs-recoverable state while walking one message. If any
/// unmapped codes were recorded, the emitted bundle carries only mapping
/// Tasks (spec §4.4): the resource-bearing bundle entries collected so far
/// are discarded in favor of the task bundle built by the caller.
pub struct ConversionContext {
    pub sender: SenderContext,
    pub message_type: String,
    pub control_id: String,
    pub entries: Vec<BundleEntry>,
    pub unresolved: Vec<CodeMappingMiss>,
    pub patient_ref: Option<String>,
    pub warning: bool,
}

impl ConversionContext {
    pub fn new(sender: SenderContext, message_type: String, control_id: String) -> Self {
        ConversionContext {
            sender,
            message_type,
            control_id,
            entries: Vec::new(),
            unresolved: Vec::new(),
            patient_ref: None,
            warning: false,
        }
    }

    pub fn push(&mut self, entry: BundleEntry) {
        self.entries.push(entry);
    }
}

/// `{system: "message-id", code: MSH-10}` / `{system: "message-type", code: MSH-9}`
/// tags required on every ADT-emitted resource (spec §4.3 "ADT_A01/A08").
pub fn message_tags(control_id: &str, message_type: &str) -> Vec<Option<fhir_model::r4b::types::Coding>> {
    use fhir_model::r4b::types::Coding;
    vec![
        Coding::builder()
            .system("message-id".to_string())
            .code(control_id.to_string())
            .build()
            .ok(),
        Coding::builder()
            .system("message-type".to_string())
            .code(message_type.to_string())
            .build()
            .ok(),
    ]
}

pub fn message_trigger(msg: &Message) -> Result<(String, String), MessageAccessError> {
    let msh = msg
        .segment("MSH")
        .ok_or(MessageAccessError::MissingSegment("MSH".to_string()))?;
    let field9 = msh
        .field(9)
        .ok_or(MessageAccessError::MissingField("9".to_string(), "MSH".to_string()))?
        .raw_value();

    let code = crate::converter::parse_component(field9, 1)?.unwrap_or_default();
    let trigger = crate::converter::parse_component(field9, 2)?.unwrap_or_default();

    if code.is_empty() || trigger.is_empty() {
        return Err(MessageAccessError::MessageType(MessageTypeError::Missing));
    }

    Ok((code, trigger))
}

/// The router key used throughout the spec, e.g. `"ORU_R01"` (spec §2, §3).
pub fn message_type_key(msg: &Message) -> Result<String, MessageAccessError> {
    let (code, trigger) = message_trigger(msg)?;
    Ok(format!("{code}_{trigger}"))
}

pub fn required_field(msg: &Message, segment: &str, field: usize) -> Result<String, MessageAccessError> {
    parse_field(msg, segment, field)?.ok_or_else(|| {
        MessageAccessError::MissingField(field.to_string(), segment.to_string())
    })
}

pub fn parse_field(msg: &Message, segment: &str, field: usize) -> Result<Option<String>, MessageAccessError> {
    Ok(msg
        .segment(segment)
        .ok_or_else(|| MessageAccessError::MissingSegment(segment.to_string()))?
        .field(field)
        .map(|f| f.raw_value().to_string())
        .filter(|s| !s.is_empty()))
}

pub fn segment_present(msg: &Message, segment: &str) -> bool {
    msg.segment(segment).is_some()
}

pub fn parse_component(field: &str, component: usize) -> Result<Option<String>, hl7_parser::parser::ParseError> {
    Ok(hl7_parser::parser::parse_field(field)?
        .component(component)
        .map(|c| c.raw_value().to_string())
        .filter(|s| !s.is_empty()))
}

pub fn parse_subcomponents(field: &str, component: usize) -> Result<Option<Vec<String>>, hl7_parser::parser::ParseError> {
    Ok(hl7_parser::parser::parse_field(field)?.component(component).map(|c| {
        c.subcomponents
            .iter()
            .map(|s| s.raw_value().to_string())
            .filter(|s| !s.is_empty())
            .collect()
    }))
}

pub fn parse_date(input: &str) -> Result<Date, FormattingError> {
    let dt = NaiveDate::parse_and_remainder(input, "%Y%m%d")
        .map_err(|e| FormattingError::Parse(e.to_string()))?
        .0;
    let date = time::Date::from_calendar_date(
        dt.year(),
        Month::try_from(dt.month() as u8)?,
        dt.day() as u8,
    )?;
    Ok(Date::Date(date))
}

pub fn parse_datetime(input: &str) -> Result<DateTime, FormattingError> {
    let fmt = if input.len() >= 14 { "%Y%m%d%H%M%S" } else { "%Y%m%d%H%M" };
    let dt = NaiveDateTime::parse_from_str(input, fmt)
        .map_err(|e| FormattingError::Parse(e.to_string()))?;
    let dt_with_tz = Berlin
        .from_local_datetime(&dt)
        .earliest()
        .ok_or_else(|| FormattingError::Parse("ambiguous local time".to_string()))?;

    Ok(DateTime::DateTime(Instant(
        OffsetDateTime::from_unix_timestamp(dt_with_tz.timestamp())
            .map_err(|_| FormattingError::Parse(format!("invalid date: {InvalidDate:?}")))?,
    )))
}

pub fn kebab(input: &str) -> String {
    let mut out = String::with_capacity(input.len());
    let mut last_dash = false;
    for c in input.chars() {
        if c.is_alphanumeric() {
            out.push(c.to_ascii_lowercase());
            last_dash = false;
        } else if !last_dash && !out.is_empty() {
            out.push('-');
            last_dash = true;
        }
    }
    while out.ends_with('-') {
        out.pop();
    }
    out
}

/// Emits a PUT bundle entry keyed by the resource's deterministic id (spec
/// §4.3 "All ids are pure functions ... reprocessing yields an identical
/// Bundle").
pub fn put_entry<T>(resource: T, resource_type: ResourceType, id: &str) -> Result<BundleEntry, ConversionError>
where
    Resource: From<T>,
{
    Ok(BundleEntry::builder()
        .resource(Resource::from(resource))
        .request(
            BundleEntryRequest::builder()
                .method(HTTPVerb::Put)
                .url(format!("{resource_type}/{id}"))
                .build()?,
        )
        .build()?)
}

/// Builds a reference string to a resource that may not exist yet locally,
/// matching the `{Type}/{id}` shape used by `put_entry`.
pub fn local_ref(resource_type: ResourceType, id: &str) -> String {
    format!("{resource_type}/{id}")
}

pub fn resolve_patient_ref(
    msg: &Message,
    cfg: &crate::config::AppConfig,
    registry: &crate::config::PreprocessorRegistry,
    message_type: &str,
) -> Result<String, IdentityError> {
    identity::resolve_patient_id(msg, cfg, registry, message_type)
        .map(|id| local_ref(ResourceType::Patient, &id))
}
