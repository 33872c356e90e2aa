//! Outbound direction: FHIR `Invoice` → HL7v2 BAR message → delivery sink
//! (spec §4.8).

pub mod builder;
pub mod segments;
pub mod sender;
