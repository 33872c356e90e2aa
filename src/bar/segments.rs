//! HL7v2 BAR segment rendering (spec §4.8). Every helper reads its source
//! resource as plain JSON — the builder only ever extracts a handful of
//! scalar fields, so there is no value in pulling the full typed
//! `fhir-model` surface for resources the rest of the crate never
//! constructs (Invoice, Account, ChargeItem, Organization, Practitioner).

use serde_json::Value;

fn str_field<'a>(v: &'a Value, path: &[&str]) -> &'a str {
    let mut cur = v;
    for part in path {
        let next = match part.parse::<usize>() {
            Ok(idx) => cur.get(idx),
            Err(_) => cur.get(part),
        };
        match next {
            Some(n) => cur = n,
            None => return "",
        }
    }
    cur.as_str().unwrap_or("")
}

fn resource_id(v: &Value) -> &str {
    str_field(v, &["id"])
}

pub fn build_msh(
    sending_app: &str,
    sending_fac: &str,
    receiving_app: &str,
    receiving_fac: &str,
    timestamp: &str,
    trigger: &str,
    control_id: &str,
) -> String {
    format!("MSH|^~\\&|{sending_app}|{sending_fac}|{receiving_app}|{receiving_fac}|{timestamp}||BAR^{trigger}|{control_id}|P|2.5.1")
}

pub fn build_evn(trigger: &str, event_time: &str) -> String {
    format!("EVN|{trigger}|{event_time}")
}

pub fn build_pid(patient: &Value) -> String {
    let id = resource_id(patient);
    let family = str_field(patient, &["name", "0", "family"]);
    let given = patient
        .get("name")
        .and_then(|n| n.get(0))
        .and_then(|n| n.get("given"))
        .and_then(|g| g.get(0))
        .and_then(|g| g.as_str())
        .unwrap_or("");
    let birth_date = str_field(patient, &["birthDate"]).replace('-', "");
    let gender = str_field(patient, &["gender"]);
    format!("PID|1||{id}^^^FHIR_APP^MR||{family}^{given}||{birth_date}|{gender}")
}

pub fn build_pv1(encounter: &Value) -> String {
    let id = resource_id(encounter);
    format!("PV1|1||{id}")
}

pub fn build_dg1(condition: &Value, set_id: usize) -> String {
    let code = str_field(condition, &["code", "coding", "0", "code"]);
    let display = str_field(condition, &["code", "coding", "0", "display"]);
    format!("DG1|{set_id}||{code}^{display}")
}

pub fn build_pr1(procedure: &Value, set_id: usize) -> String {
    let code = str_field(procedure, &["code", "coding", "0", "code"]);
    let display = str_field(procedure, &["code", "coding", "0", "display"]);
    format!("PR1|{set_id}||{code}^{display}")
}

pub fn build_gt1(guarantor: &Value, set_id: usize) -> String {
    let id = resource_id(guarantor);
    let family = str_field(guarantor, &["name", "0", "family"]);
    format!("GT1|{set_id}|{id}|{family}")
}

pub fn build_in1(coverage: &Value, set_id: usize, payor: Option<&Value>) -> String {
    let id = resource_id(coverage);
    let plan = str_field(coverage, &["type", "coding", "0", "code"]);
    let payor_name = payor.map(|p| str_field(p, &["name"])).unwrap_or("");
    format!("IN1|{set_id}|{plan}|{id}|{payor_name}")
}
