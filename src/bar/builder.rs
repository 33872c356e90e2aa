//! BAR builder poller (spec §4.8): turns one pending `Invoice` into an
//! `OutgoingBarMessage`.
//!
//! `Invoice.processingStatus` is tracked as a plain top-level field on the
//! opaque JSON resource rather than a proper FHIR extension, because the
//! search surface this crate's `FhirStore` exposes (`search_raw`, spec §6)
//! only matches flat dotted-path equality — the same simplification
//! `queue.rs` already makes for its own bespoke resources.

use super::segments::{build_dg1, build_evn, build_gt1, build_in1, build_msh, build_pid, build_pr1, build_pv1};
use crate::config::AppConfig;
use crate::fhir_store::{FhirStore, FhirStoreError};
use crate::processor::Tick;
use crate::queue::{OutgoingBarMessage, QueueStore};
use serde_json::{json, Value};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum BarBuildError {
    #[error(transparent)]
    Store(#[from] FhirStoreError),
    #[error(transparent)]
    Serde(#[from] serde_json::Error),
    #[error(transparent)]
    Queue(#[from] crate::queue::QueueError),
}

fn reference_id(v: &Value, path: &[&str]) -> Option<String> {
    let mut cur = v;
    for part in path {
        cur = match part.parse::<usize>() {
            Ok(idx) => cur.get(idx)?,
            Err(_) => cur.get(part)?,
        };
    }
    let ref_str = cur.as_str()?;
    ref_str.split('/').nth(1).map(str::to_string)
}

async fn fetch(store: &dyn FhirStore, resource_type: &str, id: &str) -> Result<Option<Value>, FhirStoreError> {
    Ok(store.get_raw(resource_type, id).await?.map(|f| f.resource))
}

/// BAR trigger event. Distinguishing P05 (update) from P01 (add) would
/// require tracking billing history the opaque store does not expose, so
/// the builder infers it from the account it just touched: a freshly
/// created minimal account is always P01; an existing account with a
/// `servicePeriod.end` is P06; anything else is treated as an update (P05).
enum BarTrigger {
    P01,
    P05,
    P06,
}

impl BarTrigger {
    fn code(&self) -> &'static str {
        match self {
            BarTrigger::P01 => "P01",
            BarTrigger::P05 => "P05",
            BarTrigger::P06 => "P06",
        }
    }
}

fn hl7_timestamp(value: Option<&str>) -> String {
    if let Some(v) = value {
        if let Ok(dt) = chrono::DateTime::parse_from_rfc3339(v) {
            return dt.format("%Y%m%d%H%M%S").to_string();
        }
        if let Ok(d) = chrono::NaiveDate::parse_from_str(v, "%Y-%m-%d") {
            return d.format("%Y%m%d000000").to_string();
        }
    }
    chrono::Utc::now().format("%Y%m%d%H%M%S").to_string()
}

// `Account.subject` is an array in FHIR R4, which `search_raw`'s flat
// dotted-path matcher cannot index into; a mirrored `subjectReference`
// scalar field makes the lookup searchable (same simplification as
// `Invoice.processingStatus`).
async fn find_or_create_account(store: &dyn FhirStore, invoice: &Value, patient_ref: &str) -> Result<(Value, BarTrigger), BarBuildError> {
    let invoice_id = invoice.get("id").and_then(|v| v.as_str()).unwrap_or_default();
    let matches = store.search_raw("Account", &format!("subjectReference={patient_ref}")).await?;

    if let Some(account) = matches.into_iter().next() {
        let trigger = if account.get("servicePeriod").and_then(|p| p.get("end")).is_some() {
            BarTrigger::P06
        } else {
            BarTrigger::P05
        };
        return Ok((account, trigger));
    }

    let account = json!({
        "resourceType": "Account",
        "id": invoice_id,
        "status": "active",
        "subject": [{"reference": patient_ref}],
        "subjectReference": patient_ref,
    });
    store.put_raw("Account", invoice_id, account.clone(), None, true).await?;
    Ok((account, BarTrigger::P01))
}

async fn charge_items_for_invoice(store: &dyn FhirStore, invoice: &Value) -> Result<Vec<Value>, FhirStoreError> {
    let mut items = Vec::new();
    let line_items = invoice.get("lineItem").and_then(|v| v.as_array()).cloned().unwrap_or_default();
    for line in line_items {
        if let Some(id) = reference_id(&line, &["chargeItemReference", "reference"]) {
            if let Some(item) = fetch(store, "ChargeItem", &id).await? {
                items.push(item);
            }
        }
    }
    Ok(items)
}

/// One build attempt. Returns `Tick::Idle` when there is no pending
/// invoice, `Tick::Processed` otherwise (success or terminal failure both
/// consume the invoice).
pub async fn build_one(store: &dyn FhirStore, cfg: &AppConfig) -> Result<Tick, BarBuildError> {
    let pending = store.search_raw("Invoice", "processingStatus=pending").await?;
    let Some(candidate) = pending.into_iter().min_by_key(|v| v.get("id").and_then(|i| i.as_str()).unwrap_or_default().to_string()) else {
        return Ok(Tick::Idle);
    };
    let invoice_id = candidate.get("id").and_then(|v| v.as_str()).unwrap_or_default().to_string();

    // re-fetch by id to capture the ETag `search_raw` doesn't carry, so the
    // completion/error write below can guard against a concurrent update.
    let fetched = store
        .get_raw("Invoice", &invoice_id)
        .await?
        .ok_or_else(|| BarBuildError::Store(FhirStoreError::NotFound(format!("Invoice/{invoice_id}"))))?;
    let invoice = fetched.resource;
    let etag = fetched.etag.as_deref();

    match build_for_invoice(store, cfg, &invoice).await {
        Ok(()) => {
            mark_invoice_completed(store, &invoice, etag).await?;
            Ok(Tick::Processed)
        }
        Err(e) => {
            mark_invoice_error(store, &invoice, etag, &e.to_string()).await?;
            Ok(Tick::Processed)
        }
    }
}

async fn build_for_invoice(store: &dyn FhirStore, cfg: &AppConfig, invoice: &Value) -> Result<(), BarBuildError> {
    let invoice_id = invoice.get("id").and_then(|v| v.as_str()).unwrap_or_default().to_string();
    let patient_ref = invoice
        .get("subject")
        .and_then(|s| s.get("reference"))
        .and_then(|r| r.as_str())
        .ok_or_else(|| BarBuildError::Store(FhirStoreError::NotFound("Invoice.subject".to_string())))?
        .to_string();
    let patient_id = patient_ref.split('/').nth(1).unwrap_or_default();
    let patient = fetch(store, "Patient", patient_id)
        .await?
        .ok_or_else(|| BarBuildError::Store(FhirStoreError::NotFound(patient_ref.clone())))?;

    let (account, trigger) = find_or_create_account(store, invoice, &patient_ref).await?;

    let charge_items = charge_items_for_invoice(store, invoice).await?;

    let mut encounter: Option<Value> = None;
    let mut procedures = Vec::new();
    for item in &charge_items {
        if encounter.is_none() {
            if let Some(enc_id) = reference_id(item, &["context", "reference"]) {
                encounter = fetch(store, "Encounter", &enc_id).await?;
            }
        }
        if let Some(proc_id) = reference_id(item, &["service", "0", "reference"]) {
            if let Some(procedure) = fetch(store, "Procedure", &proc_id).await? {
                procedures.push(procedure);
            }
        }
    }

    let conditions = store.search_raw("Condition", &format!("subject.reference={patient_ref}")).await?;

    let mut coverages = store.search_raw("Coverage", &format!("beneficiary.reference={patient_ref}")).await?;
    coverages.sort_by_key(|c| c.get("order").and_then(|o| o.as_i64()).unwrap_or(i64::MAX));

    let mut payors = Vec::new();
    for coverage in &coverages {
        if let Some(org_id) = reference_id(coverage, &["payor", "0", "reference"]) {
            payors.push(fetch(store, "Organization", &org_id).await?);
        } else {
            payors.push(None);
        }
    }

    let guarantors = account.get("guarantor").and_then(|g| g.as_array()).cloned().unwrap_or_default();
    let mut guarantor_resources = Vec::new();
    for guarantor in guarantors {
        if let Some(party_id) = reference_id(&guarantor, &["party", "reference"]) {
            if let Some(resource) = fetch(store, "Patient", &party_id).await? {
                guarantor_resources.push(resource);
            }
        }
    }

    let event_time = match trigger {
        BarTrigger::P01 => hl7_timestamp(account.get("servicePeriod").and_then(|p| p.get("start")).and_then(|v| v.as_str())),
        BarTrigger::P06 => hl7_timestamp(account.get("servicePeriod").and_then(|p| p.get("end")).and_then(|v| v.as_str())),
        BarTrigger::P05 => hl7_timestamp(None),
    };

    let mut segments = vec![
        build_msh(
            &cfg.fhir_app,
            &cfg.fhir_fac,
            &cfg.billing_app,
            &cfg.billing_fac,
            &hl7_timestamp(None),
            trigger.code(),
            &invoice_id,
        ),
        build_evn(trigger.code(), &event_time),
        build_pid(&patient),
    ];

    if let Some(encounter) = &encounter {
        segments.push(build_pv1(encounter));
    }
    for (i, condition) in conditions.iter().enumerate() {
        segments.push(build_dg1(condition, i + 1));
    }
    for (i, procedure) in procedures.iter().enumerate() {
        segments.push(build_pr1(procedure, i + 1));
    }
    for (i, guarantor) in guarantor_resources.iter().enumerate() {
        segments.push(build_gt1(guarantor, i + 1));
    }
    for (i, coverage) in coverages.iter().enumerate() {
        segments.push(build_in1(coverage, i + 1, payors.get(i).and_then(|p| p.as_ref())));
    }

    let message = segments.join("\r");

    let queue = QueueStore::new(store);
    queue
        .insert_outgoing(&OutgoingBarMessage {
            id: format!("{invoice_id}-bar"),
            resource_type: "OutgoingBarMessage".to_string(),
            version_id: None,
            status: crate::queue::BarStatus::Pending,
            hl7_message: message,
            source_invoice: format!("Invoice/{invoice_id}"),
            retry_count: 0,
            last_error: None,
        })
        .await?;

    Ok(())
}

async fn mark_invoice_completed(store: &dyn FhirStore, invoice: &Value, etag: Option<&str>) -> Result<(), BarBuildError> {
    let id = invoice.get("id").and_then(|v| v.as_str()).unwrap_or_default();
    let mut updated = invoice.clone();
    updated["processingStatus"] = json!("completed");
    updated["status"] = json!("issued");
    store.put_raw("Invoice", id, updated, etag, false).await?;
    Ok(())
}

async fn mark_invoice_error(store: &dyn FhirStore, invoice: &Value, etag: Option<&str>, reason: &str) -> Result<(), BarBuildError> {
    let id = invoice.get("id").and_then(|v| v.as_str()).unwrap_or_default();
    let mut updated = invoice.clone();
    updated["processingStatus"] = json!("error");
    updated["processingStatusReason"] = json!(reason);
    let retry = updated.get("retryCount").and_then(|v| v.as_u64()).unwrap_or(0) + 1;
    updated["retryCount"] = json!(retry);
    store.put_raw("Invoice", id, updated, etag, false).await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fhir_store::fake::InMemoryFhirStore;
    use serde_json::json;

    #[tokio::test]
    async fn builds_bar_message_and_completes_invoice() {
        let store = InMemoryFhirStore::new();
        let cfg = AppConfig::default();

        store
            .seed(
                "Invoice",
                "INV1",
                json!({
                    "resourceType": "Invoice",
                    "id": "INV1",
                    "processingStatus": "pending",
                    "subject": {"reference": "Patient/P1"},
                    "lineItem": [{"chargeItemReference": {"reference": "ChargeItem/CI1"}}],
                }),
            )
            .await;
        store
            .seed(
                "Patient",
                "P1",
                json!({"resourceType": "Patient", "id": "P1", "name": [{"family": "Doe", "given": ["Jane"]}]}),
            )
            .await;
        store
            .seed(
                "ChargeItem",
                "CI1",
                json!({
                    "resourceType": "ChargeItem",
                    "id": "CI1",
                    "context": {"reference": "Encounter/E1"},
                    "service": [{"reference": "Procedure/PR1"}],
                }),
            )
            .await;
        store
            .seed("Encounter", "E1", json!({"resourceType": "Encounter", "id": "E1"}))
            .await;
        store
            .seed(
                "Procedure",
                "PR1",
                json!({"resourceType": "Procedure", "id": "PR1", "code": {"coding": [{"code": "P1", "display": "Appendectomy"}]}}),
            )
            .await;

        let tick = build_one(&store, &cfg).await.unwrap();
        assert!(matches!(tick, Tick::Processed));

        let invoice = store.get("Invoice", "INV1").await.unwrap();
        assert_eq!(invoice["processingStatus"], json!("completed"));
        assert_eq!(invoice["status"], json!("issued"));

        let outgoing = store.get("OutgoingBarMessage", "INV1-bar").await.unwrap();
        let hl7 = outgoing["hl7Message"].as_str().unwrap();
        assert!(hl7.contains("BAR^P01"));
        assert!(hl7.contains("PV1|1||E1"));
        assert!(hl7.contains("PR1|1||P1^Appendectomy"));
    }

    #[tokio::test]
    async fn idle_when_no_pending_invoice() {
        let store = InMemoryFhirStore::new();
        let cfg = AppConfig::default();
        let tick = build_one(&store, &cfg).await.unwrap();
        assert!(matches!(tick, Tick::Idle));
    }

    #[tokio::test]
    async fn marks_invoice_error_when_patient_missing() {
        let store = InMemoryFhirStore::new();
        let cfg = AppConfig::default();
        store
            .seed(
                "Invoice",
                "INV2",
                json!({"resourceType": "Invoice", "id": "INV2", "processingStatus": "pending", "subject": {"reference": "Patient/GHOST"}}),
            )
            .await;

        let tick = build_one(&store, &cfg).await.unwrap();
        assert!(matches!(tick, Tick::Processed));

        let invoice = store.get("Invoice", "INV2").await.unwrap();
        assert_eq!(invoice["processingStatus"], json!("error"));
        assert_eq!(invoice["retryCount"], json!(1));
    }
}
