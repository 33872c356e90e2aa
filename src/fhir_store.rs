//! Thin client over the opaque FHIR HTTP store described in spec §6.
//!
//! The backend itself (persistence, transactional semantics, conditional
//! writes) is an external collaborator and out of scope; this module only
//! speaks the wire contract the core needs: conditional GET/PUT, transaction
//! POST, PATCH with a `Parameters` body, and the handful of search params
//! listed in spec §6.

use async_trait::async_trait;
use fhir_model::r4b::resources::{Bundle, Parameters, Resource};
use reqwest::header::{HeaderValue, IF_MATCH, IF_NONE_EXIST, IF_NONE_MATCH};
use reqwest::StatusCode;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum FhirStoreError {
    #[error("resource not found: {0}")]
    NotFound(String),
    #[error("conditional write rejected (etag mismatch): {0}")]
    PreconditionFailed(String),
    #[error(transparent)]
    Http(#[from] reqwest::Error),
    #[error("FHIR backend returned {0}: {1}")]
    Backend(StatusCode, String),
    #[error(transparent)]
    Serde(#[from] serde_json::Error),
}

/// A fetched resource paired with the ETag the backend returned, so callers
/// can round-trip it as `If-Match` on the next write (spec §4.7, §5).
#[derive(Debug, Clone)]
pub struct Fetched<T> {
    pub resource: T,
    pub etag: Option<String>,
}

/// Abstraction over the opaque FHIR HTTP backend. Kept as a trait so the
/// converter kernel, task coordinator, and BAR pollers never depend on a
/// concrete transport — tests substitute `fake::InMemoryFhirStore`.
#[async_trait]
pub trait FhirStore: Send + Sync {
    async fn get_raw(&self, resource_type: &str, id: &str) -> Result<Option<Fetched<serde_json::Value>>, FhirStoreError>;

    async fn put_raw(
        &self,
        resource_type: &str,
        id: &str,
        body: serde_json::Value,
        if_match: Option<&str>,
        if_none_match_create: bool,
    ) -> Result<Fetched<serde_json::Value>, FhirStoreError>;

    async fn search_raw(&self, resource_type: &str, query: &str) -> Result<Vec<serde_json::Value>, FhirStoreError>;

    async fn transaction(&self, bundle: &Bundle) -> Result<Bundle, FhirStoreError>;

    /// Raw-JSON counterpart to `transaction` for resources this crate keeps
    /// as opaque JSON (Task, ConceptMap) rather than typed `Resource`s.
    /// Each entry carries its own `request` object (`method`, `url`, and
    /// optionally `ifMatch`/`ifNoneMatch`) so conditional semantics survive
    /// being batched into one atomic submission (spec §4.7 step 7).
    async fn transaction_raw(&self, entries: Vec<serde_json::Value>) -> Result<Vec<serde_json::Value>, FhirStoreError>;

    async fn patch(
        &self,
        resource_type: &str,
        id: &str,
        params: &Parameters,
        if_match: Option<&str>,
    ) -> Result<(), FhirStoreError>;
}

pub struct HttpFhirStore {
    base_url: String,
    client: reqwest::Client,
}

impl HttpFhirStore {
    pub fn new(base_url: impl Into<String>) -> Self {
        HttpFhirStore {
            base_url: base_url.into(),
            client: reqwest::Client::new(),
        }
    }

    fn url(&self, path: &str) -> String {
        format!("{}/{}", self.base_url.trim_end_matches('/'), path)
    }
}

fn parse_etag(headers: &reqwest::header::HeaderMap) -> Option<String> {
    headers
        .get(reqwest::header::ETAG)
        .and_then(|v| v.to_str().ok())
        .map(|s| s.trim_matches('"').trim_start_matches("W/").trim_matches('"').to_string())
}

#[async_trait]
impl FhirStore for HttpFhirStore {
    async fn get_raw(&self, resource_type: &str, id: &str) -> Result<Option<Fetched<serde_json::Value>>, FhirStoreError> {
        let resp = self
            .client
            .get(self.url(&format!("{resource_type}/{id}")))
            .send()
            .await?;

        if resp.status() == StatusCode::NOT_FOUND || resp.status() == StatusCode::GONE {
            return Ok(None);
        }
        if !resp.status().is_success() {
            let status = resp.status();
            let body = resp.text().await.unwrap_or_default();
            return Err(FhirStoreError::Backend(status, body));
        }

        let etag = parse_etag(resp.headers());
        let resource: serde_json::Value = resp.json().await?;
        Ok(Some(Fetched { resource, etag }))
    }

    async fn put_raw(
        &self,
        resource_type: &str,
        id: &str,
        body: serde_json::Value,
        if_match: Option<&str>,
        if_none_match_create: bool,
    ) -> Result<Fetched<serde_json::Value>, FhirStoreError> {
        let mut req = self.client.put(self.url(&format!("{resource_type}/{id}"))).json(&body);

        if let Some(etag) = if_match {
            req = req.header(IF_MATCH, HeaderValue::from_str(&format!("W/\"{etag}\""))
                .map_err(|_| FhirStoreError::PreconditionFailed(etag.to_string()))?);
        } else if if_none_match_create {
            req = req.header(IF_NONE_MATCH, HeaderValue::from_static("*"));
        }

        let resp = req.send().await?;

        if resp.status() == StatusCode::PRECONDITION_FAILED {
            return Err(FhirStoreError::PreconditionFailed(format!("{resource_type}/{id}")));
        }
        if !resp.status().is_success() {
            let status = resp.status();
            let body = resp.text().await.unwrap_or_default();
            return Err(FhirStoreError::Backend(status, body));
        }

        let etag = parse_etag(resp.headers());
        let resource: serde_json::Value = resp.json().await?;
        Ok(Fetched { resource, etag })
    }

    async fn search_raw(&self, resource_type: &str, query: &str) -> Result<Vec<serde_json::Value>, FhirStoreError> {
        let resp = self
            .client
            .get(self.url(&format!("{resource_type}?{query}")))
            .send()
            .await?;

        if !resp.status().is_success() {
            let status = resp.status();
            let body = resp.text().await.unwrap_or_default();
            return Err(FhirStoreError::Backend(status, body));
        }

        let bundle: Bundle = resp.json().await?;
        Ok(bundle
            .entry
            .into_iter()
            .flatten()
            .filter_map(|e| e.resource)
            .map(|r| serde_json::to_value(Resource::from(r)))
            .collect::<Result<Vec<_>, _>>()?)
    }

    async fn transaction(&self, bundle: &Bundle) -> Result<Bundle, FhirStoreError> {
        let resp = self.client.post(self.url("")).json(bundle).send().await?;

        if !resp.status().is_success() {
            let status = resp.status();
            let body = resp.text().await.unwrap_or_default();
            return Err(FhirStoreError::Backend(status, body));
        }

        Ok(resp.json().await?)
    }

    async fn transaction_raw(&self, entries: Vec<serde_json::Value>) -> Result<Vec<serde_json::Value>, FhirStoreError> {
        let body = serde_json::json!({
            "resourceType": "Bundle",
            "type": "transaction",
            "entry": entries,
        });
        let resp = self.client.post(self.url("")).json(&body).send().await?;

        if !resp.status().is_success() {
            let status = resp.status();
            let text = resp.text().await.unwrap_or_default();
            return Err(FhirStoreError::Backend(status, text));
        }

        let response: serde_json::Value = resp.json().await?;
        Ok(response
            .get("entry")
            .and_then(|e| e.as_array())
            .cloned()
            .unwrap_or_default()
            .into_iter()
            .filter_map(|e| e.get("resource").cloned())
            .collect())
    }

    async fn patch(
        &self,
        resource_type: &str,
        id: &str,
        params: &Parameters,
        if_match: Option<&str>,
    ) -> Result<(), FhirStoreError> {
        let mut req = self
            .client
            .patch(self.url(&format!("{resource_type}/{id}")))
            .json(params);

        if let Some(etag) = if_match {
            req = req.header(IF_MATCH, HeaderValue::from_str(&format!("W/\"{etag}\""))
                .map_err(|_| FhirStoreError::PreconditionFailed(etag.to_string()))?);
        }
        // kept for backends that key conditional PATCH off If-None-Exist too
        let _ = IF_NONE_EXIST;

        let resp = req.send().await?;
        if resp.status() == StatusCode::PRECONDITION_FAILED {
            return Err(FhirStoreError::PreconditionFailed(format!("{resource_type}/{id}")));
        }
        if !resp.status().is_success() {
            let status = resp.status();
            let body = resp.text().await.unwrap_or_default();
            return Err(FhirStoreError::Backend(status, body));
        }
        Ok(())
    }
}

#[cfg(test)]
pub mod fake {
    use super::*;
    use std::collections::HashMap;
    use tokio::sync::Mutex;

    /// In-memory `FhirStore` used by unit tests across the crate. Mirrors
    /// the real backend's conditional-write semantics closely enough to
    /// exercise the task coordinator and converter kernel without a server.
    #[derive(Default)]
    pub struct InMemoryFhirStore {
        data: Mutex<HashMap<String, (serde_json::Value, u64)>>,
    }

    impl InMemoryFhirStore {
        pub fn new() -> Self {
            Self::default()
        }

        pub async fn seed(&self, resource_type: &str, id: &str, value: serde_json::Value) {
            let mut data = self.data.lock().await;
            data.insert(format!("{resource_type}/{id}"), (value, 1));
        }

        pub async fn get(&self, resource_type: &str, id: &str) -> Option<serde_json::Value> {
            self.data
                .lock()
                .await
                .get(&format!("{resource_type}/{id}"))
                .map(|(v, _)| v.clone())
        }
    }

    #[async_trait]
    impl FhirStore for InMemoryFhirStore {
        async fn get_raw(&self, resource_type: &str, id: &str) -> Result<Option<Fetched<serde_json::Value>>, FhirStoreError> {
            let data = self.data.lock().await;
            Ok(data
                .get(&format!("{resource_type}/{id}"))
                .map(|(v, version)| Fetched {
                    resource: v.clone(),
                    etag: Some(version.to_string()),
                }))
        }

        async fn put_raw(
            &self,
            resource_type: &str,
            id: &str,
            body: serde_json::Value,
            if_match: Option<&str>,
            if_none_match_create: bool,
        ) -> Result<Fetched<serde_json::Value>, FhirStoreError> {
            let mut data = self.data.lock().await;
            let key = format!("{resource_type}/{id}");
            let existing = data.get(&key);

            if if_none_match_create && existing.is_some() {
                return Err(FhirStoreError::PreconditionFailed(key));
            }
            if let Some(expected) = if_match {
                match existing {
                    Some((_, version)) if version.to_string() == expected => {}
                    _ => return Err(FhirStoreError::PreconditionFailed(key)),
                }
            }

            let next_version = existing.map(|(_, v)| v + 1).unwrap_or(1);
            data.insert(key, (body.clone(), next_version));

            Ok(Fetched {
                resource: body,
                etag: Some(next_version.to_string()),
            })
        }

        async fn search_raw(&self, resource_type: &str, query: &str) -> Result<Vec<serde_json::Value>, FhirStoreError> {
            let data = self.data.lock().await;
            let prefix = format!("{resource_type}/");

            // extremely small fake: supports `field=value` equality against a
            // top-level or dotted JSON-pointer-ish path used by this crate's tests.
            let (field, value) = query
                .split_once('=')
                .ok_or_else(|| FhirStoreError::Backend(StatusCode::BAD_REQUEST, query.to_string()))?;

            let path = resolve_search_path(field);
            Ok(data
                .iter()
                .filter(|(k, _)| k.starts_with(&prefix))
                .filter(|(_, (v, _))| matches_path(v, &path, value))
                .map(|(_, (v, _))| v.clone())
                .collect())
        }

        async fn transaction(&self, bundle: &Bundle) -> Result<Bundle, FhirStoreError> {
            // the fake does not attempt true atomicity; callers that need to
            // assert atomicity use `put_raw` directly in their test setup.
            for entry in bundle.entry.iter().flatten() {
                let Some(resource) = &entry.resource else { continue };
                let request = entry.request.as_ref();
                let url = request.map(|r| r.url.clone()).unwrap_or_default();
                let resource_type = Resource::from(resource.clone()).resource_type().to_string();
                let id = url.split('/').nth(1).unwrap_or_default().to_string();
                let value = serde_json::to_value(resource.clone())?;
                self.put_raw(&resource_type, &id, value, None, false).await?;
            }
            Ok(bundle.clone())
        }

        async fn transaction_raw(&self, entries: Vec<serde_json::Value>) -> Result<Vec<serde_json::Value>, FhirStoreError> {
            // same caveat as `transaction`: the fake applies entries in order
            // rather than as one atomic commit.
            let mut results = Vec::new();
            for entry in entries {
                let Some(resource) = entry.get("resource").cloned() else { continue };
                let request = entry.get("request");
                let url = request.and_then(|r| r.get("url")).and_then(|u| u.as_str()).unwrap_or_default();
                let mut parts = url.splitn(2, '/');
                let resource_type = parts.next().unwrap_or_default();
                let id = parts.next().unwrap_or_default();
                let if_match = request.and_then(|r| r.get("ifMatch")).and_then(|v| v.as_str());
                let if_none_match_create = request.and_then(|r| r.get("ifNoneMatch")).is_some();
                let fetched = self.put_raw(resource_type, id, resource, if_match, if_none_match_create).await?;
                results.push(fetched.resource);
            }
            Ok(results)
        }

        async fn patch(
            &self,
            _resource_type: &str,
            _id: &str,
            _params: &Parameters,
            _if_match: Option<&str>,
        ) -> Result<(), FhirStoreError> {
            Ok(())
        }
    }

    /// Translates a search-param name into the JSON path the fake should
    /// walk. Most params are a flat dotted path onto the resource itself;
    /// `unmapped-task` is synthetic (not a real FHIR search param) and
    /// stands in for querying inside the `unmappedCodes` array.
    fn resolve_search_path(field: &str) -> Vec<&str> {
        match field {
            "unmapped-task" => vec!["unmappedCodes", "mappingTask"],
            other => other.split('.').collect(),
        }
    }

    /// Walks `path` against `v`, transparently flattening any array
    /// encountered along the way (`cur.get(head)` can't index into one) so a
    /// path segment like `mappingTask` matches any element of an array of
    /// `{mappingTask: ...}` objects rather than only a top-level scalar.
    fn matches_path(v: &serde_json::Value, path: &[&str], value: &str) -> bool {
        if let serde_json::Value::Array(items) = v {
            return items.iter().any(|item| matches_path(item, path, value));
        }
        match path.split_first() {
            Some((head, rest)) => match v.get(head) {
                Some(next) => matches_path(next, rest, value),
                None => false,
            },
            None => v.as_str() == Some(value),
        }
    }
}
