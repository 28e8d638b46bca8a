//! Firestore documents client implementing `ProfileStore`.
//!
//! Reads are a plain document GET (404 means absent). Writes go through
//! `documents:commit` so the merge and its server timestamps land in one
//! request: an update guarded by `exists: true` stamps `updatedAt`; when the
//! document is missing the write is retried as a create guarded by
//! `exists: false` that stamps `createdAt` too. A create that loses a race
//! falls back to the update once more.

use std::sync::Arc;

use serde_json::{Map, Value, json};
use time::OffsetDateTime;
use time::format_description::well_known::Rfc3339;
use tracing::{debug, warn};

use super::{FirebaseConfig, IdTokenSource, parse_api_error};
use crate::age::parse_birth_date;
use crate::profile::{ProfilePatch, ProfileRecord, ProfileStore, StoreError};

pub struct FirestoreProfiles {
    http: reqwest::Client,
    config: FirebaseConfig,
    tokens: Option<Arc<dyn IdTokenSource>>,
}

/// Whether a commit targets an existing document or creates one.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum WriteMode {
    Update,
    Create,
}

impl FirestoreProfiles {
    /// # Errors
    ///
    /// `Transport` if the HTTP client cannot be built.
    pub fn new(config: FirebaseConfig) -> Result<Self, StoreError> {
        let http = config
            .http_client()
            .map_err(|e| StoreError::Transport(e.to_string()))?;
        Ok(Self { http, config, tokens: None })
    }

    /// Authorize requests with the signed-in user's ID token.
    #[must_use]
    pub fn with_tokens(mut self, tokens: Arc<dyn IdTokenSource>) -> Self {
        self.tokens = Some(tokens);
        self
    }

    fn database(&self) -> String {
        format!("projects/{}/databases/(default)", self.config.project_id)
    }

    fn document_name(&self, uid: &str) -> String {
        format!("{}/documents/{}/{uid}", self.database(), self.config.collection)
    }

    async fn authorize(&self, request: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        let token = match &self.tokens {
            Some(tokens) => tokens.id_token().await,
            None => None,
        };
        match token {
            Some(token) => request.bearer_auth(token),
            None => request.query(&[("key", self.config.api_key.as_str())]),
        }
    }

    async fn commit(&self, uid: &str, patch: &ProfilePatch, mode: WriteMode) -> Result<(), StoreError> {
        let url = format!("{}/{}/documents:commit", self.config.firestore_url, self.database());
        let body = commit_body(&self.document_name(uid), uid, patch, mode);
        let request = self.authorize(self.http.post(&url)).await;
        let response = request.json(&body).send().await.map_err(transport)?;
        let status = response.status().as_u16();
        if status == 200 {
            return Ok(());
        }
        let text = response.text().await.map_err(transport)?;
        Err(error_from_response(status, &text))
    }
}

#[async_trait::async_trait]
impl ProfileStore for FirestoreProfiles {
    async fn read(&self, uid: &str) -> Result<Option<ProfileRecord>, StoreError> {
        let url = format!("{}/{}", self.config.firestore_url, self.document_name(uid));
        let request = self.authorize(self.http.get(&url)).await;
        let response = request.send().await.map_err(transport)?;
        let status = response.status().as_u16();
        let text = response.text().await.map_err(transport)?;
        match status {
            200 => decode_document(&text).map(Some),
            404 => Ok(None),
            _ => Err(error_from_response(status, &text)),
        }
    }

    async fn write_merge(&self, uid: &str, patch: &ProfilePatch) -> Result<(), StoreError> {
        match self.commit(uid, patch, WriteMode::Update).await {
            Err(StoreError::Backend { code, .. }) if code == "NOT_FOUND" => {
                debug!(uid, "profile document missing; creating");
                match self.commit(uid, patch, WriteMode::Create).await {
                    Err(StoreError::Backend { code, .. }) if code == "ALREADY_EXISTS" => {
                        debug!(uid, "profile document created concurrently; updating");
                        self.commit(uid, patch, WriteMode::Update).await
                    }
                    other => other,
                }
            }
            other => other,
        }
    }
}

fn transport(e: reqwest::Error) -> StoreError {
    StoreError::Transport(e.to_string())
}

// =============================================================================
// ENCODING
// =============================================================================

fn string_value(s: &str) -> Value {
    json!({ "stringValue": s })
}

/// Firestore typed fields for the values present in `patch`.
fn encode_fields(patch: &ProfilePatch) -> Map<String, Value> {
    let mut fields = Map::new();
    if let Some(uid) = patch.uid() {
        fields.insert("uid".into(), string_value(uid));
    }
    if let Some(email) = patch.email() {
        fields.insert("email".into(), string_value(email));
    }
    if let Some(name) = &patch.display_name {
        fields.insert("displayName".into(), string_value(name));
    }
    if let Some(photo) = &patch.photo_url {
        fields.insert("photoURL".into(), string_value(photo));
    }
    if let Some(address) = &patch.address {
        fields.insert("address".into(), string_value(address));
    }
    if let Some(birth_date) = patch.birth_date {
        let (year, month, day) = (birth_date.year(), u8::from(birth_date.month()), birth_date.day());
        fields.insert("birthDate".into(), string_value(&format!("{year:04}-{month:02}-{day:02}")));
    }
    if let Some(age) = patch.age() {
        fields.insert("age".into(), json!({ "integerValue": age.to_string() }));
    }
    fields
}

fn commit_body(document: &str, uid: &str, patch: &ProfilePatch, mode: WriteMode) -> Value {
    let mut fields = encode_fields(patch);
    let mut paths = patch.field_paths();
    if mode == WriteMode::Create && !fields.contains_key("uid") {
        fields.insert("uid".into(), string_value(uid));
        paths.insert(0, "uid");
    }

    let stamp = |path: &str| json!({ "fieldPath": path, "setToServerValue": "REQUEST_TIME" });
    let (exists, transforms) = match mode {
        WriteMode::Update => (true, vec![stamp("updatedAt")]),
        WriteMode::Create => (false, vec![stamp("createdAt"), stamp("updatedAt")]),
    };

    json!({
        "writes": [{
            "update": { "name": document, "fields": fields },
            "updateMask": { "fieldPaths": paths },
            "currentDocument": { "exists": exists },
            "updateTransforms": transforms,
        }]
    })
}

// =============================================================================
// DECODING
// =============================================================================

#[derive(serde::Deserialize)]
#[serde(rename_all = "camelCase")]
struct Document {
    name: String,
    #[serde(default)]
    fields: Map<String, Value>,
    create_time: Option<String>,
    update_time: Option<String>,
}

fn field_string(fields: &Map<String, Value>, key: &str) -> Option<String> {
    fields
        .get(key)?
        .get("stringValue")?
        .as_str()
        .map(str::to_owned)
}

fn field_integer(fields: &Map<String, Value>, key: &str) -> Option<i32> {
    let value = fields.get(key)?;
    if let Some(raw) = value.get("integerValue").and_then(Value::as_str) {
        return match raw.parse::<i32>() {
            Ok(n) => Some(n),
            Err(e) => {
                warn!(field = key, raw = %raw, error = %e, "ignoring unparseable integer field");
                None
            }
        };
    }
    let float = value.get("doubleValue").and_then(Value::as_f64)?;
    #[allow(clippy::cast_possible_truncation)]
    let whole = float.round() as i64;
    match i32::try_from(whole) {
        Ok(n) => Some(n),
        Err(e) => {
            warn!(field = key, value = float, error = %e, "ignoring out-of-range integer field");
            None
        }
    }
}

fn field_timestamp(fields: &Map<String, Value>, key: &str) -> Option<String> {
    fields
        .get(key)?
        .get("timestampValue")?
        .as_str()
        .map(str::to_owned)
}

fn parse_timestamp(raw: &str) -> Result<OffsetDateTime, StoreError> {
    OffsetDateTime::parse(raw, &Rfc3339).map_err(|e| StoreError::Decode(format!("timestamp {raw}: {e}")))
}

fn decode_document(json: &str) -> Result<ProfileRecord, StoreError> {
    let doc: Document = serde_json::from_str(json).map_err(|e| StoreError::Decode(e.to_string()))?;
    let fields = &doc.fields;

    let created_raw = field_timestamp(fields, "createdAt")
        .or(doc.create_time)
        .ok_or_else(|| StoreError::Decode(format!("{} has no createdAt", doc.name)))?;
    let updated_raw = field_timestamp(fields, "updatedAt")
        .or(doc.update_time)
        .unwrap_or_else(|| created_raw.clone());

    let uid = match field_string(fields, "uid") {
        Some(uid) => uid,
        None => doc
            .name
            .rsplit('/')
            .next()
            .unwrap_or_default()
            .to_owned(),
    };

    let birth_date = match field_string(fields, "birthDate") {
        Some(raw) if !raw.is_empty() => match parse_birth_date(&raw) {
            Ok(date) => Some(date),
            Err(e) => {
                warn!(uid = %uid, raw = %raw, error = %e, "ignoring unparseable birthDate");
                None
            }
        },
        _ => None,
    };

    Ok(ProfileRecord {
        email: field_string(fields, "email").unwrap_or_default(),
        display_name: field_string(fields, "displayName"),
        photo_url: field_string(fields, "photoURL"),
        address: field_string(fields, "address"),
        birth_date,
        age: field_integer(fields, "age"),
        created_at: parse_timestamp(&created_raw)?,
        updated_at: parse_timestamp(&updated_raw)?,
        uid,
    })
}

fn error_from_response(status: u16, body: &str) -> StoreError {
    let api = parse_api_error(body);
    let code = api
        .as_ref()
        .map(|e| e.status.clone())
        .unwrap_or_default();
    match (status, code.as_str()) {
        (_, "PERMISSION_DENIED") | (403, _) => StoreError::PermissionDenied,
        (_, "UNAUTHENTICATED") | (401, _) => StoreError::Unauthenticated,
        (_, "UNAVAILABLE" | "DEADLINE_EXCEEDED" | "RESOURCE_EXHAUSTED") | (429 | 503, _) => {
            StoreError::Unavailable(api.map(|e| e.message).unwrap_or_else(|| format!("HTTP {status}")))
        }
        _ => match api {
            Some(e) if !e.status.is_empty() => StoreError::Backend { code: e.status, message: e.message },
            Some(e) => StoreError::Backend { code: status.to_string(), message: e.message },
            None => StoreError::Backend { code: status.to_string(), message: body.chars().take(200).collect() },
        },
    }
}

#[cfg(test)]
#[path = "firestore_test.rs"]
mod tests;
