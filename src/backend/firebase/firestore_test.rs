use time::macros::{date, datetime};

use super::*;

const DOC: &str = "projects/demo/databases/(default)/documents/users/u1";

fn document(fields: serde_json::Value) -> String {
    json!({
        "name": DOC,
        "fields": fields,
        "createTime": "2024-01-01T00:00:00.000001Z",
        "updateTime": "2024-01-02T00:00:00Z"
    })
    .to_string()
}

// =============================================================================
// encoding
// =============================================================================

#[test]
fn encode_fields_types_values() {
    let mut patch = ProfilePatch::new()
        .address("1 Main St")
        .birth_date(date!(1990 - 01 - 01));
    patch.age = Some(34);

    let fields = encode_fields(&patch);
    assert_eq!(fields["address"], json!({ "stringValue": "1 Main St" }));
    assert_eq!(fields["birthDate"], json!({ "stringValue": "1990-01-01" }));
    assert_eq!(fields["age"], json!({ "integerValue": "34" }));
    assert!(!fields.contains_key("displayName"));
}

#[test]
fn update_commit_stamps_updated_at_only() {
    let patch = ProfilePatch::new().display_name("Alice");
    let body = commit_body(DOC, "u1", &patch, WriteMode::Update);
    let write = &body["writes"][0];

    assert_eq!(write["update"]["name"], DOC);
    assert_eq!(write["updateMask"]["fieldPaths"], json!(["displayName"]));
    assert_eq!(write["currentDocument"]["exists"], true);
    assert_eq!(
        write["updateTransforms"],
        json!([{ "fieldPath": "updatedAt", "setToServerValue": "REQUEST_TIME" }])
    );
}

#[test]
fn create_commit_adds_uid_and_both_stamps() {
    let patch = ProfilePatch::new().address("a");
    let body = commit_body(DOC, "u1", &patch, WriteMode::Create);
    let write = &body["writes"][0];

    assert_eq!(write["update"]["fields"]["uid"], json!({ "stringValue": "u1" }));
    assert_eq!(write["updateMask"]["fieldPaths"], json!(["uid", "address"]));
    assert_eq!(write["currentDocument"]["exists"], false);
    assert_eq!(write["updateTransforms"][0]["fieldPath"], "createdAt");
    assert_eq!(write["updateTransforms"][1]["fieldPath"], "updatedAt");
}

#[test]
fn create_commit_keeps_existing_uid_once() {
    let mut patch = ProfilePatch::new();
    patch.uid = Some("u1".into());
    let body = commit_body(DOC, "u1", &patch, WriteMode::Create);
    assert_eq!(body["writes"][0]["updateMask"]["fieldPaths"], json!(["uid"]));
}

// =============================================================================
// decoding
// =============================================================================

#[test]
fn decode_full_document() {
    let json = document(json!({
        "uid": { "stringValue": "u1" },
        "email": { "stringValue": "alice@example.com" },
        "displayName": { "stringValue": "" },
        "photoURL": { "stringValue": "" },
        "address": { "stringValue": "1 Main St" },
        "birthDate": { "stringValue": "1990-01-01" },
        "age": { "integerValue": "34" },
        "createdAt": { "timestampValue": "2024-01-01T00:00:00Z" },
        "updatedAt": { "timestampValue": "2024-01-01T12:00:00Z" }
    }));
    let record = decode_document(&json).unwrap();

    assert_eq!(record.uid, "u1");
    assert_eq!(record.email, "alice@example.com");
    assert_eq!(record.display_name.as_deref(), Some(""));
    assert_eq!(record.address.as_deref(), Some("1 Main St"));
    assert_eq!(record.birth_date, Some(date!(1990 - 01 - 01)));
    assert_eq!(record.age, Some(34));
    assert_eq!(record.created_at, datetime!(2024-01-01 00:00 UTC));
    assert_eq!(record.updated_at, datetime!(2024-01-01 12:00 UTC));
}

#[test]
fn decode_falls_back_to_document_metadata() {
    let record = decode_document(&document(json!({}))).unwrap();
    assert_eq!(record.uid, "u1");
    assert_eq!(record.email, "");
    assert!(record.age.is_none());
    assert_eq!(record.updated_at, datetime!(2024-01-02 00:00 UTC));
    assert!(record.created_at < record.updated_at);
}

#[test]
fn decode_accepts_double_age_and_skips_bad_birth_date() {
    let json = document(json!({
        "age": { "doubleValue": 41.0 },
        "birthDate": { "stringValue": "not a date" }
    }));
    let record = decode_document(&json).unwrap();
    assert_eq!(record.age, Some(41));
    assert!(record.birth_date.is_none());
}

#[test]
fn decode_skips_malformed_and_out_of_range_age() {
    let record = decode_document(&document(json!({ "age": { "integerValue": "forty" } }))).unwrap();
    assert!(record.age.is_none());
    let record = decode_document(&document(json!({ "age": { "doubleValue": 1e12 } }))).unwrap();
    assert!(record.age.is_none());
}

#[test]
fn decode_without_any_timestamp_fails() {
    let json = json!({ "name": DOC, "fields": {} }).to_string();
    assert!(matches!(decode_document(&json), Err(StoreError::Decode(_))));
}

#[test]
fn decode_garbage_fails() {
    assert!(matches!(decode_document("nope"), Err(StoreError::Decode(_))));
}

// =============================================================================
// errors
// =============================================================================

fn error_body(code: u16, status: &str, message: &str) -> String {
    json!({ "error": { "code": code, "status": status, "message": message } }).to_string()
}

#[test]
fn maps_permission_and_auth_errors() {
    assert_eq!(
        error_from_response(403, &error_body(403, "PERMISSION_DENIED", "Missing or insufficient permissions.")),
        StoreError::PermissionDenied
    );
    assert_eq!(error_from_response(401, "unauthorized"), StoreError::Unauthenticated);
}

#[test]
fn maps_unavailable_as_retryable() {
    let err = error_from_response(503, &error_body(503, "UNAVAILABLE", "try later"));
    assert_eq!(err, StoreError::Unavailable("try later".into()));
    assert!(crate::error::ErrorCode::retryable(&err));
}

#[test]
fn not_found_and_already_exists_keep_status_code() {
    let err = error_from_response(404, &error_body(404, "NOT_FOUND", "No document to update"));
    assert!(matches!(err, StoreError::Backend { ref code, .. } if code == "NOT_FOUND"));
    let err = error_from_response(409, &error_body(409, "ALREADY_EXISTS", "Document already exists"));
    assert!(matches!(err, StoreError::Backend { ref code, .. } if code == "ALREADY_EXISTS"));
}

#[test]
fn unparseable_error_body_uses_http_status() {
    let err = error_from_response(500, "<html>");
    assert_eq!(err, StoreError::Backend { code: "500".into(), message: "<html>".into() });
}
