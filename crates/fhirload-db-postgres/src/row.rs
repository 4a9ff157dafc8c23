//! Row preparation shared by the insert and COPY paths.

use chrono::{DateTime, SecondsFormat, Utc};
use fhirload_storage::Record;
use serde_json::{Map, Value};

/// Column list written by both write paths.
pub(crate) const COLUMNS: &str = "id, txid, created_at, updated_at, resource, status";

/// Returns the row id and the payload to store.
///
/// The payload gets the assigned id (a UUID when the record has none) and
/// `meta.versionId`/`meta.lastUpdated`; other `meta` fields are kept.
pub(crate) fn stamp(record: &Record, txid: i64, now: DateTime<Utc>) -> (String, Value) {
    let id = record
        .id()
        .map(str::to_string)
        .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());

    let mut resource = record.resource().clone();
    if let Value::Object(obj) = &mut resource {
        obj.insert("id".into(), Value::String(id.clone()));

        let meta = obj
            .entry("meta")
            .or_insert_with(|| Value::Object(Map::new()));
        if !meta.is_object() {
            *meta = Value::Object(Map::new());
        }
        if let Value::Object(meta) = meta {
            meta.insert("versionId".into(), Value::String(txid.to_string()));
            meta.insert(
                "lastUpdated".into(),
                Value::String(now.to_rfc3339_opts(SecondsFormat::Millis, true)),
            );
        }
    }

    (id, resource)
}

/// Appends `value` to `buf` escaped for the COPY text format.
fn push_escaped(buf: &mut Vec<u8>, value: &str) {
    for byte in value.bytes() {
        match byte {
            b'\\' => buf.extend_from_slice(b"\\\\"),
            b'\t' => buf.extend_from_slice(b"\\t"),
            b'\n' => buf.extend_from_slice(b"\\n"),
            b'\r' => buf.extend_from_slice(b"\\r"),
            other => buf.push(other),
        }
    }
}

/// Appends one COPY text-format line for [`COLUMNS`].
pub(crate) fn encode_copy_row(
    buf: &mut Vec<u8>,
    id: &str,
    txid: i64,
    now: DateTime<Utc>,
    resource: &Value,
) {
    let timestamp = now.to_rfc3339_opts(SecondsFormat::Micros, true);

    push_escaped(buf, id);
    buf.push(b'\t');
    buf.extend_from_slice(txid.to_string().as_bytes());
    buf.push(b'\t');
    buf.extend_from_slice(timestamp.as_bytes());
    buf.push(b'\t');
    buf.extend_from_slice(timestamp.as_bytes());
    buf.push(b'\t');
    push_escaped(buf, &resource.to_string());
    buf.extend_from_slice(b"\tcreated\n");
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use serde_json::json;

    fn fixed_now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 3, 1, 12, 30, 0).unwrap()
    }

    #[test]
    fn test_stamp_keeps_existing_id_and_meta() {
        let record = Record::from_value(json!({
            "resourceType": "Patient",
            "id": "pt-1",
            "meta": {"profile": ["http://example.org/p"]}
        }))
        .unwrap();

        let (id, resource) = stamp(&record, 42, fixed_now());

        assert_eq!(id, "pt-1");
        assert_eq!(resource["id"], "pt-1");
        assert_eq!(resource["meta"]["versionId"], "42");
        assert_eq!(resource["meta"]["lastUpdated"], "2024-03-01T12:30:00.000Z");
        assert_eq!(resource["meta"]["profile"][0], "http://example.org/p");
    }

    #[test]
    fn test_stamp_assigns_id() {
        let record = Record::from_value(json!({"resourceType": "Observation"})).unwrap();
        let (id, resource) = stamp(&record, 1, fixed_now());

        assert!(uuid::Uuid::parse_str(&id).is_ok());
        assert_eq!(resource["id"], id.as_str());
    }

    #[test]
    fn test_copy_row_escapes_payload() {
        let resource = json!({"resourceType": "Patient", "text": "a\\b\tc\nd"});
        let mut buf = Vec::new();
        encode_copy_row(&mut buf, "x\ty", 7, fixed_now(), &resource);

        let line = String::from_utf8(buf).unwrap();
        assert!(line.ends_with("\tcreated\n"));
        assert_eq!(line.matches('\n').count(), 1);

        let fields: Vec<&str> = line.trim_end_matches('\n').split('\t').collect();
        assert_eq!(fields.len(), 6);
        assert_eq!(fields[0], "x\\ty");
        assert_eq!(fields[1], "7");
        assert_eq!(fields[2], "2024-03-01T12:30:00.000000Z");
        // serde_json escapes the control characters itself; COPY then
        // doubles every backslash.
        assert!(fields[4].contains(r#"a\\\\b\\tc\\nd"#));
    }
}
