// ABOUTME: Pure transform from raw CRM records to canonical warehouse rows
// ABOUTME: Field routing is a versioned data table, not key-name heuristics

use chrono::{DateTime, NaiveDate, NaiveDateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::crm::SourceRecord;

/// Normalized destination row. Optional columns are `None` (SQL NULL), never
/// an empty string.
#[derive(Debug, Clone, PartialEq)]
pub struct CanonicalRecord {
    pub id: i64,
    pub firstname: Option<String>,
    pub lastname: Option<String>,
    pub email: Option<String>,
    pub phone: Option<String>,
    pub company: Option<String>,
    pub stage: Option<String>,
    pub source: Option<String>,
    pub value: Option<f64>,
    pub created_at: Option<DateTime<Utc>>,
    pub updated_at: Option<DateTime<Utc>>,
    pub stage_entered_at: Option<DateTime<Utc>>,
    /// Wall-clock time of the mapping that produced this row.
    pub synced_at: DateTime<Utc>,
}

impl CanonicalRecord {
    fn empty(id: i64, synced_at: DateTime<Utc>) -> Self {
        Self {
            id,
            firstname: None,
            lastname: None,
            email: None,
            phone: None,
            company: None,
            stage: None,
            source: None,
            value: None,
            created_at: None,
            updated_at: None,
            stage_entered_at: None,
            synced_at,
        }
    }
}

/// Destination column a source field routes to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TargetColumn {
    Firstname,
    Lastname,
    /// A combined name; split on the first whitespace boundary.
    FullName,
    Email,
    Phone,
    Company,
    Stage,
    Source,
    Value,
    CreatedAt,
    UpdatedAt,
    StageEnteredAt,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FieldRule {
    /// Exact upstream key. No substring matching; a renamed custom field
    /// must show up as unmapped, not silently route to the wrong column.
    pub source: String,
    pub target: TargetColumn,
}

/// Versioned field-name-to-column table, maintained as data. Rules apply in
/// order; the first rule that fills a column wins.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FieldMap {
    pub version: u32,
    pub fields: Vec<FieldRule>,
}

impl Default for FieldMap {
    fn default() -> Self {
        let rule = |source: &str, target| FieldRule {
            source: source.to_string(),
            target,
        };
        Self {
            version: 2,
            fields: vec![
                rule("first_name", TargetColumn::Firstname),
                rule("last_name", TargetColumn::Lastname),
                rule("name", TargetColumn::FullName),
                rule("full_name", TargetColumn::FullName),
                rule("email", TargetColumn::Email),
                rule("phone", TargetColumn::Phone),
                rule("company", TargetColumn::Company),
                rule("stage", TargetColumn::Stage),
                rule("status", TargetColumn::Stage),
                rule("source", TargetColumn::Source),
                rule("value", TargetColumn::Value),
                rule("created_at", TargetColumn::CreatedAt),
                rule("date_created", TargetColumn::CreatedAt),
                rule("updated_at", TargetColumn::UpdatedAt),
                rule("date_updated", TargetColumn::UpdatedAt),
                rule("stage_entered_at", TargetColumn::StageEnteredAt),
            ],
        }
    }
}

impl FieldMap {
    /// Load an operator-maintained override from TOML.
    pub fn from_toml(contents: &str) -> anyhow::Result<Self> {
        let map: FieldMap = toml::from_str(contents)?;
        Ok(map)
    }

    /// Source keys this map knows nothing about. These are counted per batch
    /// as a diagnostic so a renamed CRM field shows up in the logs instead of
    /// silently vanishing.
    pub fn unmapped_fields<'r>(&self, record: &'r SourceRecord) -> Vec<&'r str> {
        record
            .keys()
            .filter(|k| *k != "id" && !self.fields.iter().any(|rule| rule.source == *k))
            .collect()
    }
}

/// Map one raw record to a canonical row.
///
/// Returns `None` when the identifying key is missing, non-numeric or
/// otherwise malformed; such records are skipped and counted, never retried.
/// Field-level problems (unparsable date, empty value) degrade to NULL
/// columns rather than failing the record.
pub fn map_record(
    map: &FieldMap,
    source: &SourceRecord,
    now: DateTime<Utc>,
) -> Option<CanonicalRecord> {
    let id = parse_id(source.raw_id()?)?;
    let mut row = CanonicalRecord::empty(id, now);

    for rule in &map.fields {
        let Some(value) = source.get(&rule.source) else {
            continue;
        };
        if value.is_null() {
            continue;
        }
        apply_rule(&mut row, rule.target, value);
    }

    Some(row)
}

fn apply_rule(row: &mut CanonicalRecord, target: TargetColumn, value: &Value) {
    match target {
        TargetColumn::Firstname => fill_string(&mut row.firstname, value),
        TargetColumn::Lastname => fill_string(&mut row.lastname, value),
        TargetColumn::FullName => {
            if row.firstname.is_none() && row.lastname.is_none() {
                if let Some(full) = as_clean_string(value) {
                    let (first, last) = split_full_name(&full);
                    row.firstname = first;
                    row.lastname = last;
                }
            }
        }
        TargetColumn::Email => fill_string(&mut row.email, value),
        TargetColumn::Phone => fill_string(&mut row.phone, value),
        TargetColumn::Company => fill_string(&mut row.company, value),
        TargetColumn::Stage => fill_string(&mut row.stage, value),
        TargetColumn::Source => fill_string(&mut row.source, value),
        TargetColumn::Value => {
            if row.value.is_none() {
                row.value = parse_number(value);
            }
        }
        TargetColumn::CreatedAt => fill_timestamp(&mut row.created_at, value),
        TargetColumn::UpdatedAt => fill_timestamp(&mut row.updated_at, value),
        TargetColumn::StageEnteredAt => fill_timestamp(&mut row.stage_entered_at, value),
    }
}

fn fill_string(slot: &mut Option<String>, value: &Value) {
    if slot.is_none() {
        *slot = as_clean_string(value);
    }
}

fn fill_timestamp(slot: &mut Option<DateTime<Utc>>, value: &Value) {
    if slot.is_none() {
        *slot = parse_timestamp(value);
    }
}

/// Parse the identifier: integer, or a string holding one. Floats, empty
/// strings, and anything else are malformed.
fn parse_id(value: &Value) -> Option<i64> {
    match value {
        Value::Number(n) => n.as_i64(),
        Value::String(s) => s.trim().parse::<i64>().ok(),
        _ => None,
    }
}

/// Scalar string for a mapped column. Nested objects and arrays are stored
/// as their JSON text; empty strings become `None`.
fn as_clean_string(value: &Value) -> Option<String> {
    let text = match value {
        Value::String(s) => s.trim().to_string(),
        Value::Number(n) => n.to_string(),
        Value::Bool(b) => b.to_string(),
        Value::Object(_) | Value::Array(_) => value.to_string(),
        Value::Null => return None,
    };
    if text.is_empty() {
        None
    } else {
        Some(text)
    }
}

fn parse_number(value: &Value) -> Option<f64> {
    match value {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse::<f64>().ok(),
        _ => None,
    }
}

/// Split a combined name on the first whitespace boundary: first token is
/// the first name, the joined remainder the last name.
pub fn split_full_name(full: &str) -> (Option<String>, Option<String>) {
    let mut parts = full.split_whitespace();
    let first = match parts.next() {
        Some(token) => token.to_string(),
        None => return (None, None),
    };
    let rest: Vec<&str> = parts.collect();
    let last = if rest.is_empty() {
        None
    } else {
        Some(rest.join(" "))
    };
    (Some(first), last)
}

/// Parse the date formats the CRM has been observed to emit. Failure is
/// `None`, never an error and never an invalid date value downstream.
pub fn parse_timestamp(value: &Value) -> Option<DateTime<Utc>> {
    match value {
        Value::String(s) => parse_timestamp_str(s.trim()),
        // Bare numbers are unix seconds
        Value::Number(n) => DateTime::from_timestamp(n.as_i64()?, 0),
        _ => None,
    }
}

fn parse_timestamp_str(s: &str) -> Option<DateTime<Utc>> {
    if s.is_empty() {
        return None;
    }
    if let Ok(ts) = DateTime::parse_from_rfc3339(s) {
        return Some(ts.with_timezone(&Utc));
    }
    for format in ["%Y-%m-%d %H:%M:%S", "%Y-%m-%dT%H:%M:%S"] {
        if let Ok(naive) = NaiveDateTime::parse_from_str(s, format) {
            return Some(naive.and_utc());
        }
    }
    if let Ok(date) = NaiveDate::parse_from_str(s, "%Y-%m-%d") {
        return Some(date.and_hms_opt(0, 0, 0)?.and_utc());
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::{json, Map};

    fn record(value: Value) -> SourceRecord {
        match value {
            Value::Object(fields) => SourceRecord::new(fields),
            _ => SourceRecord::new(Map::new()),
        }
    }

    fn now() -> DateTime<Utc> {
        Utc::now()
    }

    #[test]
    fn test_maps_basic_record() {
        let map = FieldMap::default();
        let source = record(json!({
            "id": 42,
            "email": "ana@example.com",
            "company": "Acme",
            "value": "1500.50",
            "created_at": "2024-03-01 10:30:00"
        }));

        let row = map_record(&map, &source, now()).unwrap();
        assert_eq!(row.id, 42);
        assert_eq!(row.email.as_deref(), Some("ana@example.com"));
        assert_eq!(row.company.as_deref(), Some("Acme"));
        assert_eq!(row.value, Some(1500.50));
        assert_eq!(
            row.created_at.unwrap(),
            NaiveDate::from_ymd_opt(2024, 3, 1)
                .unwrap()
                .and_hms_opt(10, 30, 0)
                .unwrap()
                .and_utc()
        );
    }

    #[test]
    fn test_missing_id_is_skipped() {
        let map = FieldMap::default();
        assert!(map_record(&map, &record(json!({"email": "x@y.z"})), now()).is_none());
    }

    #[test]
    fn test_non_numeric_id_is_skipped() {
        let map = FieldMap::default();
        assert!(map_record(&map, &record(json!({"id": "abc"})), now()).is_none());
        assert!(map_record(&map, &record(json!({"id": 1.5})), now()).is_none());
        assert!(map_record(&map, &record(json!({"id": null})), now()).is_none());
        assert!(map_record(&map, &record(json!({"id": [1]})), now()).is_none());
    }

    #[test]
    fn test_string_id_is_accepted() {
        let map = FieldMap::default();
        let row = map_record(&map, &record(json!({"id": " 77 "})), now()).unwrap();
        assert_eq!(row.id, 77);
    }

    #[test]
    fn test_full_name_splits_on_first_boundary() {
        let (first, last) = split_full_name("Ana Maria Souza");
        assert_eq!(first.as_deref(), Some("Ana"));
        assert_eq!(last.as_deref(), Some("Maria Souza"));

        let (first, last) = split_full_name("Ana");
        assert_eq!(first.as_deref(), Some("Ana"));
        assert_eq!(last, None);

        let (first, last) = split_full_name("");
        assert_eq!(first, None);
        assert_eq!(last, None);

        let (first, last) = split_full_name("   ");
        assert_eq!(first, None);
        assert_eq!(last, None);
    }

    #[test]
    fn test_full_name_field_routes_through_split() {
        let map = FieldMap::default();
        let row =
            map_record(&map, &record(json!({"id": 1, "name": "Ana Maria Souza"})), now()).unwrap();
        assert_eq!(row.firstname.as_deref(), Some("Ana"));
        assert_eq!(row.lastname.as_deref(), Some("Maria Souza"));
    }

    #[test]
    fn test_explicit_name_fields_beat_full_name() {
        let map = FieldMap::default();
        let row = map_record(
            &map,
            &record(json!({"id": 1, "first_name": "Bia", "name": "Ana Maria"})),
            now(),
        )
        .unwrap();
        // first_name rule ran first; FullName must not clobber it
        assert_eq!(row.firstname.as_deref(), Some("Bia"));
    }

    #[test]
    fn test_empty_string_becomes_null() {
        let map = FieldMap::default();
        let row = map_record(&map, &record(json!({"id": 1, "email": ""})), now()).unwrap();
        assert_eq!(row.email, None);
    }

    #[test]
    fn test_unparsable_date_becomes_null() {
        let map = FieldMap::default();
        let row = map_record(
            &map,
            &record(json!({"id": 1, "created_at": "next tuesday"})),
            now(),
        )
        .unwrap();
        assert_eq!(row.created_at, None);
    }

    #[test]
    fn test_timestamp_formats() {
        let rfc = parse_timestamp(&json!("2024-03-01T10:30:00Z")).unwrap();
        assert_eq!(rfc.timestamp(), 1709289000);

        let date_only = parse_timestamp(&json!("2024-03-01")).unwrap();
        assert_eq!(date_only.format("%H:%M:%S").to_string(), "00:00:00");

        let epoch = parse_timestamp(&json!(1709289000)).unwrap();
        assert_eq!(epoch, rfc);

        assert!(parse_timestamp(&json!("")).is_none());
        assert!(parse_timestamp(&json!(true)).is_none());
    }

    #[test]
    fn test_nested_values_serialize_to_json_text() {
        let map = FieldMap::default();
        let row = map_record(
            &map,
            &record(json!({"id": 1, "source": {"utm": "ads", "tags": [1, 2]}})),
            now(),
        )
        .unwrap();
        let text = row.source.unwrap();
        assert!(text.contains("\"utm\":\"ads\""));
    }

    #[test]
    fn test_synced_at_is_stamped() {
        let map = FieldMap::default();
        let stamp = now();
        let row = map_record(&map, &record(json!({"id": 1})), stamp).unwrap();
        assert_eq!(row.synced_at, stamp);
    }

    #[test]
    fn test_unmapped_fields_are_reported() {
        let map = FieldMap::default();
        let source = record(json!({"id": 1, "email": "a@b.c", "custom_field_93": "x"}));
        let unmapped = map.unmapped_fields(&source);
        assert_eq!(unmapped, vec!["custom_field_93"]);
    }

    #[test]
    fn test_field_map_from_toml() {
        let toml_src = r#"
            version = 3

            [[fields]]
            source = "lead_email"
            target = "email"

            [[fields]]
            source = "deal_stage_ts"
            target = "stage_entered_at"
        "#;
        let map = FieldMap::from_toml(toml_src).unwrap();
        assert_eq!(map.version, 3);
        assert_eq!(map.fields.len(), 2);
        assert_eq!(map.fields[1].target, TargetColumn::StageEnteredAt);
    }
}
