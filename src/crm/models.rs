// ABOUTME: Raw upstream record and page types
// ABOUTME: Records are loosely typed JSON objects; the mapper normalizes them

use serde_json::{Map, Value};

/// One raw record as the CRM returned it: an attribute bag whose values may
/// be scalars, nested objects or arrays. Nothing is validated here; the
/// mapper decides what survives.
#[derive(Debug, Clone, PartialEq)]
pub struct SourceRecord {
    fields: Map<String, Value>,
}

impl SourceRecord {
    pub fn new(fields: Map<String, Value>) -> Self {
        Self { fields }
    }

    /// The raw identifier value, whatever type the upstream used.
    pub fn raw_id(&self) -> Option<&Value> {
        self.fields.get("id")
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.fields.get(key)
    }

    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.fields.keys().map(|k| k.as_str())
    }
}

/// One fetched page. An empty record list is the exhaustion signal; a short
/// page is not (the upstream pads pagination inconsistently, confirmed
/// against its list endpoint).
#[derive(Debug, Clone)]
pub struct Page {
    pub records: Vec<SourceRecord>,
    pub exhausted: bool,
}

impl Page {
    pub fn new(records: Vec<SourceRecord>) -> Self {
        let exhausted = records.is_empty();
        Self { records, exhausted }
    }
}

/// Pull the record list out of a response body.
///
/// The CRM is not consistent about its envelope: depending on endpoint and
/// tenant age the list arrives bare, or under "data", "records" or "leads".
pub fn extract_records(body: Value) -> Option<Vec<SourceRecord>> {
    let list = match body {
        Value::Array(items) => items,
        Value::Object(mut obj) => {
            let key = ["data", "records", "leads"]
                .iter()
                .copied()
                .find(|k| matches!(obj.get(*k), Some(Value::Array(_))))?;
            match obj.remove(key) {
                Some(Value::Array(items)) => items,
                _ => return None,
            }
        }
        _ => return None,
    };

    let mut records = Vec::with_capacity(list.len());
    for item in list {
        match item {
            Value::Object(fields) => records.push(SourceRecord::new(fields)),
            // Non-object entries are upstream garbage; the mapper would skip
            // them anyway, so drop them here.
            _ => continue,
        }
    }
    Some(records)
}

/// Extract a single record from a by-id lookup response.
///
/// The lookup endpoint wraps the record in the same envelopes as the list
/// endpoint, sometimes as a one-element array.
pub fn extract_single(body: Value) -> Option<SourceRecord> {
    match body {
        Value::Object(ref obj)
            if ["data", "records", "leads"]
                .iter()
                .any(|k| obj.contains_key(*k)) =>
        {
            extract_records(body).and_then(|mut r| {
                if r.is_empty() {
                    None
                } else {
                    Some(r.remove(0))
                }
            })
        }
        Value::Object(fields) => Some(SourceRecord::new(fields)),
        Value::Array(_) => extract_records(body).and_then(|mut r| {
            if r.is_empty() {
                None
            } else {
                Some(r.remove(0))
            }
        }),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_extract_records_from_data_envelope() {
        let body = json!({"data": [{"id": 1}, {"id": 2}]});
        let records = extract_records(body).unwrap();
        assert_eq!(records.len(), 2);
        assert_eq!(records[0].raw_id(), Some(&json!(1)));
    }

    #[test]
    fn test_extract_records_from_bare_array() {
        let body = json!([{"id": "7"}]);
        let records = extract_records(body).unwrap();
        assert_eq!(records.len(), 1);
    }

    #[test]
    fn test_extract_records_from_leads_envelope() {
        let body = json!({"leads": [{"id": 3}], "total": 1});
        let records = extract_records(body).unwrap();
        assert_eq!(records.len(), 1);
    }

    #[test]
    fn test_extract_records_rejects_scalar_body() {
        assert!(extract_records(json!("nope")).is_none());
        assert!(extract_records(json!({"data": "nope"})).is_none());
    }

    #[test]
    fn test_extract_records_drops_non_object_entries() {
        let body = json!({"records": [{"id": 1}, 42, null]});
        let records = extract_records(body).unwrap();
        assert_eq!(records.len(), 1);
    }

    #[test]
    fn test_empty_page_signals_exhaustion() {
        let page = Page::new(vec![]);
        assert!(page.exhausted);

        let page = Page::new(vec![SourceRecord::new(Map::new())]);
        assert!(!page.exhausted);
    }

    #[test]
    fn test_extract_single_unwraps_envelope() {
        let rec = extract_single(json!({"data": [{"id": 9}]})).unwrap();
        assert_eq!(rec.raw_id(), Some(&json!(9)));

        let rec = extract_single(json!({"id": 4, "name": "x"})).unwrap();
        assert_eq!(rec.raw_id(), Some(&json!(4)));

        assert!(extract_single(json!({"data": []})).is_none());
    }
}
