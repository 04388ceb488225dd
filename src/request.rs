//! Execution requests and their variable payloads.
//!
//! A batch arrives as a JSON array of request objects. Each element is
//! decoded on its own, so one malformed request fails only its own job. An
//! element is consumed by exactly one job, or forwarded exactly as received
//! when it overflows the local capacity and is handed to another invocation.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// One unit of work: run the primary module against a single account.
#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
pub struct ExecutionRequest {
    /// Target account identifier, combined with the configured role name to
    /// build the role ARN.
    #[serde(rename = "id")]
    pub account_id: String,
    /// Unique job name. Doubles as the working directory name and the state
    /// key.
    pub name: String,
    /// Revision (tag, branch, or commit) of the primary module.
    #[serde(rename = "version")]
    pub source_version: String,
    /// Log verbosity passed through to the tool as `TF_LOG`.
    #[serde(default)]
    pub log_level: String,
    /// Variables exported into the tool environment.
    #[serde(default)]
    pub variables: BTreeMap<String, VariableValue>,
}

/// A dynamically typed request variable.
///
/// Integers are tried before floats so `3` stays an integer and renders
/// without a decimal point. Arrays and `null` are not accepted; a request
/// carrying one is malformed.
#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
#[serde(untagged)]
pub enum VariableValue {
    /// Rendered as `true` or `false`.
    Bool(bool),
    /// Rendered in base 10.
    Integer(i64),
    /// Rendered with six fractional digits.
    Float(f64),
    /// Rendered verbatim.
    String(String),
    /// Rendered as compact JSON.
    Object(serde_json::Map<String, serde_json::Value>),
}

impl VariableValue {
    /// Renders the value the way it appears on the right-hand side of an
    /// environment entry.
    #[must_use]
    pub fn render(&self) -> String {
        match self {
            Self::Bool(value) => value.to_string(),
            Self::Integer(value) => value.to_string(),
            Self::Float(value) => format!("{value:.6}"),
            Self::String(value) => value.clone(),
            Self::Object(map) => serde_json::Value::Object(map.clone()).to_string(),
        }
    }
}

impl fmt::Display for VariableValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.render())
    }
}

impl ExecutionRequest {
    /// Checks that the request can safely name a working directory and a
    /// state key.
    ///
    /// # Errors
    ///
    /// Returns [`RequestError::Invalid`] when `id` or `name` is blank, or
    /// when `name` is not a single path component.
    pub fn validate(&self) -> Result<(), RequestError> {
        if self.account_id.trim().is_empty() {
            return Err(RequestError::Invalid {
                name: self.name.clone(),
                field: "id",
                reason: String::from("account identifier must not be empty"),
            });
        }
        if self.name.trim().is_empty() {
            return Err(RequestError::Invalid {
                name: self.name.clone(),
                field: "name",
                reason: String::from("job name must not be empty"),
            });
        }
        if self.name.contains(['/', '\\']) || self.name == "." || self.name == ".." {
            return Err(RequestError::Invalid {
                name: self.name.clone(),
                field: "name",
                reason: String::from("job name must be a single path component"),
            });
        }
        Ok(())
    }

    /// Flattens the variables into `(name, rendered value)` pairs, ordered by
    /// name.
    #[must_use]
    pub fn variable_entries(&self) -> Vec<(String, String)> {
        self.variables
            .iter()
            .map(|(key, value)| (key.clone(), value.render()))
            .collect()
    }
}

/// Errors raised while decoding, encoding, or validating requests.
#[derive(Debug, Error)]
pub enum RequestError {
    /// The batch payload is not a JSON array.
    #[error("failed to parse request batch: {0}")]
    Parse(#[source] serde_json::Error),
    /// The batch could not be re-encoded for hand-off.
    #[error("failed to encode request batch: {0}")]
    Encode(#[source] serde_json::Error),
    /// One element of the batch is not a well-formed request.
    #[error("malformed request `{label}`: {message}")]
    Malformed {
        /// Job name when present, otherwise the element's position.
        label: String,
        /// Decoder error.
        message: String,
    },
    /// An earlier request in the same batch uses the same job name.
    #[error("job name `{name}` is already used by an earlier request in the batch")]
    DuplicateName {
        /// Repeated job name.
        name: String,
    },
    /// A single request carries an unusable field.
    #[error("invalid request `{name}`: {field}: {reason}")]
    Invalid {
        /// Job name as received.
        name: String,
        /// Offending field.
        field: &'static str,
        /// Human-readable explanation.
        reason: String,
    },
}

/// One element of a batch: the JSON value as received and the request
/// decoded from it.
#[derive(Debug)]
pub struct BatchEntry {
    label: String,
    raw: serde_json::Value,
    decoded: Result<ExecutionRequest, RequestError>,
}

impl BatchEntry {
    /// Decodes the element at one-based `position`. A decoding failure is
    /// kept on the entry and reported when the entry is run.
    #[must_use]
    pub fn decode(position: usize, raw: serde_json::Value) -> Self {
        let label = raw
            .get("name")
            .and_then(serde_json::Value::as_str)
            .filter(|name| !name.trim().is_empty())
            .map_or_else(|| format!("request #{position}"), ToOwned::to_owned);
        let decoded =
            ExecutionRequest::deserialize(&raw).map_err(|err| RequestError::Malformed {
                label: label.clone(),
                message: err.to_string(),
            });
        Self {
            label,
            raw,
            decoded,
        }
    }

    /// Wraps a request built in process.
    ///
    /// # Errors
    ///
    /// Returns [`RequestError::Encode`] when the request cannot be
    /// represented as JSON.
    pub fn from_request(request: ExecutionRequest) -> Result<Self, RequestError> {
        let raw = serde_json::to_value(&request).map_err(RequestError::Encode)?;
        Ok(Self {
            label: request.name.clone(),
            raw,
            decoded: Ok(request),
        })
    }

    /// Job name used in logs and the batch report.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.label
    }

    /// The element exactly as received.
    #[must_use]
    pub const fn raw(&self) -> &serde_json::Value {
        &self.raw
    }

    /// The decoded request, unless the entry was rejected.
    #[must_use]
    pub fn request(&self) -> Option<&ExecutionRequest> {
        self.decoded.as_ref().ok()
    }

    /// Returns `true` when the entry repeats an earlier job name.
    #[must_use]
    pub const fn is_duplicate(&self) -> bool {
        matches!(self.decoded, Err(RequestError::DuplicateName { .. }))
    }

    /// Consumes the entry.
    ///
    /// # Errors
    ///
    /// Returns the [`RequestError`] that rejected the entry.
    pub fn into_request(self) -> Result<ExecutionRequest, RequestError> {
        self.decoded
    }
}

/// Rejects every request whose job name was already used earlier in
/// `entries`; the first occurrence keeps the name.
pub fn reject_duplicate_names(entries: &mut [BatchEntry]) {
    let mut seen = BTreeSet::new();
    for entry in &mut *entries {
        let Some(name) = entry.request().map(|request| request.name.clone()) else {
            continue;
        };
        if seen.contains(&name) {
            entry.decoded = Err(RequestError::DuplicateName { name });
        } else {
            seen.insert(name);
        }
    }
}

/// Decodes a batch payload.
///
/// # Errors
///
/// Returns [`RequestError::Parse`] when the payload is not a JSON array.
/// Malformed elements do not fail the batch; they are carried as rejected
/// entries.
pub fn parse_batch(payload: &[u8]) -> Result<Vec<BatchEntry>, RequestError> {
    let elements: Vec<serde_json::Value> =
        serde_json::from_slice(payload).map_err(RequestError::Parse)?;
    Ok(decode_elements(elements))
}

/// Decodes a batch that already arrived as a JSON value, such as a Lambda
/// event.
///
/// # Errors
///
/// Returns [`RequestError::Parse`] when `value` is not an array.
pub fn batch_from_value(value: serde_json::Value) -> Result<Vec<BatchEntry>, RequestError> {
    let elements: Vec<serde_json::Value> =
        serde_json::from_value(value).map_err(RequestError::Parse)?;
    Ok(decode_elements(elements))
}

fn decode_elements(elements: Vec<serde_json::Value>) -> Vec<BatchEntry> {
    elements
        .into_iter()
        .enumerate()
        .map(|(index, raw)| BatchEntry::decode(index + 1, raw))
        .collect()
}

/// Encodes entries in the same format [`parse_batch`] accepts, forwarding
/// each element as it was received.
///
/// # Errors
///
/// Returns [`RequestError::Encode`] when serialisation fails.
pub fn encode_batch(entries: &[BatchEntry]) -> Result<Vec<u8>, RequestError> {
    let elements: Vec<&serde_json::Value> = entries.iter().map(BatchEntry::raw).collect();
    serde_json::to_vec(&elements).map_err(RequestError::Encode)
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    fn request(name: &str) -> ExecutionRequest {
        ExecutionRequest {
            account_id: String::from("123456789012"),
            name: name.to_owned(),
            source_version: String::from("v1.0.0"),
            log_level: String::new(),
            variables: BTreeMap::new(),
        }
    }

    #[test]
    fn parse_batch_reads_documented_fields() {
        let payload = br#"[{"id":"123","name":"acct-1","version":"v1.0.0","log_level":"DEBUG",
            "variables":{"enabled":true,"count":3,"ratio":0.5,"label":"x","tags":{"a":"b"}}}]"#;

        let batch = parse_batch(payload).expect("batch should parse");
        let [entry] = batch.as_slice() else {
            panic!("expected one request, got {batch:?}");
        };
        let req = entry.request().expect("request should decode");

        assert_eq!(req.account_id, "123");
        assert_eq!(req.name, "acct-1");
        assert_eq!(req.source_version, "v1.0.0");
        assert_eq!(req.log_level, "DEBUG");
        assert_eq!(req.variables.get("enabled"), Some(&VariableValue::Bool(true)));
        assert_eq!(req.variables.get("count"), Some(&VariableValue::Integer(3)));
        assert_eq!(req.variables.get("ratio"), Some(&VariableValue::Float(0.5)));
        assert!(matches!(req.variables.get("tags"), Some(VariableValue::Object(_))));
    }

    #[test]
    fn parse_batch_defaults_optional_fields() {
        let batch = parse_batch(br#"[{"id":"1","name":"n","version":"main"}]"#)
            .expect("batch should parse");
        let req = batch
            .first()
            .and_then(BatchEntry::request)
            .expect("one request");
        assert!(req.log_level.is_empty());
        assert!(req.variables.is_empty());
    }

    #[rstest]
    #[case(br#"{"id":"1"}"#.as_slice())]
    #[case(br#"not json"#.as_slice())]
    #[case(br#"[{"id":"1"}"#.as_slice())]
    fn parse_batch_rejects_payloads_that_are_not_arrays(#[case] payload: &[u8]) {
        let err = parse_batch(payload).expect_err("payload should be rejected");
        assert!(matches!(err, RequestError::Parse(_)), "unexpected error: {err}");
    }

    #[rstest]
    #[case(r#"{"id":"1","name":"bad","version":"v","variables":{"list":[1,2]}}"#, "bad")]
    #[case(r#"{"id":"1","name":"bad","version":"v","variables":{"nothing":null}}"#, "bad")]
    #[case(r#"{"id":"1","version":"v"}"#, "request #2")]
    #[case(r#""just a string""#, "request #2")]
    fn malformed_element_is_rejected_alone(#[case] bad: &str, #[case] label: &str) {
        let payload = format!(r#"[{{"id":"1","name":"good","version":"v1"}},{bad}]"#);

        let batch = parse_batch(payload.as_bytes()).expect("batch should parse");

        let [good, rejected] = batch.as_slice() else {
            panic!("expected two entries, got {batch:?}");
        };
        assert_eq!(good.request().map(|req| req.name.as_str()), Some("good"));
        assert!(rejected.request().is_none());
        assert_eq!(rejected.name(), label);
    }

    #[test]
    fn rejected_element_reports_its_label() {
        let batch = parse_batch(
            br#"[{"id":"1","name":"acct-9","version":"v","variables":{"subnets":["a","b"]}}]"#,
        )
        .expect("batch should parse");
        let entry = batch.into_iter().next().expect("entry");

        let err = entry.into_request().expect_err("array variable is malformed");

        let RequestError::Malformed { label, .. } = err else {
            panic!("expected Malformed, got {err:?}");
        };
        assert_eq!(label, "acct-9");
    }

    #[test]
    fn encode_batch_forwards_elements_as_received() {
        let payload = br#"[{"id":"1","name":"n","version":"v","extra":"kept"},{"id":"2","variables":{"x":null}}]"#;
        let batch = parse_batch(payload).expect("batch should parse");

        let encoded = encode_batch(&batch).expect("encode");

        let original: serde_json::Value = serde_json::from_slice(payload).expect("json");
        let forwarded: serde_json::Value = serde_json::from_slice(&encoded).expect("json");
        assert_eq!(forwarded, original);
    }

    #[test]
    fn batch_from_value_accepts_event_arrays() {
        let event = serde_json::json!([{"id":"1","name":"n","version":"v"}]);
        let batch = batch_from_value(event).expect("array event");
        assert_eq!(batch.first().map(BatchEntry::name), Some("n"));

        let err = batch_from_value(serde_json::json!({"id":"1"})).expect_err("object event");
        assert!(matches!(err, RequestError::Parse(_)));
    }

    #[test]
    fn later_duplicate_names_are_rejected() {
        let mut batch = parse_batch(
            br#"[{"id":"1","name":"x","version":"v"},
                 {"id":"2","name":"y","version":"v"},
                 {"id":"3","name":"x","version":"v"}]"#,
        )
        .expect("batch should parse");

        reject_duplicate_names(&mut batch);

        let flags: Vec<bool> = batch.iter().map(BatchEntry::is_duplicate).collect();
        assert_eq!(flags, vec![false, false, true]);
        let first = batch.first().and_then(BatchEntry::request).expect("first kept");
        assert_eq!(first.account_id, "1");
        let last = batch.into_iter().last().expect("entry");
        assert!(matches!(
            last.into_request(),
            Err(RequestError::DuplicateName { ref name }) if name == "x"
        ));
    }

    #[rstest]
    #[case(VariableValue::Bool(false), "false")]
    #[case(VariableValue::Integer(-42), "-42")]
    #[case(VariableValue::Float(1.5), "1.500000")]
    #[case(VariableValue::String(String::from("a b=c")), "a b=c")]
    fn render_follows_tag_rules(#[case] value: VariableValue, #[case] expected: &str) {
        assert_eq!(value.render(), expected);
    }

    #[test]
    fn render_serialises_nested_objects() {
        let mut map = serde_json::Map::new();
        map.insert(String::from("k"), serde_json::Value::from(1));
        assert_eq!(VariableValue::Object(map).render(), r#"{"k":1}"#);
    }

    #[test]
    fn entry_from_request_round_trips_through_parse() {
        let mut req = request("acct-1");
        req.variables
            .insert(String::from("count"), VariableValue::Integer(3));
        let entry = BatchEntry::from_request(req.clone()).expect("entry");

        let encoded = encode_batch(std::slice::from_ref(&entry)).expect("encode");
        let decoded = parse_batch(&encoded).expect("decode");

        assert_eq!(
            decoded.first().and_then(BatchEntry::request),
            Some(&req)
        );
    }

    #[rstest]
    #[case("", "name")]
    #[case("../escape", "name")]
    #[case("a/b", "name")]
    #[case("..", "name")]
    fn validate_rejects_unsafe_names(#[case] name: &str, #[case] field: &str) {
        let err = request(name).validate().expect_err("name should be rejected");
        let RequestError::Invalid { field: actual, .. } = err else {
            panic!("expected Invalid, got {err:?}");
        };
        assert_eq!(actual, field);
    }

    #[test]
    fn validate_rejects_blank_account() {
        let mut req = request("ok");
        req.account_id = String::from("  ");
        assert!(matches!(
            req.validate(),
            Err(RequestError::Invalid { field: "id", .. })
        ));
    }
}
