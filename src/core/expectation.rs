//! Purpose: Data model for ordered request expectations and the requests matched against them.
//! Exports: `ExpectedRequest`, `Multiplicity`, `BodyMatcher`, `BodyPredicate`, `CannedResponse`,
//!          `ReceivedRequest`, `Mismatch`, `expect`.
//! Role: Pure matching logic; the queue and HTTP layers build on top of it.
//! Invariants: Method comparison is case-insensitive; paths and query params compare exactly.
//! Invariants: Wire format (serde) is the admin side-channel contract; `Custom` never crosses it.
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// How many inbound requests one queued expectation may absorb.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Multiplicity {
    /// Exactly one request.
    #[default]
    Once,
    /// One or more requests; stays at the head until something else arrives.
    AtLeastOnce,
    /// Zero or more requests.
    Any,
}

impl Multiplicity {
    fn is_once(&self) -> bool {
        matches!(self, Multiplicity::Once)
    }
}

/// Caller-supplied predicate over the decoded request body. In-process only.
#[derive(Clone)]
pub struct BodyPredicate {
    name: String,
    check: Arc<dyn Fn(&Value) -> bool + Send + Sync>,
}

impl BodyPredicate {
    pub fn new(
        name: impl Into<String>,
        check: impl Fn(&Value) -> bool + Send + Sync + 'static,
    ) -> Self {
        Self {
            name: name.into(),
            check: Arc::new(check),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }
}

impl fmt::Debug for BodyPredicate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BodyPredicate")
            .field("name", &self.name)
            .finish()
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BodyMatcher {
    Exact(Value),
    /// Every key of the pattern must be present with a matching value, recursively.
    Subset(Value),
    #[serde(skip)]
    Custom(BodyPredicate),
}

impl BodyMatcher {
    pub fn custom(
        name: impl Into<String>,
        check: impl Fn(&Value) -> bool + Send + Sync + 'static,
    ) -> Self {
        BodyMatcher::Custom(BodyPredicate::new(name, check))
    }

    pub fn matches(&self, body: &Value) -> bool {
        match self {
            BodyMatcher::Exact(expected) => expected == body,
            BodyMatcher::Subset(pattern) => json_subset(pattern, body),
            BodyMatcher::Custom(predicate) => (predicate.check)(body),
        }
    }

    pub fn is_transmissible(&self) -> bool {
        !matches!(self, BodyMatcher::Custom(_))
    }
}

impl fmt::Display for BodyMatcher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BodyMatcher::Exact(value) => write!(f, "body == {value}"),
            BodyMatcher::Subset(value) => write!(f, "body ⊇ {value}"),
            BodyMatcher::Custom(predicate) => write!(f, "body satisfies {}", predicate.name),
        }
    }
}

fn json_subset(pattern: &Value, actual: &Value) -> bool {
    match (pattern, actual) {
        (Value::Object(expected), Value::Object(actual)) => expected.iter().all(|(key, value)| {
            actual
                .get(key)
                .is_some_and(|candidate| json_subset(value, candidate))
        }),
        (Value::Array(expected), Value::Array(actual)) => {
            expected.len() == actual.len()
                && expected
                    .iter()
                    .zip(actual.iter())
                    .all(|(value, candidate)| json_subset(value, candidate))
        }
        _ => pattern == actual,
    }
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct CannedResponse {
    pub status: u16,
    pub body: Option<Value>,
}

fn default_status() -> u16 {
    200
}

fn is_default_status(status: &u16) -> bool {
    *status == 200
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ExpectedRequest {
    pub method: String,
    pub path: String,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub params: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub body: Option<BodyMatcher>,
    #[serde(default, skip_serializing_if = "Multiplicity::is_once")]
    pub multiple: Multiplicity,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub response: Option<Value>,
    #[serde(default = "default_status", skip_serializing_if = "is_default_status")]
    pub response_status: u16,
}

/// Shorthand for `ExpectedRequest::new`.
pub fn expect(method: &str, path: &str) -> ExpectedRequest {
    ExpectedRequest::new(method, path)
}

impl ExpectedRequest {
    pub fn new(method: &str, path: &str) -> Self {
        Self {
            method: method.to_ascii_uppercase(),
            path: path.to_string(),
            params: BTreeMap::new(),
            body: None,
            multiple: Multiplicity::Once,
            response: None,
            response_status: 200,
        }
    }

    pub fn with_param(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.params.insert(key.into(), value.into());
        self
    }

    pub fn with_body(mut self, matcher: BodyMatcher) -> Self {
        self.body = Some(matcher);
        self
    }

    pub fn with_multiplicity(mut self, multiple: Multiplicity) -> Self {
        self.multiple = multiple;
        self
    }

    pub fn respond_json(mut self, body: Value) -> Self {
        self.response = Some(body);
        self
    }

    pub fn respond_status(mut self, status: u16) -> Self {
        self.response_status = status;
        self
    }

    pub fn consume_once(&self) -> bool {
        self.multiple.is_once()
    }

    pub fn canned_response(&self) -> CannedResponse {
        CannedResponse {
            status: self.response_status,
            body: self.response.clone(),
        }
    }

    /// `Ok(())` when `request` satisfies this expectation, otherwise the first difference.
    pub fn check(&self, request: &ReceivedRequest) -> Result<(), String> {
        if !self.method.eq_ignore_ascii_case(&request.method) {
            return Err(format!(
                "method differs: expected {}, got {}",
                self.method, request.method
            ));
        }
        if self.path != request.path {
            return Err(format!(
                "path differs: expected {}, got {}",
                self.path, request.path
            ));
        }
        if self.params != request.params {
            return Err(format!(
                "query params differ: expected {:?}, got {:?}",
                self.params, request.params
            ));
        }
        if let Some(matcher) = &self.body {
            if !matcher.matches(&request.body) {
                return Err(format!("{matcher} failed for {}", request.body));
            }
        }
        Ok(())
    }
}

impl fmt::Display for ExpectedRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.method, self.path)?;
        write_params(f, &self.params)?;
        if let Some(matcher) = &self.body {
            write!(f, " [{matcher}]")?;
        }
        match self.multiple {
            Multiplicity::Once => {}
            Multiplicity::AtLeastOnce => write!(f, " (1+)")?,
            Multiplicity::Any => write!(f, " (0+)")?,
        }
        write!(f, " -> {}", self.response_status)
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ReceivedRequest {
    pub method: String,
    pub path: String,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub params: BTreeMap<String, String>,
    #[serde(default)]
    pub body: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub received_at: Option<String>,
}

impl ReceivedRequest {
    pub fn new(method: &str, path: &str) -> Self {
        Self {
            method: method.to_ascii_uppercase(),
            path: path.to_string(),
            params: BTreeMap::new(),
            body: Value::Null,
            received_at: None,
        }
    }

    pub fn with_param(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.params.insert(key.into(), value.into());
        self
    }

    pub fn with_body(mut self, body: Value) -> Self {
        self.body = body;
        self
    }

    /// Decode a raw body: empty is `null`, invalid JSON becomes a JSON string.
    pub fn decode_body(raw: &[u8]) -> Value {
        if raw.iter().all(u8::is_ascii_whitespace) {
            return Value::Null;
        }
        serde_json::from_slice(raw)
            .unwrap_or_else(|_| Value::String(String::from_utf8_lossy(raw).into_owned()))
    }
}

impl fmt::Display for ReceivedRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.method, self.path)?;
        write_params(f, &self.params)?;
        if !self.body.is_null() {
            write!(f, " body={}", self.body)?;
        }
        Ok(())
    }
}

fn write_params(f: &mut fmt::Formatter<'_>, params: &BTreeMap<String, String>) -> fmt::Result {
    for (idx, (key, value)) in params.iter().enumerate() {
        let sep = if idx == 0 { '?' } else { '&' };
        write!(f, "{sep}{key}={value}")?;
    }
    Ok(())
}

/// A rejected request, kept so the harness can print expected vs received.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Mismatch {
    pub expected: Option<String>,
    pub received: ReceivedRequest,
    pub reason: String,
}

impl fmt::Display for Mismatch {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.expected {
            Some(expected) => write!(f, "expected: {expected}\n  received: {}", self.received)?,
            None => write!(f, "expected: <nothing>\n  received: {}", self.received)?,
        }
        write!(f, "\n  reason: {}", self.reason)
    }
}
