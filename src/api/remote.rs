//! Purpose: HTTP client for a mock server running in another process.
//! Exports: `RemoteExpectations`, `MockReply`, admin path constants.
//! Role: `ExpectationControl` over the admin side channel; also issues plain mock requests.
//! Invariants: Error envelopes `{"error":{"kind",...}}` map back onto `ErrorKind`.
//! Invariants: In-process body predicates are refused before anything is sent.
#![allow(clippy::result_large_err)]

use std::time::Duration;

use serde::Deserialize;
use serde::de::DeserializeOwned;
use serde_json::Value;
use url::Url;

use super::client::{ApiResult, ExpectationControl};
use crate::core::address::ServerAddress;
use crate::core::error::{Error, ErrorKind, parse_error_kind};
use crate::core::expectation::{ExpectedRequest, Mismatch};

pub const EXPECTATIONS_PATH: &str = "/__expected_requests__";
pub const MISMATCHES_PATH: &str = "/__mismatches__";
pub const HEALTH_PATH: &str = "/__healthz__";

#[derive(Clone, Debug)]
pub struct RemoteExpectations {
    base_url: Url,
    agent: ureq::Agent,
}

/// A mock response that was not an error envelope.
#[derive(Clone, Debug, PartialEq)]
pub struct MockReply {
    pub status: u16,
    pub body: Value,
}

#[derive(Deserialize)]
struct ErrorEnvelope {
    error: RemoteError,
}

#[derive(Deserialize)]
struct RemoteError {
    kind: String,
    message: Option<String>,
    hint: Option<String>,
    detail: Option<String>,
    expected: Option<String>,
    received: Option<Value>,
}

impl RemoteExpectations {
    pub fn new(base_url: impl Into<String>) -> ApiResult<Self> {
        let base_url = normalize_base_url(base_url.into())?;
        let agent = ureq::AgentBuilder::new()
            .timeout_connect(Duration::from_secs(2))
            .timeout(Duration::from_secs(30))
            .build();
        Ok(Self { base_url, agent })
    }

    pub fn for_address(address: ServerAddress) -> ApiResult<Self> {
        Self::new(address.base_url())
    }

    pub fn base_url(&self) -> &Url {
        &self.base_url
    }

    pub fn is_healthy(&self) -> bool {
        self.url(HEALTH_PATH)
            .map(|url| self.agent.get(url.as_str()).call().is_ok())
            .unwrap_or(false)
    }

    /// Issue one request to the mock itself, as a process under test would.
    pub fn send(&self, method: &str, path: &str, body: Option<&Value>) -> ApiResult<MockReply> {
        let url = self.url(path)?;
        let request = self
            .agent
            .request(&method.to_ascii_uppercase(), url.as_str())
            .set("Accept", "application/json");
        let response = match body {
            Some(body) => request
                .set("Content-Type", "application/json")
                .send_string(&encode_json(body)?),
            None => request.call(),
        };
        match response {
            Ok(resp) => {
                let status = resp.status();
                Ok(MockReply {
                    status,
                    body: read_body(resp)?,
                })
            }
            Err(ureq::Error::Status(status, resp)) => {
                let text = resp.into_string().unwrap_or_default();
                if let Ok(envelope) = serde_json::from_str::<ErrorEnvelope>(&text) {
                    return Err(error_from_remote(envelope.error));
                }
                Ok(MockReply {
                    status,
                    body: serde_json::from_str(&text).unwrap_or(Value::String(text)),
                })
            }
            Err(ureq::Error::Transport(err)) => Err(transport_error(err)),
        }
    }

    fn url(&self, path: &str) -> ApiResult<Url> {
        self.base_url.join(path).map_err(|err| {
            Error::new(ErrorKind::Usage)
                .with_message(format!("invalid request path {path:?}"))
                .with_source(err)
        })
    }

    fn request_json<R>(&self, method: &str, path: &str, body: Option<&Value>) -> ApiResult<R>
    where
        R: DeserializeOwned,
    {
        let url = self.url(path)?;
        let request = self
            .agent
            .request(method, url.as_str())
            .set("Accept", "application/json");
        let response = match body {
            Some(body) => request
                .set("Content-Type", "application/json")
                .send_string(&encode_json(body)?),
            None => request.call(),
        };
        match response {
            Ok(resp) => read_json_response(resp),
            Err(ureq::Error::Status(code, resp)) => Err(parse_error_response(code, resp)),
            Err(ureq::Error::Transport(err)) => Err(transport_error(err)),
        }
    }
}

impl ExpectationControl for RemoteExpectations {
    fn set_expectations(&self, expected: Vec<ExpectedRequest>) -> ApiResult<()> {
        if let Some(local_only) = expected
            .iter()
            .find(|request| request.body.as_ref().is_some_and(|m| !m.is_transmissible()))
        {
            return Err(Error::new(ErrorKind::Usage)
                .with_message(format!(
                    "expectation `{local_only}` uses an in-process body predicate"
                ))
                .with_hint("Use an exact or subset body matcher with a remote mock server."));
        }
        let payload = serde_json::to_value(&expected).map_err(|err| {
            Error::new(ErrorKind::Internal)
                .with_message("failed to encode expectations")
                .with_source(err)
        })?;
        let _: Value = self.request_json("POST", EXPECTATIONS_PATH, Some(&payload))?;
        Ok(())
    }

    fn remaining(&self) -> ApiResult<Vec<ExpectedRequest>> {
        self.request_json("GET", EXPECTATIONS_PATH, None)
    }

    fn mismatches(&self) -> ApiResult<Vec<Mismatch>> {
        self.request_json("GET", MISMATCHES_PATH, None)
    }

    fn clear(&self) -> ApiResult<()> {
        let _: Value = self.request_json("DELETE", EXPECTATIONS_PATH, None)?;
        Ok(())
    }
}

fn normalize_base_url(raw: String) -> ApiResult<Url> {
    let url = Url::parse(&raw).map_err(|err| {
        Error::new(ErrorKind::Usage)
            .with_message(format!("invalid mock server url {raw:?}"))
            .with_source(err)
    })?;
    if url.scheme() != "http" {
        return Err(Error::new(ErrorKind::Usage)
            .with_message(format!("unsupported scheme {:?}", url.scheme()))
            .with_hint("The mock server speaks plain http."));
    }
    if url.host_str().is_none() {
        return Err(Error::new(ErrorKind::Usage).with_message("mock server url needs a host"));
    }
    Ok(url)
}

fn read_body(resp: ureq::Response) -> ApiResult<Value> {
    let text = resp.into_string().map_err(|err| {
        Error::new(ErrorKind::Io)
            .with_message("failed to read response body")
            .with_source(err)
    })?;
    if text.trim().is_empty() {
        return Ok(Value::Null);
    }
    Ok(serde_json::from_str(&text).unwrap_or(Value::String(text)))
}

fn encode_json(body: &Value) -> ApiResult<String> {
    serde_json::to_string(body).map_err(|err| {
        Error::new(ErrorKind::Internal)
            .with_message("failed to encode request json")
            .with_source(err)
    })
}

fn read_json_response<R>(response: ureq::Response) -> ApiResult<R>
where
    R: DeserializeOwned,
{
    let body = response.into_string().map_err(|err| {
        Error::new(ErrorKind::Io)
            .with_message("failed to read response body")
            .with_source(err)
    })?;
    serde_json::from_str(&body).map_err(|err| {
        Error::new(ErrorKind::Internal)
            .with_message("invalid response json")
            .with_source(err)
    })
}

fn transport_error(err: ureq::Transport) -> Error {
    Error::new(ErrorKind::Io)
        .with_message("request failed")
        .with_hint("Is the mock server running at this address?")
        .with_source(err)
}

fn parse_error_response(status: u16, response: ureq::Response) -> Error {
    let body = response.into_string().unwrap_or_default();
    if let Ok(envelope) = serde_json::from_str::<ErrorEnvelope>(&body) {
        return error_from_remote(envelope.error);
    }
    Error::new(error_kind_from_status(status)).with_message(format!("remote error status {status}"))
}

fn error_from_remote(remote: RemoteError) -> Error {
    let mut err = Error::new(parse_error_kind(&remote.kind));
    if let Some(message) = remote.message {
        err = err.with_message(message);
    }
    if let Some(hint) = remote.hint {
        err = err.with_hint(hint);
    }
    let mut detail = Vec::new();
    if let Some(expected) = remote.expected {
        detail.push(format!("expected: {expected}"));
    }
    if let Some(received) = remote.received {
        detail.push(format!("received: {received}"));
    }
    if let Some(extra) = remote.detail {
        detail.push(extra);
    }
    if !detail.is_empty() {
        err = err.with_detail(detail.join("\n"));
    }
    err
}

fn error_kind_from_status(status: u16) -> ErrorKind {
    match status {
        400 | 404 | 405 | 413 | 422 => ErrorKind::Usage,
        409 => ErrorKind::PendingExpectations,
        500..=599 => ErrorKind::Internal,
        _ => ErrorKind::Io,
    }
}
