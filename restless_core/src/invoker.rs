use crate::event::{FuzzEvent, HttpRequest, ResponseStatus, now_millis};
use crate::generator::Payload;
use crate::monitor::identity::Credential;
use crate::resources::ResourceStore;
use crate::schema::{MethodSpec, OutputSpec};
use serde::Serialize;
use serde_json::Value as JsonValue;
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;
use tracing::{debug, trace};

/// Network-level failures reported by a [`Transport`].
///
/// These are recorded in events; they never stop a run.
#[derive(Error, Serialize, Debug, Clone, PartialEq, Eq)]
#[serde(rename_all = "kebab-case", tag = "reason", content = "detail")]
pub enum TransportError {
    #[error("connection refused: {0}")]
    ConnectionRefused(String),
    #[error("request timed out")]
    Timeout,
    #[error("transport failure: {0}")]
    Other(String),
}

/// What the transport hands back for any HTTP status, success or not.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HttpResponse {
    pub status: u16,
    pub body: String,
    pub elapsed: Duration,
}

/// The seam to the HTTP stack: one request in, one status and body out.
pub trait Transport {
    fn perform(&mut self, request: &HttpRequest) -> Result<HttpResponse, TransportError>;
}

impl<F> Transport for F
where
    F: FnMut(&HttpRequest) -> Result<HttpResponse, TransportError>,
{
    fn perform(&mut self, request: &HttpRequest) -> Result<HttpResponse, TransportError> {
        self(request)
    }
}

#[derive(Error, Serialize, Debug, Clone, PartialEq, Eq)]
#[serde(rename_all = "kebab-case", tag = "reason", content = "detail")]
pub enum ExtractionError {
    #[error("response body is not JSON: {0}")]
    InvalidBody(String),
    #[error("no value at '{0}'")]
    MissingValue(String),
    #[error("value at '{0}' is not a scalar identifier")]
    NonScalarIdentifier(String),
}

/// An output that could not be extracted from a successful response.
#[derive(Serialize, Debug, Clone, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
pub struct ExtractionFailure {
    pub sequence: u64,
    pub method: String,
    pub output: String,
    pub error: ExtractionError,
}

/// Renders requests, performs them through a [`Transport`] and feeds identifiers from
/// successful responses into the [`ResourceStore`].
pub struct MethodInvoker {
    base_url: String,
    static_headers: Vec<(String, String)>,
    credential: Option<Credential>,
    resources: Arc<ResourceStore>,
    next_sequence: u64,
}

impl MethodInvoker {
    pub fn new(base_url: &str, resources: Arc<ResourceStore>) -> Self {
        Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            static_headers: Vec::new(),
            credential: None,
            resources,
            next_sequence: 1,
        }
    }

    pub fn with_headers(mut self, headers: Vec<(String, String)>) -> Self {
        self.static_headers = headers;
        self
    }

    pub fn set_credential(&mut self, credential: Credential) {
        self.credential = Some(credential);
    }

    pub fn credential(&self) -> Option<&Credential> {
        self.credential.as_ref()
    }

    /// Renders the concrete request for `method` with the given inputs.
    ///
    /// Path parameters are substituted and percent-encoded. The remaining inputs
    /// become a JSON body for verbs that carry one, and query parameters otherwise.
    pub fn render(&self, method: &MethodSpec, payload: &Payload) -> HttpRequest {
        let params = method.path_parameters();
        let mut url = format!("{}{}", self.base_url, render_path(&method.path, payload));

        let remaining: Payload = payload
            .iter()
            .filter(|(name, _)| !params.contains(&name.as_str()))
            .map(|(name, value)| (name.clone(), value.clone()))
            .collect();

        let mut headers = self.static_headers.clone();
        if let Some(credential) = &self.credential {
            headers.push((credential.header.clone(), credential.value.clone()));
        }

        let mut body = None;
        if method.verb.carries_body() {
            headers.push(("Content-Type".to_string(), "application/json".to_string()));
            body = Some(JsonValue::Object(remaining).to_string());
        } else if !remaining.is_empty() {
            let query: Vec<String> = remaining
                .iter()
                .map(|(name, value)| {
                    format!(
                        "{}={}",
                        urlencoding::encode(name),
                        urlencoding::encode(&scalar_text(value))
                    )
                })
                .collect();
            url.push(if url.contains('?') { '&' } else { '?' });
            url.push_str(&query.join("&"));
        }

        HttpRequest {
            verb: method.verb,
            url,
            headers,
            body,
        }
    }

    /// Performs one invocation. Never fails: transport errors and extraction problems
    /// are recorded in the returned event.
    pub fn invoke<T: Transport + ?Sized>(
        &mut self,
        transport: &mut T,
        method: &MethodSpec,
        payload: &Payload,
    ) -> FuzzEvent {
        let sequence = self.next_sequence;
        self.next_sequence += 1;
        let timestamp_ms = now_millis();
        let request = self.render(method, payload);
        trace!(method = %method.name, url = %request.url, "sending request");

        let started = Instant::now();
        let result = transport.perform(&request);
        let recorded_request = match &self.credential {
            Some(credential) => request.redacted(&credential.header),
            None => request,
        };

        let (status, response_body, elapsed) = match result {
            Ok(response) => (
                ResponseStatus::Http {
                    code: response.status,
                },
                response.body,
                response.elapsed,
            ),
            Err(error) => {
                debug!(method = %method.name, %error, "transport failure");
                (
                    ResponseStatus::TransportFailure { error },
                    String::new(),
                    started.elapsed(),
                )
            }
        };

        let mut registered = Vec::new();
        let mut extraction_failures = Vec::new();
        if status.is_success() && !method.outputs.is_empty() {
            self.extract_outputs(
                sequence,
                method,
                &response_body,
                &mut registered,
                &mut extraction_failures,
            );
        }

        FuzzEvent {
            sequence,
            timestamp_ms,
            method: method.name.clone(),
            request: recorded_request,
            status,
            response_body,
            elapsed,
            registered,
            extraction_failures,
        }
    }

    fn extract_outputs(
        &self,
        sequence: u64,
        method: &MethodSpec,
        body: &str,
        registered: &mut Vec<(String, String)>,
        failures: &mut Vec<ExtractionFailure>,
    ) {
        let failure = |output: &OutputSpec, error| ExtractionFailure {
            sequence,
            method: method.name.clone(),
            output: output.name.clone(),
            error,
        };

        let parsed: JsonValue = match serde_json::from_str(body) {
            Ok(value) => value,
            Err(e) => {
                for output in &method.outputs {
                    failures.push(failure(output, ExtractionError::InvalidBody(e.to_string())));
                }
                return;
            }
        };

        for output in &method.outputs {
            let rule = output.rule();
            let values = rule.evaluate(&parsed);
            if values.is_empty() {
                failures.push(failure(output, ExtractionError::MissingValue(rule.to_string())));
                continue;
            }
            let Some(kind) = output.registered_kind() else {
                continue;
            };
            for value in values {
                match identifier_text(value) {
                    Some(id) => {
                        if self.resources.register(kind, id.clone()) {
                            debug!(method = %method.name, kind, id = %id, "registered resource");
                        }
                        registered.push((kind.to_string(), id));
                    }
                    None => failures.push(failure(
                        output,
                        ExtractionError::NonScalarIdentifier(rule.to_string()),
                    )),
                }
            }
        }
    }
}

fn render_path(template: &str, payload: &Payload) -> String {
    let mut rendered = String::with_capacity(template.len());
    let mut rest = template;
    while let Some(open) = rest.find('{') {
        let after = &rest[open + 1..];
        let Some(close) = after.find('}') else {
            break;
        };
        rendered.push_str(&rest[..open]);
        let name = after[..close].trim();
        let value = payload.get(name).map(scalar_text).unwrap_or_default();
        rendered.push_str(&urlencoding::encode(&value));
        rest = &after[close + 1..];
    }
    rendered.push_str(rest);
    rendered
}

fn scalar_text(value: &JsonValue) -> String {
    match value {
        JsonValue::String(text) => text.clone(),
        JsonValue::Null => String::new(),
        other => other.to_string(),
    }
}

fn identifier_text(value: &JsonValue) -> Option<String> {
    match value {
        JsonValue::String(text) if !text.is_empty() => Some(text.clone()),
        JsonValue::Number(number) => Some(number.to_string()),
        _ => None,
    }
}
