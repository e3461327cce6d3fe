use crate::invoker::{ExtractionFailure, TransportError};
use crate::schema::HttpVerb;
use serde::Serialize;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

const REDACTED: &str = "<redacted>";

/// A concrete HTTP request, as handed to the transport and recorded in events.
#[derive(Serialize, Debug, Clone, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
pub struct HttpRequest {
    pub verb: HttpVerb,
    pub url: String,
    pub headers: Vec<(String, String)>,
    pub body: Option<String>,
}

impl HttpRequest {
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(key, _)| key.eq_ignore_ascii_case(name))
            .map(|(_, value)| value.as_str())
    }

    /// Copy of the request with the value of header `name` masked.
    pub fn redacted(&self, name: &str) -> Self {
        let mut copy = self.clone();
        for (key, value) in copy.headers.iter_mut() {
            if key.eq_ignore_ascii_case(name) {
                *value = REDACTED.to_string();
            }
        }
        copy
    }
}

/// Coarse outcome bands used for classification and summary counts.
#[derive(Serialize, Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[serde(rename_all = "kebab-case")]
pub enum StatusBand {
    Success,
    Unauthorized,
    NotFound,
    ClientError,
    ServerError,
    TransportFailure,
    Other,
}

#[derive(Serialize, Debug, Clone, PartialEq, Eq)]
#[serde(rename_all = "kebab-case", tag = "kind")]
pub enum ResponseStatus {
    Http { code: u16 },
    TransportFailure { error: TransportError },
}

impl ResponseStatus {
    pub fn code(&self) -> Option<u16> {
        match self {
            ResponseStatus::Http { code } => Some(*code),
            ResponseStatus::TransportFailure { .. } => None,
        }
    }

    pub fn is_success(&self) -> bool {
        self.band() == StatusBand::Success
    }

    pub fn band(&self) -> StatusBand {
        match self {
            ResponseStatus::TransportFailure { .. } => StatusBand::TransportFailure,
            ResponseStatus::Http { code } => match *code {
                200..=299 => StatusBand::Success,
                401 => StatusBand::Unauthorized,
                404 => StatusBand::NotFound,
                400..=499 => StatusBand::ClientError,
                500..=599 => StatusBand::ServerError,
                _ => StatusBand::Other,
            },
        }
    }
}

/// One invocation attempt. Created once by the invoker and never modified.
#[derive(Serialize, Debug, Clone, PartialEq)]
#[serde(rename_all = "kebab-case")]
pub struct FuzzEvent {
    /// Position of the attempt within the run, starting at 1.
    pub sequence: u64,
    pub timestamp_ms: u64,
    pub method: String,
    pub request: HttpRequest,
    pub status: ResponseStatus,
    pub response_body: String,
    pub elapsed: Duration,
    /// Identifiers registered from this response, as `(kind, id)`.
    pub registered: Vec<(String, String)>,
    pub extraction_failures: Vec<ExtractionFailure>,
}

pub(crate) fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|elapsed| elapsed.as_millis() as u64)
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bands_follow_status_codes() {
        let band = |code| ResponseStatus::Http { code }.band();
        assert_eq!(band(200), StatusBand::Success);
        assert_eq!(band(204), StatusBand::Success);
        assert_eq!(band(401), StatusBand::Unauthorized);
        assert_eq!(band(404), StatusBand::NotFound);
        assert_eq!(band(409), StatusBand::ClientError);
        assert_eq!(band(503), StatusBand::ServerError);
        assert_eq!(band(302), StatusBand::Other);
        let failure = ResponseStatus::TransportFailure {
            error: TransportError::Timeout,
        };
        assert_eq!(failure.band(), StatusBand::TransportFailure);
        assert_eq!(failure.code(), None);
    }

    #[test]
    fn redaction_masks_only_the_named_header() {
        let request = HttpRequest {
            verb: HttpVerb::Get,
            url: "http://svc/widgets".to_string(),
            headers: vec![
                ("X-Auth-Token".to_string(), "secret".to_string()),
                ("Accept".to_string(), "application/json".to_string()),
            ],
            body: None,
        };
        let redacted = request.redacted("x-auth-token");
        assert_eq!(redacted.header("X-Auth-Token"), Some(REDACTED));
        assert_eq!(redacted.header("accept"), Some("application/json"));
        assert_eq!(request.header("X-Auth-Token"), Some("secret"));
    }
}
