use restless_core::{HttpRequest, HttpResponse, Transport, TransportError};
use std::io;
use std::time::{Duration, Instant};
use tracing::debug;

/// Blocking HTTP transport backed by a shared `ureq` agent.
pub struct UreqTransport {
    agent: ureq::Agent,
}

impl UreqTransport {
    pub fn new(timeout: Duration) -> Self {
        Self {
            agent: ureq::AgentBuilder::new()
                .timeout(timeout)
                .timeout_connect(timeout)
                .build(),
        }
    }
}

impl Transport for UreqTransport {
    fn perform(&mut self, request: &HttpRequest) -> Result<HttpResponse, TransportError> {
        let mut pending = self.agent.request(request.verb.as_str(), &request.url);
        for (name, value) in &request.headers {
            pending = pending.set(name, value);
        }

        let started = Instant::now();
        let outcome = match &request.body {
            Some(body) => pending.send_string(body),
            None => pending.call(),
        };
        let response = match outcome {
            Ok(response) => response,
            // Non-2xx statuses are ordinary responses here.
            Err(ureq::Error::Status(_, response)) => response,
            Err(ureq::Error::Transport(transport)) => return Err(classify(&transport)),
        };

        let status = response.status();
        let body = response.into_string().unwrap_or_else(|e| {
            debug!(url = %request.url, error = %e, "Response body unreadable");
            String::new()
        });
        Ok(HttpResponse {
            status,
            body,
            elapsed: started.elapsed(),
        })
    }
}

fn classify(transport: &ureq::Transport) -> TransportError {
    let timed_out = std::error::Error::source(transport)
        .and_then(|source| source.downcast_ref::<io::Error>())
        .is_some_and(|e| matches!(e.kind(), io::ErrorKind::TimedOut | io::ErrorKind::WouldBlock));
    if timed_out {
        return TransportError::Timeout;
    }
    match transport.kind() {
        ureq::ErrorKind::ConnectionFailed | ureq::ErrorKind::Dns => {
            TransportError::ConnectionRefused(transport.to_string())
        }
        _ => TransportError::Other(transport.to_string()),
    }
}
