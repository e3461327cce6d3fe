pub mod identity;
pub mod logs;
pub mod trace;
pub mod usage;

use crate::event::{FuzzEvent, ResponseStatus, StatusBand};
use identity::{Credential, IdentityProvider};
use logs::LogSource;
use serde::Serialize;
use std::collections::HashMap;
use tracing::{debug, info, warn};
use trace::{StackTrace, TraceFingerprint, TraceScanner, split_segments};
use usage::{ResourceSample, ResourceSampler, ResourceTrendPolicy, TrendAlert};

/// How an individual event was interpreted.
#[derive(Serialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
pub enum Classification {
    Success,
    /// A 4xx other than 401/404: the service turned the input away, which is expected.
    Rejected,
    CredentialExpired,
    StaleResource,
    DefectCandidate,
    Other,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Observation {
    Classified {
        classification: Classification,
        findings: Vec<Finding>,
    },
    /// The event's sequence number was already observed; nothing was counted.
    Duplicate,
}

impl Observation {
    pub fn classification(&self) -> Option<Classification> {
        match self {
            Observation::Classified { classification, .. } => Some(*classification),
            Observation::Duplicate => None,
        }
    }

    pub fn findings(&self) -> &[Finding] {
        match self {
            Observation::Classified { findings, .. } => findings,
            Observation::Duplicate => &[],
        }
    }
}

#[derive(Serialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
pub enum FindingKind {
    ServerError,
    TransportFailure,
    NewStackTrace,
    ResourceTrend,
}

/// Something the user should look at.
#[derive(Serialize, Debug, Clone, PartialEq)]
#[serde(rename_all = "kebab-case")]
pub struct Finding {
    pub kind: FindingKind,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub method: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sequence: Option<u64>,
    pub summary: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub fingerprint: Option<TraceFingerprint>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub trace: Option<StackTrace>,
}

impl Finding {
    fn for_event(kind: FindingKind, event: &FuzzEvent, summary: String) -> Self {
        Self {
            kind,
            method: Some(event.method.clone()),
            sequence: Some(event.sequence),
            summary,
            fingerprint: None,
            trace: None,
        }
    }

    pub fn is_defect_candidate(&self) -> bool {
        !matches!(self.kind, FindingKind::ResourceTrend)
    }
}

/// Per-run tallies. Duplicated events never contribute.
#[derive(Serialize, Debug, Clone, Default, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
pub struct StatusCounts {
    pub invocations: u64,
    pub success: u64,
    pub rejected: u64,
    pub unauthorized: u64,
    pub not_found: u64,
    pub server_error: u64,
    pub transport_failure: u64,
    pub other: u64,
    pub extraction_failures: u64,
    pub credential_refreshes: u64,
    pub credential_refresh_failures: u64,
}

/// A distinct stack trace seen during the run.
#[derive(Serialize, Debug, Clone, PartialEq)]
#[serde(rename_all = "kebab-case")]
pub struct FingerprintRecord {
    pub fingerprint: TraceFingerprint,
    pub occurrences: u64,
    pub summary: String,
    /// Where the first occurrence was found: a log source name or `response`.
    pub first_seen_in: String,
}

#[derive(Debug, Default)]
struct FingerprintRegistry {
    records: Vec<FingerprintRecord>,
    index: HashMap<TraceFingerprint, usize>,
}

impl FingerprintRegistry {
    /// Counts an occurrence. Returns true the first time a fingerprint is seen.
    fn record(&mut self, fingerprint: TraceFingerprint, trace: &StackTrace, origin: &str) -> bool {
        if let Some(&position) = self.index.get(&fingerprint) {
            self.records[position].occurrences += 1;
            return false;
        }
        self.index.insert(fingerprint, self.records.len());
        self.records.push(FingerprintRecord {
            fingerprint,
            occurrences: 1,
            summary: trace.summary(),
            first_seen_in: origin.to_string(),
        });
        true
    }
}

const RESPONSE_ORIGIN: &str = "response";

/// Classifies events and watches the target service out of band.
///
/// The monitor never touches the resource store or the invoker. A credential obtained
/// after a 401 is parked until the engine collects it with [`HealthMonitor::take_credential`].
pub struct HealthMonitor {
    /// Highest sequence number observed; sequence numbers only grow within a run.
    last_sequence: Option<u64>,
    counts: StatusCounts,
    registry: FingerprintRegistry,
    log_source: Option<Box<dyn LogSource>>,
    scanner: TraceScanner,
    identity: Option<Box<dyn IdentityProvider>>,
    pending_credential: Option<Credential>,
    usage: Option<(Box<dyn ResourceSampler>, ResourceTrendPolicy)>,
    memory_alert: bool,
    cpu_alert: bool,
}

impl Default for HealthMonitor {
    fn default() -> Self {
        Self::new()
    }
}

impl HealthMonitor {
    pub fn new() -> Self {
        Self {
            last_sequence: None,
            counts: StatusCounts::default(),
            registry: FingerprintRegistry::default(),
            log_source: None,
            scanner: TraceScanner::new(),
            identity: None,
            pending_credential: None,
            usage: None,
            memory_alert: false,
            cpu_alert: false,
        }
    }

    pub fn with_log_source(mut self, source: Box<dyn LogSource>) -> Self {
        self.log_source = Some(source);
        self
    }

    pub fn with_identity(mut self, provider: Box<dyn IdentityProvider>) -> Self {
        self.identity = Some(provider);
        self
    }

    pub fn with_usage(mut self, sampler: Box<dyn ResourceSampler>, policy: ResourceTrendPolicy) -> Self {
        self.usage = Some((sampler, policy));
        self
    }

    pub fn counts(&self) -> &StatusCounts {
        &self.counts
    }

    /// Distinct traces in the order they were first seen.
    pub fn fingerprints(&self) -> &[FingerprintRecord] {
        &self.registry.records
    }

    /// The credential fetched after the most recent 401, if not yet collected.
    pub fn take_credential(&mut self) -> Option<Credential> {
        self.pending_credential.take()
    }

    pub fn observe(&mut self, event: &FuzzEvent) -> Observation {
        if self.last_sequence.is_some_and(|last| event.sequence <= last) {
            debug!(sequence = event.sequence, "Event already observed, ignoring");
            return Observation::Duplicate;
        }
        self.last_sequence = Some(event.sequence);
        self.counts.invocations += 1;
        self.counts.extraction_failures += event.extraction_failures.len() as u64;

        let mut findings = Vec::new();
        let classification = match event.status.band() {
            StatusBand::Success => {
                self.counts.success += 1;
                Classification::Success
            }
            StatusBand::Unauthorized => {
                self.counts.unauthorized += 1;
                self.refresh_credential(event);
                Classification::CredentialExpired
            }
            StatusBand::NotFound => {
                self.counts.not_found += 1;
                Classification::StaleResource
            }
            StatusBand::ClientError => {
                self.counts.rejected += 1;
                Classification::Rejected
            }
            StatusBand::ServerError => {
                self.counts.server_error += 1;
                let code = event.status.code().unwrap_or_default();
                findings.push(Finding::for_event(
                    FindingKind::ServerError,
                    event,
                    format!("{} {} returned HTTP {code}", event.request.verb, event.request.url),
                ));
                for trace in TraceScanner::scan_block(&event.response_body) {
                    findings.extend(self.record_trace(trace, RESPONSE_ORIGIN, Some(event)));
                }
                Classification::DefectCandidate
            }
            StatusBand::TransportFailure => {
                self.counts.transport_failure += 1;
                let reason = match &event.status {
                    ResponseStatus::TransportFailure { error } => error.to_string(),
                    ResponseStatus::Http { code } => format!("HTTP {code}"),
                };
                findings.push(Finding::for_event(
                    FindingKind::TransportFailure,
                    event,
                    format!("{} {} failed: {reason}", event.request.verb, event.request.url),
                ));
                Classification::DefectCandidate
            }
            StatusBand::Other => {
                self.counts.other += 1;
                Classification::Other
            }
        };

        Observation::Classified {
            classification,
            findings,
        }
    }

    /// Reads newly appended log lines and reports traces whose fingerprint is new.
    pub fn scan_logs(&mut self) -> Vec<Finding> {
        let Some(source) = self.log_source.as_mut() else {
            return Vec::new();
        };
        let lines = match source.read_new_lines() {
            Ok(lines) => lines,
            Err(e) => {
                warn!(error = %e, "Log scan skipped");
                return Vec::new();
            }
        };
        let origin = source.name().to_string();

        let mut traces = Vec::new();
        for line in &lines {
            for segment in split_segments(line) {
                traces.extend(self.scanner.feed(segment));
            }
        }
        debug!(lines = lines.len(), traces = traces.len(), source = %origin, "Scanned log output");
        traces
            .into_iter()
            .filter_map(|trace| self.record_trace(trace, &origin, None))
            .collect()
    }

    /// Samples the target process and reports trends as they begin.
    pub fn sample_usage(&mut self) -> Option<(ResourceSample, Vec<Finding>)> {
        let (sampler, policy) = self.usage.as_mut()?;
        let sample = sampler.sample()?;
        let alerts = policy.push(sample);

        let memory = alerts.iter().find(|a| matches!(a, TrendAlert::MemoryGrowth { .. }));
        let cpu = alerts.iter().find(|a| matches!(a, TrendAlert::CpuSaturation { .. }));
        let mut findings = Vec::new();
        for (alert, was_active) in [(memory, self.memory_alert), (cpu, self.cpu_alert)] {
            if let Some(alert) = alert.filter(|_| !was_active) {
                findings.push(Finding {
                    kind: FindingKind::ResourceTrend,
                    method: None,
                    sequence: None,
                    summary: alert.describe(),
                    fingerprint: None,
                    trace: None,
                });
            }
        }
        self.memory_alert = memory.is_some();
        self.cpu_alert = cpu.is_some();
        Some((sample, findings))
    }

    /// Final log scan, completing any trace still open at the end of the run.
    pub fn finish(&mut self) -> Vec<Finding> {
        let mut findings = self.scan_logs();
        if let Some(trace) = self.scanner.flush() {
            let origin = self
                .log_source
                .as_ref()
                .map(|source| source.name().to_string())
                .unwrap_or_default();
            findings.extend(self.record_trace(trace, &origin, None));
        }
        findings
    }

    fn record_trace(
        &mut self,
        trace: StackTrace,
        origin: &str,
        event: Option<&FuzzEvent>,
    ) -> Option<Finding> {
        let fingerprint = trace.fingerprint();
        if !self.registry.record(fingerprint, &trace, origin) {
            debug!(%fingerprint, origin, "Suppressing repeated stack trace");
            return None;
        }
        Some(Finding {
            kind: FindingKind::NewStackTrace,
            method: event.map(|e| e.method.clone()),
            sequence: event.map(|e| e.sequence),
            summary: trace.summary(),
            fingerprint: Some(fingerprint),
            trace: Some(trace),
        })
    }

    fn refresh_credential(&mut self, event: &FuzzEvent) {
        let Some(provider) = self.identity.as_mut() else {
            debug!(method = %event.method, "401 received but no identity provider is configured");
            return;
        };
        match provider.refresh() {
            Ok(credential) => {
                info!(method = %event.method, header = %credential.header, "Credential refreshed after 401");
                self.counts.credential_refreshes += 1;
                self.pending_credential = Some(credential);
            }
            Err(e) => {
                warn!(method = %event.method, error = %e, "Credential refresh failed");
                self.counts.credential_refresh_failures += 1;
            }
        }
    }
}
