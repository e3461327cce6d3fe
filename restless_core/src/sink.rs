use crate::event::FuzzEvent;
use crate::invoker::ExtractionFailure;
use crate::monitor::usage::ResourceSample;
use crate::monitor::{Finding, FindingKind};
use serde::Serialize;
use std::io::Write;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tracing::{debug, error, info, warn};

/// Everything the engine reports while running.
#[derive(Serialize, Debug, Clone, PartialEq)]
#[serde(rename_all = "kebab-case", tag = "record")]
pub enum SinkRecord {
    Invocation(FuzzEvent),
    Extraction(ExtractionFailure),
    Finding(Finding),
    Usage(ResourceSample),
}

/// The external reporting surface. Sinks must not fail the run.
pub trait EventSink {
    fn record(&mut self, record: &SinkRecord);

    fn flush(&mut self) {}
}

/// Renders records as structured log lines.
#[derive(Debug, Default)]
pub struct TracingSink;

impl TracingSink {
    pub fn new() -> Self {
        TracingSink
    }
}

impl EventSink for TracingSink {
    fn record(&mut self, record: &SinkRecord) {
        match record {
            SinkRecord::Invocation(event) => debug!(
                sequence = event.sequence,
                method = %event.method,
                url = %event.request.url,
                status = ?event.status.code(),
                elapsed_ms = event.elapsed.as_millis() as u64,
                "Invoked"
            ),
            SinkRecord::Extraction(failure) => warn!(
                sequence = failure.sequence,
                method = %failure.method,
                output = %failure.output,
                error = %failure.error,
                "Extraction failed"
            ),
            SinkRecord::Finding(finding) => match finding.kind {
                FindingKind::NewStackTrace => error!(
                    fingerprint = ?finding.fingerprint.map(|f| f.to_string()),
                    method = ?finding.method,
                    "New stack trace: {}",
                    finding.summary
                ),
                FindingKind::ResourceTrend => warn!("Resource trend: {}", finding.summary),
                FindingKind::ServerError | FindingKind::TransportFailure => warn!(
                    sequence = ?finding.sequence,
                    method = ?finding.method,
                    "Defect candidate: {}",
                    finding.summary
                ),
            },
            SinkRecord::Usage(sample) => info!(
                memory_bytes = sample.memory_bytes,
                cpu_percent = ?sample.cpu_percent,
                "Target resource usage"
            ),
        }
    }
}

/// Writes one JSON object per line.
pub struct JsonLinesSink<W: Write> {
    writer: W,
    failed: bool,
}

impl<W: Write> JsonLinesSink<W> {
    pub fn new(writer: W) -> Self {
        Self {
            writer,
            failed: false,
        }
    }

    pub fn into_inner(self) -> W {
        self.writer
    }

    fn write_record(&mut self, record: &SinkRecord) -> std::io::Result<()> {
        serde_json::to_writer(&mut self.writer, record)?;
        self.writer.write_all(b"\n")
    }
}

impl<W: Write> EventSink for JsonLinesSink<W> {
    fn record(&mut self, record: &SinkRecord) {
        if let Err(e) = self.write_record(record) {
            // Only the first failure is logged; a full disk would otherwise flood the log.
            if !self.failed {
                warn!(error = %e, "Event output write failed");
                self.failed = true;
            }
        }
    }

    fn flush(&mut self) {
        if let Err(e) = self.writer.flush() {
            warn!(error = %e, "Event output flush failed");
        }
    }
}

/// Keeps every record in memory. Clones share the same storage, so a handle kept by
/// the caller sees what the engine recorded.
#[derive(Debug, Default, Clone)]
pub struct MemorySink {
    records: Arc<Mutex<Vec<SinkRecord>>>,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn records(&self) -> Vec<SinkRecord> {
        self.lock().clone()
    }

    pub fn events(&self) -> Vec<FuzzEvent> {
        self.lock()
            .iter()
            .filter_map(|record| match record {
                SinkRecord::Invocation(event) => Some(event.clone()),
                _ => None,
            })
            .collect()
    }

    pub fn findings(&self) -> Vec<Finding> {
        self.lock()
            .iter()
            .filter_map(|record| match record {
                SinkRecord::Finding(finding) => Some(finding.clone()),
                _ => None,
            })
            .collect()
    }

    fn lock(&self) -> MutexGuard<'_, Vec<SinkRecord>> {
        self.records.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl EventSink for MemorySink {
    fn record(&mut self, record: &SinkRecord) {
        self.lock().push(record.clone());
    }
}

/// Forwards each record to several sinks in order.
#[derive(Default)]
pub struct FanoutSink {
    sinks: Vec<Box<dyn EventSink>>,
}

impl FanoutSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, sink: Box<dyn EventSink>) -> Self {
        self.sinks.push(sink);
        self
    }

    pub fn len(&self) -> usize {
        self.sinks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sinks.is_empty()
    }
}

impl EventSink for FanoutSink {
    fn record(&mut self, record: &SinkRecord) {
        for sink in self.sinks.iter_mut() {
            sink.record(record);
        }
    }

    fn flush(&mut self) {
        for sink in self.sinks.iter_mut() {
            sink.flush();
        }
    }
}

impl<S: EventSink + ?Sized> EventSink for Box<S> {
    fn record(&mut self, record: &SinkRecord) {
        (**self).record(record);
    }

    fn flush(&mut self) {
        (**self).flush();
    }
}
