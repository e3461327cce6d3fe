use crate::generator::{GeneratorError, GeneratorSettings, InputGenerator};
use crate::invoker::{MethodInvoker, Transport};
use crate::monitor::{Finding, FingerprintRecord, HealthMonitor, StatusCounts};
use crate::resources::ResourceStore;
use crate::scheduler::{Scheduler, SchedulerError, ShuffleScheduler};
use crate::schema::SchemaModel;
use crate::sink::{EventSink, SinkRecord, TracingSink};
use rand_core::RngCore;
use serde::Serialize;
use std::collections::BTreeMap;
use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};
use thiserror::Error;
use tracing::{debug, info};

#[derive(Serialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
pub enum EngineState {
    Idle,
    Running,
    /// Cancelled by the stop signal.
    Stopped,
    /// The iteration or time budget ran out.
    Exhausted,
}

impl fmt::Display for EngineState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            EngineState::Idle => "idle",
            EngineState::Running => "running",
            EngineState::Stopped => "stopped",
            EngineState::Exhausted => "exhausted",
        };
        f.write_str(name)
    }
}

#[derive(Error, Debug)]
pub enum EngineError {
    #[error("Input generation failed: {0}")]
    Generator(#[from] GeneratorError),
    #[error("Scheduling failed: {0}")]
    Scheduler(#[from] SchedulerError),
    #[error("Schema declares no methods")]
    NoMethods,
    #[error("Engine has already been started (state: {0})")]
    AlreadyStarted(EngineState),
}

/// Limits fixed at start. A run with neither limit continues until stopped.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RunBudget {
    pub max_invocations: Option<u64>,
    pub max_duration: Option<Duration>,
}

impl RunBudget {
    pub fn invocations(max: u64) -> Self {
        Self {
            max_invocations: Some(max),
            max_duration: None,
        }
    }

    fn is_spent(&self, invocations: u64, elapsed: Duration) -> bool {
        self.max_invocations.is_some_and(|max| invocations >= max)
            || self.max_duration.is_some_and(|max| elapsed >= max)
    }
}

/// Cooperative cancellation, checked between invocations.
///
/// Clones share the same flag. When a stop file is configured, its appearance on disk
/// also counts as a stop request.
#[derive(Debug, Clone, Default)]
pub struct StopSignal {
    flag: Arc<AtomicBool>,
    stop_file: Option<PathBuf>,
}

impl StopSignal {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_stop_file(mut self, path: PathBuf) -> Self {
        self.stop_file = Some(path);
        self
    }

    pub fn stop(&self) {
        self.flag.store(true, Ordering::SeqCst);
    }

    pub fn is_stopped(&self) -> bool {
        self.flag.load(Ordering::SeqCst)
            || self.stop_file.as_ref().is_some_and(|path| path.exists())
    }
}

#[derive(Debug, Clone)]
pub struct EngineSettings {
    pub base_url: String,
    pub static_headers: Vec<(String, String)>,
    pub generator: GeneratorSettings,
    pub budget: RunBudget,
    /// Scan logs after every this many invocations. Zero disables periodic scans.
    pub log_scan_interval: u64,
    /// Sample target resource usage after every this many invocations. Zero disables sampling.
    pub sample_interval: u64,
}

impl EngineSettings {
    pub fn new(base_url: &str) -> Self {
        Self {
            base_url: base_url.to_string(),
            static_headers: Vec::new(),
            generator: GeneratorSettings::default(),
            budget: RunBudget::default(),
            log_scan_interval: 10,
            sample_interval: 25,
        }
    }
}

/// What a finished run reports.
#[derive(Serialize, Debug, Clone)]
#[serde(rename_all = "kebab-case")]
pub struct RunSummary {
    pub state: EngineState,
    pub invocations: u64,
    pub passes: u64,
    pub elapsed: Duration,
    pub counts: StatusCounts,
    pub defect_candidates: u64,
    pub fingerprints: Vec<FingerprintRecord>,
    pub resources: BTreeMap<String, usize>,
}

impl fmt::Display for RunSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let c = &self.counts;
        writeln!(
            f,
            "Run {} after {} invocations ({} full passes) in {:.1}s",
            self.state,
            self.invocations,
            self.passes,
            self.elapsed.as_secs_f64()
        )?;
        writeln!(
            f,
            "  2xx: {}  4xx rejected: {}  401: {}  404: {}  5xx: {}  transport failures: {}  other: {}",
            c.success,
            c.rejected,
            c.unauthorized,
            c.not_found,
            c.server_error,
            c.transport_failure,
            c.other
        )?;
        writeln!(
            f,
            "  extraction errors: {}  credential refreshes: {} ({} failed)",
            c.extraction_failures, c.credential_refreshes, c.credential_refresh_failures
        )?;
        writeln!(f, "  defect candidates reported: {}", self.defect_candidates)?;
        if self.resources.is_empty() {
            writeln!(f, "  no resources registered")?;
        } else {
            let kinds: Vec<String> = self
                .resources
                .iter()
                .map(|(kind, count)| format!("{kind}={count}"))
                .collect();
            writeln!(f, "  resources: {}", kinds.join(", "))?;
        }
        writeln!(f, "  unique stack traces: {}", self.fingerprints.len())?;
        for record in &self.fingerprints {
            writeln!(
                f,
                "    {} x{} ({}): {}",
                record.fingerprint, record.occurrences, record.first_seen_in, record.summary
            )?;
        }
        Ok(())
    }
}

/// Drives the schedule, generate, invoke, observe loop against one target.
pub struct FuzzEngine<T: Transport, R: RngCore> {
    schema: Arc<SchemaModel>,
    resources: Arc<ResourceStore>,
    generator: InputGenerator,
    invoker: MethodInvoker,
    scheduler: Box<dyn Scheduler>,
    transport: T,
    rng: R,
    monitor: HealthMonitor,
    sink: Box<dyn EventSink>,
    stop: StopSignal,
    settings: EngineSettings,
    state: EngineState,
    invocations: u64,
    defect_candidates: u64,
}

impl<T: Transport, R: RngCore> FuzzEngine<T, R> {
    pub fn new(
        schema: Arc<SchemaModel>,
        resources: Arc<ResourceStore>,
        transport: T,
        settings: EngineSettings,
        rng: R,
    ) -> Self {
        let generator = InputGenerator::new(
            Arc::clone(&schema),
            Arc::clone(&resources),
            settings.generator.clone(),
        );
        let invoker = MethodInvoker::new(&settings.base_url, Arc::clone(&resources))
            .with_headers(settings.static_headers.clone());
        let scheduler = Box::new(ShuffleScheduler::new(schema.len()));
        Self {
            schema,
            resources,
            generator,
            invoker,
            scheduler,
            transport,
            rng,
            monitor: HealthMonitor::new(),
            sink: Box::new(TracingSink::new()),
            stop: StopSignal::new(),
            settings,
            state: EngineState::Idle,
            invocations: 0,
            defect_candidates: 0,
        }
    }

    pub fn with_monitor(mut self, monitor: HealthMonitor) -> Self {
        self.monitor = monitor;
        self
    }

    pub fn with_sink(mut self, sink: Box<dyn EventSink>) -> Self {
        self.sink = sink;
        self
    }

    pub fn with_stop_signal(mut self, stop: StopSignal) -> Self {
        self.stop = stop;
        self
    }

    pub fn with_scheduler(mut self, scheduler: Box<dyn Scheduler>) -> Self {
        self.scheduler = scheduler;
        self
    }

    pub fn state(&self) -> EngineState {
        self.state
    }

    pub fn monitor(&self) -> &HealthMonitor {
        &self.monitor
    }

    pub fn resources(&self) -> &ResourceStore {
        &self.resources
    }

    pub fn invoker(&self) -> &MethodInvoker {
        &self.invoker
    }

    /// Runs until the budget is spent or the stop signal fires.
    ///
    /// Only schema-level problems are errors, and they surface before the first request.
    /// Everything the target service does is recorded and reported instead.
    pub fn run(&mut self) -> Result<RunSummary, EngineError> {
        if self.state != EngineState::Idle {
            return Err(EngineError::AlreadyStarted(self.state));
        }
        if self.schema.is_empty() {
            return Err(EngineError::NoMethods);
        }
        self.generator.preflight(&self.schema)?;

        let started = Instant::now();
        self.state = EngineState::Running;
        info!(
            methods = self.schema.len(),
            base_url = %self.settings.base_url,
            "Fuzzing started"
        );

        let final_state = loop {
            if self.stop.is_stopped() {
                info!(invocations = self.invocations, "Stop requested");
                break EngineState::Stopped;
            }
            if self.settings.budget.is_spent(self.invocations, started.elapsed()) {
                info!(invocations = self.invocations, "Budget exhausted");
                break EngineState::Exhausted;
            }

            self.step()?;
            self.invocations += 1;

            if is_due(self.invocations, self.settings.log_scan_interval) {
                let findings = self.monitor.scan_logs();
                self.report(&findings);
            }
            if is_due(self.invocations, self.settings.sample_interval) {
                self.sample_usage();
            }
        };

        let findings = self.monitor.finish();
        self.report(&findings);
        self.sink.flush();
        self.state = final_state;
        Ok(self.summary(started.elapsed()))
    }

    fn step(&mut self) -> Result<(), EngineError> {
        let index = self.scheduler.next(&mut self.rng)?;
        let schema = Arc::clone(&self.schema);
        let method = &schema.methods()[index];

        let payload = self.generator.generate_payload(method, &mut self.rng)?;
        let event = self.invoker.invoke(&mut self.transport, method, &payload);
        self.sink.record(&SinkRecord::Invocation(event.clone()));
        for failure in &event.extraction_failures {
            self.sink.record(&SinkRecord::Extraction(failure.clone()));
        }

        let observation = self.monitor.observe(&event);
        self.report(observation.findings());
        if let Some(credential) = self.monitor.take_credential() {
            debug!("Applying refreshed credential");
            self.invoker.set_credential(credential);
        }
        Ok(())
    }

    fn sample_usage(&mut self) {
        if let Some((sample, findings)) = self.monitor.sample_usage() {
            self.sink.record(&SinkRecord::Usage(sample));
            self.report(&findings);
        }
    }

    fn report(&mut self, findings: &[Finding]) {
        for finding in findings {
            if finding.is_defect_candidate() {
                self.defect_candidates += 1;
            }
            self.sink.record(&SinkRecord::Finding(finding.clone()));
        }
    }

    fn summary(&self, elapsed: Duration) -> RunSummary {
        RunSummary {
            state: self.state,
            invocations: self.invocations,
            passes: self.scheduler.passes(),
            elapsed,
            counts: self.monitor.counts().clone(),
            defect_candidates: self.defect_candidates,
            fingerprints: self.monitor.fingerprints().to_vec(),
            resources: self.resources.snapshot(),
        }
    }
}

fn is_due(invocations: u64, interval: u64) -> bool {
    interval > 0 && invocations % interval == 0
}
