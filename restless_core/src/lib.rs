pub mod config;
pub mod engine;
pub mod event;
pub mod generator;
pub mod invoker;
pub mod monitor;
pub mod resources;
pub mod scheduler;
pub mod schema;
pub mod sink;

pub use config::RestlessConfig;
pub use engine::{
    EngineError, EngineSettings, EngineState, FuzzEngine, RunBudget, RunSummary, StopSignal,
};
pub use event::{FuzzEvent, HttpRequest, ResponseStatus, StatusBand};
pub use generator::{GeneratorError, GeneratorSettings, InputGenerator, Payload};
pub use invoker::{
    ExtractionError, ExtractionFailure, HttpResponse, MethodInvoker, Transport, TransportError,
};
pub use monitor::{
    Classification, Finding, FindingKind, FingerprintRecord, HealthMonitor, Observation,
    StatusCounts,
};
pub use resources::ResourceStore;
pub use scheduler::{Scheduler, SchedulerError, ShuffleScheduler};
pub use schema::{
    ExtractionRule, FieldType, HttpVerb, InputSpec, MethodSpec, OutputSpec, SchemaDocument,
    SchemaError, SchemaModel,
};
pub use sink::{EventSink, FanoutSink, JsonLinesSink, MemorySink, SinkRecord, TracingSink};
