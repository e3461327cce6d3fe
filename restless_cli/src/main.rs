mod transport;

use restless_core::config::RestlessConfig;
use restless_core::monitor::identity::CommandIdentityProvider;
use restless_core::monitor::logs::FileLogSource;
use restless_core::monitor::usage::{ProcfsSampler, ResourceTrendPolicy};
use restless_core::{
    FanoutSink, FuzzEngine, HealthMonitor, JsonLinesSink, ResourceStore, SchemaModel, StopSignal,
    TracingSink,
};

use clap::Parser;
use rand_chacha::ChaCha8Rng;
use rand_core::SeedableRng;
use std::fs::File;
use std::io::BufWriter;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use transport::UreqTransport;

#[derive(Parser, Debug)]
#[clap(author, version, about = "Schema-driven fuzzer for REST services", long_about = None)]
struct Cli {
    #[clap(short, long, value_parser)]
    config_file: Option<PathBuf>,
    /// Schema file (TOML, or JSON by extension). Overrides `target.schema`.
    #[clap(short, long, value_parser)]
    schema: Option<PathBuf>,
    #[clap(long)]
    base_url: Option<String>,
    #[clap(short, long)]
    iterations: Option<u64>,
    #[clap(long)]
    seed: Option<u64>,
    /// JSON-lines output for every event and finding.
    #[clap(long, value_parser)]
    events_file: Option<PathBuf>,
    /// Print the final summary as JSON instead of text.
    #[clap(long)]
    json: bool,
    #[clap(short, long)]
    verbose: bool,
}

fn init_tracing(verbose: bool) {
    let default_level = if verbose { "debug" } else { "info" };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer().with_target(false))
        .with(filter)
        .init();
}

fn load_config(cli: &Cli) -> Result<RestlessConfig, anyhow::Error> {
    let mut config = match &cli.config_file {
        Some(config_path) => {
            info!(path = ?config_path, "Loading configuration");
            RestlessConfig::load_from_file(config_path)?
        }
        None => {
            let default_config_path = PathBuf::from("restless.toml");
            if default_config_path.exists() {
                info!(path = ?default_config_path, "Loading default configuration");
                RestlessConfig::load_from_file(&default_config_path)?
            } else {
                info!("No configuration file found, using built-in defaults");
                RestlessConfig::default()
            }
        }
    };

    if let Some(schema) = &cli.schema {
        config.target.schema = Some(schema.clone());
    }
    if let Some(base_url) = &cli.base_url {
        config.target.base_url = base_url.clone();
    }
    if let Some(iterations) = cli.iterations {
        config.fuzzer.max_iterations = iterations;
    }
    if let Some(seed) = cli.seed {
        config.fuzzer.seed = Some(seed);
    }
    if let Some(events_file) = &cli.events_file {
        config.output.events_file = Some(events_file.clone());
    }
    config.validate()?;
    Ok(config)
}

fn build_monitor(config: &RestlessConfig) -> Result<HealthMonitor, anyhow::Error> {
    let mut monitor = HealthMonitor::new();
    if let Some(log_file) = &config.monitor.log_file {
        let source = FileLogSource::tail(log_file)?;
        info!(path = ?log_file, "Watching service log");
        monitor = monitor.with_log_source(Box::new(source));
    }
    if let Some(identity) = &config.identity {
        monitor = monitor.with_identity(Box::new(CommandIdentityProvider::new(
            identity.command.clone(),
            &identity.header,
            Duration::from_millis(identity.timeout_ms),
        )));
    }
    if let Some(pid) = config.monitor.service_pid {
        if cfg!(target_os = "linux") {
            let policy = ResourceTrendPolicy::new(
                config.monitor.trend_window,
                config.monitor.memory_growth_ratio,
                config.monitor.cpu_saturation_percent,
            );
            monitor = monitor.with_usage(Box::new(ProcfsSampler::new(pid)), policy);
        } else {
            warn!(pid, "Resource sampling needs /proc; service-pid ignored");
        }
    }
    Ok(monitor)
}

fn main() -> Result<(), anyhow::Error> {
    let cli = Cli::parse();
    init_tracing(cli.verbose);

    let config = load_config(&cli)?;
    let schema_path = config
        .target
        .schema
        .clone()
        .ok_or_else(|| anyhow::anyhow!("No schema given: pass --schema or set target.schema"))?;
    let schema = Arc::new(SchemaModel::load_from_file(&schema_path)?);
    info!(path = ?schema_path, methods = schema.len(), "Schema loaded");

    let seed = config.fuzzer.seed.unwrap_or_else(|| {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|elapsed| elapsed.as_nanos() as u64)
            .unwrap_or_default()
    });
    info!(seed, "Seeding generator (pass --seed {seed} to reproduce)");

    let mut sink = FanoutSink::new().with(Box::new(TracingSink::new()));
    if let Some(path) = &config.output.events_file {
        let file = File::create(path)
            .map_err(|e| anyhow::anyhow!("Failed to create events file {:?}: {}", path, e))?;
        sink = sink.with(Box::new(JsonLinesSink::new(BufWriter::new(file))));
    }

    let mut stop = StopSignal::new();
    if let Some(stop_file) = &config.fuzzer.stop_file {
        stop = stop.with_stop_file(stop_file.clone());
    }

    let transport = UreqTransport::new(Duration::from_millis(config.target.timeout_ms));
    let mut engine = FuzzEngine::new(
        schema,
        Arc::new(ResourceStore::new()),
        transport,
        config.engine_settings(),
        ChaCha8Rng::seed_from_u64(seed),
    )
    .with_monitor(build_monitor(&config)?)
    .with_sink(Box::new(sink))
    .with_stop_signal(stop);

    let summary = engine.run()?;
    if cli.json {
        println!("{}", serde_json::to_string_pretty(&summary)?);
    } else {
        println!("{summary}");
    }
    Ok(())
}
