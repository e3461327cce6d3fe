use rand_chacha::ChaCha8Rng;
use rand_core::SeedableRng;
use restless_core::monitor::identity::{Credential, CredentialError, IdentityProvider};
use restless_core::monitor::logs::{LogSource, LogSourceError};
use restless_core::{
    EngineSettings, EngineState, FindingKind, FuzzEngine, GeneratorSettings, HealthMonitor,
    HttpRequest, HttpResponse, HttpVerb, InputGenerator, InputSpec, MemorySink, MethodInvoker,
    MethodSpec, OutputSpec, ResourceStore, RunBudget, SchemaModel, TransportError,
};
use serde_json::Value;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

fn create_widget() -> MethodSpec {
    MethodSpec::new("create_widget", HttpVerb::Post, "/widgets")
        .with_input(InputSpec::string("name").required())
        .with_input(InputSpec::boolean("enabled"))
        .with_output(OutputSpec::resource("widget_id", "widget"))
}

fn get_widget() -> MethodSpec {
    MethodSpec::new("get_widget", HttpVerb::Get, "/widgets/{widget_id}")
        .with_input(InputSpec::resource("widget_id", "widget").required())
}

fn schema(methods: Vec<MethodSpec>) -> Arc<SchemaModel> {
    Arc::new(SchemaModel::new(methods, Default::default()).unwrap())
}

fn respond(status: u16, body: &str) -> Result<HttpResponse, TransportError> {
    Ok(HttpResponse {
        status,
        body: body.to_string(),
        elapsed: Duration::from_millis(1),
    })
}

fn settings(budget: u64) -> EngineSettings {
    let mut settings = EngineSettings::new("http://svc.test");
    settings.budget = RunBudget::invocations(budget);
    settings.generator = GeneratorSettings {
        chaos_probability: 0.0,
        ..GeneratorSettings::default()
    };
    settings
}

#[test]
fn created_widget_is_registered_under_its_kind() {
    let captured: Arc<Mutex<Vec<HttpRequest>>> = Arc::default();
    let requests = Arc::clone(&captured);
    let transport = move |request: &HttpRequest| -> Result<HttpResponse, TransportError> {
        requests.lock().unwrap().push(request.clone());
        respond(201, r#"{"widget_id": "abc-1"}"#)
    };
    let resources = Arc::new(ResourceStore::new());
    let mut engine = FuzzEngine::new(
        schema(vec![create_widget()]),
        Arc::clone(&resources),
        transport,
        settings(1),
        ChaCha8Rng::seed_from_u64(11),
    );

    let summary = engine.run().unwrap();
    assert_eq!(summary.invocations, 1);

    let requests = captured.lock().unwrap();
    assert_eq!(requests.len(), 1);
    assert_eq!(requests[0].verb, HttpVerb::Post);
    assert_eq!(requests[0].url, "http://svc.test/widgets");
    let body: Value = serde_json::from_str(requests[0].body.as_deref().unwrap()).unwrap();
    assert!(body["name"].is_string());

    assert!(resources.contains("widget", "abc-1"));
    assert_eq!(summary.resources.get("widget"), Some(&1));
}

#[test]
fn optional_field_is_omitted_in_some_trials() {
    let schema = schema(vec![create_widget()]);
    let generator = InputGenerator::new(
        Arc::clone(&schema),
        Arc::new(ResourceStore::new()),
        GeneratorSettings::default(),
    );
    let method = schema.method("create_widget").unwrap();
    let mut rng = ChaCha8Rng::seed_from_u64(3);

    let trials = 200;
    let mut omitted = 0;
    for _ in 0..trials {
        let payload = generator.generate_payload(method, &mut rng).unwrap();
        assert!(payload.contains_key("name"));
        if !payload.contains_key("enabled") {
            omitted += 1;
        }
    }
    assert!(omitted > 0 && omitted < trials, "omitted {omitted} of {trials}");
}

#[test]
fn registered_identifier_flows_into_later_requests() {
    let schema = schema(vec![create_widget(), get_widget()]);
    let resources = Arc::new(ResourceStore::new());
    let mut invoker = MethodInvoker::new("http://svc.test", Arc::clone(&resources));
    let generator = InputGenerator::new(
        Arc::clone(&schema),
        Arc::clone(&resources),
        GeneratorSettings {
            chaos_probability: 0.0,
            reuse_probability: 1.0,
            ..GeneratorSettings::default()
        },
    );
    let mut rng = ChaCha8Rng::seed_from_u64(9);

    let mut transport = |_: &HttpRequest| -> Result<HttpResponse, TransportError> {
        respond(201, r#"{"widget_id": "abc-1"}"#)
    };
    let create = schema.method("create_widget").unwrap();
    let payload = generator.generate_payload(create, &mut rng).unwrap();
    let event = invoker.invoke(&mut transport, create, &payload);
    assert_eq!(event.registered, vec![("widget".to_string(), "abc-1".to_string())]);

    let get = schema.method("get_widget").unwrap();
    let payload = generator.generate_payload(get, &mut rng).unwrap();
    assert_eq!(payload["widget_id"], "abc-1");
    assert_eq!(
        invoker.render(get, &payload).url,
        "http://svc.test/widgets/abc-1"
    );
}

struct CountingIdentity(Arc<AtomicUsize>);

impl IdentityProvider for CountingIdentity {
    fn refresh(&mut self) -> Result<Credential, CredentialError> {
        let n = self.0.fetch_add(1, Ordering::SeqCst) + 1;
        Ok(Credential::new("X-Auth-Token", &format!("fresh-{n}")))
    }
}

#[test]
fn unauthorized_response_refreshes_credential_before_next_invocation() {
    let captured: Arc<Mutex<Vec<HttpRequest>>> = Arc::default();
    let requests = Arc::clone(&captured);
    let transport = move |request: &HttpRequest| -> Result<HttpResponse, TransportError> {
        let mut requests = requests.lock().unwrap();
        requests.push(request.clone());
        if requests.len() == 1 {
            respond(401, r#"{"error": "token expired"}"#)
        } else {
            respond(200, "{}")
        }
    };
    let refreshes = Arc::new(AtomicUsize::new(0));
    let monitor =
        HealthMonitor::new().with_identity(Box::new(CountingIdentity(Arc::clone(&refreshes))));
    let sink = MemorySink::new();
    let mut engine = FuzzEngine::new(
        schema(vec![get_widget()]),
        Arc::new(ResourceStore::new()),
        transport,
        settings(3),
        ChaCha8Rng::seed_from_u64(1),
    )
    .with_monitor(monitor)
    .with_sink(Box::new(sink.clone()));

    let summary = engine.run().unwrap();
    assert_eq!(refreshes.load(Ordering::SeqCst), 1);
    assert_eq!(summary.counts.unauthorized, 1);
    assert_eq!(summary.counts.credential_refreshes, 1);
    assert_eq!(summary.defect_candidates, 0);
    assert!(sink.findings().is_empty());

    let requests = captured.lock().unwrap();
    assert_eq!(requests[0].header("X-Auth-Token"), None);
    assert_eq!(requests[1].header("X-Auth-Token"), Some("fresh-1"));
    assert_eq!(requests[2].header("X-Auth-Token"), Some("fresh-1"));

    let recorded = sink.events();
    assert_eq!(recorded[1].request.header("X-Auth-Token"), Some("<redacted>"));
}

struct ScriptedLogs(VecDeque<Vec<String>>);

impl LogSource for ScriptedLogs {
    fn name(&self) -> &str {
        "service.log"
    }

    fn read_new_lines(&mut self) -> Result<Vec<String>, LogSourceError> {
        Ok(self.0.pop_front().unwrap_or_default())
    }
}

#[test]
fn identical_traces_yield_one_fingerprint_and_one_report() {
    let trace_line = r#"{"level": "error", "msg": "Traceback (most recent call last):\n  File \"/srv/widgets/views.py\", line 42, in create\n    save(widget)\nIntegrityError: duplicate key"}"#;
    let logs = ScriptedLogs(VecDeque::from([
        vec![trace_line.to_string(), "INFO POST /widgets 500".to_string()],
        vec![trace_line.to_string(), "INFO POST /widgets 500".to_string()],
    ]));
    let transport =
        |_: &HttpRequest| -> Result<HttpResponse, TransportError> { respond(200, "{}") };
    let mut settings = settings(4);
    settings.log_scan_interval = 1;
    let sink = MemorySink::new();
    let mut engine = FuzzEngine::new(
        schema(vec![create_widget()]),
        Arc::new(ResourceStore::new()),
        transport,
        settings,
        ChaCha8Rng::seed_from_u64(2),
    )
    .with_monitor(HealthMonitor::new().with_log_source(Box::new(logs)))
    .with_sink(Box::new(sink.clone()));

    let summary = engine.run().unwrap();

    let traces: Vec<_> = sink
        .findings()
        .into_iter()
        .filter(|finding| finding.kind == FindingKind::NewStackTrace)
        .collect();
    assert_eq!(traces.len(), 1);
    assert!(traces[0].summary.contains("IntegrityError"));

    assert_eq!(summary.fingerprints.len(), 1);
    assert_eq!(summary.fingerprints[0].occurrences, 2);
    assert_eq!(summary.fingerprints[0].first_seen_in, "service.log");
    assert_eq!(Some(summary.fingerprints[0].fingerprint), traces[0].fingerprint);
}

#[test]
fn budget_exhausts_after_exactly_n_attempts_whatever_the_outcome() {
    let calls = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&calls);
    let transport = move |_: &HttpRequest| -> Result<HttpResponse, TransportError> {
        match counter.fetch_add(1, Ordering::SeqCst) % 4 {
            0 => respond(201, r#"{"widget_id": 5}"#),
            1 => respond(500, "Internal Server Error"),
            2 => Err(TransportError::ConnectionRefused("127.0.0.1:1".to_string())),
            _ => respond(404, ""),
        }
    };
    let mut engine = FuzzEngine::new(
        schema(vec![create_widget(), get_widget()]),
        Arc::new(ResourceStore::new()),
        transport,
        settings(9),
        ChaCha8Rng::seed_from_u64(4),
    );

    let summary = engine.run().unwrap();
    assert_eq!(engine.state(), EngineState::Exhausted);
    assert_eq!(summary.invocations, 9);
    assert_eq!(calls.load(Ordering::SeqCst), 9);
    let c = &summary.counts;
    assert_eq!(
        c.success + c.server_error + c.transport_failure + c.not_found,
        9
    );
}
