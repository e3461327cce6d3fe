use crate::engine::{EngineSettings, RunBudget};
use crate::generator::GeneratorSettings;
use crate::monitor::identity::DEFAULT_CREDENTIAL_HEADER;
use serde::Deserialize;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

#[derive(Deserialize, Debug, Clone, PartialEq)]
#[serde(rename_all = "kebab-case")]
#[serde(deny_unknown_fields)]
pub struct TargetSettings {
    #[serde(default = "default_base_url")]
    pub base_url: String,
    /// Schema file; the command line may override it.
    pub schema: Option<PathBuf>,
    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,
    /// Headers sent with every request.
    #[serde(default)]
    pub headers: BTreeMap<String, String>,
}

fn default_base_url() -> String {
    "http://localhost:8080".to_string()
}

fn default_timeout_ms() -> u64 {
    5000
}

impl Default for TargetSettings {
    fn default() -> Self {
        Self {
            base_url: default_base_url(),
            schema: None,
            timeout_ms: default_timeout_ms(),
            headers: BTreeMap::new(),
        }
    }
}

#[derive(Deserialize, Debug, Clone, PartialEq)]
#[serde(rename_all = "kebab-case")]
#[serde(deny_unknown_fields)]
pub struct FuzzerSettings {
    /// Zero means no invocation limit.
    #[serde(default = "default_iterations")]
    pub max_iterations: u64,
    pub max_duration_secs: Option<u64>,
    pub seed: Option<u64>,
    /// The run stops once this file exists.
    pub stop_file: Option<PathBuf>,
}

pub fn default_iterations() -> u64 {
    1000
}

impl Default for FuzzerSettings {
    fn default() -> Self {
        Self {
            max_iterations: default_iterations(),
            max_duration_secs: None,
            seed: None,
            stop_file: None,
        }
    }
}

#[derive(Deserialize, Debug, Clone, PartialEq)]
#[serde(rename_all = "kebab-case")]
#[serde(deny_unknown_fields)]
pub struct GeneratorConfig {
    #[serde(default = "default_chaos_probability")]
    pub chaos_probability: f64,
    #[serde(default = "default_max_string_length")]
    pub max_string_length: usize,
    #[serde(default = "default_max_list_length")]
    pub max_list_length: usize,
    #[serde(default = "default_reuse_probability")]
    pub reuse_probability: f64,
    #[serde(default = "default_omit_optional_probability")]
    pub omit_optional_probability: f64,
    #[serde(default = "default_boundary_probability")]
    pub boundary_probability: f64,
    #[serde(default = "default_structured_string_probability")]
    pub structured_string_probability: f64,
    #[serde(default = "default_max_depth")]
    pub max_depth: usize,
}

fn default_chaos_probability() -> f64 {
    0.05
}
fn default_max_string_length() -> usize {
    256
}
fn default_max_list_length() -> usize {
    8
}
fn default_reuse_probability() -> f64 {
    0.9
}
fn default_omit_optional_probability() -> f64 {
    0.3
}
fn default_boundary_probability() -> f64 {
    0.25
}
fn default_structured_string_probability() -> f64 {
    0.6
}
fn default_max_depth() -> usize {
    6
}

impl Default for GeneratorConfig {
    fn default() -> Self {
        Self {
            chaos_probability: default_chaos_probability(),
            max_string_length: default_max_string_length(),
            max_list_length: default_max_list_length(),
            reuse_probability: default_reuse_probability(),
            omit_optional_probability: default_omit_optional_probability(),
            boundary_probability: default_boundary_probability(),
            structured_string_probability: default_structured_string_probability(),
            max_depth: default_max_depth(),
        }
    }
}

#[derive(Deserialize, Debug, Clone, PartialEq)]
#[serde(rename_all = "kebab-case")]
#[serde(deny_unknown_fields)]
pub struct MonitorSettings {
    pub log_file: Option<PathBuf>,
    /// Invocations between log scans.
    #[serde(default = "default_log_scan_interval")]
    pub log_scan_interval: u64,
    /// Local process id of the target service, for resource sampling.
    pub service_pid: Option<u32>,
    #[serde(default = "default_sample_interval")]
    pub sample_interval: u64,
    #[serde(default = "default_trend_window")]
    pub trend_window: usize,
    #[serde(default = "default_memory_growth_ratio")]
    pub memory_growth_ratio: f64,
    #[serde(default = "default_cpu_saturation_percent")]
    pub cpu_saturation_percent: f64,
}

fn default_log_scan_interval() -> u64 {
    10
}
fn default_sample_interval() -> u64 {
    25
}
fn default_trend_window() -> usize {
    5
}
fn default_memory_growth_ratio() -> f64 {
    1.5
}
fn default_cpu_saturation_percent() -> f64 {
    95.0
}

impl Default for MonitorSettings {
    fn default() -> Self {
        Self {
            log_file: None,
            log_scan_interval: default_log_scan_interval(),
            service_pid: None,
            sample_interval: default_sample_interval(),
            trend_window: default_trend_window(),
            memory_growth_ratio: default_memory_growth_ratio(),
            cpu_saturation_percent: default_cpu_saturation_percent(),
        }
    }
}

#[derive(Deserialize, Debug, Clone, PartialEq)]
#[serde(rename_all = "kebab-case")]
#[serde(deny_unknown_fields)]
pub struct IdentitySettings {
    /// Program and arguments; the token is read from its standard output.
    pub command: Vec<String>,
    #[serde(default = "default_credential_header")]
    pub header: String,
    #[serde(default = "default_identity_timeout_ms")]
    pub timeout_ms: u64,
}

fn default_credential_header() -> String {
    DEFAULT_CREDENTIAL_HEADER.to_string()
}

fn default_identity_timeout_ms() -> u64 {
    10_000
}

#[derive(Deserialize, Debug, Clone, PartialEq, Default)]
#[serde(rename_all = "kebab-case")]
#[serde(deny_unknown_fields)]
pub struct OutputSettings {
    /// JSON-lines file receiving every event and finding.
    pub events_file: Option<PathBuf>,
}

#[derive(Deserialize, Debug, Clone, PartialEq, Default)]
#[serde(rename_all = "kebab-case")]
#[serde(deny_unknown_fields)]
pub struct RestlessConfig {
    #[serde(default)]
    pub target: TargetSettings,
    #[serde(default)]
    pub fuzzer: FuzzerSettings,
    #[serde(default)]
    pub generator: GeneratorConfig,
    #[serde(default)]
    pub monitor: MonitorSettings,
    #[serde(default)]
    pub identity: Option<IdentitySettings>,
    #[serde(default)]
    pub output: OutputSettings,
}

impl RestlessConfig {
    pub fn load_from_file(path: &Path) -> Result<Self, anyhow::Error> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| anyhow::anyhow!("Failed to read config file at {:?}: {}", path, e))?;
        Self::from_toml_str(&content)
            .map_err(|e| anyhow::anyhow!("Invalid config file {:?}: {}", path, e))
    }

    pub fn from_toml_str(text: &str) -> Result<Self, anyhow::Error> {
        let config: RestlessConfig =
            toml::from_str(text).map_err(|e| anyhow::anyhow!("Failed to parse TOML: {}", e))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), anyhow::Error> {
        let probabilities = [
            ("generator.chaos-probability", self.generator.chaos_probability),
            ("generator.reuse-probability", self.generator.reuse_probability),
            ("generator.omit-optional-probability", self.generator.omit_optional_probability),
            ("generator.boundary-probability", self.generator.boundary_probability),
            (
                "generator.structured-string-probability",
                self.generator.structured_string_probability,
            ),
        ];
        for (name, value) in probabilities {
            if !(0.0..=1.0).contains(&value) {
                anyhow::bail!("{name} must be between 0 and 1, got {value}");
            }
        }
        if self.generator.max_string_length == 0 {
            anyhow::bail!("generator.max-string-length must be at least 1");
        }
        if self.target.base_url.trim().is_empty() {
            anyhow::bail!("target.base-url must not be empty");
        }
        if self.monitor.memory_growth_ratio <= 1.0 {
            anyhow::bail!(
                "monitor.memory-growth-ratio must be greater than 1, got {}",
                self.monitor.memory_growth_ratio
            );
        }
        if let Some(identity) = &self.identity {
            if identity.command.is_empty() {
                anyhow::bail!("identity.command must name a program");
            }
        }
        Ok(())
    }

    pub fn generator_settings(&self) -> GeneratorSettings {
        let g = &self.generator;
        GeneratorSettings {
            chaos_probability: g.chaos_probability,
            max_string_length: g.max_string_length,
            max_list_length: g.max_list_length,
            reuse_probability: g.reuse_probability,
            omit_optional_probability: g.omit_optional_probability,
            boundary_probability: g.boundary_probability,
            structured_string_probability: g.structured_string_probability,
            max_depth: g.max_depth,
        }
    }

    pub fn budget(&self) -> RunBudget {
        RunBudget {
            max_invocations: (self.fuzzer.max_iterations > 0).then_some(self.fuzzer.max_iterations),
            max_duration: self.fuzzer.max_duration_secs.map(Duration::from_secs),
        }
    }

    pub fn engine_settings(&self) -> EngineSettings {
        EngineSettings {
            base_url: self.target.base_url.clone(),
            static_headers: self
                .target
                .headers
                .iter()
                .map(|(name, value)| (name.clone(), value.clone()))
                .collect(),
            generator: self.generator_settings(),
            budget: self.budget(),
            log_scan_interval: self.monitor.log_scan_interval,
            sample_interval: self.monitor.sample_interval,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn empty_config_uses_defaults() {
        let config = RestlessConfig::from_toml_str("").unwrap();
        assert_eq!(config, RestlessConfig::default());
        assert_eq!(config.generator_settings(), GeneratorSettings::default());
        assert_eq!(config.budget(), RunBudget::invocations(1000));
        assert!(config.identity.is_none());
    }

    #[test]
    fn full_config_is_read_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(
            file,
            r#"
[target]
base-url = "http://127.0.0.1:9000/api"
schema = "api.toml"
timeout-ms = 1500
headers = {{ Accept = "application/json" }}

[fuzzer]
max-iterations = 0
max-duration-secs = 60
seed = 7
stop-file = "/tmp/STOP"

[generator]
chaos-probability = 0.5
max-string-length = 16

[monitor]
log-file = "/var/log/svc.log"
log-scan-interval = 3
service-pid = 1234

[identity]
command = ["./get-token.sh", "--user", "fuzzer"]

[output]
events-file = "events.jsonl"
"#
        )
        .unwrap();

        let config = RestlessConfig::load_from_file(file.path()).unwrap();
        assert_eq!(config.target.timeout_ms, 1500);
        assert_eq!(config.fuzzer.seed, Some(7));
        assert_eq!(config.monitor.service_pid, Some(1234));
        assert_eq!(config.monitor.sample_interval, 25);

        let identity = config.identity.as_ref().unwrap();
        assert_eq!(identity.header, DEFAULT_CREDENTIAL_HEADER);
        assert_eq!(identity.command.len(), 3);

        let settings = config.engine_settings();
        assert_eq!(settings.base_url, "http://127.0.0.1:9000/api");
        assert_eq!(
            settings.static_headers,
            vec![("Accept".to_string(), "application/json".to_string())]
        );
        assert_eq!(settings.budget.max_invocations, None);
        assert_eq!(settings.budget.max_duration, Some(Duration::from_secs(60)));
        assert_eq!(settings.generator.chaos_probability, 0.5);
        assert_eq!(settings.generator.max_string_length, 16);
        assert_eq!(settings.generator.reuse_probability, 0.9);
        assert_eq!(settings.log_scan_interval, 3);
    }

    #[test]
    fn out_of_range_probability_is_rejected() {
        let err =
            RestlessConfig::from_toml_str("[generator]\nreuse-probability = 1.5\n").unwrap_err();
        assert!(err.to_string().contains("generator.reuse-probability"));
    }

    #[test]
    fn unknown_keys_are_rejected() {
        assert!(RestlessConfig::from_toml_str("[fuzzer]\nthreads = 4\n").is_err());
    }

    #[test]
    fn empty_identity_command_is_rejected() {
        assert!(RestlessConfig::from_toml_str("[identity]\ncommand = []\n").is_err());
    }

    #[test]
    fn missing_file_is_reported() {
        let dir = tempfile::tempdir().unwrap();
        let err = RestlessConfig::load_from_file(&dir.path().join("nope.toml")).unwrap_err();
        assert!(err.to_string().contains("Failed to read config file"));
    }
}
