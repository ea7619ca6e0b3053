use crate::errors::ProxyError;
use crate::logging::DEFAULT_DISK_BUDGET_BYTES;
use crate::runtime::{FileSystem, LaunchRequest};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

#[derive(Debug, Clone, Default)]
pub struct CliOverrides {
    pub config_path: Option<PathBuf>,
    pub working_dir: Option<PathBuf>,
    pub browser: Option<String>,
    pub output_dir: Option<PathBuf>,
    pub log_file: Option<PathBuf>,
    pub action_log: Option<PathBuf>,
    pub no_eager_start: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AppConfig {
    pub service: ServiceConfig,
    pub health_check: HealthCheckConfig,
    pub logging: LoggingConfig,
    pub script_generation: ScriptGenerationConfig,
    pub recording: RecordingConfig,
    pub tool: ToolConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ServiceConfig {
    pub command: String,
    pub args: Vec<String>,
    pub browser: String,
    pub startup_timeout_ms: u64,
    pub restart_backoff_ms: u64,
    pub call_timeout_ms: u64,
    pub max_write_retries: u32,
    pub shutdown_grace_ms: u64,
    pub eager_start: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct HealthCheckConfig {
    pub method: String,
    pub id_prefix: String,
    pub interval_ms: u64,
    pub initial_delay_ms: u64,
    /// Unanswered probes tolerated before readiness drops; 0 never demotes.
    pub max_missed_probes: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct LoggingConfig {
    pub enabled: bool,
    pub log_file: PathBuf,
    pub max_payload_bytes: usize,
    pub budget_bytes: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ScriptGenerationConfig {
    pub output_dir: PathBuf,
    pub file_stem: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct RecordingConfig {
    pub action_log_path: PathBuf,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ToolConfig {
    pub name: String,
    pub description: String,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            service: ServiceConfig {
                command: default_service_command().to_string(),
                args: vec!["@playwright/mcp@latest".to_string()],
                browser: "msedge".to_string(),
                startup_timeout_ms: 30_000,
                restart_backoff_ms: 1_000,
                call_timeout_ms: 120_000,
                max_write_retries: 3,
                shutdown_grace_ms: 5_000,
                eager_start: true,
            },
            health_check: HealthCheckConfig {
                method: "ping".to_string(),
                id_prefix: "health_check_".to_string(),
                interval_ms: 5_000,
                initial_delay_ms: 500,
                max_missed_probes: 0,
            },
            logging: LoggingConfig {
                enabled: true,
                log_file: PathBuf::from(".scriptgen/logs/scriptgen.jsonl"),
                max_payload_bytes: 4096,
                budget_bytes: DEFAULT_DISK_BUDGET_BYTES,
            },
            script_generation: ScriptGenerationConfig {
                output_dir: PathBuf::from("generated-scripts"),
                file_stem: "test".to_string(),
            },
            recording: RecordingConfig {
                action_log_path: PathBuf::from(".scriptgen/test-steps.json"),
            },
            tool: ToolConfig {
                name: "playwright_script_generator".to_string(),
                description: "Generate a replay script from the recorded browser actions"
                    .to_string(),
            },
        }
    }
}

fn default_service_command() -> &'static str {
    if cfg!(windows) {
        "npx.cmd"
    } else {
        "npx"
    }
}

impl ServiceConfig {
    pub fn startup_timeout(&self) -> Duration {
        Duration::from_millis(self.startup_timeout_ms)
    }

    pub fn restart_backoff(&self) -> Duration {
        Duration::from_millis(self.restart_backoff_ms)
    }

    pub fn call_timeout(&self) -> Duration {
        Duration::from_millis(self.call_timeout_ms)
    }

    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_millis(self.shutdown_grace_ms)
    }
}

impl HealthCheckConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_millis(self.interval_ms)
    }

    pub fn initial_delay(&self) -> Duration {
        Duration::from_millis(self.initial_delay_ms)
    }
}

/// Directories the process works in once config and flags are resolved.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RuntimeScope {
    pub process_cwd: PathBuf,
    pub working_dir: PathBuf,
}

impl RuntimeScope {
    pub fn resolve(&self, path: &Path) -> PathBuf {
        absolutize_path(&self.working_dir, path)
    }
}

impl AppConfig {
    /// Anchors every relative path in the config at the working directory.
    pub fn resolve_paths(mut self, scope: &RuntimeScope) -> Self {
        self.logging.log_file = scope.resolve(&self.logging.log_file);
        self.script_generation.output_dir = scope.resolve(&self.script_generation.output_dir);
        self.recording.action_log_path = scope.resolve(&self.recording.action_log_path);
        self
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
struct PartialAppConfig {
    service: Option<PartialServiceConfig>,
    health_check: Option<PartialHealthCheckConfig>,
    logging: Option<PartialLoggingConfig>,
    script_generation: Option<PartialScriptGenerationConfig>,
    recording: Option<PartialRecordingConfig>,
    tool: Option<PartialToolConfig>,
    scope: Option<PartialScopeConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
struct PartialServiceConfig {
    command: Option<String>,
    args: Option<Vec<String>>,
    browser: Option<String>,
    startup_timeout_ms: Option<u64>,
    restart_backoff_ms: Option<u64>,
    call_timeout_ms: Option<u64>,
    max_write_retries: Option<u32>,
    shutdown_grace_ms: Option<u64>,
    eager_start: Option<bool>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
struct PartialHealthCheckConfig {
    method: Option<String>,
    id_prefix: Option<String>,
    interval_ms: Option<u64>,
    initial_delay_ms: Option<u64>,
    max_missed_probes: Option<u32>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
struct PartialLoggingConfig {
    enabled: Option<bool>,
    log_file: Option<PathBuf>,
    max_payload_bytes: Option<usize>,
    budget_bytes: Option<u64>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
struct PartialScriptGenerationConfig {
    output_dir: Option<PathBuf>,
    file_stem: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
struct PartialRecordingConfig {
    action_log_path: Option<PathBuf>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
struct PartialToolConfig {
    name: Option<String>,
    description: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
struct PartialScopeConfig {
    working_dir: Option<PathBuf>,
}

pub fn load_config(
    overrides: &CliOverrides,
    process_cwd: &Path,
    fs: &dyn FileSystem,
) -> Result<(AppConfig, RuntimeScope), ProxyError> {
    let mut cfg = AppConfig::default();
    let mut config_working_dir = None;

    if let Some(path) = &overrides.config_path {
        let file_contents = fs.read_to_string(&absolutize_path(process_cwd, path))?;
        let partial: PartialAppConfig = toml::from_str(&file_contents)
            .map_err(|e| ProxyError::ConfigParse(e.to_string()))?;
        config_working_dir = partial.scope.as_ref().and_then(|s| s.working_dir.clone());
        merge_partial_config(&mut cfg, partial);
    }

    apply_cli_overrides(&mut cfg, overrides);

    let scope = resolve_scope(process_cwd, config_working_dir.as_deref(), overrides);
    validate_config(&cfg)?;
    Ok((cfg, scope))
}

fn merge_partial_config(cfg: &mut AppConfig, partial: PartialAppConfig) {
    if let Some(service) = partial.service {
        if let Some(value) = service.command {
            cfg.service.command = value;
        }
        if let Some(value) = service.args {
            cfg.service.args = value;
        }
        if let Some(value) = service.browser {
            cfg.service.browser = value;
        }
        if let Some(value) = service.startup_timeout_ms {
            cfg.service.startup_timeout_ms = value;
        }
        if let Some(value) = service.restart_backoff_ms {
            cfg.service.restart_backoff_ms = value;
        }
        if let Some(value) = service.call_timeout_ms {
            cfg.service.call_timeout_ms = value;
        }
        if let Some(value) = service.max_write_retries {
            cfg.service.max_write_retries = value;
        }
        if let Some(value) = service.shutdown_grace_ms {
            cfg.service.shutdown_grace_ms = value;
        }
        if let Some(value) = service.eager_start {
            cfg.service.eager_start = value;
        }
    }

    if let Some(health) = partial.health_check {
        if let Some(value) = health.method {
            cfg.health_check.method = value;
        }
        if let Some(value) = health.id_prefix {
            cfg.health_check.id_prefix = value;
        }
        if let Some(value) = health.interval_ms {
            cfg.health_check.interval_ms = value;
        }
        if let Some(value) = health.initial_delay_ms {
            cfg.health_check.initial_delay_ms = value;
        }
        if let Some(value) = health.max_missed_probes {
            cfg.health_check.max_missed_probes = value;
        }
    }

    if let Some(logging) = partial.logging {
        if let Some(value) = logging.enabled {
            cfg.logging.enabled = value;
        }
        if let Some(value) = logging.log_file {
            cfg.logging.log_file = value;
        }
        if let Some(value) = logging.max_payload_bytes {
            cfg.logging.max_payload_bytes = value;
        }
        if let Some(value) = logging.budget_bytes {
            cfg.logging.budget_bytes = value;
        }
    }

    if let Some(generation) = partial.script_generation {
        if let Some(value) = generation.output_dir {
            cfg.script_generation.output_dir = value;
        }
        if let Some(value) = generation.file_stem {
            cfg.script_generation.file_stem = value;
        }
    }

    if let Some(recording) = partial.recording {
        if let Some(value) = recording.action_log_path {
            cfg.recording.action_log_path = value;
        }
    }

    if let Some(tool) = partial.tool {
        if let Some(value) = tool.name {
            cfg.tool.name = value;
        }
        if let Some(value) = tool.description {
            cfg.tool.description = value;
        }
    }
}

fn apply_cli_overrides(cfg: &mut AppConfig, overrides: &CliOverrides) {
    if let Some(browser) = &overrides.browser {
        cfg.service.browser = browser.clone();
    }
    if let Some(output_dir) = &overrides.output_dir {
        cfg.script_generation.output_dir = output_dir.clone();
    }
    if let Some(log_file) = &overrides.log_file {
        cfg.logging.log_file = log_file.clone();
    }
    if let Some(action_log) = &overrides.action_log {
        cfg.recording.action_log_path = action_log.clone();
    }
    if overrides.no_eager_start {
        cfg.service.eager_start = false;
    }
}

pub fn resolve_scope(
    process_cwd: &Path,
    config_working_dir: Option<&Path>,
    overrides: &CliOverrides,
) -> RuntimeScope {
    let process_cwd = process_cwd.to_path_buf();
    let working_dir = if let Some(path) = &overrides.working_dir {
        absolutize_path(&process_cwd, path)
    } else if let Some(path) = config_working_dir {
        absolutize_path(&process_cwd, path)
    } else {
        process_cwd.clone()
    };

    RuntimeScope {
        process_cwd,
        working_dir,
    }
}

fn absolutize_path(base: &Path, value: &Path) -> PathBuf {
    if value.is_absolute() {
        value.to_path_buf()
    } else {
        base.join(value)
    }
}

/// Command line for the browser service, run from the working directory.
pub fn launch_request(cfg: &AppConfig, scope: &RuntimeScope) -> LaunchRequest {
    let mut args = cfg.service.args.clone();
    if !cfg.service.browser.trim().is_empty() {
        args.push("--browser".to_string());
        args.push(cfg.service.browser.clone());
    }
    LaunchRequest {
        program: cfg.service.command.clone(),
        args,
        cwd: Some(scope.working_dir.clone()),
    }
}

fn validate_config(cfg: &AppConfig) -> Result<(), ProxyError> {
    let required = [
        ("service.command", &cfg.service.command),
        ("health_check.method", &cfg.health_check.method),
        ("health_check.id_prefix", &cfg.health_check.id_prefix),
        ("tool.name", &cfg.tool.name),
        ("script_generation.file_stem", &cfg.script_generation.file_stem),
    ];
    for (key, value) in required {
        if value.trim().is_empty() {
            return Err(ProxyError::InvalidConfig(format!("{key} must not be empty")));
        }
    }

    let durations = [
        ("service.startup_timeout_ms", cfg.service.startup_timeout_ms),
        ("service.call_timeout_ms", cfg.service.call_timeout_ms),
        ("health_check.interval_ms", cfg.health_check.interval_ms),
    ];
    for (key, value) in durations {
        if value == 0 {
            return Err(ProxyError::InvalidConfig(format!(
                "{key} must be greater than zero"
            )));
        }
    }

    if cfg.tool.name.starts_with(&cfg.health_check.id_prefix) {
        return Err(ProxyError::InvalidConfig(
            "tool.name must not start with health_check.id_prefix".to_string(),
        ));
    }

    Ok(())
}
