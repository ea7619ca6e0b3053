pub mod config;
pub mod errors;
pub mod gateway;
pub mod health;
pub mod jsonrpc;
pub mod log_retention;
pub mod logging;
pub mod queue;
pub mod replay;
pub mod router;
pub mod runtime;
pub mod service;
pub mod supervisor;
pub mod tools;

use clap::{error::ErrorKind, Parser};
use config::{load_config, CliOverrides};
use errors::ProxyError;
use logging::{append_run_log, clear_run_logger, init_run_logger, JsonlLogger};
use runtime::{ClientSink, FileSystem, ProductionFileSystem, StdoutSink};
use serde_json::json;
use std::path::{Path, PathBuf};
use std::sync::Arc;

#[derive(Debug, Clone, Parser)]
#[command(name = "scriptgen")]
#[command(version)]
#[command(
    about = "Supervising stdio proxy for a browser-automation service that records actions into replay scripts"
)]
pub struct Cli {
    #[arg(long)]
    pub config: Option<PathBuf>,
    #[arg(long)]
    pub working_dir: Option<PathBuf>,
    /// Browser passed to the service as `--browser`; empty disables the flag.
    #[arg(long)]
    pub browser: Option<String>,
    #[arg(long)]
    pub output_dir: Option<PathBuf>,
    #[arg(long)]
    pub log_file: Option<PathBuf>,
    #[arg(long)]
    pub action_log: Option<PathBuf>,
    /// Start the service on the first request instead of at boot.
    #[arg(long, default_value_t = false)]
    pub no_eager_start: bool,
}

impl Cli {
    fn overrides(&self) -> CliOverrides {
        CliOverrides {
            config_path: self.config.clone(),
            working_dir: self.working_dir.clone(),
            browser: self.browser.clone(),
            output_dir: self.output_dir.clone(),
            log_file: self.log_file.clone(),
            action_log: self.action_log.clone(),
            no_eager_start: self.no_eager_start,
        }
    }
}

pub fn run() -> Result<i32, ProxyError> {
    let args = std::env::args_os().collect::<Vec<_>>();
    let cwd = std::env::current_dir().map_err(|e| ProxyError::Io(e.to_string()))?;
    run_with_args(&args, &cwd, &ProductionFileSystem, Arc::new(StdoutSink))
}

pub fn run_with_args(
    args: &[std::ffi::OsString],
    cwd: &Path,
    file_system: &dyn FileSystem,
    sink: Arc<dyn ClientSink>,
) -> Result<i32, ProxyError> {
    let cli = match Cli::try_parse_from(args) {
        Ok(cli) => cli,
        Err(error) => match error.kind() {
            ErrorKind::DisplayHelp | ErrorKind::DisplayVersion => {
                print!("{error}");
                return Ok(0);
            }
            _ => return Err(ProxyError::Cli(error.to_string())),
        },
    };

    let (cfg, scope) = load_config(&cli.overrides(), cwd, file_system)?;

    if cfg.logging.enabled {
        init_run_logger(JsonlLogger {
            path: scope.resolve(&cfg.logging.log_file),
            max_payload_bytes: cfg.logging.max_payload_bytes,
            budget_bytes: cfg.logging.budget_bytes,
        });
    }
    append_run_log(
        "info",
        "process.started",
        json!({
            "working_dir": scope.working_dir.display().to_string(),
            "command": cfg.service.command,
            "browser": cfg.service.browser,
            "eager_start": cfg.service.eager_start
        }),
    );

    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .map_err(|e| ProxyError::Io(e.to_string()))?;
    let served = runtime.block_on(service::serve(cfg, scope, tokio::io::stdin(), sink));
    // The stdin reader may still be parked in a blocking read.
    runtime.shutdown_background();
    served?;

    append_run_log("info", "process.stopped", json!({}));
    clear_run_logger();
    Ok(0)
}
