use crate::errors::ProxyError;
use crate::log_retention::{enforce_total_budget, rotate, rotation_threshold};
use serde::Serialize;
use serde_json::Value;
use sha2::{Digest, Sha256};
use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, OnceLock};
use std::time::{SystemTime, UNIX_EPOCH};

pub const DEFAULT_DISK_BUDGET_BYTES: u64 = 50 * 1024 * 1024;

/// Lines from the browser service longer than this are logged as a digest.
pub const LARGE_LINE_THRESHOLD: usize = 16 * 1024;

/// Appends JSON lines to `path`. Once the file reaches a quarter of
/// `budget_bytes` it is rotated, and the oldest rotations are pruned so the
/// log and its rotations stay within the budget.
#[derive(Debug, Clone)]
pub struct JsonlLogger {
    pub path: PathBuf,
    pub max_payload_bytes: usize,
    pub budget_bytes: u64,
}

#[derive(Debug, Clone, Serialize)]
pub struct LogEvent<'a> {
    pub level: &'a str,
    pub event_type: &'a str,
    pub payload: Value,
}

impl JsonlLogger {
    pub fn new(path: impl AsRef<Path>) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
            max_payload_bytes: 4096,
            budget_bytes: DEFAULT_DISK_BUDGET_BYTES,
        }
    }

    pub fn append(&self, event: &LogEvent<'_>) -> Result<(), ProxyError> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent).map_err(|e| ProxyError::Io(e.to_string()))?;
        }
        let truncated = truncate_json(event.payload.clone(), self.max_payload_bytes);
        let line = serde_json::to_string(&LogEvent {
            level: event.level,
            event_type: event.event_type,
            payload: truncated,
        })
        .map_err(|e| ProxyError::Io(e.to_string()))?;

        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .map_err(|e| ProxyError::Io(e.to_string()))?;
        file.write_all(line.as_bytes())
            .map_err(|e| ProxyError::Io(e.to_string()))?;
        file.write_all(b"\n")
            .map_err(|e| ProxyError::Io(e.to_string()))?;
        let written = file
            .metadata()
            .map_err(|e| ProxyError::Io(e.to_string()))?
            .len();
        drop(file);

        // Only a rotation looks at the rest of the directory.
        if written >= rotation_threshold(self.budget_bytes) {
            let stamp = SystemTime::now()
                .duration_since(UNIX_EPOCH)
                .map(|elapsed| elapsed.as_millis())
                .unwrap_or_default();
            rotate(&self.path, stamp)?;
            enforce_total_budget(&self.path, self.budget_bytes)?;
        }

        Ok(())
    }
}

fn run_logger_slot() -> &'static Mutex<Option<JsonlLogger>> {
    static SLOT: OnceLock<Mutex<Option<JsonlLogger>>> = OnceLock::new();
    SLOT.get_or_init(|| Mutex::new(None))
}

/// Installs the process-wide logger used by `append_run_log`.
pub fn init_run_logger(logger: JsonlLogger) {
    let mut slot = run_logger_slot()
        .lock()
        .unwrap_or_else(|poisoned| poisoned.into_inner());
    *slot = Some(logger);
}

pub fn clear_run_logger() {
    let mut slot = run_logger_slot()
        .lock()
        .unwrap_or_else(|poisoned| poisoned.into_inner());
    *slot = None;
}

/// Appends one event to the run log. Does nothing until a logger is
/// installed, and never fails the caller: logging is best effort.
pub fn append_run_log(level: &str, event_type: &str, payload: Value) {
    let slot = run_logger_slot()
        .lock()
        .unwrap_or_else(|poisoned| poisoned.into_inner());
    if let Some(logger) = slot.as_ref() {
        let _ = logger.append(&LogEvent {
            level,
            event_type,
            payload,
        });
    }
}

/// Stderr and unparseable stdout from the service are kept verbatim unless
/// they are huge, in which case only a digest prefix is recorded.
pub fn loggable_line(line: &str) -> String {
    if line.len() <= LARGE_LINE_THRESHOLD {
        return line.to_string();
    }
    let hash = Sha256::digest(line.as_bytes());
    let prefix = hash[..8]
        .iter()
        .map(|byte| format!("{byte:02x}"))
        .collect::<String>();
    format!("<hash:sha256:{prefix}> ({} bytes)", line.len())
}

fn truncate_json(value: Value, max_bytes: usize) -> Value {
    let rendered = serde_json::to_string(&value).unwrap_or_default();
    if rendered.len() <= max_bytes {
        return value;
    }
    let mut cut = max_bytes.saturating_sub(3);
    while cut > 0 && !rendered.is_char_boundary(cut) {
        cut -= 1;
    }
    Value::String(format!("{}...", &rendered[..cut]))
}
