use crate::logging::append_run_log;
use crate::replay::action::{replay_step, RecordedAction, ReplayStep};
use crate::runtime::{lock, FileSystem, LaunchRequest};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

pub const REPLAY_CALL_TIMEOUT_MS: u64 = 30_000;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EmitStatus {
    Success,
    Error,
}

/// Result descriptor returned to the client inside the tool result.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EmitReport {
    pub status: EmitStatus,
    pub message: String,
    pub generated_script_file: Option<PathBuf>,
}

impl EmitReport {
    pub fn is_success(&self) -> bool {
        self.status == EmitStatus::Success
    }
}

pub trait ScriptEmitter: Send {
    fn emit(&self, page_url: &str, actions: &[RecordedAction], target: &Path) -> EmitReport;
}

/// Writes a self-contained Node.js program that launches the browser service
/// with the same command line and replays the actions over its stdio.
pub struct NodeScriptEmitter {
    fs: Arc<dyn FileSystem>,
    service: LaunchRequest,
}

impl NodeScriptEmitter {
    pub fn new(fs: Arc<dyn FileSystem>, service: LaunchRequest) -> Self {
        Self { fs, service }
    }

    pub fn render(&self, page_url: &str, actions: &[RecordedAction]) -> String {
        let mut lines = vec![
            "// Replay script generated by scriptgen.".to_string(),
            format!("// Page when generated: {}", js_literal(&json!(page_url))),
            "const { spawn } = require('child_process');".to_string(),
            String::new(),
            format!(
                "const SERVICE_COMMAND = {};",
                js_literal(&json!(self.service.program))
            ),
            format!("const SERVICE_ARGS = {};", js_literal(&json!(self.service.args))),
            format!("const CALL_TIMEOUT_MS = {REPLAY_CALL_TIMEOUT_MS};"),
            String::new(),
        ];
        lines.extend(PRELUDE.lines().map(str::to_string));
        for step in actions.iter().map(replay_step) {
            match step {
                ReplayStep::Call { method, params } => {
                    lines.push(format!(
                        "    await call({}, {});",
                        js_literal(&json!(method)),
                        js_literal(&params)
                    ));
                    lines.push(format!(
                        "    console.log({});",
                        js_literal(&json!(format!("done: {method}")))
                    ));
                }
                ReplayStep::Pause { millis } => lines.push(format!("    await pause({millis});")),
                ReplayStep::Skipped { reason } => {
                    lines.push(format!("    // skipped: {}", reason.replace('\n', " ")))
                }
            }
        }
        lines.extend(EPILOGUE.lines().map(str::to_string));
        let mut script = lines.join("\n");
        script.push('\n');
        script
    }
}

impl ScriptEmitter for NodeScriptEmitter {
    fn emit(&self, page_url: &str, actions: &[RecordedAction], target: &Path) -> EmitReport {
        let script = self.render(page_url, actions);
        let written = target
            .parent()
            .filter(|parent| !parent.as_os_str().is_empty())
            .map_or(Ok(()), |parent| self.fs.create_dir_all(parent))
            .and_then(|()| self.fs.write_string(target, &script));

        match written {
            Ok(()) => {
                append_run_log(
                    "info",
                    "script.generated",
                    json!({"path": target.display().to_string(), "steps": actions.len()}),
                );
                EmitReport {
                    status: EmitStatus::Success,
                    message: format!(
                        "Generated a Node.js replay script with {} steps",
                        actions.len()
                    ),
                    generated_script_file: Some(target.to_path_buf()),
                }
            }
            Err(err) => {
                append_run_log(
                    "error",
                    "script.write_failed",
                    json!({"path": target.display().to_string(), "error": err.to_string()}),
                );
                EmitReport {
                    status: EmitStatus::Error,
                    message: format!("failed to write script: {err}"),
                    generated_script_file: None,
                }
            }
        }
    }
}

/// JSON text is a valid JavaScript expression, so serde_json does the quoting.
fn js_literal(value: &Value) -> String {
    serde_json::to_string(value).unwrap_or_else(|_| "null".to_string())
}

const PRELUDE: &str = r#"async function run() {
  const service = spawn(SERVICE_COMMAND, SERVICE_ARGS, {
    stdio: ['pipe', 'pipe', 'inherit'],
    shell: process.platform === 'win32',
  });
  const waiting = new Map();
  let buffered = '';
  let nextId = 1;

  service.stdout.on('data', (chunk) => {
    buffered += chunk.toString();
    let newline;
    while ((newline = buffered.indexOf('\n')) >= 0) {
      const line = buffered.slice(0, newline).trim();
      buffered = buffered.slice(newline + 1);
      if (!line) continue;
      let message;
      try {
        message = JSON.parse(line);
      } catch (err) {
        continue;
      }
      const entry = waiting.get(message.id);
      if (!entry) continue;
      waiting.delete(message.id);
      clearTimeout(entry.timer);
      if (message.error) {
        entry.reject(new Error(message.error.message));
      } else {
        entry.resolve(message.result);
      }
    }
  });

  const call = (method, params) =>
    new Promise((resolve, reject) => {
      const id = `replay_${nextId++}`;
      const timer = setTimeout(() => {
        waiting.delete(id);
        reject(new Error(`${method} timed out`));
      }, CALL_TIMEOUT_MS);
      waiting.set(id, { resolve, reject, timer });
      service.stdin.write(JSON.stringify({ jsonrpc: '2.0', id, method, params }) + '\n');
    });
  const pause = (ms) => new Promise((resolve) => setTimeout(resolve, ms));

  try {
    await call('initialize', {
      protocolVersion: '2024-11-05',
      clientInfo: { name: 'scriptgen-replay', version: '0.1.0' },
      capabilities: {},
    });"#;

const EPILOGUE: &str = r#"    console.log('replay finished');
  } catch (err) {
    console.error('replay failed:', err.message);
    process.exitCode = 1;
  } finally {
    service.kill();
  }
}

run();"#;

/// Captures what it was asked to emit and answers with a canned report.
#[derive(Default, Clone)]
pub struct FakeScriptEmitter {
    calls: Arc<Mutex<Vec<(String, Vec<RecordedAction>, PathBuf)>>>,
    report: Arc<Mutex<Option<EmitReport>>>,
}

impl FakeScriptEmitter {
    pub fn fail_with(&self, message: &str) {
        *lock(&self.report) = Some(EmitReport {
            status: EmitStatus::Error,
            message: message.to_string(),
            generated_script_file: None,
        });
    }

    pub fn calls(&self) -> Vec<(String, Vec<RecordedAction>, PathBuf)> {
        lock(&self.calls).clone()
    }
}

impl ScriptEmitter for FakeScriptEmitter {
    fn emit(&self, page_url: &str, actions: &[RecordedAction], target: &Path) -> EmitReport {
        lock(&self.calls).push((page_url.to_string(), actions.to_vec(), target.to_path_buf()));
        lock(&self.report).clone().unwrap_or_else(|| EmitReport {
            status: EmitStatus::Success,
            message: format!("{} steps", actions.len()),
            generated_script_file: Some(target.to_path_buf()),
        })
    }
}
