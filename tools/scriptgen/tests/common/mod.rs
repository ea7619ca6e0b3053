#![allow(dead_code)]

use scriptgen::config::AppConfig;
use scriptgen::gateway::Gateway;
use scriptgen::replay::emitter::FakeScriptEmitter;
use scriptgen::replay::log::ActionLog;
use scriptgen::runtime::{
    FakeChildLauncher, FakeClientSink, FakeClock, FakeFileSystem, FakeScheduler, LaunchRequest,
    ProxyEvent, ProxyRuntime, Timer,
};
use serde_json::{json, Value};
use std::path::PathBuf;
use std::sync::Arc;

pub const PROBE_PREFIX: &str = "health_check_";
pub const ACTION_LOG: &str = "/work/.scriptgen/test-steps.json";
pub const OUTPUT_DIR: &str = "/work/generated-scripts";

/// A gateway wired to fakes, driven one event at a time.
pub struct Harness {
    pub gateway: Gateway,
    pub launcher: FakeChildLauncher,
    pub scheduler: FakeScheduler,
    pub sink: FakeClientSink,
    pub clock: FakeClock,
    pub fs: FakeFileSystem,
    pub emitter: FakeScriptEmitter,
}

impl Harness {
    pub fn new() -> Self {
        Self::with_config(AppConfig::default())
    }

    pub fn with_config(mut config: AppConfig) -> Self {
        config.script_generation.output_dir = PathBuf::from(OUTPUT_DIR);
        config.recording.action_log_path = PathBuf::from(ACTION_LOG);
        Self::with_parts(config, FakeFileSystem::default())
    }

    pub fn with_parts(config: AppConfig, fs: FakeFileSystem) -> Self {
        let launcher = FakeChildLauncher::default();
        let scheduler = FakeScheduler::default();
        let sink = FakeClientSink::default();
        let clock = FakeClock::default();
        let emitter = FakeScriptEmitter::default();
        let runtime = ProxyRuntime {
            clock: Arc::new(clock.clone()),
            file_system: Arc::new(fs.clone()),
            launcher: Arc::new(launcher.clone()),
            scheduler: Arc::new(scheduler.clone()),
            sink: Arc::new(sink.clone()),
        };
        let recorder = ActionLog::load(&config.recording.action_log_path, Arc::new(fs.clone()));
        let gateway = Gateway::new(
            config,
            LaunchRequest {
                program: "npx".to_string(),
                args: vec!["@playwright/mcp@latest".to_string()],
                cwd: None,
            },
            runtime,
            Box::new(recorder),
            Box::new(emitter.clone()),
        );
        Self {
            gateway,
            launcher,
            scheduler,
            sink,
            clock,
            fs,
            emitter,
        }
    }

    pub fn send(&mut self, line: &str) {
        self.gateway.handle_client_line(line);
    }

    pub fn send_json(&mut self, value: Value) {
        self.send(&value.to_string());
    }

    /// Lets an armed timer elapse. Returns false when it was not armed.
    pub fn fire(&mut self, timer: Timer) -> bool {
        if !self.scheduler.fire(&timer) {
            return false;
        }
        self.gateway.handle_event(ProxyEvent::Timer(timer));
        true
    }

    pub fn generation(&self) -> u64 {
        self.launcher.last_generation().unwrap_or(0)
    }

    pub fn child_says(&mut self, value: Value) {
        let generation = self.generation();
        self.gateway.handle_event(ProxyEvent::ChildStdout {
            generation,
            line: value.to_string(),
        });
    }

    pub fn child_exits(&mut self, code: Option<i32>) {
        let generation = self.generation();
        self.gateway
            .handle_event(ProxyEvent::ChildExited { generation, code });
    }

    pub fn last_probe_id(&self) -> Option<String> {
        self.launcher
            .writes()
            .iter()
            .rev()
            .filter_map(|line| serde_json::from_str::<Value>(line).ok())
            .filter_map(|value| value["id"].as_str().map(str::to_string))
            .find(|id| id.starts_with(PROBE_PREFIX))
    }

    /// Fires the first probe and answers it.
    pub fn make_ready(&mut self) {
        if self.gateway.start_service().is_err() {
            return;
        }
        self.fire(Timer::FirstProbe);
        if let Some(id) = self.last_probe_id() {
            self.child_says(json!({"jsonrpc": "2.0", "id": id, "result": {}}));
        }
    }

    pub fn replies(&self) -> Vec<Value> {
        self.sink.replies()
    }

    pub fn take_replies(&self) -> Vec<Value> {
        self.sink
            .take_lines()
            .iter()
            .map(|line| serde_json::from_str(line).unwrap_or(Value::Null))
            .collect()
    }

    /// Client traffic written to the child, probes excluded.
    pub fn forwarded(&self) -> Vec<Value> {
        self.launcher.forwarded(PROBE_PREFIX)
    }
}
