use crate::config::AppConfig;
use crate::errors::ProxyError;
use crate::health::{HealthMonitor, ProbeOutcome};
use crate::jsonrpc::{
    error_line_for, parse_client_line, success_line, ChildMessage, ClientMessage, RequestId,
};
use crate::logging::{append_run_log, loggable_line};
use crate::queue::{PendingQueue, QueuedRequest};
use crate::replay::action::{derive_action, RecordedAction};
use crate::replay::emitter::ScriptEmitter;
use crate::replay::log::RequestRecorder;
use crate::router::{ChildOutput, CorrelationRouter, DispatchOutcome, PendingCall, ResponsePlan};
use crate::runtime::{LaunchRequest, ProxyEvent, ProxyRuntime, Timer, TimerSchedule};
use crate::supervisor::{ExitOutcome, ServiceState, StartOutcome, Supervisor};
use crate::tools::{local_tool_definition, merge_tool_list};
use serde_json::{json, Value};
use std::time::Duration;

/// Entry point for everything the client sends and everything the browser
/// service answers. Owns all proxy state; the control loop feeds it one
/// event at a time.
pub struct Gateway {
    config: AppConfig,
    runtime: ProxyRuntime,
    supervisor: Supervisor,
    health: HealthMonitor,
    router: CorrelationRouter,
    queue: PendingQueue,
    recorder: Box<dyn RequestRecorder>,
    emitter: Box<dyn ScriptEmitter>,
    local_tool: Value,
    current_page_url: String,
    startup_trigger: Option<RequestId>,
    call_timeout: Duration,
}

impl Gateway {
    pub fn new(
        config: AppConfig,
        launch: LaunchRequest,
        runtime: ProxyRuntime,
        recorder: Box<dyn RequestRecorder>,
        emitter: Box<dyn ScriptEmitter>,
    ) -> Self {
        let supervisor = Supervisor::new(
            launch,
            &config.service,
            &config.health_check,
            runtime.launcher.clone(),
            runtime.scheduler.clone(),
        );
        let health = HealthMonitor::new(
            &config.health_check,
            runtime.clock.clone(),
            runtime.scheduler.clone(),
        );
        Self {
            router: CorrelationRouter::new(config.service.max_write_retries),
            queue: PendingQueue::default(),
            local_tool: local_tool_definition(&config.tool),
            call_timeout: config.service.call_timeout(),
            current_page_url: String::new(),
            startup_trigger: None,
            supervisor,
            health,
            recorder,
            emitter,
            runtime,
            config,
        }
    }

    pub fn is_ready(&self) -> bool {
        self.supervisor.is_ready()
    }

    pub fn service_state(&self) -> ServiceState {
        self.supervisor.state()
    }

    pub fn current_page_url(&self) -> &str {
        &self.current_page_url
    }

    pub fn recorded_actions(&self) -> &[RecordedAction] {
        self.recorder.actions()
    }

    pub fn pending_count(&self) -> usize {
        self.router.len()
    }

    pub fn queued_count(&self) -> usize {
        self.queue.len()
    }

    /// Nothing is waiting on the browser service.
    pub fn is_idle(&self) -> bool {
        self.router.is_empty() && self.queue.is_empty()
    }

    /// Starts the browser service ahead of the first request.
    pub fn start_service(&mut self) -> Result<StartOutcome, ProxyError> {
        let outcome = self.supervisor.start()?;
        if matches!(outcome, StartOutcome::Spawned { .. }) {
            self.health.reset();
        }
        Ok(outcome)
    }

    pub fn handle_event(&mut self, event: ProxyEvent) {
        match event {
            ProxyEvent::ClientLine(line) => self.handle_client_line(&line),
            ProxyEvent::ChildStdout { generation, line } => self.on_child_stdout(generation, &line),
            ProxyEvent::ChildStderr { generation, line } => self.on_child_stderr(generation, &line),
            ProxyEvent::ChildExited { generation, code } => self.on_child_exit(generation, code),
            ProxyEvent::ChildFailed { generation, error } => {
                self.on_child_failed(generation, &error)
            }
            ProxyEvent::Timer(timer) => self.on_timer(timer),
            ProxyEvent::ClientClosed | ProxyEvent::Shutdown => {}
        }
    }

    pub fn handle_client_line(&mut self, line: &str) {
        if line.trim().is_empty() {
            return;
        }
        let message = match parse_client_line(line) {
            Ok(message) => message,
            Err(err) => {
                append_run_log(
                    "warn",
                    "client.rejected",
                    json!({"error": err.to_string(), "line": loggable_line(line)}),
                );
                self.reply(&error_line_for(None, &err));
                return;
            }
        };

        if let Some(id) = message.id.as_ref().filter(|_| message.expects_response()) {
            if let Err(err) = self.check_request_id(id) {
                append_run_log(
                    "warn",
                    "client.rejected",
                    json!({"id": id.to_value(), "error": err.to_string()}),
                );
                self.reply(&error_line_for(Some(id), &err));
                return;
            }
        }

        if message.tool_name() == Some(self.config.tool.name.as_str()) {
            self.generate_script(&message);
            return;
        }

        let id = if message.expects_response() {
            message.id.clone()
        } else {
            None
        };
        if let Err(err) = self.ensure_started(id.as_ref()) {
            if let Some(id) = &id {
                self.reply(&error_line_for(Some(id), &err));
            }
            self.fail_queued(&err);
            return;
        }

        if let Some(action) = derive_action(&message, &self.config.tool.name) {
            if let Err(err) = self.recorder.record(action) {
                append_run_log(
                    "warn",
                    "recording.write_failed",
                    json!({"method": message.method(), "error": err.to_string()}),
                );
            }
        }

        let plan = response_plan(&message);
        if let Some(id) = &id {
            self.runtime.scheduler.schedule(
                Timer::CallDeadline(id.clone()),
                TimerSchedule::Once(self.call_timeout),
            );
        }
        append_run_log(
            "debug",
            "client.request",
            json!({
                "method": message.method(),
                "id": id.as_ref().map(RequestId::to_value),
                "ready": self.supervisor.is_ready()
            }),
        );
        let entry = QueuedRequest::new(id, message.raw, plan);
        let outcome = self
            .router
            .dispatch(&mut self.supervisor, &mut self.queue, entry);
        self.handle_dispatch_outcome(outcome);
    }

    pub fn on_child_stdout(&mut self, generation: u64, line: &str) {
        if !self.supervisor.is_current(generation) {
            append_run_log(
                "debug",
                "child.stdout.stale",
                json!({"generation": generation, "line": loggable_line(line)}),
            );
            return;
        }
        match self.router.classify(line, &self.health) {
            ChildOutput::Probe => {
                if self.health.on_probe_response(&mut self.supervisor) {
                    self.startup_trigger = None;
                    self.drain_queue();
                }
            }
            ChildOutput::Matched { call, message, raw } => {
                self.runtime
                    .scheduler
                    .cancel(&Timer::CallDeadline(call.id.clone()));
                self.complete(call, message, &raw);
            }
            ChildOutput::Unmatched { raw } => self.reply(&raw),
            ChildOutput::Late { id } => append_run_log(
                "info",
                "child.response.late",
                json!({"id": id.to_value()}),
            ),
            ChildOutput::Garbage { error } => append_run_log(
                "debug",
                "child.stdout.unparsed",
                json!({"error": error.to_string(), "line": loggable_line(line)}),
            ),
        }
    }

    pub fn on_child_stderr(&mut self, generation: u64, line: &str) {
        append_run_log(
            "info",
            "child.stderr",
            json!({"generation": generation, "line": loggable_line(line)}),
        );
    }

    pub fn on_child_exit(&mut self, generation: u64, code: Option<i32>) {
        if self.supervisor.on_exit(generation, code) == ExitOutcome::Stale {
            return;
        }
        self.health.reset();
        let detail = match code {
            Some(code) => format!("code {code}"),
            None => "a signal".to_string(),
        };
        let orphaned = self.router.take_generation(generation);
        self.fail_calls(orphaned, &ProxyError::ChildExit(detail));
    }

    pub fn on_child_failed(&mut self, generation: u64, error: &str) {
        if self.supervisor.on_failed(generation, error) == ExitOutcome::Stale {
            return;
        }
        self.health.reset();
        let orphaned = self.router.take_generation(generation);
        self.fail_calls(orphaned, &ProxyError::ChildExit(error.to_string()));
    }

    pub fn on_timer(&mut self, timer: Timer) {
        match timer {
            Timer::FirstProbe | Timer::ProbeInterval => {
                match self.health.probe(&mut self.supervisor) {
                    ProbeOutcome::StartRequested => self.health.reset(),
                    ProbeOutcome::StartFailed { error } => self.fail_queued(&error),
                    ProbeOutcome::Sent { .. } | ProbeOutcome::WriteFailed => {}
                }
            }
            Timer::StartupDeadline => self.on_startup_deadline(),
            Timer::Restart => {
                if self.supervisor.has_process() {
                    return;
                }
                match self.supervisor.start() {
                    Ok(_) => self.health.reset(),
                    Err(err) => self.fail_queued(&err),
                }
            }
            Timer::CallDeadline(id) => self.on_call_deadline(&id),
            Timer::ShutdownGrace => {}
        }
    }

    /// Kills the service and stops all timers. Calls still waiting are
    /// abandoned without a reply.
    pub fn terminate(&mut self) {
        append_run_log(
            "info",
            "gateway.terminate",
            json!({"pending": self.router.len(), "queued": self.queue.len()}),
        );
        self.supervisor.terminate();
    }

    /// Probe ids share the child's id space, and an id may only be in flight once.
    fn check_request_id(&self, id: &RequestId) -> Result<(), ProxyError> {
        if self.health.is_probe_id(id) {
            return Err(ProxyError::InvalidRequest(format!(
                "id prefix {} is reserved",
                self.config.health_check.id_prefix
            )));
        }
        if self.router.is_pending(id) || self.queue.contains(id) {
            return Err(ProxyError::InvalidRequest(format!(
                "request id {id} is already in flight"
            )));
        }
        Ok(())
    }

    fn ensure_started(&mut self, trigger: Option<&RequestId>) -> Result<(), ProxyError> {
        if self.supervisor.has_process() {
            return Ok(());
        }
        if let StartOutcome::Spawned { .. } = self.start_service()? {
            self.startup_trigger = trigger.cloned();
        }
        Ok(())
    }

    fn on_startup_deadline(&mut self) {
        if self.supervisor.is_ready() || !self.supervisor.has_process() {
            return;
        }
        let timeout_ms = self.supervisor.startup_timeout().as_millis() as u64;
        append_run_log(
            "error",
            "service.startup_timeout",
            json!({"timeout_ms": timeout_ms, "queued": self.queue.len()}),
        );
        let Some(id) = self.startup_trigger.take() else {
            return;
        };
        if self.queue.remove(&id).is_some() {
            self.runtime
                .scheduler
                .cancel(&Timer::CallDeadline(id.clone()));
            self.reply(&error_line_for(
                Some(&id),
                &ProxyError::StartupTimeout(timeout_ms),
            ));
        }
    }

    fn on_call_deadline(&mut self, id: &RequestId) {
        let expired = self.router.expire(id).is_some() || self.queue.remove(id).is_some();
        if !expired {
            return;
        }
        if self.startup_trigger.as_ref() == Some(id) {
            self.startup_trigger = None;
        }
        let timeout_ms = self.call_timeout.as_millis() as u64;
        append_run_log(
            "warn",
            "client.request.timeout",
            json!({"id": id.to_value(), "timeout_ms": timeout_ms}),
        );
        self.reply(&error_line_for(Some(id), &ProxyError::Timeout(timeout_ms)));
    }

    fn drain_queue(&mut self) {
        let outcomes = self.router.drain(&mut self.supervisor, &mut self.queue);
        for outcome in outcomes {
            self.handle_dispatch_outcome(outcome);
        }
    }

    fn handle_dispatch_outcome(&mut self, outcome: DispatchOutcome) {
        match outcome {
            DispatchOutcome::Queued | DispatchOutcome::Sent => {}
            DispatchOutcome::Retrying { orphaned } => {
                self.health.reset();
                self.fail_calls(
                    orphaned,
                    &ProxyError::ChildWrite("browser service connection was reset".to_string()),
                );
            }
            DispatchOutcome::RespawnFailed { error, orphaned } => {
                self.health.reset();
                self.fail_calls(
                    orphaned,
                    &ProxyError::ChildWrite("browser service connection was reset".to_string()),
                );
                self.fail_queued(&error);
            }
            DispatchOutcome::Abandoned {
                entry,
                error,
                orphaned,
            } => {
                self.health.reset();
                self.fail_calls(orphaned, &error);
                append_run_log(
                    "error",
                    "client.request.abandoned",
                    json!({
                        "id": entry.id.as_ref().map(RequestId::to_value),
                        "attempts": entry.attempts,
                        "error": error.to_string()
                    }),
                );
                if let Some(id) = &entry.id {
                    self.runtime
                        .scheduler
                        .cancel(&Timer::CallDeadline(id.clone()));
                    self.reply(&error_line_for(Some(id), &error));
                }
            }
        }
    }

    /// Without a process nothing will serve the queue, so every queued request
    /// is answered with `error`.
    fn fail_queued(&mut self, error: &ProxyError) {
        self.startup_trigger = None;
        let stranded = self.queue.take_all();
        if stranded.is_empty() {
            return;
        }
        append_run_log(
            "error",
            "client.queue.failed",
            json!({"count": stranded.len(), "error": error.to_string()}),
        );
        for entry in stranded {
            if let Some(id) = &entry.id {
                self.runtime
                    .scheduler
                    .cancel(&Timer::CallDeadline(id.clone()));
                self.reply(&error_line_for(Some(id), error));
            }
        }
    }

    fn fail_calls(&mut self, calls: Vec<PendingCall>, error: &ProxyError) {
        for call in calls {
            self.runtime
                .scheduler
                .cancel(&Timer::CallDeadline(call.id.clone()));
            self.reply(&error_line_for(Some(&call.id), error));
        }
    }

    fn complete(&mut self, call: PendingCall, message: ChildMessage, raw: &str) {
        match call.plan {
            ResponsePlan::Relay => self.reply(raw),
            ResponsePlan::MergeTools => {
                let merged = merge_tool_list(message.value, &self.local_tool);
                self.reply(&merged.to_string());
            }
            ResponsePlan::Navigate { url } => {
                if message.is_success() {
                    append_run_log("info", "page.navigated", json!({"url": url}));
                    self.current_page_url = url;
                }
                self.reply(raw);
            }
        }
    }

    fn generate_script(&mut self, message: &ClientMessage) {
        let file_name = format!(
            "{}-{}.js",
            self.config.script_generation.file_stem,
            self.runtime.clock.now_millis()
        );
        let target = self.config.script_generation.output_dir.join(file_name);
        let report = self
            .emitter
            .emit(&self.current_page_url, self.recorder.actions(), &target);

        if report.is_success() {
            if let Err(err) = self.recorder.clear() {
                append_run_log(
                    "warn",
                    "recording.clear_failed",
                    json!({"error": err.to_string()}),
                );
            }
        }

        let Some(id) = message.id.as_ref() else {
            return;
        };
        let text = match &report.generated_script_file {
            Some(path) => format!("Script saved to: {}", path.display()),
            None => format!("Script generation failed: {}", report.message),
        };
        let mut result = serde_json::to_value(&report).unwrap_or_else(|_| json!({}));
        if let Some(fields) = result.as_object_mut() {
            fields.insert("content".to_string(), json!([{"type": "text", "text": text}]));
            fields.insert("isError".to_string(), json!(!report.is_success()));
        }
        self.reply(&success_line(id, result));
    }

    fn reply(&self, line: &str) {
        if let Err(err) = self.runtime.sink.write_line(line) {
            append_run_log(
                "error",
                "client.write_failed",
                json!({"error": err.to_string()}),
            );
        }
    }
}

/// Navigation is recognised both as the raw browser method and as the
/// `browser_navigate` tool.
fn response_plan(message: &ClientMessage) -> ResponsePlan {
    let url = match message.method() {
        "tools/list" => return ResponsePlan::MergeTools,
        "browser/navigate" => message.params.get("url"),
        "tools/call" if message.tool_name() == Some("browser_navigate") => {
            message.tool_arguments().and_then(|args| args.get("url"))
        }
        _ => None,
    };
    match url.and_then(Value::as_str) {
        Some(url) => ResponsePlan::Navigate {
            url: url.to_string(),
        },
        None => ResponsePlan::Relay,
    }
}
