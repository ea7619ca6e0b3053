use crate::config::{HealthCheckConfig, ServiceConfig};
use crate::errors::ProxyError;
use crate::logging::append_run_log;
use crate::runtime::{ChildLauncher, ChildLink, LaunchRequest, Scheduler, Timer, TimerSchedule};
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServiceState {
    NoProcess,
    Starting,
    Ready,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StartOutcome {
    AlreadyRunning { ready: bool },
    Spawned { generation: u64 },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitOutcome {
    /// The event belonged to an older process and was ignored.
    Stale,
    Stopped,
    RestartScheduled,
}

/// Owns the single browser service process: spawning, readiness flag,
/// exit handling and the restart policy. Every spawn gets a new generation
/// so that output or exit events from a replaced process are ignored.
pub struct Supervisor {
    request: LaunchRequest,
    launcher: Arc<dyn ChildLauncher>,
    scheduler: Arc<dyn Scheduler>,
    link: Option<Box<dyn ChildLink>>,
    generation: u64,
    ready: bool,
    startup_timeout: Duration,
    restart_backoff: Duration,
    first_probe_delay: Duration,
}

impl Supervisor {
    pub fn new(
        request: LaunchRequest,
        service: &ServiceConfig,
        health: &HealthCheckConfig,
        launcher: Arc<dyn ChildLauncher>,
        scheduler: Arc<dyn Scheduler>,
    ) -> Self {
        Self {
            request,
            launcher,
            scheduler,
            link: None,
            generation: 0,
            ready: false,
            startup_timeout: service.startup_timeout(),
            restart_backoff: service.restart_backoff(),
            first_probe_delay: health.initial_delay(),
        }
    }

    pub fn state(&self) -> ServiceState {
        match (&self.link, self.ready) {
            (None, _) => ServiceState::NoProcess,
            (Some(_), false) => ServiceState::Starting,
            (Some(_), true) => ServiceState::Ready,
        }
    }

    pub fn is_ready(&self) -> bool {
        self.link.is_some() && self.ready
    }

    pub fn has_process(&self) -> bool {
        self.link.is_some()
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn is_current(&self, generation: u64) -> bool {
        self.link.is_some() && generation == self.generation
    }

    pub fn startup_timeout(&self) -> Duration {
        self.startup_timeout
    }

    pub fn start(&mut self) -> Result<StartOutcome, ProxyError> {
        if self.link.is_some() {
            return Ok(StartOutcome::AlreadyRunning { ready: self.ready });
        }
        self.scheduler.cancel(&Timer::Restart);
        self.generation += 1;
        self.ready = false;

        let link = match self.launcher.launch(&self.request, self.generation) {
            Ok(link) => link,
            Err(err) => {
                append_run_log(
                    "error",
                    "service.spawn.failed",
                    json!({
                        "program": self.request.program,
                        "generation": self.generation,
                        "error": err.to_string()
                    }),
                );
                return Err(err);
            }
        };
        self.link = Some(link);
        self.scheduler
            .schedule(Timer::FirstProbe, TimerSchedule::Once(self.first_probe_delay));
        self.scheduler
            .schedule(Timer::StartupDeadline, TimerSchedule::Once(self.startup_timeout));
        append_run_log(
            "info",
            "service.spawned",
            json!({
                "program": self.request.program,
                "args": self.request.args,
                "generation": self.generation
            }),
        );
        Ok(StartOutcome::Spawned {
            generation: self.generation,
        })
    }

    pub fn mark_ready(&mut self) {
        if self.link.is_some() {
            self.ready = true;
        }
    }

    pub fn mark_not_ready(&mut self) {
        self.ready = false;
    }

    pub fn write_line(&mut self, line: &str) -> Result<(), ProxyError> {
        match self.link.as_mut() {
            Some(link) => link.write_line(line),
            None => Err(ProxyError::ChildWrite(
                "browser service is not running".to_string(),
            )),
        }
    }

    pub fn on_exit(&mut self, generation: u64, code: Option<i32>) -> ExitOutcome {
        if !self.is_current(generation) {
            return ExitOutcome::Stale;
        }
        self.release();
        if code == Some(0) {
            append_run_log(
                "info",
                "service.exited",
                json!({"generation": generation, "code": 0}),
            );
            return ExitOutcome::Stopped;
        }
        append_run_log(
            "warn",
            "service.exited",
            json!({
                "generation": generation,
                "code": code,
                "restart_in_ms": self.restart_backoff.as_millis() as u64
            }),
        );
        self.scheduler
            .schedule(Timer::Restart, TimerSchedule::Once(self.restart_backoff));
        ExitOutcome::RestartScheduled
    }

    /// Process error after spawn; the handle is dropped without a restart.
    pub fn on_failed(&mut self, generation: u64, error: &str) -> ExitOutcome {
        if !self.is_current(generation) {
            return ExitOutcome::Stale;
        }
        self.release();
        append_run_log(
            "error",
            "service.failed",
            json!({"generation": generation, "error": error}),
        );
        ExitOutcome::Stopped
    }

    /// Drops a process whose stdin broke so the next start spawns a fresh one.
    pub fn teardown(&mut self) {
        if let Some(mut link) = self.link.take() {
            let _ = link.kill();
        }
        self.ready = false;
        self.cancel_probe_timers();
        append_run_log(
            "warn",
            "service.teardown",
            json!({"generation": self.generation}),
        );
    }

    pub fn terminate(&mut self) {
        self.scheduler.cancel_all();
        if let Some(mut link) = self.link.take() {
            if let Err(err) = link.kill() {
                append_run_log(
                    "warn",
                    "service.kill.failed",
                    json!({"generation": self.generation, "error": err.to_string()}),
                );
            }
        }
        self.ready = false;
    }

    fn release(&mut self) {
        self.link = None;
        self.ready = false;
        self.cancel_probe_timers();
    }

    fn cancel_probe_timers(&self) {
        self.scheduler.cancel(&Timer::FirstProbe);
        self.scheduler.cancel(&Timer::ProbeInterval);
        self.scheduler.cancel(&Timer::StartupDeadline);
    }
}
