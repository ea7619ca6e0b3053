use crate::config::HealthCheckConfig;
use crate::errors::ProxyError;
use crate::jsonrpc::{request_line, RequestId};
use crate::logging::append_run_log;
use crate::runtime::{Clock, Scheduler, Timer, TimerSchedule};
use crate::supervisor::Supervisor;
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProbeOutcome {
    Sent { id: RequestId, demoted: bool },
    /// No process existed; a start was requested instead of probing.
    StartRequested,
    /// No process existed and spawning one failed.
    StartFailed { error: ProxyError },
    WriteFailed,
}

/// Decides readiness by sending private requests whose ids carry a reserved
/// prefix and watching for their responses.
pub struct HealthMonitor {
    method: String,
    id_prefix: String,
    interval: Duration,
    max_missed_probes: u32,
    clock: Arc<dyn Clock>,
    scheduler: Arc<dyn Scheduler>,
    last_stamp: u64,
    awaiting_response: bool,
    missed: u32,
}

impl HealthMonitor {
    pub fn new(
        cfg: &HealthCheckConfig,
        clock: Arc<dyn Clock>,
        scheduler: Arc<dyn Scheduler>,
    ) -> Self {
        Self {
            method: cfg.method.clone(),
            id_prefix: cfg.id_prefix.clone(),
            interval: cfg.interval(),
            max_missed_probes: cfg.max_missed_probes,
            clock,
            scheduler,
            last_stamp: 0,
            awaiting_response: false,
            missed: 0,
        }
    }

    pub fn is_probe_id(&self, id: &RequestId) -> bool {
        id.as_text()
            .is_some_and(|text| text.starts_with(&self.id_prefix))
    }

    /// Time-derived and strictly increasing, even when the clock stalls.
    pub fn next_probe_id(&mut self) -> RequestId {
        let stamp = self.clock.now_millis().max(self.last_stamp + 1);
        self.last_stamp = stamp;
        RequestId::Text(format!("{}{stamp}", self.id_prefix))
    }

    pub fn probe(&mut self, supervisor: &mut Supervisor) -> ProbeOutcome {
        if !supervisor.has_process() {
            return match supervisor.start() {
                Ok(_) => ProbeOutcome::StartRequested,
                Err(error) => ProbeOutcome::StartFailed { error },
            };
        }

        let mut demoted = false;
        if self.awaiting_response {
            self.missed += 1;
            if self.max_missed_probes > 0
                && self.missed >= self.max_missed_probes
                && supervisor.is_ready()
            {
                supervisor.mark_not_ready();
                demoted = true;
                append_run_log(
                    "warn",
                    "health.demoted",
                    json!({"missed": self.missed, "generation": supervisor.generation()}),
                );
            }
        }

        let id = self.next_probe_id();
        let line = request_line(&id, &self.method, None);
        if let Err(err) = supervisor.write_line(&line) {
            self.scheduler.cancel(&Timer::ProbeInterval);
            supervisor.mark_not_ready();
            append_run_log(
                "warn",
                "health.probe.write_failed",
                json!({"id": id.to_string(), "error": err.to_string()}),
            );
            return ProbeOutcome::WriteFailed;
        }
        self.awaiting_response = true;
        append_run_log("debug", "health.probe.sent", json!({"id": id.to_string()}));
        ProbeOutcome::Sent { id, demoted }
    }

    /// Returns true when this response moved the service to ready; the caller
    /// then drains the queue.
    pub fn on_probe_response(&mut self, supervisor: &mut Supervisor) -> bool {
        self.awaiting_response = false;
        self.missed = 0;
        if !supervisor.has_process() || supervisor.is_ready() {
            return false;
        }
        supervisor.mark_ready();
        self.scheduler.cancel(&Timer::StartupDeadline);
        self.scheduler
            .schedule(Timer::ProbeInterval, TimerSchedule::Every(self.interval));
        append_run_log(
            "info",
            "service.ready",
            json!({"generation": supervisor.generation()}),
        );
        true
    }

    /// Forgets probe bookkeeping for a process that went away.
    pub fn reset(&mut self) {
        self.awaiting_response = false;
        self.missed = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::{HealthMonitor, ProbeOutcome};
    use crate::config::AppConfig;
    use crate::errors::ProxyError;
    use crate::jsonrpc::RequestId;
    use crate::runtime::{
        FakeChildLauncher, FakeClock, FakeScheduler, LaunchRequest, Timer, TimerSchedule,
    };
    use crate::supervisor::Supervisor;
    use serde_json::Value;
    use std::sync::Arc;
    use std::time::Duration;

    struct Harness {
        monitor: HealthMonitor,
        supervisor: Supervisor,
        launcher: FakeChildLauncher,
        scheduler: FakeScheduler,
    }

    fn harness(max_missed_probes: u32) -> Harness {
        let mut cfg = AppConfig::default();
        cfg.health_check.max_missed_probes = max_missed_probes;
        let launcher = FakeChildLauncher::default();
        let scheduler = FakeScheduler::default();
        let supervisor = Supervisor::new(
            LaunchRequest {
                program: "npx".to_string(),
                args: vec![],
                cwd: None,
            },
            &cfg.service,
            &cfg.health_check,
            Arc::new(launcher.clone()),
            Arc::new(scheduler.clone()),
        );
        let monitor = HealthMonitor::new(
            &cfg.health_check,
            Arc::new(FakeClock::default()),
            Arc::new(scheduler.clone()),
        );
        Harness {
            monitor,
            supervisor,
            launcher,
            scheduler,
        }
    }

    #[test]
    fn probe_ids_are_prefixed_and_strictly_increasing() {
        let mut h = harness(0);
        let first = h.monitor.next_probe_id();
        let second = h.monitor.next_probe_id();
        assert_eq!(first, RequestId::from("health_check_1700000000000"));
        assert_eq!(second, RequestId::from("health_check_1700000000001"));
        assert!(h.monitor.is_probe_id(&first));
        assert!(!h.monitor.is_probe_id(&RequestId::from("check_health_1")));
        assert!(!h.monitor.is_probe_id(&RequestId::Number(1)));
    }

    #[test]
    fn probe_without_process_requests_a_start() {
        let mut h = harness(0);
        assert_eq!(
            h.monitor.probe(&mut h.supervisor),
            ProbeOutcome::StartRequested
        );
        assert_eq!(h.launcher.launch_count(), 1);
        assert!(h.launcher.writes().is_empty());
    }

    #[test]
    fn probe_reports_a_start_that_could_not_spawn() {
        let mut h = harness(0);
        h.launcher
            .push_launch_failure(ProxyError::Process("failed to spawn npx".to_string()));
        assert_eq!(
            h.monitor.probe(&mut h.supervisor),
            ProbeOutcome::StartFailed {
                error: ProxyError::Process("failed to spawn npx".to_string())
            }
        );
        assert!(!h.supervisor.has_process());
    }

    #[test]
    fn probe_writes_configured_method_and_first_response_makes_ready() {
        let mut h = harness(0);
        h.supervisor.start().expect("start");
        let outcome = h.monitor.probe(&mut h.supervisor);
        assert!(matches!(outcome, ProbeOutcome::Sent { demoted: false, .. }));

        let written: Value = serde_json::from_str(&h.launcher.writes()[0]).expect("json");
        assert_eq!(written["method"], "ping");
        assert!(written["id"]
            .as_str()
            .expect("text id")
            .starts_with("health_check_"));

        assert!(h.monitor.on_probe_response(&mut h.supervisor));
        assert!(h.supervisor.is_ready());
        assert!(!h.scheduler.is_armed(&Timer::StartupDeadline));
        assert_eq!(
            h.scheduler.schedule_of(&Timer::ProbeInterval),
            Some(TimerSchedule::Every(Duration::from_millis(5_000)))
        );

        assert!(!h.monitor.on_probe_response(&mut h.supervisor));
    }

    #[test]
    fn write_failure_cancels_interval_and_marks_not_ready() {
        let mut h = harness(0);
        h.supervisor.start().expect("start");
        h.monitor.probe(&mut h.supervisor);
        h.monitor.on_probe_response(&mut h.supervisor);

        h.launcher.fail_next_writes(1);
        assert_eq!(h.monitor.probe(&mut h.supervisor), ProbeOutcome::WriteFailed);
        assert!(!h.supervisor.is_ready());
        assert!(!h.scheduler.is_armed(&Timer::ProbeInterval));
    }

    #[test]
    fn missed_probes_never_demote_by_default() {
        let mut h = harness(0);
        h.supervisor.start().expect("start");
        h.monitor.probe(&mut h.supervisor);
        h.monitor.on_probe_response(&mut h.supervisor);
        for _ in 0..10 {
            h.monitor.probe(&mut h.supervisor);
        }
        assert!(h.supervisor.is_ready());
    }

    #[test]
    fn missed_probes_demote_when_limit_is_configured() {
        let mut h = harness(2);
        h.supervisor.start().expect("start");
        h.monitor.probe(&mut h.supervisor);
        h.monitor.on_probe_response(&mut h.supervisor);

        assert!(matches!(
            h.monitor.probe(&mut h.supervisor),
            ProbeOutcome::Sent { demoted: false, .. }
        ));
        assert!(matches!(
            h.monitor.probe(&mut h.supervisor),
            ProbeOutcome::Sent { demoted: false, .. }
        ));
        assert!(matches!(
            h.monitor.probe(&mut h.supervisor),
            ProbeOutcome::Sent { demoted: true, .. }
        ));
        assert!(!h.supervisor.is_ready());

        assert!(h.monitor.on_probe_response(&mut h.supervisor));
        assert!(h.supervisor.is_ready());
    }
}
