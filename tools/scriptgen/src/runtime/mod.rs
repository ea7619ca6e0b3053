use crate::errors::ProxyError;
use crate::jsonrpc::RequestId;
use serde_json::Value;
use std::collections::HashMap;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

pub mod child;
pub mod timers;

pub use child::TokioChildLauncher;
pub use timers::TokioScheduler;

/// Everything the single control loop reacts to. Background tasks only ever
/// produce these; they never touch proxy state themselves.
#[derive(Debug, Clone, PartialEq)]
pub enum ProxyEvent {
    ClientLine(String),
    ClientClosed,
    ChildStdout { generation: u64, line: String },
    ChildStderr { generation: u64, line: String },
    ChildExited { generation: u64, code: Option<i32> },
    ChildFailed { generation: u64, error: String },
    Timer(Timer),
    Shutdown,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Timer {
    FirstProbe,
    ProbeInterval,
    StartupDeadline,
    Restart,
    CallDeadline(RequestId),
    ShutdownGrace,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimerSchedule {
    Once(Duration),
    Every(Duration),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LaunchRequest {
    pub program: String,
    pub args: Vec<String>,
    pub cwd: Option<PathBuf>,
}

pub trait Clock: Send + Sync {
    fn now(&self) -> SystemTime;

    fn now_millis(&self) -> u64 {
        self.now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis() as u64)
            .unwrap_or(0)
    }
}

pub trait FileSystem: Send + Sync {
    fn read_to_string(&self, path: &Path) -> Result<String, ProxyError>;
    fn write_string(&self, path: &Path, contents: &str) -> Result<(), ProxyError>;
    fn create_dir_all(&self, path: &Path) -> Result<(), ProxyError>;
    fn exists(&self, path: &Path) -> bool;
}

/// Where replies for the client end up (stdout in production).
pub trait ClientSink: Send + Sync {
    fn write_line(&self, line: &str) -> Result<(), ProxyError>;
}

/// Input side and kill switch of one running browser service process.
pub trait ChildLink: Send {
    fn write_line(&mut self, line: &str) -> Result<(), ProxyError>;
    fn kill(&mut self) -> Result<(), ProxyError>;
}

pub trait ChildLauncher: Send + Sync {
    /// Spawns the service. Output, exit and failure of the process are reported
    /// later as `ProxyEvent`s tagged with `generation`.
    fn launch(
        &self,
        request: &LaunchRequest,
        generation: u64,
    ) -> Result<Box<dyn ChildLink>, ProxyError>;
}

/// Keyed timers; scheduling a key that is already armed replaces it.
pub trait Scheduler: Send + Sync {
    fn schedule(&self, timer: Timer, schedule: TimerSchedule);
    fn cancel(&self, timer: &Timer);
    fn cancel_all(&self);
}

pub struct ProductionClock;

impl Clock for ProductionClock {
    fn now(&self) -> SystemTime {
        SystemTime::now()
    }
}

pub struct ProductionFileSystem;

impl FileSystem for ProductionFileSystem {
    fn read_to_string(&self, path: &Path) -> Result<String, ProxyError> {
        std::fs::read_to_string(path).map_err(|e| ProxyError::Io(e.to_string()))
    }

    fn write_string(&self, path: &Path, contents: &str) -> Result<(), ProxyError> {
        std::fs::write(path, contents).map_err(|e| ProxyError::Io(e.to_string()))
    }

    fn create_dir_all(&self, path: &Path) -> Result<(), ProxyError> {
        std::fs::create_dir_all(path).map_err(|e| ProxyError::Io(e.to_string()))
    }

    fn exists(&self, path: &Path) -> bool {
        path.exists()
    }
}

pub struct StdoutSink;

impl ClientSink for StdoutSink {
    fn write_line(&self, line: &str) -> Result<(), ProxyError> {
        let mut out = std::io::stdout().lock();
        writeln!(out, "{line}").map_err(|e| ProxyError::Io(e.to_string()))?;
        out.flush().map_err(|e| ProxyError::Io(e.to_string()))
    }
}

/// Collaborators the gateway talks to, bundled the same way for production
/// and for tests.
#[derive(Clone)]
pub struct ProxyRuntime {
    pub clock: Arc<dyn Clock>,
    pub file_system: Arc<dyn FileSystem>,
    pub launcher: Arc<dyn ChildLauncher>,
    pub scheduler: Arc<dyn Scheduler>,
    pub sink: Arc<dyn ClientSink>,
}

pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

#[derive(Clone)]
pub struct FakeClock {
    now: Arc<Mutex<SystemTime>>,
}

impl FakeClock {
    pub fn new(now: SystemTime) -> Self {
        Self {
            now: Arc::new(Mutex::new(now)),
        }
    }

    pub fn advance(&self, by: Duration) {
        let mut now = lock(&self.now);
        *now += by;
    }
}

impl Default for FakeClock {
    fn default() -> Self {
        Self::new(UNIX_EPOCH + Duration::from_millis(1_700_000_000_000))
    }
}

impl Clock for FakeClock {
    fn now(&self) -> SystemTime {
        *lock(&self.now)
    }
}

#[derive(Default, Clone)]
pub struct FakeFileSystem {
    files: Arc<Mutex<HashMap<PathBuf, String>>>,
    dirs: Arc<Mutex<Vec<PathBuf>>>,
    fail_next: Arc<Mutex<Option<ProxyError>>>,
}

impl FakeFileSystem {
    pub fn with_file(path: impl Into<PathBuf>, contents: impl Into<String>) -> Self {
        let fs = Self::default();
        lock(&fs.files).insert(path.into(), contents.into());
        fs
    }

    pub fn set_fail_next(&self, error: ProxyError) {
        *lock(&self.fail_next) = Some(error);
    }

    pub fn file(&self, path: &Path) -> Option<String> {
        lock(&self.files).get(path).cloned()
    }

    pub fn created_dirs(&self) -> Vec<PathBuf> {
        lock(&self.dirs).clone()
    }

    fn maybe_fail(&self) -> Result<(), ProxyError> {
        if let Some(err) = lock(&self.fail_next).take() {
            return Err(err);
        }
        Ok(())
    }
}

impl FileSystem for FakeFileSystem {
    fn read_to_string(&self, path: &Path) -> Result<String, ProxyError> {
        self.maybe_fail()?;
        self.file(path)
            .ok_or_else(|| ProxyError::Io(format!("missing file {}", path.display())))
    }

    fn write_string(&self, path: &Path, contents: &str) -> Result<(), ProxyError> {
        self.maybe_fail()?;
        lock(&self.files).insert(path.to_path_buf(), contents.to_string());
        Ok(())
    }

    fn create_dir_all(&self, path: &Path) -> Result<(), ProxyError> {
        self.maybe_fail()?;
        lock(&self.dirs).push(path.to_path_buf());
        Ok(())
    }

    fn exists(&self, path: &Path) -> bool {
        lock(&self.files).contains_key(path)
    }
}

#[derive(Default, Clone)]
pub struct FakeClientSink {
    lines: Arc<Mutex<Vec<String>>>,
}

impl FakeClientSink {
    pub fn lines(&self) -> Vec<String> {
        lock(&self.lines).clone()
    }

    pub fn take_lines(&self) -> Vec<String> {
        std::mem::take(&mut *lock(&self.lines))
    }

    /// Replies parsed back into JSON; lines that are not JSON become `Null`.
    pub fn replies(&self) -> Vec<Value> {
        self.lines()
            .iter()
            .map(|line| serde_json::from_str(line).unwrap_or(Value::Null))
            .collect()
    }
}

impl ClientSink for FakeClientSink {
    fn write_line(&self, line: &str) -> Result<(), ProxyError> {
        lock(&self.lines).push(line.to_string());
        Ok(())
    }
}

#[derive(Default)]
struct FakeChildState {
    launches: Vec<(u64, LaunchRequest)>,
    launch_failures: Vec<ProxyError>,
    writes: Vec<(u64, String)>,
    kills: Vec<u64>,
    failing_writes: usize,
}

#[derive(Default, Clone)]
pub struct FakeChildLauncher {
    state: Arc<Mutex<FakeChildState>>,
}

impl FakeChildLauncher {
    pub fn push_launch_failure(&self, error: ProxyError) {
        lock(&self.state).launch_failures.push(error);
    }

    /// The next `count` writes to any child fail.
    pub fn fail_next_writes(&self, count: usize) {
        lock(&self.state).failing_writes = count;
    }

    pub fn launches(&self) -> Vec<LaunchRequest> {
        lock(&self.state)
            .launches
            .iter()
            .map(|(_, request)| request.clone())
            .collect()
    }

    pub fn launch_count(&self) -> usize {
        lock(&self.state).launches.len()
    }

    pub fn last_generation(&self) -> Option<u64> {
        lock(&self.state).launches.last().map(|(generation, _)| *generation)
    }

    pub fn writes(&self) -> Vec<String> {
        lock(&self.state)
            .writes
            .iter()
            .map(|(_, line)| line.clone())
            .collect()
    }

    pub fn writes_for(&self, generation: u64) -> Vec<String> {
        lock(&self.state)
            .writes
            .iter()
            .filter(|(g, _)| *g == generation)
            .map(|(_, line)| line.clone())
            .collect()
    }

    /// Written lines that are not health probes, parsed as JSON.
    pub fn forwarded(&self, probe_prefix: &str) -> Vec<Value> {
        self.writes()
            .iter()
            .filter_map(|line| serde_json::from_str::<Value>(line).ok())
            .filter(|value| {
                !value
                    .get("id")
                    .and_then(Value::as_str)
                    .is_some_and(|id| id.starts_with(probe_prefix))
            })
            .collect()
    }

    pub fn kills(&self) -> Vec<u64> {
        lock(&self.state).kills.clone()
    }
}

impl ChildLauncher for FakeChildLauncher {
    fn launch(
        &self,
        request: &LaunchRequest,
        generation: u64,
    ) -> Result<Box<dyn ChildLink>, ProxyError> {
        let mut state = lock(&self.state);
        if !state.launch_failures.is_empty() {
            return Err(state.launch_failures.remove(0));
        }
        state.launches.push((generation, request.clone()));
        Ok(Box::new(FakeChildLink {
            generation,
            killed: false,
            state: Arc::clone(&self.state),
        }))
    }
}

struct FakeChildLink {
    generation: u64,
    killed: bool,
    state: Arc<Mutex<FakeChildState>>,
}

impl ChildLink for FakeChildLink {
    fn write_line(&mut self, line: &str) -> Result<(), ProxyError> {
        if self.killed {
            return Err(ProxyError::ChildWrite("stdin closed".to_string()));
        }
        let mut state = lock(&self.state);
        if state.failing_writes > 0 {
            state.failing_writes -= 1;
            return Err(ProxyError::ChildWrite("broken pipe".to_string()));
        }
        state.writes.push((self.generation, line.to_string()));
        Ok(())
    }

    fn kill(&mut self) -> Result<(), ProxyError> {
        self.killed = true;
        lock(&self.state).kills.push(self.generation);
        Ok(())
    }
}

#[derive(Default, Clone)]
pub struct FakeScheduler {
    armed: Arc<Mutex<HashMap<Timer, TimerSchedule>>>,
}

impl FakeScheduler {
    pub fn is_armed(&self, timer: &Timer) -> bool {
        lock(&self.armed).contains_key(timer)
    }

    pub fn schedule_of(&self, timer: &Timer) -> Option<TimerSchedule> {
        lock(&self.armed).get(timer).copied()
    }

    pub fn armed(&self) -> Vec<Timer> {
        lock(&self.armed).keys().cloned().collect()
    }

    /// Simulates the timer elapsing: one-shot timers disarm, periodic ones
    /// stay armed. Returns false when the timer was not armed at all.
    pub fn fire(&self, timer: &Timer) -> bool {
        let mut armed = lock(&self.armed);
        match armed.get(timer).copied() {
            Some(TimerSchedule::Once(_)) => {
                armed.remove(timer);
                true
            }
            Some(TimerSchedule::Every(_)) => true,
            None => false,
        }
    }
}

impl Scheduler for FakeScheduler {
    fn schedule(&self, timer: Timer, schedule: TimerSchedule) {
        lock(&self.armed).insert(timer, schedule);
    }

    fn cancel(&self, timer: &Timer) {
        lock(&self.armed).remove(timer);
    }

    fn cancel_all(&self) {
        lock(&self.armed).clear();
    }
}
