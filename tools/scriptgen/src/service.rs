use crate::config::{launch_request, AppConfig, RuntimeScope};
use crate::errors::ProxyError;
use crate::gateway::Gateway;
use crate::logging::append_run_log;
use crate::replay::emitter::NodeScriptEmitter;
use crate::replay::log::ActionLog;
use crate::runtime::child::next_lossy_line;
use crate::runtime::{
    ClientSink, FileSystem, ProductionClock, ProductionFileSystem, ProxyEvent, ProxyRuntime,
    Timer, TimerSchedule, TokioChildLauncher, TokioScheduler,
};
use serde_json::json;
use std::sync::Arc;
use tokio::io::{AsyncRead, BufReader};
use tokio::sync::mpsc;

/// Runs the proxy until the client closes its input (and outstanding calls
/// are answered or the grace period ends) or an interrupt arrives.
pub async fn serve<R>(
    config: AppConfig,
    scope: RuntimeScope,
    input: R,
    sink: Arc<dyn ClientSink>,
) -> Result<(), ProxyError>
where
    R: AsyncRead + Unpin + Send + 'static,
{
    let config = config.resolve_paths(&scope);
    let (events, mut inbox) = mpsc::unbounded_channel::<ProxyEvent>();
    let file_system: Arc<dyn FileSystem> = Arc::new(ProductionFileSystem);
    let launch = launch_request(&config, &scope);
    let runtime = ProxyRuntime {
        clock: Arc::new(ProductionClock),
        file_system: file_system.clone(),
        launcher: Arc::new(TokioChildLauncher::new(events.clone())),
        scheduler: Arc::new(TokioScheduler::new(events.clone())),
        sink,
    };
    let recorder = ActionLog::load(&config.recording.action_log_path, file_system.clone());
    let emitter = NodeScriptEmitter::new(file_system, launch.clone());
    let shutdown_grace = config.service.shutdown_grace();
    let eager_start = config.service.eager_start;
    let mut gateway = Gateway::new(
        config,
        launch,
        runtime.clone(),
        Box::new(recorder),
        Box::new(emitter),
    );

    spawn_client_reader(input, events.clone());
    spawn_interrupt_listener(events);

    if eager_start {
        if let Err(err) = gateway.start_service() {
            append_run_log(
                "error",
                "service.eager_start_failed",
                json!({"error": err.to_string()}),
            );
        }
    }

    let mut closing = false;
    while let Some(event) = inbox.recv().await {
        match event {
            ProxyEvent::ClientClosed => {
                append_run_log(
                    "info",
                    "client.closed",
                    json!({"pending": gateway.pending_count(), "queued": gateway.queued_count()}),
                );
                if gateway.is_idle() {
                    break;
                }
                closing = true;
                runtime
                    .scheduler
                    .schedule(Timer::ShutdownGrace, TimerSchedule::Once(shutdown_grace));
            }
            ProxyEvent::Shutdown | ProxyEvent::Timer(Timer::ShutdownGrace) => break,
            other => {
                gateway.handle_event(other);
                if closing && gateway.is_idle() {
                    break;
                }
            }
        }
    }

    gateway.terminate();
    Ok(())
}

fn spawn_client_reader<R>(input: R, events: mpsc::UnboundedSender<ProxyEvent>)
where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut reader = BufReader::new(input);
        let mut buf = Vec::new();
        loop {
            match next_lossy_line(&mut reader, &mut buf).await {
                Ok(Some(line)) => {
                    if events.send(ProxyEvent::ClientLine(line)).is_err() {
                        return;
                    }
                }
                Ok(None) => break,
                Err(err) => {
                    append_run_log(
                        "error",
                        "client.read_failed",
                        json!({"error": err.to_string()}),
                    );
                    break;
                }
            }
        }
        let _ = events.send(ProxyEvent::ClientClosed);
    });
}

fn spawn_interrupt_listener(events: mpsc::UnboundedSender<ProxyEvent>) {
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            append_run_log("info", "process.interrupted", json!({}));
            let _ = events.send(ProxyEvent::Shutdown);
        }
    });
}
