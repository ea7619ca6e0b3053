use crate::errors::ProxyError;
use crate::logging::append_run_log;
use crate::runtime::{ChildLauncher, ChildLink, LaunchRequest, ProxyEvent};
use serde_json::json;
use std::process::Stdio;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::Command;
use tokio::sync::{mpsc, oneshot};

/// Spawns the browser service with piped stdio. Each stream gets its own task
/// that turns lines into `ProxyEvent`s; a waiter task reports the exit.
pub struct TokioChildLauncher {
    events: mpsc::UnboundedSender<ProxyEvent>,
}

impl TokioChildLauncher {
    pub fn new(events: mpsc::UnboundedSender<ProxyEvent>) -> Self {
        Self { events }
    }
}

impl ChildLauncher for TokioChildLauncher {
    fn launch(
        &self,
        request: &LaunchRequest,
        generation: u64,
    ) -> Result<Box<dyn ChildLink>, ProxyError> {
        let mut cmd = Command::new(&request.program);
        cmd.args(&request.args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(cwd) = &request.cwd {
            cmd.current_dir(cwd);
        }

        let mut child = cmd
            .spawn()
            .map_err(|e| ProxyError::Process(format!("failed to spawn {}: {e}", request.program)))?;
        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| ProxyError::Process("child stdin was not piped".to_string()))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| ProxyError::Process("child stdout was not piped".to_string()))?;
        let stderr = child
            .stderr
            .take()
            .ok_or_else(|| ProxyError::Process("child stderr was not piped".to_string()))?;

        let events = self.events.clone();
        tokio::spawn(async move {
            let mut reader = BufReader::new(stdout);
            let mut buf = Vec::new();
            loop {
                match next_lossy_line(&mut reader, &mut buf).await {
                    Ok(Some(line)) => {
                        if events.send(ProxyEvent::ChildStdout { generation, line }).is_err() {
                            return;
                        }
                    }
                    Ok(None) => return,
                    Err(err) => {
                        append_run_log(
                            "warn",
                            "child.stdout.read_failed",
                            json!({"generation": generation, "error": err.to_string()}),
                        );
                        return;
                    }
                }
            }
        });

        let events = self.events.clone();
        tokio::spawn(async move {
            let mut reader = BufReader::new(stderr);
            let mut buf = Vec::new();
            while let Ok(Some(line)) = next_lossy_line(&mut reader, &mut buf).await {
                if events.send(ProxyEvent::ChildStderr { generation, line }).is_err() {
                    return;
                }
            }
        });

        let (line_tx, mut line_rx) = mpsc::unbounded_channel::<String>();
        tokio::spawn(async move {
            let mut stdin = stdin;
            while let Some(line) = line_rx.recv().await {
                let written = async {
                    stdin.write_all(line.as_bytes()).await?;
                    stdin.write_all(b"\n").await?;
                    stdin.flush().await
                }
                .await;
                if let Err(err) = written {
                    append_run_log(
                        "warn",
                        "child.stdin.closed",
                        json!({"generation": generation, "error": err.to_string()}),
                    );
                    break;
                }
            }
        });

        let (kill_tx, kill_rx) = oneshot::channel::<()>();
        let events = self.events.clone();
        tokio::spawn(async move {
            let exited = tokio::select! {
                status = child.wait() => Some(status),
                _ = kill_rx => None,
            };
            let status = match exited {
                Some(status) => status,
                None => {
                    let _ = child.start_kill();
                    child.wait().await
                }
            };
            let event = match status {
                Ok(status) => ProxyEvent::ChildExited {
                    generation,
                    code: status.code(),
                },
                Err(err) => ProxyEvent::ChildFailed {
                    generation,
                    error: err.to_string(),
                },
            };
            let _ = events.send(event);
        });

        Ok(Box::new(TokioChildLink {
            lines: line_tx,
            kill: Some(kill_tx),
        }))
    }
}

/// Reads one newline-terminated line. Bytes that are not UTF-8 are replaced
/// rather than ending the stream; the trailing `\n` or `\r\n` is stripped.
pub(crate) async fn next_lossy_line<R>(
    reader: &mut R,
    buf: &mut Vec<u8>,
) -> std::io::Result<Option<String>>
where
    R: AsyncBufRead + Unpin,
{
    buf.clear();
    if reader.read_until(b'\n', buf).await? == 0 {
        return Ok(None);
    }
    if buf.last() == Some(&b'\n') {
        buf.pop();
        if buf.last() == Some(&b'\r') {
            buf.pop();
        }
    }
    Ok(Some(String::from_utf8_lossy(buf).into_owned()))
}

struct TokioChildLink {
    lines: mpsc::UnboundedSender<String>,
    kill: Option<oneshot::Sender<()>>,
}

impl ChildLink for TokioChildLink {
    fn write_line(&mut self, line: &str) -> Result<(), ProxyError> {
        self.lines
            .send(line.to_string())
            .map_err(|_| ProxyError::ChildWrite("child stdin is closed".to_string()))
    }

    fn kill(&mut self) -> Result<(), ProxyError> {
        if let Some(kill) = self.kill.take() {
            let _ = kill.send(());
        }
        Ok(())
    }
}
