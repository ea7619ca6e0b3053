use crate::errors::ProxyError;
use crate::logging::append_run_log;
use crate::replay::action::RecordedAction;
use crate::runtime::FileSystem;
use serde_json::json;
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// Sink for actions derived from forwarded requests.
pub trait RequestRecorder: Send {
    fn record(&mut self, action: RecordedAction) -> Result<(), ProxyError>;
    fn actions(&self) -> &[RecordedAction];
    fn clear(&mut self) -> Result<(), ProxyError>;
}

/// Action log persisted as a JSON array and rewritten after every change.
pub struct ActionLog {
    path: PathBuf,
    fs: Arc<dyn FileSystem>,
    actions: Vec<RecordedAction>,
}

impl ActionLog {
    /// Loads what an earlier run recorded. A missing file is an empty log; an
    /// unreadable one is logged and also starts empty.
    pub fn load(path: impl AsRef<Path>, fs: Arc<dyn FileSystem>) -> Self {
        let path = path.as_ref().to_path_buf();
        let actions = if fs.exists(&path) {
            match fs
                .read_to_string(&path)
                .and_then(|text| {
                    serde_json::from_str::<Vec<RecordedAction>>(&text)
                        .map_err(|e| ProxyError::Parse(e.to_string()))
                }) {
                Ok(actions) => actions,
                Err(err) => {
                    append_run_log(
                        "warn",
                        "recording.load_failed",
                        json!({"path": path.display().to_string(), "error": err.to_string()}),
                    );
                    Vec::new()
                }
            }
        } else {
            Vec::new()
        };
        Self { path, fs, actions }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn persist(&self) -> Result<(), ProxyError> {
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                self.fs.create_dir_all(parent)?;
            }
        }
        let text = serde_json::to_string_pretty(&self.actions)
            .map_err(|e| ProxyError::Io(e.to_string()))?;
        self.fs.write_string(&self.path, &text)
    }
}

impl RequestRecorder for ActionLog {
    fn record(&mut self, action: RecordedAction) -> Result<(), ProxyError> {
        self.actions.push(action);
        self.persist()
    }

    fn actions(&self) -> &[RecordedAction] {
        &self.actions
    }

    fn clear(&mut self) -> Result<(), ProxyError> {
        self.actions.clear();
        self.persist()
    }
}
