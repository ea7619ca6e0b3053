use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ProxyError {
    #[error("io error: {0}")]
    Io(String),
    #[error("config parse error: {0}")]
    ConfigParse(String),
    #[error("invalid config: {0}")]
    InvalidConfig(String),
    #[error("cli error: {0}")]
    Cli(String),
    #[error("process error: {0}")]
    Process(String),
    #[error("parse error: {0}")]
    Parse(String),
    #[error("invalid request: {0}")]
    InvalidRequest(String),
    #[error("browser service did not become ready within {0} ms")]
    StartupTimeout(u64),
    #[error("failed to write to browser service: {0}")]
    ChildWrite(String),
    #[error("browser service exited with {0}")]
    ChildExit(String),
    #[error("request timed out after {0} ms")]
    Timeout(u64),
    #[error("unsupported action: {0}")]
    UnsupportedAction(String),
}
