use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

/// Failures reported by a [`SandboxBackend`](crate::backend::SandboxBackend).
#[derive(Debug, Error)]
pub enum BackendError {
    /// The image store has no image under the requested tag. This is the only
    /// backend condition that makes the image provider build instead of fail.
    #[error("No such image: {tag}")]
    ImageNotFound { tag: String },

    #[error("Image build for '{tag}' failed: {message}")]
    Build { tag: String, message: String },

    #[error("Container runtime API error: {message}")]
    Api { message: String },

    #[error("Failed to spawn container runtime {runtime}: {source}")]
    RuntimeSpawn {
        runtime: String,
        source: std::io::Error,
    },

    #[error("Container runtime did not answer within {}", humantime::format_duration(*.timeout))]
    Timeout { timeout: Duration },
}

impl BackendError {
    pub fn api(message: impl Into<String>) -> Self {
        BackendError::Api {
            message: message.into(),
        }
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, BackendError::ImageNotFound { .. })
    }
}

#[derive(Debug, Error)]
pub enum RunnerError {
    #[error("Invalid python runner config: {message}")]
    InvalidConfig { message: String },

    /// Image resolution or instance start failed. Fatal for the runner.
    #[error("Failed to provision sandbox ({target}): {source}")]
    Provisioning {
        target: String,
        #[source]
        source: BackendError,
    },

    #[error("Local artifact I/O failed for {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to deliver artifact to {path}: {source}")]
    Delivery {
        path: String,
        #[source]
        source: BackendError,
    },

    #[error("Failed to execute {path} in sandbox: {source}")]
    Exec {
        path: String,
        #[source]
        source: BackendError,
    },
}

impl RunnerError {
    pub(crate) fn invalid_config(message: impl Into<String>) -> Self {
        RunnerError::InvalidConfig {
            message: message.into(),
        }
    }

    pub(crate) fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        RunnerError::Io {
            path: path.into(),
            source,
        }
    }

    pub fn code(&self) -> &'static str {
        match self {
            RunnerError::InvalidConfig { .. } => "PYRUNNER_INVALID_CONFIG",
            RunnerError::Provisioning { .. } => "PYRUNNER_PROVISIONING_ERROR",
            RunnerError::Io { .. } => "PYRUNNER_IO_ERROR",
            RunnerError::Delivery { .. } => "PYRUNNER_DELIVERY_ERROR",
            RunnerError::Exec { .. } => "PYRUNNER_EXEC_ERROR",
        }
    }

    pub fn backend_error(&self) -> Option<&BackendError> {
        match self {
            RunnerError::Provisioning { source, .. }
            | RunnerError::Delivery { source, .. }
            | RunnerError::Exec { source, .. } => Some(source),
            RunnerError::InvalidConfig { .. } | RunnerError::Io { .. } => None,
        }
    }
}
