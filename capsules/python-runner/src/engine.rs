use std::sync::{Mutex, PoisonError};
use std::time::Duration;
use tracing::{debug, instrument};

use crate::artifact::CodeArtifact;
use crate::backend::{DockerCli, SandboxBackend, SandboxInstance};
use crate::config::RunnerConfig;
use crate::error::RunnerError;
use crate::result::PythonResult;
use crate::{image, sandbox};

/// Extra time the host waits past the in-sandbox deadline before giving up on
/// the runtime client.
const HOST_GRACE: Duration = Duration::from_secs(5);
const CLEANUP_TIMEOUT: Duration = Duration::from_secs(30);

/// Owns one provisioned sandbox instance and runs snippets in it.
///
/// Construction resolves (or builds) the image and starts the instance; a
/// failure there is fatal and leaves no runner behind. Executions are
/// serialized by an internal lock because they share the instance and its
/// working directory.
pub struct PythonRunner<B: SandboxBackend = DockerCli> {
    backend: B,
    config: RunnerConfig,
    instance: SandboxInstance,
    flight: Mutex<()>,
}

impl PythonRunner<DockerCli> {
    /// Provisions through the container CLI named in `config.runtime`.
    pub fn from_config(config: RunnerConfig) -> Result<Self, RunnerError> {
        let backend = config.docker_backend();
        Self::start(backend, config)
    }
}

impl<B: SandboxBackend> PythonRunner<B> {
    #[instrument(skip(backend, config), fields(tag = %config.image_tag, version = %config.python_version))]
    pub fn start(backend: B, config: RunnerConfig) -> Result<Self, RunnerError> {
        config.validate()?;
        let image = image::resolve(
            &backend,
            &config.image_tag,
            &config.python_version,
            &config.workdir,
        )?;
        let instance = sandbox::start(&backend, &image, &config.workdir)?;

        Ok(Self {
            backend,
            config,
            instance,
            flight: Mutex::new(()),
        })
    }

    pub fn config(&self) -> &RunnerConfig {
        &self.config
    }

    pub fn instance(&self) -> &SandboxInstance {
        &self.instance
    }

    pub fn backend(&self) -> &B {
        &self.backend
    }

    /// Runs `code` as a script file inside the sandbox and returns its exit
    /// status and combined output. A failing script is a normal result; only
    /// local I/O and backend failures are errors.
    #[instrument(skip(self, code), fields(instance = %self.instance.id, bytes = code.len()))]
    pub fn run_python(&self, code: &str) -> Result<PythonResult, RunnerError> {
        let _flight = self.flight.lock().unwrap_or_else(PoisonError::into_inner);

        let artifact = CodeArtifact::materialize(
            code,
            &self.config.workdir,
            self.config.temp_dir.as_deref(),
        )?;
        let remote_path = artifact.remote_path().to_string();

        let delivered = DeliveredArtifact {
            backend: &self.backend,
            instance: &self.instance,
            path: &remote_path,
        };

        self.backend
            .put_archive(&self.instance, &self.config.workdir, artifact.archive())
            .map_err(|source| RunnerError::Delivery {
                path: remote_path.clone(),
                source,
            })?;
        debug!(path = %remote_path, "artifact delivered");

        let output = self
            .backend
            .exec(&self.instance, &self.command(&remote_path), self.host_timeout())
            .map_err(|source| RunnerError::Exec {
                path: remote_path.clone(),
                source,
            })?;

        drop(delivered);
        artifact.remove()?;

        let result = PythonResult::new(output.exit_code, output.output);
        debug!(status = result.error_code, "execution finished");
        Ok(result)
    }

    fn command(&self, path: &str) -> Vec<String> {
        let mut argv = Vec::with_capacity(5);
        if let Some(limit) = self.config.exec_timeout {
            argv.push("timeout".to_string());
            argv.push("--signal=KILL".to_string());
            argv.push(limit.as_secs_f64().to_string());
        }
        argv.push(self.config.interpreter.clone());
        argv.push(path.to_string());
        argv
    }

    /// The in-sandbox limit plus [`HOST_GRACE`]. A limit too large to extend
    /// leaves the host wait unbounded.
    fn host_timeout(&self) -> Option<Duration> {
        self.config
            .exec_timeout
            .and_then(|limit| limit.checked_add(HOST_GRACE))
    }
}

/// Removes the delivered file from the instance when dropped. Failures are
/// logged and otherwise ignored.
struct DeliveredArtifact<'a, B: SandboxBackend> {
    backend: &'a B,
    instance: &'a SandboxInstance,
    path: &'a str,
}

impl<B: SandboxBackend> Drop for DeliveredArtifact<'_, B> {
    fn drop(&mut self) {
        let argv = vec!["rm".to_string(), "-f".to_string(), self.path.to_string()];
        match self.backend.exec(self.instance, &argv, Some(CLEANUP_TIMEOUT)) {
            Ok(output) if output.exit_code == 0 => {
                debug!(path = %self.path, "removed artifact from sandbox");
            }
            Ok(output) => {
                debug!(path = %self.path, status = output.exit_code, "sandbox cleanup failed");
            }
            Err(err) => {
                debug!(path = %self.path, error = %err, "sandbox cleanup failed");
            }
        }
    }
}
