use chrono::Utc;
use std::io::{ErrorKind, Read, Write};
use std::process::{Child, Command, ExitStatus, Stdio};
use std::thread::{self, JoinHandle};
use std::time::Duration;
use tracing::{debug, instrument};
use wait_timeout::ChildExt;

use super::{ExecOutput, SandboxBackend, SandboxImage, SandboxInstance, StartOptions};
use crate::artifact::pack_single_file;
use crate::error::BackendError;

pub const DEFAULT_RUNTIME: &str = "docker";

/// Runs the argv with stderr folded into stdout so the caller sees one stream
/// in the order the process wrote it.
const MERGE_STREAMS: &str = "exec \"$@\" 2>&1";
const STOP_TIMEOUT: Duration = Duration::from_secs(30);

/// [`SandboxBackend`] backed by a Docker-compatible command line client
/// (`docker`, `podman`, ...).
#[derive(Debug, Clone)]
pub struct DockerCli {
    runtime: String,
}

impl Default for DockerCli {
    fn default() -> Self {
        Self::new(DEFAULT_RUNTIME)
    }
}

impl DockerCli {
    pub fn new(runtime: impl Into<String>) -> Self {
        Self {
            runtime: runtime.into(),
        }
    }

    pub fn runtime(&self) -> &str {
        &self.runtime
    }

    /// Stops `instance` without a grace period; with auto-remove set the
    /// runtime then deletes it. The runner itself never stops its instance,
    /// so one-shot callers use this when they are done.
    #[instrument(skip(self, instance), fields(runtime = %self.runtime, instance = %instance.id))]
    pub fn stop_instance(&self, instance: &SandboxInstance) -> Result<(), BackendError> {
        let logs = self.run(
            self.command(stop_args(&instance.id)),
            None,
            Some(STOP_TIMEOUT),
        )?;

        if logs.success() {
            Ok(())
        } else {
            Err(BackendError::api(logs.failure_message()))
        }
    }

    fn command<I, S>(&self, args: I) -> Command
    where
        I: IntoIterator<Item = S>,
        S: AsRef<std::ffi::OsStr>,
    {
        let mut command = Command::new(&self.runtime);
        command.args(args);
        command
    }

    fn run(
        &self,
        mut command: Command,
        stdin: Option<&[u8]>,
        timeout: Option<Duration>,
    ) -> Result<CommandLogs, BackendError> {
        debug!(cmdline = %command_line_string(&command), "invoking container runtime");

        command.stdin(if stdin.is_some() {
            Stdio::piped()
        } else {
            Stdio::null()
        });
        command.stdout(Stdio::piped());
        command.stderr(Stdio::piped());

        let mut child = command.spawn().map_err(|source| BackendError::RuntimeSpawn {
            runtime: self.runtime.clone(),
            source,
        })?;

        let stdout = child.stdout.take().map(spawn_reader);
        let stderr = child.stderr.take().map(spawn_reader);

        if let (Some(data), Some(mut pipe)) = (stdin, child.stdin.take()) {
            // The runtime may exit early and close its end; its exit status
            // and stderr explain why, so a broken pipe is not reported here.
            if let Err(err) = pipe.write_all(data) {
                if err.kind() != ErrorKind::BrokenPipe {
                    abandon(&mut child);
                    return Err(BackendError::api(format!(
                        "failed to stream input to {}: {}",
                        self.runtime, err
                    )));
                }
            }
        }

        let status = match wait(&mut child, timeout) {
            Ok(Some(status)) => status,
            Ok(None) => {
                abandon(&mut child);
                join_reader(stdout);
                join_reader(stderr);
                return Err(BackendError::Timeout {
                    timeout: timeout.unwrap_or_default(),
                });
            }
            Err(err) => {
                abandon(&mut child);
                return Err(BackendError::api(format!(
                    "failed to wait for {}: {}",
                    self.runtime, err
                )));
            }
        };

        Ok(CommandLogs {
            stdout: join_reader(stdout),
            stderr: join_reader(stderr),
            exit_status: status.code(),
        })
    }
}

impl SandboxBackend for DockerCli {
    #[instrument(skip(self), fields(runtime = %self.runtime))]
    fn find_image(&self, tag: &str) -> Result<SandboxImage, BackendError> {
        let logs = self.run(
            self.command(["image", "inspect", "--format", "{{.Id}}", tag]),
            None,
            None,
        )?;

        if logs.success() {
            return Ok(SandboxImage {
                id: logs.stdout_text().trim().to_string(),
                tag: tag.to_string(),
            });
        }

        if is_missing_image(&logs.stderr_text()) {
            Err(BackendError::ImageNotFound {
                tag: tag.to_string(),
            })
        } else {
            Err(BackendError::api(logs.failure_message()))
        }
    }

    #[instrument(skip(self, build_description), fields(runtime = %self.runtime))]
    fn build_image(
        &self,
        build_description: &[u8],
        tag: &str,
    ) -> Result<SandboxImage, BackendError> {
        // The description travels as a one-file build context on stdin.
        let context = pack_single_file("Dockerfile", build_description, Utc::now())
            .map_err(|err| BackendError::Build {
                tag: tag.to_string(),
                message: format!("failed to pack build context: {}", err),
            })?;

        let logs = self.run(
            self.command(["build", "--tag", tag, "-"]),
            Some(context.as_slice()),
            None,
        )?;

        if !logs.success() {
            return Err(BackendError::Build {
                tag: tag.to_string(),
                message: logs.failure_message(),
            });
        }

        self.find_image(tag).map_err(|err| match err {
            BackendError::ImageNotFound { tag } => BackendError::Build {
                message: format!("build finished but image '{}' is not in the store", tag),
                tag,
            },
            other => other,
        })
    }

    #[instrument(skip(self), fields(runtime = %self.runtime, image = %image.id))]
    fn start_instance(
        &self,
        image: &SandboxImage,
        options: StartOptions,
    ) -> Result<SandboxInstance, BackendError> {
        let logs = self.run(self.command(run_args(image, &options)), None, None)?;

        if !logs.success() {
            return Err(BackendError::api(logs.failure_message()));
        }

        let id = logs.stdout_text().trim().to_string();
        if id.is_empty() {
            return Err(BackendError::api(format!(
                "{} run did not report a container id",
                self.runtime
            )));
        }

        Ok(SandboxInstance {
            id,
            image: image.clone(),
        })
    }

    #[instrument(skip(self, instance, archive), fields(runtime = %self.runtime, instance = %instance.id, bytes = archive.len()))]
    fn put_archive(
        &self,
        instance: &SandboxInstance,
        path: &str,
        archive: &[u8],
    ) -> Result<(), BackendError> {
        let target = format!("{}:{}", instance.id, path);
        let logs = self.run(self.command(["cp", "-", target.as_str()]), Some(archive), None)?;

        if logs.success() {
            Ok(())
        } else {
            Err(BackendError::api(logs.failure_message()))
        }
    }

    #[instrument(skip(self, instance), fields(runtime = %self.runtime, instance = %instance.id))]
    fn exec(
        &self,
        instance: &SandboxInstance,
        argv: &[String],
        timeout: Option<Duration>,
    ) -> Result<ExecOutput, BackendError> {
        let logs = self.run(self.command(exec_args(&instance.id, argv)), None, timeout)?;

        // The target's own stderr is merged into stdout, so anything left on
        // stderr came from the client or the daemon.
        if !logs.success() && !logs.stderr_text().trim().is_empty() {
            return Err(BackendError::api(logs.failure_message()));
        }

        Ok(ExecOutput {
            exit_code: logs.exit_status.map(i64::from).unwrap_or(-1),
            output: logs.stdout,
        })
    }
}

fn run_args(image: &SandboxImage, options: &StartOptions) -> Vec<String> {
    let mut args = vec!["run".to_string()];
    if options.detach {
        args.push("--detach".to_string());
    }
    if options.auto_remove {
        args.push("--rm".to_string());
    }
    if let Some(workdir) = &options.workdir {
        args.push("--workdir".to_string());
        args.push(workdir.clone());
    }
    args.push(image.id.clone());
    args
}

fn exec_args(instance_id: &str, argv: &[String]) -> Vec<String> {
    let mut args = vec![
        "exec".to_string(),
        instance_id.to_string(),
        "sh".to_string(),
        "-c".to_string(),
        MERGE_STREAMS.to_string(),
        "sh".to_string(),
    ];
    args.extend(argv.iter().cloned());
    args
}

fn stop_args(instance_id: &str) -> [&str; 4] {
    ["stop", "--time", "0", instance_id]
}

fn is_missing_image(stderr: &str) -> bool {
    let stderr = stderr.to_ascii_lowercase();
    stderr.contains("no such image") || stderr.contains("image not known")
}

fn wait(child: &mut Child, timeout: Option<Duration>) -> std::io::Result<Option<ExitStatus>> {
    match timeout {
        Some(limit) => child.wait_timeout(limit),
        None => child.wait().map(Some),
    }
}

fn abandon(child: &mut Child) {
    let _ = child.kill();
    let _ = child.wait();
}

fn spawn_reader<R: Read + Send + 'static>(mut pipe: R) -> JoinHandle<Vec<u8>> {
    thread::spawn(move || {
        let mut buf = Vec::new();
        let _ = pipe.read_to_end(&mut buf);
        buf
    })
}

fn join_reader(handle: Option<JoinHandle<Vec<u8>>>) -> Vec<u8> {
    handle
        .map(|handle| handle.join().unwrap_or_default())
        .unwrap_or_default()
}

#[derive(Debug, Clone)]
struct CommandLogs {
    stdout: Vec<u8>,
    stderr: Vec<u8>,
    exit_status: Option<i32>,
}

impl CommandLogs {
    fn success(&self) -> bool {
        self.exit_status == Some(0)
    }

    fn stdout_text(&self) -> String {
        String::from_utf8_lossy(&self.stdout).into_owned()
    }

    fn stderr_text(&self) -> String {
        String::from_utf8_lossy(&self.stderr).into_owned()
    }

    fn failure_message(&self) -> String {
        let stderr = self.stderr_text();
        let stderr = stderr.trim();
        let code = self
            .exit_status
            .map(|code| code.to_string())
            .unwrap_or_else(|| "signal".to_string());
        if stderr.is_empty() {
            format!("exited with {}", code)
        } else {
            format!("exited with {}: {}", code, truncate(stderr, 2048))
        }
    }
}

fn truncate(text: &str, limit: usize) -> String {
    if text.len() <= limit {
        return text.to_string();
    }
    let mut end = limit;
    while !text.is_char_boundary(end) {
        end -= 1;
    }
    format!("{}… (truncated)", &text[..end])
}

fn command_line_string(cmd: &Command) -> String {
    let mut s = cmd.get_program().to_string_lossy().into_owned();
    for arg in cmd.get_args() {
        s.push(' ');
        let arg = arg.to_string_lossy();
        if arg.is_empty() || arg.contains([' ', '"', '\'']) {
            s.push('\'');
            s.push_str(&arg.replace('\'', "'\\''"));
            s.push('\'');
        } else {
            s.push_str(&arg);
        }
    }
    s
}
