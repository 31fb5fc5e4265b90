//! Python runner capsule: executes untrusted Python snippets inside a
//! long-lived container sandbox.
//!
//! [`PythonRunner::start`] resolves (building on first use) the sandbox image
//! and starts one detached, auto-removed instance. Each
//! [`PythonRunner::run_python`] call packages the source into a single-file
//! tar archive, delivers it into the instance, runs it with the interpreter,
//! removes the delivered and local copies, and returns a [`PythonResult`].
//!
//! ```no_run
//! use capsules_python_runner::{PythonRunner, RunnerConfig};
//!
//! let runner = PythonRunner::from_config(RunnerConfig::from_env()?)?;
//! let result = runner.run_python("print(\"Running!\")")?;
//! assert_eq!(result.to_string(), "0: Running!");
//! # Ok::<(), capsules_python_runner::RunnerError>(())
//! ```

pub mod artifact;
pub mod backend;
pub mod config;
pub mod engine;
pub mod error;
pub mod image;
pub mod result;
pub mod sandbox;
pub mod tool;

pub use artifact::CodeArtifact;
pub use backend::{
    DockerCli, ExecOutput, MemoryBackend, SandboxBackend, SandboxImage, SandboxInstance,
    StartOptions,
};
pub use config::RunnerConfig;
pub use engine::PythonRunner;
pub use error::{BackendError, RunnerError};
pub use result::{Output, PythonResult};
pub use tool::{descriptor, PythonRunnerTool, ToolDescriptor, TOOL_NAME};
