//! Narrow capability interface over the container backend.
//!
//! The runner never talks to a container engine directly; everything it needs
//! is expressed by [`SandboxBackend`]. [`DockerCli`] drives a Docker-compatible
//! CLI, [`MemoryBackend`] keeps all state in process.

mod docker;
mod memory;

pub use docker::{DockerCli, DEFAULT_RUNTIME};
pub use memory::{ExecHandler, MemoryBackend};

use serde::Serialize;
use std::time::Duration;

use crate::error::BackendError;

/// A built image as known to the backend image store.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SandboxImage {
    pub id: String,
    pub tag: String,
}

/// A running container started from a [`SandboxImage`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SandboxInstance {
    pub id: String,
    pub image: SandboxImage,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StartOptions {
    pub detach: bool,
    /// Let the backend delete the instance once it stops.
    pub auto_remove: bool,
    /// Working directory of the instance; created when the image lacks it.
    pub workdir: Option<String>,
}

impl Default for StartOptions {
    fn default() -> Self {
        Self {
            detach: true,
            auto_remove: true,
            workdir: None,
        }
    }
}

/// Exit code and combined stdout/stderr of a command run inside an instance.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecOutput {
    pub exit_code: i64,
    pub output: Vec<u8>,
}

pub trait SandboxBackend {
    /// Looks `tag` up in the image store. A missing image must be reported as
    /// [`BackendError::ImageNotFound`].
    fn find_image(&self, tag: &str) -> Result<SandboxImage, BackendError>;

    /// Builds `build_description` (a Dockerfile) and tags the result. Blocks
    /// until the build has finished.
    fn build_image(&self, build_description: &[u8], tag: &str)
        -> Result<SandboxImage, BackendError>;

    fn start_instance(
        &self,
        image: &SandboxImage,
        options: StartOptions,
    ) -> Result<SandboxInstance, BackendError>;

    /// Unpacks a tar stream into `path` inside the instance, overwriting
    /// existing entries.
    fn put_archive(
        &self,
        instance: &SandboxInstance,
        path: &str,
        archive: &[u8],
    ) -> Result<(), BackendError>;

    /// Runs `argv` inside the instance and waits for it. `timeout` bounds the
    /// wait when set.
    fn exec(
        &self,
        instance: &SandboxInstance,
        argv: &[String],
        timeout: Option<Duration>,
    ) -> Result<ExecOutput, BackendError>;
}

impl<B: SandboxBackend + ?Sized> SandboxBackend for &B {
    fn find_image(&self, tag: &str) -> Result<SandboxImage, BackendError> {
        (**self).find_image(tag)
    }

    fn build_image(
        &self,
        build_description: &[u8],
        tag: &str,
    ) -> Result<SandboxImage, BackendError> {
        (**self).build_image(build_description, tag)
    }

    fn start_instance(
        &self,
        image: &SandboxImage,
        options: StartOptions,
    ) -> Result<SandboxInstance, BackendError> {
        (**self).start_instance(image, options)
    }

    fn put_archive(
        &self,
        instance: &SandboxInstance,
        path: &str,
        archive: &[u8],
    ) -> Result<(), BackendError> {
        (**self).put_archive(instance, path, archive)
    }

    fn exec(
        &self,
        instance: &SandboxInstance,
        argv: &[String],
        timeout: Option<Duration>,
    ) -> Result<ExecOutput, BackendError> {
        (**self).exec(instance, argv, timeout)
    }
}
