use tracing::{info, instrument};

use crate::backend::{SandboxBackend, SandboxImage, SandboxInstance, StartOptions};
use crate::error::RunnerError;

/// Starts the long-lived instance that executions are delivered into, with
/// `workdir` as its working directory. It runs detached and is removed by the
/// backend once it stops; nothing here stops it.
#[instrument(skip(backend, image), fields(image = %image.id))]
pub fn start<B: SandboxBackend + ?Sized>(
    backend: &B,
    image: &SandboxImage,
    workdir: &str,
) -> Result<SandboxInstance, RunnerError> {
    let options = StartOptions {
        workdir: Some(workdir.to_string()),
        ..StartOptions::default()
    };
    let instance = backend
        .start_instance(image, options)
        .map_err(|source| RunnerError::Provisioning {
            target: format!("instance from {}", image.tag),
            source,
        })?;

    info!(instance = %instance.id, "sandbox instance started");
    Ok(instance)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::MemoryBackend;

    #[test]
    fn instance_is_detached_and_auto_removed() {
        let backend = MemoryBackend::new();
        let image = backend.insert_image("crew-python-runner");

        let instance = start(&backend, &image, "/sandbox").unwrap();
        assert_eq!(instance.image, image);
        assert_eq!(
            backend.start_options(&instance),
            Some(StartOptions {
                detach: true,
                auto_remove: true,
                workdir: Some("/sandbox".to_string()),
            })
        );
    }

    #[test]
    fn start_failure_is_provisioning_error() {
        let backend = MemoryBackend::new();
        let image = backend.insert_image("crew-python-runner");
        backend.fail_starts("port is already allocated");

        let err = start(&backend, &image, "/app").unwrap_err();
        assert_eq!(err.code(), "PYRUNNER_PROVISIONING_ERROR");
        assert!(err.to_string().contains("port is already allocated"));
    }
}
