use tracing::{debug, info, instrument};

use crate::backend::{SandboxBackend, SandboxImage};
use crate::error::RunnerError;

pub const DEFAULT_PYTHON_VERSION: &str = "3.11";
pub const DEFAULT_IMAGE_TAG: &str = "crew-python-runner";

const DOCKERFILE_TEMPLATE: &str = r#"
FROM python:{version}

WORKDIR {workdir}
COPY . {workdir}
CMD ["tail", "-f", "/dev/null"]
"#;

/// Renders the build description for the given Python version and working
/// directory.
pub fn render_dockerfile(version: &str, workdir: &str) -> String {
    DOCKERFILE_TEMPLATE
        .replace("{version}", version)
        .replace("{workdir}", workdir)
}

/// Returns the image tagged `tag`, building it first when the store does not
/// have it. Only an explicit not-found answer triggers a build.
#[instrument(skip(backend))]
pub fn resolve<B: SandboxBackend + ?Sized>(
    backend: &B,
    tag: &str,
    version: &str,
    workdir: &str,
) -> Result<SandboxImage, RunnerError> {
    let provisioning = |source| RunnerError::Provisioning {
        target: format!("image {}", tag),
        source,
    };

    match backend.find_image(tag) {
        Ok(image) => {
            debug!(image = %image.id, "sandbox image found in store");
            Ok(image)
        }
        Err(err) if err.is_not_found() => {
            info!("Creating sandbox image {} from python:{}; this may be slow", tag, version);
            let image = backend
                .build_image(render_dockerfile(version, workdir).as_bytes(), tag)
                .map_err(provisioning)?;
            info!(image = %image.id, "sandbox image built");
            Ok(image)
        }
        Err(err) => Err(provisioning(err)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::MemoryBackend;
    use crate::config::DEFAULT_WORKDIR;
    use crate::error::BackendError;

    #[test]
    fn dockerfile_embeds_version() {
        let rendered = render_dockerfile("3.12", DEFAULT_WORKDIR);
        assert!(rendered.contains("FROM python:3.12\n"));
        assert!(rendered.contains("WORKDIR /app\n"));
        assert!(rendered.contains("COPY . /app\n"));
        assert!(rendered.contains(r#"CMD ["tail", "-f", "/dev/null"]"#));
        assert!(!rendered.contains("{version}"));
    }

    #[test]
    fn custom_workdir_reaches_build_description() {
        let backend = MemoryBackend::new();

        resolve(&backend, DEFAULT_IMAGE_TAG, "3.12", "/sandbox").unwrap();

        let built = &backend.build_descriptions()[0];
        assert!(built.contains("WORKDIR /sandbox\n"));
        assert!(built.contains("COPY . /sandbox\n"));
        assert!(!built.contains("/app"));
        assert!(!built.contains("{workdir}"));
    }

    #[test]
    fn cached_image_is_not_rebuilt() {
        let backend = MemoryBackend::new();
        let seeded = backend.insert_image(DEFAULT_IMAGE_TAG);

        let image = resolve(
            &backend,
            DEFAULT_IMAGE_TAG,
            DEFAULT_PYTHON_VERSION,
            DEFAULT_WORKDIR,
        )
        .unwrap();
        assert_eq!(image, seeded);
        assert_eq!(backend.build_count(), 0);
    }

    #[test]
    fn missing_image_is_built_once() {
        let backend = MemoryBackend::new();

        let first = resolve(&backend, DEFAULT_IMAGE_TAG, "3.10", DEFAULT_WORKDIR).unwrap();
        let second = resolve(&backend, DEFAULT_IMAGE_TAG, "3.10", DEFAULT_WORKDIR).unwrap();

        assert_eq!(first, second);
        assert_eq!(backend.build_count(), 1);
        assert_eq!(
            backend.build_descriptions()[0],
            render_dockerfile("3.10", DEFAULT_WORKDIR)
        );
    }

    #[test]
    fn build_failure_is_provisioning_error() {
        let backend = MemoryBackend::new();
        backend.fail_builds("pull access denied for python");

        let err = resolve(&backend, DEFAULT_IMAGE_TAG, "0.0", DEFAULT_WORKDIR).unwrap_err();
        assert_eq!(err.code(), "PYRUNNER_PROVISIONING_ERROR");
        assert!(matches!(
            err.backend_error(),
            Some(BackendError::Build { message, .. }) if message.contains("pull access denied")
        ));
    }

    #[test]
    fn lookup_failure_other_than_not_found_does_not_build() {
        struct DaemonDown;

        impl SandboxBackend for DaemonDown {
            fn find_image(&self, _tag: &str) -> Result<SandboxImage, BackendError> {
                Err(BackendError::api("Cannot connect to the Docker daemon"))
            }

            fn build_image(&self, _: &[u8], _: &str) -> Result<SandboxImage, BackendError> {
                panic!("build must not be attempted");
            }

            fn start_instance(
                &self,
                _: &SandboxImage,
                _: crate::backend::StartOptions,
            ) -> Result<crate::backend::SandboxInstance, BackendError> {
                unreachable!()
            }

            fn put_archive(
                &self,
                _: &crate::backend::SandboxInstance,
                _: &str,
                _: &[u8],
            ) -> Result<(), BackendError> {
                unreachable!()
            }

            fn exec(
                &self,
                _: &crate::backend::SandboxInstance,
                _: &[String],
                _: Option<std::time::Duration>,
            ) -> Result<crate::backend::ExecOutput, BackendError> {
                unreachable!()
            }
        }

        let err = resolve(
            &DaemonDown,
            DEFAULT_IMAGE_TAG,
            DEFAULT_PYTHON_VERSION,
            DEFAULT_WORKDIR,
        )
        .unwrap_err();
        assert!(matches!(err, RunnerError::Provisioning { .. }));
    }
}
