use std::collections::{BTreeMap, HashMap};
use std::io::Read;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use super::{ExecOutput, SandboxBackend, SandboxImage, SandboxInstance, StartOptions};
use crate::error::BackendError;

/// Runs a non-`rm` command for [`MemoryBackend`]. Receives the argv and the
/// instance filesystem (absolute path to content).
pub type ExecHandler =
    Arc<dyn Fn(&[String], &BTreeMap<String, Vec<u8>>) -> ExecOutput + Send + Sync>;

/// In-process [`SandboxBackend`]: images, instances and instance filesystems
/// live in memory. Delivered archives are really unpacked so their contents
/// can be inspected, `rm` really removes, and every other command goes to the
/// configured [`ExecHandler`].
pub struct MemoryBackend {
    handler: ExecHandler,
    state: Mutex<MemoryState>,
}

#[derive(Default)]
struct MemoryState {
    images: HashMap<String, SandboxImage>,
    instances: HashMap<String, MemoryInstance>,
    build_descriptions: Vec<String>,
    exec_log: Vec<Vec<String>>,
    fail_build: Option<String>,
    fail_start: Option<String>,
    fail_put: Option<String>,
    fail_exec: Option<String>,
    fail_rm: bool,
    id_counter: u64,
}

struct MemoryInstance {
    options: StartOptions,
    files: BTreeMap<String, Vec<u8>>,
}

impl Default for MemoryBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryBackend {
    /// Backend whose commands succeed with empty output.
    pub fn new() -> Self {
        Self::with_exec_handler(|_, _| ExecOutput {
            exit_code: 0,
            output: Vec::new(),
        })
    }

    pub fn with_exec_handler<F>(handler: F) -> Self
    where
        F: Fn(&[String], &BTreeMap<String, Vec<u8>>) -> ExecOutput + Send + Sync + 'static,
    {
        Self {
            handler: Arc::new(handler),
            state: Mutex::new(MemoryState::default()),
        }
    }

    fn state(&self) -> MutexGuard<'_, MemoryState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Seeds the image store as if `tag` had been built earlier.
    pub fn insert_image(&self, tag: &str) -> SandboxImage {
        let mut state = self.state();
        let image = SandboxImage {
            id: state.next_id("sha256:mem"),
            tag: tag.to_string(),
        };
        state.images.insert(tag.to_string(), image.clone());
        image
    }

    pub fn fail_builds(&self, message: impl Into<String>) {
        self.state().fail_build = Some(message.into());
    }

    pub fn fail_starts(&self, message: impl Into<String>) {
        self.state().fail_start = Some(message.into());
    }

    pub fn fail_deliveries(&self, message: impl Into<String>) {
        self.state().fail_put = Some(message.into());
    }

    /// Makes every command other than `rm` fail at the backend, as if the
    /// runtime client could not reach the instance.
    pub fn fail_execs(&self, message: impl Into<String>) {
        self.state().fail_exec = Some(message.into());
    }

    /// Makes in-sandbox `rm` report failure without removing anything.
    pub fn fail_removals(&self) {
        self.state().fail_rm = true;
    }

    pub fn build_count(&self) -> usize {
        self.state().build_descriptions.len()
    }

    pub fn build_descriptions(&self) -> Vec<String> {
        self.state().build_descriptions.clone()
    }

    pub fn instance_count(&self) -> usize {
        self.state().instances.len()
    }

    pub fn start_options(&self, instance: &SandboxInstance) -> Option<StartOptions> {
        self.state()
            .instances
            .get(&instance.id)
            .map(|instance| instance.options.clone())
    }

    pub fn files(&self, instance: &SandboxInstance) -> BTreeMap<String, Vec<u8>> {
        self.state()
            .instances
            .get(&instance.id)
            .map(|instance| instance.files.clone())
            .unwrap_or_default()
    }

    pub fn exec_log(&self) -> Vec<Vec<String>> {
        self.state().exec_log.clone()
    }
}

impl MemoryState {
    fn next_id(&mut self, prefix: &str) -> String {
        self.id_counter += 1;
        format!("{}{:04}", prefix, self.id_counter)
    }
}

impl SandboxBackend for MemoryBackend {
    fn find_image(&self, tag: &str) -> Result<SandboxImage, BackendError> {
        self.state()
            .images
            .get(tag)
            .cloned()
            .ok_or_else(|| BackendError::ImageNotFound {
                tag: tag.to_string(),
            })
    }

    fn build_image(
        &self,
        build_description: &[u8],
        tag: &str,
    ) -> Result<SandboxImage, BackendError> {
        let mut state = self.state();
        state
            .build_descriptions
            .push(String::from_utf8_lossy(build_description).into_owned());

        if let Some(message) = &state.fail_build {
            return Err(BackendError::Build {
                tag: tag.to_string(),
                message: message.clone(),
            });
        }

        let image = SandboxImage {
            id: state.next_id("sha256:mem"),
            tag: tag.to_string(),
        };
        state.images.insert(tag.to_string(), image.clone());
        Ok(image)
    }

    fn start_instance(
        &self,
        image: &SandboxImage,
        options: StartOptions,
    ) -> Result<SandboxInstance, BackendError> {
        let mut state = self.state();
        if let Some(message) = &state.fail_start {
            return Err(BackendError::api(message.clone()));
        }
        if !state.images.values().any(|known| known.id == image.id) {
            return Err(BackendError::api(format!("No such image: {}", image.id)));
        }

        let id = state.next_id("mem-");
        state.instances.insert(
            id.clone(),
            MemoryInstance {
                options,
                files: BTreeMap::new(),
            },
        );
        Ok(SandboxInstance {
            id,
            image: image.clone(),
        })
    }

    fn put_archive(
        &self,
        instance: &SandboxInstance,
        path: &str,
        archive: &[u8],
    ) -> Result<(), BackendError> {
        let mut state = self.state();
        if let Some(message) = &state.fail_put {
            return Err(BackendError::api(message.clone()));
        }

        let unpacked = unpack(path, archive)?;
        let target = state
            .instances
            .get_mut(&instance.id)
            .ok_or_else(|| BackendError::api(format!("No such container: {}", instance.id)))?;
        target.files.extend(unpacked);
        Ok(())
    }

    fn exec(
        &self,
        instance: &SandboxInstance,
        argv: &[String],
        _timeout: Option<Duration>,
    ) -> Result<ExecOutput, BackendError> {
        let files = {
            let mut state = self.state();
            state.exec_log.push(argv.to_vec());
            let fail_rm = state.fail_rm;
            let fail_exec = state.fail_exec.clone();
            let target = state
                .instances
                .get_mut(&instance.id)
                .ok_or_else(|| BackendError::api(format!("No such container: {}", instance.id)))?;

            if argv.first().map(String::as_str) == Some("rm") {
                if fail_rm {
                    return Ok(ExecOutput {
                        exit_code: 1,
                        output: b"rm: cannot remove: Permission denied\n".to_vec(),
                    });
                }
                for path in argv.iter().skip(1).filter(|arg| !arg.starts_with('-')) {
                    target.files.remove(path);
                }
                return Ok(ExecOutput {
                    exit_code: 0,
                    output: Vec::new(),
                });
            }

            if let Some(message) = fail_exec {
                return Err(BackendError::api(message));
            }
            target.files.clone()
        };

        // The handler runs unlocked so it may block without stalling observers.
        Ok((self.handler)(argv, &files))
    }
}

fn unpack(path: &str, archive: &[u8]) -> Result<BTreeMap<String, Vec<u8>>, BackendError> {
    let mut files = BTreeMap::new();
    let mut archive = tar::Archive::new(archive);
    let entries = archive
        .entries()
        .map_err(|err| BackendError::api(format!("unreadable archive: {}", err)))?;

    for entry in entries {
        let mut entry =
            entry.map_err(|err| BackendError::api(format!("unreadable archive entry: {}", err)))?;
        let name = entry
            .path()
            .map_err(|err| BackendError::api(format!("bad archive path: {}", err)))?
            .to_string_lossy()
            .into_owned();
        let mut data = Vec::new();
        entry
            .read_to_end(&mut data)
            .map_err(|err| BackendError::api(format!("truncated archive entry: {}", err)))?;
        files.insert(crate::artifact::remote_path(path, &name), data);
    }

    Ok(files)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::artifact::pack_single_file;
    use chrono::Utc;

    #[test]
    fn archives_unpack_into_instance_filesystem() {
        let backend = MemoryBackend::new();
        let image = backend.insert_image("tag");
        let instance = backend
            .start_instance(&image, StartOptions::default())
            .unwrap();

        let archive = pack_single_file("a.py", b"print(1)", Utc::now()).unwrap();
        backend.put_archive(&instance, "/app", &archive).unwrap();
        assert_eq!(
            backend.files(&instance).get("/app/a.py").map(Vec::as_slice),
            Some(&b"print(1)"[..])
        );

        let rm = vec!["rm".to_string(), "-f".to_string(), "/app/a.py".to_string()];
        let out = backend.exec(&instance, &rm, None).unwrap();
        assert_eq!(out.exit_code, 0);
        assert!(backend.files(&instance).is_empty());
    }

    #[test]
    fn starting_unknown_image_fails() {
        let backend = MemoryBackend::new();
        let ghost = SandboxImage {
            id: "sha256:ghost".to_string(),
            tag: "ghost".to_string(),
        };
        assert!(backend
            .start_instance(&ghost, StartOptions::default())
            .is_err());
    }

    #[test]
    fn missing_tag_reports_not_found() {
        let backend = MemoryBackend::new();
        assert!(backend.find_image("nope").unwrap_err().is_not_found());
    }
}
