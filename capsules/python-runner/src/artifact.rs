//! Packaging of source text into a deliverable artifact.
//!
//! A [`CodeArtifact`] keeps two parallel representations of the same bytes: a
//! uniquely named local temporary file and a single-entry tar archive ready to
//! be unpacked into the sandbox working directory. The local file is removed
//! when the artifact is dropped, whichever way the execution ends.

use chrono::{DateTime, Utc};
use std::fs;
use std::io::Write;
use std::path::Path;
use tempfile::NamedTempFile;

use crate::error::RunnerError;

const ARTIFACT_PREFIX: &str = "pyrunner-";
const ARTIFACT_SUFFIX: &str = ".py";
const ARTIFACT_MODE: u32 = 0o644;

#[derive(Debug)]
pub struct CodeArtifact {
    file: NamedTempFile,
    file_name: String,
    remote_path: String,
    archive: Vec<u8>,
    modified: DateTime<Utc>,
}

impl CodeArtifact {
    /// Writes `code` verbatim to a fresh temporary file and archives it under
    /// its generated name. `temp_dir` overrides the system temp directory.
    pub fn materialize(
        code: &str,
        workdir: &str,
        temp_dir: Option<&Path>,
    ) -> Result<Self, RunnerError> {
        let mut builder = tempfile::Builder::new();
        builder.prefix(ARTIFACT_PREFIX).suffix(ARTIFACT_SUFFIX);
        let dir = temp_dir
            .map(Path::to_path_buf)
            .unwrap_or_else(std::env::temp_dir);
        let mut file = builder
            .tempfile_in(&dir)
            .map_err(|err| RunnerError::io(&dir, err))?;

        let path = file.path().to_path_buf();
        file.write_all(code.as_bytes())
            .and_then(|_| file.flush())
            .map_err(|err| RunnerError::io(&path, err))?;

        let file_name = path
            .file_name()
            .and_then(|name| name.to_str())
            .map(str::to_string)
            .ok_or_else(|| {
                RunnerError::io(
                    &path,
                    std::io::Error::new(
                        std::io::ErrorKind::InvalidInput,
                        "temporary file name is not valid UTF-8",
                    ),
                )
            })?;

        // Archive what actually landed on disk, not the caller's buffer.
        let data = fs::read(&path).map_err(|err| RunnerError::io(&path, err))?;
        let modified = Utc::now();
        let archive = pack_single_file(&file_name, &data, modified)
            .map_err(|err| RunnerError::io(&path, err))?;

        Ok(Self {
            file,
            remote_path: remote_path(workdir, &file_name),
            file_name,
            archive,
            modified,
        })
    }

    pub fn file_name(&self) -> &str {
        &self.file_name
    }

    pub fn local_path(&self) -> &Path {
        self.file.path()
    }

    /// Location of the delivered file inside the sandbox.
    pub fn remote_path(&self) -> &str {
        &self.remote_path
    }

    pub fn archive(&self) -> &[u8] {
        &self.archive
    }

    pub fn modified(&self) -> DateTime<Utc> {
        self.modified
    }

    /// Deletes the local file, surfacing the I/O error that a plain drop
    /// would swallow.
    pub fn remove(self) -> Result<(), RunnerError> {
        let path = self.file.path().to_path_buf();
        self.file
            .close()
            .map_err(|err| RunnerError::io(path, err))
    }
}

/// Builds an in-memory tar stream holding exactly one regular file.
pub fn pack_single_file(
    name: &str,
    data: &[u8],
    modified: DateTime<Utc>,
) -> std::io::Result<Vec<u8>> {
    let mut header = tar::Header::new_ustar();
    header.set_path(name)?;
    header.set_size(data.len() as u64);
    header.set_mtime(modified.timestamp().max(0) as u64);
    header.set_mode(ARTIFACT_MODE);
    header.set_entry_type(tar::EntryType::Regular);
    header.set_cksum();

    let mut builder = tar::Builder::new(Vec::new());
    builder.append(&header, data)?;
    builder.into_inner()
}

pub fn remote_path(workdir: &str, file_name: &str) -> String {
    format!("{}/{}", workdir.trim_end_matches('/'), file_name)
}
