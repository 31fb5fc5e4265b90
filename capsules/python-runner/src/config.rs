use serde::{Deserialize, Serialize};
use std::env;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::debug;

use crate::backend::DockerCli;
use crate::error::RunnerError;
use crate::image::{DEFAULT_IMAGE_TAG, DEFAULT_PYTHON_VERSION};

pub const DEFAULT_WORKDIR: &str = "/app";
pub const DEFAULT_INTERPRETER: &str = "python";

/// Settings for provisioning the sandbox and running snippets in it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct RunnerConfig {
    /// Substituted into `FROM python:{version}` when the image is built.
    pub python_version: String,
    pub image_tag: String,
    /// Directory inside the sandbox that receives delivered artifacts.
    pub workdir: String,
    pub interpreter: String,
    /// Container CLI binary used by [`DockerCli`].
    pub runtime: String,
    #[serde(with = "humantime_opt", skip_serializing_if = "Option::is_none")]
    pub exec_timeout: Option<Duration>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub temp_dir: Option<PathBuf>,
}

impl Default for RunnerConfig {
    fn default() -> Self {
        Self {
            python_version: DEFAULT_PYTHON_VERSION.to_string(),
            image_tag: DEFAULT_IMAGE_TAG.to_string(),
            workdir: DEFAULT_WORKDIR.to_string(),
            interpreter: DEFAULT_INTERPRETER.to_string(),
            runtime: crate::backend::DEFAULT_RUNTIME.to_string(),
            exec_timeout: None,
            temp_dir: None,
        }
    }
}

impl RunnerConfig {
    /// Defaults overlaid with `PYRUNNER_*` environment variables.
    pub fn from_env() -> Result<Self, RunnerError> {
        Self::default().with_env_overrides()
    }

    /// Reads a YAML config file. Missing keys take their defaults.
    pub fn load(path: &Path) -> Result<Self, RunnerError> {
        let raw = fs::read_to_string(path).map_err(|err| {
            RunnerError::invalid_config(format!(
                "failed to read config file {}: {}",
                path.display(),
                err
            ))
        })?;
        serde_yaml::from_str(&raw).map_err(|err| {
            RunnerError::invalid_config(format!(
                "failed to parse config file {}: {}",
                path.display(),
                err
            ))
        })
    }

    pub fn with_env_overrides(mut self) -> Result<Self, RunnerError> {
        if let Some(value) = env_value("PYRUNNER_PYTHON_VERSION") {
            self.python_version = value;
        }
        if let Some(value) = env_value("PYRUNNER_IMAGE_TAG") {
            self.image_tag = value;
        }
        if let Some(value) = env_value("PYRUNNER_WORKDIR") {
            self.workdir = value;
        }
        if let Some(value) = env_value("PYRUNNER_INTERPRETER") {
            self.interpreter = value;
        }
        if let Some(value) = env_value("PYRUNNER_CONTAINER_RUNTIME") {
            self.runtime = value;
        }
        if let Some(value) = env_value("PYRUNNER_EXEC_TIMEOUT") {
            let timeout = humantime::parse_duration(&value).map_err(|err| {
                RunnerError::invalid_config(format!(
                    "PYRUNNER_EXEC_TIMEOUT '{}' is not a duration: {}",
                    value, err
                ))
            })?;
            self.exec_timeout = Some(timeout);
        }
        if let Some(value) = env_value("PYRUNNER_TEMP_DIR") {
            self.temp_dir = Some(PathBuf::from(value));
        }
        debug!(config = ?self, "resolved python runner config");
        Ok(self)
    }

    pub fn validate(&self) -> Result<(), RunnerError> {
        if self.python_version.trim().is_empty() {
            return Err(RunnerError::invalid_config("python version cannot be empty"));
        }
        if self.python_version.chars().any(char::is_whitespace) {
            return Err(RunnerError::invalid_config(format!(
                "python version '{}' cannot contain whitespace",
                self.python_version
            )));
        }
        if self.image_tag.trim().is_empty() {
            return Err(RunnerError::invalid_config("image tag cannot be empty"));
        }
        if !self.workdir.starts_with('/') {
            return Err(RunnerError::invalid_config(format!(
                "workdir '{}' must be absolute",
                self.workdir
            )));
        }
        if self.interpreter.trim().is_empty() {
            return Err(RunnerError::invalid_config("interpreter cannot be empty"));
        }
        if self.runtime.trim().is_empty() {
            return Err(RunnerError::invalid_config("container runtime cannot be empty"));
        }
        if self.exec_timeout == Some(Duration::ZERO) {
            return Err(RunnerError::invalid_config("exec timeout must be positive"));
        }
        if let Some(dir) = &self.temp_dir {
            if !dir.is_dir() {
                return Err(RunnerError::invalid_config(format!(
                    "temp dir '{}' does not exist",
                    dir.display()
                )));
            }
        }
        Ok(())
    }

    pub fn docker_backend(&self) -> DockerCli {
        DockerCli::new(self.runtime.clone())
    }
}

fn env_value(key: &str) -> Option<String> {
    env::var(key)
        .ok()
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
}

mod humantime_opt {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(
        value: &Option<Duration>,
        serializer: S,
    ) -> Result<S::Ok, S::Error> {
        match value {
            Some(duration) => {
                serializer.serialize_str(&humantime::format_duration(*duration).to_string())
            }
            None => serializer.serialize_none(),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(
        deserializer: D,
    ) -> Result<Option<Duration>, D::Error> {
        let raw: Option<String> = Option::deserialize(deserializer)?;
        raw.map(|value| humantime::parse_duration(&value).map_err(serde::de::Error::custom))
            .transpose()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;

    const ENV_KEYS: [&str; 7] = [
        "PYRUNNER_PYTHON_VERSION",
        "PYRUNNER_IMAGE_TAG",
        "PYRUNNER_WORKDIR",
        "PYRUNNER_INTERPRETER",
        "PYRUNNER_CONTAINER_RUNTIME",
        "PYRUNNER_EXEC_TIMEOUT",
        "PYRUNNER_TEMP_DIR",
    ];

    fn clear_env() {
        for key in ENV_KEYS {
            env::remove_var(key);
        }
    }

    #[test]
    fn defaults_match_runner_contract() {
        let config = RunnerConfig::default();
        assert_eq!(config.python_version, "3.11");
        assert_eq!(config.image_tag, "crew-python-runner");
        assert_eq!(config.workdir, "/app");
        assert_eq!(config.interpreter, "python");
        assert_eq!(config.runtime, "docker");
        assert_eq!(config.exec_timeout, None);
        config.validate().unwrap();
    }

    #[test]
    #[serial]
    fn env_overrides_apply() {
        clear_env();
        env::set_var("PYRUNNER_PYTHON_VERSION", "3.12");
        env::set_var("PYRUNNER_CONTAINER_RUNTIME", "podman");
        env::set_var("PYRUNNER_EXEC_TIMEOUT", "30s");
        env::set_var("PYRUNNER_IMAGE_TAG", "  ");

        let config = RunnerConfig::from_env().unwrap();
        assert_eq!(config.python_version, "3.12");
        assert_eq!(config.runtime, "podman");
        assert_eq!(config.exec_timeout, Some(Duration::from_secs(30)));
        // blank values are ignored
        assert_eq!(config.image_tag, "crew-python-runner");

        clear_env();
    }

    #[test]
    #[serial]
    fn bad_timeout_env_is_invalid_config() {
        clear_env();
        env::set_var("PYRUNNER_EXEC_TIMEOUT", "soon");
        let err = RunnerConfig::from_env().unwrap_err();
        assert_eq!(err.code(), "PYRUNNER_INVALID_CONFIG");
        clear_env();
    }

    #[test]
    fn yaml_file_fills_missing_keys_with_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("runner.yaml");
        fs::write(&path, "pythonVersion: \"3.10\"\nexecTimeout: 1m 30s\n").unwrap();

        let config = RunnerConfig::load(&path).unwrap();
        assert_eq!(config.python_version, "3.10");
        assert_eq!(config.exec_timeout, Some(Duration::from_secs(90)));
        assert_eq!(config.workdir, DEFAULT_WORKDIR);
    }

    #[test]
    fn serializes_timeout_as_humantime() {
        let config = RunnerConfig {
            exec_timeout: Some(Duration::from_secs(5)),
            ..RunnerConfig::default()
        };
        let value = serde_json::to_value(&config).unwrap();
        assert_eq!(value["execTimeout"], "5s");
        assert!(value.get("tempDir").is_none());
    }

    #[test]
    fn validate_rejects_bad_values() {
        let cases = [
            RunnerConfig {
                python_version: String::new(),
                ..RunnerConfig::default()
            },
            RunnerConfig {
                python_version: "3.11 AS evil".to_string(),
                ..RunnerConfig::default()
            },
            RunnerConfig {
                workdir: "app".to_string(),
                ..RunnerConfig::default()
            },
            RunnerConfig {
                exec_timeout: Some(Duration::ZERO),
                ..RunnerConfig::default()
            },
            RunnerConfig {
                temp_dir: Some(PathBuf::from("/nonexistent/pyrunner-tmp")),
                ..RunnerConfig::default()
            },
        ];

        for config in cases {
            let err = config.validate().unwrap_err();
            assert!(matches!(err, RunnerError::InvalidConfig { .. }), "{:?}", config);
        }
    }
}
