//! End-to-end checks against a real container daemon.
//! Run with `cargo test -p capsules_python_runner -- --ignored`.

use capsules_python_runner::{PythonRunner, RunnerConfig};
use std::path::Path;
use std::time::Duration;

fn python_code(name: &str) -> String {
    let path = Path::new(env!("CARGO_MANIFEST_DIR"))
        .join("tests/python_code")
        .join(format!("{name}.py"));
    std::fs::read_to_string(path).unwrap()
}

fn docker_runner(scratch: &Path) -> PythonRunner {
    let config = RunnerConfig {
        temp_dir: Some(scratch.to_path_buf()),
        ..RunnerConfig::from_env().unwrap()
    };
    PythonRunner::from_config(config).expect("docker daemon reachable")
}

#[test]
#[ignore] // Requires a Docker daemon; run via CI with --ignored
fn code_runs() {
    let scratch = tempfile::tempdir().unwrap();
    let runner = docker_runner(scratch.path());

    let result = runner.run_python(&python_code("test_print")).unwrap();

    assert_eq!(result.output.as_text(), Some("Running!"));
    assert_eq!(result.error_code, 0);
    assert_eq!(result.to_string(), "0: Running!");
    assert_eq!(std::fs::read_dir(scratch.path()).unwrap().count(), 0);
}

#[test]
#[ignore] // Requires a Docker daemon; run via CI with --ignored
fn error_output() {
    let scratch = tempfile::tempdir().unwrap();
    let runner = docker_runner(scratch.path());

    let result = runner.run_python(&python_code("test_error")).unwrap();
    let text = result.output.as_text().unwrap();

    assert!(text.starts_with("Traceback (most recent call last):"));
    assert!(text.ends_with("division by zero"));
    assert_eq!(result.error_code, 1);
}

#[test]
#[ignore] // Requires a Docker daemon; run via CI with --ignored
fn stdout_and_stderr_are_combined_in_order() {
    let scratch = tempfile::tempdir().unwrap();
    let runner = docker_runner(scratch.path());

    let code = "import sys\nprint('out', flush=True)\nprint('err', file=sys.stderr, flush=True)\nprint('out again')\n";
    let result = runner.run_python(code).unwrap();

    assert_eq!(result.output.as_text(), Some("out\nerr\nout again"));
}

#[test]
#[ignore] // Requires a Docker daemon; run via CI with --ignored
fn exec_timeout_kills_runaway_script() {
    let scratch = tempfile::tempdir().unwrap();
    let config = RunnerConfig {
        temp_dir: Some(scratch.path().to_path_buf()),
        exec_timeout: Some(Duration::from_secs(2)),
        ..RunnerConfig::from_env().unwrap()
    };
    let runner = PythonRunner::from_config(config).unwrap();

    let result = runner.run_python("while True:\n    pass\n").unwrap();

    // SIGKILL from coreutils timeout
    assert_eq!(result.error_code, 137);
}
