use anyhow::{Context, Result};
use capsules_python_runner::{descriptor, image, PythonRunner, RunnerConfig};
use clap::{Parser, Subcommand};
use std::io::Read;
use std::path::{Path, PathBuf};
use tracing::{info, warn};
use tracing_subscriber::{fmt, EnvFilter};

#[derive(Parser)]
#[command(name = "pyrunctl", version, about = "Run Python snippets in a container sandbox")]
struct Cli {
    /// YAML config file; PYRUNNER_* environment variables override it
    #[arg(long, global = true, env = "PYRUNNER_CONFIG", value_name = "FILE")]
    config: Option<PathBuf>,
    #[command(subcommand)]
    cmd: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run a Python file in the sandbox (stdin when FILE is omitted or "-")
    Run {
        #[arg(value_name = "FILE")]
        file: Option<PathBuf>,
        /// Print "<status>: <output>" instead of the bare output
        #[arg(long)]
        status: bool,
    },
    /// Resolve the sandbox image, building it when missing
    Prepare,
    /// Print the agent tool descriptor as JSON
    Describe,
    /// Print version and exit
    Version,
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .try_init();
}

fn main() -> Result<()> {
    init_tracing();
    let cli = Cli::parse();

    match cli.cmd {
        Commands::Run { file, status } => {
            let config = load_config(cli.config.as_deref())?;
            let code = read_source(file.as_deref())?;
            info!(tag = %config.image_tag, runtime = %config.runtime, "provisioning python sandbox");
            let runner =
                PythonRunner::from_config(config).context("Failed to provision python sandbox")?;

            let outcome = run_once(&runner, &code, status);
            stop_sandbox(&runner);

            // Mirror the script's exit status.
            let exit_code = outcome?;
            if exit_code != 0 {
                std::process::exit(exit_code);
            }
        }
        Commands::Prepare => {
            let config = load_config(cli.config.as_deref())?;
            config.validate()?;
            let backend = config.docker_backend();
            let image = image::resolve(
                &backend,
                &config.image_tag,
                &config.python_version,
                &config.workdir,
            )
            .context("Failed to prepare sandbox image")?;
            info!(tag = %image.tag, id = %image.id, "sandbox image ready");
            println!("{} {}", image.tag, image.id);
        }
        Commands::Describe => {
            println!("{}", serde_json::to_string_pretty(&descriptor())?);
        }
        Commands::Version => {
            println!("{}", env!("CARGO_PKG_VERSION"));
        }
    }
    Ok(())
}

fn run_once(runner: &PythonRunner, code: &str, status: bool) -> Result<i32> {
    let result = runner
        .run_python(code)
        .context("Failed to run python code")?;

    if status {
        println!("{}", result);
    } else if !result.output.is_empty() {
        println!("{}", result.output.to_text_lossy());
    }
    Ok(i32::try_from(result.error_code).unwrap_or(1))
}

/// Each invocation provisions its own instance, so it is stopped before exit.
fn stop_sandbox(runner: &PythonRunner) {
    let instance = runner.instance();
    match runner.backend().stop_instance(instance) {
        Ok(()) => info!(instance = %instance.id, "sandbox instance stopped"),
        Err(err) => warn!(instance = %instance.id, error = %err, "failed to stop sandbox instance"),
    }
}

fn load_config(path: Option<&Path>) -> Result<RunnerConfig> {
    let base = match path {
        Some(path) => RunnerConfig::load(path)?,
        None => RunnerConfig::default(),
    };
    Ok(base.with_env_overrides()?)
}

fn read_source(file: Option<&Path>) -> Result<String> {
    match file {
        Some(path) if path != Path::new("-") => std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read {}", path.display())),
        _ => {
            let mut code = String::new();
            std::io::stdin()
                .read_to_string(&mut code)
                .context("Failed to read python code from stdin")?;
            Ok(code)
        }
    }
}
