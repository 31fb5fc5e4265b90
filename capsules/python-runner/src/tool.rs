//! Agent-facing surface: one `pythonrunner` operation that takes source text
//! and answers with text only.

use serde::Serialize;
use serde_json::{json, Value as JsonValue};
use tracing::error;

use crate::backend::{DockerCli, SandboxBackend};
use crate::engine::PythonRunner;

pub const TOOL_NAME: &str = "pythonrunner";

pub const TOOL_DESCRIPTION: &str = "\
This tool can run Python code. Pass the code and this tool will run it as a file on the command line.
The returned value will be the output of the python code, so if you pass print('Hello') it will give you back Hello.
This tool will put your code into a file and then run the file with python in a sandboxed container.
Pass this tool the python code as you would expect it to look in a file. You will have to indent the code properly.
If the code has an error, you will get the expected Python error output.
If the code has no output, you will get an empty string.";

#[derive(Debug, Clone, Serialize)]
pub struct ToolDescriptor {
    pub name: &'static str,
    pub description: &'static str,
    pub parameters: JsonValue,
}

pub fn descriptor() -> ToolDescriptor {
    ToolDescriptor {
        name: TOOL_NAME,
        description: TOOL_DESCRIPTION,
        parameters: json!({
            "type": "object",
            "properties": {
                "python_code": {
                    "type": "string",
                    "description": "Python source, laid out exactly as it would be in a file"
                }
            },
            "required": ["python_code"],
            "additionalProperties": false
        }),
    }
}

pub struct PythonRunnerTool<B: SandboxBackend = DockerCli> {
    runner: PythonRunner<B>,
}

impl<B: SandboxBackend> PythonRunnerTool<B> {
    pub fn new(runner: PythonRunner<B>) -> Self {
        Self { runner }
    }

    pub fn runner(&self) -> &PythonRunner<B> {
        &self.runner
    }

    /// Returns what the script printed. The exit status is dropped; failures
    /// of the runner itself come back as an `error[CODE]: ...` line.
    pub fn run_code(&self, python_code: &str) -> String {
        match self.runner.run_python(python_code) {
            Ok(result) => result.output.to_text_lossy(),
            Err(err) => {
                error!(code = err.code(), error = %err, "python runner failed");
                format!("error[{}]: {}", err.code(), err)
            }
        }
    }
}
