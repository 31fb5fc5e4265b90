use serde::Serialize;
use std::fmt;

/// Captured output of one execution. Text when the stream decoded as UTF-8,
/// otherwise the raw bytes exactly as the sandbox produced them.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", content = "value", rename_all = "lowercase")]
pub enum Output {
    Text(String),
    Bytes(Vec<u8>),
}

impl Output {
    pub fn as_text(&self) -> Option<&str> {
        match self {
            Output::Text(text) => Some(text),
            Output::Bytes(_) => None,
        }
    }

    /// Text form for surfaces that can only carry strings.
    pub fn to_text_lossy(&self) -> String {
        match self {
            Output::Text(text) => text.clone(),
            Output::Bytes(bytes) => String::from_utf8_lossy(bytes).into_owned(),
        }
    }

    pub fn is_empty(&self) -> bool {
        match self {
            Output::Text(text) => text.is_empty(),
            Output::Bytes(bytes) => bytes.is_empty(),
        }
    }
}

impl fmt::Display for Output {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Output::Text(text) => f.write_str(text),
            Output::Bytes(bytes) => write!(f, "b\"{}\"", bytes.escape_ascii()),
        }
    }
}

/// Normalized result of running a snippet: the process exit status and its
/// combined stdout/stderr with trailing whitespace removed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PythonResult {
    pub error_code: i64,
    pub output: Output,
}

impl PythonResult {
    pub fn new(error_code: i64, raw: Vec<u8>) -> Self {
        let output = match String::from_utf8(raw) {
            Ok(text) => Output::Text(text.trim_end().to_string()),
            Err(err) => {
                let mut bytes = err.into_bytes();
                let keep = bytes.trim_ascii_end().len();
                bytes.truncate(keep);
                Output::Bytes(bytes)
            }
        };

        Self { error_code, output }
    }

    pub fn is_success(&self) -> bool {
        self.error_code == 0
    }
}

impl fmt::Display for PythonResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.error_code, self.output)
    }
}
