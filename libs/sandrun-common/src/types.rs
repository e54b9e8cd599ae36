use base64::{engine::general_purpose, Engine as _};
use serde::{Deserialize, Deserializer, Serialize};
use std::fmt;
use uuid::Uuid;

/// Declared encoding of a submitted file's content
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Encoding {
    Base64,
    Hex,
    #[default]
    Utf8,
}

#[derive(Debug, thiserror::Error)]
pub enum DecodeError {
    #[error("invalid base64: {0}")]
    Base64(#[from] base64::DecodeError),
    #[error("invalid hex: {0}")]
    Hex(#[from] hex::FromHexError),
}

impl Encoding {
    /// Anything other than `base64` or `hex` is treated as utf8.
    pub fn from_declared(declared: &str) -> Self {
        match declared {
            "base64" => Encoding::Base64,
            "hex" => Encoding::Hex,
            _ => Encoding::Utf8,
        }
    }

    pub fn decode(&self, content: &str) -> Result<Vec<u8>, DecodeError> {
        match self {
            Encoding::Base64 => Ok(general_purpose::STANDARD.decode(content)?),
            Encoding::Hex => Ok(hex::decode(content)?),
            Encoding::Utf8 => Ok(content.as_bytes().to_vec()),
        }
    }
}

impl fmt::Display for Encoding {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Encoding::Base64 => write!(f, "base64"),
            Encoding::Hex => write!(f, "hex"),
            Encoding::Utf8 => write!(f, "utf8"),
        }
    }
}

fn lenient_encoding<'de, D>(deserializer: D) -> Result<Encoding, D::Error>
where
    D: Deserializer<'de>,
{
    let declared: Option<String> = Option::deserialize(deserializer)?;
    Ok(declared
        .as_deref()
        .map(Encoding::from_declared)
        .unwrap_or_default())
}

/// A file as it arrives on the wire
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FileRequest {
    #[serde(default)]
    pub name: Option<String>,
    pub content: String,
    #[serde(default, deserialize_with = "lenient_encoding")]
    pub encoding: Encoding,
}

/// A file after defaults have been applied
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubmittedFile {
    pub name: String,
    pub content: String,
    pub encoding: Encoding,
}

impl SubmittedFile {
    pub fn from_request(index: usize, file: FileRequest) -> Self {
        Self {
            name: file
                .name
                .filter(|name| !name.is_empty())
                .unwrap_or_else(|| format!("file{}.code", index)),
            content: file.content,
            encoding: file.encoding,
        }
    }
}

fn default_version() -> String {
    "*".to_string()
}

/// Job submission as produced by a front end
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobRequest {
    pub language: String,
    #[serde(default = "default_version")]
    pub version: String,
    pub files: Vec<FileRequest>,
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default)]
    pub stdin: String,
    #[serde(default)]
    pub compile_timeout: Option<u64>,
    #[serde(default)]
    pub run_timeout: Option<u64>,
    #[serde(default)]
    pub compile_cpu_time: Option<u64>,
    #[serde(default)]
    pub run_cpu_time: Option<u64>,
    #[serde(default)]
    pub compile_memory_limit: Option<i64>,
    #[serde(default)]
    pub run_memory_limit: Option<i64>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Stage {
    Compile,
    Run,
}

impl Stage {
    pub fn as_str(&self) -> &'static str {
        match self {
            Stage::Compile => "compile",
            Stage::Run => "run",
        }
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Final status of a sandboxed stage.
///
/// `RE`, `SG`, `TO` and `XX` come from the sandbox's accounting file;
/// `OL` and `EL` are set when the worker trips the output cap.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(into = "String", from = "String")]
pub enum Status {
    RuntimeError,
    Signaled,
    TimedOut,
    InternalError,
    StdoutLimit,
    StderrLimit,
    Other(String),
}

impl Status {
    pub fn code(&self) -> &str {
        match self {
            Status::RuntimeError => "RE",
            Status::Signaled => "SG",
            Status::TimedOut => "TO",
            Status::InternalError => "XX",
            Status::StdoutLimit => "OL",
            Status::StderrLimit => "EL",
            Status::Other(code) => code,
        }
    }

    /// Whether the sandbox (or the output cap) terminated the process.
    pub fn is_forced_kill(&self) -> bool {
        matches!(
            self,
            Status::TimedOut | Status::StdoutLimit | Status::StderrLimit
        )
    }
}

impl From<String> for Status {
    fn from(code: String) -> Self {
        match code.as_str() {
            "RE" => Status::RuntimeError,
            "SG" => Status::Signaled,
            "TO" => Status::TimedOut,
            "XX" => Status::InternalError,
            "OL" => Status::StdoutLimit,
            "EL" => Status::StderrLimit,
            _ => Status::Other(code),
        }
    }
}

impl From<Status> for String {
    fn from(status: Status) -> Self {
        status.code().to_string()
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.code())
    }
}

/// Captured output and resource usage of one stage
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ExecutionResult {
    pub stdout: String,
    pub stderr: String,
    pub output: String,
    pub code: Option<i32>,
    pub signal: Option<String>,
    /// Peak memory in bytes
    pub memory: Option<u64>,
    /// Milliseconds
    pub cpu_time: Option<u64>,
    /// Milliseconds
    pub wall_time: Option<u64>,
    pub status: Option<Status>,
    pub message: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobOutcome {
    pub compile: Option<ExecutionResult>,
    pub run: Option<ExecutionResult>,
    pub language: String,
    pub version: String,
}

/// One line of worker output
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobResponse {
    pub job_id: Option<Uuid>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<JobOutcome>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Caller → job messages in streaming mode
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data", rename_all = "lowercase")]
pub enum StreamInput {
    Stdin(Vec<u8>),
    /// Signal name, e.g. `SIGTERM`
    Kill(String),
}

/// Job → caller messages in streaming mode
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum StreamEvent {
    Stdout { data: Vec<u8> },
    Stderr { data: Vec<u8> },
    Stage { stage: Stage },
    Exit {
        stage: Stage,
        error: Option<String>,
        code: Option<i32>,
        signal: Option<String>,
    },
}
