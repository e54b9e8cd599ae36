use crate::types::{JobRequest, Stage};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;

/// A value configured separately for the compile and run stages
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct StagePair<T> {
    pub compile: T,
    pub run: T,
}

impl<T: Copy> StagePair<T> {
    pub fn get(&self, stage: Stage) -> T {
        match stage {
            Stage::Compile => self.compile,
            Stage::Run => self.run,
        }
    }
}

/// Per-stage limits. Times are milliseconds, memory is bytes and a negative
/// memory limit means unlimited.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Limits {
    pub timeouts: StagePair<u64>,
    pub cpu_times: StagePair<u64>,
    pub memory_limits: StagePair<i64>,
}

/// Limits applied to a single stage invocation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StageLimits {
    pub timeout_ms: u64,
    pub cpu_time_ms: u64,
    pub memory_limit: Option<u64>,
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum LimitError {
    #[error("{field} cannot exceed the configured limit of {max}")]
    Exceeds { field: &'static str, max: i64 },
    #[error("{field} cannot be negative")]
    Negative { field: &'static str },
}

impl Limits {
    pub fn for_stage(&self, stage: Stage) -> StageLimits {
        StageLimits {
            timeout_ms: self.timeouts.get(stage),
            cpu_time_ms: self.cpu_times.get(stage),
            memory_limit: u64::try_from(self.memory_limits.get(stage)).ok(),
        }
    }

    /// Apply the overrides of `req` to these (maximum) limits.
    pub fn resolve(&self, req: &JobRequest) -> Result<Limits, LimitError> {
        Ok(Limits {
            timeouts: StagePair {
                compile: resolve_time("compile_timeout", req.compile_timeout, self.timeouts.compile)?,
                run: resolve_time("run_timeout", req.run_timeout, self.timeouts.run)?,
            },
            cpu_times: StagePair {
                compile: resolve_time("compile_cpu_time", req.compile_cpu_time, self.cpu_times.compile)?,
                run: resolve_time("run_cpu_time", req.run_cpu_time, self.cpu_times.run)?,
            },
            memory_limits: StagePair {
                compile: resolve_memory(
                    "compile_memory_limit",
                    req.compile_memory_limit,
                    self.memory_limits.compile,
                )?,
                run: resolve_memory("run_memory_limit", req.run_memory_limit, self.memory_limits.run)?,
            },
        })
    }
}

fn resolve_time(field: &'static str, requested: Option<u64>, max: u64) -> Result<u64, LimitError> {
    match requested {
        Some(value) if value > max => Err(LimitError::Exceeds {
            field,
            max: max as i64,
        }),
        Some(value) => Ok(value),
        None => Ok(max),
    }
}

fn resolve_memory(field: &'static str, requested: Option<i64>, max: i64) -> Result<i64, LimitError> {
    match requested {
        None => Ok(max),
        Some(value) if max < 0 => Ok(value),
        Some(value) if value < 0 => Err(LimitError::Negative { field }),
        Some(value) if value > max => Err(LimitError::Exceeds { field, max }),
        Some(value) => Ok(value),
    }
}

/// Read-only description of an installed language runtime
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Runtime {
    pub language: String,
    pub version: String,
    /// Whether the runtime has a compile stage
    #[serde(default)]
    pub compiled: bool,
    /// `KEY=VALUE` pairs exported into the sandbox
    #[serde(default)]
    pub env_vars: Vec<String>,
    /// Package directory holding the `compile` and `run` scripts
    pub pkgdir: PathBuf,
    pub max_process_count: u32,
    pub max_open_files: u32,
    /// Bytes
    pub max_file_size: u64,
    /// Bytes, per stream
    pub output_max_size: usize,
    pub limits: Limits,
}

impl Runtime {
    /// The `file` pseudo-runtime executes binary submissions directly, so
    /// every file counts as code; other runtimes only take utf8 sources.
    pub fn accepts_binary_code(&self) -> bool {
        self.language == "file"
    }
}

impl fmt::Display for Runtime {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}", self.language, self.version)
    }
}
