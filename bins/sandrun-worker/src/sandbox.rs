/// Sandbox backend - provisioning, teardown and process invocation
///
/// A sandbox hands out isolated filesystem/process scopes ("boxes") keyed by
/// a numeric id. The job state machine never talks to the sandbox binary
/// directly: it asks a [`Sandbox`] to create a box, to build the command for
/// one stage, and to tear the box down again.
///
/// [`Isolate`] is the production backend.
use async_trait::async_trait;
use std::path::{Path, PathBuf};
use std::process::ExitStatus;
use tokio::process::Command;
use tracing::debug;

#[derive(Debug, thiserror::Error)]
pub enum SandboxError {
    #[error("failed to run sandbox command: {0}")]
    Io(#[from] std::io::Error),
    #[error("`{op}` exited with {status}\nstdout: {stdout}\nstderr: {stderr}")]
    Failed {
        op: &'static str,
        status: ExitStatus,
        stdout: String,
        stderr: String,
    },
    #[error("received empty stdout from `{op}`")]
    EmptyOutput { op: &'static str },
}

/// A provisioned box owned by one job
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SandboxBox {
    pub id: u32,
    pub metadata_path: PathBuf,
    /// Root of the box filesystem; the submission lives in `dir/submission`
    pub dir: PathBuf,
}

impl SandboxBox {
    pub fn submission_dir(&self) -> PathBuf {
        self.dir.join(SUBMISSION_DIR)
    }
}

pub const SUBMISSION_DIR: &str = "submission";

/// Per-process resource limits for one invocation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProcessLimits {
    pub max_process_count: u32,
    pub max_open_files: u32,
    /// Bytes
    pub max_file_size: u64,
    pub wall_time_ms: u64,
    pub cpu_time_ms: u64,
    /// Bytes, `None` for unlimited
    pub memory_limit: Option<u64>,
}

/// Everything needed to launch one stage inside an existing box
#[derive(Debug, Clone)]
pub struct Invocation<'a> {
    pub box_id: u32,
    pub metadata_path: &'a Path,
    /// `KEY=VALUE` pairs; nothing else from the host environment is passed on
    pub env: Vec<String>,
    pub package_dir: &'a Path,
    pub limits: ProcessLimits,
    pub share_network: bool,
    /// Stage script, run through `/bin/bash`
    pub script: PathBuf,
    pub args: &'a [String],
}

#[async_trait]
pub trait Sandbox: Send + Sync {
    /// Create box `box_id` and return its root directory.
    async fn init(&self, box_id: u32) -> Result<PathBuf, SandboxError>;

    /// Destroy box `box_id`. Callers treat failures as non-fatal.
    async fn cleanup(&self, box_id: u32) -> Result<(), SandboxError>;

    fn metadata_path(&self, box_id: u32) -> PathBuf;

    /// Build (but do not spawn) the command running one stage.
    fn command(&self, invocation: &Invocation<'_>) -> Command;
}

pub const ISOLATE_PATH: &str = "/usr/local/bin/isolate";

/// `isolate` (IOI sandbox) with control groups
#[derive(Debug, Clone)]
pub struct Isolate {
    binary: PathBuf,
    metadata_dir: PathBuf,
}

impl Isolate {
    pub fn new(binary: impl Into<PathBuf>, metadata_dir: impl Into<PathBuf>) -> Self {
        Self {
            binary: binary.into(),
            metadata_dir: metadata_dir.into(),
        }
    }

    async fn box_command(&self, op: &'static str, box_id: u32) -> Result<String, SandboxError> {
        debug!(box_id, "Running isolate {}", op);

        let output = Command::new(&self.binary)
            .arg(op)
            .arg("--cg")
            .arg(format!("-b{}", box_id))
            .output()
            .await?;

        let stdout = String::from_utf8_lossy(&output.stdout).into_owned();
        if !output.status.success() {
            return Err(SandboxError::Failed {
                op,
                status: output.status,
                stdout,
                stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
            });
        }
        Ok(stdout)
    }
}

#[async_trait]
impl Sandbox for Isolate {
    async fn init(&self, box_id: u32) -> Result<PathBuf, SandboxError> {
        let stdout = self.box_command("--init", box_id).await?;
        let root = stdout.trim();
        if root.is_empty() {
            return Err(SandboxError::EmptyOutput { op: "--init" });
        }
        Ok(Path::new(root).join("box"))
    }

    async fn cleanup(&self, box_id: u32) -> Result<(), SandboxError> {
        self.box_command("--cleanup", box_id).await.map(drop)
    }

    fn metadata_path(&self, box_id: u32) -> PathBuf {
        self.metadata_dir.join(format!("{}-metadata.txt", box_id))
    }

    fn command(&self, inv: &Invocation<'_>) -> Command {
        let mut cmd = Command::new(&self.binary);
        cmd.arg("--run")
            .arg(format!("-b{}", inv.box_id))
            .arg(format!("--meta={}", inv.metadata_path.display()))
            .arg("--cg")
            .arg("-s")
            .arg("-c")
            .arg(format!("/box/{}", SUBMISSION_DIR));

        for var in &inv.env {
            cmd.arg("-E").arg(var);
        }

        cmd.arg(format!("--dir={}", inv.package_dir.display()))
            .arg("--dir=/etc:noexec")
            .arg(format!("--processes={}", inv.limits.max_process_count))
            .arg(format!("--open-files={}", inv.limits.max_open_files))
            .arg(format!("--fsize={}", inv.limits.max_file_size / 1000))
            .arg(format!("--wall-time={}", millis_to_seconds(inv.limits.wall_time_ms)))
            .arg(format!("--time={}", millis_to_seconds(inv.limits.cpu_time_ms)))
            .arg("--extra-time=0");

        if let Some(memory) = inv.limits.memory_limit {
            cmd.arg(format!("--cg-mem={}", memory / 1000));
        }
        if inv.share_network {
            cmd.arg("--share-net");
        }

        cmd.arg("--")
            .arg("/bin/bash")
            .arg(&inv.script)
            .args(inv.args);
        cmd
    }
}

fn millis_to_seconds(ms: u64) -> String {
    format!("{}", ms as f64 / 1000.0)
}
