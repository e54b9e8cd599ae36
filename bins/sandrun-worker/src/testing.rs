// Test doubles for running jobs without an isolate install
//
// `FakeSandbox` provisions boxes as plain directories and runs each stage
// through a bash wrapper that mimics isolate's observable behaviour: the
// stage script runs with the submission as working directory, an accounting
// file is written on exit, and SIGABRT/SIGTERM kill the stage and are
// reported as `status:SG`.

use crate::admission::AdmissionController;
use crate::job::{JobContext, JobSpec};
use crate::metrics::Metrics;
use crate::sandbox::{Invocation, Sandbox, SandboxError, SUBMISSION_DIR};
use async_trait::async_trait;
use sandrun_common::runtime::{Limits, Runtime, StagePair};
use sandrun_common::types::{Encoding, SubmittedFile};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use tempfile::TempDir;
use tokio::process::Command;

const WRAPPER: &str = r#"
meta="$1"; override="$2"; shift 2
on_signal() {
    kill -KILL $(jobs -p) 2>/dev/null
    printf 'status:SG\nexitsig:%s\nmessage:Caught fatal signal %s\n' "$1" "$1" > "$meta"
    exit $((128 + $1))
}
trap 'on_signal 6' ABRT
trap 'on_signal 15' TERM
/bin/bash "$@" <&0 &
wait $!
code=$?
if [ -n "$override" ]; then
    printf '%s\n' "$override" > "$meta"
    exit $code
fi
{
    printf 'time:0.010\ntime-wall:0.012\ncg-mem:2048\nexitcode:%s\n' "$code"
    if [ "$code" -ne 0 ]; then
        printf 'status:RE\nmessage:Exited with error status %s\n' "$code"
    fi
} > "$meta"
exit $code
"#;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Spawned {
    pub box_id: u32,
    /// Script file name, i.e. the stage
    pub script: String,
    pub args: Vec<String>,
}

pub struct FakeSandbox {
    root: TempDir,
    metadata_override: Mutex<Option<String>>,
    /// Number of `init` calls that still succeed
    init_budget: AtomicUsize,
    fail_teardown: AtomicBool,
    spawned: Mutex<Vec<Spawned>>,
    torn_down: Mutex<Vec<u32>>,
}

impl FakeSandbox {
    pub fn new() -> Self {
        Self {
            root: TempDir::new().unwrap(),
            metadata_override: Mutex::new(None),
            init_budget: AtomicUsize::new(usize::MAX),
            fail_teardown: AtomicBool::new(false),
            spawned: Mutex::new(Vec::new()),
            torn_down: Mutex::new(Vec::new()),
        }
    }

    /// Write `content` as the accounting file instead of real readings.
    pub fn override_metadata(&self, content: &str) {
        *self.metadata_override.lock().unwrap() = Some(content.to_string());
    }

    pub fn fail_init(&self) {
        self.fail_init_after(0);
    }

    /// Let `successes` more boxes be provisioned, then fail every `init`.
    pub fn fail_init_after(&self, successes: usize) {
        self.init_budget.store(successes, Ordering::SeqCst);
    }

    pub fn fail_teardown(&self) {
        self.fail_teardown.store(true, Ordering::SeqCst);
    }

    pub fn spawned(&self) -> Vec<Spawned> {
        self.spawned.lock().unwrap().clone()
    }

    pub fn torn_down(&self) -> Vec<u32> {
        self.torn_down.lock().unwrap().clone()
    }

    pub fn box_root(&self, box_id: u32) -> PathBuf {
        self.root.path().join(box_id.to_string())
    }
}

#[async_trait]
impl Sandbox for FakeSandbox {
    async fn init(&self, box_id: u32) -> Result<PathBuf, SandboxError> {
        let granted = self
            .init_budget
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |left| left.checked_sub(1));
        if granted.is_err() {
            return Err(SandboxError::EmptyOutput { op: "--init" });
        }
        let dir = self.box_root(box_id).join("box");
        tokio::fs::create_dir_all(&dir).await?;
        Ok(dir)
    }

    async fn cleanup(&self, box_id: u32) -> Result<(), SandboxError> {
        self.torn_down.lock().unwrap().push(box_id);
        if self.fail_teardown.load(Ordering::SeqCst) {
            return Err(SandboxError::Io(std::io::Error::other("box is busy")));
        }
        tokio::fs::remove_dir_all(self.box_root(box_id)).await?;
        Ok(())
    }

    fn metadata_path(&self, box_id: u32) -> PathBuf {
        self.root.path().join(format!("{}-metadata.txt", box_id))
    }

    fn command(&self, inv: &Invocation<'_>) -> Command {
        self.spawned.lock().unwrap().push(Spawned {
            box_id: inv.box_id,
            script: inv
                .script
                .file_name()
                .map(|name| name.to_string_lossy().into_owned())
                .unwrap_or_default(),
            args: inv.args.to_vec(),
        });
        let metadata_override = self.metadata_override.lock().unwrap().clone();

        let mut cmd = Command::new("/bin/bash");
        cmd.arg("-c")
            .arg(WRAPPER)
            .arg("fake-isolate")
            .arg(inv.metadata_path)
            .arg(metadata_override.unwrap_or_default())
            .arg(&inv.script)
            .args(inv.args)
            .current_dir(self.box_root(inv.box_id).join("box").join(SUBMISSION_DIR))
            .env_clear();
        for var in &inv.env {
            if let Some((key, value)) = var.split_once('=') {
                cmd.env(key, value);
            }
        }
        cmd.env("PATH", "/usr/local/bin:/usr/bin:/bin");
        cmd
    }
}

/// A runtime whose stage scripts live in a scratch package directory
pub struct TestRuntime {
    _pkgdir: TempDir,
    pub runtime: Arc<Runtime>,
}

impl TestRuntime {
    pub fn interpreted(run: &str) -> Self {
        Self::build("bash", None, run)
    }

    pub fn compiled(compile: &str, run: &str) -> Self {
        Self::build("shc", Some(compile), run)
    }

    fn build(language: &str, compile: Option<&str>, run: &str) -> Self {
        let pkgdir = TempDir::new().unwrap();
        write_script(pkgdir.path(), "run", run);
        if let Some(compile) = compile {
            write_script(pkgdir.path(), "compile", compile);
        }

        let runtime = Runtime {
            language: language.to_string(),
            version: "1.0.0".to_string(),
            compiled: compile.is_some(),
            env_vars: vec!["LANG=C".to_string()],
            pkgdir: pkgdir.path().to_path_buf(),
            max_process_count: 64,
            max_open_files: 2048,
            max_file_size: 10_000_000,
            output_max_size: 64 * 1024,
            limits: Limits {
                timeouts: StagePair { compile: 10_000, run: 3_000 },
                cpu_times: StagePair { compile: 10_000, run: 3_000 },
                memory_limits: StagePair { compile: -1, run: -1 },
            },
        };
        Self {
            _pkgdir: pkgdir,
            runtime: Arc::new(runtime),
        }
    }

    pub fn with_output_max_size(mut self, max: usize) -> Self {
        Arc::make_mut(&mut self.runtime).output_max_size = max;
        self
    }

    pub fn spec(&self, files: Vec<SubmittedFile>, args: &[&str], stdin: &str) -> JobSpec {
        JobSpec {
            files,
            args: args.iter().map(|a| a.to_string()).collect(),
            stdin: stdin.to_string(),
            limits: self.runtime.limits,
        }
    }
}

fn write_script(dir: &Path, name: &str, body: &str) {
    std::fs::write(dir.join(name), format!("#!/bin/bash\n{}\n", body)).unwrap();
}

pub fn utf8_file(name: &str, content: &str) -> SubmittedFile {
    SubmittedFile {
        name: name.to_string(),
        content: content.to_string(),
        encoding: Encoding::Utf8,
    }
}

pub fn context(sandbox: Arc<FakeSandbox>, capacity: usize) -> Arc<JobContext> {
    let metrics = Arc::new(Metrics::new().unwrap());
    Arc::new(JobContext {
        admission: Arc::new(AdmissionController::new(capacity, Arc::clone(&metrics))),
        sandbox,
        metrics,
        share_network: false,
    })
}
