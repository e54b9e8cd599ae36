/// Job - the execution state machine
///
/// **Lifecycle:**
/// `Ready` → `prime()` → `Primed` → `execute()` → `Executed`, then
/// `cleanup()` regardless of where the job stopped.
///
/// - `prime` takes an admission slot (waiting in line if needed), provisions
///   a box and stages the submitted files into `<box>/submission`
/// - `execute` runs the optional compile stage, moves the submission into a
///   fresh box, then runs the program
/// - `cleanup` gives the slot back and tears down every box the job touched
///
/// A failed `prime` keeps whatever it already acquired. Callers must always
/// follow up with `cleanup`; [`Job::run`] does this for them.
use crate::admission::{Admission, AdmissionController};
use crate::call::SafeCall;
use crate::error::JobError;
use crate::metrics::{JobRecorder, Metrics};
use crate::sandbox::{Sandbox, SandboxBox};
use crate::stream::OutputMode;
use futures_util::future::join_all;
use sandrun_common::runtime::{LimitError, Limits, Runtime};
use sandrun_common::types::{
    Encoding, ExecutionResult, JobOutcome, JobRequest, Stage, Status, StreamEvent, SubmittedFile,
};
use std::fmt;
use std::io::ErrorKind;
use std::path::{Component, Path, PathBuf};
use std::sync::Arc;
use tokio::fs::DirBuilder;
use tracing::{debug, error, info, instrument, warn};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobState {
    Ready,
    Primed,
    Executed,
}

impl fmt::Display for JobState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            JobState::Ready => write!(f, "ready"),
            JobState::Primed => write!(f, "primed"),
            JobState::Executed => write!(f, "executed"),
        }
    }
}

/// Process-wide collaborators shared by every job
pub struct JobContext {
    pub admission: Arc<AdmissionController>,
    pub sandbox: Arc<dyn Sandbox>,
    pub metrics: Arc<Metrics>,
    /// Give sandboxed processes network access
    pub share_network: bool,
}

/// What to run, with request defaults already applied
#[derive(Debug, Clone)]
pub struct JobSpec {
    pub files: Vec<SubmittedFile>,
    pub args: Vec<String>,
    pub stdin: String,
    pub limits: Limits,
}

impl JobSpec {
    pub fn from_request(req: JobRequest, runtime: &Runtime) -> Result<Self, LimitError> {
        let limits = runtime.limits.resolve(&req)?;
        Ok(Self {
            files: req
                .files
                .into_iter()
                .enumerate()
                .map(|(idx, file)| SubmittedFile::from_request(idx, file))
                .collect(),
            args: req.args,
            stdin: req.stdin,
            limits,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TeardownFailure {
    pub box_id: u32,
    pub reason: String,
}

/// Diagnostics collected by [`Job::cleanup`]
#[derive(Debug, Default)]
pub struct CleanupReport {
    pub boxes: Vec<u32>,
    pub failures: Vec<TeardownFailure>,
}

impl CleanupReport {
    pub fn is_clean(&self) -> bool {
        self.failures.is_empty()
    }
}

pub struct Job {
    pub id: Uuid,
    ctx: Arc<JobContext>,
    runtime: Arc<Runtime>,
    files: Vec<SubmittedFile>,
    args: Vec<String>,
    stdin: String,
    limits: Limits,
    state: JobState,
    sandbox_box: Option<SandboxBox>,
    /// Every box ever provisioned for this job, in order
    dirty_boxes: Vec<SandboxBox>,
    recorder: JobRecorder,
}

impl Job {
    pub fn new(ctx: Arc<JobContext>, runtime: Arc<Runtime>, spec: JobSpec) -> Self {
        let mut stdin = spec.stdin;
        if !stdin.ends_with('\n') {
            stdin.push('\n');
        }
        let recorder = JobRecorder::new(&runtime.language, &runtime.version);

        Self {
            id: Uuid::new_v4(),
            ctx,
            runtime,
            files: spec.files,
            args: spec.args,
            stdin,
            limits: spec.limits,
            state: JobState::Ready,
            sandbox_box: None,
            dirty_boxes: Vec::new(),
            recorder,
        }
    }

    pub fn state(&self) -> JobState {
        self.state
    }

    pub fn runtime(&self) -> &Runtime {
        &self.runtime
    }

    pub fn files(&self) -> &[SubmittedFile] {
        &self.files
    }

    pub fn stdin(&self) -> &str {
        &self.stdin
    }

    /// The box stages currently run in
    pub fn sandbox_box(&self) -> Option<&SandboxBox> {
        self.sandbox_box.as_ref()
    }

    /// Boxes awaiting teardown
    pub fn dirty_boxes(&self) -> &[SandboxBox] {
        &self.dirty_boxes
    }

    fn metrics(&self) -> Arc<Metrics> {
        Arc::clone(&self.ctx.metrics)
    }

    async fn create_box(&mut self) -> Result<SandboxBox, JobError> {
        let admission = &self.ctx.admission;
        let box_id = admission.next_box_id().ok_or(JobError::BoxIdsExhausted)?;
        debug!(job_id = %self.id, box_id, "Provisioning sandbox box");

        let dir = match self.ctx.sandbox.init(box_id).await {
            Ok(dir) => dir,
            Err(source) => {
                admission.release_box_id(box_id);
                return Err(JobError::Provision { box_id, source });
            }
        };

        let sandbox_box = SandboxBox {
            id: box_id,
            metadata_path: self.ctx.sandbox.metadata_path(box_id),
            dir,
        };
        self.dirty_boxes.push(sandbox_box.clone());
        Ok(sandbox_box)
    }

    #[instrument(skip(self), fields(job_id = %self.id))]
    pub async fn prime(&mut self) -> Result<(), JobError> {
        let metrics = self.metrics();
        self.recorder.start_timer("prime");
        self.recorder.enter_state(&metrics, "priming");

        let result = self.prime_inner().await;

        let status = if result.is_ok() { "success" } else { "error" };
        self.recorder.record_duration(&metrics, "prime", status);
        self.recorder.leave_state(&metrics, "priming");
        result
    }

    async fn prime_inner(&mut self) -> Result<(), JobError> {
        if self.state != JobState::Ready {
            return Err(JobError::State {
                expected: JobState::Ready,
                actual: self.state,
            });
        }

        let admission = Arc::clone(&self.ctx.admission);
        let admitted =
            admission.acquire_or_wait(self.id, &self.runtime.language, &self.runtime.version);
        if let Admission::Pending(ticket) = admitted {
            info!(job_id = %self.id, "Awaiting job slot");
            ticket.await.map_err(|_| JobError::SlotUnavailable)?;
        }
        if !admission.allocate(self.id) {
            return Err(JobError::SlotUnavailable);
        }

        info!(job_id = %self.id, "Priming job");
        let sandbox_box = self.create_box().await?;
        let submission = sandbox_box.submission_dir();
        self.sandbox_box = Some(sandbox_box);

        tokio::fs::create_dir(&submission).await?;

        // Resolve and decode everything first so a bad file writes nothing.
        let mut staged = Vec::with_capacity(self.files.len());
        for file in &self.files {
            let path = stage_path(&submission, &file.name)?;
            let content = file
                .encoding
                .decode(&file.content)
                .map_err(|source| JobError::Decode {
                    name: file.name.clone(),
                    encoding: file.encoding,
                    source,
                })?;
            staged.push((path, content));
        }

        for (path, content) in staged {
            if let Some(parent) = path.parent() {
                DirBuilder::new()
                    .recursive(true)
                    .mode(0o700)
                    .create(parent)
                    .await?;
            }
            tokio::fs::write(&path, content).await?;
        }

        self.state = JobState::Primed;
        debug!(job_id = %self.id, files = self.files.len(), "Primed job");
        Ok(())
    }

    #[instrument(skip(self, mode), fields(job_id = %self.id))]
    pub async fn execute(&mut self, mode: OutputMode<'_>) -> Result<JobOutcome, JobError> {
        let metrics = self.metrics();
        self.recorder.start_timer("total");
        self.recorder.start_timer("execute");
        self.recorder.enter_state(&metrics, "executing");
        self.recorder.count_execution(&metrics, "started");

        let result = self.execute_inner(mode).await;

        match &result {
            Ok(_) => {
                self.recorder.count_execution(&metrics, "success");
                self.recorder.record_duration(&metrics, "execute", "success");
                self.recorder.record_duration(&metrics, "total", "success");
                self.recorder.update_jobs_per_second(&metrics, "execution");
            }
            Err(e) => {
                warn!(job_id = %self.id, error = %e, "Execution failed");
                self.recorder.count_execution(&metrics, "failed");
                self.recorder.record_duration(&metrics, "execute", "error");
                self.recorder.record_duration(&metrics, "total", "error");
            }
        }
        self.recorder.leave_state(&metrics, "executing");
        result
    }

    async fn execute_inner(&mut self, mut mode: OutputMode<'_>) -> Result<JobOutcome, JobError> {
        if self.state != JobState::Primed {
            return Err(JobError::State {
                expected: JobState::Primed,
                actual: self.state,
            });
        }

        info!(job_id = %self.id, runtime = %self.runtime, "Executing job");

        let accepts_binary = self.runtime.accepts_binary_code();
        let code_files: Vec<String> = self
            .files
            .iter()
            .filter(|file| accepts_binary || file.encoding == Encoding::Utf8)
            .map(|file| file.name.clone())
            .collect();

        let mut compile = None;
        if self.runtime.compiled {
            debug!(job_id = %self.id, "Compiling");
            let result = self.stage(Stage::Compile, &code_files, &mut mode).await?;
            let succeeded = result.code == Some(0);
            compile = Some(result);

            if !succeeded {
                self.state = JobState::Executed;
                return Ok(self.outcome(compile, None));
            }
            self.rotate_box().await?;
        }

        debug!(job_id = %self.id, "Running");
        let run_args: Vec<String> = code_files
            .first()
            .cloned()
            .into_iter()
            .chain(self.args.iter().cloned())
            .collect();
        let run = self.stage(Stage::Run, &run_args, &mut mode).await?;

        self.state = JobState::Executed;
        Ok(self.outcome(compile, Some(run)))
    }

    fn outcome(&self, compile: Option<ExecutionResult>, run: Option<ExecutionResult>) -> JobOutcome {
        JobOutcome {
            compile,
            run,
            language: self.runtime.language.clone(),
            version: self.runtime.version.clone(),
        }
    }

    /// Run one stage, announcing it on the stream channel.
    async fn stage(
        &mut self,
        stage: Stage,
        args: &[String],
        mode: &mut OutputMode<'_>,
    ) -> Result<ExecutionResult, JobError> {
        mode.emit(StreamEvent::Stage { stage }).await;
        let result = self.safe_call(stage, args, mode.reborrow()).await?;

        let error = match result.status {
            Some(Status::InternalError) => result.message.clone(),
            _ => None,
        };
        mode.emit(StreamEvent::Exit {
            stage,
            error,
            code: result.code,
            signal: result.signal.clone(),
        })
        .await;
        Ok(result)
    }

    async fn safe_call(
        &mut self,
        stage: Stage,
        args: &[String],
        mode: OutputMode<'_>,
    ) -> Result<ExecutionResult, JobError> {
        let metrics = self.metrics();
        let timer = stage.as_str();
        self.recorder.start_timer(timer);

        let Some(sandbox_box) = self.sandbox_box.as_ref() else {
            return Err(JobError::State {
                expected: JobState::Primed,
                actual: self.state,
            });
        };
        let call = SafeCall {
            sandbox: self.ctx.sandbox.as_ref(),
            runtime: &self.runtime,
            sandbox_box,
            share_network: self.ctx.share_network,
            stdin: &self.stdin,
        };
        let result = call.run(stage, args, self.limits.for_stage(stage), mode).await;

        match &result {
            Ok(r) => {
                self.recorder
                    .record_resource_usage(&metrics, timer, r.memory, r.cpu_time, r.wall_time);
                let status = r.status.as_ref().map_or("completed", |s| s.code());
                self.recorder.record_duration(&metrics, timer, status);
            }
            Err(_) => self.recorder.record_duration(&metrics, timer, "error"),
        }
        result
    }

    /// Continue in a fresh box, carrying the (compiled) submission over.
    async fn rotate_box(&mut self) -> Result<(), JobError> {
        let Some(old) = self.sandbox_box.take() else {
            return Err(JobError::State {
                expected: JobState::Primed,
                actual: self.state,
            });
        };
        let new = match self.create_box().await {
            Ok(new) => new,
            Err(e) => {
                self.sandbox_box = Some(old);
                return Err(e);
            }
        };
        debug!(job_id = %self.id, from = old.id, to = new.id, "Moving submission to a fresh box");
        if let Err(e) = tokio::fs::rename(old.submission_dir(), new.submission_dir()).await {
            // The new box stays in the dirty list and is torn down at cleanup.
            self.sandbox_box = Some(old);
            return Err(e.into());
        }
        self.sandbox_box = Some(new);
        Ok(())
    }

    /// Release the slot and tear down every box. Never fails; problems are
    /// logged and returned in the report.
    #[instrument(skip(self), fields(job_id = %self.id))]
    pub async fn cleanup(&mut self) -> CleanupReport {
        let metrics = self.metrics();
        self.recorder.start_timer("cleanup");
        self.recorder.enter_state(&metrics, "cleaning");
        info!(job_id = %self.id, "Cleaning up job");

        let admission = &self.ctx.admission;
        admission.release(self.id);
        admission.cancel_queued(self.id);

        self.sandbox_box = None;
        let boxes = std::mem::take(&mut self.dirty_boxes);
        let sandbox = self.ctx.sandbox.as_ref();
        let failures = join_all(boxes.iter().map(|b| teardown(sandbox, admission, b)))
            .await
            .into_iter()
            .flatten()
            .collect();

        self.recorder.record_duration(&metrics, "cleanup", "completed");
        self.recorder.update_jobs_per_second(&metrics, "cleanup");
        self.recorder.leave_state(&metrics, "cleaning");

        CleanupReport {
            boxes: boxes.iter().map(|b| b.id).collect(),
            failures,
        }
    }

    /// Prime, execute and always clean up.
    pub async fn run(&mut self, mode: OutputMode<'_>) -> Result<JobOutcome, JobError> {
        let outcome = match self.prime().await {
            Ok(()) => self.execute(mode).await,
            Err(e) => Err(e),
        };
        let report = self.cleanup().await;
        if !report.is_clean() {
            warn!(
                job_id = %self.id,
                failures = report.failures.len(),
                "Cleanup could not tear down every box"
            );
        }
        outcome
    }
}

async fn teardown(
    sandbox: &dyn Sandbox,
    admission: &AdmissionController,
    sandbox_box: &SandboxBox,
) -> Vec<TeardownFailure> {
    let mut failures = Vec::new();

    if let Err(e) = sandbox.cleanup(sandbox_box.id).await {
        error!(box_id = sandbox_box.id, error = %e, "Failed to clean up sandbox box");
        failures.push(TeardownFailure {
            box_id: sandbox_box.id,
            reason: e.to_string(),
        });
    }

    match tokio::fs::remove_file(&sandbox_box.metadata_path).await {
        Ok(()) => {}
        // Boxes that never ran a stage have no metadata file.
        Err(e) if e.kind() == ErrorKind::NotFound => {}
        Err(e) => {
            error!(
                box_id = sandbox_box.id,
                error = %e,
                "Failed to remove the metadata file"
            );
            failures.push(TeardownFailure {
                box_id: sandbox_box.id,
                reason: e.to_string(),
            });
        }
    }

    admission.release_box_id(sandbox_box.id);
    failures
}

/// Where `name` lands inside `root`. Paths are resolved lexically and must
/// stay strictly below `root`; a leading `/` is read relative to `root`.
pub fn stage_path(root: &Path, name: &str) -> Result<PathBuf, JobError> {
    let mut parts: Vec<&std::ffi::OsStr> = Vec::new();
    for component in Path::new(name).components() {
        match component {
            Component::Normal(part) => parts.push(part),
            Component::ParentDir => {
                if parts.pop().is_none() {
                    return Err(JobError::PathTraversal {
                        name: name.to_string(),
                    });
                }
            }
            Component::CurDir | Component::RootDir | Component::Prefix(_) => {}
        }
    }

    if parts.is_empty() {
        return Err(JobError::InvalidPath {
            name: name.to_string(),
        });
    }
    Ok(parts.iter().fold(root.to_path_buf(), |path, part| path.join(part)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stage_path_accepts_nested_names() {
        let root = Path::new("/box/submission");
        assert_eq!(
            stage_path(root, "src/main.rs").unwrap(),
            PathBuf::from("/box/submission/src/main.rs")
        );
        assert_eq!(
            stage_path(root, "./a/../b.txt").unwrap(),
            PathBuf::from("/box/submission/b.txt")
        );
        assert_eq!(
            stage_path(root, "/etc/passwd").unwrap(),
            PathBuf::from("/box/submission/etc/passwd")
        );
    }

    #[test]
    fn test_stage_path_rejects_escapes() {
        let root = Path::new("/box/submission");
        for name in ["../../etc/passwd", "..", "a/../../b", "a/b/../../../c"] {
            let err = stage_path(root, name).unwrap_err();
            assert!(
                matches!(err, JobError::PathTraversal { .. }),
                "{} should be rejected",
                name
            );
            assert!(err.is_validation());
        }
    }

    #[test]
    fn test_stage_path_rejects_empty_names() {
        let root = Path::new("/box/submission");
        for name in ["", ".", "a/.."] {
            assert!(matches!(
                stage_path(root, name),
                Err(JobError::InvalidPath { .. })
            ));
        }
    }

    #[test]
    fn test_state_display() {
        assert_eq!(JobState::Primed.to_string(), "primed");
    }
}
