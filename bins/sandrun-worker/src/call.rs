/// Sandboxed Call - one stage inside one provisioned box
///
/// **Flow:**
/// 1. Build the stage invocation (env, limits, network switch) and spawn it
/// 2. Feed stdin: all at once (buffered) or relayed from the stream channel
/// 3. Drain stdout/stderr concurrently; in buffered mode enforce the
///    runtime's output cap, in streaming mode relay chunks live
/// 4. After exit, parse the box's accounting file into an [`ExecutionResult`]
///
/// **Output cap:**
/// The first chunk that would push a stream past `output_max_size` aborts
/// the process with `SIGABRT` and pins the status to `OL` (stdout) or `EL`
/// (stderr). Status and message set here take precedence over whatever the
/// sandbox reports afterwards.
use crate::accounting::Accounting;
use crate::error::{AccountingReadError, JobError};
use crate::sandbox::{Invocation, ProcessLimits, Sandbox, SandboxBox};
use crate::stream::OutputMode;
use nix::sys::signal::{self, Signal};
use nix::unistd::Pid;
use sandrun_common::runtime::{Runtime, StageLimits};
use sandrun_common::types::{ExecutionResult, Stage, Status, StreamEvent, StreamInput};
use std::process::Stdio;
use std::str::FromStr;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};
use tokio::process::ChildStdin;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

/// Signal reported for every stage the sandbox (or the output cap) killed
pub const KILLED_SIGNAL: Signal = Signal::SIGKILL;

const READ_CHUNK: usize = 8192;

pub struct SafeCall<'a> {
    pub sandbox: &'a dyn Sandbox,
    pub runtime: &'a Runtime,
    pub sandbox_box: &'a SandboxBox,
    pub share_network: bool,
    /// Used in buffered mode only
    pub stdin: &'a str,
}

#[derive(Debug, Clone, Copy)]
enum OutStream {
    Stdout,
    Stderr,
}

#[derive(Default)]
struct Capture {
    stdout: Vec<u8>,
    stderr: Vec<u8>,
    output: Vec<u8>,
    status: Option<Status>,
    message: Option<String>,
    aborted: bool,
}

impl Capture {
    /// Returns `true` when the cap has tripped. Once it has, every later
    /// chunk is dropped so the capture stays a prefix of the output.
    fn push(&mut self, stream: OutStream, chunk: &[u8], max: usize) -> bool {
        if self.status.is_some() {
            return true;
        }

        let (buffer, status, message) = match stream {
            OutStream::Stdout => (&mut self.stdout, Status::StdoutLimit, "stdout length exceeded"),
            OutStream::Stderr => (&mut self.stderr, Status::StderrLimit, "stderr length exceeded"),
        };

        if buffer.len() + chunk.len() > max {
            self.status = Some(status);
            self.message = Some(message.to_string());
            return true;
        }

        buffer.extend_from_slice(chunk);
        self.output.extend_from_slice(chunk);
        false
    }
}

impl SafeCall<'_> {
    fn environment(&self) -> Vec<String> {
        let mut env = Vec::with_capacity(self.runtime.env_vars.len() + 2);
        env.push("HOME=/tmp".to_string());
        env.extend(self.runtime.env_vars.iter().cloned());
        env.push(format!("SANDRUN_LANGUAGE={}", self.runtime.language));
        env
    }

    pub async fn run(
        &self,
        stage: Stage,
        args: &[String],
        limits: StageLimits,
        mut mode: OutputMode<'_>,
    ) -> Result<ExecutionResult, JobError> {
        let invocation = Invocation {
            box_id: self.sandbox_box.id,
            metadata_path: &self.sandbox_box.metadata_path,
            env: self.environment(),
            package_dir: &self.runtime.pkgdir,
            limits: ProcessLimits {
                max_process_count: self.runtime.max_process_count,
                max_open_files: self.runtime.max_open_files,
                max_file_size: self.runtime.max_file_size,
                wall_time_ms: limits.timeout_ms,
                cpu_time_ms: limits.cpu_time_ms,
                memory_limit: limits.memory_limit,
            },
            share_network: self.share_network,
            script: self.runtime.pkgdir.join(stage.as_str()),
            args,
        };

        let mut cmd = self.sandbox.command(&invocation);
        cmd.stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        debug!(box_id = self.sandbox_box.id, %stage, "Spawning sandboxed process");
        let mut child = cmd.spawn().map_err(JobError::Spawn)?;
        let pid = child.id().and_then(|id| i32::try_from(id).ok()).map(Pid::from_raw);

        let mut stdout = child.stdout.take();
        let mut stderr = child.stderr.take();
        let stdin = child.stdin.take();

        let mut accepting_input = match &mode {
            OutputMode::Streaming(channel) => !channel.is_inbound_closed(),
            OutputMode::Buffered => false,
        };
        let mut stdin_relay = match &mode {
            OutputMode::Streaming(_) if accepting_input => {
                let (tx, rx) = mpsc::unbounded_channel();
                tokio::spawn(relay_stdin(stdin, rx));
                Some(tx)
            }
            // The caller already hung up, so the child sees EOF right away.
            OutputMode::Streaming(_) => {
                drop(stdin);
                None
            }
            OutputMode::Buffered => {
                tokio::spawn(write_stdin(stdin, self.stdin.as_bytes().to_vec()));
                None
            }
        };

        let max = self.runtime.output_max_size;
        let mut capture = Capture::default();
        let mut out_buf = vec![0u8; READ_CHUNK];
        let mut err_buf = vec![0u8; READ_CHUNK];
        let mut stdout_open = stdout.is_some();
        let mut stderr_open = stderr.is_some();

        while stdout_open || stderr_open {
            tokio::select! {
                read = read_chunk(&mut stdout, &mut out_buf), if stdout_open => match read {
                    Ok(0) | Err(_) => stdout_open = false,
                    Ok(n) => self.handle_chunk(OutStream::Stdout, &out_buf[..n], &mode, &mut capture, max, pid).await,
                },
                read = read_chunk(&mut stderr, &mut err_buf), if stderr_open => match read {
                    Ok(0) | Err(_) => stderr_open = false,
                    Ok(n) => self.handle_chunk(OutStream::Stderr, &err_buf[..n], &mode, &mut capture, max, pid).await,
                },
                input = next_input(&mut mode), if accepting_input => match input {
                    Some(StreamInput::Stdin(data)) => {
                        if let Some(relay) = &stdin_relay {
                            let _ = relay.send(data);
                        }
                    }
                    Some(StreamInput::Kill(name)) => match parse_signal(&name) {
                        Some(sig) => send_signal(pid, sig),
                        None => warn!(signal = %name, "Ignoring kill request with unknown signal"),
                    },
                    None => {
                        accepting_input = false;
                        stdin_relay = None;
                    }
                },
                else => break,
            }
        }
        drop(stdin_relay);

        let exit = child.wait().await.map_err(JobError::Spawn)?;
        debug!(box_id = self.sandbox_box.id, %stage, ?exit, "Sandboxed process exited");

        let accounting = match read_accounting(&self.sandbox_box.metadata_path).await {
            Ok(accounting) => accounting,
            Err(reason) => {
                return Err(JobError::Accounting {
                    path: self.sandbox_box.metadata_path.clone(),
                    reason,
                    stdout: String::from_utf8_lossy(&capture.stdout).into_owned(),
                    stderr: String::from_utf8_lossy(&capture.stderr).into_owned(),
                })
            }
        };

        Ok(finish(capture, accounting))
    }

    async fn handle_chunk(
        &self,
        stream: OutStream,
        chunk: &[u8],
        mode: &OutputMode<'_>,
        capture: &mut Capture,
        max: usize,
        pid: Option<Pid>,
    ) {
        if let OutputMode::Streaming(_) = mode {
            let data = chunk.to_vec();
            let event = match stream {
                OutStream::Stdout => StreamEvent::Stdout { data },
                OutStream::Stderr => StreamEvent::Stderr { data },
            };
            mode.emit(event).await;
            return;
        }

        if capture.push(stream, chunk, max) && !capture.aborted {
            capture.aborted = true;
            info!(
                box_id = self.sandbox_box.id,
                limit = max,
                "{:?} length exceeded, aborting process",
                stream
            );
            send_signal(pid, Signal::SIGABRT);
        }
    }
}

fn finish(capture: Capture, accounting: Accounting) -> ExecutionResult {
    let status = capture.status.or(accounting.status);
    let message = capture.message.or(accounting.message);
    let signal = if status.as_ref().is_some_and(Status::is_forced_kill) {
        Some(KILLED_SIGNAL)
    } else {
        accounting.signal
    };

    ExecutionResult {
        stdout: String::from_utf8_lossy(&capture.stdout).into_owned(),
        stderr: String::from_utf8_lossy(&capture.stderr).into_owned(),
        output: String::from_utf8_lossy(&capture.output).into_owned(),
        code: accounting.exit_code,
        signal: signal.map(|s| s.as_str().to_string()),
        memory: accounting.memory,
        cpu_time: accounting.cpu_time_ms,
        wall_time: accounting.wall_time_ms,
        status,
        message,
    }
}

async fn read_accounting(path: &std::path::Path) -> Result<Accounting, AccountingReadError> {
    let text = tokio::fs::read_to_string(path).await?;
    Ok(Accounting::parse(&text)?)
}

async fn read_chunk<R: AsyncRead + Unpin>(
    pipe: &mut Option<R>,
    buf: &mut [u8],
) -> std::io::Result<usize> {
    match pipe {
        Some(pipe) => pipe.read(buf).await,
        None => Ok(0),
    }
}

async fn next_input(mode: &mut OutputMode<'_>) -> Option<StreamInput> {
    match mode {
        OutputMode::Streaming(channel) => channel.recv().await,
        OutputMode::Buffered => std::future::pending().await,
    }
}

async fn write_stdin(stdin: Option<ChildStdin>, data: Vec<u8>) {
    if let Some(mut stdin) = stdin {
        // The child may exit without reading everything.
        if let Err(e) = stdin.write_all(&data).await {
            debug!(error = %e, "Stdin write ended early");
        }
    }
}

async fn relay_stdin(stdin: Option<ChildStdin>, mut rx: mpsc::UnboundedReceiver<Vec<u8>>) {
    let Some(mut stdin) = stdin else {
        return;
    };
    while let Some(data) = rx.recv().await {
        if let Err(e) = stdin.write_all(&data).await {
            debug!(error = %e, "Stdin relay ended early");
            return;
        }
        let _ = stdin.flush().await;
    }
}

/// Accepts `SIGTERM` as well as `TERM`.
fn parse_signal(name: &str) -> Option<Signal> {
    Signal::from_str(name)
        .or_else(|_| Signal::from_str(&format!("SIG{}", name)))
        .ok()
}

fn send_signal(pid: Option<Pid>, sig: Signal) {
    let Some(pid) = pid else {
        return;
    };
    if let Err(e) = signal::kill(pid, sig) {
        debug!(%pid, signal = sig.as_str(), error = %e, "Failed to signal sandboxed process");
    }
}
