mod accounting;
mod admission;
mod call;
mod config;
mod error;
mod job;
mod metrics;
mod sandbox;
mod stream;

#[cfg(test)]
mod testing;

use admission::AdmissionController;
use config::{RuntimeRegistry, WorkerConfig};
use job::{Job, JobContext, JobSpec};
use metrics::Metrics;
use sandbox::Isolate;
use sandrun_common::types::{JobRequest, JobResponse};
use std::sync::Arc;
use stream::OutputMode;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::signal;
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tracing::{debug, error, info, instrument, warn};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    init_tracing();

    info!("Sandrun worker booting...");

    let config = WorkerConfig::from_env()?;
    let registry = RuntimeRegistry::load(&config.runtimes_path).map_err(|e| {
        error!("Failed to load runtime configurations: {:#}", e);
        error!("Make sure {} exists", config.runtimes_path.display());
        e
    })?;
    info!("Loaded runtimes: {:?}", registry.list_runtimes());

    let metrics = Arc::new(Metrics::new()?);
    let ctx = Arc::new(JobContext {
        admission: Arc::new(AdmissionController::new(
            config.max_concurrent_jobs,
            Arc::clone(&metrics),
        )),
        sandbox: Arc::new(Isolate::new(&config.isolate_path, &config.metadata_dir)),
        metrics: Arc::clone(&metrics),
        share_network: !config.disable_networking,
    });

    info!(
        max_concurrent_jobs = config.max_concurrent_jobs,
        isolate = %config.isolate_path.display(),
        networking = !config.disable_networking,
        "Worker configured"
    );

    let (responses, writer_rx) = mpsc::unbounded_channel();
    let writer = tokio::spawn(write_responses(writer_rx));

    let mut jobs = JoinSet::new();
    let shutdown = async {
        if let Err(e) = signal::ctrl_c().await {
            error!(error = %e, "Failed to listen for the shutdown signal");
            std::future::pending::<()>().await;
        }
        warn!("Received shutdown signal, draining in-flight jobs...");
    };

    tokio::select! {
        res = intake_loop(&ctx, &registry, &mut jobs, &responses) => {
            if let Err(e) = res {
                error!(error = %e, "Failed to read job requests");
            }
        },
        _ = shutdown => {},
    }

    while let Some(joined) = jobs.join_next().await {
        if let Err(e) = joined {
            error!(error = %e, "Job task panicked");
        }
    }
    drop(responses);
    if let Err(e) = writer.await {
        error!(error = %e, "Response writer panicked");
    }

    debug!("Final metrics:\n{}", metrics.encode());
    info!("Worker shutdown complete");
    Ok(())
}

fn init_tracing() {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .with_thread_ids(true)
        .with_line_number(true);

    // stdout carries responses, so logs always go to stderr
    if std::env::var("SANDRUN_LOG_FORMAT").is_ok_and(|f| f.eq_ignore_ascii_case("json")) {
        builder.json().init();
    } else {
        builder.init();
    }
}

/// Read one JSON request per line until stdin closes.
async fn intake_loop(
    ctx: &Arc<JobContext>,
    registry: &RuntimeRegistry,
    jobs: &mut JoinSet<()>,
    responses: &mpsc::UnboundedSender<JobResponse>,
) -> anyhow::Result<()> {
    let mut lines = BufReader::new(tokio::io::stdin()).lines();

    while let Some(line) = lines.next_line().await? {
        if line.trim().is_empty() {
            continue;
        }

        let request: JobRequest = match serde_json::from_str(&line) {
            Ok(request) => request,
            Err(e) => {
                warn!(error = %e, "Rejecting malformed job request");
                let _ = responses.send(rejected(format!("Invalid job request: {}", e)));
                continue;
            }
        };

        let Some(runtime) = registry.get(&request.language, &request.version) else {
            warn!(language = %request.language, version = %request.version, "Unknown runtime");
            let _ = responses.send(rejected(format!(
                "{}-{} runtime is unknown",
                request.language, request.version
            )));
            continue;
        };
        let runtime = Arc::new(runtime.clone());

        let spec = match JobSpec::from_request(request, &runtime) {
            Ok(spec) => spec,
            Err(e) => {
                let _ = responses.send(rejected(e.to_string()));
                continue;
            }
        };

        let job = Job::new(Arc::clone(ctx), runtime, spec);
        info!(
            job_id = %job.id,
            runtime = %job.runtime(),
            files = job.files().len(),
            "Received job"
        );
        jobs.spawn(run_job(job, responses.clone()));

        // Reap finished tasks so the set does not grow without bound.
        while let Some(joined) = jobs.try_join_next() {
            if let Err(e) = joined {
                error!(error = %e, "Job task panicked");
            }
        }
    }

    info!("Request stream closed");
    Ok(())
}

#[instrument(skip(job, responses), fields(job_id = %job.id))]
async fn run_job(mut job: Job, responses: mpsc::UnboundedSender<JobResponse>) {
    let response = match job.run(OutputMode::Buffered).await {
        Ok(outcome) => {
            info!(
                job_id = %job.id,
                run_code = ?outcome.run.as_ref().and_then(|r| r.code),
                compiled = outcome.compile.is_some(),
                "Job completed"
            );
            JobResponse {
                job_id: Some(job.id),
                result: Some(outcome),
                error: None,
            }
        }
        Err(e) => {
            if e.is_validation() {
                warn!(job_id = %job.id, error = %e, "Job rejected");
            } else {
                error!(job_id = %job.id, error = %e, "Job failed");
            }
            JobResponse {
                job_id: Some(job.id),
                result: None,
                error: Some(e.to_string()),
            }
        }
    };

    // Non-fatal - the writer only goes away during shutdown
    let _ = responses.send(response);
}

fn rejected(message: String) -> JobResponse {
    JobResponse {
        job_id: None,
        result: None,
        error: Some(message),
    }
}

async fn write_responses(mut rx: mpsc::UnboundedReceiver<JobResponse>) {
    let mut stdout = tokio::io::stdout();
    while let Some(response) = rx.recv().await {
        let mut line = match serde_json::to_vec(&response) {
            Ok(line) => line,
            Err(e) => {
                error!(error = %e, "Failed to serialize response");
                continue;
            }
        };
        line.push(b'\n');
        if let Err(e) = stdout.write_all(&line).await {
            error!(error = %e, "Failed to write response");
            return;
        }
        let _ = stdout.flush().await;
    }
}
