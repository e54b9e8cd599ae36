// Prometheus metrics for job execution and admission
//
// One `Metrics` instance is created at startup and shared by the admission
// controller and every job. Each job records through a `JobRecorder`, which
// carries the job's language/version labels and its running stage timers.

use prometheus::{
    Encoder, GaugeVec, HistogramOpts, HistogramVec, IntCounterVec, IntGauge, IntGaugeVec, Opts,
    Registry, TextEncoder,
};
use std::collections::HashMap;
use std::time::{Duration, Instant};

const DURATION_BUCKETS: &[f64] = &[0.1, 0.5, 1.0, 2.0, 5.0, 10.0, 30.0, 60.0];

pub struct Metrics {
    registry: Registry,
    pub job_duration: HistogramVec,
    pub job_memory: GaugeVec,
    pub compiler_memory: GaugeVec,
    pub job_cpu_time: GaugeVec,
    pub job_wall_time: GaugeVec,
    pub active_jobs: IntGaugeVec,
    pub queue_length: IntGauge,
    pub queue_wait: HistogramVec,
    pub executions: IntCounterVec,
    pub jobs_per_second: GaugeVec,
    pub boxes_in_use: IntGauge,
}

impl Metrics {
    pub fn new() -> prometheus::Result<Self> {
        let registry = Registry::new_custom(Some("sandrun".to_string()), None)?;

        let job_duration = HistogramVec::new(
            HistogramOpts::new("execution_duration_seconds", "Duration of job stages in seconds")
                .buckets(DURATION_BUCKETS.to_vec()),
            &["language", "version", "stage", "status"],
        )?;
        let job_memory = GaugeVec::new(
            Opts::new("job_memory_bytes", "Peak memory of job stages in bytes"),
            &["language", "version", "stage"],
        )?;
        let compiler_memory = GaugeVec::new(
            Opts::new("compiler_memory_bytes", "Peak memory of compile stages in bytes"),
            &["language", "version"],
        )?;
        let job_cpu_time = GaugeVec::new(
            Opts::new("cpu_time_seconds", "CPU time used by job stages in seconds"),
            &["language", "version", "stage"],
        )?;
        let job_wall_time = GaugeVec::new(
            Opts::new("wall_time_seconds", "Wall clock time of job stages in seconds"),
            &["language", "version", "stage"],
        )?;
        let active_jobs = IntGaugeVec::new(
            Opts::new("active_jobs", "Number of jobs per lifecycle state"),
            &["language", "version", "state"],
        )?;
        let queue_length = IntGauge::new("queue_length", "Number of jobs waiting for a slot")?;
        let queue_wait = HistogramVec::new(
            HistogramOpts::new("queue_wait_time_seconds", "Time jobs spend waiting for a slot")
                .buckets(DURATION_BUCKETS.to_vec()),
            &["language", "version"],
        )?;
        let executions = IntCounterVec::new(
            Opts::new("executions_total", "Total number of job executions"),
            &["language", "version", "status"],
        )?;
        let jobs_per_second = GaugeVec::new(
            Opts::new("jobs_per_second", "Current job processing rate"),
            &["operation"],
        )?;
        let boxes_in_use = IntGauge::new("boxes_in_use", "Number of sandbox boxes currently in use")?;

        registry.register(Box::new(job_duration.clone()))?;
        registry.register(Box::new(job_memory.clone()))?;
        registry.register(Box::new(compiler_memory.clone()))?;
        registry.register(Box::new(job_cpu_time.clone()))?;
        registry.register(Box::new(job_wall_time.clone()))?;
        registry.register(Box::new(active_jobs.clone()))?;
        registry.register(Box::new(queue_length.clone()))?;
        registry.register(Box::new(queue_wait.clone()))?;
        registry.register(Box::new(executions.clone()))?;
        registry.register(Box::new(jobs_per_second.clone()))?;
        registry.register(Box::new(boxes_in_use.clone()))?;

        Ok(Self {
            registry,
            job_duration,
            job_memory,
            compiler_memory,
            job_cpu_time,
            job_wall_time,
            active_jobs,
            queue_length,
            queue_wait,
            executions,
            jobs_per_second,
            boxes_in_use,
        })
    }

    /// Controller-level slot gauges (empty language/version labels)
    pub fn set_slots(&self, queued: usize, active: usize, available: usize) {
        self.queue_length.set(queued as i64);
        for (state, value) in [("queued", queued), ("active", active), ("available", available)] {
            self.active_jobs
                .with_label_values(&["", "", state])
                .set(value as i64);
        }
    }

    pub fn observe_queue_wait(&self, language: &str, version: &str, waited: Duration) {
        self.queue_wait
            .with_label_values(&[language, version])
            .observe(waited.as_secs_f64());
    }

    /// Text exposition format
    pub fn encode(&self) -> String {
        let mut buffer = Vec::new();
        if let Err(e) = TextEncoder::new().encode(&self.registry.gather(), &mut buffer) {
            tracing::warn!(error = %e, "Failed to encode metrics");
        }
        String::from_utf8_lossy(&buffer).into_owned()
    }
}

/// Per-job view on [`Metrics`]
pub struct JobRecorder {
    language: String,
    version: String,
    timers: HashMap<&'static str, Instant>,
    job_start: Instant,
}

impl JobRecorder {
    pub fn new(language: &str, version: &str) -> Self {
        Self {
            language: language.to_string(),
            version: version.to_string(),
            timers: HashMap::new(),
            job_start: Instant::now(),
        }
    }

    pub fn start_timer(&mut self, stage: &'static str) {
        self.timers.insert(stage, Instant::now());
    }

    /// Observe and clear the timer for `stage`; no-op if it was never started.
    pub fn record_duration(&mut self, metrics: &Metrics, stage: &'static str, status: &str) {
        if let Some(start) = self.timers.remove(stage) {
            metrics
                .job_duration
                .with_label_values(&[&self.language, &self.version, stage, status])
                .observe(start.elapsed().as_secs_f64());
        }
    }

    pub fn record_resource_usage(
        &self,
        metrics: &Metrics,
        stage: &'static str,
        memory: Option<u64>,
        cpu_time_ms: Option<u64>,
        wall_time_ms: Option<u64>,
    ) {
        let labels = [self.language.as_str(), self.version.as_str(), stage];
        if let Some(memory) = memory {
            metrics.job_memory.with_label_values(&labels).set(memory as f64);
            if stage == "compile" {
                metrics
                    .compiler_memory
                    .with_label_values(&[&self.language, &self.version])
                    .set(memory as f64);
            }
        }
        if let Some(cpu) = cpu_time_ms {
            metrics.job_cpu_time.with_label_values(&labels).set(cpu as f64 / 1000.0);
        }
        if let Some(wall) = wall_time_ms {
            metrics.job_wall_time.with_label_values(&labels).set(wall as f64 / 1000.0);
        }
    }

    pub fn enter_state(&self, metrics: &Metrics, state: &str) {
        metrics
            .active_jobs
            .with_label_values(&[&self.language, &self.version, state])
            .inc();
    }

    pub fn leave_state(&self, metrics: &Metrics, state: &str) {
        metrics
            .active_jobs
            .with_label_values(&[&self.language, &self.version, state])
            .dec();
    }

    pub fn count_execution(&self, metrics: &Metrics, status: &str) {
        metrics
            .executions
            .with_label_values(&[&self.language, &self.version, status])
            .inc();
    }

    pub fn update_jobs_per_second(&self, metrics: &Metrics, operation: &str) {
        let elapsed = self.job_start.elapsed().as_secs_f64();
        if elapsed > 0.0 {
            metrics
                .jobs_per_second
                .with_label_values(&[operation])
                .set(1.0 / elapsed);
        }
    }
}
