use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::types::{ExecutionMetrics, PhaseTimings};

/// Timeout for telemetry HTTP requests (shorter than the result path
/// would ever tolerate).
const SINK_TIMEOUT: Duration = Duration::from_secs(5);

/// One telemetry record per request, emitted exactly once — success,
/// failure, or rejection.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TelemetryRecord {
    pub request_id: Uuid,
    pub tenant_id: String,
    pub runtime: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub node_id: Option<String>,
    /// Terminal label: `completed`, `timedOut`, `killed`, `crashed`, or
    /// a `rejected:`/`failed:` reason.
    pub outcome: String,
    pub metrics: ExecutionMetrics,
}

/// Outbound interface to the external telemetry pipeline.
#[async_trait]
pub trait TelemetrySink: Send + Sync {
    async fn push(&self, record: &TelemetryRecord);
}

/// Fire-and-forget forwarder with bounded local buffering. The result
/// path never blocks on the sink: a full buffer drops the record with a
/// warning.
pub struct TelemetryCollector {
    tx: mpsc::Sender<TelemetryRecord>,
}

impl TelemetryCollector {
    pub fn new(sink: Arc<dyn TelemetrySink>, buffer: usize) -> (Self, JoinHandle<()>) {
        let (tx, mut rx) = mpsc::channel::<TelemetryRecord>(buffer.max(1));
        let drain = tokio::spawn(async move {
            while let Some(record) = rx.recv().await {
                sink.push(&record).await;
            }
        });
        (Self { tx }, drain)
    }

    pub fn emit(&self, record: TelemetryRecord) {
        if self.tx.try_send(record).is_err() {
            warn!("telemetry buffer full, dropping record");
        }
    }
}

/// Wall-clock phase boundaries for one request:
/// queued → acquired → set up → run → cleaned up.
pub struct PhaseClock {
    submitted: Instant,
    acquire_started: Option<Instant>,
    acquired: Option<Instant>,
    setup_done: Option<Instant>,
    run_done: Option<Instant>,
    cleanup_done: Option<Instant>,
}

impl PhaseClock {
    pub fn new() -> Self {
        Self {
            submitted: Instant::now(),
            acquire_started: None,
            acquired: None,
            setup_done: None,
            run_done: None,
            cleanup_done: None,
        }
    }

    pub fn begin_acquire(&mut self) {
        self.acquire_started.get_or_insert_with(Instant::now);
    }

    pub fn end_acquire(&mut self) {
        self.acquired = Some(Instant::now());
    }

    pub fn end_setup(&mut self) {
        self.setup_done = Some(Instant::now());
    }

    pub fn end_run(&mut self) {
        self.run_done = Some(Instant::now());
    }

    pub fn end_cleanup(&mut self) {
        self.cleanup_done = Some(Instant::now());
    }

    pub fn phases(&self) -> PhaseTimings {
        let queue_end = self.acquire_started.unwrap_or(self.submitted);
        PhaseTimings {
            queue_ms: span_ms(Some(self.submitted), Some(queue_end)),
            acquire_ms: span_ms(self.acquire_started, self.acquired),
            setup_ms: span_ms(self.acquired, self.setup_done),
            run_ms: span_ms(self.setup_done, self.run_done),
            cleanup_ms: span_ms(self.run_done, self.cleanup_done),
        }
    }
}

impl Default for PhaseClock {
    fn default() -> Self {
        Self::new()
    }
}

fn span_ms(from: Option<Instant>, to: Option<Instant>) -> u64 {
    match (from, to) {
        (Some(from), Some(to)) => to.saturating_duration_since(from).as_millis() as u64,
        _ => 0,
    }
}

pub fn timestamp() -> String {
    chrono::Utc::now().to_rfc3339_opts(chrono::SecondsFormat::Millis, true)
}

/// Pushes records to the telemetry pipeline over HTTP. Errors are logged
/// and swallowed; the pipeline is best-effort.
pub struct HttpSink {
    client: reqwest::Client,
    endpoint: String,
    token: String,
}

impl HttpSink {
    pub fn new(endpoint: String, token: String) -> crate::EngineResult<Self> {
        let client = reqwest::Client::builder()
            .timeout(SINK_TIMEOUT)
            .build()
            .map_err(|e| crate::EngineError::Internal(format!("telemetry client: {e}")))?;
        Ok(Self {
            client,
            endpoint,
            token,
        })
    }
}

#[async_trait]
impl TelemetrySink for HttpSink {
    async fn push(&self, record: &TelemetryRecord) {
        let result = self
            .client
            .post(&self.endpoint)
            .bearer_auth(&self.token)
            .json(record)
            .send()
            .await;
        match result {
            Ok(resp) if !resp.status().is_success() => {
                warn!(request_id = %record.request_id, status = %resp.status(), "telemetry push rejected");
            }
            Err(e) => {
                warn!(request_id = %record.request_id, error = %e, "telemetry push failed");
            }
            _ => {}
        }
    }
}

/// Logs records instead of exporting them. Development and tests.
pub struct LogSink;

#[async_trait]
impl TelemetrySink for LogSink {
    async fn push(&self, record: &TelemetryRecord) {
        debug!(
            request_id = %record.request_id,
            outcome = %record.outcome,
            queue_ms = record.metrics.phases.queue_ms,
            run_ms = record.metrics.phases.run_ms,
            cold_start = record.metrics.cold_start,
            "execution telemetry"
        );
    }
}
