//! Bounded sink dispatch pool
//!
//! Every sink owns a bounded queue drained by its own workers, so a slow
//! or stalled sink only backs up its own lane. Enqueueing never waits: a
//! full queue dead-letters the batch for that sink. Each send runs under
//! a timeout and failures are dead-lettered, never retried.

use fleet_core::{LogBatch, SettingsProvider, SERVICE_LOGGING};
use metrics::counter;
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::fs::{File, OpenOptions};
use tokio::io::AsyncWriteExt;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, error, warn};

use crate::error::{SinkError, SinkResult};
use crate::sink::Sink;

/// Dispatch pool configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DispatchConfig {
    /// Workers per sink
    pub workers: usize,
    /// Queued batches per sink
    pub queue_capacity: usize,
    pub send_timeout_ms: u64,
    /// JSON-lines file receiving dead-lettered batches
    pub dead_letter_path: Option<PathBuf>,
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            workers: 4,
            queue_capacity: 1024,
            send_timeout_ms: 10_000,
            dead_letter_path: None,
        }
    }
}

/// One sink with its queue
struct Lane {
    sink: Arc<dyn Sink>,
    tx: mpsc::Sender<Arc<LogBatch>>,
}

/// Record of batches a sink never received
pub struct DeadLetter {
    file: Option<Mutex<File>>,
}

impl DeadLetter {
    pub async fn open(path: Option<&Path>) -> SinkResult<Self> {
        let file = match path {
            Some(path) => {
                if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
                    tokio::fs::create_dir_all(parent).await?;
                }
                let file = OpenOptions::new().create(true).append(true).open(path).await?;
                Some(Mutex::new(file))
            }
            None => None,
        };
        Ok(Self { file })
    }

    pub async fn record(&self, sink: &str, batch: &LogBatch, reason: &str) {
        warn!(
            target: "dead_letter",
            sink,
            reason,
            environment = %batch.environment_name,
            uuid = %batch.uuid,
            log_type = batch.log_type.as_str(),
            "Sink batch dead-lettered"
        );
        counter!("fleet_dead_letter_total", "sink" => sink.to_string()).increment(1);

        let Some(file) = &self.file else {
            return;
        };
        let entry = json!({ "sink": sink, "reason": reason, "batch": batch });
        let mut line = match serde_json::to_vec(&entry) {
            Ok(line) => line,
            Err(e) => {
                error!(error = %e, "Failed to serialize dead letter");
                return;
            }
        };
        line.push(b'\n');
        let mut file = file.lock().await;
        if let Err(e) = file.write_all(&line).await {
            error!(error = %e, "Failed to write dead letter");
        }
    }
}

/// Worker pool fanning batches out to sinks
pub struct SinkPool {
    lanes: Vec<Lane>,
    settings: Arc<dyn SettingsProvider>,
    dead_letter: Arc<DeadLetter>,
    workers: Vec<JoinHandle<()>>,
}

impl SinkPool {
    /// Start the workers. Must be called within a tokio runtime.
    pub async fn start(
        config: &DispatchConfig,
        sinks: Vec<Arc<dyn Sink>>,
        settings: Arc<dyn SettingsProvider>,
    ) -> SinkResult<Self> {
        if config.workers == 0 || config.queue_capacity == 0 {
            return Err(SinkError::Configuration(
                "dispatch workers and queue capacity must be positive".to_string(),
            ));
        }
        let dead_letter = Arc::new(DeadLetter::open(config.dead_letter_path.as_deref()).await?);
        let timeout = Duration::from_millis(config.send_timeout_ms);

        let mut lanes = Vec::with_capacity(sinks.len());
        let mut workers = Vec::with_capacity(sinks.len() * config.workers);
        for sink in sinks {
            let (tx, rx) = mpsc::channel::<Arc<LogBatch>>(config.queue_capacity);
            let rx = Arc::new(Mutex::new(rx));
            for worker in 0..config.workers {
                let rx = rx.clone();
                let sink = sink.clone();
                let dead_letter = dead_letter.clone();
                workers.push(tokio::spawn(async move {
                    loop {
                        let batch = { rx.lock().await.recv().await };
                        let Some(batch) = batch else {
                            debug!(sink = sink.name(), worker, "Dispatch worker stopping");
                            break;
                        };
                        deliver(sink.as_ref(), &batch, timeout, &dead_letter).await;
                    }
                }));
            }
            lanes.push(Lane { sink, tx });
        }

        Ok(Self {
            lanes,
            settings,
            dead_letter,
            workers,
        })
    }

    pub fn sink_names(&self) -> Vec<&str> {
        self.lanes.iter().map(|l| l.sink.name()).collect()
    }

    fn enabled(&self, sink: &dyn Sink) -> bool {
        self.settings
            .get_bool(SERVICE_LOGGING, &format!("{}_enabled", sink.name()), true)
    }

    /// Queue `batch` for every enabled sink; returns the number queued
    pub async fn dispatch(&self, batch: LogBatch) -> usize {
        let batch = Arc::new(batch);
        let mut queued = 0;
        for lane in self.lanes.iter().filter(|l| self.enabled(l.sink.as_ref())) {
            let reason = match lane.tx.try_send(batch.clone()) {
                Ok(()) => {
                    queued += 1;
                    continue;
                }
                Err(mpsc::error::TrySendError::Full(_)) => "queue full",
                Err(mpsc::error::TrySendError::Closed(_)) => "dispatcher closed",
            };
            self.dead_letter.record(lane.sink.name(), &batch, reason).await;
        }
        queued
    }

    /// Stop accepting batches and wait for queued jobs to drain
    pub async fn shutdown(self) {
        let Self { lanes, workers, .. } = self;
        drop(lanes);
        for worker in workers {
            if let Err(e) = worker.await {
                error!(error = %e, "Dispatch worker panicked");
            }
        }
    }
}

async fn deliver(sink: &dyn Sink, batch: &LogBatch, timeout: Duration, dead_letter: &DeadLetter) {
    let name = sink.name().to_string();
    let outcome = match tokio::time::timeout(timeout, sink.send(batch)).await {
        Ok(Ok(())) => "ok",
        Ok(Err(e)) => {
            dead_letter.record(&name, batch, &e.to_string()).await;
            "error"
        }
        Err(_) => {
            let reason = SinkError::Timeout(timeout.as_millis() as u64).to_string();
            dead_letter.record(&name, batch, &reason).await;
            "timeout"
        }
    };
    counter!("fleet_sink_dispatch_total", "sink" => name, "outcome" => outcome).increment(1);
}
