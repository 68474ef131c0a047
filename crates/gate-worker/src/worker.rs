//! Bucle de consumo: reclama pendientes viejos, lee nuevos, despacha al
//! handler y hace ack sólo ante un resultado terminal.

use std::sync::Arc;
use std::time::Duration;

use log::{debug, error, info, warn};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tokio::sync::watch;

use crate::error::WorkerError;
use crate::jobs::JobHandler;
use crate::stream::{JobStream, StreamMessage};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkerConfig {
    pub stream: String,
    pub group: String,
    pub consumer: String,
    pub batch: usize,
    pub block: Duration,
    /// Tiempo mínimo sin ack antes de reclamar un pendiente ajeno.
    pub min_idle: Duration,
    pub max_deliveries: u32,
    /// Pausa tras un error transitorio.
    pub retry_backoff: Duration,
    /// Stream donde se copian los mensajes descartados.
    pub dead_letter_stream: Option<String>,
}

impl WorkerConfig {
    pub fn new(stream: impl Into<String>, group: impl Into<String>, consumer: impl Into<String>) -> Self {
        let stream = stream.into();
        Self { dead_letter_stream: Some(format!("{stream}:dead")),
               stream,
               group: group.into(),
               consumer: consumer.into(),
               batch: 10,
               block: Duration::from_millis(2000),
               min_idle: Duration::from_secs(60),
               max_deliveries: 5,
               retry_backoff: Duration::from_millis(500) }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PollStats {
    pub received: usize,
    pub acked: usize,
    pub retried: usize,
    pub dead_lettered: usize,
}

impl PollStats {
    fn merge(&mut self, other: PollStats) {
        self.received += other.received;
        self.acked += other.acked;
        self.retried += other.retried;
        self.dead_lettered += other.dead_lettered;
    }
}

#[derive(Debug)]
pub struct FlowWorker {
    config: WorkerConfig,
    stream: Arc<dyn JobStream>,
    handler: Arc<dyn JobHandler>,
}

impl FlowWorker {
    pub fn new(config: WorkerConfig, stream: Arc<dyn JobStream>, handler: Arc<dyn JobHandler>) -> Self {
        Self { config,
               stream,
               handler }
    }

    pub fn config(&self) -> &WorkerConfig {
        &self.config
    }

    async fn dead_letter(&self, msg: &StreamMessage, reason: &str) -> Result<(), WorkerError> {
        let cfg = &self.config;
        if let Some(dlq) = cfg.dead_letter_stream.as_deref() {
            self.stream
                .append(dlq,
                        json!({ "id": msg.id, "payload": msg.payload, "deliveries": msg.deliveries, "reason": reason }))
                .await?;
        }
        self.stream.ack(&cfg.stream, &cfg.group, &msg.id).await
    }

    async fn process(&self, msg: StreamMessage) -> Result<PollStats, WorkerError> {
        let cfg = &self.config;
        let mut stats = PollStats { received: 1,
                                    ..PollStats::default() };
        if msg.deliveries > cfg.max_deliveries {
            warn!("worker:dead-letter id={} deliveries={} max={}", msg.id, msg.deliveries, cfg.max_deliveries);
            self.dead_letter(&msg, "max deliveries exceeded").await?;
            stats.dead_lettered = 1;
            return Ok(stats);
        }
        match self.handler.handle(&msg.payload).await {
            Ok(outcome) => {
                self.stream.ack(&cfg.stream, &cfg.group, &msg.id).await?;
                debug!("worker:ack id={} status={}", msg.id, outcome.status);
                stats.acked = 1;
            }
            Err(e) if e.is_transient() => {
                warn!("worker:transient id={} delivery={} err={e}", msg.id, msg.deliveries);
                stats.retried = 1;
            }
            Err(e) => {
                error!("worker:permanent id={} err={e}", msg.id);
                self.dead_letter(&msg, &e.to_string()).await?;
                stats.dead_lettered = 1;
            }
        }
        Ok(stats)
    }

    /// Una vuelta: reclama pendientes ociosos y lee hasta `batch` nuevos.
    pub async fn poll_once(&self) -> Result<PollStats, WorkerError> {
        let cfg = &self.config;
        let mut stats = PollStats::default();
        let mut msgs = self.stream
                           .claim_idle(&cfg.stream, &cfg.group, &cfg.consumer, cfg.min_idle, cfg.batch)
                           .await?;
        if msgs.len() < cfg.batch {
            let block = if msgs.is_empty() { cfg.block } else { Duration::ZERO };
            msgs.extend(self.stream
                            .read_group(&cfg.stream, &cfg.group, &cfg.consumer, cfg.batch - msgs.len(), block)
                            .await?);
        }
        for msg in msgs {
            stats.merge(self.process(msg).await?);
        }
        Ok(stats)
    }

    /// Corre hasta que `shutdown` pase a `true`. El lote en curso siempre
    /// termina antes de salir.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) -> Result<PollStats, WorkerError> {
        let cfg = &self.config;
        self.stream.ensure_group(&cfg.stream, &cfg.group).await?;
        info!("worker:start stream={} group={} consumer={}", cfg.stream, cfg.group, cfg.consumer);
        let mut total = PollStats::default();
        loop {
            if *shutdown.borrow() {
                break;
            }
            let stats = match self.poll_once().await {
                Ok(s) => s,
                Err(e) => {
                    warn!("worker:poll error: {e}");
                    PollStats { retried: 1,
                                ..PollStats::default() }
                }
            };
            total.merge(stats);
            if stats.retried > 0 {
                tokio::select! {
                    _ = shutdown.changed() => {}
                    _ = tokio::time::sleep(cfg.retry_backoff) => {}
                }
            }
        }
        info!("worker:stop consumer={} acked={} dead={}", cfg.consumer, total.acked, total.dead_lettered);
        Ok(total)
    }
}
