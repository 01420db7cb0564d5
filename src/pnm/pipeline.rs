//! Pipeline wiring
//!
//! ```text
//!  samples ─► shard[hash(device, metric) % workers] ─► bus (anomaly)
//!                  │ MetricIngestor (owns its baselines)
//!                  └─► bounded queue ─► correlator task ─► bus (hypothesis,
//!                                       + advisor          remediation,
//!                                                          unresolved fault)
//! ```
//!
//! Each (device, metric) key always lands on the same shard, so its baseline
//! update and scoring are serialized without locks while different keys run
//! in parallel. The correlator is the only cross-device state and has exactly
//! one owner.

use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use super::advisor::RemediationAdvisor;
use super::bus::EventBus;
use super::config::PnmConfig;
use super::correlator::TopologyCorrelator;
use super::error::{PnmError, PnmResult};
use super::ingest::{IngestOutcome, MetricIngestor};
use super::metrics::PnmMetrics;
use super::topology::TopologyIndex;
use crate::models::{AnomalyEvent, Baseline, FaultScope, MetricKey, MetricSample, MetricType, PnmEvent};

enum ShardCommand {
    Ingest {
        sample: MetricSample,
        reply: oneshot::Sender<PnmResult<IngestOutcome>>,
    },
    Baseline {
        key: MetricKey,
        reply: oneshot::Sender<PnmResult<Baseline>>,
    },
    Prune {
        cutoff: DateTime<Utc>,
        reply: oneshot::Sender<usize>,
    },
}

pub struct PnmPipeline {
    shards: Mutex<Vec<mpsc::Sender<ShardCommand>>>,
    topology: Arc<TopologyIndex>,
    bus: Arc<EventBus>,
    metrics: Arc<PnmMetrics>,
    shard_tasks: Mutex<Vec<JoinHandle<()>>>,
    correlator_task: Mutex<Option<JoinHandle<()>>>,
    prune_task: Mutex<Option<JoinHandle<()>>>,
}

impl PnmPipeline {
    /// Spawn shard, correlator and prune tasks. Must run inside a tokio runtime.
    pub fn start(
        config: &PnmConfig,
        topology: Arc<TopologyIndex>,
        bus: Arc<EventBus>,
        metrics: Arc<PnmMetrics>,
    ) -> Arc<Self> {
        let workers = config.ingest.workers.max(1);
        let (anomaly_tx, anomaly_rx) = mpsc::channel(config.correlation.queue_capacity.max(1));

        let mut shards = Vec::with_capacity(workers);
        let mut shard_tasks = Vec::with_capacity(workers);
        for shard_id in 0..workers {
            let (tx, rx) = mpsc::channel(config.ingest.queue_capacity.max(1));
            let ingestor = MetricIngestor::new(config, topology.clone());
            shard_tasks.push(tokio::spawn(run_shard(
                shard_id,
                ingestor,
                rx,
                anomaly_tx.clone(),
                bus.clone(),
                metrics.clone(),
            )));
            shards.push(tx);
        }
        // Shards hold the only senders; the correlator ends when they do
        drop(anomaly_tx);

        let correlator =
            TopologyCorrelator::new(&config.correlation, topology.clone(), metrics.clone())
                .with_max_clock_skew(config.ingest.max_clock_skew);
        let advisor = RemediationAdvisor::with_extra_rules(&config.remediation.extra_rules);
        let correlator_task = tokio::spawn(run_correlator(
            correlator,
            advisor,
            anomaly_rx,
            bus.clone(),
            metrics.clone(),
        ));

        info!(
            workers,
            window_secs = config.correlation.window.as_secs(),
            min_distinct_devices = config.correlation.min_distinct_devices,
            "PNM pipeline started"
        );

        let pipeline = Arc::new(Self {
            shards: Mutex::new(shards),
            topology,
            bus,
            metrics,
            shard_tasks: Mutex::new(shard_tasks),
            correlator_task: Mutex::new(Some(correlator_task)),
            prune_task: Mutex::new(None),
        });

        let idle_ttl = config.baseline.idle_ttl;
        let every = (idle_ttl / 4).clamp(Duration::from_secs(60), Duration::from_secs(3600));
        let weak = Arc::downgrade(&pipeline);
        *pipeline.prune_task.lock() = Some(tokio::spawn(async move {
            let mut interval = tokio::time::interval(every);
            interval.tick().await;
            loop {
                interval.tick().await;
                let Some(pipeline) = weak.upgrade() else {
                    break;
                };
                let cutoff = Utc::now()
                    - chrono::Duration::from_std(idle_ttl).unwrap_or_else(|_| chrono::Duration::hours(24));
                pipeline.prune_idle(cutoff).await;
            }
        }));

        pipeline
    }

    fn shard_for(&self, key: &MetricKey) -> PnmResult<mpsc::Sender<ShardCommand>> {
        let shards = self.shards.lock();
        if shards.is_empty() {
            return Err(PnmError::PipelineClosed);
        }
        let mut hasher = DefaultHasher::new();
        key.hash(&mut hasher);
        let idx = (hasher.finish() % shards.len() as u64) as usize;
        Ok(shards[idx].clone())
    }

    /// Validate, learn and score one sample. Any anomaly is already on the
    /// bus and queued for correlation when this returns.
    pub async fn ingest(&self, sample: MetricSample) -> PnmResult<IngestOutcome> {
        let shard = self.shard_for(&sample.key())?;
        let (reply, rx) = oneshot::channel();
        shard
            .send(ShardCommand::Ingest { sample, reply })
            .await
            .map_err(|_| PnmError::PipelineClosed)?;
        rx.await.map_err(|_| PnmError::PipelineClosed)?
    }

    /// Ingest in order, one result per sample
    pub async fn ingest_batch(&self, samples: Vec<MetricSample>) -> Vec<PnmResult<IngestOutcome>> {
        let mut results = Vec::with_capacity(samples.len());
        for sample in samples {
            results.push(self.ingest(sample).await);
        }
        results
    }

    /// Warm baseline for a key, or `NotYetWarm`
    pub async fn baseline(&self, device_id: &str, metric_type: MetricType) -> PnmResult<Baseline> {
        let key = MetricKey::new(device_id, metric_type);
        let shard = self.shard_for(&key)?;
        let (reply, rx) = oneshot::channel();
        shard
            .send(ShardCommand::Baseline { key, reply })
            .await
            .map_err(|_| PnmError::PipelineClosed)?;
        rx.await.map_err(|_| PnmError::PipelineClosed)?
    }

    /// Drop baselines idle since `cutoff` on every shard
    pub async fn prune_idle(&self, cutoff: DateTime<Utc>) -> usize {
        let shards: Vec<_> = self.shards.lock().clone();
        let mut pruned = 0;
        for shard in shards {
            let (reply, rx) = oneshot::channel();
            if shard.send(ShardCommand::Prune { cutoff, reply }).await.is_err() {
                continue;
            }
            pruned += rx.await.unwrap_or(0);
        }
        if pruned > 0 {
            info!(pruned, cutoff = %cutoff, "Pruned idle baselines");
            self.metrics.record_pruned(pruned);
        }
        pruned
    }

    pub fn topology(&self) -> &Arc<TopologyIndex> {
        &self.topology
    }

    pub fn bus(&self) -> &Arc<EventBus> {
        &self.bus
    }

    pub fn metrics(&self) -> &Arc<PnmMetrics> {
        &self.metrics
    }

    /// Stop accepting samples, drain shards and the correlator, then close
    /// the bus
    pub async fn shutdown(&self) {
        info!("Shutting down PNM pipeline");
        if let Some(task) = self.prune_task.lock().take() {
            task.abort();
        }

        self.shards.lock().clear();

        let shard_tasks: Vec<_> = std::mem::take(&mut *self.shard_tasks.lock());
        for task in shard_tasks {
            if let Err(e) = task.await {
                error!("Shard task failed: {}", e);
            }
        }

        let correlator = self.correlator_task.lock().take();
        if let Some(task) = correlator {
            if let Err(e) = task.await {
                error!("Correlator task failed: {}", e);
            }
        }

        self.bus.close().await;
    }
}

async fn run_shard(
    shard_id: usize,
    mut ingestor: MetricIngestor,
    mut rx: mpsc::Receiver<ShardCommand>,
    anomalies: mpsc::Sender<AnomalyEvent>,
    bus: Arc<EventBus>,
    metrics: Arc<PnmMetrics>,
) {
    debug!(shard_id, "Shard started");

    while let Some(command) = rx.recv().await {
        match command {
            ShardCommand::Ingest { sample, reply } => {
                let started = Instant::now();
                let result = ingestor.ingest(&sample);

                match &result {
                    Ok(outcome) => {
                        metrics.record_accepted(started.elapsed().as_micros() as u64);
                        if let Some(anomaly) = &outcome.anomaly {
                            metrics.record_anomaly(anomaly.metric_type);
                            if let Err(e) = bus.publish(PnmEvent::Anomaly(anomaly.clone())).await {
                                warn!(shard_id, "Anomaly not published: {}", e);
                            }
                            if anomalies.send(anomaly.clone()).await.is_err() {
                                warn!(shard_id, "Correlator gone, anomaly not correlated");
                            }
                        }
                    }
                    Err(e) => metrics.record_rejected(e.kind()),
                }

                // Caller may have given up waiting
                let _ = reply.send(result);
            }
            ShardCommand::Baseline { key, reply } => {
                let _ = reply.send(
                    ingestor
                        .baselines()
                        .get_baseline(&key.device_id, key.metric_type),
                );
            }
            ShardCommand::Prune { cutoff, reply } => {
                let _ = reply.send(ingestor.baselines_mut().prune_idle(cutoff));
            }
        }
    }

    debug!(shard_id, baselines = ingestor.baselines().len(), "Shard stopped");
}

async fn run_correlator(
    mut correlator: TopologyCorrelator,
    advisor: RemediationAdvisor,
    mut rx: mpsc::Receiver<AnomalyEvent>,
    bus: Arc<EventBus>,
    metrics: Arc<PnmMetrics>,
) {
    info!(rules = advisor.rule_count(), "Correlator started");

    while let Some(anomaly) = rx.recv().await {
        let Some(hypothesis) = correlator.correlate(&anomaly) else {
            continue;
        };
        metrics.record_hypothesis(hypothesis.scope == FaultScope::Localized);

        let advice = advisor.advise(&hypothesis);
        let hypothesis_id = hypothesis.id;
        let node_id = hypothesis.suspected_node_id.clone();
        let node_class = hypothesis.suspected_node_class;
        let dominant = hypothesis.dominant_metric();

        if let Err(e) = bus.publish(PnmEvent::FaultHypothesis(hypothesis)).await {
            warn!("Hypothesis not published: {}", e);
            continue;
        }

        match advice {
            Ok(actions) => {
                metrics.record_actions(actions.len());
                for action in actions {
                    if let Err(e) = bus.publish(PnmEvent::Remediation(action)).await {
                        warn!("Remediation not published: {}", e);
                    }
                }
            }
            Err(e @ PnmError::NoRuleMatched { .. }) => {
                metrics.record_unresolved();
                let event = PnmEvent::UnresolvedFault {
                    fault_hypothesis_id: hypothesis_id,
                    suspected_node_id: node_id,
                    node_class,
                    dominant_metric: dominant,
                    reason: e.to_string(),
                };
                if let Err(e) = bus.publish(event).await {
                    warn!("Unresolved fault not published: {}", e);
                }
            }
            Err(e) => error!("Advisor failed: {}", e),
        }
    }

    info!(buffered = correlator.window_len(), "Correlator stopped");
}
