//! Per-machine worker.
//!
//! Each machine id gets one task that exclusively owns its [`MachineState`].
//! Readings for the same machine are therefore processed strictly in order,
//! and the COLD -> TRAINED transition can never race with a concurrent reading.

use crate::alert::Alert;
use crate::detect::baseline::FeatureSummary;
use crate::detect::{BaselineBuffer, BufferState, DetectError, IsolationForest, Severity};
use crate::engine::stats::Counter;
use crate::engine::EngineContext;
use crate::telemetry::{FeatureVector, Reading};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, error, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Phase {
    /// Accumulating the baseline; nothing is scored.
    Cold,
    /// Model fitted; every reading is scored.
    Trained,
}

/// What happened to one submitted reading.
#[derive(Debug, Clone, PartialEq)]
pub enum Outcome {
    /// Added to the baseline of a COLD machine.
    Buffered { samples: usize, needed: usize },
    /// This reading completed the baseline and the model was fitted on it.
    Trained { samples: usize },
    /// Scored by a TRAINED machine. `alert` is set for WARNING and CRITICAL.
    Scored {
        score: f64,
        severity: Severity,
        alert: Option<Alert>,
    },
    /// Dropped without touching machine state.
    Rejected { reason: String },
}

impl Outcome {
    pub fn alert(&self) -> Option<&Alert> {
        match self {
            Outcome::Scored { alert, .. } => alert.as_ref(),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ModelInfo {
    pub training_samples: usize,
    pub trained_at: DateTime<Utc>,
    /// Loaded from the model store rather than fitted in this process.
    pub restored: bool,
    pub n_estimators: usize,
    pub decision_threshold: Option<f64>,
}

/// Diagnostic snapshot of one machine.
#[derive(Debug, Clone, Serialize)]
pub struct MachineStatus {
    pub machine_id: String,
    pub phase: Phase,
    pub sample_count: u64,
    pub baseline_samples: usize,
    pub min_training_samples: usize,
    pub alerts: u64,
    pub last_reading: Option<DateTime<Utc>>,
    pub model: Option<ModelInfo>,
    pub baseline: Vec<FeatureSummary>,
}

pub(crate) enum Command {
    Reading {
        reading: Reading,
        features: FeatureVector,
        reply: Option<oneshot::Sender<Outcome>>,
    },
    Status(oneshot::Sender<MachineStatus>),
    History(oneshot::Sender<Vec<Reading>>),
}

struct TrainedModel {
    forest: IsolationForest,
    info: ModelInfo,
}

impl TrainedModel {
    fn new(
        forest: IsolationForest,
        training_samples: usize,
        trained_at: DateTime<Utc>,
        restored: bool,
    ) -> Self {
        let info = ModelInfo {
            training_samples,
            trained_at,
            restored,
            n_estimators: forest.params().n_estimators,
            decision_threshold: forest.threshold(),
        };
        Self { forest, info }
    }
}

struct MachineState {
    machine_id: String,
    sample_count: u64,
    baseline: BaselineBuffer,
    model: Option<TrainedModel>,
    recent: VecDeque<Reading>,
    history_len: usize,
    alerts: u64,
    last_reading: Option<DateTime<Utc>>,
}

pub(crate) async fn run(
    machine_id: String,
    ctx: Arc<EngineContext>,
    mut rx: mpsc::Receiver<Command>,
) {
    let mut state = MachineState {
        model: restore(&ctx, &machine_id).await,
        machine_id,
        sample_count: 0,
        baseline: BaselineBuffer::new(ctx.min_training_samples),
        recent: VecDeque::with_capacity(ctx.history_len),
        history_len: ctx.history_len,
        alerts: 0,
        last_reading: None,
    };

    while let Some(cmd) = rx.recv().await {
        match cmd {
            Command::Reading {
                reading,
                features,
                reply,
            } => {
                let outcome = state.handle(&ctx, reading, features).await;
                if let Some(reply) = reply {
                    let _ = reply.send(outcome);
                }
            }
            Command::Status(reply) => {
                let _ = reply.send(state.status(&ctx));
            }
            Command::History(reply) => {
                let _ = reply.send(state.recent.iter().cloned().collect());
            }
        }
    }
    debug!(machine = %state.machine_id, "machine worker stopped");
}

/// Load a persisted model for `machine_id`. Incompatible or unreadable
/// artifacts leave the machine COLD.
async fn restore(ctx: &Arc<EngineContext>, machine_id: &str) -> Option<TrainedModel> {
    let store = ctx.store.clone()?;
    let extractor = ctx.extractor.clone();
    let id = machine_id.to_string();

    let loaded = tokio::task::spawn_blocking(move || -> Result<Option<TrainedModel>, DetectError> {
        let Some(persisted) = store.load(&id)? else {
            return Ok(None);
        };
        let training_samples = persisted.training_samples;
        let trained_at = persisted.trained_at;
        let forest = IsolationForest::deserialize(persisted, &extractor)?;
        Ok(Some(TrainedModel::new(forest, training_samples, trained_at, true)))
    })
    .await;

    match loaded {
        Ok(Ok(Some(model))) => {
            ctx.stats.incr(Counter::ModelsRestored);
            info!(
                machine = %machine_id,
                trained_at = %model.info.trained_at,
                samples = model.info.training_samples,
                "restored persisted model, machine starts TRAINED"
            );
            Some(model)
        }
        Ok(Ok(None)) => None,
        Ok(Err(e @ DetectError::ModelSchemaMismatch { .. })) => {
            warn!(
                machine = %machine_id,
                error = %e,
                "persisted model does not fit the feature layout, retraining from scratch"
            );
            None
        }
        Ok(Err(e)) => {
            warn!(
                machine = %machine_id,
                error = %e,
                "failed to load persisted model, retraining from scratch"
            );
            None
        }
        Err(e) => {
            error!(machine = %machine_id, error = %e, "model restore task failed");
            None
        }
    }
}

impl MachineState {
    async fn handle(
        &mut self,
        ctx: &EngineContext,
        reading: Reading,
        features: FeatureVector,
    ) -> Outcome {
        self.sample_count += 1;
        self.last_reading = Some(reading.timestamp);
        self.remember(&reading);

        match self.model.as_ref().map(|m| m.forest.score(&features)) {
            None => self.accumulate(ctx, features).await,
            Some(scored) => self.score(ctx, scored, reading, features),
        }
    }

    fn remember(&mut self, reading: &Reading) {
        if self.history_len == 0 {
            return;
        }
        if self.recent.len() == self.history_len {
            self.recent.pop_front();
        }
        self.recent.push_back(reading.clone());
    }

    async fn accumulate(&mut self, ctx: &EngineContext, features: FeatureVector) -> Outcome {
        ctx.stats.incr(Counter::Buffered);
        match self.baseline.add(features) {
            BufferState::Accumulating => {
                debug!(
                    machine = %self.machine_id,
                    samples = self.baseline.len(),
                    needed = ctx.min_training_samples,
                    "baseline sample stored"
                );
                Outcome::Buffered {
                    samples: self.baseline.len(),
                    needed: ctx.min_training_samples,
                }
            }
            BufferState::Ready => self.train(ctx).await,
        }
    }

    /// COLD -> TRAINED. Fitting runs on the blocking pool so only this
    /// machine's queue waits for it.
    async fn train(&mut self, ctx: &EngineContext) -> Outcome {
        let samples = self.baseline.samples().to_vec();
        let count = samples.len();
        let params = ctx.params.clone();
        let store = ctx.store.clone();
        let layout = ctx.extractor.layout().to_vec();
        let machine_id = self.machine_id.clone();
        let stats = ctx.stats.clone();
        let started = Instant::now();

        let fitted = tokio::task::spawn_blocking(move || -> Result<TrainedModel, DetectError> {
            let mut forest = IsolationForest::new(params);
            forest.fit(&samples)?;
            let trained_at = Utc::now();
            if let Some(store) = store {
                let saved = forest
                    .serialize(&machine_id, &layout, samples.len(), trained_at)
                    .and_then(|persisted| store.save(&persisted));
                match saved {
                    Ok(path) => {
                        info!(machine = %machine_id, path = %path.display(), "model saved")
                    }
                    Err(e) => {
                        stats.incr(Counter::PersistFailed);
                        warn!(
                            machine = %machine_id,
                            error = %e,
                            "failed to persist model, keeping it in memory only"
                        );
                    }
                }
            }
            Ok(TrainedModel::new(forest, samples.len(), trained_at, false))
        })
        .await;

        match fitted {
            Ok(Ok(model)) => {
                self.baseline.freeze();
                info!(
                    machine = %self.machine_id,
                    samples = count,
                    threshold = ?model.info.decision_threshold,
                    elapsed_ms = started.elapsed().as_millis() as u64,
                    "model trained, machine is TRAINED"
                );
                self.model = Some(model);
                ctx.stats.incr(Counter::ModelsTrained);
                Outcome::Trained { samples: count }
            }
            Ok(Err(e)) => {
                warn!(
                    machine = %self.machine_id,
                    error = %e,
                    "model fit failed, machine stays COLD"
                );
                Outcome::Buffered {
                    samples: self.baseline.len(),
                    needed: ctx.min_training_samples,
                }
            }
            Err(e) => {
                error!(
                    machine = %self.machine_id,
                    error = %e,
                    "training task failed, machine stays COLD"
                );
                Outcome::Buffered {
                    samples: self.baseline.len(),
                    needed: ctx.min_training_samples,
                }
            }
        }
    }

    fn score(
        &mut self,
        ctx: &EngineContext,
        scored: Result<f64, DetectError>,
        reading: Reading,
        features: FeatureVector,
    ) -> Outcome {
        let score = match scored {
            Ok(score) => score,
            Err(e) => {
                // A fitted model with the extractor's own layout cannot fail
                // here; reaching this arm is a sequencing bug.
                ctx.stats.incr(Counter::ScoringFailed);
                error!(
                    machine = %self.machine_id,
                    error = %e,
                    "scoring failed on a TRAINED machine"
                );
                return Outcome::Rejected {
                    reason: e.to_string(),
                };
            }
        };
        ctx.stats.incr(Counter::Scored);

        let (severity, factors) = ctx.classifier.classify(score, &features);
        if !severity.is_alerting() {
            debug!(machine = %self.machine_id, score, %severity, "normal operation");
            return Outcome::Scored {
                score,
                severity,
                alert: None,
            };
        }

        let alert = ctx.emitter.emit(
            &self.machine_id,
            reading.timestamp,
            score,
            severity,
            features,
            reading,
            factors,
        );
        self.alerts += 1;
        warn!(
            alert_id = alert.alert_id,
            machine = %self.machine_id,
            %severity,
            score,
            recommendation = %alert.recommendation_text(),
            "anomaly detected"
        );
        Outcome::Scored {
            score,
            severity,
            alert: Some(alert),
        }
    }

    fn status(&self, ctx: &EngineContext) -> MachineStatus {
        MachineStatus {
            machine_id: self.machine_id.clone(),
            phase: if self.model.is_some() {
                Phase::Trained
            } else {
                Phase::Cold
            },
            sample_count: self.sample_count,
            baseline_samples: self.baseline.len(),
            min_training_samples: ctx.min_training_samples,
            alerts: self.alerts,
            last_reading: self.last_reading,
            model: self.model.as_ref().map(|m| m.info.clone()),
            baseline: self.baseline.summary(),
        }
    }
}
