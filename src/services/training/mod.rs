use crate::algorithms::RecommendationAlgorithm;
use crate::error::Result;
use crate::models::{Interaction, TrainingReport};
use chrono::Utc;
use parking_lot::RwLock;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{debug, info};
use uuid::Uuid;

/// Shared model: one writer per epoch, any number of concurrent readers otherwise
pub type ModelHandle<M> = Arc<RwLock<M>>;

/// Caller-owned flag checked between epochs
#[derive(Debug, Clone, Default)]
pub struct StopHandle(Arc<AtomicBool>);

impl StopHandle {
    pub fn stop(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_stopped(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// Drives epochs over a shared model.
///
/// The write lock is held for exactly one epoch. Between epochs the driver
/// yields to the runtime and checks the stop flag; updates applied before a
/// stop are kept.
pub struct TrainingService<M> {
    model: ModelHandle<M>,
    stop: StopHandle,
}

impl<M> Clone for TrainingService<M> {
    fn clone(&self) -> Self {
        Self {
            model: Arc::clone(&self.model),
            stop: self.stop.clone(),
        }
    }
}

impl<M: RecommendationAlgorithm> TrainingService<M> {
    pub fn new(model: ModelHandle<M>) -> Self {
        Self {
            model,
            stop: StopHandle::default(),
        }
    }

    pub fn model(&self) -> ModelHandle<M> {
        Arc::clone(&self.model)
    }

    pub fn stop_handle(&self) -> StopHandle {
        self.stop.clone()
    }

    pub async fn run(&self, interactions: &[Interaction], epochs: usize) -> Result<TrainingReport> {
        let run_id = Uuid::new_v4();
        let started_at = Utc::now();

        let (name, stopping) = {
            let mut model = self.model.write();
            model.begin_training(interactions)?;
            (model.name(), model.early_stopping())
        };
        info!(%run_id, model = name, epochs, "Training run started");

        let mut epoch_losses = Vec::with_capacity(epochs);
        let mut skipped_steps = 0;
        let mut stopped_early = false;
        let mut cancelled = false;

        for epoch in 0..epochs {
            if self.stop.is_stopped() {
                info!(%run_id, epoch, "Stop requested, ending training run");
                cancelled = true;
                break;
            }

            let outcome = {
                let mut model = self.model.write();
                model.train_epoch(interactions)?
            };
            debug!(
                %run_id,
                epoch,
                loss = outcome.loss,
                skipped = outcome.skipped_steps,
                "Epoch finished"
            );
            epoch_losses.push(outcome.loss);
            skipped_steps += outcome.skipped_steps;

            if stopping.should_stop(&epoch_losses) {
                info!(%run_id, epoch, "Loss plateaued, stopping early");
                stopped_early = true;
                break;
            }

            tokio::task::yield_now().await;
        }

        let report = TrainingReport {
            run_id,
            model: name.to_string(),
            epoch_losses,
            skipped_steps,
            stopped_early,
            cancelled,
            started_at,
            finished_at: Utc::now(),
        };
        info!(
            %run_id,
            epochs_run = report.epochs_run(),
            final_loss = ?report.final_loss(),
            skipped_steps,
            "Training run finished"
        );
        Ok(report)
    }
}
