use tracing::{debug, info, warn};

use crate::{config::EarlyStoppingConfig, metrics::EpochMetrics};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decision {
    Continue,
    Stop,
}

/// Called once per finished epoch with that epoch's metrics and the current
/// training state.
pub trait EpochObserver<S> {
    fn on_epoch_end(&mut self, metrics: &EpochMetrics, state: &S) -> Decision;
}

/// Halts training once validation loss has not improved for `patience`
/// consecutive epochs, keeping a snapshot of the state from the best epoch.
#[derive(Debug, Clone)]
pub struct EarlyStopping<S> {
    patience: usize,
    min_delta: f64,
    restore_best_weights: bool,
    wait: usize,
    best: Option<Best<S>>,
    stopped_epoch: Option<usize>,
}

#[derive(Debug, Clone)]
struct Best<S> {
    epoch: usize,
    valid_loss: f64,
    state: Option<S>,
}

impl<S: Clone> EarlyStopping<S> {
    pub fn new(config: &EarlyStoppingConfig) -> Self {
        Self {
            patience: config.patience,
            min_delta: config.min_delta.abs(),
            restore_best_weights: config.restore_best_weights,
            wait: 0,
            best: None,
            stopped_epoch: None,
        }
    }

    pub fn best_epoch(&self) -> Option<usize> {
        self.best.as_ref().map(|b| b.epoch)
    }

    pub fn best_valid_loss(&self) -> Option<f64> {
        self.best.as_ref().map(|b| b.valid_loss)
    }

    pub fn stopped_epoch(&self) -> Option<usize> {
        self.stopped_epoch
    }

    /// The snapshot to roll back to, only when training was halted early and
    /// restoring is enabled.
    pub fn take_restore_state(&mut self) -> Option<S> {
        if self.stopped_epoch.is_none() || !self.restore_best_weights {
            return None;
        }
        self.best.as_mut().and_then(|b| b.state.take())
    }

    fn is_improvement(&self, valid_loss: f64) -> bool {
        match &self.best {
            None => true,
            Some(best) => valid_loss < best.valid_loss - self.min_delta,
        }
    }
}

impl<S: Clone> EpochObserver<S> for EarlyStopping<S> {
    fn on_epoch_end(&mut self, metrics: &EpochMetrics, state: &S) -> Decision {
        let valid_loss = metrics.valid_loss;

        if self.is_improvement(valid_loss) {
            if let Some(best) = &self.best {
                info!(
                    "val_loss improved from {:.4} to {:.4}",
                    best.valid_loss, valid_loss
                );
            }
            self.best = Some(Best {
                epoch: metrics.epoch,
                valid_loss,
                state: self.restore_best_weights.then(|| state.clone()),
            });
            self.wait = 0;
            return Decision::Continue;
        }

        self.wait += 1;
        debug!(
            "val_loss did not improve for {} epoch(s) (best {:.4})",
            self.wait,
            self.best_valid_loss().unwrap_or(f64::INFINITY)
        );

        if self.wait >= self.patience {
            warn!(
                "Early stopping at epoch {}: no val_loss improvement in {} epochs",
                metrics.epoch + 1,
                self.patience
            );
            self.stopped_epoch = Some(metrics.epoch);
            return Decision::Stop;
        }
        Decision::Continue
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn metrics(epoch: usize, valid_loss: f64) -> EpochMetrics {
        EpochMetrics {
            epoch,
            train_loss: 0.0,
            train_accuracy: 0.0,
            valid_loss,
            valid_accuracy: 0.0,
        }
    }

    /// Feeds losses until the observer stops; the "state" is the epoch index.
    fn run(losses: &[f64], config: &EarlyStoppingConfig) -> (EarlyStopping<usize>, usize) {
        let mut observer = EarlyStopping::new(config);
        let mut last = 0;
        for (epoch, &loss) in losses.iter().enumerate() {
            last = epoch;
            if observer.on_epoch_end(&metrics(epoch, loss), &epoch) == Decision::Stop {
                break;
            }
        }
        (observer, last)
    }

    #[test]
    fn stops_after_patience_and_restores_minimum() {
        let losses = [0.9, 0.7, 0.5, 0.55, 0.6, 0.52, 0.58, 0.51, 0.3, 0.2];
        let (mut observer, last) = run(&losses, &EarlyStoppingConfig::default());

        assert_eq!(last, 7, "five non-improving epochs after epoch 2");
        assert_eq!(observer.stopped_epoch(), Some(7));
        assert_eq!(observer.best_epoch(), Some(2));
        assert_eq!(observer.take_restore_state(), Some(2));
    }

    #[test]
    fn improvement_resets_the_counter() {
        let losses = [1.0, 1.1, 1.2, 1.3, 1.4, 0.9, 1.0, 1.0, 1.0, 1.0];
        let (mut observer, last) = run(&losses, &EarlyStoppingConfig::default());

        assert_eq!(last, 9);
        assert_eq!(observer.stopped_epoch(), None);
        assert_eq!(observer.best_epoch(), Some(5));
        assert_eq!(observer.take_restore_state(), None, "final weights kept without a stop");
    }

    #[test]
    fn min_delta_requires_a_real_gain() {
        let config = EarlyStoppingConfig {
            patience: 2,
            min_delta: 0.1,
            restore_best_weights: true,
        };
        let (observer, last) = run(&[1.0, 0.95, 0.92, 0.5], &config);
        assert_eq!(last, 2);
        assert_eq!(observer.best_epoch(), Some(0));
    }

    #[test]
    fn no_snapshot_when_restore_disabled() {
        let config = EarlyStoppingConfig {
            patience: 1,
            min_delta: 0.0,
            restore_best_weights: false,
        };
        let (mut observer, last) = run(&[0.5, 0.6, 0.7], &config);
        assert_eq!(last, 1);
        assert_eq!(observer.take_restore_state(), None);
    }
}
