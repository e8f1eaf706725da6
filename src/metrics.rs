use serde::{Deserialize, Serialize};
use std::fmt;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EpochMetrics {
    /// Zero-based.
    pub epoch: usize,
    pub train_loss: f64,
    pub train_accuracy: f64,
    pub valid_loss: f64,
    pub valid_accuracy: f64,
}

impl fmt::Display for EpochMetrics {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "epoch {:>3} | loss {:.4} | acc {:.2}% | val_loss {:.4} | val_acc {:.2}%",
            self.epoch + 1,
            self.train_loss,
            self.train_accuracy * 100.0,
            self.valid_loss,
            self.valid_accuracy * 100.0
        )
    }
}

/// Running sums for one pass over a sequence.
#[derive(Debug, Default, Clone, Copy)]
pub struct PassAccumulator {
    loss_sum: f64,
    correct: usize,
    samples: usize,
}

impl PassAccumulator {
    pub fn record(&mut self, batch_loss: f64, correct: usize, batch_len: usize) {
        self.loss_sum += batch_loss * batch_len as f64;
        self.correct += correct;
        self.samples += batch_len;
    }

    /// Batch losses averaged with each batch weighted by its length.
    pub fn mean_loss(&self) -> f64 {
        self.loss_sum / self.samples.max(1) as f64
    }

    pub fn accuracy(&self) -> f64 {
        self.correct as f64 / self.samples.max(1) as f64
    }
}
