/// Outcome of feeding one epoch's monitored loss to [`EarlyStopping`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopDecision {
    Improved,
    Continue,
    Stop,
}

/// Stops training once the monitored loss has failed to improve by more than
/// `min_delta` for `patience` consecutive epochs.
#[derive(Debug, Clone)]
pub struct EarlyStopping {
    patience: usize,
    min_delta: f64,
    best_loss: f64,
    best_epoch: Option<usize>,
    epochs_without_improvement: usize,
}

impl EarlyStopping {
    pub fn new(patience: usize, min_delta: f64) -> Self {
        Self {
            patience,
            min_delta: min_delta.abs(),
            best_loss: f64::INFINITY,
            best_epoch: None,
            epochs_without_improvement: 0,
        }
    }

    pub fn observe(&mut self, epoch: usize, loss: f64) -> StopDecision {
        if loss < self.best_loss - self.min_delta {
            self.best_loss = loss;
            self.best_epoch = Some(epoch);
            self.epochs_without_improvement = 0;
            return StopDecision::Improved;
        }
        self.epochs_without_improvement += 1;
        if self.epochs_without_improvement >= self.patience {
            StopDecision::Stop
        } else {
            StopDecision::Continue
        }
    }

    pub fn best_loss(&self) -> f64 {
        self.best_loss
    }

    pub fn best_epoch(&self) -> Option<usize> {
        self.best_epoch
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stops_after_patience_epochs_without_improvement() {
        let mut es = EarlyStopping::new(3, 0.001);
        assert_eq!(es.observe(0, 1.0), StopDecision::Improved);
        assert_eq!(es.observe(1, 0.9), StopDecision::Improved);
        // Within min_delta: not an improvement.
        assert_eq!(es.observe(2, 0.8995), StopDecision::Continue);
        assert_eq!(es.observe(3, 0.95), StopDecision::Continue);
        assert_eq!(es.observe(4, 0.91), StopDecision::Stop);
        assert_eq!(es.best_epoch(), Some(1));
        assert!((es.best_loss() - 0.9).abs() < 1e-12);
    }

    #[test]
    fn improvement_resets_the_counter() {
        let mut es = EarlyStopping::new(2, 0.0);
        es.observe(0, 1.0);
        assert_eq!(es.observe(1, 1.0), StopDecision::Continue);
        assert_eq!(es.observe(2, 0.5), StopDecision::Improved);
        assert_eq!(es.observe(3, 0.6), StopDecision::Continue);
        assert_eq!(es.observe(4, 0.7), StopDecision::Stop);
    }

    #[test]
    fn zero_patience_stops_on_first_stall() {
        let mut es = EarlyStopping::new(0, 0.0);
        assert_eq!(es.observe(0, 1.0), StopDecision::Improved);
        assert_eq!(es.observe(1, 1.0), StopDecision::Stop);
    }
}
