use crate::model::checkpoint::EpochMetrics;
use crate::training::TrainingState;
use crate::utils::format_duration;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

/// Training callback trait
///
/// Callbacks allow custom actions to be performed at various points during training.
pub trait TrainingCallback: Send + Sync {
    /// Called at the start of training
    fn on_train_begin(&mut self) {}

    /// Called at the end of training
    fn on_train_end(&mut self, _state: &TrainingState) {}

    /// Called at the start of each epoch
    fn on_epoch_begin(&mut self, _epoch: usize) {}

    /// Called once the epoch is evaluated and the best epoch updated
    fn on_epoch_end(&mut self, _epoch: usize, _state: &TrainingState, _metrics: &EpochMetrics) {}

    /// Called at the end of each batch
    fn on_batch_end(&mut self, _batch: usize, _loss: f64) {}
}

/// Callback manager that handles multiple callbacks
pub struct CallbackManager {
    callbacks: Vec<Box<dyn TrainingCallback>>,
}

impl CallbackManager {
    /// Create new callback manager
    pub fn new() -> Self {
        Self {
            callbacks: Vec::new(),
        }
    }

    /// Add a callback
    pub fn add_callback<C: TrainingCallback + 'static>(&mut self, callback: C) {
        self.callbacks.push(Box::new(callback));
    }

    pub fn len(&self) -> usize {
        self.callbacks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.callbacks.is_empty()
    }

    pub fn on_train_begin(&mut self) {
        for callback in &mut self.callbacks {
            callback.on_train_begin();
        }
    }

    pub fn on_train_end(&mut self, state: &TrainingState) {
        for callback in &mut self.callbacks {
            callback.on_train_end(state);
        }
    }

    pub fn on_epoch_begin(&mut self, epoch: usize) {
        for callback in &mut self.callbacks {
            callback.on_epoch_begin(epoch);
        }
    }

    pub fn on_epoch_end(&mut self, epoch: usize, state: &TrainingState, metrics: &EpochMetrics) {
        for callback in &mut self.callbacks {
            callback.on_epoch_end(epoch, state, metrics);
        }
    }

    pub fn on_batch_end(&mut self, batch: usize, loss: f64) {
        for callback in &mut self.callbacks {
            callback.on_batch_end(batch, loss);
        }
    }
}

impl Default for CallbackManager {
    fn default() -> Self {
        Self::new()
    }
}

/// Progress lines in the tab-separated format downstream scripts parse
pub struct ProgressLoggerCallback {
    device_id: usize,
}

impl ProgressLoggerCallback {
    pub fn new(device_id: usize) -> Self {
        Self { device_id }
    }
}

impl TrainingCallback for ProgressLoggerCallback {
    fn on_batch_end(&mut self, batch: usize, loss: f64) {
        tracing::info!("{}\t{:.6}", batch, loss);
    }

    fn on_epoch_end(&mut self, epoch: usize, state: &TrainingState, metrics: &EpochMetrics) {
        tracing::info!(
            "Epoch\t{}\tCUDA_ID\t{}\ttrain_corr\t{:.6}\ttest_corr\t{:.6}\ttotal_loss\t{:.6}",
            epoch,
            self.device_id,
            metrics.train_corr,
            metrics.test_corr,
            metrics.total_loss
        );
        tracing::info!("Best performed model (epoch)\t{}", state.best_epoch);
    }
}

/// Shared per-epoch metrics history
pub type MetricsHistory = Arc<Mutex<Vec<EpochMetrics>>>;

/// Records every epoch's metrics into a shared history
#[derive(Default)]
pub struct HistoryCallback {
    history: MetricsHistory,
}

impl HistoryCallback {
    pub fn new() -> Self {
        Self::default()
    }

    /// Handle that stays readable after the callback moves into a trainer
    pub fn history(&self) -> MetricsHistory {
        Arc::clone(&self.history)
    }
}

impl TrainingCallback for HistoryCallback {
    fn on_epoch_end(&mut self, _epoch: usize, _state: &TrainingState, metrics: &EpochMetrics) {
        match self.history.lock() {
            Ok(mut history) => history.push(metrics.clone()),
            Err(_) => tracing::warn!("Metrics history lock poisoned, dropping epoch {}", metrics.epoch),
        }
    }
}

/// Timer callback that tracks training time
pub struct TimerCallback {
    start_time: Option<Instant>,
    epoch_start: Option<Instant>,
    epoch_times: Vec<Duration>,
}

impl TimerCallback {
    /// Create new timer callback
    pub fn new() -> Self {
        Self {
            start_time: None,
            epoch_start: None,
            epoch_times: Vec::new(),
        }
    }

    /// Get average epoch time
    pub fn average_epoch_time(&self) -> Option<Duration> {
        if self.epoch_times.is_empty() {
            None
        } else {
            let total: Duration = self.epoch_times.iter().sum();
            Some(total / self.epoch_times.len() as u32)
        }
    }
}

impl Default for TimerCallback {
    fn default() -> Self {
        Self::new()
    }
}

impl TrainingCallback for TimerCallback {
    fn on_train_begin(&mut self) {
        self.start_time = Some(Instant::now());
    }

    fn on_epoch_begin(&mut self, _epoch: usize) {
        self.epoch_start = Some(Instant::now());
    }

    fn on_epoch_end(&mut self, epoch: usize, _state: &TrainingState, _metrics: &EpochMetrics) {
        if let Some(start) = self.epoch_start.take() {
            let elapsed = start.elapsed();
            tracing::debug!("Epoch {} took {}", epoch, format_duration(elapsed.as_secs_f64()));
            self.epoch_times.push(elapsed);
        }
    }

    fn on_train_end(&mut self, state: &TrainingState) {
        if let Some(start) = self.start_time {
            tracing::info!(
                "Training completed in {} ({} epochs, {} avg per epoch)",
                format_duration(start.elapsed().as_secs_f64()),
                state.epoch,
                format_duration(self.average_epoch_time().unwrap_or_default().as_secs_f64())
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn metrics(epoch: usize, test_corr: f64) -> EpochMetrics {
        EpochMetrics {
            epoch,
            train_corr: 0.5,
            test_corr,
            total_loss: 0.1,
        }
    }

    #[test]
    fn test_history_callback() {
        let callback = HistoryCallback::new();
        let history = callback.history();

        let mut manager = CallbackManager::new();
        manager.add_callback(callback);

        let mut state = TrainingState::new();
        for epoch in 0..3 {
            let m = metrics(epoch, 0.1 * epoch as f64);
            state.update_epoch(&m);
            manager.on_epoch_end(epoch, &state, &m);
        }

        let history = history.lock().unwrap();
        assert_eq!(history.len(), 3);
        assert_eq!(history[2].epoch, 2);
    }

    #[test]
    fn test_callback_manager() {
        let mut manager = CallbackManager::new();
        manager.add_callback(ProgressLoggerCallback::new(1));
        manager.add_callback(TimerCallback::new());
        assert_eq!(manager.len(), 2);

        manager.on_train_begin();
        manager.on_epoch_begin(0);
        manager.on_batch_end(0, 0.5);

        let mut state = TrainingState::new();
        let m = metrics(0, 0.2);
        state.update_epoch(&m);
        manager.on_epoch_end(0, &state, &m);

        manager.on_train_end(&state);
    }

    #[test]
    fn test_timer_records_epochs() {
        let mut timer = TimerCallback::new();
        assert!(timer.average_epoch_time().is_none());

        timer.on_train_begin();
        timer.on_epoch_begin(0);
        timer.on_epoch_end(0, &TrainingState::new(), &metrics(0, 0.0));
        assert!(timer.average_epoch_time().is_some());
    }
}
