use serde::{
    Deserialize,
    Serialize,
};
use tokio::sync::watch;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SyncStep {
    Connecting,
    InitialSync,
    Live,
    Error,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyncProgress {
    pub current_block: u64,
    pub latest_block: u64,
    pub step: SyncStep,
    pub message: String,
    pub percentage: f64,
    /// Set once the session first catches up; never cleared.
    pub live: bool,
    pub error: Option<String>,
}

impl SyncProgress {
    fn connecting() -> Self {
        Self {
            current_block: 0,
            latest_block: 0,
            step: SyncStep::Connecting,
            message: "Connecting".to_string(),
            percentage: 0.0,
            live: false,
            error: None,
        }
    }

    pub fn is_live(&self) -> bool {
        self.live
    }

    /// Live and not behind the chain head at the moment.
    pub fn is_caught_up(&self) -> bool {
        self.live && self.current_block >= self.latest_block
    }
}

/// `current / latest` as a percentage in `0.0..=100.0`; zero while the head is unknown.
pub fn percentage(current_block: u64, latest_block: u64) -> f64 {
    if latest_block == 0 {
        return 0.0;
    }
    let ratio = current_block as f64 / latest_block as f64 * 100.0;
    if ratio.is_finite() {
        ratio.clamp(0.0, 100.0)
    } else {
        0.0
    }
}

/// Tracks sync progress exactly and publishes it through a `watch` channel.
/// Publication is skipped for percentage churn smaller than `min_percentage_delta`;
/// step, liveness and error changes are always published.
pub struct ProgressTracker {
    state: SyncProgress,
    step_before_error: SyncStep,
    min_percentage_delta: f64,
    sender: watch::Sender<SyncProgress>,
}

impl Default for ProgressTracker {
    fn default() -> Self {
        Self::new(0.0)
    }
}

impl ProgressTracker {
    pub fn new(min_percentage_delta: f64) -> Self {
        let state = SyncProgress::connecting();
        let (sender, _) = watch::channel(state.clone());
        Self {
            state,
            step_before_error: SyncStep::Connecting,
            min_percentage_delta: min_percentage_delta.max(0.0),
            sender,
        }
    }

    pub fn watch(&self) -> watch::Receiver<SyncProgress> {
        self.sender.subscribe()
    }

    pub fn snapshot(&self) -> SyncProgress {
        self.state.clone()
    }

    pub fn current_block(&self) -> u64 {
        self.state.current_block
    }

    pub fn latest_block(&self) -> u64 {
        self.state.latest_block
    }

    pub fn step(&self) -> SyncStep {
        self.state.step
    }

    pub fn message(&self) -> &str {
        &self.state.message
    }

    pub fn percentage(&self) -> f64 {
        percentage(self.state.current_block, self.state.latest_block)
    }

    pub fn is_live(&self) -> bool {
        self.state.is_live()
    }

    pub fn is_caught_up(&self) -> bool {
        self.state.is_caught_up()
    }

    pub fn error(&self) -> Option<&str> {
        self.state.error.as_deref()
    }

    /// Moves out of `Connecting` once the first batch or head arrives.
    pub fn begin_sync(&mut self) {
        if self.state.step == SyncStep::Connecting {
            self.state.step = SyncStep::InitialSync;
            self.refresh_message();
            self.publish();
        }
    }

    pub fn on_batch_applied(&mut self, block_number: u64) {
        self.state.current_block = block_number;
        self.recompute();
    }

    /// Records a new chain head. Regressions are ignored.
    pub fn on_latest_block_observed(&mut self, block_number: u64) {
        if block_number < self.state.latest_block {
            tracing::debug!(
                observed = block_number,
                latest = self.state.latest_block,
                "ignoring chain head regression"
            );
            return;
        }
        self.state.latest_block = block_number;
        self.recompute();
    }

    /// One-way transition to `Live`.
    pub fn mark_live(&mut self) {
        if self.state.live {
            return;
        }
        tracing::info!(
            current_block = self.state.current_block,
            latest_block = self.state.latest_block,
            "sync is live"
        );
        self.state.live = true;
        if self.state.step == SyncStep::Error {
            self.step_before_error = SyncStep::Live;
        } else {
            self.state.step = SyncStep::Live;
        }
        self.recompute();
    }

    pub fn set_error(&mut self, reason: impl Into<String>) {
        if self.state.step != SyncStep::Error {
            self.step_before_error = self.state.step;
        }
        self.state.step = SyncStep::Error;
        self.state.error = Some(reason.into());
        self.refresh_message();
        self.publish();
    }

    pub fn clear_error(&mut self) {
        if self.state.step != SyncStep::Error {
            return;
        }
        self.state.step = self.step_before_error;
        self.state.error = None;
        self.refresh_message();
        self.publish();
    }

    fn recompute(&mut self) {
        self.state.percentage = percentage(self.state.current_block, self.state.latest_block);
        self.refresh_message();
        self.publish();
    }

    fn refresh_message(&mut self) {
        self.state.message = match self.state.step {
            SyncStep::Connecting => "Connecting".to_string(),
            SyncStep::InitialSync => format!(
                "Syncing block {} of {} ({:.0}%)",
                self.state.current_block, self.state.latest_block, self.state.percentage
            ),
            SyncStep::Live => "Live".to_string(),
            SyncStep::Error => format!(
                "Sync paused at block {}: {}",
                self.state.current_block,
                self.state.error.as_deref().unwrap_or("unknown error")
            ),
        };
    }

    fn publish(&self) {
        let state = &self.state;
        let threshold = self.min_percentage_delta;
        self.sender.send_if_modified(|published| {
            if published == state {
                return false;
            }
            let significant = threshold == 0.0
                || published.step != state.step
                || published.live != state.live
                || published.error != state.error
                || (published.percentage - state.percentage).abs() >= threshold;
            if significant {
                *published = state.clone();
            }
            significant
        });
    }
}

#[cfg(test)]
mod tests {
    #![allow(non_snake_case)]
    use super::*;

    #[test]
    fn percentage__is_zero_while_latest_unknown() {
        assert_eq!(percentage(0, 0), 0.0);
        assert_eq!(percentage(10, 0), 0.0);
    }

    #[test]
    fn percentage__is_clamped_to_one_hundred() {
        assert_eq!(percentage(5, 5), 100.0);
        assert_eq!(percentage(8, 5), 100.0);
        assert_eq!(percentage(1, 4), 25.0);
    }

    #[test]
    fn on_latest_block_observed__ignores_regressions() {
        // given
        let mut tracker = ProgressTracker::default();
        tracker.on_latest_block_observed(20);

        // when
        tracker.on_latest_block_observed(15);

        // then
        assert_eq!(tracker.latest_block(), 20);
    }

    #[test]
    fn mark_live__is_one_way_even_when_head_advances() {
        // given
        let mut tracker = ProgressTracker::default();
        tracker.begin_sync();
        tracker.on_latest_block_observed(5);
        tracker.on_batch_applied(5);
        tracker.mark_live();

        // when
        tracker.on_latest_block_observed(9);

        // then
        assert!(tracker.is_live());
        assert!(!tracker.is_caught_up());
        assert_eq!(tracker.step(), SyncStep::Live);
    }

    #[test]
    fn set_error__surfaces_error_and_keeps_last_percentage() {
        // given
        let mut tracker = ProgressTracker::default();
        tracker.begin_sync();
        tracker.on_latest_block_observed(10);
        tracker.on_batch_applied(4);

        // when
        tracker.set_error("bad payload");

        // then
        let progress = tracker.snapshot();
        assert_eq!(progress.step, SyncStep::Error);
        assert_eq!(progress.error.as_deref(), Some("bad payload"));
        assert_eq!(progress.percentage, 40.0);
        assert!(progress.message.contains("bad payload"));
    }

    #[test]
    fn clear_error__restores_previous_step() {
        // given
        let mut tracker = ProgressTracker::default();
        tracker.begin_sync();
        tracker.set_error("bad payload");

        // when
        tracker.clear_error();

        // then
        assert_eq!(tracker.step(), SyncStep::InitialSync);
        assert_eq!(tracker.error(), None);
    }

    #[test]
    fn watch__receives_published_progress() {
        // given
        let mut tracker = ProgressTracker::default();
        let mut receiver = tracker.watch();

        // when
        tracker.begin_sync();
        tracker.on_latest_block_observed(10);
        tracker.on_batch_applied(10);
        tracker.mark_live();

        // then
        assert!(receiver.has_changed().unwrap());
        let progress = receiver.borrow_and_update().clone();
        assert!(progress.is_live());
        assert_eq!(progress.percentage, 100.0);
    }

    #[test]
    fn publish__skips_changes_below_threshold() {
        // given
        let mut tracker = ProgressTracker::new(5.0);
        tracker.begin_sync();
        tracker.on_latest_block_observed(1000);
        let mut receiver = tracker.watch();
        receiver.borrow_and_update();

        // when
        tracker.on_batch_applied(10);

        // then
        assert!(!receiver.has_changed().unwrap());
        assert_eq!(tracker.current_block(), 10);

        // when
        tracker.on_batch_applied(100);

        // then
        assert!(receiver.has_changed().unwrap());
        assert_eq!(receiver.borrow().current_block, 100);
    }
}
