// Progress tracking for one download session: a shared accumulator updated
// by concurrent fetch workers, published through a watch channel and an
// optionally injected callback. One tracker per handle; no global state.

use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::watch;
use uuid::Uuid;

use crate::error::FailureClass;

/// Fraction of overall progress attributed to the fetch phase; the
/// remaining headroom signals that reassembly work is still ahead.
pub const FETCH_PHASE_CEILING: f64 = 0.95;

/// Lifecycle of one download session.
#[derive(Debug, Clone, PartialEq)]
pub enum DownloadState {
    Idle,
    DiscoveringQualities,
    FetchingSegments,
    Reassembling,
    Finalizing,
    Completed,
    Cancelled,
    Failed(FailureClass),
}

impl DownloadState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Cancelled | Self::Failed(_))
    }
}

/// Point-in-time snapshot of a session's progress.
#[derive(Debug, Clone)]
pub struct DownloadProgress {
    pub session_id: Uuid,
    pub state: DownloadState,
    /// Overall fractional progress in [0, 1]. Monotonically
    /// non-decreasing; pinned to exactly 1.0 only once the final output
    /// file exists at its destination.
    pub fraction: f64,
    pub completed_segments: usize,
    pub total_segments: usize,
    pub bytes_transferred: u64,
}

impl DownloadProgress {
    fn initial(session_id: Uuid) -> Self {
        Self {
            session_id,
            state: DownloadState::Idle,
            fraction: 0.0,
            completed_segments: 0,
            total_segments: 0,
            bytes_transferred: 0,
        }
    }
}

/// Callback invoked after every progress change, injected per handle.
pub type ProgressCallback = Arc<dyn Fn(&DownloadProgress) + Send + Sync>;

struct Counters {
    state: DownloadState,
    fraction: f64,
    completed: usize,
    total: usize,
    bytes: u64,
}

pub struct ProgressTracker {
    session_id: Uuid,
    counters: Mutex<Counters>,
    tx: watch::Sender<DownloadProgress>,
    callback: Option<ProgressCallback>,
}

impl ProgressTracker {
    pub fn new(
        session_id: Uuid,
        callback: Option<ProgressCallback>,
    ) -> (Self, watch::Receiver<DownloadProgress>) {
        let (tx, rx) = watch::channel(DownloadProgress::initial(session_id));
        let tracker = Self {
            session_id,
            counters: Mutex::new(Counters {
                state: DownloadState::Idle,
                fraction: 0.0,
                completed: 0,
                total: 0,
                bytes: 0,
            }),
            tx,
            callback,
        };
        (tracker, rx)
    }

    pub fn set_state(&self, state: DownloadState) {
        let snapshot = {
            let mut counters = self.counters.lock();
            counters.state = state;
            self.snapshot(&counters)
        };
        self.publish(snapshot);
    }

    /// Arms the fetch phase with the total segment count.
    pub fn begin_fetch(&self, total_segments: usize) {
        let snapshot = {
            let mut counters = self.counters.lock();
            counters.state = DownloadState::FetchingSegments;
            counters.total = total_segments;
            counters.completed = 0;
            self.snapshot(&counters)
        };
        self.publish(snapshot);
    }

    /// Records one completed segment. Fraction never exceeds the fetch
    /// ceiling and never decreases.
    pub fn record_segment(&self, byte_count: u64) {
        let snapshot = {
            let mut counters = self.counters.lock();
            counters.completed += 1;
            counters.bytes += byte_count;
            if counters.total > 0 {
                let fetched = counters.completed as f64 / counters.total as f64;
                let fraction = (fetched * FETCH_PHASE_CEILING).min(FETCH_PHASE_CEILING);
                counters.fraction = counters.fraction.max(fraction);
            }
            self.snapshot(&counters)
        };
        self.publish(snapshot);
    }

    /// Terminal success: the output file exists at its destination, so the
    /// fraction is pinned to exactly 1.0.
    pub fn complete(&self) {
        let snapshot = {
            let mut counters = self.counters.lock();
            counters.state = DownloadState::Completed;
            counters.fraction = 1.0;
            self.snapshot(&counters)
        };
        self.publish(snapshot);
    }

    pub fn cancel(&self) {
        self.set_state(DownloadState::Cancelled);
    }

    pub fn fail(&self, class: FailureClass) {
        self.set_state(DownloadState::Failed(class));
    }

    pub fn latest(&self) -> DownloadProgress {
        self.tx.borrow().clone()
    }

    fn snapshot(&self, counters: &Counters) -> DownloadProgress {
        DownloadProgress {
            session_id: self.session_id,
            state: counters.state.clone(),
            fraction: counters.fraction,
            completed_segments: counters.completed,
            total_segments: counters.total,
            bytes_transferred: counters.bytes,
        }
    }

    fn publish(&self, snapshot: DownloadProgress) {
        if let Some(callback) = &self.callback {
            callback(&snapshot);
        }
        // send_replace stores the value even when every receiver is gone,
        // so latest() stays accurate for callers without a subscription
        self.tx.send_replace(snapshot);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex as PlMutex;

    fn tracker() -> (ProgressTracker, watch::Receiver<DownloadProgress>) {
        ProgressTracker::new(Uuid::new_v4(), None)
    }

    #[test]
    fn fetch_fraction_is_capped_below_the_ceiling() {
        let (tracker, _rx) = tracker();
        tracker.begin_fetch(4);
        for _ in 0..4 {
            tracker.record_segment(100);
        }
        let progress = tracker.latest();
        assert_eq!(progress.completed_segments, 4);
        assert_eq!(progress.bytes_transferred, 400);
        assert!((progress.fraction - FETCH_PHASE_CEILING).abs() < 1e-9);
    }

    #[test]
    fn fraction_is_monotonically_non_decreasing() {
        let (tracker, _rx) = tracker();
        tracker.begin_fetch(10);
        let mut last = 0.0;
        for _ in 0..10 {
            tracker.record_segment(1);
            let fraction = tracker.latest().fraction;
            assert!(fraction >= last);
            last = fraction;
        }
        tracker.complete();
        assert_eq!(tracker.latest().fraction, 1.0);
    }

    #[test]
    fn completion_pins_fraction_to_one() {
        let (tracker, _rx) = tracker();
        tracker.begin_fetch(2);
        tracker.record_segment(10);
        tracker.record_segment(10);
        assert!(tracker.latest().fraction < 1.0);
        tracker.complete();
        let progress = tracker.latest();
        assert_eq!(progress.fraction, 1.0);
        assert_eq!(progress.state, DownloadState::Completed);
    }

    #[test]
    fn latest_stays_current_after_all_receivers_drop() {
        let (tracker, rx) = tracker();
        drop(rx);
        tracker.begin_fetch(6);
        for _ in 0..6 {
            tracker.record_segment(10);
        }
        let progress = tracker.latest();
        assert_eq!(progress.completed_segments, 6);
        assert_eq!(progress.bytes_transferred, 60);
        tracker.complete();
        assert_eq!(tracker.latest().fraction, 1.0);
    }

    #[test]
    fn injected_callback_fires_per_segment() {
        let seen: Arc<PlMutex<Vec<usize>>> = Arc::new(PlMutex::new(Vec::new()));
        let seen_cb = Arc::clone(&seen);
        let callback: ProgressCallback =
            Arc::new(move |p: &DownloadProgress| seen_cb.lock().push(p.completed_segments));
        let (tracker, _rx) = ProgressTracker::new(Uuid::new_v4(), Some(callback));
        tracker.begin_fetch(3);
        tracker.record_segment(1);
        tracker.record_segment(1);
        tracker.record_segment(1);
        assert_eq!(seen.lock().as_slice(), &[0, 1, 2, 3]);
    }

    #[test]
    fn terminal_states_are_terminal() {
        assert!(DownloadState::Completed.is_terminal());
        assert!(DownloadState::Cancelled.is_terminal());
        assert!(DownloadState::Failed(FailureClass::ReassemblyFailed).is_terminal());
        assert!(!DownloadState::FetchingSegments.is_terminal());
    }
}
