//! Status/progress surface (component J): the callback contract the agent
//! fires on its event thread, plus the speed/ETA estimator that feeds
//! `on_progress`.

use crate::transfer::FileMetadata;
use std::collections::VecDeque;
use std::time::{Duration, Instant};

/// Coarse agent lifecycle state, mirrored 1:1 from the state machine in
/// `agent.rs` for UI consumption.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AgentState {
    Unpaired,
    Idle,
    Connecting,
    Authenticating,
    Connected,
    Degraded,
    Closed,
}

/// Error kind surfaced to the UI alongside a free-text detail string. Mirrors
/// the subset of `Error` variants that are user-visible rather than
/// purely internal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    Protocol,
    Auth,
    ConnectionLost,
    ChecksumMismatch,
    ExpiredOrUnknownTransfer,
    ClipboardUnavailable,
    Internal,
}

/// Callbacks fired on the agent's event thread. Exact wording of `detail`
/// strings is not contractual; callers should key UI behavior off `kind`/
/// `state`/ids, not string matching.
pub trait AgentEvents: Send + Sync {
    fn on_state(&self, state: AgentState) {
        let _ = state;
    }
    fn on_announced(&self, transfer_id: &str, files: &[FileMetadata]) {
        let _ = (transfer_id, files);
    }
    fn on_progress(&self, transfer_id: &str, bytes_done: u64, bytes_total: u64, speed_bps: f64, eta_s: f64) {
        let _ = (transfer_id, bytes_done, bytes_total, speed_bps, eta_s);
    }
    fn on_complete(&self, transfer_id: &str, paths: &[std::path::PathBuf]) {
        let _ = (transfer_id, paths);
    }
    fn on_error(&self, kind: ErrorKind, detail: &str) {
        let _ = (kind, detail);
    }
}

/// An `AgentEvents` that does nothing, for callers that don't need a UI.
#[derive(Default)]
pub struct NoopEvents;
impl AgentEvents for NoopEvents {}

/// Records every callback invocation for assertions in tests.
#[derive(Default)]
pub struct RecordingEvents {
    pub states: std::sync::Mutex<Vec<AgentState>>,
    pub announced: std::sync::Mutex<Vec<(String, usize)>>,
    pub progress: std::sync::Mutex<Vec<(String, u64, u64)>>,
    pub completed: std::sync::Mutex<Vec<(String, Vec<std::path::PathBuf>)>>,
    pub errors: std::sync::Mutex<Vec<(ErrorKind, String)>>,
}

impl AgentEvents for RecordingEvents {
    fn on_state(&self, state: AgentState) {
        self.states.lock().unwrap().push(state);
    }
    fn on_announced(&self, transfer_id: &str, files: &[FileMetadata]) {
        self.announced.lock().unwrap().push((transfer_id.to_string(), files.len()));
    }
    fn on_progress(&self, transfer_id: &str, bytes_done: u64, bytes_total: u64, _speed_bps: f64, _eta_s: f64) {
        self.progress.lock().unwrap().push((transfer_id.to_string(), bytes_done, bytes_total));
    }
    fn on_complete(&self, transfer_id: &str, paths: &[std::path::PathBuf]) {
        self.completed.lock().unwrap().push((transfer_id.to_string(), paths.to_vec()));
    }
    fn on_error(&self, kind: ErrorKind, detail: &str) {
        self.errors.lock().unwrap().push((kind, detail.to_string()));
    }
}

/// Exponential moving average of transfer speed over a 2 s window, used to
/// compute `on_progress`'s `speed_bps`/`eta_s`.
pub struct SpeedEstimator {
    window: Duration,
    samples: VecDeque<(Instant, u64)>,
    ema_bps: f64,
}

impl SpeedEstimator {
    pub fn new() -> Self {
        Self { window: Duration::from_secs(2), samples: VecDeque::new(), ema_bps: 0.0 }
    }

    /// Records a new `bytes_done` reading and returns the current speed
    /// estimate in bytes/sec.
    pub fn sample(&mut self, bytes_done: u64) -> f64 {
        let now = Instant::now();
        self.samples.push_back((now, bytes_done));
        while let Some(&(t, _)) = self.samples.front() {
            if now.duration_since(t) > self.window {
                self.samples.pop_front();
            } else {
                break;
            }
        }
        if let (Some(&(t0, b0)), Some(&(t1, b1))) = (self.samples.front(), self.samples.back()) {
            let dt = t1.duration_since(t0).as_secs_f64();
            if dt > 0.0 && b1 >= b0 {
                let instantaneous = (b1 - b0) as f64 / dt;
                // EMA with alpha chosen so the 2 s window dominates recent history.
                let alpha = 0.3;
                self.ema_bps = alpha * instantaneous + (1.0 - alpha) * self.ema_bps;
            }
        }
        self.ema_bps
    }

    pub fn eta_seconds(bytes_total: u64, bytes_done: u64, speed_bps: f64) -> f64 {
        let remaining = bytes_total.saturating_sub(bytes_done) as f64;
        remaining / speed_bps.max(1.0)
    }
}

impl Default for SpeedEstimator {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn eta_is_remaining_over_speed() {
        assert_eq!(SpeedEstimator::eta_seconds(1000, 500, 100.0), 5.0);
    }

    #[test]
    fn eta_does_not_divide_by_zero_speed() {
        assert_eq!(SpeedEstimator::eta_seconds(1000, 0, 0.0), 1000.0);
    }

    #[test]
    fn speed_estimator_tracks_increasing_progress() {
        let mut est = SpeedEstimator::new();
        assert_eq!(est.sample(0), 0.0);
        std::thread::sleep(Duration::from_millis(50));
        let speed = est.sample(1000);
        assert!(speed > 0.0);
    }

    #[test]
    fn recording_events_capture_state_transitions() {
        let events = RecordingEvents::default();
        events.on_state(AgentState::Idle);
        events.on_state(AgentState::Connecting);
        assert_eq!(*events.states.lock().unwrap(), vec![AgentState::Idle, AgentState::Connecting]);
    }
}
