use std::collections::VecDeque;
use std::sync::Mutex;
use std::time::Duration;

/// The provider operations we time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum OperationKind {
    /// Speech-to-text request, utterance submitted to transcript returned.
    Stt,
    /// Speech synthesis, request sent to first audio byte received.
    Tts,
}

/// Rolling window of per-operation latencies, milliseconds.
///
/// One recorder is created at startup and an `Arc` of it is handed to every
/// session, so the window is process-wide. It is diagnostic only: nothing
/// reads it to make control-flow decisions.
#[derive(Debug)]
pub struct LatencyRecorder {
    capacity: usize,
    stt: Mutex<VecDeque<u64>>,
    tts: Mutex<VecDeque<u64>>,
}

pub const DEFAULT_WINDOW_CAPACITY: usize = 128;

impl LatencyRecorder {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity,
            stt: Mutex::new(VecDeque::with_capacity(capacity)),
            tts: Mutex::new(VecDeque::with_capacity(capacity)),
        }
    }

    fn window(&self, kind: OperationKind) -> &Mutex<VecDeque<u64>> {
        match kind {
            OperationKind::Stt => &self.stt,
            OperationKind::Tts => &self.tts,
        }
    }

    /// Append a sample, evicting the oldest once the window is full.
    pub fn record(&self, kind: OperationKind, elapsed: Duration) {
        let millis = elapsed.as_millis() as u64;
        let Ok(mut window) = self.window(kind).lock() else {
            tracing::error!("latency window lock poisoned, dropping sample");
            return;
        };
        if window.len() == self.capacity {
            window.pop_front();
        }
        window.push_back(millis);
    }

    /// Current contents of one window, oldest first.
    pub fn snapshot(&self, kind: OperationKind) -> Vec<u64> {
        self.window(kind)
            .lock()
            .map(|w| w.iter().copied().collect())
            .unwrap_or_default()
    }

    pub fn mean_millis(&self, kind: OperationKind) -> Option<u64> {
        let samples = self.snapshot(kind);
        if samples.is_empty() {
            return None;
        }
        Some(samples.iter().sum::<u64>() / samples.len() as u64)
    }
}

impl Default for LatencyRecorder {
    fn default() -> Self {
        Self::new(DEFAULT_WINDOW_CAPACITY)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn windows_are_partitioned_by_kind() {
        let recorder = LatencyRecorder::new(8);
        recorder.record(OperationKind::Stt, Duration::from_millis(120));
        recorder.record(OperationKind::Tts, Duration::from_millis(45));

        assert_eq!(recorder.snapshot(OperationKind::Stt), vec![120]);
        assert_eq!(recorder.snapshot(OperationKind::Tts), vec![45]);
    }

    #[test]
    fn oldest_sample_is_evicted_at_capacity() {
        let recorder = LatencyRecorder::new(3);
        for ms in [10, 20, 30, 40] {
            recorder.record(OperationKind::Stt, Duration::from_millis(ms));
        }
        assert_eq!(recorder.snapshot(OperationKind::Stt), vec![20, 30, 40]);
    }

    #[test]
    fn mean_over_empty_window_is_none() {
        let recorder = LatencyRecorder::new(4);
        assert_eq!(recorder.mean_millis(OperationKind::Tts), None);
        recorder.record(OperationKind::Tts, Duration::from_millis(100));
        recorder.record(OperationKind::Tts, Duration::from_millis(200));
        assert_eq!(recorder.mean_millis(OperationKind::Tts), Some(150));
    }
}
