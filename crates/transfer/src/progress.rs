use std::sync::{Arc, Mutex, PoisonError};

use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tracing::trace;

/// Step of a transfer a progress update belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransferPhase {
    Planning,
    Uploading,
    Committing,
    Downloading,
    Merging,
    Done,
}

impl std::fmt::Display for TransferPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Planning => "planning",
            Self::Uploading => "uploading",
            Self::Committing => "committing",
            Self::Downloading => "downloading",
            Self::Merging => "merging",
            Self::Done => "done",
        };
        f.write_str(s)
    }
}

/// A progress update. `percent` is in `[0, 100]` and never decreases
/// within one transfer.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct TransferProgress {
    pub percent: f64,
    pub phase: TransferPhase,
}

/// Fire-and-forget progress reporter.
///
/// Updates are pushed with `try_send`, so a slow consumer never stalls a
/// transfer; when the channel is full the update is dropped and a later
/// one supersedes it. Clones share the same high-water mark, which keeps
/// reported percentages monotonic even across scoped sub-sinks.
#[derive(Debug, Clone)]
pub struct ProgressSink {
    tx: Option<mpsc::Sender<TransferProgress>>,
    high_water: Arc<Mutex<f64>>,
    /// Overall percentage this sink's 0% maps to.
    base: f64,
    /// Overall percentage points this sink's 0..100 spans.
    span: f64,
    nested: bool,
}

impl ProgressSink {
    /// Creates a sink that forwards to `tx`.
    pub fn new(tx: mpsc::Sender<TransferProgress>) -> Self {
        Self {
            tx: Some(tx),
            high_water: Arc::new(Mutex::new(0.0)),
            base: 0.0,
            span: 100.0,
            nested: false,
        }
    }

    /// Creates a sink and the receiver its updates arrive on.
    pub fn channel(capacity: usize) -> (Self, mpsc::Receiver<TransferProgress>) {
        let (tx, rx) = mpsc::channel(capacity);
        (Self::new(tx), rx)
    }

    /// A sink that discards every update.
    pub fn disabled() -> Self {
        Self {
            tx: None,
            high_water: Arc::new(Mutex::new(0.0)),
            base: 0.0,
            span: 100.0,
            nested: false,
        }
    }

    /// Returns a sink whose own 0..100 covers `[start, start + span]` of
    /// this sink's range. Used to fold one file's progress into a batch.
    ///
    /// A nested sink reports its own `Done` as `Uploading`; only the
    /// outermost transfer says it is done.
    pub fn scoped(&self, start: f64, span: f64) -> Self {
        Self {
            tx: self.tx.clone(),
            high_water: Arc::clone(&self.high_water),
            base: self.base + self.span * start.clamp(0.0, 100.0) / 100.0,
            span: self.span * span.clamp(0.0, 100.0) / 100.0,
            nested: true,
        }
    }

    /// Reports `percent` (of this sink's range) in `phase`.
    pub fn emit(&self, phase: TransferPhase, percent: f64) {
        let Some(tx) = &self.tx else {
            return;
        };

        let local = if percent.is_finite() {
            percent.clamp(0.0, 100.0)
        } else {
            0.0
        };
        let mapped = (self.base + self.span * local / 100.0).min(100.0);

        let percent = {
            let mut high = self
                .high_water
                .lock()
                .unwrap_or_else(PoisonError::into_inner);
            if mapped > *high {
                *high = mapped;
            }
            *high
        };

        let phase = if self.nested && phase == TransferPhase::Done {
            TransferPhase::Uploading
        } else {
            phase
        };

        if tx.try_send(TransferProgress { percent, phase }).is_err() {
            trace!(percent, %phase, "progress update dropped");
        }
    }

    /// Highest percentage reported so far through any clone of this sink.
    pub fn reported(&self) -> f64 {
        *self
            .high_water
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }
}

impl Default for ProgressSink {
    fn default() -> Self {
        Self::disabled()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn drain(rx: &mut mpsc::Receiver<TransferProgress>) -> Vec<TransferProgress> {
        let mut out = Vec::new();
        while let Ok(p) = rx.try_recv() {
            out.push(p);
        }
        out
    }

    #[test]
    fn emits_in_order() {
        let (sink, mut rx) = ProgressSink::channel(8);
        sink.emit(TransferPhase::Planning, 0.0);
        sink.emit(TransferPhase::Uploading, 45.0);
        sink.emit(TransferPhase::Done, 100.0);

        let got = drain(&mut rx);
        assert_eq!(got.len(), 3);
        assert_eq!(got[1].percent, 45.0);
        assert_eq!(got[2].phase, TransferPhase::Done);
    }

    #[test]
    fn never_decreases() {
        let (sink, mut rx) = ProgressSink::channel(8);
        sink.emit(TransferPhase::Uploading, 50.0);
        sink.emit(TransferPhase::Uploading, 20.0);
        let got = drain(&mut rx);
        assert_eq!(got[1].percent, 50.0);
    }

    #[test]
    fn clamps_out_of_range() {
        let (sink, mut rx) = ProgressSink::channel(8);
        sink.emit(TransferPhase::Uploading, 250.0);
        sink.emit(TransferPhase::Uploading, f64::NAN);
        let got = drain(&mut rx);
        assert_eq!(got[0].percent, 100.0);
        assert_eq!(got[1].percent, 100.0);
    }

    #[test]
    fn full_channel_does_not_block() {
        let (sink, mut rx) = ProgressSink::channel(1);
        for i in 0..10 {
            sink.emit(TransferPhase::Uploading, i as f64);
        }
        assert_eq!(drain(&mut rx).len(), 1);
        assert_eq!(sink.reported(), 9.0);
    }

    #[test]
    fn disabled_sink_is_silent() {
        let sink = ProgressSink::disabled();
        sink.emit(TransferPhase::Uploading, 10.0);
        assert_eq!(sink.reported(), 0.0);
    }

    #[test]
    fn scoped_maps_into_parent_range() {
        let (sink, mut rx) = ProgressSink::channel(8);
        let child = sink.scoped(40.0, 50.0);
        child.emit(TransferPhase::Uploading, 50.0);
        child.emit(TransferPhase::Done, 100.0);

        let got = drain(&mut rx);
        assert_eq!(got[0].percent, 65.0);
        assert_eq!(got[1].percent, 90.0);
        assert_eq!(got[1].phase, TransferPhase::Uploading);
    }

    #[test]
    fn nested_scopes_compose() {
        let (sink, mut rx) = ProgressSink::channel(8);
        let outer = sink.scoped(50.0, 50.0);
        let inner = outer.scoped(50.0, 50.0);
        inner.emit(TransferPhase::Uploading, 100.0);
        assert_eq!(drain(&mut rx)[0].percent, 100.0);
    }

    #[test]
    fn scoped_shares_high_water() {
        let (sink, mut rx) = ProgressSink::channel(8);
        sink.scoped(0.0, 100.0).emit(TransferPhase::Uploading, 80.0);
        sink.scoped(50.0, 10.0).emit(TransferPhase::Uploading, 0.0);
        let got = drain(&mut rx);
        assert_eq!(got[1].percent, 80.0);
    }
}
