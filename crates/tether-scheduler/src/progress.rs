use std::sync::{
    atomic::{AtomicBool, AtomicU64, Ordering},
    Arc,
};

use parking_lot::Mutex;
use tokio::sync::broadcast;

use crate::{CancellationToken, Cancelled};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ProgressId(pub u64);

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProgressEvent {
    Begin {
        id: ProgressId,
        title: String,
    },
    Report {
        id: ProgressId,
        message: Option<String>,
        percentage: Option<u32>,
    },
    End {
        id: ProgressId,
        message: Option<String>,
    },
}

pub type ProgressReceiver = broadcast::Receiver<ProgressEvent>;

#[derive(Clone)]
pub struct ProgressSender {
    tx: broadcast::Sender<ProgressEvent>,
    next_id: Arc<AtomicU64>,
}

impl ProgressSender {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self {
            tx,
            next_id: Arc::new(AtomicU64::new(1)),
        }
    }

    pub fn subscribe(&self) -> ProgressReceiver {
        self.tx.subscribe()
    }

    pub fn start(&self, title: impl Into<String>) -> Progress {
        let id = ProgressId(self.next_id.fetch_add(1, Ordering::Relaxed));
        let _ = self.tx.send(ProgressEvent::Begin {
            id,
            title: title.into(),
        });
        Progress {
            id,
            tx: self.tx.clone(),
            finished: Arc::new(AtomicBool::new(false)),
        }
    }
}

impl Default for ProgressSender {
    fn default() -> Self {
        Self::new(256)
    }
}

#[derive(Clone)]
pub struct Progress {
    id: ProgressId,
    tx: broadcast::Sender<ProgressEvent>,
    finished: Arc<AtomicBool>,
}

impl Progress {
    pub fn id(&self) -> ProgressId {
        self.id
    }

    pub fn report(&self, message: impl Into<Option<String>>, percentage: Option<u32>) {
        let _ = self.tx.send(ProgressEvent::Report {
            id: self.id,
            message: message.into(),
            percentage,
        });
    }

    pub fn finish(&self, message: impl Into<Option<String>>) {
        let message = message.into();
        if self
            .finished
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
        {
            let _ = self.tx.send(ProgressEvent::End {
                id: self.id,
                message,
            });
        }
    }

    pub fn is_finished(&self) -> bool {
        self.finished.load(Ordering::SeqCst)
    }
}

impl Drop for Progress {
    fn drop(&mut self) {
        // Clones share `finished`; only the last one standing should end the
        // progress implicitly.
        if Arc::strong_count(&self.finished) == 1 {
            self.finish(None);
        }
    }
}

#[derive(Default)]
struct IndicatorState {
    text: String,
    fraction: f64,
}

/// Cancellable progress for long-running background work.
///
/// Text and fraction updates are mirrored to the underlying [`Progress`] as
/// report events; cancellation goes through a [`CancellationToken`] that
/// cooperating workers poll via [`ProgressIndicator::check_canceled`].
#[derive(Clone)]
pub struct ProgressIndicator {
    progress: Progress,
    token: CancellationToken,
    state: Arc<Mutex<IndicatorState>>,
}

impl ProgressIndicator {
    pub fn new(sender: &ProgressSender, title: impl Into<String>) -> Self {
        Self::with_token(sender, title, CancellationToken::new())
    }

    pub fn with_token(
        sender: &ProgressSender,
        title: impl Into<String>,
        token: CancellationToken,
    ) -> Self {
        Self {
            progress: sender.start(title),
            token,
            state: Arc::new(Mutex::new(IndicatorState::default())),
        }
    }

    pub fn id(&self) -> ProgressId {
        self.progress.id()
    }

    pub fn text(&self) -> String {
        self.state.lock().text.clone()
    }

    pub fn set_text(&self, text: impl Into<String>) {
        let text = text.into();
        let percentage = {
            let mut state = self.state.lock();
            state.text = text.clone();
            percentage(state.fraction)
        };
        self.progress.report(Some(text), Some(percentage));
    }

    pub fn fraction(&self) -> f64 {
        self.state.lock().fraction
    }

    pub fn set_fraction(&self, fraction: f64) {
        let fraction = fraction.clamp(0.0, 1.0);
        let text = {
            let mut state = self.state.lock();
            state.fraction = fraction;
            state.text.clone()
        };
        self.progress.report(Some(text), Some(percentage(fraction)));
    }

    pub fn token(&self) -> CancellationToken {
        self.token.clone()
    }

    pub fn cancel(&self) {
        self.token.cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        self.token.is_cancelled()
    }

    pub fn check_canceled(&self) -> Result<(), Cancelled> {
        if self.token.is_cancelled() {
            Err(Cancelled)
        } else {
            Ok(())
        }
    }

    pub fn finish(&self, message: impl Into<Option<String>>) {
        self.progress.finish(message);
    }
}

fn percentage(fraction: f64) -> u32 {
    (fraction * 100.0).round() as u32
}
