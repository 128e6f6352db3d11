use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;
use std::time::{Duration, Instant};

const WAIT_SLICE: Duration = Duration::from_millis(25);

/// Cooperative stop signal shared between a caller and a running query or batch.
///
/// Cancelling stops new page requests and new task dispatch; work already in
/// flight runs to a terminal state. Retry backoff waits through [`wait`] and
/// ends early on cancel.
///
/// [`wait`]: CancellationToken::wait
#[derive(Debug, Clone, Default)]
pub struct CancellationToken {
    cancelled: Arc<AtomicBool>,
}

impl CancellationToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }

    /// Sleeps for `delay` in short slices. Returns `true` if the whole delay
    /// passed, `false` as soon as the token is cancelled.
    pub fn wait(&self, delay: Duration) -> bool {
        let deadline = Instant::now() + delay;
        loop {
            if self.is_cancelled() {
                return false;
            }
            let now = Instant::now();
            if now >= deadline {
                return true;
            }
            thread::sleep(WAIT_SLICE.min(deadline - now));
        }
    }
}
