//! Multi-deadline timeouts for a single streamed response.
//!
//! A [`StreamTimeoutMonitor`] runs one background task holding up to three
//! deadlines:
//!
//! - **TTFT**: measured from start, disarmed for good by the first content signal
//! - **idle**: measured from start, pushed back by every activity signal
//! - **total**: fixed from start
//!
//! The first deadline to expire records its kind and cancels the shared
//! [`CancellationToken`]; the stream reader then maps that cancellation to
//! [`Error::StreamTimeout`](crate::Error::StreamTimeout).

use std::{
    fmt,
    future::pending,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, OnceLock,
    },
    time::Duration,
};

use thiserror::Error;
use tokio::{
    sync::{mpsc, Notify},
    time::{sleep_until, Instant},
};
use tokio_util::sync::CancellationToken;

/// Per-stream deadlines. `None` or a zero duration disables a deadline.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StreamTimeouts {
    pub ttft: Option<Duration>,
    pub idle: Option<Duration>,
    pub total: Option<Duration>,
}

impl StreamTimeouts {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_ttft(mut self, timeout: Duration) -> Self {
        self.ttft = Some(timeout);
        self
    }

    pub fn with_idle(mut self, timeout: Duration) -> Self {
        self.idle = Some(timeout);
        self
    }

    pub fn with_total(mut self, timeout: Duration) -> Self {
        self.total = Some(timeout);
        self
    }

    /// Effective duration for `kind`, or `None` when disabled.
    pub fn get(&self, kind: StreamTimeoutKind) -> Option<Duration> {
        let value = match kind {
            StreamTimeoutKind::Ttft => self.ttft,
            StreamTimeoutKind::Idle => self.idle,
            StreamTimeoutKind::Total => self.total,
        };
        value.filter(|d| !d.is_zero())
    }

    pub fn is_disabled(&self) -> bool {
        StreamTimeoutKind::ALL
            .iter()
            .all(|kind| self.get(*kind).is_none())
    }
}

/// Which deadline expired.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StreamTimeoutKind {
    Ttft,
    Idle,
    Total,
}

impl StreamTimeoutKind {
    const ALL: [StreamTimeoutKind; 3] = [
        StreamTimeoutKind::Ttft,
        StreamTimeoutKind::Idle,
        StreamTimeoutKind::Total,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            StreamTimeoutKind::Ttft => "ttft",
            StreamTimeoutKind::Idle => "idle",
            StreamTimeoutKind::Total => "total",
        }
    }
}

impl fmt::Display for StreamTimeoutKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A stream deadline expired.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("stream {kind} timeout after {}ms", .timeout.as_millis())]
pub struct StreamTimeoutError {
    pub kind: StreamTimeoutKind,
    pub timeout: Duration,
}

struct MonitorShared {
    timeouts: StreamTimeouts,
    activity: mpsc::Sender<()>,
    first_content: AtomicBool,
    first_content_notify: Notify,
    done: CancellationToken,
    fired: OnceLock<StreamTimeoutKind>,
}

/// Watches a stream for TTFT, idle and total deadlines.
///
/// A monitor started with no enabled deadline is inert: no task, no timers,
/// and every signal is a no-op. Dropping the monitor stops its task.
pub struct StreamTimeoutMonitor {
    shared: Option<Arc<MonitorShared>>,
}

impl StreamTimeoutMonitor {
    /// Starts watching. On expiry `cancel` is cancelled.
    ///
    /// Must be called inside a tokio runtime unless `timeouts` is disabled.
    pub fn start(timeouts: StreamTimeouts, cancel: &CancellationToken) -> Self {
        if timeouts.is_disabled() {
            return Self::inert();
        }

        let (tx, rx) = mpsc::channel(1);
        let shared = Arc::new(MonitorShared {
            timeouts,
            activity: tx,
            first_content: AtomicBool::new(false),
            first_content_notify: Notify::new(),
            done: CancellationToken::new(),
            fired: OnceLock::new(),
        });
        tokio::spawn(run_monitor(shared.clone(), rx, cancel.clone()));
        Self {
            shared: Some(shared),
        }
    }

    /// A monitor that never fires.
    pub fn inert() -> Self {
        Self { shared: None }
    }

    /// Records stream activity, pushing back the idle deadline. Never blocks;
    /// bursts coalesce into one pending signal.
    pub fn signal_activity(&self) {
        if let Some(shared) = &self.shared {
            let _ = shared.activity.try_send(());
        }
    }

    /// Records that content arrived, disarming TTFT. Idempotent.
    pub fn signal_first_content(&self) {
        if let Some(shared) = &self.shared {
            if !shared.first_content.swap(true, Ordering::AcqRel) {
                shared.first_content_notify.notify_one();
            }
        }
    }

    /// Stops the monitor task without firing.
    pub fn finish(&self) {
        if let Some(shared) = &self.shared {
            shared.done.cancel();
        }
    }

    /// The deadline that fired, if any.
    pub fn fired(&self) -> Option<StreamTimeoutKind> {
        self.shared
            .as_ref()
            .and_then(|shared| shared.fired.get().copied())
    }

    pub fn error(&self) -> Option<StreamTimeoutError> {
        let shared = self.shared.as_ref()?;
        let kind = *shared.fired.get()?;
        Some(StreamTimeoutError {
            kind,
            timeout: shared.timeouts.get(kind).unwrap_or_default(),
        })
    }

    /// False for an inert monitor.
    pub fn is_active(&self) -> bool {
        self.shared.is_some()
    }
}

impl Default for StreamTimeoutMonitor {
    fn default() -> Self {
        Self::inert()
    }
}

impl fmt::Debug for StreamTimeoutMonitor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StreamTimeoutMonitor")
            .field("timeouts", &self.shared.as_ref().map(|s| s.timeouts))
            .field("fired", &self.fired())
            .finish()
    }
}

impl Drop for StreamTimeoutMonitor {
    fn drop(&mut self) {
        self.finish();
    }
}

async fn sleep_until_opt(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => sleep_until(deadline).await,
        None => pending().await,
    }
}

async fn run_monitor(
    shared: Arc<MonitorShared>,
    mut activity: mpsc::Receiver<()>,
    cancel: CancellationToken,
) {
    let start = Instant::now();
    let timeouts = shared.timeouts;
    let idle = timeouts.get(StreamTimeoutKind::Idle);
    let total_deadline = timeouts.get(StreamTimeoutKind::Total).map(|d| start + d);
    let mut ttft_deadline = timeouts.get(StreamTimeoutKind::Ttft).map(|d| start + d);
    let mut idle_deadline = idle.map(|d| start + d);

    loop {
        if shared.first_content.load(Ordering::Acquire) {
            ttft_deadline = None;
        }

        let expired = tokio::select! {
            biased;
            _ = cancel.cancelled() => return,
            _ = shared.done.cancelled() => return,
            _ = shared.first_content_notify.notified(), if ttft_deadline.is_some() => {
                ttft_deadline = None;
                continue;
            }
            msg = activity.recv() => {
                if msg.is_none() {
                    return;
                }
                idle_deadline = idle.map(|d| Instant::now() + d);
                continue;
            }
            _ = sleep_until_opt(total_deadline) => StreamTimeoutKind::Total,
            _ = sleep_until_opt(ttft_deadline) => StreamTimeoutKind::Ttft,
            _ = sleep_until_opt(idle_deadline) => StreamTimeoutKind::Idle,
        };

        if shared.fired.set(expired).is_ok() {
            #[cfg(feature = "tracing")]
            tracing::warn!(
                kind = %expired,
                timeout_ms = timeouts.get(expired).unwrap_or_default().as_millis() as u64,
                "stream timeout fired"
            );
            cancel.cancel();
        }
        return;
    }
}
