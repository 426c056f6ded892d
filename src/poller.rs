//! Background sampling of the receiver's transport state.
//!
//! One task per connected session. It samples at a fixed cadence, republishes
//! the result on `CastState` and hands the raw status to the bridge. The task
//! is scoped by a `CancellationToken` derived from the session, and
//! `stop_position_updates` awaits the task so no sample lands after it returns.

use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use log::{debug, info, warn};
use tokio::sync::broadcast::Sender;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

use crate::errors::CastError;
use crate::protocol::{CastMessage, Message};
use crate::receiver::{ReceiverSession, RemoteStatus};
use crate::state::{CastState, RemoteTransportSnapshot};

/// Receives every successful sample, after it has been published.
pub type SampleSink = Arc<dyn Fn(&RemoteStatus) + Send + Sync>;

struct PollerTask {
    cancel: CancellationToken,
    handle: JoinHandle<()>,
}

pub struct TransportPoller {
    interval: Duration,
    status_timeout: Duration,
    max_failures: u32,
    state: Arc<CastState>,
    bus_producer: Sender<Message>,
    running: Mutex<Option<PollerTask>>,
}

impl From<&RemoteStatus> for RemoteTransportSnapshot {
    fn from(status: &RemoteStatus) -> Self {
        Self {
            position_ms: status.position_ms,
            duration_ms: status.duration_ms,
            is_playing: status.is_playing,
            is_buffering: status.is_buffering,
            volume: status.volume.clamp(0.0, 1.0),
        }
    }
}

impl TransportPoller {
    pub fn new(
        interval: Duration,
        status_timeout: Duration,
        max_failures: u32,
        state: Arc<CastState>,
        bus_producer: Sender<Message>,
    ) -> Self {
        Self {
            interval,
            status_timeout,
            max_failures: max_failures.max(1),
            state,
            bus_producer,
            running: Mutex::new(None),
        }
    }

    fn running(&self) -> MutexGuard<'_, Option<PollerTask>> {
        match self.running.lock() {
            Ok(locked) => locked,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    pub fn is_running(&self) -> bool {
        self.running()
            .as_ref()
            .is_some_and(|task| !task.handle.is_finished())
    }

    /// Starts sampling `receiver`; a previously running loop is cancelled first.
    pub fn start(
        &self,
        receiver: Arc<dyn ReceiverSession>,
        session_scope: &CancellationToken,
        sink: SampleSink,
    ) {
        let cancel = session_scope.child_token();
        let handle = tokio::spawn(poll_loop(
            receiver,
            cancel.clone(),
            self.interval,
            self.status_timeout,
            self.max_failures,
            Arc::clone(&self.state),
            self.bus_producer.clone(),
            sink,
        ));
        let previous = self.running().replace(PollerTask { cancel, handle });
        if let Some(previous) = previous {
            previous.cancel.cancel();
            previous.handle.abort();
        }
        debug!("TransportPoller: started, interval={:?}", self.interval);
    }

    /// Cancels the loop and waits for it to finish.
    pub async fn stop_position_updates(&self) {
        let Some(task) = self.running().take() else {
            return;
        };
        task.cancel.cancel();
        if let Err(err) = task.handle.await {
            if !err.is_cancelled() {
                warn!("TransportPoller: poll task ended abnormally: {}", err);
            }
        }
        debug!("TransportPoller: stopped");
    }
}

async fn poll_loop(
    receiver: Arc<dyn ReceiverSession>,
    cancel: CancellationToken,
    interval: Duration,
    status_timeout: Duration,
    max_failures: u32,
    state: Arc<CastState>,
    bus_producer: Sender<Message>,
    sink: SampleSink,
) {
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let mut consecutive_failures = 0u32;

    loop {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            _ = ticker.tick() => {}
        }
        let sample = tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            sample = tokio::time::timeout(status_timeout, receiver.status()) => {
                sample.unwrap_or_else(|_| Err(CastError::channel("status request timed out")))
            }
        };
        match sample {
            Ok(status) => {
                consecutive_failures = 0;
                state.publish_snapshot(&RemoteTransportSnapshot::from(&status));
                sink(&status);
            }
            Err(err) => {
                consecutive_failures += 1;
                warn!(
                    "TransportPoller: status sample failed ({}/{}): {}",
                    consecutive_failures, max_failures, err
                );
                if consecutive_failures >= max_failures {
                    info!("TransportPoller: receiver unreachable, stopping updates");
                    let _ = bus_producer.send(Message::Cast(CastMessage::ReceiverUnreachable {
                        reason: err.to_string(),
                    }));
                    break;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::{SampleSink, TransportPoller};
    use crate::protocol::{CastMessage, Message};
    use crate::receiver::fake::FakeReceiver;
    use crate::receiver::RemoteStatus;
    use crate::state::CastState;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use std::time::Duration;
    use tokio::sync::broadcast;
    use tokio_util::sync::CancellationToken;

    fn counting_sink() -> (SampleSink, Arc<AtomicUsize>) {
        let count = Arc::new(AtomicUsize::new(0));
        let sink_count = Arc::clone(&count);
        (
            Arc::new(move |_status: &RemoteStatus| {
                sink_count.fetch_add(1, Ordering::SeqCst);
            }),
            count,
        )
    }

    fn poller(state: Arc<CastState>) -> (TransportPoller, broadcast::Receiver<Message>) {
        let (bus_sender, bus_receiver) = broadcast::channel(16);
        (
            TransportPoller::new(
                Duration::from_millis(500),
                Duration::from_millis(200),
                3,
                state,
                bus_sender,
            ),
            bus_receiver,
        )
    }

    #[tokio::test(start_paused = true)]
    async fn test_samples_are_published_at_fixed_cadence() {
        let state = Arc::new(CastState::new());
        let (poller, _bus) = poller(Arc::clone(&state));
        let receiver = FakeReceiver::new();
        receiver.set_status(RemoteStatus {
            position_ms: 12_000,
            duration_ms: 180_000,
            is_playing: true,
            is_buffering: false,
            volume: 0.4,
            current_item_id: Some("A".to_string()),
        });
        let (sink, samples) = counting_sink();

        poller.start(Arc::new(receiver.clone()), &CancellationToken::new(), sink);
        tokio::time::sleep(Duration::from_millis(1_250)).await;

        // Immediate first tick, then at 500ms and 1000ms.
        assert_eq!(receiver.status_requests(), 3);
        assert_eq!(samples.load(Ordering::SeqCst), 3);
        assert_eq!(state.position_ms(), 12_000);
        assert_eq!(state.duration_ms(), 180_000);
        assert!(state.is_playing());
        assert!((state.volume() - 0.4).abs() < f32::EPSILON);
        poller.stop_position_updates().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_is_immediate_and_final() {
        let state = Arc::new(CastState::new());
        let (poller, _bus) = poller(Arc::clone(&state));
        let receiver = FakeReceiver::new();
        let (sink, samples) = counting_sink();

        poller.start(Arc::new(receiver.clone()), &CancellationToken::new(), sink);
        tokio::time::sleep(Duration::from_millis(600)).await;
        poller.stop_position_updates().await;
        let after_stop = samples.load(Ordering::SeqCst);
        assert!(!poller.is_running());

        tokio::time::sleep(Duration::from_secs(5)).await;
        assert_eq!(samples.load(Ordering::SeqCst), after_stop);
        assert_eq!(receiver.status_requests(), after_stop);
    }

    #[tokio::test(start_paused = true)]
    async fn test_session_scope_cancellation_stops_loop() {
        let state = Arc::new(CastState::new());
        let (poller, _bus) = poller(Arc::clone(&state));
        let receiver = FakeReceiver::new();
        let scope = CancellationToken::new();
        let (sink, samples) = counting_sink();

        poller.start(Arc::new(receiver), &scope, sink);
        tokio::time::sleep(Duration::from_millis(100)).await;
        scope.cancel();
        tokio::time::sleep(Duration::from_secs(3)).await;

        assert_eq!(samples.load(Ordering::SeqCst), 1);
        assert!(!poller.is_running());
    }

    #[tokio::test(start_paused = true)]
    async fn test_repeated_failures_report_receiver_unreachable() {
        let state = Arc::new(CastState::new());
        let (poller, mut bus) = poller(Arc::clone(&state));
        let receiver = FakeReceiver::new();
        receiver.set_fail_status(true);
        let (sink, samples) = counting_sink();

        poller.start(Arc::new(receiver.clone()), &CancellationToken::new(), sink);
        tokio::time::sleep(Duration::from_secs(5)).await;

        assert_eq!(receiver.status_requests(), 3);
        assert_eq!(samples.load(Ordering::SeqCst), 0);
        assert!(matches!(
            bus.try_recv(),
            Ok(Message::Cast(CastMessage::ReceiverUnreachable { .. }))
        ));
        assert!(!poller.is_running());
    }
}
