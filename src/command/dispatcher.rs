//! Command dispatcher - serializes commands onto the coordinator radio

use super::inflight::{self, SlotGuard, Timing};
use super::queue::{Admission, CommandQueue, QueuedCommand};
use super::Command;
use crate::error::{CommandError, DispatchError};
use crate::transport::MeshTransport;
use meshcoord_shared::defaults;
use serde::Deserialize;
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, error, trace};

/// Dispatcher limits and timing
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct DispatcherConfig {
    /// Queued commands beyond this are dropped
    pub max_queue_len: usize,
    /// Minimum gap between two commands on the radio
    pub pacing_ms: u64,
    /// Response wait for commands without their own timeout
    pub max_wait_ms: u64,
    /// How long a timed-out command may hold the radio for a late response
    pub late_response_guard_ms: u64,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            max_queue_len: defaults::QUEUE_MAX_LEN,
            pacing_ms: defaults::QUEUE_PAUSE_MS,
            max_wait_ms: defaults::QUEUE_MAX_WAIT_MS,
            late_response_guard_ms: defaults::LATE_RESPONSE_GUARD_MS,
        }
    }
}

impl DispatcherConfig {
    fn timing(&self) -> Timing {
        Timing {
            pacing: Duration::from_millis(self.pacing_ms),
            max_wait: Duration::from_millis(self.max_wait_ms),
            late_response_guard: Duration::from_millis(self.late_response_guard_ms),
        }
    }
}

/// Snapshot of the dispatcher state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DispatcherStats {
    /// Commands waiting for the radio
    pub queued: usize,
    /// Whether a command currently holds the radio
    pub in_flight: bool,
}

/// Pending result of an enqueued command
#[derive(Debug)]
pub struct CommandTicket {
    rx: oneshot::Receiver<Result<Value, CommandError>>,
}

impl CommandTicket {
    /// Wait for the command to resolve.
    ///
    /// Returns `None` when the command was superseded by a newer one or
    /// dropped because the queue was full.
    pub async fn outcome(self) -> Option<Result<Value, CommandError>> {
        self.rx.await.ok()
    }
}

enum Request {
    Enqueue(QueuedCommand),
    Stats(oneshot::Sender<DispatcherStats>),
}

/// Handle to the dispatch loop
#[derive(Clone)]
pub struct CommandDispatcher {
    requests: mpsc::UnboundedSender<Request>,
}

impl CommandDispatcher {
    /// Create a dispatcher and start its loop
    pub fn new(transport: Arc<dyn MeshTransport>, config: DispatcherConfig) -> Self {
        let (requests, requests_rx) = mpsc::unbounded_channel();

        tokio::spawn(async move {
            dispatch_loop(transport, config, requests_rx).await;
        });

        Self { requests }
    }

    /// Queue a command; returns without waiting for the radio
    pub fn enqueue(&self, command: Command) -> Result<CommandTicket, DispatchError> {
        let (completion, rx) = oneshot::channel();
        self.requests
            .send(Request::Enqueue(QueuedCommand {
                command,
                completion,
            }))
            .map_err(|_| DispatchError::Closed)?;
        Ok(CommandTicket { rx })
    }

    pub async fn stats(&self) -> Result<DispatcherStats, DispatchError> {
        let (tx, rx) = oneshot::channel();
        self.requests
            .send(Request::Stats(tx))
            .map_err(|_| DispatchError::Closed)?;
        rx.await.map_err(|_| DispatchError::Closed)
    }
}

/// Main dispatch loop - owns the queue and the in-flight slot
async fn dispatch_loop(
    transport: Arc<dyn MeshTransport>,
    config: DispatcherConfig,
    mut requests: mpsc::UnboundedReceiver<Request>,
) {
    let timing = config.timing();
    let (release_tx, mut release_rx) = mpsc::unbounded_channel::<u64>();
    let mut queue = CommandQueue::new(config.max_queue_len);
    let mut in_flight: Option<u64> = None;
    let mut generation: u64 = 0;

    loop {
        tokio::select! {
            request = requests.recv() => match request {
                Some(Request::Enqueue(queued)) => match queue.admit(queued) {
                    Admission::Queued { superseded } => {
                        trace!("dropped {} queued commands", superseded);
                    }
                    Admission::Rejected { superseded } => {
                        trace!("dropped {} queued commands", superseded);
                        error!("maximum command queue length exceeded, ignoring command");
                    }
                },
                Some(Request::Stats(reply)) => {
                    let _ = reply.send(DispatcherStats {
                        queued: queue.len(),
                        in_flight: in_flight.is_some(),
                    });
                }
                None => break,
            },
            Some(released) = release_rx.recv() => {
                if in_flight == Some(released) {
                    in_flight = None;
                } else {
                    trace!("ignoring stale slot release {}", released);
                }
            }
        }

        if in_flight.is_none() {
            in_flight = dispatch_next(&mut queue, &transport, timing, &release_tx, &mut generation);
        }
    }

    let dropped = queue.clear();
    debug!("command dispatcher stopped ({} queued commands dropped)", dropped);
}

/// Pop commands until one claims the slot; unresolvable targets fail on the spot
fn dispatch_next(
    queue: &mut CommandQueue,
    transport: &Arc<dyn MeshTransport>,
    timing: Timing,
    release_tx: &mpsc::UnboundedSender<u64>,
    generation: &mut u64,
) -> Option<u64> {
    while let Some(QueuedCommand {
        command,
        completion,
    }) = queue.pop_front()
    {
        let Some(endpoint) = transport.find_endpoint(&command.target, command.endpoint) else {
            error!("endpoint not found {} {}", command.target, command.endpoint);
            let _ = completion.send(Err(CommandError::EndpointNotFound {
                address: command.target,
                endpoint: command.endpoint,
            }));
            continue;
        };

        *generation += 1;
        debug!("dispatching {}", command);
        let guard = SlotGuard::new(*generation, release_tx.clone());
        tokio::spawn(inflight::run(
            endpoint,
            QueuedCommand {
                command,
                completion,
            },
            timing,
            guard,
        ));
        return Some(*generation);
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::fake::FakeTransport;
    use serde_json::json;
    use tokio::time::Instant;

    fn dispatcher(transport: &Arc<FakeTransport>) -> CommandDispatcher {
        CommandDispatcher::new(transport.clone(), DispatcherConfig::default())
    }

    fn toggle(target: &str) -> Command {
        Command::new(target, 1, "genOnOff", "toggle")
    }

    #[tokio::test(start_paused = true)]
    async fn test_command_resolves_with_response() {
        let transport = Arc::new(FakeTransport::new());
        transport.add_endpoint("0x01", 1);
        let dispatcher = dispatcher(&transport);

        let ticket = dispatcher.enqueue(toggle("0x01")).expect("enqueue");
        let outcome = ticket.outcome().await.expect("resolved");
        assert_eq!(outcome, Ok(json!({"status": 0})));
        assert_eq!(transport.invocations().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_at_most_one_in_flight() {
        let transport = Arc::new(FakeTransport::new());
        transport.set_response_delay(Duration::from_millis(30));
        for i in 0..5 {
            transport.add_endpoint(&format!("0x0{}", i), 1);
        }
        let dispatcher = dispatcher(&transport);

        let tickets: Vec<_> = (0..5)
            .map(|i| dispatcher.enqueue(toggle(&format!("0x0{}", i))).expect("enqueue"))
            .collect();
        for ticket in tickets {
            assert!(matches!(ticket.outcome().await, Some(Ok(_))));
        }

        assert_eq!(transport.invocations().len(), 5);
        assert_eq!(transport.max_active_invocations(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_superseded_command_is_never_invoked() {
        let transport = Arc::new(FakeTransport::new());
        transport.set_response_delay(Duration::from_millis(50));
        transport.add_endpoint("0x01", 1);
        transport.add_endpoint("0x02", 1);
        let dispatcher = dispatcher(&transport);

        // Occupies the radio so the next two stay queued
        let busy = dispatcher.enqueue(toggle("0x02")).expect("enqueue");
        let older = dispatcher
            .enqueue(toggle("0x01").with_field("a", 1))
            .expect("enqueue");
        let newer = dispatcher
            .enqueue(toggle("0x01").with_field("a", 2).with_field("b", 3))
            .expect("enqueue");

        assert!(older.outcome().await.is_none());
        assert!(matches!(newer.outcome().await, Some(Ok(_))));
        assert!(matches!(busy.outcome().await, Some(Ok(_))));

        let calls = transport.invocations();
        assert_eq!(calls.len(), 2);
        assert_eq!(calls[1].1.payload.get("a"), Some(&json!(2)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_overflow_drops_new_command() {
        let transport = Arc::new(FakeTransport::new());
        transport.set_response_delay(Duration::from_secs(1));
        transport.add_endpoint("0xff", 1);
        let config = DispatcherConfig {
            max_queue_len: 2,
            ..Default::default()
        };
        let dispatcher = CommandDispatcher::new(transport.clone(), config);

        let _busy = dispatcher.enqueue(toggle("0xff")).expect("enqueue");
        let _a = dispatcher.enqueue(toggle("0x01")).expect("enqueue");
        let _b = dispatcher.enqueue(toggle("0x02")).expect("enqueue");
        let rejected = dispatcher.enqueue(toggle("0x03")).expect("enqueue");

        let stats = dispatcher.stats().await.expect("stats");
        assert_eq!(stats, DispatcherStats { queued: 2, in_flight: true });
        assert!(rejected.outcome().await.is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_endpoint_not_found_fails_fast() {
        let transport = Arc::new(FakeTransport::new());
        transport.add_endpoint("0x02", 1);
        let dispatcher = dispatcher(&transport);

        let start = Instant::now();
        let missing = dispatcher.enqueue(toggle("0x01")).expect("enqueue");
        let next = dispatcher.enqueue(toggle("0x02")).expect("enqueue");

        assert_eq!(
            missing.outcome().await,
            Some(Err(CommandError::EndpointNotFound {
                address: "0x01".into(),
                endpoint: 1
            }))
        );
        assert_eq!(start.elapsed(), Duration::ZERO);
        assert!(matches!(next.outcome().await, Some(Ok(_))));
        assert_eq!(transport.invocations().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_fast_response_is_paced() {
        let transport = Arc::new(FakeTransport::new());
        transport.set_response_delay(Duration::from_millis(30));
        transport.add_endpoint("0x01", 1);
        transport.add_endpoint("0x02", 1);
        let dispatcher = dispatcher(&transport);

        let start = Instant::now();
        let first = dispatcher.enqueue(toggle("0x01")).expect("enqueue");
        let second = dispatcher.enqueue(toggle("0x02")).expect("enqueue");
        first.outcome().await.expect("resolved").expect("ok");
        assert_eq!(start.elapsed(), Duration::from_millis(30));

        second.outcome().await.expect("resolved").expect("ok");
        // 30ms response + 70ms pause + 30ms response
        assert_eq!(start.elapsed(), Duration::from_millis(130));
    }

    #[tokio::test(start_paused = true)]
    async fn test_slow_response_is_not_paced() {
        let transport = Arc::new(FakeTransport::new());
        transport.set_response_delay(Duration::from_millis(250));
        transport.add_endpoint("0x01", 1);
        transport.add_endpoint("0x02", 1);
        let dispatcher = dispatcher(&transport);

        let start = Instant::now();
        let _first = dispatcher.enqueue(toggle("0x01")).expect("enqueue");
        let second = dispatcher.enqueue(toggle("0x02")).expect("enqueue");
        second.outcome().await.expect("resolved").expect("ok");
        assert_eq!(start.elapsed(), Duration::from_millis(500));
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_holds_slot_until_late_guard() {
        let transport = Arc::new(FakeTransport::new());
        transport.add_silent_endpoint("0x01", 1);
        transport.add_endpoint("0x02", 1);
        let dispatcher = dispatcher(&transport);

        let start = Instant::now();
        let silent = dispatcher
            .enqueue(toggle("0x01").with_timeout(Duration::from_millis(200)))
            .expect("enqueue");
        let next = dispatcher.enqueue(toggle("0x02")).expect("enqueue");

        assert_eq!(
            silent.outcome().await,
            Some(Err(CommandError::Timeout { after_ms: 200 }))
        );
        assert_eq!(start.elapsed(), Duration::from_millis(200));

        next.outcome().await.expect("resolved").expect("ok");
        // 200ms timeout + 1000ms late guard
        assert_eq!(start.elapsed(), Duration::from_millis(1200));
    }

    #[tokio::test(start_paused = true)]
    async fn test_late_response_releases_slot() {
        let transport = Arc::new(FakeTransport::new());
        transport.set_response_delay(Duration::from_millis(300));
        transport.add_endpoint("0x01", 1);
        transport.add_endpoint("0x02", 1);
        let dispatcher = dispatcher(&transport);

        let start = Instant::now();
        let slow = dispatcher
            .enqueue(toggle("0x01").with_timeout(Duration::from_millis(100)))
            .expect("enqueue");
        let next = dispatcher.enqueue(toggle("0x02")).expect("enqueue");

        assert!(matches!(
            slow.outcome().await,
            Some(Err(CommandError::Timeout { .. }))
        ));
        next.outcome().await.expect("resolved").expect("ok");
        // Slot freed by the late response at 300ms, then 300ms for the next one
        assert_eq!(start.elapsed(), Duration::from_millis(600));
    }

    #[tokio::test(start_paused = true)]
    async fn test_non_blocking_command_frees_slot_after_pacing() {
        let transport = Arc::new(FakeTransport::new());
        transport.set_response_delay(Duration::from_millis(500));
        transport.add_endpoint("0x01", 1);
        transport.add_endpoint("0x02", 1);
        let dispatcher = dispatcher(&transport);

        let start = Instant::now();
        let background = dispatcher
            .enqueue(toggle("0x01").non_blocking())
            .expect("enqueue");
        let next = dispatcher.enqueue(toggle("0x02")).expect("enqueue");

        next.outcome().await.expect("resolved").expect("ok");
        assert_eq!(start.elapsed(), Duration::from_millis(600));
        assert!(matches!(background.outcome().await, Some(Ok(_))));
    }

    #[tokio::test(start_paused = true)]
    async fn test_suppressed_response_frees_slot_after_pacing() {
        let transport = Arc::new(FakeTransport::new());
        transport.add_silent_endpoint("0x01", 1);
        transport.add_endpoint("0x02", 1);
        let dispatcher = dispatcher(&transport);

        let start = Instant::now();
        let fire = dispatcher
            .enqueue(toggle("0x01").suppress_default_response())
            .expect("enqueue");
        let next = dispatcher.enqueue(toggle("0x02")).expect("enqueue");

        assert_eq!(fire.outcome().await, Some(Ok(Value::Null)));
        assert_eq!(start.elapsed(), Duration::from_millis(100));

        next.outcome().await.expect("resolved").expect("ok");
        assert_eq!(start.elapsed(), Duration::from_millis(100));
    }

    #[tokio::test(start_paused = true)]
    async fn test_suppressed_response_reports_send_result() {
        let transport = Arc::new(FakeTransport::new());
        transport.add_endpoint("0x01", 1);
        let dispatcher = dispatcher(&transport);

        let start = Instant::now();
        let sent = dispatcher
            .enqueue(toggle("0x01").suppress_default_response())
            .expect("enqueue");
        assert_eq!(sent.outcome().await, Some(Ok(json!({"status": 0}))));
        assert_eq!(start.elapsed(), Duration::ZERO);

        transport.fail_invocations("no route");
        let failed = dispatcher
            .enqueue(toggle("0x01").suppress_default_response())
            .expect("enqueue");
        assert_eq!(
            failed.outcome().await,
            Some(Err(CommandError::Transport("no route".into())))
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_zero_timeout_uses_default_wait() {
        let transport = Arc::new(FakeTransport::new());
        transport.add_silent_endpoint("0x01", 1);
        let dispatcher = dispatcher(&transport);

        let start = Instant::now();
        let silent = dispatcher
            .enqueue(toggle("0x01").with_timeout(Duration::ZERO))
            .expect("enqueue");

        assert_eq!(
            silent.outcome().await,
            Some(Err(CommandError::Timeout { after_ms: 5000 }))
        );
        assert_eq!(start.elapsed(), Duration::from_secs(5));
    }

    #[tokio::test(start_paused = true)]
    async fn test_transport_error_is_reported() {
        let transport = Arc::new(FakeTransport::new());
        transport.add_endpoint("0x01", 1);
        transport.fail_invocations("device busy");
        let dispatcher = dispatcher(&transport);

        let ticket = dispatcher.enqueue(toggle("0x01")).expect("enqueue");
        assert_eq!(
            ticket.outcome().await,
            Some(Err(CommandError::Transport("device busy".into())))
        );
        assert_eq!(dispatcher.stats().await.expect("stats").queued, 0);
    }
}
