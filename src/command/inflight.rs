//! Execution of the single in-flight command

use super::queue::{Completion, QueuedCommand};
use crate::error::CommandError;
use crate::transport::{Endpoint, EndpointCall};
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::{sleep, timeout, Instant};
use tracing::{debug, trace, warn};

/// Radio timing applied around each command
#[derive(Debug, Clone, Copy)]
pub(super) struct Timing {
    /// Minimum gap between two commands
    pub pacing: Duration,
    /// Response wait for commands without their own timeout
    pub max_wait: Duration,
    /// How long a timed-out blocking command keeps the slot
    pub late_response_guard: Duration,
}

/// Claim on the in-flight slot; dropping it hands the slot back to the dispatcher
#[derive(Debug)]
pub(super) struct SlotGuard {
    generation: u64,
    release: mpsc::UnboundedSender<u64>,
}

impl SlotGuard {
    pub fn new(generation: u64, release: mpsc::UnboundedSender<u64>) -> Self {
        Self {
            generation,
            release,
        }
    }
}

impl Drop for SlotGuard {
    fn drop(&mut self) {
        // Dispatcher gone means nobody waits for the slot anymore
        let _ = self.release.send(self.generation);
    }
}

/// Run one dispatched command and release the slot when the radio may be used again
pub(super) async fn run(
    endpoint: Arc<dyn Endpoint>,
    queued: QueuedCommand,
    timing: Timing,
    guard: SlotGuard,
) {
    let QueuedCommand {
        command,
        completion,
    } = queued;
    let call = command.endpoint_call();
    // A zero timeout means "use the default"
    let wait = command
        .timeout
        .filter(|wait| !wait.is_zero())
        .unwrap_or(timing.max_wait);

    if command.config.suppress_default_response {
        run_unacknowledged(endpoint, call, wait, timing, completion).await;
    } else if !command.blocks_queue {
        // The result arrives on its own; the radio is free after the pacing gap
        tokio::spawn(await_response(endpoint, call, wait, completion));
        sleep(timing.pacing).await;
    } else {
        run_blocking(endpoint, call, wait, timing, completion).await;
    }

    drop(guard);
}

/// Send a command the device will not answer.
///
/// The caller gets the send result if the endpoint reports it within the
/// pacing gap, otherwise `Null` once the gap has passed. Never a timeout.
async fn run_unacknowledged(
    endpoint: Arc<dyn Endpoint>,
    call: EndpointCall,
    wait: Duration,
    timing: Timing,
    completion: Completion,
) {
    let started = Instant::now();
    let mut sent = tokio::spawn(async move {
        match timeout(wait, endpoint.invoke(call)).await {
            Ok(result) => result,
            Err(_) => {
                trace!("no acknowledgement within {} ms", wait.as_millis());
                Ok(Value::Null)
            }
        }
    });

    let outcome = match timeout(timing.pacing, &mut sent).await {
        Ok(Ok(result)) => result.map_err(CommandError::from),
        Ok(Err(e)) => Err(CommandError::Transport(e.to_string())),
        Err(_) => Ok(Value::Null),
    };
    let _ = completion.send(outcome);

    sleep(timing.pacing.saturating_sub(started.elapsed())).await;
}

async fn run_blocking(
    endpoint: Arc<dyn Endpoint>,
    call: EndpointCall,
    wait: Duration,
    timing: Timing,
    completion: Completion,
) {
    let started = Instant::now();
    let response = endpoint.invoke(call);
    tokio::pin!(response);

    match timeout(wait, &mut response).await {
        Ok(result) => {
            let elapsed = started.elapsed();
            let pause = timing.pacing.saturating_sub(elapsed);
            debug!(
                "elapsed {} ms -> wait {} ms",
                elapsed.as_millis(),
                pause.as_millis()
            );
            let _ = completion.send(result.map_err(CommandError::from));
            sleep(pause).await;
        }
        Err(_) => {
            debug!("timeout! {} ms", wait.as_millis());
            let _ = completion.send(Err(CommandError::Timeout {
                after_ms: wait.as_millis() as u64,
            }));

            // Keep the radio reserved while a late response may still be on its way
            match timeout(timing.late_response_guard, response).await {
                Ok(_) => debug!("late response after {} ms", started.elapsed().as_millis()),
                Err(_) => warn!(
                    "no response within {} ms late guard, releasing radio",
                    timing.late_response_guard.as_millis()
                ),
            }
        }
    }
}

async fn await_response(
    endpoint: Arc<dyn Endpoint>,
    call: EndpointCall,
    wait: Duration,
    completion: Completion,
) {
    let outcome = match timeout(wait, endpoint.invoke(call)).await {
        Ok(result) => result.map_err(CommandError::from),
        Err(_) => Err(CommandError::Timeout {
            after_ms: wait.as_millis() as u64,
        }),
    };
    let _ = completion.send(outcome);
}
