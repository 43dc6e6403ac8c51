//! Coordinator Lifecycle State Machine
//!
//! Defines the valid status transitions of a coordinator instance and the
//! start retry policy.

use crate::{defaults, CoordinatorStatus};

/// Events that can trigger status transitions
#[derive(Debug, Clone, PartialEq)]
pub enum LifecycleEvent {
    /// Transport start attempt failed
    StartFailed { reason: String },
    /// Transport started, waiting for the network to come up
    Started,
    /// Network formed and coordinator ready
    Ready,
    /// Shutdown requested
    CloseRequested,
    /// Transport stopped and listeners detached
    Closed,
}

/// Result of a transition attempt
#[derive(Debug, Clone, PartialEq)]
pub enum TransitionResult {
    /// Transition was valid; carries the new status
    Success(CoordinatorStatus),
    /// Start failed but another attempt is allowed after the backoff
    RetryScheduled { attempt: u32, reason: String },
    /// Start failed for the last time
    Fatal { reason: String },
    /// Transition was invalid from current status
    Invalid {
        from: CoordinatorStatus,
        event: LifecycleEvent,
    },
}

#[derive(Debug)]
pub struct LifecycleStateMachine {
    status: CoordinatorStatus,
    failed_starts: u32,
    max_start_attempts: u32,
}

impl Default for LifecycleStateMachine {
    fn default() -> Self {
        Self::new()
    }
}

impl LifecycleStateMachine {
    /// Create a new state machine in Starting status
    pub fn new() -> Self {
        Self::with_start_attempts(defaults::START_ATTEMPTS)
    }

    pub fn with_start_attempts(max_start_attempts: u32) -> Self {
        Self {
            status: CoordinatorStatus::Starting,
            failed_starts: 0,
            max_start_attempts: max_start_attempts.max(1),
        }
    }

    pub fn status(&self) -> &CoordinatorStatus {
        &self.status
    }

    /// Number of start attempts that failed so far
    pub fn failed_starts(&self) -> u32 {
        self.failed_starts
    }

    /// Process an event and return the transition result
    pub fn process_event(&mut self, event: LifecycleEvent) -> TransitionResult {
        use CoordinatorStatus::*;

        match (self.status.clone(), &event) {
            (Starting, LifecycleEvent::StartFailed { reason }) => {
                self.failed_starts += 1;
                if self.failed_starts < self.max_start_attempts {
                    TransitionResult::RetryScheduled {
                        attempt: self.failed_starts + 1,
                        reason: reason.clone(),
                    }
                } else {
                    self.status = Failed(reason.clone());
                    TransitionResult::Fatal {
                        reason: reason.clone(),
                    }
                }
            }
            (Starting, LifecycleEvent::Started) => self.transition(Connecting),

            // The stack may report ready before the start callback returns
            (Starting | Connecting | Connected, LifecycleEvent::Ready) => {
                self.failed_starts = 0;
                self.transition(Connected)
            }

            (Starting | Connecting | Connected | Failed(_), LifecycleEvent::CloseRequested) => {
                self.transition(Closing)
            }
            (Closing, LifecycleEvent::Closed) => self.transition(Stopped),

            _ => TransitionResult::Invalid {
                from: self.status.clone(),
                event: event.clone(),
            },
        }
    }

    fn transition(&mut self, to: CoordinatorStatus) -> TransitionResult {
        self.status = to.clone();
        TransitionResult::Success(to)
    }
}
