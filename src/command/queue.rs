//! Bounded FIFO of commands waiting for the radio

use super::Command;
use crate::error::CommandError;
use serde_json::Value;
use std::collections::VecDeque;
use tokio::sync::oneshot;

/// Where a command's result is delivered
pub(super) type Completion = oneshot::Sender<Result<Value, CommandError>>;

/// A command waiting for dispatch, with its completion
#[derive(Debug)]
pub(super) struct QueuedCommand {
    pub command: Command,
    pub completion: Completion,
}

/// Outcome of offering a command to the queue
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(super) enum Admission {
    Queued { superseded: usize },
    /// Queue was full; the command and its completion were dropped
    Rejected { superseded: usize },
}

#[derive(Debug)]
pub(super) struct CommandQueue {
    entries: VecDeque<QueuedCommand>,
    max_len: usize,
}

impl CommandQueue {
    pub fn new(max_len: usize) -> Self {
        Self {
            entries: VecDeque::new(),
            max_len,
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// De-duplicate against queued entries, then append if there is room.
    ///
    /// Superseded entries are dropped along with their completions, so their
    /// tickets resolve to `None` without the command ever being invoked.
    pub fn admit(&mut self, queued: QueuedCommand) -> Admission {
        let before = self.entries.len();
        self.entries
            .retain(|older| !queued.command.supersedes(&older.command));
        let superseded = before - self.entries.len();

        if self.entries.len() >= self.max_len {
            return Admission::Rejected { superseded };
        }

        self.entries.push_back(queued);
        Admission::Queued { superseded }
    }

    pub fn pop_front(&mut self) -> Option<QueuedCommand> {
        self.entries.pop_front()
    }

    /// Drop every pending entry; their tickets resolve to `None`
    pub fn clear(&mut self) -> usize {
        let dropped = self.entries.len();
        self.entries.clear();
        dropped
    }
}
