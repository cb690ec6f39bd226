//! Event publishing/subscription abstraction.
//!
//! The bus is the transport for job notifications. It is intentionally
//! lightweight:
//!
//! - **Transport-agnostic**: in-memory channels here; message brokers behind
//!   the same trait in a full deployment
//! - **At-least-once**: subscribers must tolerate duplicates
//! - **No persistence**: the job store is the source of truth, the bus only
//!   distributes notifications

use std::sync::Arc;
use std::sync::mpsc::Receiver;
use std::time::Duration;

use thiserror::Error;

use crate::event::JobEvent;

/// Why a publish was not delivered.
///
/// Callers in the executor core treat any bus error as non-fatal: it is
/// logged and swallowed so a notification problem can never mask the job
/// outcome it describes.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum BusError {
    #[error("event bus lock poisoned")]
    Poisoned,
    #[error("event bus closed")]
    Closed,
}

/// A subscription to the job event stream.
///
/// Each subscription gets a copy of every event published after it was
/// created (broadcast semantics). Designed for single-threaded consumption;
/// poll with [`Subscription::recv_timeout`] so shutdown checks can interleave.
#[derive(Debug)]
pub struct Subscription {
    receiver: Receiver<JobEvent>,
}

impl Subscription {
    pub fn new(receiver: Receiver<JobEvent>) -> Self {
        Self { receiver }
    }

    /// Block until the next event is available.
    pub fn recv(&self) -> Result<JobEvent, std::sync::mpsc::RecvError> {
        self.receiver.recv()
    }

    /// Try to receive an event without blocking.
    pub fn try_recv(&self) -> Result<JobEvent, std::sync::mpsc::TryRecvError> {
        self.receiver.try_recv()
    }

    /// Block for up to `timeout` waiting for an event.
    pub fn recv_timeout(
        &self,
        timeout: Duration,
    ) -> Result<JobEvent, std::sync::mpsc::RecvTimeoutError> {
        self.receiver.recv_timeout(timeout)
    }

    /// Drain everything currently buffered.
    pub fn drain(&self) -> Vec<JobEvent> {
        let mut events = Vec::new();
        while let Ok(event) = self.receiver.try_recv() {
            events.push(event);
        }
        events
    }
}

/// Pub/sub dispatcher for job notifications.
pub trait EventBus: Send + Sync {
    fn publish(&self, event: JobEvent) -> Result<(), BusError>;

    fn subscribe(&self) -> Subscription;
}

impl<B> EventBus for Arc<B>
where
    B: EventBus + ?Sized,
{
    fn publish(&self, event: JobEvent) -> Result<(), BusError> {
        (**self).publish(event)
    }

    fn subscribe(&self) -> Subscription {
        (**self).subscribe()
    }
}
