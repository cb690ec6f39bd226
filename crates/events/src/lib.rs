//! Job lifecycle notifications.
//!
//! The executor core treats event dispatch as **fire-and-forget**: a failure
//! to deliver a notification must never propagate into the operation that
//! produced it. Consumers subscribe through the bus abstraction and must be
//! idempotent (at-least-once acceptable).

pub mod bus;
pub mod event;
pub mod in_memory_bus;

pub use bus::{BusError, EventBus, Subscription};
pub use event::{JobEvent, JobEventKind};
pub use in_memory_bus::InMemoryEventBus;
