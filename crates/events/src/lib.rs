//! Job lifecycle event feed.
//!
//! The registry publishes a [`JobEvent`] for every cache mutation. Delivery is
//! in-process and best-effort: publishing never blocks and a subscriber that
//! went away is dropped on the next publish.

pub mod bus;
pub mod in_memory_bus;
pub mod job_event;

pub use bus::{EventBus, Subscription};
pub use in_memory_bus::{InMemoryBusError, InMemoryEventBus};
pub use job_event::JobEvent;
