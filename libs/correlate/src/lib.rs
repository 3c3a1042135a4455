//! # canary-correlate
//!
//! Correlates asynchronous callbacks with the test invocations waiting for
//! them.
//!
//! ## Flow
//!
//! 1. The test calls [`CorrelationRegistry::sent`] with the key of the event
//!    it is about to trigger.
//! 2. The webhook receiver turns each inbound request into an
//!    [`InboundRecord`] and hands it to a [`RequestLogger`]. The registry is
//!    one such logger: it extracts the key and fills the matching slot.
//! 3. The test blocks in [`CorrelationRegistry::wait`] (or `wait_n`) until
//!    the record shows up or its [`Context`](canary_context::Context) is done.
//! 4. The test releases the key with [`CorrelationRegistry::delete`].
//!
//! Delivery never blocks the receiver: records for unknown keys, and records
//! arriving while a slot is still full, are dropped.

mod error;
mod record;
mod registry;
mod subscriber;

pub use error::RegistryError;
pub use record::{ChannelLogger, InboundRecord, RequestLogger, TracingLogger};
pub use registry::CorrelationRegistry;
pub use subscriber::Subscriber;
