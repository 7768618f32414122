//! `bus` crate — the publish/subscribe seam between the conductor and plugins.
//!
//! The engine only ever talks to a bus through the [`EventBus`] trait object,
//! so tests and embedders can swap in their own transport.  [`InMemoryBus`]
//! is the default synchronous, in-process implementation.

pub mod error;
pub mod traits;
pub mod memory;
pub mod mock;

pub use error::BusError;
pub use memory::InMemoryBus;
pub use traits::{handler, Baton, Delivery, EventBus, Handler, Subscription};
