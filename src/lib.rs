//! A thread-safe, single-dispatcher reactor.
//!
//! The reactor demultiplexes two kinds of events into one synchronous
//! callback engine: IO readiness of native file descriptors (backed by the
//! OS poller) and user-triggered *software events*. Callers register an
//! interest and receive an opaque [`CallbackHandle`]; exactly one thread
//! drives [`Reactor::handle_events`], which blocks for readiness and runs
//! the matching callbacks, while any other thread may concurrently
//! register, modify, unregister, or trigger, including from inside a
//! callback running on the dispatch thread.
//!
//! Unregistration is safe against in-flight callbacks: resources of an
//! entry whose callback is currently executing are released only after it
//! returns, and [`Reactor::is_in_use`] reports the window in which they
//! may still be touched.
//!
//! ```
//! use reactor::{Reactor, UnblockReason};
//! use std::time::Duration;
//!
//! let reactor = Reactor::with_capacity(8)?;
//! let handle = reactor.register_software_event(|_, events| {
//!     assert!(events.is_software());
//! })?;
//! reactor.trigger_software_event(handle)?;
//! assert_eq!(
//!     reactor.handle_events(Some(Duration::ZERO)),
//!     UnblockReason::EventsHandledOrUnblock,
//! );
//! # Ok::<(), reactor::Error>(())
//! ```

mod demux;
mod entry;
mod error;
mod events;
mod handle;
mod reactor;

pub use error::{Error, Result};
pub use events::EventTypes;
pub use handle::CallbackHandle;
pub use reactor::{Reactor, UnblockReason};
