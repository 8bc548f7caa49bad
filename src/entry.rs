use std::os::fd::RawFd;

use crate::{CallbackHandle, EventTypes};

/// Type-erased, move-only callback storage. The box is moved out of the
/// entry for the duration of each invocation and moved back (or dropped)
/// afterwards, so the entry lock is never held across user code.
pub(crate) type Callback = Box<dyn FnMut(CallbackHandle, EventTypes) + Send>;

/// One registration slot.
///
/// Slots live in a fixed array inside the reactor, each behind its own
/// mutex. A slot is reusable once it is neither `valid` nor `in_callback`;
/// reuse bumps `sequence` so stale handles stop matching.
pub(crate) struct CallbackEntry {
    /// Watched descriptor; `None` marks a software-event entry.
    pub io_source: Option<RawFd>,
    pub registered_events: EventTypes,
    pub callback: Option<Callback>,
    /// True while a registration occupies the slot.
    pub valid: bool,
    /// True exactly while the dispatch thread runs this entry's callback.
    pub in_callback: bool,
    /// Software entries: a trigger is pending and not yet dispatched.
    pub triggered: bool,
    /// Unregistered with close-on-unregister while `in_callback`; the
    /// dispatch thread closes `io_source` once the callback returns.
    pub close_on_release: bool,
    pub sequence: u32,
}

impl CallbackEntry {
    pub fn matches(&self, handle: CallbackHandle) -> bool {
        self.valid && self.sequence == handle.sequence()
    }

    pub fn is_free(&self) -> bool {
        !self.valid && !self.in_callback
    }

    pub fn is_software(&self) -> bool {
        self.io_source.is_none()
    }
}

impl Default for CallbackEntry {
    fn default() -> Self {
        CallbackEntry {
            io_source: None,
            registered_events: EventTypes::NONE,
            callback: None,
            valid: false,
            in_callback: false,
            triggered: false,
            close_on_release: false,
            sequence: 0,
        }
    }
}
