use std::collections::{HashMap, VecDeque};
use std::os::fd::{FromRawFd, OwnedFd, RawFd};
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::{self, ThreadId};
use std::time::{Duration, Instant};

use log::{debug, trace, warn};
use parking_lot::Mutex;

use crate::demux::{Demux, WAKE_TOKEN};
use crate::entry::{Callback, CallbackEntry};
use crate::{CallbackHandle, Error, EventTypes, Result};

/// Why a call to [`Reactor::handle_events`] returned.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnblockReason {
    /// At least one callback ran, [`Reactor::unblock`] fired, or the wait
    /// was interrupted. Spurious returns with no callback invoked are
    /// possible and must be tolerated.
    EventsHandledOrUnblock,
    /// The timeout elapsed with nothing to dispatch.
    Timeout,
}

/// Slot allocation state, behind the registration lock so two threads can
/// never race on "find a free slot" or register the same fd twice.
struct SlotAlloc {
    /// Exclusive upper bound of the region known to have been handed out
    /// at least once. Slots below it may still be free; slots at or above
    /// it are guaranteed untouched.
    end: usize,
    /// Active IO registrations, for duplicate detection.
    by_fd: HashMap<RawFd, usize>,
}

/// Thread-safe, single-dispatcher event demultiplexer.
///
/// IO readiness (via the OS poller) and user-triggered software events are
/// dispatched through one synchronous callback engine. Exactly one thread
/// at a time may drive [`handle_events`](Reactor::handle_events) /
/// [`handle_events_loop`](Reactor::handle_events_loop); every other method
/// may be called concurrently from any thread, including from inside a
/// callback running on the dispatch thread.
///
/// Callbacks must not panic: an unwinding callback leaves the dispatch
/// guard claimed and poisons the engine.
pub struct Reactor {
    demux: Demux,
    slots: Box<[Mutex<CallbackEntry>]>,
    alloc: Mutex<SlotAlloc>,
    /// FIFO of software-event handles awaiting dispatch. Never locked
    /// while holding an entry lock.
    pending: Mutex<VecDeque<CallbackHandle>>,
    /// Claimed for the whole duration of a `handle_events` pass.
    dispatching: AtomicBool,
    /// Thread currently (or most recently) dispatching.
    dispatcher: Mutex<Option<ThreadId>>,
    /// Set by `unblock`, consumed by `handle_events_loop`.
    stop_requested: AtomicBool,
    /// Set by `unblock`, consumed when its wake reaches a wait. Trigger
    /// wakes exist only to interrupt a blocked wait; once their entry has
    /// been dispatched the leftover wake edge must not count as an
    /// unblock, so a wake with this flag clear is discarded as stale.
    unblock_pending: AtomicBool,
}

impl Reactor {
    pub const DEFAULT_CAPACITY: usize = 128;
    /// Platform bound on the number of callback slots.
    pub const MAX_CAPACITY: usize = 65536;

    /// Builds a reactor with [`Self::DEFAULT_CAPACITY`] callback slots.
    pub fn new() -> Result<Reactor> {
        Reactor::with_capacity(Self::DEFAULT_CAPACITY)
    }

    /// Builds a reactor with room for `capacity` simultaneous
    /// registrations. This is the only fallible step of construction; OS
    /// resources for the poller and the unblock primitive are acquired
    /// here.
    pub fn with_capacity(capacity: usize) -> Result<Reactor> {
        if capacity > Self::MAX_CAPACITY {
            return Err(Error::ResourceExhausted(None));
        }
        let demux = Demux::new(capacity).map_err(|e| Error::ResourceExhausted(Some(e)))?;
        let mut slots = Vec::new();
        if slots.try_reserve_exact(capacity).is_err() {
            return Err(Error::ResourceExhausted(None));
        }
        slots.resize_with(capacity, || Mutex::new(CallbackEntry::default()));
        Ok(Reactor {
            demux,
            slots: slots.into_boxed_slice(),
            alloc: Mutex::new(SlotAlloc {
                end: 0,
                by_fd: HashMap::new(),
            }),
            pending: Mutex::new(VecDeque::new()),
            dispatching: AtomicBool::new(false),
            dispatcher: Mutex::new(None),
            stop_requested: AtomicBool::new(false),
            unblock_pending: AtomicBool::new(false),
        })
    }

    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    /// Registers `fd` for the IO events in `events` and returns the handle
    /// identifying the registration.
    ///
    /// `events` must include read or write interest and must not include
    /// the software flag. The fd stays owned by the caller unless it is
    /// later unregistered with `close_source`.
    pub fn register<F>(&self, fd: RawFd, events: EventTypes, callback: F) -> Result<CallbackHandle>
    where
        F: FnMut(CallbackHandle, EventTypes) + Send + 'static,
    {
        if events.is_software() {
            return Err(Error::UnsupportedEvent);
        }
        let interest = events.to_interest().ok_or(Error::UnsupportedEvent)?;

        let mut alloc = self.alloc.lock();
        if alloc.by_fd.contains_key(&fd) {
            return Err(Error::AlreadyRegistered);
        }
        let index = self.find_free_slot(&mut alloc)?;

        // Register with the poller before committing the slot, so an
        // adapter failure leaves no half-registered entry behind.
        self.demux
            .register(fd, mio::Token(index), interest)
            .map_err(Error::from_os)?;

        let handle = self.commit(index, Some(fd), events, Box::new(callback));
        alloc.by_fd.insert(fd, index);
        trace!("registered fd {fd} for {events:?} as {handle:?}");
        Ok(handle)
    }

    /// Registers a software-event entry: no native handle is watched, the
    /// callback runs only when the returned handle is passed to
    /// [`trigger_software_event`](Reactor::trigger_software_event).
    pub fn register_software_event<F>(&self, callback: F) -> Result<CallbackHandle>
    where
        F: FnMut(CallbackHandle, EventTypes) + Send + 'static,
    {
        let mut alloc = self.alloc.lock();
        let index = self.find_free_slot(&mut alloc)?;
        let handle = self.commit(index, None, EventTypes::SOFTWARE, Box::new(callback));
        trace!("registered software event {handle:?}");
        Ok(handle)
    }

    fn find_free_slot(&self, alloc: &mut SlotAlloc) -> Result<usize> {
        if alloc.end < self.slots.len() {
            let index = alloc.end;
            alloc.end += 1;
            return Ok(index);
        }
        // All slots have been handed out at least once; scan for one that
        // was freed since.
        for (index, slot) in self.slots.iter().enumerate() {
            if slot.lock().is_free() {
                return Ok(index);
            }
        }
        Err(Error::ResourceExhausted(None))
    }

    fn commit(
        &self,
        index: usize,
        fd: Option<RawFd>,
        events: EventTypes,
        callback: Callback,
    ) -> CallbackHandle {
        let mut entry = self.slots[index].lock();
        entry.sequence = entry.sequence.wrapping_add(1);
        entry.io_source = fd;
        entry.registered_events = events;
        entry.callback = Some(callback);
        entry.valid = true;
        entry.triggered = false;
        entry.close_on_release = false;
        CallbackHandle::new(index, entry.sequence)
    }

    /// Replaces the monitored event set of an IO registration.
    pub fn set_monitored_events(&self, handle: CallbackHandle, events: EventTypes) -> Result<()> {
        self.update_events(handle, |_| events)
    }

    /// Adds events to an IO registration. Adding an already-active event
    /// is a no-op.
    pub fn add_monitored_events(&self, handle: CallbackHandle, events: EventTypes) -> Result<()> {
        self.update_events(handle, |current| current.union(events))
    }

    /// Removes events from an IO registration. Removing an inactive event
    /// is a no-op; removing the last read/write interest detaches the fd
    /// from the poller until an event is added back.
    pub fn remove_monitored_events(
        &self,
        handle: CallbackHandle,
        events: EventTypes,
    ) -> Result<()> {
        self.update_events(handle, |current| current.difference(events))
    }

    fn update_events<F>(&self, handle: CallbackHandle, apply: F) -> Result<()>
    where
        F: FnOnce(EventTypes) -> EventTypes,
    {
        let slot = self.slot(handle)?;
        let mut entry = slot.lock();
        if !entry.matches(handle) || entry.is_software() {
            return Err(Error::InvalidHandle);
        }
        let fd = entry.io_source.ok_or(Error::InvalidHandle)?;
        let new_events = apply(entry.registered_events);
        if new_events.is_software() {
            return Err(Error::UnsupportedEvent);
        }
        if new_events == entry.registered_events {
            return Ok(());
        }
        let token = mio::Token(handle.index());
        let result = match (
            entry.registered_events.to_interest(),
            new_events.to_interest(),
        ) {
            (Some(_), Some(interest)) => self.demux.reregister(fd, token, interest),
            (None, Some(interest)) => self.demux.register(fd, token, interest),
            (Some(_), None) => self.demux.deregister(fd),
            (None, None) => Ok(()),
        };
        result.map_err(Error::from_os)?;
        entry.registered_events = new_events;
        Ok(())
    }

    /// Atomically replaces the stored callback of a live registration.
    ///
    /// If the entry's previous callback is executing right now, it keeps
    /// running to completion and is released when it returns; the new
    /// target receives every dispatch after that.
    pub fn set_callback_target<F>(&self, handle: CallbackHandle, callback: F) -> Result<()>
    where
        F: FnMut(CallbackHandle, EventTypes) + Send + 'static,
    {
        let slot = self.slot(handle)?;
        let mut entry = slot.lock();
        if !entry.matches(handle) {
            return Err(Error::InvalidHandle);
        }
        entry.callback = Some(Box::new(callback));
        Ok(())
    }

    /// Marks a software-event entry ready for dispatch. Idempotent: a
    /// trigger on an already-triggered entry coalesces into one dispatch.
    /// Wakes the dispatch thread if it is blocked in the wait.
    pub fn trigger_software_event(&self, handle: CallbackHandle) -> Result<()> {
        {
            let slot = self.slot(handle)?;
            let mut entry = slot.lock();
            if !entry.matches(handle) || !entry.is_software() {
                return Err(Error::InvalidHandle);
            }
            if entry.triggered {
                return Ok(());
            }
            entry.triggered = true;
        }
        // Entry lock released before taking the queue lock; the dispatch
        // thread takes them in the opposite nesting otherwise.
        self.pending.lock().push_back(handle);
        if let Err(e) = self.demux.wake() {
            warn!("failed to wake dispatch thread: {e}");
        }
        Ok(())
    }

    /// Removes an IO registration.
    ///
    /// No dispatch happens for the handle after this returns. If the
    /// entry's callback is executing right now (including when this is
    /// called from within that very callback), the close and the release
    /// of the callback's captures are deferred until it returns; otherwise
    /// they happen immediately. With `close_source` the fd's ownership
    /// passes to the reactor and it is closed as part of that release.
    pub fn unregister(&self, handle: CallbackHandle, close_source: bool) -> Result<()> {
        let mut alloc = self.alloc.lock();
        let slot = self.slot(handle)?;
        let mut entry = slot.lock();
        if !entry.matches(handle) {
            return Err(Error::InvalidHandle);
        }
        let fd = entry.io_source.ok_or(Error::InvalidHandle)?;
        entry.valid = false;
        if entry.registered_events.to_interest().is_some() {
            if let Err(e) = self.demux.deregister(fd) {
                warn!("failed to deregister fd {fd}: {e}");
            }
        }
        alloc.by_fd.remove(&fd);
        if entry.in_callback {
            entry.close_on_release = close_source;
        } else {
            entry.callback = None;
            entry.io_source = None;
            if close_source {
                close_fd(fd);
            }
        }
        debug!("unregistered {handle:?} (close_source: {close_source})");
        Ok(())
    }

    /// Removes a software-event registration, discarding any pending
    /// trigger. Release of the callback's captures follows the same
    /// deferral rule as [`unregister`](Reactor::unregister).
    pub fn unregister_software_event(&self, handle: CallbackHandle) -> Result<()> {
        {
            let slot = self.slot(handle)?;
            let mut entry = slot.lock();
            if !entry.matches(handle) || !entry.is_software() {
                return Err(Error::InvalidHandle);
            }
            entry.valid = false;
            entry.triggered = false;
            if !entry.in_callback {
                entry.callback = None;
            }
        }
        self.pending.lock().retain(|pending| *pending != handle);
        debug!("unregistered software event {handle:?}");
        Ok(())
    }

    /// Whether the registration's resources (callback captures, and the
    /// fd from the reactor's point of view) might still be touched by an
    /// in-flight callback. After an unregister without `close_source`,
    /// callers wait for this to turn false before closing the fd
    /// themselves. Unknown and stale handles report false.
    pub fn is_in_use(&self, handle: CallbackHandle) -> bool {
        let Ok(slot) = self.slot(handle) else {
            return false;
        };
        let entry = slot.lock();
        entry.sequence == handle.sequence() && (entry.valid || entry.in_callback)
    }

    fn slot(&self, handle: CallbackHandle) -> Result<&Mutex<CallbackEntry>> {
        self.slots.get(handle.index()).ok_or(Error::InvalidHandle)
    }

    /// Performs one dispatch pass.
    ///
    /// Software events pending on entry are dispatched immediately, in
    /// trigger order, without consulting the poller. Otherwise the call
    /// waits up to `timeout` (`None` blocks indefinitely, `Some(ZERO)`
    /// polls without blocking) for IO readiness, dispatches any ready
    /// callbacks, then drains software events triggered in the meantime.
    ///
    /// # Panics
    ///
    /// Panics if a dispatch pass is already running on any thread,
    /// including re-entrant calls from inside a callback, and on
    /// unrecoverable poller failures.
    pub fn handle_events(&self, timeout: Option<Duration>) -> UnblockReason {
        if self
            .dispatching
            .compare_exchange(false, true, Ordering::Acquire, Ordering::Relaxed)
            .is_err()
        {
            panic!("Reactor::handle_events is already running; concurrent and re-entrant dispatch is a programming error");
        }
        *self.dispatcher.lock() = Some(thread::current().id());
        let reason = self.dispatch_pass(timeout);
        self.dispatching.store(false, Ordering::Release);
        reason
    }

    fn dispatch_pass(&self, timeout: Option<Duration>) -> UnblockReason {
        // Triggers already pending are served without ever blocking.
        let pending = std::mem::take(&mut *self.pending.lock());
        if !pending.is_empty() {
            self.dispatch_software(pending);
            return UnblockReason::EventsHandledOrUnblock;
        }

        // Timeouts too large to express as a deadline wait indefinitely.
        let deadline = timeout.and_then(|t| Instant::now().checked_add(t));
        let mut handled = false;
        let mut unblocked = false;
        loop {
            let mut stale_wake = false;
            let remaining = deadline.map(|d| d.saturating_duration_since(Instant::now()));
            let waited = self.demux.wait(remaining, |event| {
                if event.token() == WAKE_TOKEN {
                    if self.unblock_pending.swap(false, Ordering::AcqRel) {
                        unblocked = true;
                    } else {
                        stale_wake = true;
                    }
                } else {
                    handled |= self.dispatch_io(event);
                }
            });
            match waited {
                Ok(_) => {}
                Err(e) if e.kind() == std::io::ErrorKind::Interrupted => {
                    // A signal interrupted the wait; report a spurious wakeup.
                    unblocked = true;
                }
                Err(e) => panic!("unrecoverable demultiplexer failure: {e}"),
            }

            // Triggers that arrived before or during IO dispatch. Only the
            // batch pending at this point is drained; re-triggers from
            // within these callbacks run on the next pass, which cannot
            // block while the queue is non-empty.
            let pending = std::mem::take(&mut *self.pending.lock());
            if !pending.is_empty() {
                handled = true;
                self.dispatch_software(pending);
            }

            if handled || unblocked {
                return UnblockReason::EventsHandledOrUnblock;
            }
            // A stale wake was already honored by the pass that dispatched
            // its trigger; it is no reason to cut the wait short. Re-enter
            // the wait unless the timeout has expired.
            let expired = deadline.map_or(false, |d| Instant::now() >= d);
            if !stale_wake || expired {
                return UnblockReason::Timeout;
            }
        }
    }

    /// Runs [`handle_events`](Reactor::handle_events) with an unbounded
    /// timeout until [`unblock`](Reactor::unblock) is called.
    pub fn handle_events_loop(&self) {
        loop {
            self.handle_events(None);
            if self.stop_requested.swap(false, Ordering::AcqRel) {
                return;
            }
        }
    }

    /// Makes a concurrently blocked [`handle_events`](Reactor::handle_events)
    /// return promptly with [`UnblockReason::EventsHandledOrUnblock`] and
    /// stops a running [`handle_events_loop`](Reactor::handle_events_loop).
    ///
    /// Safe to call from any thread at any time. If nothing is waiting,
    /// the wakeup is consumed by the next wait rather than lost; at most
    /// one early return results from a stray unblock.
    pub fn unblock(&self) {
        self.stop_requested.store(true, Ordering::Release);
        self.unblock_pending.store(true, Ordering::Release);
        if let Err(e) = self.demux.wake() {
            warn!("failed to fire unblock primitive: {e}");
        }
    }

    /// True iff the calling thread is the one currently (or most
    /// recently) executing a dispatch pass.
    pub fn is_this_thread_handling_events(&self) -> bool {
        *self.dispatcher.lock() == Some(thread::current().id())
    }

    fn dispatch_io(&self, event: &mio::event::Event) -> bool {
        let index = event.token().0;
        let Some(slot) = self.slots.get(index) else {
            return false;
        };
        let mut entry = slot.lock();
        // Unregistered while the wait was in flight: drop the stale event.
        if !entry.valid || entry.is_software() {
            return false;
        }
        let Some(mut callback) = entry.callback.take() else {
            return false;
        };
        let handle = CallbackHandle::new(index, entry.sequence);
        entry.in_callback = true;
        drop(entry);

        callback(handle, EventTypes::from_mio(event));

        self.finish_callback(slot, callback);
        true
    }

    fn dispatch_software(&self, pending: VecDeque<CallbackHandle>) {
        for handle in pending {
            let Some(slot) = self.slots.get(handle.index()) else {
                continue;
            };
            let mut entry = slot.lock();
            // Skip triggers whose entry was unregistered (or whose slot
            // was reused) after enqueueing.
            if !entry.matches(handle) || !entry.triggered {
                continue;
            }
            entry.triggered = false;
            let Some(mut callback) = entry.callback.take() else {
                continue;
            };
            entry.in_callback = true;
            drop(entry);

            callback(handle, EventTypes::SOFTWARE);

            self.finish_callback(slot, callback);
        }
    }

    /// Post-invocation protocol shared by IO and software dispatch. The
    /// slot cannot have been reused in the meantime: reuse requires
    /// `in_callback` to be false, and only this thread clears it.
    fn finish_callback(&self, slot: &Mutex<CallbackEntry>, callback: Callback) {
        let mut entry = slot.lock();
        entry.in_callback = false;
        if entry.valid {
            // A concurrent set_callback_target leaves a replacement in the
            // slot; the finished callback is released in its favor.
            if entry.callback.is_none() {
                entry.callback = Some(callback);
            }
        } else {
            // Unregistered during its own invocation: perform the deferred
            // release, and the deferred close if one was requested.
            if entry.close_on_release {
                if let Some(fd) = entry.io_source {
                    close_fd(fd);
                }
                entry.close_on_release = false;
            }
            entry.io_source = None;
        }
    }
}

/// Closes a descriptor whose ownership was transferred to the reactor via
/// close-on-unregister.
fn close_fd(fd: RawFd) {
    // SAFETY: the caller passed ownership of `fd` by requesting
    // close-on-unregister; no other OwnedFd exists for it.
    drop(unsafe { OwnedFd::from_raw_fd(fd) });
}
