use std::io;
use std::os::fd::RawFd;
use std::time::Duration;

use mio::unix::SourceFd;
use parking_lot::Mutex;

/// Token reserved for the unblock primitive; slot indices never reach it.
pub(crate) const WAKE_TOKEN: mio::Token = mio::Token(usize::MAX);

/// Longest wait the poller can represent (epoll takes i32 milliseconds).
const MAX_WAIT: Duration = Duration::from_millis(i32::MAX as u64);

/// Thin wrapper around the OS readiness facility: an epoll-backed
/// `mio::Poll` plus an eventfd-backed `mio::Waker` used to interrupt a
/// blocked wait from another thread.
///
/// Registration changes go through a cloned `Registry` and are safe from
/// any thread; `wait` is only ever entered by the single dispatching
/// thread, which the reactor's guard flag enforces.
pub(crate) struct Demux {
    poll: Mutex<mio::Poll>,
    events: Mutex<mio::Events>,
    registry: mio::Registry,
    waker: mio::Waker,
}

impl Demux {
    pub fn new(event_capacity: usize) -> io::Result<Demux> {
        let poll = mio::Poll::new()?;
        let registry = poll.registry().try_clone()?;
        let waker = mio::Waker::new(poll.registry(), WAKE_TOKEN)?;
        Ok(Demux {
            poll: Mutex::new(poll),
            events: Mutex::new(mio::Events::with_capacity(event_capacity.max(1))),
            registry,
            waker,
        })
    }

    pub fn register(
        &self,
        fd: RawFd,
        token: mio::Token,
        interest: mio::Interest,
    ) -> io::Result<()> {
        self.registry.register(&mut SourceFd(&fd), token, interest)
    }

    pub fn reregister(
        &self,
        fd: RawFd,
        token: mio::Token,
        interest: mio::Interest,
    ) -> io::Result<()> {
        self.registry
            .reregister(&mut SourceFd(&fd), token, interest)
    }

    pub fn deregister(&self, fd: RawFd) -> io::Result<()> {
        self.registry.deregister(&mut SourceFd(&fd))
    }

    /// Wakes a concurrently blocked `wait`. If nothing is waiting, the
    /// wake is consumed by the next wait instead of being lost.
    pub fn wake(&self) -> io::Result<()> {
        self.waker.wake()
    }

    /// Blocks for up to `timeout` (`None` = indefinitely) and hands every
    /// reported event to `on_event`. Returns the number of events seen.
    pub fn wait<F>(&self, timeout: Option<Duration>, mut on_event: F) -> io::Result<usize>
    where
        F: FnMut(&mio::event::Event),
    {
        let mut poll = self.poll.lock();
        let mut events = self.events.lock();
        poll.poll(&mut events, timeout.map(clamp))?;
        let mut seen = 0;
        for event in events.iter() {
            on_event(event);
            seen += 1;
        }
        Ok(seen)
    }
}

/// Clamps to the poller's maximum representable wait and rounds sub-
/// millisecond remainders up, so a small positive timeout never turns
/// into a busy non-blocking poll.
fn clamp(timeout: Duration) -> Duration {
    if timeout >= MAX_WAIT {
        return MAX_WAIT;
    }
    let millis = Duration::from_millis(timeout.as_millis() as u64);
    if millis < timeout {
        millis + Duration::from_millis(1)
    } else {
        timeout
    }
}
