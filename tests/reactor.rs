use std::io::{Read, Write};
use std::os::fd::{AsRawFd, IntoRawFd};
use std::os::unix::net::UnixStream;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use reactor::{CallbackHandle, Error, EventTypes, Reactor, UnblockReason};

const SECOND: Duration = Duration::from_secs(1);

fn counter() -> (Arc<AtomicUsize>, impl FnMut(CallbackHandle, EventTypes) + Send + 'static) {
    let count = Arc::new(AtomicUsize::new(0));
    let cloned = count.clone();
    (count, move |_, _| {
        cloned.fetch_add(1, Ordering::SeqCst);
    })
}

#[test]
fn readable_fd_dispatches_once() {
    let reactor = Reactor::new().unwrap();
    let (stream, mut peer) = UnixStream::pair().unwrap();
    let saw_read = Arc::new(AtomicBool::new(false));

    let saw = saw_read.clone();
    let handle = reactor
        .register(stream.as_raw_fd(), EventTypes::READ, move |_, events| {
            saw.store(events.is_read(), Ordering::SeqCst);
        })
        .unwrap();

    peer.write_all(b"ping").unwrap();

    let start = Instant::now();
    assert_eq!(
        reactor.handle_events(Some(SECOND)),
        UnblockReason::EventsHandledOrUnblock
    );
    assert!(start.elapsed() < SECOND / 2);
    assert!(saw_read.load(Ordering::SeqCst));

    reactor.unregister(handle, false).unwrap();
    assert!(!reactor.is_in_use(handle));
}

#[test]
fn software_event_dispatches_without_blocking() {
    let reactor = Reactor::new().unwrap();
    let (count, callback) = counter();
    let handle = reactor.register_software_event(callback).unwrap();

    reactor.trigger_software_event(handle).unwrap();

    let start = Instant::now();
    assert_eq!(
        reactor.handle_events(Some(Duration::ZERO)),
        UnblockReason::EventsHandledOrUnblock
    );
    assert!(start.elapsed() < Duration::from_millis(100));
    assert_eq!(count.load(Ordering::SeqCst), 1);
}

#[test]
fn double_trigger_coalesces_into_one_dispatch() {
    let reactor = Reactor::new().unwrap();
    let (count, callback) = counter();
    let handle = reactor.register_software_event(callback).unwrap();

    reactor.trigger_software_event(handle).unwrap();
    reactor.trigger_software_event(handle).unwrap();

    reactor.handle_events(Some(Duration::ZERO));
    assert_eq!(count.load(Ordering::SeqCst), 1);

    // Nothing left over from the coalesced trigger.
    assert_eq!(
        reactor.handle_events(Some(Duration::ZERO)),
        UnblockReason::Timeout
    );
    assert_eq!(count.load(Ordering::SeqCst), 1);
}

#[test]
fn served_trigger_leaves_no_early_return_behind() {
    let reactor = Reactor::new().unwrap();
    let (count, callback) = counter();
    let handle = reactor.register_software_event(callback).unwrap();

    // Served by the fast path, without consulting the poller; the wake
    // fired by the trigger stays queued in the OS.
    reactor.trigger_software_event(handle).unwrap();
    assert_eq!(
        reactor.handle_events(Some(Duration::ZERO)),
        UnblockReason::EventsHandledOrUnblock
    );
    assert_eq!(count.load(Ordering::SeqCst), 1);

    // The leftover wake edge must neither fake an unblock nor cut the
    // next timed wait short.
    let start = Instant::now();
    assert_eq!(
        reactor.handle_events(Some(Duration::from_millis(100))),
        UnblockReason::Timeout
    );
    assert!(start.elapsed() >= Duration::from_millis(90));
    assert_eq!(count.load(Ordering::SeqCst), 1);
}

#[test]
fn zero_timeout_never_blocks() {
    let reactor = Reactor::new().unwrap();
    let start = Instant::now();
    assert_eq!(
        reactor.handle_events(Some(Duration::ZERO)),
        UnblockReason::Timeout
    );
    assert!(start.elapsed() < Duration::from_millis(100));
}

#[test]
fn registering_same_fd_twice_fails_and_keeps_original() {
    let reactor = Reactor::new().unwrap();
    let (stream, mut peer) = UnixStream::pair().unwrap();
    let (count, callback) = counter();

    reactor
        .register(stream.as_raw_fd(), EventTypes::READ, callback)
        .unwrap();
    assert!(matches!(
        reactor.register(stream.as_raw_fd(), EventTypes::READ, |_, _| {}),
        Err(Error::AlreadyRegistered)
    ));

    // The original registration still dispatches.
    peer.write_all(b"x").unwrap();
    reactor.handle_events(Some(SECOND));
    assert_eq!(count.load(Ordering::SeqCst), 1);
}

#[test]
fn capacity_overflow_fails_late_registration_only() {
    let reactor = Reactor::with_capacity(3).unwrap();
    let handles: Vec<_> = (0..3)
        .map(|_| reactor.register_software_event(|_, _| {}).unwrap())
        .collect();

    assert!(matches!(
        reactor.register_software_event(|_, _| {}),
        Err(Error::ResourceExhausted(_))
    ));

    // All prior registrations remain valid.
    for &handle in &handles {
        reactor.trigger_software_event(handle).unwrap();
    }
    reactor.handle_events(Some(Duration::ZERO));
}

#[test]
fn unblock_is_not_lost_and_fires_at_most_once() {
    let reactor = Reactor::new().unwrap();
    reactor.unblock();

    let start = Instant::now();
    assert_eq!(
        reactor.handle_events(Some(5 * SECOND)),
        UnblockReason::EventsHandledOrUnblock
    );
    assert!(start.elapsed() < SECOND);

    // A stray unblock produces no second early return.
    assert_eq!(
        reactor.handle_events(Some(Duration::ZERO)),
        UnblockReason::Timeout
    );
}

#[test]
fn unblock_interrupts_a_blocked_wait() {
    let reactor = Arc::new(Reactor::new().unwrap());

    let remote = reactor.clone();
    let waker = thread::spawn(move || {
        thread::sleep(Duration::from_millis(50));
        remote.unblock();
    });

    let start = Instant::now();
    assert_eq!(
        reactor.handle_events(Some(10 * SECOND)),
        UnblockReason::EventsHandledOrUnblock
    );
    assert!(start.elapsed() < 5 * SECOND);
    waker.join().unwrap();
}

#[test]
fn trigger_from_another_thread_wakes_the_dispatcher() {
    let reactor = Arc::new(Reactor::new().unwrap());
    let (count, callback) = counter();
    let handle = reactor.register_software_event(callback).unwrap();

    let remote = reactor.clone();
    let trigger = thread::spawn(move || {
        thread::sleep(Duration::from_millis(50));
        remote.trigger_software_event(handle).unwrap();
    });

    assert_eq!(reactor.handle_events(None), UnblockReason::EventsHandledOrUnblock);
    assert_eq!(count.load(Ordering::SeqCst), 1);
    trigger.join().unwrap();
}

#[test]
fn handle_events_loop_stops_on_unblock() {
    let reactor = Arc::new(Reactor::new().unwrap());
    let (count, callback) = counter();
    let handle = reactor.register_software_event(callback).unwrap();

    let dispatcher = {
        let reactor = reactor.clone();
        thread::spawn(move || reactor.handle_events_loop())
    };

    reactor.trigger_software_event(handle).unwrap();
    while count.load(Ordering::SeqCst) == 0 {
        thread::yield_now();
    }
    reactor.unblock();
    dispatcher.join().unwrap();
    assert_eq!(count.load(Ordering::SeqCst), 1);
}

#[test]
fn unregister_from_own_callback_defers_release() {
    let reactor = Arc::new(Reactor::new().unwrap());
    let observed_in_use = Arc::new(AtomicBool::new(false));

    let remote = reactor.clone();
    let observed = observed_in_use.clone();
    let handle = reactor
        .register_software_event(move |own_handle, _| {
            remote.unregister_software_event(own_handle).unwrap();
            // Resources stay in use until this callback returns.
            observed.store(remote.is_in_use(own_handle), Ordering::SeqCst);
        })
        .unwrap();

    reactor.trigger_software_event(handle).unwrap();
    reactor.handle_events(Some(Duration::ZERO));

    assert!(observed_in_use.load(Ordering::SeqCst));
    assert!(!reactor.is_in_use(handle));
    assert!(matches!(
        reactor.trigger_software_event(handle),
        Err(Error::InvalidHandle)
    ));
}

#[test]
fn close_on_unregister_from_own_callback_closes_fd_and_frees_slot() {
    let reactor = Arc::new(Reactor::with_capacity(1).unwrap());
    let (stream, mut peer) = UnixStream::pair().unwrap();
    // Ownership of the fd passes to the reactor below.
    let fd = stream.into_raw_fd();

    let remote = reactor.clone();
    reactor
        .register(fd, EventTypes::READ, move |own_handle, _| {
            remote.unregister(own_handle, true).unwrap();
        })
        .unwrap();

    peer.write_all(b"x").unwrap();
    assert_eq!(
        reactor.handle_events(Some(SECOND)),
        UnblockReason::EventsHandledOrUnblock
    );

    // The deferred close ran once the callback returned. The callback
    // never drained the byte, so the peer sees either end-of-stream or a
    // reset for the discarded data; both prove the socket is gone.
    peer.set_read_timeout(Some(SECOND)).unwrap();
    let mut buf = [0u8; 16];
    match peer.read(&mut buf) {
        Ok(0) => {}
        Err(e) if e.kind() == std::io::ErrorKind::ConnectionReset => {}
        other => panic!("expected closed stream, got {other:?}"),
    }

    // And the single slot is reusable.
    reactor.register_software_event(|_, _| {}).unwrap();
}

#[test]
fn close_on_unregister_outside_callback_is_immediate() {
    let reactor = Reactor::new().unwrap();
    let (stream, mut peer) = UnixStream::pair().unwrap();
    let fd = stream.into_raw_fd();

    let handle = reactor.register(fd, EventTypes::READ, |_, _| {}).unwrap();
    reactor.unregister(handle, true).unwrap();

    peer.set_read_timeout(Some(SECOND)).unwrap();
    let mut buf = [0u8; 16];
    assert_eq!(peer.read(&mut buf).unwrap(), 0);
}

#[test]
fn removed_events_stop_dispatch_until_added_back() {
    let reactor = Reactor::new().unwrap();
    let (stream, mut peer) = UnixStream::pair().unwrap();
    let (count, callback) = counter();
    let handle = reactor
        .register(stream.as_raw_fd(), EventTypes::READ, callback)
        .unwrap();

    reactor
        .remove_monitored_events(handle, EventTypes::READ)
        .unwrap();
    // Removing an inactive event is a no-op, not an error.
    reactor
        .remove_monitored_events(handle, EventTypes::READ)
        .unwrap();

    peer.write_all(b"x").unwrap();
    assert_eq!(
        reactor.handle_events(Some(Duration::from_millis(50))),
        UnblockReason::Timeout
    );
    assert_eq!(count.load(Ordering::SeqCst), 0);

    reactor
        .add_monitored_events(handle, EventTypes::READ)
        .unwrap();
    assert_eq!(
        reactor.handle_events(Some(SECOND)),
        UnblockReason::EventsHandledOrUnblock
    );
    assert_eq!(count.load(Ordering::SeqCst), 1);
}

#[test]
fn set_callback_target_replaces_dispatch_target() {
    let reactor = Reactor::new().unwrap();
    let (old_count, old_callback) = counter();
    let (new_count, new_callback) = counter();

    let handle = reactor.register_software_event(old_callback).unwrap();
    reactor.set_callback_target(handle, new_callback).unwrap();

    reactor.trigger_software_event(handle).unwrap();
    reactor.handle_events(Some(Duration::ZERO));

    assert_eq!(old_count.load(Ordering::SeqCst), 0);
    assert_eq!(new_count.load(Ordering::SeqCst), 1);
}

#[test]
fn dispatch_thread_identity_is_visible() {
    let reactor = Arc::new(Reactor::new().unwrap());
    assert!(!reactor.is_this_thread_handling_events());

    let remote = reactor.clone();
    let observed = Arc::new(AtomicBool::new(false));
    let inner = observed.clone();
    let handle = reactor
        .register_software_event(move |_, _| {
            inner.store(remote.is_this_thread_handling_events(), Ordering::SeqCst);
        })
        .unwrap();

    reactor.trigger_software_event(handle).unwrap();
    reactor.handle_events(Some(Duration::ZERO));
    assert!(observed.load(Ordering::SeqCst));

    let other = {
        let reactor = reactor.clone();
        thread::spawn(move || reactor.is_this_thread_handling_events())
    };
    assert!(!other.join().unwrap());
}

#[test]
fn registration_and_trigger_from_within_a_callback() {
    let reactor = Arc::new(Reactor::new().unwrap());
    let (inner_count, inner_callback) = counter();

    // The outer callback registers a second software event and triggers
    // it. Triggers raised during a dispatch pass run on the next pass,
    // which serves them without blocking.
    let remote = reactor.clone();
    let mut inner_callback = Some(inner_callback);
    let outer = reactor
        .register_software_event(move |_, _| {
            let inner = remote
                .register_software_event(inner_callback.take().unwrap())
                .unwrap();
            remote.trigger_software_event(inner).unwrap();
        })
        .unwrap();

    reactor.trigger_software_event(outer).unwrap();
    reactor.handle_events(Some(Duration::ZERO));
    assert_eq!(inner_count.load(Ordering::SeqCst), 0);

    reactor.handle_events(Some(Duration::ZERO));
    assert_eq!(inner_count.load(Ordering::SeqCst), 1);
}
