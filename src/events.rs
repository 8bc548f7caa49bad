use std::fmt;
use std::ops::{BitOr, BitOrAssign};

const READ: u8 = 1 << 0;
const WRITE: u8 = 1 << 1;
const ERROR: u8 = 1 << 2;
const SOFTWARE: u8 = 1 << 3;

/// A set of event interest flags.
///
/// An entry is watched either for IO readiness (any combination of
/// [`EventTypes::READ`], [`EventTypes::WRITE`], [`EventTypes::ERROR`]) or
/// for software triggers ([`EventTypes::SOFTWARE`]), never both.
#[derive(Clone, Copy, Default, PartialEq, Eq, Hash)]
pub struct EventTypes(u8);

impl EventTypes {
    pub const NONE: EventTypes = EventTypes(0);
    pub const READ: EventTypes = EventTypes(READ);
    pub const WRITE: EventTypes = EventTypes(WRITE);
    pub const ERROR: EventTypes = EventTypes(ERROR);
    pub const SOFTWARE: EventTypes = EventTypes(SOFTWARE);

    pub fn is_read(self) -> bool {
        self.0 & READ != 0
    }
    pub fn is_write(self) -> bool {
        self.0 & WRITE != 0
    }
    pub fn is_error(self) -> bool {
        self.0 & ERROR != 0
    }
    pub fn is_software(self) -> bool {
        self.0 & SOFTWARE != 0
    }
    pub fn is_empty(self) -> bool {
        self.0 == 0
    }

    pub fn set_read(&mut self, on: bool) {
        self.set(READ, on)
    }
    pub fn set_write(&mut self, on: bool) {
        self.set(WRITE, on)
    }
    pub fn set_error(&mut self, on: bool) {
        self.set(ERROR, on)
    }
    pub fn set_software(&mut self, on: bool) {
        self.set(SOFTWARE, on)
    }

    fn set(&mut self, flag: u8, on: bool) {
        if on {
            self.0 |= flag;
        } else {
            self.0 &= !flag;
        }
    }

    /// Returns true if every flag in `other` is also set in `self`.
    pub fn contains(self, other: EventTypes) -> bool {
        self.0 & other.0 == other.0
    }

    /// Returns true if any flag in `other` is set in `self`.
    pub fn contains_any(self, other: EventTypes) -> bool {
        self.0 & other.0 != 0
    }

    pub fn union(self, other: EventTypes) -> EventTypes {
        EventTypes(self.0 | other.0)
    }

    pub fn difference(self, other: EventTypes) -> EventTypes {
        EventTypes(self.0 & !other.0)
    }

    /// The mio interest equivalent of the IO flags, or `None` when neither
    /// read nor write is requested (epoll reports errors unconditionally,
    /// so the error flag alone registers nothing).
    pub(crate) fn to_interest(self) -> Option<mio::Interest> {
        match (self.is_read(), self.is_write()) {
            (true, true) => Some(mio::Interest::READABLE | mio::Interest::WRITABLE),
            (true, false) => Some(mio::Interest::READABLE),
            (false, true) => Some(mio::Interest::WRITABLE),
            (false, false) => None,
        }
    }

    pub(crate) fn from_mio(event: &mio::event::Event) -> EventTypes {
        let mut events = EventTypes::NONE;
        events.set_read(event.is_readable() || event.is_read_closed());
        events.set_write(event.is_writable() || event.is_write_closed());
        events.set_error(event.is_error());
        events
    }
}

impl BitOr for EventTypes {
    type Output = EventTypes;

    fn bitor(self, rhs: EventTypes) -> EventTypes {
        self.union(rhs)
    }
}

impl BitOrAssign for EventTypes {
    fn bitor_assign(&mut self, rhs: EventTypes) {
        self.0 |= rhs.0;
    }
}

impl fmt::Debug for EventTypes {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut set = f.debug_set();
        if self.is_read() {
            set.entry(&"read");
        }
        if self.is_write() {
            set.entry(&"write");
        }
        if self.is_error() {
            set.entry(&"error");
        }
        if self.is_software() {
            set.entry(&"software");
        }
        set.finish()
    }
}
