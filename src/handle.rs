use std::fmt;

/// Opaque identifier for one registration slot.
///
/// A handle pairs the slot index with the sequence number the slot carried
/// when the registration was made. Reusing a slot bumps its sequence, so
/// handles held over from a previous occupant stop matching and every API
/// call rejects them with [`Error::InvalidHandle`](crate::Error::InvalidHandle).
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct CallbackHandle {
    index: u32,
    sequence: u32,
}

impl CallbackHandle {
    /// Sentinel distinguishable from every handle a reactor can return.
    pub const INVALID: CallbackHandle = CallbackHandle {
        index: u32::MAX,
        sequence: 0,
    };

    pub(crate) fn new(index: usize, sequence: u32) -> CallbackHandle {
        CallbackHandle {
            index: index as u32,
            sequence,
        }
    }

    pub(crate) fn index(self) -> usize {
        self.index as usize
    }

    pub(crate) fn sequence(self) -> u32 {
        self.sequence
    }

    pub fn is_valid(self) -> bool {
        self != CallbackHandle::INVALID
    }

    /// Stable numeric form, usable in atomics or FFI-adjacent storage.
    pub fn to_raw(self) -> u64 {
        (self.index as u64) << 32 | self.sequence as u64
    }

    pub fn from_raw(raw: u64) -> CallbackHandle {
        CallbackHandle {
            index: (raw >> 32) as u32,
            sequence: raw as u32,
        }
    }
}

impl Default for CallbackHandle {
    fn default() -> Self {
        CallbackHandle::INVALID
    }
}

impl fmt::Debug for CallbackHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if !self.is_valid() {
            f.write_str("CallbackHandle(INVALID)")
        } else {
            write!(f, "CallbackHandle({}.{})", self.index, self.sequence)
        }
    }
}
