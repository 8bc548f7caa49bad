use std::io;

pub type Result<T> = std::result::Result<T, Error>;

/// Errors returned by the registration and modification APIs.
///
/// All of these are recoverable and leave the reactor state untouched.
/// Unrecoverable failures of the OS wait itself are not represented here;
/// they panic the dispatching thread instead, since a broken demultiplexer
/// cannot keep serving any registered component.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// The native handle already has an active registration.
    #[error("native handle is already registered")]
    AlreadyRegistered,

    /// The callback handle is unknown, stale (its slot has been reused),
    /// or of the wrong kind (software vs IO) for this call.
    #[error("callback handle is unknown, stale, or of the wrong kind")]
    InvalidHandle,

    /// The underlying native handle cannot be watched for the requested
    /// event set (e.g. regular files under epoll, or an IO registration
    /// without read or write interest).
    #[error("requested events are not supported for this handle")]
    UnsupportedEvent,

    /// No free callback slot, or the OS refused to allocate.
    #[error("reactor capacity or OS resources exhausted")]
    ResourceExhausted(#[source] Option<io::Error>),
}

impl Error {
    /// Maps a poller-level failure into the taxonomy. epoll reports
    /// `EPERM` for handle kinds it cannot watch; everything else is some
    /// form of resource exhaustion.
    pub(crate) fn from_os(err: io::Error) -> Error {
        match err.kind() {
            io::ErrorKind::PermissionDenied => Error::UnsupportedEvent,
            _ => Error::ResourceExhausted(Some(err)),
        }
    }
}
