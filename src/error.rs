use std::borrow::Cow;
use std::fmt::Display;

/// Error types used throughout the `relro_linker` library.
/// These errors represent the failure conditions that can occur while
/// coordinating library loads and shared RELRO regions.
#[derive(Debug)]
pub enum Error {
    /// An error occurred during a memory mapping operation.
    ///
    /// This error typically indicates issues with memory management such as:
    /// * Failed to map or reserve an address range
    /// * Failed to change memory protection
    /// * Failed to unmap a region
    /// * Failed to create a shared memory region
    Mmap {
        /// A descriptive message about the memory mapping error.
        msg: Cow<'static, str>,
    },

    /// A library could not be mapped at any address.
    ///
    /// This is fatal for the affected library: the process must not attempt
    /// to execute code from it. Other libraries are unaffected.
    Load {
        /// A descriptive message about the load failure.
        msg: Cow<'static, str>,
    },

    /// A shared memory handle could not be attached to a transport envelope,
    /// or a received envelope was malformed.
    Transfer {
        /// A descriptive message about the transfer error.
        msg: Cow<'static, str>,
    },

    /// A private RELRO mapping could not be replaced with the shared one.
    ///
    /// Recoverable: the affected library keeps its private RELRO.
    Adopt {
        /// A descriptive message about the adoption error.
        msg: Cow<'static, str>,
    },

    /// An operation was called in a state or role that does not permit it.
    ///
    /// This error typically indicates API misuse such as:
    /// * Loading before a consumer received its base address
    /// * Requesting a different implementation after one was fixed
    /// * Loading the same library twice
    State {
        /// A descriptive message about the state error.
        msg: Cow<'static, str>,
    },

    /// The registered post-load test runner reported a failure.
    ///
    /// Only reachable when a test runner was registered; treated as a fatal
    /// test-configuration error, never a production error.
    TestRunner {
        /// A descriptive message about the test runner failure.
        msg: Cow<'static, str>,
    },
}

impl Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Error::Mmap { msg } => write!(f, "Memory mapping error: {msg}"),
            Error::Load { msg } => write!(f, "Library load error: {msg}"),
            Error::Transfer { msg } => write!(f, "Handle transfer error: {msg}"),
            Error::Adopt { msg } => write!(f, "RELRO adoption error: {msg}"),
            Error::State { msg } => write!(f, "State error: {msg}"),
            Error::TestRunner { msg } => write!(f, "Test runner error: {msg}"),
        }
    }
}

impl std::error::Error for Error {}

/// Creates a memory mapping error with the specified message.
#[cold]
#[inline(never)]
pub(crate) fn map_error(msg: impl Into<Cow<'static, str>>) -> Error {
    Error::Mmap { msg: msg.into() }
}

/// Creates a library load error with the specified message.
#[cold]
#[inline(never)]
pub(crate) fn load_error(msg: impl Into<Cow<'static, str>>) -> Error {
    Error::Load { msg: msg.into() }
}

/// Creates a handle transfer error with the specified message.
#[cold]
#[inline(never)]
pub(crate) fn transfer_error(msg: impl Into<Cow<'static, str>>) -> Error {
    Error::Transfer { msg: msg.into() }
}

/// Creates a RELRO adoption error with the specified message.
#[cold]
#[inline(never)]
pub(crate) fn adopt_error(msg: impl Into<Cow<'static, str>>) -> Error {
    Error::Adopt { msg: msg.into() }
}

/// Creates a state error with the specified message.
#[cold]
#[inline(never)]
pub(crate) fn state_error(msg: impl Into<Cow<'static, str>>) -> Error {
    Error::State { msg: msg.into() }
}

/// Creates a test runner error with the specified message.
#[cold]
#[inline(never)]
pub(crate) fn test_runner_error(msg: impl Into<Cow<'static, str>>) -> Error {
    Error::TestRunner { msg: msg.into() }
}
