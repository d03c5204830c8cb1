//! Result codes
use core::fmt;

use crate::thread::ThreadId;

/// The error type shared by every kernel service.
///
/// All failures are reported synchronously at the call site; the kernel has
/// no exception mechanism. Fatal conditions that cannot be attributed to a
/// particular call site are reported through [`FatalHook`] instead.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Error {
    /// A parameter was null, out of range, or otherwise malformed.
    BadParam,
    /// The given handle does not refer to a live object of the expected
    /// kind. Handles carry a generation counter, so a handle to a deleted
    /// object is detected even if its arena slot has been reused.
    BadId,
    /// The object cannot satisfy the request in its current state: no
    /// tokens, no free blocks, no queue space, a mutex that is not locked
    /// or not owned by the caller, a timer that is not running, or an
    /// object that was deleted while the caller was waiting on it.
    Resource,
    /// A finite wait expired without the wait condition being satisfied.
    Timeout,
    /// A blocking service (timeout ≠ 0) was invoked between
    /// [`interrupt_enter`] and [`interrupt_exit`]. The kernel state is not
    /// mutated when this is returned.
    ///
    /// [`interrupt_enter`]: crate::Kernel::interrupt_enter
    /// [`interrupt_exit`]: crate::Kernel::interrupt_exit
    IsrContext,
    /// The operation is not permitted in the kernel's current lifecycle
    /// state (e.g. `start` after start, blocking while the scheduler is
    /// locked, `resume` while not suspended).
    BadState,
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let msg = match self {
            Self::BadParam => "invalid parameter",
            Self::BadId => "invalid or stale object handle",
            Self::Resource => "resource not available",
            Self::Timeout => "wait timed out",
            Self::IsrContext => "blocking call from interrupt context",
            Self::BadState => "operation not permitted in this kernel state",
        };
        f.write_str(msg)
    }
}

pub type Result<T> = core::result::Result<T, Error>;

/// The immediate disposition of a service call that may block.
///
/// The kernel itself never runs user thread code, so a service that must
/// block cannot return its final result in-line. Instead it parks the
/// calling thread, dispatches the next runnable one, and returns
/// [`Wait::Pending`]; the final outcome of the wait is stored in the
/// thread's control block and retrieved with [`Kernel::take_wakeup`] when
/// the thread is next scheduled (a port patches it into the resumed call
/// site).
///
/// [`Kernel::take_wakeup`]: crate::Kernel::take_wakeup
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[must_use]
pub enum Wait<T> {
    /// The operation completed without blocking.
    Complete(T),
    /// The calling thread was parked.
    Pending,
}

impl<T> Wait<T> {
    #[inline]
    pub fn is_pending(&self) -> bool {
        matches!(self, Self::Pending)
    }

    /// Unwrap the `Complete` variant, panicking on `Pending`.
    ///
    /// Mostly useful in tests and in code paths that are known not to
    /// block (zero timeout).
    #[track_caller]
    pub fn complete(self) -> T {
        match self {
            Self::Complete(x) => x,
            Self::Pending => panic!("operation unexpectedly blocked"),
        }
    }
}

/// Fatal conditions reported through the error-notification hook.
///
/// The kernel surfaces these and continues; it makes no recovery attempt
/// beyond that. The hook may log, halt, or ignore as the application sees
/// fit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FatalError {
    /// The watermark word at the base of a thread's stack was found
    /// corrupted during a context switch.
    StackOverflow(ThreadId),
    /// The deferred post-processing ring buffer was full when an interrupt
    /// handler tried to push a completion. The completion is lost; this
    /// report is the only notice.
    DeferredQueueOverflow,
    /// The timer-service message queue was full when a timer expired. The
    /// expiry is lost.
    TimerQueueOverflow,
}

/// The error-notification hook registered through
/// [`Config::fatal_hook`](crate::Config::fatal_hook).
pub type FatalHook = fn(FatalError);
