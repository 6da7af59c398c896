//! Process-level primitives the session consumes as black boxes.
//!
//! [`Os`] is the seam between the session engine and the operating system:
//! waitable handles, thread enumeration, the identity lock, the dynamic-code
//! mitigation query and engine thread creation. [`SystemOs`] is the Win32
//! implementation; tests drive the engine through scripted implementations.

use std::time::{Duration, SystemTime};

use crate::Result;

#[cfg(windows)]
mod windows;

#[cfg(windows)]
pub use self::windows::{SemaphoreLock, SystemHandle, SystemOs};

/// Raw, non-owning identity of a waitable kernel object.
///
/// Only valid while the owner of the underlying handle keeps it open.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct RawWaitHandle(pub usize);

/// An owned object that can be passed to [`Os::wait_any`].
pub trait Waitable {
    fn raw_wait_handle(&self) -> RawWaitHandle;
}

/// Outcome of resolving the first live, non-current thread of the process.
#[derive(Debug)]
pub enum ThreadProbe<H> {
    /// A live thread other than the calling one.
    Alive(H),
    /// Every other thread of the process has exited.
    NoneLeft,
    /// Threads can't be enumerated (sandboxed process, missing API, failure).
    Unavailable,
}

/// Identifying description and flags for an engine thread.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ThreadSpec {
    pub name: String,
    /// Suppress thread-attach (TLS/DllMain) callbacks for the new thread.
    pub attach_exempt: bool,
}

/// Body of an engine thread. The returned value becomes the thread exit code.
pub type ThreadBody = Box<dyn FnOnce() -> u32 + Send + 'static>;

/// A named, process-scoped semaphore with a maximum count of one.
pub trait IdentityLock: Send + Sync {
    /// Try to take the lock. `None` waits forever.
    ///
    /// Returns `Ok(false)` if the timeout elapsed without acquiring it.
    fn acquire(&self, timeout: Option<Duration>) -> Result<bool>;

    fn release(&self);
}

/// OS primitives used by the session engine.
pub trait Os: Send + Sync + 'static {
    /// Owned kernel handle (process, thread, marker).
    type Handle: Waitable + Send + Sync + 'static;
    type Lock: IdentityLock + 'static;

    fn current_process_id(&self) -> u32;

    /// Create or open the named identity lock (initial and max count 1).
    fn open_identity_lock(&self, name: &str) -> Result<Self::Lock>;

    /// Resolve the first thread of the process that is neither the calling
    /// thread nor already exited.
    fn first_live_thread(&self) -> ThreadProbe<Self::Handle>;

    fn thread_exit_code(&self, thread: &Self::Handle) -> Result<u32>;

    /// Block until one of `handles` is signaled. `None` waits forever.
    ///
    /// Returns the index of the signaled handle, or `None` on timeout.
    fn wait_any(&self, handles: &[RawWaitHandle], timeout: Option<Duration>)
    -> Result<Option<usize>>;

    fn process_id(&self, process: &Self::Handle) -> Result<u32>;

    fn process_creation_time(&self, process: &Self::Handle) -> Result<SystemTime>;

    /// Whether the current process forbids allocating or modifying
    /// executable memory at run time.
    fn dynamic_code_forbidden(&self) -> bool;

    /// Start an engine thread.
    ///
    /// The thread pins the engine module for its whole run and releases it
    /// together with exiting, after `body` returns.
    fn spawn_thread(&self, spec: ThreadSpec, body: ThreadBody) -> Result<()>;

    fn sleep(&self, duration: Duration);

    /// Non-blocking probe of a waitable object.
    fn is_signaled(&self, handle: RawWaitHandle) -> bool {
        matches!(self.wait_any(&[handle], Some(Duration::ZERO)), Ok(Some(0)))
    }
}
