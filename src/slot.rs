use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, SystemTime};

use tracing::{debug, warn};

use crate::collab::Collaborators;
use crate::hooking::FreezeStrategy;
use crate::options::Options;
use crate::os::{IdentityLock, Os, Waitable};
use crate::session::{IdentityGuard, Session, SessionInit};
use crate::strategy::{self, Invocation};
use crate::{Error, Result};

/// Lifecycle manager for the single session of a process.
///
/// `start` constructs the session, the session's own teardown path destroys
/// it, and the accessors read through the slot while a session exists.
/// Nothing is released implicitly: a slot kept in a `static` is never
/// dropped at process exit, which is what keeps mod code from running after
/// the process already destroyed their globals.
///
/// Cloning yields another handle to the same slot.
pub struct SessionSlot<O: Os> {
    inner: Arc<SlotInner<O>>,
}

struct SlotInner<O: Os> {
    os: Arc<O>,
    options: Arc<Options>,
    session_manager: Mutex<Option<Arc<O::Handle>>>,
}

impl<O: Os> Clone for SessionSlot<O> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<O: Os> std::fmt::Debug for SessionSlot<O> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionSlot")
            .field("active", &self.is_active())
            .finish()
    }
}

impl<O: Os> SessionSlot<O> {
    /// Empty slot using `os` and the default [`Options`].
    pub fn new(os: O) -> Self {
        Self::with_options(os, Options::default())
    }

    /// Empty slot using `os` and the given tunables.
    ///
    /// # Examples
    /// ```no_run
    /// # fn demo<O: hook_session::Os>(os: O) {
    /// use hook_session::{Options, SessionSlot};
    /// use std::time::Duration;
    ///
    /// let slot = SessionSlot::with_options(
    ///     os,
    ///     Options::default().with_debounce(Duration::from_millis(500)),
    /// );
    /// assert!(!slot.is_active());
    /// # }
    /// ```
    pub fn with_options(os: O, options: Options) -> Self {
        Self {
            inner: Arc::new(SlotInner {
                os: Arc::new(os),
                options: Arc::new(options),
                session_manager: Mutex::new(None),
            }),
        }
    }

    /// Bring up the session of this process.
    ///
    /// Serializes with other attempts through the pid-scoped identity lock:
    /// from an asynchronous callback the lock is tried once, otherwise it is
    /// waited for. The lock stays held until the session is destroyed.
    ///
    /// For [`Invocation::DedicatedThread`] this runs the main loop on the
    /// calling thread and returns after teardown. For
    /// [`Invocation::AsyncCallback`] it returns as soon as the engine thread
    /// was started.
    ///
    /// `marker` is an optional handle from the session manager that is kept
    /// open for the session's lifetime.
    pub fn start(
        &self,
        invocation: Invocation,
        session_manager: O::Handle,
        marker: Option<O::Handle>,
        collaborators: Collaborators,
    ) -> Result<()> {
        let os = &self.inner.os;
        let name = self.inner.options.semaphore_name(os.current_process_id());
        let lock = os.open_identity_lock(&name)?;

        // Never stall process startup from an asynchronous callback: two
        // engines loading at once isn't supported, so fail fast instead.
        let timeout = if invocation.is_async() {
            Some(Duration::ZERO)
        } else {
            None
        };
        if !lock.acquire(timeout)? {
            return Err(Error::lock_unavailable(
                "failed to acquire customization session semaphore",
            ));
        }
        let identity = IdentityGuard::new(lock);

        let session_manager = Arc::new(session_manager);
        self.occupy(Arc::clone(&session_manager))?;

        let freeze = if invocation.is_async() {
            FreezeStrategy::None
        } else {
            FreezeStrategy::FastBestEffort
        };
        let init = SessionInit {
            os: Arc::clone(os),
            options: Arc::clone(&self.inner.options),
            slot: self.clone(),
            session_manager,
            marker,
            collaborators,
            freeze,
        };

        let mut session = match Session::new(init) {
            Ok(session) => session,
            Err(err) => {
                warn!(error = %err, "customization session construction failed");
                self.clear();
                return Err(err);
            }
        };
        session.set_identity(identity);

        strategy::launch(Box::new(session), invocation);
        Ok(())
    }

    /// Whether a session currently exists.
    pub fn is_active(&self) -> bool {
        self.lock_state().is_some()
    }

    /// Process id of the session manager.
    pub fn session_manager_process_id(&self) -> Result<u32> {
        let manager = self.session_manager()?;
        self.inner.os.process_id(&manager)
    }

    /// Creation time of the session manager process.
    pub fn session_manager_creation_time(&self) -> Result<SystemTime> {
        let manager = self.session_manager()?;
        self.inner.os.process_creation_time(&manager)
    }

    /// Whether the session manager already exited, which means the session is
    /// about to end. Never blocks.
    pub fn is_ending_soon(&self) -> Result<bool> {
        let manager = self.session_manager()?;
        Ok(self.inner.os.is_signaled(manager.raw_wait_handle()))
    }

    pub(crate) fn clear(&self) {
        if self.lock_state().take().is_some() {
            debug!("session slot cleared");
        }
    }

    fn occupy(&self, session_manager: Arc<O::Handle>) -> Result<()> {
        let mut state = self.lock_state();
        if state.is_some() {
            return Err(Error::already_active());
        }
        *state = Some(session_manager);
        Ok(())
    }

    fn session_manager(&self) -> Result<Arc<O::Handle>> {
        self.lock_state().clone().ok_or_else(Error::no_session)
    }

    fn lock_state(&self) -> MutexGuard<'_, Option<Arc<O::Handle>>> {
        self.inner
            .session_manager
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }
}
