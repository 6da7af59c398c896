//! In-process customization session engine.
//!
//! Once injected into a host process, the engine brings up a hooking engine,
//! loads mods through a mods manager, and then waits: for the session manager
//! process to exit, for the host's last other thread to exit, or for mod
//! configuration to change (which triggers a hot reload). Teardown only
//! happens once hooks can be removed safely.
//!
//! The hooking engine, mods manager, configuration watch, private namespace
//! and child-process propagation are supplied by the caller through
//! [`Collaborators`]; OS primitives go through the [`Os`] trait.
//!
//! # Quickstart (Windows)
//! ```no_run
//! # #[cfg(windows)]
//! # fn demo(
//! #     session_manager: hook_session::SystemHandle,
//! #     collaborators: hook_session::Collaborators,
//! # ) -> hook_session::Result<()> {
//! use hook_session::Invocation;
//!
//! // On a thread the injector created for us: runs until the session ends.
//! hook_session::start(Invocation::DedicatedThread, session_manager, None, collaborators)?;
//! # Ok(())
//! # }
//! ```
//!
//! # Driving a custom `Os`
//! ```no_run
//! # fn demo<O: hook_session::Os>(
//! #     my_os: O,
//! #     session_manager: O::Handle,
//! #     collaborators: hook_session::Collaborators,
//! # ) -> hook_session::Result<()> {
//! use hook_session::{Invocation, Options, SessionSlot};
//!
//! let slot = SessionSlot::with_options(my_os, Options::default());
//! slot.start(
//!     Invocation::AsyncCallback { keep_attach_exempt: false },
//!     session_manager,
//!     None,
//!     collaborators,
//! )?;
//! # Ok(())
//! # }
//! ```
//!

mod collab;
#[cfg(windows)]
mod config_watch;
mod error;
mod hooking;
mod options;
mod os;
mod runner;
mod session;
mod slot;
mod strategy;
mod teardown;
mod wait_set;

pub use collab::{
    ChildPropagator, ChildPropagatorFactory, Collaborators, ConfigWatch, ConfigWatchFactory,
    ModsManager, ModsManagerFactory, NamespaceProvider, PrivateNamespace, SessionManagerRef,
};
#[cfg(windows)]
pub use config_watch::DirectoryChangeWatch;
pub use error::{Error, Result};
pub use hooking::{FreezeStrategy, HookEngine, HookFailure};
pub use options::Options;
pub use os::{IdentityLock, Os, RawWaitHandle, ThreadBody, ThreadProbe, ThreadSpec, Waitable};
#[cfg(windows)]
pub use os::{SemaphoreLock, SystemHandle, SystemOs};
pub use slot::SessionSlot;
pub use strategy::Invocation;

#[cfg(windows)]
mod global {
    use std::sync::OnceLock;
    use std::time::SystemTime;

    use crate::{Collaborators, Invocation, Result, SessionSlot, SystemHandle, SystemOs};

    // Never dropped: the session must not be destroyed by process-exit
    // unwinding, only by its own teardown path.
    static SLOT: OnceLock<SessionSlot<SystemOs>> = OnceLock::new();

    /// The session slot of the current process.
    pub fn slot() -> &'static SessionSlot<SystemOs> {
        SLOT.get_or_init(|| SessionSlot::new(SystemOs::new()))
    }

    /// Start the session of the current process. See [`SessionSlot::start`].
    pub fn start(
        invocation: Invocation,
        session_manager: SystemHandle,
        marker: Option<SystemHandle>,
        collaborators: Collaborators,
    ) -> Result<()> {
        slot().start(invocation, session_manager, marker, collaborators)
    }

    /// Process id of the session manager of the active session.
    pub fn session_manager_process_id() -> Result<u32> {
        slot().session_manager_process_id()
    }

    /// Creation time of the session manager of the active session.
    pub fn session_manager_creation_time() -> Result<SystemTime> {
        slot().session_manager_creation_time()
    }

    /// Whether the active session is about to end.
    pub fn is_ending_soon() -> Result<bool> {
        slot().is_ending_soon()
    }
}

#[cfg(windows)]
pub use global::{
    is_ending_soon, session_manager_creation_time, session_manager_process_id, slot, start,
};
