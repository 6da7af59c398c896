//! Collaborators the session orchestrates but does not implement.

use crate::Result;
use crate::hooking::HookEngine;
use crate::os::RawWaitHandle;

/// Loads, reloads and unloads the set of mods.
///
/// Constructing the manager loads the mods, which queue their hooks in the
/// hooking engine; the session applies them in bulk afterwards.
pub trait ModsManager: Send {
    /// Called once after the queued hooks were applied.
    fn after_init(&mut self) -> Result<()>;

    /// Called once before hooks are disabled and the engine is torn down.
    fn before_uninit(&mut self) -> Result<()>;

    /// Re-read mod configuration and settings, loading and unloading mods as
    /// needed.
    fn reload_mods_and_settings(&mut self) -> Result<()>;
}

/// Waitable notification that fires when mod configuration changes.
pub trait ConfigWatch: Send {
    fn wait_handle(&self) -> RawWaitHandle;

    /// Re-arm the notification after it fired.
    fn continue_monitoring(&mut self) -> Result<()>;

    /// Whether the notification keeps working when the thread that armed it
    /// exits and another thread waits on it.
    fn can_monitor_across_threads(&self) -> bool;
}

/// Opened session private namespace. Closed when dropped.
pub struct PrivateNamespace(Box<dyn Send>);

impl PrivateNamespace {
    /// Wrap whatever keeps the namespace open. It is dropped together with
    /// the session, after the hooking engine is uninitialized.
    ///
    /// # Examples
    /// ```
    /// use hook_session::PrivateNamespace;
    ///
    /// struct Boundary;
    ///
    /// let namespace = PrivateNamespace::new(Boundary);
    /// assert_eq!(format!("{namespace:?}"), "PrivateNamespace(..)");
    /// ```
    pub fn new(inner: impl Send + 'static) -> PrivateNamespace {
        PrivateNamespace(Box::new(inner))
    }
}

impl std::fmt::Debug for PrivateNamespace {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("PrivateNamespace(..)")
    }
}

/// Opens the namespace that scopes the session's named objects.
pub trait NamespaceProvider: Send {
    fn open(&mut self, session_manager_pid: u32) -> Result<PrivateNamespace>;
}

/// Best-effort propagation of the session into newly created child
/// processes. Stops when dropped.
pub trait ChildPropagator: Send {}

/// The session manager process, as seen by collaborators.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SessionManagerRef {
    pub process_id: u32,
    pub handle: RawWaitHandle,
}

pub type ModsManagerFactory = Box<dyn FnOnce() -> Result<Box<dyn ModsManager>> + Send>;
pub type ConfigWatchFactory = Box<dyn FnOnce() -> Result<Box<dyn ConfigWatch>> + Send>;
pub type ChildPropagatorFactory =
    Box<dyn FnOnce(SessionManagerRef) -> Result<Box<dyn ChildPropagator>> + Send>;

/// Everything a session needs from outside this crate.
pub struct Collaborators {
    pub hook_engine: Box<dyn HookEngine>,
    pub mods_manager: ModsManagerFactory,
    pub config_watch: ConfigWatchFactory,
    pub namespace: Box<dyn NamespaceProvider>,
    pub child_propagator: Option<ChildPropagatorFactory>,
}

impl std::fmt::Debug for Collaborators {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("Collaborators(..)")
    }
}
