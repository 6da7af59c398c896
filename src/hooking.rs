//! Lifecycle binding for the external hooking engine.

use tracing::{error, warn};

use crate::{Error, Result};

/// How the hooking engine suspends other threads while patching code.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FreezeStrategy {
    /// Don't suspend anything. Only safe when no other thread can be
    /// executing the patched code, e.g. while running from an asynchronous
    /// callback early in process startup.
    None,
    /// Fast, best-effort suspension of the other threads.
    FastBestEffort,
}

/// A queued hook operation that failed during bulk apply.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HookFailure {
    /// Address of the function that was being patched.
    pub target: usize,
    /// Engine-specific status code.
    pub status: i32,
}

/// Contract of the code-patching engine. The patching algorithm itself is the
/// implementor's business; the session only drives its lifecycle.
pub trait HookEngine: Send {
    /// Bring the engine up. Called once, before any mod is loaded.
    fn initialize(&mut self) -> Result<()>;

    /// Shut the engine down. Called last, after hooks were disabled; a
    /// failure is only logged.
    fn uninitialize(&mut self) -> Result<()>;

    /// Select how other threads are suspended for subsequent operations.
    fn set_freeze_strategy(&mut self, strategy: FreezeStrategy);

    /// Apply every queued hook operation.
    ///
    /// With `continue_on_error`, a failing operation must not stop the others;
    /// each failure is passed to `on_failure`.
    fn apply_queued(
        &mut self,
        continue_on_error: bool,
        on_failure: &mut dyn FnMut(HookFailure),
    ) -> Result<()>;

    /// Remove every applied hook. Only called while code may be modified.
    fn disable_all(&mut self) -> Result<()>;
}

/// Initialized hooking engine, uninitialized on drop.
pub(crate) struct HookEngineScope {
    engine: Box<dyn HookEngine>,
    applied: bool,
}

impl HookEngineScope {
    /// Initialize the engine. Failure is fatal for the session.
    pub(crate) fn init(mut engine: Box<dyn HookEngine>, strategy: FreezeStrategy) -> Result<Self> {
        if let Err(err) = engine.initialize() {
            error!(error = %err, "hooking engine initialization failed");
            return Err(Error::hook_engine(format_args!(
                "failed to initialize hooking engine: {err}"
            )));
        }

        engine.set_freeze_strategy(strategy);
        Ok(Self {
            engine,
            applied: false,
        })
    }

    /// Apply everything queued while mods were loading, then switch to
    /// best-effort thread freezing for all later operations.
    pub(crate) fn apply_queued(&mut self) {
        let result = self.engine.apply_queued(true, &mut |failure| {
            warn!(
                address = format_args!("{:#x}", failure.target),
                status = format_args!("{:#010X}", failure.status),
                "hooking operation failed"
            );
        });
        if let Err(err) = result {
            warn!(error = %err, "applying queued hooks failed");
        }

        self.engine.set_freeze_strategy(FreezeStrategy::FastBestEffort);
        self.applied = true;
    }

    pub(crate) fn disable_all(&mut self) {
        if !self.applied {
            return;
        }

        if let Err(err) = self.engine.disable_all() {
            warn!(error = %err, "disabling hooks failed");
        }
        self.applied = false;
    }
}

impl Drop for HookEngineScope {
    fn drop(&mut self) {
        self.disable_all();
        if let Err(err) = self.engine.uninitialize() {
            warn!(error = %err, "hooking engine uninitialization failed");
        }
    }
}
