use std::sync::Arc;

use tracing::{debug, error, info, warn};

use crate::collab::{ChildPropagator, Collaborators, ModsManager, PrivateNamespace, SessionManagerRef};
use crate::hooking::{FreezeStrategy, HookEngineScope};
use crate::options::Options;
use crate::os::{IdentityLock, Os, Waitable};
use crate::runner::{LoopOutcome, MainLoopRunner};
use crate::slot::SessionSlot;
use crate::{Error, Result};

/// Holds the identity lock; releases it when dropped.
pub(crate) struct IdentityGuard<L: IdentityLock> {
    lock: L,
}

impl<L: IdentityLock> IdentityGuard<L> {
    pub(crate) fn new(lock: L) -> Self {
        Self { lock }
    }
}

impl<L: IdentityLock> Drop for IdentityGuard<L> {
    fn drop(&mut self) {
        self.lock.release();
    }
}

pub(crate) struct SessionInit<O: Os> {
    pub(crate) os: Arc<O>,
    pub(crate) options: Arc<Options>,
    pub(crate) slot: SessionSlot<O>,
    pub(crate) session_manager: Arc<O::Handle>,
    pub(crate) marker: Option<O::Handle>,
    pub(crate) collaborators: Collaborators,
    pub(crate) freeze: FreezeStrategy,
}

/// The customization session of this process.
///
/// Fields are released top to bottom after `Drop::drop` ran, which is the
/// reverse of construction order. The identity guard goes last, and the
/// teardown path takes it out beforehand so it outlives the slot entry too.
pub(crate) struct Session<O: Os> {
    _propagator: Option<Box<dyn ChildPropagator>>,
    mods: Box<dyn ModsManager>,
    hooks: HookEngineScope,
    _namespace: Option<PrivateNamespace>,
    _marker: Option<O::Handle>,
    runner: MainLoopRunner,
    last_thread_exit_code: u32,
    os: Arc<O>,
    options: Arc<Options>,
    slot: SessionSlot<O>,
    session_manager: Arc<O::Handle>,
    identity: Option<IdentityGuard<O::Lock>>,
}

impl<O: Os> Session<O> {
    /// Bring up the hooking engine, load mods and apply their hooks.
    pub(crate) fn new(init: SessionInit<O>) -> Result<Self> {
        let SessionInit {
            os,
            options,
            slot,
            session_manager,
            marker,
            collaborators,
            freeze,
        } = init;
        let Collaborators {
            hook_engine,
            mods_manager,
            config_watch,
            mut namespace,
            child_propagator,
        } = collaborators;

        let session_manager_pid = os.process_id(&session_manager)?;

        // The session manager creates the namespace in its own process.
        let namespace = if session_manager_pid == os.current_process_id() {
            None
        } else {
            Some(namespace.open(session_manager_pid).map_err(Error::namespace)?)
        };

        let mut hooks = HookEngineScope::init(hook_engine, freeze)?;
        let mut mods = mods_manager()?;

        let propagator = child_propagator.and_then(|factory| {
            let manager = SessionManagerRef {
                process_id: session_manager_pid,
                handle: session_manager.raw_wait_handle(),
            };
            factory(manager)
                .inspect_err(|err| warn!(error = %err, "child process propagation unavailable"))
                .ok()
        });

        hooks.apply_queued();

        if let Err(err) = mods.after_init() {
            warn!(error = %err, "mods manager AfterInit failed");
        }

        let runner = MainLoopRunner::new(config_watch);

        info!(session_manager_pid, "customization session initialized");
        Ok(Self {
            _propagator: propagator,
            mods,
            hooks,
            _namespace: namespace,
            _marker: marker,
            runner,
            last_thread_exit_code: 0,
            os,
            options,
            slot,
            session_manager,
            identity: None,
        })
    }

    pub(crate) fn set_identity(&mut self, identity: IdentityGuard<O::Lock>) {
        self.identity = Some(identity);
    }

    pub(crate) fn take_identity(&mut self) -> Option<IdentityGuard<O::Lock>> {
        self.identity.take()
    }

    pub(crate) fn os(&self) -> &Arc<O> {
        &self.os
    }

    pub(crate) fn options(&self) -> &Options {
        &self.options
    }

    pub(crate) fn slot(&self) -> &SessionSlot<O> {
        &self.slot
    }

    pub(crate) fn runner_mut(&mut self) -> &mut MainLoopRunner {
        &mut self.runner
    }

    pub(crate) fn last_thread_exit_code(&self) -> u32 {
        self.last_thread_exit_code
    }

    /// One pass of the runner, up to the first reload or termination decision.
    pub(crate) fn run_once(&mut self) -> LoopOutcome {
        let outcome = self.runner.run(
            &*self.os,
            &self.session_manager,
            self.options.debounce(),
            &mut self.last_thread_exit_code,
        );
        if outcome == LoopOutcome::Error {
            error!("engine wait loop exited abnormally");
        }
        outcome
    }

    /// Run until the session manager exits, the process runs out of other
    /// threads, or waiting fails. Reloads happen in between.
    pub(crate) fn run_main_loop(&mut self) -> LoopOutcome {
        let mut outcome = self.run_once();
        while outcome == LoopOutcome::ReloadPending {
            self.reload();
            outcome = self.run_once();
        }

        debug!("exiting engine thread wait loop");
        outcome
    }

    /// Re-arm the configuration watch and reload mods, unless code can't be
    /// modified right now.
    pub(crate) fn reload(&mut self) {
        self.runner.continue_monitoring();

        if self.os.dynamic_code_forbidden() {
            warn!("process prohibits dynamic code, cannot reload mods safely");
            return;
        }

        if let Err(err) = self.mods.reload_mods_and_settings() {
            warn!(error = %err, "ReloadModsAndSettings failed");
        }
    }
}

impl<O: Os> Drop for Session<O> {
    fn drop(&mut self) {
        if let Err(err) = self.mods.before_uninit() {
            warn!(error = %err, "mods manager BeforeUninit failed");
        }

        self.hooks.disable_all();
    }
}
