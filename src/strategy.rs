//! Which thread drives the main loop, given how the engine was entered.
//!
//! ```text
//!  DedicatedThread ──────────────── loop ── teardown
//!
//!  AsyncCallback ─ spawn ─> AsyncAttachExempt
//!                              ├─ keep_attach_exempt ─ loop ── teardown
//!                              └─ first decision ─ spawn ─> AsyncNormal
//!                                                             ├─ reload ─ loop ── teardown
//!                                                             └─ teardown
//! ```
//!
//! Threads started from an asynchronous callback are created with
//! thread-attach callbacks suppressed, since running TLS and DllMain
//! callbacks that early can crash the process. Mods may depend on normal
//! callback semantics though, so unless the caller asks to stay exempt, the
//! first reload or unload moves to a second, unrestricted thread.

use std::panic::{self, AssertUnwindSafe};
use std::sync::{Arc, Mutex, PoisonError};

use tracing::{debug, error};

use crate::os::{Os, ThreadSpec};
use crate::runner::LoopOutcome;
use crate::session::Session;
use crate::teardown::teardown;

/// How the engine was entered in the target process.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Invocation {
    /// On a thread created for the engine before injection.
    DedicatedThread,
    /// From an asynchronous callback, e.g. a queued APC early in process
    /// startup.
    AsyncCallback {
        /// Keep thread-attach callbacks suppressed for the whole session.
        keep_attach_exempt: bool,
    },
}

impl Invocation {
    /// Whether the engine was entered from an asynchronous callback. Such
    /// starts never block on the identity lock and hook without freezing
    /// threads.
    ///
    /// # Examples
    /// ```
    /// use hook_session::Invocation;
    ///
    /// assert!(Invocation::AsyncCallback { keep_attach_exempt: false }.is_async());
    /// assert!(!Invocation::DedicatedThread.is_async());
    /// ```
    pub fn is_async(&self) -> bool {
        matches!(self, Invocation::AsyncCallback { .. })
    }
}

/// Execution state of the thread currently driving the loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Stage {
    DedicatedThread,
    AsyncAttachExempt { keep: bool },
    AsyncNormal { reload_first: bool },
}

impl Stage {
    fn initial(invocation: Invocation) -> Self {
        match invocation {
            Invocation::DedicatedThread => Stage::DedicatedThread,
            Invocation::AsyncCallback { keep_attach_exempt } => {
                Stage::AsyncAttachExempt { keep: keep_attach_exempt }
            }
        }
    }

    /// Thread this stage needs, or `None` to run on the current one.
    fn thread_spec<O: Os>(self, session: &Session<O>) -> Option<ThreadSpec> {
        let options = session.options();
        match self {
            Stage::DedicatedThread => None,
            Stage::AsyncAttachExempt { .. } => Some(ThreadSpec {
                name: options.thread_name_attach_exempt().to_string(),
                attach_exempt: true,
            }),
            Stage::AsyncNormal { .. } => Some(ThreadSpec {
                name: options.thread_name_main().to_string(),
                attach_exempt: false,
            }),
        }
    }

    /// Drive the session in this stage. Returns the exit code for the thread.
    fn run<O: Os>(self, mut session: Box<Session<O>>) -> u32 {
        debug!(stage = ?self, "engine stage running");
        match self {
            Stage::DedicatedThread | Stage::AsyncAttachExempt { keep: true } => {
                guarded(&mut session, Session::run_main_loop);
                finish(session)
            }
            Stage::AsyncAttachExempt { keep: false } => {
                let outcome = guarded(&mut session, Session::run_once);
                let exit_code = session.last_thread_exit_code();
                let next = Stage::AsyncNormal {
                    reload_first: outcome == LoopOutcome::ReloadPending,
                };
                enter(next, session);
                exit_code
            }
            Stage::AsyncNormal { reload_first } => {
                if reload_first {
                    guarded(&mut session, |session| {
                        session.reload();
                        session.run_main_loop()
                    });
                }
                finish(session)
            }
        }
    }
}

/// Run mod and collaborator code on the engine thread. A panic counts as a
/// failed wait so the session still leaves through `teardown`.
fn guarded<O: Os>(
    session: &mut Session<O>,
    step: impl FnOnce(&mut Session<O>) -> LoopOutcome,
) -> LoopOutcome {
    panic::catch_unwind(AssertUnwindSafe(|| step(session))).unwrap_or_else(|_| {
        error!("engine main loop panicked, unloading");
        LoopOutcome::Error
    })
}

/// Start driving a freshly constructed session.
pub(crate) fn launch<O: Os>(session: Box<Session<O>>, invocation: Invocation) {
    enter(Stage::initial(invocation), session);
}

fn enter<O: Os>(stage: Stage, mut session: Box<Session<O>>) {
    let Some(spec) = stage.thread_spec(&session) else {
        stage.run(session);
        return;
    };

    if !session.runner_mut().can_run_across_threads() {
        session.runner_mut().disable_watch();
    }

    let os = Arc::clone(session.os());
    let handoff = Arc::new(Mutex::new(Some(session)));
    let thread_handoff = Arc::clone(&handoff);
    let spawned = os.spawn_thread(
        spec,
        Box::new(move || match take(&thread_handoff) {
            Some(session) => stage.run(session),
            None => 0,
        }),
    );

    if let Err(err) = spawned {
        error!(error = %err, stage = ?stage, "engine thread creation failed, unloading");
        if let Some(session) = take(&handoff) {
            teardown(session);
        }
    }
}

fn finish<O: Os>(session: Box<Session<O>>) -> u32 {
    let exit_code = session.last_thread_exit_code();
    teardown(session);
    exit_code
}

fn take<O: Os>(handoff: &Mutex<Option<Box<Session<O>>>>) -> Option<Box<Session<O>>> {
    handoff.lock().unwrap_or_else(PoisonError::into_inner).take()
}
