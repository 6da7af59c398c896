use std::time::Duration;

use tracing::{debug, error, trace, warn};

use crate::collab::{ConfigWatch, ConfigWatchFactory};
use crate::os::{Os, ThreadProbe, Waitable};
use crate::wait_set::{Signal, WaitSet};

/// Why [`MainLoopRunner::run`] stopped waiting.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum LoopOutcome {
    /// The session manager exited or the process has no other live thread.
    Completed,
    /// Configuration changed and the debounce window passed quietly.
    ReloadPending,
    /// The wait primitive failed. Handled like `Completed`.
    Error,
}

/// Waits on the session manager, a live thread of the process and the
/// configuration watch, and decides what happens next.
pub(crate) struct MainLoopRunner {
    watch: Option<Box<dyn ConfigWatch>>,
}

impl MainLoopRunner {
    /// Create the runner. If the configuration watch can't be created the
    /// runner only reacts to process and thread exit.
    pub(crate) fn new(factory: ConfigWatchFactory) -> Self {
        let watch = match factory() {
            Ok(watch) => Some(watch),
            Err(err) => {
                warn!(error = %err, "config change notification unavailable");
                None
            }
        };
        Self { watch }
    }

    pub(crate) fn watch_enabled(&self) -> bool {
        self.watch.is_some()
    }

    /// Turn off configuration watching for the rest of the session.
    pub(crate) fn disable_watch(&mut self) {
        if self.watch.take().is_some() {
            debug!("config change notification disabled");
        }
    }

    /// Whether this runner may keep going on a thread other than the one
    /// that created the watch.
    pub(crate) fn can_run_across_threads(&self) -> bool {
        self.watch
            .as_ref()
            .is_none_or(|watch| watch.can_monitor_across_threads())
    }

    /// Re-arm the configuration watch. A failure disables it for good.
    pub(crate) fn continue_monitoring(&mut self) -> bool {
        let Some(watch) = self.watch.as_mut() else {
            return false;
        };

        if let Err(err) = watch.continue_monitoring() {
            warn!(error = %err, "re-arming config change notification failed");
            self.watch = None;
            return false;
        }

        true
    }

    /// Wait until the loop completes or a reload is due.
    ///
    /// Exit codes of threads observed exiting are stored in
    /// `last_thread_exit_code`.
    pub(crate) fn run<O: Os>(
        &mut self,
        os: &O,
        session_manager: &O::Handle,
        debounce: Duration,
        last_thread_exit_code: &mut u32,
    ) -> LoopOutcome {
        let session_manager = session_manager.raw_wait_handle();

        loop {
            let thread = match os.first_live_thread() {
                ThreadProbe::Alive(thread) => Some(thread),
                ThreadProbe::NoneLeft => return LoopOutcome::Completed,
                ThreadProbe::Unavailable => None,
            };

            let wait_set = WaitSet::new(session_manager)
                .with_thread(thread.as_ref().map(Waitable::raw_wait_handle))
                .with_config_watch(self.watch.as_ref().map(|watch| watch.wait_handle()));
            trace!(members = wait_set.len(), "waiting");

            let signal = match wait_set.wait(os) {
                Ok(signal) => signal,
                Err(err) => {
                    error!(error = %err, "main loop wait failed");
                    return LoopOutcome::Error;
                }
            };

            match signal {
                Signal::SessionManagerExit => return LoopOutcome::Completed,
                Signal::ThreadExit => {
                    if let Some(thread) = &thread {
                        match os.thread_exit_code(thread) {
                            Ok(code) => *last_thread_exit_code = code,
                            Err(err) => debug!(error = %err, "GetExitCodeThread failed"),
                        }
                    }
                }
                Signal::ConfigChanged => {
                    // More changes often follow; give them, and a concurrent
                    // shutdown, a moment to land.
                    return match os.wait_any(&[session_manager], Some(debounce)) {
                        Ok(Some(_)) => LoopOutcome::Completed,
                        Ok(None) => LoopOutcome::ReloadPending,
                        Err(err) => {
                            debug!(error = %err, "debounce wait failed");
                            LoopOutcome::ReloadPending
                        }
                    };
                }
            }
        }
    }
}
