use crate::Result;
use crate::os::{Os, RawWaitHandle};

const MAX_WAIT_HANDLES: usize = 3;

/// Which member of a [`WaitSet`] fired.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Signal {
    SessionManagerExit,
    ThreadExit,
    ConfigChanged,
}

/// Up to three waitable conditions, rebuilt on every loop iteration.
#[derive(Debug)]
pub(crate) struct WaitSet {
    handles: [RawWaitHandle; MAX_WAIT_HANDLES],
    signals: [Signal; MAX_WAIT_HANDLES],
    len: usize,
}

impl WaitSet {
    pub(crate) fn new(session_manager: RawWaitHandle) -> Self {
        Self {
            handles: [session_manager; MAX_WAIT_HANDLES],
            signals: [Signal::SessionManagerExit; MAX_WAIT_HANDLES],
            len: 1,
        }
    }

    pub(crate) fn with_thread(self, thread: Option<RawWaitHandle>) -> Self {
        match thread {
            Some(handle) => self.push(handle, Signal::ThreadExit),
            None => self,
        }
    }

    pub(crate) fn with_config_watch(self, watch: Option<RawWaitHandle>) -> Self {
        match watch {
            Some(handle) => self.push(handle, Signal::ConfigChanged),
            None => self,
        }
    }

    fn push(mut self, handle: RawWaitHandle, signal: Signal) -> Self {
        debug_assert!(self.len < MAX_WAIT_HANDLES);
        self.handles[self.len] = handle;
        self.signals[self.len] = signal;
        self.len += 1;
        self
    }

    pub(crate) fn len(&self) -> usize {
        self.len
    }

    /// Block until a member fires.
    pub(crate) fn wait<O: Os>(&self, os: &O) -> Result<Signal> {
        let handles = &self.handles[..self.len];
        match os.wait_any(handles, None)? {
            Some(index) if index < self.len => Ok(self.signals[index]),
            other => Err(crate::Error::wait(std::io::Error::other(format!(
                "unexpected infinite wait result {other:?} for {} handles",
                self.len
            )))),
        }
    }
}
