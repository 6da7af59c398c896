#![allow(dead_code)]

use std::collections::{HashSet, VecDeque};
use std::sync::mpsc::Receiver;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::thread::JoinHandle;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use hook_session::{
    ChildPropagator, Collaborators, ConfigWatch, Error, FreezeStrategy, HookEngine, HookFailure,
    IdentityLock, ModsManager, NamespaceProvider, Os, PrivateNamespace, RawWaitHandle, Result,
    SessionManagerRef, SessionSlot, ThreadBody, ThreadProbe, ThreadSpec, Waitable,
};

pub const CURRENT_PID: u32 = 4242;
pub const MANAGER_PID: u32 = 7;
pub const MANAGER: RawWaitHandle = RawWaitHandle(1);
pub const WATCH: RawWaitHandle = RawWaitHandle(2);
const FIRST_THREAD: usize = 100;

pub fn init_logging() {
    let _ = tracing_subscriber::fmt()
        .with_max_level(tracing::Level::TRACE)
        .with_test_writer()
        .try_init();
}

//=== Journal ===

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Event {
    LockAcquired,
    LockReleased,
    NamespaceOpened(u32),
    NamespaceClosed,
    HookInit,
    Freeze(FreezeStrategy),
    ApplyQueued { continue_on_error: bool },
    DisableAll,
    HookUninit,
    ModsLoaded,
    AfterInit,
    BeforeUninit,
    Reload { thread: Option<String> },
    ModsDropped,
    PropagatorStarted(u32),
    PropagatorStopped,
    WatchRearmed,
    WatchDropped,
    Spawned(ThreadSpec),
    Sleep(Duration),
}

/// Shared record of collaborator calls, plus the fake watch's signal state.
#[derive(Debug, Clone, Default)]
pub struct Journal {
    events: Arc<Mutex<Vec<Event>>>,
    watch_signaled: Arc<AtomicBool>,
}

impl Journal {
    pub fn push(&self, event: Event) {
        self.events.lock().unwrap().push(event);
    }

    pub fn events(&self) -> Vec<Event> {
        self.events.lock().unwrap().clone()
    }

    pub fn count(&self, event: &Event) -> usize {
        self.events().iter().filter(|e| *e == event).count()
    }

    pub fn position(&self, event: &Event) -> Option<usize> {
        self.events().iter().position(|e| e == event)
    }

    pub fn reloads(&self) -> usize {
        self.events()
            .iter()
            .filter(|e| matches!(e, Event::Reload { .. }))
            .count()
    }

    fn signal_watch(&self) {
        self.watch_signaled.store(true, Ordering::SeqCst);
    }

    fn reset_watch(&self) {
        self.watch_signaled.store(false, Ordering::SeqCst);
    }

    fn take_watch_signal(&self) -> bool {
        self.watch_signaled.swap(false, Ordering::SeqCst)
    }
}

//=== Fake OS ===

#[derive(Debug)]
pub struct FakeHandle {
    raw: RawWaitHandle,
    pid: u32,
}

impl Waitable for FakeHandle {
    fn raw_wait_handle(&self) -> RawWaitHandle {
        self.raw
    }
}

/// What the next wait call observes.
#[derive(Debug)]
pub enum Step {
    ManagerExit,
    /// The thread currently in the wait set exits.
    ThreadExit,
    ConfigChange,
    /// The wait times out.
    Quiet,
    /// The wait times out, but the configuration changed again meanwhile:
    /// the watch stays signaled until it is re-armed.
    ChangeDuringDebounce,
    Fail,
    /// Block until the sender fires (or is dropped), then the manager exits.
    ManagerExitWhen(Receiver<()>),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WaitCall {
    pub handles: Vec<RawWaitHandle>,
    pub timeout: Option<Duration>,
}

#[derive(Debug)]
struct FakeThread {
    raw: RawWaitHandle,
    exit_code: u32,
    alive: bool,
}

#[derive(Debug, Default)]
struct State {
    threads: Vec<FakeThread>,
    threads_unavailable: bool,
    script: VecDeque<Step>,
    waits: Vec<WaitCall>,
    forbidden: VecDeque<bool>,
    spawn_failures: VecDeque<bool>,
    manager_signaled: bool,
    exit_codes: Vec<u32>,
}

#[derive(Debug, Default)]
struct LockRegistry {
    held: Mutex<HashSet<String>>,
    released: Condvar,
    always_grant: bool,
}

struct Inner {
    journal: Journal,
    state: Mutex<State>,
    locks: LockRegistry,
    lock_names: Mutex<Vec<String>>,
    spawned: Mutex<Vec<JoinHandle<u32>>>,
}

/// Scripted OS. Clones share all state.
#[derive(Clone)]
pub struct FakeOs {
    inner: Arc<Inner>,
}

impl FakeOs {
    pub fn new(journal: &Journal) -> FakeOs {
        Self::build(journal, false)
    }

    /// Identity lock that never blocks anybody.
    pub fn with_permissive_lock(journal: &Journal) -> FakeOs {
        Self::build(journal, true)
    }

    fn build(journal: &Journal, always_grant: bool) -> FakeOs {
        FakeOs {
            inner: Arc::new(Inner {
                journal: journal.clone(),
                state: Mutex::new(State::default()),
                locks: LockRegistry {
                    always_grant,
                    ..LockRegistry::default()
                },
                lock_names: Mutex::new(Vec::new()),
                spawned: Mutex::new(Vec::new()),
            }),
        }
    }

    /// Other threads of the process, by exit code.
    pub fn threads(self, exit_codes: &[u32]) -> FakeOs {
        {
            let mut state = self.inner.state.lock().unwrap();
            state.threads = exit_codes
                .iter()
                .enumerate()
                .map(|(i, &exit_code)| FakeThread {
                    raw: RawWaitHandle(FIRST_THREAD + i),
                    exit_code,
                    alive: true,
                })
                .collect();
        }
        self
    }

    pub fn threads_unavailable(self) -> FakeOs {
        self.inner.state.lock().unwrap().threads_unavailable = true;
        self
    }

    pub fn script(self, steps: impl IntoIterator<Item = Step>) -> FakeOs {
        self.inner.state.lock().unwrap().script.extend(steps);
        self
    }

    /// Successive answers of the dynamic-code mitigation query; `false` after.
    pub fn forbidden(self, answers: &[bool]) -> FakeOs {
        self.inner
            .state
            .lock()
            .unwrap()
            .forbidden
            .extend(answers.iter().copied());
        self
    }

    /// Successive thread creation results (`true` = refuse); success after.
    pub fn refuse_spawns(self, refusals: &[bool]) -> FakeOs {
        self.inner
            .state
            .lock()
            .unwrap()
            .spawn_failures
            .extend(refusals.iter().copied());
        self
    }

    pub fn signal_manager(&self) {
        self.inner.state.lock().unwrap().manager_signaled = true;
    }

    pub fn session_manager(&self) -> FakeHandle {
        self.session_manager_with_pid(MANAGER_PID)
    }

    pub fn session_manager_with_pid(&self, pid: u32) -> FakeHandle {
        FakeHandle { raw: MANAGER, pid }
    }

    pub fn waits(&self) -> Vec<WaitCall> {
        self.inner.state.lock().unwrap().waits.clone()
    }

    /// Infinite waits issued by the main loop.
    pub fn main_waits(&self) -> Vec<WaitCall> {
        self.waits()
            .into_iter()
            .filter(|call| call.timeout.is_none())
            .collect()
    }

    pub fn lock_names(&self) -> Vec<String> {
        self.inner.lock_names.lock().unwrap().clone()
    }

    pub fn lock_held(&self) -> bool {
        !self.inner.locks.held.lock().unwrap().is_empty()
    }

    /// Join every engine thread, including the ones they start.
    pub fn join_all(&self) -> Vec<u32> {
        loop {
            let handles: Vec<_> = self.inner.spawned.lock().unwrap().drain(..).collect();
            if handles.is_empty() {
                break;
            }
            for handle in handles {
                let code = handle.join().expect("engine thread panicked");
                self.inner.state.lock().unwrap().exit_codes.push(code);
            }
        }
        self.inner.state.lock().unwrap().exit_codes.clone()
    }

    pub fn slot(&self) -> SessionSlot<FakeOs> {
        SessionSlot::new(self.clone())
    }
}

pub struct FakeLock {
    name: String,
    inner: Arc<Inner>,
}

impl IdentityLock for FakeLock {
    fn acquire(&self, timeout: Option<Duration>) -> Result<bool> {
        let locks = &self.inner.locks;
        if locks.always_grant {
            self.inner.journal.push(Event::LockAcquired);
            return Ok(true);
        }

        let mut held = locks.held.lock().unwrap();
        while held.contains(&self.name) {
            if timeout == Some(Duration::ZERO) {
                return Ok(false);
            }
            held = locks.released.wait(held).unwrap();
        }
        held.insert(self.name.clone());
        self.inner.journal.push(Event::LockAcquired);
        Ok(true)
    }

    fn release(&self) {
        let locks = &self.inner.locks;
        locks.held.lock().unwrap().remove(&self.name);
        self.inner.journal.push(Event::LockReleased);
        locks.released.notify_all();
    }
}

impl Os for FakeOs {
    type Handle = FakeHandle;
    type Lock = FakeLock;

    fn current_process_id(&self) -> u32 {
        CURRENT_PID
    }

    fn open_identity_lock(&self, name: &str) -> Result<FakeLock> {
        self.inner.lock_names.lock().unwrap().push(name.to_string());
        Ok(FakeLock {
            name: name.to_string(),
            inner: Arc::clone(&self.inner),
        })
    }

    fn first_live_thread(&self) -> ThreadProbe<FakeHandle> {
        let state = self.inner.state.lock().unwrap();
        if state.threads_unavailable {
            return ThreadProbe::Unavailable;
        }

        match state.threads.iter().find(|thread| thread.alive) {
            Some(thread) => ThreadProbe::Alive(FakeHandle {
                raw: thread.raw,
                pid: CURRENT_PID,
            }),
            None => ThreadProbe::NoneLeft,
        }
    }

    fn thread_exit_code(&self, thread: &FakeHandle) -> Result<u32> {
        let state = self.inner.state.lock().unwrap();
        state
            .threads
            .iter()
            .find(|t| t.raw == thread.raw)
            .map(|t| t.exit_code)
            .ok_or_else(|| Error::collaborator("unknown thread"))
    }

    fn wait_any(
        &self,
        handles: &[RawWaitHandle],
        timeout: Option<Duration>,
    ) -> Result<Option<usize>> {
        if timeout == Some(Duration::ZERO) {
            let state = self.inner.state.lock().unwrap();
            let signaled = handles.first() == Some(&MANAGER) && state.manager_signaled;
            return Ok(signaled.then_some(0));
        }

        let step = {
            let mut state = self.inner.state.lock().unwrap();
            state.waits.push(WaitCall {
                handles: handles.to_vec(),
                timeout,
            });
            if handles.contains(&WATCH) && self.inner.journal.take_watch_signal() {
                Step::ConfigChange
            } else {
                state.script.pop_front().unwrap_or(Step::ManagerExit)
            }
        };

        let index_of = |raw: RawWaitHandle| {
            handles
                .iter()
                .position(|h| *h == raw)
                .map(Some)
                .ok_or_else(|| Error::collaborator(format!("{raw:?} is not in the wait set")))
        };

        match step {
            Step::ManagerExit => index_of(MANAGER),
            Step::ConfigChange => index_of(WATCH),
            Step::Quiet => Ok(None),
            Step::ChangeDuringDebounce => {
                self.inner.journal.signal_watch();
                Ok(None)
            }
            Step::Fail => Err(Error::collaborator("scripted wait failure")),
            Step::ManagerExitWhen(gate) => {
                let _ = gate.recv();
                index_of(MANAGER)
            }
            Step::ThreadExit => {
                let mut state = self.inner.state.lock().unwrap();
                let thread = state
                    .threads
                    .iter_mut()
                    .find(|t| t.alive && handles.contains(&t.raw))
                    .ok_or_else(|| Error::collaborator("no thread in the wait set"))?;
                thread.alive = false;
                let raw = thread.raw;
                drop(state);
                index_of(raw)
            }
        }
    }

    fn process_id(&self, process: &FakeHandle) -> Result<u32> {
        Ok(process.pid)
    }

    fn process_creation_time(&self, process: &FakeHandle) -> Result<SystemTime> {
        Ok(UNIX_EPOCH + Duration::from_secs(u64::from(process.pid)))
    }

    fn dynamic_code_forbidden(&self) -> bool {
        self.inner
            .state
            .lock()
            .unwrap()
            .forbidden
            .pop_front()
            .unwrap_or(false)
    }

    fn spawn_thread(&self, spec: ThreadSpec, body: ThreadBody) -> Result<()> {
        let refuse = self
            .inner
            .state
            .lock()
            .unwrap()
            .spawn_failures
            .pop_front()
            .unwrap_or(false);
        if refuse {
            return Err(Error::collaborator("thread creation refused"));
        }

        self.inner.journal.push(Event::Spawned(spec.clone()));
        let handle = std::thread::Builder::new()
            .name(spec.name)
            .spawn(body)
            .map_err(Error::from)?;
        self.inner.spawned.lock().unwrap().push(handle);
        Ok(())
    }

    fn sleep(&self, duration: Duration) {
        self.inner.journal.push(Event::Sleep(duration));
    }
}

//=== Fake collaborators ===

#[derive(Debug, Clone)]
pub struct CollabConfig {
    pub hook_init_fails: bool,
    pub hook_failures: Vec<HookFailure>,
    pub mods_load_fails: bool,
    pub after_init_fails: bool,
    pub reload_fails: bool,
    pub reload_panics: bool,
    pub namespace_fails: bool,
    pub watch_available: bool,
    pub watch_across_threads: bool,
    pub watch_rearm_fails: bool,
    pub propagator: bool,
}

impl Default for CollabConfig {
    fn default() -> Self {
        Self {
            hook_init_fails: false,
            hook_failures: Vec::new(),
            mods_load_fails: false,
            after_init_fails: false,
            reload_fails: false,
            reload_panics: false,
            namespace_fails: false,
            watch_available: true,
            watch_across_threads: true,
            watch_rearm_fails: false,
            propagator: true,
        }
    }
}

pub fn collaborators(journal: &Journal, config: &CollabConfig) -> Collaborators {
    let mods_journal = journal.clone();
    let mods_config = config.clone();
    let watch_journal = journal.clone();
    let watch_config = config.clone();
    let propagator_journal = journal.clone();

    Collaborators {
        hook_engine: Box::new(FakeHookEngine {
            journal: journal.clone(),
            init_fails: config.hook_init_fails,
            failures: config.hook_failures.clone(),
        }),
        mods_manager: Box::new(move || -> Result<Box<dyn ModsManager>> {
            if mods_config.mods_load_fails {
                return Err(Error::collaborator("mods failed to load"));
            }
            mods_journal.push(Event::ModsLoaded);
            Ok(Box::new(FakeMods {
                journal: mods_journal,
                after_init_fails: mods_config.after_init_fails,
                reload_fails: mods_config.reload_fails,
                reload_panics: mods_config.reload_panics,
            }))
        }),
        config_watch: Box::new(move || -> Result<Box<dyn ConfigWatch>> {
            if !watch_config.watch_available {
                return Err(Error::collaborator("registry key missing"));
            }
            Ok(Box::new(FakeWatch {
                journal: watch_journal,
                across_threads: watch_config.watch_across_threads,
                rearm_fails: watch_config.watch_rearm_fails,
            }))
        }),
        namespace: Box::new(FakeNamespaceProvider {
            journal: journal.clone(),
            fails: config.namespace_fails,
        }),
        child_propagator: config.propagator.then(|| {
            Box::new(move |manager: SessionManagerRef| -> Result<Box<dyn ChildPropagator>> {
                propagator_journal.push(Event::PropagatorStarted(manager.process_id));
                Ok(Box::new(FakePropagator {
                    journal: propagator_journal,
                }))
            }) as hook_session::ChildPropagatorFactory
        }),
    }
}

struct FakeHookEngine {
    journal: Journal,
    init_fails: bool,
    failures: Vec<HookFailure>,
}

impl HookEngine for FakeHookEngine {
    fn initialize(&mut self) -> Result<()> {
        if self.init_fails {
            return Err(Error::collaborator("MH_ERROR_MEMORY_ALLOC"));
        }
        self.journal.push(Event::HookInit);
        Ok(())
    }

    fn uninitialize(&mut self) -> Result<()> {
        self.journal.push(Event::HookUninit);
        Err(Error::collaborator("uninitialize is only logged"))
    }

    fn set_freeze_strategy(&mut self, strategy: FreezeStrategy) {
        self.journal.push(Event::Freeze(strategy));
    }

    fn apply_queued(
        &mut self,
        continue_on_error: bool,
        on_failure: &mut dyn FnMut(HookFailure),
    ) -> Result<()> {
        self.journal.push(Event::ApplyQueued { continue_on_error });
        for failure in &self.failures {
            on_failure(*failure);
        }
        Ok(())
    }

    fn disable_all(&mut self) -> Result<()> {
        self.journal.push(Event::DisableAll);
        Ok(())
    }
}

struct FakeMods {
    journal: Journal,
    after_init_fails: bool,
    reload_fails: bool,
    reload_panics: bool,
}

impl ModsManager for FakeMods {
    fn after_init(&mut self) -> Result<()> {
        self.journal.push(Event::AfterInit);
        if self.after_init_fails {
            return Err(Error::collaborator("mod init callback failed"));
        }
        Ok(())
    }

    fn before_uninit(&mut self) -> Result<()> {
        self.journal.push(Event::BeforeUninit);
        Ok(())
    }

    fn reload_mods_and_settings(&mut self) -> Result<()> {
        let thread = std::thread::current().name().map(str::to_string);
        self.journal.push(Event::Reload { thread });
        if self.reload_panics {
            panic!("mod crashed while reloading");
        }
        if self.reload_fails {
            return Err(Error::collaborator("mod settings are corrupt"));
        }
        Ok(())
    }
}

impl Drop for FakeMods {
    fn drop(&mut self) {
        self.journal.push(Event::ModsDropped);
    }
}

struct FakeWatch {
    journal: Journal,
    across_threads: bool,
    rearm_fails: bool,
}

impl ConfigWatch for FakeWatch {
    fn wait_handle(&self) -> RawWaitHandle {
        WATCH
    }

    fn continue_monitoring(&mut self) -> Result<()> {
        if self.rearm_fails {
            return Err(Error::collaborator("RegNotifyChangeKeyValue failed"));
        }
        self.journal.reset_watch();
        self.journal.push(Event::WatchRearmed);
        Ok(())
    }

    fn can_monitor_across_threads(&self) -> bool {
        self.across_threads
    }
}

impl Drop for FakeWatch {
    fn drop(&mut self) {
        self.journal.push(Event::WatchDropped);
    }
}

struct FakeNamespaceProvider {
    journal: Journal,
    fails: bool,
}

struct NamespaceToken(Journal);

impl Drop for NamespaceToken {
    fn drop(&mut self) {
        self.0.push(Event::NamespaceClosed);
    }
}

impl NamespaceProvider for FakeNamespaceProvider {
    fn open(&mut self, session_manager_pid: u32) -> Result<PrivateNamespace> {
        if self.fails {
            return Err(Error::collaborator("OpenPrivateNamespace failed"));
        }
        self.journal.push(Event::NamespaceOpened(session_manager_pid));
        Ok(PrivateNamespace::new(NamespaceToken(self.journal.clone())))
    }
}

struct FakePropagator {
    journal: Journal,
}

impl ChildPropagator for FakePropagator {}

impl Drop for FakePropagator {
    fn drop(&mut self) {
        self.journal.push(Event::PropagatorStopped);
    }
}
