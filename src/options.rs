use std::time::Duration;

const DEFAULT_DEBOUNCE: Duration = Duration::from_millis(200);
const DEFAULT_BACKOFF_INITIAL: Duration = Duration::from_secs(1);
const DEFAULT_BACKOFF_MAX: Duration = Duration::from_secs(60);
const MIN_BACKOFF: Duration = Duration::from_millis(1);
const DEFAULT_SEMAPHORE_PREFIX: &str = "HookSessionSemaphore-pid=";
const DEFAULT_THREAD_NAME_ATTACH_EXEMPT: &str = "HookSessionMainLoopThreadAttachExempt";
const DEFAULT_THREAD_NAME_MAIN: &str = "HookSessionMainLoop";

/// Session tunables.
///
/// # Examples
/// ```
/// use hook_session::Options;
/// use std::time::Duration;
///
/// let options = Options::default().with_debounce(Duration::from_millis(50));
/// assert_eq!(options.debounce(), Duration::from_millis(50));
/// ```
#[derive(Debug, Clone)]
pub struct Options {
    debounce: Duration,
    backoff_initial: Duration,
    backoff_max: Duration,
    semaphore_prefix: String,
    thread_name_attach_exempt: String,
    thread_name_main: String,
}

impl Default for Options {
    fn default() -> Self {
        Self {
            debounce: DEFAULT_DEBOUNCE,
            backoff_initial: DEFAULT_BACKOFF_INITIAL,
            backoff_max: DEFAULT_BACKOFF_MAX,
            semaphore_prefix: DEFAULT_SEMAPHORE_PREFIX.to_string(),
            thread_name_attach_exempt: DEFAULT_THREAD_NAME_ATTACH_EXEMPT.to_string(),
            thread_name_main: DEFAULT_THREAD_NAME_MAIN.to_string(),
        }
    }
}

impl Options {
    /// How long to wait for further configuration changes (or session
    /// manager exit) before reloading.
    pub fn with_debounce(mut self, debounce: Duration) -> Self {
        self.debounce = debounce;
        self
    }

    /// Backoff used while unloading is blocked by the dynamic-code
    /// mitigation: starts at `initial`, doubles, capped at `max`.
    ///
    /// `initial` is raised to at least one millisecond so the retry loop
    /// always yields.
    ///
    /// # Examples
    /// ```
    /// use hook_session::Options;
    /// use std::time::Duration;
    ///
    /// let options = Options::default().with_unload_backoff(Duration::ZERO, Duration::from_secs(5));
    /// assert_eq!(
    ///     options.unload_backoff(),
    ///     (Duration::from_millis(1), Duration::from_secs(5))
    /// );
    /// ```
    pub fn with_unload_backoff(mut self, initial: Duration, max: Duration) -> Self {
        let initial = initial.max(MIN_BACKOFF);
        self.backoff_initial = initial;
        self.backoff_max = max.max(initial);
        self
    }

    /// Prefix of the identity lock name; the current pid is appended.
    pub fn with_semaphore_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.semaphore_prefix = prefix.into();
        self
    }

    /// Descriptions given to the engine threads.
    pub fn with_thread_names(
        mut self,
        attach_exempt: impl Into<String>,
        main: impl Into<String>,
    ) -> Self {
        self.thread_name_attach_exempt = attach_exempt.into();
        self.thread_name_main = main.into();
        self
    }

    /// Quiet period required after a configuration change.
    pub fn debounce(&self) -> Duration {
        self.debounce
    }

    /// Initial and maximum retry delay while unloading is blocked.
    pub fn unload_backoff(&self) -> (Duration, Duration) {
        (self.backoff_initial, self.backoff_max)
    }

    /// Name of the identity lock for process `pid`.
    pub fn semaphore_name(&self, pid: u32) -> String {
        format!("{}{pid}", self.semaphore_prefix)
    }

    /// Description of the engine thread created without thread-attach
    /// callbacks.
    pub fn thread_name_attach_exempt(&self) -> &str {
        &self.thread_name_attach_exempt
    }

    /// Description of the unrestricted engine thread.
    pub fn thread_name_main(&self) -> &str {
        &self.thread_name_main
    }
}
