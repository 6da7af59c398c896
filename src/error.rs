use std::fmt;
use std::fmt::Display;

/// Result alias for this crate.
pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ErrorKind {
    LockUnavailable,
    AlreadyActive,
    Namespace,
    HookEngine,
    ThreadCreation,
    Wait,
    NoSession,
    NotSupported,
    Io,
    Collaborator,
}

/// Error type for this crate.
///
/// This is intentionally a struct to minimize breaking changes over time, and
/// only exposes its message via `Display`.
#[derive(Debug)]
pub struct Error {
    kind: ErrorKind,
    message: String,
    source: Option<Box<dyn std::error::Error + Send + Sync>>,
}

impl Error {
    /// Build an error reported by a collaborator (mods manager, config watch,
    /// namespace provider, hooking engine adapter).
    pub fn collaborator(msg: impl Display) -> Self {
        Self::new(ErrorKind::Collaborator, msg)
    }

    pub(crate) fn lock_unavailable(msg: impl Display) -> Self {
        Self::new(ErrorKind::LockUnavailable, msg)
    }

    pub(crate) fn already_active() -> Self {
        Self::new(
            ErrorKind::AlreadyActive,
            "only one session is supported at any given time",
        )
    }

    pub(crate) fn namespace(err: Error) -> Self {
        Self::wrap(ErrorKind::Namespace, "failed to open session private namespace", err)
    }

    pub(crate) fn hook_engine(msg: impl Display) -> Self {
        Self::new(ErrorKind::HookEngine, msg)
    }

    #[cfg_attr(not(windows), allow(dead_code))]
    pub(crate) fn thread_creation(err: std::io::Error) -> Self {
        Self {
            kind: ErrorKind::ThreadCreation,
            message: format!("thread creation failed: {err}"),
            source: Some(Box::new(err)),
        }
    }

    pub(crate) fn wait(err: std::io::Error) -> Self {
        Self {
            kind: ErrorKind::Wait,
            message: format!("wait failed: {err}"),
            source: Some(Box::new(err)),
        }
    }

    pub(crate) fn no_session() -> Self {
        Self::new(ErrorKind::NoSession, "no customization session is active")
    }

    #[cfg_attr(not(windows), allow(dead_code))]
    pub(crate) fn not_supported(msg: impl Display) -> Self {
        Self::new(ErrorKind::NotSupported, msg)
    }

    pub(crate) fn from_io(err: std::io::Error) -> Self {
        Self {
            kind: ErrorKind::Io,
            message: err.to_string(),
            source: Some(Box::new(err)),
        }
    }

    #[cfg(windows)]
    pub(crate) fn last_os_error() -> Self {
        Self::from_io(std::io::Error::last_os_error())
    }

    fn new(kind: ErrorKind, msg: impl Display) -> Self {
        Self {
            kind,
            message: msg.to_string(),
            source: None,
        }
    }

    fn wrap(kind: ErrorKind, context: &str, err: Error) -> Self {
        Self {
            kind,
            message: format!("{context}: {}", err.message),
            source: Some(Box::new(err)),
        }
    }

    /// Returns true if the identity lock could not be acquired.
    pub fn is_lock_unavailable(&self) -> bool {
        self.kind == ErrorKind::LockUnavailable
    }

    /// Returns true if a session already exists in this process.
    pub fn is_already_active(&self) -> bool {
        self.kind == ErrorKind::AlreadyActive
    }

    /// Returns true if the session private namespace could not be opened.
    pub fn is_namespace(&self) -> bool {
        self.kind == ErrorKind::Namespace
    }

    /// Returns true if the hooking engine failed to initialize.
    pub fn is_hook_engine(&self) -> bool {
        self.kind == ErrorKind::HookEngine
    }

    /// Returns true if an engine thread could not be created.
    pub fn is_thread_creation(&self) -> bool {
        self.kind == ErrorKind::ThreadCreation
    }

    /// Returns true if a wait primitive failed.
    pub fn is_wait(&self) -> bool {
        self.kind == ErrorKind::Wait
    }

    /// Returns true if the operation needs an active session and none exists.
    pub fn is_no_session(&self) -> bool {
        self.kind == ErrorKind::NoSession
    }

    /// Returns true if this operation is not supported on the current platform.
    pub fn is_not_supported(&self) -> bool {
        self.kind == ErrorKind::NotSupported
    }

    /// Returns true if the error was raised by a collaborator.
    pub fn is_collaborator(&self) -> bool {
        self.kind == ErrorKind::Collaborator
    }
}

impl Clone for Error {
    fn clone(&self) -> Self {
        Self {
            kind: self.kind,
            message: self.message.clone(),
            source: None,
        }
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.message)
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        self.source
            .as_deref()
            .map(|e| e as &(dyn std::error::Error + 'static))
    }
}

impl From<std::io::Error> for Error {
    fn from(err: std::io::Error) -> Self {
        Error::from_io(err)
    }
}
