use std::io;
use std::os::windows::ffi::OsStrExt;
use std::path::{Path, PathBuf};

use windows_sys::Win32::Foundation::{HANDLE, INVALID_HANDLE_VALUE};
use windows_sys::Win32::Storage::FileSystem::{
    FILE_NOTIFY_CHANGE_FILE_NAME, FILE_NOTIFY_CHANGE_LAST_WRITE, FindCloseChangeNotification,
    FindFirstChangeNotificationW, FindNextChangeNotification,
};

use crate::collab::ConfigWatch;
use crate::os::RawWaitHandle;
use crate::{Error, Result};

/// Configuration watch backed by a directory change notification.
///
/// Fires when a file in the directory tree is created, renamed, deleted or
/// written. The notification isn't tied to the thread that armed it.
///
/// # Examples
/// ```no_run
/// use hook_session::DirectoryChangeWatch;
///
/// let watch = DirectoryChangeWatch::new(r"C:\ProgramData\HookSession\Settings")?;
/// # Ok::<(), hook_session::Error>(())
/// ```
#[derive(Debug)]
pub struct DirectoryChangeWatch {
    path: PathBuf,
    handle: HANDLE,
}

// The change handle is a process-wide kernel object.
unsafe impl Send for DirectoryChangeWatch {}

impl DirectoryChangeWatch {
    /// Start watching `path` and everything below it.
    pub fn new<P: AsRef<Path>>(path: P) -> Result<DirectoryChangeWatch> {
        let path = path.as_ref().to_path_buf();
        let wide: Vec<u16> = path
            .as_os_str()
            .encode_wide()
            .chain(std::iter::once(0))
            .collect();

        let handle = unsafe {
            FindFirstChangeNotificationW(
                wide.as_ptr(),
                1,
                FILE_NOTIFY_CHANGE_FILE_NAME | FILE_NOTIFY_CHANGE_LAST_WRITE,
            )
        };
        if handle == INVALID_HANDLE_VALUE {
            return Err(Error::from_io(io::Error::last_os_error()));
        }

        Ok(DirectoryChangeWatch { path, handle })
    }

    /// The watched directory.
    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl ConfigWatch for DirectoryChangeWatch {
    fn wait_handle(&self) -> RawWaitHandle {
        RawWaitHandle(self.handle as usize)
    }

    fn continue_monitoring(&mut self) -> Result<()> {
        if unsafe { FindNextChangeNotification(self.handle) } == 0 {
            return Err(Error::from_io(io::Error::last_os_error()));
        }
        Ok(())
    }

    fn can_monitor_across_threads(&self) -> bool {
        true
    }
}

impl Drop for DirectoryChangeWatch {
    fn drop(&mut self) {
        unsafe { FindCloseChangeNotification(self.handle) };
    }
}
