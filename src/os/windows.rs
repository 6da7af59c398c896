use std::ffi::c_void;
use std::io;
use std::panic::{self, AssertUnwindSafe};
use std::ptr;
use std::sync::OnceLock;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use tracing::{debug, warn};
use windows_sys::Win32::Foundation::{
    CloseHandle, FILETIME, FreeLibrary, HANDLE, HMODULE, WAIT_OBJECT_0, WAIT_TIMEOUT,
};
use windows_sys::Win32::System::Diagnostics::Debug::{SEM_FAILCRITICALERRORS, SetThreadErrorMode};
use windows_sys::Win32::System::LibraryLoader::{
    FreeLibraryAndExitThread, GET_MODULE_HANDLE_EX_FLAG_FROM_ADDRESS, GetModuleHandleExW,
    GetModuleHandleW, GetProcAddress,
};
use windows_sys::Win32::System::Threading::{
    CreateSemaphoreW, GetCurrentProcess, GetCurrentProcessId, GetCurrentThreadId,
    GetExitCodeThread, GetProcessId, GetProcessTimes, GetThreadId, INFINITE, ReleaseSemaphore,
    Sleep, WaitForMultipleObjects, WaitForSingleObject,
};
use windows_sys::core::{PCSTR, PCWSTR};
use windows_sys::{s, w};

use super::{IdentityLock, Os, RawWaitHandle, ThreadBody, ThreadProbe, ThreadSpec, Waitable};
use crate::{Error, Result};

const STATUS_NO_MORE_ENTRIES: i32 = 0x8000_001A_u32 as i32;
const SYNCHRONIZE: u32 = 0x0010_0000;
const THREAD_QUERY_LIMITED_INFORMATION: u32 = 0x0800;
const THREAD_ALL_ACCESS: u32 = 0x001F_FFFF;
const THREAD_CREATE_FLAGS_SKIP_THREAD_ATTACH: u32 = 0x0000_0002;
const PROCESS_DYNAMIC_CODE_POLICY: i32 = 2;
const PROHIBIT_DYNAMIC_CODE: u32 = 0x1;
// 100ns intervals between 1601-01-01 and 1970-01-01.
const FILETIME_UNIX_EPOCH: u64 = 116_444_736_000_000_000;

type NtGetNextThreadFn = unsafe extern "system" fn(
    process: HANDLE,
    thread: HANDLE,
    desired_access: u32,
    handle_attributes: u32,
    flags: u32,
    new_thread: *mut HANDLE,
) -> i32;

type NtCreateThreadExFn = unsafe extern "system" fn(
    thread: *mut HANDLE,
    desired_access: u32,
    object_attributes: *const c_void,
    process: HANDLE,
    start_routine: *const c_void,
    argument: *const c_void,
    create_flags: u32,
    zero_bits: usize,
    stack_size: usize,
    maximum_stack_size: usize,
    attribute_list: *const c_void,
) -> i32;

type GetProcessMitigationPolicyFn = unsafe extern "system" fn(
    process: HANDLE,
    policy: i32,
    buffer: *mut c_void,
    length: usize,
) -> i32;

type SetThreadDescriptionFn = unsafe extern "system" fn(thread: HANDLE, description: PCWSTR) -> i32;

/// Owned Win32 handle, closed on drop.
#[derive(Debug)]
pub struct SystemHandle(HANDLE);

// Kernel handles are process-wide values; the wrapper only closes on drop.
unsafe impl Send for SystemHandle {}
unsafe impl Sync for SystemHandle {}

impl SystemHandle {
    /// # Safety
    /// `handle` must be a valid, open handle owned by the caller. Ownership
    /// moves into the returned value.
    pub unsafe fn from_raw(handle: HANDLE) -> SystemHandle {
        SystemHandle(handle)
    }

    /// Borrow the raw handle.
    pub fn as_raw(&self) -> HANDLE {
        self.0
    }
}

impl Drop for SystemHandle {
    fn drop(&mut self) {
        if !self.0.is_null() {
            unsafe { CloseHandle(self.0) };
        }
    }
}

impl Waitable for SystemHandle {
    fn raw_wait_handle(&self) -> RawWaitHandle {
        RawWaitHandle(self.0 as usize)
    }
}

/// Named semaphore backing the session identity lock.
#[derive(Debug)]
pub struct SemaphoreLock {
    semaphore: SystemHandle,
}

impl IdentityLock for SemaphoreLock {
    fn acquire(&self, timeout: Option<Duration>) -> Result<bool> {
        match unsafe { WaitForSingleObject(self.semaphore.as_raw(), to_millis(timeout)) } {
            WAIT_OBJECT_0 => Ok(true),
            WAIT_TIMEOUT => Ok(false),
            _ => Err(Error::wait(io::Error::last_os_error())),
        }
    }

    fn release(&self) {
        if unsafe { ReleaseSemaphore(self.semaphore.as_raw(), 1, ptr::null_mut()) } == 0 {
            warn!(error = %io::Error::last_os_error(), "ReleaseSemaphore failed");
        }
    }
}

/// Win32 implementation of [`Os`].
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemOs;

impl SystemOs {
    /// The current process.
    pub fn new() -> SystemOs {
        SystemOs
    }
}

impl Os for SystemOs {
    type Handle = SystemHandle;
    type Lock = SemaphoreLock;

    fn current_process_id(&self) -> u32 {
        unsafe { GetCurrentProcessId() }
    }

    fn open_identity_lock(&self, name: &str) -> Result<SemaphoreLock> {
        let name = to_wide(name);
        let handle = unsafe { CreateSemaphoreW(ptr::null(), 1, 1, name.as_ptr()) };
        if handle.is_null() {
            return Err(Error::lock_unavailable(format_args!(
                "failed to create session semaphore: {}",
                io::Error::last_os_error()
            )));
        }

        Ok(SemaphoreLock {
            semaphore: SystemHandle(handle),
        })
    }

    fn first_live_thread(&self) -> ThreadProbe<SystemHandle> {
        let Some(get_next_thread) = nt_get_next_thread() else {
            warn!("failed to resolve NtGetNextThread");
            return ThreadProbe::Unavailable;
        };

        let current_thread_id = unsafe { GetCurrentThreadId() };
        let mut previous: Option<SystemHandle> = None;
        loop {
            let mut next: HANDLE = ptr::null_mut();
            let status = unsafe {
                get_next_thread(
                    GetCurrentProcess(),
                    previous.as_ref().map_or(ptr::null_mut(), SystemHandle::as_raw),
                    THREAD_QUERY_LIMITED_INFORMATION | SYNCHRONIZE,
                    0,
                    0,
                    &mut next,
                )
            };

            if status == STATUS_NO_MORE_ENTRIES {
                if previous.is_none() {
                    warn!("failed to get first thread, likely a sandboxed process");
                    return ThreadProbe::Unavailable;
                }

                debug!("current process has no live threads left");
                return ThreadProbe::NoneLeft;
            }

            if status < 0 {
                warn!(status = format_args!("{status:#010X}"), "NtGetNextThread failed");
                return ThreadProbe::Unavailable;
            }

            let thread = SystemHandle(next);
            if unsafe { GetThreadId(thread.as_raw()) } == current_thread_id {
                previous = Some(thread);
                continue;
            }

            match unsafe { WaitForSingleObject(thread.as_raw(), 0) } {
                WAIT_OBJECT_0 => previous = Some(thread),
                WAIT_TIMEOUT => return ThreadProbe::Alive(thread),
                result => {
                    warn!(
                        result,
                        error = %io::Error::last_os_error(),
                        "WaitForSingleObject on thread failed"
                    );
                    return ThreadProbe::Unavailable;
                }
            }
        }
    }

    fn thread_exit_code(&self, thread: &SystemHandle) -> Result<u32> {
        let mut code = 0u32;
        if unsafe { GetExitCodeThread(thread.as_raw(), &mut code) } == 0 {
            return Err(Error::last_os_error());
        }
        Ok(code)
    }

    fn wait_any(
        &self,
        handles: &[RawWaitHandle],
        timeout: Option<Duration>,
    ) -> Result<Option<usize>> {
        let raw: Vec<HANDLE> = handles.iter().map(|h| h.0 as HANDLE).collect();
        let result = unsafe {
            WaitForMultipleObjects(raw.len() as u32, raw.as_ptr(), 0, to_millis(timeout))
        };

        if result == WAIT_TIMEOUT {
            return Ok(None);
        }

        let index = result.wrapping_sub(WAIT_OBJECT_0) as usize;
        if index < raw.len() {
            return Ok(Some(index));
        }

        Err(Error::wait(io::Error::other(format!(
            "WaitForMultipleObjects returned {result}, last error {}",
            io::Error::last_os_error()
        ))))
    }

    fn process_id(&self, process: &SystemHandle) -> Result<u32> {
        match unsafe { GetProcessId(process.as_raw()) } {
            0 => Err(Error::last_os_error()),
            pid => Ok(pid),
        }
    }

    fn process_creation_time(&self, process: &SystemHandle) -> Result<SystemTime> {
        let zero = FILETIME {
            dwLowDateTime: 0,
            dwHighDateTime: 0,
        };
        let (mut creation, mut exit, mut kernel, mut user) = (zero, zero, zero, zero);
        let ok = unsafe {
            GetProcessTimes(process.as_raw(), &mut creation, &mut exit, &mut kernel, &mut user)
        };
        if ok == 0 {
            return Err(Error::last_os_error());
        }

        let ticks = (u64::from(creation.dwHighDateTime) << 32) | u64::from(creation.dwLowDateTime);
        let since_unix = ticks.saturating_sub(FILETIME_UNIX_EPOCH);
        Ok(UNIX_EPOCH + Duration::from_nanos(since_unix.saturating_mul(100)))
    }

    fn dynamic_code_forbidden(&self) -> bool {
        let Some(get_policy) = get_process_mitigation_policy() else {
            warn!("failed to resolve GetProcessMitigationPolicy");
            return false;
        };

        let mut flags = 0u32;
        let ok = unsafe {
            get_policy(
                GetCurrentProcess(),
                PROCESS_DYNAMIC_CODE_POLICY,
                (&mut flags as *mut u32).cast(),
                size_of::<u32>(),
            )
        };
        ok != 0 && flags & PROHIBIT_DYNAMIC_CODE != 0
    }

    fn spawn_thread(&self, spec: ThreadSpec, body: ThreadBody) -> Result<()> {
        let create_thread = nt_create_thread_ex()
            .ok_or_else(|| Error::not_supported("NtCreateThreadEx is unavailable"))?;

        // Keep the engine image mapped for as long as the thread runs.
        let module = pin_engine_module()?;
        let start = Box::into_raw(Box::new(ThreadStart { body, module }));
        let flags = if spec.attach_exempt {
            THREAD_CREATE_FLAGS_SKIP_THREAD_ATTACH
        } else {
            0
        };

        let mut thread: HANDLE = ptr::null_mut();
        let status = unsafe {
            create_thread(
                &mut thread,
                THREAD_ALL_ACCESS,
                ptr::null(),
                GetCurrentProcess(),
                engine_thread_start as *const c_void,
                start as *const c_void,
                flags,
                0,
                0,
                0,
                ptr::null(),
            )
        };

        if status < 0 {
            unsafe {
                drop(Box::from_raw(start));
                FreeLibrary(module);
            }
            return Err(Error::thread_creation(io::Error::other(format!(
                "NtCreateThreadEx failed: {status:#010X}"
            ))));
        }

        let thread = SystemHandle(thread);
        set_thread_description(&thread, &spec.name);
        Ok(())
    }

    fn sleep(&self, duration: Duration) {
        unsafe { Sleep(to_millis(Some(duration))) };
    }
}

struct ThreadStart {
    body: ThreadBody,
    module: HMODULE,
}

unsafe extern "system" fn engine_thread_start(param: *mut c_void) -> u32 {
    let start = unsafe { Box::from_raw(param.cast::<ThreadStart>()) };
    let ThreadStart { body, module } = *start;

    // No critical-error dialogs, e.g. while loading a dll into a process with
    // a signature mitigation policy.
    unsafe { SetThreadErrorMode(SEM_FAILCRITICALERRORS, ptr::null_mut()) };

    let exit_code = panic::catch_unwind(AssertUnwindSafe(body)).unwrap_or_else(|_| {
        tracing::error!("engine thread panicked");
        u32::MAX
    });

    unsafe { FreeLibraryAndExitThread(module, exit_code) }
}

fn pin_engine_module() -> Result<HMODULE> {
    let mut module: HMODULE = ptr::null_mut();
    let ok = unsafe {
        GetModuleHandleExW(
            GET_MODULE_HANDLE_EX_FLAG_FROM_ADDRESS,
            engine_thread_start as *const u16,
            &mut module,
        )
    };
    if ok == 0 {
        return Err(Error::thread_creation(io::Error::last_os_error()));
    }
    Ok(module)
}

fn set_thread_description(thread: &SystemHandle, name: &str) {
    let Some(set_description) = set_thread_description_fn() else {
        return;
    };

    let name = to_wide(name);
    let hr = unsafe { set_description(thread.as_raw(), name.as_ptr()) };
    if hr < 0 {
        debug!(hr, "SetThreadDescription failed");
    }
}

fn nt_get_next_thread() -> Option<NtGetNextThreadFn> {
    static PROC: OnceLock<Option<NtGetNextThreadFn>> = OnceLock::new();
    *PROC.get_or_init(|| unsafe { resolve(w!("ntdll.dll"), s!("NtGetNextThread")) })
}

fn nt_create_thread_ex() -> Option<NtCreateThreadExFn> {
    static PROC: OnceLock<Option<NtCreateThreadExFn>> = OnceLock::new();
    *PROC.get_or_init(|| unsafe { resolve(w!("ntdll.dll"), s!("NtCreateThreadEx")) })
}

fn get_process_mitigation_policy() -> Option<GetProcessMitigationPolicyFn> {
    static PROC: OnceLock<Option<GetProcessMitigationPolicyFn>> = OnceLock::new();
    *PROC.get_or_init(|| unsafe { resolve(w!("kernel32.dll"), s!("GetProcessMitigationPolicy")) })
}

fn set_thread_description_fn() -> Option<SetThreadDescriptionFn> {
    static PROC: OnceLock<Option<SetThreadDescriptionFn>> = OnceLock::new();
    *PROC.get_or_init(|| unsafe { resolve(w!("kernel32.dll"), s!("SetThreadDescription")) })
}

/// # Safety
/// `F` must be the exact function pointer type of the exported symbol.
unsafe fn resolve<F: Copy>(module: PCWSTR, name: PCSTR) -> Option<F> {
    let handle = unsafe { GetModuleHandleW(module) };
    if handle.is_null() {
        return None;
    }

    let proc = unsafe { GetProcAddress(handle, name) }?;
    Some(unsafe { std::mem::transmute_copy(&proc) })
}

fn to_millis(timeout: Option<Duration>) -> u32 {
    match timeout {
        None => INFINITE,
        Some(d) => d.as_millis().min(u128::from(INFINITE - 1)) as u32,
    }
}

pub(crate) fn to_wide(s: &str) -> Vec<u16> {
    s.encode_utf16().chain(std::iter::once(0)).collect()
}
