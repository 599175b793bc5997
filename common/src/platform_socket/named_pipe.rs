//! Overlapped named pipes, so blocked I/O can be abandoned when a handle is
//! shut down or a listener closed.

use std::{
    io,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, Mutex,
    },
};

use windows::{
    core::{HSTRING, PCWSTR},
    Win32::{
        Foundation::{
            CloseHandle, ERROR_BROKEN_PIPE, ERROR_IO_PENDING, ERROR_NO_DATA, ERROR_PIPE_CONNECTED,
            GENERIC_READ, GENERIC_WRITE, HANDLE, WAIT_OBJECT_0, WAIT_TIMEOUT,
        },
        Storage::FileSystem::{
            CreateFileW, ReadFile, WriteFile, FILE_FLAG_OVERLAPPED, FILE_SHARE_NONE, OPEN_EXISTING,
            PIPE_ACCESS_DUPLEX,
        },
        System::{
            Pipes::{
                ConnectNamedPipe, CreateNamedPipeW, DisconnectNamedPipe, PIPE_READMODE_BYTE,
                PIPE_REJECT_REMOTE_CLIENTS, PIPE_TYPE_BYTE, PIPE_UNLIMITED_INSTANCES, PIPE_WAIT,
            },
            Threading::{CreateEventW, WaitForSingleObject},
            IO::{CancelIoEx, GetOverlappedResult, OVERLAPPED},
        },
    },
};

use crate::lock;

const BUFFER_SIZE: u32 = 64 * 1024;

/// Milliseconds between checks of the shutdown flag while I/O is pending
const POLL_INTERVAL_MS: u32 = 10;

fn pipe_path(name: &str) -> String {
    format!(r"\\.\pipe\{name}")
}

struct OwnedHandle(HANDLE);

// Win32 handles may be used from any thread
unsafe impl Send for OwnedHandle {}
unsafe impl Sync for OwnedHandle {}

impl Drop for OwnedHandle {
    fn drop(&mut self) {
        // SAFETY: the handle is owned by this value and closed exactly once
        unsafe {
            let _ = CloseHandle(self.0);
        }
    }
}

struct PipeShared {
    handle:   OwnedHandle,
    shutdown: AtomicBool,
    server:   bool,
}

/// One end of a connected pipe. Clones share the handle.
#[derive(Clone)]
pub struct PipeStream {
    shared: Arc<PipeShared>,
}

impl PipeStream {
    fn new(handle: OwnedHandle, server: bool) -> Self {
        Self {
            shared: Arc::new(PipeShared {
                handle,
                shutdown: AtomicBool::new(false),
                server,
            }),
        }
    }

    pub fn connect(name: &str) -> io::Result<Self> {
        let path = HSTRING::from(pipe_path(name));
        // SAFETY: `path` is a valid null-terminated wide string for the call
        let handle = unsafe {
            CreateFileW(
                &path,
                (GENERIC_READ | GENERIC_WRITE).0,
                FILE_SHARE_NONE,
                None,
                OPEN_EXISTING,
                FILE_FLAG_OVERLAPPED,
                HANDLE::default(),
            )
        }
        .map_err(io::Error::from)?;
        Ok(Self::new(OwnedHandle(handle), false))
    }

    pub fn read(&self, buf: &mut [u8]) -> io::Result<usize> {
        let handle = self.shared.handle.0;
        let len = buf.len().min(u32::MAX as usize);
        // SAFETY: `buf` outlives the operation, which `overlapped` waits out
        let result = self.overlapped(|overlapped| unsafe {
            ReadFile(handle, Some(&mut buf[..len]), None, Some(overlapped))
        });
        match result {
            Err(e) if is_disconnect(&e) => Ok(0),
            other => other,
        }
    }

    pub fn write(&self, buf: &[u8]) -> io::Result<usize> {
        let handle = self.shared.handle.0;
        let len = buf.len().min(u32::MAX as usize);
        // SAFETY: as for `read`
        self.overlapped(|overlapped| unsafe {
            WriteFile(handle, Some(&buf[..len]), None, Some(overlapped))
        })
    }

    pub fn shutdown(&self) -> io::Result<()> {
        if self.shared.shutdown.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        // SAFETY: the handle stays open while `shared` is alive
        unsafe {
            let _ = CancelIoEx(self.shared.handle.0, None);
            if self.shared.server {
                let _ = DisconnectNamedPipe(self.shared.handle.0);
            }
        }
        Ok(())
    }

    fn overlapped<F>(&self, start: F) -> io::Result<usize>
    where
        F: FnOnce(*mut OVERLAPPED) -> windows::core::Result<()>,
    {
        if self.shared.shutdown.load(Ordering::Acquire) {
            return Err(io::Error::from(io::ErrorKind::BrokenPipe));
        }
        let event = new_event()?;
        let mut overlapped = OVERLAPPED {
            hEvent: event.0,
            ..Default::default()
        };
        if let Err(e) = start(&mut overlapped) {
            if e.code() != ERROR_IO_PENDING.to_hresult() {
                return Err(e.into());
            }
        }
        wait(
            self.shared.handle.0,
            &mut overlapped,
            &event,
            &self.shared.shutdown,
        )
        .map(|n| n as usize)
    }
}

/// Listening side: hands out one connected pipe instance per accept
pub struct PipeServer {
    path:    String,
    pending: Mutex<Option<OwnedHandle>>,
}

impl PipeServer {
    pub fn bind(name: &str) -> io::Result<Self> {
        let path = pipe_path(name);
        // Create the first instance now so dialers find the name immediately
        let first = create_instance(&path)?;
        Ok(Self {
            path,
            pending: Mutex::new(Some(first)),
        })
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    pub fn accept(&self, closed: &AtomicBool) -> io::Result<PipeStream> {
        let pipe = match lock(&self.pending).take() {
            Some(pipe) => pipe,
            None => create_instance(&self.path)?,
        };

        let event = new_event()?;
        let mut overlapped = OVERLAPPED {
            hEvent: event.0,
            ..Default::default()
        };
        // SAFETY: `overlapped` and `event` outlive the operation; `wait` does
        // not return before it completed or was cancelled
        match unsafe { ConnectNamedPipe(pipe.0, Some(&mut overlapped as *mut OVERLAPPED)) } {
            Ok(()) => {}
            Err(e) if e.code() == ERROR_PIPE_CONNECTED.to_hresult() => {}
            Err(e) if e.code() == ERROR_IO_PENDING.to_hresult() => {
                if let Err(e) = wait(pipe.0, &mut overlapped, &event, closed) {
                    return Err(if closed.load(Ordering::Acquire) {
                        io::Error::new(io::ErrorKind::ConnectionAborted, "listener closed")
                    } else {
                        e
                    });
                }
            }
            Err(e) => return Err(e.into()),
        }

        // Keep an instance waiting so the next client is not refused outright
        match create_instance(&self.path) {
            Ok(next) => *lock(&self.pending) = Some(next),
            Err(e) => tracing::warn!("Failed to create next pipe instance: {}", e),
        }
        Ok(PipeStream::new(pipe, true))
    }

    pub fn close(&self) {
        lock(&self.pending).take();
    }
}

fn create_instance(path: &str) -> io::Result<OwnedHandle> {
    let path = HSTRING::from(path);
    // SAFETY: `path` is a valid null-terminated wide string for the call
    let handle = unsafe {
        CreateNamedPipeW(
            &path,
            PIPE_ACCESS_DUPLEX | FILE_FLAG_OVERLAPPED,
            PIPE_TYPE_BYTE | PIPE_READMODE_BYTE | PIPE_WAIT | PIPE_REJECT_REMOTE_CLIENTS,
            PIPE_UNLIMITED_INSTANCES,
            BUFFER_SIZE,
            BUFFER_SIZE,
            0,
            None,
        )
    };
    if handle.is_invalid() {
        return Err(io::Error::last_os_error());
    }
    Ok(OwnedHandle(handle))
}

fn new_event() -> io::Result<OwnedHandle> {
    // SAFETY: no pointers are passed
    let event = unsafe { CreateEventW(None, true, false, PCWSTR::null()) }?;
    Ok(OwnedHandle(event))
}

/// Waits for a pending operation, cancelling it once `stop` is raised
fn wait(
    handle: HANDLE,
    overlapped: &mut OVERLAPPED,
    event: &OwnedHandle,
    stop: &AtomicBool,
) -> io::Result<u32> {
    loop {
        // SAFETY: `event` is a valid handle owned by the caller
        let waited = unsafe { WaitForSingleObject(event.0, POLL_INTERVAL_MS) };
        if waited == WAIT_OBJECT_0 {
            break;
        }
        if waited != WAIT_TIMEOUT {
            return Err(io::Error::last_os_error());
        }
        if stop.load(Ordering::Acquire) {
            // SAFETY: `overlapped` belongs to an operation still pending on `handle`
            unsafe {
                let _ = CancelIoEx(handle, Some(overlapped as *const OVERLAPPED));
            }
            break;
        }
    }

    let mut transferred = 0u32;
    // SAFETY: waits for completion, so the kernel is done with `overlapped` after
    unsafe { GetOverlappedResult(handle, overlapped, &mut transferred, true) }?;
    Ok(transferred)
}

fn is_disconnect(err: &io::Error) -> bool {
    matches!(
        err.raw_os_error(),
        Some(code) if code == ERROR_BROKEN_PIPE.0 as i32 || code == ERROR_NO_DATA.0 as i32
    )
}
