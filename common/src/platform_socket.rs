use std::io::{self, Read, Write};
#[cfg(unix)]
use std::os::unix::net::{UnixListener, UnixStream};
#[cfg(unix)]
use std::path::{Path, PathBuf};
use std::{
    sync::atomic::{AtomicBool, Ordering},
    time::Duration,
};

#[cfg(windows)]
mod named_pipe;

use crate::{
    config::{ClientConfig, ServerConfig},
    transport::{Connection, Listener, Transport},
};

/// How often a blocked accept re-checks whether its listener was closed
pub const ACCEPT_POLL_INTERVAL: Duration = Duration::from_millis(10);

/// Local transport of the current platform: Unix domain sockets on Unix-like
/// systems, named pipes on Windows
#[derive(Debug, Clone, Copy, Default)]
pub struct PlatformTransport;

/// Cross-platform socket wrapper
pub enum PlatformSocket {
    #[cfg(unix)]
    /// Unix domain socket
    Unix(UnixStream),
    #[cfg(windows)]
    /// Windows named pipe handle
    NamedPipe(named_pipe::PipeStream),
}

/// Cross-platform socket listener
pub struct PlatformListener {
    #[cfg(unix)]
    listener:    UnixListener,
    #[cfg(unix)]
    socket_path: PathBuf,
    #[cfg(windows)]
    server:      named_pipe::PipeServer,
    closed:      AtomicBool,
}

/// Path of the socket file for `name` under `base`
#[cfg(unix)]
pub fn socket_path(base: &Path, name: &str) -> PathBuf {
    base.join(format!("{name}.sock"))
}

impl Transport for PlatformTransport {
    type Conn = PlatformSocket;
    type Listener = PlatformListener;

    fn listen(&self, name: &str, config: &ServerConfig) -> io::Result<PlatformListener> {
        PlatformListener::bind(name, config)
    }

    fn dial(&self, name: &str, config: &ClientConfig) -> io::Result<PlatformSocket> {
        connect_socket(name, config)
    }
}

impl Connection for PlatformSocket {
    fn try_clone(&self) -> io::Result<Self> {
        match self {
            #[cfg(unix)]
            PlatformSocket::Unix(stream) => stream.try_clone().map(PlatformSocket::Unix),
            #[cfg(windows)]
            PlatformSocket::NamedPipe(pipe) => Ok(PlatformSocket::NamedPipe(pipe.clone())),
        }
    }

    fn shutdown(&self) -> io::Result<()> {
        match self {
            #[cfg(unix)]
            PlatformSocket::Unix(stream) => match stream.shutdown(std::net::Shutdown::Both) {
                // The peer already went away
                Err(e) if e.kind() == io::ErrorKind::NotConnected => Ok(()),
                other => other,
            },
            #[cfg(windows)]
            PlatformSocket::NamedPipe(pipe) => pipe.shutdown(),
        }
    }

    fn set_read_timeout(&self, timeout: Option<Duration>) -> io::Result<()> {
        match self {
            #[cfg(unix)]
            PlatformSocket::Unix(stream) => stream.set_read_timeout(timeout),
            #[cfg(windows)]
            PlatformSocket::NamedPipe(_) => {
                // Named pipes don't support read timeouts in the same way
                let _ = timeout;
                Ok(())
            }
        }
    }
}

impl Read for PlatformSocket {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        match self {
            #[cfg(unix)]
            PlatformSocket::Unix(stream) => stream.read(buf),
            #[cfg(windows)]
            PlatformSocket::NamedPipe(pipe) => pipe.read(buf),
        }
    }
}

impl Write for PlatformSocket {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        match self {
            #[cfg(unix)]
            PlatformSocket::Unix(stream) => stream.write(buf),
            #[cfg(windows)]
            PlatformSocket::NamedPipe(pipe) => pipe.write(buf),
        }
    }

    fn flush(&mut self) -> io::Result<()> {
        match self {
            #[cfg(unix)]
            PlatformSocket::Unix(stream) => stream.flush(),
            #[cfg(windows)]
            PlatformSocket::NamedPipe(_) => Ok(()),
        }
    }
}

impl PlatformListener {
    /// Create a new platform-specific listener
    pub fn bind(name: &str, config: &ServerConfig) -> io::Result<Self> {
        #[cfg(unix)]
        {
            let socket_path = socket_path(&config.socket_base_path, name);

            tracing::info!(
                "Setting up Unix socket server: {} -> {}",
                name,
                socket_path.display()
            );

            // Remove whatever a previous server left behind
            match std::fs::remove_file(&socket_path) {
                Ok(()) => tracing::warn!("Removed stale socket file {}", socket_path.display()),
                Err(e) if e.kind() == io::ErrorKind::NotFound => {
                    tracing::debug!("No existing socket file found");
                }
                Err(e) => {
                    tracing::error!("Failed to remove old socket file: {}", e);
                    return Err(io::Error::new(
                        e.kind(),
                        format!(
                            "could not remove existing socket file '{}': {}",
                            socket_path.display(),
                            e
                        ),
                    ));
                }
            }

            let listener = if config.unmask_permissions {
                use nix::sys::stat::{umask, Mode};

                // umask is process-wide; restore it as soon as the file exists
                let previous = umask(Mode::empty());
                let bound = UnixListener::bind(&socket_path);
                umask(previous);
                bound
            } else {
                UnixListener::bind(&socket_path)
            }
            .map_err(|e| {
                tracing::error!("Failed to bind to socket: {} (kind: {:?})", e, e.kind());
                io::Error::new(
                    e.kind(),
                    format!("failed to bind '{}': {}", socket_path.display(), e),
                )
            })?;

            if !config.unmask_permissions {
                use std::os::unix::fs::PermissionsExt;

                // Owner read/write only
                if let Err(e) =
                    std::fs::set_permissions(&socket_path, std::fs::Permissions::from_mode(0o600))
                {
                    tracing::warn!("Failed to set socket permissions: {}", e);
                }
            }

            // Accept polls so that close() can interrupt it
            listener.set_nonblocking(true)?;

            tracing::info!("✓ Unix socket bound at {}", socket_path.display());
            Ok(Self {
                listener,
                socket_path,
                closed: AtomicBool::new(false),
            })
        }

        #[cfg(windows)]
        {
            let _ = config;
            let server = named_pipe::PipeServer::bind(name)?;
            tracing::info!("✓ Named pipe created at {}", server.path());
            Ok(Self {
                server,
                closed: AtomicBool::new(false),
            })
        }
    }

    fn closed_error() -> io::Error {
        io::Error::new(io::ErrorKind::ConnectionAborted, "listener closed")
    }
}

impl Listener for PlatformListener {
    type Conn = PlatformSocket;

    fn accept(&self) -> io::Result<PlatformSocket> {
        #[cfg(unix)]
        loop {
            if self.closed.load(Ordering::Acquire) {
                return Err(Self::closed_error());
            }

            match self.listener.accept() {
                Ok((stream, _)) => {
                    // Some platforms hand out sockets inheriting the listener's mode
                    stream.set_nonblocking(false)?;
                    log_peer_credentials(&stream);
                    return Ok(PlatformSocket::Unix(stream));
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                    std::thread::sleep(ACCEPT_POLL_INTERVAL);
                }
                Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
                Err(e) => return Err(e),
            }
        }

        #[cfg(windows)]
        {
            if self.closed.load(Ordering::Acquire) {
                return Err(Self::closed_error());
            }
            self.server
                .accept(&self.closed)
                .map(PlatformSocket::NamedPipe)
        }
    }

    fn close(&self) -> io::Result<()> {
        if self.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }

        #[cfg(unix)]
        match std::fs::remove_file(&self.socket_path) {
            Ok(()) => tracing::debug!("Removed socket file {}", self.socket_path.display()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => return Err(e),
        }

        #[cfg(windows)]
        self.server.close();

        Ok(())
    }
}

impl Drop for PlatformListener {
    fn drop(&mut self) {
        if let Err(e) = self.close() {
            tracing::warn!("Failed to clean up listener: {}", e);
        }
    }
}

/// Connect to a platform-specific socket with blocking configuration
pub fn connect_socket(name: &str, config: &ClientConfig) -> io::Result<PlatformSocket> {
    #[cfg(unix)]
    {
        let socket_path = socket_path(&config.socket_base_path, name);
        tracing::trace!("Dialing Unix socket {}", socket_path.display());
        UnixStream::connect(&socket_path).map(PlatformSocket::Unix)
    }

    #[cfg(windows)]
    {
        let _ = config;
        named_pipe::PipeStream::connect(name).map(PlatformSocket::NamedPipe)
    }
}

#[cfg(target_os = "linux")]
fn log_peer_credentials(stream: &UnixStream) {
    use nix::sys::socket::{getsockopt, sockopt::PeerCredentials};

    match getsockopt(stream, PeerCredentials) {
        Ok(creds) => tracing::debug!("Client PID: {}, UID: {}", creds.pid(), creds.uid()),
        Err(e) => tracing::debug!("Peer credentials unavailable: {}", e),
    }
}

#[cfg(all(unix, not(target_os = "linux")))]
fn log_peer_credentials(_stream: &UnixStream) {}

#[cfg(all(test, unix))]
mod tests {
    use std::{thread, time::Instant};

    use super::*;

    #[test]
    fn stale_socket_file_is_replaced() {
        let tmp = tempfile::tempdir().unwrap();
        let dir = tmp.path();
        let config = ServerConfig::new().with_socket_base_path(dir);
        let path = socket_path(dir, "stale");
        std::fs::write(&path, b"left over").unwrap();

        let listener = PlatformListener::bind("stale", &config).unwrap();
        let metadata = std::fs::metadata(&path).unwrap();
        use std::os::unix::fs::{FileTypeExt, PermissionsExt};
        assert!(metadata.file_type().is_socket());
        assert_eq!(metadata.permissions().mode() & 0o777, 0o600);

        listener.close().unwrap();
        assert!(!path.exists());
    }

    #[test]
    fn dial_before_listen_is_not_found() {
        let tmp = tempfile::tempdir().unwrap();
        let dir = tmp.path();
        let config = ClientConfig::new().with_socket_base_path(dir);
        let err = PlatformTransport.dial("absent", &config).err().unwrap();
        assert!(crate::transport::is_retryable_dial_error(&err));
    }

    #[test]
    fn close_unblocks_accept() {
        let tmp = tempfile::tempdir().unwrap();
        let dir = tmp.path();
        let config = ServerConfig::new().with_socket_base_path(dir);
        let listener = std::sync::Arc::new(PlatformTransport.listen("unblock", &config).unwrap());

        let waiter = {
            let listener = listener.clone();
            thread::spawn(move || listener.accept().map(|_| ()))
        };
        thread::sleep(Duration::from_millis(50));
        let started = Instant::now();
        listener.close().unwrap();

        let result = waiter.join().unwrap();
        assert_eq!(result.unwrap_err().kind(), io::ErrorKind::ConnectionAborted);
        assert!(started.elapsed() < Duration::from_secs(1));
    }

    #[test]
    fn accepted_and_dialed_sockets_carry_bytes() {
        let tmp = tempfile::tempdir().unwrap();
        let dir = tmp.path();
        let listener = PlatformTransport
            .listen("bytes", &ServerConfig::new().with_socket_base_path(dir))
            .unwrap();
        let mut client = PlatformTransport
            .dial("bytes", &ClientConfig::new().with_socket_base_path(dir))
            .unwrap();
        let mut server = listener.accept().unwrap();

        client.write_all(b"ping").unwrap();
        let mut buf = [0u8; 4];
        server.read_exact(&mut buf).unwrap();
        assert_eq!(&buf, b"ping");

        // A clone sees the peer hang up as well
        let mut reader = server.try_clone().unwrap();
        client.shutdown().unwrap();
        assert_eq!(reader.read(&mut buf).unwrap(), 0);
    }
}
