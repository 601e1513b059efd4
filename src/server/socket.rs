//! Unix socket endpoint: runtime directory, stale socket handling, and the
//! listener/stream seam the query server is written against.

use std::fs::{self, DirBuilder};
use std::io::{self, Read, Write};
use std::net::Shutdown;
use std::os::fd::AsRawFd;
use std::os::unix::fs::{DirBuilderExt, PermissionsExt};
use std::os::unix::net::{UnixListener, UnixStream};
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::{debug, info, warn};

/// Directory name created under the runtime directory.
pub const SOCKET_DIR_NAME: &str = "restwatch";

/// Failures setting up the listening endpoint. None of these are retried.
#[derive(Debug, Error)]
pub enum ServerError {
    #[error("failed to create socket directory {path:?}: {source}")]
    CreateDir { path: PathBuf, source: io::Error },
    #[error("another instance is already listening on {0:?}")]
    AlreadyRunning(PathBuf),
    #[error("failed to remove stale socket {path:?}: {source}")]
    RemoveStale { path: PathBuf, source: io::Error },
    #[error("failed to bind {path:?}: {source}")]
    Bind { path: PathBuf, source: io::Error },
    #[error("failed to configure listener on {path:?}: {source}")]
    Configure { path: PathBuf, source: io::Error },
}

/// A client byte stream owned by one connection slot.
pub trait ClientStream: Read + Write {
    fn shutdown_both(&self) -> io::Result<()>;
}

/// The listening side of the transport.
pub trait Listener {
    type Stream: ClientStream;

    /// Non-blocking check for a queued connection.
    fn poll_pending(&self) -> io::Result<bool>;

    /// Accept one queued connection, already switched to non-blocking mode.
    fn accept_one(&self) -> io::Result<Self::Stream>;
}

impl ClientStream for UnixStream {
    fn shutdown_both(&self) -> io::Result<()> {
        self.shutdown(Shutdown::Both)
    }
}

impl Listener for UnixListener {
    type Stream = UnixStream;

    fn poll_pending(&self) -> io::Result<bool> {
        let mut pfd = libc::pollfd {
            fd: self.as_raw_fd(),
            events: libc::POLLIN,
            revents: 0,
        };
        // SAFETY: `pfd` is a valid, exclusively borrowed pollfd for the duration of the call.
        let ready = unsafe { libc::poll(&mut pfd, 1, 0) };
        if ready < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(ready > 0 && pfd.revents & libc::POLLIN != 0)
    }

    fn accept_one(&self) -> io::Result<UnixStream> {
        let (stream, _addr) = self.accept()?;
        stream.set_nonblocking(true)?;
        Ok(stream)
    }
}

/// Resolve the directory holding the socket file.
///
/// Uses the per-user runtime directory, falling back to a uid-scoped
/// directory under the system temp dir when none is available.
pub fn default_socket_dir() -> PathBuf {
    match dirs::runtime_dir() {
        Some(runtime) => runtime.join(SOCKET_DIR_NAME),
        None => {
            // SAFETY: getuid has no preconditions and cannot fail.
            let uid = unsafe { libc::getuid() };
            std::env::temp_dir().join(format!("{}-{}", SOCKET_DIR_NAME, uid))
        }
    }
}

/// A bound, non-blocking listener plus the filesystem artifacts it created.
///
/// Dropping the endpoint removes the socket file and, if it was created here,
/// the directory.
#[derive(Debug)]
pub struct SocketEndpoint {
    listener: UnixListener,
    dir: PathBuf,
    path: PathBuf,
    created_dir: bool,
}

impl SocketEndpoint {
    /// Create the directory, clear a stale socket, bind and listen.
    pub fn bind(dir: &Path, socket_name: &str, backlog: i32) -> Result<Self, ServerError> {
        let created_dir = if dir.is_dir() {
            false
        } else {
            DirBuilder::new()
                .recursive(true)
                .mode(0o700)
                .create(dir)
                .map_err(|source| ServerError::CreateDir {
                    path: dir.to_path_buf(),
                    source,
                })?;
            true
        };

        let path = dir.join(socket_name);
        let listener = match listen_at(&path, backlog) {
            Ok(listener) => listener,
            Err(err) => {
                if created_dir {
                    if let Err(remove_err) = fs::remove_dir(dir) {
                        warn!("Failed to remove socket directory {:?}: {}", dir, remove_err);
                    }
                }
                return Err(err);
            }
        };
        if let Err(err) = fs::set_permissions(&path, fs::Permissions::from_mode(0o600)) {
            warn!("Could not restrict permissions on {:?}: {}", path, err);
        }

        info!("Listening on {:?} (backlog {})", path, backlog);

        Ok(Self {
            listener,
            dir: dir.to_path_buf(),
            path,
            created_dir,
        })
    }

    #[cfg(test)]
    pub fn listener(&self) -> &UnixListener {
        &self.listener
    }

    #[cfg(test)]
    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Listener for SocketEndpoint {
    type Stream = UnixStream;

    fn poll_pending(&self) -> io::Result<bool> {
        self.listener.poll_pending()
    }

    fn accept_one(&self) -> io::Result<UnixStream> {
        self.listener.accept_one()
    }
}

impl Drop for SocketEndpoint {
    fn drop(&mut self) {
        if let Err(err) = fs::remove_file(&self.path) {
            if err.kind() != io::ErrorKind::NotFound {
                warn!("Failed to remove socket {:?}: {}", self.path, err);
            }
        }
        if self.created_dir {
            if let Err(err) = fs::remove_dir(&self.dir) {
                warn!("Failed to remove socket directory {:?}: {}", self.dir, err);
            }
        }
        debug!("Socket endpoint {:?} released", self.path);
    }
}

/// Clear a stale socket, bind, and switch the listener to non-blocking with
/// the configured backlog. A socket file bound here is removed again on error.
fn listen_at(path: &Path, backlog: i32) -> Result<UnixListener, ServerError> {
    clear_stale_socket(path)?;

    let listener = UnixListener::bind(path).map_err(|source| ServerError::Bind {
        path: path.to_path_buf(),
        source,
    })?;

    if let Err(source) = configure_listener(&listener, backlog) {
        drop(listener);
        if let Err(err) = fs::remove_file(path) {
            debug!("Failed to remove {:?} after configure error: {}", path, err);
        }
        return Err(ServerError::Configure {
            path: path.to_path_buf(),
            source,
        });
    }

    Ok(listener)
}

fn configure_listener(listener: &UnixListener, backlog: i32) -> io::Result<()> {
    listener.set_nonblocking(true)?;
    // SAFETY: the fd belongs to a live, bound socket; re-issuing listen only updates the backlog.
    if unsafe { libc::listen(listener.as_raw_fd(), backlog) } != 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

/// A leftover socket file either belongs to a live instance or is removed.
fn clear_stale_socket(path: &Path) -> Result<(), ServerError> {
    if fs::symlink_metadata(path).is_err() {
        return Ok(());
    }

    if UnixStream::connect(path).is_ok() {
        return Err(ServerError::AlreadyRunning(path.to_path_buf()));
    }

    warn!("Removing stale socket {:?}", path);
    fs::remove_file(path).map_err(|source| ServerError::RemoveStale {
        path: path.to_path_buf(),
        source,
    })
}
