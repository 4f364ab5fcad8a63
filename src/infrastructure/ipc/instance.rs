//! Single-Instance Guard
//!
//! At most one bridge may own the socket endpoint per user. Ownership is an
//! exclusive advisory lock on `bridge.lock`; the socket itself is only
//! (re)created while that lock is held.
//!
//! Acquisition order:
//!
//! 1. Create the runtime directory with mode 0700 and verify it
//! 2. Take the lock without blocking; contention means another bridge
//! 3. If a socket file exists, dial it: a live peer means another bridge,
//!    a refused dial means a stale leftover which is removed
//! 4. Bind the listener, restrict it to 0600 and verify

use crate::domain::settings::EndpointPaths;
use fs2::FileExt;
use interprocess::local_socket::{
    traits::Stream as _, GenericFilePath, Listener, ListenerOptions, Stream as LocalStream,
    ToFsName,
};
use std::fs::{self, DirBuilder, File, OpenOptions, Permissions};
use std::io;
use std::os::unix::fs::{DirBuilderExt, FileTypeExt, OpenOptionsExt, PermissionsExt};
use std::path::{Path, PathBuf};
use std::sync::mpsc;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, info, warn};

pub const DIR_MODE: u32 = 0o700;
pub const SOCKET_MODE: u32 = 0o600;
/// Owner-only; the lock file carries no data
pub const LOCK_MODE: u32 = 0o600;

#[derive(Debug, Error)]
pub enum GuardError {
    #[error("cannot prepare runtime directory {path:?}: {source}")]
    Directory { path: PathBuf, source: io::Error },

    #[error("insecure permissions on {path:?}: expected {expected:o}, found {found:o}")]
    Permissions {
        path: PathBuf,
        expected: u32,
        found: u32,
    },

    #[error("{0:?} exists and is not a socket")]
    NotASocket(PathBuf),

    #[error("cannot bind {path:?}: {source}")]
    Bind { path: PathBuf, source: io::Error },

    #[error(transparent)]
    Io(#[from] io::Error),
}

/// Outcome of [`InstanceGuard::acquire`]
pub enum Acquire {
    Acquired(InstanceGuard),
    AlreadyRunning,
}

/// Held for the whole lifetime of the bridge process
pub struct InstanceGuard {
    paths: EndpointPaths,
    lock_file: Option<File>,
    listener: Option<Listener>,
}

impl InstanceGuard {
    pub fn acquire(paths: &EndpointPaths, probe_timeout: Duration) -> Result<Acquire, GuardError> {
        prepare_dir(&paths.dir)?;

        let lock_file = OpenOptions::new()
            .create(true)
            .truncate(false)
            .write(true)
            .mode(LOCK_MODE)
            .open(&paths.lock)?;

        if let Err(e) = lock_file.try_lock_exclusive() {
            if e.kind() == fs2::lock_contended_error().kind() {
                info!(lock = ?paths.lock, "Lock held by another bridge");
                return Ok(Acquire::AlreadyRunning);
            }
            return Err(e.into());
        }
        debug!(lock = ?paths.lock, "Instance lock acquired");

        match fs::symlink_metadata(&paths.socket) {
            Ok(meta) => {
                if !meta.file_type().is_socket() {
                    let _ = FileExt::unlock(&lock_file);
                    return Err(GuardError::NotASocket(paths.socket.clone()));
                }
                if probe_alive(&paths.socket, probe_timeout) {
                    info!(socket = ?paths.socket, "Socket answered probe, bridge already running");
                    let _ = FileExt::unlock(&lock_file);
                    return Ok(Acquire::AlreadyRunning);
                }
                warn!(socket = ?paths.socket, "Removing stale socket");
                fs::remove_file(&paths.socket)?;
            }
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => {
                let _ = FileExt::unlock(&lock_file);
                return Err(e.into());
            }
        }

        let listener = bind(&paths.socket)?;
        if let Err(e) = restrict_socket(&paths.socket) {
            drop(listener);
            let _ = fs::remove_file(&paths.socket);
            let _ = FileExt::unlock(&lock_file);
            return Err(e);
        }

        info!(socket = ?paths.socket, "Listening");
        Ok(Acquire::Acquired(Self {
            paths: paths.clone(),
            lock_file: Some(lock_file),
            listener: Some(listener),
        }))
    }

    /// Hand the listener to the accept loop; `None` after the first call
    pub fn take_listener(&mut self) -> Option<Listener> {
        self.listener.take()
    }

    /// Remove the socket and drop the lock. Safe to call more than once.
    pub fn release(&mut self) {
        self.listener = None;
        let Some(lock_file) = self.lock_file.take() else {
            return;
        };

        match fs::remove_file(&self.paths.socket) {
            Ok(()) => debug!(socket = ?self.paths.socket, "Socket removed"),
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => warn!(socket = ?self.paths.socket, "Failed to remove socket: {}", e),
        }
        if let Err(e) = FileExt::unlock(&lock_file) {
            warn!("Failed to unlock {:?}: {}", self.paths.lock, e);
        }
        info!("Instance guard released");
    }
}

impl Drop for InstanceGuard {
    fn drop(&mut self) {
        self.release();
    }
}

fn prepare_dir(dir: &Path) -> Result<(), GuardError> {
    let wrap = |source| GuardError::Directory {
        path: dir.to_path_buf(),
        source,
    };

    DirBuilder::new()
        .recursive(true)
        .mode(DIR_MODE)
        .create(dir)
        .map_err(wrap)?;
    // An existing directory keeps its old mode until we set it
    fs::set_permissions(dir, Permissions::from_mode(DIR_MODE)).map_err(wrap)?;
    verify_mode(dir, DIR_MODE)
}

fn bind(socket: &Path) -> Result<Listener, GuardError> {
    let name = socket.to_fs_name::<GenericFilePath>()?;
    ListenerOptions::new()
        .name(name)
        .create_sync()
        .map_err(|source| GuardError::Bind {
            path: socket.to_path_buf(),
            source,
        })
}

fn restrict_socket(socket: &Path) -> Result<(), GuardError> {
    fs::set_permissions(socket, Permissions::from_mode(SOCKET_MODE))?;
    verify_mode(socket, SOCKET_MODE)
}

fn verify_mode(path: &Path, expected: u32) -> Result<(), GuardError> {
    let found = fs::metadata(path)?.permissions().mode() & 0o777;
    if found != expected {
        return Err(GuardError::Permissions {
            path: path.to_path_buf(),
            expected,
            found,
        });
    }
    Ok(())
}

/// Dial the socket on a helper thread; a dial that neither succeeds nor
/// fails within `timeout` counts as alive.
fn probe_alive(socket: &Path, timeout: Duration) -> bool {
    let socket = socket.to_path_buf();
    let (tx, rx) = mpsc::channel();
    std::thread::spawn(move || {
        let alive = match socket.as_path().to_fs_name::<GenericFilePath>() {
            Ok(name) => LocalStream::connect(name).is_ok(),
            Err(_) => false,
        };
        let _ = tx.send(alive);
    });

    match rx.recv_timeout(timeout) {
        Ok(alive) => alive,
        Err(_) => {
            warn!("Socket probe timed out, assuming a live bridge");
            true
        }
    }
}
