//! Managing the process Otto BGP runs in.
//!
//! This module provides the tokio runtime, signal handling that trips the
//! global cancellation token, and the concurrent-run lock that keeps two
//! instances from operating on the same fleet at the same time.

use std::future::Future;
use log::error;
use tokio::runtime::Runtime;
use crate::config::Config;
use crate::error::Failed;
use crate::log::Logger;
use crate::utils::sync::Cancel;


//------------ Process -------------------------------------------------------

/// A representation of the process Otto BGP runs in.
///
/// This type provides access to the configuration and the environment in a
/// platform independent way.
pub struct Process {
    config: Config,

    /// The run-wide cancellation token.
    cancel: Cancel,
}

impl Process {
    pub fn init() -> Result<(), Failed> {
        Logger::init()?;
        Ok(())
    }

    /// Creates a new process object.
    pub fn new(config: Config) -> Self {
        Process {
            config,
            cancel: Cancel::new(),
        }
    }

    /// Returns a reference to the config.
    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Returns a clone of the cancellation token.
    pub fn cancel(&self) -> Cancel {
        self.cancel.clone()
    }
}

/// # Logging
///
impl Process {
    /// Switches logging to the configured target.
    ///
    /// Once the configuration has been successfully loaded, logging should
    /// be switched to whatever the user asked for via this method.
    pub fn switch_logging(&self, daemon: bool) -> Result<(), Failed> {
        Logger::switch_logging(&self.config, daemon)
    }

    /// Rotates the log file if necessary.
    pub fn rotate_log(&self) -> Result<(), Failed> {
        Logger::rotate_log()
    }
}

/// # Tokio Runtime
///
impl Process {
    /// Returns a Tokio runtime based on the configuration.
    pub fn runtime(&self) -> Result<Runtime, Failed> {
        Runtime::new().map_err(|err| {
            error!("Failed to create runtime: {}", err);
            Failed
        })
    }

    /// Runs a future to completion atop a Tokio runtime.
    pub fn block_on<F: Future>(&self, future: F) -> Result<F::Output, Failed> {
        Ok(self.runtime()?.block_on(future))
    }

    /// Spawns the signal watcher onto the given runtime.
    ///
    /// SIGINT and SIGTERM trip the cancellation token so that no new work
    /// units start and in-flight units wind down according to their local
    /// contract. SIGUSR1 rotates the log file.
    pub fn spawn_signal_watcher(
        &self, runtime: &Runtime
    ) -> Result<(), Failed> {
        let cancel = self.cancel.clone();

        #[cfg(unix)]
        {
            use tokio::signal::unix::{SignalKind, signal};

            // Signal streams must be created inside the runtime.
            let handles = runtime.block_on(async {
                Ok::<_, std::io::Error>((
                    signal(SignalKind::interrupt())?,
                    signal(SignalKind::terminate())?,
                    signal(SignalKind::user_defined1())?,
                ))
            });
            let (mut int, mut term, mut usr1) = match handles {
                Ok(handles) => handles,
                Err(err) => {
                    error!("Failed to install signal handlers: {}", err);
                    return Err(Failed)
                }
            };
            runtime.spawn(async move {
                loop {
                    tokio::select! {
                        _ = int.recv() => {
                            log::warn!(
                                "Received SIGINT. Winding down."
                            );
                            cancel.trip();
                        }
                        _ = term.recv() => {
                            log::warn!(
                                "Received SIGTERM. Winding down."
                            );
                            cancel.trip();
                        }
                        _ = usr1.recv() => {
                            let _ = Logger::rotate_log();
                        }
                    }
                }
            });
        }

        #[cfg(not(unix))]
        {
            runtime.spawn(async move {
                if tokio::signal::ctrl_c().await.is_ok() {
                    log::warn!("Received interrupt. Winding down.");
                    cancel.trip();
                }
            });
        }

        Ok(())
    }
}


//------------ RunLock -------------------------------------------------------

/// The concurrent-run lock.
///
/// The lock is an advisory file lock at a well-known path with the holder’s
/// PID as content. The kernel releases the flock when the holder dies, so a
/// holder killed with SIGKILL does not wedge subsequent runs. The PID in the
/// file is re-checked on contention so a report about a conflicting run can
/// name the process and stale content never blocks a new run.
#[cfg(unix)]
pub use self::unix::RunLock;

#[cfg(not(unix))]
pub use self::noop::RunLock;

#[cfg(unix)]
mod unix {
    use std::fs::{File, OpenOptions};
    use std::io::{Read, Seek, SeekFrom, Write};
    use std::os::unix::io::AsRawFd;
    use std::os::unix::fs::OpenOptionsExt;
    use std::path::{Path, PathBuf};
    use log::{error, warn};
    use nix::errno::Errno;
    use nix::fcntl::{FlockArg, flock};
    use nix::sys::signal::kill;
    use nix::unistd::Pid;
    use crate::error::Failed;

    /// An acquired concurrent-run lock.
    ///
    /// Dropping the value releases the lock. The lock file itself is left
    /// in place; only the flock is released.
    #[derive(Debug)]
    pub struct RunLock {
        file: File,
        path: PathBuf,
    }

    impl RunLock {
        /// Attempts to acquire the lock.
        ///
        /// Returns `Ok(None)` if another live process holds the lock.
        pub fn acquire(path: &Path) -> Result<Option<Self>, Failed> {
            if let Some(parent) = path.parent() {
                if let Err(err) = std::fs::create_dir_all(parent) {
                    error!(
                        "Failed to create lock directory {}: {}",
                        parent.display(), err
                    );
                    return Err(Failed)
                }
            }
            let mut file = match OpenOptions::new()
                .read(true).write(true).create(true).mode(0o644)
                .open(path)
            {
                Ok(file) => file,
                Err(err) => {
                    error!(
                        "Failed to open lock file {}: {}",
                        path.display(), err
                    );
                    return Err(Failed)
                }
            };

            match Self::try_flock(&file) {
                Ok(()) => { }
                Err(err) if err == Errno::EWOULDBLOCK
                    || err == Errno::EAGAIN => {
                    // Somebody holds the flock. Check whether the recorded
                    // holder still exists; if it does not, the flock must
                    // have been released between our two attempts, so try
                    // once more.
                    match Self::read_holder(&mut file) {
                        Some(pid) if Self::pid_alive(pid) => {
                            warn!(
                                "Concurrent run detected: lock {} held \
                                 by PID {}.",
                                path.display(), pid
                            );
                            return Ok(None)
                        }
                        Some(pid) => {
                            warn!(
                                "Reclaiming stale lock {} from dead \
                                 PID {}.",
                                path.display(), pid
                            );
                        }
                        None => { }
                    }
                    match Self::try_flock(&file) {
                        Ok(()) => { }
                        Err(_) => return Ok(None),
                    }
                }
                Err(err) => {
                    error!(
                        "Failed to lock {}: {}", path.display(), err
                    );
                    return Err(Failed)
                }
            }

            if let Err(err) = Self::write_holder(&mut file) {
                error!(
                    "Failed to write PID to lock file {}: {}",
                    path.display(), err
                );
                return Err(Failed)
            }
            Ok(Some(RunLock { file, path: path.into() }))
        }

        /// Tries to take the flock without blocking.
        fn try_flock(file: &File) -> Result<(), Errno> {
            flock(file.as_raw_fd(), FlockArg::LockExclusiveNonblock)
        }

        /// Reads the PID recorded in the lock file.
        fn read_holder(file: &mut File) -> Option<i32> {
            let mut content = String::new();
            file.seek(SeekFrom::Start(0)).ok()?;
            file.read_to_string(&mut content).ok()?;
            content.trim().parse().ok()
        }

        /// Returns whether a process with the given PID exists.
        fn pid_alive(pid: i32) -> bool {
            kill(Pid::from_raw(pid), None).is_ok()
        }

        /// Records our own PID in the lock file.
        fn write_holder(file: &mut File) -> Result<(), std::io::Error> {
            file.set_len(0)?;
            file.seek(SeekFrom::Start(0))?;
            write!(file, "{}", std::process::id())?;
            file.flush()
        }

        /// Returns the path of the lock file.
        pub fn path(&self) -> &Path {
            &self.path
        }
    }

    impl Drop for RunLock {
        fn drop(&mut self) {
            let _ = flock(self.file.as_raw_fd(), FlockArg::Unlock);
        }
    }
}

#[cfg(not(unix))]
mod noop {
    use std::path::{Path, PathBuf};
    use crate::error::Failed;

    /// A no-op lock for platforms without advisory file locks.
    #[derive(Debug)]
    pub struct RunLock {
        path: PathBuf,
    }

    impl RunLock {
        pub fn acquire(path: &Path) -> Result<Option<Self>, Failed> {
            Ok(Some(RunLock { path: path.into() }))
        }

        pub fn path(&self) -> &Path {
            &self.path
        }
    }
}


//============ Tests =========================================================

#[cfg(all(test, unix))]
mod test {
    use super::*;

    #[test]
    fn lock_is_exclusive_until_released() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("run.lock");
        let first = RunLock::acquire(&path).unwrap();
        assert!(first.is_some());

        // Each acquire opens its own file description, so the second
        // attempt contends on the flock, finds the recorded holder
        // alive, and reports the conflict.
        let second = RunLock::acquire(&path).unwrap();
        assert!(second.is_none());

        // Dropping the holder releases the flock.
        drop(first);
        let third = RunLock::acquire(&path).unwrap();
        assert!(third.is_some());
    }

    #[test]
    fn lock_records_pid() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("run.lock");
        let _lock = RunLock::acquire(&path).unwrap().unwrap();
        let content = std::fs::read_to_string(&path).unwrap();
        assert_eq!(
            content.trim().parse::<u32>().unwrap(),
            std::process::id()
        );
    }
}
