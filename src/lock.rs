use std::{
    fs::{File, OpenOptions},
    path::{Path, PathBuf},
    sync::Arc,
};

use log::debug;
use parking_lot::{Mutex, MutexGuard};

use crate::error::Result;

/// Mutual exclusion over "server configuration file + live interface".
///
/// One handle is built at start-up and cloned into every component that reads-then-writes
/// the server configuration. Threads of this process serialize on the inner mutex; other
/// processes (a second admin invocation, the monitor daemon) serialize on an advisory lock
/// held on `<server config>.lock`.
#[derive(Clone)]
pub struct ConfigLock {
    inner: Arc<Mutex<()>>,
    lock_path: Option<PathBuf>,
}

/// Proof that the caller holds the [`ConfigLock`]. Mutating reconciler calls require one.
pub struct ConfigGuard<'a> {
    // Field order is drop order: the file lock goes before the thread lock.
    _file: Option<File>,
    _thread: MutexGuard<'a, ()>,
}

impl ConfigLock {
    /// Lock coordinated across processes through `<path>.lock`.
    pub fn for_file(path: &Path) -> Self {
        let mut name = path.as_os_str().to_os_string();
        name.push(".lock");
        Self {
            inner: Arc::new(Mutex::new(())),
            lock_path: Some(PathBuf::from(name)),
        }
    }

    /// Lock scoped to this process only.
    pub fn in_process() -> Self {
        Self {
            inner: Arc::new(Mutex::new(())),
            lock_path: None,
        }
    }

    pub fn acquire(&self) -> Result<ConfigGuard<'_>> {
        let thread = self.inner.lock();
        let file = match &self.lock_path {
            Some(path) => {
                let file = OpenOptions::new()
                    .create(true)
                    .truncate(false)
                    .write(true)
                    .open(path)?;
                // Released when the file handle is dropped with the guard.
                file.lock()?;
                debug!("acquired {}", path.display());
                Some(file)
            }
            None => None,
        };
        Ok(ConfigGuard {
            _file: file,
            _thread: thread,
        })
    }
}
