//! The state file, guarded against concurrent runs.

use anyhow::{Context as _, Result};
use std::{
    ffi::OsString,
    fs::{File, OpenOptions},
    io,
    path::{Path, PathBuf},
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    time::{Duration, Instant},
};

/// Monitor a task which may take a long time, and write messages to the console
/// as needed.
/// After SILENT_INTERVAL: print activity
/// After LOG_INTERVAL: print activity and duration
pub struct WaitMonitor {
    done: Arc<AtomicBool>,
}
impl WaitMonitor {
    const SILENT_INTERVAL: Duration = Duration::from_millis(500);
    const LOG_INTERVAL: Duration = Duration::from_secs(5);

    pub fn new(activity: String) -> WaitMonitor {
        let done = Arc::new(AtomicBool::new(false));
        let r = WaitMonitor { done: done.clone() };
        std::thread::spawn(move || WaitMonitor::run(done, activity));
        r
    }
    fn run(done: Arc<AtomicBool>, activity: String) {
        let start = Instant::now();
        let mut next_log = start + Self::SILENT_INTERVAL;
        loop {
            std::thread::sleep(next_log.saturating_duration_since(Instant::now()));
            if done.load(Ordering::Relaxed) {
                break;
            }
            let waited = next_log.duration_since(start);
            if waited <= Self::SILENT_INTERVAL {
                tracing::info!("{}", activity);
            } else {
                tracing::info!("{} ({} s)", activity, waited.as_secs());
            }
            next_log += Self::LOG_INTERVAL;
        }
    }
    pub fn done(&self) {
        self.done.store(true, Ordering::Relaxed);
    }
}
impl Drop for WaitMonitor {
    fn drop(&mut self) {
        self.done()
    }
}

/// A state file and the lock file next to it.
///
/// The lock lives in a separate file because saving replaces the state file.
pub struct StateFile {
    path: PathBuf,
    locking: fd_lock::RwLock<File>,
}

impl StateFile {
    pub fn open<P: AsRef<Path>>(path: P) -> Result<StateFile> {
        let path = path.as_ref().to_path_buf();
        let lock_path = sibling(&path, ".lock");
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(&lock_path)
            .with_context(|| format!("Could not open lock file {}", lock_path.display()))?;
        Ok(StateFile {
            path,
            locking: fd_lock::RwLock::new(file),
        })
    }

    /// Wait for exclusive access to the state.
    pub fn lock(&mut self) -> Result<StateGuard<'_>> {
        let path: &Path = &self.path;
        let lock_wait_mon = WaitMonitor::new(format!(
            "Waiting for the lock on state file {}",
            path.display()
        ));
        let guard = self.locking.write().context("Could not lock state file")?;
        lock_wait_mon.done();
        Ok(StateGuard {
            path,
            _guard: guard,
        })
    }
}

pub struct StateGuard<'a> {
    path: &'a Path,
    _guard: fd_lock::RwLockWriteGuard<'a, File>,
}

impl StateGuard<'_> {
    /// The persisted state. A missing file is no state.
    pub fn read(&self) -> Result<Vec<u8>> {
        match std::fs::read(self.path) {
            Ok(bytes) => Ok(bytes),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(Vec::new()),
            Err(e) => Err(e)
                .with_context(|| format!("Could not read state file {}", self.path.display())),
        }
    }

    /// Replace the state file, so that readers see either the old or the new
    /// state in full.
    pub fn save(&self, state: &[u8]) -> Result<()> {
        let tmp = sibling(self.path, ".tmp");
        std::fs::write(&tmp, state)
            .with_context(|| format!("Could not write {}", tmp.display()))?;
        std::fs::rename(&tmp, self.path)
            .with_context(|| format!("Could not replace state file {}", self.path.display()))?;
        tracing::debug!(path = %self.path.display(), bytes = state.len(), "saved state");
        Ok(())
    }
}

fn sibling(path: &Path, suffix: &str) -> PathBuf {
    let mut name: OsString = path.as_os_str().to_owned();
    name.push(suffix);
    PathBuf::from(name)
}
