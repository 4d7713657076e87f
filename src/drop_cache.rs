//! Background ticker that periodically asks the kernel to drop its page
//! cache by writing "1" to a configured pseudo-file.

use std::fs::OpenOptions;
use std::io;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use log::{debug, info, warn};
use parking_lot::{Condvar, Mutex};

/// Where the drop request goes unless the configuration says otherwise.
pub const DEFAULT_DROP_CACHES_PATH: &str = "/proc/sys/vm/drop_caches";

/// Write the single byte `1` to `path`.
pub fn drop_cache(path: &Path) -> io::Result<()> {
    let mut file = OpenOptions::new()
        .write(true)
        .create(true)
        .truncate(false)
        .open(path)?;
    file.write_all(b"1")
}

struct Shared {
    should_run: Mutex<bool>,
    cond: Condvar,
}

/// Handle to the ticker thread. Dropping it (or calling [`CacheDropper::join`])
/// wakes the thread immediately and waits for it to exit.
pub struct CacheDropper {
    shared: Arc<Shared>,
    thread: Option<thread::JoinHandle<()>>,
}

impl CacheDropper {
    pub fn start(path: PathBuf, period: Duration) -> CacheDropper {
        let shared = Arc::new(Shared {
            should_run: Mutex::new(true),
            cond: Condvar::new(),
        });
        let thread_shared = Arc::clone(&shared);
        let thread = thread::spawn(move || run(&thread_shared, &path, period));
        CacheDropper {
            shared,
            thread: Some(thread),
        }
    }

    pub fn join(mut self) {
        self.shutdown();
    }

    fn shutdown(&mut self) {
        {
            let mut should_run = self.shared.should_run.lock();
            *should_run = false;
            self.shared.cond.notify_one();
        }
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
    }
}

impl Drop for CacheDropper {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn run(shared: &Shared, path: &Path, period: Duration) {
    info!(
        "cache dropper: starting with period {}s on {}",
        period.as_secs(),
        path.display()
    );
    let mut should_run = shared.should_run.lock();
    while *should_run {
        let deadline = Instant::now() + period;
        // Instant is monotonic; spurious wakeups just re-arm the same deadline.
        while *should_run && Instant::now() < deadline {
            shared.cond.wait_until(&mut should_run, deadline);
        }
        if !*should_run {
            break;
        }
        parking_lot::MutexGuard::unlocked(&mut should_run, || match drop_cache(path) {
            Ok(()) => debug!("cache dropper: dropped cache"),
            Err(e) => warn!("cache dropper: failed to drop cache: {e}"),
        });
    }
    info!("cache dropper: exiting");
}
