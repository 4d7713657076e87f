//! Mount configuration: what the CLI collects and the filesystem consumes.

use std::env;
use std::fmt;
use std::io;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::drop_cache::DEFAULT_DROP_CACHES_PATH;

/// Permission bits reported for the control file unless overridden.
pub const DEFAULT_CONTROL_MODE: u32 = 0o600;

/// Everything the mount needs besides the mount point itself.
#[derive(Debug, Clone)]
pub struct KiboshConf {
    /// The directory being mirrored. Absolute after [`KiboshConf::reify`].
    pub target_path: PathBuf,
    /// Mode bits reported for the control file.
    pub control_mode: u32,
    /// Redirect log output to this file instead of stderr.
    pub log_path: Option<PathBuf>,
    /// Write `<pid>\n` here on startup, remove it on shutdown.
    pub pidfile_path: Option<PathBuf>,
    /// Seed for the fault RNG; absent means entropy-seeded.
    pub random_seed: Option<u64>,
    /// Enable debug logging.
    pub verbose: bool,
    /// Run the cache-drop ticker with this period.
    pub cache_drop_period: Option<Duration>,
    /// Where the ticker writes its "1".
    pub cache_drop_path: PathBuf,
}

impl Default for KiboshConf {
    fn default() -> KiboshConf {
        KiboshConf {
            target_path: PathBuf::new(),
            control_mode: DEFAULT_CONTROL_MODE,
            log_path: None,
            pidfile_path: None,
            random_seed: None,
            verbose: false,
            cache_drop_period: None,
            cache_drop_path: PathBuf::from(DEFAULT_DROP_CACHES_PATH),
        }
    }
}

impl KiboshConf {
    /// Make the configured paths absolute and verify the target is usable.
    /// Errors here are fatal at startup.
    pub fn reify(&mut self) -> io::Result<()> {
        if self.target_path.as_os_str().is_empty() {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "a target path is required",
            ));
        }
        if let Some(path) = self.pidfile_path.take() {
            self.pidfile_path = Some(absolutize(path)?);
        }
        if let Some(path) = self.log_path.take() {
            self.log_path = Some(absolutize(path)?);
        }
        // Canonicalizing also verifies that the target exists.
        self.target_path = self.target_path.canonicalize()?;
        if !self.target_path.is_dir() {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("target {} is not a directory", self.target_path.display()),
            ));
        }
        std::fs::read_dir(&self.target_path)?;
        Ok(())
    }
}

impl fmt::Display for KiboshConf {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{{target_path={:?}, control_mode=0{:03o}, log_path={:?}, pidfile_path={:?}, \
             random_seed={:?}, verbose={}, cache_drop_period={:?}, cache_drop_path={:?}}}",
            self.target_path,
            self.control_mode,
            self.log_path,
            self.pidfile_path,
            self.random_seed,
            self.verbose,
            self.cache_drop_period.map(|p| p.as_secs()),
            self.cache_drop_path,
        )
    }
}

/// Prepend the current working directory to a relative path. This makes the
/// path absolute, not canonical; the file may not exist yet.
fn absolutize(path: PathBuf) -> io::Result<PathBuf> {
    if path.is_absolute() {
        return Ok(path);
    }
    Ok(env::current_dir()?.join(path))
}

/// Parse an octal mode string such as "600" or "0644".
pub fn parse_octal_mode(s: &str) -> Result<u32, String> {
    u32::from_str_radix(s, 8)
        .map_err(|e| format!("invalid octal mode {s:?}: {e}"))
        .and_then(|mode| {
            if mode > 0o7777 {
                Err(format!("mode 0{mode:o} has more than permission bits"))
            } else {
                Ok(mode)
            }
        })
}

/// True when `path` names the same directory as, or a directory inside,
/// `target`. Mounting inside the mirrored tree would make every operation
/// recurse into the mount itself.
pub fn is_within(path: &Path, target: &Path) -> bool {
    path.starts_with(target)
}
