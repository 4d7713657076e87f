//! Pidfile handling: a single `<pid>\n` line written at startup and removed
//! on normal shutdown.

use std::fs;
use std::io;
use std::path::Path;
use std::process;

use log::warn;

pub fn write_pidfile(path: &Path) -> io::Result<()> {
    fs::write(path, format!("{}\n", process::id())).map_err(|e| {
        warn!("failed to write pidfile {}: {e}", path.display());
        e
    })
}

pub fn remove_pidfile(path: &Path) {
    if let Err(e) = fs::remove_file(path) {
        warn!("failed to delete pidfile {}: {e}", path.display());
    }
}
