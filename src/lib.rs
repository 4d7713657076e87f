//! Kibosh mirrors a target directory at a mount point and injects
//! configurable faults into the mirrored I/O.
//!
//! Every inode, permission, and data byte belongs to the target; the only
//! thing kibosh adds is a virtual control file at the mount root whose JSON
//! contents describe the live fault set. Reading the control file returns the
//! active configuration; writing and closing it installs a new one
//! atomically. Faults can fail reads or writes with chosen error codes,
//! delay them probabilistically, or corrupt the data in flight.

pub mod conf;
pub mod control;
pub mod drop_cache;
pub mod fault;
pub mod fs;
pub mod pidfile;

pub use conf::KiboshConf;
pub use control::{Accessor, CommitOutcome, ControlState, CONTROL_FILE_NAME, CONTROL_PATH};
pub use fault::{CorruptMode, FaultError, FaultKind, FaultSet, OpType};
pub use fs::KiboshFs;
