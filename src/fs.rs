//! The mirroring filesystem: every operation is delegated to the target
//! directory, with the fault set consulted on reads and writes and the
//! control file synthesized at the mount root.

use std::collections::HashMap;
use std::ffi::{CString, OsStr, OsString};
use std::fs;
use std::fs::{File, OpenOptions};
use std::io;
use std::os::unix::ffi::{OsStrExt, OsStringExt};
use std::os::unix::fs::{DirBuilderExt, FileExt, FileTypeExt, MetadataExt, OpenOptionsExt,
                        PermissionsExt};
use std::os::unix::io::AsRawFd;
use std::path::{Path, PathBuf};
use std::thread;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use fuser::{consts, FileAttr, FileType, Filesystem, KernelConfig, ReplyAttr, ReplyCreate,
            ReplyData, ReplyDirectory, ReplyEmpty, ReplyEntry, ReplyOpen, ReplyStatfs,
            ReplyWrite, ReplyXattr, Request, TimeOrNow, FUSE_ROOT_ID};
use libc::{c_int, EINVAL, EIO, ENOENT, O_ACCMODE, O_APPEND, O_CREAT, O_EXCL, O_RDONLY, O_TRUNC};
use log::{debug, info};
use nix::sys::stat::{Mode, SFlag};
use nix::unistd::{Gid, Uid};
use parking_lot::Mutex;

use crate::conf::KiboshConf;
use crate::control::{Accessor, ControlState, CONTROL_FILE_NAME};
use crate::drop_cache::CacheDropper;
use crate::fault::{ReadFault, WriteFault};

const TTL: Duration = Duration::from_secs(1);

/// Reserved inode of the control file.
const CONTROL_INO: u64 = 2;

/// First inode handed out for mirrored paths.
const FIRST_DYNAMIC_INO: u64 = 3;

/// Per-open state for a regular file or the control file.
enum FileHandle {
    Normal {
        file: File,
        /// The mounted path at open time; used for fault matching and never
        /// updated by rename.
        path: OsString,
    },
    Control(Accessor),
}

struct DirEntry {
    ino: u64,
    kind: FileType,
    name: OsString,
}

/// Per-opendir state: the snapshot of entries plus an open handle on the
/// backing directory for fsyncdir.
struct DirHandle {
    entries: Vec<DirEntry>,
    file: File,
    path: OsString,
}

/// Maps between mounted paths and the inode numbers reported to the kernel.
struct InodeTable {
    paths: HashMap<u64, OsString>,
    inos: HashMap<OsString, u64>,
    next_ino: u64,
}

impl InodeTable {
    fn new() -> InodeTable {
        let mut table = InodeTable {
            paths: HashMap::new(),
            inos: HashMap::new(),
            next_ino: FIRST_DYNAMIC_INO,
        };
        table.paths.insert(FUSE_ROOT_ID, OsString::from("/"));
        table.inos.insert(OsString::from("/"), FUSE_ROOT_ID);
        table
    }

    fn path(&self, ino: u64) -> Option<&OsStr> {
        self.paths.get(&ino).map(OsString::as_os_str)
    }

    fn ino_for(&mut self, path: &OsStr) -> u64 {
        if let Some(&ino) = self.inos.get(path) {
            return ino;
        }
        let ino = self.next_ino;
        self.next_ino += 1;
        self.inos.insert(path.to_os_string(), ino);
        self.paths.insert(ino, path.to_os_string());
        ino
    }

    fn rename(&mut self, old: &OsStr, new: &OsStr) {
        if let Some(shadowed) = self.inos.remove(new) {
            self.paths.remove(&shadowed);
        }
        if let Some(ino) = self.inos.remove(old) {
            self.inos.insert(new.to_os_string(), ino);
            self.paths.insert(ino, new.to_os_string());
        }
    }
}

/// Mounted path of `name` inside `parent`.
fn child_path(parent: &OsStr, name: &OsStr) -> OsString {
    let mut path = parent.to_os_string();
    if path.as_bytes() != b"/" {
        path.push("/");
    }
    path.push(name);
    path
}

fn file_type(t: fs::FileType) -> FileType {
    if t.is_symlink() {
        FileType::Symlink
    } else if t.is_dir() {
        FileType::Directory
    } else if t.is_fifo() {
        FileType::NamedPipe
    } else if t.is_char_device() {
        FileType::CharDevice
    } else if t.is_block_device() {
        FileType::BlockDevice
    } else if t.is_socket() {
        FileType::Socket
    } else {
        FileType::RegularFile
    }
}

fn attr_from_metadata(m: &fs::Metadata, ino: u64) -> FileAttr {
    FileAttr {
        ino,
        size: m.size(),
        blocks: m.blocks(),
        atime: m.accessed().unwrap_or(UNIX_EPOCH),
        mtime: m.modified().unwrap_or(UNIX_EPOCH),
        ctime: UNIX_EPOCH
            + Duration::new(m.ctime().max(0) as u64, m.ctime_nsec().max(0) as u32),
        crtime: m.created().unwrap_or(UNIX_EPOCH),
        kind: file_type(m.file_type()),
        perm: (m.mode() & 0o7777) as u16,
        nlink: m.nlink() as u32,
        uid: m.uid(),
        gid: m.gid(),
        rdev: m.rdev() as u32,
        blksize: m.blksize() as u32,
        flags: 0,
    }
}

/// Build OpenOptions from raw FUSE open flags. An access mode of 0 is
/// treated as read-only; an out-of-range mode is rejected.
fn open_options(flags: i32) -> Option<OpenOptions> {
    let mut opts = OpenOptions::new();
    let accmode = flags & O_ACCMODE;
    match accmode {
        libc::O_RDONLY => {
            opts.read(true);
        }
        libc::O_WRONLY => {
            opts.write(true);
        }
        libc::O_RDWR => {
            opts.read(true);
            opts.write(true);
        }
        _ => return None,
    }
    opts.append(flags & O_APPEND != 0);
    opts.truncate(flags & O_TRUNC != 0 && accmode != O_RDONLY);
    opts.create(flags & O_CREAT != 0);
    opts.create_new(flags & O_CREAT != 0 && flags & O_EXCL != 0);
    opts.custom_flags(flags & !(O_ACCMODE | O_APPEND | O_TRUNC | O_CREAT | O_EXCL));
    Some(opts)
}

/// Positioned read that keeps going through partial reads and EINTR until the
/// buffer is full or EOF.
fn read_fully_at(file: &File, buf: &mut [u8], offset: u64) -> io::Result<usize> {
    let mut total = 0;
    while total < buf.len() {
        match file.read_at(&mut buf[total..], offset + total as u64) {
            Ok(0) => break,
            Ok(n) => total += n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => {
                if total > 0 {
                    break;
                }
                return Err(e);
            }
        }
    }
    Ok(total)
}

fn errno(e: &io::Error) -> c_int {
    e.raw_os_error().unwrap_or(EIO)
}

fn cstring(path: &Path) -> io::Result<CString> {
    Ok(CString::new(path.as_os_str().as_bytes())?)
}

fn set_times(bpath: &Path, atime: Option<TimeOrNow>, mtime: Option<TimeOrNow>) -> io::Result<()> {
    fn timespec(t: Option<TimeOrNow>) -> libc::timespec {
        match t {
            None => libc::timespec {
                tv_sec: 0,
                tv_nsec: libc::UTIME_OMIT,
            },
            Some(TimeOrNow::Now) => libc::timespec {
                tv_sec: 0,
                tv_nsec: libc::UTIME_NOW,
            },
            Some(TimeOrNow::SpecificTime(t)) => {
                let d = t.duration_since(UNIX_EPOCH).unwrap_or_default();
                libc::timespec {
                    tv_sec: d.as_secs() as libc::time_t,
                    tv_nsec: d.subsec_nanos() as libc::c_long,
                }
            }
        }
    }
    let cpath = cstring(bpath)?;
    let times = [timespec(atime), timespec(mtime)];
    let ret = unsafe { libc::utimensat(libc::AT_FDCWD, cpath.as_ptr(), times.as_ptr(), 0) };
    if ret < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

fn xattr_get(bpath: &Path, name: &OsStr, buf: &mut [u8]) -> io::Result<usize> {
    let cpath = cstring(bpath)?;
    let cname = CString::new(name.as_bytes())?;
    let ret = unsafe {
        libc::getxattr(
            cpath.as_ptr(),
            cname.as_ptr(),
            buf.as_mut_ptr() as *mut libc::c_void,
            buf.len(),
        )
    };
    if ret < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(ret as usize)
}

fn xattr_set(bpath: &Path, name: &OsStr, value: &[u8], flags: i32) -> io::Result<()> {
    let cpath = cstring(bpath)?;
    let cname = CString::new(name.as_bytes())?;
    let ret = unsafe {
        libc::setxattr(
            cpath.as_ptr(),
            cname.as_ptr(),
            value.as_ptr() as *const libc::c_void,
            value.len(),
            flags,
        )
    };
    if ret < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

fn xattr_list(bpath: &Path, buf: &mut [u8]) -> io::Result<usize> {
    let cpath = cstring(bpath)?;
    let ret = unsafe {
        libc::listxattr(
            cpath.as_ptr(),
            buf.as_mut_ptr() as *mut libc::c_char,
            buf.len(),
        )
    };
    if ret < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(ret as usize)
}

fn xattr_remove(bpath: &Path, name: &OsStr) -> io::Result<()> {
    let cpath = cstring(bpath)?;
    let cname = CString::new(name.as_bytes())?;
    let ret = unsafe { libc::removexattr(cpath.as_ptr(), cname.as_ptr()) };
    if ret < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

/// The mirror filesystem.
pub struct KiboshFs {
    root: PathBuf,
    control_mode: u16,
    state: Mutex<ControlState>,
    inodes: InodeTable,
    files: HashMap<u64, FileHandle>,
    dirs: HashMap<u64, DirHandle>,
    next_fh: u64,
    uid: u32,
    gid: u32,
    started: SystemTime,
    dropper: Option<CacheDropper>,
}

impl KiboshFs {
    /// Build the filesystem from a reified configuration. The target must
    /// already exist and be readable.
    pub fn new(conf: &KiboshConf) -> io::Result<KiboshFs> {
        fs::read_dir(&conf.target_path)?;
        let dropper = conf
            .cache_drop_period
            .map(|period| CacheDropper::start(conf.cache_drop_path.clone(), period));
        Ok(KiboshFs {
            root: conf.target_path.clone(),
            control_mode: (conf.control_mode & 0o7777) as u16,
            state: Mutex::new(ControlState::new(conf.random_seed)),
            inodes: InodeTable::new(),
            files: HashMap::new(),
            dirs: HashMap::new(),
            next_fh: 1,
            uid: unsafe { libc::getuid() },
            gid: unsafe { libc::getgid() },
            started: SystemTime::now(),
            dropper,
        })
    }

    /// The live control state, for callers that reconfigure faults without
    /// going through the mount.
    pub fn control_state(&self) -> &Mutex<ControlState> {
        &self.state
    }

    fn backing_path(&self, mpath: &OsStr) -> PathBuf {
        let mut bytes = self.root.as_os_str().as_bytes().to_vec();
        bytes.extend_from_slice(mpath.as_bytes());
        PathBuf::from(OsString::from_vec(bytes))
    }

    fn mounted_path(&self, ino: u64) -> Option<OsString> {
        self.inodes.path(ino).map(OsStr::to_os_string)
    }

    fn control_attr(&self) -> FileAttr {
        let size = self.state.lock().current_json().len() as u64;
        FileAttr {
            ino: CONTROL_INO,
            size,
            blocks: size.div_ceil(512),
            atime: self.started,
            mtime: self.started,
            ctime: self.started,
            crtime: self.started,
            kind: FileType::RegularFile,
            perm: self.control_mode,
            nlink: 1,
            uid: self.uid,
            gid: self.gid,
            rdev: 0,
            blksize: 512,
            flags: 0,
        }
    }

    fn alloc_fh(&mut self) -> u64 {
        let fh = self.next_fh;
        self.next_fh += 1;
        fh
    }

    fn open_control(&mut self, flags: i32) -> u64 {
        let writable = flags & O_ACCMODE != O_RDONLY;
        let snapshot = if flags & O_TRUNC == 0 {
            Some(self.state.lock().snapshot())
        } else {
            None
        };
        let fh = self.alloc_fh();
        self.files
            .insert(fh, FileHandle::Control(Accessor::new(snapshot, writable)));
        debug!("opened control accessor fh={fh} writable={writable}");
        fh
    }
}

impl Filesystem for KiboshFs {
    fn init(&mut self, _req: &Request<'_>, config: &mut KernelConfig) -> Result<(), c_int> {
        for capability in [consts::FUSE_ASYNC_READ, consts::FUSE_ATOMIC_O_TRUNC] {
            if let Err(unsupported) = config.add_capabilities(capability) {
                debug!("kernel does not offer capability {unsupported:?}");
            }
        }
        info!("mirroring {}", self.root.display());
        Ok(())
    }

    fn destroy(&mut self) {
        if let Some(dropper) = self.dropper.take() {
            dropper.join();
        }
        info!("unmounted");
    }

    fn lookup(&mut self, _req: &Request<'_>, parent: u64, name: &OsStr, reply: ReplyEntry) {
        if parent == FUSE_ROOT_ID && name == CONTROL_FILE_NAME {
            reply.entry(&TTL, &self.control_attr(), 0);
            return;
        }
        let Some(parent_path) = self.mounted_path(parent) else {
            reply.error(ENOENT);
            return;
        };
        let path = child_path(&parent_path, name);
        let bpath = self.backing_path(&path);
        match fs::symlink_metadata(&bpath) {
            Ok(m) => {
                let ino = self.inodes.ino_for(&path);
                reply.entry(&TTL, &attr_from_metadata(&m, ino), 0);
            }
            Err(e) => reply.error(errno(&e)),
        }
    }

    fn getattr(&mut self, _req: &Request<'_>, ino: u64, reply: ReplyAttr) {
        if ino == CONTROL_INO {
            reply.attr(&TTL, &self.control_attr());
            return;
        }
        let Some(path) = self.mounted_path(ino) else {
            reply.error(ENOENT);
            return;
        };
        let bpath = self.backing_path(&path);
        match fs::symlink_metadata(&bpath) {
            Ok(m) => reply.attr(&TTL, &attr_from_metadata(&m, ino)),
            Err(e) => {
                debug!("getattr({}) = {e}", bpath.display());
                reply.error(errno(&e));
            }
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn setattr(
        &mut self,
        _req: &Request<'_>,
        ino: u64,
        mode: Option<u32>,
        uid: Option<u32>,
        gid: Option<u32>,
        size: Option<u64>,
        atime: Option<TimeOrNow>,
        mtime: Option<TimeOrNow>,
        _ctime: Option<SystemTime>,
        fh: Option<u64>,
        _crtime: Option<SystemTime>,
        _chgtime: Option<SystemTime>,
        _bkuptime: Option<SystemTime>,
        _flags: Option<u32>,
        reply: ReplyAttr,
    ) {
        if ino == CONTROL_INO {
            // truncate-on-open fallback for kernels without ATOMIC_O_TRUNC
            if size == Some(0) {
                if let Some(FileHandle::Control(acc)) =
                    fh.and_then(|fh| self.files.get_mut(&fh))
                {
                    acc.clear();
                }
            }
            reply.attr(&TTL, &self.control_attr());
            return;
        }
        let Some(path) = self.mounted_path(ino) else {
            reply.error(ENOENT);
            return;
        };
        let bpath = self.backing_path(&path);
        if let Some(mode) = mode {
            if let Err(e) = fs::set_permissions(&bpath, fs::Permissions::from_mode(mode)) {
                debug!("chmod({}, {mode:04o}) = {e}", bpath.display());
                reply.error(errno(&e));
                return;
            }
        }
        if uid.is_some() || gid.is_some() {
            if let Err(e) = nix::unistd::chown(&bpath, uid.map(Uid::from_raw), gid.map(Gid::from_raw))
            {
                debug!("chown({}) = {e}", bpath.display());
                reply.error(e as c_int);
                return;
            }
        }
        if let Some(size) = size {
            let result = match fh.and_then(|fh| self.files.get(&fh)) {
                Some(FileHandle::Normal { file, .. }) => file.set_len(size),
                _ => OpenOptions::new()
                    .write(true)
                    .open(&bpath)
                    .and_then(|file| file.set_len(size)),
            };
            if let Err(e) = result {
                debug!("truncate({}, {size}) = {e}", bpath.display());
                reply.error(errno(&e));
                return;
            }
        }
        if atime.is_some() || mtime.is_some() {
            if let Err(e) = set_times(&bpath, atime, mtime) {
                debug!("utimens({}) = {e}", bpath.display());
                reply.error(errno(&e));
                return;
            }
        }
        match fs::symlink_metadata(&bpath) {
            Ok(m) => reply.attr(&TTL, &attr_from_metadata(&m, ino)),
            Err(e) => reply.error(errno(&e)),
        }
    }

    fn readlink(&mut self, _req: &Request<'_>, ino: u64, reply: ReplyData) {
        let Some(path) = self.mounted_path(ino) else {
            reply.error(ENOENT);
            return;
        };
        let bpath = self.backing_path(&path);
        match fs::read_link(&bpath) {
            Ok(target) => reply.data(target.as_os_str().as_bytes()),
            Err(e) => reply.error(errno(&e)),
        }
    }

    fn mknod(
        &mut self,
        _req: &Request<'_>,
        parent: u64,
        name: &OsStr,
        mode: u32,
        _umask: u32,
        rdev: u32,
        reply: ReplyEntry,
    ) {
        let Some(parent_path) = self.mounted_path(parent) else {
            reply.error(ENOENT);
            return;
        };
        let path = child_path(&parent_path, name);
        let bpath = self.backing_path(&path);
        // the kernel has already applied the caller's umask to `mode`
        if let Err(e) = nix::sys::stat::mknod(
            &bpath,
            SFlag::from_bits_truncate(mode & libc::S_IFMT),
            Mode::from_bits_truncate(mode & 0o7777),
            rdev as libc::dev_t,
        ) {
            debug!("mknod({}, {mode:04o}) = {e}", bpath.display());
            reply.error(e as c_int);
            return;
        }
        match fs::symlink_metadata(&bpath) {
            Ok(m) => {
                let ino = self.inodes.ino_for(&path);
                reply.entry(&TTL, &attr_from_metadata(&m, ino), 0);
            }
            Err(e) => reply.error(errno(&e)),
        }
    }

    fn mkdir(
        &mut self,
        req: &Request<'_>,
        parent: u64,
        name: &OsStr,
        mode: u32,
        _umask: u32,
        reply: ReplyEntry,
    ) {
        let Some(parent_path) = self.mounted_path(parent) else {
            reply.error(ENOENT);
            return;
        };
        let path = child_path(&parent_path, name);
        let bpath = self.backing_path(&path);
        if let Err(e) = fs::DirBuilder::new().mode(mode).create(&bpath) {
            debug!("mkdir({}, {mode:04o}) = {e}", bpath.display());
            reply.error(errno(&e));
            return;
        }
        // the new directory belongs to the requesting user, not to us
        if let Err(e) = nix::unistd::chown(
            &bpath,
            Some(Uid::from_raw(req.uid())),
            Some(Gid::from_raw(req.gid())),
        ) {
            debug!("mkdir chown({}) = {e}", bpath.display());
            reply.error(e as c_int);
            return;
        }
        match fs::symlink_metadata(&bpath) {
            Ok(m) => {
                let ino = self.inodes.ino_for(&path);
                reply.entry(&TTL, &attr_from_metadata(&m, ino), 0);
            }
            Err(e) => reply.error(errno(&e)),
        }
    }

    fn unlink(&mut self, _req: &Request<'_>, parent: u64, name: &OsStr, reply: ReplyEmpty) {
        let Some(parent_path) = self.mounted_path(parent) else {
            reply.error(ENOENT);
            return;
        };
        let bpath = self.backing_path(&child_path(&parent_path, name));
        match fs::remove_file(&bpath) {
            Ok(()) => reply.ok(),
            Err(e) => {
                debug!("unlink({}) = {e}", bpath.display());
                reply.error(errno(&e));
            }
        }
    }

    fn rmdir(&mut self, _req: &Request<'_>, parent: u64, name: &OsStr, reply: ReplyEmpty) {
        let Some(parent_path) = self.mounted_path(parent) else {
            reply.error(ENOENT);
            return;
        };
        let bpath = self.backing_path(&child_path(&parent_path, name));
        match fs::remove_dir(&bpath) {
            Ok(()) => reply.ok(),
            Err(e) => {
                debug!("rmdir({}) = {e}", bpath.display());
                reply.error(errno(&e));
            }
        }
    }

    fn symlink(
        &mut self,
        _req: &Request<'_>,
        parent: u64,
        name: &OsStr,
        link: &Path,
        reply: ReplyEntry,
    ) {
        let Some(parent_path) = self.mounted_path(parent) else {
            reply.error(ENOENT);
            return;
        };
        let path = child_path(&parent_path, name);
        let bpath = self.backing_path(&path);
        // the target string is stored verbatim
        if let Err(e) = std::os::unix::fs::symlink(link, &bpath) {
            debug!("symlink({} -> {}) = {e}", bpath.display(), link.display());
            reply.error(errno(&e));
            return;
        }
        match fs::symlink_metadata(&bpath) {
            Ok(m) => {
                let ino = self.inodes.ino_for(&path);
                reply.entry(&TTL, &attr_from_metadata(&m, ino), 0);
            }
            Err(e) => reply.error(errno(&e)),
        }
    }

    fn rename(
        &mut self,
        _req: &Request<'_>,
        parent: u64,
        name: &OsStr,
        newparent: u64,
        newname: &OsStr,
        _flags: u32,
        reply: ReplyEmpty,
    ) {
        let (Some(parent_path), Some(newparent_path)) =
            (self.mounted_path(parent), self.mounted_path(newparent))
        else {
            reply.error(ENOENT);
            return;
        };
        let old = child_path(&parent_path, name);
        let new = child_path(&newparent_path, newname);
        let bold = self.backing_path(&old);
        let bnew = self.backing_path(&new);
        match fs::rename(&bold, &bnew) {
            Ok(()) => {
                self.inodes.rename(&old, &new);
                reply.ok();
            }
            Err(e) => {
                debug!("rename({} -> {}) = {e}", bold.display(), bnew.display());
                reply.error(errno(&e));
            }
        }
    }

    fn link(
        &mut self,
        _req: &Request<'_>,
        ino: u64,
        newparent: u64,
        newname: &OsStr,
        reply: ReplyEntry,
    ) {
        let (Some(old_path), Some(newparent_path)) =
            (self.mounted_path(ino), self.mounted_path(newparent))
        else {
            reply.error(ENOENT);
            return;
        };
        let new = child_path(&newparent_path, newname);
        let bold = self.backing_path(&old_path);
        let bnew = self.backing_path(&new);
        if let Err(e) = fs::hard_link(&bold, &bnew) {
            debug!("link({} -> {}) = {e}", bold.display(), bnew.display());
            reply.error(errno(&e));
            return;
        }
        match fs::symlink_metadata(&bnew) {
            Ok(m) => {
                let new_ino = self.inodes.ino_for(&new);
                reply.entry(&TTL, &attr_from_metadata(&m, new_ino), 0);
            }
            Err(e) => reply.error(errno(&e)),
        }
    }

    fn open(&mut self, _req: &Request<'_>, ino: u64, flags: i32, reply: ReplyOpen) {
        if ino == CONTROL_INO {
            let fh = self.open_control(flags);
            reply.opened(fh, consts::FOPEN_DIRECT_IO);
            return;
        }
        let Some(path) = self.mounted_path(ino) else {
            reply.error(ENOENT);
            return;
        };
        let Some(opts) = open_options(flags) else {
            reply.error(EINVAL);
            return;
        };
        let bpath = self.backing_path(&path);
        match opts.open(&bpath) {
            Ok(file) => {
                let fh = self.alloc_fh();
                debug!("open({}, flags={flags:#o}) = fh {fh}", bpath.display());
                self.files.insert(fh, FileHandle::Normal { file, path });
                reply.opened(fh, consts::FOPEN_DIRECT_IO);
            }
            Err(e) => {
                debug!("open({}, flags={flags:#o}) = {e}", bpath.display());
                reply.error(errno(&e));
            }
        }
    }

    fn create(
        &mut self,
        req: &Request<'_>,
        parent: u64,
        name: &OsStr,
        mode: u32,
        _umask: u32,
        flags: i32,
        reply: ReplyCreate,
    ) {
        if parent == FUSE_ROOT_ID && name == CONTROL_FILE_NAME {
            let fh = self.open_control(flags);
            reply.created(&TTL, &self.control_attr(), 0, fh, consts::FOPEN_DIRECT_IO);
            return;
        }
        let Some(parent_path) = self.mounted_path(parent) else {
            reply.error(ENOENT);
            return;
        };
        let path = child_path(&parent_path, name);
        let bpath = self.backing_path(&path);
        let Some(mut opts) = open_options(flags | O_CREAT) else {
            reply.error(EINVAL);
            return;
        };
        // the kernel has already applied the caller's umask to `mode`
        opts.mode(mode);
        let file = match opts.open(&bpath) {
            Ok(file) => file,
            Err(e) => {
                debug!("create({}, mode={mode:04o}) = {e}", bpath.display());
                reply.error(errno(&e));
                return;
            }
        };
        // the new file belongs to the requesting user
        if let Err(e) = nix::unistd::chown(
            &bpath,
            Some(Uid::from_raw(req.uid())),
            Some(Gid::from_raw(req.gid())),
        ) {
            debug!("create chown({}) = {e}", bpath.display());
            reply.error(e as c_int);
            return;
        }
        match fs::symlink_metadata(&bpath) {
            Ok(m) => {
                let ino = self.inodes.ino_for(&path);
                let fh = self.alloc_fh();
                self.files.insert(fh, FileHandle::Normal { file, path });
                reply.created(
                    &TTL,
                    &attr_from_metadata(&m, ino),
                    0,
                    fh,
                    consts::FOPEN_DIRECT_IO,
                );
            }
            Err(e) => reply.error(errno(&e)),
        }
    }

    fn read(
        &mut self,
        _req: &Request<'_>,
        _ino: u64,
        fh: u64,
        offset: i64,
        size: u32,
        _flags: i32,
        _lock_owner: Option<u64>,
        reply: ReplyData,
    ) {
        let (file, path) = match self.files.get(&fh) {
            Some(FileHandle::Control(acc)) => {
                reply.data(acc.read_at(offset, size));
                return;
            }
            Some(FileHandle::Normal { file, path }) => (file, path),
            None => {
                reply.error(EIO);
                return;
            }
        };
        let mut buf = vec![0u8; size as usize];
        let filled = match read_fully_at(file, &mut buf, offset.max(0) as u64) {
            Ok(n) => n,
            Err(e) => {
                debug!("read({}, {size}@{offset}) = {e}", path.to_string_lossy());
                reply.error(errno(&e));
                return;
            }
        };
        // hold the lock only for match + apply; any delay is slept after
        let fault = self
            .state
            .lock()
            .read_fault(path.as_bytes(), &mut buf[..filled]);
        match fault {
            None => reply.data(&buf[..filled]),
            Some(ReadFault::Error(code)) => {
                info!(
                    "[injected read fault] path={}, size={size}, offset={offset} = {code}",
                    path.to_string_lossy()
                );
                reply.error(-code);
            }
            Some(ReadFault::Delay(ms)) => {
                thread::sleep(Duration::from_millis(u64::from(ms)));
                reply.data(&buf[..filled]);
            }
            Some(ReadFault::Corrupted(delivered)) => {
                info!(
                    "[injected read corruption] path={}, size={size}, offset={offset}, \
                     delivered={delivered}",
                    path.to_string_lossy()
                );
                reply.data(&buf[..delivered]);
            }
        }
    }

    fn write(
        &mut self,
        _req: &Request<'_>,
        _ino: u64,
        fh: u64,
        offset: i64,
        data: &[u8],
        _write_flags: u32,
        _flags: i32,
        _lock_owner: Option<u64>,
        reply: ReplyWrite,
    ) {
        let (file, path) = match self.files.get_mut(&fh) {
            Some(FileHandle::Control(acc)) => {
                reply.written(acc.write_at(offset, data));
                return;
            }
            Some(FileHandle::Normal { file, path }) => (file, path),
            None => {
                reply.error(EIO);
                return;
            }
        };
        // faults are consulted before the backing file is touched
        let fault = self.state.lock().write_fault(path.as_bytes(), data);
        let payload: &[u8] = match &fault {
            Some(WriteFault::Error(code)) => {
                info!(
                    "[injected write fault] path={}, size={}, offset={offset} = {code}",
                    path.to_string_lossy(),
                    data.len()
                );
                reply.error(-code);
                return;
            }
            Some(WriteFault::Delay(ms)) => {
                thread::sleep(Duration::from_millis(u64::from(*ms)));
                data
            }
            Some(WriteFault::Corrupted(scratch)) => {
                info!(
                    "[injected write corruption] path={}, size={}, offset={offset}, written={}",
                    path.to_string_lossy(),
                    data.len(),
                    scratch.len()
                );
                scratch
            }
            None => data,
        };
        match file.write_all_at(payload, offset.max(0) as u64) {
            // dropped bytes are invisible: the caller always sees a full write
            Ok(()) => reply.written(data.len() as u32),
            Err(e) => {
                debug!("write({}, {}@{offset}) = {e}", path.to_string_lossy(), data.len());
                reply.error(errno(&e));
            }
        }
    }

    fn flush(
        &mut self,
        _req: &Request<'_>,
        _ino: u64,
        fh: u64,
        _lock_owner: u64,
        reply: ReplyEmpty,
    ) {
        // nothing is cached here
        if self.files.contains_key(&fh) {
            reply.ok();
        } else {
            reply.error(EIO);
        }
    }

    fn release(
        &mut self,
        _req: &Request<'_>,
        _ino: u64,
        fh: u64,
        _flags: i32,
        _lock_owner: Option<u64>,
        _flush: bool,
        reply: ReplyEmpty,
    ) {
        match self.files.remove(&fh) {
            Some(FileHandle::Normal { .. }) => reply.ok(),
            Some(FileHandle::Control(acc)) => {
                if acc.writable() {
                    self.state.lock().commit(acc.contents());
                } else {
                    debug!("closing read-only control accessor fh={fh}");
                }
                // a rejected document is the writer's problem, not close(2)'s
                reply.ok();
            }
            None => reply.error(EIO),
        }
    }

    fn fsync(&mut self, _req: &Request<'_>, _ino: u64, fh: u64, datasync: bool, reply: ReplyEmpty) {
        match self.files.get(&fh) {
            Some(FileHandle::Normal { file, .. }) => {
                let result = if datasync {
                    file.sync_data()
                } else {
                    file.sync_all()
                };
                match result {
                    Ok(()) => reply.ok(),
                    Err(e) => reply.error(errno(&e)),
                }
            }
            Some(FileHandle::Control(_)) => reply.ok(),
            None => reply.error(EIO),
        }
    }

    fn opendir(&mut self, _req: &Request<'_>, ino: u64, _flags: i32, reply: ReplyOpen) {
        let Some(path) = self.mounted_path(ino) else {
            reply.error(ENOENT);
            return;
        };
        let bpath = self.backing_path(&path);
        let dir_file = match File::open(&bpath) {
            Ok(file) => file,
            Err(e) => {
                debug!("opendir({}) = {e}", bpath.display());
                reply.error(errno(&e));
                return;
            }
        };
        let iter = match fs::read_dir(&bpath) {
            Ok(iter) => iter,
            Err(e) => {
                reply.error(errno(&e));
                return;
            }
        };
        let mut entries = Vec::new();
        for entry in iter {
            let entry = match entry {
                Ok(entry) => entry,
                Err(e) => {
                    reply.error(errno(&e));
                    return;
                }
            };
            let name = entry.file_name();
            // a real file shadowed by the control name stays hidden
            if ino == FUSE_ROOT_ID && name == CONTROL_FILE_NAME {
                continue;
            }
            let kind = entry
                .file_type()
                .map(file_type)
                .unwrap_or(FileType::RegularFile);
            let child = child_path(&path, &name);
            let child_ino = self.inodes.ino_for(&child);
            entries.push(DirEntry {
                ino: child_ino,
                kind,
                name,
            });
        }
        let fh = self.alloc_fh();
        debug!(
            "opendir({}) = fh {fh} with {} entries",
            bpath.display(),
            entries.len()
        );
        self.dirs.insert(
            fh,
            DirHandle {
                entries,
                file: dir_file,
                path,
            },
        );
        reply.opened(fh, 0);
    }

    fn readdir(
        &mut self,
        _req: &Request<'_>,
        _ino: u64,
        fh: u64,
        offset: i64,
        mut reply: ReplyDirectory,
    ) {
        let Some(dir) = self.dirs.get(&fh) else {
            reply.error(EIO);
            return;
        };
        for (i, entry) in dir.entries.iter().enumerate().skip(offset.max(0) as usize) {
            // i + 1 is the offset of the next entry
            if reply.add(entry.ino, (i + 1) as i64, entry.kind, &entry.name) {
                break;
            }
        }
        reply.ok();
    }

    fn releasedir(
        &mut self,
        _req: &Request<'_>,
        _ino: u64,
        fh: u64,
        _flags: i32,
        reply: ReplyEmpty,
    ) {
        match self.dirs.remove(&fh) {
            Some(dir) => {
                debug!("releasedir({})", dir.path.to_string_lossy());
                reply.ok();
            }
            None => reply.error(EIO),
        }
    }

    fn fsyncdir(
        &mut self,
        _req: &Request<'_>,
        _ino: u64,
        fh: u64,
        datasync: bool,
        reply: ReplyEmpty,
    ) {
        let Some(dir) = self.dirs.get(&fh) else {
            reply.error(EIO);
            return;
        };
        let result = if datasync {
            dir.file.sync_data()
        } else {
            dir.file.sync_all()
        };
        match result {
            Ok(()) => reply.ok(),
            Err(e) => reply.error(errno(&e)),
        }
    }

    fn statfs(&mut self, _req: &Request<'_>, ino: u64, reply: ReplyStatfs) {
        let Some(path) = self.mounted_path(ino) else {
            reply.error(ENOENT);
            return;
        };
        let bpath = self.backing_path(&path);
        match nix::sys::statvfs::statvfs(&bpath) {
            Ok(st) => reply.statfs(
                st.blocks(),
                st.blocks_free(),
                st.blocks_available(),
                st.files(),
                st.files_free(),
                st.block_size() as u32,
                st.name_max() as u32,
                st.fragment_size() as u32,
            ),
            Err(e) => {
                debug!("statfs({}) = {e}", bpath.display());
                reply.error(e as c_int);
            }
        }
    }

    fn setxattr(
        &mut self,
        _req: &Request<'_>,
        ino: u64,
        name: &OsStr,
        value: &[u8],
        flags: i32,
        _position: u32,
        reply: ReplyEmpty,
    ) {
        let Some(path) = self.mounted_path(ino) else {
            reply.error(ENOENT);
            return;
        };
        let bpath = self.backing_path(&path);
        match xattr_set(&bpath, name, value, flags) {
            Ok(()) => reply.ok(),
            Err(e) => reply.error(errno(&e)),
        }
    }

    fn getxattr(
        &mut self,
        _req: &Request<'_>,
        ino: u64,
        name: &OsStr,
        size: u32,
        reply: ReplyXattr,
    ) {
        let Some(path) = self.mounted_path(ino) else {
            reply.error(ENOENT);
            return;
        };
        let bpath = self.backing_path(&path);
        if size == 0 {
            match xattr_get(&bpath, name, &mut []) {
                Ok(n) => reply.size(n as u32),
                Err(e) => reply.error(errno(&e)),
            }
            return;
        }
        let mut buf = vec![0u8; size as usize];
        match xattr_get(&bpath, name, &mut buf) {
            Ok(n) => reply.data(&buf[..n]),
            Err(e) => reply.error(errno(&e)),
        }
    }

    fn listxattr(&mut self, _req: &Request<'_>, ino: u64, size: u32, reply: ReplyXattr) {
        let Some(path) = self.mounted_path(ino) else {
            reply.error(ENOENT);
            return;
        };
        let bpath = self.backing_path(&path);
        if size == 0 {
            match xattr_list(&bpath, &mut []) {
                Ok(n) => reply.size(n as u32),
                Err(e) => reply.error(errno(&e)),
            }
            return;
        }
        let mut buf = vec![0u8; size as usize];
        match xattr_list(&bpath, &mut buf) {
            Ok(n) => reply.data(&buf[..n]),
            Err(e) => reply.error(errno(&e)),
        }
    }

    fn removexattr(&mut self, _req: &Request<'_>, ino: u64, name: &OsStr, reply: ReplyEmpty) {
        let Some(path) = self.mounted_path(ino) else {
            reply.error(ENOENT);
            return;
        };
        let bpath = self.backing_path(&path);
        match xattr_remove(&bpath, name) {
            Ok(()) => reply.ok(),
            Err(e) => reply.error(errno(&e)),
        }
    }

    fn fallocate(
        &mut self,
        _req: &Request<'_>,
        _ino: u64,
        fh: u64,
        offset: i64,
        length: i64,
        mode: i32,
        reply: ReplyEmpty,
    ) {
        let Some(FileHandle::Normal { file, .. }) = self.files.get(&fh) else {
            reply.error(EIO);
            return;
        };
        let ret = unsafe { libc::fallocate(file.as_raw_fd(), mode, offset, length) };
        if ret < 0 {
            let e = io::Error::last_os_error();
            debug!("fallocate(fh={fh}, {length}@{offset}) = {e}");
            reply.error(errno(&e));
        } else {
            reply.ok();
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::fault::FaultSet;

    #[test]
    fn test_child_path() {
        assert_eq!(
            OsString::from("/a"),
            child_path(OsStr::new("/"), OsStr::new("a"))
        );
        assert_eq!(
            OsString::from("/a/b"),
            child_path(OsStr::new("/a"), OsStr::new("b"))
        );
    }

    #[test]
    fn test_inode_table() {
        let mut table = InodeTable::new();
        assert_eq!(Some(OsStr::new("/")), table.path(FUSE_ROOT_ID));
        let a = table.ino_for(OsStr::new("/a"));
        let b = table.ino_for(OsStr::new("/b"));
        assert_ne!(a, b);
        assert!(a >= FIRST_DYNAMIC_INO);
        // stable across lookups
        assert_eq!(a, table.ino_for(OsStr::new("/a")));
        table.rename(OsStr::new("/a"), OsStr::new("/c"));
        assert_eq!(a, table.ino_for(OsStr::new("/c")));
        assert_eq!(Some(OsStr::new("/c")), table.path(a));
        // renaming over an existing path drops the shadowed inode
        table.rename(OsStr::new("/c"), OsStr::new("/b"));
        assert_eq!(a, table.ino_for(OsStr::new("/b")));
        assert_eq!(None, table.path(b));
    }

    #[test]
    fn test_open_options_accmode() {
        assert!(open_options(libc::O_RDONLY).is_some());
        assert!(open_options(libc::O_WRONLY).is_some());
        assert!(open_options(libc::O_RDWR).is_some());
        assert!(open_options(O_ACCMODE).is_none());
    }

    #[test]
    fn test_read_fully_at() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("f");
        fs::write(&path, b"hello world").unwrap();
        let file = File::open(&path).unwrap();
        let mut buf = [0u8; 5];
        assert_eq!(5, read_fully_at(&file, &mut buf, 0).unwrap());
        assert_eq!(b"hello", &buf);
        // reads past EOF come back short
        let mut buf = [0u8; 64];
        assert_eq!(5, read_fully_at(&file, &mut buf, 6).unwrap());
        assert_eq!(b"world", &buf[..5]);
        assert_eq!(0, read_fully_at(&file, &mut buf, 100).unwrap());
    }

    #[test]
    fn test_attr_from_metadata() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("f");
        fs::write(&path, b"12345").unwrap();
        let m = fs::symlink_metadata(&path).unwrap();
        let attr = attr_from_metadata(&m, 7);
        assert_eq!(7, attr.ino);
        assert_eq!(5, attr.size);
        assert_eq!(FileType::RegularFile, attr.kind);
        let dattr = attr_from_metadata(&fs::symlink_metadata(dir.path()).unwrap(), 8);
        assert_eq!(FileType::Directory, dattr.kind);
    }

    #[test]
    fn test_backing_path_concatenation() {
        let dir = tempfile::tempdir().unwrap();
        let conf = KiboshConf {
            target_path: dir.path().to_path_buf(),
            ..KiboshConf::default()
        };
        let fs = KiboshFs::new(&conf).unwrap();
        let bpath = fs.backing_path(OsStr::new("/x/y"));
        assert_eq!(dir.path().join("x/y"), bpath);
        assert_eq!(
            PathBuf::from(format!("{}/", dir.path().display())),
            fs.backing_path(OsStr::new("/"))
        );
    }

    #[test]
    fn test_control_attr_tracks_json() {
        let dir = tempfile::tempdir().unwrap();
        let conf = KiboshConf {
            target_path: dir.path().to_path_buf(),
            random_seed: Some(1),
            ..KiboshConf::default()
        };
        let fs = KiboshFs::new(&conf).unwrap();
        let attr = fs.control_attr();
        assert_eq!(CONTROL_INO, attr.ino);
        assert_eq!(FileType::RegularFile, attr.kind);
        assert_eq!(0o600, attr.perm);
        assert_eq!(FaultSet::default().unparse().len() as u64, attr.size);
        let doc = "{\"faults\":[{\"type\":\"unreadable\", \"code\":5}]}";
        fs.control_state().lock().commit(doc.as_bytes());
        assert_eq!(doc.len() as u64, fs.control_attr().size);
    }

    #[test]
    fn test_set_times() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("f");
        fs::write(&path, b"x").unwrap();
        let then = UNIX_EPOCH + Duration::from_secs(1_000_000);
        set_times(
            &path,
            Some(TimeOrNow::SpecificTime(then)),
            Some(TimeOrNow::SpecificTime(then)),
        )
        .unwrap();
        let m = fs::symlink_metadata(&path).unwrap();
        assert_eq!(then, m.modified().unwrap());
        assert_eq!(then, m.accessed().unwrap());
    }
}
