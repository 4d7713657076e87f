//! The control channel: the in-memory state behind `/kibosh_control` and the
//! per-open accessor buffers that read and rewrite it.

use log::{debug, info, warn};
use rand::rngs::SmallRng;
use rand::SeedableRng;

use crate::fault::{FaultError, FaultSet, OpType, ReadFault, WriteFault};

/// Name of the control file within the mount root.
pub const CONTROL_FILE_NAME: &str = "kibosh_control";

/// Mounted path of the control file.
pub const CONTROL_PATH: &str = "/kibosh_control";

/// The longest control document accepted on write. Bytes past this limit are
/// dropped, which makes an oversized document fail to parse at commit time.
pub const CONTROL_BUF_LEN: usize = 16384;

/// Outcome of committing an accessor buffer back into the live state.
#[derive(Debug)]
pub enum CommitOutcome {
    /// The buffer was byte-identical to the active document; nothing was
    /// reparsed.
    Unchanged,
    /// A new fault set was installed.
    Applied,
    /// The buffer did not parse; the previous configuration remains active.
    Rejected(FaultError),
}

/// The live fault configuration. Owned by the filesystem and only ever
/// accessed under its mutex; the RNG lives here so that probabilistic
/// matching and count decay share one critical section.
pub struct ControlState {
    current_json: String,
    faults: FaultSet,
    rng: SmallRng,
}

impl ControlState {
    /// Start with the empty fault set. An explicit seed makes every
    /// probabilistic decision reproducible.
    pub fn new(seed: Option<u64>) -> ControlState {
        let faults = FaultSet::default();
        ControlState {
            current_json: faults.unparse(),
            faults,
            rng: match seed {
                Some(seed) => SmallRng::seed_from_u64(seed),
                None => SmallRng::from_entropy(),
            },
        }
    }

    /// The canonical document describing the active fault set.
    pub fn current_json(&self) -> &str {
        &self.current_json
    }

    pub fn faults(&self) -> &FaultSet {
        &self.faults
    }

    /// Snapshot the active document for a newly opened accessor.
    pub fn snapshot(&self) -> Vec<u8> {
        self.current_json.as_bytes().to_vec()
    }

    /// Consult the fault set for a completed read of `buf`.
    pub fn read_fault(&mut self, path: &[u8], buf: &mut [u8]) -> Option<ReadFault> {
        let Self { faults, rng, .. } = self;
        faults
            .first_match_mut(path, OpType::Read, rng)
            .map(|fault| fault.apply_read(buf, rng))
    }

    /// Consult the fault set for a pending write of `data`.
    pub fn write_fault(&mut self, path: &[u8], data: &[u8]) -> Option<WriteFault> {
        let Self { faults, rng, .. } = self;
        faults
            .first_match_mut(path, OpType::Write, rng)
            .map(|fault| fault.apply_write(data, rng))
    }

    /// Commit the contents of a released writable accessor.
    ///
    /// An unchanged buffer is not reparsed; an unparsable buffer is logged
    /// and discarded so the old configuration survives.
    pub fn commit(&mut self, buf: &[u8]) -> CommitOutcome {
        if buf == self.current_json.as_bytes() {
            debug!("control commit: document unchanged, skipping reparse");
            return CommitOutcome::Unchanged;
        }
        let text = match std::str::from_utf8(buf) {
            Ok(text) => text,
            Err(e) => {
                warn!("control commit: rejected non-UTF-8 document: {e}");
                return CommitOutcome::Rejected(FaultError::Invalid(e.to_string()));
            }
        };
        match FaultSet::parse(text) {
            Ok(faults) => {
                self.faults = faults;
                self.current_json = text.to_string();
                info!("control commit: refreshed faults: {}", self.current_json);
                CommitOutcome::Applied
            }
            Err(e) => {
                warn!("control commit: rejected document of {} bytes: {e}", buf.len());
                CommitOutcome::Rejected(e)
            }
        }
    }
}

/// The per-open buffer backing one `open()` of the control file. Each open
/// carries its own copy; whichever writable accessor releases last wins.
pub struct Accessor {
    buf: Vec<u8>,
    writable: bool,
}

impl Accessor {
    /// `snapshot` is the document to start from; `None` starts empty (the
    /// open carried `O_TRUNC`).
    pub fn new(snapshot: Option<Vec<u8>>, writable: bool) -> Accessor {
        Accessor {
            buf: snapshot.unwrap_or_default(),
            writable,
        }
    }

    /// Whether release should attempt a commit.
    pub fn writable(&self) -> bool {
        self.writable
    }

    pub fn contents(&self) -> &[u8] {
        &self.buf
    }

    pub fn len(&self) -> usize {
        self.buf.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    /// Serve a positioned read out of the buffer.
    pub fn read_at(&self, offset: i64, size: u32) -> &[u8] {
        let offset = offset.max(0) as usize;
        if offset >= self.buf.len() {
            return &[];
        }
        let end = (offset + size as usize).min(self.buf.len());
        &self.buf[offset..end]
    }

    /// Store a positioned write, extending the buffer as needed. Bytes past
    /// the capacity are dropped; the reported count is always the full
    /// request so the writer does not see a short write.
    pub fn write_at(&mut self, offset: i64, data: &[u8]) -> u32 {
        let offset = (offset.max(0) as usize).min(CONTROL_BUF_LEN);
        let end = (offset + data.len()).min(CONTROL_BUF_LEN);
        let stored = end - offset;
        if self.buf.len() < end {
            self.buf.resize(end, 0);
        }
        self.buf[offset..end].copy_from_slice(&data[..stored]);
        data.len() as u32
    }

    /// Discard the buffer contents (truncate-on-open fallback).
    pub fn clear(&mut self) {
        self.buf.clear();
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::fault::{CorruptMode, FaultKind};

    #[test]
    fn test_initial_state_is_empty() {
        let state = ControlState::new(Some(1));
        assert!(state.faults().is_empty());
        assert_eq!("{\"faults\":[]}", state.current_json());
    }

    #[test]
    fn test_commit_applies_new_set() {
        let mut state = ControlState::new(Some(1));
        let doc = "{\"faults\":[{\"type\":\"unreadable\", \"code\":5}]}";
        assert!(matches!(
            state.commit(doc.as_bytes()),
            CommitOutcome::Applied
        ));
        assert_eq!(1, state.faults().len());
        // snapshot law: the next open reads back exactly what was committed
        assert_eq!(doc.as_bytes(), state.snapshot().as_slice());
    }

    #[test]
    fn test_commit_unchanged_is_not_reparsed() {
        let mut state = ControlState::new(Some(1));
        let snapshot = state.snapshot();
        assert!(matches!(
            state.commit(&snapshot),
            CommitOutcome::Unchanged
        ));
        assert_eq!(snapshot, state.snapshot());
    }

    #[test]
    fn test_commit_rejection_preserves_state() {
        let mut state = ControlState::new(Some(1));
        let doc = "{\"faults\":[{\"type\":\"unwritable\", \"code\":7}]}";
        assert!(matches!(state.commit(doc.as_bytes()), CommitOutcome::Applied));
        assert!(matches!(
            state.commit(b"not json"),
            CommitOutcome::Rejected(_)
        ));
        assert_eq!(doc, state.current_json());
        assert_eq!(1, state.faults().len());
    }

    #[test]
    fn test_read_fault_lookup() {
        let mut state = ControlState::new(Some(1));
        state.commit(b"{\"faults\":[{\"type\":\"unreadable\", \"suffix\":\".log\", \"code\":5}]}");
        let mut buf = [0u8; 8];
        assert_eq!(
            Some(ReadFault::Error(-5)),
            state.read_fault(b"/b.log", &mut buf)
        );
        assert_eq!(None, state.read_fault(b"/b.txt", &mut buf));
        assert_eq!(None, state.write_fault(b"/b.log", &buf));
    }

    #[test]
    fn test_decay_persists_across_lookups() {
        let mut state = ControlState::new(Some(1));
        let set = FaultSet::new(vec![FaultKind::ReadCorrupt {
            prefix: "/".to_string(),
            suffix: String::new(),
            mode: CorruptMode::Drop,
            count: 2,
            fraction: 1.0,
        }]);
        state.commit(set.unparse().as_bytes());
        let mut buf = [b'A'; 1024];
        // DROP @ 1.0 cuts at zero even before decay
        assert_eq!(
            Some(ReadFault::Corrupted(0)),
            state.read_fault(b"/f", &mut buf)
        );
        assert_eq!(
            Some(ReadFault::Corrupted(0)),
            state.read_fault(b"/f", &mut buf)
        );
        // third injection comes from the decayed fault
        assert_eq!(
            Some(ReadFault::Corrupted(0)),
            state.read_fault(b"/f", &mut buf)
        );
    }

    #[test]
    fn test_accessor_read_ranges() {
        let acc = Accessor::new(Some(b"hello world".to_vec()), false);
        assert_eq!(b"hello".as_slice(), acc.read_at(0, 5));
        assert_eq!(b"world".as_slice(), acc.read_at(6, 100));
        assert_eq!(b"".as_slice(), acc.read_at(50, 4));
        assert!(!acc.writable());
    }

    #[test]
    fn test_accessor_write_and_overwrite() {
        let mut acc = Accessor::new(Some(b"aaaa".to_vec()), true);
        assert_eq!(4, acc.write_at(2, b"bbbb"));
        assert_eq!(b"aabbbb".as_slice(), acc.contents());
        // sparse extension zero-fills the gap
        assert_eq!(2, acc.write_at(8, b"cc"));
        assert_eq!(b"aabbbb\0\0cc".as_slice(), acc.contents());
    }

    #[test]
    fn test_accessor_capacity_cap() {
        let mut acc = Accessor::new(None, true);
        let big = vec![b'x'; CONTROL_BUF_LEN + 100];
        // the writer still sees full success
        assert_eq!(big.len() as u32, acc.write_at(0, &big));
        assert_eq!(CONTROL_BUF_LEN, acc.len());
        // writes entirely past the cap are dropped but still report success
        assert_eq!(4, acc.write_at(CONTROL_BUF_LEN as i64, b"more"));
        assert_eq!(CONTROL_BUF_LEN, acc.len());
    }
}
