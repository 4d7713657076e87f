//! The fault model: descriptors, path matching, buffer corruption, and the
//! ordered fault set that the control channel swaps atomically.

use rand::rngs::SmallRng;
use rand::Rng;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Errors produced while parsing or validating a fault document.
#[derive(Debug, Error)]
pub enum FaultError {
    #[error("invalid fault JSON: {0}")]
    Json(#[from] serde_json::Error),
    #[error("invalid fault: {0}")]
    Invalid(String),
}

/// The class of I/O operation a fault applies to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpType {
    Read,
    Write,
}

/// Buffer corruption strategies.
///
/// The wire representation is the numeric code the control JSON uses.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "i32", into = "i32")]
pub enum CorruptMode {
    /// Replace bytes at random positions with zero bytes.
    Zero,
    /// Replace bytes at random positions with random byte values.
    Rand,
    /// Replace sequential bytes at the end of the buffer with zero bytes.
    ZeroSeq,
    /// Replace sequential bytes at the end of the buffer with random bytes.
    RandSeq,
    /// Silently drop bytes at the end of the buffer.
    Drop,
}

pub const CORRUPT_ZERO: i32 = 1000;
pub const CORRUPT_RAND: i32 = 1001;
pub const CORRUPT_ZERO_SEQ: i32 = 1100;
pub const CORRUPT_RAND_SEQ: i32 = 1101;
pub const CORRUPT_DROP: i32 = 1200;

impl TryFrom<i32> for CorruptMode {
    type Error = String;

    fn try_from(code: i32) -> Result<Self, String> {
        match code {
            CORRUPT_ZERO => Ok(CorruptMode::Zero),
            CORRUPT_RAND => Ok(CorruptMode::Rand),
            CORRUPT_ZERO_SEQ => Ok(CorruptMode::ZeroSeq),
            CORRUPT_RAND_SEQ => Ok(CorruptMode::RandSeq),
            CORRUPT_DROP => Ok(CorruptMode::Drop),
            other => Err(format!("unknown corruption mode {other}")),
        }
    }
}

impl From<CorruptMode> for i32 {
    fn from(mode: CorruptMode) -> i32 {
        match mode {
            CorruptMode::Zero => CORRUPT_ZERO,
            CorruptMode::Rand => CORRUPT_RAND,
            CorruptMode::ZeroSeq => CORRUPT_ZERO_SEQ,
            CorruptMode::RandSeq => CORRUPT_RAND_SEQ,
            CorruptMode::Drop => CORRUPT_DROP,
        }
    }
}

/// Corrupt `buf` in place and return the number of bytes the caller should
/// deliver. Only [`CorruptMode::Drop`] shortens the buffer.
///
/// The cut position for the sequential modes is `(1 - fraction) * len`, so a
/// fraction of 1.0 affects the whole buffer and 0.0 leaves it alone.
pub fn corrupt_buffer(buf: &mut [u8], mode: CorruptMode, fraction: f64, rng: &mut SmallRng) -> usize {
    let len = buf.len();
    let pos = (((1.0 - fraction) * len as f64) as usize).min(len);
    match mode {
        CorruptMode::Zero => {
            for byte in buf.iter_mut() {
                if rng.gen::<f64>() <= fraction {
                    *byte = 0;
                }
            }
            len
        }
        CorruptMode::Rand => {
            for byte in buf.iter_mut() {
                if rng.gen::<f64>() <= fraction {
                    *byte = rng.gen();
                }
            }
            len
        }
        CorruptMode::ZeroSeq => {
            for byte in &mut buf[pos..] {
                *byte = 0;
            }
            len
        }
        CorruptMode::RandSeq => {
            rng.fill(&mut buf[pos..]);
            len
        }
        CorruptMode::Drop => pos,
    }
}

fn default_prefix() -> String {
    "/".to_string()
}

/// A single fault rule. Matching is byte-wise on the mounted path captured at
/// open time; delays and corruption additionally sample their `fraction` at
/// match time.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum FaultKind {
    /// Fail reads with an error code.
    Unreadable {
        #[serde(default = "default_prefix")]
        prefix: String,
        #[serde(default)]
        suffix: String,
        code: i32,
    },
    /// Fail writes with an error code.
    Unwritable {
        #[serde(default = "default_prefix")]
        prefix: String,
        #[serde(default)]
        suffix: String,
        code: i32,
    },
    /// Delay a fraction of reads.
    ReadDelay {
        #[serde(default = "default_prefix")]
        prefix: String,
        #[serde(default)]
        suffix: String,
        delay_ms: u32,
        fraction: f64,
    },
    /// Delay a fraction of writes.
    WriteDelay {
        #[serde(default = "default_prefix")]
        prefix: String,
        #[serde(default)]
        suffix: String,
        delay_ms: u32,
        fraction: f64,
    },
    /// Corrupt read buffers. A non-negative `count` decays to `Drop` at
    /// fraction 1.0 once it reaches zero.
    ReadCorrupt {
        #[serde(default = "default_prefix")]
        prefix: String,
        #[serde(default)]
        suffix: String,
        mode: CorruptMode,
        count: i32,
        fraction: f64,
    },
    /// Corrupt write buffers, with the same decay rule as `ReadCorrupt`.
    WriteCorrupt {
        #[serde(default = "default_prefix")]
        prefix: String,
        #[serde(default)]
        suffix: String,
        mode: CorruptMode,
        count: i32,
        fraction: f64,
    },
}

/// What a matched fault did to a read. Delays are returned to the caller
/// rather than slept here so the sleep can happen outside the fault-set lock.
#[derive(Debug, PartialEq, Eq)]
pub enum ReadFault {
    /// Return this negative error code instead of any data.
    Error(i32),
    /// Sleep this many milliseconds after the backing read, then deliver
    /// the data unchanged.
    Delay(u32),
    /// The buffer was corrupted in place; deliver this many bytes of it.
    Corrupted(usize),
}

/// What a matched fault did to a write.
#[derive(Debug, PartialEq, Eq)]
pub enum WriteFault {
    /// Fail the write with this negative error code; the backing file must
    /// not be touched.
    Error(i32),
    /// Sleep this many milliseconds before the backing write, then write the
    /// caller's data unchanged.
    Delay(u32),
    /// Write `data` instead of the caller's buffer. `data` may be shorter
    /// than the original when bytes are being dropped.
    Corrupted(Vec<u8>),
}

impl FaultKind {
    /// The operation class this fault applies to.
    pub fn op_type(&self) -> OpType {
        match self {
            FaultKind::Unreadable { .. }
            | FaultKind::ReadDelay { .. }
            | FaultKind::ReadCorrupt { .. } => OpType::Read,
            FaultKind::Unwritable { .. }
            | FaultKind::WriteDelay { .. }
            | FaultKind::WriteCorrupt { .. } => OpType::Write,
        }
    }

    /// The JSON type tag for this fault.
    pub fn type_name(&self) -> &'static str {
        match self {
            FaultKind::Unreadable { .. } => "unreadable",
            FaultKind::Unwritable { .. } => "unwritable",
            FaultKind::ReadDelay { .. } => "read_delay",
            FaultKind::WriteDelay { .. } => "write_delay",
            FaultKind::ReadCorrupt { .. } => "read_corrupt",
            FaultKind::WriteCorrupt { .. } => "write_corrupt",
        }
    }

    pub fn prefix(&self) -> &str {
        match self {
            FaultKind::Unreadable { prefix, .. }
            | FaultKind::Unwritable { prefix, .. }
            | FaultKind::ReadDelay { prefix, .. }
            | FaultKind::WriteDelay { prefix, .. }
            | FaultKind::ReadCorrupt { prefix, .. }
            | FaultKind::WriteCorrupt { prefix, .. } => prefix,
        }
    }

    pub fn suffix(&self) -> &str {
        match self {
            FaultKind::Unreadable { suffix, .. }
            | FaultKind::Unwritable { suffix, .. }
            | FaultKind::ReadDelay { suffix, .. }
            | FaultKind::WriteDelay { suffix, .. }
            | FaultKind::ReadCorrupt { suffix, .. }
            | FaultKind::WriteCorrupt { suffix, .. } => suffix,
        }
    }

    fn fraction(&self) -> Option<f64> {
        match self {
            FaultKind::Unreadable { .. } | FaultKind::Unwritable { .. } => None,
            FaultKind::ReadDelay { fraction, .. }
            | FaultKind::WriteDelay { fraction, .. }
            | FaultKind::ReadCorrupt { fraction, .. }
            | FaultKind::WriteCorrupt { fraction, .. } => Some(*fraction),
        }
    }

    /// Reject out-of-range fields that the serde layer cannot express.
    pub fn validate(&self) -> Result<(), FaultError> {
        if let Some(fraction) = self.fraction() {
            if !(0.0..=1.0).contains(&fraction) {
                return Err(FaultError::Invalid(format!(
                    "{}: fraction {} is outside [0.0, 1.0]",
                    self.type_name(),
                    fraction
                )));
            }
        }
        if let FaultKind::Unreadable { code, .. } | FaultKind::Unwritable { code, .. } = self {
            if *code == 0 {
                return Err(FaultError::Invalid(format!(
                    "{}: error code must be non-zero",
                    self.type_name()
                )));
            }
        }
        Ok(())
    }

    /// Whether this fault fires for `(path, op)`. Delay and corruption faults
    /// also draw a sample here and fire with probability `fraction`.
    pub fn matches(&self, path: &[u8], op: OpType, rng: &mut SmallRng) -> bool {
        if self.op_type() != op {
            return false;
        }
        if !path.starts_with(self.prefix().as_bytes()) {
            return false;
        }
        if !path.ends_with(self.suffix().as_bytes()) {
            return false;
        }
        match self.fraction() {
            None => true,
            Some(fraction) => rng.gen::<f64>() <= fraction,
        }
    }

    /// Apply a matched fault to a completed backing read of `buf.len()` bytes.
    ///
    /// Must run under the fault-set lock: corruption decays `count` in place.
    pub fn apply_read(&mut self, buf: &mut [u8], rng: &mut SmallRng) -> ReadFault {
        match self {
            FaultKind::Unreadable { code, .. } => ReadFault::Error(-code.abs()),
            FaultKind::ReadDelay { delay_ms, .. } => ReadFault::Delay(*delay_ms),
            FaultKind::ReadCorrupt {
                mode,
                count,
                fraction,
                ..
            } => {
                let delivered = corrupt_buffer(buf, *mode, *fraction, rng);
                decay(count, mode, fraction);
                ReadFault::Corrupted(delivered)
            }
            // Write faults never match a read.
            FaultKind::Unwritable { .. }
            | FaultKind::WriteDelay { .. }
            | FaultKind::WriteCorrupt { .. } => ReadFault::Delay(0),
        }
    }

    /// Apply a matched fault to a pending write of `data`. The caller's
    /// buffer is never mutated; corruption operates on a scratch copy.
    ///
    /// Must run under the fault-set lock: corruption decays `count` in place.
    pub fn apply_write(&mut self, data: &[u8], rng: &mut SmallRng) -> WriteFault {
        match self {
            FaultKind::Unwritable { code, .. } => WriteFault::Error(-code.abs()),
            FaultKind::WriteDelay { delay_ms, .. } => WriteFault::Delay(*delay_ms),
            FaultKind::WriteCorrupt {
                mode,
                count,
                fraction,
                ..
            } => {
                let mut scratch = data.to_vec();
                let len = corrupt_buffer(&mut scratch, *mode, *fraction, rng);
                scratch.truncate(len);
                decay(count, mode, fraction);
                WriteFault::Corrupted(scratch)
            }
            FaultKind::Unreadable { .. }
            | FaultKind::ReadDelay { .. }
            | FaultKind::ReadCorrupt { .. } => WriteFault::Delay(0),
        }
    }
}

/// Count down one corruption injection. Once the count hits zero the fault
/// permanently degenerates into "drop everything". Negative counts never
/// decay.
fn decay(count: &mut i32, mode: &mut CorruptMode, fraction: &mut f64) {
    if *count > 0 {
        *count -= 1;
        if *count == 0 {
            *mode = CorruptMode::Drop;
            *fraction = 1.0;
        }
    }
}

/// An ordered set of faults. Lookup returns the first match, so earlier
/// entries shadow later ones.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FaultSet {
    #[serde(default)]
    faults: Vec<FaultKind>,
}

impl FaultSet {
    pub fn new(faults: Vec<FaultKind>) -> FaultSet {
        FaultSet { faults }
    }

    /// Parse a control document. A document without a `"faults"` key is the
    /// empty set; any unparsable element rejects the whole document.
    pub fn parse(text: &str) -> Result<FaultSet, FaultError> {
        let set: FaultSet = serde_json::from_str(text)?;
        for fault in &set.faults {
            fault.validate()?;
        }
        Ok(set)
    }

    /// Render the canonical `{"faults":[...]}` document.
    pub fn unparse(&self) -> String {
        serde_json::to_string(self).expect("fault sets always serialize")
    }

    pub fn is_empty(&self) -> bool {
        self.faults.is_empty()
    }

    pub fn len(&self) -> usize {
        self.faults.len()
    }

    pub fn iter(&self) -> impl Iterator<Item = &FaultKind> {
        self.faults.iter()
    }

    /// Find the first fault that fires for `(path, op)`.
    pub fn first_match_mut(
        &mut self,
        path: &[u8],
        op: OpType,
        rng: &mut SmallRng,
    ) -> Option<&mut FaultKind> {
        self.faults
            .iter_mut()
            .find(|fault| fault.matches(path, op, rng))
    }
}
