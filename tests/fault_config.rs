//! End-to-end behavior of the fault model and the control channel, exercised
//! through the public library API against real files.

use std::fs;
use std::fs::File;
use std::io::Read;

use kibosh::control::{Accessor, CommitOutcome, ControlState};
use kibosh::fault::{CorruptMode, FaultKind, FaultSet, ReadFault, WriteFault};

fn state() -> ControlState {
    ControlState::new(Some(12345))
}

#[test]
fn unreadable_fault_hits_by_suffix() {
    let mut state = state();
    let doc = "{\"faults\":[{\"type\":\"unreadable\",\"prefix\":\"/\",\"suffix\":\".log\",\
               \"code\":5}]}";
    assert!(matches!(state.commit(doc.as_bytes()), CommitOutcome::Applied));

    let mut buf = [0u8; 16];
    // an empty file still sees the injected error
    assert_eq!(
        Some(ReadFault::Error(-5)),
        state.read_fault(b"/b.log", &mut buf[..0])
    );
    assert_eq!(None, state.read_fault(b"/b.txt", &mut buf));
    // write path is unaffected by a read fault
    assert_eq!(None, state.write_fault(b"/b.log", &buf));
}

#[test]
fn read_delay_returns_configured_sleep() {
    let mut state = state();
    let doc = "{\"faults\":[{\"type\":\"read_delay\",\"prefix\":\"/\",\"suffix\":\"\",\
               \"delay_ms\":100,\"fraction\":1.0}]}";
    assert!(matches!(state.commit(doc.as_bytes()), CommitOutcome::Applied));
    let mut buf = [0u8; 4];
    for _ in 0..10 {
        assert_eq!(
            Some(ReadFault::Delay(100)),
            state.read_fault(b"/any", &mut buf)
        );
    }
}

#[test]
fn drop_decay_over_real_reads() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("a");
    fs::write(&path, vec![b'A'; 1024]).unwrap();

    let mut state = state();
    let set = FaultSet::new(vec![FaultKind::ReadCorrupt {
        prefix: "/".to_string(),
        suffix: String::new(),
        mode: CorruptMode::Drop,
        count: 2,
        fraction: 0.5,
    }]);
    assert!(matches!(
        state.commit(set.unparse().as_bytes()),
        CommitOutcome::Applied
    ));

    let mut delivered = Vec::new();
    for _ in 0..3 {
        let mut buf = vec![0u8; 1024];
        let mut file = File::open(&path).unwrap();
        file.read_exact(&mut buf).unwrap();
        let n = match state.read_fault(b"/a", &mut buf) {
            // not every read matches at fraction 0.5
            None => 1024,
            Some(ReadFault::Corrupted(n)) => n,
            other => panic!("unexpected fault outcome {other:?}"),
        };
        assert!(n <= 1024);
        assert!(buf[..n].iter().all(|&b| b == b'A'));
        delivered.push(n);
    }

    // exhaust any remaining configured injections, then the decayed fault
    // drops everything, deterministically
    let mut buf = vec![b'A'; 1024];
    while !matches!(
        state.read_fault(b"/a", &mut buf),
        Some(ReadFault::Corrupted(0))
    ) {}
    for _ in 0..5 {
        assert_eq!(
            Some(ReadFault::Corrupted(0)),
            state.read_fault(b"/a", &mut buf)
        );
    }
}

#[test]
fn write_corruption_spares_the_source_buffer() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("out");

    let mut state = state();
    let doc = "{\"faults\":[{\"type\":\"write_corrupt\",\"prefix\":\"/\",\"suffix\":\"\",\
               \"mode\":1100,\"count\":-1,\"fraction\":1.0}]}";
    assert!(matches!(state.commit(doc.as_bytes()), CommitOutcome::Applied));

    let data = vec![b'Z'; 256];
    let original = data.clone();
    match state.write_fault(b"/out", &data) {
        Some(WriteFault::Corrupted(scratch)) => {
            fs::write(&path, &scratch).unwrap();
        }
        other => panic!("unexpected fault outcome {other:?}"),
    }
    // the caller's buffer is untouched; the file holds the corrupted copy
    assert_eq!(original, data);
    assert_eq!(vec![0u8; 256], fs::read(&path).unwrap());
}

#[test]
fn commit_is_idempotent() {
    let mut state = state();
    let doc = "{\"faults\":[{\"type\":\"unwritable\",\"prefix\":\"/x\",\"suffix\":\"\",\
               \"code\":13}]}";
    assert!(matches!(state.commit(doc.as_bytes()), CommitOutcome::Applied));

    // read the current document through an accessor and write it back
    let mut acc = Accessor::new(Some(state.snapshot()), true);
    let contents = acc.read_at(0, 1 << 16).to_vec();
    acc.write_at(0, &contents);
    assert!(matches!(
        state.commit(acc.contents()),
        CommitOutcome::Unchanged
    ));
    assert_eq!(doc, state.current_json());
}

#[test]
fn rejected_commit_leaves_configuration_alone() {
    let mut state = state();
    let doc = "{\"faults\":[{\"type\":\"unreadable\",\"prefix\":\"/\",\"suffix\":\"\",\
               \"code\":5}]}";
    assert!(matches!(state.commit(doc.as_bytes()), CommitOutcome::Applied));

    let mut acc = Accessor::new(None, true);
    acc.write_at(0, b"not json");
    assert!(matches!(
        state.commit(acc.contents()),
        CommitOutcome::Rejected(_)
    ));
    // the next read-open still sees the last good document
    assert_eq!(doc.as_bytes(), state.snapshot().as_slice());
    let mut buf = [0u8; 1];
    assert_eq!(
        Some(ReadFault::Error(-5)),
        state.read_fault(b"/anything", &mut buf)
    );
}

#[test]
fn first_match_shadows_later_faults() {
    let mut state = state();
    let doc = "{\"faults\":[\
               {\"type\":\"unreadable\",\"prefix\":\"/data\",\"suffix\":\"\",\"code\":5},\
               {\"type\":\"unreadable\",\"prefix\":\"/data/hot\",\"suffix\":\"\",\"code\":7}]}";
    assert!(matches!(state.commit(doc.as_bytes()), CommitOutcome::Applied));
    let mut buf = [0u8; 1];
    assert_eq!(
        Some(ReadFault::Error(-5)),
        state.read_fault(b"/data/hot/f", &mut buf)
    );
}

#[test]
fn round_trip_survives_defaulting() {
    let doc = "{\"faults\":[{\"type\":\"read_corrupt\",\"mode\":1001,\"count\":3,\
               \"fraction\":0.5}]}";
    let set = FaultSet::parse(doc).unwrap();
    let fault = set.iter().next().unwrap();
    assert_eq!("/", fault.prefix());
    assert_eq!("", fault.suffix());
    assert_eq!(set, FaultSet::parse(&set.unparse()).unwrap());
}
