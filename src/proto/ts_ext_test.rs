use crate::proto::common::TsVbuuid;

fn ts_with(entries: &[(u16, u64, u64)]) -> TsVbuuid {
    let mut ts = TsVbuuid::new("default", "b1", entries.len());
    for &(vbno, seqno, vbuuid) in entries {
        ts.append(vbno, seqno, vbuuid, 0, seqno);
    }
    ts
}

#[test]
fn append_keeps_vbuckets_sorted_and_unique() {
    let mut ts = ts_with(&[(7, 700, 0xA), (2, 200, 0xB), (5, 500, 0xC)]);
    assert_eq!(ts.vbnos, vec![2, 5, 7]);

    // replacing an existing vbucket must not grow the arrays
    ts.append(5, 501, 0xC, 0, 501);
    assert_eq!(ts.len(), 3);
    assert_eq!(ts.entry(5).unwrap().0, 501);
}

#[test]
fn select_and_filter_partition_the_timestamp() {
    let ts = ts_with(&[(0, 1, 0xA), (1, 2, 0xB), (2, 3, 0xC), (3, 4, 0xD)]);

    let selected = ts.select_by_vbuckets(&[1, 3]);
    assert_eq!(selected.vbnos_u16(), vec![1, 3]);

    let filtered = ts.filter_by_vbuckets(&[1, 3]);
    assert_eq!(filtered.vbnos_u16(), vec![0, 2]);

    // select + filter over the same set cover the original exactly
    assert_eq!(selected.len() + filtered.len(), ts.len());
}

#[test]
fn union_prefers_the_argument_entries() {
    let req = ts_with(&[(0, 100, 0xA), (1, 100, 0xA), (2, 100, 0xA)]);
    let restart = ts_with(&[(2, 50, 0xB), (3, 10, 0xB)]);

    let merged = req.union(&restart);
    assert_eq!(merged.vbnos_u16(), vec![0, 1, 2, 3]);
    // vb 2 was restarted at the rollback point
    assert_eq!(merged.entry(2).unwrap(), (50, 0xB, restart.entry(2).unwrap().2));
    assert_eq!(merged.entry(0).unwrap().0, 100);
}

#[test]
fn verify_branch_requires_newest_branch_equality() {
    let ts = ts_with(&[(0, 10, 0xAA), (1, 20, 0xBB)]);

    assert!(ts.verify_branch(&[0, 1, 2], &[0xAA, 0xBB, 0xCC]));
    // stale branch uuid for vb 1
    assert!(!ts.verify_branch(&[0, 1], &[0xAA, 0xB0]));
    // vb 1 is hosted elsewhere and ignored here
    assert!(ts.verify_branch(&[0], &[0xAA]));
}

#[test]
fn as_recent_compares_common_vbuckets() {
    let newer = ts_with(&[(0, 200, 0xA), (1, 300, 0xB)]);
    let older = ts_with(&[(0, 100, 0xA), (1, 300, 0xB)]);

    assert!(newer.as_recent(&older));
    assert!(!older.as_recent(&newer));
    assert!(!ts_with(&[(0, 100, 0xF)]).as_recent(&older)); // branch changed

    let verdicts = older.as_recent_ts(&newer);
    assert_eq!(verdicts, vec![false, true]);
}

#[test]
fn crc64_round_trip_detects_mutation() {
    let mut ts = ts_with(&[(0, 1, 2), (3, 4, 5)]);
    ts.seal_crc64();
    assert!(ts.check_crc64());

    ts.seqnos[0] = 9;
    assert!(!ts.check_crc64());
}

#[test]
fn empty_timestamp_is_trivially_consistent() {
    let ts = TsVbuuid::new("default", "b1", 0);
    assert!(ts.is_empty());
    assert!(ts.verify_branch(&[], &[]));
    assert!(ts.as_recent(&ts));
    assert_eq!(ts.compute_crc64(), ts.compute_crc64());
}
