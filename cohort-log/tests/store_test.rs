use cohort_log::{Hlc, LogConfig, LogError, SegmentStore};
use tempfile::TempDir;

fn small_config() -> LogConfig {
    LogConfig {
        max_logs: 2,
        segment_bytes: 256,
        address_space_bytes: 8 * 1024,
    }
}

#[test]
fn test_reopen_recovers_persisted_state() {
    let dir = TempDir::new().unwrap();
    {
        let store = SegmentStore::open(dir.path(), small_config()).unwrap();
        let log = store.open_log("journal").unwrap();
        log.append(b"first", 1, Hlc::new(10, 0)).unwrap();
        log.append(b"second", 2, Hlc::new(10, 1)).unwrap();
        log.persist().unwrap();
    }

    let store = SegmentStore::open(dir.path(), small_config()).unwrap();
    assert!(store.contains_log("journal"));
    let log = store.open_log("journal").unwrap();
    assert_eq!(log.length(), 2);
    assert_eq!(log.latest_version(), 2);
    assert_eq!(log.last_persisted(), 2);
    assert_eq!(log.data_by_index(0).unwrap(), b"first");
    assert_eq!(log.data_by_index(1).unwrap(), b"second");

    // The recovered hlc watermark still guards appends.
    assert!(matches!(
        log.append(b"late", 3, Hlc::new(9, 0)),
        Err(LogError::HlcOrder { .. })
    ));
    log.append(b"third", 3, Hlc::new(10, 1)).unwrap();
}

#[test]
fn test_unpersisted_appends_roll_back_on_reopen() {
    let dir = TempDir::new().unwrap();
    {
        let store = SegmentStore::open(dir.path(), small_config()).unwrap();
        let log = store.open_log("journal").unwrap();
        log.append(b"durable", 1, Hlc::new(1, 0)).unwrap();
        log.persist().unwrap();
        log.append(b"volatile", 2, Hlc::new(2, 0)).unwrap();
        // No persist: the second entry must not survive reopen.
    }

    let store = SegmentStore::open(dir.path(), small_config()).unwrap();
    let log = store.open_log("journal").unwrap();
    assert_eq!(log.length(), 1);
    assert_eq!(log.latest_version(), 1);
}

#[test]
fn test_config_mismatch_is_refused() {
    let dir = TempDir::new().unwrap();
    SegmentStore::open(dir.path(), small_config()).unwrap();

    let mut other = small_config();
    other.segment_bytes = 512;
    assert!(matches!(
        SegmentStore::open(dir.path(), other),
        Err(LogError::ConfigMismatch)
    ));
}

#[test]
fn test_log_limit_is_enforced() {
    let dir = TempDir::new().unwrap();
    let store = SegmentStore::open(dir.path(), small_config()).unwrap();

    store.open_log("one").unwrap();
    store.open_log("two").unwrap();
    assert!(matches!(
        store.open_log("three"),
        Err(LogError::TooManyLogs)
    ));

    // Reopening an existing name is not a new log.
    store.open_log("one").unwrap();
    assert_eq!(store.log_names(), vec!["one", "two"]);
}

#[test]
fn test_name_length_is_bounded() {
    let dir = TempDir::new().unwrap();
    let store = SegmentStore::open(dir.path(), small_config()).unwrap();

    let long = "x".repeat(cohort_log::MAX_NAME_BYTES + 1);
    assert!(matches!(store.open_log(&long), Err(LogError::NameTooLong)));

    let exact = "y".repeat(cohort_log::MAX_NAME_BYTES);
    store.open_log(&exact).unwrap();
}

#[test]
fn test_store_full_when_address_space_exhausted() {
    let dir = TempDir::new().unwrap();
    let config = LogConfig {
        max_logs: 2,
        segment_bytes: 64,
        address_space_bytes: 256,
    };
    let store = SegmentStore::open(dir.path(), config).unwrap();
    let log = store.open_log("tiny").unwrap();

    // The entry half holds two 64-byte records; the third append overflows.
    log.append(b"a", 1, Hlc::new(1, 0)).unwrap();
    log.append(b"b", 2, Hlc::new(2, 0)).unwrap();
    assert!(matches!(
        log.append(b"c", 3, Hlc::new(3, 0)),
        Err(LogError::StoreFull)
    ));
}

#[test]
fn test_logs_are_isolated() {
    let dir = TempDir::new().unwrap();
    let store = SegmentStore::open(dir.path(), small_config()).unwrap();
    let left = store.open_log("left").unwrap();
    let right = store.open_log("right").unwrap();

    left.append(b"LLLL", 1, Hlc::new(1, 0)).unwrap();
    right.append(b"RR", 10, Hlc::new(1, 0)).unwrap();
    left.append(b"L2", 2, Hlc::new(2, 0)).unwrap();

    assert_eq!(left.data_by_index(0).unwrap(), b"LLLL");
    assert_eq!(left.data_by_index(1).unwrap(), b"L2");
    assert_eq!(right.data_by_index(0).unwrap(), b"RR");
    assert_eq!(left.latest_version(), 2);
    assert_eq!(right.latest_version(), 10);
}
