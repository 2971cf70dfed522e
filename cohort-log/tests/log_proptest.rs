use cohort_log::{ENTRY_BYTES, Hlc, LogConfig, LogEntry, SegmentStore};
use proptest::prelude::*;
use tempfile::TempDir;

proptest! {
    #[test]
    fn test_entry_record_roundtrip(
        version in any::<i64>(),
        data_len in any::<u64>(),
        data_offset in any::<u64>(),
        real in any::<u64>(),
        logic in any::<u64>(),
    ) {
        let entry = LogEntry {
            version,
            data_len,
            data_offset,
            hlc: Hlc::new(real, logic),
        };
        let mut buf = [0u8; ENTRY_BYTES];
        entry.to_bytes(&mut buf);
        prop_assert_eq!(LogEntry::from_bytes(&buf), entry);
    }

    #[test]
    fn test_appended_payloads_read_back(
        payloads in proptest::collection::vec(
            proptest::collection::vec(any::<u8>(), 0..48),
            1..16,
        )
    ) {
        let dir = TempDir::new().unwrap();
        let store = SegmentStore::open(
            dir.path(),
            LogConfig {
                max_logs: 1,
                segment_bytes: 256,
                address_space_bytes: 16 * 1024,
            },
        )
        .unwrap();
        let log = store.open_log("prop").unwrap();

        for (i, payload) in payloads.iter().enumerate() {
            log.append(payload, i as i64 + 1, Hlc::new(i as u64, 0)).unwrap();
        }
        for (i, payload) in payloads.iter().enumerate() {
            prop_assert_eq!(&log.data_by_index(i as i64).unwrap(), payload);
        }
        prop_assert_eq!(log.length(), payloads.len() as i64);
    }
}
