#![forbid(unsafe_code)]

use ffs_ondisk::{
    BlockGroupItem, BtrfsKey, FIRST_CHUNK_TREE_OBJECTID, FreeSpaceEntry, FreeSpaceInfo,
    FreeSpaceSnapshot,
};
use ffs_types::ParseError;
use std::collections::BTreeMap;
use std::panic::{AssertUnwindSafe, catch_unwind};

#[derive(Debug, Default)]
struct ErrorCoverage {
    insufficient_data: u32,
    invalid_magic: u32,
    invalid_field: u32,
    integer_conversion: u32,
}

impl ErrorCoverage {
    fn observe(&mut self, err: &ParseError) {
        match err {
            ParseError::InsufficientData { .. } => self.insufficient_data += 1,
            ParseError::InvalidMagic { .. } => self.invalid_magic += 1,
            ParseError::InvalidField { .. } => self.invalid_field += 1,
            ParseError::IntegerConversion { .. } => self.integer_conversion += 1,
        }
    }
}

fn valid_items() -> Vec<(&'static str, Vec<u8>)> {
    let snapshot = FreeSpaceSnapshot {
        generation: 42,
        entries: (0..6)
            .map(|i| FreeSpaceEntry {
                offset: (1 << 30) + i * 0x10_0000,
                bytes: 0x8000,
            })
            .collect(),
    };
    vec![
        (
            "block_group",
            BlockGroupItem {
                used: 0x4000,
                chunk_objectid: FIRST_CHUNK_TREE_OBJECTID,
                flags: 1,
            }
            .to_bytes(),
        ),
        (
            "free_space_info",
            FreeSpaceInfo {
                extent_count: 3,
                flags: 0,
            }
            .to_bytes(),
        ),
        ("snapshot", snapshot.to_bytes()),
        ("key", BtrfsKey::block_group(1 << 30, 1 << 30).to_bytes().to_vec()),
    ]
}

/// Deterministic damage: every truncation, single-bit flips at a stride,
/// and a few hostile headers.
fn adversarial_samples() -> Vec<(String, Vec<u8>)> {
    let mut out = Vec::new();
    for (name, bytes) in valid_items() {
        for len in 0..bytes.len() {
            out.push((format!("{name}/truncated-{len}"), bytes[..len].to_vec()));
        }
        for bit in (0..bytes.len() * 8).step_by(7) {
            let mut damaged = bytes.clone();
            damaged[bit / 8] ^= 1 << (bit % 8);
            out.push((format!("{name}/flip-{bit}"), damaged));
        }
    }

    let mut huge = Vec::new();
    huge.extend_from_slice(&1_u64.to_le_bytes());
    huge.extend_from_slice(&u64::MAX.to_le_bytes());
    huge.extend_from_slice(&0_u32.to_le_bytes());
    out.push(("snapshot/huge-count".to_owned(), huge));

    let mut lying = FreeSpaceSnapshot {
        generation: 1,
        entries: Vec::new(),
    }
    .to_bytes();
    lying[8..16].copy_from_slice(&4_u64.to_le_bytes());
    out.push(("snapshot/count-without-body".to_owned(), lying));

    out.push(("empty".to_owned(), Vec::new()));
    out.push(("noise".to_owned(), (0..=255_u8).collect()));
    out
}

fn run_parser<T, F>(
    sample_name: &str,
    parser_name: &'static str,
    parser_hits: &mut BTreeMap<&'static str, u32>,
    coverage: &mut ErrorCoverage,
    parser: F,
) -> bool
where
    F: FnOnce() -> Result<T, ParseError>,
{
    *parser_hits.entry(parser_name).or_default() += 1;
    match catch_unwind(AssertUnwindSafe(parser)) {
        Ok(Ok(_)) => false,
        Ok(Err(err)) => {
            coverage.observe(&err);
            true
        }
        Err(panic_payload) => {
            let _ = panic_payload;
            panic!("parser `{parser_name}` panicked on sample `{sample_name}`");
        }
    }
}

#[test]
fn adversarial_items_are_panic_free_and_rejected() {
    let samples = adversarial_samples();
    assert!(samples.len() >= 100, "only {} samples", samples.len());

    let mut hits = BTreeMap::new();
    let mut coverage = ErrorCoverage::default();
    let mut rejected = 0_u32;

    for (name, data) in &samples {
        for parsed in [
            run_parser(name, "block_group", &mut hits, &mut coverage, || {
                BlockGroupItem::parse(data)
            }),
            run_parser(name, "free_space_info", &mut hits, &mut coverage, || {
                FreeSpaceInfo::parse(data)
            }),
            run_parser(name, "snapshot", &mut hits, &mut coverage, || {
                FreeSpaceSnapshot::parse(data)
            }),
            run_parser(name, "key", &mut hits, &mut coverage, || {
                BtrfsKey::parse(data, 0)
            }),
        ] {
            rejected += u32::from(parsed);
        }
    }

    assert_eq!(hits.len(), 4);
    assert!(hits.values().all(|&n| n as usize == samples.len()));
    assert!(rejected > 0);
    assert!(coverage.insufficient_data > 0, "{coverage:?}");
    assert!(coverage.invalid_field > 0, "{coverage:?}");
}

#[test]
fn damaged_snapshots_never_decode_to_different_entries() {
    let original = FreeSpaceSnapshot::parse(&valid_items()[2].1).unwrap();
    for (name, data) in adversarial_samples() {
        if !name.starts_with("snapshot/flip-") {
            continue;
        }
        if let Ok(decoded) = FreeSpaceSnapshot::parse(&data) {
            // Only header bits outside the checksum can flip undetected.
            assert_eq!(decoded.entries, original.entries, "{name}");
        }
    }
}
