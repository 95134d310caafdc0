#![forbid(unsafe_code)]

use ffs_types::{ParseError, ensure_slice, put_le_u32, put_le_u64, read_le_u32, read_le_u64, read_u8};
use serde::{Deserialize, Serialize};

/// Size of a disk key (objectid:u64 + type:u8 + offset:u64).
pub const DISK_KEY_SIZE: usize = 17;
/// Size of a block group item (used:u64 + chunk_objectid:u64 + flags:u64).
pub const BLOCK_GROUP_ITEM_SIZE: usize = 24;
/// Free-space snapshot header: generation:u64 + num_entries:u64 + crc32c:u32.
const SNAPSHOT_HEADER_SIZE: usize = 20;
/// One snapshot entry: offset:u64 + bytes:u64 + kind:u8.
const SNAPSHOT_ENTRY_SIZE: usize = 17;
/// Free-space info item: extent_count:u32 + flags:u32.
pub const FREE_SPACE_INFO_SIZE: usize = 8;

pub const EXTENT_ITEM_KEY: u8 = 168;
pub const METADATA_ITEM_KEY: u8 = 169;
pub const BLOCK_GROUP_ITEM_KEY: u8 = 192;
pub const FREE_SPACE_INFO_KEY: u8 = 198;
pub const FREE_SPACE_EXTENT_KEY: u8 = 199;

/// Objectid of free-space snapshot headers (-11 as u64).
pub const FREE_SPACE_OBJECTID: u64 = u64::MAX - 10;
/// Objectid every chunk item lives under.
pub const FIRST_CHUNK_TREE_OBJECTID: u64 = 256;

const SNAPSHOT_ENTRY_EXTENT: u8 = 1;

/// Item key. Field order gives the persisted sort order: objectid, then
/// type, then offset.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct BtrfsKey {
    pub objectid: u64,
    pub item_type: u8,
    pub offset: u64,
}

impl BtrfsKey {
    #[must_use]
    pub const fn new(objectid: u64, item_type: u8, offset: u64) -> Self {
        Self {
            objectid,
            item_type,
            offset,
        }
    }

    /// Key of the block group item for `[start, start + length)`.
    #[must_use]
    pub const fn block_group(start: u64, length: u64) -> Self {
        Self::new(start, BLOCK_GROUP_ITEM_KEY, length)
    }

    /// Key of the persisted free-space snapshot for the group at `start`.
    #[must_use]
    pub const fn free_space_header(start: u64) -> Self {
        Self::new(FREE_SPACE_OBJECTID, 0, start)
    }

    #[must_use]
    pub const fn extent(start: u64, length: u64) -> Self {
        Self::new(start, EXTENT_ITEM_KEY, length)
    }

    /// Skinny metadata extent; `offset` carries the tree level, not a length.
    #[must_use]
    pub const fn metadata(start: u64, level: u64) -> Self {
        Self::new(start, METADATA_ITEM_KEY, level)
    }

    #[must_use]
    pub const fn free_space_info(start: u64, length: u64) -> Self {
        Self::new(start, FREE_SPACE_INFO_KEY, length)
    }

    #[must_use]
    pub const fn free_space_extent(start: u64, length: u64) -> Self {
        Self::new(start, FREE_SPACE_EXTENT_KEY, length)
    }

    /// Smallest key strictly greater than `self`, or `None` at the end of
    /// the key space.
    #[must_use]
    pub fn successor(self) -> Option<Self> {
        if let Some(offset) = self.offset.checked_add(1) {
            return Some(Self { offset, ..self });
        }
        if let Some(item_type) = self.item_type.checked_add(1) {
            return Some(Self::new(self.objectid, item_type, 0));
        }
        self.objectid.checked_add(1).map(|objectid| Self::new(objectid, 0, 0))
    }

    pub fn parse(data: &[u8], offset: usize) -> Result<Self, ParseError> {
        Ok(Self {
            objectid: read_le_u64(data, offset)?,
            item_type: read_u8(data, offset + 8)?,
            offset: read_le_u64(data, offset + 9)?,
        })
    }

    #[must_use]
    pub fn to_bytes(&self) -> [u8; DISK_KEY_SIZE] {
        let mut out = [0_u8; DISK_KEY_SIZE];
        out[0..8].copy_from_slice(&self.objectid.to_le_bytes());
        out[8] = self.item_type;
        out[9..17].copy_from_slice(&self.offset.to_le_bytes());
        out
    }
}

// ── Block group item ────────────────────────────────────────────────────────

/// Persisted record of one block group. Start and length live in the key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockGroupItem {
    pub used: u64,
    pub chunk_objectid: u64,
    pub flags: u64,
}

impl BlockGroupItem {
    pub fn parse(data: &[u8]) -> Result<Self, ParseError> {
        ensure_slice(data, 0, BLOCK_GROUP_ITEM_SIZE)?;
        let item = Self {
            used: read_le_u64(data, 0)?,
            chunk_objectid: read_le_u64(data, 8)?,
            flags: read_le_u64(data, 16)?,
        };
        if item.chunk_objectid != FIRST_CHUNK_TREE_OBJECTID {
            return Err(ParseError::InvalidField {
                field: "chunk_objectid",
                reason: "must be the first chunk tree objectid",
            });
        }
        Ok(item)
    }

    #[must_use]
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(BLOCK_GROUP_ITEM_SIZE);
        put_le_u64(&mut out, self.used);
        put_le_u64(&mut out, self.chunk_objectid);
        put_le_u64(&mut out, self.flags);
        out
    }
}

// ── Free-space tree info item ───────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct FreeSpaceInfo {
    pub extent_count: u32,
    pub flags: u32,
}

impl FreeSpaceInfo {
    pub fn parse(data: &[u8]) -> Result<Self, ParseError> {
        Ok(Self {
            extent_count: read_le_u32(data, 0)?,
            flags: read_le_u32(data, 4)?,
        })
    }

    #[must_use]
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(FREE_SPACE_INFO_SIZE);
        put_le_u32(&mut out, self.extent_count);
        put_le_u32(&mut out, self.flags);
        out
    }
}

// ── Free-space snapshot ─────────────────────────────────────────────────────

/// One free range recorded in a snapshot, in absolute logical bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct FreeSpaceEntry {
    pub offset: u64,
    pub bytes: u64,
}

/// Persisted copy of a group's free-space index, stamped with the
/// generation of the transaction that wrote it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FreeSpaceSnapshot {
    pub generation: u64,
    pub entries: Vec<FreeSpaceEntry>,
}

impl FreeSpaceSnapshot {
    /// Sum of all recorded free bytes.
    #[must_use]
    pub fn free_bytes(&self) -> u64 {
        self.entries.iter().map(|e| e.bytes).sum()
    }

    /// Decode a snapshot, verifying the entry checksum.
    pub fn parse(data: &[u8]) -> Result<Self, ParseError> {
        let generation = read_le_u64(data, 0)?;
        let num_entries = read_le_u64(data, 8)?;
        let expected_crc = read_le_u32(data, 16)?;

        let count = usize::try_from(num_entries).map_err(|_| ParseError::IntegerConversion {
            field: "num_entries",
        })?;
        let body_len = count
            .checked_mul(SNAPSHOT_ENTRY_SIZE)
            .ok_or(ParseError::InvalidField {
                field: "num_entries",
                reason: "overflow",
            })?;
        let body = ensure_slice(data, SNAPSHOT_HEADER_SIZE, body_len)?;
        if crc32c::crc32c(body) != expected_crc {
            return Err(ParseError::InvalidField {
                field: "crc32c",
                reason: "snapshot checksum mismatch",
            });
        }

        let mut entries = Vec::with_capacity(count);
        for i in 0..count {
            let at = i * SNAPSHOT_ENTRY_SIZE;
            if read_u8(body, at + 16)? != SNAPSHOT_ENTRY_EXTENT {
                return Err(ParseError::InvalidField {
                    field: "entry_type",
                    reason: "unknown snapshot entry type",
                });
            }
            entries.push(FreeSpaceEntry {
                offset: read_le_u64(body, at)?,
                bytes: read_le_u64(body, at + 8)?,
            });
        }
        Ok(Self {
            generation,
            entries,
        })
    }

    #[must_use]
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut body = Vec::with_capacity(self.entries.len() * SNAPSHOT_ENTRY_SIZE);
        for entry in &self.entries {
            put_le_u64(&mut body, entry.offset);
            put_le_u64(&mut body, entry.bytes);
            body.push(SNAPSHOT_ENTRY_EXTENT);
        }
        let mut out = Vec::with_capacity(SNAPSHOT_HEADER_SIZE + body.len());
        put_le_u64(&mut out, self.generation);
        put_le_u64(&mut out, self.entries.len() as u64);
        put_le_u32(&mut out, crc32c::crc32c(&body));
        out.extend_from_slice(&body);
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn key_order_is_objectid_type_offset() {
        let a = BtrfsKey::new(10, EXTENT_ITEM_KEY, 500);
        let b = BtrfsKey::new(10, BLOCK_GROUP_ITEM_KEY, 1);
        let c = BtrfsKey::new(11, 0, 0);
        assert!(a < b);
        assert!(b < c);
        assert!(BtrfsKey::extent(10, 4096) < BtrfsKey::metadata(10, 0));
    }

    #[test]
    fn key_successor_carries() {
        let k = BtrfsKey::new(1, 2, 3);
        assert_eq!(k.successor(), Some(BtrfsKey::new(1, 2, 4)));
        let k = BtrfsKey::new(1, 2, u64::MAX);
        assert_eq!(k.successor(), Some(BtrfsKey::new(1, 3, 0)));
        let k = BtrfsKey::new(1, u8::MAX, u64::MAX);
        assert_eq!(k.successor(), Some(BtrfsKey::new(2, 0, 0)));
        let k = BtrfsKey::new(u64::MAX, u8::MAX, u64::MAX);
        assert_eq!(k.successor(), None);
    }

    #[test]
    fn key_disk_encoding() {
        let k = BtrfsKey::block_group(1 << 30, 1 << 30);
        let bytes = k.to_bytes();
        assert_eq!(bytes[8], BLOCK_GROUP_ITEM_KEY);
        assert_eq!(BtrfsKey::parse(&bytes, 0).unwrap(), k);
        assert!(matches!(
            BtrfsKey::parse(&bytes[..16], 0),
            Err(ParseError::InsufficientData { .. })
        ));
    }

    #[test]
    fn block_group_item_layout() {
        let item = BlockGroupItem {
            used: 4096,
            chunk_objectid: FIRST_CHUNK_TREE_OBJECTID,
            flags: 1,
        };
        let bytes = item.to_bytes();
        assert_eq!(bytes.len(), BLOCK_GROUP_ITEM_SIZE);
        assert_eq!(&bytes[0..8], &4096_u64.to_le_bytes());
        assert_eq!(BlockGroupItem::parse(&bytes).unwrap(), item);
    }

    #[test]
    fn block_group_item_rejects_foreign_chunk_objectid() {
        let mut bytes = BlockGroupItem {
            used: 0,
            chunk_objectid: FIRST_CHUNK_TREE_OBJECTID,
            flags: 4,
        }
        .to_bytes();
        bytes[8] = 7;
        assert!(matches!(
            BlockGroupItem::parse(&bytes),
            Err(ParseError::InvalidField {
                field: "chunk_objectid",
                ..
            })
        ));
        assert!(BlockGroupItem::parse(&bytes[..20]).is_err());
    }

    #[test]
    fn snapshot_detects_checksum_damage() {
        let snap = FreeSpaceSnapshot {
            generation: 7,
            entries: vec![
                FreeSpaceEntry {
                    offset: 1 << 20,
                    bytes: 8192,
                },
                FreeSpaceEntry {
                    offset: 2 << 20,
                    bytes: 4096,
                },
            ],
        };
        let mut bytes = snap.to_bytes();
        assert_eq!(FreeSpaceSnapshot::parse(&bytes).unwrap(), snap);
        assert_eq!(snap.free_bytes(), 12288);

        let last = bytes.len() - 2;
        bytes[last] ^= 0xFF;
        assert!(matches!(
            FreeSpaceSnapshot::parse(&bytes),
            Err(ParseError::InvalidField { field: "crc32c", .. })
        ));
    }

    #[test]
    fn snapshot_truncated_body() {
        let snap = FreeSpaceSnapshot {
            generation: 1,
            entries: vec![FreeSpaceEntry {
                offset: 0,
                bytes: 1,
            }],
        };
        let bytes = snap.to_bytes();
        assert!(matches!(
            FreeSpaceSnapshot::parse(&bytes[..bytes.len() - 1]),
            Err(ParseError::InsufficientData { .. })
        ));
    }

    #[test]
    fn free_space_info_layout() {
        let info = FreeSpaceInfo {
            extent_count: 3,
            flags: 0,
        };
        assert_eq!(info.to_bytes().len(), FREE_SPACE_INFO_SIZE);
        assert_eq!(FreeSpaceInfo::parse(&info.to_bytes()).unwrap(), info);
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(64))]

        #[test]
        fn successor_is_strictly_greater(
            objectid in any::<u64>(),
            item_type in any::<u8>(),
            offset in any::<u64>(),
        ) {
            let k = BtrfsKey::new(objectid, item_type, offset);
            if let Some(next) = k.successor() {
                prop_assert!(next > k);
            }
        }
    }
}
