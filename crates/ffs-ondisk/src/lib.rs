#![forbid(unsafe_code)]
//! Persisted item encodings used by the block-group allocator.
//!
//! Pure encoding crate with no I/O: item keys and their sort order, the
//! block-group item, free-space tree info items and the checksummed
//! free-space snapshot.

pub mod btrfs;

pub use btrfs::{
    BLOCK_GROUP_ITEM_KEY, BlockGroupItem, BtrfsKey, EXTENT_ITEM_KEY, FIRST_CHUNK_TREE_OBJECTID,
    FREE_SPACE_EXTENT_KEY, FREE_SPACE_INFO_KEY, FREE_SPACE_OBJECTID, FreeSpaceEntry,
    FreeSpaceInfo, FreeSpaceSnapshot, METADATA_ITEM_KEY,
};
