#![forbid(unsafe_code)]
//! Block-group type and RAID profile flags.
//!
//! A group's flags combine exactly one type family (data, metadata, system,
//! or data|metadata for mixed groups) with at most one RAID profile bit; no
//! profile bit means SINGLE. Internally the allocator also uses an
//! "extended" form in which SINGLE is represented by [`BlockGroupFlags::AVAIL_SINGLE`]
//! so that "single is available" can be recorded in a bit mask.
//!
//! ## Design
//!
//! - [`reduce_alloc_profile`] is a pure function of (device count, flags,
//!   restripe target) so it can be tested without any filesystem state.
//! - [`AllocProfiles`] holds the per-type "avail" bits behind a sequence
//!   counter: readers retry if a writer raced them, writers serialise on a
//!   mutex. The restripe targets sit behind their own lock.

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::ops::{BitAnd, BitOr, BitOrAssign};
use std::sync::atomic::{AtomicU64, Ordering, fence};

/// Block-group flag bits, using the persisted values.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct BlockGroupFlags(pub u64);

impl BlockGroupFlags {
    pub const DATA: Self = Self(1 << 0);
    pub const SYSTEM: Self = Self(1 << 1);
    pub const METADATA: Self = Self(1 << 2);
    pub const RAID0: Self = Self(1 << 3);
    pub const RAID1: Self = Self(1 << 4);
    pub const DUP: Self = Self(1 << 5);
    pub const RAID10: Self = Self(1 << 6);
    pub const RAID5: Self = Self(1 << 7);
    pub const RAID6: Self = Self(1 << 8);
    pub const RAID1C3: Self = Self(1 << 9);
    pub const RAID1C4: Self = Self(1 << 10);
    /// Extended-format marker for SINGLE.
    pub const AVAIL_SINGLE: Self = Self(1 << 48);

    pub const TYPE_MASK: Self = Self(Self::DATA.0 | Self::SYSTEM.0 | Self::METADATA.0);
    pub const PROFILE_MASK: Self = Self(
        Self::RAID0.0
            | Self::RAID1.0
            | Self::DUP.0
            | Self::RAID10.0
            | Self::RAID5.0
            | Self::RAID6.0
            | Self::RAID1C3.0
            | Self::RAID1C4.0,
    );
    pub const MIXED: Self = Self(Self::DATA.0 | Self::METADATA.0);

    #[must_use]
    pub const fn bits(self) -> u64 {
        self.0
    }

    #[must_use]
    pub const fn empty() -> Self {
        Self(0)
    }

    #[must_use]
    pub const fn is_empty(self) -> bool {
        self.0 == 0
    }

    /// All bits of `other` are set in `self`.
    #[must_use]
    pub const fn contains(self, other: Self) -> bool {
        self.0 & other.0 == other.0
    }

    #[must_use]
    pub const fn intersects(self, other: Self) -> bool {
        self.0 & other.0 != 0
    }

    #[must_use]
    pub const fn without(self, other: Self) -> Self {
        Self(self.0 & !other.0)
    }

    /// The type family bits (data/metadata/system).
    #[must_use]
    pub const fn type_bits(self) -> Self {
        Self(self.0 & Self::TYPE_MASK.0)
    }

    /// The RAID profile bits, without the extended SINGLE marker.
    #[must_use]
    pub const fn profile_bits(self) -> Self {
        Self(self.0 & Self::PROFILE_MASK.0)
    }

    #[must_use]
    pub const fn is_data(self) -> bool {
        self.0 & Self::DATA.0 != 0
    }

    #[must_use]
    pub const fn is_metadata(self) -> bool {
        self.0 & Self::METADATA.0 != 0
    }

    #[must_use]
    pub const fn is_system(self) -> bool {
        self.0 & Self::SYSTEM.0 != 0
    }

    #[must_use]
    pub const fn is_mixed(self) -> bool {
        self.contains(Self::MIXED)
    }

    /// Convert to the extended form: SINGLE becomes an explicit bit.
    #[must_use]
    pub const fn to_extended(self) -> Self {
        if self.0 & Self::PROFILE_MASK.0 == 0 {
            Self(self.0 | Self::AVAIL_SINGLE.0)
        } else {
            self
        }
    }

    /// Convert from the extended form back to persisted flags.
    #[must_use]
    pub const fn to_chunk(self) -> Self {
        Self(self.0 & !Self::AVAIL_SINGLE.0)
    }

    #[must_use]
    pub fn raid_type(self) -> RaidType {
        RaidType::from_flags(self)
    }
}

impl BitOr for BlockGroupFlags {
    type Output = Self;

    fn bitor(self, rhs: Self) -> Self {
        Self(self.0 | rhs.0)
    }
}

impl BitOrAssign for BlockGroupFlags {
    fn bitor_assign(&mut self, rhs: Self) {
        self.0 |= rhs.0;
    }
}

impl BitAnd for BlockGroupFlags {
    type Output = Self;

    fn bitand(self, rhs: Self) -> Self {
        Self(self.0 & rhs.0)
    }
}

impl fmt::Display for BlockGroupFlags {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut parts: Vec<&str> = Vec::new();
        if self.is_data() {
            parts.push("data");
        }
        if self.is_system() {
            parts.push("system");
        }
        if self.is_metadata() {
            parts.push("metadata");
        }
        parts.push(self.raid_type().attr().name);
        write!(f, "{}", parts.join("|"))
    }
}

// ── RAID attribute table ────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum RaidType {
    Raid10,
    Raid1,
    Dup,
    Raid0,
    Single,
    Raid5,
    Raid6,
    Raid1C3,
    Raid1C4,
}

/// Static properties of one RAID type.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RaidAttr {
    /// Minimum number of writable devices the type can be placed on.
    pub devs_min: u64,
    /// Full copies of every byte.
    pub ncopies: u64,
    /// Parity stripes per full stripe.
    pub nparity: u64,
    /// Persisted flag bit; empty for SINGLE.
    pub flag: BlockGroupFlags,
    pub name: &'static str,
}

pub const NR_RAID_TYPES: usize = 9;

impl RaidType {
    pub const ALL: [Self; NR_RAID_TYPES] = [
        Self::Raid10,
        Self::Raid1,
        Self::Dup,
        Self::Raid0,
        Self::Single,
        Self::Raid5,
        Self::Raid6,
        Self::Raid1C3,
        Self::Raid1C4,
    ];

    /// Position in [`RaidType::ALL`], used to index per-type lists.
    #[must_use]
    pub const fn index(self) -> usize {
        self as usize
    }

    #[must_use]
    pub fn from_flags(flags: BlockGroupFlags) -> Self {
        let profile = flags.profile_bits();
        Self::ALL
            .into_iter()
            .find(|t| !t.attr().flag.is_empty() && profile.contains(t.attr().flag))
            .unwrap_or(Self::Single)
    }

    #[must_use]
    pub const fn attr(self) -> RaidAttr {
        match self {
            Self::Raid10 => RaidAttr {
                devs_min: 2,
                ncopies: 2,
                nparity: 0,
                flag: BlockGroupFlags::RAID10,
                name: "raid10",
            },
            Self::Raid1 => RaidAttr {
                devs_min: 2,
                ncopies: 2,
                nparity: 0,
                flag: BlockGroupFlags::RAID1,
                name: "raid1",
            },
            Self::Dup => RaidAttr {
                devs_min: 1,
                ncopies: 2,
                nparity: 0,
                flag: BlockGroupFlags::DUP,
                name: "dup",
            },
            Self::Raid0 => RaidAttr {
                devs_min: 1,
                ncopies: 1,
                nparity: 0,
                flag: BlockGroupFlags::RAID0,
                name: "raid0",
            },
            Self::Single => RaidAttr {
                devs_min: 1,
                ncopies: 1,
                nparity: 0,
                flag: BlockGroupFlags::empty(),
                name: "single",
            },
            Self::Raid5 => RaidAttr {
                devs_min: 2,
                ncopies: 1,
                nparity: 1,
                flag: BlockGroupFlags::RAID5,
                name: "raid5",
            },
            Self::Raid6 => RaidAttr {
                devs_min: 3,
                ncopies: 1,
                nparity: 2,
                flag: BlockGroupFlags::RAID6,
                name: "raid6",
            },
            Self::Raid1C3 => RaidAttr {
                devs_min: 3,
                ncopies: 3,
                nparity: 0,
                flag: BlockGroupFlags::RAID1C3,
                name: "raid1c3",
            },
            Self::Raid1C4 => RaidAttr {
                devs_min: 4,
                ncopies: 4,
                nparity: 0,
                flag: BlockGroupFlags::RAID1C4,
                name: "raid1c4",
            },
        }
    }

    /// Raw bytes consumed per logical byte, ignoring parity.
    #[must_use]
    pub const fn factor(self) -> u64 {
        self.attr().ncopies
    }
}

/// Redundancy order used to pick one profile out of an allowed set.
const REDUCTION_PRIORITY: [BlockGroupFlags; 8] = [
    BlockGroupFlags::RAID1C4,
    BlockGroupFlags::RAID6,
    BlockGroupFlags::RAID1C3,
    BlockGroupFlags::RAID5,
    BlockGroupFlags::RAID10,
    BlockGroupFlags::RAID1,
    BlockGroupFlags::DUP,
    BlockGroupFlags::RAID0,
];

/// Reduce a set of allowed profiles to the single one a new chunk uses.
///
/// A restripe target, when present, wins outright. Otherwise profiles the
/// device count cannot host are masked out and the most redundant survivor
/// is kept; if none survives the result is SINGLE. The type bits of
/// `flags` are preserved and the result is in persisted (non-extended) form.
#[must_use]
pub fn reduce_alloc_profile(
    num_devices: u64,
    flags: BlockGroupFlags,
    restripe_target: Option<BlockGroupFlags>,
) -> BlockGroupFlags {
    if let Some(target) = restripe_target {
        return target.to_chunk();
    }

    let mut possible = BlockGroupFlags::empty();
    for raid in RaidType::ALL {
        let attr = raid.attr();
        if num_devices >= attr.devs_min {
            possible |= attr.flag;
        }
    }
    let allowed = possible & flags;

    let chosen = REDUCTION_PRIORITY
        .into_iter()
        .find(|bit| allowed.contains(*bit))
        .unwrap_or_default();

    flags.without(BlockGroupFlags::PROFILE_MASK).to_chunk() | chosen
}

// ── Restripe targets and avail bits ─────────────────────────────────────────

/// Conversion targets recorded by a running balance, per type family.
///
/// Targets are in extended form.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RestripeTargets {
    pub data: Option<BlockGroupFlags>,
    pub metadata: Option<BlockGroupFlags>,
    pub system: Option<BlockGroupFlags>,
}

impl RestripeTargets {
    /// Target for the family of `flags`. Data is checked first, then
    /// system, then metadata, so mixed groups follow the data target.
    #[must_use]
    pub fn for_flags(&self, flags: BlockGroupFlags) -> Option<BlockGroupFlags> {
        if flags.is_data() {
            self.data
        } else if flags.is_system() {
            self.system
        } else if flags.is_metadata() {
            self.metadata
        } else {
            None
        }
    }
}

/// Per-filesystem profile state: which RAID types currently have groups
/// (the avail bits) and any balance conversion in progress.
#[derive(Debug, Default)]
pub struct AllocProfiles {
    seq: AtomicU64,
    writer: Mutex<()>,
    avail_data: AtomicU64,
    avail_metadata: AtomicU64,
    avail_system: AtomicU64,
    restripe: Mutex<RestripeTargets>,
}

impl AllocProfiles {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn write_avail(&self, flags: BlockGroupFlags, set: bool) {
        let extra = flags.profile_bits().to_extended().without(BlockGroupFlags::TYPE_MASK);
        let _guard = self.writer.lock();
        let seq = self.seq.load(Ordering::Relaxed);
        self.seq.store(seq.wrapping_add(1), Ordering::Relaxed);
        fence(Ordering::Release);
        for (bit, slot) in [
            (BlockGroupFlags::DATA, &self.avail_data),
            (BlockGroupFlags::METADATA, &self.avail_metadata),
            (BlockGroupFlags::SYSTEM, &self.avail_system),
        ] {
            if flags.contains(bit) {
                if set {
                    slot.fetch_or(extra.bits(), Ordering::Relaxed);
                } else {
                    slot.fetch_and(!extra.bits(), Ordering::Relaxed);
                }
            }
        }
        self.seq.store(seq.wrapping_add(2), Ordering::Release);
    }

    /// Record that a group with `flags` exists.
    pub fn set_avail_alloc_bits(&self, flags: BlockGroupFlags) {
        self.write_avail(flags, true);
    }

    /// Record that the last group of `flags`' RAID type left its family.
    pub fn clear_avail_alloc_bits(&self, flags: BlockGroupFlags) {
        self.write_avail(flags, false);
    }

    /// Avail bits for the family of `flags`, read under the sequence counter.
    #[must_use]
    pub fn avail_bits(&self, flags: BlockGroupFlags) -> BlockGroupFlags {
        loop {
            let before = self.seq.load(Ordering::Acquire);
            if before & 1 == 1 {
                std::hint::spin_loop();
                continue;
            }
            let mut bits = 0;
            if flags.is_data() {
                bits |= self.avail_data.load(Ordering::Relaxed);
            }
            if flags.is_system() {
                bits |= self.avail_system.load(Ordering::Relaxed);
            }
            if flags.is_metadata() {
                bits |= self.avail_metadata.load(Ordering::Relaxed);
            }
            fence(Ordering::Acquire);
            if self.seq.load(Ordering::Relaxed) == before {
                return BlockGroupFlags(bits);
            }
        }
    }

    pub fn set_restripe_targets(&self, targets: RestripeTargets) {
        *self.restripe.lock() = targets;
    }

    #[must_use]
    pub fn restripe_target(&self, flags: BlockGroupFlags) -> Option<BlockGroupFlags> {
        self.restripe.lock().for_flags(flags)
    }

    /// Profile a new chunk of `type_flags` family should use right now.
    #[must_use]
    pub fn get_alloc_profile(&self, type_flags: BlockGroupFlags, num_devices: u64) -> BlockGroupFlags {
        let flags = type_flags | self.avail_bits(type_flags);
        reduce_alloc_profile(num_devices, flags, self.restripe_target(type_flags))
    }
}
