/// Physical device buffer size (one DIO frame).
pub const PBUFSIZE: usize = 65536;

/// log2(PBUFSIZE).
pub const PBUFRADIX: u8 = 16;

/// Smallest allocation the freemap will hand out.
pub const ALLOC_MIN: usize = 1024;

/// Smallest allocation radix.
pub const MIN_RADIX: u8 = 10;

/// Largest allocation radix (one full device buffer).
pub const MAX_RADIX: u8 = 16;

/// Volume header size on disk.
pub const VOLUME_BYTES: usize = 65536;

/// Number of rotating volume-header copies on a large enough volume.
pub const NUM_VOLHDRS: usize = 4;

/// Zone stride. Volume-header copy `i` lives at `i * ZONE_BYTES` and a
/// reserved segment sits at the base of every zone.
pub const ZONE_BYTES: u64 = 2 * 1024 * 1024 * 1024;

/// Reserved segment at the base of every zone. Freemap blocks and the
/// volume headers rotate inside this area; the general allocator never
/// touches it.
pub const ZONE_SEG: u64 = 64 * 1024 * 1024;

/// Rotation slots for freemap blocks inside a zone's reserved segment.
pub const FREEMAP_ROTATIONS: u64 = 4;

/// Byte span of one freemap rotation slot.
pub const FREEMAP_SLOT_BYTES: u64 = 1024 * 1024;

/// First byte of the freemap rotation area within a zone (the volume
/// header copy occupies the first PBUF).
pub const FREEMAP_BASE: u64 = PBUFSIZE as u64;

/// One 2-bit freemap entry covers this many bytes.
pub const FREEMAP_BLOCK_SIZE: usize = 16384;

/// log2(FREEMAP_BLOCK_SIZE).
pub const FREEMAP_BLOCK_RADIX: u8 = 14;

/// Storage covered by one bmap entry (8 x 32-bit words of 2-bit states).
pub const SEGSIZE: u64 = 2 * 1024 * 1024;

/// log2(SEGSIZE).
pub const SEG_RADIX: u8 = 21;

/// bmap entries per freemap leaf.
pub const FREEMAP_COUNT: usize = 128;

/// Storage covered by one freemap leaf.
pub const LEAF_BYTES: u64 = SEGSIZE * FREEMAP_COUNT as u64;

/// log2(LEAF_BYTES).
pub const LEAF_RADIX: u8 = 28;

/// Freemap leaf block size on disk.
pub const FREEMAP_LEAF_BYTES: usize = 32768;

/// Allocation classes tracked by the freemap locality heuristic.
pub const HEUR_TYPES: usize = 8;

/// Radix spread per class in the heuristic table.
pub const HEUR_NRADIX: usize = 4;

/// Size of the freemap locality heuristic table.
pub const HEUR_SIZE: usize = HEUR_TYPES * HEUR_NRADIX;

/// Size of the per-device dedup hint table.
pub const DEDUP_HEUR_SIZE: usize = 65536;

/// Flush recursion depth before a subtree is deferred to the driver loop.
pub const FLUSH_DEPTH_LIMIT: usize = 60;

/// Sync-thread deferral list bound; beyond this the scan restarts.
pub const SYNC_DEFER_LIMIT: usize = 1000;

/// Maximum replicas in one cluster.
pub const CLUSTER_MAX: usize = 8;

/// Chains kept on the recycle LRU after their last reference drops.
pub const CHAIN_LRU_LIMIT: usize = 1024;

/// DIO frames kept cached after their last reference drops.
pub const DIO_LRU_LIMIT: usize = 256;

/// Sync-thread poll interval in milliseconds.
pub const SYNC_POLL_MS: u64 = 5000;

/// Nominal indirect-block size (128 blockref slots).
pub const IND_BYTES: usize = 16384;

/// Inline file data bytes held directly in the inode.
pub const EMBED_BYTES: usize = 512;

/// Brefs in an inode's embedded blockset.
pub const SET_COUNT: usize = 4;

/// Key bits covered by an inode's embedded blockset.
pub const SET_RADIX: u8 = 2;
