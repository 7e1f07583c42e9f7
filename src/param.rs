// Filesystem geometry and capacities. Everything here is fixed at
// compile time: the sector size is dictated by the device and the rest
// is derived from it.

/// Fixed unit of device I/O, in bytes.
pub const SECTOR_SIZE: usize = 512;

/// Number of slots in the sector cache.
pub const CACHE_SLOTS: usize = 64;

/// Direct block pointers per inode.
pub const NDIRECT: usize = 12;

/// Sector numbers held by one index block.
pub const NINDIRECT: usize = SECTOR_SIZE / core::mem::size_of::<u32>();

/// Pointer slots in the inode: the direct blocks plus the single,
/// double and triple indirect roots.
pub const NBLOCKS: usize = NDIRECT + 3;

/// Capacity of the open-inode table.
pub const NINODE: usize = 50;

/// Sanity tag stored in every inode sector.
pub const INODE_MAGIC: u32 = 0x494e_4f44;

/// First byte past the directly mapped range.
pub const DIRECT_END: usize = NDIRECT * SECTOR_SIZE;

/// First byte past the single-indirect range.
pub const SINGLE_END: usize = DIRECT_END + NINDIRECT * SECTOR_SIZE;

/// First byte past the double-indirect range.
pub const DOUBLE_END: usize = SINGLE_END + NINDIRECT * NINDIRECT * SECTOR_SIZE;

/// First byte past the triple-indirect range; the largest file size.
pub const TRIPLE_END: usize = DOUBLE_END + NINDIRECT * NINDIRECT * NINDIRECT * SECTOR_SIZE;
