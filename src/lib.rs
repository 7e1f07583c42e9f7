//! Filesystem core: a write-back sector cache and an indexed-inode I/O
//! engine over a raw block device.
//!
//! Two layers, leaves first:
//!
//! - Cache: a fixed set of in-memory sectors, read through on miss and
//!   written back on eviction or an explicit flush.
//! - Inodes: twelve direct pointers plus single, double and triple
//!   indirect blocks map byte offsets to sectors. Blocks appear on
//!   demand when writes land in holes or past end-of-file, and the last
//!   close of a removed inode gives the whole tree back.
//!
//! The block device and the free-space map are ports ([`BlockDevice`],
//! [`FreeMap`]) supplied by the embedder. Directory layout, path
//! walking and everything else above the byte-addressed inode surface
//! live upstream of this crate.

#![cfg_attr(not(test), no_std)]

extern crate alloc;

mod cache;
mod device;
mod error;
mod inode;
mod param;
#[cfg(test)]
mod testutil;

pub use cache::SectorCache;
pub use device::{BlockDevice, FreeMap};
pub use error::WriteError;
pub use inode::{Inode, Volume};
pub use param::{
    CACHE_SLOTS, DIRECT_END, DOUBLE_END, INODE_MAGIC, NBLOCKS, NDIRECT, NINDIRECT, NINODE,
    SECTOR_SIZE, SINGLE_END, TRIPLE_END,
};
