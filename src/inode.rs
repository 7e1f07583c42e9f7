// Inode engine.
//
// An inode describes a single unnamed file or directory. The on-disk
// structure fills exactly one sector: the logical length, a directory
// flag, a sanity tag and fifteen block pointers. The first twelve
// pointers name data sectors directly; the last three are the roots of
// single, double and triple indirect trees whose index sectors each
// hold NINDIRECT further pointers. A zero pointer anywhere means
// "unallocated": reads treat it as a hole full of zeros, writes
// allocate through it on demand, so files grow implicitly and may be
// sparse.
//
// The in-memory side is an open-inode table: at most one `OpenInode`
// exists per disk sector, the registry owns one reference to it and
// every `Inode` handle owns one more, so the strong count is the open
// count. A typical sequence is:
//
//     let ino = volume.open(sector);   // find or load, refcount++
//     ino.write_at(b"...", off)?;      // serialized per inode
//     drop(ino);                       // close; last close may free
//
// Closing the last handle of an inode marked `remove`d walks the whole
// block tree and gives every sector back to the free map, the inode
// sector last.
//
// Every sector touched on any path goes through the sector cache; the
// device is never addressed directly from here.

use crate::cache::SectorCache;
use crate::device::{BlockDevice, FreeMap};
use crate::error::WriteError;
use crate::param::{
    DIRECT_END, DOUBLE_END, INODE_MAGIC, NBLOCKS, NDIRECT, NINDIRECT, NINODE, SECTOR_SIZE,
    SINGLE_END, TRIPLE_END,
};
use alloc::sync::Arc;
use array_macro::array;
use core::cmp::min;
use core::mem::size_of;
use core::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use log::{debug, trace};
use spin::Mutex;
use static_assertions::const_assert_eq;
use zerocopy::{AsBytes, FromBytes};

const INODE_PAD: usize = SECTOR_SIZE - (3 + NBLOCKS) * size_of::<u32>();

// On-disk inode.
#[repr(C)]
#[derive(Clone, Copy, AsBytes, FromBytes)]
struct DiskInode {
    length: i32,
    is_dir: u32,
    magic: u32,
    blocks: [u32; NBLOCKS],
    _pad: [u8; INODE_PAD],
}

const_assert_eq!(size_of::<DiskInode>(), SECTOR_SIZE);

impl DiskInode {
    fn new(length: usize, is_dir: bool) -> Self {
        Self {
            length: length as i32,
            is_dir: is_dir as u32,
            magic: INODE_MAGIC,
            blocks: [0; NBLOCKS],
            _pad: [0; INODE_PAD],
        }
    }

    fn len(&self) -> usize {
        if self.length < 0 {
            0
        } else {
            self.length as usize
        }
    }
}

// Where a byte offset lands in the index tree: the depth of its leaf,
// the slot to take in blocks[] and then in each index sector on the
// way down, and the offset inside the leaf.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Pos {
    lev: usize,
    idx: [usize; 4],
    off: usize,
}

// Map a byte offset to its walk path. `None` iff the offset lies past
// the triple-indirect maximum. Pure arithmetic; no state is read.
fn pos_of(off: usize) -> Option<Pos> {
    const SINGLE_SPAN: usize = NINDIRECT * SECTOR_SIZE;
    const DOUBLE_SPAN: usize = NINDIRECT * SINGLE_SPAN;
    if off < DIRECT_END {
        Some(Pos {
            lev: 0,
            idx: [off / SECTOR_SIZE, 0, 0, 0],
            off: off % SECTOR_SIZE,
        })
    } else if off < SINGLE_END {
        let r = off - DIRECT_END;
        Some(Pos {
            lev: 1,
            idx: [NDIRECT, r / SECTOR_SIZE, 0, 0],
            off: r % SECTOR_SIZE,
        })
    } else if off < DOUBLE_END {
        let r = off - SINGLE_END;
        Some(Pos {
            lev: 2,
            idx: [NDIRECT + 1, r / SINGLE_SPAN, r % SINGLE_SPAN / SECTOR_SIZE, 0],
            off: r % SECTOR_SIZE,
        })
    } else if off < TRIPLE_END {
        let r = off - DOUBLE_END;
        Some(Pos {
            lev: 3,
            idx: [
                NDIRECT + 2,
                r / DOUBLE_SPAN,
                r % DOUBLE_SPAN / SINGLE_SPAN,
                r % SINGLE_SPAN / SECTOR_SIZE,
            ],
            off: r % SECTOR_SIZE,
        })
    } else {
        None
    }
}

// Index sectors are NINDIRECT little-endian sector numbers.
fn entry(buf: &[u8; SECTOR_SIZE], i: usize) -> u32 {
    let b = &buf[i * 4..i * 4 + 4];
    u32::from_le_bytes([b[0], b[1], b[2], b[3]])
}

fn put_entry(buf: &mut [u8; SECTOR_SIZE], i: usize, v: u32) {
    buf[i * 4..i * 4 + 4].copy_from_slice(&v.to_le_bytes());
}

// Why a write loop bailed out before consuming its input.
enum Stop {
    OutOfRange,
    NoSpace,
}

// One open inode. At most one exists per disk sector; the registry
// holds one reference and each handle holds one more, so the strong
// count tracks the open count.
struct OpenInode {
    sector: u32,
    removed: AtomicBool,
    deny_write: AtomicU32,
    // Cached copy of the on-disk inode. The lock serializes read_at and
    // write_at on this inode.
    data: Mutex<DiskInode>,
}

struct Core {
    cache: SectorCache,
    freemap: Arc<dyn FreeMap>,
    itable: Mutex<[Option<Arc<OpenInode>>; NINODE]>,
}

/// Facade over one device: the sector cache, the free-map port and the
/// open-inode registry.
pub struct Volume {
    core: Arc<Core>,
}

/// Handle to an open inode. Dropping it (or calling [`Inode::close`])
/// is the close operation; the last close of a [`Inode::remove`]d inode
/// frees its sectors.
pub struct Inode {
    core: Arc<Core>,
    ip: Option<Arc<OpenInode>>,
}

impl Volume {
    pub fn new(dev: Arc<dyn BlockDevice>, freemap: Arc<dyn FreeMap>) -> Self {
        Self {
            core: Arc::new(Core {
                cache: SectorCache::new(dev),
                freemap,
                itable: Mutex::new(array![None; NINODE]),
            }),
        }
    }

    /// Write a fresh inode to `sector` and zero-fill its first `length`
    /// bytes through the regular write path, so the backing sectors are
    /// allocated and reads over `[0, length)` return zeros.
    ///
    /// The header reaches the cache even if the fill runs out of space,
    /// so whatever was allocated stays reachable; the shortfall comes
    /// back as the error.
    pub fn create(&self, sector: u32, length: usize, is_dir: bool) -> Result<(), WriteError> {
        assert!(length <= TRIPLE_END, "create: length past the addressable maximum");
        let mut din = DiskInode::new(length, is_dir);
        let zeros = [0u8; SECTOR_SIZE];
        let mut filled = 0;
        let mut res = Ok(());
        while filled < length {
            let n = min(SECTOR_SIZE, length - filled);
            match self.core.do_write(&mut din, &zeros[..n], filled) {
                Ok(_) => filled += n,
                Err(e) => {
                    res = Err(e.rebase(filled));
                    break;
                }
            }
        }
        self.core.cache.write(sector, din.as_bytes());
        debug!("inode: created sector {} length {} dir {}", sector, length, is_dir);
        res
    }

    /// Open the inode stored at `sector`. Opens are de-duplicated: two
    /// holders of one sector share the same in-memory inode.
    pub fn open(&self, sector: u32) -> Inode {
        let mut tab = self.core.itable.lock();
        for slot in tab.iter() {
            if let Some(ip) = slot {
                if ip.sector == sector {
                    return Inode {
                        core: Arc::clone(&self.core),
                        ip: Some(Arc::clone(ip)),
                    };
                }
            }
        }
        let mut buf = [0u8; SECTOR_SIZE];
        self.core.cache.read(sector, &mut buf);
        let din = DiskInode::read_from(&buf[..]).expect("inode: sector size mismatch");
        assert_eq!(din.magic, INODE_MAGIC, "inode: bad magic in sector {}", sector);
        let ip = Arc::new(OpenInode {
            sector,
            removed: AtomicBool::new(false),
            deny_write: AtomicU32::new(0),
            data: Mutex::new(din),
        });
        let slot = tab
            .iter_mut()
            .find(|s| s.is_none())
            .expect("itable: out of slots");
        *slot = Some(Arc::clone(&ip));
        Inode {
            core: Arc::clone(&self.core),
            ip: Some(ip),
        }
    }

    /// Write every dirty cached sector back to the device.
    pub fn flush(&self) {
        self.core.cache.flush_all();
    }

    /// Shut down: flush-all. Open handles stay usable; durability is
    /// only as fresh as the last flush.
    pub fn close(&self) {
        self.core.cache.close();
    }

    /// The sector cache, exposed for its counters.
    pub fn cache(&self) -> &SectorCache {
        &self.core.cache
    }
}

impl Inode {
    fn ip(&self) -> &Arc<OpenInode> {
        // only vacated by close/drop, which consume the handle
        self.ip.as_ref().expect("inode handle already closed")
    }

    /// Sector number identifying this inode on disk.
    pub fn inumber(&self) -> u32 {
        self.ip().sector
    }

    /// Logical end-of-file.
    pub fn length(&self) -> usize {
        self.ip().data.lock().len()
    }

    pub fn is_dir(&self) -> bool {
        self.ip().data.lock().is_dir != 0
    }

    /// Mark the inode for deletion. Its block tree and inode sector are
    /// released when the last holder closes it.
    pub fn remove(&self) {
        self.ip().removed.store(true, Ordering::Relaxed);
    }

    /// Another handle to the same open inode (the reopen operation).
    pub fn dup(&self) -> Inode {
        Inode {
            core: Arc::clone(&self.core),
            ip: self.ip.clone(),
        }
    }

    /// Read up to `dst.len()` bytes starting at byte `off`, returning
    /// how many were delivered. Holes read as zeros, the count is
    /// clamped at end-of-file, and reads past it deliver nothing.
    /// Reads do not fail.
    pub fn read_at(&self, dst: &mut [u8], off: usize) -> usize {
        let din = self.ip().data.lock();
        self.core.do_read(&din, dst, off)
    }

    /// Write `src` at byte `off`, growing the file when the range lies
    /// past end-of-file. On an early stop the error says how many bytes
    /// made it; those are kept and `length` covers them.
    pub fn write_at(&self, src: &[u8], off: usize) -> Result<usize, WriteError> {
        let ip = self.ip();
        if ip.deny_write.load(Ordering::Relaxed) > 0 {
            return Err(WriteError::Denied);
        }
        let mut din = ip.data.lock();
        let old = din.length;
        let res = self.core.do_write(&mut din, src, off);
        // one header write-back per call, and only when it changed
        if din.length != old {
            self.core.cache.write(ip.sector, din.as_bytes());
        }
        res
    }

    /// Block writes through every handle of this inode until a matching
    /// [`Inode::allow_write`].
    pub fn deny_write(&self) {
        let cnt = self.ip().deny_write.fetch_add(1, Ordering::Relaxed) + 1;
        assert!(
            cnt as usize <= self.open_count(),
            "deny_write exceeds the open count"
        );
    }

    pub fn allow_write(&self) {
        let prev = self.ip().deny_write.fetch_sub(1, Ordering::Relaxed);
        assert!(prev > 0, "allow_write without a matching deny_write");
    }

    /// Close this handle. Dropping it does the same; the method exists
    /// so call sites read like the operation they perform.
    pub fn close(self) {}

    fn open_count(&self) -> usize {
        // the registry holds one reference, handles hold the rest
        Arc::strong_count(self.ip()) - 1
    }
}

impl Drop for Inode {
    fn drop(&mut self) {
        if let Some(ip) = self.ip.take() {
            self.core.put(ip);
        }
    }
}

impl Core {
    // Serve a read in sector-bounded chunks. A zero pointer anywhere on
    // a chunk's walk zero-fills that chunk; the cursor advances either
    // way, and the final count is clamped to end-of-file.
    fn do_read(&self, din: &DiskInode, dst: &mut [u8], off: usize) -> usize {
        let mut done = 0;
        let mut scratch = [0u8; SECTOR_SIZE];
        while done < dst.len() {
            let pos = match pos_of(off + done) {
                Some(pos) => pos,
                None => break,
            };
            let n = min(dst.len() - done, SECTOR_SIZE - pos.off);
            let mut hole = false;
            for k in 0..=pos.lev {
                let ptr = if k == 0 {
                    din.blocks[pos.idx[0]]
                } else {
                    entry(&scratch, pos.idx[k])
                };
                if ptr == 0 {
                    hole = true;
                    break;
                }
                self.cache.read(ptr, &mut scratch);
            }
            let chunk = &mut dst[done..done + n];
            if hole {
                chunk.fill(0);
            } else {
                chunk.copy_from_slice(&scratch[pos.off..pos.off + n]);
            }
            done += n;
        }
        // holes read as zeros, but nothing past end-of-file counts
        min(done, din.len().saturating_sub(off))
    }

    // Serve a write in sector-bounded chunks, allocating wherever the
    // walk meets a zero pointer. A new child is published in its parent
    // index sector before being filled in, so the tree reachable from
    // the header is consistent at every step. The file grows to cover
    // whatever was written, even on an early stop.
    fn do_write(
        &self,
        din: &mut DiskInode,
        src: &[u8],
        off: usize,
    ) -> Result<usize, WriteError> {
        let mut done = 0;
        let mut stop = None;
        let mut scratch = [0u8; SECTOR_SIZE];
        'chunks: while done < src.len() {
            let pos = match pos_of(off + done) {
                Some(pos) => pos,
                None => {
                    stop = Some(Stop::OutOfRange);
                    break;
                }
            };
            let n = min(src.len() - done, SECTOR_SIZE - pos.off);
            // walk down; `cur` is the sector whose image sits in scratch
            let mut cur = 0u32;
            for k in 0..=pos.lev {
                let ptr = if k == 0 {
                    din.blocks[pos.idx[0]]
                } else {
                    entry(&scratch, pos.idx[k])
                };
                cur = if ptr == 0 {
                    let new = match self.freemap.allocate() {
                        Some(s) => s,
                        None => {
                            stop = Some(Stop::NoSpace);
                            break 'chunks;
                        }
                    };
                    trace!("inode: sector {} allocated at level {}", new, k);
                    if k == 0 {
                        din.blocks[pos.idx[0]] = new;
                    } else {
                        put_entry(&mut scratch, pos.idx[k], new);
                        self.cache.write(cur, &scratch);
                    }
                    // a fresh block starts as zeros
                    scratch = [0; SECTOR_SIZE];
                    new
                } else {
                    self.cache.read(ptr, &mut scratch);
                    ptr
                };
            }
            scratch[pos.off..pos.off + n].copy_from_slice(&src[done..done + n]);
            self.cache.write(cur, &scratch);
            done += n;
        }
        // grow to cover the bytes that made it out; a write that never
        // started leaves the length alone
        let end = off + done;
        if done > 0 && end > din.len() {
            din.length = end as i32;
        }
        match stop {
            None => Ok(done),
            Some(Stop::OutOfRange) => Err(WriteError::OutOfRange { written: done }),
            Some(Stop::NoSpace) => Err(WriteError::NoSpace { written: done }),
        }
    }

    // Drop one reference to an open inode. References are only ever
    // given back under the registry lock, so a strong count of one (the
    // registry's own) after dropping ours means this was the last
    // close.
    fn put(&self, ip: Arc<OpenInode>) {
        let mut tab = self.itable.lock();
        let n = tab
            .iter()
            .position(|s| s.as_ref().map_or(false, |a| Arc::ptr_eq(a, &ip)))
            .expect("itable: inode not registered");
        drop(ip);
        if Arc::strong_count(tab[n].as_ref().expect("itable: slot vanished")) > 1 {
            return;
        }
        let ip = tab[n].take().expect("itable: slot vanished");
        if ip.removed.load(Ordering::Relaxed) {
            debug!("inode: releasing removed inode at sector {}", ip.sector);
            let din = ip.data.lock();
            self.release_tree(&din);
            self.freemap.release(ip.sector);
        }
    }

    // Give back every sector reachable from the header, leftmost first,
    // children before the index sector naming them. The inode sector
    // itself is the caller's to release, last.
    fn release_tree(&self, din: &DiskInode) {
        for k in 0..NDIRECT {
            if din.blocks[k] != 0 {
                self.freemap.release(din.blocks[k]);
            }
        }
        for depth in 1..=3 {
            let root = din.blocks[NDIRECT + depth - 1];
            if root != 0 {
                self.release_index(root, depth);
            }
        }
    }

    // `sector` is an index block whose entries are (depth-1)-level
    // subtrees; at depth 1 the entries are data sectors. Every entry is
    // visited: sparse files leave zero gaps in the middle of a block,
    // so stopping at the first zero would leak.
    fn release_index(&self, sector: u32, depth: usize) {
        let mut buf = [0u8; SECTOR_SIZE];
        self.cache.read(sector, &mut buf);
        for i in 0..NINDIRECT {
            let child = entry(&buf, i);
            if child == 0 {
                continue;
            }
            if depth == 1 {
                self.freemap.release(child);
            } else {
                self.release_index(child, depth - 1);
            }
        }
        self.freemap.release(sector);
    }
}
