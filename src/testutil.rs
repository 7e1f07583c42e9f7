// Test doubles for the two external ports.

use crate::device::{BlockDevice, FreeMap};
use crate::param::SECTOR_SIZE;
use alloc::sync::Arc;
use alloc::vec;
use alloc::vec::Vec;
use spin::Mutex;

/// Fixed-size in-memory disk.
pub struct MemDisk {
    sectors: Mutex<Vec<[u8; SECTOR_SIZE]>>,
}

impl MemDisk {
    pub fn new(nsectors: usize) -> Arc<Self> {
        Arc::new(Self {
            sectors: Mutex::new(vec![[0; SECTOR_SIZE]; nsectors]),
        })
    }

    /// Raw device content, bypassing any cache in front of it.
    pub fn sector(&self, n: u32) -> [u8; SECTOR_SIZE] {
        self.sectors.lock()[n as usize]
    }
}

impl BlockDevice for MemDisk {
    fn read(&self, sector: u32, buf: &mut [u8]) {
        buf.copy_from_slice(&self.sectors.lock()[sector as usize]);
    }

    fn write(&self, sector: u32, buf: &[u8]) {
        self.sectors.lock()[sector as usize].copy_from_slice(buf);
    }
}

/// Bump allocator over a sector range, recording every call so tests
/// can audit exactly what was handed out and given back.
pub struct TestFreeMap {
    inner: Mutex<Inner>,
    limit: u32,
}

struct Inner {
    next: u32,
    allocated: Vec<u32>,
    released: Vec<u32>,
}

impl TestFreeMap {
    /// Hands out sectors from `first` up to (not including) `limit`.
    pub fn new(first: u32, limit: u32) -> Arc<Self> {
        Arc::new(Self {
            inner: Mutex::new(Inner {
                next: first,
                allocated: Vec::new(),
                released: Vec::new(),
            }),
            limit,
        })
    }

    pub fn allocated(&self) -> Vec<u32> {
        self.inner.lock().allocated.clone()
    }

    /// Releases, in call order.
    pub fn released(&self) -> Vec<u32> {
        self.inner.lock().released.clone()
    }
}

impl FreeMap for TestFreeMap {
    fn allocate(&self) -> Option<u32> {
        let mut inner = self.inner.lock();
        if inner.next >= self.limit {
            return None;
        }
        let s = inner.next;
        inner.next += 1;
        inner.allocated.push(s);
        Some(s)
    }

    fn release(&self, sector: u32) {
        let mut inner = self.inner.lock();
        assert!(
            !inner.released.contains(&sector),
            "double release of sector {}",
            sector
        );
        inner.released.push(sector);
    }
}
