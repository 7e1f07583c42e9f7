// Sector cache.
//
// A fixed array of slots holding cached copies of device sectors.
// Lookup is a linear scan; the slot count is small and accesses are
// clustered, so a map would buy nothing.
//
// Interface:
// * read copies the cached image of a sector into the caller's buffer,
//   fetching from the device on miss.
// * write replaces the cached image and marks the slot dirty; the
//   device is untouched until eviction or an explicit flush.
// * flush_all writes every dirty slot back without evicting anything.
//
// Two lock tiers. The cache-wide lock serializes slot lookup,
// allocation, eviction and device reads on miss. Each slot's own lock
// serializes the copy between the slot buffer and the caller's buffer
// together with the dirty flag. The cache-wide lock is held until the
// slot lock is taken, so a slot handed out by lookup can never be
// evicted before its caller has copied. Acquisition order is always
// cache-wide lock, then slot lock.

use crate::device::BlockDevice;
use crate::param::{CACHE_SLOTS, SECTOR_SIZE};
use alloc::sync::Arc;
use array_macro::array;
use core::sync::atomic::{AtomicU64, Ordering};
use log::debug;
use spin::{Mutex, MutexGuard};

pub struct SectorCache {
    dev: Arc<dyn BlockDevice>,
    ctl: Mutex<[SlotMeta; CACHE_SLOTS]>,
    slots: [Mutex<Slot>; CACHE_SLOTS],
    read_cnt: AtomicU64,
    write_cnt: AtomicU64,
}

// Bookkeeping half of a slot, guarded by the cache-wide lock.
#[derive(Clone, Copy)]
struct SlotMeta {
    sector: u32,
    in_use: bool,
    // Accesses since this slot was last touched; the eviction victim is
    // the slot with the largest age.
    age: u32,
}

// Data half of a slot, guarded by the slot's own lock.
struct Slot {
    data: [u8; SECTOR_SIZE],
    dirty: bool,
}

impl SectorCache {
    pub fn new(dev: Arc<dyn BlockDevice>) -> Self {
        Self {
            dev,
            ctl: Mutex::new(
                [SlotMeta {
                    sector: 0,
                    in_use: false,
                    age: 0,
                }; CACHE_SLOTS],
            ),
            slots: array![_ => Mutex::new(Slot { data: [0; SECTOR_SIZE], dirty: false }); CACHE_SLOTS],
            read_cnt: AtomicU64::new(0),
            write_cnt: AtomicU64::new(0),
        }
    }

    /// Copy the cached image of `sector` into `dst`. Reflects the most
    /// recent `write` to that sector.
    pub fn read(&self, sector: u32, dst: &mut [u8]) {
        assert_eq!(dst.len(), SECTOR_SIZE, "cache read: buffer is not one sector");
        let slot = self.acquire(sector);
        dst.copy_from_slice(&slot.data);
    }

    /// Replace the cached image of `sector` with `src` and mark the
    /// slot dirty. No device I/O happens here.
    pub fn write(&self, sector: u32, src: &[u8]) {
        assert_eq!(src.len(), SECTOR_SIZE, "cache write: buffer is not one sector");
        let mut slot = self.acquire(sector);
        slot.data.copy_from_slice(src);
        slot.dirty = true;
    }

    // Return the locked slot holding `sector`, fetching on miss. The
    // cache-wide lock stays held until the slot lock is ours.
    fn acquire(&self, sector: u32) -> MutexGuard<'_, Slot> {
        let mut ctl = self.ctl.lock();
        let n = match ctl.iter().position(|m| m.in_use && m.sector == sector) {
            Some(n) => n,
            None => self.fetch(&mut ctl, sector),
        };
        // Everyone ages, the touched slot rejuvenates.
        for m in ctl.iter_mut().filter(|m| m.in_use) {
            m.age = m.age.saturating_add(1);
        }
        ctl[n].age = 0;
        let guard = self.slots[n].lock();
        drop(ctl);
        guard
    }

    // Bring `sector` into a free slot, evicting one if none is free.
    // Runs under the cache-wide lock.
    fn fetch(&self, ctl: &mut [SlotMeta; CACHE_SLOTS], sector: u32) -> usize {
        let n = match ctl.iter().position(|m| !m.in_use) {
            Some(n) => n,
            None => self.evict(ctl),
        };
        let mut slot = self.slots[n].lock();
        self.dev.read(sector, &mut slot.data);
        self.read_cnt.fetch_add(1, Ordering::Relaxed);
        slot.dirty = false;
        drop(slot);
        ctl[n] = SlotMeta {
            sector,
            in_use: true,
            age: 0,
        };
        n
    }

    // Pick the in-use slot with the largest age (ties go to the highest
    // index), write it back if dirty, and hand it out for reuse.
    fn evict(&self, ctl: &mut [SlotMeta; CACHE_SLOTS]) -> usize {
        let mut victim = None;
        let mut max_age = 0;
        for (i, m) in ctl.iter().enumerate() {
            if m.in_use && m.age >= max_age {
                max_age = m.age;
                victim = Some(i);
            }
        }
        let n = victim.expect("cache evict: nothing in use");
        let mut slot = self.slots[n].lock();
        if slot.dirty {
            debug!("cache: write back sector {} from slot {}", ctl[n].sector, n);
            self.dev.write(ctl[n].sector, &slot.data);
            self.write_cnt.fetch_add(1, Ordering::Relaxed);
            slot.dirty = false;
        }
        drop(slot);
        ctl[n].in_use = false;
        n
    }

    /// Write every dirty slot back to the device. Nothing is evicted.
    pub fn flush_all(&self) {
        let ctl = self.ctl.lock();
        for (i, m) in ctl.iter().enumerate() {
            if !m.in_use {
                continue;
            }
            let mut slot = self.slots[i].lock();
            if slot.dirty {
                self.dev.write(m.sector, &slot.data);
                self.write_cnt.fetch_add(1, Ordering::Relaxed);
                slot.dirty = false;
            }
        }
    }

    /// Shut the cache down: flush-all. There is no other state to tear
    /// down.
    pub fn close(&self) {
        self.flush_all();
    }

    /// Device reads performed so far, one per miss.
    pub fn read_count(&self) -> u64 {
        self.read_cnt.load(Ordering::Relaxed)
    }

    /// Device writes performed so far, one per write-back.
    pub fn write_count(&self) -> u64 {
        self.write_cnt.load(Ordering::Relaxed)
    }

    /// Number of sectors currently cached.
    pub fn cached_count(&self) -> usize {
        self.ctl.lock().iter().filter(|m| m.in_use).count()
    }

    /// Number of cached sectors with changes not yet on the device.
    pub fn dirty_count(&self) -> usize {
        let ctl = self.ctl.lock();
        ctl.iter()
            .enumerate()
            .filter(|(i, m)| m.in_use && self.slots[*i].lock().dirty)
            .count()
    }

    #[cfg(test)]
    fn in_use_sectors(&self) -> alloc::vec::Vec<u32> {
        self.ctl
            .lock()
            .iter()
            .filter(|m| m.in_use)
            .map(|m| m.sector)
            .collect()
    }
}
