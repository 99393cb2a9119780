//! Buffer cache.
//!
//! The buffer cache is a fixed table of slots holding cached copies of disk
//! sector contents. Caching sectors in memory reduces the number of disk
//! reads and also provides a synchronization point for sectors used by
//! multiple threads.
//!
//! Interface:
//! * To pin the cached copy of a sector, call `acquire` (or `acquire_zeroed`
//!   when the old contents will be overwritten wholesale).
//! * While the returned `Buf` is alive its holder has the slot to itself and
//!   may read the payload, and modify it if the pin was taken with write
//!   intent; dropping the `Buf` releases the pin.
//! * Only one thread at a time can hold a given sector, so do not keep pins
//!   longer than necessary, and never pin the same sector twice from one
//!   thread.
//!
//! Writes are deferred: a pin with write intent marks the slot dirty, and the
//! payload reaches the device on eviction or `flush`. A single mutex guards
//! the slot table, the LRU order, and the hit statistics; each slot has a
//! condition variable on which later acquirers of the same sector sleep until
//! the pin drops. The table mutex is not held while a pin is held, but it is
//! held across device reads and write-backs on a miss, so misses serialize
//! device traffic.

use std::cell::UnsafeCell;
use std::ops::{Deref, DerefMut};
use std::sync::{Arc, Condvar, Mutex};

use array_macro::array;
use arrayvec::ArrayVec;
use log::{debug, trace};

use crate::device::BlockDevice;
use crate::param::{NBUF, SECTOR_SIZE};

/// One cached sector payload.
///
/// The alignment lets sector-number tables inside metadata blocks, and whole
/// on-disk inodes, be viewed at their natural alignment.
#[repr(align(4))]
pub struct BlockData([u8; SECTOR_SIZE]);

impl Deref for BlockData {
    type Target = [u8; SECTOR_SIZE];

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

impl DerefMut for BlockData {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut self.0
    }
}

struct Slot {
    /// Sector mirrored by this slot; meaningful only when `valid`.
    sector: u32,
    valid: bool,
    dirty: bool,
    /// Number of outstanding pins; at most one in this design.
    ref_count: u32,
}

struct CacheState {
    slots: [Slot; NBUF],
    /// Slot indices, most recently used first.
    lru: Vec<usize>,
    access_count: u64,
    hit_count: u64,
}

pub struct BufferCache {
    device: Arc<dyn BlockDevice>,
    state: Mutex<CacheState>,
    /// Signaled when the corresponding slot's pin drops.
    unpinned: [Condvar; NBUF],
    /// Sector payloads, indexed like `slots`. A payload may be touched only
    /// by the holder of the slot's pin, or under the table mutex while the
    /// slot is unpinned.
    data: [UnsafeCell<BlockData>; NBUF],
}

// SAFETY: payloads are accessed only under the pin protocol described above.
unsafe impl Sync for BufferCache {}

impl BufferCache {
    pub fn new(device: Arc<dyn BlockDevice>) -> BufferCache {
        BufferCache {
            device,
            state: Mutex::new(CacheState {
                slots: array![_ => Slot { sector: 0, valid: false, dirty: false, ref_count: 0 }; NBUF],
                lru: (0..NBUF).collect(),
                access_count: 0,
                hit_count: 0,
            }),
            unpinned: array![_ => Condvar::new(); NBUF],
            data: array![_ => UnsafeCell::new(BlockData([0; SECTOR_SIZE])); NBUF],
        }
    }

    /// Returns a pinned `Buf` whose payload mirrors `sector`.
    ///
    /// With `write_intent` the slot is marked dirty up front and the holder
    /// may modify the payload in place.
    pub fn acquire(&self, sector: u32, write_intent: bool) -> Buf<'_> {
        self.acquire_inner(sector, write_intent, false)
    }

    /// Like `acquire` with write intent, but never reads the device: the
    /// payload comes back zero-filled. For freshly allocated sectors and
    /// whole-sector overwrites.
    pub fn acquire_zeroed(&self, sector: u32) -> Buf<'_> {
        self.acquire_inner(sector, true, true)
    }

    fn acquire_inner(&self, sector: u32, write_intent: bool, zeroed: bool) -> Buf<'_> {
        let mut state = self.state.lock().unwrap();
        state.access_count += 1;
        let mut counted_hit = false;
        let idx = loop {
            match state
                .slots
                .iter()
                .position(|s| s.valid && s.sector == sector)
            {
                Some(idx) => {
                    if !counted_hit {
                        state.hit_count += 1;
                        counted_hit = true;
                    }
                    if state.slots[idx].ref_count == 0 {
                        break idx;
                    }
                    state = self.unpinned[idx].wait(state).unwrap();
                    // Look the sector up again: the slot may have been
                    // repurposed while we slept.
                }
                None => {
                    let idx = Self::victim(&state);
                    let slot = &state.slots[idx];
                    if slot.valid && slot.dirty {
                        trace!("bcache: evict dirty sector {}", slot.sector);
                        // SAFETY: the slot is unpinned and we hold the table
                        // mutex, so no one else can touch the payload.
                        let data = unsafe { &*self.data[idx].get() };
                        self.device.write(slot.sector, data);
                    }
                    {
                        // SAFETY: as above; the pin is published only below.
                        let data = unsafe { &mut *self.data[idx].get() };
                        if zeroed {
                            data.fill(0);
                        } else {
                            self.device.read(sector, data);
                        }
                    }
                    let slot = &mut state.slots[idx];
                    slot.sector = sector;
                    slot.valid = true;
                    slot.dirty = false;
                    break idx;
                }
            }
        };

        let slot = &mut state.slots[idx];
        slot.dirty |= write_intent;
        slot.ref_count += 1;
        Self::touch(&mut state, idx);
        drop(state);

        let mut buf = Buf {
            cache: self,
            idx,
            writable: write_intent,
        };
        if zeroed {
            buf.data_mut().fill(0);
        }
        buf
    }

    /// Least recently used slot that is not pinned.
    fn victim(state: &CacheState) -> usize {
        *state
            .lru
            .iter()
            .rev()
            .find(|&&i| state.slots[i].ref_count == 0)
            .expect("bcache: all buffers pinned")
    }

    /// Moves `idx` to the most-recently-used end.
    fn touch(state: &mut CacheState, idx: usize) {
        let pos = state
            .lru
            .iter()
            .position(|&i| i == idx)
            .expect("bcache: slot missing from lru list");
        state.lru.remove(pos);
        state.lru.insert(0, idx);
    }

    fn release(&self, idx: usize) {
        let mut state = self.state.lock().unwrap();
        let slot = &mut state.slots[idx];
        debug_assert!(slot.ref_count > 0, "bcache: release of unpinned slot");
        slot.ref_count -= 1;
        if slot.ref_count == 0 {
            self.unpinned[idx].notify_one();
        }
    }

    /// Writes every unpinned dirty slot back to the device.
    pub fn flush(&self) {
        let mut state = self.state.lock().unwrap();
        let dirty: ArrayVec<usize, NBUF> = state
            .slots
            .iter()
            .enumerate()
            .filter(|(_, s)| s.valid && s.dirty && s.ref_count == 0)
            .map(|(i, _)| i)
            .collect();
        debug!("bcache: flush {} dirty sectors", dirty.len());
        for idx in dirty {
            let sector = state.slots[idx].sector;
            // SAFETY: the slot is unpinned and we hold the table mutex.
            let data = unsafe { &*self.data[idx].get() };
            self.device.write(sector, data);
            state.slots[idx].dirty = false;
        }
    }

    /// Writes dirty slots back, then invalidates every slot and zeroes the
    /// statistics. A test hook; must not run concurrently with pins.
    pub fn reset(&self) {
        self.flush();
        let mut state = self.state.lock().unwrap();
        for slot in state.slots.iter_mut() {
            assert_eq!(slot.ref_count, 0, "bcache: reset with a pinned slot");
            slot.valid = false;
            slot.dirty = false;
        }
        state.access_count = 0;
        state.hit_count = 0;
    }

    pub fn access_count(&self) -> u64 {
        self.state.lock().unwrap().access_count
    }

    pub fn hit_count(&self) -> u64 {
        self.state.lock().unwrap().hit_count
    }

    /// Fraction of acquires served without reading the device. Zero when
    /// nothing has been accessed yet.
    pub fn hit_rate(&self) -> f32 {
        let state = self.state.lock().unwrap();
        if state.access_count == 0 {
            0.0
        } else {
            state.hit_count as f32 / state.access_count as f32
        }
    }
}

/// A pinned buffer cache slot.
///
/// Dropping it releases the pin and wakes one waiter for the same sector.
pub struct Buf<'a> {
    cache: &'a BufferCache,
    idx: usize,
    writable: bool,
}

impl Buf<'_> {
    pub fn data(&self) -> &BlockData {
        // SAFETY: we hold the pin on this slot.
        unsafe { &*self.cache.data[self.idx].get() }
    }

    pub fn data_mut(&mut self) -> &mut BlockData {
        assert!(self.writable, "bcache: write through a read-only pin");
        // SAFETY: we hold the pin on this slot, exclusively.
        unsafe { &mut *self.cache.data[self.idx].get() }
    }
}

impl Drop for Buf<'_> {
    fn drop(&mut self) {
        self.cache.release(self.idx);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::MemDisk;
    use crate::param::SECTOR_SIZE;

    fn cache(sectors: u32) -> (Arc<MemDisk>, BufferCache) {
        let disk = Arc::new(MemDisk::new(sectors));
        let cache = BufferCache::new(disk.clone() as Arc<dyn BlockDevice>);
        (disk, cache)
    }

    #[test]
    fn write_back_reaches_device_on_flush() {
        let (disk, cache) = cache(16);
        {
            let mut buf = cache.acquire(5, true);
            buf.data_mut()[0] = 0x5a;
        }
        assert_eq!(disk.write_count(), 0);

        cache.flush();
        assert_eq!(disk.write_count(), 1);
        let mut raw = [0u8; SECTOR_SIZE];
        disk.read(5, &mut raw);
        assert_eq!(raw[0], 0x5a);
    }

    #[test]
    fn repeated_access_hits() {
        let (_, cache) = cache(16);
        drop(cache.acquire(3, false));
        drop(cache.acquire(3, false));
        drop(cache.acquire(3, true));
        assert_eq!(cache.access_count(), 3);
        assert_eq!(cache.hit_count(), 2);
    }

    #[test]
    fn eviction_writes_dirty_victim() {
        let (disk, cache) = cache(4 * NBUF as u32);
        {
            let mut buf = cache.acquire(0, true);
            buf.data_mut()[0] = 7;
        }
        // Touch enough other sectors to push sector 0 out.
        for sector in 1..=NBUF as u32 {
            drop(cache.acquire(sector, false));
        }
        assert_eq!(disk.write_count(), 1);

        // The payload must survive the round trip.
        let buf = cache.acquire(0, false);
        assert_eq!(buf.data()[0], 7);
    }

    #[test]
    fn zeroed_acquire_skips_device_read() {
        let (disk, cache) = cache(16);
        let mut raw = [0xffu8; SECTOR_SIZE];
        disk.write(9, &raw);
        {
            let buf = cache.acquire_zeroed(9);
            assert!(buf.data().iter().all(|&b| b == 0));
        }
        cache.flush();
        disk.read(9, &mut raw);
        assert!(raw.iter().all(|&b| b == 0));
    }

    #[test]
    fn reset_clears_statistics_and_contents() {
        let (_, cache) = cache(16);
        {
            let mut buf = cache.acquire(2, true);
            buf.data_mut()[0] = 1;
        }
        drop(cache.acquire(2, false));
        assert!(cache.hit_rate() > 0.0);

        cache.reset();
        assert_eq!(cache.access_count(), 0);
        assert_eq!(cache.hit_count(), 0);

        // Data came back from the device, not a stale slot.
        let buf = cache.acquire(2, false);
        assert_eq!(buf.data()[0], 1);
        assert_eq!(cache.hit_count(), 0);
    }

    #[test]
    fn pin_excludes_other_threads() {
        use std::sync::atomic::{AtomicBool, Ordering};
        use std::thread;
        use std::time::Duration;

        let (_, cache) = cache(16);
        let cache = Arc::new(cache);
        let in_critical = Arc::new(AtomicBool::new(false));

        let mut workers = Vec::new();
        for _ in 0..4 {
            let cache = cache.clone();
            let in_critical = in_critical.clone();
            workers.push(thread::spawn(move || {
                for _ in 0..50 {
                    let mut buf = cache.acquire(1, true);
                    assert!(!in_critical.swap(true, Ordering::SeqCst));
                    buf.data_mut()[0] = buf.data()[0].wrapping_add(1);
                    thread::sleep(Duration::from_micros(10));
                    in_critical.store(false, Ordering::SeqCst);
                    drop(buf);
                }
            }));
        }
        for w in workers {
            w.join().unwrap();
        }
        assert_eq!(cache.acquire(1, false).data()[0], 200);
    }
}
