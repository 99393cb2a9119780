//! Free-sector map.
//!
//! One bit per sector: 0 = free, 1 = in use. The authoritative copy lives in
//! memory; every mutation is written straight back through the buffer cache
//! into the map's backing file, whose inode sits at the reserved sector 0.
//! While the volume is being formatted the backing file does not exist yet,
//! so persistence silently waits until `attach` hands the map its inode.
//!
//! Allocation is a first-fit scan. Only single sectors are ever requested;
//! multi-sector extents are the block map's job, one sector at a time.

use std::sync::{Arc, Mutex};

use itertools::Itertools;
use log::{debug, trace};

use crate::error::FsError;
use crate::filesys::Filesys;
use crate::inode::Inode;
use crate::param::FREE_MAP_SECTOR;

const BITS_PER_WORD: usize = 64;

/// A plain bit array with a first-fit scan.
///
/// Bits past `bit_count` in the last word are kept set so that the word scan
/// can never hand them out.
struct Bits {
    words: Vec<u64>,
    bit_count: u32,
}

impl Bits {
    fn new(bit_count: u32) -> Bits {
        let mut bits = Bits {
            words: vec![0; (bit_count as usize + BITS_PER_WORD - 1) / BITS_PER_WORD],
            bit_count,
        };
        bits.mark_excess();
        bits
    }

    fn mark_excess(&mut self) {
        for bit in self.bit_count as usize..self.words.len() * BITS_PER_WORD {
            self.words[bit / BITS_PER_WORD] |= 1 << (bit % BITS_PER_WORD);
        }
    }

    fn excess(&self) -> u32 {
        (self.words.len() * BITS_PER_WORD) as u32 - self.bit_count
    }

    fn get(&self, bit: u32) -> bool {
        self.words[bit as usize / BITS_PER_WORD] & (1 << (bit as usize % BITS_PER_WORD)) != 0
    }

    fn set(&mut self, bit: u32) {
        assert!(!self.get(bit), "free map: sector {} already in use", bit);
        self.words[bit as usize / BITS_PER_WORD] |= 1 << (bit as usize % BITS_PER_WORD);
    }

    fn clear(&mut self, bit: u32) {
        assert!(self.get(bit), "free map: freeing free sector {}", bit);
        self.words[bit as usize / BITS_PER_WORD] &= !(1 << (bit as usize % BITS_PER_WORD));
    }

    /// Lowest zero bit, if any.
    fn first_fit(&self) -> Option<u32> {
        self.words
            .iter()
            .find_position(|&&word| word != u64::MAX)
            .map(|(i, &word)| (i * BITS_PER_WORD) as u32 + word.trailing_ones())
    }

    fn used_count(&self) -> u32 {
        let ones: u32 = self.words.iter().map(|w| w.count_ones()).sum();
        ones - self.excess()
    }

    /// Serialized form: the words as little-endian bytes, truncated to the
    /// byte length of the bit array.
    fn to_bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(self.words.len() * 8);
        for word in &self.words {
            out.extend_from_slice(&word.to_le_bytes());
        }
        out.truncate(Self::byte_len(self.bit_count));
        out
    }

    fn from_bytes(bytes: &[u8], bit_count: u32) -> Bits {
        let mut bits = Bits::new(bit_count);
        for word in bits.words.iter_mut() {
            *word = 0;
        }
        for (i, &b) in bytes.iter().enumerate() {
            bits.words[i / 8] |= (b as u64) << (8 * (i % 8));
        }
        // Garbage past the real bits gets re-marked, not trusted.
        let last = bits.words.len() - 1;
        bits.words[last] &= Self::tail_mask(bit_count);
        bits.mark_excess();
        bits
    }

    /// Mask of the in-range bits of the final word.
    fn tail_mask(bit_count: u32) -> u64 {
        match bit_count as usize % BITS_PER_WORD {
            0 => !0,
            n => (1u64 << n) - 1,
        }
    }

    fn byte_len(bit_count: u32) -> usize {
        (bit_count as usize + 7) / 8
    }
}

struct FreeMapState {
    bits: Bits,
    /// Open handle on the map's own file; `None` until `attach`.
    backing: Option<Arc<Inode>>,
}

pub struct FreeMap {
    inner: Mutex<FreeMapState>,
}

impl FreeMap {
    /// A fresh all-free map for a device with `sector_count` sectors.
    pub(crate) fn new(sector_count: u32) -> FreeMap {
        FreeMap {
            inner: Mutex::new(FreeMapState {
                bits: Bits::new(sector_count),
                backing: None,
            }),
        }
    }

    /// Byte length of the map's backing file.
    pub(crate) fn byte_len(&self) -> u32 {
        Bits::byte_len(self.inner.lock().unwrap().bits.bit_count) as u32
    }

    /// Format-time reservation of a sector that is never allocated
    /// dynamically.
    pub(crate) fn mark_used(&self, sector: u32) {
        self.inner.lock().unwrap().bits.set(sector);
    }

    /// Allocates one sector and persists the map.
    pub(crate) fn allocate(&self, fs: &Filesys) -> Result<u32, FsError> {
        let mut state = self.inner.lock().unwrap();
        let sector = state.bits.first_fit().ok_or(FsError::NoSpace)?;
        state.bits.set(sector);
        Self::persist(fs, &state);
        trace!("free map: allocate sector {}", sector);
        Ok(sector)
    }

    /// Returns `sector` to the free pool and persists the map.
    pub(crate) fn release(&self, fs: &Filesys, sector: u32) {
        let mut state = self.inner.lock().unwrap();
        state.bits.clear(sector);
        Self::persist(fs, &state);
        trace!("free map: release sector {}", sector);
    }

    /// Number of in-use sectors.
    pub fn used_count(&self) -> u32 {
        self.inner.lock().unwrap().bits.used_count()
    }

    /// Gives the map its backing inode and writes the current contents out.
    pub(crate) fn attach(&self, fs: &Filesys) {
        let mut state = self.inner.lock().unwrap();
        assert!(state.backing.is_none(), "free map: attached twice");
        state.backing = Some(fs.itable.open(FREE_MAP_SECTOR));
        Self::persist(fs, &state);
        debug!("free map: attached, {} sectors in use", state.bits.used_count());
    }

    /// Replaces the in-memory map with the on-disk copy. For mounting an
    /// existing volume; the map must not be attached yet.
    pub(crate) fn load(&self, fs: &Filesys) {
        let mut state = self.inner.lock().unwrap();
        assert!(state.backing.is_none(), "free map: loaded after attach");
        let backing = fs.itable.open(FREE_MAP_SECTOR);
        let bit_count = state.bits.bit_count;
        let mut bytes = vec![0u8; Bits::byte_len(bit_count)];
        let read = backing.read_at(fs, &mut bytes, 0);
        assert_eq!(read, bytes.len(), "free map: backing file is short");
        state.bits = Bits::from_bytes(&bytes, bit_count);
        state.backing = Some(backing);
        debug!("free map: loaded, {} sectors in use", state.bits.used_count());
    }

    /// Writes the map into its backing file, if it has one yet.
    pub(crate) fn persist_now(&self, fs: &Filesys) {
        let state = self.inner.lock().unwrap();
        Self::persist(fs, &state);
    }

    fn persist(fs: &Filesys, state: &FreeMapState) {
        if let Some(backing) = &state.backing {
            let bytes = state.bits.to_bytes();
            let written = backing.write_at(fs, &bytes, 0);
            assert_eq!(written, bytes.len(), "free map: short write to backing file");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn first_fit_scans_in_order() {
        let mut bits = Bits::new(200);
        assert_eq!(bits.first_fit(), Some(0));
        bits.set(0);
        bits.set(1);
        assert_eq!(bits.first_fit(), Some(2));
        bits.set(2);
        bits.clear(1);
        assert_eq!(bits.first_fit(), Some(1));
    }

    #[test]
    fn exhaustion_returns_none() {
        let mut bits = Bits::new(70);
        for bit in 0..70 {
            assert_eq!(bits.first_fit(), Some(bit));
            bits.set(bit);
        }
        assert_eq!(bits.first_fit(), None);
        assert_eq!(bits.used_count(), 70);
    }

    #[test]
    fn excess_bits_never_allocated() {
        let bits = Bits::new(65);
        assert_eq!(bits.used_count(), 0);
        assert_eq!(bits.words.len(), 2);
        // Word 1 has one real bit; the other 63 must already read as used.
        assert_eq!(bits.words[1], !1u64);
    }

    #[test]
    fn byte_round_trip() {
        let mut bits = Bits::new(100);
        for bit in [0u32, 5, 63, 64, 99].iter() {
            bits.set(*bit);
        }
        let bytes = bits.to_bytes();
        assert_eq!(bytes.len(), 13);
        let back = Bits::from_bytes(&bytes, 100);
        assert_eq!(back.used_count(), 5);
        for bit in 0..100 {
            assert_eq!(bits.get(bit), back.get(bit), "bit {}", bit);
        }
    }
}
