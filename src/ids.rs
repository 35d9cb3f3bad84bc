//! Fixed-size bitmap id allocators.
//!
//! The kernel source backing this spec uses `DECLARE_BITMAP` for IPCP ids
//! (256), port ids and CEP ids (65536 each) and a "find first zero bit"
//! allocation policy. `IdBitmap` reproduces that behavior with a `Vec<u64>`
//! word array instead of a fixed kernel bitmap, since user space has no
//! static allocation constraint to exploit.

use crate::error::{Error, Result};

/// A fixed-capacity bitmap allocator handing out ids in `0..capacity`.
#[derive(Debug)]
pub struct IdBitmap {
    words: Vec<u64>,
    capacity: usize,
}

impl IdBitmap {
    /// Standard capacity for the IPCP id bitmap (§3).
    pub const IPCP_CAPACITY: usize = 256;
    /// Standard capacity for the port id and CEP id bitmaps (§3).
    pub const PORT_CAPACITY: usize = 65536;

    pub fn new(capacity: usize) -> Self {
        Self {
            words: vec![0u64; capacity.saturating_add(63) / 64],
            capacity,
        }
    }

    /// Allocates and returns the first clear bit, setting it. Fails with
    /// `Error::NoSpace` if the bitmap is full.
    pub fn alloc(&mut self) -> Result<u32> {
        for (word_idx, word) in self.words.iter_mut().enumerate() {
            if *word != u64::MAX {
                let bit = (!*word).trailing_zeros();
                let id = word_idx * 64 + bit as usize;
                if id >= self.capacity {
                    break;
                }
                *word |= 1 << bit;
                return Ok(id as u32);
            }
        }
        Err(Error::NoSpace(format!(
            "id bitmap exhausted (capacity {})",
            self.capacity
        )))
    }

    /// Clears a previously allocated id. Idempotent if already clear.
    pub fn free(&mut self, id: u32) {
        let id = id as usize;
        if id >= self.capacity {
            return;
        }
        self.words[id / 64] &= !(1 << (id % 64));
    }

    /// True iff `id` is currently allocated.
    pub fn is_set(&self, id: u32) -> bool {
        let id = id as usize;
        id < self.capacity && (self.words[id / 64] & (1 << (id % 64))) != 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn allocates_in_order_and_reuses_freed_ids() {
        let mut bm = IdBitmap::new(4);
        assert_eq!(bm.alloc().unwrap(), 0);
        assert_eq!(bm.alloc().unwrap(), 1);
        bm.free(0);
        assert_eq!(bm.alloc().unwrap(), 0);
        assert_eq!(bm.alloc().unwrap(), 2);
        assert_eq!(bm.alloc().unwrap(), 3);
        assert!(bm.alloc().is_err());
    }

    #[test]
    fn exhaustion_does_not_corrupt_state() {
        let mut bm = IdBitmap::new(2);
        let _a = bm.alloc().unwrap();
        let _b = bm.alloc().unwrap();
        assert!(matches!(bm.alloc(), Err(Error::NoSpace(_))));
        bm.free(_a);
        assert_eq!(bm.alloc().unwrap(), _a);
    }

    #[test]
    fn ipcp_bitmap_257th_create_fails() {
        let mut bm = IdBitmap::new(IdBitmap::IPCP_CAPACITY);
        for i in 0..256 {
            assert_eq!(bm.alloc().unwrap(), i);
        }
        assert!(matches!(bm.alloc(), Err(Error::NoSpace(_))));
    }
}
