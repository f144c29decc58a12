use tracing::debug;

use super::error::CacheError;

pub type SlotId = usize;

/// Reference-counted allocator over the KV-cache token slots. Pure
/// bookkeeping; the tensors behind each slot belong to the attention
/// collaborator.
///
/// A slot is free iff its reference count is zero. The pool never evicts on
/// its own: `dec_ref` is the callback surface an eviction policy drives.
pub struct TokenSlotPool {
    capacity: usize,
    ref_counts: Vec<u32>,
    free_count: usize,
}

impl TokenSlotPool {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity,
            ref_counts: vec![0; capacity],
            free_count: capacity,
        }
    }

    /// Allocate `n` distinct free slots, lowest ids first. No partial
    /// allocation: either all `n` or an error.
    pub fn alloc(&mut self, n: usize) -> Result<Vec<SlotId>, CacheError> {
        if n > self.free_count {
            debug!(
                requested = n,
                available = self.free_count,
                "slot allocation failed"
            );
            return Err(CacheError::AllocationExhausted {
                requested: n,
                available: self.free_count,
            });
        }
        let mut slots = Vec::with_capacity(n);
        for (id, count) in self.ref_counts.iter_mut().enumerate() {
            if *count == 0 {
                *count = 1;
                slots.push(id);
                if slots.len() == n {
                    break;
                }
            }
        }
        self.free_count -= n;
        Ok(slots)
    }

    /// Probe for a contiguous run of `n` free slots, the decode fast path.
    ///
    /// Returns the slot ids plus the `[start, end)` bounds. `None` means no
    /// such run exists right now; a scattered `alloc` may still succeed, so
    /// absence of a run is not an exhaustion signal.
    pub fn alloc_contiguous(&mut self, n: usize) -> Option<(Vec<SlotId>, SlotId, SlotId)> {
        if n == 0 || n > self.free_count {
            return None;
        }
        let mut run_start = 0;
        let mut run_len = 0;
        for id in 0..self.capacity {
            if self.ref_counts[id] == 0 {
                if run_len == 0 {
                    run_start = id;
                }
                run_len += 1;
                if run_len == n {
                    for count in &mut self.ref_counts[run_start..=id] {
                        *count = 1;
                    }
                    self.free_count -= n;
                    return Some(((run_start..=id).collect(), run_start, id + 1));
                }
            } else {
                run_len = 0;
            }
        }
        None
    }

    /// Decrement reference counts; slots reaching zero become free. Returns
    /// how many slots were freed (callers batch several owners' releases and
    /// only some slots hit zero).
    pub fn dec_ref(&mut self, slots: &[SlotId]) -> usize {
        let mut freed = 0;
        for &slot in slots {
            debug_assert!(self.ref_counts[slot] > 0, "dec_ref on free slot {slot}");
            self.ref_counts[slot] -= 1;
            if self.ref_counts[slot] == 0 {
                freed += 1;
            }
        }
        self.free_count += freed;
        freed
    }

    pub fn available_size(&self) -> usize {
        self.free_count
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Drop every reference count back to zero. Reset hook: all requests and
    /// the prefix cache must have released their slots already.
    pub fn clear(&mut self) {
        self.ref_counts.fill(0);
        self.free_count = self.capacity;
    }

    #[cfg(test)]
    pub fn ref_count(&self, slot: SlotId) -> u32 {
        self.ref_counts[slot]
    }

    #[cfg(test)]
    pub fn num_allocated(&self) -> usize {
        self.ref_counts.iter().filter(|&&c| c > 0).count()
    }
}
