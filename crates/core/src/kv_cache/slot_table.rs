use super::error::CacheError;
use super::token_pool::SlotId;

pub type RowId = usize;

/// Sentinel for an unwritten table cell.
pub const NULL_SLOT: SlotId = SlotId::MAX;

/// Fixed-capacity table mapping each active request to one pool slot per
/// token position: `max_requests` rows by `max_context_len` columns.
///
/// A row is exclusively owned by one request from admission until finish or
/// retraction. The table stores slot ids only; reference counts live in the
/// pool.
pub struct ReqSlotTable {
    max_requests: usize,
    max_context_len: usize,
    cells: Vec<SlotId>,
    free_rows: Vec<RowId>,
    occupied: Vec<bool>,
}

impl ReqSlotTable {
    pub fn new(max_requests: usize, max_context_len: usize) -> Self {
        // LIFO: push high ids first so that pop hands out low ids first.
        let free_rows: Vec<RowId> = (0..max_requests).rev().collect();
        Self {
            max_requests,
            max_context_len,
            cells: vec![NULL_SLOT; max_requests * max_context_len],
            free_rows,
            occupied: vec![false; max_requests],
        }
    }

    /// Acquire `n` rows at once. No partial acquisition: either all `n` or
    /// an error, so a failed batch admission leaves the table untouched.
    pub fn alloc_rows(&mut self, n: usize) -> Result<Vec<RowId>, CacheError> {
        if n > self.free_rows.len() {
            return Err(CacheError::NoFreeRows {
                capacity: self.max_requests,
            });
        }
        let mut rows = Vec::with_capacity(n);
        for _ in 0..n {
            let row = self.free_rows.pop().expect("checked above");
            self.occupied[row] = true;
            rows.push(row);
        }
        Ok(rows)
    }

    /// Write a run of slot ids starting at `start_pos` in `row`.
    pub fn write_slots(
        &mut self,
        row: RowId,
        start_pos: usize,
        slots: &[SlotId],
    ) -> Result<(), CacheError> {
        assert!(self.occupied[row], "write to unoccupied row {row}");
        let end = start_pos + slots.len();
        if end > self.max_context_len {
            return Err(CacheError::ContextOverflow {
                row,
                needed: end,
                max_context: self.max_context_len,
            });
        }
        let base = row * self.max_context_len;
        self.cells[base + start_pos..base + end].copy_from_slice(slots);
        Ok(())
    }

    /// Write one slot id, the per-step decode case.
    pub fn write_slot(&mut self, row: RowId, pos: usize, slot: SlotId) -> Result<(), CacheError> {
        self.write_slots(row, pos, &[slot])
    }

    /// The first `len` slot ids of `row`.
    pub fn row_slots(&self, row: RowId, len: usize) -> &[SlotId] {
        assert!(self.occupied[row], "read from unoccupied row {row}");
        assert!(len <= self.max_context_len);
        let base = row * self.max_context_len;
        &self.cells[base..base + len]
    }

    /// Release a row back to the table. Slot reference counts are the
    /// caller's responsibility; the cells are wiped to `NULL_SLOT` so stale
    /// reads fail loudly.
    pub fn free_row(&mut self, row: RowId) {
        assert!(self.occupied[row], "double free of row {row}");
        self.occupied[row] = false;
        let base = row * self.max_context_len;
        self.cells[base..base + self.max_context_len].fill(NULL_SLOT);
        self.free_rows.push(row);
    }

    pub fn available_rows(&self) -> usize {
        self.free_rows.len()
    }

    pub fn max_requests(&self) -> usize {
        self.max_requests
    }

    pub fn max_context_len(&self) -> usize {
        self.max_context_len
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn new_has_all_rows_free() {
        let table = ReqSlotTable::new(8, 128);
        assert_eq!(table.available_rows(), 8);
    }

    #[test]
    fn alloc_rows_is_atomic() {
        let mut table = ReqSlotTable::new(4, 16);
        table.alloc_rows(3).unwrap();
        let result = table.alloc_rows(2);
        match result.unwrap_err() {
            CacheError::NoFreeRows { capacity } => assert_eq!(capacity, 4),
            other => panic!("wrong error variant: {other}"),
        }
        // The failed call took nothing.
        assert_eq!(table.available_rows(), 1);
    }

    #[test]
    fn write_and_read_slots() {
        let mut table = ReqSlotTable::new(2, 16);
        let rows = table.alloc_rows(1).unwrap();
        table.write_slots(rows[0], 0, &[10, 11, 12]).unwrap();
        table.write_slot(rows[0], 3, 99).unwrap();
        assert_eq!(table.row_slots(rows[0], 4), &[10, 11, 12, 99]);
    }

    #[test]
    fn write_past_context_len_errors() {
        let mut table = ReqSlotTable::new(2, 4);
        let rows = table.alloc_rows(1).unwrap();
        let result = table.write_slots(rows[0], 2, &[1, 2, 3]);
        match result.unwrap_err() {
            CacheError::ContextOverflow {
                needed,
                max_context,
                ..
            } => {
                assert_eq!(needed, 5);
                assert_eq!(max_context, 4);
            }
            other => panic!("wrong error variant: {other}"),
        }
    }

    #[test]
    fn free_row_wipes_cells() {
        let mut table = ReqSlotTable::new(2, 8);
        let rows = table.alloc_rows(1).unwrap();
        let row = rows[0];
        table.write_slots(row, 0, &[5, 6, 7]).unwrap();
        table.free_row(row);
        assert_eq!(table.available_rows(), 2);

        // Re-acquire the same row: old contents are gone.
        let rows = table.alloc_rows(2).unwrap();
        let reused = rows.into_iter().find(|&r| r == row).unwrap();
        assert_eq!(table.row_slots(reused, 3), &[NULL_SLOT; 3]);
    }

    #[test]
    #[should_panic(expected = "double free")]
    fn double_free_panics() {
        let mut table = ReqSlotTable::new(2, 8);
        let rows = table.alloc_rows(1).unwrap();
        table.free_row(rows[0]);
        table.free_row(rows[0]);
    }
}
