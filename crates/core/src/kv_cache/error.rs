use thiserror::Error;

#[derive(Error, Debug)]
pub enum CacheError {
    #[error("allocation exhausted: requested {requested} slots, available {available}")]
    AllocationExhausted { requested: usize, available: usize },

    #[error("no free request rows: all {capacity} rows in use")]
    NoFreeRows { capacity: usize },

    #[error("context overflow on row {row}: {needed} tokens exceed max context {max_context}")]
    ContextOverflow {
        row: usize,
        needed: usize,
        max_context: usize,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_display_allocation_exhausted() {
        let e = CacheError::AllocationExhausted {
            requested: 10,
            available: 3,
        };
        assert_eq!(
            e.to_string(),
            "allocation exhausted: requested 10 slots, available 3"
        );
    }

    #[test]
    fn error_display_no_free_rows() {
        let e = CacheError::NoFreeRows { capacity: 8 };
        assert_eq!(e.to_string(), "no free request rows: all 8 rows in use");
    }

    #[test]
    fn error_display_context_overflow() {
        let e = CacheError::ContextOverflow {
            row: 2,
            needed: 4096,
            max_context: 2048,
        };
        assert_eq!(
            e.to_string(),
            "context overflow on row 2: 4096 tokens exceed max context 2048"
        );
    }
}
