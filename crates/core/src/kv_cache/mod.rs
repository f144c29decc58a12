mod error;
mod radix_cache;
mod slot_table;
mod token_pool;

pub use error::CacheError;
pub use radix_cache::{NodeId, RadixCache};
pub use slot_table::{ReqSlotTable, RowId, NULL_SLOT};
pub use token_pool::{SlotId, TokenSlotPool};
