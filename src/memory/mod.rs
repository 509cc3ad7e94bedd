//! Hierarchical memory management (§4.A): parent-owned blocks allocated from
//! one of four heap kinds, with quota enforcement and destructor chains.

mod block;
mod heap;

pub use block::{BlockId, DestructorOutcome, Mpr};
pub use heap::{HeapConfig, HeapKindSpec, REGION_DOUBLING_CAP};
