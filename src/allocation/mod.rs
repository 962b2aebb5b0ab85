//! Contract-net task allocation: bidding, awards, and fallbacks.

pub mod allocator;
pub mod types;

pub use allocator::TaskAllocator;
pub use types::{AllocationOutcome, TaskBid, TaskId, TaskSpec};
