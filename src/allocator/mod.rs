//! Transaction identifier allocation.
//!
//! - [`IdAllocator`] - range-set recycler of 16-bit ids
//! - [`BoundedIdAllocator`] - caps active ids, waits instead of failing
//! - [`IdLease`] - RAII id that frees itself on drop

mod bounded;
mod range_set;

pub use bounded::{BoundedIdAllocator, IdLease};
pub use range_set::{IdAllocator, IdRange, ID_SPACE};
